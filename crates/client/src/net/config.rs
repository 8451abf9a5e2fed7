use std::net::SocketAddr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use skirmish::{NetConfig, ShipPhysics, DEFAULT_FRAME_RATE, DEFAULT_PORT};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PredictionConfig {
    /// How far back the ship location history reaches.
    pub retention_ms: u64,
    pub tick_rate: u32,
    pub physics: ShipPhysics,
}

impl Default for PredictionConfig {
    fn default() -> Self {
        Self {
            retention_ms: 2_000,
            tick_rate: DEFAULT_FRAME_RATE,
            physics: ShipPhysics::default(),
        }
    }
}

impl PredictionConfig {
    pub fn retention(&self) -> Duration {
        Duration::from_millis(self.retention_ms)
    }

    pub fn tick(&self) -> Duration {
        Duration::from_secs_f64(1.0 / f64::from(self.tick_rate.max(1)))
    }
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Tried in parallel; the first to answer wins.
    pub servers: Vec<SocketAddr>,
    pub udp_bind: SocketAddr,
    pub player_name: String,
    pub ship: String,
    pub weapon: String,
    /// Stop after this many seconds of play, or run until interrupted.
    pub duration_secs: Option<u64>,
    pub net: NetConfig,
    pub prediction: PredictionConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            servers: vec![SocketAddr::from(([127, 0, 0, 1], DEFAULT_PORT))],
            udp_bind: SocketAddr::from(([0, 0, 0, 0], 0)),
            player_name: "pilot".into(),
            ship: "windlord".into(),
            weapon: "bazooka".into(),
            duration_secs: None,
            net: NetConfig::default(),
            prediction: PredictionConfig::default(),
        }
    }
}

impl ClientConfig {
    pub fn tick(&self) -> Duration {
        self.prediction.tick()
    }
}
