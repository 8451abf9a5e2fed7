use std::net::SocketAddr;
use std::time::Duration;

use skirmish::{NetConfig, ShipPhysics, DEFAULT_FRAME_RATE, DEFAULT_PORT};

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind: SocketAddr,
    pub tick_rate: u32,
    pub max_clients: usize,
    pub arena_playlist: Vec<String>,
    pub time_limit_secs: u16,
    /// Pause between one arena finishing and the next starting.
    pub intermission_secs: u32,
    pub wall_count: u16,
    /// Side length of the square play area; ships wrap around its edges.
    pub arena_size: f32,
    /// Frames between player score broadcasts.
    pub player_update_interval: u32,
    pub net: NetConfig,
    pub physics: ShipPhysics,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT)),
            tick_rate: DEFAULT_FRAME_RATE,
            max_clients: 16,
            arena_playlist: vec!["Eris".into(), "Amazonas".into(), "Blood Bowl".into()],
            time_limit_secs: 180,
            intermission_secs: 5,
            wall_count: 24,
            arena_size: 2000.0,
            player_update_interval: DEFAULT_FRAME_RATE,
            net: NetConfig::default(),
            physics: ShipPhysics::default(),
        }
    }
}

impl ServerConfig {
    pub fn tick_duration(&self) -> Duration {
        Duration::from_secs_f64(1.0 / f64::from(self.tick_rate.max(1)))
    }
}
