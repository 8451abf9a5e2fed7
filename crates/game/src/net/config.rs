use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::protocol::DEFAULT_FRAME_RATE;

/// Timing and tolerance settings shared by both session roles.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetConfig {
    pub handshake_timeout_ms: u64,
    pub handshake_retry_ms: u64,
    pub ping_interval_ms: u64,
    /// Unanswered pings after which a peer counts as silently dead.
    pub max_missed_pings: usize,
    pub rtt_window: usize,
    /// Consecutive ports probed above the peer's reported UDP port.
    pub nat_probe_ports: u16,
    pub max_protocol_errors: u32,
    pub frame_rate: u32,
}

impl Default for NetConfig {
    fn default() -> Self {
        Self {
            handshake_timeout_ms: 10_000,
            handshake_retry_ms: 500,
            ping_interval_ms: 1_000,
            max_missed_pings: 10,
            rtt_window: 8,
            nat_probe_ports: 4,
            max_protocol_errors: 3,
            frame_rate: DEFAULT_FRAME_RATE,
        }
    }
}

impl NetConfig {
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn handshake_retry(&self) -> Duration {
        Duration::from_millis(self.handshake_retry_ms)
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.ping_interval_ms)
    }

    pub fn frame_duration(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.frame_rate.max(1) as f64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = NetConfig::default();
        assert_eq!(config.handshake_timeout(), Duration::from_secs(10));
        assert_eq!(config.handshake_retry(), Duration::from_millis(500));
        assert_eq!(config.max_protocol_errors, 3);
        assert!((config.frame_duration().as_secs_f64() - 1.0 / 60.0).abs() < 1e-9);
    }
}
