use std::collections::VecDeque;
use std::time::{Duration, Instant};

use super::config::NetConfig;
use super::messages::{Ping, PingReply};

/// Round-trip and game time tracking for one peer.
#[derive(Debug)]
pub struct PingInfo {
    epoch: Instant,
    samples: VecDeque<Duration>,
    window: usize,
    interval: Duration,
    last_sent: Option<Instant>,
    outstanding: usize,
    max_missed: usize,
    /// Estimated remote frame minus local frame.
    remote_frame_offset: i64,
    has_offset: bool,
    frame_rate: u32,
}

impl PingInfo {
    pub fn new(config: &NetConfig, now: Instant) -> Self {
        Self {
            epoch: now,
            samples: VecDeque::with_capacity(config.rtt_window),
            window: config.rtt_window.max(1),
            interval: config.ping_interval(),
            last_sent: None,
            outstanding: 0,
            max_missed: config.max_missed_pings,
            remote_frame_offset: 0,
            has_offset: false,
            frame_rate: config.frame_rate.max(1),
        }
    }

    fn millis_since_epoch(&self, now: Instant) -> u32 {
        now.saturating_duration_since(self.epoch).as_millis() as u32
    }

    pub fn is_due(&self, now: Instant) -> bool {
        self.last_sent
            .is_none_or(|sent| now.saturating_duration_since(sent) >= self.interval)
    }

    pub fn make_ping(&mut self, now: Instant, local_frame: u32) -> Ping {
        self.last_sent = Some(now);
        self.outstanding += 1;
        Ping {
            sent_at_ms: self.millis_since_epoch(now),
            frame_number: local_frame,
        }
    }

    pub fn reply_to(ping: &Ping, local_frame: u32) -> PingReply {
        PingReply {
            sent_at_ms: ping.sent_at_ms,
            frame_number: local_frame,
        }
    }

    pub fn on_reply(&mut self, reply: &PingReply, now: Instant, local_frame: u32) {
        let now_ms = self.millis_since_epoch(now);
        let rtt = Duration::from_millis(now_ms.wrapping_sub(reply.sent_at_ms) as u64);

        if self.samples.len() >= self.window {
            self.samples.pop_front();
        }
        self.samples.push_back(rtt);
        self.outstanding = 0;

        // The reply was stamped half a round trip ago.
        let half_trip_frames = (rtt.as_secs_f64() / 2.0 * self.frame_rate as f64).round() as i64;
        let remote_now = reply.frame_number as i64 + half_trip_frames;
        self.remote_frame_offset = remote_now - local_frame as i64;
        self.has_offset = true;
    }

    /// Mean round-trip time over the sample window.
    pub fn ping_time(&self) -> Duration {
        if self.samples.is_empty() {
            return Duration::ZERO;
        }
        self.samples.iter().sum::<Duration>() / self.samples.len() as u32
    }

    /// One-way latency estimate.
    pub fn lag(&self) -> Duration {
        self.ping_time() / 2
    }

    pub fn sample_count(&self) -> usize {
        self.samples.len()
    }

    pub fn outstanding(&self) -> usize {
        self.outstanding
    }

    pub fn is_silently_dead(&self) -> bool {
        self.outstanding >= self.max_missed
    }

    pub fn has_time_sync(&self) -> bool {
        self.has_offset
    }

    pub fn remote_frame_offset(&self) -> i64 {
        self.remote_frame_offset
    }

    /// How many frames old a message stamped with `message_frame` is.
    pub fn frames_ago(&self, message_frame: u32, local_frame: u32) -> f32 {
        let remote_now = local_frame as i64 + self.remote_frame_offset;
        (remote_now - message_frame as i64).max(0) as f32
    }

    pub fn frames_to_duration(&self, frames: f32) -> Duration {
        Duration::from_secs_f32(frames.max(0.0) / self.frame_rate as f32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> NetConfig {
        NetConfig {
            max_missed_pings: 3,
            rtt_window: 2,
            ..NetConfig::default()
        }
    }

    #[test]
    fn test_rtt_window_average() {
        let start = Instant::now();
        let mut info = PingInfo::new(&config(), start);

        for (sent, replied) in [(0u64, 100u64), (1000, 1040), (2000, 2060)] {
            let ping = info.make_ping(start + Duration::from_millis(sent), 0);
            let reply = PingInfo::reply_to(&ping, 0);
            info.on_reply(&reply, start + Duration::from_millis(replied), 0);
        }

        assert_eq!(info.sample_count(), 2);
        assert_eq!(info.ping_time(), Duration::from_millis(50));
        assert_eq!(info.lag(), Duration::from_millis(25));
    }

    #[test]
    fn test_missed_pings_mark_peer_dead() {
        let start = Instant::now();
        let mut info = PingInfo::new(&config(), start);
        assert!(info.is_due(start));

        for i in 0..3 {
            let now = start + Duration::from_secs(i);
            assert!(info.is_due(now));
            info.make_ping(now, 0);
            assert!(!info.is_due(now + Duration::from_millis(10)));
        }
        assert!(info.is_silently_dead());

        let reply = PingReply {
            sent_at_ms: 2000,
            frame_number: 0,
        };
        info.on_reply(&reply, start + Duration::from_millis(2010), 0);
        assert!(!info.is_silently_dead());
    }

    #[test]
    fn test_frames_ago_uses_remote_offset() {
        let start = Instant::now();
        let mut info = PingInfo::new(&config(), start);
        assert_eq!(info.frames_ago(90, 100), 10.0);

        // Remote is 500 frames ahead; 100 ms round trip is 3 frames each way.
        let ping = info.make_ping(start, 100);
        let reply = PingInfo::reply_to(&ping, 597);
        info.on_reply(&reply, start + Duration::from_millis(100), 106);

        assert_eq!(info.remote_frame_offset(), 494);
        assert_eq!(info.frames_ago(590, 106), 10.0);
        assert_eq!(info.frames_ago(700, 106), 0.0);
        assert_eq!(info.frames_to_duration(30.0), Duration::from_millis(500));
    }
}
