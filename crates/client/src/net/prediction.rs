use std::collections::VecDeque;
use std::f32::consts::{PI, TAU};
use std::time::Duration;

use glam::Vec2;
use thiserror::Error;

use skirmish::{Controls, ShipPhysics};

use super::config::PredictionConfig;

#[derive(Debug, Error, PartialEq)]
pub enum HistoryError {
    #[error("entry at {time:?} is not newer than the stored entry at {latest:?}")]
    OutOfOrder { time: Duration, latest: Duration },
    #[error("entry at {time:?} is not older than the live ship at {live:?}")]
    FromFuture { time: Duration, live: Duration },
}

/// Where the ship was at one moment, and what the player was pressing.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ShipLocationEntry {
    /// Game time since the session started.
    pub time: Duration,
    pub position: Vec2,
    pub velocity: Vec2,
    pub rotation: f32,
    pub controls: Option<Controls>,
}

impl ShipLocationEntry {
    pub fn new(time: Duration, position: Vec2, velocity: Vec2, rotation: f32) -> Self {
        Self {
            time,
            position,
            velocity,
            rotation: rotation.rem_euclid(TAU),
            controls: None,
        }
    }

    pub fn with_controls(mut self, controls: Controls) -> Self {
        self.controls = Some(controls);
        self
    }

    fn turn_rate(&self, physics: &ShipPhysics) -> f32 {
        self.controls
            .as_ref()
            .map_or(0.0, |controls| physics.turn_rate(controls))
    }
}

/// Kinematic change produced by one tick of control input.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Correction {
    rotation: f32,
    velocity: Vec2,
    position: Vec2,
}

/// Motion history of the locally controlled ship.
///
/// The newest entry is the live ship itself, so the history is never empty
/// and its owner moves the ship through [`live_mut`](Self::live_mut). Older
/// snapshots are kept strictly increasing in time, all before the live
/// ship, and pruned to the retention window.
pub struct ShipLocationHistory {
    config: PredictionConfig,
    past: VecDeque<ShipLocationEntry>,
    live: ShipLocationEntry,
}

impl ShipLocationHistory {
    pub fn new(config: PredictionConfig, live: ShipLocationEntry) -> Self {
        Self {
            config,
            past: VecDeque::new(),
            live,
        }
    }

    pub fn config(&self) -> &PredictionConfig {
        &self.config
    }

    /// Number of entries, the live ship included.
    pub fn len(&self) -> usize {
        self.past.len() + 1
    }

    pub fn live(&self) -> &ShipLocationEntry {
        &self.live
    }

    pub fn live_mut(&mut self) -> &mut ShipLocationEntry {
        &mut self.live
    }

    /// Oldest first, ending with the live ship.
    pub fn entries(&self) -> impl Iterator<Item = &ShipLocationEntry> {
        self.past.iter().chain(std::iter::once(&self.live))
    }

    /// Stores a snapshot from the past.
    pub fn add(&mut self, entry: ShipLocationEntry) -> Result<(), HistoryError> {
        if let Some(latest) = self.past.back() {
            if entry.time <= latest.time {
                return Err(HistoryError::OutOfOrder {
                    time: entry.time,
                    latest: latest.time,
                });
            }
        }
        if entry.time >= self.live.time {
            return Err(HistoryError::FromFuture {
                time: entry.time,
                live: self.live.time,
            });
        }

        self.past.push_back(entry);
        self.prune();
        Ok(())
    }

    /// Forgets every snapshot. The live ship stays.
    pub fn clear(&mut self) {
        self.past.clear();
    }

    fn prune(&mut self) {
        let horizon = self.live.time.saturating_sub(self.config.retention());
        while self.past.front().is_some_and(|entry| entry.time < horizon) {
            self.past.pop_front();
        }
    }

    fn get(&self, index: usize) -> &ShipLocationEntry {
        self.past.get(index).unwrap_or(&self.live)
    }

    fn get_mut(&mut self, index: usize) -> &mut ShipLocationEntry {
        match self.past.get_mut(index) {
            Some(entry) => entry,
            None => &mut self.live,
        }
    }

    /// Index of the newest entry at or before `time`.
    fn index_at(&self, time: Duration) -> Option<usize> {
        if self.live.time <= time {
            return Some(self.past.len());
        }
        self.past.iter().rposition(|entry| entry.time <= time)
    }

    /// Applies inputs that the server saw at `time` to the entry they belong
    /// to and carries the same change onto every newer entry.
    ///
    /// Returns false when no entry is old enough or the inputs land on the
    /// live ship, where they cannot be used yet.
    pub fn store_control_states(&mut self, controls: Controls, time: Duration) -> bool {
        let Some(target) = time.checked_sub(self.config.tick() / 2) else {
            return false;
        };
        let Some(index) = self.index_at(target) else {
            return false;
        };
        if index == self.past.len() {
            return false;
        }

        let physics = self.config.physics;
        let tick = self.config.tick().as_secs_f32();
        let corrected = &mut self.past[index];
        let rotation = physics.turn_rate(&controls) * tick;
        let velocity = physics.acceleration(&controls, corrected.rotation + rotation) * tick;
        let correction = Correction {
            rotation,
            velocity,
            position: velocity * tick,
        };
        corrected.controls = Some(controls);

        let newer = self.past.iter_mut().skip(index).chain(std::iter::once(&mut self.live));
        for entry in newer {
            entry.rotation = (entry.rotation + correction.rotation).rem_euclid(TAU);
            entry.velocity += correction.velocity;
            entry.position += correction.position;
        }
        self.past.drain(..index);
        true
    }

    /// Takes an authoritative rotation from the past and replays the stored
    /// turn inputs on top of it. Positions stay as they are.
    pub fn update_old_ship_location(&mut self, time: Duration, rotation: f32) -> bool {
        let Some(index) = self.index_at(time) else {
            return false;
        };
        let physics = self.config.physics;
        self.get_mut(index).rotation = rotation.rem_euclid(TAU);

        for i in index + 1..self.len() {
            let previous = *self.get(i - 1);
            let entry = self.get_mut(i);
            let elapsed = (entry.time - previous.time).as_secs_f32();
            entry.rotation = (previous.rotation + previous.turn_rate(&physics) * elapsed).rem_euclid(TAU);
        }
        true
    }

    /// Best guess of the ship's state at `time`.
    pub fn get_ship_location(&self, time: Duration) -> ShipLocationEntry {
        let live = self.live;
        if time >= live.time {
            let elapsed = (time - live.time).as_secs_f32();
            return ShipLocationEntry {
                time,
                position: live.position + live.velocity * elapsed,
                rotation: (live.rotation + live.turn_rate(&self.config.physics) * elapsed).rem_euclid(TAU),
                ..live
            };
        }

        let Some(index) = self.index_at(time) else {
            return *self.get(0);
        };
        let before = *self.get(index);
        let after = *self.get(index + 1);
        let span = (after.time - before.time).as_secs_f32();
        let t = if span > 0.0 {
            (time - before.time).as_secs_f32() / span
        } else {
            0.0
        };

        ShipLocationEntry {
            time,
            position: before.position.lerp(after.position, t),
            velocity: before.velocity.lerp(after.velocity, t),
            rotation: lerp_angle(before.rotation, after.rotation, t),
            controls: before.controls,
        }
    }
}

/// Interpolates along the shorter arc between two angles.
fn lerp_angle(from: f32, to: f32, t: f32) -> f32 {
    let mut delta = (to - from).rem_euclid(TAU);
    if delta > PI {
        delta -= TAU;
    }
    (from + delta * t).rem_euclid(TAU)
}
