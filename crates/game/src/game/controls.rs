use serde::{Deserialize, Serialize};

use crate::net::{ProtocolError, WireReader, WireWriter};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Control {
    Thrust,
    Left,
    Right,
    Fire1,
    Fire2,
    Extra,
}

impl Control {
    pub const ALL: [Control; 6] = [
        Control::Thrust,
        Control::Left,
        Control::Right,
        Control::Fire1,
        Control::Fire2,
        Control::Extra,
    ];

    pub fn index(self) -> usize {
        self as usize
    }
}

/// How hard a control is pressed and whether it was tapped this frame.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct ControlState {
    /// In `[0, 1]`.
    pub force: f32,
    pub pulse: bool,
}

impl ControlState {
    pub fn new(force: f32, pulse: bool) -> Self {
        Self {
            force: force.clamp(0.0, 1.0),
            pulse,
        }
    }

    pub fn is_active(&self) -> bool {
        self.force > 0.0 || self.pulse
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Controls {
    states: [ControlState; 6],
}

impl Controls {
    pub fn get(&self, control: Control) -> ControlState {
        self.states[control.index()]
    }

    pub fn set(&mut self, control: Control, state: ControlState) {
        self.states[control.index()] = state;
    }

    pub fn with(mut self, control: Control, state: ControlState) -> Self {
        self.set(control, state);
        self
    }

    pub fn thrust(&self) -> f32 {
        self.get(Control::Thrust).force
    }

    /// Net turn input, positive to the left.
    pub fn turn(&self) -> f32 {
        self.get(Control::Left).force - self.get(Control::Right).force
    }

    /// Clears pulses after they have been consumed for one frame.
    pub fn clear_pulses(&mut self) {
        for state in &mut self.states {
            state.pulse = false;
        }
    }

    pub fn encode(&self, writer: &mut WireWriter) {
        for state in &self.states {
            writer.put_force(state.force);
            writer.put_bool(state.pulse);
        }
    }

    pub fn decode(reader: &mut WireReader<'_>) -> Result<Self, ProtocolError> {
        let mut controls = Self::default();
        for state in &mut controls.states {
            state.force = reader.get_force()?;
            state.pulse = reader.get_bool()?;
        }
        Ok(controls)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_turn_is_left_minus_right() {
        let controls = Controls::default()
            .with(Control::Left, ControlState::new(1.0, false))
            .with(Control::Right, ControlState::new(0.25, false));
        assert_eq!(controls.turn(), 0.75);
        assert_eq!(controls.thrust(), 0.0);
    }

    #[test]
    fn test_force_is_clamped() {
        assert_eq!(ControlState::new(3.0, false).force, 1.0);
        assert!(!ControlState::new(-1.0, false).is_active());
    }

    #[test]
    fn test_controls_encode_size() {
        let mut writer = WireWriter::new();
        Controls::default().encode(&mut writer);
        assert_eq!(writer.len(), 18);
    }
}
