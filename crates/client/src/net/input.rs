use skirmish::{Control, ControlState, Controls};

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct InputState {
    pub thrust: f32,
    /// Positive turns left, negative right.
    pub turn: f32,
    pub fire1: bool,
    pub fire2: bool,
    pub extra: bool,
}

impl InputState {
    pub fn to_controls(&self) -> Controls {
        let mut controls = Controls::default();
        controls.set(Control::Thrust, ControlState::new(self.thrust, false));
        if self.turn > 0.0 {
            controls.set(Control::Left, ControlState::new(self.turn, false));
        } else if self.turn < 0.0 {
            controls.set(Control::Right, ControlState::new(-self.turn, false));
        }
        if self.fire1 {
            controls.set(Control::Fire1, ControlState::new(1.0, true));
        }
        if self.fire2 {
            controls.set(Control::Fire2, ControlState::new(1.0, true));
        }
        if self.extra {
            controls.set(Control::Extra, ControlState::new(1.0, true));
        }
        controls
    }
}

/// A looping list of inputs, each held for a number of frames.
#[derive(Debug, Clone)]
pub struct ScriptedInput {
    steps: Vec<(u32, InputState)>,
    period: u32,
}

impl ScriptedInput {
    pub fn new(steps: Vec<(u32, InputState)>) -> Self {
        let period = steps.iter().map(|(frames, _)| *frames).sum();
        Self { steps, period }
    }

    /// Flies a lazy figure of eight with the odd shot.
    pub fn patrol() -> Self {
        let thrust = InputState {
            thrust: 1.0,
            ..Default::default()
        };
        Self::new(vec![
            (90, thrust),
            (60, InputState { turn: 1.0, ..thrust }),
            (1, InputState { fire1: true, ..thrust }),
            (90, thrust),
            (60, InputState { turn: -1.0, ..thrust }),
            (30, InputState::default()),
        ])
    }

    pub fn at(&self, frame: u32) -> InputState {
        if self.period == 0 {
            return InputState::default();
        }
        let mut offset = frame % self.period;
        for (frames, input) in &self.steps {
            if offset < *frames {
                return *input;
            }
            offset -= frames;
        }
        InputState::default()
    }
}
