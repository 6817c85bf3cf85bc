//! Environments an agent steps through

/// Result of applying one action
#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub observation: Vec<f32>,
    pub reward: f32,
    pub done: bool,
}

/// Something an agent can reset and step
pub trait Environment: Send {
    /// Start a new episode and return its first observation
    fn reset(&mut self) -> Vec<f32>;

    /// Apply `action` and report what happened
    fn step(&mut self, action: u32) -> Transition;
}

/// One-dimensional corridor with the goal at the far end
///
/// Action 0 moves back, action 1 stays, anything else moves forward. Each
/// step costs 0.1; reaching the goal pays 1.0 and ends the episode.
#[derive(Debug, Clone)]
pub struct Corridor {
    length: u32,
    position: u32,
}

impl Corridor {
    pub const STEP_COST: f32 = -0.1;
    pub const GOAL_REWARD: f32 = 1.0;

    pub fn new(length: u32) -> Self {
        Self {
            length: length.max(1),
            position: 0,
        }
    }

    pub fn position(&self) -> u32 {
        self.position
    }

    fn observe(&self) -> Vec<f32> {
        vec![self.position as f32]
    }
}

impl Environment for Corridor {
    fn reset(&mut self) -> Vec<f32> {
        self.position = 0;
        self.observe()
    }

    fn step(&mut self, action: u32) -> Transition {
        self.position = match action {
            0 => self.position.saturating_sub(1),
            1 => self.position,
            _ => (self.position + 1).min(self.length),
        };

        let done = self.position == self.length;
        Transition {
            observation: self.observe(),
            reward: if done { Self::GOAL_REWARD } else { Self::STEP_COST },
            done,
        }
    }
}
