//! Action selection and learning
//!
//! The step synchronizer only sees [`TrainingAdapter`]. [`Policy`] is the
//! closed set of adapters the fleet ships with, chosen from configuration.

mod qlearning;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::config::PolicyConfig;
use crate::domain::StepTuple;

pub use qlearning::QLearning;

/// Pluggable action selection and training step
pub trait TrainingAdapter: Send {
    /// Choose an action for the current observation
    fn select_action(&mut self, observation: &[f32]) -> u32;

    /// Learn from one completed step
    fn update(&mut self, step: &StepTuple);

    /// Called once after every recorded episode
    fn end_episode(&mut self) {}
}

/// Which built-in policy to run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Algorithm {
    /// Always emit the same action
    Constant,
    /// Uniformly random actions
    #[default]
    Random,
    /// Tabular Q-learning with epsilon-greedy exploration
    QLearning,
}

impl std::fmt::Display for Algorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Constant => "constant",
            Self::Random => "random",
            Self::QLearning => "q-learning",
        };
        write!(f, "{}", name)
    }
}

/// The built-in training adapters
#[derive(Debug)]
pub enum Policy {
    Constant(u32),
    Random { actions: u32, rng: StdRng },
    QLearning(QLearning),
}

impl Policy {
    /// Build the configured policy for one agent
    pub fn from_config(config: &PolicyConfig, action_count: u32, seed: Option<u64>) -> Self {
        let actions = action_count.max(1);
        match config.algorithm {
            Algorithm::Constant => Self::Constant(config.action.min(actions - 1)),
            Algorithm::Random => Self::Random {
                actions,
                rng: seeded_rng(seed),
            },
            Algorithm::QLearning => Self::QLearning(QLearning::new(config, actions, seeded_rng(seed))),
        }
    }

    pub fn algorithm(&self) -> Algorithm {
        match self {
            Self::Constant(_) => Algorithm::Constant,
            Self::Random { .. } => Algorithm::Random,
            Self::QLearning(_) => Algorithm::QLearning,
        }
    }
}

pub(crate) fn seeded_rng(seed: Option<u64>) -> StdRng {
    match seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_rng(&mut rand::rng()),
    }
}

impl TrainingAdapter for Policy {
    fn select_action(&mut self, observation: &[f32]) -> u32 {
        match self {
            Self::Constant(action) => *action,
            Self::Random { actions, rng } => rng.random_range(0..*actions),
            Self::QLearning(q) => q.select_action(observation),
        }
    }

    fn update(&mut self, step: &StepTuple) {
        if let Self::QLearning(q) = self {
            q.update(step);
        }
    }

    fn end_episode(&mut self) {
        if let Self::QLearning(q) = self {
            q.end_episode();
        }
    }
}
