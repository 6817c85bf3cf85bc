//! Tabular Q-learning over discretized observations

use std::collections::HashMap;

use rand::Rng;
use rand::rngs::StdRng;
use tracing::trace;

use crate::config::PolicyConfig;
use crate::domain::StepTuple;

type StateKey = Vec<i64>;

/// Epsilon-greedy tabular learner
#[derive(Debug)]
pub struct QLearning {
    table: HashMap<StateKey, Vec<f64>>,
    actions: u32,
    gamma: f64,
    learning_rate: f64,
    epsilon: f64,
    epsilon_min: f64,
    epsilon_decay: f64,
    resolution: f32,
    rng: StdRng,
}

impl QLearning {
    pub fn new(config: &PolicyConfig, actions: u32, rng: StdRng) -> Self {
        Self {
            table: HashMap::new(),
            actions: actions.max(1),
            gamma: config.gamma,
            learning_rate: config.learning_rate,
            epsilon: config.epsilon_max,
            epsilon_min: config.epsilon_min,
            epsilon_decay: config.epsilon_decay,
            resolution: config.resolution,
            rng,
        }
    }

    pub fn epsilon(&self) -> f64 {
        self.epsilon
    }

    /// Number of distinct states seen so far
    pub fn states(&self) -> usize {
        self.table.len()
    }

    /// Action values for an observation, if its state has been visited
    pub fn values(&self, observation: &[f32]) -> Option<&[f64]> {
        self.table.get(&self.key(observation)).map(Vec::as_slice)
    }

    fn key(&self, observation: &[f32]) -> StateKey {
        observation
            .iter()
            .map(|v| (v / self.resolution).round() as i64)
            .collect()
    }

    fn row(&mut self, key: StateKey) -> &mut Vec<f64> {
        let actions = self.actions as usize;
        self.table.entry(key).or_insert_with(|| vec![0.0; actions])
    }

    fn greedy(values: &[f64]) -> u32 {
        let mut best = 0;
        for (i, v) in values.iter().enumerate() {
            if *v > values[best] {
                best = i;
            }
        }
        best as u32
    }

    pub fn select_action(&mut self, observation: &[f32]) -> u32 {
        if self.rng.random::<f64>() < self.epsilon {
            return self.rng.random_range(0..self.actions);
        }
        let greedy = self.values(observation).map(Self::greedy);
        greedy.unwrap_or_else(|| self.rng.random_range(0..self.actions))
    }

    pub fn update(&mut self, step: &StepTuple) {
        if step.action >= self.actions {
            return;
        }

        let bootstrap = if step.done {
            0.0
        } else {
            let next = self.key(&step.next_observation);
            self.table
                .get(&next)
                .map(|v| v.iter().copied().fold(f64::MIN, f64::max))
                .unwrap_or(0.0)
        };
        let target = f64::from(step.reward) + self.gamma * bootstrap;

        let lr = self.learning_rate;
        let key = self.key(&step.observation);
        let value = &mut self.row(key)[step.action as usize];
        *value += lr * (target - *value);
        trace!(action = step.action, target, value = *value, "QLearning::update");
    }

    pub fn end_episode(&mut self) {
        self.epsilon = (self.epsilon * self.epsilon_decay).max(self.epsilon_min);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::seeded_rng;

    fn greedy_config() -> PolicyConfig {
        PolicyConfig {
            epsilon_max: 0.0,
            epsilon_min: 0.0,
            learning_rate: 0.5,
            ..Default::default()
        }
    }

    fn step(obs: f32, action: u32, reward: f32, next: f32, done: bool) -> StepTuple {
        StepTuple {
            observation: vec![obs],
            action,
            reward,
            next_observation: vec![next],
            done,
        }
    }

    #[test]
    fn test_update_moves_value_toward_target() {
        let mut q = QLearning::new(&greedy_config(), 2, seeded_rng(Some(1)));
        q.update(&step(0.0, 1, 10.0, 1.0, true));
        assert_eq!(q.values(&[0.0]), Some(&[0.0, 5.0][..]));

        q.update(&step(0.0, 1, 10.0, 1.0, true));
        assert_eq!(q.values(&[0.0]), Some(&[0.0, 7.5][..]));
        assert_eq!(q.select_action(&[0.0]), 1);
    }

    #[test]
    fn test_bootstrap_from_next_state() {
        let mut q = QLearning::new(&greedy_config(), 2, seeded_rng(Some(1)));
        q.update(&step(1.0, 0, 4.0, 2.0, true));
        q.update(&step(0.0, 0, 0.0, 1.0, false));
        // 0.5 * (0 + 0.99 * 2.0)
        let values = q.values(&[0.0]).unwrap();
        assert!((values[0] - 0.99).abs() < 1e-9);
    }

    #[test]
    fn test_observations_share_buckets() {
        let mut q = QLearning::new(&greedy_config(), 2, seeded_rng(Some(1)));
        q.update(&step(0.2, 0, 1.0, 0.0, true));
        q.update(&step(-0.3, 0, 1.0, 0.0, true));
        assert_eq!(q.states(), 1);
    }

    #[test]
    fn test_epsilon_decays_to_floor() {
        let config = PolicyConfig {
            epsilon_max: 1.0,
            epsilon_min: 0.5,
            epsilon_decay: 0.5,
            ..Default::default()
        };
        let mut q = QLearning::new(&config, 4, seeded_rng(Some(1)));
        q.end_episode();
        assert_eq!(q.epsilon(), 0.5);
        q.end_episode();
        assert_eq!(q.epsilon(), 0.5);
    }

    #[test]
    fn test_out_of_range_action_is_ignored() {
        let mut q = QLearning::new(&greedy_config(), 2, seeded_rng(Some(1)));
        q.update(&step(0.0, 7, 1.0, 0.0, true));
        assert_eq!(q.states(), 0);
    }
}
