//! Step and episode records

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::id::AgentId;

/// One interaction step, assembled from independently delivered responses
#[derive(Debug, Clone, PartialEq)]
pub struct StepTuple {
    pub observation: Vec<f32>,
    pub action: u32,
    pub reward: f32,
    pub next_observation: Vec<f32>,
    pub done: bool,
}

/// Why an episode ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Termination {
    /// The agent reported done
    Done,
    /// The step ceiling was reached first
    Timeout,
}

impl std::fmt::Display for Termination {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Done => write!(f, "done"),
            Self::Timeout => write!(f, "timeout"),
        }
    }
}

/// Accumulated outcome of one episode
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpisodeRecord {
    /// Zero-based episode index within the session
    pub episode: u32,
    #[serde(rename = "total-reward")]
    pub total_reward: f64,
    pub steps: u32,
    pub termination: Termination,
    #[serde(rename = "finished-at")]
    pub finished_at: DateTime<Utc>,
}

impl EpisodeRecord {
    pub fn new(episode: u32, total_reward: f64, steps: u32, termination: Termination) -> Self {
        Self {
            episode,
            total_reward,
            steps,
            termination,
            finished_at: Utc::now(),
        }
    }
}

/// Everything one agent session produced, persisted once at the end
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentResults {
    pub agent: AgentId,
    pub episodes: Vec<EpisodeRecord>,
    /// Episodes abandoned after a protocol violation; not in `episodes`
    #[serde(rename = "aborted-episodes", default)]
    pub aborted_episodes: u32,
}

impl AgentResults {
    pub fn new(agent: AgentId) -> Self {
        Self {
            agent,
            episodes: Vec::new(),
            aborted_episodes: 0,
        }
    }

    /// Mean total reward over recorded episodes
    pub fn mean_reward(&self) -> Option<f64> {
        if self.episodes.is_empty() {
            return None;
        }
        let sum: f64 = self.episodes.iter().map(|e| e.total_reward).sum();
        Some(sum / self.episodes.len() as f64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_termination_serialization() {
        let json = serde_json::to_string(&Termination::Timeout).unwrap();
        assert_eq!(json, "\"timeout\"");
        assert_eq!(Termination::Done.to_string(), "done");
    }

    #[test]
    fn test_mean_reward() {
        let mut results = AgentResults::new(AgentId::new(0));
        assert_eq!(results.mean_reward(), None);

        results.episodes.push(EpisodeRecord::new(0, 2.0, 3, Termination::Done));
        results.episodes.push(EpisodeRecord::new(1, -4.0, 10, Termination::Timeout));
        assert_eq!(results.mean_reward(), Some(-1.0));
    }

    #[test]
    fn test_results_json_keys() {
        let mut results = AgentResults::new(AgentId::new(2));
        results.episodes.push(EpisodeRecord::new(0, 1.0, 1, Termination::Done));
        let json = serde_json::to_string(&results).unwrap();
        assert!(json.contains("\"agent\":2"));
        assert!(json.contains("total-reward"));
        assert!(json.contains("aborted-episodes"));
    }
}
