//! rlfleet configuration types and loading

use eyre::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use topicbus::BrokerConfig;

use crate::policy::Algorithm;

/// Main rlfleet configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Bus connection and publish throttling
    pub bus: BusConfig,

    /// Step cycle and episode settings
    pub session: SessionConfig,

    /// Action selection and learning
    pub policy: PolicyConfig,

    /// Result persistence
    pub results: ResultsConfig,

    /// Simulated agents used by `rf run`
    pub sim: SimConfig,

    /// Log level used when `--log-level` is not given
    #[serde(rename = "log-level", skip_serializing_if = "Option::is_none")]
    pub log_level: Option<String>,
}

impl Config {
    /// Validate configuration before use
    ///
    /// Call this early in startup to fail fast with clear error messages.
    pub fn validate(&self) -> Result<()> {
        self.bus.validate()?;
        self.session.validate()?;
        self.policy.validate(self.session.action_count)?;
        self.sim.validate()?;
        Ok(())
    }

    /// Load configuration with fallback chain
    pub fn load(config_path: Option<&PathBuf>) -> Result<Self> {
        // If explicit config path provided, try to load it
        if let Some(path) = config_path {
            return Self::load_from_file(path).context(format!("Failed to load config from {}", path.display()));
        }

        // Try project-local config: .rlfleet.yml
        let local_config = PathBuf::from(".rlfleet.yml");
        if local_config.exists() {
            match Self::load_from_file(&local_config) {
                Ok(config) => return Ok(config),
                Err(e) => {
                    tracing::warn!("Failed to load config from {}: {}", local_config.display(), e);
                }
            }
        }

        // Try user config: ~/.config/rlfleet/rlfleet.yml
        if let Some(user_config) = user_config_path() {
            if user_config.exists() {
                match Self::load_from_file(&user_config) {
                    Ok(config) => return Ok(config),
                    Err(e) => {
                        tracing::warn!("Failed to load config from {}: {}", user_config.display(), e);
                    }
                }
            }
        }

        // No config file found, use defaults
        tracing::info!("No config file found, using defaults");
        Ok(Self::default())
    }

    /// Read only the log level, before logging is set up
    ///
    /// Errors are swallowed; the full load reports them once logging works.
    pub fn load_log_level(config_path: Option<&PathBuf>) -> Option<String> {
        let candidates = match config_path {
            Some(path) => vec![path.clone()],
            None => {
                let mut paths = vec![PathBuf::from(".rlfleet.yml")];
                paths.extend(user_config_path());
                paths
            }
        };

        candidates
            .iter()
            .filter(|p| p.exists())
            .find_map(|p| fs::read_to_string(p).ok())
            .and_then(|content| serde_yaml::from_str::<Self>(&content).ok())
            .and_then(|config| config.log_level)
    }

    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path).context("Failed to read config file")?;

        let config: Self = serde_yaml::from_str(&content).context("Failed to parse config file")?;

        tracing::info!("Loaded config from: {}", path.as_ref().display());
        Ok(config)
    }
}

fn user_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("rlfleet").join("rlfleet.yml"))
}

/// Bus connection and publish throttling
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    #[serde(flatten)]
    pub broker: BrokerConfig,

    /// Sustained publish rate per connection in messages/sec; 0 disables throttling
    #[serde(rename = "publish-rate")]
    pub publish_rate: f64,

    /// Publishes allowed back to back before throttling applies
    #[serde(rename = "publish-burst")]
    pub publish_burst: u32,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            broker: BrokerConfig::default(),
            publish_rate: 0.0,
            publish_burst: 100,
        }
    }
}

impl BusConfig {
    fn validate(&self) -> Result<()> {
        if self.broker.channel_buffer == 0 {
            return Err(eyre::eyre!("bus.channel-buffer must be at least 1"));
        }
        if !self.publish_rate.is_finite() || self.publish_rate < 0.0 {
            return Err(eyre::eyre!("bus.publish-rate must be zero or positive"));
        }
        if self.publish_rate > 0.0 && self.publish_burst == 0 {
            return Err(eyre::eyre!("bus.publish-burst must be at least 1 when throttling"));
        }
        Ok(())
    }
}

/// How episode boundaries are handled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SessionMode {
    /// Episodes follow each other immediately
    #[default]
    Simulation,
    /// Each episode end waits for an operator to confirm the reset
    Hybrid,
}

/// Step cycle and episode settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Step ceiling per episode
    #[serde(rename = "max-steps")]
    pub max_steps: u32,

    /// Episodes per session before results are persisted
    pub episodes: u32,

    /// How long to wait for the three step responses
    #[serde(rename = "step-timeout-ms")]
    pub step_timeout_ms: u64,

    pub mode: SessionMode,

    /// Size of the discrete action space
    #[serde(rename = "action-count")]
    pub action_count: u32,

    /// How long a cancelled session may take to persist before it is aborted
    #[serde(rename = "shutdown-grace-ms")]
    pub shutdown_grace_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_steps: 10_000,
            episodes: 100,
            step_timeout_ms: 30_000,
            mode: SessionMode::Simulation,
            action_count: 4,
            shutdown_grace_ms: 5_000,
        }
    }
}

impl SessionConfig {
    pub fn step_timeout(&self) -> Duration {
        Duration::from_millis(self.step_timeout_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    fn validate(&self) -> Result<()> {
        if self.max_steps == 0 {
            return Err(eyre::eyre!("session.max-steps must be at least 1"));
        }
        if self.episodes == 0 {
            return Err(eyre::eyre!("session.episodes must be at least 1"));
        }
        if self.step_timeout_ms == 0 {
            return Err(eyre::eyre!("session.step-timeout-ms must be at least 1"));
        }
        if self.action_count == 0 {
            return Err(eyre::eyre!("session.action-count must be at least 1"));
        }
        Ok(())
    }
}

/// Policy section of the configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    pub algorithm: Algorithm,

    /// Action emitted by the constant policy
    pub action: u32,

    /// Discount factor
    pub gamma: f64,

    /// Tabular step size
    #[serde(rename = "learning-rate")]
    pub learning_rate: f64,

    #[serde(rename = "epsilon-max")]
    pub epsilon_max: f64,

    #[serde(rename = "epsilon-min")]
    pub epsilon_min: f64,

    /// Multiplicative decay applied after each episode
    #[serde(rename = "epsilon-decay")]
    pub epsilon_decay: f64,

    /// Observation bucket width used to index the Q table
    pub resolution: f32,

    /// Base seed; each agent's policy is seeded with `seed + id`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            algorithm: Algorithm::default(),
            action: 3,
            gamma: 0.99,
            learning_rate: 0.1,
            epsilon_max: 1.0,
            epsilon_min: 0.01,
            epsilon_decay: 0.995,
            resolution: 1.0,
            seed: None,
        }
    }
}

impl PolicyConfig {
    pub fn validate(&self, action_count: u32) -> Result<()> {
        if self.algorithm == Algorithm::Constant && self.action >= action_count {
            return Err(eyre::eyre!(
                "policy.action {} is outside the action space of {}",
                self.action,
                action_count
            ));
        }
        if !(0.0..=1.0).contains(&self.gamma) {
            return Err(eyre::eyre!("policy.gamma must be within [0, 1]"));
        }
        if !(self.learning_rate > 0.0 && self.learning_rate <= 1.0) {
            return Err(eyre::eyre!("policy.learning-rate must be within (0, 1]"));
        }
        if !(0.0..=1.0).contains(&self.epsilon_min)
            || !(0.0..=1.0).contains(&self.epsilon_max)
            || self.epsilon_min > self.epsilon_max
        {
            return Err(eyre::eyre!(
                "policy epsilon bounds must satisfy 0 <= epsilon-min <= epsilon-max <= 1"
            ));
        }
        if !(self.epsilon_decay > 0.0 && self.epsilon_decay <= 1.0) {
            return Err(eyre::eyre!("policy.epsilon-decay must be within (0, 1]"));
        }
        if !(self.resolution > 0.0 && self.resolution.is_finite()) {
            return Err(eyre::eyre!("policy.resolution must be positive"));
        }
        Ok(())
    }

    /// Seed for one agent's policy
    pub fn seed_for(&self, agent: u32) -> Option<u64> {
        self.seed.map(|s| s.wrapping_add(u64::from(agent)))
    }
}

/// Result persistence
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResultsConfig {
    /// Directory receiving one `agent-<id>.json` per session
    pub dir: PathBuf,
}

impl Default for ResultsConfig {
    fn default() -> Self {
        // Use XDG data directory (~/.local/share/rlfleet/results on Linux)
        let dir = dirs::data_dir()
            .map(|d| d.join("rlfleet").join("results"))
            .unwrap_or_else(|| PathBuf::from(".rlfleet/results"));
        Self { dir }
    }
}

/// Simulated agents used by `rf run`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SimConfig {
    /// Number of simulated agents
    pub agents: u32,

    /// Corridor cells between start and goal
    #[serde(rename = "corridor-length")]
    pub corridor_length: u32,

    /// Publish the three step responses in random order
    #[serde(rename = "shuffle-responses")]
    pub shuffle_responses: bool,

    /// Let only one simulated agent join at a time
    #[serde(rename = "serialize-joins")]
    pub serialize_joins: bool,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            agents: 2,
            corridor_length: 5,
            shuffle_responses: true,
            serialize_joins: false,
        }
    }
}

impl SimConfig {
    fn validate(&self) -> Result<()> {
        if self.corridor_length == 0 {
            return Err(eyre::eyre!("sim.corridor-length must be at least 1"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = Config::default();

        assert_eq!(config.session.max_steps, 10_000);
        assert_eq!(config.session.episodes, 100);
        assert_eq!(config.session.step_timeout(), Duration::from_secs(30));
        assert_eq!(config.session.mode, SessionMode::Simulation);
        assert_eq!(config.session.action_count, 4);
        assert_eq!(config.bus.broker.channel_buffer, 1000);
        assert_eq!(config.policy.gamma, 0.99);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_deserialize_config() {
        let yaml = r#"
bus:
  channel-buffer: 64
  publish-rate: 50
  publish-burst: 5

session:
  max-steps: 200
  episodes: 3
  step-timeout-ms: 1500
  mode: hybrid
  action-count: 2

policy:
  algorithm: q-learning
  gamma: 0.9
  learning-rate: 0.2
  seed: 42

sim:
  agents: 4
  corridor-length: 8

log-level: debug
"#;

        let config: Config = serde_yaml::from_str(yaml).unwrap();

        assert_eq!(config.bus.broker.channel_buffer, 64);
        assert_eq!(config.bus.publish_rate, 50.0);
        assert_eq!(config.bus.publish_burst, 5);
        assert_eq!(config.session.max_steps, 200);
        assert_eq!(config.session.mode, SessionMode::Hybrid);
        assert_eq!(config.session.step_timeout(), Duration::from_millis(1500));
        assert_eq!(config.policy.algorithm, Algorithm::QLearning);
        assert_eq!(config.policy.seed_for(3), Some(45));
        assert_eq!(config.sim.agents, 4);
        assert_eq!(config.log_level.as_deref(), Some("debug"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let yaml = r#"
session:
  episodes: 7
"#;

        let config: Config = serde_yaml::from_str(yaml).unwrap();

        // Specified value
        assert_eq!(config.session.episodes, 7);

        // Defaults for unspecified
        assert_eq!(config.session.max_steps, 10_000);
        assert_eq!(config.policy.algorithm, Algorithm::Random);
        assert_eq!(config.sim.corridor_length, 5);
        assert!(config.log_level.is_none());
    }

    #[test]
    fn test_validate_rejects_nonsense() {
        let mut config = Config::default();
        config.session.max_steps = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.session.action_count = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.policy.epsilon_min = 0.5;
        config.policy.epsilon_max = 0.1;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.bus.publish_rate = -1.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_explicit_path() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "session:\n  episodes: 9\nlog-level: warn").unwrap();
        let path = file.path().to_path_buf();

        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.session.episodes, 9);
        assert_eq!(Config::load_log_level(Some(&path)).as_deref(), Some("warn"));
    }

    #[test]
    fn test_load_missing_explicit_path_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing.yml");
        assert!(Config::load(Some(&path)).is_err());
        assert!(Config::load_log_level(Some(&path)).is_none());
    }

    #[test]
    fn test_config_yaml_round_trip() {
        let config = Config::default();
        let yaml = serde_yaml::to_string(&config).unwrap();
        assert!(yaml.contains("max-steps"));
        assert!(yaml.contains("channel-buffer"));
        let back: Config = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(back.session.episodes, config.session.episodes);
    }
}
