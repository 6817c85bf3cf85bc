//! Broker configuration

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

/// Broker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    /// Channel buffer size for broker requests
    #[serde(rename = "channel-buffer", default = "default_channel_buffer")]
    pub channel_buffer: usize,

    /// How often idle connections are checked for a dropped inbox
    #[serde(rename = "reap-interval-ms", default = "default_reap_interval_ms")]
    pub reap_interval_ms: u64,
}

impl BrokerConfig {
    pub fn reap_interval(&self) -> Duration {
        Duration::from_millis(self.reap_interval_ms.max(1))
    }
}

fn default_channel_buffer() -> usize {
    debug!("default_channel_buffer: called");
    1000
}

fn default_reap_interval_ms() -> u64 {
    100
}

impl Default for BrokerConfig {
    fn default() -> Self {
        debug!("BrokerConfig::default: called");
        Self {
            channel_buffer: default_channel_buffer(),
            reap_interval_ms: default_reap_interval_ms(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = BrokerConfig::default();
        assert_eq!(config.channel_buffer, 1000);
        assert_eq!(config.reap_interval(), Duration::from_millis(100));
    }
}
