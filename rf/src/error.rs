//! Fleet error types

use std::time::Duration;

use thiserror::Error;
use topicbus::BusError;

use crate::domain::AgentId;

/// A payload that does not parse as its topic's expected type
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PayloadError {
    #[error("payload is not valid UTF-8")]
    NotUtf8,

    #[error("expected {expected}, got '{raw}'")]
    Invalid { expected: &'static str, raw: String },
}

impl PayloadError {
    pub(crate) fn invalid(expected: &'static str, raw: &str) -> Self {
        Self::Invalid {
            expected,
            raw: raw.to_string(),
        }
    }
}

/// Errors raised by coordination components
#[derive(Debug, Error)]
pub enum FleetError {
    #[error("Malformed payload on {topic}: {source}")]
    MalformedPayload {
        topic: String,
        #[source]
        source: PayloadError,
    },

    #[error("Bus disconnected")]
    BusDisconnected,

    #[error("Bus error: {0}")]
    Bus(BusError),

    #[error("Agent {agent}: no {missing} within {waited:?}")]
    ProtocolViolation {
        agent: AgentId,
        missing: String,
        waited: Duration,
    },

    #[error("Agent {0}: reset abandoned by operator")]
    ResetAbandoned(AgentId),

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Agent identities exhausted")]
    IdentitiesExhausted,
}

impl From<BusError> for FleetError {
    fn from(err: BusError) -> Self {
        if err.is_disconnect() {
            FleetError::BusDisconnected
        } else {
            FleetError::Bus(err)
        }
    }
}

impl FleetError {
    /// Check if this error ends the whole task set rather than one episode
    pub fn is_fatal(&self) -> bool {
        matches!(self, FleetError::BusDisconnected)
    }
}
