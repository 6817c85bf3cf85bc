//! Broker error types

use thiserror::Error;

/// Errors returned by broker and client operations
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BusError {
    #[error("Invalid topic '{topic}': {reason}")]
    InvalidTopic { topic: String, reason: String },

    #[error("Invalid filter '{filter}': {reason}")]
    InvalidFilter { filter: String, reason: String },

    #[error("Broker channel closed")]
    Closed,

    #[error("Unknown client: {0}")]
    UnknownClient(String),

    #[error("Client already connected: {0}")]
    DuplicateClient(String),
}

impl BusError {
    /// Check if the broker (or this client's connection) is gone
    pub fn is_disconnect(&self) -> bool {
        matches!(self, BusError::Closed | BusError::UnknownClient(_))
    }
}
