//! Message types for the Broker

use std::str::Utf8Error;

use tokio::sync::{mpsc, oneshot};

use crate::error::BusError;
use crate::filter::TopicFilter;

/// A message delivered to a client inbox
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Concrete topic the message was published on
    pub topic: String,
    /// Opaque payload bytes
    pub payload: Vec<u8>,
    /// True when replayed from the retained store on subscribe
    pub retained: bool,
}

impl Message {
    pub fn new(topic: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            retained: false,
        }
    }

    /// Payload decoded as UTF-8
    pub fn payload_str(&self) -> Result<&str, Utf8Error> {
        std::str::from_utf8(&self.payload)
    }
}

/// Message the broker publishes for a client that drops without disconnecting
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LastWill {
    pub topic: String,
    pub payload: Vec<u8>,
    pub retain: bool,
}

impl LastWill {
    pub fn new(topic: impl Into<String>, payload: impl Into<Vec<u8>>, retain: bool) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            retain,
        }
    }
}

/// Requests to the Broker task
#[derive(Debug)]
pub enum BrokerRequest {
    /// Attach a client and its delivery channel
    Connect {
        client_id: String,
        will: Option<LastWill>,
        tx: mpsc::UnboundedSender<Message>,
        reply: oneshot::Sender<Result<(), BusError>>,
    },

    /// Detach a client cleanly; its will is discarded
    Disconnect { client_id: String },

    /// Detach a client as if its connection was lost; its will is published
    Drop { client_id: String },

    /// Add a filter to a client's subscriptions
    Subscribe {
        client_id: String,
        filter: TopicFilter,
        reply: oneshot::Sender<Result<(), BusError>>,
    },

    /// Remove a filter from a client's subscriptions
    Unsubscribe {
        client_id: String,
        filter: String,
        reply: oneshot::Sender<Result<(), BusError>>,
    },

    /// Publish a message
    Publish {
        client_id: String,
        topic: String,
        payload: Vec<u8>,
        retain: bool,
        reply: oneshot::Sender<Result<(), BusError>>,
    },

    /// Get current metrics
    GetMetrics { reply: oneshot::Sender<BrokerMetrics> },

    /// Stop the broker; every inbox closes
    Shutdown,
}

/// Broker metrics for observability
#[derive(Debug, Clone, Default)]
pub struct BrokerMetrics {
    pub connected_clients: usize,
    pub total_subscriptions: usize,
    pub retained_topics: usize,
    pub messages_published: u64,
    pub messages_delivered: u64,
    pub wills_published: u64,
}
