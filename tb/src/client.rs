//! BusClient - client interface to the Broker

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use crate::error::BusError;
use crate::filter::TopicFilter;
use crate::message::{BrokerRequest, Message};

/// Publish/subscribe operations coordination code depends on
///
/// Deliveries are read separately from the connection's [`Inbox`].
#[async_trait]
pub trait Transport: Send + Sync {
    /// Publish a payload on a concrete topic
    async fn publish(&self, topic: &str, payload: Vec<u8>, retain: bool) -> Result<(), BusError>;

    /// Add a subscription; matching retained messages are delivered first
    async fn subscribe(&self, filter: &str) -> Result<(), BusError>;

    /// Remove a subscription
    async fn unsubscribe(&self, filter: &str) -> Result<(), BusError>;

    /// Publish a text payload
    async fn publish_text(&self, topic: &str, text: &str, retain: bool) -> Result<(), BusError> {
        self.publish(topic, text.as_bytes().to_vec(), retain).await
    }
}

/// Handle for one broker connection
///
/// This handle is cloneable; all clones share one connection and one inbox.
#[derive(Clone)]
pub struct BusClient {
    tx: mpsc::Sender<BrokerRequest>,
    client_id: String,
}

impl BusClient {
    pub(crate) fn new(tx: mpsc::Sender<BrokerRequest>, client_id: String) -> Self {
        debug!(%client_id, "BusClient::new: called");
        Self { tx, client_id }
    }

    /// Get this connection's client ID
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Disconnect cleanly; the last will is discarded
    pub async fn disconnect(self) -> Result<(), BusError> {
        debug!(client_id = %self.client_id, "BusClient::disconnect: called");
        self.tx
            .send(BrokerRequest::Disconnect {
                client_id: self.client_id.clone(),
            })
            .await
            .map_err(|_| BusError::Closed)
    }

    /// Simulate losing the connection; the last will is published
    pub async fn drop_connection(self) -> Result<(), BusError> {
        debug!(client_id = %self.client_id, "BusClient::drop_connection: called");
        self.tx
            .send(BrokerRequest::Drop {
                client_id: self.client_id.clone(),
            })
            .await
            .map_err(|_| BusError::Closed)
    }

    async fn request(
        &self,
        build: impl FnOnce(oneshot::Sender<Result<(), BusError>>) -> BrokerRequest + Send,
    ) -> Result<(), BusError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx.send(build(reply_tx)).await.map_err(|_| BusError::Closed)?;
        reply_rx.await.map_err(|_| BusError::Closed)?
    }
}

#[async_trait]
impl Transport for BusClient {
    async fn publish(&self, topic: &str, payload: Vec<u8>, retain: bool) -> Result<(), BusError> {
        debug!(client_id = %self.client_id, %topic, retain, "BusClient::publish: called");
        self.request(|reply| BrokerRequest::Publish {
            client_id: self.client_id.clone(),
            topic: topic.to_string(),
            payload,
            retain,
            reply,
        })
        .await
    }

    async fn subscribe(&self, filter: &str) -> Result<(), BusError> {
        debug!(client_id = %self.client_id, %filter, "BusClient::subscribe: called");
        let filter = TopicFilter::parse(filter)?;
        self.request(|reply| BrokerRequest::Subscribe {
            client_id: self.client_id.clone(),
            filter,
            reply,
        })
        .await
    }

    async fn unsubscribe(&self, filter: &str) -> Result<(), BusError> {
        debug!(client_id = %self.client_id, %filter, "BusClient::unsubscribe: called");
        self.request(|reply| BrokerRequest::Unsubscribe {
            client_id: self.client_id.clone(),
            filter: filter.to_string(),
            reply,
        })
        .await
    }
}

/// Receiving side of a broker connection
///
/// Not cloneable: exactly one task reads a connection's deliveries.
pub struct Inbox {
    rx: mpsc::UnboundedReceiver<Message>,
    client_id: String,
}

impl Inbox {
    pub(crate) fn new(rx: mpsc::UnboundedReceiver<Message>, client_id: String) -> Self {
        Self { rx, client_id }
    }

    /// Get this connection's client ID
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Receive the next delivery
    ///
    /// Returns None once the broker has gone away or the client disconnected.
    pub async fn recv(&mut self) -> Option<Message> {
        let message = self.rx.recv().await;
        if message.is_none() {
            debug!(client_id = %self.client_id, "Inbox::recv: channel closed");
        }
        message
    }

    /// Receive a delivery without waiting
    pub fn try_recv(&mut self) -> Option<Message> {
        self.rx.try_recv().ok()
    }
}
