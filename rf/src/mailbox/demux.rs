//! Demultiplexer - the single task that reads a connection's inbox
//!
//! Each delivery is classified by topic, decoded into an [`Inbound`] value and
//! handed to the route attached for that topic: either a consumer queue or a
//! readiness flag. Routes are attached and detached through [`DemuxHandle`].

use std::collections::HashMap;

use tokio::sync::{mpsc, oneshot};
use topicbus::{Inbox, Message};
use tracing::{debug, info, trace, warn};

use crate::domain::AgentId;
use crate::error::FleetError;
use crate::protocol::{Inbound, TopicKey};

use super::readiness::ReadinessSetter;
use super::selective::{MailboxSender, QueueItem};

/// Where deliveries on one topic go
#[derive(Debug)]
pub enum Route {
    /// Append to a consumer queue
    Queue(MailboxSender),
    /// Set or clear a readiness flag
    Flag(ReadinessSetter),
}

/// Control requests for a running demultiplexer
#[derive(Debug)]
pub enum DemuxCommand {
    Attach {
        key: TopicKey,
        route: Route,
        reply: oneshot::Sender<()>,
    },
    DetachAgent {
        id: AgentId,
        reply: oneshot::Sender<usize>,
    },
    GetMetrics {
        reply: oneshot::Sender<DemuxMetrics>,
    },
}

/// Delivery counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DemuxMetrics {
    pub routes: usize,
    pub delivered: u64,
    pub malformed: u64,
    pub unroutable: u64,
}

/// Why a demultiplexer stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DemuxExit {
    /// The bus connection closed
    Disconnected,
    /// Every handle was dropped
    Released,
}

/// Handle for attaching and detaching routes
#[derive(Debug, Clone)]
pub struct DemuxHandle {
    tx: mpsc::Sender<DemuxCommand>,
}

impl DemuxHandle {
    /// Attach a route; returns once the demultiplexer has installed it
    ///
    /// Attaching replaces any previous route for the same topic.
    pub async fn attach(&self, key: TopicKey, route: Route) -> Result<(), FleetError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(DemuxCommand::Attach { key, route, reply })
            .await
            .map_err(|_| FleetError::BusDisconnected)?;
        rx.await.map_err(|_| FleetError::BusDisconnected)
    }

    /// Drop every route for one agent's topics; returns how many were removed
    pub async fn detach_agent(&self, id: AgentId) -> Result<usize, FleetError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(DemuxCommand::DetachAgent { id, reply })
            .await
            .map_err(|_| FleetError::BusDisconnected)?;
        rx.await.map_err(|_| FleetError::BusDisconnected)
    }

    pub async fn metrics(&self) -> Result<DemuxMetrics, FleetError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(DemuxCommand::GetMetrics { reply })
            .await
            .map_err(|_| FleetError::BusDisconnected)?;
        rx.await.map_err(|_| FleetError::BusDisconnected)
    }
}

/// Owns an [`Inbox`] and the routing table
pub struct Demultiplexer {
    inbox: Inbox,
    rx: mpsc::Receiver<DemuxCommand>,
    routes: HashMap<TopicKey, Route>,
    metrics: DemuxMetrics,
}

impl Demultiplexer {
    /// Create a demultiplexer for `inbox` with an empty routing table
    pub fn new(inbox: Inbox, buffer: usize) -> (Self, DemuxHandle) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        let demux = Self {
            inbox,
            rx,
            routes: HashMap::new(),
            metrics: DemuxMetrics::default(),
        };
        (demux, DemuxHandle { tx })
    }

    /// Spawn onto the runtime
    pub fn spawn(inbox: Inbox, buffer: usize) -> (DemuxHandle, tokio::task::JoinHandle<DemuxExit>) {
        let (demux, handle) = Self::new(inbox, buffer);
        (handle, tokio::spawn(demux.run()))
    }

    /// Run until the connection closes or every handle is dropped
    ///
    /// Control requests are served before deliveries so a route attached
    /// before a subscription is always in place when the first message for
    /// it arrives.
    pub async fn run(mut self) -> DemuxExit {
        info!(client_id = %self.inbox.client_id(), "Demultiplexer started");

        let exit = loop {
            tokio::select! {
                biased;

                cmd = self.rx.recv() => match cmd {
                    Some(cmd) => self.handle_command(cmd),
                    None => break DemuxExit::Released,
                },

                msg = self.inbox.recv() => match msg {
                    Some(msg) => self.deliver(msg),
                    None => break DemuxExit::Disconnected,
                },
            }
        };

        info!(
            client_id = %self.inbox.client_id(),
            ?exit,
            delivered = self.metrics.delivered,
            malformed = self.metrics.malformed,
            unroutable = self.metrics.unroutable,
            "Demultiplexer stopped"
        );
        exit
    }

    fn handle_command(&mut self, cmd: DemuxCommand) {
        match cmd {
            DemuxCommand::Attach { key, route, reply } => {
                debug!(%key, "Attaching route");
                self.routes.insert(key, route);
                self.metrics.routes = self.routes.len();
                let _ = reply.send(());
            }

            DemuxCommand::DetachAgent { id, reply } => {
                let before = self.routes.len();
                self.routes
                    .retain(|key, _| !matches!(key, TopicKey::Agent(agent, _) if *agent == id));
                let removed = before - self.routes.len();
                debug!(%id, removed, "Detached agent routes");
                self.metrics.routes = self.routes.len();
                let _ = reply.send(removed);
            }

            DemuxCommand::GetMetrics { reply } => {
                let _ = reply.send(self.metrics.clone());
            }
        }
    }

    fn deliver(&mut self, msg: Message) {
        debug!(
            topic = %msg.topic,
            bytes = msg.payload.len(),
            retained = msg.retained,
            "Delivery"
        );

        let Some(key) = TopicKey::parse(&msg.topic) else {
            debug!(topic = %msg.topic, "Dropping delivery on unknown topic");
            self.metrics.unroutable += 1;
            return;
        };

        let Some(route) = self.routes.get(&key) else {
            debug!(%key, "No route for delivery");
            self.metrics.unroutable += 1;
            return;
        };

        let value = match Inbound::decode(&key, &msg.payload) {
            Ok(value) => value,
            Err(e) => {
                warn!(%key, error = %e, "Dropping malformed payload");
                self.metrics.malformed += 1;
                return;
            }
        };

        match route {
            Route::Queue(tx) => {
                if tx.send(QueueItem::new(key, value)).is_err() {
                    debug!(%key, "Consumer gone, removing route");
                    self.routes.remove(&key);
                    self.metrics.routes = self.routes.len();
                    self.metrics.unroutable += 1;
                    return;
                }
            }
            Route::Flag(setter) => match value.as_flag() {
                Some(flag) => {
                    setter.update(flag);
                }
                None => {
                    warn!(%key, "Flag route received a non-flag value");
                    self.metrics.malformed += 1;
                    return;
                }
            },
        }

        trace!(%key, "Delivered");
        self.metrics.delivered += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mailbox::{mailbox, readiness_flag};
    use crate::protocol::Channel;
    use std::time::Duration;
    use topicbus::{Broker, BrokerConfig, Transport};

    #[tokio::test]
    async fn test_routes_queue_and_flag() {
        let (broker, _task) = Broker::spawn(BrokerConfig::default());
        let (client, inbox) = broker.connect("coord", None).await.unwrap();
        let (agent, _agent_inbox) = broker.connect("agent", None).await.unwrap();
        let (demux, _task) = Demultiplexer::spawn(inbox, 16);

        let id = AgentId::new(0);
        let (tx, mut mb) = mailbox();
        let (setter, mut gate) = readiness_flag();
        demux.attach(TopicKey::agent(id, Channel::Reward), Route::Queue(tx)).await.unwrap();
        demux.attach(TopicKey::agent(id, Channel::Status), Route::Flag(setter)).await.unwrap();
        client.subscribe("agents/0/reward").await.unwrap();
        client.subscribe("agents/0/status").await.unwrap();

        agent.publish_text("agents/0/status", "1", true).await.unwrap();
        agent.publish_text("agents/0/reward", "2.5", false).await.unwrap();

        let reward = tokio::time::timeout(Duration::from_secs(1), mb.take(&TopicKey::agent(id, Channel::Reward)))
            .await
            .unwrap();
        assert_eq!(reward, Some(Inbound::Reward(2.5)));
        tokio::time::timeout(Duration::from_secs(1), gate.wait()).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_malformed_payload_is_dropped() {
        let (broker, _task) = Broker::spawn(BrokerConfig::default());
        let (client, inbox) = broker.connect("coord", None).await.unwrap();
        let (demux, _task) = Demultiplexer::spawn(inbox, 16);

        let id = AgentId::new(4);
        let (tx, mut mb) = mailbox();
        demux.attach(TopicKey::agent(id, Channel::Reward), Route::Queue(tx)).await.unwrap();
        client.subscribe("agents/4/reward").await.unwrap();

        client.publish_text("agents/4/reward", "not a number", false).await.unwrap();
        client.publish_text("agents/4/reward", "1", false).await.unwrap();

        let reward = tokio::time::timeout(Duration::from_secs(1), mb.take(&TopicKey::agent(id, Channel::Reward)))
            .await
            .unwrap();
        assert_eq!(reward, Some(Inbound::Reward(1.0)));

        let metrics = demux.metrics().await.unwrap();
        assert_eq!(metrics.malformed, 1);
        assert_eq!(metrics.delivered, 1);
    }

    #[tokio::test]
    async fn test_detach_agent_removes_its_routes() {
        let (broker, _task) = Broker::spawn(BrokerConfig::default());
        let (_client, inbox) = broker.connect("coord", None).await.unwrap();
        let (demux, _task) = Demultiplexer::spawn(inbox, 16);

        for id in [AgentId::new(1), AgentId::new(2)] {
            for channel in Channel::STEP_RESPONSES {
                let (tx, _rx) = mailbox();
                demux.attach(TopicKey::agent(id, channel), Route::Queue(tx)).await.unwrap();
            }
        }

        assert_eq!(demux.detach_agent(AgentId::new(1)).await.unwrap(), 3);
        assert_eq!(demux.metrics().await.unwrap().routes, 3);
    }

    #[tokio::test]
    async fn test_exit_on_disconnect() {
        let (broker, _task) = Broker::spawn(BrokerConfig::default());
        let (client, inbox) = broker.connect("coord", None).await.unwrap();
        let (_demux, task) = Demultiplexer::spawn(inbox, 16);

        client.disconnect().await.unwrap();
        let exit = tokio::time::timeout(Duration::from_secs(1), task).await.unwrap().unwrap();
        assert_eq!(exit, DemuxExit::Disconnected);
    }
}
