//! Main Broker task implementation

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::client::{BusClient, Inbox};
use crate::config::BrokerConfig;
use crate::error::BusError;
use crate::filter::{TopicFilter, validate_topic};
use crate::message::{BrokerMetrics, BrokerRequest, LastWill, Message};

/// Per-client broker state
struct ClientState {
    tx: mpsc::UnboundedSender<Message>,
    will: Option<LastWill>,
    filters: Vec<TopicFilter>,
}

impl ClientState {
    fn wants(&self, topic: &str) -> bool {
        self.filters.iter().any(|f| f.matches(topic))
    }
}

/// The Broker owns every subscription and retained message
pub struct Broker {
    tx: mpsc::Sender<BrokerRequest>,
    rx: mpsc::Receiver<BrokerRequest>,
    reap_interval: Duration,
}

impl Broker {
    /// Create a new Broker with the given configuration
    pub fn new(config: BrokerConfig) -> Self {
        debug!(channel_buffer = config.channel_buffer, "Broker::new: called");
        let (tx, rx) = mpsc::channel(config.channel_buffer);
        Self {
            tx,
            rx,
            reap_interval: config.reap_interval(),
        }
    }

    /// Create a new Broker and spawn its task
    pub fn spawn(config: BrokerConfig) -> (BrokerHandle, tokio::task::JoinHandle<()>) {
        let broker = Self::new(config);
        let handle = broker.handle();
        (handle, tokio::spawn(broker.run()))
    }

    /// Get a handle for connecting clients
    pub fn handle(&self) -> BrokerHandle {
        BrokerHandle { tx: self.tx.clone() }
    }

    /// Run the Broker task
    ///
    /// This consumes the Broker and runs until shutdown is requested or every
    /// handle is dropped. A client whose inbox is gone counts as dropped and
    /// its will is published.
    pub async fn run(mut self) {
        let mut clients: HashMap<String, ClientState> = HashMap::new();
        let mut retained: BTreeMap<String, Message> = BTreeMap::new();
        let mut metrics = BrokerMetrics::default();
        let mut reap = tokio::time::interval(self.reap_interval);
        reap.set_missed_tick_behavior(MissedTickBehavior::Delay);

        // Keep the request channel open only as long as external handles exist
        drop(self.tx);

        info!("Broker started");

        loop {
            let req = tokio::select! {
                req = self.rx.recv() => match req {
                    Some(req) => req,
                    None => break,
                },
                _ = reap.tick() => {
                    reap_vanished(&mut clients, &mut retained, &mut metrics);
                    continue;
                }
            };

            match req {
                BrokerRequest::Connect {
                    client_id,
                    will,
                    tx,
                    reply,
                } => {
                    if clients.contains_key(&client_id) {
                        warn!(%client_id, "Rejecting duplicate client");
                        let _ = reply.send(Err(BusError::DuplicateClient(client_id)));
                        continue;
                    }
                    debug!(%client_id, has_will = will.is_some(), "Client connected");
                    clients.insert(
                        client_id,
                        ClientState {
                            tx,
                            will,
                            filters: Vec::new(),
                        },
                    );
                    metrics.connected_clients = clients.len();
                    let _ = reply.send(Ok(()));
                }

                BrokerRequest::Disconnect { client_id } => {
                    debug!(%client_id, "Client disconnected");
                    clients.remove(&client_id);
                    metrics.connected_clients = clients.len();
                    metrics.total_subscriptions = count_subscriptions(&clients);
                }

                BrokerRequest::Drop { client_id } => {
                    drop_client(&mut clients, &mut retained, &mut metrics, &client_id);
                    reap_vanished(&mut clients, &mut retained, &mut metrics);
                }

                BrokerRequest::Subscribe {
                    client_id,
                    filter,
                    reply,
                } => {
                    let Some(state) = clients.get_mut(&client_id) else {
                        let _ = reply.send(Err(BusError::UnknownClient(client_id)));
                        continue;
                    };
                    debug!(%client_id, %filter, "Subscribing");

                    // Replay retained values before acknowledging
                    for message in retained.values().filter(|m| filter.matches(&m.topic)) {
                        let mut replay = message.clone();
                        replay.retained = true;
                        if state.tx.send(replay).is_ok() {
                            metrics.messages_delivered += 1;
                        }
                    }

                    if !state.filters.contains(&filter) {
                        state.filters.push(filter);
                    }
                    metrics.total_subscriptions = count_subscriptions(&clients);
                    let _ = reply.send(Ok(()));
                }

                BrokerRequest::Unsubscribe {
                    client_id,
                    filter,
                    reply,
                } => {
                    let Some(state) = clients.get_mut(&client_id) else {
                        let _ = reply.send(Err(BusError::UnknownClient(client_id)));
                        continue;
                    };
                    debug!(%client_id, %filter, "Unsubscribing");
                    state.filters.retain(|f| f.as_str() != filter);
                    metrics.total_subscriptions = count_subscriptions(&clients);
                    let _ = reply.send(Ok(()));
                }

                BrokerRequest::Publish {
                    client_id,
                    topic,
                    payload,
                    retain,
                    reply,
                } => {
                    if !clients.contains_key(&client_id) {
                        let _ = reply.send(Err(BusError::UnknownClient(client_id)));
                        continue;
                    }
                    if let Err(e) = validate_topic(&topic) {
                        let _ = reply.send(Err(e));
                        continue;
                    }
                    debug!(%client_id, %topic, bytes = payload.len(), retain, "Publishing");
                    publish(&clients, &mut retained, &mut metrics, Message::new(topic, payload), retain);
                    reap_vanished(&mut clients, &mut retained, &mut metrics);
                    let _ = reply.send(Ok(()));
                }

                BrokerRequest::GetMetrics { reply } => {
                    metrics.retained_topics = retained.len();
                    let _ = reply.send(metrics.clone());
                }

                BrokerRequest::Shutdown => {
                    info!("Broker shutting down");
                    break;
                }
            }
        }

        info!(clients = clients.len(), "Broker stopped");
    }
}

fn count_subscriptions(clients: &HashMap<String, ClientState>) -> usize {
    clients.values().map(|c| c.filters.len()).sum()
}

/// Remove a client as if its connection was lost and publish its will
fn drop_client(
    clients: &mut HashMap<String, ClientState>,
    retained: &mut BTreeMap<String, Message>,
    metrics: &mut BrokerMetrics,
    client_id: &str,
) {
    let Some(state) = clients.remove(client_id) else {
        return;
    };
    metrics.connected_clients = clients.len();
    metrics.total_subscriptions = count_subscriptions(clients);

    if let Some(will) = state.will {
        info!(%client_id, topic = %will.topic, "Publishing last will");
        metrics.wills_published += 1;
        let message = Message::new(will.topic, will.payload);
        publish(clients, retained, metrics, message, will.retain);
    } else {
        debug!(%client_id, "Client dropped without will");
    }
}

/// Drop every client whose inbox has been released
fn reap_vanished(
    clients: &mut HashMap<String, ClientState>,
    retained: &mut BTreeMap<String, Message>,
    metrics: &mut BrokerMetrics,
) {
    let vanished: Vec<String> = clients
        .iter()
        .filter(|(_, state)| state.tx.is_closed())
        .map(|(client_id, _)| client_id.clone())
        .collect();
    for client_id in vanished {
        warn!(%client_id, "Connection vanished");
        drop_client(clients, retained, metrics, &client_id);
    }
}

/// Update the retained store and fan a message out to matching clients
fn publish(
    clients: &HashMap<String, ClientState>,
    retained: &mut BTreeMap<String, Message>,
    metrics: &mut BrokerMetrics,
    message: Message,
    retain: bool,
) {
    metrics.messages_published += 1;

    if retain {
        if message.payload.is_empty() {
            retained.remove(&message.topic);
        } else {
            retained.insert(message.topic.clone(), message.clone());
        }
    }

    for (client_id, state) in clients {
        if !state.wants(&message.topic) {
            continue;
        }
        if state.tx.send(message.clone()).is_ok() {
            metrics.messages_delivered += 1;
        } else {
            debug!(%client_id, topic = %message.topic, "Inbox closed, delivery skipped");
        }
    }
}

/// Cloneable handle to a running Broker
#[derive(Clone)]
pub struct BrokerHandle {
    tx: mpsc::Sender<BrokerRequest>,
}

impl BrokerHandle {
    /// Connect a new client
    pub async fn connect(&self, client_id: &str, will: Option<LastWill>) -> Result<(BusClient, Inbox), BusError> {
        debug!(%client_id, "BrokerHandle::connect: called");
        let (msg_tx, msg_rx) = mpsc::unbounded_channel();
        let (reply_tx, reply_rx) = oneshot::channel();

        self.tx
            .send(BrokerRequest::Connect {
                client_id: client_id.to_string(),
                will,
                tx: msg_tx,
                reply: reply_tx,
            })
            .await
            .map_err(|_| BusError::Closed)?;
        reply_rx.await.map_err(|_| BusError::Closed)??;

        Ok((
            BusClient::new(self.tx.clone(), client_id.to_string()),
            Inbox::new(msg_rx, client_id.to_string()),
        ))
    }

    /// Get current broker metrics
    pub async fn metrics(&self) -> Result<BrokerMetrics, BusError> {
        debug!("BrokerHandle::metrics: called");
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(BrokerRequest::GetMetrics { reply: reply_tx })
            .await
            .map_err(|_| BusError::Closed)?;
        reply_rx.await.map_err(|_| BusError::Closed)
    }

    /// Request shutdown of the Broker
    pub async fn shutdown(&self) -> Result<(), BusError> {
        debug!("BrokerHandle::shutdown: called");
        self.tx.send(BrokerRequest::Shutdown).await.map_err(|_| BusError::Closed)
    }
}
