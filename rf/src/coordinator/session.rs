//! Step synchronizer - one task per joined agent
//!
//! Drives the agent's episodes: waits for its readiness, releases its start
//! gate, then for every step publishes an action and reassembles the three
//! independently delivered responses into a [`StepTuple`].

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use topicbus::Transport;
use tracing::{debug, info, trace, warn};

use crate::config::SessionConfig;
use crate::domain::{AgentId, AgentResults, EpisodeRecord, StepTuple, Termination};
use crate::error::{FleetError, PayloadError};
use crate::mailbox::{MailboxSender, QueueItem, ReadinessGate};
use crate::policy::TrainingAdapter;
use crate::protocol::{Channel, Inbound, TopicKey, encode_flag};
use crate::results::ResultStore;

use super::barrier::EpisodeBarrier;
use super::metrics::FleetMetrics;

/// Demultiplexer-side senders for one agent's step responses
#[derive(Debug, Clone)]
pub struct StepRoutes {
    pub observation: MailboxSender,
    pub reward: MailboxSender,
    pub done: MailboxSender,
}

/// The three response fields of one step
#[derive(Debug, Clone, PartialEq)]
pub struct StepResponse {
    pub observation: Vec<f32>,
    pub reward: f32,
    pub done: bool,
}

#[derive(Debug, Default)]
struct Partial {
    observation: Option<Vec<f32>>,
    reward: Option<f32>,
    done: Option<bool>,
}

impl Partial {
    fn is_complete(&self) -> bool {
        self.observation.is_some() && self.reward.is_some() && self.done.is_some()
    }

    fn take_complete(&mut self) -> Option<StepResponse> {
        if !self.is_complete() {
            return None;
        }
        let partial = std::mem::take(self);
        Some(StepResponse {
            observation: partial.observation?,
            reward: partial.reward?,
            done: partial.done?,
        })
    }

    fn missing(&self) -> String {
        let mut missing = Vec::new();
        if self.observation.is_none() {
            missing.push(Channel::Observation.as_str());
        }
        if self.reward.is_none() {
            missing.push(Channel::Reward.as_str());
        }
        if self.done.is_none() {
            missing.push(Channel::Done.as_str());
        }
        missing.join(", ")
    }
}

/// Per-topic queues for one agent's step responses
///
/// Each response topic has its own channel, so a response is assigned by the
/// topic it arrived on and never by its position among the three.
#[derive(Debug)]
pub struct StepInbox {
    observations: mpsc::UnboundedReceiver<QueueItem>,
    rewards: mpsc::UnboundedReceiver<QueueItem>,
    dones: mpsc::UnboundedReceiver<QueueItem>,
    partial: Partial,
    owed: Owed,
}

/// Responses a timed-out step still owes, per topic
///
/// Each topic delivers in order, so the next `n` items on a topic that owes
/// `n` belong to steps that were already abandoned.
#[derive(Debug, Default)]
struct Owed {
    observation: u32,
    reward: u32,
    done: u32,
}

impl Owed {
    fn record(&mut self, partial: &Partial) {
        self.observation += u32::from(partial.observation.is_none());
        self.reward += u32::from(partial.reward.is_none());
        self.done += u32::from(partial.done.is_none());
    }
}

/// Consume one owed item if any are outstanding
fn settle(owed: &mut u32) -> bool {
    if *owed == 0 {
        return false;
    }
    *owed -= 1;
    true
}

impl StepInbox {
    /// Create the queues and the senders the demultiplexer routes into
    pub fn channel() -> (StepRoutes, Self) {
        let (obs_tx, observations) = mpsc::unbounded_channel();
        let (reward_tx, rewards) = mpsc::unbounded_channel();
        let (done_tx, dones) = mpsc::unbounded_channel();
        let routes = StepRoutes {
            observation: obs_tx,
            reward: reward_tx,
            done: done_tx,
        };
        let inbox = Self {
            observations,
            rewards,
            dones,
            partial: Partial::default(),
            owed: Owed::default(),
        };
        (routes, inbox)
    }

    /// Wait for the observation that opens an episode
    ///
    /// A late observation from an abandoned step is the agent's current
    /// state, so it is accepted here and settles that debt.
    pub async fn initial_observation(&mut self) -> Result<Vec<f32>, FleetError> {
        let observation = expect_observation(self.observations.recv().await)?;
        settle(&mut self.owed.observation);
        Ok(observation)
    }

    /// Collect one step's three responses, in whatever order they arrive
    ///
    /// Fails with [`FleetError::ProtocolViolation`] naming the missing topics
    /// if they are not all in within `timeout`. Responses received before the
    /// deadline are kept for [`StepInbox::resync`]; the missing ones are owed
    /// and discarded when they eventually arrive.
    pub async fn collect(&mut self, agent: AgentId, timeout: Duration) -> Result<StepResponse, FleetError> {
        let deadline = tokio::time::sleep_until(Instant::now() + timeout);
        tokio::pin!(deadline);

        loop {
            if let Some(response) = self.partial.take_complete() {
                return Ok(response);
            }

            tokio::select! {
                item = self.observations.recv(), if self.partial.observation.is_none() => {
                    if item.is_some() && settle(&mut self.owed.observation) {
                        debug!(%agent, "Discarding late observation");
                        continue;
                    }
                    self.partial.observation = Some(expect_observation(item)?);
                }
                item = self.rewards.recv(), if self.partial.reward.is_none() => {
                    if item.is_some() && settle(&mut self.owed.reward) {
                        debug!(%agent, "Discarding late reward");
                        continue;
                    }
                    self.partial.reward = Some(expect_reward(item)?);
                }
                item = self.dones.recv(), if self.partial.done.is_none() => {
                    if item.is_some() && settle(&mut self.owed.done) {
                        debug!(%agent, "Discarding late done");
                        continue;
                    }
                    self.partial.done = Some(expect_done(item)?);
                }
                _ = &mut deadline => {
                    let missing = self.partial.missing();
                    self.owed.record(&self.partial);
                    warn!(%agent, %missing, ?timeout, "Step responses timed out");
                    return Err(FleetError::ProtocolViolation {
                        agent,
                        missing,
                        waited: timeout,
                    });
                }
            }
        }
    }

    /// Discard partial and queued responses after a failed step
    ///
    /// Returns the most recent observation seen, which becomes the starting
    /// point of the next episode. Queued responses count against what the
    /// abandoned step owes; whatever is still owed is dropped on arrival.
    pub fn resync(&mut self) -> Option<Vec<f32>> {
        let mut latest = std::mem::take(&mut self.partial).observation;
        let mut dropped = 0;

        while let Ok(item) = self.observations.try_recv() {
            dropped += 1;
            settle(&mut self.owed.observation);
            if let Inbound::Observation(values) = item.value {
                latest = Some(values);
            }
        }
        while self.rewards.try_recv().is_ok() {
            dropped += 1;
            settle(&mut self.owed.reward);
        }
        while self.dones.try_recv().is_ok() {
            dropped += 1;
            settle(&mut self.owed.done);
        }

        debug!(
            dropped,
            has_observation = latest.is_some(),
            owed_reward = self.owed.reward,
            owed_done = self.owed.done,
            "StepInbox::resync"
        );
        latest
    }
}

fn unexpected(item: QueueItem, expected: &'static str) -> FleetError {
    FleetError::MalformedPayload {
        topic: item.key.topic(),
        source: PayloadError::invalid(expected, &format!("{:?}", item.value)),
    }
}

fn expect_observation(item: Option<QueueItem>) -> Result<Vec<f32>, FleetError> {
    match item {
        Some(QueueItem {
            value: Inbound::Observation(values),
            ..
        }) => Ok(values),
        Some(other) => Err(unexpected(other, "observation")),
        None => Err(FleetError::BusDisconnected),
    }
}

fn expect_reward(item: Option<QueueItem>) -> Result<f32, FleetError> {
    match item {
        Some(QueueItem {
            value: Inbound::Reward(reward),
            ..
        }) => Ok(reward),
        Some(other) => Err(unexpected(other, "reward")),
        None => Err(FleetError::BusDisconnected),
    }
}

fn expect_done(item: Option<QueueItem>) -> Result<bool, FleetError> {
    match item {
        Some(QueueItem {
            value: Inbound::Done(done),
            ..
        }) => Ok(done),
        Some(other) => Err(unexpected(other, "done")),
        None => Err(FleetError::BusDisconnected),
    }
}

/// Drives every episode for one agent
pub struct StepSynchronizer<A> {
    id: AgentId,
    transport: Arc<dyn Transport>,
    status: ReadinessGate,
    inbox: StepInbox,
    adapter: A,
    config: SessionConfig,
    cancel: watch::Receiver<bool>,
    barrier: Option<EpisodeBarrier>,
    store: Option<ResultStore>,
    metrics: Arc<FleetMetrics>,
}

impl<A: TrainingAdapter> StepSynchronizer<A> {
    pub fn new(
        id: AgentId,
        transport: Arc<dyn Transport>,
        status: ReadinessGate,
        inbox: StepInbox,
        adapter: A,
        config: SessionConfig,
        cancel: watch::Receiver<bool>,
    ) -> Self {
        debug!(%id, "StepSynchronizer::new: called");
        Self {
            id,
            transport,
            status,
            inbox,
            adapter,
            config,
            cancel,
            barrier: None,
            store: None,
            metrics: Arc::new(FleetMetrics::default()),
        }
    }

    /// Wait for an operator reset after every episode
    pub fn with_barrier(mut self, barrier: EpisodeBarrier) -> Self {
        self.barrier = Some(barrier);
        self
    }

    /// Persist results when the session ends
    pub fn with_store(mut self, store: ResultStore) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<FleetMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Run the session to completion or cancellation
    ///
    /// Results gathered so far are persisted on every exit path, then the
    /// agent's start gate is closed so it stops waiting for actions.
    pub async fn run(mut self) -> Result<AgentResults, FleetError> {
        info!(id = %self.id, episodes = self.config.episodes, "Session started");
        let mut results = AgentResults::new(self.id);
        let mut cancel = self.cancel.clone();

        let mut outcome = tokio::select! {
            outcome = self.drive(&mut results) => outcome,
            _ = cancel.wait_for(|c| *c) => {
                info!(id = %self.id, "Session cancelled");
                Ok(())
            }
        };

        if let Err(e) = &outcome {
            warn!(id = %self.id, error = %e, "Session ended with error");
        }

        let start_topic = TopicKey::agent(self.id, Channel::Start).topic();
        if let Err(e) = self.transport.publish_text(&start_topic, encode_flag(false), true).await {
            debug!(id = %self.id, error = %e, "Could not close start gate");
        }

        if let Some(store) = &self.store {
            if let Err(e) = store.save(&results).await {
                warn!(id = %self.id, error = %e, "Failed to persist results");
                if outcome.is_ok() {
                    outcome = Err(e);
                }
            }
        }

        info!(
            id = %self.id,
            recorded = results.episodes.len(),
            aborted = results.aborted_episodes,
            mean_reward = ?results.mean_reward(),
            "Session finished"
        );
        outcome.map(|_| results)
    }

    async fn drive(&mut self, results: &mut AgentResults) -> Result<(), FleetError> {
        self.wait_ready().await?;

        let start_topic = TopicKey::agent(self.id, Channel::Start).topic();
        self.transport.publish_text(&start_topic, encode_flag(true), true).await?;
        debug!(id = %self.id, "Start gate opened");

        let mut resumed: Option<Vec<f32>> = None;
        for episode in 0..self.config.episodes {
            let observation = match resumed.take() {
                Some(observation) => observation,
                None => self.inbox.initial_observation().await?,
            };

            match self.run_episode(episode, observation).await {
                Ok(record) => {
                    info!(
                        id = %self.id,
                        episode,
                        total_reward = record.total_reward,
                        steps = record.steps,
                        termination = %record.termination,
                        "Episode finished"
                    );
                    self.metrics.record_episode(record.termination);
                    self.adapter.end_episode();
                    results.episodes.push(record);

                    if let Some(barrier) = &self.barrier {
                        barrier.episode_finished(self.id, episode).await?;
                    }
                }
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    warn!(id = %self.id, episode, error = %e, "Episode aborted");
                    self.metrics.record_abort();
                    results.aborted_episodes += 1;
                    resumed = self.inbox.resync();
                }
            }
        }
        Ok(())
    }

    async fn run_episode(&mut self, episode: u32, mut observation: Vec<f32>) -> Result<EpisodeRecord, FleetError> {
        debug!(id = %self.id, episode, "StepSynchronizer::run_episode: called");
        let action_topic = TopicKey::agent(self.id, Channel::Action).topic();
        let timeout = self.config.step_timeout();
        let mut total_reward = 0.0;

        for step in 0..self.config.max_steps {
            let action = self.adapter.select_action(&observation);
            self.wait_ready().await?;
            self.transport.publish_text(&action_topic, &action.to_string(), false).await?;

            let response = self.inbox.collect(self.id, timeout).await?;
            let tuple = StepTuple {
                observation,
                action,
                reward: response.reward,
                next_observation: response.observation,
                done: response.done,
            };
            trace!(id = %self.id, episode, step, ?tuple, "Step assembled");
            self.adapter.update(&tuple);
            total_reward += f64::from(tuple.reward);

            if tuple.done {
                return Ok(EpisodeRecord::new(episode, total_reward, step + 1, Termination::Done));
            }
            observation = tuple.next_observation;
        }

        Ok(EpisodeRecord::new(
            episode,
            total_reward,
            self.config.max_steps,
            Termination::Timeout,
        ))
    }

    async fn wait_ready(&mut self) -> Result<(), FleetError> {
        if !self.status.is_set() {
            debug!(id = %self.id, "Waiting for agent readiness");
        }
        self.status.wait().await.map_err(|_| FleetError::BusDisconnected)
    }
}
