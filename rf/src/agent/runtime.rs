//! Agent runtime - joins a fleet and serves actions from an environment

use std::sync::Arc;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use tokio::task::JoinHandle;
use topicbus::{BrokerHandle, BusClient, Inbox, Transport};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::domain::{AgentId, AgentResults, EpisodeRecord, JoinToken, Termination};
use crate::error::FleetError;
use crate::mailbox::{
    DemuxExit, DemuxHandle, Demultiplexer, Mailbox, ReadinessGate, Route, mailbox, readiness_flag,
};
use crate::policy::seeded_rng;
use crate::protocol::{
    ANNOUNCE_TOPIC, Announcement, Channel, Inbound, MASTER_STATUS_TOPIC, TopicKey, encode_announcement,
    encode_done, encode_flag, encode_observation, encode_reward,
};
use crate::throttle::Throttle;

use super::env::Environment;
use super::handshake::{self, JoinGate, Joined};

/// Knobs for one agent, usually derived from [`Config`]
#[derive(Debug, Clone)]
pub struct AgentSettings {
    pub episodes: u32,
    /// Must match the coordinator's step ceiling
    pub max_steps: u32,
    pub shuffle_responses: bool,
    /// Send a join token so concurrent joiners cannot take each other's index
    pub use_token: bool,
    pub publish_rate: f64,
    pub publish_burst: u32,
    pub seed: Option<u64>,
    /// How long to wait for the coordinator to close the start gate after the last episode
    pub linger: Duration,
}

impl AgentSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            episodes: config.session.episodes,
            max_steps: config.session.max_steps,
            shuffle_responses: config.sim.shuffle_responses,
            use_token: true,
            publish_rate: config.bus.publish_rate,
            publish_burst: config.bus.publish_burst,
            seed: config.policy.seed,
            linger: config.session.step_timeout(),
        }
    }
}

/// Why the episode loop stopped early
enum Stop {
    /// The coordinator closed our start gate
    Released,
}

/// One agent: owns its connection, its environment and its results
pub struct AgentRuntime<E> {
    transport: Arc<dyn Transport>,
    inbox: Inbox,
    client: Option<BusClient>,
    env: E,
    settings: AgentSettings,
    gate: Option<JoinGate>,
    rng: StdRng,
    buffer: usize,
}

impl<E: Environment> AgentRuntime<E> {
    pub fn new(transport: Arc<dyn Transport>, inbox: Inbox, env: E, settings: AgentSettings) -> Self {
        debug!("AgentRuntime::new: called");
        let rng = seeded_rng(settings.seed);
        Self {
            transport,
            inbox,
            client: None,
            env,
            settings,
            gate: None,
            rng,
            buffer: 64,
        }
    }

    /// Open a throttled connection to `broker` as `client_id`
    pub async fn connect(
        broker: &BrokerHandle,
        client_id: &str,
        env: E,
        settings: AgentSettings,
    ) -> Result<Self, FleetError> {
        debug!(%client_id, "AgentRuntime::connect: called");
        let (client, inbox) = broker.connect(client_id, None).await?;
        let transport = Throttle::new(client.clone(), settings.publish_rate, settings.publish_burst);
        let mut runtime = Self::new(Arc::new(transport), inbox, env, settings);
        runtime.client = Some(client);
        Ok(runtime)
    }

    /// Serialize this agent's join with others holding the same gate
    pub fn with_join_gate(mut self, gate: JoinGate) -> Self {
        self.gate = Some(gate);
        self
    }

    /// Join, run the configured episodes and leave
    ///
    /// Stops early when the coordinator closes the start gate.
    pub async fn run(mut self) -> Result<AgentResults, FleetError> {
        let (demux, demux_task) = Demultiplexer::spawn(self.inbox, self.buffer);
        let (queue, mut mailbox) = mailbox();
        let (master_setter, mut master) = readiness_flag();

        demux.attach(TopicKey::Index, Route::Queue(queue.clone())).await?;
        demux.attach(TopicKey::MasterStatus, Route::Flag(master_setter)).await?;
        self.transport.subscribe(MASTER_STATUS_TOPIC).await?;

        if !master.is_set() {
            info!("Waiting for coordinator");
        }
        master.wait().await.map_err(|_| FleetError::BusDisconnected)?;

        let token = self.settings.use_token.then(JoinToken::generate);
        let Joined { id, mut start } = handshake::join(
            self.transport.as_ref(),
            &demux,
            &queue,
            &mut mailbox,
            self.gate.as_ref(),
            token,
        )
        .await?;
        drop(queue);

        let mut episodes = EpisodeLoop {
            id,
            transport: self.transport.clone(),
            mailbox: &mut mailbox,
            start: &mut start,
            master: &mut master,
            env: &mut self.env,
            settings: &self.settings,
            rng: &mut self.rng,
        };
        let mut results = AgentResults::new(id);
        let outcome = episodes.run(&mut results).await;
        if let Err(e) = &outcome {
            warn!(%id, error = %e, "Agent stopped with error");
        }

        leave(self.transport.as_ref(), id).await;
        release(demux, demux_task).await;
        if let Some(client) = self.client {
            if let Err(e) = client.disconnect().await {
                debug!(%id, error = %e, "Disconnect failed");
            }
        }

        info!(%id, episodes = results.episodes.len(), mean_reward = ?results.mean_reward(), "Agent finished");
        outcome.map(|_| results)
    }
}

struct EpisodeLoop<'a, E> {
    id: AgentId,
    transport: Arc<dyn Transport>,
    mailbox: &'a mut Mailbox,
    start: &'a mut ReadinessGate,
    master: &'a mut ReadinessGate,
    env: &'a mut E,
    settings: &'a AgentSettings,
    rng: &'a mut StdRng,
}

impl<E: Environment> EpisodeLoop<'_, E> {
    async fn run(&mut self, results: &mut AgentResults) -> Result<(), FleetError> {
        self.start.wait().await.map_err(|_| FleetError::BusDisconnected)?;
        info!(id = %self.id, "Start gate open");

        for episode in 0..self.settings.episodes {
            if !self.start.is_set() {
                info!(id = %self.id, episode, "Coordinator finished with us");
                return Ok(());
            }
            match self.episode(episode).await? {
                Ok(record) => {
                    debug!(id = %self.id, episode, steps = record.steps, "Episode done");
                    results.episodes.push(record);
                }
                Err(Stop::Released) => {
                    info!(id = %self.id, episode, "Start gate closed mid-episode");
                    return Ok(());
                }
            }
        }

        // Leaving cancels our session, so give it time to record the last step
        match tokio::time::timeout(self.settings.linger, self.start.wait_cleared()).await {
            Ok(Ok(())) => debug!(id = %self.id, "Session closed start gate"),
            Ok(Err(_)) => return Err(FleetError::BusDisconnected),
            Err(_) => debug!(id = %self.id, "Start gate still open, leaving anyway"),
        }
        Ok(())
    }

    async fn episode(&mut self, episode: u32) -> Result<Result<EpisodeRecord, Stop>, FleetError> {
        debug!(id = %self.id, episode, "EpisodeLoop::episode: called");
        let action_key = TopicKey::agent(self.id, Channel::Action);
        let obv_topic = TopicKey::agent(self.id, Channel::Observation).topic();
        let reward_topic = TopicKey::agent(self.id, Channel::Reward).topic();
        let done_topic = TopicKey::agent(self.id, Channel::Done).topic();

        let observation = self.env.reset();
        self.wait_master().await?;
        self.transport
            .publish_text(&obv_topic, &encode_observation(&observation), false)
            .await?;

        let mut total_reward = 0.0;
        let mut steps = 0;
        while steps < self.settings.max_steps {
            let action = tokio::select! {
                biased;
                item = self.mailbox.take(&action_key) => match item {
                    Some(Inbound::Action(action)) => action,
                    Some(other) => {
                        warn!(id = %self.id, ?other, "Unexpected value on action topic");
                        continue;
                    }
                    None => return Err(FleetError::BusDisconnected),
                },
                closed = self.start.wait_cleared() => {
                    closed.map_err(|_| FleetError::BusDisconnected)?;
                    return Ok(Err(Stop::Released));
                }
            };

            let transition = self.env.step(action);
            steps += 1;
            total_reward += f64::from(transition.reward);

            let mut responses = vec![
                (&obv_topic, encode_observation(&transition.observation)),
                (&reward_topic, encode_reward(transition.reward)),
                (&done_topic, encode_done(transition.done).to_string()),
            ];
            if self.settings.shuffle_responses {
                responses.shuffle(&mut *self.rng);
            }

            self.wait_master().await?;
            for (topic, payload) in responses {
                self.transport.publish_text(topic, &payload, false).await?;
            }

            if transition.done {
                return Ok(Ok(EpisodeRecord::new(episode, total_reward, steps, Termination::Done)));
            }
        }

        Ok(Ok(EpisodeRecord::new(
            episode,
            total_reward,
            self.settings.max_steps,
            Termination::Timeout,
        )))
    }

    /// Block while the coordinator's liveness beacon is down
    async fn wait_master(&mut self) -> Result<(), FleetError> {
        if !self.master.is_set() {
            info!(id = %self.id, "Coordinator offline, pausing");
        }
        self.master.wait().await.map_err(|_| FleetError::BusDisconnected)
    }
}

/// Clear our readiness and announce the leave
async fn leave(transport: &dyn Transport, id: AgentId) {
    let status_topic = TopicKey::agent(id, Channel::Status).topic();
    if let Err(e) = transport.publish_text(&status_topic, encode_flag(false), true).await {
        debug!(%id, error = %e, "Could not clear status");
    }
    let leave = encode_announcement(&Announcement::Leave(Some(id)));
    if let Err(e) = transport.publish_text(ANNOUNCE_TOPIC, &leave, false).await {
        debug!(%id, error = %e, "Could not announce leave");
    }
}

async fn release(demux: DemuxHandle, task: JoinHandle<DemuxExit>) {
    drop(demux);
    match task.await {
        Ok(exit) => debug!(?exit, "Agent demultiplexer stopped"),
        Err(e) => warn!(error = %e, "Agent demultiplexer task failed"),
    }
}
