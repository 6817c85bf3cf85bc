//! Index allocator - consumes join/leave announcements one at a time
//!
//! Allocation happens inside a single task that finishes handling one
//! announcement before it takes the next, so two joins can never be handed
//! the same identity.

use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use topicbus::Transport;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::domain::{AgentId, JoinToken};
use crate::error::FleetError;
use crate::mailbox::{DemuxHandle, QueueItem, Route, readiness_flag};
use crate::policy::Policy;
use crate::protocol::{
    Announcement, Channel, INDEX_TOPIC, Inbound, IndexAssignment, TopicKey, encode_flag, encode_index,
};
use crate::results::ResultStore;

use super::barrier::EpisodeBarrier;
use super::metrics::FleetMetrics;
use super::roster::{Roster, SessionHandle, SessionOutcome};
use super::session::{StepInbox, StepSynchronizer};

/// Topics the coordinator subscribes to for every joined agent
const AGENT_CHANNELS: [Channel; 4] = [Channel::Observation, Channel::Reward, Channel::Done, Channel::Status];

/// Where the allocator is in its cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocatorState {
    Idle,
    AwaitingAnnouncement,
    Allocating,
}

/// Why the allocator loop returned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocatorExit {
    Shutdown,
    AnnouncementsClosed,
}

/// Hands out identities and owns the session roster
pub struct IndexAllocator {
    config: Arc<Config>,
    transport: Arc<dyn Transport>,
    demux: DemuxHandle,
    roster: Roster,
    /// None once every identity has been handed out
    next_id: Option<AgentId>,
    state: AllocatorState,
    metrics: Arc<FleetMetrics>,
    barrier: Option<EpisodeBarrier>,
    store: Option<ResultStore>,
}

impl IndexAllocator {
    pub fn new(
        config: Arc<Config>,
        transport: Arc<dyn Transport>,
        demux: DemuxHandle,
        metrics: Arc<FleetMetrics>,
    ) -> Self {
        debug!("IndexAllocator::new: called");
        Self {
            config,
            transport,
            demux,
            roster: Roster::new(),
            next_id: Some(AgentId::new(0)),
            state: AllocatorState::Idle,
            metrics,
            barrier: None,
            store: None,
        }
    }

    pub fn with_barrier(mut self, barrier: Option<EpisodeBarrier>) -> Self {
        self.barrier = barrier;
        self
    }

    pub fn with_store(mut self, store: Option<ResultStore>) -> Self {
        self.store = store;
        self
    }

    pub fn state(&self) -> AllocatorState {
        self.state
    }

    pub fn roster(&self) -> &Roster {
        &self.roster
    }

    /// Consume announcements until shutdown is signalled or the queue closes
    pub async fn run(
        &mut self,
        announcements: &mut mpsc::UnboundedReceiver<QueueItem>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<AllocatorExit, FleetError> {
        info!("IndexAllocator started");
        loop {
            self.state = AllocatorState::AwaitingAnnouncement;
            let item = tokio::select! {
                _ = shutdown.wait_for(|s| *s) => {
                    self.state = AllocatorState::Idle;
                    return Ok(AllocatorExit::Shutdown);
                }
                item = announcements.recv() => item,
            };

            let Some(item) = item else {
                self.state = AllocatorState::Idle;
                return Ok(AllocatorExit::AnnouncementsClosed);
            };

            let Inbound::Announcement(announcement) = item.value else {
                warn!(key = %item.key, "Ignoring non-announcement on announcement queue");
                continue;
            };

            self.state = AllocatorState::Allocating;
            let result = self.handle(announcement).await;
            self.state = AllocatorState::Idle;

            match result {
                Ok(()) => {}
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => warn!(error = %e, "Announcement failed"),
            }
        }
    }

    /// Apply one announcement
    pub async fn handle(&mut self, announcement: Announcement) -> Result<(), FleetError> {
        match announcement {
            Announcement::Join(token) => self.join(token).await.map(|_| ()),
            Announcement::Leave(id) => self.leave(id).await,
        }
    }

    /// Allocate an identity and launch its session
    pub async fn join(&mut self, token: Option<JoinToken>) -> Result<AgentId, FleetError> {
        let id = self.next_id.ok_or(FleetError::IdentitiesExhausted)?;
        self.next_id = id.next();
        info!(%id, has_token = token.is_some(), "Allocating identity");

        // Hold the agent until its session is ready to drive it
        let start_topic = TopicKey::agent(id, Channel::Start).topic();
        self.transport.publish_text(&start_topic, encode_flag(false), true).await?;

        let assignment = IndexAssignment { id, token };
        self.transport
            .publish_text(INDEX_TOPIC, &encode_index(&assignment), false)
            .await?;

        let (routes, inbox) = StepInbox::channel();
        let (status_setter, status_gate) = readiness_flag();
        self.demux
            .attach(TopicKey::agent(id, Channel::Observation), Route::Queue(routes.observation))
            .await?;
        self.demux
            .attach(TopicKey::agent(id, Channel::Reward), Route::Queue(routes.reward))
            .await?;
        self.demux
            .attach(TopicKey::agent(id, Channel::Done), Route::Queue(routes.done))
            .await?;
        self.demux
            .attach(TopicKey::agent(id, Channel::Status), Route::Flag(status_setter))
            .await?;
        for channel in AGENT_CHANNELS {
            self.transport.subscribe(&TopicKey::agent(id, channel).topic()).await?;
        }

        let policy = Policy::from_config(
            &self.config.policy,
            self.config.session.action_count,
            self.config.policy.seed_for(id.value()),
        );
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let mut session = StepSynchronizer::new(
            id,
            self.transport.clone(),
            status_gate,
            inbox,
            policy,
            self.config.session.clone(),
            cancel_rx,
        )
        .with_metrics(self.metrics.clone());
        if let Some(barrier) = &self.barrier {
            session = session.with_barrier(barrier.clone());
        }
        if let Some(store) = &self.store {
            session = session.with_store(store.clone());
        }

        let task = tokio::spawn(session.run());
        self.roster.insert(SessionHandle::new(id, cancel_tx, task));
        self.metrics.record_join();
        info!(%id, live = self.roster.len(), "Agent joined");
        Ok(id)
    }

    /// Tear down one agent; bare leave removes the most recent join
    pub async fn leave(&mut self, id: Option<AgentId>) -> Result<(), FleetError> {
        let Some(id) = id.or_else(|| self.roster.most_recent()) else {
            warn!("Leave announced with no live agents");
            return Ok(());
        };
        let Some(handle) = self.roster.remove(id) else {
            warn!(%id, "Leave announced for unknown agent");
            return Ok(());
        };
        info!(%id, "Agent leaving");

        let outcome = handle.cancel(self.config.session.shutdown_grace()).await;
        log_outcome(id, outcome);

        let removed = self.demux.detach_agent(id).await?;
        debug!(%id, removed, "Routes detached");
        for channel in AGENT_CHANNELS {
            self.transport.unsubscribe(&TopicKey::agent(id, channel).topic()).await?;
        }
        // Empty retained payload clears the start gate
        let start_topic = TopicKey::agent(id, Channel::Start).topic();
        self.transport.publish(&start_topic, Vec::new(), true).await?;

        self.metrics.record_leave();
        info!(%id, live = self.roster.len(), "Agent left");
        Ok(())
    }

    /// Cancel every session together
    pub async fn shutdown(&mut self) {
        let grace = self.config.session.shutdown_grace();
        for (id, outcome) in self.roster.cancel_all(grace).await {
            log_outcome(id, outcome);
            self.metrics.record_leave();
        }
    }
}

fn log_outcome(id: AgentId, outcome: Option<SessionOutcome>) {
    match outcome {
        Some(Ok(results)) => info!(
            %id,
            recorded = results.episodes.len(),
            aborted = results.aborted_episodes,
            "Session stopped"
        ),
        Some(Err(e)) => warn!(%id, error = %e, "Session stopped with error"),
        None => warn!(%id, "Session aborted"),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use topicbus::{Broker, BrokerConfig, BrokerHandle, Inbox, Message};

    use super::*;
    use crate::mailbox::Demultiplexer;
    use crate::policy::Algorithm;

    async fn allocator(broker: &BrokerHandle) -> (IndexAllocator, Arc<FleetMetrics>) {
        let (client, inbox) = broker.connect("coord", None).await.unwrap();
        let (demux, _task) = Demultiplexer::spawn(inbox, 16);

        let mut config = Config::default();
        config.session.shutdown_grace_ms = 500;
        config.policy.algorithm = Algorithm::Constant;
        config.policy.action = 1;

        let metrics = Arc::new(FleetMetrics::default());
        let allocator = IndexAllocator::new(Arc::new(config), Arc::new(client), demux, metrics.clone());
        (allocator, metrics)
    }

    async fn next(inbox: &mut Inbox) -> Message {
        tokio::time::timeout(Duration::from_secs(1), inbox.recv())
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn test_join_closes_start_then_publishes_index() {
        let (broker, _task) = Broker::spawn(BrokerConfig::default());
        let (watcher, mut watched) = broker.connect("watcher", None).await.unwrap();
        watcher.subscribe("agents/#").await.unwrap();
        let (mut allocator, metrics) = allocator(&broker).await;

        let token = JoinToken::generate();
        let id = allocator.join(Some(token.clone())).await.unwrap();
        assert_eq!(id, AgentId::new(0));

        let start = next(&mut watched).await;
        assert_eq!(start.topic, "agents/0/start");
        assert_eq!(start.payload_str().unwrap(), "0");

        let index = next(&mut watched).await;
        assert_eq!(index.topic, "agents/index");
        assert_eq!(index.payload_str().unwrap(), format!("0 {}", token));

        assert_eq!(allocator.roster().ids(), vec![AgentId::new(0)]);
        assert_eq!(metrics.live_agents(), 1);
        allocator.shutdown().await;
    }

    #[tokio::test]
    async fn test_identities_are_never_reused() {
        let (broker, _task) = Broker::spawn(BrokerConfig::default());
        let (mut allocator, metrics) = allocator(&broker).await;

        assert_eq!(allocator.join(None).await.unwrap(), AgentId::new(0));
        assert_eq!(allocator.join(None).await.unwrap(), AgentId::new(1));

        // Bare leave removes the most recent join
        allocator.leave(None).await.unwrap();
        assert_eq!(allocator.roster().ids(), vec![AgentId::new(0)]);

        assert_eq!(allocator.join(None).await.unwrap(), AgentId::new(2));
        assert_eq!(allocator.roster().ids(), vec![AgentId::new(0), AgentId::new(2)]);
        assert_eq!(metrics.live_agents(), 2);
        allocator.shutdown().await;
        assert_eq!(metrics.live_agents(), 0);
    }

    #[tokio::test]
    async fn test_leave_clears_retained_start() {
        let (broker, _task) = Broker::spawn(BrokerConfig::default());
        let (mut allocator, _metrics) = allocator(&broker).await;

        let id = allocator.join(None).await.unwrap();
        allocator.leave(Some(id)).await.unwrap();
        assert!(allocator.roster().is_empty());

        // Retained values are replayed before the subscribe is acknowledged
        let (late, mut late_inbox) = broker.connect("late", None).await.unwrap();
        late.subscribe("agents/+/start").await.unwrap();
        assert!(late_inbox.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_unknown_leave_is_ignored() {
        let (broker, _task) = Broker::spawn(BrokerConfig::default());
        let (mut allocator, metrics) = allocator(&broker).await;

        allocator.leave(None).await.unwrap();
        allocator.leave(Some(AgentId::new(9))).await.unwrap();
        allocator.join(None).await.unwrap();
        allocator.leave(Some(AgentId::new(9))).await.unwrap();
        assert_eq!(allocator.roster().len(), 1);
        assert_eq!(metrics.live_agents(), 1);
        allocator.shutdown().await;
    }

    #[tokio::test]
    async fn test_join_fails_once_identities_run_out() {
        let (broker, _task) = Broker::spawn(BrokerConfig::default());
        let (mut allocator, metrics) = allocator(&broker).await;
        allocator.next_id = Some(AgentId::new(u32::MAX));

        assert_eq!(allocator.join(None).await.unwrap(), AgentId::new(u32::MAX));
        let err = allocator.join(None).await.unwrap_err();
        assert!(matches!(err, FleetError::IdentitiesExhausted));
        assert!(!err.is_fatal());
        assert_eq!(metrics.live_agents(), 1);
        allocator.shutdown().await;
    }

    #[tokio::test]
    async fn test_run_serializes_announcements_and_stops_on_shutdown() {
        let (broker, _task) = Broker::spawn(BrokerConfig::default());
        let (mut allocator, _metrics) = allocator(&broker).await;

        let (tx, mut rx) = mpsc::unbounded_channel();
        for _ in 0..3 {
            tx.send(QueueItem::new(TopicKey::Announce, Inbound::Announcement(Announcement::Join(None))))
                .unwrap();
        }
        tx.send(QueueItem::new(TopicKey::Index, Inbound::Index(IndexAssignment { id: AgentId::new(7), token: None })))
            .unwrap();

        let (stop_tx, mut stop_rx) = watch::channel(false);
        let stopper = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            stop_tx.send(true).unwrap();
        });

        let exit = allocator.run(&mut rx, &mut stop_rx).await.unwrap();
        stopper.await.unwrap();
        assert_eq!(exit, AllocatorExit::Shutdown);
        assert_eq!(allocator.state(), AllocatorState::Idle);
        assert_eq!(
            allocator.roster().ids(),
            vec![AgentId::new(0), AgentId::new(1), AgentId::new(2)]
        );
        allocator.shutdown().await;
    }

    #[tokio::test]
    async fn test_run_reports_closed_queue() {
        let (broker, _task) = Broker::spawn(BrokerConfig::default());
        let (mut allocator, _metrics) = allocator(&broker).await;

        let (tx, mut rx) = mpsc::unbounded_channel::<QueueItem>();
        drop(tx);
        let (_stop_tx, mut stop_rx) = watch::channel(false);
        let exit = allocator.run(&mut rx, &mut stop_rx).await.unwrap();
        assert_eq!(exit, AllocatorExit::AnnouncementsClosed);
    }
}
