//! Fleet coordinator - wires the demultiplexer, allocator and sessions together

use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use topicbus::{BrokerHandle, BusClient, Inbox, LastWill, Transport};
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::error::FleetError;
use crate::mailbox::{DemuxExit, Demultiplexer, Route};
use crate::protocol::{ANNOUNCE_TOPIC, MASTER_STATUS_TOPIC, TopicKey, encode_flag};
use crate::results::ResultStore;
use crate::throttle::Throttle;

use super::allocator::{AllocatorExit, IndexAllocator};
use super::barrier::EpisodeBarrier;
use super::metrics::{FleetMetrics, FleetSnapshot};

/// Bus client ID the coordinator connects with
pub const COORDINATOR_CLIENT_ID: &str = "rlfleet-coordinator";

/// The central process: allocates identities and drives every agent's session
pub struct FleetCoordinator {
    config: Arc<Config>,
    transport: Arc<dyn Transport>,
    inbox: Inbox,
    /// Set when this coordinator opened the connection itself
    client: Option<BusClient>,
    metrics: Arc<FleetMetrics>,
    barrier: Option<EpisodeBarrier>,
    store: Option<ResultStore>,
}

impl FleetCoordinator {
    /// Create a coordinator over an existing connection
    pub fn new(config: Arc<Config>, transport: Arc<dyn Transport>, inbox: Inbox) -> Self {
        debug!("FleetCoordinator::new: called");
        Self {
            config,
            transport,
            inbox,
            client: None,
            metrics: Arc::new(FleetMetrics::default()),
            barrier: None,
            store: None,
        }
    }

    /// Connect to `broker` with a last will that clears the liveness beacon
    ///
    /// Publishes go through a [`Throttle`] configured from the bus section.
    pub async fn connect(broker: &BrokerHandle, config: Arc<Config>) -> Result<Self, FleetError> {
        debug!("FleetCoordinator::connect: called");
        let will = LastWill::new(MASTER_STATUS_TOPIC, encode_flag(false), true);
        let (client, inbox) = broker.connect(COORDINATOR_CLIENT_ID, Some(will)).await?;
        let transport = Throttle::new(client.clone(), config.bus.publish_rate, config.bus.publish_burst);
        let mut coordinator = Self::new(config, Arc::new(transport), inbox);
        coordinator.client = Some(client);
        Ok(coordinator)
    }

    /// Hold sessions at every episode end until `barrier`'s waiter confirms a reset
    pub fn with_barrier(mut self, barrier: EpisodeBarrier) -> Self {
        self.barrier = Some(barrier);
        self
    }

    /// Persist each session's results into `store`
    pub fn with_store(mut self, store: ResultStore) -> Self {
        self.store = Some(store);
        self
    }

    /// Shared counters, readable while the coordinator runs
    pub fn metrics(&self) -> Arc<FleetMetrics> {
        self.metrics.clone()
    }

    /// Run until `shutdown` becomes true or the bus connection is lost
    ///
    /// On either path every session is cancelled together and persists what
    /// it has. Losing the bus returns [`FleetError::BusDisconnected`] after
    /// that cleanup.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<FleetSnapshot, FleetError> {
        info!("FleetCoordinator starting");
        let buffer = self.config.bus.broker.channel_buffer;
        let (demux, demux_task) = Demultiplexer::spawn(self.inbox, buffer);

        let (announce_tx, mut announcements) = mpsc::unbounded_channel();
        demux.attach(TopicKey::Announce, Route::Queue(announce_tx)).await?;
        self.transport.subscribe(ANNOUNCE_TOPIC).await?;
        self.transport
            .publish_text(MASTER_STATUS_TOPIC, encode_flag(true), true)
            .await?;
        info!("Coordinator live");

        let mut allocator = IndexAllocator::new(
            self.config.clone(),
            self.transport.clone(),
            demux.clone(),
            self.metrics.clone(),
        )
        .with_barrier(self.barrier.clone())
        .with_store(self.store.clone());

        let exit = allocator.run(&mut announcements, &mut shutdown).await;
        match &exit {
            Ok(AllocatorExit::Shutdown) => info!("Shutdown requested"),
            Ok(AllocatorExit::AnnouncementsClosed) => error!("Announcement queue closed, bus lost"),
            Err(e) => error!(error = %e, "Allocator failed"),
        }

        allocator.shutdown().await;

        if let Err(e) = self
            .transport
            .publish_text(MASTER_STATUS_TOPIC, encode_flag(false), true)
            .await
        {
            warn!(error = %e, "Could not clear liveness beacon");
        }

        let demux_metrics = demux.metrics().await.unwrap_or_default();
        let snapshot = self.metrics.snapshot(&demux_metrics);
        drop(demux);
        drop(allocator);
        match demux_task.await {
            Ok(DemuxExit::Disconnected) => debug!("Demultiplexer saw disconnect"),
            Ok(DemuxExit::Released) => debug!("Demultiplexer released"),
            Err(e) => warn!(error = %e, "Demultiplexer task failed"),
        }

        if let Some(client) = self.client {
            if let Err(e) = client.disconnect().await {
                debug!(error = %e, "Disconnect after bus loss");
            }
        }

        info!(?snapshot, "FleetCoordinator stopped");
        match exit {
            Ok(AllocatorExit::Shutdown) => Ok(snapshot),
            Ok(AllocatorExit::AnnouncementsClosed) => Err(FleetError::BusDisconnected),
            Err(e) => Err(e),
        }
    }
}
