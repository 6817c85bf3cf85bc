//! Fleet-wide counters shared by the allocator and session tasks

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use crate::domain::Termination;
use crate::mailbox::DemuxMetrics;

/// Counters updated concurrently by coordinator tasks
#[derive(Debug, Default)]
pub struct FleetMetrics {
    live_agents: AtomicU64,
    agents_joined: AtomicU64,
    agents_left: AtomicU64,
    episodes_completed: AtomicU64,
    episodes_timed_out: AtomicU64,
    episodes_aborted: AtomicU64,
}

impl FleetMetrics {
    pub fn record_join(&self) {
        self.agents_joined.fetch_add(1, Ordering::Relaxed);
        self.live_agents.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_leave(&self) {
        self.agents_left.fetch_add(1, Ordering::Relaxed);
        self.live_agents.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn record_episode(&self, termination: Termination) {
        match termination {
            Termination::Done => self.episodes_completed.fetch_add(1, Ordering::Relaxed),
            Termination::Timeout => self.episodes_timed_out.fetch_add(1, Ordering::Relaxed),
        };
    }

    pub fn record_abort(&self) {
        self.episodes_aborted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn live_agents(&self) -> u64 {
        self.live_agents.load(Ordering::Relaxed)
    }

    /// Point-in-time copy, merged with the demultiplexer's delivery counters
    pub fn snapshot(&self, demux: &DemuxMetrics) -> FleetSnapshot {
        FleetSnapshot {
            live_agents: self.live_agents.load(Ordering::Relaxed),
            agents_joined: self.agents_joined.load(Ordering::Relaxed),
            agents_left: self.agents_left.load(Ordering::Relaxed),
            episodes_completed: self.episodes_completed.load(Ordering::Relaxed),
            episodes_timed_out: self.episodes_timed_out.load(Ordering::Relaxed),
            episodes_aborted: self.episodes_aborted.load(Ordering::Relaxed),
            deliveries: demux.delivered,
            malformed_payloads: demux.malformed,
            unroutable_deliveries: demux.unroutable,
        }
    }
}

/// Fleet metrics at one point in time
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct FleetSnapshot {
    pub live_agents: u64,
    pub agents_joined: u64,
    pub agents_left: u64,
    pub episodes_completed: u64,
    pub episodes_timed_out: u64,
    pub episodes_aborted: u64,
    pub deliveries: u64,
    pub malformed_payloads: u64,
    pub unroutable_deliveries: u64,
}
