//! Message routing between a bus connection and its consumers
//!
//! - [`Demultiplexer`]: the one task reading a connection's inbox
//! - [`Mailbox`]: ordered queue with selective retrieval by topic
//! - [`ReadinessGate`]: level-triggered flag fed by status-class topics

mod demux;
mod readiness;
mod selective;

pub use demux::{DemuxCommand, DemuxExit, DemuxHandle, DemuxMetrics, Demultiplexer, Route};
pub use readiness::{GateClosed, ReadinessGate, ReadinessSetter, readiness_flag};
pub use selective::{Mailbox, MailboxSender, QueueItem, mailbox};
