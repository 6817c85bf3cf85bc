//! Ordered mailbox with selective retrieval
//!
//! Several semantic channels can share one physical queue. A consumer asks
//! for the first item on a given channel; items for other channels are
//! buffered and handed out later in their original order.

use std::collections::VecDeque;

use tokio::sync::mpsc;
use tracing::trace;

use crate::protocol::{Inbound, TopicKey};

/// One decoded delivery waiting in a queue
#[derive(Debug, Clone, PartialEq)]
pub struct QueueItem {
    pub key: TopicKey,
    pub value: Inbound,
}

impl QueueItem {
    pub fn new(key: TopicKey, value: Inbound) -> Self {
        Self { key, value }
    }
}

/// Sending side of a mailbox, held by the demultiplexer
pub type MailboxSender = mpsc::UnboundedSender<QueueItem>;

/// Create an empty mailbox and its sender
pub fn mailbox() -> (MailboxSender, Mailbox) {
    let (tx, rx) = mpsc::unbounded_channel();
    (tx, Mailbox::new(rx))
}

/// Single-consumer ordered queue
///
/// Retrieval takes `&mut self`, so two tasks can never race to pull items
/// from the same mailbox.
#[derive(Debug)]
pub struct Mailbox {
    rx: mpsc::UnboundedReceiver<QueueItem>,
    pending: VecDeque<QueueItem>,
}

impl Mailbox {
    pub fn new(rx: mpsc::UnboundedReceiver<QueueItem>) -> Self {
        Self {
            rx,
            pending: VecDeque::new(),
        }
    }

    /// Wait for the first item on `key`
    ///
    /// Returns None once the sender side has gone away and nothing matching
    /// remains buffered.
    pub async fn take(&mut self, key: &TopicKey) -> Option<Inbound> {
        self.take_matching(|item| item.key == *key).await.map(|item| item.value)
    }

    /// Wait for the first item satisfying `pred`
    pub async fn take_matching(&mut self, mut pred: impl FnMut(&QueueItem) -> bool) -> Option<QueueItem> {
        if let Some(item) = self.take_buffered(&mut pred) {
            return Some(item);
        }

        while let Some(item) = self.rx.recv().await {
            if pred(&item) {
                return Some(item);
            }
            trace!(key = %item.key, pending = self.pending.len() + 1, "Mailbox: buffering non-matching item");
            self.pending.push_back(item);
        }
        None
    }

    /// Take the first buffered or already-queued item satisfying `pred` without waiting
    pub fn try_take_matching(&mut self, mut pred: impl FnMut(&QueueItem) -> bool) -> Option<QueueItem> {
        self.pull_ready();
        self.take_buffered(&mut pred)
    }

    /// Remove every buffered or already-queued item satisfying `pred`
    ///
    /// Returns how many items were dropped.
    pub fn discard(&mut self, mut pred: impl FnMut(&QueueItem) -> bool) -> usize {
        self.pull_ready();
        let before = self.pending.len();
        self.pending.retain(|item| !pred(item));
        before - self.pending.len()
    }

    /// Items currently buffered, oldest first
    pub fn pending(&self) -> impl Iterator<Item = &QueueItem> {
        self.pending.iter()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    fn take_buffered(&mut self, pred: &mut impl FnMut(&QueueItem) -> bool) -> Option<QueueItem> {
        let pos = self.pending.iter().position(|item| pred(item))?;
        self.pending.remove(pos)
    }

    fn pull_ready(&mut self) {
        while let Ok(item) = self.rx.try_recv() {
            self.pending.push_back(item);
        }
    }
}
