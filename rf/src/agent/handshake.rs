//! Join handshake - how an agent obtains its identity
//!
//! The coordinator's allocator is the only authority on uniqueness. The
//! optional [`JoinGate`] just keeps agents that share a process from
//! announcing at the same moment.

use std::sync::Arc;

use topicbus::Transport;
use tracing::{debug, info};

use crate::domain::{AgentId, JoinToken};
use crate::error::FleetError;
use crate::mailbox::{DemuxHandle, Mailbox, MailboxSender, ReadinessGate, Route, readiness_flag};
use crate::protocol::{
    ANNOUNCE_TOPIC, Announcement, Channel, INDEX_TOPIC, Inbound, TopicKey, encode_announcement, encode_flag,
};

/// Mutual exclusion for agents joining from one process
#[derive(Debug, Clone, Default)]
pub struct JoinGate(Arc<tokio::sync::Mutex<()>>);

impl JoinGate {
    pub fn new() -> Self {
        Self::default()
    }
}

/// What a successful handshake yields
#[derive(Debug)]
pub struct Joined {
    pub id: AgentId,
    /// Start gate published by the coordinator for this identity
    pub start: ReadinessGate,
}

/// Announce, wait for our identity and wire up the per-identity topics
///
/// The index topic must already be routed into `mailbox` via `queue`.
/// Index publications meant for other joiners are discarded.
pub async fn join(
    transport: &dyn Transport,
    demux: &DemuxHandle,
    queue: &MailboxSender,
    mailbox: &mut Mailbox,
    gate: Option<&JoinGate>,
    token: Option<JoinToken>,
) -> Result<Joined, FleetError> {
    debug!(has_token = token.is_some(), "join: called");
    transport.subscribe(INDEX_TOPIC).await?;

    let _guard = match gate {
        Some(gate) => Some(gate.0.lock().await),
        None => None,
    };

    let announcement = Announcement::Join(token.clone());
    transport
        .publish_text(ANNOUNCE_TOPIC, &encode_announcement(&announcement), false)
        .await?;

    let id = loop {
        match mailbox.take(&TopicKey::Index).await {
            Some(Inbound::Index(assignment)) if assignment.is_for(token.as_ref()) => break assignment.id,
            Some(Inbound::Index(assignment)) => {
                debug!(id = %assignment.id, "Discarding index for another agent");
            }
            Some(other) => debug!(?other, "Ignoring unexpected value on index topic"),
            None => return Err(FleetError::BusDisconnected),
        }
    };

    transport.unsubscribe(INDEX_TOPIC).await?;
    let stale = mailbox.discard(|item| item.key == TopicKey::Index);
    if stale > 0 {
        debug!(stale, "Dropped queued index publications");
    }

    let (start_setter, start) = readiness_flag();
    demux
        .attach(TopicKey::agent(id, Channel::Action), Route::Queue(queue.clone()))
        .await?;
    demux
        .attach(TopicKey::agent(id, Channel::Start), Route::Flag(start_setter))
        .await?;
    transport.subscribe(&TopicKey::agent(id, Channel::Action).topic()).await?;
    transport.subscribe(&TopicKey::agent(id, Channel::Start).topic()).await?;

    let status_topic = TopicKey::agent(id, Channel::Status).topic();
    transport.publish_text(&status_topic, encode_flag(true), true).await?;

    info!(%id, "Joined fleet");
    Ok(Joined { id, start })
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use topicbus::{Broker, BrokerConfig};

    use super::*;
    use crate::mailbox::{Demultiplexer, mailbox};

    #[tokio::test]
    async fn test_join_ignores_foreign_index() {
        let (broker, _task) = Broker::spawn(BrokerConfig::default());
        let (coord, mut coord_inbox) = broker.connect("coord", None).await.unwrap();
        coord.subscribe(ANNOUNCE_TOPIC).await.unwrap();
        coord.subscribe("agents/+/status").await.unwrap();

        let (client, inbox) = broker.connect("agent", None).await.unwrap();
        let (demux, _task) = Demultiplexer::spawn(inbox, 16);
        let (queue, mut mb) = mailbox();
        demux.attach(TopicKey::Index, Route::Queue(queue.clone())).await.unwrap();

        let responder = tokio::spawn(async move {
            let announce = coord_inbox.recv().await.unwrap();
            let text = announce.payload_str().unwrap().to_string();
            let token = text.strip_prefix("1 ").unwrap().to_string();
            coord.publish_text(INDEX_TOPIC, "5 someone-else", false).await.unwrap();
            coord.publish_text(INDEX_TOPIC, &format!("3 {}", token), false).await.unwrap();
            let status = coord_inbox.recv().await.unwrap();
            (text, status)
        });

        let token = JoinToken::generate();
        let joined = tokio::time::timeout(
            Duration::from_secs(2),
            join(&client, &demux, &queue, &mut mb, None, Some(token.clone())),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(joined.id, AgentId::new(3));
        assert!(!joined.start.is_set());
        assert_eq!(mb.pending_len(), 0);

        let (announce, status) = responder.await.unwrap();
        assert_eq!(announce, format!("1 {}", token));
        assert_eq!(status.topic, "agents/3/status");
        assert_eq!(status.payload_str().unwrap(), "1");
    }

    #[tokio::test]
    async fn test_join_gate_serializes() {
        let gate = JoinGate::new();
        let held = gate.0.clone().lock_owned().await;

        let other = gate.clone();
        let waiter = tokio::spawn(async move {
            let _guard = other.0.lock().await;
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        drop(held);
        tokio::time::timeout(Duration::from_secs(1), waiter).await.unwrap().unwrap();
    }
}
