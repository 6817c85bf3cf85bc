//! Registry of running session tasks

use std::collections::BTreeMap;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::domain::{AgentId, AgentResults};
use crate::error::FleetError;

/// What a session task resolves to
pub type SessionOutcome = Result<AgentResults, FleetError>;

/// A running session and the means to stop it
#[derive(Debug)]
pub struct SessionHandle {
    id: AgentId,
    cancel: watch::Sender<bool>,
    task: JoinHandle<SessionOutcome>,
}

impl SessionHandle {
    pub fn new(id: AgentId, cancel: watch::Sender<bool>, task: JoinHandle<SessionOutcome>) -> Self {
        Self { id, cancel, task }
    }

    pub fn id(&self) -> AgentId {
        self.id
    }

    /// Ask the session to stop and wait for it to persist what it has
    ///
    /// A session that does not finish within `grace` is aborted. Returns
    /// None when the task was aborted or panicked.
    pub async fn cancel(self, grace: Duration) -> Option<SessionOutcome> {
        debug!(id = %self.id, "SessionHandle::cancel: called");
        let _ = self.cancel.send(true);

        let mut task = self.task;
        match tokio::time::timeout(grace, &mut task).await {
            Ok(Ok(outcome)) => Some(outcome),
            Ok(Err(e)) => {
                warn!(id = %self.id, error = %e, "Session task failed");
                None
            }
            Err(_) => {
                warn!(id = %self.id, ?grace, "Session did not stop in time, aborting");
                task.abort();
                None
            }
        }
    }
}

/// Live sessions keyed by identity
///
/// Identities are monotonic, so the highest key is the most recent join.
#[derive(Debug, Default)]
pub struct Roster {
    sessions: BTreeMap<AgentId, SessionHandle>,
}

impl Roster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, handle: SessionHandle) {
        debug!(id = %handle.id(), "Roster::insert: called");
        self.sessions.insert(handle.id(), handle);
    }

    pub fn remove(&mut self, id: AgentId) -> Option<SessionHandle> {
        self.sessions.remove(&id)
    }

    pub fn most_recent(&self) -> Option<AgentId> {
        self.sessions.keys().next_back().copied()
    }

    pub fn ids(&self) -> Vec<AgentId> {
        self.sessions.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Cancel every session together and wait for all of them
    pub async fn cancel_all(&mut self, grace: Duration) -> Vec<(AgentId, Option<SessionOutcome>)> {
        let sessions = std::mem::take(&mut self.sessions);
        info!(count = sessions.len(), "Cancelling all sessions");

        // Signal everyone first so they wind down concurrently
        for handle in sessions.values() {
            let _ = handle.cancel.send(true);
        }

        let mut outcomes = Vec::with_capacity(sessions.len());
        for (id, handle) in sessions {
            outcomes.push((id, handle.cancel(grace).await));
        }
        outcomes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spawn_session(id: u32) -> SessionHandle {
        let id = AgentId::new(id);
        let (cancel, mut rx) = watch::channel(false);
        let task = tokio::spawn(async move {
            let _ = rx.wait_for(|c| *c).await;
            Ok(AgentResults::new(id))
        });
        SessionHandle::new(id, cancel, task)
    }

    #[tokio::test]
    async fn test_most_recent_and_remove() {
        let mut roster = Roster::new();
        assert!(roster.most_recent().is_none());

        roster.insert(spawn_session(0));
        roster.insert(spawn_session(1));
        roster.insert(spawn_session(2));
        assert_eq!(roster.most_recent(), Some(AgentId::new(2)));

        let handle = roster.remove(AgentId::new(2)).unwrap();
        let outcome = handle.cancel(Duration::from_secs(1)).await.unwrap().unwrap();
        assert_eq!(outcome.agent, AgentId::new(2));
        assert_eq!(roster.most_recent(), Some(AgentId::new(1)));
        assert!(!roster.ids().contains(&AgentId::new(2)));
    }

    #[tokio::test]
    async fn test_cancel_all() {
        let mut roster = Roster::new();
        for id in 0..3 {
            roster.insert(spawn_session(id));
        }

        let outcomes = roster.cancel_all(Duration::from_secs(1)).await;
        assert_eq!(outcomes.len(), 3);
        assert!(outcomes.iter().all(|(_, o)| matches!(o, Some(Ok(_)))));
        assert!(roster.is_empty());
    }

    #[tokio::test]
    async fn test_stuck_session_is_aborted() {
        let id = AgentId::new(9);
        let (cancel, _rx) = watch::channel(false);
        let task = tokio::spawn(std::future::pending::<SessionOutcome>());
        let handle = SessionHandle::new(id, cancel, task);
        assert!(handle.cancel(Duration::from_millis(20)).await.is_none());
    }
}
