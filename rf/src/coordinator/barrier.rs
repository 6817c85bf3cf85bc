//! Hybrid-mode episode barrier
//!
//! After every recorded episode a session hands a [`ResetRequest`] to the
//! [`ResetWaiter`] and stops publishing actions until the request is
//! answered. Taking a request off the channel is the "done" acknowledgement;
//! answering it is the reset. The waiter serves one request at a time, so an
//! operator confirmation releases exactly one agent.

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines, Stdin};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::domain::AgentId;
use crate::error::FleetError;

/// One session blocked at an episode boundary
#[derive(Debug)]
pub struct ResetRequest {
    pub agent: AgentId,
    pub episode: u32,
    reset: oneshot::Sender<()>,
}

/// Session-side handle
#[derive(Debug, Clone)]
pub struct EpisodeBarrier {
    tx: mpsc::Sender<ResetRequest>,
}

impl EpisodeBarrier {
    /// Create a barrier and the waiter that serves it
    pub fn new(buffer: usize) -> (Self, ResetWaiter) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        (Self { tx }, ResetWaiter { rx })
    }

    /// Report a finished episode and wait for the operator's reset
    pub async fn episode_finished(&self, agent: AgentId, episode: u32) -> Result<(), FleetError> {
        debug!(%agent, episode, "EpisodeBarrier::episode_finished: called");
        let (reset, rx) = oneshot::channel();
        self.tx
            .send(ResetRequest { agent, episode, reset })
            .await
            .map_err(|_| FleetError::ResetAbandoned(agent))?;
        rx.await.map_err(|_| FleetError::ResetAbandoned(agent))?;
        debug!(%agent, episode, "EpisodeBarrier::episode_finished: reset received");
        Ok(())
    }
}

/// Source of reset confirmations
#[async_trait]
pub trait Operator: Send {
    /// Return once the reset for `agent` is confirmed; an error abandons it
    async fn confirm_reset(&mut self, agent: AgentId, episode: u32) -> eyre::Result<()>;
}

/// Confirms every reset immediately
#[derive(Debug, Default, Clone, Copy)]
pub struct AutoOperator;

#[async_trait]
impl Operator for AutoOperator {
    async fn confirm_reset(&mut self, _agent: AgentId, _episode: u32) -> eyre::Result<()> {
        Ok(())
    }
}

/// Asks a human on stdin to press Enter once the physical system is reset
pub struct StdinOperator {
    lines: Lines<BufReader<Stdin>>,
}

impl StdinOperator {
    pub fn new() -> Self {
        Self {
            lines: BufReader::new(tokio::io::stdin()).lines(),
        }
    }
}

impl Default for StdinOperator {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Operator for StdinOperator {
    async fn confirm_reset(&mut self, agent: AgentId, episode: u32) -> eyre::Result<()> {
        let prompt = format!(
            "Agent {} finished episode {}. Reset the environment and press Enter: ",
            agent, episode
        );
        let mut stdout = tokio::io::stdout();
        stdout.write_all(prompt.as_bytes()).await?;
        stdout.flush().await?;

        match self.lines.next_line().await? {
            Some(_) => Ok(()),
            None => Err(eyre::eyre!("stdin closed")),
        }
    }
}

/// Serves reset requests one at a time
pub struct ResetWaiter {
    rx: mpsc::Receiver<ResetRequest>,
}

impl ResetWaiter {
    /// Run until every barrier handle is dropped or the operator fails
    ///
    /// Returns the number of resets confirmed.
    pub async fn run<O: Operator>(mut self, mut operator: O) -> u64 {
        info!("ResetWaiter started");
        let mut confirmed = 0;

        while let Some(request) = self.rx.recv().await {
            debug!(agent = %request.agent, episode = request.episode, "Episode done acknowledged");

            if let Err(e) = operator.confirm_reset(request.agent, request.episode).await {
                warn!(agent = %request.agent, error = %e, "Operator did not confirm reset, abandoning pending resets");
                // Dropping the request and the receiver fails every waiting session
                break;
            }

            if request.reset.send(()).is_ok() {
                confirmed += 1;
                info!(agent = %request.agent, episode = request.episode, "Reset confirmed");
            } else {
                debug!(agent = %request.agent, "Session gone before reset");
            }
        }

        info!(confirmed, "ResetWaiter stopped");
        confirmed
    }
}
