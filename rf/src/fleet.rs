//! In-process fleet: broker, coordinator and simulated agents in one runtime

use std::sync::Arc;

use eyre::{Context, Result};
use tokio::sync::watch;
use tokio::task::JoinSet;
use topicbus::Broker;
use tracing::{debug, info, warn};

use crate::agent::{AgentRuntime, AgentSettings, Corridor, JoinGate};
use crate::config::{Config, SessionMode};
use crate::coordinator::{EpisodeBarrier, FleetCoordinator, FleetSnapshot, Operator};
use crate::domain::AgentResults;
use crate::error::FleetError;
use crate::results::ResultStore;

/// What a local fleet run produced
#[derive(Debug)]
pub struct FleetOutcome {
    pub snapshot: FleetSnapshot,
    /// Agent-side records, in completion order
    pub agents: Vec<AgentResults>,
    /// Agents that stopped with an error or were aborted
    pub failed: usize,
    /// True when the run ended on the shutdown signal
    pub interrupted: bool,
}

/// Run a broker, a coordinator and `config.sim.agents` corridor agents
///
/// Returns once every agent has left or `shutdown` turns true. In hybrid
/// mode `operator` confirms each episode reset.
pub async fn run_local_fleet<O>(
    config: Arc<Config>,
    operator: O,
    mut shutdown: watch::Receiver<bool>,
) -> Result<FleetOutcome>
where
    O: Operator + 'static,
{
    info!(
        agents = config.sim.agents,
        episodes = config.session.episodes,
        mode = ?config.session.mode,
        "Starting local fleet"
    );
    let (broker, broker_task) = Broker::spawn(config.bus.broker.clone());

    let mut coordinator = FleetCoordinator::connect(&broker, config.clone())
        .await
        .context("Failed to connect coordinator")?
        .with_store(ResultStore::new(config.results.dir.clone()));

    let waiter_task = match config.session.mode {
        SessionMode::Hybrid => {
            let (barrier, waiter) = EpisodeBarrier::new(config.sim.agents.max(1) as usize);
            coordinator = coordinator.with_barrier(barrier);
            Some(tokio::spawn(waiter.run(operator)))
        }
        SessionMode::Simulation => None,
    };

    let (stop_tx, stop_rx) = watch::channel(false);
    let coordinator_task = tokio::spawn(coordinator.run(stop_rx));

    let gate = config.sim.serialize_joins.then(JoinGate::new);
    let settings = AgentSettings::from_config(&config);
    let mut agents = JoinSet::new();
    for n in 0..config.sim.agents {
        let client_id = format!("rlfleet-sim-{}", n);
        let mut agent_settings = settings.clone();
        agent_settings.seed = settings.seed.map(|s| s.wrapping_add(1000 + u64::from(n)));
        let mut runtime = AgentRuntime::connect(
            &broker,
            &client_id,
            Corridor::new(config.sim.corridor_length),
            agent_settings,
        )
        .await
        .context(format!("Failed to connect {}", client_id))?;
        if let Some(gate) = &gate {
            runtime = runtime.with_join_gate(gate.clone());
        }
        agents.spawn(runtime.run());
    }

    let mut collected = Collected::default();
    let interrupted = loop {
        tokio::select! {
            joined = agents.join_next() => match joined {
                Some(joined) => collected.push(joined),
                None => break false,
            },
            Ok(_) = shutdown.wait_for(|s| *s) => break true,
        }
    };

    if interrupted {
        info!(remaining = agents.len(), "Shutdown requested, stopping fleet");
    } else {
        info!("All simulated agents left");
    }

    let _ = stop_tx.send(true);
    let snapshot = match coordinator_task.await {
        Ok(result) => result.context("Coordinator failed")?,
        Err(e) => return Err(eyre::eyre!("Coordinator task failed: {}", e)),
    };

    // Cancelled sessions close every start gate, so agents waiting on actions leave
    let grace = config.session.shutdown_grace();
    let drained = tokio::time::timeout(grace, async {
        while let Some(joined) = agents.join_next().await {
            collected.push(joined);
        }
    })
    .await;
    if drained.is_err() {
        warn!(remaining = agents.len(), "Agents did not leave in time, aborting");
        collected.failed += agents.len();
        agents.shutdown().await;
    }

    if let Some(task) = waiter_task {
        task.abort();
    }
    if let Err(e) = broker.shutdown().await {
        debug!(error = %e, "Broker already stopped");
    }
    if let Err(e) = broker_task.await {
        warn!(error = %e, "Broker task failed");
    }

    info!(?snapshot, failed = collected.failed, "Local fleet stopped");
    Ok(FleetOutcome {
        snapshot,
        agents: collected.agents,
        failed: collected.failed,
        interrupted,
    })
}

#[derive(Default)]
struct Collected {
    agents: Vec<AgentResults>,
    failed: usize,
}

impl Collected {
    fn push(&mut self, joined: Result<Result<AgentResults, FleetError>, tokio::task::JoinError>) {
        match joined {
            Ok(Ok(results)) => self.agents.push(results),
            Ok(Err(e)) => {
                warn!(error = %e, "Agent failed");
                self.failed += 1;
            }
            Err(e) => {
                warn!(error = %e, "Agent task failed");
                self.failed += 1;
            }
        }
    }
}
