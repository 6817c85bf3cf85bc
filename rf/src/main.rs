//! rlfleet - RL fleet coordinator
//!
//! CLI entry point for running a local fleet and inspecting its results.

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{CommandFactory, Parser};
use colored::Colorize;
use eyre::{Context, Result};
use tokio::sync::watch;
use tracing::{info, warn};

use rlfleet::cli::{Cli, Command, OutputFormat, get_log_path};
use rlfleet::config::{Config, SessionMode};
use rlfleet::coordinator::StdinOperator;
use rlfleet::results::ResultStore;
use rlfleet::{AgentResults, run_local_fleet};

fn setup_logging(level: &str) -> Result<()> {
    let log_path = get_log_path();
    if let Some(log_dir) = log_path.parent() {
        fs::create_dir_all(log_dir).context("Failed to create log directory")?;
    }

    // Write to log file, not stdout/stderr
    let level: tracing::Level = level
        .parse()
        .map_err(|_| eyre::eyre!("Invalid log level: {}", level))?;
    let log_file = fs::File::create(&log_path).context("Failed to create log file")?;

    tracing_subscriber::fmt()
        .with_writer(log_file)
        .with_ansi(false)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into()))
        .init();

    info!("Logging initialized (level: {})", level);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // CLI flag beats config file beats default
    let level = cli
        .log_level
        .clone()
        .or_else(|| Config::load_log_level(cli.config.as_ref()))
        .unwrap_or_else(|| "info".to_string());
    setup_logging(&level).context("Failed to setup logging")?;

    let config = Config::load(cli.config.as_ref()).context("Failed to load configuration")?;

    match cli.command {
        Some(Command::Run {
            agents,
            episodes,
            hybrid,
        }) => cmd_run(config, agents, episodes, hybrid).await,
        Some(Command::Results { dir, format }) => cmd_results(&config, dir, format).await,
        Some(Command::Config) => cmd_config(&config),
        None => {
            Cli::command().print_help()?;
            println!();
            Ok(())
        }
    }
}

/// Run broker, coordinator and simulated agents until they finish or Ctrl-C
async fn cmd_run(mut config: Config, agents: Option<u32>, episodes: Option<u32>, hybrid: bool) -> Result<()> {
    if let Some(agents) = agents {
        config.sim.agents = agents;
    }
    if let Some(episodes) = episodes {
        config.session.episodes = episodes;
    }
    if hybrid {
        config.session.mode = SessionMode::Hybrid;
    }
    config.validate().context("Invalid configuration")?;

    info!(
        agents = config.sim.agents,
        episodes = config.session.episodes,
        algorithm = %config.policy.algorithm,
        "rf run"
    );
    println!(
        "Running {} agent(s) for {} episode(s) [{}]",
        config.sim.agents, config.session.episodes, config.policy.algorithm
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Ctrl-C received");
                let _ = shutdown_tx.send(true);
            }
            Err(e) => warn!(error = %e, "Could not listen for Ctrl-C"),
        }
    });

    let results_dir = config.results.dir.clone();
    let outcome = run_local_fleet(Arc::new(config), StdinOperator::new(), shutdown_rx).await?;

    if outcome.interrupted {
        println!("{}", "Interrupted".yellow());
    }
    let snapshot = &outcome.snapshot;
    println!(
        "Episodes: {} done, {} timed out, {} aborted",
        snapshot.episodes_completed.to_string().green(),
        snapshot.episodes_timed_out.to_string().yellow(),
        snapshot.episodes_aborted.to_string().red()
    );
    println!(
        "Agents: {} joined, {} left, {} failed",
        snapshot.agents_joined, snapshot.agents_left, outcome.failed
    );
    if snapshot.malformed_payloads > 0 {
        println!("Malformed payloads dropped: {}", snapshot.malformed_payloads);
    }
    println!("Results written to: {}", results_dir.display());
    Ok(())
}

/// Print persisted results
async fn cmd_results(config: &Config, dir: Option<PathBuf>, format: OutputFormat) -> Result<()> {
    let dir = dir.unwrap_or_else(|| config.results.dir.clone());
    let store = ResultStore::new(&dir);
    let all = store.load_all().await.context("Failed to load results")?;

    if all.is_empty() {
        match format {
            OutputFormat::Json => println!("[]"),
            OutputFormat::Text => println!("No results found in {}", dir.display()),
        }
        return Ok(());
    }

    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&all)?);
        }
        OutputFormat::Text => {
            for results in &all {
                print_results(results);
            }
        }
    }
    Ok(())
}

fn print_results(results: &AgentResults) {
    let mean = results
        .mean_reward()
        .map(|m| format!("{:.3}", m))
        .unwrap_or_else(|| "-".to_string());
    println!(
        "{} {}: {} episode(s), {} aborted, mean reward {}",
        "Agent".bold(),
        results.agent.to_string().bold(),
        results.episodes.len(),
        results.aborted_episodes,
        mean.cyan()
    );
    for record in &results.episodes {
        println!(
            "  #{:<4} reward {:>10.3}  steps {:>6}  {}",
            record.episode, record.total_reward, record.steps, record.termination
        );
    }
}

/// Print the effective configuration
fn cmd_config(config: &Config) -> Result<()> {
    let yaml = serde_yaml::to_string(config).context("Failed to serialize config")?;
    print!("{}", yaml);
    Ok(())
}
