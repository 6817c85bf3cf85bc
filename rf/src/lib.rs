//! rlfleet - reinforcement-learning fleet coordination over publish/subscribe
//!
//! A central coordinator drives many agents through episodes of
//! action/observation/reward/done exchanges. Every interaction is a message on
//! a topic; the coordinator never calls an agent directly.
//!
//! # Core Concepts
//!
//! - **One reader per connection**: a [`mailbox::Demultiplexer`] routes every
//!   delivery to exactly one consumer queue or readiness flag
//! - **Serial allocation**: identities come from a single allocator task, so
//!   concurrent joins never collide
//! - **Order-independent steps**: the three responses of a step may arrive in
//!   any order and are assembled per agent
//!
//! # Modules
//!
//! - [`protocol`] - topic schema and typed payloads
//! - [`mailbox`] - demultiplexer, selective retrieval and readiness flags
//! - [`coordinator`] - allocator, sessions, episode barrier
//! - [`agent`] - join handshake and the agent-side runtime
//! - [`policy`] - training adapters
//! - [`config`] - configuration types and loading
//! - [`cli`] - command-line interface

pub mod agent;
pub mod cli;
pub mod config;
pub mod coordinator;
pub mod domain;
pub mod error;
pub mod fleet;
pub mod mailbox;
pub mod policy;
pub mod protocol;
pub mod results;
pub mod throttle;

pub use config::Config;
pub use coordinator::{FleetCoordinator, FleetSnapshot};
pub use domain::{AgentId, AgentResults, EpisodeRecord, JoinToken, StepTuple, Termination};
pub use error::{FleetError, PayloadError};
pub use fleet::{FleetOutcome, run_local_fleet};
pub use policy::{Policy, TrainingAdapter};
