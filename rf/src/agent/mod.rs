//! Agent side of the fleet
//!
//! An agent waits for the coordinator's liveness beacon, obtains an identity
//! through [`handshake::join`], then answers each action with an observation,
//! a reward and a done flag taken from its [`Environment`].

mod env;
pub mod handshake;
mod runtime;

pub use env::{Corridor, Environment, Transition};
pub use handshake::{JoinGate, Joined};
pub use runtime::{AgentRuntime, AgentSettings};
