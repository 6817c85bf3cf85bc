//! Domain types shared by the coordinator and agent runtimes

mod id;
mod step;

pub use id::{AgentId, JoinToken};
pub use step::{AgentResults, EpisodeRecord, StepTuple, Termination};
