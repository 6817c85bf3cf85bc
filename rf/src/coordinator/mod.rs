//! Coordinator side of the fleet
//!
//! - [`FleetCoordinator`]: connects, publishes liveness, runs until shutdown
//! - [`IndexAllocator`]: serial join/leave handling and the session roster
//! - [`StepSynchronizer`]: one task per agent driving its episodes
//! - [`EpisodeBarrier`]: hybrid-mode operator reset between episodes

mod allocator;
mod barrier;
mod core;
mod metrics;
mod roster;
mod session;

pub use allocator::{AllocatorExit, AllocatorState, IndexAllocator};
pub use barrier::{AutoOperator, EpisodeBarrier, Operator, ResetRequest, ResetWaiter, StdinOperator};
pub use core::{COORDINATOR_CLIENT_ID, FleetCoordinator};
pub use metrics::{FleetMetrics, FleetSnapshot};
pub use roster::{Roster, SessionHandle, SessionOutcome};
pub use session::{StepInbox, StepResponse, StepRoutes, StepSynchronizer};
