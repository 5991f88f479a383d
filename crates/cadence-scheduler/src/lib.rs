//! Project scheduling for the Cadence CI orchestrator.
//!
//! Runs one integrator task per scheduled project and keeps the set of
//! integrators in line with the project registry across configuration reloads.

pub mod integrator;
pub mod orchestrator;
pub mod registry;

#[cfg(test)]
pub(crate) mod testing;

pub use integrator::{IntegratorOptions, IntegratorState, IntegratorSummary, ProjectIntegrator};
pub use orchestrator::{Orchestrator, OrchestratorStatus, ReloadSummary};
pub use registry::ProjectRegistry;
