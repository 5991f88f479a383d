//! Core domain types and traits for the Cadence CI orchestrator.
//!
//! This crate contains:
//! - Build identifiers and common types
//! - The `Project` contract and integration results
//! - The `Schedule` contract and the interval schedule
//! - The `ConfigurationStore` contract and change notifications

pub mod error;
pub mod id;
pub mod project;
pub mod schedule;
pub mod store;

pub use error::{Error, Result};
pub use id::BuildId;
pub use project::{BuildCondition, BuildStatus, IntegrationResult, Project, ProjectActivity};
pub use schedule::{ForceFlag, IntervalSchedule, Schedule};
pub use store::{ConfigChanged, ConfigurationStore};
