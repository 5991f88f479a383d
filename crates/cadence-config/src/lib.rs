//! KDL configuration parsing for the Cadence CI orchestrator.
//!
//! This crate handles parsing of project definitions (`cadence.kdl`): one
//! `project` node per project, each with an optional `schedule`.

pub mod error;
pub mod project;

pub use error::{ConfigError, ConfigResult};
pub use project::{ProjectDefinition, ScheduleDefinition, load_projects_file, parse_projects};
