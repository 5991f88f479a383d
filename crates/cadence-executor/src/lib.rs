//! Build pipeline backends for the Cadence CI orchestrator.
//!
//! Provides `Project` implementations that actually run integrations:
//! - Shell commands on the local host

pub mod shell;

pub use shell::ShellProject;
