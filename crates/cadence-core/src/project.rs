//! Project contract and integration result types.
//!
//! A project is a named build pipeline. The orchestrator never looks inside the
//! pipeline: it only decides when to call `run_integration` and reads back the
//! status the project recorded.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use derive_more::Display;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::{BuildId, Result, Schedule};

/// Why an integration is being run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
pub enum BuildCondition {
    /// The schedule's own timing condition was met.
    #[display("scheduled")]
    Scheduled,
    /// An administrator asked for a build.
    #[display("forced")]
    Forced,
}

/// Outcome of the most recent integration of a project.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
pub enum BuildStatus {
    /// The project has not been built yet.
    #[default]
    #[display("unknown")]
    Unknown,
    #[display("success")]
    Success,
    /// A pipeline step reported failure (non-zero exit, timeout).
    #[display("failure")]
    Failure,
    /// The pipeline itself could not run (spawn error, missing directory).
    #[display("exception")]
    Exception,
    #[display("cancelled")]
    Cancelled,
}

impl BuildStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, BuildStatus::Success)
    }
}

/// What a project is doing right now.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
pub enum ProjectActivity {
    #[default]
    #[display("sleeping")]
    Sleeping,
    #[display("building")]
    Building,
}

/// Result of one integration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntegrationResult {
    pub id: BuildId,
    /// Name of the project that was built.
    pub project: String,
    /// Per-project build counter, starting at 1.
    pub number: u64,
    pub condition: BuildCondition,
    pub status: BuildStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// Human readable detail for failed or cancelled builds.
    pub message: Option<String>,
}

impl IntegrationResult {
    pub fn duration(&self) -> chrono::Duration {
        self.finished_at - self.started_at
    }
}

/// A named, independently schedulable build pipeline.
///
/// Build failures are reported through the returned `IntegrationResult` and
/// `latest_build_status`. An `Err` from `run_integration` means the pipeline
/// could not be driven at all and stops the worker that called it.
#[async_trait]
pub trait Project: Send + Sync {
    /// Unique name of this project.
    fn name(&self) -> &str;

    /// Trigger policy, if the project builds on its own.
    fn schedule(&self) -> Option<Arc<dyn Schedule>>;

    /// Run one integration to completion.
    ///
    /// `cancel` is the pipeline's cancellation hook: when it fires the
    /// pipeline should stop its current step and return promptly.
    async fn run_integration(
        &self,
        condition: BuildCondition,
        cancel: CancellationToken,
    ) -> Result<IntegrationResult>;

    /// Status of the most recent integration.
    fn latest_build_status(&self) -> BuildStatus;

    /// Current activity.
    fn current_activity(&self) -> ProjectActivity;
}
