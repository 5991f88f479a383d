//! Local shell command pipeline.

use async_trait::async_trait;
use cadence_config::ProjectDefinition;
use cadence_core::{
    BuildCondition, BuildId, BuildStatus, IntegrationResult, Project, ProjectActivity, Result,
    Schedule,
};
use chrono::Utc;
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// A project whose build pipeline is a list of shell commands.
pub struct ShellProject {
    name: String,
    schedule: Option<Arc<dyn Schedule>>,
    workdir: Option<PathBuf>,
    commands: Vec<String>,
    env: HashMap<String, String>,
    timeout: Option<Duration>,
    state: Mutex<BuildState>,
}

#[derive(Debug, Default)]
struct BuildState {
    builds: u64,
    status: BuildStatus,
    activity: ProjectActivity,
}

/// How a command sequence ended.
enum Outcome {
    Succeeded,
    Failed(String),
    Errored(String),
    Cancelled,
}

impl ShellProject {
    pub fn new(name: impl Into<String>, commands: Vec<String>) -> Self {
        Self {
            name: name.into(),
            schedule: None,
            workdir: None,
            commands,
            env: HashMap::new(),
            timeout: None,
            state: Mutex::new(BuildState::default()),
        }
    }

    /// Create a project from its configuration, with a fresh schedule.
    pub fn from_definition(def: &ProjectDefinition) -> Result<Self> {
        let schedule = def.schedule.as_ref().map(|s| s.build()).transpose()?;
        Ok(Self {
            name: def.name.clone(),
            schedule,
            workdir: def.workdir.clone(),
            commands: def.commands.clone(),
            env: def.env.clone(),
            timeout: def.timeout,
            state: Mutex::new(BuildState::default()),
        })
    }

    pub fn with_schedule(mut self, schedule: Arc<dyn Schedule>) -> Self {
        self.schedule = Some(schedule);
        self
    }

    pub fn with_workdir(mut self, workdir: impl Into<PathBuf>) -> Self {
        self.workdir = Some(workdir.into());
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    fn state(&self) -> std::sync::MutexGuard<'_, BuildState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn run_commands(&self, condition: BuildCondition, cancel: &CancellationToken) -> Outcome {
        for command in &self.commands {
            if cancel.is_cancelled() {
                return Outcome::Cancelled;
            }

            debug!(project = %self.name, command = %command, "Running command");

            let mut cmd = Command::new("sh");
            cmd.arg("-c")
                .arg(command)
                .envs(&self.env)
                .env("CADENCE_PROJECT", &self.name)
                .env("CADENCE_BUILD_CONDITION", condition.to_string())
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .kill_on_drop(true);
            if let Some(dir) = &self.workdir {
                cmd.current_dir(dir);
            }

            let mut child = match cmd.spawn() {
                Ok(child) => child,
                Err(e) => return Outcome::Errored(format!("failed to spawn `{}`: {}", command, e)),
            };

            let stdout = child
                .stdout
                .take()
                .map(|s| tokio::spawn(forward_output(self.name.clone(), "stdout", s)));
            let stderr = child
                .stderr
                .take()
                .map(|s| tokio::spawn(forward_output(self.name.clone(), "stderr", s)));

            let outcome = tokio::select! {
                status = child.wait() => match status {
                    Ok(status) if status.success() => None,
                    Ok(status) => Some(Outcome::Failed(format!("`{}` exited with {}", command, status))),
                    Err(e) => Some(Outcome::Errored(format!("failed to wait for `{}`: {}", command, e))),
                },
                _ = cancel.cancelled() => {
                    if let Err(e) = child.kill().await {
                        warn!(project = %self.name, error = %e, "Failed to kill command");
                    }
                    Some(Outcome::Cancelled)
                }
            };

            // Grandchildren of a killed shell may still hold the pipes open.
            for handle in [stdout, stderr].into_iter().flatten() {
                if matches!(outcome, Some(Outcome::Cancelled)) {
                    handle.abort();
                } else {
                    let _ = handle.await;
                }
            }

            if let Some(outcome) = outcome {
                return outcome;
            }
        }
        Outcome::Succeeded
    }
}

async fn forward_output<R>(project: String, stream: &'static str, reader: R)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        info!(project = %project, stream, "{}", line);
    }
}

#[async_trait]
impl Project for ShellProject {
    fn name(&self) -> &str {
        &self.name
    }

    fn schedule(&self) -> Option<Arc<dyn Schedule>> {
        self.schedule.clone()
    }

    async fn run_integration(
        &self,
        condition: BuildCondition,
        cancel: CancellationToken,
    ) -> Result<IntegrationResult> {
        let number = {
            let mut state = self.state();
            state.builds += 1;
            state.activity = ProjectActivity::Building;
            state.builds
        };
        let started_at = Utc::now();
        info!(project = %self.name, number, %condition, "Starting integration");

        let outcome = match self.timeout {
            Some(limit) => {
                match tokio::time::timeout(limit, self.run_commands(condition, &cancel)).await {
                    Ok(outcome) => outcome,
                    Err(_) => Outcome::Failed(format!("timed out after {:?}", limit)),
                }
            }
            None => self.run_commands(condition, &cancel).await,
        };

        let (status, message) = match outcome {
            Outcome::Succeeded => (BuildStatus::Success, None),
            Outcome::Failed(msg) => (BuildStatus::Failure, Some(msg)),
            Outcome::Errored(msg) => (BuildStatus::Exception, Some(msg)),
            Outcome::Cancelled => (BuildStatus::Cancelled, Some("build was cancelled".to_string())),
        };

        {
            let mut state = self.state();
            state.status = status;
            state.activity = ProjectActivity::Sleeping;
        }

        match &message {
            Some(msg) => warn!(project = %self.name, number, %status, message = %msg, "Integration finished"),
            None => info!(project = %self.name, number, %status, "Integration finished"),
        }

        Ok(IntegrationResult {
            id: BuildId::new(),
            project: self.name.clone(),
            number,
            condition,
            status,
            started_at,
            finished_at: Utc::now(),
            message,
        })
    }

    fn latest_build_status(&self) -> BuildStatus {
        self.state().status
    }

    fn current_activity(&self) -> ProjectActivity {
        self.state().activity
    }
}
