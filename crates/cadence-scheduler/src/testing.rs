//! Test doubles for projects and configuration stores.

use async_trait::async_trait;
use cadence_core::{
    BuildCondition, BuildId, BuildStatus, ConfigChanged, ConfigurationStore, Error,
    IntegrationResult, IntervalSchedule, Project, ProjectActivity, Result, Schedule,
};
use chrono::Utc;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;

use crate::IntegratorOptions;

pub fn fast_options() -> IntegratorOptions {
    IntegratorOptions {
        poll_interval: Duration::from_millis(10),
        abort_grace: Duration::from_millis(50),
    }
}

/// Await `fut`, failing the test if it takes longer than five seconds.
pub async fn within<F: Future>(fut: F) -> F::Output {
    tokio::time::timeout(Duration::from_secs(5), fut)
        .await
        .expect("operation did not complete in time")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Behavior {
    Succeed,
    /// Wait for `release`, ignoring cancellation.
    BlockUntilReleased,
    /// Wait for the cancellation token, then report `Cancelled`.
    BlockUntilCancelled,
    /// Sleep for an hour regardless of cancellation.
    IgnoreCancellation,
    Error,
    Panic,
}

pub struct MockProject {
    name: String,
    schedule: Option<Arc<dyn Schedule>>,
    behavior: Behavior,
    conditions: Mutex<Vec<BuildCondition>>,
    completed: watch::Sender<usize>,
    started: watch::Sender<usize>,
    released: watch::Sender<bool>,
    running: AtomicUsize,
    max_running: AtomicUsize,
    status: Mutex<BuildStatus>,
    building: AtomicBool,
}

impl MockProject {
    /// A project with an hourly schedule.
    pub fn new(name: &str, behavior: Behavior) -> Arc<Self> {
        let schedule: Arc<dyn Schedule> =
            Arc::new(IntervalSchedule::new(Duration::from_secs(3600)).unwrap());
        Self::build(name, Some(schedule), behavior)
    }

    pub fn unscheduled(name: &str, behavior: Behavior) -> Arc<Self> {
        Self::build(name, None, behavior)
    }

    pub fn with_schedule(name: &str, schedule: Arc<dyn Schedule>, behavior: Behavior) -> Arc<Self> {
        Self::build(name, Some(schedule), behavior)
    }

    fn build(name: &str, schedule: Option<Arc<dyn Schedule>>, behavior: Behavior) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            schedule,
            behavior,
            conditions: Mutex::new(Vec::new()),
            completed: watch::channel(0).0,
            started: watch::channel(0).0,
            released: watch::channel(false).0,
            running: AtomicUsize::new(0),
            max_running: AtomicUsize::new(0),
            status: Mutex::new(BuildStatus::Unknown),
            building: AtomicBool::new(false),
        })
    }

    /// Number of builds that ran to completion.
    pub fn build_count(&self) -> usize {
        *self.completed.borrow()
    }

    /// Conditions of every build started, in order.
    pub fn conditions(&self) -> Vec<BuildCondition> {
        self.conditions.lock().unwrap().clone()
    }

    pub fn max_concurrent_builds(&self) -> usize {
        self.max_running.load(Ordering::SeqCst)
    }

    /// Let current and future `BlockUntilReleased` builds finish.
    pub fn release(&self) {
        self.released.send_replace(true);
    }

    pub async fn wait_for_builds(&self, count: usize) {
        let mut rx = self.completed.subscribe();
        let _ = rx.wait_for(|n| *n >= count).await;
    }

    pub async fn wait_until_building(&self) {
        let mut rx = self.started.subscribe();
        let _ = rx.wait_for(|n| *n >= 1).await;
    }

    fn result(&self, condition: BuildCondition, status: BuildStatus) -> IntegrationResult {
        let now = Utc::now();
        IntegrationResult {
            id: BuildId::new(),
            project: self.name.clone(),
            number: self.conditions().len() as u64,
            condition,
            status,
            started_at: now,
            finished_at: now,
            message: None,
        }
    }
}

#[async_trait]
impl Project for MockProject {
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
        self.conditions.lock().unwrap().push(condition);
        let running = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_running.fetch_max(running, Ordering::SeqCst);
        self.building.store(true, Ordering::SeqCst);
        self.started.send_modify(|n| *n += 1);

        let status = match self.behavior {
            Behavior::Succeed => BuildStatus::Success,
            Behavior::BlockUntilReleased => {
                let mut released = self.released.subscribe();
                let _ = released.wait_for(|r| *r).await;
                BuildStatus::Success
            }
            Behavior::BlockUntilCancelled => {
                cancel.cancelled().await;
                BuildStatus::Cancelled
            }
            Behavior::IgnoreCancellation => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                BuildStatus::Success
            }
            Behavior::Error => {
                self.running.fetch_sub(1, Ordering::SeqCst);
                return Err(Error::ExecutionFailed("pipeline unavailable".to_string()));
            }
            Behavior::Panic => panic!("boom"),
        };

        *self.status.lock().unwrap() = status;
        self.building.store(false, Ordering::SeqCst);
        self.running.fetch_sub(1, Ordering::SeqCst);
        let result = self.result(condition, status);
        self.completed.send_modify(|n| *n += 1);
        Ok(result)
    }

    fn latest_build_status(&self) -> BuildStatus {
        *self.status.lock().unwrap()
    }

    fn current_activity(&self) -> ProjectActivity {
        if self.building.load(Ordering::SeqCst) {
            ProjectActivity::Building
        } else {
            ProjectActivity::Sleeping
        }
    }
}

/// Store whose contents tests replace between reloads.
pub struct MockStore {
    projects: Mutex<Vec<Arc<dyn Project>>>,
    fail_next: AtomicBool,
    loads: AtomicUsize,
    changes: broadcast::Sender<ConfigChanged>,
    gate: watch::Sender<bool>,
}

impl MockStore {
    pub fn new(projects: Vec<Arc<dyn Project>>) -> Arc<Self> {
        Arc::new(Self {
            projects: Mutex::new(projects),
            fail_next: AtomicBool::new(false),
            loads: AtomicUsize::new(0),
            changes: broadcast::channel(16).0,
            gate: watch::channel(true).0,
        })
    }

    pub fn set_projects(&self, projects: Vec<Arc<dyn Project>>) {
        *self.projects.lock().unwrap() = projects;
    }

    pub fn fail_next_load(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }

    /// Make loads block until `release_loads`.
    pub fn hold_loads(&self) {
        self.gate.send_replace(false);
    }

    pub fn release_loads(&self) {
        self.gate.send_replace(true);
    }

    pub fn load_count(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }

    pub fn notify_changed(&self) {
        let _ = self.changes.send(ConfigChanged {
            source: "mock".to_string(),
        });
    }
}

#[async_trait]
impl ConfigurationStore for MockStore {
    async fn load_projects(&self) -> Result<Vec<Arc<dyn Project>>> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        let mut gate = self.gate.subscribe();
        let _ = gate.wait_for(|open| *open).await;
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(Error::Config("unreadable configuration".to_string()));
        }
        Ok(self.projects.lock().unwrap().clone())
    }

    fn subscribe(&self) -> Option<broadcast::Receiver<ConfigChanged>> {
        Some(self.changes.subscribe())
    }
}

/// Erase mock projects into the store's project list.
pub fn projects<const N: usize>(list: [&Arc<MockProject>; N]) -> Vec<Arc<dyn Project>> {
    list.into_iter()
        .map(|p| p.clone() as Arc<dyn Project>)
        .collect()
}
