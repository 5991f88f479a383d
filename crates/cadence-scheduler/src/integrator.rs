//! Per-project integrator: a worker task that enacts one schedule against one project.

use cadence_core::{BuildCondition, BuildStatus, IntegrationResult, Project, Result, Schedule};
use derive_more::Display;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Lifecycle state of an integrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
pub enum IntegratorState {
    /// Created but never started.
    #[display("idle")]
    Idle,
    /// Loop active.
    #[display("running")]
    Running,
    /// Graceful stop requested; finishing the current cycle.
    #[display("stopping")]
    Stopping,
    /// Abort requested; the in-progress build is being interrupted.
    #[display("aborting")]
    Aborting,
    /// Loop has exited.
    #[display("stopped")]
    Stopped,
}

impl IntegratorState {
    /// Whether a loop task exists for this state.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            IntegratorState::Running | IntegratorState::Stopping | IntegratorState::Aborting
        )
    }
}

/// Tuning for integrator loops.
#[derive(Debug, Clone)]
pub struct IntegratorOptions {
    /// Longest wait between two schedule polls.
    pub poll_interval: Duration,
    /// How long an aborted build may take to honour cancellation before it is
    /// abandoned.
    pub abort_grace: Duration,
}

impl Default for IntegratorOptions {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            abort_grace: Duration::from_secs(10),
        }
    }
}

/// Point-in-time view of an integrator, for status reporting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntegratorSummary {
    pub name: String,
    pub state: IntegratorState,
    pub last_status: Option<BuildStatus>,
    pub last_failure: Option<String>,
}

#[derive(Clone)]
struct Binding {
    project: Arc<dyn Project>,
    schedule: Arc<dyn Schedule>,
}

/// State shared between the integrator handle and its loop task.
struct Shared {
    name: String,
    options: IntegratorOptions,
    binding: RwLock<Binding>,
    /// Held for the duration of every build of this project.
    build_lock: tokio::sync::Mutex<()>,
    wake: Notify,
    state: watch::Sender<IntegratorState>,
    last_result: Mutex<Option<IntegrationResult>>,
    last_failure: Mutex<Option<String>>,
}

struct Control {
    stop: CancellationToken,
    abort: CancellationToken,
    task: Option<JoinHandle<()>>,
}

/// Worker binding one project to its schedule.
///
/// The loop runs as its own tokio task between `start` and the moment it
/// observes a stop or abort request. `start`, `stop` and `abort` never block;
/// `wait_for_exit` waits for the task to finish.
pub struct ProjectIntegrator {
    shared: Arc<Shared>,
    control: Mutex<Control>,
    starts: AtomicU64,
    stops: AtomicU64,
}

impl ProjectIntegrator {
    pub fn new(
        project: Arc<dyn Project>,
        schedule: Arc<dyn Schedule>,
        options: IntegratorOptions,
    ) -> Self {
        let (state, _) = watch::channel(IntegratorState::Idle);
        Self {
            shared: Arc::new(Shared {
                name: project.name().to_string(),
                options,
                binding: RwLock::new(Binding { project, schedule }),
                build_lock: tokio::sync::Mutex::new(()),
                wake: Notify::new(),
                state,
                last_result: Mutex::new(None),
                last_failure: Mutex::new(None),
            }),
            control: Mutex::new(Control {
                stop: CancellationToken::new(),
                abort: CancellationToken::new(),
                task: None,
            }),
            starts: AtomicU64::new(0),
            stops: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn state(&self) -> IntegratorState {
        *self.shared.state.borrow()
    }

    pub fn project(&self) -> Arc<dyn Project> {
        self.shared.binding().project
    }

    pub fn schedule(&self) -> Arc<dyn Schedule> {
        self.shared.binding().schedule
    }

    /// Number of times a loop task has been spawned for this integrator.
    pub fn start_count(&self) -> u64 {
        self.starts.load(Ordering::Acquire)
    }

    /// Number of stop requests that moved a running loop to `Stopping`.
    pub fn stop_count(&self) -> u64 {
        self.stops.load(Ordering::Acquire)
    }

    /// Result of the last build this integrator ran.
    pub fn last_result(&self) -> Option<IntegrationResult> {
        lock(&self.shared.last_result).clone()
    }

    /// Reason the loop last terminated abnormally, if it did.
    pub fn last_failure(&self) -> Option<String> {
        lock(&self.shared.last_failure).clone()
    }

    pub fn summary(&self) -> IntegratorSummary {
        IntegratorSummary {
            name: self.shared.name.clone(),
            state: self.state(),
            last_status: self.last_result().map(|r| r.status),
            last_failure: self.last_failure(),
        }
    }

    /// Spawn the loop. No-op while a loop task is active.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(&self) {
        let mut control = lock(&self.control);

        let current = self.state();
        if current.is_active() {
            debug!(project = %self.shared.name, state = %current, "Integrator already active");
            return;
        }

        let stop = CancellationToken::new();
        let abort = CancellationToken::new();
        *lock(&self.shared.last_failure) = None;
        self.shared.state.send_replace(IntegratorState::Running);
        self.starts.fetch_add(1, Ordering::AcqRel);

        let task = tokio::spawn(run_worker(
            self.shared.clone(),
            stop.clone(),
            abort.clone(),
        ));
        *control = Control {
            stop,
            abort,
            task: Some(task),
        };

        info!(project = %self.shared.name, "Integrator started");
    }

    /// Ask the loop to exit after the current cycle. Returns immediately.
    pub fn stop(&self) {
        let control = lock(&self.control);
        let requested = self.shared.state.send_if_modified(|state| {
            if *state == IntegratorState::Running {
                *state = IntegratorState::Stopping;
                true
            } else {
                false
            }
        });
        if requested {
            self.stops.fetch_add(1, Ordering::AcqRel);
            control.stop.cancel();
            info!(project = %self.shared.name, "Integrator stop requested");
        }
    }

    /// Interrupt the in-progress build, if any, and stop the loop.
    pub fn abort(&self) {
        let control = lock(&self.control);
        let requested = self.shared.state.send_if_modified(|state| {
            if matches!(*state, IntegratorState::Running | IntegratorState::Stopping) {
                *state = IntegratorState::Aborting;
                true
            } else {
                false
            }
        });
        if requested {
            control.abort.cancel();
            control.stop.cancel();
            warn!(project = %self.shared.name, "Integrator abort requested");
        }
    }

    /// Wait until the loop has exited. Returns at once if it never started.
    pub async fn wait_for_exit(&self) {
        let task = lock(&self.control).task.take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                error!(project = %self.shared.name, error = %e, "Integrator task failed");
            }
        }

        let mut state = self.shared.state.subscribe();
        let _ = state
            .wait_for(|s| matches!(s, IntegratorState::Idle | IntegratorState::Stopped))
            .await;
    }

    /// Request a forced build on the loop's next wake, without waiting for it.
    pub fn force_build(&self) {
        self.shared.binding().schedule.force_build();
        self.shared.wake.notify_one();
        debug!(project = %self.shared.name, "Force build requested");
    }

    /// Replace the project and schedule used from the next loop iteration on.
    ///
    /// The loop task and any build in progress are left alone.
    pub fn rebind(&self, project: Arc<dyn Project>, schedule: Arc<dyn Schedule>) {
        *self
            .shared
            .binding
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Binding { project, schedule };
        debug!(project = %self.shared.name, "Integrator rebound");
    }

    /// Run one forced build on the caller's task.
    ///
    /// Serialised with the loop's own builds, and interrupted by `abort`.
    pub async fn run_forced(&self) -> Result<IntegrationResult> {
        let _build = self.shared.build_lock.lock().await;

        let project = self.shared.binding().project;
        let cancel = {
            let control = lock(&self.control);
            if control.abort.is_cancelled() {
                CancellationToken::new()
            } else {
                control.abort.child_token()
            }
        };

        let result = project
            .run_integration(BuildCondition::Forced, cancel)
            .await?;
        *lock(&self.shared.last_result) = Some(result.clone());
        Ok(result)
    }
}

impl Shared {
    fn binding(&self) -> Binding {
        self.binding
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Drive one build, giving an aborted build `abort_grace` to return.
    ///
    /// Returns `None` when an aborted build had to be abandoned.
    async fn integrate(
        &self,
        project: &Arc<dyn Project>,
        condition: BuildCondition,
        abort: &CancellationToken,
    ) -> Result<Option<IntegrationResult>> {
        let build = project.run_integration(condition, abort.child_token());
        tokio::pin!(build);

        tokio::select! {
            result = &mut build => result.map(Some),
            _ = abort.cancelled() => {
                warn!(project = %self.name, "Interrupting in-progress integration");
                match tokio::time::timeout(self.options.abort_grace, &mut build).await {
                    Ok(result) => result.map(Some),
                    Err(_) => {
                        warn!(
                            project = %self.name,
                            grace = ?self.options.abort_grace,
                            "Integration ignored cancellation, abandoning it"
                        );
                        Ok(None)
                    }
                }
            }
        }
    }

    async fn integration_loop(
        &self,
        stop: &CancellationToken,
        abort: &CancellationToken,
    ) -> Result<()> {
        while !stop.is_cancelled() {
            let Binding { project, schedule } = self.binding();

            if let Some(condition) = schedule.poll(Instant::now()) {
                // A forced build may hold the lock; abort must not wait on it.
                let _build = tokio::select! {
                    biased;
                    _ = abort.cancelled() => break,
                    guard = self.build_lock.lock() => guard,
                };
                debug!(project = %self.name, %condition, "Schedule triggered integration");

                if let Some(result) = self.integrate(&project, condition, abort).await? {
                    debug!(project = %self.name, number = result.number, status = %result.status, "Integration recorded");
                    *lock(&self.last_result) = Some(result);
                }
                schedule.integration_completed(Instant::now());
            }

            tokio::select! {
                _ = stop.cancelled() => break,
                _ = self.wake.notified() => {}
                _ = tokio::time::sleep(self.options.poll_interval) => {}
            }
        }
        Ok(())
    }
}

/// Body of the integrator task. Failures stay inside this task.
async fn run_worker(shared: Arc<Shared>, stop: CancellationToken, abort: CancellationToken) {
    let outcome = AssertUnwindSafe(shared.integration_loop(&stop, &abort))
        .catch_unwind()
        .await;

    let failure = match outcome {
        Ok(Ok(())) => None,
        Ok(Err(e)) => Some(e.to_string()),
        Err(panic) => Some(format!("integrator panicked: {}", panic_message(&*panic))),
    };

    match failure {
        Some(message) => {
            error!(project = %shared.name, error = %message, "Integrator failed");
            *lock(&shared.last_failure) = Some(message);
        }
        None => info!(project = %shared.name, "Integrator stopped"),
    }

    shared.state.send_replace(IntegratorState::Stopped);
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
