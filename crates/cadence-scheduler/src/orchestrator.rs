//! Orchestrator: owns the project registry and one integrator per scheduled project.
//!
//! Administrative operations that change the integrator set (start, stop,
//! abort, force build, reload) are serialised by one async mutex. The registry
//! and integrator set are published together as an immutable snapshot, so
//! readers never wait on that mutex and never observe a half-applied reload.

use crate::integrator::{IntegratorOptions, ProjectIntegrator};
use crate::registry::ProjectRegistry;
use cadence_core::{
    BuildCondition, BuildStatus, ConfigurationStore, Error, IntegrationResult, Project,
    ProjectActivity, Result,
};
use derive_more::Display;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Whether `start` or `stop` was called last.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
pub enum OrchestratorStatus {
    #[display("running")]
    Running,
    #[display("stopped")]
    Stopped,
}

/// What a reload changed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReloadSummary {
    /// Projects that gained an integrator, started if the orchestrator is running.
    pub added: Vec<String>,
    /// Projects whose integrator was stopped and removed.
    pub removed: Vec<String>,
    /// Projects whose integrator was kept and rebound.
    pub rebound: Vec<String>,
}

type IntegratorSet = HashMap<String, Arc<ProjectIntegrator>>;

struct Snapshot {
    registry: ProjectRegistry,
    integrators: IntegratorSet,
}

/// Top-level engine owning all projects and integrators.
pub struct Orchestrator {
    store: Arc<dyn ConfigurationStore>,
    options: IntegratorOptions,
    admin: tokio::sync::Mutex<()>,
    current: RwLock<Arc<Snapshot>>,
    running: AtomicBool,
    /// Integrators removed by a reload, kept until their loop has exited.
    retired: Mutex<Vec<Arc<ProjectIntegrator>>>,
}

impl Orchestrator {
    /// Load the initial registry and create one unstarted integrator per
    /// scheduled project.
    pub async fn new(store: Arc<dyn ConfigurationStore>) -> Result<Self> {
        Self::with_options(store, IntegratorOptions::default()).await
    }

    pub async fn with_options(
        store: Arc<dyn ConfigurationStore>,
        options: IntegratorOptions,
    ) -> Result<Self> {
        let registry = ProjectRegistry::new(store.load_projects().await?)?;
        let integrators: IntegratorSet = registry
            .schedulable()
            .map(|(project, schedule)| {
                let integrator =
                    ProjectIntegrator::new(project.clone(), schedule, options.clone());
                (project.name().to_string(), Arc::new(integrator))
            })
            .collect();

        info!(
            projects = registry.len(),
            integrators = integrators.len(),
            "Orchestrator created"
        );

        Ok(Self {
            store,
            options,
            admin: tokio::sync::Mutex::new(()),
            current: RwLock::new(Arc::new(Snapshot {
                registry,
                integrators,
            })),
            running: AtomicBool::new(false),
            retired: Mutex::new(Vec::new()),
        })
    }

    fn snapshot(&self) -> Arc<Snapshot> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn publish(&self, snapshot: Snapshot) {
        *self.current.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(snapshot);
    }

    fn retired(&self) -> std::sync::MutexGuard<'_, Vec<Arc<ProjectIntegrator>>> {
        self.retired.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn status(&self) -> OrchestratorStatus {
        if self.running.load(Ordering::Acquire) {
            OrchestratorStatus::Running
        } else {
            OrchestratorStatus::Stopped
        }
    }

    pub fn get_project(&self, name: &str) -> Result<Arc<dyn Project>> {
        self.snapshot()
            .registry
            .get(name)
            .cloned()
            .ok_or_else(|| Error::ProjectNotFound(name.to_string()))
    }

    /// All projects, in configuration order.
    pub fn projects(&self) -> Vec<Arc<dyn Project>> {
        self.snapshot().registry.iter().cloned().collect()
    }

    /// All integrators, in configuration order of their projects.
    pub fn project_integrators(&self) -> Vec<Arc<ProjectIntegrator>> {
        let snapshot = self.snapshot();
        snapshot
            .registry
            .iter()
            .filter_map(|p| snapshot.integrators.get(p.name()).cloned())
            .collect()
    }

    pub fn integrator(&self, name: &str) -> Option<Arc<ProjectIntegrator>> {
        self.snapshot().integrators.get(name).cloned()
    }

    /// Run one forced integration of `name` on the caller's task and return
    /// its result. Works for projects without a schedule.
    pub async fn run_integration(&self, name: &str) -> Result<IntegrationResult> {
        let (project, integrator) = {
            let snapshot = self.snapshot();
            let project = snapshot
                .registry
                .get(name)
                .cloned()
                .ok_or_else(|| Error::ProjectNotFound(name.to_string()))?;
            (project, snapshot.integrators.get(name).cloned())
        };

        info!(project = %name, "Running forced integration");
        match integrator {
            Some(integrator) => integrator.run_forced().await,
            None => {
                project
                    .run_integration(BuildCondition::Forced, CancellationToken::new())
                    .await
            }
        }
    }

    /// Ask the project's integrator to build on its next wake. Does not wait
    /// for the build.
    pub async fn force_build(&self, name: &str) -> Result<()> {
        let _admin = self.admin.lock().await;
        let snapshot = self.snapshot();
        if !snapshot.registry.contains(name) {
            return Err(Error::ProjectNotFound(name.to_string()));
        }
        let integrator = snapshot
            .integrators
            .get(name)
            .ok_or_else(|| Error::NotScheduled(name.to_string()))?;

        integrator.force_build();
        info!(project = %name, "Force build requested");
        Ok(())
    }

    /// Mark the orchestrator running and start every integrator.
    pub async fn start(&self) {
        let _admin = self.admin.lock().await;
        self.running.store(true, Ordering::Release);

        let snapshot = self.snapshot();
        for integrator in snapshot.integrators.values() {
            integrator.start();
        }
        info!(integrators = snapshot.integrators.len(), "Orchestrator started");
    }

    /// Mark the orchestrator stopped and ask every integrator to finish its
    /// current cycle and exit. Does not wait; see `wait_for_exit`.
    pub async fn stop(&self) {
        let _admin = self.admin.lock().await;
        self.running.store(false, Ordering::Release);

        for integrator in self.snapshot().integrators.values() {
            integrator.stop();
        }
        info!("Orchestrator stop requested");
    }

    /// Interrupt every in-progress build and stop all integrators.
    pub async fn abort(&self) {
        let _admin = self.admin.lock().await;
        self.running.store(false, Ordering::Release);

        for integrator in self.snapshot().integrators.values() {
            integrator.abort();
        }
        for integrator in self.retired().iter() {
            integrator.abort();
        }
        warn!("Orchestrator abort requested");
    }

    /// Wait until every integrator loop, including ones removed by a reload,
    /// has exited.
    pub async fn wait_for_exit(&self) {
        let mut integrators: Vec<_> = self.snapshot().integrators.values().cloned().collect();
        integrators.extend(self.retired().iter().cloned());

        futures::future::join_all(integrators.iter().map(|i| i.wait_for_exit())).await;

        self.retired().retain(|i| i.state().is_active());
        debug!(integrators = integrators.len(), "All integrators exited");
    }

    /// `wait_for_exit` with an upper bound.
    pub async fn wait_for_exit_timeout(&self, limit: Duration) -> Result<()> {
        tokio::time::timeout(limit, self.wait_for_exit())
            .await
            .map_err(|_| Error::Timeout(format!("integrators still running after {:?}", limit)))
    }

    /// Latest build status of the first configured project.
    ///
    /// This is not the most recent status across projects.
    pub fn latest_build_status(&self) -> Option<BuildStatus> {
        self.snapshot()
            .registry
            .first()
            .map(|p| p.latest_build_status())
    }

    /// Current activity of the first configured project.
    pub fn current_project_activity(&self) -> Option<ProjectActivity> {
        self.snapshot()
            .registry
            .first()
            .map(|p| p.current_activity())
    }

    /// Handle a change notification from the store.
    pub async fn on_configuration_changed(&self) -> Result<ReloadSummary> {
        self.reload_configuration().await
    }

    /// Reload projects from the store and reconcile the integrator set.
    ///
    /// Either the whole new registry and integrator set is published, or, when
    /// loading fails, nothing changes.
    pub async fn reload_configuration(&self) -> Result<ReloadSummary> {
        let _admin = self.admin.lock().await;
        self.retired().retain(|i| i.state().is_active());

        let registry = match self.store.load_projects().await.and_then(ProjectRegistry::new) {
            Ok(registry) => registry,
            Err(e) => {
                error!(error = %e, "Configuration reload failed, keeping current projects");
                return Err(e);
            }
        };

        let current = self.snapshot();
        let mut summary = ReloadSummary::default();
        let mut integrators = IntegratorSet::with_capacity(registry.len());
        let mut rebinds = Vec::new();
        let mut added = Vec::new();

        for (project, schedule) in registry.schedulable() {
            let name = project.name().to_string();
            match current.integrators.get(&name) {
                Some(existing) => {
                    rebinds.push((existing.clone(), project.clone(), schedule));
                    integrators.insert(name.clone(), existing.clone());
                    summary.rebound.push(name);
                }
                None => {
                    let integrator = Arc::new(ProjectIntegrator::new(
                        project.clone(),
                        schedule,
                        self.options.clone(),
                    ));
                    added.push(integrator.clone());
                    integrators.insert(name.clone(), integrator);
                    summary.added.push(name);
                }
            }
        }

        let mut removed: Vec<_> = current
            .integrators
            .iter()
            .filter(|(name, _)| !integrators.contains_key(*name))
            .map(|(name, integrator)| (name.clone(), integrator.clone()))
            .collect();
        removed.sort_by(|a, b| a.0.cmp(&b.0));

        for (integrator, project, schedule) in rebinds {
            integrator.rebind(project, schedule);
        }
        self.publish(Snapshot {
            registry,
            integrators,
        });

        {
            let mut retired = self.retired();
            for (name, integrator) in removed {
                integrator.stop();
                if integrator.state().is_active() {
                    retired.push(integrator);
                }
                summary.removed.push(name);
            }
        }
        // Added integrators stay idle until the next `start` when stopped.
        if self.running.load(Ordering::Acquire) {
            for integrator in &added {
                integrator.start();
            }
        }

        info!(
            added = ?summary.added,
            removed = ?summary.removed,
            rebound = summary.rebound.len(),
            "Configuration reloaded"
        );
        Ok(summary)
    }

    /// Reload whenever the store reports a change, until the store's channel
    /// closes or the orchestrator is dropped.
    ///
    /// Returns `None` if the store cannot report changes.
    pub fn watch_configuration(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        let mut changes = self.store.subscribe()?;
        let orchestrator = Arc::downgrade(self);

        Some(tokio::spawn(async move {
            loop {
                match changes.recv().await {
                    Ok(change) => {
                        debug!(source = %change.source, "Configuration change received")
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        debug!(skipped, "Configuration changes coalesced")
                    }
                    Err(RecvError::Closed) => break,
                }

                // Several notifications usually arrive for one edit.
                loop {
                    match changes.try_recv() {
                        Ok(_) | Err(TryRecvError::Lagged(_)) => continue,
                        Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => break,
                    }
                }

                let Some(orchestrator) = orchestrator.upgrade() else {
                    break;
                };
                if let Err(e) = orchestrator.on_configuration_changed().await {
                    warn!(error = %e, "Ignoring configuration change");
                }
            }
            debug!("Configuration watcher exited");
        }))
    }
}
