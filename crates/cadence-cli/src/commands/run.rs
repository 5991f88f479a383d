//! Long-running orchestration command.

use crate::store::FileConfigurationStore;
use anyhow::{Context, Result};
use cadence_scheduler::{IntegratorOptions, Orchestrator};
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

/// Start every scheduled project and run until Ctrl-C.
///
/// The first Ctrl-C lets in-progress builds finish; a second one aborts them.
pub async fn run(config: &Path, watch: bool, options: IntegratorOptions) -> Result<()> {
    let store = Arc::new(FileConfigurationStore::new(config));
    if watch {
        store.watch()?;
    }

    let orchestrator = Orchestrator::with_options(store.clone(), options)
        .await
        .with_context(|| format!("Failed to load {}", config.display()))?;
    let orchestrator = Arc::new(orchestrator);

    let watcher = orchestrator.watch_configuration();
    orchestrator.start().await;

    info!(
        config = %store.path().display(),
        projects = orchestrator.projects().len(),
        integrators = orchestrator.project_integrators().len(),
        "Cadence running, press Ctrl-C to stop"
    );

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    info!("Stopping after current builds, press Ctrl-C again to abort them");
    orchestrator.stop().await;

    tokio::select! {
        _ = orchestrator.wait_for_exit() => {}
        signal = tokio::signal::ctrl_c() => {
            signal.context("Failed to listen for Ctrl-C")?;
            warn!("Aborting in-progress builds");
            orchestrator.abort().await;
            orchestrator.wait_for_exit().await;
        }
    }

    if let Some(watcher) = watcher {
        watcher.abort();
    }

    for summary in orchestrator
        .project_integrators()
        .iter()
        .map(|i| i.summary())
    {
        if let Some(failure) = &summary.last_failure {
            warn!(project = %summary.name, failure = %failure, "Integrator ended with a failure");
        }
    }
    info!("Cadence stopped");
    Ok(())
}
