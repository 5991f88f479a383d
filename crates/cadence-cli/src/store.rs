//! File-backed configuration store with optional change detection.

use anyhow::Context;
use async_trait::async_trait;
use cadence_config::{ConfigResult, ProjectDefinition, load_projects_file, parse_projects};
use cadence_core::{ConfigChanged, ConfigurationStore, Error, Project, Result};
use cadence_executor::ShellProject;
use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::broadcast;
use tracing::{debug, error, info};

/// Reads project definitions from a KDL file on every load.
pub struct FileConfigurationStore {
    path: PathBuf,
    changes: broadcast::Sender<ConfigChanged>,
    watcher: Mutex<Option<RecommendedWatcher>>,
}

impl FileConfigurationStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let (changes, _) = broadcast::channel(16);
        Self {
            path: path.into(),
            changes,
            watcher: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Parse the file without building projects.
    pub fn definitions(&self) -> ConfigResult<Vec<ProjectDefinition>> {
        load_projects_file(&self.path)
    }

    /// Start emitting `ConfigChanged` whenever the file is written, replaced
    /// or removed.
    ///
    /// The parent directory is watched so that editors which save by rename
    /// are still noticed.
    pub fn watch(&self) -> anyhow::Result<()> {
        let mut guard = self.watcher.lock().unwrap_or_else(PoisonError::into_inner);
        if guard.is_some() {
            return Ok(());
        }

        let file_name: OsString = self
            .path
            .file_name()
            .with_context(|| format!("{} is not a file path", self.path.display()))?
            .to_os_string();
        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };

        let tx = self.changes.clone();
        let source = self.path.display().to_string();
        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<notify::Event>| match res {
                Ok(event) => {
                    if matches!(event.kind, EventKind::Access(_)) {
                        return;
                    }
                    if event
                        .paths
                        .iter()
                        .any(|p| p.file_name() == Some(file_name.as_os_str()))
                    {
                        debug!(kind = ?event.kind, "Configuration file changed");
                        let _ = tx.send(ConfigChanged {
                            source: source.clone(),
                        });
                    }
                }
                Err(e) => error!(error = %e, "Configuration watch error"),
            },
            notify::Config::default(),
        )
        .context("Failed to create file watcher")?;

        watcher
            .watch(&dir, RecursiveMode::NonRecursive)
            .with_context(|| format!("Failed to watch {}", dir.display()))?;

        info!(path = %self.path.display(), "Watching configuration file");
        *guard = Some(watcher);
        Ok(())
    }

    fn is_watching(&self) -> bool {
        self.watcher
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }
}

#[async_trait]
impl ConfigurationStore for FileConfigurationStore {
    async fn load_projects(&self) -> Result<Vec<Arc<dyn Project>>> {
        let content = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|e| Error::Config(format!("{}: {}", self.path.display(), e)))?;
        let definitions = parse_projects(&content)?;

        let projects = definitions
            .iter()
            .map(|def| ShellProject::from_definition(def).map(|p| Arc::new(p) as Arc<dyn Project>))
            .collect::<Result<Vec<_>>>()?;

        debug!(path = %self.path.display(), count = projects.len(), "Loaded projects");
        Ok(projects)
    }

    fn subscribe(&self) -> Option<broadcast::Receiver<ConfigChanged>> {
        self.is_watching().then(|| self.changes.subscribe())
    }
}
