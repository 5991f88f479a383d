//! Configuration store contract.

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::broadcast;

use crate::{Project, Result};

/// Notification that the project definitions behind a store have changed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigChanged {
    /// Where the change came from (usually a file path).
    pub source: String,
}

/// Source of project definitions.
#[async_trait]
pub trait ConfigurationStore: Send + Sync {
    /// Load a fresh set of projects, in their configured order.
    async fn load_projects(&self) -> Result<Vec<Arc<dyn Project>>>;

    /// Channel of change notifications, if the store can detect changes.
    fn subscribe(&self) -> Option<broadcast::Receiver<ConfigChanged>> {
        None
    }
}
