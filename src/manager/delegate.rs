//! Outside collaborators the manager consults: category metadata and
//! store configurations, real or simulated.

use crate::config::SnapshotStoreConfig;
use crate::error::{Result, StoreError};
use crate::schema::Schema;
use crossbeam_channel::{bounded, RecvTimeoutError};
use serde::{Deserialize, Serialize};
use std::thread;
use std::time::Duration;
use tracing::warn;

/// Category description returned by a [`CategorySource`].
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CategoryMetadata {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    /// Schema snapshots of this category must satisfy.
    #[serde(default)]
    pub schema: Option<Schema>,
}

/// Source of category metadata and real store configurations.
///
/// Calls may block; the manager runs them on a helper thread under a
/// deadline.
pub trait CategorySource: Send + Sync + 'static {
    fn fetch_category_by_name(&self, name: &str) -> Result<CategoryMetadata>;

    /// Configurations for one store, or for every store when `store_id` is
    /// `None`.
    fn fetch_snapshot_store_data(&self, store_id: Option<&str>) -> Result<Vec<SnapshotStoreConfig>>;
}

/// Selects where [`get_delegate`](super::SnapshotManager::get_delegate)
/// takes its configurations from.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DelegateContext {
    pub use_simulated_data_source: bool,
    /// Restrict the result to one store.
    pub store_id: Option<String>,
    /// Overrides the manager's collaborator timeout.
    pub timeout: Option<Duration>,
}

impl DelegateContext {
    pub fn simulated() -> Self {
        Self {
            use_simulated_data_source: true,
            ..Self::default()
        }
    }

    pub fn real() -> Self {
        Self::default()
    }

    pub fn for_store(mut self, store_id: impl Into<String>) -> Self {
        self.store_id = Some(store_id.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Run `call` on a helper thread and wait at most `timeout` for its result.
///
/// A call that overruns is abandoned, not interrupted; its result is dropped
/// when it eventually arrives.
pub(crate) fn call_with_timeout<R, F>(operation: &str, timeout: Duration, call: F) -> Result<R>
where
    R: Send + 'static,
    F: FnOnce() -> Result<R> + Send + 'static,
{
    let (tx, rx) = bounded(1);
    thread::Builder::new()
        .name(format!("snapshot-{operation}"))
        .spawn(move || {
            let _ = tx.send(call());
        })
        .map_err(|e| StoreError::Collaborator(format!("{operation}: {e}")))?;

    match rx.recv_timeout(timeout) {
        Ok(result) => result,
        Err(RecvTimeoutError::Timeout) => {
            warn!(operation, ?timeout, "collaborator call timed out");
            Err(StoreError::Timeout {
                operation: operation.to_string(),
                timeout,
            })
        }
        Err(RecvTimeoutError::Disconnected) => Err(StoreError::Collaborator(format!(
            "{operation} ended without a result"
        ))),
    }
}
