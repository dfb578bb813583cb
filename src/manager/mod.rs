//! Registry of snapshot stores.
//!
//! A [`SnapshotManager`] is an explicit value the application owns and
//! shares, one per process or per test. It creates stores from
//! configurations, resolves their schemas through a [`CategorySource`], and
//! optionally runs a background [`SyncWorker`].

mod delegate;
mod sync;

pub use delegate::{CategoryMetadata, CategorySource, DelegateContext};
pub use sync::{SyncStats, SyncWorker};

use crate::config::SnapshotStoreConfig;
use crate::error::{Result, StoreError};
use crate::persistence::SnapshotPersistence;
use crate::snapshot::Snapshot;
use crate::store::SnapshotStore;
use crate::types::SnapshotData;
use delegate::call_with_timeout;
use parking_lot::{Mutex, RwLock};
use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use sync::StoreMap;
use tracing::{debug, info};

/// Category reported for a store with no configured category and no snapshots.
pub const DEFAULT_CATEGORY: &str = "default";

/// Default deadline for [`CategorySource`] calls.
pub const DEFAULT_COLLABORATOR_TIMEOUT: Duration = Duration::from_secs(5);

/// Creates, looks up and discards snapshot stores.
pub struct SnapshotManager<T: SnapshotData> {
    stores: StoreMap<T>,
    persistence: Option<Arc<dyn SnapshotPersistence>>,
    category_source: Option<Arc<dyn CategorySource>>,
    simulated_configs: Vec<SnapshotStoreConfig>,
    collaborator_timeout: Duration,
    sync_worker: Mutex<Option<SyncWorker>>,
}

impl<T: SnapshotData> SnapshotManager<T> {
    pub fn new() -> Self {
        Self {
            stores: Arc::new(RwLock::new(BTreeMap::new())),
            persistence: None,
            category_source: None,
            simulated_configs: Vec::new(),
            collaborator_timeout: DEFAULT_COLLABORATOR_TIMEOUT,
            sync_worker: Mutex::new(None),
        }
    }

    /// Backend handed to every store this manager creates.
    pub fn with_persistence(mut self, persistence: Arc<dyn SnapshotPersistence>) -> Self {
        self.persistence = Some(persistence);
        self
    }

    pub fn with_category_source(mut self, source: Arc<dyn CategorySource>) -> Self {
        self.category_source = Some(source);
        self
    }

    /// Fixture configurations served when a [`DelegateContext`] asks for
    /// simulated data.
    pub fn with_simulated_configs(mut self, configs: Vec<SnapshotStoreConfig>) -> Self {
        self.simulated_configs = configs;
        self
    }

    pub fn with_collaborator_timeout(mut self, timeout: Duration) -> Self {
        self.collaborator_timeout = timeout;
        self
    }

    /// Create and register a store.
    ///
    /// When the config names a category but carries no schema, the schema is
    /// fetched from the category source. The store keeps its own copy of the
    /// config, so one template may configure several stores.
    pub fn configure_snapshot_store(&self, config: SnapshotStoreConfig) -> Result<Arc<SnapshotStore<T>>> {
        config.validate()?;
        if self.stores.read().contains_key(&config.store_id) {
            return Err(StoreError::StoreExists(config.store_id));
        }

        let config = self.resolve_schema(config)?;
        let store = Arc::new(SnapshotStore::with_persistence(
            config,
            self.persistence.clone(),
        )?);

        match self.stores.write().entry(store.store_id().to_string()) {
            Entry::Occupied(entry) => return Err(StoreError::StoreExists(entry.key().clone())),
            Entry::Vacant(entry) => {
                entry.insert(Arc::clone(&store));
            }
        }

        info!(store = %store.store_id(), category = ?store.config().category, "configured snapshot store");
        Ok(store)
    }

    fn resolve_schema(&self, mut config: SnapshotStoreConfig) -> Result<SnapshotStoreConfig> {
        let (category, source) = match (&config.category, &self.category_source) {
            (Some(category), Some(source)) if config.schema.is_empty() => {
                (category.clone(), Arc::clone(source))
            }
            _ => return Ok(config),
        };

        let metadata = call_with_timeout(
            "fetch_category_by_name",
            self.collaborator_timeout,
            move || source.fetch_category_by_name(&category),
        )?;
        if let Some(schema) = metadata.schema {
            debug!(store = %config.store_id, category = %metadata.name, fields = schema.fields.len(), "resolved schema from category");
            config.schema = schema;
        }
        Ok(config)
    }

    pub fn find_snapshot_store_by_id(&self, store_id: &str) -> Option<Arc<SnapshotStore<T>>> {
        self.stores.read().get(store_id).cloned()
    }

    /// Ids of all registered stores, sorted.
    pub fn store_ids(&self) -> Vec<String> {
        self.stores.read().keys().cloned().collect()
    }

    /// Unregister a store. Pending notifications are delivered first.
    pub fn discard_snapshot_store(&self, store_id: &str) -> Result<()> {
        let store = self
            .stores
            .write()
            .remove(store_id)
            .ok_or_else(|| StoreError::StoreNotFound(store_id.to_string()))?;
        store.flush_notifications();

        info!(store = %store_id, snapshots = store.len(), "discarded snapshot store");
        Ok(())
    }

    /// The configured category, else the most common category among the
    /// store's snapshots (ties broken by name), else [`DEFAULT_CATEGORY`].
    pub fn determine_snapshot_store_category(&self, store_id: &str) -> Result<String> {
        let store = self
            .find_snapshot_store_by_id(store_id)
            .ok_or_else(|| StoreError::StoreNotFound(store_id.to_string()))?;

        if let Some(ref category) = store.config().category {
            return Ok(category.clone());
        }

        // Counts come sorted by name, so the first maximum wins ties.
        let mut best: Option<(String, usize)> = None;
        for (category, count) in store.category_counts() {
            if best.as_ref().map_or(true, |(_, max)| count > *max) {
                best = Some((category, count));
            }
        }
        Ok(best.map_or_else(|| DEFAULT_CATEGORY.to_string(), |(category, _)| category))
    }

    /// Store configurations from the simulated fixtures or the real
    /// category source, as `context` says. A context asking for real data
    /// without a source configured is an error, never a silent fallback.
    pub fn get_delegate(&self, context: &DelegateContext) -> Result<Vec<SnapshotStoreConfig>> {
        let configs = match context.use_simulated_data_source {
            true => self
                .simulated_configs
                .iter()
                .filter(|c| context.store_id.as_deref().map_or(true, |id| c.store_id == id))
                .cloned()
                .collect(),
            false => {
                let source = self.category_source.clone().ok_or_else(|| {
                    StoreError::InvalidConfig("no category source for real data".to_string())
                })?;
                let store_id = context.store_id.clone();
                call_with_timeout(
                    "fetch_snapshot_store_data",
                    context.timeout.unwrap_or(self.collaborator_timeout),
                    move || source.fetch_snapshot_store_data(store_id.as_deref()),
                )?
            }
        };

        for config in &configs {
            config.validate()?;
        }
        debug!(simulated = context.use_simulated_data_source, count = configs.len(), "resolved delegate configs");
        Ok(configs)
    }

    /// First store, in id order, holding a snapshot with this id.
    pub fn find_snapshot(&self, snapshot_id: &str) -> Option<(String, Snapshot<T>)> {
        let stores: Vec<Arc<SnapshotStore<T>>> = self.stores.read().values().cloned().collect();
        stores.into_iter().find_map(|store| {
            store
                .get_snapshot(snapshot_id)
                .ok()
                .map(|snapshot| (store.store_id().to_string(), snapshot))
        })
    }

    /// Start the background sync thread. Does nothing if it already runs.
    pub fn start_sync_worker(&self, poll_interval: Duration) -> Result<()> {
        if poll_interval.is_zero() {
            return Err(StoreError::InvalidConfig(
                "sync poll interval must be positive".to_string(),
            ));
        }

        let mut worker = self.sync_worker.lock();
        if worker.is_none() {
            *worker = Some(SyncWorker::spawn(Arc::clone(&self.stores), poll_interval)?);
            debug!(?poll_interval, "started sync worker");
        }
        Ok(())
    }

    /// Stop the background sync thread, returning its counters if it ran.
    pub fn stop_sync_worker(&self) -> Option<SyncStats> {
        self.sync_worker.lock().take().map(SyncWorker::stop)
    }

    /// Stop the sync thread and unregister every store after delivering
    /// its pending notifications.
    pub fn shutdown(&self) {
        self.stop_sync_worker();

        let stores = std::mem::take(&mut *self.stores.write());
        for store in stores.values() {
            store.flush_notifications();
        }
        info!(stores = stores.len(), "snapshot manager shut down");
    }
}

impl<T: SnapshotData> Default for SnapshotManager<T> {
    fn default() -> Self {
        Self::new()
    }
}
