//! Main SnapshotStore tying the index, subscribers and persistence together.

mod batch;
mod locks;

pub use batch::{BatchFetchResult, BatchUpdateResult, SnapshotUpdate, TakenSnapshots};

use crate::config::SnapshotStoreConfig;
use crate::error::{Result, StoreError};
use crate::persistence::{PersistedSnapshot, SnapshotPersistence};
use crate::snapshot::{Snapshot, SnapshotInput};
use crate::subscriptions::{
    ChangeEvent, NotificationDispatcher, NotificationReport, Subscriber, SubscriberId,
    SubscriberRegistry, SubscriptionFilter, SubscriptionHandle,
};
use crate::types::{version_id, SnapshotData, StoreStats, Timestamp, Version};
use locks::LockTable;
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, warn};

/// Mutable contents of a store, guarded by one lock so the id map and the
/// category index never diverge.
struct StoreState<T> {
    /// Current version of every live snapshot.
    snapshots: BTreeMap<String, Snapshot<T>>,

    /// Superseded versions per id, oldest first.
    history: HashMap<String, Vec<Snapshot<T>>>,

    /// Category to live snapshot ids.
    category_index: HashMap<String, BTreeSet<String>>,

    /// Ids created since the last clear, live or deleted. Swept ids are
    /// released.
    known_ids: HashSet<String>,
}

impl<T: Clone> StoreState<T> {
    fn new() -> Self {
        Self {
            snapshots: BTreeMap::new(),
            history: HashMap::new(),
            category_index: HashMap::new(),
            known_ids: HashSet::new(),
        }
    }

    fn insert_new(&mut self, snapshot: Snapshot<T>) {
        if let Some(ref parent_id) = snapshot.parent_id {
            if let Some(parent) = self.snapshots.get_mut(parent_id) {
                parent.child_ids.insert(snapshot.id.clone());
            } else if self.known_ids.contains(parent_id) {
                warn!(snapshot = %snapshot.id, parent = %parent_id, "parent snapshot was deleted");
            } else {
                warn!(snapshot = %snapshot.id, parent = %parent_id, "dangling parent reference");
            }
        }

        self.category_index
            .entry(snapshot.category.clone())
            .or_default()
            .insert(snapshot.id.clone());
        self.known_ids.insert(snapshot.id.clone());
        self.snapshots.insert(snapshot.id.clone(), snapshot);
    }

    /// Replace the current version of `next.id`, archiving the old one.
    /// Returns the committed version.
    fn commit_version(&mut self, mut next: Snapshot<T>, max_versions: Option<usize>) -> Snapshot<T> {
        let id = next.id.clone();
        if let Some(mut previous) = self.snapshots.remove(&id) {
            // Children may have been linked since the caller read `previous`.
            next.child_ids = previous.child_ids.clone();
            previous.next_version_id = Some(version_id(&id, next.version));

            let archive = self.history.entry(id.clone()).or_default();
            archive.push(previous);
            if let Some(max) = max_versions {
                if archive.len() > max {
                    let excess = archive.len() - max;
                    archive.drain(..excess);
                }
            }
        }
        self.snapshots.insert(id, next.clone());
        next
    }

    fn remove(&mut self, id: &str) -> Option<Snapshot<T>> {
        let removed = self.snapshots.remove(id)?;

        if let Some(ids) = self.category_index.get_mut(&removed.category) {
            ids.remove(id);
            if ids.is_empty() {
                self.category_index.remove(&removed.category);
            }
        }
        self.history.remove(id);

        if let Some(ref parent_id) = removed.parent_id {
            if let Some(parent) = self.snapshots.get_mut(parent_id) {
                parent.child_ids.remove(id);
            }
        }
        for child in &removed.child_ids {
            if self.snapshots.contains_key(child) {
                warn!(snapshot = %child, parent = %id, "child keeps a dangling parent reference");
            }
        }

        Some(removed)
    }
}

impl<T: Clone> Snapshot<T> {
    /// Next version of this snapshot carrying `data`.
    fn next_version(&self, data: T, now: Timestamp) -> Snapshot<T> {
        let mut next = self.clone();
        next.data = data;
        next.version = self.version.next();
        next.updated_at = now.max(self.updated_at);
        next.previous_version_id = Some(version_id(&self.id, self.version));
        next.next_version_id = None;
        next
    }
}

/// Top-level fields whose values differ. Non-object payloads report `$`.
fn changed_fields(old: &serde_json::Value, new: &serde_json::Value) -> Vec<String> {
    match (old, new) {
        (serde_json::Value::Object(a), serde_json::Value::Object(b)) => {
            let keys: BTreeSet<&String> = a.keys().chain(b.keys()).collect();
            keys.into_iter()
                .filter(|k| a.get(*k) != b.get(*k))
                .cloned()
                .collect()
        }
        (a, b) if a == b => Vec::new(),
        _ => vec!["$".to_string()],
    }
}

/// The snapshot store.
///
/// Provides a unified interface for:
/// - Creating, updating (versioning) and deleting snapshots
/// - Category and criteria queries
/// - All-or-nothing batch updates and point-in-time copies
/// - Subscriber registration and change notification
///
/// Reads share a read lock. Writers to the same id are serialized by a
/// per-id lock; batch operations and sweeps exclude all other writers for
/// the duration of validation and commit only.
pub struct SnapshotStore<T: SnapshotData> {
    /// Own copy of the configuration this store was created from.
    config: SnapshotStoreConfig,

    state: RwLock<StoreState<T>>,

    id_locks: LockTable,

    /// Single writes hold the read side, batches and sweeps the write side.
    batch_gate: RwLock<()>,

    subscribers: Arc<SubscriberRegistry<T>>,

    dispatcher: NotificationDispatcher<T>,

    persistence: Option<Arc<dyn SnapshotPersistence>>,
}

impl<T: SnapshotData> SnapshotStore<T> {
    /// Create a store without a persistence backend.
    pub fn new(config: SnapshotStoreConfig) -> Result<Self> {
        Self::with_persistence(config, None)
    }

    /// Create a store that hands committed versions to `persistence` when
    /// `auto_save` is on, and on explicit [`sync`](Self::sync).
    pub fn with_persistence(
        config: SnapshotStoreConfig,
        persistence: Option<Arc<dyn SnapshotPersistence>>,
    ) -> Result<Self> {
        config.validate()?;

        let subscribers = Arc::new(SubscriberRegistry::new());
        let dispatcher = NotificationDispatcher::spawn(&config.store_id, Arc::clone(&subscribers));

        Ok(Self {
            config,
            state: RwLock::new(StoreState::new()),
            id_locks: LockTable::new(),
            batch_gate: RwLock::new(()),
            subscribers,
            dispatcher,
            persistence,
        })
    }

    pub fn store_id(&self) -> &str {
        &self.config.store_id
    }

    pub fn config(&self) -> &SnapshotStoreConfig {
        &self.config
    }

    // --- Snapshot Operations ---

    /// Create version 1 of a snapshot.
    ///
    /// The payload is validated against the store schema before anything is
    /// touched. Snapshots without an explicit expiration inherit the
    /// retention period. An id that was deleted stays taken until the store
    /// is cleared.
    pub fn create_snapshot(&self, input: SnapshotInput<T>) -> Result<Snapshot<T>> {
        if input.id.is_empty() {
            return Err(StoreError::schema("id", "snapshot id must not be empty"));
        }
        self.check_payload(&serde_json::to_value(&input.data)?)?;

        let _gate = self.batch_gate.read();
        let id_lock = self.id_locks.get(&input.id);
        let _id_guard = id_lock.lock();

        let now = Timestamp::now();
        let mut input = input;
        if input.expiration_date.is_none() {
            if let Some(period) = self.config.retention_policy.retention_period {
                input.expiration_date = Some(now.saturating_add(period));
            }
        }
        let snapshot = input.into_snapshot(now);

        self.check_insertable(&self.state.read(), &snapshot.id)?;
        self.persist(&[&snapshot])?;

        // Creates of other ids may have filled the store while persisting.
        let mut state = self.state.write();
        if let Err(e) = self.check_insertable(&state, &snapshot.id) {
            drop(state);
            self.discard_persisted(&snapshot.id);
            return Err(e);
        }
        state.insert_new(snapshot.clone());
        self.publish(ChangeEvent::created(&self.config.store_id, &snapshot));
        drop(state);

        debug!(store = %self.config.store_id, snapshot = %snapshot.id, category = %snapshot.category, "created snapshot");
        Ok(snapshot)
    }

    /// Write a new version of a snapshot under the same id.
    ///
    /// The version number is incremented, `previous_version_id` points at the
    /// replaced version, and the replaced version is archived with its
    /// `next_version_id` set.
    pub fn update_snapshot(&self, id: &str, data: T) -> Result<Snapshot<T>> {
        let new_payload = serde_json::to_value(&data)?;

        let _gate = self.batch_gate.read();
        let id_lock = self.id_locks.get(id);
        let _id_guard = id_lock.lock();

        let current = self
            .state
            .read()
            .snapshots
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        self.check_payload(&new_payload)?;

        let changed = changed_fields(&serde_json::to_value(&current.data)?, &new_payload);
        let next = current.next_version(data, Timestamp::now());
        self.persist(&[&next])?;

        let mut state = self.state.write();
        let committed = state.commit_version(next, self.config.retention_policy.max_versions);
        self.publish(ChangeEvent::updated(
            &self.config.store_id,
            &current,
            &committed,
            changed,
        ));
        drop(state);

        debug!(store = %self.config.store_id, snapshot = %id, version = %committed.version, "updated snapshot");
        Ok(committed)
    }

    /// Remove a snapshot. Its children keep their (now dangling) parent id.
    ///
    /// Deletion is final: the id cannot be created again until
    /// [`clear_snapshots`](Self::clear_snapshots).
    pub fn delete_snapshot(&self, id: &str) -> Result<()> {
        let _gate = self.batch_gate.read();
        let id_lock = self.id_locks.get(id);
        let _id_guard = id_lock.lock();

        if !self.contains(id) {
            return Err(StoreError::NotFound(id.to_string()));
        }
        if let Some(backend) = self.saving_backend() {
            backend.delete(&self.config.store_id, id)?;
        }

        let mut state = self.state.write();
        if let Some(removed) = state.remove(id) {
            self.publish(ChangeEvent::deleted(&self.config.store_id, &removed));
        }
        drop(state);

        debug!(store = %self.config.store_id, snapshot = %id, "deleted snapshot");
        Ok(())
    }

    /// Get the current version of a snapshot.
    pub fn get_snapshot(&self, id: &str) -> Result<Snapshot<T>> {
        self.state
            .read()
            .snapshots
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    /// Get a specific version, current or archived.
    pub fn get_snapshot_version(&self, id: &str, version: Version) -> Result<Snapshot<T>> {
        let state = self.state.read();
        let current = state
            .snapshots
            .get(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        if current.version == version {
            return Ok(current.clone());
        }
        state
            .history
            .get(id)
            .and_then(|versions| versions.iter().find(|s| s.version == version))
            .cloned()
            .ok_or_else(|| StoreError::NotFound(version_id(id, version)))
    }

    /// Retained versions of a snapshot, oldest first, ending with the current one.
    pub fn get_version_history(&self, id: &str) -> Result<Vec<Snapshot<T>>> {
        let state = self.state.read();
        let current = state
            .snapshots
            .get(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        let mut versions = state.history.get(id).cloned().unwrap_or_default();
        versions.push(current.clone());
        Ok(versions)
    }

    /// Unexpired snapshots of a category, by timestamp then id.
    pub fn get_snapshots_by_category(&self, category: &str) -> Vec<Snapshot<T>> {
        let now = Timestamp::now();
        self.collect_category(category, |s| !s.is_expired_at(now))
    }

    /// All snapshots of a category including expired ones, by timestamp then id.
    pub fn get_snapshots_by_category_with_expired(&self, category: &str) -> Vec<Snapshot<T>> {
        self.collect_category(category, |_| true)
    }

    fn collect_category<F>(&self, category: &str, keep: F) -> Vec<Snapshot<T>>
    where
        F: Fn(&Snapshot<T>) -> bool,
    {
        let mut found: Vec<Snapshot<T>> = {
            let state = self.state.read();
            state
                .category_index
                .get(category)
                .into_iter()
                .flatten()
                .filter_map(|id| state.snapshots.get(id))
                .filter(|s| keep(s))
                .cloned()
                .collect()
        };
        found.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.id.cmp(&b.id)));
        found
    }

    /// True iff the id is non-empty, the timestamp is a valid instant and
    /// the payload is not null.
    pub fn validate_snapshot(&self, snapshot: &Snapshot<T>) -> bool {
        !snapshot.id.is_empty()
            && snapshot.timestamp.is_valid()
            && serde_json::to_value(&snapshot.data).map_or(false, |v| !v.is_null())
    }

    /// Add tags to a snapshot. Tags are bookkeeping: no new version is written.
    /// With `auto_save`, the current version is re-saved with the new tags.
    pub fn add_tags<I, S>(&self, id: &str, tags: I) -> Result<Snapshot<T>>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let tags: Vec<String> = tags.into_iter().map(Into::into).collect();
        self.modify_tags(id, |set| set.extend(tags))
    }

    /// Remove tags from a snapshot.
    pub fn remove_tags<I, S>(&self, id: &str, tags: I) -> Result<Snapshot<T>>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let tags: Vec<S> = tags.into_iter().collect();
        self.modify_tags(id, |set| {
            for tag in &tags {
                set.remove(tag.as_ref());
            }
        })
    }

    fn modify_tags<F>(&self, id: &str, edit: F) -> Result<Snapshot<T>>
    where
        F: FnOnce(&mut BTreeSet<String>),
    {
        let _gate = self.batch_gate.read();
        let id_lock = self.id_locks.get(id);
        let _id_guard = id_lock.lock();

        let before = self.get_snapshot(id)?;
        let mut after = before.clone();
        edit(&mut after.tags);
        if before.tags == after.tags {
            return Ok(after);
        }
        if let Some(backend) = self.saving_backend() {
            backend.upsert(PersistedSnapshot::from_snapshot(
                &self.config.store_id,
                &after,
                self.config.encoding,
            )?)?;
        }

        let mut state = self.state.write();
        if let Some(current) = state.snapshots.get_mut(id) {
            current.tags = after.tags.clone();
            after = current.clone();
        }
        self.publish(ChangeEvent::updated(
            &self.config.store_id,
            &before,
            &after,
            vec!["tags".to_string()],
        ));
        Ok(after)
    }

    /// Ids of all live snapshots, in order.
    pub fn snapshot_ids(&self) -> Vec<String> {
        self.state.read().snapshots.keys().cloned().collect()
    }

    /// Categories that currently hold snapshots, sorted.
    pub fn categories(&self) -> Vec<String> {
        let mut categories: Vec<String> =
            self.state.read().category_index.keys().cloned().collect();
        categories.sort();
        categories
    }

    /// Number of snapshots per category.
    pub fn category_counts(&self) -> BTreeMap<String, usize> {
        self.state
            .read()
            .category_index
            .iter()
            .map(|(category, ids)| (category.clone(), ids.len()))
            .collect()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.state.read().snapshots.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.state.read().snapshots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.read().snapshots.is_empty()
    }

    // --- Lifecycle ---

    /// Remove every snapshot and its history. Returns how many were removed.
    ///
    /// Deleted ids become available again. With `auto_save`, the persisted
    /// versions of the removed snapshots are deleted first; a backend
    /// failure leaves the store untouched.
    pub fn clear_snapshots(&self) -> Result<usize> {
        let _gate = self.batch_gate.write();
        self.delete_persisted(&self.snapshot_ids())?;

        let mut state = self.state.write();
        let removed = std::mem::take(&mut state.snapshots);
        state.history.clear();
        state.category_index.clear();
        state.known_ids.clear();
        if !removed.is_empty() {
            self.publish(ChangeEvent::cleared(&self.config.store_id, removed.values()));
        }
        drop(state);
        self.id_locks.prune();

        debug!(store = %self.config.store_id, count = removed.len(), "cleared snapshots");
        Ok(removed.len())
    }

    /// Remove snapshots expired at `now` when the retention policy asks for
    /// cleanup. Returns the removed ids.
    ///
    /// Swept ids may be created again. With `auto_save`, their persisted
    /// versions are deleted too.
    pub fn sweep_expired(&self, now: Timestamp) -> Result<Vec<String>> {
        if !self.config.retention_policy.cleanup_on_expiration {
            return Ok(Vec::new());
        }

        let _gate = self.batch_gate.write();
        let expired: Vec<String> = self
            .state
            .read()
            .snapshots
            .values()
            .filter(|s| s.is_expired_at(now))
            .map(|s| s.id.clone())
            .collect();
        if expired.is_empty() {
            return Ok(expired);
        }
        self.delete_persisted(&expired)?;

        let mut state = self.state.write();
        for id in &expired {
            if let Some(removed) = state.remove(id) {
                state.known_ids.remove(id);
                self.publish(ChangeEvent::expired(&self.config.store_id, &removed));
            }
        }
        drop(state);
        self.id_locks.prune();

        debug!(store = %self.config.store_id, count = expired.len(), "swept expired snapshots");
        Ok(expired)
    }

    /// Upsert the current version of every snapshot to the persistence
    /// backend. Returns how many records were written.
    pub fn sync(&self) -> Result<usize> {
        let backend = match self.persistence {
            Some(ref backend) => backend,
            None => return Ok(0),
        };

        let records: Vec<PersistedSnapshot> = {
            let state = self.state.read();
            state
                .snapshots
                .values()
                .map(|s| PersistedSnapshot::from_snapshot(&self.config.store_id, s, self.config.encoding))
                .collect::<Result<_>>()?
        };

        let count = records.len();
        for record in records {
            backend.upsert(record)?;
        }
        debug!(store = %self.config.store_id, count, "synced snapshots");
        Ok(count)
    }

    /// Get store statistics.
    pub fn stats(&self) -> StoreStats {
        let now = Timestamp::now();
        let state = self.state.read();
        StoreStats {
            snapshot_count: state.snapshots.len() as u64,
            category_count: state.category_index.len() as u64,
            archived_version_count: state.history.values().map(|v| v.len() as u64).sum(),
            expired_count: state
                .snapshots
                .values()
                .filter(|s| s.is_expired_at(now))
                .count() as u64,
            subscriber_count: self.subscribers.len() as u64,
        }
    }

    // --- Subscriptions ---

    pub fn add_subscriber(&self, subscriber: Subscriber<T>) {
        self.subscribers.add_subscriber(subscriber);
    }

    /// Register a callback subscriber.
    pub fn subscribe<F>(&self, id: impl Into<SubscriberId>, filter: SubscriptionFilter, callback: F)
    where
        F: Fn(&ChangeEvent<T>) -> std::result::Result<(), String> + Send + Sync + 'static,
    {
        self.subscribers
            .add_subscriber(Subscriber::new(id, filter, callback));
    }

    /// Register a channel subscriber buffered per `notification_buffer`.
    pub fn subscribe_channel(
        &self,
        id: impl Into<SubscriberId>,
        filter: SubscriptionFilter,
    ) -> SubscriptionHandle<T> {
        self.subscribers
            .subscribe_channel(id, filter, self.config.notification_buffer)
    }

    pub fn remove_subscriber(&self, id: &SubscriberId) -> bool {
        self.subscribers.remove_subscriber(id)
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    /// Deliver `event` synchronously to the listed subscribers whose filter
    /// matches. Failures are returned in the report, never raised.
    pub fn notify_subscribers(
        &self,
        event: &ChangeEvent<T>,
        subscribers: &[SubscriberId],
    ) -> NotificationReport {
        self.subscribers.notify_subscribers(event, subscribers)
    }

    /// Wait until every change committed so far has been delivered.
    pub fn flush_notifications(&self) {
        self.dispatcher.flush();
    }

    /// Delivery failures from background notification since the last call.
    pub fn take_delivery_errors(&self) -> Vec<StoreError> {
        self.dispatcher.take_errors()
    }

    // --- Private Helpers ---

    fn check_payload(&self, payload: &serde_json::Value) -> Result<()> {
        if payload.is_null() {
            return Err(StoreError::schema("$", "payload must not be null"));
        }
        self.config.schema.validate(payload)
    }

    fn saving_backend(&self) -> Option<&Arc<dyn SnapshotPersistence>> {
        self.persistence.as_ref().filter(|_| self.config.auto_save)
    }

    /// Reject ids that are live, or deleted since the last clear, and creates
    /// past the snapshot limit.
    fn check_insertable(&self, state: &StoreState<T>, id: &str) -> Result<()> {
        if state.known_ids.contains(id) {
            return Err(StoreError::DuplicateId(id.to_string()));
        }
        if let Some(limit) = self.config.snapshot_limit {
            if state.snapshots.len() >= limit {
                return Err(StoreError::SnapshotLimitExceeded { limit });
            }
        }
        Ok(())
    }

    /// Remove the persisted versions of `ids` when `auto_save` is on.
    fn delete_persisted(&self, ids: &[String]) -> Result<()> {
        if let Some(backend) = self.saving_backend() {
            for id in ids {
                backend.delete(&self.config.store_id, id)?;
            }
        }
        Ok(())
    }

    /// Undo the write of a create that lost its slot.
    fn discard_persisted(&self, id: &str) {
        if let Some(backend) = self.saving_backend() {
            if let Err(e) = backend.delete(&self.config.store_id, id) {
                warn!(store = %self.config.store_id, snapshot = %id, error = %e, "failed to discard persisted version");
            }
        }
    }

    /// Hand new versions to the backend when `auto_save` is on.
    fn persist(&self, versions: &[&Snapshot<T>]) -> Result<()> {
        let backend = match self.saving_backend() {
            Some(backend) => backend,
            None => return Ok(()),
        };

        let mut records = versions
            .iter()
            .map(|s| PersistedSnapshot::from_snapshot(&self.config.store_id, s, self.config.encoding))
            .collect::<Result<Vec<_>>>()?;

        if records.len() == 1 {
            backend.insert(records.remove(0))
        } else {
            backend.insert_batch(records)
        }
    }

    /// Queue an event for every matching subscriber. Called with the state
    /// write lock held so the queue follows commit order.
    fn publish(&self, event: ChangeEvent<T>) -> Vec<SubscriberId> {
        let recipients = self.subscribers.matching(&event);
        if !recipients.is_empty() {
            self.dispatcher.enqueue(event, recipients.clone());
        }
        recipients
    }
}
