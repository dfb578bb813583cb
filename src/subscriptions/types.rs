//! Subscription types for store change notifications.

use crate::snapshot::Snapshot;
use crate::types::{Timestamp, Version};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

/// Unique identifier for a subscriber within a store.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SubscriberId(pub String);

impl SubscriberId {
    pub fn new(id: impl Into<String>) -> Self {
        SubscriberId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for SubscriberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SubscriberId({})", self.0)
    }
}

impl fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for SubscriberId {
    fn from(id: &str) -> Self {
        SubscriberId(id.to_string())
    }
}

impl From<String> for SubscriberId {
    fn from(id: String) -> Self {
        SubscriberId(id)
    }
}

/// What happened. Doubles as the event topic.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Created,
    Updated,
    Deleted,
    Expired,
    Fetched,
    Cleared,
}

impl ChangeKind {
    pub fn topic(self) -> &'static str {
        match self {
            ChangeKind::Created => "created",
            ChangeKind::Updated => "updated",
            ChangeKind::Deleted => "deleted",
            ChangeKind::Expired => "expired",
            ChangeKind::Fetched => "fetched",
            ChangeKind::Cleared => "cleared",
        }
    }
}

/// A change notification delivered to subscribers.
///
/// Single-snapshot changes carry exactly one id, category and version.
/// Fetch and clear events cover every snapshot they touched.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent<T> {
    pub store_id: String,
    pub kind: ChangeKind,
    pub snapshot_ids: Vec<String>,
    pub categories: BTreeSet<String>,
    pub tags: BTreeSet<String>,
    pub version: Option<Version>,
    pub old_data: Option<T>,
    pub new_data: Option<T>,
    /// Top-level payload fields that differ between old and new data.
    pub changed_fields: Vec<String>,
    pub timestamp: Timestamp,
}

impl<T: Clone> ChangeEvent<T> {
    fn single(store_id: &str, kind: ChangeKind, snapshot: &Snapshot<T>) -> Self {
        Self {
            store_id: store_id.to_string(),
            kind,
            snapshot_ids: vec![snapshot.id.clone()],
            categories: BTreeSet::from([snapshot.category.clone()]),
            tags: snapshot.tags.clone(),
            version: Some(snapshot.version),
            old_data: None,
            new_data: None,
            changed_fields: Vec::new(),
            timestamp: Timestamp::now(),
        }
    }

    fn many<'a, I>(store_id: &str, kind: ChangeKind, snapshots: I) -> Self
    where
        T: 'a,
        I: IntoIterator<Item = &'a Snapshot<T>>,
    {
        let mut event = Self {
            store_id: store_id.to_string(),
            kind,
            snapshot_ids: Vec::new(),
            categories: BTreeSet::new(),
            tags: BTreeSet::new(),
            version: None,
            old_data: None,
            new_data: None,
            changed_fields: Vec::new(),
            timestamp: Timestamp::now(),
        };
        for snapshot in snapshots {
            event.snapshot_ids.push(snapshot.id.clone());
            event.categories.insert(snapshot.category.clone());
            event.tags.extend(snapshot.tags.iter().cloned());
        }
        event
    }

    pub fn created(store_id: &str, snapshot: &Snapshot<T>) -> Self {
        let mut event = Self::single(store_id, ChangeKind::Created, snapshot);
        event.new_data = Some(snapshot.data.clone());
        event
    }

    pub fn updated(
        store_id: &str,
        old: &Snapshot<T>,
        new: &Snapshot<T>,
        changed_fields: Vec<String>,
    ) -> Self {
        let mut event = Self::single(store_id, ChangeKind::Updated, new);
        event.tags.extend(old.tags.iter().cloned());
        event.old_data = Some(old.data.clone());
        event.new_data = Some(new.data.clone());
        event.changed_fields = changed_fields;
        event
    }

    pub fn deleted(store_id: &str, snapshot: &Snapshot<T>) -> Self {
        let mut event = Self::single(store_id, ChangeKind::Deleted, snapshot);
        event.old_data = Some(snapshot.data.clone());
        event
    }

    pub fn expired(store_id: &str, snapshot: &Snapshot<T>) -> Self {
        let mut event = Self::single(store_id, ChangeKind::Expired, snapshot);
        event.old_data = Some(snapshot.data.clone());
        event
    }

    pub fn fetched<'a, I>(store_id: &str, snapshots: I) -> Self
    where
        T: 'a,
        I: IntoIterator<Item = &'a Snapshot<T>>,
    {
        Self::many(store_id, ChangeKind::Fetched, snapshots)
    }

    pub fn cleared<'a, I>(store_id: &str, snapshots: I) -> Self
    where
        T: 'a,
        I: IntoIterator<Item = &'a Snapshot<T>>,
    {
        Self::many(store_id, ChangeKind::Cleared, snapshots)
    }
}

impl<T> ChangeEvent<T> {
    pub fn topic(&self) -> &'static str {
        self.kind.topic()
    }

    /// The affected snapshot, for single-snapshot events.
    pub fn snapshot_id(&self) -> Option<&str> {
        match self.snapshot_ids.as_slice() {
            [only] => Some(only.as_str()),
            _ => None,
        }
    }
}

/// Filter criteria for subscriptions. Unset fields match everything.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionFilter {
    pub snapshot_id: Option<String>,
    pub category: Option<String>,
    /// Matched against [`ChangeKind::topic`].
    pub topic: Option<String>,
    pub tag: Option<String>,
}

impl SubscriptionFilter {
    /// Subscribe to every change in the store.
    pub fn all() -> Self {
        Self::default()
    }

    pub fn category(category: impl Into<String>) -> Self {
        Self {
            category: Some(category.into()),
            ..Default::default()
        }
    }

    pub fn snapshot(id: impl Into<String>) -> Self {
        Self {
            snapshot_id: Some(id.into()),
            ..Default::default()
        }
    }

    pub fn topic(topic: impl Into<String>) -> Self {
        Self {
            topic: Some(topic.into()),
            ..Default::default()
        }
    }

    pub fn tag(tag: impl Into<String>) -> Self {
        Self {
            tag: Some(tag.into()),
            ..Default::default()
        }
    }

    pub fn with_topic(mut self, topic: impl Into<String>) -> Self {
        self.topic = Some(topic.into());
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = Some(tag.into());
        self
    }

    pub fn matches<T>(&self, event: &ChangeEvent<T>) -> bool {
        if let Some(ref id) = self.snapshot_id {
            if !event.snapshot_ids.iter().any(|s| s == id) {
                return false;
            }
        }
        if let Some(ref category) = self.category {
            if !event.categories.contains(category) {
                return false;
            }
        }
        if let Some(ref topic) = self.topic {
            if event.topic() != topic {
                return false;
            }
        }
        if let Some(ref tag) = self.tag {
            if !event.tags.contains(tag) {
                return false;
            }
        }
        true
    }
}

/// Callback invoked for each matching event. An `Err` is collected as a
/// delivery failure and never stops delivery to other subscribers.
pub type SubscriberCallback<T> =
    Arc<dyn Fn(&ChangeEvent<T>) -> std::result::Result<(), String> + Send + Sync>;

/// A registered listener.
#[derive(Clone)]
pub struct Subscriber<T> {
    pub id: SubscriberId,
    pub filter: SubscriptionFilter,
    pub callback: SubscriberCallback<T>,
}

impl<T> Subscriber<T> {
    pub fn new<F>(id: impl Into<SubscriberId>, filter: SubscriptionFilter, callback: F) -> Self
    where
        F: Fn(&ChangeEvent<T>) -> std::result::Result<(), String> + Send + Sync + 'static,
    {
        Self {
            id: id.into(),
            filter,
            callback: Arc::new(callback),
        }
    }
}

impl<T> fmt::Debug for Subscriber<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscriber")
            .field("id", &self.id)
            .field("filter", &self.filter)
            .finish_non_exhaustive()
    }
}

/// Outcome of one fan-out.
#[derive(Debug, Default)]
pub struct NotificationReport {
    /// Subscribers whose callback ran, successfully or not.
    pub notified: Vec<SubscriberId>,
    /// `SubscriberDeliveryFailed` diagnostics.
    pub errors: Vec<crate::StoreError>,
}

/// Handle to a channel-backed subscription.
pub struct SubscriptionHandle<T> {
    pub id: SubscriberId,
    /// Channel to receive events.
    pub receiver: crossbeam_channel::Receiver<ChangeEvent<T>>,
}

impl<T> SubscriptionHandle<T> {
    /// Receive the next event (blocking).
    pub fn recv(&self) -> Result<ChangeEvent<T>, crossbeam_channel::RecvError> {
        self.receiver.recv()
    }

    /// Try to receive an event (non-blocking).
    pub fn try_recv(&self) -> Result<ChangeEvent<T>, crossbeam_channel::TryRecvError> {
        self.receiver.try_recv()
    }

    /// Receive with timeout.
    pub fn recv_timeout(
        &self,
        timeout: std::time::Duration,
    ) -> Result<ChangeEvent<T>, crossbeam_channel::RecvTimeoutError> {
        self.receiver.recv_timeout(timeout)
    }

    /// Drain everything currently buffered.
    pub fn drain(&self) -> Vec<ChangeEvent<T>> {
        self.receiver.try_iter().collect()
    }
}
