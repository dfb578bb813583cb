//! The snapshot record and its create request.

use crate::types::{SnapshotData, Timestamp, Version};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Lifecycle state of a live snapshot.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotStatus {
    Active,
    Expired,
}

/// A versioned record of a payload at a point in time.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Snapshot<T> {
    /// Unique within its store, never changes.
    pub id: String,

    pub category: String,

    pub data: T,

    /// When the first version was created.
    pub timestamp: Timestamp,

    pub created_by: Option<String>,

    /// When this version was written.
    pub updated_at: Timestamp,

    pub parent_id: Option<String>,

    pub child_ids: BTreeSet<String>,

    pub tags: BTreeSet<String>,

    pub version: Version,

    /// `"{id}@{version}"` of the version this one replaced.
    pub previous_version_id: Option<String>,

    /// `"{id}@{version}"` of the version that replaced this one.
    /// Only set on archived versions.
    pub next_version_id: Option<String>,

    pub expiration_date: Option<Timestamp>,

    pub is_compressed: bool,

    pub is_encrypted: bool,

    /// Free-form extra fields.
    pub metadata: BTreeMap<String, serde_json::Value>,
}

impl<T> Snapshot<T> {
    /// Compares against the clock at call time.
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Timestamp::now())
    }

    pub fn is_expired_at(&self, now: Timestamp) -> bool {
        match self.expiration_date {
            Some(expires) => now > expires,
            None => false,
        }
    }

    pub fn status(&self) -> SnapshotStatus {
        if self.is_expired() {
            SnapshotStatus::Expired
        } else {
            SnapshotStatus::Active
        }
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.contains(tag)
    }
}

impl<T: SnapshotData> Snapshot<T> {
    /// Projection handed to presentation layers.
    pub fn to_serializable(&self) -> crate::Result<SerializableSnapshot> {
        Ok(SerializableSnapshot {
            id: self.id.clone(),
            category: self.category.clone(),
            timestamp: self.timestamp.as_millis(),
            data: serde_json::to_value(&self.data)?,
            version: self.version.0,
        })
    }
}

/// Transport form of a snapshot.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SerializableSnapshot {
    pub id: String,
    pub category: String,
    /// Milliseconds since Unix epoch.
    pub timestamp: i64,
    pub data: serde_json::Value,
    pub version: u64,
}

/// Input for creating a new snapshot (before version and timestamps are assigned).
#[derive(Clone, Debug)]
pub struct SnapshotInput<T> {
    pub id: String,
    pub category: String,
    pub data: T,
    pub tags: BTreeSet<String>,
    pub parent_id: Option<String>,
    pub created_by: Option<String>,
    pub expiration_date: Option<Timestamp>,
    pub is_compressed: bool,
    pub is_encrypted: bool,
    pub metadata: BTreeMap<String, serde_json::Value>,
}

impl<T> SnapshotInput<T> {
    pub fn new(id: impl Into<String>, category: impl Into<String>, data: T) -> Self {
        Self {
            id: id.into(),
            category: category.into(),
            data,
            tags: BTreeSet::new(),
            parent_id: None,
            created_by: None,
            expiration_date: None,
            is_compressed: false,
            is_encrypted: false,
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_parent(mut self, parent_id: impl Into<String>) -> Self {
        self.parent_id = Some(parent_id.into());
        self
    }

    pub fn with_created_by(mut self, created_by: impl Into<String>) -> Self {
        self.created_by = Some(created_by.into());
        self
    }

    pub fn with_expiration(mut self, expires: Timestamp) -> Self {
        self.expiration_date = Some(expires);
        self
    }

    pub fn with_flags(mut self, compressed: bool, encrypted: bool) -> Self {
        self.is_compressed = compressed;
        self.is_encrypted = encrypted;
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Builds version 1 of the snapshot.
    pub(crate) fn into_snapshot(self, now: Timestamp) -> Snapshot<T> {
        Snapshot {
            id: self.id,
            category: self.category,
            data: self.data,
            timestamp: now,
            created_by: self.created_by,
            updated_at: now,
            parent_id: self.parent_id,
            child_ids: BTreeSet::new(),
            tags: self.tags,
            version: Version::INITIAL,
            previous_version_id: None,
            next_version_id: None,
            expiration_date: self.expiration_date,
            is_compressed: self.is_compressed,
            is_encrypted: self.is_encrypted,
            metadata: self.metadata,
        }
    }
}
