//! Durable storage collaborator.
//!
//! The store never implements storage itself. When a store runs with
//! `auto_save`, every committed version is handed to a [`SnapshotPersistence`]
//! backend as a [`PersistedSnapshot`], one record per `(id, version)`.

mod memory;

use crate::error::Result;
use crate::snapshot::Snapshot;
use crate::types::{PayloadEncoding, SnapshotData, Timestamp, Version};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

pub use memory::InMemoryPersistence;

/// One stored version of a snapshot.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PersistedSnapshot {
    pub store_id: String,
    pub id: String,
    pub category: String,
    pub version: Version,
    /// Encoded payload, opaque to the backend.
    pub data: Vec<u8>,
    pub encoding: PayloadEncoding,
    /// When this version was written.
    pub timestamp: Timestamp,
    pub parent_id: Option<String>,
    pub expiration_date: Option<Timestamp>,
    #[serde(default)]
    pub tags: BTreeSet<String>,
}

impl PersistedSnapshot {
    pub fn from_snapshot<T: SnapshotData>(
        store_id: &str,
        snapshot: &Snapshot<T>,
        encoding: PayloadEncoding,
    ) -> Result<Self> {
        Ok(Self {
            store_id: store_id.to_string(),
            id: snapshot.id.clone(),
            category: snapshot.category.clone(),
            version: snapshot.version,
            data: encoding.encode(&snapshot.data)?,
            encoding,
            timestamp: snapshot.updated_at,
            parent_id: snapshot.parent_id.clone(),
            expiration_date: snapshot.expiration_date,
            tags: snapshot.tags.clone(),
        })
    }

    /// Decode the payload back into its typed form.
    pub fn decode_data<T: SnapshotData>(&self) -> Result<T> {
        self.encoding.decode(&self.data)
    }
}

/// Trait for snapshot persistence. Records are keyed by
/// `(store_id, id, version)`.
pub trait SnapshotPersistence: Send + Sync {
    /// Store a new version. Fails if that version is already stored.
    fn insert(&self, record: PersistedSnapshot) -> Result<()>;

    /// Store or overwrite a version.
    fn upsert(&self, record: PersistedSnapshot) -> Result<()>;

    /// Store several new versions. Backends that can should make this
    /// all-or-nothing.
    fn insert_batch(&self, records: Vec<PersistedSnapshot>) -> Result<()> {
        for record in records {
            self.insert(record)?;
        }
        Ok(())
    }

    /// All stored versions of a snapshot, oldest first.
    fn load_versions(&self, store_id: &str, id: &str) -> Result<Vec<PersistedSnapshot>>;

    /// Remove every version of a snapshot. Returns how many were removed.
    fn delete(&self, store_id: &str, id: &str) -> Result<usize>;
}
