use crate::error::{Result, StoreError};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;

use super::{PersistedSnapshot, SnapshotPersistence};

type RecordKey = (String, String, u64);

/// In-memory persistence backend.
///
/// Clone-friendly (cloning shares the same underlying storage).
#[derive(Clone, Default)]
pub struct InMemoryPersistence {
    records: Arc<RwLock<BTreeMap<RecordKey, PersistedSnapshot>>>,
}

impl InMemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }

    fn key(record: &PersistedSnapshot) -> RecordKey {
        (record.store_id.clone(), record.id.clone(), record.version.0)
    }
}

impl SnapshotPersistence for InMemoryPersistence {
    fn insert(&self, record: PersistedSnapshot) -> Result<()> {
        let key = Self::key(&record);
        let mut records = self.records.write();
        if records.contains_key(&key) {
            return Err(StoreError::Persistence(format!(
                "version {} of {} already stored",
                record.version, record.id
            )));
        }
        records.insert(key, record);
        Ok(())
    }

    fn upsert(&self, record: PersistedSnapshot) -> Result<()> {
        self.records.write().insert(Self::key(&record), record);
        Ok(())
    }

    fn insert_batch(&self, records: Vec<PersistedSnapshot>) -> Result<()> {
        let mut stored = self.records.write();
        for record in &records {
            if stored.contains_key(&Self::key(record)) {
                return Err(StoreError::Persistence(format!(
                    "version {} of {} already stored",
                    record.version, record.id
                )));
            }
        }
        for record in records {
            stored.insert(Self::key(&record), record);
        }
        Ok(())
    }

    fn load_versions(&self, store_id: &str, id: &str) -> Result<Vec<PersistedSnapshot>> {
        Ok(self
            .records
            .read()
            .values()
            .filter(|r| r.store_id == store_id && r.id == id)
            .cloned()
            .collect())
    }

    fn delete(&self, store_id: &str, id: &str) -> Result<usize> {
        let mut records = self.records.write();
        let before = records.len();
        records.retain(|(s, i, _), _| !(s == store_id && i == id));
        Ok(before - records.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{PayloadEncoding, Timestamp, Version};

    fn record(id: &str, version: u64) -> PersistedSnapshot {
        PersistedSnapshot {
            store_id: "store".into(),
            id: id.into(),
            category: "orders".into(),
            version: Version(version),
            data: b"{}".to_vec(),
            encoding: PayloadEncoding::Json,
            timestamp: Timestamp::now(),
            parent_id: None,
            expiration_date: None,
            tags: Default::default(),
        }
    }

    #[test]
    fn test_insert_rejects_existing_version() {
        let backend = InMemoryPersistence::new();
        backend.insert(record("s1", 1)).unwrap();
        assert!(matches!(
            backend.insert(record("s1", 1)),
            Err(StoreError::Persistence(_))
        ));
        backend.upsert(record("s1", 1)).unwrap();
        assert_eq!(backend.len(), 1);
    }

    #[test]
    fn test_insert_batch_is_all_or_nothing() {
        let backend = InMemoryPersistence::new();
        backend.insert(record("s2", 1)).unwrap();

        let result = backend.insert_batch(vec![record("s1", 1), record("s2", 1)]);
        assert!(result.is_err());
        assert_eq!(backend.len(), 1);
    }

    #[test]
    fn test_load_and_delete_versions() {
        let backend = InMemoryPersistence::new();
        backend.insert(record("s1", 2)).unwrap();
        backend.insert(record("s1", 1)).unwrap();
        backend.insert(record("s3", 1)).unwrap();

        let versions = backend.load_versions("store", "s1").unwrap();
        assert_eq!(
            versions.iter().map(|r| r.version).collect::<Vec<_>>(),
            vec![Version(1), Version(2)]
        );

        assert_eq!(backend.delete("store", "s1").unwrap(), 2);
        assert!(backend.load_versions("store", "s1").unwrap().is_empty());
        assert_eq!(backend.len(), 1);
    }

    #[test]
    fn test_clone_shares_storage() {
        let backend = InMemoryPersistence::new();
        let clone = backend.clone();
        backend.insert(record("s1", 1)).unwrap();
        assert_eq!(clone.len(), 1);
    }
}
