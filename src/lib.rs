//! # Snapshot Store
//!
//! An in-memory, category-partitioned store of versioned data snapshots with
//! change notification, all-or-nothing batch updates and pluggable
//! persistence.
//!
//! ## Core Concepts
//!
//! - **Snapshots**: Typed payloads with an id, category, tags and a version chain
//! - **Versions**: Updates keep the id and write version `n + 1`; older versions are archived
//! - **Subscribers**: Filtered callbacks or channels notified in commit order
//! - **Manager**: Creates stores from configs and resolves schemas by category
//!
//! ## Example
//!
//! ```ignore
//! use snapshot_store::{SnapshotInput, SnapshotManager, SnapshotStoreConfig, SubscriptionFilter};
//! use serde_json::json;
//!
//! let manager = SnapshotManager::new();
//! let store = manager.configure_snapshot_store(SnapshotStoreConfig::new("orders"))?;
//!
//! let updates = store.subscribe_channel("audit", SubscriptionFilter::category("orders"));
//!
//! store.create_snapshot(SnapshotInput::new("s1", "orders", json!({ "total": 10 })))?;
//! let v2 = store.update_snapshot("s1", json!({ "total": 20 }))?;
//! assert_eq!(v2.version.0, 2);
//! ```

pub mod config;
pub mod criteria;
pub mod error;
pub mod manager;
pub mod persistence;
pub mod schema;
pub mod snapshot;
pub mod store;
pub mod subscriptions;
pub mod types;

// Re-exports
pub use config::{RetentionPolicy, SnapshotStoreConfig};
pub use criteria::SnapshotCriteria;
pub use error::{Result, StoreError};
pub use manager::{
    CategoryMetadata, CategorySource, DelegateContext, SnapshotManager, SyncStats, SyncWorker,
    DEFAULT_CATEGORY,
};
pub use persistence::{InMemoryPersistence, PersistedSnapshot, SnapshotPersistence};
pub use schema::{FieldSchema, FieldType, Schema};
pub use snapshot::{SerializableSnapshot, Snapshot, SnapshotInput, SnapshotStatus};
pub use store::{BatchFetchResult, BatchUpdateResult, SnapshotStore, SnapshotUpdate, TakenSnapshots};
pub use subscriptions::{
    ChangeEvent, ChangeKind, NotificationReport, Subscriber, SubscriberCallback, SubscriberId,
    SubscriberRegistry, SubscriptionFilter, SubscriptionHandle,
};
pub use types::*;
