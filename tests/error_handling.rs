//! Error handling and edge case tests.

use serde_json::{json, Value};
use snapshot_store::{
    CancellationToken, CategoryMetadata, CategorySource, DelegateContext, FieldSchema, FieldType,
    InMemoryPersistence, PersistedSnapshot, Result, Schema, SnapshotInput, SnapshotManager,
    SnapshotPersistence, SnapshotStore, SnapshotStoreConfig, SnapshotUpdate, StoreError,
    SubscriberId, SubscriptionFilter, Version,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

fn test_store() -> SnapshotStore<Value> {
    let schema = Schema::new().field("total", FieldSchema::required(FieldType::Number));
    SnapshotStore::new(SnapshotStoreConfig::new("orders").with_schema(schema)).unwrap()
}

fn seed(store: &SnapshotStore<Value>, ids: &[&str]) {
    for id in ids {
        store
            .create_snapshot(SnapshotInput::new(*id, "orders", json!({"total": 0})))
            .unwrap();
    }
}

// --- Not Found ---

#[test]
fn test_delete_is_idempotent_not_found() {
    let store = test_store();
    seed(&store, &["s1"]);

    store.delete_snapshot("s1").unwrap();
    assert!(matches!(store.delete_snapshot("s1"), Err(StoreError::NotFound(_))));
    assert!(matches!(store.delete_snapshot("s1"), Err(StoreError::NotFound(_))));
}

#[test]
fn test_missing_ids() {
    let store = test_store();
    assert!(store.get_snapshot("nope").unwrap_err().is_not_found());
    assert!(store.update_snapshot("nope", json!({"total": 1})).unwrap_err().is_not_found());
    assert!(store.add_tags("nope", ["x"]).unwrap_err().is_not_found());
    assert!(store.get_snapshot_version("nope", Version(1)).unwrap_err().is_not_found());
}

// --- Create Errors ---

#[test]
fn test_duplicate_create_keeps_original() {
    let store = test_store();
    store
        .create_snapshot(SnapshotInput::new("s1", "orders", json!({"total": 1})))
        .unwrap();

    let result = store.create_snapshot(SnapshotInput::new("s1", "orders", json!({"total": 2})));
    assert!(matches!(result, Err(StoreError::DuplicateId(ref id)) if id == "s1"));
    assert_eq!(store.get_snapshot("s1").unwrap().data, json!({"total": 1}));
}

#[test]
fn test_missing_required_field() {
    let store = test_store();
    let err = store
        .create_snapshot(SnapshotInput::new("s1", "orders", json!({"other": 1})))
        .unwrap_err();
    match err {
        StoreError::SchemaValidationFailed { path, reason } => {
            assert_eq!(path, "total");
            assert_eq!(reason, "required field is missing");
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert!(store.is_empty());
}

#[test]
fn test_null_payload_rejected() {
    let store: SnapshotStore<Value> = SnapshotStore::new(SnapshotStoreConfig::new("open")).unwrap();
    let result = store.create_snapshot(SnapshotInput::new("s1", "any", Value::Null));
    assert!(matches!(result, Err(StoreError::SchemaValidationFailed { .. })));
}

#[test]
fn test_invalid_config_rejected() {
    let result: Result<SnapshotStore<Value>> =
        SnapshotStore::new(SnapshotStoreConfig::new("").with_snapshot_limit(1));
    assert!(matches!(result, Err(StoreError::InvalidConfig(_))));

    let result = SnapshotStoreConfig::from_json("{ not json");
    assert!(matches!(result, Err(StoreError::InvalidConfig(_))));
}

// --- Batch Atomicity ---

#[test]
fn test_batch_with_invalid_item_applies_nothing() {
    let store = test_store();
    seed(&store, &["s1", "s2", "s3", "s4", "s5"]);

    let updates = vec![
        SnapshotUpdate::new("s1", json!({"total": 1})),
        SnapshotUpdate::new("s2", json!({"total": 2})),
        SnapshotUpdate::new("s3", json!({"total": "three"})),
        SnapshotUpdate::new("s4", json!({"total": 4})),
        SnapshotUpdate::new("s5", json!({"total": 5})),
    ];
    let err = store.batch_update_snapshots(vec![updates], None).unwrap_err();
    assert!(matches!(err, StoreError::BatchPartialFailure { index: 2, .. }));

    for id in ["s1", "s2", "s3", "s4", "s5"] {
        let snapshot = store.get_snapshot(id).unwrap();
        assert_eq!(snapshot.version, Version(1));
        assert_eq!(snapshot.data, json!({"total": 0}));
    }
    assert_eq!(store.stats().archived_version_count, 0);
}

#[test]
fn test_batch_with_unknown_id_applies_nothing() {
    let store = test_store();
    seed(&store, &["s1"]);

    let err = store
        .batch_update_snapshots(
            vec![
                vec![SnapshotUpdate::new("s1", json!({"total": 1}))],
                vec![SnapshotUpdate::new("ghost", json!({"total": 1}))],
            ],
            None,
        )
        .unwrap_err();
    assert!(err.is_not_found());
    assert_eq!(store.get_snapshot("s1").unwrap().version, Version(1));
}

#[test]
fn test_failed_batch_sends_no_notifications() {
    let store = test_store();
    seed(&store, &["s1", "s2"]);
    let handle = store.subscribe_channel("watch", SubscriptionFilter::topic("updated"));

    let _ = store.batch_update_snapshots(
        vec![vec![
            SnapshotUpdate::new("s1", json!({"total": 1})),
            SnapshotUpdate::new("s2", json!({})),
        ]],
        None,
    );
    store.flush_notifications();
    assert!(handle.drain().is_empty());
}

// --- Cancellation ---

#[test]
fn test_cancelled_fetch_and_update() {
    let store = test_store();
    seed(&store, &["s1"]);
    let token = CancellationToken::new();
    token.cancel();

    let fetch = store.batch_fetch_snapshots(
        &snapshot_store::SnapshotCriteria::All,
        &[SubscriberId::new("any")],
        Some(&token),
    );
    assert!(matches!(fetch, Err(StoreError::Cancelled)));

    let update = store.batch_update_snapshots(
        vec![vec![SnapshotUpdate::new("s1", json!({"total": 5}))]],
        Some(&token),
    );
    assert!(matches!(update, Err(StoreError::Cancelled)));
    assert_eq!(store.get_snapshot("s1").unwrap().data, json!({"total": 0}));
}

// --- Subscriber Failures ---

#[test]
fn test_failing_subscriber_does_not_block_others() {
    let store = test_store();
    let delivered = Arc::new(AtomicUsize::new(0));

    store.subscribe("broken", SubscriptionFilter::all(), |_e| Err("offline".to_string()));
    store.subscribe("panicky", SubscriptionFilter::all(), |_e| panic!("bad subscriber"));
    let counter = Arc::clone(&delivered);
    store.subscribe("healthy", SubscriptionFilter::all(), move |_e| {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(())
    });

    // The write itself succeeds regardless of subscriber failures.
    seed(&store, &["s1"]);
    store.update_snapshot("s1", json!({"total": 3})).unwrap();
    store.flush_notifications();

    assert_eq!(delivered.load(Ordering::SeqCst), 2);
    let errors = store.take_delivery_errors();
    assert_eq!(errors.len(), 4);
    assert!(errors
        .iter()
        .all(|e| matches!(e, StoreError::SubscriberDeliveryFailed { .. })));
    assert!(store.take_delivery_errors().is_empty());
}

#[test]
fn test_full_channel_is_delivery_failure() {
    let config = SnapshotStoreConfig {
        notification_buffer: 1,
        ..SnapshotStoreConfig::new("small")
    };
    let store: SnapshotStore<Value> = SnapshotStore::new(config).unwrap();
    let handle = store.subscribe_channel("slow", SubscriptionFilter::all());

    for id in ["a", "b", "c"] {
        store
            .create_snapshot(SnapshotInput::new(id, "x", json!(1)))
            .unwrap();
    }
    store.flush_notifications();

    assert_eq!(handle.drain().len(), 1);
    assert_eq!(store.take_delivery_errors().len(), 2);
}

#[test]
fn test_direct_notify_reports_errors() {
    let store = test_store();
    seed(&store, &["s1"]);
    store.subscribe("broken", SubscriptionFilter::all(), |_e| Err("nope".to_string()));
    store.subscribe("fine", SubscriptionFilter::all(), |_e| Ok(()));
    store.flush_notifications();
    store.take_delivery_errors();

    let event = snapshot_store::ChangeEvent::created("orders", &store.get_snapshot("s1").unwrap());
    let report = store.notify_subscribers(
        &event,
        &[
            SubscriberId::new("broken"),
            SubscriberId::new("fine"),
            SubscriberId::new("fine"),
            SubscriberId::new("unknown"),
        ],
    );

    assert_eq!(report.notified.len(), 2);
    assert_eq!(report.errors.len(), 1);
}

// --- Persistence Failures ---

struct FailingPersistence;

impl SnapshotPersistence for FailingPersistence {
    fn insert(&self, _record: PersistedSnapshot) -> Result<()> {
        Err(StoreError::Persistence("disk full".into()))
    }

    fn upsert(&self, _record: PersistedSnapshot) -> Result<()> {
        Err(StoreError::Persistence("disk full".into()))
    }

    fn load_versions(&self, _store_id: &str, _id: &str) -> Result<Vec<PersistedSnapshot>> {
        Ok(Vec::new())
    }

    fn delete(&self, _store_id: &str, _id: &str) -> Result<usize> {
        Ok(0)
    }
}

#[test]
fn test_persistence_failure_leaves_store_unchanged() {
    let store: SnapshotStore<Value> = SnapshotStore::with_persistence(
        SnapshotStoreConfig::new("orders").with_auto_save(true),
        Some(Arc::new(FailingPersistence)),
    )
    .unwrap();

    let result = store.create_snapshot(SnapshotInput::new("s1", "orders", json!(1)));
    assert!(matches!(result, Err(StoreError::Persistence(_))));
    assert!(store.is_empty());
    assert!(matches!(store.sync(), Ok(0)));
}

#[test]
fn test_auto_save_off_skips_persistence() {
    let backend = InMemoryPersistence::new();
    let store: SnapshotStore<Value> = SnapshotStore::with_persistence(
        SnapshotStoreConfig::new("orders"),
        Some(Arc::new(backend.clone())),
    )
    .unwrap();

    store
        .create_snapshot(SnapshotInput::new("s1", "orders", json!(1)))
        .unwrap();
    assert!(backend.is_empty());
}

// --- Collaborator Timeouts ---

struct StalledSource;

impl CategorySource for StalledSource {
    fn fetch_category_by_name(&self, _name: &str) -> Result<CategoryMetadata> {
        thread::sleep(Duration::from_secs(2));
        Ok(CategoryMetadata::default())
    }

    fn fetch_snapshot_store_data(&self, _store_id: Option<&str>) -> Result<Vec<SnapshotStoreConfig>> {
        thread::sleep(Duration::from_secs(2));
        Ok(Vec::new())
    }
}

#[test]
fn test_delegate_timeout() {
    let manager: SnapshotManager<Value> =
        SnapshotManager::new().with_category_source(Arc::new(StalledSource));

    let ctx = DelegateContext::real().with_timeout(Duration::from_millis(50));
    let result = manager.get_delegate(&ctx);
    assert!(matches!(result, Err(StoreError::Timeout { .. })));
}

#[test]
fn test_delegate_requires_real_source() {
    let manager: SnapshotManager<Value> = SnapshotManager::new();
    assert!(matches!(
        manager.get_delegate(&DelegateContext::real()),
        Err(StoreError::InvalidConfig(_))
    ));
    assert!(manager.get_delegate(&DelegateContext::simulated()).unwrap().is_empty());
}
