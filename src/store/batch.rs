//! Multi-snapshot operations: criteria fetch, all-or-nothing update, and
//! point-in-time copies.

use super::{changed_fields, SnapshotStore, StoreState};
use crate::criteria::SnapshotCriteria;
use crate::error::{Result, StoreError};
use crate::snapshot::Snapshot;
use crate::subscriptions::{ChangeEvent, SubscriberId};
use crate::types::{CancellationToken, Hash, SnapshotData, Timestamp};
use std::collections::{BTreeSet, HashSet};
use tracing::debug;

/// How many snapshots a fetch scans between cancellation checks.
const CANCEL_CHECK_INTERVAL: usize = 64;

/// One item of a batch update.
#[derive(Clone, Debug)]
pub struct SnapshotUpdate<T> {
    pub id: String,
    pub data: T,
}

impl<T> SnapshotUpdate<T> {
    pub fn new(id: impl Into<String>, data: T) -> Self {
        Self {
            id: id.into(),
            data,
        }
    }
}

/// Result of a criteria fetch.
#[derive(Clone, Debug)]
pub struct BatchFetchResult<T> {
    /// Subscribers that were notified of the fetch.
    pub subscribers: Vec<SubscriberId>,
    pub snapshots: Vec<Snapshot<T>>,
}

/// Result of one update group, in input order.
#[derive(Clone, Debug)]
pub struct BatchUpdateResult<T> {
    pub snapshots: Vec<Snapshot<T>>,
    /// Subscribers notified about any snapshot of the group.
    pub subscribers: Vec<SubscriberId>,
}

/// Deep copies of a set of snapshots taken under one read lock.
#[derive(Clone, Debug)]
pub struct TakenSnapshots<T> {
    pub snapshots: Vec<Snapshot<T>>,
    pub taken_at: Timestamp,
    /// SHA-256 of the serialized copies.
    pub digest: Hash,
}

impl<T: SnapshotData> TakenSnapshots<T> {
    /// Recompute the digest and compare.
    pub fn verify(&self) -> Result<bool> {
        Ok(digest_of(&self.snapshots)? == self.digest)
    }
}

fn digest_of<T: SnapshotData>(snapshots: &[Snapshot<T>]) -> Result<Hash> {
    Ok(Hash::from_bytes(&serde_json::to_vec(snapshots)?))
}

fn check(cancel: Option<&CancellationToken>) -> Result<()> {
    cancel.map_or(Ok(()), CancellationToken::check)
}

struct PlannedUpdate<T> {
    group: usize,
    old: Snapshot<T>,
    new: Snapshot<T>,
    changed: Vec<String>,
}

impl<T: SnapshotData> SnapshotStore<T> {
    /// Fetch every snapshot matching `criteria`, in id order, and notify the
    /// listed subscribers whose filter matches the fetch.
    ///
    /// A cancelled fetch returns `Cancelled` and notifies nobody.
    pub fn batch_fetch_snapshots(
        &self,
        criteria: &SnapshotCriteria,
        subscribers: &[SubscriberId],
        cancel: Option<&CancellationToken>,
    ) -> Result<BatchFetchResult<T>> {
        let now = Timestamp::now();
        let mut snapshots = Vec::new();
        {
            let state = self.state.read();
            for (scanned, snapshot) in state.snapshots.values().enumerate() {
                if scanned % CANCEL_CHECK_INTERVAL == 0 {
                    check(cancel)?;
                }
                if criteria.matches(snapshot, now) {
                    snapshots.push(snapshot.clone());
                }
            }
        }
        check(cancel)?;

        let event = ChangeEvent::fetched(&self.config.store_id, &snapshots);
        let recipients = self.subscribers.matching_among(&event, subscribers);
        if !recipients.is_empty() {
            self.dispatcher.enqueue(event, recipients.clone());
        }

        debug!(store = %self.config.store_id, count = snapshots.len(), "batch fetch");
        Ok(BatchFetchResult {
            subscribers: recipients,
            snapshots,
        })
    }

    /// Apply groups of updates as one unit.
    ///
    /// Every item is validated before anything is written; the first failing
    /// item rejects the whole batch with `BatchPartialFailure` carrying its
    /// flat index across all groups. An id may appear only once per call.
    /// Results keep the input order.
    pub fn batch_update_snapshots(
        &self,
        batches: Vec<Vec<SnapshotUpdate<T>>>,
        cancel: Option<&CancellationToken>,
    ) -> Result<Vec<BatchUpdateResult<T>>> {
        let _gate = self.batch_gate.write();
        let group_count = batches.len();
        let now = Timestamp::now();

        let planned = {
            let state = self.state.read();
            let mut seen: HashSet<String> = HashSet::new();
            let mut planned = Vec::new();
            let mut index = 0;
            for (group, updates) in batches.into_iter().enumerate() {
                for update in updates {
                    check(cancel)?;
                    let step = self
                        .plan_update(&state, &mut seen, group, update, now)
                        .map_err(|source| StoreError::BatchPartialFailure {
                            index,
                            source: Box::new(source),
                        })?;
                    planned.push(step);
                    index += 1;
                }
            }
            planned
        };
        check(cancel)?;

        let versions: Vec<&Snapshot<T>> = planned.iter().map(|p| &p.new).collect();
        self.persist(&versions)?;

        let mut state = self.state.write();

        let mut snapshots: Vec<Vec<Snapshot<T>>> = (0..group_count).map(|_| Vec::new()).collect();
        let mut notified: Vec<BTreeSet<SubscriberId>> = vec![BTreeSet::new(); group_count];
        let total = planned.len();
        for step in planned {
            let committed =
                state.commit_version(step.new, self.config.retention_policy.max_versions);
            let recipients = self.publish(ChangeEvent::updated(
                &self.config.store_id,
                &step.old,
                &committed,
                step.changed,
            ));
            notified[step.group].extend(recipients);
            snapshots[step.group].push(committed);
        }
        drop(state);

        debug!(store = %self.config.store_id, groups = group_count, updates = total, "batch update committed");
        Ok(snapshots
            .into_iter()
            .zip(notified)
            .map(|(snapshots, subscribers)| BatchUpdateResult {
                snapshots,
                subscribers: subscribers.into_iter().collect(),
            })
            .collect())
    }

    fn plan_update(
        &self,
        state: &StoreState<T>,
        seen: &mut HashSet<String>,
        group: usize,
        update: SnapshotUpdate<T>,
        now: Timestamp,
    ) -> Result<PlannedUpdate<T>> {
        let current = state
            .snapshots
            .get(&update.id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(update.id.clone()))?;
        if !seen.insert(update.id.clone()) {
            return Err(StoreError::DuplicateId(update.id));
        }

        let new_payload = serde_json::to_value(&update.data)?;
        self.check_payload(&new_payload)?;
        let changed = changed_fields(&serde_json::to_value(&current.data)?, &new_payload);

        let next = current.next_version(update.data, now);
        Ok(PlannedUpdate {
            group,
            old: current,
            new: next,
            changed,
        })
    }

    /// Deep copies of the named snapshots, taken atomically.
    ///
    /// Copies go through a serialization round trip so they share nothing
    /// with the store. Any missing id fails the whole call with `NotFound`.
    pub fn batch_take_snapshot<S: AsRef<str>>(&self, ids: &[S]) -> Result<TakenSnapshots<T>> {
        let encoded: Vec<serde_json::Value> = {
            let state = self.state.read();
            ids.iter()
                .map(|id| -> Result<serde_json::Value> {
                    let id = id.as_ref();
                    let snapshot = state
                        .snapshots
                        .get(id)
                        .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
                    Ok(serde_json::to_value(snapshot)?)
                })
                .collect::<Result<_>>()?
        };

        let snapshots = encoded
            .into_iter()
            .map(|value| {
                serde_json::from_value(value).map_err(|e| StoreError::Deserialization(e.to_string()))
            })
            .collect::<Result<Vec<Snapshot<T>>>>()?;

        Ok(TakenSnapshots {
            digest: digest_of(&snapshots)?,
            snapshots,
            taken_at: Timestamp::now(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SnapshotStoreConfig;
    use crate::schema::{FieldSchema, FieldType, Schema};
    use crate::snapshot::SnapshotInput;
    use crate::subscriptions::SubscriptionFilter;
    use crate::types::Version;
    use serde_json::{json, Value};

    fn seeded_store(ids: &[&str]) -> SnapshotStore<Value> {
        let config = SnapshotStoreConfig::new("orders").with_schema(
            Schema::new().field("total", FieldSchema::required(FieldType::Number)),
        );
        let store = SnapshotStore::new(config).unwrap();
        for id in ids {
            store
                .create_snapshot(SnapshotInput::new(*id, "orders", json!({"total": 0})))
                .unwrap();
        }
        store
    }

    #[test]
    fn test_batch_update_groups_keep_order() {
        let store = seeded_store(&["a", "b", "c"]);
        let results = store
            .batch_update_snapshots(
                vec![
                    vec![SnapshotUpdate::new("b", json!({"total": 1}))],
                    vec![],
                    vec![
                        SnapshotUpdate::new("c", json!({"total": 2})),
                        SnapshotUpdate::new("a", json!({"total": 3})),
                    ],
                ],
                None,
            )
            .unwrap();

        assert_eq!(results.len(), 3);
        assert_eq!(results[0].snapshots[0].id, "b");
        assert!(results[1].snapshots.is_empty());
        let ids: Vec<&str> = results[2].snapshots.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec!["c", "a"]);
    }

    #[test]
    fn test_batch_update_rejects_repeated_id() {
        let store = seeded_store(&["a", "b"]);
        let err = store
            .batch_update_snapshots(
                vec![
                    vec![SnapshotUpdate::new("a", json!({"total": 1}))],
                    vec![
                        SnapshotUpdate::new("b", json!({"total": 2})),
                        SnapshotUpdate::new("a", json!({"total": 3})),
                    ],
                ],
                None,
            )
            .unwrap_err();

        match err {
            StoreError::BatchPartialFailure { index, source } => {
                assert_eq!(index, 2);
                assert!(matches!(*source, StoreError::DuplicateId(ref id) if id == "a"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(store.get_version_history("a").unwrap().len(), 1);
        assert_eq!(store.get_snapshot("b").unwrap().version, Version(1));
    }

    #[test]
    fn test_batch_update_rejects_all_on_invalid_item() {
        let store = seeded_store(&["a", "b"]);
        let err = store
            .batch_update_snapshots(
                vec![
                    vec![SnapshotUpdate::new("a", json!({"total": 1}))],
                    vec![SnapshotUpdate::new("b", json!({"total": "bad"}))],
                ],
                None,
            )
            .unwrap_err();

        match err {
            StoreError::BatchPartialFailure { index, source } => {
                assert_eq!(index, 1);
                assert!(matches!(*source, StoreError::SchemaValidationFailed { .. }));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(store.get_snapshot("a").unwrap().version, Version(1));
    }

    #[test]
    fn test_batch_update_cancelled_before_commit() {
        let store = seeded_store(&["a"]);
        let token = CancellationToken::new();
        token.cancel();

        let result = store.batch_update_snapshots(
            vec![vec![SnapshotUpdate::new("a", json!({"total": 1}))]],
            Some(&token),
        );
        assert!(matches!(result, Err(StoreError::Cancelled)));
        assert_eq!(store.get_snapshot("a").unwrap().version, Version(1));
    }

    #[test]
    fn test_batch_fetch_notifies_listed_matching_subscribers() {
        let store = seeded_store(&["a", "b"]);
        let listed = store.subscribe_channel("listed", SubscriptionFilter::topic("fetched"));
        let _other = store.subscribe_channel("other", SubscriptionFilter::topic("fetched"));

        let result = store
            .batch_fetch_snapshots(
                &SnapshotCriteria::category("orders"),
                &[SubscriberId::new("listed"), SubscriberId::new("missing")],
                None,
            )
            .unwrap();
        store.flush_notifications();

        assert_eq!(result.snapshots.len(), 2);
        assert_eq!(result.subscribers, vec![SubscriberId::new("listed")]);
        let event = listed.try_recv().unwrap();
        assert_eq!(event.snapshot_ids, vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn test_batch_fetch_cancelled_notifies_nobody() {
        let store = seeded_store(&["a"]);
        let handle = store.subscribe_channel("listed", SubscriptionFilter::all());
        store.flush_notifications();
        handle.drain();

        let token = CancellationToken::new();
        token.cancel();
        let result = store.batch_fetch_snapshots(
            &SnapshotCriteria::All,
            &[SubscriberId::new("listed")],
            Some(&token),
        );
        store.flush_notifications();

        assert!(matches!(result, Err(StoreError::Cancelled)));
        assert!(handle.try_recv().is_err());
    }

    #[test]
    fn test_take_snapshot_is_deep_copy() {
        let store = seeded_store(&["a", "b"]);
        let taken = store.batch_take_snapshot(&["b", "a"]).unwrap();
        assert_eq!(taken.snapshots[0].id, "b");
        assert!(taken.verify().unwrap());

        store.update_snapshot("a", json!({"total": 9})).unwrap();
        assert_eq!(taken.snapshots[1].data, json!({"total": 0}));

        assert!(store.batch_take_snapshot(&["a", "zz"]).unwrap_err().is_not_found());
    }
}
