//! Background thread that periodically sweeps and syncs registered stores.

use crate::error::{Result, StoreError};
use crate::store::SnapshotStore;
use crate::types::{SnapshotData, Timestamp};
use crossbeam_channel::{bounded, RecvTimeoutError, Sender};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

pub(crate) type StoreMap<T> = Arc<RwLock<BTreeMap<String, Arc<SnapshotStore<T>>>>>;

/// Counters from the sync worker.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SyncStats {
    /// Wake-ups, whether or not any store was due.
    pub polls: u64,
    pub snapshots_synced: u64,
    pub snapshots_expired: u64,
    pub failures: u64,
}

/// Handle to the sync thread.
///
/// Every poll, each store whose `sync_interval` has elapsed since its last
/// pass gets `sweep_expired` followed by `sync`. Stores without an interval
/// are skipped. Dropping the handle stops the thread.
pub struct SyncWorker {
    stop_tx: Option<Sender<()>>,
    handle: Option<JoinHandle<SyncStats>>,
}

impl SyncWorker {
    pub(crate) fn spawn<T: SnapshotData>(stores: StoreMap<T>, poll_interval: Duration) -> Result<Self> {
        let (stop_tx, stop_rx) = bounded::<()>(1);

        let handle = thread::Builder::new()
            .name("snapshot-sync".to_string())
            .spawn(move || {
                let mut stats = SyncStats::default();
                let mut last_run: HashMap<String, Instant> = HashMap::new();

                loop {
                    match stop_rx.recv_timeout(poll_interval) {
                        Err(RecvTimeoutError::Timeout) => {}
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                    stats.polls += 1;

                    let now = Instant::now();
                    let due: Vec<Arc<SnapshotStore<T>>> = {
                        let live = stores.read();
                        last_run.retain(|id, _| live.contains_key(id));
                        live.values()
                            .filter(|store| match store.config().sync_interval {
                                Some(interval) => last_run
                                    .get(store.store_id())
                                    .map_or(true, |at| now.duration_since(*at) >= interval),
                                None => false,
                            })
                            .cloned()
                            .collect()
                    };

                    for store in due {
                        last_run.insert(store.store_id().to_string(), now);
                        run_pass(&store, &mut stats);
                    }
                }

                debug!(polls = stats.polls, synced = stats.snapshots_synced, "sync worker stopped");
                stats
            })
            .map_err(|e| StoreError::InvalidConfig(format!("cannot start sync worker: {e}")))?;

        Ok(Self {
            stop_tx: Some(stop_tx),
            handle: Some(handle),
        })
    }

    /// Stop the thread and return its counters.
    pub fn stop(mut self) -> SyncStats {
        self.halt()
    }

    fn halt(&mut self) -> SyncStats {
        drop(self.stop_tx.take());
        self.handle
            .take()
            .map(|handle| handle.join().unwrap_or_default())
            .unwrap_or_default()
    }
}

impl Drop for SyncWorker {
    fn drop(&mut self) {
        self.halt();
    }
}

fn run_pass<T: SnapshotData>(store: &SnapshotStore<T>, stats: &mut SyncStats) {
    match store.sweep_expired(Timestamp::now()) {
        Ok(expired) => stats.snapshots_expired += expired.len() as u64,
        Err(e) => {
            stats.failures += 1;
            warn!(store = %store.store_id(), error = %e, "expiration sweep failed");
        }
    }

    match store.sync() {
        Ok(count) => stats.snapshots_synced += count as u64,
        Err(e) => {
            stats.failures += 1;
            warn!(store = %store.store_id(), error = %e, "periodic sync failed");
        }
    }
}
