//! Per-snapshot write locks.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

/// Lazily creates one mutex per snapshot id and hands out the same `Arc`
/// for repeated lookups, so writers to one id queue behind each other while
/// writers to other ids proceed.
#[derive(Default)]
pub(crate) struct LockTable {
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl LockTable {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn get(&self, id: &str) -> Arc<Mutex<()>> {
        self.locks
            .lock()
            .entry(id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Drop entries nobody holds or waits on.
    pub(crate) fn prune(&self) {
        self.locks.lock().retain(|_, lock| Arc::strong_count(lock) > 1);
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.locks.lock().len()
    }
}
