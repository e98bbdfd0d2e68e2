//! MemoryStore: committed document state shared by all loopback connections.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde_json::Value;
use tracing::debug;

/// `(collection, id)` pair addressing one document.
pub(crate) type DocKey = (String, String);

/// Pending writes of one connection. `None` marks a removal.
pub(crate) type StagedWrites = HashMap<DocKey, Option<Value>>;

type Collections = HashMap<String, BTreeMap<String, Value>>;

#[derive(Debug, Default)]
struct StoreInner {
    committed: Collections,
    persisted: Collections,
}

/// Shared in-memory document store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<StoreInner>,
    commits: AtomicU64,
    rollbacks: AtomicU64,
    persists: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, StoreInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Read the committed version of a document.
    pub fn get(&self, collection: &str, id: &str) -> Option<Value> {
        self.lock()
            .committed
            .get(collection)
            .and_then(|docs| docs.get(id))
            .cloned()
    }

    /// Number of committed documents in a collection.
    pub fn count(&self, collection: &str) -> usize {
        self.lock()
            .committed
            .get(collection)
            .map(BTreeMap::len)
            .unwrap_or(0)
    }

    /// Read the last persisted version of a document.
    pub fn persisted(&self, collection: &str, id: &str) -> Option<Value> {
        self.lock()
            .persisted
            .get(collection)
            .and_then(|docs| docs.get(id))
            .cloned()
    }

    /// Apply a connection's staged writes atomically.
    pub(crate) fn apply(&self, staged: StagedWrites) {
        let writes = staged.len();
        {
            let mut inner = self.lock();
            for ((collection, id), value) in staged {
                let docs = inner.committed.entry(collection).or_default();
                match value {
                    Some(doc) => {
                        docs.insert(id, doc);
                    }
                    None => {
                        docs.remove(&id);
                    }
                }
            }
        }
        self.commits.fetch_add(1, Ordering::Relaxed);
        debug!(writes, "applied staged writes");
    }

    pub(crate) fn record_rollback(&self) {
        self.rollbacks.fetch_add(1, Ordering::Relaxed);
    }

    /// Snapshot committed state into the persisted copy.
    pub(crate) fn persist(&self) {
        let mut inner = self.lock();
        inner.persisted = inner.committed.clone();
        self.persists.fetch_add(1, Ordering::Relaxed);
    }

    pub fn commits(&self) -> u64 {
        self.commits.load(Ordering::Relaxed)
    }

    pub fn rollbacks(&self) -> u64 {
        self.rollbacks.load(Ordering::Relaxed)
    }

    pub fn persists(&self) -> u64 {
        self.persists.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn key(collection: &str, id: &str) -> DocKey {
        (collection.to_string(), id.to_string())
    }

    #[test]
    fn apply_inserts_and_removes() {
        let store = MemoryStore::new();
        let mut staged = StagedWrites::new();
        staged.insert(key("player", "1"), Some(json!({"_id": "1"})));
        staged.insert(key("player", "2"), Some(json!({"_id": "2"})));
        store.apply(staged);
        assert_eq!(store.count("player"), 2);

        let mut staged = StagedWrites::new();
        staged.insert(key("player", "1"), None);
        store.apply(staged);
        assert_eq!(store.count("player"), 1);
        assert!(store.get("player", "1").is_none());
        assert_eq!(store.commits(), 2);
    }

    #[test]
    fn persist_snapshots_committed_state() {
        let store = MemoryStore::new();
        let mut staged = StagedWrites::new();
        staged.insert(key("player", "1"), Some(json!({"_id": "1", "exp": 1})));
        store.apply(staged);
        assert!(store.persisted("player", "1").is_none());

        store.persist();
        assert_eq!(store.persisted("player", "1"), Some(json!({"_id": "1", "exp": 1})));
        assert_eq!(store.persists(), 1);
    }
}
