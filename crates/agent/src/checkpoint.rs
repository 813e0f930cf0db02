//! Checkpoint storage for interrupted agent runs.
//!
//! Deployments that need human-in-the-loop resumption to survive process
//! restarts substitute a persistent implementation behind the same trait.

use parking_lot::Mutex;
use std::collections::HashMap;

/// Byte-oriented checkpoint storage.
pub trait CheckpointStore: Send + Sync {
    /// Load a checkpoint.
    fn get(&self, id: &str) -> Option<Vec<u8>>;

    /// Store a checkpoint.
    fn set(&self, id: &str, bytes: Vec<u8>);

    /// Drop a checkpoint.
    fn remove(&self, id: &str);
}

/// The default in-memory store: checkpoints die with the process.
#[derive(Debug, Default)]
pub struct InMemoryCheckpointStore {
    inner: Mutex<HashMap<String, Vec<u8>>>,
}

impl InMemoryCheckpointStore {
    /// An empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl CheckpointStore for InMemoryCheckpointStore {
    fn get(&self, id: &str) -> Option<Vec<u8>> {
        self.inner.lock().get(id).cloned()
    }

    fn set(&self, id: &str, bytes: Vec<u8>) {
        self.inner.lock().insert(id.to_owned(), bytes);
    }

    fn remove(&self, id: &str) {
        self.inner.lock().remove(id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn set_get_remove() {
        let store = InMemoryCheckpointStore::new();
        assert_eq!(store.get("a"), None);
        store.set("a", vec![1, 2, 3]);
        assert_eq!(store.get("a"), Some(vec![1, 2, 3]));
        store.remove("a");
        assert_eq!(store.get("a"), None);
    }
}
