//! In-memory state store, used by tests and by single-process emulation.
//!
//! Records are held as serialized snapshots keyed by AU id, so they survive
//! cache eviction (soft delete) and rehydrate on the next load exactly the
//! way a durable backend would.

use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::Result;
use crate::models::{FieldSet, StateRecord};
use crate::services::state_store::StateStore;

pub struct MemoryStateStore<R: StateRecord> {
    snapshots: Mutex<HashMap<String, Value>>,
    find_calls: AtomicUsize,
    update_calls: AtomicUsize,
    _record: PhantomData<fn() -> R>,
}

impl<R: StateRecord> MemoryStateStore<R> {
    pub fn new() -> Self {
        Self {
            snapshots: Mutex::new(HashMap::new()),
            find_calls: AtomicUsize::new(0),
            update_calls: AtomicUsize::new(0),
            _record: PhantomData,
        }
    }

    /// Number of `update` calls seen so far (store-call counting in tests).
    pub fn update_calls(&self) -> usize {
        self.update_calls.load(Ordering::SeqCst)
    }

    /// Number of `find` calls seen so far.
    pub fn find_calls(&self) -> usize {
        self.find_calls.load(Ordering::SeqCst)
    }

    /// Whether a snapshot is retained for `key`.
    pub fn has_snapshot(&self, key: &str) -> bool {
        self.lock().contains_key(key)
    }

    /// Drop the retained snapshot for `key` (hard delete, test-only paths).
    pub fn forget(&self, key: &str) {
        self.lock().remove(key);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Value>> {
        self.snapshots.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl<R: StateRecord> Default for MemoryStateStore<R> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<R: StateRecord> StateStore<R> for MemoryStateStore<R> {
    async fn find(&self, key: &str) -> Result<Option<R>> {
        self.find_calls.fetch_add(1, Ordering::SeqCst);
        let snapshots = self.lock();
        match snapshots.get(key) {
            Some(value) => Ok(Some(serde_json::from_value(value.clone())?)),
            None => Ok(None),
        }
    }

    async fn update(&self, key: &str, record: &R, _changed: &FieldSet) -> Result<String> {
        self.update_calls.fetch_add(1, Ordering::SeqCst);
        let value = serde_json::to_value(record)?;
        self.lock().insert(key.to_string(), value);
        Ok(format!("memory:{key}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::au_state::AuStateBean;

    #[tokio::test]
    async fn snapshot_survives_and_rehydrates() {
        let store = MemoryStateStore::<AuStateBean>::new();
        assert!(store.find("au1").await.unwrap().is_none());

        let mut bean = AuStateBean::new_default("au1");
        bean.num_willing_repairers = 4;
        store.update("au1", &bean, &FieldSet::All).await.unwrap();

        let loaded = store.find("au1").await.unwrap().unwrap();
        assert_eq!(loaded.num_willing_repairers, 4);
        assert_eq!(store.find_calls(), 2);
        assert_eq!(store.update_calls(), 1);
    }
}
