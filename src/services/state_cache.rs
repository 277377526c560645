//! Generic per-key caching engine for state entities.
//!
//! One `StateCache` instance owns all live copies of one entity kind and
//! enforces the singleton-per-key invariant: while anything holds a handle,
//! `get` for that key returns the same `Arc`. A second, cheaper map holds
//! bare records loaded for read-only consumers ("staged"); promotion from a
//! staged record to a live handle never re-fetches from the backend.
//!
//! All structural operations share one async mutex. The miss path is the only
//! operation allowed to hold it across a backend call, which is what resolves
//! N-way concurrent first access down to exactly one default-create.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::sync::Mutex;

use crate::error::{Result, StateError};
use crate::models::{merge_diff, record_diff, FieldSet, StateKind, StateRecord};
use crate::services::state_bus::{StateBus, StateDiffSink, StateEnvelope};
use crate::services::state_store::StateStore;

/// A behavior-bearing live wrapper over a bare state record.
///
/// The owning cache is injected at construction; entities never reach for an
/// ambient manager.
pub trait StateEntity: Send + Sync + Sized + 'static {
    type Record: StateRecord;

    /// Wrap a record as a live handle owned by `owner`.
    fn attach(record: Self::Record, owner: Weak<StateCache<Self>>) -> Arc<Self>;

    /// The key this entity is cached under.
    fn key(&self) -> &str;

    /// Clone of the current record contents.
    fn snapshot(&self) -> Self::Record;

    /// Apply an inbound field-level diff (last-write-wins per field).
    fn apply_diff(&self, diff: &Map<String, Value>) -> Result<()>;
}

struct CacheInner<E: StateEntity> {
    live: HashMap<String, Arc<E>>,
    staged: HashMap<String, E::Record>,
}

/// Caching engine for one entity kind.
pub struct StateCache<E: StateEntity> {
    store: Arc<dyn StateStore<E::Record>>,
    bus: Arc<StateBus>,
    /// Cookie stamped on published diffs when the caller supplies none;
    /// inbound envelopes carrying it are our own echo and are skipped.
    instance_cookie: Option<String>,
    inner: Mutex<CacheInner<E>>,
}

impl<E: StateEntity> StateCache<E> {
    pub fn new(
        store: Arc<dyn StateStore<E::Record>>,
        bus: Arc<StateBus>,
        instance_cookie: Option<String>,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            bus,
            instance_cookie,
            inner: Mutex::new(CacheInner {
                live: HashMap::new(),
                staged: HashMap::new(),
            }),
        })
    }

    /// The singleton live handle for `key`.
    ///
    /// On miss the persisted record is loaded, or a default record is
    /// created and persisted before this returns. Concurrent misses for the
    /// same key are serialized by the structural lock, so exactly one
    /// default-create happens and every caller gets the same handle.
    pub async fn get(self: &Arc<Self>, key: &str) -> Result<Arc<E>> {
        let mut inner = self.inner.lock().await;
        if let Some(entity) = inner.live.get(key) {
            return Ok(Arc::clone(entity));
        }
        // Promotion from a staged record must never re-fetch.
        let record = if let Some(record) = inner.staged.remove(key) {
            record
        } else if let Some(record) = self.store.find(key).await? {
            record
        } else {
            tracing::debug!(key, kind = ?E::Record::KIND, "Default-creating state record");
            let record = E::Record::new_default(key);
            self.store.update(key, &record, &FieldSet::All).await?;
            record
        };
        let entity = E::attach(record, Arc::downgrade(self));
        inner.live.insert(key.to_string(), Arc::clone(&entity));
        Ok(entity)
    }

    /// The bare record for `key`, without promoting it to a live handle.
    ///
    /// Used by consumers tracking many AUs they never actively operate on.
    /// Loaded records are kept in the staged map so a later `get` can
    /// promote them in place.
    pub async fn get_record(self: &Arc<Self>, key: &str) -> Result<E::Record> {
        let mut inner = self.inner.lock().await;
        if let Some(entity) = inner.live.get(key) {
            return Ok(entity.snapshot());
        }
        if let Some(record) = inner.staged.get(key) {
            return Ok(record.clone());
        }
        let record = match self.store.find(key).await? {
            Some(record) => record,
            None => {
                let record = E::Record::new_default(key);
                self.store.update(key, &record, &FieldSet::All).await?;
                record
            }
        };
        inner.staged.insert(key.to_string(), record.clone());
        Ok(record)
    }

    /// Persist the fields of `entity` named by `fields` and notify.
    ///
    /// `entity` must be the cached singleton for its key: a different cached
    /// instance is a fatal caller error, and a missing entry is accepted only
    /// when `fields` denotes the whole record (implicit store) — a partial
    /// update can never materialize an entry.
    pub async fn update(
        &self,
        entity: &Arc<E>,
        fields: &FieldSet,
        cookie: Option<String>,
    ) -> Result<()> {
        let key = entity.key().to_string();
        let implicit_store = {
            let inner = self.inner.lock().await;
            match inner.live.get(&key) {
                Some(current) if Arc::ptr_eq(current, entity) => false,
                Some(_) => return Err(StateError::StaleHandle { key }),
                None => {
                    if fields.is_partial() {
                        return Err(StateError::NotCached { key });
                    }
                    true
                }
            }
        };
        let record = entity.snapshot();
        let diff = record_diff(&record, fields)?;
        self.store.update(&key, &record, fields).await?;
        if implicit_store {
            // Re-materialize the caller's instance, unless another one won
            // the race while the backend call was in flight.
            let mut inner = self.inner.lock().await;
            match inner.live.get(&key) {
                Some(current) if Arc::ptr_eq(current, entity) => {}
                Some(_) => return Err(StateError::StaleHandle { key }),
                None => {
                    inner.staged.remove(&key);
                    inner.live.insert(key.clone(), Arc::clone(entity));
                }
            }
        }
        self.publish(&key, diff, cookie);
        Ok(())
    }

    /// Key-based update used by a state-owning service process.
    ///
    /// Accepted only when no live instance exists for the key and `fields`
    /// denotes the whole record; the record lands in the staged map.
    pub async fn update_from_service(
        &self,
        record: E::Record,
        fields: &FieldSet,
        cookie: Option<String>,
    ) -> Result<()> {
        let key = record.key().to_string();
        {
            let inner = self.inner.lock().await;
            if inner.live.contains_key(&key) {
                return Err(StateError::StaleHandle { key });
            }
        }
        if fields.is_partial() {
            return Err(StateError::NotCached { key });
        }
        let diff = record_diff(&record, fields)?;
        self.store.update(&key, &record, fields).await?;
        self.inner.lock().await.staged.insert(key.clone(), record);
        self.publish(&key, diff, cookie);
        Ok(())
    }

    /// First-time persist of a record the caller constructed itself.
    ///
    /// Fails if any entry (live or staged) already exists for the key.
    pub async fn store(self: &Arc<Self>, record: E::Record) -> Result<Arc<E>> {
        let key = record.key().to_string();
        let mut inner = self.inner.lock().await;
        if inner.live.contains_key(&key) || inner.staged.contains_key(&key) {
            return Err(StateError::AlreadyExists { key });
        }
        self.store.update(&key, &record, &FieldSet::All).await?;
        let diff = record_diff(&record, &FieldSet::All)?;
        let entity = E::attach(record, Arc::downgrade(self));
        inner.live.insert(key.clone(), Arc::clone(&entity));
        drop(inner);
        self.publish(&key, diff, None);
        Ok(entity)
    }

    /// Presence check that never materializes a cache entry.
    pub async fn exists(&self, key: &str) -> Result<bool> {
        {
            let inner = self.inner.lock().await;
            if inner.live.contains_key(key) || inner.staged.contains_key(key) {
                return Ok(true);
            }
        }
        Ok(self.store.find(key).await?.is_some())
    }

    /// Drop the live and staged entries for `key`. The backend copy is
    /// retained (soft delete); a later `get` rehydrates from it.
    pub async fn evict(&self, key: &str) {
        let mut inner = self.inner.lock().await;
        let live = inner.live.remove(key).is_some();
        let staged = inner.staged.remove(key).is_some();
        if live || staged {
            tracing::debug!(key, kind = ?E::Record::KIND, "Evicted state entry");
        }
    }

    /// The live handle for `key`, if one is cached right now.
    pub async fn peek(&self, key: &str) -> Option<Arc<E>> {
        self.inner.lock().await.live.get(key).cloned()
    }

    fn publish(&self, key: &str, diff: Map<String, Value>, cookie: Option<String>) {
        let cookie = cookie.or_else(|| self.instance_cookie.clone());
        self.bus.publish(StateEnvelope {
            kind: E::Record::KIND,
            key: key.to_string(),
            diff,
            cookie,
        });
    }
}

#[async_trait]
impl<E: StateEntity> StateDiffSink for StateCache<E> {
    fn kind(&self) -> StateKind {
        E::Record::KIND
    }

    async fn apply_remote(&self, envelope: StateEnvelope) {
        if envelope.cookie.is_some() && envelope.cookie == self.instance_cookie {
            tracing::trace!(key = %envelope.key, "Skipping own echoed state diff");
            return;
        }
        let mut inner = self.inner.lock().await;
        if let Some(entity) = inner.live.get(&envelope.key) {
            if let Err(e) = entity.apply_diff(&envelope.diff) {
                tracing::warn!(key = %envelope.key, error = %e,
                    "Failed to apply state diff to live entry");
            }
        } else if let Some(record) = inner.staged.get_mut(&envelope.key) {
            match merge_diff(record, &envelope.diff) {
                Ok(merged) => *record = merged,
                Err(e) => tracing::warn!(key = %envelope.key, error = %e,
                    "Failed to apply state diff to staged record"),
            }
        }
        // No cached copy: ignore the partial diff; the next miss-triggered
        // load reconciles from the backend.
    }
}
