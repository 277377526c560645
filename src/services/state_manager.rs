//! Top-level state manager: one backend family wired to one cache per
//! entity kind, sharing a notification bus.
//!
//! The three constructors are the three deployment shapes: relational
//! (daemon owns the database), rest (a separate state service owns
//! persistence), and in-memory (tests and single-process emulation). All
//! three behave identically above the `StateStore` seam.

use std::sync::Arc;

use sqlx::PgPool;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::error::Result;
use crate::models::au_state::AuStateBean;
use crate::models::suspect_versions::AuSuspectUrlVersionsBean;
use crate::models::FieldSet;
use crate::services::au_state::AuState;
use crate::services::memory_store::MemoryStateStore;
use crate::services::postgres_store::{PgAuStateStore, PgSuspectVersionStore};
use crate::services::rest_store::{RestClientConfig, RestStateStore};
use crate::services::state_bus::{spawn_state_router, StateBus, StateDiffSink};
use crate::services::state_cache::StateCache;
use crate::services::state_store::StateStore;
use crate::services::suspect_versions::AuSuspectUrlVersions;

pub struct StateManager {
    bus: Arc<StateBus>,
    /// Instance cookie stamped on published diffs for echo suppression.
    cookie: String,
    au_states: Arc<StateCache<AuState>>,
    suspect_versions: Arc<StateCache<AuSuspectUrlVersions>>,
}

impl StateManager {
    /// Relational-store-backed manager.
    pub fn postgres(pool: PgPool, bus_capacity: usize) -> Arc<Self> {
        Self::postgres_with_bus(pool, Arc::new(StateBus::new(bus_capacity)))
    }

    pub fn postgres_with_bus(pool: PgPool, bus: Arc<StateBus>) -> Arc<Self> {
        Self::wire(
            Arc::new(PgAuStateStore::new(pool.clone())),
            Arc::new(PgSuspectVersionStore::new(pool)),
            bus,
        )
    }

    /// Remote-service-client-backed manager.
    pub fn rest(config: RestClientConfig, bus_capacity: usize) -> Result<Arc<Self>> {
        Self::rest_with_bus(config, Arc::new(StateBus::new(bus_capacity)))
    }

    pub fn rest_with_bus(config: RestClientConfig, bus: Arc<StateBus>) -> Result<Arc<Self>> {
        let store = Arc::new(RestStateStore::new(config)?);
        Ok(Self::wire(store.clone(), store, bus))
    }

    /// In-memory manager for tests and single-process emulation.
    pub fn in_memory(bus_capacity: usize) -> Arc<Self> {
        Self::in_memory_with_bus(Arc::new(StateBus::new(bus_capacity)))
    }

    pub fn in_memory_with_bus(bus: Arc<StateBus>) -> Arc<Self> {
        Self::wire(
            Arc::new(MemoryStateStore::new()),
            Arc::new(MemoryStateStore::new()),
            bus,
        )
    }

    fn wire(
        au_store: Arc<dyn StateStore<AuStateBean>>,
        suspect_store: Arc<dyn StateStore<AuSuspectUrlVersionsBean>>,
        bus: Arc<StateBus>,
    ) -> Arc<Self> {
        let cookie = Uuid::new_v4().to_string();
        let au_states = StateCache::new(au_store, bus.clone(), Some(cookie.clone()));
        let suspect_versions =
            StateCache::new(suspect_store, bus.clone(), Some(cookie.clone()));
        Arc::new(Self {
            bus,
            cookie,
            au_states,
            suspect_versions,
        })
    }

    /// Spawn the inbound notification router for this manager's caches.
    pub fn spawn_router(&self) -> JoinHandle<()> {
        let sinks: Vec<Arc<dyn StateDiffSink>> =
            vec![self.au_states.clone(), self.suspect_versions.clone()];
        spawn_state_router(&self.bus, sinks)
    }

    pub fn bus(&self) -> Arc<StateBus> {
        self.bus.clone()
    }

    pub fn cookie(&self) -> &str {
        &self.cookie
    }

    // ── AU state ────────────────────────────────────────────────────────

    /// The live crawl/poll handle for an AU (load-or-default-create).
    pub async fn au_state(&self, au_id: &str) -> Result<Arc<AuState>> {
        self.au_states.get(au_id).await
    }

    /// The bare crawl/poll record, without promoting it to a live handle.
    pub async fn au_state_record(&self, au_id: &str) -> Result<AuStateBean> {
        self.au_states.get_record(au_id).await
    }

    /// Presence check that never materializes a cache entry.
    pub async fn has_au_state(&self, au_id: &str) -> Result<bool> {
        self.au_states.exists(au_id).await
    }

    /// First-time persist of a caller-constructed record.
    pub async fn store_au_state(&self, record: AuStateBean) -> Result<Arc<AuState>> {
        self.au_states.store(record).await
    }

    /// Full-record update on behalf of a state-owning service process;
    /// rejected if a live instance exists or the field set is partial.
    pub async fn update_au_state_from_service(
        &self,
        record: AuStateBean,
        fields: &FieldSet,
    ) -> Result<()> {
        self.au_states
            .update_from_service(record, fields, Some(self.cookie.clone()))
            .await
    }

    // ── Suspect URL versions ────────────────────────────────────────────

    pub async fn au_suspect_url_versions(
        &self,
        au_id: &str,
    ) -> Result<Arc<AuSuspectUrlVersions>> {
        self.suspect_versions.get(au_id).await
    }

    pub async fn au_suspect_url_versions_record(
        &self,
        au_id: &str,
    ) -> Result<AuSuspectUrlVersionsBean> {
        self.suspect_versions.get_record(au_id).await
    }

    // ── Lifecycle ───────────────────────────────────────────────────────

    /// Evict all live state for a deleted or deactivated AU. Persisted
    /// copies are retained (soft delete) so reactivation restores them.
    pub async fn au_deleted(&self, au_id: &str) {
        self.au_states.evict(au_id).await;
        self.suspect_versions.evict(au_id).await;
        tracing::info!(au_id, "Evicted state for deleted AU");
    }
}
