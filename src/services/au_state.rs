//! Live handle over an AU's crawl/poll record.
//!
//! `AuState` wraps an `AuStateBean` with the behavior the crawler, voting
//! engine and metadata indexer call into: two-slot crawl tracking (readers
//! see the last *completed* result while an attempt is in flight), per-variant
//! poll bookkeeping, running duration averages, and reentrant update
//! batching. Every mutator marks the exact fields it touched and persists
//! them through the owning cache unless a batch is open.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, Weak};

use serde_json::{Map, Value};

use crate::error::{Result, StateError};
use crate::models::au_state::{
    fields, AccessType, AuStateBean, ClockssSubscriptionStatus, CrawlResult, PollResult,
    PollVariant, SubstanceState,
};
use crate::models::{merge_diff, now_ms, FieldSet};
use crate::services::state_cache::{StateCache, StateEntity};

/// Snapshot of the last-completed crawl fields, taken when a crawl starts.
/// Queries answer from this while the attempt is in flight.
#[derive(Debug, Clone)]
struct CrawlShadow {
    last_crawl_time: i64,
    last_crawl_result: CrawlResult,
    last_crawl_result_msg: Option<String>,
    last_deep_crawl_time: i64,
    last_deep_crawl_result: CrawlResult,
    last_deep_crawl_result_msg: Option<String>,
    last_deep_crawl_depth: i32,
}

/// Last-completed time and result of one poll variant, shadowed while a poll
/// of that variant is running.
#[derive(Debug, Clone, Copy)]
struct PollShadow {
    completed: i64,
    result: PollResult,
}

#[derive(Debug)]
struct AuStateInner {
    bean: AuStateBean,
    crawl_shadow: Option<CrawlShadow>,
    poll_shadows: HashMap<PollVariant, PollShadow>,
    batch_depth: u32,
    pending: BTreeSet<String>,
}

/// Behavior-bearing singleton for one AU's crawl/poll state.
#[derive(Debug)]
pub struct AuState {
    au_id: String,
    me: Weak<AuState>,
    owner: Weak<StateCache<AuState>>,
    inner: Mutex<AuStateInner>,
}

impl StateEntity for AuState {
    type Record = AuStateBean;

    fn attach(record: AuStateBean, owner: Weak<StateCache<Self>>) -> Arc<Self> {
        let au_id = record.au_id.clone();
        Arc::new_cyclic(|me| Self {
            au_id,
            me: me.clone(),
            owner,
            inner: Mutex::new(AuStateInner {
                bean: record,
                crawl_shadow: None,
                poll_shadows: HashMap::new(),
                batch_depth: 0,
                pending: BTreeSet::new(),
            }),
        })
    }

    fn key(&self) -> &str {
        &self.au_id
    }

    fn snapshot(&self) -> AuStateBean {
        self.lock().bean.clone()
    }

    fn apply_diff(&self, diff: &Map<String, Value>) -> Result<()> {
        let mut inner = self.lock();
        inner.bean = merge_diff(&inner.bean, diff)?;
        Ok(())
    }
}

impl AuState {
    fn lock(&self) -> std::sync::MutexGuard<'_, AuStateInner> {
        // The inner mutex is never held across an await, so poisoning only
        // happens if a panic already tore through a mutator.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn au_id(&self) -> &str {
        &self.au_id
    }

    /// Raw record contents, including any in-flight sentinel values.
    pub fn bean(&self) -> AuStateBean {
        self.snapshot()
    }

    // ── Crawl tracking ──────────────────────────────────────────────────

    /// Record the start of a new-content crawl attempt.
    ///
    /// The last-completed crawl fields are snapshotted into a transient
    /// shadow so concurrent readers keep seeing them; the live fields get a
    /// `Running` sentinel until `new_crawl_finished`.
    pub async fn new_crawl_started(&self) -> Result<()> {
        {
            let mut inner = self.lock();
            if inner.crawl_shadow.is_none() {
                inner.crawl_shadow = Some(CrawlShadow {
                    last_crawl_time: inner.bean.last_crawl_time,
                    last_crawl_result: inner.bean.last_crawl_result,
                    last_crawl_result_msg: inner.bean.last_crawl_result_msg.clone(),
                    last_deep_crawl_time: inner.bean.last_deep_crawl_time,
                    last_deep_crawl_result: inner.bean.last_deep_crawl_result,
                    last_deep_crawl_result_msg: inner.bean.last_deep_crawl_result_msg.clone(),
                    last_deep_crawl_depth: inner.bean.last_deep_crawl_depth,
                });
            }
            inner.bean.last_crawl_attempt = now_ms();
            inner.bean.last_crawl_result = CrawlResult::Running;
            inner.bean.last_crawl_result_msg = None;
        }
        self.changed(&[
            fields::LAST_CRAWL_ATTEMPT,
            fields::LAST_CRAWL_RESULT,
            fields::LAST_CRAWL_RESULT_MSG,
        ])
        .await
    }

    /// Record the end of a crawl attempt. A successful result advances the
    /// last-completed time; `depth > 0` additionally updates the parallel
    /// deep-crawl fields.
    pub async fn new_crawl_finished(
        &self,
        result: CrawlResult,
        message: Option<&str>,
        depth: i32,
    ) -> Result<()> {
        let mut touched: Vec<&'static str> = vec![
            fields::LAST_CRAWL_RESULT,
            fields::LAST_CRAWL_RESULT_MSG,
        ];
        {
            let mut inner = self.lock();
            inner.crawl_shadow = None;
            let now = now_ms();
            inner.bean.last_crawl_result = result;
            inner.bean.last_crawl_result_msg = message.map(str::to_string);
            if result == CrawlResult::Success {
                inner.bean.last_crawl_time = now;
                touched.push(fields::LAST_CRAWL_TIME);
            }
            if depth > 0 {
                inner.bean.last_deep_crawl_attempt = inner.bean.last_crawl_attempt;
                inner.bean.last_deep_crawl_result = result;
                inner.bean.last_deep_crawl_result_msg = message.map(str::to_string);
                inner.bean.last_deep_crawl_depth = depth;
                touched.extend([
                    fields::LAST_DEEP_CRAWL_ATTEMPT,
                    fields::LAST_DEEP_CRAWL_RESULT,
                    fields::LAST_DEEP_CRAWL_RESULT_MSG,
                    fields::LAST_DEEP_CRAWL_DEPTH,
                ]);
                if result == CrawlResult::Success {
                    inner.bean.last_deep_crawl_time = now;
                    touched.push(fields::LAST_DEEP_CRAWL_TIME);
                }
            }
        }
        self.changed(&touched).await
    }

    /// Record that crawled content differed from the stored version.
    /// Idempotent per crawl attempt: only the first report since the current
    /// attempt began is recorded.
    pub async fn content_changed(&self) -> Result<()> {
        {
            let mut inner = self.lock();
            let already = inner.bean.last_content_change >= 0
                && inner.bean.last_content_change >= inner.bean.last_crawl_attempt;
            if already {
                return Ok(());
            }
            inner.bean.last_content_change = now_ms();
        }
        self.changed(&[fields::LAST_CONTENT_CHANGE]).await
    }

    /// True while a crawl attempt is open.
    pub fn is_crawl_active(&self) -> bool {
        self.lock().crawl_shadow.is_some()
    }

    /// Last completed crawl result (shadow-aware).
    pub fn last_crawl_result(&self) -> CrawlResult {
        let inner = self.lock();
        match &inner.crawl_shadow {
            Some(shadow) => shadow.last_crawl_result,
            None => inner.bean.last_crawl_result,
        }
    }

    /// Last completed crawl result message (shadow-aware).
    pub fn last_crawl_result_msg(&self) -> Option<String> {
        let inner = self.lock();
        match &inner.crawl_shadow {
            Some(shadow) => shadow.last_crawl_result_msg.clone(),
            None => inner.bean.last_crawl_result_msg.clone(),
        }
    }

    /// Last completed crawl time (shadow-aware).
    pub fn last_crawl_time(&self) -> i64 {
        let inner = self.lock();
        match &inner.crawl_shadow {
            Some(shadow) => shadow.last_crawl_time,
            None => inner.bean.last_crawl_time,
        }
    }

    /// Last completed deep crawl time (shadow-aware).
    pub fn last_deep_crawl_time(&self) -> i64 {
        let inner = self.lock();
        match &inner.crawl_shadow {
            Some(shadow) => shadow.last_deep_crawl_time,
            None => inner.bean.last_deep_crawl_time,
        }
    }

    /// Last completed deep crawl result (shadow-aware).
    pub fn last_deep_crawl_result(&self) -> CrawlResult {
        let inner = self.lock();
        match &inner.crawl_shadow {
            Some(shadow) => shadow.last_deep_crawl_result,
            None => inner.bean.last_deep_crawl_result,
        }
    }

    /// Depth of the last completed deep crawl (shadow-aware).
    pub fn last_deep_crawl_depth(&self) -> i32 {
        let inner = self.lock();
        match &inner.crawl_shadow {
            Some(shadow) => shadow.last_deep_crawl_depth,
            None => inner.bean.last_deep_crawl_depth,
        }
    }

    /// Whether this AU has ever completed a crawl.
    pub fn has_crawled(&self) -> bool {
        self.last_crawl_time() >= 0
    }

    // ── Poll tracking ───────────────────────────────────────────────────

    /// Record a poll attempt; one timestamp shared by all variants.
    pub async fn poll_attempted(&self) -> Result<()> {
        {
            let mut inner = self.lock();
            inner.bean.last_poll_attempt = now_ms();
        }
        self.changed(&[fields::LAST_POLL_ATTEMPT]).await
    }

    /// Record the start of a poll of `variant`: the variant's last-completed
    /// fields are shadowed and its live result gets the `Running` sentinel.
    pub async fn poll_started(&self, variant: PollVariant) -> Result<()> {
        {
            let mut inner = self.lock();
            let shadow = PollShadow {
                completed: poll_time(&inner.bean, variant),
                result: poll_result(&inner.bean, variant),
            };
            inner.poll_shadows.entry(variant).or_insert(shadow);
            set_poll_result(&mut inner.bean, variant, PollResult::Running);
        }
        self.changed(&[variant_result_field(variant)]).await
    }

    /// Record the end of a poll of `variant`. A `Complete` result advances
    /// the variant's last-completed time; a duration sample folds into the
    /// running average for that family (polls vs. local hash scans).
    pub async fn poll_finished(
        &self,
        variant: PollVariant,
        result: PollResult,
        duration_ms: Option<i64>,
    ) -> Result<()> {
        let mut touched: Vec<&'static str> = vec![variant_result_field(variant)];
        {
            let mut inner = self.lock();
            inner.poll_shadows.remove(&variant);
            set_poll_result(&mut inner.bean, variant, result);
            if result == PollResult::Complete {
                set_poll_time(&mut inner.bean, variant, now_ms());
                touched.push(variant_time_field(variant));
            }
            if let Some(sample) = duration_ms {
                match variant {
                    PollVariant::LocalHash => {
                        inner.bean.average_hash_duration =
                            AuStateBean::rolling_average(inner.bean.average_hash_duration, sample);
                        touched.push(fields::AVERAGE_HASH_DURATION);
                    }
                    PollVariant::Por | PollVariant::Pop => {
                        inner.bean.average_poll_duration =
                            AuStateBean::rolling_average(inner.bean.average_poll_duration, sample);
                        touched.push(fields::AVERAGE_POLL_DURATION);
                    }
                }
            }
        }
        self.changed(&touched).await
    }

    /// Last completed time of `variant` (shadow-aware).
    pub fn last_poll_time(&self, variant: PollVariant) -> i64 {
        let inner = self.lock();
        match inner.poll_shadows.get(&variant) {
            Some(shadow) => shadow.completed,
            None => poll_time(&inner.bean, variant),
        }
    }

    /// Last result of `variant` (shadow-aware).
    pub fn last_poll_result(&self, variant: PollVariant) -> PollResult {
        let inner = self.lock();
        match inner.poll_shadows.get(&variant) {
            Some(shadow) => shadow.result,
            None => poll_result(&inner.bean, variant),
        }
    }

    pub fn average_poll_duration(&self) -> i64 {
        self.lock().bean.average_poll_duration
    }

    pub fn average_hash_duration(&self) -> i64 {
        self.lock().bean.average_hash_duration
    }

    /// Fold one poll duration sample into the running average, outside of
    /// `poll_finished` (e.g. a poll timed by the caller after reporting).
    pub async fn set_poll_duration(&self, sample_ms: i64) -> Result<()> {
        {
            let mut inner = self.lock();
            inner.bean.average_poll_duration =
                AuStateBean::rolling_average(inner.bean.average_poll_duration, sample_ms);
        }
        self.changed(&[fields::AVERAGE_POLL_DURATION]).await
    }

    /// Fold one local hash scan duration sample into its running average.
    pub async fn set_hash_duration(&self, sample_ms: i64) -> Result<()> {
        {
            let mut inner = self.lock();
            inner.bean.average_hash_duration =
                AuStateBean::rolling_average(inner.bean.average_hash_duration, sample_ms);
        }
        self.changed(&[fields::AVERAGE_HASH_DURATION]).await
    }

    // ── Scalar setters (no-op suppressed) ───────────────────────────────

    pub async fn set_clockss_subscription_status(
        &self,
        status: ClockssSubscriptionStatus,
    ) -> Result<()> {
        {
            let mut inner = self.lock();
            if inner.bean.clockss_subscription_status == status {
                return Ok(());
            }
            inner.bean.clockss_subscription_status = status;
        }
        self.changed(&[fields::CLOCKSS_SUBSCRIPTION_STATUS]).await
    }

    pub async fn set_access_type(&self, access_type: AccessType) -> Result<()> {
        {
            let mut inner = self.lock();
            if inner.bean.access_type == Some(access_type) {
                return Ok(());
            }
            inner.bean.access_type = Some(access_type);
        }
        self.changed(&[fields::ACCESS_TYPE]).await
    }

    /// Record the substance determination along with the plugin feature
    /// version it was computed under.
    pub async fn set_substance_state(
        &self,
        state: SubstanceState,
        feature_version: Option<&str>,
    ) -> Result<()> {
        let mut touched: Vec<&'static str> = Vec::new();
        {
            let mut inner = self.lock();
            if inner.bean.substance_state != state {
                inner.bean.substance_state = state;
                touched.push(fields::SUBSTANCE_STATE);
            }
            if inner.bean.substance_version.as_deref() != feature_version {
                inner.bean.substance_version = feature_version.map(str::to_string);
                touched.push(fields::SUBSTANCE_VERSION);
            }
        }
        if touched.is_empty() {
            return Ok(());
        }
        self.changed(&touched).await
    }

    pub async fn set_metadata_version(&self, feature_version: Option<&str>) -> Result<()> {
        {
            let mut inner = self.lock();
            if inner.bean.metadata_version.as_deref() == feature_version {
                return Ok(());
            }
            inner.bean.metadata_version = feature_version.map(str::to_string);
        }
        self.changed(&[fields::METADATA_VERSION]).await
    }

    /// Record completion of a metadata indexing pass.
    pub async fn metadata_indexed(&self) -> Result<()> {
        {
            let mut inner = self.lock();
            inner.bean.last_metadata_index = now_ms();
        }
        self.changed(&[fields::LAST_METADATA_INDEX]).await
    }

    pub async fn set_num_agree_peers_last_por(&self, count: i32) -> Result<()> {
        {
            let mut inner = self.lock();
            if inner.bean.num_agree_peers_last_por == count {
                return Ok(());
            }
            inner.bean.num_agree_peers_last_por = count;
        }
        self.changed(&[fields::NUM_AGREE_PEERS_LAST_POR]).await
    }

    pub async fn set_num_willing_repairers(&self, count: i32) -> Result<()> {
        {
            let mut inner = self.lock();
            if inner.bean.num_willing_repairers == count {
                return Ok(());
            }
            inner.bean.num_willing_repairers = count;
        }
        self.changed(&[fields::NUM_WILLING_REPAIRERS]).await
    }

    pub async fn set_num_currently_suspect_versions(&self, count: i32) -> Result<()> {
        {
            let mut inner = self.lock();
            if inner.bean.num_currently_suspect_versions == count {
                return Ok(());
            }
            inner.bean.num_currently_suspect_versions = count;
        }
        self.changed(&[fields::NUM_CURRENTLY_SUSPECT_VERSIONS]).await
    }

    /// Append a CDN stem discovered outside the AU's declared permission
    /// set. Order of discovery is preserved; duplicates are no-ops.
    pub async fn add_cdn_stem(&self, stem: &str) -> Result<()> {
        {
            let mut inner = self.lock();
            if inner.bean.has_cdn_stem(stem) {
                return Ok(());
            }
            inner.bean.cdn_stems.push(stem.to_string());
        }
        self.changed(&[fields::CDN_STEMS]).await
    }

    // ── Batching ────────────────────────────────────────────────────────

    /// Open a batch scope. While any batch is open, mutators accumulate
    /// touched field names instead of persisting; the outermost `commit`
    /// flushes the union as one backend update. Scopes nest.
    ///
    /// Dropping the guard without committing still closes the scope: the
    /// pending union is flushed on a spawned task, or folded into the next
    /// update if no runtime is available.
    pub fn begin_batch(&self) -> AuStateBatch {
        self.lock().batch_depth += 1;
        AuStateBatch {
            state: self.me.clone(),
            committed: false,
        }
    }

    async fn end_batch(&self) -> Result<()> {
        let flush = self.close_batch_scope();
        match flush {
            Some(fields) => self.push_update(FieldSet::Fields(fields)).await,
            None => Ok(()),
        }
    }

    /// Decrement the batch depth; when the outermost scope closes with
    /// pending fields, hand them to the caller for flushing.
    fn close_batch_scope(&self) -> Option<BTreeSet<String>> {
        let mut inner = self.lock();
        inner.batch_depth = inner.batch_depth.saturating_sub(1);
        if inner.batch_depth == 0 && !inner.pending.is_empty() {
            Some(std::mem::take(&mut inner.pending))
        } else {
            None
        }
    }

    fn abandon_batch(&self) {
        let Some(fields) = self.close_batch_scope() else {
            return;
        };
        let me = self.me.upgrade();
        match (me, tokio::runtime::Handle::try_current()) {
            (Some(state), Ok(handle)) => {
                tracing::warn!(au_id = %self.au_id,
                    "Batch dropped without commit; flushing pending fields");
                handle.spawn(async move {
                    if let Err(e) = state.push_update(FieldSet::Fields(fields)).await {
                        tracing::warn!(au_id = %state.au_id, error = %e,
                            "Failed to flush abandoned batch");
                    }
                });
            }
            _ => {
                // No runtime to flush on; fold into the next update.
                self.lock().pending.extend(fields);
            }
        }
    }

    // ── Persistence plumbing ────────────────────────────────────────────

    async fn changed(&self, names: &[&'static str]) -> Result<()> {
        let flush = {
            let mut inner = self.lock();
            if inner.batch_depth > 0 {
                inner
                    .pending
                    .extend(names.iter().map(|n| (*n).to_string()));
                None
            } else {
                let mut set: BTreeSet<String> =
                    names.iter().map(|n| (*n).to_string()).collect();
                // Pick up leftovers from an abandoned batch, if any.
                let leftovers = std::mem::take(&mut inner.pending);
                set.extend(leftovers);
                Some(set)
            }
        };
        match flush {
            Some(set) => self.push_update(FieldSet::Fields(set)).await,
            None => Ok(()),
        }
    }

    async fn push_update(&self, fields: FieldSet) -> Result<()> {
        let owner = self.owner.upgrade().ok_or_else(|| {
            StateError::Internal(format!(
                "owning state cache dropped for AU '{}'",
                self.au_id
            ))
        })?;
        let me = self.me.upgrade().ok_or_else(|| {
            StateError::Internal(format!("self handle dropped for AU '{}'", self.au_id))
        })?;
        owner.update(&me, &fields, None).await
    }
}

/// Batch scope guard returned by [`AuState::begin_batch`].
#[must_use = "holding the guard is what keeps the batch open"]
pub struct AuStateBatch {
    state: Weak<AuState>,
    committed: bool,
}

impl AuStateBatch {
    /// Close this scope; the outermost commit flushes the accumulated field
    /// union as a single backend update.
    pub async fn commit(mut self) -> Result<()> {
        self.committed = true;
        match self.state.upgrade() {
            Some(state) => state.end_batch().await,
            None => Ok(()),
        }
    }
}

impl Drop for AuStateBatch {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        if let Some(state) = self.state.upgrade() {
            state.abandon_batch();
        }
    }
}

fn variant_time_field(variant: PollVariant) -> &'static str {
    match variant {
        PollVariant::Por => fields::LAST_TOP_LEVEL_POLL,
        PollVariant::Pop => fields::LAST_POP_POLL,
        PollVariant::LocalHash => fields::LAST_LOCAL_HASH_SCAN,
    }
}

fn variant_result_field(variant: PollVariant) -> &'static str {
    match variant {
        PollVariant::Por => fields::LAST_POLL_RESULT,
        PollVariant::Pop => fields::LAST_POP_POLL_RESULT,
        PollVariant::LocalHash => fields::LAST_LOCAL_HASH_RESULT,
    }
}

fn poll_time(bean: &AuStateBean, variant: PollVariant) -> i64 {
    match variant {
        PollVariant::Por => bean.last_top_level_poll,
        PollVariant::Pop => bean.last_pop_poll,
        PollVariant::LocalHash => bean.last_local_hash_scan,
    }
}

fn poll_result(bean: &AuStateBean, variant: PollVariant) -> PollResult {
    match variant {
        PollVariant::Por => bean.last_poll_result,
        PollVariant::Pop => bean.last_pop_poll_result,
        PollVariant::LocalHash => bean.last_local_hash_result,
    }
}

fn set_poll_time(bean: &mut AuStateBean, variant: PollVariant, time: i64) {
    match variant {
        PollVariant::Por => bean.last_top_level_poll = time,
        PollVariant::Pop => bean.last_pop_poll = time,
        PollVariant::LocalHash => bean.last_local_hash_scan = time,
    }
}

fn set_poll_result(bean: &mut AuStateBean, variant: PollVariant, result: PollResult) {
    match variant {
        PollVariant::Por => bean.last_poll_result = result,
        PollVariant::Pop => bean.last_pop_poll_result = result,
        PollVariant::LocalHash => bean.last_local_hash_result = result,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::memory_store::MemoryStateStore;
    use crate::services::state_bus::StateBus;
    use crate::services::state_store::StateStore;

    async fn harness() -> (
        Arc<MemoryStateStore<AuStateBean>>,
        Arc<StateCache<AuState>>,
        Arc<AuState>,
    ) {
        let store = Arc::new(MemoryStateStore::new());
        let bus = Arc::new(StateBus::new(64));
        let cache: Arc<StateCache<AuState>> =
            StateCache::new(store.clone(), bus, None);
        let au = cache.get("org|plugin&au1").await.unwrap();
        (store, cache, au)
    }

    #[tokio::test]
    async fn crawl_shadow_answers_while_in_flight() {
        let (_store, _cache, au) = harness().await;
        au.new_crawl_finished(CrawlResult::Error, Some("boom"), 0)
            .await
            .unwrap();
        assert_eq!(au.last_crawl_result(), CrawlResult::Error);

        au.new_crawl_started().await.unwrap();
        assert!(au.is_crawl_active());
        // Readers see the last completed result, not the running sentinel.
        assert_eq!(au.last_crawl_result(), CrawlResult::Error);
        assert_eq!(au.last_crawl_result_msg().as_deref(), Some("boom"));
        assert_eq!(au.last_crawl_time(), -1);
        // The persisted record does carry the sentinel.
        assert_eq!(au.bean().last_crawl_result, CrawlResult::Running);

        au.new_crawl_finished(CrawlResult::Success, None, 0)
            .await
            .unwrap();
        assert!(!au.is_crawl_active());
        assert_eq!(au.last_crawl_result(), CrawlResult::Success);
        assert!(au.last_crawl_time() > 0);
        assert!(au.has_crawled());
    }

    #[tokio::test]
    async fn deep_crawl_updates_parallel_fields() {
        let (_store, _cache, au) = harness().await;
        au.new_crawl_started().await.unwrap();
        au.new_crawl_finished(CrawlResult::Success, None, 3)
            .await
            .unwrap();
        assert_eq!(au.last_deep_crawl_depth(), 3);
        assert_eq!(au.last_deep_crawl_result(), CrawlResult::Success);
        assert!(au.last_deep_crawl_time() > 0);
        assert_eq!(au.bean().last_deep_crawl_attempt, au.bean().last_crawl_attempt);

        // A shallow crawl leaves the deep fields alone.
        au.new_crawl_started().await.unwrap();
        au.new_crawl_finished(CrawlResult::Error, Some("nope"), 0)
            .await
            .unwrap();
        assert_eq!(au.last_deep_crawl_result(), CrawlResult::Success);
        assert_eq!(au.last_deep_crawl_depth(), 3);
    }

    #[tokio::test]
    async fn content_changed_is_idempotent_per_crawl() {
        let (store, _cache, au) = harness().await;
        au.new_crawl_started().await.unwrap();
        au.content_changed().await.unwrap();
        let first = au.bean().last_content_change;
        assert!(first > 0);

        let calls = store.update_calls();
        au.content_changed().await.unwrap();
        assert_eq!(au.bean().last_content_change, first);
        assert_eq!(store.update_calls(), calls);

        // A new crawl attempt re-arms the report.
        au.new_crawl_finished(CrawlResult::Success, None, 0)
            .await
            .unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        au.new_crawl_started().await.unwrap();
        au.content_changed().await.unwrap();
        assert!(au.bean().last_content_change > first);
    }

    #[tokio::test]
    async fn poll_duration_average_seeds_then_halves() {
        let (_store, _cache, au) = harness().await;
        au.poll_finished(PollVariant::Por, PollResult::Complete, Some(400))
            .await
            .unwrap();
        assert_eq!(au.average_poll_duration(), 400);
        au.poll_finished(PollVariant::Por, PollResult::Complete, Some(500))
            .await
            .unwrap();
        assert_eq!(au.average_poll_duration(), (400 + 500 + 1) / 2);
        // Hash scans keep their own average.
        au.poll_finished(PollVariant::LocalHash, PollResult::Complete, Some(80))
            .await
            .unwrap();
        assert_eq!(au.average_hash_duration(), 80);
        assert_eq!(au.average_poll_duration(), 450);

        // Caller-timed samples fold in the same way.
        au.set_poll_duration(550).await.unwrap();
        assert_eq!(au.average_poll_duration(), (450 + 550 + 1) / 2);
        au.set_hash_duration(120).await.unwrap();
        assert_eq!(au.average_hash_duration(), (80 + 120 + 1) / 2);
    }

    #[tokio::test]
    async fn poll_shadow_covers_each_variant_independently() {
        let (_store, _cache, au) = harness().await;
        au.poll_finished(PollVariant::Por, PollResult::Complete, None)
            .await
            .unwrap();
        let completed = au.last_poll_time(PollVariant::Por);

        au.poll_started(PollVariant::Por).await.unwrap();
        assert_eq!(au.last_poll_result(PollVariant::Por), PollResult::Complete);
        assert_eq!(au.last_poll_time(PollVariant::Por), completed);
        assert_eq!(au.bean().last_poll_result, PollResult::Running);
        // Other variants are unaffected.
        assert_eq!(au.last_poll_result(PollVariant::Pop), PollResult::Unknown);

        au.poll_finished(PollVariant::Por, PollResult::NoQuorum, None)
            .await
            .unwrap();
        assert_eq!(au.last_poll_result(PollVariant::Por), PollResult::NoQuorum);
        // No quorum does not advance the completed time.
        assert_eq!(au.last_poll_time(PollVariant::Por), completed);
    }

    #[tokio::test]
    async fn scalar_setters_suppress_no_ops() {
        let (store, _cache, au) = harness().await;
        let calls = store.update_calls();
        au.set_num_willing_repairers(0).await.unwrap();
        assert_eq!(store.update_calls(), calls);

        au.set_num_willing_repairers(3).await.unwrap();
        assert_eq!(store.update_calls(), calls + 1);

        au.set_access_type(AccessType::OpenAccess).await.unwrap();
        au.set_access_type(AccessType::OpenAccess).await.unwrap();
        assert_eq!(store.update_calls(), calls + 2);

        au.add_cdn_stem("http://cdn.example.com/").await.unwrap();
        au.add_cdn_stem("http://cdn.example.com/").await.unwrap();
        assert_eq!(store.update_calls(), calls + 3);
        assert_eq!(au.bean().cdn_stems.len(), 1);
    }

    #[tokio::test]
    async fn batch_coalesces_to_one_store_call() {
        let (store, _cache, au) = harness().await;
        let calls = store.update_calls();

        let batch = au.begin_batch();
        au.set_num_agree_peers_last_por(5).await.unwrap();
        au.set_num_willing_repairers(2).await.unwrap();
        au.set_clockss_subscription_status(ClockssSubscriptionStatus::Yes)
            .await
            .unwrap();
        assert_eq!(store.update_calls(), calls);
        batch.commit().await.unwrap();
        assert_eq!(store.update_calls(), calls + 1);

        let saved = store.find("org|plugin&au1").await.unwrap().unwrap();
        assert_eq!(saved.num_agree_peers_last_por, 5);
        assert_eq!(saved.num_willing_repairers, 2);
        assert_eq!(
            saved.clockss_subscription_status,
            ClockssSubscriptionStatus::Yes
        );
    }

    #[tokio::test]
    async fn nested_batches_flush_once_at_outermost() {
        let (store, _cache, au) = harness().await;
        let calls = store.update_calls();

        let outer = au.begin_batch();
        au.set_num_agree_peers_last_por(1).await.unwrap();
        {
            let inner = au.begin_batch();
            au.set_num_willing_repairers(7).await.unwrap();
            inner.commit().await.unwrap();
        }
        assert_eq!(store.update_calls(), calls);
        outer.commit().await.unwrap();
        assert_eq!(store.update_calls(), calls + 1);
    }

    #[tokio::test]
    async fn empty_batch_commit_is_a_no_op() {
        let (store, _cache, au) = harness().await;
        let calls = store.update_calls();
        au.begin_batch().commit().await.unwrap();
        assert_eq!(store.update_calls(), calls);
    }

    #[tokio::test]
    async fn abandoned_batch_still_flushes() {
        let (store, _cache, au) = harness().await;
        let calls = store.update_calls();
        {
            let _batch = au.begin_batch();
            au.set_num_willing_repairers(9).await.unwrap();
            // Dropped without commit.
        }
        // The flush runs on a spawned task.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(store.update_calls(), calls + 1);
        let saved = store.find("org|plugin&au1").await.unwrap().unwrap();
        assert_eq!(saved.num_willing_repairers, 9);
    }
}
