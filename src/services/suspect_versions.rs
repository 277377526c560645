//! Live handle over an AU's suspect URL version set.

use std::sync::{Arc, Mutex, Weak};

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::error::{Result, StateError};
use crate::models::suspect_versions::{fields, AuSuspectUrlVersionsBean, SuspectUrlVersion};
use crate::models::{merge_diff, now_ms, FieldSet};
use crate::services::state_cache::{StateCache, StateEntity};

/// Current-version lookup against the content repository. This is the one
/// outward call the suspect-version component makes: an entry only counts as
/// *currently* suspect while its version is still the URL's current version.
#[async_trait]
pub trait ContentVersionSource: Send + Sync {
    async fn current_version(&self, au_id: &str, url: &str) -> Result<Option<i32>>;
}

/// Behavior-bearing singleton for one AU's suspect version set.
pub struct AuSuspectUrlVersions {
    au_id: String,
    me: Weak<AuSuspectUrlVersions>,
    owner: Weak<StateCache<AuSuspectUrlVersions>>,
    inner: Mutex<AuSuspectUrlVersionsBean>,
}

impl StateEntity for AuSuspectUrlVersions {
    type Record = AuSuspectUrlVersionsBean;

    fn attach(record: AuSuspectUrlVersionsBean, owner: Weak<StateCache<Self>>) -> Arc<Self> {
        let au_id = record.au_id.clone();
        Arc::new_cyclic(|me| Self {
            au_id,
            me: me.clone(),
            owner,
            inner: Mutex::new(record),
        })
    }

    fn key(&self) -> &str {
        &self.au_id
    }

    fn snapshot(&self) -> AuSuspectUrlVersionsBean {
        self.lock().clone()
    }

    fn apply_diff(&self, diff: &Map<String, Value>) -> Result<()> {
        let mut bean = self.lock();
        *bean = merge_diff(&*bean, diff)?;
        Ok(())
    }
}

impl AuSuspectUrlVersions {
    fn lock(&self) -> std::sync::MutexGuard<'_, AuSuspectUrlVersionsBean> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn au_id(&self) -> &str {
        &self.au_id
    }

    /// Flag (url, version) as having a hash mismatch.
    ///
    /// Re-marking an existing pair is a caller error; unmark first to update
    /// the recorded hashes.
    pub async fn mark_suspect(
        &self,
        url: &str,
        version: i32,
        computed_hash: Option<&str>,
        stored_hash: Option<&str>,
    ) -> Result<()> {
        {
            let mut bean = self.lock();
            if bean.contains(url, version) {
                return Err(StateError::AlreadyMarked {
                    url: url.to_string(),
                    version,
                });
            }
            bean.suspect_versions.push(SuspectUrlVersion {
                url: url.to_string(),
                version,
                created_time: now_ms(),
                computed_hash: computed_hash.map(str::to_string),
                stored_hash: stored_hash.map(str::to_string),
            });
        }
        tracing::debug!(au_id = %self.au_id, url, version, "Marked suspect version");
        self.push_update().await
    }

    /// Clear the flag on (url, version). Unmarking an absent pair is logged
    /// but not an error.
    pub async fn unmark_suspect(&self, url: &str, version: i32) -> Result<()> {
        let removed = {
            let mut bean = self.lock();
            match bean.position(url, version) {
                Some(index) => {
                    bean.suspect_versions.remove(index);
                    true
                }
                None => false,
            }
        };
        if !removed {
            tracing::warn!(au_id = %self.au_id, url, version,
                "Unmark of a version that is not suspect");
            return Ok(());
        }
        self.push_update().await
    }

    pub fn is_suspect(&self, url: &str, version: i32) -> bool {
        self.lock().contains(url, version)
    }

    /// Snapshot of all flagged entries.
    pub fn suspect_versions(&self) -> Vec<SuspectUrlVersion> {
        self.lock().suspect_versions.clone()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Count entries whose version is still the URL's current version in the
    /// content repository.
    pub async fn count_currently_suspect(
        &self,
        repository: &dyn ContentVersionSource,
    ) -> Result<usize> {
        let entries = self.suspect_versions();
        let mut count = 0;
        for entry in &entries {
            if repository.current_version(&self.au_id, &entry.url).await?
                == Some(entry.version)
            {
                count += 1;
            }
        }
        Ok(count)
    }

    async fn push_update(&self) -> Result<()> {
        let owner = self.owner.upgrade().ok_or_else(|| {
            StateError::Internal(format!(
                "owning state cache dropped for AU '{}'",
                self.au_id
            ))
        })?;
        let me = self.me.upgrade().ok_or_else(|| {
            StateError::Internal(format!("self handle dropped for AU '{}'", self.au_id))
        })?;
        owner
            .update(&me, &FieldSet::of(&[fields::SUSPECT_VERSIONS]), None)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::memory_store::MemoryStateStore;
    use crate::services::state_bus::StateBus;
    use crate::services::state_store::StateStore;
    use std::collections::HashMap;

    struct StubRepository {
        current: HashMap<String, i32>,
    }

    #[async_trait]
    impl ContentVersionSource for StubRepository {
        async fn current_version(&self, _au_id: &str, url: &str) -> Result<Option<i32>> {
            Ok(self.current.get(url).copied())
        }
    }

    async fn harness() -> (
        Arc<MemoryStateStore<AuSuspectUrlVersionsBean>>,
        Arc<StateCache<AuSuspectUrlVersions>>,
        Arc<AuSuspectUrlVersions>,
    ) {
        let store = Arc::new(MemoryStateStore::new());
        let bus = Arc::new(StateBus::new(64));
        let cache: Arc<StateCache<AuSuspectUrlVersions>> =
            StateCache::new(store.clone(), bus, None);
        let set = cache.get("au1").await.unwrap();
        (store, cache, set)
    }

    #[tokio::test]
    async fn mark_twice_is_a_caller_error() {
        let (_store, _cache, set) = harness().await;
        set.mark_suspect("http://e.com/a", 2, Some("aa"), Some("bb"))
            .await
            .unwrap();
        assert!(set.is_suspect("http://e.com/a", 2));

        let err = set
            .mark_suspect("http://e.com/a", 2, None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, StateError::AlreadyMarked { version: 2, .. }));
        // Another version of the same URL is a different key.
        set.mark_suspect("http://e.com/a", 3, None, None)
            .await
            .unwrap();
        assert_eq!(set.len(), 2);
    }

    #[tokio::test]
    async fn unmark_absent_warns_but_succeeds() {
        let (store, _cache, set) = harness().await;
        let calls = store.update_calls();
        set.unmark_suspect("http://e.com/a", 1).await.unwrap();
        // Nothing was removed, so nothing was persisted.
        assert_eq!(store.update_calls(), calls);

        set.mark_suspect("http://e.com/a", 1, None, None)
            .await
            .unwrap();
        set.unmark_suspect("http://e.com/a", 1).await.unwrap();
        assert!(!set.is_suspect("http://e.com/a", 1));
    }

    #[tokio::test]
    async fn unmark_then_remark_updates_hashes() {
        let (_store, _cache, set) = harness().await;
        set.mark_suspect("http://e.com/a", 1, Some("old"), None)
            .await
            .unwrap();
        set.unmark_suspect("http://e.com/a", 1).await.unwrap();
        set.mark_suspect("http://e.com/a", 1, Some("new"), Some("stored"))
            .await
            .unwrap();
        let entries = set.suspect_versions();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].computed_hash.as_deref(), Some("new"));
    }

    #[tokio::test]
    async fn currently_suspect_checks_repository_versions() {
        let (_store, _cache, set) = harness().await;
        set.mark_suspect("http://e.com/a", 2, None, None)
            .await
            .unwrap();
        set.mark_suspect("http://e.com/b", 1, None, None)
            .await
            .unwrap();
        set.mark_suspect("http://e.com/c", 5, None, None)
            .await
            .unwrap();

        // /a is still at the suspect version; /b has moved on; /c is gone.
        let repository = StubRepository {
            current: HashMap::from([
                ("http://e.com/a".to_string(), 2),
                ("http://e.com/b".to_string(), 4),
            ]),
        };
        assert_eq!(set.count_currently_suspect(&repository).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn set_survives_eviction_through_backend(){
        let (store, _cache, set) = harness().await;
        set.mark_suspect("http://e.com/a", 2, None, None)
            .await
            .unwrap();
        let saved = store.find("au1").await.unwrap().unwrap();
        assert!(saved.contains("http://e.com/a", 2));
    }
}
