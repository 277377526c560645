//! Persistence contract between the caching engine and its backends.

use async_trait::async_trait;

use crate::error::Result;
use crate::models::{FieldSet, StateRecord};

/// Load/update operations for one entity kind against a persistence backend.
///
/// Implementations are collaborators, not part of the engine's own logic:
/// they must not retry (retry/backoff policy belongs to the backend side)
/// and they must not mutate anything on failure.
#[async_trait]
pub trait StateStore<R: StateRecord>: Send + Sync {
    /// Load the persisted record for `key`, or `None` if it was never stored.
    async fn find(&self, key: &str) -> Result<Option<R>>;

    /// Persist `record`, writing at least the fields named in `changed`
    /// (`FieldSet::All` or an empty set means the whole record).
    ///
    /// Returns a backend-specific identifier for the stored copy.
    async fn update(&self, key: &str, record: &R, changed: &FieldSet) -> Result<String>;
}
