//! Suspect URL version set for one archival unit.
//!
//! A URL version lands here when a poll or local hash scan finds its computed
//! hash disagreeing with the stored one. The set is keyed by (url, version);
//! re-adding an existing key is a caller error handled in the live handle.

use serde::{Deserialize, Serialize};

use super::{StateKind, StateRecord};

/// One flagged (url, version) pair with the hashes that disagreed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SuspectUrlVersion {
    pub url: String,
    pub version: i32,
    pub created_time: i64,
    pub computed_hash: Option<String>,
    pub stored_hash: Option<String>,
}

/// Field names of `AuSuspectUrlVersionsBean`.
pub mod fields {
    pub const SUSPECT_VERSIONS: &str = "suspect_versions";
}

/// The per-AU suspect version set, as persisted and shipped in diffs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuSuspectUrlVersionsBean {
    pub au_id: String,
    pub suspect_versions: Vec<SuspectUrlVersion>,
}

impl AuSuspectUrlVersionsBean {
    /// Position of the (url, version) key in the set, if present.
    pub fn position(&self, url: &str, version: i32) -> Option<usize> {
        self.suspect_versions
            .iter()
            .position(|v| v.version == version && v.url == url)
    }

    pub fn contains(&self, url: &str, version: i32) -> bool {
        self.position(url, version).is_some()
    }

    pub fn len(&self) -> usize {
        self.suspect_versions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.suspect_versions.is_empty()
    }
}

impl StateRecord for AuSuspectUrlVersionsBean {
    const KIND: StateKind = StateKind::AuSuspectUrlVersions;
    const RESOURCE: &'static str = "aususpecturlversions";

    fn new_default(key: &str) -> Self {
        Self {
            au_id: key.to_string(),
            suspect_versions: Vec::new(),
        }
    }

    fn key(&self) -> &str {
        &self.au_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn position_keys_on_url_and_version() {
        let mut bean = AuSuspectUrlVersionsBean::new_default("au1");
        bean.suspect_versions.push(SuspectUrlVersion {
            url: "http://example.com/a".into(),
            version: 3,
            created_time: 1,
            computed_hash: Some("aa".into()),
            stored_hash: Some("bb".into()),
        });
        assert!(bean.contains("http://example.com/a", 3));
        assert!(!bean.contains("http://example.com/a", 4));
        assert!(!bean.contains("http://example.com/b", 3));
    }
}
