//! Per-AU state records and the shared diff vocabulary.

pub mod au_state;
pub mod suspect_versions;

use std::collections::BTreeSet;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Result, StateError};

/// Entity-kind discriminator carried in every change notification.
///
/// `AuAgreements`, `NoAuPeerSet` and `UserAccount` are sibling kinds owned by
/// other services; they share the envelope vocabulary but have no cache here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StateKind {
    AuState,
    AuSuspectUrlVersions,
    AuAgreements,
    NoAuPeerSet,
    UserAccount,
}

/// The set of record fields touched by an update.
///
/// An empty `Fields` set is equivalent to `All`: callers that pass no names
/// mean the whole record, not "nothing changed".
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldSet {
    All,
    Fields(BTreeSet<String>),
}

impl FieldSet {
    /// Build a field set from static field names.
    pub fn of(names: &[&str]) -> Self {
        FieldSet::Fields(names.iter().map(|n| (*n).to_string()).collect())
    }

    /// True when this set denotes the whole record.
    pub fn is_full(&self) -> bool {
        match self {
            FieldSet::All => true,
            FieldSet::Fields(names) => names.is_empty(),
        }
    }

    /// True for a `Fields` set with at least one name.
    pub fn is_partial(&self) -> bool {
        !self.is_full()
    }

    /// Fold `other` into this set. Once either side is full, the union is full.
    pub fn merge(&mut self, other: &FieldSet) {
        match (&mut *self, other) {
            (FieldSet::All, _) => {}
            (_, FieldSet::All) => *self = FieldSet::All,
            (FieldSet::Fields(mine), FieldSet::Fields(theirs)) => {
                mine.extend(theirs.iter().cloned());
            }
        }
    }

    /// Whether a named field is covered by this set.
    pub fn contains(&self, name: &str) -> bool {
        match self {
            FieldSet::All => true,
            FieldSet::Fields(names) if names.is_empty() => true,
            FieldSet::Fields(names) => names.contains(name),
        }
    }
}

/// A bare per-key state record: the cheap, behavior-free form that backends
/// load and store and that notification diffs apply to.
pub trait StateRecord:
    Serialize + DeserializeOwned + Clone + Send + Sync + 'static
{
    /// Discriminator carried in notification envelopes for this kind.
    const KIND: StateKind;
    /// Resource segment used by the remote state service.
    const RESOURCE: &'static str;

    /// Default-construct the record for a key that has never been persisted.
    fn new_default(key: &str) -> Self;

    /// The AU key (or account name) this record belongs to.
    fn key(&self) -> &str;
}

/// A record's serialized form restricted to one field set.
///
/// The result is the JSON object sent to backends on partial update and
/// carried in change notifications.
pub fn record_diff<R: Serialize>(record: &R, fields: &FieldSet) -> Result<Map<String, Value>> {
    let value = serde_json::to_value(record)?;
    let Value::Object(mut map) = value else {
        return Err(StateError::Internal(
            "state record did not serialize to a JSON object".into(),
        ));
    };
    if !fields.is_full() {
        map.retain(|name, _| fields.contains(name));
    }
    Ok(map)
}

/// Overlay a field-level diff onto a record (last-write-wins per field).
///
/// Unknown field names are ignored with a warning so that records from a
/// newer peer do not poison older receivers.
pub fn merge_diff<R: Serialize + DeserializeOwned>(
    record: &R,
    diff: &Map<String, Value>,
) -> Result<R> {
    let value = serde_json::to_value(record)?;
    let Value::Object(mut map) = value else {
        return Err(StateError::Internal(
            "state record did not serialize to a JSON object".into(),
        ));
    };
    for (name, value) in diff {
        if map.contains_key(name) {
            map.insert(name.clone(), value.clone());
        } else {
            tracing::warn!(field = %name, "Ignoring unknown field in state diff");
        }
    }
    Ok(serde_json::from_value(Value::Object(map))?)
}

/// Current wall-clock time in epoch milliseconds.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Sample {
        a: i64,
        b: Option<String>,
        c: Vec<String>,
    }

    fn sample() -> Sample {
        Sample {
            a: 7,
            b: Some("x".into()),
            c: vec!["one".into(), "two".into()],
        }
    }

    #[test]
    fn empty_field_set_means_all() {
        assert!(FieldSet::of(&[]).is_full());
        assert!(FieldSet::All.is_full());
        assert!(FieldSet::of(&["a"]).is_partial());
    }

    #[test]
    fn merge_saturates_at_all() {
        let mut fields = FieldSet::of(&["a"]);
        fields.merge(&FieldSet::of(&["b"]));
        assert!(fields.contains("a") && fields.contains("b") && !fields.contains("c"));
        fields.merge(&FieldSet::All);
        assert!(fields.is_full());
    }

    #[test]
    fn diff_restricts_to_named_fields() {
        let diff = record_diff(&sample(), &FieldSet::of(&["a", "c"])).unwrap();
        assert_eq!(diff.len(), 2);
        assert_eq!(diff["a"], serde_json::json!(7));
        assert!(!diff.contains_key("b"));
    }

    #[test]
    fn merge_diff_overwrites_field_level() {
        let diff = record_diff(
            &Sample {
                a: 9,
                b: None,
                c: vec![],
            },
            &FieldSet::of(&["a"]),
        )
        .unwrap();
        let merged = merge_diff(&sample(), &diff).unwrap();
        assert_eq!(merged.a, 9);
        assert_eq!(merged.b.as_deref(), Some("x"));
    }

    #[test]
    fn merge_diff_ignores_unknown_fields() {
        let mut diff = Map::new();
        diff.insert("not_a_field".into(), serde_json::json!(1));
        let merged = merge_diff(&sample(), &diff).unwrap();
        assert_eq!(merged, sample());
    }
}
