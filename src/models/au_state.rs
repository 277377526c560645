//! Crawl/poll state record for one archival unit.
//!
//! `AuStateBean` is the bare data form: every operational fact the crawler,
//! voting engine and metadata indexer record about an AU. Behavior (shadow
//! slots, batching, persistence) lives in the `AuState` handle in the
//! services layer. Timestamps are epoch milliseconds; `-1` means "never".

use serde::{Deserialize, Serialize};

use super::{now_ms, StateKind, StateRecord};

/// Outcome of a content crawl. `Running` is the in-flight sentinel written
/// while a crawl attempt is open; readers never see it because queries answer
/// from the shadow slot until the crawl finishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CrawlResult {
    Unknown,
    Running,
    Success,
    Error,
    Aborted,
    FetchError,
    NoPermission,
}

impl CrawlResult {
    pub fn as_str(&self) -> &'static str {
        match self {
            CrawlResult::Unknown => "unknown",
            CrawlResult::Running => "running",
            CrawlResult::Success => "success",
            CrawlResult::Error => "error",
            CrawlResult::Aborted => "aborted",
            CrawlResult::FetchError => "fetch_error",
            CrawlResult::NoPermission => "no_permission",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "running" => CrawlResult::Running,
            "success" => CrawlResult::Success,
            "error" => CrawlResult::Error,
            "aborted" => CrawlResult::Aborted,
            "fetch_error" => CrawlResult::FetchError,
            "no_permission" => CrawlResult::NoPermission,
            _ => CrawlResult::Unknown,
        }
    }
}

/// Outcome of a poll or local hash scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PollResult {
    Unknown,
    Running,
    Complete,
    Error,
    NoQuorum,
    Aborted,
}

impl PollResult {
    pub fn as_str(&self) -> &'static str {
        match self {
            PollResult::Unknown => "unknown",
            PollResult::Running => "running",
            PollResult::Complete => "complete",
            PollResult::Error => "error",
            PollResult::NoQuorum => "no_quorum",
            PollResult::Aborted => "aborted",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "running" => PollResult::Running,
            "complete" => PollResult::Complete,
            "error" => PollResult::Error,
            "no_quorum" => PollResult::NoQuorum,
            "aborted" => PollResult::Aborted,
            _ => PollResult::Unknown,
        }
    }
}

/// The poll variant being reported by the voting engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PollVariant {
    /// Proof-of-receipt, top-level content-agreement poll.
    Por,
    /// Proof-of-possession, pairwise peer check.
    Pop,
    /// Local integrity recheck against stored hashes.
    LocalHash,
}

/// CLOCKSS subscription status, with an explicit unknown value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClockssSubscriptionStatus {
    Unknown,
    Yes,
    No,
    Inaccessible,
}

impl ClockssSubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClockssSubscriptionStatus::Unknown => "unknown",
            ClockssSubscriptionStatus::Yes => "yes",
            ClockssSubscriptionStatus::No => "no",
            ClockssSubscriptionStatus::Inaccessible => "inaccessible",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "yes" => ClockssSubscriptionStatus::Yes,
            "no" => ClockssSubscriptionStatus::No,
            "inaccessible" => ClockssSubscriptionStatus::Inaccessible,
            _ => ClockssSubscriptionStatus::Unknown,
        }
    }
}

/// Open-access vs subscription access; `None` on the bean until known.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessType {
    OpenAccess,
    Subscription,
}

impl AccessType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccessType::OpenAccess => "open_access",
            AccessType::Subscription => "subscription",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "open_access" => Some(AccessType::OpenAccess),
            "subscription" => Some(AccessType::Subscription),
            _ => None,
        }
    }
}

/// Whether the AU has been found to hold substantial content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubstanceState {
    Unknown,
    Yes,
    No,
}

impl SubstanceState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubstanceState::Unknown => "unknown",
            SubstanceState::Yes => "yes",
            SubstanceState::No => "no",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "yes" => SubstanceState::Yes,
            "no" => SubstanceState::No,
            _ => SubstanceState::Unknown,
        }
    }
}

/// Field names of `AuStateBean` as used in diffs, notifications and the
/// remote partial-update protocol. Must match the serde names exactly.
pub mod fields {
    pub const AU_CREATION_TIME: &str = "au_creation_time";
    pub const LAST_CRAWL_TIME: &str = "last_crawl_time";
    pub const LAST_CRAWL_ATTEMPT: &str = "last_crawl_attempt";
    pub const LAST_CRAWL_RESULT: &str = "last_crawl_result";
    pub const LAST_CRAWL_RESULT_MSG: &str = "last_crawl_result_msg";
    pub const LAST_DEEP_CRAWL_TIME: &str = "last_deep_crawl_time";
    pub const LAST_DEEP_CRAWL_ATTEMPT: &str = "last_deep_crawl_attempt";
    pub const LAST_DEEP_CRAWL_RESULT: &str = "last_deep_crawl_result";
    pub const LAST_DEEP_CRAWL_RESULT_MSG: &str = "last_deep_crawl_result_msg";
    pub const LAST_DEEP_CRAWL_DEPTH: &str = "last_deep_crawl_depth";
    pub const LAST_TOP_LEVEL_POLL: &str = "last_top_level_poll";
    pub const LAST_POLL_RESULT: &str = "last_poll_result";
    pub const LAST_POLL_ATTEMPT: &str = "last_poll_attempt";
    pub const AVERAGE_POLL_DURATION: &str = "average_poll_duration";
    pub const LAST_POP_POLL: &str = "last_pop_poll";
    pub const LAST_POP_POLL_RESULT: &str = "last_pop_poll_result";
    pub const LAST_LOCAL_HASH_SCAN: &str = "last_local_hash_scan";
    pub const LAST_LOCAL_HASH_RESULT: &str = "last_local_hash_result";
    pub const AVERAGE_HASH_DURATION: &str = "average_hash_duration";
    pub const CLOCKSS_SUBSCRIPTION_STATUS: &str = "clockss_subscription_status";
    pub const ACCESS_TYPE: &str = "access_type";
    pub const SUBSTANCE_STATE: &str = "substance_state";
    pub const SUBSTANCE_VERSION: &str = "substance_version";
    pub const METADATA_VERSION: &str = "metadata_version";
    pub const LAST_METADATA_INDEX: &str = "last_metadata_index";
    pub const LAST_CONTENT_CHANGE: &str = "last_content_change";
    pub const NUM_AGREE_PEERS_LAST_POR: &str = "num_agree_peers_last_por";
    pub const NUM_WILLING_REPAIRERS: &str = "num_willing_repairers";
    pub const NUM_CURRENTLY_SUSPECT_VERSIONS: &str = "num_currently_suspect_versions";
    pub const CDN_STEMS: &str = "cdn_stems";
}

/// Crawl/poll state record for one AU.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuStateBean {
    pub au_id: String,
    pub au_creation_time: i64,

    pub last_crawl_time: i64,
    pub last_crawl_attempt: i64,
    pub last_crawl_result: CrawlResult,
    pub last_crawl_result_msg: Option<String>,

    pub last_deep_crawl_time: i64,
    pub last_deep_crawl_attempt: i64,
    pub last_deep_crawl_result: CrawlResult,
    pub last_deep_crawl_result_msg: Option<String>,
    pub last_deep_crawl_depth: i32,

    pub last_top_level_poll: i64,
    pub last_poll_result: PollResult,
    pub last_poll_attempt: i64,
    pub average_poll_duration: i64,

    pub last_pop_poll: i64,
    pub last_pop_poll_result: PollResult,

    pub last_local_hash_scan: i64,
    pub last_local_hash_result: PollResult,
    pub average_hash_duration: i64,

    pub clockss_subscription_status: ClockssSubscriptionStatus,
    pub access_type: Option<AccessType>,

    pub substance_state: SubstanceState,
    pub substance_version: Option<String>,
    pub metadata_version: Option<String>,
    pub last_metadata_index: i64,
    pub last_content_change: i64,

    pub num_agree_peers_last_por: i32,
    pub num_willing_repairers: i32,
    pub num_currently_suspect_versions: i32,

    pub cdn_stems: Vec<String>,
}

impl AuStateBean {
    /// Fold one duration sample into a running average:
    /// seeded from the first sample, then `(old + sample + 1) / 2`
    /// with integer division (ties round up).
    pub fn rolling_average(old: i64, sample: i64) -> i64 {
        if old <= 0 {
            sample
        } else {
            (old + sample + 1) / 2
        }
    }

    /// Whether the ordered CDN stem list already holds `stem`.
    pub fn has_cdn_stem(&self, stem: &str) -> bool {
        self.cdn_stems.iter().any(|s| s == stem)
    }
}

impl StateRecord for AuStateBean {
    const KIND: StateKind = StateKind::AuState;
    const RESOURCE: &'static str = "austates";

    fn new_default(key: &str) -> Self {
        Self {
            au_id: key.to_string(),
            au_creation_time: now_ms(),
            last_crawl_time: -1,
            last_crawl_attempt: -1,
            last_crawl_result: CrawlResult::Unknown,
            last_crawl_result_msg: None,
            last_deep_crawl_time: -1,
            last_deep_crawl_attempt: -1,
            last_deep_crawl_result: CrawlResult::Unknown,
            last_deep_crawl_result_msg: None,
            last_deep_crawl_depth: -1,
            last_top_level_poll: -1,
            last_poll_result: PollResult::Unknown,
            last_poll_attempt: -1,
            average_poll_duration: 0,
            last_pop_poll: -1,
            last_pop_poll_result: PollResult::Unknown,
            last_local_hash_scan: -1,
            last_local_hash_result: PollResult::Unknown,
            average_hash_duration: 0,
            clockss_subscription_status: ClockssSubscriptionStatus::Unknown,
            access_type: None,
            substance_state: SubstanceState::Unknown,
            substance_version: None,
            metadata_version: None,
            last_metadata_index: -1,
            last_content_change: -1,
            num_agree_peers_last_por: 0,
            num_willing_repairers: 0,
            num_currently_suspect_versions: 0,
            cdn_stems: Vec::new(),
        }
    }

    fn key(&self) -> &str {
        &self.au_id
    }
}
