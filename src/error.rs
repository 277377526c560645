//! State-layer error types and result alias.

use thiserror::Error;

/// Result alias used throughout the state layer.
pub type Result<T> = std::result::Result<T, StateError>;

/// Errors surfaced by the state manager and its backends.
///
/// Identity/protocol violations (`StaleHandle`, `NotCached`, `AlreadyExists`,
/// `AlreadyMarked`) are caller errors: fatal to the call and never retried
/// here. Serialization and backend failures are wrapped so callers see one
/// load/store error type; cached state is left untouched when they occur.
#[derive(Error, Debug)]
pub enum StateError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Update called with an instance that is not the cached singleton
    #[error("Stale handle for key '{key}': not the cached instance")]
    StaleHandle { key: String },

    /// Partial update against a key with no cached instance
    #[error("No cached instance for key '{key}': partial update rejected")]
    NotCached { key: String },

    /// First-time store against a key that already has an entry
    #[error("Entry already exists for key '{key}'")]
    AlreadyExists { key: String },

    /// (url, version) pair is already marked suspect
    #[error("Version {version} of '{url}' is already marked suspect")]
    AlreadyMarked { url: String, version: i32 },

    /// Record could not be converted to or from its wire/storage form
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Relational backend error
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Migration error
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Remote state service transport error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Backend rejected or failed the operation
    #[error("Store error: {0}")]
    Store(String),

    /// Internal invariant violation
    #[error("Internal error: {0}")]
    Internal(String),
}
