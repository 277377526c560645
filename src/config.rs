//! Application configuration loaded from environment variables.

use crate::error::{Result, StateError};
use std::env;

/// Application configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// State backend: "postgres", "rest" or "memory"
    pub state_backend: String,

    /// Database connection URL (when state_backend = "postgres")
    pub database_url: Option<String>,

    /// Base URL of the remote state service (when state_backend = "rest")
    pub rest_base_url: Option<String>,

    /// Bearer token for the remote state service (optional)
    pub rest_auth_token: Option<String>,

    /// Request timeout for the remote state service, in seconds
    pub rest_timeout_secs: u64,

    /// Capacity of the state notification channel
    pub bus_capacity: usize,

    /// Log level
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let config = Self {
            state_backend: env::var("STATE_BACKEND").unwrap_or_else(|_| "postgres".into()),
            database_url: env::var("DATABASE_URL").ok(),
            rest_base_url: env::var("STATE_SERVICE_URL").ok(),
            rest_auth_token: env::var("STATE_SERVICE_TOKEN").ok(),
            rest_timeout_secs: env::var("STATE_SERVICE_TIMEOUT_SECS")
                .unwrap_or_else(|_| "30".into())
                .parse()
                .unwrap_or(30),
            bus_capacity: env::var("STATE_BUS_CAPACITY")
                .unwrap_or_else(|_| "256".into())
                .parse()
                .unwrap_or(256),
            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".into()),
        };

        match config.state_backend.as_str() {
            "postgres" if config.database_url.is_none() => Err(StateError::Config(
                "DATABASE_URL not set for postgres state backend".into(),
            )),
            "rest" if config.rest_base_url.is_none() => Err(StateError::Config(
                "STATE_SERVICE_URL not set for rest state backend".into(),
            )),
            "postgres" | "rest" | "memory" => Ok(config),
            other => Err(StateError::Config(format!(
                "Unknown state backend '{other}'"
            ))),
        }
    }
}
