//! AU State Keeper - Library
//!
//! Per-AU operational state for a distributed preservation network:
//! a generic singleton-per-key caching engine, field-granular partial
//! updates, change notifications, and pluggable persistence backends.

pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod services;
pub mod telemetry;

pub use config::Config;
pub use error::{Result, StateError};
