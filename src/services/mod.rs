//! State-management services.

pub mod au_state;
pub mod memory_store;
pub mod postgres_store;
pub mod rest_store;
pub mod state_bus;
pub mod state_cache;
pub mod state_manager;
pub mod state_store;
pub mod suspect_versions;
