//! Durable key-value state storage
//!
//! The candidate error ledger and global health metrics persist across
//! process restarts through this layer. The backend is an implementation
//! choice behind the `StateStore` trait.

pub mod store;

pub use store::{FileStore, MemoryStore, StateStore};

/// Store key for the serialized candidate error map
pub const KEY_CANDIDATE_ERRORS: &str = "candidate_errors";
/// Store key for the global health metrics
pub const KEY_HEALTH_METRICS: &str = "health_metrics";
