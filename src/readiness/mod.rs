//! Readiness state machine over the canonical portfolio snapshot
//!
//! The coordinator owns the one in-process snapshot, decides when the
//! portfolio source is called, and exposes readiness to the rest of the app.

pub mod coordinator;
pub mod retry;

pub use coordinator::{CoordinatorStatus, DetailedStatus, ReadinessCoordinator, SubscriptionId};
pub use retry::{RetryPolicy, RetryScheduler};
