//! External exchange collaborators, interfaces only
//!
//! Signing and request building live outside this core; the coordinator and
//! engine consume these traits and convert their failures into readiness
//! transitions and per-symbol ledger entries.

pub mod traits;

pub use traits::{CandleSource, PortfolioSource};
