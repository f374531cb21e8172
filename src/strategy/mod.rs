//! Signal generation
//!
//! The periodic generation cycle and the deterministic technical-rule
//! fallback used when the model is entirely unavailable.

pub mod engine;
pub mod technical;

pub use engine::{CycleReport, SignalEngine};
pub use technical::TechnicalRuleFallback;
