//! Long-running service plumbing

pub mod cycle_timer;

pub use cycle_timer::{CycleTimerService, TimerConfig, TimerStats};
