pub mod agent;
pub mod config;
pub mod domain;
pub mod error;
pub mod exchange;
pub mod health;
pub mod persistence;
pub mod readiness;
pub mod services;
pub mod strategy;

pub use agent::{HttpModelClient, ModelClient, ResponseValidator, ValidationOutcome};
pub use config::AppConfig;
pub use domain::{
    Candle, CandleInterval, PortfolioSnapshot, Position, ReadinessEvent, ReadinessState,
    ScreeningResult, SignalAction, TradeSignal,
};
pub use error::{FailureKind, Result, VigilError};
pub use exchange::{CandleSource, PortfolioSource};
pub use health::{CandidateErrorManager, CandidateErrorState, HealthMetrics, MetricsRegistry};
pub use persistence::{FileStore, MemoryStore, StateStore};
pub use readiness::{CoordinatorStatus, ReadinessCoordinator, RetryPolicy, RetryScheduler};
pub use services::{CycleTimerService, TimerConfig, TimerStats};
pub use strategy::{CycleReport, SignalEngine, TechnicalRuleFallback};
