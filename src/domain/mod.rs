//! Domain value types shared across the core

pub mod candle;
pub mod portfolio;
pub mod signal;
pub mod state;

pub use candle::{Candle, CandleInterval};
pub use portfolio::{PortfolioSnapshot, Position};
pub use signal::{ScreeningResult, SignalAction, TradeSignal};
pub use state::{ReadinessEvent, ReadinessState, StateTransition};
