//! Readiness state machine states and events
//!
//! Exactly one `ReadinessState` instance exists process-wide, owned by the
//! coordinator; transitions are the only legal mutation path.

use serde::{Deserialize, Serialize};
use std::fmt;

use super::PortfolioSnapshot;

/// Readiness of the canonical portfolio snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReadinessState {
    /// Initial state before the first fetch is requested
    Idle,
    /// A snapshot fetch is in flight
    Fetching,
    /// Snapshot is fresh and trustworthy
    Ready,
    /// Ready, with the simulated trading loop active
    SimulationRunning,
    /// Snapshot missing, stale, or the exchange is unreachable
    Unstable,
}

impl ReadinessState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReadinessState::Idle => "IDLE",
            ReadinessState::Fetching => "FETCHING",
            ReadinessState::Ready => "READY",
            ReadinessState::SimulationRunning => "SIMULATION_RUNNING",
            ReadinessState::Unstable => "UNSTABLE",
        }
    }

    /// Check if this state can transition to another state.
    ///
    /// `Idle` is the initial state and unreachable once left.
    pub fn can_transition_to(&self, target: ReadinessState) -> bool {
        use ReadinessState::*;

        match (self, target) {
            // From Idle: first fetch, or straight to Ready when a fresh
            // snapshot already exists
            (Idle, Fetching) => true,
            (Idle, Ready) => true,

            // From Fetching
            (Fetching, Ready) => true,    // Fetch succeeded
            (Fetching, Unstable) => true, // Fetch failed / API down

            // From Ready
            (Ready, SimulationRunning) => true, // Simulation started
            (Ready, Unstable) => true,          // TTL expired / API down
            (Ready, Fetching) => true,          // Forced refresh

            // From SimulationRunning
            (SimulationRunning, Ready) => true,    // Simulation stopped, snapshot fresh
            (SimulationRunning, Unstable) => true, // Stale / API down

            // From Unstable
            (Unstable, Fetching) => true, // API recovered

            // All other transitions are invalid; nothing returns to Idle
            _ => false,
        }
    }

    /// Get valid next states from current state
    pub fn valid_transitions(&self) -> Vec<ReadinessState> {
        use ReadinessState::*;

        match self {
            Idle => vec![Fetching, Ready],
            Fetching => vec![Ready, Unstable],
            Ready => vec![SimulationRunning, Unstable, Fetching],
            SimulationRunning => vec![Ready, Unstable],
            Unstable => vec![Fetching],
        }
    }

    /// Does this state hold a snapshot the rest of the app may trust?
    pub fn is_trusted(&self) -> bool {
        matches!(self, ReadinessState::Ready | ReadinessState::SimulationRunning)
    }
}

impl fmt::Display for ReadinessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl TryFrom<&str> for ReadinessState {
    type Error = String;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        match s.to_uppercase().as_str() {
            "IDLE" => Ok(ReadinessState::Idle),
            "FETCHING" => Ok(ReadinessState::Fetching),
            "READY" => Ok(ReadinessState::Ready),
            "SIMULATION_RUNNING" => Ok(ReadinessState::SimulationRunning),
            "UNSTABLE" => Ok(ReadinessState::Unstable),
            _ => Err(format!("Unknown state: {}", s)),
        }
    }
}

/// Events dispatched into the readiness coordinator
#[derive(Debug, Clone)]
pub enum ReadinessEvent {
    /// Request the first snapshot (or reuse a still-fresh one)
    Init,
    /// A fetch completed with a new snapshot
    FetchSuccess(PortfolioSnapshot),
    /// A fetch failed
    FetchFail { reason: String },
    /// The exchange reported unreachable outside a fetch
    ApiDown { reason: String },
    /// The exchange recovered; refetch
    ApiUp,
    /// The current snapshot exceeded its TTL
    AgeExceeded,
    StartSimulation,
    StopSimulation,
}

impl ReadinessEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReadinessEvent::Init => "INIT",
            ReadinessEvent::FetchSuccess(_) => "FETCH_SUCCESS",
            ReadinessEvent::FetchFail { .. } => "FETCH_FAIL",
            ReadinessEvent::ApiDown { .. } => "API_DOWN",
            ReadinessEvent::ApiUp => "API_UP",
            ReadinessEvent::AgeExceeded => "AGE_EXCEEDED",
            ReadinessEvent::StartSimulation => "START_SIMULATION",
            ReadinessEvent::StopSimulation => "STOP_SIMULATION",
        }
    }
}

impl fmt::Display for ReadinessEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// State transition record (for logging/diagnostics)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateTransition {
    pub from: ReadinessState,
    pub to: ReadinessState,
    pub reason: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

impl StateTransition {
    pub fn new(from: ReadinessState, to: ReadinessState, reason: impl Into<String>) -> Self {
        Self {
            from,
            to,
            reason: reason.into(),
            timestamp: chrono::Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_transitions() {
        use ReadinessState::*;

        assert!(Idle.can_transition_to(Fetching));
        assert!(Idle.can_transition_to(Ready));
        assert!(Fetching.can_transition_to(Ready));
        assert!(Fetching.can_transition_to(Unstable));
        assert!(Ready.can_transition_to(SimulationRunning));
        assert!(Ready.can_transition_to(Unstable));
        assert!(SimulationRunning.can_transition_to(Ready));
        assert!(SimulationRunning.can_transition_to(Unstable));
        assert!(Unstable.can_transition_to(Fetching));
    }

    #[test]
    fn test_idle_is_unreachable_once_left() {
        use ReadinessState::*;

        for state in [Fetching, Ready, SimulationRunning, Unstable] {
            assert!(!state.can_transition_to(Idle), "{} -> Idle must be invalid", state);
        }
    }

    #[test]
    fn test_invalid_transitions() {
        use ReadinessState::*;

        assert!(!Idle.can_transition_to(SimulationRunning));
        assert!(!Fetching.can_transition_to(SimulationRunning));
        assert!(!Unstable.can_transition_to(Ready));
        assert!(!Unstable.can_transition_to(SimulationRunning));
    }

    #[test]
    fn test_state_from_str() {
        assert_eq!(
            ReadinessState::try_from("IDLE").unwrap(),
            ReadinessState::Idle
        );
        assert_eq!(
            ReadinessState::try_from("simulation_running").unwrap(),
            ReadinessState::SimulationRunning
        );
        assert!(ReadinessState::try_from("INVALID").is_err());
    }

    #[test]
    fn test_trusted_states() {
        assert!(ReadinessState::Ready.is_trusted());
        assert!(ReadinessState::SimulationRunning.is_trusted());
        assert!(!ReadinessState::Fetching.is_trusted());
        assert!(!ReadinessState::Unstable.is_trusted());
        assert!(!ReadinessState::Idle.is_trusted());
    }
}
