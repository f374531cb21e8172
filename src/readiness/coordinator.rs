//! Readiness coordinator
//!
//! Owns the canonical portfolio snapshot and the process-wide readiness
//! state. All mutation flows through `dispatch`, which performs its
//! read-modify-write synchronously; the single-flight guard ensures at most
//! one portfolio fetch is in flight no matter how many callers ask for one.
//!
//! Timer discipline: every state transition stops all per-state timers
//! first, then starts exactly the set appropriate to the new state, so
//! rapid transitions can never accumulate duplicates.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::ReadinessConfig;
use crate::domain::{PortfolioSnapshot, ReadinessEvent, ReadinessState, StateTransition};
use crate::exchange::PortfolioSource;
use crate::readiness::retry::{RetryPolicy, RetryScheduler};

const RETRY_KEY: &str = "readiness_fetch";
const TRANSITION_HISTORY: usize = 32;

/// Identifier returned by `subscribe`, used to unsubscribe
pub type SubscriptionId = u64;

type Listener = Arc<dyn Fn(&CoordinatorStatus) + Send + Sync>;

/// Observation surface consumed by the UI layer
#[derive(Debug, Clone, Serialize)]
pub struct CoordinatorStatus {
    pub state: ReadinessState,
    pub reason: Option<String>,
    /// Snapshot age in seconds, None when no snapshot exists yet
    pub snapshot_age_secs: Option<i64>,
    pub last_api_ping: Option<DateTime<Utc>>,
    pub retry_count: u32,
    pub portfolio: Option<PortfolioSnapshot>,
}

/// Extended status for diagnostics
#[derive(Debug, Clone, Serialize)]
pub struct DetailedStatus {
    #[serde(flatten)]
    pub status: CoordinatorStatus,
    pub fetch_in_flight: bool,
    pub active_timers: usize,
    pub recent_transitions: Vec<StateTransition>,
}

struct CoordinatorInner {
    state: ReadinessState,
    snapshot: Option<PortfolioSnapshot>,
    reason: Option<String>,
    retry_count: u32,
    last_api_ping: Option<DateTime<Utc>>,
    transitions: Vec<StateTransition>,
}

impl CoordinatorInner {
    fn status(&self) -> CoordinatorStatus {
        CoordinatorStatus {
            state: self.state,
            reason: self.reason.clone(),
            snapshot_age_secs: self.snapshot.as_ref().map(|s| s.age().num_seconds()),
            last_api_ping: self.last_api_ping,
            retry_count: self.retry_count,
            portfolio: self.snapshot.clone(),
        }
    }

    fn record_transition(&mut self, from: ReadinessState, to: ReadinessState, reason: &str) {
        self.transitions.push(StateTransition::new(from, to, reason));
        if self.transitions.len() > TRANSITION_HISTORY {
            let drop = self.transitions.len() - TRANSITION_HISTORY;
            self.transitions.drain(..drop);
        }
    }
}

/// Clears the single-flight flag on all exit paths, including panics.
struct InFlightGuard(Arc<AtomicBool>);

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Readiness state machine owner
pub struct ReadinessCoordinator {
    config: ReadinessConfig,
    source: Arc<dyn PortfolioSource>,
    retry: RetryScheduler,
    inner: Mutex<CoordinatorInner>,
    fetch_in_flight: Arc<AtomicBool>,
    timers: Mutex<Vec<JoinHandle<()>>>,
    listeners: Mutex<HashMap<SubscriptionId, Listener>>,
    next_subscription: AtomicU64,
}

impl ReadinessCoordinator {
    pub fn new(config: ReadinessConfig, source: Arc<dyn PortfolioSource>) -> Arc<Self> {
        let policy = RetryPolicy {
            base_ms: config.retry_base_ms,
            cap_ms: config.retry_cap_ms,
            jitter_max_ms: 500,
            max_retries: config.max_retries,
        };

        Arc::new(Self {
            config,
            source,
            retry: RetryScheduler::new(policy),
            inner: Mutex::new(CoordinatorInner {
                state: ReadinessState::Idle,
                snapshot: None,
                reason: None,
                retry_count: 0,
                last_api_ping: None,
                transitions: Vec::new(),
            }),
            fetch_in_flight: Arc::new(AtomicBool::new(false)),
            timers: Mutex::new(Vec::new()),
            listeners: Mutex::new(HashMap::new()),
            next_subscription: AtomicU64::new(1),
        })
    }

    /// Seed a pre-existing snapshot before `Init` (restart with warm state).
    pub fn with_snapshot(self: Arc<Self>, snapshot: PortfolioSnapshot) -> Arc<Self> {
        self.inner.lock().expect("coordinator lock poisoned").snapshot = Some(snapshot);
        self
    }

    // ── Observation surface ────────────────────────────────────────

    pub fn status(&self) -> CoordinatorStatus {
        self.inner.lock().expect("coordinator lock poisoned").status()
    }

    pub fn state(&self) -> ReadinessState {
        self.inner.lock().expect("coordinator lock poisoned").state
    }

    /// The canonical snapshot, only while the state is trusted.
    pub fn trusted_snapshot(&self) -> Option<PortfolioSnapshot> {
        let inner = self.inner.lock().expect("coordinator lock poisoned");
        if inner.state.is_trusted() {
            inner.snapshot.clone()
        } else {
            None
        }
    }

    pub fn detailed_status(&self) -> DetailedStatus {
        let (status, transitions) = {
            let inner = self.inner.lock().expect("coordinator lock poisoned");
            (inner.status(), inner.transitions.clone())
        };
        DetailedStatus {
            status,
            fetch_in_flight: self.fetch_in_flight.load(Ordering::SeqCst),
            active_timers: self.timers.lock().expect("timer lock poisoned").len(),
            recent_transitions: transitions,
        }
    }

    /// Register a listener notified synchronously on every transition.
    ///
    /// Listeners must not subscribe or unsubscribe from inside the callback.
    pub fn subscribe(&self, listener: impl Fn(&CoordinatorStatus) + Send + Sync + 'static) -> SubscriptionId {
        let id = self.next_subscription.fetch_add(1, Ordering::SeqCst);
        self.listeners
            .lock()
            .expect("listener lock poisoned")
            .insert(id, Arc::new(listener));
        id
    }

    pub fn unsubscribe(&self, id: SubscriptionId) {
        self.listeners.lock().expect("listener lock poisoned").remove(&id);
    }

    /// Manual refresh: no-ops when a fetch is already in flight.
    pub fn force_refresh(self: &Arc<Self>) {
        if self.fetch_in_flight.load(Ordering::SeqCst) {
            debug!("force_refresh ignored, fetch already in flight");
            return;
        }
        info!("manual refresh requested");
        self.spawn_fetch();
    }

    /// Stop all timers and cancel pending retries (shutdown path).
    pub fn shutdown(&self) {
        self.stop_all_timers();
        self.retry.cancel_all();
    }

    // ── State machine ──────────────────────────────────────────────

    /// Dispatch an event into the state machine.
    ///
    /// The read-modify-write of state and snapshot happens under one lock
    /// with no await inside, so transitions can never interleave.
    pub fn dispatch(self: &Arc<Self>, event: ReadinessEvent) {
        let event_name = event.as_str();

        let outcome = {
            let mut inner = self.inner.lock().expect("coordinator lock poisoned");
            let from = inner.state;

            match self.apply(&mut inner, event) {
                Applied::Transitioned { to, reason } => {
                    inner.record_transition(from, to, &reason);
                    info!(from = %from, to = %to, event = event_name, reason = %reason, "readiness transition");
                    Some((from, to, inner.status()))
                }
                Applied::Dropped { why } => {
                    debug!(state = %from, event = event_name, why, "event dropped");
                    None
                }
            }
        };

        let Some((_, to, status)) = outcome else {
            return;
        };

        // Timers: stop everything, then start exactly the new state's set.
        self.stop_all_timers();
        self.start_timers_for(to);

        match to {
            ReadinessState::Fetching => {
                self.spawn_fetch();
            }
            ReadinessState::Unstable => {
                self.schedule_backoff_retry();
            }
            _ => {}
        }

        self.notify_listeners(&status);
    }

    fn apply(&self, inner: &mut CoordinatorInner, event: ReadinessEvent) -> Applied {
        use ReadinessState::*;

        let state = inner.state;
        match event {
            ReadinessEvent::Init => {
                if state != Idle {
                    return Applied::dropped("INIT only valid from IDLE");
                }
                let fresh = inner
                    .snapshot
                    .as_ref()
                    .map(|s| s.is_fresh(self.config.snapshot_ttl_secs))
                    .unwrap_or(false);
                if fresh {
                    inner.state = Ready;
                    inner.reason = None;
                    Applied::transitioned(Ready, "existing snapshot still fresh")
                } else {
                    inner.state = Fetching;
                    Applied::transitioned(Fetching, "initial fetch")
                }
            }

            ReadinessEvent::FetchSuccess(snapshot) => {
                // Duplicate success carrying the same capture timestamp is
                // dropped, not reapplied.
                if let Some(current) = &inner.snapshot {
                    if current.fetched_at == snapshot.fetched_at {
                        return Applied::dropped("duplicate FETCH_SUCCESS");
                    }
                }
                let to = match state {
                    Fetching => Ready,
                    Ready => Ready,
                    SimulationRunning => SimulationRunning,
                    _ => return Applied::dropped("FETCH_SUCCESS outside fetch/refresh states"),
                };
                inner.snapshot = Some(snapshot);
                inner.retry_count = 0;
                inner.reason = None;
                inner.last_api_ping = Some(Utc::now());
                inner.state = to;
                Applied::transitioned(to, "snapshot refreshed")
            }

            ReadinessEvent::FetchFail { reason } => match state {
                Fetching | Ready | SimulationRunning => {
                    inner.state = Unstable;
                    inner.retry_count += 1;
                    inner.reason = Some(reason.clone());
                    Applied::transitioned(Unstable, &reason)
                }
                _ => Applied::dropped("FETCH_FAIL outside active states"),
            },

            ReadinessEvent::ApiDown { reason } => match state {
                Fetching | Ready | SimulationRunning => {
                    inner.state = Unstable;
                    inner.retry_count += 1;
                    inner.reason = Some(reason.clone());
                    Applied::transitioned(Unstable, &reason)
                }
                _ => Applied::dropped("API_DOWN outside active states"),
            },

            ReadinessEvent::AgeExceeded => match state {
                Ready | SimulationRunning => {
                    inner.state = Unstable;
                    inner.reason = Some("snapshot exceeded max age".to_string());
                    Applied::transitioned(Unstable, "snapshot exceeded max age")
                }
                _ => Applied::dropped("AGE_EXCEEDED outside trusted states"),
            },

            ReadinessEvent::ApiUp => match state {
                Unstable => {
                    inner.state = Fetching;
                    Applied::transitioned(Fetching, "exchange reachable again")
                }
                _ => Applied::dropped("API_UP outside UNSTABLE"),
            },

            ReadinessEvent::StartSimulation => match state {
                Ready => {
                    inner.state = SimulationRunning;
                    Applied::transitioned(SimulationRunning, "simulation started")
                }
                _ => Applied::dropped("START_SIMULATION outside READY"),
            },

            ReadinessEvent::StopSimulation => match state {
                SimulationRunning => {
                    let fresh = inner
                        .snapshot
                        .as_ref()
                        .map(|s| s.is_fresh(self.config.snapshot_ttl_secs))
                        .unwrap_or(false);
                    if fresh {
                        inner.state = Ready;
                        Applied::transitioned(Ready, "simulation stopped")
                    } else {
                        inner.state = Unstable;
                        inner.reason = Some("snapshot stale on simulation stop".to_string());
                        Applied::transitioned(Unstable, "snapshot stale on simulation stop")
                    }
                }
                _ => Applied::dropped("STOP_SIMULATION outside SIMULATION_RUNNING"),
            },
        }
    }

    // ── Fetch plumbing ─────────────────────────────────────────────

    /// Start the one allowed in-flight fetch. Returns false when a fetch
    /// is already running; the caller simply no-ops.
    fn spawn_fetch(self: &Arc<Self>) -> bool {
        if self
            .fetch_in_flight
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("fetch already in flight, not starting another");
            return false;
        }

        let this = Arc::clone(self);
        tokio::spawn(async move {
            let guard = InFlightGuard(Arc::clone(&this.fetch_in_flight));
            let result = this.source.fetch().await;
            drop(guard);

            match result {
                Ok(snapshot) => this.dispatch(ReadinessEvent::FetchSuccess(snapshot)),
                Err(e) => this.dispatch(ReadinessEvent::FetchFail {
                    reason: e.to_string(),
                }),
            }
        });
        true
    }

    fn schedule_backoff_retry(self: &Arc<Self>) {
        let retry_count = self.inner.lock().expect("coordinator lock poisoned").retry_count;

        if !self.retry.can_retry(retry_count) {
            warn!(
                retry_count,
                "fetch retries exhausted, staying UNSTABLE until manual refresh"
            );
            return;
        }

        let delay = self.retry.next_delay(retry_count);
        let this = Arc::clone(self);
        self.retry.schedule(RETRY_KEY, delay, move || async move {
            this.dispatch(ReadinessEvent::ApiUp);
        });
    }

    // ── Timers ─────────────────────────────────────────────────────

    fn stop_all_timers(&self) {
        let mut timers = self.timers.lock().expect("timer lock poisoned");
        for handle in timers.drain(..) {
            handle.abort();
        }
        self.retry.cancel(RETRY_KEY);
    }

    fn start_timers_for(self: &Arc<Self>, state: ReadinessState) {
        let mut handles = Vec::new();

        if state.is_trusted() {
            handles.push(self.spawn_ttl_timer());
            handles.push(self.spawn_refresh_timer());
        }
        if state == ReadinessState::SimulationRunning {
            handles.push(self.spawn_ping_timer());
            handles.push(self.spawn_watchdog_timer());
        }

        if !handles.is_empty() {
            let mut timers = self.timers.lock().expect("timer lock poisoned");
            timers.extend(handles);
        }
    }

    /// Fires AGE_EXCEEDED once the current snapshot passes its TTL.
    fn spawn_ttl_timer(self: &Arc<Self>) -> JoinHandle<()> {
        let remaining = {
            let inner = self.inner.lock().expect("coordinator lock poisoned");
            let ttl = self.config.snapshot_ttl_secs as i64;
            let age = inner
                .snapshot
                .as_ref()
                .map(|s| s.age().num_seconds())
                .unwrap_or(0);
            (ttl - age).max(0) as u64
        };

        let this = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(remaining)).await;
            this.dispatch(ReadinessEvent::AgeExceeded);
        })
    }

    /// Proactively refetches before the TTL can expire.
    fn spawn_refresh_timer(self: &Arc<Self>) -> JoinHandle<()> {
        let interval = Duration::from_secs(self.config.refresh_interval_secs);
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                debug!("periodic refresh");
                this.spawn_fetch();
            }
        })
    }

    /// Health ping while the simulation runs; a successful fetch doubles
    /// as the ping and updates `last_api_ping`.
    fn spawn_ping_timer(self: &Arc<Self>) -> JoinHandle<()> {
        let interval = Duration::from_secs(self.config.ping_interval_secs);
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                debug!("health ping");
                this.spawn_fetch();
            }
        })
    }

    /// Forces an early refresh when the snapshot nears its danger zone
    /// and no fetch is already in flight.
    fn spawn_watchdog_timer(self: &Arc<Self>) -> JoinHandle<()> {
        let interval = Duration::from_secs(self.config.watchdog_interval_secs);
        let danger_secs = self
            .config
            .snapshot_ttl_secs
            .saturating_sub(self.config.watchdog_margin_secs) as i64;
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let age = {
                    let inner = this.inner.lock().expect("coordinator lock poisoned");
                    inner.snapshot.as_ref().map(|s| s.age().num_seconds())
                };
                if let Some(age) = age {
                    if age >= danger_secs && !this.fetch_in_flight.load(Ordering::SeqCst) {
                        info!(age_secs = age, "watchdog forcing early refresh");
                        this.spawn_fetch();
                    }
                }
            }
        })
    }

    fn notify_listeners(&self, status: &CoordinatorStatus) {
        let listeners: Vec<Listener> = {
            let map = self.listeners.lock().expect("listener lock poisoned");
            map.values().cloned().collect()
        };
        for listener in listeners {
            listener(status);
        }
    }
}

enum Applied {
    Transitioned { to: ReadinessState, reason: String },
    Dropped { why: &'static str },
}

impl Applied {
    fn transitioned(to: ReadinessState, reason: &str) -> Self {
        Applied::Transitioned {
            to,
            reason: reason.to_string(),
        }
    }

    fn dropped(why: &'static str) -> Self {
        Applied::Dropped { why }
    }
}
