//! Per-symbol error/backoff/blacklist ledger
//!
//! Consulted before each model call for a symbol and updated after every
//! call. Keeps the pipeline from hammering a consistently failing upstream:
//! exponential backoff per symbol, blacklist after repeated consecutive
//! failures, periodic sweep of expired blacklists. The whole ledger persists
//! through the state store so restarts do not forget a misbehaving symbol.

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::CandidateConfig;
use crate::error::{FailureKind, Result};
use crate::health::MetricsRegistry;
use crate::persistence::{StateStore, KEY_CANDIDATE_ERRORS};

/// Health ledger entry for one traded symbol, created lazily on first
/// error or success.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CandidateErrorState {
    pub consecutive_errors: u32,
    pub last_error_type: Option<FailureKind>,
    pub last_error_at: Option<DateTime<Utc>>,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub blacklisted_until: Option<DateTime<Utc>>,
    pub total_errors: u64,
    pub successful_calls: u64,
}

impl CandidateErrorState {
    pub fn is_blacklisted_at(&self, now: DateTime<Utc>) -> bool {
        self.blacklisted_until.map(|until| until > now).unwrap_or(false)
    }
}

/// Per-symbol health ledger, one instance process-wide
pub struct CandidateErrorManager {
    config: CandidateConfig,
    states: DashMap<String, CandidateErrorState>,
    metrics: Arc<MetricsRegistry>,
    store: Arc<dyn StateStore>,
    sweeper_running: AtomicBool,
}

impl CandidateErrorManager {
    /// Restore the ledger from the store; corrupt or absent entries start
    /// an empty map.
    pub async fn load(
        config: CandidateConfig,
        store: Arc<dyn StateStore>,
        metrics: Arc<MetricsRegistry>,
    ) -> Self {
        let states = DashMap::new();

        match store.load(KEY_CANDIDATE_ERRORS).await {
            Ok(Some(value)) => match serde_json::from_value::<HashMap<String, CandidateErrorState>>(value) {
                Ok(map) => {
                    let restored = map.len();
                    for (symbol, state) in map {
                        states.insert(symbol, state);
                    }
                    info!(symbols = restored, "restored candidate error ledger");
                }
                Err(e) => {
                    warn!(error = %e, "candidate ledger entry unreadable, reinitializing");
                }
            },
            Ok(None) => {}
            Err(e) => {
                warn!(error = %e, "candidate ledger load failed, reinitializing");
            }
        }

        let manager = Self {
            config,
            states,
            metrics,
            store,
            sweeper_running: AtomicBool::new(false),
        };
        manager.refresh_blacklist_gauge();
        manager
    }

    /// Record a failed call for a symbol.
    ///
    /// Returns `true` when this call newly blacklisted the symbol, so the
    /// caller can log/notify once rather than on every subsequent failure.
    pub async fn record_error(&self, symbol: &str, kind: FailureKind) -> bool {
        let now = Utc::now();
        let newly_blacklisted;

        {
            let mut entry = self.states.entry(symbol.to_string()).or_default();
            entry.consecutive_errors += 1;
            entry.total_errors += 1;
            entry.last_error_type = Some(kind);
            entry.last_error_at = Some(now);

            let exponent = entry.consecutive_errors.saturating_sub(1).min(16);
            let backoff_ms = self
                .config
                .base_delay_ms
                .saturating_mul(1u64 << exponent)
                .min(self.config.cap_delay_ms);
            let jitter_ms = if self.config.jitter_max_ms > 0 {
                rand::thread_rng().gen_range(0..=self.config.jitter_max_ms)
            } else {
                0
            };
            entry.next_retry_at = Some(now + Duration::milliseconds((backoff_ms + jitter_ms) as i64));

            let was_blacklisted = entry.is_blacklisted_at(now);
            if entry.consecutive_errors >= self.config.blacklist_threshold {
                entry.blacklisted_until =
                    Some(now + Duration::seconds(self.config.blacklist_duration_secs as i64));
            }
            newly_blacklisted = !was_blacklisted && entry.is_blacklisted_at(now);

            debug!(
                symbol,
                kind = %kind,
                consecutive = entry.consecutive_errors,
                backoff_ms,
                "candidate error recorded"
            );
        }

        self.metrics.record_error(kind);
        self.refresh_blacklist_gauge();
        if let Err(e) = self.persist().await {
            warn!(symbol, error = %e, "candidate ledger persist failed");
        }

        if newly_blacklisted {
            warn!(
                symbol,
                duration_secs = self.config.blacklist_duration_secs,
                "symbol blacklisted after repeated failures"
            );
        }
        newly_blacklisted
    }

    /// Record a successful call: consecutive counter resets and any
    /// blacklist clears immediately and unconditionally.
    pub async fn record_success(&self, symbol: &str) {
        {
            let mut entry = self.states.entry(symbol.to_string()).or_default();
            entry.consecutive_errors = 0;
            entry.successful_calls += 1;
            entry.blacklisted_until = None;
            entry.next_retry_at = None;
        }

        self.metrics.record_success();
        self.refresh_blacklist_gauge();
        if let Err(e) = self.persist().await {
            warn!(symbol, error = %e, "candidate ledger persist failed");
        }
    }

    /// Whether a call for this symbol may proceed now.
    ///
    /// True when no ledger entry exists yet; false while blacklisted; else
    /// true once the backoff deadline has passed.
    pub fn can_retry(&self, symbol: &str) -> bool {
        let now = Utc::now();
        match self.states.get(symbol) {
            None => true,
            Some(entry) => {
                if entry.is_blacklisted_at(now) {
                    return false;
                }
                match entry.next_retry_at {
                    Some(at) => now >= at,
                    None => true,
                }
            }
        }
    }

    pub fn is_blacklisted(&self, symbol: &str) -> bool {
        self.states
            .get(symbol)
            .map(|entry| entry.is_blacklisted_at(Utc::now()))
            .unwrap_or(false)
    }

    /// Time until a blacklisted symbol recovers, for operator display.
    pub fn blacklist_remaining(&self, symbol: &str) -> Option<Duration> {
        let now = Utc::now();
        self.states.get(symbol).and_then(|entry| {
            entry
                .blacklisted_until
                .filter(|until| *until > now)
                .map(|until| until - now)
        })
    }

    /// Ledger entry clone for diagnostics.
    pub fn state_of(&self, symbol: &str) -> Option<CandidateErrorState> {
        self.states.get(symbol).map(|entry| entry.value().clone())
    }

    pub fn blacklisted_count(&self) -> u64 {
        let now = Utc::now();
        self.states
            .iter()
            .filter(|entry| entry.is_blacklisted_at(now))
            .count() as u64
    }

    /// Clear expired blacklists and reset their consecutive counters,
    /// independent of any call being made for the symbol.
    pub async fn sweep_expired(&self) {
        let now = Utc::now();
        let mut swept = 0u32;

        for mut entry in self.states.iter_mut() {
            if let Some(until) = entry.blacklisted_until {
                if until <= now {
                    entry.blacklisted_until = None;
                    entry.consecutive_errors = 0;
                    entry.next_retry_at = None;
                    swept += 1;
                }
            }
        }

        if swept > 0 {
            info!(swept, "expired blacklists cleared");
            self.refresh_blacklist_gauge();
            if let Err(e) = self.persist().await {
                warn!(error = %e, "candidate ledger persist failed after sweep");
            }
        }
    }

    /// Spawn the periodic sweep task. Idempotent per manager instance.
    pub fn start_sweeper(self: &Arc<Self>) {
        if self.sweeper_running.swap(true, Ordering::SeqCst) {
            return;
        }

        let manager = Arc::clone(self);
        let interval = std::time::Duration::from_secs(self.config.sweep_interval_secs);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await; // first tick fires immediately, skip it
            while manager.sweeper_running.load(Ordering::SeqCst) {
                ticker.tick().await;
                manager.sweep_expired().await;
            }
        });
        debug!(
            interval_secs = self.config.sweep_interval_secs,
            "blacklist sweeper started"
        );
    }

    pub fn stop_sweeper(&self) {
        self.sweeper_running.store(false, Ordering::SeqCst);
    }

    fn refresh_blacklist_gauge(&self) {
        self.metrics.set_current_blacklists(self.blacklisted_count());
    }

    async fn persist(&self) -> Result<()> {
        let map: HashMap<String, CandidateErrorState> = self
            .states
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();
        let value = serde_json::to_value(&map)?;
        self.store.save(KEY_CANDIDATE_ERRORS, value).await
    }
}
