//! Global health metrics aggregate
//!
//! Singleton counters over every model/exchange call the pipeline makes.
//! Persisted separately from the per-symbol ledger; never reset except by
//! explicit operator action.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use tracing::{info, warn};

use crate::error::{FailureKind, Result};
use crate::persistence::{StateStore, KEY_HEALTH_METRICS};

/// Serializable metrics snapshot
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HealthMetrics {
    pub total_calls: u64,
    pub successful_calls: u64,
    pub total_errors: u64,
    /// Derived count, recomputed after every ledger change
    pub current_blacklists: u64,
    pub fallbacks_used: u64,
    #[serde(default)]
    pub errors_by_type: HashMap<FailureKind, u64>,
    #[serde(default)]
    pub last_updated: Option<DateTime<Utc>>,
}

impl HealthMetrics {
    pub fn success_rate(&self) -> f64 {
        if self.total_calls == 0 {
            return 0.0;
        }
        self.successful_calls as f64 / self.total_calls as f64
    }
}

/// Process-wide metrics registry backed by the state store
pub struct MetricsRegistry {
    inner: Mutex<HealthMetrics>,
    store: Arc<dyn StateStore>,
}

impl MetricsRegistry {
    /// Load persisted metrics, falling back to zeroed counters when the
    /// entry is absent or was corrupt.
    pub async fn load(store: Arc<dyn StateStore>) -> Self {
        let initial = match store.load(KEY_HEALTH_METRICS).await {
            Ok(Some(value)) => match serde_json::from_value::<HealthMetrics>(value) {
                Ok(metrics) => {
                    info!(
                        total_calls = metrics.total_calls,
                        total_errors = metrics.total_errors,
                        "restored health metrics"
                    );
                    metrics
                }
                Err(e) => {
                    warn!(error = %e, "health metrics entry unreadable, reinitializing");
                    HealthMetrics::default()
                }
            },
            Ok(None) => HealthMetrics::default(),
            Err(e) => {
                warn!(error = %e, "health metrics load failed, reinitializing");
                HealthMetrics::default()
            }
        };

        Self {
            inner: Mutex::new(initial),
            store,
        }
    }

    pub fn record_success(&self) {
        let mut m = self.inner.lock().expect("metrics lock poisoned");
        m.total_calls += 1;
        m.successful_calls += 1;
        m.last_updated = Some(Utc::now());
    }

    pub fn record_error(&self, kind: FailureKind) {
        let mut m = self.inner.lock().expect("metrics lock poisoned");
        m.total_calls += 1;
        m.total_errors += 1;
        *m.errors_by_type.entry(kind).or_insert(0) += 1;
        m.last_updated = Some(Utc::now());
    }

    pub fn record_fallback(&self) {
        let mut m = self.inner.lock().expect("metrics lock poisoned");
        m.fallbacks_used += 1;
        m.last_updated = Some(Utc::now());
    }

    /// Recompute the derived blacklist count after a ledger change.
    pub fn set_current_blacklists(&self, count: u64) {
        let mut m = self.inner.lock().expect("metrics lock poisoned");
        m.current_blacklists = count;
    }

    pub fn snapshot(&self) -> HealthMetrics {
        self.inner.lock().expect("metrics lock poisoned").clone()
    }

    /// Persist current counters to the store.
    pub async fn persist(&self) -> Result<()> {
        let snapshot = self.snapshot();
        let value = serde_json::to_value(&snapshot)?;
        self.store.save(KEY_HEALTH_METRICS, value).await
    }

    /// Operator-initiated reset. The only path that zeroes counters.
    pub async fn reset(&self) -> Result<()> {
        {
            let mut m = self.inner.lock().expect("metrics lock poisoned");
            *m = HealthMetrics::default();
        }
        warn!("health metrics reset by operator");
        self.persist().await
    }
}
