//! Cross-component resilience properties
//!
//! Exercises the readiness coordinator, candidate ledger, validator and
//! cycle timer together through the public API, with fake collaborators.

use async_trait::async_trait;
use rust_decimal_macros::dec;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use vigil::agent::{ModelClient, ResponseValidator};
use vigil::config::{CandidateConfig, CycleConfig, ReadinessConfig, ValidatorConfig};
use vigil::domain::{Candle, CandleInterval, PortfolioSnapshot, ReadinessEvent, ReadinessState};
use vigil::error::{FailureKind, Result, VigilError};
use vigil::exchange::{CandleSource, PortfolioSource};
use vigil::health::{CandidateErrorManager, MetricsRegistry};
use vigil::persistence::{MemoryStore, StateStore};
use vigil::readiness::ReadinessCoordinator;
use vigil::services::{CycleTimerService, TimerConfig};
use vigil::strategy::{SignalEngine, TechnicalRuleFallback};

// ── Fakes ──────────────────────────────────────────────────────────

struct SlowPortfolio {
    calls: AtomicU32,
    delay: Duration,
}

#[async_trait]
impl PortfolioSource for SlowPortfolio {
    async fn fetch(&self) -> Result<PortfolioSnapshot> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        Ok(PortfolioSnapshot::new(Vec::new(), dec!(2500), dec!(2500)))
    }
}

struct StaticCandles;

#[async_trait]
impl CandleSource for StaticCandles {
    async fn history(
        &self,
        _symbol: &str,
        _interval: CandleInterval,
        limit: usize,
    ) -> Result<Vec<Candle>> {
        Ok((0..limit)
            .map(|i| Candle::new(100.0, 101.0, 99.0, 100.0 + i as f64 * 0.05, 1000.0))
            .collect())
    }
}

struct FixedModel {
    response: String,
}

#[async_trait]
impl ModelClient for FixedModel {
    async fn send(&self, _prompt: &str) -> Result<String> {
        Ok(self.response.clone())
    }
}

struct FailingModel;

#[async_trait]
impl ModelClient for FailingModel {
    async fn send(&self, _prompt: &str) -> Result<String> {
        Err(VigilError::Server("model API returned 503".into()))
    }
}

fn quiet_readiness_config() -> ReadinessConfig {
    ReadinessConfig {
        snapshot_ttl_secs: 300,
        refresh_interval_secs: 3600,
        ping_interval_secs: 3600,
        watchdog_interval_secs: 3600,
        watchdog_margin_secs: 60,
        max_retries: 3,
        retry_base_ms: 10,
        retry_cap_ms: 50,
    }
}

async fn ledger(config: CandidateConfig) -> (Arc<CandidateErrorManager>, Arc<MetricsRegistry>) {
    let store: Arc<dyn StateStore> = Arc::new(MemoryStore::new());
    let metrics = Arc::new(MetricsRegistry::load(store.clone()).await);
    let manager = Arc::new(CandidateErrorManager::load(config, store, metrics.clone()).await);
    (manager, metrics)
}

// ── Readiness coordinator ──────────────────────────────────────────

#[tokio::test]
async fn n_concurrent_fetch_requests_yield_one_underlying_call() {
    let source = Arc::new(SlowPortfolio {
        calls: AtomicU32::new(0),
        delay: Duration::from_millis(80),
    });
    let coordinator = ReadinessCoordinator::new(quiet_readiness_config(), source.clone());

    coordinator.dispatch(ReadinessEvent::Init);
    for _ in 0..20 {
        coordinator.force_refresh();
    }
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(source.calls.load(Ordering::SeqCst), 1);
    assert_eq!(coordinator.state(), ReadinessState::Ready);
}

#[tokio::test]
async fn duplicate_fetch_success_is_idempotent() {
    let source = Arc::new(SlowPortfolio {
        calls: AtomicU32::new(0),
        delay: Duration::from_millis(1),
    });
    let coordinator = ReadinessCoordinator::new(quiet_readiness_config(), source);
    coordinator.dispatch(ReadinessEvent::Init);
    tokio::time::sleep(Duration::from_millis(50)).await;

    let notifications = Arc::new(AtomicU32::new(0));
    let n = notifications.clone();
    coordinator.subscribe(move |_| {
        n.fetch_add(1, Ordering::SeqCst);
    });

    let snapshot = PortfolioSnapshot::new(Vec::new(), dec!(3000), dec!(3000));
    coordinator.dispatch(ReadinessEvent::FetchSuccess(snapshot.clone()));
    let status_once = coordinator.status();
    let after_one = notifications.load(Ordering::SeqCst);

    coordinator.dispatch(ReadinessEvent::FetchSuccess(snapshot));
    let status_twice = coordinator.status();

    // Same observable status, no extra notification
    assert_eq!(notifications.load(Ordering::SeqCst), after_one);
    assert_eq!(status_once.state, status_twice.state);
    assert_eq!(
        status_once.portfolio.as_ref().map(|p| p.fetched_at),
        status_twice.portfolio.as_ref().map(|p| p.fetched_at)
    );
}

#[tokio::test]
async fn state_is_always_one_of_the_five_defined_states() {
    let source = Arc::new(SlowPortfolio {
        calls: AtomicU32::new(0),
        delay: Duration::from_millis(1),
    });
    let coordinator = ReadinessCoordinator::new(quiet_readiness_config(), source);

    let events = vec![
        ReadinessEvent::StopSimulation, // invalid from Idle
        ReadinessEvent::AgeExceeded,    // invalid from Idle
        ReadinessEvent::Init,
        ReadinessEvent::StartSimulation, // invalid from Fetching
        ReadinessEvent::ApiDown {
            reason: "outage".into(),
        },
        ReadinessEvent::ApiUp,
        ReadinessEvent::Init, // invalid: Idle unreachable once left
    ];

    for event in events {
        coordinator.dispatch(event);
        let state = coordinator.state();
        assert!(matches!(
            state,
            ReadinessState::Idle
                | ReadinessState::Fetching
                | ReadinessState::Ready
                | ReadinessState::SimulationRunning
                | ReadinessState::Unstable
        ));
    }
}

// ── Candidate ledger ───────────────────────────────────────────────

#[tokio::test]
async fn blacklist_lifecycle_across_restart() {
    let store: Arc<dyn StateStore> = Arc::new(MemoryStore::new());
    let metrics = Arc::new(MetricsRegistry::load(store.clone()).await);
    let manager = Arc::new(
        CandidateErrorManager::load(CandidateConfig::default(), store.clone(), metrics.clone())
            .await,
    );

    for _ in 0..3 {
        manager.record_error("BTCUSDT", FailureKind::ServerError).await;
    }
    assert!(manager.is_blacklisted("BTCUSDT"));
    assert!(manager.blacklist_remaining("BTCUSDT").is_some());

    // The blacklist survives a process restart
    let restarted =
        CandidateErrorManager::load(CandidateConfig::default(), store, metrics).await;
    assert!(restarted.is_blacklisted("BTCUSDT"));

    // And success clears it, whatever came before
    restarted.record_success("BTCUSDT").await;
    assert!(!restarted.is_blacklisted("BTCUSDT"));
}

#[tokio::test]
async fn metrics_track_every_outcome() {
    let (manager, metrics) = ledger(CandidateConfig::default()).await;

    manager.record_error("ETHUSDT", FailureKind::Timeout).await;
    manager.record_error("ETHUSDT", FailureKind::RateLimit).await;
    manager.record_success("ETHUSDT").await;

    let snapshot = metrics.snapshot();
    assert_eq!(snapshot.total_calls, 3);
    assert_eq!(snapshot.total_errors, 2);
    assert_eq!(snapshot.successful_calls, 1);
    assert_eq!(snapshot.errors_by_type[&FailureKind::Timeout], 1);
    assert_eq!(snapshot.errors_by_type[&FailureKind::RateLimit], 1);
}

// ── Validator + engine ─────────────────────────────────────────────

#[tokio::test]
async fn hallucination_is_rejected_end_to_end() {
    let (manager, metrics) = ledger(CandidateConfig {
        base_delay_ms: 0,
        jitter_max_ms: 0,
        ..Default::default()
    })
    .await;

    let source = Arc::new(SlowPortfolio {
        calls: AtomicU32::new(0),
        delay: Duration::from_millis(1),
    });
    let coordinator = ReadinessCoordinator::new(quiet_readiness_config(), source);
    coordinator.dispatch(ReadinessEvent::Init);
    tokio::time::sleep(Duration::from_millis(50)).await;

    // Screening stays on-list, the detail signal references a symbol the
    // model was never given
    let model = FixedModel {
        response: r#"{"symbols":["BTCUSDT"],"signal_type":"BUY","confidence_score":0.95,"asset_pair":"SHIBUSDT"}"#
            .to_string(),
    };

    let engine = SignalEngine::new(
        CycleConfig {
            symbol_spacing_ms: 1,
            model_max_retries: 0,
            ..Default::default()
        },
        vec!["BTCUSDT".to_string()],
        coordinator,
        manager.clone(),
        metrics.clone(),
        Arc::new(model),
        Arc::new(StaticCandles),
        ResponseValidator::new(ValidatorConfig::default()),
        TechnicalRuleFallback::with_defaults(),
    );

    let report = engine.run_cycle().await.unwrap();

    // The symbol still got a signal, but from the deterministic fallback
    assert_eq!(report.signals.len(), 1);
    assert_eq!(report.fallback_signals, 1);

    let state = manager.state_of("BTCUSDT").unwrap();
    assert_eq!(state.last_error_type, Some(FailureKind::Hallucination));
    assert!(metrics.snapshot().errors_by_type[&FailureKind::Hallucination] >= 1);
}

#[tokio::test]
async fn model_outage_degrades_to_fallbacks_without_errors() {
    let (manager, metrics) = ledger(CandidateConfig {
        base_delay_ms: 0,
        jitter_max_ms: 0,
        ..Default::default()
    })
    .await;

    let source = Arc::new(SlowPortfolio {
        calls: AtomicU32::new(0),
        delay: Duration::from_millis(1),
    });
    let coordinator = ReadinessCoordinator::new(quiet_readiness_config(), source);
    coordinator.dispatch(ReadinessEvent::Init);
    tokio::time::sleep(Duration::from_millis(50)).await;

    let engine = SignalEngine::new(
        CycleConfig {
            symbol_spacing_ms: 1,
            model_max_retries: 1,
            ..Default::default()
        },
        vec!["BTCUSDT".to_string(), "ETHUSDT".to_string()],
        coordinator,
        manager,
        metrics.clone(),
        Arc::new(FailingModel),
        Arc::new(StaticCandles),
        ResponseValidator::new(ValidatorConfig::default()),
        TechnicalRuleFallback::with_defaults(),
    );

    // The whole-model outage must not surface as an error
    let report = engine.run_cycle().await.unwrap();

    // Screening fell back to majors within the watchlist; every analyzed
    // symbol got a technical-fallback signal
    assert!(!report.screened.is_empty());
    assert_eq!(report.signals.len(), report.screened.len());
    assert_eq!(report.fallback_signals, report.signals.len());
    assert!(metrics.snapshot().fallbacks_used > 0);
    assert!(metrics.snapshot().errors_by_type[&FailureKind::ServerError] >= 1);
}

// ── Cycle timer ────────────────────────────────────────────────────

#[tokio::test]
async fn slowed_task_executes_at_most_once_per_base_interval() {
    let timers = CycleTimerService::new(TimerConfig {
        base_interval: Duration::from_millis(40),
        slow_threshold: Duration::from_millis(20),
        max_scale: 3.0,
    });

    let count = Arc::new(AtomicU32::new(0));
    let in_flight = Arc::new(AtomicBool::new(false));
    let overlapped = Arc::new(AtomicBool::new(false));

    let c = count.clone();
    let f = in_flight.clone();
    let o = overlapped.clone();
    timers.start("slow_cycle", || true, move || {
        let c = c.clone();
        let f = f.clone();
        let o = o.clone();
        async move {
            if f.swap(true, Ordering::SeqCst) {
                o.store(true, Ordering::SeqCst);
            }
            c.fetch_add(1, Ordering::SeqCst);
            // Artificially slow: longer than the base interval
            tokio::time::sleep(Duration::from_millis(100)).await;
            f.store(false, Ordering::SeqCst);
            Ok(())
        }
    });

    let window_ms = 560u64;
    tokio::time::sleep(Duration::from_millis(window_ms)).await;
    timers.stop("slow_cycle");

    assert!(!overlapped.load(Ordering::SeqCst), "executions overlapped");
    // With 100ms executions the wall-clock spacing can never beat one
    // execution per base interval
    let max_by_interval = (window_ms / 40) as u32;
    assert!(count.load(Ordering::SeqCst) <= max_by_interval);
    assert!(count.load(Ordering::SeqCst) >= 2);
}
