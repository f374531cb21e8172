//! Signal generation cycle
//!
//! One cycle: consult the readiness coordinator for a trusted snapshot,
//! screen the watchlist through the model, then analyze each candidate
//! symbol strictly sequentially with a fixed delay between model calls.
//! The sequencing is a deliberate throttle against the exchange rate limit.
//!
//! Model-side failures never escape: every symbol ends the cycle with a
//! valid signal or a deterministic fallback, and every outcome lands in the
//! per-symbol ledger and the global health metrics. Only configuration
//! errors (missing API key) are fatal to a call.

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::agent::{ModelClient, ResponseValidator};
use crate::config::CycleConfig;
use crate::domain::{Candle, CandleInterval, TradeSignal};
use crate::error::{FailureKind, Result, VigilError};
use crate::exchange::CandleSource;
use crate::health::{CandidateErrorManager, MetricsRegistry};
use crate::readiness::ReadinessCoordinator;
use crate::strategy::TechnicalRuleFallback;

const CANDLE_LIMIT: usize = 60;
const CANDLE_INTERVAL: CandleInterval = CandleInterval::FifteenMinutes;
const MODEL_CALL_TIMEOUT_SECS: u64 = 30;

/// Outcome summary of one generation cycle
#[derive(Debug, Default)]
pub struct CycleReport {
    /// Cycle skipped because no trusted snapshot was available
    pub skipped_not_ready: bool,
    /// Symbols selected by screening
    pub screened: Vec<String>,
    /// Symbols skipped by the candidate ledger (blacklist or cooldown)
    pub skipped_symbols: Vec<String>,
    /// Signals produced, one per analyzed symbol
    pub signals: Vec<TradeSignal>,
    /// How many signals came from a fallback path
    pub fallback_signals: usize,
}

/// Drives the per-cycle signal generation pipeline
pub struct SignalEngine {
    config: CycleConfig,
    watchlist: Vec<String>,
    coordinator: Arc<ReadinessCoordinator>,
    errors: Arc<CandidateErrorManager>,
    metrics: Arc<MetricsRegistry>,
    model: Arc<dyn ModelClient>,
    candles: Arc<dyn CandleSource>,
    validator: ResponseValidator,
    technical: TechnicalRuleFallback,
}

impl SignalEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: CycleConfig,
        watchlist: Vec<String>,
        coordinator: Arc<ReadinessCoordinator>,
        errors: Arc<CandidateErrorManager>,
        metrics: Arc<MetricsRegistry>,
        model: Arc<dyn ModelClient>,
        candles: Arc<dyn CandleSource>,
        validator: ResponseValidator,
        technical: TechnicalRuleFallback,
    ) -> Self {
        Self {
            config,
            watchlist,
            coordinator,
            errors,
            metrics,
            model,
            candles,
            validator,
            technical,
        }
    }

    /// Run one full generation cycle.
    pub async fn run_cycle(&self) -> Result<CycleReport> {
        let mut report = CycleReport::default();

        let Some(snapshot) = self.coordinator.trusted_snapshot() else {
            debug!(state = %self.coordinator.state(), "cycle skipped, snapshot not trusted");
            report.skipped_not_ready = true;
            return Ok(report);
        };
        debug!(
            total_value = %snapshot.total_value,
            age_secs = snapshot.age().num_seconds(),
            "cycle starting with trusted snapshot"
        );

        let screening = self.screen_candidates().await?;
        report.screened = screening.clone();

        let mut first = true;
        for symbol in &screening {
            // Rate-limit spacing between per-symbol model calls
            if !first {
                tokio::time::sleep(Duration::from_millis(self.config.symbol_spacing_ms)).await;
            }
            first = false;

            if !self.errors.can_retry(symbol) {
                debug!(
                    symbol,
                    blacklisted = self.errors.is_blacklisted(symbol),
                    "symbol skipped by candidate ledger"
                );
                report.skipped_symbols.push(symbol.clone());
                continue;
            }

            let (signal, used_fallback) = self.generate_detailed_signal(symbol, &screening).await?;
            if used_fallback {
                report.fallback_signals += 1;
            }
            report.signals.push(signal);
        }

        if let Err(e) = self.metrics.persist().await {
            warn!(error = %e, "health metrics persist failed");
        }

        info!(
            screened = report.screened.len(),
            skipped = report.skipped_symbols.len(),
            signals = report.signals.len(),
            fallbacks = report.fallback_signals,
            "cycle complete"
        );
        Ok(report)
    }

    /// Screen the watchlist down to candidate symbols. Transport failures
    /// degrade to the deterministic screening fallback.
    async fn screen_candidates(&self) -> Result<Vec<String>> {
        let prompt = self.screening_prompt();

        let outcome = match self.send_with_timeout(&prompt).await {
            Ok(raw) => self.validator.validate_screening(&raw, &self.watchlist),
            Err(e @ VigilError::MissingConfig(_)) => return Err(e),
            Err(e) => {
                let kind = FailureKind::from_error(&e);
                warn!(error = %e, kind = %kind, "screening call failed, using fallback list");
                self.metrics.record_error(kind);
                self.metrics.record_fallback();
                return Ok(self.validator.screening_fallback(&self.watchlist).symbols);
            }
        };

        if outcome.used_fallback {
            self.metrics.record_fallback();
            if let Some(failure) = &outcome.error {
                self.metrics.record_error(failure.kind);
            }
        } else {
            self.metrics.record_success();
        }
        Ok(outcome.data.symbols)
    }

    /// Analyze one symbol: model with retries, then the technical-rule
    /// fallback once retries are exhausted. Returns the signal and whether
    /// it came from a fallback path. Errors escape only for configuration
    /// problems.
    pub async fn generate_detailed_signal(
        &self,
        symbol: &str,
        expected: &[String],
    ) -> Result<(TradeSignal, bool)> {
        let candles = match self.candles.history(symbol, CANDLE_INTERVAL, CANDLE_LIMIT).await {
            Ok(candles) => candles,
            Err(e) => {
                let kind = FailureKind::from_error(&e);
                warn!(symbol, error = %e, "candle history unavailable");
                self.errors.record_error(symbol, kind).await;
                self.metrics.record_fallback();
                return Ok((self.technical.generate(symbol, &[]), true));
            }
        };
        let current_price = candles.last().map(|c| c.close);

        let mut attempts = 0u32;
        loop {
            let prompt = self.detail_prompt(symbol, &candles);
            match self.send_with_timeout(&prompt).await {
                Ok(raw) => {
                    let outcome =
                        self.validator
                            .validate_signal(&raw, symbol, expected, current_price);
                    if outcome.is_valid {
                        // The ledger also feeds the global success counter
                        self.errors.record_success(symbol).await;
                        return Ok((outcome.data, false));
                    }

                    let failure = outcome
                        .error
                        .expect("invalid outcome always carries an error");
                    let newly_blacklisted =
                        self.errors.record_error(symbol, failure.kind).await;
                    if newly_blacklisted {
                        warn!(symbol, "symbol blacklisted during cycle");
                    }
                    debug!(symbol, attempts, kind = %failure.kind, detail = %failure.detail, "invalid model response");
                }
                Err(e @ VigilError::MissingConfig(_)) => return Err(e),
                Err(e) => {
                    let kind = FailureKind::from_error(&e);
                    self.errors.record_error(symbol, kind).await;
                    debug!(symbol, attempts, error = %e, "model call failed");
                }
            }

            attempts += 1;
            if attempts > self.config.model_max_retries {
                break;
            }
        }

        // Model path exhausted entirely: deterministic technical rules
        info!(symbol, attempts, "model retries exhausted, using technical fallback");
        self.metrics.record_fallback();
        Ok((self.technical.generate(symbol, &candles), true))
    }

    /// Race the model call against the fixed call timeout; the abandoned
    /// request may keep running upstream (accepted bounded leak).
    async fn send_with_timeout(&self, prompt: &str) -> Result<String> {
        let timeout = Duration::from_secs(MODEL_CALL_TIMEOUT_SECS);
        match tokio::time::timeout(timeout, self.model.send(prompt)).await {
            Ok(result) => result,
            Err(_) => Err(VigilError::Timeout(timeout.as_secs())),
        }
    }

    fn screening_prompt(&self) -> String {
        format!(
            "Screen the following symbols for trading opportunities and return JSON \
             {{\"symbols\": [...]}} with the most promising candidates: {}",
            self.watchlist.join(", ")
        )
    }

    fn detail_prompt(&self, symbol: &str, candles: &[Candle]) -> String {
        let closes: Vec<String> = candles
            .iter()
            .rev()
            .take(20)
            .rev()
            .map(|c| format!("{:.4}", c.close))
            .collect();
        format!(
            "Analyze {} given recent closes [{}] and return JSON with signal_type, \
             confidence_score, asset_pair, position_size_pct, stop_loss, take_profit, reasoning.",
            symbol,
            closes.join(", ")
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CandidateConfig, ReadinessConfig, ValidatorConfig};
    use crate::domain::ReadinessEvent;
    use crate::exchange::traits::test_support::{CountingPortfolioSource, FixedCandleSource};
    use crate::persistence::{MemoryStore, StateStore};
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Replays a scripted sequence of responses, then repeats the last one
    struct ScriptedModel {
        responses: Mutex<Vec<Result<String>>>,
    }

    impl ScriptedModel {
        fn new(responses: Vec<Result<String>>) -> Self {
            Self {
                responses: Mutex::new(responses),
            }
        }
    }

    #[async_trait]
    impl ModelClient for ScriptedModel {
        async fn send(&self, _prompt: &str) -> Result<String> {
            let mut responses = self.responses.lock().unwrap();
            if responses.len() > 1 {
                responses.remove(0)
            } else {
                match responses.first() {
                    Some(Ok(s)) => Ok(s.clone()),
                    Some(Err(_)) => Err(VigilError::Server("scripted failure".into())),
                    None => Err(VigilError::Server("script exhausted".into())),
                }
            }
        }
    }

    fn candles() -> Vec<Candle> {
        (0..60)
            .map(|i| Candle::new(100.0, 101.0, 99.0, 100.0 + i as f64 * 0.1, 1000.0))
            .collect()
    }

    async fn build_engine(model: ScriptedModel, watchlist: Vec<String>) -> SignalEngine {
        let store: Arc<dyn StateStore> = Arc::new(MemoryStore::new());
        let metrics = Arc::new(crate::health::MetricsRegistry::load(store.clone()).await);
        let errors = Arc::new(
            CandidateErrorManager::load(
                CandidateConfig {
                    jitter_max_ms: 0,
                    base_delay_ms: 0,
                    ..Default::default()
                },
                store,
                metrics.clone(),
            )
            .await,
        );

        let source = Arc::new(CountingPortfolioSource::new());
        let coordinator = ReadinessCoordinator::new(
            ReadinessConfig {
                refresh_interval_secs: 3600,
                ping_interval_secs: 3600,
                watchdog_interval_secs: 3600,
                ..Default::default()
            },
            source,
        );
        coordinator.dispatch(ReadinessEvent::Init);
        tokio::time::sleep(Duration::from_millis(30)).await;

        SignalEngine::new(
            CycleConfig {
                symbol_spacing_ms: 1,
                model_max_retries: 1,
                ..Default::default()
            },
            watchlist,
            coordinator,
            errors,
            metrics,
            Arc::new(model),
            Arc::new(FixedCandleSource { candles: candles() }),
            ResponseValidator::new(ValidatorConfig::default()),
            TechnicalRuleFallback::with_defaults(),
        )
    }

    fn screening_ok() -> Result<String> {
        Ok(r#"{"symbols": ["BTCUSDT"]}"#.to_string())
    }

    fn signal_ok() -> Result<String> {
        Ok(r#"{"signal_type":"BUY","confidence_score":0.8,"asset_pair":"BTCUSDT","position_size_pct":0.2,"reasoning":"test"}"#.to_string())
    }

    #[tokio::test]
    async fn cycle_skipped_when_not_ready() {
        let engine = build_engine(
            ScriptedModel::new(vec![screening_ok()]),
            vec!["BTCUSDT".to_string()],
        )
        .await;
        // Force the coordinator out of its trusted state
        engine.coordinator.dispatch(ReadinessEvent::ApiDown {
            reason: "test outage".into(),
        });

        let report = engine.run_cycle().await.unwrap();
        assert!(report.skipped_not_ready);
        assert!(report.signals.is_empty());
    }

    #[tokio::test]
    async fn valid_model_responses_produce_signals() {
        let engine = build_engine(
            ScriptedModel::new(vec![screening_ok(), signal_ok()]),
            vec!["BTCUSDT".to_string(), "ETHUSDT".to_string()],
        )
        .await;

        let report = engine.run_cycle().await.unwrap();
        assert!(!report.skipped_not_ready);
        assert_eq!(report.screened, vec!["BTCUSDT".to_string()]);
        assert_eq!(report.signals.len(), 1);
        assert_eq!(report.fallback_signals, 0);
        assert_eq!(report.signals[0].signal_type, crate::domain::SignalAction::Buy);

        // Ledger recorded the success
        let state = engine.errors.state_of("BTCUSDT").unwrap();
        assert_eq!(state.successful_calls, 1);
    }

    #[tokio::test]
    async fn hallucinated_responses_exhaust_into_technical_fallback() {
        let hallucinated = Ok(
            r#"{"signal_type":"BUY","confidence_score":0.9,"asset_pair":"FAKEUSDT"}"#.to_string(),
        );
        let engine = build_engine(
            ScriptedModel::new(vec![screening_ok(), hallucinated]),
            vec!["BTCUSDT".to_string()],
        )
        .await;

        let report = engine.run_cycle().await.unwrap();
        assert_eq!(report.signals.len(), 1);
        assert_eq!(report.fallback_signals, 1);

        // Both attempts recorded as hallucinations
        let state = engine.errors.state_of("BTCUSDT").unwrap();
        assert_eq!(state.consecutive_errors, 2);
        assert_eq!(state.last_error_type, Some(FailureKind::Hallucination));

        let metrics = engine.metrics.snapshot();
        assert_eq!(metrics.fallbacks_used, 1);
        assert_eq!(metrics.errors_by_type[&FailureKind::Hallucination], 2);
    }

    #[tokio::test]
    async fn blacklisted_symbol_is_skipped() {
        let engine = build_engine(
            ScriptedModel::new(vec![screening_ok(), signal_ok()]),
            vec!["BTCUSDT".to_string()],
        )
        .await;

        for _ in 0..3 {
            engine.errors.record_error("BTCUSDT", FailureKind::Timeout).await;
        }
        assert!(engine.errors.is_blacklisted("BTCUSDT"));

        let report = engine.run_cycle().await.unwrap();
        assert_eq!(report.skipped_symbols, vec!["BTCUSDT".to_string()]);
        assert!(report.signals.is_empty());
    }

    #[tokio::test]
    async fn missing_api_key_is_fatal_to_the_call() {
        struct Unconfigured;

        #[async_trait]
        impl ModelClient for Unconfigured {
            async fn send(&self, _prompt: &str) -> Result<String> {
                Err(VigilError::MissingConfig("model API key not set".into()))
            }
        }

        let store: Arc<dyn StateStore> = Arc::new(MemoryStore::new());
        let metrics = Arc::new(crate::health::MetricsRegistry::load(store.clone()).await);
        let errors = Arc::new(
            CandidateErrorManager::load(CandidateConfig::default(), store, metrics.clone()).await,
        );
        let source = Arc::new(CountingPortfolioSource::new());
        let coordinator = ReadinessCoordinator::new(ReadinessConfig::default(), source);
        coordinator.dispatch(ReadinessEvent::Init);
        tokio::time::sleep(Duration::from_millis(30)).await;

        let engine = SignalEngine::new(
            CycleConfig::default(),
            vec!["BTCUSDT".to_string()],
            coordinator,
            errors,
            metrics,
            Arc::new(Unconfigured),
            Arc::new(FixedCandleSource { candles: candles() }),
            ResponseValidator::with_defaults(),
            TechnicalRuleFallback::with_defaults(),
        );

        let err = engine.run_cycle().await.unwrap_err();
        assert!(matches!(err, VigilError::MissingConfig(_)));
    }
}
