use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::path::Path;

/// Main configuration structure
#[derive(Debug, Clone, Deserialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub readiness: ReadinessConfig,
    #[serde(default)]
    pub candidates: CandidateConfig,
    #[serde(default)]
    pub validator: ValidatorConfig,
    #[serde(default)]
    pub technical: TechnicalConfig,
    #[serde(default)]
    pub cycle: CycleConfig,
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub persistence: PersistenceConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Readiness coordinator tuning
#[derive(Debug, Clone, Deserialize)]
pub struct ReadinessConfig {
    /// Maximum snapshot age before AGE_EXCEEDED fires (seconds)
    #[serde(default = "default_snapshot_ttl")]
    pub snapshot_ttl_secs: u64,
    /// Proactive refresh interval, below the TTL (seconds)
    #[serde(default = "default_refresh_interval")]
    pub refresh_interval_secs: u64,
    /// Health ping interval while simulation runs (seconds)
    #[serde(default = "default_ping_interval")]
    pub ping_interval_secs: u64,
    /// Watchdog check interval while simulation runs (seconds)
    #[serde(default = "default_watchdog_interval")]
    pub watchdog_interval_secs: u64,
    /// Safety margin before TTL at which the watchdog forces a refresh (seconds)
    #[serde(default = "default_watchdog_margin")]
    pub watchdog_margin_secs: u64,
    /// Maximum fetch retry attempts before staying Unstable
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Base retry delay (milliseconds)
    #[serde(default = "default_retry_base_ms")]
    pub retry_base_ms: u64,
    /// Retry delay cap (milliseconds)
    #[serde(default = "default_retry_cap_ms")]
    pub retry_cap_ms: u64,
}

fn default_snapshot_ttl() -> u64 {
    300
}
fn default_refresh_interval() -> u64 {
    120
}
fn default_ping_interval() -> u64 {
    60
}
fn default_watchdog_interval() -> u64 {
    30
}
fn default_watchdog_margin() -> u64 {
    60
}
fn default_max_retries() -> u32 {
    5
}
fn default_retry_base_ms() -> u64 {
    2000
}
fn default_retry_cap_ms() -> u64 {
    30000
}

impl Default for ReadinessConfig {
    fn default() -> Self {
        Self {
            snapshot_ttl_secs: default_snapshot_ttl(),
            refresh_interval_secs: default_refresh_interval(),
            ping_interval_secs: default_ping_interval(),
            watchdog_interval_secs: default_watchdog_interval(),
            watchdog_margin_secs: default_watchdog_margin(),
            max_retries: default_max_retries(),
            retry_base_ms: default_retry_base_ms(),
            retry_cap_ms: default_retry_cap_ms(),
        }
    }
}

/// Per-symbol error ledger tuning
#[derive(Debug, Clone, Deserialize)]
pub struct CandidateConfig {
    /// Base backoff delay between retries for a failing symbol (milliseconds)
    #[serde(default = "default_candidate_base_ms")]
    pub base_delay_ms: u64,
    /// Backoff cap (milliseconds)
    #[serde(default = "default_candidate_cap_ms")]
    pub cap_delay_ms: u64,
    /// Maximum jitter added to each backoff (milliseconds)
    #[serde(default = "default_candidate_jitter_ms")]
    pub jitter_max_ms: u64,
    /// Consecutive errors before a symbol is blacklisted
    #[serde(default = "default_blacklist_threshold")]
    pub blacklist_threshold: u32,
    /// Blacklist duration (seconds)
    #[serde(default = "default_blacklist_secs")]
    pub blacklist_duration_secs: u64,
    /// Expired-blacklist sweep interval (seconds)
    #[serde(default = "default_sweep_secs")]
    pub sweep_interval_secs: u64,
}

fn default_candidate_base_ms() -> u64 {
    2000
}
fn default_candidate_cap_ms() -> u64 {
    30000
}
fn default_candidate_jitter_ms() -> u64 {
    500
}
fn default_blacklist_threshold() -> u32 {
    3
}
fn default_blacklist_secs() -> u64 {
    1800
}
fn default_sweep_secs() -> u64 {
    300
}

impl Default for CandidateConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: default_candidate_base_ms(),
            cap_delay_ms: default_candidate_cap_ms(),
            jitter_max_ms: default_candidate_jitter_ms(),
            blacklist_threshold: default_blacklist_threshold(),
            blacklist_duration_secs: default_blacklist_secs(),
            sweep_interval_secs: default_sweep_secs(),
        }
    }
}

/// Response validator tuning
#[derive(Debug, Clone, Deserialize)]
pub struct ValidatorConfig {
    /// Maximum symbols accepted from a screening response
    #[serde(default = "default_max_screening")]
    pub max_screening_symbols: usize,
    /// Symbols returned by the screening fallback when none of the
    /// major pairs are in the expected set
    #[serde(default = "default_fallback_len")]
    pub fallback_screening_len: usize,
    /// Maximum stop-loss distance from parity before clamping (fraction)
    #[serde(default = "default_max_stop_distance")]
    pub max_stop_distance: f64,
    /// Stop-loss distance substituted when clamping (fraction)
    #[serde(default = "default_safe_stop_distance")]
    pub safe_stop_distance: f64,
}

fn default_max_screening() -> usize {
    10
}
fn default_fallback_len() -> usize {
    3
}
fn default_max_stop_distance() -> f64 {
    0.10
}
fn default_safe_stop_distance() -> f64 {
    0.05
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        Self {
            max_screening_symbols: default_max_screening(),
            fallback_screening_len: default_fallback_len(),
            max_stop_distance: default_max_stop_distance(),
            safe_stop_distance: default_safe_stop_distance(),
        }
    }
}

/// Technical-rule fallback tuning
#[derive(Debug, Clone, Deserialize)]
pub struct TechnicalConfig {
    /// Minimum summed vote weight for a direction to win
    #[serde(default = "default_activation_threshold")]
    pub activation_threshold: f64,
    /// Confidence ceiling for rule-based signals (below the model path)
    #[serde(default = "default_confidence_cap")]
    pub confidence_cap: f64,
    /// Stop-loss offset from current price (fraction)
    #[serde(default = "default_stop_loss_pct")]
    pub stop_loss_pct: f64,
    /// Take-profit offset from current price (fraction)
    #[serde(default = "default_take_profit_pct")]
    pub take_profit_pct: f64,
}

fn default_activation_threshold() -> f64 {
    1.0
}
fn default_confidence_cap() -> f64 {
    0.7
}
fn default_stop_loss_pct() -> f64 {
    0.05
}
fn default_take_profit_pct() -> f64 {
    0.10
}

impl Default for TechnicalConfig {
    fn default() -> Self {
        Self {
            activation_threshold: default_activation_threshold(),
            confidence_cap: default_confidence_cap(),
            stop_loss_pct: default_stop_loss_pct(),
            take_profit_pct: default_take_profit_pct(),
        }
    }
}

/// Cycle timer and generation-cycle tuning
#[derive(Debug, Clone, Deserialize)]
pub struct CycleConfig {
    /// Base interval between generation cycles (seconds)
    #[serde(default = "default_base_interval")]
    pub base_interval_secs: u64,
    /// Average execution duration above which the interval scales up (seconds)
    #[serde(default = "default_slow_threshold")]
    pub slow_threshold_secs: u64,
    /// Maximum interval scale factor under load
    #[serde(default = "default_max_scale")]
    pub max_interval_scale: f64,
    /// Fixed delay between per-symbol model calls (milliseconds)
    #[serde(default = "default_symbol_spacing_ms")]
    pub symbol_spacing_ms: u64,
    /// Model retries per symbol before the technical fallback takes over
    #[serde(default = "default_model_retries")]
    pub model_max_retries: u32,
}

fn default_base_interval() -> u64 {
    30
}
fn default_slow_threshold() -> u64 {
    10
}
fn default_max_scale() -> f64 {
    3.0
}
fn default_symbol_spacing_ms() -> u64 {
    1500
}
fn default_model_retries() -> u32 {
    2
}

impl Default for CycleConfig {
    fn default() -> Self {
        Self {
            base_interval_secs: default_base_interval(),
            slow_threshold_secs: default_slow_threshold(),
            max_interval_scale: default_max_scale(),
            symbol_spacing_ms: default_symbol_spacing_ms(),
            model_max_retries: default_model_retries(),
        }
    }
}

/// Remote model API configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ModelConfig {
    /// API key; empty means unconfigured
    #[serde(default)]
    pub api_key: String,
    /// API base URL
    #[serde(default = "default_model_url")]
    pub base_url: String,
    /// Model identifier
    #[serde(default = "default_model_name")]
    pub model: String,
    /// Request timeout for screening and detail calls (seconds)
    #[serde(default = "default_model_timeout")]
    pub timeout_secs: u64,
}

fn default_model_url() -> String {
    "https://api.openai.com/v1".to_string()
}
fn default_model_name() -> String {
    "gpt-4o-mini".to_string()
}
fn default_model_timeout() -> u64 {
    30
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            base_url: default_model_url(),
            model: default_model_name(),
            timeout_secs: default_model_timeout(),
        }
    }
}

impl ModelConfig {
    pub fn is_configured(&self) -> bool {
        !self.api_key.is_empty()
    }
}

/// Durable state storage location
#[derive(Debug, Clone, Deserialize)]
pub struct PersistenceConfig {
    /// Directory for JSON state files
    #[serde(default = "default_state_dir")]
    pub state_dir: String,
}

fn default_state_dir() -> String {
    "state".to_string()
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            state_dir: default_state_dir(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level filter (overridden by RUST_LOG)
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Optional directory for rolling file logs
    #[serde(default)]
    pub dir: Option<String>,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            dir: None,
        }
    }
}

impl AppConfig {
    /// Load configuration from an optional TOML file layered with
    /// `VIGIL_`-prefixed environment variables.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder = Config::builder();

        if let Some(path) = path {
            builder = builder.add_source(File::from(path));
        } else if Path::new("vigil.toml").exists() {
            builder = builder.add_source(File::with_name("vigil"));
        }

        builder = builder.add_source(
            Environment::with_prefix("VIGIL")
                .separator("__")
                .try_parsing(true),
        );

        builder.build()?.try_deserialize()
    }
}
