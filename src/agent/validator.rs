//! Multi-stage model response validation
//!
//! Turns free-form model output into structured screening results and trade
//! signals. Parsing walks an ordered fallback chain and stops at the first
//! stage that yields structured data; validated data must reference only
//! symbols present in the expected set, otherwise the response is rejected
//! as a hallucination no matter how well-formed it looks. Every failure
//! substitutes deterministic fallback data and says so via `used_fallback`.

use regex::Regex;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::config::ValidatorConfig;
use crate::domain::{ScreeningResult, SignalAction, TradeSignal};
use crate::error::FailureKind;

/// Major pairs preferred by the screening fallback
const MAJOR_PAIRS: [&str; 5] = ["BTCUSDT", "ETHUSDT", "BNBUSDT", "SOLUSDT", "XRPUSDT"];

/// Why a response was rejected
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationFailure {
    pub kind: FailureKind,
    pub detail: String,
}

impl ValidationFailure {
    fn malformed(detail: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::MalformedResponse,
            detail: detail.into(),
        }
    }

    fn hallucination(detail: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Hallucination,
            detail: detail.into(),
        }
    }
}

/// Result of validating one piece of model output. Never partially valid:
/// either `data` fully satisfies the schema and the expected set, or it is
/// substituted fallback data and `used_fallback` is true.
#[derive(Debug, Clone)]
pub struct ValidationOutcome<T> {
    pub is_valid: bool,
    pub data: T,
    pub error: Option<ValidationFailure>,
    pub used_fallback: bool,
}

impl<T> ValidationOutcome<T> {
    fn valid(data: T) -> Self {
        Self {
            is_valid: true,
            data,
            error: None,
            used_fallback: false,
        }
    }

    fn fallback(data: T, error: ValidationFailure) -> Self {
        Self {
            is_valid: false,
            data,
            error: Some(error),
            used_fallback: true,
        }
    }
}

#[derive(Debug, Deserialize)]
struct SignalJson {
    signal_type: Option<String>,
    confidence_score: Option<f64>,
    asset_pair: Option<String>,
    reasoning: Option<String>,
    position_size_pct: Option<f64>,
    stop_loss: Option<f64>,
    take_profit: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct ScreeningJson {
    symbols: Vec<String>,
}

/// Stateless validation pipeline for model output
pub struct ResponseValidator {
    config: ValidatorConfig,
    re_trailing_comma: Regex,
    re_signal_type: Regex,
    re_confidence: Regex,
    re_asset_pair: Regex,
    re_reasoning: Regex,
}

impl ResponseValidator {
    pub fn new(config: ValidatorConfig) -> Self {
        Self {
            config,
            re_trailing_comma: Regex::new(r",\s*([}\]])").expect("static regex"),
            re_signal_type: Regex::new(r#"(?i)"?signal_type"?\s*[:=]\s*"?([A-Za-z]+)"?"#)
                .expect("static regex"),
            re_confidence: Regex::new(
                r#"(?i)"?confidence_score"?\s*[:=]\s*"?([0-9]*\.?[0-9]+)"?"#,
            )
            .expect("static regex"),
            re_asset_pair: Regex::new(r#"(?i)"?asset_pair"?\s*[:=]\s*"?([A-Z0-9/]{3,20})"?"#)
                .expect("static regex"),
            re_reasoning: Regex::new(r#"(?i)"?reasoning"?\s*[:=]\s*"([^"]+)""#)
                .expect("static regex"),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(ValidatorConfig::default())
    }

    // ── Screening ──────────────────────────────────────────────────

    /// Validate a screening response against the symbols that were sent
    /// to the model.
    pub fn validate_screening(
        &self,
        raw: &str,
        expected: &[String],
    ) -> ValidationOutcome<ScreeningResult> {
        let parsed = match self.parse_stages(raw, false) {
            Some((value, stage)) => {
                debug!(stage, "screening response parsed");
                value
            }
            None => {
                return ValidationOutcome::fallback(
                    self.screening_fallback(expected),
                    ValidationFailure::malformed("no parseable structured data in response"),
                );
            }
        };

        let symbols = match Self::screening_symbols(&parsed) {
            Some(symbols) if !symbols.is_empty() => symbols,
            _ => {
                return ValidationOutcome::fallback(
                    self.screening_fallback(expected),
                    ValidationFailure::malformed("screening response missing symbol list"),
                );
            }
        };

        // Hallucination check runs over every referenced symbol, before
        // any truncation.
        let unknown: Vec<&String> = symbols.iter().filter(|s| !expected.contains(s)).collect();
        if !unknown.is_empty() {
            let detail = format!(
                "screening referenced symbols outside expected set: {:?}",
                unknown
            );
            warn!(%detail, "hallucinated screening response");
            return ValidationOutcome::fallback(
                self.screening_fallback(expected),
                ValidationFailure::hallucination(detail),
            );
        }

        let mut symbols = symbols;
        symbols.truncate(self.config.max_screening_symbols);
        ValidationOutcome::valid(ScreeningResult { symbols })
    }

    fn screening_symbols(value: &Value) -> Option<Vec<String>> {
        // Either {"symbols": [...]} or a bare array
        if let Ok(parsed) = serde_json::from_value::<ScreeningJson>(value.clone()) {
            return Some(parsed.symbols);
        }
        value.as_array().map(|items| {
            items
                .iter()
                .filter_map(|v| v.as_str().map(|s| s.to_string()))
                .collect()
        })
    }

    /// Deterministic screening substitute: the major pairs that are also
    /// in the expected set, else the first few expected symbols. Also used
    /// directly by callers when the model transport itself fails.
    pub fn screening_fallback(&self, expected: &[String]) -> ScreeningResult {
        let majors: Vec<String> = MAJOR_PAIRS
            .iter()
            .map(|s| s.to_string())
            .filter(|s| expected.contains(s))
            .collect();

        let symbols = if majors.is_empty() {
            expected
                .iter()
                .take(self.config.fallback_screening_len)
                .cloned()
                .collect()
        } else {
            majors
        };
        ScreeningResult { symbols }
    }

    // ── Detail signal ──────────────────────────────────────────────

    /// Validate a per-symbol detail signal response.
    ///
    /// `current_price` anchors the stop-loss sanity clamp; `expected` is the
    /// full symbol context of the call for hallucination detection.
    pub fn validate_signal(
        &self,
        raw: &str,
        symbol: &str,
        expected: &[String],
        current_price: Option<f64>,
    ) -> ValidationOutcome<TradeSignal> {
        let parsed = match self.parse_stages(raw, true) {
            Some((value, stage)) => {
                debug!(symbol, stage, "signal response parsed");
                value
            }
            None => {
                return ValidationOutcome::fallback(
                    self.signal_fallback(symbol, "model response had no parseable structure"),
                    ValidationFailure::malformed("no parseable structured data in response"),
                );
            }
        };

        let json: SignalJson = match serde_json::from_value(parsed) {
            Ok(json) => json,
            Err(e) => {
                return ValidationOutcome::fallback(
                    self.signal_fallback(symbol, "model response did not match signal schema"),
                    ValidationFailure::malformed(format!("signal schema mismatch: {}", e)),
                );
            }
        };

        // Required fields
        let Some(signal_type) = json.signal_type.as_deref() else {
            return ValidationOutcome::fallback(
                self.signal_fallback(symbol, "model response missing signal_type"),
                ValidationFailure::malformed("missing required field signal_type"),
            );
        };
        let Some(confidence) = json.confidence_score else {
            return ValidationOutcome::fallback(
                self.signal_fallback(symbol, "model response missing confidence_score"),
                ValidationFailure::malformed("missing required field confidence_score"),
            );
        };
        if !confidence.is_finite() {
            return ValidationOutcome::fallback(
                self.signal_fallback(symbol, "model reported non-finite confidence"),
                ValidationFailure::malformed("confidence_score is not a finite number"),
            );
        }

        // Hallucination: the referenced pair must be in the expected set
        let asset_pair = json.asset_pair.unwrap_or_else(|| symbol.to_string());
        if !expected.iter().any(|s| s == &asset_pair) {
            let detail = format!("signal referenced unknown symbol {}", asset_pair);
            warn!(symbol, %detail, "hallucinated signal response");
            return ValidationOutcome::fallback(
                self.signal_fallback(symbol, "model referenced a symbol outside this call's context"),
                ValidationFailure::hallucination(detail),
            );
        }

        // Sanitize: clamp fractions, rein in runaway stop-loss levels
        let action = SignalAction::from_str_loose(signal_type);
        let confidence = confidence.clamp(0.0, 1.0);
        let position_size = json.position_size_pct.unwrap_or(0.0).clamp(0.0, 1.0);
        let stop_loss = self.sanitize_stop_loss(json.stop_loss, current_price, action);

        ValidationOutcome::valid(TradeSignal {
            asset_pair,
            signal_type: action,
            confidence_score: confidence,
            position_size_pct: position_size,
            stop_loss,
            take_profit: json.take_profit.filter(|v| v.is_finite() && *v > 0.0),
            reasoning: json.reasoning.unwrap_or_default(),
        })
    }

    /// A stop more than `max_stop_distance` away from the current price is
    /// replaced with the safe default distance on the protective side.
    fn sanitize_stop_loss(
        &self,
        stop_loss: Option<f64>,
        current_price: Option<f64>,
        action: SignalAction,
    ) -> Option<f64> {
        let stop = stop_loss.filter(|v| v.is_finite() && *v > 0.0)?;
        let Some(price) = current_price.filter(|p| *p > 0.0) else {
            return Some(stop);
        };

        let distance = (stop - price).abs() / price;
        if distance <= self.config.max_stop_distance {
            return Some(stop);
        }

        let safe = match action {
            SignalAction::Sell => price * (1.0 + self.config.safe_stop_distance),
            _ => price * (1.0 - self.config.safe_stop_distance),
        };
        debug!(stop, price, safe, "stop-loss clamped to safe distance");
        Some(safe)
    }

    fn signal_fallback(&self, symbol: &str, why: &str) -> TradeSignal {
        TradeSignal::hold(symbol, 0.0, format!("fallback signal: {}", why))
    }

    // ── Parse chain ────────────────────────────────────────────────

    /// Ordered fallback chain; stops at the first stage yielding structured
    /// data. Stage 4 (loose field extraction) only applies to single-signal
    /// responses.
    fn parse_stages(&self, raw: &str, allow_field_extraction: bool) -> Option<(Value, u8)> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return None;
        }

        // Stage 1: the entire text is structured data
        if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
            if value.is_object() || value.is_array() {
                return Some((value, 1));
            }
        }

        // Stage 2: fenced code block
        if let Some(block) = Self::extract_fenced_block(trimmed) {
            if let Ok(value) = serde_json::from_str::<Value>(&block) {
                if value.is_object() || value.is_array() {
                    return Some((value, 2));
                }
            }
        }

        // Stage 3: largest brace-delimited substring, cleaned up
        if let Some(candidate) = Self::extract_braced(trimmed) {
            let cleaned = self.clean_json_candidate(&candidate);
            if let Ok(value) = serde_json::from_str::<Value>(&cleaned) {
                if value.is_object() || value.is_array() {
                    return Some((value, 3));
                }
            }
        }

        // Stage 4: loose per-field extraction from unstructured text
        if allow_field_extraction {
            if let Some(value) = self.extract_fields(trimmed) {
                return Some((value, 4));
            }
        }

        None
    }

    fn extract_fenced_block(text: &str) -> Option<String> {
        if let Some(start) = text.find("```json") {
            let after = &text[start + 7..];
            if let Some(end) = after.find("```") {
                return Some(after[..end].trim().to_string());
            }
        }
        if let Some(start) = text.find("```") {
            let after = &text[start + 3..];
            if let Some(end) = after.find("```") {
                let block = after[..end].trim();
                if block.starts_with('{') || block.starts_with('[') {
                    return Some(block.to_string());
                }
            }
        }
        None
    }

    fn extract_braced(text: &str) -> Option<String> {
        let object = text
            .find('{')
            .zip(text.rfind('}'))
            .filter(|(start, end)| end > start)
            .map(|(start, end)| text[start..=end].to_string());
        if object.is_some() {
            return object;
        }
        text.find('[')
            .zip(text.rfind(']'))
            .filter(|(start, end)| end > start)
            .map(|(start, end)| text[start..=end].to_string())
    }

    fn clean_json_candidate(&self, candidate: &str) -> String {
        let no_controls: String = candidate.chars().filter(|c| !c.is_control()).collect();
        self.re_trailing_comma.replace_all(&no_controls, "$1").into_owned()
    }

    /// Pull known field names out of unstructured text; succeeds only when
    /// at least two fields are found.
    fn extract_fields(&self, text: &str) -> Option<Value> {
        let mut map = serde_json::Map::new();
        let mut found = 0;

        if let Some(caps) = self.re_signal_type.captures(text) {
            map.insert("signal_type".into(), Value::String(caps[1].to_string()));
            found += 1;
        }
        if let Some(caps) = self.re_confidence.captures(text) {
            if let Ok(v) = caps[1].parse::<f64>() {
                if let Some(n) = serde_json::Number::from_f64(v) {
                    map.insert("confidence_score".into(), Value::Number(n));
                    found += 1;
                }
            }
        }
        if let Some(caps) = self.re_asset_pair.captures(text) {
            map.insert("asset_pair".into(), Value::String(caps[1].to_string()));
            found += 1;
        }
        if let Some(caps) = self.re_reasoning.captures(text) {
            map.insert("reasoning".into(), Value::String(caps[1].to_string()));
            found += 1;
        }

        if found >= 2 {
            Some(Value::Object(map))
        } else {
            None
        }
    }
}

impl Default for ResponseValidator {
    fn default() -> Self {
        Self::with_defaults()
    }
}
