//! Deterministic technical-rule fallback signals
//!
//! Used when the model path has exhausted its retries. Each indicator
//! contributes a weighted vote toward BUY/SELL/HOLD; the direction whose
//! summed weight clears the activation threshold wins. Confidence is
//! deliberately capped below what the model path can report. This path
//! never errors: any internal failure produces a maximally conservative
//! HOLD instead.

use tracing::debug;

use crate::config::TechnicalConfig;
use crate::domain::{Candle, SignalAction, TradeSignal};

const RSI_PERIOD: usize = 14;
const MACD_FAST: usize = 12;
const MACD_SLOW: usize = 26;
const MACD_SIGNAL: usize = 9;
const SMA_SHORT: usize = 10;
const SMA_LONG: usize = 30;
const VOLUME_LOOKBACK: usize = 5;

const WEIGHT_RSI: f64 = 0.8;
const WEIGHT_TREND: f64 = 0.7;
const WEIGHT_MACD: f64 = 0.6;
const WEIGHT_VOLUME: f64 = 0.4;

/// Rule-based signal generator from candle history
pub struct TechnicalRuleFallback {
    config: TechnicalConfig,
}

/// Precomputed indicator inputs for the vote
#[derive(Debug, Clone, Copy)]
pub struct IndicatorSet {
    pub price: f64,
    pub rsi: f64,
    pub macd_histogram: f64,
    pub sma_short: f64,
    pub sma_long: f64,
    pub volume_ratio: f64,
}

impl TechnicalRuleFallback {
    pub fn new(config: TechnicalConfig) -> Self {
        Self { config }
    }

    pub fn with_defaults() -> Self {
        Self::new(TechnicalConfig::default())
    }

    /// Generate a signal from candle history. Never fails; insufficient
    /// history yields a conservative HOLD.
    pub fn generate(&self, symbol: &str, candles: &[Candle]) -> TradeSignal {
        match self.compute_indicators(candles) {
            Some(indicators) => self.decide(symbol, indicators),
            None => {
                debug!(symbol, len = candles.len(), "insufficient candle history for indicators");
                TradeSignal::hold(
                    symbol,
                    0.1,
                    "technical fallback: insufficient candle history, holding",
                )
            }
        }
    }

    /// Weighted vote over precomputed indicators.
    pub fn decide(&self, symbol: &str, ind: IndicatorSet) -> TradeSignal {
        let mut buy_weight = 0.0;
        let mut sell_weight = 0.0;
        let mut reasons: Vec<String> = Vec::new();

        if ind.rsi < 30.0 {
            buy_weight += WEIGHT_RSI;
            reasons.push(format!("RSI {:.1} oversold", ind.rsi));
        } else if ind.rsi > 70.0 {
            sell_weight += WEIGHT_RSI;
            reasons.push(format!("RSI {:.1} overbought", ind.rsi));
        }

        if ind.price > ind.sma_short && ind.price > ind.sma_long {
            buy_weight += WEIGHT_TREND;
            reasons.push("price above short and long moving averages".to_string());
        } else if ind.price < ind.sma_short && ind.price < ind.sma_long {
            sell_weight += WEIGHT_TREND;
            reasons.push("price below short and long moving averages".to_string());
        }

        if ind.macd_histogram > 0.0 {
            buy_weight += WEIGHT_MACD;
            reasons.push("MACD histogram positive".to_string());
        } else if ind.macd_histogram < 0.0 {
            sell_weight += WEIGHT_MACD;
            reasons.push("MACD histogram negative".to_string());
        }

        // Volume surge confirms whichever direction currently leads
        if ind.volume_ratio >= 1.5 && buy_weight != sell_weight {
            if buy_weight > sell_weight {
                buy_weight += WEIGHT_VOLUME;
            } else {
                sell_weight += WEIGHT_VOLUME;
            }
            reasons.push(format!("volume {:.1}x recent average", ind.volume_ratio));
        }

        let threshold = self.config.activation_threshold;
        let (action, winning_weight) = if buy_weight > sell_weight && buy_weight > threshold {
            (SignalAction::Buy, buy_weight)
        } else if sell_weight > buy_weight && sell_weight > threshold {
            (SignalAction::Sell, sell_weight)
        } else {
            let reason = if reasons.is_empty() {
                "technical fallback: no indicator consensus".to_string()
            } else {
                format!("technical fallback: no consensus ({})", reasons.join("; "))
            };
            return TradeSignal::hold(symbol, 0.2, reason);
        };

        let confidence =
            (0.3 + 0.2 * (winning_weight - threshold)).min(self.config.confidence_cap);

        let (stop_loss, take_profit) = match action {
            SignalAction::Buy => (
                ind.price * (1.0 - self.config.stop_loss_pct),
                ind.price * (1.0 + self.config.take_profit_pct),
            ),
            _ => (
                ind.price * (1.0 + self.config.stop_loss_pct),
                ind.price * (1.0 - self.config.take_profit_pct),
            ),
        };

        TradeSignal {
            asset_pair: symbol.to_string(),
            signal_type: action,
            confidence_score: confidence,
            position_size_pct: 0.1,
            stop_loss: Some(stop_loss),
            take_profit: Some(take_profit),
            reasoning: format!("technical fallback: {}", reasons.join("; ")),
        }
    }

    fn compute_indicators(&self, candles: &[Candle]) -> Option<IndicatorSet> {
        let closes: Vec<f64> = candles.iter().map(|c| c.close).collect();
        let volumes: Vec<f64> = candles.iter().map(|c| c.volume).collect();

        let price = *closes.last()?;
        let rsi = rsi(&closes, RSI_PERIOD)?;
        let macd_histogram = macd_histogram(&closes)?;
        let sma_short = sma(&closes, SMA_SHORT)?;
        let sma_long = sma(&closes, SMA_LONG)?;
        let volume_ratio = volume_ratio(&volumes, VOLUME_LOOKBACK)?;

        Some(IndicatorSet {
            price,
            rsi,
            macd_histogram,
            sma_short,
            sma_long,
            volume_ratio,
        })
    }
}

impl Default for TechnicalRuleFallback {
    fn default() -> Self {
        Self::with_defaults()
    }
}

// ── Indicator math ─────────────────────────────────────────────────

/// Simple moving average over the last `period` values
fn sma(values: &[f64], period: usize) -> Option<f64> {
    if period == 0 || values.len() < period {
        return None;
    }
    let tail = &values[values.len() - period..];
    Some(tail.iter().sum::<f64>() / period as f64)
}

/// Exponential moving average series seeded with the SMA of the first
/// `period` values
fn ema_series(values: &[f64], period: usize) -> Option<Vec<f64>> {
    if period == 0 || values.len() < period {
        return None;
    }
    let k = 2.0 / (period as f64 + 1.0);
    let seed = values[..period].iter().sum::<f64>() / period as f64;

    let mut series = Vec::with_capacity(values.len() - period + 1);
    series.push(seed);
    let mut prev = seed;
    for v in &values[period..] {
        prev = v * k + prev * (1.0 - k);
        series.push(prev);
    }
    Some(series)
}

/// RSI over the last `period` price changes
fn rsi(closes: &[f64], period: usize) -> Option<f64> {
    if closes.len() < period + 1 {
        return None;
    }
    let deltas: Vec<f64> = closes
        .windows(2)
        .map(|w| w[1] - w[0])
        .collect();
    let recent = &deltas[deltas.len() - period..];

    let gain: f64 = recent.iter().filter(|d| **d > 0.0).sum::<f64>() / period as f64;
    let loss: f64 = -recent.iter().filter(|d| **d < 0.0).sum::<f64>() / period as f64;

    if loss == 0.0 {
        return Some(100.0);
    }
    let rs = gain / loss;
    Some(100.0 - 100.0 / (1.0 + rs))
}

/// MACD histogram: MACD(12/26) minus an EMA(9) signal line computed over
/// the MACD series itself
fn macd_histogram(closes: &[f64]) -> Option<f64> {
    let fast = ema_series(closes, MACD_FAST)?;
    let slow = ema_series(closes, MACD_SLOW)?;

    // Align the fast series to the slow one's start
    let offset = fast.len() - slow.len();
    let macd: Vec<f64> = slow
        .iter()
        .enumerate()
        .map(|(i, s)| fast[i + offset] - s)
        .collect();

    let signal = ema_series(&macd, MACD_SIGNAL)?;
    Some(macd.last()? - signal.last()?)
}

/// Last volume relative to the average of the preceding `lookback` bars
fn volume_ratio(volumes: &[f64], lookback: usize) -> Option<f64> {
    if volumes.len() < lookback + 1 {
        return None;
    }
    let last = *volumes.last()?;
    let prior = &volumes[volumes.len() - 1 - lookback..volumes.len() - 1];
    let avg = prior.iter().sum::<f64>() / lookback as f64;
    if avg <= 0.0 {
        return None;
    }
    Some(last / avg)
}
