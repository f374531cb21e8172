//! Trading signal value types produced by the model path and the
//! technical fallback

use serde::{Deserialize, Serialize};

/// Direction of a proposed trade
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SignalAction {
    Buy,
    Sell,
    Hold,
}

impl SignalAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignalAction::Buy => "BUY",
            SignalAction::Sell => "SELL",
            SignalAction::Hold => "HOLD",
        }
    }

    /// Loose parse accepting common model spellings; anything
    /// unrecognized maps to Hold.
    pub fn from_str_loose(raw: &str) -> Self {
        match raw.trim().to_ascii_uppercase().as_str() {
            "BUY" | "LONG" => SignalAction::Buy,
            "SELL" | "SHORT" => SignalAction::Sell,
            _ => SignalAction::Hold,
        }
    }
}

impl std::fmt::Display for SignalAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Fully validated per-symbol trading signal
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeSignal {
    /// Symbol the signal applies to (e.g., "BTCUSDT")
    pub asset_pair: String,
    pub signal_type: SignalAction,
    /// Model confidence in [0, 1]
    pub confidence_score: f64,
    /// Fraction of available cash to deploy, in [0, 1]
    pub position_size_pct: f64,
    /// Stop-loss price level
    pub stop_loss: Option<f64>,
    /// Take-profit price level
    pub take_profit: Option<f64>,
    pub reasoning: String,
}

impl TradeSignal {
    /// Conservative no-action signal used by every fallback path.
    pub fn hold(asset_pair: impl Into<String>, confidence: f64, reasoning: impl Into<String>) -> Self {
        Self {
            asset_pair: asset_pair.into(),
            signal_type: SignalAction::Hold,
            confidence_score: confidence,
            position_size_pct: 0.0,
            stop_loss: None,
            take_profit: None,
            reasoning: reasoning.into(),
        }
    }

    pub fn is_actionable(&self) -> bool {
        self.signal_type != SignalAction::Hold && self.position_size_pct > 0.0
    }
}

/// Result of a screening call: the symbols worth detailed analysis
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScreeningResult {
    pub symbols: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn action_from_str_loose() {
        assert_eq!(SignalAction::from_str_loose("buy"), SignalAction::Buy);
        assert_eq!(SignalAction::from_str_loose("LONG"), SignalAction::Buy);
        assert_eq!(SignalAction::from_str_loose("Sell"), SignalAction::Sell);
        assert_eq!(SignalAction::from_str_loose("whatever"), SignalAction::Hold);
    }

    #[test]
    fn hold_signal_is_not_actionable() {
        let sig = TradeSignal::hold("BTCUSDT", 0.1, "fallback");
        assert!(!sig.is_actionable());
        assert_eq!(sig.position_size_pct, 0.0);
    }

    #[test]
    fn serde_uses_uppercase_actions() {
        let sig = TradeSignal::hold("BTCUSDT", 0.1, "x");
        let json = serde_json::to_string(&sig).unwrap();
        assert!(json.contains("\"HOLD\""));
    }
}
