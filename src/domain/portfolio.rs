//! Portfolio snapshot value types
//!
//! A snapshot is an immutable capture of account state at a point in time.
//! A new fetch produces a new snapshot that replaces the old one wholesale;
//! staleness is always derived from `fetched_at`, never stored.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// A single held position within a snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    /// Asset currency code (e.g., "BTC")
    pub currency: String,
    /// Total balance including locked amounts
    pub balance: Decimal,
    /// Balance available for trading
    pub available: Decimal,
    /// Current valuation in USD
    pub usd_value: Decimal,
}

/// Immutable capture of account/position state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortfolioSnapshot {
    /// Positions ordered as returned by the exchange
    pub positions: Vec<Position>,
    /// Total portfolio valuation in USD
    pub total_value: Decimal,
    /// Free USDT cash
    pub cash_usdt: Decimal,
    /// Capture timestamp; identity of the snapshot for dedup purposes
    pub fetched_at: DateTime<Utc>,
}

impl PortfolioSnapshot {
    pub fn new(positions: Vec<Position>, total_value: Decimal, cash_usdt: Decimal) -> Self {
        Self {
            positions,
            total_value,
            cash_usdt,
            fetched_at: Utc::now(),
        }
    }

    /// Age of this snapshot relative to now.
    pub fn age(&self) -> chrono::Duration {
        Utc::now().signed_duration_since(self.fetched_at)
    }

    /// Whether the snapshot is younger than the given TTL.
    pub fn is_fresh(&self, ttl_secs: u64) -> bool {
        self.age() < chrono::Duration::seconds(ttl_secs as i64)
    }

    pub fn position(&self, currency: &str) -> Option<&Position> {
        self.positions.iter().find(|p| p.currency == currency)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn snapshot() -> PortfolioSnapshot {
        PortfolioSnapshot::new(
            vec![Position {
                currency: "BTC".into(),
                balance: dec!(0.5),
                available: dec!(0.5),
                usd_value: dec!(30000),
            }],
            dec!(31000),
            dec!(1000),
        )
    }

    #[test]
    fn fresh_snapshot_within_ttl() {
        let snap = snapshot();
        assert!(snap.is_fresh(60));
        assert!(snap.age() < chrono::Duration::seconds(1));
    }

    #[test]
    fn stale_snapshot_detected() {
        let mut snap = snapshot();
        snap.fetched_at = Utc::now() - chrono::Duration::seconds(120);
        assert!(!snap.is_fresh(60));
    }

    #[test]
    fn position_lookup_by_currency() {
        let snap = snapshot();
        assert!(snap.position("BTC").is_some());
        assert!(snap.position("ETH").is_none());
    }
}
