use async_trait::async_trait;

use crate::domain::{Candle, CandleInterval, PortfolioSnapshot};
use crate::error::Result;

/// Fetches account/position data from the exchange.
///
/// May fail with `VigilError::{Timeout, Auth, RateLimited, Network}`; the
/// readiness coordinator converts those into an `Unstable` transition plus a
/// scheduled retry. Callers never see a raw transport error.
#[async_trait]
pub trait PortfolioSource: Send + Sync {
    async fn fetch(&self) -> Result<PortfolioSnapshot>;
}

/// Supplies OHLCV history for indicator computation and model context.
#[async_trait]
pub trait CandleSource: Send + Sync {
    async fn history(
        &self,
        symbol: &str,
        interval: CandleInterval,
        limit: usize,
    ) -> Result<Vec<Candle>>;
}

#[cfg(test)]
pub mod test_support {
    //! Deterministic fakes shared by unit and integration tests

    use super::*;
    use rust_decimal_macros::dec;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Counts fetches and optionally fails the first N of them
    pub struct CountingPortfolioSource {
        pub calls: AtomicU32,
        pub fail_first: u32,
        pub delay_ms: u64,
    }

    impl CountingPortfolioSource {
        pub fn new() -> Self {
            Self {
                calls: AtomicU32::new(0),
                fail_first: 0,
                delay_ms: 0,
            }
        }

        pub fn failing_first(n: u32) -> Self {
            Self {
                calls: AtomicU32::new(0),
                fail_first: n,
                delay_ms: 0,
            }
        }

        pub fn with_delay_ms(mut self, ms: u64) -> Self {
            self.delay_ms = ms;
            self
        }

        pub fn call_count(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl PortfolioSource for CountingPortfolioSource {
        async fn fetch(&self) -> Result<PortfolioSnapshot> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if self.delay_ms > 0 {
                tokio::time::sleep(std::time::Duration::from_millis(self.delay_ms)).await;
            }
            if n < self.fail_first {
                return Err(crate::error::VigilError::Network("connection refused".into()));
            }
            Ok(PortfolioSnapshot::new(Vec::new(), dec!(1000), dec!(1000)))
        }
    }

    /// Returns a fixed synthetic candle series
    pub struct FixedCandleSource {
        pub candles: Vec<Candle>,
    }

    #[async_trait]
    impl CandleSource for FixedCandleSource {
        async fn history(
            &self,
            _symbol: &str,
            _interval: CandleInterval,
            limit: usize,
        ) -> Result<Vec<Candle>> {
            Ok(self.candles.iter().rev().take(limit).rev().copied().collect())
        }
    }
}
