//! Paper exchange used by the standalone daemon
//!
//! Serves a static simulated portfolio and random-walk candle history so
//! the core can run without exchange credentials. Real deployments swap in
//! adapters implementing the same traits.

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use rand::Rng;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use vigil::domain::{Candle, CandleInterval, PortfolioSnapshot, Position};
use vigil::error::Result;
use vigil::exchange::{CandleSource, PortfolioSource};

pub struct PaperExchange {
    watchlist: Vec<String>,
}

impl PaperExchange {
    pub fn new(watchlist: Vec<String>) -> Self {
        Self { watchlist }
    }
}

#[async_trait]
impl PortfolioSource for PaperExchange {
    async fn fetch(&self) -> Result<PortfolioSnapshot> {
        let positions: Vec<Position> = self
            .watchlist
            .iter()
            .map(|symbol| Position {
                currency: symbol.trim_end_matches("USDT").to_string(),
                balance: dec!(1.0),
                available: dec!(1.0),
                usd_value: dec!(1000),
            })
            .collect();

        let total: Decimal = positions.iter().map(|p| p.usd_value).sum::<Decimal>() + dec!(5000);
        Ok(PortfolioSnapshot::new(positions, total, dec!(5000)))
    }
}

#[async_trait]
impl CandleSource for PaperExchange {
    async fn history(
        &self,
        _symbol: &str,
        interval: CandleInterval,
        limit: usize,
    ) -> Result<Vec<Candle>> {
        let step_mins: i64 = match interval {
            CandleInterval::OneMinute => 1,
            CandleInterval::FiveMinutes => 5,
            CandleInterval::FifteenMinutes => 15,
            CandleInterval::OneHour => 60,
            CandleInterval::FourHours => 240,
            CandleInterval::OneDay => 1440,
        };

        let mut rng = rand::thread_rng();
        let mut price = 100.0 + rng.gen_range(-5.0..5.0);
        let now = Utc::now();

        let candles = (0..limit)
            .map(|i| {
                let drift = rng.gen_range(-0.01..0.01);
                let open = price;
                price *= 1.0 + drift;
                let (high, low) = if price > open {
                    (price * 1.002, open * 0.998)
                } else {
                    (open * 1.002, price * 0.998)
                };
                let mut candle = Candle::new(open, high, low, price, rng.gen_range(500.0..1500.0));
                candle.timestamp =
                    now - ChronoDuration::minutes(step_mins * (limit - i) as i64);
                candle
            })
            .collect();

        Ok(candles)
    }
}
