//! Market-data fetch seam
//!
//! The scan engine and backtester consume market data through the
//! [`MarketData`] trait so they can run against a mock in tests. Transport
//! failures are converted to [`FetchError`] at this boundary; raw HTTP
//! errors never reach the scan state machine.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};
use tokio::time::Instant;

use crate::types::{Candle, Symbol, Timeframe};

/// Errors from the external market-data source
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed for {symbol}: {source}")]
    Http {
        symbol: Symbol,
        #[source]
        source: reqwest::Error,
    },

    #[error("request for {symbol} timed out")]
    Timeout { symbol: Symbol },

    #[error("exchange returned status {status} for {symbol}")]
    Status { symbol: Symbol, status: u16 },

    #[error("no data returned for {symbol} ({timeframe})")]
    Empty { symbol: Symbol, timeframe: Timeframe },

    #[error("unexpected payload for {symbol}: {reason}")]
    Payload { symbol: Symbol, reason: String },
}

impl FetchError {
    pub fn from_reqwest(symbol: &Symbol, source: reqwest::Error) -> Self {
        if source.is_timeout() {
            FetchError::Timeout {
                symbol: symbol.clone(),
            }
        } else {
            FetchError::Http {
                symbol: symbol.clone(),
                source,
            }
        }
    }
}

/// Abstraction over the external market-data source.
#[async_trait]
pub trait MarketData: Send + Sync {
    /// Recent OHLCV candles, ascending by time.
    async fn ohlcv(
        &self,
        symbol: &Symbol,
        timeframe: Timeframe,
        limit: usize,
    ) -> Result<Vec<Candle>, FetchError>;

    /// Larger paginated history for backtesting, ascending by time.
    async fn ohlcv_history(
        &self,
        symbol: &Symbol,
        timeframe: Timeframe,
        limit: usize,
    ) -> Result<Vec<Candle>, FetchError>;

    /// Latest traded price.
    async fn ticker_price(&self, symbol: &Symbol) -> Result<f64, FetchError>;

    /// Current perpetual funding rate, if the asset has a derivatives market.
    async fn funding_rate(&self, symbol: &Symbol) -> Option<f64>;

    /// Recent open-interest readings (oldest first), if available.
    async fn open_interest_history(&self, symbol: &Symbol, limit: usize) -> Option<Vec<f64>>;

    /// Top symbols for a quote currency ranked by 24h quote volume,
    /// formatted as "BASE/QUOTE".
    async fn top_symbols(&self, quote: &str, n: usize) -> Result<Vec<String>, FetchError>;
}

/// Token-bucket rate limiter shared by all exchange calls.
///
/// Permits refill in whole buckets once the refill interval elapses, so a
/// burst of workers cannot exceed the per-interval budget.
#[derive(Debug)]
pub struct RateLimiter {
    permits: Arc<Semaphore>,
    max_permits: usize,
    last_refill: Arc<Mutex<Instant>>,
    refill_interval: Duration,
}

impl RateLimiter {
    pub fn new(requests_per_interval: usize, refill_interval: Duration) -> Self {
        let max = requests_per_interval.max(1);
        Self {
            permits: Arc::new(Semaphore::new(max)),
            max_permits: max,
            last_refill: Arc::new(Mutex::new(Instant::now())),
            refill_interval,
        }
    }

    /// Limiter allowing `requests_per_second` calls per second.
    pub fn per_second(requests_per_second: usize) -> Self {
        Self::new(requests_per_second, Duration::from_secs(1))
    }

    /// Wait until a request slot is available, then consume it.
    pub async fn acquire(&self) {
        self.refill_if_due().await;
        let permit = self
            .permits
            .acquire()
            .await
            .expect("rate limiter semaphore closed");
        permit.forget();
    }

    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    async fn refill_if_due(&self) {
        let mut last_refill = self.last_refill.lock().await;
        if last_refill.elapsed() < self.refill_interval {
            return;
        }

        let current = self.permits.available_permits();
        let missing = self.max_permits.saturating_sub(current);
        if missing > 0 {
            self.permits.add_permits(missing);
        }
        *last_refill = Instant::now();
    }
}

impl Clone for RateLimiter {
    fn clone(&self) -> Self {
        Self {
            permits: Arc::clone(&self.permits),
            max_permits: self.max_permits,
            last_refill: Arc::clone(&self.last_refill),
            refill_interval: self.refill_interval,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::sleep;

    #[tokio::test]
    async fn test_acquire_consumes_permits() {
        let limiter = RateLimiter::per_second(3);
        assert_eq!(limiter.available(), 3);
        limiter.acquire().await;
        limiter.acquire().await;
        assert_eq!(limiter.available(), 1);
    }

    #[tokio::test]
    async fn test_refill_after_interval() {
        let limiter = RateLimiter::new(2, Duration::from_millis(40));
        limiter.acquire().await;
        limiter.acquire().await;
        assert_eq!(limiter.available(), 0);

        sleep(Duration::from_millis(50)).await;
        limiter.acquire().await;
        assert_eq!(limiter.available(), 1);
    }

    #[tokio::test]
    async fn test_clone_shares_budget() {
        let limiter = RateLimiter::new(2, Duration::from_secs(60));
        let clone = limiter.clone();
        limiter.acquire().await;
        clone.acquire().await;
        assert_eq!(limiter.available(), 0);
        assert_eq!(clone.available(), 0);
    }
}
