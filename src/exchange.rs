//! Binance public-API market data client
//!
//! Implements [`MarketData`] over Binance's public spot and futures REST
//! endpoints. No authentication: the scanner only reads market data.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ordered_float::OrderedFloat;
use serde::Deserialize;
use std::collections::HashSet;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::ExchangeConfig;
use crate::market::{FetchError, MarketData, RateLimiter};
use crate::types::{Candle, Symbol, Timeframe};

/// Max candles per klines request
const KLINES_PAGE_LIMIT: usize = 1000;

/// Stablecoins and wrapped tokens excluded from the dynamic universe
const EXCLUDED_BASES: &[&str] = &[
    "USDC", "BUSD", "DAI", "TUSD", "USDP", "FDUSD", "USDD", "WBTC", "WETH", "STETH",
];

/// Leveraged-token suffixes excluded from the dynamic universe
const EXCLUDED_SUFFIXES: &[&str] = &["UP", "DOWN", "BULL", "BEAR", "3L", "3S", "2L", "2S"];

pub struct BinanceMarket {
    client: reqwest::Client,
    limiter: RateLimiter,
    spot_base: String,
    futures_base: String,
}

impl BinanceMarket {
    pub fn new(config: &ExchangeConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()?;

        Ok(Self {
            client,
            limiter: RateLimiter::per_second(config.rate_limit as usize),
            spot_base: config.spot_base_url.trim_end_matches('/').to_string(),
            futures_base: config.futures_base_url.trim_end_matches('/').to_string(),
        })
    }

    /// "BTC/USDT" -> "BTCUSDT"
    fn to_market(symbol: &Symbol) -> String {
        symbol.as_str().replace('/', "")
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        symbol: &Symbol,
        url: &str,
    ) -> Result<T, FetchError> {
        self.limiter.acquire().await;

        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| FetchError::from_reqwest(symbol, e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status {
                symbol: symbol.clone(),
                status: status.as_u16(),
            });
        }

        response
            .json::<T>()
            .await
            .map_err(|e| FetchError::from_reqwest(symbol, e))
    }

    async fn klines(
        &self,
        symbol: &Symbol,
        timeframe: Timeframe,
        limit: usize,
        end_time: Option<DateTime<Utc>>,
    ) -> Result<Vec<Candle>, FetchError> {
        let mut url = format!(
            "{}/api/v3/klines?symbol={}&interval={}&limit={}",
            self.spot_base,
            Self::to_market(symbol),
            timeframe,
            limit.min(KLINES_PAGE_LIMIT)
        );
        if let Some(end) = end_time {
            url.push_str(&format!("&endTime={}", end.timestamp_millis()));
        }

        let rows: Vec<serde_json::Value> = self.get_json(symbol, &url).await?;

        let mut candles = Vec::with_capacity(rows.len());
        for row in rows {
            candles.push(parse_kline(symbol, &row)?);
        }
        Ok(candles)
    }
}

/// Parse one kline row: [open_time, "open", "high", "low", "close", "volume", ...]
fn parse_kline(symbol: &Symbol, row: &serde_json::Value) -> Result<Candle, FetchError> {
    let payload = |reason: &str| FetchError::Payload {
        symbol: symbol.clone(),
        reason: reason.to_string(),
    };

    let fields = row
        .as_array()
        .ok_or_else(|| payload("kline row is not an array"))?;
    if fields.len() < 6 {
        return Err(payload("kline row too short"));
    }

    let open_time = fields[0]
        .as_i64()
        .ok_or_else(|| payload("bad kline open time"))?;
    let datetime = DateTime::from_timestamp_millis(open_time)
        .ok_or_else(|| payload("kline open time out of range"))?;

    let price = |idx: usize, name: &str| -> Result<f64, FetchError> {
        fields[idx]
            .as_str()
            .and_then(|s| s.parse::<f64>().ok())
            .ok_or_else(|| payload(&format!("bad kline {name}")))
    };

    Ok(Candle {
        datetime,
        open: price(1, "open")?,
        high: price(2, "high")?,
        low: price(3, "low")?,
        close: price(4, "close")?,
        volume: price(5, "volume")?,
    })
}

#[derive(Debug, Deserialize)]
struct TickerPrice {
    price: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Ticker24h {
    symbol: String,
    #[serde(default)]
    quote_volume: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PremiumIndex {
    #[serde(default)]
    last_funding_rate: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OpenInterestRow {
    #[serde(default)]
    sum_open_interest_value: Option<String>,
}

#[async_trait]
impl MarketData for BinanceMarket {
    async fn ohlcv(
        &self,
        symbol: &Symbol,
        timeframe: Timeframe,
        limit: usize,
    ) -> Result<Vec<Candle>, FetchError> {
        let candles = self.klines(symbol, timeframe, limit, None).await?;
        if candles.is_empty() {
            return Err(FetchError::Empty {
                symbol: symbol.clone(),
                timeframe,
            });
        }
        Ok(candles)
    }

    async fn ohlcv_history(
        &self,
        symbol: &Symbol,
        timeframe: Timeframe,
        limit: usize,
    ) -> Result<Vec<Candle>, FetchError> {
        let mut all: Vec<Candle> = Vec::new();
        let mut end_time: Option<DateTime<Utc>> = None;
        let mut last_oldest: Option<DateTime<Utc>> = None;

        while all.len() < limit {
            let page = limit.saturating_sub(all.len()).min(KLINES_PAGE_LIMIT);
            let candles = self.klines(symbol, timeframe, page, end_time).await?;
            if candles.is_empty() {
                break;
            }

            let oldest = candles
                .iter()
                .map(|c| c.datetime)
                .min()
                .expect("non-empty page");

            // No older data available
            if last_oldest == Some(oldest) {
                break;
            }
            last_oldest = Some(oldest);

            debug!(
                "fetched {} {} candles for {}, oldest {}",
                candles.len(),
                timeframe,
                symbol,
                oldest
            );

            all.extend(candles);
            end_time = Some(oldest - chrono::Duration::milliseconds(1));
        }

        if all.is_empty() {
            return Err(FetchError::Empty {
                symbol: symbol.clone(),
                timeframe,
            });
        }

        all.sort_by_key(|c| c.datetime);
        all.dedup_by_key(|c| c.datetime);
        if all.len() > limit {
            all.drain(..all.len() - limit);
        }
        Ok(all)
    }

    async fn ticker_price(&self, symbol: &Symbol) -> Result<f64, FetchError> {
        let url = format!(
            "{}/api/v3/ticker/price?symbol={}",
            self.spot_base,
            Self::to_market(symbol)
        );
        let ticker: TickerPrice = self.get_json(symbol, &url).await?;
        ticker
            .price
            .parse::<f64>()
            .map_err(|_| FetchError::Payload {
                symbol: symbol.clone(),
                reason: format!("unparseable ticker price: {}", ticker.price),
            })
    }

    async fn funding_rate(&self, symbol: &Symbol) -> Option<f64> {
        let url = format!(
            "{}/fapi/v1/premiumIndex?symbol={}",
            self.futures_base,
            Self::to_market(symbol)
        );
        match self.get_json::<PremiumIndex>(symbol, &url).await {
            Ok(index) => index.last_funding_rate.and_then(|r| r.parse().ok()),
            Err(e) => {
                debug!("no funding rate for {symbol}: {e}");
                None
            }
        }
    }

    async fn open_interest_history(&self, symbol: &Symbol, limit: usize) -> Option<Vec<f64>> {
        let url = format!(
            "{}/futures/data/openInterestHist?symbol={}&period=1h&limit={}",
            self.futures_base,
            Self::to_market(symbol),
            limit
        );
        match self.get_json::<Vec<OpenInterestRow>>(symbol, &url).await {
            Ok(rows) => {
                let values: Vec<f64> = rows
                    .into_iter()
                    .filter_map(|row| row.sum_open_interest_value?.parse().ok())
                    .collect();
                (!values.is_empty()).then_some(values)
            }
            Err(e) => {
                debug!("no open interest for {symbol}: {e}");
                None
            }
        }
    }

    async fn top_symbols(&self, quote: &str, n: usize) -> Result<Vec<String>, FetchError> {
        let probe = Symbol::new(format!("*/{quote}"));
        let url = format!("{}/api/v3/ticker/24hr", self.spot_base);
        let tickers: Vec<Ticker24h> = self.get_json(&probe, &url).await?;

        let excluded_bases: HashSet<&str> = EXCLUDED_BASES.iter().copied().collect();

        let mut ranked: Vec<(String, f64)> = tickers
            .into_iter()
            .filter_map(|t| {
                let base = t.symbol.strip_suffix(quote)?;
                if base.is_empty() {
                    return None;
                }
                let volume: f64 = t.quote_volume?.parse().ok()?;
                Some((base.to_string(), volume))
            })
            .collect();
        ranked.sort_by_key(|(_, volume)| std::cmp::Reverse(OrderedFloat(*volume)));

        let mut result = Vec::with_capacity(n);
        for (base, _) in ranked {
            if excluded_bases.contains(base.as_str()) {
                continue;
            }
            if EXCLUDED_SUFFIXES.iter().any(|s| base.ends_with(s)) {
                continue;
            }
            result.push(format!("{base}/{quote}"));
            if result.len() >= n {
                break;
            }
        }

        if result.is_empty() {
            warn!("no tradable {quote} pairs in 24h ticker response");
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_to_market_format() {
        assert_eq!(
            BinanceMarket::to_market(&Symbol::new("BTC/USDT")),
            "BTCUSDT"
        );
        assert_eq!(
            BinanceMarket::to_market(&Symbol::new("SOLUSDT")),
            "SOLUSDT"
        );
    }

    #[test]
    fn test_parse_kline_row() {
        let symbol = Symbol::new("BTC/USDT");
        let row = json!([
            1700000000000i64,
            "37000.1",
            "37500.2",
            "36800.3",
            "37200.4",
            "1234.5",
            1700003599999i64,
            "0",
            100,
            "0",
            "0",
            "0"
        ]);
        let candle = parse_kline(&symbol, &row).unwrap();
        assert_eq!(candle.open, 37000.1);
        assert_eq!(candle.close, 37200.4);
        assert_eq!(candle.volume, 1234.5);
    }

    #[test]
    fn test_parse_kline_rejects_garbage() {
        let symbol = Symbol::new("BTC/USDT");
        assert!(parse_kline(&symbol, &json!("nope")).is_err());
        assert!(parse_kline(&symbol, &json!([1, 2])).is_err());
        assert!(parse_kline(
            &symbol,
            &json!([1700000000000i64, "x", "1", "1", "1", "1"])
        )
        .is_err());
    }
}
