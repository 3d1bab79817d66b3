//! Configuration management
//!
//! Handles loading and parsing of JSON configuration files with environment
//! variable overrides for deployment-specific settings.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub exchange: ExchangeConfig,
    pub universe: UniverseConfig,
    pub scan: ScanConfig,
    pub backtest: BacktestConfig,
    pub database: DatabaseConfig,
}

impl Config {
    /// Load configuration from a JSON file, then apply environment overrides.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let contents = fs::read_to_string(path.as_ref()).context("Failed to read config file")?;
        let mut config: Config =
            serde_json::from_str(&contents).context("Failed to parse config JSON")?;
        config.apply_env();
        Ok(config)
    }

    /// Defaults plus environment overrides, for running without a file.
    pub fn from_env() -> Self {
        let mut config = Config::default();
        config.apply_env();
        config
    }

    fn apply_env(&mut self) {
        if let Ok(path) = std::env::var("SCANNER_DB_PATH") {
            self.database.path = path;
        }
        if let Ok(url) = std::env::var("SCANNER_SPOT_URL") {
            self.exchange.spot_base_url = url;
        }
        if let Ok(url) = std::env::var("SCANNER_FUTURES_URL") {
            self.exchange.futures_base_url = url;
        }
    }
}

/// Exchange endpoint configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExchangeConfig {
    pub spot_base_url: String,
    pub futures_base_url: String,
    pub quote_currency: String,
    /// Public-endpoint request budget per second, shared across all calls
    pub rate_limit: u32,
    pub request_timeout_secs: u64,
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        ExchangeConfig {
            spot_base_url: "https://api.binance.com".to_string(),
            futures_base_url: "https://fapi.binance.com".to_string(),
            quote_currency: "USDT".to_string(),
            rate_limit: 10,
            request_timeout_secs: 30,
        }
    }
}

/// Scanning universe configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UniverseConfig {
    /// Top-N volume-ranked assets maintained automatically
    pub dynamic_size: usize,
    /// Bellwether symbol used for market regime classification
    pub reference_symbol: String,
}

impl Default for UniverseConfig {
    fn default() -> Self {
        UniverseConfig {
            dynamic_size: 100,
            reference_symbol: "BTC/USDT".to_string(),
        }
    }
}

/// Scan cycle configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanConfig {
    pub interval_minutes: u64,
    pub setup_expiry_hours: i64,
    /// Candles fetched per timeframe during a scan
    pub candle_limit: usize,
}

impl Default for ScanConfig {
    fn default() -> Self {
        ScanConfig {
            interval_minutes: 240,
            setup_expiry_hours: 48,
            candle_limit: 200,
        }
    }
}

/// Backtest configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BacktestConfig {
    pub lookback_bars: usize,
    /// Minimum bars of history before the first evaluation
    pub evaluation_window: usize,
    /// Maximum holding horizon in bars for outcome simulation
    pub forward_window: usize,
    pub fee_bps: f64,
    pub slippage_bps: f64,
    pub results_dir: String,
}

impl Default for BacktestConfig {
    fn default() -> Self {
        BacktestConfig {
            lookback_bars: 365,
            evaluation_window: 50,
            forward_window: 10,
            fee_bps: 6.0,
            slippage_bps: 4.0,
            results_dir: "results".to_string(),
        }
    }
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        DatabaseConfig {
            path: "scanner.db".to_string(),
        }
    }
}
