//! Indicator-enriched OHLCV series
//!
//! Wraps an ascending-time candle series and attaches named indicator
//! columns. Each column is computed at most once and addressed by a stable
//! name (`ema_50`, `rsi_14`, `macd_12_26_9_hist`, ...), so enrichment is
//! idempotent: re-running it on the same series is a no-op.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::indicators;
use crate::types::Candle;

/// Moving-average flavor used by several conditions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum MaType {
    #[default]
    Ema,
    Sma,
}

impl MaType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MaType::Ema => "ema",
            MaType::Sma => "sma",
        }
    }
}

/// An OHLCV series plus named indicator columns and per-asset snapshots
/// (funding rate, open-interest history) attached by the scan engine.
#[derive(Debug, Clone, Default)]
pub struct EnrichedSeries {
    candles: Vec<Candle>,
    columns: BTreeMap<String, Vec<Option<f64>>>,
    pub funding_rate: Option<f64>,
    pub open_interest: Option<Vec<f64>>,
}

impl EnrichedSeries {
    pub fn new(candles: Vec<Candle>) -> Self {
        EnrichedSeries {
            candles,
            columns: BTreeMap::new(),
            funding_rate: None,
            open_interest: None,
        }
    }

    pub fn len(&self) -> usize {
        self.candles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candles.is_empty()
    }

    pub fn candles(&self) -> &[Candle] {
        &self.candles
    }

    pub fn last_candle(&self) -> Option<&Candle> {
        self.candles.last()
    }

    pub fn closes(&self) -> Vec<f64> {
        self.candles.iter().map(|c| c.close).collect()
    }

    pub fn highs(&self) -> Vec<f64> {
        self.candles.iter().map(|c| c.high).collect()
    }

    pub fn lows(&self) -> Vec<f64> {
        self.candles.iter().map(|c| c.low).collect()
    }

    pub fn volumes(&self) -> Vec<f64> {
        self.candles.iter().map(|c| c.volume).collect()
    }

    pub fn column(&self, name: &str) -> Option<&[Option<f64>]> {
        self.columns.get(name).map(|v| v.as_slice())
    }

    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.columns.keys().map(|k| k.as_str())
    }

    /// Value of `name` at row `idx`; `None` when the column is missing or
    /// the row is inside the indicator's warmup.
    pub fn value_at(&self, name: &str, idx: usize) -> Option<f64> {
        self.columns.get(name).and_then(|col| *col.get(idx)?)
    }

    /// Value of `name` at the latest row.
    pub fn last_value(&self, name: &str) -> Option<f64> {
        if self.candles.is_empty() {
            return None;
        }
        self.value_at(name, self.candles.len() - 1)
    }

    fn insert_once(&mut self, name: &str, compute: impl FnOnce(&Self) -> Vec<Option<f64>>) {
        if self.columns.contains_key(name) {
            return;
        }
        let column = compute(self);
        debug_assert_eq!(column.len(), self.candles.len());
        self.columns.insert(name.to_string(), column);
    }

    // -------------------------------------------------------------------------
    // Enrichment. Each ensure_* returns the column name it guarantees.
    // -------------------------------------------------------------------------

    pub fn ensure_ma(&mut self, period: usize, ma_type: MaType) -> String {
        let name = format!("{}_{}", ma_type.as_str(), period);
        self.insert_once(&name, |s| match ma_type {
            MaType::Ema => indicators::ema(&s.closes(), period),
            MaType::Sma => indicators::sma(&s.closes(), period),
        });
        name
    }

    pub fn ensure_ma_slope(&mut self, period: usize, ma_type: MaType, lookback: usize) -> String {
        let ma_name = self.ensure_ma(period, ma_type);
        let name = format!("{ma_name}_slope");
        self.insert_once(&name, |s| {
            indicators::diff_over(s.column(&ma_name).unwrap_or(&[]), lookback)
        });
        name
    }

    pub fn ensure_rsi(&mut self, period: usize) -> String {
        let name = format!("rsi_{period}");
        self.insert_once(&name, |s| indicators::rsi(&s.closes(), period));
        name
    }

    /// Installs the MACD line, signal and histogram columns; returns the
    /// histogram column name.
    pub fn ensure_macd(&mut self, fast: usize, slow: usize, signal: usize) -> String {
        let prefix = format!("macd_{fast}_{slow}_{signal}");
        let hist_name = format!("{prefix}_hist");
        if !self.columns.contains_key(&hist_name) {
            let (line, signal_line, hist) = indicators::macd(&self.closes(), fast, slow, signal);
            self.columns.insert(format!("{prefix}_line"), line);
            self.columns.insert(format!("{prefix}_signal"), signal_line);
            self.columns.insert(hist_name.clone(), hist);
        }
        hist_name
    }

    /// Installs Bollinger upper/mid/lower plus bandwidth and %B columns;
    /// returns the column-name prefix (`bb_<period>`).
    pub fn ensure_bollinger(&mut self, period: usize, std_dev: f64) -> String {
        let prefix = format!("bb_{period}");
        if !self.columns.contains_key(&format!("{prefix}_upper")) {
            let (upper, mid, lower) = indicators::bollinger_bands(&self.closes(), period, std_dev);
            let closes = self.closes();

            let bandwidth: Vec<Option<f64>> = upper
                .iter()
                .zip(&lower)
                .zip(&mid)
                .map(|((u, l), m)| match (u, l, m) {
                    (Some(u), Some(l), Some(m)) if *m != 0.0 => Some((u - l) / m),
                    _ => None,
                })
                .collect();

            let pctb: Vec<Option<f64>> = upper
                .iter()
                .zip(&lower)
                .enumerate()
                .map(|(i, (u, l))| match (u, l) {
                    (Some(u), Some(l)) if u - l != 0.0 => Some((closes[i] - l) / (u - l)),
                    _ => None,
                })
                .collect();

            self.columns.insert(format!("{prefix}_upper"), upper);
            self.columns.insert(format!("{prefix}_mid"), mid);
            self.columns.insert(format!("{prefix}_lower"), lower);
            self.columns.insert(format!("{prefix}_bandwidth"), bandwidth);
            self.columns.insert(format!("{prefix}_pctb"), pctb);
        }
        prefix
    }

    pub fn ensure_atr(&mut self, period: usize) -> String {
        let name = format!("atr_{period}");
        self.insert_once(&name, |s| {
            indicators::atr(&s.highs(), &s.lows(), &s.closes(), period)
        });
        name
    }

    pub fn ensure_volume_sma(&mut self, period: usize) -> String {
        let name = format!("vol_sma_{period}");
        self.insert_once(&name, |s| indicators::sma(&s.volumes(), period));
        name
    }

    /// Installs the standard indicator set every scan uses.
    pub fn enrich_defaults(&mut self) {
        self.ensure_ma(20, MaType::Ema);
        self.ensure_ma(50, MaType::Ema);
        self.ensure_ma(200, MaType::Ema);
        self.ensure_ma(50, MaType::Sma);
        self.ensure_ma(200, MaType::Sma);
        self.ensure_ma_slope(50, MaType::Ema, 5);
        self.ensure_ma_slope(200, MaType::Ema, 5);
        self.ensure_rsi(14);
        self.ensure_macd(12, 26, 9);
        self.ensure_bollinger(20, 2.0);
        self.ensure_atr(14);
        self.ensure_volume_sma(20);
    }
}
