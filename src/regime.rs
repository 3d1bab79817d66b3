//! Market regime classification
//!
//! Classifies overall market state from the reference asset's daily price
//! structure. Total over its input: any non-empty series yields a label,
//! and a too-short series falls back to `Ranging` at zero confidence.

use serde::{Deserialize, Serialize};

use crate::series::{EnrichedSeries, MaType};

/// Minimum bars of reference data needed for a confident classification.
const MIN_BARS: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MarketRegime {
    TrendingUp,
    TrendingDown,
    Ranging,
    HighVolatility,
}

impl MarketRegime {
    pub const ALL: &'static [MarketRegime] = &[
        MarketRegime::TrendingUp,
        MarketRegime::TrendingDown,
        MarketRegime::Ranging,
        MarketRegime::HighVolatility,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MarketRegime::TrendingUp => "trending_up",
            MarketRegime::TrendingDown => "trending_down",
            MarketRegime::Ranging => "ranging",
            MarketRegime::HighVolatility => "high_volatility",
        }
    }
}

impl std::str::FromStr for MarketRegime {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        MarketRegime::ALL
            .iter()
            .find(|r| r.as_str() == s)
            .copied()
            .ok_or_else(|| format!("unrecognized market regime: {s}"))
    }
}

impl std::fmt::Display for MarketRegime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Indicator values backing a classification, for display and scan logs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegimeSnapshot {
    pub close: f64,
    pub ema_50: Option<f64>,
    pub ema_200: Option<f64>,
    pub ema_50_slope: Option<f64>,
    pub ema_200_slope: Option<f64>,
    pub atr_pct: f64,
    pub avg_atr_pct: f64,
}

/// A classification result: label, confidence, and supporting detail.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegimeReading {
    pub regime: MarketRegime,
    pub confidence: f64,
    pub description: String,
    pub trend: String,
    pub snapshot: Option<RegimeSnapshot>,
}

impl RegimeReading {
    fn insufficient_data() -> Self {
        RegimeReading {
            regime: MarketRegime::Ranging,
            confidence: 0.0,
            description: "Insufficient reference data, defaulting to ranging".to_string(),
            trend: "unknown".to_string(),
            snapshot: None,
        }
    }
}

/// Classify the current market regime from the reference asset's series.
pub fn classify(series: &mut EnrichedSeries) -> RegimeReading {
    if series.len() < MIN_BARS {
        return RegimeReading::insufficient_data();
    }

    series.ensure_ma(50, MaType::Ema);
    series.ensure_ma(200, MaType::Ema);
    series.ensure_ma_slope(50, MaType::Ema, 5);
    series.ensure_ma_slope(200, MaType::Ema, 5);
    let atr_col = series.ensure_atr(14);

    let close = match series.last_candle() {
        Some(candle) => candle.close,
        None => return RegimeReading::insufficient_data(),
    };

    let ema_50 = series.last_value("ema_50");
    let ema_200 = series.last_value("ema_200");
    let slope_50 = series.last_value("ema_50_slope");
    let slope_200 = series.last_value("ema_200_slope");

    let atr = series.last_value(&atr_col);
    let atr_pct = match atr {
        Some(atr) if close > 0.0 => atr / close * 100.0,
        _ => 0.0,
    };

    // Average ATR% over the last 20 bars, skipping warmup rows
    let atr_column = series.column(&atr_col).unwrap_or(&[]);
    let candles = series.candles();
    let start = candles.len().saturating_sub(20);
    let recent_pcts: Vec<f64> = (start..candles.len())
        .filter_map(|i| {
            let atr = atr_column.get(i).copied().flatten()?;
            let close = candles[i].close;
            (close > 0.0).then(|| atr / close * 100.0)
        })
        .collect();
    let avg_atr_pct = if recent_pcts.is_empty() {
        0.0
    } else {
        recent_pcts.iter().sum::<f64>() / recent_pcts.len() as f64
    };

    let snapshot = RegimeSnapshot {
        close,
        ema_50,
        ema_200,
        ema_50_slope: slope_50,
        ema_200_slope: slope_200,
        atr_pct,
        avg_atr_pct,
    };

    // Volatility spike takes precedence over trend
    if atr_pct > avg_atr_pct * 1.5 && atr_pct > 4.0 {
        return RegimeReading {
            regime: MarketRegime::HighVolatility,
            confidence: (atr_pct / (avg_atr_pct * 2.0)).min(1.0),
            description: "High volatility environment, ATR significantly elevated".to_string(),
            trend: "volatile".to_string(),
            snapshot: Some(snapshot),
        };
    }

    let above_50 = ema_50.map(|v| close > v).unwrap_or(false);
    let above_200 = ema_200.map(|v| close > v).unwrap_or(false);
    let slope_50_up = slope_50.map(|v| v > 0.0).unwrap_or(false);
    let slope_200_up = slope_200.map(|v| v > 0.0).unwrap_or(false);

    let bullish_score = [above_50, above_200, slope_50_up, slope_200_up]
        .iter()
        .filter(|&&b| b)
        .count();
    let bearish_score = [
        !above_50,
        !above_200,
        slope_50.map(|v| v < 0.0).unwrap_or(false),
        slope_200.map(|v| v < 0.0).unwrap_or(false),
    ]
    .iter()
    .filter(|&&b| b)
    .count();

    if bullish_score >= 3 {
        return RegimeReading {
            regime: MarketRegime::TrendingUp,
            confidence: bullish_score as f64 / 4.0,
            description: "Reference asset in uptrend, price above key MAs with positive slope"
                .to_string(),
            trend: "bullish".to_string(),
            snapshot: Some(snapshot),
        };
    }

    if bearish_score >= 3 {
        return RegimeReading {
            regime: MarketRegime::TrendingDown,
            confidence: bearish_score as f64 / 4.0,
            description: "Reference asset in downtrend, price below key MAs with negative slope"
                .to_string(),
            trend: "bearish".to_string(),
            snapshot: Some(snapshot),
        };
    }

    RegimeReading {
        regime: MarketRegime::Ranging,
        confidence: 0.5,
        description: "Reference asset range-bound with mixed signals".to_string(),
        trend: "neutral".to_string(),
        snapshot: Some(snapshot),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Candle;
    use chrono::{Duration, Utc};

    fn series_from_closes(closes: &[f64]) -> EnrichedSeries {
        let start = Utc::now() - Duration::days(closes.len() as i64);
        let candles = closes
            .iter()
            .enumerate()
            .map(|(i, &close)| Candle {
                datetime: start + Duration::days(i as i64),
                open: close,
                high: close * 1.005,
                low: close * 0.995,
                close,
                volume: 1000.0,
            })
            .collect();
        EnrichedSeries::new(candles)
    }

    #[test]
    fn test_insufficient_data_fallback() {
        let closes: Vec<f64> = (0..20).map(|i| 100.0 + i as f64).collect();
        let reading = classify(&mut series_from_closes(&closes));
        assert_eq!(reading.regime, MarketRegime::Ranging);
        assert_eq!(reading.confidence, 0.0);
        assert!(reading.snapshot.is_none());
    }

    #[test]
    fn test_uptrend_classification() {
        let closes: Vec<f64> = (0..250).map(|i| 100.0 * 1.005f64.powi(i)).collect();
        let reading = classify(&mut series_from_closes(&closes));
        assert_eq!(reading.regime, MarketRegime::TrendingUp);
        assert!(reading.confidence >= 0.75);
        assert!(reading.snapshot.is_some());
    }

    #[test]
    fn test_downtrend_classification() {
        let closes: Vec<f64> = (0..250).map(|i| 100.0 * 0.995f64.powi(i)).collect();
        let reading = classify(&mut series_from_closes(&closes));
        assert_eq!(reading.regime, MarketRegime::TrendingDown);
        assert!(reading.confidence >= 0.75);
    }

    #[test]
    fn test_confidence_bounds() {
        let closes: Vec<f64> = (0..250)
            .map(|i| 100.0 + (i as f64 * 0.7).sin() * 5.0)
            .collect();
        let reading = classify(&mut series_from_closes(&closes));
        assert!((0.0..=1.0).contains(&reading.confidence));
    }

    #[test]
    fn test_regime_string_roundtrip() {
        for regime in MarketRegime::ALL {
            assert_eq!(
                regime.as_str().parse::<MarketRegime>().unwrap(),
                *regime
            );
        }
    }
}
