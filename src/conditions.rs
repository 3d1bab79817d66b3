//! Condition evaluation engine
//!
//! Every recognized condition is one variant of [`ConditionKind`] with typed,
//! defaulted parameters. Definitions are validated when a strategy is saved,
//! not when a scan evaluates them, so a malformed strategy fails fast.
//!
//! Evaluation is tri-state: `Met`, `NotMet`, or `Undefined`. Undefined means
//! the series is too short for the indicator's lookback (or the market state
//! is inapplicable); the scan engine gates on it like `NotMet` but logs it
//! separately. Funding/open-interest conditions pass when no derivatives data
//! exists for the asset.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::indicators::{swing_highs, swing_low_indices, swing_lows};
use crate::series::{EnrichedSeries, MaType};

/// Swing detection window used by structure conditions and the level
/// calculator. Fixed so structural results are deterministic.
pub const STRUCTURE_SWING_WINDOW: usize = 3;

/// Minimum bars a structure condition needs before it will judge a pattern.
const STRUCTURE_MIN_BARS: usize = 10;

/// Result of evaluating one condition against one timeframe's data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConditionOutcome {
    Met,
    NotMet,
    /// Insufficient history or inapplicable market state. Gated like
    /// `NotMet`, logged distinctly.
    Undefined,
}

impl ConditionOutcome {
    pub fn is_met(self) -> bool {
        matches!(self, ConditionOutcome::Met)
    }

    fn from_bool(met: bool) -> Self {
        if met {
            ConditionOutcome::Met
        } else {
            ConditionOutcome::NotMet
        }
    }
}

/// Errors raised when parsing or validating a condition definition.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unrecognized condition or malformed parameters: {0}")]
    Malformed(String),

    #[error("invalid `{field}` for {condition}: {reason}")]
    InvalidParameter {
        condition: &'static str,
        field: &'static str,
        reason: String,
    },
}

mod defaults {
    pub fn period_50() -> usize {
        50
    }
    pub fn period_20() -> usize {
        20
    }
    pub fn period_14() -> usize {
        14
    }
    pub fn lookback_5() -> usize {
        5
    }
    pub fn lookback_20() -> usize {
        20
    }
    pub fn lookback_50() -> usize {
        50
    }
    pub fn swings_2() -> usize {
        2
    }
    pub fn window_5() -> usize {
        5
    }
    pub fn fast_12() -> usize {
        12
    }
    pub fn slow_26() -> usize {
        26
    }
    pub fn signal_9() -> usize {
        9
    }
    pub fn candles_3() -> usize {
        3
    }
    pub fn two() -> f64 {
        2.0
    }
    pub fn squeeze_threshold() -> f64 {
        0.05
    }
    pub fn contraction_ratio() -> f64 {
        0.7
    }
    pub fn proximity_pct() -> f64 {
        2.0
    }
    pub fn rsi_30() -> f64 {
        30.0
    }
    pub fn rsi_50() -> f64 {
        50.0
    }
    pub fn rsi_70() -> f64 {
        70.0
    }
    pub fn funding_cap() -> f64 {
        0.01
    }
    pub fn funding_floor() -> f64 {
        -0.01
    }
}

/// All recognized condition types with their parameters.
///
/// The tag matches the stored `condition_type` string, so strategy
/// definitions deserialize directly into this enum.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ConditionKind {
    // ---- trend -------------------------------------------------------------
    PriceAboveMa {
        #[serde(default = "defaults::period_50")]
        period: usize,
        #[serde(default)]
        ma_type: MaType,
    },
    PriceBelowMa {
        #[serde(default = "defaults::period_50")]
        period: usize,
        #[serde(default)]
        ma_type: MaType,
    },
    MaSlopeRising {
        #[serde(default = "defaults::period_50")]
        period: usize,
        #[serde(default)]
        ma_type: MaType,
        #[serde(default = "defaults::lookback_5")]
        lookback: usize,
    },
    MaSlopeFalling {
        #[serde(default = "defaults::period_50")]
        period: usize,
        #[serde(default)]
        ma_type: MaType,
        #[serde(default = "defaults::lookback_5")]
        lookback: usize,
    },
    EmaCrossoverBullish {
        #[serde(default = "defaults::period_20")]
        fast_period: usize,
        #[serde(default = "defaults::period_50")]
        slow_period: usize,
    },
    EmaCrossoverBearish {
        #[serde(default = "defaults::period_20")]
        fast_period: usize,
        #[serde(default = "defaults::period_50")]
        slow_period: usize,
    },
    HigherHighsHigherLows {
        #[serde(default = "defaults::lookback_20")]
        lookback: usize,
        #[serde(default = "defaults::swings_2")]
        min_swings: usize,
    },
    LowerHighsLowerLows {
        #[serde(default = "defaults::lookback_20")]
        lookback: usize,
        #[serde(default = "defaults::swings_2")]
        min_swings: usize,
    },

    // ---- market structure --------------------------------------------------
    BreakOfStructureBullish {
        #[serde(default = "defaults::lookback_20")]
        lookback: usize,
        #[serde(default = "defaults::window_5")]
        swing_window: usize,
    },
    BreakOfStructureBearish {
        #[serde(default = "defaults::lookback_20")]
        lookback: usize,
        #[serde(default = "defaults::window_5")]
        swing_window: usize,
    },
    PriceNearSupport {
        #[serde(default = "defaults::lookback_50")]
        lookback: usize,
        #[serde(default = "defaults::proximity_pct")]
        proximity_pct: f64,
        #[serde(default = "defaults::window_5")]
        swing_window: usize,
    },
    PriceNearResistance {
        #[serde(default = "defaults::lookback_50")]
        lookback: usize,
        #[serde(default = "defaults::proximity_pct")]
        proximity_pct: f64,
        #[serde(default = "defaults::window_5")]
        swing_window: usize,
    },

    // ---- volatility --------------------------------------------------------
    BbSqueeze {
        #[serde(default = "defaults::period_20")]
        period: usize,
        #[serde(default = "defaults::two")]
        std_dev: f64,
        #[serde(default = "defaults::squeeze_threshold")]
        threshold: f64,
    },
    AtrAboveAverage {
        #[serde(default = "defaults::period_14")]
        atr_period: usize,
        #[serde(default = "defaults::period_20")]
        avg_period: usize,
    },
    AtrBelowAverage {
        #[serde(default = "defaults::period_14")]
        atr_period: usize,
        #[serde(default = "defaults::period_20")]
        avg_period: usize,
    },
    CandleRangeContraction {
        #[serde(default = "defaults::lookback_5")]
        lookback: usize,
        #[serde(default = "defaults::period_20")]
        avg_period: usize,
        #[serde(default = "defaults::contraction_ratio")]
        ratio: f64,
    },

    // ---- momentum ----------------------------------------------------------
    RsiInRange {
        #[serde(default = "defaults::period_14")]
        period: usize,
        #[serde(default = "defaults::rsi_30")]
        min_val: f64,
        #[serde(default = "defaults::rsi_50")]
        max_val: f64,
    },
    RsiOversold {
        #[serde(default = "defaults::period_14")]
        period: usize,
        #[serde(default = "defaults::rsi_30")]
        threshold: f64,
    },
    RsiOverbought {
        #[serde(default = "defaults::period_14")]
        period: usize,
        #[serde(default = "defaults::rsi_70")]
        threshold: f64,
    },
    MacdHistogramPositive {
        #[serde(default = "defaults::fast_12")]
        fast: usize,
        #[serde(default = "defaults::slow_26")]
        slow: usize,
        #[serde(default = "defaults::signal_9")]
        signal: usize,
    },
    MacdHistogramNegative {
        #[serde(default = "defaults::fast_12")]
        fast: usize,
        #[serde(default = "defaults::slow_26")]
        slow: usize,
        #[serde(default = "defaults::signal_9")]
        signal: usize,
    },
    RsiBullishDivergence {
        #[serde(default = "defaults::period_14")]
        period: usize,
        #[serde(default = "defaults::lookback_20")]
        lookback: usize,
    },

    // ---- volume ------------------------------------------------------------
    VolumeSpike {
        #[serde(default = "defaults::period_20")]
        avg_period: usize,
        #[serde(default = "defaults::two")]
        multiplier: f64,
    },
    VolumeDeclining {
        #[serde(default = "defaults::candles_3")]
        candles: usize,
    },

    // ---- funding / sentiment -----------------------------------------------
    FundingRateBelow {
        #[serde(default = "defaults::funding_cap")]
        threshold: f64,
    },
    FundingRateAbove {
        #[serde(default = "defaults::funding_floor")]
        threshold: f64,
    },
    OpenInterestRising {
        #[serde(default = "defaults::candles_3")]
        candles: usize,
    },
}

impl ConditionKind {
    /// Parse a stored (`condition_type`, parameter object) pair, validating
    /// the parameters. Unknown types and malformed parameters are rejected.
    pub fn from_parts(
        condition_type: &str,
        params: &serde_json::Value,
    ) -> Result<Self, ConfigError> {
        let mut obj = params.as_object().cloned().unwrap_or_default();
        obj.insert(
            "type".to_string(),
            serde_json::Value::String(condition_type.to_string()),
        );

        let kind: ConditionKind = serde_json::from_value(serde_json::Value::Object(obj))
            .map_err(|e| ConfigError::Malformed(format!("{condition_type}: {e}")))?;
        kind.validate()?;
        Ok(kind)
    }

    /// The stored parameter object (everything except the type tag).
    pub fn params_json(&self) -> serde_json::Value {
        let mut value = serde_json::to_value(self).expect("condition serializes");
        if let Some(obj) = value.as_object_mut() {
            obj.remove("type");
        }
        value
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            ConditionKind::PriceAboveMa { .. } => "price_above_ma",
            ConditionKind::PriceBelowMa { .. } => "price_below_ma",
            ConditionKind::MaSlopeRising { .. } => "ma_slope_rising",
            ConditionKind::MaSlopeFalling { .. } => "ma_slope_falling",
            ConditionKind::EmaCrossoverBullish { .. } => "ema_crossover_bullish",
            ConditionKind::EmaCrossoverBearish { .. } => "ema_crossover_bearish",
            ConditionKind::HigherHighsHigherLows { .. } => "higher_highs_higher_lows",
            ConditionKind::LowerHighsLowerLows { .. } => "lower_highs_lower_lows",
            ConditionKind::BreakOfStructureBullish { .. } => "break_of_structure_bullish",
            ConditionKind::BreakOfStructureBearish { .. } => "break_of_structure_bearish",
            ConditionKind::PriceNearSupport { .. } => "price_near_support",
            ConditionKind::PriceNearResistance { .. } => "price_near_resistance",
            ConditionKind::BbSqueeze { .. } => "bb_squeeze",
            ConditionKind::AtrAboveAverage { .. } => "atr_above_average",
            ConditionKind::AtrBelowAverage { .. } => "atr_below_average",
            ConditionKind::CandleRangeContraction { .. } => "candle_range_contraction",
            ConditionKind::RsiInRange { .. } => "rsi_in_range",
            ConditionKind::RsiOversold { .. } => "rsi_oversold",
            ConditionKind::RsiOverbought { .. } => "rsi_overbought",
            ConditionKind::MacdHistogramPositive { .. } => "macd_histogram_positive",
            ConditionKind::MacdHistogramNegative { .. } => "macd_histogram_negative",
            ConditionKind::RsiBullishDivergence { .. } => "rsi_bullish_divergence",
            ConditionKind::VolumeSpike { .. } => "volume_spike",
            ConditionKind::VolumeDeclining { .. } => "volume_declining",
            ConditionKind::FundingRateBelow { .. } => "funding_rate_below",
            ConditionKind::FundingRateAbove { .. } => "funding_rate_above",
            ConditionKind::OpenInterestRising { .. } => "open_interest_rising",
        }
    }

    /// Validate parameter values. Called at strategy save time.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let name = self.type_name();
        let positive = |field: &'static str, value: usize| {
            if value == 0 {
                Err(ConfigError::InvalidParameter {
                    condition: name,
                    field,
                    reason: "must be >= 1".to_string(),
                })
            } else {
                Ok(())
            }
        };
        let finite = |field: &'static str, value: f64| {
            if value.is_finite() {
                Ok(())
            } else {
                Err(ConfigError::InvalidParameter {
                    condition: name,
                    field,
                    reason: "must be finite".to_string(),
                })
            }
        };

        match *self {
            ConditionKind::PriceAboveMa { period, .. }
            | ConditionKind::PriceBelowMa { period, .. } => positive("period", period),

            ConditionKind::MaSlopeRising {
                period, lookback, ..
            }
            | ConditionKind::MaSlopeFalling {
                period, lookback, ..
            } => {
                positive("period", period)?;
                positive("lookback", lookback)
            }

            ConditionKind::EmaCrossoverBullish {
                fast_period,
                slow_period,
            }
            | ConditionKind::EmaCrossoverBearish {
                fast_period,
                slow_period,
            } => {
                positive("fast_period", fast_period)?;
                positive("slow_period", slow_period)?;
                if fast_period >= slow_period {
                    return Err(ConfigError::InvalidParameter {
                        condition: name,
                        field: "fast_period",
                        reason: format!("must be < slow_period ({slow_period})"),
                    });
                }
                Ok(())
            }

            ConditionKind::HigherHighsHigherLows {
                lookback,
                min_swings,
            }
            | ConditionKind::LowerHighsLowerLows {
                lookback,
                min_swings,
            } => {
                positive("lookback", lookback)?;
                positive("min_swings", min_swings)
            }

            ConditionKind::BreakOfStructureBullish {
                lookback,
                swing_window,
            }
            | ConditionKind::BreakOfStructureBearish {
                lookback,
                swing_window,
            } => {
                positive("lookback", lookback)?;
                positive("swing_window", swing_window)
            }

            ConditionKind::PriceNearSupport {
                lookback,
                proximity_pct,
                swing_window,
            }
            | ConditionKind::PriceNearResistance {
                lookback,
                proximity_pct,
                swing_window,
            } => {
                positive("lookback", lookback)?;
                positive("swing_window", swing_window)?;
                finite("proximity_pct", proximity_pct)?;
                if proximity_pct <= 0.0 {
                    return Err(ConfigError::InvalidParameter {
                        condition: name,
                        field: "proximity_pct",
                        reason: "must be > 0".to_string(),
                    });
                }
                Ok(())
            }

            ConditionKind::BbSqueeze {
                period,
                std_dev,
                threshold,
            } => {
                positive("period", period)?;
                finite("std_dev", std_dev)?;
                finite("threshold", threshold)?;
                if std_dev <= 0.0 {
                    return Err(ConfigError::InvalidParameter {
                        condition: name,
                        field: "std_dev",
                        reason: "must be > 0".to_string(),
                    });
                }
                Ok(())
            }

            ConditionKind::AtrAboveAverage {
                atr_period,
                avg_period,
            }
            | ConditionKind::AtrBelowAverage {
                atr_period,
                avg_period,
            } => {
                positive("atr_period", atr_period)?;
                positive("avg_period", avg_period)
            }

            ConditionKind::CandleRangeContraction {
                lookback,
                avg_period,
                ratio,
            } => {
                positive("lookback", lookback)?;
                positive("avg_period", avg_period)?;
                finite("ratio", ratio)?;
                if ratio <= 0.0 {
                    return Err(ConfigError::InvalidParameter {
                        condition: name,
                        field: "ratio",
                        reason: "must be > 0".to_string(),
                    });
                }
                Ok(())
            }

            ConditionKind::RsiInRange {
                period,
                min_val,
                max_val,
            } => {
                positive("period", period)?;
                finite("min_val", min_val)?;
                finite("max_val", max_val)?;
                if min_val >= max_val {
                    return Err(ConfigError::InvalidParameter {
                        condition: name,
                        field: "min_val",
                        reason: format!("must be < max_val ({max_val})"),
                    });
                }
                Ok(())
            }

            ConditionKind::RsiOversold { period, threshold }
            | ConditionKind::RsiOverbought { period, threshold } => {
                positive("period", period)?;
                finite("threshold", threshold)
            }

            ConditionKind::MacdHistogramPositive { fast, slow, signal }
            | ConditionKind::MacdHistogramNegative { fast, slow, signal } => {
                positive("fast", fast)?;
                positive("slow", slow)?;
                positive("signal", signal)?;
                if fast >= slow {
                    return Err(ConfigError::InvalidParameter {
                        condition: name,
                        field: "fast",
                        reason: format!("must be < slow ({slow})"),
                    });
                }
                Ok(())
            }

            ConditionKind::RsiBullishDivergence { period, lookback } => {
                positive("period", period)?;
                positive("lookback", lookback)
            }

            ConditionKind::VolumeSpike {
                avg_period,
                multiplier,
            } => {
                positive("avg_period", avg_period)?;
                finite("multiplier", multiplier)?;
                if multiplier <= 0.0 {
                    return Err(ConfigError::InvalidParameter {
                        condition: name,
                        field: "multiplier",
                        reason: "must be > 0".to_string(),
                    });
                }
                Ok(())
            }

            ConditionKind::VolumeDeclining { candles }
            | ConditionKind::OpenInterestRising { candles } => positive("candles", candles),

            ConditionKind::FundingRateBelow { threshold }
            | ConditionKind::FundingRateAbove { threshold } => finite("threshold", threshold),
        }
    }

    /// Evaluate this condition against an enriched series.
    pub fn evaluate(&self, series: &mut EnrichedSeries) -> ConditionOutcome {
        if series.len() < 2 {
            return ConditionOutcome::Undefined;
        }

        match *self {
            ConditionKind::PriceAboveMa { period, ma_type } => {
                let col = series.ensure_ma(period, ma_type);
                match (series.last_value(&col), series.last_candle()) {
                    (Some(ma), Some(last)) => ConditionOutcome::from_bool(last.close > ma),
                    _ => ConditionOutcome::Undefined,
                }
            }

            ConditionKind::PriceBelowMa { period, ma_type } => {
                let col = series.ensure_ma(period, ma_type);
                match (series.last_value(&col), series.last_candle()) {
                    (Some(ma), Some(last)) => ConditionOutcome::from_bool(last.close < ma),
                    _ => ConditionOutcome::Undefined,
                }
            }

            ConditionKind::MaSlopeRising {
                period,
                ma_type,
                lookback,
            } => {
                let col = series.ensure_ma_slope(period, ma_type, lookback);
                match series.last_value(&col) {
                    Some(slope) => ConditionOutcome::from_bool(slope > 0.0),
                    None => ConditionOutcome::Undefined,
                }
            }

            ConditionKind::MaSlopeFalling {
                period,
                ma_type,
                lookback,
            } => {
                let col = series.ensure_ma_slope(period, ma_type, lookback);
                match series.last_value(&col) {
                    Some(slope) => ConditionOutcome::from_bool(slope < 0.0),
                    None => ConditionOutcome::Undefined,
                }
            }

            ConditionKind::EmaCrossoverBullish {
                fast_period,
                slow_period,
            } => evaluate_crossover(series, fast_period, slow_period, Crossover::Bullish),

            ConditionKind::EmaCrossoverBearish {
                fast_period,
                slow_period,
            } => evaluate_crossover(series, fast_period, slow_period, Crossover::Bearish),

            ConditionKind::HigherHighsHigherLows {
                lookback,
                min_swings,
            } => evaluate_swing_trend(series, lookback, min_swings, SwingTrend::Rising),

            ConditionKind::LowerHighsLowerLows {
                lookback,
                min_swings,
            } => evaluate_swing_trend(series, lookback, min_swings, SwingTrend::Falling),

            ConditionKind::BreakOfStructureBullish {
                lookback,
                swing_window,
            } => {
                if series.len() < lookback {
                    return ConditionOutcome::Undefined;
                }
                let candles = series.candles();
                let start = candles.len().saturating_sub(lookback + 1);
                let older = &candles[start..candles.len() - 1];
                let highs = swing_highs(
                    &older.iter().map(|c| c.high).collect::<Vec<_>>(),
                    swing_window,
                );
                match highs.last() {
                    Some(&last_swing_high) => ConditionOutcome::from_bool(
                        candles[candles.len() - 1].close > last_swing_high,
                    ),
                    None => ConditionOutcome::NotMet,
                }
            }

            ConditionKind::BreakOfStructureBearish {
                lookback,
                swing_window,
            } => {
                if series.len() < lookback {
                    return ConditionOutcome::Undefined;
                }
                let candles = series.candles();
                let start = candles.len().saturating_sub(lookback + 1);
                let older = &candles[start..candles.len() - 1];
                let lows = swing_lows(
                    &older.iter().map(|c| c.low).collect::<Vec<_>>(),
                    swing_window,
                );
                match lows.last() {
                    Some(&last_swing_low) => ConditionOutcome::from_bool(
                        candles[candles.len() - 1].close < last_swing_low,
                    ),
                    None => ConditionOutcome::NotMet,
                }
            }

            ConditionKind::PriceNearSupport {
                lookback,
                proximity_pct,
                swing_window,
            } => {
                if series.len() < 2 * swing_window + 1 {
                    return ConditionOutcome::Undefined;
                }
                let candles = series.candles();
                let start = candles.len().saturating_sub(lookback);
                let recent = &candles[start..];
                let lows = swing_lows(
                    &recent.iter().map(|c| c.low).collect::<Vec<_>>(),
                    swing_window,
                );
                if lows.is_empty() {
                    return ConditionOutcome::NotMet;
                }
                let price = candles[candles.len() - 1].close;
                let proximity = proximity_pct / 100.0;
                let near = lows
                    .iter()
                    .rev()
                    .any(|&level| level < price && (price - level) / price <= proximity);
                ConditionOutcome::from_bool(near)
            }

            ConditionKind::PriceNearResistance {
                lookback,
                proximity_pct,
                swing_window,
            } => {
                if series.len() < 2 * swing_window + 1 {
                    return ConditionOutcome::Undefined;
                }
                let candles = series.candles();
                let start = candles.len().saturating_sub(lookback);
                let recent = &candles[start..];
                let highs = swing_highs(
                    &recent.iter().map(|c| c.high).collect::<Vec<_>>(),
                    swing_window,
                );
                if highs.is_empty() {
                    return ConditionOutcome::NotMet;
                }
                let price = candles[candles.len() - 1].close;
                let proximity = proximity_pct / 100.0;
                let near = highs
                    .iter()
                    .rev()
                    .any(|&level| level > price && (level - price) / price <= proximity);
                ConditionOutcome::from_bool(near)
            }

            ConditionKind::BbSqueeze {
                period,
                std_dev,
                threshold,
            } => {
                let prefix = series.ensure_bollinger(period, std_dev);
                match series.last_value(&format!("{prefix}_bandwidth")) {
                    Some(bw) => ConditionOutcome::from_bool(bw < threshold),
                    None => ConditionOutcome::Undefined,
                }
            }

            ConditionKind::AtrAboveAverage {
                atr_period,
                avg_period,
            } => evaluate_atr_vs_average(series, atr_period, avg_period, Comparison::Above),

            ConditionKind::AtrBelowAverage {
                atr_period,
                avg_period,
            } => evaluate_atr_vs_average(series, atr_period, avg_period, Comparison::Below),

            ConditionKind::CandleRangeContraction {
                lookback,
                avg_period,
                ratio,
            } => {
                if series.len() < avg_period || series.len() < lookback {
                    return ConditionOutcome::Undefined;
                }
                let ranges: Vec<f64> = series.candles().iter().map(|c| c.high - c.low).collect();
                let avg_range: f64 =
                    ranges[ranges.len() - avg_period..].iter().sum::<f64>() / avg_period as f64;
                let recent_avg: f64 =
                    ranges[ranges.len() - lookback..].iter().sum::<f64>() / lookback as f64;
                if avg_range <= 0.0 {
                    return ConditionOutcome::Undefined;
                }
                ConditionOutcome::from_bool(recent_avg / avg_range < ratio)
            }

            ConditionKind::RsiInRange {
                period,
                min_val,
                max_val,
            } => {
                let col = series.ensure_rsi(period);
                match series.last_value(&col) {
                    Some(val) => ConditionOutcome::from_bool(val >= min_val && val <= max_val),
                    None => ConditionOutcome::Undefined,
                }
            }

            ConditionKind::RsiOversold { period, threshold } => {
                let col = series.ensure_rsi(period);
                match series.last_value(&col) {
                    Some(val) => ConditionOutcome::from_bool(val < threshold),
                    None => ConditionOutcome::Undefined,
                }
            }

            ConditionKind::RsiOverbought { period, threshold } => {
                let col = series.ensure_rsi(period);
                match series.last_value(&col) {
                    Some(val) => ConditionOutcome::from_bool(val > threshold),
                    None => ConditionOutcome::Undefined,
                }
            }

            ConditionKind::MacdHistogramPositive { fast, slow, signal } => {
                let col = series.ensure_macd(fast, slow, signal);
                match series.last_value(&col) {
                    Some(hist) => ConditionOutcome::from_bool(hist > 0.0),
                    None => ConditionOutcome::Undefined,
                }
            }

            ConditionKind::MacdHistogramNegative { fast, slow, signal } => {
                let col = series.ensure_macd(fast, slow, signal);
                match series.last_value(&col) {
                    Some(hist) => ConditionOutcome::from_bool(hist < 0.0),
                    None => ConditionOutcome::Undefined,
                }
            }

            ConditionKind::RsiBullishDivergence { period, lookback } => {
                evaluate_rsi_divergence(series, period, lookback)
            }

            ConditionKind::VolumeSpike {
                avg_period,
                multiplier,
            } => {
                let col = series.ensure_volume_sma(avg_period);
                let avg = match series.last_value(&col) {
                    Some(avg) if avg > 0.0 => avg,
                    Some(_) => return ConditionOutcome::Undefined,
                    None => return ConditionOutcome::Undefined,
                };
                let volume = series.last_candle().map(|c| c.volume).unwrap_or(0.0);
                ConditionOutcome::from_bool(volume > avg * multiplier)
            }

            ConditionKind::VolumeDeclining { candles } => {
                if series.len() < candles + 1 {
                    return ConditionOutcome::Undefined;
                }
                let volumes = series.volumes();
                let recent = &volumes[volumes.len() - candles - 1..];
                let declining = recent.windows(2).all(|w| w[1] < w[0]);
                ConditionOutcome::from_bool(declining)
            }

            // Funding conditions pass when no derivatives data exists for the
            // asset: missing data must not disqualify spot-only symbols.
            ConditionKind::FundingRateBelow { threshold } => match series.funding_rate {
                Some(rate) => ConditionOutcome::from_bool(rate < threshold),
                None => ConditionOutcome::Met,
            },

            ConditionKind::FundingRateAbove { threshold } => match series.funding_rate {
                Some(rate) => ConditionOutcome::from_bool(rate > threshold),
                None => ConditionOutcome::Met,
            },

            ConditionKind::OpenInterestRising { candles } => {
                let history = match &series.open_interest {
                    Some(history) if history.len() >= candles + 1 => history,
                    // Too little OI history to judge: pass, like funding.
                    _ => return ConditionOutcome::Met,
                };
                let recent = &history[history.len() - candles - 1..];
                let rising = recent.windows(2).all(|w| w[1] > w[0]);
                ConditionOutcome::from_bool(rising)
            }
        }
    }
}

enum Crossover {
    Bullish,
    Bearish,
}

fn evaluate_crossover(
    series: &mut EnrichedSeries,
    fast_period: usize,
    slow_period: usize,
    side: Crossover,
) -> ConditionOutcome {
    let fast_col = series.ensure_ma(fast_period, MaType::Ema);
    let slow_col = series.ensure_ma(slow_period, MaType::Ema);

    let last = series.len() - 1;
    let values = (
        series.value_at(&fast_col, last),
        series.value_at(&slow_col, last),
        series.value_at(&fast_col, last - 1),
        series.value_at(&slow_col, last - 1),
    );

    match values {
        (Some(cur_fast), Some(cur_slow), Some(prev_fast), Some(prev_slow)) => {
            let crossed = match side {
                Crossover::Bullish => prev_fast <= prev_slow && cur_fast > cur_slow,
                Crossover::Bearish => prev_fast >= prev_slow && cur_fast < cur_slow,
            };
            ConditionOutcome::from_bool(crossed)
        }
        _ => ConditionOutcome::Undefined,
    }
}

enum SwingTrend {
    Rising,
    Falling,
}

fn evaluate_swing_trend(
    series: &EnrichedSeries,
    lookback: usize,
    min_swings: usize,
    trend: SwingTrend,
) -> ConditionOutcome {
    let candles = series.candles();
    let start = candles.len().saturating_sub(lookback);
    let recent = &candles[start..];
    if recent.len() < STRUCTURE_MIN_BARS {
        return ConditionOutcome::Undefined;
    }

    let highs = swing_highs(
        &recent.iter().map(|c| c.high).collect::<Vec<_>>(),
        STRUCTURE_SWING_WINDOW,
    );
    let lows = swing_lows(
        &recent.iter().map(|c| c.low).collect::<Vec<_>>(),
        STRUCTURE_SWING_WINDOW,
    );

    if highs.len() < min_swings || lows.len() < min_swings {
        return ConditionOutcome::NotMet;
    }

    let matched = match trend {
        SwingTrend::Rising => {
            highs.windows(2).all(|w| w[0] < w[1]) && lows.windows(2).all(|w| w[0] < w[1])
        }
        SwingTrend::Falling => {
            highs.windows(2).all(|w| w[0] > w[1]) && lows.windows(2).all(|w| w[0] > w[1])
        }
    };
    ConditionOutcome::from_bool(matched)
}

enum Comparison {
    Above,
    Below,
}

fn evaluate_atr_vs_average(
    series: &mut EnrichedSeries,
    atr_period: usize,
    avg_period: usize,
    comparison: Comparison,
) -> ConditionOutcome {
    let col = series.ensure_atr(atr_period);
    let atr_column = match series.column(&col) {
        Some(column) => column.to_vec(),
        None => return ConditionOutcome::Undefined,
    };
    let averages = crate::indicators::rolling_mean(&atr_column, avg_period);

    match (atr_column.last().copied().flatten(), averages.last().copied().flatten()) {
        (Some(atr), Some(avg)) => ConditionOutcome::from_bool(match comparison {
            Comparison::Above => atr > avg,
            Comparison::Below => atr < avg,
        }),
        _ => ConditionOutcome::Undefined,
    }
}

fn evaluate_rsi_divergence(
    series: &mut EnrichedSeries,
    period: usize,
    lookback: usize,
) -> ConditionOutcome {
    if series.len() < lookback {
        return ConditionOutcome::Undefined;
    }
    let col = series.ensure_rsi(period);

    let start = series.len() - lookback;
    let rsi_window: Option<Vec<f64>> = series.column(&col).and_then(|column| {
        column[start..]
            .iter()
            .copied()
            .collect::<Option<Vec<f64>>>()
    });
    let rsi_window = match rsi_window {
        Some(values) => values,
        None => return ConditionOutcome::Undefined,
    };

    let closes: Vec<f64> = series.candles()[start..].iter().map(|c| c.close).collect();

    let price_lows: Vec<f64> = swing_low_indices(&closes, STRUCTURE_SWING_WINDOW)
        .into_iter()
        .map(|i| closes[i])
        .collect();
    let rsi_low_indices = swing_low_indices(&rsi_window, STRUCTURE_SWING_WINDOW);

    if price_lows.len() < 2 || rsi_low_indices.len() < 2 {
        return ConditionOutcome::NotMet;
    }

    let price_lower_low = price_lows[price_lows.len() - 1] < price_lows[price_lows.len() - 2];
    let rsi_higher_low = rsi_window[rsi_low_indices[rsi_low_indices.len() - 1]]
        > rsi_window[rsi_low_indices[rsi_low_indices.len() - 2]];

    ConditionOutcome::from_bool(price_lower_low && rsi_higher_low)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Candle;
    use chrono::{Duration, Utc};
    use serde_json::json;

    fn series_from_closes(closes: &[f64]) -> EnrichedSeries {
        let start = Utc::now() - Duration::days(closes.len() as i64);
        let candles = closes
            .iter()
            .enumerate()
            .map(|(i, &close)| Candle {
                datetime: start + Duration::days(i as i64),
                open: close,
                high: close + 1.0,
                low: close - 1.0,
                close,
                volume: 1000.0,
            })
            .collect();
        EnrichedSeries::new(candles)
    }

    #[test]
    fn test_parse_with_defaults() {
        let kind = ConditionKind::from_parts("price_above_ma", &json!({})).unwrap();
        assert_eq!(
            kind,
            ConditionKind::PriceAboveMa {
                period: 50,
                ma_type: MaType::Ema,
            }
        );
    }

    #[test]
    fn test_parse_overrides() {
        let kind =
            ConditionKind::from_parts("rsi_oversold", &json!({"period": 7, "threshold": 25}))
                .unwrap();
        assert_eq!(
            kind,
            ConditionKind::RsiOversold {
                period: 7,
                threshold: 25.0,
            }
        );
    }

    #[test]
    fn test_unknown_condition_type_rejected() {
        let err = ConditionKind::from_parts("price_above_vwap", &json!({})).unwrap_err();
        assert!(matches!(err, ConfigError::Malformed(_)));
    }

    #[test]
    fn test_invalid_parameters_rejected() {
        let err = ConditionKind::from_parts(
            "ema_crossover_bullish",
            &json!({"fast_period": 50, "slow_period": 20}),
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidParameter { .. }));

        let err = ConditionKind::from_parts("price_above_ma", &json!({"period": 0})).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidParameter { .. }));
    }

    #[test]
    fn test_price_above_ma_met() {
        let closes: Vec<f64> = (0..60).map(|i| 100.0 + i as f64).collect();
        let mut series = series_from_closes(&closes);
        let kind = ConditionKind::PriceAboveMa {
            period: 20,
            ma_type: MaType::Ema,
        };
        assert_eq!(kind.evaluate(&mut series), ConditionOutcome::Met);
    }

    #[test]
    fn test_insufficient_history_is_undefined_not_false() {
        // 50 bars cannot satisfy a 200-period moving average
        let closes: Vec<f64> = (0..50).map(|i| 100.0 + i as f64).collect();
        let mut series = series_from_closes(&closes);
        let kind = ConditionKind::PriceAboveMa {
            period: 200,
            ma_type: MaType::Ema,
        };
        assert_eq!(kind.evaluate(&mut series), ConditionOutcome::Undefined);

        // ...while an explicit miss is NotMet
        let falling: Vec<f64> = (0..60).map(|i| 200.0 - i as f64).collect();
        let mut series = series_from_closes(&falling);
        let kind = ConditionKind::PriceAboveMa {
            period: 20,
            ma_type: MaType::Ema,
        };
        assert_eq!(kind.evaluate(&mut series), ConditionOutcome::NotMet);
    }

    #[test]
    fn test_rsi_overbought_in_uptrend() {
        let closes: Vec<f64> = (0..40).map(|i| 100.0 + i as f64 * 2.0).collect();
        let mut series = series_from_closes(&closes);
        let kind = ConditionKind::RsiOverbought {
            period: 14,
            threshold: 70.0,
        };
        assert_eq!(kind.evaluate(&mut series), ConditionOutcome::Met);
    }

    #[test]
    fn test_ema_crossover_bullish() {
        // Long decline then a sharp rally pushes the fast EMA through the slow
        let mut closes: Vec<f64> = (0..60).map(|i| 200.0 - i as f64).collect();
        closes.extend((0..12).map(|i| 140.0 + i as f64 * 12.0));
        let mut series = series_from_closes(&closes);
        let kind = ConditionKind::EmaCrossoverBullish {
            fast_period: 5,
            slow_period: 20,
        };
        // Scan the rally bar by bar; the crossover must fire exactly once
        let mut fired = 0;
        for end in 61..=closes.len() {
            let mut window = series_from_closes(&closes[..end]);
            if kind.evaluate(&mut window) == ConditionOutcome::Met {
                fired += 1;
            }
        }
        assert_eq!(fired, 1);
        // The full series no longer reports a fresh crossover
        assert_eq!(kind.evaluate(&mut series), ConditionOutcome::NotMet);
    }

    #[test]
    fn test_higher_highs_higher_lows() {
        // Rising zig-zag: each swing high and swing low above the last
        let closes = vec![
            100.0, 104.0, 108.0, 104.0, 100.0, 98.0, 104.0, 108.0, 112.0, 108.0, 104.0, 102.0,
            108.0, 112.0, 116.0, 112.0, 108.0, 106.0, 112.0, 116.0,
        ];
        let mut series = series_from_closes(&closes);
        let kind = ConditionKind::HigherHighsHigherLows {
            lookback: 20,
            min_swings: 2,
        };
        assert_eq!(kind.evaluate(&mut series), ConditionOutcome::Met);

        let mut short = series_from_closes(&closes[..5]);
        assert_eq!(kind.evaluate(&mut short), ConditionOutcome::Undefined);
    }

    #[test]
    fn test_volume_declining() {
        let closes: Vec<f64> = (0..10).map(|_| 100.0).collect();
        let mut candles = series_from_closes(&closes).candles().to_vec();
        for (i, candle) in candles.iter_mut().enumerate() {
            candle.volume = 1000.0 - (i as f64 * 50.0);
        }
        let mut series = EnrichedSeries::new(candles);
        let kind = ConditionKind::VolumeDeclining { candles: 3 };
        assert_eq!(kind.evaluate(&mut series), ConditionOutcome::Met);
    }

    #[test]
    fn test_funding_conditions_pass_without_data() {
        let closes: Vec<f64> = (0..10).map(|i| 100.0 + i as f64).collect();
        let mut series = series_from_closes(&closes);
        let kind = ConditionKind::FundingRateBelow { threshold: 0.01 };
        assert_eq!(kind.evaluate(&mut series), ConditionOutcome::Met);

        series.funding_rate = Some(0.05);
        assert_eq!(kind.evaluate(&mut series), ConditionOutcome::NotMet);
        series.funding_rate = Some(0.001);
        assert_eq!(kind.evaluate(&mut series), ConditionOutcome::Met);
    }

    #[test]
    fn test_open_interest_rising() {
        let closes: Vec<f64> = (0..10).map(|i| 100.0 + i as f64).collect();
        let mut series = series_from_closes(&closes);
        series.open_interest = Some(vec![10.0, 11.0, 12.0, 13.0]);
        let kind = ConditionKind::OpenInterestRising { candles: 3 };
        assert_eq!(kind.evaluate(&mut series), ConditionOutcome::Met);

        series.open_interest = Some(vec![13.0, 12.0, 11.0, 10.0]);
        assert_eq!(kind.evaluate(&mut series), ConditionOutcome::NotMet);

        // Not enough history to judge: pass like the funding family
        series.open_interest = Some(vec![10.0]);
        assert_eq!(kind.evaluate(&mut series), ConditionOutcome::Met);
    }

    #[test]
    fn test_params_json_roundtrip() {
        let kind = ConditionKind::BbSqueeze {
            period: 20,
            std_dev: 2.0,
            threshold: 0.04,
        };
        let params = kind.params_json();
        let parsed = ConditionKind::from_parts("bb_squeeze", &params).unwrap();
        assert_eq!(parsed, kind);
    }
}
