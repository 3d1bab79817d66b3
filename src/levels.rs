//! Key level calculation: entry, stop-loss, take-profit targets
//!
//! ATR-based levels refined by recent swing structure. Guarantees the stop
//! sits on the losing side of entry and targets progress strictly in the
//! winning direction; when that ordering cannot be produced the candidate
//! is dropped (`None`) rather than emitting an inverted level set.

use tracing::debug;

use crate::conditions::STRUCTURE_SWING_WINDOW;
use crate::indicators::{swing_highs, swing_lows};
use crate::series::EnrichedSeries;
use crate::types::Direction;

/// Bars of recent structure considered when placing levels.
const STRUCTURE_LOOKBACK: usize = 50;

/// ATR fallback as a fraction of price when no ATR is computable.
const ATR_FALLBACK_PCT: f64 = 0.02;

/// Computed price levels for a candidate setup.
#[derive(Debug, Clone, PartialEq)]
pub struct KeyLevels {
    pub entry_price: f64,
    pub stop_loss: f64,
    pub take_profit_1: f64,
    pub take_profit_2: f64,
    pub take_profit_3: f64,
    pub risk_reward: f64,
}

/// Calculate entry/stop/target levels for a setup on the entry timeframe.
///
/// Returns `None` when no internally consistent level set exists for the
/// given inputs (degenerate price or volatility data).
pub fn calculate_key_levels(
    series: &mut EnrichedSeries,
    direction: Direction,
    current_price: f64,
) -> Option<KeyLevels> {
    if !current_price.is_finite() || current_price <= 0.0 {
        debug!("rejecting level calculation for non-positive price {current_price}");
        return None;
    }

    let atr_col = series.ensure_atr(14);
    let atr = match series.last_value(&atr_col) {
        Some(atr) if atr > 0.0 && atr.is_finite() => atr,
        _ => current_price * ATR_FALLBACK_PCT,
    };

    let candles = series.candles();
    let start = candles.len().saturating_sub(STRUCTURE_LOOKBACK);
    let recent = &candles[start..];
    let highs: Vec<f64> = recent.iter().map(|c| c.high).collect();
    let lows: Vec<f64> = recent.iter().map(|c| c.low).collect();
    let swing_highs = swing_highs(&highs, STRUCTURE_SWING_WINDOW);
    let swing_lows = swing_lows(&lows, STRUCTURE_SWING_WINDOW);

    let levels = match direction.scan_side() {
        Direction::Short => short_levels(current_price, atr, &swing_highs, &swing_lows),
        _ => long_levels(current_price, atr, &swing_highs, &swing_lows),
    };

    if levels.is_none() {
        debug!(
            price = current_price,
            atr,
            direction = %direction,
            "no valid level set for candidate"
        );
    }
    levels
}

fn long_levels(
    price: f64,
    atr: f64,
    swing_highs: &[f64],
    swing_lows: &[f64],
) -> Option<KeyLevels> {
    let entry = price;

    // Stop below the most recent swing low under price, with a small ATR
    // buffer; fall back to a pure volatility stop.
    let mut stop = swing_lows
        .iter()
        .rev()
        .find(|&&low| low < price)
        .map(|&low| low - atr * 0.2)
        .unwrap_or(price - atr * 1.5);

    if entry - stop <= 0.0 {
        stop = entry - atr * 1.5;
    }
    let risk = entry - stop;
    if !(risk > 0.0) || stop <= 0.0 {
        return None;
    }

    // Targets at 1.5R / 2.5R / 4R, snapped outward to nearby resistance
    let mut above: Vec<f64> = swing_highs.iter().copied().filter(|&h| h > price).collect();
    above.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

    let mut tp1 = entry + risk * 1.5;
    if let Some(&first) = above.first() {
        tp1 = tp1.max(first);
    }
    let mut tp2 = entry + risk * 2.5;
    if let Some(&second) = above.get(1) {
        tp2 = tp2.max(second);
    }
    if tp2 <= tp1 {
        tp2 = tp1 + risk;
    }
    let mut tp3 = entry + risk * 4.0;
    if tp3 <= tp2 {
        tp3 = tp2 + risk * 1.5;
    }

    finalize(entry, stop, tp1, tp2, tp3, risk, Direction::Long)
}

fn short_levels(
    price: f64,
    atr: f64,
    swing_highs: &[f64],
    swing_lows: &[f64],
) -> Option<KeyLevels> {
    let entry = price;

    let mut stop = swing_highs
        .iter()
        .find(|&&high| high > price)
        .map(|&high| high + atr * 0.2)
        .unwrap_or(price + atr * 1.5);

    if stop - entry <= 0.0 {
        stop = entry + atr * 1.5;
    }
    let risk = stop - entry;
    if !(risk > 0.0) {
        return None;
    }

    let mut below: Vec<f64> = swing_lows.iter().copied().filter(|&l| l < price).collect();
    below.sort_by(|a, b| b.partial_cmp(a).unwrap_or(std::cmp::Ordering::Equal));

    let mut tp1 = entry - risk * 1.5;
    if let Some(&first) = below.first() {
        tp1 = tp1.min(first);
    }
    let mut tp2 = entry - risk * 2.5;
    if let Some(&second) = below.get(1) {
        tp2 = tp2.min(second);
    }
    if tp2 >= tp1 {
        tp2 = tp1 - risk;
    }
    let mut tp3 = entry - risk * 4.0;
    if tp3 >= tp2 {
        tp3 = tp2 - risk * 1.5;
    }

    // Targets through zero are not placeable
    if tp1 <= 0.0 || tp2 <= 0.0 || tp3 <= 0.0 {
        return None;
    }

    finalize(entry, stop, tp1, tp2, tp3, risk, Direction::Short)
}

fn finalize(
    entry: f64,
    stop: f64,
    tp1: f64,
    tp2: f64,
    tp3: f64,
    risk: f64,
    direction: Direction,
) -> Option<KeyLevels> {
    let values = [entry, stop, tp1, tp2, tp3, risk];
    if values.iter().any(|v| !v.is_finite()) {
        return None;
    }

    let ordered = match direction {
        Direction::Short => stop > entry && entry > tp1 && tp1 > tp2 && tp2 > tp3,
        _ => stop < entry && entry < tp1 && tp1 < tp2 && tp2 < tp3,
    };
    if !ordered {
        return None;
    }

    let risk_reward = (tp1 - entry).abs() / risk;

    Some(KeyLevels {
        entry_price: entry,
        stop_loss: stop,
        take_profit_1: tp1,
        take_profit_2: tp2,
        take_profit_3: tp3,
        risk_reward,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Candle;
    use approx::assert_relative_eq;
    use chrono::{Duration, Utc};

    fn series_from_ohlc(rows: &[(f64, f64, f64)]) -> EnrichedSeries {
        let start = Utc::now() - Duration::days(rows.len() as i64);
        let candles = rows
            .iter()
            .enumerate()
            .map(|(i, &(high, low, close))| Candle {
                datetime: start + Duration::days(i as i64),
                open: close,
                high,
                low,
                close,
                volume: 1000.0,
            })
            .collect();
        EnrichedSeries::new(candles)
    }

    fn flat_series(price: f64, count: usize) -> EnrichedSeries {
        let rows: Vec<(f64, f64, f64)> = (0..count)
            .map(|_| (price * 1.01, price * 0.99, price))
            .collect();
        series_from_ohlc(&rows)
    }

    #[test]
    fn test_long_level_ordering() {
        let mut series = flat_series(100.0, 60);
        let levels = calculate_key_levels(&mut series, Direction::Long, 100.0).unwrap();

        assert!(levels.stop_loss < levels.entry_price);
        assert!(levels.entry_price < levels.take_profit_1);
        assert!(levels.take_profit_1 < levels.take_profit_2);
        assert!(levels.take_profit_2 < levels.take_profit_3);
        assert!(levels.risk_reward > 0.0);
    }

    #[test]
    fn test_short_level_ordering() {
        let mut series = flat_series(100.0, 60);
        let levels = calculate_key_levels(&mut series, Direction::Short, 100.0).unwrap();

        assert!(levels.stop_loss > levels.entry_price);
        assert!(levels.entry_price > levels.take_profit_1);
        assert!(levels.take_profit_1 > levels.take_profit_2);
        assert!(levels.take_profit_2 > levels.take_profit_3);
    }

    #[test]
    fn test_default_r_multiples_without_structure() {
        // Flat series: no resistance overrides the defaults, so targets land
        // at 1.5R / 2.5R / 4R exactly.
        let mut series = flat_series(100.0, 60);
        let levels = calculate_key_levels(&mut series, Direction::Long, 100.0).unwrap();
        let risk = levels.entry_price - levels.stop_loss;

        assert_relative_eq!(
            levels.take_profit_1,
            levels.entry_price + risk * 1.5,
            epsilon = 1e-9
        );
        assert_relative_eq!(
            levels.take_profit_2,
            levels.entry_price + risk * 2.5,
            epsilon = 1e-9
        );
        assert_relative_eq!(
            levels.take_profit_3,
            levels.entry_price + risk * 4.0,
            epsilon = 1e-9
        );
        assert_relative_eq!(levels.risk_reward, 1.5, epsilon = 1e-9);
    }

    #[test]
    fn test_degenerate_price_rejected() {
        let mut series = flat_series(100.0, 60);
        assert!(calculate_key_levels(&mut series, Direction::Long, f64::NAN).is_none());
        assert!(calculate_key_levels(&mut series, Direction::Long, 0.0).is_none());
    }

    #[test]
    fn test_short_targets_through_zero_rejected() {
        // Tiny price with a distant swing high above: risk dwarfs the price,
        // pushing targets below zero.
        let mut rows: Vec<(f64, f64, f64)> = (0..30).map(|_| (1.02, 0.98, 1.0)).collect();
        rows[5] = (9.0, 0.98, 1.0);
        let mut series = series_from_ohlc(&rows);
        assert!(calculate_key_levels(&mut series, Direction::Short, 1.0).is_none());
    }

    #[test]
    fn test_swing_low_refines_long_stop() {
        // The most recent swing low (90, near the end) pulls the stop under it
        let mut rows: Vec<(f64, f64, f64)> = (0..30).map(|_| (101.0, 99.0, 100.0)).collect();
        rows[26] = (95.0, 90.0, 94.0);
        let mut series = series_from_ohlc(&rows);
        let levels = calculate_key_levels(&mut series, Direction::Long, 100.0).unwrap();
        assert!(levels.stop_loss < 90.0);
    }
}
