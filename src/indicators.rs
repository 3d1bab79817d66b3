//! Technical indicator primitives
//!
//! Pure functions over price/volume slices. Rows with insufficient lookback
//! yield `None` rather than an error; callers map that to an "undefined"
//! evaluation result.

/// Calculate Simple Moving Average
pub fn sma(values: &[f64], period: usize) -> Vec<Option<f64>> {
    let mut result = Vec::with_capacity(values.len());

    for i in 0..values.len() {
        if period == 0 || i + 1 < period {
            result.push(None);
        } else {
            let sum: f64 = values[i + 1 - period..=i].iter().sum();
            result.push(Some(sum / period as f64));
        }
    }

    result
}

/// Calculate Exponential Moving Average, seeded with the SMA of the first
/// `period` values.
pub fn ema(values: &[f64], period: usize) -> Vec<Option<f64>> {
    let mut result = Vec::with_capacity(values.len());

    if values.is_empty() || period == 0 {
        return vec![None; values.len()];
    }

    let multiplier = 2.0 / (period as f64 + 1.0);
    let mut ema_value: Option<f64> = None;

    for (i, &value) in values.iter().enumerate() {
        if i + 1 < period {
            result.push(None);
        } else if i + 1 == period {
            let sum: f64 = values[0..period].iter().sum();
            ema_value = Some(sum / period as f64);
            result.push(ema_value);
        } else if let Some(prev) = ema_value {
            let next = (value - prev) * multiplier + prev;
            ema_value = Some(next);
            result.push(Some(next));
        }
    }

    result
}

/// EMA over a series that starts with undefined rows (e.g. a MACD line).
/// The leading `None` prefix is preserved and the EMA warms up after it.
pub fn ema_over_options(values: &[Option<f64>], period: usize) -> Vec<Option<f64>> {
    let first_defined = match values.iter().position(|v| v.is_some()) {
        Some(i) => i,
        None => return vec![None; values.len()],
    };

    let defined: Vec<f64> = values[first_defined..].iter().filter_map(|v| *v).collect();
    let tail = ema(&defined, period);

    let mut result = vec![None; first_defined];
    result.extend(tail);
    result.resize(values.len(), None);
    result
}

/// Calculate True Range
pub fn true_range(high: &[f64], low: &[f64], close: &[f64]) -> Vec<f64> {
    let mut tr = Vec::with_capacity(high.len());

    for i in 0..high.len() {
        let tr_value = if i == 0 {
            high[i] - low[i]
        } else {
            let hl = high[i] - low[i];
            let hc = (high[i] - close[i - 1]).abs();
            let lc = (low[i] - close[i - 1]).abs();
            hl.max(hc).max(lc)
        };
        tr.push(tr_value);
    }

    tr
}

/// Calculate Average True Range (EMA-smoothed true range)
pub fn atr(high: &[f64], low: &[f64], close: &[f64], period: usize) -> Vec<Option<f64>> {
    let tr = true_range(high, low, close);
    ema(&tr, period)
}

/// Calculate RSI with Wilder smoothing
pub fn rsi(values: &[f64], period: usize) -> Vec<Option<f64>> {
    let mut result = vec![None; values.len()];
    if values.len() <= period || period == 0 {
        return result;
    }

    let mut gains = Vec::with_capacity(values.len());
    let mut losses = Vec::with_capacity(values.len());
    gains.push(0.0);
    losses.push(0.0);

    for i in 1..values.len() {
        let change = values[i] - values[i - 1];
        gains.push(change.max(0.0));
        losses.push((-change).max(0.0));
    }

    let mut avg_gain: f64 = gains[1..=period].iter().sum::<f64>() / period as f64;
    let mut avg_loss: f64 = losses[1..=period].iter().sum::<f64>() / period as f64;
    result[period] = Some(rsi_from_averages(avg_gain, avg_loss));

    for i in period + 1..values.len() {
        avg_gain = (avg_gain * (period as f64 - 1.0) + gains[i]) / period as f64;
        avg_loss = (avg_loss * (period as f64 - 1.0) + losses[i]) / period as f64;
        result[i] = Some(rsi_from_averages(avg_gain, avg_loss));
    }

    result
}

fn rsi_from_averages(avg_gain: f64, avg_loss: f64) -> f64 {
    if avg_loss == 0.0 {
        return 100.0;
    }
    let rs = avg_gain / avg_loss;
    100.0 - (100.0 / (1.0 + rs))
}

/// Calculate MACD line, signal line, and histogram
pub fn macd(
    values: &[f64],
    fast: usize,
    slow: usize,
    signal: usize,
) -> (Vec<Option<f64>>, Vec<Option<f64>>, Vec<Option<f64>>) {
    let ema_fast = ema(values, fast);
    let ema_slow = ema(values, slow);

    let line: Vec<Option<f64>> = ema_fast
        .iter()
        .zip(&ema_slow)
        .map(|(f, s)| match (f, s) {
            (Some(f), Some(s)) => Some(f - s),
            _ => None,
        })
        .collect();

    let signal_line = ema_over_options(&line, signal);

    let hist: Vec<Option<f64>> = line
        .iter()
        .zip(&signal_line)
        .map(|(l, s)| match (l, s) {
            (Some(l), Some(s)) => Some(l - s),
            _ => None,
        })
        .collect();

    (line, signal_line, hist)
}

/// Calculate Bollinger Bands (upper, middle, lower) using sample standard
/// deviation over the rolling window.
pub fn bollinger_bands(
    values: &[f64],
    period: usize,
    num_std: f64,
) -> (Vec<Option<f64>>, Vec<Option<f64>>, Vec<Option<f64>>) {
    let middle = sma(values, period);
    let mut upper = Vec::with_capacity(values.len());
    let mut lower = Vec::with_capacity(values.len());

    for i in 0..values.len() {
        match middle[i] {
            Some(mid) if period > 1 => {
                let window = &values[i + 1 - period..=i];
                let variance: f64 = window
                    .iter()
                    .map(|&x| {
                        let diff = x - mid;
                        diff * diff
                    })
                    .sum::<f64>()
                    / (period as f64 - 1.0);
                let std_dev = variance.sqrt();

                upper.push(Some(mid + num_std * std_dev));
                lower.push(Some(mid - num_std * std_dev));
            }
            _ => {
                upper.push(None);
                lower.push(None);
            }
        }
    }

    (upper, middle, lower)
}

/// Difference over a lookback: `out[i] = v[i] - v[i - lookback]`.
/// Used for moving-average slope.
pub fn diff_over(values: &[Option<f64>], lookback: usize) -> Vec<Option<f64>> {
    let mut result = vec![None; values.len()];
    if lookback == 0 {
        return result;
    }
    for i in lookback..values.len() {
        if let (Some(cur), Some(prev)) = (values[i], values[i - lookback]) {
            result[i] = Some(cur - prev);
        }
    }
    result
}

/// Rolling mean over an already-partial series. A window containing any
/// undefined row is itself undefined.
pub fn rolling_mean(values: &[Option<f64>], period: usize) -> Vec<Option<f64>> {
    let mut result = vec![None; values.len()];
    if period == 0 {
        return result;
    }
    for i in 0..values.len() {
        if i + 1 < period {
            continue;
        }
        let window = &values[i + 1 - period..=i];
        if window.iter().all(|v| v.is_some()) {
            let sum: f64 = window.iter().filter_map(|v| *v).sum();
            result[i] = Some(sum / period as f64);
        }
    }
    result
}

// =============================================================================
// Swing structure
// =============================================================================
//
// A bar is a swing high (low) when its value is >= (<=) every value within
// `window` bars on both sides. Ties count as swings, so the detection is
// deterministic for flat stretches.

/// Indices of swing highs in `values`.
pub fn swing_high_indices(values: &[f64], window: usize) -> Vec<usize> {
    pivot_indices(values, window, |center, other| center >= other)
}

/// Indices of swing lows in `values`.
pub fn swing_low_indices(values: &[f64], window: usize) -> Vec<usize> {
    pivot_indices(values, window, |center, other| center <= other)
}

/// Swing high values, in chronological order.
pub fn swing_highs(values: &[f64], window: usize) -> Vec<f64> {
    swing_high_indices(values, window)
        .into_iter()
        .map(|i| values[i])
        .collect()
}

/// Swing low values, in chronological order.
pub fn swing_lows(values: &[f64], window: usize) -> Vec<f64> {
    swing_low_indices(values, window)
        .into_iter()
        .map(|i| values[i])
        .collect()
}

fn pivot_indices(values: &[f64], window: usize, dominates: fn(f64, f64) -> bool) -> Vec<usize> {
    let mut indices = Vec::new();
    if values.len() < 2 * window + 1 {
        return indices;
    }

    for i in window..values.len() - window {
        let center = values[i];
        let is_pivot = (1..=window)
            .all(|j| dominates(center, values[i - j]) && dominates(center, values[i + j]));
        if is_pivot {
            indices.push(i);
        }
    }

    indices
}
