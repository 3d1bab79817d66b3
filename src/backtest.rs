//! Strategy backtester
//!
//! Replays historical data through the same condition and level logic the
//! live scanner uses. At every bar where all required conditions pass, a
//! candidate setup is generated and its outcome simulated forward bar by bar
//! until stop, first target, or the holding horizon. Simulation never reads
//! bars at or before the signal bar.

use anyhow::Result;
use chrono::{DateTime, Utc};
use indicatif::{ParallelProgressIterator, ProgressBar, ProgressStyle};
use rayon::prelude::*;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::conditions::ConditionOutcome;
use crate::config::BacktestConfig;
use crate::levels::{calculate_key_levels, KeyLevels};
use crate::market::MarketData;
use crate::series::EnrichedSeries;
use crate::store::Strategy;
use crate::types::{Candle, Direction, Symbol, Timeframe};

/// Setup details kept in the report; statistics always cover the full run
const REPORT_DETAIL_CAP: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TradeOutcome {
    Win,
    Loss,
    Expired,
}

impl TradeOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            TradeOutcome::Win => "win",
            TradeOutcome::Loss => "loss",
            TradeOutcome::Expired => "expired",
        }
    }
}

/// One simulated candidate setup and its outcome
#[derive(Debug, Clone, Serialize)]
pub struct SimulatedSetup {
    pub symbol: Symbol,
    pub entry_time: DateTime<Utc>,
    pub entry_price: f64,
    pub stop_loss: f64,
    pub take_profit_1: f64,
    pub take_profit_2: f64,
    pub risk_reward: f64,
    pub outcome: TradeOutcome,
    pub exit_price: f64,
    pub pnl_r: f64,
    pub bars_held: usize,
}

/// Aggregated backtest statistics
#[derive(Debug, Clone, Serialize)]
pub struct BacktestReport {
    pub strategy_name: String,
    pub direction: Direction,
    pub timeframe: Timeframe,
    pub symbols_tested: usize,
    pub total_setups: usize,
    pub wins: usize,
    pub losses: usize,
    /// Percent of setups that reached the first target
    pub win_rate: f64,
    pub avg_r: f64,
    /// Worst trough of the chronological cumulative-R curve
    pub max_drawdown: f64,
    pub setups_per_month: f64,
    pub equity_curve: Vec<f64>,
    pub setups: Vec<SimulatedSetup>,
}

pub struct Backtester {
    market: Arc<dyn MarketData>,
    config: BacktestConfig,
}

impl Backtester {
    pub fn new(market: Arc<dyn MarketData>, config: BacktestConfig) -> Self {
        Backtester { market, config }
    }

    /// Backtest a strategy over the given symbols on a primary timeframe.
    pub async fn run(
        &self,
        strategy: &Strategy,
        timeframe: Timeframe,
        symbols: &[Symbol],
    ) -> Result<BacktestReport> {
        anyhow::ensure!(
            !strategy.conditions.is_empty(),
            "strategy '{}' has no conditions to test",
            strategy.name
        );

        let mut timeframes: BTreeSet<Timeframe> =
            strategy.conditions.iter().map(|c| c.timeframe).collect();
        timeframes.insert(timeframe);

        // History fetch is sequential and rate-limited; a symbol missing any
        // timeframe is skipped, not fatal.
        let mut fetched: Vec<(Symbol, BTreeMap<Timeframe, Vec<Candle>>)> = Vec::new();
        for symbol in symbols {
            let mut per_tf = BTreeMap::new();
            let mut complete = true;
            for &tf in &timeframes {
                match self
                    .market
                    .ohlcv_history(symbol, tf, self.config.lookback_bars)
                    .await
                {
                    Ok(candles) if !candles.is_empty() => {
                        per_tf.insert(tf, candles);
                    }
                    Ok(_) => {
                        complete = false;
                        break;
                    }
                    Err(e) => {
                        warn!("skipping {symbol} in backtest: {e}");
                        complete = false;
                        break;
                    }
                }
            }
            if complete {
                fetched.push((symbol.clone(), per_tf));
            }
        }

        // Outcome simulation is CPU-bound and independent per symbol
        let progress = ProgressBar::new(fetched.len() as u64).with_style(
            ProgressStyle::with_template("{bar:40} {pos}/{len} symbols {elapsed}")
                .expect("valid progress template"),
        );
        let direction = strategy.direction.scan_side();
        let config = &self.config;

        let setups: Vec<SimulatedSetup> = fetched
            .into_par_iter()
            .progress_with(progress)
            .flat_map_iter(|(symbol, data)| {
                simulate_symbol(strategy, &symbol, direction, timeframe, data, config)
            })
            .collect();

        Ok(compile_report(
            &strategy.name,
            direction,
            timeframe,
            symbols.len(),
            setups,
        ))
    }
}

/// Walk one symbol's history, generating and resolving candidate setups.
fn simulate_symbol(
    strategy: &Strategy,
    symbol: &Symbol,
    direction: Direction,
    primary_tf: Timeframe,
    data: BTreeMap<Timeframe, Vec<Candle>>,
    config: &BacktestConfig,
) -> Vec<SimulatedSetup> {
    let primary = match data.get(&primary_tf) {
        Some(candles) => candles,
        None => return Vec::new(),
    };
    if primary.len() <= config.evaluation_window + config.forward_window {
        debug!(
            "{symbol}: only {} bars of {primary_tf} history, skipping",
            primary.len()
        );
        return Vec::new();
    }

    let mut setups = Vec::new();

    for i in config.evaluation_window..primary.len() - config.forward_window {
        let signal_time = primary[i].datetime;

        // Required conditions see only data at or before the signal bar
        let mut all_required_met = true;
        for condition in strategy.conditions.iter().filter(|c| c.is_required) {
            let candles = match data.get(&condition.timeframe) {
                Some(candles) => candles,
                None => {
                    all_required_met = false;
                    break;
                }
            };
            let end = candles.partition_point(|c| c.datetime <= signal_time);
            if end < 2 {
                all_required_met = false;
                break;
            }
            let mut window = EnrichedSeries::new(candles[..end].to_vec());
            if condition.kind.evaluate(&mut window) != ConditionOutcome::Met {
                all_required_met = false;
                break;
            }
        }
        if !all_required_met {
            continue;
        }

        let entry_price = primary[i].close;
        let mut entry_window = EnrichedSeries::new(primary[..=i].to_vec());
        let levels = match calculate_key_levels(&mut entry_window, direction, entry_price) {
            Some(levels) => levels,
            None => continue,
        };

        let future = &primary[i + 1..i + 1 + config.forward_window];
        let (outcome, exit_price, pnl_r, bars_held) = simulate_forward(
            future,
            direction,
            &levels,
            config.fee_bps,
            config.slippage_bps,
        );

        setups.push(SimulatedSetup {
            symbol: symbol.clone(),
            entry_time: signal_time,
            entry_price: levels.entry_price,
            stop_loss: levels.stop_loss,
            take_profit_1: levels.take_profit_1,
            take_profit_2: levels.take_profit_2,
            risk_reward: levels.risk_reward,
            outcome,
            exit_price,
            pnl_r,
            bars_held,
        });
    }

    setups
}

/// Simulate what happens after entry: stop or first target first, or the
/// horizon runs out. Consumes only bars strictly after the signal bar, so a
/// candidate's outcome cannot depend on its own past.
pub fn simulate_forward(
    future: &[Candle],
    direction: Direction,
    levels: &KeyLevels,
    fee_bps: f64,
    slippage_bps: f64,
) -> (TradeOutcome, f64, f64, usize) {
    let entry = levels.entry_price;
    let stop = levels.stop_loss;
    let tp1 = levels.take_profit_1;

    if future.is_empty() {
        return (TradeOutcome::Expired, entry, 0.0, 0);
    }

    let mut risk = (entry - stop).abs();
    if risk <= 0.0 {
        risk = entry * 0.01;
    }
    // Round-trip cost in price terms
    let cost = entry * (2.0 * (fee_bps + slippage_bps)) / 10_000.0;

    let short = matches!(direction.scan_side(), Direction::Short);

    for (i, bar) in future.iter().enumerate() {
        // Stop checked before target within a bar: conservative fill order
        if short {
            if bar.high >= stop {
                return (TradeOutcome::Loss, stop, ((entry - stop) - cost) / risk, i + 1);
            }
            if bar.low <= tp1 {
                return (TradeOutcome::Win, tp1, ((entry - tp1) - cost) / risk, i + 1);
            }
        } else {
            if bar.low <= stop {
                return (TradeOutcome::Loss, stop, ((stop - entry) - cost) / risk, i + 1);
            }
            if bar.high >= tp1 {
                return (TradeOutcome::Win, tp1, ((tp1 - entry) - cost) / risk, i + 1);
            }
        }
    }

    let last_close = future.last().expect("non-empty future").close;
    let pnl = if short {
        ((entry - last_close) - cost) / risk
    } else {
        ((last_close - entry) - cost) / risk
    };
    (TradeOutcome::Expired, last_close, pnl, future.len())
}

fn compile_report(
    strategy_name: &str,
    direction: Direction,
    timeframe: Timeframe,
    symbols_tested: usize,
    mut setups: Vec<SimulatedSetup>,
) -> BacktestReport {
    setups.sort_by_key(|s| s.entry_time);

    let total = setups.len();
    let wins = setups
        .iter()
        .filter(|s| s.outcome == TradeOutcome::Win)
        .count();
    let losses = setups
        .iter()
        .filter(|s| s.outcome == TradeOutcome::Loss)
        .count();
    let win_rate = if total > 0 {
        wins as f64 / total as f64 * 100.0
    } else {
        0.0
    };

    let avg_r = if total > 0 {
        setups.iter().map(|s| s.pnl_r).sum::<f64>() / total as f64
    } else {
        0.0
    };

    // Cumulative-R equity curve in chronological order
    let mut equity_curve = Vec::with_capacity(total + 1);
    equity_curve.push(0.0);
    let mut cumulative = 0.0;
    for setup in &setups {
        cumulative += setup.pnl_r;
        equity_curve.push(cumulative);
    }

    // Max drawdown: deepest fall from a running peak
    let mut peak = 0.0f64;
    let mut max_drawdown = 0.0f64;
    for &value in &equity_curve {
        if value > peak {
            peak = value;
        }
        let drawdown = peak - value;
        if drawdown > max_drawdown {
            max_drawdown = drawdown;
        }
    }

    let setups_per_month = if total >= 2 {
        let first = setups.first().expect("non-empty").entry_time;
        let last = setups.last().expect("non-empty").entry_time;
        let months = ((last - first).num_days() as f64 / 30.0).max(1.0);
        total as f64 / months
    } else {
        0.0
    };

    setups.truncate(REPORT_DETAIL_CAP);

    BacktestReport {
        strategy_name: strategy_name.to_string(),
        direction,
        timeframe,
        symbols_tested,
        total_setups: total,
        wins,
        losses,
        win_rate,
        avg_r,
        max_drawdown,
        setups_per_month,
        equity_curve,
        setups,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use chrono::Duration;

    fn candle(days: i64, open: f64, high: f64, low: f64, close: f64) -> Candle {
        Candle {
            datetime: Utc::now() + Duration::days(days),
            open,
            high,
            low,
            close,
            volume: 1000.0,
        }
    }

    fn levels_long() -> KeyLevels {
        KeyLevels {
            entry_price: 100.0,
            stop_loss: 95.0,
            take_profit_1: 110.0,
            take_profit_2: 115.0,
            take_profit_3: 120.0,
            risk_reward: 2.0,
        }
    }

    fn setup_with(outcome: TradeOutcome, pnl_r: f64, days: i64) -> SimulatedSetup {
        SimulatedSetup {
            symbol: Symbol::new("BTC/USDT"),
            entry_time: Utc::now() + Duration::days(days),
            entry_price: 100.0,
            stop_loss: 95.0,
            take_profit_1: 110.0,
            take_profit_2: 115.0,
            risk_reward: 2.0,
            outcome,
            exit_price: 100.0 + pnl_r * 5.0,
            pnl_r,
            bars_held: 3,
        }
    }

    #[test]
    fn test_simulate_forward_win() {
        let future = vec![
            candle(1, 100.0, 104.0, 98.0, 103.0),
            candle(2, 103.0, 111.0, 102.0, 110.5),
        ];
        let (outcome, exit, pnl_r, bars) =
            simulate_forward(&future, Direction::Long, &levels_long(), 0.0, 0.0);
        assert_eq!(outcome, TradeOutcome::Win);
        assert_eq!(exit, 110.0);
        assert_relative_eq!(pnl_r, 2.0);
        assert_eq!(bars, 2);
    }

    #[test]
    fn test_simulate_forward_loss_before_win_same_bar() {
        // Both levels touched in one bar: the stop wins (conservative)
        let future = vec![candle(1, 100.0, 112.0, 94.0, 105.0)];
        let (outcome, exit, pnl_r, _) =
            simulate_forward(&future, Direction::Long, &levels_long(), 0.0, 0.0);
        assert_eq!(outcome, TradeOutcome::Loss);
        assert_eq!(exit, 95.0);
        assert_relative_eq!(pnl_r, -1.0);
    }

    #[test]
    fn test_simulate_forward_expiry_marks_open_pnl() {
        let future = vec![
            candle(1, 100.0, 103.0, 98.0, 102.0),
            candle(2, 102.0, 104.0, 99.0, 102.5),
        ];
        let (outcome, exit, pnl_r, bars) =
            simulate_forward(&future, Direction::Long, &levels_long(), 0.0, 0.0);
        assert_eq!(outcome, TradeOutcome::Expired);
        assert_eq!(exit, 102.5);
        assert_relative_eq!(pnl_r, 0.5);
        assert_eq!(bars, 2);
    }

    #[test]
    fn test_simulate_forward_costs_reduce_r() {
        let future = vec![candle(1, 100.0, 111.0, 99.0, 110.0)];
        let (_, _, gross, _) =
            simulate_forward(&future, Direction::Long, &levels_long(), 0.0, 0.0);
        let (_, _, net, _) =
            simulate_forward(&future, Direction::Long, &levels_long(), 6.0, 4.0);
        assert!(net < gross);
    }

    #[test]
    fn test_no_lookahead_in_outcome() {
        // A candidate at bar t is resolved only from bars with index > t:
        // rewriting everything at or before t leaves the outcome untouched.
        let signal_bar = 4;
        let mut series: Vec<Candle> = (0..=signal_bar)
            .map(|i| candle(i, 100.0, 101.0, 99.0, 100.0))
            .collect();
        series.push(candle(5, 100.0, 105.0, 98.0, 104.0));
        series.push(candle(6, 104.0, 111.0, 103.0, 110.0));

        let mut rewritten = series.clone();
        for bar in rewritten.iter_mut().take(signal_bar as usize + 1) {
            bar.high = 500.0;
            bar.low = 1.0;
            bar.close = 250.0;
        }

        let baseline = simulate_forward(
            &series[signal_bar as usize + 1..],
            Direction::Long,
            &levels_long(),
            0.0,
            0.0,
        );
        let replay = simulate_forward(
            &rewritten[signal_bar as usize + 1..],
            Direction::Long,
            &levels_long(),
            0.0,
            0.0,
        );
        assert_eq!(baseline.0, replay.0);
        assert_eq!(baseline.2, replay.2);
        assert_eq!(baseline.3, replay.3);
    }

    #[test]
    fn test_report_aggregation() {
        // R-multiples in chronological order
        let r_values = [2.0, -1.0, 1.0, -1.0, 3.0, -1.0, 1.0, 2.0, -1.0, 1.0];
        let setups: Vec<SimulatedSetup> = r_values
            .iter()
            .enumerate()
            .map(|(i, &r)| {
                let outcome = if r > 0.0 {
                    TradeOutcome::Win
                } else {
                    TradeOutcome::Loss
                };
                setup_with(outcome, r, i as i64)
            })
            .collect();

        let report = compile_report("momentum", Direction::Long, Timeframe::D1, 2, setups);

        assert_eq!(report.total_setups, 10);
        assert_eq!(report.wins, 6);
        assert_eq!(report.losses, 4);
        assert_relative_eq!(report.win_rate, 60.0);
        assert_relative_eq!(report.avg_r, 0.6, epsilon = 1e-9);

        // Cumulative: 2,1,2,1,4,3,4,6,5,6 -> worst fall from a peak is 1R
        assert_relative_eq!(report.max_drawdown, 1.0);
        assert_relative_eq!(*report.equity_curve.last().unwrap(), 6.0);
        assert_eq!(report.equity_curve.len(), 11);
    }

    #[test]
    fn test_report_empty() {
        let report = compile_report("momentum", Direction::Long, Timeframe::D1, 3, Vec::new());
        assert_eq!(report.total_setups, 0);
        assert_eq!(report.win_rate, 0.0);
        assert_eq!(report.max_drawdown, 0.0);
        assert_eq!(report.setups_per_month, 0.0);
        assert_eq!(report.equity_curve, vec![0.0]);
    }
}
