//! Backtest command implementation

use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

use setup_scanner::backtest::{BacktestReport, Backtester};
use setup_scanner::exchange::BinanceMarket;
use setup_scanner::store::ScannerStore;
use setup_scanner::types::{Symbol, Timeframe};
use setup_scanner::Config;

pub async fn run(
    config: Config,
    strategy_name: String,
    timeframe: String,
    symbols: Option<String>,
    export: bool,
) -> Result<()> {
    let timeframe: Timeframe = timeframe
        .parse()
        .map_err(|e: String| anyhow::anyhow!(e))
        .context("invalid --timeframe")?;

    let store = ScannerStore::open(&config.database.path)?;
    let strategy = store
        .strategies(false)?
        .into_iter()
        .find(|s| s.name == strategy_name)
        .with_context(|| format!("strategy '{strategy_name}' not found in the store"))?;

    let symbols: Vec<Symbol> = match symbols {
        Some(list) => list
            .split(',')
            .map(|s| Symbol::new(s.trim()))
            .filter(|s| !s.as_str().is_empty())
            .collect(),
        None => store
            .active_assets()?
            .into_iter()
            .map(|a| a.symbol)
            .collect(),
    };
    anyhow::ensure!(
        !symbols.is_empty(),
        "no symbols to test: pass --symbols or run a scan to populate the universe"
    );

    info!(
        "backtesting '{}' on {} over {} symbols ({} bars of history)",
        strategy.name,
        timeframe,
        symbols.len(),
        config.backtest.lookback_bars
    );

    let market = Arc::new(BinanceMarket::new(&config.exchange)?);
    let backtester = Backtester::new(market, config.backtest.clone());
    let report = backtester.run(&strategy, timeframe, &symbols).await?;

    print_report(&report);

    if export {
        let path = export_csv(&report, &config.backtest.results_dir)?;
        info!("setup details exported to {}", path.display());
    }

    Ok(())
}

fn print_report(report: &BacktestReport) {
    info!("===== Backtest: {} ({}) =====", report.strategy_name, report.direction);
    info!("symbols tested:   {}", report.symbols_tested);
    info!("total setups:     {}", report.total_setups);
    info!("wins / losses:    {} / {}", report.wins, report.losses);
    info!("win rate:         {:.1}%", report.win_rate);
    info!("average R:        {:.2}", report.avg_r);
    info!("max drawdown:     {:.2} R", report.max_drawdown);
    info!("setups per month: {:.1}", report.setups_per_month);
    if let Some(final_r) = report.equity_curve.last() {
        info!("final equity:     {:.2} R", final_r);
    }
}

fn export_csv(report: &BacktestReport, results_dir: &str) -> Result<PathBuf> {
    std::fs::create_dir_all(results_dir)?;
    let filename = format!(
        "backtest_{}_{}_{}.csv",
        report.strategy_name.replace([' ', '/'], "_"),
        report.timeframe,
        chrono::Local::now().format("%Y-%m-%d_%H-%M-%S")
    );
    let path = PathBuf::from(results_dir).join(filename);

    let mut writer = csv::Writer::from_path(&path).context("Failed to create results file")?;
    writer.write_record([
        "symbol",
        "entry_time",
        "entry_price",
        "stop_loss",
        "take_profit_1",
        "take_profit_2",
        "risk_reward",
        "outcome",
        "exit_price",
        "pnl_r",
        "bars_held",
    ])?;
    for setup in &report.setups {
        writer.write_record([
            setup.symbol.to_string(),
            setup.entry_time.to_rfc3339(),
            format!("{:.8}", setup.entry_price),
            format!("{:.8}", setup.stop_loss),
            format!("{:.8}", setup.take_profit_1),
            format!("{:.8}", setup.take_profit_2),
            format!("{:.2}", setup.risk_reward),
            setup.outcome.as_str().to_string(),
            format!("{:.8}", setup.exit_price),
            format!("{:.2}", setup.pnl_r),
            setup.bars_held.to_string(),
        ])?;
    }
    writer.flush()?;
    Ok(path)
}
