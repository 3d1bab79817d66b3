//! Setup scanner - main entry point
//!
//! This binary provides three subcommands:
//! - scan: Run scan cycles (once or on an interval)
//! - backtest: Replay a strategy over historical data
//! - strategies: Import and list strategy definitions

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod commands;

#[derive(Parser, Debug)]
#[command(name = "setup-scanner")]
#[command(about = "Multi-timeframe crypto setup scanner with strategy backtesting", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Path to configuration file (defaults apply if missing)
    #[arg(short, long, global = true, default_value = "configs/scanner.json")]
    config: String,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run scan cycles
    Scan {
        /// Re-trigger scans on an interval (minutes). Runs once if omitted.
        #[arg(long)]
        every: Option<u64>,
    },

    /// Backtest a saved strategy over historical data
    Backtest {
        /// Strategy name (as saved in the store)
        #[arg(short, long)]
        strategy: String,

        /// Primary timeframe (e.g. "1d", "4h")
        #[arg(short, long, default_value = "1d")]
        timeframe: String,

        /// Symbols to test (comma-separated, e.g. "BTC/USDT,ETH/USDT").
        /// Tests the entire active universe when omitted.
        #[arg(long)]
        symbols: Option<String>,

        /// Export setup details to CSV in the results directory
        #[arg(long)]
        export: bool,
    },

    /// Manage strategy definitions
    Strategies {
        #[command(subcommand)]
        action: StrategiesAction,
    },
}

#[derive(Subcommand, Debug)]
enum StrategiesAction {
    /// Import strategy definitions from a JSON file
    Import {
        /// Path to the definitions file
        #[arg(short, long)]
        file: String,
    },

    /// List saved strategies
    List,
}

fn setup_logging(verbose: bool, command_name: &str) -> Result<()> {
    std::fs::create_dir_all("logs")?;

    let log_filename = format!(
        "{}_{}.log",
        command_name,
        chrono::Local::now().format("%Y-%m-%d_%H-%M-%S")
    );
    let log_path = PathBuf::from("logs").join(&log_filename);

    let level = if verbose { "debug" } else { "info" };
    let filter_str = format!(
        "{},hyper=warn,hyper_util=warn,reqwest=warn,rustls=warn,h2=warn",
        level
    );
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&filter_str));

    let file_appender = tracing_appender::rolling::never("logs", &log_filename);

    let console_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_line_number(true)
        .with_file(true)
        .with_ansi(true);

    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(file_appender)
        .with_target(true)
        .with_line_number(true)
        .with_file(true)
        .with_ansi(false);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .init();

    info!("Logging initialized");
    info!("Log file: {}", log_path.display());
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    let cli = Cli::parse();

    let command_name = match &cli.command {
        Commands::Scan { .. } => "scan",
        Commands::Backtest { .. } => "backtest",
        Commands::Strategies { .. } => "strategies",
    };
    setup_logging(cli.verbose, command_name)?;

    let config = if std::path::Path::new(&cli.config).exists() {
        setup_scanner::Config::from_file(&cli.config)?
    } else {
        info!("config file {} not found, using defaults", cli.config);
        setup_scanner::Config::from_env()
    };

    match cli.command {
        Commands::Scan { every } => commands::scan::run(config, every).await,

        Commands::Backtest {
            strategy,
            timeframe,
            symbols,
            export,
        } => commands::backtest::run(config, strategy, timeframe, symbols, export).await,

        Commands::Strategies { action } => match action {
            StrategiesAction::Import { file } => commands::strategies::import(config, file),
            StrategiesAction::List => commands::strategies::list(config),
        },
    }
}
