//! Crypto Setup Scanner
//!
//! Periodically scans a universe of crypto assets, evaluates multi-condition
//! strategies against multi-timeframe technical indicators, and records
//! qualifying trade setups with computed entry/stop/take-profit levels. A
//! backtester replays the same condition and level logic over history.

pub mod backtest;
pub mod conditions;
pub mod config;
pub mod engine;
pub mod exchange;
pub mod indicators;
pub mod levels;
pub mod market;
pub mod regime;
pub mod series;
pub mod store;
pub mod types;

pub use config::Config;
pub use types::*;
