//! SQLite persistence for assets, strategies, setups, scan logs and journal
//!
//! Single-connection store behind a mutex, WAL mode. Strategy conditions are
//! validated before anything is written, so a malformed strategy never lands
//! in the database. Setups reference strategies by denormalized name, not by
//! foreign key, so deleting a strategy preserves its historical setups.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

use crate::conditions::ConditionKind;
use crate::regime::MarketRegime;
use crate::types::{AssetSource, Direction, SetupStatus, Symbol, Timeframe};

// =============================================================================
// Data Models
// =============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct Asset {
    pub id: i64,
    pub symbol: Symbol,
    pub base_currency: String,
    pub quote_currency: String,
    pub source: AssetSource,
    pub is_active: bool,
    pub market_cap_rank: Option<u32>,
    pub added_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StrategyCondition {
    pub kind: ConditionKind,
    pub timeframe: Timeframe,
    pub is_required: bool,
}

#[derive(Debug, Clone)]
pub struct Strategy {
    pub id: i64,
    pub name: String,
    pub description: Option<String>,
    pub direction: Direction,
    pub is_active: bool,
    /// Regimes this strategy may fire in; `None` means any regime
    pub valid_regimes: Option<Vec<MarketRegime>>,
    pub conditions: Vec<StrategyCondition>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Strategy {
    /// Whether this strategy is allowed to fire in `regime`.
    pub fn allows_regime(&self, regime: MarketRegime) -> bool {
        match &self.valid_regimes {
            Some(regimes) => regimes.contains(&regime),
            None => true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct NewStrategy {
    pub name: String,
    pub description: Option<String>,
    pub direction: Direction,
    pub valid_regimes: Option<Vec<MarketRegime>>,
    pub conditions: Vec<StrategyCondition>,
}

#[derive(Debug, Clone)]
pub struct Setup {
    pub id: i64,
    pub asset_id: i64,
    pub symbol: Symbol,
    /// Denormalized snapshot; survives strategy deletion
    pub strategy_name: String,
    pub direction: Direction,
    pub status: SetupStatus,
    pub entry_price: f64,
    pub stop_loss: f64,
    pub take_profit_1: f64,
    pub take_profit_2: f64,
    pub take_profit_3: f64,
    pub risk_reward: f64,
    pub price_at_detection: f64,
    pub funding_rate: Option<f64>,
    pub open_interest: Option<f64>,
    pub market_regime: Option<MarketRegime>,
    pub required_conditions_met: u32,
    pub bonus_conditions_met: u32,
    pub total_conditions: u32,
    pub detected_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub invalidated_at: Option<DateTime<Utc>>,
    pub tp1_hit: bool,
    pub tp2_hit: bool,
    pub tp3_hit: bool,
    pub sl_hit: bool,
    pub tp1_hit_at: Option<DateTime<Utc>>,
    pub tp2_hit_at: Option<DateTime<Utc>>,
    pub tp3_hit_at: Option<DateTime<Utc>>,
    pub sl_hit_at: Option<DateTime<Utc>>,
    pub highest_price_after: Option<f64>,
    pub lowest_price_after: Option<f64>,
    pub scan_log_id: Option<i64>,
}

#[derive(Debug, Clone)]
pub struct NewSetup {
    pub asset_id: i64,
    pub symbol: Symbol,
    pub strategy_name: String,
    pub direction: Direction,
    pub entry_price: f64,
    pub stop_loss: f64,
    pub take_profit_1: f64,
    pub take_profit_2: f64,
    pub take_profit_3: f64,
    pub risk_reward: f64,
    pub price_at_detection: f64,
    pub funding_rate: Option<f64>,
    pub open_interest: Option<f64>,
    pub market_regime: Option<MarketRegime>,
    pub required_conditions_met: u32,
    pub bonus_conditions_met: u32,
    pub total_conditions: u32,
    pub expires_at: DateTime<Utc>,
    pub scan_log_id: Option<i64>,
}

/// Scan lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanStatus {
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl ScanStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScanStatus::Running => "running",
            ScanStatus::Completed => "completed",
            ScanStatus::Failed => "failed",
            ScanStatus::Cancelled => "cancelled",
        }
    }
}

impl FromStr for ScanStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(ScanStatus::Running),
            "completed" => Ok(ScanStatus::Completed),
            "failed" => Ok(ScanStatus::Failed),
            "cancelled" => Ok(ScanStatus::Cancelled),
            other => Err(format!("unrecognized scan status: {other}")),
        }
    }
}

/// One recoverable problem recorded during a scan
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanIssue {
    pub symbol: Option<String>,
    pub message: String,
}

impl ScanIssue {
    pub fn for_symbol(symbol: &Symbol, message: impl Into<String>) -> Self {
        ScanIssue {
            symbol: Some(symbol.to_string()),
            message: message.into(),
        }
    }

    pub fn general(message: impl Into<String>) -> Self {
        ScanIssue {
            symbol: None,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ScanLog {
    pub id: i64,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub status: ScanStatus,
    pub assets_scanned: u32,
    pub setups_found: u32,
    pub setups_expired: u32,
    pub setups_invalidated: u32,
    pub market_regime: Option<MarketRegime>,
    pub issues: Vec<ScanIssue>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JournalAction {
    TookTrade,
    Skipped,
    Partial,
}

impl JournalAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            JournalAction::TookTrade => "took_trade",
            JournalAction::Skipped => "skipped",
            JournalAction::Partial => "partial",
        }
    }
}

impl FromStr for JournalAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "took_trade" => Ok(JournalAction::TookTrade),
            "skipped" => Ok(JournalAction::Skipped),
            "partial" => Ok(JournalAction::Partial),
            other => Err(format!("unrecognized journal action: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JournalOutcome {
    Win,
    Loss,
    Breakeven,
    Open,
}

impl JournalOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            JournalOutcome::Win => "win",
            JournalOutcome::Loss => "loss",
            JournalOutcome::Breakeven => "breakeven",
            JournalOutcome::Open => "open",
        }
    }
}

impl FromStr for JournalOutcome {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "win" => Ok(JournalOutcome::Win),
            "loss" => Ok(JournalOutcome::Loss),
            "breakeven" => Ok(JournalOutcome::Breakeven),
            "open" => Ok(JournalOutcome::Open),
            other => Err(format!("unrecognized journal outcome: {other}")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct JournalEntry {
    pub id: i64,
    pub setup_id: Option<i64>,
    pub asset_symbol: Symbol,
    pub strategy_name: Option<String>,
    pub direction: Option<Direction>,
    pub action: JournalAction,
    pub outcome: JournalOutcome,
    pub actual_entry: Option<f64>,
    pub actual_stop: Option<f64>,
    pub actual_exit: Option<f64>,
    pub position_size: Option<f64>,
    pub pnl_absolute: Option<f64>,
    pub pnl_r_multiple: Option<f64>,
    pub planned_rr: Option<f64>,
    pub notes: Option<String>,
    pub tags: Vec<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewJournalEntry {
    pub setup_id: Option<i64>,
    pub asset_symbol: Symbol,
    pub strategy_name: Option<String>,
    pub direction: Option<Direction>,
    pub action: JournalAction,
    pub outcome: JournalOutcome,
    pub actual_entry: Option<f64>,
    pub actual_stop: Option<f64>,
    pub actual_exit: Option<f64>,
    pub position_size: Option<f64>,
    pub pnl_absolute: Option<f64>,
    pub pnl_r_multiple: Option<f64>,
    pub planned_rr: Option<f64>,
    pub notes: Option<String>,
    pub tags: Vec<String>,
}

impl NewJournalEntry {
    /// Draft an entry from a setup snapshot: planned levels carried over,
    /// outcome left open until the user records it.
    pub fn from_setup(setup: &Setup, action: JournalAction) -> Self {
        NewJournalEntry {
            setup_id: Some(setup.id),
            asset_symbol: setup.symbol.clone(),
            strategy_name: Some(setup.strategy_name.clone()),
            direction: Some(setup.direction),
            action,
            outcome: JournalOutcome::Open,
            actual_entry: Some(setup.entry_price),
            actual_stop: Some(setup.stop_loss),
            actual_exit: None,
            position_size: None,
            pnl_absolute: None,
            pnl_r_multiple: None,
            planned_rr: Some(setup.risk_reward),
            notes: None,
            tags: Vec::new(),
        }
    }
}

// =============================================================================
// Store Implementation
// =============================================================================

pub struct ScannerStore {
    conn: Arc<Mutex<Connection>>,
}

impl ScannerStore {
    pub fn open<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let db_path = db_path.as_ref();
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(db_path)
            .with_context(|| format!("Failed to open database: {}", db_path.display()))?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;

        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.create_tables()?;
        info!("scanner store initialized at {}", db_path.display());
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.create_tables()?;
        Ok(store)
    }

    fn create_tables(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap();

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS assets (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                symbol TEXT NOT NULL UNIQUE,
                base_currency TEXT NOT NULL,
                quote_currency TEXT NOT NULL,
                source TEXT NOT NULL DEFAULT 'dynamic',
                is_active INTEGER NOT NULL DEFAULT 1,
                market_cap_rank INTEGER,
                added_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS strategies (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL UNIQUE,
                description TEXT,
                direction TEXT NOT NULL DEFAULT 'long',
                is_active INTEGER NOT NULL DEFAULT 1,
                valid_regimes TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS strategy_conditions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                strategy_id INTEGER NOT NULL REFERENCES strategies(id) ON DELETE CASCADE,
                condition_type TEXT NOT NULL,
                timeframe TEXT NOT NULL DEFAULT '1d',
                parameters TEXT NOT NULL DEFAULT '{}',
                is_required INTEGER NOT NULL DEFAULT 1,
                ord INTEGER NOT NULL DEFAULT 0
            );

            CREATE TABLE IF NOT EXISTS setups (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                asset_id INTEGER NOT NULL REFERENCES assets(id),
                symbol TEXT NOT NULL,
                strategy_name TEXT NOT NULL,
                direction TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'active',
                entry_price REAL NOT NULL,
                stop_loss REAL NOT NULL,
                take_profit_1 REAL NOT NULL,
                take_profit_2 REAL NOT NULL,
                take_profit_3 REAL NOT NULL,
                risk_reward REAL NOT NULL,
                price_at_detection REAL NOT NULL,
                funding_rate REAL,
                open_interest REAL,
                market_regime TEXT,
                required_conditions_met INTEGER NOT NULL DEFAULT 0,
                bonus_conditions_met INTEGER NOT NULL DEFAULT 0,
                total_conditions INTEGER NOT NULL DEFAULT 0,
                detected_at TEXT NOT NULL,
                expires_at TEXT NOT NULL,
                invalidated_at TEXT,
                tp1_hit INTEGER NOT NULL DEFAULT 0,
                tp2_hit INTEGER NOT NULL DEFAULT 0,
                tp3_hit INTEGER NOT NULL DEFAULT 0,
                sl_hit INTEGER NOT NULL DEFAULT 0,
                tp1_hit_at TEXT,
                tp2_hit_at TEXT,
                tp3_hit_at TEXT,
                sl_hit_at TEXT,
                highest_price_after REAL,
                lowest_price_after REAL,
                scan_log_id INTEGER
            );

            CREATE TABLE IF NOT EXISTS scan_logs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                started_at TEXT NOT NULL,
                finished_at TEXT,
                status TEXT NOT NULL DEFAULT 'running',
                assets_scanned INTEGER NOT NULL DEFAULT 0,
                setups_found INTEGER NOT NULL DEFAULT 0,
                setups_expired INTEGER NOT NULL DEFAULT 0,
                setups_invalidated INTEGER NOT NULL DEFAULT 0,
                market_regime TEXT,
                errors TEXT
            );

            CREATE TABLE IF NOT EXISTS journal_entries (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                setup_id INTEGER REFERENCES setups(id),
                asset_symbol TEXT NOT NULL,
                strategy_name TEXT,
                direction TEXT,
                action TEXT NOT NULL DEFAULT 'took_trade',
                outcome TEXT NOT NULL DEFAULT 'open',
                actual_entry REAL,
                actual_stop REAL,
                actual_exit REAL,
                position_size REAL,
                pnl_absolute REAL,
                pnl_r_multiple REAL,
                planned_rr REAL,
                notes TEXT,
                tags TEXT NOT NULL DEFAULT '[]',
                created_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS ix_assets_active ON assets(is_active);
            CREATE INDEX IF NOT EXISTS ix_setups_status ON setups(status);
            CREATE INDEX IF NOT EXISTS ix_setups_detected ON setups(detected_at);
            CREATE INDEX IF NOT EXISTS ix_journal_created ON journal_entries(created_at);

            -- At most one active setup per (asset, strategy, direction)
            CREATE UNIQUE INDEX IF NOT EXISTS ux_setups_active
                ON setups(asset_id, strategy_name, direction)
                WHERE status = 'active';

            -- At most one running scan at a time
            CREATE UNIQUE INDEX IF NOT EXISTS ux_scan_running
                ON scan_logs(status)
                WHERE status = 'running';",
        )?;

        debug!("database schema created/verified");
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Assets
    // -------------------------------------------------------------------------

    /// Replace the dynamic universe with a new volume-ranked symbol list.
    /// Previously-dynamic assets missing from the list are deactivated;
    /// watchlist assets are never touched. Returns the active count.
    pub fn apply_dynamic_universe(&self, ranked: &[String], quote: &str) -> Result<usize> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;

        tx.execute(
            "UPDATE assets SET is_active = 0 WHERE source = 'dynamic'",
            [],
        )?;

        for (idx, symbol) in ranked.iter().enumerate() {
            let rank = (idx + 1) as i64;
            let updated = tx.execute(
                "UPDATE assets SET is_active = 1, market_cap_rank = ?2 WHERE symbol = ?1",
                params![symbol, rank],
            )?;
            if updated == 0 {
                let base = symbol.split('/').next().unwrap_or(symbol);
                tx.execute(
                    "INSERT INTO assets
                     (symbol, base_currency, quote_currency, source, is_active, market_cap_rank, added_at)
                     VALUES (?1, ?2, ?3, 'dynamic', 1, ?4, ?5)",
                    params![symbol, base, quote, rank, Utc::now().to_rfc3339()],
                )?;
            }
        }

        tx.commit()?;
        info!("dynamic universe updated: {} symbols", ranked.len());
        Ok(ranked.len())
    }

    /// Add (or reactivate) a user-managed watchlist asset.
    pub fn upsert_watchlist_asset(&self, symbol: &Symbol, quote: &str) -> Result<Asset> {
        {
            let conn = self.conn.lock().unwrap();
            let updated = conn.execute(
                "UPDATE assets SET is_active = 1, source = 'watchlist' WHERE symbol = ?1",
                params![symbol.as_str()],
            )?;
            if updated == 0 {
                conn.execute(
                    "INSERT INTO assets
                     (symbol, base_currency, quote_currency, source, is_active, added_at)
                     VALUES (?1, ?2, ?3, 'watchlist', 1, ?4)",
                    params![
                        symbol.as_str(),
                        symbol.base(),
                        symbol.quote().unwrap_or(quote),
                        Utc::now().to_rfc3339()
                    ],
                )?;
            }
        }
        self.asset_by_symbol(symbol)?
            .context("watchlist asset missing after upsert")
    }

    /// Deactivate an asset. Assets are never hard-deleted.
    pub fn deactivate_asset(&self, symbol: &Symbol) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let updated = conn.execute(
            "UPDATE assets SET is_active = 0 WHERE symbol = ?1",
            params![symbol.as_str()],
        )?;
        Ok(updated > 0)
    }

    pub fn asset_by_symbol(&self, symbol: &Symbol) -> Result<Option<Asset>> {
        let conn = self.conn.lock().unwrap();
        let asset = conn
            .query_row(
                "SELECT id, symbol, base_currency, quote_currency, source, is_active,
                        market_cap_rank, added_at
                 FROM assets WHERE symbol = ?1",
                params![symbol.as_str()],
                map_asset_row,
            )
            .optional()?;
        Ok(asset)
    }

    pub fn active_assets(&self) -> Result<Vec<Asset>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, symbol, base_currency, quote_currency, source, is_active,
                    market_cap_rank, added_at
             FROM assets WHERE is_active = 1
             ORDER BY market_cap_rank IS NULL, market_cap_rank, symbol",
        )?;
        let assets = stmt
            .query_map([], map_asset_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(assets)
    }

    // -------------------------------------------------------------------------
    // Strategies
    // -------------------------------------------------------------------------

    /// Create or replace a strategy by name. Conditions are validated before
    /// any write happens.
    pub fn save_strategy(&self, new: &NewStrategy) -> Result<i64> {
        if new.name.trim().is_empty() {
            anyhow::bail!("strategy name must not be empty");
        }
        for condition in &new.conditions {
            condition
                .kind
                .validate()
                .with_context(|| format!("strategy '{}'", new.name))?;
        }
        if new.conditions.is_empty() {
            debug!(
                "strategy '{}' has no conditions and will never produce a setup",
                new.name
            );
        }

        let regimes_json = new
            .valid_regimes
            .as_ref()
            .map(|regimes| {
                serde_json::to_string(&regimes.iter().map(|r| r.as_str()).collect::<Vec<_>>())
            })
            .transpose()?;

        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        let now = Utc::now().to_rfc3339();

        tx.execute(
            "INSERT INTO strategies (name, description, direction, is_active, valid_regimes, created_at, updated_at)
             VALUES (?1, ?2, ?3, 1, ?4, ?5, ?5)
             ON CONFLICT(name) DO UPDATE SET
                description = excluded.description,
                direction = excluded.direction,
                valid_regimes = excluded.valid_regimes,
                updated_at = excluded.updated_at",
            params![
                new.name,
                new.description,
                new.direction.as_str(),
                regimes_json,
                now
            ],
        )?;

        let strategy_id: i64 = tx.query_row(
            "SELECT id FROM strategies WHERE name = ?1",
            params![new.name],
            |row| row.get(0),
        )?;

        tx.execute(
            "DELETE FROM strategy_conditions WHERE strategy_id = ?1",
            params![strategy_id],
        )?;
        for (idx, condition) in new.conditions.iter().enumerate() {
            tx.execute(
                "INSERT INTO strategy_conditions
                 (strategy_id, condition_type, timeframe, parameters, is_required, ord)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    strategy_id,
                    condition.kind.type_name(),
                    condition.timeframe.as_str(),
                    condition.kind.params_json().to_string(),
                    condition.is_required,
                    idx as i64
                ],
            )?;
        }

        tx.commit()?;
        info!(
            "strategy '{}' saved with {} conditions",
            new.name,
            new.conditions.len()
        );
        Ok(strategy_id)
    }

    pub fn strategies(&self, only_active: bool) -> Result<Vec<Strategy>> {
        let conn = self.conn.lock().unwrap();
        let sql = if only_active {
            "SELECT id, name, description, direction, is_active, valid_regimes, created_at, updated_at
             FROM strategies WHERE is_active = 1 ORDER BY name"
        } else {
            "SELECT id, name, description, direction, is_active, valid_regimes, created_at, updated_at
             FROM strategies ORDER BY name"
        };

        let mut stmt = conn.prepare(sql)?;
        let mut strategies = stmt
            .query_map([], map_strategy_row)?
            .collect::<Result<Vec<_>, _>>()?;

        let mut cond_stmt = conn.prepare(
            "SELECT condition_type, timeframe, parameters, is_required
             FROM strategy_conditions WHERE strategy_id = ?1 ORDER BY ord",
        )?;
        for strategy in &mut strategies {
            let rows = cond_stmt
                .query_map(params![strategy.id], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, bool>(3)?,
                    ))
                })?
                .collect::<Result<Vec<_>, _>>()?;

            for (condition_type, timeframe, parameters, is_required) in rows {
                let params_value: serde_json::Value =
                    serde_json::from_str(&parameters).unwrap_or(serde_json::Value::Null);
                let kind = ConditionKind::from_parts(&condition_type, &params_value)
                    .with_context(|| {
                        format!("stored condition for strategy '{}'", strategy.name)
                    })?;
                strategy.conditions.push(StrategyCondition {
                    kind,
                    timeframe: timeframe
                        .parse()
                        .map_err(|e: String| anyhow::anyhow!(e))
                        .with_context(|| {
                            format!("stored timeframe for strategy '{}'", strategy.name)
                        })?,
                    is_required,
                });
            }
        }

        Ok(strategies)
    }

    pub fn active_strategies(&self) -> Result<Vec<Strategy>> {
        self.strategies(true)
    }

    pub fn set_strategy_active(&self, name: &str, active: bool) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let updated = conn.execute(
            "UPDATE strategies SET is_active = ?2, updated_at = ?3 WHERE name = ?1",
            params![name, active, Utc::now().to_rfc3339()],
        )?;
        Ok(updated > 0)
    }

    /// Delete a strategy and its conditions. Historical setups keep their
    /// denormalized strategy name.
    pub fn delete_strategy(&self, name: &str) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let deleted = conn.execute("DELETE FROM strategies WHERE name = ?1", params![name])?;
        Ok(deleted > 0)
    }

    // -------------------------------------------------------------------------
    // Scan logs
    // -------------------------------------------------------------------------

    /// Create a scan log in `running` state. Fails if another scan log is
    /// already running (DB-level backstop for the mutual-exclusion gate).
    pub fn create_scan_log(&self) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO scan_logs (started_at, status) VALUES (?1, 'running')",
            params![Utc::now().to_rfc3339()],
        )
        .context("failed to create running scan log")?;
        Ok(conn.last_insert_rowid())
    }

    pub fn running_scan(&self) -> Result<Option<ScanLog>> {
        let conn = self.conn.lock().unwrap();
        let log = conn
            .query_row(
                "SELECT id, started_at, finished_at, status, assets_scanned, setups_found,
                        setups_expired, setups_invalidated, market_regime, errors
                 FROM scan_logs WHERE status = 'running' ORDER BY id DESC LIMIT 1",
                [],
                map_scan_log_row,
            )
            .optional()?;
        Ok(log)
    }

    pub fn scan_log(&self, id: i64) -> Result<Option<ScanLog>> {
        let conn = self.conn.lock().unwrap();
        let log = conn
            .query_row(
                "SELECT id, started_at, finished_at, status, assets_scanned, setups_found,
                        setups_expired, setups_invalidated, market_regime, errors
                 FROM scan_logs WHERE id = ?1",
                params![id],
                map_scan_log_row,
            )
            .optional()?;
        Ok(log)
    }

    pub fn recent_scan_logs(&self, limit: usize) -> Result<Vec<ScanLog>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, started_at, finished_at, status, assets_scanned, setups_found,
                    setups_expired, setups_invalidated, market_regime, errors
             FROM scan_logs ORDER BY id DESC LIMIT ?1",
        )?;
        let logs = stmt
            .query_map(params![limit as i64], map_scan_log_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(logs)
    }

    pub fn update_scan_log(&self, log: &ScanLog) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let issues_json = if log.issues.is_empty() {
            None
        } else {
            Some(serde_json::to_string(&log.issues)?)
        };

        conn.execute(
            "UPDATE scan_logs SET
                finished_at = ?2,
                status = ?3,
                assets_scanned = ?4,
                setups_found = ?5,
                setups_expired = ?6,
                setups_invalidated = ?7,
                market_regime = ?8,
                errors = ?9
             WHERE id = ?1",
            params![
                log.id,
                log.finished_at.map(|d| d.to_rfc3339()),
                log.status.as_str(),
                log.assets_scanned,
                log.setups_found,
                log.setups_expired,
                log.setups_invalidated,
                log.market_regime.map(|r| r.as_str()),
                issues_json,
            ],
        )?;
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Setups
    // -------------------------------------------------------------------------

    pub fn insert_setup(&self, new: &NewSetup) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO setups
             (asset_id, symbol, strategy_name, direction, status,
              entry_price, stop_loss, take_profit_1, take_profit_2, take_profit_3,
              risk_reward, price_at_detection, funding_rate, open_interest, market_regime,
              required_conditions_met, bonus_conditions_met, total_conditions,
              detected_at, expires_at, scan_log_id)
             VALUES (?1, ?2, ?3, ?4, 'active', ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14,
                     ?15, ?16, ?17, ?18, ?19, ?20)",
            params![
                new.asset_id,
                new.symbol.as_str(),
                new.strategy_name,
                new.direction.scan_side().as_str(),
                new.entry_price,
                new.stop_loss,
                new.take_profit_1,
                new.take_profit_2,
                new.take_profit_3,
                new.risk_reward,
                new.price_at_detection,
                new.funding_rate,
                new.open_interest,
                new.market_regime.map(|r| r.as_str()),
                new.required_conditions_met,
                new.bonus_conditions_met,
                new.total_conditions,
                Utc::now().to_rfc3339(),
                new.expires_at.to_rfc3339(),
                new.scan_log_id,
            ],
        )
        .context("failed to insert setup")?;
        Ok(conn.last_insert_rowid())
    }

    pub fn has_active_setup(
        &self,
        asset_id: i64,
        strategy_name: &str,
        direction: Direction,
    ) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM setups
             WHERE asset_id = ?1 AND strategy_name = ?2 AND direction = ?3 AND status = 'active'",
            params![asset_id, strategy_name, direction.scan_side().as_str()],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    pub fn active_setups(&self) -> Result<Vec<Setup>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "SELECT {SETUP_COLUMNS} FROM setups WHERE status = 'active' ORDER BY id"
        ))?;
        let setups = stmt
            .query_map([], map_setup_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(setups)
    }

    pub fn setup(&self, id: i64) -> Result<Option<Setup>> {
        let conn = self.conn.lock().unwrap();
        let setup = conn
            .query_row(
                &format!("SELECT {SETUP_COLUMNS} FROM setups WHERE id = ?1"),
                params![id],
                map_setup_row,
            )
            .optional()?;
        Ok(setup)
    }

    pub fn setups_for_scan(&self, scan_log_id: i64) -> Result<Vec<Setup>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "SELECT {SETUP_COLUMNS} FROM setups WHERE scan_log_id = ?1 ORDER BY id"
        ))?;
        let setups = stmt
            .query_map(params![scan_log_id], map_setup_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(setups)
    }

    pub fn update_setup(&self, setup: &Setup) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE setups SET
                status = ?2,
                invalidated_at = ?3,
                tp1_hit = ?4, tp2_hit = ?5, tp3_hit = ?6, sl_hit = ?7,
                tp1_hit_at = ?8, tp2_hit_at = ?9, tp3_hit_at = ?10, sl_hit_at = ?11,
                highest_price_after = ?12,
                lowest_price_after = ?13
             WHERE id = ?1",
            params![
                setup.id,
                setup.status.as_str(),
                setup.invalidated_at.map(|d| d.to_rfc3339()),
                setup.tp1_hit,
                setup.tp2_hit,
                setup.tp3_hit,
                setup.sl_hit,
                setup.tp1_hit_at.map(|d| d.to_rfc3339()),
                setup.tp2_hit_at.map(|d| d.to_rfc3339()),
                setup.tp3_hit_at.map(|d| d.to_rfc3339()),
                setup.sl_hit_at.map(|d| d.to_rfc3339()),
                setup.highest_price_after,
                setup.lowest_price_after,
            ],
        )?;
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Journal
    // -------------------------------------------------------------------------

    pub fn insert_journal_entry(&self, entry: &NewJournalEntry) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO journal_entries
             (setup_id, asset_symbol, strategy_name, direction, action, outcome,
              actual_entry, actual_stop, actual_exit, position_size,
              pnl_absolute, pnl_r_multiple, planned_rr, notes, tags, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
            params![
                entry.setup_id,
                entry.asset_symbol.as_str(),
                entry.strategy_name,
                entry.direction.map(|d| d.as_str()),
                entry.action.as_str(),
                entry.outcome.as_str(),
                entry.actual_entry,
                entry.actual_stop,
                entry.actual_exit,
                entry.position_size,
                entry.pnl_absolute,
                entry.pnl_r_multiple,
                entry.planned_rr,
                entry.notes,
                serde_json::to_string(&entry.tags)?,
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn journal_entries(&self, limit: usize) -> Result<Vec<JournalEntry>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, setup_id, asset_symbol, strategy_name, direction, action, outcome,
                    actual_entry, actual_stop, actual_exit, position_size,
                    pnl_absolute, pnl_r_multiple, planned_rr, notes, tags, created_at
             FROM journal_entries ORDER BY created_at DESC, id DESC LIMIT ?1",
        )?;
        let entries = stmt
            .query_map(params![limit as i64], map_journal_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(entries)
    }
}

// =============================================================================
// Row mapping
// =============================================================================

const SETUP_COLUMNS: &str = "id, asset_id, symbol, strategy_name, direction, status,
    entry_price, stop_loss, take_profit_1, take_profit_2, take_profit_3,
    risk_reward, price_at_detection, funding_rate, open_interest, market_regime,
    required_conditions_met, bonus_conditions_met, total_conditions,
    detected_at, expires_at, invalidated_at,
    tp1_hit, tp2_hit, tp3_hit, sl_hit,
    tp1_hit_at, tp2_hit_at, tp3_hit_at, sl_hit_at,
    highest_price_after, lowest_price_after, scan_log_id";

fn conversion_error(idx: usize, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, message.into())
}

fn parse_enum<T: FromStr<Err = String>>(idx: usize, s: String) -> rusqlite::Result<T> {
    s.parse().map_err(|e: String| conversion_error(idx, e))
}

fn parse_dt(idx: usize, s: String) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&s)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| conversion_error(idx, format!("bad timestamp: {e}")))
}

fn parse_dt_opt(idx: usize, s: Option<String>) -> rusqlite::Result<Option<DateTime<Utc>>> {
    s.map(|s| parse_dt(idx, s)).transpose()
}

fn map_asset_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Asset> {
    Ok(Asset {
        id: row.get(0)?,
        symbol: Symbol::new(row.get::<_, String>(1)?),
        base_currency: row.get(2)?,
        quote_currency: row.get(3)?,
        source: parse_enum(4, row.get::<_, String>(4)?)?,
        is_active: row.get(5)?,
        market_cap_rank: row.get(6)?,
        added_at: parse_dt(7, row.get::<_, String>(7)?)?,
    })
}

fn map_strategy_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Strategy> {
    let regimes_json: Option<String> = row.get(5)?;
    let valid_regimes = match regimes_json {
        Some(json) => {
            let names: Vec<String> = serde_json::from_str(&json)
                .map_err(|e| conversion_error(5, format!("bad valid_regimes: {e}")))?;
            let mut regimes = Vec::with_capacity(names.len());
            for name in names {
                regimes.push(parse_enum(5, name)?);
            }
            Some(regimes)
        }
        None => None,
    };

    Ok(Strategy {
        id: row.get(0)?,
        name: row.get(1)?,
        description: row.get(2)?,
        direction: parse_enum(3, row.get::<_, String>(3)?)?,
        is_active: row.get(4)?,
        valid_regimes,
        conditions: Vec::new(),
        created_at: parse_dt(6, row.get::<_, String>(6)?)?,
        updated_at: parse_dt(7, row.get::<_, String>(7)?)?,
    })
}

fn map_scan_log_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ScanLog> {
    let regime: Option<String> = row.get(8)?;
    let issues_json: Option<String> = row.get(9)?;
    let issues = match issues_json {
        Some(json) => serde_json::from_str(&json)
            .map_err(|e| conversion_error(9, format!("bad scan errors: {e}")))?,
        None => Vec::new(),
    };

    Ok(ScanLog {
        id: row.get(0)?,
        started_at: parse_dt(1, row.get::<_, String>(1)?)?,
        finished_at: parse_dt_opt(2, row.get(2)?)?,
        status: parse_enum(3, row.get::<_, String>(3)?)?,
        assets_scanned: row.get(4)?,
        setups_found: row.get(5)?,
        setups_expired: row.get(6)?,
        setups_invalidated: row.get(7)?,
        market_regime: regime.map(|r| parse_enum(8, r)).transpose()?,
        issues,
    })
}

fn map_setup_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Setup> {
    let regime: Option<String> = row.get(15)?;
    Ok(Setup {
        id: row.get(0)?,
        asset_id: row.get(1)?,
        symbol: Symbol::new(row.get::<_, String>(2)?),
        strategy_name: row.get(3)?,
        direction: parse_enum(4, row.get::<_, String>(4)?)?,
        status: parse_enum(5, row.get::<_, String>(5)?)?,
        entry_price: row.get(6)?,
        stop_loss: row.get(7)?,
        take_profit_1: row.get(8)?,
        take_profit_2: row.get(9)?,
        take_profit_3: row.get(10)?,
        risk_reward: row.get(11)?,
        price_at_detection: row.get(12)?,
        funding_rate: row.get(13)?,
        open_interest: row.get(14)?,
        market_regime: regime.map(|r| parse_enum(15, r)).transpose()?,
        required_conditions_met: row.get(16)?,
        bonus_conditions_met: row.get(17)?,
        total_conditions: row.get(18)?,
        detected_at: parse_dt(19, row.get::<_, String>(19)?)?,
        expires_at: parse_dt(20, row.get::<_, String>(20)?)?,
        invalidated_at: parse_dt_opt(21, row.get(21)?)?,
        tp1_hit: row.get(22)?,
        tp2_hit: row.get(23)?,
        tp3_hit: row.get(24)?,
        sl_hit: row.get(25)?,
        tp1_hit_at: parse_dt_opt(26, row.get(26)?)?,
        tp2_hit_at: parse_dt_opt(27, row.get(27)?)?,
        tp3_hit_at: parse_dt_opt(28, row.get(28)?)?,
        sl_hit_at: parse_dt_opt(29, row.get(29)?)?,
        highest_price_after: row.get(30)?,
        lowest_price_after: row.get(31)?,
        scan_log_id: row.get(32)?,
    })
}

fn map_journal_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<JournalEntry> {
    let direction: Option<String> = row.get(4)?;
    let tags_json: String = row.get(15)?;
    let tags = serde_json::from_str(&tags_json)
        .map_err(|e| conversion_error(15, format!("bad tags: {e}")))?;

    Ok(JournalEntry {
        id: row.get(0)?,
        setup_id: row.get(1)?,
        asset_symbol: Symbol::new(row.get::<_, String>(2)?),
        strategy_name: row.get(3)?,
        direction: direction.map(|d| parse_enum(4, d)).transpose()?,
        action: parse_enum(5, row.get::<_, String>(5)?)?,
        outcome: parse_enum(6, row.get::<_, String>(6)?)?,
        actual_entry: row.get(7)?,
        actual_stop: row.get(8)?,
        actual_exit: row.get(9)?,
        position_size: row.get(10)?,
        pnl_absolute: row.get(11)?,
        pnl_r_multiple: row.get(12)?,
        planned_rr: row.get(13)?,
        notes: row.get(14)?,
        tags,
        created_at: parse_dt(16, row.get::<_, String>(16)?)?,
    })
}

// =============================================================================
// Tests
// =============================================================================
