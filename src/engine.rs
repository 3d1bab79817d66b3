//! Scan orchestration engine
//!
//! Runs one full scan cycle: refresh the dynamic universe, classify the
//! market regime, evaluate every active strategy against every active asset,
//! create setups where all required conditions pass, then update the
//! lifecycle of existing setups.
//!
//! One scan runs at a time, gated by the `running` scan log. Triggering is
//! non-blocking: the scan log row is created before the background task
//! spawns, so pollers see the run immediately. Cancellation is cooperative,
//! checked between assets. Per-asset failures are collected into the scan
//! log; only universe-refresh and regime-classification failures abort a run.

use chrono::{Duration, Utc};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::conditions::ConditionOutcome;
use crate::levels::calculate_key_levels;
use crate::market::MarketData;
use crate::regime::{self, MarketRegime};
use crate::series::EnrichedSeries;
use crate::store::{
    Asset, NewSetup, ScanIssue, ScanLog, ScanStatus, ScannerStore, Strategy,
};
use crate::types::{CancelToken, Direction, SetupStatus, Symbol, Timeframe};

/// Open-interest readings fetched per asset for trend conditions
const OPEN_INTEREST_WINDOW: usize = 8;

/// Errors surfaced by the scan-trigger interface
#[derive(Debug, Error)]
pub enum ScanError {
    #[error("a scan is already running (scan {scan_id})")]
    AlreadyRunning { scan_id: i64 },

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

/// Snapshot of the trigger interface's view of the engine
#[derive(Debug, Clone, Copy)]
pub struct ScanState {
    pub is_running: bool,
    pub scan_id: Option<i64>,
}

/// Per-strategy condition evaluation tally
#[derive(Debug, Default, Clone, Copy)]
pub struct ConditionTally {
    pub all_required_met: bool,
    pub required_met: u32,
    pub required_total: u32,
    pub bonus_met: u32,
    pub bonus_total: u32,
}

enum CycleEnd {
    Completed,
    Cancelled,
}

struct RunningScan {
    scan_id: i64,
    token: CancelToken,
    handle: Option<JoinHandle<()>>,
}

pub struct ScanEngine {
    store: Arc<ScannerStore>,
    market: Arc<dyn MarketData>,
    config: Config,
    current: Mutex<Option<RunningScan>>,
}

impl ScanEngine {
    pub fn new(store: Arc<ScannerStore>, market: Arc<dyn MarketData>, config: Config) -> Self {
        ScanEngine {
            store,
            market,
            config,
            current: Mutex::new(None),
        }
    }

    /// Start a scan in the background and return its scan log id.
    ///
    /// The scan log row exists (status `running`) before this returns, so
    /// the run is observable the instant the caller gets the id. Fails with
    /// [`ScanError::AlreadyRunning`] if another scan holds the gate; nothing
    /// is written in that case.
    pub fn trigger_scan(self: &Arc<Self>) -> Result<i64, ScanError> {
        let mut current = self.current.lock().unwrap();

        if let Some(running) = self.store.running_scan().map_err(ScanError::Internal)? {
            warn!("scan trigger rejected: scan {} still running", running.id);
            return Err(ScanError::AlreadyRunning {
                scan_id: running.id,
            });
        }

        let scan_id = self.store.create_scan_log().map_err(ScanError::Internal)?;
        let token = CancelToken::new();

        let engine = Arc::clone(self);
        let task_token = token.clone();
        let handle = tokio::spawn(async move {
            engine.run_scan(scan_id, &task_token).await;
        });

        *current = Some(RunningScan {
            scan_id,
            token,
            handle: Some(handle),
        });
        info!("scan {scan_id} triggered");
        Ok(scan_id)
    }

    pub fn state(&self) -> Result<ScanState, ScanError> {
        let running = self.store.running_scan().map_err(ScanError::Internal)?;
        Ok(ScanState {
            is_running: running.is_some(),
            scan_id: running.map(|log| log.id),
        })
    }

    /// Request cooperative cancellation of a running scan. Returns false if
    /// that scan is not running.
    pub fn request_cancel(&self, scan_id: i64) -> bool {
        let current = self.current.lock().unwrap();
        match current.as_ref() {
            Some(running) if running.scan_id == scan_id && running.handle.is_some() => {
                running.token.cancel();
                info!("cancellation requested for scan {scan_id}");
                true
            }
            _ => {
                warn!("cancellation requested for scan {scan_id}, but it is not running");
                false
            }
        }
    }

    /// Wait for the currently-spawned scan task to finish, if any.
    pub async fn join_current(&self) {
        let handle = {
            let mut current = self.current.lock().unwrap();
            current.as_mut().and_then(|running| running.handle.take())
        };
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!("scan task panicked: {e}");
            }
        }
    }

    /// Execute a full scan cycle against an existing `running` scan log.
    ///
    /// Normally invoked from the task spawned by [`trigger_scan`]; exposed
    /// so callers can drive a scan to completion with their own token.
    pub async fn run_scan(&self, scan_id: i64, cancel: &CancelToken) {
        let mut log = match self.store.scan_log(scan_id) {
            Ok(Some(log)) => log,
            Ok(None) => {
                error!("scan {scan_id} has no scan log, aborting");
                return;
            }
            Err(e) => {
                error!("failed to load scan log {scan_id}: {e:#}");
                return;
            }
        };

        let mut issues = Vec::new();
        let outcome = self.scan_cycle(&mut log, &mut issues, cancel).await;

        log.finished_at = Some(Utc::now());
        log.status = match outcome {
            Ok(CycleEnd::Completed) => ScanStatus::Completed,
            Ok(CycleEnd::Cancelled) => {
                info!("scan {scan_id} cancelled at checkpoint");
                issues.push(ScanIssue::general("scan cancelled by request"));
                ScanStatus::Cancelled
            }
            Err(e) => {
                error!("scan {scan_id} failed: {e:#}");
                issues.push(ScanIssue::general(format!("scan failed: {e:#}")));
                ScanStatus::Failed
            }
        };
        log.issues = issues;

        if let Err(e) = self.store.update_scan_log(&log) {
            error!("failed to finalize scan log {scan_id}: {e:#}");
        }
    }

    async fn scan_cycle(
        &self,
        log: &mut ScanLog,
        issues: &mut Vec<ScanIssue>,
        cancel: &CancelToken,
    ) -> anyhow::Result<CycleEnd> {
        use anyhow::Context;

        // Universe refresh. A fetch failure here is fatal: scanning a stale
        // or empty universe is meaningless.
        let quote = &self.config.exchange.quote_currency;
        let top = self
            .market
            .top_symbols(quote, self.config.universe.dynamic_size)
            .await
            .context("universe refresh failed")?;
        if top.is_empty() {
            warn!("universe refresh returned no symbols, keeping existing universe");
            issues.push(ScanIssue::general(
                "universe refresh returned no symbols, keeping existing universe",
            ));
        } else {
            self.store.apply_dynamic_universe(&top, quote)?;
        }

        if cancel.is_cancelled() {
            return Ok(CycleEnd::Cancelled);
        }

        // Regime classification from the reference asset. Fetch failure is
        // fatal; classification itself is total.
        let reference = Symbol::new(&self.config.universe.reference_symbol);
        let candles = self
            .market
            .ohlcv(&reference, Timeframe::D1, self.config.scan.candle_limit)
            .await
            .context("regime classification failed: reference data unavailable")?;
        let reading = regime::classify(&mut EnrichedSeries::new(candles));
        log.market_regime = Some(reading.regime);
        self.store.update_scan_log(log)?;
        info!(
            "market regime: {} ({:.0}% confidence), {}",
            reading.regime,
            reading.confidence * 100.0,
            reading.description
        );

        if cancel.is_cancelled() {
            return Ok(CycleEnd::Cancelled);
        }

        let assets = self.store.active_assets()?;
        let strategies: Vec<Strategy> = self
            .store
            .active_strategies()?
            .into_iter()
            .filter(|s| {
                if s.conditions.is_empty() {
                    debug!("skipping strategy '{}': no conditions", s.name);
                    return false;
                }
                if !s.allows_regime(reading.regime) {
                    debug!(
                        "skipping strategy '{}': not valid in {} regime",
                        s.name, reading.regime
                    );
                    return false;
                }
                true
            })
            .collect();

        if assets.is_empty() {
            warn!("no active assets to scan");
            issues.push(ScanIssue::general("no active assets to scan"));
        }
        if strategies.is_empty() {
            warn!("no strategies eligible in the current regime");
            issues.push(ScanIssue::general("no strategies eligible in this regime"));
        }

        let timeframes: BTreeSet<Timeframe> = strategies
            .iter()
            .flat_map(|s| s.conditions.iter().map(|c| c.timeframe))
            .collect();

        info!(
            "scanning {} assets with {} strategies over {} timeframes",
            assets.len(),
            strategies.len(),
            timeframes.len()
        );

        let mut assets_scanned = 0u32;
        let mut setups_found = 0u32;

        for asset in &assets {
            // Cooperative cancellation checkpoint between assets
            if cancel.is_cancelled() {
                info!(
                    "scan cancelled, processed {assets_scanned}/{} assets",
                    assets.len()
                );
                log.assets_scanned = assets_scanned;
                log.setups_found = setups_found;
                return Ok(CycleEnd::Cancelled);
            }

            match self
                .evaluate_asset(asset, &strategies, &timeframes, reading.regime, log.id)
                .await
            {
                Ok(count) => setups_found += count,
                Err(e) => {
                    warn!("error scanning {}: {e:#}", asset.symbol);
                    issues.push(ScanIssue::for_symbol(&asset.symbol, format!("{e:#}")));
                }
            }
            assets_scanned += 1;
        }

        log.assets_scanned = assets_scanned;
        log.setups_found = setups_found;

        if cancel.is_cancelled() {
            return Ok(CycleEnd::Cancelled);
        }

        let (expired, invalidated) = self.update_setup_lifecycle(issues).await?;
        log.setups_expired = expired;
        log.setups_invalidated = invalidated;

        info!(
            "scan complete: {assets_scanned} assets, {setups_found} new setups, \
             {expired} expired, {invalidated} invalidated"
        );
        Ok(CycleEnd::Completed)
    }

    /// Evaluate all strategies against one asset. Returns the number of new
    /// setups created.
    async fn evaluate_asset(
        &self,
        asset: &Asset,
        strategies: &[Strategy],
        timeframes: &BTreeSet<Timeframe>,
        regime: MarketRegime,
        scan_log_id: i64,
    ) -> anyhow::Result<u32> {
        if strategies.is_empty() {
            return Ok(0);
        }

        let mut data: BTreeMap<Timeframe, EnrichedSeries> = BTreeMap::new();
        let mut fetch_failures = Vec::new();

        for &timeframe in timeframes {
            match self
                .market
                .ohlcv(&asset.symbol, timeframe, self.config.scan.candle_limit)
                .await
            {
                Ok(candles) => {
                    data.insert(timeframe, EnrichedSeries::new(candles));
                }
                Err(e) => fetch_failures.push(format!("{timeframe}: {e}")),
            }
        }

        if data.is_empty() && !timeframes.is_empty() {
            anyhow::bail!("no market data: {}", fetch_failures.join("; "));
        }
        for failure in &fetch_failures {
            warn!("partial data for {}: {}", asset.symbol, failure);
        }

        let funding_rate = self.market.funding_rate(&asset.symbol).await;
        let oi_history = self
            .market
            .open_interest_history(&asset.symbol, OPEN_INTEREST_WINDOW)
            .await;
        let open_interest = oi_history.as_ref().and_then(|h| h.last().copied());

        for series in data.values_mut() {
            series.funding_rate = funding_rate;
            series.open_interest = oi_history.clone();
            series.enrich_defaults();
        }

        // Live ticker preferred; fall back to the freshest close we have
        // (BTreeMap iterates shortest timeframe first)
        let current_price = match self.market.ticker_price(&asset.symbol).await {
            Ok(price) if price > 0.0 => price,
            _ => data
                .values()
                .find_map(|s| s.last_candle().map(|c| c.close))
                .ok_or_else(|| anyhow::anyhow!("no price data"))?,
        };

        let mut created = 0u32;

        for strategy in strategies {
            let tally = evaluate_strategy_conditions(&asset.symbol, strategy, &mut data);
            let direction = strategy.direction.scan_side();

            // At most one active setup per (asset, strategy, direction):
            // an unresolved opportunity is not re-alerted
            if self
                .store
                .has_active_setup(asset.id, &strategy.name, direction)?
            {
                debug!(
                    "active setup already exists for {}/{}/{}",
                    asset.symbol, strategy.name, direction
                );
                continue;
            }

            if !tally.all_required_met {
                continue;
            }

            // Levels come from the entry timeframe: the first condition's
            let entry_tf = strategy
                .conditions
                .first()
                .map(|c| c.timeframe)
                .filter(|tf| data.contains_key(tf))
                .or_else(|| data.keys().next().copied());
            let series = match entry_tf.and_then(|tf| data.get_mut(&tf)) {
                Some(series) => series,
                None => continue,
            };

            let levels = match calculate_key_levels(series, direction, current_price) {
                Some(levels) => levels,
                None => {
                    debug!(
                        "dropping candidate {}/{}: no valid levels",
                        asset.symbol, strategy.name
                    );
                    continue;
                }
            };

            self.store.insert_setup(&NewSetup {
                asset_id: asset.id,
                symbol: asset.symbol.clone(),
                strategy_name: strategy.name.clone(),
                direction,
                entry_price: levels.entry_price,
                stop_loss: levels.stop_loss,
                take_profit_1: levels.take_profit_1,
                take_profit_2: levels.take_profit_2,
                take_profit_3: levels.take_profit_3,
                risk_reward: levels.risk_reward,
                price_at_detection: current_price,
                funding_rate,
                open_interest,
                market_regime: Some(regime),
                required_conditions_met: tally.required_met,
                bonus_conditions_met: tally.bonus_met,
                total_conditions: tally.required_total + tally.bonus_total,
                expires_at: Utc::now() + Duration::hours(self.config.scan.setup_expiry_hours),
                scan_log_id: Some(scan_log_id),
            })?;
            created += 1;
            info!(
                "new setup: {} / {} ({direction}) rr={:.2}",
                asset.symbol, strategy.name, levels.risk_reward
            );
        }

        Ok(created)
    }

    /// Re-check all active setups against the latest 1h candle: expiry, stop
    /// invalidation, take-profit hits, and price watermarks.
    async fn update_setup_lifecycle(
        &self,
        issues: &mut Vec<ScanIssue>,
    ) -> anyhow::Result<(u32, u32)> {
        let now = Utc::now();
        let mut expired = 0u32;
        let mut invalidated = 0u32;

        for mut setup in self.store.active_setups()? {
            if now >= setup.expires_at {
                setup.status = SetupStatus::Expired;
                self.store.update_setup(&setup)?;
                expired += 1;
                debug!("setup {} ({}) expired", setup.id, setup.symbol);
                continue;
            }

            let candles = match self.market.ohlcv(&setup.symbol, Timeframe::H1, 2).await {
                Ok(candles) => candles,
                Err(e) => {
                    warn!("lifecycle update failed for {}: {e}", setup.symbol);
                    issues.push(ScanIssue::for_symbol(
                        &setup.symbol,
                        format!("lifecycle update failed: {e}"),
                    ));
                    continue;
                }
            };
            let last = match candles.last() {
                Some(last) => last,
                None => continue,
            };
            let (high, low) = (last.high, last.low);

            if setup.highest_price_after.map_or(true, |h| high > h) {
                setup.highest_price_after = Some(high);
            }
            if setup.lowest_price_after.map_or(true, |l| low < l) {
                setup.lowest_price_after = Some(low);
            }

            let stop_crossed = match setup.direction {
                Direction::Short => high >= setup.stop_loss,
                _ => low <= setup.stop_loss,
            };
            if stop_crossed {
                setup.status = SetupStatus::Invalidated;
                setup.invalidated_at = Some(now);
                setup.sl_hit = true;
                setup.sl_hit_at = Some(now);
                self.store.update_setup(&setup)?;
                invalidated += 1;
                info!("setup {} ({}) invalidated at stop", setup.id, setup.symbol);
                continue;
            }

            check_tp_hits(&mut setup, high, low, now);
            self.store.update_setup(&setup)?;
        }

        Ok((expired, invalidated))
    }
}

/// Evaluate all of a strategy's conditions against per-timeframe data.
///
/// Undefined outcomes gate like a miss but are logged separately so an
/// insufficient-history gap is distinguishable from an explicit false.
pub fn evaluate_strategy_conditions(
    symbol: &Symbol,
    strategy: &Strategy,
    data: &mut BTreeMap<Timeframe, EnrichedSeries>,
) -> ConditionTally {
    let mut tally = ConditionTally {
        all_required_met: true,
        ..Default::default()
    };

    for condition in &strategy.conditions {
        let outcome = match data.get_mut(&condition.timeframe) {
            Some(series) => condition.kind.evaluate(series),
            None => ConditionOutcome::Undefined,
        };

        match outcome {
            ConditionOutcome::Undefined => debug!(
                "condition {} ({}) undefined for {}: insufficient data",
                condition.kind.type_name(),
                condition.timeframe,
                symbol
            ),
            ConditionOutcome::NotMet => debug!(
                "condition {} ({}) not met for {}",
                condition.kind.type_name(),
                condition.timeframe,
                symbol
            ),
            ConditionOutcome::Met => {}
        }

        if condition.is_required {
            tally.required_total += 1;
            if outcome.is_met() {
                tally.required_met += 1;
            } else {
                tally.all_required_met = false;
            }
        } else {
            tally.bonus_total += 1;
            if outcome.is_met() {
                tally.bonus_met += 1;
            }
        }
    }

    tally
}

fn check_tp_hits(setup: &mut crate::store::Setup, high: f64, low: f64, now: chrono::DateTime<Utc>) {
    let targets = [
        setup.take_profit_1,
        setup.take_profit_2,
        setup.take_profit_3,
    ];
    let crossed: Vec<bool> = targets
        .iter()
        .map(|&target| match setup.direction {
            Direction::Short => low <= target,
            _ => high >= target,
        })
        .collect();

    if !setup.tp1_hit && crossed[0] {
        setup.tp1_hit = true;
        setup.tp1_hit_at = Some(now);
    }
    if !setup.tp2_hit && crossed[1] {
        setup.tp2_hit = true;
        setup.tp2_hit_at = Some(now);
    }
    if !setup.tp3_hit && crossed[2] {
        setup.tp3_hit = true;
        setup.tp3_hit_at = Some(now);
    }
}
