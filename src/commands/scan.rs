//! Scan command implementation

use anyhow::Result;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use setup_scanner::engine::{ScanEngine, ScanError};
use setup_scanner::exchange::BinanceMarket;
use setup_scanner::store::{ScanIssue, ScanStatus, ScannerStore};
use setup_scanner::Config;

pub async fn run(config: Config, every: Option<u64>) -> Result<()> {
    let store = Arc::new(ScannerStore::open(&config.database.path)?);
    let market = Arc::new(BinanceMarket::new(&config.exchange)?);

    // A scan log left running by a crashed process would block the trigger
    // gate forever; mark it failed before starting.
    if let Some(mut stale) = store.running_scan()? {
        warn!("marking stale running scan {} as failed", stale.id);
        stale.status = ScanStatus::Failed;
        stale.finished_at = Some(Utc::now());
        stale
            .issues
            .push(ScanIssue::general("scan interrupted by process restart"));
        store.update_scan_log(&stale)?;
    }

    let engine = Arc::new(ScanEngine::new(
        Arc::clone(&store),
        market,
        config.clone(),
    ));

    loop {
        match engine.trigger_scan() {
            Ok(scan_id) => {
                engine.join_current().await;
                if let Some(log) = store.scan_log(scan_id)? {
                    info!(
                        "scan {} {}: {} assets scanned, {} setups found, {} expired, {} invalidated, {} issues",
                        log.id,
                        log.status.as_str(),
                        log.assets_scanned,
                        log.setups_found,
                        log.setups_expired,
                        log.setups_invalidated,
                        log.issues.len()
                    );
                }
            }
            Err(ScanError::AlreadyRunning { scan_id }) => {
                warn!("scan {scan_id} is already running, skipping this trigger");
            }
            Err(e) => return Err(e.into()),
        }

        let minutes = match every {
            Some(minutes) => minutes,
            None => break,
        };
        info!("next scan in {minutes} minutes");
        tokio::time::sleep(Duration::from_secs(minutes * 60)).await;
    }

    Ok(())
}
