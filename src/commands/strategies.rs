//! Strategy definition import and listing

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::info;

use setup_scanner::conditions::ConditionKind;
use setup_scanner::regime::MarketRegime;
use setup_scanner::store::{NewStrategy, ScannerStore, StrategyCondition};
use setup_scanner::types::{Direction, Timeframe};
use setup_scanner::Config;

/// On-disk strategy definition, validated on import.
#[derive(Debug, Deserialize)]
struct StrategyDef {
    name: String,
    #[serde(default)]
    description: Option<String>,
    direction: Direction,
    #[serde(default)]
    valid_regimes: Option<Vec<MarketRegime>>,
    conditions: Vec<ConditionDef>,
}

#[derive(Debug, Deserialize)]
struct ConditionDef {
    #[serde(rename = "type")]
    condition_type: String,
    timeframe: Timeframe,
    #[serde(default)]
    parameters: serde_json::Value,
    #[serde(default = "default_true")]
    is_required: bool,
}

fn default_true() -> bool {
    true
}

pub fn import(config: Config, file: String) -> Result<()> {
    let store = ScannerStore::open(&config.database.path)?;

    let text = std::fs::read_to_string(&file)
        .with_context(|| format!("Failed to read strategy file: {file}"))?;
    let defs: Vec<StrategyDef> =
        serde_json::from_str(&text).context("Failed to parse strategy definitions")?;

    for def in defs {
        let conditions = def
            .conditions
            .iter()
            .map(|c| {
                let kind = ConditionKind::from_parts(&c.condition_type, &c.parameters)
                    .with_context(|| format!("strategy '{}'", def.name))?;
                Ok(StrategyCondition {
                    kind,
                    timeframe: c.timeframe,
                    is_required: c.is_required,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        store.save_strategy(&NewStrategy {
            name: def.name.clone(),
            description: def.description,
            direction: def.direction,
            valid_regimes: def.valid_regimes,
            conditions,
        })?;
        info!("imported strategy '{}'", def.name);
    }

    Ok(())
}

pub fn list(config: Config) -> Result<()> {
    let store = ScannerStore::open(&config.database.path)?;
    let strategies = store.strategies(false)?;

    if strategies.is_empty() {
        info!("no strategies saved; import some with `strategies import --file <path>`");
        return Ok(());
    }

    for strategy in strategies {
        let regimes = match &strategy.valid_regimes {
            Some(regimes) => regimes
                .iter()
                .map(|r| r.as_str())
                .collect::<Vec<_>>()
                .join(","),
            None => "any".to_string(),
        };
        info!(
            "{} [{}] {} conditions, active={}, regimes={}",
            strategy.name,
            strategy.direction,
            strategy.conditions.len(),
            strategy.is_active,
            regimes
        );
        for condition in &strategy.conditions {
            info!(
                "  - {} on {}{}",
                condition.kind.type_name(),
                condition.timeframe,
                if condition.is_required {
                    ""
                } else {
                    " (bonus)"
                }
            );
        }
    }

    Ok(())
}
