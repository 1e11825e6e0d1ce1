//! tally-aggregator: Summary aggregation
//!
//! Rebuilds the summary tables of every configured tenant from its latest
//! transaction snapshot and mirrors them to the relational database.
//!
//! ## Modes
//! - `once` (default): run every tenant once, print the reports, exit
//! - `schedule`: run on `aggregation.interval_secs` until Ctrl-C
//!
//! ## Configuration
//! - TALLY_AGGREGATOR_MODE: `once` or `schedule`
//! - TALLY_CONFIG: Path to a YAML config file (optional)
//! - TALLY_LOG: Log filter (default: info)

use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use tally::aggregation::{AggregationEngine, AggregationScheduler, RunReport};
use tally::config::{Config, AGGREGATOR_MODE_ENV_VAR};
use tally::mirror::init_mirror;
use tally::object_store::init_object_store;
use tally::snapshot::SnapshotStore;
use tally::utils::bootstrap::{connect_with_retry, init_tracing};
use tally::utils::retry::connection_backoff;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let config = Config::load(None)?;
    if config.aggregation.tenants.is_empty() {
        return Err("aggregation.tenants is empty; nothing to aggregate".into());
    }

    let store = connect_with_retry("object store", connection_backoff(), || {
        init_object_store(&config.object_store)
    })
    .await
    .map_err(|e| e as Box<dyn std::error::Error>)?;
    let mirror = connect_with_retry("mirror", connection_backoff(), || {
        init_mirror(&config.mirror)
    })
    .await
    .map_err(|e| e as Box<dyn std::error::Error>)?;

    let mut engine = AggregationEngine::new(Arc::new(SnapshotStore::new(store)))
        .parallel(config.aggregation.parallel);
    if let Some(mirror) = mirror {
        engine = engine.with_mirror(mirror);
    }
    if let Some(table) = &config.mirror.legacy_table {
        engine = engine.with_legacy_table(table.clone());
    }

    let scheduler = AggregationScheduler::new(
        Arc::new(engine),
        config.aggregation.tenants.clone(),
        Duration::from_secs(config.aggregation.interval_secs),
    );

    let mode = std::env::var(AGGREGATOR_MODE_ENV_VAR).unwrap_or_else(|_| "once".to_string());
    match mode.as_str() {
        "schedule" => {
            scheduler.start().await;
            info!("tally-aggregator scheduled");
            tokio::signal::ctrl_c().await?;
            scheduler.stop().await;
            Ok(())
        }
        "once" => {
            let reports = scheduler.run_once().await;
            reports.iter().for_each(print_report);
            if reports.iter().any(|r| r.failed() > 0) {
                return Err("one or more summary jobs failed".into());
            }
            Ok(())
        }
        other => Err(format!("unknown {} '{}'", AGGREGATOR_MODE_ENV_VAR, other).into()),
    }
}

fn print_report(report: &RunReport) {
    println!(
        "{}: {} ok, {} failed in {:?}",
        report.tenant,
        report.succeeded(),
        report.failed(),
        report.duration
    );
    for outcome in &report.outcomes {
        match &outcome.result {
            Ok(rows) => println!("  {:<32} {} rows", outcome.table, rows),
            Err(e) => println!("  {:<32} FAILED: {}", outcome.table, e),
        }
    }
}
