//! Summary aggregation over transaction snapshots.
//!
//! A run stages the tenant's latest transaction snapshot into sales rows,
//! then recomputes every summary from them. Each summary is written in full
//! to `ETL/{table}.parquet` and mirrored to the relational table of the same
//! name. Jobs are independent: one failing job does not stop the others.

mod jobs;
mod scheduler;
mod staging;

pub use jobs::{compute, contact_age, Summary, CHAT_TABLE};
pub use scheduler::AggregationScheduler;
pub use staging::{normalize_instagram, stage, SalesRow, STAGED_TABLE};

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{NaiveDateTime, Utc};
use futures::future::join_all;
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::mirror::{unseen_rows, MirrorError, SummaryMirror};
use crate::model::Transaction;
use crate::snapshot::{
    bucket_for_tenant, etl_key, SnapshotError, SnapshotStore, Table, TRANSACTION_PREFIX,
};

#[derive(Debug, thiserror::Error)]
pub enum AggregationError {
    #[error("No transaction snapshot for tenant {0}")]
    NoTransactions(String),

    #[error("Snapshot error: {0}")]
    Snapshot(#[from] SnapshotError),

    #[error("Mirror error: {0}")]
    Mirror(#[from] MirrorError),

    #[error("Staging failed: {0}")]
    Staging(String),
}

pub type Result<T> = std::result::Result<T, AggregationError>;

/// Result of one summary job.
#[derive(Debug)]
pub struct JobOutcome {
    pub table: &'static str,
    /// Rows written to the snapshot, or why the job failed.
    pub result: Result<usize>,
}

/// Result of one `run_all`.
#[derive(Debug)]
pub struct RunReport {
    pub tenant: String,
    pub duration: Duration,
    /// Staged row count, or why staging failed.
    pub staged: Result<usize>,
    /// One entry per summary, in [`Summary::ALL`] order.
    pub outcomes: Vec<JobOutcome>,
}

impl RunReport {
    pub fn succeeded(&self) -> usize {
        self.outcomes.iter().filter(|o| o.result.is_ok()).count()
    }

    pub fn failed(&self) -> usize {
        self.outcomes.len() - self.succeeded()
    }

    pub fn outcome(&self, table: &str) -> Option<&JobOutcome> {
        self.outcomes.iter().find(|o| o.table == table)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AggregationConfig {
    /// User groups aggregated by the scheduler and the one-shot binary.
    pub tenants: Vec<String>,
    /// Run the summary jobs concurrently.
    pub parallel: bool,
    /// Scheduler period.
    pub interval_secs: u64,
}

impl Default for AggregationConfig {
    fn default() -> Self {
        Self {
            tenants: Vec::new(),
            parallel: false,
            interval_secs: 3600,
        }
    }
}

/// Rebuilds the summary tables for one tenant at a time.
pub struct AggregationEngine {
    snapshots: Arc<SnapshotStore>,
    mirror: Option<Arc<dyn SummaryMirror>>,
    legacy_table: Option<String>,
    parallel: bool,
    reference_time: Option<NaiveDateTime>,
}

impl AggregationEngine {
    pub fn new(snapshots: Arc<SnapshotStore>) -> Self {
        Self {
            snapshots,
            mirror: None,
            legacy_table: None,
            parallel: false,
            reference_time: None,
        }
    }

    /// Mirror every summary to relational tables.
    pub fn with_mirror(mut self, mirror: Arc<dyn SummaryMirror>) -> Self {
        self.mirror = Some(mirror);
        self
    }

    /// Merge rows of a legacy relational transaction table during staging.
    /// Requires a mirror.
    pub fn with_legacy_table(mut self, table: impl Into<String>) -> Self {
        self.legacy_table = Some(table.into());
        self
    }

    pub fn parallel(mut self, parallel: bool) -> Self {
        self.parallel = parallel;
        self
    }

    /// Fix the clock used for contact ages. Defaults to the current time.
    pub fn with_reference_time(mut self, now: NaiveDateTime) -> Self {
        self.reference_time = Some(now);
        self
    }

    /// Stage the tenant's transactions and rebuild every summary.
    ///
    /// Never fails as a whole: staging and job errors are in the report.
    pub async fn run_all(&self, tenant: &str) -> RunReport {
        let started = Instant::now();
        let bucket = bucket_for_tenant(tenant);
        let now = self
            .reference_time
            .unwrap_or_else(|| Utc::now().naive_utc());
        info!(tenant = %tenant, "Aggregation run started");

        let (staged, outcomes) = match self.stage(tenant, &bucket).await {
            Ok(sales) => (Ok(sales.len()), self.run_jobs(&bucket, &sales, now).await),
            Err(e) => {
                warn!(tenant = %tenant, error = %e, "Staging failed, skipping every job");
                let outcomes = Summary::ALL
                    .iter()
                    .map(|s| JobOutcome {
                        table: s.table_name(),
                        result: Err(AggregationError::Staging(e.to_string())),
                    })
                    .collect();
                (Err(e), outcomes)
            }
        };

        let report = RunReport {
            tenant: tenant.to_string(),
            duration: started.elapsed(),
            staged,
            outcomes,
        };
        info!(
            tenant = %tenant,
            succeeded = report.succeeded(),
            failed = report.failed(),
            duration_ms = report.duration.as_millis() as u64,
            "Aggregation run finished"
        );
        report
    }

    /// Build the staged sales rows and write `ETL/tb_transaksi.parquet`.
    async fn stage(&self, tenant: &str, bucket: &str) -> Result<Vec<SalesRow>> {
        let latest = match self.snapshots.read_latest(bucket, TRANSACTION_PREFIX).await {
            Ok(latest) => latest,
            Err(SnapshotError::NotFound { .. }) => {
                return Err(AggregationError::NoTransactions(tenant.to_string()))
            }
            Err(e) => return Err(e.into()),
        };
        let transactions: Vec<Transaction> = latest.table.to_records()?;

        let legacy = self.legacy_rows().await?;
        let sales = stage(&transactions, &legacy);

        let table = Table::from_records(&sales)?;
        self.snapshots
            .write(bucket, &etl_key(STAGED_TABLE), &table)
            .await?;
        debug!(
            tenant = %tenant,
            snapshot = %latest.meta.key,
            legacy = legacy.len(),
            rows = sales.len(),
            "Staged transactions"
        );
        Ok(sales)
    }

    async fn legacy_rows(&self) -> Result<Vec<SalesRow>> {
        let Some(table) = &self.legacy_table else {
            return Ok(Vec::new());
        };
        let Some(mirror) = &self.mirror else {
            warn!(legacy_table = %table, "Legacy table configured without a mirror, skipping");
            return Ok(Vec::new());
        };
        let legacy = mirror.legacy_transactions(table).await?;
        Ok(legacy
            .iter()
            .map(|row| SalesRow::from_legacy(&row))
            .collect::<std::result::Result<Vec<_>, _>>()?)
    }

    async fn run_jobs(&self, bucket: &str, sales: &[SalesRow], now: NaiveDateTime) -> Vec<JobOutcome> {
        if self.parallel {
            join_all(
                Summary::ALL
                    .iter()
                    .map(|s| self.run_job(bucket, *s, sales, now)),
            )
            .await
        } else {
            let mut outcomes = Vec::with_capacity(Summary::ALL.len());
            for summary in Summary::ALL {
                outcomes.push(self.run_job(bucket, summary, sales, now).await);
            }
            outcomes
        }
    }

    async fn run_job(
        &self,
        bucket: &str,
        summary: Summary,
        sales: &[SalesRow],
        now: NaiveDateTime,
    ) -> JobOutcome {
        let table = summary.table_name();
        let result = self.execute(bucket, summary, sales, now).await;
        match &result {
            Ok(rows) => debug!(bucket = %bucket, table = %table, rows = rows, "Summary rebuilt"),
            Err(e) => warn!(bucket = %bucket, table = %table, error = %e, "Summary job failed"),
        }
        JobOutcome { table, result }
    }

    async fn execute(
        &self,
        bucket: &str,
        summary: Summary,
        sales: &[SalesRow],
        now: NaiveDateTime,
    ) -> Result<usize> {
        let chat = match summary {
            Summary::Wa => {
                self.snapshots
                    .read_optional(bucket, &etl_key(CHAT_TABLE))
                    .await?
            }
            _ => None,
        };
        let data = compute(summary, sales, chat.as_ref(), now)?;
        let name = summary.table_name();
        let key = etl_key(name);

        if summary.is_seed_only() {
            // Keep previously seeded rows and add only new handles.
            let previous = self.snapshots.read_optional(bucket, &key).await?;
            let merged = match previous {
                Some(previous) => merge_seeded(name, previous, &data, summary.seed_keys())?,
                None => data.clone(),
            };
            self.snapshots.write(bucket, &key, &merged).await?;
            if let Some(mirror) = &self.mirror {
                mirror.seed(name, &data, summary.seed_keys()).await?;
            }
            return Ok(merged.len());
        }

        self.snapshots.write(bucket, &key, &data).await?;
        if let Some(mirror) = &self.mirror {
            mirror.replace(name, &data).await?;
        }
        Ok(data.len())
    }
}

/// `previous` plus the rows of `fresh` none of whose keys it already holds.
fn merge_seeded(table: &str, previous: Table, fresh: &Table, keys: &[&str]) -> Result<Table> {
    let mut existing = HashMap::new();
    for key in keys {
        let values: HashSet<String> = previous
            .iter()
            .map(|row| row.get(key))
            .filter(|v| !v.is_null())
            .map(|v| v.to_string())
            .collect();
        existing.insert(key.to_string(), values);
    }
    let unseen = unseen_rows(table, fresh, keys, &existing)?;

    let mut merged = previous;
    let layout = merged.columns().to_vec();
    for row in unseen.iter() {
        merged.push_row(layout.iter().map(|c| row.get(&c.name).clone()).collect())?;
    }
    Ok(merged)
}
