//! Relational mirror of the summary tables.
//!
//! Summary tables are replaced wholesale on every aggregation run. The
//! customer-follower table is the exception: an external enrichment job
//! fills in follower counts, so rows are only ever seeded, never replaced.
//!
//! Staging can also read a legacy relational transaction table that predates
//! the snapshot pipeline.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::NaiveDateTime;
use serde::Deserialize;
use tracing::info;

use crate::snapshot::{Column, SnapshotError, Table, Value};

pub mod memory;
#[cfg(any(feature = "postgres", feature = "sqlite"))]
pub mod sql;

pub use memory::MemoryMirror;
#[cfg(any(feature = "postgres", feature = "sqlite"))]
pub use sql::{SqlDatabase, SqlMirror};

/// Column stamped on every mirrored row.
pub const UPDATED_DT_COLUMN: &str = "updated_dt";

/// Columns read from the legacy transaction table, already in staged shape.
pub const LEGACY_COLUMNS: [&str; 15] = [
    "id",
    "tgl_transaksi",
    "tanggal",
    "bulan",
    "tahun",
    "nama",
    "model",
    "alamat",
    "no_telp",
    "provinsi",
    "kota_kab",
    "instagram",
    "store",
    "harga",
    "kuantitas",
];

#[derive(Debug, thiserror::Error)]
pub enum MirrorError {
    #[cfg(any(feature = "postgres", feature = "sqlite"))]
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Query build error: {0}")]
    Query(String),

    #[error("Table not found: {0}")]
    TableNotFound(String),

    #[error("Unknown column {column} in {table}")]
    UnknownColumn { table: String, column: String },

    #[error(transparent)]
    Snapshot(#[from] SnapshotError),
}

pub type Result<T> = std::result::Result<T, MirrorError>;

/// Destination for summary tables.
///
/// Implementations:
/// - `SqlMirror<Sqlite>` / `SqlMirror<Postgres>`: sqlx + sea-query
/// - `MemoryMirror`: tests
#[async_trait]
pub trait SummaryMirror: Send + Sync {
    /// Replace the table's rows with `data`, creating the table if needed.
    ///
    /// Runs in one transaction. Returns the number of rows written.
    async fn replace(&self, table: &str, data: &Table) -> Result<usize>;

    /// Insert only the rows of `data` none of whose `key_columns` values
    /// already appear in the table. Existing rows are left untouched.
    ///
    /// Returns the number of rows inserted.
    async fn seed(&self, table: &str, data: &Table, key_columns: &[&str]) -> Result<usize>;

    /// Read the legacy transaction table, every column as text.
    async fn legacy_transactions(&self, table: &str) -> Result<Table>;
}

/// Copy `data` with an `updated_dt` column set to `now` on every row.
pub fn stamp_updated_dt(data: &Table, now: NaiveDateTime) -> Result<Table> {
    let existing = data.column_index(UPDATED_DT_COLUMN);
    let mut columns = data.columns().to_vec();
    if existing.is_none() {
        columns.push(Column::timestamp(UPDATED_DT_COLUMN));
    }

    let mut stamped = Table::new(columns);
    for row in data.rows() {
        let mut row = row.clone();
        match existing {
            Some(i) => row[i] = Value::Timestamp(now),
            None => row.push(Value::Timestamp(now)),
        }
        stamped.push_row(row)?;
    }
    Ok(stamped)
}

/// Keep the rows of `data` whose key values are all absent from `existing`.
///
/// `existing` maps each key column to the values already stored. Null keys
/// never match.
pub fn unseen_rows(
    table: &str,
    data: &Table,
    key_columns: &[&str],
    existing: &HashMap<String, HashSet<String>>,
) -> Result<Table> {
    let indices = key_columns
        .iter()
        .map(|name| {
            data.column_index(name).ok_or_else(|| MirrorError::UnknownColumn {
                table: table.to_string(),
                column: name.to_string(),
            })
        })
        .collect::<Result<Vec<_>>>()?;

    let mut fresh = Table::new(data.columns().to_vec());
    for row in data.rows() {
        let seen = key_columns.iter().zip(&indices).any(|(name, &i)| {
            !row[i].is_null()
                && existing
                    .get(*name)
                    .is_some_and(|values| values.contains(&row[i].to_string()))
        });
        if !seen {
            fresh.push_row(row.clone())?;
        }
    }
    Ok(fresh)
}

// ============================================================================
// Configuration
// ============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MirrorType {
    /// Summaries are only written as snapshots.
    #[default]
    None,
    Sqlite,
    Postgres,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct MirrorConfig {
    #[serde(rename = "type")]
    pub mirror_type: MirrorType,
    /// sqlx connection URL.
    pub url: String,
    /// Legacy transaction table merged during staging, if any.
    pub legacy_table: Option<String>,
}

/// Connect the configured mirror, or `None` when mirroring is off.
pub async fn init_mirror(
    config: &MirrorConfig,
) -> std::result::Result<Option<Arc<dyn SummaryMirror>>, Box<dyn std::error::Error + Send + Sync>> {
    match config.mirror_type {
        MirrorType::None => {
            info!("Relational mirror disabled");
            Ok(None)
        }
        MirrorType::Sqlite => {
            #[cfg(feature = "sqlite")]
            {
                let pool = sqlx::SqlitePool::connect(&config.url).await?;
                info!(mirror_type = "sqlite", "Relational mirror initialized");
                Ok(Some(Arc::new(SqlMirror::<sql::sqlite::Sqlite>::new(pool))))
            }

            #[cfg(not(feature = "sqlite"))]
            {
                Err("SQLite mirror requires the 'sqlite' feature".into())
            }
        }
        MirrorType::Postgres => {
            #[cfg(feature = "postgres")]
            {
                let pool = sqlx::PgPool::connect(&config.url).await?;
                info!(mirror_type = "postgres", "Relational mirror initialized");
                Ok(Some(Arc::new(SqlMirror::<sql::postgres::Postgres>::new(pool))))
            }

            #[cfg(not(feature = "postgres"))]
            {
                Err("PostgreSQL mirror requires the 'postgres' feature".into())
            }
        }
    }
}
