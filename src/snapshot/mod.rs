//! Columnar snapshots kept in object storage.
//!
//! Each tenant owns one bucket, `customer-{user_group}`. Inside it:
//!
//! ```text
//! TRANSACTION/transaction_{YYYYmmddHHMMSSfffffffff}.parquet   # versioned
//! ETL/tb_transaksi.parquet                                     # staged rows
//! ETL/tb_sum_*.parquet                                         # summaries
//! ETL/tb_chat_wa.parquet                                       # external input
//! ```
//!
//! Transaction snapshots are never rewritten: each mutation writes a new
//! file, and readers pick the one with the greatest last-modified time
//! (ties broken by key). Summary files have fixed keys and are overwritten.

mod codec;
mod compaction;
mod table;

pub use codec::{decode, encode, CodecError};
pub use compaction::{CompactionConfig, SnapshotCompactor};
pub use table::{Column, ColumnType, Record, RowRef, Table, Value};

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::object_store::{ObjectMeta, ObjectStore, ObjectStoreError};

/// Prefix of the versioned transaction snapshots.
pub const TRANSACTION_PREFIX: &str = "TRANSACTION/";

/// Prefix of staged and summary tables.
pub const ETL_PREFIX: &str = "ETL/";

/// Errors that can occur during snapshot operations.
#[derive(Debug, thiserror::Error)]
pub enum SnapshotError {
    #[error("No snapshot under {bucket}/{prefix}")]
    NotFound { bucket: String, prefix: String },

    #[error("Object store error: {0}")]
    Store(#[from] ObjectStoreError),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Schema error: {0}")]
    Schema(String),
}

impl SnapshotError {
    /// Whether retrying later might succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            SnapshotError::Store(ObjectStoreError::Unavailable(_))
                | SnapshotError::Store(ObjectStoreError::Io(_))
        )
    }
}

/// Result type for snapshot operations.
pub type Result<T> = std::result::Result<T, SnapshotError>;

/// Bucket name for a tenant: `customer-{user_group}`, lowercased, with any
/// character outside `[a-z0-9.-]` replaced by `-`.
pub fn bucket_for_tenant(user_group: &str) -> String {
    let group: String = user_group
        .trim()
        .to_lowercase()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '.' || c == '-' {
                c
            } else {
                '-'
            }
        })
        .collect();
    format!("customer-{}", group)
}

/// Key for a new transaction snapshot written at `at`.
pub fn transaction_key(at: DateTime<Utc>) -> String {
    format!(
        "{}transaction_{}.parquet",
        TRANSACTION_PREFIX,
        at.format("%Y%m%d%H%M%S%9f")
    )
}

/// Fixed key for a staged or summary table.
pub fn etl_key(table_name: &str) -> String {
    format!("{}{}.parquet", ETL_PREFIX, table_name)
}

/// Pick the latest version: greatest last-modified, then greatest key.
pub fn latest_of(objects: &[ObjectMeta]) -> Option<&ObjectMeta> {
    objects
        .iter()
        .filter(|o| o.key.ends_with(".parquet"))
        .max_by(|a, b| {
            a.last_modified
                .cmp(&b.last_modified)
                .then_with(|| a.key.cmp(&b.key))
        })
}

/// A decoded snapshot together with where it came from.
#[derive(Debug, Clone)]
pub struct Versioned {
    pub meta: ObjectMeta,
    pub table: Table,
}

/// Typed snapshot access over an [`ObjectStore`].
pub struct SnapshotStore {
    store: Arc<dyn ObjectStore>,
    /// Buckets known to exist, so creation is checked once per process.
    known_buckets: Mutex<HashSet<String>>,
}

impl SnapshotStore {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self {
            store,
            known_buckets: Mutex::new(HashSet::new()),
        }
    }

    pub fn object_store(&self) -> &Arc<dyn ObjectStore> {
        &self.store
    }

    /// Create the bucket on first use.
    pub async fn ensure_bucket(&self, bucket: &str) -> Result<()> {
        let mut known = self.known_buckets.lock().await;
        if known.contains(bucket) {
            return Ok(());
        }
        if !self.store.bucket_exists(bucket).await? {
            self.store.create_bucket(bucket).await?;
            info!(bucket = %bucket, "Created bucket");
        }
        known.insert(bucket.to_string());
        Ok(())
    }

    /// Resolve the latest version under a prefix.
    pub async fn latest_version(&self, bucket: &str, prefix: &str) -> Result<ObjectMeta> {
        let objects = self.store.list(bucket, prefix).await?;
        latest_of(&objects)
            .cloned()
            .ok_or_else(|| SnapshotError::NotFound {
                bucket: bucket.to_string(),
                prefix: prefix.to_string(),
            })
    }

    /// Read and decode one object.
    pub async fn read(&self, bucket: &str, key: &str) -> Result<Table> {
        let data = self.store.get(bucket, key).await?;
        Ok(decode(data)?)
    }

    /// Read a fixed-key table, or `None` when it was never written.
    pub async fn read_optional(&self, bucket: &str, key: &str) -> Result<Option<Table>> {
        match self.read(bucket, key).await {
            Ok(table) => Ok(Some(table)),
            Err(SnapshotError::Store(ObjectStoreError::NotFound { .. })) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Resolve and read the latest version under a prefix.
    pub async fn read_latest(&self, bucket: &str, prefix: &str) -> Result<Versioned> {
        let meta = self.latest_version(bucket, prefix).await?;
        let table = self.read(bucket, &meta.key).await?;
        debug!(bucket = %bucket, key = %meta.key, rows = table.len(), "Loaded snapshot");
        Ok(Versioned { meta, table })
    }

    /// Encode and write a table under a fixed key, replacing any previous one.
    pub async fn write(&self, bucket: &str, key: &str, table: &Table) -> Result<()> {
        self.ensure_bucket(bucket).await?;
        let body = encode(table)?;
        self.store.put(bucket, key, body).await?;
        debug!(bucket = %bucket, key = %key, rows = table.len(), "Wrote snapshot");
        Ok(())
    }

    /// Write a new transaction snapshot version and return its key.
    pub async fn write_transaction_version(&self, bucket: &str, table: &Table) -> Result<String> {
        let key = transaction_key(Utc::now());
        self.write(bucket, &key, table).await?;
        Ok(key)
    }
}
