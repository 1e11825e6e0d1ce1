//! Retirement of superseded transaction snapshots.
//!
//! Every replicated message writes a new `TRANSACTION/` file, so without
//! cleanup a tenant's bucket grows by one file per message. The compactor
//! keeps the newest versions and deletes the rest once they are old enough
//! that no reader can still be about to fetch them.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Deserialize;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use super::{bucket_for_tenant, Result, TRANSACTION_PREFIX};
use crate::object_store::{ObjectStore, ObjectStoreError};

/// Compaction settings, loaded from the `compaction` config section.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct CompactionConfig {
    pub enabled: bool,
    /// Tenants to compact. Falls back to `aggregation.tenants` when unset.
    pub tenants: Option<Vec<String>>,
    /// Newest versions always kept per tenant.
    pub keep_versions: usize,
    /// Versions younger than this are never deleted.
    pub min_age_secs: u64,
    pub interval_secs: u64,
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            tenants: None,
            keep_versions: 3,
            min_age_secs: 3600,
            interval_secs: 3600,
        }
    }
}

/// Background task for deleting superseded transaction snapshots.
pub struct SnapshotCompactor {
    store: Arc<dyn ObjectStore>,
    tenants: Vec<String>,
    keep_versions: usize,
    min_age: Duration,
    interval: Duration,
}

impl SnapshotCompactor {
    /// Create a new compactor.
    ///
    /// # Arguments
    /// * `store` - The object store holding tenant buckets
    /// * `tenants` - User groups whose buckets are compacted
    /// * `keep_versions` - Newest versions always kept (at least one)
    pub fn new(store: Arc<dyn ObjectStore>, tenants: Vec<String>, keep_versions: usize) -> Self {
        Self {
            store,
            tenants,
            keep_versions: keep_versions.max(1),
            min_age: Duration::from_secs(3600),
            interval: Duration::from_secs(3600), // Default: hourly
        }
    }

    /// Compactor for `tenants` using the configured retention and period.
    pub fn from_config(
        store: Arc<dyn ObjectStore>,
        tenants: Vec<String>,
        config: &CompactionConfig,
    ) -> Self {
        Self::new(store, tenants, config.keep_versions)
            .with_min_age(Duration::from_secs(config.min_age_secs))
            .with_interval(Duration::from_secs(config.interval_secs))
    }

    /// Only delete versions older than this.
    pub fn with_min_age(mut self, min_age: Duration) -> Self {
        self.min_age = min_age;
        self
    }

    /// Set custom compaction interval.
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Spawn the compactor as a background task.
    ///
    /// Returns a handle that can be used to abort the task.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                interval.tick().await;

                match self.run_once().await {
                    Ok(count) if count > 0 => {
                        info!(deleted = count, "Compactor removed superseded snapshots");
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!(error = %e, "Compactor failed");
                    }
                }
            }
        })
    }

    /// Compact every tenant once. Returns the number of files deleted.
    pub async fn run_once(&self) -> Result<usize> {
        let mut deleted = 0;
        for tenant in &self.tenants {
            deleted += self.compact_bucket(&bucket_for_tenant(tenant)).await?;
        }
        Ok(deleted)
    }

    async fn compact_bucket(&self, bucket: &str) -> Result<usize> {
        let mut objects = self.store.list(bucket, TRANSACTION_PREFIX).await?;
        objects.retain(|o| o.key.ends_with(".parquet"));
        // Newest first, same ordering as latest-version resolution.
        objects.sort_by(|a, b| {
            b.last_modified
                .cmp(&a.last_modified)
                .then_with(|| b.key.cmp(&a.key))
        });

        let min_age = chrono::Duration::from_std(self.min_age)
            .unwrap_or_else(|_| chrono::Duration::days(36_500));
        let cutoff = Utc::now() - min_age;
        let mut deleted = 0;

        for object in objects.iter().skip(self.keep_versions) {
            if object.last_modified >= cutoff {
                continue;
            }
            match self.store.delete(bucket, &object.key).await {
                Ok(()) => deleted += 1,
                // Already gone, e.g. removed by a concurrent run.
                Err(ObjectStoreError::NotFound { .. }) => {}
                Err(e) => {
                    warn!(bucket = %bucket, key = %object.key, error = %e, "Failed to delete snapshot");
                }
            }
        }

        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object_store::MemoryObjectStore;
    use bytes::Bytes;

    async fn seed(store: &MemoryObjectStore, bucket: &str, count: usize, age_hours: i64) {
        store.create_bucket(bucket).await.unwrap();
        for i in 0..count {
            let key = format!("TRANSACTION/transaction_{:02}.parquet", i);
            store.put(bucket, &key, Bytes::from_static(b"x")).await.unwrap();
            store
                .set_last_modified(
                    bucket,
                    &key,
                    Utc::now() - chrono::Duration::hours(age_hours) + chrono::Duration::seconds(i as i64),
                )
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn test_keeps_newest_versions() {
        let store = Arc::new(MemoryObjectStore::new());
        seed(&store, "customer-acme", 5, 2).await;

        let compactor = SnapshotCompactor::new(store.clone(), vec!["acme".to_string()], 2);
        let deleted = compactor.run_once().await.unwrap();

        assert_eq!(deleted, 3);
        let keys: Vec<_> = store
            .list("customer-acme", TRANSACTION_PREFIX)
            .await
            .unwrap()
            .into_iter()
            .map(|o| o.key)
            .collect();
        assert_eq!(
            keys,
            vec![
                "TRANSACTION/transaction_03.parquet",
                "TRANSACTION/transaction_04.parquet"
            ]
        );
    }

    #[tokio::test]
    async fn test_recent_versions_survive() {
        let store = Arc::new(MemoryObjectStore::new());
        seed(&store, "customer-acme", 4, 0).await;

        let compactor = SnapshotCompactor::new(store.clone(), vec!["acme".to_string()], 1);
        assert_eq!(compactor.run_once().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_missing_bucket_is_noop() {
        let store = Arc::new(MemoryObjectStore::new());
        let compactor = SnapshotCompactor::new(store, vec!["ghost".to_string()], 1);
        assert_eq!(compactor.run_once().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_from_config_applies_retention() {
        let store = Arc::new(MemoryObjectStore::new());
        seed(&store, "customer-acme", 5, 2).await;

        let config = CompactionConfig {
            keep_versions: 4,
            ..CompactionConfig::default()
        };
        let compactor =
            SnapshotCompactor::from_config(store.clone(), vec!["acme".to_string()], &config);
        assert_eq!(compactor.run_once().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_spawn_and_abort() {
        let store = Arc::new(MemoryObjectStore::new());
        let compactor = SnapshotCompactor::new(store, vec![], 3)
            .with_interval(Duration::from_millis(100)); // Fast interval for testing

        let handle = compactor.spawn();
        tokio::time::sleep(Duration::from_millis(50)).await;
        handle.abort();

        let result = tokio::time::timeout(Duration::from_millis(100), handle).await;
        assert!(result.is_ok());
    }
}
