//! Filesystem-based object storage.
//!
//! Stores objects as files in a directory structure:
//! ```text
//! {base_path}/
//!   {bucket}/
//!     TRANSACTION/transaction_{timestamp}.parquet
//!     ETL/{table}.parquet
//! ```
//!
//! Writes go to a hidden temp file first and are renamed into place, so a
//! reader never sees a partially written object.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use tokio::fs;
use tracing::debug;

use super::{validate_key, ObjectMeta, ObjectStore, ObjectStoreError, Result};

/// Filesystem-based object store.
pub struct FilesystemObjectStore {
    base_path: PathBuf,
}

impl FilesystemObjectStore {
    /// Create a new filesystem object store.
    ///
    /// Creates the base directory if it doesn't exist.
    pub async fn new(base_path: impl AsRef<Path>) -> Result<Self> {
        let base_path = base_path.as_ref().to_path_buf();
        fs::create_dir_all(&base_path).await?;
        Ok(Self { base_path })
    }

    fn bucket_path(&self, bucket: &str) -> Result<PathBuf> {
        validate_key(bucket)?;
        if bucket.contains('/') {
            return Err(ObjectStoreError::InvalidKey(bucket.to_string()));
        }
        Ok(self.base_path.join(bucket))
    }

    fn object_path(&self, bucket: &str, key: &str) -> Result<PathBuf> {
        validate_key(key)?;
        let mut path = self.bucket_path(bucket)?;
        for part in key.split('/') {
            path.push(part);
        }
        Ok(path)
    }

    /// Temp files are hidden so listings skip them.
    fn temp_path(path: &Path) -> PathBuf {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        path.with_file_name(format!(".{}.{}.tmp", name, uuid::Uuid::new_v4()))
    }
}

#[async_trait]
impl ObjectStore for FilesystemObjectStore {
    async fn bucket_exists(&self, bucket: &str) -> Result<bool> {
        Ok(fs::metadata(self.bucket_path(bucket)?)
            .await
            .map(|m| m.is_dir())
            .unwrap_or(false))
    }

    async fn create_bucket(&self, bucket: &str) -> Result<()> {
        fs::create_dir_all(self.bucket_path(bucket)?).await?;
        debug!(bucket = %bucket, "Created bucket directory");
        Ok(())
    }

    async fn list(&self, bucket: &str, prefix: &str) -> Result<Vec<ObjectMeta>> {
        let root = self.bucket_path(bucket)?;
        if !self.bucket_exists(bucket).await? {
            return Ok(Vec::new());
        }

        let mut objects = Vec::new();
        let mut pending = vec![(root, String::new())];

        while let Some((dir, key_prefix)) = pending.pop() {
            let mut entries = fs::read_dir(&dir).await?;
            while let Some(entry) = entries.next_entry().await? {
                let name = entry.file_name().to_string_lossy().into_owned();
                if name.starts_with('.') {
                    continue;
                }
                let key = format!("{}{}", key_prefix, name);
                let metadata = entry.metadata().await?;

                if metadata.is_dir() {
                    let dir_key = format!("{}/", key);
                    // Only descend where a match is still possible.
                    if dir_key.starts_with(prefix) || prefix.starts_with(&dir_key) {
                        pending.push((entry.path(), dir_key));
                    }
                } else if key.starts_with(prefix) {
                    let last_modified: DateTime<Utc> = metadata.modified()?.into();
                    objects.push(ObjectMeta {
                        key,
                        last_modified,
                        size: metadata.len(),
                    });
                }
            }
        }

        objects.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(objects)
    }

    async fn get(&self, bucket: &str, key: &str) -> Result<Bytes> {
        let path = self.object_path(bucket, key)?;
        match fs::read(&path).await {
            Ok(data) => Ok(Bytes::from(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(ObjectStoreError::NotFound {
                bucket: bucket.to_string(),
                key: key.to_string(),
            }),
            Err(e) => Err(e.into()),
        }
    }

    async fn put(&self, bucket: &str, key: &str, body: Bytes) -> Result<()> {
        if !self.bucket_exists(bucket).await? {
            return Err(ObjectStoreError::BucketNotFound(bucket.to_string()));
        }
        let path = self.object_path(bucket, key)?;

        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        // Write atomically using temp file + rename
        let temp_path = Self::temp_path(&path);
        fs::write(&temp_path, &body).await?;
        fs::rename(&temp_path, &path).await?;

        debug!(bucket = %bucket, key = %key, size = body.len(), "Stored object");
        Ok(())
    }

    async fn delete(&self, bucket: &str, key: &str) -> Result<()> {
        let path = self.object_path(bucket, key)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(ObjectStoreError::NotFound {
                bucket: bucket.to_string(),
                key: key.to_string(),
            }),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, SystemTime};
    use tempfile::TempDir;

    async fn create_temp_store() -> (FilesystemObjectStore, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let store = FilesystemObjectStore::new(temp_dir.path()).await.unwrap();
        (store, temp_dir)
    }

    #[tokio::test]
    async fn test_put_and_get() {
        let (store, _temp) = create_temp_store().await;
        store.create_bucket("customer-acme").await.unwrap();

        store
            .put("customer-acme", "ETL/tb_sum_store.parquet", Bytes::from_static(b"data"))
            .await
            .unwrap();

        let data = store
            .get("customer-acme", "ETL/tb_sum_store.parquet")
            .await
            .unwrap();
        assert_eq!(data.as_ref(), b"data");
    }

    #[tokio::test]
    async fn test_put_requires_bucket() {
        let (store, _temp) = create_temp_store().await;

        let result = store
            .put("customer-missing", "ETL/x.parquet", Bytes::from_static(b"x"))
            .await;
        assert!(matches!(result, Err(ObjectStoreError::BucketNotFound(_))));
    }

    #[tokio::test]
    async fn test_get_not_found() {
        let (store, _temp) = create_temp_store().await;
        store.create_bucket("b").await.unwrap();

        let result = store.get("b", "ETL/missing.parquet").await;
        assert!(matches!(result, Err(ObjectStoreError::NotFound { .. })));
    }

    #[tokio::test]
    async fn test_list_filters_by_prefix_and_skips_temp_files() {
        let (store, temp) = create_temp_store().await;
        store.create_bucket("b").await.unwrap();

        store
            .put("b", "TRANSACTION/transaction_1.parquet", Bytes::from_static(b"1"))
            .await
            .unwrap();
        store
            .put("b", "TRANSACTION/transaction_2.parquet", Bytes::from_static(b"22"))
            .await
            .unwrap();
        store
            .put("b", "ETL/tb_transaksi.parquet", Bytes::from_static(b"e"))
            .await
            .unwrap();
        std::fs::write(temp.path().join("b/TRANSACTION/.partial.tmp"), b"x").unwrap();

        let listed = store.list("b", "TRANSACTION/").await.unwrap();
        let keys: Vec<_> = listed.iter().map(|o| o.key.as_str()).collect();
        assert_eq!(
            keys,
            vec![
                "TRANSACTION/transaction_1.parquet",
                "TRANSACTION/transaction_2.parquet"
            ]
        );
        assert_eq!(listed[1].size, 2);
    }

    #[tokio::test]
    async fn test_list_missing_bucket_is_empty() {
        let (store, _temp) = create_temp_store().await;
        assert!(store.list("nope", "TRANSACTION/").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_list_reports_modification_time() {
        let (store, temp) = create_temp_store().await;
        store.create_bucket("b").await.unwrap();
        store
            .put("b", "TRANSACTION/old.parquet", Bytes::from_static(b"o"))
            .await
            .unwrap();

        // Manually backdate the file
        let old_time =
            std::fs::FileTimes::new().set_modified(SystemTime::now() - Duration::from_secs(7200));
        std::fs::File::options()
            .write(true)
            .open(temp.path().join("b/TRANSACTION/old.parquet"))
            .unwrap()
            .set_times(old_time)
            .unwrap();

        let listed = store.list("b", "TRANSACTION/").await.unwrap();
        let age = Utc::now() - listed[0].last_modified;
        assert!(age.num_seconds() >= 7100);
    }

    #[tokio::test]
    async fn test_delete() {
        let (store, _temp) = create_temp_store().await;
        store.create_bucket("b").await.unwrap();
        store
            .put("b", "ETL/x.parquet", Bytes::from_static(b"x"))
            .await
            .unwrap();

        store.delete("b", "ETL/x.parquet").await.unwrap();

        assert!(matches!(
            store.delete("b", "ETL/x.parquet").await,
            Err(ObjectStoreError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_invalid_bucket_name() {
        let (store, _temp) = create_temp_store().await;
        assert!(matches!(
            store.create_bucket("../escape").await,
            Err(ObjectStoreError::InvalidKey(_))
        ));
    }
}
