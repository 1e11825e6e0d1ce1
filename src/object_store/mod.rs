//! Raw object storage for snapshot files.
//!
//! Objects are addressed by `(bucket, key)`. Keys use `/` as a separator and
//! prefixes group them (`TRANSACTION/`, `ETL/`). Every backend reports a
//! last-modified timestamp per object, which is what "latest version"
//! resolution orders by.
//!
//! ## Storage Backends
//!
//! - `FilesystemObjectStore` - bucket is a directory under a base path
//! - `MemoryObjectStore` - in-process map with a monotonic clock, for tests
//! - `S3ObjectStore` (feature: s3) - Amazon S3 or an S3-compatible service

mod config;
mod filesystem;
mod memory;
#[cfg(feature = "s3")]
mod s3;

#[cfg(feature = "s3")]
pub use config::S3StoreConfig;
pub use config::{FilesystemStoreConfig, ObjectStoreConfig, ObjectStoreType};
pub use filesystem::FilesystemObjectStore;
pub use memory::MemoryObjectStore;
#[cfg(feature = "s3")]
pub use s3::S3ObjectStore;

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use thiserror::Error;

/// Errors that can occur during object store operations.
#[derive(Debug, Error)]
pub enum ObjectStoreError {
    #[error("Object not found: {bucket}/{key}")]
    NotFound { bucket: String, key: String },

    #[error("Bucket not found: {0}")]
    BucketNotFound(String),

    #[error("Invalid object key: {0}")]
    InvalidKey(String),

    #[error("Object store unavailable: {0}")]
    Unavailable(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for object store operations.
pub type Result<T> = std::result::Result<T, ObjectStoreError>;

/// Listing entry for one object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectMeta {
    pub key: String,
    pub last_modified: DateTime<Utc>,
    pub size: u64,
}

/// Object storage backend.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn bucket_exists(&self, bucket: &str) -> Result<bool>;

    /// Create a bucket. Creating an existing bucket is a no-op.
    async fn create_bucket(&self, bucket: &str) -> Result<()>;

    /// List objects whose key starts with `prefix`.
    ///
    /// A missing bucket lists as empty.
    async fn list(&self, bucket: &str, prefix: &str) -> Result<Vec<ObjectMeta>>;

    async fn get(&self, bucket: &str, key: &str) -> Result<Bytes>;

    /// Write an object, replacing any existing one. The bucket must exist.
    async fn put(&self, bucket: &str, key: &str, body: Bytes) -> Result<()>;

    /// Remove an object. A missing object is `NotFound`.
    async fn delete(&self, bucket: &str, key: &str) -> Result<()>;
}

/// Reject keys that could escape the bucket or address nothing.
pub(crate) fn validate_key(key: &str) -> Result<()> {
    if key.is_empty()
        || key.starts_with('/')
        || key.ends_with('/')
        || key.split('/').any(|part| part.is_empty() || part == "." || part == "..")
    {
        return Err(ObjectStoreError::InvalidKey(key.to_string()));
    }
    Ok(())
}

// ============================================================================
// Factory
// ============================================================================

/// Initialize an object store based on configuration.
///
/// # Errors
///
/// Returns error if the configured store type requires an unavailable feature.
pub async fn init_object_store(
    config: &ObjectStoreConfig,
) -> std::result::Result<Arc<dyn ObjectStore>, Box<dyn std::error::Error + Send + Sync>> {
    use tracing::info;

    match config.store_type {
        ObjectStoreType::Filesystem => {
            info!(
                path = %config.filesystem.base_path.display(),
                "ObjectStore: filesystem"
            );
            let store = FilesystemObjectStore::new(&config.filesystem.base_path).await?;
            Ok(Arc::new(store))
        }
        ObjectStoreType::Memory => {
            info!("ObjectStore: memory");
            Ok(Arc::new(MemoryObjectStore::new()))
        }
        ObjectStoreType::S3 => {
            #[cfg(feature = "s3")]
            {
                info!(
                    region = ?config.s3.region,
                    endpoint = ?config.s3.endpoint,
                    "ObjectStore: s3"
                );
                let store = match &config.s3.endpoint {
                    Some(endpoint) => {
                        S3ObjectStore::with_endpoint(endpoint, config.s3.region.as_deref()).await
                    }
                    None => S3ObjectStore::new().await,
                };
                Ok(Arc::new(store))
            }

            #[cfg(not(feature = "s3"))]
            {
                Err("S3 support requires the 's3' feature. Rebuild with --features s3".into())
            }
        }
    }
}
