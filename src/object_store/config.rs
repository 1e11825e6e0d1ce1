//! Object store configuration.

use std::path::PathBuf;

use serde::Deserialize;

/// Object store type discriminator.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ObjectStoreType {
    /// Filesystem-based storage (local or mounted).
    #[default]
    Filesystem,
    /// In-process storage; contents are lost on exit.
    Memory,
    /// Amazon S3 or compatible (requires `s3` feature).
    S3,
}

/// Object store configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ObjectStoreConfig {
    /// Object store type.
    #[serde(rename = "type")]
    pub store_type: ObjectStoreType,

    /// Filesystem store configuration.
    pub filesystem: FilesystemStoreConfig,

    /// S3 store configuration (requires `s3` feature).
    #[cfg(feature = "s3")]
    pub s3: S3StoreConfig,
}

/// Filesystem object store configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FilesystemStoreConfig {
    /// Base directory. Buckets are subdirectories, keys are relative paths.
    pub base_path: PathBuf,
}

impl Default for FilesystemStoreConfig {
    fn default() -> Self {
        Self {
            base_path: PathBuf::from("/var/tally/objects"),
        }
    }
}

/// S3 object store configuration.
#[cfg(feature = "s3")]
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct S3StoreConfig {
    /// AWS region (uses default from environment if not set).
    pub region: Option<String>,

    /// Custom endpoint URL (for MinIO, LocalStack, etc.).
    pub endpoint: Option<String>,
}
