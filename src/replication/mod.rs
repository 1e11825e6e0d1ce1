//! Replication of queue messages into transaction snapshots.
//!
//! The consumer reads create, batch-create, update and delete messages,
//! applies each to the tenant's latest transaction snapshot and writes the
//! result as a new snapshot version. A message is acknowledged only after
//! that write succeeds.

mod apply;
mod consumer;
mod publisher;

pub use apply::{Applied, TransactionSet, LEDGER_CAPACITY, LEDGER_KEY};
pub use consumer::{Outcome, ReplicationConfig, ReplicationConsumer};
pub use publisher::{PublishError, TransactionPublisher};

use crate::model::{IdError, MessageError};
use crate::object_store::ObjectStoreError;
use crate::snapshot::SnapshotError;

/// Why an operation could not be applied.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReplicationError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Storage unavailable: {0}")]
    StorageUnavailable(String),

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Corrupt snapshot: {0}")]
    Corrupt(String),
}

impl ReplicationError {
    /// Whether redelivering the same message could succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ReplicationError::StorageUnavailable(_))
    }
}

impl From<MessageError> for ReplicationError {
    fn from(e: MessageError) -> Self {
        ReplicationError::Validation(e.to_string())
    }
}

impl From<IdError> for ReplicationError {
    fn from(e: IdError) -> Self {
        ReplicationError::Validation(e.to_string())
    }
}

impl From<SnapshotError> for ReplicationError {
    fn from(e: SnapshotError) -> Self {
        match e {
            SnapshotError::NotFound { bucket, prefix } => {
                ReplicationError::NotFound(format!("no snapshot under {}/{}", bucket, prefix))
            }
            e if e.is_transient() => ReplicationError::StorageUnavailable(e.to_string()),
            e @ (SnapshotError::Codec(_) | SnapshotError::Schema(_)) => {
                ReplicationError::Corrupt(e.to_string())
            }
            // Listed objects and lazily created buckets can race with
            // compaction; a fresh listing may succeed.
            e @ SnapshotError::Store(
                ObjectStoreError::NotFound { .. } | ObjectStoreError::BucketNotFound(_),
            ) => ReplicationError::StorageUnavailable(e.to_string()),
            e => ReplicationError::Validation(e.to_string()),
        }
    }
}
