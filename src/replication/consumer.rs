//! Queue consumer applying operations to transaction snapshots.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use futures::future::BoxFuture;
use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use super::apply::{Applied, TransactionSet};
use super::ReplicationError;
use crate::bus::{BusError, Delivery, DeliveryHandler, Disposition, MessageBus};
use crate::dlq::{DeadLetter, DeadLetterPublisher, RejectionKind};
use crate::model::{Operation, OperationKind, QueueNames};
use crate::snapshot::{bucket_for_tenant, SnapshotError, SnapshotStore, TRANSACTION_PREFIX};

/// Replication settings, loaded from the `replication` config section.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ReplicationConfig {
    pub queues: QueueNames,
    /// Deliveries of one message before a storage failure is dead-lettered.
    pub max_deliveries: u32,
    /// Attempt counters not touched for this long are dropped.
    pub attempt_ttl_secs: u64,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            queues: QueueNames::default(),
            max_deliveries: 5,
            attempt_ttl_secs: 900,
        }
    }
}

/// Result of applying one message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// A new snapshot version was written under this key.
    Written { key: String },
    /// The latest snapshot already records this message.
    AlreadyApplied,
    /// The operation would not change the snapshot.
    Unchanged,
}

/// Single-worker consumer for the transaction queues.
///
/// Cloning is cheap; clones share the attempt counters.
#[derive(Clone)]
pub struct ReplicationConsumer {
    snapshots: Arc<SnapshotStore>,
    dlq: Arc<dyn DeadLetterPublisher>,
    queues: Arc<QueueNames>,
    max_deliveries: u32,
    attempt_ttl: Duration,
    /// Deliveries seen per tracking id, cleared once a message is settled
    /// for good or left idle past `attempt_ttl`. Survives requeues but not
    /// restarts.
    attempts: Arc<Mutex<HashMap<String, Attempts>>>,
}

#[derive(Debug, Clone, Copy)]
struct Attempts {
    count: u32,
    last_seen: Instant,
}

impl ReplicationConsumer {
    pub fn new(snapshots: Arc<SnapshotStore>, dlq: Arc<dyn DeadLetterPublisher>) -> Self {
        Self::with_config(snapshots, dlq, ReplicationConfig::default())
    }

    pub fn with_config(
        snapshots: Arc<SnapshotStore>,
        dlq: Arc<dyn DeadLetterPublisher>,
        config: ReplicationConfig,
    ) -> Self {
        Self {
            snapshots,
            dlq,
            queues: Arc::new(config.queues),
            max_deliveries: config.max_deliveries.max(1),
            attempt_ttl: Duration::from_secs(config.attempt_ttl_secs),
            attempts: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn queues(&self) -> &QueueNames {
        &self.queues
    }

    /// Declare the consumed queues and process deliveries until the bus closes.
    pub async fn run(&self, bus: Arc<dyn MessageBus>) -> Result<(), BusError> {
        let queues = self.queues.consumed();
        for queue in &queues {
            bus.declare(queue).await?;
        }
        info!(queues = ?queues, "Replication consumer started");
        bus.consume(&queues, Arc::new(self.clone())).await
    }

    /// Handle one delivery end to end and decide its settlement.
    #[tracing::instrument(
        name = "replicate",
        skip(self, delivery),
        fields(queue = %delivery.queue, message_id = %delivery.tracking_id())
    )]
    pub async fn process(&self, delivery: Delivery) -> Disposition {
        let tracking_id = delivery.tracking_id();
        let attempts = self.record_attempt(&tracking_id).await;
        debug!(state = "received", attempts, redelivered = delivery.redelivered);

        debug!(state = "validating");
        let op = match Operation::decode(&delivery.queue, &delivery.body, &self.queues) {
            Ok(op) => op,
            Err(e) => {
                warn!(state = "failed", error = %e, "Message failed validation");
                return self
                    .dead_letter(&delivery, None, RejectionKind::Invalid, e.to_string(), attempts)
                    .await;
            }
        };

        match self
            .apply(delivery.message_id.as_deref(), delivery.redelivered, &op)
            .await
        {
            Ok(outcome) => {
                self.forget(&tracking_id).await;
                info!(
                    state = "acknowledged",
                    tenant = %op.tenant(),
                    op = op.kind().as_str(),
                    outcome = ?outcome,
                    "Message applied"
                );
                Disposition::Ack
            }
            Err(e) if e.is_retryable() && attempts < self.max_deliveries => {
                warn!(
                    state = "redelivered",
                    tenant = %op.tenant(),
                    attempts,
                    max_deliveries = self.max_deliveries,
                    error = %e,
                    "Apply failed, requeueing"
                );
                Disposition::Requeue
            }
            Err(e) => {
                let kind = match &e {
                    ReplicationError::StorageUnavailable(_) => RejectionKind::RetriesExhausted,
                    ReplicationError::Validation(_) => RejectionKind::Invalid,
                    ReplicationError::NotFound(_) => RejectionKind::NotFound,
                    ReplicationError::Conflict(_) => RejectionKind::Conflict,
                    ReplicationError::Corrupt(_) => RejectionKind::Corrupt,
                };
                warn!(state = "failed", tenant = %op.tenant(), error = %e, "Apply failed");
                self.dead_letter(&delivery, Some(&op), kind, e.to_string(), attempts)
                    .await
            }
        }
    }

    /// Apply a decoded operation to the tenant's latest snapshot.
    ///
    /// Writes a new snapshot version unless the message was already applied
    /// or the operation changes nothing. Only producer-assigned message ids
    /// enter the ledger; messages without one are applied every time they
    /// arrive, relying on update and delete being idempotent on redelivery.
    pub async fn apply(
        &self,
        message_id: Option<&str>,
        redelivered: bool,
        op: &Operation,
    ) -> Result<Outcome, ReplicationError> {
        let bucket = bucket_for_tenant(op.tenant());

        debug!(state = "loading-snapshot", bucket = %bucket);
        let mut set = self.load(&bucket, op.kind()).await?;
        if message_id.is_some_and(|id| set.has_applied(id)) {
            info!(bucket = %bucket, "Message already applied, skipping");
            return Ok(Outcome::AlreadyApplied);
        }

        debug!(state = "mutating", op = op.kind().as_str());
        let applied = match op {
            Operation::Create(create) => set.create(create.transaction.clone())?,
            Operation::BatchCreate(batch) => set.create_batch(batch.transactions.clone())?,
            Operation::Update(update) => set.update(
                &update.transaction_id,
                &update.transaction_data,
                &update.username,
                Utc::now().naive_utc(),
            )?,
            Operation::Delete(delete) => match set.delete(&delete.transaction_id) {
                // An id-less delete seen again was applied before its ack was lost.
                Err(ReplicationError::NotFound(_)) if redelivered && message_id.is_none() => {
                    info!(
                        bucket = %bucket,
                        id = %delete.transaction_id,
                        "Delete target already gone on redelivery"
                    );
                    return Ok(Outcome::AlreadyApplied);
                }
                other => other?,
            },
        };
        if applied == Applied::Unchanged {
            return Ok(Outcome::Unchanged);
        }

        if let Some(id) = message_id {
            set.record_applied(id);
        }
        debug!(state = "writing-snapshot", rows = set.transactions().len());
        let table = set
            .to_table()
            .map_err(|e| ReplicationError::Validation(e.to_string()))?;
        let key = self
            .snapshots
            .write_transaction_version(&bucket, &table)
            .await?;
        Ok(Outcome::Written { key })
    }

    /// Load the latest transaction set.
    ///
    /// Creates start from an empty set when no readable snapshot exists;
    /// updates and deletes require one.
    async fn load(&self, bucket: &str, kind: OperationKind) -> Result<TransactionSet, ReplicationError> {
        let creates = matches!(kind, OperationKind::Create | OperationKind::BatchCreate);
        let loaded = match self.snapshots.read_latest(bucket, TRANSACTION_PREFIX).await {
            Ok(versioned) => TransactionSet::from_table(&versioned.table)
                .map_err(|e| (Some(versioned.meta.key), e)),
            Err(e) => Err((None, e)),
        };

        match loaded {
            Ok(set) => Ok(set),
            Err((_, e)) if e.is_transient() => Err(e.into()),
            Err((_, SnapshotError::NotFound { .. })) if creates => Ok(TransactionSet::default()),
            Err((key, e @ (SnapshotError::Codec(_) | SnapshotError::Schema(_)))) if creates => {
                warn!(
                    bucket = %bucket,
                    key = ?key,
                    error = %e,
                    "Latest snapshot unreadable, starting from empty"
                );
                Ok(TransactionSet::default())
            }
            Err((_, e)) => Err(e.into()),
        }
    }

    async fn dead_letter(
        &self,
        delivery: &Delivery,
        op: Option<&Operation>,
        kind: RejectionKind,
        reason: String,
        attempts: u32,
    ) -> Disposition {
        let mut dead_letter = DeadLetter::from_delivery(delivery, kind, reason, attempts);
        if let Some(op) = op {
            dead_letter = dead_letter
                .with_metadata("tenant", op.tenant())
                .with_metadata("op", op.kind().as_str());
        }

        match self.dlq.publish(dead_letter).await {
            Ok(()) => {
                self.forget(&delivery.tracking_id()).await;
                info!(state = "dead-lettered", kind = ?kind, "Message dead-lettered");
                Disposition::Reject
            }
            Err(e) => {
                error!(error = %e, "Dead-letter publish failed, requeueing");
                Disposition::Requeue
            }
        }
    }

    async fn record_attempt(&self, tracking_id: &str) -> u32 {
        let now = Instant::now();
        let mut attempts = self.attempts.lock().await;
        // Messages requeued and then consumed elsewhere or purged never
        // settle here.
        attempts.retain(|_, a| now.duration_since(a.last_seen) < self.attempt_ttl);
        let entry = attempts.entry(tracking_id.to_string()).or_insert(Attempts {
            count: 0,
            last_seen: now,
        });
        entry.count += 1;
        entry.last_seen = now;
        entry.count
    }

    async fn forget(&self, tracking_id: &str) {
        self.attempts.lock().await.remove(tracking_id);
    }
}

impl DeliveryHandler for ReplicationConsumer {
    fn handle(&self, delivery: Delivery) -> BoxFuture<'static, Disposition> {
        let consumer = self.clone();
        Box::pin(async move { consumer.process(delivery).await })
    }
}

#[cfg(test)]
mod tests;
