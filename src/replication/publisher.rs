//! Producer side: enqueue operations for the replication consumer.

use std::sync::Arc;

use serde_json::{Map, Value as Json};
use tracing::debug;
use uuid::Uuid;

use crate::bus::{BusError, Message, MessageBus};
use crate::model::{
    BatchCreate, CreateTransaction, DeleteTransaction, MessageError, NewTransaction, Operation,
    QueueNames, TransactionId, UpdateTransaction,
};

#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    #[error("Encoding failed: {0}")]
    Encode(#[from] MessageError),

    #[error(transparent)]
    Bus(#[from] BusError),
}

/// Publishes operations with a fresh message id each, so two identical
/// submissions are applied twice rather than deduplicated.
pub struct TransactionPublisher {
    bus: Arc<dyn MessageBus>,
    queues: QueueNames,
}

impl TransactionPublisher {
    pub fn new(bus: Arc<dyn MessageBus>, queues: QueueNames) -> Self {
        Self { bus, queues }
    }

    /// Publish an operation and return its message id.
    #[tracing::instrument(skip(self, op), fields(op = op.kind().as_str(), tenant = %op.tenant()))]
    pub async fn publish(&self, op: &Operation) -> Result<String, PublishError> {
        let queue = self.queues.queue_for(op.kind());
        let message_id = Uuid::new_v4().to_string();
        let body = op.encode(self.queues.layout)?;

        self.bus
            .publish(queue, Message::new(body).with_message_id(message_id.clone()))
            .await?;
        debug!(queue = %queue, message_id = %message_id, "Operation enqueued");
        Ok(message_id)
    }

    pub async fn create(
        &self,
        user_group: &str,
        transaction: NewTransaction,
    ) -> Result<String, PublishError> {
        self.publish(&Operation::Create(CreateTransaction {
            user_group: user_group.to_string(),
            transaction,
        }))
        .await
    }

    pub async fn create_batch(
        &self,
        user_group: &str,
        transactions: Vec<NewTransaction>,
    ) -> Result<String, PublishError> {
        self.publish(&Operation::BatchCreate(BatchCreate {
            user_group: user_group.to_string(),
            transactions,
        }))
        .await
    }

    pub async fn update(
        &self,
        user_group: &str,
        username: &str,
        transaction_id: TransactionId,
        transaction_data: Map<String, Json>,
    ) -> Result<String, PublishError> {
        self.publish(&Operation::Update(UpdateTransaction {
            transaction_id,
            transaction_data,
            user_group: user_group.to_string(),
            username: username.to_string(),
        }))
        .await
    }

    pub async fn delete(
        &self,
        user_group: &str,
        username: &str,
        transaction_id: TransactionId,
    ) -> Result<String, PublishError> {
        self.publish(&Operation::Delete(DeleteTransaction {
            transaction_id,
            user_group: user_group.to_string(),
            username: username.to_string(),
        }))
        .await
    }
}
