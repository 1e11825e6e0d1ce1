//! Dead Letter Queue (DLQ) infrastructure.
//!
//! Messages the replication consumer cannot apply, or gives up on after the
//! redelivery bound, are published here for manual review and replay instead
//! of being dropped.
//!
//! ## Queue Naming
//!
//! Dead letters go to `{queue}.dead-letter`, one DLQ per source queue.
//!
//! ## Message Format
//!
//! JSON object:
//! - `message_id`, `queue`: where the message came from
//! - `reason`, `kind`: why it was rejected
//! - `attempts`: deliveries seen before giving up
//! - `occurred_at`: RFC 3339 timestamp
//! - `payload`: the original body, verbatim
//! - `metadata`: additional context (tenant, operation)

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::bus::{Delivery, Message, MessageBus};

/// DLQ queue suffix. Full name: `{queue}.{suffix}`
pub const DLQ_SUFFIX: &str = "dead-letter";

/// Build the DLQ name for a source queue.
pub fn dlq_queue_for(queue: &str) -> String {
    format!("{}.{}", queue, DLQ_SUFFIX)
}

/// Errors that can occur during DLQ operations.
#[derive(Debug, thiserror::Error)]
pub enum DlqError {
    #[error("Failed to serialize message: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Failed to publish to DLQ: {0}")]
    PublishFailed(String),
}

/// Why a message ended up in the DLQ.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectionKind {
    /// Payload could not be parsed or failed validation.
    Invalid,
    /// The referenced transaction does not exist.
    NotFound,
    /// The operation contradicts the current snapshot.
    Conflict,
    /// The latest snapshot cannot be decoded.
    Corrupt,
    /// Storage kept failing until the redelivery bound was reached.
    RetriesExhausted,
}

/// Dead letter queue entry for a failed message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetter {
    pub message_id: String,
    /// Source queue.
    pub queue: String,
    pub kind: RejectionKind,
    /// Human-readable reason for rejection.
    pub reason: String,
    /// Deliveries seen, this one included.
    pub attempts: u32,
    pub occurred_at: DateTime<Utc>,
    /// Original message body.
    pub payload: String,
    /// Additional context.
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl DeadLetter {
    /// Create a dead letter for a delivery.
    pub fn from_delivery(
        delivery: &Delivery,
        kind: RejectionKind,
        reason: impl Into<String>,
        attempts: u32,
    ) -> Self {
        Self {
            message_id: delivery.tracking_id(),
            queue: delivery.queue.clone(),
            kind,
            reason: reason.into(),
            attempts,
            occurred_at: Utc::now(),
            payload: String::from_utf8_lossy(&delivery.body).into_owned(),
            metadata: BTreeMap::new(),
        }
    }

    /// Add metadata to the dead letter.
    pub fn with_metadata(mut self, key: &str, value: &str) -> Self {
        self.metadata.insert(key.to_string(), value.to_string());
        self
    }

    /// Get the DLQ for this dead letter.
    pub fn dlq_queue(&self) -> String {
        dlq_queue_for(&self.queue)
    }
}

/// Trait for publishing messages to a dead letter queue.
#[async_trait]
pub trait DeadLetterPublisher: Send + Sync {
    /// Publish a dead letter to the queue.
    async fn publish(&self, dead_letter: DeadLetter) -> Result<(), DlqError>;

    /// Check if the publisher is configured and ready.
    fn is_configured(&self) -> bool {
        true
    }
}

/// No-op DLQ publisher that logs but doesn't actually send anywhere.
pub struct NoopDeadLetterPublisher;

#[async_trait]
impl DeadLetterPublisher for NoopDeadLetterPublisher {
    async fn publish(&self, dead_letter: DeadLetter) -> Result<(), DlqError> {
        warn!(
            queue = %dead_letter.dlq_queue(),
            message_id = %dead_letter.message_id,
            reason = %dead_letter.reason,
            "DLQ not configured, logging dead letter"
        );
        Ok(())
    }

    fn is_configured(&self) -> bool {
        false
    }
}

/// In-memory DLQ publisher using a channel.
///
/// Used for testing.
pub struct ChannelDeadLetterPublisher {
    sender: mpsc::UnboundedSender<DeadLetter>,
}

impl ChannelDeadLetterPublisher {
    /// Returns the publisher and a receiver for consuming dead letters.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<DeadLetter>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }
}

#[async_trait]
impl DeadLetterPublisher for ChannelDeadLetterPublisher {
    async fn publish(&self, dead_letter: DeadLetter) -> Result<(), DlqError> {
        info!(
            queue = %dead_letter.dlq_queue(),
            reason = %dead_letter.reason,
            "Publishing to channel DLQ"
        );
        self.sender
            .send(dead_letter)
            .map_err(|e| DlqError::PublishFailed(e.to_string()))
    }
}

/// DLQ publisher that writes dead letters back onto the message bus.
pub struct BusDeadLetterPublisher {
    bus: Arc<dyn MessageBus>,
}

impl BusDeadLetterPublisher {
    pub fn new(bus: Arc<dyn MessageBus>) -> Self {
        Self { bus }
    }
}

#[async_trait]
impl DeadLetterPublisher for BusDeadLetterPublisher {
    async fn publish(&self, dead_letter: DeadLetter) -> Result<(), DlqError> {
        let queue = dead_letter.dlq_queue();
        let body = serde_json::to_vec(&dead_letter)?;
        let message = Message::new(body).with_message_id(dead_letter.message_id.clone());

        self.bus
            .publish(&queue, message)
            .await
            .map_err(|e| DlqError::PublishFailed(e.to_string()))?;

        info!(
            queue = %queue,
            message_id = %dead_letter.message_id,
            kind = ?dead_letter.kind,
            "Published dead letter"
        );
        Ok(())
    }
}

/// Configuration for DLQ publishers.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DlqConfig {
    /// Publish dead letters to `{queue}.dead-letter` on the message bus.
    /// When false, dead letters are only logged.
    pub enabled: bool,
}

impl Default for DlqConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

/// Create a DLQ publisher based on configuration.
///
/// Returns NoopDeadLetterPublisher when disabled.
pub fn create_publisher(
    config: &DlqConfig,
    bus: Arc<dyn MessageBus>,
) -> Arc<dyn DeadLetterPublisher> {
    if config.enabled {
        debug!("Dead letters published to the message bus");
        Arc::new(BusDeadLetterPublisher::new(bus))
    } else {
        debug!("No DLQ configured, using noop publisher");
        Arc::new(NoopDeadLetterPublisher)
    }
}
