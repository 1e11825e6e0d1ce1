//! Message bus for queue-based delivery.
//!
//! This module contains:
//! - `MessageBus` trait: durable named queues with explicit settlement
//! - `DeliveryHandler` trait: for processing deliveries
//! - Bus configuration types
//! - Implementations: AMQP (RabbitMQ), in-process channel

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::future::BoxFuture;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use tracing::info;

// Implementation modules
#[cfg(feature = "amqp")]
pub mod amqp;
pub mod channel;

// Re-exports
#[cfg(feature = "amqp")]
pub use amqp::{AmqpBusConfig, AmqpMessageBus};
pub use channel::ChannelBus;

// ============================================================================
// Traits
// ============================================================================

/// Result type for bus operations.
pub type Result<T> = std::result::Result<T, BusError>;

/// Errors that can occur during bus operations.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Publish failed: {0}")]
    Publish(String),

    #[error("Subscribe failed: {0}")]
    Subscribe(String),

    #[error("Bus closed")]
    Closed,
}

/// An outgoing message.
#[derive(Debug, Clone)]
pub struct Message {
    /// Producer-assigned message id, carried as the broker message id.
    pub message_id: Option<String>,
    /// JSON body.
    pub body: Bytes,
}

impl Message {
    /// Create a message without an id.
    pub fn new(body: impl Into<Bytes>) -> Self {
        Self {
            message_id: None,
            body: body.into(),
        }
    }

    /// Set an explicit message id.
    pub fn with_message_id(mut self, id: impl Into<String>) -> Self {
        self.message_id = Some(id.into());
        self
    }
}

/// A message handed to a consumer, owned by it until settled.
#[derive(Debug, Clone)]
pub struct Delivery {
    /// Queue the message was read from.
    pub queue: String,
    /// Producer-assigned id, stable across redeliveries. `None` when the
    /// producer set none.
    pub message_id: Option<String>,
    pub body: Bytes,
    /// True when the broker has delivered this message before.
    pub redelivered: bool,
}

impl Delivery {
    /// Key for logs, attempt counting and dead letters.
    ///
    /// Falls back to the body hash, which identical id-less messages share.
    /// It identifies a delivery for bookkeeping only and must never be used
    /// to skip one.
    pub fn tracking_id(&self) -> String {
        self.message_id
            .clone()
            .unwrap_or_else(|| message_id_for(&self.body))
    }
}

/// How a consumer settles a delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Processed; remove from the queue.
    Ack,
    /// Not processed; deliver again.
    Requeue,
    /// Not processable; remove without redelivery.
    Reject,
}

/// Handler for processing deliveries from the bus.
pub trait DeliveryHandler: Send + Sync {
    /// Process one delivery and decide how to settle it.
    fn handle(&self, delivery: Delivery) -> BoxFuture<'static, Disposition>;
}

/// Interface for durable queue delivery.
///
/// Implementations:
/// - `AmqpMessageBus`: RabbitMQ via AMQP
/// - `ChannelBus`: in-process queues for standalone runs and tests
#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Declare a durable queue. Declaring twice is a no-op.
    async fn declare(&self, queue: &str) -> Result<()>;

    /// Publish a persistent message to a queue.
    async fn publish(&self, queue: &str, message: Message) -> Result<()>;

    /// Consume from the given queues with at most one unsettled delivery.
    ///
    /// Deliveries are handed to the handler one at a time and settled with
    /// the returned disposition before the next one is read. Runs until the
    /// bus is closed.
    async fn consume(&self, queues: &[String], handler: Arc<dyn DeliveryHandler>) -> Result<()>;
}

/// Stable message id for a body: hex SHA-256.
pub fn message_id_for(body: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(body);
    hex::encode(hasher.finalize())
}

// ============================================================================
// Configuration
// ============================================================================

/// Messaging type discriminator.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessagingType {
    /// AMQP/RabbitMQ messaging.
    Amqp,
    /// In-process channel queues.
    #[default]
    Channel,
}

/// Messaging configuration (discriminated union).
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct MessagingConfig {
    /// Messaging type discriminator.
    #[serde(rename = "type")]
    pub messaging_type: MessagingType,
    /// AMQP connection URL.
    pub amqp_url: Option<String>,
}

// ============================================================================
// Factory
// ============================================================================

/// Initialize the message bus based on configuration.
///
/// Requires the corresponding feature to be enabled:
/// - AMQP: `--features amqp`
/// - Channel: always available
pub async fn init_message_bus(
    config: &MessagingConfig,
) -> std::result::Result<Arc<dyn MessageBus>, Box<dyn std::error::Error + Send + Sync>> {
    match config.messaging_type {
        MessagingType::Amqp => {
            #[cfg(feature = "amqp")]
            {
                let url = config
                    .amqp_url
                    .clone()
                    .unwrap_or_else(|| "amqp://localhost:5672".to_string());
                let bus = AmqpMessageBus::new(AmqpBusConfig::new(url)).await?;
                info!(messaging_type = "amqp", "Message bus initialized");
                Ok(Arc::new(bus))
            }

            #[cfg(not(feature = "amqp"))]
            {
                Err("AMQP support requires the 'amqp' feature. Rebuild with --features amqp".into())
            }
        }
        MessagingType::Channel => {
            info!(messaging_type = "channel", "Message bus initialized");
            Ok(Arc::new(ChannelBus::new()))
        }
    }
}
