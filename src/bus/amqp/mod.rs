//! AMQP (RabbitMQ) message bus implementation.
//!
//! Publishes persistent messages to durable queues through the default
//! exchange. Consumers share one channel with a global prefetch of one, so
//! exactly one delivery is unsettled at any time across all queues.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use backon::{BackoffBuilder, ExponentialBuilder};
use deadpool_lapin::{Manager, Pool, PoolError};
use futures::StreamExt;
use lapin::{
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions,
        BasicQosOptions, BasicRejectOptions, ConfirmSelectOptions, QueueDeclareOptions,
    },
    types::FieldTable,
    BasicProperties, Channel,
};
use tracing::{debug, error, info, warn, Instrument};

use super::{BusError, Delivery, DeliveryHandler, Disposition, Message, MessageBus, Result};

/// Configuration for AMQP connection.
#[derive(Clone, Debug)]
pub struct AmqpBusConfig {
    /// AMQP connection URL (e.g., amqp://localhost:5672).
    pub url: String,
    /// Consumer tag prefix; the queue name is appended.
    pub consumer_tag: String,
    /// Publish attempts after the first failure.
    pub publish_retries: usize,
}

impl AmqpBusConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            consumer_tag: "tally-replicator".to_string(),
            publish_retries: 5,
        }
    }
}

/// AMQP message bus implementation using RabbitMQ.
pub struct AmqpMessageBus {
    pool: Pool,
    config: AmqpBusConfig,
}

impl AmqpMessageBus {
    /// Create a new AMQP message bus and verify the connection.
    pub async fn new(config: AmqpBusConfig) -> Result<Self> {
        let manager = Manager::new(config.url.clone(), Default::default());
        let pool = Pool::builder(manager)
            .max_size(4)
            .build()
            .map_err(|e| BusError::Connection(format!("Failed to create pool: {}", e)))?;

        // Verify connection
        let _conn = pool
            .get()
            .await
            .map_err(|e| BusError::Connection(format!("Failed to connect: {}", e)))?;

        info!(url = %config.url, "Connected to AMQP");

        Ok(Self { pool, config })
    }

    /// Get a channel from the pool.
    async fn get_channel(pool: &Pool) -> Result<Channel> {
        let conn = pool.get().await.map_err(|e: PoolError| {
            BusError::Connection(format!("Failed to get connection from pool: {}", e))
        })?;

        conn.create_channel()
            .await
            .map_err(|e| BusError::Connection(format!("Failed to create channel: {}", e)))
    }

    async fn declare_on(channel: &Channel, queue: &str) -> Result<()> {
        channel
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| BusError::Subscribe(format!("Failed to declare queue {}: {}", queue, e)))?;
        Ok(())
    }

    /// Consumer loop with automatic reconnection and exponential backoff with jitter.
    async fn consume_with_reconnect(
        pool: Pool,
        consumer_tag: String,
        queues: Vec<String>,
        handler: Arc<dyn DeliveryHandler>,
    ) {
        // Exponential backoff with jitter to prevent thundering herd
        let backoff_builder = ExponentialBuilder::default()
            .with_min_delay(Duration::from_millis(100))
            .with_max_delay(Duration::from_secs(30))
            .with_jitter();

        let mut backoff_iter = backoff_builder.build();

        loop {
            match Self::setup_consumer(&pool, &consumer_tag, &queues).await {
                Ok((_channel, consumers)) => {
                    info!(queues = ?queues, "Consumer connected, processing messages");
                    // Reset backoff on successful connection
                    backoff_iter = backoff_builder.build();

                    let mut stream = futures::stream::select_all(consumers);
                    while let Some(delivery) = stream.next().await {
                        match delivery {
                            Ok(delivery) => Self::process_delivery(delivery, handler.as_ref()).await,
                            Err(e) => {
                                error!(error = %e, "Consumer delivery error, will reconnect");
                                break;
                            }
                        }
                    }

                    info!(queues = ?queues, "Consumer stream ended, reconnecting...");
                }
                Err(e) => {
                    let delay = backoff_iter.next().unwrap_or(Duration::from_secs(30));
                    error!(
                        error = %e,
                        backoff_ms = %delay.as_millis(),
                        queues = ?queues,
                        "Failed to set up consumer, retrying after backoff"
                    );
                    tokio::time::sleep(delay).await;
                    continue;
                }
            }

            // Brief pause before reconnecting after stream end (not error)
            let delay = backoff_iter.next().unwrap_or(Duration::from_secs(30));
            tokio::time::sleep(delay).await;
        }
    }

    /// Open a channel with prefetch one and start a consumer per queue.
    async fn setup_consumer(
        pool: &Pool,
        consumer_tag: &str,
        queues: &[String],
    ) -> Result<(Channel, Vec<lapin::Consumer>)> {
        let channel = Self::get_channel(pool).await?;

        channel
            .basic_qos(1, BasicQosOptions { global: true })
            .await
            .map_err(|e| BusError::Subscribe(format!("Failed to set prefetch: {}", e)))?;

        let mut consumers = Vec::with_capacity(queues.len());
        for queue in queues {
            Self::declare_on(&channel, queue).await?;

            let consumer = channel
                .basic_consume(
                    queue,
                    &format!("{}-{}", consumer_tag, queue),
                    BasicConsumeOptions::default(),
                    FieldTable::default(),
                )
                .await
                .map_err(|e| BusError::Subscribe(format!("Failed to start consumer: {}", e)))?;
            consumers.push(consumer);
        }

        Ok((channel, consumers))
    }

    /// Hand one delivery to the handler and settle it.
    async fn process_delivery(delivery: lapin::message::Delivery, handler: &dyn DeliveryHandler) {
        let message_id = message_id_of(&delivery.properties);
        let queue = delivery.routing_key.as_str().to_string();
        let delivered = Delivery {
            queue: queue.clone(),
            message_id,
            body: delivery.data.clone().into(),
            redelivered: delivery.redelivered,
        };
        let tracking_id = delivered.tracking_id();

        let consume_span = tracing::info_span!(
            "bus.consume",
            queue = %queue,
            message_id = %tracking_id
        );

        let disposition = handler
            .handle(delivered)
            .instrument(consume_span)
            .await;

        let settled = match disposition {
            Disposition::Ack => delivery.ack(BasicAckOptions::default()).await,
            Disposition::Requeue => {
                delivery
                    .nack(BasicNackOptions {
                        requeue: true,
                        ..Default::default()
                    })
                    .await
            }
            Disposition::Reject => {
                delivery
                    .reject(BasicRejectOptions { requeue: false })
                    .await
            }
        };

        match settled {
            Ok(()) => debug!(queue = %queue, message_id = %tracking_id, ?disposition, "Settled delivery"),
            // The broker redelivers unsettled messages when the channel drops.
            Err(e) => error!(error = %e, message_id = %tracking_id, "Failed to settle delivery"),
        }
    }
}

/// Broker message id, if the producer set one.
fn message_id_of(properties: &BasicProperties) -> Option<String> {
    properties
        .message_id()
        .as_ref()
        .map(|id| id.as_str().to_string())
}

#[async_trait]
impl MessageBus for AmqpMessageBus {
    async fn declare(&self, queue: &str) -> Result<()> {
        let channel = Self::get_channel(&self.pool).await?;
        Self::declare_on(&channel, queue).await
    }

    #[tracing::instrument(name = "bus.publish", skip_all, fields(queue = %queue))]
    async fn publish(&self, queue: &str, message: Message) -> Result<()> {
        let max_retries = self.config.publish_retries;
        let message_id = message.message_id.clone();

        // Exponential backoff with jitter to prevent thundering herd
        let backoff = ExponentialBuilder::default()
            .with_min_delay(Duration::from_millis(100))
            .with_max_delay(Duration::from_secs(5))
            .with_max_times(max_retries)
            .with_jitter()
            .build();

        let mut last_error = None;

        for (attempt, delay) in std::iter::once(Duration::ZERO).chain(backoff).enumerate() {
            if attempt > 0 {
                tokio::time::sleep(delay).await;
            }

            // Get fresh channel for each attempt (handles reconnection)
            let channel = match Self::get_channel(&self.pool).await {
                Ok(ch) => ch,
                Err(e) => {
                    warn!(attempt = attempt + 1, max_retries, error = %e, "Failed to get channel, retrying...");
                    last_error = Some(e);
                    continue;
                }
            };

            if let Err(e) = channel
                .confirm_select(ConfirmSelectOptions::default())
                .await
            {
                last_error = Some(BusError::Publish(format!("Failed to enable confirms: {}", e)));
                continue;
            }
            if let Err(e) = Self::declare_on(&channel, queue).await {
                last_error = Some(e);
                continue;
            }

            let mut properties = BasicProperties::default()
                .with_content_type("application/json".into())
                .with_delivery_mode(2); // persistent
            if let Some(id) = &message_id {
                properties = properties.with_message_id(id.clone().into());
            }

            match channel
                .basic_publish(
                    "",
                    queue,
                    BasicPublishOptions::default(),
                    &message.body,
                    properties,
                )
                .await
            {
                Ok(confirm) => match confirm.await {
                    Ok(confirmation) if confirmation.is_nack() => {
                        warn!(attempt = attempt + 1, "Broker nacked publish, retrying...");
                        last_error = Some(BusError::Publish("Broker nacked message".to_string()));
                    }
                    Ok(_) => {
                        debug!(queue = %queue, message_id = ?message_id, "Published message");
                        return Ok(());
                    }
                    Err(e) => {
                        warn!(attempt = attempt + 1, error = %e, "Publish confirmation failed, retrying...");
                        last_error = Some(BusError::Publish(format!(
                            "Publish confirmation failed: {}",
                            e
                        )));
                    }
                },
                Err(e) => {
                    warn!(attempt = attempt + 1, error = %e, "Publish failed, retrying...");
                    last_error = Some(BusError::Publish(format!("Failed to publish: {}", e)));
                }
            }
        }

        Err(last_error.unwrap_or_else(|| BusError::Publish("Max retries exceeded".to_string())))
    }

    async fn consume(&self, queues: &[String], handler: Arc<dyn DeliveryHandler>) -> Result<()> {
        if queues.is_empty() {
            return Err(BusError::Subscribe("No queues to consume".to_string()));
        }
        Self::consume_with_reconnect(
            self.pool.clone(),
            self.config.consumer_tag.clone(),
            queues.to_vec(),
            handler,
        )
        .await;
        Ok(())
    }
}
