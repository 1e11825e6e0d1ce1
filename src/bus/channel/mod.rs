//! In-process queue bus for standalone mode.
//!
//! Keeps named FIFO queues in memory and delivers one message at a time to a
//! single consumer, with the same ack / requeue / reject settlement as the
//! AMQP backend. Ideal for local development and testing without external
//! dependencies.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{Mutex, Notify};
use tracing::{debug, info};

use super::{BusError, Delivery, DeliveryHandler, Disposition, Message, MessageBus, Result};

/// A queued message.
#[derive(Debug, Clone)]
struct Envelope {
    /// Global publish order, used to interleave queues deterministically.
    seq: u64,
    message_id: Option<String>,
    body: Bytes,
    redelivered: bool,
}

#[derive(Default)]
struct State {
    queues: HashMap<String, VecDeque<Envelope>>,
    next_seq: u64,
    closed: bool,
    rejected: Vec<Delivery>,
}

impl State {
    /// Pop the oldest message across the given queues.
    fn pop_next(&mut self, queues: &[String]) -> Option<(String, Envelope)> {
        let queue = queues
            .iter()
            .filter_map(|q| self.queues.get(q).and_then(|d| d.front()).map(|e| (q, e.seq)))
            .min_by_key(|(_, seq)| *seq)
            .map(|(q, _)| q.clone())?;

        let envelope = self.queues.get_mut(&queue)?.pop_front()?;
        Some((queue, envelope))
    }
}

/// In-memory message bus.
///
/// Requeued messages go back to the head of their queue, so the consumer sees
/// them again before anything published later.
pub struct ChannelBus {
    state: Mutex<State>,
    notify: Notify,
}

impl ChannelBus {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
            notify: Notify::new(),
        }
    }

    /// Stop consumers once they finish their current delivery.
    pub async fn close(&self) {
        self.state.lock().await.closed = true;
        self.notify.notify_waiters();
        self.notify.notify_one();
    }

    /// Number of messages waiting on a queue.
    pub async fn pending(&self, queue: &str) -> usize {
        self.state
            .lock()
            .await
            .queues
            .get(queue)
            .map_or(0, VecDeque::len)
    }

    /// Deliveries settled with `Disposition::Reject`.
    pub async fn rejected(&self) -> Vec<Delivery> {
        self.state.lock().await.rejected.clone()
    }

    /// Deliver queued messages until every given queue is empty.
    ///
    /// Returns the number of deliveries made, redeliveries included.
    pub async fn drain(&self, queues: &[String], handler: Arc<dyn DeliveryHandler>) -> usize {
        let mut delivered = 0;
        loop {
            let next = self.state.lock().await.pop_next(queues);
            match next {
                Some((queue, envelope)) => {
                    self.deliver(queue, envelope, handler.as_ref()).await;
                    delivered += 1;
                }
                None => return delivered,
            }
        }
    }

    async fn deliver(&self, queue: String, envelope: Envelope, handler: &dyn DeliveryHandler) {
        let delivery = Delivery {
            queue: queue.clone(),
            message_id: envelope.message_id.clone(),
            body: envelope.body.clone(),
            redelivered: envelope.redelivered,
        };

        let disposition = handler.handle(delivery.clone()).await;
        debug!(queue = %queue, message_id = %delivery.tracking_id(), ?disposition, "Settled delivery");

        let mut state = self.state.lock().await;
        match disposition {
            Disposition::Ack => {}
            Disposition::Requeue => {
                state.queues.entry(queue).or_default().push_front(Envelope {
                    redelivered: true,
                    ..envelope
                });
            }
            Disposition::Reject => state.rejected.push(delivery),
        }
    }
}

impl Default for ChannelBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MessageBus for ChannelBus {
    async fn declare(&self, queue: &str) -> Result<()> {
        self.state
            .lock()
            .await
            .queues
            .entry(queue.to_string())
            .or_default();
        Ok(())
    }

    async fn publish(&self, queue: &str, message: Message) -> Result<()> {
        let message_id = message.message_id;
        {
            let mut state = self.state.lock().await;
            if state.closed {
                return Err(BusError::Closed);
            }
            let seq = state.next_seq;
            state.next_seq += 1;
            state
                .queues
                .entry(queue.to_string())
                .or_default()
                .push_back(Envelope {
                    seq,
                    message_id,
                    body: message.body,
                    redelivered: false,
                });
        }
        self.notify.notify_one();
        Ok(())
    }

    async fn consume(&self, queues: &[String], handler: Arc<dyn DeliveryHandler>) -> Result<()> {
        for queue in queues {
            self.declare(queue).await?;
        }
        info!(queues = ?queues, "Channel consumer started");

        loop {
            let next = {
                let mut state = self.state.lock().await;
                if state.closed {
                    info!("Channel bus closed, consumer stopping");
                    return Ok(());
                }
                state.pop_next(queues)
            };

            match next {
                Some((queue, envelope)) => self.deliver(queue, envelope, handler.as_ref()).await,
                None => self.notify.notified().await,
            }
        }
    }
}
