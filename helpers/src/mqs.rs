use std::{
    collections::HashMap,
    error::Error,
    fmt::{self, Debug},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};

/// Provides a custom error type to be used for failures
/// in interactions with a message queue.
#[derive(Debug)]
pub enum QueueError {
    Publish(String),
    Receive(String),
    Acknowledge(String),
    /// The queue or the connection behind it has been closed
    /// and no further messages will be delivered.
    Closed,
}

impl fmt::Display for QueueError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            QueueError::Publish(reason) => {
                write!(f, "queue error: failed to publish message: {reason}")
            }
            QueueError::Receive(reason) => {
                write!(f, "queue error: failed to receive message: {reason}")
            }
            QueueError::Acknowledge(reason) => {
                write!(f, "queue error: failed to acknowledge message: {reason}")
            }
            QueueError::Closed => write!(f, "queue error: the queue has been closed"),
        }
    }
}

impl Error for QueueError {}

/// Provides a trait for publishing messages to a queue
/// or message broker.
///
/// Implementations must be safe to share across tasks,
/// publishing is expected to be called concurrently from
/// bounded fan-out loops.
#[async_trait]
pub trait QueuePublisher: Send + Sync {
    /// Publishes a message with the given body onto the queue.
    /// The optional attributes are carried as broker message attributes
    /// where the broker supports them, used for trace context propagation.
    async fn publish(
        &self,
        body: String,
        attributes: Option<HashMap<String, String>>,
    ) -> Result<(), QueueError>;
}

/// Provides a trait for the acknowledgement handle attached
/// to each received message.
///
/// `ack` removes the message from the queue, `nack` returns it
/// for redelivery after the broker's visibility timeout.
#[async_trait]
pub trait Acknowledger: Send + Sync {
    async fn ack(&self) -> Result<(), QueueError>;
    async fn nack(&self) -> Result<(), QueueError>;
}

/// A message that has been received from a queue subscription.
///
/// A message handler must call exactly one of `ack` or `nack`
/// before returning, the broker redelivers unacknowledged messages
/// once their visibility timeout expires.
#[derive(Clone)]
pub struct QueueMessage {
    /// A unique identifier for the message, assigned by the broker.
    pub message_id: String,
    /// The contents of the message.
    pub body: String,
    /// The number of times this message has been delivered,
    /// starting at 1 for the first delivery where the broker
    /// reports it, 0 where it does not.
    pub delivery_count: u32,
    /// Broker message attributes, used for trace context propagation
    /// across async message passing boundaries.
    pub attributes: HashMap<String, String>,
    acknowledger: Arc<dyn Acknowledger>,
}

impl QueueMessage {
    pub fn new(
        message_id: String,
        body: String,
        delivery_count: u32,
        attributes: HashMap<String, String>,
        acknowledger: Arc<dyn Acknowledger>,
    ) -> Self {
        Self {
            message_id,
            body,
            delivery_count,
            attributes,
            acknowledger,
        }
    }

    /// Removes the message from the queue.
    pub async fn ack(&self) -> Result<(), QueueError> {
        self.acknowledger.ack().await
    }

    /// Returns the message to the queue for redelivery.
    pub async fn nack(&self) -> Result<(), QueueError> {
        self.acknowledger.nack().await
    }
}

impl Debug for QueueMessage {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("QueueMessage")
            .field("message_id", &self.message_id)
            .field("body", &self.body)
            .field("delivery_count", &self.delivery_count)
            .finish()
    }
}

/// Provides a trait for a subscription to a queue
/// or message broker that yields messages one at a time.
#[async_trait]
pub trait Subscription: Send + Sync {
    /// Waits for the next message on the subscription.
    /// This future must be cancel safe so that callers can race it
    /// against a shutdown signal.
    async fn receive(&mut self) -> Result<QueueMessage, QueueError>;
}

struct InMemoryEnvelope {
    message_id: String,
    body: String,
    attributes: HashMap<String, String>,
    delivery_count: u32,
}

/// An in-memory queue used for local development and tests.
///
/// Messages are delivered in publish order, a nacked message is
/// republished at the back of the queue after the configured
/// redelivery delay.
pub struct InMemoryQueue {
    sender: mpsc::UnboundedSender<InMemoryEnvelope>,
    receiver: Arc<Mutex<mpsc::UnboundedReceiver<InMemoryEnvelope>>>,
    redelivery_delay: Duration,
    next_message_id: Arc<AtomicU64>,
}

impl InMemoryQueue {
    pub fn new() -> Self {
        Self::with_redelivery_delay(Duration::ZERO)
    }

    pub fn with_redelivery_delay(redelivery_delay: Duration) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            sender,
            receiver: Arc::new(Mutex::new(receiver)),
            redelivery_delay,
            next_message_id: Arc::new(AtomicU64::new(1)),
        }
    }

    pub fn publisher(&self) -> InMemoryQueuePublisher {
        InMemoryQueuePublisher {
            sender: self.sender.clone(),
            next_message_id: self.next_message_id.clone(),
        }
    }

    pub fn subscription(&self) -> InMemorySubscription {
        InMemorySubscription {
            sender: self.sender.clone(),
            receiver: self.receiver.clone(),
            redelivery_delay: self.redelivery_delay,
        }
    }
}

impl Default for InMemoryQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone)]
pub struct InMemoryQueuePublisher {
    sender: mpsc::UnboundedSender<InMemoryEnvelope>,
    next_message_id: Arc<AtomicU64>,
}

#[async_trait]
impl QueuePublisher for InMemoryQueuePublisher {
    async fn publish(
        &self,
        body: String,
        attributes: Option<HashMap<String, String>>,
    ) -> Result<(), QueueError> {
        let message_id = self
            .next_message_id
            .fetch_add(1, Ordering::Relaxed)
            .to_string();
        self.sender
            .send(InMemoryEnvelope {
                message_id,
                body,
                attributes: attributes.unwrap_or_default(),
                delivery_count: 0,
            })
            .map_err(|_| QueueError::Closed)
    }
}

pub struct InMemorySubscription {
    sender: mpsc::UnboundedSender<InMemoryEnvelope>,
    receiver: Arc<Mutex<mpsc::UnboundedReceiver<InMemoryEnvelope>>>,
    redelivery_delay: Duration,
}

#[async_trait]
impl Subscription for InMemorySubscription {
    async fn receive(&mut self) -> Result<QueueMessage, QueueError> {
        let envelope = {
            let mut receiver = self.receiver.lock().await;
            receiver.recv().await.ok_or(QueueError::Closed)?
        };
        let acknowledger = Arc::new(InMemoryAcknowledger {
            sender: self.sender.clone(),
            envelope: Mutex::new(Some(InMemoryEnvelope {
                message_id: envelope.message_id.clone(),
                body: envelope.body.clone(),
                attributes: envelope.attributes.clone(),
                delivery_count: envelope.delivery_count + 1,
            })),
            redelivery_delay: self.redelivery_delay,
        });
        Ok(QueueMessage::new(
            envelope.message_id,
            envelope.body,
            envelope.delivery_count + 1,
            envelope.attributes,
            acknowledger,
        ))
    }
}

struct InMemoryAcknowledger {
    sender: mpsc::UnboundedSender<InMemoryEnvelope>,
    envelope: Mutex<Option<InMemoryEnvelope>>,
    redelivery_delay: Duration,
}

#[async_trait]
impl Acknowledger for InMemoryAcknowledger {
    async fn ack(&self) -> Result<(), QueueError> {
        // Dropping the stored envelope settles the message,
        // a later nack on the same message becomes a no-op.
        self.envelope.lock().await.take();
        Ok(())
    }

    async fn nack(&self) -> Result<(), QueueError> {
        let envelope = self.envelope.lock().await.take();
        let Some(envelope) = envelope else {
            return Ok(());
        };
        let sender = self.sender.clone();
        let delay = self.redelivery_delay;
        if delay.is_zero() {
            return sender.send(envelope).map_err(|_| QueueError::Closed);
        }
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = sender.send(envelope);
        });
        Ok(())
    }
}
