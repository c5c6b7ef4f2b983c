use std::{
    collections::HashMap,
    error::Error,
    fmt,
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use outpost_helpers::{
    mqs::{QueueError, QueuePublisher},
    telemetry::OUTPOST_CONTEXT_ID_KEY,
    time::calculate_polling_wait_time,
};
use tokio::{
    sync::{broadcast, Mutex},
    time::Instant,
};
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::{
    errors::LogStoreError,
    models::{DeliveryTask, RetryTask},
    retry::rsmq::{message_id_from_dedup_id, Rsmq, RsmqError, RsmqMessage, RsmqSendOptions},
    stores::LogStore,
};

/// The delay-queue operations the retry scheduler needs, a seam over
/// RSMQ so the scheduling protocol can be exercised in-memory.
#[async_trait]
pub trait DelayQueue: Send + Sync {
    /// Pushes a message that becomes visible after the delay. A send
    /// with a previously used deduplication ID overwrites the earlier
    /// entry's payload and delay.
    async fn send(
        &self,
        body: String,
        delay: Duration,
        dedup_id: Option<String>,
    ) -> Result<String, RsmqError>;

    /// Pops the next visible message, hiding it for the queue's
    /// visibility timeout.
    async fn receive(&self) -> Result<Option<RsmqMessage>, RsmqError>;

    async fn delete(&self, message_id: &str) -> Result<bool, RsmqError>;
}

/// The Redis-backed retry queue, an RSMQ bound to a fixed queue name
/// and visibility timeout.
pub struct RetryQueue {
    rsmq: Rsmq,
    queue: String,
    visibility_timeout: Duration,
}

impl RetryQueue {
    pub fn new(rsmq: Rsmq, queue: String, visibility_timeout: Duration) -> Self {
        Self {
            rsmq,
            queue,
            visibility_timeout,
        }
    }

    pub async fn init(&self) -> Result<(), RsmqError> {
        self.rsmq.create_queue(&self.queue).await
    }
}

#[async_trait]
impl DelayQueue for RetryQueue {
    async fn send(
        &self,
        body: String,
        delay: Duration,
        dedup_id: Option<String>,
    ) -> Result<String, RsmqError> {
        self.rsmq
            .send_message(&self.queue, &body, delay, RsmqSendOptions { dedup_id })
            .await
    }

    async fn receive(&self) -> Result<Option<RsmqMessage>, RsmqError> {
        self.rsmq
            .receive_message(&self.queue, self.visibility_timeout)
            .await
    }

    async fn delete(&self, message_id: &str) -> Result<bool, RsmqError> {
        self.rsmq.delete_message(&self.queue, message_id).await
    }
}

/// An in-memory delay queue with visibility-timeout semantics, used for
/// the local platform and tests.
pub struct InMemoryDelayQueue {
    entries: Mutex<HashMap<String, InMemoryDelayEntry>>,
    visibility_timeout: Duration,
}

struct InMemoryDelayEntry {
    body: String,
    visible_at: Instant,
    receive_count: u64,
}

impl InMemoryDelayQueue {
    pub fn new(visibility_timeout: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            visibility_timeout,
        }
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }
}

#[async_trait]
impl DelayQueue for InMemoryDelayQueue {
    async fn send(
        &self,
        body: String,
        delay: Duration,
        dedup_id: Option<String>,
    ) -> Result<String, RsmqError> {
        let message_id = match dedup_id {
            Some(dedup_id) => message_id_from_dedup_id(&dedup_id),
            None => nanoid::nanoid!(),
        };
        let mut entries = self.entries.lock().await;
        let receive_count = entries
            .get(&message_id)
            .map(|entry| entry.receive_count)
            .unwrap_or(0);
        entries.insert(
            message_id.clone(),
            InMemoryDelayEntry {
                body,
                visible_at: Instant::now() + delay,
                receive_count,
            },
        );
        Ok(message_id)
    }

    async fn receive(&self) -> Result<Option<RsmqMessage>, RsmqError> {
        let mut entries = self.entries.lock().await;
        let now = Instant::now();
        let next = entries
            .iter()
            .filter(|(_, entry)| entry.visible_at <= now)
            .min_by_key(|(_, entry)| entry.visible_at)
            .map(|(id, _)| id.clone());
        let Some(message_id) = next else {
            return Ok(None);
        };
        let Some(entry) = entries.get_mut(&message_id) else {
            return Ok(None);
        };
        entry.visible_at = now + self.visibility_timeout;
        entry.receive_count += 1;
        Ok(Some(RsmqMessage {
            id: message_id,
            body: entry.body.clone(),
            receive_count: entry.receive_count,
        }))
    }

    async fn delete(&self, message_id: &str) -> Result<bool, RsmqError> {
        let mut entries = self.entries.lock().await;
        Ok(entries.remove(message_id).is_some())
    }
}

/// Provides a custom error type to be used for failures
/// in scheduling or re-emitting retries.
#[derive(Debug)]
pub enum RetrySchedulerError {
    Queue(RsmqError),
    Serialize(serde_json::Error),
    /// The event referenced by a popped retry is not in the log store
    /// yet, usually a race with the log batcher. The retry message is
    /// left in place and becomes visible again after the visibility
    /// timeout.
    EventNotFound { tenant_id: String, event_id: String },
    LogStore(LogStoreError),
    Publish(QueueError),
}

impl fmt::Display for RetrySchedulerError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            RetrySchedulerError::Queue(err) => write!(f, "retry scheduler error: {err}"),
            RetrySchedulerError::Serialize(err) => {
                write!(f, "retry scheduler error: failed to serialize task: {err}")
            }
            RetrySchedulerError::EventNotFound {
                tenant_id,
                event_id,
            } => write!(
                f,
                "retry scheduler error: event {event_id} for tenant {tenant_id} is not in the log store yet"
            ),
            RetrySchedulerError::LogStore(err) => write!(f, "retry scheduler error: {err}"),
            RetrySchedulerError::Publish(err) => write!(f, "retry scheduler error: {err}"),
        }
    }
}

impl Error for RetrySchedulerError {}

impl From<RsmqError> for RetrySchedulerError {
    fn from(error: RsmqError) -> Self {
        RetrySchedulerError::Queue(error)
    }
}

impl From<serde_json::Error> for RetrySchedulerError {
    fn from(error: serde_json::Error) -> Self {
        RetrySchedulerError::Serialize(error)
    }
}

/// The scheduling operations the delivery handler depends on.
#[async_trait]
pub trait RetryScheduling: Send + Sync {
    async fn schedule(&self, task: &RetryTask, delay: Duration) -> Result<(), RetrySchedulerError>;

    /// Cancels the scheduled retry for an `(event, destination)` pair,
    /// identified by its stable retry ID.
    async fn cancel(&self, retry_id: &str) -> Result<(), RetrySchedulerError>;
}

/// Schedules retries onto the delay queue and re-emits them as fresh
/// delivery tasks once their backoff window has passed.
///
/// The delay queue carries only identifiers, the monitor refetches the
/// canonical event body from the log store at pop time, so retries
/// survive restarts and always observe the persisted event.
pub struct RetryScheduler {
    queue: Arc<dyn DelayQueue>,
    log_store: Arc<dyn LogStore>,
    delivery_queue: Arc<dyn QueuePublisher>,
    poll_backoff: Duration,
}

impl RetryScheduler {
    pub fn new(
        queue: Arc<dyn DelayQueue>,
        log_store: Arc<dyn LogStore>,
        delivery_queue: Arc<dyn QueuePublisher>,
        poll_backoff: Duration,
    ) -> Self {
        Self {
            queue,
            log_store,
            delivery_queue,
            poll_backoff,
        }
    }

    /// Polls the queue once. Returns whether a retry was re-emitted.
    ///
    /// On any failure after the pop the retry message is deliberately
    /// not deleted, it becomes visible again after the visibility
    /// timeout and the pop is retried.
    pub async fn poll_once(&self) -> Result<bool, RetrySchedulerError> {
        let Some(message) = self.queue.receive().await? else {
            return Ok(false);
        };

        let task: RetryTask = match serde_json::from_str(&message.body) {
            Ok(task) => task,
            Err(err) => {
                // A malformed payload can never succeed, drop it instead
                // of letting it reappear forever.
                error!(
                    message_id = %message.id,
                    "dropping malformed retry message: {err}"
                );
                self.queue.delete(&message.id).await?;
                return Ok(false);
            }
        };

        let event = self
            .log_store
            .retrieve_event(&task.tenant_id, &task.event_id)
            .await
            .map_err(RetrySchedulerError::LogStore)?
            .ok_or_else(|| RetrySchedulerError::EventNotFound {
                tenant_id: task.tenant_id.clone(),
                event_id: task.event_id.clone(),
            })?;

        let delivery_task = DeliveryTask {
            event,
            destination_id: task.destination_id.clone(),
            attempt: task.attempt,
            manual: false,
            telemetry: task.telemetry.clone(),
        };
        let body =
            serde_json::to_string(&delivery_task).map_err(RetrySchedulerError::Serialize)?;
        let attributes = task.telemetry.as_ref().and_then(|telemetry| {
            telemetry.trace_id.as_ref().map(|trace_id| {
                HashMap::from([(OUTPOST_CONTEXT_ID_KEY.to_string(), trace_id.clone())])
            })
        });
        self.delivery_queue
            .publish(body, attributes)
            .await
            .map_err(RetrySchedulerError::Publish)?;

        // Deleting last keeps the at-least-once property, a crash here
        // re-emits the task and the delivery idempotence guard dedupes.
        self.queue.delete(&message.id).await?;
        debug!(
            event_id = %task.event_id,
            destination_id = %task.destination_id,
            attempt = task.attempt,
            "re-emitted retry as delivery task"
        );
        Ok(true)
    }

    /// The polling monitor worker loop. Runs until the shutdown signal
    /// fires, transient poll failures are logged and retried after the
    /// poll backoff.
    pub async fn monitor(&self, shutdown: broadcast::Sender<()>) -> Result<(), RetrySchedulerError> {
        let mut shutdown_rx = shutdown.subscribe();
        async {
            loop {
                let poll_started_at = Instant::now();
                let processed = tokio::select! {
                    _ = shutdown_rx.recv() => {
                        info!("received shutdown signal, stopping retry monitor");
                        break;
                    }
                    result = self.poll_once() => match result {
                        Ok(processed) => processed,
                        Err(err) => {
                            warn!("retry poll failed: {err}");
                            false
                        }
                    },
                };

                if !processed {
                    let wait_ms = calculate_polling_wait_time(
                        poll_started_at,
                        self.poll_backoff.as_millis() as u64,
                    );
                    tokio::select! {
                        _ = shutdown_rx.recv() => {
                            info!("received shutdown signal, stopping retry monitor");
                            break;
                        }
                        _ = tokio::time::sleep(Duration::from_millis(wait_ms)) => {}
                    }
                }
            }
            Ok(())
        }
        .instrument(info_span!("retry_monitor"))
        .await
    }
}

#[async_trait]
impl RetryScheduling for RetryScheduler {
    async fn schedule(&self, task: &RetryTask, delay: Duration) -> Result<(), RetrySchedulerError> {
        let body = serde_json::to_string(task)?;
        self.queue
            .send(body, delay, Some(task.retry_id()))
            .await?;
        debug!(
            event_id = %task.event_id,
            destination_id = %task.destination_id,
            attempt = task.attempt,
            delay_ms = delay.as_millis() as u64,
            "scheduled retry"
        );
        Ok(())
    }

    async fn cancel(&self, retry_id: &str) -> Result<(), RetrySchedulerError> {
        let deleted = self
            .queue
            .delete(&message_id_from_dedup_id(retry_id))
            .await?;
        debug!(retry_id, deleted, "cancelled scheduled retry");
        Ok(())
    }
}
