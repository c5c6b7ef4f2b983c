use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use outpost_helpers::{
    consumers::{MessageHandlerError, QueueMessageHandler},
    mqs::{QueueMessage, QueuePublisher},
};
use tokio::time::timeout;
use tracing::{debug, info_span, warn, Instrument};

use crate::{
    alert::AlertMonitor,
    consts::delivery_idempotency_key,
    errors::{
        AttemptError, AttemptErrorKind, DeliveryError, DestinationPublishError, EntityStoreError,
        PostDeliveryError, PreDeliveryError, PreDeliveryKind,
    },
    idempotency::{IdempotencyError, IdempotentExecutor},
    models::{Delivery, DeliveryTask, Destination, Event, LogEntry, RetryTask},
    retry::{backoff::Backoff, scheduler::RetryScheduling},
    stores::{DestinationGetter, DestinationPublisher, LogStore},
};

/// Configuration for the delivery handler.
#[derive(Debug, Clone)]
pub struct DeliveryHandlerConfig {
    /// Retries attempted per task, the initial delivery is attempt 0 so
    /// a limit of N allows N+1 adapter invocations in total.
    pub retry_max_limit: u32,
    /// The per-attempt adapter call timeout.
    pub delivery_timeout: Duration,
}

/// Executes one delivery attempt and decides what to do with the
/// outcome: emit the audit record, schedule a retry, and translate the
/// failure class into a broker disposition.
///
/// The adapter invocation runs under the delivery idempotence guard
/// keyed on `(event, destination, attempt)`, so concurrent duplicates
/// of the same task invoke the adapter at most once.
pub struct DeliveryHandler {
    destinations: Arc<dyn DestinationGetter>,
    log_store: Arc<dyn LogStore>,
    publisher: Arc<dyn DestinationPublisher>,
    retry_scheduler: Arc<dyn RetryScheduling>,
    backoff: Backoff,
    alert_monitor: Option<Arc<dyn AlertMonitor>>,
    idempotence: Arc<dyn IdempotentExecutor<DeliveryError>>,
    log_queue: Arc<dyn QueuePublisher>,
    config: DeliveryHandlerConfig,
}

impl DeliveryHandler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        destinations: Arc<dyn DestinationGetter>,
        log_store: Arc<dyn LogStore>,
        publisher: Arc<dyn DestinationPublisher>,
        retry_scheduler: Arc<dyn RetryScheduling>,
        backoff: Backoff,
        alert_monitor: Option<Arc<dyn AlertMonitor>>,
        idempotence: Arc<dyn IdempotentExecutor<DeliveryError>>,
        log_queue: Arc<dyn QueuePublisher>,
        config: DeliveryHandlerConfig,
    ) -> Self {
        Self {
            destinations,
            log_store,
            publisher,
            retry_scheduler,
            backoff,
            alert_monitor,
            idempotence,
            log_queue,
            config,
        }
    }

    async fn process(&self, message: &QueueMessage) -> Result<(), DeliveryError> {
        let mut task: DeliveryTask = serde_json::from_str(&message.body).map_err(|err| {
            PreDeliveryError::new(
                PreDeliveryKind::Parse,
                format!("failed to parse delivery task: {err}"),
            )
        })?;

        // A retry task carries only an event stub, refetch the
        // canonical event body from the log store.
        if task.event.is_stub() {
            task.event = self.rehydrate(&task).await?;
        }

        let destination = self.gate_destination(&task).await?;

        let guard_key = delivery_idempotency_key(&task.idempotency_key());
        match self
            .idempotence
            .exec(&guard_key, Box::pin(self.attempt(&destination, &task)))
            .await
        {
            Ok(_) => Ok(()),
            Err(IdempotencyError::Conflict) => Err(PreDeliveryError::new(
                PreDeliveryKind::System,
                "delivery attempt is being processed concurrently",
            )
            .into()),
            Err(IdempotencyError::Store(err)) => {
                Err(PreDeliveryError::new(PreDeliveryKind::System, err.to_string()).into())
            }
            Err(IdempotencyError::Execution(err)) => Err(err),
        }
    }

    async fn rehydrate(&self, task: &DeliveryTask) -> Result<Event, DeliveryError> {
        match self
            .log_store
            .retrieve_event(&task.event.tenant_id, &task.event.id)
            .await
        {
            Ok(Some(event)) => Ok(event),
            Ok(None) => Err(PreDeliveryError::new(
                PreDeliveryKind::EventNotFound,
                format!(
                    "event {event_id} is not in the log store",
                    event_id = task.event.id
                ),
            )
            .into()),
            Err(err) => {
                Err(PreDeliveryError::new(PreDeliveryKind::System, err.to_string()).into())
            }
        }
    }

    async fn gate_destination(&self, task: &DeliveryTask) -> Result<Destination, DeliveryError> {
        match self
            .destinations
            .retrieve_destination(&task.event.tenant_id, &task.destination_id)
            .await
        {
            Ok(Some(destination)) if destination.is_disabled() => Err(PreDeliveryError::new(
                PreDeliveryKind::DestinationDisabled,
                format!(
                    "destination {destination_id} is disabled",
                    destination_id = task.destination_id
                ),
            )
            .into()),
            Ok(Some(destination)) => Ok(destination),
            Ok(None) => Err(PreDeliveryError::new(
                PreDeliveryKind::DestinationNotFound,
                format!(
                    "destination {destination_id} not found",
                    destination_id = task.destination_id
                ),
            )
            .into()),
            Err(EntityStoreError::DestinationDeleted) => Err(PreDeliveryError::new(
                PreDeliveryKind::DestinationDeleted,
                format!(
                    "destination {destination_id} has been deleted",
                    destination_id = task.destination_id
                ),
            )
            .into()),
            Err(err) => {
                Err(PreDeliveryError::new(PreDeliveryKind::System, err.to_string()).into())
            }
        }
    }

    /// One guarded adapter invocation: invoke, classify, schedule the
    /// retry when eligible, and emit the audit record for every
    /// terminal outcome.
    async fn attempt(
        &self,
        destination: &Destination,
        task: &DeliveryTask,
    ) -> Result<(), DeliveryError> {
        let span = info_span!(
            "delivery_attempt",
            event_id = %task.event.id,
            destination_id = %task.destination_id,
            attempt = task.attempt,
            manual = task.manual,
        );
        async move {
            let invocation = timeout(
                self.config.delivery_timeout,
                self.publisher.publish_event(destination, task),
            )
            .await;
            let result = match invocation {
                Ok(result) => result,
                Err(_) => {
                    return Err(PreDeliveryError::new(
                        PreDeliveryKind::System,
                        format!(
                            "adapter call timed out after {timeout_ms}ms",
                            timeout_ms = self.config.delivery_timeout.as_millis()
                        ),
                    )
                    .into())
                }
            };

            match result {
                Ok(delivery) => {
                    debug!("delivery attempt succeeded");
                    if task.manual {
                        // A successful manual delivery supersedes any
                        // automatic retry still queued for the pair.
                        if let Err(err) = self.retry_scheduler.cancel(&task.retry_id()).await {
                            warn!("failed to cancel scheduled retry: {err}");
                        }
                    }
                    self.emit_log(task, &delivery).await?;
                    self.dispatch_alert(destination, &delivery);
                    Ok(())
                }
                Err(DestinationPublishError::Attempt { delivery, reason }) => {
                    debug!("delivery attempt failed: {reason}");
                    if self.should_schedule_retry(task) {
                        self.schedule_retry(task).await?;
                    }
                    self.emit_log(task, &delivery).await?;
                    self.dispatch_alert(destination, &delivery);
                    Err(AttemptError {
                        delivery,
                        kind: AttemptErrorKind::PublishAttempt,
                        reason,
                    }
                    .into())
                }
                Err(DestinationPublishError::Failed {
                    delivery: Some(delivery),
                    source,
                }) => {
                    self.emit_log(task, &delivery).await?;
                    self.dispatch_alert(destination, &delivery);
                    Err(AttemptError {
                        delivery,
                        kind: AttemptErrorKind::Other,
                        reason: source.to_string(),
                    }
                    .into())
                }
                Err(DestinationPublishError::Failed {
                    delivery: None,
                    source,
                }) => {
                    // No structured outcome was produced, nothing to
                    // log, the broker redelivers the task.
                    Err(PreDeliveryError::new(PreDeliveryKind::System, source.to_string()).into())
                }
            }
        }
        .instrument(span)
        .await
    }

    /// A retry is scheduled only for automatic tasks of retry-eligible
    /// events that have attempts left, and only for structured publish
    /// attempt failures (enforced at the call site).
    fn should_schedule_retry(&self, task: &DeliveryTask) -> bool {
        !task.manual
            && task.event.eligible_for_retry
            && task.attempt < self.config.retry_max_limit
    }

    async fn schedule_retry(&self, task: &DeliveryTask) -> Result<(), DeliveryError> {
        let retry_task = RetryTask {
            event_id: task.event.id.clone(),
            tenant_id: task.event.tenant_id.clone(),
            destination_id: task.destination_id.clone(),
            attempt: task.attempt + 1,
            telemetry: task.telemetry.clone(),
        };
        let delay = self.backoff.duration(task.attempt);
        self.retry_scheduler
            .schedule(&retry_task, delay)
            .await
            .map_err(|err| {
                // The adapter has already run, losing the retry here
                // must surface as a nack so the task is redelivered.
                PostDeliveryError::new(format!("failed to schedule retry: {err}")).into()
            })
    }

    async fn emit_log(
        &self,
        task: &DeliveryTask,
        delivery: &Delivery,
    ) -> Result<(), DeliveryError> {
        let entry = LogEntry {
            event: task.event.clone(),
            delivery: delivery.clone(),
        };
        let body = serde_json::to_string(&entry).map_err(|err| {
            DeliveryError::PostDelivery(PostDeliveryError::new(format!(
                "failed to serialize log entry: {err}"
            )))
        })?;
        self.log_queue.publish(body, None).await.map_err(|err| {
            DeliveryError::PostDelivery(PostDeliveryError::new(format!(
                "failed to emit log entry: {err}"
            )))
        })
    }

    /// Alert monitoring runs asynchronously after log emission, its
    /// failure never affects the delivery outcome.
    fn dispatch_alert(&self, destination: &Destination, delivery: &Delivery) {
        let Some(monitor) = &self.alert_monitor else {
            return;
        };
        let monitor = monitor.clone();
        let destination = destination.clone();
        let delivery = delivery.clone();
        tokio::spawn(async move {
            if let Err(err) = monitor.handle_attempt(&destination, &delivery).await {
                warn!(
                    destination_id = %destination.id,
                    "alert monitoring failed: {err}"
                );
            }
        });
    }
}

#[async_trait]
impl QueueMessageHandler for DeliveryHandler {
    async fn handle(&self, message: QueueMessage) -> Result<(), MessageHandlerError> {
        let result = self.process(&message).await;

        let disposition = match &result {
            Ok(()) => message.ack().await,
            Err(err) if err.should_ack() => {
                debug!("acknowledging terminal delivery failure: {err}");
                message.ack().await
            }
            Err(err) => {
                debug!("returning delivery task for redelivery: {err}");
                message.nack().await
            }
        };
        if let Err(err) = disposition {
            warn!(
                message_id = %message.message_id,
                "failed to settle delivery message: {err}"
            );
        }

        result.map_err(|err| MessageHandlerError::HandlerFailure(Box::new(err)))
    }
}
