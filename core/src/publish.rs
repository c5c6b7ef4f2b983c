use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use futures::{stream, StreamExt};
use outpost_helpers::{
    consumers::{MessageHandlerError, QueueMessageHandler},
    mqs::{QueueMessage, QueuePublisher},
    telemetry::OUTPOST_CONTEXT_ID_KEY,
};
use tracing::{debug, info_span, warn, Instrument};

use crate::{
    consts::publish_idempotency_key,
    errors::{EntityStoreError, PublishError},
    idempotency::{ExecOutcome, IdempotencyError, IdempotentExecutor},
    models::{
        DeliveryTask, Destination, DestinationStatus, DestinationStatusKind, Event, PublishResult,
    },
    stores::EntityStore,
};

/// Configuration for the publish handler.
#[derive(Debug, Clone)]
pub struct PublishHandlerConfig {
    /// The configured topic set. When non-empty, events must carry a
    /// topic that is either `*` or a member of the set.
    pub topics: Vec<String>,
    /// The width of the bounded fan-out that enqueues delivery tasks.
    pub fanout_concurrency: usize,
}

/// Fans an incoming event out to its matched destinations, enqueueing
/// one delivery task per `(event, destination)` pair.
///
/// The fan-out runs under the publish idempotence guard keyed on the
/// event ID, so an event is fanned out once and only once across any
/// number of concurrent or repeated submissions.
pub struct PublishHandler {
    entity_store: Arc<dyn EntityStore>,
    delivery_queue: Arc<dyn QueuePublisher>,
    idempotence: Arc<dyn IdempotentExecutor<PublishError>>,
    config: PublishHandlerConfig,
}

impl PublishHandler {
    pub fn new(
        entity_store: Arc<dyn EntityStore>,
        delivery_queue: Arc<dyn QueuePublisher>,
        idempotence: Arc<dyn IdempotentExecutor<PublishError>>,
        config: PublishHandlerConfig,
    ) -> Self {
        Self {
            entity_store,
            delivery_queue,
            idempotence,
            config,
        }
    }

    pub async fn handle(&self, event: Event) -> Result<PublishResult, PublishError> {
        self.validate_topic(&event)?;

        // Matching happens outside the guard, a guard conflict must not
        // hide destination resolution errors from the caller.
        let matched = self.entity_store.match_event(&event).await?;
        let destinations = self.destination_statuses(&event, &matched).await?;

        if matched.is_empty() {
            debug!(event_id = %event.id, "no destinations matched");
            return Ok(PublishResult {
                event_id: event.id,
                matched_count: 0,
                queued_count: 0,
                destinations,
            });
        }

        let guard_key = publish_idempotency_key(&event.id);
        let fan_out_fut = Box::pin(self.fan_out(&event, &matched));
        let outcome = self
            .idempotence
            .exec(&guard_key, fan_out_fut)
            .await
            .map_err(|err| match err {
                IdempotencyError::Conflict => PublishError::Conflict,
                IdempotencyError::Store(store_err) => PublishError::Guard(store_err),
                IdempotencyError::Execution(publish_err) => publish_err,
            })?;

        let queued_count = match outcome {
            ExecOutcome::Executed => matched.len(),
            ExecOutcome::AlreadyProcessed => {
                debug!(event_id = %event.id, "event was already fanned out");
                0
            }
        };
        Ok(PublishResult {
            event_id: event.id,
            matched_count: matched.len(),
            queued_count,
            destinations,
        })
    }

    fn validate_topic(&self, event: &Event) -> Result<(), PublishError> {
        if self.config.topics.is_empty() {
            return Ok(());
        }
        if event.topic.is_empty() {
            return Err(PublishError::TopicRequired);
        }
        if event.topic != "*" && !self.config.topics.contains(&event.topic) {
            return Err(PublishError::InvalidTopic(event.topic.clone()));
        }
        Ok(())
    }

    /// Synthesizes the status report for a targeted publish, explaining
    /// why the named destination was or was not queued.
    async fn destination_statuses(
        &self,
        event: &Event,
        matched: &[Destination],
    ) -> Result<Option<Vec<DestinationStatus>>, PublishError> {
        let Some(target) = &event.destination_id else {
            return Ok(None);
        };

        let status = if matched.iter().any(|destination| &destination.id == target) {
            DestinationStatusKind::Queued
        } else {
            match self
                .entity_store
                .retrieve_destination(&event.tenant_id, target)
                .await
            {
                Ok(Some(destination)) if destination.is_disabled() => {
                    DestinationStatusKind::Disabled
                }
                Ok(Some(_)) => DestinationStatusKind::TopicMismatch,
                Ok(None) | Err(EntityStoreError::DestinationDeleted) => {
                    DestinationStatusKind::NotFound
                }
                Err(err) => return Err(PublishError::EntityStore(err)),
            }
        };
        Ok(Some(vec![DestinationStatus {
            destination_id: target.clone(),
            status,
        }]))
    }

    async fn fan_out(
        &self,
        event: &Event,
        destinations: &[Destination],
    ) -> Result<(), PublishError> {
        let span = info_span!(
            "publish_receive",
            event_id = %event.id,
            tenant_id = %event.tenant_id,
        );
        async move {
            debug!(
                matched_count = destinations.len(),
                "fanning event out to matched destinations"
            );
            let delivery_futs: Vec<
                std::pin::Pin<Box<dyn std::future::Future<Output = Result<(), String>> + Send + '_>>,
            > = destinations
                .iter()
                .map(|destination| Box::pin(self.deliver_to(event, destination)) as _)
                .collect();
            let failures: Vec<String> = stream::iter(delivery_futs)
                .buffer_unordered(self.config.fanout_concurrency.max(1))
                .filter_map(|result| async move { result.err() })
                .collect()
                .await;

            // Any failure aborts the guarded section so the whole
            // fan-out may be retried.
            if failures.is_empty() {
                Ok(())
            } else {
                Err(PublishError::FanOut(failures.join("; ")))
            }
        }
        .instrument(span)
        .await
    }

    async fn deliver_to(&self, event: &Event, destination: &Destination) -> Result<(), String> {
        let task = DeliveryTask {
            event: event.clone(),
            destination_id: destination.id.clone(),
            attempt: 0,
            manual: false,
            telemetry: event.telemetry.clone(),
        };
        let body = serde_json::to_string(&task).map_err(|err| err.to_string())?;
        self.delivery_queue
            .publish(body, trace_attributes(event))
            .await
            .map_err(|err| err.to_string())
    }
}

fn trace_attributes(event: &Event) -> Option<HashMap<String, String>> {
    event.telemetry.as_ref().and_then(|telemetry| {
        telemetry.trace_id.as_ref().map(|trace_id| {
            HashMap::from([(OUTPOST_CONTEXT_ID_KEY.to_string(), trace_id.clone())])
        })
    })
}

/// Adapts the publish handler to the queue consumer runtime, parsing
/// events off the publish queue and translating outcomes into broker
/// dispositions.
pub struct PublishMessageHandler {
    handler: Arc<PublishHandler>,
}

impl PublishMessageHandler {
    pub fn new(handler: Arc<PublishHandler>) -> Self {
        Self { handler }
    }
}

#[async_trait]
impl QueueMessageHandler for PublishMessageHandler {
    async fn handle(&self, message: QueueMessage) -> Result<(), MessageHandlerError> {
        let event: Event = match serde_json::from_str(&message.body) {
            Ok(event) => event,
            Err(err) => {
                warn!(
                    message_id = %message.message_id,
                    "dropping malformed publish message: {err}"
                );
                ack_or_log(&message).await;
                return Err(MessageHandlerError::HandlerFailure(Box::new(err)));
            }
        };

        match self.handler.handle(event).await {
            Ok(result) => {
                debug!(
                    event_id = %result.event_id,
                    matched_count = result.matched_count,
                    queued_count = result.queued_count,
                    "handled published event"
                );
                ack_or_log(&message).await;
                Ok(())
            }
            Err(err) => {
                // Topic validation failures are permanent, everything
                // else may succeed on a later redelivery.
                let permanent = matches!(
                    err,
                    PublishError::TopicRequired | PublishError::InvalidTopic(_)
                );
                if permanent {
                    ack_or_log(&message).await;
                } else if let Err(nack_err) = message.nack().await {
                    warn!(
                        message_id = %message.message_id,
                        "failed to nack publish message: {nack_err}"
                    );
                }
                Err(MessageHandlerError::HandlerFailure(Box::new(err)))
            }
        }
    }
}

async fn ack_or_log(message: &QueueMessage) {
    if let Err(err) = message.ack().await {
        warn!(
            message_id = %message.message_id,
            "failed to ack publish message: {err}"
        );
    }
}
