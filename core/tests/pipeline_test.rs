use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use chrono::Utc;
use outpost_core::{
    delivery::{DeliveryHandler, DeliveryHandlerConfig},
    errors::{DeliveryError, DestinationPublishError, PublishError},
    idempotency::{Idempotence, IdempotenceConfig, IdempotentExecutor, InMemoryGuardStore},
    logbatch::{LogBatcher, LogBatcherConfig},
    models::{Delivery, DeliveryStatus, DeliveryTask, Destination, Event},
    publish::{PublishHandler, PublishHandlerConfig},
    retry::{
        backoff::Backoff,
        scheduler::{InMemoryDelayQueue, RetryScheduler},
    },
    stores::{DestinationPublisher, InMemoryEntityStore, InMemoryLogStore},
};
use outpost_helpers::{
    consumers::{Consumer, ConsumerConfig, QueueMessageHandler},
    mqs::{InMemoryQueue, QueuePublisher},
};
use serde_json::json;
use tokio::sync::{broadcast, Mutex};

/// Scripted adapter: pops one outcome per invocation, repeating the
/// last entry once the script runs out, and records every invocation.
struct ScriptedAdapter {
    outcomes: Mutex<Vec<AdapterOutcome>>,
    invocations: Mutex<Vec<(String, u32)>>,
    call_count: AtomicUsize,
}

#[derive(Clone, Copy)]
enum AdapterOutcome {
    Success,
    AttemptFailure,
}

impl ScriptedAdapter {
    fn new(outcomes: Vec<AdapterOutcome>) -> Arc<Self> {
        Arc::new(Self {
            outcomes: Mutex::new(outcomes),
            invocations: Mutex::new(Vec::new()),
            call_count: AtomicUsize::new(0),
        })
    }

    fn calls(&self) -> usize {
        self.call_count.load(Ordering::SeqCst)
    }

    async fn attempts(&self) -> Vec<u32> {
        self.invocations
            .lock()
            .await
            .iter()
            .map(|(_, attempt)| *attempt)
            .collect()
    }
}

#[async_trait]
impl DestinationPublisher for ScriptedAdapter {
    async fn publish_event(
        &self,
        destination: &Destination,
        task: &DeliveryTask,
    ) -> Result<Delivery, DestinationPublishError> {
        self.call_count.fetch_add(1, Ordering::SeqCst);
        self.invocations
            .lock()
            .await
            .push((destination.id.clone(), task.attempt));
        let mut outcomes = self.outcomes.lock().await;
        let outcome = if outcomes.len() > 1 {
            outcomes.remove(0)
        } else {
            outcomes[0]
        };
        match outcome {
            AdapterOutcome::Success => Ok(Delivery::of_attempt(
                task,
                DeliveryStatus::Success,
                json!({"code": 200}),
            )),
            AdapterOutcome::AttemptFailure => Err(DestinationPublishError::Attempt {
                delivery: Delivery::of_attempt(task, DeliveryStatus::Failed, json!({"code": 503})),
                reason: "destination returned 503".to_string(),
            }),
        }
    }
}

struct PipelineOptions {
    retry_max_limit: u32,
    backoff: Backoff,
    log_batch_size: usize,
    log_batch_delay: Duration,
    retry_visibility_timeout: Duration,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            retry_max_limit: 10,
            backoff: Backoff::Constant {
                interval: Duration::from_millis(50),
            },
            log_batch_size: 1,
            log_batch_delay: Duration::from_secs(3600),
            retry_visibility_timeout: Duration::from_millis(500),
        }
    }
}

struct Pipeline {
    shutdown: broadcast::Sender<()>,
    entity_store: Arc<InMemoryEntityStore>,
    log_store: Arc<InMemoryLogStore>,
    publish_handler: Arc<PublishHandler>,
    delivery_queue: InMemoryQueue,
    retry_queue: Arc<InMemoryDelayQueue>,
}

impl Pipeline {
    async fn start(adapter: Arc<ScriptedAdapter>, options: PipelineOptions) -> Self {
        let entity_store = Arc::new(InMemoryEntityStore::new());
        let log_store = Arc::new(InMemoryLogStore::new());
        let delivery_queue = InMemoryQueue::new();
        let log_queue = InMemoryQueue::new();
        let retry_queue = Arc::new(InMemoryDelayQueue::new(options.retry_visibility_timeout));

        let retry_scheduler = Arc::new(RetryScheduler::new(
            retry_queue.clone(),
            log_store.clone(),
            Arc::new(delivery_queue.publisher()),
            Duration::from_millis(10),
        ));

        let publish_guard: Arc<dyn IdempotentExecutor<PublishError>> =
            Arc::new(Idempotence::new(
                InMemoryGuardStore::new(),
                IdempotenceConfig {
                    timeout: Duration::from_millis(500),
                    successful_ttl: Duration::from_secs(3600),
                },
            ));
        let delivery_guard: Arc<dyn IdempotentExecutor<DeliveryError>> =
            Arc::new(Idempotence::new(
                InMemoryGuardStore::new(),
                IdempotenceConfig {
                    timeout: Duration::from_millis(500),
                    successful_ttl: Duration::from_secs(3600),
                },
            ));

        let publish_handler = Arc::new(PublishHandler::new(
            entity_store.clone(),
            Arc::new(delivery_queue.publisher()),
            publish_guard,
            PublishHandlerConfig {
                topics: vec![],
                fanout_concurrency: 4,
            },
        ));
        let delivery_handler = Arc::new(DeliveryHandler::new(
            entity_store.clone(),
            log_store.clone(),
            adapter.clone(),
            retry_scheduler.clone(),
            options.backoff,
            None,
            delivery_guard,
            Arc::new(log_queue.publisher()),
            DeliveryHandlerConfig {
                retry_max_limit: options.retry_max_limit,
                delivery_timeout: Duration::from_secs(5),
            },
        ));

        let (shutdown, _) = broadcast::channel(1);

        let mut delivery_consumer = Consumer::new(
            Box::new(delivery_queue.subscription()),
            delivery_handler as Arc<dyn QueueMessageHandler>,
            ConsumerConfig {
                name: "delivery-consumer".to_string(),
                concurrency: 4,
                handler_timeout: None,
            },
        );
        let shutdown_for_delivery = shutdown.clone();
        tokio::spawn(async move { delivery_consumer.run(shutdown_for_delivery).await });

        let batcher = LogBatcher::new(
            Box::new(log_queue.subscription()),
            log_store.clone(),
            LogBatcherConfig {
                batch_size: options.log_batch_size,
                batch_delay: options.log_batch_delay,
            },
        );
        let shutdown_for_batcher = shutdown.clone();
        tokio::spawn(async move { batcher.run(shutdown_for_batcher).await });

        let shutdown_for_monitor = shutdown.clone();
        tokio::spawn(async move { retry_scheduler.monitor(shutdown_for_monitor).await });

        Self {
            shutdown,
            entity_store,
            log_store,
            publish_handler,
            delivery_queue,
            retry_queue,
        }
    }

    fn stop(&self) {
        let _ = self.shutdown.send(());
    }

    async fn wait_for_deliveries(&self, expected: usize) -> Vec<Delivery> {
        for _ in 0..300 {
            let deliveries = self.log_store.deliveries().await;
            if deliveries.len() >= expected {
                return deliveries;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!(
            "expected {expected} deliveries, got {actual}",
            actual = self.log_store.deliveries().await.len()
        );
    }
}

fn destination(id: &str) -> Destination {
    Destination {
        id: id.to_string(),
        tenant_id: "t1".to_string(),
        kind: "webhook".to_string(),
        topics: vec!["*".to_string()],
        filter: None,
        config: HashMap::new(),
        credentials: HashMap::new(),
        created_at: Utc::now(),
        disabled_at: None,
    }
}

fn event(id: &str, eligible_for_retry: bool) -> Event {
    Event {
        id: id.to_string(),
        tenant_id: "t1".to_string(),
        topic: "orders.created".to_string(),
        destination_id: None,
        eligible_for_retry,
        time: Some(Utc::now()),
        metadata: HashMap::new(),
        data: json!({"amount": 250}),
        telemetry: None,
    }
}

#[test_log::test(tokio::test)]
async fn test_happy_path_delivers_to_every_matched_destination() {
    let adapter = ScriptedAdapter::new(vec![AdapterOutcome::Success]);
    let pipeline = Pipeline::start(adapter.clone(), PipelineOptions::default()).await;
    pipeline.entity_store.upsert_destination(destination("dst_a")).await;
    pipeline.entity_store.upsert_destination(destination("dst_b")).await;

    let result = pipeline
        .publish_handler
        .handle(event("e1", true))
        .await
        .unwrap();
    assert_eq!(result.matched_count, 2);
    assert_eq!(result.queued_count, 2);

    let deliveries = pipeline.wait_for_deliveries(2).await;
    assert!(deliveries
        .iter()
        .all(|delivery| delivery.status == DeliveryStatus::Success));
    assert_eq!(adapter.calls(), 2);

    let mut destination_ids: Vec<String> = deliveries
        .iter()
        .map(|delivery| delivery.destination_id.clone())
        .collect();
    destination_ids.sort();
    assert_eq!(destination_ids, vec!["dst_a", "dst_b"]);
    pipeline.stop();
}

#[test_log::test(tokio::test)]
async fn test_retries_until_the_destination_recovers() {
    let adapter = ScriptedAdapter::new(vec![
        AdapterOutcome::AttemptFailure,
        AdapterOutcome::AttemptFailure,
        AdapterOutcome::Success,
    ]);
    let pipeline = Pipeline::start(adapter.clone(), PipelineOptions::default()).await;
    pipeline.entity_store.upsert_destination(destination("dst_a")).await;

    pipeline
        .publish_handler
        .handle(event("e2", true))
        .await
        .unwrap();

    let deliveries = pipeline.wait_for_deliveries(3).await;
    assert_eq!(adapter.calls(), 3);
    assert_eq!(adapter.attempts().await, vec![0, 1, 2]);

    let mut statuses: Vec<(u32, DeliveryStatus)> = deliveries
        .iter()
        .map(|delivery| (delivery.attempt_number, delivery.status))
        .collect();
    statuses.sort_by_key(|(attempt, _)| *attempt);
    assert_eq!(
        statuses,
        vec![
            (0, DeliveryStatus::Failed),
            (1, DeliveryStatus::Failed),
            (2, DeliveryStatus::Success),
        ]
    );
    pipeline.stop();
}

#[test_log::test(tokio::test)]
async fn test_retry_cap_bounds_total_adapter_invocations() {
    let adapter = ScriptedAdapter::new(vec![AdapterOutcome::AttemptFailure]);
    let pipeline = Pipeline::start(
        adapter.clone(),
        PipelineOptions {
            retry_max_limit: 2,
            ..PipelineOptions::default()
        },
    )
    .await;
    pipeline.entity_store.upsert_destination(destination("dst_a")).await;

    pipeline
        .publish_handler
        .handle(event("e3", true))
        .await
        .unwrap();

    let deliveries = pipeline.wait_for_deliveries(3).await;
    assert!(deliveries
        .iter()
        .all(|delivery| delivery.status == DeliveryStatus::Failed));

    // No further attempt shows up after the cap.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(adapter.calls(), 3);
    assert!(pipeline.retry_queue.is_empty().await);
    pipeline.stop();
}

#[test_log::test(tokio::test)]
async fn test_ineligible_event_is_never_retried() {
    let adapter = ScriptedAdapter::new(vec![AdapterOutcome::AttemptFailure]);
    let pipeline = Pipeline::start(adapter.clone(), PipelineOptions::default()).await;
    pipeline.entity_store.upsert_destination(destination("dst_a")).await;

    pipeline
        .publish_handler
        .handle(event("e4", false))
        .await
        .unwrap();

    let deliveries = pipeline.wait_for_deliveries(1).await;
    assert_eq!(deliveries[0].status, DeliveryStatus::Failed);

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(adapter.calls(), 1);
    assert!(pipeline.retry_queue.is_empty().await);
    pipeline.stop();
}

#[test_log::test(tokio::test)]
async fn test_disabled_destination_receives_no_adapter_invocations() {
    let adapter = ScriptedAdapter::new(vec![AdapterOutcome::Success]);
    let pipeline = Pipeline::start(adapter.clone(), PipelineOptions::default()).await;
    let mut disabled = destination("dst_a");
    disabled.disabled_at = Some(Utc::now());
    pipeline.entity_store.upsert_destination(disabled).await;

    // The task was enqueued before the destination was disabled.
    let task = DeliveryTask {
        event: event("e5", true),
        destination_id: "dst_a".to_string(),
        attempt: 0,
        manual: false,
        telemetry: None,
    };
    pipeline
        .delivery_queue
        .publisher()
        .publish(serde_json::to_string(&task).unwrap(), None)
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(adapter.calls(), 0);
    assert!(pipeline.log_store.deliveries().await.is_empty());
    pipeline.stop();
}

#[test_log::test(tokio::test)]
async fn test_retry_waits_out_a_slow_log_batcher() {
    let adapter = ScriptedAdapter::new(vec![
        AdapterOutcome::AttemptFailure,
        AdapterOutcome::Success,
    ]);
    // The batcher holds the attempt-0 log entry back long enough for
    // the first retry pop to race it.
    let pipeline = Pipeline::start(
        adapter.clone(),
        PipelineOptions {
            backoff: Backoff::Constant {
                interval: Duration::ZERO,
            },
            log_batch_size: 100,
            log_batch_delay: Duration::from_millis(150),
            retry_visibility_timeout: Duration::from_millis(100),
            ..PipelineOptions::default()
        },
    )
    .await;
    pipeline.entity_store.upsert_destination(destination("dst_a")).await;

    pipeline
        .publish_handler
        .handle(event("e6", true))
        .await
        .unwrap();

    // The first pop finds no persisted event and leaves the retry
    // message in place, a later pop succeeds once the batcher flushes.
    let deliveries = pipeline.wait_for_deliveries(2).await;
    assert_eq!(adapter.calls(), 2);
    assert_eq!(adapter.attempts().await, vec![0, 1]);
    let success_count = deliveries
        .iter()
        .filter(|delivery| delivery.status == DeliveryStatus::Success)
        .count();
    assert_eq!(success_count, 1);

    // No duplicate delivery sneaks in after the race resolves.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(adapter.calls(), 2);
    assert!(pipeline.retry_queue.is_empty().await);
    pipeline.stop();
}
