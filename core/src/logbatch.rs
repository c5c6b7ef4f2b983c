use std::{sync::Arc, time::Duration};

use outpost_helpers::{
    consumers::ConsumerError,
    mqs::{QueueMessage, Subscription},
};
use tokio::{
    sync::{broadcast, Mutex},
    time::{sleep_until, Instant},
};
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::{models::LogEntry, stores::LogStore};

/// Configuration for the log batcher.
#[derive(Debug, Clone)]
pub struct LogBatcherConfig {
    /// Flush once this many entries have accumulated.
    pub batch_size: usize,
    /// Flush once the oldest buffered entry has waited this long.
    pub batch_delay: Duration,
}

/// Consumes the log queue and writes `(event, delivery)` pairs to the
/// log store in batches.
///
/// A batch is all-or-nothing against the store: on success every
/// batched message is acked, on failure every one is nacked. Messages
/// that fail structural validation are nacked individually and never
/// enter the batch.
pub struct LogBatcher {
    subscription: Mutex<Box<dyn Subscription>>,
    log_store: Arc<dyn LogStore>,
    config: LogBatcherConfig,
}

impl LogBatcher {
    pub fn new(
        subscription: Box<dyn Subscription>,
        log_store: Arc<dyn LogStore>,
        config: LogBatcherConfig,
    ) -> Self {
        Self {
            subscription: Mutex::new(subscription),
            log_store,
            config,
        }
    }

    pub async fn run(&self, shutdown: broadcast::Sender<()>) -> Result<(), ConsumerError> {
        let mut subscription = self.subscription.lock().await;
        let mut shutdown_rx = shutdown.subscribe();
        let mut batch: Vec<(QueueMessage, LogEntry)> = Vec::new();
        let mut deadline: Option<Instant> = None;

        let span = info_span!("log_batcher");
        async {
            let result = loop {
                // With an empty batch there is no deadline to race, park
                // the timer branch far in the future.
                let flush_at =
                    deadline.unwrap_or_else(|| Instant::now() + Duration::from_secs(3600));

                tokio::select! {
                    _ = shutdown_rx.recv() => {
                        info!("received shutdown signal, stopping log batcher");
                        break Ok(());
                    }
                    _ = sleep_until(flush_at), if deadline.is_some() => {
                        self.flush(&mut batch).await;
                        deadline = None;
                    }
                    received = subscription.receive() => match received {
                        Ok(message) => {
                            let entry: LogEntry = match serde_json::from_str(&message.body) {
                                Ok(entry) => entry,
                                Err(err) => {
                                    // A half-entry or garbage payload is
                                    // rejected on its own, it must not
                                    // hold the batch hostage.
                                    warn!(
                                        message_id = %message.message_id,
                                        "rejecting invalid log entry: {err}"
                                    );
                                    if let Err(nack_err) = message.nack().await {
                                        warn!("failed to nack invalid log entry: {nack_err}");
                                    }
                                    continue;
                                }
                            };
                            if batch.is_empty() {
                                deadline = Some(Instant::now() + self.config.batch_delay);
                            }
                            batch.push((message, entry));
                            if batch.len() >= self.config.batch_size {
                                self.flush(&mut batch).await;
                                deadline = None;
                            }
                        }
                        Err(err) => {
                            error!("log subscription failed, stopping log batcher: {err}");
                            break Err(ConsumerError::Subscription(err));
                        }
                    }
                }
            };

            // Whatever is buffered gets one final write before exit.
            self.flush(&mut batch).await;
            result
        }
        .instrument(span)
        .await
    }

    async fn flush(&self, batch: &mut Vec<(QueueMessage, LogEntry)>) {
        if batch.is_empty() {
            return;
        }
        let pairs = std::mem::take(batch);
        let entries: Vec<LogEntry> = pairs.iter().map(|(_, entry)| entry.clone()).collect();
        debug!(batch_len = entries.len(), "flushing log batch");

        match self.log_store.insert_many(entries).await {
            Ok(()) => {
                for (message, _) in &pairs {
                    if let Err(err) = message.ack().await {
                        warn!(
                            message_id = %message.message_id,
                            "failed to ack log entry: {err}"
                        );
                    }
                }
            }
            Err(err) => {
                error!("failed to persist log batch: {err}");
                for (message, _) in &pairs {
                    if let Err(nack_err) = message.nack().await {
                        warn!(
                            message_id = %message.message_id,
                            "failed to nack log entry: {nack_err}"
                        );
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use chrono::Utc;
    use outpost_helpers::mqs::{InMemoryQueue, QueuePublisher};
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;
    use crate::{
        errors::LogStoreError,
        models::{Delivery, DeliveryStatus, DeliveryTask, Event},
        stores::InMemoryLogStore,
    };

    fn entry(event_id: &str) -> LogEntry {
        let event = Event {
            id: event_id.to_string(),
            tenant_id: "t1".to_string(),
            topic: "orders.created".to_string(),
            destination_id: None,
            eligible_for_retry: true,
            time: Some(Utc::now()),
            metadata: Default::default(),
            data: json!({}),
            telemetry: None,
        };
        let task = DeliveryTask {
            event: event.clone(),
            destination_id: "dst_1".to_string(),
            attempt: 0,
            manual: false,
            telemetry: None,
        };
        LogEntry {
            event,
            delivery: Delivery::of_attempt(&task, DeliveryStatus::Success, json!({})),
        }
    }

    async fn publish_entry(queue: &InMemoryQueue, entry: &LogEntry) {
        queue
            .publisher()
            .publish(serde_json::to_string(entry).unwrap(), None)
            .await
            .unwrap();
    }

    fn start_batcher(
        queue: &InMemoryQueue,
        log_store: Arc<dyn LogStore>,
        config: LogBatcherConfig,
    ) -> broadcast::Sender<()> {
        let (shutdown, _) = broadcast::channel(1);
        let batcher = LogBatcher::new(Box::new(queue.subscription()), log_store, config);
        let shutdown_for_batcher = shutdown.clone();
        tokio::spawn(async move { batcher.run(shutdown_for_batcher).await });
        shutdown
    }

    #[test_log::test(tokio::test)]
    async fn test_flushes_when_the_batch_size_is_reached() {
        let queue = InMemoryQueue::new();
        let log_store = Arc::new(InMemoryLogStore::new());
        let shutdown = start_batcher(
            &queue,
            log_store.clone(),
            LogBatcherConfig {
                batch_size: 2,
                batch_delay: Duration::from_secs(3600),
            },
        );

        publish_entry(&queue, &entry("evt_1")).await;
        publish_entry(&queue, &entry("evt_2")).await;

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(log_store.deliveries().await.len(), 2);
        let _ = shutdown.send(());
    }

    #[test_log::test(tokio::test)]
    async fn test_flushes_when_the_delay_threshold_elapses() {
        let queue = InMemoryQueue::new();
        let log_store = Arc::new(InMemoryLogStore::new());
        let shutdown = start_batcher(
            &queue,
            log_store.clone(),
            LogBatcherConfig {
                batch_size: 100,
                batch_delay: Duration::from_millis(40),
            },
        );

        publish_entry(&queue, &entry("evt_1")).await;

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(log_store.deliveries().await.is_empty());
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(log_store.deliveries().await.len(), 1);
        let _ = shutdown.send(());
    }

    #[test_log::test(tokio::test)]
    async fn test_invalid_entries_are_rejected_without_blocking_the_batch() {
        // Keep rejected messages away for the duration of the test.
        let queue = InMemoryQueue::with_redelivery_delay(Duration::from_secs(60));
        let log_store = Arc::new(InMemoryLogStore::new());
        let shutdown = start_batcher(
            &queue,
            log_store.clone(),
            LogBatcherConfig {
                batch_size: 2,
                batch_delay: Duration::from_secs(3600),
            },
        );

        queue
            .publisher()
            .publish(json!({"Event": null, "Delivery": null}).to_string(), None)
            .await
            .unwrap();
        publish_entry(&queue, &entry("evt_1")).await;
        publish_entry(&queue, &entry("evt_2")).await;

        tokio::time::sleep(Duration::from_millis(50)).await;
        let deliveries = log_store.deliveries().await;
        assert_eq!(deliveries.len(), 2);
        let _ = shutdown.send(());
    }

    struct FlakyLogStore {
        inner: InMemoryLogStore,
        failures_left: AtomicUsize,
        insert_calls: AtomicUsize,
    }

    #[async_trait]
    impl LogStore for FlakyLogStore {
        async fn retrieve_event(
            &self,
            tenant_id: &str,
            event_id: &str,
        ) -> Result<Option<Event>, LogStoreError> {
            self.inner.retrieve_event(tenant_id, event_id).await
        }

        async fn insert_many(&self, entries: Vec<LogEntry>) -> Result<(), LogStoreError> {
            self.insert_calls.fetch_add(1, Ordering::SeqCst);
            if self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| {
                    left.checked_sub(1)
                })
                .is_ok()
            {
                return Err(LogStoreError::Internal("log store unavailable".into()));
            }
            self.inner.insert_many(entries).await
        }
    }

    #[test_log::test(tokio::test)]
    async fn test_store_failure_nacks_the_whole_batch_for_redelivery() {
        let queue = InMemoryQueue::new();
        let log_store = Arc::new(FlakyLogStore {
            inner: InMemoryLogStore::new(),
            failures_left: AtomicUsize::new(1),
            insert_calls: AtomicUsize::new(0),
        });
        let shutdown = start_batcher(
            &queue,
            log_store.clone(),
            LogBatcherConfig {
                batch_size: 2,
                batch_delay: Duration::from_secs(3600),
            },
        );

        publish_entry(&queue, &entry("evt_1")).await;
        publish_entry(&queue, &entry("evt_2")).await;

        // First insert fails and nacks, the redelivered batch succeeds.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(log_store.insert_calls.load(Ordering::SeqCst) >= 2);
        assert_eq!(log_store.inner.deliveries().await.len(), 2);
        let _ = shutdown.send(());
    }
}
