use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use outpost_helpers::{
    consumers::{Consumer, ConsumerConfig, QueueMessageHandler},
    mqs::{InMemoryQueue, QueuePublisher, Subscription},
    redis::{get_redis_connection, ConnectionWrapper},
};
use tokio::sync::{broadcast, Mutex};
use tracing::info;

use crate::{
    alert::{
        AlertMonitor, AlertMonitorConfig, AlertNotifier, ConsecutiveFailureMonitor,
        FailureCounter, HttpAlertNotifier, InMemoryFailureCounter, RedisFailureCounter,
    },
    config::{MqBackendConfig, RuntimeConfig},
    consts::{deployment_key, RETRY_QUEUE},
    delivery::{DeliveryHandler, DeliveryHandlerConfig},
    errors::{ApplicationStartError, DeliveryError, PublishError},
    idempotency::{
        Idempotence, IdempotenceConfig, IdempotentExecutor, InMemoryGuardStore, RedisGuardStore,
    },
    logbatch::{LogBatcher, LogBatcherConfig},
    migrations::{default_migrations, record_log_retention_ttl, Migrator},
    publish::{PublishHandler, PublishHandlerConfig, PublishMessageHandler},
    retry::{
        rsmq::Rsmq,
        scheduler::{DelayQueue, InMemoryDelayQueue, RetryQueue, RetryScheduler},
    },
    stores::{
        DestinationPublisher, EntityStore, InMemoryEntityStore, InMemoryLogStore, LogStore,
        NoopDestinationPublisher,
    },
    supervisor::{HealthTracker, Supervisor, Worker, WorkerError},
};
use crate::health_api::HealthApiWorker;

/// Alert failure counters expire after a quiet week.
const ALERT_COUNTER_TTL_MS: i64 = 7 * 86_400 * 1_000;

/// The collaborators the pipeline consumes but does not own:
/// the entity store, the log store, and the destination adapters.
pub struct ApplicationDeps {
    pub entity_store: Arc<dyn EntityStore>,
    pub log_store: Arc<dyn LogStore>,
    pub destination_publisher: Arc<dyn DestinationPublisher>,
}

impl ApplicationDeps {
    /// In-memory collaborators for the local platform.
    pub fn in_memory() -> Self {
        Self {
            entity_store: Arc::new(InMemoryEntityStore::new()),
            log_store: Arc::new(InMemoryLogStore::new()),
            destination_publisher: Arc::new(NoopDestinationPublisher::new()),
        }
    }
}

struct PipelineQueues {
    publish_subscription: Box<dyn Subscription>,
    delivery_publisher: Arc<dyn QueuePublisher>,
    delivery_subscription: Box<dyn Subscription>,
    log_publisher: Arc<dyn QueuePublisher>,
    log_subscription: Box<dyn Subscription>,
}

/// Assembles the delivery pipeline from configuration and runs it
/// under the worker supervisor until the shutdown signal fires.
///
/// A single Redis connection is constructed at startup and injected
/// into every collaborator that needs one, there is no process-wide
/// client.
pub struct Application {
    config: RuntimeConfig,
    deps: ApplicationDeps,
}

impl Application {
    pub fn new(config: RuntimeConfig, deps: ApplicationDeps) -> Self {
        Self { config, deps }
    }

    pub async fn run(
        &self,
        shutdown: broadcast::Sender<()>,
    ) -> Result<(), ApplicationStartError> {
        let redis = match &self.config.redis {
            Some(conn_config) => Some(get_redis_connection(conn_config).await?),
            None => {
                info!("no redis nodes configured, running on in-memory primitives");
                None
            }
        };

        if let Some(connection) = &redis {
            let migrator = Migrator::new(connection.clone(), default_migrations());
            let applied = migrator.run().await?;
            if applied > 0 {
                info!(applied, "applied schema migrations");
            }
            if let Some(ttl) = self.config.log_retention_ttl {
                record_log_retention_ttl(
                    &mut connection.clone(),
                    self.config.deployment_id.as_deref(),
                    ttl,
                )
                .await?;
            }
        }

        let queues = self.build_queues().await?;
        let publish_guard = self.publish_guard(&redis);
        let delivery_guard = self.delivery_guard(&redis);
        let retry_queue = self.build_retry_queue(&redis).await?;

        let retry_scheduler = Arc::new(RetryScheduler::new(
            retry_queue,
            self.deps.log_store.clone(),
            queues.delivery_publisher.clone(),
            self.config.scheduler_poll_backoff,
        ));

        let alert_monitor = self.build_alert_monitor(&redis);

        let publish_handler = Arc::new(PublishHandler::new(
            self.deps.entity_store.clone(),
            queues.delivery_publisher.clone(),
            publish_guard,
            PublishHandlerConfig {
                topics: self.config.topics.clone(),
                fanout_concurrency: self.config.publish_max_concurrency,
            },
        ));
        let delivery_handler = Arc::new(DeliveryHandler::new(
            self.deps.entity_store.clone(),
            self.deps.log_store.clone(),
            self.deps.destination_publisher.clone(),
            retry_scheduler.clone(),
            self.config.retry_backoff.clone(),
            Some(alert_monitor as Arc<dyn AlertMonitor>),
            delivery_guard,
            queues.log_publisher.clone(),
            DeliveryHandlerConfig {
                retry_max_limit: self.config.retry_max_limit,
                delivery_timeout: self.config.delivery_timeout,
            },
        ));
        let log_batcher = LogBatcher::new(
            queues.log_subscription,
            self.deps.log_store.clone(),
            LogBatcherConfig {
                batch_size: self.config.log_batch_size,
                batch_delay: self.config.log_batch_threshold,
            },
        );

        let health = HealthTracker::new();
        let mut supervisor = Supervisor::new(health.clone(), self.config.shutdown_timeout);
        supervisor.register(Arc::new(ConsumerWorker::new(
            "publish-consumer",
            Consumer::new(
                queues.publish_subscription,
                Arc::new(PublishMessageHandler::new(publish_handler)),
                ConsumerConfig {
                    name: "publish-consumer".to_string(),
                    concurrency: self.config.publish_max_concurrency,
                    handler_timeout: None,
                },
            ),
        )));
        supervisor.register(Arc::new(ConsumerWorker::new(
            "delivery-consumer",
            Consumer::new(
                queues.delivery_subscription,
                delivery_handler as Arc<dyn QueueMessageHandler>,
                ConsumerConfig {
                    name: "delivery-consumer".to_string(),
                    concurrency: self.config.delivery_max_concurrency,
                    handler_timeout: None,
                },
            ),
        )));
        supervisor.register(Arc::new(LogBatcherWorker {
            batcher: log_batcher,
        }));
        supervisor.register(Arc::new(RetryMonitorWorker {
            scheduler: retry_scheduler,
        }));
        supervisor.register(Arc::new(HealthApiWorker::new(
            health.clone(),
            self.config.health_port,
        )));

        info!("starting delivery pipeline workers");
        supervisor.run(shutdown).await?;
        Ok(())
    }

    fn publish_guard(
        &self,
        redis: &Option<ConnectionWrapper>,
    ) -> Arc<dyn IdempotentExecutor<PublishError>> {
        let config = IdempotenceConfig {
            timeout: Duration::from_secs(5),
            successful_ttl: self.config.publish_idempotency_key_ttl,
        };
        match redis {
            Some(connection) => Arc::new(Idempotence::new(
                RedisGuardStore::new(connection.clone()),
                config,
            )),
            None => Arc::new(Idempotence::new(InMemoryGuardStore::new(), config)),
        }
    }

    fn delivery_guard(
        &self,
        redis: &Option<ConnectionWrapper>,
    ) -> Arc<dyn IdempotentExecutor<DeliveryError>> {
        let config = IdempotenceConfig {
            timeout: Duration::from_secs(5),
            successful_ttl: self.config.delivery_idempotency_key_ttl,
        };
        match redis {
            Some(connection) => Arc::new(Idempotence::new(
                RedisGuardStore::new(connection.clone()),
                config,
            )),
            None => Arc::new(Idempotence::new(InMemoryGuardStore::new(), config)),
        }
    }

    async fn build_retry_queue(
        &self,
        redis: &Option<ConnectionWrapper>,
    ) -> Result<Arc<dyn DelayQueue>, ApplicationStartError> {
        match redis {
            Some(connection) => {
                let namespace = deployment_key(
                    self.config.deployment_id.as_deref(),
                    "outpost:rsmq",
                );
                let retry_queue = RetryQueue::new(
                    Rsmq::new(connection.clone(), namespace),
                    RETRY_QUEUE.to_string(),
                    self.config.retry_visibility_timeout,
                );
                retry_queue.init().await.map_err(|err| {
                    ApplicationStartError::Environment(format!(
                        "failed to initialise the retry queue: {err}"
                    ))
                })?;
                Ok(Arc::new(retry_queue))
            }
            None => Ok(Arc::new(InMemoryDelayQueue::new(
                self.config.retry_visibility_timeout,
            ))),
        }
    }

    fn build_alert_monitor(
        &self,
        redis: &Option<ConnectionWrapper>,
    ) -> Arc<ConsecutiveFailureMonitor> {
        let counter: Arc<dyn FailureCounter> = match redis {
            Some(connection) => Arc::new(RedisFailureCounter::new(
                connection.clone(),
                self.config.deployment_id.clone(),
                ALERT_COUNTER_TTL_MS,
            )),
            None => Arc::new(InMemoryFailureCounter::new()),
        };
        let notifier: Option<Arc<dyn AlertNotifier>> =
            self.config.alert.callback_url.clone().map(|url| {
                Arc::new(HttpAlertNotifier::new(
                    url,
                    self.config.alert.callback_bearer_token.clone(),
                )) as Arc<dyn AlertNotifier>
            });
        Arc::new(ConsecutiveFailureMonitor::new(
            counter,
            notifier,
            self.deps.entity_store.clone(),
            AlertMonitorConfig {
                consecutive_failure_threshold: self.config.alert.consecutive_failure_count,
                auto_disable_destination: self.config.alert.auto_disable_destination,
            },
        ))
    }

    async fn build_queues(&self) -> Result<PipelineQueues, ApplicationStartError> {
        match &self.config.mq_backend {
            MqBackendConfig::InMemory => {
                let publish_queue = InMemoryQueue::new();
                let delivery_queue = InMemoryQueue::new();
                let log_queue = InMemoryQueue::new();
                Ok(PipelineQueues {
                    publish_subscription: Box::new(publish_queue.subscription()),
                    delivery_publisher: Arc::new(delivery_queue.publisher()),
                    delivery_subscription: Box::new(delivery_queue.subscription()),
                    log_publisher: Arc::new(log_queue.publisher()),
                    log_subscription: Box::new(log_queue.subscription()),
                })
            }
            MqBackendConfig::Sqs {
                publish_queue_url,
                delivery_queue_url,
                log_queue_url,
            } => {
                self.build_sqs_queues(publish_queue_url, delivery_queue_url, log_queue_url)
                    .await
            }
            MqBackendConfig::RabbitMq { url } => self.build_rabbitmq_queues(url).await,
        }
    }

    #[cfg(feature = "aws_mqs")]
    async fn build_sqs_queues(
        &self,
        publish_queue_url: &str,
        delivery_queue_url: &str,
        log_queue_url: &str,
    ) -> Result<PipelineQueues, ApplicationStartError> {
        use outpost_mq_sqs::queue::{SqsQueue, SqsQueueConfig};

        let client = Arc::new(outpost_mq_sqs::queue::default_client().await);
        let publish_queue = SqsQueue::new(
            client.clone(),
            SqsQueueConfig::new(publish_queue_url.to_string()),
        );
        let delivery_queue = SqsQueue::new(
            client.clone(),
            SqsQueueConfig::new(delivery_queue_url.to_string()),
        );
        let log_queue = SqsQueue::new(
            client.clone(),
            SqsQueueConfig::new(log_queue_url.to_string()),
        );
        Ok(PipelineQueues {
            publish_subscription: Box::new(publish_queue.subscription()),
            delivery_publisher: Arc::new(delivery_queue.publisher()),
            delivery_subscription: Box::new(delivery_queue.subscription()),
            log_publisher: Arc::new(log_queue.publisher()),
            log_subscription: Box::new(log_queue.subscription()),
        })
    }

    #[cfg(not(feature = "aws_mqs"))]
    async fn build_sqs_queues(
        &self,
        _publish_queue_url: &str,
        _delivery_queue_url: &str,
        _log_queue_url: &str,
    ) -> Result<PipelineQueues, ApplicationStartError> {
        Err(ApplicationStartError::Environment(
            "the sqs backend requires a build with the aws_mqs feature".to_string(),
        ))
    }

    #[cfg(feature = "rabbitmq_mqs")]
    async fn build_rabbitmq_queues(
        &self,
        url: &str,
    ) -> Result<PipelineQueues, ApplicationStartError> {
        use outpost_mq_rabbitmq::queue::{connect, RabbitMqQueue};

        use crate::consts::{DELIVERY_QUEUE, LOG_QUEUE, PUBLISH_QUEUE};

        let connection = connect(url).await.map_err(|err| {
            ApplicationStartError::Environment(format!("failed to connect to rabbitmq: {err}"))
        })?;
        let map_err = |err| {
            ApplicationStartError::Environment(format!("failed to declare rabbitmq queue: {err}"))
        };
        let publish_queue = RabbitMqQueue::declare(&connection, PUBLISH_QUEUE, 1)
            .await
            .map_err(map_err)?;
        let delivery_queue = RabbitMqQueue::declare(&connection, DELIVERY_QUEUE, 1)
            .await
            .map_err(map_err)?;
        let log_queue = RabbitMqQueue::declare(&connection, LOG_QUEUE, 1)
            .await
            .map_err(map_err)?;
        Ok(PipelineQueues {
            publish_subscription: Box::new(publish_queue.subscribe("publish-consumer").await.map_err(map_err)?),
            delivery_publisher: Arc::new(delivery_queue.publisher()),
            delivery_subscription: Box::new(
                delivery_queue.subscribe("delivery-consumer").await.map_err(map_err)?,
            ),
            log_publisher: Arc::new(log_queue.publisher()),
            log_subscription: Box::new(log_queue.subscribe("log-batcher").await.map_err(map_err)?),
        })
    }

    #[cfg(not(feature = "rabbitmq_mqs"))]
    async fn build_rabbitmq_queues(
        &self,
        _url: &str,
    ) -> Result<PipelineQueues, ApplicationStartError> {
        Err(ApplicationStartError::Environment(
            "the rabbitmq backend requires a build with the rabbitmq_mqs feature".to_string(),
        ))
    }
}

/// Runs a queue consumer as a supervised worker.
struct ConsumerWorker {
    name: String,
    consumer: Mutex<Consumer>,
}

impl ConsumerWorker {
    fn new(name: &str, consumer: Consumer) -> Self {
        Self {
            name: name.to_string(),
            consumer: Mutex::new(consumer),
        }
    }
}

#[async_trait]
impl Worker for ConsumerWorker {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, shutdown: broadcast::Sender<()>) -> Result<(), WorkerError> {
        let mut consumer = self.consumer.lock().await;
        consumer
            .run(shutdown)
            .await
            .map_err(|err| WorkerError::failed(err.to_string()))
    }
}

/// Runs the log batcher as a supervised worker.
struct LogBatcherWorker {
    batcher: LogBatcher,
}

#[async_trait]
impl Worker for LogBatcherWorker {
    fn name(&self) -> &str {
        "log-batcher"
    }

    async fn run(&self, shutdown: broadcast::Sender<()>) -> Result<(), WorkerError> {
        self.batcher
            .run(shutdown)
            .await
            .map_err(|err| WorkerError::failed(err.to_string()))
    }
}

/// Runs the retry monitor as a supervised worker.
struct RetryMonitorWorker {
    scheduler: Arc<RetryScheduler>,
}

#[async_trait]
impl Worker for RetryMonitorWorker {
    fn name(&self) -> &str {
        "retry-monitor"
    }

    async fn run(&self, shutdown: broadcast::Sender<()>) -> Result<(), WorkerError> {
        self.scheduler
            .monitor(shutdown)
            .await
            .map_err(|err| WorkerError::failed(err.to_string()))
    }
}
