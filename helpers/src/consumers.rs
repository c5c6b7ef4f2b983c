use std::{
    error::Error,
    fmt::{self, Debug},
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use tokio::{
    sync::{broadcast, Semaphore},
    time::{error::Elapsed, timeout},
};
use tracing::{debug, error, info, info_span, Instrument};

use crate::mqs::{QueueError, QueueMessage, Subscription};

/// Provides a custom error type to be used for failures
/// within message handlers.
#[derive(Debug)]
pub enum MessageHandlerError {
    Timeout(Elapsed),
    HandlerFailure(Box<dyn Error + Send + Sync + 'static>),
}

impl fmt::Display for MessageHandlerError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            MessageHandlerError::Timeout(elapsed_error) => {
                write!(f, "message handler failed: timeout {elapsed_error}")
            }
            MessageHandlerError::HandlerFailure(handler_error) => {
                write!(f, "message handler failed: {handler_error}")
            }
        }
    }
}

impl Error for MessageHandlerError {}

/// Provides a trait for a message handler that processes messages
/// received from a queue subscription.
///
/// The handler signals disposition through the message itself,
/// it must call exactly one of `ack` or `nack` before returning.
/// The returned result is used for logging and metrics only.
#[async_trait]
pub trait QueueMessageHandler: Send + Sync {
    async fn handle(&self, message: QueueMessage) -> Result<(), MessageHandlerError>;
}

impl Debug for dyn QueueMessageHandler + Send + Sync {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "QueueMessageHandler")
    }
}

/// Provides a custom error type to be used for failures
/// in running a consumer.
#[derive(Debug)]
pub enum ConsumerError {
    Subscription(QueueError),
    RuntimeFailure(String),
}

impl fmt::Display for ConsumerError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ConsumerError::Subscription(queue_error) => {
                write!(f, "consumer failed: subscription error: {queue_error}")
            }
            ConsumerError::RuntimeFailure(reason) => {
                write!(f, "consumer failed: {reason}")
            }
        }
    }
}

impl Error for ConsumerError {}

/// Configuration for a queue consumer.
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    /// The name of the consumer, used in spans and log output.
    pub name: String,
    /// The maximum number of messages processed concurrently.
    /// No new message is received from the subscription until
    /// a slot frees up, implicitly backpressuring the broker.
    pub concurrency: usize,
    /// The maximum time to wait for the message handler to complete
    /// for a single message.
    pub handler_timeout: Option<Duration>,
}

/// Binds a queue subscription to a message handler and bounds
/// concurrency to a fixed number of in-flight handlers via a
/// counting semaphore.
///
/// There is no ordering across messages, handlers are spawned in
/// receive order but complete arbitrarily.
pub struct Consumer {
    subscription: Box<dyn Subscription>,
    handler: Arc<dyn QueueMessageHandler>,
    config: ConsumerConfig,
}

impl Debug for Consumer {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "Consumer({name})", name = self.config.name)
    }
}

impl Consumer {
    pub fn new(
        subscription: Box<dyn Subscription>,
        handler: Arc<dyn QueueMessageHandler>,
        config: ConsumerConfig,
    ) -> Self {
        Self {
            subscription,
            handler,
            config,
        }
    }

    /// Runs the receive loop until the shutdown signal fires or the
    /// subscription fails.
    ///
    /// A semaphore slot is acquired before each receive, on shutdown or
    /// subscription error the loop stops receiving and drains in-flight
    /// handlers before returning.
    pub async fn run(&mut self, shutdown: broadcast::Sender<()>) -> Result<(), ConsumerError> {
        let concurrency = self.config.concurrency.max(1);
        let semaphore = Arc::new(Semaphore::new(concurrency));
        let mut shutdown_rx = shutdown.subscribe();

        let span = info_span!("consumer", name = %self.config.name);
        async {
            let result = loop {
                let permit = tokio::select! {
                    _ = shutdown_rx.recv() => {
                        info!("received shutdown signal, stopping consumer");
                        break Ok(());
                    }
                    permit = semaphore.clone().acquire_owned() => match permit {
                        Ok(permit) => permit,
                        Err(_) => {
                            break Err(ConsumerError::RuntimeFailure(
                                "consumer semaphore closed unexpectedly".to_string(),
                            ))
                        }
                    },
                };

                let message = tokio::select! {
                    _ = shutdown_rx.recv() => {
                        info!("received shutdown signal, stopping consumer");
                        drop(permit);
                        break Ok(());
                    }
                    received = self.subscription.receive() => match received {
                        Ok(message) => message,
                        Err(err) => {
                            error!("subscription failed, stopping consumer: {err}");
                            drop(permit);
                            break Err(ConsumerError::Subscription(err));
                        }
                    },
                };

                let handler = self.handler.clone();
                let handler_timeout = self.config.handler_timeout;
                let message_span = info_span!(
                    "consumer_message",
                    consumer = %self.config.name,
                    message_id = %message.message_id,
                );
                tokio::spawn(
                    async move {
                        let result = match handler_timeout {
                            Some(duration) => match timeout(duration, handler.handle(message)).await
                            {
                                Ok(result) => result,
                                Err(elapsed) => Err(MessageHandlerError::Timeout(elapsed)),
                            },
                            None => handler.handle(message).await,
                        };
                        if let Err(err) = result {
                            error!("{err}");
                        }
                        drop(permit);
                    }
                    .instrument(message_span),
                );
            };

            debug!("draining in-flight message handlers");
            let _drained = semaphore.acquire_many(concurrency as u32).await;
            result
        }
        .instrument(span)
        .await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use pretty_assertions::assert_eq;
    use tokio::sync::Mutex;

    use super::*;
    use crate::mqs::{InMemoryQueue, QueuePublisher};

    struct TrackingHandler {
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
        handled: AtomicUsize,
        work_duration: Duration,
    }

    impl TrackingHandler {
        fn new(work_duration: Duration) -> Self {
            Self {
                in_flight: AtomicUsize::new(0),
                max_in_flight: AtomicUsize::new(0),
                handled: AtomicUsize::new(0),
                work_duration,
            }
        }
    }

    #[async_trait]
    impl QueueMessageHandler for TrackingHandler {
        async fn handle(&self, message: QueueMessage) -> Result<(), MessageHandlerError> {
            let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(current, Ordering::SeqCst);
            tokio::time::sleep(self.work_duration).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            self.handled.fetch_add(1, Ordering::SeqCst);
            message
                .ack()
                .await
                .map_err(|err| MessageHandlerError::HandlerFailure(Box::new(err)))
        }
    }

    struct FailingSubscription {
        messages: Mutex<Vec<QueueMessage>>,
    }

    #[async_trait]
    impl Subscription for FailingSubscription {
        async fn receive(&mut self) -> Result<QueueMessage, QueueError> {
            let mut messages = self.messages.lock().await;
            match messages.pop() {
                Some(message) => Ok(message),
                None => Err(QueueError::Receive("connection reset".to_string())),
            }
        }
    }

    #[test_log::test(tokio::test)]
    async fn test_bounds_concurrency_and_processes_all_messages() {
        let queue = InMemoryQueue::new();
        let publisher = queue.publisher();
        for i in 0..6 {
            publisher.publish(format!("message-{i}"), None).await.unwrap();
        }

        let handler = Arc::new(TrackingHandler::new(Duration::from_millis(30)));
        let mut consumer = Consumer::new(
            Box::new(queue.subscription()),
            handler.clone(),
            ConsumerConfig {
                name: "test-consumer".to_string(),
                concurrency: 2,
                handler_timeout: None,
            },
        );

        let (shutdown, _) = broadcast::channel(1);
        let shutdown_for_consumer = shutdown.clone();
        let run_handle =
            tokio::spawn(async move { consumer.run(shutdown_for_consumer).await });

        while handler.handled.load(Ordering::SeqCst) < 6 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        shutdown.send(()).unwrap();
        run_handle.await.unwrap().unwrap();

        assert_eq!(handler.handled.load(Ordering::SeqCst), 6);
        assert!(handler.max_in_flight.load(Ordering::SeqCst) <= 2);
    }

    #[test_log::test(tokio::test)]
    async fn test_drains_in_flight_handlers_on_shutdown() {
        let queue = InMemoryQueue::new();
        let publisher = queue.publisher();
        for i in 0..2 {
            publisher.publish(format!("message-{i}"), None).await.unwrap();
        }

        let handler = Arc::new(TrackingHandler::new(Duration::from_millis(100)));
        let mut consumer = Consumer::new(
            Box::new(queue.subscription()),
            handler.clone(),
            ConsumerConfig {
                name: "test-consumer".to_string(),
                concurrency: 2,
                handler_timeout: None,
            },
        );

        let (shutdown, _) = broadcast::channel(1);
        let shutdown_for_consumer = shutdown.clone();
        let run_handle =
            tokio::spawn(async move { consumer.run(shutdown_for_consumer).await });

        // Let both handlers start before signalling shutdown.
        while handler.in_flight.load(Ordering::SeqCst) < 2 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        shutdown.send(()).unwrap();
        run_handle.await.unwrap().unwrap();

        assert_eq!(handler.handled.load(Ordering::SeqCst), 2);
        assert_eq!(handler.in_flight.load(Ordering::SeqCst), 0);
    }

    #[test_log::test(tokio::test)]
    async fn test_returns_subscription_error_after_draining() {
        let queue = InMemoryQueue::new();
        let publisher = queue.publisher();
        publisher.publish("only".to_string(), None).await.unwrap();
        let mut seed_subscription = queue.subscription();
        let seeded = seed_subscription.receive().await.unwrap();

        let handler = Arc::new(TrackingHandler::new(Duration::from_millis(20)));
        let mut consumer = Consumer::new(
            Box::new(FailingSubscription {
                messages: Mutex::new(vec![seeded]),
            }),
            handler.clone(),
            ConsumerConfig {
                name: "test-consumer".to_string(),
                concurrency: 4,
                handler_timeout: None,
            },
        );

        let (shutdown, _) = broadcast::channel(1);
        let result = consumer.run(shutdown).await;

        assert!(matches!(
            result,
            Err(ConsumerError::Subscription(QueueError::Receive(_)))
        ));
        // The message received before the failure is still processed.
        assert_eq!(handler.handled.load(Ordering::SeqCst), 1);
    }
}
