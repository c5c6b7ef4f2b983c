use std::{
    collections::{HashMap, VecDeque},
    sync::Arc,
};

use async_trait::async_trait;
use aws_sdk_sqs::{
    types::{Message, MessageAttributeValue, MessageSystemAttributeName},
    Client,
};
use outpost_helpers::mqs::{
    Acknowledger, QueueError, QueueMessage, QueuePublisher, Subscription,
};
use tracing::warn;

/// Configuration for one SQS-backed logical queue.
#[derive(Debug, Clone)]
pub struct SqsQueueConfig {
    /// The URL of the SQS queue.
    pub queue_url: String,
    /// The long-poll wait per receive call.
    ///
    /// Defaults to 20 seconds, the SQS maximum.
    pub wait_time_seconds: i32,
    /// The visibility timeout set on received messages. A nack resets
    /// it to zero so the message is redelivered promptly.
    ///
    /// Defaults to 30 seconds.
    pub visibility_timeout: i32,
    /// The maximum number of messages to receive in a single call.
    /// SQS only allows a maximum of 10 messages per call.
    ///
    /// Defaults to 10 messages.
    pub batch_size: i32,
}

impl SqsQueueConfig {
    pub fn new(queue_url: String) -> Self {
        Self {
            queue_url,
            wait_time_seconds: 20,
            visibility_timeout: 30,
            batch_size: 10,
        }
    }
}

/// Creates an SQS client from the default AWS environment
/// configuration.
pub async fn default_client() -> Client {
    let config = aws_config::defaults(aws_config::BehaviorVersion::latest())
        .load()
        .await;
    Client::new(&config)
}

/// An SQS-backed queue. Ack deletes the message, nack resets its
/// visibility timeout to zero for prompt redelivery.
pub struct SqsQueue {
    client: Arc<Client>,
    config: Arc<SqsQueueConfig>,
}

impl SqsQueue {
    pub fn new(client: Arc<Client>, config: SqsQueueConfig) -> Self {
        Self {
            client,
            config: Arc::new(config),
        }
    }

    pub fn publisher(&self) -> SqsQueuePublisher {
        SqsQueuePublisher {
            client: self.client.clone(),
            config: self.config.clone(),
        }
    }

    pub fn subscription(&self) -> SqsSubscription {
        SqsSubscription {
            client: self.client.clone(),
            config: self.config.clone(),
            buffer: VecDeque::new(),
        }
    }
}

#[derive(Clone)]
pub struct SqsQueuePublisher {
    client: Arc<Client>,
    config: Arc<SqsQueueConfig>,
}

#[async_trait]
impl QueuePublisher for SqsQueuePublisher {
    async fn publish(
        &self,
        body: String,
        attributes: Option<HashMap<String, String>>,
    ) -> Result<(), QueueError> {
        let mut request = self
            .client
            .send_message()
            .queue_url(&self.config.queue_url)
            .message_body(body);
        for (name, value) in attributes.unwrap_or_default() {
            let attribute = MessageAttributeValue::builder()
                .data_type("String")
                .string_value(value)
                .build()
                .map_err(|err| QueueError::Publish(err.to_string()))?;
            request = request.message_attributes(name, attribute);
        }
        request
            .send()
            .await
            .map_err(|err| QueueError::Publish(err.to_string()))?;
        Ok(())
    }
}

/// A subscription over one SQS queue.
///
/// Messages are fetched in batches and buffered locally, the receive
/// future is safe to drop between polls: an unbuffered message simply
/// becomes visible again after its visibility timeout.
pub struct SqsSubscription {
    client: Arc<Client>,
    config: Arc<SqsQueueConfig>,
    buffer: VecDeque<QueueMessage>,
}

#[async_trait]
impl Subscription for SqsSubscription {
    async fn receive(&mut self) -> Result<QueueMessage, QueueError> {
        loop {
            if let Some(message) = self.buffer.pop_front() {
                return Ok(message);
            }

            let output = self
                .client
                .receive_message()
                .queue_url(&self.config.queue_url)
                .wait_time_seconds(self.config.wait_time_seconds)
                .max_number_of_messages(self.config.batch_size)
                .visibility_timeout(self.config.visibility_timeout)
                .message_attribute_names("All")
                .message_system_attribute_names(
                    MessageSystemAttributeName::ApproximateReceiveCount,
                )
                .send()
                .await
                .map_err(|err| QueueError::Receive(err.to_string()))?;

            for message in output.messages.unwrap_or_default() {
                match self.to_queue_message(message) {
                    Some(message) => self.buffer.push_back(message),
                    None => warn!("skipping SQS message without a body or receipt handle"),
                }
            }
            // An empty long poll just loops into the next one.
        }
    }
}

impl SqsSubscription {
    fn to_queue_message(&self, message: Message) -> Option<QueueMessage> {
        let receipt_handle = message.receipt_handle?;
        let body = message.body?;
        let message_id = message.message_id.unwrap_or_default();
        let delivery_count = message
            .attributes
            .as_ref()
            .and_then(|attributes| {
                attributes.get(&MessageSystemAttributeName::ApproximateReceiveCount)
            })
            .and_then(|count| count.parse().ok())
            .unwrap_or(0);
        let attributes = message_attribute_strings(message.message_attributes);

        let acknowledger = Arc::new(SqsAcknowledger {
            client: self.client.clone(),
            queue_url: self.config.queue_url.clone(),
            receipt_handle,
        });
        Some(QueueMessage::new(
            message_id,
            body,
            delivery_count,
            attributes,
            acknowledger,
        ))
    }
}

fn message_attribute_strings(
    attributes: Option<HashMap<String, MessageAttributeValue>>,
) -> HashMap<String, String> {
    attributes
        .unwrap_or_default()
        .into_iter()
        .filter_map(|(name, attribute)| {
            attribute.string_value.map(|value| (name, value))
        })
        .collect()
}

struct SqsAcknowledger {
    client: Arc<Client>,
    queue_url: String,
    receipt_handle: String,
}

#[async_trait]
impl Acknowledger for SqsAcknowledger {
    async fn ack(&self) -> Result<(), QueueError> {
        self.client
            .delete_message()
            .queue_url(&self.queue_url)
            .receipt_handle(&self.receipt_handle)
            .send()
            .await
            .map_err(|err| QueueError::Acknowledge(err.to_string()))?;
        Ok(())
    }

    async fn nack(&self) -> Result<(), QueueError> {
        self.client
            .change_message_visibility()
            .queue_url(&self.queue_url)
            .receipt_handle(&self.receipt_handle)
            .visibility_timeout(0)
            .send()
            .await
            .map_err(|err| QueueError::Acknowledge(err.to_string()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_config_defaults_follow_sqs_limits() {
        let config = SqsQueueConfig::new("https://sqs.local/queue".to_string());
        assert_eq!(config.wait_time_seconds, 20);
        assert_eq!(config.batch_size, 10);
        assert_eq!(config.visibility_timeout, 30);
    }

    #[test]
    fn test_extracts_string_message_attributes() {
        let mut attributes = HashMap::new();
        attributes.insert(
            "outpost.context-id".to_string(),
            MessageAttributeValue::builder()
                .data_type("String")
                .string_value("context-1234")
                .build()
                .unwrap(),
        );
        attributes.insert(
            "binary-attribute".to_string(),
            MessageAttributeValue::builder()
                .data_type("Binary")
                .binary_value(aws_sdk_sqs::primitives::Blob::new(vec![1, 2, 3]))
                .build()
                .unwrap(),
        );

        let strings = message_attribute_strings(Some(attributes));
        assert_eq!(strings.len(), 1);
        assert_eq!(
            strings.get("outpost.context-id"),
            Some(&"context-1234".to_string())
        );
    }
}
