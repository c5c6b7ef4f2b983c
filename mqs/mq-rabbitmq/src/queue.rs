use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use futures::StreamExt;
use lapin::{
    acker::Acker,
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions,
        BasicQosOptions, QueueDeclareOptions,
    },
    types::{AMQPValue, FieldTable, ShortString},
    BasicProperties, Connection, ConnectionProperties, Consumer,
};
use outpost_helpers::mqs::{
    Acknowledger, QueueError, QueueMessage, QueuePublisher, Subscription,
};

/// Persistent delivery mode for published messages.
const DELIVERY_MODE_PERSISTENT: u8 = 2;

/// Opens a RabbitMQ connection.
pub async fn connect(url: &str) -> Result<Connection, QueueError> {
    Connection::connect(url, ConnectionProperties::default())
        .await
        .map_err(|err| QueueError::Receive(err.to_string()))
}

/// A RabbitMQ-backed queue over one channel. Ack is a basic ack,
/// nack requeues the message for redelivery.
pub struct RabbitMqQueue {
    channel: lapin::Channel,
    queue: String,
}

impl RabbitMqQueue {
    /// Declares the durable queue and applies the prefetch bound on a
    /// fresh channel.
    pub async fn declare(
        connection: &Connection,
        queue: &str,
        prefetch_count: u16,
    ) -> Result<Self, QueueError> {
        let channel = connection
            .create_channel()
            .await
            .map_err(|err| QueueError::Receive(err.to_string()))?;
        channel
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    durable: true,
                    ..QueueDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|err| QueueError::Receive(err.to_string()))?;
        channel
            .basic_qos(prefetch_count, BasicQosOptions::default())
            .await
            .map_err(|err| QueueError::Receive(err.to_string()))?;
        Ok(Self {
            channel,
            queue: queue.to_string(),
        })
    }

    pub fn publisher(&self) -> RabbitMqQueuePublisher {
        RabbitMqQueuePublisher {
            channel: self.channel.clone(),
            queue: self.queue.clone(),
        }
    }

    pub async fn subscribe(&self, consumer_tag: &str) -> Result<RabbitMqSubscription, QueueError> {
        let consumer = self
            .channel
            .basic_consume(
                &self.queue,
                consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|err| QueueError::Receive(err.to_string()))?;
        Ok(RabbitMqSubscription { consumer })
    }
}

#[derive(Clone)]
pub struct RabbitMqQueuePublisher {
    channel: lapin::Channel,
    queue: String,
}

#[async_trait]
impl QueuePublisher for RabbitMqQueuePublisher {
    async fn publish(
        &self,
        body: String,
        attributes: Option<HashMap<String, String>>,
    ) -> Result<(), QueueError> {
        let mut properties =
            BasicProperties::default().with_delivery_mode(DELIVERY_MODE_PERSISTENT);
        if let Some(attributes) = attributes {
            properties = properties.with_headers(attributes_to_headers(&attributes));
        }

        let confirm = self
            .channel
            .basic_publish(
                "",
                &self.queue,
                BasicPublishOptions::default(),
                body.as_bytes(),
                properties,
            )
            .await
            .map_err(|err| QueueError::Publish(err.to_string()))?;
        confirm
            .await
            .map_err(|err| QueueError::Publish(err.to_string()))?;
        Ok(())
    }
}

pub struct RabbitMqSubscription {
    consumer: Consumer,
}

#[async_trait]
impl Subscription for RabbitMqSubscription {
    async fn receive(&mut self) -> Result<QueueMessage, QueueError> {
        match self.consumer.next().await {
            Some(Ok(delivery)) => {
                let attributes = headers_to_attributes(delivery.properties.headers());
                let body = String::from_utf8_lossy(&delivery.data).to_string();
                // The broker redelivery flag is binary, RabbitMQ does
                // not count deliveries.
                let delivery_count = if delivery.redelivered { 2 } else { 1 };
                let acknowledger = Arc::new(RabbitMqAcknowledger {
                    acker: delivery.acker,
                });
                Ok(QueueMessage::new(
                    delivery.delivery_tag.to_string(),
                    body,
                    delivery_count,
                    attributes,
                    acknowledger,
                ))
            }
            Some(Err(err)) => Err(QueueError::Receive(err.to_string())),
            None => Err(QueueError::Closed),
        }
    }
}

struct RabbitMqAcknowledger {
    acker: Acker,
}

#[async_trait]
impl Acknowledger for RabbitMqAcknowledger {
    async fn ack(&self) -> Result<(), QueueError> {
        self.acker
            .ack(BasicAckOptions::default())
            .await
            .map_err(|err| QueueError::Acknowledge(err.to_string()))
    }

    async fn nack(&self) -> Result<(), QueueError> {
        self.acker
            .nack(BasicNackOptions {
                requeue: true,
                ..BasicNackOptions::default()
            })
            .await
            .map_err(|err| QueueError::Acknowledge(err.to_string()))
    }
}

fn attributes_to_headers(attributes: &HashMap<String, String>) -> FieldTable {
    let mut headers = FieldTable::default();
    for (name, value) in attributes {
        headers.insert(
            ShortString::from(name.clone()),
            AMQPValue::LongString(value.clone().into()),
        );
    }
    headers
}

fn headers_to_attributes(headers: &Option<FieldTable>) -> HashMap<String, String> {
    let Some(headers) = headers else {
        return HashMap::new();
    };
    headers
        .inner()
        .iter()
        .filter_map(|(name, value)| match value {
            AMQPValue::LongString(value) => Some((
                name.as_str().to_string(),
                String::from_utf8_lossy(value.as_bytes()).to_string(),
            )),
            _ => None,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_attributes_round_trip_through_amqp_headers() {
        let mut attributes = HashMap::new();
        attributes.insert(
            "outpost.context-id".to_string(),
            "context-1234".to_string(),
        );
        attributes.insert("traceparent".to_string(), "00-abc-def-01".to_string());

        let headers = attributes_to_headers(&attributes);
        let extracted = headers_to_attributes(&Some(headers));

        assert_eq!(extracted, attributes);
    }

    #[test]
    fn test_non_string_headers_are_ignored() {
        let mut headers = FieldTable::default();
        headers.insert(
            ShortString::from("retry-count"),
            AMQPValue::LongInt(42),
        );

        let extracted = headers_to_attributes(&Some(headers));
        assert!(extracted.is_empty());
    }
}
