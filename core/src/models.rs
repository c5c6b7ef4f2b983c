use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::matcher::Filter;

/// Trace identifiers and the receive time propagated alongside an event
/// across queue boundaries, so that spans on both sides of a broker hop
/// can be correlated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventTelemetry {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub span_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub received_at: Option<DateTime<Utc>>,
}

/// An immutable record produced by a tenant.
///
/// The event ID is unique per tenant and doubles as the publish
/// idempotency key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    pub tenant_id: String,
    #[serde(default)]
    pub topic: String,
    /// When set, the event targets a single destination instead of
    /// fanning out to every matched destination.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination_id: Option<String>,
    #[serde(default)]
    pub eligible_for_retry: bool,
    /// The producer timestamp. Absent on the minimal stub carried by
    /// retry messages, the full event is refetched from the log store
    /// before delivery.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub telemetry: Option<EventTelemetry>,
}

impl Event {
    /// Creates the minimal stub carried on retry messages, only the
    /// identifiers needed to refetch the canonical event survive the
    /// round trip through the delay queue.
    pub fn stub(id: &str, tenant_id: &str) -> Self {
        Event {
            id: id.to_string(),
            tenant_id: tenant_id.to_string(),
            topic: String::new(),
            destination_id: None,
            eligible_for_retry: false,
            time: None,
            metadata: HashMap::new(),
            data: Value::Null,
            telemetry: None,
        }
    }

    /// Whether this event is a retry stub that must be rehydrated from
    /// the log store before delivery.
    pub fn is_stub(&self) -> bool {
        self.time.is_none()
    }
}

/// A mutable forwarding target owned by a tenant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Destination {
    pub id: String,
    pub tenant_id: String,
    /// The adapter tag, e.g. `webhook` or `rabbitmq`. Adapters themselves
    /// live behind the `DestinationPublisher` seam.
    #[serde(rename = "type")]
    pub kind: String,
    /// The subscription pattern, exact topic names or the `*` wildcard.
    #[serde(default)]
    pub topics: Vec<String>,
    /// An optional payload predicate evaluated against the event data,
    /// a destination only matches when both the topic subscription and
    /// the filter accept the event.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<Filter>,
    #[serde(default)]
    pub config: HashMap<String, String>,
    #[serde(default)]
    pub credentials: HashMap<String, String>,
    pub created_at: DateTime<Utc>,
    /// Set by the alert monitor when the consecutive-failure threshold
    /// is crossed. Deliveries to a disabled destination fail fast.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disabled_at: Option<DateTime<Utc>>,
}

impl Destination {
    /// Whether the destination's topic subscription covers the topic.
    pub fn subscribes_to(&self, topic: &str) -> bool {
        self.topics
            .iter()
            .any(|subscribed| subscribed == "*" || subscribed == topic)
    }

    pub fn is_disabled(&self) -> bool {
        self.disabled_at.is_some()
    }
}

/// A message handed to the delivery handler, one per
/// `(event, destination)` pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryTask {
    /// May be a minimal `{id, tenant_id}` stub on retries.
    pub event: Event,
    pub destination_id: String,
    /// 0-indexed attempt counter, the initial delivery is attempt 0.
    #[serde(default)]
    pub attempt: u32,
    /// A user-initiated retry bypasses eligibility checks and cancels
    /// any scheduled automatic retry on success.
    #[serde(default)]
    pub manual: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub telemetry: Option<EventTelemetry>,
}

impl DeliveryTask {
    /// The guard key discriminating one delivery attempt, two tasks with
    /// the same key describe the same attempt and at most one executes.
    pub fn idempotency_key(&self) -> String {
        if self.manual {
            format!(
                "{event_id}:{destination_id}:{attempt}:manual",
                event_id = self.event.id,
                destination_id = self.destination_id,
                attempt = self.attempt,
            )
        } else {
            format!(
                "{event_id}:{destination_id}:{attempt}",
                event_id = self.event.id,
                destination_id = self.destination_id,
                attempt = self.attempt,
            )
        }
    }

    /// The stable retry identifier for the `(event, destination)` pair,
    /// used as the delay-queue deduplication ID so rescheduling
    /// overwrites the previous entry.
    pub fn retry_id(&self) -> String {
        retry_id(&self.event.id, &self.destination_id)
    }
}

/// The stable retry identifier for an `(event, destination)` pair.
pub fn retry_id(event_id: &str, destination_id: &str) -> String {
    format!("{event_id}:{destination_id}")
}

/// The outcome of a single adapter invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    Success,
    Failed,
}

/// An immutable record of one adapter invocation, persisted to the
/// log store. At most one delivery row exists per
/// `(event, destination, attempt)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Delivery {
    pub id: String,
    pub delivery_event_id: String,
    pub event_id: String,
    pub destination_id: String,
    pub tenant_id: String,
    pub attempt_number: u32,
    pub status: DeliveryStatus,
    #[serde(default)]
    pub manual: bool,
    pub time: DateTime<Utc>,
    /// The adapter response payload, e.g. the HTTP status and body for
    /// a webhook destination.
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub response: Value,
}

impl Delivery {
    /// Builds the delivery record for one adapter invocation of a task.
    pub fn of_attempt(task: &DeliveryTask, status: DeliveryStatus, response: Value) -> Self {
        Delivery {
            id: nanoid::nanoid!(),
            delivery_event_id: nanoid::nanoid!(),
            event_id: task.event.id.clone(),
            destination_id: task.destination_id.clone(),
            tenant_id: task.event.tenant_id.clone(),
            attempt_number: task.attempt,
            status,
            manual: task.manual,
            time: Utc::now(),
            response,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == DeliveryStatus::Success
    }
}

/// The compact delay-queue payload. The event body is deliberately not
/// carried, it is refetched from the log store at pop time so retries
/// always observe the canonical event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryTask {
    #[serde(rename = "EventID")]
    pub event_id: String,
    #[serde(rename = "TenantID")]
    pub tenant_id: String,
    #[serde(rename = "DestinationID")]
    pub destination_id: String,
    #[serde(rename = "Attempt")]
    pub attempt: u32,
    #[serde(rename = "Telemetry", default, skip_serializing_if = "Option::is_none")]
    pub telemetry: Option<EventTelemetry>,
}

impl RetryTask {
    pub fn retry_id(&self) -> String {
        retry_id(&self.event_id, &self.destination_id)
    }
}

/// An `(event, delivery)` pair batched into the log store.
/// Both halves are mandatory, a message missing either half fails
/// deserialization and is nacked individually by the log batcher.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    #[serde(rename = "Event")]
    pub event: Event,
    #[serde(rename = "Delivery")]
    pub delivery: Delivery,
}

/// The per-destination status synthesized for targeted publishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DestinationStatusKind {
    Queued,
    Disabled,
    NotFound,
    TopicMismatch,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DestinationStatus {
    pub destination_id: String,
    pub status: DestinationStatusKind,
}

/// The result reported back to the publisher of an event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublishResult {
    pub event_id: String,
    pub matched_count: usize,
    /// Equals `matched_count` when the guarded fan-out actually ran,
    /// zero when the idempotence guard found the event already
    /// processed.
    pub queued_count: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destinations: Option<Vec<DestinationStatus>>,
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;

    fn destination(topics: Vec<&str>) -> Destination {
        Destination {
            id: "dst_1".to_string(),
            tenant_id: "t1".to_string(),
            kind: "webhook".to_string(),
            topics: topics.into_iter().map(String::from).collect(),
            filter: None,
            config: HashMap::new(),
            credentials: HashMap::new(),
            created_at: Utc::now(),
            disabled_at: None,
        }
    }

    #[test]
    fn test_subscribes_to_exact_topic_and_wildcard() {
        assert!(destination(vec!["orders.created"]).subscribes_to("orders.created"));
        assert!(!destination(vec!["orders.created"]).subscribes_to("orders.deleted"));
        assert!(destination(vec!["*"]).subscribes_to("anything"));
        assert!(!destination(vec![]).subscribes_to("orders.created"));
    }

    #[test]
    fn test_idempotency_key_discriminates_attempt_and_manual() {
        let mut task = DeliveryTask {
            event: Event::stub("evt_1", "t1"),
            destination_id: "dst_1".to_string(),
            attempt: 2,
            manual: false,
            telemetry: None,
        };
        assert_eq!(task.idempotency_key(), "evt_1:dst_1:2");
        task.manual = true;
        assert_eq!(task.idempotency_key(), "evt_1:dst_1:2:manual");
    }

    #[test]
    fn test_stub_event_round_trips_with_minimal_fields() {
        let stub = Event::stub("evt_1", "t1");
        assert!(stub.is_stub());

        let serialized = serde_json::to_string(&stub).unwrap();
        let deserialized: Event = serde_json::from_str(&serialized).unwrap();
        assert_eq!(deserialized, stub);
        assert!(deserialized.is_stub());
    }

    #[test]
    fn test_retry_task_wire_format() {
        let task = RetryTask {
            event_id: "evt_1".to_string(),
            tenant_id: "t1".to_string(),
            destination_id: "dst_1".to_string(),
            attempt: 3,
            telemetry: None,
        };
        let serialized = serde_json::to_value(&task).unwrap();
        assert_eq!(
            serialized,
            json!({
                "EventID": "evt_1",
                "TenantID": "t1",
                "DestinationID": "dst_1",
                "Attempt": 3,
            })
        );
    }

    #[test]
    fn test_log_entry_requires_both_halves() {
        let missing_delivery = json!({
            "Event": {
                "id": "evt_1",
                "tenant_id": "t1",
                "topic": "orders.created",
            },
            "Delivery": null,
        });
        assert!(serde_json::from_value::<LogEntry>(missing_delivery).is_err());
    }
}
