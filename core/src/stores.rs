use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::json;
use tokio::sync::RwLock;
use tracing::debug;

use crate::{
    errors::{DestinationPublishError, EntityStoreError, LogStoreError},
    models::{Delivery, DeliveryStatus, DeliveryTask, Destination, Event, LogEntry},
};

/// Read access to destinations, the only view of the entity store the
/// delivery handler needs.
#[async_trait]
pub trait DestinationGetter: Send + Sync {
    /// Retrieves a destination owned by a tenant, `None` when no such
    /// destination exists. A destination that existed but has been
    /// deleted surfaces as `EntityStoreError::DestinationDeleted`.
    async fn retrieve_destination(
        &self,
        tenant_id: &str,
        destination_id: &str,
    ) -> Result<Option<Destination>, EntityStoreError>;
}

/// Write access used by the alert monitor to take a destination out of
/// rotation once the consecutive-failure threshold is crossed.
#[async_trait]
pub trait DestinationDisabler: Send + Sync {
    async fn disable_destination(
        &self,
        tenant_id: &str,
        destination_id: &str,
        disabled_at: DateTime<Utc>,
    ) -> Result<(), EntityStoreError>;
}

/// The entity store interface the publish handler consumes.
/// Storage layout is an implementation concern of the store.
#[async_trait]
pub trait EntityStore: DestinationGetter + DestinationDisabler {
    /// Returns the destinations whose topic subscription and optional
    /// payload filter accept the event. Disabled destinations are
    /// excluded from matching.
    async fn match_event(&self, event: &Event) -> Result<Vec<Destination>, EntityStoreError>;
}

/// The append-only log store interface.
/// Storage layout is an implementation concern of the store, the
/// insert-many contract must be atomic so that at most one delivery row
/// is persisted per `(event, destination, attempt)`.
#[async_trait]
pub trait LogStore: Send + Sync {
    async fn retrieve_event(
        &self,
        tenant_id: &str,
        event_id: &str,
    ) -> Result<Option<Event>, LogStoreError>;

    async fn insert_many(&self, entries: Vec<LogEntry>) -> Result<(), LogStoreError>;
}

/// The seam behind which destination-type adapters (webhook, message
/// queue, ...) live. An invocation either yields the delivery record
/// for the attempt or a classified failure.
#[async_trait]
pub trait DestinationPublisher: Send + Sync {
    async fn publish_event(
        &self,
        destination: &Destination,
        task: &DeliveryTask,
    ) -> Result<Delivery, DestinationPublishError>;
}

#[derive(Default)]
struct EntityState {
    destinations: HashMap<(String, String), Destination>,
    deleted: HashSet<(String, String)>,
}

/// An in-memory entity store used for local development and tests.
pub struct InMemoryEntityStore {
    state: RwLock<EntityState>,
}

impl InMemoryEntityStore {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(EntityState::default()),
        }
    }

    pub async fn upsert_destination(&self, destination: Destination) {
        let mut state = self.state.write().await;
        state.destinations.insert(
            (destination.tenant_id.clone(), destination.id.clone()),
            destination,
        );
    }

    /// Removes a destination, leaving a tombstone so that lookups
    /// report it as deleted rather than unknown.
    pub async fn delete_destination(&self, tenant_id: &str, destination_id: &str) {
        let mut state = self.state.write().await;
        let key = (tenant_id.to_string(), destination_id.to_string());
        state.destinations.remove(&key);
        state.deleted.insert(key);
    }
}

impl Default for InMemoryEntityStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DestinationGetter for InMemoryEntityStore {
    async fn retrieve_destination(
        &self,
        tenant_id: &str,
        destination_id: &str,
    ) -> Result<Option<Destination>, EntityStoreError> {
        let state = self.state.read().await;
        let key = (tenant_id.to_string(), destination_id.to_string());
        if state.deleted.contains(&key) {
            return Err(EntityStoreError::DestinationDeleted);
        }
        Ok(state.destinations.get(&key).cloned())
    }
}

#[async_trait]
impl DestinationDisabler for InMemoryEntityStore {
    async fn disable_destination(
        &self,
        tenant_id: &str,
        destination_id: &str,
        disabled_at: DateTime<Utc>,
    ) -> Result<(), EntityStoreError> {
        let mut state = self.state.write().await;
        let key = (tenant_id.to_string(), destination_id.to_string());
        match state.destinations.get_mut(&key) {
            Some(destination) => {
                destination.disabled_at = Some(disabled_at);
                Ok(())
            }
            None => Err(EntityStoreError::Internal(
                format!("destination {destination_id} not found for tenant {tenant_id}").into(),
            )),
        }
    }
}

#[async_trait]
impl EntityStore for InMemoryEntityStore {
    async fn match_event(&self, event: &Event) -> Result<Vec<Destination>, EntityStoreError> {
        let state = self.state.read().await;
        let mut matched: Vec<Destination> = state
            .destinations
            .values()
            .filter(|destination| destination.tenant_id == event.tenant_id)
            .filter(|destination| match &event.destination_id {
                Some(target) => &destination.id == target,
                None => true,
            })
            .filter(|destination| !destination.is_disabled())
            .filter(|destination| destination.subscribes_to(&event.topic))
            .filter(|destination| {
                destination
                    .filter
                    .as_ref()
                    .map(|filter| filter.matches(&event.data))
                    .unwrap_or(true)
            })
            .cloned()
            .collect();
        matched.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(matched)
    }
}

#[derive(Default)]
struct LogState {
    events: HashMap<(String, String), Event>,
    deliveries: Vec<Delivery>,
}

/// An in-memory log store used for local development and tests.
pub struct InMemoryLogStore {
    state: RwLock<LogState>,
}

impl InMemoryLogStore {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(LogState::default()),
        }
    }

    /// Seeds an event directly, bypassing the batcher. Used to model
    /// events persisted by a previous delivery.
    pub async fn insert_event(&self, event: Event) {
        let mut state = self.state.write().await;
        state
            .events
            .insert((event.tenant_id.clone(), event.id.clone()), event);
    }

    pub async fn deliveries(&self) -> Vec<Delivery> {
        self.state.read().await.deliveries.clone()
    }
}

impl Default for InMemoryLogStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LogStore for InMemoryLogStore {
    async fn retrieve_event(
        &self,
        tenant_id: &str,
        event_id: &str,
    ) -> Result<Option<Event>, LogStoreError> {
        let state = self.state.read().await;
        Ok(state
            .events
            .get(&(tenant_id.to_string(), event_id.to_string()))
            .cloned())
    }

    async fn insert_many(&self, entries: Vec<LogEntry>) -> Result<(), LogStoreError> {
        // A single write lock makes the batch all-or-nothing.
        let mut state = self.state.write().await;
        for entry in entries {
            state.events.insert(
                (entry.event.tenant_id.clone(), entry.event.id.clone()),
                entry.event,
            );
            state.deliveries.push(entry.delivery);
        }
        Ok(())
    }
}

/// A destination publisher that accepts every event without contacting
/// anything, used for local development where real adapters are not
/// wired in.
pub struct NoopDestinationPublisher {}

impl NoopDestinationPublisher {
    pub fn new() -> Self {
        NoopDestinationPublisher {}
    }
}

impl Default for NoopDestinationPublisher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DestinationPublisher for NoopDestinationPublisher {
    async fn publish_event(
        &self,
        destination: &Destination,
        task: &DeliveryTask,
    ) -> Result<Delivery, DestinationPublishError> {
        debug!(
            destination_id = %destination.id,
            event_id = %task.event.id,
            "accepting event without forwarding"
        );
        Ok(Delivery::of_attempt(
            task,
            DeliveryStatus::Success,
            json!({"accepted": true}),
        ))
    }
}
