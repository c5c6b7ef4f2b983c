use std::{error::Error, fmt, sync::Arc};

use async_trait::async_trait;
use chrono::Utc;
use outpost_helpers::redis::ConnectionWrapper;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::{
    consts::alert_failure_key,
    models::{Delivery, Destination},
    stores::DestinationDisabler,
};

/// Provides a custom error type to be used for failures
/// in alert monitoring.
#[derive(Debug)]
pub enum AlertError {
    Counter(String),
    Notify(String),
    Disable(String),
}

impl fmt::Display for AlertError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            AlertError::Counter(reason) => {
                write!(f, "alert error: failure counter: {reason}")
            }
            AlertError::Notify(reason) => write!(f, "alert error: notifier: {reason}"),
            AlertError::Disable(reason) => write!(f, "alert error: disabler: {reason}"),
        }
    }
}

impl Error for AlertError {}

/// Observes delivery outcomes off the hot path. Failures in alert
/// monitoring are logged by the caller and never affect the delivery
/// result.
#[async_trait]
pub trait AlertMonitor: Send + Sync {
    async fn handle_attempt(
        &self,
        destination: &Destination,
        delivery: &Delivery,
    ) -> Result<(), AlertError>;
}

/// The consecutive-failure counter seam, Redis-backed in production.
#[async_trait]
pub trait FailureCounter: Send + Sync {
    /// Increments the counter for a destination, returning the new
    /// consecutive-failure count.
    async fn increment(&self, tenant_id: &str, destination_id: &str) -> Result<u64, AlertError>;

    async fn reset(&self, tenant_id: &str, destination_id: &str) -> Result<(), AlertError>;
}

/// Counts consecutive failures per destination in Redis under a
/// hash-tagged tenant key so the counter lands in the tenant's cluster
/// slot.
pub struct RedisFailureCounter {
    connection: ConnectionWrapper,
    deployment_id: Option<String>,
    /// Counters expire if a destination goes quiet for this window.
    ttl_ms: i64,
}

impl RedisFailureCounter {
    pub fn new(connection: ConnectionWrapper, deployment_id: Option<String>, ttl_ms: i64) -> Self {
        Self {
            connection,
            deployment_id,
            ttl_ms,
        }
    }

    fn key(&self, tenant_id: &str, destination_id: &str) -> String {
        alert_failure_key(self.deployment_id.as_deref(), tenant_id, destination_id)
    }
}

#[async_trait]
impl FailureCounter for RedisFailureCounter {
    async fn increment(&self, tenant_id: &str, destination_id: &str) -> Result<u64, AlertError> {
        let key = self.key(tenant_id, destination_id);
        let mut connection = self.connection.clone();
        let count = connection
            .incr(&key)
            .await
            .map_err(|err| AlertError::Counter(err.to_string()))?;
        connection
            .pexpire(&key, self.ttl_ms)
            .await
            .map_err(|err| AlertError::Counter(err.to_string()))?;
        Ok(count.max(0) as u64)
    }

    async fn reset(&self, tenant_id: &str, destination_id: &str) -> Result<(), AlertError> {
        let key = self.key(tenant_id, destination_id);
        let mut connection = self.connection.clone();
        connection
            .del(&key)
            .await
            .map_err(|err| AlertError::Counter(err.to_string()))?;
        Ok(())
    }
}

/// An in-memory failure counter used for local development and tests.
pub struct InMemoryFailureCounter {
    counts: Mutex<std::collections::HashMap<(String, String), u64>>,
}

impl InMemoryFailureCounter {
    pub fn new() -> Self {
        Self {
            counts: Mutex::new(std::collections::HashMap::new()),
        }
    }
}

impl Default for InMemoryFailureCounter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl FailureCounter for InMemoryFailureCounter {
    async fn increment(&self, tenant_id: &str, destination_id: &str) -> Result<u64, AlertError> {
        let mut counts = self.counts.lock().await;
        let count = counts
            .entry((tenant_id.to_string(), destination_id.to_string()))
            .or_insert(0);
        *count += 1;
        Ok(*count)
    }

    async fn reset(&self, tenant_id: &str, destination_id: &str) -> Result<(), AlertError> {
        let mut counts = self.counts.lock().await;
        counts.remove(&(tenant_id.to_string(), destination_id.to_string()));
        Ok(())
    }
}

/// The alert payload sent to the configured callback when a destination
/// crosses the consecutive-failure threshold.
#[derive(Debug, Clone, Serialize)]
pub struct DestinationAlert {
    pub tenant_id: String,
    pub destination_id: String,
    pub consecutive_failures: u64,
    pub max_consecutive_failures: u64,
    pub will_disable: bool,
}

/// Delivers threshold alerts to an external receiver.
#[async_trait]
pub trait AlertNotifier: Send + Sync {
    async fn notify(&self, alert: &DestinationAlert) -> Result<(), AlertError>;
}

/// Posts alerts to an HTTP callback with optional bearer auth.
pub struct HttpAlertNotifier {
    client: reqwest::Client,
    callback_url: String,
    bearer_token: Option<String>,
}

impl HttpAlertNotifier {
    pub fn new(callback_url: String, bearer_token: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            callback_url,
            bearer_token,
        }
    }
}

#[async_trait]
impl AlertNotifier for HttpAlertNotifier {
    async fn notify(&self, alert: &DestinationAlert) -> Result<(), AlertError> {
        let mut request = self.client.post(&self.callback_url).json(alert);
        if let Some(token) = &self.bearer_token {
            request = request.bearer_auth(token);
        }
        let response = request
            .send()
            .await
            .map_err(|err| AlertError::Notify(err.to_string()))?;
        if !response.status().is_success() {
            return Err(AlertError::Notify(format!(
                "callback returned {status}",
                status = response.status()
            )));
        }
        Ok(())
    }
}

/// Configuration for the consecutive-failure monitor.
#[derive(Debug, Clone)]
pub struct AlertMonitorConfig {
    /// The count at which the notifier fires and, when enabled, the
    /// destination is disabled.
    pub consecutive_failure_threshold: u64,
    pub auto_disable_destination: bool,
}

/// Tracks consecutive delivery failures per destination. A success
/// resets the counter, a failure increments it, and exactly at the
/// configured threshold the notifier fires and the destination is
/// optionally disabled.
pub struct ConsecutiveFailureMonitor {
    counter: Arc<dyn FailureCounter>,
    notifier: Option<Arc<dyn AlertNotifier>>,
    disabler: Arc<dyn DestinationDisabler>,
    config: AlertMonitorConfig,
}

impl ConsecutiveFailureMonitor {
    pub fn new(
        counter: Arc<dyn FailureCounter>,
        notifier: Option<Arc<dyn AlertNotifier>>,
        disabler: Arc<dyn DestinationDisabler>,
        config: AlertMonitorConfig,
    ) -> Self {
        Self {
            counter,
            notifier,
            disabler,
            config,
        }
    }
}

#[async_trait]
impl AlertMonitor for ConsecutiveFailureMonitor {
    async fn handle_attempt(
        &self,
        destination: &Destination,
        delivery: &Delivery,
    ) -> Result<(), AlertError> {
        if delivery.is_success() {
            return self
                .counter
                .reset(&destination.tenant_id, &destination.id)
                .await;
        }

        let count = self
            .counter
            .increment(&destination.tenant_id, &destination.id)
            .await?;
        // Fire exactly on the threshold edge, repeated failures past it
        // stay silent until a success resets the counter.
        if count != self.config.consecutive_failure_threshold {
            return Ok(());
        }

        info!(
            tenant_id = %destination.tenant_id,
            destination_id = %destination.id,
            consecutive_failures = count,
            "destination crossed the consecutive-failure threshold"
        );

        if let Some(notifier) = &self.notifier {
            let alert = DestinationAlert {
                tenant_id: destination.tenant_id.clone(),
                destination_id: destination.id.clone(),
                consecutive_failures: count,
                max_consecutive_failures: self.config.consecutive_failure_threshold,
                will_disable: self.config.auto_disable_destination,
            };
            if let Err(err) = notifier.notify(&alert).await {
                warn!("failed to deliver destination alert: {err}");
            }
        }

        if self.config.auto_disable_destination {
            self.disabler
                .disable_destination(&destination.tenant_id, &destination.id, Utc::now())
                .await
                .map_err(|err| AlertError::Disable(err.to_string()))?;
        }
        Ok(())
    }
}
