use async_trait::async_trait;
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use tokio::sync::broadcast;
use tracing::info;

use crate::supervisor::{HealthTracker, Worker, WorkerError};

/// Builds the health API router.
///
/// `GET /healthz` returns 200 while every worker is running or has
/// exited healthily and 503 once any worker has failed. The body
/// carries per-worker statuses without error details.
pub fn health_router(tracker: HealthTracker) -> Router {
    Router::new()
        .route("/healthz", get(health_check))
        .with_state(tracker)
}

async fn health_check(State(tracker): State<HealthTracker>) -> Response {
    let snapshot = tracker.snapshot();
    let status_code = if snapshot.is_failed() {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };
    (status_code, Json(snapshot)).into_response()
}

/// Serves the health API as a supervised worker.
pub struct HealthApiWorker {
    tracker: HealthTracker,
    port: u16,
}

impl HealthApiWorker {
    pub fn new(tracker: HealthTracker, port: u16) -> Self {
        Self { tracker, port }
    }
}

#[async_trait]
impl Worker for HealthApiWorker {
    fn name(&self) -> &str {
        "health-api"
    }

    async fn run(&self, shutdown: broadcast::Sender<()>) -> Result<(), WorkerError> {
        let listener = tokio::net::TcpListener::bind(("0.0.0.0", self.port))
            .await
            .map_err(|err| {
                WorkerError::failed(format!("failed to bind health API listener: {err}"))
            })?;
        info!(port = self.port, "health API listening");

        let mut shutdown_rx = shutdown.subscribe();
        axum::serve(listener, health_router(self.tracker.clone()))
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.recv().await;
                info!("received shutdown signal, stopping health API");
            })
            .await
            .map_err(|err| WorkerError::failed(format!("health API server failed: {err}")))
    }
}

#[cfg(test)]
mod tests {
    use axum::{body::Body, http::Request};
    use http_body_util::BodyExt;
    use pretty_assertions::assert_eq;
    use serde_json::Value;
    use tower::ServiceExt;

    use super::*;
    use crate::supervisor::WorkerStatus;

    async fn get_health(tracker: HealthTracker) -> (StatusCode, Value) {
        let response = health_router(tracker)
            .oneshot(
                Request::builder()
                    .uri("/healthz")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = response.status();
        let body = response.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&body).unwrap())
    }

    #[test_log::test(tokio::test)]
    async fn test_reports_ok_while_workers_are_healthy() {
        let tracker = HealthTracker::new();
        tracker.register("delivery-consumer");
        tracker.mark("publish-consumer", WorkerStatus::Healthy);

        let (status, body) = get_health(tracker).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["overall"], "healthy");
        assert_eq!(body["workers"]["delivery-consumer"]["status"], "running");
    }

    #[test_log::test(tokio::test)]
    async fn test_reports_service_unavailable_once_a_worker_fails() {
        let tracker = HealthTracker::new();
        tracker.register("delivery-consumer");
        tracker.mark("retry-monitor", WorkerStatus::Failed);

        let (status, body) = get_health(tracker).await;

        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["overall"], "failed");
        assert_eq!(body["workers"]["retry-monitor"]["status"], "failed");
        // Error details are not part of the health surface.
        assert!(body["workers"]["retry-monitor"].get("error").is_none());
    }
}
