//! Health check handlers for the queue worker service.
//!
//! This module provides reusable Axum handlers for:
//! - Liveness checks (`/health`, `/healthz`)
//! - Readiness checks (`/ready`, `/readyz`)
//! - Server statistics (`/stats`)
//! - Prometheus metrics (`/metrics`)

use axum::{
    Json,
    extract::State,
    http::{StatusCode, header},
    response::IntoResponse,
};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::metrics;
use crate::server::{MqServer, MqServerStats};
use crate::status::Status;

/// Shared state for health endpoints.
#[derive(Clone)]
pub struct HealthState {
    pub server: MqServer,
    pub app_name: String,
    pub app_version: String,
}

impl HealthState {
    pub fn new(server: MqServer, app_name: impl Into<String>, app_version: impl Into<String>) -> Self {
        Self {
            server,
            app_name: app_name.into(),
            app_version: app_version.into(),
        }
    }
}

/// Health response for liveness checks.
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    /// Always "healthy" if responding.
    pub status: String,
    pub name: String,
    pub version: String,
}

/// Liveness check handler.
///
/// Always returns OK while the process is serving requests.
pub async fn health_handler(State(state): State<HealthState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        name: state.app_name,
        version: state.app_version,
    })
}

/// Readiness check handler.
///
/// Ready only while the server is started.
pub async fn ready_handler(
    State(state): State<HealthState>,
) -> Result<(StatusCode, Json<Value>), (StatusCode, Json<Value>)> {
    let status = state.server.status();
    let body = |ready: &str| {
        Json(json!({
            "status": ready,
            "checks": {
                "mq_server": status.as_str()
            }
        }))
    };

    if status == Status::Started {
        Ok((StatusCode::OK, body("ready")))
    } else {
        Err((StatusCode::SERVICE_UNAVAILABLE, body("not_ready")))
    }
}

/// Server statistics: status, error counters, workers and handler totals.
pub async fn stats_handler(State(state): State<HealthState>) -> Json<MqServerStats> {
    Json(state.server.stats())
}

/// Prometheus metrics endpoint handler.
pub async fn metrics_handler() -> impl IntoResponse {
    match metrics::prometheus_handle() {
        Some(handle) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
            handle.render(),
        )
            .into_response(),
        None => (
            StatusCode::SERVICE_UNAVAILABLE,
            [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
            "Metrics not initialized. Call metrics::init_metrics() at startup.".to_string(),
        )
            .into_response(),
    }
}

/// Create the standard health router:
/// - `/health`, `/healthz` - Liveness check
/// - `/ready`, `/readyz` - Readiness check
/// - `/stats` - Server statistics
/// - `/metrics` - Prometheus metrics
pub fn health_router(state: HealthState) -> axum::Router {
    use axum::routing::get;

    axum::Router::new()
        .route("/health", get(health_handler))
        .route("/healthz", get(health_handler))
        .route("/ready", get(ready_handler))
        .route("/readyz", get(ready_handler))
        .route("/stats", get(stats_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MqServerConfig;
    use crate::test_support::RecordingQueueService;
    use axum::body::{Body, to_bytes};
    use axum::http::Request;
    use tower::ServiceExt;

    fn state() -> HealthState {
        let svc = RecordingQueueService::new();
        let server = MqServer::new(svc.factory(), MqServerConfig::default()).unwrap();
        HealthState::new(server, "sqs-worker-test", "0.1.0")
    }

    async fn get(router: axum::Router, uri: &str) -> (StatusCode, Value) {
        let response = router
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap_or(Value::Null))
    }

    #[test]
    fn test_health_response_serialization() {
        let response = HealthResponse {
            status: "healthy".to_string(),
            name: "test-worker".to_string(),
            version: "1.0.0".to_string(),
        };

        let json = serde_json::to_string(&response).unwrap();
        assert!(json.contains("\"status\":\"healthy\""));
        assert!(json.contains("\"name\":\"test-worker\""));
    }

    #[tokio::test]
    async fn test_liveness() {
        let (status, body) = get(health_router(state()), "/healthz").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["name"], "sqs-worker-test");
    }

    #[tokio::test]
    async fn test_not_ready_until_started() {
        let (status, body) = get(health_router(state()), "/ready").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["checks"]["mq_server"], "stopped");
    }

    #[tokio::test]
    async fn test_stats() {
        let (status, body) = get(health_router(state()), "/stats").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "stopped");
        assert_eq!(body["error_count"], 0);
        assert!(body["workers"].as_array().unwrap().is_empty());
    }
}
