//! HTTP API for health checks, Prometheus metrics and node stats

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use prometheus::{proto::MetricFamily, Encoder, TextEncoder};
use provider_lib::{ComponentStatus, Error, HealthRegistry, StatsSummaryProvider};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub health_registry: HealthRegistry,
    pub summary: Arc<StatsSummaryProvider>,
    /// Cancelled on shutdown; in-flight summaries stop with it
    pub shutdown: CancellationToken,
}

impl AppState {
    pub fn new(
        health_registry: HealthRegistry,
        summary: Arc<StatsSummaryProvider>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            health_registry,
            summary,
            shutdown,
        }
    }
}

/// 200 while operational, 503 once any component is unhealthy
async fn healthz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let health = state.health_registry.health().await;

    let status_code = match health.status {
        ComponentStatus::Healthy => StatusCode::OK,
        ComponentStatus::Degraded => StatusCode::OK,
        ComponentStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };

    (status_code, Json(health))
}

async fn readyz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let readiness = state.health_registry.readiness().await;

    let status_code = if readiness.ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (status_code, Json(readiness))
}

/// Process metrics from the default registry
async fn metrics() -> Response {
    encode_families(&prometheus::gather())
}

async fn stats_summary(State(state): State<Arc<AppState>>) -> Response {
    match state.summary.get_stats_summary(&state.shutdown).await {
        Ok(summary) => (StatusCode::OK, Json(summary)).into_response(),
        Err(e) => error_response(&e),
    }
}

/// Node and pod usage in Prometheus text format
async fn metrics_resource(State(state): State<Arc<AppState>>) -> Response {
    match state.summary.get_metrics_resource(&state.shutdown).await {
        Ok(families) => encode_families(&families),
        Err(e) => error_response(&e),
    }
}

fn encode_families(families: &[MetricFamily]) -> Response {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();

    if let Err(e) = encoder.encode(families, &mut buffer) {
        error!(error = %e, "Failed to encode metrics");
        return (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response();
    }

    (
        StatusCode::OK,
        [("content-type", encoder.format_type().to_string())],
        buffer,
    )
        .into_response()
}

fn error_response(e: &Error) -> Response {
    let status = if e.is_cancelled() {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    };
    (status, e.to_string()).into_response()
}

/// Create the API router
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics))
        .route("/stats/summary", get(stats_summary))
        .route("/metrics/resource", get(metrics_resource))
        .with_state(state)
}

/// Serve the API until the shutdown token is cancelled
pub async fn serve(port: u16, state: Arc<AppState>) -> anyhow::Result<()> {
    let shutdown = state.shutdown.clone();
    let app = create_router(state);

    let addr = format!("0.0.0.0:{}", port);
    info!(addr = %addr, "Starting API server");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use k8s_openapi::api::core::v1::Pod;
    use provider_lib::clock::system_clock;
    use provider_lib::health::components;
    use provider_lib::{PodLister, PodStats, PodStatsGetter, SummaryConfig};
    use tower::ServiceExt;

    struct NoPods {
        fail: bool,
    }

    #[async_trait]
    impl PodLister for NoPods {
        async fn list(&self) -> provider_lib::Result<Vec<Pod>> {
            if self.fail {
                return Err(Error::transient(None, "apiserver unreachable"));
            }
            Ok(vec![])
        }
    }

    struct NoStats;

    #[async_trait]
    impl PodStatsGetter for NoStats {
        async fn get_pod_stats(&self, _pod: &Pod) -> provider_lib::Result<Option<PodStats>> {
            Ok(None)
        }
    }

    async fn state(fail_listing: bool) -> Arc<AppState> {
        let health = HealthRegistry::with_provider_components().await;
        let summary = StatsSummaryProvider::new(
            SummaryConfig::new("virtual-kubelet"),
            Arc::new(NoPods { fail: fail_listing }),
            Arc::new(NoStats),
            system_clock(),
        )
        .with_health(health.clone());

        Arc::new(AppState::new(
            health,
            Arc::new(summary),
            CancellationToken::new(),
        ))
    }

    async fn get(state: Arc<AppState>, uri: &str) -> (StatusCode, String) {
        let response = create_router(state)
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, String::from_utf8(body.to_vec()).unwrap())
    }

    #[tokio::test]
    async fn test_healthz_ok_when_healthy() {
        let (status, body) = get(state(false).await, "/healthz").await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.contains("\"healthy\""));
    }

    #[tokio::test]
    async fn test_healthz_unavailable_when_unhealthy() {
        let state = state(false).await;
        state
            .health_registry
            .set_unhealthy(components::ACI_CLIENT, "credentials rejected")
            .await;

        let (status, _) = get(state, "/healthz").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_readyz_follows_ready_flag() {
        let state = state(false).await;
        let (status, _) = get(state.clone(), "/readyz").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);

        state.health_registry.set_ready(true).await;
        let (status, _) = get(state, "/readyz").await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_stats_summary_returns_node() {
        let (status, body) = get(state(false).await, "/stats/summary").await;
        assert_eq!(status, StatusCode::OK);

        let json: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(json["node"]["nodeName"], "virtual-kubelet");
        assert_eq!(json["pods"].as_array().map(Vec::len), Some(0));
    }

    #[tokio::test]
    async fn test_stats_summary_failure_is_server_error() {
        let state = state(true).await;
        let (status, _) = get(state.clone(), "/stats/summary").await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);

        let health = state.health_registry.health().await;
        assert_eq!(health.status, ComponentStatus::Degraded);
    }

    #[tokio::test]
    async fn test_metrics_resource_is_prometheus_text() {
        let (status, body) = get(state(false).await, "/metrics/resource").await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.contains("node_cpu_usage_seconds_total"));
    }

    #[tokio::test]
    async fn test_cancelled_summary_is_unavailable() {
        let state = state(false).await;
        state.shutdown.cancel();

        let (status, _) = get(state, "/stats/summary").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    }
}
