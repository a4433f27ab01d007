//! HTTP endpoints for the health aggregator.
//!
//! | Route           | Body                 | Status                   |
//! |-----------------|----------------------|--------------------------|
//! | `/health/live`  | [`Liveness`]         | always 200               |
//! | `/health/ready` | [`Readiness`]        | 503 when not ready       |
//! | `/health`       | [`HealthSnapshot`]   | 503 when unhealthy       |
//! | `/metrics`      | Prometheus text      | always 200               |
//! | `/metrics.json` | [`MetricsSnapshot`]  | always 200               |

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

use crate::health::aggregator::{
    render_prometheus, HealthAggregator, HealthSnapshot, Liveness, MetricsSnapshot, OverallStatus, Readiness,
};

pub fn router(aggregator: Arc<HealthAggregator>) -> Router {
    Router::new()
        .route("/health/live", get(get_live))
        .route("/health/ready", get(get_ready))
        .route("/health", get(get_health))
        .route("/metrics", get(get_metrics))
        .route("/metrics.json", get(get_metrics_json))
        .with_state(aggregator)
        .layer(TraceLayer::new_for_http())
}

async fn get_live(State(aggregator): State<Arc<HealthAggregator>>) -> Json<Liveness> {
    Json(aggregator.liveness())
}

async fn get_ready(State(aggregator): State<Arc<HealthAggregator>>) -> (StatusCode, Json<Readiness>) {
    let readiness = aggregator.readiness().await;
    let status = if readiness.ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(readiness))
}

async fn get_health(State(aggregator): State<Arc<HealthAggregator>>) -> (StatusCode, Json<HealthSnapshot>) {
    let snapshot = aggregator.snapshot().await;
    let status = match snapshot.status {
        OverallStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
        OverallStatus::Healthy | OverallStatus::Degraded => StatusCode::OK,
    };
    (status, Json(snapshot))
}

async fn get_metrics(State(aggregator): State<Arc<HealthAggregator>>) -> Response {
    let body = render_prometheus(&aggregator.metrics_snapshot());
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        body,
    )
        .into_response()
}

async fn get_metrics_json(State(aggregator): State<Arc<HealthAggregator>>) -> Json<MetricsSnapshot> {
    Json(aggregator.metrics_snapshot())
}

/// Serve the health endpoints until `cancel` fires.
pub async fn serve(
    aggregator: Arc<HealthAggregator>,
    addr: SocketAddr,
    cancel: CancellationToken,
) -> Result<(), std::io::Error> {
    let listener = TcpListener::bind(addr).await?;
    tracing::info!(address = %listener.local_addr()?, "Health server starting");

    axum::serve(listener, router(aggregator))
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await?;

    tracing::info!("Health server stopped");
    Ok(())
}
