//! Health endpoints wired to a real client over an in-memory store.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use serde_json::Value;
use tower::ServiceExt;

use resilient_sync::health::{server, FnProbe, HealthAggregator, ApiProbe};
use resilient_sync::observability::metrics::SyncCounters;
use resilient_sync::store::{Fault, StoreOp};

mod common;

async fn get(app: axum::Router, uri: &str) -> (StatusCode, Value) {
    let response = app
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let body = axum::body::to_bytes(response.into_body(), 1024 * 1024).await.unwrap();
    (status, serde_json::from_slice(&body).unwrap_or(Value::Null))
}

#[tokio::test]
async fn test_store_outage_fails_readiness_but_not_liveness() {
    let h = common::harness(1000, 5, 1);
    let aggregator = HealthAggregator::new(Duration::from_secs(1), Arc::new(SyncCounters::new()))
        .with_max_age(Duration::ZERO)
        .with_probe(ApiProbe::new("store", h.client.clone()))
        .with_probe(FnProbe::new("cache", false, || Err("cold".to_string())))
        .with_client(h.client.clone());
    let app = server::router(Arc::new(aggregator));

    let (status, body) = get(app.clone(), "/health/ready").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "degraded");

    h.store.inject_always(StoreOp::Ping, Fault::Status(503));
    let (status, body) = get(app.clone(), "/health/ready").await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["failing"], serde_json::json!(["store"]));

    let (status, body) = get(app.clone(), "/health").await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["score"], 0.0);
    assert_eq!(body["components"][0]["component"], "store");
    assert_eq!(body["components"][0]["status"], "fail");

    let (status, body) = get(app.clone(), "/health/live").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "pass");

    let (_, body) = get(app.clone(), "/metrics.json").await;
    assert_eq!(body["circuits"][0]["operation"], "store.ping");

    h.store.clear_faults();
    let (status, body) = get(app, "/health/ready").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["failing"], serde_json::json!([]));
}
