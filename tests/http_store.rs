//! HTTP store against a mock REST API.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::json;
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use resilient_sync::client::{AuditedApiClient, MemoryAuditSink};
use resilient_sync::config::StoreConfig;
use resilient_sync::error::{SyncError, TransientCause};
use resilient_sync::store::{HttpRecordStore, RecordStore};
use resilient_sync::CorrelationId;

mod common;

async fn store(server: &MockServer) -> HttpRecordStore {
    let config = StoreConfig {
        base_url: server.uri(),
        ..Default::default()
    };
    HttpRecordStore::new(&config, "secret-token", Duration::from_secs(5)).unwrap()
}

#[tokio::test]
async fn test_query_follows_cursor() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/databases/db-devices/query"))
        .and(body_partial_json(json!({"start_cursor": "c2"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "results": [{"id": "page-7", "properties": {"serial": "SN-1"}}],
            "has_more": false,
        })))
        .with_priority(1)
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v1/databases/db-devices/query"))
        .and(header("authorization", "Bearer secret-token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "results": [],
            "has_more": true,
            "next_cursor": "c2",
        })))
        .expect(1)
        .mount(&server)
        .await;

    let found = store(&server).await.query("db-devices", "serial", "SN-1").await.unwrap().unwrap();
    assert_eq!(found.id, "page-7");
    assert_eq!(found.fields["serial"], "SN-1");
}

#[tokio::test]
async fn test_every_result_page_takes_a_limiter_slot() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/databases/db-devices/query"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "results": [], "has_more": true, "next_cursor": "c1",
        })))
        .mount(&server)
        .await;
    for page in 1..10 {
        let next = if page < 9 {
            json!({"results": [], "has_more": true, "next_cursor": format!("c{}", page + 1)})
        } else {
            json!({"results": [], "has_more": false})
        };
        Mock::given(method("POST"))
            .and(path("/v1/databases/db-devices/query"))
            .and(body_partial_json(json!({"start_cursor": format!("c{}", page)})))
            .respond_with(ResponseTemplate::new(200).set_body_json(next))
            .with_priority(1)
            .mount(&server)
            .await;
    }

    let client = AuditedApiClient::new(Arc::new(store(&server).await))
        .with_rate_limit(3)
        .with_audit_sink(Arc::new(MemoryAuditSink::new()));

    let started = Instant::now();
    let found = client
        .find("db-devices", "serial", "SN-1", &CorrelationId::new())
        .await
        .unwrap();
    let elapsed = started.elapsed();

    assert!(found.is_none());
    assert_eq!(server.received_requests().await.unwrap().len(), 10);
    // ten requests at three per second: the tenth cannot start before 3s
    assert!(elapsed >= Duration::from_secs(3), "took {:?}", elapsed);
}

#[tokio::test]
async fn test_query_without_match_is_none() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/databases/db-devices/query"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"results": [], "has_more": false})))
        .mount(&server)
        .await;

    assert!(store(&server).await.query("db-devices", "serial", "SN-9").await.unwrap().is_none());
}

#[tokio::test]
async fn test_create_targets_parent_collection() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/pages"))
        .and(body_partial_json(json!({"parent": {"database_id": "db-devices"}})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "page-1", "properties": {}})))
        .expect(1)
        .mount(&server)
        .await;

    let fields = common::rec(json!({"serial": "SN-1"}));
    let created = store(&server).await.create("db-devices", &fields).await.unwrap();
    assert_eq!(created.id, "page-1");
}

#[tokio::test]
async fn test_status_mapping() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/users/me"))
        .respond_with(ResponseTemplate::new(401).set_body_string("unauthorized"))
        .mount(&server)
        .await;
    Mock::given(method("PATCH"))
        .and(path("/v1/pages/page-1"))
        .respond_with(ResponseTemplate::new(429).insert_header("retry-after", "7"))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v1/pages"))
        .respond_with(ResponseTemplate::new(409).set_body_string("conflict"))
        .mount(&server)
        .await;

    let store = store(&server).await;
    let fields = common::rec(json!({"serial": "SN-1"}));

    assert!(matches!(
        store.ping().await.unwrap_err(),
        SyncError::Authentication { status: 401, .. }
    ));

    let throttled = store.update("db-devices", "page-1", &fields).await.unwrap_err();
    assert!(matches!(
        throttled,
        SyncError::Transient {
            cause: TransientCause::TooManyRequests,
            ..
        }
    ));
    assert_eq!(throttled.retry_after(), Some(Duration::from_secs(7)));

    let conflict = store.create("db-devices", &fields).await.unwrap_err();
    assert!(matches!(conflict, SyncError::Api { status: 409, .. }));
    assert!(!conflict.is_retryable());
}

#[tokio::test]
async fn test_unreachable_server_is_transient() {
    let server = MockServer::start().await;
    let store = store(&server).await;
    drop(server);

    let err = store.ping().await.unwrap_err();
    assert!(err.is_retryable(), "{}", err);
}
