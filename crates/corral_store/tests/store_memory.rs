//! Store gateway behavior against the in-memory engine.

use std::sync::Arc;

use corral_protocol::collections as col;
use corral_protocol::CoreError;
use corral_resilience::{CircuitBreaker, CircuitBreakerConfig, RetryConfig};
use corral_store::{FindOptions, MemoryBackend, Store};
use serde_json::json;

fn test_store() -> Store {
    Store::with_breaker(
        Arc::new(MemoryBackend::new()),
        Arc::new(CircuitBreaker::new(
            "store-test",
            CircuitBreakerConfig::default(),
        )),
        RetryConfig {
            max_retries: 0,
            ..Default::default()
        },
    )
}

#[tokio::test]
async fn invalid_id_surfaces_as_client_error() {
    let store = test_store();
    let err = store.get(col::SOURCES, "not-an-id").await.unwrap_err();
    assert!(matches!(err, CoreError::InvalidIdentifier(_)));

    let err = store
        .update_by_id(col::SOURCES, "123", &json!({"$set": {"x": 1}}))
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::InvalidIdentifier(_)));
}

#[tokio::test]
async fn get_required_distinguishes_not_found() {
    let store = test_store();
    let missing = corral_ids::IdRef::generate().to_hex();
    let err = store.get_required(col::SOURCES, &missing).await.unwrap_err();
    assert!(matches!(err, CoreError::NotFound(_)));

    // List queries return empty rather than erroring
    let rows = store
        .find(col::SOURCES, &json!({"status": "active"}), FindOptions::default())
        .await
        .unwrap();
    assert!(rows.is_empty());
}

#[tokio::test]
async fn unique_source_name_enforced_after_index_bootstrap() {
    let store = test_store();
    store.ensure_indexes().await.unwrap();

    store
        .create(col::SOURCES, json!({"name": "krx", "status": "pending"}))
        .await
        .unwrap();
    let err = store
        .create(col::SOURCES, json!({"name": "krx", "status": "pending"}))
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::DuplicateKey(_)));
}

#[tokio::test]
async fn cascade_delete_removes_children_first() {
    let store = test_store();
    let source_id = store
        .create(col::SOURCES, json!({"name": "s1", "status": "active"}))
        .await
        .unwrap()
        .to_hex();

    for _ in 0..3 {
        store
            .create(col::CRAWL_RESULTS, json!({"source_id": source_id, "status": "success"}))
            .await
            .unwrap();
    }
    store
        .create(col::CRAWLERS, json!({"source_id": source_id, "status": "active"}))
        .await
        .unwrap();

    let deletion = store.delete_source(&source_id).await.unwrap();
    assert!(deletion.source_deleted);
    assert_eq!(deletion.children_deleted[col::CRAWL_RESULTS], 3);
    assert_eq!(deletion.children_deleted[col::CRAWLERS], 1);

    assert_eq!(store.count(col::CRAWL_RESULTS, &json!({})).await.unwrap(), 0);
    assert_eq!(store.count(col::SOURCES, &json!({})).await.unwrap(), 0);
}

#[tokio::test]
async fn orphan_sweep_reaps_children_without_parent() {
    let store = test_store();
    let live = store
        .create(col::SOURCES, json!({"name": "live", "status": "active"}))
        .await
        .unwrap()
        .to_hex();
    let dead = corral_ids::IdRef::generate().to_hex();

    store
        .create(col::CRAWL_RESULTS, json!({"source_id": live}))
        .await
        .unwrap();
    store
        .create(col::CRAWL_RESULTS, json!({"source_id": dead}))
        .await
        .unwrap();

    let reaped = store.reap_orphans().await.unwrap();
    assert_eq!(reaped[col::CRAWL_RESULTS], 1);
    assert_eq!(store.count(col::CRAWL_RESULTS, &json!({})).await.unwrap(), 1);
}

#[tokio::test]
async fn at_most_one_crawler_stays_active() {
    let store = test_store();
    let source_id = store
        .create(col::SOURCES, json!({"name": "s1", "status": "active"}))
        .await
        .unwrap()
        .to_hex();

    let old = store
        .create(
            col::CRAWLERS,
            json!({"source_id": source_id, "version": 1, "status": "active"}),
        )
        .await
        .unwrap()
        .to_hex();
    let new = store
        .create(
            col::CRAWLERS,
            json!({"source_id": source_id, "version": 2, "status": "inactive"}),
        )
        .await
        .unwrap()
        .to_hex();

    assert!(store.activate_crawler(&source_id, &new).await.unwrap());

    let active = store
        .find(
            col::CRAWLERS,
            &json!({"source_id": source_id, "status": "active"}),
            FindOptions::default(),
        )
        .await
        .unwrap();
    assert_eq!(active.len(), 1);
    assert_eq!(active[0]["_id"], new.as_str());

    let demoted = store.get_required(col::CRAWLERS, &old).await.unwrap();
    assert_eq!(demoted["status"], "inactive");
}

#[tokio::test]
async fn error_log_resolves_exactly_once() {
    let store = test_store();
    let error_id = store
        .create(
            col::ERROR_LOGS,
            json!({
                "source_id": corral_ids::IdRef::generate().to_hex(),
                "error_code": "E101",
                "message": "selector drift",
                "resolved": false,
                "created_at": chrono::Utc::now().to_rfc3339(),
            }),
        )
        .await
        .unwrap()
        .to_hex();

    assert!(store
        .resolve_error_log(&error_id, "manual", Some("fixed selector"))
        .await
        .unwrap());

    // A second resolution is a no-op
    assert!(!store
        .resolve_error_log(&error_id, "auto", None)
        .await
        .unwrap());

    let resolved = store.get_required(col::ERROR_LOGS, &error_id).await.unwrap();
    assert_eq!(resolved["resolution_method"], "manual");
    assert_eq!(resolved["resolution_detail"], "fixed selector");
}

#[tokio::test]
async fn health_check_reports_engine() {
    let store = test_store();
    let health = store.health_check().await;
    assert_eq!(health.status, "healthy");
    assert_eq!(health.database, "memory");
    assert!(health.error.is_none());
}

#[tokio::test]
async fn dashboard_stats_are_idempotent_on_unchanged_store() {
    let store = test_store();
    store
        .create(col::SOURCES, json!({"name": "a", "status": "active"}))
        .await
        .unwrap();
    store
        .create(col::SOURCES, json!({"name": "b", "status": "pending"}))
        .await
        .unwrap();
    store
        .create(col::CRAWL_RESULTS, json!({"status": "success", "record_count": 10, "executed_at": chrono::Utc::now().to_rfc3339()}))
        .await
        .unwrap();
    store
        .create(col::CRAWL_RESULTS, json!({"status": "failed", "record_count": 0, "executed_at": chrono::Utc::now().to_rfc3339()}))
        .await
        .unwrap();

    let first = store.dashboard_stats().await.unwrap();
    let second = store.dashboard_stats().await.unwrap();

    assert_eq!(first.sources.total, 2);
    assert_eq!(first.executions.total, 2);
    assert_eq!(first.executions_last_24h, 2);
    assert_eq!(first.records_collected, 10);
    assert_eq!(first.sources.by_status, second.sources.by_status);
    assert_eq!(first.executions.by_status, second.executions.by_status);
    assert_eq!(first.health_score, second.health_score);
}
