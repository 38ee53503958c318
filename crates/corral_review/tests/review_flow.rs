//! Promotion and review pipeline end-to-end against the in-memory store.

use std::sync::Arc;

use corral_ids::IdRef;
use corral_protocol::collections as col;
use corral_resilience::{CircuitBreaker, CircuitBreakerConfig, RetryConfig};
use corral_review::{PromotionEngine, ReviewFilter, ReviewService};
use corral_store::{FindOptions, MemoryBackend, Store};
use serde_json::{json, Value};

fn test_store() -> Store {
    Store::with_breaker(
        Arc::new(MemoryBackend::new()),
        Arc::new(CircuitBreaker::new(
            "review-test",
            CircuitBreakerConfig::default(),
        )),
        RetryConfig {
            max_retries: 0,
            ..Default::default()
        },
    )
}

fn services(store: &Store) -> (Arc<PromotionEngine>, ReviewService) {
    let promotion = Arc::new(PromotionEngine::new(store.clone()));
    let service = ReviewService::new(store.clone(), promotion.clone());
    (promotion, service)
}

async fn seed_staging_and_review(
    store: &Store,
    title: &str,
    corrections: Vec<Value>,
) -> (String, String) {
    let source_id = IdRef::generate().to_hex();
    let crawl_result_id = IdRef::generate().to_hex();

    let staging_id = store
        .create(
            col::STAGING_NEWS,
            json!({
                "title": title,
                "_source_id": source_id,
                "_crawl_result_id": crawl_result_id,
                "_record_index": 0,
                "_review_status": "pending",
                "_collection_type": "news",
            }),
        )
        .await
        .unwrap()
        .to_hex();

    let review_id = store
        .create(
            col::DATA_REVIEWS,
            json!({
                "crawl_result_id": crawl_result_id,
                "source_id": source_id,
                "data_record_index": 0,
                "review_status": "pending",
                "original_data": {"title": title},
                "corrections": corrections,
                "staging_id": staging_id,
                "created_at": chrono::Utc::now().to_rfc3339(),
            }),
        )
        .await
        .unwrap()
        .to_hex();

    (staging_id, review_id)
}

#[tokio::test]
async fn approve_promotes_and_links_lineage() {
    let store = test_store();
    let (_promotion, service) = services(&store);
    let (staging_id, review_id) = seed_staging_and_review(&store, "T", vec![]).await;

    let result = service
        .bulk_approve(&[review_id.clone()], "reviewer-X", None)
        .await
        .unwrap();
    assert_eq!(result.total, 1);
    assert_eq!(result.success, 1);
    assert_eq!(result.failed, 0);

    // Review carries the production reference
    let review = store.get_required(col::DATA_REVIEWS, &review_id).await.unwrap();
    assert_eq!(review["review_status"], "approved");
    let production_id = review["production_id"].as_str().unwrap().to_string();

    // Production doc is verified and attributed
    let production = store
        .get_required(col::NEWS_ARTICLES, &production_id)
        .await
        .unwrap();
    assert_eq!(production["title"], "T");
    assert_eq!(production["_verified"], true);
    assert_eq!(production["_verified_by"], "reviewer-X");

    // Staging points forward, lineage row joins the two
    let staging = store.get_required(col::STAGING_NEWS, &staging_id).await.unwrap();
    assert_eq!(staging["_review_status"], "promoted");
    assert_eq!(staging["_promoted_to"], production_id.as_str());

    let lineage = store
        .find_one(col::DATA_LINEAGE, &json!({"staging_id": staging_id}))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(lineage["production_id"], production_id.as_str());
    assert_eq!(lineage["rolled_back"], false);
}

#[tokio::test]
async fn corrections_apply_during_promotion() {
    let store = test_store();
    let (_promotion, service) = services(&store);
    let corrections = vec![json!({"field": "title", "corrected_value": "T'"})];
    let (_staging_id, review_id) = seed_staging_and_review(&store, "T", corrections).await;

    let result = service
        .bulk_approve(&[review_id.clone()], "reviewer-X", None)
        .await
        .unwrap();
    assert_eq!(result.success, 1);

    let review = store.get_required(col::DATA_REVIEWS, &review_id).await.unwrap();
    let production_id = review["production_id"].as_str().unwrap();
    let production = store
        .get_required(col::NEWS_ARTICLES, production_id)
        .await
        .unwrap();
    assert_eq!(production["title"], "T'");
    assert_eq!(production["_has_corrections"], true);
}

#[tokio::test]
async fn rollback_restores_staging_and_marks_lineage() {
    let store = test_store();
    let (promotion, service) = services(&store);
    let (staging_id, review_id) = seed_staging_and_review(&store, "T", vec![]).await;

    service
        .bulk_approve(&[review_id.clone()], "reviewer-X", None)
        .await
        .unwrap();
    let review = store.get_required(col::DATA_REVIEWS, &review_id).await.unwrap();
    let production_id = review["production_id"].as_str().unwrap().to_string();

    let outcome = promotion
        .rollback(&production_id, "mistake", "op-1")
        .await
        .unwrap();
    assert!(outcome.ok);

    // Production doc gone
    assert!(store
        .get(col::NEWS_ARTICLES, &production_id)
        .await
        .unwrap()
        .is_none());

    // Staging reverted, forward pointer removed
    let staging = store.get_required(col::STAGING_NEWS, &staging_id).await.unwrap();
    assert_eq!(staging["_review_status"], "rolled_back");
    assert!(staging.get("_promoted_to").is_none());

    // Lineage remembers the rollback and who did it
    let lineage = store
        .find_one(col::DATA_LINEAGE, &json!({"staging_id": staging_id}))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(lineage["rolled_back"], true);
    assert_eq!(lineage["rolled_back_by"], "op-1");
}

#[tokio::test]
async fn bulk_partial_failure_accounts_for_every_id() {
    let store = test_store();
    let (_promotion, service) = services(&store);
    let (_staging_id, good_review) = seed_staging_and_review(&store, "ok", vec![]).await;

    let missing = IdRef::generate().to_hex();
    let invalid = "not-an-id".to_string();
    let ids = vec![good_review, missing.clone(), invalid.clone()];

    let result = service.bulk_approve(&ids, "reviewer-X", None).await.unwrap();

    assert_eq!(result.total, 3);
    assert_eq!(result.success + result.failed, result.total);
    assert_eq!(result.failed, 2);
    assert_eq!(result.failed_ids.len(), 2);
    assert_eq!(result.errors.len(), result.failed_ids.len());
    assert!(result.failed_ids.contains(&missing));
    assert!(result.failed_ids.contains(&invalid));
}

#[tokio::test]
async fn reject_marks_review_and_staging() {
    let store = test_store();
    let (_promotion, service) = services(&store);
    let (staging_id, review_id) = seed_staging_and_review(&store, "bad", vec![]).await;

    let result = service
        .bulk_reject(&[review_id.clone()], "reviewer-X", "unusable extraction", None)
        .await
        .unwrap();
    assert_eq!(result.success, 1);

    let review = store.get_required(col::DATA_REVIEWS, &review_id).await.unwrap();
    assert_eq!(review["review_status"], "rejected");
    assert_eq!(review["rejection_reason"], "unusable extraction");

    let staging = store.get_required(col::STAGING_NEWS, &staging_id).await.unwrap();
    assert_eq!(staging["_review_status"], "rejected");
    assert_eq!(staging["_rejected_by"], "reviewer-X");
}

#[tokio::test]
async fn revert_returns_review_to_pending_and_rolls_back() {
    let store = test_store();
    let (_promotion, service) = services(&store);
    let (staging_id, review_id) = seed_staging_and_review(&store, "T", vec![]).await;

    service
        .bulk_approve(&[review_id.clone()], "reviewer-X", None)
        .await
        .unwrap();

    let reverted = service.revert(&review_id, "lead-1").await.unwrap();
    assert_eq!(reverted["review_status"], "pending");
    assert!(reverted.get("reviewer_id").is_none());
    assert!(reverted.get("production_id").is_none());
    assert_eq!(reverted["revert_history"][0]["previous_status"], "approved");
    assert_eq!(reverted["revert_history"][0]["reverted_by"], "lead-1");

    // Promotion was undone
    let staging = store.get_required(col::STAGING_NEWS, &staging_id).await.unwrap();
    assert_eq!(staging["_review_status"], "rolled_back");

    // Audit trail entry exists
    let audits = store
        .find(
            col::REVIEW_AUDIT_LOG,
            &json!({"review_id": review_id}),
            FindOptions::default(),
        )
        .await
        .unwrap();
    assert_eq!(audits.len(), 1);
}

#[tokio::test]
async fn filter_approval_respects_confidence_floor() {
    let store = test_store();
    let (_promotion, service) = services(&store);

    let (_s1, high) = seed_staging_and_review(&store, "high", vec![]).await;
    store
        .update_by_id(col::DATA_REVIEWS, &high, &json!({"$set": {"confidence_score": 0.95}}))
        .await
        .unwrap();
    let (_s2, low) = seed_staging_and_review(&store, "low", vec![]).await;
    store
        .update_by_id(col::DATA_REVIEWS, &low, &json!({"$set": {"confidence_score": 0.40}}))
        .await
        .unwrap();

    let filter = ReviewFilter {
        confidence_min: Some(0.9),
        ..Default::default()
    };
    let result = service.bulk_approve_by_filter(&filter, "reviewer-X").await.unwrap();
    assert_eq!(result.total, 1);
    assert_eq!(result.success, 1);

    assert_eq!(
        store
            .get_required(col::DATA_REVIEWS, &high)
            .await
            .unwrap()["review_status"],
        "approved"
    );
    assert_eq!(
        store.get_required(col::DATA_REVIEWS, &low).await.unwrap()["review_status"],
        "pending"
    );
}

#[tokio::test]
async fn resume_info_tracks_bookmark_position() {
    let store = test_store();
    let (_promotion, service) = services(&store);

    let (_s1, first) = seed_staging_and_review(&store, "one", vec![]).await;
    // Later reviews created strictly after the first
    tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    seed_staging_and_review(&store, "two", vec![]).await;
    tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    seed_staging_and_review(&store, "three", vec![]).await;

    let before = service.resume_info("reviewer-X").await.unwrap();
    assert_eq!(before["has_bookmark"], false);
    assert_eq!(before["total_pending"], 3);

    service
        .bulk_approve(&[first], "reviewer-X", None)
        .await
        .unwrap();

    let after = service.resume_info("reviewer-X").await.unwrap();
    assert_eq!(after["has_bookmark"], true);
    assert_eq!(after["total_pending"], 2);
    assert_eq!(after["remaining_after_bookmark"], 2);
}

#[tokio::test]
async fn next_walks_the_pending_queue() {
    let store = test_store();
    let (_promotion, service) = services(&store);

    let (_s1, first) = seed_staging_and_review(&store, "one", vec![]).await;
    tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    let (_s2, second) = seed_staging_and_review(&store, "two", vec![]).await;

    let forward = service
        .next("reviewer-X", Some(&first), None, false)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(forward["_id"], second.as_str());

    let backward = service
        .next("reviewer-X", Some(&second), None, true)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(backward["_id"], first.as_str());
}

#[tokio::test]
async fn reviews_seed_from_crawl_result_idempotently() {
    let store = test_store();
    let (_promotion, service) = services(&store);

    let crawl_result_id = store
        .create(
            col::CRAWL_RESULTS,
            json!({
                "source_id": IdRef::generate().to_hex(),
                "status": "success",
                "data": [
                    {"title": "a", "confidence": 0.7},
                    {"title": "b", "ocr_confidence": 0.4, "needs_number_review": true},
                ],
            }),
        )
        .await
        .unwrap()
        .to_hex();

    let created = service
        .create_reviews_from_crawl_result(&crawl_result_id)
        .await
        .unwrap();
    assert_eq!(created, 2);

    // Second pass upserts, creating nothing new
    let again = service
        .create_reviews_from_crawl_result(&crawl_result_id)
        .await
        .unwrap();
    assert_eq!(again, 0);

    let reviews = store
        .find(
            col::DATA_REVIEWS,
            &json!({"crawl_result_id": crawl_result_id}),
            FindOptions::sorted("data_record_index", 1),
        )
        .await
        .unwrap();
    assert_eq!(reviews.len(), 2);
    assert_eq!(reviews[0]["confidence_score"], 0.7);
    assert_eq!(reviews[1]["needs_number_review"], true);
}

#[tokio::test]
async fn staging_cleanup_removes_only_old_promoted() {
    let store = test_store();
    let (promotion, service) = services(&store);

    let (staging_id, review_id) = seed_staging_and_review(&store, "old", vec![]).await;
    service
        .bulk_approve(&[review_id], "reviewer-X", None)
        .await
        .unwrap();

    // Backdate the promotion far past the cutoff
    store
        .update_by_id(
            col::STAGING_NEWS,
            &staging_id,
            &json!({"$set": {"_promoted_at": "2020-01-01T00:00:00+00:00"}}),
        )
        .await
        .unwrap();
    // A fresh pending record must survive
    seed_staging_and_review(&store, "fresh", vec![]).await;

    let deleted = promotion.cleanup_old_staging(30).await.unwrap();
    assert_eq!(deleted, 1);
    assert_eq!(store.count(col::STAGING_NEWS, &json!({})).await.unwrap(), 1);
}
