//! Bulk review operations, session resume, and review lifecycle.
//!
//! Bulk calls validate ids up front, process in batches of 100, and report
//! per-id outcomes in a [`BulkOperationResult`] rather than failing as a
//! whole. Reviewer bookmarks make the queue resumable across sessions.

use chrono::Utc;
use corral_ids::IdRef;
use corral_protocol::collections as col;
use corral_protocol::{CoreError, CoreResult};
use corral_store::{FindOptions, Store};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{info, warn};

use crate::promotion::PromotionEngine;

/// Batch size for bulk review processing.
const BATCH_SIZE: usize = 100;

/// Per-id outcome summary of a bulk operation.
///
/// Invariant: `success + failed == total`, and every id in `failed_ids`
/// has exactly one entry in `errors`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BulkOperationResult {
    pub total: u64,
    pub success: u64,
    pub failed: u64,
    pub failed_ids: Vec<String>,
    pub errors: Vec<String>,
}

impl BulkOperationResult {
    fn sized(total: usize) -> Self {
        Self {
            total: total as u64,
            ..Default::default()
        }
    }

    fn fail(&mut self, id: &str, error: impl Into<String>) {
        self.failed += 1;
        self.failed_ids.push(id.to_string());
        self.errors.push(error.into());
    }

    fn absorb(&mut self, other: BulkOperationResult) {
        self.success += other.success;
        self.failed += other.failed;
        self.failed_ids.extend(other.failed_ids);
        self.errors.extend(other.errors);
    }
}

/// Filter for queue-wide bulk approval.
#[derive(Debug, Clone, Deserialize)]
pub struct ReviewFilter {
    pub source_id: Option<String>,
    pub confidence_min: Option<f64>,
    pub date_from: Option<String>,
    pub date_to: Option<String>,
    #[serde(default = "default_filter_limit")]
    pub limit: u64,
    pub comment: Option<String>,
}

impl Default for ReviewFilter {
    fn default() -> Self {
        Self {
            source_id: None,
            confidence_min: None,
            date_from: None,
            date_to: None,
            limit: default_filter_limit(),
            comment: None,
        }
    }
}

fn default_filter_limit() -> u64 {
    500
}

/// Review queue service.
pub struct ReviewService {
    store: Store,
    promotion: Arc<PromotionEngine>,
}

impl ReviewService {
    pub fn new(store: Store, promotion: Arc<PromotionEngine>) -> Self {
        Self { store, promotion }
    }

    /// Approve a set of reviews, promoting each staged record.
    pub async fn bulk_approve(
        &self,
        review_ids: &[String],
        reviewer_id: &str,
        comment: Option<&str>,
    ) -> CoreResult<BulkOperationResult> {
        let mut result = BulkOperationResult::sized(review_ids.len());

        let mut valid_ids = Vec::new();
        for raw in review_ids {
            match IdRef::parse(raw) {
                Ok(_) => valid_ids.push(raw.clone()),
                Err(e) => result.fail(raw, format!("Invalid identifier: {e}")),
            }
        }

        for batch in valid_ids.chunks(BATCH_SIZE) {
            let batch_result = self.approve_batch(batch, reviewer_id, comment).await?;
            result.absorb(batch_result);
        }

        info!(
            total = result.total,
            success = result.success,
            failed = result.failed,
            "bulk approve completed"
        );
        Ok(result)
    }

    async fn approve_batch(
        &self,
        batch: &[String],
        reviewer_id: &str,
        comment: Option<&str>,
    ) -> CoreResult<BulkOperationResult> {
        let mut result = BulkOperationResult::default();
        let now = Utc::now().to_rfc3339();

        let reviews = self
            .store
            .find(
                col::DATA_REVIEWS,
                &json!({"_id": {"$in": batch}, "review_status": "pending"}),
                FindOptions::default(),
            )
            .await?;

        let found: Vec<&str> = reviews
            .iter()
            .filter_map(|r| r.get("_id").and_then(Value::as_str))
            .collect();
        for id in batch {
            if !found.contains(&id.as_str()) {
                result.fail(id, format!("Review not found or not pending: {id}"));
            }
        }
        if reviews.is_empty() {
            return Ok(result);
        }

        let mut update = json!({"$set": {
            "review_status": "approved",
            "reviewer_id": reviewer_id,
            "reviewed_at": now,
            "updated_at": now,
        }});
        if let Some(comment) = comment {
            update["$set"]["notes"] = json!(comment);
        }
        self.store
            .update_many(col::DATA_REVIEWS, &json!({"_id": {"$in": found}}), &update)
            .await?;

        for review in &reviews {
            let review_id = review
                .get("_id")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            let staging_id = review.get("staging_id").and_then(Value::as_str);

            match staging_id {
                Some(staging_id) => {
                    let corrections: Option<Vec<Value>> = review
                        .get("corrections")
                        .and_then(Value::as_array)
                        .filter(|c| !c.is_empty())
                        .cloned();
                    let outcome = self
                        .promotion
                        .promote(staging_id, reviewer_id, corrections.as_deref())
                        .await?;

                    if outcome.ok {
                        self.store
                            .update_one(
                                col::DATA_REVIEWS,
                                &json!({"_id": review_id}),
                                &json!({"$set": {
                                    "production_id": outcome.production_id,
                                    "promoted_at": now,
                                }}),
                            )
                            .await?;
                        result.success += 1;
                    } else {
                        result.fail(&review_id, format!("Promotion failed: {}", outcome.message));
                    }
                }
                // Legacy reviews without a staging reference still approve
                None => result.success += 1,
            }
        }

        self.set_bookmark(reviewer_id, found.last().unwrap_or(&"")).await?;
        Ok(result)
    }

    /// Reject a set of reviews and mark their staging records.
    pub async fn bulk_reject(
        &self,
        review_ids: &[String],
        reviewer_id: &str,
        reason: &str,
        comment: Option<&str>,
    ) -> CoreResult<BulkOperationResult> {
        let mut result = BulkOperationResult::sized(review_ids.len());

        let mut valid_ids = Vec::new();
        for raw in review_ids {
            match IdRef::parse(raw) {
                Ok(_) => valid_ids.push(raw.clone()),
                Err(e) => result.fail(raw, format!("Invalid identifier: {e}")),
            }
        }

        let now = Utc::now().to_rfc3339();
        for batch in valid_ids.chunks(BATCH_SIZE) {
            let reviews = self
                .store
                .find(
                    col::DATA_REVIEWS,
                    &json!({"_id": {"$in": batch}, "review_status": "pending"}),
                    FindOptions::default(),
                )
                .await?;

            let found: Vec<&str> = reviews
                .iter()
                .filter_map(|r| r.get("_id").and_then(Value::as_str))
                .collect();
            for id in batch {
                if !found.contains(&id.as_str()) {
                    result.fail(id, format!("Review not found or not pending: {id}"));
                }
            }
            if reviews.is_empty() {
                continue;
            }

            let mut update = json!({"$set": {
                "review_status": "rejected",
                "reviewer_id": reviewer_id,
                "reviewed_at": now,
                "updated_at": now,
                "rejection_reason": reason,
            }});
            if let Some(comment) = comment {
                update["$set"]["notes"] = json!(comment);
            }
            let modified = self
                .store
                .update_many(col::DATA_REVIEWS, &json!({"_id": {"$in": found}}), &update)
                .await?;
            result.success += modified;

            for review in &reviews {
                if let Some(staging_id) = review.get("staging_id").and_then(Value::as_str) {
                    for staging in crate::promotion::staging_collections() {
                        self.store
                            .update_one(
                                staging,
                                &json!({"_id": staging_id}),
                                &json!({"$set": {
                                    "_review_status": "rejected",
                                    "_rejection_reason": reason,
                                    "_rejected_at": now,
                                    "_rejected_by": reviewer_id,
                                }}),
                            )
                            .await?;
                    }
                }
            }
        }

        info!(
            total = result.total,
            success = result.success,
            failed = result.failed,
            "bulk reject completed"
        );
        Ok(result)
    }

    /// Approve everything matching a filter, capped at `filter.limit`.
    ///
    /// The slices handed to `bulk_approve` are the single chunking layer;
    /// each slice is at most one batch.
    pub async fn bulk_approve_by_filter(
        &self,
        filter: &ReviewFilter,
        reviewer_id: &str,
    ) -> CoreResult<BulkOperationResult> {
        let query = build_filter_query(filter)?;
        let reviews = self
            .store
            .find(
                col::DATA_REVIEWS,
                &query,
                FindOptions::default().with_limit(filter.limit),
            )
            .await?;

        if reviews.is_empty() {
            return Ok(BulkOperationResult::default());
        }

        let review_ids: Vec<String> = reviews
            .iter()
            .filter_map(|r| r.get("_id").and_then(Value::as_str))
            .map(str::to_string)
            .collect();

        let mut result = BulkOperationResult::sized(review_ids.len());
        for slice in review_ids.chunks(BATCH_SIZE) {
            let slice_result = self
                .bulk_approve(slice, reviewer_id, filter.comment.as_deref())
                .await?;
            result.absorb(slice_result);
        }

        info!(
            total = result.total,
            success = result.success,
            "bulk approve by filter completed"
        );
        Ok(result)
    }

    /// Count reviews a filter would touch.
    pub async fn count_by_filter(&self, filter: &ReviewFilter) -> CoreResult<u64> {
        let query = build_filter_query(filter)?;
        self.store.count(col::DATA_REVIEWS, &query).await
    }

    /// Send a non-pending review back to pending, rolling back its
    /// promotion when one happened.
    pub async fn revert(&self, review_id: &str, reviewer_id: &str) -> CoreResult<Value> {
        let review = self.store.get_required(col::DATA_REVIEWS, review_id).await?;
        let status = review
            .get("review_status")
            .and_then(Value::as_str)
            .unwrap_or("pending");
        if status == "pending" {
            return Err(CoreError::DatabaseOperation(
                "Review is already pending; nothing to revert".into(),
            ));
        }

        if let Some(production_id) = review.get("production_id").and_then(Value::as_str) {
            let outcome = self
                .promotion
                .rollback(production_id, "review reverted", reviewer_id)
                .await?;
            if !outcome.ok {
                warn!(review_id, message = %outcome.message, "rollback during revert failed");
            }
        }

        let now = Utc::now().to_rfc3339();
        self.store
            .update_one(
                col::DATA_REVIEWS,
                &json!({"_id": review_id}),
                &json!({
                    "$set": {"review_status": "pending", "updated_at": now},
                    "$unset": {
                        "reviewer_id": "",
                        "reviewed_at": "",
                        "production_id": "",
                        "promoted_at": "",
                        "rejection_reason": "",
                    },
                    "$push": {"revert_history": {
                        "previous_status": status,
                        "reverted_by": reviewer_id,
                        "reverted_at": now,
                    }},
                }),
            )
            .await?;

        self.store
            .create(
                col::REVIEW_AUDIT_LOG,
                json!({
                    "review_id": review_id,
                    "action": "revert",
                    "previous_status": status,
                    "actor": reviewer_id,
                    "at": now,
                }),
            )
            .await?;

        info!(review_id, previous_status = status, "review reverted");
        self.store.get_required(col::DATA_REVIEWS, review_id).await
    }

    /// The adjacent pending review by `created_at`.
    ///
    /// `current_id` defaults to the reviewer bookmark. Going backward with
    /// no pending predecessor surfaces the most recent completed review so
    /// the reviewer keeps context.
    pub async fn next(
        &self,
        reviewer_id: &str,
        current_id: Option<&str>,
        source_id: Option<&str>,
        backward: bool,
    ) -> CoreResult<Option<Value>> {
        let current_id = match current_id {
            Some(id) => Some(id.to_string()),
            None => self
                .bookmark(reviewer_id)
                .await?
                .and_then(|b| b.get("last_review_id").and_then(Value::as_str).map(str::to_string)),
        };

        let current_created_at = match &current_id {
            Some(id) => self
                .store
                .get(col::DATA_REVIEWS, id)
                .await?
                .and_then(|r| r.get("created_at").cloned()),
            None => None,
        };

        let mut query = json!({"review_status": "pending"});
        if let Some(source_id) = source_id {
            query["source_id"] = json!(source_id);
        }
        if let Some(created_at) = &current_created_at {
            query["created_at"] = if backward {
                json!({"$lt": created_at})
            } else {
                json!({"$gt": created_at})
            };
        }

        let direction = if backward { -1 } else { 1 };
        let found = self
            .store
            .find(
                col::DATA_REVIEWS,
                &query,
                FindOptions::sorted("created_at", direction).with_limit(1),
            )
            .await?;

        if let Some(review) = found.into_iter().next() {
            return Ok(Some(review));
        }

        if backward {
            // Nothing pending behind: show the latest completed review
            let mut done_query = json!({"review_status": {"$ne": "pending"}});
            if let Some(source_id) = source_id {
                done_query["source_id"] = json!(source_id);
            }
            let done = self
                .store
                .find(
                    col::DATA_REVIEWS,
                    &done_query,
                    FindOptions::sorted("reviewed_at", -1).with_limit(1),
                )
                .await?;
            return Ok(done.into_iter().next());
        }

        Ok(None)
    }

    /// Where the reviewer left off, with remaining-work counters.
    pub async fn resume_info(&self, reviewer_id: &str) -> CoreResult<Value> {
        let total_pending = self
            .store
            .count(col::DATA_REVIEWS, &json!({"review_status": "pending"}))
            .await?;

        let Some(bookmark) = self.bookmark(reviewer_id).await? else {
            return Ok(json!({
                "has_bookmark": false,
                "last_review_id": null,
                "last_reviewed_at": null,
                "remaining_after_bookmark": total_pending,
                "total_pending": total_pending,
            }));
        };

        let last_review_id = bookmark.get("last_review_id").and_then(Value::as_str);
        let last_created_at = match last_review_id {
            Some(id) => self
                .store
                .get(col::DATA_REVIEWS, id)
                .await
                .ok()
                .flatten()
                .and_then(|r| r.get("created_at").cloned()),
            None => None,
        };

        let remaining = match &last_created_at {
            Some(created_at) => {
                self.store
                    .count(
                        col::DATA_REVIEWS,
                        &json!({"review_status": "pending", "created_at": {"$gt": created_at}}),
                    )
                    .await?
            }
            None => total_pending,
        };

        Ok(json!({
            "has_bookmark": true,
            "last_review_id": last_review_id,
            "last_reviewed_at": bookmark.get("last_reviewed_at").cloned().unwrap_or(Value::Null),
            "remaining_after_bookmark": remaining,
            "total_pending": total_pending,
        }))
    }

    /// Record the reviewer's position.
    pub async fn set_bookmark(&self, reviewer_id: &str, review_id: &str) -> CoreResult<()> {
        if review_id.is_empty() {
            return Ok(());
        }
        self.store
            .upsert_one(
                col::REVIEWER_BOOKMARKS,
                &json!({"reviewer_id": reviewer_id}),
                &json!({"$set": {
                    "last_review_id": review_id,
                    "last_reviewed_at": Utc::now().to_rfc3339(),
                }}),
            )
            .await?;
        Ok(())
    }

    async fn bookmark(&self, reviewer_id: &str) -> CoreResult<Option<Value>> {
        self.store
            .find_one(col::REVIEWER_BOOKMARKS, &json!({"reviewer_id": reviewer_id}))
            .await
    }

    /// Seed pending reviews for every record of a crawl result, idempotent
    /// by `(crawl_result_id, data_record_index)`.
    pub async fn create_reviews_from_crawl_result(
        &self,
        crawl_result_id: &str,
    ) -> CoreResult<u64> {
        let crawl_result = self
            .store
            .get_required(col::CRAWL_RESULTS, crawl_result_id)
            .await?;
        let records = crawl_result
            .get("data")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        let source_id = crawl_result.get("source_id").cloned().unwrap_or(Value::Null);

        let now = Utc::now().to_rfc3339();
        let mut created = 0;
        for (index, record) in records.iter().enumerate() {
            let mut set = json!({
                "source_id": source_id,
                "review_status": "pending",
                "original_data": record,
                "corrections": [],
                "created_at": now,
            });
            // Confidence signals from the extractor, when present
            for key in [
                "confidence",
                "ocr_confidence",
                "ai_confidence",
                "needs_number_review",
                "uncertain_numbers",
                "_highlights",
            ] {
                if let Some(value) = record.get(key) {
                    let target = if key == "confidence" {
                        "confidence_score"
                    } else {
                        key
                    };
                    set[target] = value.clone();
                }
            }
            if let Some(staging_id) = record.get("_staging_id") {
                set["staging_id"] = staging_id.clone();
            }

            let outcome = self
                .store
                .upsert_one(
                    col::DATA_REVIEWS,
                    &json!({
                        "crawl_result_id": crawl_result_id,
                        "data_record_index": index,
                    }),
                    &json!({"$set": set}),
                )
                .await?;
            if outcome.upserted_id.is_some() {
                created += 1;
            }
        }

        info!(crawl_result_id, created, total = records.len(), "reviews seeded");
        Ok(created)
    }
}

fn build_filter_query(filter: &ReviewFilter) -> CoreResult<Value> {
    let mut query = json!({"review_status": "pending"});

    if let Some(source_id) = &filter.source_id {
        IdRef::parse(source_id)?;
        query["source_id"] = json!(source_id);
    }
    if let Some(confidence_min) = filter.confidence_min {
        query["confidence_score"] = json!({"$gte": confidence_min});
    }
    if filter.date_from.is_some() || filter.date_to.is_some() {
        let mut range = json!({});
        if let Some(from) = &filter.date_from {
            range["$gte"] = json!(from);
        }
        if let Some(to) = &filter.date_to {
            range["$lte"] = json!(to);
        }
        query["created_at"] = range;
    }
    Ok(query)
}
