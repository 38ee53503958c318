//! Staging-to-production promotion.
//!
//! Each payload family maps to a `(staging, production)` collection pair.
//! Promotion copies the reviewed record into production, stamps both sides
//! with back-references, and writes a `data_lineage` row as the audit
//! trail. There are no multi-document transactions: the lineage row is the
//! source of truth for "moved", and the staging cleanup sweep reconciles
//! anything left half-done.

use chrono::{Duration, Utc};
use corral_ids::IdRef;
use corral_protocol::collections as col;
use corral_protocol::CoreResult;
use corral_store::Store;
use serde::Serialize;
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{error, info};

/// `(type key, staging collection, production collection)`.
pub const COLLECTION_MAPPING: &[(&str, &str, &str)] = &[
    ("news", col::STAGING_NEWS, col::NEWS_ARTICLES),
    ("financial", col::STAGING_FINANCIAL, col::FINANCIAL_DATA),
    ("stock", col::STAGING_FINANCIAL, col::STOCK_PRICES),
    ("exchange", col::STAGING_FINANCIAL, col::EXCHANGE_RATES),
    ("market", col::STAGING_FINANCIAL, col::MARKET_INDICES),
    ("announcement", col::STAGING_DATA, col::ANNOUNCEMENTS),
    ("generic", col::STAGING_DATA, col::CRAWL_DATA),
];

/// Resolve a type key to its collection pair; unknown keys fall back to
/// `generic`.
pub fn mapping_for(type_key: &str) -> (&'static str, &'static str) {
    COLLECTION_MAPPING
        .iter()
        .find(|(key, _, _)| *key == type_key)
        .or_else(|| COLLECTION_MAPPING.iter().find(|(key, _, _)| *key == "generic"))
        .map(|(_, staging, production)| (*staging, *production))
        .expect("generic mapping always present")
}

/// Distinct staging collections, search order preserved.
pub fn staging_collections() -> Vec<&'static str> {
    let mut seen = Vec::new();
    for (_, staging, _) in COLLECTION_MAPPING {
        if !seen.contains(staging) {
            seen.push(*staging);
        }
    }
    seen
}

/// Pick a type key from source name/url substrings.
pub fn determine_type_from_hints(name: &str, url: &str) -> &'static str {
    let name = name.to_lowercase();
    let url = url.to_lowercase();
    let haystack = format!("{name} {url}");

    let news_kw = ["news", "뉴스", "article", "기사"];
    let financial_kw = ["stock", "주식", "finance", "금융"];
    let announcement_kw = ["공시", "disclosure", "announcement"];

    if news_kw.iter().any(|kw| haystack.contains(kw)) {
        "news"
    } else if financial_kw.iter().any(|kw| haystack.contains(kw)) {
        "financial"
    } else if announcement_kw.iter().any(|kw| haystack.contains(kw)) {
        "announcement"
    } else {
        "generic"
    }
}

/// Outcome of one promotion attempt.
#[derive(Debug, Clone, Serialize)]
pub struct PromotionOutcome {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub production_id: Option<String>,
    pub message: String,
}

impl PromotionOutcome {
    fn failure(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            production_id: None,
            message: message.into(),
        }
    }
}

/// Summary of a batch promotion.
#[derive(Debug, Clone, Serialize)]
pub struct BatchPromotionOutcome {
    pub total: u64,
    pub success: u64,
    pub failed: u64,
    pub errors: Vec<Value>,
}

/// Moves reviewed records from staging into production.
pub struct PromotionEngine {
    store: Store,
    /// Per-staging-id serialization for promote/rollback
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl PromotionEngine {
    pub fn new(store: Store) -> Self {
        Self {
            store,
            locks: Mutex::new(HashMap::new()),
        }
    }

    async fn staging_lock(&self, staging_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks
            .entry(staging_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Choose the collection type for a source.
    pub async fn determine_type(&self, source_id: &str) -> CoreResult<&'static str> {
        let Some(source) = self.store.get(col::SOURCES, source_id).await? else {
            return Ok("generic");
        };
        let name = source.get("name").and_then(Value::as_str).unwrap_or("");
        let url = source.get("url").and_then(Value::as_str).unwrap_or("");
        Ok(determine_type_from_hints(name, url))
    }

    /// Write one extracted record to its staging collection.
    pub async fn save_to_staging(
        &self,
        data: &Value,
        source_id: &str,
        crawl_result_id: &str,
        record_index: u64,
        collection_type: Option<&str>,
    ) -> CoreResult<IdRef> {
        let type_key = match collection_type {
            Some(key) => key.to_string(),
            None => self.determine_type(source_id).await?.to_string(),
        };
        let (staging, _) = mapping_for(&type_key);

        let now = Utc::now().to_rfc3339();
        let mut doc = data.as_object().cloned().unwrap_or_default();
        doc.insert("_source_id".into(), json!(source_id));
        doc.insert("_crawl_result_id".into(), json!(crawl_result_id));
        doc.insert("_record_index".into(), json!(record_index));
        doc.insert("_review_status".into(), json!("pending"));
        doc.insert("_collection_type".into(), json!(type_key));
        doc.insert("_crawled_at".into(), json!(now));
        doc.insert("_staged_at".into(), json!(now));

        let id = self.store.create(staging, Value::Object(doc)).await?;
        info!(collection = staging, staging_id = %id, "saved to staging");
        Ok(id)
    }

    /// Promote one staging record.
    ///
    /// Steps: locate staging doc, build the production document (corrections
    /// applied), insert it, mark staging promoted, write the lineage row.
    /// Every failure short-circuits into a failed outcome; a promoted
    /// staging record without a lineage row is a rollback opportunity for
    /// the reconciliation sweep.
    pub async fn promote(
        &self,
        staging_id: &str,
        reviewer_id: &str,
        corrections: Option<&[Value]>,
    ) -> CoreResult<PromotionOutcome> {
        IdRef::parse(staging_id)?;
        let lock = self.staging_lock(staging_id).await;
        let _guard = lock.lock().await;

        // First hit across the mapped staging collections wins
        let mut staging_doc = None;
        let mut staging_collection = "";
        for staging in staging_collections() {
            if let Some(doc) = self
                .store
                .find_one(staging, &json!({"_id": staging_id}))
                .await?
            {
                staging_doc = Some(doc);
                staging_collection = staging;
                break;
            }
        }
        let Some(staging_doc) = staging_doc else {
            return Ok(PromotionOutcome::failure("Staging record not found"));
        };

        let type_key = staging_doc
            .get("_collection_type")
            .and_then(Value::as_str)
            .unwrap_or("generic");
        let (_, production_collection) = mapping_for(type_key);

        let production_doc = build_production_doc(&staging_doc, staging_id, reviewer_id, corrections);

        let production_id = match self
            .store
            .create(production_collection, Value::Object(production_doc))
            .await
        {
            Ok(id) => id.to_hex(),
            Err(e) => {
                error!(staging_id, error = %e, "production insert failed");
                return Ok(PromotionOutcome::failure(e.to_string()));
            }
        };

        let now = Utc::now().to_rfc3339();
        if let Err(e) = self
            .store
            .update_one(
                staging_collection,
                &json!({"_id": staging_id}),
                &json!({"$set": {
                    "_review_status": "promoted",
                    "_promoted_to": production_id,
                    "_promoted_at": now,
                }}),
            )
            .await
        {
            error!(staging_id, error = %e, "staging status update failed");
            return Ok(PromotionOutcome::failure(e.to_string()));
        }

        let lineage = json!({
            "staging_id": staging_id,
            "staging_collection": staging_collection,
            "production_id": production_id,
            "production_collection": production_collection,
            "source_id": staging_doc.get("_source_id").cloned().unwrap_or(Value::Null),
            "crawl_result_id": staging_doc.get("_crawl_result_id").cloned().unwrap_or(Value::Null),
            "reviewer_id": reviewer_id,
            "has_corrections": corrections.map(|c| !c.is_empty()).unwrap_or(false),
            "corrections": corrections.unwrap_or(&[]),
            "rolled_back": false,
            "moved_at": now,
        });
        if let Err(e) = self.store.create(col::DATA_LINEAGE, lineage).await {
            error!(staging_id, error = %e, "lineage insert failed");
            return Ok(PromotionOutcome::failure(e.to_string()));
        }

        info!(
            from = staging_collection,
            to = production_collection,
            staging_id,
            production_id = %production_id,
            "promoted to production"
        );
        Ok(PromotionOutcome {
            ok: true,
            production_id: Some(production_id),
            message: "Successfully promoted to production".into(),
        })
    }

    /// Undo a promotion: delete the production doc, revert the staging
    /// record, and mark the lineage row rolled back.
    pub async fn rollback(
        &self,
        production_id: &str,
        reason: &str,
        operator_id: &str,
    ) -> CoreResult<PromotionOutcome> {
        IdRef::parse(production_id)?;

        let Some(lineage) = self
            .store
            .find_one(col::DATA_LINEAGE, &json!({"production_id": production_id}))
            .await?
        else {
            return Ok(PromotionOutcome::failure("Lineage record not found"));
        };

        let staging_id = lineage
            .get("staging_id")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let staging_collection = lineage
            .get("staging_collection")
            .and_then(Value::as_str)
            .unwrap_or(col::STAGING_DATA)
            .to_string();
        let production_collection = lineage
            .get("production_collection")
            .and_then(Value::as_str)
            .unwrap_or(col::CRAWL_DATA)
            .to_string();

        let lock = self.staging_lock(&staging_id).await;
        let _guard = lock.lock().await;

        let now = Utc::now().to_rfc3339();
        self.store
            .delete_one(&production_collection, &json!({"_id": production_id}))
            .await?;

        self.store
            .update_one(
                &staging_collection,
                &json!({"_id": staging_id}),
                &json!({
                    "$set": {
                        "_review_status": "rolled_back",
                        "_rollback_reason": reason,
                        "_rolled_back_at": now,
                        "_rolled_back_by": operator_id,
                    },
                    "$unset": {"_promoted_to": "", "_promoted_at": ""},
                }),
            )
            .await?;

        self.store
            .update_one(
                col::DATA_LINEAGE,
                &json!({"_id": lineage.get("_id").cloned().unwrap_or(Value::Null)}),
                &json!({"$set": {
                    "rolled_back": true,
                    "rollback_reason": reason,
                    "rolled_back_at": now,
                    "rolled_back_by": operator_id,
                }}),
            )
            .await?;

        info!(production_id, staging_id = %staging_id, "promotion rolled back");
        Ok(PromotionOutcome {
            ok: true,
            production_id: None,
            message: "Successfully rolled back".into(),
        })
    }

    /// Promote many ids, reporting per-id failures.
    pub async fn batch_promote(
        &self,
        staging_ids: &[String],
        reviewer_id: &str,
    ) -> CoreResult<BatchPromotionOutcome> {
        let mut outcome = BatchPromotionOutcome {
            total: staging_ids.len() as u64,
            success: 0,
            failed: 0,
            errors: Vec::new(),
        };

        for staging_id in staging_ids {
            match self.promote(staging_id, reviewer_id, None).await {
                Ok(result) if result.ok => outcome.success += 1,
                Ok(result) => {
                    outcome.failed += 1;
                    outcome
                        .errors
                        .push(json!({"staging_id": staging_id, "error": result.message}));
                }
                Err(e) => {
                    outcome.failed += 1;
                    outcome
                        .errors
                        .push(json!({"staging_id": staging_id, "error": e.to_string()}));
                }
            }
        }
        Ok(outcome)
    }

    /// Per-collection staging counters grouped by review status.
    pub async fn staging_stats(&self, source_id: Option<&str>) -> CoreResult<Value> {
        let mut match_stage = Map::new();
        if let Some(source_id) = source_id {
            match_stage.insert("_source_id".into(), json!(source_id));
        }

        let mut totals = json!({
            "total_pending": 0,
            "total_promoted": 0,
            "total_rolled_back": 0,
            "by_collection": {},
        });

        for staging in staging_collections() {
            let pipeline = vec![
                json!({"$match": Value::Object(match_stage.clone())}),
                json!({"$group": {"_id": "$_review_status", "count": {"$sum": 1}}}),
            ];
            let groups = self.store.aggregate(staging, &pipeline).await?;

            let mut col_stats = json!({"pending": 0, "promoted": 0, "rolled_back": 0});
            let mut any = false;
            for group in groups {
                let count = group["count"].as_u64().unwrap_or(0);
                match group["_id"].as_str() {
                    Some("pending") => {
                        col_stats["pending"] = json!(count);
                        totals["total_pending"] =
                            json!(totals["total_pending"].as_u64().unwrap_or(0) + count);
                        any = true;
                    }
                    Some("promoted") => {
                        col_stats["promoted"] = json!(count);
                        totals["total_promoted"] =
                            json!(totals["total_promoted"].as_u64().unwrap_or(0) + count);
                        any = true;
                    }
                    Some("rolled_back") => {
                        col_stats["rolled_back"] = json!(count);
                        totals["total_rolled_back"] =
                            json!(totals["total_rolled_back"].as_u64().unwrap_or(0) + count);
                        any = true;
                    }
                    _ => {}
                }
            }
            if any {
                totals["by_collection"][staging] = col_stats;
            }
        }
        Ok(totals)
    }

    /// Delete promoted staging records older than the cutoff.
    ///
    /// This sweep is also the reconciliation point for interrupted
    /// promotions left in compensating-step limbo.
    pub async fn cleanup_old_staging(&self, days: i64) -> CoreResult<u64> {
        let cutoff = (Utc::now() - Duration::days(days)).to_rfc3339();
        let mut total_deleted = 0;

        for staging in staging_collections() {
            let deleted = self
                .store
                .delete_many(
                    staging,
                    &json!({
                        "_review_status": "promoted",
                        "_promoted_at": {"$lt": cutoff},
                    }),
                )
                .await?;
            total_deleted += deleted;
        }

        info!(total_deleted, "cleaned up old staging records");
        Ok(total_deleted)
    }

    pub fn store(&self) -> &Store {
        &self.store
    }
}

/// Copy non-meta fields, apply corrections, stamp verification metadata.
fn build_production_doc(
    staging_doc: &Value,
    staging_id: &str,
    reviewer_id: &str,
    corrections: Option<&[Value]>,
) -> Map<String, Value> {
    let now = Utc::now();
    let mut production: Map<String, Value> = staging_doc
        .as_object()
        .map(|map| {
            map.iter()
                .filter(|(k, _)| {
                    !k.starts_with('_') || matches!(k.as_str(), "_source_id" | "_data_date")
                })
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect()
        })
        .unwrap_or_default();

    let has_corrections = corrections.map(|c| !c.is_empty()).unwrap_or(false);
    if let Some(corrections) = corrections {
        for correction in corrections {
            let field = correction.get("field").and_then(Value::as_str);
            if let Some(field) = field {
                if production.contains_key(field) {
                    production.insert(
                        field.to_string(),
                        correction
                            .get("corrected_value")
                            .cloned()
                            .unwrap_or(Value::Null),
                    );
                }
            }
        }
    }

    production.insert(
        "_source_id".into(),
        staging_doc.get("_source_id").cloned().unwrap_or(Value::Null),
    );
    production.insert("_staging_id".into(), json!(staging_id));
    production.insert("_verified".into(), json!(true));
    production.insert("_verified_at".into(), json!(now.to_rfc3339()));
    production.insert("_verified_by".into(), json!(reviewer_id));
    production.insert("_has_corrections".into(), json!(has_corrections));
    production.insert("_promoted_at".into(), json!(now.to_rfc3339()));
    production.insert(
        "_crawled_at".into(),
        staging_doc.get("_crawled_at").cloned().unwrap_or(Value::Null),
    );
    production.insert(
        "_data_date".into(),
        staging_doc
            .get("_data_date")
            .cloned()
            .unwrap_or_else(|| json!(now.date_naive().to_string())),
    );
    production
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mapping_fallback() {
        assert_eq!(mapping_for("news"), (col::STAGING_NEWS, col::NEWS_ARTICLES));
        assert_eq!(mapping_for("stock"), (col::STAGING_FINANCIAL, col::STOCK_PRICES));
        assert_eq!(mapping_for("unknown"), (col::STAGING_DATA, col::CRAWL_DATA));
    }

    #[test]
    fn test_staging_collections_deduplicated() {
        let collections = staging_collections();
        assert_eq!(
            collections,
            vec![col::STAGING_NEWS, col::STAGING_FINANCIAL, col::STAGING_DATA]
        );
    }

    #[test]
    fn test_type_hints() {
        assert_eq!(determine_type_from_hints("Daily News Feed", ""), "news");
        assert_eq!(determine_type_from_hints("", "https://finance.example.com"), "financial");
        assert_eq!(determine_type_from_hints("공시 피드", ""), "announcement");
        assert_eq!(determine_type_from_hints("weather", "https://example.com"), "generic");
    }

    #[test]
    fn test_production_doc_filters_meta_and_applies_corrections() {
        let staging = json!({
            "_id": "abc",
            "title": "T",
            "body": "content",
            "_source_id": "sid",
            "_review_status": "pending",
            "_crawled_at": "2026-07-01T00:00:00Z",
        });
        let corrections = vec![json!({"field": "title", "corrected_value": "T'"})];

        let doc = build_production_doc(&staging, "abc", "reviewer-X", Some(&corrections));

        assert_eq!(doc["title"], "T'");
        assert_eq!(doc["body"], "content");
        assert_eq!(doc["_verified"], true);
        assert_eq!(doc["_verified_by"], "reviewer-X");
        assert_eq!(doc["_has_corrections"], true);
        assert_eq!(doc["_staging_id"], "abc");
        assert!(doc.get("_review_status").is_none());
        assert!(doc.get("_id").is_none());
    }

    #[test]
    fn test_corrections_only_touch_existing_fields() {
        let staging = json!({"title": "T", "_source_id": "sid"});
        let corrections = vec![json!({"field": "ghost", "corrected_value": "x"})];
        let doc = build_production_doc(&staging, "abc", "r", Some(&corrections));
        assert!(doc.get("ghost").is_none());
        assert_eq!(doc["_has_corrections"], true);
    }
}
