//! Dashboard counters.
//!
//! The optimized path computes source, crawler, and execution rollups in
//! three `$facet` aggregation round-trips. The legacy path issues
//! individual counts and exists only as a fallback for engines without
//! `$facet`.

use chrono::{Duration, Utc};
use corral_protocol::collections as col;
use corral_protocol::CoreResult;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use tracing::warn;

use crate::backend::Document;
use crate::store::Store;

/// Rollup for one collection: a total plus per-status counters.
#[derive(Debug, Clone, Default, Serialize)]
pub struct StatusRollup {
    pub total: u64,
    pub by_status: BTreeMap<String, u64>,
}

/// Counters the main dashboard renders.
#[derive(Debug, Clone, Serialize)]
pub struct DashboardStats {
    pub sources: StatusRollup,
    pub crawlers: StatusRollup,
    pub executions: StatusRollup,
    pub executions_last_24h: u64,
    pub records_collected: u64,
    /// Simple score kept for backward compatibility; the observability
    /// dashboard's formula is authoritative for monitoring.
    pub health_score: f64,
    pub generated_at: String,
}

impl Store {
    /// Dashboard counters via the `$facet` fast path, falling back to
    /// per-status counts when the engine rejects the pipeline.
    pub async fn dashboard_stats(&self) -> CoreResult<DashboardStats> {
        match self.dashboard_stats_facet().await {
            Ok(stats) => Ok(stats),
            Err(e) => {
                warn!(error = %e, "facet dashboard path failed, using legacy counts");
                self.dashboard_stats_legacy().await
            }
        }
    }

    async fn dashboard_stats_facet(&self) -> CoreResult<DashboardStats> {
        let status_facet: Vec<Document> = vec![json!({"$facet": {
            "by_status": [{"$group": {"_id": "$status", "count": {"$sum": 1}}}],
            "total": [{"$count": "n"}],
        }})];

        let sources = self.aggregate(col::SOURCES, &status_facet).await?;
        let crawlers = self.aggregate(col::CRAWLERS, &status_facet).await?;

        let cutoff = (Utc::now() - Duration::hours(24)).to_rfc3339();
        let executions_pipeline: Vec<Document> = vec![json!({"$facet": {
            "by_status": [{"$group": {"_id": "$status", "count": {"$sum": 1}}}],
            "total": [{"$count": "n"}],
            "last_24h": [
                {"$match": {"executed_at": {"$gte": cutoff}}},
                {"$count": "n"},
            ],
            "records": [
                {"$group": {"_id": null, "sum": {"$sum": "$record_count"}}},
            ],
        }})];
        let executions = self.aggregate(col::CRAWL_RESULTS, &executions_pipeline).await?;

        let sources = parse_status_facet(sources.first());
        let crawlers = parse_status_facet(crawlers.first());
        let exec_doc = executions.first();
        let execution_rollup = parse_status_facet(exec_doc);
        let executions_last_24h = exec_doc
            .and_then(|d| d["last_24h"].as_array())
            .and_then(|a| a.first())
            .and_then(|d| d["n"].as_u64())
            .unwrap_or(0);
        let records_collected = exec_doc
            .and_then(|d| d["records"].as_array())
            .and_then(|a| a.first())
            .and_then(|d| d["sum"].as_u64())
            .unwrap_or(0);

        Ok(build_stats(
            sources,
            crawlers,
            execution_rollup,
            executions_last_24h,
            records_collected,
        ))
    }

    /// N-count fallback, semantically identical to the facet path.
    async fn dashboard_stats_legacy(&self) -> CoreResult<DashboardStats> {
        let mut sources = StatusRollup::default();
        for status in ["pending", "active", "inactive", "error"] {
            let n = self.count(col::SOURCES, &json!({"status": status})).await?;
            if n > 0 {
                sources.by_status.insert(status.to_string(), n);
            }
            sources.total += n;
        }

        let mut crawlers = StatusRollup::default();
        for status in ["active", "inactive"] {
            let n = self.count(col::CRAWLERS, &json!({"status": status})).await?;
            if n > 0 {
                crawlers.by_status.insert(status.to_string(), n);
            }
            crawlers.total += n;
        }

        let mut executions = StatusRollup::default();
        for status in ["success", "partial", "failed", "running"] {
            let n = self
                .count(col::CRAWL_RESULTS, &json!({"status": status}))
                .await?;
            if n > 0 {
                executions.by_status.insert(status.to_string(), n);
            }
            executions.total += n;
        }

        let cutoff = (Utc::now() - Duration::hours(24)).to_rfc3339();
        let executions_last_24h = self
            .count(col::CRAWL_RESULTS, &json!({"executed_at": {"$gte": cutoff}}))
            .await?;

        let records = self
            .aggregate(
                col::CRAWL_RESULTS,
                &[json!({"$group": {"_id": null, "sum": {"$sum": "$record_count"}}})],
            )
            .await?;
        let records_collected = records
            .first()
            .and_then(|d| d["sum"].as_u64())
            .unwrap_or(0);

        Ok(build_stats(
            sources,
            crawlers,
            executions,
            executions_last_24h,
            records_collected,
        ))
    }
}

fn parse_status_facet(doc: Option<&Value>) -> StatusRollup {
    let mut rollup = StatusRollup::default();
    let Some(doc) = doc else {
        return rollup;
    };

    rollup.total = doc["total"]
        .as_array()
        .and_then(|a| a.first())
        .and_then(|d| d["n"].as_u64())
        .unwrap_or(0);

    if let Some(groups) = doc["by_status"].as_array() {
        for group in groups {
            if let (Some(status), Some(count)) = (group["_id"].as_str(), group["count"].as_u64()) {
                rollup.by_status.insert(status.to_string(), count);
            }
        }
    }
    rollup
}

fn build_stats(
    sources: StatusRollup,
    crawlers: StatusRollup,
    executions: StatusRollup,
    executions_last_24h: u64,
    records_collected: u64,
) -> DashboardStats {
    // Legacy score: execution success weighted against active sources
    let success = executions.by_status.get("success").copied().unwrap_or(0);
    let exec_score = if executions.total > 0 {
        success as f64 / executions.total as f64
    } else {
        1.0
    };
    let active = sources.by_status.get("active").copied().unwrap_or(0);
    let source_score = if sources.total > 0 {
        active as f64 / sources.total as f64
    } else {
        1.0
    };
    let health_score = ((exec_score * 70.0 + source_score * 30.0) * 100.0).round() / 100.0;

    DashboardStats {
        sources,
        crawlers,
        executions,
        executions_last_24h,
        records_collected,
        health_score,
        generated_at: Utc::now().to_rfc3339(),
    }
}
