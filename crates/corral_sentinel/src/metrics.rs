//! Pipeline run metrics.
//!
//! A run's metric starts in an in-process map keyed by `run_id`, takes
//! incremental updates while the run executes, and is persisted to
//! `pipeline_metrics` on completion. The aggregate queries below feed the
//! observability dashboard.

use chrono::{DateTime, Duration, Utc};
use corral_protocol::collections as col;
use corral_protocol::{CoreError, CoreResult};
use corral_store::{FindOptions, Store};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use tracing::{info, warn};

/// Run outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricStatus {
    Running,
    Success,
    Partial,
    Failed,
}

impl MetricStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricStatus::Running => "running",
            MetricStatus::Success => "success",
            MetricStatus::Partial => "partial",
            MetricStatus::Failed => "failed",
        }
    }
}

/// Telemetry for one pipeline run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineMetric {
    pub source_id: String,
    pub run_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub crawler_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dag_id: Option<String>,

    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub execution_time_ms: u64,

    #[serde(default)]
    pub records_extracted: u64,
    #[serde(default)]
    pub records_transformed: u64,
    #[serde(default)]
    pub records_loaded: u64,
    #[serde(default)]
    pub records_skipped: u64,
    #[serde(default)]
    pub records_failed: u64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quality_score: Option<f64>,
    #[serde(default)]
    pub validation_passed: u64,
    #[serde(default)]
    pub validation_failed: u64,

    #[serde(default)]
    pub error_count: u64,
    #[serde(default)]
    pub warning_count: u64,
    #[serde(default)]
    pub error_types: BTreeMap<String, u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,

    pub status: MetricStatus,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_peak_mb: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_time_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network_bytes: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metadata: Map<String, Value>,
}

impl PipelineMetric {
    pub fn start(source_id: impl Into<String>, run_id: impl Into<String>) -> Self {
        Self {
            source_id: source_id.into(),
            run_id: run_id.into(),
            crawler_id: None,
            dag_id: None,
            started_at: Utc::now(),
            completed_at: None,
            execution_time_ms: 0,
            records_extracted: 0,
            records_transformed: 0,
            records_loaded: 0,
            records_skipped: 0,
            records_failed: 0,
            quality_score: None,
            validation_passed: 0,
            validation_failed: 0,
            error_count: 0,
            warning_count: 0,
            error_types: BTreeMap::new(),
            last_error: None,
            status: MetricStatus::Running,
            memory_peak_mb: None,
            cpu_time_ms: None,
            network_bytes: None,
            category: None,
            metadata: Map::new(),
        }
    }

    /// Close the run and derive its duration.
    pub fn mark_completed(&mut self, status: MetricStatus) {
        let now = Utc::now();
        self.completed_at = Some(now);
        self.execution_time_ms = (now - self.started_at).num_milliseconds().max(0) as u64;
        self.status = status;
    }

    pub fn add_error(&mut self, error_type: &str, message: &str) {
        self.error_count += 1;
        *self.error_types.entry(error_type.to_string()).or_insert(0) += 1;
        self.last_error = Some(message.to_string());
    }

    /// Failed records as a share of everything extracted.
    pub fn error_rate(&self) -> f64 {
        if self.records_extracted == 0 {
            return 0.0;
        }
        self.records_failed as f64 / self.records_extracted as f64
    }

    /// Records loaded per second of execution.
    pub fn throughput(&self) -> f64 {
        if self.execution_time_ms == 0 {
            return 0.0;
        }
        self.records_loaded as f64 / (self.execution_time_ms as f64 / 1000.0)
    }
}

/// Collects and aggregates run metrics.
pub struct MetricsCollector {
    store: Store,
    /// Runs in flight, keyed by `run_id`
    active: Mutex<HashMap<String, PipelineMetric>>,
}

impl MetricsCollector {
    pub fn new(store: Store) -> Self {
        Self {
            store,
            active: Mutex::new(HashMap::new()),
        }
    }

    // ---- Lifecycle --------------------------------------------------------

    /// Open a metric for a starting run.
    pub fn start_metric(
        &self,
        run_id: &str,
        source_id: &str,
        crawler_id: Option<&str>,
        dag_id: Option<&str>,
        category: Option<&str>,
    ) -> PipelineMetric {
        let mut metric = PipelineMetric::start(source_id, run_id);
        metric.crawler_id = crawler_id.map(str::to_string);
        metric.dag_id = dag_id.map(str::to_string);
        metric.category = category.map(str::to_string);

        self.active
            .lock()
            .unwrap()
            .insert(run_id.to_string(), metric.clone());
        metric
    }

    /// Merge a patch of metric fields into the running metric.
    pub fn update_metric(&self, run_id: &str, patch: &Value) -> CoreResult<()> {
        let mut active = self.active.lock().unwrap();
        let Some(metric) = active.get_mut(run_id) else {
            return Err(CoreError::not_found(format!("running metric {run_id}")));
        };

        let mut value = serde_json::to_value(&*metric)?;
        if let (Some(target), Some(fields)) = (value.as_object_mut(), patch.as_object()) {
            for (key, patch_value) in fields {
                target.insert(key.clone(), patch_value.clone());
            }
        }
        *metric = serde_json::from_value(value)?;
        Ok(())
    }

    /// Close the run, persist the metric, and drop it from the map.
    pub async fn complete_metric(
        &self,
        run_id: &str,
        status: MetricStatus,
    ) -> CoreResult<PipelineMetric> {
        let metric = {
            let mut active = self.active.lock().unwrap();
            let Some(mut metric) = active.remove(run_id) else {
                return Err(CoreError::not_found(format!("running metric {run_id}")));
            };
            metric.mark_completed(status);
            metric
        };

        self.persist(&metric).await?;
        info!(
            run_id,
            status = status.as_str(),
            execution_time_ms = metric.execution_time_ms,
            "metric completed"
        );
        Ok(metric)
    }

    /// One-shot persist for callers that built the metric themselves.
    pub async fn record_metric(&self, metric: &PipelineMetric) -> CoreResult<()> {
        self.persist(metric).await
    }

    async fn persist(&self, metric: &PipelineMetric) -> CoreResult<()> {
        let doc = serde_json::to_value(metric)?;
        self.store.create(col::PIPELINE_METRICS, doc).await?;
        Ok(())
    }

    /// Abandoned runs older than the cutoff are flushed as failed.
    pub async fn flush_stale_runs(&self, max_age_hours: i64) -> CoreResult<u64> {
        let cutoff = Utc::now() - Duration::hours(max_age_hours);
        let stale: Vec<PipelineMetric> = {
            let mut active = self.active.lock().unwrap();
            let stale_keys: Vec<String> = active
                .iter()
                .filter(|(_, m)| m.started_at < cutoff)
                .map(|(k, _)| k.clone())
                .collect();
            stale_keys
                .into_iter()
                .filter_map(|k| active.remove(&k))
                .collect()
        };

        let mut flushed = 0;
        for mut metric in stale {
            warn!(run_id = %metric.run_id, "flushing stale running metric as failed");
            metric.mark_completed(MetricStatus::Failed);
            self.persist(&metric).await?;
            flushed += 1;
        }
        Ok(flushed)
    }

    // ---- Queries ----------------------------------------------------------

    pub async fn get_metrics_by_run(&self, run_id: &str) -> CoreResult<Vec<Value>> {
        self.store
            .find(
                col::PIPELINE_METRICS,
                &json!({"run_id": run_id}),
                FindOptions::sorted("started_at", -1),
            )
            .await
    }

    pub async fn get_metrics_by_source(
        &self,
        source_id: &str,
        hours: i64,
        limit: u64,
    ) -> CoreResult<Vec<Value>> {
        let cutoff = (Utc::now() - Duration::hours(hours)).to_rfc3339();
        self.store
            .find(
                col::PIPELINE_METRICS,
                &json!({"source_id": source_id, "started_at": {"$gte": cutoff}}),
                FindOptions::sorted("started_at", -1).with_limit(limit),
            )
            .await
    }

    /// Totals and per-status counts over the window, plus success/error
    /// rates.
    pub async fn get_aggregate_stats(
        &self,
        source_id: Option<&str>,
        hours: i64,
    ) -> CoreResult<Value> {
        let mut match_stage = json!({"started_at": {"$gte": (Utc::now() - Duration::hours(hours)).to_rfc3339()}});
        if let Some(source_id) = source_id {
            match_stage["source_id"] = json!(source_id);
        }

        let pipeline = vec![
            json!({"$match": match_stage}),
            json!({"$group": {
                "_id": "$status",
                "count": {"$sum": 1},
                "records_loaded": {"$sum": "$records_loaded"},
                "records_failed": {"$sum": "$records_failed"},
                "errors": {"$sum": "$error_count"},
                "avg_execution_ms": {"$avg": "$execution_time_ms"},
            }}),
        ];
        let groups = self.store.aggregate(col::PIPELINE_METRICS, &pipeline).await?;

        let mut by_status = Map::new();
        let mut total_runs = 0u64;
        let mut success_runs = 0u64;
        let mut failed_runs = 0u64;
        let mut records_loaded = 0u64;
        let mut total_errors = 0u64;

        for group in &groups {
            let status = group["_id"].as_str().unwrap_or("unknown").to_string();
            let count = group["count"].as_u64().unwrap_or(0);
            total_runs += count;
            match status.as_str() {
                "success" => success_runs += count,
                "failed" => failed_runs += count,
                _ => {}
            }
            records_loaded += group["records_loaded"].as_u64().unwrap_or(0);
            total_errors += group["errors"].as_u64().unwrap_or(0);
            by_status.insert(status, group.clone());
        }

        let success_rate = if total_runs > 0 {
            success_runs as f64 / total_runs as f64 * 100.0
        } else {
            0.0
        };
        let error_rate = if total_runs > 0 {
            failed_runs as f64 / total_runs as f64 * 100.0
        } else {
            0.0
        };

        Ok(json!({
            "window_hours": hours,
            "total_runs": total_runs,
            "records_loaded": records_loaded,
            "total_errors": total_errors,
            "success_rate": success_rate,
            "error_rate": error_rate,
            "by_status": by_status,
        }))
    }

    /// Per-source rollups, busiest sources first.
    pub async fn get_source_stats(&self, hours: i64, limit: usize) -> CoreResult<Vec<Value>> {
        let cutoff = (Utc::now() - Duration::hours(hours)).to_rfc3339();
        let pipeline = vec![
            json!({"$match": {"started_at": {"$gte": cutoff}}}),
            json!({"$group": {
                "_id": {"source": "$source_id", "status": "$status"},
                "count": {"$sum": 1},
                "records": {"$sum": "$records_loaded"},
                "avg_execution_ms": {"$avg": "$execution_time_ms"},
            }}),
        ];
        let groups = self.store.aggregate(col::PIPELINE_METRICS, &pipeline).await?;

        // Fold per-(source,status) groups into per-source rollups
        let mut by_source: BTreeMap<String, Value> = BTreeMap::new();
        for group in groups {
            let source = group["_id"]["source"].as_str().unwrap_or("unknown").to_string();
            let status = group["_id"]["status"].as_str().unwrap_or("unknown").to_string();
            let count = group["count"].as_u64().unwrap_or(0);

            let entry = by_source.entry(source.clone()).or_insert_with(|| {
                json!({
                    "source_id": source,
                    "total_runs": 0,
                    "records_loaded": 0,
                    "by_status": {},
                })
            });
            entry["total_runs"] = json!(entry["total_runs"].as_u64().unwrap_or(0) + count);
            entry["records_loaded"] = json!(
                entry["records_loaded"].as_u64().unwrap_or(0)
                    + group["records"].as_u64().unwrap_or(0)
            );
            entry["by_status"][status] = json!(count);
        }

        let mut rollups: Vec<Value> = by_source.into_values().collect();
        rollups.sort_by(|a, b| {
            b["total_runs"]
                .as_u64()
                .unwrap_or(0)
                .cmp(&a["total_runs"].as_u64().unwrap_or(0))
        });
        rollups.truncate(limit);
        Ok(rollups)
    }

    /// Per-category rollups over the window.
    pub async fn get_category_stats(&self, hours: i64) -> CoreResult<Vec<Value>> {
        let cutoff = (Utc::now() - Duration::hours(hours)).to_rfc3339();
        let pipeline = vec![
            json!({"$match": {"started_at": {"$gte": cutoff}}}),
            json!({"$group": {
                "_id": "$category",
                "count": {"$sum": 1},
                "records_loaded": {"$sum": "$records_loaded"},
                "errors": {"$sum": "$error_count"},
            }}),
            json!({"$sort": {"count": -1}}),
        ];
        self.store.aggregate(col::PIPELINE_METRICS, &pipeline).await
    }

    /// Error counts by type, un-nested from `error_types` maps.
    pub async fn get_error_distribution(
        &self,
        source_id: Option<&str>,
        hours: i64,
    ) -> CoreResult<Vec<Value>> {
        let mut filter = json!({
            "started_at": {"$gte": (Utc::now() - Duration::hours(hours)).to_rfc3339()},
            "error_count": {"$gt": 0},
        });
        if let Some(source_id) = source_id {
            filter["source_id"] = json!(source_id);
        }

        let docs = self
            .store
            .find(col::PIPELINE_METRICS, &filter, FindOptions::default())
            .await?;

        let mut totals: BTreeMap<String, u64> = BTreeMap::new();
        for doc in docs {
            if let Some(error_types) = doc.get("error_types").and_then(Value::as_object) {
                for (error_type, count) in error_types {
                    *totals.entry(error_type.clone()).or_insert(0) +=
                        count.as_u64().unwrap_or(0);
                }
            }
        }

        let mut distribution: Vec<Value> = totals
            .into_iter()
            .map(|(error_type, count)| json!({"error_type": error_type, "count": count}))
            .collect();
        distribution.sort_by(|a, b| {
            b["count"].as_u64().unwrap_or(0).cmp(&a["count"].as_u64().unwrap_or(0))
        });
        Ok(distribution)
    }

    /// Run counts bucketed by hour (`YYYY-MM-DDTHH:00:00Z`).
    pub async fn get_hourly_trend(
        &self,
        source_id: Option<&str>,
        hours: i64,
    ) -> CoreResult<Vec<Value>> {
        let mut filter = json!({
            "started_at": {"$gte": (Utc::now() - Duration::hours(hours)).to_rfc3339()},
        });
        if let Some(source_id) = source_id {
            filter["source_id"] = json!(source_id);
        }

        let docs = self
            .store
            .find(col::PIPELINE_METRICS, &filter, FindOptions::default())
            .await?;

        let mut buckets: BTreeMap<String, (u64, u64, u64)> = BTreeMap::new();
        for doc in docs {
            let Some(started_at) = doc
                .get("started_at")
                .and_then(Value::as_str)
                .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            else {
                continue;
            };
            let bucket = started_at
                .with_timezone(&Utc)
                .format("%Y-%m-%dT%H:00:00Z")
                .to_string();
            let entry = buckets.entry(bucket).or_insert((0, 0, 0));
            entry.0 += 1;
            if doc.get("status").and_then(Value::as_str) == Some("success") {
                entry.1 += 1;
            }
            entry.2 += doc.get("records_loaded").and_then(Value::as_u64).unwrap_or(0);
        }

        Ok(buckets
            .into_iter()
            .map(|(hour, (runs, successes, records))| {
                json!({
                    "hour": hour,
                    "runs": runs,
                    "successes": successes,
                    "records_loaded": records,
                })
            })
            .collect())
    }

    /// Number of runs currently tracked in process.
    pub fn active_run_count(&self) -> usize {
        self.active.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metric_lifecycle_computes_duration() {
        let mut metric = PipelineMetric::start("src1", "run-1");
        assert_eq!(metric.status, MetricStatus::Running);
        metric.mark_completed(MetricStatus::Success);
        assert!(metric.completed_at.is_some());
        assert_eq!(metric.status, MetricStatus::Success);
    }

    #[test]
    fn test_add_error_tracks_types() {
        let mut metric = PipelineMetric::start("src1", "run-1");
        metric.add_error("timeout", "read timed out");
        metric.add_error("timeout", "read timed out again");
        metric.add_error("selector", "missing node");

        assert_eq!(metric.error_count, 3);
        assert_eq!(metric.error_types["timeout"], 2);
        assert_eq!(metric.last_error.as_deref(), Some("missing node"));
    }

    #[test]
    fn test_rates() {
        let mut metric = PipelineMetric::start("src1", "run-1");
        metric.records_extracted = 100;
        metric.records_failed = 5;
        metric.records_loaded = 95;
        metric.execution_time_ms = 1_000;

        assert_eq!(metric.error_rate(), 0.05);
        assert_eq!(metric.throughput(), 95.0);
    }
}
