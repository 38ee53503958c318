//! SLA definitions and windowed evaluation.
//!
//! Each definition names an SLA type, a source scope, a target, and
//! warning/critical thresholds over a trailing window. Evaluations append
//! to `sla_evaluations` (the compliance summary's source of truth);
//! non-compliant evaluations also insert an `sla_breaches` row and notify.

use chrono::{DateTime, Duration, Utc};
use corral_ids::IdRef;
use corral_protocol::collections as col;
use corral_protocol::{AlertMessage, CoreError, CoreResult, Notifier, NotifySeverity, NOTIFIER_TIMEOUT};
use corral_store::{FindOptions, Store};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{info, warn};

/// What an SLA measures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SlaType {
    /// success+partial share of runs (%)
    Availability,
    /// success share of runs (%)
    SuccessRate,
    /// errors per loaded record (%), lower is better
    ErrorRate,
    /// average execution time (ms), lower is better
    Latency,
    /// records loaded per window hour
    Throughput,
    /// average quality score of scored runs
    Quality,
    /// hours since the last successful run, lower is better
    Freshness,
}

impl SlaType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SlaType::Availability => "availability",
            SlaType::SuccessRate => "success_rate",
            SlaType::ErrorRate => "error_rate",
            SlaType::Latency => "latency",
            SlaType::Throughput => "throughput",
            SlaType::Quality => "quality",
            SlaType::Freshness => "freshness",
        }
    }

    /// Whether smaller observed values are better.
    pub fn lower_is_better(&self) -> bool {
        matches!(self, SlaType::Latency | SlaType::ErrorRate | SlaType::Freshness)
    }
}

/// Evaluation verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SlaStatus {
    Compliant,
    AtRisk,
    Breached,
    Unknown,
}

impl SlaStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SlaStatus::Compliant => "compliant",
            SlaStatus::AtRisk => "at_risk",
            SlaStatus::Breached => "breached",
            SlaStatus::Unknown => "unknown",
        }
    }
}

/// One SLA definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlaDefinition {
    #[serde(rename = "_id", default, skip_serializing_if = "Option::is_none")]
    pub id: Option<IdRef>,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub sla_type: SlaType,
    /// Scope to one source, or platform-wide when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_id: Option<String>,
    pub target_value: f64,
    pub warning_threshold: f64,
    pub critical_threshold: f64,
    #[serde(default = "default_window_hours")]
    pub window_hours: i64,
    #[serde(default = "default_schedule")]
    pub evaluation_schedule: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

fn default_window_hours() -> i64 {
    24
}

fn default_schedule() -> String {
    "hourly".to_string()
}

fn default_true() -> bool {
    true
}

/// SLA monitor.
pub struct SlaMonitor {
    store: Store,
    notifier: Arc<dyn Notifier>,
}

impl SlaMonitor {
    pub fn new(store: Store, notifier: Arc<dyn Notifier>) -> Self {
        Self { store, notifier }
    }

    // ---- Definition CRUD --------------------------------------------------

    pub async fn create_sla(&self, sla: &SlaDefinition) -> CoreResult<String> {
        let doc = serde_json::to_value(sla)?;
        let id = self.store.create(col::SLA_DEFINITIONS, doc).await?;
        info!(sla = %sla.name, sla_type = sla.sla_type.as_str(), "SLA created");
        Ok(id.to_hex())
    }

    pub async fn get_sla(&self, sla_id: &str) -> CoreResult<Option<SlaDefinition>> {
        let doc = self.store.get(col::SLA_DEFINITIONS, sla_id).await?;
        doc.map(serde_json::from_value)
            .transpose()
            .map_err(Into::into)
    }

    pub async fn update_sla(&self, sla_id: &str, patch: &Value) -> CoreResult<bool> {
        self.store
            .update_by_id(col::SLA_DEFINITIONS, sla_id, &json!({"$set": patch}))
            .await
    }

    pub async fn delete_sla(&self, sla_id: &str) -> CoreResult<bool> {
        self.store.delete_by_id(col::SLA_DEFINITIONS, sla_id).await
    }

    pub async fn list_slas(&self, enabled_only: bool) -> CoreResult<Vec<SlaDefinition>> {
        let filter = if enabled_only {
            json!({"enabled": true})
        } else {
            json!({})
        };
        let docs = self
            .store
            .find(col::SLA_DEFINITIONS, &filter, FindOptions::sorted("name", 1))
            .await?;
        docs.into_iter()
            .map(|d| serde_json::from_value(d).map_err(Into::into))
            .collect()
    }

    // ---- Evaluation -------------------------------------------------------

    /// Evaluate every enabled SLA, returning the non-compliant ones.
    pub async fn evaluate_all(&self) -> CoreResult<Vec<Value>> {
        let mut flagged = Vec::new();
        for sla in self.list_slas(true).await? {
            let evaluation = self.evaluate_definition(&sla).await?;
            let status = evaluation["status"].as_str().unwrap_or("unknown");
            if status == "breached" || status == "at_risk" {
                flagged.push(evaluation);
            }
        }
        Ok(flagged)
    }

    /// Evaluate one stored SLA by id.
    pub async fn evaluate_sla(&self, sla_id: &str) -> CoreResult<Value> {
        let sla = self
            .get_sla(sla_id)
            .await?
            .ok_or_else(|| CoreError::not_found(format!("sla {sla_id}")))?;
        self.evaluate_definition(&sla).await
    }

    async fn evaluate_definition(&self, sla: &SlaDefinition) -> CoreResult<Value> {
        let actual = self.compute_actual(sla).await?;
        let status = match actual {
            Some(actual) => classify(sla, actual),
            None => SlaStatus::Unknown,
        };

        let now = Utc::now();
        let evaluation = json!({
            "sla_id": sla.id.as_ref().map(|i| i.to_hex()),
            "sla_name": sla.name,
            "sla_type": sla.sla_type.as_str(),
            "source_id": sla.source_id,
            "target_value": sla.target_value,
            "actual_value": actual,
            "status": status.as_str(),
            "window_hours": sla.window_hours,
            "evaluated_at": now.to_rfc3339(),
        });
        self.store
            .create(col::SLA_EVALUATIONS, evaluation.clone())
            .await?;

        if matches!(status, SlaStatus::Breached | SlaStatus::AtRisk) {
            self.record_breach(sla, actual, status).await?;
        }
        Ok(evaluation)
    }

    async fn compute_actual(&self, sla: &SlaDefinition) -> CoreResult<Option<f64>> {
        let cutoff = (Utc::now() - Duration::hours(sla.window_hours)).to_rfc3339();
        let mut filter = json!({"started_at": {"$gte": cutoff}});
        if let Some(source_id) = &sla.source_id {
            filter["source_id"] = json!(source_id);
        }

        match sla.sla_type {
            SlaType::Availability => {
                let total = self.store.count(col::PIPELINE_METRICS, &filter).await?;
                if total == 0 {
                    return Ok(None);
                }
                let mut ok_filter = filter.clone();
                ok_filter["status"] = json!({"$in": ["success", "partial"]});
                let ok = self.store.count(col::PIPELINE_METRICS, &ok_filter).await?;
                Ok(Some(ok as f64 / total as f64 * 100.0))
            }
            SlaType::SuccessRate => {
                let total = self.store.count(col::PIPELINE_METRICS, &filter).await?;
                if total == 0 {
                    return Ok(None);
                }
                let mut ok_filter = filter.clone();
                ok_filter["status"] = json!("success");
                let ok = self.store.count(col::PIPELINE_METRICS, &ok_filter).await?;
                Ok(Some(ok as f64 / total as f64 * 100.0))
            }
            SlaType::ErrorRate => {
                let totals = self
                    .sum_fields(&filter, &[("errors", "$error_count"), ("loaded", "$records_loaded")])
                    .await?;
                let loaded = totals["loaded"].as_f64().unwrap_or(0.0);
                if loaded == 0.0 {
                    return Ok(None);
                }
                let errors = totals["errors"].as_f64().unwrap_or(0.0);
                Ok(Some(errors / loaded * 100.0))
            }
            SlaType::Latency => {
                let pipeline = vec![
                    json!({"$match": filter}),
                    json!({"$group": {"_id": null, "avg": {"$avg": "$execution_time_ms"}}}),
                ];
                let groups = self.store.aggregate(col::PIPELINE_METRICS, &pipeline).await?;
                Ok(groups.first().and_then(|g| g["avg"].as_f64()))
            }
            SlaType::Throughput => {
                let totals = self
                    .sum_fields(&filter, &[("loaded", "$records_loaded")])
                    .await?;
                let loaded = totals["loaded"].as_f64().unwrap_or(0.0);
                Ok(Some(loaded / sla.window_hours as f64))
            }
            SlaType::Quality => {
                let mut scored = filter.clone();
                scored["quality_score"] = json!({"$exists": true});
                let pipeline = vec![
                    json!({"$match": scored}),
                    json!({"$group": {"_id": null, "avg": {"$avg": "$quality_score"}}}),
                ];
                let groups = self.store.aggregate(col::PIPELINE_METRICS, &pipeline).await?;
                Ok(groups.first().and_then(|g| g["avg"].as_f64()))
            }
            SlaType::Freshness => {
                let mut success_filter = json!({"status": {"$in": ["success", "partial"]}});
                if let Some(source_id) = &sla.source_id {
                    success_filter["source_id"] = json!(source_id);
                }
                let latest = self
                    .store
                    .find(
                        col::PIPELINE_METRICS,
                        &success_filter,
                        FindOptions::sorted("completed_at", -1).with_limit(1),
                    )
                    .await?;
                let Some(run) = latest.first() else {
                    return Ok(None);
                };
                let finished = run
                    .get("completed_at")
                    .or_else(|| run.get("started_at"))
                    .and_then(Value::as_str)
                    .and_then(|s| DateTime::parse_from_rfc3339(s).ok());
                Ok(finished.map(|at| {
                    (Utc::now() - at.with_timezone(&Utc)).num_seconds() as f64 / 3600.0
                }))
            }
        }
    }

    async fn sum_fields(&self, filter: &Value, fields: &[(&str, &str)]) -> CoreResult<Value> {
        let mut group = json!({"_id": null});
        for (alias, field_ref) in fields {
            group[*alias] = json!({"$sum": field_ref});
        }
        let pipeline = vec![json!({"$match": filter}), json!({"$group": group})];
        let groups = self.store.aggregate(col::PIPELINE_METRICS, &pipeline).await?;
        Ok(groups.into_iter().next().unwrap_or(json!({})))
    }

    async fn record_breach(
        &self,
        sla: &SlaDefinition,
        actual: Option<f64>,
        status: SlaStatus,
    ) -> CoreResult<()> {
        let now = Utc::now();
        let breach = json!({
            "sla_id": sla.id.as_ref().map(|i| i.to_hex()),
            "sla_name": sla.name,
            "sla_type": sla.sla_type.as_str(),
            "source_id": sla.source_id,
            "status": status.as_str(),
            "target_value": sla.target_value,
            "actual_value": actual,
            "breached_at": now.to_rfc3339(),
            "acknowledged": false,
            "resolved": false,
        });
        self.store.create(col::SLA_BREACHES, breach).await?;

        let severity = if status == SlaStatus::Breached {
            NotifySeverity::Critical
        } else {
            NotifySeverity::Warning
        };
        let mut message = AlertMessage::new(
            format!("SLA {}: {}", status.as_str(), sla.name),
            format!(
                "SLA '{}' ({}) is {}: actual {:.2} vs target {:.2} over {}h",
                sla.name,
                sla.sla_type.as_str(),
                status.as_str(),
                actual.unwrap_or(f64::NAN),
                sla.target_value,
                sla.window_hours,
            ),
            severity,
        );
        if let Some(source_id) = &sla.source_id {
            message = message.with_source(source_id.clone());
        }

        if tokio::time::timeout(NOTIFIER_TIMEOUT, self.notifier.send(message))
            .await
            .is_err()
        {
            warn!(sla = %sla.name, "SLA breach notification timed out");
        }
        Ok(())
    }

    // ---- Breach bookkeeping -----------------------------------------------

    pub async fn get_recent_breaches(&self, hours: i64, limit: u64) -> CoreResult<Vec<Value>> {
        let cutoff = (Utc::now() - Duration::hours(hours)).to_rfc3339();
        self.store
            .find(
                col::SLA_BREACHES,
                &json!({"breached_at": {"$gte": cutoff}}),
                FindOptions::sorted("breached_at", -1).with_limit(limit),
            )
            .await
    }

    pub async fn acknowledge_breach(&self, breach_id: &str, who: &str) -> CoreResult<bool> {
        self.store
            .update_by_id(
                col::SLA_BREACHES,
                breach_id,
                &json!({"$set": {
                    "acknowledged": true,
                    "acknowledged_by": who,
                    "acknowledged_at": Utc::now().to_rfc3339(),
                }}),
            )
            .await
    }

    pub async fn resolve_breach(&self, breach_id: &str, note: Option<&str>) -> CoreResult<bool> {
        self.store
            .update_by_id(
                col::SLA_BREACHES,
                breach_id,
                &json!({"$set": {
                    "resolved": true,
                    "resolution_note": note,
                    "resolved_at": Utc::now().to_rfc3339(),
                }}),
            )
            .await
    }

    /// Compliance share per SLA over recent evaluations.
    pub async fn compliance_summary(&self, hours: i64) -> CoreResult<Vec<Value>> {
        let cutoff = (Utc::now() - Duration::hours(hours)).to_rfc3339();
        let pipeline = vec![
            json!({"$match": {"evaluated_at": {"$gte": cutoff}}}),
            json!({"$group": {
                "_id": {"sla": "$sla_name", "status": "$status"},
                "count": {"$sum": 1},
            }}),
        ];
        let groups = self.store.aggregate(col::SLA_EVALUATIONS, &pipeline).await?;

        let mut by_sla: std::collections::BTreeMap<String, (u64, u64)> = Default::default();
        for group in groups {
            let sla = group["_id"]["sla"].as_str().unwrap_or("unknown").to_string();
            let status = group["_id"]["status"].as_str().unwrap_or("unknown");
            let count = group["count"].as_u64().unwrap_or(0);
            let entry = by_sla.entry(sla).or_insert((0, 0));
            entry.0 += count;
            if status == "compliant" {
                entry.1 += count;
            }
        }

        Ok(by_sla
            .into_iter()
            .map(|(sla, (total, compliant))| {
                let rate = if total > 0 {
                    compliant as f64 / total as f64 * 100.0
                } else {
                    0.0
                };
                json!({
                    "sla_name": sla,
                    "evaluations": total,
                    "compliant": compliant,
                    "compliance_rate": rate,
                })
            })
            .collect())
    }
}

/// Classify an observed value against the definition's thresholds.
fn classify(sla: &SlaDefinition, actual: f64) -> SlaStatus {
    if sla.sla_type.lower_is_better() {
        if actual <= sla.target_value {
            SlaStatus::Compliant
        } else if actual <= sla.warning_threshold {
            SlaStatus::AtRisk
        } else {
            SlaStatus::Breached
        }
    } else if actual >= sla.target_value {
        SlaStatus::Compliant
    } else if actual >= sla.warning_threshold {
        SlaStatus::AtRisk
    } else {
        SlaStatus::Breached
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sla(sla_type: SlaType, target: f64, warning: f64, critical: f64) -> SlaDefinition {
        SlaDefinition {
            id: None,
            name: "test".into(),
            description: String::new(),
            sla_type,
            source_id: None,
            target_value: target,
            warning_threshold: warning,
            critical_threshold: critical,
            window_hours: 24,
            evaluation_schedule: "hourly".into(),
            enabled: true,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_classify_higher_is_better() {
        let availability = sla(SlaType::Availability, 99.0, 95.0, 90.0);
        assert_eq!(classify(&availability, 99.5), SlaStatus::Compliant);
        assert_eq!(classify(&availability, 97.0), SlaStatus::AtRisk);
        assert_eq!(classify(&availability, 90.0), SlaStatus::Breached);
    }

    #[test]
    fn test_classify_lower_is_better() {
        let latency = sla(SlaType::Latency, 1_000.0, 2_000.0, 5_000.0);
        assert_eq!(classify(&latency, 800.0), SlaStatus::Compliant);
        assert_eq!(classify(&latency, 1_500.0), SlaStatus::AtRisk);
        assert_eq!(classify(&latency, 3_000.0), SlaStatus::Breached);
    }

    #[test]
    fn test_lower_is_better_types() {
        assert!(SlaType::Latency.lower_is_better());
        assert!(SlaType::ErrorRate.lower_is_better());
        assert!(SlaType::Freshness.lower_is_better());
        assert!(!SlaType::Availability.lower_is_better());
        assert!(!SlaType::Throughput.lower_is_better());
    }
}
