//! Data freshness tracking.
//!
//! Per-source thresholds classify how stale a source's data is, based on
//! its most recent successful pipeline run. Ages below the warning
//! threshold are fresh, ages at or past it are stale, and ages at or past
//! the critical threshold are critical, so severity never decreases as age
//! grows. Staleness alerts honor a per-source cooldown; sources without
//! configuration get the 24/36/48 hour defaults. `auto_configure` derives
//! thresholds from observed run intervals.

use chrono::{DateTime, Duration, Utc};
use corral_protocol::collections as col;
use corral_protocol::{AlertMessage, CoreResult, Notifier, NotifySeverity, NOTIFIER_TIMEOUT};
use corral_store::{FindOptions, Store};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{info, warn};

/// Freshness verdict for one source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FreshnessStatus {
    Fresh,
    Stale,
    Critical,
    Unknown,
    Disabled,
}

impl FreshnessStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FreshnessStatus::Fresh => "fresh",
            FreshnessStatus::Stale => "stale",
            FreshnessStatus::Critical => "critical",
            FreshnessStatus::Unknown => "unknown",
            FreshnessStatus::Disabled => "disabled",
        }
    }
}

/// Per-source freshness configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FreshnessConfig {
    pub source_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_name: Option<String>,

    #[serde(default = "default_expected")]
    pub expected_frequency_hours: f64,
    #[serde(default = "default_warning")]
    pub warning_threshold_hours: f64,
    #[serde(default = "default_critical")]
    pub critical_threshold_hours: f64,

    /// Cron expression; opaque here, auto-config uses observed intervals
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule_cron: Option<String>,
    #[serde(default)]
    pub business_hours_only: bool,
    #[serde(default = "default_timezone")]
    pub timezone: String,

    #[serde(default = "default_true")]
    pub alert_on_stale: bool,
    #[serde(default = "default_true")]
    pub alert_on_critical: bool,
    #[serde(default = "default_cooldown")]
    pub alert_cooldown_hours: f64,

    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_alert_at: Option<DateTime<Utc>>,
}

fn default_expected() -> f64 {
    24.0
}

fn default_warning() -> f64 {
    36.0
}

fn default_critical() -> f64 {
    48.0
}

fn default_timezone() -> String {
    "UTC".to_string()
}

fn default_cooldown() -> f64 {
    4.0
}

fn default_true() -> bool {
    true
}

impl FreshnessConfig {
    pub fn defaults_for(source_id: impl Into<String>) -> Self {
        Self {
            source_id: source_id.into(),
            source_name: None,
            expected_frequency_hours: default_expected(),
            warning_threshold_hours: default_warning(),
            critical_threshold_hours: default_critical(),
            schedule_cron: None,
            business_hours_only: false,
            timezone: default_timezone(),
            alert_on_stale: true,
            alert_on_critical: true,
            alert_cooldown_hours: default_cooldown(),
            enabled: true,
            last_alert_at: None,
        }
    }
}

/// Snapshot of a source's freshness at evaluation time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FreshnessState {
    pub source_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_name: Option<String>,
    pub status: FreshnessStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_successful_run: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_age_hours: Option<f64>,
    pub expected_frequency_hours: f64,
    pub warning_threshold_hours: f64,
    pub critical_threshold_hours: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_expected_update: Option<DateTime<Utc>>,
    #[serde(default)]
    pub records_in_last_run: u64,
    pub evaluated_at: DateTime<Utc>,
}

/// Classify an age against config thresholds.
pub fn classify_age(config: &FreshnessConfig, data_age_hours: f64) -> FreshnessStatus {
    if !config.enabled {
        return FreshnessStatus::Disabled;
    }
    if data_age_hours >= config.critical_threshold_hours {
        FreshnessStatus::Critical
    } else if data_age_hours >= config.warning_threshold_hours {
        FreshnessStatus::Stale
    } else {
        FreshnessStatus::Fresh
    }
}

/// Freshness tracker.
pub struct FreshnessTracker {
    store: Store,
    notifier: Arc<dyn Notifier>,
}

impl FreshnessTracker {
    pub fn new(store: Store, notifier: Arc<dyn Notifier>) -> Self {
        Self { store, notifier }
    }

    // ---- Configuration ----------------------------------------------------

    pub async fn set_config(&self, config: &FreshnessConfig) -> CoreResult<()> {
        let mut doc = serde_json::to_value(config)?;
        doc.as_object_mut()
            .expect("config serializes to an object")
            .insert("updated_at".into(), json!(Utc::now().to_rfc3339()));
        self.store
            .upsert_one(
                col::FRESHNESS_CONFIG,
                &json!({"source_id": config.source_id}),
                &json!({"$set": doc}),
            )
            .await?;
        info!(
            source_id = %config.source_id,
            expected = config.expected_frequency_hours,
            "freshness config set"
        );
        Ok(())
    }

    pub async fn get_config(&self, source_id: &str) -> CoreResult<Option<FreshnessConfig>> {
        let doc = self
            .store
            .find_one(col::FRESHNESS_CONFIG, &json!({"source_id": source_id}))
            .await?;
        doc.map(serde_json::from_value)
            .transpose()
            .map_err(Into::into)
    }

    pub async fn delete_config(&self, source_id: &str) -> CoreResult<bool> {
        let deleted = self
            .store
            .delete_one(col::FRESHNESS_CONFIG, &json!({"source_id": source_id}))
            .await?;
        Ok(deleted > 0)
    }

    pub async fn list_configs(&self, enabled_only: bool) -> CoreResult<Vec<FreshnessConfig>> {
        let filter = if enabled_only {
            json!({"enabled": true})
        } else {
            json!({})
        };
        let docs = self
            .store
            .find(col::FRESHNESS_CONFIG, &filter, FindOptions::sorted("source_id", 1))
            .await?;
        docs.into_iter()
            .map(|d| serde_json::from_value(d).map_err(Into::into))
            .collect()
    }

    // ---- Evaluation -------------------------------------------------------

    /// Evaluate one source: classify age from the last successful run,
    /// persist a history snapshot, and alert when configured and outside
    /// cooldown.
    pub async fn check_freshness(&self, source_id: &str) -> CoreResult<FreshnessState> {
        let config = self
            .get_config(source_id)
            .await?
            .unwrap_or_else(|| FreshnessConfig::defaults_for(source_id));
        let now = Utc::now();

        let last_run = self.last_successful_run(source_id).await?;
        let Some(last_run) = last_run else {
            let state = FreshnessState {
                source_id: source_id.to_string(),
                source_name: config.source_name.clone(),
                status: FreshnessStatus::Unknown,
                last_successful_run: None,
                data_age_hours: None,
                expected_frequency_hours: config.expected_frequency_hours,
                warning_threshold_hours: config.warning_threshold_hours,
                critical_threshold_hours: config.critical_threshold_hours,
                next_expected_update: None,
                records_in_last_run: 0,
                evaluated_at: now,
            };
            self.store_snapshot(&state).await?;
            return Ok(state);
        };

        let finished = last_run
            .get("completed_at")
            .or_else(|| last_run.get("started_at"))
            .and_then(Value::as_str)
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|at| at.with_timezone(&Utc))
            .unwrap_or(now);

        let data_age_hours = (now - finished).num_seconds() as f64 / 3600.0;
        let status = classify_age(&config, data_age_hours);

        let state = FreshnessState {
            source_id: source_id.to_string(),
            source_name: config.source_name.clone(),
            status,
            last_successful_run: Some(finished),
            data_age_hours: Some(data_age_hours),
            expected_frequency_hours: config.expected_frequency_hours,
            warning_threshold_hours: config.warning_threshold_hours,
            critical_threshold_hours: config.critical_threshold_hours,
            next_expected_update: Some(
                finished + Duration::seconds((config.expected_frequency_hours * 3600.0) as i64),
            ),
            records_in_last_run: last_run
                .get("records_loaded")
                .and_then(Value::as_u64)
                .unwrap_or(0),
            evaluated_at: now,
        };

        self.store_snapshot(&state).await?;

        if status != FreshnessStatus::Fresh {
            self.maybe_alert(&config, &state).await?;
        }
        Ok(state)
    }

    /// Evaluate every enabled configuration.
    pub async fn check_all(&self) -> CoreResult<Vec<FreshnessState>> {
        let mut states = Vec::new();
        for config in self.list_configs(true).await? {
            states.push(self.check_freshness(&config.source_id).await?);
        }
        Ok(states)
    }

    async fn last_successful_run(&self, source_id: &str) -> CoreResult<Option<Value>> {
        let runs = self
            .store
            .find(
                col::PIPELINE_METRICS,
                &json!({
                    "source_id": source_id,
                    "status": {"$in": ["success", "partial"]},
                }),
                FindOptions::sorted("completed_at", -1).with_limit(1),
            )
            .await?;
        Ok(runs.into_iter().next())
    }

    async fn store_snapshot(&self, state: &FreshnessState) -> CoreResult<()> {
        let doc = serde_json::to_value(state)?;
        self.store.create(col::FRESHNESS_HISTORY, doc).await?;
        Ok(())
    }

    async fn maybe_alert(
        &self,
        config: &FreshnessConfig,
        state: &FreshnessState,
    ) -> CoreResult<()> {
        let should_alert = match state.status {
            FreshnessStatus::Critical => config.alert_on_critical,
            FreshnessStatus::Stale => config.alert_on_stale,
            _ => false,
        };
        if !should_alert {
            return Ok(());
        }

        let now = Utc::now();
        if let Some(last_alert) = config.last_alert_at {
            let cooldown =
                Duration::seconds((config.alert_cooldown_hours * 3600.0) as i64);
            if now < last_alert + cooldown {
                return Ok(());
            }
        }

        let severity = if state.status == FreshnessStatus::Critical {
            NotifySeverity::Critical
        } else {
            NotifySeverity::Warning
        };
        let label = state.status.as_str().to_uppercase();
        let message = AlertMessage::new(
            format!(
                "Data freshness {label}: {}",
                config.source_name.as_deref().unwrap_or(&config.source_id)
            ),
            format!(
                "Source {} has not produced data for {:.1}h (expected every {:.0}h, warning {:.0}h, critical {:.0}h)",
                config.source_id,
                state.data_age_hours.unwrap_or(f64::NAN),
                config.expected_frequency_hours,
                config.warning_threshold_hours,
                config.critical_threshold_hours,
            ),
            severity,
        )
        .with_source(config.source_id.clone())
        .with_metadata("data_age_hours", json!(state.data_age_hours))
        .with_metadata("status", json!(state.status.as_str()));

        if tokio::time::timeout(NOTIFIER_TIMEOUT, self.notifier.send(message))
            .await
            .is_err()
        {
            warn!(source_id = %config.source_id, "staleness alert timed out");
        }

        self.store
            .update_one(
                col::FRESHNESS_CONFIG,
                &json!({"source_id": config.source_id}),
                &json!({"$set": {"last_alert_at": now.to_rfc3339()}}),
            )
            .await?;
        Ok(())
    }

    // ---- Reporting --------------------------------------------------------

    /// Fleet-wide freshness summary. The health score here is the
    /// authoritative monitoring formula.
    pub async fn summary(&self) -> CoreResult<Value> {
        let states = self.check_all().await?;
        let mut counts = json!({"fresh": 0, "stale": 0, "critical": 0, "unknown": 0, "disabled": 0});
        let mut total_age = 0.0;
        let mut aged = 0u64;

        for state in &states {
            let key = state.status.as_str();
            counts[key] = json!(counts[key].as_u64().unwrap_or(0) + 1);
            if let Some(age) = state.data_age_hours {
                total_age += age;
                aged += 1;
            }
        }

        let total = states.len() as f64;
        let fresh = counts["fresh"].as_u64().unwrap_or(0) as f64;
        let health_score = if total > 0.0 {
            (fresh / total * 10_000.0).round() / 100.0
        } else {
            100.0
        };
        let average_age = if aged > 0 {
            (total_age / aged as f64 * 100.0).round() / 100.0
        } else {
            0.0
        };

        Ok(json!({
            "total_sources": states.len(),
            "fresh": counts["fresh"],
            "stale": counts["stale"],
            "critical": counts["critical"],
            "unknown": counts["unknown"],
            "disabled": counts["disabled"],
            "average_data_age_hours": average_age,
            "health_score": health_score,
            "states": states.iter().map(|s| serde_json::to_value(s).unwrap_or(Value::Null)).collect::<Vec<_>>(),
        }))
    }

    /// Stale and critical sources, most stale first.
    pub async fn stale_sources(&self) -> CoreResult<Vec<FreshnessState>> {
        let mut stale: Vec<FreshnessState> = self
            .check_all()
            .await?
            .into_iter()
            .filter(|s| {
                matches!(s.status, FreshnessStatus::Stale | FreshnessStatus::Critical)
            })
            .collect();
        stale.sort_by(|a, b| {
            b.data_age_hours
                .unwrap_or(0.0)
                .partial_cmp(&a.data_age_hours.unwrap_or(0.0))
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        Ok(stale)
    }

    pub async fn history(&self, source_id: &str, hours: i64) -> CoreResult<Vec<Value>> {
        let cutoff = (Utc::now() - Duration::hours(hours)).to_rfc3339();
        self.store
            .find(
                col::FRESHNESS_HISTORY,
                &json!({"source_id": source_id, "evaluated_at": {"$gte": cutoff}}),
                FindOptions::sorted("evaluated_at", 1),
            )
            .await
    }

    // ---- Auto-configuration -----------------------------------------------

    /// Derive configs from observed run cadence: mean interval between
    /// recent successful runs, warning at 1.5x, critical at 2x. Sources
    /// with fewer than two successful runs are skipped; existing configs
    /// are updated in place.
    pub async fn auto_configure(&self) -> CoreResult<Vec<FreshnessConfig>> {
        let sources = self
            .store
            .aggregate(
                col::PIPELINE_METRICS,
                &[
                    json!({"$match": {"status": {"$in": ["success", "partial"]}}}),
                    json!({"$group": {"_id": "$source_id", "runs": {"$sum": 1}}}),
                ],
            )
            .await?;

        let mut configured = Vec::new();
        for source in sources {
            let Some(source_id) = source["_id"].as_str() else {
                continue;
            };
            let runs = self
                .store
                .find(
                    col::PIPELINE_METRICS,
                    &json!({
                        "source_id": source_id,
                        "status": {"$in": ["success", "partial"]},
                    }),
                    FindOptions::sorted("completed_at", -1).with_limit(10),
                )
                .await?;

            let timestamps: Vec<DateTime<Utc>> = runs
                .iter()
                .filter_map(|run| {
                    run.get("completed_at")
                        .or_else(|| run.get("started_at"))
                        .and_then(Value::as_str)
                        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                        .map(|at| at.with_timezone(&Utc))
                })
                .collect();
            if timestamps.len() < 2 {
                continue;
            }

            let mut interval_sum = 0.0;
            for pair in timestamps.windows(2) {
                interval_sum += (pair[0] - pair[1]).num_seconds().abs() as f64 / 3600.0;
            }
            let mean_interval = interval_sum / (timestamps.len() - 1) as f64;

            let mut config = self
                .get_config(source_id)
                .await?
                .unwrap_or_else(|| FreshnessConfig::defaults_for(source_id));
            config.expected_frequency_hours = (mean_interval * 100.0).round() / 100.0;
            config.warning_threshold_hours = (mean_interval * 1.5 * 100.0).round() / 100.0;
            config.critical_threshold_hours = (mean_interval * 2.0 * 100.0).round() / 100.0;

            self.set_config(&config).await?;
            configured.push(config);
        }

        info!(count = configured.len(), "freshness auto-configuration complete");
        Ok(configured)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification_monotonic_in_age() {
        let config = FreshnessConfig::defaults_for("src");
        let rank = |status: FreshnessStatus| match status {
            FreshnessStatus::Fresh => 0,
            FreshnessStatus::Stale => 1,
            FreshnessStatus::Critical => 2,
            _ => 3,
        };

        let mut previous = 0;
        for age in [0.0, 10.0, 30.0, 35.9, 36.0, 40.0, 47.9, 48.0, 100.0] {
            let current = rank(classify_age(&config, age));
            assert!(current >= previous, "severity regressed at age {age}");
            previous = current;
        }
    }

    #[test]
    fn test_classification_boundaries() {
        let config = FreshnessConfig::defaults_for("src");
        assert_eq!(classify_age(&config, 30.0), FreshnessStatus::Fresh);
        assert_eq!(classify_age(&config, 36.0), FreshnessStatus::Stale);
        assert_eq!(classify_age(&config, 37.0), FreshnessStatus::Stale);
        assert_eq!(classify_age(&config, 48.0), FreshnessStatus::Critical);
        assert_eq!(classify_age(&config, 49.0), FreshnessStatus::Critical);
    }

    #[test]
    fn test_disabled_config_short_circuits() {
        let mut config = FreshnessConfig::defaults_for("src");
        config.enabled = false;
        assert_eq!(classify_age(&config, 1_000.0), FreshnessStatus::Disabled);
    }
}
