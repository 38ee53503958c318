//! Rule-based alerting.
//!
//! Rules live in `alert_rules` and are served from a cache refreshed every
//! five minutes or on any rule write. Each metric evaluation walks the
//! applicable rules (source-specific plus global), honors per-rule
//! cooldowns under a per-rule lock, runs the configured actions, and
//! appends to `alert_history`.

use chrono::{DateTime, Duration, Utc};
use corral_ids::IdRef;
use corral_protocol::collections as col;
use corral_protocol::{
    AlertMessage, CoreResult, Notifier, NotifySeverity, NOTIFIER_TIMEOUT,
};
use corral_store::{FindOptions, Store};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{Mutex, RwLock};
use tracing::{info, warn};

use crate::metrics::PipelineMetric;

/// How long the rule cache stays valid.
const RULE_CACHE_TTL_SECS: u64 = 300;

/// Condition kinds a rule can evaluate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertCondition {
    ThresholdAbove,
    ThresholdBelow,
    Equals,
    NotEquals,
    ConsecutiveFailures,
    RateAbove,
    RateBelow,
    PatternMatch,
    MissingData,
}

/// What to do when a rule fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertAction {
    Notify,
    Log,
    DisableSource,
    Escalate,
}

/// One alerting rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertRule {
    #[serde(rename = "_id", default, skip_serializing_if = "Option::is_none")]
    pub id: Option<IdRef>,
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Source-specific rule when set, global otherwise
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metric_type: Option<String>,
    pub condition: AlertCondition,
    /// Field of the pipeline metric this rule watches
    pub metric_field: String,
    #[serde(default)]
    pub threshold: f64,
    #[serde(default = "default_window_minutes")]
    pub window_minutes: i64,
    #[serde(default = "default_consecutive")]
    pub consecutive_count: u64,
    pub severity: NotifySeverity,
    #[serde(default)]
    pub actions: Vec<AlertAction>,
    #[serde(default = "default_cooldown")]
    pub cooldown_minutes: i64,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Regex for `pattern_match` conditions
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_triggered: Option<DateTime<Utc>>,
    #[serde(default)]
    pub trigger_count: u64,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

fn default_window_minutes() -> i64 {
    60
}

fn default_consecutive() -> u64 {
    3
}

fn default_cooldown() -> i64 {
    30
}

fn default_true() -> bool {
    true
}

impl AlertRule {
    pub fn new(
        name: impl Into<String>,
        condition: AlertCondition,
        metric_field: impl Into<String>,
        threshold: f64,
        severity: NotifySeverity,
    ) -> Self {
        Self {
            id: None,
            name: name.into(),
            description: String::new(),
            source_id: None,
            metric_type: None,
            condition,
            metric_field: metric_field.into(),
            threshold,
            window_minutes: default_window_minutes(),
            consecutive_count: default_consecutive(),
            severity,
            actions: vec![AlertAction::Notify],
            cooldown_minutes: default_cooldown(),
            enabled: true,
            pattern: None,
            last_triggered: None,
            trigger_count: 0,
            tags: Vec::new(),
            created_at: Utc::now(),
        }
    }

    fn in_cooldown(&self, now: DateTime<Utc>) -> bool {
        match self.last_triggered {
            Some(last) => now < last + Duration::minutes(self.cooldown_minutes),
            None => false,
        }
    }
}

/// One firing of a rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertTrigger {
    pub rule_id: String,
    pub rule_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_id: Option<String>,
    pub triggered_at: DateTime<Utc>,
    pub severity: NotifySeverity,
    pub condition_details: Value,
    #[serde(default)]
    pub actions_taken: Vec<String>,
    #[serde(default)]
    pub notification_sent: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notification_result: Option<Value>,
    #[serde(default)]
    pub acknowledged: bool,
    #[serde(default)]
    pub resolved: bool,
}

struct RuleCache {
    rules: Vec<AlertRule>,
    loaded_at: Instant,
}

/// The alert engine.
pub struct AlertRuleEngine {
    store: Store,
    notifier: Arc<dyn Notifier>,
    cache: RwLock<Option<RuleCache>>,
    /// Per-rule trigger serialization for cooldown read-modify-write
    rule_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl AlertRuleEngine {
    pub fn new(store: Store, notifier: Arc<dyn Notifier>) -> Self {
        Self {
            store,
            notifier,
            cache: RwLock::new(None),
            rule_locks: Mutex::new(HashMap::new()),
        }
    }

    // ---- Rule CRUD --------------------------------------------------------

    pub async fn create_rule(&self, rule: &AlertRule) -> CoreResult<String> {
        let doc = serde_json::to_value(rule)?;
        let id = self.store.create(col::ALERT_RULES, doc).await?;
        self.invalidate_cache().await;
        info!(rule = %rule.name, "alert rule created");
        Ok(id.to_hex())
    }

    pub async fn get_rule(&self, rule_id: &str) -> CoreResult<Option<AlertRule>> {
        let doc = self.store.get(col::ALERT_RULES, rule_id).await?;
        doc.map(serde_json::from_value)
            .transpose()
            .map_err(Into::into)
    }

    pub async fn update_rule(&self, rule_id: &str, patch: &Value) -> CoreResult<bool> {
        let updated = self
            .store
            .update_by_id(col::ALERT_RULES, rule_id, &json!({"$set": patch}))
            .await?;
        if updated {
            self.invalidate_cache().await;
        }
        Ok(updated)
    }

    pub async fn delete_rule(&self, rule_id: &str) -> CoreResult<bool> {
        let deleted = self.store.delete_by_id(col::ALERT_RULES, rule_id).await?;
        if deleted {
            self.invalidate_cache().await;
        }
        Ok(deleted)
    }

    pub async fn list_rules(&self, enabled_only: bool) -> CoreResult<Vec<AlertRule>> {
        let filter = if enabled_only {
            json!({"enabled": true})
        } else {
            json!({})
        };
        let docs = self
            .store
            .find(col::ALERT_RULES, &filter, FindOptions::sorted("name", 1))
            .await?;
        docs.into_iter()
            .map(|d| serde_json::from_value(d).map_err(Into::into))
            .collect()
    }

    pub async fn toggle_rule(&self, rule_id: &str, enabled: bool) -> CoreResult<bool> {
        self.update_rule(rule_id, &json!({"enabled": enabled})).await
    }

    // ---- Evaluation -------------------------------------------------------

    /// Evaluate one completed metric against every applicable rule.
    pub async fn evaluate_metric(&self, metric: &PipelineMetric) -> CoreResult<Vec<AlertTrigger>> {
        let rules = self.applicable_rules(Some(&metric.source_id)).await?;
        let now = Utc::now();
        let mut triggers = Vec::new();

        for rule in rules {
            if !rule.enabled || rule.in_cooldown(now) {
                continue;
            }
            let Some(details) = self.evaluate_condition(&rule, metric).await? else {
                continue;
            };
            if let Some(trigger) = self.fire(&rule, metric, details).await? {
                triggers.push(trigger);
            }
        }
        Ok(triggers)
    }

    /// Trailing failure count until the first success, newest first.
    pub async fn evaluate_consecutive_failures(
        &self,
        source_id: &str,
        limit: u64,
    ) -> CoreResult<u64> {
        let recent = self
            .store
            .find(
                col::PIPELINE_METRICS,
                &json!({"source_id": source_id}),
                FindOptions::sorted("started_at", -1).with_limit(limit),
            )
            .await?;

        let mut streak = 0;
        for doc in recent {
            match doc.get("status").and_then(Value::as_str) {
                Some("failed") => streak += 1,
                _ => break,
            }
        }
        Ok(streak)
    }

    async fn evaluate_condition(
        &self,
        rule: &AlertRule,
        metric: &PipelineMetric,
    ) -> CoreResult<Option<Value>> {
        let metric_value = serde_json::to_value(metric)?;
        let field_value = lookup_field(&metric_value, &rule.metric_field);

        let matched = match rule.condition {
            AlertCondition::ThresholdAbove => field_value
                .as_ref()
                .and_then(Value::as_f64)
                .map(|v| v > rule.threshold)
                .unwrap_or(false),
            AlertCondition::ThresholdBelow => field_value
                .as_ref()
                .and_then(Value::as_f64)
                .map(|v| v < rule.threshold)
                .unwrap_or(false),
            AlertCondition::Equals => field_value
                .as_ref()
                .and_then(Value::as_f64)
                .map(|v| (v - rule.threshold).abs() < f64::EPSILON)
                .unwrap_or(false),
            AlertCondition::NotEquals => field_value
                .as_ref()
                .and_then(Value::as_f64)
                .map(|v| (v - rule.threshold).abs() >= f64::EPSILON)
                .unwrap_or(false),
            AlertCondition::ConsecutiveFailures => {
                let streak = self
                    .evaluate_consecutive_failures(&metric.source_id, rule.consecutive_count)
                    .await?;
                streak >= rule.consecutive_count
            }
            AlertCondition::RateAbove | AlertCondition::RateBelow => {
                let rate = self.windowed_average(rule, &metric.source_id).await?;
                match (rate, rule.condition) {
                    (Some(rate), AlertCondition::RateAbove) => rate > rule.threshold,
                    (Some(rate), AlertCondition::RateBelow) => rate < rule.threshold,
                    _ => false,
                }
            }
            AlertCondition::PatternMatch => {
                let text = field_value.as_ref().and_then(Value::as_str).unwrap_or("");
                match &rule.pattern {
                    Some(pattern) => regex::Regex::new(pattern)
                        .map(|re| re.is_match(text))
                        .unwrap_or(false),
                    None => false,
                }
            }
            AlertCondition::MissingData => {
                field_value.as_ref().map(Value::is_null).unwrap_or(true)
            }
        };

        if !matched {
            return Ok(None);
        }
        Ok(Some(json!({
            "condition": rule.condition,
            "field": rule.metric_field,
            "observed": field_value,
            "threshold": rule.threshold,
            "run_id": metric.run_id,
        })))
    }

    /// Average of the rule's field over its time window.
    async fn windowed_average(
        &self,
        rule: &AlertRule,
        source_id: &str,
    ) -> CoreResult<Option<f64>> {
        let cutoff = (Utc::now() - Duration::minutes(rule.window_minutes)).to_rfc3339();
        let field_ref = format!("${}", rule.metric_field);
        let pipeline = vec![
            json!({"$match": {"source_id": source_id, "started_at": {"$gte": cutoff}}}),
            json!({"$group": {"_id": null, "avg": {"$avg": field_ref}}}),
        ];
        let groups = self.store.aggregate(col::PIPELINE_METRICS, &pipeline).await?;
        Ok(groups.first().and_then(|g| g["avg"].as_f64()))
    }

    /// Fire a rule: re-check cooldown under the rule lock, run actions,
    /// stamp the rule, store history.
    async fn fire(
        &self,
        rule: &AlertRule,
        metric: &PipelineMetric,
        details: Value,
    ) -> CoreResult<Option<AlertTrigger>> {
        let rule_id = rule
            .id
            .as_ref()
            .map(|i| i.to_hex())
            .unwrap_or_else(|| rule.name.clone());

        let lock = {
            let mut locks = self.rule_locks.lock().await;
            locks
                .entry(rule_id.clone())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        let _guard = lock.lock().await;

        // Another worker may have fired this rule while we evaluated
        let now = Utc::now();
        if let Some(current) = self.get_rule(&rule_id).await? {
            if current.in_cooldown(now) {
                return Ok(None);
            }
        }

        let mut trigger = AlertTrigger {
            rule_id: rule_id.clone(),
            rule_name: rule.name.clone(),
            source_id: Some(metric.source_id.clone()),
            triggered_at: now,
            severity: rule.severity,
            condition_details: details,
            actions_taken: Vec::new(),
            notification_sent: false,
            notification_result: None,
            acknowledged: false,
            resolved: false,
        };

        for action in &rule.actions {
            match action {
                AlertAction::Notify => {
                    let outcome = self.dispatch(rule, metric, rule.severity, false).await;
                    trigger.notification_sent = outcome.as_ref().map(|o| o.sent).unwrap_or(false);
                    trigger.notification_result =
                        outcome.and_then(|o| serde_json::to_value(o).ok());
                    trigger.actions_taken.push("notify".into());
                }
                AlertAction::Log => {
                    warn!(
                        rule = %rule.name,
                        source_id = %metric.source_id,
                        run_id = %metric.run_id,
                        "alert rule matched"
                    );
                    trigger.actions_taken.push("log".into());
                }
                AlertAction::DisableSource => {
                    self.store
                        .update_one(
                            col::SOURCES,
                            &json!({"_id": metric.source_id}),
                            &json!({"$set": {
                                "status": "disabled",
                                "updated_at": now.to_rfc3339(),
                            }}),
                        )
                        .await?;
                    trigger.actions_taken.push("disable_source".into());
                }
                AlertAction::Escalate => {
                    let escalated = rule.severity.escalate();
                    let outcome = self.dispatch(rule, metric, escalated, true).await;
                    trigger.notification_sent =
                        trigger.notification_sent || outcome.map(|o| o.sent).unwrap_or(false);
                    trigger.actions_taken.push("escalate".into());
                }
            }
        }

        self.store
            .update_one(
                col::ALERT_RULES,
                &json!({"_id": rule_id}),
                &json!({
                    "$set": {"last_triggered": now.to_rfc3339()},
                    "$inc": {"trigger_count": 1},
                }),
            )
            .await?;
        self.invalidate_cache().await;

        let doc = serde_json::to_value(&trigger)?;
        self.store.create(col::ALERT_HISTORY, doc).await?;

        info!(rule = %rule.name, severity = rule.severity.as_str(), "alert fired");
        Ok(Some(trigger))
    }

    /// Dispatch via the notifier with the standard deadline. A failed or
    /// timed-out send is recorded, never raised.
    async fn dispatch(
        &self,
        rule: &AlertRule,
        metric: &PipelineMetric,
        severity: NotifySeverity,
        skip_throttle: bool,
    ) -> Option<corral_protocol::NotifyOutcome> {
        let mut message = AlertMessage::new(
            format!("Alert: {}", rule.name),
            format!(
                "Rule '{}' matched on source {} (run {}): {} {} threshold {}",
                rule.name,
                metric.source_id,
                metric.run_id,
                rule.metric_field,
                condition_verb(rule.condition),
                rule.threshold,
            ),
            severity,
        )
        .with_source(metric.source_id.clone())
        .with_metadata("rule_name", json!(rule.name))
        .with_metadata("run_id", json!(metric.run_id));
        message.skip_throttle = skip_throttle;

        match tokio::time::timeout(NOTIFIER_TIMEOUT, self.notifier.send(message)).await {
            Ok(outcome) => Some(outcome),
            Err(_) => {
                warn!(rule = %rule.name, "notifier dispatch timed out");
                None
            }
        }
    }

    // ---- History ----------------------------------------------------------

    pub async fn get_alert_history(
        &self,
        source_id: Option<&str>,
        limit: u64,
    ) -> CoreResult<Vec<Value>> {
        let mut filter = json!({});
        if let Some(source_id) = source_id {
            filter["source_id"] = json!(source_id);
        }
        self.store
            .find(
                col::ALERT_HISTORY,
                &filter,
                FindOptions::sorted("triggered_at", -1).with_limit(limit),
            )
            .await
    }

    pub async fn acknowledge(&self, trigger_id: &str, who: Option<&str>) -> CoreResult<bool> {
        self.store
            .update_by_id(
                col::ALERT_HISTORY,
                trigger_id,
                &json!({"$set": {
                    "acknowledged": true,
                    "acknowledged_by": who,
                    "acknowledged_at": Utc::now().to_rfc3339(),
                }}),
            )
            .await
    }

    pub async fn resolve(&self, trigger_id: &str, note: Option<&str>) -> CoreResult<bool> {
        self.store
            .update_by_id(
                col::ALERT_HISTORY,
                trigger_id,
                &json!({"$set": {
                    "resolved": true,
                    "resolution_note": note,
                    "resolved_at": Utc::now().to_rfc3339(),
                }}),
            )
            .await
    }

    /// Unresolved alert counts per severity.
    pub async fn active_alert_counts(&self) -> CoreResult<Value> {
        let pipeline = vec![
            json!({"$match": {"resolved": false}}),
            json!({"$group": {"_id": "$severity", "count": {"$sum": 1}}}),
        ];
        let groups = self.store.aggregate(col::ALERT_HISTORY, &pipeline).await?;
        let mut counts = json!({});
        for group in groups {
            if let (Some(severity), Some(count)) =
                (group["_id"].as_str(), group["count"].as_u64())
            {
                counts[severity] = json!(count);
            }
        }
        Ok(counts)
    }

    // ---- Cache ------------------------------------------------------------

    async fn applicable_rules(&self, source_id: Option<&str>) -> CoreResult<Vec<AlertRule>> {
        self.refresh_cache_if_needed().await?;
        let cache = self.cache.read().await;
        let rules = cache.as_ref().map(|c| c.rules.clone()).unwrap_or_default();
        Ok(rules
            .into_iter()
            .filter(|rule| match (&rule.source_id, source_id) {
                (None, _) => true,
                (Some(rule_source), Some(source)) => rule_source == source,
                (Some(_), None) => false,
            })
            .collect())
    }

    async fn refresh_cache_if_needed(&self) -> CoreResult<()> {
        {
            let cache = self.cache.read().await;
            if let Some(cache) = cache.as_ref() {
                if cache.loaded_at.elapsed().as_secs() < RULE_CACHE_TTL_SECS {
                    return Ok(());
                }
            }
        }
        let rules = self.list_rules(true).await?;
        let mut cache = self.cache.write().await;
        *cache = Some(RuleCache {
            rules,
            loaded_at: Instant::now(),
        });
        Ok(())
    }

    async fn invalidate_cache(&self) {
        let mut cache = self.cache.write().await;
        *cache = None;
    }
}

fn condition_verb(condition: AlertCondition) -> &'static str {
    match condition {
        AlertCondition::ThresholdAbove | AlertCondition::RateAbove => "above",
        AlertCondition::ThresholdBelow | AlertCondition::RateBelow => "below",
        AlertCondition::Equals => "equals",
        AlertCondition::NotEquals => "differs from",
        AlertCondition::ConsecutiveFailures => "reached",
        AlertCondition::PatternMatch => "matched pattern with",
        AlertCondition::MissingData => "missing despite",
    }
}

fn lookup_field(doc: &Value, path: &str) -> Option<Value> {
    let mut current = doc;
    for part in path.split('.') {
        current = current.get(part)?;
    }
    Some(current.clone())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cooldown_window() {
        let mut rule = AlertRule::new(
            "err-count",
            AlertCondition::ThresholdAbove,
            "error_count",
            5.0,
            NotifySeverity::Warning,
        );
        rule.cooldown_minutes = 30;

        let now = Utc::now();
        assert!(!rule.in_cooldown(now));

        rule.last_triggered = Some(now - Duration::minutes(10));
        assert!(rule.in_cooldown(now));

        rule.last_triggered = Some(now - Duration::minutes(31));
        assert!(!rule.in_cooldown(now));
    }

    #[test]
    fn test_lookup_field_dotted() {
        let doc = json!({"a": {"b": 3}, "top": 1});
        assert_eq!(lookup_field(&doc, "top"), Some(json!(1)));
        assert_eq!(lookup_field(&doc, "a.b"), Some(json!(3)));
        assert_eq!(lookup_field(&doc, "a.missing"), None);
    }

    #[test]
    fn test_rule_serde_defaults() {
        let raw = json!({
            "name": "failures",
            "condition": "consecutive_failures",
            "metric_field": "status",
            "severity": "error",
        });
        let rule: AlertRule = serde_json::from_value(raw).unwrap();
        assert!(rule.enabled);
        assert_eq!(rule.consecutive_count, 3);
        assert_eq!(rule.cooldown_minutes, 30);
        assert_eq!(rule.window_minutes, 60);
    }
}
