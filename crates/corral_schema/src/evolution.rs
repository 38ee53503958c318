//! Schema evolution: migration planning and record-level application.
//!
//! A [`MigrationPlan`] is an ordered list of [`MigrationStep`]s diffed from
//! two schemas. Steps apply to one record at a time; a failed type
//! conversion nulls the field and logs a warning rather than failing the
//! record. Rollback plans replay the reverse actions in reverse order.

use chrono::{DateTime, Utc};
use corral_protocol::{CoreError, CoreResult};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::time::Instant;
use tracing::warn;

use crate::model::Schema;

/// Kinds of migration steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvolutionAction {
    AddField,
    RemoveField,
    RenameField,
    ChangeType,
    AddConstraint,
    RemoveConstraint,
    SetDefault,
    SetNullable,
    SetRequired,
    MergeFields,
    SplitField,
}

impl EvolutionAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            EvolutionAction::AddField => "add_field",
            EvolutionAction::RemoveField => "remove_field",
            EvolutionAction::RenameField => "rename_field",
            EvolutionAction::ChangeType => "change_type",
            EvolutionAction::AddConstraint => "add_constraint",
            EvolutionAction::RemoveConstraint => "remove_constraint",
            EvolutionAction::SetDefault => "set_default",
            EvolutionAction::SetNullable => "set_nullable",
            EvolutionAction::SetRequired => "set_required",
            EvolutionAction::MergeFields => "merge_fields",
            EvolutionAction::SplitField => "split_field",
        }
    }
}

/// One transformation applied to every record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationStep {
    pub action: EvolutionAction,
    pub field_name: String,
    #[serde(default)]
    pub params: Map<String, Value>,
    #[serde(default = "default_true")]
    pub reversible: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reverse_action: Option<Box<MigrationStep>>,
    #[serde(default)]
    pub description: String,
}

fn default_true() -> bool {
    true
}

impl MigrationStep {
    pub fn new(action: EvolutionAction, field_name: impl Into<String>) -> Self {
        Self {
            action,
            field_name: field_name.into(),
            params: Map::new(),
            reversible: true,
            reverse_action: None,
            description: String::new(),
        }
    }

    pub fn with_param(mut self, key: impl Into<String>, value: Value) -> Self {
        self.params.insert(key.into(), value);
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_reverse(mut self, reverse: MigrationStep) -> Self {
        self.reverse_action = Some(Box::new(reverse));
        self
    }
}

/// Ordered migration between two schema versions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationPlan {
    pub source_id: String,
    pub from_version: u32,
    pub to_version: u32,
    #[serde(default)]
    pub steps: Vec<MigrationStep>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub estimated_records: u64,
    /// Any `add_field` or `change_type` requires touching existing rows
    #[serde(default)]
    pub requires_backfill: bool,
    /// Any `remove_field` or `change_type` can lose information
    #[serde(default)]
    pub breaking_changes: bool,
}

impl MigrationPlan {
    pub fn new(source_id: impl Into<String>, from_version: u32, to_version: u32) -> Self {
        Self {
            source_id: source_id.into(),
            from_version,
            to_version,
            steps: Vec::new(),
            created_at: Utc::now(),
            estimated_records: 0,
            requires_backfill: false,
            breaking_changes: false,
        }
    }

    pub fn add_step(&mut self, step: MigrationStep) {
        if matches!(
            step.action,
            EvolutionAction::AddField | EvolutionAction::ChangeType
        ) {
            self.requires_backfill = true;
        }
        if matches!(
            step.action,
            EvolutionAction::RemoveField | EvolutionAction::ChangeType
        ) {
            self.breaking_changes = true;
        }
        self.steps.push(step);
    }

    /// Step counts per action kind.
    pub fn summary(&self) -> BTreeMap<&'static str, usize> {
        let mut summary = BTreeMap::new();
        for step in &self.steps {
            *summary.entry(step.action.as_str()).or_insert(0) += 1;
        }
        summary
    }
}

/// Outcome of a batch migration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationResult {
    pub success: bool,
    pub total_records: u64,
    pub migrated_count: u64,
    pub failed_count: u64,
    pub skipped_count: u64,
    #[serde(default)]
    pub errors: Vec<Value>,
    pub duration_ms: u64,
}

/// Failed-record handling in batch migrations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnError {
    /// Drop the record from the output
    Skip,
    /// Abort the batch on first failure
    Fail,
    /// Keep the record unmigrated
    Null,
}

/// Migration planner and executor.
#[derive(Debug, Clone, Default)]
pub struct SchemaEvolution;

impl SchemaEvolution {
    pub fn new() -> Self {
        Self
    }

    /// Diff two schemas into an ordered plan: additions, removals, then
    /// per-field changes, each alphabetical.
    pub fn create_plan(
        &self,
        source_id: &str,
        from_schema: &Schema,
        to_schema: &Schema,
        from_version: u32,
        to_version: u32,
    ) -> MigrationPlan {
        let mut plan = MigrationPlan::new(source_id, from_version, to_version);

        let old_names = from_schema.field_names();
        let new_names = to_schema.field_names();

        for name in new_names.difference(&old_names) {
            let field = to_schema.get_field(name).expect("present in target");
            let step = MigrationStep::new(EvolutionAction::AddField, *name)
                .with_param("type", json!(field.field_type.as_str()))
                .with_param("required", json!(field.required))
                .with_param("default", field.default.clone().unwrap_or(Value::Null))
                .with_param("nullable", json!(field.nullable))
                .with_description(format!(
                    "Add field '{name}' with type {}",
                    field.field_type
                ))
                .with_reverse(
                    MigrationStep::new(EvolutionAction::RemoveField, *name)
                        .with_description(format!("Remove field '{name}'")),
                );
            plan.add_step(step);
        }

        for name in old_names.difference(&new_names) {
            let field = from_schema.get_field(name).expect("present in source");
            let original = serde_json::to_value(field).unwrap_or(Value::Null);
            let step = MigrationStep::new(EvolutionAction::RemoveField, *name)
                .with_param("original_field", original.clone())
                .with_description(format!("Remove field '{name}'"))
                .with_reverse(
                    MigrationStep::new(EvolutionAction::AddField, *name)
                        .with_param("original_field", original)
                        .with_description(format!("Restore field '{name}'")),
                );
            plan.add_step(step);
        }

        for name in old_names.intersection(&new_names) {
            let old_field = from_schema.get_field(name).expect("present in source");
            let new_field = to_schema.get_field(name).expect("present in target");

            if old_field.field_type != new_field.field_type {
                let step = MigrationStep::new(EvolutionAction::ChangeType, *name)
                    .with_param("from_type", json!(old_field.field_type.as_str()))
                    .with_param("to_type", json!(new_field.field_type.as_str()))
                    .with_description(format!(
                        "Change type of '{name}' from {} to {}",
                        old_field.field_type, new_field.field_type
                    ))
                    .with_reverse(
                        MigrationStep::new(EvolutionAction::ChangeType, *name)
                            .with_param("from_type", json!(new_field.field_type.as_str()))
                            .with_param("to_type", json!(old_field.field_type.as_str()))
                            .with_description(format!(
                                "Revert type of '{name}' to {}",
                                old_field.field_type
                            )),
                    );
                plan.add_step(step);
            }

            if old_field.required != new_field.required {
                let action = if new_field.required {
                    EvolutionAction::SetRequired
                } else {
                    EvolutionAction::SetNullable
                };
                let step = MigrationStep::new(action, *name)
                    .with_param("default", new_field.default.clone().unwrap_or(Value::Null))
                    .with_description(format!(
                        "Change '{name}' to {}",
                        if new_field.required { "required" } else { "optional" }
                    ));
                plan.add_step(step);
            }

            if old_field.default != new_field.default {
                let step = MigrationStep::new(EvolutionAction::SetDefault, *name)
                    .with_param("old_default", old_field.default.clone().unwrap_or(Value::Null))
                    .with_param("new_default", new_field.default.clone().unwrap_or(Value::Null))
                    .with_description(format!("Change default of '{name}'"));
                plan.add_step(step);
            }
        }

        plan
    }

    /// Apply every step to a copy of `record`.
    pub fn apply(&self, plan: &MigrationPlan, record: &Value) -> CoreResult<Value> {
        let mut result = record
            .as_object()
            .cloned()
            .map(Value::Object)
            .ok_or_else(|| {
                CoreError::DatabaseOperation("migration input must be an object".into())
            })?;

        for step in &plan.steps {
            apply_step(step, &mut result);
        }
        Ok(result)
    }

    /// Migrate a batch with per-record error handling.
    pub fn batch_migrate(
        &self,
        plan: &MigrationPlan,
        records: &[Value],
        on_error: OnError,
    ) -> CoreResult<(Vec<Value>, MigrationResult)> {
        let started = Instant::now();
        let mut migrated = Vec::with_capacity(records.len());
        let mut errors = Vec::new();
        let mut skipped = 0u64;

        for (index, record) in records.iter().enumerate() {
            match self.apply(plan, record) {
                Ok(out) => migrated.push(out),
                Err(e) => match on_error {
                    OnError::Fail => return Err(e),
                    OnError::Skip => {
                        errors.push(json!({"index": index, "error": e.to_string()}));
                        skipped += 1;
                    }
                    OnError::Null => {
                        errors.push(json!({"index": index, "error": e.to_string()}));
                        migrated.push(record.clone());
                    }
                },
            }
        }

        let result = MigrationResult {
            success: errors.is_empty(),
            total_records: records.len() as u64,
            migrated_count: migrated.len() as u64,
            failed_count: errors.len() as u64,
            skipped_count: skipped,
            errors,
            duration_ms: started.elapsed().as_millis() as u64,
        };
        Ok((migrated, result))
    }

    /// Build the inverse plan: reverse actions in reverse order.
    pub fn rollback_plan(&self, plan: &MigrationPlan) -> MigrationPlan {
        let mut rollback =
            MigrationPlan::new(plan.source_id.clone(), plan.to_version, plan.from_version);

        for step in plan.steps.iter().rev() {
            if let Some(reverse) = &step.reverse_action {
                rollback.add_step((**reverse).clone());
            } else if step.reversible {
                if let Some(reverse) = derive_reverse_step(step) {
                    rollback.add_step(reverse);
                }
            }
        }
        rollback
    }

    /// Dry-run the plan's converters over a sample to estimate failure and
    /// data-loss rates.
    pub fn estimate_impact(&self, plan: &MigrationPlan, sample: &[Value]) -> Value {
        if sample.is_empty() {
            return json!({"error": "No sample data provided"});
        }

        let mut affected_fields = Vec::new();
        let mut type_conversions = Map::new();
        let mut potential_data_loss = Map::new();
        let mut risks = Vec::new();

        for step in &plan.steps {
            if !affected_fields.contains(&step.field_name) {
                affected_fields.push(step.field_name.clone());
            }

            match step.action {
                EvolutionAction::ChangeType => {
                    let from = step.params.get("from_type").and_then(Value::as_str);
                    let to = step.params.get("to_type").and_then(Value::as_str);
                    let (Some(from), Some(to)) = (from, to) else {
                        continue;
                    };

                    let mut failures = 0usize;
                    for record in sample {
                        let value = record.get(&step.field_name);
                        if let Some(value) = value.filter(|v| !v.is_null()) {
                            if convert_value(from, to, value).is_err() {
                                failures += 1;
                            }
                        }
                    }

                    type_conversions.insert(
                        step.field_name.clone(),
                        json!({
                            "from": from,
                            "to": to,
                            "estimated_failure_rate": failures as f64 / sample.len() as f64,
                            "sample_failures": failures,
                        }),
                    );
                    if failures > 0 {
                        risks.push(json!({
                            "field": step.field_name,
                            "risk_type": "type_conversion_failure",
                            "affected_records": failures,
                        }));
                    }
                }
                EvolutionAction::RemoveField => {
                    let non_null = sample
                        .iter()
                        .filter(|r| {
                            r.get(&step.field_name).map(|v| !v.is_null()).unwrap_or(false)
                        })
                        .count();
                    potential_data_loss.insert(
                        step.field_name.clone(),
                        json!({
                            "action": "removed",
                            "data_loss_rate": non_null as f64 / sample.len() as f64,
                            "non_null_count": non_null,
                        }),
                    );
                    if non_null > 0 {
                        risks.push(json!({
                            "field": step.field_name,
                            "risk_type": "field_removal",
                            "affected_records": non_null,
                        }));
                    }
                }
                _ => {}
            }
        }

        let risk_level = if !risks.is_empty() {
            "high"
        } else if plan.breaking_changes {
            "medium"
        } else {
            "low"
        };

        json!({
            "affected_fields": affected_fields,
            "step_count": plan.steps.len(),
            "requires_backfill": plan.requires_backfill,
            "breaking_changes": plan.breaking_changes,
            "type_conversions": type_conversions,
            "potential_data_loss": potential_data_loss,
            "data_loss_risks": risks,
            "risk_level": risk_level,
            "sample_size": sample.len(),
            "action_summary": plan.summary(),
        })
    }

    /// Cross-check a plan against its endpoint schemas.
    pub fn validate_plan(
        &self,
        plan: &MigrationPlan,
        from_schema: &Schema,
        to_schema: &Schema,
    ) -> Vec<String> {
        let mut issues = Vec::new();

        for step in &plan.steps {
            match step.action {
                EvolutionAction::AddField => {
                    if to_schema.get_field(&step.field_name).is_none() {
                        issues.push(format!(
                            "add_field '{}' not in target schema",
                            step.field_name
                        ));
                    }
                }
                EvolutionAction::RemoveField => {
                    if from_schema.get_field(&step.field_name).is_none() {
                        issues.push(format!(
                            "remove_field '{}' not in source schema",
                            step.field_name
                        ));
                    }
                }
                EvolutionAction::ChangeType => {
                    let from = step.params.get("from_type").and_then(Value::as_str);
                    let to = step.params.get("to_type").and_then(Value::as_str);

                    if let (Some(from), Some(field)) =
                        (from, from_schema.get_field(&step.field_name))
                    {
                        if field.field_type.as_str() != from {
                            issues.push(format!(
                                "change_type '{}': from_type mismatch (plan: {}, schema: {})",
                                step.field_name, from, field.field_type
                            ));
                        }
                    }
                    if let (Some(to), Some(field)) = (to, to_schema.get_field(&step.field_name)) {
                        if field.field_type.as_str() != to {
                            issues.push(format!(
                                "change_type '{}': to_type mismatch (plan: {}, schema: {})",
                                step.field_name, to, field.field_type
                            ));
                        }
                    }
                    if let (Some(from), Some(to)) = (from, to) {
                        if !has_converter(from, to) {
                            issues.push(format!(
                                "change_type '{}': no converter for {} -> {}",
                                step.field_name, from, to
                            ));
                        }
                    }
                }
                _ => {}
            }
        }
        issues
    }
}

fn apply_step(step: &MigrationStep, record: &mut Value) {
    let field = step.field_name.as_str();

    match step.action {
        EvolutionAction::AddField => {
            let map = record.as_object_mut().expect("object checked by apply");
            if !map.contains_key(field) {
                let default = step
                    .params
                    .get("default")
                    .cloned()
                    .or_else(|| {
                        step.params
                            .get("original_field")
                            .and_then(|f| f.get("default"))
                            .cloned()
                    })
                    .unwrap_or(Value::Null);
                map.insert(field.to_string(), default);
            }
        }
        EvolutionAction::RemoveField => {
            if let Some(map) = record.as_object_mut() {
                map.remove(field);
            }
        }
        EvolutionAction::ChangeType => {
            let from = step.params.get("from_type").and_then(Value::as_str);
            let to = step.params.get("to_type").and_then(Value::as_str);
            let (Some(from), Some(to)) = (from, to) else {
                return;
            };
            let map = record.as_object_mut().expect("object checked by apply");
            if let Some(value) = map.get(field).cloned() {
                match convert_value(from, to, &value) {
                    Ok(converted) => {
                        map.insert(field.to_string(), converted);
                    }
                    Err(reason) => {
                        warn!(field, from, to, reason = %reason, "type conversion failed");
                        map.insert(field.to_string(), Value::Null);
                    }
                }
            }
        }
        EvolutionAction::SetDefault => {
            let map = record.as_object_mut().expect("object checked by apply");
            let absent_or_null = map.get(field).map(Value::is_null).unwrap_or(true);
            if absent_or_null {
                let default = step
                    .params
                    .get("new_default")
                    .cloned()
                    .unwrap_or(Value::Null);
                map.insert(field.to_string(), default);
            }
        }
        EvolutionAction::SetRequired => {
            let map = record.as_object_mut().expect("object checked by apply");
            let absent_or_null = map.get(field).map(Value::is_null).unwrap_or(true);
            if absent_or_null {
                let default = step.params.get("default").cloned().unwrap_or(Value::Null);
                map.insert(field.to_string(), default);
            }
        }
        EvolutionAction::SetNullable
        | EvolutionAction::AddConstraint
        | EvolutionAction::RemoveConstraint => {
            // Schema-level only; records are untouched
        }
        EvolutionAction::RenameField => {
            let old_name = step
                .params
                .get("old_name")
                .and_then(Value::as_str)
                .unwrap_or(field)
                .to_string();
            let new_name = step.params.get("new_name").and_then(Value::as_str);
            let map = record.as_object_mut().expect("object checked by apply");
            if let (Some(value), Some(new_name)) = (map.remove(&old_name), new_name) {
                map.insert(new_name.to_string(), value);
            }
        }
        EvolutionAction::MergeFields => {
            let source_fields: Vec<String> = step
                .params
                .get("source_fields")
                .and_then(Value::as_array)
                .map(|a| {
                    a.iter()
                        .filter_map(Value::as_str)
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default();
            let separator = step
                .params
                .get("separator")
                .and_then(Value::as_str)
                .unwrap_or(" ");
            let remove_sources = step
                .params
                .get("remove_sources")
                .and_then(Value::as_bool)
                .unwrap_or(false);

            let map = record.as_object_mut().expect("object checked by apply");
            let parts: Vec<String> = source_fields
                .iter()
                .filter_map(|f| map.get(f))
                .filter(|v| !v.is_null())
                .map(value_to_text)
                .filter(|s| !s.is_empty())
                .collect();

            let merged = if parts.is_empty() {
                Value::Null
            } else {
                Value::String(parts.join(separator))
            };
            map.insert(field.to_string(), merged);

            if remove_sources {
                for f in &source_fields {
                    map.remove(f);
                }
            }
        }
        EvolutionAction::SplitField => {
            let separator = step
                .params
                .get("separator")
                .and_then(Value::as_str)
                .unwrap_or(" ")
                .to_string();
            let target_fields: Vec<String> = step
                .params
                .get("target_fields")
                .and_then(Value::as_array)
                .map(|a| {
                    a.iter()
                        .filter_map(Value::as_str)
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default();
            let remove_source = step
                .params
                .get("remove_source")
                .and_then(Value::as_bool)
                .unwrap_or(false);

            let map = record.as_object_mut().expect("object checked by apply");
            let source_value = map.get(field).filter(|v| !v.is_null()).map(value_to_text);

            if let Some(text) = source_value {
                let parts: Vec<&str> = text.split(separator.as_str()).collect();
                for (i, target) in target_fields.iter().enumerate() {
                    let value = parts
                        .get(i)
                        .map(|p| Value::String(p.to_string()))
                        .unwrap_or(Value::Null);
                    map.insert(target.clone(), value);
                }
            }
            if remove_source {
                map.remove(field);
            }
        }
    }
}

fn value_to_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn has_converter(from: &str, to: &str) -> bool {
    matches!(
        (from, to),
        ("integer", "string" | "float" | "boolean")
            | ("float", "string" | "integer")
            | ("string", "integer" | "float" | "boolean")
            | ("boolean", "string" | "integer")
            | ("date", "string" | "datetime")
            | ("datetime", "string" | "date")
    )
}

/// Convert a value between field types. Nulls pass through unchanged.
pub fn convert_value(from: &str, to: &str, value: &Value) -> Result<Value, String> {
    if value.is_null() {
        return Ok(Value::Null);
    }

    match (from, to) {
        ("integer", "string") | ("float", "string") => Ok(Value::String(value_to_text(value))),
        ("integer", "float") => value
            .as_f64()
            .map(Value::from)
            .ok_or_else(|| format!("not a number: {value}")),
        ("integer", "boolean") => value
            .as_i64()
            .map(|n| Value::Bool(n != 0))
            .ok_or_else(|| format!("not an integer: {value}")),
        ("float", "integer") => value
            .as_f64()
            .map(|f| Value::from(f as i64))
            .ok_or_else(|| format!("not a number: {value}")),
        ("string", "integer") => {
            let text = value.as_str().ok_or_else(|| format!("not a string: {value}"))?;
            let trimmed = text.trim();
            let digits = trimmed.strip_prefix('-').unwrap_or(trimmed);
            if !digits.is_empty() && digits.chars().all(|c| c.is_ascii_digit()) {
                trimmed
                    .parse::<i64>()
                    .map(Value::from)
                    .map_err(|e| e.to_string())
            } else {
                Err(format!("not an integer string: '{text}'"))
            }
        }
        ("string", "float") => {
            let text = value.as_str().ok_or_else(|| format!("not a string: {value}"))?;
            text.trim()
                .parse::<f64>()
                .map(Value::from)
                .map_err(|_| format!("not a float string: '{text}'"))
        }
        ("string", "boolean") => {
            let text = value.as_str().ok_or_else(|| format!("not a string: {value}"))?;
            Ok(Value::Bool(matches!(
                text.to_lowercase().as_str(),
                "true" | "yes" | "1"
            )))
        }
        ("boolean", "string") => value
            .as_bool()
            .map(|b| Value::String(b.to_string()))
            .ok_or_else(|| format!("not a boolean: {value}")),
        ("boolean", "integer") => value
            .as_bool()
            .map(|b| Value::from(i64::from(b)))
            .ok_or_else(|| format!("not a boolean: {value}")),
        ("date", "string") | ("datetime", "string") | ("date", "datetime") => Ok(value.clone()),
        ("datetime", "date") => {
            let text = value.as_str().ok_or_else(|| format!("not a string: {value}"))?;
            // "2024-01-15T10:30:00Z" -> "2024-01-15"
            let date_part: String = text.chars().take(10).collect();
            Ok(Value::String(date_part))
        }
        _ => Err(format!("no converter for {from} -> {to}")),
    }
}

fn derive_reverse_step(step: &MigrationStep) -> Option<MigrationStep> {
    match step.action {
        EvolutionAction::AddField => Some(
            MigrationStep::new(EvolutionAction::RemoveField, step.field_name.clone())
                .with_description(format!("Rollback: remove added field '{}'", step.field_name)),
        ),
        EvolutionAction::RemoveField => {
            let mut reverse =
                MigrationStep::new(EvolutionAction::AddField, step.field_name.clone())
                    .with_description(format!(
                        "Rollback: restore removed field '{}'",
                        step.field_name
                    ));
            if let Some(original) = step.params.get("original_field") {
                reverse
                    .params
                    .insert("original_field".into(), original.clone());
            }
            Some(reverse)
        }
        EvolutionAction::ChangeType => {
            let from = step.params.get("from_type")?.clone();
            let to = step.params.get("to_type")?.clone();
            Some(
                MigrationStep::new(EvolutionAction::ChangeType, step.field_name.clone())
                    .with_param("from_type", to)
                    .with_param("to_type", from)
                    .with_description(format!(
                        "Rollback: revert type change of '{}'",
                        step.field_name
                    )),
            )
        }
        EvolutionAction::SetDefault => Some(
            MigrationStep::new(EvolutionAction::SetDefault, step.field_name.clone())
                .with_param(
                    "old_default",
                    step.params.get("new_default").cloned().unwrap_or(Value::Null),
                )
                .with_param(
                    "new_default",
                    step.params.get("old_default").cloned().unwrap_or(Value::Null),
                )
                .with_description(format!("Rollback: revert default of '{}'", step.field_name)),
        ),
        EvolutionAction::RenameField => {
            let old_name = step.params.get("old_name").cloned();
            let new_name = step.params.get("new_name")?.clone();
            Some(
                MigrationStep::new(EvolutionAction::RenameField, step.field_name.clone())
                    .with_param("old_name", new_name)
                    .with_param(
                        "new_name",
                        old_name.unwrap_or(Value::String(step.field_name.clone())),
                    )
                    .with_description(format!("Rollback: rename back '{}'", step.field_name)),
            )
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{FieldSchema, FieldType};

    fn v1() -> Schema {
        Schema::new(vec![
            FieldSchema::new("title", FieldType::String).required(),
            FieldSchema::new("views", FieldType::String),
            FieldSchema::new("legacy", FieldType::String),
        ])
    }

    fn v2() -> Schema {
        Schema::new(vec![
            FieldSchema::new("title", FieldType::String).required(),
            FieldSchema::new("views", FieldType::Integer),
            FieldSchema::new("author", FieldType::String).with_default(json!("unknown")),
        ])
    }

    #[test]
    fn test_plan_flags_and_summary() {
        let plan = SchemaEvolution::new().create_plan("src1", &v1(), &v2(), 1, 2);
        assert!(plan.requires_backfill);
        assert!(plan.breaking_changes);

        let summary = plan.summary();
        assert_eq!(summary["add_field"], 1);
        assert_eq!(summary["remove_field"], 1);
        assert_eq!(summary["change_type"], 1);
    }

    #[test]
    fn test_apply_add_remove_convert() {
        let evolution = SchemaEvolution::new();
        let plan = evolution.create_plan("src1", &v1(), &v2(), 1, 2);

        let record = json!({"title": "t", "views": "42", "legacy": "x"});
        let migrated = evolution.apply(&plan, &record).unwrap();

        assert_eq!(migrated["author"], "unknown");
        assert_eq!(migrated["views"], 42);
        assert!(migrated.get("legacy").is_none());
    }

    #[test]
    fn test_failed_conversion_nulls_field() {
        let evolution = SchemaEvolution::new();
        let plan = evolution.create_plan("src1", &v1(), &v2(), 1, 2);

        let record = json!({"title": "t", "views": "not-a-number"});
        let migrated = evolution.apply(&plan, &record).unwrap();
        assert_eq!(migrated["views"], Value::Null);
    }

    #[test]
    fn test_rename_merge_split() {
        let evolution = SchemaEvolution::new();
        let mut plan = MigrationPlan::new("src1", 1, 2);
        plan.add_step(
            MigrationStep::new(EvolutionAction::RenameField, "old")
                .with_param("old_name", json!("old"))
                .with_param("new_name", json!("fresh")),
        );
        plan.add_step(
            MigrationStep::new(EvolutionAction::MergeFields, "full_name")
                .with_param("source_fields", json!(["first", "last"]))
                .with_param("separator", json!(" "))
                .with_param("remove_sources", json!(true)),
        );
        plan.add_step(
            MigrationStep::new(EvolutionAction::SplitField, "pair")
                .with_param("separator", json!("-"))
                .with_param("target_fields", json!(["left", "right"]))
                .with_param("remove_source", json!(true)),
        );

        let record = json!({"old": 1, "first": "Kim", "last": "Minsu", "pair": "a-b"});
        let migrated = evolution.apply(&plan, &record).unwrap();

        assert_eq!(migrated["fresh"], 1);
        assert!(migrated.get("old").is_none());
        assert_eq!(migrated["full_name"], "Kim Minsu");
        assert!(migrated.get("first").is_none());
        assert_eq!(migrated["left"], "a");
        assert_eq!(migrated["right"], "b");
        assert!(migrated.get("pair").is_none());
    }

    #[test]
    fn test_batch_migrate_counts() {
        let evolution = SchemaEvolution::new();
        let plan = evolution.create_plan("src1", &v1(), &v2(), 1, 2);
        let records = vec![
            json!({"title": "a", "views": "1"}),
            json!({"title": "b", "views": "2"}),
            json!("not-an-object"),
        ];

        let (migrated, result) = evolution
            .batch_migrate(&plan, &records, OnError::Skip)
            .unwrap();
        assert_eq!(migrated.len(), 2);
        assert!(!result.success);
        assert_eq!(result.total_records, 3);
        assert_eq!(result.migrated_count, 2);
        assert_eq!(result.skipped_count, 1);
        assert_eq!(result.errors.len(), 1);
    }

    #[test]
    fn test_batch_migrate_fail_mode() {
        let evolution = SchemaEvolution::new();
        let plan = evolution.create_plan("src1", &v1(), &v2(), 1, 2);
        let records = vec![json!("oops")];
        assert!(evolution
            .batch_migrate(&plan, &records, OnError::Fail)
            .is_err());
    }

    #[test]
    fn test_rollback_roundtrip_restores_structure() {
        let evolution = SchemaEvolution::new();
        let plan = evolution.create_plan("src1", &v1(), &v2(), 1, 2);
        let rollback = evolution.rollback_plan(&plan);

        assert_eq!(rollback.from_version, 2);
        assert_eq!(rollback.to_version, 1);

        let record = json!({"title": "t", "views": "42", "legacy": "x"});
        let migrated = evolution.apply(&plan, &record).unwrap();
        let restored = evolution.apply(&rollback, &migrated).unwrap();

        // Added field removed, removed field restored (default null), type reverted
        assert!(restored.get("author").is_none());
        assert!(restored.get("legacy").is_some());
        assert_eq!(restored["views"], "42");
    }

    #[test]
    fn test_estimate_impact_flags_lossy_plan() {
        let evolution = SchemaEvolution::new();
        let plan = evolution.create_plan("src1", &v1(), &v2(), 1, 2);
        let sample = vec![
            json!({"title": "a", "views": "10", "legacy": "keep"}),
            json!({"title": "b", "views": "oops", "legacy": null}),
        ];

        let impact = evolution.estimate_impact(&plan, &sample);
        assert_eq!(impact["risk_level"], "high");
        assert_eq!(impact["type_conversions"]["views"]["sample_failures"], 1);
        assert_eq!(impact["potential_data_loss"]["legacy"]["non_null_count"], 1);
    }

    #[test]
    fn test_validate_plan_catches_mismatches() {
        let evolution = SchemaEvolution::new();
        let mut plan = MigrationPlan::new("src1", 1, 2);
        plan.add_step(MigrationStep::new(EvolutionAction::AddField, "ghost"));
        plan.add_step(
            MigrationStep::new(EvolutionAction::ChangeType, "views")
                .with_param("from_type", json!("integer"))
                .with_param("to_type", json!("object")),
        );

        let issues = evolution.validate_plan(&plan, &v1(), &v2());
        assert!(issues.iter().any(|i| i.contains("ghost")));
        assert!(issues.iter().any(|i| i.contains("from_type mismatch")));
        assert!(issues.iter().any(|i| i.contains("no converter")));
    }

    #[test]
    fn test_converters() {
        assert_eq!(convert_value("string", "integer", &json!(" 42 ")).unwrap(), json!(42));
        assert!(convert_value("string", "integer", &json!("4.2")).is_err());
        assert_eq!(convert_value("string", "boolean", &json!("Yes")).unwrap(), json!(true));
        assert_eq!(convert_value("boolean", "integer", &json!(true)).unwrap(), json!(1));
        assert_eq!(
            convert_value("datetime", "date", &json!("2024-01-15T10:30:00Z")).unwrap(),
            json!("2024-01-15")
        );
        assert_eq!(convert_value("integer", "float", &json!(3)).unwrap(), json!(3.0));
        assert_eq!(convert_value("float", "integer", &json!(3.9)).unwrap(), json!(3));
        assert_eq!(convert_value("integer", "string", &json!(7)).unwrap(), json!("7"));
        // Nulls pass through
        assert_eq!(convert_value("string", "integer", &Value::Null).unwrap(), Value::Null);
    }
}
