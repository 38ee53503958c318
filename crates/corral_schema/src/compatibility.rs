//! Schema compatibility checking.
//!
//! BACKWARD: the new schema can read data written under the old one, so
//! required fields may not appear without defaults and types may not
//! narrow. FORWARD: the old schema can read new data, so fields may not be
//! removed and types may not widen. FULL is both. `_transitive` variants
//! apply the same rules against every prior active version.

use serde_json::Value;

use crate::model::{
    CompatibilityIssue, CompatibilityMode, CompatibilityResult, FieldSchema, FieldType,
    IssueSeverity, Schema,
};
use chrono::Utc;

/// Widening conversions: lossless, safe for readers of old data.
pub fn widens_to(from: FieldType, to: FieldType) -> bool {
    use FieldType::*;
    matches!(
        (from, to),
        (Integer, Float | String | Any)
            | (Float, String | Any)
            | (Boolean, String | Integer | Any)
            | (Date, DateTime | String | Any)
            | (DateTime, String | Any)
            | (String, Any)
            | (Array, Any)
            | (Object, Any)
    )
}

/// Narrowing conversions: potentially lossy, only forward-safe.
pub fn narrows_to(from: FieldType, to: FieldType) -> bool {
    use FieldType::*;
    matches!(
        (from, to),
        (
            Any,
            String | Integer | Float | Boolean | Date | DateTime | Array | Object
        ) | (String, Integer | Float | Boolean | Date | DateTime)
            | (Float, Integer)
            | (DateTime, Date)
    )
}

/// Pure schema-pair compatibility checker.
#[derive(Debug, Clone, Default)]
pub struct CompatibilityChecker {
    /// Treat warnings as incompatibilities too
    pub strict_mode: bool,
}

impl CompatibilityChecker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn strict() -> Self {
        Self { strict_mode: true }
    }

    /// Check `new` against `old` under `mode`.
    pub fn check(
        &self,
        old: &Schema,
        new: &Schema,
        mode: CompatibilityMode,
    ) -> CompatibilityResult {
        if mode == CompatibilityMode::None {
            return CompatibilityResult::compatible(mode);
        }

        let mut issues = Vec::new();

        let old_names = old.field_names();
        let new_names = new.field_names();

        for name in new_names.difference(&old_names) {
            let field = new.get_field(name).expect("present in new");
            issues.push(added_field_issue(field, mode));
        }

        for name in old_names.difference(&new_names) {
            let field = old.get_field(name).expect("present in old");
            issues.push(removed_field_issue(field, mode));
        }

        for name in old_names.intersection(&new_names) {
            let old_field = old.get_field(name).expect("present in old");
            let new_field = new.get_field(name).expect("present in new");
            check_type_change(old_field, new_field, mode, &mut issues);
            check_required_change(old_field, new_field, mode, &mut issues);
            check_constraint_changes(old_field, new_field, mode, &mut issues);
            check_nullable_change(old_field, new_field, mode, &mut issues);
        }

        let mut has_errors = issues.iter().any(|i| i.is_error());
        if self.strict_mode {
            has_errors = has_errors || issues.iter().any(|i| i.is_warning());
        }

        CompatibilityResult {
            is_compatible: !has_errors,
            issues,
            mode,
            checked_at: Utc::now(),
        }
    }

    /// Check against every prior version; the result is the conjunction.
    pub fn check_all(
        &self,
        priors: &[&Schema],
        new: &Schema,
        mode: CompatibilityMode,
    ) -> CompatibilityResult {
        let mut combined = CompatibilityResult::compatible(mode);
        for old in priors {
            let result = self.check(old, new, mode);
            combined.is_compatible = combined.is_compatible && result.is_compatible;
            combined.issues.extend(result.issues);
        }
        combined
    }

    /// Whether a single type transition is allowed under `mode`.
    pub fn is_type_compatible(
        &self,
        from: FieldType,
        to: FieldType,
        mode: CompatibilityMode,
    ) -> bool {
        if from == to || mode == CompatibilityMode::None {
            return true;
        }
        match mode {
            CompatibilityMode::Backward | CompatibilityMode::BackwardTransitive => {
                widens_to(from, to)
            }
            CompatibilityMode::Forward | CompatibilityMode::ForwardTransitive => {
                narrows_to(from, to)
            }
            // FULL admits only identical types
            _ => false,
        }
    }
}

fn issue(
    field: &str,
    issue_type: &str,
    severity: IssueSeverity,
    message: String,
) -> CompatibilityIssue {
    CompatibilityIssue {
        field_name: field.to_string(),
        issue_type: issue_type.to_string(),
        severity,
        message,
        old_value: None,
        new_value: None,
    }
}

fn added_field_issue(field: &FieldSchema, mode: CompatibilityMode) -> CompatibilityIssue {
    let name = &field.name;

    if mode.is_backward_family() {
        if field.required && field.default.is_none() {
            issue(
                name,
                "added_required_field",
                IssueSeverity::Error,
                format!("required field '{name}' added without a default"),
            )
        } else if field.required {
            issue(
                name,
                "added_required_field_with_default",
                IssueSeverity::Warning,
                format!("required field '{name}' added with a default"),
            )
        } else {
            issue(
                name,
                "added_optional_field",
                IssueSeverity::Info,
                format!("optional field '{name}' added"),
            )
        }
    } else {
        issue(
            name,
            "added_field",
            IssueSeverity::Info,
            format!("field '{name}' added"),
        )
    }
}

fn removed_field_issue(field: &FieldSchema, mode: CompatibilityMode) -> CompatibilityIssue {
    let name = &field.name;

    if mode.is_forward_family() {
        issue(
            name,
            "removed_field",
            IssueSeverity::Error,
            format!("field '{name}' removed"),
        )
    } else {
        let severity = if field.required {
            IssueSeverity::Warning
        } else {
            IssueSeverity::Info
        };
        issue(
            name,
            "removed_field",
            severity,
            format!("field '{name}' removed"),
        )
    }
}

fn check_type_change(
    old: &FieldSchema,
    new: &FieldSchema,
    mode: CompatibilityMode,
    issues: &mut Vec<CompatibilityIssue>,
) {
    if old.field_type == new.field_type {
        return;
    }

    let name = &old.name;
    let transition = format!("'{}' -> '{}'", old.field_type, new.field_type);
    let mut found = if widens_to(old.field_type, new.field_type) {
        let severity = if mode.is_forward_family() {
            IssueSeverity::Error
        } else {
            IssueSeverity::Info
        };
        issue(
            name,
            "type_widened",
            severity,
            format!("type widened {transition}"),
        )
    } else if narrows_to(old.field_type, new.field_type) {
        let severity = if mode.is_backward_family() {
            IssueSeverity::Error
        } else {
            IssueSeverity::Warning
        };
        issue(
            name,
            "type_narrowed",
            severity,
            format!("type narrowed {transition}"),
        )
    } else {
        issue(
            name,
            "type_incompatible",
            IssueSeverity::Error,
            format!("incompatible type change {transition}"),
        )
    };

    found.old_value = Some(Value::String(old.field_type.to_string()));
    found.new_value = Some(Value::String(new.field_type.to_string()));
    issues.push(found);
}

fn check_required_change(
    old: &FieldSchema,
    new: &FieldSchema,
    mode: CompatibilityMode,
    issues: &mut Vec<CompatibilityIssue>,
) {
    if old.required == new.required {
        return;
    }
    let name = &old.name;

    if new.required {
        // optional -> required
        if mode.is_backward_family() {
            if new.default.is_none() {
                issues.push(issue(
                    name,
                    "optional_to_required",
                    IssueSeverity::Error,
                    format!("'{name}' changed optional -> required without a default"),
                ));
            } else {
                issues.push(issue(
                    name,
                    "optional_to_required",
                    IssueSeverity::Warning,
                    format!("'{name}' changed optional -> required with a default"),
                ));
            }
        } else {
            issues.push(issue(
                name,
                "optional_to_required",
                IssueSeverity::Info,
                format!("'{name}' changed optional -> required"),
            ));
        }
    } else {
        // required -> optional
        let severity = if mode.is_forward_family() {
            IssueSeverity::Error
        } else {
            IssueSeverity::Info
        };
        issues.push(issue(
            name,
            "required_to_optional",
            severity,
            format!("'{name}' changed required -> optional"),
        ));
    }
}

fn check_nullable_change(
    old: &FieldSchema,
    new: &FieldSchema,
    mode: CompatibilityMode,
    issues: &mut Vec<CompatibilityIssue>,
) {
    if old.nullable == new.nullable {
        return;
    }
    let name = &old.name;

    if old.nullable && !new.nullable {
        let severity = if mode.is_backward_family() {
            IssueSeverity::Error
        } else {
            IssueSeverity::Warning
        };
        issues.push(issue(
            name,
            "nullable_removed",
            severity,
            format!("'{name}' is no longer nullable"),
        ));
    } else {
        issues.push(issue(
            name,
            "nullable_added",
            IssueSeverity::Info,
            format!("'{name}' became nullable"),
        ));
    }
}

fn check_constraint_changes(
    old: &FieldSchema,
    new: &FieldSchema,
    mode: CompatibilityMode,
    issues: &mut Vec<CompatibilityIssue>,
) {
    let name = &old.name;
    let tightened_severity = if mode.is_backward_family() {
        IssueSeverity::Error
    } else {
        IssueSeverity::Warning
    };

    if let (Some(old_min), Some(new_min)) = (old.min_value, new.min_value) {
        if new_min > old_min {
            let mut found = issue(
                name,
                "min_value_increased",
                tightened_severity,
                format!("min_value tightened {old_min} -> {new_min}"),
            );
            found.old_value = Some(Value::from(old_min));
            found.new_value = Some(Value::from(new_min));
            issues.push(found);
        }
    }

    if let (Some(old_max), Some(new_max)) = (old.max_value, new.max_value) {
        if new_max < old_max {
            let mut found = issue(
                name,
                "max_value_decreased",
                tightened_severity,
                format!("max_value tightened {old_max} -> {new_max}"),
            );
            found.old_value = Some(Value::from(old_max));
            found.new_value = Some(Value::from(new_max));
            issues.push(found);
        }
    }

    if let (Some(old_min), Some(new_min)) = (old.min_length, new.min_length) {
        if new_min > old_min {
            issues.push(issue(
                name,
                "min_length_increased",
                tightened_severity,
                format!("min_length tightened {old_min} -> {new_min}"),
            ));
        }
    }

    if let (Some(old_max), Some(new_max)) = (old.max_length, new.max_length) {
        if new_max < old_max {
            issues.push(issue(
                name,
                "max_length_decreased",
                tightened_severity,
                format!("max_length tightened {old_max} -> {new_max}"),
            ));
        }
    }

    if let (Some(old_enum), Some(new_enum)) = (&old.enum_values, &new.enum_values) {
        let removed: Vec<&Value> = old_enum.iter().filter(|v| !new_enum.contains(v)).collect();
        let added: Vec<&Value> = new_enum.iter().filter(|v| !old_enum.contains(v)).collect();

        if !removed.is_empty() {
            let mut found = issue(
                name,
                "enum_values_removed",
                tightened_severity,
                format!("{} enum value(s) removed", removed.len()),
            );
            found.old_value = Some(Value::Array(old_enum.clone()));
            found.new_value = Some(Value::Array(new_enum.clone()));
            issues.push(found);
        }

        if !added.is_empty() {
            let severity = if mode.is_forward_family() {
                IssueSeverity::Warning
            } else {
                IssueSeverity::Info
            };
            issues.push(issue(
                name,
                "enum_values_added",
                severity,
                format!("{} enum value(s) added", added.len()),
            ));
        }
    }

    if old.pattern != new.pattern {
        match (&old.pattern, &new.pattern) {
            (Some(old_pat), Some(new_pat)) => {
                issues.push(issue(
                    name,
                    "pattern_changed",
                    IssueSeverity::Warning,
                    format!("pattern changed '{old_pat}' -> '{new_pat}'"),
                ));
            }
            (None, Some(new_pat)) => {
                issues.push(issue(
                    name,
                    "pattern_added",
                    tightened_severity,
                    format!("pattern added '{new_pat}'"),
                ));
            }
            (Some(old_pat), None) => {
                issues.push(issue(
                    name,
                    "pattern_removed",
                    IssueSeverity::Info,
                    format!("pattern removed '{old_pat}'"),
                ));
            }
            (None, None) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::FieldSchema;
    use serde_json::json;

    fn schema(fields: Vec<FieldSchema>) -> Schema {
        Schema::new(fields)
    }

    fn field(name: &str, ty: FieldType) -> FieldSchema {
        FieldSchema::new(name, ty)
    }

    #[test]
    fn test_reflexive_for_every_mode() {
        let s = schema(vec![
            field("a", FieldType::String).required(),
            field("b", FieldType::Integer),
        ]);
        for mode in [
            CompatibilityMode::None,
            CompatibilityMode::Backward,
            CompatibilityMode::Forward,
            CompatibilityMode::Full,
            CompatibilityMode::BackwardTransitive,
            CompatibilityMode::ForwardTransitive,
            CompatibilityMode::FullTransitive,
        ] {
            let result = CompatibilityChecker::new().check(&s, &s, mode);
            assert!(result.is_compatible, "mode {mode} not reflexive");
        }
    }

    #[test]
    fn test_added_required_field_breaks_backward() {
        let old = schema(vec![field("title", FieldType::String).required()]);
        let new = schema(vec![
            field("title", FieldType::String).required(),
            field("author", FieldType::String).required(),
        ]);

        let result =
            CompatibilityChecker::new().check(&old, &new, CompatibilityMode::Backward);
        assert!(!result.is_compatible);
        let errors = result.errors();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].field_name, "author");
        assert_eq!(errors[0].issue_type, "added_required_field");
    }

    #[test]
    fn test_added_optional_field_is_backward_safe() {
        let old = schema(vec![field("title", FieldType::String).required()]);
        let new = schema(vec![
            field("title", FieldType::String).required(),
            field("author", FieldType::String).with_default(json!(null)),
        ]);

        let result =
            CompatibilityChecker::new().check(&old, &new, CompatibilityMode::Backward);
        assert!(result.is_compatible);
        assert!(result.errors().is_empty());
    }

    #[test]
    fn test_removed_field_breaks_forward_only() {
        let old = schema(vec![
            field("title", FieldType::String),
            field("extra", FieldType::String),
        ]);
        let new = schema(vec![field("title", FieldType::String)]);

        let checker = CompatibilityChecker::new();
        assert!(!checker.check(&old, &new, CompatibilityMode::Forward).is_compatible);
        assert!(checker.check(&old, &new, CompatibilityMode::Backward).is_compatible);
    }

    #[test]
    fn test_every_widening_is_backward_compatible() {
        use FieldType::*;
        let widenings = [
            (Integer, Float),
            (Integer, String),
            (Integer, Any),
            (Float, String),
            (Boolean, String),
            (Boolean, Integer),
            (Date, DateTime),
            (Date, String),
            (DateTime, String),
            (String, Any),
            (Array, Any),
            (Object, Any),
        ];
        let checker = CompatibilityChecker::new();
        for (from, to) in widenings {
            let old = schema(vec![field("x", from)]);
            let new = schema(vec![field("x", to)]);
            let result = checker.check(&old, &new, CompatibilityMode::Backward);
            assert!(result.is_compatible, "widening {from} -> {to} should pass");
        }
    }

    #[test]
    fn test_narrowing_breaks_backward() {
        let old = schema(vec![field("x", FieldType::Float)]);
        let new = schema(vec![field("x", FieldType::Integer)]);
        let result =
            CompatibilityChecker::new().check(&old, &new, CompatibilityMode::Backward);
        assert!(!result.is_compatible);
        assert_eq!(result.errors()[0].issue_type, "type_narrowed");
    }

    #[test]
    fn test_unrelated_type_change_fails_every_checked_mode() {
        let old = schema(vec![field("x", FieldType::Array)]);
        let new = schema(vec![field("x", FieldType::Integer)]);
        let checker = CompatibilityChecker::new();
        for mode in [
            CompatibilityMode::Backward,
            CompatibilityMode::Forward,
            CompatibilityMode::Full,
        ] {
            let result = checker.check(&old, &new, mode);
            assert!(!result.is_compatible);
            assert_eq!(result.errors()[0].issue_type, "type_incompatible");
        }
    }

    #[test]
    fn test_nullable_removed_breaks_backward() {
        let mut old_field = field("x", FieldType::String);
        old_field.nullable = true;
        let mut new_field = field("x", FieldType::String);
        new_field.nullable = false;

        let result = CompatibilityChecker::new().check(
            &schema(vec![old_field]),
            &schema(vec![new_field]),
            CompatibilityMode::Backward,
        );
        assert!(!result.is_compatible);
        assert_eq!(result.errors()[0].issue_type, "nullable_removed");
    }

    #[test]
    fn test_tightened_constraints_break_backward() {
        let mut old_field = field("x", FieldType::Integer);
        old_field.min_value = Some(0.0);
        old_field.max_value = Some(100.0);
        let mut new_field = field("x", FieldType::Integer);
        new_field.min_value = Some(10.0);
        new_field.max_value = Some(50.0);

        let result = CompatibilityChecker::new().check(
            &schema(vec![old_field]),
            &schema(vec![new_field]),
            CompatibilityMode::Backward,
        );
        assert!(!result.is_compatible);
        let types: Vec<&str> = result.errors().iter().map(|e| e.issue_type.as_str()).collect();
        assert!(types.contains(&"min_value_increased"));
        assert!(types.contains(&"max_value_decreased"));
    }

    #[test]
    fn test_enum_changes() {
        let mut old_field = field("x", FieldType::String);
        old_field.enum_values = Some(vec![json!("a"), json!("b")]);
        let mut new_field = field("x", FieldType::String);
        new_field.enum_values = Some(vec![json!("a"), json!("c")]);

        let checker = CompatibilityChecker::new();
        let backward = checker.check(
            &schema(vec![old_field.clone()]),
            &schema(vec![new_field.clone()]),
            CompatibilityMode::Backward,
        );
        assert!(!backward.is_compatible);

        let forward = checker.check(
            &schema(vec![old_field]),
            &schema(vec![new_field]),
            CompatibilityMode::Forward,
        );
        // Removal is only a warning forward; addition is a warning too
        assert!(forward.is_compatible);
    }

    #[test]
    fn test_strict_mode_promotes_warnings() {
        let old = schema(vec![field("x", FieldType::String).required()]);
        let new = schema(vec![]);

        // Removing a required field is a warning under BACKWARD
        let lax = CompatibilityChecker::new().check(&old, &new, CompatibilityMode::Backward);
        assert!(lax.is_compatible);

        let strict = CompatibilityChecker::strict().check(&old, &new, CompatibilityMode::Backward);
        assert!(!strict.is_compatible);
    }

    #[test]
    fn test_check_all_is_conjunction() {
        let v1 = schema(vec![field("a", FieldType::String)]);
        let v2 = schema(vec![field("a", FieldType::String), field("b", FieldType::Integer)]);
        let new = schema(vec![
            field("a", FieldType::String),
            field("b", FieldType::Integer),
            field("c", FieldType::String).required(),
        ]);

        let result = CompatibilityChecker::new().check_all(
            &[&v1, &v2],
            &new,
            CompatibilityMode::BackwardTransitive,
        );
        assert!(!result.is_compatible);
    }

    #[test]
    fn test_mode_none_skips_everything() {
        let old = schema(vec![field("a", FieldType::Array)]);
        let new = schema(vec![field("a", FieldType::Integer).required()]);
        let result = CompatibilityChecker::new().check(&old, &new, CompatibilityMode::None);
        assert!(result.is_compatible);
        assert!(result.issues.is_empty());
    }
}
