//! Filter evaluation for the in-memory engine.
//!
//! Implements the query operator subset the control plane uses: implicit
//! equality, `$eq`, `$ne`, `$gt`, `$gte`, `$lt`, `$lte`, `$in`, `$nin`,
//! `$exists`, `$regex`, plus top-level `$or`/`$and`. Field paths may be
//! dotted. Values compare the way the driver engine compares them: numbers
//! numerically, strings lexically (RFC 3339 timestamps therefore compare
//! chronologically), booleans, null.

use serde_json::Value;
use std::cmp::Ordering;

use crate::backend::Document;

/// Look up a possibly dotted path inside a document.
pub fn lookup<'a>(doc: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = doc;
    for part in path.split('.') {
        match current {
            Value::Object(map) => current = map.get(part)?,
            _ => return None,
        }
    }
    Some(current)
}

/// Total order over the JSON values we store.
///
/// Cross-type comparisons order by type rank (null < bool < number <
/// string < array < object), mirroring BSON's canonical ordering closely
/// enough for our sorts.
pub fn compare_values(a: &Value, b: &Value) -> Ordering {
    fn rank(v: &Value) -> u8 {
        match v {
            Value::Null => 0,
            Value::Bool(_) => 1,
            Value::Number(_) => 2,
            Value::String(_) => 3,
            Value::Array(_) => 4,
            Value::Object(_) => 5,
        }
    }

    match (a, b) {
        (Value::Number(x), Value::Number(y)) => {
            let xf = x.as_f64().unwrap_or(0.0);
            let yf = y.as_f64().unwrap_or(0.0);
            xf.partial_cmp(&yf).unwrap_or(Ordering::Equal)
        }
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        _ => rank(a).cmp(&rank(b)),
    }
}

/// Whether `doc` matches `filter`.
pub fn matches(doc: &Document, filter: &Document) -> bool {
    let Some(conditions) = filter.as_object() else {
        return true;
    };

    for (key, condition) in conditions {
        let matched = match key.as_str() {
            "$or" => condition
                .as_array()
                .map(|alts| alts.iter().any(|alt| matches(doc, alt)))
                .unwrap_or(false),
            "$and" => condition
                .as_array()
                .map(|alts| alts.iter().all(|alt| matches(doc, alt)))
                .unwrap_or(false),
            path => matches_field(lookup(doc, path), condition),
        };
        if !matched {
            return false;
        }
    }
    true
}

fn matches_field(actual: Option<&Value>, condition: &Value) -> bool {
    // Operator object vs direct equality
    if let Some(ops) = condition.as_object() {
        if ops.keys().any(|k| k.starts_with('$')) {
            return ops.iter().all(|(op, operand)| {
                matches_operator(actual, op, operand)
            });
        }
    }

    match actual {
        Some(value) => value == condition,
        None => condition.is_null(),
    }
}

fn matches_operator(actual: Option<&Value>, op: &str, operand: &Value) -> bool {
    match op {
        "$exists" => {
            let wanted = operand.as_bool().unwrap_or(true);
            actual.is_some() == wanted
        }
        "$eq" => match actual {
            Some(value) => value == operand,
            None => operand.is_null(),
        },
        "$ne" => match actual {
            Some(value) => value != operand,
            None => !operand.is_null(),
        },
        "$in" => {
            let Some(candidates) = operand.as_array() else {
                return false;
            };
            match actual {
                Some(value) => candidates.iter().any(|c| c == value),
                None => candidates.iter().any(|c| c.is_null()),
            }
        }
        "$nin" => {
            let Some(candidates) = operand.as_array() else {
                return true;
            };
            match actual {
                Some(value) => !candidates.iter().any(|c| c == value),
                None => !candidates.iter().any(|c| c.is_null()),
            }
        }
        "$gt" | "$gte" | "$lt" | "$lte" => {
            let Some(value) = actual else { return false };
            // Comparisons only apply within the same type family
            if std::mem::discriminant(value) != std::mem::discriminant(operand) {
                return false;
            }
            let ord = compare_values(value, operand);
            match op {
                "$gt" => ord == Ordering::Greater,
                "$gte" => ord != Ordering::Less,
                "$lt" => ord == Ordering::Less,
                _ => ord != Ordering::Greater,
            }
        }
        "$regex" => {
            let (Some(Value::String(text)), Some(pattern)) = (actual, operand.as_str()) else {
                return false;
            };
            regex::Regex::new(pattern)
                .map(|re| re.is_match(text))
                .unwrap_or(false)
        }
        _ => false,
    }
}

/// Sort documents in place by `(field, direction)` pairs.
pub fn sort_documents(docs: &mut [Document], sort: &[(String, i8)]) {
    if sort.is_empty() {
        return;
    }
    docs.sort_by(|a, b| {
        for (field, direction) in sort {
            let av = lookup(a, field).unwrap_or(&Value::Null);
            let bv = lookup(b, field).unwrap_or(&Value::Null);
            let ord = compare_values(av, bv);
            let ord = if *direction < 0 { ord.reverse() } else { ord };
            if ord != Ordering::Equal {
                return ord;
            }
        }
        Ordering::Equal
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_implicit_equality() {
        let doc = json!({"status": "pending", "n": 3});
        assert!(matches(&doc, &json!({"status": "pending"})));
        assert!(!matches(&doc, &json!({"status": "approved"})));
        assert!(matches(&doc, &json!({"status": "pending", "n": 3})));
    }

    #[test]
    fn test_dotted_paths() {
        let doc = json!({"meta": {"region": "kr"}});
        assert!(matches(&doc, &json!({"meta.region": "kr"})));
        assert!(!matches(&doc, &json!({"meta.region": "us"})));
    }

    #[test]
    fn test_comparison_operators() {
        let doc = json!({"count": 10, "at": "2026-07-01T00:00:00Z"});
        assert!(matches(&doc, &json!({"count": {"$gte": 10}})));
        assert!(matches(&doc, &json!({"count": {"$gt": 9, "$lt": 11}})));
        assert!(!matches(&doc, &json!({"count": {"$lt": 10}})));
        // RFC 3339 strings compare chronologically
        assert!(matches(&doc, &json!({"at": {"$gte": "2026-06-30T00:00:00Z"}})));
        assert!(!matches(&doc, &json!({"at": {"$gte": "2026-07-02T00:00:00Z"}})));
    }

    #[test]
    fn test_in_and_exists() {
        let doc = json!({"status": "partial"});
        assert!(matches(&doc, &json!({"status": {"$in": ["success", "partial"]}})));
        assert!(!matches(&doc, &json!({"status": {"$nin": ["success", "partial"]}})));
        assert!(matches(&doc, &json!({"status": {"$exists": true}})));
        assert!(matches(&doc, &json!({"missing": {"$exists": false}})));
    }

    #[test]
    fn test_or() {
        let doc = json!({"source_id": null, "enabled": true});
        let filter = json!({"$or": [{"source_id": "abc"}, {"source_id": null}], "enabled": true});
        assert!(matches(&doc, &filter));
    }

    #[test]
    fn test_regex() {
        let doc = json!({"name": "staging_news"});
        assert!(matches(&doc, &json!({"name": {"$regex": "^staging_"}})));
        assert!(!matches(&doc, &json!({"name": {"$regex": "^agg_"}})));
    }

    #[test]
    fn test_sort_multi_key() {
        let mut docs = vec![
            json!({"a": 1, "b": 2}),
            json!({"a": 1, "b": 1}),
            json!({"a": 0, "b": 9}),
        ];
        sort_documents(&mut docs, &[("a".into(), 1), ("b".into(), -1)]);
        assert_eq!(docs[0], json!({"a": 0, "b": 9}));
        assert_eq!(docs[1], json!({"a": 1, "b": 2}));
        assert_eq!(docs[2], json!({"a": 1, "b": 1}));
    }

    #[test]
    fn test_missing_field_matches_null() {
        let doc = json!({"a": 1});
        assert!(matches(&doc, &json!({"b": null})));
        assert!(!matches(&doc, &json!({"b": 1})));
    }
}
