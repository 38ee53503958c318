//! Aggregation pipeline evaluation for the in-memory engine.
//!
//! Covers the stages the control plane's rollups use: `$match`, `$group`,
//! `$sort`, `$skip`, `$limit`, `$project`, `$unwind`, `$count`, `$facet`.
//! Pipelines are plain documents in the MongoDB dialect, so the same
//! pipeline runs unchanged against the driver engine.

use serde_json::{json, Map, Value};
use std::collections::BTreeMap;

use corral_protocol::{CoreError, CoreResult};

use crate::backend::Document;
use crate::filter;

/// Run a pipeline over an input document set.
pub fn run_pipeline(mut docs: Vec<Document>, pipeline: &[Document]) -> CoreResult<Vec<Document>> {
    for stage in pipeline {
        let Some(stage_obj) = stage.as_object() else {
            return Err(CoreError::DatabaseOperation(
                "Aggregation stage must be an object".into(),
            ));
        };
        let Some((name, spec)) = stage_obj.iter().next() else {
            continue;
        };

        docs = match name.as_str() {
            "$match" => docs
                .into_iter()
                .filter(|doc| filter::matches(doc, spec))
                .collect(),
            "$group" => group_stage(docs, spec)?,
            "$sort" => {
                let sort: Vec<(String, i8)> = spec
                    .as_object()
                    .map(|m| {
                        m.iter()
                            .map(|(k, v)| (k.clone(), v.as_i64().unwrap_or(1) as i8))
                            .collect()
                    })
                    .unwrap_or_default();
                filter::sort_documents(&mut docs, &sort);
                docs
            }
            "$skip" => {
                let n = spec.as_u64().unwrap_or(0) as usize;
                docs.into_iter().skip(n).collect()
            }
            "$limit" => {
                let n = spec.as_u64().unwrap_or(u64::MAX) as usize;
                docs.into_iter().take(n).collect()
            }
            "$project" => docs.into_iter().map(|doc| project(&doc, spec)).collect(),
            "$unwind" => unwind_stage(docs, spec),
            "$count" => {
                let field = spec.as_str().unwrap_or("count");
                let mut out = Map::new();
                out.insert(field.to_string(), json!(docs.len()));
                vec![Value::Object(out)]
            }
            "$facet" => {
                let mut out = Map::new();
                if let Some(facets) = spec.as_object() {
                    for (facet_name, sub_pipeline) in facets {
                        let stages: Vec<Document> = sub_pipeline
                            .as_array()
                            .cloned()
                            .unwrap_or_default();
                        let result = run_pipeline(docs.clone(), &stages)?;
                        out.insert(facet_name.clone(), Value::Array(result));
                    }
                }
                vec![Value::Object(out)]
            }
            other => {
                return Err(CoreError::DatabaseOperation(format!(
                    "Unsupported aggregation stage: {other}"
                )))
            }
        };
    }

    Ok(docs)
}

/// Resolve an expression against a document: `"$field"` references, literals
/// otherwise.
fn resolve<'a>(doc: &'a Document, expr: &'a Value) -> Value {
    if let Some(path) = expr.as_str().and_then(|s| s.strip_prefix('$')) {
        return filter::lookup(doc, path).cloned().unwrap_or(Value::Null);
    }
    expr.clone()
}

fn group_stage(docs: Vec<Document>, spec: &Value) -> CoreResult<Vec<Document>> {
    let Some(spec_obj) = spec.as_object() else {
        return Err(CoreError::DatabaseOperation("$group needs an object".into()));
    };
    let id_expr = spec_obj.get("_id").cloned().unwrap_or(Value::Null);

    // Group key -> (key value, accumulator state)
    let mut groups: BTreeMap<String, (Value, Map<String, Value>)> = BTreeMap::new();

    for doc in &docs {
        let key_value = group_key(doc, &id_expr);
        let key = key_value.to_string();
        let entry = groups
            .entry(key)
            .or_insert_with(|| (key_value.clone(), Map::new()));

        for (field, acc_spec) in spec_obj.iter().filter(|(k, _)| *k != "_id") {
            let Some(acc_obj) = acc_spec.as_object() else {
                continue;
            };
            let Some((op, operand)) = acc_obj.iter().next() else {
                continue;
            };
            accumulate(&mut entry.1, field, op, operand, doc);
        }
    }

    let mut out = Vec::with_capacity(groups.len());
    for (_, (key_value, mut state)) in groups {
        // Finalize averages
        let avg_keys: Vec<String> = state
            .keys()
            .filter(|k| k.starts_with("__avg_sum:"))
            .map(|k| k.trim_start_matches("__avg_sum:").to_string())
            .collect();
        for field in avg_keys {
            let sum = state
                .remove(&format!("__avg_sum:{field}"))
                .and_then(|v| v.as_f64())
                .unwrap_or(0.0);
            let count = state
                .remove(&format!("__avg_count:{field}"))
                .and_then(|v| v.as_f64())
                .unwrap_or(0.0);
            let avg = if count > 0.0 { sum / count } else { 0.0 };
            state.insert(field, json!(avg));
        }

        let mut result = Map::new();
        result.insert("_id".to_string(), key_value);
        for (k, v) in state {
            result.insert(k, v);
        }
        out.push(Value::Object(result));
    }

    Ok(out)
}

fn group_key(doc: &Document, id_expr: &Value) -> Value {
    match id_expr {
        Value::Object(fields) => {
            let mut key = Map::new();
            for (alias, expr) in fields {
                key.insert(alias.clone(), resolve(doc, expr));
            }
            Value::Object(key)
        }
        other => resolve(doc, other),
    }
}

fn accumulate(state: &mut Map<String, Value>, field: &str, op: &str, operand: &Value, doc: &Document) {
    match op {
        "$sum" => {
            let add = match operand {
                Value::Number(n) => n.as_f64().unwrap_or(0.0),
                expr => resolve(doc, expr).as_f64().unwrap_or(0.0),
            };
            let current = state.get(field).and_then(Value::as_f64).unwrap_or(0.0);
            let next = current + add;
            let value = if next.fract() == 0.0 {
                json!(next as i64)
            } else {
                json!(next)
            };
            state.insert(field.to_string(), value);
        }
        "$avg" => {
            let value = resolve(doc, operand);
            if let Some(v) = value.as_f64() {
                let sum_key = format!("__avg_sum:{field}");
                let count_key = format!("__avg_count:{field}");
                let sum = state.get(&sum_key).and_then(Value::as_f64).unwrap_or(0.0);
                let count = state.get(&count_key).and_then(Value::as_f64).unwrap_or(0.0);
                state.insert(sum_key, json!(sum + v));
                state.insert(count_key, json!(count + 1.0));
            } else {
                // Non-numeric values are skipped, but the field must exist
                state
                    .entry(format!("__avg_sum:{field}"))
                    .or_insert(json!(0.0));
                state
                    .entry(format!("__avg_count:{field}"))
                    .or_insert(json!(0.0));
            }
        }
        "$min" => {
            let value = resolve(doc, operand);
            if value.is_null() {
                return;
            }
            let replace = match state.get(field) {
                Some(current) => {
                    filter::compare_values(&value, current) == std::cmp::Ordering::Less
                }
                None => true,
            };
            if replace {
                state.insert(field.to_string(), value);
            }
        }
        "$max" => {
            let value = resolve(doc, operand);
            if value.is_null() {
                return;
            }
            let replace = match state.get(field) {
                Some(current) => {
                    filter::compare_values(&value, current) == std::cmp::Ordering::Greater
                }
                None => true,
            };
            if replace {
                state.insert(field.to_string(), value);
            }
        }
        "$first" => {
            state
                .entry(field.to_string())
                .or_insert_with(|| resolve(doc, operand));
        }
        "$last" => {
            state.insert(field.to_string(), resolve(doc, operand));
        }
        "$push" => {
            let value = resolve(doc, operand);
            let mut array = state
                .get(field)
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default();
            array.push(value);
            state.insert(field.to_string(), Value::Array(array));
        }
        "$addToSet" => {
            let value = resolve(doc, operand);
            let mut array = state
                .get(field)
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default();
            if !array.contains(&value) {
                array.push(value);
            }
            state.insert(field.to_string(), Value::Array(array));
        }
        _ => {}
    }
}

fn project(doc: &Document, spec: &Value) -> Document {
    let Some(fields) = spec.as_object() else {
        return doc.clone();
    };

    let including = fields
        .values()
        .any(|v| v.as_i64() == Some(1) || v.as_bool() == Some(true) || v.is_string());

    let mut out = Map::new();
    if including {
        // `_id` is kept unless suppressed
        if fields.get("_id").and_then(Value::as_i64) != Some(0) {
            if let Some(id) = doc.get("_id") {
                out.insert("_id".to_string(), id.clone());
            }
        }
        for (name, expr) in fields {
            if name == "_id" {
                continue;
            }
            match expr {
                v if v.as_i64() == Some(1) || v.as_bool() == Some(true) => {
                    if let Some(value) = filter::lookup(doc, name) {
                        out.insert(name.clone(), value.clone());
                    }
                }
                Value::String(_) => {
                    out.insert(name.clone(), resolve(doc, expr));
                }
                _ => {}
            }
        }
    } else {
        // Exclusion projection
        let excluded: Vec<&String> = fields.keys().collect();
        if let Some(map) = doc.as_object() {
            for (k, v) in map {
                if !excluded.contains(&k) {
                    out.insert(k.clone(), v.clone());
                }
            }
        }
    }
    Value::Object(out)
}

fn unwind_stage(docs: Vec<Document>, spec: &Value) -> Vec<Document> {
    let path = spec
        .as_str()
        .or_else(|| spec.get("path").and_then(Value::as_str))
        .and_then(|s| s.strip_prefix('$'))
        .unwrap_or_default()
        .to_string();

    let mut out = Vec::new();
    for doc in docs {
        match filter::lookup(&doc, &path).cloned() {
            Some(Value::Array(items)) => {
                for item in items {
                    let mut clone = doc.clone();
                    set_field(&mut clone, &path, item);
                    out.push(clone);
                }
            }
            // Missing or non-array fields drop the document, like the driver
            _ => {}
        }
    }
    out
}

fn set_field(doc: &mut Document, path: &str, value: Value) {
    let parts: Vec<&str> = path.split('.').collect();
    let mut current = doc;
    for part in &parts[..parts.len() - 1] {
        match current.get_mut(*part) {
            Some(next) => current = next,
            None => return,
        }
    }
    if let Some(map) = current.as_object_mut() {
        map.insert(parts[parts.len() - 1].to_string(), value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metrics() -> Vec<Document> {
        vec![
            json!({"status": "success", "records_loaded": 10, "execution_time_ms": 100, "source_id": "a"}),
            json!({"status": "success", "records_loaded": 20, "execution_time_ms": 300, "source_id": "a"}),
            json!({"status": "failed", "records_loaded": 0, "execution_time_ms": 50, "source_id": "b"}),
        ]
    }

    #[test]
    fn test_match_group_sum_avg() {
        let pipeline = vec![json!({"$group": {
            "_id": "$status",
            "count": {"$sum": 1},
            "records": {"$sum": "$records_loaded"},
            "avg_time": {"$avg": "$execution_time_ms"},
        }})];
        let mut result = run_pipeline(metrics(), &pipeline).unwrap();
        filter::sort_documents(&mut result, &[("_id".into(), 1)]);

        assert_eq!(result.len(), 2);
        assert_eq!(result[0]["_id"], "failed");
        assert_eq!(result[0]["count"], 1);
        assert_eq!(result[1]["_id"], "success");
        assert_eq!(result[1]["records"], 30);
        assert_eq!(result[1]["avg_time"], 200.0);
    }

    #[test]
    fn test_group_null_id_totals() {
        let pipeline = vec![
            json!({"$match": {"status": "success"}}),
            json!({"$group": {"_id": null, "total": {"$sum": "$records_loaded"}}}),
        ];
        let result = run_pipeline(metrics(), &pipeline).unwrap();
        assert_eq!(result.len(), 1);
        assert_eq!(result[0]["total"], 30);
    }

    #[test]
    fn test_sort_skip_limit() {
        let pipeline = vec![
            json!({"$sort": {"execution_time_ms": -1}}),
            json!({"$skip": 1}),
            json!({"$limit": 1}),
        ];
        let result = run_pipeline(metrics(), &pipeline).unwrap();
        assert_eq!(result.len(), 1);
        assert_eq!(result[0]["execution_time_ms"], 100);
    }

    #[test]
    fn test_project_include_and_rename() {
        let pipeline = vec![json!({"$project": {"_id": 0, "s": "$status", "records_loaded": 1}})];
        let result = run_pipeline(metrics(), &pipeline).unwrap();
        assert_eq!(result[0], json!({"s": "success", "records_loaded": 10}));
    }

    #[test]
    fn test_unwind() {
        let docs = vec![json!({"_id": "x", "tags": ["a", "b"]}), json!({"_id": "y"})];
        let result = run_pipeline(docs, &[json!({"$unwind": "$tags"})]).unwrap();
        assert_eq!(result.len(), 2);
        assert_eq!(result[0]["tags"], "a");
        assert_eq!(result[1]["tags"], "b");
    }

    #[test]
    fn test_count() {
        let result = run_pipeline(metrics(), &[json!({"$count": "n"})]).unwrap();
        assert_eq!(result, vec![json!({"n": 3})]);
    }

    #[test]
    fn test_facet() {
        let pipeline = vec![json!({"$facet": {
            "by_status": [{"$group": {"_id": "$status", "count": {"$sum": 1}}}],
            "total": [{"$count": "n"}],
        }})];
        let result = run_pipeline(metrics(), &pipeline).unwrap();
        assert_eq!(result.len(), 1);
        assert_eq!(result[0]["total"][0]["n"], 3);
        assert_eq!(result[0]["by_status"].as_array().unwrap().len(), 2);
    }

    #[test]
    fn test_group_compound_key() {
        let pipeline = vec![json!({"$group": {
            "_id": {"source": "$source_id", "status": "$status"},
            "count": {"$sum": 1},
        }})];
        let result = run_pipeline(metrics(), &pipeline).unwrap();
        assert_eq!(result.len(), 2);
    }

    #[test]
    fn test_unknown_stage_errors() {
        let result = run_pipeline(metrics(), &[json!({"$lookup": {}})]);
        assert!(result.is_err());
    }
}
