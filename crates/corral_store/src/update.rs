//! Update-document application for the in-memory engine.
//!
//! Supports `$set`, `$unset`, `$inc`, `$push`, `$addToSet`, and
//! `$currentDate`, with dotted paths creating intermediate objects the way
//! the driver engine does. An update document without operators replaces
//! the whole document (preserving `_id`).

use chrono::Utc;
use serde_json::{Map, Value};

use crate::backend::Document;

/// Apply `update` to `doc` in place. Returns true when anything changed.
pub fn apply_update(doc: &mut Document, update: &Document) -> bool {
    let Some(ops) = update.as_object() else {
        return false;
    };

    let has_operators = ops.keys().any(|k| k.starts_with('$'));
    if !has_operators {
        // Whole-document replacement
        let id = doc.get("_id").cloned();
        let mut replacement = update.clone();
        if let (Some(id), Some(map)) = (id, replacement.as_object_mut()) {
            map.insert("_id".to_string(), id);
        }
        let changed = *doc != replacement;
        *doc = replacement;
        return changed;
    }

    let mut changed = false;
    for (op, spec) in ops {
        let Some(fields) = spec.as_object() else {
            continue;
        };
        match op.as_str() {
            "$set" => {
                for (path, value) in fields {
                    if set_path(doc, path, value.clone()) {
                        changed = true;
                    }
                }
            }
            "$unset" => {
                for path in fields.keys() {
                    if unset_path(doc, path) {
                        changed = true;
                    }
                }
            }
            "$inc" => {
                for (path, delta) in fields {
                    let current = crate::filter::lookup(doc, path)
                        .and_then(Value::as_f64)
                        .unwrap_or(0.0);
                    let delta = delta.as_f64().unwrap_or(0.0);
                    let next = current + delta;
                    let value = if next.fract() == 0.0 {
                        Value::from(next as i64)
                    } else {
                        Value::from(next)
                    };
                    set_path(doc, path, value);
                    changed = true;
                }
            }
            "$push" => {
                for (path, value) in fields {
                    push_path(doc, path, value.clone(), false);
                    changed = true;
                }
            }
            "$addToSet" => {
                for (path, value) in fields {
                    push_path(doc, path, value.clone(), true);
                    changed = true;
                }
            }
            "$currentDate" => {
                let now = Value::String(Utc::now().to_rfc3339());
                for path in fields.keys() {
                    set_path(doc, path, now.clone());
                    changed = true;
                }
            }
            _ => {}
        }
    }
    changed
}

fn set_path(doc: &mut Value, path: &str, value: Value) -> bool {
    let mut current = doc;
    let parts: Vec<&str> = path.split('.').collect();

    for part in &parts[..parts.len() - 1] {
        if !current.is_object() {
            return false;
        }
        let map = current.as_object_mut().unwrap();
        current = map
            .entry(part.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
    }

    let Some(map) = current.as_object_mut() else {
        return false;
    };
    let key = parts[parts.len() - 1].to_string();
    let changed = map.get(&key) != Some(&value);
    map.insert(key, value);
    changed
}

fn unset_path(doc: &mut Value, path: &str) -> bool {
    let parts: Vec<&str> = path.split('.').collect();
    let mut current = doc;

    for part in &parts[..parts.len() - 1] {
        match current.get_mut(*part) {
            Some(next) => current = next,
            None => return false,
        }
    }

    current
        .as_object_mut()
        .map(|map| map.remove(parts[parts.len() - 1]).is_some())
        .unwrap_or(false)
}

fn push_path(doc: &mut Value, path: &str, value: Value, dedup: bool) {
    let existing = crate::filter::lookup(doc, path).cloned();
    let mut array = match existing {
        Some(Value::Array(items)) => items,
        _ => Vec::new(),
    };
    if !dedup || !array.contains(&value) {
        array.push(value);
    }
    set_path(doc, path, Value::Array(array));
}
