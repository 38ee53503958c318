//! In-memory document engine.
//!
//! Backs tests and embedded deployments. Collections are created lazily;
//! inserts assign `_id` when absent; unique indexes are enforced on insert
//! and on upsert-insert so `DuplicateKey` behaves the same here as against
//! the driver engine.

use async_trait::async_trait;
use corral_ids::IdRef;
use corral_protocol::{CoreError, CoreResult};
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::sync::RwLock;

use crate::backend::{Document, DocumentBackend, FindOptions, IndexSpec, UpsertOutcome};
use crate::{aggregate, filter, update};

#[derive(Default)]
struct Collection {
    docs: Vec<Document>,
    unique_indexes: Vec<Vec<String>>,
}

impl Collection {
    fn check_unique(&self, doc: &Document, skip_index: Option<usize>) -> CoreResult<()> {
        for key_fields in &self.unique_indexes {
            let candidate: Vec<Value> = key_fields
                .iter()
                .map(|f| filter::lookup(doc, f).cloned().unwrap_or(Value::Null))
                .collect();

            for (i, existing) in self.docs.iter().enumerate() {
                if Some(i) == skip_index {
                    continue;
                }
                let existing_key: Vec<Value> = key_fields
                    .iter()
                    .map(|f| filter::lookup(existing, f).cloned().unwrap_or(Value::Null))
                    .collect();
                if existing_key == candidate {
                    return Err(CoreError::DuplicateKey(format!(
                        "duplicate value for unique index on ({})",
                        key_fields.join(", ")
                    )));
                }
            }
        }
        Ok(())
    }
}

/// The in-memory engine.
#[derive(Default)]
pub struct MemoryBackend {
    collections: RwLock<HashMap<String, Collection>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn ensure_object(doc: &Document) -> CoreResult<()> {
        if doc.is_object() {
            Ok(())
        } else {
            Err(CoreError::DatabaseOperation(
                "Documents must be JSON objects".into(),
            ))
        }
    }

    fn assign_id(doc: &mut Document) -> CoreResult<IdRef> {
        let map = doc.as_object_mut().expect("checked by ensure_object");
        match map.get("_id") {
            Some(Value::String(raw)) => Ok(IdRef::parse(raw)?),
            Some(other) => Err(CoreError::InvalidIdentifier(format!(
                "_id must be a string, got {other}"
            ))),
            None => {
                let id = IdRef::generate();
                map.insert("_id".to_string(), Value::String(id.to_hex()));
                Ok(id)
            }
        }
    }
}

#[async_trait]
impl DocumentBackend for MemoryBackend {
    async fn find_one(
        &self,
        collection: &str,
        filter_doc: &Document,
    ) -> CoreResult<Option<Document>> {
        let collections = self.collections.read().unwrap();
        Ok(collections.get(collection).and_then(|c| {
            c.docs
                .iter()
                .find(|doc| filter::matches(doc, filter_doc))
                .cloned()
        }))
    }

    async fn find(
        &self,
        collection: &str,
        filter_doc: &Document,
        options: FindOptions,
    ) -> CoreResult<Vec<Document>> {
        let collections = self.collections.read().unwrap();
        let mut results: Vec<Document> = collections
            .get(collection)
            .map(|c| {
                c.docs
                    .iter()
                    .filter(|doc| filter::matches(doc, filter_doc))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();

        filter::sort_documents(&mut results, &options.sort);

        if let Some(skip) = options.skip {
            results = results.into_iter().skip(skip as usize).collect();
        }
        if let Some(limit) = options.limit {
            results.truncate(limit as usize);
        }
        Ok(results)
    }

    async fn insert_one(&self, collection: &str, mut doc: Document) -> CoreResult<IdRef> {
        Self::ensure_object(&doc)?;
        let id = Self::assign_id(&mut doc)?;

        let mut collections = self.collections.write().unwrap();
        let col = collections.entry(collection.to_string()).or_default();
        col.check_unique(&doc, None)?;
        col.docs.push(doc);
        Ok(id)
    }

    async fn insert_many(&self, collection: &str, docs: Vec<Document>) -> CoreResult<Vec<IdRef>> {
        let mut ids = Vec::with_capacity(docs.len());
        for doc in docs {
            ids.push(self.insert_one(collection, doc).await?);
        }
        Ok(ids)
    }

    async fn update_one(
        &self,
        collection: &str,
        filter_doc: &Document,
        update_doc: &Document,
    ) -> CoreResult<u64> {
        let mut collections = self.collections.write().unwrap();
        let Some(col) = collections.get_mut(collection) else {
            return Ok(0);
        };
        for doc in col.docs.iter_mut() {
            if filter::matches(doc, filter_doc) {
                let changed = update::apply_update(doc, update_doc);
                return Ok(u64::from(changed));
            }
        }
        Ok(0)
    }

    async fn update_many(
        &self,
        collection: &str,
        filter_doc: &Document,
        update_doc: &Document,
    ) -> CoreResult<u64> {
        let mut collections = self.collections.write().unwrap();
        let Some(col) = collections.get_mut(collection) else {
            return Ok(0);
        };
        let mut modified = 0;
        for doc in col.docs.iter_mut() {
            if filter::matches(doc, filter_doc) && update::apply_update(doc, update_doc) {
                modified += 1;
            }
        }
        Ok(modified)
    }

    async fn upsert_one(
        &self,
        collection: &str,
        filter_doc: &Document,
        update_doc: &Document,
    ) -> CoreResult<UpsertOutcome> {
        {
            let mut collections = self.collections.write().unwrap();
            let col = collections.entry(collection.to_string()).or_default();
            for doc in col.docs.iter_mut() {
                if filter::matches(doc, filter_doc) {
                    update::apply_update(doc, update_doc);
                    return Ok(UpsertOutcome {
                        matched: 1,
                        upserted_id: None,
                    });
                }
            }
        }

        // Nothing matched: seed a document from the filter's equality
        // fields, then apply the update.
        let mut seed = Value::Object(Map::new());
        if let Some(conditions) = filter_doc.as_object() {
            let map = seed.as_object_mut().unwrap();
            for (key, condition) in conditions {
                let is_operator = key.starts_with('$')
                    || condition
                        .as_object()
                        .map(|o| o.keys().any(|k| k.starts_with('$')))
                        .unwrap_or(false);
                if !is_operator {
                    map.insert(key.clone(), condition.clone());
                }
            }
        }
        update::apply_update(&mut seed, update_doc);
        // $setOnInsert only applies on this insert path
        if let Some(on_insert) = update_doc.get("$setOnInsert") {
            update::apply_update(&mut seed, &json!({"$set": on_insert}));
        }

        let id = self.insert_one(collection, seed).await?;
        Ok(UpsertOutcome {
            matched: 0,
            upserted_id: Some(id),
        })
    }

    async fn delete_one(&self, collection: &str, filter_doc: &Document) -> CoreResult<u64> {
        let mut collections = self.collections.write().unwrap();
        let Some(col) = collections.get_mut(collection) else {
            return Ok(0);
        };
        if let Some(pos) = col.docs.iter().position(|doc| filter::matches(doc, filter_doc)) {
            col.docs.remove(pos);
            return Ok(1);
        }
        Ok(0)
    }

    async fn delete_many(&self, collection: &str, filter_doc: &Document) -> CoreResult<u64> {
        let mut collections = self.collections.write().unwrap();
        let Some(col) = collections.get_mut(collection) else {
            return Ok(0);
        };
        let before = col.docs.len();
        col.docs.retain(|doc| !filter::matches(doc, filter_doc));
        Ok((before - col.docs.len()) as u64)
    }

    async fn count(&self, collection: &str, filter_doc: &Document) -> CoreResult<u64> {
        let collections = self.collections.read().unwrap();
        Ok(collections
            .get(collection)
            .map(|c| {
                c.docs
                    .iter()
                    .filter(|doc| filter::matches(doc, filter_doc))
                    .count() as u64
            })
            .unwrap_or(0))
    }

    async fn aggregate(
        &self,
        collection: &str,
        pipeline: &[Document],
    ) -> CoreResult<Vec<Document>> {
        let docs = {
            let collections = self.collections.read().unwrap();
            collections
                .get(collection)
                .map(|c| c.docs.clone())
                .unwrap_or_default()
        };
        aggregate::run_pipeline(docs, pipeline)
    }

    async fn ping(&self) -> CoreResult<()> {
        Ok(())
    }

    async fn create_index(&self, collection: &str, spec: IndexSpec) -> CoreResult<()> {
        if !spec.unique {
            // Non-unique indexes are advisory here
            return Ok(());
        }
        let mut collections = self.collections.write().unwrap();
        let col = collections.entry(collection.to_string()).or_default();
        let fields: Vec<String> = spec.keys.iter().map(|(f, _)| f.clone()).collect();
        if !col.unique_indexes.contains(&fields) {
            col.unique_indexes.push(fields);
        }
        Ok(())
    }

    async fn list_collection_names(&self) -> CoreResult<Vec<String>> {
        let collections = self.collections.read().unwrap();
        let mut names: Vec<String> = collections.keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    fn engine_name(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_insert_assigns_id() {
        let backend = MemoryBackend::new();
        let id = backend
            .insert_one("sources", json!({"name": "a"}))
            .await
            .unwrap();

        let found = backend
            .find_one("sources", &json!({"_id": id.to_hex()}))
            .await
            .unwrap();
        assert_eq!(found.unwrap()["name"], "a");
    }

    #[tokio::test]
    async fn test_unique_index_rejects_duplicates() {
        let backend = MemoryBackend::new();
        backend
            .create_index("sources", IndexSpec::on("name").unique())
            .await
            .unwrap();

        backend
            .insert_one("sources", json!({"name": "dup"}))
            .await
            .unwrap();
        let err = backend
            .insert_one("sources", json!({"name": "dup"}))
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::DuplicateKey(_)));
    }

    #[tokio::test]
    async fn test_update_one_only_touches_first_match() {
        let backend = MemoryBackend::new();
        backend
            .insert_many(
                "reviews",
                vec![json!({"status": "pending"}), json!({"status": "pending"})],
            )
            .await
            .unwrap();

        let modified = backend
            .update_one(
                "reviews",
                &json!({"status": "pending"}),
                &json!({"$set": {"status": "approved"}}),
            )
            .await
            .unwrap();
        assert_eq!(modified, 1);

        let pending = backend
            .count("reviews", &json!({"status": "pending"}))
            .await
            .unwrap();
        assert_eq!(pending, 1);
    }

    #[tokio::test]
    async fn test_upsert_inserts_then_updates() {
        let backend = MemoryBackend::new();
        let first = backend
            .upsert_one(
                "freshness_config",
                &json!({"source_id": "s1"}),
                &json!({"$set": {"expected_frequency_hours": 24.0}}),
            )
            .await
            .unwrap();
        assert!(first.upserted_id.is_some());

        let second = backend
            .upsert_one(
                "freshness_config",
                &json!({"source_id": "s1"}),
                &json!({"$set": {"expected_frequency_hours": 12.0}}),
            )
            .await
            .unwrap();
        assert_eq!(second.matched, 1);
        assert!(second.upserted_id.is_none());

        assert_eq!(
            backend.count("freshness_config", &json!({})).await.unwrap(),
            1
        );
        let doc = backend
            .find_one("freshness_config", &json!({"source_id": "s1"}))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(doc["expected_frequency_hours"], 12.0);
    }

    #[tokio::test]
    async fn test_find_sort_skip_limit() {
        let backend = MemoryBackend::new();
        for n in 0..5 {
            backend
                .insert_one("xs", json!({"n": n}))
                .await
                .unwrap();
        }
        let docs = backend
            .find(
                "xs",
                &json!({}),
                FindOptions::sorted("n", -1).with_skip(1).with_limit(2),
            )
            .await
            .unwrap();
        assert_eq!(docs.len(), 2);
        assert_eq!(docs[0]["n"], 3);
        assert_eq!(docs[1]["n"], 2);
    }

    #[tokio::test]
    async fn test_delete_many() {
        let backend = MemoryBackend::new();
        for n in 0..4 {
            backend
                .insert_one("xs", json!({"even": n % 2 == 0}))
                .await
                .unwrap();
        }
        let deleted = backend
            .delete_many("xs", &json!({"even": true}))
            .await
            .unwrap();
        assert_eq!(deleted, 2);
        assert_eq!(backend.count("xs", &json!({})).await.unwrap(), 2);
    }
}
