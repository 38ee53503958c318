//! MongoDB engine via the official driver.
//!
//! Documents keep string `_id`s (assigned client-side from [`IdRef`]) so
//! filters and ids stay identical between this engine and the in-memory
//! one. Connection-class driver errors map to `DatabaseConnection`
//! (recoverable); duplicate-key write errors map to `DuplicateKey`.

use async_trait::async_trait;
use bson::{doc, Bson, Document as BsonDocument};
use corral_ids::IdRef;
use corral_protocol::{CoreError, CoreResult};
use futures_util::TryStreamExt;
use mongodb::error::{Error as MongoError, ErrorKind, WriteFailure};
use mongodb::options::IndexOptions;
use mongodb::{Client, Database, IndexModel};
use serde_json::Value;

use crate::backend::{Document, DocumentBackend, FindOptions, IndexSpec, UpsertOutcome};

/// Duplicate-key error code in the wire protocol.
const DUPLICATE_KEY_CODE: i32 = 11000;

/// The driver-backed engine.
pub struct MongoBackend {
    db: Database,
}

impl MongoBackend {
    /// Connect to `uri` and select `database`.
    pub async fn connect(uri: &str, database: &str) -> CoreResult<Self> {
        let client = Client::with_uri_str(uri).await.map_err(map_error)?;
        Ok(Self {
            db: client.database(database),
        })
    }

    fn collection(&self, name: &str) -> mongodb::Collection<BsonDocument> {
        self.db.collection::<BsonDocument>(name)
    }
}

fn map_error(err: MongoError) -> CoreError {
    match err.kind.as_ref() {
        ErrorKind::Write(WriteFailure::WriteError(we)) if we.code == DUPLICATE_KEY_CODE => {
            CoreError::DuplicateKey(we.message.clone())
        }
        ErrorKind::ServerSelection { .. } | ErrorKind::Io(_) | ErrorKind::ConnectionPoolCleared { .. } => {
            CoreError::DatabaseConnection(err.to_string())
        }
        _ => {
            let text = err.to_string();
            if text.contains("E11000") {
                CoreError::DuplicateKey(text)
            } else {
                CoreError::DatabaseOperation(text)
            }
        }
    }
}

fn to_bson_doc(value: &Document) -> CoreResult<BsonDocument> {
    bson::to_document(value)
        .map_err(|e| CoreError::DatabaseOperation(format!("BSON conversion failed: {e}")))
}

fn from_bson_doc(doc: BsonDocument) -> Document {
    serde_json::to_value(doc).unwrap_or(Value::Null)
}

fn sort_doc(sort: &[(String, i8)]) -> BsonDocument {
    let mut out = BsonDocument::new();
    for (field, direction) in sort {
        out.insert(field.clone(), i32::from(*direction));
    }
    out
}

fn assign_string_id(doc: &mut Document) -> CoreResult<IdRef> {
    let map = doc
        .as_object_mut()
        .ok_or_else(|| CoreError::DatabaseOperation("Documents must be JSON objects".into()))?;
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

#[async_trait]
impl DocumentBackend for MongoBackend {
    async fn find_one(
        &self,
        collection: &str,
        filter: &Document,
    ) -> CoreResult<Option<Document>> {
        let filter = to_bson_doc(filter)?;
        let found = self
            .collection(collection)
            .find_one(filter)
            .await
            .map_err(map_error)?;
        Ok(found.map(from_bson_doc))
    }

    async fn find(
        &self,
        collection: &str,
        filter: &Document,
        options: FindOptions,
    ) -> CoreResult<Vec<Document>> {
        let filter = to_bson_doc(filter)?;
        let mut action = self.collection(collection).find(filter);
        if !options.sort.is_empty() {
            action = action.sort(sort_doc(&options.sort));
        }
        if let Some(skip) = options.skip {
            action = action.skip(skip);
        }
        if let Some(limit) = options.limit {
            action = action.limit(limit as i64);
        }
        let cursor = action.await.map_err(map_error)?;
        let docs: Vec<BsonDocument> = cursor.try_collect().await.map_err(map_error)?;
        Ok(docs.into_iter().map(from_bson_doc).collect())
    }

    async fn insert_one(&self, collection: &str, mut doc: Document) -> CoreResult<IdRef> {
        let id = assign_string_id(&mut doc)?;
        let doc = to_bson_doc(&doc)?;
        self.collection(collection)
            .insert_one(doc)
            .await
            .map_err(map_error)?;
        Ok(id)
    }

    async fn insert_many(&self, collection: &str, docs: Vec<Document>) -> CoreResult<Vec<IdRef>> {
        if docs.is_empty() {
            return Ok(Vec::new());
        }
        let mut ids = Vec::with_capacity(docs.len());
        let mut bson_docs = Vec::with_capacity(docs.len());
        for mut doc in docs {
            ids.push(assign_string_id(&mut doc)?);
            bson_docs.push(to_bson_doc(&doc)?);
        }
        self.collection(collection)
            .insert_many(bson_docs)
            .await
            .map_err(map_error)?;
        Ok(ids)
    }

    async fn update_one(
        &self,
        collection: &str,
        filter: &Document,
        update: &Document,
    ) -> CoreResult<u64> {
        let filter = to_bson_doc(filter)?;
        let update = to_bson_doc(update)?;
        let result = self
            .collection(collection)
            .update_one(filter, update)
            .await
            .map_err(map_error)?;
        Ok(result.modified_count)
    }

    async fn update_many(
        &self,
        collection: &str,
        filter: &Document,
        update: &Document,
    ) -> CoreResult<u64> {
        let filter = to_bson_doc(filter)?;
        let update = to_bson_doc(update)?;
        let result = self
            .collection(collection)
            .update_many(filter, update)
            .await
            .map_err(map_error)?;
        Ok(result.modified_count)
    }

    async fn upsert_one(
        &self,
        collection: &str,
        filter: &Document,
        update: &Document,
    ) -> CoreResult<UpsertOutcome> {
        // Pin the inserted _id to a string id so later lookups match both
        // engines.
        let pending_id = IdRef::generate();
        let mut update = update.clone();
        if let Some(map) = update.as_object_mut() {
            let on_insert = map
                .entry("$setOnInsert".to_string())
                .or_insert_with(|| Value::Object(serde_json::Map::new()));
            if let Some(on_insert) = on_insert.as_object_mut() {
                on_insert
                    .entry("_id".to_string())
                    .or_insert(Value::String(pending_id.to_hex()));
            }
        }

        let filter = to_bson_doc(filter)?;
        let update = to_bson_doc(&update)?;
        let result = self
            .collection(collection)
            .update_one(filter, update)
            .upsert(true)
            .await
            .map_err(map_error)?;

        let upserted_id = match result.upserted_id {
            Some(Bson::String(raw)) => Some(IdRef::parse(&raw)?),
            Some(Bson::ObjectId(oid)) => Some(IdRef::parse(&oid.to_hex())?),
            _ => None,
        };
        Ok(UpsertOutcome {
            matched: result.matched_count,
            upserted_id,
        })
    }

    async fn delete_one(&self, collection: &str, filter: &Document) -> CoreResult<u64> {
        let filter = to_bson_doc(filter)?;
        let result = self
            .collection(collection)
            .delete_one(filter)
            .await
            .map_err(map_error)?;
        Ok(result.deleted_count)
    }

    async fn delete_many(&self, collection: &str, filter: &Document) -> CoreResult<u64> {
        let filter = to_bson_doc(filter)?;
        let result = self
            .collection(collection)
            .delete_many(filter)
            .await
            .map_err(map_error)?;
        Ok(result.deleted_count)
    }

    async fn count(&self, collection: &str, filter: &Document) -> CoreResult<u64> {
        let filter = to_bson_doc(filter)?;
        self.collection(collection)
            .count_documents(filter)
            .await
            .map_err(map_error)
    }

    async fn aggregate(
        &self,
        collection: &str,
        pipeline: &[Document],
    ) -> CoreResult<Vec<Document>> {
        let stages: Vec<BsonDocument> = pipeline
            .iter()
            .map(to_bson_doc)
            .collect::<CoreResult<_>>()?;
        let cursor = self
            .collection(collection)
            .aggregate(stages)
            .await
            .map_err(map_error)?;
        let docs: Vec<BsonDocument> = cursor.try_collect().await.map_err(map_error)?;
        Ok(docs.into_iter().map(from_bson_doc).collect())
    }

    async fn ping(&self) -> CoreResult<()> {
        self.db
            .run_command(doc! {"ping": 1})
            .await
            .map_err(map_error)?;
        Ok(())
    }

    async fn create_index(&self, collection: &str, spec: IndexSpec) -> CoreResult<()> {
        let mut keys = BsonDocument::new();
        for (field, direction) in &spec.keys {
            keys.insert(field.clone(), i32::from(*direction));
        }
        let options = IndexOptions::builder().unique(spec.unique).build();
        let model = IndexModel::builder().keys(keys).options(options).build();
        self.collection(collection)
            .create_index(model)
            .await
            .map_err(map_error)?;
        Ok(())
    }

    async fn list_collection_names(&self) -> CoreResult<Vec<String>> {
        self.db.list_collection_names().await.map_err(map_error)
    }

    fn engine_name(&self) -> &'static str {
        "mongodb"
    }
}
