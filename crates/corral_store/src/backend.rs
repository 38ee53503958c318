//! Backend abstraction for document engines.
//!
//! Documents are `serde_json::Value` objects; filters, updates, and
//! aggregation pipelines use the MongoDB dialect so the memory engine and
//! the driver engine stay semantically interchangeable.

use async_trait::async_trait;
use corral_ids::IdRef;
use corral_protocol::CoreResult;

/// A document as stored: always a JSON object.
pub type Document = serde_json::Value;

/// Cursor options for `find`.
#[derive(Debug, Clone, Default)]
pub struct FindOptions {
    /// `(field, direction)` pairs; direction is 1 ascending, -1 descending.
    pub sort: Vec<(String, i8)>,
    pub skip: Option<u64>,
    pub limit: Option<u64>,
}

impl FindOptions {
    pub fn sorted(field: impl Into<String>, direction: i8) -> Self {
        Self {
            sort: vec![(field.into(), direction)],
            ..Default::default()
        }
    }

    pub fn with_limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn with_skip(mut self, skip: u64) -> Self {
        self.skip = Some(skip);
        self
    }
}

/// An index to create at startup.
#[derive(Debug, Clone)]
pub struct IndexSpec {
    /// `(field, direction)` pairs
    pub keys: Vec<(String, i8)>,
    pub unique: bool,
}

impl IndexSpec {
    pub fn on(field: impl Into<String>) -> Self {
        Self {
            keys: vec![(field.into(), 1)],
            unique: false,
        }
    }

    pub fn compound(keys: &[(&str, i8)]) -> Self {
        Self {
            keys: keys.iter().map(|(f, d)| (f.to_string(), *d)).collect(),
            unique: false,
        }
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }
}

/// Result of an upsert.
#[derive(Debug, Clone, Default)]
pub struct UpsertOutcome {
    /// Documents matched by the filter
    pub matched: u64,
    /// Id of the inserted document, when nothing matched
    pub upserted_id: Option<IdRef>,
}

/// A document engine.
///
/// All methods take collection names; collections are created lazily on
/// first write. `insert_one` assigns `_id` when the document has none and
/// returns the id either way.
#[async_trait]
pub trait DocumentBackend: Send + Sync {
    async fn find_one(&self, collection: &str, filter: &Document)
        -> CoreResult<Option<Document>>;

    async fn find(
        &self,
        collection: &str,
        filter: &Document,
        options: FindOptions,
    ) -> CoreResult<Vec<Document>>;

    async fn insert_one(&self, collection: &str, doc: Document) -> CoreResult<IdRef>;

    async fn insert_many(&self, collection: &str, docs: Vec<Document>) -> CoreResult<Vec<IdRef>>;

    /// Apply `update` to the first match. Returns the modified count.
    async fn update_one(
        &self,
        collection: &str,
        filter: &Document,
        update: &Document,
    ) -> CoreResult<u64>;

    /// Apply `update` to every match. Returns the modified count.
    async fn update_many(
        &self,
        collection: &str,
        filter: &Document,
        update: &Document,
    ) -> CoreResult<u64>;

    /// Update the first match, inserting a new document from the filter's
    /// equality fields plus the update when nothing matches.
    async fn upsert_one(
        &self,
        collection: &str,
        filter: &Document,
        update: &Document,
    ) -> CoreResult<UpsertOutcome>;

    async fn delete_one(&self, collection: &str, filter: &Document) -> CoreResult<u64>;

    async fn delete_many(&self, collection: &str, filter: &Document) -> CoreResult<u64>;

    async fn count(&self, collection: &str, filter: &Document) -> CoreResult<u64>;

    async fn aggregate(
        &self,
        collection: &str,
        pipeline: &[Document],
    ) -> CoreResult<Vec<Document>>;

    /// Lightweight connectivity round-trip.
    async fn ping(&self) -> CoreResult<()>;

    async fn create_index(&self, collection: &str, spec: IndexSpec) -> CoreResult<()>;

    async fn list_collection_names(&self) -> CoreResult<Vec<String>>;

    /// Engine name for health reporting.
    fn engine_name(&self) -> &'static str;
}
