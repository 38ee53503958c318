//! The store gateway.
//!
//! Wraps a [`DocumentBackend`] with the store circuit breaker, retry on
//! transient connection errors, id-safe CRUD, index bootstrap, cascading
//! source deletion, and the health check.

use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Instant;

use corral_ids::IdRef;
use corral_protocol::collections as col;
use corral_protocol::{CoreError, CoreResult};
use corral_resilience::{BreakerRegistry, CircuitBreaker, CircuitBreakerConfig, RetryConfig};
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{error, info, warn};

use crate::backend::{Document, DocumentBackend, FindOptions, IndexSpec, UpsertOutcome};
use crate::StoreUrl;

type OpFuture<'a, T> = Pin<Box<dyn Future<Output = CoreResult<T>> + Send + 'a>>;

/// Store health snapshot. Never an error: failures show up as
/// `status = "unhealthy"`.
#[derive(Debug, Clone, Serialize)]
pub struct HealthStatus {
    pub status: String,
    pub latency_ms: f64,
    pub database: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Counters from a cascading source deletion.
#[derive(Debug, Clone, Serialize)]
pub struct SourceDeletion {
    pub source_deleted: bool,
    pub children_deleted: BTreeMap<String, u64>,
}

/// Document store gateway shared by every service.
#[derive(Clone)]
pub struct Store {
    backend: Arc<dyn DocumentBackend>,
    breaker: Arc<CircuitBreaker>,
    retry: RetryConfig,
}

impl Store {
    /// Open a store from a parsed URL.
    pub async fn open(url: StoreUrl) -> CoreResult<Self> {
        match url {
            #[cfg(feature = "memory")]
            StoreUrl::Memory => Ok(Self::with_backend(Arc::new(crate::MemoryBackend::new()))),
            #[cfg(not(feature = "memory"))]
            StoreUrl::Memory => Err(CoreError::DatabaseOperation(
                "memory engine not compiled in".into(),
            )),
            #[cfg(feature = "mongodb")]
            StoreUrl::Mongo { uri, database } => {
                let backend = crate::MongoBackend::connect(&uri, &database).await?;
                Ok(Self::with_backend(Arc::new(backend)))
            }
            #[cfg(not(feature = "mongodb"))]
            StoreUrl::Mongo { .. } => Err(CoreError::DatabaseOperation(
                "mongodb engine not compiled in (enable the `mongodb` feature)".into(),
            )),
        }
    }

    /// Wrap an engine directly.
    pub fn with_backend(backend: Arc<dyn DocumentBackend>) -> Self {
        let breaker = BreakerRegistry::global()
            .get_or_create("document-store", CircuitBreakerConfig::default());
        Self {
            backend,
            breaker,
            retry: RetryConfig::default(),
        }
    }

    /// Use a dedicated breaker and retry policy (tests, embedded setups).
    pub fn with_breaker(
        backend: Arc<dyn DocumentBackend>,
        breaker: Arc<CircuitBreaker>,
        retry: RetryConfig,
    ) -> Self {
        Self {
            backend,
            breaker,
            retry,
        }
    }

    pub fn backend(&self) -> &Arc<dyn DocumentBackend> {
        &self.backend
    }

    /// Run one backend call under the breaker, retrying transient failures.
    async fn guarded<'a, T, F>(&'a self, op: F) -> CoreResult<T>
    where
        F: Fn() -> OpFuture<'a, T> + 'a,
    {
        let mut attempt: u32 = 0;
        loop {
            let outcome = match self.breaker.check() {
                Ok(()) => match op().await {
                    Ok(value) => {
                        self.breaker.record_success();
                        Ok(value)
                    }
                    Err(e) => {
                        // Only connection-class failures count against the
                        // breaker; a DuplicateKey still reached the engine.
                        if matches!(e, CoreError::DatabaseConnection(_)) {
                            self.breaker.record_failure();
                        } else {
                            self.breaker.record_success();
                        }
                        Err(e)
                    }
                },
                Err(open) => Err(open),
            };

            match outcome {
                Ok(value) => return Ok(value),
                Err(e) if attempt < self.retry.max_retries && e.is_recoverable() => {
                    let delay = self.retry.delay_for_attempt(attempt);
                    warn!(
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "store call failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    // ---- Generic CRUD -----------------------------------------------------

    /// Point lookup by id string. `None` when absent.
    pub async fn get(&self, collection: &str, id: &str) -> CoreResult<Option<Document>> {
        let id = IdRef::parse(id)?;
        let filter = json!({"_id": id.to_hex()});
        self.guarded(|| Box::pin(self.backend.find_one(collection, &filter)))
            .await
    }

    /// Point lookup that surfaces `NotFound`.
    pub async fn get_required(&self, collection: &str, id: &str) -> CoreResult<Document> {
        self.get(collection, id)
            .await?
            .ok_or_else(|| CoreError::not_found(format!("{collection}/{id}")))
    }

    pub async fn find_one(
        &self,
        collection: &str,
        filter: &Document,
    ) -> CoreResult<Option<Document>> {
        self.guarded(|| Box::pin(self.backend.find_one(collection, filter)))
            .await
    }

    pub async fn find(
        &self,
        collection: &str,
        filter: &Document,
        options: FindOptions,
    ) -> CoreResult<Vec<Document>> {
        self.guarded(|| Box::pin(self.backend.find(collection, filter, options.clone())))
            .await
    }

    pub async fn count(&self, collection: &str, filter: &Document) -> CoreResult<u64> {
        self.guarded(|| Box::pin(self.backend.count(collection, filter)))
            .await
    }

    pub async fn create(&self, collection: &str, doc: Document) -> CoreResult<IdRef> {
        self.guarded(|| Box::pin(self.backend.insert_one(collection, doc.clone())))
            .await
    }

    pub async fn insert_many(
        &self,
        collection: &str,
        docs: Vec<Document>,
    ) -> CoreResult<Vec<IdRef>> {
        self.guarded(|| Box::pin(self.backend.insert_many(collection, docs.clone())))
            .await
    }

    /// Patch a document by id. Returns true when something changed.
    pub async fn update_by_id(
        &self,
        collection: &str,
        id: &str,
        update: &Document,
    ) -> CoreResult<bool> {
        let id = IdRef::parse(id)?;
        let filter = json!({"_id": id.to_hex()});
        let modified = self
            .guarded(|| Box::pin(self.backend.update_one(collection, &filter, update)))
            .await?;
        Ok(modified > 0)
    }

    pub async fn update_one(
        &self,
        collection: &str,
        filter: &Document,
        update: &Document,
    ) -> CoreResult<u64> {
        self.guarded(|| Box::pin(self.backend.update_one(collection, filter, update)))
            .await
    }

    pub async fn update_many(
        &self,
        collection: &str,
        filter: &Document,
        update: &Document,
    ) -> CoreResult<u64> {
        self.guarded(|| Box::pin(self.backend.update_many(collection, filter, update)))
            .await
    }

    pub async fn upsert_one(
        &self,
        collection: &str,
        filter: &Document,
        update: &Document,
    ) -> CoreResult<UpsertOutcome> {
        self.guarded(|| Box::pin(self.backend.upsert_one(collection, filter, update)))
            .await
    }

    /// Delete by id. Returns true when a document was removed.
    pub async fn delete_by_id(&self, collection: &str, id: &str) -> CoreResult<bool> {
        let id = IdRef::parse(id)?;
        let filter = json!({"_id": id.to_hex()});
        let deleted = self
            .guarded(|| Box::pin(self.backend.delete_one(collection, &filter)))
            .await?;
        Ok(deleted > 0)
    }

    pub async fn delete_one(&self, collection: &str, filter: &Document) -> CoreResult<u64> {
        self.guarded(|| Box::pin(self.backend.delete_one(collection, filter)))
            .await
    }

    pub async fn delete_many(&self, collection: &str, filter: &Document) -> CoreResult<u64> {
        self.guarded(|| Box::pin(self.backend.delete_many(collection, filter)))
            .await
    }

    pub async fn aggregate(
        &self,
        collection: &str,
        pipeline: &[Document],
    ) -> CoreResult<Vec<Document>> {
        self.guarded(|| Box::pin(self.backend.aggregate(collection, pipeline)))
            .await
    }

    pub async fn list_collection_names(&self) -> CoreResult<Vec<String>> {
        self.guarded(|| Box::pin(self.backend.list_collection_names()))
            .await
    }

    // ---- Startup ----------------------------------------------------------

    /// Create the index set every deployment relies on.
    pub async fn ensure_indexes(&self) -> CoreResult<()> {
        let indexes: Vec<(&str, IndexSpec)> = vec![
            (col::SOURCES, IndexSpec::on("name").unique()),
            (col::CRAWLERS, IndexSpec::compound(&[("source_id", 1), ("status", 1)])),
            (col::CRAWLERS, IndexSpec::compound(&[("source_id", 1), ("version", -1)])),
            (
                col::CRAWL_RESULTS,
                IndexSpec::compound(&[("source_id", 1), ("executed_at", -1)]),
            ),
            (
                col::ERROR_LOGS,
                IndexSpec::compound(&[("resolved", 1), ("created_at", -1)]),
            ),
            (
                col::SCHEMA_REGISTRY,
                IndexSpec::compound(&[("source_id", 1), ("version", -1)]),
            ),
            (col::SCHEMA_REGISTRY, IndexSpec::on("fingerprint")),
            (col::DATA_CATALOG, IndexSpec::on("name").unique()),
            (
                col::DATA_COLUMNS,
                IndexSpec::compound(&[("dataset_id", 1), ("name", 1)]),
            ),
            (
                col::LINEAGE_EDGES,
                IndexSpec::compound(&[("source_id", 1), ("target_id", 1)]).unique(),
            ),
            (col::DATA_LINEAGE, IndexSpec::on("production_id")),
            (col::DATA_LINEAGE, IndexSpec::on("staging_id")),
            (
                col::DATA_REVIEWS,
                IndexSpec::compound(&[("review_status", 1), ("created_at", 1)]),
            ),
            (
                col::PIPELINE_METRICS,
                IndexSpec::compound(&[("source_id", 1), ("started_at", -1)]),
            ),
            (col::FRESHNESS_CONFIG, IndexSpec::on("source_id").unique()),
            (col::ALERT_HISTORY, IndexSpec::compound(&[("triggered_at", -1)])),
        ];

        for (collection, spec) in indexes {
            self.guarded(|| Box::pin(self.backend.create_index(collection, spec.clone())))
                .await?;
        }
        info!("store indexes ensured");
        Ok(())
    }

    // ---- Health -----------------------------------------------------------

    /// Ping the engine. Always returns a status, never an error.
    pub async fn health_check(&self) -> HealthStatus {
        let started = Instant::now();
        let result = self.guarded(|| Box::pin(self.backend.ping())).await;
        let latency_ms = started.elapsed().as_secs_f64() * 1000.0;

        match result {
            Ok(()) => HealthStatus {
                status: "healthy".into(),
                latency_ms,
                database: self.backend.engine_name().into(),
                error: None,
            },
            Err(e) => {
                error!(error = %e, "store health check failed");
                HealthStatus {
                    status: "unhealthy".into(),
                    latency_ms,
                    database: self.backend.engine_name().into(),
                    error: Some(e.to_string()),
                }
            }
        }
    }

    // ---- Source lifecycle -------------------------------------------------

    /// Delete a source and every child row keyed by its id.
    ///
    /// Without multi-document transactions the order is children first,
    /// parent last; a failure partway leaves orphans for the periodic
    /// maintenance sweep to reap.
    pub async fn delete_source(&self, id: &str) -> CoreResult<SourceDeletion> {
        let id = IdRef::parse(id)?;
        let child_filter = json!({"source_id": id.to_hex()});

        let mut children_deleted = BTreeMap::new();
        for child in col::SOURCE_CHILD_COLLECTIONS {
            let deleted = self
                .guarded(|| Box::pin(self.backend.delete_many(child, &child_filter)))
                .await?;
            children_deleted.insert(child.to_string(), deleted);
        }

        let parent_filter = json!({"_id": id.to_hex()});
        let deleted = self
            .guarded(|| Box::pin(self.backend.delete_one(col::SOURCES, &parent_filter)))
            .await?;

        info!(source_id = %id, deleted = deleted > 0, "source cascade delete");
        Ok(SourceDeletion {
            source_deleted: deleted > 0,
            children_deleted,
        })
    }

    /// Look a source up by its unique name.
    pub async fn get_source_by_name(&self, name: &str) -> CoreResult<Option<Document>> {
        let filter = json!({"name": name});
        self.find_one(col::SOURCES, &filter).await
    }

    /// Make `crawler_id` the single active crawler of its source.
    ///
    /// Order matters: every sibling is deactivated first, then the chosen
    /// crawler activated, so the one-active-per-source invariant holds even
    /// if the second write fails (zero active is legal, two is not).
    pub async fn activate_crawler(&self, source_id: &str, crawler_id: &str) -> CoreResult<bool> {
        let source_id = IdRef::parse(source_id)?;
        let crawler_id = IdRef::parse(crawler_id)?;

        let siblings = json!({"source_id": source_id.to_hex(), "status": "active"});
        let deactivate = json!({"$set": {"status": "inactive"}});
        self.guarded(|| Box::pin(self.backend.update_many(col::CRAWLERS, &siblings, &deactivate)))
            .await?;

        let target = json!({"_id": crawler_id.to_hex(), "source_id": source_id.to_hex()});
        let activate = json!({"$set": {"status": "active"}});
        let modified = self
            .guarded(|| Box::pin(self.backend.update_one(col::CRAWLERS, &target, &activate)))
            .await?;
        Ok(modified > 0)
    }

    /// Resolve an error log entry. An already-resolved entry is left
    /// untouched and reported as such.
    pub async fn resolve_error_log(
        &self,
        error_id: &str,
        method: &str,
        detail: Option<&str>,
    ) -> CoreResult<bool> {
        let error_id = IdRef::parse(error_id)?;
        let filter = json!({"_id": error_id.to_hex(), "resolved": false});
        let update = json!({"$set": {
            "resolved": true,
            "resolved_at": chrono::Utc::now().to_rfc3339(),
            "resolution_method": method,
            "resolution_detail": detail,
        }});
        let modified = self
            .guarded(|| Box::pin(self.backend.update_one(col::ERROR_LOGS, &filter, &update)))
            .await?;
        Ok(modified > 0)
    }

    /// Orphan sweep: remove child rows whose parent source is gone.
    ///
    /// This is the reconciliation task that cleans up after a partially
    /// failed cascade delete.
    pub async fn reap_orphans(&self) -> CoreResult<BTreeMap<String, u64>> {
        let sources = self
            .find(col::SOURCES, &json!({}), FindOptions::default())
            .await?;
        let live_ids: Vec<Value> = sources
            .iter()
            .filter_map(|s| s.get("_id").cloned())
            .collect();

        let mut reaped = BTreeMap::new();
        let filter = json!({"source_id": {"$nin": live_ids}});
        for child in col::SOURCE_CHILD_COLLECTIONS {
            let deleted = self
                .guarded(|| Box::pin(self.backend.delete_many(child, &filter)))
                .await?;
            if deleted > 0 {
                warn!(collection = %child, deleted, "reaped orphaned child rows");
            }
            reaped.insert(child.to_string(), deleted);
        }
        Ok(reaped)
    }
}
