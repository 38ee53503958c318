//! Versioned schema store.
//!
//! One version chain per `source_id`, persisted in the `schema_registry`
//! collection. Registrations dedup on fingerprint, are guarded by the
//! compatibility checker, and serialize per source so concurrent writers
//! cannot mint the same version number. The read cache is invalidated on
//! every write to a source.

use chrono::Utc;
use corral_protocol::collections as col;
use corral_protocol::{CoreError, CoreResult};
use corral_store::{FindOptions, Store};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::info;

use crate::compatibility::CompatibilityChecker;
use crate::detector::SchemaDetector;
use crate::model::{
    CompatibilityIssue, CompatibilityMode, CompatibilityResult, DataCategory, FieldSchema,
    IssueSeverity, Schema, SchemaVersion, default_schema,
};

/// The schema registry.
pub struct SchemaRegistry {
    store: Store,
    checker: CompatibilityChecker,
    detector: SchemaDetector,
    cache: RwLock<HashMap<String, Vec<SchemaVersion>>>,
    /// Per-source write serialization
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl SchemaRegistry {
    pub fn new(store: Store) -> Self {
        Self {
            store,
            checker: CompatibilityChecker::new(),
            detector: SchemaDetector::new(),
            cache: RwLock::new(HashMap::new()),
            locks: Mutex::new(HashMap::new()),
        }
    }

    async fn source_lock(&self, source_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks
            .entry(source_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Register a new schema version.
    ///
    /// Identical content (same fingerprint as the latest version) returns
    /// the existing version without a write. Incompatible content raises
    /// `SchemaIncompatible` and writes nothing.
    pub async fn register(
        &self,
        source_id: &str,
        schema: Schema,
        created_by: &str,
        change_description: &str,
        mode: CompatibilityMode,
        tags: Vec<String>,
    ) -> CoreResult<(SchemaVersion, CompatibilityResult)> {
        let lock = self.source_lock(source_id).await;
        let _guard = lock.lock().await;

        let fingerprint = schema.compute_fingerprint();
        let all_versions = self.load_versions(source_id, true).await?;
        let latest = all_versions.last();

        if let Some(latest) = latest {
            if latest.fingerprint == fingerprint {
                info!(source_id, %fingerprint, "schema unchanged, reusing version");
                return Ok((latest.clone(), CompatibilityResult::compatible(mode)));
            }
        }

        let mut result = CompatibilityResult::compatible(mode);
        if let Some(latest) = latest {
            if mode != CompatibilityMode::None {
                result = if mode.is_transitive() {
                    let actives: Vec<&Schema> = all_versions
                        .iter()
                        .filter(|v| v.is_active)
                        .map(|v| &v.schema)
                        .collect();
                    self.checker.check_all(&actives, &schema, mode)
                } else {
                    self.checker.check(&latest.schema, &schema, mode)
                };

                if !result.is_compatible {
                    let issues = result
                        .errors()
                        .iter()
                        .map(|e| format!("{}: {}", e.field_name, e.message))
                        .collect();
                    return Err(CoreError::SchemaIncompatible {
                        mode: mode.to_string(),
                        issues,
                    });
                }
            }
        }

        let version = SchemaVersion {
            version: latest.map(|v| v.version + 1).unwrap_or(1),
            schema,
            fingerprint: fingerprint.clone(),
            created_at: Utc::now(),
            created_by: created_by.to_string(),
            change_description: change_description.to_string(),
            is_active: true,
            compatibility_mode: mode,
            tags,
            deprecated_at: None,
            deprecated_reason: None,
        };

        let mut doc = serde_json::to_value(&version)?;
        doc.as_object_mut()
            .expect("SchemaVersion serializes to an object")
            .insert("source_id".into(), json!(source_id));
        self.store.create(col::SCHEMA_REGISTRY, doc).await?;

        self.invalidate(source_id).await;
        info!(
            source_id,
            version = version.version,
            %fingerprint,
            warnings = result.warnings().len(),
            "schema version registered"
        );
        Ok((version, result))
    }

    /// Register the template schema of a data category, with optional
    /// extra fields appended.
    pub async fn register_for_category(
        &self,
        source_id: &str,
        category: DataCategory,
        created_by: &str,
        extra_fields: Vec<FieldSchema>,
    ) -> CoreResult<(SchemaVersion, CompatibilityResult)> {
        let mut schema = default_schema(category);
        for field in extra_fields {
            schema.add_field(field)?;
        }
        self.register(
            source_id,
            schema,
            created_by,
            &format!("Initial schema from category: {category}"),
            CompatibilityMode::Backward,
            Vec::new(),
        )
        .await
    }

    /// Fetch a version: the explicit number if given, else the highest
    /// active version, else the highest of any status.
    pub async fn get(
        &self,
        source_id: &str,
        version: Option<u32>,
    ) -> CoreResult<Option<SchemaVersion>> {
        let versions = self.load_versions(source_id, true).await?;
        if versions.is_empty() {
            return Ok(None);
        }

        match version {
            Some(n) => Ok(versions.iter().find(|v| v.version == n).cloned()),
            None => Ok(versions
                .iter()
                .rev()
                .find(|v| v.is_active)
                .or_else(|| versions.last())
                .cloned()),
        }
    }

    /// Every version for a source, oldest first.
    pub async fn get_versions(
        &self,
        source_id: &str,
        include_inactive: bool,
    ) -> CoreResult<Vec<SchemaVersion>> {
        self.load_versions(source_id, include_inactive).await
    }

    /// Compact history for UIs, newest `limit` entries.
    pub async fn get_version_history(
        &self,
        source_id: &str,
        limit: usize,
    ) -> CoreResult<Vec<Value>> {
        let versions = self.load_versions(source_id, true).await?;
        let start = versions.len().saturating_sub(limit);
        Ok(versions[start..]
            .iter()
            .map(|v| {
                json!({
                    "version": v.version,
                    "fingerprint": v.fingerprint,
                    "created_at": v.created_at.to_rfc3339(),
                    "created_by": v.created_by,
                    "change_description": v.change_description,
                    "is_active": v.is_active,
                    "field_count": v.schema.fields.len(),
                    "tags": v.tags,
                })
            })
            .collect())
    }

    /// Deactivate one version. Idempotent; returns whether a row changed.
    pub async fn deprecate(
        &self,
        source_id: &str,
        version: u32,
        reason: &str,
    ) -> CoreResult<bool> {
        let modified = self
            .store
            .update_one(
                col::SCHEMA_REGISTRY,
                &json!({"source_id": source_id, "version": version}),
                &json!({"$set": {
                    "is_active": false,
                    "deprecated_at": Utc::now().to_rfc3339(),
                    "deprecated_reason": reason,
                }}),
            )
            .await?;

        if modified > 0 {
            self.invalidate(source_id).await;
            info!(source_id, version, "schema version deprecated");
        }
        Ok(modified > 0)
    }

    /// Check a candidate schema without writing anything.
    pub async fn check_compatibility(
        &self,
        source_id: &str,
        new_schema: &Schema,
        mode: Option<CompatibilityMode>,
    ) -> CoreResult<CompatibilityResult> {
        let Some(current) = self.get(source_id, None).await? else {
            return Ok(CompatibilityResult::compatible(
                mode.unwrap_or_default(),
            ));
        };
        let mode = mode.unwrap_or(current.compatibility_mode);
        Ok(self.checker.check(&current.schema, new_schema, mode))
    }

    /// Pairwise results against every active version, keyed `v{n}`.
    pub async fn check_transitive_compatibility(
        &self,
        source_id: &str,
        new_schema: &Schema,
        mode: CompatibilityMode,
    ) -> CoreResult<HashMap<String, CompatibilityResult>> {
        let versions = self.load_versions(source_id, false).await?;
        let mut results = HashMap::new();
        for version in &versions {
            results.insert(
                format!("v{}", version.version),
                self.checker.check(&version.schema, new_schema, mode),
            );
        }
        Ok(results)
    }

    /// Detect drift between the registered schema and sampled live data.
    pub async fn detect_drift(
        &self,
        source_id: &str,
        sample: &[Value],
    ) -> CoreResult<CompatibilityResult> {
        let Some(current) = self.get(source_id, None).await? else {
            return Ok(CompatibilityResult {
                is_compatible: true,
                issues: vec![CompatibilityIssue {
                    field_name: "_".into(),
                    issue_type: "no_schema".into(),
                    severity: IssueSeverity::Warning,
                    message: format!("No schema registered for source {source_id}"),
                    old_value: None,
                    new_value: None,
                }],
                mode: CompatibilityMode::Full,
                checked_at: Utc::now(),
            });
        };

        let detected = self.detector.detect_from_data(sample, None, None);
        Ok(self
            .checker
            .check(&current.schema, &detected, CompatibilityMode::Full))
    }

    /// Field-level diff between two stored versions.
    pub async fn compare(
        &self,
        source_id: &str,
        version1: u32,
        version2: u32,
    ) -> CoreResult<Value> {
        let v1 = self
            .get(source_id, Some(version1))
            .await?
            .ok_or_else(|| CoreError::not_found(format!("{source_id} v{version1}")))?;
        let v2 = self
            .get(source_id, Some(version2))
            .await?
            .ok_or_else(|| CoreError::not_found(format!("{source_id} v{version2}")))?;

        let names1 = v1.schema.field_names();
        let names2 = v2.schema.field_names();

        let mut modified = Vec::new();
        for name in names1.intersection(&names2) {
            let f1 = v1.schema.get_field(name).expect("present in v1");
            let f2 = v2.schema.get_field(name).expect("present in v2");
            if f1 != f2 {
                modified.push(json!({
                    "field": name,
                    "v1": serde_json::to_value(f1)?,
                    "v2": serde_json::to_value(f2)?,
                }));
            }
        }

        Ok(json!({
            "source_id": source_id,
            "version1": {
                "version": v1.version,
                "fingerprint": v1.fingerprint,
                "field_count": v1.schema.fields.len(),
            },
            "version2": {
                "version": v2.version,
                "fingerprint": v2.fingerprint,
                "field_count": v2.schema.fields.len(),
            },
            "changes": {
                "added_fields": names2.difference(&names1).collect::<Vec<_>>(),
                "removed_fields": names1.difference(&names2).collect::<Vec<_>>(),
                "common_fields": names1.intersection(&names2).collect::<Vec<_>>(),
                "modified_fields": modified,
            },
        }))
    }

    /// Every source with registered schemas, most recently updated first.
    pub async fn list_all_sources(&self) -> CoreResult<Vec<Value>> {
        let pipeline = vec![
            json!({"$group": {
                "_id": "$source_id",
                "version_count": {"$sum": 1},
                "latest_version": {"$max": "$version"},
                "first_registered": {"$min": "$created_at"},
                "last_updated": {"$max": "$created_at"},
            }}),
            json!({"$sort": {"last_updated": -1}}),
        ];
        let rows = self.store.aggregate(col::SCHEMA_REGISTRY, &pipeline).await?;
        Ok(rows
            .into_iter()
            .map(|row| {
                json!({
                    "source_id": row["_id"],
                    "version_count": row["version_count"],
                    "latest_version": row["latest_version"],
                    "first_registered": row["first_registered"],
                    "last_updated": row["last_updated"],
                })
            })
            .collect())
    }

    /// Export one version in a portable envelope.
    pub async fn export_schema(
        &self,
        source_id: &str,
        version: Option<u32>,
    ) -> CoreResult<Option<Value>> {
        let Some(found) = self.get(source_id, version).await? else {
            return Ok(None);
        };
        Ok(Some(json!({
            "source_id": source_id,
            "version": found.version,
            "fingerprint": found.fingerprint,
            "schema": serde_json::to_value(&found.schema)?,
            "metadata": {
                "created_at": found.created_at.to_rfc3339(),
                "created_by": found.created_by,
                "change_description": found.change_description,
                "compatibility_mode": found.compatibility_mode.as_str(),
                "tags": found.tags,
            },
            "exported_at": Utc::now().to_rfc3339(),
        })))
    }

    /// Import a previously exported envelope as a new version.
    pub async fn import_schema(
        &self,
        source_id: &str,
        envelope: &Value,
        created_by: &str,
    ) -> CoreResult<(SchemaVersion, CompatibilityResult)> {
        let schema: Schema = serde_json::from_value(
            envelope
                .get("schema")
                .cloned()
                .ok_or_else(|| CoreError::internal("import envelope missing 'schema'"))?,
        )?;
        let origin = envelope
            .get("source_id")
            .and_then(Value::as_str)
            .unwrap_or("unknown");
        self.register(
            source_id,
            schema,
            created_by,
            &format!("Imported from {origin}"),
            CompatibilityMode::Backward,
            Vec::new(),
        )
        .await
    }

    /// Registry health snapshot.
    pub async fn health_check(&self) -> Value {
        let total = self.store.count(col::SCHEMA_REGISTRY, &json!({})).await;
        let sources = self.list_all_sources().await;
        let cached = self.cache.read().await.len();

        match (total, sources) {
            (Ok(total_schemas), Ok(sources)) => json!({
                "status": "healthy",
                "total_schemas": total_schemas,
                "total_sources": sources.len(),
                "cached_sources": cached,
            }),
            (Err(e), _) | (_, Err(e)) => json!({
                "status": "unhealthy",
                "error": e.to_string(),
            }),
        }
    }

    /// Drop cached versions for one source, or everything.
    pub async fn invalidate(&self, source_id: &str) {
        let mut cache = self.cache.write().await;
        cache.retain(|key, _| !key.starts_with(source_id));
    }

    async fn load_versions(
        &self,
        source_id: &str,
        include_inactive: bool,
    ) -> CoreResult<Vec<SchemaVersion>> {
        let cache_key = format!("{source_id}:{include_inactive}");
        {
            let cache = self.cache.read().await;
            if let Some(versions) = cache.get(&cache_key) {
                return Ok(versions.clone());
            }
        }

        let mut filter = json!({"source_id": source_id});
        if !include_inactive {
            filter["is_active"] = json!(true);
        }
        let docs = self
            .store
            .find(col::SCHEMA_REGISTRY, &filter, FindOptions::sorted("version", 1))
            .await?;

        let versions: Vec<SchemaVersion> = docs
            .into_iter()
            .map(serde_json::from_value)
            .collect::<Result<_, _>>()?;

        let mut cache = self.cache.write().await;
        cache.insert(cache_key, versions.clone());
        Ok(versions)
    }
}
