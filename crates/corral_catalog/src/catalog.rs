//! Dataset catalog over the document store.
//!
//! Columns are stored twice: embedded in the dataset document (the display
//! model) and as rows in `data_columns` (for fast cross-dataset column
//! search). Writes keep both in sync.

use chrono::Utc;
use corral_protocol::collections as col;
use corral_protocol::{CoreError, CoreResult};
use corral_store::{FindOptions, Store};
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::model::{
    CatalogStatistics, Column, ColumnStatistics, ColumnType, Dataset, DatasetStatus, DatasetType,
    QualityMetrics, Tag, TagCategory,
};

/// Sampling depth for column inference during auto-registration.
const REGISTRATION_SAMPLE: u64 = 100;

/// Known system collections auto-registered into the catalog:
/// `(collection, display name, type, domain)`.
const SYSTEM_COLLECTIONS: &[(&str, &str, DatasetType, &str)] = &[
    (col::SOURCES, "Crawl Sources", DatasetType::Source, "platform"),
    (col::CRAWL_RESULTS, "Crawl Results", DatasetType::Source, "platform"),
    (col::NEWS_ARTICLES, "News Articles", DatasetType::Final, "news"),
    (col::FINANCIAL_DATA, "Financial Data", DatasetType::Final, "finance"),
    (col::STOCK_PRICES, "Stock Prices", DatasetType::Final, "finance"),
    (col::EXCHANGE_RATES, "Exchange Rates", DatasetType::Final, "finance"),
    (col::MARKET_INDICES, "Market Indices", DatasetType::Final, "finance"),
    (col::ANNOUNCEMENTS, "Announcements", DatasetType::Final, "disclosure"),
    (col::CRAWL_DATA, "Generic Crawl Data", DatasetType::Final, "platform"),
];

/// Input for creating a dataset.
#[derive(Debug, Clone)]
pub struct NewDataset {
    pub name: String,
    pub display_name: String,
    pub description: String,
    pub dataset_type: DatasetType,
    pub collection_name: String,
    pub domain: String,
    pub columns: Vec<Column>,
    pub tags: Vec<String>,
    pub created_by: String,
}

impl NewDataset {
    pub fn new(name: impl Into<String>, dataset_type: DatasetType) -> Self {
        let name = name.into();
        Self {
            display_name: name.clone(),
            collection_name: name.clone(),
            name,
            description: String::new(),
            dataset_type,
            domain: String::new(),
            columns: Vec::new(),
            tags: Vec::new(),
            created_by: "system".into(),
        }
    }
}

/// The dataset catalog.
pub struct DataCatalog {
    store: Store,
}

impl DataCatalog {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    // ---- Dataset CRUD -----------------------------------------------------

    /// Create a dataset in `draft` status. Names are unique.
    pub async fn create_dataset(&self, new: NewDataset) -> CoreResult<Dataset> {
        if self.get_dataset_by_name(&new.name).await?.is_some() {
            return Err(CoreError::DuplicateName(new.name));
        }

        let dataset = Dataset {
            id: None,
            name: new.name,
            display_name: new.display_name,
            description: new.description,
            dataset_type: new.dataset_type,
            status: DatasetStatus::Draft,
            collection_name: new.collection_name,
            domain: new.domain,
            subdomain: String::new(),
            columns: new.columns,
            tags: new.tags.clone(),
            quality: None,
            record_count: 0,
            upstream: Vec::new(),
            downstream: Vec::new(),
            access_count: 0,
            last_accessed_at: None,
            created_at: Utc::now(),
            updated_at: None,
            created_by: new.created_by,
        };

        let doc = serde_json::to_value(&dataset)?;
        let id = self.store.create(col::DATA_CATALOG, doc).await?;
        let id_hex = id.to_hex();

        self.save_columns(&id_hex, &dataset.columns).await?;
        if !new.tags.is_empty() {
            self.increment_tag_usage(&new.tags).await?;
        }

        info!(dataset_id = %id_hex, name = %dataset.name, "dataset created");
        let mut created = dataset;
        created.id = Some(id);
        Ok(created)
    }

    pub async fn get_dataset(&self, dataset_id: &str) -> CoreResult<Option<Dataset>> {
        let doc = self.store.get(col::DATA_CATALOG, dataset_id).await?;
        doc.map(serde_json::from_value)
            .transpose()
            .map_err(Into::into)
    }

    pub async fn get_dataset_by_name(&self, name: &str) -> CoreResult<Option<Dataset>> {
        let doc = self
            .store
            .find_one(col::DATA_CATALOG, &json!({"name": name}))
            .await?;
        doc.map(serde_json::from_value)
            .transpose()
            .map_err(Into::into)
    }

    pub async fn get_dataset_by_collection(
        &self,
        collection_name: &str,
    ) -> CoreResult<Option<Dataset>> {
        let doc = self
            .store
            .find_one(col::DATA_CATALOG, &json!({"collection_name": collection_name}))
            .await?;
        doc.map(serde_json::from_value)
            .transpose()
            .map_err(Into::into)
    }

    pub async fn list_datasets(
        &self,
        dataset_type: Option<DatasetType>,
        status: Option<DatasetStatus>,
        domain: Option<&str>,
        skip: u64,
        limit: u64,
    ) -> CoreResult<Vec<Dataset>> {
        let mut filter = json!({});
        if let Some(dataset_type) = dataset_type {
            filter["dataset_type"] = json!(dataset_type.as_str());
        }
        if let Some(status) = status {
            filter["status"] = json!(status.as_str());
        }
        if let Some(domain) = domain {
            filter["domain"] = json!(domain);
        }

        let docs = self
            .store
            .find(
                col::DATA_CATALOG,
                &filter,
                FindOptions::sorted("name", 1).with_skip(skip).with_limit(limit),
            )
            .await?;
        docs.into_iter()
            .map(|d| serde_json::from_value(d).map_err(Into::into))
            .collect()
    }

    /// Patch dataset fields. A `columns` patch also rewrites the
    /// `data_columns` rows.
    pub async fn update_dataset(&self, dataset_id: &str, patch: Value) -> CoreResult<bool> {
        let mut set = patch;
        set["updated_at"] = json!(Utc::now().to_rfc3339());

        let columns: Option<Vec<Column>> = match set.get("columns") {
            Some(raw) => Some(serde_json::from_value(raw.clone())?),
            None => None,
        };

        let updated = self
            .store
            .update_by_id(col::DATA_CATALOG, dataset_id, &json!({"$set": set}))
            .await?;

        if let Some(columns) = columns {
            self.save_columns(dataset_id, &columns).await?;
        }
        Ok(updated)
    }

    pub async fn update_dataset_status(
        &self,
        dataset_id: &str,
        status: DatasetStatus,
    ) -> CoreResult<bool> {
        self.store
            .update_by_id(
                col::DATA_CATALOG,
                dataset_id,
                &json!({"$set": {
                    "status": status.as_str(),
                    "updated_at": Utc::now().to_rfc3339(),
                }}),
            )
            .await
    }

    /// Delete a dataset and its column rows.
    pub async fn delete_dataset(&self, dataset_id: &str) -> CoreResult<bool> {
        self.store
            .delete_many(col::DATA_COLUMNS, &json!({"dataset_id": dataset_id}))
            .await?;
        self.store.delete_by_id(col::DATA_CATALOG, dataset_id).await
    }

    // ---- Columns ----------------------------------------------------------

    /// Rewrite the embedded columns and the `data_columns` rows together.
    pub async fn save_columns(&self, dataset_id: &str, columns: &[Column]) -> CoreResult<()> {
        self.store
            .update_by_id(
                col::DATA_CATALOG,
                dataset_id,
                &json!({"$set": {"columns": serde_json::to_value(columns)?}}),
            )
            .await?;

        self.store
            .delete_many(col::DATA_COLUMNS, &json!({"dataset_id": dataset_id}))
            .await?;
        if !columns.is_empty() {
            let rows: Vec<Value> = columns
                .iter()
                .map(|column| {
                    let mut row = serde_json::to_value(column).unwrap_or(Value::Null);
                    row["dataset_id"] = json!(dataset_id);
                    row
                })
                .collect();
            self.store.insert_many(col::DATA_COLUMNS, rows).await?;
        }
        Ok(())
    }

    pub async fn get_columns(&self, dataset_id: &str) -> CoreResult<Vec<Column>> {
        let rows = self
            .store
            .find(
                col::DATA_COLUMNS,
                &json!({"dataset_id": dataset_id}),
                FindOptions::sorted("name", 1),
            )
            .await?;
        rows.into_iter()
            .map(|r| serde_json::from_value(r).map_err(Into::into))
            .collect()
    }

    /// Find datasets exposing a column name, across the whole catalog.
    pub async fn search_columns(&self, column_name: &str) -> CoreResult<Vec<Value>> {
        self.store
            .find(
                col::DATA_COLUMNS,
                &json!({"name": column_name}),
                FindOptions::sorted("dataset_id", 1),
            )
            .await
    }

    pub async fn add_column(&self, dataset_id: &str, column: Column) -> CoreResult<bool> {
        let Some(dataset) = self.get_dataset(dataset_id).await? else {
            return Ok(false);
        };
        if dataset.get_column(&column.name).is_some() {
            return Err(CoreError::DuplicateField(column.name));
        }
        let mut columns = dataset.columns;
        columns.push(column);
        self.save_columns(dataset_id, &columns).await?;
        Ok(true)
    }

    /// Replace the statistics blob of one column, both copies.
    pub async fn update_column_statistics(
        &self,
        dataset_id: &str,
        column_name: &str,
        statistics: ColumnStatistics,
    ) -> CoreResult<bool> {
        let Some(dataset) = self.get_dataset(dataset_id).await? else {
            return Ok(false);
        };
        let mut columns = dataset.columns;
        let Some(column) = columns.iter_mut().find(|c| c.name == column_name) else {
            return Ok(false);
        };
        let mut statistics = statistics;
        statistics.computed_at = Some(Utc::now());
        column.statistics = Some(statistics);

        self.save_columns(dataset_id, &columns).await?;
        Ok(true)
    }

    // ---- Tags -------------------------------------------------------------

    pub async fn create_tag(
        &self,
        name: &str,
        category: TagCategory,
        description: &str,
        created_by: &str,
    ) -> CoreResult<Tag> {
        if self.get_tag(name).await?.is_some() {
            return Err(CoreError::DuplicateName(name.to_string()));
        }
        let tag = Tag {
            id: None,
            name: name.to_string(),
            category,
            description: description.to_string(),
            color: "#808080".into(),
            usage_count: 0,
            created_by: created_by.to_string(),
            created_at: Utc::now(),
        };
        let id = self
            .store
            .create(col::DATA_TAGS, serde_json::to_value(&tag)?)
            .await?;
        let mut created = tag;
        created.id = Some(id);
        Ok(created)
    }

    pub async fn get_tag(&self, name: &str) -> CoreResult<Option<Tag>> {
        let doc = self
            .store
            .find_one(col::DATA_TAGS, &json!({"name": name}))
            .await?;
        doc.map(serde_json::from_value)
            .transpose()
            .map_err(Into::into)
    }

    pub async fn list_tags(&self, category: Option<TagCategory>) -> CoreResult<Vec<Tag>> {
        let mut filter = json!({});
        if let Some(category) = category {
            filter["category"] = serde_json::to_value(category)?;
        }
        let docs = self
            .store
            .find(col::DATA_TAGS, &filter, FindOptions::sorted("usage_count", -1))
            .await?;
        docs.into_iter()
            .map(|d| serde_json::from_value(d).map_err(Into::into))
            .collect()
    }

    /// Attach tags to a dataset. Each attach bumps the tag's usage counter;
    /// missing tags are created on the fly.
    pub async fn add_tags_to_dataset(
        &self,
        dataset_id: &str,
        tags: &[String],
    ) -> CoreResult<bool> {
        for tag in tags {
            self.store
                .update_by_id(
                    col::DATA_CATALOG,
                    dataset_id,
                    &json!({"$addToSet": {"tags": tag}}),
                )
                .await?;
        }
        self.increment_tag_usage(tags).await?;
        Ok(true)
    }

    /// Detach tags from a dataset. Usage counters are left as they are.
    pub async fn remove_tags_from_dataset(
        &self,
        dataset_id: &str,
        tags: &[String],
    ) -> CoreResult<bool> {
        let Some(dataset) = self.get_dataset(dataset_id).await? else {
            return Ok(false);
        };
        let remaining: Vec<&String> = dataset
            .tags
            .iter()
            .filter(|t| !tags.contains(*t))
            .collect();
        self.store
            .update_by_id(
                col::DATA_CATALOG,
                dataset_id,
                &json!({"$set": {"tags": remaining}}),
            )
            .await
    }

    async fn increment_tag_usage(&self, tags: &[String]) -> CoreResult<()> {
        for tag in tags {
            let outcome = self
                .store
                .upsert_one(
                    col::DATA_TAGS,
                    &json!({"name": tag}),
                    &json!({
                        "$inc": {"usage_count": 1},
                        "$set": {"last_used_at": Utc::now().to_rfc3339()},
                    }),
                )
                .await?;
            if outcome.upserted_id.is_some() {
                // Auto-created tag rows still need their creation stamp
                self.store
                    .update_one(
                        col::DATA_TAGS,
                        &json!({"name": tag}),
                        &json!({"$set": {
                            "category": "custom",
                            "created_at": Utc::now().to_rfc3339(),
                            "created_by": "system",
                        }}),
                    )
                    .await?;
            }
        }
        Ok(())
    }

    // ---- Quality ----------------------------------------------------------

    /// Store quality metrics, recomputing the weighted overall score.
    pub async fn update_quality_metrics(
        &self,
        dataset_id: &str,
        mut metrics: QualityMetrics,
    ) -> CoreResult<bool> {
        metrics.overall_score = metrics.calculate_overall();
        metrics.evaluated_at = Some(Utc::now());
        self.store
            .update_by_id(
                col::DATA_CATALOG,
                dataset_id,
                &json!({"$set": {
                    "quality": serde_json::to_value(&metrics)?,
                    "updated_at": Utc::now().to_rfc3339(),
                }}),
            )
            .await
    }

    // ---- Auto-registration ------------------------------------------------

    /// Register the known system collections plus every `staging_*`
    /// collection, inferring columns from up to 100 sampled documents.
    /// Existing entries are left untouched.
    pub async fn register_existing_collections(&self) -> CoreResult<Vec<Dataset>> {
        let mut registered = Vec::new();

        for (collection, display_name, dataset_type, domain) in SYSTEM_COLLECTIONS {
            if self.get_dataset_by_collection(collection).await?.is_some() {
                continue;
            }
            match self
                .register_collection(collection, display_name, *dataset_type, domain)
                .await
            {
                Ok(dataset) => registered.push(dataset),
                Err(e) => warn!(collection = %collection, error = %e, "auto-registration failed"),
            }
        }

        for collection in self.store.list_collection_names().await? {
            if !collection.starts_with("staging_") {
                continue;
            }
            if self.get_dataset_by_collection(&collection).await?.is_some() {
                continue;
            }
            let display = format!("Staging: {}", collection.trim_start_matches("staging_"));
            match self
                .register_collection(&collection, &display, DatasetType::Staging, "staging")
                .await
            {
                Ok(dataset) => registered.push(dataset),
                Err(e) => warn!(collection = %collection, error = %e, "auto-registration failed"),
            }
        }

        info!(count = registered.len(), "collections auto-registered");
        Ok(registered)
    }

    async fn register_collection(
        &self,
        collection: &str,
        display_name: &str,
        dataset_type: DatasetType,
        domain: &str,
    ) -> CoreResult<Dataset> {
        let columns = self.detect_columns(collection).await?;
        let record_count = self.store.count(collection, &json!({})).await?;

        let mut new = NewDataset::new(collection, dataset_type);
        new.display_name = display_name.to_string();
        new.domain = domain.to_string();
        new.columns = columns;

        let dataset = self.create_dataset(new).await?;
        let id = dataset.id.expect("id assigned on create").to_hex();
        self.store
            .update_by_id(
                col::DATA_CATALOG,
                &id,
                &json!({"$set": {"record_count": record_count, "status": "active"}}),
            )
            .await?;
        Ok(dataset)
    }

    /// Infer columns from sampled documents: per-field type histogram, the
    /// mode wins; nullable when any observed value is null; `_id` is the
    /// primary key.
    async fn detect_columns(&self, collection: &str) -> CoreResult<Vec<Column>> {
        use std::collections::BTreeMap;

        let sample = self
            .store
            .find(
                collection,
                &json!({}),
                FindOptions::default().with_limit(REGISTRATION_SAMPLE),
            )
            .await?;

        let mut type_counts: BTreeMap<String, BTreeMap<ColumnType, u64>> = BTreeMap::new();
        let mut saw_null: BTreeMap<String, bool> = BTreeMap::new();

        for doc in &sample {
            let Some(map) = doc.as_object() else { continue };
            for (name, value) in map {
                let nullable = saw_null.entry(name.clone()).or_insert(false);
                if value.is_null() {
                    *nullable = true;
                    continue;
                }
                *type_counts
                    .entry(name.clone())
                    .or_default()
                    .entry(ColumnType::of_value(value))
                    .or_insert(0) += 1;
            }
        }

        let mut columns = Vec::new();
        let mut names: Vec<&String> = type_counts.keys().chain(saw_null.keys()).collect();
        names.sort();
        names.dedup();

        for name in names {
            let data_type = type_counts
                .get(name)
                .and_then(|counts| counts.iter().max_by_key(|(_, n)| **n))
                .map(|(ty, _)| *ty)
                .unwrap_or(ColumnType::Unknown);

            let mut column = Column::new(name.clone(), data_type);
            column.nullable = saw_null.get(name).copied().unwrap_or(false);
            if name == "_id" {
                column = column.primary_key();
            }
            columns.push(column);
        }
        Ok(columns)
    }

    // ---- Statistics -------------------------------------------------------

    pub async fn get_statistics(&self) -> CoreResult<CatalogStatistics> {
        let mut stats = CatalogStatistics {
            total_datasets: self.store.count(col::DATA_CATALOG, &json!({})).await?,
            active_datasets: self
                .store
                .count(col::DATA_CATALOG, &json!({"status": "active"}))
                .await?,
            total_columns: self.store.count(col::DATA_COLUMNS, &json!({})).await?,
            total_tags: self.store.count(col::DATA_TAGS, &json!({})).await?,
            ..Default::default()
        };

        let by_type = self
            .store
            .aggregate(
                col::DATA_CATALOG,
                &[json!({"$group": {"_id": "$dataset_type", "count": {"$sum": 1}}})],
            )
            .await?;
        for group in by_type {
            if let (Some(ty), Some(count)) = (group["_id"].as_str(), group["count"].as_u64()) {
                stats.by_type.insert(ty.to_string(), count);
            }
        }

        let by_status = self
            .store
            .aggregate(
                col::DATA_CATALOG,
                &[json!({"$group": {"_id": "$status", "count": {"$sum": 1}}})],
            )
            .await?;
        for group in by_status {
            if let (Some(status), Some(count)) = (group["_id"].as_str(), group["count"].as_u64()) {
                stats.by_status.insert(status.to_string(), count);
            }
        }

        Ok(stats)
    }

    /// Refresh a dataset's record count from its backing collection.
    pub async fn update_dataset_stats(&self, dataset_id: &str) -> CoreResult<bool> {
        let Some(dataset) = self.get_dataset(dataset_id).await? else {
            return Ok(false);
        };
        let record_count = self.store.count(&dataset.collection_name, &json!({})).await?;
        self.store
            .update_by_id(
                col::DATA_CATALOG,
                dataset_id,
                &json!({"$set": {
                    "record_count": record_count,
                    "updated_at": Utc::now().to_rfc3339(),
                }}),
            )
            .await
    }

    /// Count one access for popularity ranking.
    pub async fn record_access(&self, dataset_id: &str) -> CoreResult<bool> {
        self.store
            .update_by_id(
                col::DATA_CATALOG,
                dataset_id,
                &json!({
                    "$inc": {"access_count": 1},
                    "$set": {"last_accessed_at": Utc::now().to_rfc3339()},
                }),
            )
            .await
    }
}
