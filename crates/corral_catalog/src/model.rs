//! Catalog entities.

use chrono::{DateTime, Utc};
use corral_ids::IdRef;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

/// Role of a dataset in the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DatasetType {
    /// Raw crawl target output
    Source,
    /// Awaiting review
    Staging,
    /// Cleaned/reshaped
    Transformed,
    /// Rolled up
    Aggregated,
    /// Analysis-ready production data
    Final,
}

impl DatasetType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DatasetType::Source => "source",
            DatasetType::Staging => "staging",
            DatasetType::Transformed => "transformed",
            DatasetType::Aggregated => "aggregated",
            DatasetType::Final => "final",
        }
    }
}

impl fmt::Display for DatasetType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Dataset lifecycle: draft → active → deprecated → archived.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DatasetStatus {
    Draft,
    Active,
    Deprecated,
    Archived,
}

impl DatasetStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DatasetStatus::Draft => "draft",
            DatasetStatus::Active => "active",
            DatasetStatus::Deprecated => "deprecated",
            DatasetStatus::Archived => "archived",
        }
    }
}

/// Observed storage type of a column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnType {
    String,
    Integer,
    Float,
    Boolean,
    Date,
    #[serde(rename = "datetime")]
    DateTime,
    Array,
    Object,
    Binary,
    Unknown,
}

impl ColumnType {
    /// Classify one sampled value.
    pub fn of_value(value: &Value) -> Self {
        match value {
            Value::Null => ColumnType::Unknown,
            Value::Bool(_) => ColumnType::Boolean,
            Value::Number(n) => {
                if n.is_i64() || n.is_u64() {
                    ColumnType::Integer
                } else {
                    ColumnType::Float
                }
            }
            Value::String(_) => ColumnType::String,
            Value::Array(_) => ColumnType::Array,
            Value::Object(_) => ColumnType::Object,
        }
    }
}

/// Column sensitivity classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SensitivityLevel {
    #[default]
    Public,
    Internal,
    Confidential,
    Restricted,
}

/// Tag grouping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TagCategory {
    Domain,
    Technical,
    Quality,
    Usage,
    #[default]
    Custom,
}

/// A named label with a usage counter.
///
/// The counter increments on every attach and is never decremented, not
/// even on detach.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tag {
    #[serde(rename = "_id", skip_serializing_if = "Option::is_none")]
    pub id: Option<IdRef>,
    pub name: String,
    #[serde(default)]
    pub category: TagCategory,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_tag_color")]
    pub color: String,
    #[serde(default)]
    pub usage_count: u64,
    #[serde(default = "default_created_by")]
    pub created_by: String,
    pub created_at: DateTime<Utc>,
}

fn default_tag_color() -> String {
    "#808080".to_string()
}

fn default_created_by() -> String {
    "system".to_string()
}

/// Quality metric weights are fixed across the platform.
const WEIGHT_COMPLETENESS: f64 = 0.20;
const WEIGHT_ACCURACY: f64 = 0.25;
const WEIGHT_CONSISTENCY: f64 = 0.15;
const WEIGHT_TIMELINESS: f64 = 0.10;
const WEIGHT_UNIQUENESS: f64 = 0.15;
const WEIGHT_VALIDITY: f64 = 0.15;

/// Quality scores consumed from the validation pipeline; the catalog
/// stores them and derives the weighted overall score.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QualityMetrics {
    #[serde(default)]
    pub completeness: f64,
    #[serde(default)]
    pub accuracy: f64,
    #[serde(default)]
    pub consistency: f64,
    #[serde(default)]
    pub timeliness: f64,
    #[serde(default)]
    pub uniqueness: f64,
    #[serde(default)]
    pub validity: f64,
    #[serde(default)]
    pub overall_score: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evaluated_at: Option<DateTime<Utc>>,
}

impl QualityMetrics {
    /// Weighted sum of the six dimensions.
    pub fn calculate_overall(&self) -> f64 {
        let score = self.completeness * WEIGHT_COMPLETENESS
            + self.accuracy * WEIGHT_ACCURACY
            + self.consistency * WEIGHT_CONSISTENCY
            + self.timeliness * WEIGHT_TIMELINESS
            + self.uniqueness * WEIGHT_UNIQUENESS
            + self.validity * WEIGHT_VALIDITY;
        (score * 100.0).round() / 100.0
    }
}

/// Statistics attached to a column; regenerated, never hand-edited.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ColumnStatistics {
    #[serde(default)]
    pub null_count: u64,
    #[serde(default)]
    pub null_rate: f64,
    #[serde(default)]
    pub distinct_count: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_value: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_value: Option<Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sample_values: Vec<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub computed_at: Option<DateTime<Utc>>,
}

/// One column of a dataset.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    pub data_type: ColumnType,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_true")]
    pub nullable: bool,
    #[serde(default)]
    pub is_primary_key: bool,
    #[serde(default)]
    pub business_name: String,
    #[serde(default)]
    pub business_definition: String,
    #[serde(default)]
    pub sensitivity: SensitivityLevel,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub statistics: Option<ColumnStatistics>,
}

fn default_true() -> bool {
    true
}

impl Column {
    pub fn new(name: impl Into<String>, data_type: ColumnType) -> Self {
        Self {
            name: name.into(),
            data_type,
            description: String::new(),
            nullable: true,
            is_primary_key: false,
            business_name: String::new(),
            business_definition: String::new(),
            sensitivity: SensitivityLevel::default(),
            tags: Vec::new(),
            statistics: None,
        }
    }

    pub fn primary_key(mut self) -> Self {
        self.is_primary_key = true;
        self.nullable = false;
        self
    }
}

/// Embedded pointer to a neighboring dataset in the lineage graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LineageRef {
    pub dataset_id: String,
    pub dataset_name: String,
    pub relationship: String,
}

/// A cataloged dataset.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Dataset {
    #[serde(rename = "_id", skip_serializing_if = "Option::is_none")]
    pub id: Option<IdRef>,
    pub name: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub description: String,
    pub dataset_type: DatasetType,
    pub status: DatasetStatus,
    #[serde(default)]
    pub collection_name: String,
    #[serde(default)]
    pub domain: String,
    #[serde(default)]
    pub subdomain: String,
    #[serde(default)]
    pub columns: Vec<Column>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quality: Option<QualityMetrics>,
    #[serde(default)]
    pub record_count: u64,
    #[serde(default)]
    pub upstream: Vec<LineageRef>,
    #[serde(default)]
    pub downstream: Vec<LineageRef>,
    #[serde(default)]
    pub access_count: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_accessed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default = "default_created_by")]
    pub created_by: String,
}

impl Dataset {
    pub fn get_column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }

    pub fn primary_keys(&self) -> Vec<&str> {
        self.columns
            .iter()
            .filter(|c| c.is_primary_key)
            .map(|c| c.name.as_str())
            .collect()
    }
}

/// Catalog-wide counters.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CatalogStatistics {
    pub total_datasets: u64,
    pub active_datasets: u64,
    pub by_type: BTreeMap<String, u64>,
    pub by_status: BTreeMap<String, u64>,
    pub total_columns: u64,
    pub total_tags: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_quality_weights_sum_to_one() {
        let perfect = QualityMetrics {
            completeness: 1.0,
            accuracy: 1.0,
            consistency: 1.0,
            timeliness: 1.0,
            uniqueness: 1.0,
            validity: 1.0,
            ..Default::default()
        };
        assert_eq!(perfect.calculate_overall(), 1.0);
    }

    #[test]
    fn test_quality_weighted_overall() {
        let metrics = QualityMetrics {
            completeness: 1.0, // 0.20
            accuracy: 0.8,     // 0.20
            consistency: 0.0,
            timeliness: 1.0, // 0.10
            uniqueness: 0.0,
            validity: 1.0, // 0.15
            ..Default::default()
        };
        assert_eq!(metrics.calculate_overall(), 0.65);
    }

    #[test]
    fn test_column_type_of_value() {
        assert_eq!(ColumnType::of_value(&json!("x")), ColumnType::String);
        assert_eq!(ColumnType::of_value(&json!(1)), ColumnType::Integer);
        assert_eq!(ColumnType::of_value(&json!(1.5)), ColumnType::Float);
        assert_eq!(ColumnType::of_value(&json!(true)), ColumnType::Boolean);
        assert_eq!(ColumnType::of_value(&json!([1])), ColumnType::Array);
        assert_eq!(ColumnType::of_value(&json!({})), ColumnType::Object);
        assert_eq!(ColumnType::of_value(&Value::Null), ColumnType::Unknown);
    }

    #[test]
    fn test_primary_key_builder_clears_nullable() {
        let id = Column::new("_id", ColumnType::String).primary_key();
        assert!(id.is_primary_key);
        assert!(!id.nullable);
    }

    #[test]
    fn test_dataset_serde_roundtrip() {
        let dataset = Dataset {
            id: Some(IdRef::generate()),
            name: "news_articles".into(),
            display_name: "News Articles".into(),
            description: String::new(),
            dataset_type: DatasetType::Final,
            status: DatasetStatus::Active,
            collection_name: "news_articles".into(),
            domain: "news".into(),
            subdomain: String::new(),
            columns: vec![Column::new("_id", ColumnType::String).primary_key()],
            tags: vec!["verified".into()],
            quality: None,
            record_count: 12,
            upstream: vec![],
            downstream: vec![],
            access_count: 0,
            last_accessed_at: None,
            created_at: Utc::now(),
            updated_at: None,
            created_by: "system".into(),
        };

        let doc = serde_json::to_value(&dataset).unwrap();
        assert_eq!(doc["dataset_type"], "final");
        assert_eq!(doc["status"], "active");

        let back: Dataset = serde_json::from_value(doc).unwrap();
        assert_eq!(back.primary_keys(), vec!["_id"]);
    }
}
