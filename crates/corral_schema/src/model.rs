//! Schema value types.
//!
//! A [`Schema`] is an ordered list of [`FieldSchema`]s plus descriptive
//! metadata. A [`SchemaVersion`] is an immutable snapshot stored by the
//! registry; its fingerprint is derived from the schema content (metadata
//! excluded) and is the dedup key for registrations.

use chrono::{DateTime, Utc};
use corral_protocol::{CoreError, CoreResult};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use std::fmt;

/// Compatibility contract applied when registering a new schema version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompatibilityMode {
    /// No checking
    None,
    /// New schema can read data written under the old schema
    #[default]
    Backward,
    /// Old schema can read data written under the new schema
    Forward,
    /// Both directions
    Full,
    BackwardTransitive,
    ForwardTransitive,
    FullTransitive,
}

impl CompatibilityMode {
    pub fn is_backward_family(&self) -> bool {
        matches!(
            self,
            CompatibilityMode::Backward
                | CompatibilityMode::Full
                | CompatibilityMode::BackwardTransitive
                | CompatibilityMode::FullTransitive
        )
    }

    pub fn is_forward_family(&self) -> bool {
        matches!(
            self,
            CompatibilityMode::Forward
                | CompatibilityMode::Full
                | CompatibilityMode::ForwardTransitive
                | CompatibilityMode::FullTransitive
        )
    }

    /// Transitive modes are evaluated against every prior active version.
    pub fn is_transitive(&self) -> bool {
        matches!(
            self,
            CompatibilityMode::BackwardTransitive
                | CompatibilityMode::ForwardTransitive
                | CompatibilityMode::FullTransitive
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CompatibilityMode::None => "none",
            CompatibilityMode::Backward => "backward",
            CompatibilityMode::Forward => "forward",
            CompatibilityMode::Full => "full",
            CompatibilityMode::BackwardTransitive => "backward_transitive",
            CompatibilityMode::ForwardTransitive => "forward_transitive",
            CompatibilityMode::FullTransitive => "full_transitive",
        }
    }
}

impl fmt::Display for CompatibilityMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Field data type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    String,
    Integer,
    Float,
    Boolean,
    Date,
    #[serde(rename = "datetime")]
    DateTime,
    Array,
    Object,
    Any,
}

impl FieldType {
    /// Infer the type of a JSON value. Booleans test before integers.
    pub fn of_value(value: &Value) -> Self {
        match value {
            Value::Null => FieldType::Any,
            Value::Bool(_) => FieldType::Boolean,
            Value::Number(n) => {
                if n.is_i64() || n.is_u64() {
                    FieldType::Integer
                } else {
                    FieldType::Float
                }
            }
            Value::String(_) => FieldType::String,
            Value::Array(_) => FieldType::Array,
            Value::Object(_) => FieldType::Object,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FieldType::String => "string",
            FieldType::Integer => "integer",
            FieldType::Float => "float",
            FieldType::Boolean => "boolean",
            FieldType::Date => "date",
            FieldType::DateTime => "datetime",
            FieldType::Array => "array",
            FieldType::Object => "object",
            FieldType::Any => "any",
        }
    }

    /// Parse loose type names, including the aliases source hints use.
    pub fn parse_hint(raw: &str) -> Option<Self> {
        match raw.to_lowercase().as_str() {
            "string" | "str" | "text" => Some(FieldType::String),
            "integer" | "int" => Some(FieldType::Integer),
            "float" | "number" | "double" => Some(FieldType::Float),
            "boolean" | "bool" => Some(FieldType::Boolean),
            "date" => Some(FieldType::Date),
            "datetime" | "timestamp" => Some(FieldType::DateTime),
            "array" | "list" => Some(FieldType::Array),
            "object" | "dict" | "map" => Some(FieldType::Object),
            "any" => Some(FieldType::Any),
            _ => None,
        }
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Data categories shared with the ETL side; each carries a template schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataCategory {
    NewsArticle,
    FinancialData,
    MarketIndex,
    ExchangeRate,
    StockPrice,
    Announcement,
    TableData,
    Generic,
}

impl DataCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            DataCategory::NewsArticle => "news_article",
            DataCategory::FinancialData => "financial_data",
            DataCategory::MarketIndex => "market_index",
            DataCategory::ExchangeRate => "exchange_rate",
            DataCategory::StockPrice => "stock_price",
            DataCategory::Announcement => "announcement",
            DataCategory::TableData => "table_data",
            DataCategory::Generic => "generic",
        }
    }

    /// Field names whose presence suggests this category.
    pub fn indicator_fields(&self) -> &'static [&'static str] {
        match self {
            DataCategory::NewsArticle => &["title", "content", "published_at", "summary"],
            DataCategory::StockPrice => &["stock_code", "price", "volume", "high", "low"],
            DataCategory::ExchangeRate => &["currency_code", "base_rate", "buy_rate", "sell_rate"],
            DataCategory::MarketIndex => &["index_code", "value", "change_rate"],
            DataCategory::Announcement => &["announcement_type", "company_name", "stock_code"],
            DataCategory::FinancialData => &["price", "change", "volume", "change_rate"],
            DataCategory::TableData => &["table_name", "headers", "rows"],
            DataCategory::Generic => &[],
        }
    }
}

impl fmt::Display for DataCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Schema of one document field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldSchema {
    pub name: String,

    #[serde(rename = "type")]
    pub field_type: FieldType,

    #[serde(default)]
    pub required: bool,

    #[serde(default = "default_true")]
    pub nullable: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_value: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_value: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_length: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_length: Option<u64>,

    #[serde(rename = "enum", default, skip_serializing_if = "Option::is_none")]
    pub enum_values: Option<Vec<Value>>,

    /// Nested schema for object/array fields
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nested_schema: Option<Box<Schema>>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub examples: Vec<Value>,

    #[serde(default, skip_serializing_if = "is_false")]
    pub deprecated: bool,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub deprecated_message: String,
}

fn default_true() -> bool {
    true
}

fn is_false(b: &bool) -> bool {
    !*b
}

impl FieldSchema {
    pub fn new(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            required: false,
            nullable: true,
            default: None,
            description: String::new(),
            pattern: None,
            min_value: None,
            max_value: None,
            min_length: None,
            max_length: None,
            enum_values: None,
            nested_schema: None,
            examples: Vec::new(),
            deprecated: false,
            deprecated_message: String::new(),
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn with_default(mut self, default: Value) -> Self {
        self.default = Some(default);
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.pattern = Some(pattern.into());
        self
    }

    pub fn with_max_length(mut self, max_length: u64) -> Self {
        self.max_length = Some(max_length);
        self
    }
}

/// Full schema of one source or collection.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Schema {
    #[serde(default)]
    pub fields: Vec<FieldSchema>,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_category: Option<DataCategory>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub collection_name: Option<String>,

    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metadata: Map<String, Value>,
}

impl Schema {
    pub fn new(fields: Vec<FieldSchema>) -> Self {
        Self {
            fields,
            ..Default::default()
        }
    }

    pub fn get_field(&self, name: &str) -> Option<&FieldSchema> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn field_names(&self) -> BTreeSet<&str> {
        self.fields.iter().map(|f| f.name.as_str()).collect()
    }

    pub fn required_field_names(&self) -> BTreeSet<&str> {
        self.fields
            .iter()
            .filter(|f| f.required)
            .map(|f| f.name.as_str())
            .collect()
    }

    /// Append a field; rejects duplicate names.
    pub fn add_field(&mut self, field: FieldSchema) -> CoreResult<()> {
        if self.get_field(&field.name).is_some() {
            return Err(CoreError::DuplicateField(field.name));
        }
        self.fields.push(field);
        Ok(())
    }

    /// Remove a field by name. Returns whether anything was removed.
    pub fn remove_field(&mut self, name: &str) -> bool {
        let before = self.fields.len();
        self.fields.retain(|f| f.name != name);
        self.fields.len() != before
    }

    /// First 16 hex chars of SHA-256 over the canonical JSON form, with
    /// `metadata` excluded and object keys sorted. Field order is part of
    /// the canonical form.
    pub fn compute_fingerprint(&self) -> String {
        let mut value = serde_json::to_value(self).unwrap_or(Value::Null);
        if let Some(map) = value.as_object_mut() {
            map.remove("metadata");
        }
        let canonical = canonical_json(&value);
        let digest = Sha256::digest(canonical.as_bytes());
        let mut out = String::with_capacity(16);
        for byte in digest.iter().take(8) {
            out.push_str(&format!("{:02x}", byte));
        }
        out
    }
}

/// Serialize with object keys sorted at every level.
fn canonical_json(value: &Value) -> String {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let inner: Vec<String> = keys
                .into_iter()
                .map(|k| {
                    format!(
                        "{}:{}",
                        serde_json::to_string(k).unwrap_or_default(),
                        canonical_json(&map[k])
                    )
                })
                .collect();
            format!("{{{}}}", inner.join(","))
        }
        Value::Array(items) => {
            let inner: Vec<String> = items.iter().map(canonical_json).collect();
            format!("[{}]", inner.join(","))
        }
        other => serde_json::to_string(other).unwrap_or_default(),
    }
}

/// One immutable schema snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchemaVersion {
    pub version: u32,
    pub schema: Schema,
    pub fingerprint: String,
    pub created_at: DateTime<Utc>,

    #[serde(default = "default_created_by")]
    pub created_by: String,

    #[serde(default)]
    pub change_description: String,

    #[serde(default = "default_true")]
    pub is_active: bool,

    #[serde(default)]
    pub compatibility_mode: CompatibilityMode,

    #[serde(default)]
    pub tags: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deprecated_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deprecated_reason: Option<String>,
}

fn default_created_by() -> String {
    "system".to_string()
}

/// Severity of one compatibility issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueSeverity {
    Info,
    Warning,
    Error,
}

/// One finding from a compatibility check.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompatibilityIssue {
    pub field_name: String,
    pub issue_type: String,
    pub severity: IssueSeverity,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old_value: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_value: Option<Value>,
}

impl CompatibilityIssue {
    pub fn is_error(&self) -> bool {
        self.severity == IssueSeverity::Error
    }

    pub fn is_warning(&self) -> bool {
        self.severity == IssueSeverity::Warning
    }
}

/// Full result of a compatibility check.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompatibilityResult {
    pub is_compatible: bool,
    pub issues: Vec<CompatibilityIssue>,
    pub mode: CompatibilityMode,
    pub checked_at: DateTime<Utc>,
}

impl CompatibilityResult {
    pub fn compatible(mode: CompatibilityMode) -> Self {
        Self {
            is_compatible: true,
            issues: Vec::new(),
            mode,
            checked_at: Utc::now(),
        }
    }

    pub fn errors(&self) -> Vec<&CompatibilityIssue> {
        self.issues.iter().filter(|i| i.is_error()).collect()
    }

    pub fn warnings(&self) -> Vec<&CompatibilityIssue> {
        self.issues.iter().filter(|i| i.is_warning()).collect()
    }
}

/// Template schema for a data category.
pub fn default_schema(category: DataCategory) -> Schema {
    use FieldType::*;

    let fields = match category {
        DataCategory::NewsArticle => vec![
            FieldSchema::new("title", String).required(),
            FieldSchema::new("content", String),
            FieldSchema::new("summary", String),
            FieldSchema::new("url", String).with_pattern("^https?://"),
            FieldSchema::new("published_at", DateTime),
            FieldSchema::new("source", String),
            FieldSchema::new("author", String),
            FieldSchema::new("category", String),
            FieldSchema::new("tags", Array),
            FieldSchema::new("content_hash", String),
        ],
        DataCategory::FinancialData => vec![
            FieldSchema::new("name", String).required(),
            FieldSchema::new("code", String),
            FieldSchema::new("price", Float),
            FieldSchema::new("change", Float),
            FieldSchema::new("change_rate", Float),
            FieldSchema::new("volume", Integer),
            FieldSchema::new("trade_date", Date),
        ],
        DataCategory::StockPrice => vec![
            FieldSchema::new("stock_code", String).required(),
            FieldSchema::new("name", String),
            FieldSchema::new("price", Float).required(),
            FieldSchema::new("open", Float),
            FieldSchema::new("high", Float),
            FieldSchema::new("low", Float),
            FieldSchema::new("close", Float),
            FieldSchema::new("volume", Integer),
            FieldSchema::new("change", Float),
            FieldSchema::new("change_rate", Float),
            FieldSchema::new("market_cap", Float),
            FieldSchema::new("trade_date", Date),
        ],
        DataCategory::ExchangeRate => vec![
            FieldSchema::new("currency_code", String).required().with_max_length(3),
            FieldSchema::new("currency_name", String),
            FieldSchema::new("base_rate", Float),
            FieldSchema::new("buy_rate", Float),
            FieldSchema::new("sell_rate", Float),
            FieldSchema::new("change", Float),
            FieldSchema::new("change_rate", Float),
            FieldSchema::new("trade_date", Date),
        ],
        DataCategory::MarketIndex => vec![
            FieldSchema::new("index_code", String).required(),
            FieldSchema::new("name", String),
            FieldSchema::new("value", Float),
            FieldSchema::new("change", Float),
            FieldSchema::new("change_rate", Float),
            FieldSchema::new("open", Float),
            FieldSchema::new("high", Float),
            FieldSchema::new("low", Float),
            FieldSchema::new("volume", Integer),
            FieldSchema::new("trade_date", Date),
        ],
        DataCategory::Announcement => vec![
            FieldSchema::new("title", String).required(),
            FieldSchema::new("content", String),
            FieldSchema::new("company_name", String),
            FieldSchema::new("stock_code", String),
            FieldSchema::new("announcement_type", String),
            FieldSchema::new("published_at", DateTime),
            FieldSchema::new("url", String),
            FieldSchema::new("content_hash", String),
        ],
        DataCategory::TableData => vec![
            FieldSchema::new("table_name", String),
            FieldSchema::new("headers", Array),
            FieldSchema::new("rows", Array),
            FieldSchema::new("extracted_at", DateTime),
        ],
        DataCategory::Generic => vec![FieldSchema::new("data", Object)],
    };

    Schema {
        fields,
        description: format!("Template schema for {category} data"),
        data_category: Some(category),
        collection_name: Some(
            match category {
                DataCategory::NewsArticle => "news_articles",
                DataCategory::FinancialData => "financial_data",
                DataCategory::StockPrice => "stock_prices",
                DataCategory::ExchangeRate => "exchange_rates",
                DataCategory::MarketIndex => "market_indices",
                DataCategory::Announcement => "announcements",
                DataCategory::TableData => "table_data",
                DataCategory::Generic => "crawl_data",
            }
            .to_string(),
        ),
        metadata: Map::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn simple_schema() -> Schema {
        Schema::new(vec![
            FieldSchema::new("title", FieldType::String).required(),
            FieldSchema::new("content", FieldType::String),
        ])
    }

    #[test]
    fn test_fingerprint_stable_across_clone() {
        let schema = simple_schema();
        assert_eq!(
            schema.compute_fingerprint(),
            schema.clone().compute_fingerprint()
        );
        assert_eq!(schema.compute_fingerprint().len(), 16);
    }

    #[test]
    fn test_fingerprint_ignores_metadata() {
        let mut a = simple_schema();
        let mut b = simple_schema();
        a.metadata.insert("detected_at".into(), json!("2026-01-01"));
        b.metadata.insert("detected_at".into(), json!("2026-02-02"));
        assert_eq!(a.compute_fingerprint(), b.compute_fingerprint());
    }

    #[test]
    fn test_fingerprint_sensitive_to_field_order() {
        let a = Schema::new(vec![
            FieldSchema::new("a", FieldType::String),
            FieldSchema::new("b", FieldType::String),
        ]);
        let b = Schema::new(vec![
            FieldSchema::new("b", FieldType::String),
            FieldSchema::new("a", FieldType::String),
        ]);
        assert_ne!(a.compute_fingerprint(), b.compute_fingerprint());
    }

    #[test]
    fn test_add_field_rejects_duplicates() {
        let mut schema = simple_schema();
        let err = schema
            .add_field(FieldSchema::new("title", FieldType::String))
            .unwrap_err();
        assert!(matches!(
            err,
            corral_protocol::CoreError::DuplicateField(_)
        ));
    }

    #[test]
    fn test_remove_field() {
        let mut schema = simple_schema();
        assert!(schema.remove_field("content"));
        assert!(!schema.remove_field("content"));
        assert!(schema.get_field("content").is_none());
    }

    #[test]
    fn test_type_of_value_bool_before_int() {
        assert_eq!(FieldType::of_value(&json!(true)), FieldType::Boolean);
        assert_eq!(FieldType::of_value(&json!(1)), FieldType::Integer);
        assert_eq!(FieldType::of_value(&json!(1.5)), FieldType::Float);
        assert_eq!(FieldType::of_value(&json!(null)), FieldType::Any);
    }

    #[test]
    fn test_schema_version_serde_roundtrip() {
        let version = SchemaVersion {
            version: 3,
            schema: simple_schema(),
            fingerprint: simple_schema().compute_fingerprint(),
            created_at: Utc::now(),
            created_by: "ops".into(),
            change_description: "added summary".into(),
            is_active: true,
            compatibility_mode: CompatibilityMode::Backward,
            tags: vec!["news".into()],
            deprecated_at: None,
            deprecated_reason: None,
        };
        let doc = serde_json::to_value(&version).unwrap();
        let back: SchemaVersion = serde_json::from_value(doc).unwrap();
        assert_eq!(back.version, 3);
        assert_eq!(back.schema.fields.len(), 2);
        assert_eq!(back.compatibility_mode, CompatibilityMode::Backward);
    }

    #[test]
    fn test_default_schema_templates() {
        let news = default_schema(DataCategory::NewsArticle);
        assert!(news.get_field("title").unwrap().required);
        assert_eq!(news.collection_name.as_deref(), Some("news_articles"));

        let fx = default_schema(DataCategory::ExchangeRate);
        assert_eq!(fx.get_field("currency_code").unwrap().max_length, Some(3));
    }
}
