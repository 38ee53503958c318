//! Schema inference from sampled records.
//!
//! Collects per-field statistics over a bounded sample, sub-classifies
//! strings (dates, numbers, well-known patterns), then promotes the stats
//! into [`FieldSchema`]s. Meta fields (leading underscore) are skipped.

use chrono::Utc;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, HashMap, HashSet};

use crate::model::{DataCategory, FieldSchema, FieldType, Schema};

/// Anchored date patterns with their format hints.
static DATE_PATTERNS: Lazy<Vec<(Regex, &'static str)>> = Lazy::new(|| {
    [
        (r"^\d{4}-\d{2}-\d{2}$", "%Y-%m-%d"),
        (r"^\d{4}/\d{2}/\d{2}$", "%Y/%m/%d"),
        (r"^\d{2}-\d{2}-\d{4}$", "%d-%m-%Y"),
        (r"^\d{2}/\d{2}/\d{4}$", "%d/%m/%Y"),
        (r"^\d{4}\.\d{2}\.\d{2}$", "%Y.%m.%d"),
        (r"^\d{4}년\s*\d{1,2}월\s*\d{1,2}일$", "%Y년 %m월 %d일"),
    ]
    .into_iter()
    .map(|(pattern, hint)| (Regex::new(pattern).expect("static pattern"), hint))
    .collect()
});

static DATETIME_PATTERNS: Lazy<Vec<(Regex, &'static str)>> = Lazy::new(|| {
    [
        (r"^\d{4}-\d{2}-\d{2}T\d{2}:\d{2}:\d{2}Z$", "%Y-%m-%dT%H:%M:%SZ"),
        (r"^\d{4}-\d{2}-\d{2}T\d{2}:\d{2}:\d{2}\.\d+", "%Y-%m-%dT%H:%M:%S%.f"),
        (r"^\d{4}-\d{2}-\d{2}T\d{2}:\d{2}:\d{2}", "%Y-%m-%dT%H:%M:%S"),
        (r"^\d{4}-\d{2}-\d{2} \d{2}:\d{2}:\d{2}", "%Y-%m-%d %H:%M:%S"),
        (r"^\d{4}/\d{2}/\d{2} \d{2}:\d{2}:\d{2}", "%Y/%m/%d %H:%M:%S"),
    ]
    .into_iter()
    .map(|(pattern, hint)| (Regex::new(pattern).expect("static pattern"), hint))
    .collect()
});

/// Named special patterns recognized in string values.
static SPECIAL_PATTERNS: Lazy<Vec<(&'static str, Regex)>> = Lazy::new(|| {
    [
        ("email", r"^[\w\.-]+@[\w\.-]+\.\w+$"),
        ("url", r"^https?://[\w\.-]+"),
        ("phone_kr", r"^0\d{1,2}-\d{3,4}-\d{4}$"),
        (
            "phone_intl",
            r"^\+\d{1,3}[\s-]?\d{1,4}[\s-]?\d{1,4}[\s-]?\d{1,4}$",
        ),
        (
            "uuid",
            r"^[a-f0-9]{8}-[a-f0-9]{4}-[a-f0-9]{4}-[a-f0-9]{4}-[a-f0-9]{12}$",
        ),
        ("ip_address", r"^\d{1,3}\.\d{1,3}\.\d{1,3}\.\d{1,3}$"),
        ("korean_name", r"^[가-힣]{2,5}$"),
        ("stock_code_kr", r"^\d{6}$"),
        ("currency_code", r"^[A-Z]{3}$"),
    ]
    .into_iter()
    .map(|(name, pattern)| (name, Regex::new(pattern).expect("static pattern")))
    .collect()
});

/// Pattern source for a detected pattern name.
pub fn special_pattern(name: &str) -> Option<&'static str> {
    SPECIAL_PATTERNS
        .iter()
        .find(|(n, _)| *n == name)
        .map(|(_, re)| re.as_str())
}

const UNIQUE_VALUE_CAP: usize = 10_000;
const SAMPLE_VALUE_CAP: usize = 10;

/// Statistics gathered for one observed field.
#[derive(Debug, Clone)]
pub struct FieldStats {
    pub name: String,
    pub total_count: u64,
    pub null_count: u64,
    pub empty_count: u64,
    pub type_counts: HashMap<String, u64>,
    pub unique_values: HashSet<String>,
    pub min_length: Option<u64>,
    pub max_length: Option<u64>,
    pub min_value: Option<f64>,
    pub max_value: Option<f64>,
    pub sample_values: Vec<Value>,
    pub detected_patterns: HashMap<String, u64>,
}

impl FieldStats {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            total_count: 0,
            null_count: 0,
            empty_count: 0,
            type_counts: HashMap::new(),
            unique_values: HashSet::new(),
            min_length: None,
            max_length: None,
            min_value: None,
            max_value: None,
            sample_values: Vec::new(),
            detected_patterns: HashMap::new(),
        }
    }

    pub fn null_rate(&self) -> f64 {
        if self.total_count == 0 {
            return 0.0;
        }
        self.null_count as f64 / self.total_count as f64
    }

    pub fn empty_rate(&self) -> f64 {
        if self.total_count == 0 {
            return 0.0;
        }
        (self.null_count + self.empty_count) as f64 / self.total_count as f64
    }

    pub fn unique_rate(&self) -> f64 {
        let non_null = self
            .total_count
            .saturating_sub(self.null_count + self.empty_count);
        if non_null == 0 {
            return 0.0;
        }
        self.unique_values.len() as f64 / non_null as f64
    }

    /// Most frequent observed type name; string when nothing observed.
    pub fn dominant_type(&self) -> &str {
        self.type_counts
            .iter()
            .max_by(|a, b| a.1.cmp(b.1).then(b.0.cmp(a.0)))
            .map(|(name, _)| name.as_str())
            .unwrap_or("string")
    }

    pub fn is_likely_id(&self) -> bool {
        self.unique_rate() > 0.95 && self.null_rate() < 0.01
    }

    pub fn to_report(&self) -> Value {
        json!({
            "name": self.name,
            "total_count": self.total_count,
            "null_rate": self.null_rate(),
            "empty_rate": self.empty_rate(),
            "unique_rate": self.unique_rate(),
            "dominant_type": self.dominant_type(),
            "type_distribution": self.type_counts,
            "detected_patterns": self.detected_patterns,
            "min_length": self.min_length,
            "max_length": self.max_length,
            "min_value": self.min_value,
            "max_value": self.max_value,
            "sample_values": self.sample_values.iter().take(5).collect::<Vec<_>>(),
        })
    }
}

/// Statistical schema detector.
#[derive(Debug, Clone)]
pub struct SchemaDetector {
    /// Records analyzed at most
    pub sample_size: usize,
    /// Non-null rate at which a field is considered required
    pub required_threshold: f64,
    /// Unique rate at which a field is considered an identifier
    pub unique_threshold: f64,
    /// Share of non-null values a pattern must cover to be recorded
    pub pattern_threshold: f64,
}

impl Default for SchemaDetector {
    fn default() -> Self {
        Self {
            sample_size: 1000,
            required_threshold: 0.95,
            unique_threshold: 0.99,
            pattern_threshold: 0.8,
        }
    }
}

impl SchemaDetector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Infer a schema from records, honoring source-declared field hints.
    pub fn detect_from_data(
        &self,
        data: &[Value],
        source_fields: Option<&[Value]>,
        data_category: Option<DataCategory>,
    ) -> Schema {
        if data.is_empty() {
            return Schema {
                data_category,
                ..Default::default()
            };
        }

        let sample = &data[..data.len().min(self.sample_size)];
        let stats = self.collect_stats(sample);

        let mut hints: HashMap<String, &Value> = HashMap::new();
        if let Some(source_fields) = source_fields {
            for hint in source_fields {
                let name = hint
                    .get("name")
                    .or_else(|| hint.get("field_name"))
                    .and_then(Value::as_str);
                if let Some(name) = name {
                    hints.insert(name.to_string(), hint);
                }
            }
        }

        let mut fields: Vec<FieldSchema> = stats
            .values()
            .filter(|s| !s.name.starts_with('_'))
            .map(|s| self.promote(s, hints.get(&s.name).copied()))
            .collect();
        fields.sort_by(|a, b| a.name.cmp(&b.name));

        let mut metadata = Map::new();
        metadata.insert("detected_at".into(), json!(Utc::now().to_rfc3339()));
        metadata.insert("sample_size".into(), json!(sample.len()));
        metadata.insert("total_records".into(), json!(data.len()));
        metadata.insert("detection_method".into(), json!("statistical"));

        Schema {
            fields,
            description: String::new(),
            data_category,
            collection_name: None,
            metadata,
        }
    }

    /// Guess the data category from the first record's field set.
    pub fn detect_category(&self, data: &[Value]) -> Option<DataCategory> {
        let first = data.first()?.as_object()?;
        let fields: HashSet<&str> = first.keys().map(String::as_str).collect();

        let candidates = [
            DataCategory::NewsArticle,
            DataCategory::StockPrice,
            DataCategory::ExchangeRate,
            DataCategory::MarketIndex,
            DataCategory::Announcement,
            DataCategory::FinancialData,
        ];

        let mut best: Option<(DataCategory, f64)> = None;
        for category in candidates {
            let indicators = category.indicator_fields();
            if indicators.is_empty() {
                continue;
            }
            let overlap = indicators.iter().filter(|f| fields.contains(**f)).count();
            let score = overlap as f64 / indicators.len() as f64;
            if best.map(|(_, s)| score > s).unwrap_or(true) {
                best = Some((category, score));
            }
        }

        match best {
            Some((category, score)) if score >= 0.3 => Some(category),
            _ => Some(DataCategory::Generic),
        }
    }

    /// Gather statistics for a single named field.
    pub fn analyze_field(&self, name: &str, values: &[Value]) -> FieldStats {
        let mut stats = FieldStats::new(name);
        for value in values {
            stats.total_count += 1;
            self.observe(value, &mut stats);
        }
        stats
    }

    /// Diff an expected schema against a detected one.
    pub fn compare_schemas(&self, expected: &Schema, actual: &Schema) -> Value {
        let expected_names = expected.field_names();
        let actual_names = actual.field_names();

        let matched: Vec<&&str> = expected_names.intersection(&actual_names).collect();
        let mut type_mismatches = Vec::new();
        for name in &matched {
            let exp = expected.get_field(name).expect("matched");
            let act = actual.get_field(name).expect("matched");
            if exp.field_type != act.field_type {
                type_mismatches.push(json!({
                    "field": name,
                    "expected": exp.field_type.as_str(),
                    "actual": act.field_type.as_str(),
                }));
            }
        }

        let match_rate = if expected_names.is_empty() {
            1.0
        } else {
            matched.len() as f64 / expected_names.len() as f64
        };

        json!({
            "matched_fields": matched,
            "missing_fields": expected_names.difference(&actual_names).collect::<Vec<_>>(),
            "extra_fields": actual_names.difference(&expected_names).collect::<Vec<_>>(),
            "type_mismatches": type_mismatches,
            "match_rate": match_rate,
        })
    }

    /// Analysis report for a dataset: summary, per-field stats, schema.
    pub fn generate_report(&self, data: &[Value]) -> Value {
        let sample = &data[..data.len().min(self.sample_size)];
        let stats = self.collect_stats(sample);

        let fields: BTreeMap<String, Value> = stats
            .iter()
            .filter(|(name, _)| !name.starts_with('_'))
            .map(|(name, s)| (name.clone(), s.to_report()))
            .collect();

        json!({
            "summary": {
                "total_records": data.len(),
                "analyzed_records": sample.len(),
                "total_fields": stats.len(),
                "detected_category": self.detect_category(data).map(|c| c.as_str()),
            },
            "fields": fields,
            "detected_schema": serde_json::to_value(self.detect_from_data(data, None, None)).unwrap_or(Value::Null),
            "generated_at": Utc::now().to_rfc3339(),
        })
    }

    fn collect_stats(&self, sample: &[Value]) -> BTreeMap<String, FieldStats> {
        let mut stats: BTreeMap<String, FieldStats> = BTreeMap::new();

        for record in sample {
            let Some(map) = record.as_object() else {
                continue;
            };
            for (name, value) in map {
                let entry = stats
                    .entry(name.clone())
                    .or_insert_with(|| FieldStats::new(name.clone()));
                entry.total_count += 1;
                self.observe(value, entry);
            }
        }
        stats
    }

    fn observe(&self, value: &Value, stats: &mut FieldStats) {
        if value.is_null() {
            stats.null_count += 1;
            return;
        }
        if let Some(text) = value.as_str() {
            if text.trim().is_empty() {
                stats.empty_count += 1;
                return;
            }
        }

        let detected = detect_value_type(value);
        *stats.type_counts.entry(detected.to_string()).or_insert(0) += 1;

        if let Some(text) = value.as_str() {
            let len = text.chars().count() as u64;
            stats.min_length = Some(stats.min_length.map_or(len, |m| m.min(len)));
            stats.max_length = Some(stats.max_length.map_or(len, |m| m.max(len)));

            for (pattern_name, regex) in SPECIAL_PATTERNS.iter() {
                if regex.is_match(text) {
                    *stats
                        .detected_patterns
                        .entry(pattern_name.to_string())
                        .or_insert(0) += 1;
                }
            }
        }

        if let Some(n) = value.as_f64() {
            if !value.is_boolean() {
                stats.min_value = Some(stats.min_value.map_or(n, |m| m.min(n)));
                stats.max_value = Some(stats.max_value.map_or(n, |m| m.max(n)));
            }
        }

        if stats.unique_values.len() < UNIQUE_VALUE_CAP {
            let key: String = value.to_string().chars().take(100).collect();
            stats.unique_values.insert(key);
        }

        if stats.sample_values.len() < SAMPLE_VALUE_CAP {
            stats.sample_values.push(value.clone());
        }
    }

    fn promote(&self, stats: &FieldStats, hint: Option<&Value>) -> FieldSchema {
        let hint_type = hint
            .and_then(|h| h.get("data_type").or_else(|| h.get("type")))
            .and_then(Value::as_str)
            .and_then(FieldType::parse_hint);

        let field_type = hint_type.unwrap_or_else(|| {
            match stats.dominant_type() {
                "integer" => FieldType::Integer,
                "float" => FieldType::Float,
                "boolean" => FieldType::Boolean,
                "date" => FieldType::Date,
                "datetime" => FieldType::DateTime,
                "array" => FieldType::Array,
                "object" => FieldType::Object,
                _ => FieldType::String,
            }
        });

        let non_null_rate = 1.0 - stats.null_rate();
        let mut required = non_null_rate >= self.required_threshold;
        if let Some(hint_required) = hint.and_then(|h| h.get("required")).and_then(Value::as_bool) {
            required = hint_required;
        }

        // Dominant pattern, recorded only with strong coverage
        let mut pattern = None;
        let mut description = hint
            .and_then(|h| h.get("description"))
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        if let Some((name, count)) = stats
            .detected_patterns
            .iter()
            .max_by(|a, b| a.1.cmp(b.1).then(b.0.cmp(a.0)))
        {
            if (*count as f64) > stats.total_count as f64 * self.pattern_threshold {
                pattern = special_pattern(name).map(str::to_string);
            }
            if description.is_empty() {
                description = format!("Detected pattern: {name}");
            }
        }

        let numeric = matches!(field_type, FieldType::Integer | FieldType::Float);
        let stringy = field_type == FieldType::String;

        FieldSchema {
            name: stats.name.clone(),
            field_type,
            required,
            nullable: stats.null_count > 0,
            default: None,
            description,
            pattern,
            min_value: if numeric { stats.min_value } else { None },
            max_value: if numeric { stats.max_value } else { None },
            min_length: if stringy { stats.min_length } else { None },
            max_length: if stringy { stats.max_length } else { None },
            enum_values: None,
            nested_schema: None,
            examples: stats.sample_values.iter().take(3).cloned().collect(),
            deprecated: false,
            deprecated_message: String::new(),
        }
    }
}

/// Detect the fine-grained type name of a value; strings are
/// sub-classified into dates, numbers, and booleans.
pub fn detect_value_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(n) => {
            if n.is_i64() || n.is_u64() {
                "integer"
            } else {
                "float"
            }
        }
        Value::Array(_) => "array",
        Value::Object(_) => "object",
        Value::String(s) => {
            let trimmed = s.trim();
            if is_datetime_string(trimmed) {
                "datetime"
            } else if is_date_string(trimmed) {
                "date"
            } else if is_integer_string(trimmed) {
                "integer"
            } else if is_float_string(trimmed) {
                "float"
            } else if matches!(
                trimmed.to_lowercase().as_str(),
                "true" | "false" | "yes" | "no" | "1" | "0"
            ) {
                "boolean"
            } else {
                "string"
            }
        }
    }
}

/// Integer strings never contain a decimal point or an exponent marker.
/// `"1e3"` therefore classifies as float, not integer.
pub fn is_integer_string(s: &str) -> bool {
    if s.contains('.') || s.contains('e') || s.contains('E') {
        return false;
    }
    s.parse::<i64>().is_ok()
}

pub fn is_float_string(s: &str) -> bool {
    s.parse::<f64>().is_ok()
}

pub fn is_date_string(s: &str) -> bool {
    DATE_PATTERNS.iter().any(|(re, _)| re.is_match(s))
}

pub fn is_datetime_string(s: &str) -> bool {
    DATETIME_PATTERNS.iter().any(|(re, _)| re.is_match(s))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_string_subclassification() {
        assert_eq!(detect_value_type(&json!("2024-01-15")), "date");
        assert_eq!(detect_value_type(&json!("2024-01-15T10:30:00Z")), "datetime");
        assert_eq!(detect_value_type(&json!("2024-01-15 10:30:00")), "datetime");
        assert_eq!(detect_value_type(&json!("42")), "integer");
        assert_eq!(detect_value_type(&json!("-7")), "integer");
        assert_eq!(detect_value_type(&json!("3.14")), "float");
        assert_eq!(detect_value_type(&json!("true")), "boolean");
        assert_eq!(detect_value_type(&json!("hello")), "string");
    }

    #[test]
    fn test_integer_string_rejects_exponent() {
        // "1e3" parses as a float but never as an integer string
        assert!(!is_integer_string("1e3"));
        assert!(is_float_string("1e3"));
        assert!(!is_integer_string("1.0"));
        assert!(is_integer_string("123"));
    }

    #[test]
    fn test_bool_before_int() {
        assert_eq!(detect_value_type(&json!(true)), "boolean");
        assert_eq!(detect_value_type(&json!(1)), "integer");
    }

    #[test]
    fn test_detect_required_and_nullable() {
        let detector = SchemaDetector::new();
        let mut data: Vec<Value> = (0..100)
            .map(|i| json!({"title": format!("t{i}"), "author": "kim"}))
            .collect();
        // 10% nulls on author pushes it below the required threshold
        for record in data.iter_mut().take(10) {
            record["author"] = Value::Null;
        }

        let schema = detector.detect_from_data(&data, None, None);
        let title = schema.get_field("title").unwrap();
        assert!(title.required);
        assert!(!title.nullable);

        let author = schema.get_field("author").unwrap();
        assert!(!author.required);
        assert!(author.nullable);
    }

    #[test]
    fn test_meta_fields_skipped() {
        let detector = SchemaDetector::new();
        let data = vec![json!({"_id": "x", "_source_id": "y", "title": "t"})];
        let schema = detector.detect_from_data(&data, None, None);
        assert_eq!(schema.fields.len(), 1);
        assert_eq!(schema.fields[0].name, "title");
    }

    #[test]
    fn test_numeric_bounds_carried() {
        let detector = SchemaDetector::new();
        let data = vec![
            json!({"price": 10.0}),
            json!({"price": 55.5}),
            json!({"price": 3.2}),
        ];
        let schema = detector.detect_from_data(&data, None, None);
        let price = schema.get_field("price").unwrap();
        assert_eq!(price.field_type, FieldType::Float);
        assert_eq!(price.min_value, Some(3.2));
        assert_eq!(price.max_value, Some(55.5));
    }

    #[test]
    fn test_pattern_promotion() {
        let detector = SchemaDetector::new();
        let data: Vec<Value> = (0..20)
            .map(|i| json!({"contact": format!("user{i}@example.com")}))
            .collect();
        let schema = detector.detect_from_data(&data, None, None);
        let contact = schema.get_field("contact").unwrap();
        assert_eq!(contact.pattern.as_deref(), special_pattern("email"));
        assert!(contact.description.contains("email"));
    }

    #[test]
    fn test_hint_overrides_type_and_required() {
        let detector = SchemaDetector::new();
        let data = vec![json!({"code": "005930"})];
        // Without a hint, a six-digit string detects as integer
        let plain = detector.detect_from_data(&data, None, None);
        assert_eq!(plain.get_field("code").unwrap().field_type, FieldType::Integer);

        let hints = vec![json!({"name": "code", "data_type": "string", "required": false})];
        let hinted = detector.detect_from_data(&data, Some(&hints), None);
        let code = hinted.get_field("code").unwrap();
        assert_eq!(code.field_type, FieldType::String);
        assert!(!code.required);
    }

    #[test]
    fn test_detect_category() {
        let detector = SchemaDetector::new();
        let news = vec![json!({"title": "t", "content": "c", "published_at": "2024-01-01"})];
        assert_eq!(detector.detect_category(&news), Some(DataCategory::NewsArticle));

        let stock = vec![json!({"stock_code": "005930", "price": 70000, "volume": 1000})];
        assert_eq!(detector.detect_category(&stock), Some(DataCategory::StockPrice));

        let unknown = vec![json!({"a": 1, "b": 2})];
        assert_eq!(detector.detect_category(&unknown), Some(DataCategory::Generic));
    }

    #[test]
    fn test_sample_cap_respected() {
        let detector = SchemaDetector {
            sample_size: 10,
            ..Default::default()
        };
        let data: Vec<Value> = (0..100).map(|i| json!({"n": i})).collect();
        let schema = detector.detect_from_data(&data, None, None);
        assert_eq!(schema.metadata["sample_size"], json!(10));
        assert_eq!(schema.metadata["total_records"], json!(100));
    }

    #[test]
    fn test_fields_sorted_by_name() {
        let detector = SchemaDetector::new();
        let data = vec![json!({"zulu": 1, "alpha": 2, "mike": 3})];
        let schema = detector.detect_from_data(&data, None, None);
        let names: Vec<&str> = schema.fields.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec!["alpha", "mike", "zulu"]);
    }
}
