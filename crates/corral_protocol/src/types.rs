//! Persisted domain entities.
//!
//! All timestamps are UTC. Documents use these field names verbatim in the
//! store; free-form payloads (extractor output, metadata bags) stay as
//! `serde_json::Value` until a schema is known.

use chrono::{DateTime, Utc};
use corral_ids::IdRef;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

/// Lifecycle status of a crawl source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceStatus {
    /// Created, no extractor bound yet
    Pending,
    /// Extractor bound and scheduled
    Active,
    /// Disabled by an operator
    Inactive,
    /// Disabled after repeated failures
    Error,
}

impl fmt::Display for SourceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SourceStatus::Pending => "pending",
            SourceStatus::Active => "active",
            SourceStatus::Inactive => "inactive",
            SourceStatus::Error => "error",
        };
        write!(f, "{}", s)
    }
}

/// Kind of document a source serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceType {
    Html,
    Pdf,
    Excel,
    Csv,
}

/// A crawling target.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Source {
    #[serde(rename = "_id", skip_serializing_if = "Option::is_none")]
    pub id: Option<IdRef>,

    /// Unique, human-chosen name
    pub name: String,

    pub url: String,

    #[serde(rename = "type")]
    pub source_type: SourceType,

    /// User-declared extraction hints
    #[serde(default)]
    pub fields: Vec<Value>,

    /// Cron expression; opaque to the control plane
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule: Option<String>,

    pub status: SourceStatus,

    #[serde(default)]
    pub error_count: u64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_run: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_success: Option<DateTime<Utc>>,

    #[serde(default)]
    pub metadata: BTreeMap<String, Value>,

    pub created_at: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl Source {
    /// Create a new pending source.
    pub fn new(name: impl Into<String>, url: impl Into<String>, source_type: SourceType) -> Self {
        Self {
            id: None,
            name: name.into(),
            url: url.into(),
            source_type,
            fields: Vec::new(),
            schedule: None,
            status: SourceStatus::Pending,
            error_count: 0,
            last_run: None,
            last_success: None,
            metadata: BTreeMap::new(),
            created_at: Utc::now(),
            updated_at: None,
        }
    }
}

/// Lifecycle status of an extractor program.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CrawlerStatus {
    Active,
    Inactive,
}

/// A versioned extractor program bound to one source.
///
/// At most one crawler per source may be `active`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Crawler {
    #[serde(rename = "_id", skip_serializing_if = "Option::is_none")]
    pub id: Option<IdRef>,

    pub source_id: IdRef,

    /// Monotonic per-source version, starting at 1
    pub version: u32,

    pub status: CrawlerStatus,

    /// Workflow DAG this crawler is bound to, if deployed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dag_id: Option<String>,

    /// Generated extractor program; opaque text
    pub code: String,

    pub created_at: DateTime<Utc>,

    pub created_by: String,
}

/// Append-only record of a crawler code change. Immutable once written.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrawlerHistory {
    #[serde(rename = "_id", skip_serializing_if = "Option::is_none")]
    pub id: Option<IdRef>,

    pub source_id: IdRef,
    pub crawler_id: IdRef,
    pub version: u32,
    pub code: String,
    pub change_reason: String,
    pub created_at: DateTime<Utc>,
    pub created_by: String,
}

/// Outcome of one pipeline run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CrawlStatus {
    Success,
    Partial,
    Failed,
    Running,
}

impl fmt::Display for CrawlStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CrawlStatus::Success => "success",
            CrawlStatus::Partial => "partial",
            CrawlStatus::Failed => "failed",
            CrawlStatus::Running => "running",
        };
        write!(f, "{}", s)
    }
}

/// One pipeline run. Immutable after completion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrawlResult {
    #[serde(rename = "_id", skip_serializing_if = "Option::is_none")]
    pub id: Option<IdRef>,

    pub source_id: IdRef,
    pub crawler_id: IdRef,

    /// Run id assigned by the workflow engine
    pub run_id: String,

    pub status: CrawlStatus,
    pub record_count: u64,
    pub execution_time_ms: u64,
    pub executed_at: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,

    /// Extracted records, when retained inline
    #[serde(default)]
    pub data: Vec<Value>,
}

/// How an error log entry was resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionMethod {
    Auto,
    Manual,
}

/// Per-failure record. Created on failure, resolved at most once.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorLog {
    #[serde(rename = "_id", skip_serializing_if = "Option::is_none")]
    pub id: Option<IdRef>,

    pub source_id: IdRef,
    pub error_code: String,
    pub message: String,

    #[serde(default)]
    pub resolved: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolution_method: Option<ResolutionMethod>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolution_detail: Option<String>,

    pub created_at: DateTime<Utc>,
}
