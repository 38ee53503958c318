//! Names of every persistent collection.
//!
//! Centralized so the store's index bootstrap, the cascade-delete path, and
//! the catalog's auto-registration all agree on spelling.

pub const SOURCES: &str = "sources";
pub const CRAWLERS: &str = "crawlers";
pub const CRAWLER_HISTORY: &str = "crawler_history";
pub const CRAWL_RESULTS: &str = "crawl_results";
pub const ERROR_LOGS: &str = "error_logs";

pub const SCHEMA_REGISTRY: &str = "schema_registry";

pub const DATA_CATALOG: &str = "data_catalog";
pub const DATA_COLUMNS: &str = "data_columns";
pub const DATA_TAGS: &str = "data_tags";
/// Staging→production promotion audit rows.
pub const DATA_LINEAGE: &str = "data_lineage";
/// Dataset-level graph edges, unique per ordered (source, target) pair.
pub const LINEAGE_EDGES: &str = "lineage_edges";
pub const COLUMN_LINEAGE: &str = "column_lineage";

pub const DATA_REVIEWS: &str = "data_reviews";
pub const REVIEWER_BOOKMARKS: &str = "reviewer_bookmarks";
pub const BULK_JOBS: &str = "bulk_jobs";
pub const REVIEW_AUDIT_LOG: &str = "review_audit_log";

pub const PIPELINE_METRICS: &str = "pipeline_metrics";
pub const ALERT_RULES: &str = "alert_rules";
pub const ALERT_HISTORY: &str = "alert_history";
pub const SLA_DEFINITIONS: &str = "sla_definitions";
pub const SLA_BREACHES: &str = "sla_breaches";
pub const SLA_EVALUATIONS: &str = "sla_evaluations";
pub const FRESHNESS_CONFIG: &str = "freshness_config";
pub const FRESHNESS_HISTORY: &str = "freshness_history";

/// Staging collections, one per payload family.
pub const STAGING_NEWS: &str = "staging_news";
pub const STAGING_FINANCIAL: &str = "staging_financial";
pub const STAGING_DATA: &str = "staging_data";

/// Production collections fed by promotion.
pub const NEWS_ARTICLES: &str = "news_articles";
pub const FINANCIAL_DATA: &str = "financial_data";
pub const STOCK_PRICES: &str = "stock_prices";
pub const EXCHANGE_RATES: &str = "exchange_rates";
pub const MARKET_INDICES: &str = "market_indices";
pub const ANNOUNCEMENTS: &str = "announcements";
pub const CRAWL_DATA: &str = "crawl_data";

/// Collections deleted alongside their parent source, keyed by `source_id`.
pub const SOURCE_CHILD_COLLECTIONS: &[&str] =
    &[CRAWLERS, CRAWL_RESULTS, CRAWLER_HISTORY, ERROR_LOGS];
