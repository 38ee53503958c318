//! Review and data-promotion pipeline.
//!
//! Extracted records land in staging collections; a human review decides
//! their fate. Approval promotes the record into its production collection
//! with full lineage, rejection marks it, and both directions can be
//! reverted. Bulk operations report per-id outcomes and long-running jobs
//! expose pollable progress.

pub mod jobs;
pub mod promotion;
pub mod service;

pub use jobs::{BulkJobStatus, BulkJobTracker};
pub use promotion::{
    determine_type_from_hints, mapping_for, staging_collections, BatchPromotionOutcome,
    PromotionEngine, PromotionOutcome,
};
pub use service::{BulkOperationResult, ReviewFilter, ReviewService};
