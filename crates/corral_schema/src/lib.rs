//! Schema registry for Corral.
//!
//! A source's extractor output is described by a [`Schema`]; the
//! [`SchemaRegistry`] stores immutable, versioned snapshots of it, guarded
//! by the [`CompatibilityChecker`]. The [`SchemaDetector`] infers schemas
//! from sampled records, and [`SchemaEvolution`] plans and applies
//! record-level migrations between schema versions.

pub mod compatibility;
pub mod detector;
pub mod evolution;
pub mod model;
pub mod registry;

pub use compatibility::CompatibilityChecker;
pub use detector::{FieldStats, SchemaDetector};
pub use evolution::{
    EvolutionAction, MigrationPlan, MigrationResult, MigrationStep, OnError, SchemaEvolution,
};
pub use model::{
    default_schema, CompatibilityIssue, CompatibilityMode, CompatibilityResult, DataCategory,
    FieldSchema, FieldType, IssueSeverity, Schema, SchemaVersion,
};
pub use registry::SchemaRegistry;
