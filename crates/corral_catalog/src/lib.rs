//! Data catalog and lineage graph.
//!
//! The catalog tracks every dataset the platform touches (system
//! collections, staging areas, production tables) with columns, tags,
//! owners, and quality metrics. The lineage service records directed
//! "feeds" edges between datasets, down to column granularity, and answers
//! impact and provenance questions over that graph.

pub mod catalog;
pub mod lineage;
pub mod model;

pub use catalog::{DataCatalog, NewDataset};
pub use lineage::{ImpactAnalysis, LineageEdge, LineageGraph, LineageService, RelationshipType};
pub use model::{
    CatalogStatistics, Column, ColumnStatistics, ColumnType, Dataset, DatasetStatus, DatasetType,
    LineageRef, QualityMetrics, SensitivityLevel, Tag, TagCategory,
};
