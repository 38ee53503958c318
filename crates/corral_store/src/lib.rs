//! Document store gateway for Corral.
//!
//! The control plane persists everything in a document store speaking the
//! MongoDB query dialect. Two engines implement the [`DocumentBackend`]
//! trait:
//!
//! - the in-memory engine (default), used by tests and embedded
//!   deployments; it evaluates the filter/update/aggregation subset the
//!   control plane uses, including unique indexes, and
//! - the `mongodb` driver binding (behind the `mongodb` feature).
//!
//! [`Store`] wraps an engine with a circuit breaker, id-safe CRUD, index
//! bootstrap, cascading source deletion, and the dashboard aggregations.
//!
//! # Example
//!
//! ```rust,ignore
//! use corral_store::{Store, StoreUrl};
//!
//! let store = Store::open(StoreUrl::parse("memory://")?).await?;
//! store.ensure_indexes().await?;
//! let id = store.create("sources", doc).await?;
//! ```

pub mod aggregate;
pub mod backend;
pub mod dashboard;
pub mod filter;
#[cfg(feature = "memory")]
pub mod memory;
#[cfg(feature = "mongodb")]
pub mod mongo;
pub mod store;
pub mod update;

pub use backend::{Document, DocumentBackend, FindOptions, IndexSpec, UpsertOutcome};
pub use dashboard::{DashboardStats, StatusRollup};
#[cfg(feature = "memory")]
pub use memory::MemoryBackend;
#[cfg(feature = "mongodb")]
pub use mongo::MongoBackend;
pub use store::{HealthStatus, SourceDeletion, Store};

use corral_protocol::{CoreError, CoreResult};

/// Parsed store connection URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreUrl {
    /// In-memory engine; state lives and dies with the process.
    Memory,
    /// MongoDB connection string plus database name.
    Mongo { uri: String, database: String },
}

impl StoreUrl {
    /// Parse a connection URL.
    ///
    /// `memory://` selects the in-memory engine. `mongodb://host/db` (or
    /// `mongodb+srv://`) selects the driver engine; the database name is
    /// taken from the path segment, defaulting to `corral`.
    pub fn parse(raw: &str) -> CoreResult<Self> {
        if raw == "memory://" || raw == "memory" {
            return Ok(Self::Memory);
        }
        if raw.starts_with("mongodb://") || raw.starts_with("mongodb+srv://") {
            let database = raw
                .splitn(4, '/')
                .nth(3)
                .map(|s| s.split('?').next().unwrap_or(""))
                .filter(|s| !s.is_empty())
                .unwrap_or("corral")
                .to_string();
            return Ok(Self::Mongo {
                uri: raw.to_string(),
                database,
            });
        }
        Err(CoreError::DatabaseOperation(format!(
            "Unsupported store URL: {raw}"
        )))
    }

    /// Engine name for health reporting.
    pub fn engine(&self) -> &'static str {
        match self {
            StoreUrl::Memory => "memory",
            StoreUrl::Mongo { .. } => "mongodb",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_memory() {
        assert_eq!(StoreUrl::parse("memory://").unwrap(), StoreUrl::Memory);
    }

    #[test]
    fn test_parse_mongo_database() {
        let url = StoreUrl::parse("mongodb://localhost:27017/crawler?retryWrites=true").unwrap();
        match url {
            StoreUrl::Mongo { database, .. } => assert_eq!(database, "crawler"),
            _ => panic!("expected mongo url"),
        }
    }

    #[test]
    fn test_parse_mongo_default_database() {
        let url = StoreUrl::parse("mongodb://localhost:27017").unwrap();
        match url {
            StoreUrl::Mongo { database, .. } => assert_eq!(database, "corral"),
            _ => panic!("expected mongo url"),
        }
    }

    #[test]
    fn test_parse_rejects_unknown_scheme() {
        assert!(StoreUrl::parse("postgres://x").is_err());
    }
}
