//! Shared protocol types for the Corral control plane.
//!
//! This crate defines the domain entities persisted by the document store,
//! the error taxonomy surfaced to callers, the names of every persistent
//! collection, and the capability traits (`Notifier`, `WorkflowTrigger`)
//! that the control plane consumes but does not implement.

pub mod capability;
pub mod collections;
pub mod error;
pub mod types;

pub use capability::{
    AlertMessage, Notifier, NotifyOutcome, NotifySeverity, TriggerResult, WorkflowRuns,
    WorkflowTrigger, NOTIFIER_TIMEOUT, WORKFLOW_TIMEOUT,
};
pub use error::{CoreError, CoreResult, ErrorSeverity, RecoveryAction};
pub use types::{
    CrawlResult, CrawlStatus, Crawler, CrawlerHistory, CrawlerStatus, ErrorLog, ResolutionMethod,
    Source, SourceStatus, SourceType,
};
