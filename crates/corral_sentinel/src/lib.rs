//! Observability core.
//!
//! [`MetricsCollector`] captures per-run telemetry, [`AlertRuleEngine`]
//! evaluates metrics against operator-defined rules, [`SlaMonitor`] scores
//! windowed service levels, and [`FreshnessTracker`] watches how recently
//! each source produced data. Notifications leave through the injected
//! `Notifier`; a failed dispatch is recorded but never fails the caller.

pub mod alerts;
pub mod freshness;
pub mod metrics;
pub mod sla;

pub use alerts::{AlertAction, AlertCondition, AlertRule, AlertRuleEngine, AlertTrigger};
pub use freshness::{FreshnessConfig, FreshnessState, FreshnessStatus, FreshnessTracker};
pub use metrics::{MetricStatus, MetricsCollector, PipelineMetric};
pub use sla::{SlaDefinition, SlaMonitor, SlaStatus, SlaType};
