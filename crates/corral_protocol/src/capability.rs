//! Capabilities consumed by the control plane.
//!
//! The concrete bindings (chat webhooks, an Airflow-compatible REST client)
//! live in out-of-scope adapter crates; the core only sees these traits.
//! Callers apply the deadline constants with `tokio::time::timeout` at every
//! dispatch site.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Duration;

/// Deadline for a single notifier dispatch.
pub const NOTIFIER_TIMEOUT: Duration = Duration::from_secs(10);

/// Deadline for a workflow-engine call.
pub const WORKFLOW_TIMEOUT: Duration = Duration::from_secs(30);

/// Severity of an outbound notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotifySeverity {
    Info,
    Warning,
    Error,
    Critical,
}

impl NotifySeverity {
    /// One tier higher, saturating at critical. Used by alert escalation.
    pub fn escalate(self) -> Self {
        match self {
            NotifySeverity::Info => NotifySeverity::Warning,
            NotifySeverity::Warning => NotifySeverity::Error,
            NotifySeverity::Error => NotifySeverity::Critical,
            NotifySeverity::Critical => NotifySeverity::Critical,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            NotifySeverity::Info => "info",
            NotifySeverity::Warning => "warning",
            NotifySeverity::Error => "error",
            NotifySeverity::Critical => "critical",
        }
    }
}

/// One outbound notification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertMessage {
    pub title: String,
    pub message: String,
    pub severity: NotifySeverity,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_id: Option<String>,
    #[serde(default)]
    pub metadata: BTreeMap<String, Value>,
    /// Bypass the sink's own throttling, for critical escalations
    #[serde(default)]
    pub skip_throttle: bool,
}

impl AlertMessage {
    pub fn new(
        title: impl Into<String>,
        message: impl Into<String>,
        severity: NotifySeverity,
    ) -> Self {
        Self {
            title: title.into(),
            message: message.into(),
            severity,
            source_id: None,
            metadata: BTreeMap::new(),
            skip_throttle: false,
        }
    }

    pub fn with_source(mut self, source_id: impl Into<String>) -> Self {
        self.source_id = Some(source_id.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}

/// Result of a notifier dispatch.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NotifyOutcome {
    pub sent: bool,
    /// Per-transport delivery flags, when the sink fans out
    #[serde(default)]
    pub channels: BTreeMap<String, bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alert_id: Option<String>,
}

/// Opaque notification sink. A failed send never fails the caller.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, alert: AlertMessage) -> NotifyOutcome;
}

/// Outcome of triggering a workflow run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerResult {
    pub success: bool,
    pub dag_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    pub message: String,
}

/// Recent runs of a workflow.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkflowRuns {
    #[serde(default)]
    pub dag_runs: Vec<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Opaque workflow engine (an Airflow-like scheduler behind a REST API).
#[async_trait]
pub trait WorkflowTrigger: Send + Sync {
    async fn trigger(
        &self,
        dag_id: &str,
        conf: Option<Value>,
        run_id: Option<String>,
    ) -> TriggerResult;

    async fn get_runs(&self, dag_id: &str, limit: usize) -> WorkflowRuns;

    async fn get_run_status(&self, dag_id: &str, run_id: &str) -> Option<Value>;
}

/// Test doubles for the capability traits.
pub mod testing {
    use super::*;
    use std::sync::Mutex;

    /// Discards every notification.
    #[derive(Debug, Default)]
    pub struct NullNotifier;

    #[async_trait]
    impl Notifier for NullNotifier {
        async fn send(&self, _alert: AlertMessage) -> NotifyOutcome {
            NotifyOutcome {
                sent: true,
                ..Default::default()
            }
        }
    }

    /// Records every notification for assertions.
    #[derive(Debug, Default)]
    pub struct RecordingNotifier {
        sent: Mutex<Vec<AlertMessage>>,
    }

    impl RecordingNotifier {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn messages(&self) -> Vec<AlertMessage> {
            self.sent.lock().unwrap().clone()
        }

        pub fn count(&self) -> usize {
            self.sent.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl Notifier for RecordingNotifier {
        async fn send(&self, alert: AlertMessage) -> NotifyOutcome {
            self.sent.lock().unwrap().push(alert);
            NotifyOutcome {
                sent: true,
                ..Default::default()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::RecordingNotifier;
    use super::*;

    #[test]
    fn test_severity_escalation_saturates() {
        assert_eq!(NotifySeverity::Info.escalate(), NotifySeverity::Warning);
        assert_eq!(NotifySeverity::Error.escalate(), NotifySeverity::Critical);
        assert_eq!(
            NotifySeverity::Critical.escalate(),
            NotifySeverity::Critical
        );
    }

    #[tokio::test]
    async fn test_recording_notifier_captures_messages() {
        let notifier = RecordingNotifier::new();
        let outcome = notifier
            .send(
                AlertMessage::new("Stale source", "no data for 40h", NotifySeverity::Warning)
                    .with_source("src-1"),
            )
            .await;

        assert!(outcome.sent);
        assert_eq!(notifier.count(), 1);
        assert_eq!(notifier.messages()[0].source_id.as_deref(), Some("src-1"));
    }
}
