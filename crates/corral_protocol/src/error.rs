//! Error taxonomy for the control plane.
//!
//! Every predictable failure is a typed [`CoreError`] kind; callers match on
//! the kind, adapters map kinds to transport status codes. Unexpected
//! internals collapse into `Internal` (code `E000`) and never crash the
//! process.

use corral_ids::IdParseError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result alias used across the workspace.
pub type CoreResult<T> = Result<T, CoreError>;

/// Operational severity attached to an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorSeverity {
    Low,
    Medium,
    High,
    Critical,
}

/// Recovery hints an error may declare for operational tooling.
///
/// The core honors the `Retry*` variants via the retry policy; the rest are
/// forwarded to adapters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryAction {
    Retry,
    RetryWithBackoff,
    RetryWithLongerTimeout,
    SwitchProxy,
    WaitAndRetry,
    NotifyAdmin,
    Skip,
    Fail,
}

/// Control-plane error kinds.
#[derive(Debug, Error)]
pub enum CoreError {
    /// An id string does not parse as a document identifier.
    #[error("Invalid identifier: {0}")]
    InvalidIdentifier(String),

    /// A unique index rejected a write.
    #[error("Duplicate key: {0}")]
    DuplicateKey(String),

    /// A schema already contains a field with this name.
    #[error("Duplicate field: {0}")]
    DuplicateField(String),

    /// A catalog entity with this name already exists.
    #[error("Duplicate name: {0}")]
    DuplicateName(String),

    /// A point lookup found nothing. List queries return empty instead.
    #[error("Not found: {0}")]
    NotFound(String),

    /// A schema registration failed compatibility checking. No write occurred.
    #[error("Schema incompatible with mode '{mode}': {}", .issues.join("; "))]
    SchemaIncompatible { mode: String, issues: Vec<String> },

    /// A circuit breaker rejected the call.
    #[error("Circuit '{service}' is open, retry in {reset_in_seconds}s")]
    CircuitOpen {
        service: String,
        reset_in_seconds: u64,
    },

    /// Transient connection-level store failure. Recoverable.
    #[error("Database connection error: {0}")]
    DatabaseConnection(String),

    /// Non-transient store failure.
    #[error("Database operation error: {0}")]
    DatabaseOperation(String),

    /// Unexpected internal failure, logged with code E000.
    #[error("[E000] {0}")]
    Internal(String),
}

impl CoreError {
    /// Short machine-readable code, stable across releases.
    pub fn code(&self) -> &'static str {
        match self {
            CoreError::InvalidIdentifier(_) => "E400",
            CoreError::DuplicateKey(_) => "E409",
            CoreError::DuplicateField(_) => "E409",
            CoreError::DuplicateName(_) => "E409",
            CoreError::NotFound(_) => "E404",
            CoreError::SchemaIncompatible { .. } => "E422",
            CoreError::CircuitOpen { .. } => "E503",
            CoreError::DatabaseConnection(_) => "E502",
            CoreError::DatabaseOperation(_) => "E500",
            CoreError::Internal(_) => "E000",
        }
    }

    /// Whether a retry may succeed without operator intervention.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            CoreError::DatabaseConnection(_) | CoreError::CircuitOpen { .. }
        )
    }

    pub fn severity(&self) -> ErrorSeverity {
        match self {
            CoreError::InvalidIdentifier(_)
            | CoreError::DuplicateKey(_)
            | CoreError::DuplicateField(_)
            | CoreError::DuplicateName(_)
            | CoreError::NotFound(_) => ErrorSeverity::Low,
            CoreError::SchemaIncompatible { .. } => ErrorSeverity::Medium,
            CoreError::CircuitOpen { .. } => ErrorSeverity::High,
            CoreError::DatabaseConnection(_) => ErrorSeverity::High,
            CoreError::DatabaseOperation(_) => ErrorSeverity::Medium,
            CoreError::Internal(_) => ErrorSeverity::High,
        }
    }

    /// Recovery hints for operational tooling.
    pub fn recovery_actions(&self) -> Vec<RecoveryAction> {
        match self {
            CoreError::DatabaseConnection(_) => vec![RecoveryAction::RetryWithBackoff],
            CoreError::CircuitOpen { .. } => vec![RecoveryAction::WaitAndRetry],
            CoreError::SchemaIncompatible { .. } => vec![RecoveryAction::NotifyAdmin],
            CoreError::Internal(_) => {
                vec![RecoveryAction::NotifyAdmin, RecoveryAction::Fail]
            }
            _ => vec![RecoveryAction::Fail],
        }
    }

    /// Helper for not-found errors.
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    /// Helper for internal errors.
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }
}

impl From<IdParseError> for CoreError {
    fn from(e: IdParseError) -> Self {
        CoreError::InvalidIdentifier(e.to_string())
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(e: serde_json::Error) -> Self {
        CoreError::DatabaseOperation(format!("Serialization error: {}", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use corral_ids::IdRef;

    #[test]
    fn test_invalid_id_is_client_error() {
        let err: CoreError = IdRef::parse("nope").unwrap_err().into();
        assert!(matches!(err, CoreError::InvalidIdentifier(_)));
        assert!(!err.is_recoverable());
        assert_eq!(err.severity(), ErrorSeverity::Low);
    }

    #[test]
    fn test_connection_errors_retry() {
        let err = CoreError::DatabaseConnection("server selection timeout".into());
        assert!(err.is_recoverable());
        assert_eq!(
            err.recovery_actions(),
            vec![RecoveryAction::RetryWithBackoff]
        );
    }

    #[test]
    fn test_schema_incompatible_message_lists_issues() {
        let err = CoreError::SchemaIncompatible {
            mode: "backward".into(),
            issues: vec![
                "author: added required field without default".into(),
                "title: type narrowed".into(),
            ],
        };
        let msg = err.to_string();
        assert!(msg.contains("backward"));
        assert!(msg.contains("author"));
        assert!(msg.contains("; "));
    }
}
