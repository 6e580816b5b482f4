//! Error types for Meridian orchestration

use crate::SagaId;
use thiserror::Error;

/// Storage layer errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StorageError {
    #[error("Record not found: {kind} {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("Version conflict on saga {saga_id}: expected {expected}, found {found}")]
    VersionConflict {
        saga_id: SagaId,
        expected: u64,
        found: u64,
    },

    #[error("Conditional update rejected for {kind} {id}: {reason}")]
    ConditionFailed {
        kind: &'static str,
        id: String,
        reason: String,
    },

    #[error("Storage lock poisoned")]
    LockPoisoned,

    #[error("Storage unavailable: {reason}")]
    Unavailable { reason: String },

    #[error("Serialization failed: {reason}")]
    Serialization { reason: String },
}

/// Result type alias for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Error returned by an operation or compensation handler.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{message}")]
pub struct HandlerError {
    /// Human-readable failure reason, surfaced verbatim on the step.
    pub message: String,
    /// Whether the coordinator may retry the step.
    pub retryable: bool,
}

impl HandlerError {
    /// A failure the retry policy may retry.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: true,
        }
    }

    /// A failure that must not be retried (bad input, missing handler).
    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: false,
        }
    }
}

/// Error raised when parsing a persisted status string.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("Invalid {kind} status: {value}")]
pub struct StatusParseError {
    pub kind: &'static str,
    pub value: String,
}

/// Master error type for orchestration operations.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum OrchestrationError {
    #[error("Idempotency key '{key}' already exists for tenant {tenant_id}")]
    AlreadyExists { tenant_id: String, key: String },

    #[error("Operation for idempotency key '{key}' is already in progress")]
    OperationInProgress { tenant_id: String, key: String },

    #[error("No handler registered for operation '{operation_type}'")]
    NotRegistered { operation_type: String },

    #[error("Handler for operation '{operation_type}' is already registered")]
    DuplicateRegistration { operation_type: String },

    #[error("Saga {saga_id} cannot {action} while {status}")]
    InvalidState {
        saga_id: SagaId,
        status: String,
        action: &'static str,
    },

    #[error("Operation '{operation_type}' failed: {message}")]
    HandlerFailure {
        operation_type: String,
        message: String,
        retryable: bool,
    },

    #[error("Compensation '{operation_type}' for step '{step}' failed: {message}")]
    CompensationFailure {
        step: String,
        operation_type: String,
        message: String,
    },

    #[error("Storage unavailable: {reason}")]
    StorageUnavailable { reason: String },

    #[error("Saga {saga_id} not found")]
    NotFound { saga_id: SagaId },

    #[error("Saga {saga_id} is being executed by another worker")]
    ConcurrentExecution { saga_id: SagaId },

    #[error("Invalid value for {field}: {reason}")]
    Validation { field: String, reason: String },
}

impl OrchestrationError {
    /// Stable taxonomy code surfaced to callers and operators.
    pub fn code(&self) -> &'static str {
        match self {
            OrchestrationError::AlreadyExists { .. } => "ALREADY_EXISTS",
            OrchestrationError::OperationInProgress { .. } => "OPERATION_IN_PROGRESS",
            OrchestrationError::NotRegistered { .. } => "NOT_REGISTERED",
            OrchestrationError::DuplicateRegistration { .. } => "DUPLICATE_REGISTRATION",
            OrchestrationError::InvalidState { .. } => "INVALID_STATE",
            OrchestrationError::HandlerFailure { .. } => "HANDLER_FAILURE",
            OrchestrationError::CompensationFailure { .. } => "COMPENSATION_FAILURE",
            OrchestrationError::StorageUnavailable { .. } => "STORAGE_UNAVAILABLE",
            OrchestrationError::NotFound { .. } => "NOT_FOUND",
            OrchestrationError::ConcurrentExecution { .. } => "CONCURRENT_EXECUTION",
            OrchestrationError::Validation { .. } => "VALIDATION_FAILED",
        }
    }

    /// Whether retrying the whole call later can succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            OrchestrationError::OperationInProgress { .. }
                | OrchestrationError::StorageUnavailable { .. }
        )
    }

    /// Wrap a handler error raised by `operation_type`.
    pub fn handler_failure(operation_type: impl Into<String>, err: HandlerError) -> Self {
        OrchestrationError::HandlerFailure {
            operation_type: operation_type.into(),
            message: err.message,
            retryable: err.retryable,
        }
    }

    /// Shorthand for a [`OrchestrationError::Validation`].
    pub fn validation(field: impl Into<String>, reason: impl Into<String>) -> Self {
        OrchestrationError::Validation {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

impl From<StorageError> for OrchestrationError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::VersionConflict { saga_id, .. } => {
                OrchestrationError::ConcurrentExecution { saga_id }
            }
            other => OrchestrationError::StorageUnavailable {
                reason: other.to_string(),
            },
        }
    }
}

/// Result type alias for orchestration operations.
pub type OrchestrationResult<T> = Result<T, OrchestrationError>;

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_storage_error_display_version_conflict() {
        let err = StorageError::VersionConflict {
            saga_id: Uuid::nil(),
            expected: 3,
            found: 4,
        };
        let msg = format!("{}", err);
        assert!(msg.contains("Version conflict"));
        assert!(msg.contains("expected 3"));
        assert!(msg.contains("found 4"));
    }

    #[test]
    fn test_version_conflict_maps_to_concurrent_execution() {
        let err: OrchestrationError = StorageError::VersionConflict {
            saga_id: Uuid::nil(),
            expected: 1,
            found: 2,
        }
        .into();
        assert!(matches!(err, OrchestrationError::ConcurrentExecution { .. }));
        assert!(!err.is_transient());
    }

    #[test]
    fn test_other_storage_errors_map_to_unavailable() {
        let err: OrchestrationError = StorageError::LockPoisoned.into();
        assert_eq!(err.code(), "STORAGE_UNAVAILABLE");
        assert!(err.is_transient());
    }

    #[test]
    fn test_codes_are_distinct() {
        let errors = vec![
            OrchestrationError::AlreadyExists {
                tenant_id: "t".into(),
                key: "k".into(),
            },
            OrchestrationError::OperationInProgress {
                tenant_id: "t".into(),
                key: "k".into(),
            },
            OrchestrationError::NotRegistered {
                operation_type: "op".into(),
            },
            OrchestrationError::DuplicateRegistration {
                operation_type: "op".into(),
            },
            OrchestrationError::InvalidState {
                saga_id: Uuid::nil(),
                status: "completed".into(),
                action: "execute",
            },
            OrchestrationError::HandlerFailure {
                operation_type: "op".into(),
                message: "boom".into(),
                retryable: true,
            },
            OrchestrationError::CompensationFailure {
                step: "s".into(),
                operation_type: "op".into(),
                message: "boom".into(),
            },
            OrchestrationError::StorageUnavailable {
                reason: "down".into(),
            },
        ];
        let mut codes: Vec<_> = errors.iter().map(|e| e.code()).collect();
        codes.sort_unstable();
        codes.dedup();
        assert_eq!(codes.len(), errors.len());
    }

    #[test]
    fn test_handler_error_constructors() {
        assert!(HandlerError::new("timeout").retryable);
        let permanent = HandlerError::permanent("bad card");
        assert!(!permanent.retryable);
        assert_eq!(permanent.to_string(), "bad card");
    }
}
