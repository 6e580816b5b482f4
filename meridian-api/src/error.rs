//! Error Types for the Meridian API
//!
//! - `ErrorCode` categorizes errors and maps each to an HTTP status
//! - `ApiError` is the JSON error body returned by every endpoint
//! - `From<OrchestrationError>` carries the orchestration taxonomy code
//!   into `details` so operators see the same code in logs and responses

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use meridian_core::OrchestrationError;
use serde::{Deserialize, Serialize};
use std::fmt;

// ============================================================================
// ERROR CODE ENUM
// ============================================================================

/// Error codes for API responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // ========================================================================
    // Validation Errors (400)
    // ========================================================================
    /// Request validation failed
    ValidationFailed,

    /// Required field or header is missing
    MissingField,

    /// Field format is incorrect
    InvalidFormat,

    /// No handler is registered for the requested operation
    OperationNotRegistered,

    // ========================================================================
    // Not Found Errors (404)
    // ========================================================================
    /// Requested entity does not exist
    EntityNotFound,

    // ========================================================================
    // Conflict Errors (409)
    // ========================================================================
    /// Entity with the same identifier already exists
    EntityAlreadyExists,

    /// Another request holds the same idempotency key
    OperationInProgress,

    /// Concurrent modification detected (optimistic locking failure)
    ConcurrentModification,

    /// Operation conflicts with current state
    StateConflict,

    // ========================================================================
    // Server Errors (500, 502, 503)
    // ========================================================================
    /// Internal server error
    InternalError,

    /// A business handler failed
    HandlerFailed,

    /// A compensation failed; operator review required
    CompensationFailed,

    /// Service is temporarily unavailable
    ServiceUnavailable,
}

impl ErrorCode {
    /// Get the HTTP status code for this error code.
    pub fn status_code(&self) -> StatusCode {
        match self {
            ErrorCode::ValidationFailed
            | ErrorCode::MissingField
            | ErrorCode::InvalidFormat
            | ErrorCode::OperationNotRegistered => StatusCode::BAD_REQUEST,

            ErrorCode::EntityNotFound => StatusCode::NOT_FOUND,

            ErrorCode::EntityAlreadyExists
            | ErrorCode::OperationInProgress
            | ErrorCode::ConcurrentModification
            | ErrorCode::StateConflict => StatusCode::CONFLICT,

            ErrorCode::HandlerFailed => StatusCode::BAD_GATEWAY,

            ErrorCode::ServiceUnavailable => StatusCode::SERVICE_UNAVAILABLE,

            ErrorCode::InternalError | ErrorCode::CompensationFailed => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Get a default message for this error code.
    pub fn default_message(&self) -> &'static str {
        match self {
            ErrorCode::ValidationFailed => "Request validation failed",
            ErrorCode::MissingField => "Required field is missing",
            ErrorCode::InvalidFormat => "Invalid format",
            ErrorCode::OperationNotRegistered => "Operation is not registered",
            ErrorCode::EntityNotFound => "Entity not found",
            ErrorCode::EntityAlreadyExists => "Entity already exists",
            ErrorCode::OperationInProgress => "Operation already in progress",
            ErrorCode::ConcurrentModification => "Concurrent modification detected",
            ErrorCode::StateConflict => "Operation conflicts with current state",
            ErrorCode::InternalError => "Internal server error",
            ErrorCode::HandlerFailed => "Operation failed",
            ErrorCode::CompensationFailed => "Compensation failed",
            ErrorCode::ServiceUnavailable => "Service temporarily unavailable",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

// ============================================================================
// API ERROR STRUCT
// ============================================================================

/// Structured error response for API operations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiError {
    /// Error code categorizing the error
    pub code: ErrorCode,

    /// Human-readable error message
    pub message: String,

    /// Optional additional details
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl ApiError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: None,
        }
    }

    /// Create a new API error with the given code, using the default message.
    pub fn from_code(code: ErrorCode) -> Self {
        Self::new(code, code.default_message())
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn status_code(&self) -> StatusCode {
        self.code.status_code()
    }

    pub fn missing_field(field: &str) -> Self {
        Self::new(
            ErrorCode::MissingField,
            format!("Required field '{}' is missing", field),
        )
    }

    pub fn invalid_format(field: &str, expected: &str) -> Self {
        Self::new(
            ErrorCode::InvalidFormat,
            format!("Field '{}' has invalid format, expected {}", field, expected),
        )
    }

    pub fn entity_not_found(entity_type: &str, id: impl fmt::Display) -> Self {
        Self::new(
            ErrorCode::EntityNotFound,
            format!("{} with id {} not found", entity_type, id),
        )
    }

    pub fn internal_error(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InternalError, message)
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for ApiError {}

// ============================================================================
// AXUM INTEGRATION
// ============================================================================

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        (status, Json(self)).into_response()
    }
}

// ============================================================================
// CONVERSIONS
// ============================================================================

impl From<OrchestrationError> for ApiError {
    fn from(err: OrchestrationError) -> Self {
        let code = match &err {
            OrchestrationError::AlreadyExists { .. } => ErrorCode::EntityAlreadyExists,
            OrchestrationError::OperationInProgress { .. } => ErrorCode::OperationInProgress,
            OrchestrationError::NotRegistered { .. } => ErrorCode::OperationNotRegistered,
            OrchestrationError::InvalidState { .. } => ErrorCode::StateConflict,
            OrchestrationError::HandlerFailure { .. } => ErrorCode::HandlerFailed,
            OrchestrationError::CompensationFailure { .. } => ErrorCode::CompensationFailed,
            OrchestrationError::StorageUnavailable { .. } => ErrorCode::ServiceUnavailable,
            OrchestrationError::NotFound { .. } => ErrorCode::EntityNotFound,
            OrchestrationError::ConcurrentExecution { .. } => ErrorCode::ConcurrentModification,
            OrchestrationError::Validation { .. } => ErrorCode::ValidationFailed,
            OrchestrationError::DuplicateRegistration { .. } => ErrorCode::InternalError,
        };

        // Storage failures can carry backend detail; keep it in logs only.
        let message = match &err {
            OrchestrationError::StorageUnavailable { .. } => {
                tracing::error!(error = %err, "Storage unavailable");
                code.default_message().to_string()
            }
            _ => err.to_string(),
        };

        ApiError::new(code, message)
            .with_details(serde_json::json!({ "taxonomy_code": err.code() }))
    }
}

/// Result type for API operations.
pub type ApiResult<T> = Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_status_mapping() {
        assert_eq!(ErrorCode::ValidationFailed.status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(ErrorCode::EntityNotFound.status_code(), StatusCode::NOT_FOUND);
        assert_eq!(ErrorCode::OperationInProgress.status_code(), StatusCode::CONFLICT);
        assert_eq!(
            ErrorCode::ServiceUnavailable.status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[test]
    fn test_orchestration_error_carries_taxonomy_code() {
        let err = ApiError::from(OrchestrationError::OperationInProgress {
            tenant_id: "tenant-a".to_string(),
            key: "k1".to_string(),
        });
        assert_eq!(err.code, ErrorCode::OperationInProgress);
        assert_eq!(
            err.details,
            Some(serde_json::json!({"taxonomy_code": "OPERATION_IN_PROGRESS"}))
        );
    }

    #[test]
    fn test_storage_detail_is_not_exposed() {
        let err = ApiError::from(OrchestrationError::StorageUnavailable {
            reason: "connection refused to 10.0.0.5:5432".to_string(),
        });
        assert_eq!(err.status_code(), StatusCode::SERVICE_UNAVAILABLE);
        assert!(!err.message.contains("10.0.0.5"));
    }

    #[test]
    fn test_serializes_screaming_snake_case() {
        let json = serde_json::to_value(ApiError::from_code(ErrorCode::StateConflict)).unwrap();
        assert_eq!(json["code"], "STATE_CONFLICT");
        assert!(json.get("details").is_none());
    }
}
