//! Meridian Core - Orchestration Data Types
//!
//! Pure data structures shared by the storage, engine and API crates:
//! idempotency records, saga documents, the handler contract, the error
//! taxonomy and runtime configuration. This crate has no I/O.

use chrono::{DateTime, Utc};
use uuid::Uuid;

pub mod config;
pub mod constants;
pub mod error;
pub mod handler;
pub mod health;
pub mod idempotency;
pub mod saga;

pub use config::{OrchestratorConfig, RetryPolicy};
pub use error::{
    HandlerError, OrchestrationError, OrchestrationResult, StatusParseError, StorageError,
    StorageResult,
};
pub use handler::{handler_fn, FnHandler, OperationHandler, OperationRequest, SharedHandler};
pub use health::{HealthCheck, HealthStatus};
pub use idempotency::{IdempotencyKey, IdempotencyStatus};
pub use saga::{SagaContext, SagaStatus, SagaStep, SagaWorkflow, StepStatus};

// ============================================================================
// IDENTITY TYPES
// ============================================================================

/// Saga identifier using UUIDv7 for timestamp-sortable IDs.
pub type SagaId = Uuid;

/// Timestamp type using UTC timezone.
pub type Timestamp = DateTime<Utc>;

/// Tenant identifier. Tenants are named by the outer platform, not by us.
pub type TenantId = String;

/// Generate a new UUIDv7 saga id (timestamp-sortable).
pub fn new_saga_id() -> SagaId {
    Uuid::now_v7()
}
