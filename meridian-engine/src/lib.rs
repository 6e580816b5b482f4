//! Meridian Engine - Workflow Orchestration
//!
//! The three stateless components that give multi-step business operations
//! at-most-once execution and compensating rollback:
//!
//! - [`OperationRegistry`]: operation-type names to handlers and compensations
//! - [`IdempotencyManager`]: claims, replays and resolves idempotency keys
//! - [`SagaCoordinator`]: sequences saga steps and compensates on failure
//!
//! plus the background [`maintenance`] job. All mutable state lives behind
//! [`meridian_storage::OrchestrationStorage`].

pub mod constants;
pub mod coordinator;
pub mod idempotency;
pub mod maintenance;
pub mod registry;

pub use coordinator::{SagaCoordinator, CANCELLED_FAILURE};
pub use idempotency::{IdempotencyManager, IdempotentCall, IdempotentOutcome, SharedStorage};
pub use maintenance::{maintenance_task, MaintenanceConfig, MaintenanceMetrics, MaintenanceSnapshot};
pub use registry::OperationRegistry;
