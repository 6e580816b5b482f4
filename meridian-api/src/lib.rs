//! Meridian API - HTTP Boundary
//!
//! Wires the orchestration core to axum:
//!
//! - [`middleware::idempotency_middleware`] extracts the `Idempotency-Key`
//!   header and short-circuits retried requests whose key already completed
//! - [`routes::status_router`] exposes read-only saga and idempotency key
//!   projections, saga cancellation and a health check
//! - [`telemetry::init_tracing`] installs the tracing subscriber
//!
//! Authentication is external; the tenant arrives in `x-tenant-id`.

pub mod constants;
pub mod error;
pub mod extractors;
pub mod middleware;
pub mod routes;
pub mod state;
pub mod telemetry;
pub mod types;

pub use error::{ApiError, ApiResult, ErrorCode};
pub use middleware::{idempotency_middleware, IdempotencyLayerConfig, IdempotencyLayerState};
pub use routes::status_router;
pub use state::AppState;
pub use telemetry::{init_tracing, TelemetryConfig};
