//! HTTP middleware.

pub mod idempotency;

pub use idempotency::{
    idempotency_middleware, IdempotencyError, IdempotencyLayerConfig, IdempotencyLayerState,
};
