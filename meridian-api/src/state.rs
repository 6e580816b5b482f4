//! Shared application state for Axum routers.

use meridian_engine::{IdempotencyManager, SagaCoordinator, SharedStorage};

/// Application-wide state shared across all routes.
#[derive(Clone)]
pub struct AppState {
    pub storage: SharedStorage,
    pub coordinator: SagaCoordinator,
    pub idempotency: IdempotencyManager,
    pub start_time: std::time::Instant,
}

impl AppState {
    /// Build state around an existing coordinator, sharing its storage and
    /// idempotency manager.
    pub fn new(storage: SharedStorage, coordinator: SagaCoordinator) -> Self {
        let idempotency = coordinator.idempotency().clone();
        Self {
            storage,
            coordinator,
            idempotency,
            start_time: std::time::Instant::now(),
        }
    }
}
