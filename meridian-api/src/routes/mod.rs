//! HTTP routes.

pub mod health;
pub mod idempotency_keys;
pub mod saga;

use axum::Router;
use tower_http::trace::TraceLayer;

use crate::state::AppState;

/// Read-only status endpoints plus saga cancellation and health.
///
/// - `GET  /v1/sagas/:saga_id`
/// - `POST /v1/sagas/:saga_id/cancel`
/// - `GET  /v1/idempotency-keys/:key`
/// - `GET  /health`
pub fn status_router(state: AppState) -> Router {
    Router::new()
        .nest("/v1/sagas", saga::create_router(state.clone()))
        .nest(
            "/v1/idempotency-keys",
            idempotency_keys::create_router(state.clone()),
        )
        .nest("/health", health::create_router(state))
        .layer(TraceLayer::new_for_http())
}
