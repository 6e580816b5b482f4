//! Health Check Endpoint
//!
//! `GET /health` reports storage health. No tenant header required.

use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use meridian_core::{HealthCheck, HealthStatus};
use std::time::Instant;

use crate::state::AppState;

/// Create the health router, mounted under `/health`.
pub fn create_router(state: AppState) -> Router {
    Router::new().route("/", get(health)).with_state(state)
}

/// Degraded storage still serves traffic; only unhealthy returns 503.
async fn health(State(state): State<AppState>) -> (StatusCode, Json<HealthCheck>) {
    let started = Instant::now();
    let check = state
        .storage
        .health_check()
        .await
        .with_response_time(started.elapsed().as_millis() as i64)
        .with_metadata("version", serde_json::json!(env!("CARGO_PKG_VERSION")))
        .with_metadata(
            "uptime_seconds",
            serde_json::json!(state.start_time.elapsed().as_secs()),
        );

    let status = match check.status {
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
        HealthStatus::Healthy | HealthStatus::Degraded => StatusCode::OK,
    };
    (status, Json(check))
}
