//! Idempotency key introspection endpoint.

use axum::{
    extract::{Path, State},
    routing::get,
    Json, Router,
};

use crate::error::{ApiError, ApiResult};
use crate::extractors::Tenant;
use crate::state::AppState;
use crate::types::IdempotencyKeyView;

/// Create the idempotency key router, mounted under `/v1/idempotency-keys`.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/:key", get(get_idempotency_key))
        .with_state(state)
}

/// GET /v1/idempotency-keys/:key
///
/// Expired keys are reported as missing.
async fn get_idempotency_key(
    State(state): State<AppState>,
    Tenant(tenant_id): Tenant,
    Path(key): Path<String>,
) -> ApiResult<Json<IdempotencyKeyView>> {
    let record = state
        .idempotency
        .check_idempotency(&tenant_id, &key)
        .await?
        .ok_or_else(|| ApiError::entity_not_found("Idempotency key", &key))?;
    Ok(Json(IdempotencyKeyView::from(&record)))
}
