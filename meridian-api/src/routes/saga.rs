//! Saga status and cancellation endpoints.

use axum::{
    extract::{Path, State},
    routing::{get, post},
    Json, Router,
};
use meridian_core::{SagaId, SagaWorkflow};

use crate::error::{ApiError, ApiResult};
use crate::extractors::Tenant;
use crate::state::AppState;
use crate::types::{CancelSagaResponse, SagaStatusView};

/// Create the saga router, mounted under `/v1/sagas`.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/:saga_id", get(get_saga))
        .route("/:saga_id/cancel", post(cancel_saga))
        .with_state(state)
}

/// GET /v1/sagas/:saga_id
async fn get_saga(
    State(state): State<AppState>,
    Tenant(tenant_id): Tenant,
    Path(saga_id): Path<String>,
) -> ApiResult<Json<SagaStatusView>> {
    let saga = load_for_tenant(&state, &tenant_id, &saga_id).await?;
    Ok(Json(SagaStatusView::from(&saga)))
}

/// POST /v1/sagas/:saga_id/cancel
async fn cancel_saga(
    State(state): State<AppState>,
    Tenant(tenant_id): Tenant,
    Path(saga_id): Path<String>,
) -> ApiResult<Json<CancelSagaResponse>> {
    let saga = load_for_tenant(&state, &tenant_id, &saga_id).await?;
    let status = state.coordinator.cancel_saga_workflow(saga.saga_id).await?;
    tracing::info!(
        saga_id = %saga.saga_id,
        tenant_id = %tenant_id,
        status = %status,
        "Saga cancellation handled"
    );
    Ok(Json(CancelSagaResponse {
        saga_id: saga.saga_id,
        status,
    }))
}

/// Sagas of other tenants are reported as missing.
async fn load_for_tenant(
    state: &AppState,
    tenant_id: &str,
    raw_id: &str,
) -> ApiResult<SagaWorkflow> {
    let saga_id: SagaId = raw_id
        .parse()
        .map_err(|_| ApiError::invalid_format("saga_id", "a UUID"))?;
    let saga = state.coordinator.get_saga(saga_id).await?;
    if saga.tenant_id != tenant_id {
        return Err(ApiError::entity_not_found("Saga", saga_id));
    }
    Ok(saga)
}
