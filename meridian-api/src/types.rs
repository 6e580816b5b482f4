//! Read-only projections returned by the status endpoints.
//!
//! Only statuses, error strings and timestamps are exposed. Handler
//! parameters and results stay internal.

use meridian_core::{
    IdempotencyKey, IdempotencyStatus, SagaId, SagaStatus, SagaStep, SagaWorkflow, StepStatus,
    Timestamp,
};
use serde::{Deserialize, Serialize};

/// Projection of a saga document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SagaStatusView {
    pub saga_id: SagaId,
    pub tenant_id: String,
    pub workflow_type: String,
    pub status: SagaStatus,
    pub current_step: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
    pub steps: Vec<StepStatusView>,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

/// Projection of one saga step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepStatusView {
    pub name: String,
    pub operation: String,
    pub status: StepStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub retry_count: u32,
    pub started_at: Option<Timestamp>,
    pub completed_at: Option<Timestamp>,
}

impl From<&SagaStep> for StepStatusView {
    fn from(step: &SagaStep) -> Self {
        Self {
            name: step.name.clone(),
            operation: step.operation.clone(),
            status: step.status,
            error: step.error.clone(),
            retry_count: step.retry_count,
            started_at: step.started_at,
            completed_at: step.completed_at,
        }
    }
}

impl From<&SagaWorkflow> for SagaStatusView {
    fn from(saga: &SagaWorkflow) -> Self {
        Self {
            saga_id: saga.saga_id,
            tenant_id: saga.tenant_id.clone(),
            workflow_type: saga.workflow_type.clone(),
            status: saga.status,
            current_step: saga.current_step,
            failure: saga.failure.clone(),
            steps: saga.steps.iter().map(StepStatusView::from).collect(),
            created_at: saga.created_at,
            updated_at: saga.updated_at,
        }
    }
}

/// Projection of an idempotency record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdempotencyKeyView {
    pub key: String,
    pub tenant_id: String,
    pub operation_type: String,
    pub status: IdempotencyStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
    pub expires_at: Timestamp,
}

impl From<&IdempotencyKey> for IdempotencyKeyView {
    fn from(record: &IdempotencyKey) -> Self {
        Self {
            key: record.key.clone(),
            tenant_id: record.tenant_id.clone(),
            operation_type: record.operation_type.clone(),
            status: record.status,
            error: record.error.clone(),
            created_at: record.created_at,
            updated_at: record.updated_at,
            expires_at: record.expires_at,
        }
    }
}

/// Response of the cancel endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CancelSagaResponse {
    pub saga_id: SagaId,
    pub status: SagaStatus,
}
