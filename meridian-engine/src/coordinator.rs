//! Saga coordinator.
//!
//! Drives a saga document through its steps and, on failure, through the
//! compensations of every succeeded step in reverse order. Every transition
//! is persisted before the next one begins, so a crashed worker leaves a
//! saga that [`SagaCoordinator::resume_saga_workflow`] can pick up without
//! re-running succeeded steps.
//!
//! Exclusive execution per saga is enforced by the storage's version check:
//! a write based on a stale read fails with `ConcurrentExecution`.

use crate::idempotency::{IdempotencyManager, IdempotentCall, SharedStorage};
use crate::registry::OperationRegistry;
use chrono::Utc;
use meridian_core::{
    HandlerError, OperationRequest, OrchestrationError, OrchestrationResult, OrchestratorConfig,
    SagaId, SagaStatus, SagaStep, SagaWorkflow, SharedHandler, StepStatus,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::Instrument;

/// Failure message recorded when an operator cancels a running saga.
pub const CANCELLED_FAILURE: &str = "cancelled";

enum StepOutcome {
    Succeeded,
    Failed(String),
}

/// Sequences saga steps and runs compensations on failure.
///
/// Holds no per-saga state; all progress lives in storage.
#[derive(Clone)]
pub struct SagaCoordinator {
    storage: SharedStorage,
    registry: Arc<OperationRegistry>,
    idempotency: IdempotencyManager,
    config: OrchestratorConfig,
}

impl SagaCoordinator {
    pub fn new(
        storage: SharedStorage,
        registry: Arc<OperationRegistry>,
        config: OrchestratorConfig,
    ) -> Self {
        let idempotency =
            IdempotencyManager::new(Arc::clone(&storage), Arc::clone(&registry), config.clone());
        Self {
            storage,
            registry,
            idempotency,
            config,
        }
    }

    /// The idempotency manager steps run through.
    pub fn idempotency(&self) -> &IdempotencyManager {
        &self.idempotency
    }

    // ========================================================================
    // LIFECYCLE
    // ========================================================================

    /// Validate and persist a new `pending` saga.
    ///
    /// Every step must name a registered operation, and a registered
    /// compensation when it declares one.
    pub async fn create_saga_workflow(
        &self,
        tenant_id: &str,
        workflow_type: &str,
        steps: Vec<SagaStep>,
    ) -> OrchestrationResult<SagaWorkflow> {
        for step in &steps {
            self.registry.resolve_handler(&step.operation)?;
            if let Some(compensation) = &step.compensation_operation {
                self.registry.resolve_compensation(compensation)?;
            }
        }

        let mut saga = SagaWorkflow::new(tenant_id, workflow_type, steps, Utc::now())?;
        saga.version = self.storage.save_saga(&saga).await?;

        tracing::info!(
            saga_id = %saga.saga_id,
            tenant_id = %saga.tenant_id,
            workflow_type = %saga.workflow_type,
            steps = saga.steps.len(),
            "Saga created"
        );
        Ok(saga)
    }

    /// Load a saga document.
    pub async fn get_saga(&self, saga_id: SagaId) -> OrchestrationResult<SagaWorkflow> {
        self.storage
            .get_saga(saga_id)
            .await?
            .ok_or(OrchestrationError::NotFound { saga_id })
    }

    /// Run a `pending` saga to the end.
    ///
    /// Returns `true` only when the saga reaches `completed`; `false` when
    /// it was rolled back to `compensated`. A failed compensation is
    /// returned as `CompensationFailure` with the saga left in
    /// `compensation_failed`.
    pub async fn execute_saga_workflow(&self, saga_id: SagaId) -> OrchestrationResult<bool> {
        let span = tracing::info_span!("saga.execute", saga_id = %saga_id);
        async move {
            let mut saga = self.get_saga(saga_id).await?;
            match saga.status {
                SagaStatus::Pending => {
                    saga.transition(SagaStatus::Running, Utc::now())?;
                    self.persist(&mut saga).await?;
                    tracing::info!(tenant_id = %saga.tenant_id, "Saga started");
                }
                SagaStatus::Running => {
                    return Err(OrchestrationError::ConcurrentExecution { saga_id });
                }
                status => {
                    return Err(OrchestrationError::InvalidState {
                        saga_id,
                        status: status.to_string(),
                        action: "execute",
                    });
                }
            }
            self.run_forward(saga).await
        }
        .instrument(span)
        .await
    }

    /// Continue a saga left unfinished by a crashed worker.
    ///
    /// `running` sagas continue at `current_step`; `failed` and
    /// `compensating` sagas continue the compensation pass; `pending`
    /// sagas are simply executed.
    pub async fn resume_saga_workflow(&self, saga_id: SagaId) -> OrchestrationResult<bool> {
        let span = tracing::info_span!("saga.resume", saga_id = %saga_id);
        async move {
            let mut saga = self.get_saga(saga_id).await?;
            tracing::info!(
                status = %saga.status,
                current_step = saga.current_step,
                "Resuming saga"
            );
            match saga.status {
                SagaStatus::Pending => {
                    saga.transition(SagaStatus::Running, Utc::now())?;
                    self.persist(&mut saga).await?;
                    self.run_forward(saga).await
                }
                SagaStatus::Running => {
                    // Claim ownership: a concurrent owner's next write now conflicts.
                    self.persist(&mut saga).await?;
                    self.run_forward(saga).await
                }
                SagaStatus::Failed | SagaStatus::Compensating => self.compensate(saga).await,
                status => Err(OrchestrationError::InvalidState {
                    saga_id,
                    status: status.to_string(),
                    action: "resume",
                }),
            }
        }
        .instrument(span)
        .await
    }

    /// Cancel a saga and return the status it is left in.
    ///
    /// A `pending` saga is rolled back immediately. A `running` saga is
    /// flagged; its worker finishes the in-flight step and then compensates.
    /// Sagas already rolling back are left alone.
    pub async fn cancel_saga_workflow(&self, saga_id: SagaId) -> OrchestrationResult<SagaStatus> {
        let mut saga = self.get_saga(saga_id).await?;
        match saga.status {
            SagaStatus::Pending => {
                saga.failure = Some(CANCELLED_FAILURE.to_string());
                saga.transition(SagaStatus::Failed, Utc::now())?;
                match self.persist(&mut saga).await {
                    Ok(()) => {
                        tracing::info!(saga_id = %saga_id, "Pending saga cancelled");
                        self.compensate(saga).await?;
                        Ok(SagaStatus::Compensated)
                    }
                    Err(OrchestrationError::ConcurrentExecution { .. }) => {
                        // Someone started it between our read and write.
                        self.storage.request_saga_cancellation(saga_id).await?;
                        Ok(SagaStatus::Running)
                    }
                    Err(e) => Err(e),
                }
            }
            SagaStatus::Running => {
                self.storage.request_saga_cancellation(saga_id).await?;
                tracing::info!(saga_id = %saga_id, "Cancellation requested for running saga");
                Ok(SagaStatus::Running)
            }
            SagaStatus::Failed | SagaStatus::Compensating => Ok(saga.status),
            status => Err(OrchestrationError::InvalidState {
                saga_id,
                status: status.to_string(),
                action: "cancel",
            }),
        }
    }

    // ========================================================================
    // FORWARD PASS
    // ========================================================================

    async fn run_forward(&self, mut saga: SagaWorkflow) -> OrchestrationResult<bool> {
        loop {
            if self.storage.saga_cancellation_requested(saga.saga_id).await? {
                tracing::info!(
                    saga_id = %saga.saga_id,
                    current_step = saga.current_step,
                    "Saga cancelled, compensating"
                );
                return self.fail_and_compensate(saga, CANCELLED_FAILURE.to_string()).await;
            }
            if saga.current_step >= saga.steps.len() {
                break;
            }

            let index = saga.current_step;
            match self.run_step(&mut saga, index).await? {
                StepOutcome::Succeeded => {}
                StepOutcome::Failed(message) => {
                    return self.fail_and_compensate(saga, message).await;
                }
            }
        }

        saga.transition(SagaStatus::Completed, Utc::now())?;
        self.persist(&mut saga).await?;
        tracing::info!(saga_id = %saga.saga_id, "Saga completed");
        Ok(true)
    }

    async fn run_step(
        &self,
        saga: &mut SagaWorkflow,
        index: usize,
    ) -> OrchestrationResult<StepOutcome> {
        let operation = saga.steps[index].operation.clone();
        let step_name = saga.steps[index].name.clone();

        let handler = match self.registry.resolve_handler(&operation) {
            Ok(handler) => handler,
            Err(err) => {
                // Missing handlers are never retried.
                let message = err.to_string();
                self.mark_step_failed(saga, index, message.clone()).await?;
                return Ok(StepOutcome::Failed(message));
            }
        };

        loop {
            let now = Utc::now();
            {
                let step = &mut saga.steps[index];
                step.status = StepStatus::Running;
                step.started_at.get_or_insert(now);
            }
            self.persist(saga).await?;

            tracing::debug!(
                saga_id = %saga.saga_id,
                step = index,
                step_name = %step_name,
                operation = %operation,
                attempt = saga.steps[index].retry_count + 1,
                "Invoking step"
            );

            let call = IdempotentCall::new(
                saga.tenant_id.clone(),
                saga.step_idempotency_key(index),
                operation.clone(),
            )
            .with_ttl(self.config.step_key_ttl);
            let request = OperationRequest::new(
                saga.tenant_id.clone(),
                saga.steps[index].parameters.clone(),
            )
            .in_saga(saga.saga_id, step_name.clone(), saga.context.clone());
            let timeout = saga.steps[index]
                .timeout()
                .unwrap_or(self.config.default_step_timeout);

            let outcome = self
                .idempotency
                .execute_idempotent(&call, || {
                    invoke_with_timeout(Arc::clone(&handler), request, timeout)
                })
                .await;

            match outcome {
                Ok(outcome) => {
                    let now = Utc::now();
                    {
                        let step = &mut saga.steps[index];
                        step.result = Some(outcome.result.clone());
                        step.error = None;
                        step.status = StepStatus::Succeeded;
                        step.completed_at = Some(now);
                    }
                    saga.context.insert(step_name.clone(), outcome.result);
                    self.persist(saga).await?;

                    saga.current_step = index + 1;
                    self.persist(saga).await?;
                    tracing::info!(
                        saga_id = %saga.saga_id,
                        step = index,
                        step_name = %step_name,
                        replayed = outcome.replayed,
                        "Step succeeded"
                    );
                    return Ok(StepOutcome::Succeeded);
                }
                Err(OrchestrationError::HandlerFailure {
                    message, retryable, ..
                }) => {
                    let attempt = {
                        let step = &mut saga.steps[index];
                        step.retry_count += 1;
                        step.error = Some(message.clone());
                        step.retry_count
                    };
                    let max_retries = saga.steps[index].max_retries;

                    if retryable && attempt <= max_retries {
                        self.persist(saga).await?;
                        let delay = self.config.retry.delay_for(attempt);
                        tracing::warn!(
                            saga_id = %saga.saga_id,
                            step = index,
                            attempt,
                            max_retries,
                            delay_ms = delay.as_millis() as u64,
                            error = %message,
                            "Step failed, retrying"
                        );
                        tokio::time::sleep(delay).await;
                        if !self.storage.saga_cancellation_requested(saga.saga_id).await? {
                            continue;
                        }
                        // Cancelled while backing off: the failed attempt is final.
                        tracing::info!(
                            saga_id = %saga.saga_id,
                            step = index,
                            attempt,
                            "Saga cancelled during step retry"
                        );
                        self.mark_step_failed(saga, index, message).await?;
                        return Ok(StepOutcome::Failed(CANCELLED_FAILURE.to_string()));
                    }

                    tracing::warn!(
                        saga_id = %saga.saga_id,
                        step = index,
                        retries = attempt.saturating_sub(1),
                        retryable,
                        error = %message,
                        "Step failed permanently"
                    );
                    self.mark_step_failed(saga, index, message.clone()).await?;
                    return Ok(StepOutcome::Failed(message));
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn mark_step_failed(
        &self,
        saga: &mut SagaWorkflow,
        index: usize,
        message: String,
    ) -> OrchestrationResult<()> {
        let step = &mut saga.steps[index];
        step.status = StepStatus::Failed;
        step.error = Some(message);
        step.completed_at = Some(Utc::now());
        self.persist(saga).await
    }

    // ========================================================================
    // COMPENSATION
    // ========================================================================

    async fn fail_and_compensate(
        &self,
        mut saga: SagaWorkflow,
        failure: String,
    ) -> OrchestrationResult<bool> {
        saga.failure = Some(failure);
        saga.transition(SagaStatus::Failed, Utc::now())?;
        self.persist(&mut saga).await?;
        self.compensate(saga).await
    }

    /// Undo succeeded steps newest first. Stops at the first failed
    /// compensation.
    async fn compensate(&self, mut saga: SagaWorkflow) -> OrchestrationResult<bool> {
        if saga.status == SagaStatus::Failed {
            saga.transition(SagaStatus::Compensating, Utc::now())?;
            self.persist(&mut saga).await?;
        }

        for index in saga.compensation_order() {
            let Some(operation) = saga.steps[index].compensation_operation.clone() else {
                saga.steps[index].status = StepStatus::Compensated;
                self.persist(&mut saga).await?;
                continue;
            };
            let step_name = saga.steps[index].name.clone();

            let outcome = match self.registry.resolve_compensation(&operation) {
                Ok(handler) => {
                    let call = IdempotentCall::new(
                        saga.tenant_id.clone(),
                        saga.compensation_idempotency_key(index),
                        operation.clone(),
                    )
                    .with_ttl(self.config.step_key_ttl);
                    let request = OperationRequest::new(
                        saga.tenant_id.clone(),
                        saga.steps[index].effective_compensation_parameters(),
                    )
                    .in_saga(saga.saga_id, step_name.clone(), saga.context.clone());
                    let timeout = saga.steps[index]
                        .timeout()
                        .unwrap_or(self.config.default_step_timeout);

                    self.idempotency
                        .execute_idempotent(&call, || {
                            invoke_with_timeout(handler, request, timeout)
                        })
                        .await
                }
                Err(err) => Err(err),
            };

            match outcome {
                Ok(_) => {
                    saga.steps[index].status = StepStatus::Compensated;
                    self.persist(&mut saga).await?;
                    tracing::info!(
                        saga_id = %saga.saga_id,
                        step = index,
                        step_name = %step_name,
                        "Step compensated"
                    );
                }
                Err(
                    err @ (OrchestrationError::HandlerFailure { .. }
                    | OrchestrationError::NotRegistered { .. }),
                ) => {
                    let message = match err {
                        OrchestrationError::HandlerFailure { message, .. } => message,
                        other => other.to_string(),
                    };
                    {
                        let step = &mut saga.steps[index];
                        step.status = StepStatus::CompensationFailed;
                        step.error = Some(message.clone());
                    }
                    saga.transition(SagaStatus::CompensationFailed, Utc::now())?;
                    self.persist(&mut saga).await?;
                    tracing::error!(
                        saga_id = %saga.saga_id,
                        step = index,
                        step_name = %step_name,
                        operation = %operation,
                        error = %message,
                        "Compensation failed, saga needs operator review"
                    );
                    return Err(OrchestrationError::CompensationFailure {
                        step: step_name,
                        operation_type: operation,
                        message,
                    });
                }
                Err(err) => return Err(err),
            }
        }

        saga.transition(SagaStatus::Compensated, Utc::now())?;
        self.persist(&mut saga).await?;
        tracing::info!(
            saga_id = %saga.saga_id,
            failure = saga.failure.as_deref().unwrap_or_default(),
            "Saga compensated"
        );
        Ok(false)
    }

    /// Save with the version check and adopt the new version.
    async fn persist(&self, saga: &mut SagaWorkflow) -> OrchestrationResult<()> {
        saga.updated_at = Utc::now();
        saga.version = self.storage.save_saga(saga).await?;
        Ok(())
    }
}

async fn invoke_with_timeout(
    handler: SharedHandler,
    request: OperationRequest,
    timeout: Duration,
) -> Result<serde_json::Value, HandlerError> {
    match tokio::time::timeout(timeout, handler.call(request)).await {
        Ok(result) => result,
        Err(_) => Err(HandlerError::new(format!(
            "timed out after {}ms",
            timeout.as_millis()
        ))),
    }
}

// ============================================================================
// TESTS
// ============================================================================
