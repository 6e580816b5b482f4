//! Meridian Test Utilities
//!
//! Shared test infrastructure for the Meridian workspace:
//! - Handler fixtures that record, fail, flake or stall
//! - Proptest generators for keys, tenants and saga shapes
//! - Step and storage fixtures
//! - Assertions on the orchestration error taxonomy

pub use meridian_storage::InMemoryStorage;

pub use meridian_core::{
    HandlerError, IdempotencyKey, IdempotencyStatus, OperationHandler, OperationRequest,
    OrchestrationError, OrchestrationResult, OrchestratorConfig, SagaStatus, SagaStep,
    SagaWorkflow, SharedHandler, StepStatus,
};

use async_trait::async_trait;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

// ============================================================================
// CALL LOG
// ============================================================================

/// One recorded handler invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedCall {
    pub label: String,
    pub tenant_id: String,
    pub parameters: serde_json::Value,
}

/// Ordered log of handler invocations shared between fixtures.
///
/// Clones share the same log, so one log can observe a whole saga.
#[derive(Debug, Clone, Default)]
pub struct CallLog {
    calls: Arc<Mutex<Vec<RecordedCall>>>,
}

impl CallLog {
    pub fn new() -> Self {
        Self::default()
    }

    fn record(&self, label: &str, request: &OperationRequest) {
        let mut calls = self.calls.lock().unwrap_or_else(|e| e.into_inner());
        calls.push(RecordedCall {
            label: label.to_string(),
            tenant_id: request.tenant_id.clone(),
            parameters: request.parameters.clone(),
        });
    }

    /// Labels in invocation order.
    pub fn labels(&self) -> Vec<String> {
        self.entries().into_iter().map(|c| c.label).collect()
    }

    pub fn entries(&self) -> Vec<RecordedCall> {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// How many times `label` was invoked.
    pub fn count(&self, label: &str) -> usize {
        self.entries().iter().filter(|c| c.label == label).count()
    }

    /// Parameters of every invocation of `label`.
    pub fn parameters_for(&self, label: &str) -> Vec<serde_json::Value> {
        self.entries()
            .into_iter()
            .filter(|c| c.label == label)
            .map(|c| c.parameters)
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }
}

// ============================================================================
// HANDLER FIXTURES
// ============================================================================

/// Succeeds with a fixed result and records each call.
#[derive(Debug, Clone)]
pub struct RecordingHandler {
    label: String,
    log: CallLog,
    result: serde_json::Value,
}

impl RecordingHandler {
    pub fn new(label: impl Into<String>, log: &CallLog, result: serde_json::Value) -> Self {
        Self {
            label: label.into(),
            log: log.clone(),
            result,
        }
    }

    pub fn shared(self) -> SharedHandler {
        Arc::new(self)
    }
}

#[async_trait]
impl OperationHandler for RecordingHandler {
    async fn call(&self, request: OperationRequest) -> Result<serde_json::Value, HandlerError> {
        self.log.record(&self.label, &request);
        Ok(self.result.clone())
    }
}

/// Always fails and records each call.
#[derive(Debug, Clone)]
pub struct FailingHandler {
    label: String,
    log: CallLog,
    message: String,
    retryable: bool,
}

impl FailingHandler {
    /// A retryable failure.
    pub fn new(label: impl Into<String>, log: &CallLog, message: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            log: log.clone(),
            message: message.into(),
            retryable: true,
        }
    }

    /// A failure the coordinator must not retry.
    pub fn permanent(label: impl Into<String>, log: &CallLog, message: impl Into<String>) -> Self {
        Self {
            retryable: false,
            ..Self::new(label, log, message)
        }
    }

    pub fn shared(self) -> SharedHandler {
        Arc::new(self)
    }
}

#[async_trait]
impl OperationHandler for FailingHandler {
    async fn call(&self, request: OperationRequest) -> Result<serde_json::Value, HandlerError> {
        self.log.record(&self.label, &request);
        if self.retryable {
            Err(HandlerError::new(self.message.clone()))
        } else {
            Err(HandlerError::permanent(self.message.clone()))
        }
    }
}

/// Fails the first `failures` calls, then succeeds.
#[derive(Debug)]
pub struct FlakyHandler {
    label: String,
    log: CallLog,
    remaining_failures: AtomicU32,
    result: serde_json::Value,
}

impl FlakyHandler {
    pub fn new(
        label: impl Into<String>,
        log: &CallLog,
        failures: u32,
        result: serde_json::Value,
    ) -> Self {
        Self {
            label: label.into(),
            log: log.clone(),
            remaining_failures: AtomicU32::new(failures),
            result,
        }
    }

    pub fn shared(self) -> SharedHandler {
        Arc::new(self)
    }
}

#[async_trait]
impl OperationHandler for FlakyHandler {
    async fn call(&self, request: OperationRequest) -> Result<serde_json::Value, HandlerError> {
        self.log.record(&self.label, &request);
        let failed = self
            .remaining_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            Err(HandlerError::new(format!("{} transient failure", self.label)))
        } else {
            Ok(self.result.clone())
        }
    }
}

/// Sleeps before succeeding. Used to exercise timeouts and races.
#[derive(Debug, Clone)]
pub struct SlowHandler {
    label: String,
    log: CallLog,
    delay: Duration,
    result: serde_json::Value,
}

impl SlowHandler {
    pub fn new(
        label: impl Into<String>,
        log: &CallLog,
        delay: Duration,
        result: serde_json::Value,
    ) -> Self {
        Self {
            label: label.into(),
            log: log.clone(),
            delay,
            result,
        }
    }

    pub fn shared(self) -> SharedHandler {
        Arc::new(self)
    }
}

#[async_trait]
impl OperationHandler for SlowHandler {
    async fn call(&self, request: OperationRequest) -> Result<serde_json::Value, HandlerError> {
        self.log.record(&self.label, &request);
        tokio::time::sleep(self.delay).await;
        Ok(self.result.clone())
    }
}

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    //! Proptest strategies for orchestration inputs.

    use proptest::prelude::*;

    /// Tenant ids as the platform names them.
    pub fn arb_tenant_id() -> impl Strategy<Value = String> {
        "tenant-[a-z0-9]{1,12}"
    }

    /// Valid idempotency keys (1-256 visible ASCII characters).
    pub fn arb_idempotency_key() -> impl Strategy<Value = String> {
        "[A-Za-z0-9_:-]{1,64}"
    }

    /// A saga length and the index of the step that fails (if any).
    pub fn arb_saga_shape() -> impl Strategy<Value = (usize, Option<usize>)> {
        (1usize..8).prop_flat_map(|len| (Just(len), proptest::option::of(0..len)))
    }
}

// ============================================================================
// FIXTURES
// ============================================================================

pub mod fixtures {
    //! Pre-built steps, sagas and storage for common scenarios.

    use super::*;

    /// Fresh shared in-memory storage.
    pub fn storage() -> Arc<InMemoryStorage> {
        Arc::new(InMemoryStorage::new())
    }

    /// Step `name` running operation `op` with empty parameters.
    pub fn step(name: &str, op: &str) -> SagaStep {
        SagaStep::new(name, op, serde_json::json!({}))
    }

    /// Step whose compensation is registered as `undo_{op}`.
    pub fn compensated_step(name: &str, op: &str) -> SagaStep {
        step(name, op).with_compensation(format!("undo_{}", op), None)
    }

    /// `step_0 .. step_{n-1}` running `op_0 .. op_{n-1}`, each compensated.
    pub fn linear_steps(n: usize) -> Vec<SagaStep> {
        (0..n)
            .map(|i| compensated_step(&format!("step_{}", i), &format!("op_{}", i)))
            .collect()
    }

    /// The two-step tenant provisioning saga used throughout the suite.
    pub fn provisioning_steps() -> Vec<SagaStep> {
        vec![
            SagaStep::new("reserve", "reserve_funds", serde_json::json!({"amount": 100}))
                .with_compensation("release_funds", None),
            SagaStep::new("provision", "provision_resource", serde_json::json!({"plan": "fiber-1g"}))
                .with_compensation("deprovision_resource", None),
        ]
    }

    /// A standalone saga document that has never been saved.
    pub fn unsaved_saga(tenant_id: &str, steps: Vec<SagaStep>) -> SagaWorkflow {
        match SagaWorkflow::new(tenant_id, "test_workflow", steps, chrono::Utc::now()) {
            Ok(saga) => saga,
            Err(e) => panic!("fixture saga is invalid: {}", e),
        }
    }
}

// ============================================================================
// ASSERTIONS
// ============================================================================

pub mod assertions {
    //! Assertions on the orchestration error taxonomy.

    use super::*;

    /// Assert that a result failed with the given taxonomy code.
    pub fn assert_error_code<T: std::fmt::Debug>(result: &OrchestrationResult<T>, code: &str) {
        match result {
            Err(e) => assert_eq!(e.code(), code, "Wrong error code for {:?}", e),
            Ok(v) => panic!("Expected error {}, got Ok({:?})", code, v),
        }
    }

    /// Assert the per-step statuses of a saga, in order.
    pub fn assert_step_statuses(saga: &SagaWorkflow, expected: &[StepStatus]) {
        let actual: Vec<StepStatus> = saga.steps.iter().map(|s| s.status).collect();
        assert_eq!(actual, expected, "Step statuses of saga {}", saga.saga_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_flaky_handler_fails_then_succeeds() {
        let log = CallLog::new();
        let handler = FlakyHandler::new("flaky", &log, 2, json!("ok"));
        let request = OperationRequest::new("tenant-a", json!({}));
        assert!(handler.call(request.clone()).await.is_err());
        assert!(handler.call(request.clone()).await.is_err());
        assert_eq!(handler.call(request).await.unwrap(), json!("ok"));
        assert_eq!(log.count("flaky"), 3);
    }

    #[tokio::test]
    async fn test_call_log_is_shared_between_clones() {
        let log = CallLog::new();
        let a = RecordingHandler::new("a", &log, json!(1));
        let b = FailingHandler::permanent("b", &log, "nope");
        a.call(OperationRequest::new("t", json!({"x": 1}))).await.unwrap();
        let err = b.call(OperationRequest::new("t", json!({}))).await.unwrap_err();
        assert!(!err.retryable);
        assert_eq!(log.labels(), vec!["a", "b"]);
        assert_eq!(log.parameters_for("a"), vec![json!({"x": 1})]);
    }
}
