//! Saga documents.
//!
//! # State Transition Diagram
//!
//! ```text
//! pending ──→ running ──→ completed
//!                │
//!                └──→ failed ──→ compensating ──→ compensated
//!                                      │
//!                                      └──→ compensation_failed
//! ```
//!
//! A saga exclusively owns its ordered steps. The stored document is the
//! source of truth; `version` is bumped on every successful save and is the
//! optimistic-concurrency token.

use crate::error::{OrchestrationError, OrchestrationResult, StatusParseError};
use crate::{new_saga_id, SagaId, TenantId, Timestamp};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Results of succeeded steps keyed by step name. Read-only to handlers.
pub type SagaContext = BTreeMap<String, serde_json::Value>;

// ============================================================================
// SAGA STATUS
// ============================================================================

/// Status of a saga workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SagaStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Compensating,
    Compensated,
    CompensationFailed,
}

impl SagaStatus {
    /// Convert to persisted string representation.
    pub fn as_db_str(&self) -> &'static str {
        match self {
            SagaStatus::Pending => "pending",
            SagaStatus::Running => "running",
            SagaStatus::Completed => "completed",
            SagaStatus::Failed => "failed",
            SagaStatus::Compensating => "compensating",
            SagaStatus::Compensated => "compensated",
            SagaStatus::CompensationFailed => "compensation_failed",
        }
    }

    /// Parse from persisted string representation.
    pub fn from_db_str(s: &str) -> Result<Self, StatusParseError> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(SagaStatus::Pending),
            "running" => Ok(SagaStatus::Running),
            "completed" => Ok(SagaStatus::Completed),
            "failed" => Ok(SagaStatus::Failed),
            "compensating" => Ok(SagaStatus::Compensating),
            "compensated" => Ok(SagaStatus::Compensated),
            "compensation_failed" => Ok(SagaStatus::CompensationFailed),
            _ => Err(StatusParseError {
                kind: "saga",
                value: s.to_string(),
            }),
        }
    }

    /// Terminal sagas are immutable.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SagaStatus::Completed | SagaStatus::Compensated | SagaStatus::CompensationFailed
        )
    }

    /// Whether `next` is a legal transition from this status.
    pub fn can_transition_to(&self, next: SagaStatus) -> bool {
        use SagaStatus::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Pending, Failed)
                | (Running, Completed)
                | (Running, Failed)
                | (Failed, Compensating)
                | (Compensating, Compensated)
                | (Compensating, CompensationFailed)
        )
    }
}

impl fmt::Display for SagaStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_db_str())
    }
}

impl FromStr for SagaStatus {
    type Err = StatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_db_str(s)
    }
}

// ============================================================================
// STEP STATUS
// ============================================================================

/// Status of a single saga step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    #[default]
    Pending,
    Running,
    Succeeded,
    Failed,
    Compensated,
    CompensationFailed,
}

impl StepStatus {
    /// Convert to persisted string representation.
    pub fn as_db_str(&self) -> &'static str {
        match self {
            StepStatus::Pending => "pending",
            StepStatus::Running => "running",
            StepStatus::Succeeded => "succeeded",
            StepStatus::Failed => "failed",
            StepStatus::Compensated => "compensated",
            StepStatus::CompensationFailed => "compensation_failed",
        }
    }

    /// Parse from persisted string representation.
    pub fn from_db_str(s: &str) -> Result<Self, StatusParseError> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(StepStatus::Pending),
            "running" => Ok(StepStatus::Running),
            "succeeded" => Ok(StepStatus::Succeeded),
            "failed" => Ok(StepStatus::Failed),
            "compensated" => Ok(StepStatus::Compensated),
            "compensation_failed" => Ok(StepStatus::CompensationFailed),
            _ => Err(StatusParseError {
                kind: "step",
                value: s.to_string(),
            }),
        }
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_db_str())
    }
}

impl FromStr for StepStatus {
    type Err = StatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_db_str(s)
    }
}

// ============================================================================
// SAGA STEP
// ============================================================================

/// One step of a saga.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SagaStep {
    pub name: String,
    /// Key into the operation registry.
    pub operation: String,
    pub parameters: serde_json::Value,
    pub compensation_operation: Option<String>,
    pub compensation_parameters: Option<serde_json::Value>,
    pub status: StepStatus,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    pub max_retries: u32,
    pub retry_count: u32,
    /// Per-attempt timeout; falls back to the coordinator default.
    pub timeout_ms: Option<u64>,
    pub started_at: Option<Timestamp>,
    pub completed_at: Option<Timestamp>,
}

impl SagaStep {
    /// Create a step with no compensation and no retries.
    pub fn new(
        name: impl Into<String>,
        operation: impl Into<String>,
        parameters: serde_json::Value,
    ) -> Self {
        Self {
            name: name.into(),
            operation: operation.into(),
            parameters,
            compensation_operation: None,
            compensation_parameters: None,
            status: StepStatus::Pending,
            result: None,
            error: None,
            max_retries: 0,
            retry_count: 0,
            timeout_ms: None,
            started_at: None,
            completed_at: None,
        }
    }

    /// Set the compensating operation and its parameters.
    pub fn with_compensation(
        mut self,
        operation: impl Into<String>,
        parameters: Option<serde_json::Value>,
    ) -> Self {
        self.compensation_operation = Some(operation.into());
        self.compensation_parameters = parameters;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = Some(timeout.as_millis().min(u64::MAX as u128) as u64);
        self
    }

    /// Per-attempt timeout, if the step overrides the default.
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }

    /// Parameters handed to this step's compensation.
    ///
    /// Explicit `compensation_parameters` are layered over the step's own
    /// result, so an id captured by the forward step reaches its undo.
    pub fn effective_compensation_parameters(&self) -> serde_json::Value {
        match (&self.result, &self.compensation_parameters) {
            (Some(serde_json::Value::Object(result)), Some(serde_json::Value::Object(params))) => {
                let mut merged = result.clone();
                for (k, v) in params {
                    merged.insert(k.clone(), v.clone());
                }
                serde_json::Value::Object(merged)
            }
            (_, Some(params)) => params.clone(),
            (Some(result), None) => result.clone(),
            (None, None) => serde_json::Value::Null,
        }
    }

    /// Reset execution state, keeping the definition.
    fn reset(&mut self) {
        self.status = StepStatus::Pending;
        self.result = None;
        self.error = None;
        self.retry_count = 0;
        self.started_at = None;
        self.completed_at = None;
    }
}

// ============================================================================
// SAGA WORKFLOW
// ============================================================================

/// A persisted saga document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SagaWorkflow {
    pub saga_id: SagaId,
    pub tenant_id: TenantId,
    pub workflow_type: String,
    pub status: SagaStatus,
    pub current_step: usize,
    pub steps: Vec<SagaStep>,
    pub context: SagaContext,
    /// Error that drove the saga out of `running`.
    pub failure: Option<String>,
    /// Optimistic-concurrency token; 0 means never saved.
    pub version: u64,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

impl SagaWorkflow {
    /// Build a new `pending` saga from step definitions.
    pub fn new(
        tenant_id: impl Into<TenantId>,
        workflow_type: impl Into<String>,
        steps: Vec<SagaStep>,
        now: Timestamp,
    ) -> OrchestrationResult<Self> {
        let tenant_id = tenant_id.into();
        let workflow_type = workflow_type.into();
        if tenant_id.trim().is_empty() {
            return Err(OrchestrationError::validation("tenant_id", "must not be empty"));
        }
        if workflow_type.trim().is_empty() {
            return Err(OrchestrationError::validation(
                "workflow_type",
                "must not be empty",
            ));
        }
        if steps.is_empty() {
            return Err(OrchestrationError::validation(
                "steps",
                "a saga needs at least one step",
            ));
        }
        let mut seen = std::collections::HashSet::new();
        for step in &steps {
            if step.name.trim().is_empty() {
                return Err(OrchestrationError::validation(
                    "steps.name",
                    "must not be empty",
                ));
            }
            if !seen.insert(step.name.as_str()) {
                return Err(OrchestrationError::validation(
                    "steps.name",
                    format!("duplicate step name '{}'", step.name),
                ));
            }
        }

        let steps = steps
            .into_iter()
            .map(|mut step| {
                step.reset();
                step
            })
            .collect();

        Ok(Self {
            saga_id: new_saga_id(),
            tenant_id,
            workflow_type,
            status: SagaStatus::Pending,
            current_step: 0,
            steps,
            context: SagaContext::new(),
            failure: None,
            version: 0,
            created_at: now,
            updated_at: now,
        })
    }

    /// Move to `next`, refusing illegal transitions.
    pub fn transition(&mut self, next: SagaStatus, now: Timestamp) -> OrchestrationResult<()> {
        if !self.status.can_transition_to(next) {
            return Err(OrchestrationError::InvalidState {
                saga_id: self.saga_id,
                status: self.status.to_string(),
                action: "transition",
            });
        }
        self.status = next;
        self.updated_at = now;
        Ok(())
    }

    /// Indices of succeeded steps, newest first.
    pub fn compensation_order(&self) -> Vec<usize> {
        self.steps
            .iter()
            .enumerate()
            .rev()
            .filter(|(_, step)| step.status == StepStatus::Succeeded)
            .map(|(index, _)| index)
            .collect()
    }

    /// Idempotency key under which step `index` runs.
    pub fn step_idempotency_key(&self, index: usize) -> String {
        format!("saga:{}:step:{}", self.saga_id, index)
    }

    /// Idempotency key under which the compensation of step `index` runs.
    pub fn compensation_idempotency_key(&self, index: usize) -> String {
        format!("saga:{}:compensate:{}", self.saga_id, index)
    }
}
