//! Idempotency manager.
//!
//! Wraps single-shot operations so the orchestrator invokes them at most
//! once per (tenant, key):
//!
//! 1. Atomically claim the key as `in_progress` through the storage's
//!    conditional write.
//! 2. A live `completed` record replays its cached result.
//! 3. A live `in_progress` record fails with `OperationInProgress`.
//! 4. Otherwise run the handler and persist `completed` or `failed`.
//!
//! Failures are never cached as success: a `failed` record is claimed
//! again by the next call with the same key.

use crate::registry::OperationRegistry;
use chrono::Utc;
use meridian_core::constants::MAX_IDEMPOTENCY_KEY_LEN;
use meridian_core::{
    HandlerError, IdempotencyKey, IdempotencyStatus, OperationRequest, OrchestrationError,
    OrchestrationResult, OrchestratorConfig, StorageError, TenantId,
};
use meridian_storage::{IdempotencyClaim, OrchestrationStorage};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Shared storage handle.
pub type SharedStorage = Arc<dyn OrchestrationStorage>;

/// Identity of one idempotent invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct IdempotentCall {
    pub tenant_id: TenantId,
    pub user_id: String,
    pub key: String,
    pub operation_type: String,
    /// Falls back to the configured default TTL.
    pub ttl: Option<Duration>,
    /// Fingerprint of the request; a replay with a different one is refused.
    pub request_hash: Option<String>,
}

impl IdempotentCall {
    pub fn new(
        tenant_id: impl Into<TenantId>,
        key: impl Into<String>,
        operation_type: impl Into<String>,
    ) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            user_id: String::new(),
            key: key.into(),
            operation_type: operation_type.into(),
            ttl: None,
            request_hash: None,
        }
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = user_id.into();
        self
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn with_request_hash(mut self, hash: impl Into<String>) -> Self {
        self.request_hash = Some(hash.into());
        self
    }
}

/// Result of an idempotent execution.
#[derive(Debug, Clone, PartialEq)]
pub struct IdempotentOutcome {
    pub result: serde_json::Value,
    /// True when the result came from an earlier execution.
    pub replayed: bool,
    pub record: IdempotencyKey,
}

enum Claim {
    Owned(IdempotencyKey),
    Replay(IdempotencyKey),
    Busy,
}

/// Issues, checks and resolves idempotency keys.
///
/// Stateless apart from its injected collaborators; any number of
/// instances may share one storage backend.
#[derive(Clone)]
pub struct IdempotencyManager {
    storage: SharedStorage,
    registry: Arc<OperationRegistry>,
    config: OrchestratorConfig,
}

impl IdempotencyManager {
    pub fn new(
        storage: SharedStorage,
        registry: Arc<OperationRegistry>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            storage,
            registry,
            config,
        }
    }

    /// Look up a live record. Expired records read as absent.
    pub async fn check_idempotency(
        &self,
        tenant_id: &str,
        key: &str,
    ) -> OrchestrationResult<Option<IdempotencyKey>> {
        let record = self.storage.get_idempotency_key(tenant_id, key).await?;
        Ok(record.filter(|r| !r.is_expired(Utc::now())))
    }

    /// Reserve a key in `pending` state without running anything.
    ///
    /// Fails with `AlreadyExists` when a live record is `in_progress` or
    /// `completed`.
    pub async fn create_idempotency_key(
        &self,
        tenant_id: &str,
        user_id: &str,
        operation_type: &str,
        key: &str,
        ttl: Option<Duration>,
    ) -> OrchestrationResult<IdempotencyKey> {
        validate_key(key)?;
        let now = Utc::now();
        let record = IdempotencyKey::new(
            tenant_id,
            user_id,
            operation_type,
            key,
            IdempotencyStatus::Pending,
            ttl.unwrap_or(self.config.default_idempotency_ttl),
            now,
        );
        match self
            .storage
            .save_idempotency_key_if_absent(&record, now)
            .await?
        {
            IdempotencyClaim::Claimed(record) => Ok(record),
            IdempotencyClaim::Existing(_) => Err(OrchestrationError::AlreadyExists {
                tenant_id: tenant_id.to_string(),
                key: key.to_string(),
            }),
        }
    }

    /// Run `handler` at most once for `call.key`.
    pub async fn execute_idempotent<F, Fut>(
        &self,
        call: &IdempotentCall,
        handler: F,
    ) -> OrchestrationResult<IdempotentOutcome>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<serde_json::Value, HandlerError>>,
    {
        match self.claim(call).await? {
            Claim::Owned(record) => self.run_owned(call, record, handler).await,
            Claim::Replay(record) => Ok(replay(record)),
            Claim::Busy => Err(OrchestrationError::OperationInProgress {
                tenant_id: call.tenant_id.clone(),
                key: call.key.clone(),
            }),
        }
    }

    /// Like [`Self::execute_idempotent`], but waits for a concurrent
    /// execution of the same key to finish instead of failing.
    ///
    /// If the concurrent execution fails, this caller claims the key and
    /// runs `handler` itself.
    pub async fn execute_idempotent_or_wait<F, Fut>(
        &self,
        call: &IdempotentCall,
        handler: F,
    ) -> OrchestrationResult<IdempotentOutcome>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<serde_json::Value, HandlerError>>,
    {
        let deadline = Instant::now() + self.config.in_progress_wait_timeout;
        loop {
            match self.claim(call).await? {
                Claim::Owned(record) => return self.run_owned(call, record, handler).await,
                Claim::Replay(record) => return Ok(replay(record)),
                Claim::Busy => {
                    if Instant::now() >= deadline {
                        return Err(OrchestrationError::OperationInProgress {
                            tenant_id: call.tenant_id.clone(),
                            key: call.key.clone(),
                        });
                    }
                    tokio::time::sleep(self.config.in_progress_poll_interval).await;
                }
            }
        }
    }

    /// Run the registered handler for `call.operation_type` idempotently.
    pub async fn execute_registered(
        &self,
        call: &IdempotentCall,
        parameters: serde_json::Value,
    ) -> OrchestrationResult<IdempotentOutcome> {
        let handler = self.registry.resolve_handler(&call.operation_type)?;
        let request = OperationRequest::new(call.tenant_id.clone(), parameters);
        self.execute_idempotent(call, move || async move { handler.call(request).await })
            .await
    }

    async fn claim(&self, call: &IdempotentCall) -> OrchestrationResult<Claim> {
        validate_key(&call.key)?;
        let now = Utc::now();
        let mut record = IdempotencyKey::new(
            call.tenant_id.clone(),
            call.user_id.clone(),
            call.operation_type.clone(),
            call.key.clone(),
            IdempotencyStatus::InProgress,
            call.ttl.unwrap_or(self.config.default_idempotency_ttl),
            now,
        );
        record.request_hash = call.request_hash.clone();

        match self
            .storage
            .save_idempotency_key_if_absent(&record, now)
            .await?
        {
            IdempotencyClaim::Claimed(record) => Ok(Claim::Owned(record)),
            IdempotencyClaim::Existing(existing) => {
                if let (Some(stored), Some(incoming)) = (&existing.request_hash, &call.request_hash)
                {
                    if stored != incoming {
                        tracing::warn!(
                            tenant_id = %call.tenant_id,
                            key = %call.key,
                            "Idempotency key reused with a different request"
                        );
                        return Err(OrchestrationError::AlreadyExists {
                            tenant_id: call.tenant_id.clone(),
                            key: call.key.clone(),
                        });
                    }
                }
                match existing.status {
                    IdempotencyStatus::Completed => Ok(Claim::Replay(existing)),
                    _ => Ok(Claim::Busy),
                }
            }
        }
    }

    async fn run_owned<F, Fut>(
        &self,
        call: &IdempotentCall,
        mut record: IdempotencyKey,
        handler: F,
    ) -> OrchestrationResult<IdempotentOutcome>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<serde_json::Value, HandlerError>>,
    {
        tracing::debug!(
            tenant_id = %call.tenant_id,
            key = %call.key,
            operation = %call.operation_type,
            "Executing idempotent operation"
        );

        match handler().await {
            Ok(result) => {
                record.complete(result.clone(), Utc::now());
                self.record_outcome(call, &record).await?;
                Ok(IdempotentOutcome {
                    result,
                    replayed: false,
                    record,
                })
            }
            Err(err) => {
                record.fail(err.message.clone(), Utc::now());
                self.record_outcome(call, &record).await?;
                tracing::info!(
                    key = %call.key,
                    operation = %call.operation_type,
                    error = %err,
                    "Idempotent operation failed"
                );
                Err(OrchestrationError::handler_failure(
                    call.operation_type.clone(),
                    err,
                ))
            }
        }
    }

    /// Persist the owner's terminal record.
    ///
    /// If the claim expired and another caller re-claimed the key, the
    /// stored record belongs to them and is left untouched.
    async fn record_outcome(
        &self,
        call: &IdempotentCall,
        record: &IdempotencyKey,
    ) -> OrchestrationResult<()> {
        match self
            .storage
            .update_idempotency_key(record, IdempotencyStatus::InProgress)
            .await
        {
            Ok(()) => Ok(()),
            Err(StorageError::ConditionFailed { reason, .. }) => {
                tracing::warn!(
                    tenant_id = %call.tenant_id,
                    key = %call.key,
                    reason = %reason,
                    "Idempotency claim lost before the outcome was recorded"
                );
                Ok(())
            }
            Err(e) => {
                tracing::error!(
                    error = %e,
                    key = %call.key,
                    "Failed to persist idempotency outcome"
                );
                Err(e.into())
            }
        }
    }
}

fn replay(record: IdempotencyKey) -> IdempotentOutcome {
    tracing::debug!(key = %record.key, "Returning cached result for idempotency key");
    IdempotentOutcome {
        result: record.result.clone().unwrap_or(serde_json::Value::Null),
        replayed: true,
        record,
    }
}

fn validate_key(key: &str) -> OrchestrationResult<()> {
    if key.is_empty() || key.len() > MAX_IDEMPOTENCY_KEY_LEN {
        return Err(OrchestrationError::validation(
            "idempotency_key",
            format!("must be 1-{} characters", MAX_IDEMPOTENCY_KEY_LEN),
        ));
    }
    Ok(())
}

// ============================================================================
// TESTS
// ============================================================================
