//! Meridian Storage - Storage Trait and In-Memory Backend
//!
//! Defines the persistence seam for saga documents and idempotency keys.
//! The coordinator and idempotency manager depend only on
//! [`OrchestrationStorage`]; any backend that provides the conditional
//! primitives atomically (a relational table with row locks, a key-value
//! store with compare-and-set) can stand behind it.

pub mod memory;

pub use memory::InMemoryStorage;

use async_trait::async_trait;
use meridian_core::{
    HealthCheck, IdempotencyKey, IdempotencyStatus, SagaId, SagaStatus, SagaWorkflow,
    StorageResult, Timestamp,
};

/// Outcome of [`OrchestrationStorage::save_idempotency_key_if_absent`].
#[derive(Debug, Clone, PartialEq)]
pub enum IdempotencyClaim {
    /// The record was written; the caller owns the key.
    Claimed(IdempotencyKey),
    /// A live record already blocks the key; it is returned unchanged.
    Existing(IdempotencyKey),
}

/// Async storage trait for orchestration state.
///
/// Every method is a suspension point. Nothing may be assumed persisted
/// unless the call returned `Ok`.
#[async_trait]
pub trait OrchestrationStorage: Send + Sync {
    // ========================================================================
    // SAGA OPERATIONS
    // ========================================================================

    /// Get a saga by ID.
    async fn get_saga(&self, saga_id: SagaId) -> StorageResult<Option<SagaWorkflow>>;

    /// Save a saga with an optimistic version check.
    ///
    /// `saga.version` is the version the caller read. Version 0 inserts and
    /// fails if the id exists. Otherwise the stored version must match.
    /// Returns the new version; the stored document carries it.
    /// Saving a terminal status drops any pending cancellation request.
    async fn save_saga(&self, saga: &SagaWorkflow) -> StorageResult<u64>;

    /// List sagas in a status, oldest `updated_at` first.
    async fn list_sagas_by_status(
        &self,
        status: SagaStatus,
        limit: usize,
    ) -> StorageResult<Vec<SagaWorkflow>>;

    /// Record that an operator asked for the saga to be cancelled. A no-op
    /// for terminal sagas.
    async fn request_saga_cancellation(&self, saga_id: SagaId) -> StorageResult<()>;

    /// Whether cancellation was requested for the saga.
    async fn saga_cancellation_requested(&self, saga_id: SagaId) -> StorageResult<bool>;

    // ========================================================================
    // IDEMPOTENCY OPERATIONS
    // ========================================================================

    /// Get an idempotency key by (tenant, key). Expired records are returned
    /// as stored; callers decide how to treat them.
    async fn get_idempotency_key(
        &self,
        tenant_id: &str,
        key: &str,
    ) -> StorageResult<Option<IdempotencyKey>>;

    /// Atomically write `record` unless a blocking record exists.
    ///
    /// A stored record blocks when it is unexpired at `now` and
    /// `in_progress` or `completed`. Absent, expired, `pending` and `failed`
    /// records are replaced.
    async fn save_idempotency_key_if_absent(
        &self,
        record: &IdempotencyKey,
        now: Timestamp,
    ) -> StorageResult<IdempotencyClaim>;

    /// Overwrite a record whose stored status still equals `expected` and
    /// whose stored `claim_id` matches `record.claim_id`.
    async fn update_idempotency_key(
        &self,
        record: &IdempotencyKey,
        expected: IdempotencyStatus,
    ) -> StorageResult<()>;

    /// Delete records expired at `now`. Returns how many were removed.
    async fn purge_expired_idempotency_keys(&self, now: Timestamp) -> StorageResult<u64>;

    // ========================================================================
    // HEALTH
    // ========================================================================

    async fn health_check(&self) -> HealthCheck;
}
