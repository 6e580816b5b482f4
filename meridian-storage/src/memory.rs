//! In-memory storage backend.
//!
//! Every conditional primitive runs under a single write lock, which makes
//! it atomic with respect to concurrent callers in the same process. Used
//! by tests and single-node deployments.

use crate::{IdempotencyClaim, OrchestrationStorage};
use async_trait::async_trait;
use meridian_core::{
    HealthCheck, IdempotencyKey, IdempotencyStatus, SagaId, SagaStatus, SagaWorkflow,
    StorageError, StorageResult, Timestamp,
};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Instant;

type TenantKey = (String, String);

/// In-memory storage for sagas and idempotency keys.
#[derive(Debug, Default, Clone)]
pub struct InMemoryStorage {
    sagas: Arc<RwLock<HashMap<SagaId, SagaWorkflow>>>,
    idempotency_keys: Arc<RwLock<HashMap<TenantKey, IdempotencyKey>>>,
    cancellations: Arc<RwLock<HashSet<SagaId>>>,
    // Fault injection: when set every call fails with `Unavailable`.
    offline: Arc<AtomicBool>,
}

impl InMemoryStorage {
    /// Create a new empty storage.
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate an outage. While offline every call fails.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Number of stored sagas.
    pub fn saga_count(&self) -> StorageResult<usize> {
        Ok(self
            .sagas
            .read()
            .map_err(|_| StorageError::LockPoisoned)?
            .len())
    }

    /// Number of stored idempotency keys, expired ones included.
    pub fn idempotency_key_count(&self) -> StorageResult<usize> {
        Ok(self
            .idempotency_keys
            .read()
            .map_err(|_| StorageError::LockPoisoned)?
            .len())
    }

    fn ensure_online(&self) -> StorageResult<()> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(StorageError::Unavailable {
                reason: "in-memory storage is offline".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl OrchestrationStorage for InMemoryStorage {
    async fn get_saga(&self, saga_id: SagaId) -> StorageResult<Option<SagaWorkflow>> {
        self.ensure_online()?;
        let sagas = self.sagas.read().map_err(|_| StorageError::LockPoisoned)?;
        Ok(sagas.get(&saga_id).cloned())
    }

    async fn save_saga(&self, saga: &SagaWorkflow) -> StorageResult<u64> {
        self.ensure_online()?;
        let mut sagas = self.sagas.write().map_err(|_| StorageError::LockPoisoned)?;

        let found = sagas.get(&saga.saga_id).map(|s| s.version).unwrap_or(0);
        let exists = sagas.contains_key(&saga.saga_id);
        if (saga.version == 0 && exists) || (saga.version != 0 && found != saga.version) {
            tracing::debug!(
                saga_id = %saga.saga_id,
                expected = saga.version,
                found,
                "Rejected stale saga write"
            );
            return Err(StorageError::VersionConflict {
                saga_id: saga.saga_id,
                expected: saga.version,
                found,
            });
        }

        if saga.status.is_terminal() {
            self.cancellations
                .write()
                .map_err(|_| StorageError::LockPoisoned)?
                .remove(&saga.saga_id);
        }

        let mut stored = saga.clone();
        stored.version = saga.version + 1;
        let version = stored.version;
        sagas.insert(saga.saga_id, stored);
        Ok(version)
    }

    async fn list_sagas_by_status(
        &self,
        status: SagaStatus,
        limit: usize,
    ) -> StorageResult<Vec<SagaWorkflow>> {
        self.ensure_online()?;
        let sagas = self.sagas.read().map_err(|_| StorageError::LockPoisoned)?;
        let mut matching: Vec<SagaWorkflow> = sagas
            .values()
            .filter(|s| s.status == status)
            .cloned()
            .collect();
        matching.sort_by_key(|s| s.updated_at);
        matching.truncate(limit);
        Ok(matching)
    }

    async fn request_saga_cancellation(&self, saga_id: SagaId) -> StorageResult<()> {
        self.ensure_online()?;
        // Held across the insert so a concurrent terminal save cannot slip
        // between the check and the flag.
        let sagas = self.sagas.read().map_err(|_| StorageError::LockPoisoned)?;
        let Some(saga) = sagas.get(&saga_id) else {
            return Err(StorageError::NotFound {
                kind: "saga",
                id: saga_id.to_string(),
            });
        };
        if saga.status.is_terminal() {
            return Ok(());
        }
        self.cancellations
            .write()
            .map_err(|_| StorageError::LockPoisoned)?
            .insert(saga_id);
        Ok(())
    }

    async fn saga_cancellation_requested(&self, saga_id: SagaId) -> StorageResult<bool> {
        self.ensure_online()?;
        Ok(self
            .cancellations
            .read()
            .map_err(|_| StorageError::LockPoisoned)?
            .contains(&saga_id))
    }

    async fn get_idempotency_key(
        &self,
        tenant_id: &str,
        key: &str,
    ) -> StorageResult<Option<IdempotencyKey>> {
        self.ensure_online()?;
        let keys = self
            .idempotency_keys
            .read()
            .map_err(|_| StorageError::LockPoisoned)?;
        Ok(keys
            .get(&(tenant_id.to_string(), key.to_string()))
            .cloned())
    }

    async fn save_idempotency_key_if_absent(
        &self,
        record: &IdempotencyKey,
        now: Timestamp,
    ) -> StorageResult<IdempotencyClaim> {
        self.ensure_online()?;
        let mut keys = self
            .idempotency_keys
            .write()
            .map_err(|_| StorageError::LockPoisoned)?;
        let id = (record.tenant_id.clone(), record.key.clone());

        if let Some(existing) = keys.get(&id) {
            if existing.blocks_execution(now) {
                return Ok(IdempotencyClaim::Existing(existing.clone()));
            }
        }
        keys.insert(id, record.clone());
        Ok(IdempotencyClaim::Claimed(record.clone()))
    }

    async fn update_idempotency_key(
        &self,
        record: &IdempotencyKey,
        expected: IdempotencyStatus,
    ) -> StorageResult<()> {
        self.ensure_online()?;
        let mut keys = self
            .idempotency_keys
            .write()
            .map_err(|_| StorageError::LockPoisoned)?;
        let id = (record.tenant_id.clone(), record.key.clone());

        match keys.get(&id) {
            None => Err(StorageError::NotFound {
                kind: "idempotency_key",
                id: record.key.clone(),
            }),
            Some(stored) if stored.claim_id != record.claim_id => {
                Err(StorageError::ConditionFailed {
                    kind: "idempotency_key",
                    id: record.key.clone(),
                    reason: "key was re-claimed by another caller".to_string(),
                })
            }
            Some(stored) if stored.status != expected => Err(StorageError::ConditionFailed {
                kind: "idempotency_key",
                id: record.key.clone(),
                reason: format!("expected status {}, found {}", expected, stored.status),
            }),
            Some(_) => {
                keys.insert(id, record.clone());
                Ok(())
            }
        }
    }

    async fn purge_expired_idempotency_keys(&self, now: Timestamp) -> StorageResult<u64> {
        self.ensure_online()?;
        let mut keys = self
            .idempotency_keys
            .write()
            .map_err(|_| StorageError::LockPoisoned)?;
        let before = keys.len();
        keys.retain(|_, record| !record.is_expired(now));
        Ok((before - keys.len()) as u64)
    }

    async fn health_check(&self) -> HealthCheck {
        let started = Instant::now();
        if self.offline.load(Ordering::SeqCst) {
            return HealthCheck::unhealthy("storage", "in-memory storage is offline");
        }
        let counts = self.saga_count().and_then(|sagas| {
            self.idempotency_key_count().map(|keys| (sagas, keys))
        });
        match counts {
            Ok((sagas, keys)) => HealthCheck::healthy("storage")
                .with_response_time(started.elapsed().as_millis() as i64)
                .with_metadata("backend", serde_json::json!("memory"))
                .with_metadata("sagas", serde_json::json!(sagas))
                .with_metadata("idempotency_keys", serde_json::json!(keys)),
            Err(e) => HealthCheck::unhealthy("storage", e.to_string()),
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
