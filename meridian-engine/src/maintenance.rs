//! Maintenance Background Task
//!
//! Periodically:
//!
//! - purges expired idempotency keys so the key space does not grow forever
//! - reports sagas stuck in `running` or `compensating` longer than the
//!   configured threshold, usually left behind by a crashed worker
//!
//! Stale sagas are only reported. Resuming them is an operator decision
//! made through [`crate::SagaCoordinator::resume_saga_workflow`].
//!
//! ```ignore
//! let (shutdown_tx, shutdown_rx) = watch::channel(false);
//! let handle = tokio::spawn(maintenance_task(storage, MaintenanceConfig::from_env(), shutdown_rx));
//! // ...
//! let _ = shutdown_tx.send(true);
//! let metrics = handle.await?;
//! ```

use crate::constants::{
    DEFAULT_KEY_PURGE_INTERVAL_SECS, DEFAULT_MAINTENANCE_BATCH_SIZE,
    DEFAULT_MAINTENANCE_CHECK_INTERVAL_SECS, DEFAULT_STALE_SAGA_THRESHOLD_SECS,
};
use crate::idempotency::SharedStorage;
use chrono::Utc;
use meridian_core::{SagaId, SagaStatus};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};

// ============================================================================
// CONFIGURATION
// ============================================================================

/// Configuration for the maintenance background task.
#[derive(Debug, Clone, PartialEq)]
pub struct MaintenanceConfig {
    /// How often to look for stale sagas (default: 60 seconds)
    pub check_interval: Duration,

    /// How often to purge expired idempotency keys (default: 1 hour)
    pub key_purge_interval: Duration,

    /// Sagas not updated for this long while active are stale
    /// (default: 30 minutes)
    pub stale_saga_threshold: Duration,

    /// Maximum sagas inspected per status per cycle (default: 100)
    pub batch_size: usize,

    /// Whether to log each stale saga (default: true)
    pub log_stale_sagas: bool,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(DEFAULT_MAINTENANCE_CHECK_INTERVAL_SECS),
            key_purge_interval: Duration::from_secs(DEFAULT_KEY_PURGE_INTERVAL_SECS),
            stale_saga_threshold: Duration::from_secs(DEFAULT_STALE_SAGA_THRESHOLD_SECS),
            batch_size: DEFAULT_MAINTENANCE_BATCH_SIZE,
            log_stale_sagas: true,
        }
    }
}

impl MaintenanceConfig {
    /// Create MaintenanceConfig from environment variables.
    ///
    /// # Environment Variables
    /// - `MERIDIAN_MAINTENANCE_CHECK_INTERVAL_SECS` (default: 60)
    /// - `MERIDIAN_KEY_PURGE_INTERVAL_SECS` (default: 3600)
    /// - `MERIDIAN_STALE_SAGA_THRESHOLD_SECS` (default: 1800)
    /// - `MERIDIAN_MAINTENANCE_BATCH_SIZE` (default: 100)
    /// - `MERIDIAN_LOG_STALE_SAGAS` (default: true)
    pub fn from_env() -> Self {
        let secs = |name: &str, default: u64| {
            Duration::from_secs(
                std::env::var(name)
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(default),
            )
        };

        let batch_size = std::env::var("MERIDIAN_MAINTENANCE_BATCH_SIZE")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_MAINTENANCE_BATCH_SIZE);

        let log_stale_sagas = std::env::var("MERIDIAN_LOG_STALE_SAGAS")
            .ok()
            .map(|s| s.to_lowercase() != "false")
            .unwrap_or(true);

        Self {
            check_interval: secs(
                "MERIDIAN_MAINTENANCE_CHECK_INTERVAL_SECS",
                DEFAULT_MAINTENANCE_CHECK_INTERVAL_SECS,
            ),
            key_purge_interval: secs(
                "MERIDIAN_KEY_PURGE_INTERVAL_SECS",
                DEFAULT_KEY_PURGE_INTERVAL_SECS,
            ),
            stale_saga_threshold: secs(
                "MERIDIAN_STALE_SAGA_THRESHOLD_SECS",
                DEFAULT_STALE_SAGA_THRESHOLD_SECS,
            ),
            batch_size,
            log_stale_sagas,
        }
    }

    /// Short intervals for development and tests.
    pub fn development() -> Self {
        Self {
            check_interval: Duration::from_secs(10),
            key_purge_interval: Duration::from_secs(60),
            stale_saga_threshold: Duration::from_secs(60),
            batch_size: 10,
            log_stale_sagas: true,
        }
    }

    /// Production settings with a more tolerant stale threshold.
    pub fn production() -> Self {
        Self {
            stale_saga_threshold: Duration::from_secs(3600),
            ..Self::default()
        }
    }
}

// ============================================================================
// METRICS
// ============================================================================

/// Counters for maintenance activity since startup.
#[derive(Debug, Default)]
pub struct MaintenanceMetrics {
    pub idempotency_keys_purged: AtomicU64,
    pub stale_sagas_detected: AtomicU64,
    pub maintenance_cycles: AtomicU64,
    pub maintenance_errors: AtomicU64,
}

impl MaintenanceMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get current snapshot of all metrics.
    pub fn snapshot(&self) -> MaintenanceSnapshot {
        MaintenanceSnapshot {
            idempotency_keys_purged: self.idempotency_keys_purged.load(Ordering::Relaxed),
            stale_sagas_detected: self.stale_sagas_detected.load(Ordering::Relaxed),
            maintenance_cycles: self.maintenance_cycles.load(Ordering::Relaxed),
            maintenance_errors: self.maintenance_errors.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of maintenance metrics at a point in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MaintenanceSnapshot {
    pub idempotency_keys_purged: u64,
    pub stale_sagas_detected: u64,
    pub maintenance_cycles: u64,
    pub maintenance_errors: u64,
}

// ============================================================================
// BACKGROUND TASK
// ============================================================================

/// Run maintenance until the shutdown signal is received.
///
/// Returns the metrics collected during the task's lifetime.
pub async fn maintenance_task(
    storage: SharedStorage,
    config: MaintenanceConfig,
    mut shutdown_rx: watch::Receiver<bool>,
) -> Arc<MaintenanceMetrics> {
    let metrics = Arc::new(MaintenanceMetrics::new());

    let mut check_interval = interval(config.check_interval);
    check_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    let mut purge_interval = interval(config.key_purge_interval);
    purge_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    tracing::info!(
        check_interval_secs = config.check_interval.as_secs(),
        key_purge_interval_secs = config.key_purge_interval.as_secs(),
        stale_saga_threshold_secs = config.stale_saga_threshold.as_secs(),
        "Maintenance task started"
    );

    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    tracing::info!("Maintenance task shutting down");
                    break;
                }
            }

            _ = check_interval.tick() => {
                metrics.maintenance_cycles.fetch_add(1, Ordering::Relaxed);
                detect_stale_sagas(&storage, &config, &metrics).await;
            }

            _ = purge_interval.tick() => {
                purge_expired_keys(&storage, &metrics).await;
            }
        }
    }

    let snapshot = metrics.snapshot();
    tracing::info!(
        idempotency_keys_purged = snapshot.idempotency_keys_purged,
        stale_sagas_detected = snapshot.stale_sagas_detected,
        maintenance_cycles = snapshot.maintenance_cycles,
        maintenance_errors = snapshot.maintenance_errors,
        "Maintenance task completed"
    );

    metrics
}

/// Find active sagas whose last update is older than the stale threshold.
pub async fn detect_stale_sagas(
    storage: &SharedStorage,
    config: &MaintenanceConfig,
    metrics: &MaintenanceMetrics,
) -> Vec<SagaId> {
    let threshold = chrono::Duration::from_std(config.stale_saga_threshold)
        .unwrap_or(chrono::Duration::MAX);
    let cutoff = Utc::now()
        .checked_sub_signed(threshold)
        .unwrap_or(chrono::DateTime::<Utc>::MIN_UTC);

    let mut stale = Vec::new();
    for status in [SagaStatus::Running, SagaStatus::Compensating] {
        let sagas = match storage.list_sagas_by_status(status, config.batch_size).await {
            Ok(sagas) => sagas,
            Err(e) => {
                tracing::error!(error = %e, status = %status, "Failed to list sagas");
                metrics.maintenance_errors.fetch_add(1, Ordering::Relaxed);
                continue;
            }
        };

        // Listed oldest first, so the first fresh saga ends the scan.
        for saga in sagas.into_iter().take_while(|s| s.updated_at < cutoff) {
            if config.log_stale_sagas {
                tracing::warn!(
                    saga_id = %saga.saga_id,
                    tenant_id = %saga.tenant_id,
                    status = %saga.status,
                    current_step = saga.current_step,
                    updated_at = %saga.updated_at,
                    "Stale saga detected"
                );
            }
            stale.push(saga.saga_id);
        }
    }

    if stale.is_empty() {
        tracing::trace!("Maintenance cycle found no stale sagas");
    } else {
        metrics
            .stale_sagas_detected
            .fetch_add(stale.len() as u64, Ordering::Relaxed);
    }
    stale
}

/// Delete expired idempotency keys. Returns how many were removed.
pub async fn purge_expired_keys(storage: &SharedStorage, metrics: &MaintenanceMetrics) -> u64 {
    match storage.purge_expired_idempotency_keys(Utc::now()).await {
        Ok(count) => {
            metrics
                .idempotency_keys_purged
                .fetch_add(count, Ordering::Relaxed);
            if count > 0 {
                tracing::info!(count, "Purged expired idempotency keys");
            }
            count
        }
        Err(e) => {
            tracing::error!(error = %e, "Failed to purge expired idempotency keys");
            metrics.maintenance_errors.fetch_add(1, Ordering::Relaxed);
            0
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
