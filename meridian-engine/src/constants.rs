//! Engine defaults.

/// How often the maintenance job looks for stale sagas.
pub const DEFAULT_MAINTENANCE_CHECK_INTERVAL_SECS: u64 = 60;

/// How often expired idempotency keys are purged.
pub const DEFAULT_KEY_PURGE_INTERVAL_SECS: u64 = 3600;

/// A `running` or `compensating` saga untouched for this long is reported.
pub const DEFAULT_STALE_SAGA_THRESHOLD_SECS: u64 = 1800;

/// Maximum sagas inspected per status per cycle.
pub const DEFAULT_MAINTENANCE_BATCH_SIZE: usize = 100;
