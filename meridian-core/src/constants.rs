//! Constants for Meridian orchestration
//!
//! Defaults for every tunable. Environment variables override them through
//! [`crate::OrchestratorConfig::from_env`].

// ============================================================================
// IDEMPOTENCY
// ============================================================================

/// Default TTL for idempotency keys (24 hours)
pub const DEFAULT_IDEMPOTENCY_TTL_SECS: u64 = 24 * 60 * 60;

/// TTL for keys guarding individual saga steps (7 days)
pub const DEFAULT_STEP_KEY_TTL_SECS: u64 = 7 * 24 * 60 * 60;

/// Maximum accepted idempotency key length
pub const MAX_IDEMPOTENCY_KEY_LEN: usize = 256;

/// Poll interval while waiting on an in-progress key
pub const DEFAULT_IN_PROGRESS_POLL_MS: u64 = 50;

/// How long a waiting caller polls before giving up
pub const DEFAULT_IN_PROGRESS_WAIT_MS: u64 = 30_000;

// ============================================================================
// SAGA EXECUTION
// ============================================================================

/// Default per-attempt step timeout (5 minutes)
pub const DEFAULT_STEP_TIMEOUT_SECS: u64 = 300;

/// First retry delay
pub const DEFAULT_RETRY_INITIAL_BACKOFF_MS: u64 = 100;

/// Upper bound on retry delay
pub const DEFAULT_RETRY_MAX_BACKOFF_MS: u64 = 5_000;

/// Growth factor between retry delays
pub const DEFAULT_RETRY_BACKOFF_MULTIPLIER: f32 = 2.0;
