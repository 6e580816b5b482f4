//! Orchestrator configuration
//!
//! Loaded from environment variables with defaults from [`crate::constants`].

use crate::constants::*;
use crate::error::{OrchestrationError, OrchestrationResult};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Backoff applied between retries of a failed saga step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub backoff_multiplier: f32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_millis(DEFAULT_RETRY_INITIAL_BACKOFF_MS),
            max_backoff: Duration::from_millis(DEFAULT_RETRY_MAX_BACKOFF_MS),
            backoff_multiplier: DEFAULT_RETRY_BACKOFF_MULTIPLIER,
        }
    }
}

impl RetryPolicy {
    /// No delay between retries. Used by tests.
    pub fn immediate() -> Self {
        Self {
            initial_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
            backoff_multiplier: 1.0,
        }
    }

    /// Delay before retry number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        if attempt == 0 || self.initial_backoff.is_zero() {
            return Duration::ZERO;
        }
        let factor = self.backoff_multiplier.max(1.0).powi(attempt as i32 - 1);
        let millis = self.initial_backoff.as_millis() as f64 * factor as f64;
        let capped = millis.min(self.max_backoff.as_millis() as f64);
        Duration::from_millis(capped as u64)
    }
}

/// Runtime configuration shared by the idempotency manager and coordinator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// TTL for keys created without an explicit TTL.
    pub default_idempotency_ttl: Duration,
    /// TTL for the keys guarding saga step attempts.
    pub step_key_ttl: Duration,
    /// Per-attempt timeout for steps that do not set their own.
    pub default_step_timeout: Duration,
    pub retry: RetryPolicy,
    /// Poll interval used by `execute_idempotent_or_wait`.
    pub in_progress_poll_interval: Duration,
    /// Give-up deadline used by `execute_idempotent_or_wait`.
    pub in_progress_wait_timeout: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            default_idempotency_ttl: Duration::from_secs(DEFAULT_IDEMPOTENCY_TTL_SECS),
            step_key_ttl: Duration::from_secs(DEFAULT_STEP_KEY_TTL_SECS),
            default_step_timeout: Duration::from_secs(DEFAULT_STEP_TIMEOUT_SECS),
            retry: RetryPolicy::default(),
            in_progress_poll_interval: Duration::from_millis(DEFAULT_IN_PROGRESS_POLL_MS),
            in_progress_wait_timeout: Duration::from_millis(DEFAULT_IN_PROGRESS_WAIT_MS),
        }
    }
}

impl OrchestratorConfig {
    /// Create OrchestratorConfig from environment variables.
    ///
    /// # Environment Variables
    /// - `MERIDIAN_IDEMPOTENCY_TTL_SECS`: Default key TTL (default: 86400)
    /// - `MERIDIAN_STEP_KEY_TTL_SECS`: Step key TTL (default: 604800)
    /// - `MERIDIAN_STEP_TIMEOUT_SECS`: Default step timeout (default: 300)
    /// - `MERIDIAN_RETRY_INITIAL_BACKOFF_MS`: First retry delay (default: 100)
    /// - `MERIDIAN_RETRY_MAX_BACKOFF_MS`: Retry delay cap (default: 5000)
    /// - `MERIDIAN_RETRY_BACKOFF_MULTIPLIER`: Delay growth factor (default: 2.0)
    /// - `MERIDIAN_IN_PROGRESS_POLL_MS`: Wait poll interval (default: 50)
    /// - `MERIDIAN_IN_PROGRESS_WAIT_MS`: Wait deadline (default: 30000)
    pub fn from_env() -> Self {
        Self {
            default_idempotency_ttl: Duration::from_secs(env_or(
                "MERIDIAN_IDEMPOTENCY_TTL_SECS",
                DEFAULT_IDEMPOTENCY_TTL_SECS,
            )),
            step_key_ttl: Duration::from_secs(env_or(
                "MERIDIAN_STEP_KEY_TTL_SECS",
                DEFAULT_STEP_KEY_TTL_SECS,
            )),
            default_step_timeout: Duration::from_secs(env_or(
                "MERIDIAN_STEP_TIMEOUT_SECS",
                DEFAULT_STEP_TIMEOUT_SECS,
            )),
            retry: RetryPolicy {
                initial_backoff: Duration::from_millis(env_or(
                    "MERIDIAN_RETRY_INITIAL_BACKOFF_MS",
                    DEFAULT_RETRY_INITIAL_BACKOFF_MS,
                )),
                max_backoff: Duration::from_millis(env_or(
                    "MERIDIAN_RETRY_MAX_BACKOFF_MS",
                    DEFAULT_RETRY_MAX_BACKOFF_MS,
                )),
                backoff_multiplier: env_or(
                    "MERIDIAN_RETRY_BACKOFF_MULTIPLIER",
                    DEFAULT_RETRY_BACKOFF_MULTIPLIER,
                ),
            },
            in_progress_poll_interval: Duration::from_millis(env_or(
                "MERIDIAN_IN_PROGRESS_POLL_MS",
                DEFAULT_IN_PROGRESS_POLL_MS,
            )),
            in_progress_wait_timeout: Duration::from_millis(env_or(
                "MERIDIAN_IN_PROGRESS_WAIT_MS",
                DEFAULT_IN_PROGRESS_WAIT_MS,
            )),
        }
    }

    /// Validate the configuration.
    pub fn validate(&self) -> OrchestrationResult<()> {
        if self.default_idempotency_ttl.is_zero() {
            return Err(OrchestrationError::validation(
                "default_idempotency_ttl",
                "must be positive",
            ));
        }
        if self.step_key_ttl.is_zero() {
            return Err(OrchestrationError::validation("step_key_ttl", "must be positive"));
        }
        if self.default_step_timeout.is_zero() {
            return Err(OrchestrationError::validation(
                "default_step_timeout",
                "must be positive",
            ));
        }
        if self.retry.max_backoff < self.retry.initial_backoff {
            return Err(OrchestrationError::validation(
                "retry.max_backoff",
                "must not be smaller than retry.initial_backoff",
            ));
        }
        if !self.retry.backoff_multiplier.is_finite() || self.retry.backoff_multiplier < 1.0 {
            return Err(OrchestrationError::validation(
                "retry.backoff_multiplier",
                "must be a finite value >= 1.0",
            ));
        }
        if self.in_progress_poll_interval.is_zero() {
            return Err(OrchestrationError::validation(
                "in_progress_poll_interval",
                "must be positive",
            ));
        }
        Ok(())
    }

    /// Configuration for tests: no backoff, short waits.
    pub fn for_tests() -> Self {
        Self {
            default_step_timeout: Duration::from_secs(5),
            retry: RetryPolicy::immediate(),
            in_progress_poll_interval: Duration::from_millis(5),
            in_progress_wait_timeout: Duration::from_secs(5),
            ..Self::default()
        }
    }
}

fn env_or<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(OrchestratorConfig::default().validate().is_ok());
        assert!(OrchestratorConfig::for_tests().validate().is_ok());
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(0), Duration::ZERO);
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(400));
        assert_eq!(policy.delay_for(20), Duration::from_millis(5_000));
    }

    #[test]
    fn test_immediate_policy_never_sleeps() {
        let policy = RetryPolicy::immediate();
        assert_eq!(policy.delay_for(5), Duration::ZERO);
    }

    #[test]
    fn test_validate_rejects_inverted_backoff() {
        let mut config = OrchestratorConfig::default();
        config.retry.max_backoff = Duration::from_millis(1);
        assert!(matches!(
            config.validate(),
            Err(OrchestrationError::Validation { .. })
        ));
    }

    #[test]
    fn test_validate_rejects_shrinking_multiplier() {
        let mut config = OrchestratorConfig::default();
        config.retry.backoff_multiplier = 0.5;
        assert!(config.validate().is_err());
    }

    proptest::proptest! {
        #[test]
        fn prop_backoff_is_monotonic_and_bounded(
            initial_ms in 1u64..1_000,
            extra_ms in 0u64..10_000,
            multiplier in 1.0f32..4.0,
            attempt in 1u32..30,
        ) {
            let policy = RetryPolicy {
                initial_backoff: Duration::from_millis(initial_ms),
                max_backoff: Duration::from_millis(initial_ms + extra_ms),
                backoff_multiplier: multiplier,
            };
            let current = policy.delay_for(attempt);
            let next = policy.delay_for(attempt + 1);
            proptest::prop_assert!(current <= next);
            proptest::prop_assert!(next <= policy.max_backoff);
        }
    }
}
