//! Idempotency key records.
//!
//! A record is created the first time an operation runs under a key and is
//! mutated only by the idempotency manager. Status moves monotonically:
//!
//! ```text
//! pending ──→ in_progress ──→ completed
//!                  │
//!                  └────────→ failed
//! ```
//!
//! Once `expires_at` has passed the record is treated as absent, whatever
//! its status.

use crate::error::StatusParseError;
use crate::{TenantId, Timestamp};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

/// Lifecycle status of an idempotency key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdempotencyStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl IdempotencyStatus {
    /// Convert to persisted string representation.
    pub fn as_db_str(&self) -> &'static str {
        match self {
            IdempotencyStatus::Pending => "pending",
            IdempotencyStatus::InProgress => "in_progress",
            IdempotencyStatus::Completed => "completed",
            IdempotencyStatus::Failed => "failed",
        }
    }

    /// Parse from persisted string representation.
    pub fn from_db_str(s: &str) -> Result<Self, StatusParseError> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(IdempotencyStatus::Pending),
            "in_progress" | "inprogress" => Ok(IdempotencyStatus::InProgress),
            "completed" => Ok(IdempotencyStatus::Completed),
            "failed" => Ok(IdempotencyStatus::Failed),
            _ => Err(StatusParseError {
                kind: "idempotency",
                value: s.to_string(),
            }),
        }
    }

    /// Whether the status is a final outcome.
    pub fn is_terminal(&self) -> bool {
        matches!(self, IdempotencyStatus::Completed | IdempotencyStatus::Failed)
    }

    /// Whether `next` is a legal forward transition from this status.
    pub fn can_transition_to(&self, next: IdempotencyStatus) -> bool {
        use IdempotencyStatus::*;
        matches!(
            (self, next),
            (Pending, InProgress) | (InProgress, Completed) | (InProgress, Failed)
        )
    }
}

impl fmt::Display for IdempotencyStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_db_str())
    }
}

impl FromStr for IdempotencyStatus {
    type Err = StatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_db_str(s)
    }
}

/// A persisted idempotency key.
///
/// Unique per (`tenant_id`, `key`). `result` is only set when `completed`,
/// `error` only when `failed`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdempotencyKey {
    pub key: String,
    pub tenant_id: TenantId,
    pub user_id: String,
    pub operation_type: String,
    pub status: IdempotencyStatus,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    /// Hex SHA-256 of the originating request, when known.
    pub request_hash: Option<String>,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
    pub expires_at: Timestamp,
    /// Identifies the claim that wrote this record. A re-claim after expiry
    /// gets a new id, so a late write from the previous owner is rejected.
    pub claim_id: Uuid,
}

impl IdempotencyKey {
    /// Build a fresh record valid for `ttl` from `now`.
    pub fn new(
        tenant_id: impl Into<TenantId>,
        user_id: impl Into<String>,
        operation_type: impl Into<String>,
        key: impl Into<String>,
        status: IdempotencyStatus,
        ttl: Duration,
        now: Timestamp,
    ) -> Self {
        let ttl = chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX);
        Self {
            key: key.into(),
            tenant_id: tenant_id.into(),
            user_id: user_id.into(),
            operation_type: operation_type.into(),
            status,
            result: None,
            error: None,
            request_hash: None,
            created_at: now,
            updated_at: now,
            expires_at: now.checked_add_signed(ttl).unwrap_or(Timestamp::MAX_UTC),
            claim_id: Uuid::now_v7(),
        }
    }

    /// Attach the hash of the originating request.
    pub fn with_request_hash(mut self, hash: impl Into<String>) -> Self {
        self.request_hash = Some(hash.into());
        self
    }

    /// Check if the record has expired based on current time.
    pub fn is_expired(&self, now: Timestamp) -> bool {
        now >= self.expires_at
    }

    /// Whether this record prevents a new execution under the same key.
    ///
    /// Only live `in_progress` and `completed` records block; `pending` and
    /// `failed` records may be claimed again.
    pub fn blocks_execution(&self, now: Timestamp) -> bool {
        !self.is_expired(now)
            && matches!(
                self.status,
                IdempotencyStatus::InProgress | IdempotencyStatus::Completed
            )
    }

    /// Transition to `completed` with the handler result.
    pub fn complete(&mut self, result: serde_json::Value, now: Timestamp) -> bool {
        if !self.status.can_transition_to(IdempotencyStatus::Completed) {
            return false;
        }
        self.status = IdempotencyStatus::Completed;
        self.result = Some(result);
        self.error = None;
        self.updated_at = now;
        true
    }

    /// Transition to `failed` with the handler error.
    pub fn fail(&mut self, error: impl Into<String>, now: Timestamp) -> bool {
        if !self.status.can_transition_to(IdempotencyStatus::Failed) {
            return false;
        }
        self.status = IdempotencyStatus::Failed;
        self.result = None;
        self.error = Some(error.into());
        self.updated_at = now;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn record(status: IdempotencyStatus) -> IdempotencyKey {
        IdempotencyKey::new(
            "tenant-a",
            "user-1",
            "charge_card",
            "key-1",
            status,
            Duration::from_secs(60),
            Utc::now(),
        )
    }

    #[test]
    fn test_status_db_round_trip() {
        for status in [
            IdempotencyStatus::Pending,
            IdempotencyStatus::InProgress,
            IdempotencyStatus::Completed,
            IdempotencyStatus::Failed,
        ] {
            assert_eq!(IdempotencyStatus::from_db_str(status.as_db_str()), Ok(status));
        }
        assert!(IdempotencyStatus::from_db_str("done").is_err());
    }

    #[test]
    fn test_transitions_are_monotonic() {
        use IdempotencyStatus::*;
        assert!(Pending.can_transition_to(InProgress));
        assert!(InProgress.can_transition_to(Completed));
        assert!(InProgress.can_transition_to(Failed));
        assert!(!Completed.can_transition_to(InProgress));
        assert!(!Failed.can_transition_to(Completed));
        assert!(!Completed.can_transition_to(Failed));
    }

    #[test]
    fn test_complete_rejects_regression() {
        let mut rec = record(IdempotencyStatus::InProgress);
        assert!(rec.complete(serde_json::json!({"ok": true}), Utc::now()));
        assert!(!rec.fail("late failure", Utc::now()));
        assert_eq!(rec.status, IdempotencyStatus::Completed);
        assert!(rec.error.is_none());
    }

    #[test]
    fn test_only_live_in_progress_or_completed_blocks() {
        let now = Utc::now();
        assert!(record(IdempotencyStatus::InProgress).blocks_execution(now));
        assert!(record(IdempotencyStatus::Completed).blocks_execution(now));
        assert!(!record(IdempotencyStatus::Failed).blocks_execution(now));
        assert!(!record(IdempotencyStatus::Pending).blocks_execution(now));

        let later = now + chrono::Duration::seconds(120);
        assert!(!record(IdempotencyStatus::Completed).blocks_execution(later));
    }

    #[test]
    fn test_each_record_gets_its_own_claim_id() {
        let a = record(IdempotencyStatus::InProgress);
        let mut b = record(IdempotencyStatus::InProgress);
        assert_ne!(a.claim_id, b.claim_id);

        let claim_id = b.claim_id;
        b.complete(serde_json::json!(1), Utc::now());
        assert_eq!(b.claim_id, claim_id);
    }

    #[test]
    fn test_serde_uses_snake_case_status() {
        let rec = record(IdempotencyStatus::InProgress);
        let json = serde_json::to_value(&rec).unwrap();
        assert_eq!(json["status"], "in_progress");
    }
}
