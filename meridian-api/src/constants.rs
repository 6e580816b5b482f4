//! HTTP boundary constants.

/// Header carrying the caller's idempotency key.
pub const IDEMPOTENCY_KEY_HEADER: &str = "idempotency-key";

/// Header set on responses served from a completed idempotency key.
pub const IDEMPOTENCY_REPLAY_HEADER: &str = "x-idempotency-replay";

/// Header naming the tenant. Authentication sits in front of this service
/// and is trusted to set it.
pub const TENANT_ID_HEADER: &str = "x-tenant-id";

/// Optional header naming the acting user.
pub const USER_ID_HEADER: &str = "x-user-id";

/// Maximum request body buffered for hashing (1MB).
pub const MAX_BODY_HASH_SIZE: usize = 1024 * 1024;

/// Default tracing filter when `RUST_LOG` is unset.
pub const DEFAULT_LOG_FILTER: &str = "meridian_engine=debug,meridian_api=debug,tower_http=debug,info";

/// Response headers stored with a cached response and restored on replay.
pub const REPLAYED_RESPONSE_HEADERS: &[&str] = &[
    "content-type",
    "content-language",
    "content-location",
    "location",
    "etag",
    "last-modified",
    "cache-control",
];
