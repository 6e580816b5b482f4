//! Idempotency Middleware
//!
//! Idempotency key support for POST/PUT/PATCH/DELETE requests, backed by
//! the [`IdempotencyManager`]. A request carrying an `Idempotency-Key`
//! header is executed at most once per (tenant, key):
//!
//! 1. Key completed with the same request hash: cached response replayed
//!    with `x-idempotency-replay: true`, the handler is not entered
//! 2. Key used with a different request hash: 409 Conflict
//! 3. Key currently in progress: 409 Conflict, the client retries later
//! 4. Otherwise: the request runs and its response is recorded
//!
//! The cached response keeps the status, the exact body bytes and an
//! allow-list of headers (`content-type`, `location`, ...). 5xx responses
//! and bodies too large to buffer are recorded as failed, so a retry
//! re-executes the request. 4xx responses are cached like successes.
//!
//! ```ignore
//! let state = IdempotencyLayerState::new(app_state.idempotency.clone());
//! let app = Router::new()
//!     .route("/v1/tenants", post(provision_tenant))
//!     .layer(middleware::from_fn_with_state(state, idempotency_middleware));
//! ```

use crate::constants::{
    IDEMPOTENCY_KEY_HEADER, IDEMPOTENCY_REPLAY_HEADER, MAX_BODY_HASH_SIZE,
    REPLAYED_RESPONSE_HEADERS,
};
use crate::error::{ApiError, ErrorCode};
use crate::extractors::{tenant_from_parts, user_from_parts};
use axum::{
    body::{Body, Bytes, HttpBody},
    extract::{Request, State},
    http::{header, HeaderMap, Method, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use meridian_core::constants::{DEFAULT_IDEMPOTENCY_TTL_SECS, MAX_IDEMPOTENCY_KEY_LEN};
use meridian_core::{HandlerError, OrchestrationError};
use meridian_engine::{IdempotencyManager, IdempotentCall};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::time::Duration;

// ============================================================================
// STATE
// ============================================================================

/// Configuration for idempotency middleware.
#[derive(Debug, Clone, PartialEq)]
pub struct IdempotencyLayerConfig {
    /// Request header carrying the key
    pub header_name: String,

    /// Time-to-live for idempotency keys
    pub ttl: Duration,

    /// Maximum request and response body size buffered
    pub max_body_size: usize,

    /// Whether to require idempotency keys on mutating requests
    pub require_key: bool,
}

impl Default for IdempotencyLayerConfig {
    fn default() -> Self {
        Self {
            header_name: IDEMPOTENCY_KEY_HEADER.to_string(),
            ttl: Duration::from_secs(DEFAULT_IDEMPOTENCY_TTL_SECS),
            max_body_size: MAX_BODY_HASH_SIZE,
            require_key: false,
        }
    }
}

impl IdempotencyLayerConfig {
    /// # Environment Variables
    /// - `MERIDIAN_HTTP_IDEMPOTENCY_HEADER` (default: idempotency-key)
    /// - `MERIDIAN_HTTP_IDEMPOTENCY_TTL_SECS` (default: 86400)
    /// - `MERIDIAN_HTTP_MAX_BODY_BYTES` (default: 1048576)
    /// - `MERIDIAN_HTTP_REQUIRE_IDEMPOTENCY_KEY` (default: false)
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            header_name: std::env::var("MERIDIAN_HTTP_IDEMPOTENCY_HEADER")
                .map(|s| s.to_ascii_lowercase())
                .unwrap_or(defaults.header_name),
            ttl: std::env::var("MERIDIAN_HTTP_IDEMPOTENCY_TTL_SECS")
                .ok()
                .and_then(|s| s.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.ttl),
            max_body_size: std::env::var("MERIDIAN_HTTP_MAX_BODY_BYTES")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.max_body_size),
            require_key: std::env::var("MERIDIAN_HTTP_REQUIRE_IDEMPOTENCY_KEY")
                .map(|s| s == "true" || s == "1")
                .unwrap_or(defaults.require_key),
        }
    }
}

/// Shared state for idempotency middleware.
#[derive(Clone)]
pub struct IdempotencyLayerState {
    pub manager: IdempotencyManager,
    pub config: IdempotencyLayerConfig,
}

impl IdempotencyLayerState {
    pub fn new(manager: IdempotencyManager) -> Self {
        Self {
            manager,
            config: IdempotencyLayerConfig::default(),
        }
    }

    pub fn with_config(manager: IdempotencyManager, config: IdempotencyLayerConfig) -> Self {
        Self { manager, config }
    }
}

// ============================================================================
// MIDDLEWARE
// ============================================================================

/// Axum middleware for idempotency key handling.
///
/// GET, HEAD and OPTIONS requests are passed through unchanged, as are
/// mutating requests without a key unless `require_key` is set.
pub async fn idempotency_middleware(
    State(state): State<IdempotencyLayerState>,
    request: Request,
    next: Next,
) -> Result<Response, IdempotencyError> {
    let method = request.method().clone();
    if !is_mutating_method(&method) {
        return Ok(next.run(request).await);
    }

    let idempotency_key = match request.headers().get(state.config.header_name.as_str()) {
        Some(value) => {
            let key = value.to_str().map_err(|_| {
                IdempotencyError::InvalidKey("Idempotency key must be visible ASCII".to_string())
            })?;
            if key.is_empty() || key.len() > MAX_IDEMPOTENCY_KEY_LEN {
                return Err(IdempotencyError::InvalidKey(format!(
                    "Idempotency key must be 1-{} characters",
                    MAX_IDEMPOTENCY_KEY_LEN
                )));
            }
            key.to_string()
        }
        None => {
            if state.config.require_key {
                return Err(IdempotencyError::MissingKey);
            }
            return Ok(next.run(request).await);
        }
    };

    let (parts, body) = request.into_parts();
    let tenant_id = tenant_from_parts(&parts).map_err(|_| IdempotencyError::MissingTenant)?;
    let user_id = user_from_parts(&parts);
    let operation = extract_operation_name(parts.uri.path(), &method);

    let max_body_size = state.config.max_body_size;
    let body_bytes = axum::body::to_bytes(body, max_body_size)
        .await
        .map_err(|_| IdempotencyError::BodyTooLarge(max_body_size))?;
    let request_hash = compute_request_hash(&method, parts.uri.path(), &body_bytes);

    let call = IdempotentCall::new(tenant_id, idempotency_key.clone(), operation)
        .with_user(user_id)
        .with_ttl(state.config.ttl)
        .with_request_hash(request_hash);

    let request = Request::from_parts(parts, Body::from(body_bytes));
    let mut live_response: Option<Response> = None;
    let slot = &mut live_response;

    let outcome = state
        .manager
        .execute_idempotent(&call, move || async move {
            let response = next.run(request).await;
            let status = response.status();
            let (resp_parts, resp_body) = response.into_parts();

            // Bodies that cannot be buffered whole are streamed through and
            // the key is recorded as failed, so a retry runs again.
            if !fits_cache_limit(&resp_body, max_body_size) {
                tracing::warn!(
                    status = %status,
                    limit = max_body_size,
                    "Response body too large to cache, passing through"
                );
                *slot = Some(Response::from_parts(resp_parts, resp_body));
                return Err(HandlerError::permanent(format!(
                    "response body exceeds {} bytes and was not cached",
                    max_body_size
                )));
            }

            let resp_bytes = match axum::body::to_bytes(resp_body, max_body_size).await {
                Ok(bytes) => bytes,
                Err(e) => {
                    *slot = Some(ApiError::internal_error("Failed to read response body").into_response());
                    return Err(HandlerError::permanent(format!(
                        "failed to read response body: {}",
                        e
                    )));
                }
            };
            let record = CachedResponse::capture(status, &resp_parts.headers, &resp_bytes).to_value();
            *slot = Some(Response::from_parts(resp_parts, Body::from(resp_bytes)));

            if status.is_server_error() {
                Err(HandlerError::new(format!("request failed with status {}", status)))
            } else {
                record
            }
        })
        .await;

    match outcome {
        Ok(outcome) if outcome.replayed => {
            tracing::debug!(
                idempotency_key = %idempotency_key,
                "Returning cached response for idempotency key"
            );
            replay_response(&outcome.result)
        }
        Ok(_) | Err(OrchestrationError::HandlerFailure { .. }) => live_response
            .ok_or_else(|| IdempotencyError::Internal("Response was not captured".to_string())),
        Err(OrchestrationError::AlreadyExists { .. }) => {
            Err(IdempotencyError::Conflict(idempotency_key))
        }
        Err(OrchestrationError::OperationInProgress { .. }) => {
            Err(IdempotencyError::InProgress(idempotency_key))
        }
        Err(OrchestrationError::Validation { reason, .. }) => {
            Err(IdempotencyError::InvalidKey(reason))
        }
        Err(other) => Err(IdempotencyError::Orchestration(other)),
    }
}

// ============================================================================
// HELPER FUNCTIONS
// ============================================================================

/// Check if the HTTP method is a mutating operation.
fn is_mutating_method(method: &Method) -> bool {
    matches!(
        *method,
        Method::POST | Method::PUT | Method::PATCH | Method::DELETE
    )
}

/// Derive an operation name from the request path and method.
fn extract_operation_name(path: &str, method: &Method) -> String {
    // Last segment that is not an id.
    let resource = path
        .trim_end_matches('/')
        .rsplit('/')
        .find(|s| !s.is_empty() && uuid::Uuid::parse_str(s).is_err())
        .unwrap_or("unknown");

    format!("{}_{}", method.as_str().to_lowercase(), resource)
}

/// Hex SHA-256 of method + path + body.
fn compute_request_hash(method: &Method, path: &str, body: &Bytes) -> String {
    let mut hasher = Sha256::new();
    hasher.update(method.as_str().as_bytes());
    hasher.update(b"|");
    hasher.update(path.as_bytes());
    hasher.update(b"|");
    hasher.update(body);
    hex::encode(hasher.finalize())
}

/// Whether the body reports a size that fits the buffering limit.
///
/// Streaming bodies without an upper bound never fit.
fn fits_cache_limit(body: &Body, limit: usize) -> bool {
    HttpBody::size_hint(body)
        .upper()
        .is_some_and(|upper| upper <= limit as u64)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
enum BodyEncoding {
    Utf8,
    Hex,
}

/// A response as stored in the key's result.
///
/// Every field is required, which keeps bare results recorded outside HTTP
/// from parsing as a cached response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct CachedResponse {
    status: u16,
    headers: BTreeMap<String, String>,
    body: String,
    encoding: BodyEncoding,
}

impl CachedResponse {
    fn capture(status: StatusCode, headers: &HeaderMap, body: &Bytes) -> Self {
        let headers = REPLAYED_RESPONSE_HEADERS
            .iter()
            .filter_map(|name| {
                let value = headers.get(*name)?.to_str().ok()?;
                Some((name.to_string(), value.to_string()))
            })
            .collect();
        let (body, encoding) = match std::str::from_utf8(body) {
            Ok(text) => (text.to_string(), BodyEncoding::Utf8),
            Err(_) => (hex::encode(body), BodyEncoding::Hex),
        };
        Self {
            status: status.as_u16(),
            headers,
            body,
            encoding,
        }
    }

    fn to_value(&self) -> Result<serde_json::Value, HandlerError> {
        serde_json::to_value(self)
            .map_err(|e| HandlerError::permanent(format!("failed to encode response: {}", e)))
    }

    fn body_bytes(&self) -> Result<Vec<u8>, IdempotencyError> {
        match self.encoding {
            BodyEncoding::Utf8 => Ok(self.body.clone().into_bytes()),
            BodyEncoding::Hex => hex::decode(&self.body).map_err(|e| {
                IdempotencyError::Internal(format!("Cached response body is corrupt: {}", e))
            }),
        }
    }
}

/// Rebuild a response from a stored result.
///
/// Keys completed outside HTTP carry a bare result; it is served as a 200
/// JSON body.
fn replay_response(result: &serde_json::Value) -> Result<Response, IdempotencyError> {
    let builder = Response::builder().header(IDEMPOTENCY_REPLAY_HEADER, "true");

    let response = match serde_json::from_value::<CachedResponse>(result.clone()) {
        Ok(cached) => {
            let status = StatusCode::from_u16(cached.status).map_err(|e| {
                IdempotencyError::Internal(format!("Cached status is invalid: {}", e))
            })?;
            let body = cached.body_bytes()?;
            cached
                .headers
                .iter()
                .fold(builder.status(status), |builder, (name, value)| {
                    builder.header(name.as_str(), value.as_str())
                })
                .body(Body::from(body))
        }
        Err(_) => {
            let body = serde_json::to_vec(result).map_err(|e| {
                IdempotencyError::Internal(format!("Failed to serialize cached result: {}", e))
            })?;
            builder
                .status(StatusCode::OK)
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body))
        }
    };

    response.map_err(|e| IdempotencyError::Internal(format!("Failed to build response: {}", e)))
}

// ============================================================================
// ERROR HANDLING
// ============================================================================

/// Errors that can occur in idempotency middleware.
#[derive(Debug)]
pub enum IdempotencyError {
    /// Idempotency key is required but not provided
    MissingKey,

    /// Idempotency key format is invalid
    InvalidKey(String),

    /// No tenant header on a keyed request
    MissingTenant,

    /// Request body exceeds the buffering limit
    BodyTooLarge(usize),

    /// Key exists but request hash doesn't match (different request)
    Conflict(String),

    /// Another request with the same key has not finished
    InProgress(String),

    /// Storage or other orchestration failure
    Orchestration(OrchestrationError),

    /// Internal error (serialization, response building)
    Internal(String),
}

impl IntoResponse for IdempotencyError {
    fn into_response(self) -> Response {
        let error = match self {
            IdempotencyError::MissingKey => ApiError::new(
                ErrorCode::MissingField,
                "Idempotency key header is required for this operation",
            ),
            IdempotencyError::InvalidKey(msg) => ApiError::new(ErrorCode::InvalidFormat, msg),
            IdempotencyError::MissingTenant => {
                ApiError::missing_field(crate::constants::TENANT_ID_HEADER)
            }
            IdempotencyError::BodyTooLarge(limit) => {
                return (
                    StatusCode::PAYLOAD_TOO_LARGE,
                    axum::Json(ApiError::new(
                        ErrorCode::ValidationFailed,
                        format!("Request body exceeds {} bytes", limit),
                    )),
                )
                    .into_response();
            }
            IdempotencyError::Conflict(key) => ApiError::new(
                ErrorCode::StateConflict,
                format!(
                    "Idempotency key '{}' was already used with a different request",
                    key
                ),
            ),
            IdempotencyError::InProgress(key) => ApiError::new(
                ErrorCode::OperationInProgress,
                format!("A request with idempotency key '{}' is still in progress", key),
            ),
            IdempotencyError::Orchestration(err) => ApiError::from(err),
            IdempotencyError::Internal(msg) => {
                tracing::error!(error = %msg, "Idempotency middleware internal error");
                ApiError::from_code(ErrorCode::InternalError)
            }
        };

        error.into_response()
    }
}

// ============================================================================
// TESTS
// ============================================================================
