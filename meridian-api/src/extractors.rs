//! Request extractors.

use crate::constants::{TENANT_ID_HEADER, USER_ID_HEADER};
use crate::error::ApiError;
use axum::{async_trait, extract::FromRequestParts, http::request::Parts};
use meridian_core::TenantId;

/// Tenant named by the `x-tenant-id` header.
///
/// Rejects the request with 400 when the header is missing or blank.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tenant(pub TenantId);

#[async_trait]
impl<S> FromRequestParts<S> for Tenant
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        tenant_from_parts(parts).map(Tenant)
    }
}

/// Read the tenant header from request parts.
pub fn tenant_from_parts(parts: &Parts) -> Result<TenantId, ApiError> {
    parts
        .headers
        .get(TENANT_ID_HEADER)
        .and_then(|h| h.to_str().ok())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .ok_or_else(|| ApiError::missing_field(TENANT_ID_HEADER))
}

/// Read the optional acting user; empty when absent.
pub fn user_from_parts(parts: &Parts) -> String {
    parts
        .headers
        .get(USER_ID_HEADER)
        .and_then(|h| h.to_str().ok())
        .unwrap_or_default()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Request;

    fn parts(tenant: Option<&str>) -> Parts {
        let mut builder = Request::builder().uri("/v1/sagas");
        if let Some(tenant) = tenant {
            builder = builder.header(TENANT_ID_HEADER, tenant);
        }
        builder.body(()).unwrap().into_parts().0
    }

    #[test]
    fn test_tenant_header_is_read() {
        assert_eq!(tenant_from_parts(&parts(Some("tenant-a"))).unwrap(), "tenant-a");
    }

    #[test]
    fn test_missing_or_blank_tenant_is_rejected() {
        assert!(tenant_from_parts(&parts(None)).is_err());
        assert!(tenant_from_parts(&parts(Some("   "))).is_err());
    }

    #[test]
    fn test_user_defaults_to_empty() {
        assert_eq!(user_from_parts(&parts(None)), "");
    }
}
