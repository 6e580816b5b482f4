//! Handler contract.
//!
//! Operation and compensation handlers share one shape: they receive the
//! tenant, the parameters and a read-only view of the saga context, and
//! return a JSON result or a [`HandlerError`]. Handlers may have external
//! side effects but must not rely on in-process state from earlier calls.

use crate::error::HandlerError;
use crate::saga::SagaContext;
use crate::{SagaId, TenantId};
use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;

/// Input handed to a handler invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct OperationRequest {
    pub tenant_id: TenantId,
    /// Set when the call is driven by a saga.
    pub saga_id: Option<SagaId>,
    pub step_name: Option<String>,
    pub parameters: serde_json::Value,
    pub context: SagaContext,
}

impl OperationRequest {
    /// A standalone request outside any saga.
    pub fn new(tenant_id: impl Into<TenantId>, parameters: serde_json::Value) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            saga_id: None,
            step_name: None,
            parameters,
            context: SagaContext::new(),
        }
    }

    /// Attach saga identity and the context snapshot.
    pub fn in_saga(
        mut self,
        saga_id: SagaId,
        step_name: impl Into<String>,
        context: SagaContext,
    ) -> Self {
        self.saga_id = Some(saga_id);
        self.step_name = Some(step_name.into());
        self.context = context;
        self
    }
}

/// An executable operation or compensation.
#[async_trait]
pub trait OperationHandler: Send + Sync {
    async fn call(&self, request: OperationRequest) -> Result<serde_json::Value, HandlerError>;
}

/// Shared handle stored in the registry.
pub type SharedHandler = Arc<dyn OperationHandler>;

/// Adapter turning an async closure into an [`OperationHandler`].
pub struct FnHandler<F> {
    f: F,
}

#[async_trait]
impl<F, Fut> OperationHandler for FnHandler<F>
where
    F: Fn(OperationRequest) -> Fut + Send + Sync,
    Fut: Future<Output = Result<serde_json::Value, HandlerError>> + Send,
{
    async fn call(&self, request: OperationRequest) -> Result<serde_json::Value, HandlerError> {
        (self.f)(request).await
    }
}

/// Wrap an async closure as a shared handler.
///
/// ```ignore
/// let handler = handler_fn(|req: OperationRequest| async move {
///     Ok(serde_json::json!({ "tenant": req.tenant_id }))
/// });
/// ```
pub fn handler_fn<F, Fut>(f: F) -> SharedHandler
where
    F: Fn(OperationRequest) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<serde_json::Value, HandlerError>> + Send + 'static,
{
    Arc::new(FnHandler { f })
}
