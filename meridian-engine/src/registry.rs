//! Operation registry.
//!
//! Maps operation-type names to handlers and compensations. The registry is
//! assembled once at startup and then shared read-only behind an `Arc`;
//! there is no global instance.

use meridian_core::{OrchestrationError, OrchestrationResult, SharedHandler};
use std::collections::HashMap;
use std::fmt;

/// Handlers and compensations keyed by operation type.
#[derive(Default, Clone)]
pub struct OperationRegistry {
    handlers: HashMap<String, SharedHandler>,
    compensations: HashMap<String, SharedHandler>,
}

impl OperationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the forward handler for `operation_type`.
    ///
    /// Registering the same type twice is a configuration bug and fails
    /// with `DuplicateRegistration` instead of overwriting.
    pub fn register_operation_handler(
        &mut self,
        operation_type: impl Into<String>,
        handler: SharedHandler,
    ) -> OrchestrationResult<()> {
        insert_unique(&mut self.handlers, operation_type.into(), handler)
    }

    /// Register a compensation under `operation_type`.
    pub fn register_compensation_handler(
        &mut self,
        operation_type: impl Into<String>,
        handler: SharedHandler,
    ) -> OrchestrationResult<()> {
        insert_unique(&mut self.compensations, operation_type.into(), handler)
    }

    /// Builder-style registration of an operation and, optionally, its undo.
    pub fn with_operation(
        mut self,
        operation_type: &str,
        handler: SharedHandler,
        compensation: Option<(&str, SharedHandler)>,
    ) -> OrchestrationResult<Self> {
        self.register_operation_handler(operation_type, handler)?;
        if let Some((compensation_type, compensation)) = compensation {
            self.register_compensation_handler(compensation_type, compensation)?;
        }
        Ok(self)
    }

    pub fn resolve_handler(&self, operation_type: &str) -> OrchestrationResult<SharedHandler> {
        self.handlers
            .get(operation_type)
            .cloned()
            .ok_or_else(|| OrchestrationError::NotRegistered {
                operation_type: operation_type.to_string(),
            })
    }

    pub fn resolve_compensation(
        &self,
        operation_type: &str,
    ) -> OrchestrationResult<SharedHandler> {
        self.compensations
            .get(operation_type)
            .cloned()
            .ok_or_else(|| OrchestrationError::NotRegistered {
                operation_type: operation_type.to_string(),
            })
    }
}

fn insert_unique(
    map: &mut HashMap<String, SharedHandler>,
    operation_type: String,
    handler: SharedHandler,
) -> OrchestrationResult<()> {
    if map.contains_key(&operation_type) {
        return Err(OrchestrationError::DuplicateRegistration { operation_type });
    }
    map.insert(operation_type, handler);
    Ok(())
}

impl fmt::Debug for OperationRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut handlers: Vec<_> = self.handlers.keys().collect();
        handlers.sort();
        let mut compensations: Vec<_> = self.compensations.keys().collect();
        compensations.sort();
        f.debug_struct("OperationRegistry")
            .field("handlers", &handlers)
            .field("compensations", &compensations)
            .finish()
    }
}
