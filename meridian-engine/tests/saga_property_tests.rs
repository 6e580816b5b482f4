//! Property-Based Tests for Saga Ordering and Compensation
//!
//! **Property: Ordering**
//!
//! Steps SHALL be invoked strictly in index order, and no step after a
//! failed step SHALL be invoked.
//!
//! **Property: Reverse Compensation**
//!
//! After a failure at index `f`, compensations SHALL run for steps
//! `f-1, ..., 0` in that order, and never for step `f`.

use meridian_engine::{OperationRegistry, SagaCoordinator};
use meridian_test_utils::fixtures::{self, linear_steps};
use meridian_test_utils::generators::arb_saga_shape;
use meridian_test_utils::{
    CallLog, FailingHandler, OrchestratorConfig, RecordingHandler, SagaStatus,
};
use proptest::prelude::*;
use serde_json::json;
use std::sync::Arc;
use tokio::runtime::Runtime;

fn test_runtime() -> Result<Runtime, TestCaseError> {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(|e| TestCaseError::fail(format!("Failed to create runtime: {}", e)))
}

fn coordinator(len: usize, failing: Option<usize>, log: &CallLog) -> SagaCoordinator {
    let mut registry = OperationRegistry::new();
    for i in 0..len {
        let op = format!("op_{}", i);
        let handler = if Some(i) == failing {
            FailingHandler::permanent(op.clone(), log, "boom").shared()
        } else {
            RecordingHandler::new(op.clone(), log, json!({ "index": i })).shared()
        };
        registry.register_operation_handler(op.clone(), handler).expect("operation registered once");
        let undo = format!("undo_{}", op);
        registry
            .register_compensation_handler(undo.clone(), RecordingHandler::new(undo, log, json!(null)).shared())
            .expect("operation registered once");
    }
    SagaCoordinator::new(
        fixtures::storage(),
        Arc::new(registry),
        OrchestratorConfig::for_tests(),
    )
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn prop_steps_run_in_order_and_compensate_in_reverse((len, failing) in arb_saga_shape()) {
        let rt = test_runtime()?;
        let log = CallLog::new();
        let coordinator = coordinator(len, failing, &log);

        let (completed, status) = rt.block_on(async {
            let saga = coordinator
                .create_saga_workflow("tenant-a", "linear", linear_steps(len))
                .await
                .map_err(|e| e.to_string())?;
            let completed = coordinator
                .execute_saga_workflow(saga.saga_id)
                .await
                .map_err(|e| e.to_string())?;
            let stored = coordinator.get_saga(saga.saga_id).await.map_err(|e| e.to_string())?;
            Ok::<_, String>((completed, stored.status))
        }).map_err(TestCaseError::fail)?;

        let mut expected: Vec<String> = Vec::new();
        match failing {
            None => {
                expected.extend((0..len).map(|i| format!("op_{}", i)));
                prop_assert!(completed);
                prop_assert_eq!(status, SagaStatus::Completed);
            }
            Some(f) => {
                expected.extend((0..=f).map(|i| format!("op_{}", i)));
                expected.extend((0..f).rev().map(|i| format!("undo_op_{}", i)));
                prop_assert!(!completed);
                prop_assert_eq!(status, SagaStatus::Compensated);
            }
        }
        prop_assert_eq!(log.labels(), expected);
    }
}
