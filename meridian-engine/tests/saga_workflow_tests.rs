//! Saga coordinator behaviour against the in-memory backend.

use meridian_core::{handler_fn, RetryPolicy, StorageError};
use meridian_engine::{OperationRegistry, SagaCoordinator, CANCELLED_FAILURE};
use meridian_storage::OrchestrationStorage;
use meridian_test_utils::assertions::{assert_error_code, assert_step_statuses};
use meridian_test_utils::fixtures::{self, compensated_step, step};
use meridian_test_utils::{
    CallLog, FailingHandler, FlakyHandler, InMemoryStorage, OperationRequest, OrchestrationError,
    OrchestratorConfig, RecordingHandler, SagaStatus, SagaStep, SlowHandler, StepStatus,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

struct Harness {
    storage: Arc<InMemoryStorage>,
    coordinator: SagaCoordinator,
    log: CallLog,
}

/// Register `op_name` as succeeding and `undo_{op_name}` as its compensation.
fn register_ok(registry: &mut OperationRegistry, log: &CallLog, op: &str) {
    registry
        .register_operation_handler(op, RecordingHandler::new(op, log, json!({ "done": op })).shared())
        .unwrap();
    let undo = format!("undo_{}", op);
    registry
        .register_compensation_handler(undo.clone(), RecordingHandler::new(undo, log, json!(null)).shared())
        .unwrap();
}

fn harness(build: impl FnOnce(&mut OperationRegistry, &CallLog)) -> Harness {
    let storage = fixtures::storage();
    let log = CallLog::new();
    let mut registry = OperationRegistry::new();
    build(&mut registry, &log);
    let coordinator = SagaCoordinator::new(
        storage.clone(),
        Arc::new(registry),
        OrchestratorConfig::for_tests(),
    );
    Harness {
        storage,
        coordinator,
        log,
    }
}

// ============================================================================
// ORDERING
// ============================================================================

#[tokio::test]
async fn test_steps_run_in_index_order_and_stop_at_failure() {
    let h = harness(|registry, log| {
        register_ok(registry, log, "a");
        registry
            .register_operation_handler("b", FailingHandler::permanent("b", log, "b broke").shared())
            .unwrap();
        register_ok(registry, log, "c");
    });

    let saga = h
        .coordinator
        .create_saga_workflow("tenant-a", "abc", vec![step("a", "a"), step("b", "b"), step("c", "c")])
        .await
        .unwrap();
    let completed = h.coordinator.execute_saga_workflow(saga.saga_id).await.unwrap();

    assert!(!completed);
    assert_eq!(h.log.labels(), vec!["a", "b"]);
    assert_eq!(h.log.count("c"), 0);

    let stored = h.coordinator.get_saga(saga.saga_id).await.unwrap();
    assert_eq!(stored.status, SagaStatus::Compensated);
    assert_eq!(stored.failure.as_deref(), Some("b broke"));
    assert_step_statuses(
        &stored,
        &[StepStatus::Compensated, StepStatus::Failed, StepStatus::Pending],
    );
    assert_eq!(stored.steps[1].error.as_deref(), Some("b broke"));
}

#[tokio::test]
async fn test_later_steps_see_earlier_results_in_context() {
    let h = harness(|registry, log| {
        register_ok(registry, log, "a");
        registry
            .register_operation_handler(
                "b",
                handler_fn(|req: OperationRequest| async move {
                    assert_eq!(req.context.get("first"), Some(&json!({"done": "a"})));
                    assert_eq!(req.step_name.as_deref(), Some("second"));
                    Ok(json!({"saw": req.context.len()}))
                }),
            )
            .unwrap();
    });

    let saga = h
        .coordinator
        .create_saga_workflow("tenant-a", "ctx", vec![step("first", "a"), step("second", "b")])
        .await
        .unwrap();
    assert!(h.coordinator.execute_saga_workflow(saga.saga_id).await.unwrap());

    let stored = h.coordinator.get_saga(saga.saga_id).await.unwrap();
    assert_eq!(stored.context.get("second"), Some(&json!({"saw": 1})));
}

// ============================================================================
// COMPENSATION
// ============================================================================

#[tokio::test]
async fn test_compensations_run_in_reverse_and_skip_failed_step() {
    let h = harness(|registry, log| {
        register_ok(registry, log, "a");
        register_ok(registry, log, "b");
        registry
            .register_operation_handler("c", FailingHandler::permanent("c", log, "c broke").shared())
            .unwrap();
        registry
            .register_compensation_handler("undo_c", RecordingHandler::new("undo_c", log, json!(null)).shared())
            .unwrap();
    });

    let saga = h
        .coordinator
        .create_saga_workflow(
            "tenant-a",
            "abc",
            vec![
                compensated_step("a", "a"),
                compensated_step("b", "b"),
                compensated_step("c", "c"),
            ],
        )
        .await
        .unwrap();
    assert!(!h.coordinator.execute_saga_workflow(saga.saga_id).await.unwrap());

    assert_eq!(h.log.labels(), vec!["a", "b", "c", "undo_b", "undo_a"]);
    assert_eq!(h.log.count("undo_c"), 0);
}

#[tokio::test]
async fn test_failed_compensation_halts_rollback() {
    let h = harness(|registry, log| {
        register_ok(registry, log, "a");
        registry
            .register_operation_handler("b", RecordingHandler::new("b", log, json!({})).shared())
            .unwrap();
        registry
            .register_compensation_handler("undo_b", FailingHandler::new("undo_b", log, "refund api down").shared())
            .unwrap();
        registry
            .register_operation_handler("c", FailingHandler::permanent("c", log, "c broke").shared())
            .unwrap();
    });

    let saga = h
        .coordinator
        .create_saga_workflow(
            "tenant-a",
            "abc",
            vec![compensated_step("a", "a"), compensated_step("b", "b"), step("c", "c")],
        )
        .await
        .unwrap();
    let result = h.coordinator.execute_saga_workflow(saga.saga_id).await;

    assert_error_code(&result, "COMPENSATION_FAILURE");
    assert_eq!(h.log.count("undo_b"), 1);
    assert_eq!(h.log.count("undo_a"), 0);

    let stored = h.coordinator.get_saga(saga.saga_id).await.unwrap();
    assert_eq!(stored.status, SagaStatus::CompensationFailed);
    assert_step_statuses(
        &stored,
        &[
            StepStatus::Succeeded,
            StepStatus::CompensationFailed,
            StepStatus::Failed,
        ],
    );
    assert_eq!(stored.steps[1].error.as_deref(), Some("refund api down"));
}

#[tokio::test]
async fn test_step_without_compensation_is_treated_as_compensated() {
    let h = harness(|registry, log| {
        register_ok(registry, log, "a");
        registry
            .register_operation_handler("b", FailingHandler::permanent("b", log, "nope").shared())
            .unwrap();
    });

    let saga = h
        .coordinator
        .create_saga_workflow("tenant-a", "ab", vec![step("a", "a"), step("b", "b")])
        .await
        .unwrap();
    assert!(!h.coordinator.execute_saga_workflow(saga.saga_id).await.unwrap());

    let stored = h.coordinator.get_saga(saga.saga_id).await.unwrap();
    assert_eq!(stored.status, SagaStatus::Compensated);
    assert_step_statuses(&stored, &[StepStatus::Compensated, StepStatus::Failed]);
    assert_eq!(h.log.count("undo_a"), 0);
}

// ============================================================================
// PROVISIONING SCENARIO
// ============================================================================

fn provisioning_harness(release_succeeds: bool) -> Harness {
    harness(move |registry, log| {
        registry
            .register_operation_handler(
                "reserve_funds",
                RecordingHandler::new("reserve_funds", log, json!({"reservation_id": "r1"})).shared(),
            )
            .unwrap();
        registry
            .register_operation_handler(
                "provision_resource",
                FailingHandler::permanent("provision_resource", log, "no capacity").shared(),
            )
            .unwrap();
        let release = if release_succeeds {
            RecordingHandler::new("release_funds", log, json!({"released": true})).shared()
        } else {
            FailingHandler::new("release_funds", log, "ledger unavailable").shared()
        };
        registry
            .register_compensation_handler("release_funds", release)
            .unwrap();
        registry
            .register_compensation_handler(
                "deprovision_resource",
                RecordingHandler::new("deprovision_resource", log, json!(null)).shared(),
            )
            .unwrap();
    })
}

#[tokio::test]
async fn test_provisioning_failure_releases_reservation() {
    let h = provisioning_harness(true);
    let saga = h
        .coordinator
        .create_saga_workflow("tenant-a", "tenant_provisioning", fixtures::provisioning_steps())
        .await
        .unwrap();

    assert!(!h.coordinator.execute_saga_workflow(saga.saga_id).await.unwrap());

    let stored = h.coordinator.get_saga(saga.saga_id).await.unwrap();
    assert_eq!(stored.status, SagaStatus::Compensated);
    assert_eq!(h.log.count("deprovision_resource"), 0);
    let release_params = h.log.parameters_for("release_funds");
    assert_eq!(release_params.len(), 1);
    assert_eq!(release_params[0]["reservation_id"], json!("r1"));
}

#[tokio::test]
async fn test_provisioning_failure_with_broken_release_needs_review() {
    let h = provisioning_harness(false);
    let saga = h
        .coordinator
        .create_saga_workflow("tenant-a", "tenant_provisioning", fixtures::provisioning_steps())
        .await
        .unwrap();

    let err = h
        .coordinator
        .execute_saga_workflow(saga.saga_id)
        .await
        .unwrap_err();
    assert_eq!(
        err,
        OrchestrationError::CompensationFailure {
            step: "reserve".to_string(),
            operation_type: "release_funds".to_string(),
            message: "ledger unavailable".to_string(),
        }
    );

    let stored = h.coordinator.get_saga(saga.saga_id).await.unwrap();
    assert_eq!(stored.status, SagaStatus::CompensationFailed);
    assert_eq!(h.log.count("release_funds"), 1);
    assert_eq!(h.log.count("deprovision_resource"), 0);
}

#[tokio::test]
async fn test_explicit_compensation_parameters_override_step_result() {
    let h = provisioning_harness(true);
    let mut steps = fixtures::provisioning_steps();
    steps[0] = steps[0]
        .clone()
        .with_compensation("release_funds", Some(json!({"reason": "rollback"})));
    let saga = h
        .coordinator
        .create_saga_workflow("tenant-a", "tenant_provisioning", steps)
        .await
        .unwrap();
    h.coordinator.execute_saga_workflow(saga.saga_id).await.unwrap();

    assert_eq!(
        h.log.parameters_for("release_funds"),
        vec![json!({"reservation_id": "r1", "reason": "rollback"})]
    );
}

// ============================================================================
// RETRIES AND TIMEOUTS
// ============================================================================

#[tokio::test]
async fn test_retryable_failure_is_retried_up_to_max_retries() {
    let h = harness(|registry, log| {
        registry
            .register_operation_handler("flaky", FlakyHandler::new("flaky", log, 2, json!("ok")).shared())
            .unwrap();
    });
    let saga = h
        .coordinator
        .create_saga_workflow(
            "tenant-a",
            "retry",
            vec![step("f", "flaky").with_max_retries(2)],
        )
        .await
        .unwrap();

    assert!(h.coordinator.execute_saga_workflow(saga.saga_id).await.unwrap());
    assert_eq!(h.log.count("flaky"), 3);
    let stored = h.coordinator.get_saga(saga.saga_id).await.unwrap();
    assert_eq!(stored.steps[0].retry_count, 2);
    assert_eq!(stored.steps[0].result, Some(json!("ok")));
}

#[tokio::test]
async fn test_retries_exhausted_fails_step() {
    let h = harness(|registry, log| {
        registry
            .register_operation_handler("flaky", FlakyHandler::new("flaky", log, 5, json!("ok")).shared())
            .unwrap();
    });
    let saga = h
        .coordinator
        .create_saga_workflow("tenant-a", "retry", vec![step("f", "flaky").with_max_retries(1)])
        .await
        .unwrap();

    assert!(!h.coordinator.execute_saga_workflow(saga.saga_id).await.unwrap());
    assert_eq!(h.log.count("flaky"), 2);
    let stored = h.coordinator.get_saga(saga.saga_id).await.unwrap();
    assert_eq!(stored.steps[0].status, StepStatus::Failed);
    assert_eq!(stored.steps[0].retry_count, 2);
}

#[tokio::test]
async fn test_permanent_failure_is_not_retried() {
    let h = harness(|registry, log| {
        registry
            .register_operation_handler("bad", FailingHandler::permanent("bad", log, "invalid plan").shared())
            .unwrap();
    });
    let saga = h
        .coordinator
        .create_saga_workflow("tenant-a", "retry", vec![step("b", "bad").with_max_retries(5)])
        .await
        .unwrap();

    assert!(!h.coordinator.execute_saga_workflow(saga.saga_id).await.unwrap());
    assert_eq!(h.log.count("bad"), 1);
}

#[tokio::test(start_paused = true)]
async fn test_step_timeout_counts_as_failure() {
    let h = harness(|registry, log| {
        registry
            .register_operation_handler(
                "slow",
                SlowHandler::new("slow", log, Duration::from_secs(60), json!("late")).shared(),
            )
            .unwrap();
    });
    let saga = h
        .coordinator
        .create_saga_workflow(
            "tenant-a",
            "timeout",
            vec![step("s", "slow")
                .with_timeout(Duration::from_millis(100))
                .with_max_retries(1)],
        )
        .await
        .unwrap();

    assert!(!h.coordinator.execute_saga_workflow(saga.saga_id).await.unwrap());
    assert_eq!(h.log.count("slow"), 2);
    let stored = h.coordinator.get_saga(saga.saga_id).await.unwrap();
    assert_eq!(stored.steps[0].status, StepStatus::Failed);
    assert_eq!(stored.steps[0].error.as_deref(), Some("timed out after 100ms"));
}

// ============================================================================
// CANCELLATION AND RECOVERY
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_cancel_running_saga_finishes_step_then_compensates() {
    let h = harness(|registry, log| {
        registry
            .register_operation_handler(
                "slow",
                SlowHandler::new("slow", log, Duration::from_secs(1), json!({"id": 7})).shared(),
            )
            .unwrap();
        registry
            .register_compensation_handler("undo_slow", RecordingHandler::new("undo_slow", log, json!(null)).shared())
            .unwrap();
        register_ok(registry, log, "next");
    });
    let saga = h
        .coordinator
        .create_saga_workflow(
            "tenant-a",
            "cancel",
            vec![compensated_step("s", "slow"), step("n", "next")],
        )
        .await
        .unwrap();

    let runner = {
        let coordinator = h.coordinator.clone();
        let saga_id = saga.saga_id;
        tokio::spawn(async move { coordinator.execute_saga_workflow(saga_id).await })
    };

    while h.log.count("slow") == 0 {
        tokio::task::yield_now().await;
    }
    let status = h.coordinator.cancel_saga_workflow(saga.saga_id).await.unwrap();
    assert_eq!(status, SagaStatus::Running);

    assert!(!runner.await.unwrap().unwrap());
    assert_eq!(h.log.labels(), vec!["slow", "undo_slow"]);

    let stored = h.coordinator.get_saga(saga.saga_id).await.unwrap();
    assert_eq!(stored.status, SagaStatus::Compensated);
    assert_eq!(stored.failure.as_deref(), Some(CANCELLED_FAILURE));
    assert_step_statuses(&stored, &[StepStatus::Compensated, StepStatus::Pending]);
    assert!(!h
        .storage
        .saga_cancellation_requested(saga.saga_id)
        .await
        .unwrap());
}

#[tokio::test(start_paused = true)]
async fn test_cancel_during_retry_backoff_stops_retrying() {
    let log = CallLog::new();
    let mut registry = OperationRegistry::new();
    register_ok(&mut registry, &log, "a");
    registry
        .register_operation_handler("flaky", FailingHandler::new("flaky", &log, "upstream 503").shared())
        .unwrap();
    let mut config = OrchestratorConfig::for_tests();
    config.retry = RetryPolicy {
        initial_backoff: Duration::from_secs(5),
        max_backoff: Duration::from_secs(5),
        backoff_multiplier: 1.0,
    };
    let coordinator = SagaCoordinator::new(fixtures::storage(), Arc::new(registry), config);
    let saga = coordinator
        .create_saga_workflow(
            "tenant-a",
            "retry_cancel",
            vec![compensated_step("a", "a"), step("f", "flaky").with_max_retries(10)],
        )
        .await
        .unwrap();

    let runner = {
        let coordinator = coordinator.clone();
        let saga_id = saga.saga_id;
        tokio::spawn(async move { coordinator.execute_saga_workflow(saga_id).await })
    };

    while log.count("flaky") == 0 {
        tokio::task::yield_now().await;
    }
    let status = coordinator.cancel_saga_workflow(saga.saga_id).await.unwrap();
    assert_eq!(status, SagaStatus::Running);

    assert!(!runner.await.unwrap().unwrap());
    assert_eq!(log.count("flaky"), 1);
    assert_eq!(log.labels(), vec!["a", "flaky", "undo_a"]);

    let stored = coordinator.get_saga(saga.saga_id).await.unwrap();
    assert_eq!(stored.status, SagaStatus::Compensated);
    assert_eq!(stored.failure.as_deref(), Some(CANCELLED_FAILURE));
    assert_eq!(stored.steps[1].error.as_deref(), Some("upstream 503"));
    assert_step_statuses(&stored, &[StepStatus::Compensated, StepStatus::Failed]);
}

#[tokio::test]
async fn test_resume_running_saga_skips_succeeded_steps() {
    let h = harness(|registry, log| {
        register_ok(registry, log, "a");
        register_ok(registry, log, "b");
    });
    let saga = h
        .coordinator
        .create_saga_workflow("tenant-a", "resume", vec![step("a", "a"), step("b", "b")])
        .await
        .unwrap();

    // Simulate a worker that finished step "a" and crashed.
    let mut crashed = h.coordinator.get_saga(saga.saga_id).await.unwrap();
    crashed.status = SagaStatus::Running;
    crashed.steps[0].status = StepStatus::Succeeded;
    crashed.steps[0].result = Some(json!({"done": "a"}));
    crashed.context.insert("a".to_string(), json!({"done": "a"}));
    crashed.current_step = 1;
    h.storage.save_saga(&crashed).await.unwrap();

    let err = h
        .coordinator
        .execute_saga_workflow(saga.saga_id)
        .await
        .unwrap_err();
    assert!(matches!(err, OrchestrationError::ConcurrentExecution { .. }));

    assert!(h.coordinator.resume_saga_workflow(saga.saga_id).await.unwrap());
    assert_eq!(h.log.labels(), vec!["b"]);
}

#[tokio::test]
async fn test_resume_replays_step_whose_result_was_not_recorded() {
    let h = harness(|registry, log| {
        register_ok(registry, log, "a");
    });
    let saga = h
        .coordinator
        .create_saga_workflow("tenant-a", "resume", vec![step("a", "a")])
        .await
        .unwrap();

    // The handler ran and its key completed, but the saga save was lost.
    let key = saga.step_idempotency_key(0);
    h.coordinator
        .idempotency()
        .execute_idempotent(
            &meridian_engine::IdempotentCall::new("tenant-a", key, "a"),
            || async { Ok(json!({"done": "earlier"})) },
        )
        .await
        .unwrap();
    let mut crashed = h.coordinator.get_saga(saga.saga_id).await.unwrap();
    crashed.status = SagaStatus::Running;
    crashed.steps[0].status = StepStatus::Running;
    h.storage.save_saga(&crashed).await.unwrap();

    assert!(h.coordinator.resume_saga_workflow(saga.saga_id).await.unwrap());
    assert!(h.log.is_empty());
    let stored = h.coordinator.get_saga(saga.saga_id).await.unwrap();
    assert_eq!(stored.steps[0].result, Some(json!({"done": "earlier"})));
}

#[tokio::test]
async fn test_resume_terminal_saga_is_invalid_state() {
    let h = harness(|registry, log| register_ok(registry, log, "a"));
    let saga = h
        .coordinator
        .create_saga_workflow("tenant-a", "resume", vec![step("a", "a")])
        .await
        .unwrap();
    h.coordinator.execute_saga_workflow(saga.saga_id).await.unwrap();

    let result = h.coordinator.resume_saga_workflow(saga.saga_id).await;
    assert_error_code(&result, "INVALID_STATE");
}

#[tokio::test]
async fn test_storage_outage_aborts_without_running_handlers() {
    let h = harness(|registry, log| register_ok(registry, log, "a"));
    let saga = h
        .coordinator
        .create_saga_workflow("tenant-a", "outage", vec![step("a", "a")])
        .await
        .unwrap();

    h.storage.set_offline(true);
    let result = h.coordinator.execute_saga_workflow(saga.saga_id).await;
    assert_error_code(&result, "STORAGE_UNAVAILABLE");
    assert!(h.log.is_empty());

    h.storage.set_offline(false);
    let stored = h.storage.get_saga(saga.saga_id).await.unwrap().unwrap();
    assert_eq!(stored.status, SagaStatus::Pending);
    assert!(h.coordinator.execute_saga_workflow(saga.saga_id).await.unwrap());
}

#[tokio::test]
async fn test_concurrent_executions_of_one_saga_have_single_winner() {
    let h = harness(|registry, log| register_ok(registry, log, "a"));
    let saga = h
        .coordinator
        .create_saga_workflow("tenant-a", "race", vec![step("a", "a")])
        .await
        .unwrap();

    let mut handles = Vec::new();
    for _ in 0..8 {
        let coordinator = h.coordinator.clone();
        let saga_id = saga.saga_id;
        handles.push(tokio::spawn(async move {
            coordinator.execute_saga_workflow(saga_id).await
        }));
    }

    let mut completed = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(true) => completed += 1,
            Ok(false) => panic!("saga should not compensate"),
            Err(
                OrchestrationError::ConcurrentExecution { .. }
                | OrchestrationError::InvalidState { .. },
            ) => {}
            Err(other) => panic!("unexpected error: {}", other),
        }
    }
    assert_eq!(completed, 1);
    assert_eq!(h.log.count("a"), 1);
}

#[tokio::test]
async fn test_stale_write_maps_to_concurrent_execution() {
    let storage = InMemoryStorage::new();
    let saga = fixtures::unsaved_saga("tenant-a", vec![SagaStep::new("a", "a", json!({}))]);
    storage.save_saga(&saga).await.unwrap();
    let err = storage.save_saga(&saga).await.unwrap_err();
    assert!(matches!(err, StorageError::VersionConflict { .. }));
    assert!(matches!(
        OrchestrationError::from(err),
        OrchestrationError::ConcurrentExecution { .. }
    ));
}
