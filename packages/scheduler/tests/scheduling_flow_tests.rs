//! End-to-end scheduling flows against a disposable Postgres: create,
//! dispatch, retry, duplicate delivery, conditional evaluation, and adapter
//! sync failure handling.

mod common;

use std::sync::Arc;

use chrono::{Duration, TimeZone, Utc};

use scheduler_core::domains::scheduling::adapter::TriggerSource;
use scheduler_core::domains::scheduling::commands::ScheduleCommandService;
use scheduler_core::domains::scheduling::dispatcher::DispatchOutcome;
use scheduler_core::domains::scheduling::interface::{
    ExecutionAuditListRequest, ExecutionListRequest, PredicateEvaluationAuditListRequest,
    ScheduleAuditListRequest, ScheduleCreateRequest, SchedulePauseRequest, ScheduleRunNowRequest,
    ScheduleUpdateRequest,
};
use scheduler_core::domains::scheduling::models::audit::ScheduleAuditEventType;
use scheduler_core::domains::scheduling::models::execution::{BackoffStrategy, ExecutionStatus};
use scheduler_core::domains::scheduling::models::schedule::{
    EvaluationIntervalUnit, EvaluationStatus, PredicateOperator, ScheduleDefinition, ScheduleState,
};
use scheduler_core::domains::scheduling::models::TaskIntentInput;
use scheduler_core::domains::scheduling::predicate::SubjectValue;
use scheduler_core::domains::scheduling::queries::ScheduleQueryService;
use scheduler_core::domains::scheduling::retry::RetryPolicy;

fn one_time_request(summary: &str, run_at: chrono::DateTime<Utc>) -> ScheduleCreateRequest {
    ScheduleCreateRequest {
        task_intent: TaskIntentInput::builder().summary(summary).build(),
        timezone: "UTC".to_string(),
        definition: ScheduleDefinition::OneTime { run_at },
        start_state: ScheduleState::Active,
    }
}

fn conditional_request(subject: &str) -> ScheduleCreateRequest {
    ScheduleCreateRequest {
        task_intent: TaskIntentInput::builder()
            .summary("tend memory hygiene")
            .build(),
        timezone: "UTC".to_string(),
        definition: ScheduleDefinition::Conditional {
            predicate_subject: subject.to_string(),
            predicate_operator: PredicateOperator::Lt,
            predicate_value: Some("80".to_string()),
            evaluation_interval_count: 6,
            evaluation_interval_unit: EvaluationIntervalUnit::Hour,
        },
        start_state: ScheduleState::Active,
    }
}

#[tokio::test]
async fn one_time_schedule_succeeds_and_completes() {
    let db = common::setup_db().await;
    let adapter = common::RecordingAdapter::new();
    let commands =
        ScheduleCommandService::new(db.pool.clone(), adapter.clone());
    let queries = ScheduleQueryService::new(db.pool.clone());

    let run_at = Utc.with_ymd_and_hms(2025, 2, 6, 10, 0, 0).unwrap();
    let created = commands
        .create_schedule(
            &one_time_request("water the plants", run_at),
            &common::human_actor("t-create-1"),
        )
        .await
        .unwrap();
    assert_eq!(created.schedule.next_run_at, Some(run_at));
    assert!(adapter
        .call_names()
        .iter()
        .any(|call| call.starts_with("register:")));

    let invoker = common::ScriptedInvoker::succeeding();
    let resolver = common::StaticResolver::returning(SubjectValue::Missing);
    let dispatcher = common::dispatcher(
        &db.pool,
        invoker.clone(),
        resolver,
        RetryPolicy::default(),
    );

    let outcome = dispatcher
        .dispatch(&common::callback(
            created.schedule.id,
            run_at,
            "cb-1",
            TriggerSource::Timer,
        ))
        .await
        .unwrap();
    let execution_id = match outcome {
        DispatchOutcome::Dispatched {
            execution_id,
            status,
        } => {
            assert_eq!(status, ExecutionStatus::Succeeded);
            execution_id
        }
        other => panic!("expected Dispatched, got {other:?}"),
    };

    let execution = queries.get_execution(execution_id).await.unwrap();
    assert_eq!(execution.status, ExecutionStatus::Succeeded);
    assert_eq!(execution.attempt_count, 1);
    assert_eq!(execution.trace_id, "cb-1");
    assert!(execution.finished_at.is_some());
    assert!(execution.last_error_code.is_none());

    let schedule = queries
        .get_schedule(created.schedule.id)
        .await
        .unwrap()
        .schedule;
    assert_eq!(schedule.state, ScheduleState::Completed);
    assert_eq!(schedule.next_run_at, None);
    assert_eq!(schedule.failure_count, 0);
    assert_eq!(schedule.last_run_status, Some(ExecutionStatus::Succeeded));
    assert_eq!(schedule.last_execution_id, Some(execution_id));

    // Audit chain: queued, running, succeeded — one row per status change.
    let audits = queries
        .list_execution_audits(&ExecutionAuditListRequest {
            execution_id: Some(execution_id),
            ..Default::default()
        })
        .await
        .unwrap();
    let mut statuses: Vec<&str> = audits
        .audit_logs
        .iter()
        .map(|audit| audit.status.as_str())
        .collect();
    statuses.sort_unstable();
    assert_eq!(statuses, vec!["queued", "running", "succeeded"]);

    assert_eq!(invoker.call_count(), 1);
}

#[tokio::test]
async fn failing_one_time_schedule_retries_then_fails() {
    let db = common::setup_db().await;
    let adapter = common::RecordingAdapter::new();
    let commands =
        ScheduleCommandService::new(db.pool.clone(), adapter);
    let queries = ScheduleQueryService::new(db.pool.clone());

    let run_at = Utc.with_ymd_and_hms(2025, 2, 6, 10, 0, 0).unwrap();
    let created = commands
        .create_schedule(
            &one_time_request("sync the vault", run_at),
            &common::human_actor("t-create-2"),
        )
        .await
        .unwrap();

    let policy = RetryPolicy {
        max_attempts: 2,
        backoff_strategy: BackoffStrategy::Fixed,
        backoff_base_seconds: 300,
    };
    let invoker = common::ScriptedInvoker::failing("agent_error");
    let resolver = common::StaticResolver::returning(SubjectValue::Missing);
    let dispatcher = common::dispatcher(&db.pool, invoker.clone(), resolver, policy);

    // First delivery: attempt 1 of 2 ends retry_scheduled.
    let outcome = dispatcher
        .dispatch(&common::callback(
            created.schedule.id,
            run_at,
            "cb-r1",
            TriggerSource::Timer,
        ))
        .await
        .unwrap();
    let first_id = match outcome {
        DispatchOutcome::Dispatched {
            execution_id,
            status,
        } => {
            assert_eq!(status, ExecutionStatus::RetryScheduled);
            execution_id
        }
        other => panic!("expected Dispatched, got {other:?}"),
    };

    let first = queries.get_execution(first_id).await.unwrap();
    assert_eq!(first.retry_count, 1);
    assert_eq!(first.attempt_count, 1);
    assert_eq!(first.last_error_code.as_deref(), Some("agent_error"));
    let finished_at = first.finished_at.unwrap();
    assert_eq!(first.next_retry_at, Some(finished_at + Duration::seconds(300)));

    // Retry delivery: attempt 2 of 2 exhausts the budget.
    let outcome = dispatcher
        .dispatch(&common::callback(
            created.schedule.id,
            first.next_retry_at.unwrap(),
            "cb-r2",
            TriggerSource::Retry,
        ))
        .await
        .unwrap();
    let second_id = match outcome {
        DispatchOutcome::Dispatched {
            execution_id,
            status,
        } => {
            assert_eq!(status, ExecutionStatus::Failed);
            execution_id
        }
        other => panic!("expected Dispatched, got {other:?}"),
    };

    let second = queries.get_execution(second_id).await.unwrap();
    assert_eq!(second.attempt_count, 2);
    assert_eq!(second.status, ExecutionStatus::Failed);
    assert!(second.next_retry_at.is_none());

    let schedule = queries
        .get_schedule(created.schedule.id)
        .await
        .unwrap()
        .schedule;
    assert_eq!(schedule.failure_count, 2);
    assert_eq!(schedule.last_run_status, Some(ExecutionStatus::Failed));
    assert_eq!(schedule.next_run_at, None);
    assert_eq!(invoker.call_count(), 2);
}

#[tokio::test]
async fn duplicate_delivery_is_a_no_op() {
    let db = common::setup_db().await;
    let adapter = common::RecordingAdapter::new();
    let commands =
        ScheduleCommandService::new(db.pool.clone(), adapter);
    let queries = ScheduleQueryService::new(db.pool.clone());

    let run_at = Utc.with_ymd_and_hms(2025, 2, 6, 10, 0, 0).unwrap();
    let created = commands
        .create_schedule(
            &one_time_request("file the report", run_at),
            &common::human_actor("t-create-3"),
        )
        .await
        .unwrap();

    let invoker = common::ScriptedInvoker::succeeding();
    let resolver = common::StaticResolver::returning(SubjectValue::Missing);
    let dispatcher = common::dispatcher(
        &db.pool,
        invoker.clone(),
        resolver,
        RetryPolicy::default(),
    );
    let payload = common::callback(created.schedule.id, run_at, "cb-2", TriggerSource::Timer);

    let first = dispatcher.dispatch(&payload).await.unwrap();
    let execution_id = match first {
        DispatchOutcome::Dispatched { execution_id, .. } => execution_id,
        other => panic!("expected Dispatched, got {other:?}"),
    };

    let second = dispatcher.dispatch(&payload).await.unwrap();
    match second {
        DispatchOutcome::Duplicate {
            execution_id: duplicate_id,
        } => assert_eq!(duplicate_id, execution_id),
        other => panic!("expected Duplicate, got {other:?}"),
    }

    let executions = queries
        .list_executions(&ExecutionListRequest {
            schedule_id: Some(created.schedule.id),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(executions.executions.len(), 1);

    let audits = queries
        .list_execution_audits(&ExecutionAuditListRequest {
            execution_id: Some(execution_id),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(audits.audit_logs.len(), 3);

    assert_eq!(invoker.call_count(), 1);
}

#[tokio::test]
async fn conditional_schedule_skips_when_predicate_is_false() {
    let db = common::setup_db().await;
    let adapter = common::RecordingAdapter::new();
    let commands =
        ScheduleCommandService::new(db.pool.clone(), adapter);
    let queries = ScheduleQueryService::new(db.pool.clone());

    let created = commands
        .create_schedule(
            &conditional_request("memory.hygiene.score"),
            &common::human_actor("t-create-4"),
        )
        .await
        .unwrap();

    let invoker = common::ScriptedInvoker::succeeding();
    let resolver = common::StaticResolver::returning(SubjectValue::Number(90.0));
    // The hygiene score subject is exposed through a deployment allowlist.
    let dispatcher = common::dispatcher_with_allowlist(
        &db.pool,
        invoker.clone(),
        resolver.clone(),
        RetryPolicy::default(),
        vec!["memory.hygiene.score".to_string()],
    );

    let outcome = dispatcher
        .dispatch(&common::callback(
            created.schedule.id,
            Utc::now(),
            "cb-c1",
            TriggerSource::Timer,
        ))
        .await
        .unwrap();
    match outcome {
        DispatchOutcome::Skipped {
            evaluation_status,
            result_code,
        } => {
            assert_eq!(evaluation_status, EvaluationStatus::False);
            assert_eq!(result_code, "evaluated");
        }
        other => panic!("expected Skipped, got {other:?}"),
    }

    // No execution was created and the agent never ran.
    let executions = queries
        .list_executions(&ExecutionListRequest {
            schedule_id: Some(created.schedule.id),
            ..Default::default()
        })
        .await
        .unwrap();
    assert!(executions.executions.is_empty());
    assert_eq!(invoker.call_count(), 0);
    assert_eq!(resolver.call_count(), 1);

    let schedule = queries
        .get_schedule(created.schedule.id)
        .await
        .unwrap()
        .schedule;
    assert_eq!(schedule.last_evaluation_status, Some(EvaluationStatus::False));
    assert!(schedule.last_evaluation_error_code.is_none());
    let evaluated_at = schedule.last_evaluated_at.unwrap();
    assert_eq!(schedule.next_run_at, Some(evaluated_at + Duration::hours(6)));

    let audits = queries
        .list_predicate_evaluation_audits(&PredicateEvaluationAuditListRequest {
            schedule_id: Some(created.schedule.id),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(audits.audit_logs.len(), 1);
    let audit = &audits.audit_logs[0];
    assert_eq!(audit.status, EvaluationStatus::False);
    assert_eq!(audit.observed_value.as_deref(), Some("90"));
    assert_eq!(audit.authorization_decision, "allow");
}

#[tokio::test]
async fn conditional_schedule_denies_side_effecting_subject() {
    let db = common::setup_db().await;
    let adapter = common::RecordingAdapter::new();
    let commands =
        ScheduleCommandService::new(db.pool.clone(), adapter);
    let queries = ScheduleQueryService::new(db.pool.clone());

    let created = commands
        .create_schedule(
            &conditional_request("obsidian.write"),
            &common::human_actor("t-create-5"),
        )
        .await
        .unwrap();

    let invoker = common::ScriptedInvoker::succeeding();
    let resolver = common::StaticResolver::returning(SubjectValue::Number(90.0));
    let dispatcher = common::dispatcher(
        &db.pool,
        invoker.clone(),
        resolver.clone(),
        RetryPolicy::default(),
    );

    let outcome = dispatcher
        .dispatch(&common::callback(
            created.schedule.id,
            Utc::now(),
            "cb-c2",
            TriggerSource::Timer,
        ))
        .await
        .unwrap();
    match outcome {
        DispatchOutcome::Skipped {
            evaluation_status,
            result_code,
        } => {
            assert_eq!(evaluation_status, EvaluationStatus::Error);
            assert_eq!(result_code, "forbidden");
        }
        other => panic!("expected Skipped, got {other:?}"),
    }

    // The resolver must never run for a denied capability.
    assert_eq!(resolver.call_count(), 0);
    assert_eq!(invoker.call_count(), 0);

    let executions = queries
        .list_executions(&ExecutionListRequest {
            schedule_id: Some(created.schedule.id),
            ..Default::default()
        })
        .await
        .unwrap();
    assert!(executions.executions.is_empty());

    let schedule = queries
        .get_schedule(created.schedule.id)
        .await
        .unwrap()
        .schedule;
    assert_eq!(schedule.last_evaluation_status, Some(EvaluationStatus::Error));
    assert_eq!(
        schedule.last_evaluation_error_code.as_deref(),
        Some("forbidden")
    );

    let audits = queries
        .list_predicate_evaluation_audits(&PredicateEvaluationAuditListRequest {
            schedule_id: Some(created.schedule.id),
            ..Default::default()
        })
        .await
        .unwrap();
    let audit = &audits.audit_logs[0];
    assert_eq!(audit.status, EvaluationStatus::Error);
    assert_eq!(audit.result_code, "forbidden");
    assert_eq!(audit.authorization_decision, "deny");
    assert_eq!(
        audit.authorization_reason_code.as_deref(),
        Some("not_read_only")
    );
}

#[tokio::test]
async fn adapter_failure_on_update_is_audited_and_surfaced() {
    let db = common::setup_db().await;
    let adapter = common::RecordingAdapter::failing_update("unavailable");
    let commands = ScheduleCommandService::new(
        db.pool.clone(),
        adapter.clone(),
    );
    let queries = ScheduleQueryService::new(db.pool.clone());

    let run_at = Utc.with_ymd_and_hms(2025, 2, 6, 10, 0, 0).unwrap();
    let created = commands
        .create_schedule(
            &one_time_request("check the greenhouse", run_at),
            &common::human_actor("t-create-6"),
        )
        .await
        .unwrap();

    let new_run_at = run_at + Duration::hours(4);
    let error = commands
        .update_schedule(
            &ScheduleUpdateRequest {
                schedule_id: created.schedule.id,
                timezone: None,
                state: None,
                definition: Some(ScheduleDefinition::OneTime { run_at: new_run_at }),
            },
            &common::human_actor("t-update-6"),
        )
        .await
        .unwrap_err();
    assert_eq!(error.code(), "adapter_error");
    assert_eq!(error.details()["adapter_code"], "unavailable");

    // The database kept the committed update; only the adapter is stale.
    let schedule = queries
        .get_schedule(created.schedule.id)
        .await
        .unwrap()
        .schedule;
    assert_eq!(schedule.run_at, Some(new_run_at));

    let audits = queries
        .list_schedule_audits(&ScheduleAuditListRequest {
            schedule_id: Some(created.schedule.id),
            event_type: Some(ScheduleAuditEventType::Update),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(audits.audit_logs.len(), 2);
    let failure_audit = audits
        .audit_logs
        .iter()
        .find(|audit| {
            audit.diff_summary.as_deref() == Some("adapter_sync_failed:update:unavailable")
        })
        .expect("adapter failure audit row");
    assert!(failure_audit
        .reason
        .as_deref()
        .unwrap()
        .starts_with("adapter_sync_failed:update:unavailable"));
    let change_audit = audits
        .audit_logs
        .iter()
        .find(|audit| audit.diff_summary.as_deref() == Some("definition"))
        .expect("definition change audit row");
    assert_eq!(change_audit.event_type, ScheduleAuditEventType::Update);
}

#[tokio::test]
async fn pause_replay_writes_one_audit_and_one_adapter_call() {
    let db = common::setup_db().await;
    let adapter = common::RecordingAdapter::new();
    let commands = ScheduleCommandService::new(
        db.pool.clone(),
        adapter.clone(),
    );
    let queries = ScheduleQueryService::new(db.pool.clone());

    let run_at = Utc.with_ymd_and_hms(2025, 2, 6, 10, 0, 0).unwrap();
    let created = commands
        .create_schedule(
            &one_time_request("weekly review", run_at),
            &common::human_actor("t-create-7"),
        )
        .await
        .unwrap();

    let actor = common::human_actor("t-pause-7");
    let request = SchedulePauseRequest {
        schedule_id: created.schedule.id,
        reason: Some("vacation".into()),
    };
    let first = commands.pause_schedule(&request, &actor).await.unwrap();
    let second = commands.pause_schedule(&request, &actor).await.unwrap();
    assert_eq!(first.audit_log_id, second.audit_log_id);
    assert_eq!(second.schedule.state, ScheduleState::Paused);

    let audits = queries
        .list_schedule_audits(&ScheduleAuditListRequest {
            schedule_id: Some(created.schedule.id),
            event_type: Some(ScheduleAuditEventType::Pause),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(audits.audit_logs.len(), 1);
    assert_eq!(audits.audit_logs[0].reason.as_deref(), Some("vacation"));

    let pause_calls = adapter
        .call_names()
        .iter()
        .filter(|call| call.starts_with("pause:"))
        .count();
    assert_eq!(pause_calls, 1);
}

#[tokio::test]
async fn run_now_fires_paused_schedules_and_terminal_states_conflict() {
    let db = common::setup_db().await;
    let adapter = common::RecordingAdapter::new();
    let commands = ScheduleCommandService::new(
        db.pool.clone(),
        adapter.clone(),
    );
    let queries = ScheduleQueryService::new(db.pool.clone());

    let run_at = Utc.with_ymd_and_hms(2025, 2, 6, 10, 0, 0).unwrap();
    let mut request = one_time_request("morning digest", run_at);
    request.start_state = ScheduleState::Paused;
    let created = commands
        .create_schedule(&request, &common::human_actor("t-create-8"))
        .await
        .unwrap();

    let requested_for = Utc.with_ymd_and_hms(2025, 2, 6, 12, 0, 0).unwrap();
    let result = commands
        .run_now(
            &ScheduleRunNowRequest {
                schedule_id: created.schedule.id,
                requested_for: Some(requested_for),
                reason: None,
            },
            &common::human_actor("t-run-8"),
        )
        .await
        .unwrap();
    assert_eq!(result.scheduled_for, requested_for);

    let audits = queries
        .list_schedule_audits(&ScheduleAuditListRequest {
            schedule_id: Some(created.schedule.id),
            event_type: Some(ScheduleAuditEventType::RunNow),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(audits.audit_logs.len(), 1);
    assert_eq!(
        audits.audit_logs[0].diff_summary.as_deref(),
        Some("run_now(state=paused)")
    );
    assert!(adapter
        .call_names()
        .iter()
        .any(|call| call.starts_with("trigger:") && call.contains("run_now")));

    // Cancel, then run_now must conflict.
    commands
        .delete_schedule(
            &scheduler_core::domains::scheduling::interface::ScheduleDeleteRequest {
                schedule_id: created.schedule.id,
                reason: None,
            },
            &common::human_actor("t-delete-8"),
        )
        .await
        .unwrap();
    let error = commands
        .run_now(
            &ScheduleRunNowRequest {
                schedule_id: created.schedule.id,
                requested_for: None,
                reason: None,
            },
            &common::human_actor("t-run-8b"),
        )
        .await
        .unwrap_err();
    assert_eq!(error.code(), "conflict");
}

#[tokio::test]
async fn pausing_a_completed_schedule_is_an_invalid_transition() {
    let db = common::setup_db().await;
    let adapter = common::RecordingAdapter::new();
    let commands =
        ScheduleCommandService::new(db.pool.clone(), adapter);

    let run_at = Utc.with_ymd_and_hms(2025, 2, 6, 10, 0, 0).unwrap();
    let created = commands
        .create_schedule(
            &one_time_request("one and done", run_at),
            &common::human_actor("t-create-9"),
        )
        .await
        .unwrap();

    let invoker = common::ScriptedInvoker::succeeding();
    let resolver = common::StaticResolver::returning(SubjectValue::Missing);
    let dispatcher = common::dispatcher(&db.pool, invoker, resolver, RetryPolicy::default());
    dispatcher
        .dispatch(&common::callback(
            created.schedule.id,
            run_at,
            "cb-9",
            TriggerSource::Timer,
        ))
        .await
        .unwrap();

    let error = commands
        .pause_schedule(
            &SchedulePauseRequest {
                schedule_id: created.schedule.id,
                reason: None,
            },
            &common::human_actor("t-pause-9"),
        )
        .await
        .unwrap_err();
    assert_eq!(error.code(), "invalid_state_transition");
}

#[tokio::test]
async fn task_intents_are_immutable_and_supersede_by_reference() {
    let db = common::setup_db().await;
    let adapter = common::RecordingAdapter::new();
    let commands = ScheduleCommandService::new(db.pool.clone(), adapter);

    let run_at = Utc.with_ymd_and_hms(2025, 2, 6, 10, 0, 0).unwrap();
    let first = commands
        .create_schedule(
            &one_time_request("draft the newsletter", run_at),
            &common::human_actor("t-create-10"),
        )
        .await
        .unwrap();
    let second = commands
        .create_schedule(
            &one_time_request("draft and send the newsletter", run_at),
            &common::human_actor("t-create-10b"),
        )
        .await
        .unwrap();

    let mut conn = db.pool.acquire().await.unwrap();
    let now = Utc::now();

    // Self-supersession is rejected outright.
    let error = scheduler_core::domains::scheduling::models::TaskIntentRow::supersede(
        first.task_intent.id,
        first.task_intent.id,
        now,
        &mut conn,
    )
    .await
    .unwrap_err();
    assert!(error.to_string().contains("supersede itself"));

    let superseded = scheduler_core::domains::scheduling::models::TaskIntentRow::supersede(
        first.task_intent.id,
        second.task_intent.id,
        now,
        &mut conn,
    )
    .await
    .unwrap();
    assert_eq!(
        superseded.superseded_by_intent_id,
        Some(second.task_intent.id)
    );

    // The chain is a weak back-reference; it can only be written once.
    let error = scheduler_core::domains::scheduling::models::TaskIntentRow::supersede(
        first.task_intent.id,
        second.task_intent.id,
        now,
        &mut conn,
    )
    .await
    .unwrap_err();
    assert!(matches!(
        error,
        scheduler_core::domains::scheduling::models::DataAccessError::ImmutableField(_)
    ));
}

#[tokio::test]
async fn due_lookup_sees_only_active_schedules_with_elapsed_next_run() {
    let db = common::setup_db().await;
    let adapter = common::RecordingAdapter::new();
    let commands = ScheduleCommandService::new(db.pool.clone(), adapter);

    let past = Utc.with_ymd_and_hms(2025, 2, 6, 10, 0, 0).unwrap();
    let future = Utc::now() + Duration::days(365);
    let due = commands
        .create_schedule(
            &one_time_request("overdue digest", past),
            &common::human_actor("t-create-11"),
        )
        .await
        .unwrap();
    let not_due = commands
        .create_schedule(
            &one_time_request("next year's digest", future),
            &common::human_actor("t-create-11b"),
        )
        .await
        .unwrap();
    let paused = commands
        .create_schedule(
            &one_time_request("paused digest", past),
            &common::human_actor("t-create-11c"),
        )
        .await
        .unwrap();
    commands
        .pause_schedule(
            &SchedulePauseRequest {
                schedule_id: paused.schedule.id,
                reason: None,
            },
            &common::human_actor("t-pause-11"),
        )
        .await
        .unwrap();

    let mut conn = db.pool.acquire().await.unwrap();
    let found = scheduler_core::domains::scheduling::models::ScheduleRow::find_due(
        Utc::now(),
        &mut conn,
    )
    .await
    .unwrap();
    let ids: Vec<_> = found.iter().map(|s| s.id).collect();
    assert!(ids.contains(&due.schedule.id));
    assert!(!ids.contains(&not_due.schedule.id));
    assert!(!ids.contains(&paused.schedule.id));
}

#[tokio::test]
async fn schedule_listing_paginates_with_opaque_cursors() {
    let db = common::setup_db().await;
    let adapter = common::RecordingAdapter::new();
    let commands = ScheduleCommandService::new(db.pool.clone(), adapter);
    let queries = ScheduleQueryService::new(db.pool.clone());

    let run_at = Utc.with_ymd_and_hms(2025, 2, 6, 10, 0, 0).unwrap();
    for index in 0..3 {
        commands
            .create_schedule(
                &one_time_request(&format!("chore {index}"), run_at),
                &common::human_actor(&format!("t-create-12-{index}")),
            )
            .await
            .unwrap();
    }

    let first_page = queries
        .list_schedules(&scheduler_core::domains::scheduling::interface::ScheduleListRequest {
            limit: Some(2),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(first_page.schedules.len(), 2);
    let cursor = first_page.next_cursor.expect("a second page exists");

    let second_page = queries
        .list_schedules(&scheduler_core::domains::scheduling::interface::ScheduleListRequest {
            limit: Some(2),
            cursor: Some(cursor),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(second_page.schedules.len(), 1);
    assert!(second_page.next_cursor.is_none());

    // Pages are disjoint and newest-first.
    let first_ids: Vec<_> = first_page.schedules.iter().map(|s| s.id).collect();
    assert!(!first_ids.contains(&second_page.schedules[0].id));
    assert!(first_page.schedules[0].created_at >= first_page.schedules[1].created_at);

    // A mangled cursor is a validation error, not a crash.
    let error = queries
        .list_schedules(&scheduler_core::domains::scheduling::interface::ScheduleListRequest {
            cursor: Some("definitely-not-a-cursor".into()),
            ..Default::default()
        })
        .await
        .unwrap_err();
    assert_eq!(error.code(), "validation_error");
}
