//! Execution dispatcher: turns timer callbacks into audited agent
//! invocations.
//!
//! One callback is processed on one worker; parallelism comes from
//! dispatching distinct callbacks concurrently. The queued and running rows
//! are committed *before* the agent call so the execution is durable and no
//! row lock is held across the out-of-process invocation. The
//! `(schedule_id, trace_id)` uniqueness constraint makes duplicate delivery
//! a no-op.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use std::sync::Arc;
use thiserror::Error;
use tracing::{error, warn};

use crate::common::{ExecutionId, Patch, ScheduleId, TaskIntentId};

use super::actor::{ActorContext, ExecutionActorContext, ScheduledActorContext};
use super::adapter::{CallbackPayload, TriggerSource};
use super::models::execution::{
    BackoffStrategy, CreateExecution, ExecutionRow, ExecutionStatus, UpdateExecution,
};
use super::models::schedule::{
    EvaluationStatus, ScheduleDefinition, ScheduleRow, ScheduleState, ScheduleType, UpdateSchedule,
};
use super::models::audit::ScheduleAuditEventType;
use super::models::{DataAccessError, TaskIntentRow};
use super::predicate::PredicateEvaluationService;
use super::retry::{self, ExecutionDisposition, ExecutionOutcome, RetryPolicy};
use super::timing;

// ============================================================================
// Errors
// ============================================================================

/// Raised when the dispatcher cannot process a callback.
///
/// These never surface to the timer engine; the callback worker logs them
/// and the engine's own retry (or a duplicate-delivery no-op) takes over.
#[derive(Debug, Error)]
#[error("dispatch failed [{code}]: {message}")]
pub struct DispatchError {
    pub code: String,
    pub message: String,
    pub details: serde_json::Value,
}

impl DispatchError {
    fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
            details: serde_json::Value::Null,
        }
    }

    fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = details;
        self
    }
}

impl From<DataAccessError> for DispatchError {
    fn from(error: DataAccessError) -> Self {
        let code = match &error {
            DataAccessError::NotFound { .. } => "not_found",
            DataAccessError::Validation(_) => "validation_error",
            DataAccessError::ImmutableField(_) => "immutable_field",
            DataAccessError::InvalidStateTransition { .. } => "invalid_state_transition",
            DataAccessError::MissingActorContext(_) => "missing_actor_context",
            DataAccessError::Forbidden(_) => "forbidden",
            DataAccessError::Database(_) => "internal_error",
        };
        DispatchError::new(code, error.to_string())
    }
}

// ============================================================================
// Agent-runtime boundary
// ============================================================================

/// Status reported by the agent runtime for an invocation.
///
/// Anything outside the contract deserializes as `Unknown` and is treated as
/// a non-retried failure with `invalid_result_status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InvocationStatus {
    Success,
    Failure,
    Deferred,
    #[serde(other)]
    Unknown,
}

/// Retry hint returned by the agent for deferred executions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryHint {
    pub retry_after: DateTime<Utc>,
    pub backoff_strategy: BackoffStrategy,
}

/// Error details returned for failed executions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvocationError {
    pub error_code: String,
    pub error_message: String,
}

/// Result envelope returned by the agent runtime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvocationResult {
    pub status: InvocationStatus,
    pub result_code: String,
    pub attention_required: bool,
    pub message: Option<String>,
    pub side_effects_summary: Option<String>,
    pub retry_hint: Option<RetryHint>,
    pub error: Option<InvocationError>,
}

/// Execution metadata inside an invocation request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvocationExecution {
    pub id: ExecutionId,
    pub schedule_id: ScheduleId,
    pub task_intent_id: TaskIntentId,
    pub scheduled_for: DateTime<Utc>,
    pub attempt_number: i32,
    pub max_attempts: i32,
    pub backoff_strategy: Option<BackoffStrategy>,
    pub retry_after: Option<DateTime<Utc>>,
    pub trace_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvocationTaskIntent {
    pub summary: String,
    pub details: Option<String>,
    pub origin_reference: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvocationSchedule {
    pub schedule_type: ScheduleType,
    pub timezone: String,
    pub definition: ScheduleDefinition,
    pub next_run_at: Option<DateTime<Utc>>,
    pub last_run_at: Option<DateTime<Utc>>,
    pub last_run_status: Option<ExecutionStatus>,
}

/// The scheduled constrained-limited identity every invocation runs under.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvocationActorContext {
    pub actor_type: String,
    pub actor_id: Option<String>,
    pub channel: String,
    pub privilege_level: String,
    pub autonomy_level: String,
    pub trace_id: String,
    pub request_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvocationMetadata {
    pub actual_started_at: DateTime<Utc>,
    pub trigger_source: TriggerSource,
    pub callback_id: String,
}

/// Language-neutral payload sent to the agent runtime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvocationRequest {
    pub execution: InvocationExecution,
    pub task_intent: InvocationTaskIntent,
    pub schedule: InvocationSchedule,
    pub actor_context: InvocationActorContext,
    pub metadata: InvocationMetadata,
}

/// Agent runtime port. An error return is treated as `invoker_exception`
/// and flows through the standard retry path.
#[async_trait]
pub trait ExecutionInvoker: Send + Sync {
    async fn invoke(&self, request: &InvocationRequest) -> anyhow::Result<InvocationResult>;
}

/// Failure notification hook, called best-effort after execution updates.
#[async_trait]
pub trait FailureNotificationService: Send + Sync {
    async fn notify_if_needed(&self, execution_id: ExecutionId) -> anyhow::Result<()>;
}

// ============================================================================
// Dispatch outcome
// ============================================================================

/// Outcome of dispatching one callback.
#[derive(Debug, Clone)]
pub enum DispatchOutcome {
    /// An execution ran; `status` is its final recorded state.
    Dispatched {
        execution_id: ExecutionId,
        status: ExecutionStatus,
    },
    /// The callback was already processed under this trace id.
    Duplicate { execution_id: ExecutionId },
    /// A conditional predicate did not hold (or errored); no execution.
    Skipped {
        evaluation_status: EvaluationStatus,
        result_code: String,
    },
}

// ============================================================================
// Dispatcher
// ============================================================================

pub struct ExecutionDispatcher {
    pool: PgPool,
    invoker: Arc<dyn ExecutionInvoker>,
    predicate_service: Arc<PredicateEvaluationService>,
    retry_policy: RetryPolicy,
    failure_notifier: Option<Arc<dyn FailureNotificationService>>,
    provider_name: String,
}

impl ExecutionDispatcher {
    pub fn new(
        pool: PgPool,
        invoker: Arc<dyn ExecutionInvoker>,
        predicate_service: Arc<PredicateEvaluationService>,
        retry_policy: RetryPolicy,
    ) -> Self {
        Self {
            pool,
            invoker,
            predicate_service,
            retry_policy,
            failure_notifier: None,
            provider_name: "timer".to_string(),
        }
    }

    pub fn with_failure_notifier(
        mut self,
        notifier: Arc<dyn FailureNotificationService>,
    ) -> Self {
        self.failure_notifier = Some(notifier);
        self
    }

    pub fn with_provider_name(mut self, provider_name: impl Into<String>) -> Self {
        self.provider_name = provider_name.into();
        self
    }

    /// Handle a timer callback end to end.
    pub async fn dispatch(&self, payload: &CallbackPayload) -> Result<DispatchOutcome, DispatchError> {
        let now = Utc::now();
        let scheduled_context = ScheduledActorContext;
        let actor = scheduled_context.execution_actor(&payload.trace_id, payload.trigger_source.as_str());

        // Phase 1: durable execution row, committed before the agent call.
        let prepared = match self.prepare(payload, &actor, now).await? {
            Prepared::Run(request) => request,
            Prepared::Duplicate(execution_id) => {
                return Ok(DispatchOutcome::Duplicate { execution_id })
            }
            Prepared::Skipped {
                evaluation_status,
                result_code,
            } => {
                return Ok(DispatchOutcome::Skipped {
                    evaluation_status,
                    result_code,
                })
            }
        };
        let execution_id = prepared.execution.id;

        // Phase 2: the out-of-transaction agent call.
        let invocation = self.invoker.invoke(&prepared).await;

        // Phase 3: record the outcome and roll the schedule forward.
        let finished_at = Utc::now();
        let status = match invocation {
            Ok(result) => {
                let outcome = match result.status {
                    InvocationStatus::Success => ExecutionOutcome::Success,
                    InvocationStatus::Failure => ExecutionOutcome::Failure,
                    InvocationStatus::Deferred => ExecutionOutcome::Deferred,
                    InvocationStatus::Unknown => ExecutionOutcome::Unknown,
                };
                let (error_code, error_message) = invocation_error_fields(&result);
                let status = self
                    .record_outcome(
                        execution_id,
                        &actor,
                        outcome,
                        error_code,
                        error_message,
                        finished_at,
                    )
                    .await?;
                self.notify_failure_if_needed(execution_id).await;
                status
            }
            Err(invoke_error) => {
                let status = self
                    .record_outcome(
                        execution_id,
                        &actor,
                        ExecutionOutcome::Failure,
                        Some("invoker_exception".to_string()),
                        Some(invoke_error.to_string()),
                        finished_at,
                    )
                    .await?;
                self.notify_failure_if_needed(execution_id).await;
                return Err(DispatchError::new(
                    "invoker_exception",
                    format!("agent invocation failed: {invoke_error}"),
                )
                .with_details(serde_json::json!({
                    "execution_id": execution_id,
                    "recorded_status": status.as_str(),
                })));
            }
        };

        Ok(DispatchOutcome::Dispatched {
            execution_id,
            status,
        })
    }

    async fn prepare(
        &self,
        payload: &CallbackPayload,
        actor: &ExecutionActorContext,
        now: DateTime<Utc>,
    ) -> Result<Prepared, DispatchError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(DataAccessError::Database)?;

        let schedule = ScheduleRow::find_by_id(payload.schedule_id, &mut tx)
            .await?
            .ok_or_else(|| {
                DispatchError::new("not_found", "schedule not found").with_details(
                    serde_json::json!({ "schedule_id": payload.schedule_id }),
                )
            })?;
        require_dispatchable(&schedule, payload.trigger_source)?;

        let intent = TaskIntentRow::find_by_id(schedule.task_intent_id, &mut tx)
            .await?
            .ok_or_else(|| DispatchError::new("not_found", "task intent not found"))?;

        if let Some(existing) =
            ExecutionRow::find_by_trace(schedule.id, &payload.trace_id, &mut tx).await?
        {
            return Ok(Prepared::Duplicate(existing.id));
        }

        // Conditional schedules consult the predicate first; a predicate
        // that does not hold advances the evaluation cadence and stops here.
        if schedule.schedule_type == ScheduleType::Conditional {
            let evaluation = self
                .predicate_service
                .evaluate_schedule(
                    schedule.id,
                    &format!("eval-{}", payload.trace_id),
                    payload.scheduled_for,
                    &self.provider_name,
                    1,
                    &payload.trace_id,
                    now,
                    &mut tx,
                )
                .await?;

            if !evaluation.triggered() {
                let definition = schedule.definition()?;
                let next_eval = match definition {
                    ScheduleDefinition::Conditional {
                        evaluation_interval_count,
                        evaluation_interval_unit,
                        ..
                    } => timing::next_conditional_eval(
                        evaluation_interval_count,
                        evaluation_interval_unit,
                        now,
                    ),
                    _ => unreachable!("conditional schedule with non-conditional definition"),
                };

                let error_code = match evaluation.status {
                    EvaluationStatus::Error => Patch::Set(Some(evaluation.result_code.clone())),
                    _ => Patch::Set(None),
                };
                ScheduleRow::update(
                    schedule.id,
                    UpdateSchedule {
                        next_run_at: Patch::Set(Some(next_eval)),
                        last_evaluated_at: Patch::Set(Some(evaluation.evaluated_at)),
                        last_evaluation_status: Patch::Set(Some(evaluation.status)),
                        last_evaluation_error_code: error_code,
                        ..Default::default()
                    },
                    &schedule_update_actor(actor),
                    ScheduleAuditEventType::Update,
                    now,
                    &mut tx,
                )
                .await?;
                tx.commit().await.map_err(DataAccessError::Database)?;
                return Ok(Prepared::Skipped {
                    evaluation_status: evaluation.status,
                    result_code: evaluation.result_code,
                });
            }
        }

        // A retry delivery continues the attempt chain of the execution that
        // scheduled it; anything else starts a fresh budget.
        let prior_retry = if payload.trigger_source == TriggerSource::Retry {
            ExecutionRow::find_latest_retry_scheduled(schedule.id, &mut tx).await?
        } else {
            None
        };
        let (attempt_count, retry_count, max_attempts, strategy) = match &prior_retry {
            Some(prior) => (
                prior.attempt_count + 1,
                prior.retry_count,
                prior.max_attempts,
                prior
                    .retry_backoff_strategy
                    .unwrap_or(self.retry_policy.backoff_strategy),
            ),
            None => (1, 0, self.retry_policy.max_attempts, self.retry_policy.backoff_strategy),
        };

        let execution = match ExecutionRow::create(
            &CreateExecution::builder()
                .task_intent_id(intent.id)
                .schedule_id(schedule.id)
                .scheduled_for(payload.scheduled_for)
                .trace_id(payload.trace_id.clone())
                .attempt_count(attempt_count)
                .retry_count(retry_count)
                .max_attempts(max_attempts)
                .retry_backoff_strategy(Some(strategy))
                .build(),
            actor,
            now,
            &mut tx,
        )
        .await
        {
            Ok(execution) => execution,
            Err(error) if error.is_duplicate_execution() => {
                // Lost a concurrent-delivery race; surface the winner.
                drop(tx);
                let mut conn = self
                    .pool
                    .acquire()
                    .await
                    .map_err(DataAccessError::Database)?;
                let existing =
                    ExecutionRow::find_by_trace(payload.schedule_id, &payload.trace_id, &mut conn)
                        .await?
                        .ok_or_else(|| {
                            DispatchError::new("internal_error", "duplicate execution vanished")
                        })?;
                return Ok(Prepared::Duplicate(existing.id));
            }
            Err(error) => return Err(error.into()),
        };

        let execution = ExecutionRow::update(
            execution.id,
            UpdateExecution {
                status: Patch::Set(ExecutionStatus::Running),
                started_at: Patch::Set(Some(now)),
                ..Default::default()
            },
            actor,
            now,
            &mut tx,
        )
        .await?;

        let request = build_invocation_request(&execution, &schedule, &intent, payload, now)?;
        tx.commit().await.map_err(DataAccessError::Database)?;
        Ok(Prepared::Run(request))
    }

    /// Apply the retry decision table and roll the parent schedule forward.
    async fn record_outcome(
        &self,
        execution_id: ExecutionId,
        actor: &ExecutionActorContext,
        outcome: ExecutionOutcome,
        error_code: Option<String>,
        error_message: Option<String>,
        finished_at: DateTime<Utc>,
    ) -> Result<ExecutionStatus, DispatchError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(DataAccessError::Database)?;

        let execution = ExecutionRow::find_by_id_for_update(execution_id, &mut tx)
            .await?
            .ok_or_else(|| DispatchError::new("not_found", "execution not found"))?;

        let strategy = execution
            .retry_backoff_strategy
            .unwrap_or(self.retry_policy.backoff_strategy);
        let disposition = retry::decide(
            outcome,
            execution.attempt_count,
            execution.max_attempts,
            execution.retry_count,
            execution.failure_count,
            finished_at,
            strategy,
            &self.retry_policy,
            error_code,
            error_message,
        );

        let updates = match &disposition {
            ExecutionDisposition::Succeeded => UpdateExecution {
                status: Patch::Set(ExecutionStatus::Succeeded),
                finished_at: Patch::Set(Some(finished_at)),
                last_error_code: Patch::Set(None),
                last_error_message: Patch::Set(None),
                ..Default::default()
            },
            ExecutionDisposition::RetryScheduled {
                retry_count,
                retry_at,
                strategy,
                failure_count,
            } => UpdateExecution {
                status: Patch::Set(ExecutionStatus::RetryScheduled),
                finished_at: Patch::Set(Some(finished_at)),
                retry_count: Patch::Set(*retry_count),
                retry_backoff_strategy: Patch::Set(Some(*strategy)),
                next_retry_at: Patch::Set(Some(*retry_at)),
                failure_count: Patch::Set(*failure_count),
                ..Default::default()
            },
            ExecutionDisposition::Failed {
                failure_count,
                error_code,
                error_message,
            } => UpdateExecution {
                status: Patch::Set(ExecutionStatus::Failed),
                finished_at: Patch::Set(Some(finished_at)),
                failure_count: Patch::Set(*failure_count),
                last_error_code: Patch::Set(error_code.clone()),
                last_error_message: Patch::Set(error_message.clone()),
                ..Default::default()
            },
        };

        let execution = ExecutionRow::update(execution_id, updates, actor, finished_at, &mut tx)
            .await?;
        self.update_parent_schedule(&execution, actor, finished_at, &mut tx)
            .await?;

        tx.commit().await.map_err(DataAccessError::Database)?;
        Ok(execution.status)
    }

    /// Roll schedule run state forward from a finished execution.
    async fn update_parent_schedule(
        &self,
        execution: &ExecutionRow,
        actor: &ExecutionActorContext,
        finished_at: DateTime<Utc>,
        conn: &mut sqlx::PgConnection,
    ) -> Result<(), DispatchError> {
        let schedule = ScheduleRow::find_by_id_for_update(execution.schedule_id, conn)
            .await?
            .ok_or_else(|| DispatchError::new("not_found", "schedule not found"))?;

        let mut updates = UpdateSchedule {
            last_run_at: Patch::Set(Some(finished_at)),
            last_run_status: Patch::Set(Some(execution.status)),
            last_execution_id: Patch::Set(Some(execution.id)),
            ..Default::default()
        };

        match schedule.definition()? {
            ScheduleDefinition::Interval {
                interval_count,
                interval_unit,
                anchor_at,
            } => {
                let anchor = anchor_at.unwrap_or(schedule.created_at);
                updates.next_run_at = Patch::Set(Some(timing::next_interval(
                    interval_count,
                    interval_unit,
                    anchor,
                    execution.scheduled_for,
                )));
            }
            ScheduleDefinition::CalendarRule {
                rrule,
                calendar_anchor_at,
            } => {
                match timing::next_calendar(
                    &rrule,
                    calendar_anchor_at.or(Some(schedule.created_at)),
                    execution.scheduled_for,
                    &schedule.timezone,
                ) {
                    Ok(next) => updates.next_run_at = Patch::Set(next),
                    Err(timing_error) => {
                        warn!(
                            schedule_id = %schedule.id,
                            %timing_error,
                            "could not compute next calendar occurrence"
                        );
                    }
                }
            }
            ScheduleDefinition::OneTime { .. } => {
                updates.next_run_at = Patch::Set(None);
                if execution.status == ExecutionStatus::Succeeded {
                    updates.state = Patch::Set(ScheduleState::Completed);
                }
            }
            ScheduleDefinition::Conditional { .. } => {
                // Evaluation cadence was already advanced when the predicate
                // triggered; the next callback is the engine's business.
            }
        }

        updates.failure_count = match execution.status {
            ExecutionStatus::Failed | ExecutionStatus::RetryScheduled => {
                Patch::Set(schedule.failure_count + 1)
            }
            ExecutionStatus::Succeeded => Patch::Set(0),
            _ => Patch::Keep,
        };

        ScheduleRow::update(
            schedule.id,
            updates,
            &schedule_update_actor(actor),
            ScheduleAuditEventType::Update,
            finished_at,
            conn,
        )
        .await?;
        Ok(())
    }

    async fn notify_failure_if_needed(&self, execution_id: ExecutionId) {
        let Some(notifier) = &self.failure_notifier else {
            return;
        };
        if let Err(notify_error) = notifier.notify_if_needed(execution_id).await {
            error!(
                execution_id = %execution_id,
                %notify_error,
                "failure notification failed"
            );
        }
    }
}

enum Prepared {
    Run(InvocationRequest),
    Duplicate(ExecutionId),
    Skipped {
        evaluation_status: EvaluationStatus,
        result_code: String,
    },
}

/// Dispatch requires an active schedule; `run_now` may also fire a paused
/// one. Terminal states never dispatch.
fn require_dispatchable(
    schedule: &ScheduleRow,
    trigger_source: TriggerSource,
) -> Result<(), DispatchError> {
    if schedule.state == ScheduleState::Active {
        return Ok(());
    }
    if trigger_source == TriggerSource::RunNow && schedule.state == ScheduleState::Paused {
        return Ok(());
    }
    Err(
        DispatchError::new("schedule_inactive", "schedule must be active to dispatch")
            .with_details(serde_json::json!({
                "schedule_id": schedule.id,
                "state": schedule.state.as_str(),
            })),
    )
}

/// Schedule rollup updates run under the system actor, not the scheduled
/// one; the scheduled actor type is reserved for execution rows.
fn schedule_update_actor(actor: &ExecutionActorContext) -> ActorContext {
    ActorContext {
        actor_type: "system".to_string(),
        actor_id: None,
        channel: "scheduler".to_string(),
        trace_id: actor.trace_id.clone(),
        request_id: actor.request_id.clone(),
        reason: Some("execution_update".to_string()),
    }
}

fn invocation_error_fields(result: &InvocationResult) -> (Option<String>, Option<String>) {
    match result.status {
        InvocationStatus::Success => (None, None),
        InvocationStatus::Unknown => (
            None,
            Some(format!("Unknown invocation status for result_code {}.", result.result_code)),
        ),
        _ => match &result.error {
            Some(error) => (
                Some(error.error_code.clone()),
                Some(error.error_message.clone()),
            ),
            None => (Some(result.result_code.clone()), result.message.clone()),
        },
    }
}

fn build_invocation_request(
    execution: &ExecutionRow,
    schedule: &ScheduleRow,
    intent: &TaskIntentRow,
    payload: &CallbackPayload,
    now: DateTime<Utc>,
) -> Result<InvocationRequest, DispatchError> {
    let scheduled_context = ScheduledActorContext;
    Ok(InvocationRequest {
        execution: InvocationExecution {
            id: execution.id,
            schedule_id: execution.schedule_id,
            task_intent_id: execution.task_intent_id,
            scheduled_for: execution.scheduled_for,
            attempt_number: execution.attempt_count,
            max_attempts: execution.max_attempts,
            backoff_strategy: execution.retry_backoff_strategy,
            retry_after: execution.next_retry_at,
            trace_id: payload.trace_id.clone(),
        },
        task_intent: InvocationTaskIntent {
            summary: intent.summary.clone(),
            details: intent.details.clone(),
            origin_reference: intent.origin_reference.clone(),
        },
        schedule: InvocationSchedule {
            schedule_type: schedule.schedule_type,
            timezone: schedule.timezone.clone(),
            definition: schedule.definition()?,
            next_run_at: schedule.next_run_at,
            last_run_at: schedule.last_run_at,
            last_run_status: schedule.last_run_status,
        },
        actor_context: InvocationActorContext {
            actor_type: scheduled_context.actor_type().to_string(),
            actor_id: None,
            channel: scheduled_context.channel().to_string(),
            privilege_level: scheduled_context.privilege_level().to_string(),
            autonomy_level: scheduled_context.autonomy_level().to_string(),
            trace_id: payload.trace_id.clone(),
            request_id: None,
        },
        metadata: InvocationMetadata {
            actual_started_at: now,
            trigger_source: payload.trigger_source,
            callback_id: payload.trace_id.clone(),
        },
    })
}
