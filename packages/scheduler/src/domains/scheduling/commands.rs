//! Schedule command service: create, update, pause, resume, delete, run-now.
//!
//! Each operation runs its handler inside a managed transaction, commits,
//! and only then synchronizes the timer adapter. The database is the
//! authority; a post-commit adapter failure is audited as
//! `adapter_sync_failed:<event>:<code>` *and* surfaced as an adapter-sync
//! error, leaving the adapter to be reconciled rather than rolling back
//! committed state. Replayed commands (same request id) skip adapter sync.

use chrono::{DateTime, Utc};
use sqlx::PgPool;
use std::sync::Arc;
use tracing::warn;

use crate::common::{Patch, ScheduleId};

use super::actor::ActorContext;
use super::adapter::{AdapterError, SchedulePayload, TimerAdapter, TriggerSource};
use super::interface::{
    ScheduleCreateRequest, ScheduleDeleteRequest, ScheduleDeleteResult, ScheduleMutationResult,
    SchedulePauseRequest, ScheduleResumeRequest, ScheduleRunNowRequest, ScheduleRunNowResult,
    ScheduleServiceError, ScheduleUpdateRequest,
};
use super::models::audit::{ScheduleAuditEventType, ScheduleAuditRow};
use super::models::schedule::{
    CreateScheduleWithIntent, ScheduleDefinition, ScheduleMutation, ScheduleRow, ScheduleState,
    UpdateSchedule,
};
use super::models::{DataAccessError, TaskIntentRow};
use super::timing;

pub struct ScheduleCommandService {
    pool: PgPool,
    adapter: Arc<dyn TimerAdapter>,
}

impl ScheduleCommandService {
    pub fn new(pool: PgPool, adapter: Arc<dyn TimerAdapter>) -> Self {
        Self { pool, adapter }
    }

    /// Create a schedule and task intent from an inline request.
    pub async fn create_schedule(
        &self,
        request: &ScheduleCreateRequest,
        actor: &ActorContext,
    ) -> Result<ScheduleMutationResult, ScheduleServiceError> {
        let now = Utc::now();
        let next_run_at = initial_next_run(&request.definition, now, &request.timezone)?;

        let mut tx = self.pool.begin().await.map_err(DataAccessError::Database)?;
        let (intent, mutation) = ScheduleRow::create_with_intent(
            &CreateScheduleWithIntent::builder()
                .task_intent(request.task_intent.clone())
                .timezone(request.timezone.clone())
                .definition(request.definition.clone())
                .state(request.start_state)
                .next_run_at(next_run_at)
                .build(),
            actor,
            now,
            &mut tx,
        )
        .await?;
        tx.commit().await.map_err(DataAccessError::Database)?;

        if !mutation.audit_replayed {
            let payload = SchedulePayload::from_schedule(&mutation.schedule)?;
            self.sync_adapter(
                self.adapter.register(&payload),
                mutation.schedule.id,
                actor,
                ScheduleAuditEventType::Create,
            )
            .await?;
            if mutation.schedule.state == ScheduleState::Paused {
                self.sync_adapter(
                    self.adapter.pause(mutation.schedule.id),
                    mutation.schedule.id,
                    actor,
                    ScheduleAuditEventType::Pause,
                )
                .await?;
            }
        }

        Ok(mutation_result(intent, mutation))
    }

    /// Update mutable schedule fields.
    pub async fn update_schedule(
        &self,
        request: &ScheduleUpdateRequest,
        actor: &ActorContext,
    ) -> Result<ScheduleMutationResult, ScheduleServiceError> {
        let now = Utc::now();

        let mut tx = self.pool.begin().await.map_err(DataAccessError::Database)?;
        let mutation = ScheduleRow::update(
            request.schedule_id,
            UpdateSchedule {
                timezone: Patch::from(request.timezone.clone()),
                state: Patch::from(request.state),
                definition: Patch::from(request.definition.clone()),
                ..Default::default()
            },
            actor,
            ScheduleAuditEventType::Update,
            now,
            &mut tx,
        )
        .await?;
        let intent = TaskIntentRow::find_by_id(mutation.schedule.task_intent_id, &mut tx)
            .await?
            .ok_or_else(|| {
                ScheduleServiceError::not_found(
                    "task intent not found",
                    serde_json::json!({ "task_intent_id": mutation.schedule.task_intent_id }),
                )
            })?;
        tx.commit().await.map_err(DataAccessError::Database)?;

        if !mutation.audit_replayed {
            self.sync_update_to_adapter(request, &mutation.schedule, actor)
                .await?;
        }

        Ok(mutation_result(intent, mutation))
    }

    /// Pause a schedule.
    pub async fn pause_schedule(
        &self,
        request: &SchedulePauseRequest,
        actor: &ActorContext,
    ) -> Result<ScheduleMutationResult, ScheduleServiceError> {
        let now = Utc::now();
        let actor = actor.with_reason(request.reason.as_deref());

        let mut tx = self.pool.begin().await.map_err(DataAccessError::Database)?;
        let mutation = ScheduleRow::pause(request.schedule_id, &actor, now, &mut tx).await?;
        let intent = TaskIntentRow::find_by_id(mutation.schedule.task_intent_id, &mut tx)
            .await?
            .ok_or_else(|| {
                ScheduleServiceError::not_found("task intent not found", serde_json::Value::Null)
            })?;
        tx.commit().await.map_err(DataAccessError::Database)?;

        if !mutation.audit_replayed {
            self.sync_adapter(
                self.adapter.pause(mutation.schedule.id),
                mutation.schedule.id,
                &actor,
                ScheduleAuditEventType::Pause,
            )
            .await?;
        }

        Ok(mutation_result(intent, mutation))
    }

    /// Resume a paused schedule.
    pub async fn resume_schedule(
        &self,
        request: &ScheduleResumeRequest,
        actor: &ActorContext,
    ) -> Result<ScheduleMutationResult, ScheduleServiceError> {
        let now = Utc::now();
        let actor = actor.with_reason(request.reason.as_deref());

        let mut tx = self.pool.begin().await.map_err(DataAccessError::Database)?;
        let mutation = ScheduleRow::resume(request.schedule_id, &actor, now, &mut tx).await?;
        let intent = TaskIntentRow::find_by_id(mutation.schedule.task_intent_id, &mut tx)
            .await?
            .ok_or_else(|| {
                ScheduleServiceError::not_found("task intent not found", serde_json::Value::Null)
            })?;
        tx.commit().await.map_err(DataAccessError::Database)?;

        if !mutation.audit_replayed {
            self.sync_adapter(
                self.adapter.resume(mutation.schedule.id),
                mutation.schedule.id,
                &actor,
                ScheduleAuditEventType::Resume,
            )
            .await?;
        }

        Ok(mutation_result(intent, mutation))
    }

    /// Delete (cancel) a schedule. History is retained.
    pub async fn delete_schedule(
        &self,
        request: &ScheduleDeleteRequest,
        actor: &ActorContext,
    ) -> Result<ScheduleDeleteResult, ScheduleServiceError> {
        let now = Utc::now();
        let actor = actor.with_reason(request.reason.as_deref());

        let mut tx = self.pool.begin().await.map_err(DataAccessError::Database)?;
        let mutation = ScheduleRow::cancel(request.schedule_id, &actor, now, &mut tx).await?;
        tx.commit().await.map_err(DataAccessError::Database)?;

        if !mutation.audit_replayed {
            self.sync_adapter(
                self.adapter.delete(mutation.schedule.id),
                mutation.schedule.id,
                &actor,
                ScheduleAuditEventType::Delete,
            )
            .await?;
        }

        Ok(ScheduleDeleteResult {
            schedule_id: mutation.schedule.id,
            state: mutation.schedule.state,
            audit_log_id: mutation.audit_id,
        })
    }

    /// Trigger a schedule execution immediately.
    ///
    /// Allowed from `active` or `paused`; terminal states conflict. The
    /// callback carries the caller's trace id so redelivery dedupes.
    pub async fn run_now(
        &self,
        request: &ScheduleRunNowRequest,
        actor: &ActorContext,
    ) -> Result<ScheduleRunNowResult, ScheduleServiceError> {
        let now = Utc::now();
        let actor = actor.with_reason(request.reason.as_deref());

        let mut tx = self.pool.begin().await.map_err(DataAccessError::Database)?;
        let schedule = ScheduleRow::find_by_id(request.schedule_id, &mut tx)
            .await?
            .ok_or_else(|| {
                ScheduleServiceError::not_found(
                    "schedule not found",
                    serde_json::json!({ "schedule_id": request.schedule_id }),
                )
            })?;
        if !matches!(schedule.state, ScheduleState::Active | ScheduleState::Paused) {
            return Err(ScheduleServiceError::conflict(
                "run_now is only allowed for active or paused schedules",
                serde_json::json!({
                    "schedule_id": schedule.id,
                    "state": schedule.state.as_str(),
                }),
            ));
        }

        let scheduled_for = request.requested_for.unwrap_or(now);
        let diff_summary = if schedule.state == ScheduleState::Active {
            "run_now".to_string()
        } else {
            format!("run_now(state={})", schedule.state)
        };
        let audit = ScheduleAuditRow::append(
            schedule.id,
            schedule.task_intent_id,
            ScheduleAuditEventType::RunNow,
            &actor,
            Some(diff_summary),
            now,
            &mut tx,
        )
        .await?;
        tx.commit().await.map_err(DataAccessError::Database)?;

        if !audit.replayed {
            self.sync_adapter(
                self.adapter.trigger_callback(
                    schedule.id,
                    scheduled_for,
                    Some(&actor.trace_id),
                    TriggerSource::RunNow,
                ),
                schedule.id,
                &actor,
                ScheduleAuditEventType::RunNow,
            )
            .await?;
        }

        Ok(ScheduleRunNowResult {
            schedule_id: schedule.id,
            scheduled_for,
            audit_log_id: audit.id,
        })
    }

    /// Route a committed update to the adapter.
    ///
    /// A terminal target state deletes the engine record; definition or
    /// timezone changes update it; pause/resume follow the state change.
    async fn sync_update_to_adapter(
        &self,
        request: &ScheduleUpdateRequest,
        schedule: &ScheduleRow,
        actor: &ActorContext,
    ) -> Result<(), ScheduleServiceError> {
        if matches!(
            request.state,
            Some(ScheduleState::Canceled | ScheduleState::Archived | ScheduleState::Completed)
        ) {
            return self
                .sync_adapter(
                    self.adapter.delete(schedule.id),
                    schedule.id,
                    actor,
                    ScheduleAuditEventType::Update,
                )
                .await;
        }

        if request.definition.is_some() || request.timezone.is_some() {
            let payload = SchedulePayload::from_schedule(schedule)?;
            self.sync_adapter(
                self.adapter.update(&payload),
                schedule.id,
                actor,
                ScheduleAuditEventType::Update,
            )
            .await?;
        }

        match request.state {
            Some(ScheduleState::Paused) => {
                self.sync_adapter(
                    self.adapter.pause(schedule.id),
                    schedule.id,
                    actor,
                    ScheduleAuditEventType::Pause,
                )
                .await
            }
            Some(ScheduleState::Active) => {
                self.sync_adapter(
                    self.adapter.resume(schedule.id),
                    schedule.id,
                    actor,
                    ScheduleAuditEventType::Resume,
                )
                .await
            }
            _ => Ok(()),
        }
    }

    /// Run an adapter call; on failure audit it and surface the sync error.
    async fn sync_adapter(
        &self,
        action: impl std::future::Future<Output = Result<(), AdapterError>>,
        schedule_id: ScheduleId,
        actor: &ActorContext,
        event_type: ScheduleAuditEventType,
    ) -> Result<(), ScheduleServiceError> {
        match action.await {
            Ok(()) => Ok(()),
            Err(adapter_error) => {
                self.record_adapter_failure(schedule_id, actor, event_type, &adapter_error)
                    .await;
                Err(ScheduleServiceError::adapter_sync(
                    schedule_id,
                    event_type,
                    &adapter_error,
                ))
            }
        }
    }

    /// Persist the `adapter_sync_failed:<event>:<code>` audit row so
    /// operator forensics never depend on the caller's logs.
    async fn record_adapter_failure(
        &self,
        schedule_id: ScheduleId,
        actor: &ActorContext,
        event_type: ScheduleAuditEventType,
        adapter_error: &AdapterError,
    ) {
        let tag = format!(
            "adapter_sync_failed:{}:{}",
            event_type.as_str(),
            adapter_error.code
        );
        let failure_actor = ActorContext {
            actor_type: actor.actor_type.clone(),
            actor_id: actor.actor_id.clone(),
            channel: actor.channel.clone(),
            trace_id: actor.trace_id.clone(),
            request_id: None,
            reason: Some(merge_reason(Some(&tag), &adapter_error.message)),
        };

        let result: Result<(), DataAccessError> = async {
            let mut conn = self
                .pool
                .acquire()
                .await
                .map_err(DataAccessError::Database)?;
            let schedule = ScheduleRow::find_by_id(schedule_id, &mut conn)
                .await?
                .ok_or(DataAccessError::not_found("schedule"))?;
            ScheduleAuditRow::append(
                schedule_id,
                schedule.task_intent_id,
                event_type,
                &failure_actor,
                Some(tag.clone()),
                Utc::now(),
                &mut conn,
            )
            .await?;
            Ok(())
        }
        .await;

        if let Err(audit_error) = result {
            warn!(
                schedule_id = %schedule_id,
                %audit_error,
                "failed to record adapter sync audit"
            );
        }
    }
}

fn mutation_result(intent: TaskIntentRow, mutation: ScheduleMutation) -> ScheduleMutationResult {
    ScheduleMutationResult {
        schedule: mutation.schedule,
        task_intent: intent,
        audit_log_id: mutation.audit_id,
    }
}

fn merge_reason(original: Option<&str>, adapter_message: &str) -> String {
    match original {
        Some(original) => format!("{original} | adapter_error: {adapter_message}"),
        None => format!("adapter_error: {adapter_message}"),
    }
}

/// Initial `next_run_at` for a freshly created schedule.
fn initial_next_run(
    definition: &ScheduleDefinition,
    now: DateTime<Utc>,
    timezone: &str,
) -> Result<Option<DateTime<Utc>>, ScheduleServiceError> {
    match definition {
        ScheduleDefinition::OneTime { run_at } => Ok(Some(*run_at)),
        ScheduleDefinition::Interval {
            interval_count,
            interval_unit,
            anchor_at,
        } => Ok(Some(timing::next_interval(
            *interval_count,
            *interval_unit,
            anchor_at.unwrap_or(now),
            now,
        ))),
        ScheduleDefinition::CalendarRule {
            rrule,
            calendar_anchor_at,
        } => timing::next_calendar(rrule, *calendar_anchor_at, now, timezone)
            .map_err(|e| ScheduleServiceError::validation(e.to_string())),
        ScheduleDefinition::Conditional {
            evaluation_interval_count,
            evaluation_interval_unit,
            ..
        } => Ok(Some(timing::next_conditional_eval(
            *evaluation_interval_count,
            *evaluation_interval_unit,
            now,
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domains::scheduling::models::schedule::{EvaluationIntervalUnit, IntervalUnit, PredicateOperator};
    use chrono::TimeZone;

    fn at(h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 2, 6, h, 0, 0).unwrap()
    }

    #[test]
    fn test_merge_reason() {
        assert_eq!(
            merge_reason(None, "engine down"),
            "adapter_error: engine down"
        );
        assert_eq!(
            merge_reason(Some("weekly cleanup"), "engine down"),
            "weekly cleanup | adapter_error: engine down"
        );
    }

    #[test]
    fn test_initial_next_run_one_time_uses_run_at() {
        let next = initial_next_run(
            &ScheduleDefinition::OneTime { run_at: at(10) },
            at(8),
            "UTC",
        )
        .unwrap();
        assert_eq!(next, Some(at(10)));
    }

    #[test]
    fn test_initial_next_run_interval_steps_past_now() {
        let next = initial_next_run(
            &ScheduleDefinition::Interval {
                interval_count: 2,
                interval_unit: IntervalUnit::Hour,
                anchor_at: Some(at(8)),
            },
            at(9),
            "UTC",
        )
        .unwrap();
        assert_eq!(next, Some(at(10)));
    }

    #[test]
    fn test_initial_next_run_conditional_uses_cadence() {
        let next = initial_next_run(
            &ScheduleDefinition::Conditional {
                predicate_subject: "memory.hygiene.score".into(),
                predicate_operator: PredicateOperator::Lt,
                predicate_value: Some("80".into()),
                evaluation_interval_count: 6,
                evaluation_interval_unit: EvaluationIntervalUnit::Hour,
            },
            at(10),
            "UTC",
        )
        .unwrap();
        assert_eq!(next, Some(at(16)));
    }

    #[test]
    fn test_initial_next_run_rejects_bad_rrule() {
        let err = initial_next_run(
            &ScheduleDefinition::CalendarRule {
                rrule: "FREQ=WEEKLY;BYSETPOS=1".into(),
                calendar_anchor_at: None,
            },
            at(10),
            "UTC",
        )
        .unwrap_err();
        assert_eq!(err.code(), "validation_error");
    }
}
