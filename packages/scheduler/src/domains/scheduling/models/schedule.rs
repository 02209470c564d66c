//! Schedule model: the timing envelope around a task intent.
//!
//! A schedule owns its execution history and audit trail. Its definition is
//! a tagged variant per schedule type; the nullable definition columns of the
//! `schedules` table are populated exactly for the fields of the active
//! variant and re-tagged on load.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgConnection};
use typed_builder::TypedBuilder;

use crate::common::pagination::Cursor;
use crate::common::{ExecutionId, Patch, ScheduleId, TaskIntentId};
use crate::domains::scheduling::actor::ActorContext;
use crate::domains::scheduling::timing;
use crate::text_enum;

use super::audit::{ScheduleAuditEventType, ScheduleAuditRow};
use super::execution::ExecutionStatus;
use super::task_intent::{TaskIntentInput, TaskIntentRow};
use super::{diff_summary, validate_actor_context, validate_timezone, DataAccessError};

// ============================================================================
// Enums
// ============================================================================

text_enum! {
    /// Timing discipline of a schedule.
    pub enum ScheduleType {
        OneTime => "one_time",
        Interval => "interval",
        CalendarRule => "calendar_rule",
        Conditional => "conditional",
    }
}

text_enum! {
    /// Lifecycle state of a schedule.
    pub enum ScheduleState {
        Draft => "draft",
        Active => "active",
        Paused => "paused",
        Canceled => "canceled",
        Archived => "archived",
        Completed => "completed",
    }
}

text_enum! {
    pub enum IntervalUnit {
        Minute => "minute",
        Hour => "hour",
        Day => "day",
        Week => "week",
        Month => "month",
    }
}

text_enum! {
    /// Cadence units for conditional predicate evaluation.
    pub enum EvaluationIntervalUnit {
        Minute => "minute",
        Hour => "hour",
        Day => "day",
        Week => "week",
    }
}

text_enum! {
    pub enum PredicateOperator {
        Eq => "eq",
        Neq => "neq",
        Gt => "gt",
        Gte => "gte",
        Lt => "lt",
        Lte => "lte",
        Exists => "exists",
        Matches => "matches",
    }
}

text_enum! {
    /// Outcome of a predicate evaluation.
    pub enum EvaluationStatus {
        True => "true",
        False => "false",
        Error => "error",
    }
}

impl ScheduleState {
    /// Terminal states never produce callbacks and accept no further
    /// transitions except archival.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ScheduleState::Canceled | ScheduleState::Archived | ScheduleState::Completed
        )
    }

    /// Whether a transition between two states is permitted.
    ///
    /// `draft → active ↔ paused`, `active|paused → canceled`,
    /// `active → completed` (one_time success), `* → archived` (admin).
    /// Identity transitions are allowed so idempotent replays do not fault.
    pub fn can_transition(from: ScheduleState, to: ScheduleState) -> bool {
        use ScheduleState::*;
        if from == to {
            return true;
        }
        match (from, to) {
            (_, Archived) => true,
            (Draft, Active) => true,
            (Active, Paused) | (Paused, Active) => true,
            (Active, Canceled) | (Paused, Canceled) => true,
            (Active, Completed) => true,
            _ => false,
        }
    }
}

// ============================================================================
// Definition
// ============================================================================

/// Type-specific schedule definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "schedule_type", rename_all = "snake_case")]
pub enum ScheduleDefinition {
    OneTime {
        run_at: DateTime<Utc>,
    },
    Interval {
        interval_count: i32,
        interval_unit: IntervalUnit,
        anchor_at: Option<DateTime<Utc>>,
    },
    CalendarRule {
        rrule: String,
        calendar_anchor_at: Option<DateTime<Utc>>,
    },
    Conditional {
        predicate_subject: String,
        predicate_operator: PredicateOperator,
        predicate_value: Option<String>,
        evaluation_interval_count: i32,
        evaluation_interval_unit: EvaluationIntervalUnit,
    },
}

/// Names of all definition columns, used for create-audit diff summaries.
const DEFINITION_FIELDS: [&str; 11] = [
    "run_at",
    "interval_count",
    "interval_unit",
    "anchor_at",
    "rrule",
    "calendar_anchor_at",
    "predicate_subject",
    "predicate_operator",
    "predicate_value",
    "evaluation_interval_count",
    "evaluation_interval_unit",
];

impl ScheduleDefinition {
    pub fn schedule_type(&self) -> ScheduleType {
        match self {
            ScheduleDefinition::OneTime { .. } => ScheduleType::OneTime,
            ScheduleDefinition::Interval { .. } => ScheduleType::Interval,
            ScheduleDefinition::CalendarRule { .. } => ScheduleType::CalendarRule,
            ScheduleDefinition::Conditional { .. } => ScheduleType::Conditional,
        }
    }

    /// Validate the definition fields for its schedule type.
    pub fn validate(&self) -> Result<(), DataAccessError> {
        match self {
            ScheduleDefinition::OneTime { .. } => Ok(()),
            ScheduleDefinition::Interval { interval_count, .. } => {
                if *interval_count <= 0 {
                    return Err(DataAccessError::validation(
                        "interval_count is required and must be > 0",
                    ));
                }
                Ok(())
            }
            ScheduleDefinition::CalendarRule { rrule, .. } => {
                if rrule.trim().is_empty() {
                    return Err(DataAccessError::validation(
                        "rrule is required for calendar_rule schedules",
                    ));
                }
                timing::validate_rrule(rrule)
                    .map_err(|e| DataAccessError::validation(e.to_string()))
            }
            ScheduleDefinition::Conditional {
                predicate_subject,
                predicate_operator,
                predicate_value,
                evaluation_interval_count,
                ..
            } => {
                if predicate_subject.trim().is_empty() {
                    return Err(DataAccessError::validation(
                        "predicate_subject is required for conditional schedules",
                    ));
                }
                if *predicate_operator != PredicateOperator::Exists {
                    let missing = predicate_value
                        .as_deref()
                        .map(|v| v.trim().is_empty())
                        .unwrap_or(true);
                    if missing {
                        return Err(DataAccessError::validation(
                            "predicate_value is required for conditional schedules",
                        ));
                    }
                }
                if *evaluation_interval_count <= 0 {
                    return Err(DataAccessError::validation(
                        "evaluation_interval_count is required and must be > 0",
                    ));
                }
                Ok(())
            }
        }
    }

    /// Re-tag a definition from the flat schedule columns.
    fn from_row(row: &ScheduleRow) -> Result<Self, DataAccessError> {
        let missing =
            |field: &str| DataAccessError::validation(format!("schedule row missing {field}"));
        match row.schedule_type {
            ScheduleType::OneTime => Ok(ScheduleDefinition::OneTime {
                run_at: row.run_at.ok_or_else(|| missing("run_at"))?,
            }),
            ScheduleType::Interval => Ok(ScheduleDefinition::Interval {
                interval_count: row.interval_count.ok_or_else(|| missing("interval_count"))?,
                interval_unit: row.interval_unit.ok_or_else(|| missing("interval_unit"))?,
                anchor_at: row.anchor_at,
            }),
            ScheduleType::CalendarRule => Ok(ScheduleDefinition::CalendarRule {
                rrule: row.rrule.clone().ok_or_else(|| missing("rrule"))?,
                calendar_anchor_at: row.calendar_anchor_at,
            }),
            ScheduleType::Conditional => Ok(ScheduleDefinition::Conditional {
                predicate_subject: row
                    .predicate_subject
                    .clone()
                    .ok_or_else(|| missing("predicate_subject"))?,
                predicate_operator: row
                    .predicate_operator
                    .ok_or_else(|| missing("predicate_operator"))?,
                predicate_value: row.predicate_value.clone(),
                evaluation_interval_count: row
                    .evaluation_interval_count
                    .ok_or_else(|| missing("evaluation_interval_count"))?,
                evaluation_interval_unit: row
                    .evaluation_interval_unit
                    .ok_or_else(|| missing("evaluation_interval_unit"))?,
            }),
        }
    }

    fn columns(&self) -> DefinitionColumns {
        let mut cols = DefinitionColumns::default();
        match self {
            ScheduleDefinition::OneTime { run_at } => {
                cols.run_at = Some(*run_at);
            }
            ScheduleDefinition::Interval {
                interval_count,
                interval_unit,
                anchor_at,
            } => {
                cols.interval_count = Some(*interval_count);
                cols.interval_unit = Some(*interval_unit);
                cols.anchor_at = *anchor_at;
            }
            ScheduleDefinition::CalendarRule {
                rrule,
                calendar_anchor_at,
            } => {
                cols.rrule = Some(rrule.clone());
                cols.calendar_anchor_at = *calendar_anchor_at;
            }
            ScheduleDefinition::Conditional {
                predicate_subject,
                predicate_operator,
                predicate_value,
                evaluation_interval_count,
                evaluation_interval_unit,
            } => {
                cols.predicate_subject = Some(predicate_subject.clone());
                cols.predicate_operator = Some(*predicate_operator);
                cols.predicate_value = predicate_value.clone();
                cols.evaluation_interval_count = Some(*evaluation_interval_count);
                cols.evaluation_interval_unit = Some(*evaluation_interval_unit);
            }
        }
        cols
    }
}

/// Flat definition columns as stored on the schedules table.
#[derive(Debug, Clone, Default)]
struct DefinitionColumns {
    run_at: Option<DateTime<Utc>>,
    interval_count: Option<i32>,
    interval_unit: Option<IntervalUnit>,
    anchor_at: Option<DateTime<Utc>>,
    rrule: Option<String>,
    calendar_anchor_at: Option<DateTime<Utc>>,
    predicate_subject: Option<String>,
    predicate_operator: Option<PredicateOperator>,
    predicate_value: Option<String>,
    evaluation_interval_count: Option<i32>,
    evaluation_interval_unit: Option<EvaluationIntervalUnit>,
}

// ============================================================================
// Row model
// ============================================================================

/// A stored schedule.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ScheduleRow {
    pub id: ScheduleId,
    pub task_intent_id: TaskIntentId,
    pub schedule_type: ScheduleType,
    pub state: ScheduleState,
    pub timezone: String,
    pub next_run_at: Option<DateTime<Utc>>,
    pub last_run_at: Option<DateTime<Utc>>,
    pub last_run_status: Option<ExecutionStatus>,
    pub failure_count: i32,
    pub last_execution_id: Option<ExecutionId>,
    pub created_by_actor_type: String,
    pub created_by_actor_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub run_at: Option<DateTime<Utc>>,
    pub interval_count: Option<i32>,
    pub interval_unit: Option<IntervalUnit>,
    pub anchor_at: Option<DateTime<Utc>>,
    pub rrule: Option<String>,
    pub calendar_anchor_at: Option<DateTime<Utc>>,
    pub predicate_subject: Option<String>,
    pub predicate_operator: Option<PredicateOperator>,
    pub predicate_value: Option<String>,
    pub evaluation_interval_count: Option<i32>,
    pub evaluation_interval_unit: Option<EvaluationIntervalUnit>,
    pub last_evaluated_at: Option<DateTime<Utc>>,
    pub last_evaluation_status: Option<EvaluationStatus>,
    pub last_evaluation_error_code: Option<String>,
}

// ============================================================================
// Creation / update parameter structs
// ============================================================================

/// Input for creating a schedule together with its task intent.
///
/// A schedule is always born with its intent, in one transaction.
#[derive(Debug, Clone, TypedBuilder)]
pub struct CreateScheduleWithIntent {
    pub task_intent: TaskIntentInput,
    pub timezone: String,
    pub definition: ScheduleDefinition,
    #[builder(default = ScheduleState::Active)]
    pub state: ScheduleState,
    #[builder(default)]
    pub next_run_at: Option<DateTime<Utc>>,
}

/// Partial update of a schedule; only `Set` fields are written.
#[derive(Debug, Clone, Default)]
pub struct UpdateSchedule {
    pub timezone: Patch<String>,
    pub state: Patch<ScheduleState>,
    pub next_run_at: Patch<Option<DateTime<Utc>>>,
    pub last_run_at: Patch<Option<DateTime<Utc>>>,
    pub last_run_status: Patch<Option<ExecutionStatus>>,
    pub failure_count: Patch<i32>,
    pub last_execution_id: Patch<Option<ExecutionId>>,
    pub last_evaluated_at: Patch<Option<DateTime<Utc>>>,
    pub last_evaluation_status: Patch<Option<EvaluationStatus>>,
    pub last_evaluation_error_code: Patch<Option<String>>,
    pub definition: Patch<ScheduleDefinition>,
}

/// Filters for schedule listing; all conditions compose conjunctively.
#[derive(Debug, Clone, Default)]
pub struct ScheduleListFilter {
    pub state: Option<ScheduleState>,
    pub schedule_type: Option<ScheduleType>,
    pub created_by_actor_type: Option<String>,
    pub created_after: Option<DateTime<Utc>>,
    pub created_before: Option<DateTime<Utc>>,
    pub limit: Option<i64>,
    pub cursor: Option<Cursor>,
}

/// Outcome of a schedule mutation, carrying its audit row.
#[derive(Debug, Clone)]
pub struct ScheduleMutation {
    pub schedule: ScheduleRow,
    pub audit_id: crate::common::ScheduleAuditId,
    /// True when the audit append deduped on `(entity, event, request_id)`,
    /// i.e. this mutation replayed an already-applied command.
    pub audit_replayed: bool,
}

// ============================================================================
// Queries
// ============================================================================

impl ScheduleRow {
    /// The typed definition of this schedule.
    pub fn definition(&self) -> Result<ScheduleDefinition, DataAccessError> {
        ScheduleDefinition::from_row(self)
    }

    pub async fn find_by_id(
        id: ScheduleId,
        conn: &mut PgConnection,
    ) -> Result<Option<Self>, DataAccessError> {
        let row = sqlx::query_as::<_, Self>("SELECT * FROM schedules WHERE id = $1")
            .bind(id)
            .fetch_optional(&mut *conn)
            .await?;
        Ok(row)
    }

    /// Fetch a schedule with a row lock for update within the transaction.
    pub async fn find_by_id_for_update(
        id: ScheduleId,
        conn: &mut PgConnection,
    ) -> Result<Option<Self>, DataAccessError> {
        let row = sqlx::query_as::<_, Self>("SELECT * FROM schedules WHERE id = $1 FOR UPDATE")
            .bind(id)
            .fetch_optional(&mut *conn)
            .await?;
        Ok(row)
    }

    /// Active schedules due at or before the provided timestamp.
    pub async fn find_due(
        now: DateTime<Utc>,
        conn: &mut PgConnection,
    ) -> Result<Vec<Self>, DataAccessError> {
        let rows = sqlx::query_as::<_, Self>(
            r#"
            SELECT * FROM schedules
            WHERE state = 'active' AND next_run_at IS NOT NULL AND next_run_at <= $1
            ORDER BY next_run_at ASC
            "#,
        )
        .bind(now)
        .fetch_all(&mut *conn)
        .await?;
        Ok(rows)
    }

    pub async fn find_active(conn: &mut PgConnection) -> Result<Vec<Self>, DataAccessError> {
        let rows =
            sqlx::query_as::<_, Self>("SELECT * FROM schedules WHERE state = 'active'")
                .fetch_all(&mut *conn)
                .await?;
        Ok(rows)
    }

    /// List schedules matching the filter, newest first, keyset-paginated.
    pub async fn list(
        filter: &ScheduleListFilter,
        conn: &mut PgConnection,
    ) -> Result<Vec<Self>, DataAccessError> {
        let limit = crate::common::pagination::clamp_limit(filter.limit);
        let rows = sqlx::query_as::<_, Self>(
            r#"
            SELECT * FROM schedules
            WHERE ($1::text IS NULL OR state = $1)
              AND ($2::text IS NULL OR schedule_type = $2)
              AND ($3::text IS NULL OR created_by_actor_type = $3)
              AND ($4::timestamptz IS NULL OR created_at >= $4)
              AND ($5::timestamptz IS NULL OR created_at <= $5)
              AND ($6::timestamptz IS NULL OR (created_at, id) < ($6, $7))
            ORDER BY created_at DESC, id DESC
            LIMIT $8
            "#,
        )
        .bind(filter.state.map(|s| s.as_str()))
        .bind(filter.schedule_type.map(|t| t.as_str()))
        .bind(&filter.created_by_actor_type)
        .bind(filter.created_after)
        .bind(filter.created_before)
        .bind(filter.cursor.map(|c| c.sort_key))
        .bind(filter.cursor.map(|c| c.id))
        .bind(limit + 1)
        .fetch_all(&mut *conn)
        .await?;
        Ok(rows)
    }
}

// ============================================================================
// Mutations
// ============================================================================

impl ScheduleRow {
    /// Create a schedule and its task intent in one transaction scope,
    /// writing the `create` audit entry.
    pub async fn create_with_intent(
        input: &CreateScheduleWithIntent,
        actor: &ActorContext,
        now: DateTime<Utc>,
        conn: &mut PgConnection,
    ) -> Result<(TaskIntentRow, ScheduleMutation), DataAccessError> {
        validate_actor_context(actor, false)?;
        validate_timezone(&input.timezone)?;
        input.definition.validate()?;
        if !matches!(input.state, ScheduleState::Draft | ScheduleState::Active | ScheduleState::Paused)
        {
            return Err(DataAccessError::validation(format!(
                "schedules cannot start in state {}",
                input.state
            )));
        }

        let intent = TaskIntentRow::create(&input.task_intent, actor, now, conn).await?;
        let cols = input.definition.columns();

        let schedule = sqlx::query_as::<_, Self>(
            r#"
            INSERT INTO schedules (
                id, task_intent_id, schedule_type, state, timezone, next_run_at,
                failure_count, created_by_actor_type, created_by_actor_id,
                created_at, updated_at,
                run_at, interval_count, interval_unit, anchor_at,
                rrule, calendar_anchor_at,
                predicate_subject, predicate_operator, predicate_value,
                evaluation_interval_count, evaluation_interval_unit
            )
            VALUES (
                $1, $2, $3, $4, $5, $6,
                0, $7, $8,
                $9, $9,
                $10, $11, $12, $13,
                $14, $15,
                $16, $17, $18,
                $19, $20
            )
            RETURNING *
            "#,
        )
        .bind(ScheduleId::new())
        .bind(intent.id)
        .bind(input.definition.schedule_type())
        .bind(input.state)
        .bind(&input.timezone)
        .bind(input.next_run_at)
        .bind(&actor.actor_type)
        .bind(&actor.actor_id)
        .bind(now)
        .bind(cols.run_at)
        .bind(cols.interval_count)
        .bind(cols.interval_unit)
        .bind(cols.anchor_at)
        .bind(cols.rrule)
        .bind(cols.calendar_anchor_at)
        .bind(cols.predicate_subject)
        .bind(cols.predicate_operator)
        .bind(cols.predicate_value)
        .bind(cols.evaluation_interval_count)
        .bind(cols.evaluation_interval_unit)
        .fetch_one(&mut *conn)
        .await?;

        let audit = ScheduleAuditRow::append(
            schedule.id,
            schedule.task_intent_id,
            ScheduleAuditEventType::Create,
            actor,
            diff_summary(DEFINITION_FIELDS),
            now,
            conn,
        )
        .await?;

        Ok((
            intent,
            ScheduleMutation {
                schedule,
                audit_id: audit.id,
                audit_replayed: audit.replayed,
            },
        ))
    }

    /// Apply a partial update and write the audit entry for `event_type`.
    pub async fn update(
        id: ScheduleId,
        updates: UpdateSchedule,
        actor: &ActorContext,
        event_type: ScheduleAuditEventType,
        now: DateTime<Utc>,
        conn: &mut PgConnection,
    ) -> Result<ScheduleMutation, DataAccessError> {
        validate_actor_context(actor, false)?;

        let mut schedule = Self::find_by_id_for_update(id, conn)
            .await?
            .ok_or(DataAccessError::not_found("schedule"))?;

        let mut changes: Vec<&str> = Vec::new();

        if let Some(timezone) = updates.timezone.as_set() {
            validate_timezone(timezone)?;
            schedule.timezone = timezone.clone();
            changes.push("timezone");
        }
        if let Some(state) = updates.state.into_set() {
            if !ScheduleState::can_transition(schedule.state, state) {
                return Err(DataAccessError::InvalidStateTransition {
                    from: schedule.state.to_string(),
                    to: state.to_string(),
                });
            }
            schedule.state = state;
            changes.push("state");
        }
        if let Some(next_run_at) = updates.next_run_at.into_set() {
            schedule.next_run_at = next_run_at;
            changes.push("next_run_at");
        }
        if let Some(last_run_at) = updates.last_run_at.into_set() {
            schedule.last_run_at = last_run_at;
            changes.push("last_run_at");
        }
        if let Some(last_run_status) = updates.last_run_status.into_set() {
            schedule.last_run_status = last_run_status;
            changes.push("last_run_status");
        }
        if let Some(failure_count) = updates.failure_count.into_set() {
            if failure_count < 0 {
                return Err(DataAccessError::validation("failure_count must be >= 0"));
            }
            schedule.failure_count = failure_count;
            changes.push("failure_count");
        }
        if let Some(last_execution_id) = updates.last_execution_id.into_set() {
            schedule.last_execution_id = last_execution_id;
            changes.push("last_execution_id");
        }
        if let Some(last_evaluated_at) = updates.last_evaluated_at.into_set() {
            schedule.last_evaluated_at = last_evaluated_at;
            changes.push("last_evaluated_at");
        }
        if let Some(last_evaluation_status) = updates.last_evaluation_status.into_set() {
            schedule.last_evaluation_status = last_evaluation_status;
            changes.push("last_evaluation_status");
        }
        if let Some(last_evaluation_error_code) = updates.last_evaluation_error_code.into_set() {
            schedule.last_evaluation_error_code = last_evaluation_error_code;
            changes.push("last_evaluation_error_code");
        }
        if let Some(definition) = updates.definition.into_set() {
            if definition.schedule_type() != schedule.schedule_type {
                return Err(DataAccessError::validation(format!(
                    "definition type {} does not match schedule type {}",
                    definition.schedule_type(),
                    schedule.schedule_type
                )));
            }
            definition.validate()?;
            let cols = definition.columns();
            schedule.run_at = cols.run_at;
            schedule.interval_count = cols.interval_count;
            schedule.interval_unit = cols.interval_unit;
            schedule.anchor_at = cols.anchor_at;
            schedule.rrule = cols.rrule;
            schedule.calendar_anchor_at = cols.calendar_anchor_at;
            schedule.predicate_subject = cols.predicate_subject;
            schedule.predicate_operator = cols.predicate_operator;
            schedule.predicate_value = cols.predicate_value;
            schedule.evaluation_interval_count = cols.evaluation_interval_count;
            schedule.evaluation_interval_unit = cols.evaluation_interval_unit;
            changes.push("definition");
        }

        schedule.updated_at = now;

        let schedule = sqlx::query_as::<_, Self>(
            r#"
            UPDATE schedules SET
                state = $2,
                timezone = $3,
                next_run_at = $4,
                last_run_at = $5,
                last_run_status = $6,
                failure_count = $7,
                last_execution_id = $8,
                last_evaluated_at = $9,
                last_evaluation_status = $10,
                last_evaluation_error_code = $11,
                run_at = $12,
                interval_count = $13,
                interval_unit = $14,
                anchor_at = $15,
                rrule = $16,
                calendar_anchor_at = $17,
                predicate_subject = $18,
                predicate_operator = $19,
                predicate_value = $20,
                evaluation_interval_count = $21,
                evaluation_interval_unit = $22,
                updated_at = $23
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(schedule.id)
        .bind(schedule.state)
        .bind(&schedule.timezone)
        .bind(schedule.next_run_at)
        .bind(schedule.last_run_at)
        .bind(schedule.last_run_status)
        .bind(schedule.failure_count)
        .bind(schedule.last_execution_id)
        .bind(schedule.last_evaluated_at)
        .bind(schedule.last_evaluation_status)
        .bind(schedule.last_evaluation_error_code.as_deref())
        .bind(schedule.run_at)
        .bind(schedule.interval_count)
        .bind(schedule.interval_unit)
        .bind(schedule.anchor_at)
        .bind(schedule.rrule.as_deref())
        .bind(schedule.calendar_anchor_at)
        .bind(schedule.predicate_subject.as_deref())
        .bind(schedule.predicate_operator)
        .bind(schedule.predicate_value.as_deref())
        .bind(schedule.evaluation_interval_count)
        .bind(schedule.evaluation_interval_unit)
        .bind(schedule.updated_at)
        .fetch_one(&mut *conn)
        .await?;

        let audit = ScheduleAuditRow::append(
            schedule.id,
            schedule.task_intent_id,
            event_type,
            actor,
            diff_summary(changes),
            now,
            conn,
        )
        .await?;

        Ok(ScheduleMutation {
            schedule,
            audit_id: audit.id,
            audit_replayed: audit.replayed,
        })
    }

    /// Pause a schedule.
    pub async fn pause(
        id: ScheduleId,
        actor: &ActorContext,
        now: DateTime<Utc>,
        conn: &mut PgConnection,
    ) -> Result<ScheduleMutation, DataAccessError> {
        Self::update(
            id,
            UpdateSchedule {
                state: Patch::Set(ScheduleState::Paused),
                ..Default::default()
            },
            actor,
            ScheduleAuditEventType::Pause,
            now,
            conn,
        )
        .await
    }

    /// Resume a paused schedule.
    pub async fn resume(
        id: ScheduleId,
        actor: &ActorContext,
        now: DateTime<Utc>,
        conn: &mut PgConnection,
    ) -> Result<ScheduleMutation, DataAccessError> {
        Self::update(
            id,
            UpdateSchedule {
                state: Patch::Set(ScheduleState::Active),
                ..Default::default()
            },
            actor,
            ScheduleAuditEventType::Resume,
            now,
            conn,
        )
        .await
    }

    /// Cancel a schedule (soft delete; history is retained).
    pub async fn cancel(
        id: ScheduleId,
        actor: &ActorContext,
        now: DateTime<Utc>,
        conn: &mut PgConnection,
    ) -> Result<ScheduleMutation, DataAccessError> {
        Self::update(
            id,
            UpdateSchedule {
                state: Patch::Set(ScheduleState::Canceled),
                ..Default::default()
            },
            actor,
            ScheduleAuditEventType::Delete,
            now,
            conn,
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 2, 6, h, 0, 0).unwrap()
    }

    #[test]
    fn test_state_machine_happy_paths() {
        use ScheduleState::*;
        assert!(ScheduleState::can_transition(Draft, Active));
        assert!(ScheduleState::can_transition(Active, Paused));
        assert!(ScheduleState::can_transition(Paused, Active));
        assert!(ScheduleState::can_transition(Active, Canceled));
        assert!(ScheduleState::can_transition(Paused, Canceled));
        assert!(ScheduleState::can_transition(Active, Completed));
        assert!(ScheduleState::can_transition(Completed, Archived));
    }

    #[test]
    fn test_state_machine_terminal_states() {
        use ScheduleState::*;
        assert!(!ScheduleState::can_transition(Completed, Paused));
        assert!(!ScheduleState::can_transition(Canceled, Active));
        assert!(!ScheduleState::can_transition(Archived, Active));
        assert!(Completed.is_terminal());
        assert!(Canceled.is_terminal());
        assert!(Archived.is_terminal());
        assert!(!Paused.is_terminal());
    }

    #[test]
    fn test_identity_transition_is_allowed() {
        assert!(ScheduleState::can_transition(
            ScheduleState::Paused,
            ScheduleState::Paused
        ));
    }

    #[test]
    fn test_interval_definition_requires_positive_count() {
        let def = ScheduleDefinition::Interval {
            interval_count: 0,
            interval_unit: IntervalUnit::Hour,
            anchor_at: None,
        };
        assert!(matches!(
            def.validate(),
            Err(DataAccessError::Validation(_))
        ));
    }

    #[test]
    fn test_conditional_definition_value_rules() {
        let base = ScheduleDefinition::Conditional {
            predicate_subject: "memory.hygiene.score".into(),
            predicate_operator: PredicateOperator::Lt,
            predicate_value: None,
            evaluation_interval_count: 6,
            evaluation_interval_unit: EvaluationIntervalUnit::Hour,
        };
        assert!(base.validate().is_err());

        let exists = ScheduleDefinition::Conditional {
            predicate_subject: "vault.search/inbox".into(),
            predicate_operator: PredicateOperator::Exists,
            predicate_value: None,
            evaluation_interval_count: 1,
            evaluation_interval_unit: EvaluationIntervalUnit::Day,
        };
        assert!(exists.validate().is_ok());
    }

    #[test]
    fn test_calendar_definition_rejects_unsupported_rrule_parts() {
        let def = ScheduleDefinition::CalendarRule {
            rrule: "FREQ=MONTHLY;BYSETPOS=-1".into(),
            calendar_anchor_at: None,
        };
        let err = def.validate().unwrap_err();
        assert!(err.to_string().contains("BYSETPOS"));
    }

    #[test]
    fn test_definition_schedule_type_tags() {
        let def = ScheduleDefinition::OneTime { run_at: at(10) };
        assert_eq!(def.schedule_type(), ScheduleType::OneTime);
        assert_eq!(def.schedule_type().as_str(), "one_time");
    }
}
