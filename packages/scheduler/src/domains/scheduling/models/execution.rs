//! Execution model: one invocation attempt for a schedule firing.
//!
//! The `(schedule_id, trace_id)` pair is the idempotency key: the unique
//! constraint on it is what makes duplicate callback delivery harmless even
//! under concurrent dispatch.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgConnection};
use typed_builder::TypedBuilder;

use crate::common::pagination::Cursor;
use crate::common::{ExecutionId, Patch, ScheduleId, TaskIntentId};
use crate::domains::scheduling::actor::ExecutionActorContext;
use crate::text_enum;

use super::audit::ExecutionAuditRow;
use super::{validate_execution_actor_context, DataAccessError};

// ============================================================================
// Enums
// ============================================================================

text_enum! {
    /// Lifecycle status of an execution.
    ///
    /// `retry_scheduled` is an intermediate state; the retry itself arrives
    /// as a *new* execution row under a fresh trace id.
    pub enum ExecutionStatus {
        Queued => "queued",
        Running => "running",
        Succeeded => "succeeded",
        Failed => "failed",
        RetryScheduled => "retry_scheduled",
        Canceled => "canceled",
    }
}

text_enum! {
    pub enum BackoffStrategy {
        Fixed => "fixed",
        Exponential => "exponential",
        None => "none",
    }
}

impl ExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionStatus::Succeeded | ExecutionStatus::Failed | ExecutionStatus::Canceled
        )
    }
}

// ============================================================================
// Row model
// ============================================================================

/// A stored execution attempt.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ExecutionRow {
    pub id: ExecutionId,
    pub task_intent_id: TaskIntentId,
    pub schedule_id: ScheduleId,
    pub scheduled_for: DateTime<Utc>,
    pub trace_id: String,
    pub status: ExecutionStatus,
    pub attempt_count: i32,
    pub retry_count: i32,
    pub max_attempts: i32,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub failure_count: i32,
    pub retry_backoff_strategy: Option<BackoffStrategy>,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub last_error_code: Option<String>,
    pub last_error_message: Option<String>,
    pub actor_type: String,
    pub actor_context: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// ============================================================================
// Creation / update parameter structs
// ============================================================================

#[derive(Debug, Clone, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct CreateExecution {
    pub task_intent_id: TaskIntentId,
    pub schedule_id: ScheduleId,
    pub scheduled_for: DateTime<Utc>,
    pub trace_id: String,
    #[builder(default = ExecutionStatus::Queued)]
    pub status: ExecutionStatus,
    #[builder(default = 1)]
    pub attempt_count: i32,
    #[builder(default = 0)]
    pub retry_count: i32,
    #[builder(default = 1)]
    pub max_attempts: i32,
    #[builder(default)]
    pub retry_backoff_strategy: Option<BackoffStrategy>,
    #[builder(default)]
    pub next_retry_at: Option<DateTime<Utc>>,
}

/// Partial update of an execution; only `Set` fields are written.
#[derive(Debug, Clone, Default)]
pub struct UpdateExecution {
    pub status: Patch<ExecutionStatus>,
    pub attempt_count: Patch<i32>,
    pub retry_count: Patch<i32>,
    pub max_attempts: Patch<i32>,
    pub started_at: Patch<Option<DateTime<Utc>>>,
    pub finished_at: Patch<Option<DateTime<Utc>>>,
    pub failure_count: Patch<i32>,
    pub retry_backoff_strategy: Patch<Option<BackoffStrategy>>,
    pub next_retry_at: Patch<Option<DateTime<Utc>>>,
    pub last_error_code: Patch<Option<String>>,
    pub last_error_message: Patch<Option<String>>,
}

/// Filters for execution listing; all conditions compose conjunctively.
#[derive(Debug, Clone, Default)]
pub struct ExecutionListFilter {
    pub schedule_id: Option<ScheduleId>,
    pub task_intent_id: Option<TaskIntentId>,
    pub status: Option<ExecutionStatus>,
    pub created_after: Option<DateTime<Utc>>,
    pub created_before: Option<DateTime<Utc>>,
    pub limit: Option<i64>,
    pub cursor: Option<Cursor>,
}

fn check_invariants(row: &ExecutionRow) -> Result<(), DataAccessError> {
    if row.attempt_count < 1 {
        return Err(DataAccessError::validation("attempt_count must be >= 1"));
    }
    if row.attempt_count > row.max_attempts {
        return Err(DataAccessError::validation(
            "attempt_count cannot exceed max_attempts",
        ));
    }
    if row.status == ExecutionStatus::RetryScheduled {
        if row.next_retry_at.is_none() {
            return Err(DataAccessError::validation(
                "retry_scheduled requires next_retry_at",
            ));
        }
        if row.attempt_count >= row.max_attempts {
            return Err(DataAccessError::validation(
                "retry_scheduled requires remaining attempts",
            ));
        }
    }
    Ok(())
}

// ============================================================================
// Queries
// ============================================================================

impl ExecutionRow {
    pub async fn find_by_id(
        id: ExecutionId,
        conn: &mut PgConnection,
    ) -> Result<Option<Self>, DataAccessError> {
        let row = sqlx::query_as::<_, Self>("SELECT * FROM executions WHERE id = $1")
            .bind(id)
            .fetch_optional(&mut *conn)
            .await?;
        Ok(row)
    }

    pub async fn find_by_id_for_update(
        id: ExecutionId,
        conn: &mut PgConnection,
    ) -> Result<Option<Self>, DataAccessError> {
        let row = sqlx::query_as::<_, Self>("SELECT * FROM executions WHERE id = $1 FOR UPDATE")
            .bind(id)
            .fetch_optional(&mut *conn)
            .await?;
        Ok(row)
    }

    /// Idempotency lookup: the execution created for a callback delivery.
    pub async fn find_by_trace(
        schedule_id: ScheduleId,
        trace_id: &str,
        conn: &mut PgConnection,
    ) -> Result<Option<Self>, DataAccessError> {
        let row = sqlx::query_as::<_, Self>(
            "SELECT * FROM executions WHERE schedule_id = $1 AND trace_id = $2",
        )
        .bind(schedule_id)
        .bind(trace_id)
        .fetch_optional(&mut *conn)
        .await?;
        Ok(row)
    }

    /// The most recent execution awaiting retry for a schedule.
    ///
    /// Retry deliveries continue this row's attempt chain instead of
    /// starting a fresh budget.
    pub async fn find_latest_retry_scheduled(
        schedule_id: ScheduleId,
        conn: &mut PgConnection,
    ) -> Result<Option<Self>, DataAccessError> {
        let row = sqlx::query_as::<_, Self>(
            r#"
            SELECT * FROM executions
            WHERE schedule_id = $1 AND status = 'retry_scheduled'
            ORDER BY created_at DESC, id DESC
            LIMIT 1
            "#,
        )
        .bind(schedule_id)
        .fetch_optional(&mut *conn)
        .await?;
        Ok(row)
    }

    /// List executions matching the filter, newest first, keyset-paginated.
    pub async fn list(
        filter: &ExecutionListFilter,
        conn: &mut PgConnection,
    ) -> Result<Vec<Self>, DataAccessError> {
        let limit = crate::common::pagination::clamp_limit(filter.limit);
        let rows = sqlx::query_as::<_, Self>(
            r#"
            SELECT * FROM executions
            WHERE ($1::uuid IS NULL OR schedule_id = $1)
              AND ($2::uuid IS NULL OR task_intent_id = $2)
              AND ($3::text IS NULL OR status = $3)
              AND ($4::timestamptz IS NULL OR created_at >= $4)
              AND ($5::timestamptz IS NULL OR created_at <= $5)
              AND ($6::timestamptz IS NULL OR (created_at, id) < ($6, $7))
            ORDER BY created_at DESC, id DESC
            LIMIT $8
            "#,
        )
        .bind(filter.schedule_id)
        .bind(filter.task_intent_id)
        .bind(filter.status.map(|s| s.as_str()))
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

impl ExecutionRow {
    /// Create an execution record and write its audit entry.
    ///
    /// A concurrent duplicate delivery loses the race on the
    /// `(schedule_id, trace_id)` unique constraint; callers detect that with
    /// [`DataAccessError::is_duplicate_execution`].
    pub async fn create(
        input: &CreateExecution,
        actor: &ExecutionActorContext,
        now: DateTime<Utc>,
        conn: &mut PgConnection,
    ) -> Result<Self, DataAccessError> {
        validate_execution_actor_context(actor)?;
        if input.trace_id.trim().is_empty() {
            return Err(DataAccessError::validation("trace_id is required"));
        }

        let row = sqlx::query_as::<_, Self>(
            r#"
            INSERT INTO executions (
                id, task_intent_id, schedule_id, scheduled_for, trace_id,
                status, attempt_count, retry_count, max_attempts,
                failure_count, retry_backoff_strategy, next_retry_at,
                actor_type, actor_context, created_at, updated_at
            )
            VALUES (
                $1, $2, $3, $4, $5,
                $6, $7, $8, $9,
                0, $10, $11,
                $12, $13, $14, $14
            )
            RETURNING *
            "#,
        )
        .bind(ExecutionId::new())
        .bind(input.task_intent_id)
        .bind(input.schedule_id)
        .bind(input.scheduled_for)
        .bind(&input.trace_id)
        .bind(input.status)
        .bind(input.attempt_count)
        .bind(input.retry_count)
        .bind(input.max_attempts)
        .bind(input.retry_backoff_strategy)
        .bind(input.next_retry_at)
        .bind(&actor.actor_type)
        .bind(&actor.actor_context)
        .bind(now)
        .fetch_one(&mut *conn)
        .await?;

        check_invariants(&row)?;
        ExecutionAuditRow::append(&row, actor, now, conn).await?;
        Ok(row)
    }

    /// Apply a partial update and write the status-change audit entry.
    pub async fn update(
        id: ExecutionId,
        updates: UpdateExecution,
        actor: &ExecutionActorContext,
        now: DateTime<Utc>,
        conn: &mut PgConnection,
    ) -> Result<Self, DataAccessError> {
        validate_execution_actor_context(actor)?;

        let mut execution = Self::find_by_id_for_update(id, conn)
            .await?
            .ok_or(DataAccessError::not_found("execution"))?;

        if let Some(status) = updates.status.into_set() {
            execution.status = status;
        }
        if let Some(attempt_count) = updates.attempt_count.into_set() {
            execution.attempt_count = attempt_count;
        }
        if let Some(retry_count) = updates.retry_count.into_set() {
            execution.retry_count = retry_count;
        }
        if let Some(max_attempts) = updates.max_attempts.into_set() {
            execution.max_attempts = max_attempts;
        }
        if let Some(started_at) = updates.started_at.into_set() {
            execution.started_at = started_at;
        }
        if let Some(finished_at) = updates.finished_at.into_set() {
            execution.finished_at = finished_at;
        }
        if let Some(failure_count) = updates.failure_count.into_set() {
            execution.failure_count = failure_count;
        }
        if let Some(strategy) = updates.retry_backoff_strategy.into_set() {
            execution.retry_backoff_strategy = strategy;
        }
        if let Some(next_retry_at) = updates.next_retry_at.into_set() {
            execution.next_retry_at = next_retry_at;
        }
        if let Some(last_error_code) = updates.last_error_code.into_set() {
            execution.last_error_code = last_error_code;
        }
        if let Some(last_error_message) = updates.last_error_message.into_set() {
            execution.last_error_message = last_error_message;
        }
        execution.updated_at = now;

        check_invariants(&execution)?;

        let row = sqlx::query_as::<_, Self>(
            r#"
            UPDATE executions SET
                status = $2,
                attempt_count = $3,
                retry_count = $4,
                max_attempts = $5,
                started_at = $6,
                finished_at = $7,
                failure_count = $8,
                retry_backoff_strategy = $9,
                next_retry_at = $10,
                last_error_code = $11,
                last_error_message = $12,
                updated_at = $13
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(execution.id)
        .bind(execution.status)
        .bind(execution.attempt_count)
        .bind(execution.retry_count)
        .bind(execution.max_attempts)
        .bind(execution.started_at)
        .bind(execution.finished_at)
        .bind(execution.failure_count)
        .bind(execution.retry_backoff_strategy)
        .bind(execution.next_retry_at)
        .bind(execution.last_error_code.as_deref())
        .bind(execution.last_error_message.as_deref())
        .bind(execution.updated_at)
        .fetch_one(&mut *conn)
        .await?;

        ExecutionAuditRow::append(&row, actor, now, conn).await?;
        Ok(row)
    }
}

impl DataAccessError {
    /// True when an insert lost the `(schedule_id, trace_id)` race.
    pub fn is_duplicate_execution(&self) -> bool {
        match self {
            DataAccessError::Database(sqlx::Error::Database(db)) => db
                .constraint()
                .map(|name| name == "uq_executions_schedule_trace")
                .unwrap_or(false),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn base_row() -> ExecutionRow {
        let now = Utc.with_ymd_and_hms(2025, 2, 6, 10, 0, 0).unwrap();
        ExecutionRow {
            id: ExecutionId::new(),
            task_intent_id: TaskIntentId::new(),
            schedule_id: ScheduleId::new(),
            scheduled_for: now,
            trace_id: "cb-1".into(),
            status: ExecutionStatus::Queued,
            attempt_count: 1,
            retry_count: 0,
            max_attempts: 2,
            started_at: None,
            finished_at: None,
            failure_count: 0,
            retry_backoff_strategy: None,
            next_retry_at: None,
            last_error_code: None,
            last_error_message: None,
            actor_type: "scheduled".into(),
            actor_context: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn test_invariant_attempt_bound() {
        let mut row = base_row();
        row.attempt_count = 3;
        assert!(check_invariants(&row).is_err());
        row.attempt_count = 2;
        assert!(check_invariants(&row).is_ok());
    }

    #[test]
    fn test_invariant_retry_scheduled_needs_retry_at_and_headroom() {
        let mut row = base_row();
        row.status = ExecutionStatus::RetryScheduled;
        assert!(check_invariants(&row).is_err());

        row.next_retry_at = Some(row.scheduled_for + chrono::Duration::seconds(300));
        assert!(check_invariants(&row).is_ok());

        row.attempt_count = row.max_attempts;
        assert!(check_invariants(&row).is_err());
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(ExecutionStatus::Succeeded.is_terminal());
        assert!(ExecutionStatus::Failed.is_terminal());
        assert!(ExecutionStatus::Canceled.is_terminal());
        assert!(!ExecutionStatus::RetryScheduled.is_terminal());
        assert!(!ExecutionStatus::Running.is_terminal());
    }
}
