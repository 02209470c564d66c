//! Append-only audit logs for schedules, executions, and predicate
//! evaluations.
//!
//! Appends run on the caller's connection so they are atomic with the
//! enclosing transaction. Rows are never mutated or deleted by the core.
//! Replayed commands dedupe on `(entity_id, event_type, request_id)` when a
//! request id is present: the append becomes a no-op that returns the prior
//! row id.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgConnection};

use crate::common::pagination::Cursor;
use crate::common::{
    ExecutionAuditId, ExecutionId, PredicateEvaluationAuditId, ScheduleAuditId, ScheduleId,
    TaskIntentId,
};
use crate::domains::scheduling::actor::{ActorContext, ExecutionActorContext};
use crate::text_enum;

use super::execution::{ExecutionRow, ExecutionStatus};
use super::schedule::{EvaluationStatus, PredicateOperator};
use super::DataAccessError;

text_enum! {
    /// Audited schedule mutation kinds.
    pub enum ScheduleAuditEventType {
        Create => "create",
        Update => "update",
        Pause => "pause",
        Resume => "resume",
        Delete => "delete",
        RunNow => "run_now",
    }
}

/// Result of an audit append: the row id and whether it was a replay.
#[derive(Debug, Clone, Copy)]
pub struct AuditAppend<Id> {
    pub id: Id,
    pub replayed: bool,
}

// ============================================================================
// Schedule audit log
// ============================================================================

/// One audited schedule mutation.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ScheduleAuditRow {
    pub id: ScheduleAuditId,
    pub schedule_id: ScheduleId,
    pub task_intent_id: TaskIntentId,
    pub event_type: ScheduleAuditEventType,
    pub actor_type: String,
    pub actor_id: Option<String>,
    pub actor_channel: String,
    pub trace_id: String,
    pub request_id: Option<String>,
    pub reason: Option<String>,
    pub diff_summary: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

/// Filters for schedule audit listing.
#[derive(Debug, Clone, Default)]
pub struct ScheduleAuditFilter {
    pub schedule_id: Option<ScheduleId>,
    pub task_intent_id: Option<TaskIntentId>,
    pub event_type: Option<ScheduleAuditEventType>,
    pub occurred_after: Option<DateTime<Utc>>,
    pub occurred_before: Option<DateTime<Utc>>,
    pub limit: Option<i64>,
    pub cursor: Option<Cursor>,
}

impl ScheduleAuditRow {
    /// Persist a schedule audit entry, deduping replays by request id.
    pub async fn append(
        schedule_id: ScheduleId,
        task_intent_id: TaskIntentId,
        event_type: ScheduleAuditEventType,
        actor: &ActorContext,
        diff_summary: Option<String>,
        occurred_at: DateTime<Utc>,
        conn: &mut PgConnection,
    ) -> Result<AuditAppend<ScheduleAuditId>, DataAccessError> {
        if let Some(request_id) = actor.request_id.as_deref().filter(|r| !r.trim().is_empty()) {
            let existing =
                Self::find_by_request_id(schedule_id, event_type, request_id, conn).await?;
            if let Some(row) = existing {
                return Ok(AuditAppend {
                    id: row.id,
                    replayed: true,
                });
            }
        }

        let id: ScheduleAuditId = sqlx::query_scalar(
            r#"
            INSERT INTO schedule_audit_logs (
                id, schedule_id, task_intent_id, event_type,
                actor_type, actor_id, actor_channel,
                trace_id, request_id, reason, diff_summary, occurred_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            RETURNING id
            "#,
        )
        .bind(ScheduleAuditId::new())
        .bind(schedule_id)
        .bind(task_intent_id)
        .bind(event_type)
        .bind(&actor.actor_type)
        .bind(&actor.actor_id)
        .bind(&actor.channel)
        .bind(&actor.trace_id)
        .bind(&actor.request_id)
        .bind(&actor.reason)
        .bind(diff_summary)
        .bind(occurred_at)
        .fetch_one(&mut *conn)
        .await?;

        Ok(AuditAppend {
            id,
            replayed: false,
        })
    }

    pub async fn find_by_id(
        id: ScheduleAuditId,
        conn: &mut PgConnection,
    ) -> Result<Option<Self>, DataAccessError> {
        let row = sqlx::query_as::<_, Self>("SELECT * FROM schedule_audit_logs WHERE id = $1")
            .bind(id)
            .fetch_optional(&mut *conn)
            .await?;
        Ok(row)
    }

    /// The row a replayed command would dedupe against.
    pub async fn find_by_request_id(
        schedule_id: ScheduleId,
        event_type: ScheduleAuditEventType,
        request_id: &str,
        conn: &mut PgConnection,
    ) -> Result<Option<Self>, DataAccessError> {
        let row = sqlx::query_as::<_, Self>(
            r#"
            SELECT * FROM schedule_audit_logs
            WHERE schedule_id = $1 AND event_type = $2 AND request_id = $3
            ORDER BY occurred_at DESC, id DESC
            LIMIT 1
            "#,
        )
        .bind(schedule_id)
        .bind(event_type)
        .bind(request_id)
        .fetch_optional(&mut *conn)
        .await?;
        Ok(row)
    }

    pub async fn list(
        filter: &ScheduleAuditFilter,
        conn: &mut PgConnection,
    ) -> Result<Vec<Self>, DataAccessError> {
        let limit = crate::common::pagination::clamp_limit(filter.limit);
        let rows = sqlx::query_as::<_, Self>(
            r#"
            SELECT * FROM schedule_audit_logs
            WHERE ($1::uuid IS NULL OR schedule_id = $1)
              AND ($2::uuid IS NULL OR task_intent_id = $2)
              AND ($3::text IS NULL OR event_type = $3)
              AND ($4::timestamptz IS NULL OR occurred_at >= $4)
              AND ($5::timestamptz IS NULL OR occurred_at <= $5)
              AND ($6::timestamptz IS NULL OR (occurred_at, id) < ($6, $7))
            ORDER BY occurred_at DESC, id DESC
            LIMIT $8
            "#,
        )
        .bind(filter.schedule_id)
        .bind(filter.task_intent_id)
        .bind(filter.event_type.map(|e| e.as_str()))
        .bind(filter.occurred_after)
        .bind(filter.occurred_before)
        .bind(filter.cursor.map(|c| c.sort_key))
        .bind(filter.cursor.map(|c| c.id))
        .bind(limit + 1)
        .fetch_all(&mut *conn)
        .await?;
        Ok(rows)
    }
}

// ============================================================================
// Execution audit log
// ============================================================================

/// One audited execution status change, snapshotting the full execution.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ExecutionAuditRow {
    pub id: ExecutionAuditId,
    pub execution_id: ExecutionId,
    pub schedule_id: ScheduleId,
    pub task_intent_id: TaskIntentId,
    pub status: ExecutionStatus,
    pub scheduled_for: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub attempt_count: i32,
    pub retry_count: i32,
    pub max_attempts: i32,
    pub failure_count: i32,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub last_error_code: Option<String>,
    pub last_error_message: Option<String>,
    pub actor_type: String,
    pub actor_id: Option<String>,
    pub actor_channel: String,
    pub actor_context: Option<String>,
    pub trace_id: String,
    pub request_id: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

/// Filters for execution audit listing.
#[derive(Debug, Clone, Default)]
pub struct ExecutionAuditFilter {
    pub execution_id: Option<ExecutionId>,
    pub schedule_id: Option<ScheduleId>,
    pub task_intent_id: Option<TaskIntentId>,
    pub status: Option<ExecutionStatus>,
    pub occurred_after: Option<DateTime<Utc>>,
    pub occurred_before: Option<DateTime<Utc>>,
    pub limit: Option<i64>,
    pub cursor: Option<Cursor>,
}

impl ExecutionAuditRow {
    /// Persist an execution audit entry, deduping replays by request id.
    ///
    /// The execution audit's event type is the status being recorded.
    pub async fn append(
        execution: &ExecutionRow,
        actor: &ExecutionActorContext,
        occurred_at: DateTime<Utc>,
        conn: &mut PgConnection,
    ) -> Result<AuditAppend<ExecutionAuditId>, DataAccessError> {
        if let Some(request_id) = actor.request_id.as_deref().filter(|r| !r.trim().is_empty()) {
            let existing =
                Self::find_by_request_id(execution.id, execution.status, request_id, conn).await?;
            if let Some(row) = existing {
                return Ok(AuditAppend {
                    id: row.id,
                    replayed: true,
                });
            }
        }

        let id: ExecutionAuditId = sqlx::query_scalar(
            r#"
            INSERT INTO execution_audit_logs (
                id, execution_id, schedule_id, task_intent_id, status,
                scheduled_for, started_at, finished_at,
                attempt_count, retry_count, max_attempts, failure_count,
                next_retry_at, last_error_code, last_error_message,
                actor_type, actor_id, actor_channel, actor_context,
                trace_id, request_id, occurred_at
            )
            VALUES (
                $1, $2, $3, $4, $5,
                $6, $7, $8,
                $9, $10, $11, $12,
                $13, $14, $15,
                $16, $17, $18, $19,
                $20, $21, $22
            )
            RETURNING id
            "#,
        )
        .bind(ExecutionAuditId::new())
        .bind(execution.id)
        .bind(execution.schedule_id)
        .bind(execution.task_intent_id)
        .bind(execution.status)
        .bind(execution.scheduled_for)
        .bind(execution.started_at)
        .bind(execution.finished_at)
        .bind(execution.attempt_count)
        .bind(execution.retry_count)
        .bind(execution.max_attempts)
        .bind(execution.failure_count)
        .bind(execution.next_retry_at)
        .bind(execution.last_error_code.as_deref())
        .bind(execution.last_error_message.as_deref())
        .bind(&actor.actor_type)
        .bind(&actor.actor_id)
        .bind(&actor.channel)
        .bind(&actor.actor_context)
        .bind(&actor.trace_id)
        .bind(&actor.request_id)
        .bind(occurred_at)
        .fetch_one(&mut *conn)
        .await?;

        Ok(AuditAppend {
            id,
            replayed: false,
        })
    }

    pub async fn find_by_id(
        id: ExecutionAuditId,
        conn: &mut PgConnection,
    ) -> Result<Option<Self>, DataAccessError> {
        let row = sqlx::query_as::<_, Self>("SELECT * FROM execution_audit_logs WHERE id = $1")
            .bind(id)
            .fetch_optional(&mut *conn)
            .await?;
        Ok(row)
    }

    /// The row a replayed status change would dedupe against.
    pub async fn find_by_request_id(
        execution_id: ExecutionId,
        status: ExecutionStatus,
        request_id: &str,
        conn: &mut PgConnection,
    ) -> Result<Option<Self>, DataAccessError> {
        let row = sqlx::query_as::<_, Self>(
            r#"
            SELECT * FROM execution_audit_logs
            WHERE execution_id = $1 AND status = $2 AND request_id = $3
            ORDER BY occurred_at DESC, id DESC
            LIMIT 1
            "#,
        )
        .bind(execution_id)
        .bind(status)
        .bind(request_id)
        .fetch_optional(&mut *conn)
        .await?;
        Ok(row)
    }

    pub async fn list(
        filter: &ExecutionAuditFilter,
        conn: &mut PgConnection,
    ) -> Result<Vec<Self>, DataAccessError> {
        let limit = crate::common::pagination::clamp_limit(filter.limit);
        let rows = sqlx::query_as::<_, Self>(
            r#"
            SELECT * FROM execution_audit_logs
            WHERE ($1::uuid IS NULL OR execution_id = $1)
              AND ($2::uuid IS NULL OR schedule_id = $2)
              AND ($3::uuid IS NULL OR task_intent_id = $3)
              AND ($4::text IS NULL OR status = $4)
              AND ($5::timestamptz IS NULL OR occurred_at >= $5)
              AND ($6::timestamptz IS NULL OR occurred_at <= $6)
              AND ($7::timestamptz IS NULL OR (occurred_at, id) < ($7, $8))
            ORDER BY occurred_at DESC, id DESC
            LIMIT $9
            "#,
        )
        .bind(filter.execution_id)
        .bind(filter.schedule_id)
        .bind(filter.task_intent_id)
        .bind(filter.status.map(|s| s.as_str()))
        .bind(filter.occurred_after)
        .bind(filter.occurred_before)
        .bind(filter.cursor.map(|c| c.sort_key))
        .bind(filter.cursor.map(|c| c.id))
        .bind(limit + 1)
        .fetch_all(&mut *conn)
        .await?;
        Ok(rows)
    }
}

// ============================================================================
// Predicate evaluation audit log
// ============================================================================

/// Input payload for predicate evaluation audit records.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PredicateEvaluationAuditInput {
    pub evaluation_id: String,
    pub schedule_id: ScheduleId,
    pub execution_id: Option<ExecutionId>,
    pub task_intent_id: TaskIntentId,
    pub actor_type: String,
    pub actor_id: Option<String>,
    pub actor_channel: String,
    pub actor_privilege_level: String,
    pub actor_autonomy_level: String,
    pub trace_id: String,
    pub request_id: Option<String>,
    pub predicate_subject: String,
    pub predicate_operator: PredicateOperator,
    pub predicate_value: Option<String>,
    pub predicate_value_type: String,
    pub evaluation_time: DateTime<Utc>,
    pub evaluated_at: DateTime<Utc>,
    pub status: EvaluationStatus,
    pub result_code: String,
    pub message: Option<String>,
    pub observed_value: Option<String>,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    pub authorization_decision: String,
    pub authorization_reason_code: Option<String>,
    pub authorization_reason_message: Option<String>,
    pub authorization_policy_name: Option<String>,
    pub authorization_policy_version: Option<String>,
    pub provider_name: String,
    pub provider_attempt: i32,
    pub correlation_id: String,
}

/// One audited predicate evaluation.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct PredicateEvaluationAuditRow {
    pub id: PredicateEvaluationAuditId,
    pub evaluation_id: String,
    pub schedule_id: ScheduleId,
    pub execution_id: Option<ExecutionId>,
    pub task_intent_id: TaskIntentId,
    pub actor_type: String,
    pub actor_id: Option<String>,
    pub actor_channel: String,
    pub actor_privilege_level: String,
    pub actor_autonomy_level: String,
    pub trace_id: String,
    pub request_id: Option<String>,
    pub predicate_subject: String,
    pub predicate_operator: PredicateOperator,
    pub predicate_value: Option<String>,
    pub predicate_value_type: String,
    pub evaluation_time: DateTime<Utc>,
    pub evaluated_at: DateTime<Utc>,
    pub status: EvaluationStatus,
    pub result_code: String,
    pub message: Option<String>,
    pub observed_value: Option<String>,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    pub authorization_decision: String,
    pub authorization_reason_code: Option<String>,
    pub authorization_reason_message: Option<String>,
    pub authorization_policy_name: Option<String>,
    pub authorization_policy_version: Option<String>,
    pub provider_name: String,
    pub provider_attempt: i32,
    pub correlation_id: String,
    pub occurred_at: DateTime<Utc>,
}

/// Filters for predicate evaluation audit listing.
#[derive(Debug, Clone, Default)]
pub struct PredicateEvaluationAuditFilter {
    pub schedule_id: Option<ScheduleId>,
    pub execution_id: Option<ExecutionId>,
    pub task_intent_id: Option<TaskIntentId>,
    pub status: Option<EvaluationStatus>,
    pub evaluated_after: Option<DateTime<Utc>>,
    pub evaluated_before: Option<DateTime<Utc>>,
    pub limit: Option<i64>,
    pub cursor: Option<Cursor>,
}

impl PredicateEvaluationAuditRow {
    /// Persist a predicate evaluation audit entry.
    ///
    /// `evaluation_id` is unique; re-recording the same evaluation is a
    /// no-op that returns the prior row id.
    pub async fn append(
        input: &PredicateEvaluationAuditInput,
        occurred_at: DateTime<Utc>,
        conn: &mut PgConnection,
    ) -> Result<AuditAppend<PredicateEvaluationAuditId>, DataAccessError> {
        let inserted: Option<PredicateEvaluationAuditId> = sqlx::query_scalar(
            r#"
            INSERT INTO predicate_evaluation_audit_logs (
                id, evaluation_id, schedule_id, execution_id, task_intent_id,
                actor_type, actor_id, actor_channel,
                actor_privilege_level, actor_autonomy_level,
                trace_id, request_id,
                predicate_subject, predicate_operator, predicate_value,
                predicate_value_type, evaluation_time, evaluated_at,
                status, result_code, message, observed_value,
                error_code, error_message,
                authorization_decision, authorization_reason_code,
                authorization_reason_message, authorization_policy_name,
                authorization_policy_version,
                provider_name, provider_attempt, correlation_id, occurred_at
            )
            VALUES (
                $1, $2, $3, $4, $5,
                $6, $7, $8,
                $9, $10,
                $11, $12,
                $13, $14, $15,
                $16, $17, $18,
                $19, $20, $21, $22,
                $23, $24,
                $25, $26,
                $27, $28,
                $29,
                $30, $31, $32, $33
            )
            ON CONFLICT (evaluation_id) DO NOTHING
            RETURNING id
            "#,
        )
        .bind(PredicateEvaluationAuditId::new())
        .bind(&input.evaluation_id)
        .bind(input.schedule_id)
        .bind(input.execution_id)
        .bind(input.task_intent_id)
        .bind(&input.actor_type)
        .bind(&input.actor_id)
        .bind(&input.actor_channel)
        .bind(&input.actor_privilege_level)
        .bind(&input.actor_autonomy_level)
        .bind(&input.trace_id)
        .bind(&input.request_id)
        .bind(&input.predicate_subject)
        .bind(input.predicate_operator)
        .bind(&input.predicate_value)
        .bind(&input.predicate_value_type)
        .bind(input.evaluation_time)
        .bind(input.evaluated_at)
        .bind(input.status)
        .bind(&input.result_code)
        .bind(&input.message)
        .bind(&input.observed_value)
        .bind(&input.error_code)
        .bind(&input.error_message)
        .bind(&input.authorization_decision)
        .bind(&input.authorization_reason_code)
        .bind(&input.authorization_reason_message)
        .bind(&input.authorization_policy_name)
        .bind(&input.authorization_policy_version)
        .bind(&input.provider_name)
        .bind(input.provider_attempt)
        .bind(&input.correlation_id)
        .bind(occurred_at)
        .fetch_optional(&mut *conn)
        .await?;

        if let Some(id) = inserted {
            return Ok(AuditAppend {
                id,
                replayed: false,
            });
        }

        let id: PredicateEvaluationAuditId = sqlx::query_scalar(
            "SELECT id FROM predicate_evaluation_audit_logs WHERE evaluation_id = $1",
        )
        .bind(&input.evaluation_id)
        .fetch_one(&mut *conn)
        .await?;
        Ok(AuditAppend { id, replayed: true })
    }

    pub async fn find_by_evaluation_id(
        evaluation_id: &str,
        conn: &mut PgConnection,
    ) -> Result<Option<Self>, DataAccessError> {
        let row = sqlx::query_as::<_, Self>(
            "SELECT * FROM predicate_evaluation_audit_logs WHERE evaluation_id = $1",
        )
        .bind(evaluation_id)
        .fetch_optional(&mut *conn)
        .await?;
        Ok(row)
    }

    pub async fn list(
        filter: &PredicateEvaluationAuditFilter,
        conn: &mut PgConnection,
    ) -> Result<Vec<Self>, DataAccessError> {
        let limit = crate::common::pagination::clamp_limit(filter.limit);
        let rows = sqlx::query_as::<_, Self>(
            r#"
            SELECT * FROM predicate_evaluation_audit_logs
            WHERE ($1::uuid IS NULL OR schedule_id = $1)
              AND ($2::uuid IS NULL OR execution_id = $2)
              AND ($3::uuid IS NULL OR task_intent_id = $3)
              AND ($4::text IS NULL OR status = $4)
              AND ($5::timestamptz IS NULL OR evaluated_at >= $5)
              AND ($6::timestamptz IS NULL OR evaluated_at <= $6)
              AND ($7::timestamptz IS NULL OR (evaluated_at, id) < ($7, $8))
            ORDER BY evaluated_at DESC, id DESC
            LIMIT $9
            "#,
        )
        .bind(filter.schedule_id)
        .bind(filter.execution_id)
        .bind(filter.task_intent_id)
        .bind(filter.status.map(|s| s.as_str()))
        .bind(filter.evaluated_after)
        .bind(filter.evaluated_before)
        .bind(filter.cursor.map(|c| c.sort_key))
        .bind(filter.cursor.map(|c| c.id))
        .bind(limit + 1)
        .fetch_all(&mut *conn)
        .await?;
        Ok(rows)
    }
}
