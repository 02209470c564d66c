//! Schedule query service: read-only views over schedules, executions, and
//! the three audit logs.
//!
//! No side effects and no adapter contact. Filters compose conjunctively;
//! list operations take an opaque cursor and return the next one. A filter
//! that matches nothing yields an empty list, not a not-found error — the
//! audit queries are the primary operator-visible debugging surface and must
//! stay boring.

use sqlx::PgPool;

use crate::common::pagination::{next_cursor, trim_results, Cursor};
use crate::common::{
    ExecutionAuditId, ExecutionId, ScheduleAuditId, ScheduleId, TaskIntentId,
};

use super::interface::{
    ExecutionAuditListRequest, ExecutionAuditListResult, ExecutionListRequest,
    ExecutionListResult, PredicateEvaluationAuditListRequest, PredicateEvaluationAuditListResult,
    ScheduleAuditListRequest, ScheduleAuditListResult, ScheduleListRequest, ScheduleListResult,
    ScheduleResult, ScheduleServiceError,
};
use super::models::audit::{
    ExecutionAuditFilter, ExecutionAuditRow, PredicateEvaluationAuditFilter,
    PredicateEvaluationAuditRow, ScheduleAuditFilter, ScheduleAuditRow,
};
use super::models::execution::{ExecutionListFilter, ExecutionRow};
use super::models::schedule::{ScheduleListFilter, ScheduleRow};
use super::models::TaskIntentRow;

pub struct ScheduleQueryService {
    pool: PgPool,
}

impl ScheduleQueryService {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Fetch a schedule with its task intent.
    pub async fn get_schedule(
        &self,
        schedule_id: ScheduleId,
    ) -> Result<ScheduleResult, ScheduleServiceError> {
        let mut conn = self.acquire().await?;
        let schedule = ScheduleRow::find_by_id(schedule_id, &mut conn)
            .await?
            .ok_or_else(|| {
                ScheduleServiceError::not_found(
                    "schedule not found",
                    serde_json::json!({ "schedule_id": schedule_id }),
                )
            })?;
        let task_intent = TaskIntentRow::find_by_id(schedule.task_intent_id, &mut conn)
            .await?
            .ok_or_else(|| {
                ScheduleServiceError::not_found(
                    "task intent not found",
                    serde_json::json!({ "task_intent_id": schedule.task_intent_id }),
                )
            })?;
        Ok(ScheduleResult {
            schedule,
            task_intent,
        })
    }

    /// List schedules matching the provided filters.
    pub async fn list_schedules(
        &self,
        request: &ScheduleListRequest,
    ) -> Result<ScheduleListResult, ScheduleServiceError> {
        let mut conn = self.acquire().await?;
        let limit = crate::common::pagination::clamp_limit(request.limit);
        let filter = ScheduleListFilter {
            state: request.state,
            schedule_type: request.schedule_type,
            created_by_actor_type: request.created_by_actor_type.clone(),
            created_after: request.created_after,
            created_before: request.created_before,
            limit: Some(limit),
            cursor: decode_cursor(request.cursor.as_deref())?,
        };
        let rows = ScheduleRow::list(&filter, &mut conn).await?;
        let (schedules, has_more) = trim_results(rows, limit);
        let next_cursor = next_cursor(&schedules, has_more, |s: &ScheduleRow| {
            (s.created_at, s.id.into_uuid())
        });
        Ok(ScheduleListResult {
            schedules,
            next_cursor,
        })
    }

    /// Fetch a task intent by id.
    pub async fn get_task_intent(
        &self,
        task_intent_id: TaskIntentId,
    ) -> Result<TaskIntentRow, ScheduleServiceError> {
        let mut conn = self.acquire().await?;
        TaskIntentRow::find_by_id(task_intent_id, &mut conn)
            .await?
            .ok_or_else(|| {
                ScheduleServiceError::not_found(
                    "task intent not found",
                    serde_json::json!({ "task_intent_id": task_intent_id }),
                )
            })
    }

    /// Fetch an execution by id.
    pub async fn get_execution(
        &self,
        execution_id: ExecutionId,
    ) -> Result<ExecutionRow, ScheduleServiceError> {
        let mut conn = self.acquire().await?;
        ExecutionRow::find_by_id(execution_id, &mut conn)
            .await?
            .ok_or_else(|| {
                ScheduleServiceError::not_found(
                    "execution not found",
                    serde_json::json!({ "execution_id": execution_id }),
                )
            })
    }

    /// List executions matching the provided filters.
    pub async fn list_executions(
        &self,
        request: &ExecutionListRequest,
    ) -> Result<ExecutionListResult, ScheduleServiceError> {
        let mut conn = self.acquire().await?;
        let limit = crate::common::pagination::clamp_limit(request.limit);
        let filter = ExecutionListFilter {
            schedule_id: request.schedule_id,
            task_intent_id: request.task_intent_id,
            status: request.status,
            created_after: request.created_after,
            created_before: request.created_before,
            limit: Some(limit),
            cursor: decode_cursor(request.cursor.as_deref())?,
        };
        let rows = ExecutionRow::list(&filter, &mut conn).await?;
        let (executions, has_more) = trim_results(rows, limit);
        let next_cursor = next_cursor(&executions, has_more, |e: &ExecutionRow| {
            (e.created_at, e.id.into_uuid())
        });
        Ok(ExecutionListResult {
            executions,
            next_cursor,
        })
    }

    /// Fetch a schedule audit entry by id.
    pub async fn get_schedule_audit(
        &self,
        audit_id: ScheduleAuditId,
    ) -> Result<ScheduleAuditRow, ScheduleServiceError> {
        let mut conn = self.acquire().await?;
        ScheduleAuditRow::find_by_id(audit_id, &mut conn)
            .await?
            .ok_or_else(|| {
                ScheduleServiceError::not_found(
                    "schedule audit not found",
                    serde_json::json!({ "schedule_audit_id": audit_id }),
                )
            })
    }

    /// List schedule audit entries matching the provided filters.
    pub async fn list_schedule_audits(
        &self,
        request: &ScheduleAuditListRequest,
    ) -> Result<ScheduleAuditListResult, ScheduleServiceError> {
        let mut conn = self.acquire().await?;
        let limit = crate::common::pagination::clamp_limit(request.limit);
        let filter = ScheduleAuditFilter {
            schedule_id: request.schedule_id,
            task_intent_id: request.task_intent_id,
            event_type: request.event_type,
            occurred_after: request.occurred_after,
            occurred_before: request.occurred_before,
            limit: Some(limit),
            cursor: decode_cursor(request.cursor.as_deref())?,
        };
        let rows = ScheduleAuditRow::list(&filter, &mut conn).await?;
        let (audit_logs, has_more) = trim_results(rows, limit);
        let next_cursor = next_cursor(&audit_logs, has_more, |a: &ScheduleAuditRow| {
            (a.occurred_at, a.id.into_uuid())
        });
        Ok(ScheduleAuditListResult {
            audit_logs,
            next_cursor,
        })
    }

    /// Fetch an execution audit entry by id.
    pub async fn get_execution_audit(
        &self,
        audit_id: ExecutionAuditId,
    ) -> Result<ExecutionAuditRow, ScheduleServiceError> {
        let mut conn = self.acquire().await?;
        ExecutionAuditRow::find_by_id(audit_id, &mut conn)
            .await?
            .ok_or_else(|| {
                ScheduleServiceError::not_found(
                    "execution audit not found",
                    serde_json::json!({ "execution_audit_id": audit_id }),
                )
            })
    }

    /// List execution audit entries matching the provided filters.
    pub async fn list_execution_audits(
        &self,
        request: &ExecutionAuditListRequest,
    ) -> Result<ExecutionAuditListResult, ScheduleServiceError> {
        let mut conn = self.acquire().await?;
        let limit = crate::common::pagination::clamp_limit(request.limit);
        let filter = ExecutionAuditFilter {
            execution_id: request.execution_id,
            schedule_id: request.schedule_id,
            task_intent_id: request.task_intent_id,
            status: request.status,
            occurred_after: request.occurred_after,
            occurred_before: request.occurred_before,
            limit: Some(limit),
            cursor: decode_cursor(request.cursor.as_deref())?,
        };
        let rows = ExecutionAuditRow::list(&filter, &mut conn).await?;
        let (audit_logs, has_more) = trim_results(rows, limit);
        let next_cursor = next_cursor(&audit_logs, has_more, |a: &ExecutionAuditRow| {
            (a.occurred_at, a.id.into_uuid())
        });
        Ok(ExecutionAuditListResult {
            audit_logs,
            next_cursor,
        })
    }

    /// Fetch a predicate evaluation audit entry by evaluation id.
    pub async fn get_predicate_evaluation_audit(
        &self,
        evaluation_id: &str,
    ) -> Result<PredicateEvaluationAuditRow, ScheduleServiceError> {
        let mut conn = self.acquire().await?;
        PredicateEvaluationAuditRow::find_by_evaluation_id(evaluation_id, &mut conn)
            .await?
            .ok_or_else(|| {
                ScheduleServiceError::not_found(
                    "predicate evaluation audit not found",
                    serde_json::json!({ "evaluation_id": evaluation_id }),
                )
            })
    }

    /// List predicate evaluation audit entries matching the provided filters.
    pub async fn list_predicate_evaluation_audits(
        &self,
        request: &PredicateEvaluationAuditListRequest,
    ) -> Result<PredicateEvaluationAuditListResult, ScheduleServiceError> {
        let mut conn = self.acquire().await?;
        let limit = crate::common::pagination::clamp_limit(request.limit);
        let filter = PredicateEvaluationAuditFilter {
            schedule_id: request.schedule_id,
            execution_id: request.execution_id,
            task_intent_id: request.task_intent_id,
            status: request.status,
            evaluated_after: request.evaluated_after,
            evaluated_before: request.evaluated_before,
            limit: Some(limit),
            cursor: decode_cursor(request.cursor.as_deref())?,
        };
        let rows = PredicateEvaluationAuditRow::list(&filter, &mut conn).await?;
        let (audit_logs, has_more) = trim_results(rows, limit);
        let next_cursor = next_cursor(&audit_logs, has_more, |a: &PredicateEvaluationAuditRow| {
            (a.evaluated_at, a.id.into_uuid())
        });
        Ok(PredicateEvaluationAuditListResult {
            audit_logs,
            next_cursor,
        })
    }

    async fn acquire(
        &self,
    ) -> Result<sqlx::pool::PoolConnection<sqlx::Postgres>, ScheduleServiceError> {
        self.pool
            .acquire()
            .await
            .map_err(|e| ScheduleServiceError::Internal {
                message: e.to_string(),
                details: serde_json::Value::Null,
            })
    }
}

fn decode_cursor(cursor: Option<&str>) -> Result<Option<Cursor>, ScheduleServiceError> {
    cursor
        .map(Cursor::decode)
        .transpose()
        .map_err(|_| ScheduleServiceError::validation("Invalid cursor"))
}
