//! Data access layer: task intents, schedules, executions, and audit logs.
//!
//! Every query runs on a `&mut PgConnection` so callers compose them inside
//! a single transaction; the command service and dispatcher own transaction
//! boundaries. Mutations validate their actor context, enforce schema
//! invariants, and write their audit row before returning.

pub mod audit;
pub mod execution;
pub mod schedule;
pub mod task_intent;

pub use audit::{
    AuditAppend, ExecutionAuditFilter, ExecutionAuditRow, PredicateEvaluationAuditFilter,
    PredicateEvaluationAuditInput, PredicateEvaluationAuditRow, ScheduleAuditEventType,
    ScheduleAuditFilter, ScheduleAuditRow,
};
pub use execution::{
    BackoffStrategy, CreateExecution, ExecutionListFilter, ExecutionRow, ExecutionStatus,
    UpdateExecution,
};
pub use schedule::{
    CreateScheduleWithIntent, EvaluationIntervalUnit, EvaluationStatus, IntervalUnit,
    PredicateOperator, ScheduleDefinition, ScheduleListFilter, ScheduleMutation, ScheduleRow,
    ScheduleState, ScheduleType, UpdateSchedule,
};
pub use task_intent::{TaskIntentInput, TaskIntentRow};

use chrono::{DateTime, NaiveDateTime, Utc};
use thiserror::Error;
use tracing::warn;

use super::actor::{ActorContext, ExecutionActorContext, SCHEDULED_ACTOR_TYPE};

/// Failure modes of the data access layer.
///
/// These are mapped once, at the service boundary, onto the public error
/// taxonomy; nothing below the services matches on strings.
#[derive(Debug, Error)]
pub enum DataAccessError {
    #[error("{0}")]
    Validation(String),

    #[error("{entity} not found")]
    NotFound { entity: &'static str },

    #[error("{0}")]
    ImmutableField(String),

    #[error("invalid state transition from {from} to {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("{0}")]
    MissingActorContext(String),

    #[error("{0}")]
    Forbidden(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl DataAccessError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn not_found(entity: &'static str) -> Self {
        Self::NotFound { entity }
    }
}

/// Validate actor context inputs for schedule mutations.
///
/// The scheduled actor type is reserved for the dispatcher; human-initiated
/// mutation paths pass `allow_scheduled = false`.
pub fn validate_actor_context(
    actor: &ActorContext,
    allow_scheduled: bool,
) -> Result<(), DataAccessError> {
    if actor.actor_type.trim().is_empty() {
        return Err(DataAccessError::MissingActorContext(
            "actor_type is required".into(),
        ));
    }
    if actor.channel.trim().is_empty() {
        return Err(DataAccessError::MissingActorContext(
            "channel is required".into(),
        ));
    }
    if actor.trace_id.trim().is_empty() {
        return Err(DataAccessError::MissingActorContext(
            "trace_id is required".into(),
        ));
    }
    if actor.actor_type == SCHEDULED_ACTOR_TYPE && !allow_scheduled {
        return Err(DataAccessError::Forbidden(
            "scheduled actor_type is not allowed for schedule mutations".into(),
        ));
    }
    Ok(())
}

/// Validate actor context inputs for execution records.
pub fn validate_execution_actor_context(
    actor: &ExecutionActorContext,
) -> Result<(), DataAccessError> {
    if actor.actor_type.trim().is_empty() {
        return Err(DataAccessError::MissingActorContext(
            "actor_type is required".into(),
        ));
    }
    if actor.channel.trim().is_empty() {
        return Err(DataAccessError::MissingActorContext(
            "channel is required".into(),
        ));
    }
    if actor.trace_id.trim().is_empty() {
        return Err(DataAccessError::MissingActorContext(
            "trace_id is required".into(),
        ));
    }
    Ok(())
}

/// Validate that a timezone name resolves to an IANA zone.
pub fn validate_timezone(timezone_name: &str) -> Result<chrono_tz::Tz, DataAccessError> {
    if timezone_name.trim().is_empty() {
        return Err(DataAccessError::validation("timezone is required"));
    }
    timezone_name
        .parse::<chrono_tz::Tz>()
        .map_err(|_| DataAccessError::validation(format!("Invalid timezone: {timezone_name}")))
}

/// Coerce a naive timestamp to UTC, logging the assumption.
///
/// Aware timestamps never reach this path; it exists for inbound payloads
/// whose serialization dropped the offset.
pub fn coerce_naive_utc(value: NaiveDateTime, label: &str) -> DateTime<Utc> {
    warn!(label, "Naive timestamp provided; assuming UTC");
    value.and_utc()
}

/// Build a diff summary string from changed field names.
pub fn diff_summary<I, S>(changes: I) -> Option<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let mut changed: Vec<String> = changes.into_iter().map(Into::into).collect();
    if changed.is_empty() {
        return None;
    }
    changed.sort();
    changed.dedup();
    Some(changed.join(", "))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn human_actor() -> ActorContext {
        ActorContext {
            actor_type: "human".into(),
            actor_id: Some("amos".into()),
            channel: "cli".into(),
            trace_id: "t-1".into(),
            request_id: None,
            reason: None,
        }
    }

    #[test]
    fn test_actor_validation_requires_core_fields() {
        let mut actor = human_actor();
        actor.trace_id = "   ".into();
        assert!(matches!(
            validate_actor_context(&actor, false),
            Err(DataAccessError::MissingActorContext(_))
        ));
    }

    #[test]
    fn test_scheduled_actor_forbidden_for_mutations() {
        let mut actor = human_actor();
        actor.actor_type = "scheduled".into();
        assert!(matches!(
            validate_actor_context(&actor, false),
            Err(DataAccessError::Forbidden(_))
        ));
        assert!(validate_actor_context(&actor, true).is_ok());
    }

    #[test]
    fn test_timezone_validation() {
        assert!(validate_timezone("America/Chicago").is_ok());
        assert!(validate_timezone("UTC").is_ok());
        assert!(validate_timezone("Mars/Olympus").is_err());
        assert!(validate_timezone("  ").is_err());
    }

    #[test]
    fn test_diff_summary_sorts_and_dedupes() {
        assert_eq!(
            diff_summary(["state", "timezone", "state"]).as_deref(),
            Some("state, timezone")
        );
        assert_eq!(diff_summary(Vec::<String>::new()), None);
    }
}
