//! Service interface: the inbound request/result surface and error taxonomy.
//!
//! This is the boundary the CLI and SDK collaborators consume. Errors cross
//! it as typed records with stable machine-readable codes, never as opaque
//! strings; data-access failures are mapped onto the taxonomy exactly once,
//! here.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::common::{ExecutionId, ScheduleAuditId, ScheduleId, TaskIntentId};

use super::adapter::AdapterError;
use super::models::execution::{ExecutionRow, ExecutionStatus};
use super::models::audit::{
    ExecutionAuditRow, PredicateEvaluationAuditRow, ScheduleAuditEventType, ScheduleAuditRow,
};
use super::models::schedule::{
    EvaluationStatus, ScheduleDefinition, ScheduleRow, ScheduleState, ScheduleType,
};
use super::models::{DataAccessError, TaskIntentInput, TaskIntentRow};

// ============================================================================
// Errors
// ============================================================================

/// Typed service failure with a stable code and structured details.
#[derive(Debug, Error)]
pub enum ScheduleServiceError {
    #[error("{message}")]
    Validation {
        message: String,
        details: serde_json::Value,
    },

    #[error("{message}")]
    NotFound {
        message: String,
        details: serde_json::Value,
    },

    #[error("{message}")]
    Conflict {
        message: String,
        details: serde_json::Value,
    },

    #[error("{message}")]
    Forbidden {
        message: String,
        details: serde_json::Value,
    },

    #[error("{message}")]
    ImmutableField {
        message: String,
        details: serde_json::Value,
    },

    #[error("{message}")]
    InvalidStateTransition {
        message: String,
        details: serde_json::Value,
    },

    #[error("{message}")]
    MissingActorContext {
        message: String,
        details: serde_json::Value,
    },

    /// The database committed but the timer engine did not acknowledge; the
    /// DB is authoritative and the adapter must be reconciled.
    #[error("{message}")]
    AdapterSync {
        message: String,
        details: serde_json::Value,
    },

    #[error("{message}")]
    Internal {
        message: String,
        details: serde_json::Value,
    },
}

impl ScheduleServiceError {
    /// Stable machine-readable code for this error.
    pub fn code(&self) -> &'static str {
        match self {
            ScheduleServiceError::Validation { .. } => "validation_error",
            ScheduleServiceError::NotFound { .. } => "not_found",
            ScheduleServiceError::Conflict { .. } => "conflict",
            ScheduleServiceError::Forbidden { .. } => "forbidden",
            ScheduleServiceError::ImmutableField { .. } => "immutable_field",
            ScheduleServiceError::InvalidStateTransition { .. } => "invalid_state_transition",
            ScheduleServiceError::MissingActorContext { .. } => "missing_actor_context",
            ScheduleServiceError::AdapterSync { .. } => "adapter_error",
            ScheduleServiceError::Internal { .. } => "internal_error",
        }
    }

    pub fn details(&self) -> &serde_json::Value {
        match self {
            ScheduleServiceError::Validation { details, .. }
            | ScheduleServiceError::NotFound { details, .. }
            | ScheduleServiceError::Conflict { details, .. }
            | ScheduleServiceError::Forbidden { details, .. }
            | ScheduleServiceError::ImmutableField { details, .. }
            | ScheduleServiceError::InvalidStateTransition { details, .. }
            | ScheduleServiceError::MissingActorContext { details, .. }
            | ScheduleServiceError::AdapterSync { details, .. }
            | ScheduleServiceError::Internal { details, .. } => details,
        }
    }

    pub fn not_found(message: impl Into<String>, details: serde_json::Value) -> Self {
        Self::NotFound {
            message: message.into(),
            details,
        }
    }

    pub fn conflict(message: impl Into<String>, details: serde_json::Value) -> Self {
        Self::Conflict {
            message: message.into(),
            details,
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
            details: serde_json::Value::Null,
        }
    }

    /// Wrap an adapter failure, preserving its code and details.
    pub fn adapter_sync(
        schedule_id: ScheduleId,
        event_type: ScheduleAuditEventType,
        error: &AdapterError,
    ) -> Self {
        Self::AdapterSync {
            message: "Schedule adapter sync failed.".to_string(),
            details: serde_json::json!({
                "schedule_id": schedule_id,
                "event_type": event_type.as_str(),
                "adapter_code": error.code,
                "adapter_message": error.message,
                "adapter_details": error.details,
            }),
        }
    }
}

impl From<DataAccessError> for ScheduleServiceError {
    /// The single mapping point from data-access failures to the taxonomy.
    fn from(error: DataAccessError) -> Self {
        let message = error.to_string();
        match error {
            DataAccessError::Validation(_) => ScheduleServiceError::Validation {
                message,
                details: serde_json::Value::Null,
            },
            DataAccessError::NotFound { .. } => ScheduleServiceError::NotFound {
                message,
                details: serde_json::Value::Null,
            },
            DataAccessError::ImmutableField(_) => ScheduleServiceError::ImmutableField {
                message,
                details: serde_json::Value::Null,
            },
            DataAccessError::InvalidStateTransition { from, to } => {
                ScheduleServiceError::InvalidStateTransition {
                    message,
                    details: serde_json::json!({ "from": from, "to": to }),
                }
            }
            DataAccessError::MissingActorContext(_) => ScheduleServiceError::MissingActorContext {
                message,
                details: serde_json::Value::Null,
            },
            DataAccessError::Forbidden(_) => ScheduleServiceError::Forbidden {
                message,
                details: serde_json::Value::Null,
            },
            DataAccessError::Database(db) => ScheduleServiceError::Internal {
                message: db.to_string(),
                details: serde_json::Value::Null,
            },
        }
    }
}

// ============================================================================
// Command requests
// ============================================================================

/// Create a schedule and its task intent inline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleCreateRequest {
    pub task_intent: TaskIntentInput,
    pub timezone: String,
    pub definition: ScheduleDefinition,
    #[serde(default = "default_start_state")]
    pub start_state: ScheduleState,
}

fn default_start_state() -> ScheduleState {
    ScheduleState::Active
}

/// Update mutable schedule fields; absent fields are left untouched.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleUpdateRequest {
    pub schedule_id: ScheduleId,
    pub timezone: Option<String>,
    pub state: Option<ScheduleState>,
    pub definition: Option<ScheduleDefinition>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulePauseRequest {
    pub schedule_id: ScheduleId,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleResumeRequest {
    pub schedule_id: ScheduleId,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleDeleteRequest {
    pub schedule_id: ScheduleId,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleRunNowRequest {
    pub schedule_id: ScheduleId,
    pub requested_for: Option<DateTime<Utc>>,
    pub reason: Option<String>,
}

// ============================================================================
// Command results
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleMutationResult {
    pub schedule: ScheduleRow,
    pub task_intent: TaskIntentRow,
    pub audit_log_id: ScheduleAuditId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleDeleteResult {
    pub schedule_id: ScheduleId,
    pub state: ScheduleState,
    pub audit_log_id: ScheduleAuditId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleRunNowResult {
    pub schedule_id: ScheduleId,
    pub scheduled_for: DateTime<Utc>,
    pub audit_log_id: ScheduleAuditId,
}

// ============================================================================
// Query requests
// ============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScheduleListRequest {
    pub state: Option<ScheduleState>,
    pub schedule_type: Option<ScheduleType>,
    pub created_by_actor_type: Option<String>,
    pub created_after: Option<DateTime<Utc>>,
    pub created_before: Option<DateTime<Utc>>,
    pub limit: Option<i64>,
    pub cursor: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutionListRequest {
    pub schedule_id: Option<ScheduleId>,
    pub task_intent_id: Option<TaskIntentId>,
    pub status: Option<ExecutionStatus>,
    pub created_after: Option<DateTime<Utc>>,
    pub created_before: Option<DateTime<Utc>>,
    pub limit: Option<i64>,
    pub cursor: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScheduleAuditListRequest {
    pub schedule_id: Option<ScheduleId>,
    pub task_intent_id: Option<TaskIntentId>,
    pub event_type: Option<ScheduleAuditEventType>,
    pub occurred_after: Option<DateTime<Utc>>,
    pub occurred_before: Option<DateTime<Utc>>,
    pub limit: Option<i64>,
    pub cursor: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutionAuditListRequest {
    pub execution_id: Option<ExecutionId>,
    pub schedule_id: Option<ScheduleId>,
    pub task_intent_id: Option<TaskIntentId>,
    pub status: Option<ExecutionStatus>,
    pub occurred_after: Option<DateTime<Utc>>,
    pub occurred_before: Option<DateTime<Utc>>,
    pub limit: Option<i64>,
    pub cursor: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PredicateEvaluationAuditListRequest {
    pub schedule_id: Option<ScheduleId>,
    pub execution_id: Option<ExecutionId>,
    pub task_intent_id: Option<TaskIntentId>,
    pub status: Option<EvaluationStatus>,
    pub evaluated_after: Option<DateTime<Utc>>,
    pub evaluated_before: Option<DateTime<Utc>>,
    pub limit: Option<i64>,
    pub cursor: Option<String>,
}

// ============================================================================
// Query results
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleResult {
    pub schedule: ScheduleRow,
    pub task_intent: TaskIntentRow,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleListResult {
    pub schedules: Vec<ScheduleRow>,
    pub next_cursor: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionListResult {
    pub executions: Vec<ExecutionRow>,
    pub next_cursor: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleAuditListResult {
    pub audit_logs: Vec<ScheduleAuditRow>,
    pub next_cursor: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionAuditListResult {
    pub audit_logs: Vec<ExecutionAuditRow>,
    pub next_cursor: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PredicateEvaluationAuditListResult {
    pub audit_logs: Vec<PredicateEvaluationAuditRow>,
    pub next_cursor: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes_are_stable() {
        let err = ScheduleServiceError::validation("bad input");
        assert_eq!(err.code(), "validation_error");

        let err: ScheduleServiceError =
            DataAccessError::not_found("schedule").into();
        assert_eq!(err.code(), "not_found");

        let err: ScheduleServiceError = DataAccessError::InvalidStateTransition {
            from: "completed".into(),
            to: "paused".into(),
        }
        .into();
        assert_eq!(err.code(), "invalid_state_transition");
        assert_eq!(err.details()["from"], "completed");
    }

    #[test]
    fn test_adapter_sync_error_preserves_adapter_code() {
        let adapter_error = AdapterError::new("unavailable", "engine down");
        let err = ScheduleServiceError::adapter_sync(
            ScheduleId::new(),
            ScheduleAuditEventType::Update,
            &adapter_error,
        );
        assert_eq!(err.code(), "adapter_error");
        assert_eq!(err.details()["adapter_code"], "unavailable");
        assert_eq!(err.details()["event_type"], "update");
    }

    #[test]
    fn test_create_request_defaults_to_active() {
        let json = serde_json::json!({
            "task_intent": { "summary": "water the plants" },
            "timezone": "UTC",
            "definition": { "schedule_type": "one_time", "run_at": "2025-02-06T10:00:00Z" },
        });
        let request: ScheduleCreateRequest = serde_json::from_value(json).unwrap();
        assert_eq!(request.start_state, ScheduleState::Active);
    }
}
