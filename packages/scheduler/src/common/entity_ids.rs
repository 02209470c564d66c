//! Typed ID definitions for all scheduler entities.
//!
//! Each entity gets its own marker type so IDs cannot be mixed up at compile
//! time (a `ScheduleId` is not an `ExecutionId`).

// Re-export the core Id type and version markers
pub use super::id::{Id, V4, V7};

// ============================================================================
// Entity marker types
// ============================================================================

/// Marker type for TaskIntent entities (the immutable "what").
pub struct TaskIntent;

/// Marker type for Schedule entities (the timing envelope over an intent).
pub struct Schedule;

/// Marker type for Execution entities (one invocation attempt).
pub struct Execution;

/// Marker type for schedule audit log entries.
pub struct ScheduleAudit;

/// Marker type for execution audit log entries.
pub struct ExecutionAudit;

/// Marker type for predicate evaluation audit log entries.
pub struct PredicateEvaluationAudit;

// ============================================================================
// Type aliases
// ============================================================================

pub type TaskIntentId = Id<TaskIntent>;
pub type ScheduleId = Id<Schedule>;
pub type ExecutionId = Id<Execution>;
pub type ScheduleAuditId = Id<ScheduleAudit>;
pub type ExecutionAuditId = Id<ExecutionAudit>;
pub type PredicateEvaluationAuditId = Id<PredicateEvaluationAudit>;
