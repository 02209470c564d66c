//! Predicate evaluation for conditional schedules.
//!
//! A conditional schedule observes a read-only subject before firing. The
//! service validates the predicate, gates the subject's capability, resolves
//! the observed value through the external resolver, compares it under the
//! predicate operator, and records an evaluation audit row. It never creates
//! executions; the dispatcher acts on the returned result.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use sqlx::PgConnection;
use std::sync::{Arc, OnceLock};
use thiserror::Error;
use tracing::warn;

use crate::common::{ScheduleId, TaskIntentId};

use super::gate::{CapabilityActorContext, CapabilityGate};
use super::models::audit::{PredicateEvaluationAuditInput, PredicateEvaluationAuditRow};
use super::models::schedule::{
    EvaluationStatus, PredicateOperator, ScheduleDefinition, ScheduleRow, ScheduleType,
};
use super::models::DataAccessError;

// ============================================================================
// Error codes
// ============================================================================

/// Machine-readable codes for predicate evaluation failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PredicateErrorCode {
    InvalidPredicate,
    SubjectNotFound,
    OperatorNotSupported,
    ValueTypeMismatch,
    Forbidden,
    EvaluationFailed,
    Timeout,
    ScheduleNotFound,
    ScheduleNotConditional,
    InternalError,
}

impl PredicateErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            PredicateErrorCode::InvalidPredicate => "invalid_predicate",
            PredicateErrorCode::SubjectNotFound => "subject_not_found",
            PredicateErrorCode::OperatorNotSupported => "operator_not_supported",
            PredicateErrorCode::ValueTypeMismatch => "value_type_mismatch",
            PredicateErrorCode::Forbidden => "forbidden",
            PredicateErrorCode::EvaluationFailed => "evaluation_failed",
            PredicateErrorCode::Timeout => "timeout",
            PredicateErrorCode::ScheduleNotFound => "schedule_not_found",
            PredicateErrorCode::ScheduleNotConditional => "schedule_not_conditional",
            PredicateErrorCode::InternalError => "internal_error",
        }
    }
}

/// Typed predicate evaluation failure, also the resolver's error type.
///
/// Resolver implementations map their internal failures to a stable code
/// (`subject_not_found`, `timeout`, or `evaluation_failed` for anything
/// unexpected); the code propagates into the evaluation result unchanged.
#[derive(Debug, Clone, Error, Serialize, Deserialize)]
#[error("predicate evaluation failed [{code}]: {message}")]
pub struct PredicateEvaluationError {
    pub code: String,
    pub message: String,
}

impl PredicateEvaluationError {
    pub fn new(code: PredicateErrorCode, message: impl Into<String>) -> Self {
        Self {
            code: code.as_str().to_string(),
            message: message.into(),
        }
    }
}

// ============================================================================
// Values and definitions
// ============================================================================

/// Observed value returned by the subject resolver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SubjectValue {
    Text(String),
    Number(f64),
    Flag(bool),
    Missing,
}

impl SubjectValue {
    /// Stringified form for audit rows; `Missing` has none.
    pub fn stringify(&self) -> Option<String> {
        match self {
            SubjectValue::Text(s) => Some(s.clone()),
            SubjectValue::Number(n) => {
                if n.fract() == 0.0 && n.abs() < 1e15 {
                    Some(format!("{}", *n as i64))
                } else {
                    Some(n.to_string())
                }
            }
            SubjectValue::Flag(b) => Some(if *b { "true" } else { "false" }.to_string()),
            SubjectValue::Missing => None,
        }
    }
}

/// Predicate definition extracted from a conditional schedule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredicateDefinition {
    pub subject: String,
    pub operator: PredicateOperator,
    pub value: Option<String>,
}

impl PredicateDefinition {
    pub fn from_schedule(schedule: &ScheduleRow) -> Option<Self> {
        match schedule.definition().ok()? {
            ScheduleDefinition::Conditional {
                predicate_subject,
                predicate_operator,
                predicate_value,
                ..
            } => Some(Self {
                subject: predicate_subject,
                operator: predicate_operator,
                value: predicate_value,
            }),
            _ => None,
        }
    }
}

// ============================================================================
// Request / result envelopes
// ============================================================================

/// Request payload for one predicate evaluation.
#[derive(Debug, Clone)]
pub struct PredicateEvaluationRequest {
    pub evaluation_id: String,
    pub schedule_id: ScheduleId,
    pub task_intent_id: TaskIntentId,
    pub evaluation_time: DateTime<Utc>,
    pub predicate: PredicateDefinition,
    pub actor: CapabilityActorContext,
    pub provider_name: String,
    pub provider_attempt: i32,
    pub trace_id: String,
}

/// Result envelope for a predicate evaluation.
#[derive(Debug, Clone)]
pub struct PredicateEvaluationResult {
    pub status: EvaluationStatus,
    pub result_code: String,
    pub message: Option<String>,
    pub observed_value: Option<String>,
    pub evaluated_at: DateTime<Utc>,
    pub error: Option<PredicateEvaluationError>,
    pub authorization_decision: &'static str,
    pub authorization_reason_code: Option<String>,
    pub authorization_reason_message: Option<String>,
}

impl PredicateEvaluationResult {
    /// True iff the predicate held and the schedule should fire.
    pub fn triggered(&self) -> bool {
        self.status == EvaluationStatus::True
    }

    fn error_result(
        code: &str,
        message: String,
        observed_value: Option<String>,
        evaluated_at: DateTime<Utc>,
    ) -> Self {
        Self {
            status: EvaluationStatus::Error,
            result_code: code.to_string(),
            message: Some(message.clone()),
            observed_value,
            evaluated_at,
            error: Some(PredicateEvaluationError {
                code: code.to_string(),
                message,
            }),
            authorization_decision: "allow",
            authorization_reason_code: None,
            authorization_reason_message: None,
        }
    }
}

// ============================================================================
// External ports
// ============================================================================

/// Resolves predicate subjects to observable values via read-only
/// capabilities. Gated by the capability gate before every call.
#[async_trait]
pub trait SubjectResolver: Send + Sync {
    async fn resolve(
        &self,
        subject: &str,
        actor: &CapabilityActorContext,
    ) -> Result<SubjectValue, PredicateEvaluationError>;
}

// ============================================================================
// Service
// ============================================================================

/// Predicate evaluation service.
pub struct PredicateEvaluationService {
    gate: Arc<CapabilityGate>,
    resolver: Arc<dyn SubjectResolver>,
}

impl PredicateEvaluationService {
    pub fn new(gate: Arc<CapabilityGate>, resolver: Arc<dyn SubjectResolver>) -> Self {
        Self { gate, resolver }
    }

    /// Evaluate a predicate and record its audit row on the caller's
    /// connection.
    ///
    /// Each pipeline step short-circuits into an error result with a
    /// specific code; the subject resolver is only reached after the gate
    /// allowed the capability.
    pub async fn evaluate(
        &self,
        request: &PredicateEvaluationRequest,
        now: DateTime<Utc>,
        conn: &mut PgConnection,
    ) -> PredicateEvaluationResult {
        let result = self.evaluate_inner(request, now).await;
        self.record_audit(request, &result, conn).await;
        result
    }

    async fn evaluate_inner(
        &self,
        request: &PredicateEvaluationRequest,
        evaluated_at: DateTime<Utc>,
    ) -> PredicateEvaluationResult {
        // Step 1: validate the predicate definition.
        if let Err(error) = validate_predicate(&request.predicate) {
            return PredicateEvaluationResult::error_result(
                &error.code,
                error.message,
                None,
                evaluated_at,
            );
        }

        // Step 2: the capability is the subject prefix before the first '/'.
        let capability_id = extract_capability_id(&request.predicate.subject);

        // Step 3: gate the capability under the scheduled actor.
        let evaluation_context = format!(
            "schedule_id={},subject={}",
            request.schedule_id, request.predicate.subject
        );
        let check = self.gate.check(
            capability_id,
            &request.actor,
            Some(&evaluation_context),
            evaluated_at,
        );
        if check.is_denied() {
            let reason_message = check
                .reason_message
                .clone()
                .unwrap_or_else(|| "Capability denied.".to_string());
            let mut result = PredicateEvaluationResult::error_result(
                PredicateErrorCode::Forbidden.as_str(),
                reason_message,
                None,
                evaluated_at,
            );
            result.authorization_decision = "deny";
            result.authorization_reason_code = check.reason.map(|r| r.as_str().to_string());
            result.authorization_reason_message = check.reason_message;
            return result;
        }

        // Step 4: resolve the subject.
        let observed = match self
            .resolver
            .resolve(&request.predicate.subject, &request.actor)
            .await
        {
            Ok(value) => value,
            Err(error) => {
                return PredicateEvaluationResult::error_result(
                    &error.code,
                    error.message,
                    None,
                    evaluated_at,
                );
            }
        };

        // Step 5: compare under the predicate operator.
        match evaluate_predicate(&request.predicate, &observed) {
            Ok(holds) => {
                let status = if holds {
                    EvaluationStatus::True
                } else {
                    EvaluationStatus::False
                };
                PredicateEvaluationResult {
                    status,
                    result_code: "evaluated".to_string(),
                    message: Some(format!("Predicate evaluated to {status}.")),
                    observed_value: observed.stringify(),
                    evaluated_at,
                    error: None,
                    authorization_decision: "allow",
                    authorization_reason_code: None,
                    authorization_reason_message: None,
                }
            }
            Err(error) => PredicateEvaluationResult::error_result(
                &error.code,
                error.message,
                observed.stringify(),
                evaluated_at,
            ),
        }
    }

    /// Load a schedule and evaluate its predicate.
    pub async fn evaluate_schedule(
        &self,
        schedule_id: ScheduleId,
        evaluation_id: &str,
        evaluation_time: DateTime<Utc>,
        provider_name: &str,
        provider_attempt: i32,
        trace_id: &str,
        now: DateTime<Utc>,
        conn: &mut PgConnection,
    ) -> Result<PredicateEvaluationResult, DataAccessError> {
        let Some(schedule) = ScheduleRow::find_by_id(schedule_id, conn).await? else {
            return Ok(PredicateEvaluationResult::error_result(
                PredicateErrorCode::ScheduleNotFound.as_str(),
                format!("Schedule {schedule_id} not found."),
                None,
                now,
            ));
        };
        if schedule.schedule_type != ScheduleType::Conditional {
            return Ok(PredicateEvaluationResult::error_result(
                PredicateErrorCode::ScheduleNotConditional.as_str(),
                format!(
                    "Schedule {schedule_id} is not a conditional schedule (type: {}).",
                    schedule.schedule_type
                ),
                None,
                now,
            ));
        }
        let Some(predicate) = PredicateDefinition::from_schedule(&schedule) else {
            return Ok(PredicateEvaluationResult::error_result(
                PredicateErrorCode::InvalidPredicate.as_str(),
                "Conditional schedule has no usable predicate.".to_string(),
                None,
                now,
            ));
        };

        let request = PredicateEvaluationRequest {
            evaluation_id: evaluation_id.to_string(),
            schedule_id,
            task_intent_id: schedule.task_intent_id,
            evaluation_time,
            predicate,
            actor: CapabilityActorContext::scheduled(trace_id),
            provider_name: provider_name.to_string(),
            provider_attempt,
            trace_id: trace_id.to_string(),
        };
        Ok(self.evaluate(&request, now, conn).await)
    }

    async fn record_audit(
        &self,
        request: &PredicateEvaluationRequest,
        result: &PredicateEvaluationResult,
        conn: &mut PgConnection,
    ) {
        let input = PredicateEvaluationAuditInput {
            evaluation_id: request.evaluation_id.clone(),
            schedule_id: request.schedule_id,
            execution_id: None,
            task_intent_id: request.task_intent_id,
            actor_type: request.actor.actor_type.clone(),
            actor_id: request.actor.actor_id.clone(),
            actor_channel: request.actor.channel.clone(),
            actor_privilege_level: request.actor.privilege_level.clone(),
            actor_autonomy_level: request.actor.autonomy_level.clone(),
            trace_id: request.trace_id.clone(),
            request_id: request.actor.request_id.clone(),
            predicate_subject: request.predicate.subject.clone(),
            predicate_operator: request.predicate.operator,
            predicate_value: request.predicate.value.clone(),
            predicate_value_type: "string".to_string(),
            evaluation_time: request.evaluation_time,
            evaluated_at: result.evaluated_at,
            status: result.status,
            result_code: result.result_code.clone(),
            message: result.message.clone(),
            observed_value: result.observed_value.clone(),
            error_code: result.error.as_ref().map(|e| e.code.clone()),
            error_message: result.error.as_ref().map(|e| e.message.clone()),
            authorization_decision: result.authorization_decision.to_string(),
            authorization_reason_code: result.authorization_reason_code.clone(),
            authorization_reason_message: result.authorization_reason_message.clone(),
            authorization_policy_name: None,
            authorization_policy_version: None,
            provider_name: request.provider_name.clone(),
            provider_attempt: request.provider_attempt,
            correlation_id: request.trace_id.clone(),
        };
        if let Err(error) =
            PredicateEvaluationAuditRow::append(&input, result.evaluated_at, conn).await
        {
            warn!(
                evaluation_id = %request.evaluation_id,
                schedule_id = %request.schedule_id,
                %error,
                "failed to record predicate evaluation audit"
            );
        }
    }
}

// ============================================================================
// Pure evaluation functions
// ============================================================================

fn safe_pattern_regex() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[\w\s.*?\[\]\-]+$").expect("static pattern"))
}

/// Validate predicate fields; `Ok` means the predicate is evaluable.
pub fn validate_predicate(predicate: &PredicateDefinition) -> Result<(), PredicateEvaluationError> {
    if predicate.subject.trim().is_empty() {
        return Err(PredicateEvaluationError::new(
            PredicateErrorCode::InvalidPredicate,
            "Predicate subject is required.",
        ));
    }

    if predicate.operator != PredicateOperator::Exists && predicate.value.is_none() {
        return Err(PredicateEvaluationError::new(
            PredicateErrorCode::InvalidPredicate,
            format!(
                "Predicate value is required for operator '{}'.",
                predicate.operator
            ),
        ));
    }

    if predicate.operator == PredicateOperator::Matches {
        if let Some(value) = &predicate.value {
            if !safe_pattern_regex().is_match(value) {
                return Err(PredicateEvaluationError::new(
                    PredicateErrorCode::InvalidPredicate,
                    "Pattern contains disallowed characters. Only alphanumeric, *, ?, [], and - are allowed.",
                ));
            }
        }
    }

    Ok(())
}

/// The capability a subject observes: the prefix before the first `/`.
///
/// `obsidian.read/notes/foo.md` maps to `obsidian.read`.
pub fn extract_capability_id(subject: &str) -> &str {
    subject.split('/').next().unwrap_or(subject)
}

/// Evaluate a predicate against an observed value.
pub fn evaluate_predicate(
    predicate: &PredicateDefinition,
    observed: &SubjectValue,
) -> Result<bool, PredicateEvaluationError> {
    // exists: non-null and not blank; 0 and false count as existing.
    if predicate.operator == PredicateOperator::Exists {
        return Ok(match observed {
            SubjectValue::Missing => false,
            SubjectValue::Text(s) => !s.trim().is_empty(),
            SubjectValue::Number(_) | SubjectValue::Flag(_) => true,
        });
    }

    if matches!(observed, SubjectValue::Missing) {
        return Ok(false);
    }
    let Some(expected) = predicate.value.as_deref() else {
        return Ok(false);
    };

    match predicate.operator {
        PredicateOperator::Eq => equals(observed, expected),
        PredicateOperator::Neq => equals(observed, expected).map(|eq| !eq),
        PredicateOperator::Gt => compare(observed, expected).map(|o| o == std::cmp::Ordering::Greater),
        PredicateOperator::Gte => {
            compare(observed, expected).map(|o| o != std::cmp::Ordering::Less)
        }
        PredicateOperator::Lt => compare(observed, expected).map(|o| o == std::cmp::Ordering::Less),
        PredicateOperator::Lte => {
            compare(observed, expected).map(|o| o != std::cmp::Ordering::Greater)
        }
        PredicateOperator::Matches => Ok(glob_match(observed, expected)),
        PredicateOperator::Exists => unreachable!(),
    }
}

/// Equality with the expected string coerced to the observed runtime type.
fn equals(observed: &SubjectValue, expected: &str) -> Result<bool, PredicateEvaluationError> {
    match observed {
        SubjectValue::Flag(flag) => {
            let coerced = matches!(expected.to_ascii_lowercase().as_str(), "true" | "1" | "yes");
            Ok(*flag == coerced)
        }
        SubjectValue::Number(number) => {
            let coerced: f64 = expected.parse().map_err(|_| {
                PredicateEvaluationError::new(
                    PredicateErrorCode::ValueTypeMismatch,
                    format!("Cannot convert predicate value '{expected}' to match observed type."),
                )
            })?;
            Ok(*number == coerced)
        }
        SubjectValue::Text(text) => Ok(text == expected),
        SubjectValue::Missing => Ok(false),
    }
}

/// Ordering comparison; only numeric-numeric and text-text are defined.
fn compare(
    observed: &SubjectValue,
    expected: &str,
) -> Result<std::cmp::Ordering, PredicateEvaluationError> {
    match observed {
        SubjectValue::Number(number) => {
            let coerced: f64 = expected.parse().map_err(|_| {
                PredicateEvaluationError::new(
                    PredicateErrorCode::ValueTypeMismatch,
                    format!("Cannot compare number with '{expected}'."),
                )
            })?;
            number.partial_cmp(&coerced).ok_or_else(|| {
                PredicateEvaluationError::new(
                    PredicateErrorCode::ValueTypeMismatch,
                    "Cannot order NaN values.",
                )
            })
        }
        SubjectValue::Text(text) => {
            // Only attempt string ordering when the expected side is not
            // numeric; "abc" vs 42 is a type mismatch, not false.
            if expected.parse::<f64>().is_ok() {
                return Err(PredicateEvaluationError::new(
                    PredicateErrorCode::ValueTypeMismatch,
                    format!("Cannot compare str with number '{expected}'."),
                ));
            }
            Ok(text.as_str().cmp(expected))
        }
        SubjectValue::Flag(_) => Err(PredicateEvaluationError::new(
            PredicateErrorCode::ValueTypeMismatch,
            "Cannot order boolean values.",
        )),
        SubjectValue::Missing => Err(PredicateEvaluationError::new(
            PredicateErrorCode::ValueTypeMismatch,
            "Cannot order missing values.",
        )),
    }
}

/// Full-match the stringified observed value against a glob-like pattern.
///
/// `*` matches any sequence, `?` any single character, `[...]` classes are
/// preserved, everything else is escaped.
fn glob_match(observed: &SubjectValue, pattern: &str) -> bool {
    let Some(text) = observed.stringify() else {
        return false;
    };
    let regex_pattern = glob_to_regex(pattern);
    match Regex::new(&format!("^(?:{regex_pattern})$")) {
        Ok(regex) => regex.is_match(&text),
        Err(_) => false,
    }
}

fn glob_to_regex(pattern: &str) -> String {
    let chars: Vec<char> = pattern.chars().collect();
    let mut regex_pattern = String::new();
    let mut i = 0;
    while i < chars.len() {
        match chars[i] {
            '*' => regex_pattern.push_str(".*"),
            '?' => regex_pattern.push('.'),
            '[' => {
                let mut j = i + 1;
                while j < chars.len() && chars[j] != ']' {
                    j += 1;
                }
                if j < chars.len() {
                    regex_pattern.extend(&chars[i..=j]);
                    i = j;
                } else {
                    regex_pattern.push_str(&regex::escape("["));
                }
            }
            c => regex_pattern.push_str(&regex::escape(&c.to_string())),
        }
        i += 1;
    }
    regex_pattern
}
