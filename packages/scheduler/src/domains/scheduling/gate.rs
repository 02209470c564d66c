//! Read-only capability enforcement for predicate evaluation.
//!
//! Conditional schedules observe the world before firing; the observation
//! must be provably side-effect-free. The gate admits only the scheduled
//! actor identity and only capabilities on the read-only allowlist. Every
//! denial is handed to the configured audit callback; callback failures are
//! logged and never raised.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{error, warn};

use super::actor::{
    SCHEDULED_ACTOR_TYPE, SCHEDULED_AUTONOMY_LEVEL, SCHEDULED_CHANNEL, SCHEDULED_PRIVILEGE_LEVEL,
};

/// Read-only capabilities that may be observed during predicate evaluation.
/// memory.propose is allowed since a proposal does not commit anything.
pub const READ_ONLY_CAPABILITIES: [&str; 12] = [
    "obsidian.read",
    "memory.propose",
    "vault.search",
    "messaging.read",
    "calendar.read",
    "reminders.read",
    "blob.read",
    "filesystem.read",
    "github.read",
    "web.fetch",
    "scheduler.read",
    "policy.read",
];

/// Side-effecting capabilities, denied explicitly (vs. unknown ones, which
/// are denied by default with a different reason code).
pub const SIDE_EFFECTING_CAPABILITIES: [&str; 13] = [
    "obsidian.write",
    "memory.promote",
    "messaging.send",
    "attention.notify",
    "calendar.write",
    "reminders.write",
    "blob.store",
    "ingest.normalize",
    "filesystem.write",
    "github.write",
    "scheduler.write",
    "policy.write",
    "telemetry.emit",
];

/// Decision outcome of a capability check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CapabilityDecision {
    Allow,
    Deny,
}

/// Machine-readable reason codes for capability denials.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DenialReason {
    NotReadOnly,
    UnknownCapability,
    InvalidActorContext,
}

impl DenialReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DenialReason::NotReadOnly => "not_read_only",
            DenialReason::UnknownCapability => "unknown_capability",
            DenialReason::InvalidActorContext => "invalid_actor_context",
        }
    }
}

/// Actor context presented for capability authorization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilityActorContext {
    pub actor_type: String,
    pub actor_id: Option<String>,
    pub channel: String,
    pub privilege_level: String,
    pub autonomy_level: String,
    pub trace_id: String,
    pub request_id: Option<String>,
}

impl CapabilityActorContext {
    /// The canonical scheduled identity for predicate evaluation.
    pub fn scheduled(trace_id: &str) -> Self {
        Self {
            actor_type: SCHEDULED_ACTOR_TYPE.to_string(),
            actor_id: None,
            channel: SCHEDULED_CHANNEL.to_string(),
            privilege_level: SCHEDULED_PRIVILEGE_LEVEL.to_string(),
            autonomy_level: SCHEDULED_AUTONOMY_LEVEL.to_string(),
            trace_id: trace_id.to_string(),
            request_id: None,
        }
    }

    /// Compact summary used in gate errors.
    pub fn summary(&self) -> String {
        format!(
            "{}/{}/{}/{}",
            self.actor_type, self.channel, self.privilege_level, self.autonomy_level
        )
    }
}

/// Result of a capability authorization check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapabilityCheck {
    pub decision: CapabilityDecision,
    pub capability_id: String,
    pub reason: Option<DenialReason>,
    pub reason_message: Option<String>,
}

impl CapabilityCheck {
    pub fn is_denied(&self) -> bool {
        self.decision == CapabilityDecision::Deny
    }

    fn allow(capability_id: &str) -> Self {
        Self {
            decision: CapabilityDecision::Allow,
            capability_id: capability_id.to_string(),
            reason: None,
            reason_message: None,
        }
    }

    fn deny(capability_id: &str, reason: DenialReason, message: String) -> Self {
        Self {
            decision: CapabilityDecision::Deny,
            capability_id: capability_id.to_string(),
            reason: Some(reason),
            reason_message: Some(message),
        }
    }
}

/// Audit record for a denied capability invocation attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapabilityDenialRecord {
    pub capability_id: String,
    pub reason_code: String,
    pub reason_message: String,
    pub actor_type: String,
    pub actor_id: Option<String>,
    pub channel: String,
    pub privilege_level: String,
    pub autonomy_level: String,
    pub trace_id: String,
    pub request_id: Option<String>,
    pub denied_at: DateTime<Utc>,
    pub evaluation_context: Option<String>,
}

/// Raised by [`CapabilityGate::require`] when a capability is denied.
#[derive(Debug, Error)]
#[error("capability '{capability_id}' denied ({code}) for actor {actor_summary}")]
pub struct CapabilityGateError {
    pub code: String,
    pub capability_id: String,
    pub actor_summary: String,
    pub message: String,
}

type DenialRecorder = dyn Fn(CapabilityDenialRecord) + Send + Sync;

/// Capability gate enforcing read-only access for predicate evaluation.
pub struct CapabilityGate {
    denial_recorder: Option<Box<DenialRecorder>>,
    read_only_capabilities: Vec<String>,
}

impl Default for CapabilityGate {
    fn default() -> Self {
        Self::new()
    }
}

impl CapabilityGate {
    pub fn new() -> Self {
        Self {
            denial_recorder: None,
            read_only_capabilities: READ_ONLY_CAPABILITIES
                .iter()
                .map(|c| c.to_string())
                .collect(),
        }
    }

    /// Override the read-only allowlist (deployment configuration).
    pub fn with_allowlist(mut self, capabilities: Vec<String>) -> Self {
        self.read_only_capabilities = capabilities;
        self
    }

    /// Install the denial audit callback.
    pub fn with_denial_recorder(
        mut self,
        recorder: impl Fn(CapabilityDenialRecord) + Send + Sync + 'static,
    ) -> Self {
        self.denial_recorder = Some(Box::new(recorder));
        self
    }

    /// Check whether a capability is allowed under the given actor context.
    pub fn check(
        &self,
        capability_id: &str,
        actor: &CapabilityActorContext,
        evaluation_context: Option<&str>,
        now: DateTime<Utc>,
    ) -> CapabilityCheck {
        if let Some(denied) = validate_scheduled_actor(capability_id, actor) {
            self.record_denial(&denied, actor, evaluation_context, now);
            return denied;
        }

        if self
            .read_only_capabilities
            .iter()
            .any(|c| c == capability_id)
        {
            return CapabilityCheck::allow(capability_id);
        }

        let denied = if SIDE_EFFECTING_CAPABILITIES.contains(&capability_id) {
            CapabilityCheck::deny(
                capability_id,
                DenialReason::NotReadOnly,
                format!(
                    "Capability '{capability_id}' is side-effecting and not allowed during predicate evaluation."
                ),
            )
        } else {
            CapabilityCheck::deny(
                capability_id,
                DenialReason::UnknownCapability,
                format!("Capability '{capability_id}' is not in the read-only allowlist."),
            )
        };
        self.record_denial(&denied, actor, evaluation_context, now);
        denied
    }

    /// Require a capability, raising a typed gate error on denial.
    pub fn require(
        &self,
        capability_id: &str,
        actor: &CapabilityActorContext,
        evaluation_context: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<(), CapabilityGateError> {
        let result = self.check(capability_id, actor, evaluation_context, now);
        if result.is_denied() {
            return Err(CapabilityGateError {
                code: result
                    .reason
                    .map(|r| r.as_str().to_string())
                    .unwrap_or_else(|| "denied".to_string()),
                capability_id: capability_id.to_string(),
                actor_summary: actor.summary(),
                message: result
                    .reason_message
                    .unwrap_or_else(|| format!("Capability '{capability_id}' denied.")),
            });
        }
        Ok(())
    }

    pub fn is_read_only(&self, capability_id: &str) -> bool {
        self.read_only_capabilities
            .iter()
            .any(|c| c == capability_id)
    }

    pub fn is_side_effecting(&self, capability_id: &str) -> bool {
        SIDE_EFFECTING_CAPABILITIES.contains(&capability_id)
    }

    fn record_denial(
        &self,
        check: &CapabilityCheck,
        actor: &CapabilityActorContext,
        evaluation_context: Option<&str>,
        now: DateTime<Utc>,
    ) {
        let Some(recorder) = &self.denial_recorder else {
            warn!(
                capability = %check.capability_id,
                reason = ?check.reason,
                trace_id = %actor.trace_id,
                "capability denied without audit recorder"
            );
            return;
        };
        let record = CapabilityDenialRecord {
            capability_id: check.capability_id.clone(),
            reason_code: check
                .reason
                .map(|r| r.as_str().to_string())
                .unwrap_or_default(),
            reason_message: check.reason_message.clone().unwrap_or_default(),
            actor_type: actor.actor_type.clone(),
            actor_id: actor.actor_id.clone(),
            channel: actor.channel.clone(),
            privilege_level: actor.privilege_level.clone(),
            autonomy_level: actor.autonomy_level.clone(),
            trace_id: actor.trace_id.clone(),
            request_id: actor.request_id.clone(),
            denied_at: now,
            evaluation_context: evaluation_context.map(str::to_string),
        };
        let capability = record.capability_id.clone();
        let trace_id = record.trace_id.clone();
        if let Err(panic) = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            recorder(record);
        })) {
            error!(
                capability = %capability,
                trace_id = %trace_id,
                ?panic,
                "failed to record capability denial audit"
            );
        }
    }
}

/// Reject anything but the exact scheduled-constrained-limited identity.
fn validate_scheduled_actor(
    capability_id: &str,
    actor: &CapabilityActorContext,
) -> Option<CapabilityCheck> {
    let mismatch = |field: &str, expected: &str, got: &str| {
        CapabilityCheck::deny(
            capability_id,
            DenialReason::InvalidActorContext,
            format!("{field} must be '{expected}' for predicate evaluation, got '{got}'."),
        )
    };

    if actor.actor_type != SCHEDULED_ACTOR_TYPE {
        return Some(mismatch("Actor type", SCHEDULED_ACTOR_TYPE, &actor.actor_type));
    }
    if actor.channel != SCHEDULED_CHANNEL {
        return Some(mismatch("Channel", SCHEDULED_CHANNEL, &actor.channel));
    }
    if actor.privilege_level != SCHEDULED_PRIVILEGE_LEVEL {
        return Some(mismatch(
            "Privilege level",
            SCHEDULED_PRIVILEGE_LEVEL,
            &actor.privilege_level,
        ));
    }
    if actor.autonomy_level != SCHEDULED_AUTONOMY_LEVEL {
        return Some(mismatch(
            "Autonomy level",
            SCHEDULED_AUTONOMY_LEVEL,
            &actor.autonomy_level,
        ));
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    fn now() -> DateTime<Utc> {
        Utc::now()
    }

    fn scheduled_actor() -> CapabilityActorContext {
        CapabilityActorContext::scheduled("t-1")
    }

    #[test]
    fn test_allowlisted_capability_is_allowed() {
        let gate = CapabilityGate::new();
        let result = gate.check("obsidian.read", &scheduled_actor(), None, now());
        assert_eq!(result.decision, CapabilityDecision::Allow);
        assert!(result.reason.is_none());
    }

    #[test]
    fn test_side_effecting_capability_is_denied() {
        let gate = CapabilityGate::new();
        let result = gate.check("obsidian.write", &scheduled_actor(), None, now());
        assert!(result.is_denied());
        assert_eq!(result.reason, Some(DenialReason::NotReadOnly));
    }

    #[test]
    fn test_unknown_capability_is_denied() {
        let gate = CapabilityGate::new();
        let result = gate.check("weather.forecast", &scheduled_actor(), None, now());
        assert!(result.is_denied());
        assert_eq!(result.reason, Some(DenialReason::UnknownCapability));
    }

    #[test]
    fn test_every_side_effecting_capability_denied_even_for_valid_actor() {
        let gate = CapabilityGate::new();
        for capability in SIDE_EFFECTING_CAPABILITIES {
            let result = gate.check(capability, &scheduled_actor(), None, now());
            assert!(result.is_denied(), "{capability} should be denied");
        }
    }

    #[test]
    fn test_non_scheduled_actor_denied_for_any_capability() {
        let gate = CapabilityGate::new();
        let mut actor = scheduled_actor();
        actor.actor_type = "human".into();
        for capability in ["obsidian.read", "obsidian.write", "whatever"] {
            let result = gate.check(capability, &actor, None, now());
            assert!(result.is_denied());
            assert_eq!(result.reason, Some(DenialReason::InvalidActorContext));
        }
    }

    #[test]
    fn test_each_actor_tuple_field_is_checked() {
        let gate = CapabilityGate::new();
        for field in 0..4 {
            let mut actor = scheduled_actor();
            match field {
                0 => actor.actor_type = "agent".into(),
                1 => actor.channel = "cli".into(),
                2 => actor.privilege_level = "elevated".into(),
                _ => actor.autonomy_level = "full".into(),
            }
            let result = gate.check("obsidian.read", &actor, None, now());
            assert_eq!(result.reason, Some(DenialReason::InvalidActorContext));
        }
    }

    #[test]
    fn test_denial_invokes_recorder_with_context() {
        let seen: Arc<Mutex<Vec<CapabilityDenialRecord>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let gate = CapabilityGate::new()
            .with_denial_recorder(move |record| sink.lock().unwrap().push(record));

        gate.check(
            "messaging.send",
            &scheduled_actor(),
            Some("schedule_id=s-1"),
            now(),
        );

        let records = seen.lock().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].capability_id, "messaging.send");
        assert_eq!(records[0].reason_code, "not_read_only");
        assert_eq!(records[0].evaluation_context.as_deref(), Some("schedule_id=s-1"));
    }

    #[test]
    fn test_allow_does_not_invoke_recorder() {
        let seen: Arc<Mutex<Vec<CapabilityDenialRecord>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let gate = CapabilityGate::new()
            .with_denial_recorder(move |record| sink.lock().unwrap().push(record));

        gate.check("vault.search", &scheduled_actor(), None, now());
        assert!(seen.lock().unwrap().is_empty());
    }

    #[test]
    fn test_recorder_panic_is_swallowed() {
        let gate = CapabilityGate::new()
            .with_denial_recorder(|_| panic!("audit store down"));
        let result = gate.check("obsidian.write", &scheduled_actor(), None, now());
        assert!(result.is_denied());
    }

    #[test]
    fn test_require_raises_typed_error() {
        let gate = CapabilityGate::new();
        let err = gate
            .require("scheduler.write", &scheduled_actor(), None, now())
            .unwrap_err();
        assert_eq!(err.code, "not_read_only");
        assert_eq!(err.capability_id, "scheduler.write");
        assert!(err.actor_summary.contains("scheduled"));

        assert!(gate
            .require("scheduler.read", &scheduled_actor(), None, now())
            .is_ok());
    }

    #[test]
    fn test_allowlist_override_replaces_defaults() {
        let gate = CapabilityGate::new().with_allowlist(vec!["custom.read".into()]);
        assert!(!gate
            .check("custom.read", &scheduled_actor(), None, now())
            .is_denied());
        let result = gate.check("obsidian.read", &scheduled_actor(), None, now());
        assert_eq!(result.reason, Some(DenialReason::UnknownCapability));
    }
}
