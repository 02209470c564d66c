//! Actor context types for schedule mutations, executions, and audits.
//!
//! Every mutation carries who did it (actor type + id), over which channel,
//! and under which trace. The synthetic scheduled actor is the only identity
//! the capability gate admits for predicate evaluation; human-initiated
//! mutations must never claim it.

use serde::{Deserialize, Serialize};

/// Actor type reserved for scheduler-initiated actions.
pub const SCHEDULED_ACTOR_TYPE: &str = "scheduled";
/// Channel reserved for scheduler-initiated actions.
pub const SCHEDULED_CHANNEL: &str = "scheduled";
/// Privilege level the scheduled actor runs under.
pub const SCHEDULED_PRIVILEGE_LEVEL: &str = "constrained";
/// Autonomy level the scheduled actor runs under.
pub const SCHEDULED_AUTONOMY_LEVEL: &str = "limited";

/// Actor context metadata for schedule mutations and audits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActorContext {
    pub actor_type: String,
    pub actor_id: Option<String>,
    pub channel: String,
    pub trace_id: String,
    pub request_id: Option<String>,
    pub reason: Option<String>,
}

impl ActorContext {
    /// Returns a copy with the reason overridden when one is provided.
    pub fn with_reason(&self, reason: Option<&str>) -> Self {
        match reason {
            Some(reason) => Self {
                reason: Some(reason.to_string()),
                ..self.clone()
            },
            None => self.clone(),
        }
    }
}

/// Actor context metadata for execution records and their audits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionActorContext {
    pub actor_type: String,
    pub actor_id: Option<String>,
    pub channel: String,
    pub trace_id: String,
    pub request_id: Option<String>,
    /// Free-form reference describing the scheduled context (trigger source etc).
    pub actor_context: Option<String>,
}

/// The synthetic scheduled actor identity.
///
/// All scheduler-initiated actions run as
/// `{scheduled, scheduled, constrained, limited}`; the capability gate
/// rejects anything else.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScheduledActorContext;

impl ScheduledActorContext {
    pub fn actor_type(&self) -> &'static str {
        SCHEDULED_ACTOR_TYPE
    }

    pub fn channel(&self) -> &'static str {
        SCHEDULED_CHANNEL
    }

    pub fn privilege_level(&self) -> &'static str {
        SCHEDULED_PRIVILEGE_LEVEL
    }

    pub fn autonomy_level(&self) -> &'static str {
        SCHEDULED_AUTONOMY_LEVEL
    }

    /// Compact reference string stored on execution rows for forensics.
    pub fn to_reference(&self, trigger_source: &str) -> String {
        format!(
            "{}:{}:{}:{}:{}",
            SCHEDULED_ACTOR_TYPE,
            SCHEDULED_CHANNEL,
            SCHEDULED_PRIVILEGE_LEVEL,
            SCHEDULED_AUTONOMY_LEVEL,
            trigger_source
        )
    }

    /// Execution actor context for a callback delivery.
    pub fn execution_actor(&self, trace_id: &str, trigger_source: &str) -> ExecutionActorContext {
        ExecutionActorContext {
            actor_type: SCHEDULED_ACTOR_TYPE.to_string(),
            actor_id: None,
            channel: SCHEDULED_CHANNEL.to_string(),
            trace_id: trace_id.to_string(),
            request_id: Some(trace_id.to_string()),
            actor_context: Some(self.to_reference(trigger_source)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_with_reason_overrides_only_when_present() {
        let actor = ActorContext {
            actor_type: "human".into(),
            actor_id: Some("amos".into()),
            channel: "cli".into(),
            trace_id: "t-1".into(),
            request_id: None,
            reason: Some("original".into()),
        };
        assert_eq!(actor.with_reason(None).reason.as_deref(), Some("original"));
        assert_eq!(
            actor.with_reason(Some("override")).reason.as_deref(),
            Some("override")
        );
    }

    #[test]
    fn test_scheduled_reference_carries_trigger_source() {
        let reference = ScheduledActorContext.to_reference("run_now");
        assert_eq!(reference, "scheduled:scheduled:constrained:limited:run_now");
    }

    #[test]
    fn test_execution_actor_uses_trace_as_request_id() {
        let actor = ScheduledActorContext.execution_actor("cb-1", "timer");
        assert_eq!(actor.actor_type, SCHEDULED_ACTOR_TYPE);
        assert_eq!(actor.request_id.as_deref(), Some("cb-1"));
        assert!(actor.actor_context.unwrap().ends_with(":timer"));
    }
}
