//! Timer-adapter port: the boundary to the external timer engine.
//!
//! The core never wakes executions at wall-clock time itself; it registers
//! schedules with a timer engine through this port and receives callbacks in
//! the reverse direction. Any non-success is a synchronous
//! [`AdapterError`]; the command service both audits and re-raises those so
//! operator forensics never depend on the caller's logs.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::common::ScheduleId;
use crate::text_enum;

use super::models::schedule::{ScheduleDefinition, ScheduleRow, ScheduleType};
use super::models::DataAccessError;

text_enum! {
    /// How a callback came to be delivered.
    pub enum TriggerSource {
        Timer => "timer",
        RunNow => "run_now",
        Retry => "retry",
    }
}

/// Synchronous failure surfaced by a timer adapter operation.
#[derive(Debug, Clone, Error, Serialize, Deserialize)]
#[error("adapter error [{code}]: {message}")]
pub struct AdapterError {
    pub code: String,
    pub message: String,
    #[serde(default)]
    pub details: serde_json::Value,
}

impl AdapterError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            details: serde_json::Value::Null,
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = details;
        self
    }
}

/// Language-neutral schedule record handed to the timer engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulePayload {
    pub schedule_id: ScheduleId,
    pub schedule_type: ScheduleType,
    pub timezone: String,
    pub definition: ScheduleDefinition,
    pub next_run_at: Option<DateTime<Utc>>,
}

impl SchedulePayload {
    pub fn from_schedule(schedule: &ScheduleRow) -> Result<Self, DataAccessError> {
        Ok(Self {
            schedule_id: schedule.id,
            schedule_type: schedule.schedule_type,
            timezone: schedule.timezone.clone(),
            definition: schedule.definition()?,
            next_run_at: schedule.next_run_at,
        })
    }
}

/// Callback delivered by the timer engine when a schedule fires.
///
/// `trace_id` identifies the delivery and is the dispatcher's idempotency
/// key: redelivery with the same trace id is a no-op.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallbackPayload {
    pub schedule_id: ScheduleId,
    pub scheduled_for: DateTime<Utc>,
    pub trace_id: String,
    pub emitted_at: DateTime<Utc>,
    pub trigger_source: TriggerSource,
}

/// Adapter readiness probe result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdapterHealth {
    pub status: AdapterHealthStatus,
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AdapterHealthStatus {
    Ok,
    Degraded,
}

impl AdapterHealth {
    pub fn ok(detail: impl Into<String>) -> Self {
        Self {
            status: AdapterHealthStatus::Ok,
            detail: Some(detail.into()),
        }
    }

    pub fn degraded(detail: impl Into<String>) -> Self {
        Self {
            status: AdapterHealthStatus::Degraded,
            detail: Some(detail.into()),
        }
    }
}

/// Port to the external timer engine.
///
/// The engine is assumed to be a serializing external service; the core
/// issues one call per mutation and does not batch.
#[async_trait]
pub trait TimerAdapter: Send + Sync {
    /// Register a newly created schedule.
    async fn register(&self, payload: &SchedulePayload) -> Result<(), AdapterError>;

    /// Replace the engine's record of a schedule.
    async fn update(&self, payload: &SchedulePayload) -> Result<(), AdapterError>;

    /// Stop callbacks for a schedule without forgetting it.
    async fn pause(&self, schedule_id: ScheduleId) -> Result<(), AdapterError>;

    /// Resume callbacks for a paused schedule.
    async fn resume(&self, schedule_id: ScheduleId) -> Result<(), AdapterError>;

    /// Remove a schedule from the engine.
    async fn delete(&self, schedule_id: ScheduleId) -> Result<(), AdapterError>;

    /// Ask the engine to deliver a callback at `scheduled_for`.
    async fn trigger_callback(
        &self,
        schedule_id: ScheduleId,
        scheduled_for: DateTime<Utc>,
        trace_id: Option<&str>,
        trigger_source: TriggerSource,
    ) -> Result<(), AdapterError>;

    /// Probe engine readiness.
    async fn health(&self) -> AdapterHealth;
}
