//! Reference timer adapter backed by beat-style entries in Postgres.
//!
//! Translates schedule payloads into the entry records of a beat-style timer
//! engine (`timer_beat_entries`) and enqueues immediate callbacks onto
//! `timer_callback_queue`. Only `one_time` and `interval` schedules are
//! representable as beat entries; everything else is refused. The engine's
//! storage is its own; the core never reads these tables.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::PgPool;
use uuid::Uuid;

use crate::common::ScheduleId;

use super::super::adapter::{
    AdapterError, AdapterHealth, CallbackPayload, SchedulePayload, TimerAdapter, TriggerSource,
};
use super::super::models::schedule::{IntervalUnit, ScheduleDefinition};

/// Provider entry kinds: a single firing at `eta`, or a repeating `every`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum BeatSchedule {
    Eta {
        eta: DateTime<Utc>,
    },
    Every {
        count: i32,
        period: &'static str,
        anchor_at: Option<DateTime<Utc>>,
    },
}

/// A beat entry as persisted for the timer engine.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BeatEntry {
    pub entry_name: String,
    pub schedule_id: ScheduleId,
    pub schedule: BeatSchedule,
    pub timezone: String,
    pub queue_name: Option<String>,
    pub callback_args: serde_json::Value,
    pub enabled: bool,
}

/// Provider-specific storage operations for beat entries.
#[async_trait]
pub trait BeatStore: Send + Sync {
    async fn register_entry(&self, entry: &BeatEntry) -> Result<(), AdapterError>;
    async fn update_entry(&self, entry: &BeatEntry) -> Result<(), AdapterError>;
    async fn set_entry_enabled(&self, entry_name: &str, enabled: bool) -> Result<(), AdapterError>;
    async fn delete_entry(&self, entry_name: &str) -> Result<(), AdapterError>;
    async fn enqueue_callback(
        &self,
        payload: &CallbackPayload,
        queue_name: Option<&str>,
    ) -> Result<(), AdapterError>;
    async fn check_health(&self) -> bool;
}

/// Timer adapter translating schedules into beat entries.
pub struct BeatTimerAdapter<S: BeatStore> {
    store: S,
    queue_name: Option<String>,
}

impl<S: BeatStore> BeatTimerAdapter<S> {
    pub fn new(store: S, queue_name: Option<String>) -> Self {
        Self { store, queue_name }
    }

    fn build_entry(&self, payload: &SchedulePayload) -> Result<BeatEntry, AdapterError> {
        let schedule = match &payload.definition {
            ScheduleDefinition::OneTime { run_at } => BeatSchedule::Eta { eta: *run_at },
            ScheduleDefinition::Interval {
                interval_count,
                interval_unit,
                anchor_at,
            } => BeatSchedule::Every {
                count: *interval_count,
                period: interval_period(*interval_unit)?,
                anchor_at: *anchor_at,
            },
            _ => {
                return Err(AdapterError::new(
                    "unsupported_schedule_type",
                    "Schedule type not supported by the beat adapter.",
                )
                .with_details(serde_json::json!({
                    "schedule_type": payload.schedule_type.as_str(),
                })))
            }
        };

        let scheduled_for = match &schedule {
            BeatSchedule::Eta { eta } => Some(*eta),
            BeatSchedule::Every { .. } => None,
        };

        Ok(BeatEntry {
            entry_name: entry_name(payload.schedule_id),
            schedule_id: payload.schedule_id,
            schedule,
            timezone: payload.timezone.clone(),
            queue_name: self.queue_name.clone(),
            callback_args: serde_json::json!({
                "schedule_id": payload.schedule_id,
                "scheduled_for": scheduled_for,
            }),
            enabled: true,
        })
    }
}

fn entry_name(schedule_id: ScheduleId) -> String {
    format!("schedule:{schedule_id}")
}

fn interval_period(unit: IntervalUnit) -> Result<&'static str, AdapterError> {
    match unit {
        IntervalUnit::Minute => Ok("minutes"),
        IntervalUnit::Hour => Ok("hours"),
        IntervalUnit::Day => Ok("days"),
        IntervalUnit::Week => Ok("weeks"),
        IntervalUnit::Month => Err(AdapterError::new(
            "unsupported_interval_unit",
            "Interval unit not supported by the beat adapter.",
        )),
    }
}

#[async_trait]
impl<S: BeatStore> TimerAdapter for BeatTimerAdapter<S> {
    async fn register(&self, payload: &SchedulePayload) -> Result<(), AdapterError> {
        let entry = self.build_entry(payload)?;
        self.store.register_entry(&entry).await
    }

    async fn update(&self, payload: &SchedulePayload) -> Result<(), AdapterError> {
        let entry = self.build_entry(payload)?;
        self.store.update_entry(&entry).await
    }

    async fn pause(&self, schedule_id: ScheduleId) -> Result<(), AdapterError> {
        self.store
            .set_entry_enabled(&entry_name(schedule_id), false)
            .await
    }

    async fn resume(&self, schedule_id: ScheduleId) -> Result<(), AdapterError> {
        self.store
            .set_entry_enabled(&entry_name(schedule_id), true)
            .await
    }

    async fn delete(&self, schedule_id: ScheduleId) -> Result<(), AdapterError> {
        self.store.delete_entry(&entry_name(schedule_id)).await
    }

    async fn trigger_callback(
        &self,
        schedule_id: ScheduleId,
        scheduled_for: DateTime<Utc>,
        trace_id: Option<&str>,
        trigger_source: TriggerSource,
    ) -> Result<(), AdapterError> {
        let payload = CallbackPayload {
            schedule_id,
            scheduled_for,
            trace_id: trace_id
                .map(str::to_string)
                .unwrap_or_else(|| Uuid::new_v4().to_string()),
            emitted_at: Utc::now(),
            trigger_source,
        };
        self.store
            .enqueue_callback(&payload, self.queue_name.as_deref())
            .await
    }

    async fn health(&self) -> AdapterHealth {
        if self.store.check_health().await {
            AdapterHealth::ok("beat adapter ready")
        } else {
            AdapterHealth::degraded("beat adapter unavailable")
        }
    }
}

// ============================================================================
// Postgres store
// ============================================================================

/// Beat entry storage in the adapter's own Postgres tables.
pub struct PgBeatStore {
    pool: PgPool,
}

impl PgBeatStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn columns(entry: &BeatEntry) -> BeatEntryColumns {
        match &entry.schedule {
            BeatSchedule::Eta { eta } => BeatEntryColumns {
                entry_kind: "eta",
                eta: Some(*eta),
                every_count: None,
                every_period: None,
                anchor_at: None,
            },
            BeatSchedule::Every {
                count,
                period,
                anchor_at,
            } => BeatEntryColumns {
                entry_kind: "every",
                eta: None,
                every_count: Some(*count),
                every_period: Some(period),
                anchor_at: *anchor_at,
            },
        }
    }
}

struct BeatEntryColumns {
    entry_kind: &'static str,
    eta: Option<DateTime<Utc>>,
    every_count: Option<i32>,
    every_period: Option<&'static str>,
    anchor_at: Option<DateTime<Utc>>,
}

fn store_error(operation: &str, error: sqlx::Error) -> AdapterError {
    AdapterError::new("store_error", format!("beat store {operation} failed: {error}"))
}

#[async_trait]
impl BeatStore for PgBeatStore {
    async fn register_entry(&self, entry: &BeatEntry) -> Result<(), AdapterError> {
        let cols = Self::columns(entry);
        sqlx::query(
            r#"
            INSERT INTO timer_beat_entries (
                entry_name, schedule_id, entry_kind, eta,
                every_count, every_period, anchor_at,
                timezone, queue_name, callback_args, enabled
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ON CONFLICT (entry_name) DO UPDATE SET
                entry_kind = EXCLUDED.entry_kind,
                eta = EXCLUDED.eta,
                every_count = EXCLUDED.every_count,
                every_period = EXCLUDED.every_period,
                anchor_at = EXCLUDED.anchor_at,
                timezone = EXCLUDED.timezone,
                queue_name = EXCLUDED.queue_name,
                callback_args = EXCLUDED.callback_args,
                enabled = EXCLUDED.enabled,
                updated_at = NOW()
            "#,
        )
        .bind(&entry.entry_name)
        .bind(entry.schedule_id)
        .bind(cols.entry_kind)
        .bind(cols.eta)
        .bind(cols.every_count)
        .bind(cols.every_period)
        .bind(cols.anchor_at)
        .bind(&entry.timezone)
        .bind(&entry.queue_name)
        .bind(&entry.callback_args)
        .bind(entry.enabled)
        .execute(&self.pool)
        .await
        .map_err(|e| store_error("register", e))?;
        Ok(())
    }

    async fn update_entry(&self, entry: &BeatEntry) -> Result<(), AdapterError> {
        let cols = Self::columns(entry);
        let result = sqlx::query(
            r#"
            UPDATE timer_beat_entries SET
                entry_kind = $2,
                eta = $3,
                every_count = $4,
                every_period = $5,
                anchor_at = $6,
                timezone = $7,
                queue_name = $8,
                callback_args = $9,
                updated_at = NOW()
            WHERE entry_name = $1
            "#,
        )
        .bind(&entry.entry_name)
        .bind(cols.entry_kind)
        .bind(cols.eta)
        .bind(cols.every_count)
        .bind(cols.every_period)
        .bind(cols.anchor_at)
        .bind(&entry.timezone)
        .bind(&entry.queue_name)
        .bind(&entry.callback_args)
        .execute(&self.pool)
        .await
        .map_err(|e| store_error("update", e))?;

        if result.rows_affected() == 0 {
            return Err(AdapterError::new(
                "entry_not_found",
                format!("beat entry '{}' is not registered", entry.entry_name),
            ));
        }
        Ok(())
    }

    async fn set_entry_enabled(&self, entry_name: &str, enabled: bool) -> Result<(), AdapterError> {
        let result = sqlx::query(
            "UPDATE timer_beat_entries SET enabled = $2, updated_at = NOW() WHERE entry_name = $1",
        )
        .bind(entry_name)
        .bind(enabled)
        .execute(&self.pool)
        .await
        .map_err(|e| store_error("set_enabled", e))?;

        if result.rows_affected() == 0 {
            return Err(AdapterError::new(
                "entry_not_found",
                format!("beat entry '{entry_name}' is not registered"),
            ));
        }
        Ok(())
    }

    async fn delete_entry(&self, entry_name: &str) -> Result<(), AdapterError> {
        sqlx::query("DELETE FROM timer_beat_entries WHERE entry_name = $1")
            .bind(entry_name)
            .execute(&self.pool)
            .await
            .map_err(|e| store_error("delete", e))?;
        Ok(())
    }

    async fn enqueue_callback(
        &self,
        payload: &CallbackPayload,
        queue_name: Option<&str>,
    ) -> Result<(), AdapterError> {
        let body = serde_json::to_value(payload)
            .map_err(|e| AdapterError::new("serialization_error", e.to_string()))?;
        sqlx::query(
            r#"
            INSERT INTO timer_callback_queue (id, queue_name, eta, payload)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(queue_name)
        .bind(payload.scheduled_for)
        .bind(body)
        .execute(&self.pool)
        .await
        .map_err(|e| store_error("enqueue", e))?;
        Ok(())
    }

    async fn check_health(&self) -> bool {
        sqlx::query("SELECT 1").execute(&self.pool).await.is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domains::scheduling::models::schedule::ScheduleType;
    use chrono::TimeZone;
    use std::sync::Mutex;

    struct RecordingStore {
        calls: Mutex<Vec<String>>,
        entries: Mutex<Vec<BeatEntry>>,
    }

    impl RecordingStore {
        fn new() -> Self {
            Self {
                calls: Mutex::new(Vec::new()),
                entries: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl BeatStore for RecordingStore {
        async fn register_entry(&self, entry: &BeatEntry) -> Result<(), AdapterError> {
            self.calls.lock().unwrap().push("register".into());
            self.entries.lock().unwrap().push(entry.clone());
            Ok(())
        }

        async fn update_entry(&self, entry: &BeatEntry) -> Result<(), AdapterError> {
            self.calls.lock().unwrap().push("update".into());
            self.entries.lock().unwrap().push(entry.clone());
            Ok(())
        }

        async fn set_entry_enabled(
            &self,
            entry_name: &str,
            enabled: bool,
        ) -> Result<(), AdapterError> {
            self.calls
                .lock()
                .unwrap()
                .push(format!("enabled:{entry_name}:{enabled}"));
            Ok(())
        }

        async fn delete_entry(&self, entry_name: &str) -> Result<(), AdapterError> {
            self.calls.lock().unwrap().push(format!("delete:{entry_name}"));
            Ok(())
        }

        async fn enqueue_callback(
            &self,
            payload: &CallbackPayload,
            _queue_name: Option<&str>,
        ) -> Result<(), AdapterError> {
            self.calls
                .lock()
                .unwrap()
                .push(format!("callback:{}", payload.trace_id));
            Ok(())
        }

        async fn check_health(&self) -> bool {
            true
        }
    }

    fn one_time_payload() -> SchedulePayload {
        let run_at = Utc.with_ymd_and_hms(2025, 2, 6, 10, 0, 0).unwrap();
        SchedulePayload {
            schedule_id: ScheduleId::new(),
            schedule_type: ScheduleType::OneTime,
            timezone: "UTC".into(),
            definition: ScheduleDefinition::OneTime { run_at },
            next_run_at: Some(run_at),
        }
    }

    #[tokio::test]
    async fn test_one_time_becomes_eta_entry() {
        let adapter = BeatTimerAdapter::new(RecordingStore::new(), None);
        adapter.register(&one_time_payload()).await.unwrap();
        let entries = adapter.store.entries.lock().unwrap();
        assert_eq!(entries.len(), 1);
        assert!(matches!(entries[0].schedule, BeatSchedule::Eta { .. }));
        assert!(entries[0].entry_name.starts_with("schedule:"));
    }

    #[tokio::test]
    async fn test_interval_becomes_every_entry_with_period_mapping() {
        let adapter = BeatTimerAdapter::new(RecordingStore::new(), Some("brain".into()));
        let payload = SchedulePayload {
            schedule_id: ScheduleId::new(),
            schedule_type: ScheduleType::Interval,
            timezone: "UTC".into(),
            definition: ScheduleDefinition::Interval {
                interval_count: 15,
                interval_unit: IntervalUnit::Minute,
                anchor_at: None,
            },
            next_run_at: None,
        };
        adapter.register(&payload).await.unwrap();
        let entries = adapter.store.entries.lock().unwrap();
        assert_eq!(
            entries[0].schedule,
            BeatSchedule::Every {
                count: 15,
                period: "minutes",
                anchor_at: None
            }
        );
        assert_eq!(entries[0].queue_name.as_deref(), Some("brain"));
    }

    #[tokio::test]
    async fn test_conditional_is_refused() {
        let adapter = BeatTimerAdapter::new(RecordingStore::new(), None);
        let payload = SchedulePayload {
            schedule_id: ScheduleId::new(),
            schedule_type: ScheduleType::Conditional,
            timezone: "UTC".into(),
            definition: ScheduleDefinition::Conditional {
                predicate_subject: "memory.hygiene.score".into(),
                predicate_operator:
                    crate::domains::scheduling::models::schedule::PredicateOperator::Lt,
                predicate_value: Some("80".into()),
                evaluation_interval_count: 6,
                evaluation_interval_unit:
                    crate::domains::scheduling::models::schedule::EvaluationIntervalUnit::Hour,
            },
            next_run_at: None,
        };
        let err = adapter.register(&payload).await.unwrap_err();
        assert_eq!(err.code, "unsupported_schedule_type");
        assert!(adapter.store.entries.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_trigger_callback_generates_trace_when_absent() {
        let adapter = BeatTimerAdapter::new(RecordingStore::new(), None);
        adapter
            .trigger_callback(
                ScheduleId::new(),
                Utc::now(),
                None,
                TriggerSource::RunNow,
            )
            .await
            .unwrap();
        let calls = adapter.store.calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert!(calls[0].starts_with("callback:"));
        assert!(calls[0].len() > "callback:".len());
    }

    #[tokio::test]
    async fn test_pause_resume_delete_use_entry_names() {
        let adapter = BeatTimerAdapter::new(RecordingStore::new(), None);
        let id = ScheduleId::new();
        adapter.pause(id).await.unwrap();
        adapter.resume(id).await.unwrap();
        adapter.delete(id).await.unwrap();
        let calls = adapter.store.calls.lock().unwrap();
        assert_eq!(calls[0], format!("enabled:schedule:{id}:false"));
        assert_eq!(calls[1], format!("enabled:schedule:{id}:true"));
        assert_eq!(calls[2], format!("delete:schedule:{id}"));
    }

    #[test]
    fn test_entry_name_shape() {
        let id = ScheduleId::new();
        assert_eq!(entry_name(id), format!("schedule:{id}"));
    }
}
