//! Task intent model: the immutable statement of what should happen.
//!
//! A task intent is created jointly with its first schedule and never
//! deleted. After creation only `superseded_by_intent_id` may change, and a
//! record can never supersede itself.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgConnection};
use typed_builder::TypedBuilder;

use crate::common::TaskIntentId;
use crate::domains::scheduling::actor::ActorContext;

use super::{validate_actor_context, DataAccessError};

/// Input payload for creating a task intent inline with schedule creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct TaskIntentInput {
    pub summary: String,
    #[builder(default)]
    pub details: Option<String>,
    #[builder(default)]
    pub origin_reference: Option<String>,
}

/// A stored task intent.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct TaskIntentRow {
    pub id: TaskIntentId,
    pub summary: String,
    pub details: Option<String>,
    pub origin_reference: Option<String>,
    pub creator_actor_type: String,
    pub creator_actor_id: Option<String>,
    pub creator_channel: String,
    pub superseded_by_intent_id: Option<TaskIntentId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TaskIntentRow {
    /// Create a task intent with actor attribution.
    pub async fn create(
        input: &TaskIntentInput,
        actor: &ActorContext,
        now: DateTime<Utc>,
        conn: &mut PgConnection,
    ) -> Result<Self, DataAccessError> {
        validate_actor_context(actor, false)?;
        let summary = input.summary.trim();
        if summary.is_empty() {
            return Err(DataAccessError::validation("summary is required"));
        }

        let row = sqlx::query_as::<_, Self>(
            r#"
            INSERT INTO task_intents (
                id, summary, details, origin_reference,
                creator_actor_type, creator_actor_id, creator_channel,
                created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $8)
            RETURNING *
            "#,
        )
        .bind(TaskIntentId::new())
        .bind(summary)
        .bind(&input.details)
        .bind(&input.origin_reference)
        .bind(&actor.actor_type)
        .bind(&actor.actor_id)
        .bind(&actor.channel)
        .bind(now)
        .fetch_one(&mut *conn)
        .await?;
        Ok(row)
    }

    pub async fn find_by_id(
        id: TaskIntentId,
        conn: &mut PgConnection,
    ) -> Result<Option<Self>, DataAccessError> {
        let row = sqlx::query_as::<_, Self>("SELECT * FROM task_intents WHERE id = $1")
            .bind(id)
            .fetch_optional(&mut *conn)
            .await?;
        Ok(row)
    }

    /// Mark this intent as superseded by a newer one.
    ///
    /// The intent body is immutable; superseding is the only permitted change.
    pub async fn supersede(
        id: TaskIntentId,
        superseded_by: TaskIntentId,
        now: DateTime<Utc>,
        conn: &mut PgConnection,
    ) -> Result<Self, DataAccessError> {
        if superseded_by == id {
            return Err(DataAccessError::validation(
                "task intent cannot supersede itself",
            ));
        }
        let existing = Self::find_by_id(id, conn)
            .await?
            .ok_or(DataAccessError::not_found("task intent"))?;
        if Self::find_by_id(superseded_by, conn).await?.is_none() {
            return Err(DataAccessError::not_found("task intent"));
        }
        if existing.superseded_by_intent_id.is_some() {
            return Err(DataAccessError::ImmutableField(
                "task intent is already superseded".into(),
            ));
        }

        let row = sqlx::query_as::<_, Self>(
            r#"
            UPDATE task_intents
            SET superseded_by_intent_id = $2, updated_at = $3
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(superseded_by)
        .bind(now)
        .fetch_one(&mut *conn)
        .await?;
        Ok(row)
    }
}
