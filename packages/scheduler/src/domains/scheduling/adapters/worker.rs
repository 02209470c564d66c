//! Callback worker: drains due callbacks and dispatches them concurrently.
//!
//! The bridge between the reference beat engine's callback queue and the
//! execution dispatcher. Each claimed callback is processed on its own task;
//! mutations within one callback stay sequential on that task. Dispatch
//! failures are logged, never re-thrown to the engine — redelivery dedupes
//! on the trace id.

use chrono::Utc;
use sqlx::PgPool;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use super::super::adapter::CallbackPayload;
use super::super::dispatcher::{DispatchOutcome, ExecutionDispatcher};

/// Configuration for the callback worker.
#[derive(Debug, Clone)]
pub struct CallbackWorkerConfig {
    /// Maximum number of callbacks to claim at once
    pub batch_size: i64,
    /// How long to wait when no callbacks are due
    pub poll_interval: Duration,
    /// Worker ID for this instance
    pub worker_id: String,
}

impl Default for CallbackWorkerConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            poll_interval: Duration::from_secs(5),
            worker_id: format!("callback-worker-{}", uuid::Uuid::new_v4()),
        }
    }
}

/// A worker that claims due callbacks and runs the dispatcher on each.
pub struct CallbackWorker {
    pool: PgPool,
    dispatcher: Arc<ExecutionDispatcher>,
    config: CallbackWorkerConfig,
}

impl CallbackWorker {
    pub fn new(pool: PgPool, dispatcher: Arc<ExecutionDispatcher>) -> Self {
        Self {
            pool,
            dispatcher,
            config: CallbackWorkerConfig::default(),
        }
    }

    pub fn with_config(mut self, config: CallbackWorkerConfig) -> Self {
        self.config = config;
        self
    }

    /// Run until the shutdown token fires.
    pub async fn run(self, shutdown: CancellationToken) {
        info!(
            worker_id = %self.config.worker_id,
            batch_size = self.config.batch_size,
            "callback worker starting"
        );

        loop {
            if shutdown.is_cancelled() {
                break;
            }

            let callbacks = match self.claim_due().await {
                Ok(callbacks) => callbacks,
                Err(claim_error) => {
                    error!(%claim_error, "failed to claim callbacks");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    continue;
                }
            };

            if callbacks.is_empty() {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(self.config.poll_interval) => {}
                }
                continue;
            }

            debug!(count = callbacks.len(), "claimed callbacks");

            // One task per callback; distinct callbacks run concurrently.
            let mut handles = Vec::with_capacity(callbacks.len());
            for callback in callbacks {
                let dispatcher = Arc::clone(&self.dispatcher);
                handles.push(tokio::spawn(async move {
                    match dispatcher.dispatch(&callback).await {
                        Ok(DispatchOutcome::Dispatched {
                            execution_id,
                            status,
                        }) => {
                            debug!(
                                schedule_id = %callback.schedule_id,
                                execution_id = %execution_id,
                                status = %status,
                                "callback dispatched"
                            );
                        }
                        Ok(DispatchOutcome::Duplicate { execution_id }) => {
                            debug!(
                                schedule_id = %callback.schedule_id,
                                execution_id = %execution_id,
                                "duplicate callback ignored"
                            );
                        }
                        Ok(DispatchOutcome::Skipped {
                            evaluation_status, ..
                        }) => {
                            debug!(
                                schedule_id = %callback.schedule_id,
                                evaluation_status = %evaluation_status,
                                "conditional callback skipped"
                            );
                        }
                        Err(dispatch_error) => {
                            error!(
                                schedule_id = %callback.schedule_id,
                                trace_id = %callback.trace_id,
                                %dispatch_error,
                                "callback dispatch failed"
                            );
                        }
                    }
                }));
            }
            futures::future::join_all(handles).await;
        }

        info!(worker_id = %self.config.worker_id, "callback worker stopped");
    }

    /// Claim due callbacks by deleting them from the queue.
    async fn claim_due(&self) -> Result<Vec<CallbackPayload>, sqlx::Error> {
        let rows: Vec<(serde_json::Value,)> = sqlx::query_as(
            r#"
            DELETE FROM timer_callback_queue
            WHERE id IN (
                SELECT id FROM timer_callback_queue
                WHERE eta <= $1
                ORDER BY eta ASC
                LIMIT $2
                FOR UPDATE SKIP LOCKED
            )
            RETURNING payload
            "#,
        )
        .bind(Utc::now())
        .bind(self.config.batch_size)
        .fetch_all(&self.pool)
        .await?;

        let mut callbacks = Vec::with_capacity(rows.len());
        for (payload,) in rows {
            match serde_json::from_value::<CallbackPayload>(payload) {
                Ok(callback) => callbacks.push(callback),
                Err(decode_error) => {
                    error!(%decode_error, "dropping undecodable callback payload");
                }
            }
        }
        Ok(callbacks)
    }
}
