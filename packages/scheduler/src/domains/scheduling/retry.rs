//! Retry policy engine: pure arithmetic over attempts and outcomes.
//!
//! Nothing in here touches a clock or the database; callers pass the finish
//! time and persist the returned disposition. The same functions back both
//! the execution rows and the timer-engine state, so the two can never
//! disagree on when a retry is due.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use super::models::execution::BackoffStrategy;

/// Exponential backoff is capped so a long retry chain cannot push the next
/// attempt arbitrarily far out.
pub const MAX_BACKOFF_SECONDS: i64 = 3600;

/// Retry policy applied to new executions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: i32,
    pub backoff_strategy: BackoffStrategy,
    pub backoff_base_seconds: i64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 1,
            backoff_strategy: BackoffStrategy::Fixed,
            backoff_base_seconds: 300,
        }
    }
}

/// Whether another attempt is permitted.
pub fn should_retry(attempt_count: i32, max_attempts: i32) -> bool {
    attempt_count < max_attempts
}

/// Compute the timestamp of the next retry.
///
/// `fixed` waits the base each time; `exponential` doubles per retry
/// (base * 2^(retry_count - 1)) up to [`MAX_BACKOFF_SECONDS`]; `none` never
/// retries.
pub fn compute_retry_at(
    finished_at: DateTime<Utc>,
    retry_count: i32,
    strategy: BackoffStrategy,
    backoff_base_seconds: i64,
) -> Option<DateTime<Utc>> {
    match strategy {
        BackoffStrategy::None => None,
        BackoffStrategy::Fixed => Some(finished_at + Duration::seconds(backoff_base_seconds)),
        BackoffStrategy::Exponential => {
            let exponent = (retry_count - 1).max(0).min(30) as u32;
            let seconds = backoff_base_seconds
                .saturating_mul(1i64 << exponent)
                .min(MAX_BACKOFF_SECONDS);
            Some(finished_at + Duration::seconds(seconds))
        }
    }
}

/// Invocation outcomes as reported by the agent runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionOutcome {
    Success,
    Failure,
    Deferred,
    /// The agent returned a status outside the contract.
    Unknown,
}

/// What to write back to an execution after an invocation outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionDisposition {
    /// Terminal success; error fields are cleared.
    Succeeded,
    /// Retry scheduled for `retry_at` with the resolved strategy.
    RetryScheduled {
        retry_count: i32,
        retry_at: DateTime<Utc>,
        strategy: BackoffStrategy,
        failure_count: i32,
    },
    /// Terminal failure (retries exhausted, backoff `none`, or bad status).
    Failed {
        failure_count: i32,
        error_code: Option<String>,
        error_message: Option<String>,
    },
}

/// Decision table mapping an outcome onto the next execution state.
///
/// `failure` and `deferred` both consume the retry budget; an unknown status
/// fails immediately with `invalid_result_status`.
#[allow(clippy::too_many_arguments)]
pub fn decide(
    outcome: ExecutionOutcome,
    attempt_count: i32,
    max_attempts: i32,
    retry_count: i32,
    failure_count: i32,
    finished_at: DateTime<Utc>,
    strategy: BackoffStrategy,
    policy: &RetryPolicy,
    error_code: Option<String>,
    error_message: Option<String>,
) -> ExecutionDisposition {
    match outcome {
        ExecutionOutcome::Success => ExecutionDisposition::Succeeded,
        ExecutionOutcome::Unknown => ExecutionDisposition::Failed {
            failure_count: failure_count + 1,
            error_code: Some("invalid_result_status".to_string()),
            error_message,
        },
        ExecutionOutcome::Failure | ExecutionOutcome::Deferred => {
            let failure_count = failure_count + 1;
            if !should_retry(attempt_count, max_attempts) {
                return ExecutionDisposition::Failed {
                    failure_count,
                    error_code,
                    error_message,
                };
            }
            let retry_count = retry_count + 1;
            match compute_retry_at(
                finished_at,
                retry_count,
                strategy,
                policy.backoff_base_seconds,
            ) {
                Some(retry_at) => ExecutionDisposition::RetryScheduled {
                    retry_count,
                    retry_at,
                    strategy,
                    failure_count,
                },
                None => ExecutionDisposition::Failed {
                    failure_count,
                    error_code,
                    error_message,
                },
            }
        }
    }
}
