//! Scheduler dependencies (using traits for testability)
//!
//! The process owns a DB pool, a timer-adapter client, a capability gate,
//! and a retry policy record, all constructed once at startup and passed
//! explicitly into services. There are no ambient singletons; tests swap in
//! trait-object fakes for the external boundaries.

use anyhow::Result;
use sqlx::PgPool;
use std::sync::Arc;

use crate::config::Config;
use crate::domains::scheduling::adapter::TimerAdapter;
use crate::domains::scheduling::commands::ScheduleCommandService;
use crate::domains::scheduling::dispatcher::{
    ExecutionDispatcher, ExecutionInvoker, FailureNotificationService,
};
use crate::domains::scheduling::gate::CapabilityGate;
use crate::domains::scheduling::models::execution::BackoffStrategy;
use crate::domains::scheduling::predicate::{PredicateEvaluationService, SubjectResolver};
use crate::domains::scheduling::queries::ScheduleQueryService;
use crate::domains::scheduling::retry::RetryPolicy;

/// Dependency container for the scheduler core.
#[derive(Clone)]
pub struct SchedulerDeps {
    pub db_pool: PgPool,
    pub timer: Arc<dyn TimerAdapter>,
    pub gate: Arc<CapabilityGate>,
    pub retry_policy: RetryPolicy,
    pub subject_resolver: Arc<dyn SubjectResolver>,
    pub invoker: Arc<dyn ExecutionInvoker>,
    pub failure_notifier: Option<Arc<dyn FailureNotificationService>>,
}

impl SchedulerDeps {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        db_pool: PgPool,
        timer: Arc<dyn TimerAdapter>,
        gate: Arc<CapabilityGate>,
        retry_policy: RetryPolicy,
        subject_resolver: Arc<dyn SubjectResolver>,
        invoker: Arc<dyn ExecutionInvoker>,
        failure_notifier: Option<Arc<dyn FailureNotificationService>>,
    ) -> Self {
        Self {
            db_pool,
            timer,
            gate,
            retry_policy,
            subject_resolver,
            invoker,
            failure_notifier,
        }
    }

    /// Resolve the retry policy from configuration.
    pub fn retry_policy_from_config(config: &Config) -> Result<RetryPolicy> {
        let backoff_strategy: BackoffStrategy = config.backoff_strategy.parse()?;
        Ok(RetryPolicy {
            max_attempts: config.max_attempts,
            backoff_strategy,
            backoff_base_seconds: config.backoff_base_seconds,
        })
    }

    /// Build the capability gate from configuration.
    pub fn gate_from_config(config: &Config) -> CapabilityGate {
        match &config.capability_allowlist {
            Some(allowlist) => CapabilityGate::new().with_allowlist(allowlist.clone()),
            None => CapabilityGate::new(),
        }
    }

    pub fn command_service(&self) -> ScheduleCommandService {
        ScheduleCommandService::new(self.db_pool.clone(), Arc::clone(&self.timer))
    }

    pub fn query_service(&self) -> ScheduleQueryService {
        ScheduleQueryService::new(self.db_pool.clone())
    }

    pub fn predicate_service(&self) -> Arc<PredicateEvaluationService> {
        Arc::new(PredicateEvaluationService::new(
            Arc::clone(&self.gate),
            Arc::clone(&self.subject_resolver),
        ))
    }

    pub fn dispatcher(&self) -> ExecutionDispatcher {
        let dispatcher = ExecutionDispatcher::new(
            self.db_pool.clone(),
            Arc::clone(&self.invoker),
            self.predicate_service(),
            self.retry_policy,
        );
        match &self.failure_notifier {
            Some(notifier) => dispatcher.with_failure_notifier(Arc::clone(notifier)),
            None => dispatcher,
        }
    }
}
