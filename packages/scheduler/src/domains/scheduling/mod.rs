//! Scheduling domain: durable schedules over task intents, execution
//! dispatch, capability-gated predicate evaluation, and the audit substrate.

pub mod actor;
pub mod adapter;
pub mod adapters;
pub mod commands;
pub mod dispatcher;
pub mod gate;
pub mod interface;
pub mod models;
pub mod predicate;
pub mod queries;
pub mod retry;
pub mod timing;

pub use actor::{ActorContext, ExecutionActorContext, ScheduledActorContext};
pub use models::DataAccessError;
