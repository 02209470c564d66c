// Brain Scheduler - Orchestration Core
//
// This crate provides the scheduling and execution-orchestration core of the
// assistant control plane: durable schedules over task intents, timer-adapter
// synchronization, capability-gated predicate evaluation, and the execution
// dispatcher that turns timer callbacks into audited agent invocations.
//
// Wall-clock waking belongs to the external timer engine; task logic belongs
// to the agent runtime. The core owns state, transitions, and audit.

pub mod common;
pub mod config;
pub mod domains;
pub mod kernel;

pub use config::*;
