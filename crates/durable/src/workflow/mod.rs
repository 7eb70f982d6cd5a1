//! Workflow abstractions and types
//!
//! This module contains the core workflow primitives:
//! - [`Workflow`] trait for defining workflow state machines
//! - [`WorkflowAction`] enum for workflow commands
//! - [`WorkflowEvent`] / [`HistoryEvent`] for persisted history
//! - [`WorkflowSignal`] for external communication
//! - [`FanIn`] and [`CronSchedule`] helpers

mod action;
mod context;
mod cron;
mod definition;
mod event;
mod fan_in;
mod signal;

pub use action::{
    ActivityOptions, CommandKey, WorkflowAction, WorkflowOptions, CONDITION_TIMER_PREFIX,
};
pub use context::WorkflowContext;
pub use cron::{CronError, CronSchedule};
pub use definition::{ConditionOutcome, FailureKind, Workflow, WorkflowError, WorkflowStep};
pub use event::{HistoryEvent, TimeoutType, WorkflowEvent, EVENT_FORMAT_VERSION};
pub use fan_in::FanIn;
pub use signal::WorkflowSignal;
