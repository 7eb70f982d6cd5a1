//! Workflow execution engine
//!
//! The engine module provides the [`ReplayEngine`], which rebuilds workflow
//! state from history, and the [`WorkflowExecutor`], which turns replay
//! output into atomic commits.

mod executor;
mod history;
mod outcome;
mod registry;
mod replay;

pub use executor::{
    ExecutorConfig, ExecutorError, ProcessResult, WorkflowExecutor, CHILD_ALREADY_STARTED,
    INVALID_CRON_SCHEDULE, INVALID_INPUT,
};
pub(crate) use history::HistoryView;
pub use registry::{AnyWorkflow, RegistryError, WorkflowFactory, WorkflowRegistry};
pub use replay::{ReplayEngine, ReplayError, ReplayOutcome};

pub(crate) use executor::{close_run, workflow_task};
pub(crate) use outcome::{attempt_outcome_commit, AttemptOutcome};
pub(crate) use replay::panic_message;
