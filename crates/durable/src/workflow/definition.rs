//! Workflow trait definition

use std::fmt;

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;

use super::{WorkflowAction, WorkflowContext, WorkflowSignal};
use crate::activity::{error_codes, ActivityError};

/// Classification of a workflow failure
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// An activity failed after its retries were exhausted
    Activity,
    /// An activity or the workflow itself ran out of time
    Timeout,
    /// Workflow code decided to fail
    Application,
    /// Workflow code diverged from its recorded history
    NonDeterminism,
    /// The workflow honoured a cancellation request
    Cancelled,
    /// The workflow was forcibly terminated
    Terminated,
    /// The engine could not make progress (store, serialization)
    Infrastructure,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FailureKind::Activity => "activity",
            FailureKind::Timeout => "timeout",
            FailureKind::Application => "application",
            FailureKind::NonDeterminism => "non_determinism",
            FailureKind::Cancelled => "cancelled",
            FailureKind::Terminated => "terminated",
            FailureKind::Infrastructure => "infrastructure",
        };
        f.write_str(s)
    }
}

/// Error type for workflow failures
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkflowError {
    /// Failure classification
    pub kind: FailureKind,

    /// Error message
    pub message: String,

    /// Error code for programmatic handling
    #[serde(default)]
    pub code: Option<String>,

    /// Whether a workflow retry policy may start a new run
    #[serde(default)]
    pub retryable: bool,

    /// Additional details (e.g. the underlying activity error)
    #[serde(default)]
    pub details: Option<Value>,
}

impl WorkflowError {
    /// Create a new application error
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Application,
            message: message.into(),
            code: None,
            retryable: false,
            details: None,
        }
    }

    /// Create a retryable application error
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            retryable: true,
            ..Self::new(message)
        }
    }

    /// Create an error of a specific kind
    pub fn of_kind(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            ..Self::new(message)
        }
    }

    /// Wrap an activity failure that reached workflow code
    ///
    /// Timeouts keep their own kind so callers can tell them apart.
    pub fn from_activity(activity_id: &str, error: &ActivityError) -> Self {
        let kind = if error.code.as_deref() == Some(error_codes::TIMEOUT) {
            FailureKind::Timeout
        } else {
            FailureKind::Activity
        };
        Self {
            kind,
            message: format!("activity {} failed: {}", activity_id, error.message),
            code: error.code.clone(),
            retryable: error.retryable,
            details: serde_json::to_value(error).ok(),
        }
    }

    /// Set the error code
    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    /// Attach details
    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }
}

impl fmt::Display for WorkflowError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} error: {}", self.kind, self.message)
    }
}

impl std::error::Error for WorkflowError {}

/// How an awaited condition resolved
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ConditionOutcome {
    /// `check_condition` returned true
    Satisfied,
    /// The condition's timeout fired first
    TimedOut,
}

/// Result of a workflow handler: the commands to issue next
///
/// Returning `Err` fails the workflow with that error.
pub type WorkflowStep = Result<Vec<WorkflowAction>, WorkflowError>;

/// A workflow is a deterministic state machine driven by history events
///
/// Each handler receives a [`WorkflowContext`] and returns the commands the
/// workflow wants to issue. Commands are never executed by the handler; the
/// engine records them in history and dispatches their side effects.
///
/// # Determinism
///
/// Given the same history, handlers must return the same commands in the
/// same order. Read time through [`WorkflowContext::now`] and identifiers
/// through [`WorkflowContext::new_uuid`], never from the system.
///
/// # Example
///
/// ```ignore
/// use waypoint_durable::prelude::*;
///
/// struct OrderWorkflow {
///     order_id: String,
/// }
///
/// impl Workflow for OrderWorkflow {
///     const TYPE: &'static str = "order_workflow";
///     type Input = OrderInput;
///     type Output = OrderResult;
///
///     fn new(input: Self::Input) -> Self {
///         Self { order_id: input.order_id }
///     }
///
///     fn on_start(&mut self, _ctx: &WorkflowContext) -> WorkflowStep {
///         Ok(vec![WorkflowAction::schedule_activity(
///             "validate",
///             "validate_order",
///             json!({ "order_id": self.order_id }),
///         )])
///     }
///
///     fn on_activity_completed(
///         &mut self,
///         _ctx: &WorkflowContext,
///         _activity_id: &str,
///         result: Value,
///     ) -> WorkflowStep {
///         Ok(vec![WorkflowAction::complete(result)])
///     }
/// }
/// ```
pub trait Workflow: Send + Sync + 'static {
    /// Unique type identifier for this workflow
    ///
    /// This is used to look up the workflow in the registry during replay.
    const TYPE: &'static str;

    /// Input type for starting the workflow
    type Input: Serialize + DeserializeOwned + Send + Clone;

    /// Output type when workflow completes successfully
    type Output: Serialize + DeserializeOwned + Send;

    /// Create a new workflow instance from input
    ///
    /// This is called both when starting a new workflow and when replaying.
    fn new(input: Self::Input) -> Self;

    /// Called once when the run starts
    fn on_start(&mut self, ctx: &WorkflowContext) -> WorkflowStep;

    /// Called when an activity completes successfully
    fn on_activity_completed(
        &mut self,
        ctx: &WorkflowContext,
        activity_id: &str,
        result: Value,
    ) -> WorkflowStep;

    /// Called when an activity fails terminally (retries exhausted or non-retryable)
    ///
    /// The default fails the workflow.
    fn on_activity_failed(
        &mut self,
        ctx: &WorkflowContext,
        activity_id: &str,
        error: &ActivityError,
    ) -> WorkflowStep {
        let _ = ctx;
        Err(WorkflowError::from_activity(activity_id, error))
    }

    /// Called when a timer started by this workflow fires
    fn on_timer_fired(&mut self, ctx: &WorkflowContext, timer_id: &str) -> WorkflowStep {
        let _ = (ctx, timer_id);
        Ok(vec![])
    }

    /// Whether signals named `signal_name` are delivered without an explicit await
    fn handles_signal(&self, signal_name: &str) -> bool {
        let _ = signal_name;
        false
    }

    /// Called when a buffered signal is delivered
    fn on_signal(&mut self, ctx: &WorkflowContext, signal: &WorkflowSignal) -> WorkflowStep {
        let _ = (ctx, signal);
        Ok(vec![])
    }

    /// Evaluate a condition registered with [`WorkflowAction::AwaitCondition`]
    fn check_condition(&self, condition_id: &str) -> bool {
        let _ = condition_id;
        false
    }

    /// Called when an awaited condition is satisfied or times out
    fn on_condition(
        &mut self,
        ctx: &WorkflowContext,
        condition_id: &str,
        outcome: ConditionOutcome,
    ) -> WorkflowStep {
        let _ = (ctx, condition_id, outcome);
        Ok(vec![])
    }

    /// Called when a child workflow completes
    fn on_child_completed(
        &mut self,
        ctx: &WorkflowContext,
        workflow_id: &str,
        result: Value,
    ) -> WorkflowStep {
        let _ = (ctx, workflow_id, result);
        Ok(vec![])
    }

    /// Called when a child workflow closes without completing
    ///
    /// The default fails the parent with the child's error.
    fn on_child_failed(
        &mut self,
        ctx: &WorkflowContext,
        workflow_id: &str,
        error: &WorkflowError,
    ) -> WorkflowStep {
        let _ = (ctx, workflow_id);
        Err(error.clone())
    }

    /// Called when cancellation of this run was requested
    ///
    /// The default cancels the workflow immediately.
    fn on_cancel_requested(&mut self, ctx: &WorkflowContext, reason: &str) -> WorkflowStep {
        let _ = ctx;
        Ok(vec![WorkflowAction::cancel(reason)])
    }

    /// Answer a read-only query against the current state
    fn query(&self, query_name: &str, args: &Value) -> Result<Value, WorkflowError> {
        let _ = args;
        Err(WorkflowError::new(format!("unknown query: {}", query_name)).with_code("UNKNOWN_QUERY"))
    }
}
