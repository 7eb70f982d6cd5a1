//! Workflow commands and their options

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::WorkflowError;
use crate::reliability::RetryPolicy;

/// Timer id prefix reserved for condition timeouts
pub const CONDITION_TIMER_PREFIX: &str = "condition:";

/// Commands a workflow can issue
///
/// Handlers return these; the engine records each command as a history event
/// (except the two await commands, which only change replay state) and
/// dispatches its side effects atomically with that event.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkflowAction {
    /// Schedule an activity for execution
    ScheduleActivity {
        /// Unique identifier for this activity within the workflow
        activity_id: String,

        /// Type of activity to execute (used to look up in registry)
        activity_type: String,

        /// Input data for the activity (JSON)
        input: serde_json::Value,

        /// Execution options (retries, timeouts, etc.)
        options: ActivityOptions,
    },

    /// Start a timer that fires after the specified duration
    StartTimer {
        /// Unique identifier for this timer within the workflow
        timer_id: String,

        /// Duration to wait before firing
        #[serde(with = "crate::duration::millis")]
        duration: Duration,
    },

    /// Cancel a timer that has not fired yet
    CancelTimer { timer_id: String },

    /// Start a child workflow
    ScheduleChildWorkflow {
        /// Workflow id of the child
        workflow_id: String,

        /// Type of workflow to start
        workflow_type: String,

        /// Input for the child workflow
        input: serde_json::Value,

        /// Task queue for the child; defaults to the parent's
        #[serde(default)]
        task_queue: Option<String>,

        #[serde(default)]
        options: WorkflowOptions,
    },

    /// Request cancellation of a pending activity
    CancelActivity {
        /// ID of the activity to cancel
        activity_id: String,
    },

    /// Deliver the next buffered signal with this name to `on_signal`
    AwaitSignal { signal_name: String },

    /// Wait until `check_condition(condition_id)` holds, or the timeout fires
    AwaitCondition {
        condition_id: String,

        #[serde(default, with = "crate::duration::option_millis")]
        timeout: Option<Duration>,
    },

    /// Complete the workflow successfully with a result
    CompleteWorkflow {
        /// Result value (JSON)
        result: serde_json::Value,
    },

    /// Fail the workflow with an error
    FailWorkflow {
        /// Error details
        error: WorkflowError,
    },

    /// Close the workflow as cancelled
    CancelWorkflow { reason: String },
}

impl WorkflowAction {
    /// Create a schedule activity action with default options
    pub fn schedule_activity(
        activity_id: impl Into<String>,
        activity_type: impl Into<String>,
        input: serde_json::Value,
    ) -> Self {
        Self::ScheduleActivity {
            activity_id: activity_id.into(),
            activity_type: activity_type.into(),
            input,
            options: ActivityOptions::default(),
        }
    }

    /// Create a schedule activity action with explicit options
    pub fn schedule_activity_with(
        activity_id: impl Into<String>,
        activity_type: impl Into<String>,
        input: serde_json::Value,
        options: ActivityOptions,
    ) -> Self {
        Self::ScheduleActivity {
            activity_id: activity_id.into(),
            activity_type: activity_type.into(),
            input,
            options,
        }
    }

    /// Create a child workflow action with default options
    pub fn start_child(
        workflow_id: impl Into<String>,
        workflow_type: impl Into<String>,
        input: serde_json::Value,
    ) -> Self {
        Self::ScheduleChildWorkflow {
            workflow_id: workflow_id.into(),
            workflow_type: workflow_type.into(),
            input,
            task_queue: None,
            options: WorkflowOptions::default(),
        }
    }

    /// Create a complete workflow action
    pub fn complete(result: serde_json::Value) -> Self {
        Self::CompleteWorkflow { result }
    }

    /// Create a fail workflow action
    pub fn fail(error: WorkflowError) -> Self {
        Self::FailWorkflow { error }
    }

    /// Create a cancel workflow action
    pub fn cancel(reason: impl Into<String>) -> Self {
        Self::CancelWorkflow {
            reason: reason.into(),
        }
    }

    /// Create a timer action
    pub fn timer(timer_id: impl Into<String>, duration: Duration) -> Self {
        Self::StartTimer {
            timer_id: timer_id.into(),
            duration,
        }
    }

    /// Create a cancel timer action
    pub fn cancel_timer(timer_id: impl Into<String>) -> Self {
        Self::CancelTimer {
            timer_id: timer_id.into(),
        }
    }

    /// Create a cancel activity action
    pub fn cancel_activity(activity_id: impl Into<String>) -> Self {
        Self::CancelActivity {
            activity_id: activity_id.into(),
        }
    }

    /// Create an await signal action
    pub fn await_signal(signal_name: impl Into<String>) -> Self {
        Self::AwaitSignal {
            signal_name: signal_name.into(),
        }
    }

    /// Create an await condition action
    pub fn await_condition(condition_id: impl Into<String>, timeout: Option<Duration>) -> Self {
        Self::AwaitCondition {
            condition_id: condition_id.into(),
            timeout,
        }
    }

    /// Whether this command closes the workflow
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::CompleteWorkflow { .. } | Self::FailWorkflow { .. } | Self::CancelWorkflow { .. }
        )
    }

    /// Identity used to match this command against recorded history
    ///
    /// Await commands are not recorded and have no key.
    pub fn command_key(&self) -> Option<CommandKey> {
        match self {
            Self::ScheduleActivity {
                activity_id,
                activity_type,
                ..
            } => Some(CommandKey::ScheduleActivity {
                activity_id: activity_id.clone(),
                activity_type: activity_type.clone(),
            }),
            Self::StartTimer { timer_id, .. } => Some(CommandKey::StartTimer {
                timer_id: timer_id.clone(),
            }),
            Self::CancelTimer { timer_id } => Some(CommandKey::CancelTimer {
                timer_id: timer_id.clone(),
            }),
            Self::ScheduleChildWorkflow {
                workflow_id,
                workflow_type,
                ..
            } => Some(CommandKey::StartChildWorkflow {
                workflow_id: workflow_id.clone(),
                workflow_type: workflow_type.clone(),
            }),
            Self::CancelActivity { activity_id } => Some(CommandKey::CancelActivity {
                activity_id: activity_id.clone(),
            }),
            Self::CompleteWorkflow { .. } => Some(CommandKey::CompleteWorkflow),
            Self::FailWorkflow { .. } => Some(CommandKey::FailWorkflow),
            Self::CancelWorkflow { .. } => Some(CommandKey::CancelWorkflow),
            Self::AwaitSignal { .. } | Self::AwaitCondition { .. } => None,
        }
    }
}

/// Identity of a recorded command: kind plus the ids that must not change on replay
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CommandKey {
    ScheduleActivity {
        activity_id: String,
        activity_type: String,
    },
    StartTimer {
        timer_id: String,
    },
    CancelTimer {
        timer_id: String,
    },
    StartChildWorkflow {
        workflow_id: String,
        workflow_type: String,
    },
    CancelActivity {
        activity_id: String,
    },
    CompleteWorkflow,
    FailWorkflow,
    CancelWorkflow,
}

impl fmt::Display for CommandKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommandKey::ScheduleActivity {
                activity_id,
                activity_type,
            } => write!(f, "ScheduleActivity({}, {})", activity_id, activity_type),
            CommandKey::StartTimer { timer_id } => write!(f, "StartTimer({})", timer_id),
            CommandKey::CancelTimer { timer_id } => write!(f, "CancelTimer({})", timer_id),
            CommandKey::StartChildWorkflow {
                workflow_id,
                workflow_type,
            } => write!(f, "StartChildWorkflow({}, {})", workflow_id, workflow_type),
            CommandKey::CancelActivity { activity_id } => {
                write!(f, "CancelActivity({})", activity_id)
            }
            CommandKey::CompleteWorkflow => f.write_str("CompleteWorkflow"),
            CommandKey::FailWorkflow => f.write_str("FailWorkflow"),
            CommandKey::CancelWorkflow => f.write_str("CancelWorkflow"),
        }
    }
}

/// Options for activity execution
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ActivityOptions {
    /// Retry policy for this activity
    pub retry_policy: RetryPolicy,

    /// Task queue to dispatch on; defaults to the workflow's queue
    #[serde(default)]
    pub task_queue: Option<String>,

    /// Maximum time to wait for the activity to be picked up by a worker
    ///
    /// Expiry is a terminal failure and is not retried.
    #[serde(default, with = "crate::duration::option_millis")]
    pub schedule_to_start_timeout: Option<Duration>,

    /// Maximum time for a single attempt
    #[serde(with = "crate::duration::millis")]
    pub start_to_close_timeout: Duration,

    /// Maximum gap between heartbeats for long-running activities
    #[serde(default, with = "crate::duration::option_millis")]
    pub heartbeat_timeout: Option<Duration>,
}

impl Default for ActivityOptions {
    fn default() -> Self {
        Self {
            retry_policy: RetryPolicy::default(),
            task_queue: None,
            schedule_to_start_timeout: None,
            start_to_close_timeout: Duration::from_secs(300),
            heartbeat_timeout: None,
        }
    }
}

impl ActivityOptions {
    /// Create options with a specific retry policy
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    /// Dispatch on a specific task queue
    pub fn with_task_queue(mut self, task_queue: impl Into<String>) -> Self {
        self.task_queue = Some(task_queue.into());
        self
    }

    /// Set schedule-to-start timeout
    pub fn with_schedule_to_start_timeout(mut self, timeout: Duration) -> Self {
        self.schedule_to_start_timeout = Some(timeout);
        self
    }

    /// Set start-to-close timeout
    pub fn with_start_to_close_timeout(mut self, timeout: Duration) -> Self {
        self.start_to_close_timeout = timeout;
        self
    }

    /// Set heartbeat timeout
    pub fn with_heartbeat_timeout(mut self, timeout: Duration) -> Self {
        self.heartbeat_timeout = Some(timeout);
        self
    }
}

/// Options for starting a workflow run (top-level or child)
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct WorkflowOptions {
    /// Start a new run when this one fails with a retryable error
    #[serde(default)]
    pub retry_policy: Option<RetryPolicy>,

    /// Start a new run on this schedule whenever a run closes
    #[serde(default)]
    pub cron_schedule: Option<String>,

    /// Time the run out if it has not closed within this duration
    #[serde(default, with = "crate::duration::option_millis")]
    pub execution_timeout: Option<Duration>,
}

impl WorkflowOptions {
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = Some(policy);
        self
    }

    pub fn with_cron_schedule(mut self, schedule: impl Into<String>) -> Self {
        self.cron_schedule = Some(schedule.into());
        self
    }

    pub fn with_execution_timeout(mut self, timeout: Duration) -> Self {
        self.execution_timeout = Some(timeout);
        self
    }
}
