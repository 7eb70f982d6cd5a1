//! Workflow history events

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{ActivityOptions, CommandKey, WorkflowError, WorkflowOptions, WorkflowSignal};
use crate::activity::ActivityError;
use crate::persistence::InstanceRef;

/// Current schema version written into every [`HistoryEvent`]
pub const EVENT_FORMAT_VERSION: u16 = 1;

/// Types of timeouts that can occur
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TimeoutType {
    /// Activity was not picked up within schedule_to_start_timeout
    ScheduleToStart,

    /// Activity attempt did not finish within start_to_close_timeout
    StartToClose,

    /// Worker did not send heartbeat within heartbeat_timeout
    Heartbeat,
}

impl TimeoutType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TimeoutType::ScheduleToStart => "schedule_to_start",
            TimeoutType::StartToClose => "start_to_close",
            TimeoutType::Heartbeat => "heartbeat",
        }
    }
}

/// One entry of a workflow run's history
///
/// `event_id` starts at 1 and increases by one per appended event, so the
/// history version of a run equals the id of its last event.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HistoryEvent {
    pub event_id: u64,
    pub timestamp: DateTime<Utc>,
    pub format_version: u16,
    pub event: WorkflowEvent,
}

impl HistoryEvent {
    pub fn new(event_id: u64, timestamp: DateTime<Utc>, event: WorkflowEvent) -> Self {
        Self {
            event_id,
            timestamp,
            format_version: EVENT_FORMAT_VERSION,
            event,
        }
    }
}

/// Events in a workflow run's append-only log
///
/// The log is the only source of truth for workflow state: the replay
/// engine rebuilds a workflow by feeding these events back through its
/// handlers in order.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkflowEvent {
    // =========================================================================
    // Workflow Lifecycle Events
    // =========================================================================
    /// Workflow run was started with the given input
    WorkflowStarted {
        workflow_type: String,
        input: serde_json::Value,
        task_queue: String,
        /// Run attempt, incremented by workflow retries
        #[serde(default = "first_attempt")]
        attempt: u32,
        #[serde(default)]
        parent: Option<InstanceRef>,
        #[serde(default)]
        options: WorkflowOptions,
    },

    /// Workflow completed successfully
    WorkflowCompleted {
        /// The result value
        result: serde_json::Value,
    },

    /// Workflow failed with an error
    WorkflowFailed {
        /// Error details
        error: WorkflowError,
    },

    /// Workflow closed after honouring a cancellation request
    WorkflowCancelled {
        /// Reason for cancellation
        reason: String,
    },

    /// Workflow exceeded its execution timeout
    WorkflowTimedOut,

    /// Workflow was forcibly terminated; no workflow code ran
    WorkflowTerminated { reason: String },

    /// Cancellation was requested; surfaced to workflow code at the next decision
    CancellationRequested { reason: String },

    // =========================================================================
    // Activity Events
    // =========================================================================
    /// Activity was scheduled for execution
    ActivityScheduled {
        activity_id: String,
        activity_type: String,
        input: serde_json::Value,
        task_queue: String,
        options: ActivityOptions,
    },

    /// A worker started an attempt
    ActivityStarted {
        activity_id: String,
        attempt: u32,
        worker_id: String,
    },

    /// Progress reported by a running attempt
    ActivityHeartbeat {
        activity_id: String,
        attempt: u32,
        #[serde(default)]
        details: Option<serde_json::Value>,
    },

    /// Activity completed successfully
    ActivityCompleted {
        activity_id: String,
        attempt: u32,
        result: serde_json::Value,
    },

    /// An attempt failed
    ActivityFailed {
        activity_id: String,
        attempt: u32,
        error: ActivityError,
        /// Another attempt has been scheduled
        will_retry: bool,
        /// The policy ran out of attempts
        #[serde(default)]
        attempts_exhausted: bool,
    },

    /// An attempt (or the wait for a worker) timed out
    ActivityTimedOut {
        activity_id: String,
        attempt: u32,
        timeout_type: TimeoutType,
        will_retry: bool,
        #[serde(default)]
        attempts_exhausted: bool,
    },

    /// Activity was cancelled by the workflow
    ActivityCancelled { activity_id: String },

    // =========================================================================
    // Timer Events
    // =========================================================================
    /// Durable timer was started
    TimerStarted {
        timer_id: String,
        fire_at: DateTime<Utc>,
        #[serde(with = "crate::duration::millis")]
        duration: Duration,
    },

    /// Timer fired
    TimerFired { timer_id: String },

    /// Timer was cancelled before firing
    TimerCancelled { timer_id: String },

    // =========================================================================
    // Signal Events
    // =========================================================================
    /// External signal was received and buffered
    SignalReceived { signal: WorkflowSignal },

    // =========================================================================
    // Child Workflow Events
    // =========================================================================
    /// Child workflow run was created
    ChildWorkflowStarted {
        workflow_id: String,
        run_id: Uuid,
        workflow_type: String,
    },

    /// Child workflow completed
    ChildWorkflowCompleted {
        workflow_id: String,
        run_id: Uuid,
        result: serde_json::Value,
    },

    /// Child workflow closed without completing
    ChildWorkflowFailed {
        workflow_id: String,
        run_id: Uuid,
        error: WorkflowError,
    },
}

fn first_attempt() -> u32 {
    1
}

impl WorkflowEvent {
    /// Get the activity ID if this is an activity event
    pub fn activity_id(&self) -> Option<&str> {
        match self {
            WorkflowEvent::ActivityScheduled { activity_id, .. }
            | WorkflowEvent::ActivityStarted { activity_id, .. }
            | WorkflowEvent::ActivityHeartbeat { activity_id, .. }
            | WorkflowEvent::ActivityCompleted { activity_id, .. }
            | WorkflowEvent::ActivityFailed { activity_id, .. }
            | WorkflowEvent::ActivityTimedOut { activity_id, .. }
            | WorkflowEvent::ActivityCancelled { activity_id } => Some(activity_id),
            _ => None,
        }
    }

    /// Check if this is a terminal workflow event
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            WorkflowEvent::WorkflowCompleted { .. }
                | WorkflowEvent::WorkflowFailed { .. }
                | WorkflowEvent::WorkflowCancelled { .. }
                | WorkflowEvent::WorkflowTimedOut
                | WorkflowEvent::WorkflowTerminated { .. }
        )
    }

    /// Key of the workflow command this event records, if any
    pub fn command_key(&self) -> Option<CommandKey> {
        match self {
            WorkflowEvent::ActivityScheduled {
                activity_id,
                activity_type,
                ..
            } => Some(CommandKey::ScheduleActivity {
                activity_id: activity_id.clone(),
                activity_type: activity_type.clone(),
            }),
            WorkflowEvent::TimerStarted { timer_id, .. } => Some(CommandKey::StartTimer {
                timer_id: timer_id.clone(),
            }),
            WorkflowEvent::TimerCancelled { timer_id } => Some(CommandKey::CancelTimer {
                timer_id: timer_id.clone(),
            }),
            WorkflowEvent::ActivityCancelled { activity_id } => Some(CommandKey::CancelActivity {
                activity_id: activity_id.clone(),
            }),
            WorkflowEvent::ChildWorkflowStarted {
                workflow_id,
                workflow_type,
                ..
            } => Some(CommandKey::StartChildWorkflow {
                workflow_id: workflow_id.clone(),
                workflow_type: workflow_type.clone(),
            }),
            WorkflowEvent::WorkflowCompleted { .. } => Some(CommandKey::CompleteWorkflow),
            WorkflowEvent::WorkflowFailed { .. } => Some(CommandKey::FailWorkflow),
            WorkflowEvent::WorkflowCancelled { .. } => Some(CommandKey::CancelWorkflow),
            _ => None,
        }
    }

    /// Short name of the event type, used in logs and error messages
    pub fn name(&self) -> &'static str {
        match self {
            WorkflowEvent::WorkflowStarted { .. } => "WorkflowStarted",
            WorkflowEvent::WorkflowCompleted { .. } => "WorkflowCompleted",
            WorkflowEvent::WorkflowFailed { .. } => "WorkflowFailed",
            WorkflowEvent::WorkflowCancelled { .. } => "WorkflowCancelled",
            WorkflowEvent::WorkflowTimedOut => "WorkflowTimedOut",
            WorkflowEvent::WorkflowTerminated { .. } => "WorkflowTerminated",
            WorkflowEvent::CancellationRequested { .. } => "CancellationRequested",
            WorkflowEvent::ActivityScheduled { .. } => "ActivityScheduled",
            WorkflowEvent::ActivityStarted { .. } => "ActivityStarted",
            WorkflowEvent::ActivityHeartbeat { .. } => "ActivityHeartbeat",
            WorkflowEvent::ActivityCompleted { .. } => "ActivityCompleted",
            WorkflowEvent::ActivityFailed { .. } => "ActivityFailed",
            WorkflowEvent::ActivityTimedOut { .. } => "ActivityTimedOut",
            WorkflowEvent::ActivityCancelled { .. } => "ActivityCancelled",
            WorkflowEvent::TimerStarted { .. } => "TimerStarted",
            WorkflowEvent::TimerFired { .. } => "TimerFired",
            WorkflowEvent::TimerCancelled { .. } => "TimerCancelled",
            WorkflowEvent::SignalReceived { .. } => "SignalReceived",
            WorkflowEvent::ChildWorkflowStarted { .. } => "ChildWorkflowStarted",
            WorkflowEvent::ChildWorkflowCompleted { .. } => "ChildWorkflowCompleted",
            WorkflowEvent::ChildWorkflowFailed { .. } => "ChildWorkflowFailed",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_workflow_event_serialization() {
        let event = WorkflowEvent::WorkflowCompleted {
            result: serde_json::json!({"status": "ok"}),
        };

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "workflow_completed");

        let parsed: WorkflowEvent = serde_json::from_value(json).unwrap();
        assert_eq!(event, parsed);
    }

    #[test]
    fn test_history_event_envelope() {
        let event = HistoryEvent::new(
            3,
            Utc::now(),
            WorkflowEvent::TimerFired {
                timer_id: "wait".into(),
            },
        );

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event_id"], 3);
        assert_eq!(json["format_version"], EVENT_FORMAT_VERSION);
        assert_eq!(json["event"]["type"], "timer_fired");
    }

    #[test]
    fn test_started_defaults() {
        let json = serde_json::json!({
            "type": "workflow_started",
            "workflow_type": "w",
            "input": null,
            "task_queue": "default"
        });
        let parsed: WorkflowEvent = serde_json::from_value(json).unwrap();
        match parsed {
            WorkflowEvent::WorkflowStarted { attempt, parent, .. } => {
                assert_eq!(attempt, 1);
                assert!(parent.is_none());
            }
            _ => panic!("Expected WorkflowStarted"),
        }
    }

    #[test]
    fn test_activity_id_extraction() {
        let event = WorkflowEvent::ActivityStarted {
            activity_id: "step-1".into(),
            attempt: 1,
            worker_id: "worker-1".into(),
        };
        assert_eq!(event.activity_id(), Some("step-1"));

        let event = WorkflowEvent::WorkflowCompleted {
            result: serde_json::json!({}),
        };
        assert_eq!(event.activity_id(), None);
    }

    #[test]
    fn test_command_key_round_trip_with_actions() {
        let action = super::super::WorkflowAction::timer("t1", Duration::from_secs(1));
        let event = WorkflowEvent::TimerStarted {
            timer_id: "t1".into(),
            fire_at: Utc::now(),
            duration: Duration::from_secs(1),
        };
        assert_eq!(action.command_key(), event.command_key());

        let fired = WorkflowEvent::TimerFired {
            timer_id: "t1".into(),
        };
        assert!(fired.command_key().is_none());
    }

    #[test]
    fn test_is_terminal() {
        assert!(WorkflowEvent::WorkflowCompleted {
            result: serde_json::json!({})
        }
        .is_terminal());
        assert!(WorkflowEvent::WorkflowTimedOut.is_terminal());
        assert!(WorkflowEvent::WorkflowTerminated {
            reason: "admin".into()
        }
        .is_terminal());
        assert!(!WorkflowEvent::CancellationRequested {
            reason: "user".into()
        }
        .is_terminal());
    }
}
