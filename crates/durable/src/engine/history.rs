//! Bookkeeping view derived from a run's history
//!
//! Workflow state lives in workflow code; this view only tracks what the
//! engine itself needs to validate late writers: which activity attempt is
//! current, which timers are still pending and which children are open.

use std::collections::{HashMap, HashSet};

use serde_json::Value;
use uuid::Uuid;

use crate::persistence::InstanceRef;
use crate::workflow::{ActivityOptions, HistoryEvent, WorkflowEvent};

/// Engine-side state of one scheduled activity
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct ActivityState {
    pub activity_type: String,
    pub input: Value,
    pub task_queue: String,
    pub options: ActivityOptions,
    /// Current attempt (1-based)
    pub attempt: u32,
    /// The current attempt was picked up by a worker
    pub started: bool,
    /// Completed, failed terminally, timed out terminally or cancelled
    pub closed: bool,
}

#[derive(Debug, Default)]
pub(crate) struct HistoryView {
    activities: HashMap<String, ActivityState>,
    pending_timers: HashSet<String>,
    open_children: HashMap<String, Uuid>,
    closed: bool,
}

impl HistoryView {
    pub fn from_events(events: &[HistoryEvent]) -> Self {
        let mut view = Self::default();
        for event in events {
            view.apply(&event.event);
        }
        view
    }

    fn apply(&mut self, event: &WorkflowEvent) {
        match event {
            WorkflowEvent::ActivityScheduled {
                activity_id,
                activity_type,
                input,
                task_queue,
                options,
            } => {
                self.activities.insert(
                    activity_id.clone(),
                    ActivityState {
                        activity_type: activity_type.clone(),
                        input: input.clone(),
                        task_queue: task_queue.clone(),
                        options: options.clone(),
                        attempt: 1,
                        started: false,
                        closed: false,
                    },
                );
            }
            WorkflowEvent::ActivityStarted {
                activity_id,
                attempt,
                ..
            } => {
                if let Some(state) = self.open_attempt_mut(activity_id, *attempt) {
                    state.started = true;
                }
            }
            WorkflowEvent::ActivityFailed {
                activity_id,
                attempt,
                will_retry,
                ..
            }
            | WorkflowEvent::ActivityTimedOut {
                activity_id,
                attempt,
                will_retry,
                ..
            } => {
                if let Some(state) = self.open_attempt_mut(activity_id, *attempt) {
                    if *will_retry {
                        state.attempt += 1;
                        state.started = false;
                    } else {
                        state.closed = true;
                    }
                }
            }
            WorkflowEvent::ActivityCompleted { activity_id, .. }
            | WorkflowEvent::ActivityCancelled { activity_id } => {
                if let Some(state) = self.activities.get_mut(activity_id) {
                    state.closed = true;
                }
            }
            WorkflowEvent::TimerStarted { timer_id, .. } => {
                self.pending_timers.insert(timer_id.clone());
            }
            WorkflowEvent::TimerFired { timer_id } | WorkflowEvent::TimerCancelled { timer_id } => {
                self.pending_timers.remove(timer_id);
            }
            WorkflowEvent::ChildWorkflowStarted {
                workflow_id,
                run_id,
                ..
            } => {
                if !run_id.is_nil() {
                    self.open_children.insert(workflow_id.clone(), *run_id);
                }
            }
            WorkflowEvent::ChildWorkflowCompleted { workflow_id, .. }
            | WorkflowEvent::ChildWorkflowFailed { workflow_id, .. } => {
                self.open_children.remove(workflow_id);
            }
            event if event.is_terminal() => self.closed = true,
            _ => {}
        }
    }

    fn open_attempt_mut(&mut self, activity_id: &str, attempt: u32) -> Option<&mut ActivityState> {
        self.activities
            .get_mut(activity_id)
            .filter(|s| !s.closed && s.attempt == attempt)
    }

    pub fn activity(&self, activity_id: &str) -> Option<&ActivityState> {
        self.activities.get(activity_id)
    }

    /// The attempt is the activity's current one and has no outcome yet
    pub fn is_attempt_open(&self, activity_id: &str, attempt: u32) -> bool {
        self.activities
            .get(activity_id)
            .map(|s| !s.closed && s.attempt == attempt)
            .unwrap_or(false)
    }

    pub fn is_timer_pending(&self, timer_id: &str) -> bool {
        self.pending_timers.contains(timer_id)
    }

    pub fn open_children(&self) -> Vec<InstanceRef> {
        let mut children: Vec<InstanceRef> = self
            .open_children
            .iter()
            .map(|(workflow_id, run_id)| InstanceRef::new(workflow_id.clone(), *run_id))
            .collect();
        children.sort();
        children
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}
