//! Recording activity attempt outcomes
//!
//! Workers and the timer service both close activity attempts. Both go
//! through [`attempt_outcome_commit`], which only writes when the attempt
//! is still the activity's current open one.

use chrono::Utc;
use serde_json::Value;
use tracing::{debug, warn};

use crate::activity::ActivityError;
use crate::duration;
use crate::persistence::{
    Commit, NewTask, TaskPayload, TimerEntry, TimerPurpose, WorkflowInstance,
};
use crate::reliability::RetryDecision;
use crate::workflow::{TimeoutType, WorkflowEvent};

use super::executor::workflow_task;
use super::history::HistoryView;

/// How an attempt ended
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum AttemptOutcome {
    Completed(Value),
    Failed(ActivityError),
    TimedOut(TimeoutType),
}

/// Commit that records `outcome` for `attempt`, or `None` for a stale attempt
///
/// Failures and timeouts consult the activity's retry policy: a retry
/// enqueues the next attempt after the backoff delay and re-arms its
/// schedule-to-start timeout, anything else wakes the workflow.
pub(crate) fn attempt_outcome_commit(
    info: &WorkflowInstance,
    view: &HistoryView,
    activity_id: &str,
    attempt: u32,
    outcome: &AttemptOutcome,
) -> Option<Commit> {
    if !view.is_attempt_open(activity_id, attempt) {
        debug!(%activity_id, attempt, "attempt already closed, dropping outcome");
        return None;
    }
    let state = view.activity(activity_id)?;

    let mut commit = Commit::default();
    commit.cancelled_timers.push(TimerPurpose::ActivityStartToClose {
        activity_id: activity_id.to_string(),
        attempt,
    });
    commit.cancelled_timers.push(TimerPurpose::ActivityHeartbeat {
        activity_id: activity_id.to_string(),
        attempt,
    });

    let error = match outcome {
        AttemptOutcome::Completed(result) => {
            commit.events.push(WorkflowEvent::ActivityCompleted {
                activity_id: activity_id.to_string(),
                attempt,
                result: result.clone(),
            });
            commit.tasks.push(workflow_task(info));
            return Some(commit);
        }
        AttemptOutcome::Failed(error) => error.clone(),
        AttemptOutcome::TimedOut(timeout_type) => ActivityError::timeout(timeout_type.as_str()),
    };

    let decision = state
        .options
        .retry_policy
        .decide(attempt, error.retryable, error.code.as_deref());
    let (will_retry, attempts_exhausted) = match decision {
        RetryDecision::Retry { delay } => {
            warn!(%activity_id, attempt, ?delay, error = %error, "activity attempt failed, retrying");
            commit.tasks.push(NewTask {
                task_queue: state.task_queue.clone(),
                payload: TaskPayload::Activity {
                    instance: info.id.clone(),
                    activity_id: activity_id.to_string(),
                    activity_type: state.activity_type.clone(),
                    input: state.input.clone(),
                    options: state.options.clone(),
                    attempt: attempt + 1,
                },
                delay,
            });
            // The pickup deadline counts from when the retry becomes visible
            if let Some(timeout) = state.options.schedule_to_start_timeout {
                commit.timers.push(TimerEntry::new(
                    info.id.clone(),
                    duration::add(Utc::now(), delay.saturating_add(timeout)),
                    TimerPurpose::ActivityScheduleToStart {
                        activity_id: activity_id.to_string(),
                    },
                ));
            }
            (true, false)
        }
        RetryDecision::GiveUp { attempts_exhausted } => {
            warn!(%activity_id, attempt, attempts_exhausted, error = %error, "activity failed");
            commit.tasks.push(workflow_task(info));
            (false, attempts_exhausted)
        }
    };

    commit.events.push(match outcome {
        AttemptOutcome::TimedOut(timeout_type) => WorkflowEvent::ActivityTimedOut {
            activity_id: activity_id.to_string(),
            attempt,
            timeout_type: *timeout_type,
            will_retry,
            attempts_exhausted,
        },
        _ => WorkflowEvent::ActivityFailed {
            activity_id: activity_id.to_string(),
            attempt,
            error,
            will_retry,
            attempts_exhausted,
        },
    });
    Some(commit)
}
