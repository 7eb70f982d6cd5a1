//! Activity attempt execution
//!
//! Runs one leased activity task: records the start, drives the handler
//! under its start-to-close and heartbeat deadlines, keeps the lease alive,
//! then records the outcome and releases the task.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::FutureExt;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::activity::{error_codes, ActivityContext, ActivityError, ActivityRegistry};
use crate::duration;
use crate::engine::{
    attempt_outcome_commit, panic_message, AttemptOutcome, ExecutorError, WorkflowExecutor,
};
use crate::persistence::{
    Commit, InstanceRef, LeasedTask, StoreError, TaskPayload, TimerEntry, TimerPurpose,
    WorkflowEventStore,
};
use crate::workflow::{ActivityOptions, TimeoutType, WorkflowEvent};

/// What happened to a leased activity task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptReport {
    /// The attempt ran and its outcome was recorded
    Recorded,
    /// The attempt was already closed or the run is gone; nothing ran
    Stale,
    /// The lease was lost mid-attempt; another worker owns the task now
    Abandoned,
}

const ATTEMPT_OPEN: u8 = 0;
const ATTEMPT_STARTED: u8 = 1;
const ATTEMPT_STALE: u8 = 2;

/// Executes activity attempts on behalf of a worker
pub struct ActivityExecutor<S: WorkflowEventStore> {
    executor: WorkflowExecutor<S>,
    activities: Arc<ActivityRegistry>,
    worker_id: String,
    lease_duration: Duration,
}

impl<S: WorkflowEventStore> Clone for ActivityExecutor<S> {
    fn clone(&self) -> Self {
        Self {
            executor: self.executor.clone(),
            activities: self.activities.clone(),
            worker_id: self.worker_id.clone(),
            lease_duration: self.lease_duration,
        }
    }
}

impl<S: WorkflowEventStore> ActivityExecutor<S> {
    pub fn new(
        executor: WorkflowExecutor<S>,
        activities: Arc<ActivityRegistry>,
        worker_id: impl Into<String>,
        lease_duration: Duration,
    ) -> Self {
        Self {
            executor,
            activities,
            worker_id: worker_id.into(),
            lease_duration,
        }
    }

    /// Run one leased activity task to completion
    ///
    /// The task is completed in the store unless the lease was lost.
    #[instrument(skip(self, task), fields(task_id = %task.task_id))]
    pub async fn execute(&self, task: &LeasedTask) -> Result<AttemptReport, ExecutorError> {
        let TaskPayload::Activity {
            instance,
            activity_id,
            activity_type,
            input,
            options,
            attempt,
        } = &task.payload
        else {
            warn!("not an activity task");
            self.release(task).await?;
            return Ok(AttemptReport::Stale);
        };
        let attempt = *attempt;

        if !self.record_start(instance, activity_id, attempt, options).await? {
            debug!(%activity_id, attempt, "stale activity task");
            self.release(task).await?;
            return Ok(AttemptReport::Stale);
        }

        info!(
            workflow_id = %instance.workflow_id,
            %activity_id,
            %activity_type,
            attempt,
            "running activity"
        );
        let Some(outcome) = self
            .run_attempt(task, instance, activity_id, activity_type, input.clone(), options, attempt)
            .await
        else {
            warn!(%activity_id, attempt, "lease lost, abandoning attempt");
            return Ok(AttemptReport::Abandoned);
        };

        match self
            .executor
            .update(instance, |info, view| {
                Ok(attempt_outcome_commit(info, view, activity_id, attempt, &outcome))
            })
            .await
        {
            Ok(_) | Err(ExecutorError::WorkflowClosed(_)) => {}
            Err(e) => return Err(e),
        }

        self.release(task).await?;
        Ok(AttemptReport::Recorded)
    }

    /// Record `ActivityStarted` and arm the attempt timers
    ///
    /// Returns false when the attempt is no longer the activity's open one.
    /// A redelivered attempt that already started runs again without a
    /// second start event.
    async fn record_start(
        &self,
        instance: &InstanceRef,
        activity_id: &str,
        attempt: u32,
        options: &ActivityOptions,
    ) -> Result<bool, ExecutorError> {
        let state = AtomicU8::new(ATTEMPT_OPEN);
        let result = self
            .executor
            .update(instance, |_, view| {
                if !view.is_attempt_open(activity_id, attempt) {
                    state.store(ATTEMPT_STALE, Ordering::SeqCst);
                    return Ok(None);
                }
                if view.activity(activity_id).map(|s| s.started).unwrap_or(false) {
                    state.store(ATTEMPT_STARTED, Ordering::SeqCst);
                    return Ok(None);
                }
                state.store(ATTEMPT_OPEN, Ordering::SeqCst);

                let now = Utc::now();
                let mut commit = Commit::events(vec![WorkflowEvent::ActivityStarted {
                    activity_id: activity_id.to_string(),
                    attempt,
                    worker_id: self.worker_id.clone(),
                }]);
                commit
                    .cancelled_timers
                    .push(TimerPurpose::ActivityScheduleToStart {
                        activity_id: activity_id.to_string(),
                    });
                commit.timers.push(TimerEntry::new(
                    instance.clone(),
                    duration::add(now, options.start_to_close_timeout),
                    TimerPurpose::ActivityStartToClose {
                        activity_id: activity_id.to_string(),
                        attempt,
                    },
                ));
                if let Some(timeout) = options.heartbeat_timeout {
                    commit.timers.push(TimerEntry::new(
                        instance.clone(),
                        duration::add(now, timeout),
                        TimerPurpose::ActivityHeartbeat {
                            activity_id: activity_id.to_string(),
                            attempt,
                        },
                    ));
                }
                Ok(Some(commit))
            })
            .await;

        match result {
            Ok(_) => Ok(state.load(Ordering::SeqCst) != ATTEMPT_STALE),
            Err(ExecutorError::WorkflowClosed(_)) => Ok(false),
            Err(ExecutorError::Store(StoreError::InstanceNotFound(_))) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Drive the handler; `None` means the lease was lost
    #[allow(clippy::too_many_arguments)]
    async fn run_attempt(
        &self,
        task: &LeasedTask,
        instance: &InstanceRef,
        activity_id: &str,
        activity_type: &str,
        input: Value,
        options: &ActivityOptions,
        attempt: u32,
    ) -> Option<AttemptOutcome> {
        let Some(handler) = self.activities.get(activity_type) else {
            return Some(AttemptOutcome::Failed(ActivityError::non_retryable(format!(
                "activity type not registered: {}",
                activity_type
            ))));
        };

        let token = CancellationToken::new();
        let (heartbeat_tx, mut heartbeat_rx) = mpsc::channel(16);
        let ctx = Arc::new(
            ActivityContext::new(
                instance.clone(),
                activity_id.to_string(),
                attempt,
                options.retry_policy.maximum_attempts,
            )
            .with_heartbeat(heartbeat_tx)
            .with_cancellation(token.clone()),
        );

        let run = AssertUnwindSafe(handler(ctx.clone(), input)).catch_unwind();
        tokio::pin!(run);
        let start_to_close = tokio::time::sleep(options.start_to_close_timeout);
        tokio::pin!(start_to_close);

        let heartbeat_timeout = options.heartbeat_timeout;
        let far_future = Instant::now() + Duration::from_secs(86_400 * 365);
        let heartbeat_deadline =
            tokio::time::sleep_until(heartbeat_timeout.map(|t| Instant::now() + t).unwrap_or(far_future));
        tokio::pin!(heartbeat_deadline);

        let mut renew = tokio::time::interval((self.lease_duration / 3).max(Duration::from_millis(10)));
        renew.tick().await;

        loop {
            tokio::select! {
                result = &mut run => {
                    return Some(match result {
                        Ok(Ok(value)) => AttemptOutcome::Completed(value),
                        Ok(Err(error)) => AttemptOutcome::Failed(error),
                        Err(panic) => AttemptOutcome::Failed(
                            ActivityError::retryable(format!(
                                "activity panicked: {}",
                                panic_message(&*panic)
                            ))
                            .with_code(error_codes::PANIC),
                        ),
                    });
                }
                _ = &mut start_to_close => {
                    token.cancel();
                    return Some(AttemptOutcome::TimedOut(TimeoutType::StartToClose));
                }
                _ = &mut heartbeat_deadline, if heartbeat_timeout.is_some() => {
                    token.cancel();
                    return Some(AttemptOutcome::TimedOut(TimeoutType::Heartbeat));
                }
                Some(payload) = heartbeat_rx.recv() => {
                    if let Some(timeout) = heartbeat_timeout {
                        heartbeat_deadline.as_mut().reset(Instant::now() + timeout);
                    }
                    self.record_heartbeat(instance, activity_id, attempt, heartbeat_timeout, payload.details, &token)
                        .await;
                    if !self.renew_lease(task, &token).await {
                        return None;
                    }
                }
                _ = renew.tick() => {
                    if !self.renew_lease(task, &token).await {
                        return None;
                    }
                }
            }
        }
    }

    async fn record_heartbeat(
        &self,
        instance: &InstanceRef,
        activity_id: &str,
        attempt: u32,
        heartbeat_timeout: Option<Duration>,
        details: Option<Value>,
        token: &CancellationToken,
    ) {
        let result = self
            .executor
            .update(instance, |_, view| {
                if !view.is_attempt_open(activity_id, attempt) {
                    return Ok(None);
                }
                let mut commit = Commit::events(vec![WorkflowEvent::ActivityHeartbeat {
                    activity_id: activity_id.to_string(),
                    attempt,
                    details: details.clone(),
                }]);
                if let Some(timeout) = heartbeat_timeout {
                    commit.timers.push(TimerEntry::new(
                        instance.clone(),
                        duration::add(Utc::now(), timeout),
                        TimerPurpose::ActivityHeartbeat {
                            activity_id: activity_id.to_string(),
                            attempt,
                        },
                    ));
                }
                Ok(Some(commit))
            })
            .await;

        match result {
            Ok(Some(_)) => {}
            Ok(None) | Err(ExecutorError::WorkflowClosed(_)) => {
                debug!(%activity_id, attempt, "attempt closed, cancelling");
                token.cancel();
            }
            Err(e) => warn!(%activity_id, error = %e, "failed to record heartbeat"),
        }
    }

    /// Extend the lease; false once it is lost
    async fn renew_lease(&self, task: &LeasedTask, token: &CancellationToken) -> bool {
        match self
            .executor
            .store()
            .heartbeat_task(task.task_id, task.lease_token, self.lease_duration)
            .await
        {
            Ok(response) => {
                if response.should_cancel && !token.is_cancelled() {
                    info!(task_id = %task.task_id, "activity cancellation requested");
                    token.cancel();
                }
                true
            }
            Err(StoreError::LeaseLost(_)) | Err(StoreError::TaskNotFound(_)) => {
                token.cancel();
                false
            }
            Err(e) => {
                warn!(task_id = %task.task_id, error = %e, "lease renewal failed");
                true
            }
        }
    }

    async fn release(&self, task: &LeasedTask) -> Result<(), ExecutorError> {
        match self
            .executor
            .store()
            .complete_task(task.task_id, task.lease_token)
            .await
        {
            Ok(()) => Ok(()),
            Err(StoreError::LeaseLost(_)) | Err(StoreError::TaskNotFound(_)) => {
                debug!(task_id = %task.task_id, "task already released");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}
