//! Workflow executor with replay support
//!
//! The `WorkflowExecutor` is responsible for:
//! - Starting new workflow runs
//! - Running workflow tasks: replay history, then commit the new commands
//!   together with their side effects
//! - Appending externally caused events (signals, cancellation, termination)
//!   under optimistic concurrency
//! - Answering queries with a read-only replay

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::duration;
use crate::persistence::{
    CloseRecord, Commit, InstanceRef, NewInstance, NewTask, Notification, StoreError, TaskPayload,
    TimerEntry, TimerPurpose, WorkflowEventStore, WorkflowInstance, WorkflowStatus,
};
use crate::reliability::RetryDecision;
use crate::workflow::{
    CronError, CronSchedule, FailureKind, WorkflowAction, WorkflowError, WorkflowEvent,
    WorkflowSignal,
};

use super::history::HistoryView;
use super::registry::{RegistryError, WorkflowRegistry};
use super::replay::{ReplayEngine, ReplayError};

/// Error code recorded when a child workflow id is already in use
pub const CHILD_ALREADY_STARTED: &str = "child_already_started";

/// Error code recorded when a child's cron schedule does not parse
pub const INVALID_CRON_SCHEDULE: &str = "invalid_cron_schedule";

/// Error code recorded when a run's input does not decode as its workflow's input type
pub const INVALID_INPUT: &str = "invalid_input";

/// Configuration for the workflow executor
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Maximum events per workflow (for safety)
    pub max_events_per_workflow: usize,

    /// How often a commit is retried after losing an optimistic concurrency race
    pub max_conflict_retries: u32,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_events_per_workflow: 10_000,
            max_conflict_retries: 16,
        }
    }
}

impl ExecutorConfig {
    pub fn with_max_events_per_workflow(mut self, max: usize) -> Self {
        self.max_events_per_workflow = max;
        self
    }

    pub fn with_max_conflict_retries(mut self, retries: u32) -> Self {
        self.max_conflict_retries = retries;
        self
    }
}

/// Errors from executor operations
#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    /// Store error
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Registry error
    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),

    /// Replay failed; the workflow task must be retried
    #[error("replay error: {0}")]
    Replay(#[from] ReplayError),

    /// The run already closed
    #[error("workflow run {0} is closed")]
    WorkflowClosed(InstanceRef),

    /// Too many events
    #[error("workflow {instance} has too many events ({events} > {limit})")]
    TooManyEvents {
        instance: InstanceRef,
        events: usize,
        limit: usize,
    },

    /// Every commit attempt lost a concurrency race
    #[error("gave up on {0} after repeated concurrency conflicts")]
    ConflictRetriesExhausted(InstanceRef),

    /// Query handler rejected the query
    #[error("query failed: {0}")]
    Query(WorkflowError),

    /// Start options carry a cron expression that does not parse
    #[error("invalid cron schedule {expr:?}: {source}")]
    InvalidCronSchedule {
        expr: String,
        #[source]
        source: CronError,
    },

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl ExecutorError {
    /// True when workflow code diverged from history
    pub fn is_non_determinism(&self) -> bool {
        matches!(self, ExecutorError::Replay(ReplayError::NonDeterminism { .. }))
    }
}

/// Result of processing a workflow task
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessResult {
    /// Whether the run is closed
    pub closed: bool,

    /// Number of new events written
    pub events_written: usize,

    /// Number of tasks enqueued
    pub tasks_enqueued: usize,
}

/// Workflow executor
///
/// The executor drives workflow state machines by replaying events and
/// committing the resulting commands. It uses optimistic concurrency
/// control to handle concurrent updates: a commit that loses the race is
/// discarded and rebuilt from the fresh history.
///
/// # Example
///
/// ```ignore
/// use waypoint_durable::prelude::*;
///
/// let store = Arc::new(InMemoryWorkflowEventStore::new());
/// let mut registry = WorkflowRegistry::new();
/// registry.register::<MyWorkflow>();
/// let executor = WorkflowExecutor::new(store, Arc::new(registry));
///
/// let run = executor.start_workflow(NewInstance::new("order-1", "my_workflow", "default", input)).await?;
/// executor.process_workflow_task(&run).await?;
/// ```
pub struct WorkflowExecutor<S: WorkflowEventStore> {
    store: Arc<S>,
    registry: Arc<WorkflowRegistry>,
    replay: ReplayEngine,
    config: ExecutorConfig,
}

impl<S: WorkflowEventStore> Clone for WorkflowExecutor<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            registry: self.registry.clone(),
            replay: self.replay,
            config: self.config.clone(),
        }
    }
}

impl<S: WorkflowEventStore> WorkflowExecutor<S> {
    /// Create a new executor over a store and a set of workflow types
    pub fn new(store: Arc<S>, registry: Arc<WorkflowRegistry>) -> Self {
        Self::with_config(store, registry, ExecutorConfig::default())
    }

    /// Create a new executor with custom config
    pub fn with_config(
        store: Arc<S>,
        registry: Arc<WorkflowRegistry>,
        config: ExecutorConfig,
    ) -> Self {
        Self {
            store,
            registry,
            replay: ReplayEngine::new(),
            config,
        }
    }

    /// Get a reference to the store
    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn registry(&self) -> &WorkflowRegistry {
        &self.registry
    }

    /// Start a new workflow run
    ///
    /// Records `WorkflowStarted` and enqueues the first workflow task. The
    /// workflow type does not need to be registered with this executor, but
    /// a cron schedule in the options must parse.
    #[instrument(skip(self, new), fields(workflow_id = %new.id.workflow_id, workflow_type = %new.workflow_type))]
    pub async fn start_workflow(&self, new: NewInstance) -> Result<InstanceRef, ExecutorError> {
        if let Some(expr) = new.options.cron_schedule.as_deref() {
            CronSchedule::parse(expr).map_err(|source| ExecutorError::InvalidCronSchedule {
                expr: expr.to_string(),
                source,
            })?;
        }
        let instance = new.id.clone();
        self.store.create_instance(new).await?;
        info!(run_id = %instance.run_id, "started workflow");
        Ok(instance)
    }

    /// Run one workflow task: replay history and commit the new commands
    ///
    /// Non-determinism and handler panics surface as `Err` without touching
    /// history, so the task can be retried after a fix is deployed.
    #[instrument(skip(self), fields(workflow_id = %instance.workflow_id, run_id = %instance.run_id))]
    pub async fn process_workflow_task(
        &self,
        instance: &InstanceRef,
    ) -> Result<ProcessResult, ExecutorError> {
        for round in 0..=self.config.max_conflict_retries {
            let info = self.store.get_instance(instance).await?;
            if info.status.is_terminal() {
                debug!(status = %info.status, "workflow already in terminal state");
                return Ok(ProcessResult {
                    closed: true,
                    ..Default::default()
                });
            }

            let history = self.store.read_events(instance, 0).await?;
            if history.len() > self.config.max_events_per_workflow {
                return Err(ExecutorError::TooManyEvents {
                    instance: instance.clone(),
                    events: history.len(),
                    limit: self.config.max_events_per_workflow,
                });
            }

            let outcome = match self.replay.replay(&self.registry, instance, &history) {
                Ok(outcome) => outcome,
                Err(ReplayError::Registry(RegistryError::Deserialization(e))) => {
                    return self.fail_invalid_input(instance, &e).await;
                }
                Err(e) => return Err(e.into()),
            };
            if outcome.closed {
                return Ok(ProcessResult {
                    closed: true,
                    ..Default::default()
                });
            }
            if outcome.new_commands.is_empty() {
                debug!("no new commands");
                return Ok(ProcessResult::default());
            }

            let view = HistoryView::from_events(&history);
            let commit = self
                .build_commit(&info, &view, outcome.new_commands, Utc::now())
                .await?;
            let result = ProcessResult {
                closed: commit.close.is_some(),
                events_written: commit.events.len(),
                tasks_enqueued: commit.tasks.len(),
            };

            match self
                .store
                .commit(instance, history.len() as u64, commit)
                .await
            {
                Ok(version) => {
                    debug!(version, events = result.events_written, "committed workflow task");
                    return Ok(result);
                }
                Err(e) if e.is_conflict() => {
                    warn!(round, error = %e, "workflow task lost a concurrency race, rebuilding");
                }
                Err(StoreError::AlreadyStarted { workflow_id, .. }) => {
                    warn!(%workflow_id, round, "child started concurrently, rebuilding");
                }
                Err(StoreError::InstanceClosed(_)) => {
                    return Ok(ProcessResult {
                        closed: true,
                        ..Default::default()
                    });
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(ExecutorError::ConflictRetriesExhausted(instance.clone()))
    }

    /// Append a signal to a running workflow and schedule a workflow task
    #[instrument(skip(self, signal), fields(workflow_id = %instance.workflow_id, signal = %signal.name))]
    pub async fn signal(
        &self,
        instance: &InstanceRef,
        signal: WorkflowSignal,
    ) -> Result<(), ExecutorError> {
        self.update(instance, |info, _| {
            let mut commit = Commit::events(vec![WorkflowEvent::SignalReceived {
                signal: signal.clone(),
            }]);
            commit.tasks.push(workflow_task(info));
            Ok(Some(commit))
        })
        .await?;
        info!("signal recorded");
        Ok(())
    }

    /// Ask a running workflow to cancel itself at its next decision
    #[instrument(skip(self), fields(workflow_id = %instance.workflow_id))]
    pub async fn request_cancellation(
        &self,
        instance: &InstanceRef,
        reason: &str,
    ) -> Result<(), ExecutorError> {
        self.update(instance, |info, _| {
            let mut commit = Commit::events(vec![WorkflowEvent::CancellationRequested {
                reason: reason.to_string(),
            }]);
            commit.tasks.push(workflow_task(info));
            Ok(Some(commit))
        })
        .await?;
        info!(reason, "cancellation requested");
        Ok(())
    }

    /// Close a run immediately without running workflow code
    #[instrument(skip(self), fields(workflow_id = %instance.workflow_id))]
    pub async fn terminate(&self, instance: &InstanceRef, reason: &str) -> Result<(), ExecutorError> {
        self.update(instance, |info, view| {
            let mut commit = Commit::events(vec![WorkflowEvent::WorkflowTerminated {
                reason: reason.to_string(),
            }]);
            close_run(
                &mut commit,
                info,
                view,
                CloseRecord {
                    status: WorkflowStatus::Terminated,
                    result: None,
                    error: Some(WorkflowError::of_kind(FailureKind::Terminated, reason)),
                },
                None,
            );
            Ok(Some(commit))
        })
        .await?;
        warn!(reason, "workflow terminated");
        Ok(())
    }

    /// Close a run whose execution timeout elapsed
    pub(crate) async fn time_out(&self, instance: &InstanceRef) -> Result<(), ExecutorError> {
        self.update(instance, |info, view| {
            let mut commit = Commit::events(vec![WorkflowEvent::WorkflowTimedOut]);
            close_run(
                &mut commit,
                info,
                view,
                CloseRecord {
                    status: WorkflowStatus::TimedOut,
                    result: None,
                    error: Some(WorkflowError::of_kind(
                        FailureKind::Timeout,
                        "workflow execution timed out",
                    )),
                },
                None,
            );
            Ok(Some(commit))
        })
        .await?;
        warn!(workflow_id = %instance.workflow_id, "workflow timed out");
        Ok(())
    }

    /// Fail a run whose start input cannot be decoded
    ///
    /// No workflow code can run for such a run, so it closes as `Failed`
    /// without consulting its retry policy or cron schedule.
    async fn fail_invalid_input(
        &self,
        instance: &InstanceRef,
        cause: &serde_json::Error,
    ) -> Result<ProcessResult, ExecutorError> {
        let error = WorkflowError::new(format!("workflow input does not decode: {}", cause))
            .with_code(INVALID_INPUT);
        error!(error = %error, "failing workflow with undecodable input");

        let written = self
            .update(instance, |info, view| {
                let mut commit = Commit::events(vec![WorkflowEvent::WorkflowFailed {
                    error: error.clone(),
                }]);
                close_run(
                    &mut commit,
                    info,
                    view,
                    CloseRecord {
                        status: WorkflowStatus::Failed,
                        result: None,
                        error: Some(error.clone()),
                    },
                    None,
                );
                Ok(Some(commit))
            })
            .await;

        match written {
            Ok(_) => Ok(ProcessResult {
                closed: true,
                events_written: 1,
                tasks_enqueued: 0,
            }),
            Err(ExecutorError::WorkflowClosed(_)) => Ok(ProcessResult {
                closed: true,
                ..Default::default()
            }),
            Err(e) => Err(e),
        }
    }

    /// Replay the run and ask its workflow to answer a query
    ///
    /// Never writes to history.
    #[instrument(skip(self, args), fields(workflow_id = %instance.workflow_id))]
    pub async fn query(
        &self,
        instance: &InstanceRef,
        query_name: &str,
        args: &Value,
    ) -> Result<Value, ExecutorError> {
        let history = self.store.read_events(instance, 0).await?;
        let outcome = self.replay.replay(&self.registry, instance, &history)?;
        outcome
            .workflow
            .query(query_name, args)
            .map_err(ExecutorError::Query)
    }

    /// Append events derived from the current history, retrying on conflicts
    ///
    /// `build` sees the run and its history view and returns the commit to
    /// apply, or `None` when there is nothing to write. Closed runs are
    /// reported as [`ExecutorError::WorkflowClosed`].
    pub(crate) async fn update<F>(
        &self,
        instance: &InstanceRef,
        build: F,
    ) -> Result<Option<u64>, ExecutorError>
    where
        F: Fn(&WorkflowInstance, &HistoryView) -> Result<Option<Commit>, ExecutorError>
            + Send
            + Sync,
    {
        for round in 0..=self.config.max_conflict_retries {
            let info = self.store.get_instance(instance).await?;
            if info.status.is_terminal() {
                return Err(ExecutorError::WorkflowClosed(instance.clone()));
            }
            let history = self.store.read_events(instance, 0).await?;
            let view = HistoryView::from_events(&history);

            let Some(commit) = build(&info, &view)? else {
                return Ok(None);
            };

            match self
                .store
                .commit(instance, history.len() as u64, commit)
                .await
            {
                Ok(version) => return Ok(Some(version)),
                Err(e) if e.is_conflict() => {
                    debug!(%instance, round, "append lost a concurrency race, retrying");
                }
                Err(StoreError::InstanceClosed(_)) => {
                    return Err(ExecutorError::WorkflowClosed(instance.clone()))
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(ExecutorError::ConflictRetriesExhausted(instance.clone()))
    }

    // =========================================================================
    // Internal Methods
    // =========================================================================

    /// Translate new commands into one atomic commit
    async fn build_commit(
        &self,
        info: &WorkflowInstance,
        view: &HistoryView,
        commands: Vec<WorkflowAction>,
        now: DateTime<Utc>,
    ) -> Result<Commit, ExecutorError> {
        let instance = &info.id;
        let mut commit = Commit::default();
        // Events that must follow every recorded command of this task
        let mut trailing = Vec::new();
        let mut children_in_commit = HashSet::new();

        for command in commands {
            match command {
                WorkflowAction::ScheduleActivity {
                    activity_id,
                    activity_type,
                    input,
                    options,
                } => {
                    debug!(%activity_id, %activity_type, "scheduling activity");
                    let task_queue = options
                        .task_queue
                        .clone()
                        .unwrap_or_else(|| info.task_queue.clone());

                    commit.events.push(WorkflowEvent::ActivityScheduled {
                        activity_id: activity_id.clone(),
                        activity_type: activity_type.clone(),
                        input: input.clone(),
                        task_queue: task_queue.clone(),
                        options: options.clone(),
                    });
                    if let Some(timeout) = options.schedule_to_start_timeout {
                        commit.timers.push(TimerEntry::new(
                            instance.clone(),
                            duration::add(now, timeout),
                            TimerPurpose::ActivityScheduleToStart {
                                activity_id: activity_id.clone(),
                            },
                        ));
                    }
                    commit.tasks.push(NewTask {
                        task_queue,
                        payload: TaskPayload::Activity {
                            instance: instance.clone(),
                            activity_id,
                            activity_type,
                            input,
                            options,
                            attempt: 1,
                        },
                        delay: std::time::Duration::ZERO,
                    });
                }

                WorkflowAction::StartTimer { timer_id, duration } => {
                    debug!(%timer_id, ?duration, "starting timer");
                    let fire_at = duration::add(now, duration);
                    commit.events.push(WorkflowEvent::TimerStarted {
                        timer_id: timer_id.clone(),
                        fire_at,
                        duration,
                    });
                    commit.timers.push(TimerEntry::new(
                        instance.clone(),
                        fire_at,
                        TimerPurpose::WorkflowTimer { timer_id },
                    ));
                }

                WorkflowAction::CancelTimer { timer_id } => {
                    debug!(%timer_id, "cancelling timer");
                    commit.events.push(WorkflowEvent::TimerCancelled {
                        timer_id: timer_id.clone(),
                    });
                    commit
                        .cancelled_timers
                        .push(TimerPurpose::WorkflowTimer { timer_id });
                }

                WorkflowAction::CancelActivity { activity_id } => {
                    debug!(%activity_id, "cancelling activity");
                    commit.events.push(WorkflowEvent::ActivityCancelled {
                        activity_id: activity_id.clone(),
                    });
                    commit
                        .cancelled_timers
                        .push(TimerPurpose::ActivityScheduleToStart {
                            activity_id: activity_id.clone(),
                        });
                    if let Some(state) = view.activity(&activity_id) {
                        commit
                            .cancelled_timers
                            .push(TimerPurpose::ActivityStartToClose {
                                activity_id: activity_id.clone(),
                                attempt: state.attempt,
                            });
                        commit.cancelled_timers.push(TimerPurpose::ActivityHeartbeat {
                            activity_id: activity_id.clone(),
                            attempt: state.attempt,
                        });
                    }
                    commit.cancelled_activities.push(activity_id);
                }

                WorkflowAction::ScheduleChildWorkflow {
                    workflow_id,
                    workflow_type,
                    input,
                    task_queue,
                    options,
                } => {
                    let rejection = if let Some(Err(e)) =
                        options.cron_schedule.as_deref().map(CronSchedule::parse)
                    {
                        Some(WorkflowError::new(format!("invalid cron schedule: {}", e))
                            .with_code(INVALID_CRON_SCHEDULE))
                    } else if !children_in_commit.insert(workflow_id.clone())
                        || self.is_running(&workflow_id).await?
                    {
                        Some(
                            WorkflowError::new(format!(
                                "workflow {} is already running",
                                workflow_id
                            ))
                            .with_code(CHILD_ALREADY_STARTED),
                        )
                    } else {
                        None
                    };
                    if let Some(error) = rejection {
                        warn!(child = %workflow_id, error = %error, "child workflow not started");
                        commit.events.push(WorkflowEvent::ChildWorkflowStarted {
                            workflow_id: workflow_id.clone(),
                            run_id: Uuid::nil(),
                            workflow_type,
                        });
                        trailing.push(WorkflowEvent::ChildWorkflowFailed {
                            workflow_id: workflow_id.clone(),
                            run_id: Uuid::nil(),
                            error,
                        });
                        continue;
                    }

                    debug!(child = %workflow_id, %workflow_type, "starting child workflow");
                    let child = NewInstance::new(
                        workflow_id.clone(),
                        workflow_type.clone(),
                        task_queue.unwrap_or_else(|| info.task_queue.clone()),
                        input,
                    )
                    .with_options(options)
                    .with_parent(instance.clone());
                    commit.events.push(WorkflowEvent::ChildWorkflowStarted {
                        workflow_id,
                        run_id: child.id.run_id,
                        workflow_type,
                    });
                    commit.new_instances.push(child);
                }

                WorkflowAction::CompleteWorkflow { result } => {
                    info!("completing workflow");
                    commit.events.push(WorkflowEvent::WorkflowCompleted {
                        result: result.clone(),
                    });
                    let next = self.next_run(info, None, now);
                    close_run(
                        &mut commit,
                        info,
                        view,
                        CloseRecord {
                            status: WorkflowStatus::Completed,
                            result: Some(result),
                            error: None,
                        },
                        next,
                    );
                }

                WorkflowAction::FailWorkflow { error } => {
                    error!(error = %error, "failing workflow");
                    commit.events.push(WorkflowEvent::WorkflowFailed {
                        error: error.clone(),
                    });
                    let next = self.next_run(info, Some(&error), now);
                    close_run(
                        &mut commit,
                        info,
                        view,
                        CloseRecord {
                            status: WorkflowStatus::Failed,
                            result: None,
                            error: Some(error),
                        },
                        next,
                    );
                }

                WorkflowAction::CancelWorkflow { reason } => {
                    info!(%reason, "cancelling workflow");
                    commit.events.push(WorkflowEvent::WorkflowCancelled {
                        reason: reason.clone(),
                    });
                    close_run(
                        &mut commit,
                        info,
                        view,
                        CloseRecord {
                            status: WorkflowStatus::Cancelled,
                            result: None,
                            error: Some(WorkflowError::of_kind(FailureKind::Cancelled, reason)),
                        },
                        None,
                    );
                }

                // Consumed by the replay engine
                WorkflowAction::AwaitSignal { .. } | WorkflowAction::AwaitCondition { .. } => {}
            }

            if commit.close.is_some() {
                break;
            }
        }

        if !trailing.is_empty() && commit.close.is_none() {
            commit.events.extend(trailing);
            commit.tasks.push(workflow_task(info));
        }
        Ok(commit)
    }

    async fn is_running(&self, workflow_id: &str) -> Result<bool, ExecutorError> {
        match self.store.current_run(workflow_id).await {
            Ok(run) => Ok(!run.status.is_terminal()),
            Err(StoreError::WorkflowNotFound(_)) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Run that continues this workflow id after it closes: a retry, or the next cron run
    fn next_run(
        &self,
        info: &WorkflowInstance,
        error: Option<&WorkflowError>,
        now: DateTime<Utc>,
    ) -> Option<NewInstance> {
        if let (Some(error), Some(policy)) = (error, info.options.retry_policy.as_ref()) {
            match policy.decide(info.attempt, error.retryable, error.code.as_deref()) {
                RetryDecision::Retry { delay } => {
                    info!(attempt = info.attempt + 1, ?delay, "retrying workflow in a new run");
                    return Some(continuation(info, info.attempt + 1, delay));
                }
                RetryDecision::GiveUp { attempts_exhausted } => {
                    debug!(attempts_exhausted, "workflow retry policy gave up");
                }
            }
        }

        let expr = info.options.cron_schedule.as_deref()?;
        match CronSchedule::parse(expr) {
            Ok(schedule) => {
                let fire_at = schedule.next_after(now)?;
                debug!(%fire_at, "scheduling next cron run");
                Some(continuation(info, 1, duration::until(fire_at, now)))
            }
            Err(e) => {
                warn!(cron = expr, error = %e, "invalid cron schedule, not rescheduling");
                None
            }
        }
    }
}

/// Workflow task for a run
pub(crate) fn workflow_task(info: &WorkflowInstance) -> NewTask {
    NewTask::workflow(&info.task_queue, info.id.clone(), &info.workflow_type)
}

fn continuation(info: &WorkflowInstance, attempt: u32, delay: std::time::Duration) -> NewInstance {
    let mut next = NewInstance::new(
        info.id.workflow_id.clone(),
        info.workflow_type.clone(),
        info.task_queue.clone(),
        info.input.clone(),
    )
    .with_options(info.options.clone())
    .with_attempt(attempt)
    .with_first_task_delay(delay);
    next.parent = info.parent.clone();
    next
}

/// Close side effects shared by every way a run can end
///
/// Open children are asked to cancel. The parent hears about the outcome
/// unless another run of this workflow id continues it.
pub(crate) fn close_run(
    commit: &mut Commit,
    info: &WorkflowInstance,
    view: &HistoryView,
    close: CloseRecord,
    next_run: Option<NewInstance>,
) {
    for child in view.open_children() {
        commit.notifications.push(Notification {
            target: child,
            event: WorkflowEvent::CancellationRequested {
                reason: format!("parent {} closed", info.id.workflow_id),
            },
        });
    }

    match next_run {
        Some(next) => commit.new_instances.push(next),
        None => {
            if let Some(parent) = &info.parent {
                let event = match (close.status, &close.result) {
                    (WorkflowStatus::Completed, result) => WorkflowEvent::ChildWorkflowCompleted {
                        workflow_id: info.id.workflow_id.clone(),
                        run_id: info.id.run_id,
                        result: result.clone().unwrap_or(Value::Null),
                    },
                    _ => WorkflowEvent::ChildWorkflowFailed {
                        workflow_id: info.id.workflow_id.clone(),
                        run_id: info.id.run_id,
                        error: close.error.clone().unwrap_or_else(|| {
                            WorkflowError::of_kind(FailureKind::Infrastructure, "child closed")
                        }),
                    },
                };
                commit.notifications.push(Notification {
                    target: parent.clone(),
                    event,
                });
            }
        }
    }

    commit.close = Some(close);
}
