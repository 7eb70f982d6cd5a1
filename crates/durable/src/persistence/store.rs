//! WorkflowEventStore trait definition

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::workflow::{ActivityOptions, HistoryEvent, WorkflowError, WorkflowEvent, WorkflowOptions};

/// Error type for store operations
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    /// Workflow run not found
    #[error("workflow run not found: {0}")]
    InstanceNotFound(InstanceRef),

    /// No run exists for this workflow id
    #[error("workflow not found: {0}")]
    WorkflowNotFound(String),

    /// A run with this workflow id is still open
    #[error("workflow already started: {workflow_id} (run {run_id})")]
    AlreadyStarted { workflow_id: String, run_id: Uuid },

    /// Concurrency conflict (optimistic locking failed)
    #[error("concurrency conflict: expected version {expected}, found {actual}")]
    ConcurrencyConflict { expected: u64, actual: u64 },

    /// The run has a close event; history is frozen
    #[error("workflow run is closed: {0}")]
    InstanceClosed(InstanceRef),

    /// Task not found
    #[error("task not found: {0}")]
    TaskNotFound(Uuid),

    /// The caller's lease expired or was granted to another worker
    #[error("lease lost for task {0}")]
    LeaseLost(Uuid),

    /// Backend unavailable
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl StoreError {
    /// True for optimistic concurrency failures that a re-read resolves
    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::ConcurrencyConflict { .. })
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Serialization(err.to_string())
    }
}

/// Identity of one workflow run
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct InstanceRef {
    pub workflow_id: String,
    pub run_id: Uuid,
}

impl InstanceRef {
    pub fn new(workflow_id: impl Into<String>, run_id: Uuid) -> Self {
        Self {
            workflow_id: workflow_id.into(),
            run_id,
        }
    }
}

impl fmt::Display for InstanceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.workflow_id, self.run_id)
    }
}

/// Workflow status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    /// Workflow is running
    Running,

    /// Workflow completed successfully
    Completed,

    /// Workflow failed
    Failed,

    /// Workflow was cancelled
    Cancelled,

    /// Workflow exceeded its execution timeout
    TimedOut,

    /// Workflow was terminated
    Terminated,
}

impl WorkflowStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running)
    }
}

impl fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::TimedOut => write!(f, "timed_out"),
            Self::Terminated => write!(f, "terminated"),
        }
    }
}

/// Stored record of a workflow run
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkflowInstance {
    pub id: InstanceRef,
    pub workflow_type: String,
    pub task_queue: String,
    pub status: WorkflowStatus,
    pub input: Value,
    pub result: Option<Value>,
    pub error: Option<WorkflowError>,
    /// Run attempt (workflow retries increment it)
    pub attempt: u32,
    /// Non-owning reference to the parent run, for result routing and cancellation
    pub parent: Option<InstanceRef>,
    pub options: WorkflowOptions,
    pub start_time: DateTime<Utc>,
    pub close_time: Option<DateTime<Utc>>,
    /// Number of events in history (the current version)
    pub history_length: u64,
    /// Run started after this one closed (retry or cron)
    pub next_run_id: Option<Uuid>,
}

/// Request to create a run
#[derive(Debug, Clone, PartialEq)]
pub struct NewInstance {
    pub id: InstanceRef,
    pub workflow_type: String,
    pub task_queue: String,
    pub input: Value,
    pub attempt: u32,
    pub parent: Option<InstanceRef>,
    pub options: WorkflowOptions,
    /// Delay before the first workflow task becomes visible (cron, retry backoff)
    pub first_task_delay: Duration,
}

impl NewInstance {
    pub fn new(
        workflow_id: impl Into<String>,
        workflow_type: impl Into<String>,
        task_queue: impl Into<String>,
        input: Value,
    ) -> Self {
        Self {
            id: InstanceRef::new(workflow_id, Uuid::now_v7()),
            workflow_type: workflow_type.into(),
            task_queue: task_queue.into(),
            input,
            attempt: 1,
            parent: None,
            options: WorkflowOptions::default(),
            first_task_delay: Duration::ZERO,
        }
    }

    pub fn with_options(mut self, options: WorkflowOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_parent(mut self, parent: InstanceRef) -> Self {
        self.parent = Some(parent);
        self
    }

    pub fn with_attempt(mut self, attempt: u32) -> Self {
        self.attempt = attempt;
        self
    }

    pub fn with_first_task_delay(mut self, delay: Duration) -> Self {
        self.first_task_delay = delay;
        self
    }

    /// The `WorkflowStarted` event that opens this run's history
    pub fn started_event(&self) -> WorkflowEvent {
        WorkflowEvent::WorkflowStarted {
            workflow_type: self.workflow_type.clone(),
            input: self.input.clone(),
            task_queue: self.task_queue.clone(),
            attempt: self.attempt,
            parent: self.parent.clone(),
            options: self.options.clone(),
        }
    }
}

/// Final state written when a run closes
#[derive(Debug, Clone, PartialEq)]
pub struct CloseRecord {
    pub status: WorkflowStatus,
    pub result: Option<Value>,
    pub error: Option<WorkflowError>,
}

/// Event appended to another run as part of a commit
///
/// Used for child results flowing to the parent and cancellation flowing to
/// children. Targets that are closed or missing are skipped.
#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub target: InstanceRef,
    pub event: WorkflowEvent,
}

/// Which queue of a task queue a task lives in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    Workflow,
    Activity,
}

/// Work handed to workers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TaskPayload {
    /// New history is available for this run
    Workflow {
        instance: InstanceRef,
        workflow_type: String,
    },

    /// One attempt of an activity
    Activity {
        instance: InstanceRef,
        activity_id: String,
        activity_type: String,
        input: Value,
        options: ActivityOptions,
        attempt: u32,
    },
}

impl TaskPayload {
    pub fn kind(&self) -> TaskKind {
        match self {
            TaskPayload::Workflow { .. } => TaskKind::Workflow,
            TaskPayload::Activity { .. } => TaskKind::Activity,
        }
    }

    pub fn instance(&self) -> &InstanceRef {
        match self {
            TaskPayload::Workflow { instance, .. } | TaskPayload::Activity { instance, .. } => {
                instance
            }
        }
    }

    /// Workflow or activity type, used for poll filtering
    pub fn type_name(&self) -> &str {
        match self {
            TaskPayload::Workflow { workflow_type, .. } => workflow_type,
            TaskPayload::Activity { activity_type, .. } => activity_type,
        }
    }
}

/// Definition of a task to be enqueued
#[derive(Debug, Clone, PartialEq)]
pub struct NewTask {
    pub task_queue: String,
    pub payload: TaskPayload,
    /// Delay before the task becomes visible to pollers
    pub delay: Duration,
}

impl NewTask {
    pub fn workflow(task_queue: impl Into<String>, instance: InstanceRef, workflow_type: impl Into<String>) -> Self {
        Self {
            task_queue: task_queue.into(),
            payload: TaskPayload::Workflow {
                instance,
                workflow_type: workflow_type.into(),
            },
            delay: Duration::ZERO,
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

/// Poll parameters
#[derive(Debug, Clone)]
pub struct PollRequest {
    pub task_queue: String,
    pub kind: TaskKind,
    /// Only claim tasks whose workflow/activity type is listed
    pub types: Vec<String>,
    pub worker_id: String,
    pub lease_duration: Duration,
    /// How long to block waiting for a task; zero polls once
    pub long_poll_timeout: Duration,
}

/// A task claimed under an exclusive lease
#[derive(Debug, Clone)]
pub struct LeasedTask {
    pub task_id: Uuid,
    pub lease_token: Uuid,
    pub task_queue: String,
    pub payload: TaskPayload,
    /// How many times this task has been handed out, including this one
    pub delivery_count: u32,
    pub lease_expires_at: DateTime<Utc>,
}

/// Response from task heartbeat
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeartbeatResponse {
    /// Whether the lease was extended
    pub accepted: bool,
    /// Whether the activity should stop (cancelled by its workflow or the run closed)
    pub should_cancel: bool,
}

/// Why a timer exists
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "purpose", rename_all = "snake_case")]
pub enum TimerPurpose {
    /// `StartTimer` command (including condition timeouts)
    WorkflowTimer { timer_id: String },

    /// Activity was not picked up in time
    ActivityScheduleToStart { activity_id: String },

    /// Attempt ran too long
    ActivityStartToClose { activity_id: String, attempt: u32 },

    /// Attempt stopped heartbeating
    ActivityHeartbeat { activity_id: String, attempt: u32 },

    /// Run exceeded its execution timeout
    WorkflowExecutionTimeout,
}

/// A durable timer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimerEntry {
    pub instance: InstanceRef,
    pub fire_at: DateTime<Utc>,
    pub purpose: TimerPurpose,
}

impl TimerEntry {
    pub fn new(instance: InstanceRef, fire_at: DateTime<Utc>, purpose: TimerPurpose) -> Self {
        Self {
            instance,
            fire_at,
            purpose,
        }
    }
}

/// Events plus their side effects, applied atomically
///
/// Either every part of a commit becomes visible or none does, so a
/// recorded `ActivityScheduled` always has its queued task and a recorded
/// `TimerStarted` always has its timer.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Commit {
    pub events: Vec<WorkflowEvent>,
    pub tasks: Vec<NewTask>,
    /// Timers to schedule; an existing timer with the same purpose is replaced
    pub timers: Vec<TimerEntry>,
    pub cancelled_timers: Vec<TimerPurpose>,
    /// Activities of this run whose queued tasks are removed and leases flagged
    pub cancelled_activities: Vec<String>,
    pub new_instances: Vec<NewInstance>,
    pub notifications: Vec<Notification>,
    pub close: Option<CloseRecord>,
}

impl Commit {
    pub fn events(events: Vec<WorkflowEvent>) -> Self {
        Self {
            events,
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
            && self.tasks.is_empty()
            && self.timers.is_empty()
            && self.cancelled_timers.is_empty()
            && self.cancelled_activities.is_empty()
            && self.new_instances.is_empty()
            && self.notifications.is_empty()
            && self.close.is_none()
    }
}

/// Durable storage for workflow runs, history, task queues and timers
///
/// Implementations must make [`commit`](Self::commit) atomic and
/// linearizable per run: it succeeds only when `expected_version` equals the
/// run's current history length.
#[async_trait]
pub trait WorkflowEventStore: Send + Sync + 'static {
    // =========================================================================
    // Workflow Operations
    // =========================================================================

    /// Create a run: records `WorkflowStarted`, enqueues its first workflow
    /// task and arms the execution timeout, if any
    async fn create_instance(&self, instance: NewInstance) -> Result<(), StoreError>;

    /// Load a run
    async fn get_instance(&self, instance: &InstanceRef) -> Result<WorkflowInstance, StoreError>;

    /// Latest run for a workflow id
    async fn current_run(&self, workflow_id: &str) -> Result<WorkflowInstance, StoreError>;

    // =========================================================================
    // Event Operations
    // =========================================================================

    /// Events with `event_id > from_version`, in order
    async fn read_events(
        &self,
        instance: &InstanceRef,
        from_version: u64,
    ) -> Result<Vec<HistoryEvent>, StoreError>;

    /// Current history length
    async fn history_version(&self, instance: &InstanceRef) -> Result<u64, StoreError>;

    /// Append events and apply side effects atomically
    ///
    /// Returns the new version. Fails with `ConcurrencyConflict` when the
    /// run advanced past `expected_version`, and with `InstanceClosed` once
    /// the run has closed.
    async fn commit(
        &self,
        instance: &InstanceRef,
        expected_version: u64,
        commit: Commit,
    ) -> Result<u64, StoreError>;

    /// Append events with no side effects
    async fn append_events(
        &self,
        instance: &InstanceRef,
        expected_version: u64,
        events: Vec<WorkflowEvent>,
    ) -> Result<u64, StoreError> {
        self.commit(instance, expected_version, Commit::events(events))
            .await
    }

    // =========================================================================
    // Task Queue Operations
    // =========================================================================

    /// Enqueue a task; returns `None` when a pending workflow task for the
    /// same run already exists
    async fn enqueue_task(&self, task: NewTask) -> Result<Option<Uuid>, StoreError>;

    /// Claim the oldest visible matching task, waiting up to the long-poll timeout
    async fn poll_task(&self, request: &PollRequest) -> Result<Option<LeasedTask>, StoreError>;

    /// Remove a finished task
    async fn complete_task(&self, task_id: Uuid, lease_token: Uuid) -> Result<(), StoreError>;

    /// Release a task so it is redelivered after `retry_after`
    async fn fail_task(
        &self,
        task_id: Uuid,
        lease_token: Uuid,
        reason: &str,
        retry_after: Duration,
    ) -> Result<(), StoreError>;

    /// Extend a lease
    async fn heartbeat_task(
        &self,
        task_id: Uuid,
        lease_token: Uuid,
        extension: Duration,
    ) -> Result<HeartbeatResponse, StoreError>;

    // =========================================================================
    // Timer Operations
    // =========================================================================

    /// Remove and return up to `limit` timers due at `now`, earliest first
    async fn pop_due_timers(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<TimerEntry>, StoreError>;

    /// Schedule (or replace) a timer outside of a commit
    async fn schedule_timer(&self, timer: TimerEntry) -> Result<(), StoreError>;

    /// Earliest pending fire time
    async fn next_timer_at(&self) -> Result<Option<DateTime<Utc>>, StoreError>;
}
