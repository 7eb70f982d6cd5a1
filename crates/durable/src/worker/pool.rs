//! Worker: polls task queues and runs workflow and activity tasks
//!
//! Manages concurrent task execution, the embedded timer service and
//! graceful shutdown.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::activity::{ActivityExecutor, AttemptReport};
use super::poller::{PollerConfig, TaskPoller};
use crate::activity::{Activity, ActivityContext, ActivityError, ActivityRegistry};
use crate::client::WorkflowClient;
use crate::engine::{ExecutorConfig, WorkflowExecutor, WorkflowRegistry};
use crate::persistence::{LeasedTask, PollRequest, StoreError, TaskKind, WorkflowEventStore};
use crate::timer::{TimerService, TimerServiceConfig};
use crate::workflow::Workflow;

/// Worker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Unique worker ID (generated if not provided)
    pub worker_id: String,

    /// Task queue this worker polls
    pub task_queue: String,

    /// Maximum concurrently running workflow tasks (at least 1)
    #[serde(deserialize_with = "at_least_one")]
    pub max_concurrent_workflow_tasks: usize,

    /// Maximum concurrently running activity attempts (at least 1)
    #[serde(deserialize_with = "at_least_one")]
    pub max_concurrent_activities: usize,

    /// Lease granted on a claimed workflow task
    #[serde(with = "crate::duration::millis")]
    pub workflow_lease_duration: Duration,

    /// Lease granted on a claimed activity task; renewed while the attempt runs
    #[serde(with = "crate::duration::millis")]
    pub activity_lease_duration: Duration,

    /// How long one poll blocks waiting for a task
    #[serde(with = "crate::duration::millis")]
    pub long_poll_timeout: Duration,

    /// Poller configuration
    pub poller: PollerConfig,

    /// Delay before a failed workflow task (non-determinism, panic) is redelivered
    #[serde(with = "crate::duration::millis")]
    pub workflow_task_retry_delay: Duration,

    /// Graceful shutdown timeout
    #[serde(with = "crate::duration::millis")]
    pub shutdown_timeout: Duration,

    /// Run a timer service inside this worker
    pub run_timer_service: bool,

    /// Timer service configuration
    pub timer: TimerServiceConfig,

    /// Executor limits
    #[serde(skip)]
    pub executor: ExecutorConfig,
}

fn at_least_one<'de, D>(deserializer: D) -> Result<usize, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Ok(usize::deserialize(deserializer)?.max(1))
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: format!("worker-{}", Uuid::now_v7()),
            task_queue: "default".to_string(),
            max_concurrent_workflow_tasks: 10,
            max_concurrent_activities: 10,
            workflow_lease_duration: Duration::from_secs(30),
            activity_lease_duration: Duration::from_secs(60),
            long_poll_timeout: Duration::from_secs(1),
            poller: PollerConfig::default(),
            workflow_task_retry_delay: Duration::from_secs(1),
            shutdown_timeout: Duration::from_secs(30),
            run_timer_service: true,
            timer: TimerServiceConfig::default(),
            executor: ExecutorConfig::default(),
        }
    }
}

impl WorkerConfig {
    /// Create configuration for a task queue
    pub fn new(task_queue: impl Into<String>) -> Self {
        Self {
            task_queue: task_queue.into(),
            ..Default::default()
        }
    }

    /// Create configuration from environment variables
    ///
    /// - `WORKER_ID`: worker id (default: generated)
    /// - `TASK_QUEUE`: task queue to poll (default: "default")
    /// - `MAX_CONCURRENT_WORKFLOW_TASKS`: workflow task slots (default: 10)
    /// - `MAX_CONCURRENT_ACTIVITIES`: activity slots (default: 10)
    /// - `TIMER_TICK_INTERVAL_MS`, `TIMER_BATCH_SIZE`: see [`TimerServiceConfig::from_env`]
    pub fn from_env() -> Self {
        let worker_id = std::env::var("WORKER_ID")
            .unwrap_or_else(|_| format!("worker-{}", Uuid::now_v7()));
        let task_queue = std::env::var("TASK_QUEUE").unwrap_or_else(|_| "default".to_string());
        let max_concurrent_workflow_tasks = std::env::var("MAX_CONCURRENT_WORKFLOW_TASKS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(10);
        let max_concurrent_activities = std::env::var("MAX_CONCURRENT_ACTIVITIES")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(10);

        Self {
            worker_id,
            task_queue,
            max_concurrent_workflow_tasks: max_concurrent_workflow_tasks.max(1),
            max_concurrent_activities: max_concurrent_activities.max(1),
            timer: TimerServiceConfig::from_env(),
            ..Default::default()
        }
    }

    /// Set the worker ID
    pub fn with_worker_id(mut self, id: impl Into<String>) -> Self {
        self.worker_id = id.into();
        self
    }

    /// Set the task queue
    pub fn with_task_queue(mut self, task_queue: impl Into<String>) -> Self {
        self.task_queue = task_queue.into();
        self
    }

    pub fn with_max_concurrent_workflow_tasks(mut self, max: usize) -> Self {
        self.max_concurrent_workflow_tasks = max.max(1);
        self
    }

    pub fn with_max_concurrent_activities(mut self, max: usize) -> Self {
        self.max_concurrent_activities = max.max(1);
        self
    }

    pub fn with_activity_lease_duration(mut self, lease: Duration) -> Self {
        self.activity_lease_duration = lease;
        self
    }

    pub fn with_long_poll_timeout(mut self, timeout: Duration) -> Self {
        self.long_poll_timeout = timeout;
        self
    }

    /// Set poller configuration
    pub fn with_poller(mut self, config: PollerConfig) -> Self {
        self.poller = config;
        self
    }

    pub fn with_workflow_task_retry_delay(mut self, delay: Duration) -> Self {
        self.workflow_task_retry_delay = delay;
        self
    }

    /// Set shutdown timeout
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Enable or disable the embedded timer service
    pub fn with_timer_service(mut self, enabled: bool) -> Self {
        self.run_timer_service = enabled;
        self
    }

    pub fn with_timer_config(mut self, config: TimerServiceConfig) -> Self {
        self.timer = config;
        self
    }

    pub fn with_executor_config(mut self, config: ExecutorConfig) -> Self {
        self.executor = config;
        self
    }
}

/// Worker status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerStatus {
    /// Worker is running and accepting tasks
    Running,
    /// Worker is draining (completing current tasks, not accepting new ones)
    Draining,
    /// Worker has stopped
    Stopped,
}

/// Worker errors
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    /// Store error
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Worker already running
    #[error("worker is already running")]
    AlreadyRunning,

    /// Nothing registered to run
    #[error("no workflows or activities registered")]
    NothingRegistered,

    /// Shutdown timeout
    #[error("graceful shutdown timed out")]
    ShutdownTimeout,
}

/// Worker for one task queue
///
/// # Example
///
/// ```ignore
/// use waypoint_durable::prelude::*;
///
/// let worker = Worker::new(store, WorkerConfig::new("orders"));
/// worker.register_workflow::<OrderWorkflow>();
/// worker.register_activity(ChargeCard);
///
/// worker.start().await?;
/// let client = worker.client();
/// client.start::<OrderWorkflow>("order-1", input, WorkflowOptions::default()).await?;
///
/// // ... later, graceful shutdown
/// worker.shutdown().await?;
/// ```
pub struct Worker<S: WorkflowEventStore> {
    store: Arc<S>,
    config: WorkerConfig,
    workflows: RwLock<WorkflowRegistry>,
    activities: RwLock<ActivityRegistry>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    status: RwLock<WorkerStatus>,
    workflow_slots: Arc<Semaphore>,
    activity_slots: Arc<Semaphore>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl<S: WorkflowEventStore> Worker<S> {
    /// Create a new worker
    pub fn new(store: Arc<S>, mut config: WorkerConfig) -> Self {
        // A semaphore without permits would never run a task
        config.max_concurrent_workflow_tasks = config.max_concurrent_workflow_tasks.max(1);
        config.max_concurrent_activities = config.max_concurrent_activities.max(1);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            store,
            workflow_slots: Arc::new(Semaphore::new(config.max_concurrent_workflow_tasks)),
            activity_slots: Arc::new(Semaphore::new(config.max_concurrent_activities)),
            config,
            workflows: RwLock::new(WorkflowRegistry::new()),
            activities: RwLock::new(ActivityRegistry::new()),
            shutdown_tx,
            shutdown_rx,
            status: RwLock::new(WorkerStatus::Stopped),
            handles: Mutex::new(Vec::new()),
        }
    }

    /// Register a workflow type; takes effect at the next [`start`](Self::start)
    pub fn register_workflow<W: Workflow>(&self) -> &Self {
        self.workflows.write().register::<W>();
        self
    }

    /// Register a typed activity
    pub fn register_activity<A: Activity>(&self, activity: A) -> &Self {
        self.activities.write().register(activity);
        self
    }

    /// Register a JSON closure as activity `activity_type`
    pub fn register_activity_fn<F, Fut>(&self, activity_type: impl Into<String>, f: F) -> &Self
    where
        F: Fn(Arc<ActivityContext>, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, ActivityError>> + Send + 'static,
    {
        self.activities.write().register_fn(activity_type, f);
        self
    }

    /// Client sharing this worker's store and workflow types
    pub fn client(&self) -> WorkflowClient<S> {
        WorkflowClient::with_executor(self.executor())
    }

    /// Get current status
    pub fn status(&self) -> WorkerStatus {
        *self.status.read()
    }

    /// Get the worker ID
    pub fn worker_id(&self) -> &str {
        &self.config.worker_id
    }

    /// Start polling in background tasks
    #[instrument(skip(self), fields(worker_id = %self.config.worker_id))]
    pub async fn start(&self) -> Result<(), WorkerError> {
        {
            let mut status = self.status.write();
            if *status != WorkerStatus::Stopped {
                return Err(WorkerError::AlreadyRunning);
            }
            *status = WorkerStatus::Running;
        }

        let executor = self.executor();
        let workflow_types = executor.registry().workflow_types();
        let activities = Arc::new(self.activities.read().clone());
        let activity_types = activities.activity_types();
        if workflow_types.is_empty() && activity_types.is_empty() && !self.config.run_timer_service {
            *self.status.write() = WorkerStatus::Stopped;
            return Err(WorkerError::NothingRegistered);
        }

        info!(
            worker_id = %self.config.worker_id,
            task_queue = %self.config.task_queue,
            workflow_types = ?workflow_types,
            activity_types = ?activity_types,
            "Starting worker"
        );
        let _ = self.shutdown_tx.send(false);

        let mut handles = self.handles.lock();
        if !workflow_types.is_empty() {
            handles.push(self.start_workflow_loop(executor.clone(), workflow_types));
        }
        if !activity_types.is_empty() {
            let activity_executor = ActivityExecutor::new(
                executor.clone(),
                activities,
                self.config.worker_id.clone(),
                self.config.activity_lease_duration,
            );
            handles.push(self.start_activity_loop(activity_executor, activity_types));
        }
        if self.config.run_timer_service {
            let timers = TimerService::new(executor, self.config.timer.clone());
            let shutdown_rx = self.shutdown_rx.clone();
            handles.push(tokio::spawn(async move { timers.run(shutdown_rx).await }));
        }

        Ok(())
    }

    /// Start, then block until shutdown is requested or Ctrl-C is received
    pub async fn run(&self) -> Result<(), WorkerError> {
        self.start().await?;

        let mut shutdown_rx = self.shutdown_rx.clone();
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                if let Err(e) = result {
                    error!(error = %e, "failed to listen for Ctrl-C");
                }
                info!("Ctrl-C received");
            }
            _ = shutdown_rx.wait_for(|stop| *stop) => {}
        }
        self.shutdown().await
    }

    /// Shutdown the worker gracefully
    ///
    /// Stops polling and waits for running tasks up to the shutdown timeout.
    #[instrument(skip(self), fields(worker_id = %self.config.worker_id))]
    pub async fn shutdown(&self) -> Result<(), WorkerError> {
        {
            let mut status = self.status.write();
            if *status == WorkerStatus::Stopped {
                return Ok(());
            }
            *status = WorkerStatus::Draining;
        }

        info!(worker_id = %self.config.worker_id, "Initiating graceful shutdown");
        let _ = self.shutdown_tx.send(true);

        let handles: Vec<JoinHandle<()>> = self.handles.lock().drain(..).collect();
        for handle in handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "worker loop ended abnormally");
            }
        }

        // Wait for in-flight tasks to complete (with timeout)
        let deadline = tokio::time::Instant::now() + self.config.shutdown_timeout;
        loop {
            let busy = (self.config.max_concurrent_workflow_tasks
                - self.workflow_slots.available_permits())
                + (self.config.max_concurrent_activities - self.activity_slots.available_permits());
            if busy == 0 {
                debug!("All tasks completed");
                break;
            }
            if tokio::time::Instant::now() >= deadline {
                warn!(remaining_tasks = busy, "Shutdown timeout reached");
                *self.status.write() = WorkerStatus::Stopped;
                return Err(WorkerError::ShutdownTimeout);
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        *self.status.write() = WorkerStatus::Stopped;
        info!(worker_id = %self.config.worker_id, "Worker stopped");
        Ok(())
    }

    fn executor(&self) -> WorkflowExecutor<S> {
        WorkflowExecutor::with_config(
            self.store.clone(),
            Arc::new(self.workflows.read().clone()),
            self.config.executor.clone(),
        )
    }

    fn poller(&self, kind: TaskKind, types: Vec<String>, lease_duration: Duration) -> TaskPoller<S> {
        TaskPoller::new(
            self.store.clone(),
            PollRequest {
                task_queue: self.config.task_queue.clone(),
                kind,
                types,
                worker_id: self.config.worker_id.clone(),
                lease_duration,
                long_poll_timeout: self.config.long_poll_timeout,
            },
            self.config.poller.clone(),
            self.shutdown_rx.clone(),
        )
    }

    fn start_workflow_loop(
        &self,
        executor: WorkflowExecutor<S>,
        workflow_types: Vec<String>,
    ) -> JoinHandle<()> {
        let mut poller = self.poller(
            TaskKind::Workflow,
            workflow_types,
            self.config.workflow_lease_duration,
        );
        let slots = self.workflow_slots.clone();
        let retry_delay = self.config.workflow_task_retry_delay;

        tokio::spawn(async move {
            while let Some(task) = next_task(&mut poller, &slots).await {
                let (task, permit) = task;
                let executor = executor.clone();
                tokio::spawn(async move {
                    run_workflow_task(&executor, &task, retry_delay).await;
                    drop(permit);
                });
            }
            debug!("Workflow poll loop exited");
        })
    }

    fn start_activity_loop(
        &self,
        activity_executor: ActivityExecutor<S>,
        activity_types: Vec<String>,
    ) -> JoinHandle<()> {
        let mut poller = self.poller(
            TaskKind::Activity,
            activity_types,
            self.config.activity_lease_duration,
        );
        let slots = self.activity_slots.clone();
        let store = self.store.clone();
        let retry_delay = self.config.workflow_task_retry_delay;

        tokio::spawn(async move {
            while let Some((task, permit)) = next_task(&mut poller, &slots).await {
                let activity_executor = activity_executor.clone();
                let store = store.clone();
                tokio::spawn(async move {
                    match activity_executor.execute(&task).await {
                        Ok(AttemptReport::Recorded) => {}
                        Ok(report) => debug!(task_id = %task.task_id, ?report, "activity task not run"),
                        Err(e) => {
                            error!(task_id = %task.task_id, error = %e, "activity task failed");
                            if let Err(e) = store
                                .fail_task(task.task_id, task.lease_token, &e.to_string(), retry_delay)
                                .await
                            {
                                warn!(task_id = %task.task_id, error = %e, "failed to release task");
                            }
                        }
                    }
                    drop(permit);
                });
            }
            debug!("Activity poll loop exited");
        })
    }
}

/// Wait for a free slot, then poll until a task is claimed; `None` on shutdown
async fn next_task<S: WorkflowEventStore>(
    poller: &mut TaskPoller<S>,
    slots: &Arc<Semaphore>,
) -> Option<(LeasedTask, tokio::sync::OwnedSemaphorePermit)> {
    loop {
        if poller.is_shutdown() {
            return None;
        }
        let permit = slots.clone().acquire_owned().await.ok()?;

        match poller.poll().await {
            Ok(Some(task)) => return Some((task, permit)),
            Ok(None) => {}
            Err(e) => error!(error = %e, "Poll error"),
        }
        drop(permit);

        if poller.wait().await {
            return None;
        }
    }
}

async fn run_workflow_task<S: WorkflowEventStore>(
    executor: &WorkflowExecutor<S>,
    task: &LeasedTask,
    retry_delay: Duration,
) {
    let instance = task.payload.instance();
    let store = executor.store();

    match executor.process_workflow_task(instance).await {
        Ok(result) => {
            debug!(%instance, events = result.events_written, closed = result.closed, "workflow task done");
            if let Err(e) = store.complete_task(task.task_id, task.lease_token).await {
                warn!(task_id = %task.task_id, error = %e, "failed to complete workflow task");
            }
        }
        Err(e) => {
            if e.is_non_determinism() {
                error!(%instance, error = %e, "non-deterministic workflow, task will be retried");
            } else {
                warn!(%instance, error = %e, "workflow task failed");
            }
            if let Err(e) = store
                .fail_task(task.task_id, task.lease_token, &e.to_string(), retry_delay)
                .await
            {
                warn!(task_id = %task.task_id, error = %e, "failed to release workflow task");
            }
        }
    }
}
