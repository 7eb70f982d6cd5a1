//! Workflow client
//!
//! The entry point for code outside workflows: start runs, send signals,
//! run queries, wait for results and manage run lifecycles. Every call is
//! addressed by workflow id and acts on the id's current run.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, instrument};
use uuid::Uuid;

use crate::engine::{ExecutorError, WorkflowExecutor, WorkflowRegistry};
use crate::persistence::{
    InstanceRef, NewInstance, StoreError, WorkflowEventStore, WorkflowInstance, WorkflowStatus,
};
use crate::workflow::{
    FailureKind, HistoryEvent, Workflow, WorkflowError, WorkflowOptions, WorkflowSignal,
};

/// Client configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClientConfig {
    /// Task queue used by [`WorkflowClient::start`]
    pub default_task_queue: String,

    /// How often `get_workflow_result` re-reads a running workflow
    #[serde(with = "crate::duration::millis")]
    pub result_poll_interval: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            default_task_queue: "default".to_string(),
            result_poll_interval: Duration::from_millis(25),
        }
    }
}

impl ClientConfig {
    pub fn with_default_task_queue(mut self, task_queue: impl Into<String>) -> Self {
        self.default_task_queue = task_queue.into();
        self
    }

    pub fn with_result_poll_interval(mut self, interval: Duration) -> Self {
        self.result_poll_interval = interval;
        self
    }
}

/// Client errors
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// No run exists for this workflow id
    #[error("workflow not found: {0}")]
    WorkflowNotFound(String),

    /// A run with this id is still open
    #[error("workflow already started: {0}")]
    AlreadyStarted(String),

    /// The current run is closed
    #[error("workflow is closed: {0}")]
    WorkflowClosed(String),

    /// The workflow closed without completing
    #[error("workflow failed: {0}")]
    WorkflowFailed(WorkflowError),

    /// The workflow was still running when the wait ran out
    #[error("timed out waiting for workflow {0}")]
    ResultTimeout(String),

    /// A start argument was rejected before anything was recorded
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Queries need the workflow types; see [`WorkflowClient::with_registry`]
    #[error("workflow type not registered with this client: {0}")]
    UnknownWorkflowType(String),

    /// Store error
    #[error("store error: {0}")]
    Store(StoreError),

    /// Executor error
    #[error("executor error: {0}")]
    Executor(ExecutorError),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<StoreError> for ClientError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::WorkflowNotFound(id) => ClientError::WorkflowNotFound(id),
            StoreError::AlreadyStarted { workflow_id, .. } => {
                ClientError::AlreadyStarted(workflow_id)
            }
            StoreError::InstanceClosed(instance) => {
                ClientError::WorkflowClosed(instance.workflow_id)
            }
            other => ClientError::Store(other),
        }
    }
}

impl From<ExecutorError> for ClientError {
    fn from(err: ExecutorError) -> Self {
        match err {
            ExecutorError::Store(e) => e.into(),
            ExecutorError::WorkflowClosed(instance) => {
                ClientError::WorkflowClosed(instance.workflow_id)
            }
            ExecutorError::Query(e) => ClientError::WorkflowFailed(e),
            e @ ExecutorError::InvalidCronSchedule { .. } => {
                ClientError::InvalidArgument(e.to_string())
            }
            other => ClientError::Executor(other),
        }
    }
}

/// Snapshot of a workflow's current run
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkflowDescription {
    pub workflow_id: String,
    pub run_id: Uuid,
    pub workflow_type: String,
    pub status: WorkflowStatus,
    pub start_time: DateTime<Utc>,
    pub close_time: Option<DateTime<Utc>>,
    pub task_queue: String,
    pub history_length: u64,
    pub attempt: u32,
}

impl From<WorkflowInstance> for WorkflowDescription {
    fn from(run: WorkflowInstance) -> Self {
        Self {
            workflow_id: run.id.workflow_id,
            run_id: run.id.run_id,
            workflow_type: run.workflow_type,
            status: run.status,
            start_time: run.start_time,
            close_time: run.close_time,
            task_queue: run.task_queue,
            history_length: run.history_length,
            attempt: run.attempt,
        }
    }
}

/// Client for starting and interacting with workflows
///
/// # Example
///
/// ```ignore
/// let client = WorkflowClient::new(store).with_registry(registry);
/// client.start_workflow("order", json!({"id": 7}), "order-7", "default", WorkflowOptions::default()).await?;
/// client.signal_workflow("order-7", "approve", json!(true)).await?;
/// let result = client.get_workflow_result("order-7", Duration::from_secs(30)).await?;
/// ```
pub struct WorkflowClient<S: WorkflowEventStore> {
    executor: WorkflowExecutor<S>,
    config: ClientConfig,
}

impl<S: WorkflowEventStore> Clone for WorkflowClient<S> {
    fn clone(&self) -> Self {
        Self {
            executor: self.executor.clone(),
            config: self.config.clone(),
        }
    }
}

impl<S: WorkflowEventStore> WorkflowClient<S> {
    /// Client without workflow types; every call except queries works
    pub fn new(store: Arc<S>) -> Self {
        Self::with_executor(WorkflowExecutor::new(store, Arc::new(WorkflowRegistry::new())))
    }

    pub(crate) fn with_executor(executor: WorkflowExecutor<S>) -> Self {
        Self {
            executor,
            config: ClientConfig::default(),
        }
    }

    /// Use `registry` to replay workflows for queries
    pub fn with_registry(self, registry: Arc<WorkflowRegistry>) -> Self {
        let store = self.executor.store().clone();
        Self {
            executor: WorkflowExecutor::new(store, registry),
            config: self.config,
        }
    }

    pub fn with_config(mut self, config: ClientConfig) -> Self {
        self.config = config;
        self
    }

    /// Start a workflow run; returns the new run id
    #[instrument(skip(self, input, options), fields(%workflow_id, %workflow_type))]
    pub async fn start_workflow(
        &self,
        workflow_type: &str,
        input: Value,
        workflow_id: &str,
        task_queue: &str,
        options: WorkflowOptions,
    ) -> Result<Uuid, ClientError> {
        let new = NewInstance::new(workflow_id, workflow_type, task_queue, input).with_options(options);
        let instance = self.executor.start_workflow(new).await?;
        Ok(instance.run_id)
    }

    /// Start a typed workflow on the default task queue
    pub async fn start<W: Workflow>(
        &self,
        workflow_id: &str,
        input: W::Input,
        options: WorkflowOptions,
    ) -> Result<Uuid, ClientError> {
        let input = serde_json::to_value(input)?;
        self.start_workflow(W::TYPE, input, workflow_id, &self.config.default_task_queue, options)
            .await
    }

    /// Deliver a signal to the current run
    ///
    /// The signal is recorded even if the workflow does not wait for it yet.
    #[instrument(skip(self, payload))]
    pub async fn signal_workflow(
        &self,
        workflow_id: &str,
        signal_name: &str,
        payload: Value,
    ) -> Result<(), ClientError> {
        let run = self.current_run(workflow_id).await?;
        self.executor
            .signal(&run.id, WorkflowSignal::new(signal_name, payload))
            .await?;
        Ok(())
    }

    /// Answer a query from the current run's replayed state
    #[instrument(skip(self, args))]
    pub async fn query_workflow(
        &self,
        workflow_id: &str,
        query_name: &str,
        args: Value,
    ) -> Result<Value, ClientError> {
        let run = self.current_run(workflow_id).await?;
        if !self.executor.registry().contains(&run.workflow_type) {
            return Err(ClientError::UnknownWorkflowType(run.workflow_type));
        }
        Ok(self.executor.query(&run.id, query_name, &args).await?)
    }

    /// Result of the current run, waiting up to `wait` for it to close
    ///
    /// Runs that failed and were retried are followed to their final run.
    pub async fn get_workflow_result(
        &self,
        workflow_id: &str,
        wait: Duration,
    ) -> Result<Value, ClientError> {
        let run = self.current_run(workflow_id).await?;
        self.get_run_result(&run.id, wait).await
    }

    /// Result of one run, following retry runs
    pub async fn get_run_result(
        &self,
        instance: &InstanceRef,
        wait: Duration,
    ) -> Result<Value, ClientError> {
        let deadline = tokio::time::Instant::now() + wait;
        let mut current = instance.clone();

        loop {
            let run = self.executor.store().get_instance(&current).await?;
            match (run.status, run.next_run_id) {
                (WorkflowStatus::Running, _) => {
                    if tokio::time::Instant::now() >= deadline {
                        return Err(ClientError::ResultTimeout(current.workflow_id));
                    }
                    tokio::time::sleep(self.config.result_poll_interval).await;
                }
                (WorkflowStatus::Completed, _) => return Ok(run.result.unwrap_or(Value::Null)),
                (_, Some(next_run_id)) => {
                    debug!(%next_run_id, "following retry run");
                    current = InstanceRef::new(current.workflow_id, next_run_id);
                }
                (status, None) => {
                    let error = run.error.unwrap_or_else(|| {
                        WorkflowError::of_kind(
                            FailureKind::Infrastructure,
                            format!("workflow closed as {}", status),
                        )
                    });
                    return Err(ClientError::WorkflowFailed(error));
                }
            }
        }
    }

    /// Describe the current run
    pub async fn describe_workflow(
        &self,
        workflow_id: &str,
    ) -> Result<WorkflowDescription, ClientError> {
        Ok(self.current_run(workflow_id).await?.into())
    }

    /// Close the current run immediately without running workflow code
    #[instrument(skip(self))]
    pub async fn terminate_workflow(&self, workflow_id: &str, reason: &str) -> Result<(), ClientError> {
        let run = self.current_run(workflow_id).await?;
        self.executor.terminate(&run.id, reason).await?;
        info!(%workflow_id, reason, "terminated workflow");
        Ok(())
    }

    /// Ask the current run to cancel at its next decision
    #[instrument(skip(self))]
    pub async fn cancel_workflow(&self, workflow_id: &str, reason: &str) -> Result<(), ClientError> {
        let run = self.current_run(workflow_id).await?;
        self.executor.request_cancellation(&run.id, reason).await?;
        Ok(())
    }

    /// History of the current run
    pub async fn get_history(&self, workflow_id: &str) -> Result<Vec<HistoryEvent>, ClientError> {
        let run = self.current_run(workflow_id).await?;
        Ok(self.executor.store().read_events(&run.id, 0).await?)
    }

    async fn current_run(&self, workflow_id: &str) -> Result<WorkflowInstance, ClientError> {
        Ok(self.executor.store().current_run(workflow_id).await?)
    }
}
