//! # Durable Workflow Execution
//!
//! An event-sourced workflow engine for long-running, multi-step processes
//! that must survive process restarts.
//!
//! ## Features
//!
//! - **Event-sourced workflows**: every state change is an event in an append-only history; workflows are rebuilt by replay
//! - **Deterministic replay**: recorded commands are matched against re-executed workflow code, divergence is detected
//! - **Automatic retries**: configurable activity and workflow retry policies with exponential backoff and jitter
//! - **Leased task queues**: at-least-once delivery of workflow and activity tasks with long polling
//! - **Durable timers, signals, queries and child workflows**
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │              WorkflowClient          Worker                  │
//! │  (start, signal, query, result)  (polls, runs tasks)         │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │     WorkflowExecutor / ReplayEngine   ActivityExecutor       │
//! │  (replays history, commits commands)  (attempts, retries)    │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   WorkflowEventStore                         │
//! │  (history, task queues, timer heap; atomic commits)         │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use waypoint_durable::prelude::*;
//!
//! struct Doubler {
//!     input: i64,
//! }
//!
//! impl Workflow for Doubler {
//!     const TYPE: &'static str = "doubler";
//!     type Input = i64;
//!     type Output = i64;
//!
//!     fn new(input: i64) -> Self {
//!         Self { input }
//!     }
//!
//!     fn on_start(&mut self, _ctx: &WorkflowContext) -> WorkflowStep {
//!         Ok(vec![WorkflowAction::schedule_activity("double", "double", json!(self.input))])
//!     }
//!
//!     fn on_activity_completed(&mut self, _ctx: &WorkflowContext, _id: &str, result: Value) -> WorkflowStep {
//!         Ok(vec![WorkflowAction::complete(result)])
//!     }
//! }
//!
//! let store = Arc::new(InMemoryWorkflowEventStore::new());
//! let worker = Worker::new(store, WorkerConfig::default());
//! worker.register_workflow::<Doubler>();
//! worker.register_activity_fn("double", |_ctx, input| async move {
//!     Ok(json!(input.as_i64().unwrap_or(0) * 2))
//! });
//! worker.start().await?;
//!
//! let client = worker.client();
//! client.start::<Doubler>("doubler-1", 5, WorkflowOptions::default()).await?;
//! let result = client.get_workflow_result("doubler-1", Duration::from_secs(5)).await?;
//! ```

pub mod activity;
pub mod client;
pub mod engine;
pub mod persistence;
pub mod reliability;
pub mod telemetry;
pub mod timer;
pub mod worker;
pub mod workflow;

mod duration;

/// Prelude for common imports
pub mod prelude {
    pub use crate::activity::{Activity, ActivityContext, ActivityError};
    pub use crate::client::{ClientConfig, ClientError, WorkflowClient, WorkflowDescription};
    pub use crate::engine::{ExecutorConfig, ExecutorError, WorkflowExecutor, WorkflowRegistry};
    pub use crate::persistence::{
        InMemoryWorkflowEventStore, InstanceRef, StoreError, WorkflowEventStore, WorkflowStatus,
    };
    pub use crate::reliability::RetryPolicy;
    pub use crate::worker::{Worker, WorkerConfig, WorkerError};
    pub use crate::workflow::{
        ActivityOptions, ConditionOutcome, FailureKind, FanIn, Workflow, WorkflowAction,
        WorkflowContext, WorkflowError, WorkflowEvent, WorkflowOptions, WorkflowSignal,
        WorkflowStep,
    };
    pub use async_trait::async_trait;
    pub use serde_json::{json, Value};
    pub use std::sync::Arc;
    pub use std::time::Duration;
}

// Re-export key types at crate root
pub use activity::{Activity, ActivityContext, ActivityError};
pub use client::{ClientConfig, ClientError, WorkflowClient, WorkflowDescription};
pub use engine::{ExecutorConfig, ExecutorError, WorkflowExecutor, WorkflowRegistry};
pub use persistence::{InMemoryWorkflowEventStore, StoreError, WorkflowEventStore, WorkflowStatus};
pub use reliability::RetryPolicy;
pub use timer::{TimerService, TimerServiceConfig};
pub use worker::{Worker, WorkerConfig, WorkerError};
pub use workflow::{
    ActivityOptions, Workflow, WorkflowAction, WorkflowError, WorkflowEvent, WorkflowOptions,
    WorkflowSignal,
};
