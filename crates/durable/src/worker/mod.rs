//! Workers for task execution
//!
//! This module provides:
//! - [`Worker`] - Polls one task queue and runs workflow and activity tasks
//! - [`ActivityExecutor`] - Runs a single activity attempt under its deadlines
//! - [`PollerConfig`] - Task polling with exponential backoff
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                          Worker                              │
//! │  ┌──────────────────┐  ┌──────────────────┐  ┌───────────┐  │
//! │  │ Workflow poller  │  │ Activity poller  │  │  Timer    │  │
//! │  │ (long poll)      │  │ (long poll)      │  │  service  │  │
//! │  └────────┬─────────┘  └────────┬─────────┘  └───────────┘  │
//! │           ▼                     ▼                            │
//! │  ┌──────────────────┐  ┌──────────────────────────────────┐ │
//! │  │ WorkflowExecutor │  │ ActivityExecutor                 │ │
//! │  │ replay + commit  │  │ heartbeats, timeouts, retries    │ │
//! │  └──────────────────┘  └──────────────────────────────────┘ │
//! │        (each kind bounded by its own semaphore)              │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```ignore
//! use waypoint_durable::worker::{Worker, WorkerConfig};
//!
//! let worker = Worker::new(store, WorkerConfig::new("orders").with_max_concurrent_activities(20));
//! worker.register_workflow::<OrderWorkflow>();
//! worker.register_activity_fn("charge", |_ctx, input| async move {
//!     Ok(json!({"status": "charged", "order": input}))
//! });
//!
//! worker.run().await?;
//! ```

mod activity;
mod poller;
mod pool;

pub use activity::{ActivityExecutor, AttemptReport};
pub use poller::{PollerConfig, PollerError, TaskPoller};
pub use pool::{Worker, WorkerConfig, WorkerError, WorkerStatus};
