//! Persistence layer for durable execution
//!
//! This module provides:
//! - [`WorkflowEventStore`] trait for run, history, task queue and timer storage
//! - [`InMemoryWorkflowEventStore`], the reference backend

mod memory;
mod store;

pub use memory::InMemoryWorkflowEventStore;
pub use store::{
    CloseRecord, Commit, HeartbeatResponse, InstanceRef, LeasedTask, NewInstance, NewTask,
    Notification, PollRequest, StoreError, TaskKind, TaskPayload, TimerEntry, TimerPurpose,
    WorkflowEventStore, WorkflowInstance, WorkflowStatus,
};
