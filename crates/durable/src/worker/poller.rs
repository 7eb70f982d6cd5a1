//! Task polling with exponential backoff
//!
//! Long-polls the store for one task at a time and backs off after empty
//! polls or store errors.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, trace, warn};

use crate::persistence::{LeasedTask, PollRequest, StoreError, WorkflowEventStore};

/// Polling configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PollerConfig {
    /// Minimum pause between polls (after one found a task)
    #[serde(with = "crate::duration::millis")]
    pub min_interval: Duration,

    /// Maximum pause between polls (when idle)
    #[serde(with = "crate::duration::millis")]
    pub max_interval: Duration,

    /// Backoff multiplier when no tasks found
    pub backoff_multiplier: f64,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            min_interval: Duration::ZERO,
            max_interval: Duration::from_secs(1),
            backoff_multiplier: 2.0,
        }
    }
}

impl PollerConfig {
    /// Create a new poller configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Set minimum poll interval
    pub fn with_min_interval(mut self, interval: Duration) -> Self {
        self.min_interval = interval;
        self
    }

    /// Set maximum poll interval
    pub fn with_max_interval(mut self, interval: Duration) -> Self {
        self.max_interval = interval;
        self
    }

    /// Set backoff multiplier
    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier.max(1.0);
        self
    }
}

/// Task poller with adaptive backoff
///
/// Each poll blocks in the store for up to the request's long-poll timeout.
/// Empty polls and errors grow the pause before the next poll; a claimed
/// task resets it.
pub struct TaskPoller<S: WorkflowEventStore> {
    store: Arc<S>,
    request: PollRequest,
    config: PollerConfig,
    current_interval: Duration,
    shutdown_rx: watch::Receiver<bool>,
}

impl<S: WorkflowEventStore> TaskPoller<S> {
    /// Create a new task poller
    pub fn new(
        store: Arc<S>,
        request: PollRequest,
        config: PollerConfig,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            store,
            request,
            current_interval: config.min_interval,
            config,
            shutdown_rx,
        }
    }

    /// Poll for one task
    ///
    /// Returns `Ok(None)` on an empty poll or when shutdown was requested.
    pub async fn poll(&mut self) -> Result<Option<LeasedTask>, PollerError> {
        if self.is_shutdown() {
            debug!("poller shutdown requested");
            return Ok(None);
        }

        let mut shutdown_rx = self.shutdown_rx.clone();
        let polled = tokio::select! {
            polled = self.store.poll_task(&self.request) => polled,
            _ = shutdown_rx.wait_for(|stop| *stop) => return Ok(None),
        };

        match polled {
            Ok(Some(task)) => {
                self.reset_backoff();
                trace!(
                    task_id = %task.task_id,
                    delivery = task.delivery_count,
                    "claimed task"
                );
                Ok(Some(task))
            }
            Ok(None) => {
                self.increase_backoff();
                Ok(None)
            }
            Err(e) => {
                self.increase_backoff();
                warn!(
                    queue = %self.request.task_queue,
                    interval_ms = self.current_interval.as_millis() as u64,
                    error = %e,
                    "poll failed, backing off"
                );
                Err(PollerError::Store(e))
            }
        }
    }

    /// Wait for the current backoff interval
    ///
    /// Returns true if shutdown was signaled.
    pub async fn wait(&mut self) -> bool {
        if self.current_interval.is_zero() {
            return self.is_shutdown();
        }
        let mut shutdown_rx = self.shutdown_rx.clone();
        tokio::select! {
            _ = tokio::time::sleep(self.current_interval) => self.is_shutdown(),
            _ = shutdown_rx.wait_for(|stop| *stop) => {
                debug!("shutdown signal received during wait");
                true
            }
        }
    }

    /// Get the current poll interval
    pub fn current_interval(&self) -> Duration {
        self.current_interval
    }

    /// Check if shutdown has been requested
    pub fn is_shutdown(&self) -> bool {
        *self.shutdown_rx.borrow()
    }

    fn reset_backoff(&mut self) {
        self.current_interval = self.config.min_interval;
    }

    fn increase_backoff(&mut self) {
        let base = self.current_interval.max(Duration::from_millis(10));
        let next = Duration::from_secs_f64(base.as_secs_f64() * self.config.backoff_multiplier);
        self.current_interval = next.min(self.config.max_interval);
    }
}

/// Poller errors
#[derive(Debug, thiserror::Error)]
pub enum PollerError {
    /// Store error
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}
