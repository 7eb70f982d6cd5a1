//! Workflow registry for type-erased workflow creation
//!
//! The registry allows registering workflow factories that create workflow
//! instances from JSON input without knowing the concrete type at runtime.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde_json::Value;

use crate::activity::ActivityError;
use crate::workflow::{
    ConditionOutcome, Workflow, WorkflowContext, WorkflowError, WorkflowSignal, WorkflowStep,
};

/// Type-erased workflow interface
///
/// This trait allows the engine to work with workflows without knowing
/// their concrete types. All method parameters and return values are JSON.
pub trait AnyWorkflow: Send + Sync {
    /// Get the workflow type identifier
    fn workflow_type(&self) -> &'static str;

    fn on_start(&mut self, ctx: &WorkflowContext) -> WorkflowStep;

    fn on_activity_completed(
        &mut self,
        ctx: &WorkflowContext,
        activity_id: &str,
        result: Value,
    ) -> WorkflowStep;

    fn on_activity_failed(
        &mut self,
        ctx: &WorkflowContext,
        activity_id: &str,
        error: &ActivityError,
    ) -> WorkflowStep;

    fn on_timer_fired(&mut self, ctx: &WorkflowContext, timer_id: &str) -> WorkflowStep;

    fn handles_signal(&self, signal_name: &str) -> bool;

    fn on_signal(&mut self, ctx: &WorkflowContext, signal: &WorkflowSignal) -> WorkflowStep;

    fn check_condition(&self, condition_id: &str) -> bool;

    fn on_condition(
        &mut self,
        ctx: &WorkflowContext,
        condition_id: &str,
        outcome: ConditionOutcome,
    ) -> WorkflowStep;

    fn on_child_completed(
        &mut self,
        ctx: &WorkflowContext,
        workflow_id: &str,
        result: Value,
    ) -> WorkflowStep;

    fn on_child_failed(
        &mut self,
        ctx: &WorkflowContext,
        workflow_id: &str,
        error: &WorkflowError,
    ) -> WorkflowStep;

    fn on_cancel_requested(&mut self, ctx: &WorkflowContext, reason: &str) -> WorkflowStep;

    fn query(&self, query_name: &str, args: &Value) -> Result<Value, WorkflowError>;
}

/// Wrapper to implement AnyWorkflow for any Workflow
struct WorkflowWrapper<W: Workflow> {
    inner: W,
}

impl<W: Workflow> AnyWorkflow for WorkflowWrapper<W> {
    fn workflow_type(&self) -> &'static str {
        W::TYPE
    }

    fn on_start(&mut self, ctx: &WorkflowContext) -> WorkflowStep {
        self.inner.on_start(ctx)
    }

    fn on_activity_completed(
        &mut self,
        ctx: &WorkflowContext,
        activity_id: &str,
        result: Value,
    ) -> WorkflowStep {
        self.inner.on_activity_completed(ctx, activity_id, result)
    }

    fn on_activity_failed(
        &mut self,
        ctx: &WorkflowContext,
        activity_id: &str,
        error: &ActivityError,
    ) -> WorkflowStep {
        self.inner.on_activity_failed(ctx, activity_id, error)
    }

    fn on_timer_fired(&mut self, ctx: &WorkflowContext, timer_id: &str) -> WorkflowStep {
        self.inner.on_timer_fired(ctx, timer_id)
    }

    fn handles_signal(&self, signal_name: &str) -> bool {
        self.inner.handles_signal(signal_name)
    }

    fn on_signal(&mut self, ctx: &WorkflowContext, signal: &WorkflowSignal) -> WorkflowStep {
        self.inner.on_signal(ctx, signal)
    }

    fn check_condition(&self, condition_id: &str) -> bool {
        self.inner.check_condition(condition_id)
    }

    fn on_condition(
        &mut self,
        ctx: &WorkflowContext,
        condition_id: &str,
        outcome: ConditionOutcome,
    ) -> WorkflowStep {
        self.inner.on_condition(ctx, condition_id, outcome)
    }

    fn on_child_completed(
        &mut self,
        ctx: &WorkflowContext,
        workflow_id: &str,
        result: Value,
    ) -> WorkflowStep {
        self.inner.on_child_completed(ctx, workflow_id, result)
    }

    fn on_child_failed(
        &mut self,
        ctx: &WorkflowContext,
        workflow_id: &str,
        error: &WorkflowError,
    ) -> WorkflowStep {
        self.inner.on_child_failed(ctx, workflow_id, error)
    }

    fn on_cancel_requested(&mut self, ctx: &WorkflowContext, reason: &str) -> WorkflowStep {
        self.inner.on_cancel_requested(ctx, reason)
    }

    fn query(&self, query_name: &str, args: &Value) -> Result<Value, WorkflowError> {
        self.inner.query(query_name, args)
    }
}

/// Factory function type for creating workflows from JSON input
pub type WorkflowFactory =
    Arc<dyn Fn(Value) -> Result<Box<dyn AnyWorkflow>, serde_json::Error> + Send + Sync>;

/// Registry of workflow factories
///
/// The registry maps workflow type names to factory functions that create
/// workflow instances from JSON input.
#[derive(Clone)]
pub struct WorkflowRegistry {
    factories: HashMap<String, WorkflowFactory>,
}

impl Default for WorkflowRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkflowRegistry {
    /// Create a new empty registry
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Register a workflow type
    ///
    /// # Example
    ///
    /// ```ignore
    /// let mut registry = WorkflowRegistry::new();
    /// registry.register::<MyWorkflow>();
    /// ```
    pub fn register<W: Workflow>(&mut self) {
        let factory: WorkflowFactory = Arc::new(|input: Value| {
            let typed_input: W::Input = serde_json::from_value(input)?;
            let workflow = W::new(typed_input);
            Ok(Box::new(WorkflowWrapper { inner: workflow }) as Box<dyn AnyWorkflow>)
        });

        self.factories.insert(W::TYPE.to_string(), factory);
    }

    /// Check if a workflow type is registered
    pub fn contains(&self, workflow_type: &str) -> bool {
        self.factories.contains_key(workflow_type)
    }

    /// Create a workflow instance from type name and JSON input
    pub fn create(
        &self,
        workflow_type: &str,
        input: Value,
    ) -> Result<Box<dyn AnyWorkflow>, RegistryError> {
        let factory = self
            .factories
            .get(workflow_type)
            .ok_or_else(|| RegistryError::UnknownWorkflowType(workflow_type.to_string()))?;

        factory(input).map_err(RegistryError::Deserialization)
    }

    /// Get the number of registered workflow types
    pub fn len(&self) -> usize {
        self.factories.len()
    }

    /// Check if registry is empty
    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }

    /// Get all registered workflow type names, sorted
    pub fn workflow_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.factories.keys().cloned().collect();
        types.sort();
        types
    }
}

impl fmt::Debug for WorkflowRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkflowRegistry")
            .field("workflow_types", &self.workflow_types())
            .finish()
    }
}

/// Errors from registry operations
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// Workflow type not registered
    #[error("unknown workflow type: {0}")]
    UnknownWorkflowType(String),

    /// Failed to deserialize workflow input
    #[error("failed to deserialize workflow input: {0}")]
    Deserialization(#[source] serde_json::Error),
}
