use crate::{ExecutionPointer, PointerId, StepError, WorkflowStep};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::any::Any;
use std::time::Duration;
use uuid::Uuid;

/// Upcast to `Any` so bindings can reach the concrete body type.
pub trait AsAny: Any {
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

impl<T: Any> AsAny for T {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Unit of work behind a step.
///
/// A fresh body is produced by its factory for every run; input bindings
/// populate its fields, and anything that must survive across poll cycles
/// goes into [`ExecutionResult::persistence_data`].
#[async_trait]
pub trait StepBody: AsAny + Send {
    async fn run(&mut self, ctx: &StepExecutionContext<'_>) -> Result<ExecutionResult, StepError>;
}

/// Read-only view handed to a step body while it runs.
pub struct StepExecutionContext<'a> {
    pub instance_id: Uuid,
    pub workflow_id: &'a str,
    pub step: &'a WorkflowStep,
    pub pointer: &'a ExecutionPointer,
    pub data: &'a Value,
    pub pointers: &'a [ExecutionPointer],
}

impl<'a> StepExecutionContext<'a> {
    /// State persisted by the previous run of this pointer.
    pub fn persistence_data(&self) -> Option<&'a Value> {
        self.pointer.persistence_data.as_ref()
    }

    /// Current iteration value inside a Foreach (or other branching container).
    pub fn item(&self) -> Option<&'a Value> {
        self.pointer.context_item.as_ref()
    }

    /// A branch is complete when its root and every successor spawned from it are finished.
    pub fn is_branch_complete(&self, root: PointerId) -> bool {
        is_branch_complete(self.pointers, root)
    }

    /// True once every branch spawned by this pointer is complete.
    pub fn children_complete(&self) -> bool {
        self.pointer
            .children
            .iter()
            .all(|child| self.is_branch_complete(*child))
    }
}

pub fn is_branch_complete(pointers: &[ExecutionPointer], root: PointerId) -> bool {
    let Some(pointer) = pointers.iter().find(|p| p.id == root) else {
        return false;
    };
    if !pointer.status.is_finished() {
        return false;
    }
    pointers
        .iter()
        .filter(|p| p.predecessor_id == Some(root))
        .all(|p| is_branch_complete(pointers, p.id))
}

/// Event subscription requested by a body.
#[derive(Debug, Clone, PartialEq)]
pub struct EventWait {
    pub name: String,
    pub key: String,
    pub effective_date: DateTime<Utc>,
}

/// What a body reports back to the executor.
#[derive(Debug, Clone, Default)]
pub struct ExecutionResult {
    /// Step is done: apply outputs and evaluate outcomes.
    pub proceed: bool,
    pub outcome_value: Option<Value>,
    pub persistence_data: Option<Value>,
    pub sleep_for: Option<Duration>,
    /// One entry per branch to spawn. `None` inherits the parent's context item.
    pub branch_values: Vec<Option<Value>>,
    pub event: Option<EventWait>,
    /// Apply outputs and fire outcomes without finishing the pointer.
    pub fire_outcomes: bool,
}

impl ExecutionResult {
    pub fn next() -> Self {
        Self {
            proceed: true,
            ..Self::default()
        }
    }

    pub fn outcome(value: impl Into<Value>) -> Self {
        Self {
            proceed: true,
            outcome_value: Some(value.into()),
            ..Self::default()
        }
    }

    /// Stay active and keep `state` for the next run. `None` clears it.
    pub fn persist(state: Option<Value>) -> Self {
        Self {
            persistence_data: state,
            ..Self::default()
        }
    }

    pub fn sleep(duration: Duration, state: Option<Value>) -> Self {
        Self {
            sleep_for: Some(duration),
            persistence_data: state,
            ..Self::default()
        }
    }

    /// Spawn one child pointer set per value, each bound to its value.
    pub fn branch(values: Vec<Value>, state: Option<Value>) -> Self {
        Self {
            branch_values: values.into_iter().map(Some).collect(),
            persistence_data: state,
            ..Self::default()
        }
    }

    /// Spawn a single child pointer set that keeps the parent's context item.
    pub fn branch_inherit(state: Option<Value>) -> Self {
        Self {
            branch_values: vec![None],
            persistence_data: state,
            ..Self::default()
        }
    }

    /// Route onward through the outcomes, then sleep and run again.
    pub fn tick(duration: Duration, state: Option<Value>) -> Self {
        Self {
            sleep_for: Some(duration),
            persistence_data: state,
            fire_outcomes: true,
            ..Self::default()
        }
    }

    pub fn wait_for_event(
        name: impl Into<String>,
        key: impl Into<String>,
        effective_date: DateTime<Utc>,
    ) -> Self {
        Self {
            event: Some(EventWait {
                name: name.into(),
                key: key.into(),
                effective_date,
            }),
            ..Self::default()
        }
    }
}
