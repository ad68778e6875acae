use crate::{StepId, WorkflowDefinition};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

pub type InstanceId = Uuid;
pub type PointerId = Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkflowStatus {
    Runnable,
    Suspended,
    Complete,
    Terminated,
}

impl WorkflowStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, WorkflowStatus::Complete | WorkflowStatus::Terminated)
    }
}

/// One execution of a workflow definition.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkflowInstance {
    pub id: InstanceId,
    pub workflow_definition_id: String,
    pub version: u32,
    pub description: Option<String>,
    pub reference: Option<String>,
    pub data: Value,
    pub status: WorkflowStatus,
    /// When the host should next look at this instance. `None` while it only waits on events.
    pub next_execution: Option<DateTime<Utc>>,
    pub create_time: DateTime<Utc>,
    pub complete_time: Option<DateTime<Utc>>,
    pub locked_by: Option<String>,
    pub locked_until: Option<DateTime<Utc>>,
    /// Optimistic-concurrency token, bumped by every successful persist.
    pub revision: u64,
    pub execution_pointers: Vec<ExecutionPointer>,
    pub execution_errors: Vec<ExecutionErrorRecord>,
}

impl WorkflowInstance {
    /// New runnable instance with a single pending pointer at the initial step.
    pub fn new(definition: &WorkflowDefinition, data: Value) -> Self {
        let now = Utc::now();
        let mut initial = ExecutionPointer::new(definition.initial_step);
        initial.step_name = definition
            .step(definition.initial_step)
            .and_then(|s| s.name.clone());

        Self {
            id: Uuid::new_v4(),
            workflow_definition_id: definition.id.clone(),
            version: definition.version,
            description: definition.description.clone(),
            reference: None,
            data,
            status: WorkflowStatus::Runnable,
            next_execution: Some(now),
            create_time: now,
            complete_time: None,
            locked_by: None,
            locked_until: None,
            revision: 0,
            execution_pointers: vec![initial],
            execution_errors: Vec::new(),
        }
    }

    pub fn pointer(&self, id: PointerId) -> Option<&ExecutionPointer> {
        self.execution_pointers.iter().find(|p| p.id == id)
    }

    pub fn pointer_mut(&mut self, id: PointerId) -> Option<&mut ExecutionPointer> {
        self.execution_pointers.iter_mut().find(|p| p.id == id)
    }

    pub fn pointer_index(&self, id: PointerId) -> Option<usize> {
        self.execution_pointers.iter().position(|p| p.id == id)
    }

    pub fn active_pointers(&self) -> impl Iterator<Item = &ExecutionPointer> {
        self.execution_pointers.iter().filter(|p| p.status.is_active())
    }

    pub fn has_active_pointers(&self) -> bool {
        self.active_pointers().next().is_some()
    }

    /// Whether a valid lease is held at `now`.
    pub fn is_leased(&self, now: DateTime<Utc>) -> bool {
        self.locked_by.is_some() && self.locked_until.is_some_and(|until| until > now)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PointerStatus {
    Pending,
    Running,
    Complete,
    Sleeping,
    WaitingForEvent,
    Suspended,
    Failed,
    Compensated,
    Cancelled,
}

impl PointerStatus {
    pub fn is_active(self) -> bool {
        matches!(
            self,
            PointerStatus::Pending
                | PointerStatus::Running
                | PointerStatus::Sleeping
                | PointerStatus::WaitingForEvent
        )
    }

    pub fn is_finished(self) -> bool {
        matches!(
            self,
            PointerStatus::Complete
                | PointerStatus::Failed
                | PointerStatus::Compensated
                | PointerStatus::Cancelled
        )
    }
}

/// A live (or historic) position of execution in the step graph.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExecutionPointer {
    pub id: PointerId,
    pub step_id: StepId,
    pub step_name: Option<String>,
    pub status: PointerStatus,
    pub persistence_data: Option<Value>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub sleep_until: Option<DateTime<Utc>>,
    pub event_name: Option<String>,
    pub event_key: Option<String>,
    pub effective_date: Option<DateTime<Utc>>,
    pub event_published: bool,
    pub event_data: Option<Value>,
    pub retry_count: u32,
    pub outcome_value: Option<Value>,
    pub context_item: Option<Value>,
    pub predecessor_id: Option<PointerId>,
    /// Enclosing container pointers, innermost first.
    pub scope: Vec<PointerId>,
    pub children: Vec<PointerId>,
}

impl ExecutionPointer {
    pub fn new(step_id: StepId) -> Self {
        Self {
            id: Uuid::new_v4(),
            step_id,
            step_name: None,
            status: PointerStatus::Pending,
            persistence_data: None,
            start_time: None,
            end_time: None,
            sleep_until: None,
            event_name: None,
            event_key: None,
            effective_date: None,
            event_published: false,
            event_data: None,
            retry_count: 0,
            outcome_value: None,
            context_item: None,
            predecessor_id: None,
            scope: Vec::new(),
            children: Vec::new(),
        }
    }

    /// Owning container, if any.
    pub fn parent_pointer_id(&self) -> Option<PointerId> {
        self.scope.first().copied()
    }

    /// Ready to run at `now`. Event waiters become due only once woken (set back to Pending).
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        match self.status {
            PointerStatus::Pending | PointerStatus::Running | PointerStatus::Sleeping => {
                self.sleep_until.map_or(true, |until| until <= now)
            }
            _ => false,
        }
    }

    /// Mark finished with `status`, stamping the end time.
    pub fn finish(&mut self, status: PointerStatus, now: DateTime<Utc>) {
        self.status = status;
        self.end_time = Some(now);
        self.sleep_until = None;
    }
}

/// Audit record of a step failure.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExecutionErrorRecord {
    pub pointer_id: PointerId,
    pub step_id: StepId,
    pub message: String,
    pub time: DateTime<Utc>,
}
