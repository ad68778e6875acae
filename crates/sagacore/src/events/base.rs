use crate::{InstanceId, PointerId, StepId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Lifecycle notifications emitted while instances execute.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ExecutionEvent {
    WorkflowStarted {
        instance_id: InstanceId,
        workflow_id: String,
        version: u32,
        timestamp: DateTime<Utc>,
    },
    WorkflowCompleted {
        instance_id: InstanceId,
        timestamp: DateTime<Utc>,
    },
    WorkflowSuspended {
        instance_id: InstanceId,
        timestamp: DateTime<Utc>,
    },
    WorkflowResumed {
        instance_id: InstanceId,
        timestamp: DateTime<Utc>,
    },
    WorkflowTerminated {
        instance_id: InstanceId,
        timestamp: DateTime<Utc>,
    },
    StepStarted {
        instance_id: InstanceId,
        pointer_id: PointerId,
        step_id: StepId,
        step_name: String,
        timestamp: DateTime<Utc>,
    },
    StepCompleted {
        instance_id: InstanceId,
        pointer_id: PointerId,
        step_id: StepId,
        duration_ms: u64,
        timestamp: DateTime<Utc>,
    },
    StepFailed {
        instance_id: InstanceId,
        pointer_id: PointerId,
        step_id: StepId,
        error: String,
        timestamp: DateTime<Utc>,
    },
    StepCompensated {
        instance_id: InstanceId,
        pointer_id: PointerId,
        step_id: StepId,
        compensation_step_id: StepId,
        timestamp: DateTime<Utc>,
    },
    EventPublished {
        name: String,
        key: String,
        timestamp: DateTime<Utc>,
    },
    EventConsumed {
        name: String,
        key: String,
        instance_id: InstanceId,
        pointer_id: PointerId,
        timestamp: DateTime<Utc>,
    },
}

/// Process-local broadcast of [`ExecutionEvent`]s.
pub struct EventBus {
    sender: broadcast::Sender<ExecutionEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ExecutionEvent> {
        self.sender.subscribe()
    }

    /// Fire and forget; having no subscribers is fine.
    pub fn emit(&self, event: ExecutionEvent) {
        if self.sender.send(event).is_err() {
            tracing::trace!("No subscribers for execution event");
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1000)
    }
}
