use crate::executor::{deadline, WorkflowExecutor};
use chrono::Utc;
use sagacore::{
    ErrorBehavior, ExecutionErrorRecord, ExecutionEvent, PointerId, PointerStatus, StepError,
    StepId, WorkflowDefinition, WorkflowInstance, WorkflowStatus,
};

impl WorkflowExecutor {
    /// Route a failed step through its error policy. Never propagates.
    pub(crate) async fn handle_step_error(
        &self,
        instance: &mut WorkflowInstance,
        definition: &WorkflowDefinition,
        idx: usize,
        error: StepError,
    ) {
        let pointer_id = instance.execution_pointers[idx].id;
        let step_id = instance.execution_pointers[idx].step_id;
        self.report_failure(instance, pointer_id, step_id, &error);

        let behavior = self.effective_behavior(instance, definition, idx);
        tracing::debug!(
            instance = %instance.id,
            step = step_id,
            behavior = ?behavior,
            "Applying error behavior"
        );

        match behavior {
            ErrorBehavior::Retry => self.retry_pointer(instance, definition, idx),
            ErrorBehavior::Suspend => self.suspend_at(instance, idx),
            ErrorBehavior::Terminate => self.terminate_at(instance, idx),
            ErrorBehavior::Compensate => self.compensate(instance, definition, idx).await,
        }
    }

    /// Step setting, else Compensate inside a saga, else the definition default.
    fn effective_behavior(
        &self,
        instance: &WorkflowInstance,
        definition: &WorkflowDefinition,
        idx: usize,
    ) -> ErrorBehavior {
        let pointer = &instance.execution_pointers[idx];
        if let Some(behavior) = definition.step(pointer.step_id).and_then(|s| s.error_behavior) {
            return behavior;
        }
        if enclosing_saga(instance, definition, idx).is_some() {
            return ErrorBehavior::Compensate;
        }
        definition.default_error_behavior
    }

    /// Record, log and broadcast a step failure.
    pub(crate) fn report_failure(
        &self,
        instance: &mut WorkflowInstance,
        pointer_id: PointerId,
        step_id: StepId,
        error: &StepError,
    ) {
        let now = Utc::now();
        tracing::warn!(
            instance = %instance.id,
            pointer = %pointer_id,
            step = step_id,
            error = %error,
            "Step failed"
        );
        instance.execution_errors.push(ExecutionErrorRecord {
            pointer_id,
            step_id,
            message: error.to_string(),
            time: now,
        });
        self.event_bus.emit(ExecutionEvent::StepFailed {
            instance_id: instance.id,
            pointer_id,
            step_id,
            error: error.to_string(),
            timestamp: now,
        });
    }

    /// Back to Pending after the retry interval. Exceeding the host's retry
    /// cap is reported and suspends the instance.
    pub(crate) fn retry_pointer(
        &self,
        instance: &mut WorkflowInstance,
        definition: &WorkflowDefinition,
        idx: usize,
    ) {
        let now = Utc::now();
        let interval = definition
            .step(instance.execution_pointers[idx].step_id)
            .and_then(|s| s.retry_interval)
            .unwrap_or(definition.default_error_retry_interval);

        let pointer = &mut instance.execution_pointers[idx];
        pointer.retry_count += 1;
        let retries = pointer.retry_count;
        let step_id = pointer.step_id;

        if self.max_retries.is_some_and(|max| retries > max) {
            tracing::error!(
                instance = %instance.id,
                step = step_id,
                retries = retries - 1,
                "Retry limit exceeded, suspending instance"
            );
            self.suspend_at(instance, idx);
            return;
        }

        let pointer = &mut instance.execution_pointers[idx];
        pointer.status = PointerStatus::Pending;
        pointer.sleep_until = Some(deadline(now, interval));
    }

    pub(crate) fn suspend_at(&self, instance: &mut WorkflowInstance, idx: usize) {
        let now = Utc::now();
        instance.execution_pointers[idx].status = PointerStatus::Suspended;
        instance.status = WorkflowStatus::Suspended;
        tracing::info!(instance = %instance.id, "Workflow suspended");
        self.event_bus.emit(ExecutionEvent::WorkflowSuspended {
            instance_id: instance.id,
            timestamp: now,
        });
    }

    /// Terminal for the instance; other pointers stay as they are for audit.
    pub(crate) fn terminate_at(&self, instance: &mut WorkflowInstance, idx: usize) {
        let now = Utc::now();
        instance.execution_pointers[idx].finish(PointerStatus::Failed, now);
        instance.status = WorkflowStatus::Terminated;
        instance.complete_time = Some(now);
        tracing::info!(instance = %instance.id, "Workflow terminated");
        self.event_bus.emit(ExecutionEvent::WorkflowTerminated {
            instance_id: instance.id,
            timestamp: now,
        });
    }
}

/// Innermost saga container enclosing the pointer at `idx`.
pub(crate) fn enclosing_saga(
    instance: &WorkflowInstance,
    definition: &WorkflowDefinition,
    idx: usize,
) -> Option<PointerId> {
    instance.execution_pointers[idx]
        .scope
        .iter()
        .copied()
        .find(|scope_id| {
            instance
                .pointer(*scope_id)
                .and_then(|p| definition.step(p.step_id))
                .is_some_and(|s| s.saga)
        })
}
