use crate::error_handling::enclosing_saga;
use crate::executor::WorkflowExecutor;
use chrono::Utc;
use sagacore::{
    ErrorBehavior, ExecutionEvent, ExecutionPointer, PointerId, PointerStatus, StepError, StepId,
    WorkflowDefinition, WorkflowInstance, WorkflowStatus,
};
use std::time::Instant;

impl WorkflowExecutor {
    /// Saga walk for a failure at `failed_idx`.
    ///
    /// The failing pointer is compensated first, then every completed pointer
    /// in the enclosing saga scope in reverse completion order. The saga
    /// container's own error behavior decides what happens next; outside a
    /// saga the instance is terminated.
    pub(crate) async fn compensate(
        &self,
        instance: &mut WorkflowInstance,
        definition: &WorkflowDefinition,
        failed_idx: usize,
    ) {
        let failed_id = instance.execution_pointers[failed_idx].id;
        let saga_id = enclosing_saga(instance, definition, failed_idx);

        let mut walk = vec![failed_id];
        if let Some(saga_id) = saga_id {
            let mut completed: Vec<(usize, &ExecutionPointer)> = instance
                .execution_pointers
                .iter()
                .enumerate()
                .filter(|(_, p)| {
                    p.id != failed_id
                        && p.status == PointerStatus::Complete
                        && p.scope.contains(&saga_id)
                })
                .collect();
            completed.sort_by(|(ia, a), (ib, b)| b.end_time.cmp(&a.end_time).then(ib.cmp(ia)));
            walk.extend(completed.into_iter().map(|(_, p)| p.id));
        }

        tracing::info!(
            instance = %instance.id,
            failed = %failed_id,
            candidates = walk.len(),
            "Compensating"
        );

        for pointer_id in walk {
            let Some(idx) = instance.pointer_index(pointer_id) else {
                continue;
            };
            let step_id = instance.execution_pointers[idx].step_id;
            let compensation = definition.step(step_id).and_then(|s| s.compensation_step_id);

            match compensation {
                Some(compensation_step_id) => {
                    self.run_compensation(instance, definition, idx, compensation_step_id)
                        .await;
                    let now = Utc::now();
                    if let Some(pointer) = instance.pointer_mut(pointer_id) {
                        pointer.finish(PointerStatus::Compensated, now);
                    }
                    self.event_bus.emit(ExecutionEvent::StepCompensated {
                        instance_id: instance.id,
                        pointer_id,
                        step_id,
                        compensation_step_id,
                        timestamp: now,
                    });
                }
                None if pointer_id == failed_id => {
                    instance.execution_pointers[idx].finish(PointerStatus::Failed, Utc::now());
                }
                None => {}
            }
        }

        let Some(saga_id) = saga_id else {
            if let Some(idx) = instance.pointer_index(failed_id) {
                let status = instance.execution_pointers[idx].status;
                self.terminate_at(instance, idx);
                // keep the compensated marker on the failing pointer
                instance.execution_pointers[idx].status = status;
            }
            return;
        };

        let now = Utc::now();
        for pointer in instance
            .execution_pointers
            .iter_mut()
            .filter(|p| p.status.is_active() && p.scope.contains(&saga_id))
        {
            pointer.finish(PointerStatus::Cancelled, now);
        }

        self.resolve_saga(instance, definition, saga_id);
    }

    /// Run a compensation step and everything it leads to, synchronously:
    /// successors reached through its firing outcomes and, for a container,
    /// its child branches. Each run is kept as an audit pointer. A failure or
    /// a step that cannot finish without waiting is reported and ends the chain.
    async fn run_compensation(
        &self,
        instance: &mut WorkflowInstance,
        definition: &WorkflowDefinition,
        compensated_idx: usize,
        compensation_step_id: StepId,
    ) {
        let mut root = ExecutionPointer::new(compensation_step_id);
        root.step_name = definition.step(compensation_step_id).and_then(|s| s.name.clone());
        root.scope = instance.execution_pointers[compensated_idx].scope.clone();
        root.context_item = instance.execution_pointers[compensated_idx].context_item.clone();

        // the chain owns every pointer pushed from here on
        let chain_start = instance.execution_pointers.len();
        instance.execution_pointers.push(root);

        // guards against cyclic compensation chains
        let mut budget = definition.steps.len().max(1) * 8;

        loop {
            let due: Vec<PointerId> = instance.execution_pointers[chain_start..]
                .iter()
                .filter(|p| matches!(p.status, PointerStatus::Pending | PointerStatus::Running))
                .map(|p| p.id)
                .collect();
            if due.is_empty() {
                return;
            }

            let mut progressed = false;
            for pointer_id in due {
                if budget == 0 {
                    tracing::warn!(
                        instance = %instance.id,
                        step = compensation_step_id,
                        "Compensation chain exceeded its step budget"
                    );
                    cancel_chain(instance, chain_start);
                    return;
                }
                budget -= 1;

                match self.run_chain_step(instance, definition, pointer_id).await {
                    Ok(advanced) => progressed |= advanced,
                    Err(error) => {
                        let step_id = instance
                            .pointer(pointer_id)
                            .map_or(compensation_step_id, |p| p.step_id);
                        self.report_failure(instance, pointer_id, step_id, &error);
                        if let Some(pointer) = instance.pointer_mut(pointer_id) {
                            pointer.finish(PointerStatus::Failed, Utc::now());
                        }
                        cancel_chain(instance, chain_start);
                        return;
                    }
                }
            }

            if !progressed {
                let error = StepError::Suspended(compensation_step_id);
                let root_id = instance.execution_pointers[chain_start].id;
                self.report_failure(instance, root_id, compensation_step_id, &error);
                cancel_chain(instance, chain_start);
                return;
            }
        }
    }

    /// One run of a compensation chain pointer. Returns whether it advanced.
    async fn run_chain_step(
        &self,
        instance: &mut WorkflowInstance,
        definition: &WorkflowDefinition,
        pointer_id: PointerId,
    ) -> Result<bool, StepError> {
        let Some(idx) = instance.pointer_index(pointer_id) else {
            return Ok(false);
        };
        let step_id = instance.execution_pointers[idx].step_id;
        let step = definition.step(step_id).ok_or_else(|| {
            StepError::failed(format!("compensation step {} does not exist", step_id))
        })?;

        let previous_status;
        let previous_state;
        {
            let pointer = &mut instance.execution_pointers[idx];
            previous_status = pointer.status;
            previous_state = pointer.persistence_data.clone();
            pointer.start_time.get_or_insert_with(Utc::now);
            pointer.status = PointerStatus::Running;
        }

        let started = Instant::now();
        let (body, result) = {
            let pointer = &instance.execution_pointers[idx];
            self.invoke_body(instance, definition, step, pointer).await?
        };
        if result.sleep_for.is_some() || result.event.is_some() {
            return Err(StepError::Suspended(step_id));
        }

        let advanced = result.proceed
            || !result.branch_values.is_empty()
            || previous_status != PointerStatus::Running
            || previous_state != result.persistence_data;
        self.apply_result(instance, definition, step, idx, &*body, result, started)?;
        Ok(advanced)
    }

    /// Apply the saga container's own policy once its scope has been compensated.
    fn resolve_saga(
        &self,
        instance: &mut WorkflowInstance,
        definition: &WorkflowDefinition,
        saga_id: PointerId,
    ) {
        let Some(idx) = instance.pointer_index(saga_id) else {
            return;
        };
        let Some(step) = definition.step(instance.execution_pointers[idx].step_id) else {
            return;
        };

        match step.error_behavior.unwrap_or(ErrorBehavior::Compensate) {
            ErrorBehavior::Compensate => {
                instance.execution_pointers[idx].finish(PointerStatus::Compensated, Utc::now());
                self.spawn_successors(instance, definition, step, idx);
            }
            ErrorBehavior::Retry => {
                reset_container(&mut instance.execution_pointers[idx]);
                self.retry_pointer(instance, definition, idx);
            }
            ErrorBehavior::Suspend => {
                reset_container(&mut instance.execution_pointers[idx]);
                self.suspend_at(instance, idx);
            }
            ErrorBehavior::Terminate => self.terminate_at(instance, idx),
        }

        if instance.status == WorkflowStatus::Runnable {
            tracing::debug!(instance = %instance.id, saga = %saga_id, "Saga resolved");
        }
    }
}

/// Forget branch state so the container starts over on its next run.
fn reset_container(pointer: &mut ExecutionPointer) {
    pointer.persistence_data = None;
    pointer.children.clear();
    pointer.end_time = None;
}

/// End a compensation chain, cancelling whatever in it is still active.
fn cancel_chain(instance: &mut WorkflowInstance, chain_start: usize) {
    let now = Utc::now();
    for pointer in instance.execution_pointers[chain_start..]
        .iter_mut()
        .filter(|p| p.status.is_active())
    {
        pointer.finish(PointerStatus::Cancelled, now);
    }
}
