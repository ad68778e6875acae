use crate::registry::StepRegistry;
use chrono::{DateTime, Utc};
use sagacore::{
    EventBus, ExecutionEvent, ExecutionPointer, ExecutionResult, PointerId, PointerStatus,
    StepBody, StepError, StepExecutionContext, WorkflowDefinition, WorkflowInstance,
    WorkflowStatus, WorkflowStep,
};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Advances the pointers of one instance. Holds no per-instance state, so a
/// single executor is shared by every worker.
pub struct WorkflowExecutor {
    pub(crate) steps: Arc<StepRegistry>,
    pub(crate) event_bus: Arc<EventBus>,
    max_cycle_rounds: usize,
    pub(crate) max_retries: Option<u32>,
}

/// Summary of one executor cycle over an instance
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub rounds: usize,
    pub steps_executed: usize,
    /// The round cap stopped the cycle while work was still due.
    pub round_limit_hit: bool,
}

impl WorkflowExecutor {
    pub fn new(steps: Arc<StepRegistry>, event_bus: Arc<EventBus>) -> Self {
        Self {
            steps,
            event_bus,
            max_cycle_rounds: 128,
            max_retries: None,
        }
    }

    pub fn with_limits(mut self, max_cycle_rounds: usize, max_retries: Option<u32>) -> Self {
        self.max_cycle_rounds = max_cycle_rounds.max(1);
        self.max_retries = max_retries;
        self
    }

    /// Run every due pointer until nothing further advances, then recompute
    /// the instance status and its next execution time.
    ///
    /// Only the in-memory instance is touched; the caller persists it.
    pub async fn execute(
        &self,
        instance: &mut WorkflowInstance,
        definition: &WorkflowDefinition,
    ) -> CycleReport {
        let mut report = CycleReport::default();

        while instance.status == WorkflowStatus::Runnable {
            let now = Utc::now();
            let due: Vec<PointerId> = instance
                .execution_pointers
                .iter()
                .filter(|p| p.is_due(now))
                .map(|p| p.id)
                .collect();
            if due.is_empty() {
                break;
            }
            if report.rounds == self.max_cycle_rounds {
                report.round_limit_hit = true;
                break;
            }
            report.rounds += 1;

            let mut progressed = false;
            for pointer_id in due {
                // external or policy-driven status changes apply at pointer boundaries
                if instance.status != WorkflowStatus::Runnable {
                    break;
                }
                report.steps_executed += 1;
                progressed |= self.execute_pointer(instance, definition, pointer_id).await;
            }
            if !progressed {
                break;
            }
        }

        self.refresh_status(instance, report.round_limit_hit);
        tracing::debug!(
            instance = %instance.id,
            rounds = report.rounds,
            steps = report.steps_executed,
            status = ?instance.status,
            "Cycle finished"
        );
        report
    }

    /// Returns whether the pointer made progress.
    async fn execute_pointer(
        &self,
        instance: &mut WorkflowInstance,
        definition: &WorkflowDefinition,
        pointer_id: PointerId,
    ) -> bool {
        let Some(idx) = instance.pointer_index(pointer_id) else {
            return false;
        };
        let now = Utc::now();
        // an earlier pointer in this round may have cancelled or parked it
        if !instance.execution_pointers[idx].is_due(now) {
            return false;
        }
        let step_id = instance.execution_pointers[idx].step_id;

        let Some(step) = definition.step(step_id) else {
            let error = StepError::failed(format!(
                "step {} does not exist in {} v{}",
                step_id, definition.id, definition.version
            ));
            self.report_failure(instance, pointer_id, step_id, &error);
            instance.execution_pointers[idx].finish(PointerStatus::Failed, now);
            return true;
        };

        let previous_status;
        let previous_state;
        {
            let pointer = &mut instance.execution_pointers[idx];
            previous_status = pointer.status;
            previous_state = pointer.persistence_data.clone();
            if pointer.start_time.is_none() {
                pointer.start_time = Some(now);
                self.event_bus.emit(ExecutionEvent::StepStarted {
                    instance_id: instance.id,
                    pointer_id,
                    step_id,
                    step_name: step.display_name(),
                    timestamp: now,
                });
            }
            pointer.status = PointerStatus::Running;
            pointer.sleep_until = None;
        }

        tracing::debug!(
            instance = %instance.id,
            pointer = %pointer_id,
            step = %step.display_name(),
            "Executing step"
        );

        let started = Instant::now();
        let invoked = {
            let pointer = &instance.execution_pointers[idx];
            self.invoke_body(instance, definition, step, pointer).await
        };

        let (body, result) = match invoked {
            Ok(invoked) => invoked,
            Err(error) => {
                self.handle_step_error(instance, definition, idx, error).await;
                return true;
            }
        };

        let progressed = result.proceed
            || result.sleep_for.is_some()
            || result.event.is_some()
            || !result.branch_values.is_empty()
            || previous_status != PointerStatus::Running
            || previous_state != result.persistence_data;

        if let Err(error) =
            self.apply_result(instance, definition, step, idx, &*body, result, started)
        {
            self.handle_step_error(instance, definition, idx, error).await;
            return true;
        }
        progressed
    }

    /// Create a fresh body, bind inputs and run it against the instance as it stands.
    pub(crate) async fn invoke_body(
        &self,
        instance: &WorkflowInstance,
        definition: &WorkflowDefinition,
        step: &WorkflowStep,
        pointer: &ExecutionPointer,
    ) -> Result<(Box<dyn StepBody>, ExecutionResult), StepError> {
        let mut body = self.steps.create(&step.body)?;
        for input in &step.inputs {
            input.apply(&mut *body, &instance.data)?;
        }

        let ctx = StepExecutionContext {
            instance_id: instance.id,
            workflow_id: &definition.id,
            step,
            pointer,
            data: &instance.data,
            pointers: &instance.execution_pointers,
        };
        let result = body.run(&ctx).await?;
        Ok((body, result))
    }

    #[allow(clippy::too_many_arguments)]
    pub(crate) fn apply_result(
        &self,
        instance: &mut WorkflowInstance,
        definition: &WorkflowDefinition,
        step: &WorkflowStep,
        idx: usize,
        body: &dyn StepBody,
        result: ExecutionResult,
        started: Instant,
    ) -> Result<(), StepError> {
        let now = Utc::now();

        if result.proceed {
            for output in &step.outputs {
                output.apply(body, &mut instance.data)?;
            }

            let pointer = &mut instance.execution_pointers[idx];
            pointer.outcome_value = result.outcome_value;
            pointer.persistence_data = result.persistence_data;
            pointer.finish(PointerStatus::Complete, now);
            let pointer_id = pointer.id;

            self.event_bus.emit(ExecutionEvent::StepCompleted {
                instance_id: instance.id,
                pointer_id,
                step_id: step.id,
                duration_ms: started.elapsed().as_millis() as u64,
                timestamp: now,
            });
            self.spawn_successors(instance, definition, step, idx);
            return Ok(());
        }

        let pointer = &mut instance.execution_pointers[idx];
        pointer.persistence_data = result.persistence_data;

        if let Some(wait) = result.event {
            tracing::debug!(
                pointer = %pointer.id,
                event = %wait.name,
                key = %wait.key,
                "Waiting for event"
            );
            pointer.status = PointerStatus::WaitingForEvent;
            pointer.event_name = Some(wait.name);
            pointer.event_key = Some(wait.key);
            pointer.effective_date = Some(wait.effective_date);
            pointer.event_published = false;
            pointer.event_data = None;
        } else if let Some(sleep) = result.sleep_for {
            pointer.status = PointerStatus::Sleeping;
            pointer.sleep_until = Some(deadline(now, sleep));
        } else {
            pointer.status = PointerStatus::Running;
        }

        if result.fire_outcomes {
            for output in &step.outputs {
                output.apply(body, &mut instance.data)?;
            }
            instance.execution_pointers[idx].outcome_value = result.outcome_value;
            tracing::debug!(
                instance = %instance.id,
                step = step.id,
                "Firing outcomes, pointer stays active"
            );
            self.spawn_successors(instance, definition, step, idx);
        }

        if !result.branch_values.is_empty() {
            self.spawn_branches(instance, definition, step, idx, result.branch_values);
        }
        Ok(())
    }

    /// One new pointer per firing outcome edge. Edges are independent, so two
    /// edges targeting the same step produce two pointers.
    pub(crate) fn spawn_successors(
        &self,
        instance: &mut WorkflowInstance,
        definition: &WorkflowDefinition,
        step: &WorkflowStep,
        idx: usize,
    ) {
        let parent = &instance.execution_pointers[idx];
        let parent_id = parent.id;
        let scope = parent.scope.clone();
        let item = parent.context_item.clone();
        let emitted = parent.outcome_value.clone();

        let successors: Vec<ExecutionPointer> = step
            .outcomes
            .iter()
            .filter(|outcome| outcome.matches(&instance.data, emitted.as_ref()))
            .map(|outcome| {
                let mut next = ExecutionPointer::new(outcome.next_step);
                next.step_name = definition.step(outcome.next_step).and_then(|s| s.name.clone());
                next.predecessor_id = Some(parent_id);
                next.scope = scope.clone();
                next.context_item = item.clone();
                next
            })
            .collect();

        instance.execution_pointers.extend(successors);
    }

    fn spawn_branches(
        &self,
        instance: &mut WorkflowInstance,
        definition: &WorkflowDefinition,
        step: &WorkflowStep,
        idx: usize,
        values: Vec<Option<serde_json::Value>>,
    ) {
        let parent = &instance.execution_pointers[idx];
        let mut scope = Vec::with_capacity(parent.scope.len() + 1);
        scope.push(parent.id);
        scope.extend(parent.scope.iter().copied());
        let inherited = parent.context_item.clone();

        let mut children = Vec::new();
        for value in values {
            for child_step in &step.children {
                let mut child = ExecutionPointer::new(*child_step);
                child.step_name = definition.step(*child_step).and_then(|s| s.name.clone());
                child.scope = scope.clone();
                child.context_item = match &value {
                    Some(item) => Some(item.clone()),
                    None => inherited.clone(),
                };
                children.push(child);
            }
        }

        tracing::debug!(
            instance = %instance.id,
            step = step.id,
            branches = children.len(),
            "Spawning branches"
        );
        let ids: Vec<PointerId> = children.iter().map(|c| c.id).collect();
        instance.execution_pointers[idx].children.extend(ids);
        instance.execution_pointers.extend(children);
    }

    /// Complete iff no active pointer remains; otherwise schedule the earliest wake time.
    fn refresh_status(&self, instance: &mut WorkflowInstance, round_limit_hit: bool) {
        let now = Utc::now();

        if instance.status != WorkflowStatus::Runnable {
            instance.next_execution = None;
            return;
        }

        if !instance.has_active_pointers() {
            instance.status = WorkflowStatus::Complete;
            instance.complete_time = Some(now);
            instance.next_execution = None;
            tracing::info!(instance = %instance.id, "Workflow completed");
            self.event_bus.emit(ExecutionEvent::WorkflowCompleted {
                instance_id: instance.id,
                timestamp: now,
            });
            return;
        }

        if round_limit_hit {
            instance.next_execution = Some(now);
            return;
        }

        instance.next_execution = instance
            .active_pointers()
            .filter_map(|p| match p.status {
                PointerStatus::Pending | PointerStatus::Sleeping => {
                    Some(p.sleep_until.unwrap_or(now))
                }
                // containers are woken by their branches
                PointerStatus::Running if p.children.is_empty() => {
                    Some(p.sleep_until.unwrap_or(now))
                }
                _ => None,
            })
            .min();
    }
}

/// `now + duration`, saturating on overflow.
pub(crate) fn deadline(now: DateTime<Utc>, duration: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(duration)
        .ok()
        .and_then(|d| now.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}
