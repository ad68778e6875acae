use async_trait::async_trait;
use sagacore::{ExecutionResult, StepBody, StepError, StepExecutionContext, StepId, WorkflowStep};
use serde_json::{json, Value};

pub const SEQUENCE: &str = "control.sequence";
pub const IF: &str = "control.if";
pub const WHILE: &str = "control.while";
pub const FOREACH: &str = "control.foreach";
pub const PARALLEL: &str = "control.parallel";
pub const SAGA: &str = "control.saga";

/// Persisted container state: whether a child generation is in flight.
fn children_active(ctx: &StepExecutionContext<'_>) -> bool {
    ctx.persistence_data()
        .and_then(|state| state.get("children_active"))
        .and_then(Value::as_bool)
        .unwrap_or(false)
}

fn active_state() -> Option<Value> {
    Some(json!({ "children_active": true }))
}

/// Spawn the children once, then wait for every branch to finish.
fn run_block(ctx: &StepExecutionContext<'_>) -> ExecutionResult {
    if !children_active(ctx) {
        return ExecutionResult::branch_inherit(active_state());
    }
    if ctx.children_complete() {
        ExecutionResult::next()
    } else {
        ExecutionResult::persist(active_state())
    }
}

/// Runs its child chain once, then proceeds.
#[derive(Debug, Default)]
pub struct Sequence;

#[async_trait]
impl StepBody for Sequence {
    async fn run(&mut self, ctx: &StepExecutionContext<'_>) -> Result<ExecutionResult, StepError> {
        Ok(run_block(ctx))
    }
}

/// Starts every child branch at once and joins on all of them.
#[derive(Debug, Default)]
pub struct Parallel;

#[async_trait]
impl StepBody for Parallel {
    async fn run(&mut self, ctx: &StepExecutionContext<'_>) -> Result<ExecutionResult, StepError> {
        Ok(run_block(ctx))
    }
}

/// Sequence whose failures compensate everything completed inside it.
#[derive(Debug, Default)]
pub struct Saga;

#[async_trait]
impl StepBody for Saga {
    async fn run(&mut self, ctx: &StepExecutionContext<'_>) -> Result<ExecutionResult, StepError> {
        Ok(run_block(ctx))
    }
}

/// Runs its children once when `condition` holds at first evaluation.
#[derive(Debug, Default)]
pub struct If {
    pub condition: bool,
}

#[async_trait]
impl StepBody for If {
    async fn run(&mut self, ctx: &StepExecutionContext<'_>) -> Result<ExecutionResult, StepError> {
        if !children_active(ctx) && !self.condition {
            return Ok(ExecutionResult::next());
        }
        Ok(run_block(ctx))
    }
}

/// Re-runs its children for as long as `condition` holds, checked before
/// each iteration.
#[derive(Debug, Default)]
pub struct While {
    pub condition: bool,
}

#[async_trait]
impl StepBody for While {
    async fn run(&mut self, ctx: &StepExecutionContext<'_>) -> Result<ExecutionResult, StepError> {
        if children_active(ctx) && !ctx.children_complete() {
            return Ok(ExecutionResult::persist(active_state()));
        }
        if self.condition {
            tracing::trace!(pointer = %ctx.pointer.id, "While: next iteration");
            Ok(ExecutionResult::branch_inherit(active_state()))
        } else {
            Ok(ExecutionResult::next())
        }
    }
}

/// Runs its children once per collection item, exposing the item as the
/// branch's context item. Parallel by default; sequential runs one item at
/// a time in collection order.
#[derive(Debug)]
pub struct Foreach {
    pub collection: Vec<Value>,
    pub parallel: bool,
}

impl Default for Foreach {
    fn default() -> Self {
        Self {
            collection: Vec::new(),
            parallel: true,
        }
    }
}

#[async_trait]
impl StepBody for Foreach {
    async fn run(&mut self, ctx: &StepExecutionContext<'_>) -> Result<ExecutionResult, StepError> {
        let active = children_active(ctx);
        if active && !ctx.children_complete() {
            return Ok(ExecutionResult::persist(ctx.persistence_data().cloned()));
        }

        if self.parallel {
            if active || self.collection.is_empty() {
                return Ok(ExecutionResult::next());
            }
            return Ok(ExecutionResult::branch(
                std::mem::take(&mut self.collection),
                active_state(),
            ));
        }

        let index = ctx
            .persistence_data()
            .and_then(|state| state.get("index"))
            .and_then(Value::as_u64)
            .unwrap_or(0) as usize;
        match self.collection.get(index) {
            Some(item) => Ok(ExecutionResult::branch(
                vec![item.clone()],
                Some(json!({ "children_active": true, "index": index + 1 })),
            )),
            None => Ok(ExecutionResult::next()),
        }
    }
}

/// Block running `first` and its successors once.
pub fn sequence(first: StepId) -> WorkflowStep {
    WorkflowStep::new(SEQUENCE).with_children([first])
}

/// One branch per entry, all started together.
pub fn parallel(branches: impl IntoIterator<Item = StepId>) -> WorkflowStep {
    WorkflowStep::new(PARALLEL).with_children(branches)
}

pub fn saga(first: StepId) -> WorkflowStep {
    let mut step = WorkflowStep::new(SAGA).with_children([first]);
    step.saga = true;
    step
}

pub fn if_then<F>(condition: F, first: StepId) -> WorkflowStep
where
    F: Fn(&Value) -> bool + Send + Sync + 'static,
{
    WorkflowStep::new(IF)
        .with_children([first])
        .input(move |body: &mut If, data: &Value| body.condition = condition(data))
}

pub fn while_loop<F>(condition: F, first: StepId) -> WorkflowStep
where
    F: Fn(&Value) -> bool + Send + Sync + 'static,
{
    WorkflowStep::new(WHILE)
        .with_children([first])
        .input(move |body: &mut While, data: &Value| body.condition = condition(data))
}

/// `collection` is re-read from instance data on every run.
pub fn foreach<F>(collection: F, first: StepId, parallel: bool) -> WorkflowStep
where
    F: Fn(&Value) -> Vec<Value> + Send + Sync + 'static,
{
    WorkflowStep::new(FOREACH)
        .with_children([first])
        .input(move |body: &mut Foreach, data: &Value| {
            body.collection = collection(data);
            body.parallel = parallel;
        })
}
