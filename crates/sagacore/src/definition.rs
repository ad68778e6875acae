use crate::{StepBody, StepError};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::any::type_name;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

pub type StepId = usize;

/// Immutable, versioned graph of steps.
///
/// Definitions are registered once per `(id, version)` and only read at
/// runtime. Instances keep referencing the version they were started with.
#[derive(Debug, Clone)]
pub struct WorkflowDefinition {
    pub id: String,
    pub version: u32,
    pub description: Option<String>,
    pub steps: Vec<WorkflowStep>,
    pub initial_step: StepId,
    pub default_error_behavior: ErrorBehavior,
    pub default_error_retry_interval: Duration,
}

impl WorkflowDefinition {
    pub fn new(id: impl Into<String>, version: u32) -> Self {
        Self {
            id: id.into(),
            version,
            description: None,
            steps: Vec::new(),
            initial_step: 0,
            default_error_behavior: ErrorBehavior::Retry,
            default_error_retry_interval: Duration::from_secs(60),
        }
    }

    /// Add a step, assigning it the next free id.
    ///
    /// The first step added becomes the initial step unless
    /// [`with_initial_step`](Self::with_initial_step) says otherwise.
    pub fn add_step(&mut self, mut step: WorkflowStep) -> StepId {
        let id = self.steps.iter().map(|s| s.id + 1).max().unwrap_or(0);
        step.id = id;
        if self.steps.is_empty() {
            self.initial_step = id;
        }
        self.steps.push(step);
        id
    }

    /// Add an unconditional edge: fires whenever `from` emits no outcome value.
    pub fn connect(&mut self, from: StepId, to: StepId) -> &mut Self {
        if let Some(step) = self.step_mut(from) {
            step.outcomes.push(StepOutcome::then(to));
        }
        self
    }

    /// Add a conditional edge: fires when `matcher(data)` equals the emitted outcome value.
    pub fn connect_when<F>(&mut self, from: StepId, matcher: F, to: StepId) -> &mut Self
    where
        F: Fn(&Value) -> Value + Send + Sync + 'static,
    {
        if let Some(step) = self.step_mut(from) {
            step.outcomes.push(StepOutcome::when(matcher, to));
        }
        self
    }

    pub fn with_initial_step(mut self, step: StepId) -> Self {
        self.initial_step = step;
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_default_error_behavior(mut self, behavior: ErrorBehavior, retry: Duration) -> Self {
        self.default_error_behavior = behavior;
        self.default_error_retry_interval = retry;
        self
    }

    pub fn step(&self, id: StepId) -> Option<&WorkflowStep> {
        self.steps.iter().find(|s| s.id == id)
    }

    pub fn step_mut(&mut self, id: StepId) -> Option<&mut WorkflowStep> {
        self.steps.iter_mut().find(|s| s.id == id)
    }
}

/// What happens when a step body fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorBehavior {
    Retry,
    Suspend,
    Terminate,
    Compensate,
}

/// A node in the step graph.
#[derive(Debug, Clone)]
pub struct WorkflowStep {
    pub id: StepId,
    pub name: Option<String>,
    /// Registry tag of the body factory.
    pub body: String,
    pub inputs: Vec<InputBinding>,
    pub outputs: Vec<OutputBinding>,
    pub outcomes: Vec<StepOutcome>,
    pub error_behavior: Option<ErrorBehavior>,
    pub retry_interval: Option<Duration>,
    pub compensation_step_id: Option<StepId>,
    /// First steps of the sub-graph owned by a container.
    pub children: Vec<StepId>,
    /// Marks a saga container: failures inside compensate its completed steps.
    pub saga: bool,
}

impl WorkflowStep {
    pub fn new(body: impl Into<String>) -> Self {
        Self {
            id: 0,
            name: None,
            body: body.into(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            outcomes: Vec::new(),
            error_behavior: None,
            retry_interval: None,
            compensation_step_id: None,
            children: Vec::new(),
            saga: false,
        }
    }

    pub fn with_id(mut self, id: StepId) -> Self {
        self.id = id;
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Bind instance data into a field of body type `B` before it runs.
    pub fn input<B, F>(mut self, bind: F) -> Self
    where
        B: StepBody + 'static,
        F: Fn(&mut B, &Value) + Send + Sync + 'static,
    {
        self.inputs.push(InputBinding::new(bind));
        self
    }

    /// Copy a field of body type `B` back into instance data after it completes.
    pub fn output<B, F>(mut self, bind: F) -> Self
    where
        B: StepBody + 'static,
        F: Fn(&B, &mut Value) + Send + Sync + 'static,
    {
        self.outputs.push(OutputBinding::new(bind));
        self
    }

    pub fn then(mut self, next: StepId) -> Self {
        self.outcomes.push(StepOutcome::then(next));
        self
    }

    pub fn when<F>(mut self, matcher: F, next: StepId) -> Self
    where
        F: Fn(&Value) -> Value + Send + Sync + 'static,
    {
        self.outcomes.push(StepOutcome::when(matcher, next));
        self
    }

    pub fn on_error(mut self, behavior: ErrorBehavior, retry_interval: Option<Duration>) -> Self {
        self.error_behavior = Some(behavior);
        self.retry_interval = retry_interval;
        self
    }

    pub fn compensate_with(mut self, step: StepId) -> Self {
        self.compensation_step_id = Some(step);
        self
    }

    pub fn with_children(mut self, children: impl IntoIterator<Item = StepId>) -> Self {
        self.children.extend(children);
        self
    }

    pub fn display_name(&self) -> String {
        self.name.clone().unwrap_or_else(|| format!("{}#{}", self.body, self.id))
    }
}

type InputFn = dyn Fn(&mut dyn StepBody, &Value) -> Result<(), StepError> + Send + Sync;
type OutputFn = dyn Fn(&dyn StepBody, &mut Value) -> Result<(), StepError> + Send + Sync;
type MatcherFn = dyn Fn(&Value) -> Value + Send + Sync;

/// Instance data -> body field assignment.
#[derive(Clone)]
pub struct InputBinding(Arc<InputFn>);

impl InputBinding {
    pub fn new<B, F>(bind: F) -> Self
    where
        B: StepBody + 'static,
        F: Fn(&mut B, &Value) + Send + Sync + 'static,
    {
        Self(Arc::new(move |body: &mut dyn StepBody, data: &Value| {
            let body = body
                .as_any_mut()
                .downcast_mut::<B>()
                .ok_or(StepError::BindingType { expected: type_name::<B>() })?;
            bind(body, data);
            Ok(())
        }))
    }

    pub fn apply(&self, body: &mut dyn StepBody, data: &Value) -> Result<(), StepError> {
        (self.0)(body, data)
    }
}

impl fmt::Debug for InputBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("InputBinding")
    }
}

/// Body field -> instance data assignment.
#[derive(Clone)]
pub struct OutputBinding(Arc<OutputFn>);

impl OutputBinding {
    pub fn new<B, F>(bind: F) -> Self
    where
        B: StepBody + 'static,
        F: Fn(&B, &mut Value) + Send + Sync + 'static,
    {
        Self(Arc::new(move |body: &dyn StepBody, data: &mut Value| {
            let body = body
                .as_any()
                .downcast_ref::<B>()
                .ok_or(StepError::BindingType { expected: type_name::<B>() })?;
            bind(body, data);
            Ok(())
        }))
    }

    pub fn apply(&self, body: &dyn StepBody, data: &mut Value) -> Result<(), StepError> {
        (self.0)(body, data)
    }
}

impl fmt::Debug for OutputBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("OutputBinding")
    }
}

/// Edge from one step to another.
#[derive(Clone)]
pub struct StepOutcome {
    pub matcher: Option<Arc<MatcherFn>>,
    pub next_step: StepId,
    pub label: Option<String>,
}

impl StepOutcome {
    pub fn then(next_step: StepId) -> Self {
        Self {
            matcher: None,
            next_step,
            label: None,
        }
    }

    pub fn when<F>(matcher: F, next_step: StepId) -> Self
    where
        F: Fn(&Value) -> Value + Send + Sync + 'static,
    {
        Self {
            matcher: Some(Arc::new(matcher)),
            next_step,
            label: None,
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    /// Equality between the matcher's value and the emitted outcome.
    /// An absent matcher and an absent outcome both compare as `null`.
    pub fn matches(&self, data: &Value, emitted: Option<&Value>) -> bool {
        let expected = match &self.matcher {
            Some(matcher) => matcher(data),
            None => Value::Null,
        };
        expected == *emitted.unwrap_or(&Value::Null)
    }
}

impl fmt::Debug for StepOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StepOutcome")
            .field("conditional", &self.matcher.is_some())
            .field("next_step", &self.next_step)
            .field("label", &self.label)
            .finish()
    }
}
