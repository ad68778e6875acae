use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sagacore::{ExecutionResult, StepBody, StepError, StepExecutionContext, WorkflowStep};
use serde_json::Value;

pub const WAIT_FOR: &str = "event.wait_for";

/// Parks the pointer until an event with matching name and key is published
/// at or after `effective_date`. The payload lands in `event_data`.
#[derive(Debug, Default)]
pub struct WaitFor {
    pub event_name: String,
    pub event_key: String,
    pub effective_date: Option<DateTime<Utc>>,
    pub event_data: Value,
}

#[async_trait]
impl StepBody for WaitFor {
    async fn run(&mut self, ctx: &StepExecutionContext<'_>) -> Result<ExecutionResult, StepError> {
        if ctx.pointer.event_published {
            self.event_data = ctx.pointer.event_data.clone().unwrap_or(Value::Null);
            return Ok(ExecutionResult::next());
        }

        if self.event_name.is_empty() {
            return Err(StepError::MissingInput("event_name".to_string()));
        }

        // a re-run keeps the date it first subscribed with
        let effective_date = self
            .effective_date
            .or(ctx.pointer.effective_date)
            .unwrap_or_else(Utc::now);
        Ok(ExecutionResult::wait_for_event(
            self.event_name.clone(),
            self.event_key.clone(),
            effective_date,
        ))
    }
}

/// Wait for `name` with a key computed from instance data.
pub fn wait_for<K>(name: impl Into<String>, key: K) -> WorkflowStep
where
    K: Fn(&Value) -> String + Send + Sync + 'static,
{
    let name = name.into();
    WorkflowStep::new(WAIT_FOR).input(move |body: &mut WaitFor, data: &Value| {
        body.event_name = name.clone();
        body.event_key = key(data);
    })
}

/// Like [`wait_for`], ignoring events published before `effective_date`.
pub fn wait_for_after<K>(
    name: impl Into<String>,
    key: K,
    effective_date: DateTime<Utc>,
) -> WorkflowStep
where
    K: Fn(&Value) -> String + Send + Sync + 'static,
{
    wait_for(name, key).input(move |body: &mut WaitFor, _: &Value| {
        body.effective_date = Some(effective_date);
    })
}

/// Copy the received payload into instance data under `field`.
pub fn store_event_data(step: WorkflowStep, field: &'static str) -> WorkflowStep {
    step.output(move |body: &WaitFor, data: &mut Value| {
        if let Some(object) = data.as_object_mut() {
            object.insert(field.to_string(), body.event_data.clone());
        }
    })
}
