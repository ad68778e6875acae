use async_trait::async_trait;
use sagacore::{ExecutionResult, StepBody, StepError, StepExecutionContext, StepId, WorkflowStep};
use sagaruntime::{StepBodyFactory, StepMetadata};
use serde_json::{json, Value};
use std::time::Duration;

pub const DELAY: &str = "time.delay";
pub const SCHEDULE: &str = "time.schedule";

/// Parks the pointer for `period`, then proceeds.
///
/// The wait is durable: the pointer sleeps in persistence rather than in
/// the worker, so a restart picks it up where it left off.
#[derive(Debug, Default)]
pub struct Delay {
    pub period: Duration,
}

#[async_trait]
impl StepBody for Delay {
    async fn run(&mut self, ctx: &StepExecutionContext<'_>) -> Result<ExecutionResult, StepError> {
        if ctx.persistence_data().is_some() || self.period.is_zero() {
            return Ok(ExecutionResult::next());
        }
        tracing::debug!(
            pointer = %ctx.pointer.id,
            period_ms = self.period.as_millis() as u64,
            "Delaying"
        );
        Ok(ExecutionResult::sleep(self.period, Some(json!({ "slept": true }))))
    }
}

pub struct DelayFactory;

impl StepBodyFactory for DelayFactory {
    fn create(&self) -> Result<Box<dyn StepBody>, StepError> {
        Ok(Box::new(Delay::default()))
    }

    fn body_type(&self) -> &str {
        DELAY
    }

    fn metadata(&self) -> StepMetadata {
        StepMetadata {
            description: "Sleep for a period, then continue".to_string(),
            category: "time".to_string(),
        }
    }
}

/// Recurring timer. Sleeps `interval`, runs its children as one tick, fires
/// its outcomes for that tick and re-arms. Runs until `stop` holds after a
/// tick; the final tick then completes the step instead of re-arming.
#[derive(Debug, Default)]
pub struct Schedule {
    pub interval: Duration,
    pub stop: Option<bool>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Armed,
    Ticking,
}

impl Phase {
    fn of(ctx: &StepExecutionContext<'_>) -> Self {
        match ctx
            .persistence_data()
            .and_then(|state| state.get("phase"))
            .and_then(Value::as_str)
        {
            Some("armed") => Phase::Armed,
            Some("tick") => Phase::Ticking,
            _ => Phase::Idle,
        }
    }
}

impl Schedule {
    fn armed() -> Option<Value> {
        Some(json!({ "phase": "armed" }))
    }

    fn after_tick(&self, ctx: &StepExecutionContext<'_>) -> ExecutionResult {
        if self.stop == Some(true) {
            tracing::debug!(pointer = %ctx.pointer.id, "Schedule stopped");
            return ExecutionResult::next();
        }
        ExecutionResult::tick(self.interval, Self::armed())
    }
}

#[async_trait]
impl StepBody for Schedule {
    async fn run(&mut self, ctx: &StepExecutionContext<'_>) -> Result<ExecutionResult, StepError> {
        match Phase::of(ctx) {
            Phase::Idle => Ok(ExecutionResult::sleep(self.interval, Self::armed())),
            Phase::Armed if ctx.step.children.is_empty() => Ok(self.after_tick(ctx)),
            Phase::Armed => Ok(ExecutionResult::branch_inherit(Some(
                json!({ "phase": "tick", "children_active": true }),
            ))),
            Phase::Ticking if !ctx.children_complete() => {
                Ok(ExecutionResult::persist(ctx.persistence_data().cloned()))
            }
            Phase::Ticking => Ok(self.after_tick(ctx)),
        }
    }
}

pub struct ScheduleFactory;

impl StepBodyFactory for ScheduleFactory {
    fn create(&self) -> Result<Box<dyn StepBody>, StepError> {
        Ok(Box::new(Schedule::default()))
    }

    fn body_type(&self) -> &str {
        SCHEDULE
    }

    fn metadata(&self) -> StepMetadata {
        StepMetadata {
            description: "Run children every interval, routing onward after each tick".to_string(),
            category: "time".to_string(),
        }
    }
}

pub fn delay(period: Duration) -> WorkflowStep {
    WorkflowStep::new(DELAY).input(move |body: &mut Delay, _: &Value| body.period = period)
}

/// Delay whose period is computed from instance data.
pub fn delay_with<F>(period: F) -> WorkflowStep
where
    F: Fn(&Value) -> Duration + Send + Sync + 'static,
{
    WorkflowStep::new(DELAY).input(move |body: &mut Delay, data: &Value| body.period = period(data))
}

/// Block that runs every `interval` for as long as the instance lives.
pub fn schedule(interval: Duration, first: StepId) -> WorkflowStep {
    WorkflowStep::new(SCHEDULE)
        .with_children([first])
        .input(move |body: &mut Schedule, _: &Value| body.interval = interval)
}

/// Like [`schedule`], completing once `stop` returns true after a tick.
pub fn schedule_until<F>(interval: Duration, stop: F, first: StepId) -> WorkflowStep
where
    F: Fn(&Value) -> bool + Send + Sync + 'static,
{
    WorkflowStep::new(SCHEDULE)
        .with_children([first])
        .input(move |body: &mut Schedule, data: &Value| {
            body.interval = interval;
            body.stop = Some(stop(data));
        })
}
