//! Built-in step primitives
//!
//! Control-flow containers, durable delays and schedules, and event waits.
//! Each primitive comes with a constructor that returns a ready-bound
//! [`WorkflowStep`](sagacore::WorkflowStep).

pub mod control;
pub mod event;
pub mod time;

pub use control::{
    foreach, if_then, parallel, saga, sequence, while_loop, Foreach, If, Parallel, Saga, Sequence,
    While,
};
pub use event::{store_event_data, wait_for, wait_for_after, WaitFor};
pub use time::{delay, delay_with, schedule, schedule_until, Delay, Schedule};

use sagacore::StepBody;
use sagaruntime::{FnStepFactory, StepBodyFactory, StepRegistry};
use std::sync::Arc;

fn container<B>(body_type: &str, description: &str) -> Arc<dyn StepBodyFactory>
where
    B: StepBody + Default + 'static,
{
    let create: fn() -> Box<dyn StepBody> = || Box::new(B::default()) as Box<dyn StepBody>;
    Arc::new(FnStepFactory::new(body_type, create).with_metadata(description, "control"))
}

/// Register all built-in primitives with a registry
pub fn register_all(registry: &mut StepRegistry) {
    registry.register(container::<Sequence>(control::SEQUENCE, "Run a child chain once"));
    registry.register(container::<If>(control::IF, "Run children when a condition holds"));
    registry.register(container::<While>(
        control::WHILE,
        "Repeat children while a condition holds",
    ));
    registry.register(container::<Foreach>(control::FOREACH, "Run children once per item"));
    registry.register(container::<Parallel>(
        control::PARALLEL,
        "Run branches concurrently and join",
    ));
    registry.register(container::<Saga>(control::SAGA, "Compensate completed steps on failure"));
    registry.register(Arc::new(time::DelayFactory));
    registry.register(Arc::new(time::ScheduleFactory));
    registry.register(Arc::new(
        FnStepFactory::new(event::WAIT_FOR, || Box::new(WaitFor::default()) as Box<dyn StepBody>)
            .with_metadata("Wait for an external event", "event"),
    ));
}
