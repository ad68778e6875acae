use anyhow::{bail, Result};
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use sagacore::{
    ExecutionEvent, ExecutionResult, InstanceId, StepBody, StepError, StepExecutionContext,
    WorkflowDefinition, WorkflowStatus, WorkflowStep,
};
use sagaruntime::{HostConfig, MemoryPersistence, StepRegistry, WorkflowHost};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "sagaflow")]
#[command(about = "Durable saga workflow engine", long_about = None)]
struct Cli {
    /// Show debug output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Host poll interval in milliseconds
    #[arg(long, default_value_t = 50, global = true)]
    poll_interval_ms: u64,

    /// Instances processed concurrently
    #[arg(long, default_value_t = 10, global = true)]
    max_concurrent: usize,

    /// Retries per step before the instance is suspended
    #[arg(long, global = true)]
    max_retries: Option<u32>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a built-in demo workflow against the in-memory store
    Demo {
        #[command(subcommand)]
        demo: Demo,
    },

    /// List available step body types
    Steps,
}

#[derive(Subcommand)]
enum Demo {
    /// Count up inside a while loop
    Loop {
        #[arg(short, long, default_value_t = 3)]
        iterations: i64,
    },

    /// Book a trip; the car rental fails and earlier bookings are compensated
    Saga {
        /// Let the car rental succeed
        #[arg(long)]
        succeed: bool,
    },

    /// Wait for an external payment event
    Events {
        #[arg(short, long, default_value = "order-1")]
        order: String,
    },
}

/// Adds one to `counter`.
#[derive(Default)]
struct Increment {
    value: i64,
}

#[async_trait]
impl StepBody for Increment {
    async fn run(&mut self, _ctx: &StepExecutionContext<'_>) -> Result<ExecutionResult, StepError> {
        self.value += 1;
        Ok(ExecutionResult::next())
    }
}

/// Appends its label to the `log` array.
#[derive(Default)]
struct Record {
    label: String,
}

#[async_trait]
impl StepBody for Record {
    async fn run(&mut self, ctx: &StepExecutionContext<'_>) -> Result<ExecutionResult, StepError> {
        if self.label.is_empty() {
            return Err(StepError::MissingInput("label".to_string()));
        }
        tracing::info!(instance = %ctx.instance_id, "{}", self.label);
        Ok(ExecutionResult::next())
    }
}

#[derive(Default)]
struct Unavailable;

#[async_trait]
impl StepBody for Unavailable {
    async fn run(&mut self, _ctx: &StepExecutionContext<'_>) -> Result<ExecutionResult, StepError> {
        Err(StepError::failed("no cars available"))
    }
}

fn set_field(data: &mut Value, field: &str, value: Value) {
    if let Some(object) = data.as_object_mut() {
        object.insert(field.to_string(), value);
    }
}

fn record(label: &'static str) -> WorkflowStep {
    WorkflowStep::new("demo.record")
        .with_name(label)
        .input(move |body: &mut Record, _: &Value| body.label = label.to_string())
        .output(|body: &Record, data: &mut Value| {
            let mut log = data.get("log").and_then(Value::as_array).cloned().unwrap_or_default();
            log.push(json!(body.label));
            set_field(data, "log", Value::Array(log));
        })
}

fn step_registry() -> StepRegistry {
    let mut registry = StepRegistry::new();
    sagasteps::register_all(&mut registry);
    registry.register_fn("demo.increment", || Box::new(Increment::default()) as Box<dyn StepBody>);
    registry.register_fn("demo.record", || Box::new(Record::default()) as Box<dyn StepBody>);
    registry.register_fn("demo.unavailable", || Box::new(Unavailable) as Box<dyn StepBody>);
    registry
}

fn loop_definition(iterations: i64) -> WorkflowDefinition {
    let mut definition = WorkflowDefinition::new("counter", 1)
        .with_description("Increment a counter inside a while loop");
    let looping = definition.add_step(
        sagasteps::while_loop(move |data| counter(data) < iterations, 0).with_name("loop"),
    );
    let increment = definition.add_step(
        WorkflowStep::new("demo.increment")
            .with_name("increment")
            .input(|body: &mut Increment, data: &Value| body.value = counter(data))
            .output(|body: &Increment, data: &mut Value| {
                set_field(data, "counter", json!(body.value))
            }),
    );
    let done = definition.add_step(record("loop finished"));
    if let Some(step) = definition.step_mut(looping) {
        step.children = vec![increment];
    }
    definition.connect(looping, done);
    definition
}

fn counter(data: &Value) -> i64 {
    data.get("counter").and_then(Value::as_i64).unwrap_or(0)
}

fn saga_definition(succeed: bool) -> WorkflowDefinition {
    let mut definition = WorkflowDefinition::new("trip", 1)
        .with_description("Book flight, hotel and car as one saga");
    let trip = definition.add_step(sagasteps::saga(0).with_name("trip"));
    let flight = definition.add_step(record("book flight"));
    let hotel = definition.add_step(record("book hotel"));
    let car = definition.add_step(if succeed {
        record("rent car")
    } else {
        WorkflowStep::new("demo.unavailable").with_name("rent car")
    });
    let cancel_flight = definition.add_step(record("cancel flight"));
    let cancel_hotel = definition.add_step(record("cancel hotel"));
    let done = definition.add_step(record("trip settled"));

    if let Some(step) = definition.step_mut(trip) {
        step.children = vec![flight];
    }
    for (booking, compensation) in [(flight, cancel_flight), (hotel, cancel_hotel)] {
        if let Some(step) = definition.step_mut(booking) {
            step.compensation_step_id = Some(compensation);
        }
    }
    definition.connect(flight, hotel).connect(hotel, car).connect(trip, done);
    definition
}

fn events_definition() -> WorkflowDefinition {
    let mut definition = WorkflowDefinition::new("payment", 1)
        .with_description("Wait for an order to be paid");
    let wait = definition.add_step(sagasteps::store_event_data(
        sagasteps::wait_for("order.paid", |data| {
            data.get("order").and_then(Value::as_str).unwrap_or_default().to_string()
        })
        .with_name("await payment"),
        "payment",
    ));
    let done = definition.add_step(record("order paid"));
    definition.connect(wait, done);
    definition
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    let config = HostConfig::default()
        .with_poll_interval(Duration::from_millis(cli.poll_interval_ms))
        .with_max_concurrent_instances(cli.max_concurrent)
        .with_max_retries(cli.max_retries);

    match cli.command {
        Commands::Steps => list_steps(),
        Commands::Demo { demo } => run_demo(demo, config).await?,
    }

    Ok(())
}

fn list_steps() {
    println!("📦 Available step types:");
    println!();

    let registry = step_registry();
    for body_type in registry.list_body_types() {
        match registry.get_metadata(&body_type) {
            Some(metadata) if !metadata.description.is_empty() => {
                println!("  • {} ({})", body_type, metadata.category);
                println!("    {}", metadata.description);
            }
            _ => println!("  • {}", body_type),
        }
    }
}

async fn run_demo(demo: Demo, config: HostConfig) -> Result<()> {
    let host =
        WorkflowHost::with_config(step_registry(), Arc::new(MemoryPersistence::new()), config);

    let (definition, data) = match &demo {
        Demo::Loop { iterations } => (loop_definition(*iterations), json!({ "counter": 0 })),
        Demo::Saga { succeed } => (saga_definition(*succeed), json!({ "log": [] })),
        Demo::Events { order } => (events_definition(), json!({ "order": order })),
    };
    let definition = host.register_workflow(definition).await?;

    let mut events = host.subscribe_events();
    let printer = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                ExecutionEvent::WorkflowStarted { workflow_id, version, .. } => {
                    println!("▶️  Workflow {} v{} started", workflow_id, version);
                }
                ExecutionEvent::StepStarted { step_name, .. } => {
                    println!("  ⚡ {}", step_name);
                }
                ExecutionEvent::StepFailed { step_id, error, .. } => {
                    println!("  ❌ Step {} failed: {}", step_id, error);
                }
                ExecutionEvent::StepCompensated { step_id, compensation_step_id, .. } => {
                    println!("  ↩️  Step {} compensated by {}", step_id, compensation_step_id);
                }
                ExecutionEvent::EventConsumed { name, key, .. } => {
                    println!("  📨 {} ({}) delivered", name, key);
                }
                ExecutionEvent::WorkflowCompleted { .. } => println!("✨ Workflow completed"),
                ExecutionEvent::WorkflowTerminated { .. } => println!("💥 Workflow terminated"),
                ExecutionEvent::WorkflowSuspended { .. } => println!("⏸️  Workflow suspended"),
                _ => {}
            }
        }
    });

    host.start().await;
    let id = host.start_workflow(&definition.id, Some(definition.version), data).await?;

    if let Demo::Events { order } = &demo {
        tokio::time::sleep(Duration::from_millis(200)).await;
        host.publish_event("order.paid", order, json!({ "amount": 42 }), None)
            .await?;
    }

    let finished = wait_for_completion(&host, id, Duration::from_secs(10)).await;
    host.stop().await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    printer.abort();

    let instance = finished?;
    println!();
    println!("📊 Instance {}", instance.id);
    println!("   Status: {:?}", instance.status);
    println!("   Pointers: {}", instance.execution_pointers.len());
    println!("   Data: {}", serde_json::to_string_pretty(&instance.data)?);
    Ok(())
}

async fn wait_for_completion(
    host: &WorkflowHost,
    id: InstanceId,
    timeout: Duration,
) -> Result<sagacore::WorkflowInstance> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let instance = host.get_instance(id).await?;
        if instance.status.is_terminal() || instance.status == WorkflowStatus::Suspended {
            return Ok(instance);
        }
        if tokio::time::Instant::now() >= deadline {
            bail!("instance {} still {:?} after {:?}", id, instance.status, timeout);
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
