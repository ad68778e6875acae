use async_trait::async_trait;
use sagacore::{
    DefinitionError, EngineError, ErrorBehavior, EventBus, ExecutionEvent, ExecutionResult,
    InstanceId, PersistenceError, PersistenceProvider, PointerStatus, StepBody, StepError,
    StepExecutionContext, WorkflowDefinition, WorkflowInstance, WorkflowStatus, WorkflowStep,
};
use sagaruntime::{HostConfig, MemoryPersistence, StepRegistry, WorkflowExecutor, WorkflowHost};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};
    let _ = fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug")),
        )
        .with_test_writer()
        .try_init();
}

/// Appends `label` to the `log` array in instance data.
#[derive(Default)]
struct Mark {
    label: String,
}

#[async_trait]
impl StepBody for Mark {
    async fn run(&mut self, _ctx: &StepExecutionContext<'_>) -> Result<ExecutionResult, StepError> {
        Ok(ExecutionResult::next())
    }
}

/// Completes with `value` as its outcome.
#[derive(Default)]
struct Emit {
    value: Value,
}

#[async_trait]
impl StepBody for Emit {
    async fn run(&mut self, _ctx: &StepExecutionContext<'_>) -> Result<ExecutionResult, StepError> {
        Ok(ExecutionResult::outcome(self.value.clone()))
    }
}

/// Fails its first `fail_first` invocations across the whole test.
struct Flaky {
    calls: Arc<AtomicUsize>,
    fail_first: usize,
}

#[async_trait]
impl StepBody for Flaky {
    async fn run(&mut self, _ctx: &StepExecutionContext<'_>) -> Result<ExecutionResult, StepError> {
        let attempt = self.calls.fetch_add(1, Ordering::SeqCst);
        if attempt < self.fail_first {
            return Err(StepError::failed(format!("attempt {} failed", attempt + 1)));
        }
        Ok(ExecutionResult::next())
    }
}

/// Sleeps for an hour on its first run.
#[derive(Default)]
struct Nap;

#[async_trait]
impl StepBody for Nap {
    async fn run(&mut self, ctx: &StepExecutionContext<'_>) -> Result<ExecutionResult, StepError> {
        if ctx.persistence_data().is_some() {
            return Ok(ExecutionResult::next());
        }
        Ok(ExecutionResult::sleep(Duration::from_secs(3600), Some(json!(true))))
    }
}

fn registry(calls: Arc<AtomicUsize>, fail_first: usize) -> StepRegistry {
    let mut registry = StepRegistry::new();
    registry.register_fn("mark", || Box::new(Mark::default()) as Box<dyn StepBody>);
    registry.register_fn("emit", || Box::new(Emit::default()) as Box<dyn StepBody>);
    registry.register_fn("nap", || Box::new(Nap) as Box<dyn StepBody>);
    registry.register_fn("flaky", move || {
        Box::new(Flaky {
            calls: calls.clone(),
            fail_first,
        }) as Box<dyn StepBody>
    });
    registry
}

fn mark(label: &'static str) -> WorkflowStep {
    WorkflowStep::new("mark")
        .with_name(label)
        .input(move |body: &mut Mark, _: &Value| body.label = label.to_string())
        .output(|body: &Mark, data: &mut Value| {
            let mut log = data.get("log").and_then(Value::as_array).cloned().unwrap_or_default();
            log.push(json!(body.label));
            data["log"] = Value::Array(log);
        })
}

fn flaky(behavior: ErrorBehavior) -> WorkflowStep {
    WorkflowStep::new("flaky")
        .with_name("flaky")
        .on_error(behavior, Some(Duration::ZERO))
}

fn host_with(calls: Arc<AtomicUsize>, fail_first: usize, config: HostConfig) -> WorkflowHost {
    init_tracing();
    WorkflowHost::with_config(
        registry(calls, fail_first),
        Arc::new(MemoryPersistence::new()),
        config,
    )
}

fn host() -> WorkflowHost {
    host_with(Arc::new(AtomicUsize::new(0)), 0, HostConfig::default())
}

/// Poll until a round processes nothing.
async fn drain(host: &WorkflowHost) {
    for _ in 0..50 {
        let report = host.poll_once().await.expect("poll");
        if report.instances_processed == 0 && report.events_delivered == 0 {
            return;
        }
    }
    panic!("host did not settle");
}

async fn run(host: &WorkflowHost, definition: WorkflowDefinition) -> WorkflowInstance {
    let id = start(host, definition).await;
    drain(host).await;
    host.get_instance(id).await.expect("instance")
}

async fn start(host: &WorkflowHost, definition: WorkflowDefinition) -> InstanceId {
    let definition = host.register_workflow(definition).await.expect("register");
    host.start_workflow(&definition.id, None, json!({ "log": [] }))
        .await
        .expect("start")
}

fn log(instance: &WorkflowInstance) -> Vec<String> {
    instance.data["log"]
        .as_array()
        .map(|entries| {
            entries
                .iter()
                .filter_map(|e| e.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default()
}

#[tokio::test]
async fn test_chain_runs_to_completion() {
    let host = host();
    let mut definition = WorkflowDefinition::new("chain", 1);
    let a = definition.add_step(mark("a"));
    let b = definition.add_step(mark("b"));
    let c = definition.add_step(mark("c"));
    definition.connect(a, b).connect(b, c);

    let instance = run(&host, definition).await;

    assert_eq!(instance.status, WorkflowStatus::Complete);
    assert!(instance.complete_time.is_some());
    assert_eq!(instance.next_execution, None);
    assert_eq!(log(&instance), vec!["a", "b", "c"]);
    assert!(instance
        .execution_pointers
        .iter()
        .all(|p| p.status == PointerStatus::Complete));
    assert!(instance.revision >= 1);
}

#[tokio::test]
async fn test_outcome_value_selects_branch() {
    let host = host();
    let mut definition = WorkflowDefinition::new("routing", 1);
    let decide = definition.add_step(
        WorkflowStep::new("emit").input(|body: &mut Emit, data: &Value| {
            let big = data["amount"].as_i64().unwrap_or(0) > 100;
            body.value = json!(if big { "big" } else { "small" });
        }),
    );
    let big = definition.add_step(mark("big"));
    let small = definition.add_step(mark("small"));
    let untaken = definition.add_step(mark("unconditional"));
    definition
        .connect_when(decide, |_| json!("big"), big)
        .connect_when(decide, |_| json!("small"), small)
        .connect(decide, untaken);

    let definition = host.register_workflow(definition).await.unwrap();
    let id = host
        .start_workflow(&definition.id, Some(1), json!({ "amount": 250, "log": [] }))
        .await
        .unwrap();
    drain(&host).await;

    let instance = host.get_instance(id).await.unwrap();
    assert_eq!(instance.status, WorkflowStatus::Complete);
    // an emitted value never fires the unconditional edge
    assert_eq!(log(&instance), vec!["big"]);
}

#[tokio::test]
async fn test_fan_out_spawns_independent_pointers() {
    let host = host();
    let mut definition = WorkflowDefinition::new("fan-out", 1);
    let root = definition.add_step(mark("root"));
    let left = definition.add_step(mark("left"));
    let right = definition.add_step(mark("right"));
    definition.connect(root, left).connect(root, right);

    let instance = run(&host, definition).await;

    assert_eq!(instance.status, WorkflowStatus::Complete);
    assert_eq!(instance.execution_pointers.len(), 3);
    let entries = log(&instance);
    assert!(entries.contains(&"left".to_string()));
    assert!(entries.contains(&"right".to_string()));
}

#[tokio::test]
async fn test_retry_then_success() {
    let calls = Arc::new(AtomicUsize::new(0));
    let host = host_with(calls.clone(), 2, HostConfig::default());
    let mut definition = WorkflowDefinition::new("retry", 1);
    let step = definition.add_step(flaky(ErrorBehavior::Retry));
    let after = definition.add_step(mark("after"));
    definition.connect(step, after);

    let instance = run(&host, definition).await;

    assert_eq!(instance.status, WorkflowStatus::Complete);
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(instance.execution_errors.len(), 2);
    assert_eq!(instance.execution_pointers[0].retry_count, 2);
    assert_eq!(log(&instance), vec!["after"]);
}

#[tokio::test]
async fn test_default_retry_waits_for_interval() {
    let calls = Arc::new(AtomicUsize::new(0));
    let host = host_with(calls.clone(), 1, HostConfig::default());
    let mut definition = WorkflowDefinition::new("slow-retry", 1);
    definition.add_step(WorkflowStep::new("flaky"));

    let instance = run(&host, definition).await;

    // default policy: retry after 60 seconds
    assert_eq!(instance.status, WorkflowStatus::Runnable);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    let pointer = &instance.execution_pointers[0];
    assert_eq!(pointer.status, PointerStatus::Pending);
    assert!(pointer.sleep_until.is_some());
    assert_eq!(instance.next_execution, pointer.sleep_until);
}

#[tokio::test]
async fn test_retry_cap_suspends_instance() {
    let calls = Arc::new(AtomicUsize::new(0));
    let config = HostConfig::default().with_max_retries(Some(2));
    let host = host_with(calls.clone(), usize::MAX, config);
    let mut definition = WorkflowDefinition::new("capped", 1);
    definition.add_step(flaky(ErrorBehavior::Retry));

    let instance = run(&host, definition).await;

    assert_eq!(instance.status, WorkflowStatus::Suspended);
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(instance.execution_pointers[0].status, PointerStatus::Suspended);
}

#[tokio::test]
async fn test_suspend_behavior_then_resume() {
    let calls = Arc::new(AtomicUsize::new(0));
    let host = host_with(calls.clone(), 1, HostConfig::default());
    let mut definition = WorkflowDefinition::new("suspend", 1);
    let step = definition.add_step(flaky(ErrorBehavior::Suspend));
    let after = definition.add_step(mark("after"));
    definition.connect(step, after);

    let id = start(&host, definition).await;
    drain(&host).await;
    let instance = host.get_instance(id).await.unwrap();
    assert_eq!(instance.status, WorkflowStatus::Suspended);
    assert_eq!(instance.execution_pointers[0].status, PointerStatus::Suspended);

    // suspended instances are never polled
    drain(&host).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    assert!(host.resume_instance(id).await.unwrap());
    assert!(!host.resume_instance(id).await.unwrap());
    drain(&host).await;

    let instance = host.get_instance(id).await.unwrap();
    assert_eq!(instance.status, WorkflowStatus::Complete);
    assert_eq!(log(&instance), vec!["after"]);
}

#[tokio::test]
async fn test_terminate_behavior_stops_instance() {
    let calls = Arc::new(AtomicUsize::new(0));
    let host = host_with(calls, usize::MAX, HostConfig::default());
    let mut definition = WorkflowDefinition::new("terminate", 1);
    let step = definition.add_step(flaky(ErrorBehavior::Terminate));
    let after = definition.add_step(mark("after"));
    definition.connect(step, after);

    let instance = run(&host, definition).await;

    assert_eq!(instance.status, WorkflowStatus::Terminated);
    assert!(instance.complete_time.is_some());
    assert_eq!(instance.execution_pointers.len(), 1);
    assert_eq!(instance.execution_pointers[0].status, PointerStatus::Failed);
    assert!(log(&instance).is_empty());
}

#[tokio::test]
async fn test_compensate_outside_saga_terminates() {
    let calls = Arc::new(AtomicUsize::new(0));
    let host = host_with(calls, usize::MAX, HostConfig::default());
    let mut definition = WorkflowDefinition::new("compensate", 1);
    let first = definition.add_step(mark("first"));
    let failing = definition.add_step(flaky(ErrorBehavior::Compensate));
    let undo = definition.add_step(mark("undo"));
    definition.connect(first, failing);
    if let Some(step) = definition.step_mut(failing) {
        step.compensation_step_id = Some(undo);
    }

    let instance = run(&host, definition).await;

    assert_eq!(instance.status, WorkflowStatus::Terminated);
    assert_eq!(log(&instance), vec!["first", "undo"]);
    let failed = instance
        .execution_pointers
        .iter()
        .find(|p| p.step_id == failing)
        .unwrap();
    assert_eq!(failed.status, PointerStatus::Compensated);
}

#[tokio::test]
async fn test_external_suspend_resume_terminate() {
    let host = host();
    let mut definition = WorkflowDefinition::new("sleepy", 1);
    let nap = definition.add_step(WorkflowStep::new("nap"));
    let after = definition.add_step(mark("after"));
    definition.connect(nap, after);

    let id = start(&host, definition).await;
    drain(&host).await;
    let instance = host.get_instance(id).await.unwrap();
    assert_eq!(instance.status, WorkflowStatus::Runnable);
    assert_eq!(instance.execution_pointers[0].status, PointerStatus::Sleeping);
    assert!(instance.next_execution > Some(chrono::Utc::now()));

    assert!(host.suspend_instance(id).await.unwrap());
    assert!(!host.suspend_instance(id).await.unwrap());
    assert_eq!(host.get_instance(id).await.unwrap().status, WorkflowStatus::Suspended);

    assert!(host.resume_instance(id).await.unwrap());
    assert!(host.terminate_instance(id).await.unwrap());
    assert!(!host.terminate_instance(id).await.unwrap());
    assert!(!host.resume_instance(id).await.unwrap());

    let instance = host.get_instance(id).await.unwrap();
    assert_eq!(instance.status, WorkflowStatus::Terminated);
    assert!(log(&instance).is_empty());
}

#[tokio::test]
async fn test_unpersisted_cycle_is_replayed() {
    let calls = Arc::new(AtomicUsize::new(0));
    let host = host_with(calls.clone(), 0, HostConfig::default());
    let mut definition = WorkflowDefinition::new("replay", 1);
    let step = definition.add_step(WorkflowStep::new("flaky"));
    let after = definition.add_step(mark("after"));
    definition.connect(step, after);
    let definition = host.register_workflow(definition).await.unwrap();
    let id = host
        .start_workflow("replay", Some(1), json!({ "log": [] }))
        .await
        .unwrap();

    // a worker runs the cycle and dies before persisting
    let executor = WorkflowExecutor::new(host.steps().clone(), Arc::new(EventBus::default()));
    let mut lost = host.get_instance(id).await.unwrap();
    executor.execute(&mut lost, &definition).await;
    assert_eq!(lost.status, WorkflowStatus::Complete);

    let stored = host.get_instance(id).await.unwrap();
    assert_eq!(stored.status, WorkflowStatus::Runnable);
    assert_eq!(stored.revision, 0);
    assert_eq!(stored.execution_pointers.len(), 1);

    drain(&host).await;
    let instance = host.get_instance(id).await.unwrap();
    assert_eq!(instance.status, WorkflowStatus::Complete);
    assert_eq!(log(&instance), vec!["after"]);
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    // the lost worker's late write is rejected
    let late = host.persistence().persist_instance(&lost, 0).await;
    assert!(matches!(late, Err(PersistenceError::VersionConflict { .. })));
}

#[tokio::test]
async fn test_two_hosts_process_each_instance_once() {
    init_tracing();
    let calls = Arc::new(AtomicUsize::new(0));
    let store: Arc<dyn PersistenceProvider> = Arc::new(MemoryPersistence::new());
    let first = WorkflowHost::new(registry(calls.clone(), 0), store.clone());
    let second = WorkflowHost::new(registry(calls.clone(), 0), store.clone());

    for host in [&first, &second] {
        let mut definition = WorkflowDefinition::new("once", 1);
        definition.add_step(WorkflowStep::new("flaky"));
        host.register_workflow(definition).await.unwrap();
    }

    let mut ids = Vec::new();
    for _ in 0..20 {
        ids.push(first.start_workflow("once", None, json!({})).await.unwrap());
    }

    let (a, b) = tokio::join!(first.poll_once(), second.poll_once());
    a.unwrap();
    b.unwrap();
    drain(&first).await;

    assert_eq!(calls.load(Ordering::SeqCst), 20);
    for id in ids {
        assert_eq!(first.get_instance(id).await.unwrap().status, WorkflowStatus::Complete);
    }
}

#[tokio::test]
async fn test_lifecycle_events_are_broadcast() {
    let host = host();
    let mut events = host.subscribe_events();
    let mut definition = WorkflowDefinition::new("events", 1);
    definition.add_step(mark("only"));

    let id = start(&host, definition).await;
    drain(&host).await;

    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        seen.push(event);
    }
    assert!(matches!(
        seen.first(),
        Some(ExecutionEvent::WorkflowStarted { instance_id, .. }) if *instance_id == id
    ));
    assert!(seen.iter().any(|e| matches!(
        e,
        ExecutionEvent::StepStarted { step_name, .. } if step_name == "only"
    )));
    assert!(seen.iter().any(|e| matches!(e, ExecutionEvent::StepCompleted { .. })));
    assert!(matches!(seen.last(), Some(ExecutionEvent::WorkflowCompleted { .. })));
}

#[tokio::test]
async fn test_host_api_errors() {
    let host = host();

    let missing = host.start_workflow("nope", None, json!({})).await;
    assert!(matches!(missing, Err(EngineError::UnknownDefinition { .. })));

    let mut definition = WorkflowDefinition::new("unknown-body", 1);
    definition.add_step(WorkflowStep::new("not.registered"));
    let rejected = host.register_workflow(definition).await;
    assert!(matches!(
        rejected,
        Err(EngineError::Definition(DefinitionError::Invalid(_)))
    ));

    let unknown = uuid::Uuid::new_v4();
    assert!(matches!(
        host.get_instance(unknown).await,
        Err(EngineError::UnknownInstance(id)) if id == unknown
    ));
    assert!(matches!(
        host.suspend_instance(unknown).await,
        Err(EngineError::UnknownInstance(_))
    ));
}

#[tokio::test]
async fn test_sweep_reclaims_abandoned_lease() {
    let host = host();
    let mut definition = WorkflowDefinition::new("abandoned", 1);
    definition.add_step(mark("only"));
    let id = start(&host, definition).await;

    host.persistence()
        .acquire_lease(id, "crashed-worker", Duration::from_millis(300))
        .await
        .unwrap();
    assert_eq!(host.poll_once().await.unwrap().instances_processed, 0);

    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(host.sweep_expired_leases().await.unwrap(), vec![id]);

    drain(&host).await;
    assert_eq!(host.get_instance(id).await.unwrap().status, WorkflowStatus::Complete);
}

#[tokio::test]
async fn test_background_host_completes_instances() {
    let config = HostConfig::default().with_poll_interval(Duration::from_millis(10));
    let host = host_with(Arc::new(AtomicUsize::new(0)), 0, config);
    let mut definition = WorkflowDefinition::new("background", 1);
    let a = definition.add_step(mark("a"));
    let b = definition.add_step(mark("b"));
    definition.connect(a, b);
    let id = start(&host, definition).await;

    host.start().await;
    let mut status = WorkflowStatus::Runnable;
    for _ in 0..200 {
        status = host.get_instance(id).await.unwrap().status;
        if status == WorkflowStatus::Complete {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    host.stop().await;

    assert_eq!(status, WorkflowStatus::Complete);
}

#[tokio::test]
async fn test_unclaimed_event_is_kept_within_retention() {
    let host = host();
    host.publish_event("paid", "o-1", json!(1), None).await.unwrap();

    let report = host.poll_once().await.unwrap();
    assert_eq!(report.events_delivered, 0);
    assert_eq!(report.events_expired, 0);
    assert_eq!(host.persistence().get_unprocessed_events().await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_unclaimed_event_expires_after_retention() {
    let config = HostConfig::default().with_event_retention(Duration::ZERO);
    let host = host_with(Arc::new(AtomicUsize::new(0)), 0, config);
    host.publish_event("paid", "o-1", json!(1), None).await.unwrap();

    let report = host.poll_once().await.unwrap();
    assert_eq!(report.events_expired, 1);
    assert!(host.persistence().get_unprocessed_events().await.unwrap().is_empty());

    assert_eq!(host.poll_once().await.unwrap().events_expired, 0);
}
