use crate::definitions::DefinitionRegistry;
use crate::executor::{deadline, WorkflowExecutor};
use crate::registry::StepRegistry;
use chrono::{DateTime, Utc};
use futures::stream::{FuturesUnordered, StreamExt};
use sagacore::{
    DefinitionError, EngineError, EventBus, EventId, ExecutionEvent, InstanceId,
    PersistenceError, PersistenceProvider, PointerStatus, PublishedEvent, Result, WaitingPointer,
    WorkflowDefinition, WorkflowInstance, WorkflowStatus,
};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Attempts for external read-modify-write operations before giving up.
const MAX_UPDATE_ATTEMPTS: usize = 5;

/// Configuration for the workflow host
#[derive(Debug, Clone)]
pub struct HostConfig {
    pub poll_interval: Duration,
    pub lease_duration: Duration,
    pub lease_sweep_interval: Duration,
    pub max_concurrent_instances: usize,
    pub max_cycle_rounds: usize,
    /// Retries allowed per pointer before the instance is suspended. `None` retries forever.
    pub max_retries: Option<u32>,
    pub event_buffer_size: usize,
    /// How long an undelivered event waits for a subscriber before it is dropped.
    pub event_retention: Duration,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(500),
            lease_duration: Duration::from_secs(30),
            lease_sweep_interval: Duration::from_secs(10),
            max_concurrent_instances: 10,
            max_cycle_rounds: 128,
            max_retries: None,
            event_buffer_size: 1000,
            event_retention: Duration::from_secs(24 * 60 * 60),
        }
    }
}

impl HostConfig {
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_lease_duration(mut self, duration: Duration) -> Self {
        self.lease_duration = duration;
        self
    }

    pub fn with_lease_sweep_interval(mut self, interval: Duration) -> Self {
        self.lease_sweep_interval = interval;
        self
    }

    pub fn with_max_concurrent_instances(mut self, max: usize) -> Self {
        self.max_concurrent_instances = max.max(1);
        self
    }

    pub fn with_max_cycle_rounds(mut self, rounds: usize) -> Self {
        self.max_cycle_rounds = rounds;
        self
    }

    pub fn with_max_retries(mut self, max: Option<u32>) -> Self {
        self.max_retries = max;
        self
    }

    pub fn with_event_retention(mut self, retention: Duration) -> Self {
        self.event_retention = retention;
        self
    }
}

/// What one host poll did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PollReport {
    pub events_delivered: usize,
    /// Events dropped after outliving `event_retention` without a subscriber.
    pub events_expired: usize,
    pub instances_processed: usize,
    /// Cycles thrown away because another writer got there first.
    pub conflicts: usize,
    pub skipped: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CycleOutcome {
    Persisted,
    Conflict,
    Skipped,
}

struct Running {
    token: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

/// Runtime context for executing workflows.
///
/// Owns the registries, the persistence provider, the shared executor and the
/// background tasks. Cheap to clone; clones share everything.
#[derive(Clone)]
pub struct WorkflowHost {
    definitions: Arc<DefinitionRegistry>,
    steps: Arc<StepRegistry>,
    persistence: Arc<dyn PersistenceProvider>,
    executor: Arc<WorkflowExecutor>,
    event_bus: Arc<EventBus>,
    config: HostConfig,
    worker_id: Arc<str>,
    workers: Arc<Semaphore>,
    running: Arc<Mutex<Option<Running>>>,
}

impl WorkflowHost {
    /// Create a host with default settings
    pub fn new(steps: StepRegistry, persistence: Arc<dyn PersistenceProvider>) -> Self {
        Self::with_config(steps, persistence, HostConfig::default())
    }

    pub fn with_config(
        steps: StepRegistry,
        persistence: Arc<dyn PersistenceProvider>,
        config: HostConfig,
    ) -> Self {
        let steps = Arc::new(steps);
        let event_bus = Arc::new(EventBus::new(config.event_buffer_size));
        let executor = Arc::new(
            WorkflowExecutor::new(steps.clone(), event_bus.clone())
                .with_limits(config.max_cycle_rounds, config.max_retries),
        );

        Self {
            definitions: Arc::new(DefinitionRegistry::new()),
            steps,
            persistence,
            executor,
            event_bus,
            workers: Arc::new(Semaphore::new(config.max_concurrent_instances.max(1))),
            config,
            worker_id: Arc::from(format!("worker-{}", Uuid::new_v4())),
            running: Arc::new(Mutex::new(None)),
        }
    }

    pub fn definitions(&self) -> &Arc<DefinitionRegistry> {
        &self.definitions
    }

    pub fn steps(&self) -> &Arc<StepRegistry> {
        &self.steps
    }

    pub fn persistence(&self) -> &Arc<dyn PersistenceProvider> {
        &self.persistence
    }

    pub fn event_bus(&self) -> &Arc<EventBus> {
        &self.event_bus
    }

    pub fn config(&self) -> &HostConfig {
        &self.config
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Subscribe to execution events
    pub fn subscribe_events(&self) -> broadcast::Receiver<ExecutionEvent> {
        self.event_bus.subscribe()
    }

    /// Validate and register a definition. Every body tag it references must
    /// already be known to the step registry.
    pub async fn register_workflow(
        &self,
        definition: WorkflowDefinition,
    ) -> Result<Arc<WorkflowDefinition>> {
        if let Some(step) = definition
            .steps
            .iter()
            .find(|s| !self.steps.contains(&s.body))
        {
            return Err(DefinitionError::Invalid(format!(
                "step {} uses unregistered body type '{}'",
                step.display_name(),
                step.body
            ))
            .into());
        }

        Ok(self.definitions.register(definition).await?)
    }

    /// Create a new instance at the definition's initial step. `version`
    /// defaults to the latest registered one.
    pub async fn start_workflow(
        &self,
        definition_id: &str,
        version: Option<u32>,
        data: Value,
    ) -> Result<InstanceId> {
        let definition = match version {
            Some(version) => self.definitions.get(definition_id, version).await,
            None => self.definitions.latest(definition_id).await,
        }
        .ok_or_else(|| EngineError::UnknownDefinition {
            id: definition_id.to_string(),
            version,
        })?;

        let instance = WorkflowInstance::new(&definition, data);
        let id = self.persistence.create_instance(instance).await?;

        tracing::info!(
            instance = %id,
            workflow = %definition.id,
            version = definition.version,
            "Workflow started"
        );
        self.event_bus.emit(ExecutionEvent::WorkflowStarted {
            instance_id: id,
            workflow_id: definition.id.clone(),
            version: definition.version,
            timestamp: Utc::now(),
        });
        Ok(id)
    }

    /// Store an event for delivery on the next poll. `effective_date` defaults to now.
    pub async fn publish_event(
        &self,
        name: &str,
        key: &str,
        data: Value,
        effective_date: Option<DateTime<Utc>>,
    ) -> Result<EventId> {
        let time = effective_date.unwrap_or_else(Utc::now);
        let id = self
            .persistence
            .publish_event(PublishedEvent::new(name, key, data, time))
            .await?;

        tracing::debug!(event = %id, name, key, "Event published");
        self.event_bus.emit(ExecutionEvent::EventPublished {
            name: name.to_string(),
            key: key.to_string(),
            timestamp: time,
        });
        Ok(id)
    }

    pub async fn get_instance(&self, id: InstanceId) -> Result<WorkflowInstance> {
        self.persistence.get_instance(id).await.map_err(|e| match e {
            PersistenceError::InstanceNotFound(id) => EngineError::UnknownInstance(id),
            other => other.into(),
        })
    }

    /// Returns `false` if the instance was not Runnable.
    pub async fn suspend_instance(&self, id: InstanceId) -> Result<bool> {
        let changed = self
            .update_instance(id, |instance| {
                if instance.status != WorkflowStatus::Runnable {
                    return false;
                }
                instance.status = WorkflowStatus::Suspended;
                true
            })
            .await?;

        if changed {
            tracing::info!(instance = %id, "Workflow suspended");
            self.event_bus.emit(ExecutionEvent::WorkflowSuspended {
                instance_id: id,
                timestamp: Utc::now(),
            });
        }
        Ok(changed)
    }

    /// Returns `false` if the instance was not Suspended.
    pub async fn resume_instance(&self, id: InstanceId) -> Result<bool> {
        let changed = self
            .update_instance(id, |instance| {
                if instance.status != WorkflowStatus::Suspended {
                    return false;
                }
                for pointer in instance
                    .execution_pointers
                    .iter_mut()
                    .filter(|p| p.status == PointerStatus::Suspended)
                {
                    pointer.status = PointerStatus::Pending;
                    pointer.sleep_until = None;
                }
                instance.status = WorkflowStatus::Runnable;
                instance.next_execution = Some(Utc::now());
                true
            })
            .await?;

        if changed {
            tracing::info!(instance = %id, "Workflow resumed");
            self.event_bus.emit(ExecutionEvent::WorkflowResumed {
                instance_id: id,
                timestamp: Utc::now(),
            });
        }
        Ok(changed)
    }

    /// Returns `false` if the instance had already finished.
    pub async fn terminate_instance(&self, id: InstanceId) -> Result<bool> {
        let changed = self
            .update_instance(id, |instance| {
                if instance.status.is_terminal() {
                    return false;
                }
                let now = Utc::now();
                instance.status = WorkflowStatus::Terminated;
                instance.complete_time = Some(now);
                instance.next_execution = None;
                true
            })
            .await?;

        if changed {
            tracing::info!(instance = %id, "Workflow terminated");
            self.event_bus.emit(ExecutionEvent::WorkflowTerminated {
                instance_id: id,
                timestamp: Utc::now(),
            });
        }
        Ok(changed)
    }

    /// Load, mutate and write back under the revision check, retrying on conflict.
    async fn update_instance<F>(&self, id: InstanceId, mut apply: F) -> Result<bool>
    where
        F: FnMut(&mut WorkflowInstance) -> bool + Send,
    {
        let mut last_conflict = None;
        for _ in 0..MAX_UPDATE_ATTEMPTS {
            let mut instance = self.get_instance(id).await?;
            if !apply(&mut instance) {
                return Ok(false);
            }
            match self
                .persistence
                .persist_instance(&instance, instance.revision)
                .await
            {
                Ok(_) => return Ok(true),
                Err(e @ PersistenceError::VersionConflict { .. }) => {
                    tracing::debug!(instance = %id, "Revision conflict, reloading");
                    last_conflict = Some(e);
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(last_conflict
            .unwrap_or(PersistenceError::Backend("update retries exhausted".into()))
            .into())
    }

    /// Start the background poll loop and lease sweeper. Calling it twice is a no-op.
    pub async fn start(&self) {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return;
        }

        let token = CancellationToken::new();
        let poller = tokio::spawn(self.clone().poll_loop(token.clone()));
        let sweeper = tokio::spawn(self.clone().sweep_loop(token.clone()));
        *running = Some(Running {
            token,
            handles: vec![poller, sweeper],
        });

        tracing::info!(
            worker = %self.worker_id,
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            "Workflow host started"
        );
    }

    /// Cancel the background tasks and wait for them. In-flight cycles finish first.
    pub async fn stop(&self) {
        let Some(running) = self.running.lock().await.take() else {
            return;
        };
        running.token.cancel();
        for handle in running.handles {
            if let Err(e) = handle.await {
                tracing::error!("Host task failed: {}", e);
            }
        }
        tracing::info!(worker = %self.worker_id, "Workflow host stopped");
    }

    async fn poll_loop(self, token: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.poll_once().await {
                        tracing::error!("Poll failed: {}", e);
                    }
                }
            }
        }
    }

    async fn sweep_loop(self, token: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.lease_sweep_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.sweep_expired_leases().await {
                        tracing::error!("Lease sweep failed: {}", e);
                    }
                }
            }
        }
    }

    /// Clear leases left behind by crashed or stalled workers.
    pub async fn sweep_expired_leases(&self) -> Result<Vec<InstanceId>> {
        let reclaimed = self.persistence.reclaim_expired_leases(Utc::now()).await?;
        if !reclaimed.is_empty() {
            tracing::info!(count = reclaimed.len(), "Reclaimed expired leases");
        }
        Ok(reclaimed)
    }

    /// Deliver pending events, then run one cycle for every due instance.
    pub async fn poll_once(&self) -> Result<PollReport> {
        let (events_delivered, events_expired) = self.process_events().await?;
        let mut report = PollReport {
            events_delivered,
            events_expired,
            ..PollReport::default()
        };

        let due = self.persistence.get_runnable_instances(Utc::now()).await?;
        let mut tasks = FuturesUnordered::new();
        for id in due {
            let permit = self
                .workers
                .clone()
                .acquire_owned()
                .await
                .map_err(|_| EngineError::Shutdown)?;
            let host = self.clone();
            tasks.push(tokio::spawn(async move {
                let _permit = permit;
                host.process_instance(id).await
            }));
        }

        while let Some(joined) = tasks.next().await {
            match joined {
                Ok(CycleOutcome::Persisted) => report.instances_processed += 1,
                Ok(CycleOutcome::Conflict) => report.conflicts += 1,
                Ok(CycleOutcome::Skipped) => report.skipped += 1,
                Err(e) => tracing::error!("Worker task failed: {}", e),
            }
        }
        Ok(report)
    }

    async fn process_instance(&self, id: InstanceId) -> CycleOutcome {
        if let Err(e) = self
            .persistence
            .acquire_lease(id, &self.worker_id, self.config.lease_duration)
            .await
        {
            if !e.is_conflict() {
                tracing::warn!(instance = %id, "Could not lease instance: {}", e);
            }
            return CycleOutcome::Skipped;
        }

        let outcome = match self.run_cycle(id).await {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::error!(instance = %id, "Cycle failed: {}", e);
                CycleOutcome::Skipped
            }
        };

        if let Err(e) = self.persistence.release_lease(id, &self.worker_id).await {
            tracing::warn!(instance = %id, "Lease release failed: {}", e);
        }
        outcome
    }

    async fn run_cycle(&self, id: InstanceId) -> Result<CycleOutcome> {
        let mut instance = self.get_instance(id).await?;
        if instance.status != WorkflowStatus::Runnable {
            return Ok(CycleOutcome::Skipped);
        }

        let definition = self
            .definitions
            .get(&instance.workflow_definition_id, instance.version)
            .await
            .ok_or_else(|| EngineError::UnknownDefinition {
                id: instance.workflow_definition_id.clone(),
                version: Some(instance.version),
            })?;

        let expected = instance.revision;
        let report = self.executor.execute(&mut instance, &definition).await;

        match self.persistence.persist_instance(&instance, expected).await {
            Ok(revision) => {
                tracing::debug!(
                    instance = %id,
                    revision,
                    steps = report.steps_executed,
                    "Cycle persisted"
                );
                Ok(CycleOutcome::Persisted)
            }
            Err(e) if e.is_conflict() => {
                tracing::warn!(instance = %id, "Discarding cycle: {}", e);
                Ok(CycleOutcome::Conflict)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Returns how many events were consumed and how many expired.
    async fn process_events(&self) -> Result<(usize, usize)> {
        let now = Utc::now();
        let mut delivered = 0;
        let mut expired = 0;
        for event in self.persistence.get_unprocessed_events().await? {
            match self.persistence.mark_event_processed(event.id).await {
                Ok(()) => {}
                // claimed by another worker
                Err(PersistenceError::AlreadyProcessed) => continue,
                Err(e) => return Err(e.into()),
            }

            let consumed = match self.deliver_event(&event).await {
                Ok(consumed) => consumed,
                Err(e) => {
                    tracing::warn!(event = %event.id, "Event delivery failed: {}", e);
                    false
                }
            };

            if consumed {
                delivered += 1;
            } else if deadline(event.time, self.config.event_retention) <= now {
                // the claim is kept, so the event is never scanned again
                tracing::warn!(
                    event = %event.id,
                    name = %event.name,
                    key = %event.key,
                    "Event expired without a subscriber"
                );
                expired += 1;
            } else {
                self.persistence.mark_event_unprocessed(event.id).await?;
            }
        }
        Ok((delivered, expired))
    }

    /// Wake the earliest waiting pointer, if it can be leased right now.
    async fn deliver_event(&self, event: &PublishedEvent) -> Result<bool> {
        let candidates = self
            .persistence
            .get_matching_waiting_pointers(&event.name, &event.key, event.time)
            .await?;
        let Some(waiting) = candidates.into_iter().next() else {
            return Ok(false);
        };

        match self
            .persistence
            .acquire_lease(waiting.instance_id, &self.worker_id, self.config.lease_duration)
            .await
        {
            Ok(()) => {}
            Err(e) if e.is_conflict() => {
                tracing::debug!(instance = %waiting.instance_id, "Instance busy, holding event");
                return Ok(false);
            }
            Err(e) => return Err(e.into()),
        }

        let woken = self.wake_pointer(&waiting, event).await;
        if let Err(e) = self
            .persistence
            .release_lease(waiting.instance_id, &self.worker_id)
            .await
        {
            tracing::warn!(instance = %waiting.instance_id, "Lease release failed: {}", e);
        }
        woken
    }

    async fn wake_pointer(&self, waiting: &WaitingPointer, event: &PublishedEvent) -> Result<bool> {
        let mut instance = self.get_instance(waiting.instance_id).await?;
        if instance.status != WorkflowStatus::Runnable {
            return Ok(false);
        }

        let Some(pointer) = instance.pointer_mut(waiting.pointer_id) else {
            return Ok(false);
        };
        if pointer.status != PointerStatus::WaitingForEvent || pointer.event_published {
            return Ok(false);
        }
        pointer.status = PointerStatus::Pending;
        pointer.event_published = true;
        pointer.event_data = Some(event.data.clone());
        instance.next_execution = Some(Utc::now());

        match self
            .persistence
            .persist_instance(&instance, instance.revision)
            .await
        {
            Ok(_) => {}
            Err(e) if e.is_conflict() => return Ok(false),
            Err(e) => return Err(e.into()),
        }

        tracing::debug!(
            instance = %waiting.instance_id,
            pointer = %waiting.pointer_id,
            event = %event.name,
            "Event consumed"
        );
        self.event_bus.emit(ExecutionEvent::EventConsumed {
            name: event.name.clone(),
            key: event.key.clone(),
            instance_id: waiting.instance_id,
            pointer_id: waiting.pointer_id,
            timestamp: Utc::now(),
        });
        Ok(true)
    }
}
