use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sagacore::{
    EventId, InstanceId, PersistenceError, PersistenceProvider, PointerStatus, PublishedEvent,
    WaitingPointer, WorkflowInstance, WorkflowStatus,
};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::RwLock;

use crate::executor::deadline;

#[derive(Default)]
struct MemoryState {
    instances: HashMap<InstanceId, WorkflowInstance>,
    events: Vec<PublishedEvent>,
}

/// In-process persistence provider.
///
/// Every operation runs under one lock, which makes lease acquisition and
/// revision checks atomic. State is lost when the process exits.
#[derive(Default)]
pub struct MemoryPersistence {
    state: RwLock<MemoryState>,
}

impl MemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn instance_count(&self) -> usize {
        self.state.read().await.instances.len()
    }
}

#[async_trait]
impl PersistenceProvider for MemoryPersistence {
    async fn create_instance(
        &self,
        instance: WorkflowInstance,
    ) -> Result<InstanceId, PersistenceError> {
        let id = instance.id;
        self.state.write().await.instances.insert(id, instance);
        Ok(id)
    }

    async fn get_instance(&self, id: InstanceId) -> Result<WorkflowInstance, PersistenceError> {
        self.state
            .read()
            .await
            .instances
            .get(&id)
            .cloned()
            .ok_or(PersistenceError::InstanceNotFound(id))
    }

    async fn persist_instance(
        &self,
        instance: &WorkflowInstance,
        expected_revision: u64,
    ) -> Result<u64, PersistenceError> {
        let mut state = self.state.write().await;
        let stored = state
            .instances
            .get_mut(&instance.id)
            .ok_or(PersistenceError::InstanceNotFound(instance.id))?;

        if stored.revision != expected_revision {
            return Err(PersistenceError::VersionConflict {
                expected: expected_revision,
                actual: stored.revision,
            });
        }

        let mut next = instance.clone();
        next.locked_by = stored.locked_by.take();
        next.locked_until = stored.locked_until;
        next.revision = expected_revision + 1;
        *stored = next;
        Ok(expected_revision + 1)
    }

    async fn get_runnable_instances(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<InstanceId>, PersistenceError> {
        let state = self.state.read().await;
        let mut due: Vec<&WorkflowInstance> = state
            .instances
            .values()
            .filter(|i| {
                i.status == WorkflowStatus::Runnable
                    && i.next_execution.is_some_and(|next| next <= now)
                    && !i.is_leased(now)
            })
            .collect();
        due.sort_by_key(|i| i.next_execution);
        Ok(due.into_iter().map(|i| i.id).collect())
    }

    async fn acquire_lease(
        &self,
        id: InstanceId,
        worker_id: &str,
        duration: Duration,
    ) -> Result<(), PersistenceError> {
        let now = Utc::now();
        let mut state = self.state.write().await;
        let stored = state
            .instances
            .get_mut(&id)
            .ok_or(PersistenceError::InstanceNotFound(id))?;

        if stored.is_leased(now) {
            return Err(PersistenceError::AlreadyLeased {
                holder: stored.locked_by.clone().unwrap_or_default(),
            });
        }

        stored.locked_by = Some(worker_id.to_string());
        stored.locked_until = Some(deadline(now, duration));
        Ok(())
    }

    async fn release_lease(&self, id: InstanceId, worker_id: &str) -> Result<(), PersistenceError> {
        let mut state = self.state.write().await;
        let stored = state
            .instances
            .get_mut(&id)
            .ok_or(PersistenceError::InstanceNotFound(id))?;

        match stored.locked_by.as_deref() {
            None => Ok(()),
            Some(holder) if holder == worker_id => {
                stored.locked_by = None;
                stored.locked_until = None;
                Ok(())
            }
            // our lease lapsed and another worker holds it now
            Some(_) => Err(PersistenceError::LeaseExpired),
        }
    }

    async fn reclaim_expired_leases(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<InstanceId>, PersistenceError> {
        let mut state = self.state.write().await;
        let mut reclaimed = Vec::new();
        for instance in state.instances.values_mut() {
            if instance.locked_by.is_some() && !instance.is_leased(now) {
                instance.locked_by = None;
                instance.locked_until = None;
                reclaimed.push(instance.id);
            }
        }
        Ok(reclaimed)
    }

    async fn publish_event(&self, event: PublishedEvent) -> Result<EventId, PersistenceError> {
        let id = event.id;
        self.state.write().await.events.push(event);
        Ok(id)
    }

    async fn get_unprocessed_events(&self) -> Result<Vec<PublishedEvent>, PersistenceError> {
        let state = self.state.read().await;
        Ok(state.events.iter().filter(|e| !e.processed).cloned().collect())
    }

    async fn mark_event_processed(&self, id: EventId) -> Result<(), PersistenceError> {
        let mut state = self.state.write().await;
        let event = state
            .events
            .iter_mut()
            .find(|e| e.id == id)
            .ok_or(PersistenceError::EventNotFound(id))?;
        if event.processed {
            return Err(PersistenceError::AlreadyProcessed);
        }
        event.processed = true;
        Ok(())
    }

    async fn mark_event_unprocessed(&self, id: EventId) -> Result<(), PersistenceError> {
        let mut state = self.state.write().await;
        let event = state
            .events
            .iter_mut()
            .find(|e| e.id == id)
            .ok_or(PersistenceError::EventNotFound(id))?;
        event.processed = false;
        Ok(())
    }

    async fn get_matching_waiting_pointers(
        &self,
        name: &str,
        key: &str,
        timestamp: DateTime<Utc>,
    ) -> Result<Vec<WaitingPointer>, PersistenceError> {
        let state = self.state.read().await;
        let mut matches: Vec<(DateTime<Utc>, WaitingPointer)> = Vec::new();

        for instance in state
            .instances
            .values()
            .filter(|i| i.status == WorkflowStatus::Runnable)
        {
            for pointer in &instance.execution_pointers {
                let waiting = pointer.status == PointerStatus::WaitingForEvent
                    && !pointer.event_published
                    && pointer.event_name.as_deref() == Some(name)
                    && pointer.event_key.as_deref() == Some(key);
                let Some(effective_date) = pointer.effective_date else {
                    continue;
                };
                if waiting && effective_date <= timestamp {
                    matches.push((
                        instance.create_time,
                        WaitingPointer {
                            instance_id: instance.id,
                            pointer_id: pointer.id,
                            effective_date,
                        },
                    ));
                }
            }
        }

        matches.sort_by(|(ca, a), (cb, b)| {
            a.effective_date.cmp(&b.effective_date).then(ca.cmp(cb))
        });
        Ok(matches.into_iter().map(|(_, w)| w).collect())
    }
}
