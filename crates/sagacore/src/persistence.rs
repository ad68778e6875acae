use crate::{InstanceId, PersistenceError, PointerId, WorkflowInstance};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use uuid::Uuid;

pub type EventId = Uuid;

/// External event as published through the host.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PublishedEvent {
    pub id: EventId,
    pub name: String,
    pub key: String,
    pub data: Value,
    pub time: DateTime<Utc>,
    pub processed: bool,
}

impl PublishedEvent {
    pub fn new(
        name: impl Into<String>,
        key: impl Into<String>,
        data: Value,
        time: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            key: key.into(),
            data,
            time,
            processed: false,
        }
    }
}

/// A pointer parked on an event subscription.
#[derive(Debug, Clone, PartialEq)]
pub struct WaitingPointer {
    pub instance_id: InstanceId,
    pub pointer_id: PointerId,
    pub effective_date: DateTime<Utc>,
}

/// Storage contract the engine runs against.
///
/// Implementations must make `persist_instance` atomic per call and keep
/// lease fields under the control of the lease methods only.
#[async_trait]
pub trait PersistenceProvider: Send + Sync {
    async fn create_instance(
        &self,
        instance: WorkflowInstance,
    ) -> Result<InstanceId, PersistenceError>;

    async fn get_instance(&self, id: InstanceId) -> Result<WorkflowInstance, PersistenceError>;

    /// Write `instance` if the stored revision equals `expected_revision`.
    /// Returns the new revision.
    async fn persist_instance(
        &self,
        instance: &WorkflowInstance,
        expected_revision: u64,
    ) -> Result<u64, PersistenceError>;

    /// Runnable, due and not validly leased.
    async fn get_runnable_instances(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<InstanceId>, PersistenceError>;

    async fn acquire_lease(
        &self,
        id: InstanceId,
        worker_id: &str,
        duration: Duration,
    ) -> Result<(), PersistenceError>;

    async fn release_lease(&self, id: InstanceId, worker_id: &str) -> Result<(), PersistenceError>;

    /// Clear leases whose expiry has passed. Returns the reclaimed instances.
    async fn reclaim_expired_leases(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<InstanceId>, PersistenceError>;

    async fn publish_event(&self, event: PublishedEvent) -> Result<EventId, PersistenceError>;

    /// Unprocessed events in publish order.
    async fn get_unprocessed_events(&self) -> Result<Vec<PublishedEvent>, PersistenceError>;

    /// Claim an event. Fails with `AlreadyProcessed` if another caller got there first.
    async fn mark_event_processed(&self, id: EventId) -> Result<(), PersistenceError>;

    async fn mark_event_unprocessed(&self, id: EventId) -> Result<(), PersistenceError>;

    /// Pointers waiting on `name`/`key` whose effective date is not after `timestamp`,
    /// earliest effective date first.
    async fn get_matching_waiting_pointers(
        &self,
        name: &str,
        key: &str,
        timestamp: DateTime<Utc>,
    ) -> Result<Vec<WaitingPointer>, PersistenceError>;
}
