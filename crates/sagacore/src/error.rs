use crate::StepId;
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Definition error: {0}")]
    Definition(#[from] DefinitionError),

    #[error("Persistence error: {0}")]
    Persistence(#[from] PersistenceError),

    #[error("Step error: {0}")]
    Step(#[from] StepError),

    #[error("Unknown workflow definition: {id} (version {version:?})")]
    UnknownDefinition { id: String, version: Option<u32> },

    #[error("Unknown workflow instance: {0}")]
    UnknownInstance(Uuid),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Host is shutting down")]
    Shutdown,
}

#[derive(Error, Debug, Clone)]
pub enum StepError {
    #[error("Missing required input: {0}")]
    MissingInput(String),

    #[error("Invalid input for '{field}': {reason}")]
    InvalidInput { field: String, reason: String },

    #[error("Binding expected body type {expected}")]
    BindingType { expected: &'static str },

    #[error("Unknown step body type: {0}")]
    UnknownBodyType(String),

    #[error("Execution failed: {0}")]
    ExecutionFailed(String),

    #[error("Step {0} did not complete synchronously")]
    Suspended(StepId),

    #[error("Cancelled")]
    Cancelled,
}

impl StepError {
    pub fn failed(message: impl Into<String>) -> Self {
        StepError::ExecutionFailed(message.into())
    }
}

#[derive(Error, Debug)]
pub enum DefinitionError {
    #[error("Invalid workflow definition: {0}")]
    Invalid(String),

    #[error("Workflow {id} v{version} is already registered")]
    AlreadyRegistered { id: String, version: u32 },

    #[error("Step not found: {0}")]
    StepNotFound(StepId),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PersistenceError {
    #[error("Version conflict: expected revision {expected}, found {actual}")]
    VersionConflict { expected: u64, actual: u64 },

    #[error("Instance is leased by {holder}")]
    AlreadyLeased { holder: String },

    #[error("Lease expired")]
    LeaseExpired,

    #[error("Instance not found: {0}")]
    InstanceNotFound(Uuid),

    #[error("Event not found: {0}")]
    EventNotFound(Uuid),

    #[error("Event already processed")]
    AlreadyProcessed,

    #[error("Backend error: {0}")]
    Backend(String),
}

impl PersistenceError {
    /// Conflicts are expected under concurrency and are always safe to retry.
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            PersistenceError::VersionConflict { .. }
                | PersistenceError::AlreadyLeased { .. }
                | PersistenceError::AlreadyProcessed
        )
    }
}
