//! Core abstractions for the saga workflow engine
//!
//! Definition model, instance and pointer model, the step-body contract,
//! the persistence contract and lifecycle events. Everything that drives
//! execution lives in `sagaruntime`.

mod body;
mod definition;
mod error;
pub mod events;
mod instance;
mod persistence;

pub use body::{
    is_branch_complete, AsAny, EventWait, ExecutionResult, StepBody, StepExecutionContext,
};
pub use definition::{
    ErrorBehavior, InputBinding, OutputBinding, StepId, StepOutcome, WorkflowDefinition,
    WorkflowStep,
};
pub use error::{DefinitionError, EngineError, PersistenceError, StepError};
pub use events::{EventBus, ExecutionEvent};
pub use instance::{
    ExecutionErrorRecord, ExecutionPointer, InstanceId, PointerId, PointerStatus,
    WorkflowInstance, WorkflowStatus,
};
pub use persistence::{EventId, PersistenceProvider, PublishedEvent, WaitingPointer};

/// Result type for engine operations
pub type Result<T> = std::result::Result<T, EngineError>;
