//! Workflow execution runtime
//!
//! Step-body and definition registries, the pointer executor with its error
//! and compensation handling, an in-memory persistence provider and the host
//! that polls, leases and persists instances.

mod compensation;
mod definitions;
mod error_handling;
mod executor;
mod host;
mod memory;
mod registry;

pub use definitions::{validate, DefinitionRegistry};
pub use executor::{CycleReport, WorkflowExecutor};
pub use host::{HostConfig, PollReport, WorkflowHost};
pub use memory::MemoryPersistence;
pub use registry::{FnStepFactory, StepBodyFactory, StepMetadata, StepRegistry};
