//! Shared type definitions for the apkflow crates.
//!
//! - [`pipeline`]: step identities, statuses and the events the orchestrator publishes.
//! - [`tool`]: identities and resolved descriptors of the external Java tools.

pub mod pipeline;
pub mod tool;

pub use pipeline::{
    IN_FLIGHT_PROGRESS_CEILING, MAX_PROGRESS, OutputStream, PipelineEvent, PipelineStep, StepId, StepKind, StepStatus,
    TransitionError,
};
pub use tool::{ToolDescriptor, ToolId};
