//! Action registry: recognized action names and typed argument validation.

pub mod args;
pub mod registry;

pub use registry::{
    Action, ActionRequest, AudioPlayArgs, AudioStopArgs, AvStreamArgs, TestPromptArgs, TtsSayArgs,
    ValidationError, validate,
};
