//! Error types for the scanner agent.

use crate::actions::ValidationError;
use crate::bundle::DeployError;
use crate::voice::VoiceError;

/// Top-level error type for the agent.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    /// Configuration load or validation error.
    #[error("config error: {0}")]
    Config(String),

    /// Device identity could not be read or bootstrapped.
    #[error("identity error: {0}")]
    Identity(String),

    /// NMS transport or protocol error.
    #[error("NMS error: {0}")]
    Nms(String),

    /// Command rejected before any side effect.
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// Child process spawn, signal or exit error.
    #[error("process error: {0}")]
    Process(String),

    /// Bundle deployment failed at a named step.
    #[error(transparent)]
    Bundle(#[from] DeployError),

    /// Voice state machine error.
    #[error(transparent)]
    Voice(#[from] VoiceError),

    /// External completion service error.
    #[error("LLM error: {0}")]
    Llm(String),

    /// systemd unit control error.
    #[error("service error: {0}")]
    Service(String),

    /// A bounded wait elapsed.
    #[error("timeout: {0}")]
    Timeout(String),

    /// The agent is shutting down and refuses new work.
    #[error("agent is shutting down")]
    ShutDown,

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience result type.
pub type Result<T> = std::result::Result<T, AgentError>;

/// Maps a poisoned lock into an error instead of panicking.
pub(crate) fn poisoned<T>(what: &str) -> impl FnOnce(T) -> AgentError + '_ {
    move |_| AgentError::Process(format!("{what} lock poisoned"))
}
