//! Voice interaction: mode state machine, matching, and the audio loop.

pub mod config;
pub mod llm;
pub mod machine;
pub mod matcher;
pub mod output;
pub mod service;
pub mod speech;
pub mod state;

pub use config::{RecordWatcher, VoiceRecord};
pub use llm::{CompletionClient, ResponsesClient};
pub use machine::{VoiceMachine, VoiceSettings, VoiceSnapshot};
pub use output::VoiceOutput;
pub use service::{VoiceService, VoiceServiceDeps};
pub use speech::{CommandRecognizer, SpeechSource};
pub use state::{ScriptAction, ScriptEntry, Transition, TransitionOrigin, VoiceMode, demo_script};

/// Voice state machine errors. The state is unchanged whenever one is returned.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum VoiceError {
    #[error("illegal voice transition {from} -> {to} ({origin})")]
    IllegalTransition {
        from: VoiceMode,
        to: VoiceMode,
        origin: TransitionOrigin,
    },

    /// Heavy modes are entered only by the device's own detection.
    #[error("voice mode {0} cannot be requested externally (allowed: deaf, name_listen)")]
    ExternalTargetRefused(VoiceMode),

    #[error("voice subsystem is shutting down")]
    ShutDown,

    #[error("voice state lock poisoned")]
    Poisoned,
}
