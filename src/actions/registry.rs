//! Static action table and pre-dispatch validation.
//!
//! Every command passes through [`validate`] before any handler runs. A
//! command that fails here is acked `error` without side effects.

use super::args::ArgReader;
use crate::bundle::BundleDescriptor;
use crate::nms::Command;
use crate::process::{Slot, StopSignal};
use crate::voice::{ScriptEntry, VoiceMode};
use std::time::Duration;

/// Categories the NMS may attach to a command. Empty is always accepted.
pub const ALLOWED_CATEGORIES: &[&str] = &["scan", "av", "audio", "tts", "voice", "bundle"];

/// Reasons a command is rejected before execution.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("unknown action={0}")]
    UnknownAction(String),

    #[error("{action} missing args.{arg}")]
    MissingArgument { action: &'static str, arg: String },

    #[error("{action} malformed args.{arg}: expected {expected}")]
    MalformedArgument {
        action: &'static str,
        arg: String,
        expected: String,
    },

    #[error("malformed args: {0}")]
    MalformedArgs(String),

    #[error("unsupported category={0}")]
    UnsupportedCategory(String),

    #[error("malformed execute_at={0:?}")]
    MalformedExecuteAt(String),

    #[error("invalid bundle_id={0:?}: only letters, digits and single dots are allowed")]
    InvalidBundleId(String),
}

/// Recognized action names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    ScanStart,
    ScanStop,
    ScanOnce,
    BundleApply,
    AvStreamStart,
    AvStreamStop,
    AudioPlay,
    AudioStop,
    TtsSay,
    VoiceModeSet,
    VoiceScriptSet,
    VoiceTestPrompt,
}

impl Action {
    pub const ALL: [Self; 12] = [
        Self::ScanStart,
        Self::ScanStop,
        Self::ScanOnce,
        Self::BundleApply,
        Self::AvStreamStart,
        Self::AvStreamStop,
        Self::AudioPlay,
        Self::AudioStop,
        Self::TtsSay,
        Self::VoiceModeSet,
        Self::VoiceScriptSet,
        Self::VoiceTestPrompt,
    ];

    /// Render action name to wire format.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ScanStart => "scan.start",
            Self::ScanStop => "scan.stop",
            Self::ScanOnce => "scan.once",
            Self::BundleApply => "bundle.apply",
            Self::AvStreamStart => "av.stream.start",
            Self::AvStreamStop => "av.stream.stop",
            Self::AudioPlay => "audio.play",
            Self::AudioStop => "audio.stop",
            Self::TtsSay => "tts.say",
            Self::VoiceModeSet => "voice.mode.set",
            Self::VoiceScriptSet => "voice.script.set",
            Self::VoiceTestPrompt => "voice.test.prompt",
        }
    }

    /// Parse an action name from wire format.
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|a| a.as_str() == raw)
    }

    /// Process slots a handler may leave running if its wait is cut short.
    #[must_use]
    pub fn owned_slots(self) -> &'static [Slot] {
        match self {
            Self::ScanOnce => &[Slot::Scan],
            Self::TtsSay => &[Slot::Tts],
            Self::VoiceTestPrompt => &[Slot::Beep, Slot::Tts],
            _ => &[],
        }
    }
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AvStreamArgs {
    pub server: Option<String>,
    pub port: Option<u16>,
    pub path: Option<String>,
    pub transport: Option<String>,
    pub video_dev: Option<String>,
    pub audio_dev: Option<String>,
    pub size: Option<String>,
    pub fps: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioPlayArgs {
    pub file: String,
    pub ao: Option<String>,
    pub audio_device: Option<String>,
    pub volume: Option<u8>,
    /// Per-call override of the configured replace policy.
    pub stop_existing: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioStopArgs {
    pub grace: Option<Duration>,
    pub signal: StopSignal,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TtsSayArgs {
    pub text: String,
    pub lead_silence_ms: Option<u32>,
    pub volume: Option<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestPromptArgs {
    pub text: Option<String>,
    pub beep: bool,
}

/// A validated command, ready for its handler.
#[derive(Debug, Clone, PartialEq)]
pub enum ActionRequest {
    ScanStart,
    ScanStop,
    ScanOnce,
    BundleApply(BundleDescriptor),
    AvStreamStart(AvStreamArgs),
    AvStreamStop,
    AudioPlay(AudioPlayArgs),
    AudioStop(AudioStopArgs),
    TtsSay(TtsSayArgs),
    /// The target is checked against the external transition rules by the
    /// voice state machine, not here.
    VoiceModeSet(VoiceMode),
    VoiceScriptSet(Vec<ScriptEntry>),
    VoiceTestPrompt(TestPromptArgs),
}

impl ActionRequest {
    #[must_use]
    pub fn action(&self) -> Action {
        match self {
            Self::ScanStart => Action::ScanStart,
            Self::ScanStop => Action::ScanStop,
            Self::ScanOnce => Action::ScanOnce,
            Self::BundleApply(_) => Action::BundleApply,
            Self::AvStreamStart(_) => Action::AvStreamStart,
            Self::AvStreamStop => Action::AvStreamStop,
            Self::AudioPlay(_) => Action::AudioPlay,
            Self::AudioStop(_) => Action::AudioStop,
            Self::TtsSay(_) => Action::TtsSay,
            Self::VoiceModeSet(_) => Action::VoiceModeSet,
            Self::VoiceScriptSet(_) => Action::VoiceScriptSet,
            Self::VoiceTestPrompt(_) => Action::VoiceTestPrompt,
        }
    }
}

/// Validate a command and decode its arguments.
///
/// # Errors
///
/// Returns the first unmet precondition: malformed argument container,
/// unsupported category, unknown action, then per-argument checks.
pub fn validate(cmd: &Command) -> Result<ActionRequest, ValidationError> {
    if let Some(reason) = &cmd.args_error {
        return Err(ValidationError::MalformedArgs(reason.clone()));
    }
    if !cmd.category.is_empty() && !ALLOWED_CATEGORIES.contains(&cmd.category.as_str()) {
        return Err(ValidationError::UnsupportedCategory(cmd.category.clone()));
    }
    let action =
        Action::parse(&cmd.action).ok_or_else(|| ValidationError::UnknownAction(cmd.action.clone()))?;
    let args = ArgReader::new(action.as_str(), &cmd.args);

    let request = match action {
        Action::ScanStart => ActionRequest::ScanStart,
        Action::ScanStop => ActionRequest::ScanStop,
        Action::ScanOnce => ActionRequest::ScanOnce,
        Action::AvStreamStop => ActionRequest::AvStreamStop,
        Action::BundleApply => {
            let bundle_id = args.required_str(&["bundle_id"])?;
            let url = args.required_str(&["url", "source_url"])?;
            let checksum = args.optional_str(&["checksum"])?;
            ActionRequest::BundleApply(BundleDescriptor::parse(
                &bundle_id,
                &url,
                checksum.as_deref(),
            )?)
        }
        Action::AvStreamStart => ActionRequest::AvStreamStart(AvStreamArgs {
            server: args.optional_str(&["server"])?,
            port: args.optional_int("port", 1, 65_535)?.map(|n| n as u16),
            path: args.optional_str(&["path"])?,
            transport: args.optional_str(&["transport"])?,
            video_dev: args.optional_str(&["video_dev"])?,
            audio_dev: args.optional_str(&["audio_dev"])?,
            size: args.optional_str(&["size"])?,
            fps: args.optional_int("fps", 1, 240)?.map(|n| n as u32),
        }),
        Action::AudioPlay => ActionRequest::AudioPlay(AudioPlayArgs {
            file: args.required_str(&["file"])?,
            ao: args.optional_str(&["ao"])?,
            audio_device: args.optional_str(&["audio_device"])?,
            volume: args.optional_int("volume", 0, 100)?.map(|n| n as u8),
            stop_existing: args.optional_bool("stop_existing")?,
        }),
        Action::AudioStop => {
            let signal = match args.optional_str(&["signal"])? {
                None => StopSignal::Term,
                Some(raw) => StopSignal::parse(&raw)
                    .ok_or_else(|| args.invalid("signal", "one of TERM, INT, HUP, KILL"))?,
            };
            ActionRequest::AudioStop(AudioStopArgs {
                grace: args
                    .optional_int("grace_ms", 0, 60_000)?
                    .map(|ms| Duration::from_millis(ms as u64)),
                signal,
            })
        }
        Action::TtsSay => ActionRequest::TtsSay(TtsSayArgs {
            text: args.required_str(&["text"])?,
            lead_silence_ms: args.optional_int("lead_silence_ms", 0, 10_000)?.map(|n| n as u32),
            volume: args.optional_int("volume", 0, 100)?.map(|n| n as u8),
        }),
        Action::VoiceModeSet => {
            let raw = args.required_str(&["mode"])?;
            let mode = VoiceMode::parse(&raw)
                .ok_or_else(|| args.invalid("mode", "one of deaf, name_listen"))?;
            ActionRequest::VoiceModeSet(mode)
        }
        Action::VoiceScriptSet => {
            let items = args.required_array("commands")?;
            let script = items
                .iter()
                .enumerate()
                .map(|(i, item)| {
                    ScriptEntry::from_value(item).ok_or_else(|| {
                        args.invalid(
                            &format!("commands[{i}]"),
                            "object with a non-empty phrase",
                        )
                    })
                })
                .collect::<Result<Vec<_>, _>>()?;
            ActionRequest::VoiceScriptSet(script)
        }
        Action::VoiceTestPrompt => ActionRequest::VoiceTestPrompt(TestPromptArgs {
            text: args.optional_str(&["text"])?,
            beep: args.optional_bool("beep")?.unwrap_or(true),
        }),
    };
    Ok(request)
}
