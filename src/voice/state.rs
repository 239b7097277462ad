//! Voice modes, the legal transition table, and the script table entries.
//!
//! ```text
//!            external            internal (wake)          internal (enter.llm)
//!   DEAF  <──────────>  NAME_LISTEN  ───────>  CONVERSATION  ───────>  LLM
//!                           ^   ^                   │                   │
//!                           │   └── timeout ────────┘                   │
//!                           └────────────── timeout / error ────────────┘
//! ```
//!
//! Any state may fall back to `NAME_LISTEN` internally. Only `DEAF` and
//! `NAME_LISTEN` can be requested from outside the device.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Listening mode of the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VoiceMode {
    /// No audio capture.
    Deaf,
    /// Wake-name detection only.
    NameListen,
    /// Full transcription matched against the script table.
    Conversation,
    /// Utterances forwarded to the completion service.
    Llm,
}

impl VoiceMode {
    pub const ALL: [Self; 4] = [Self::Deaf, Self::NameListen, Self::Conversation, Self::Llm];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Deaf => "deaf",
            Self::NameListen => "name_listen",
            Self::Conversation => "conversation",
            Self::Llm => "llm",
        }
    }

    /// Parse a mode name. Case-insensitive; `-` is accepted for `_` and
    /// `llm_dummy` is an alias of `llm`.
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "deaf" => Some(Self::Deaf),
            "name_listen" => Some(Self::NameListen),
            "conversation" => Some(Self::Conversation),
            "llm" | "llm_dummy" => Some(Self::Llm),
            _ => None,
        }
    }

    /// Whether an operator, the GUI or the NMS may request this mode.
    #[must_use]
    pub fn is_externally_reachable(self) -> bool {
        matches!(self, Self::Deaf | Self::NameListen)
    }

    /// Whether the mode runs full transcription.
    #[must_use]
    pub fn transcribes(self) -> bool {
        matches!(self, Self::Conversation | Self::Llm)
    }

    /// Returns `true` if `self → target` is an edge for `origin`.
    ///
    /// # Transition table
    ///
    /// - external: `Deaf → NameListen`, `NameListen → Deaf`
    /// - internal: `NameListen → Conversation`, `Conversation → Llm`,
    ///   and `any → NameListen`
    #[must_use]
    pub fn can_transition_to(self, target: Self, origin: TransitionOrigin) -> bool {
        match origin {
            TransitionOrigin::External => matches!(
                (self, target),
                (Self::Deaf, Self::NameListen) | (Self::NameListen, Self::Deaf)
            ),
            TransitionOrigin::Internal => matches!(
                (self, target),
                (Self::NameListen, Self::Conversation)
                    | (Self::Conversation, Self::Llm)
                    | (_, Self::NameListen)
            ),
        }
    }
}

impl fmt::Display for VoiceMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Who asked for a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionOrigin {
    /// NMS command, GUI or local CLI.
    External,
    /// The audio loop's own detection and timers.
    Internal,
}

impl TransitionOrigin {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::External => "external",
            Self::Internal => "internal",
        }
    }
}

impl fmt::Display for TransitionOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A transition that was applied. `from == to` for an idempotent request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: VoiceMode,
    pub to: VoiceMode,
    pub origin: TransitionOrigin,
}

impl Transition {
    #[must_use]
    pub fn changed(&self) -> bool {
        self.from != self.to
    }
}

/// Follow-up attached to a script entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptAction {
    None,
    /// Move from CONVERSATION into LLM.
    EnterLlm,
    /// Speak identity, active bundle and mode.
    StatusReport,
    /// Logged and ignored.
    Unknown(String),
}

impl ScriptAction {
    #[must_use]
    pub fn parse(raw: &str) -> Self {
        match raw.trim() {
            "" => Self::None,
            "enter.llm" => Self::EnterLlm,
            "status.report" => Self::StatusReport,
            other => Self::Unknown(other.to_owned()),
        }
    }
}

/// One row of the conversation script.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScriptEntry {
    pub phrase: String,
    #[serde(default)]
    pub reply: String,
    #[serde(default)]
    pub action: String,
}

impl ScriptEntry {
    #[must_use]
    pub fn new(phrase: &str, reply: &str, action: &str) -> Self {
        Self {
            phrase: phrase.to_owned(),
            reply: reply.to_owned(),
            action: action.to_owned(),
        }
    }

    /// Build an entry from a JSON object. `None` when `phrase` is missing or
    /// blank; a non-string `reply`/`action` counts as empty.
    #[must_use]
    pub fn from_value(value: &serde_json::Value) -> Option<Self> {
        let obj = value.as_object()?;
        let text = |key: &str| {
            obj.get(key)
                .and_then(serde_json::Value::as_str)
                .map(|s| s.trim().to_owned())
                .unwrap_or_default()
        };
        let phrase = text("phrase");
        if phrase.is_empty() {
            return None;
        }
        Some(Self {
            phrase,
            reply: text("reply"),
            action: text("action"),
        })
    }

    #[must_use]
    pub fn script_action(&self) -> ScriptAction {
        ScriptAction::parse(&self.action)
    }
}

/// Two-entry script used by `scanner-agent voice script demo`.
#[must_use]
pub fn demo_script() -> Vec<ScriptEntry> {
    vec![
        ScriptEntry::new("How are you", "Let me check.", "status.report"),
        ScriptEntry::new("Let's talk", "Nice to talk to you.", "enter.llm"),
    ]
}
