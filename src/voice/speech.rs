//! Speech input seam.

use super::state::VoiceMode;
use crate::error::{AgentError, Result};
use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

/// Source of transcribed utterances.
#[async_trait]
pub trait SpeechSource: Send + Sync {
    /// Capture and transcribe one chunk. `Ok(None)` when nothing was heard.
    ///
    /// `mode` lets the recognizer pick a cheaper model for wake detection.
    /// It is never called in `Deaf`.
    async fn next_utterance(&self, mode: VoiceMode) -> Result<Option<String>>;
}

/// Runs an external recognizer once per chunk; stdout is the transcript.
///
/// The recognizer sees `VOICE_MODE` (`name_listen`, `conversation`, `llm`)
/// in its environment.
#[derive(Debug, Clone)]
pub struct CommandRecognizer {
    program: PathBuf,
    args: Vec<String>,
    cwd: PathBuf,
    timeout: Duration,
}

impl CommandRecognizer {
    /// Build from `[program, args...]`.
    ///
    /// # Errors
    ///
    /// Returns a config error when `command` is empty.
    pub fn new(command: &[String], cwd: impl Into<PathBuf>, timeout: Duration) -> Result<Self> {
        let (program, args) = command
            .split_first()
            .ok_or_else(|| AgentError::Config("voice.recognizer_command is empty".to_owned()))?;
        Ok(Self {
            program: PathBuf::from(program),
            args: args.to_vec(),
            cwd: cwd.into(),
            timeout,
        })
    }
}

#[async_trait]
impl SpeechSource for CommandRecognizer {
    async fn next_utterance(&self, mode: VoiceMode) -> Result<Option<String>> {
        let mut cmd = tokio::process::Command::new(&self.program);
        cmd.args(&self.args)
            .current_dir(&self.cwd)
            .env("VOICE_MODE", mode.as_str())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let output = tokio::time::timeout(self.timeout, cmd.output())
            .await
            .map_err(|_| AgentError::Timeout(format!("recognizer exceeded {}s", self.timeout.as_secs())))?
            .map_err(|e| AgentError::Process(format!("cannot run recognizer {}: {e}", self.program.display())))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(AgentError::Process(format!(
                "recognizer {}: {}",
                output.status,
                crate::identity::truncate(stderr.trim(), 160)
            )));
        }
        let text = String::from_utf8_lossy(&output.stdout).trim().to_owned();
        Ok((!text.is_empty()).then_some(text))
    }
}
