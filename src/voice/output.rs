//! Spoken output: TTS and the test beep, both run through the tracker.

use crate::config::{BeepConfig, TtsConfig};
use crate::error::{AgentError, Result};
use crate::process::{LaunchSpec, ProcessTracker, Slot, StopOutcome, StopRequest};
use std::path::PathBuf;
use std::time::Duration;

/// Default text for `voice.test.prompt`.
pub const TEST_PROMPT_TEXT: &str = "Voice test is running.";

/// Grace given to a previous utterance that is cut off by a new one.
const PREEMPT_GRACE: Duration = Duration::from_millis(500);

/// Speech and tone player.
#[derive(Debug, Clone)]
pub struct VoiceOutput {
    tracker: ProcessTracker,
    base_dir: PathBuf,
    tts: TtsConfig,
    beep: BeepConfig,
}

impl VoiceOutput {
    #[must_use]
    pub fn new(tracker: ProcessTracker, base_dir: impl Into<PathBuf>, tts: TtsConfig, beep: BeepConfig) -> Self {
        Self {
            tracker,
            base_dir: base_dir.into(),
            tts,
            beep,
        }
    }

    /// Speak `text` and wait for playback to finish.
    ///
    /// A previous utterance still playing is cut off first.
    ///
    /// # Errors
    ///
    /// Returns an error for empty text, a spawn failure, a non-zero exit, or
    /// the TTS timeout.
    pub async fn say(&self, text: &str, lead_silence_ms: Option<u32>, volume: Option<u8>) -> Result<String> {
        let text = text.trim();
        if text.is_empty() {
            return Err(AgentError::Process("tts: empty text".to_owned()));
        }
        let lead = lead_silence_ms.unwrap_or(self.tts.lead_silence_ms);
        let volume = volume.unwrap_or(self.tts.volume).min(100);

        self.preempt(Slot::Tts).await;
        let spec = LaunchSpec::new(&self.tts.shell)
            .arg(self.base_dir.join(&self.tts.script))
            .arg(text)
            .arg(lead.to_string())
            .arg(volume.to_string())
            .current_dir(&self.base_dir);
        let report = self
            .tracker
            .start_and_wait(Slot::Tts, &spec, Duration::from_secs(self.tts.timeout_sec))
            .await?;
        if report.success() {
            Ok(format!("say ok text_len={} lead_ms={lead} vol={volume}", text.chars().count()))
        } else {
            Err(AgentError::Process(format!("say {}", report.failure_detail())))
        }
    }

    /// Play the short confirmation tone.
    ///
    /// # Errors
    ///
    /// Returns an error if the tone player is missing, fails, or hangs.
    pub async fn beep(&self) -> Result<String> {
        let b = &self.beep;
        let secs = f64::from(b.duration_ms.max(10)) / 1000.0;
        let freq = b.freq_hz.max(100);
        let vol = f64::from(b.volume.min(100)) / 100.0;
        let spec = LaunchSpec::new(&b.player).args([
            "-q".to_owned(),
            "-n".to_owned(),
            "synth".to_owned(),
            format!("{secs}"),
            "sine".to_owned(),
            freq.to_string(),
            "vol".to_owned(),
            format!("{vol}"),
        ]);
        self.preempt(Slot::Beep).await;
        let report = self
            .tracker
            .start_and_wait(Slot::Beep, &spec, Duration::from_secs(b.timeout_sec))
            .await?;
        if report.success() {
            Ok(format!("beep ok dur_ms={} freq={freq} vol={}", b.duration_ms, b.volume))
        } else {
            Err(AgentError::Process(format!("beep {}", report.failure_detail())))
        }
    }

    /// Optional beep, then speech. A failed beep is logged and the speech
    /// still runs; the result reflects the speech.
    ///
    /// # Errors
    ///
    /// Returns the speech error.
    pub async fn test_prompt(&self, text: Option<&str>, beep: bool, lead_silence_ms: u32, volume: u8) -> Result<String> {
        let mut parts = Vec::new();
        if beep {
            match self.beep().await {
                Ok(detail) => parts.push(detail),
                Err(e) => {
                    tracing::warn!(error = %e, "test prompt beep failed");
                    parts.push(format!("beep error: {e}"));
                }
            }
        }
        let text = text.filter(|t| !t.trim().is_empty()).unwrap_or(TEST_PROMPT_TEXT);
        parts.push(self.say(text, Some(lead_silence_ms), Some(volume)).await?);
        Ok(parts.join("; "))
    }

    async fn preempt(&self, slot: Slot) {
        match self.tracker.stop(slot, StopRequest::term(PREEMPT_GRACE)).await {
            Ok(StopOutcome::NothingToStop) => {}
            Ok(outcome) => tracing::info!(slot = %slot, "{}", outcome.detail(slot)),
            Err(e) => tracing::warn!(slot = %slot, error = %e, "cannot stop previous output"),
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use std::path::Path;

    /// TTS "script" that records its argv.
    fn output(dir: &Path, body: &str) -> VoiceOutput {
        std::fs::write(dir.join("tts.sh"), body).unwrap();
        let tracker = ProcessTracker::new(dir.join("run")).unwrap();
        let tts = TtsConfig {
            shell: PathBuf::from("/bin/sh"),
            script: PathBuf::from("tts.sh"),
            timeout_sec: 5,
            ..TtsConfig::default()
        };
        let beep = BeepConfig {
            player: dir.join("missing-play"),
            ..BeepConfig::default()
        };
        VoiceOutput::new(tracker, dir, tts, beep)
    }

    #[tokio::test]
    async fn say_passes_text_lead_and_volume() {
        let dir = tempfile::tempdir().unwrap();
        let out = output(dir.path(), "echo \"$1|$2|$3\" > said.txt\n");
        let detail = out.say("hello there", Some(100), Some(150)).await.unwrap();
        assert_eq!(detail, "say ok text_len=11 lead_ms=100 vol=100");
        assert_eq!(std::fs::read_to_string(dir.path().join("said.txt")).unwrap(), "hello there|100|100\n");
    }

    #[tokio::test]
    async fn say_failure_carries_rc() {
        let dir = tempfile::tempdir().unwrap();
        let out = output(dir.path(), "echo broken >&2; exit 4\n");
        let err = out.say("x", None, None).await.unwrap_err();
        assert!(err.to_string().contains("rc=4 stderr=broken"));
    }

    #[tokio::test]
    async fn test_prompt_speaks_even_if_beep_fails() {
        let dir = tempfile::tempdir().unwrap();
        let out = output(dir.path(), "echo \"$1\" > said.txt\n");
        let detail = out.test_prompt(None, true, 600, 90).await.unwrap();
        assert!(detail.starts_with("beep error"));
        assert_eq!(std::fs::read_to_string(dir.path().join("said.txt")).unwrap(), "Voice test is running.\n");
    }

    #[tokio::test]
    async fn empty_text_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let out = output(dir.path(), "exit 0\n");
        assert!(out.say("  ", None, None).await.is_err());
    }
}
