//! The long-running audio loop.
//!
//! Each iteration: pick up record edits, expire elapsed sessions, then (unless
//! deaf) capture one utterance and act on it for the current mode. Deadlines
//! are checked cooperatively here, never by a timer interrupting a capture.

use super::config::{RecordWatcher, VoiceRecord};
use super::llm::CompletionClient;
use super::machine::VoiceMachine;
use super::matcher::{self, WakeMatcher, WakeRule};
use super::output::VoiceOutput;
use super::speech::SpeechSource;
use super::state::{ScriptAction, Transition, VoiceMode};
use crate::config::VoiceConfig;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// Everything the loop needs.
pub struct VoiceServiceDeps {
    pub machine: VoiceMachine,
    pub speech: Arc<dyn SpeechSource>,
    pub llm: Arc<dyn CompletionClient>,
    pub output: VoiceOutput,
    pub config: VoiceConfig,
    /// Bound on one completion request.
    pub llm_request_timeout: Duration,
    pub record_path: PathBuf,
    /// Used as the wake alias when the record has none, and by `status.report`.
    pub identity: String,
    pub bundles_dir: PathBuf,
}

/// What one utterance led to. Returned for logging and tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Heard {
    /// Too short, deaf, or no rule applied.
    Ignored,
    Woke,
    /// Script entry matched; carries its phrase.
    Matched(String),
    /// Completion spoken.
    Answered,
    /// Completion failed; session ended.
    LlmFailed(String),
}

pub struct VoiceService {
    deps: VoiceServiceDeps,
    /// Mode last written to the record by someone else; applied when light.
    desired: Option<VoiceMode>,
}

impl VoiceService {
    #[must_use]
    pub fn new(deps: VoiceServiceDeps) -> Self {
        Self { deps, desired: None }
    }

    #[must_use]
    pub fn machine(&self) -> &VoiceMachine {
        &self.deps.machine
    }

    fn tick(&self) -> Duration {
        Duration::from_millis(self.deps.config.tick_ms)
    }

    /// Run until `cancel` fires or the machine shuts down.
    pub async fn run(mut self, cancel: CancellationToken) {
        let mut watcher = RecordWatcher::new(&self.deps.record_path);
        let heartbeat = Duration::from_secs(self.deps.config.heartbeat_sec);
        let mut last_heartbeat: Option<Instant> = None;
        tracing::info!(identity = %self.deps.identity, "voice loop started");

        while !cancel.is_cancelled() && !self.deps.machine.is_shut_down() {
            if let Some(record) = watcher.poll() {
                self.apply_record(&record);
            }
            self.reconcile();
            self.expire(Instant::now()).await;

            if last_heartbeat.is_none_or(|at| at.elapsed() >= heartbeat) {
                self.heartbeat();
                last_heartbeat = Some(Instant::now());
            }

            let mode = match self.deps.machine.mode() {
                Ok(mode) => mode,
                Err(e) => {
                    tracing::error!(error = %e, "voice state unavailable; loop halting");
                    break;
                }
            };
            if mode == VoiceMode::Deaf {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    () = tokio::time::sleep(self.tick()) => continue,
                }
            }

            let captured = tokio::select! {
                () = cancel.cancelled() => break,
                r = self.deps.speech.next_utterance(mode) => r,
            };
            match captured {
                Ok(Some(raw)) => {
                    let heard = self.handle_utterance(&raw).await;
                    tracing::debug!(?heard, "utterance handled");
                }
                Ok(None) => {
                    tokio::select! {
                        () = cancel.cancelled() => break,
                        () = tokio::time::sleep(self.tick()) => {}
                    }
                }
                Err(e) => {
                    // Mic glitches are routine; the next chunk retries.
                    tracing::warn!(error = %e, mode = %mode, "speech capture failed");
                    tokio::select! {
                        () = cancel.cancelled() => break,
                        () = tokio::time::sleep(self.tick()) => {}
                    }
                }
            }
        }
        tracing::info!("voice loop stopped");
    }

    /// Take alias, timeouts and script from an edited record, and remember
    /// its mode as the operator's wish.
    pub fn apply_record(&mut self, record: &VoiceRecord) {
        let m = &self.deps.machine;
        let result = m
            .update_settings(
                &record.wake_alias,
                Duration::from_secs(record.conversation_timeout_sec),
                Duration::from_secs(record.llm_timeout_sec),
            )
            .and_then(|()| match m.snapshot() {
                Ok(snap) if snap.script != record.script => m.replace_script(record.script.clone()),
                Ok(_) => Ok(()),
                Err(e) => Err(e),
            });
        if let Err(e) = result {
            tracing::warn!(error = %e, "cannot apply voice record");
        }
        self.desired = Some(record.light_mode());
    }

    /// Apply the wished-for light mode once the device is not mid-session.
    fn reconcile(&mut self) {
        let Some(desired) = self.desired else {
            return;
        };
        let Ok(current) = self.deps.machine.mode() else {
            return;
        };
        if current == desired {
            self.desired = None;
            return;
        }
        if current.transcribes() {
            return;
        }
        if let Err(e) = self.deps.machine.request_external(desired) {
            tracing::warn!(error = %e, "record mode not applied");
        }
        self.desired = None;
    }

    /// End an elapsed session and announce it.
    pub async fn expire(&self, now: Instant) {
        match self.deps.machine.expire(now) {
            Ok(Some(t)) => self.announce(t).await,
            Ok(None) => {}
            Err(e) => tracing::warn!(error = %e, "cannot check voice deadline"),
        }
    }

    fn heartbeat(&self) {
        if let Ok(snap) = self.deps.machine.snapshot() {
            tracing::info!(
                mode = %snap.mode,
                script_len = snap.script.len(),
                conv_to = snap.conversation_timeout.as_secs(),
                llm_to = snap.llm_timeout.as_secs(),
                "voice heartbeat"
            );
        }
    }

    /// Act on one recognizer transcript according to the current mode.
    pub async fn handle_utterance(&self, raw: &str) -> Heard {
        let norm = matcher::normalize(raw);
        if norm.chars().count() < self.deps.config.min_chars {
            return Heard::Ignored;
        }
        let Ok(snap) = self.deps.machine.snapshot() else {
            return Heard::Ignored;
        };
        tracing::info!(mode = %snap.mode, raw, norm = %norm, "heard");

        match snap.mode {
            VoiceMode::Deaf => Heard::Ignored,
            VoiceMode::NameListen => {
                let alias = if snap.wake_alias.trim().is_empty() {
                    self.deps.identity.as_str()
                } else {
                    snap.wake_alias.as_str()
                };
                let rule = WakeRule {
                    callsign_ratio: self.deps.config.wake_ratio,
                    prefix_ratio: self.deps.config.prefix_ratio,
                    callsign_only: self.deps.config.callsign_only,
                };
                let woke = WakeMatcher::new(alias, rule).is_some_and(|m| m.matches(&norm));
                if !woke {
                    return Heard::Ignored;
                }
                match self.deps.machine.wake_detected(Instant::now()) {
                    Ok(t) => {
                        self.announce(t).await;
                        Heard::Woke
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "wake ignored");
                        Heard::Ignored
                    }
                }
            }
            VoiceMode::Conversation => {
                let Some(entry) = matcher::match_script(&norm, &snap.script, self.deps.config.phrase_ratio) else {
                    return Heard::Ignored;
                };
                tracing::info!(phrase = %entry.phrase, action = %entry.action, "script matched");
                self.touch();
                if !entry.reply.trim().is_empty() {
                    self.speak(&entry.reply).await;
                }
                match entry.script_action() {
                    ScriptAction::None => {}
                    ScriptAction::EnterLlm => match self.deps.machine.trigger_internal(VoiceMode::Llm, Instant::now()) {
                        Ok(t) => self.announce(t).await,
                        Err(e) => tracing::warn!(error = %e, "cannot enter llm mode"),
                    },
                    ScriptAction::StatusReport => {
                        let report = self.status_report();
                        self.speak(&report).await;
                    }
                    ScriptAction::Unknown(name) => tracing::warn!(action = %name, "unknown script action ignored"),
                }
                // Speaking takes time; restart the window from now.
                self.touch();
                Heard::Matched(entry.phrase.clone())
            }
            VoiceMode::Llm => {
                self.touch();
                let reply = tokio::time::timeout(self.deps.llm_request_timeout, self.deps.llm.complete(raw.trim())).await;
                let failure = match reply {
                    Ok(Ok(text)) => {
                        if !text.trim().is_empty() {
                            self.speak(&text).await;
                        }
                        self.touch();
                        return Heard::Answered;
                    }
                    Ok(Err(e)) => e.to_string(),
                    Err(_) => format!("LLM request exceeded {}s", self.deps.llm_request_timeout.as_secs()),
                };
                tracing::warn!(error = %failure, "LLM exchange failed; leaving llm mode");
                match self.deps.machine.fallback("llm failure") {
                    Ok(t) => self.announce(t).await,
                    Err(e) => tracing::warn!(error = %e, "fallback failed"),
                }
                Heard::LlmFailed(failure)
            }
        }
    }

    fn touch(&self) {
        if let Err(e) = self.deps.machine.touch(Instant::now()) {
            tracing::warn!(error = %e, "cannot extend voice deadline");
        }
    }

    async fn speak(&self, text: &str) {
        if let Err(e) = self.deps.output.say(text, None, None).await {
            tracing::warn!(error = %e, "speech output failed");
        }
    }

    /// Speak the configured prompt for the mode just entered.
    async fn announce(&self, t: Transition) {
        if !t.changed() {
            return;
        }
        let c = &self.deps.config;
        let prompt = match t.to {
            VoiceMode::Deaf => c.say_enter_deaf.as_deref(),
            VoiceMode::NameListen => c.say_enter_name_listen.as_deref(),
            VoiceMode::Conversation => c.say_enter_conversation.as_deref(),
            VoiceMode::Llm => c.say_enter_llm.as_deref(),
        };
        if let Some(text) = prompt.filter(|p| !p.trim().is_empty()) {
            if let Err(e) = self
                .deps
                .output
                .say(text, Some(c.prompt_lead_silence_ms), Some(c.prompt_volume))
                .await
            {
                tracing::warn!(error = %e, to = %t.to, "transition prompt failed");
            }
        }
    }

    fn status_report(&self) -> String {
        let bundle = crate::bundle::manager::read_active(&self.deps.bundles_dir)
            .map_or_else(|| "none".to_owned(), |id| id.to_string());
        let mode = self
            .deps
            .machine
            .mode()
            .map_or_else(|_| "unknown".to_owned(), |m| m.as_str().replace('_', " "));
        format!("I am {}. Active bundle {bundle}. Mode {mode}.", self.deps.identity)
    }
}
