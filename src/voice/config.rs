//! The runtime voice record (`voice/voice_config.json`).
//!
//! Shared with the GUI and the `voice` CLI. Only light modes are ever
//! written; anything else found on disk is read back as `deaf`.

use super::state::{ScriptEntry, VoiceMode};
use crate::config::VoiceConfig;
use crate::error::{AgentError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

/// Persisted voice settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VoiceRecord {
    pub mode: String,
    pub conversation_timeout_sec: u64,
    pub llm_timeout_sec: u64,
    pub wake_alias: String,
    pub script: Vec<ScriptEntry>,
}

impl Default for VoiceRecord {
    fn default() -> Self {
        Self::from_config(&VoiceConfig::default())
    }
}

impl VoiceRecord {
    /// Seed a record from the TOML voice section.
    #[must_use]
    pub fn from_config(config: &VoiceConfig) -> Self {
        Self {
            mode: config.initial_mode.clone(),
            conversation_timeout_sec: config.conversation_timeout_sec,
            llm_timeout_sec: config.llm_timeout_sec,
            wake_alias: config.wake_alias.clone(),
            script: Vec::new(),
        }
    }

    /// The stored mode, downgraded to `Deaf` unless it is a light mode.
    #[must_use]
    pub fn light_mode(&self) -> VoiceMode {
        match VoiceMode::parse(&self.mode) {
            Some(mode) if mode.is_externally_reachable() => mode,
            _ => VoiceMode::Deaf,
        }
    }

    /// Store `mode`.
    ///
    /// # Errors
    ///
    /// Refuses heavy modes; they are never persisted.
    pub fn set_mode(&mut self, mode: VoiceMode) -> Result<()> {
        if !mode.is_externally_reachable() {
            return Err(super::VoiceError::ExternalTargetRefused(mode).into());
        }
        mode.as_str().clone_into(&mut self.mode);
        Ok(())
    }

    /// Read the record. A missing file yields `Ok(None)`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Option<Self>> {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let mut record: Self = serde_json::from_str(&content)
            .map_err(|e| AgentError::Config(format!("invalid voice record {}: {e}", path.display())))?;
        let mode = record.light_mode();
        mode.as_str().clone_into(&mut record.mode);
        // Entries with a blank phrase can only come from hand edits.
        record.script.retain(|e| !e.phrase.trim().is_empty());
        Ok(Some(record))
    }

    /// Load the record, writing `seed` when it is missing or unreadable.
    ///
    /// # Errors
    ///
    /// Returns an error only if the seed cannot be written.
    pub fn load_or_init(path: &Path, seed: &Self) -> Result<Self> {
        match Self::load(path) {
            Ok(Some(record)) => Ok(record),
            Ok(None) => {
                seed.save(path)?;
                Ok(seed.clone())
            }
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "voice record unreadable; rewriting defaults");
                seed.save(path)?;
                Ok(seed.clone())
            }
        }
    }

    /// Write the record atomically, creating the parent directory.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or the write fails.
    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| AgentError::Config(format!("cannot serialize voice record: {e}")))?;
        crate::fsutil::write_atomic(path, json.as_bytes())?;
        Ok(())
    }

    /// Read-modify-write.
    ///
    /// # Errors
    ///
    /// Propagates errors from `f`, the read and the write.
    pub fn update(path: &Path, seed: &Self, f: impl FnOnce(&mut Self) -> Result<()>) -> Result<Self> {
        let mut record = Self::load_or_init(path, seed)?;
        f(&mut record)?;
        record.save(path)?;
        Ok(record)
    }
}

/// Detects edits to the record by modification time.
#[derive(Debug)]
pub struct RecordWatcher {
    path: PathBuf,
    last_seen: Option<SystemTime>,
}

impl RecordWatcher {
    /// Start watching; the current file state counts as already seen.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let last_seen = mtime(&path);
        Self { path, last_seen }
    }

    /// The record if it changed since the last call.
    pub fn poll(&mut self) -> Option<VoiceRecord> {
        let now = mtime(&self.path);
        if now == self.last_seen {
            return None;
        }
        self.last_seen = now;
        match VoiceRecord::load(&self.path) {
            Ok(record) => record,
            Err(e) => {
                tracing::warn!(path = %self.path.display(), error = %e, "ignoring unreadable voice record");
                None
            }
        }
    }

    /// Mark the current file state as seen (after the agent wrote it itself).
    pub fn mark_seen(&mut self) {
        self.last_seen = mtime(&self.path);
    }
}

fn mtime(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}
