//! On-disk process records, one JSON file per slot.

use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

/// Playback and helper slots. Each slot tracks at most one process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Slot {
    Audio,
    Tts,
    Scan,
    Beep,
}

impl Slot {
    pub const ALL: [Self; 4] = [Self::Audio, Self::Tts, Self::Scan, Self::Beep];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Audio => "audio",
            Self::Tts => "tts",
            Self::Scan => "scan",
            Self::Beep => "beep",
        }
    }
}

impl fmt::Display for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What is persisted for a running child.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessRecord {
    pub pid: u32,
    /// Fleet-format local time.
    pub started_at: String,
    pub kind: Slot,
}

#[must_use]
pub fn record_path(dir: &Path, slot: Slot) -> PathBuf {
    dir.join(format!("{}.pid.json", slot.as_str()))
}

/// Read a slot record. A missing or unparseable record reads as `None`.
pub fn read(dir: &Path, slot: Slot) -> Option<ProcessRecord> {
    let path = record_path(dir, slot);
    let content = std::fs::read_to_string(&path).ok()?;
    match serde_json::from_str(&content) {
        Ok(record) => Some(record),
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "ignoring corrupt process record");
            None
        }
    }
}

/// Write a slot record via temp file + rename.
pub fn write(dir: &Path, record: &ProcessRecord) -> Result<()> {
    let content = serde_json::to_vec_pretty(record)
        .map_err(|e| crate::error::AgentError::Process(format!("cannot encode record: {e}")))?;
    crate::fsutil::write_atomic(&record_path(dir, record.kind), &content)?;
    Ok(())
}

/// Remove a slot record if it still names `pid`. Returns whether it was removed.
pub fn remove_if(dir: &Path, slot: Slot, pid: u32) -> bool {
    match read(dir, slot) {
        Some(record) if record.pid == pid => remove(dir, slot),
        _ => false,
    }
}

/// Remove a slot record unconditionally (best-effort).
pub fn remove(dir: &Path, slot: Slot) -> bool {
    std::fs::remove_file(record_path(dir, slot)).is_ok()
}
