//! Centralized directory paths for the scanner agent.
//!
//! The agent's files live under one base directory on the device
//! (`~/_RunScanner/` for the service user, `/home/pi/_RunScanner/` when no
//! home directory resolves). The config file lives in the platform config
//! directory so that it survives bundle swaps.
//!
//! # Environment Overrides
//!
//! - `SCANNER_BASE_DIR` overrides [`base_dir`]
//! - `SCANNER_CONFIG_DIR` overrides [`config_dir`]

use std::path::PathBuf;

/// Name of the base directory under the service user's home.
const BASE_DIR_NAME: &str = "_RunScanner";

/// Agent base directory.
///
/// Holds the identity file, bundles, process records, voice state and logs.
#[must_use]
pub fn base_dir() -> PathBuf {
    if let Some(override_dir) = std::env::var_os("SCANNER_BASE_DIR") {
        return PathBuf::from(override_dir);
    }
    dirs::home_dir()
        .map(|d| d.join(BASE_DIR_NAME))
        .unwrap_or_else(|| PathBuf::from("/home/pi").join(BASE_DIR_NAME))
}

/// Agent config directory (`dirs::config_dir()/scanner-agent/`).
#[must_use]
pub fn config_dir() -> PathBuf {
    if let Some(override_dir) = std::env::var_os("SCANNER_CONFIG_DIR") {
        return PathBuf::from(override_dir);
    }
    dirs::config_dir()
        .map(|d| d.join("scanner-agent"))
        .unwrap_or_else(|| base_dir().join("config"))
}
