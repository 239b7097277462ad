//! Device identity.
//!
//! The identity is a single line in the identity file, written by the
//! registration collaborator. The agent never invents one: while the file is
//! missing or empty it runs the optional registration hook and waits.

use crate::config::NmsConfig;
use crate::error::{AgentError, Result};
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Read the identity file. Missing, unreadable and blank files are `None`.
#[must_use]
pub fn read_identity(path: &Path) -> Option<String> {
    let content = std::fs::read_to_string(path).ok()?;
    let first = content.lines().next()?.trim();
    if first.is_empty() {
        None
    } else {
        Some(first.to_owned())
    }
}

/// Run the registration hook once. Failures are logged, never returned.
pub async fn run_register_hook(nms: &NmsConfig, cwd: &Path) {
    let Some((program, args)) = nms.register_command.split_first() else {
        return;
    };

    let mut cmd = tokio::process::Command::new(program);
    cmd.args(args)
        .current_dir(cwd)
        .env("NMS_BASE", nms.base())
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let timeout = Duration::from_secs(nms.register_timeout_sec);
    match tokio::time::timeout(timeout, cmd.output()).await {
        Ok(Ok(out)) if out.status.success() => {
            tracing::info!("registration hook completed");
        }
        Ok(Ok(out)) => {
            let stderr = String::from_utf8_lossy(&out.stderr);
            tracing::warn!(
                status = %out.status,
                stderr = %truncate(stderr.trim(), 200),
                "registration hook failed"
            );
        }
        Ok(Err(e)) => tracing::warn!(error = %e, program = %program, "cannot run registration hook"),
        Err(_) => tracing::warn!(timeout_sec = nms.register_timeout_sec, "registration hook timed out"),
    }
}

/// Wait until the identity file holds an identity, running the registration
/// hook between attempts.
///
/// # Errors
///
/// Returns [`AgentError::ShutDown`] if `cancel` fires first.
pub async fn wait_for_identity(
    identity_file: &Path,
    nms: &NmsConfig,
    cwd: &Path,
    cancel: &CancellationToken,
) -> Result<String> {
    loop {
        if let Some(id) = read_identity(identity_file) {
            return Ok(id);
        }
        tracing::warn!(path = %identity_file.display(), "identity missing; attempting registration");
        run_register_hook(nms, cwd).await;
        if let Some(id) = read_identity(identity_file) {
            return Ok(id);
        }

        tracing::info!(retry_sec = nms.register_retry_sec, "still unassigned");
        tokio::select! {
            () = cancel.cancelled() => return Err(AgentError::ShutDown),
            () = tokio::time::sleep(Duration::from_secs(nms.register_retry_sec)) => {}
        }
    }
}

/// Truncate to at most `max` characters.
pub(crate) fn truncate(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;

    #[test]
    fn reads_first_trimmed_line() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scanner_name.txt");
        std::fs::write(&path, "  twin-scout-alpha \nignored\n").unwrap();
        assert_eq!(read_identity(&path).as_deref(), Some("twin-scout-alpha"));
    }

    #[test]
    fn blank_or_missing_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scanner_name.txt");
        assert!(read_identity(&path).is_none());
        std::fs::write(&path, "   \n").unwrap();
        assert!(read_identity(&path).is_none());
    }

    #[tokio::test]
    async fn hook_writes_identity() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scanner_name.txt");
        let nms = NmsConfig {
            register_command: vec![
                "/bin/sh".to_owned(),
                "-c".to_owned(),
                "echo scanner07 > scanner_name.txt".to_owned(),
            ],
            ..NmsConfig::default()
        };
        let cancel = CancellationToken::new();
        let id = wait_for_identity(&path, &nms, dir.path(), &cancel).await.unwrap();
        assert_eq!(id, "scanner07");
    }

    #[tokio::test]
    async fn cancel_stops_waiting() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scanner_name.txt");
        let nms = NmsConfig {
            register_retry_sec: 30,
            ..NmsConfig::default()
        };
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = wait_for_identity(&path, &nms, dir.path(), &cancel).await;
        assert!(matches!(result, Err(AgentError::ShutDown)));
    }

    #[test]
    fn truncate_counts_chars() {
        assert_eq!(truncate("héllo", 2), "hé");
    }
}
