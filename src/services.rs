//! systemd unit control.

use crate::config::ServicesConfig;
use crate::error::{AgentError, Result};
use async_trait::async_trait;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

/// Start/stop control over named units.
#[async_trait]
pub trait ServiceManager: Send + Sync {
    /// Start `unit`. Returns a short detail for the ack.
    async fn start(&self, unit: &str) -> Result<String>;

    /// Stop `unit`.
    async fn stop(&self, unit: &str) -> Result<String>;

    /// Restart `unit`.
    async fn restart(&self, unit: &str) -> Result<String>;

    /// Whether `unit` is active. Errors only when the query itself fails.
    async fn is_active(&self, unit: &str) -> Result<bool>;
}

/// [`ServiceManager`] that shells out to `systemctl`, retrying through
/// `sudo -n` when the plain call fails.
#[derive(Debug, Clone)]
pub struct SystemctlManager {
    config: ServicesConfig,
}

struct CallOutput {
    ok: bool,
    stdout: String,
    stderr: String,
}

impl SystemctlManager {
    #[must_use]
    pub fn new(config: ServicesConfig) -> Self {
        Self { config }
    }

    async fn call(&self, program: &Path, args: &[&str]) -> Result<CallOutput> {
        let mut cmd = tokio::process::Command::new(program);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        let timeout = Duration::from_secs(self.config.timeout_sec);
        let output = tokio::time::timeout(timeout, cmd.output())
            .await
            .map_err(|_| {
                AgentError::Timeout(format!(
                    "{} {} exceeded {}s",
                    program.display(),
                    args.join(" "),
                    self.config.timeout_sec
                ))
            })?
            .map_err(|e| AgentError::Service(format!("cannot run {}: {e}", program.display())))?;
        Ok(CallOutput {
            ok: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).trim().to_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_owned(),
        })
    }

    /// Run `systemctl <verb> <unit>`, then `sudo -n systemctl ...` if allowed.
    async fn run(&self, verb: &str, unit: &str) -> Result<CallOutput> {
        let first = self.call(&self.config.systemctl, &[verb, unit]).await;
        let first_ok = matches!(&first, Ok(out) if out.ok);
        if first_ok || !self.config.sudo_fallback {
            return first;
        }

        let systemctl = self.config.systemctl.to_string_lossy();
        let second = self
            .call(&self.config.sudo, &["-n", systemctl.as_ref(), verb, unit])
            .await;
        match (first, second) {
            (_, Ok(out)) if out.ok => Ok(out),
            // Keep the more informative stderr.
            (Ok(plain), Ok(sudo)) if sudo.stderr.is_empty() => Ok(CallOutput { ok: false, ..plain }),
            (_, second) => second,
        }
    }

    async fn control(&self, verb: &str, past: &str, unit: &str) -> Result<String> {
        let out = self.run(verb, unit).await?;
        if out.ok {
            tracing::info!(unit, verb, "unit {past}");
            Ok(format!("{past} {unit}"))
        } else {
            let reason = if out.stderr.is_empty() { out.stdout } else { out.stderr };
            tracing::warn!(unit, verb, reason = %reason, "systemctl failed");
            Err(AgentError::Service(format!("{verb} {unit} failed: {reason}")))
        }
    }
}

#[async_trait]
impl ServiceManager for SystemctlManager {
    async fn start(&self, unit: &str) -> Result<String> {
        self.control("start", "started", unit).await
    }

    async fn stop(&self, unit: &str) -> Result<String> {
        self.control("stop", "stopped", unit).await
    }

    async fn restart(&self, unit: &str) -> Result<String> {
        self.control("restart", "restarted", unit).await
    }

    async fn is_active(&self, unit: &str) -> Result<bool> {
        // `is-active` exits non-zero for inactive units; no sudo needed.
        let out = self.call(&self.config.systemctl, &["is-active", unit]).await?;
        Ok(out.ok && out.stdout == "active")
    }
}
