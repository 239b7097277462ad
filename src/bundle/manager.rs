//! Bundle deployment state machine.
//!
//! Layout under the bundle store:
//!
//! ```text
//! bundles/
//!   robotBundle1.0/        extracted payload
//!   robotBundle1.1/
//!   active -> robotBundle1.1   (relative symlink, swapped with rename(2))
//!   active_bundle.txt          mirror for the GUI
//!   .staging/                  downloads in flight
//! ```
//!
//! The device does not arbitrate: every descriptor the NMS sends is
//! attempted. Rollback is just another `apply` naming an older id.

use super::descriptor::{BundleDescriptor, BundleId};
use super::extract::{ExtractError, extract_bundle};
use super::fetch::{FetchError, download};
use super::{DeployError, DeployStep};
use crate::config::BundleConfig;
use crate::error::{AgentError, Result};
use crate::services::ServiceManager;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

/// Name of the active pointer inside the bundle store.
pub const ACTIVE_LINK: &str = "active";

/// Human-readable mirror of the active pointer.
pub const ACTIVE_MARKER: &str = "active_bundle.txt";

/// Successful deployment summary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeployReport {
    pub bundle_id: BundleId,
    pub previous: Option<BundleId>,
    pub hook_ran: bool,
    pub restarted: Vec<String>,
}

impl DeployReport {
    #[must_use]
    pub fn detail(&self) -> String {
        let previous = self
            .previous
            .as_ref()
            .map_or_else(|| "none".to_owned(), ToString::to_string);
        format!(
            "bundle applied: {} (previous={previous}, hook={}, restarted=[{}])",
            self.bundle_id,
            if self.hook_ran { "ok" } else { "none" },
            self.restarted.join(",")
        )
    }
}

/// Optional `bundle.toml` shipped in a payload.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct BundleManifest {
    services: ManifestServices,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ManifestServices {
    required: Option<Vec<String>>,
}

/// Owns the bundle store and serializes deployments.
pub struct BundleManager {
    bundles_dir: PathBuf,
    config: BundleConfig,
    services: Arc<dyn ServiceManager>,
    client: reqwest::Client,
    /// Held for a whole deployment; readers of the pointer do not need it.
    deploy_lock: tokio::sync::Mutex<()>,
}

impl std::fmt::Debug for BundleManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BundleManager")
            .field("bundles_dir", &self.bundles_dir)
            .finish_non_exhaustive()
    }
}

impl BundleManager {
    /// Create a manager over `bundles_dir`.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created or the HTTP client
    /// cannot be built.
    pub fn new(
        bundles_dir: impl Into<PathBuf>,
        config: BundleConfig,
        services: Arc<dyn ServiceManager>,
    ) -> Result<Self> {
        let bundles_dir = bundles_dir.into();
        std::fs::create_dir_all(&bundles_dir)?;
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(15))
            .user_agent(concat!("scanner-agent/", env!("CARGO_PKG_VERSION"), " (bundle)"))
            .build()
            .map_err(|e| AgentError::Config(format!("cannot build HTTP client: {e}")))?;
        Ok(Self {
            bundles_dir,
            config,
            services,
            client,
            deploy_lock: tokio::sync::Mutex::new(()),
        })
    }

    #[must_use]
    pub fn bundles_dir(&self) -> &Path {
        &self.bundles_dir
    }

    /// The bundle the active pointer names, if any.
    #[must_use]
    pub fn active(&self) -> Option<BundleId> {
        read_active(&self.bundles_dir)
    }

    /// Run the full deployment sequence for `desc`.
    ///
    /// # Errors
    ///
    /// Returns [`DeployError::BeforeActivation`] when a step up to extraction
    /// fails (services that were stopped are started again), and
    /// [`DeployError::AfterActivation`] when the hook or a restart fails.
    pub async fn apply(&self, desc: &BundleDescriptor) -> std::result::Result<DeployReport, DeployError> {
        let _guard = self.deploy_lock.lock().await;
        let id = &desc.bundle_id;
        let before = |step: DeployStep, detail: String| DeployError::BeforeActivation {
            bundle_id: id.to_string(),
            step,
            detail,
        };
        let after = |step: DeployStep, detail: String| DeployError::AfterActivation {
            bundle_id: id.to_string(),
            step,
            detail,
        };

        // Step 1: Validate.
        BundleId::parse(id.as_str()).map_err(|e| before(DeployStep::Validate, e.to_string()))?;
        let previous = self.active();
        tracing::info!(bundle_id = %id, previous = ?previous.as_ref().map(BundleId::as_str), step = "validate", "deployment starting");

        // Step 2: Stop dependent services.
        let stopped = self.stop_services().await;

        // Steps 3-4: Fetch, verify, extract. Anything failing here restores services.
        let staged = match self.stage(desc, previous.as_ref()).await {
            Ok(staged) => staged,
            Err((step, detail)) => {
                tracing::warn!(bundle_id = %id, step = %step, detail = %detail, "deployment failed before activation");
                self.restart_stopped(&stopped).await;
                return Err(before(step, detail));
            }
        };

        // Step 5: Activate.
        if let Err(e) = swap_active(&self.bundles_dir, id) {
            self.restart_stopped(&stopped).await;
            return Err(before(DeployStep::Activate, e.to_string()));
        }
        tracing::info!(bundle_id = %id, step = "activate", "active pointer switched");

        // Step 6: Post-install hook.
        let hook_ran = self
            .run_hook(&staged.dir, id)
            .await
            .map_err(|detail| after(DeployStep::Hook, format!("{detail}; services not restarted")))?;

        // Step 7: Restart the services the bundle needs.
        let mut restarted = Vec::new();
        let mut failures = Vec::new();
        for unit in &staged.restart {
            match self.services.restart(unit).await {
                Ok(_) => restarted.push(unit.clone()),
                Err(e) => failures.push(format!("{unit}: {e}")),
            }
        }
        tracing::info!(bundle_id = %id, step = "restart", restarted = ?restarted, failed = failures.len(), "services restarted");
        if !failures.is_empty() {
            return Err(after(DeployStep::Restart, failures.join("; ")));
        }

        Ok(DeployReport {
            bundle_id: id.clone(),
            previous,
            hook_ran,
            restarted,
        })
    }

    async fn stop_services(&self) -> Vec<String> {
        let mut stopped = Vec::new();
        for unit in &self.config.stop_services {
            match self.services.stop(unit).await {
                Ok(_) => stopped.push(unit.clone()),
                // A unit that is not installed cannot hold the payload open.
                Err(e) => tracing::warn!(unit = %unit, error = %e, step = "stop_services", "stop failed; continuing"),
            }
        }
        stopped
    }

    async fn restart_stopped(&self, stopped: &[String]) {
        for unit in stopped {
            if let Err(e) = self.services.start(unit).await {
                tracing::warn!(unit = %unit, error = %e, "cannot restart service after failed deployment");
            }
        }
    }

    fn staging_dir(&self) -> PathBuf {
        self.bundles_dir.join(&self.config.staging_dir)
    }

    /// Download, verify and extract. Returns the failing step on error.
    async fn stage(
        &self,
        desc: &BundleDescriptor,
        active: Option<&BundleId>,
    ) -> std::result::Result<Staged, (DeployStep, String)> {
        let staging = self.staging_dir();
        let _ = std::fs::remove_dir_all(&staging);
        remove_extract_leftovers(&self.bundles_dir);
        std::fs::create_dir_all(&staging).map_err(|e| (DeployStep::Fetch, format!("cannot create staging dir: {e}")))?;
        let archive = staging.join(format!("{}.zip", desc.bundle_id));

        // Step 3: Fetch (+ verify).
        tracing::info!(bundle_id = %desc.bundle_id, url = %desc.source_url, step = "fetch", "downloading bundle");
        let fetched = download(
            &self.client,
            &desc.source_url,
            &archive,
            Duration::from_secs(self.config.fetch_timeout_sec),
            desc.checksum.as_deref(),
        )
        .await
        .map_err(|e| match e {
            FetchError::ChecksumMismatch { .. } => (DeployStep::Verify, e.to_string()),
            other => (DeployStep::Fetch, other.to_string()),
        })?;
        tracing::info!(bundle_id = %desc.bundle_id, bytes = fetched.bytes, sha256 = %fetched.sha256, step = "verify", "payload downloaded");

        // Step 4: Extract.
        let bundles_dir = self.bundles_dir.clone();
        let id = desc.bundle_id.clone();
        let active = active.cloned();
        let archive_for_task = archive.clone();
        let extracted = tokio::task::spawn_blocking(move || {
            extract_bundle(&archive_for_task, &bundles_dir, &id, active.as_ref())
        })
        .await;
        let _ = std::fs::remove_file(&archive);
        let dir = extracted
            .map_err(|e| (DeployStep::Extract, format!("extract task failed: {e}")))?
            .map_err(|e: ExtractError| (DeployStep::Extract, e.to_string()))?;

        let restart = match self.read_manifest(&dir) {
            Ok(restart) => restart,
            Err(detail) => {
                // Leave no half-accepted payload behind.
                let _ = std::fs::remove_dir_all(&dir);
                return Err((DeployStep::Extract, detail));
            }
        };
        Ok(Staged { dir, restart })
    }

    /// Services to restart: the manifest's list, else the configured default.
    fn read_manifest(&self, bundle_dir: &Path) -> std::result::Result<Vec<String>, String> {
        let path = bundle_dir.join(&self.config.manifest_name);
        if !path.exists() {
            return Ok(self.config.default_restart.clone());
        }
        let content = std::fs::read_to_string(&path)
            .map_err(|e| format!("cannot read {}: {e}", self.config.manifest_name))?;
        let manifest: BundleManifest = toml::from_str(&content)
            .map_err(|e| format!("invalid {}: {e}", self.config.manifest_name))?;
        Ok(manifest
            .services
            .required
            .unwrap_or_else(|| self.config.default_restart.clone()))
    }

    /// Run the hook if the payload ships one. Returns whether it ran.
    async fn run_hook(&self, bundle_dir: &Path, id: &BundleId) -> std::result::Result<bool, String> {
        let hook = bundle_dir.join(&self.config.hook_name);
        if !hook.is_file() {
            return Ok(false);
        }
        tracing::info!(bundle_id = %id, hook = %hook.display(), step = "hook", "running post-install hook");

        let mut cmd = tokio::process::Command::new(&self.config.hook_shell);
        cmd.arg(&hook)
            .current_dir(bundle_dir)
            .env("BUNDLE_ID", id.as_str())
            .env("BUNDLE_DIR", bundle_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let timeout = Duration::from_secs(self.config.hook_timeout_sec);
        let output = tokio::time::timeout(timeout, cmd.output())
            .await
            .map_err(|_| format!("{} exceeded {}s", self.config.hook_name, self.config.hook_timeout_sec))?
            .map_err(|e| format!("cannot run {}: {e}", self.config.hook_name))?;
        if output.status.success() {
            Ok(true)
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let stdout = String::from_utf8_lossy(&output.stdout);
            let reason = if stderr.trim().is_empty() { stdout } else { stderr };
            Err(format!(
                "{} {}: {}",
                self.config.hook_name,
                output.status,
                crate::identity::truncate(reason.trim(), 200)
            ))
        }
    }
}

struct Staged {
    dir: PathBuf,
    restart: Vec<String>,
}

/// The id the `active` symlink points at, if it is a valid bundle id.
#[must_use]
pub fn read_active(bundles_dir: &Path) -> Option<BundleId> {
    let target = std::fs::read_link(bundles_dir.join(ACTIVE_LINK)).ok()?;
    let name = target.file_name()?.to_str()?;
    BundleId::parse(name).ok()
}

/// Hidden extraction directories left by an interrupted deployment.
fn remove_extract_leftovers(bundles_dir: &Path) {
    let Ok(entries) = std::fs::read_dir(bundles_dir) else {
        return;
    };
    for entry in entries.flatten() {
        if entry.file_name().to_string_lossy().starts_with(".extract-") {
            tracing::debug!(path = %entry.path().display(), "removing extraction leftover");
            let _ = std::fs::remove_dir_all(entry.path());
        }
    }
}

/// Repoint `active` at `<bundles_dir>/<id>` with a single rename.
fn swap_active(bundles_dir: &Path, id: &BundleId) -> std::io::Result<()> {
    let link = bundles_dir.join(ACTIVE_LINK);
    let tmp = crate::fsutil::temp_sibling(&link);
    std::os::unix::fs::symlink(id.as_str(), &tmp)?;
    if let Err(e) = std::fs::rename(&tmp, &link) {
        let _ = std::fs::remove_file(&tmp);
        return Err(e);
    }
    if let Err(e) = crate::fsutil::write_atomic(&bundles_dir.join(ACTIVE_MARKER), format!("{id}\n").as_bytes()) {
        tracing::warn!(error = %e, "cannot update {ACTIVE_MARKER}");
    }
    Ok(())
}
