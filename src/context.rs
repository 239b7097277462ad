//! Owned runtime state shared by the dispatcher and the voice loop.
//!
//! # Initialization order
//!
//! 1. directories under the base dir
//! 2. [`ProcessTracker`] (pid records)
//! 3. [`ServiceManager`]
//! 4. [`BundleManager`] (needs the service manager)
//! 5. voice record, then [`VoiceMachine`] seeded from it
//! 6. [`VoiceOutput`] (needs the tracker)
//!
//! Teardown runs the other way: cancel, freeze the voice machine, refuse new
//! process starts, stop every tracked child.

use crate::bundle::BundleManager;
use crate::config::AgentConfig;
use crate::error::Result;
use crate::process::ProcessTracker;
use crate::services::{ServiceManager, SystemctlManager};
use crate::voice::{VoiceMachine, VoiceOutput, VoiceRecord, VoiceSettings};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Grace given to children stopped during teardown.
const TEARDOWN_GRACE: Duration = Duration::from_secs(2);

pub struct AgentContext {
    pub config: AgentConfig,
    pub tracker: ProcessTracker,
    pub services: Arc<dyn ServiceManager>,
    pub bundles: BundleManager,
    pub voice: VoiceMachine,
    pub output: VoiceOutput,
    pub shutdown: CancellationToken,
}

impl std::fmt::Debug for AgentContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentContext")
            .field("base_dir", &self.config.paths.base_dir)
            .field("tracker", &self.tracker)
            .field("bundles", &self.bundles)
            .finish_non_exhaustive()
    }
}

impl AgentContext {
    /// Build the context with the systemctl service manager.
    ///
    /// # Errors
    ///
    /// Returns an error if a directory, the voice record, or a client cannot
    /// be set up.
    pub fn init(config: AgentConfig) -> Result<Self> {
        let services: Arc<dyn ServiceManager> = Arc::new(SystemctlManager::new(config.services.clone()));
        Self::with_services(config, services)
    }

    /// Build the context around a given service manager.
    ///
    /// # Errors
    ///
    /// See [`AgentContext::init`].
    pub fn with_services(config: AgentConfig, services: Arc<dyn ServiceManager>) -> Result<Self> {
        let paths = &config.paths;

        // 1. Directories.
        std::fs::create_dir_all(&paths.base_dir)?;

        // 2. Process records.
        let tracker = ProcessTracker::new(paths.pid_dir())?;

        // 3-4. Services and bundle store.
        let bundles = BundleManager::new(paths.bundles_dir(), config.bundle.clone(), Arc::clone(&services))?;

        // 5. Voice state, seeded from the persisted record.
        let record = VoiceRecord::load_or_init(&paths.voice_config(), &VoiceRecord::from_config(&config.voice))?;
        let voice = VoiceMachine::new(
            record.light_mode(),
            VoiceSettings {
                wake_alias: record.wake_alias.clone(),
                conversation_timeout: Duration::from_secs(record.conversation_timeout_sec),
                llm_timeout: Duration::from_secs(record.llm_timeout_sec),
                script: record.script,
            },
        )?;

        // 6. Spoken output.
        let output = VoiceOutput::new(
            tracker.clone(),
            paths.base_dir.clone(),
            config.tts.clone(),
            config.voice.beep.clone(),
        );

        tracing::info!(
            base_dir = %paths.base_dir.display(),
            voice_mode = %voice.mode()?,
            active_bundle = ?bundles.active().map(|b| b.to_string()),
            "agent context ready"
        );
        Ok(Self {
            config,
            tracker,
            services,
            bundles,
            voice,
            output,
            shutdown: CancellationToken::new(),
        })
    }

    /// Seed used when the voice record must be (re)created.
    #[must_use]
    pub fn voice_record_seed(&self) -> VoiceRecord {
        VoiceRecord::from_config(&self.config.voice)
    }

    /// Tear down in reverse initialization order. Idempotent.
    pub async fn shutdown(&self) {
        tracing::info!("agent shutting down");
        self.shutdown.cancel();
        self.voice.shutdown();
        self.tracker.shutdown();
        self.tracker.stop_all(TEARDOWN_GRACE).await;
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use crate::error::AgentError;
    use crate::process::{LaunchSpec, Slot};
    use crate::voice::VoiceMode;

    fn config(dir: &std::path::Path) -> AgentConfig {
        let mut config = AgentConfig::default();
        config.paths.base_dir = dir.to_path_buf();
        config
    }

    #[tokio::test]
    async fn init_creates_layout_and_seeds_record() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = AgentContext::init(config(dir.path())).unwrap();
        assert!(dir.path().join("run").is_dir());
        assert!(dir.path().join("bundles").is_dir());
        let record = VoiceRecord::load(&dir.path().join("voice/voice_config.json")).unwrap().unwrap();
        assert_eq!(record.light_mode(), VoiceMode::Deaf);
        assert_eq!(ctx.voice.mode().unwrap(), VoiceMode::Deaf);
    }

    #[tokio::test]
    async fn machine_starts_in_persisted_mode() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("voice/voice_config.json");
        let mut record = VoiceRecord::default();
        record.set_mode(VoiceMode::NameListen).unwrap();
        record.save(&path).unwrap();

        let ctx = AgentContext::init(config(dir.path())).unwrap();
        assert_eq!(ctx.voice.mode().unwrap(), VoiceMode::NameListen);
    }

    #[tokio::test]
    async fn shutdown_stops_children_and_refuses_work() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = AgentContext::init(config(dir.path())).unwrap();
        ctx.tracker
            .start(Slot::Audio, &LaunchSpec::new("sleep").arg("30"))
            .await
            .unwrap();

        ctx.shutdown().await;
        assert!(ctx.shutdown.is_cancelled());
        assert!(ctx.tracker.active(Slot::Audio).unwrap().is_none());
        assert!(matches!(
            ctx.tracker.start(Slot::Audio, &LaunchSpec::new("sleep").arg("1")).await,
            Err(AgentError::ShutDown)
        ));
        assert!(ctx.voice.request_external(VoiceMode::NameListen).is_err());
    }
}
