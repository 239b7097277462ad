//! Action handlers.
//!
//! Each handler returns the ack detail on success. Arguments have already been
//! validated by [`crate::actions::validate`]; handlers only deal with
//! execution failures.

use crate::actions::{ActionRequest, AudioPlayArgs, AudioStopArgs, AvStreamArgs, TestPromptArgs, TtsSayArgs};
use crate::bundle::BundleDescriptor;
use crate::config::ReplacePolicy;
use crate::context::AgentContext;
use crate::error::{AgentError, Result};
use crate::nms::{AckStatus, BundleReport, NmsApi};
use crate::process::{LaunchSpec, Slot, StopRequest};
use crate::voice::{ScriptEntry, VoiceMode, VoiceRecord};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Stream settings consumed by the AV service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
struct AvStreamConfig {
    server: String,
    port: u16,
    path: String,
    transport: String,
    video_dev: String,
    audio_dev: String,
    size: String,
    fps: u32,
}

/// Runs validated requests against the agent context.
pub struct Executor {
    ctx: Arc<AgentContext>,
    nms: Arc<dyn NmsApi>,
    device_id: String,
}

impl Executor {
    #[must_use]
    pub fn new(ctx: Arc<AgentContext>, nms: Arc<dyn NmsApi>, device_id: impl Into<String>) -> Self {
        Self {
            ctx,
            nms,
            device_id: device_id.into(),
        }
    }

    #[must_use]
    pub fn context(&self) -> &Arc<AgentContext> {
        &self.ctx
    }

    /// Execute one request.
    ///
    /// # Errors
    ///
    /// Returns the handler's execution error; the dispatcher turns it into an
    /// `error` ack.
    pub async fn execute(&self, request: ActionRequest) -> Result<String> {
        let units = &self.ctx.config.services;
        match request {
            ActionRequest::ScanStart => self.ctx.services.start(&units.scan_unit).await,
            ActionRequest::ScanStop => self.ctx.services.stop(&units.scan_unit).await,
            ActionRequest::ScanOnce => self.scan_once().await,
            ActionRequest::BundleApply(desc) => self.bundle_apply(&desc).await,
            ActionRequest::AvStreamStart(args) => self.av_stream_start(&args).await,
            ActionRequest::AvStreamStop => self.ctx.services.stop(&units.avstream_unit).await,
            ActionRequest::AudioPlay(args) => self.audio_play(&args).await,
            ActionRequest::AudioStop(args) => self.audio_stop(&args).await,
            ActionRequest::TtsSay(TtsSayArgs {
                text,
                lead_silence_ms,
                volume,
            }) => self.ctx.output.say(&text, lead_silence_ms, volume).await,
            ActionRequest::VoiceModeSet(mode) => self.voice_mode_set(mode),
            ActionRequest::VoiceScriptSet(entries) => self.voice_script_set(entries),
            ActionRequest::VoiceTestPrompt(args) => self.voice_test_prompt(&args).await,
        }
    }

    async fn scan_once(&self) -> Result<String> {
        let base = &self.ctx.config.paths.base_dir;
        let scan = &self.ctx.config.scan;
        let spec = LaunchSpec::new(&scan.shell)
            .arg(base.join(&scan.script))
            .arg("once")
            .current_dir(base);
        let report = self
            .ctx
            .tracker
            .start_and_wait(Slot::Scan, &spec, Duration::from_secs(scan.once_timeout_sec))
            .await?;
        if report.success() {
            Ok(format!("scan.once ok pid={}", report.pid))
        } else {
            Err(AgentError::Process(format!("scan.once {}", report.failure_detail())))
        }
    }

    /// The deployment runs on its own task. A dispatcher deadline only stops
    /// the wait: services stopped for the attempt are still restored and the
    /// NMS still gets its report.
    async fn bundle_apply(&self, desc: &BundleDescriptor) -> Result<String> {
        let ctx = Arc::clone(&self.ctx);
        let nms = Arc::clone(&self.nms);
        let device_id = self.device_id.clone();
        let desc = desc.clone();
        tokio::spawn(async move { deploy_and_report(&ctx, nms.as_ref(), &device_id, &desc).await })
            .await
            .map_err(|e| AgentError::Process(format!("bundle deployment task failed: {e}")))?
    }

    async fn av_stream_start(&self, args: &AvStreamArgs) -> Result<String> {
        let defaults = &self.ctx.config.av;
        let path = args
            .path
            .clone()
            .or_else(|| (!defaults.path.is_empty()).then(|| defaults.path.clone()))
            .unwrap_or_else(|| self.device_id.clone());
        let stream = AvStreamConfig {
            server: args.server.clone().unwrap_or_else(|| defaults.server.clone()),
            port: args.port.unwrap_or(defaults.port),
            path,
            transport: args.transport.clone().unwrap_or_else(|| defaults.transport.clone()),
            video_dev: args.video_dev.clone().unwrap_or_else(|| defaults.video_dev.clone()),
            audio_dev: args.audio_dev.clone().unwrap_or_else(|| defaults.audio_dev.clone()),
            size: args.size.clone().unwrap_or_else(|| defaults.size.clone()),
            fps: args.fps.unwrap_or(defaults.fps),
        };

        let config_path = self.ctx.config.paths.av_config();
        let json = serde_json::to_vec_pretty(&stream).map_err(std::io::Error::other)?;
        crate::fsutil::write_atomic(&config_path, &json)?;
        tracing::info!(
            path = %config_path.display(),
            server = %stream.server,
            port = stream.port,
            stream_path = %stream.path,
            "av stream config written"
        );

        let started = self.ctx.services.start(&self.ctx.config.services.avstream_unit).await?;
        Ok(format!(
            "{started}; rtsp://{}:{}/{}",
            stream.server, stream.port, stream.path
        ))
    }

    async fn audio_play(&self, args: &AudioPlayArgs) -> Result<String> {
        let audio = &self.ctx.config.audio;

        // 1. Resolve and check the file before touching the current playback.
        let file = PathBuf::from(&args.file);
        let file = if file.is_absolute() {
            file
        } else {
            self.ctx.config.paths.base_dir.join(file)
        };
        if !file.is_file() {
            return Err(AgentError::Process(format!("audio file not found: {}", file.display())));
        }

        // 2. Apply the replace policy.
        let stop_existing = args
            .stop_existing
            .unwrap_or(audio.replace_policy == ReplacePolicy::StopExisting);
        if stop_existing {
            let outcome = self
                .ctx
                .tracker
                .stop(Slot::Audio, StopRequest::term(Duration::from_millis(audio.stop_grace_ms)))
                .await?;
            tracing::debug!("{}", outcome.detail(Slot::Audio));
        } else if let Some(current) = self.ctx.tracker.active(Slot::Audio)? {
            return Err(AgentError::Process(format!(
                "audio already playing pid={} since {}; not replacing",
                current.pid, current.started_at
            )));
        }

        // 3. Launch.
        let ao = args.ao.as_deref().unwrap_or(&audio.ao);
        let device = args.audio_device.as_deref().unwrap_or(&audio.device);
        let volume = args.volume.unwrap_or(audio.volume).min(100);
        let spec = LaunchSpec::new(&audio.player)
            .arg(format!("--ao={ao}"))
            .arg(format!("--audio-device={device}"))
            .arg("--no-video")
            .arg(format!("--volume={volume}"))
            .arg(&file);
        let pid = self.ctx.tracker.start(Slot::Audio, &spec).await?;
        Ok(format!("audio.play started pid={pid} file={}", file.display()))
    }

    async fn audio_stop(&self, args: &AudioStopArgs) -> Result<String> {
        let grace = args
            .grace
            .unwrap_or_else(|| Duration::from_millis(self.ctx.config.audio.stop_grace_ms));
        let outcome = self
            .ctx
            .tracker
            .stop(
                Slot::Audio,
                StopRequest {
                    signal: args.signal,
                    grace,
                    force_kill: true,
                },
            )
            .await?;
        Ok(outcome.detail(Slot::Audio))
    }

    fn voice_mode_set(&self, mode: VoiceMode) -> Result<String> {
        let transition = self.ctx.voice.request_external(mode)?;
        let path = self.ctx.config.paths.voice_config();
        if let Err(e) = VoiceRecord::update(&path, &self.ctx.voice_record_seed(), |r| r.set_mode(mode)) {
            tracing::warn!(path = %path.display(), error = %e, "voice mode applied but not persisted");
        }
        Ok(if transition.changed() {
            format!("voice mode {} -> {}", transition.from, transition.to)
        } else {
            format!("voice mode already {}", transition.to)
        })
    }

    fn voice_script_set(&self, entries: Vec<ScriptEntry>) -> Result<String> {
        let count = entries.len();
        self.ctx.voice.replace_script(entries.clone())?;
        let path = self.ctx.config.paths.voice_config();
        if let Err(e) = VoiceRecord::update(&path, &self.ctx.voice_record_seed(), |r| {
            r.script = entries;
            Ok(())
        }) {
            tracing::warn!(path = %path.display(), error = %e, "voice script applied but not persisted");
        }
        Ok(format!("voice script set: {count} entries"))
    }

    async fn voice_test_prompt(&self, args: &TestPromptArgs) -> Result<String> {
        let voice = &self.ctx.config.voice;
        self.ctx
            .output
            .test_prompt(
                args.text.as_deref(),
                args.beep,
                voice.prompt_lead_silence_ms,
                voice.prompt_volume,
            )
            .await
    }
}

/// Apply `desc` and send the bundle report, whatever the outcome.
async fn deploy_and_report(
    ctx: &AgentContext,
    nms: &dyn NmsApi,
    device_id: &str,
    desc: &BundleDescriptor,
) -> Result<String> {
    let result = ctx.bundles.apply(desc).await;
    let installed_version = ctx.bundles.active().map(|id| id.to_string()).unwrap_or_default();
    let report = match &result {
        Ok(deploy) => BundleReport {
            status: AckStatus::Ok,
            detail: deploy.detail(),
            installed_version,
        },
        Err(e) => BundleReport {
            status: AckStatus::Error,
            detail: e.to_string(),
            installed_version,
        },
    };
    if let Err(e) = nms.report_bundle(device_id, &report).await {
        tracing::warn!(bundle_id = %desc.bundle_id, error = %e, "bundle report not delivered");
    }
    Ok(result?.detail())
}
