//! Configuration types for the scanner agent.
//!
//! Load order: built-in defaults, then the TOML file, then a small set of
//! environment overrides kept for compatibility with existing unit files.

use crate::error::{AgentError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Top-level agent configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// NMS endpoint and transport settings.
    pub nms: NmsConfig,
    /// Poll loop tuning.
    pub dispatch: DispatchConfig,
    /// On-disk layout.
    pub paths: PathsConfig,
    /// systemd unit names and tooling.
    pub services: ServicesConfig,
    /// One-shot audio playback.
    pub audio: AudioConfig,
    /// Text-to-speech script.
    pub tts: TtsConfig,
    /// Wi-Fi scan script.
    pub scan: ScanConfig,
    /// AV stream defaults.
    pub av: AvConfig,
    /// Bundle deployment.
    pub bundle: BundleConfig,
    /// Voice interaction loop.
    pub voice: VoiceConfig,
    /// External completion service used in LLM mode.
    pub llm: LlmConfig,
}

/// NMS connection configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NmsConfig {
    /// Base URL, e.g. `http://192.168.137.3:8000`. Trailing slashes are ignored.
    pub base_url: String,
    /// Timeout applied to every poll, ack and report request.
    pub http_timeout_sec: u64,
    /// Maximum number of commands requested per poll.
    pub poll_limit: u32,
    /// Delivery attempts per ack before it is logged as undelivered.
    pub ack_attempts: u32,
    /// Delay between ack attempts (multiplied by the attempt number).
    pub ack_retry_delay_ms: u64,
    /// Registration hook run while the identity file is missing. Empty disables it.
    pub register_command: Vec<String>,
    /// Timeout for one run of the registration hook.
    pub register_timeout_sec: u64,
    /// Sleep between registration attempts.
    pub register_retry_sec: u64,
}

impl Default for NmsConfig {
    fn default() -> Self {
        Self {
            base_url: "http://192.168.137.3:8000".to_owned(),
            http_timeout_sec: 10,
            poll_limit: 10,
            ack_attempts: 3,
            ack_retry_delay_ms: 500,
            register_command: Vec::new(),
            register_timeout_sec: 10,
            register_retry_sec: 10,
        }
    }
}

impl NmsConfig {
    /// Base URL without trailing slashes.
    #[must_use]
    pub fn base(&self) -> &str {
        self.base_url.trim().trim_end_matches('/')
    }
}

/// Dispatcher timing configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Sleep between polls.
    pub poll_interval_sec: u64,
    /// Deadline for one command handler.
    pub command_timeout_sec: u64,
    /// Deadline for `bundle.apply`, which runs its own bounded steps.
    pub bundle_timeout_sec: u64,
    /// Consecutive poll failures before the sleep starts doubling.
    pub backoff_after_failures: u32,
    /// Upper bound of the poll backoff.
    pub max_backoff_sec: u64,
    /// Number of executed command ids remembered for duplicate suppression.
    pub completed_cache_size: usize,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            poll_interval_sec: 5,
            command_timeout_sec: 60,
            bundle_timeout_sec: 600,
            backoff_after_failures: 3,
            max_backoff_sec: 60,
            completed_cache_size: 512,
        }
    }
}

/// On-disk layout. Relative paths resolve against `base_dir`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// Root of the agent's files.
    pub base_dir: PathBuf,
    /// Single-line device identity file.
    pub identity_file: PathBuf,
    /// Bundle store containing `<bundle_id>/` and the `active` pointer.
    pub bundles_dir: PathBuf,
    /// Process records, one JSON file per slot.
    pub pid_dir: PathBuf,
    /// Voice configuration record.
    pub voice_config: PathBuf,
    /// AV stream configuration consumed by the stream service.
    pub av_config: PathBuf,
    /// Rolling log files.
    pub log_dir: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            base_dir: crate::agent_dirs::base_dir(),
            identity_file: PathBuf::from("scanner_name.txt"),
            bundles_dir: PathBuf::from("bundles"),
            pid_dir: PathBuf::from("run"),
            voice_config: PathBuf::from("voice/voice_config.json"),
            av_config: PathBuf::from("av/av_stream_config.json"),
            log_dir: PathBuf::from("logs"),
        }
    }
}

impl PathsConfig {
    /// Resolve `path` against `base_dir` unless it is already absolute.
    #[must_use]
    pub fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.base_dir.join(path)
        }
    }

    #[must_use]
    pub fn identity_file(&self) -> PathBuf {
        self.resolve(&self.identity_file)
    }

    #[must_use]
    pub fn bundles_dir(&self) -> PathBuf {
        self.resolve(&self.bundles_dir)
    }

    #[must_use]
    pub fn pid_dir(&self) -> PathBuf {
        self.resolve(&self.pid_dir)
    }

    #[must_use]
    pub fn voice_config(&self) -> PathBuf {
        self.resolve(&self.voice_config)
    }

    #[must_use]
    pub fn av_config(&self) -> PathBuf {
        self.resolve(&self.av_config)
    }

    #[must_use]
    pub fn log_dir(&self) -> PathBuf {
        self.resolve(&self.log_dir)
    }
}

/// systemd units managed by the agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServicesConfig {
    pub scan_unit: String,
    pub uploader_unit: String,
    pub avstream_unit: String,
    pub voice_unit: String,
    /// Path to `systemctl`.
    pub systemctl: PathBuf,
    /// Path to `sudo`, used non-interactively when the plain call fails.
    pub sudo: PathBuf,
    /// Retry failed calls through `sudo -n`.
    pub sudo_fallback: bool,
    /// Timeout for one `systemctl` invocation.
    pub timeout_sec: u64,
}

impl Default for ServicesConfig {
    fn default() -> Self {
        Self {
            scan_unit: "scanner-poller.service".to_owned(),
            uploader_unit: "scanner-uploader.service".to_owned(),
            avstream_unit: "scanner-avstream.service".to_owned(),
            voice_unit: "scanner-voice.service".to_owned(),
            systemctl: PathBuf::from("/usr/bin/systemctl"),
            sudo: PathBuf::from("/usr/bin/sudo"),
            sudo_fallback: true,
            timeout_sec: 30,
        }
    }
}

/// What `audio.play` does when a playback is already tracked.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplacePolicy {
    /// Stop the tracked playback, then start the new one.
    #[default]
    StopExisting,
    /// Refuse the new playback with an error.
    Reject,
}

/// One-shot audio playback configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    /// Player binary (mpv).
    pub player: PathBuf,
    /// Default `--ao` backend.
    pub ao: String,
    /// Default `--audio-device`.
    pub device: String,
    /// Default volume 0-100.
    pub volume: u8,
    pub replace_policy: ReplacePolicy,
    /// Grace period between the stop signal and a forced kill.
    pub stop_grace_ms: u64,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            player: PathBuf::from("/usr/bin/mpv"),
            ao: "alsa".to_owned(),
            device: "alsa/plughw:1,0".to_owned(),
            volume: 80,
            replace_policy: ReplacePolicy::StopExisting,
            stop_grace_ms: 1500,
        }
    }
}

/// Text-to-speech configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TtsConfig {
    /// Shell used to run the script.
    pub shell: PathBuf,
    /// Script invoked as `<shell> <script> <text> <lead_ms> <volume>`.
    pub script: PathBuf,
    pub lead_silence_ms: u32,
    pub volume: u8,
    pub timeout_sec: u64,
}

impl Default for TtsConfig {
    fn default() -> Self {
        Self {
            shell: PathBuf::from("/usr/bin/bash"),
            script: PathBuf::from("av/tts_say.sh"),
            lead_silence_ms: 300,
            volume: 90,
            timeout_sec: 30,
        }
    }
}

/// Wi-Fi scan configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanConfig {
    pub shell: PathBuf,
    /// Script invoked as `<shell> <script> once` by `scan.once`.
    pub script: PathBuf,
    pub once_timeout_sec: u64,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            shell: PathBuf::from("/usr/bin/bash"),
            script: PathBuf::from("scan_wifi.sh"),
            once_timeout_sec: 40,
        }
    }
}

/// AV stream defaults written when `av.stream.start` omits a field.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AvConfig {
    pub server: String,
    pub port: u16,
    /// Stream path; empty means the device identity.
    pub path: String,
    pub transport: String,
    pub video_dev: String,
    pub audio_dev: String,
    pub size: String,
    pub fps: u32,
}

impl Default for AvConfig {
    fn default() -> Self {
        Self {
            server: "192.168.137.3".to_owned(),
            port: 8554,
            path: String::new(),
            transport: "tcp".to_owned(),
            video_dev: "/dev/video0".to_owned(),
            audio_dev: "plughw:1,0".to_owned(),
            size: "1280x720".to_owned(),
            fps: 25,
        }
    }
}

/// Bundle deployment configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BundleConfig {
    /// Download staging directory, relative to the bundle store.
    pub staging_dir: PathBuf,
    /// Timeout for the payload download.
    pub fetch_timeout_sec: u64,
    /// Post-install hook name inside the payload.
    pub hook_name: String,
    pub hook_shell: PathBuf,
    pub hook_timeout_sec: u64,
    /// Optional manifest declaring the services to restart.
    pub manifest_name: String,
    /// Services stopped before a deployment.
    pub stop_services: Vec<String>,
    /// Services restarted when the payload declares none.
    pub default_restart: Vec<String>,
}

impl Default for BundleConfig {
    fn default() -> Self {
        Self {
            staging_dir: PathBuf::from(".staging"),
            fetch_timeout_sec: 120,
            hook_name: "install.sh".to_owned(),
            hook_shell: PathBuf::from("/usr/bin/bash"),
            hook_timeout_sec: 120,
            manifest_name: "bundle.toml".to_owned(),
            stop_services: vec![
                "scanner-poller.service".to_owned(),
                "scanner-uploader.service".to_owned(),
            ],
            default_restart: vec!["scanner-uploader.service".to_owned()],
        }
    }
}

/// Voice loop configuration. The runtime record in `paths.voice_config`
/// overrides the mode, timeouts, alias and script at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VoiceConfig {
    /// Run the voice loop inside the agent.
    pub enabled: bool,
    /// `deaf` or `name_listen`.
    pub initial_mode: String,
    pub conversation_timeout_sec: u64,
    pub llm_timeout_sec: u64,
    /// Spoken name; empty means the device identity.
    pub wake_alias: String,
    /// Accept the call sign alone as a wake match.
    pub callsign_only: bool,
    pub wake_ratio: f32,
    pub prefix_ratio: f32,
    pub phrase_ratio: f32,
    /// Recognizer run once per chunk; stdout is the transcript.
    pub recognizer_command: Vec<String>,
    pub recognizer_timeout_sec: u64,
    /// Transcripts shorter than this (after normalization) are ignored.
    pub min_chars: usize,
    /// Sleep between loop iterations while idle or deaf.
    pub tick_ms: u64,
    pub heartbeat_sec: u64,
    pub prompt_lead_silence_ms: u32,
    pub prompt_volume: u8,
    pub say_enter_name_listen: Option<String>,
    pub say_enter_conversation: Option<String>,
    pub say_enter_llm: Option<String>,
    pub say_enter_deaf: Option<String>,
    pub beep: BeepConfig,
}

impl Default for VoiceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            initial_mode: "deaf".to_owned(),
            conversation_timeout_sec: 20,
            llm_timeout_sec: 30,
            wake_alias: String::new(),
            callsign_only: true,
            wake_ratio: 0.82,
            prefix_ratio: 0.70,
            phrase_ratio: 0.80,
            recognizer_command: vec![
                "/usr/bin/bash".to_owned(),
                "voice/stt_chunk.sh".to_owned(),
            ],
            recognizer_timeout_sec: 6,
            min_chars: 3,
            tick_ms: 200,
            heartbeat_sec: 10,
            prompt_lead_silence_ms: 600,
            prompt_volume: 90,
            say_enter_name_listen: None,
            say_enter_conversation: None,
            say_enter_llm: None,
            say_enter_deaf: None,
            beep: BeepConfig::default(),
        }
    }
}

/// Tone played by `voice.test.prompt` (sox `play`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BeepConfig {
    pub player: PathBuf,
    pub duration_ms: u32,
    pub freq_hz: u32,
    pub volume: u8,
    pub timeout_sec: u64,
}

impl Default for BeepConfig {
    fn default() -> Self {
        Self {
            player: PathBuf::from("/usr/bin/play"),
            duration_ms: 120,
            freq_hz: 880,
            volume: 30,
            timeout_sec: 5,
        }
    }
}

/// Responses-style completion endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    /// Full endpoint URL.
    pub endpoint: String,
    pub model: String,
    /// File holding the bearer key.
    pub api_key_file: PathBuf,
    pub timeout_sec: u64,
    pub max_output_tokens: u32,
    pub temperature: f32,
    /// Sent as `metadata.session_id` when non-empty.
    pub session_id: String,
    /// Persisted `previous_response_id`.
    pub state_file: PathBuf,
    pub system_prompt: String,
    /// Spoken when the service returns no text.
    pub empty_reply: String,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            endpoint: "https://api.openai.com/v1/responses".to_owned(),
            model: "gpt-4o-mini".to_owned(),
            api_key_file: PathBuf::from("voice/llm_api_key.txt"),
            timeout_sec: 30,
            max_output_tokens: 300,
            temperature: 0.4,
            session_id: String::new(),
            state_file: PathBuf::from("voice/llm_state.json"),
            system_prompt: "You are a small helpful voice assistant running on a Raspberry Pi \
                            robot. Be brief, clear, and practical. No long explanations unless \
                            asked."
                .to_owned(),
            empty_reply: "I do not have an answer yet.".to_owned(),
        }
    }
}

impl AgentConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content).map_err(|e| AgentError::Config(e.to_string()))
    }

    /// Save configuration to a TOML file, creating parent directories as needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written or the config cannot be serialized.
    pub fn save_to_file(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content =
            toml::to_string_pretty(self).map_err(|e| AgentError::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Returns the default config file path (`<config_dir>/agent.toml`).
    #[must_use]
    pub fn default_config_path() -> PathBuf {
        crate::agent_dirs::config_dir().join("agent.toml")
    }

    /// Defaults, then `path` (or the default path when it exists), then env overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if an explicit file is missing or any layer is invalid.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(p) => Self::from_file(p)?,
            None => {
                let default_path = Self::default_config_path();
                if default_path.exists() {
                    Self::from_file(&default_path)?
                } else {
                    Self::default()
                }
            }
        };
        config.apply_env_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Apply the legacy environment overrides through `lookup`.
    ///
    /// # Errors
    ///
    /// Returns an error if a numeric override does not parse.
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        fn parse_num<T: std::str::FromStr>(key: &str, raw: &str) -> Result<T> {
            raw.trim()
                .parse()
                .map_err(|_| AgentError::Config(format!("{key} must be a number, got {raw:?}")))
        }

        if let Some(v) = lookup("NMS_BASE").filter(|v| !v.trim().is_empty()) {
            self.nms.base_url = v.trim().to_owned();
        }
        if let Some(v) = lookup("POLL_INTERVAL_SEC") {
            self.dispatch.poll_interval_sec = parse_num("POLL_INTERVAL_SEC", &v)?;
        }
        if let Some(v) = lookup("POLL_LIMIT") {
            self.nms.poll_limit = parse_num("POLL_LIMIT", &v)?;
        }
        if let Some(v) = lookup("HTTP_TIMEOUT_SEC") {
            self.nms.http_timeout_sec = parse_num("HTTP_TIMEOUT_SEC", &v)?;
        }
        if let Some(v) = lookup("SCANNER_BASE_DIR").filter(|v| !v.trim().is_empty()) {
            self.paths.base_dir = PathBuf::from(v.trim());
        }
        Ok(())
    }

    /// Reject configurations the agent cannot run with.
    ///
    /// # Errors
    ///
    /// Returns [`AgentError::Config`] naming the first offending field.
    pub fn validate(&self) -> Result<()> {
        let url = url::Url::parse(self.nms.base())
            .map_err(|e| AgentError::Config(format!("nms.base_url is not a URL: {e}")))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(AgentError::Config(format!(
                "nms.base_url must be http(s), got {}",
                url.scheme()
            )));
        }

        let positive = [
            ("nms.http_timeout_sec", self.nms.http_timeout_sec),
            ("nms.poll_limit", u64::from(self.nms.poll_limit)),
            ("nms.ack_attempts", u64::from(self.nms.ack_attempts)),
            ("dispatch.poll_interval_sec", self.dispatch.poll_interval_sec),
            ("dispatch.command_timeout_sec", self.dispatch.command_timeout_sec),
            ("dispatch.bundle_timeout_sec", self.dispatch.bundle_timeout_sec),
            ("dispatch.max_backoff_sec", self.dispatch.max_backoff_sec),
            ("dispatch.completed_cache_size", self.dispatch.completed_cache_size as u64),
            ("bundle.fetch_timeout_sec", self.bundle.fetch_timeout_sec),
            ("bundle.hook_timeout_sec", self.bundle.hook_timeout_sec),
            ("voice.conversation_timeout_sec", self.voice.conversation_timeout_sec),
            ("voice.llm_timeout_sec", self.voice.llm_timeout_sec),
            ("voice.tick_ms", self.voice.tick_ms),
            ("llm.timeout_sec", self.llm.timeout_sec),
            ("tts.timeout_sec", self.tts.timeout_sec),
            ("scan.once_timeout_sec", self.scan.once_timeout_sec),
        ];
        if let Some((name, _)) = positive.iter().find(|(_, v)| *v == 0) {
            return Err(AgentError::Config(format!("{name} must be greater than zero")));
        }

        // The bundle deadline must cover every bounded step of a deployment.
        let steps = self.bundle.fetch_timeout_sec.saturating_add(self.bundle.hook_timeout_sec);
        if self.dispatch.bundle_timeout_sec <= steps {
            return Err(AgentError::Config(format!(
                "dispatch.bundle_timeout_sec ({}) must exceed bundle.fetch_timeout_sec + bundle.hook_timeout_sec ({steps})",
                self.dispatch.bundle_timeout_sec
            )));
        }

        if !matches!(self.voice.initial_mode.as_str(), "deaf" | "name_listen") {
            return Err(AgentError::Config(format!(
                "voice.initial_mode must be deaf or name_listen, got {:?}",
                self.voice.initial_mode
            )));
        }
        if self.audio.volume > 100 || self.tts.volume > 100 {
            return Err(AgentError::Config("volume must be within 0-100".to_owned()));
        }
        Ok(())
    }
}
