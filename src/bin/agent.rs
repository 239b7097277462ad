//! Scanner agent binary: the long-running service plus local control commands.

use anyhow::Context as _;
use clap::{Parser, Subcommand};
use scanner_agent::bundle::manager::read_active;
use scanner_agent::identity::{read_identity, wait_for_identity};
use scanner_agent::process::{ProcessTracker, Slot};
use scanner_agent::voice::{CommandRecognizer, ResponsesClient, VoiceRecord, VoiceServiceDeps, demo_script};
use scanner_agent::{AgentConfig, AgentContext, Dispatcher, HttpNmsClient, NmsApi, VoiceMode, VoiceService};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// On-device control agent for NMS-managed scanners.
#[derive(Parser)]
#[command(name = "scanner-agent", version, about)]
struct Cli {
    /// Path to TOML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Poll the NMS and run the voice loop until interrupted.
    Run,

    /// Print identity, active bundle, voice mode and tracked processes.
    Status,

    /// Inspect or edit the voice record.
    Voice {
        #[command(subcommand)]
        command: VoiceCommand,
    },

    /// Inspect the effective configuration.
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
}

#[derive(Subcommand)]
enum VoiceCommand {
    /// Print the voice record.
    Show,
    /// Set the persisted mode (`deaf` or `name_listen`).
    Mode { mode: String },
    /// Edit the phrase table.
    Script {
        #[command(subcommand)]
        command: ScriptCommand,
    },
}

#[derive(Subcommand)]
enum ScriptCommand {
    /// Remove every entry.
    Clear,
    /// Replace the table with the demo entries.
    Demo,
}

#[derive(Subcommand)]
enum ConfigCommand {
    /// Print the effective configuration as TOML.
    Show,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = AgentConfig::load(cli.config.as_deref())?;

    match cli.command.unwrap_or(Command::Run) {
        Command::Run => run(config).await,
        Command::Status => {
            scanner_agent::logging::init_stderr();
            status(&config)
        }
        Command::Voice { command } => {
            scanner_agent::logging::init_stderr();
            voice(&config, command)
        }
        Command::Config {
            command: ConfigCommand::Show,
        } => {
            print!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
    }
}

async fn run(config: AgentConfig) -> anyhow::Result<()> {
    let _log_guard = scanner_agent::logging::init_with_file(&config.paths.log_dir())
        .with_context(|| format!("cannot open log dir {}", config.paths.log_dir().display()))?;
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "scanner agent starting");

    let ctx = Arc::new(AgentContext::init(config)?);
    let cfg = &ctx.config;

    // Stop cleanly on Ctrl-C or SIGTERM from systemd.
    {
        let ctx = Arc::clone(&ctx);
        tokio::spawn(async move {
            wait_for_signal().await;
            ctx.shutdown().await;
        });
    }

    let device_id = match wait_for_identity(
        &cfg.paths.identity_file(),
        &cfg.nms,
        &cfg.paths.base_dir,
        &ctx.shutdown,
    )
    .await
    {
        Ok(id) => id,
        Err(scanner_agent::AgentError::ShutDown) => return Ok(()),
        Err(e) => return Err(e.into()),
    };
    tracing::info!(device_id = %device_id, "identity ready");

    let voice_task = if cfg.voice.enabled {
        let deps = VoiceServiceDeps {
            machine: ctx.voice.clone(),
            speech: Arc::new(CommandRecognizer::new(
                &cfg.voice.recognizer_command,
                &cfg.paths.base_dir,
                Duration::from_secs(cfg.voice.recognizer_timeout_sec),
            )?),
            llm: Arc::new(ResponsesClient::new(cfg.llm.clone(), &cfg.paths.base_dir)?),
            output: ctx.output.clone(),
            config: cfg.voice.clone(),
            llm_request_timeout: Duration::from_secs(cfg.llm.timeout_sec),
            record_path: cfg.paths.voice_config(),
            identity: device_id.clone(),
            bundles_dir: cfg.paths.bundles_dir(),
        };
        let cancel = ctx.shutdown.clone();
        Some(tokio::spawn(VoiceService::new(deps).run(cancel)))
    } else {
        tracing::info!("voice loop disabled");
        None
    };

    let nms: Arc<dyn NmsApi> = Arc::new(HttpNmsClient::new(
        cfg.nms.base(),
        Duration::from_secs(cfg.nms.http_timeout_sec),
    )?);
    Dispatcher::new(Arc::clone(&ctx), nms, device_id).run().await;

    ctx.shutdown().await;
    if let Some(task) = voice_task
        && let Err(e) = task.await
    {
        tracing::warn!(error = %e, "voice loop task ended abnormally");
    }
    tracing::info!("scanner agent stopped");
    Ok(())
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
                return;
            }
            Err(e) => tracing::warn!(error = %e, "cannot listen for SIGTERM"),
        }
    }
    let _ = tokio::signal::ctrl_c().await;
}

fn status(config: &AgentConfig) -> anyhow::Result<()> {
    let paths = &config.paths;
    let tracker = ProcessTracker::new(paths.pid_dir())?;
    let mut processes = serde_json::Map::new();
    for slot in Slot::ALL {
        if let Some(rec) = tracker.active(slot)? {
            processes.insert(slot.as_str().to_owned(), serde_json::to_value(rec)?);
        }
    }
    let record = VoiceRecord::load(&paths.voice_config())?;
    let status = serde_json::json!({
        "identity": read_identity(&paths.identity_file()),
        "active_bundle": read_active(&paths.bundles_dir()).map(|b| b.to_string()),
        "voice_mode": record.as_ref().map(|r| r.light_mode().as_str()),
        "processes": processes,
    });
    println!("{}", serde_json::to_string_pretty(&status)?);
    Ok(())
}

fn voice(config: &AgentConfig, command: VoiceCommand) -> anyhow::Result<()> {
    let path = config.paths.voice_config();
    let seed = VoiceRecord::from_config(&config.voice);
    let record = match command {
        VoiceCommand::Show => VoiceRecord::load_or_init(&path, &seed)?,
        VoiceCommand::Mode { mode } => {
            let mode = VoiceMode::parse(&mode)
                .filter(|m| m.is_externally_reachable())
                .with_context(|| format!("mode must be deaf or name_listen, got {mode:?}"))?;
            VoiceRecord::update(&path, &seed, |r| r.set_mode(mode))?
        }
        VoiceCommand::Script {
            command: ScriptCommand::Clear,
        } => VoiceRecord::update(&path, &seed, |r| {
            r.script.clear();
            Ok(())
        })?,
        VoiceCommand::Script {
            command: ScriptCommand::Demo,
        } => VoiceRecord::update(&path, &seed, |r| {
            r.script = demo_script();
            Ok(())
        })?,
    };
    println!("{}", serde_json::to_string_pretty(&record)?);
    Ok(())
}
