//! The voicemode server binary.
//!
//! Composition root: builds the event log, registry, supervisor,
//! pronunciation engine, transports, and conversation engine, then serves
//! JSON-RPC on stdin/stdout. Stdout belongs to the RPC channel; tracing
//! goes to stderr and a rolling file under the voicemode home.

use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};
use voicemode::config::VoiceConfig;
use voicemode::converse::engine::ConversationEngine;
use voicemode::events::{EventLogger, SystemClock};
use voicemode::pronounce::PronounceManager;
use voicemode::providers::registry::ProviderRegistry;
use voicemode::rpc;
use voicemode::rpc::methods::RpcHandler;
use voicemode::audio::device_watcher::DeviceWatcher;
use voicemode::services::install::PathProbe;
use voicemode::services::supervisor::ServiceSupervisor;
use voicemode::transport::local::LocalTransport;
use voicemode::transport::room::RoomTransport;
use voicemode::transport::Transport;
use voicemode::voice_dirs;

/// Voice conversation server for text-oriented assistants.
#[derive(Parser)]
#[command(name = "voicemode", version, about)]
struct Cli {
    /// Path to a TOML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log filter, e.g. "voicemode=debug".
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match load_config(&cli) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("voicemode: fatal: {e}");
            return ExitCode::from(1);
        }
    };

    let _log_guard = match init_tracing(&cli, &config) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("voicemode: fatal: cannot initialize logging: {e}");
            return ExitCode::from(1);
        }
    };

    match run(config).await {
        Ok(interrupted) => {
            if interrupted {
                ExitCode::from(130)
            } else {
                ExitCode::SUCCESS
            }
        }
        Err(e) => {
            error!("fatal: {e}");
            eprintln!("voicemode: fatal: {e}");
            ExitCode::from(1)
        }
    }
}

fn load_config(cli: &Cli) -> anyhow::Result<VoiceConfig> {
    let config = match &cli.config {
        Some(path) => {
            let mut config = VoiceConfig::from_file(path)?;
            config.apply_env();
            config
        }
        None => VoiceConfig::load()?,
    };
    Ok(config)
}

fn init_tracing(
    cli: &Cli,
    config: &VoiceConfig,
) -> anyhow::Result<tracing_appender::non_blocking::WorkerGuard> {
    let default_filter = if config.debug {
        "voicemode=debug"
    } else {
        "voicemode=info"
    };
    let filter = match &cli.log_level {
        Some(level) => EnvFilter::new(level),
        None => EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(default_filter)),
    };

    std::fs::create_dir_all(voice_dirs::logs_dir())?;
    let file_appender = tracing_appender::rolling::daily(voice_dirs::logs_dir(), "voicemode.log");
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(fmt::layer().with_ansi(false).with_writer(file_writer))
        .init();
    Ok(guard)
}

/// Build the component graph and serve until stdin closes or Ctrl+C.
/// Returns whether shutdown was interrupt-driven.
async fn run(config: VoiceConfig) -> anyhow::Result<bool> {
    info!("voicemode v{} starting", env!("CARGO_PKG_VERSION"));
    info!("home: {}", voice_dirs::home_dir().display());

    let clock = Arc::new(SystemClock);
    let events = Arc::new(EventLogger::spawn(clock.clone())?);
    let registry = Arc::new(ProviderRegistry::new(&config.providers, clock.clone()));
    let pronounce = Arc::new(std::sync::RwLock::new(PronounceManager::load(
        &config.pronunciation,
    )));

    let supervisor = Arc::new(ServiceSupervisor::new(
        config.services.clone(),
        Arc::new(PathProbe),
    ));
    supervisor.autostart().await;

    let cancel = CancellationToken::new();
    tokio::spawn(Arc::clone(&supervisor).run_health_monitor(cancel.child_token()));

    // Surface device topology changes in the log; transports reopen
    // devices per operation, so the next converse picks up the change.
    let (device_tx, mut device_rx) = tokio::sync::mpsc::unbounded_channel();
    tokio::spawn(DeviceWatcher::new(device_tx, cancel.child_token()).run());
    tokio::spawn(async move {
        while let Some(change) = device_rx.recv().await {
            info!(input = ?change.input, output = ?change.output, "default audio devices changed");
        }
    });

    let local: Arc<dyn Transport> = Arc::new(LocalTransport::new(config.audio.clone()));
    let (room, room_joined): (Option<Arc<dyn Transport>>, Arc<AtomicBool>) =
        if config.room.api_key.is_empty() {
            (None, Arc::new(AtomicBool::new(false)))
        } else {
            let room = Arc::new(RoomTransport::new(config.room.clone()));
            // Join eagerly so `transport: auto` can prefer the room.
            // Failure is non-fatal; local remains available.
            if let Err(e) = room.join().await {
                tracing::warn!("room join failed: {e}");
            }
            let joined = room.joined_flag();
            (Some(room), joined)
        };

    let engine = Arc::new(ConversationEngine::new(
        config.clone(),
        Arc::clone(&registry),
        events.clone(),
        Arc::clone(&pronounce),
        local,
        room,
        room_joined,
    ));

    let handler = Arc::new(RpcHandler::new(
        engine,
        registry,
        supervisor,
        pronounce,
        clock,
        config.rpc.clone(),
    ));

    // Ctrl+C cancels the serve loop.
    let interrupted = Arc::new(AtomicBool::new(false));
    {
        let cancel = cancel.clone();
        let interrupted = Arc::clone(&interrupted);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("interrupt received, shutting down");
                interrupted.store(true, std::sync::atomic::Ordering::Relaxed);
                cancel.cancel();
            }
        });
    }

    rpc::serve_stdio(handler, cancel.clone()).await?;
    cancel.cancel();
    info!("voicemode stopped");
    Ok(interrupted.load(std::sync::atomic::Ordering::Relaxed))
}
