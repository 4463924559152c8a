//! markcast - main entry point
//!
//! Loads the config, starts every configured plugin, then runs the control
//! shell on stdin until `quit`, end of input, Ctrl+C or SIGTERM.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use markcast::config::{expand_path, Config, CoreConfig};
use markcast::{PluginContext, PluginManager, Shell, Show};
use markcast_common::Mediator;
use tokio::io::BufReader;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Command-line arguments for markcast
#[derive(Parser, Debug)]
#[command(name = "markcast")]
#[command(about = "Relays now-playing and topic markers to broadcast sinks")]
#[command(version)]
struct Args {
    /// Show name, as `<slug>-<episode>` (e.g. `fnt-200`)
    show: String,

    /// Config file (default: <config dir>/markcast/markcast.toml)
    #[arg(short, long, env = "MARKCAST_CONFIG")]
    config: Option<PathBuf>,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to start async runtime")?;
    let result = runtime.block_on(run(args));
    // The stdin reader sits on a blocking thread that never returns on its own
    runtime.shutdown_timeout(Duration::from_secs(1));
    result
}

async fn run(args: Args) -> Result<()> {
    let config_path = args
        .config
        .as_deref()
        .map(expand_path)
        .unwrap_or_else(Config::default_path);
    let config = Config::load(&config_path)
        .await
        .with_context(|| format!("Failed to load {}", config_path.display()))?;

    let _log_guard = init_tracing(&config.core)?;

    info!(
        "Starting markcast {} ({}, {} build, {})",
        env!("CARGO_PKG_VERSION"),
        env!("GIT_HASH"),
        env!("BUILD_PROFILE"),
        env!("BUILD_TIMESTAMP"),
    );
    info!("Config: {}", config_path.display());

    let show = Show::parse(&args.show);
    info!("Show: {} (slug {}, episode {})", show, show.slug(), show.episode());

    let mediator = Arc::new(
        Mediator::with_queue_max(config.core.broadcast_delay, config.core.queue_max)
            .context("Failed to create mediator")?,
    );
    info!(
        "Broadcast delay {:?}, queue limit {}",
        mediator.broadcast_delay(),
        config.core.queue_max
    );

    let mut manager = PluginManager::new(PluginContext { mediator, show });
    if manager.run_all(&config.plugins) == 0 {
        warn!("No plugins loaded");
    }
    let manager = Arc::new(manager);

    let mut shell = Shell::new(Arc::clone(&manager), config.core.macro_file.clone());
    if let Err(e) = shell.load_macros().await {
        warn!("Macros not loaded: {}", e);
    }

    tokio::select! {
        result = shell.run(BufReader::new(tokio::io::stdin()), tokio::io::stdout()) => {
            if let Err(e) = result {
                error!("Control shell failed: {}", e);
            }
        }
        _ = shutdown_signal() => {}
    }

    manager.shutdown().await;
    shell
        .save_macros()
        .await
        .with_context(|| format!("Failed to save macros to {}", shell.macro_file().display()))?;

    info!("Shutdown complete");
    Ok(())
}

/// Log to `log_file` when configured, otherwise to stderr
///
/// `RUST_LOG` takes precedence over `log_level`. The returned guard flushes
/// the file writer when dropped.
fn init_tracing(core: &CoreConfig) -> Result<Option<WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&core.log_level))
        .with_context(|| format!("Invalid log_level \"{}\"", core.log_level))?;

    let (file_layer, guard) = match &core.log_file {
        Some(path) => {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create {}", parent.display()))?;
            }
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Failed to open log file {}", path.display()))?;
            let (writer, guard) = tracing_appender::non_blocking(file);
            let layer = tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(writer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    let stderr_layer = file_layer
        .is_none()
        .then(|| tracing_subscriber::fmt::layer().with_writer(std::io::stderr));

    tracing_subscriber::registry()
        .with(filter)
        .with(stderr_layer)
        .with(file_layer)
        .init();
    Ok(guard)
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down");
        },
        _ = terminate => {
            info!("Received terminate signal, shutting down");
        },
    }
}
