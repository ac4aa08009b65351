//! presetd
//!
//! Runs the configured worker presets, restarts them on crash when asked
//! to, and keeps a control connection to each running worker.

use std::collections::HashMap;
use std::path::PathBuf;

use clap::Parser;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::info;

use presetd_core::config::Config;
use presetd_core::tracing_init::{default_filter, init_tracing};
use presetd_daemon::orchestration::{PresetSnapshot, PresetStatus, Runner, RunnerOptions, Supervisor};

#[derive(Parser, Debug)]
#[command(name = "presetd")]
#[command(version, about = "presetd - worker process supervisor")]
struct Args {
    /// Config file path (created with defaults if missing)
    #[arg(long, env = "PRESETD_CONFIG")]
    config: Option<PathBuf>,

    /// Log level filter (e.g. "info", "debug", "warn").
    #[arg(long, default_value = "info", env = "PRESETD_LOG_LEVEL")]
    log_level: String,

    /// Output logs as JSON (for structured log aggregation).
    #[arg(long, env = "PRESETD_LOG_JSON")]
    log_json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(&default_filter(&args.log_level), args.log_json);

    let config_path = match args.config {
        Some(path) => path,
        None => default_config_path()?,
    };
    info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %config_path.display(),
        "Starting presetd"
    );
    let config = Config::load_or_create(&config_path)?;
    info!(
        presets = config.presets.len(),
        allow_concurrent_presets = config.general.allow_concurrent_presets,
        "Loaded config"
    );

    let (runner, events) = Runner::new(RunnerOptions::default());
    let (supervisor, handle) = Supervisor::new(config, runner, events);
    let shutdown = CancellationToken::new();
    let supervisor_task = tokio::spawn(supervisor.run(shutdown.clone()));
    tokio::spawn(log_status_changes(handle.subscribe()));

    #[cfg(unix)]
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    // `true` unsets $NOTIFY_SOCKET so workers and hooks don't inherit it.
    #[cfg(unix)]
    sd_notify::notify(true, &[sd_notify::NotifyState::Ready])?;

    #[cfg(unix)]
    let sigterm_future = sigterm.recv();
    #[cfg(not(unix))]
    let sigterm_future = std::future::pending::<Option<()>>();

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C shutdown signal");
        }
        _ = sigterm_future => {
            info!("Received SIGTERM shutdown signal");
        }
    }

    shutdown.cancel();
    supervisor_task.await?;
    info!("presetd stopped");
    Ok(())
}

async fn log_status_changes(mut statuses: watch::Receiver<Vec<PresetSnapshot>>) {
    let mut last: HashMap<String, PresetStatus> = HashMap::new();
    loop {
        for snapshot in statuses.borrow_and_update().iter() {
            if last.get(&snapshot.name) != Some(&snapshot.status) {
                info!(preset = %snapshot.name, status = %snapshot.status, "Preset status changed");
                last.insert(snapshot.name.clone(), snapshot.status);
            }
        }
        if statuses.changed().await.is_err() {
            break;
        }
    }
}

/// Default config location: `<config dir>/presetd/presetd.toml`.
fn default_config_path() -> anyhow::Result<PathBuf> {
    let dir =
        dirs::config_dir().ok_or_else(|| anyhow::anyhow!("Cannot determine config directory"))?;
    Ok(dir.join("presetd").join("presetd.toml"))
}
