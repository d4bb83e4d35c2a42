mod applier;
mod backend;
mod clamshell;
mod config;
mod debounce;
mod error;
mod event_loop;
mod ipc_server;
mod lid;
mod macros;
mod migrator;
mod profile_store;
mod supervisor;

use anyhow::{Context, Result};
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::{broadcast, mpsc, watch};

use crate::event_loop::Channels;
use crate::profile_store::ProfileStore;

/// Capacity of the watcher broadcast; slower watchers skip ahead
const EVENT_BACKLOG: usize = 64;

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    // Logging is not up yet, so keep the error until it is
    let loaded = config::Config::load();
    let log_level = match loaded {
        Ok(ref cfg) => cfg.general.log_level.clone(),
        Err(_) => "info".to_string(),
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_level)).init();

    log::info!("Starting monique daemon v{}", env!("CARGO_PKG_VERSION"));

    let config = match loaded {
        Ok(cfg) => {
            log::info!("Configuration:");
            log::info!("  - Log level: {}", cfg.general.log_level);
            log::info!("  - Debounce: {}ms", cfg.daemon.debounce_ms);
            log::info!("  - Confirm timeout: {}s", cfg.daemon.confirm_timeout_secs);
            log::info!(
                "  - Auto apply: {}",
                if cfg.daemon.auto_apply { "yes" } else { "no" }
            );
            log::info!("  - Tie break: {:?}", cfg.matching.tie_break);
            log::info!(
                "  - Workspace migration: {}",
                if cfg.workspaces.migrate { "yes" } else { "no" }
            );
            log::info!("  - Clamshell: {:?}", cfg.clamshell.mode);
            cfg
        }
        Err(e) => {
            log::warn!("Failed to load config: {:#}. Using defaults.", e);
            config::Config::default()
        }
    };

    let store = ProfileStore::new(config.profiles_dir()?, config.matching.tie_break);
    log::info!("Profiles directory: {}", store.dir().display());

    let (events, _) = broadcast::channel(EVENT_BACKLOG);
    let (request_tx, request_rx) = mpsc::channel(16);

    let socket_path = common::get_socket_path();
    let listener = ipc_server::bind(&socket_path).await?;
    tokio::spawn(ipc_server::serve(
        listener,
        socket_path.clone(),
        request_tx,
        events.clone(),
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut sigterm =
        signal(SignalKind::terminate()).context("Failed to set up SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("Failed to set up SIGINT handler")?;
    tokio::spawn(async move {
        tokio::select! {
            _ = sigterm.recv() => {
                log::info!("Received SIGTERM, shutting down...");
            }
            _ = sigint.recv() => {
                log::info!("Received SIGINT, shutting down...");
            }
        }
        let _ = shutdown_tx.send(true);
    });

    let mut channels = Channels {
        requests: request_rx,
        lid: lid::spawn_watcher(),
        lid_alive: true,
        shutdown: shutdown_rx,
        events,
        started: std::time::Instant::now(),
    };

    supervisor::run(&config, store, &mut channels).await?;

    let _ = std::fs::remove_file(&socket_path);

    log::info!("Daemon shutting down");
    Ok(())
}
