//! Compositor detection and re-detection.
//!
//! The daemon never exits because no compositor is around. It probes every
//! `detect_retry_secs`, and while detached keeps answering the requests that
//! need no compositor. When a backend's event stream closes, the daemon drops
//! back here and probes again.

use anyhow::Result;
use common::{Command, MoniqueError, Response};
use tokio::time::{Instant, sleep_until};

use crate::backend::{self, CompositorBackend};
use crate::config::Config;
use crate::event_loop::{Channels, Daemon, LoopExit};
use crate::ipc_server::IpcRequest;
use crate::profile_store::ProfileStore;

/// Run until shutdown, reconnecting to the compositor as often as needed.
pub async fn run(config: &Config, store: ProfileStore, channels: &mut Channels) -> Result<()> {
    let retry = config.daemon.detect_retry();
    let mut attempts = 0u32;

    loop {
        match backend::detect_backend(&config.daemon).await {
            Ok(backend) => {
                attempts = 0;
                let kind = backend.kind();
                log::info!("Detected {} compositor", kind);

                match backend.subscribe_events().await {
                    Ok(stream) => {
                        let mut daemon =
                            Daemon::new(backend, config, store.clone(), channels.events.clone());
                        match daemon.run(stream, channels).await {
                            LoopExit::Shutdown => return Ok(()),
                            LoopExit::BackendLost => {
                                log::warn!("Connection to {} lost, re-detecting", kind);
                            }
                        }
                    }
                    Err(e) => log::warn!("Cannot subscribe to {} events: {}", kind, e),
                }
            }
            Err(e) => {
                attempts += 1;
                // Only the first miss is worth more than a debug line
                if attempts == 1 {
                    log::warn!("{}, retrying every {:?}", e, retry);
                } else {
                    log::debug!("{} (attempt {})", e, attempts);
                }
            }
        }

        if wait_detached(Instant::now() + retry, &store, channels).await == LoopExit::Shutdown {
            return Ok(());
        }
    }
}

/// Serve requests without a compositor until `until`.
async fn wait_detached(until: Instant, store: &ProfileStore, channels: &mut Channels) -> LoopExit {
    loop {
        tokio::select! {
            _ = sleep_until(until) => return LoopExit::BackendLost,

            request = channels.requests.recv() => match request {
                Some(IpcRequest { command: Command::Kill, reply }) => {
                    log::info!("Received kill command");
                    let _ = reply.send(Response::Ok);
                    return LoopExit::Shutdown;
                }
                Some(IpcRequest { command, reply }) => {
                    let _ = reply.send(detached_response(command, store, channels));
                }
                None => return LoopExit::Shutdown,
            },

            _ = channels.shutdown.changed() => return LoopExit::Shutdown,
        }
    }
}

fn detached_response(command: Command, store: &ProfileStore, channels: &Channels) -> Response {
    match command {
        Command::Ping => Response::Pong,
        Command::Status => Response::Status(channels.status(None, None, None)),
        Command::ListProfiles => {
            Response::Profiles(store.list().iter().map(|p| p.summary()).collect())
        }
        Command::DeleteProfile { name } => match store.delete(&name) {
            Ok(()) => Response::Ok,
            Err(e) => Response::Error(e),
        },
        _ => Response::Error(MoniqueError::Backend(
            "no supported compositor detected".to_string(),
        )),
    }
}
