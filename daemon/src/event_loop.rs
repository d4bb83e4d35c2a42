//! The daemon's single-threaded select loop for one compositor connection.

use common::{Command, DaemonEvent, DaemonStatus, MoniqueError, Response, SessionInfo};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::{Instant, sleep_until};

use crate::applier::ConfigApplier;
use crate::backend::{CompositorBackend, EventStream};
use crate::clamshell::ClamshellController;
use crate::config::Config;
use crate::debounce::Debouncer;
use crate::error::BackendError;
use crate::ipc_server::IpcRequest;
use crate::lid::LidState;
use crate::log_and_continue;
use crate::profile_store::ProfileStore;

/// Why [`Daemon::run`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopExit {
    Shutdown,
    BackendLost,
}

/// Inputs that outlive a compositor connection.
pub struct Channels {
    pub requests: mpsc::Receiver<IpcRequest>,
    pub lid: watch::Receiver<LidState>,
    /// False once the lid watcher has gone away
    pub lid_alive: bool,
    pub shutdown: watch::Receiver<bool>,
    pub events: broadcast::Sender<DaemonEvent>,
    pub started: std::time::Instant,
}

impl Channels {
    pub fn status(
        &self,
        backend: Option<String>,
        active_profile: Option<String>,
        session: Option<SessionInfo>,
    ) -> DaemonStatus {
        DaemonStatus {
            version: env!("CARGO_PKG_VERSION").to_string(),
            uptime_secs: self.started.elapsed().as_secs(),
            backend,
            active_profile,
            session,
        }
    }

    fn lid_state(&self) -> LidState {
        *self.lid.borrow()
    }
}

pub struct Daemon<B> {
    applier: ConfigApplier<B>,
    debouncer: Debouncer,
    clamshell: ClamshellController,
    auto_apply: bool,
}

impl<B: CompositorBackend> Daemon<B> {
    pub fn new(
        backend: B,
        config: &Config,
        store: ProfileStore,
        events: broadcast::Sender<DaemonEvent>,
    ) -> Self {
        let applier = ConfigApplier::new(
            backend,
            store,
            config.daemon.confirm_timeout(),
            config.workspaces.migrate,
            events,
        );

        Self {
            applier,
            debouncer: Debouncer::new(config.daemon.debounce()),
            clamshell: ClamshellController::new(config.clamshell.mode),
            auto_apply: config.daemon.auto_apply,
        }
    }

    /// Serve until shutdown or until the compositor goes away.
    pub async fn run(&mut self, mut stream: EventStream, channels: &mut Channels) -> LoopExit {
        let kind = self.applier.backend().kind();

        // Whatever is plugged in at startup counts as a hotplug
        if let Err(e) = self.settle(channels).await
            && e.is_unavailable()
        {
            log::warn!("{} stopped answering: {}", kind, e);
            return LoopExit::BackendLost;
        }

        loop {
            let settle_at = self.debouncer.deadline();
            let confirm_at = self.applier.deadline();

            tokio::select! {
                event = stream.recv() => match event {
                    Some(event) => {
                        log::debug!("Compositor event: {:?}", event);
                        self.debouncer.poke();
                    }
                    None => {
                        log::warn!("Lost the {} event stream", kind);
                        self.abandon_session().await;
                        return LoopExit::BackendLost;
                    }
                },

                _ = sleep_until(settle_at.unwrap_or_else(Instant::now)), if settle_at.is_some() => {
                    if self.debouncer.fire()
                        && let Err(e) = self.settle(channels).await
                    {
                        if e.is_unavailable() {
                            log::warn!("{} stopped answering: {}", kind, e);
                            return LoopExit::BackendLost;
                        }
                        log::error!("Settle failed: {}", e);
                    }
                }

                _ = sleep_until(confirm_at.unwrap_or_else(Instant::now)), if confirm_at.is_some() => {
                    log_and_continue!(self.applier.expire().await, "revert unconfirmed layout");
                }

                changed = channels.lid.changed(), if channels.lid_alive => match changed {
                    Ok(()) => {
                        log_and_continue!(self.applier.refresh().await, "query state after lid change");
                        self.observe_clamshell(channels).await;
                    }
                    Err(_) => channels.lid_alive = false,
                },

                request = channels.requests.recv() => match request {
                    Some(IpcRequest { command: Command::Kill, reply }) => {
                        log::info!("Received kill command");
                        let _ = reply.send(Response::Ok);
                        self.abandon_session().await;
                        return LoopExit::Shutdown;
                    }
                    Some(IpcRequest { command, reply }) => {
                        let response = self.handle(command, channels).await;
                        let _ = reply.send(response);
                    }
                    None => {
                        self.abandon_session().await;
                        return LoopExit::Shutdown;
                    }
                },

                _ = channels.shutdown.changed() => {
                    self.abandon_session().await;
                    return LoopExit::Shutdown;
                }
            }
        }
    }

    /// Re-query after a quiet window, match, then let the clamshell
    /// controller have its say.
    async fn settle(&mut self, channels: &Channels) -> Result<(), BackendError> {
        if self.applier.settle(self.auto_apply).await? {
            self.clamshell.reset();
        }
        self.observe_clamshell(channels).await;
        Ok(())
    }

    async fn observe_clamshell(&mut self, channels: &Channels) {
        let preferred = self.applier.preferred_layout();
        let changes = self.clamshell.observe(
            channels.lid_state(),
            self.applier.snapshot(),
            preferred.as_deref(),
        );
        if changes.is_empty() {
            return;
        }

        match self.applier.apply_direct(&changes).await {
            Ok(()) => {
                for change in changes {
                    log::info!(
                        "Clamshell: {} {}",
                        if change.enabled { "enabled" } else { "disabled" },
                        change.name
                    );
                    let _ = channels.events.send(DaemonEvent::Clamshell {
                        output: change.name,
                        enabled: change.enabled,
                    });
                }
            }
            Err(e) => log::error!("Clamshell change failed: {}", e),
        }
    }

    async fn handle(&mut self, command: Command, channels: &Channels) -> Response {
        log::debug!("Handling command: {:?}", command);

        match command {
            Command::Ping => Response::Pong,

            Command::Status => Response::Status(channels.status(
                Some(self.applier.backend().kind().to_string()),
                self.applier.active_profile().map(str::to_string),
                self.applier.session_info(),
            )),

            Command::ListOutputs => match self.applier.refresh().await {
                Ok(snapshot) => Response::Outputs(snapshot.clone()),
                Err(e) => Response::Error(e.into()),
            },

            Command::ListProfiles => Response::Profiles(
                self.applier
                    .store()
                    .list()
                    .iter()
                    .map(|p| p.summary())
                    .collect(),
            ),

            Command::ApplyProfile { name } => {
                log::info!("Applying profile '{}' on request", name);
                match self.applier.apply_named(&name).await {
                    Ok(_) => Response::Ok,
                    Err(e) => Response::Error(e),
                }
            }

            Command::DeleteProfile { name } => match self.applier.store().delete(&name) {
                Ok(()) => {
                    log::info!("Deleted profile '{}'", name);
                    Response::Ok
                }
                Err(e) => Response::Error(e),
            },

            Command::Confirm => match self.applier.confirm() {
                Ok(()) => Response::Ok,
                Err(e) => Response::Error(e),
            },

            Command::Revert => match self.applier.revert().await {
                Ok(()) => Response::Ok,
                Err(e) => Response::Error(e),
            },

            Command::Watch | Command::Kill => Response::Error(MoniqueError::Ipc(
                "command is handled by the connection".to_string(),
            )),
        }
    }

    /// An unconfirmed layout never outlives the loop.
    async fn abandon_session(&mut self) {
        if let Some(session) = self.applier.session() {
            log::info!("Reverting '{}' before leaving", session.profile());
            log_and_continue!(self.applier.revert().await, "revert pending layout");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::ChangeEvent;
    use crate::backend::mock::MockBackend;
    use crate::clamshell::ClamshellMode;
    use crate::profile_store::TieBreak;
    use common::{MonitorDescriptor, MonitorSnapshot, Profile, SessionStatus};
    use std::time::Duration;
    use tokio::sync::oneshot;
    use tokio::time::sleep;

    fn mon(name: &str, x: i32, enabled: bool) -> MonitorDescriptor {
        let mut m = MonitorDescriptor::new(name, "");
        m.x = x;
        m.enabled = enabled;
        m
    }

    struct Harness {
        channels: Channels,
        requests: mpsc::Sender<IpcRequest>,
        shutdown: watch::Sender<bool>,
        lid: watch::Sender<LidState>,
        watcher: broadcast::Receiver<DaemonEvent>,
        _dir: tempfile::TempDir,
        store: ProfileStore,
    }

    fn harness(profiles: &[Profile]) -> Harness {
        let (requests, requests_rx) = mpsc::channel(8);
        let (shutdown, shutdown_rx) = watch::channel(false);
        let (lid, lid_rx) = watch::channel(LidState::Absent);
        let (events, watcher) = broadcast::channel(64);

        let dir = tempfile::tempdir().unwrap();
        let store = ProfileStore::new(dir.path(), TieBreak::MostRecent);
        for profile in profiles {
            store.save(profile).unwrap();
        }

        Harness {
            channels: Channels {
                requests: requests_rx,
                lid: lid_rx,
                lid_alive: true,
                shutdown: shutdown_rx,
                events,
                started: std::time::Instant::now(),
            },
            requests,
            shutdown,
            lid,
            watcher,
            _dir: dir,
            store,
        }
    }

    async fn ask(requests: &mpsc::Sender<IpcRequest>, command: Command) -> Response {
        let (reply, answer) = oneshot::channel();
        requests.send(IpcRequest { command, reply }).await.unwrap();
        answer.await.unwrap()
    }

    fn snapshots(rx: &mut broadcast::Receiver<DaemonEvent>) -> Vec<MonitorSnapshot> {
        let mut out = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let DaemonEvent::Snapshot(snapshot) = event {
                out.push(snapshot);
            }
        }
        out
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_settles_once_against_final_state() {
        let Harness {
            mut channels,
            requests: _requests,
            shutdown,
            lid: _lid,
            mut watcher,
            _dir,
            store,
        } = harness(&[]);

        let backend = MockBackend::new(vec![mon("eDP-1", 0, true)]);
        let events = backend.event_sender();
        let stream = backend.subscribe_events().await.unwrap();
        let mut daemon = Daemon::new(&backend, &Config::default(), store, channels.events.clone());

        let final_state = vec![mon("eDP-1", 0, true), mon("DP-1", 1920, true)];
        let driver = async {
            for _ in 0..5 {
                events.send(ChangeEvent::Changed).await.unwrap();
                sleep(Duration::from_millis(100)).await;
            }
            // The state moves on before the quiet window closes
            backend.set_monitors(final_state.clone());
            sleep(Duration::from_secs(2)).await;
            shutdown.send(true).unwrap();
        };

        let (exit, ()) = tokio::join!(daemon.run(stream, &mut channels), driver);
        assert_eq!(exit, LoopExit::Shutdown);

        // One settle at startup, one for the whole burst
        let seen = snapshots(&mut watcher);
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[1], MonitorSnapshot::new(final_state));
        assert_eq!(backend.queries.get(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unconfirmed_hotplug_apply_reverts() {
        let side = Profile::new("side", vec![mon("eDP-1", 0, true), mon("DP-1", 1920, true)]);
        let Harness {
            mut channels,
            requests: _requests,
            shutdown,
            lid: _lid,
            mut watcher,
            _dir,
            store,
        } = harness(&[side]);

        let backend = MockBackend::new(vec![mon("eDP-1", 0, true), mon("DP-1", 0, false)]);
        let before = backend.snapshot();
        let _events = backend.event_sender();
        let stream = backend.subscribe_events().await.unwrap();
        let mut daemon = Daemon::new(&backend, &Config::default(), store, channels.events.clone());

        let driver = async {
            sleep(Duration::from_secs(5)).await;
            assert!(backend.snapshot().get("DP-1").unwrap().enabled);
            sleep(Duration::from_secs(6)).await;
            shutdown.send(true).unwrap();
        };

        let (exit, ()) = tokio::join!(daemon.run(stream, &mut channels), driver);
        assert_eq!(exit, LoopExit::Shutdown);
        assert_eq!(backend.snapshot(), before);

        let mut reverted = false;
        while let Ok(event) = watcher.try_recv() {
            reverted |= matches!(event, DaemonEvent::Reverted { ref profile } if profile == "side");
        }
        assert!(reverted);
    }

    #[tokio::test(start_paused = true)]
    async fn test_requests_drive_the_session() {
        let side = Profile::new("side", vec![mon("eDP-1", 0, true), mon("DP-1", 1920, true)]);
        let stacked = Profile::new("stacked", vec![mon("eDP-1", 0, true), mon("DP-1", 0, true)]);
        let Harness {
            mut channels,
            requests,
            shutdown: _shutdown,
            lid: _lid,
            _dir,
            store,
            ..
        } = harness(&[side, stacked]);

        let backend = MockBackend::new(vec![mon("eDP-1", 0, true), mon("DP-1", 1920, true)]);
        let _events = backend.event_sender();
        let stream = backend.subscribe_events().await.unwrap();
        let mut daemon = Daemon::new(&backend, &Config::default(), store, channels.events.clone());

        let driver = async {
            assert!(matches!(ask(&requests, Command::Ping).await, Response::Pong));

            let apply = Command::ApplyProfile {
                name: "stacked".to_string(),
            };
            assert!(matches!(ask(&requests, apply).await, Response::Ok));

            match ask(&requests, Command::Status).await {
                Response::Status(status) => {
                    assert_eq!(status.backend.as_deref(), Some("hyprland"));
                    let session = status.session.unwrap();
                    assert_eq!(session.profile, "stacked");
                    assert!(matches!(session.status, SessionStatus::Confirming { .. }));
                }
                other => panic!("unexpected response: {:?}", other),
            }

            assert!(matches!(ask(&requests, Command::Confirm).await, Response::Ok));
            assert!(matches!(
                ask(&requests, Command::Revert).await,
                Response::Error(MoniqueError::NoSession)
            ));

            match ask(&requests, Command::Status).await {
                Response::Status(status) => {
                    assert_eq!(status.active_profile.as_deref(), Some("stacked"));
                    assert!(status.session.is_none());
                }
                other => panic!("unexpected response: {:?}", other),
            }

            let delete = |name: &str| Command::DeleteProfile {
                name: name.to_string(),
            };
            assert!(matches!(ask(&requests, delete("side")).await, Response::Ok));
            assert!(matches!(
                ask(&requests, delete("side")).await,
                Response::Error(MoniqueError::NotFound(_))
            ));

            match ask(&requests, Command::ListProfiles).await {
                Response::Profiles(profiles) => {
                    assert_eq!(profiles.len(), 1);
                    assert_eq!(profiles[0].name, "stacked");
                }
                other => panic!("unexpected response: {:?}", other),
            }

            assert!(matches!(ask(&requests, Command::Kill).await, Response::Ok));
        };

        let (exit, ()) = tokio::join!(daemon.run(stream, &mut channels), driver);
        assert_eq!(exit, LoopExit::Shutdown);
        assert_eq!(backend.snapshot().get("DP-1").unwrap().x, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_clamshell_follows_lid_and_hotplug() {
        let Harness {
            mut channels,
            requests: _requests,
            shutdown,
            lid,
            _dir,
            store,
            ..
        } = harness(&[]);
        lid.send_replace(LidState::Open);

        let mut config = Config::default();
        config.clamshell.mode = ClamshellMode::Automatic;

        let backend = MockBackend::new(vec![mon("eDP-1", 0, true), mon("DP-1", 1920, true)]);
        let events = backend.event_sender();
        let stream = backend.subscribe_events().await.unwrap();
        let mut daemon = Daemon::new(&backend, &config, store, channels.events.clone());

        let driver = async {
            sleep(Duration::from_secs(1)).await;
            // Open lid with an external monitor lit: panel goes dark
            assert!(!backend.snapshot().get("eDP-1").unwrap().enabled);

            backend.set_monitors(vec![mon("eDP-1", 0, false)]);
            events
                .send(ChangeEvent::Removed("DP-1".to_string()))
                .await
                .unwrap();
            sleep(Duration::from_secs(1)).await;
            assert!(backend.snapshot().get("eDP-1").unwrap().enabled);

            // Closing the lid on the only monitor changes nothing
            lid.send_replace(LidState::Closed);
            sleep(Duration::from_secs(1)).await;
            assert!(backend.snapshot().get("eDP-1").unwrap().enabled);

            shutdown.send(true).unwrap();
        };

        let (exit, ()) = tokio::join!(daemon.run(stream, &mut channels), driver);
        assert_eq!(exit, LoopExit::Shutdown);
    }

    #[tokio::test(start_paused = true)]
    async fn test_closed_stream_means_backend_lost() {
        let Harness {
            mut channels,
            requests: _requests,
            shutdown: _shutdown,
            lid: _lid,
            _dir,
            store,
            ..
        } = harness(&[]);

        let backend = MockBackend::new(vec![mon("eDP-1", 0, true)]);
        let events = backend.event_sender();
        let stream = backend.subscribe_events().await.unwrap();
        drop(events);

        let mut daemon = Daemon::new(&backend, &Config::default(), store, channels.events.clone());
        assert_eq!(daemon.run(stream, &mut channels).await, LoopExit::BackendLost);
    }
}
