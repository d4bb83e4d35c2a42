//! Compositor backends.
//!
//! One capability trait, [`CompositorBackend`], with a concrete
//! implementation per supported compositor. The daemon probes the
//! environment once at startup with [`detect_backend`] and keeps the
//! resulting [`Backend`] until its event stream closes.

pub mod hyprland;
#[cfg(test)]
pub mod mock;
pub mod niri;
pub mod sway;

use std::fmt;
use std::future::Future;
use std::time::Duration;

use common::{MonitorDescriptor, MonitorSnapshot, WorkspaceBinding};
use tokio::sync::mpsc;

use crate::config::DaemonSettings;
use crate::error::BackendError;

pub use hyprland::HyprlandBackend;
pub use niri::NiriBackend;
pub use sway::SwayBackend;

/// Capacity of the per-backend change event channel
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// A hotplug-relevant notification from the compositor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeEvent {
    Added(String),
    Removed(String),
    /// Something changed but the compositor did not say which output
    Changed,
}

/// Receiving half of a backend's event stream. Closes when the compositor
/// connection is lost.
pub type EventStream = mpsc::Receiver<ChangeEvent>;

/// Which compositor a backend talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Hyprland,
    Sway,
    Niri,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Hyprland => write!(f, "hyprland"),
            Self::Sway => write!(f, "sway"),
            Self::Niri => write!(f, "niri"),
        }
    }
}

/// Everything the daemon needs from a compositor.
///
/// Every method performing socket I/O is bounded by the backend timeout. A
/// query that runs out of time reports [`BackendError::Timeout`], which
/// counts as unavailable.
#[allow(async_fn_in_trait)]
pub trait CompositorBackend {
    fn kind(&self) -> BackendKind;

    /// True if the compositor socket accepts connections.
    async fn detect(&self) -> bool;

    /// Fresh state of every connected monitor, enabled or not.
    async fn query_state(&self) -> Result<MonitorSnapshot, BackendError>;

    /// Push `target` to the compositor. Connectors not named in `target` are
    /// left untouched.
    async fn apply_configuration(&self, target: &[MonitorDescriptor]) -> Result<(), BackendError>;

    /// Start streaming change events.
    async fn subscribe_events(&self) -> Result<EventStream, BackendError>;

    /// True if [`workspaces`](Self::workspaces) and
    /// [`move_workspace`](Self::move_workspace) are implemented.
    fn supports_workspaces(&self) -> bool {
        false
    }

    async fn workspaces(&self) -> Result<Vec<WorkspaceBinding>, BackendError> {
        Err(BackendError::Protocol(format!(
            "{} does not expose workspace assignment",
            self.kind()
        )))
    }

    async fn move_workspace(&self, workspace: &str, output: &str) -> Result<(), BackendError> {
        let _ = (workspace, output);
        Err(BackendError::Protocol(format!(
            "{} does not expose workspace assignment",
            self.kind()
        )))
    }
}

/// The backend selected at startup.
pub enum Backend {
    Hyprland(HyprlandBackend),
    Sway(SwayBackend),
    Niri(NiriBackend),
}

macro_rules! dispatch {
    ($self:ident, $b:ident => $body:expr) => {
        match $self {
            Backend::Hyprland($b) => $body,
            Backend::Sway($b) => $body,
            Backend::Niri($b) => $body,
        }
    };
}

impl CompositorBackend for Backend {
    fn kind(&self) -> BackendKind {
        dispatch!(self, b => b.kind())
    }

    async fn detect(&self) -> bool {
        dispatch!(self, b => b.detect().await)
    }

    async fn query_state(&self) -> Result<MonitorSnapshot, BackendError> {
        dispatch!(self, b => b.query_state().await)
    }

    async fn apply_configuration(&self, target: &[MonitorDescriptor]) -> Result<(), BackendError> {
        dispatch!(self, b => b.apply_configuration(target).await)
    }

    async fn subscribe_events(&self) -> Result<EventStream, BackendError> {
        dispatch!(self, b => b.subscribe_events().await)
    }

    fn supports_workspaces(&self) -> bool {
        dispatch!(self, b => b.supports_workspaces())
    }

    async fn workspaces(&self) -> Result<Vec<WorkspaceBinding>, BackendError> {
        dispatch!(self, b => b.workspaces().await)
    }

    async fn move_workspace(&self, workspace: &str, output: &str) -> Result<(), BackendError> {
        dispatch!(self, b => b.move_workspace(workspace, output).await)
    }
}

/// Probe `HYPRLAND_INSTANCE_SIGNATURE`, `SWAYSOCK` and `NIRI_SOCKET`, in that
/// order, and return the first backend whose socket answers.
pub async fn detect_backend(settings: &DaemonSettings) -> Result<Backend, BackendError> {
    let timeout = settings.backend_timeout();

    if let Some(hyprland) = HyprlandBackend::from_env(timeout) {
        if hyprland.detect().await {
            return Ok(Backend::Hyprland(hyprland));
        }
        log::debug!("HYPRLAND_INSTANCE_SIGNATURE is set but the socket does not answer");
    }

    if let Some(sway) = SwayBackend::from_env(timeout) {
        if sway.detect().await {
            return Ok(Backend::Sway(sway));
        }
        log::debug!("SWAYSOCK is set but the socket does not answer");
    }

    if let Some(niri) = NiriBackend::from_env(timeout, settings.poll_interval()) {
        if niri.detect().await {
            return Ok(Backend::Niri(niri));
        }
        log::debug!("NIRI_SOCKET is set but the socket does not answer");
    }

    Err(BackendError::Detection)
}

/// Run `fut` with an upper bound on its duration.
pub(crate) async fn bounded<T>(
    limit: Duration,
    fut: impl Future<Output = Result<T, BackendError>>,
) -> Result<T, BackendError> {
    tokio::time::timeout(limit, fut)
        .await
        .map_err(|_| BackendError::Timeout(limit))?
}

/// Connect-only liveness probe shared by all backends.
pub(crate) async fn probe_socket(path: &std::path::Path, limit: Duration) -> bool {
    matches!(
        tokio::time::timeout(limit, tokio::net::UnixStream::connect(path)).await,
        Ok(Ok(_))
    )
}

/// Format a refresh rate for compositor commands: `60` or `59.951`.
pub(crate) fn format_refresh(refresh_mhz: u32) -> String {
    if refresh_mhz % 1000 == 0 {
        (refresh_mhz / 1000).to_string()
    } else {
        format!("{:.3}", refresh_mhz as f64 / 1000.0)
    }
}

/// Split a target into enable-first order so the compositor never passes
/// through a state with nothing lit.
pub(crate) fn enable_first(target: &[MonitorDescriptor]) -> Vec<&MonitorDescriptor> {
    let mut ordered: Vec<&MonitorDescriptor> = target.iter().filter(|m| m.enabled).collect();
    ordered.extend(target.iter().filter(|m| !m.enabled));
    ordered
}
