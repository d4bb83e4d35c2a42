//! Common types and utilities for Monique.
//!
//! This crate defines the shared data model and the IPC protocol used between
//! the daemon (`moniqued`) and its clients (`moniquectl`, the layout editor).
//!
//! # IPC Protocol
//!
//! Communication happens over a Unix domain socket using newline-delimited
//! JSON. The client sends [`Command`] variants and receives [`Response`]
//! variants. After a [`Command::Watch`] the connection stays open and the
//! daemon pushes [`Response::Event`] lines until the client disconnects.
//!
//! # Examples
//!
//! ```no_run
//! use common::{Command, Response};
//!
//! let cmd = Command::ApplyProfile { name: "Office".to_string() };
//! let json = serde_json::to_string(&cmd).unwrap();
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;

/// Common error types shared between client and daemon.
///
/// All errors are serializable for transmission over IPC.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MoniqueError {
    #[error("IO error: {0}")]
    Io(String),

    #[error("IPC error: {0}")]
    Ipc(String),

    #[error("Compositor error: {0}")]
    Backend(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid profile: {0}")]
    InvalidProfile(String),

    #[error("No apply session is awaiting confirmation")]
    NoSession,
}

impl From<std::io::Error> for MoniqueError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e.to_string())
    }
}

impl From<serde_json::Error> for MoniqueError {
    fn from(e: serde_json::Error) -> Self {
        Self::Ipc(e.to_string())
    }
}

// Monitor model

/// Output transform, in the counter-clockwise convention of the Wayland
/// protocol (the same numbering Hyprland uses).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum Transform {
    #[default]
    Normal,
    Rotate90,
    Rotate180,
    Rotate270,
    Flipped,
    Flipped90,
    Flipped180,
    Flipped270,
}

impl Transform {
    const ALL: [Transform; 8] = [
        Transform::Normal,
        Transform::Rotate90,
        Transform::Rotate180,
        Transform::Rotate270,
        Transform::Flipped,
        Transform::Flipped90,
        Transform::Flipped180,
        Transform::Flipped270,
    ];

    /// Wayland protocol index (0-7).
    pub fn index(&self) -> u8 {
        Self::ALL.iter().position(|t| t == self).unwrap_or(0) as u8
    }

    pub fn from_index(index: u8) -> Option<Self> {
        Self::ALL.get(index as usize).copied()
    }

    /// True if width and height are swapped.
    pub fn is_rotated(&self) -> bool {
        self.index() % 2 == 1
    }
}

/// A display mode. Refresh is kept in millihertz so snapshots compare exactly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Mode {
    pub width: u32,
    pub height: u32,
    pub refresh_mhz: u32,
}

impl Mode {
    pub fn new(width: u32, height: u32, refresh_mhz: u32) -> Self {
        Self {
            width,
            height,
            refresh_mhz,
        }
    }

    /// Build a mode from a refresh rate in Hz, rounding to the nearest mHz.
    pub fn from_hz(width: u32, height: u32, refresh_hz: f64) -> Self {
        Self::new(width, height, (refresh_hz * 1000.0).round().max(0.0) as u32)
    }

    pub fn refresh_hz(&self) -> f64 {
        self.refresh_mhz as f64 / 1000.0
    }
}

impl Default for Mode {
    fn default() -> Self {
        Self::new(1920, 1080, 60_000)
    }
}

/// One monitor's identity plus its configured attributes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitorDescriptor {
    /// Connector name, e.g. `DP-1` or `eDP-1`.
    pub name: String,
    /// EDID-derived `make model serial`, normalized with [`normalize_identity`].
    /// Empty when the compositor does not report EDID data.
    #[serde(default, deserialize_with = "deserialize_identity")]
    pub identity: String,
    #[serde(default)]
    pub mode: Mode,
    #[serde(default)]
    pub x: i32,
    #[serde(default)]
    pub y: i32,
    #[serde(default = "default_scale")]
    pub scale: f64,
    #[serde(default)]
    pub transform: Transform,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub primary: bool,
}

fn deserialize_identity<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    Ok(normalize_identity(&raw))
}

fn default_scale() -> f64 {
    1.0
}

fn default_true() -> bool {
    true
}

impl MonitorDescriptor {
    pub fn new(name: impl Into<String>, identity: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            identity: normalize_identity(&identity.into()),
            mode: Mode::default(),
            x: 0,
            y: 0,
            scale: 1.0,
            transform: Transform::Normal,
            enabled: true,
            primary: false,
        }
    }

    /// The key used for matching: the EDID identity, or the connector name
    /// when no identity is known.
    pub fn identity_key(&self) -> &str {
        if self.identity.is_empty() {
            &self.name
        } else {
            &self.identity
        }
    }

    /// True for built-in laptop panels (eDP, LVDS and DSI connectors).
    pub fn is_internal(&self) -> bool {
        let prefix = self.name.split('-').next().unwrap_or_default();
        matches!(
            prefix.to_ascii_uppercase().as_str(),
            "EDP" | "LVDS" | "DSI"
        )
    }

    /// Compare the compositor-visible layout, ignoring the primary flag which
    /// no compositor reports back.
    pub fn same_layout(&self, other: &MonitorDescriptor) -> bool {
        if self.name != other.name || self.enabled != other.enabled {
            return false;
        }
        if !self.enabled {
            return true;
        }
        self.mode == other.mode
            && self.x == other.x
            && self.y == other.y
            && (self.scale - other.scale).abs() < 1e-3
            && self.transform == other.transform
    }
}

/// Normalize an EDID description so identities agree across compositors.
///
/// Hyprland appends ` Unknown` for a missing serial and Niri wraps three-letter
/// PNP vendor ids as `PNP(XXX)`; both are stripped.
pub fn normalize_identity(raw: &str) -> String {
    let mut s = raw.trim().to_string();
    if let Some(stripped) = s.strip_suffix(" Unknown") {
        s = stripped.to_string();
    }
    if s.starts_with("PNP(")
        && let Some(close) = s.find(") ")
    {
        s = format!("{}{}", &s[4..close], &s[close + 1..]);
    }
    s
}

/// Compose an identity from separate EDID fields, skipping empty parts.
pub fn identity_from_parts(make: &str, model: &str, serial: &str) -> String {
    let joined = [make, model, serial]
        .iter()
        .map(|p| p.trim())
        .filter(|p| !p.is_empty())
        .collect::<Vec<_>>()
        .join(" ");
    normalize_identity(&joined)
}

/// Compositor state at one instant. Connector names are unique.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct MonitorSnapshot {
    monitors: Vec<MonitorDescriptor>,
}

impl MonitorSnapshot {
    /// Build a snapshot, keeping the first descriptor for any duplicated
    /// connector name.
    pub fn new(monitors: Vec<MonitorDescriptor>) -> Self {
        let mut seen = BTreeSet::new();
        let monitors = monitors
            .into_iter()
            .filter(|m| seen.insert(m.name.clone()))
            .collect();
        Self { monitors }
    }

    pub fn monitors(&self) -> &[MonitorDescriptor] {
        &self.monitors
    }

    pub fn len(&self) -> usize {
        self.monitors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.monitors.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&MonitorDescriptor> {
        self.monitors.iter().find(|m| m.name == name)
    }

    pub fn by_identity(&self, key: &str) -> Option<&MonitorDescriptor> {
        self.monitors.iter().find(|m| m.identity_key() == key)
    }

    pub fn enabled(&self) -> impl Iterator<Item = &MonitorDescriptor> {
        self.monitors.iter().filter(|m| m.enabled)
    }

    /// The explicit primary if it is enabled, otherwise the first enabled
    /// monitor.
    pub fn primary(&self) -> Option<&MonitorDescriptor> {
        self.enabled()
            .find(|m| m.primary)
            .or_else(|| self.enabled().next())
    }

    /// Number of enabled monitors that are not built-in panels.
    pub fn external_count(&self) -> usize {
        self.enabled().filter(|m| !m.is_internal()).count()
    }

    pub fn connectors(&self) -> BTreeSet<String> {
        self.monitors.iter().map(|m| m.name.clone()).collect()
    }

    /// True if every descriptor in `target` is present here with the same
    /// layout.
    pub fn satisfies(&self, target: &[MonitorDescriptor]) -> bool {
        target
            .iter()
            .all(|t| self.get(&t.name).is_some_and(|m| m.same_layout(t)))
    }
}

// Profiles

/// A named, persisted target layout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    pub name: String,
    pub monitors: Vec<MonitorDescriptor>,
    /// Workspace id → connector name.
    #[serde(default)]
    pub workspace_rules: BTreeMap<String, String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub last_applied: Option<DateTime<Utc>>,
}

impl Profile {
    pub fn new(name: impl Into<String>, monitors: Vec<MonitorDescriptor>) -> Self {
        let now = Utc::now();
        Self {
            name: name.into(),
            monitors,
            workspace_rules: BTreeMap::new(),
            created_at: now,
            updated_at: now,
            last_applied: None,
        }
    }

    /// Check the structural invariants of a profile.
    pub fn validate(&self) -> Result<(), MoniqueError> {
        if self.name.trim().is_empty() {
            return Err(MoniqueError::InvalidProfile("empty name".to_string()));
        }
        if self.monitors.is_empty() {
            return Err(MoniqueError::InvalidProfile(format!(
                "'{}' has no monitors",
                self.name
            )));
        }
        let primaries = self.monitors.iter().filter(|m| m.primary).count();
        if primaries > 1 {
            return Err(MoniqueError::InvalidProfile(format!(
                "'{}' marks {} monitors as primary",
                self.name, primaries
            )));
        }
        let mut names = BTreeSet::new();
        for m in &self.monitors {
            if !names.insert(m.name.as_str()) {
                return Err(MoniqueError::InvalidProfile(format!(
                    "'{}' lists connector {} twice",
                    self.name, m.name
                )));
            }
        }
        Ok(())
    }

    pub fn summary(&self) -> ProfileSummary {
        ProfileSummary {
            name: self.name.clone(),
            monitors: self.monitors.iter().map(|m| m.name.clone()).collect(),
            last_applied: self.last_applied,
        }
    }
}

/// Compact profile listing for clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProfileSummary {
    pub name: String,
    pub monitors: Vec<String>,
    pub last_applied: Option<DateTime<Utc>>,
}

/// Which monitor a workspace currently lives on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkspaceBinding {
    pub workspace: String,
    pub output: String,
}

// Apply sessions

/// Lifecycle of a confirm-or-revert session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SessionStatus {
    Applying,
    Confirming { remaining_ms: u64 },
    Confirmed,
    Reverting,
    Failed { reason: String },
}

impl SessionStatus {
    /// True once the session has left the state machine.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Confirmed | Self::Failed { .. })
    }
}

/// Notifications pushed to watching clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DaemonEvent {
    /// An apply session changed state.
    Session {
        profile: String,
        status: SessionStatus,
    },
    /// A revert finished and the previous layout is back.
    Reverted { profile: String },
    /// Fresh compositor state after a settle.
    Snapshot(MonitorSnapshot),
    /// No stored profile matches the connected monitors.
    NoMatch,
    /// The clamshell controller switched the internal panel.
    Clamshell { output: String, enabled: bool },
}

// IPC

/// Commands sent from client to daemon via IPC.
#[derive(Debug, Serialize, Deserialize)]
pub enum Command {
    /// Ping the daemon
    Ping,
    /// Query daemon status
    Status,
    /// Current compositor snapshot
    ListOutputs,
    /// Stored profiles
    ListProfiles,
    /// Apply a stored profile by name, through the confirm-or-revert window
    ApplyProfile { name: String },
    /// Keep the layout of the pending session
    Confirm,
    /// Roll back the pending session now
    Revert,
    /// Remove a stored profile
    DeleteProfile { name: String },
    /// Stream [`DaemonEvent`]s on this connection
    Watch,
    /// Kill the daemon
    Kill,
}

/// Response from daemon to client
#[derive(Debug, Serialize, Deserialize)]
pub enum Response {
    Ok,
    Pong,
    Error(MoniqueError),
    Status(DaemonStatus),
    Outputs(MonitorSnapshot),
    Profiles(Vec<ProfileSummary>),
    Event(DaemonEvent),
}

/// Daemon status information
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonStatus {
    pub version: String,
    pub uptime_secs: u64,
    /// Detected compositor, if any
    pub backend: Option<String>,
    /// Profile that was last confirmed
    pub active_profile: Option<String>,
    /// Pending session, if any
    pub session: Option<SessionInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionInfo {
    pub profile: String,
    pub status: SessionStatus,
}

/// IPC socket path helper
pub fn get_socket_path() -> std::path::PathBuf {
    let runtime_dir = std::env::var("XDG_RUNTIME_DIR")
        .unwrap_or_else(|_| format!("/run/user/{}", unsafe { libc::getuid() }));

    std::path::PathBuf::from(runtime_dir).join("monique.sock")
}
