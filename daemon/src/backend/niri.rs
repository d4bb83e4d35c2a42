//! Niri backend.
//!
//! Requests are single JSON lines on `$NIRI_SOCKET`, answered by
//! `{"Ok": ...}` or `{"Err": "..."}`. Niri has no output hotplug event, so
//! the event stream combines three sources: `WorkspacesChanged` events whose
//! set of outputs differs from the last one, kernel DRM hotplug
//! notifications (with the `udev` feature), and periodic polling of the
//! connector set when DRM notifications are unavailable.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::time::Duration;

use common::{Mode, MonitorDescriptor, MonitorSnapshot, Transform, identity_from_parts};
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::net::unix::OwnedReadHalf;
use tokio::sync::mpsc;

use super::{
    BackendKind, ChangeEvent, CompositorBackend, EVENT_CHANNEL_CAPACITY, EventStream, bounded,
    enable_first, probe_socket,
};
use crate::error::BackendError;

#[derive(Clone)]
pub struct NiriBackend {
    socket: PathBuf,
    timeout: Duration,
    poll_interval: Duration,
}

#[derive(Debug, Deserialize)]
struct NiriOutput {
    #[serde(default)]
    make: String,
    #[serde(default)]
    model: String,
    #[serde(default)]
    serial: Option<String>,
    #[serde(default)]
    modes: Vec<NiriMode>,
    #[serde(default)]
    current_mode: Option<usize>,
    /// `null` when the output is off
    #[serde(default)]
    logical: Option<NiriLogical>,
}

#[derive(Debug, Deserialize)]
struct NiriMode {
    width: u32,
    height: u32,
    /// Millihertz
    refresh_rate: u32,
}

#[derive(Debug, Deserialize)]
struct NiriLogical {
    x: i32,
    y: i32,
    scale: f64,
    #[serde(default)]
    transform: String,
}

impl NiriBackend {
    pub fn new(socket: PathBuf, timeout: Duration, poll_interval: Duration) -> Self {
        Self {
            socket,
            timeout,
            poll_interval,
        }
    }

    pub fn from_env(timeout: Duration, poll_interval: Duration) -> Option<Self> {
        std::env::var_os("NIRI_SOCKET")
            .filter(|s| !s.is_empty())
            .map(|path| Self::new(PathBuf::from(path), timeout, poll_interval))
    }

    async fn request(&self, request: &Value) -> Result<Value, BackendError> {
        bounded(self.timeout, async {
            let stream = UnixStream::connect(&self.socket).await?;
            let (read, mut write) = stream.into_split();

            let mut line = serde_json::to_string(request)?;
            line.push('\n');
            write.write_all(line.as_bytes()).await?;
            write.shutdown().await?;

            let mut reply = String::new();
            BufReader::new(read).read_line(&mut reply).await?;
            unwrap_reply(serde_json::from_str(&reply)?)
        })
        .await
    }

    async fn connectors(&self) -> Result<BTreeSet<String>, BackendError> {
        Ok(self.query_state().await?.connectors())
    }
}

impl CompositorBackend for NiriBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Niri
    }

    async fn detect(&self) -> bool {
        probe_socket(&self.socket, self.timeout).await
    }

    async fn query_state(&self) -> Result<MonitorSnapshot, BackendError> {
        let reply = self.request(&json!("Outputs")).await?;
        parse_outputs(reply)
    }

    async fn apply_configuration(&self, target: &[MonitorDescriptor]) -> Result<(), BackendError> {
        for monitor in enable_first(target) {
            for action in output_actions(monitor) {
                let request = json!({ "Output": { "output": monitor.name, "action": action } });
                let reply = self
                    .request(&request)
                    .await
                    .map_err(|e| BackendError::Apply(format!("{}: {}", monitor.name, e)))?;

                if reply.get("OutputConfigChanged").and_then(Value::as_str) == Some("OutputWasMissing") {
                    return Err(BackendError::Apply(format!("{} is not connected", monitor.name)));
                }
            }
        }
        Ok(())
    }

    async fn subscribe_events(&self) -> Result<EventStream, BackendError> {
        let (reader, write) = bounded(self.timeout, async {
            let stream = UnixStream::connect(&self.socket).await?;
            let (read, mut write) = stream.into_split();
            write.write_all(b"\"EventStream\"\n").await?;

            let mut reader = BufReader::new(read);
            let mut ack = String::new();
            reader.read_line(&mut ack).await?;
            unwrap_reply(serde_json::from_str(&ack)?)?;
            Ok((reader, write))
        })
        .await?;

        let hotplug = match drm::watch().await {
            Ok(rx) => {
                log::info!("Watching DRM hotplug notifications");
                Some(rx)
            }
            Err(e) => {
                log::info!(
                    "DRM hotplug notifications unavailable ({}), polling every {:?}",
                    e,
                    self.poll_interval
                );
                None
            }
        };

        let poller = self.clone();
        let known = poller.connectors().await.unwrap_or_default();
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);

        tokio::spawn(async move {
            // Niri ends the stream once our write half is closed
            let _write = write;
            forward_events(reader, hotplug, poller, known, tx).await;
        });

        Ok(rx)
    }
}

/// Merge the IPC event stream with DRM hotplug or polling until the IPC
/// connection closes.
async fn forward_events(
    mut reader: BufReader<OwnedReadHalf>,
    mut hotplug: Option<mpsc::Receiver<()>>,
    poller: NiriBackend,
    mut connectors: BTreeSet<String>,
    tx: mpsc::Sender<ChangeEvent>,
) {
    let mut workspace_outputs: Option<BTreeSet<String>> = None;
    let mut poll = tokio::time::interval(poller.poll_interval);
    poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // Partial lines survive a losing select! branch
    let mut line = Vec::new();

    loop {
        let changed = tokio::select! {
            read = reader.read_until(b'\n', &mut line) => match read {
                Ok(0) => {
                    log::warn!("Niri event stream closed");
                    break;
                }
                Ok(_) => {
                    let outputs = serde_json::from_slice::<Value>(&line)
                        .ok()
                        .and_then(|event| workspace_output_set(&event));
                    line.clear();
                    match outputs {
                        Some(outputs) => {
                            let previous = workspace_outputs.replace(outputs);
                            previous.is_some() && previous != workspace_outputs
                        }
                        None => false,
                    }
                }
                Err(e) => {
                    log::warn!("Niri event stream error: {}", e);
                    break;
                }
            },
            signal = recv_hotplug(&mut hotplug) => match signal {
                Some(()) => true,
                None => {
                    log::warn!("DRM hotplug watcher stopped, falling back to polling");
                    hotplug = None;
                    false
                }
            },
            _ = poll.tick(), if hotplug.is_none() => {
                match poller.connectors().await {
                    Ok(current) if current != connectors => {
                        connectors = current;
                        true
                    }
                    Ok(_) => false,
                    Err(e) => {
                        log::debug!("Niri connector poll failed: {}", e);
                        false
                    }
                }
            }
            _ = tx.closed() => break,
        };

        if changed && tx.send(ChangeEvent::Changed).await.is_err() {
            break;
        }
    }
}

async fn recv_hotplug(hotplug: &mut Option<mpsc::Receiver<()>>) -> Option<()> {
    match hotplug {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

/// Strip the `{"Ok": {"Variant": payload}}` envelope.
fn unwrap_reply(reply: Value) -> Result<Value, BackendError> {
    let Value::Object(mut envelope) = reply else {
        return Err(BackendError::Protocol("reply is not an object".to_string()));
    };

    if let Some(err) = envelope.remove("Err") {
        let message = err.as_str().map(str::to_string).unwrap_or_else(|| err.to_string());
        return Err(BackendError::Protocol(message));
    }

    match envelope.remove("Ok") {
        Some(Value::Object(mut inner)) if inner.len() == 1 => {
            let key = inner.keys().next().cloned().unwrap_or_default();
            if key == "OutputConfigChanged" {
                return Ok(Value::Object(inner));
            }
            Ok(inner.remove(&key).unwrap_or(Value::Null))
        }
        Some(other) => Ok(other),
        None => Err(BackendError::Protocol("reply has neither Ok nor Err".to_string())),
    }
}

fn parse_outputs(reply: Value) -> Result<MonitorSnapshot, BackendError> {
    let outputs: BTreeMap<String, NiriOutput> = serde_json::from_value(reply)?;

    Ok(MonitorSnapshot::new(
        outputs
            .into_iter()
            .map(|(name, output)| output.into_descriptor(name))
            .collect(),
    ))
}

impl NiriOutput {
    fn into_descriptor(self, name: String) -> MonitorDescriptor {
        let serial = self.serial.unwrap_or_default();
        let mut m = MonitorDescriptor::new(name, identity_from_parts(&self.make, &self.model, &serial));

        if let Some(mode) = self.current_mode.and_then(|i| self.modes.get(i)) {
            m.mode = Mode::new(mode.width, mode.height, mode.refresh_rate);
        }

        match self.logical {
            Some(logical) => {
                m.x = logical.x;
                m.y = logical.y;
                m.scale = logical.scale;
                m.transform = transform_from_niri(&logical.transform).unwrap_or_default();
            }
            None => m.enabled = false,
        }
        m
    }
}

pub fn transform_to_niri(t: Transform) -> &'static str {
    match t {
        Transform::Normal => "Normal",
        Transform::Rotate90 => "90",
        Transform::Rotate180 => "180",
        Transform::Rotate270 => "270",
        Transform::Flipped => "Flipped",
        Transform::Flipped90 => "Flipped90",
        Transform::Flipped180 => "Flipped180",
        Transform::Flipped270 => "Flipped270",
    }
}

pub fn transform_from_niri(s: &str) -> Option<Transform> {
    let t = match s {
        "Normal" => Transform::Normal,
        "90" => Transform::Rotate90,
        "180" => Transform::Rotate180,
        "270" => Transform::Rotate270,
        "Flipped" => Transform::Flipped,
        "Flipped90" => Transform::Flipped90,
        "Flipped180" => Transform::Flipped180,
        "Flipped270" => Transform::Flipped270,
        _ => return None,
    };
    Some(t)
}

/// One action per attribute, in the order niri expects them.
fn output_actions(m: &MonitorDescriptor) -> Vec<Value> {
    if !m.enabled {
        return vec![json!("Off")];
    }

    vec![
        json!("On"),
        json!({ "Mode": { "mode": { "Specific": {
            "width": m.mode.width,
            "height": m.mode.height,
            "refresh": m.mode.refresh_hz(),
        } } } }),
        json!({ "Scale": { "scale": { "Specific": m.scale } } }),
        json!({ "Transform": { "transform": transform_to_niri(m.transform) } }),
        json!({ "Position": { "position": { "Specific": { "x": m.x, "y": m.y } } } }),
    ]
}

/// Outputs mentioned by a `WorkspacesChanged` event.
fn workspace_output_set(event: &Value) -> Option<BTreeSet<String>> {
    let workspaces = event.get("WorkspacesChanged")?.get("workspaces")?.as_array()?;
    Some(
        workspaces
            .iter()
            .filter_map(|ws| ws.get("output").and_then(Value::as_str))
            .map(str::to_string)
            .collect(),
    )
}

#[cfg(feature = "udev")]
mod drm {
    use std::io;
    use std::os::fd::AsRawFd;

    use tokio::sync::{mpsc, oneshot};

    /// Watch the `drm` subsystem on a dedicated thread. Resolves once the
    /// udev monitor is listening, or with the reason it could not be set up.
    pub(super) async fn watch() -> io::Result<mpsc::Receiver<()>> {
        let (tx, rx) = mpsc::channel(8);
        let (ready_tx, ready_rx) = oneshot::channel();

        std::thread::Builder::new()
            .name("drm-hotplug".to_string())
            .spawn(move || {
                let socket = udev::MonitorBuilder::new()
                    .and_then(|builder| builder.match_subsystem("drm"))
                    .and_then(|builder| builder.listen());

                match socket {
                    Ok(socket) => {
                        let _ = ready_tx.send(Ok(()));
                        run(socket, tx);
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                    }
                }
            })?;

        ready_rx
            .await
            .map_err(|_| io::Error::other("hotplug thread exited during setup"))??;
        Ok(rx)
    }

    fn run(mut socket: udev::MonitorSocket, tx: mpsc::Sender<()>) {
        let fd = socket.as_raw_fd();

        while !tx.is_closed() {
            let mut pollfd = libc::pollfd {
                fd,
                events: libc::POLLIN,
                revents: 0,
            };

            // Wake up periodically to notice a dropped receiver
            let ready = unsafe { libc::poll(&mut pollfd, 1, 500) };
            if ready < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                log::warn!("poll on udev monitor failed: {}", err);
                return;
            }
            if ready == 0 {
                continue;
            }

            let mut hotplug = false;
            for event in socket.by_ref() {
                log::debug!("DRM {:?} on {:?}", event.event_type(), event.sysname());
                if event.event_type() == udev::EventType::Change {
                    hotplug = true;
                }
            }

            if hotplug && tx.blocking_send(()).is_err() {
                return;
            }
        }
    }
}

#[cfg(not(feature = "udev"))]
mod drm {
    use std::io;
    use tokio::sync::mpsc;

    pub(super) async fn watch() -> io::Result<mpsc::Receiver<()>> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "built without the udev feature",
        ))
    }
}
