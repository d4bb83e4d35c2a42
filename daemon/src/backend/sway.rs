//! Sway backend over the i3-ipc binary protocol.
//!
//! Every message is `i3-ipc` + payload length (u32 LE) + message type
//! (u32 LE) + JSON payload. The decoder tolerates garbage on the wire: it
//! scans for the next magic and drops whatever came before it.

use std::path::PathBuf;
use std::time::Duration;

use common::{Mode, MonitorDescriptor, MonitorSnapshot, Transform, WorkspaceBinding, identity_from_parts};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tokio::sync::mpsc;

use super::{
    BackendKind, ChangeEvent, CompositorBackend, EVENT_CHANNEL_CAPACITY, EventStream, bounded,
    enable_first, format_refresh, probe_socket,
};
use crate::error::BackendError;

pub const MAGIC: &[u8; 6] = b"i3-ipc";
pub const HEADER_LEN: usize = 14;

/// Frames larger than this are treated as a corrupted header.
const MAX_PAYLOAD: usize = 16 * 1024 * 1024;

pub const RUN_COMMAND: u32 = 0;
pub const GET_WORKSPACES: u32 = 1;
pub const SUBSCRIBE: u32 = 2;
pub const GET_OUTPUTS: u32 = 3;
pub const EVENT_OUTPUT: u32 = 0x8000_0001;

/// One decoded i3-ipc message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub msg_type: u32,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(msg_type: u32, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            msg_type,
            payload: payload.into(),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(HEADER_LEN + self.payload.len());
        bytes.extend_from_slice(MAGIC);
        bytes.extend_from_slice(&(self.payload.len() as u32).to_le_bytes());
        bytes.extend_from_slice(&self.msg_type.to_le_bytes());
        bytes.extend_from_slice(&self.payload);
        bytes
    }

    fn json<T: DeserializeOwned>(&self) -> Result<T, BackendError> {
        Ok(serde_json::from_slice(&self.payload)?)
    }
}

/// Incremental, resynchronizing frame decoder.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: Vec<u8>,
}

impl FrameDecoder {
    pub fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Pop the next complete frame, discarding any bytes that cannot start
    /// one.
    pub fn next_frame(&mut self) -> Option<Frame> {
        loop {
            match find_magic(&self.buf) {
                Some(0) => {}
                Some(offset) => {
                    log::warn!("Discarding {} unsynchronized bytes from sway", offset);
                    self.buf.drain(..offset);
                }
                None => {
                    // A magic may be split across reads
                    let keep = self.buf.len().min(MAGIC.len() - 1);
                    let dropped = self.buf.len() - keep;
                    if dropped > 0 {
                        log::warn!("Discarding {} unsynchronized bytes from sway", dropped);
                        self.buf.drain(..dropped);
                    }
                    return None;
                }
            }

            if self.buf.len() < HEADER_LEN {
                return None;
            }

            let len = u32::from_le_bytes([self.buf[6], self.buf[7], self.buf[8], self.buf[9]])
                as usize;
            let msg_type =
                u32::from_le_bytes([self.buf[10], self.buf[11], self.buf[12], self.buf[13]]);

            if len > MAX_PAYLOAD {
                log::warn!("Implausible sway frame length {}, resynchronizing", len);
                self.buf.drain(..1);
                continue;
            }

            if self.buf.len() < HEADER_LEN + len {
                return None;
            }

            let payload = self.buf[HEADER_LEN..HEADER_LEN + len].to_vec();
            self.buf.drain(..HEADER_LEN + len);
            return Some(Frame { msg_type, payload });
        }
    }
}

fn find_magic(buf: &[u8]) -> Option<usize> {
    buf.windows(MAGIC.len()).position(|w| w == MAGIC)
}

/// Reads frames off any async byte stream.
pub struct FrameReader<R> {
    reader: R,
    decoder: FrameDecoder,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            decoder: FrameDecoder::default(),
        }
    }

    /// Next frame, or `None` at end of stream.
    pub async fn next(&mut self) -> Result<Option<Frame>, BackendError> {
        let mut chunk = [0u8; 4096];
        loop {
            if let Some(frame) = self.decoder.next_frame() {
                return Ok(Some(frame));
            }
            let n = self.reader.read(&mut chunk).await?;
            if n == 0 {
                return Ok(None);
            }
            self.decoder.push(&chunk[..n]);
        }
    }
}

pub struct SwayBackend {
    socket: PathBuf,
    timeout: Duration,
}

#[derive(Debug, Deserialize)]
struct SwayOutput {
    name: String,
    #[serde(default)]
    make: String,
    #[serde(default)]
    model: String,
    #[serde(default)]
    serial: String,
    #[serde(default = "yes")]
    active: bool,
    #[serde(default)]
    scale: Option<f64>,
    #[serde(default)]
    transform: Option<String>,
    #[serde(default)]
    rect: SwayRect,
    #[serde(default)]
    current_mode: Option<SwayMode>,
}

fn yes() -> bool {
    true
}

#[derive(Debug, Default, Deserialize)]
struct SwayRect {
    #[serde(default)]
    x: i32,
    #[serde(default)]
    y: i32,
}

#[derive(Debug, Deserialize)]
struct SwayMode {
    width: u32,
    height: u32,
    /// Millihertz
    refresh: u32,
}

#[derive(Debug, Deserialize)]
struct SwayWorkspace {
    name: String,
    #[serde(default)]
    output: String,
}

#[derive(Debug, Deserialize)]
struct CommandResult {
    success: bool,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OutputEvent {
    change: String,
    #[serde(default)]
    output: Option<String>,
}

impl SwayBackend {
    pub fn new(socket: PathBuf, timeout: Duration) -> Self {
        Self { socket, timeout }
    }

    pub fn from_env(timeout: Duration) -> Option<Self> {
        std::env::var_os("SWAYSOCK")
            .filter(|s| !s.is_empty())
            .map(|path| Self::new(PathBuf::from(path), timeout))
    }

    async fn request(&self, msg_type: u32, payload: &str) -> Result<Frame, BackendError> {
        bounded(self.timeout, async {
            let mut stream = UnixStream::connect(&self.socket).await?;
            stream
                .write_all(&Frame::new(msg_type, payload).encode())
                .await?;

            let mut reader = FrameReader::new(stream);
            while let Some(frame) = reader.next().await? {
                if frame.msg_type == msg_type {
                    return Ok(frame);
                }
                log::debug!("Skipping unexpected sway frame type {:#x}", frame.msg_type);
            }
            Err(BackendError::Unavailable(
                "sway closed the connection before replying".to_string(),
            ))
        })
        .await
    }

    async fn run_command(&self, command: &str) -> Result<(), BackendError> {
        let reply = self.request(RUN_COMMAND, command).await?;
        check_results(&reply.json::<Vec<CommandResult>>()?)
    }
}

impl CompositorBackend for SwayBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Sway
    }

    async fn detect(&self) -> bool {
        probe_socket(&self.socket, self.timeout).await
    }

    async fn query_state(&self) -> Result<MonitorSnapshot, BackendError> {
        let reply = self.request(GET_OUTPUTS, "").await?;
        let outputs: Vec<SwayOutput> = reply.json()?;
        Ok(MonitorSnapshot::new(
            outputs.into_iter().map(SwayOutput::into_descriptor).collect(),
        ))
    }

    async fn apply_configuration(&self, target: &[MonitorDescriptor]) -> Result<(), BackendError> {
        if target.is_empty() {
            return Ok(());
        }

        let command = enable_first(target)
            .into_iter()
            .map(output_command)
            .collect::<Vec<_>>()
            .join(";");

        log::debug!("Sway command: {}", command);

        let reply = self
            .request(RUN_COMMAND, &command)
            .await
            .map_err(|e| BackendError::Apply(e.to_string()))?;
        check_results(&reply.json::<Vec<CommandResult>>()?)
    }

    async fn subscribe_events(&self) -> Result<EventStream, BackendError> {
        let mut reader = bounded(self.timeout, async {
            let mut stream = UnixStream::connect(&self.socket).await?;
            stream
                .write_all(&Frame::new(SUBSCRIBE, r#"["output"]"#).encode())
                .await?;

            let mut reader = FrameReader::new(stream);
            let ack = reader
                .next()
                .await?
                .ok_or_else(|| BackendError::Unavailable("no subscribe reply".to_string()))?;

            let ack: CommandResult = ack.json()?;
            if !ack.success {
                return Err(BackendError::Protocol("sway refused subscription".to_string()));
            }
            Ok(reader)
        })
        .await?;

        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);

        tokio::spawn(async move {
            loop {
                let frame = tokio::select! {
                    frame = reader.next() => frame,
                    _ = tx.closed() => break,
                };

                let frame = match frame {
                    Ok(Some(frame)) => frame,
                    Ok(None) => {
                        log::warn!("Sway event socket closed");
                        break;
                    }
                    Err(e) => {
                        log::warn!("Sway event socket error: {}", e);
                        break;
                    }
                };

                if frame.msg_type != EVENT_OUTPUT {
                    continue;
                }

                match frame.json::<OutputEvent>() {
                    Ok(event) => {
                        if let Some(change) = output_change(event)
                            && tx.send(change).await.is_err()
                        {
                            break;
                        }
                    }
                    Err(e) => log::warn!("Malformed sway output event: {}", e),
                }
            }
        });

        Ok(rx)
    }

    fn supports_workspaces(&self) -> bool {
        true
    }

    async fn workspaces(&self) -> Result<Vec<WorkspaceBinding>, BackendError> {
        let reply = self.request(GET_WORKSPACES, "").await?;
        let workspaces: Vec<SwayWorkspace> = reply.json()?;

        Ok(workspaces
            .into_iter()
            .filter(|ws| !ws.output.is_empty())
            .map(|ws| WorkspaceBinding {
                workspace: ws.name,
                output: ws.output,
            })
            .collect())
    }

    async fn move_workspace(&self, workspace: &str, output: &str) -> Result<(), BackendError> {
        self.run_command(&format!(
            r#"[workspace="{}"] move workspace to output {}"#,
            workspace.replace('"', "\\\""),
            output
        ))
        .await
    }
}

impl SwayOutput {
    fn into_descriptor(self) -> MonitorDescriptor {
        let mut m = MonitorDescriptor::new(
            self.name,
            identity_from_parts(&self.make, &self.model, &self.serial),
        );

        // Disabled outputs report scale -1 or no scale at all
        let scale = self.scale.unwrap_or(-1.0);
        m.enabled = self.active && scale > 0.0;

        if let Some(mode) = self.current_mode {
            m.mode = Mode::new(mode.width, mode.height, mode.refresh);
        }

        if m.enabled {
            m.scale = scale;
            m.x = self.rect.x;
            m.y = self.rect.y;
            m.transform = self
                .transform
                .as_deref()
                .and_then(transform_from_sway)
                .unwrap_or_default();
        }
        m
    }
}

/// Sway rotates clockwise; the Wayland numbering is counter-clockwise.
pub fn transform_to_sway(t: Transform) -> &'static str {
    match t {
        Transform::Normal => "normal",
        Transform::Rotate90 => "270",
        Transform::Rotate180 => "180",
        Transform::Rotate270 => "90",
        Transform::Flipped => "flipped",
        Transform::Flipped90 => "flipped-270",
        Transform::Flipped180 => "flipped-180",
        Transform::Flipped270 => "flipped-90",
    }
}

pub fn transform_from_sway(s: &str) -> Option<Transform> {
    let t = match s {
        "normal" => Transform::Normal,
        "270" => Transform::Rotate90,
        "180" => Transform::Rotate180,
        "90" => Transform::Rotate270,
        "flipped" => Transform::Flipped,
        "flipped-270" => Transform::Flipped90,
        "flipped-180" => Transform::Flipped180,
        "flipped-90" => Transform::Flipped270,
        _ => return None,
    };
    Some(t)
}

fn output_command(m: &MonitorDescriptor) -> String {
    if !m.enabled {
        return format!("output {} disable", m.name);
    }

    format!(
        "output {} mode {}x{}@{}Hz pos {} {} scale {} transform {} enable",
        m.name,
        m.mode.width,
        m.mode.height,
        format_refresh(m.mode.refresh_mhz),
        m.x,
        m.y,
        m.scale,
        transform_to_sway(m.transform)
    )
}

fn check_results(results: &[CommandResult]) -> Result<(), BackendError> {
    let errors: Vec<String> = results
        .iter()
        .filter(|r| !r.success)
        .map(|r| r.error.clone().unwrap_or_else(|| "unknown error".to_string()))
        .collect();

    if errors.is_empty() {
        Ok(())
    } else {
        Err(BackendError::Apply(errors.join("; ")))
    }
}

/// Only hotplug changes are forwarded; the `unspecified` events sway emits
/// for mode or position changes would echo our own applies.
fn output_change(event: OutputEvent) -> Option<ChangeEvent> {
    let name = event.output.unwrap_or_default();
    match event.change.as_str() {
        "new" => Some(ChangeEvent::Added(name)),
        "del" => Some(ChangeEvent::Removed(name)),
        _ => None,
    }
}
