//! Hyprland backend.
//!
//! Requests go to `.socket.sock` as plain text, one request per connection;
//! the `j/` prefix asks for JSON. Hotplug notifications are read from the
//! newline-delimited `.socket2.sock` event stream.

use std::path::PathBuf;
use std::time::Duration;

use common::{Mode, MonitorDescriptor, MonitorSnapshot, Transform, WorkspaceBinding};
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::sync::mpsc;

use super::{
    BackendKind, ChangeEvent, CompositorBackend, EVENT_CHANNEL_CAPACITY, EventStream, bounded,
    enable_first, format_refresh, probe_socket,
};
use crate::error::BackendError;

pub struct HyprlandBackend {
    control: PathBuf,
    events: PathBuf,
    timeout: Duration,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HyprMonitor {
    name: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    width: u32,
    #[serde(default)]
    height: u32,
    #[serde(default)]
    refresh_rate: f64,
    #[serde(default)]
    x: i32,
    #[serde(default)]
    y: i32,
    #[serde(default = "one")]
    scale: f64,
    #[serde(default)]
    transform: u8,
    #[serde(default)]
    disabled: bool,
}

fn one() -> f64 {
    1.0
}

#[derive(Debug, Deserialize)]
struct HyprWorkspace {
    id: i64,
    name: String,
    #[serde(default)]
    monitor: String,
}

impl HyprlandBackend {
    pub fn new(control: PathBuf, events: PathBuf, timeout: Duration) -> Self {
        Self {
            control,
            events,
            timeout,
        }
    }

    /// Locate the instance sockets from `HYPRLAND_INSTANCE_SIGNATURE`.
    ///
    /// Hyprland before 0.40 kept them under `/tmp/hypr`.
    pub fn from_env(timeout: Duration) -> Option<Self> {
        let signature = std::env::var("HYPRLAND_INSTANCE_SIGNATURE")
            .ok()
            .filter(|s| !s.is_empty())?;

        let runtime_dir = std::env::var_os("XDG_RUNTIME_DIR")
            .map(|dir| PathBuf::from(dir).join("hypr").join(&signature));
        let legacy_dir = PathBuf::from("/tmp/hypr").join(&signature);

        let dir = match runtime_dir {
            Some(dir) if dir.exists() || !legacy_dir.exists() => dir,
            _ => legacy_dir,
        };

        Some(Self::new(
            dir.join(".socket.sock"),
            dir.join(".socket2.sock"),
            timeout,
        ))
    }

    async fn request(&self, command: &str) -> Result<String, BackendError> {
        bounded(self.timeout, async {
            let mut stream = UnixStream::connect(&self.control).await?;
            stream.write_all(command.as_bytes()).await?;

            let mut reply = Vec::new();
            stream.read_to_end(&mut reply).await?;
            Ok(String::from_utf8_lossy(&reply).into_owned())
        })
        .await
    }
}

impl CompositorBackend for HyprlandBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Hyprland
    }

    async fn detect(&self) -> bool {
        probe_socket(&self.control, self.timeout).await
    }

    async fn query_state(&self) -> Result<MonitorSnapshot, BackendError> {
        let reply = self.request("j/monitors all").await?;
        parse_monitors(&reply)
    }

    async fn apply_configuration(&self, target: &[MonitorDescriptor]) -> Result<(), BackendError> {
        if target.is_empty() {
            return Ok(());
        }

        let batch = enable_first(target)
            .into_iter()
            .map(|m| format!("keyword monitor {}", monitor_rule(m)))
            .collect::<Vec<_>>()
            .join(";");

        log::debug!("Hyprland batch: {}", batch);

        let reply = self
            .request(&format!("[[BATCH]]{}", batch))
            .await
            .map_err(|e| BackendError::Apply(e.to_string()))?;

        check_ok(&reply)
    }

    async fn subscribe_events(&self) -> Result<EventStream, BackendError> {
        let stream = bounded(self.timeout, async {
            Ok(UnixStream::connect(&self.events).await?)
        })
        .await?;

        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);

        tokio::spawn(async move {
            let mut reader = BufReader::new(stream);
            let mut line = Vec::new();

            loop {
                line.clear();
                let read = tokio::select! {
                    read = reader.read_until(b'\n', &mut line) => read,
                    _ = tx.closed() => break,
                };

                match read {
                    Ok(0) => {
                        log::warn!("Hyprland event socket closed");
                        break;
                    }
                    Ok(_) => {
                        let text = String::from_utf8_lossy(&line);
                        if let Some(event) = parse_event(text.trim_end())
                            && tx.send(event).await.is_err()
                        {
                            break;
                        }
                    }
                    Err(e) => {
                        log::warn!("Hyprland event socket error: {}", e);
                        break;
                    }
                }
            }
        });

        Ok(rx)
    }

    fn supports_workspaces(&self) -> bool {
        true
    }

    async fn workspaces(&self) -> Result<Vec<WorkspaceBinding>, BackendError> {
        let reply = self.request("j/workspaces").await?;
        parse_workspaces(&reply)
    }

    async fn move_workspace(&self, workspace: &str, output: &str) -> Result<(), BackendError> {
        let selector = if workspace.parse::<i64>().is_ok() {
            workspace.to_string()
        } else {
            format!("name:{}", workspace)
        };

        let reply = self
            .request(&format!("dispatch moveworkspacetomonitor {} {}", selector, output))
            .await?;
        check_ok(&reply)
    }
}

fn parse_monitors(json: &str) -> Result<MonitorSnapshot, BackendError> {
    let monitors: Vec<HyprMonitor> = serde_json::from_str(json)?;

    Ok(MonitorSnapshot::new(
        monitors.into_iter().map(HyprMonitor::into_descriptor).collect(),
    ))
}

impl HyprMonitor {
    fn into_descriptor(self) -> MonitorDescriptor {
        let mut m = MonitorDescriptor::new(self.name, self.description);
        m.mode = Mode::from_hz(self.width, self.height, self.refresh_rate);
        m.scale = self.scale;
        m.transform = Transform::from_index(self.transform).unwrap_or_default();
        m.enabled = !self.disabled;

        // Disabled monitors report -1,-1
        if !self.disabled {
            m.x = self.x;
            m.y = self.y;
        }
        m
    }
}

fn parse_workspaces(json: &str) -> Result<Vec<WorkspaceBinding>, BackendError> {
    let workspaces: Vec<HyprWorkspace> = serde_json::from_str(json)?;

    let mut bindings: Vec<(i64, WorkspaceBinding)> = workspaces
        .into_iter()
        .filter(|ws| ws.id > 0 && !ws.monitor.is_empty())
        .map(|ws| {
            (
                ws.id,
                WorkspaceBinding {
                    workspace: ws.name,
                    output: ws.monitor,
                },
            )
        })
        .collect();

    bindings.sort_by_key(|(id, _)| *id);
    Ok(bindings.into_iter().map(|(_, b)| b).collect())
}

/// `NAME,WxH@R,XxY,SCALE,transform,T` or `NAME,disable`.
fn monitor_rule(m: &MonitorDescriptor) -> String {
    if !m.enabled {
        return format!("{},disable", m.name);
    }

    format!(
        "{},{}x{}@{},{}x{},{},transform,{}",
        m.name,
        m.mode.width,
        m.mode.height,
        format_refresh(m.mode.refresh_mhz),
        m.x,
        m.y,
        m.scale,
        m.transform.index()
    )
}

/// Every reply segment must be `ok`.
fn check_ok(reply: &str) -> Result<(), BackendError> {
    if reply.replace("ok", "").trim().is_empty() {
        Ok(())
    } else {
        Err(BackendError::Apply(reply.trim().to_string()))
    }
}

fn parse_event(line: &str) -> Option<ChangeEvent> {
    let (event, data) = line.split_once(">>")?;

    // v2 payloads are `ID,NAME,DESCRIPTION`
    let v2_name = || data.splitn(3, ',').nth(1).map(str::to_string);

    match event {
        "monitoradded" => Some(ChangeEvent::Added(data.to_string())),
        "monitorremoved" => Some(ChangeEvent::Removed(data.to_string())),
        "monitoraddedv2" => v2_name().map(ChangeEvent::Added),
        "monitorremovedv2" => v2_name().map(ChangeEvent::Removed),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use tokio::net::UnixListener;

    const MONITORS: &str = r#"[
        {"id": 0, "name": "eDP-1", "description": "BOE 0x095F Unknown",
         "width": 2256, "height": 1504, "refreshRate": 59.99900,
         "x": 0, "y": 0, "scale": 1.5, "transform": 0, "disabled": false, "focused": true},
        {"id": 1, "name": "DP-1", "description": "Dell Inc. DELL U2720Q ABC123",
         "width": 3840, "height": 2160, "refreshRate": 60.0,
         "x": -1, "y": -1, "scale": 1.0, "transform": 1, "disabled": true}
    ]"#;

    /// Answer each request with the next canned reply and record what was
    /// asked. Connections that close without a request (probes) get nothing.
    fn fake_socket(
        dir: &std::path::Path,
        replies: Vec<&'static str>,
    ) -> (PathBuf, Arc<Mutex<Vec<String>>>) {
        let path = dir.join(".socket.sock");
        let listener = UnixListener::bind(&path).unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let log = seen.clone();

        tokio::spawn(async move {
            let mut replies = replies.into_iter();
            let mut next = replies.next();
            while let Some(reply) = next {
                let (mut stream, _) = listener.accept().await.unwrap();
                let mut buf = vec![0u8; 8192];
                let n = stream.read(&mut buf).await.unwrap_or(0);
                if n == 0 {
                    continue;
                }
                log.lock()
                    .unwrap()
                    .push(String::from_utf8_lossy(&buf[..n]).into_owned());
                let _ = stream.write_all(reply.as_bytes()).await;
                next = replies.next();
            }
        });

        (path, seen)
    }

    #[test]
    fn test_parse_monitors() {
        let snapshot = parse_monitors(MONITORS).unwrap();
        assert_eq!(snapshot.len(), 2);

        let edp = snapshot.get("eDP-1").unwrap();
        assert_eq!(edp.identity, "BOE 0x095F");
        assert_eq!(edp.mode.refresh_mhz, 59_999);
        assert!((edp.scale - 1.5).abs() < f64::EPSILON);
        assert!(edp.enabled);

        let dp = snapshot.get("DP-1").unwrap();
        assert!(!dp.enabled);
        assert_eq!((dp.x, dp.y), (0, 0));
        assert_eq!(dp.transform, Transform::Rotate90);
    }

    #[test]
    fn test_parse_workspaces_skips_special() {
        let json = r#"[
            {"id": 2, "name": "2", "monitor": "DP-1"},
            {"id": -98, "name": "special:scratch", "monitor": "DP-1"},
            {"id": 1, "name": "1", "monitor": "eDP-1"},
            {"id": 3, "name": "web", "monitor": "DP-1"}
        ]"#;

        let bindings = parse_workspaces(json).unwrap();
        let names: Vec<_> = bindings.iter().map(|b| b.workspace.as_str()).collect();
        assert_eq!(names, vec!["1", "2", "web"]);
        assert_eq!(bindings[0].output, "eDP-1");
    }

    #[test]
    fn test_monitor_rule() {
        let mut m = MonitorDescriptor::new("DP-1", "");
        m.mode = Mode::new(2560, 1440, 143_856);
        m.x = 1920;
        m.scale = 1.25;
        m.transform = Transform::Rotate270;
        assert_eq!(
            monitor_rule(&m),
            "DP-1,2560x1440@143.856,1920x0,1.25,transform,3"
        );

        m.enabled = false;
        assert_eq!(monitor_rule(&m), "DP-1,disable");
    }

    #[test]
    fn test_parse_event() {
        assert_eq!(
            parse_event("monitoradded>>HDMI-A-1"),
            Some(ChangeEvent::Added("HDMI-A-1".to_string()))
        );
        assert_eq!(
            parse_event("monitorremovedv2>>3,DP-2,LG Electronics 27GL850, rev 2"),
            Some(ChangeEvent::Removed("DP-2".to_string()))
        );
        assert_eq!(parse_event("workspace>>3"), None);
        assert_eq!(parse_event("garbage"), None);
    }

    #[test]
    fn test_check_ok() {
        assert!(check_ok("ok").is_ok());
        assert!(check_ok("ok\n\nok\n\nok").is_ok());
        assert!(check_ok("ok\n\ninvalid monitor rule").is_err());
    }

    #[tokio::test]
    async fn test_apply_sends_one_batch() {
        let dir = tempfile::tempdir().unwrap();
        let (control, seen) = fake_socket(dir.path(), vec!["ok\n\nok"]);
        let backend =
            HyprlandBackend::new(control, dir.path().join("events"), Duration::from_secs(1));

        let mut internal = MonitorDescriptor::new("eDP-1", "");
        internal.enabled = false;
        let external = MonitorDescriptor::new("DP-1", "");

        backend
            .apply_configuration(&[internal, external])
            .await
            .unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(
            seen[0],
            "[[BATCH]]keyword monitor DP-1,1920x1080@60,0x0,1,transform,0;keyword monitor eDP-1,disable"
        );
    }

    #[tokio::test]
    async fn test_apply_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let (control, _) = fake_socket(dir.path(), vec!["invalid resolution"]);
        let backend =
            HyprlandBackend::new(control, dir.path().join("events"), Duration::from_secs(1));

        let result = backend
            .apply_configuration(&[MonitorDescriptor::new("DP-1", "")])
            .await;
        assert!(matches!(result, Err(BackendError::Apply(_))));
    }

    #[tokio::test]
    async fn test_query_and_move_workspace() {
        let dir = tempfile::tempdir().unwrap();
        let (control, seen) = fake_socket(dir.path(), vec![MONITORS, "ok"]);
        let backend =
            HyprlandBackend::new(control, dir.path().join("events"), Duration::from_secs(1));

        // The probe connection must not eat the first reply
        assert!(backend.detect().await);
        let snapshot = backend.query_state().await.unwrap();
        assert_eq!(snapshot.len(), 2);

        backend.move_workspace("web", "eDP-1").await.unwrap();
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0], "j/monitors all");
        assert_eq!(seen[1], "dispatch moveworkspacetomonitor name:web eDP-1");
    }

    #[tokio::test]
    async fn test_event_stream() {
        let dir = tempfile::tempdir().unwrap();
        let events = dir.path().join(".socket2.sock");
        let listener = UnixListener::bind(&events).unwrap();

        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            stream
                .write_all(b"workspace>>2\nmonitoraddedv2>>1,DP-3,AOC 2757\nactivewindow>>kitty,~\n")
                .await
                .unwrap();
        });

        let backend =
            HyprlandBackend::new(dir.path().join("ctl"), events, Duration::from_secs(1));
        let mut rx = backend.subscribe_events().await.unwrap();

        assert_eq!(rx.recv().await, Some(ChangeEvent::Added("DP-3".to_string())));
        assert_eq!(rx.recv().await, None);
    }
}
