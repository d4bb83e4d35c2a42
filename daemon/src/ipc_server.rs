use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use common::{Command, DaemonEvent, MoniqueError, Response};
use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{broadcast, mpsc, oneshot};

/// A command waiting for the event loop to answer it.
#[derive(Debug)]
pub struct IpcRequest {
    pub command: Command,
    pub reply: oneshot::Sender<Response>,
}

/// Bind the socket, refusing to take over one a live daemon still answers on.
pub async fn bind(socket_path: &Path) -> Result<UnixListener> {
    if socket_path.exists() {
        if UnixStream::connect(socket_path).await.is_ok() {
            anyhow::bail!(
                "another daemon is already listening on {}",
                socket_path.display()
            );
        }
        std::fs::remove_file(socket_path)
            .with_context(|| format!("removing stale socket {}", socket_path.display()))?;
    }

    let listener = UnixListener::bind(socket_path)
        .with_context(|| format!("binding {}", socket_path.display()))?;
    log::info!("IPC server listening on: {}", socket_path.display());
    Ok(listener)
}

/// Accept clients until the event loop drops its request receiver.
pub async fn serve(
    listener: UnixListener,
    socket_path: PathBuf,
    requests: mpsc::Sender<IpcRequest>,
    events: broadcast::Sender<DaemonEvent>,
) {
    loop {
        let accepted = tokio::select! {
            accepted = listener.accept() => accepted,
            _ = requests.closed() => break,
        };

        match accepted {
            Ok((stream, _addr)) => {
                let requests = requests.clone();
                let events = events.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_client(stream, requests, events).await {
                        log::debug!("Client connection ended: {}", e);
                    }
                });
            }
            Err(e) => {
                log::error!("Error accepting connection: {}", e);
            }
        }
    }

    let _ = std::fs::remove_file(&socket_path);
    log::info!("IPC server stopped");
}

async fn handle_client(
    stream: UnixStream,
    requests: mpsc::Sender<IpcRequest>,
    events: broadcast::Sender<DaemonEvent>,
) -> Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let mut line = String::new();

    while reader.read_line(&mut line).await? > 0 {
        let response = match serde_json::from_str::<Command>(&line) {
            Ok(Command::Watch) => {
                // The connection belongs to the event stream from here on
                return watch(&mut writer, events.subscribe()).await;
            }
            Ok(command) => forward(command, &requests).await,
            Err(e) => {
                log::warn!("Invalid command: {}", e);
                Response::Error(MoniqueError::Ipc(format!("Invalid command: {}", e)))
            }
        };

        write_response(&mut writer, &response).await?;
        line.clear();
    }

    Ok(())
}

async fn forward(command: Command, requests: &mpsc::Sender<IpcRequest>) -> Response {
    log::debug!("Handling command: {:?}", command);

    let (reply, answer) = oneshot::channel();
    if requests.send(IpcRequest { command, reply }).await.is_err() {
        return Response::Error(MoniqueError::Ipc("daemon is shutting down".to_string()));
    }

    answer
        .await
        .unwrap_or_else(|_| Response::Error(MoniqueError::Ipc("request dropped".to_string())))
}

async fn watch<W: AsyncWrite + Unpin>(
    writer: &mut W,
    mut events: broadcast::Receiver<DaemonEvent>,
) -> Result<()> {
    write_response(writer, &Response::Ok).await?;

    loop {
        match events.recv().await {
            Ok(event) => write_response(writer, &Response::Event(event)).await?,
            Err(broadcast::error::RecvError::Lagged(n)) => {
                log::warn!("Watcher fell behind, {} events dropped", n);
            }
            Err(broadcast::error::RecvError::Closed) => return Ok(()),
        }
    }
}

async fn write_response<W: AsyncWrite + Unpin>(writer: &mut W, response: &Response) -> Result<()> {
    let response_json = serde_json::to_string(response)?;
    writer.write_all(response_json.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await?;
    Ok(())
}
