//! Control socket listener: answers STATUS, turns STOP into a termination
//! request for the owning run.

use std::fs;
use std::io::ErrorKind;
use std::os::unix::net::UnixStream as StdUnixStream;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::{io_err, ProtocolError};
use crate::protocol::{ControlAction, ControlRequest, ControlResponse};
use crate::StopReason;

pub(crate) type StatusSource = Arc<dyn Fn() -> Value + Send + Sync>;

/// A bound control socket. Dropping it stops accepting and removes the
/// socket file.
pub(crate) struct ControlServer {
    socket: PathBuf,
    task: JoinHandle<()>,
}

impl ControlServer {
    /// Bind `socket` and serve requests until dropped. STOP requests are
    /// forwarded to `stop_tx`.
    pub(crate) fn start(
        socket: &Path,
        status: StatusSource,
        stop_tx: mpsc::UnboundedSender<StopReason>,
    ) -> Result<Self, ProtocolError> {
        if let Some(parent) = socket.parent() {
            if !parent.exists() {
                fs::create_dir_all(parent).map_err(|e| io_err(parent, e))?;
            }
        }
        prepare_socket_for_bind(socket)?;
        let listener = UnixListener::bind(socket).map_err(|e| io_err(socket, e))?;
        set_socket_permissions(socket)?;
        tracing::debug!(socket = %socket.display(), "control socket listening");

        let path = socket.to_path_buf();
        let task = tokio::spawn(async move {
            loop {
                let stream = match listener.accept().await {
                    Ok((stream, _)) => stream,
                    Err(err) => {
                        tracing::error!(socket = %path.display(), error = %err, "control socket accept failed");
                        break;
                    }
                };
                let status = status.clone();
                let stop_tx = stop_tx.clone();
                tokio::spawn(async move {
                    if let Err(err) = handle_client(stream, status, stop_tx).await {
                        tracing::warn!(error = %err, "control client error");
                    }
                });
            }
        });

        Ok(Self {
            socket: socket.to_path_buf(),
            task,
        })
    }

    pub(crate) fn socket(&self) -> &Path {
        &self.socket
    }
}

impl Drop for ControlServer {
    fn drop(&mut self) {
        self.task.abort();
        match fs::remove_file(&self.socket) {
            Ok(()) => tracing::debug!(socket = %self.socket.display(), "control socket removed"),
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => {
                tracing::warn!(socket = %self.socket.display(), error = %err, "failed to remove control socket")
            }
        }
    }
}

async fn handle_client(
    stream: UnixStream,
    status: StatusSource,
    stop_tx: mpsc::UnboundedSender<StopReason>,
) -> Result<(), ProtocolError> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    while let Some(line) = lines
        .next_line()
        .await
        .map_err(|e| io_err("control socket read", e))?
    {
        if line.trim().is_empty() {
            continue;
        }

        let request = match serde_json::from_str::<ControlRequest>(&line) {
            Ok(request) => request,
            Err(err) => {
                write_response(
                    &mut writer,
                    &ControlResponse::error(format!("invalid request: {err}")),
                )
                .await?;
                continue;
            }
        };

        match request.action {
            ControlAction::Status => {
                write_response(&mut writer, &ControlResponse::ok(status())).await?;
            }
            ControlAction::Stop => {
                tracing::info!("STOP received on control socket");
                // A closed channel means termination already ran.
                let _ = stop_tx.send(StopReason::Message);
                write_response(&mut writer, &ControlResponse::ok(json!({ "stopping": true }))).await?;
                break;
            }
        }
    }

    Ok(())
}

/// Remove a stale socket file left by a crashed run. A socket that still
/// accepts connections belongs to a live run and is an error.
fn prepare_socket_for_bind(socket: &Path) -> Result<(), ProtocolError> {
    if !socket.exists() {
        return Ok(());
    }

    match StdUnixStream::connect(socket) {
        Ok(_) => {
            return Err(ProtocolError::SocketInUse {
                socket: socket.to_path_buf(),
            })
        }
        Err(err) => {
            tracing::warn!(
                socket = %socket.display(),
                error = %err,
                "removing stale control socket before bind",
            );
        }
    }

    match fs::remove_file(socket) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(io_err(socket, err)),
    }
}

async fn write_response(
    writer: &mut OwnedWriteHalf,
    response: &ControlResponse,
) -> Result<(), ProtocolError> {
    let mut payload = serde_json::to_string(response)?;
    payload.push('\n');
    writer
        .write_all(payload.as_bytes())
        .await
        .map_err(|e| io_err("control socket write", e))?;
    writer
        .flush()
        .await
        .map_err(|e| io_err("control socket flush", e))?;
    Ok(())
}

fn set_socket_permissions(path: &Path) -> Result<(), ProtocolError> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600)).map_err(|e| io_err(path, e))
}
