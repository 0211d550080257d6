//! Control socket wire format and blocking client helpers.
//!
//! One JSON object per line in each direction.

use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::thread::sleep;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{io_err, ProtocolError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ControlAction {
    Stop,
    Status,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlRequest {
    pub action: ControlAction,
}

impl ControlRequest {
    pub fn stop() -> Self {
        Self {
            action: ControlAction::Stop,
        }
    }

    pub fn status() -> Self {
        Self {
            action: ControlAction::Status,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlResponse {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ControlResponse {
    pub fn ok(data: Value) -> Self {
        Self {
            ok: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            data: None,
            error: Some(message.into()),
        }
    }

    pub fn into_data(self) -> Result<Value, ProtocolError> {
        if self.ok {
            Ok(self.data.unwrap_or(Value::Null))
        } else {
            Err(ProtocolError::Protocol(
                self.error
                    .unwrap_or_else(|| "unknown control error".to_string()),
            ))
        }
    }
}

/// Send one request to the socket at `socket` and read one response.
pub fn send_request(socket: &Path, request: &ControlRequest) -> Result<ControlResponse, ProtocolError> {
    if !socket.exists() {
        return Err(ProtocolError::NotRunning {
            socket: socket.to_path_buf(),
        });
    }

    let mut stream = UnixStream::connect(socket).map_err(|err| {
        if matches!(
            err.kind(),
            std::io::ErrorKind::NotFound
                | std::io::ErrorKind::ConnectionRefused
                | std::io::ErrorKind::ConnectionReset
        ) {
            ProtocolError::NotRunning {
                socket: socket.to_path_buf(),
            }
        } else {
            io_err(socket, err)
        }
    })?;

    let mut payload = serde_json::to_string(request)?;
    payload.push('\n');
    stream
        .write_all(payload.as_bytes())
        .map_err(|e| io_err(socket, e))?;
    stream.flush().map_err(|e| io_err(socket, e))?;

    let mut reader = BufReader::new(stream);
    let mut line = String::new();
    let read = reader.read_line(&mut line).map_err(|e| io_err(socket, e))?;
    if read == 0 {
        return Err(ProtocolError::Protocol(
            "kiln closed the connection before responding".to_string(),
        ));
    }

    Ok(serde_json::from_str(line.trim_end())?)
}

/// Status payload of the run behind `socket`. Retries briefly so a client
/// racing a starting run still connects.
pub fn request_status(socket: &Path) -> Result<Value, ProtocolError> {
    let request = ControlRequest::status();
    let mut last_not_running = None;
    for attempt in 0..5 {
        match send_request(socket, &request) {
            Ok(response) => return response.into_data(),
            Err(err @ ProtocolError::NotRunning { .. }) => {
                last_not_running = Some(err);
                if attempt < 4 {
                    sleep(Duration::from_millis(100));
                }
            }
            Err(err) => return Err(err),
        }
    }

    Err(last_not_running.unwrap_or_else(|| {
        ProtocolError::Protocol("status retry loop exited unexpectedly".to_string())
    }))
}

pub fn request_stop(socket: &Path) -> Result<(), ProtocolError> {
    send_request(socket, &ControlRequest::stop())?
        .into_data()
        .map(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn actions_use_uppercase_names() {
        assert_eq!(
            serde_json::to_string(&ControlRequest::stop()).unwrap(),
            r#"{"action":"STOP"}"#
        );
        let parsed: ControlRequest = serde_json::from_str(r#"{"action":"STATUS"}"#).unwrap();
        assert_eq!(parsed.action, ControlAction::Status);
        assert!(serde_json::from_str::<ControlRequest>(r#"{"action":"stop"}"#).is_err());
    }

    #[test]
    fn error_response_omits_data() {
        let json = serde_json::to_string(&ControlResponse::error("nope")).unwrap();
        assert_eq!(json, r#"{"ok":false,"error":"nope"}"#);
    }

    #[test]
    fn error_response_into_data_fails() {
        let err = ControlResponse::error("bad").into_data().unwrap_err();
        assert!(matches!(err, ProtocolError::Protocol(ref m) if m == "bad"));
    }

    #[test]
    fn missing_socket_is_not_running() {
        let dir = tempfile::TempDir::new().unwrap();
        let err = send_request(&dir.path().join("kiln.sock"), &ControlRequest::status()).unwrap_err();
        assert!(matches!(err, ProtocolError::NotRunning { .. }));
    }
}
