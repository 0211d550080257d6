use std::path::PathBuf;

use thiserror::Error;

/// Failure of a supervised child process.
#[derive(Debug, Error)]
pub enum ProcessError {
    /// The shell could not be started at all.
    #[error("failed to spawn `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    /// Waiting on the child failed after it was spawned.
    #[error("failed waiting on `{command}`: {source}")]
    Wait {
        command: String,
        output: String,
        #[source]
        source: std::io::Error,
    },

    /// The child exited unsuccessfully; `code` is `None` when killed by a signal.
    #[error("`{command}` exited with {}", describe_code(.code))]
    NonZeroExit {
        command: String,
        code: Option<i32>,
        output: String,
    },
}

impl ProcessError {
    /// Output captured before the failure; empty for spawn errors.
    pub fn output(&self) -> &str {
        match self {
            ProcessError::Spawn { .. } => "",
            ProcessError::Wait { output, .. } | ProcessError::NonZeroExit { output, .. } => output,
        }
    }
}

fn describe_code(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("status {code}"),
        None => "no status (terminated by signal)".to_string(),
    }
}

/// Failure of the bundled static server.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to bind port {port}: {source}")]
    Bind {
        port: u16,
        #[source]
        source: std::io::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Error surface for the control socket and its client helpers.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("control protocol error: {0}")]
    Protocol(String),

    #[error("kiln is not running (socket missing: {socket})")]
    NotRunning { socket: PathBuf },

    #[error("control socket already in use: {socket}")]
    SocketInUse { socket: PathBuf },
}

pub(crate) fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> ProtocolError {
    ProtocolError::Io {
        path: path.into(),
        source,
    }
}

/// Fatal outcome of an orchestrator run.
#[derive(Debug, Error)]
pub enum RunError {
    /// The build command failed; nothing is served.
    #[error("build failed: {0}")]
    Build(#[source] ProcessError),

    #[error("fallback server failed: {0}")]
    Serve(#[from] ServerError),

    #[error("control socket error: {0}")]
    Control(#[from] ProtocolError),

    /// Termination was requested before the serve phase began.
    #[error("run stopped before serving ({reason})")]
    Stopped { reason: crate::StopReason },

    #[error("failed to install signal handlers: {0}")]
    Signals(#[source] std::io::Error),

    #[error("failed to start tokio runtime: {0}")]
    Runtime(#[source] std::io::Error),
}
