//! Process supervision: spawn shell commands, stream their output, track
//! live children per [`Role`], terminate everything on request.
//!
//! The registry is the single source of truth for shutdown. An entry is set
//! when a child spawns and cleared when that same child exits; termination
//! drains it, so a second `terminate_all` finds nothing to do.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use kiln_core::Role;
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, oneshot};

use crate::error::ProcessError;
use crate::server::ServerHandle;

/// How long to keep reading output after the child exited. A grandchild that
/// inherited the pipes can hold them open indefinitely.
const OUTPUT_DRAIN_GRACE: Duration = Duration::from_millis(500);

/// Upper bound on waiting for a kill request to reach the child.
const KILL_ACK_TIMEOUT: Duration = Duration::from_secs(2);

static NEXT_PROCESS_ID: AtomicU64 = AtomicU64::new(1);

// ---------------------------------------------------------------------------
// Handles and callbacks
// ---------------------------------------------------------------------------

/// A live child process as seen by the rest of the system.
///
/// Cloneable; killing through any clone reaches the same child.
#[derive(Debug, Clone)]
pub struct ProcessHandle {
    id: u64,
    pid: Option<u32>,
    kill_tx: mpsc::UnboundedSender<oneshot::Sender<()>>,
}

impl ProcessHandle {
    /// Supervisor-assigned id, unique for the lifetime of the host process.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Ask the child to die. Returns `false` when it has already exited.
    ///
    /// The request is queued; the signal goes out when the task running the
    /// child next wakes. Use [`kill_confirmed`](Self::kill_confirmed) when the
    /// caller must not proceed before that.
    pub fn kill(&self) -> bool {
        let (ack, _) = oneshot::channel();
        self.kill_tx.send(ack).is_ok()
    }

    /// Ask the child to die and wait until the kill signal has been sent.
    ///
    /// Returns `false` when the child exited before the request was seen.
    pub async fn kill_confirmed(&self) -> bool {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.kill_tx.send(ack_tx).is_err() {
            return false;
        }
        match tokio::time::timeout(KILL_ACK_TIMEOUT, ack_rx).await {
            Ok(Ok(())) => true,
            Ok(Err(_)) => false,
            Err(_) => {
                tracing::warn!(pid = ?self.pid, "kill not confirmed in time; still pending");
                true
            }
        }
    }

    pub fn is_running(&self) -> bool {
        !self.kill_tx.is_closed()
    }
}

pub type OutputCallback = Box<dyn Fn(&str) + Send + Sync>;
pub type ReceiveProc = Box<dyn FnOnce(ProcessHandle) + Send>;

/// Per-spawn hooks. Chunks are delivered in arrival order.
#[derive(Default)]
pub struct Callbacks {
    pub on_stdout: Option<OutputCallback>,
    pub on_stderr: Option<OutputCallback>,
    /// Called with the live handle before any output is read.
    pub receive_proc: Option<ReceiveProc>,
}

impl Callbacks {
    pub fn on_stdout(mut self, f: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.on_stdout = Some(Box::new(f));
        self
    }

    pub fn on_stderr(mut self, f: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.on_stderr = Some(Box::new(f));
        self
    }

    pub fn receive_proc(mut self, f: impl FnOnce(ProcessHandle) + Send + 'static) -> Self {
        self.receive_proc = Some(Box::new(f));
        self
    }
}

/// Spawn options. The environment is always inherited; `env` adds to it.
#[derive(Debug, Clone, Default)]
pub struct SpawnOptions {
    pub cwd: Option<PathBuf>,
    pub env: Vec<(String, String)>,
}

impl SpawnOptions {
    pub fn in_dir(cwd: impl Into<PathBuf>) -> Self {
        Self {
            cwd: Some(cwd.into()),
            env: Vec::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Spawning
// ---------------------------------------------------------------------------

/// Run `command args…` through the shell and collect its output.
///
/// Every stdout/stderr chunk goes to the matching callback and into the
/// returned buffer. A non-zero exit is an error only when
/// `fail_on_non_zero_exit` is set; a spawn failure always is.
pub async fn spawn_with_callbacks(
    command: &str,
    args: &[String],
    options: &SpawnOptions,
    callbacks: Callbacks,
    fail_on_non_zero_exit: bool,
) -> Result<String, ProcessError> {
    run_process(next_process_id(), command, args, options, callbacks, fail_on_non_zero_exit).await
}

fn next_process_id() -> u64 {
    NEXT_PROCESS_ID.fetch_add(1, Ordering::Relaxed)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stream {
    Stdout,
    Stderr,
}

struct Chunk {
    stream: Stream,
    text: String,
}

enum Event {
    Chunk(Option<Chunk>),
    Kill(oneshot::Sender<()>),
    Exited(std::io::Result<ExitStatus>),
}

async fn run_process(
    id: u64,
    command: &str,
    args: &[String],
    options: &SpawnOptions,
    callbacks: Callbacks,
    fail_on_non_zero_exit: bool,
) -> Result<String, ProcessError> {
    let line = shell_line(command, args);
    let mut cmd = shell_command(&line);
    if let Some(cwd) = &options.cwd {
        cmd.current_dir(cwd);
    }
    cmd.envs(options.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = cmd.spawn().map_err(|source| ProcessError::Spawn {
        command: line.clone(),
        source,
    })?;

    let (kill_tx, mut kill_rx) = mpsc::unbounded_channel();
    let handle = ProcessHandle {
        id,
        pid: child.id(),
        kill_tx,
    };
    tracing::debug!(command = %line, pid = ?handle.pid, "spawned");

    let Callbacks {
        on_stdout,
        on_stderr,
        receive_proc,
    } = callbacks;
    if let Some(receive) = receive_proc {
        receive(handle.clone());
    }

    let (chunk_tx, mut chunk_rx) = mpsc::unbounded_channel();
    if let Some(stdout) = child.stdout.take() {
        tokio::spawn(forward_chunks(stdout, Stream::Stdout, chunk_tx.clone()));
    }
    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(forward_chunks(stderr, Stream::Stderr, chunk_tx.clone()));
    }
    drop(chunk_tx);

    let mut output = String::new();
    let mut deliver = |chunk: Chunk| {
        let callback = match chunk.stream {
            Stream::Stdout => on_stdout.as_ref(),
            Stream::Stderr => on_stderr.as_ref(),
        };
        if let Some(callback) = callback {
            callback(&chunk.text);
        }
        output.push_str(&chunk.text);
    };

    let mut streams_open = true;
    let waited = loop {
        let event = tokio::select! {
            biased;
            chunk = chunk_rx.recv(), if streams_open => Event::Chunk(chunk),
            Some(ack) = kill_rx.recv() => Event::Kill(ack),
            status = child.wait() => Event::Exited(status),
        };
        match event {
            Event::Chunk(Some(chunk)) => deliver(chunk),
            Event::Chunk(None) => streams_open = false,
            Event::Kill(ack) => {
                if let Err(err) = child.start_kill() {
                    tracing::debug!(pid = ?handle.pid, error = %err, "kill failed; child likely gone");
                }
                let _ = ack.send(());
            }
            Event::Exited(status) => break status,
        }
    };
    // Closing the kill channel marks the handle as exited. Requests still
    // queued are dropped unanswered.
    kill_rx.close();
    drop(kill_rx);

    while streams_open {
        match tokio::time::timeout(OUTPUT_DRAIN_GRACE, chunk_rx.recv()).await {
            Ok(Some(chunk)) => deliver(chunk),
            Ok(None) => streams_open = false,
            Err(_) => {
                tracing::debug!(command = %line, "output still open after exit; detaching");
                break;
            }
        }
    }

    let status = match waited {
        Ok(status) => status,
        Err(source) => {
            return Err(ProcessError::Wait {
                command: line,
                output,
                source,
            })
        }
    };
    tracing::debug!(command = %line, status = %status, "exited");

    if status.success() || !fail_on_non_zero_exit {
        Ok(output)
    } else {
        Err(ProcessError::NonZeroExit {
            command: line,
            code: status.code(),
            output,
        })
    }
}

async fn forward_chunks<R>(reader: R, stream: Stream, tx: mpsc::UnboundedSender<Chunk>)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let text = String::from_utf8_lossy(&buf).into_owned();
                if tx.send(Chunk { stream, text }).is_err() {
                    break;
                }
            }
            Err(err) => {
                tracing::debug!(stream = ?stream, error = %err, "output read failed");
                break;
            }
        }
    }
}

/// Args are appended verbatim and interpreted by the shell.
fn shell_line(command: &str, args: &[String]) -> String {
    if args.is_empty() {
        command.to_string()
    } else {
        format!("{command} {}", args.join(" "))
    }
}

#[cfg(unix)]
fn shell_command(line: &str) -> Command {
    let mut cmd = Command::new("sh");
    cmd.arg("-c").arg(line);
    cmd
}

#[cfg(windows)]
fn shell_command(line: &str) -> Command {
    let mut cmd = Command::new("cmd");
    cmd.arg("/C").arg(line);
    cmd
}

// ---------------------------------------------------------------------------
// Supervisor
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct ProcessRegistry {
    procs: HashMap<Role, ProcessHandle>,
    server: Option<ServerHandle>,
}

/// Point-in-time view of the registry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RegistrySnapshot {
    pub build: Option<u32>,
    pub serve: Option<u32>,
    /// Fallback server address, when one is running.
    pub server: Option<String>,
}

/// What a call to [`Supervisor::terminate_all`] did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TerminationReport {
    /// Roles and pids a kill was delivered to.
    pub signaled: Vec<(Role, Option<u32>)>,
    pub server_closed: bool,
}

impl TerminationReport {
    pub fn is_empty(&self) -> bool {
        self.signaled.is_empty() && !self.server_closed
    }
}

/// Owns the process registry for one run. Cheap to clone; clones share it.
#[derive(Debug, Clone, Default)]
pub struct Supervisor {
    registry: Arc<Mutex<ProcessRegistry>>,
}

impl Supervisor {
    pub fn new() -> Self {
        Self::default()
    }

    /// [`spawn_with_callbacks`], registering the child under `role` for its
    /// lifetime. A caller-supplied `receive_proc` runs after registration.
    pub async fn spawn_tracked(
        &self,
        role: Role,
        command: &str,
        args: &[String],
        options: &SpawnOptions,
        callbacks: Callbacks,
        fail_on_non_zero_exit: bool,
    ) -> Result<String, ProcessError> {
        let id = next_process_id();
        let supervisor = self.clone();
        let mut callbacks = callbacks;
        let caller_receive = callbacks.receive_proc.take();
        callbacks.receive_proc = Some(Box::new(move |handle: ProcessHandle| {
            supervisor.register(role, handle.clone());
            if let Some(receive) = caller_receive {
                receive(handle);
            }
        }));

        let result = run_process(id, command, args, options, callbacks, fail_on_non_zero_exit).await;
        self.clear(role, id);
        result
    }

    fn register(&self, role: Role, handle: ProcessHandle) {
        tracing::debug!(role = %role, pid = ?handle.pid, "tracking process");
        let previous = self.registry().procs.insert(role, handle);
        if let Some(previous) = previous.filter(ProcessHandle::is_running) {
            tracing::warn!(role = %role, pid = ?previous.pid, "replaced a live tracked process");
        }
    }

    /// Remove `role`'s entry only if it still refers to process `id`.
    fn clear(&self, role: Role, id: u64) {
        let mut registry = self.registry();
        if registry.procs.get(&role).map(ProcessHandle::id) == Some(id) {
            registry.procs.remove(&role);
            tracing::debug!(role = %role, "process exited, untracked");
        }
    }

    pub fn tracked(&self, role: Role) -> Option<ProcessHandle> {
        self.registry().procs.get(&role).cloned()
    }

    pub fn set_server(&self, handle: ServerHandle) {
        self.registry().server = Some(handle);
    }

    pub fn snapshot(&self) -> RegistrySnapshot {
        let registry = self.registry();
        RegistrySnapshot {
            build: registry.procs.get(&Role::Build).and_then(ProcessHandle::pid),
            serve: registry.procs.get(&Role::Serve).and_then(ProcessHandle::pid),
            server: registry
                .server
                .as_ref()
                .map(|s| s.local_addr().to_string()),
        }
    }

    /// Close the fallback server, then kill every tracked process.
    ///
    /// Returns once every kill signal has gone out, so the caller may exit
    /// the host process right after. Does not wait for children to exit.
    /// Safe to call any number of times.
    pub async fn terminate_all(&self) -> TerminationReport {
        let (procs, server) = {
            let mut registry = self.registry();
            let procs: Vec<(Role, ProcessHandle)> = registry.procs.drain().collect();
            (procs, registry.server.take())
        };

        let mut report = TerminationReport::default();
        if let Some(server) = server {
            server.close().await;
            report.server_closed = true;
        }

        for (role, handle) in procs {
            if handle.kill_confirmed().await {
                report.signaled.push((role, handle.pid()));
            } else {
                tracing::debug!(role = %role, pid = ?handle.pid(), "already exited");
            }
        }

        if report.is_empty() {
            tracing::debug!("nothing to terminate");
        } else {
            let pids: Vec<u32> = report.signaled.iter().filter_map(|(_, pid)| *pid).collect();
            tracing::info!(
                pids = ?pids,
                server_closed = report.server_closed,
                "termination signal sent",
            );
        }
        report
    }

    fn registry(&self) -> MutexGuard<'_, ProcessRegistry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
