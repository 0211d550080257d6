//! One run: detect the pipeline, rebuild unless the cache allows a skip,
//! then serve. Termination requests from signals, the control socket or the
//! [`RunHandle`] all go through the same idempotent shutdown routine.

use std::fmt;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::Utc;
use kiln_cache::{revision, store, CacheError};
use kiln_core::{CacheRecord, Config, PipelineSetting, Role};
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use crate::error::{ProcessError, RunError};
use crate::server::FallbackServer;
use crate::supervisor::{Callbacks, SpawnOptions, Supervisor};

/// Why a run was terminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// Name of the received signal, e.g. `"SIGTERM"`.
    Signal(&'static str),
    /// `{"action":"STOP"}` on the control socket.
    Message,
    ForceStop,
    ForceExit,
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StopReason::Signal(name) => write!(f, "received {name}"),
            StopReason::Message => write!(f, "STOP message"),
            StopReason::ForceStop => write!(f, "force stop"),
            StopReason::ForceExit => write!(f, "force exit"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunState {
    Init,
    Detecting,
    Aborted,
    Deciding,
    Building,
    CacheWriting,
    SkippingBuild,
    Serving,
    Running,
    Stopping,
    Stopped,
}

impl RunState {
    fn as_str(self) -> &'static str {
        match self {
            RunState::Init => "init",
            RunState::Detecting => "detecting",
            RunState::Aborted => "aborted",
            RunState::Deciding => "deciding",
            RunState::Building => "building",
            RunState::CacheWriting => "cache-writing",
            RunState::SkippingBuild => "skipping-build",
            RunState::Serving => "serving",
            RunState::Running => "running",
            RunState::Stopping => "stopping",
            RunState::Stopped => "stopped",
        }
    }
}

// ---------------------------------------------------------------------------
// Shared run state
// ---------------------------------------------------------------------------

/// Signal listener and control socket of one run, torn down together.
struct Triggers {
    task: JoinHandle<()>,
    #[cfg(unix)]
    control: Option<crate::control::ControlServer>,
}

impl Drop for Triggers {
    fn drop(&mut self) {
        self.task.abort();
    }
}

struct RunShared {
    supervisor: Supervisor,
    project_root: PathBuf,
    state: Mutex<RunState>,
    pipeline: Mutex<Option<PipelineSetting>>,
    build_ran: Mutex<Option<bool>>,
    stop: watch::Sender<Option<StopReason>>,
    stopped: watch::Sender<bool>,
    triggers: Mutex<Option<Triggers>>,
}

impl RunShared {
    fn new(project_root: PathBuf) -> Self {
        Self {
            supervisor: Supervisor::new(),
            project_root,
            state: Mutex::new(RunState::Init),
            pipeline: Mutex::new(None),
            build_ran: Mutex::new(None),
            stop: watch::channel(None).0,
            stopped: watch::channel(false).0,
            triggers: Mutex::new(None),
        }
    }

    fn transition(&self, next: RunState) {
        let mut state = lock(&self.state);
        tracing::debug!(from = state.as_str(), to = next.as_str(), "run state");
        *state = next;
    }

    fn stop_reason(&self) -> Option<StopReason> {
        *self.stop.borrow()
    }

    /// Terminate everything tracked by this run. The first caller does the
    /// work; later callers wait for it to finish.
    async fn shutdown(&self, reason: StopReason) {
        let first = self.stop.send_if_modified(|current| {
            if current.is_none() {
                *current = Some(reason);
                true
            } else {
                false
            }
        });
        if !first {
            self.wait_stopped().await;
            return;
        }

        tracing::info!(reason = %reason, "stopping");
        self.transition(RunState::Stopping);
        let report = self.supervisor.terminate_all().await;
        tracing::debug!(
            signaled = report.signaled.len(),
            server_closed = report.server_closed,
            "termination complete",
        );
        self.release_triggers();
        self.transition(RunState::Stopped);
        self.stopped.send_replace(true);
    }

    async fn wait_stopped(&self) {
        let mut stopped = self.stopped.subscribe();
        // The sender lives in `self`, so this cannot observe a closed channel.
        let _ = stopped.wait_for(|done| *done).await;
    }

    fn release_triggers(&self) {
        if lock(&self.triggers).take().is_some() {
            tracing::debug!("termination triggers released");
        }
    }

    fn status_payload(&self) -> Value {
        let state = lock(&self.state).as_str();
        let pipeline = lock(&self.pipeline).clone();
        let build_ran = *lock(&self.build_ran);
        json!({
            "pid": std::process::id(),
            "projectRoot": self.project_root,
            "state": state,
            "pipeline": pipeline,
            "buildRan": build_ran,
            "processes": self.supervisor.snapshot(),
        })
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

/// Result of [`Orchestrator::run`] that is not an error.
#[derive(Debug)]
pub enum RunOutcome {
    /// No pipeline could be inferred; nothing was built or served.
    Aborted,
    /// Serving; the handle controls the rest of the run.
    Running(RunHandle),
}

#[derive(Debug, Clone)]
pub struct Orchestrator {
    config: Config,
    signal_handlers: bool,
}

impl Orchestrator {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            signal_handlers: true,
        }
    }

    /// Whether `run` installs SIGINT/SIGHUP/SIGTERM handlers. On by default;
    /// tests running several orchestrators in one process turn it off.
    pub fn with_signal_handlers(mut self, enabled: bool) -> Self {
        self.signal_handlers = enabled;
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Drive the run up to the serving state.
    ///
    /// Returns once the build (if any) has finished and the serve command or
    /// fallback server has been started; it does not wait for serving to end.
    pub async fn run(self) -> Result<RunOutcome, RunError> {
        let shared = Arc::new(RunShared::new(self.config.project_root_full.clone()));
        let (stop_tx, stop_rx) = mpsc::unbounded_channel();

        let signals = if self.signal_handlers {
            Some(Signals::install()?)
        } else {
            None
        };
        #[cfg(unix)]
        let control = self.start_control(&shared, stop_tx.clone())?;
        if cfg!(not(unix)) && self.config.control_socket.is_some() {
            tracing::warn!("control socket is only supported on unix; STOP messages are unavailable");
        }
        drop(stop_tx);

        let task = tokio::spawn(trigger_task(shared.clone(), stop_rx, signals));
        *lock(&shared.triggers) = Some(Triggers {
            task,
            #[cfg(unix)]
            control,
        });

        let result = self.drive(&shared).await;
        match result {
            Ok(RunOutcome::Running(handle)) => Ok(RunOutcome::Running(handle)),
            Err(err @ RunError::Stopped { .. }) => {
                shared.wait_stopped().await;
                shared.release_triggers();
                Err(err)
            }
            other => {
                shared.release_triggers();
                other
            }
        }
    }

    #[cfg(unix)]
    fn start_control(
        &self,
        shared: &Arc<RunShared>,
        stop_tx: mpsc::UnboundedSender<StopReason>,
    ) -> Result<Option<crate::control::ControlServer>, RunError> {
        let Some(socket) = &self.config.control_socket else {
            return Ok(None);
        };
        let status_shared = shared.clone();
        let status: crate::control::StatusSource = Arc::new(move || status_shared.status_payload());
        let server = crate::control::ControlServer::start(socket, status, stop_tx)?;
        Ok(Some(server))
    }

    async fn drive(&self, shared: &Arc<RunShared>) -> Result<RunOutcome, RunError> {
        let config = &self.config;

        shared.transition(RunState::Detecting);
        let Some(pipeline) = kiln_detector::detect(config) else {
            shared.transition(RunState::Aborted);
            tracing::warn!(
                project_root = %config.project_root_full.display(),
                "no build pipeline detected; nothing to do",
            );
            return Ok(RunOutcome::Aborted);
        };
        tracing::info!(
            build = %pipeline.build_cmd,
            serve = pipeline.serve_cmd.as_deref().unwrap_or("<fallback server>"),
            output_dir = %pipeline.build_dir_name,
            framework = pipeline.framework.as_deref().unwrap_or("-"),
            "pipeline detected",
        );
        *lock(&shared.pipeline) = Some(pipeline.clone());

        shared.transition(RunState::Deciding);
        let decision = kiln_cache::can_serve(config).await;
        let build_ran = !decision.can_serve;
        *lock(&shared.build_ran) = Some(build_ran);

        // Termination may already have drained an empty registry.
        if let Some(reason) = shared.stop_reason() {
            return Err(RunError::Stopped { reason });
        }

        if build_ran {
            shared.transition(RunState::Building);
            tracing::info!(command = %pipeline.build_cmd, reason = %decision.reason, "building");
            let built = shared
                .supervisor
                .spawn_tracked(
                    Role::Build,
                    &pipeline.build_cmd,
                    &[],
                    &SpawnOptions::in_dir(&config.project_root_full),
                    tracked_callbacks(shared, Role::Build, || {}),
                    true,
                )
                .await;
            if let Some(reason) = shared.stop_reason() {
                return Err(RunError::Stopped { reason });
            }
            built.map_err(RunError::Build)?;

            shared.transition(RunState::CacheWriting);
            write_cache_record(config, &pipeline).await;
        } else {
            shared.transition(RunState::SkippingBuild);
            tracing::info!(reason = %decision.reason, "skipping build; serving previous output");
        }

        if let Some(reason) = shared.stop_reason() {
            return Err(RunError::Stopped { reason });
        }

        shared.transition(RunState::Serving);
        let server_addr = match &pipeline.serve_cmd {
            Some(serve_cmd) => {
                start_serve_process(shared, serve_cmd, &config.project_root_full).await;
                None
            }
            None => {
                let directory = config.output_dir_for(&pipeline.build_dir_name);
                let server = FallbackServer::start(config.serve_port, &directory).await?;
                shared.supervisor.set_server(server.handle());
                Some(server.local_addr())
            }
        };

        // A stop that raced the serve start may have missed the new entry.
        if let Some(reason) = shared.stop_reason() {
            shared.supervisor.terminate_all().await;
            return Err(RunError::Stopped { reason });
        }

        shared.transition(RunState::Running);
        Ok(RunOutcome::Running(RunHandle {
            shared: shared.clone(),
            pipeline,
            build_ran,
            server_addr,
        }))
    }
}

/// Spawn the serve command in the background and return once it is tracked.
async fn start_serve_process(shared: &Arc<RunShared>, serve_cmd: &str, cwd: &Path) {
    let (registered_tx, registered_rx) = oneshot::channel();
    let supervisor = shared.supervisor.clone();
    let command = serve_cmd.to_string();
    let options = SpawnOptions::in_dir(cwd);
    tracing::info!(command = %command, "starting serve command");

    let callbacks = tracked_callbacks(shared, Role::Serve, move || {
        let _ = registered_tx.send(());
    });

    tokio::spawn(async move {
        match supervisor
            .spawn_tracked(Role::Serve, &command, &[], &options, callbacks, false)
            .await
        {
            Ok(_) => tracing::info!(command = %command, "serve command exited"),
            Err(err @ ProcessError::Spawn { .. }) => {
                tracing::error!(error = %err, "serve command could not be started")
            }
            Err(err) => tracing::warn!(error = %err, "serve command failed"),
        }
    });

    // Err: the spawn failed before registration; already logged above.
    let _ = registered_rx.await;
}

/// Output logging for a tracked child, plus a kill on registration when a
/// stop landed between the last state check and the spawn.
fn tracked_callbacks(
    shared: &Arc<RunShared>,
    role: Role,
    on_registered: impl FnOnce() + Send + 'static,
) -> Callbacks {
    let run = shared.clone();
    log_output(role).receive_proc(move |handle| {
        if let Some(reason) = run.stop_reason() {
            tracing::info!(role = %role, pid = ?handle.pid(), reason = %reason, "stop already requested; killing");
            handle.kill();
        }
        on_registered();
    })
}

async fn write_cache_record(config: &Config, pipeline: &PipelineSetting) {
    let commit_sha = if config.use_git {
        revision::current_revision_opt(&config.project_root_full).await
    } else {
        // Recorded when available; a later git-enabled run compares against it.
        revision::current_revision(&config.project_root_full).await.ok()
    };

    let record = CacheRecord::new(
        Utc::now(),
        config.output_dir_for(&pipeline.build_dir_name),
        commit_sha,
    );
    match store::write(&record, config) {
        Ok(path) => tracing::info!(path = %path.display(), "build recorded"),
        Err(err @ CacheError::AlreadyExists { .. }) => {
            tracing::warn!(error = %err, "cache record kept; next run will rebuild")
        }
        Err(err) => tracing::error!(error = %err, "failed to write cache record"),
    }
}

fn log_output(role: Role) -> Callbacks {
    Callbacks::default()
        .on_stdout(move |chunk| tracing::info!(role = %role, "{}", chunk.trim_end()))
        .on_stderr(move |chunk| tracing::warn!(role = %role, "{}", chunk.trim_end()))
}

// ---------------------------------------------------------------------------
// Termination triggers
// ---------------------------------------------------------------------------

#[cfg(unix)]
struct Signals {
    interrupt: tokio::signal::unix::Signal,
    hangup: tokio::signal::unix::Signal,
    terminate: tokio::signal::unix::Signal,
}

#[cfg(unix)]
impl Signals {
    fn install() -> Result<Self, RunError> {
        use tokio::signal::unix::{signal, SignalKind};
        Ok(Self {
            interrupt: signal(SignalKind::interrupt()).map_err(RunError::Signals)?,
            hangup: signal(SignalKind::hangup()).map_err(RunError::Signals)?,
            terminate: signal(SignalKind::terminate()).map_err(RunError::Signals)?,
        })
    }

    async fn recv(&mut self) -> &'static str {
        tokio::select! {
            _ = self.interrupt.recv() => "SIGINT",
            _ = self.hangup.recv() => "SIGHUP",
            _ = self.terminate.recv() => "SIGTERM",
        }
    }
}

#[cfg(not(unix))]
struct Signals;

#[cfg(not(unix))]
impl Signals {
    fn install() -> Result<Self, RunError> {
        Ok(Self)
    }

    async fn recv(&mut self) -> &'static str {
        match tokio::signal::ctrl_c().await {
            Ok(()) => "ctrl-c",
            Err(err) => {
                tracing::error!(error = %err, "ctrl-c handler failed");
                std::future::pending().await
            }
        }
    }
}

async fn trigger_task(
    shared: Arc<RunShared>,
    mut stop_rx: mpsc::UnboundedReceiver<StopReason>,
    mut signals: Option<Signals>,
) {
    let reason = tokio::select! {
        Some(reason) = stop_rx.recv() => reason,
        name = async {
            match signals.as_mut() {
                Some(signals) => signals.recv().await,
                None => std::future::pending().await,
            }
        } => StopReason::Signal(name),
    };
    shared.shutdown(reason).await;
}

// ---------------------------------------------------------------------------
// RunHandle
// ---------------------------------------------------------------------------

/// Control over a run that reached the serving state.
///
/// Dropping the handle without stopping leaves the children running but
/// releases the signal handlers and the control socket.
pub struct RunHandle {
    shared: Arc<RunShared>,
    pipeline: PipelineSetting,
    build_ran: bool,
    server_addr: Option<SocketAddr>,
}

impl fmt::Debug for RunHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunHandle")
            .field("pipeline", &self.pipeline)
            .field("build_ran", &self.build_ran)
            .field("server_addr", &self.server_addr)
            .finish_non_exhaustive()
    }
}

impl RunHandle {
    pub fn pipeline(&self) -> &PipelineSetting {
        &self.pipeline
    }

    /// Whether this run executed the build command.
    pub fn build_ran(&self) -> bool {
        self.build_ran
    }

    /// Address of the fallback server; `None` when a serve command is used.
    pub fn server_addr(&self) -> Option<SocketAddr> {
        self.server_addr
    }

    pub fn supervisor(&self) -> &Supervisor {
        &self.shared.supervisor
    }

    /// Path of the control socket, when one is bound.
    #[cfg(unix)]
    pub fn control_socket(&self) -> Option<PathBuf> {
        lock(&self.shared.triggers)
            .as_ref()
            .and_then(|t| t.control.as_ref())
            .map(|c| c.socket().to_path_buf())
    }

    pub fn stop_reason(&self) -> Option<StopReason> {
        self.shared.stop_reason()
    }

    /// Terminate everything and return once termination has run.
    pub async fn force_stop(&self) {
        self.shared.shutdown(StopReason::ForceStop).await;
    }

    /// Terminate everything, then exit the host process with code 0. Never
    /// returns.
    ///
    /// Every kill signal has been sent before the exit; destructors do not
    /// run, so nothing is left to `kill_on_drop`.
    pub async fn force_exit(&self) {
        self.shared.shutdown(StopReason::ForceExit).await;
        std::process::exit(0)
    }

    /// Wait until a signal, a STOP message or [`force_stop`](Self::force_stop)
    /// has terminated the run.
    pub async fn wait_for_shutdown(&self) -> StopReason {
        self.shared.wait_stopped().await;
        self.shared.stop_reason().unwrap_or(StopReason::ForceStop)
    }
}

impl Drop for RunHandle {
    fn drop(&mut self) {
        self.shared.release_triggers();
    }
}

/// Build a current-thread runtime and drive `config` to completion: run,
/// then wait for termination.
pub fn run_blocking(config: Config) -> Result<Option<StopReason>, RunError> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(RunError::Runtime)?;
    runtime.block_on(run_to_completion(config))
}

async fn run_to_completion(config: Config) -> Result<Option<StopReason>, RunError> {
    match Orchestrator::new(config).run().await? {
        RunOutcome::Aborted => Ok(None),
        RunOutcome::Running(handle) => Ok(Some(handle.wait_for_shutdown().await)),
    }
}
