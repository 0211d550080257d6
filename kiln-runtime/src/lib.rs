//! # kiln-runtime
//!
//! Everything that runs: the process supervisor, the bundled static server,
//! the control socket, and the orchestrator that ties detection, the build
//! cache and serving into one run.

#[cfg(unix)]
mod control;
pub mod error;
pub mod orchestrator;
#[cfg(unix)]
pub mod protocol;
pub mod server;
pub mod supervisor;

pub use error::{ProcessError, ProtocolError, RunError, ServerError};
pub use orchestrator::{run_blocking, Orchestrator, RunHandle, RunOutcome, StopReason};
pub use server::{FallbackServer, ServerHandle};
pub use supervisor::{
    spawn_with_callbacks, Callbacks, ProcessHandle, RegistrySnapshot, SpawnOptions, Supervisor,
    TerminationReport,
};
