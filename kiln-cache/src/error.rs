//! Error types for kiln-cache.

use std::path::PathBuf;

use thiserror::Error;

/// All errors that can arise from cache store and revision operations.
#[derive(Debug, Error)]
pub enum CacheError {
    /// An I/O error, with annotated path for context.
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Cache record JSON serialization/deserialization error.
    #[error("cache record JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Write refused under the fail-if-exists policy.
    #[error("cache record already exists at {path}")]
    AlreadyExists { path: PathBuf },

    /// `git rev-parse HEAD` failed (no repository, no commits, no git).
    #[error("revision query failed in {dir}: {message}")]
    Revision { dir: PathBuf, message: String },
}

/// Convenience constructor for [`CacheError::Io`].
pub(crate) fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> CacheError {
    CacheError::Io {
        path: path.into(),
        source,
    }
}
