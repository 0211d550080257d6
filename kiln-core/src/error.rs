//! Error types for kiln-core.

use std::path::PathBuf;

use thiserror::Error;

/// All errors that can arise while resolving a [`crate::Config`].
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Underlying I/O failure while reading the project config file.
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// `kiln.yaml` exists but is not valid YAML for [`crate::ConfigFile`].
    #[error("failed to parse config file at {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    /// The project root does not exist or is not a directory.
    #[error("project root not found at {path}")]
    ProjectRootMissing { path: PathBuf },

    /// A command override was given but is blank.
    #[error("{field} must not be empty")]
    EmptyCommand { field: &'static str },
}
