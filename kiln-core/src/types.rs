//! Domain types shared by the kiln crates.
//!
//! All path fields use `PathBuf`; never `&str` or `String` for filesystem paths.

use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// The role a tracked child process plays in a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Build,
    Serve,
}

impl Role {
    pub fn all() -> [Role; 2] {
        [Role::Build, Role::Serve]
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Build => write!(f, "build"),
            Role::Serve => write!(f, "serve"),
        }
    }
}

/// What the cache store does when a record file already exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum CacheWritePolicy {
    /// Replace the previous record (atomic `.tmp` + rename).
    #[default]
    Overwrite,
    /// Refuse to write; one build, one record.
    FailIfExists,
}

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

/// The inferred (build command, serve command, output directory) triple.
///
/// Produced fresh on every run by the detector; never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PipelineSetting {
    /// Shell command that produces the build output.
    pub build_cmd: String,
    /// Shell command that serves the project, if one was found or configured.
    pub serve_cmd: Option<String>,
    /// Output directory name, relative to the project root.
    pub build_dir_name: String,
    /// Whether a `package.json` was found and parsed.
    pub has_manifest: bool,
    /// Framework label, informational only (e.g. `"React"`).
    pub framework: Option<String>,
}

// ---------------------------------------------------------------------------
// Cache record
// ---------------------------------------------------------------------------

/// Persisted metadata describing the most recent successful build.
///
/// On disk:
///
/// ```text
/// {
///   "builtAt": 1700000000000,
///   "commitSha": "3f1c…",
///   "buildDirName": "/app/build"
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheRecord {
    /// Build completion time, epoch milliseconds.
    pub built_at: i64,
    /// Revision captured right after the build; absent outside a repository.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit_sha: Option<String>,
    /// Absolute path of the output directory the build produced.
    pub build_dir_name: PathBuf,
}

impl CacheRecord {
    pub fn new(built_at: DateTime<Utc>, build_dir: PathBuf, commit_sha: Option<String>) -> Self {
        Self {
            built_at: built_at.timestamp_millis(),
            commit_sha,
            build_dir_name: build_dir,
        }
    }

    /// `built_at` as a UTC timestamp; `None` if the stored millis are out of range.
    pub fn built_at_utc(&self) -> Option<DateTime<Utc>> {
        Utc.timestamp_millis_opt(self.built_at).single()
    }
}
