//! Configuration resolution.
//!
//! A run is configured from three layers, highest priority first:
//!
//! ```text
//! ConfigOverrides   (CLI flags / embedding caller)
//! kiln.yaml         (optional, in the project root)
//! defaults
//! ```
//!
//! [`resolve`] merges them into an immutable [`Config`]. Absolute paths are
//! derived once from the relative inputs plus a known base directory and are
//! never touched again.

use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::ConfigError;
use crate::types::CacheWritePolicy;

pub const CONFIG_FILE_NAME: &str = "kiln.yaml";
pub const DEFAULT_CACHE_FILE_NAME: &str = ".kiln-cache-meta";
pub const DEFAULT_CONTROL_SOCKET: &str = ".kiln.sock";
pub const DEFAULT_BUILD_DIR: &str = "build";
pub const DEFAULT_SERVE_PORT: u16 = 3000;
pub const DEFAULT_CACHE_DURATION: Duration = Duration::from_secs(60 * 60);

// ---------------------------------------------------------------------------
// Inputs
// ---------------------------------------------------------------------------

/// Optional project-level settings read from `kiln.yaml`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ConfigFile {
    pub build_dir: Option<PathBuf>,
    pub build_cmd: Option<String>,
    pub serve_cmd: Option<String>,
    pub use_git: Option<bool>,
    pub cache_file_name: Option<String>,
    pub cache_write_policy: Option<CacheWritePolicy>,
    pub cache_duration_secs: Option<u64>,
    pub serve_port: Option<u16>,
    pub control_socket: Option<PathBuf>,
}

/// Caller-supplied partial config. Only `project_root` is required.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub project_root: PathBuf,
    pub build_dir: Option<PathBuf>,
    pub build_cmd: Option<String>,
    pub serve_cmd: Option<String>,
    pub use_git: Option<bool>,
    pub cache_file_name: Option<String>,
    pub cache_write_policy: Option<CacheWritePolicy>,
    pub cache_duration: Option<Duration>,
    pub serve_port: Option<u16>,
    pub control_socket: Option<PathBuf>,
    /// Disable the control socket regardless of any configured path.
    pub no_control_socket: bool,
    /// Explicit config file; defaults to `<project_root>/kiln.yaml`.
    pub config_file: Option<PathBuf>,
    pub silent: bool,
    pub verbose: bool,
}

impl ConfigOverrides {
    pub fn new(project_root: impl Into<PathBuf>) -> Self {
        Self {
            project_root: project_root.into(),
            ..Self::default()
        }
    }
}

// ---------------------------------------------------------------------------
// Resolved config
// ---------------------------------------------------------------------------

/// Resolved configuration for one run. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub project_root: PathBuf,
    pub project_root_full: PathBuf,
    pub build_dir: PathBuf,
    pub build_dir_full: PathBuf,
    /// `true` when the build dir came from overrides or `kiln.yaml` rather
    /// than the default; an explicit dir wins over framework conventions.
    pub build_dir_explicit: bool,
    pub build_cmd: Option<String>,
    pub serve_cmd: Option<String>,
    pub use_git: bool,
    pub cache_file_name: String,
    pub cache_write_policy: CacheWritePolicy,
    pub cache_duration: Duration,
    pub serve_port: u16,
    pub control_socket: Option<PathBuf>,
    pub silent: bool,
    pub verbose: bool,
}

impl Config {
    /// Absolute output directory for a detected output-directory name.
    ///
    /// An explicitly configured build dir always wins.
    pub fn output_dir_for(&self, build_dir_name: &str) -> PathBuf {
        if self.build_dir_explicit {
            self.build_dir_full.clone()
        } else {
            resolve_mixed_path(Path::new(build_dir_name), &self.project_root_full)
        }
    }

    /// `<project_root_full>/<cache_file_name>`: pure, no I/O.
    pub fn cache_file_path(&self) -> PathBuf {
        self.project_root_full.join(&self.cache_file_name)
    }
}

// ---------------------------------------------------------------------------
// Resolution
// ---------------------------------------------------------------------------

/// Merge `overrides` over `kiln.yaml` over defaults.
///
/// A relative project root resolves against `calling_dir`; a relative build
/// dir resolves against the absolute project root.
pub fn resolve(overrides: ConfigOverrides, calling_dir: &Path) -> Result<Config, ConfigError> {
    let project_root = normalize(&overrides.project_root);
    let project_root_full = resolve_mixed_path(&project_root, calling_dir);
    if !project_root_full.is_dir() {
        return Err(ConfigError::ProjectRootMissing {
            path: project_root_full,
        });
    }

    let file_path = overrides
        .config_file
        .as_deref()
        .map(|p| resolve_mixed_path(p, &project_root_full))
        .unwrap_or_else(|| project_root_full.join(CONFIG_FILE_NAME));
    let file = load_file(&file_path)?;

    let explicit_build_dir = overrides.build_dir.or(file.build_dir);
    let build_dir_explicit = explicit_build_dir.is_some();
    let build_dir = normalize(
        &explicit_build_dir.unwrap_or_else(|| PathBuf::from(DEFAULT_BUILD_DIR)),
    );
    let build_dir_full = resolve_mixed_path(&build_dir, &project_root_full);

    let build_cmd = non_empty("build_cmd", overrides.build_cmd.or(file.build_cmd))?;
    let serve_cmd = non_empty("serve_cmd", overrides.serve_cmd.or(file.serve_cmd))?;

    let control_socket = if overrides.no_control_socket {
        None
    } else {
        let socket = overrides
            .control_socket
            .or(file.control_socket)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONTROL_SOCKET));
        Some(resolve_mixed_path(&socket, &project_root_full))
    };

    Ok(Config {
        project_root,
        project_root_full,
        build_dir,
        build_dir_full,
        build_dir_explicit,
        build_cmd,
        serve_cmd,
        use_git: overrides.use_git.or(file.use_git).unwrap_or(true),
        cache_file_name: overrides
            .cache_file_name
            .or(file.cache_file_name)
            .filter(|name| !name.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_CACHE_FILE_NAME.to_string()),
        cache_write_policy: overrides
            .cache_write_policy
            .or(file.cache_write_policy)
            .unwrap_or_default(),
        cache_duration: overrides
            .cache_duration
            .or(file.cache_duration_secs.map(Duration::from_secs))
            .unwrap_or(DEFAULT_CACHE_DURATION),
        serve_port: overrides
            .serve_port
            .or(file.serve_port)
            .unwrap_or(DEFAULT_SERVE_PORT),
        control_socket,
        silent: overrides.silent,
        verbose: overrides.verbose,
    })
}

/// Load `kiln.yaml`; a missing file is an empty [`ConfigFile`].
pub fn load_file(path: &Path) -> Result<ConfigFile, ConfigError> {
    let contents = match std::fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(ConfigFile::default()),
        Err(source) => {
            return Err(ConfigError::Io {
                path: path.to_path_buf(),
                source,
            })
        }
    };
    if contents.trim().is_empty() {
        return Ok(ConfigFile::default());
    }
    serde_yaml::from_str(&contents).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

/// `path` if absolute, else `base/path`; normalized either way.
pub fn resolve_mixed_path(path: &Path, base: &Path) -> PathBuf {
    if path.is_absolute() {
        normalize(path)
    } else {
        normalize(&base.join(path))
    }
}

/// Lexically remove `.` and `..` components. Never touches the filesystem.
pub fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                let popped = matches!(
                    out.components().next_back(),
                    Some(Component::Normal(_))
                ) && out.pop();
                if !popped && !out.has_root() {
                    out.push("..");
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    if out.as_os_str().is_empty() {
        out.push(".");
    }
    out
}

fn non_empty(field: &'static str, value: Option<String>) -> Result<Option<String>, ConfigError> {
    match value {
        Some(cmd) if cmd.trim().is_empty() => Err(ConfigError::EmptyCommand { field }),
        other => Ok(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_strips_dot_segments() {
        assert_eq!(normalize(Path::new("./build")), PathBuf::from("build"));
        assert_eq!(normalize(Path::new("a/./b/../c")), PathBuf::from("a/c"));
        assert_eq!(normalize(Path::new("/a/b/../../..")), PathBuf::from("/"));
        assert_eq!(normalize(Path::new("../x")), PathBuf::from("../x"));
        assert_eq!(normalize(Path::new(".")), PathBuf::from("."));
    }

    #[test]
    fn resolve_mixed_path_keeps_absolute_input() {
        let base = Path::new("/srv/app");
        assert_eq!(
            resolve_mixed_path(Path::new("/tmp/out"), base),
            PathBuf::from("/tmp/out")
        );
        assert_eq!(
            resolve_mixed_path(Path::new("./dist"), base),
            PathBuf::from("/srv/app/dist")
        );
    }

    #[test]
    fn blank_build_cmd_is_rejected() {
        let err = non_empty("build_cmd", Some("   ".to_string())).unwrap_err();
        assert!(matches!(err, ConfigError::EmptyCommand { field: "build_cmd" }));
    }
}
