//! Config resolution tests for `kiln-core`.
//!
//! Each test gets an isolated `TempDir`: no shared state.

use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use kiln_core::config::{DEFAULT_CACHE_FILE_NAME, DEFAULT_SERVE_PORT};
use kiln_core::{resolve, CacheWritePolicy, ConfigError, ConfigOverrides};
use rstest::rstest;
use tempfile::TempDir;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn project() -> TempDir {
    TempDir::new().expect("tempdir")
}

fn write_config(dir: &TempDir, content: &str) {
    fs::write(dir.path().join("kiln.yaml"), content).expect("write kiln.yaml");
}

// ---------------------------------------------------------------------------
// Defaults
// ---------------------------------------------------------------------------

#[test]
fn defaults_apply_without_config_file() {
    let dir = project();
    let config = resolve(ConfigOverrides::new(dir.path()), dir.path()).expect("resolve");

    assert_eq!(config.project_root_full, dir.path());
    assert_eq!(config.build_dir, PathBuf::from("build"));
    assert_eq!(config.build_dir_full, dir.path().join("build"));
    assert!(!config.build_dir_explicit);
    assert!(config.use_git);
    assert_eq!(config.cache_file_name, DEFAULT_CACHE_FILE_NAME);
    assert_eq!(config.serve_port, DEFAULT_SERVE_PORT);
    assert_eq!(config.cache_write_policy, CacheWritePolicy::Overwrite);
    assert_eq!(config.cache_duration, Duration::from_secs(3600));
    assert_eq!(config.control_socket, Some(dir.path().join(".kiln.sock")));
    assert!(config.build_cmd.is_none());
    assert!(config.serve_cmd.is_none());
}

#[test]
fn relative_project_root_resolves_against_calling_dir() {
    let calling = project();
    fs::create_dir_all(calling.path().join("apps/site")).unwrap();

    let config = resolve(ConfigOverrides::new("./apps/site"), calling.path()).expect("resolve");

    assert_eq!(config.project_root, PathBuf::from("apps/site"));
    assert_eq!(config.project_root_full, calling.path().join("apps/site"));
    assert_eq!(
        config.build_dir_full,
        calling.path().join("apps/site/build")
    );
}

#[test]
fn missing_project_root_is_an_error() {
    let calling = project();
    let err = resolve(ConfigOverrides::new("nope"), calling.path()).unwrap_err();
    assert!(matches!(err, ConfigError::ProjectRootMissing { .. }));
}

// ---------------------------------------------------------------------------
// Layering
// ---------------------------------------------------------------------------

#[test]
fn config_file_values_are_used() {
    let dir = project();
    write_config(
        &dir,
        "build_dir: dist\nbuild_cmd: make site\nuse_git: false\nserve_port: 8080\n\
         cache_write_policy: fail-if-exists\ncache_duration_secs: 60\n",
    );

    let config = resolve(ConfigOverrides::new(dir.path()), dir.path()).expect("resolve");

    assert_eq!(config.build_dir_full, dir.path().join("dist"));
    assert!(config.build_dir_explicit);
    assert_eq!(config.build_cmd.as_deref(), Some("make site"));
    assert!(!config.use_git);
    assert_eq!(config.serve_port, 8080);
    assert_eq!(config.cache_write_policy, CacheWritePolicy::FailIfExists);
    assert_eq!(config.cache_duration, Duration::from_secs(60));
}

#[test]
fn overrides_win_over_config_file() {
    let dir = project();
    write_config(&dir, "build_cmd: make site\nserve_port: 8080\n");

    let overrides = ConfigOverrides {
        build_cmd: Some("npm run build".to_string()),
        serve_port: Some(3002),
        ..ConfigOverrides::new(dir.path())
    };
    let config = resolve(overrides, dir.path()).expect("resolve");

    assert_eq!(config.build_cmd.as_deref(), Some("npm run build"));
    assert_eq!(config.serve_port, 3002);
}

#[test]
fn no_control_socket_disables_configured_path() {
    let dir = project();
    write_config(&dir, "control_socket: /tmp/custom.sock\n");

    let overrides = ConfigOverrides {
        no_control_socket: true,
        ..ConfigOverrides::new(dir.path())
    };
    let config = resolve(overrides, dir.path()).expect("resolve");
    assert!(config.control_socket.is_none());
}

#[rstest]
#[case("build_cmd: [unterminated\n")]
#[case("unknown_key: 1\n")]
#[case("serve_port: not-a-number\n")]
fn invalid_config_file_is_a_parse_error(#[case] content: &str) {
    let dir = project();
    write_config(&dir, content);
    let err = resolve(ConfigOverrides::new(dir.path()), dir.path()).unwrap_err();
    assert!(
        matches!(err, ConfigError::Parse { .. }),
        "expected parse error, got {err:?}"
    );
}

#[test]
fn empty_config_file_is_treated_as_absent() {
    let dir = project();
    write_config(&dir, "\n");
    let config = resolve(ConfigOverrides::new(dir.path()), dir.path()).expect("resolve");
    assert_eq!(config.serve_port, DEFAULT_SERVE_PORT);
}

// ---------------------------------------------------------------------------
// Output dir selection
// ---------------------------------------------------------------------------

#[rstest]
#[case(None, "dist", "dist")]
#[case(Some("out"), "dist", "out")]
#[case(None, "build", "build")]
fn output_dir_prefers_explicit_build_dir(
    #[case] explicit: Option<&str>,
    #[case] detected: &str,
    #[case] expected: &str,
) {
    let dir = project();
    let overrides = ConfigOverrides {
        build_dir: explicit.map(PathBuf::from),
        ..ConfigOverrides::new(dir.path())
    };
    let config = resolve(overrides, dir.path()).expect("resolve");
    assert_eq!(config.output_dir_for(detected), dir.path().join(expected));
}

#[test]
fn cache_file_path_lives_in_project_root() {
    let dir = project();
    let overrides = ConfigOverrides {
        cache_file_name: Some(".custom-cache".to_string()),
        ..ConfigOverrides::new(dir.path())
    };
    let config = resolve(overrides, dir.path()).expect("resolve");
    assert_eq!(config.cache_file_path(), dir.path().join(".custom-cache"));
}
