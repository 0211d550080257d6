//! Cache policy against a real git repository.
//!
//! Skipped when `git` is not on `PATH`.

use std::path::Path;
use std::process::Command;
use std::time::Duration;

use chrono::Utc;
use kiln_cache::{can_serve, revision, store};
use kiln_core::{resolve, CacheRecord, Config, ConfigOverrides};
use tempfile::TempDir;

fn git_available() -> bool {
    Command::new("git")
        .arg("--version")
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

fn git(dir: &Path, args: &[&str]) {
    let status = Command::new("git")
        .args(["-c", "user.name=kiln", "-c", "user.email=kiln@example.com"])
        .args(args)
        .current_dir(dir)
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .status()
        .expect("run git");
    assert!(status.success(), "git {args:?} failed");
}

fn init_repo(dir: &Path) {
    git(dir, &["init", "-q"]);
    git(dir, &["commit", "-q", "--allow-empty", "-m", "initial"]);
}

fn config(dir: &TempDir, use_git: bool) -> Config {
    let overrides = ConfigOverrides {
        use_git: Some(use_git),
        cache_duration: Some(Duration::from_secs(3600)),
        ..ConfigOverrides::new(dir.path())
    };
    resolve(overrides, dir.path()).expect("resolve")
}

async fn record_current_build(config: &Config) {
    let sha = revision::current_revision_opt(&config.project_root_full).await;
    let record = CacheRecord::new(Utc::now(), config.build_dir_full.clone(), sha);
    store::write(&record, config).expect("write record");
}

#[tokio::test]
async fn unchanged_revision_can_serve() {
    if !git_available() {
        return;
    }
    let dir = TempDir::new().unwrap();
    init_repo(dir.path());
    let config = config(&dir, true);

    assert!(!can_serve(&config).await.can_serve, "no record yet");

    record_current_build(&config).await;
    let decision = can_serve(&config).await;
    assert!(decision.can_serve, "{}", decision.reason);
}

#[tokio::test]
async fn new_commit_invalidates_cache() {
    if !git_available() {
        return;
    }
    let dir = TempDir::new().unwrap();
    init_repo(dir.path());
    let config = config(&dir, true);
    record_current_build(&config).await;

    git(dir.path(), &["commit", "-q", "--allow-empty", "-m", "second"]);

    let decision = can_serve(&config).await;
    assert!(!decision.can_serve);
    assert!(decision.reason.starts_with("revision changed"), "{}", decision.reason);
}

#[tokio::test]
async fn tracking_disabled_ignores_new_commits() {
    if !git_available() {
        return;
    }
    let dir = TempDir::new().unwrap();
    init_repo(dir.path());
    let config = config(&dir, false);
    record_current_build(&config).await;

    git(dir.path(), &["commit", "-q", "--allow-empty", "-m", "second"]);

    assert!(can_serve(&config).await.can_serve);
}

#[tokio::test]
async fn corrupt_record_forces_rebuild() {
    let dir = TempDir::new().unwrap();
    let config = config(&dir, false);
    std::fs::write(config.cache_file_path(), "not json at all").unwrap();

    let decision = can_serve(&config).await;
    assert!(!decision.can_serve);
    assert_eq!(decision.reason, "no prior build record");
}
