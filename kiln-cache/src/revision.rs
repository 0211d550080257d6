//! Source-control revision query (`git rev-parse HEAD`).

use std::path::Path;
use std::process::Stdio;

use tokio::process::Command;

use crate::error::{io_err, CacheError};

/// Full commit hash of `HEAD` for the repository containing `dir`.
pub async fn current_revision(dir: &Path) -> Result<String, CacheError> {
    query(dir, rev_parse_head(dir)).await
}

fn rev_parse_head(dir: &Path) -> Command {
    let mut cmd = Command::new("git");
    cmd.args(["rev-parse", "HEAD"])
        .current_dir(dir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    cmd
}

async fn query(dir: &Path, mut cmd: Command) -> Result<String, CacheError> {
    let output = cmd.output().await.map_err(|e| io_err(dir, e))?;

    if !output.status.success() {
        return Err(CacheError::Revision {
            dir: dir.to_path_buf(),
            message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }

    let sha = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if sha.is_empty() {
        return Err(CacheError::Revision {
            dir: dir.to_path_buf(),
            message: "git printed an empty revision".to_string(),
        });
    }
    Ok(sha)
}

/// Best-effort variant: `None` (logged) when the query fails.
pub async fn current_revision_opt(dir: &Path) -> Option<String> {
    match current_revision(dir).await {
        Ok(sha) => Some(sha),
        Err(err) => {
            tracing::warn!(error = %err, "revision unavailable");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn git_available() -> bool {
        std::process::Command::new("git")
            .arg("--version")
            .output()
            .map(|o| o.status.success())
            .unwrap_or(false)
    }

    #[tokio::test]
    async fn fails_outside_a_repository() {
        if !git_available() {
            return;
        }
        let tmp = TempDir::new().unwrap();
        let mut cmd = rev_parse_head(tmp.path());
        // Keeps git from finding an enclosing repo.
        cmd.env("GIT_CEILING_DIRECTORIES", tmp.path().parent().unwrap());
        let err = query(tmp.path(), cmd).await.unwrap_err();
        assert!(matches!(err, CacheError::Revision { .. }));
    }

    #[tokio::test]
    async fn missing_directory_is_an_io_error() {
        let err = current_revision(Path::new("/definitely/not/a/real/dir"))
            .await
            .unwrap_err();
        assert!(matches!(err, CacheError::Io { .. }));
    }
}
