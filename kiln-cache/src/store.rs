//! Cache store: the JSON record describing the last successful build.
//!
//! Persists a [`CacheRecord`] at `<project_root_full>/<cache_file_name>`.
//! Under [`CacheWritePolicy::Overwrite`] writes use the atomic `.tmp` +
//! rename pattern so a reader never sees a partial record.

use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use kiln_core::{CacheRecord, CacheWritePolicy, Config};

use crate::error::{io_err, CacheError};

/// Path to the cache record for `config`: pure, no I/O.
pub fn cache_file_path(config: &Config) -> PathBuf {
    config.cache_file_path()
}

/// Write `record` according to the configured write policy.
///
/// Returns the path written.
pub fn write(record: &CacheRecord, config: &Config) -> Result<PathBuf, CacheError> {
    let path = cache_file_path(config);
    let json = serde_json::to_string_pretty(record)?;
    match config.cache_write_policy {
        CacheWritePolicy::Overwrite => write_atomic(&path, &json)?,
        CacheWritePolicy::FailIfExists => write_new(&path, &json)?,
    }
    tracing::debug!(path = %path.display(), "cache record written");
    Ok(path)
}

/// Read the record, treating a missing or unparsable file as "no cache".
pub fn read(config: &Config) -> Option<CacheRecord> {
    match read_strict(config) {
        Ok(record) => record,
        Err(err) => {
            tracing::warn!(error = %err, "ignoring unreadable cache record");
            None
        }
    }
}

/// Read the record, surfacing I/O and parse errors. `Ok(None)` when missing.
pub fn read_strict(config: &Config) -> Result<Option<CacheRecord>, CacheError> {
    let path = cache_file_path(config);
    let contents = match std::fs::read_to_string(&path) {
        Ok(contents) => contents,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(io_err(&path, err)),
    };
    Ok(Some(serde_json::from_str(&contents)?))
}

fn write_atomic(path: &Path, json: &str) -> Result<(), CacheError> {
    let tmp = tmp_path(path);
    std::fs::write(&tmp, json).map_err(|e| io_err(&tmp, e))?;
    std::fs::rename(&tmp, path).map_err(|e| io_err(path, e))?;
    Ok(())
}

fn write_new(path: &Path, json: &str) -> Result<(), CacheError> {
    let mut file = match std::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
    {
        Ok(file) => file,
        Err(err) if err.kind() == ErrorKind::AlreadyExists => {
            return Err(CacheError::AlreadyExists {
                path: path.to_path_buf(),
            })
        }
        Err(err) => return Err(io_err(path, err)),
    };
    file.write_all(json.as_bytes()).map_err(|e| io_err(path, e))?;
    file.sync_all().map_err(|e| io_err(path, e))?;
    Ok(())
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".tmp");
    path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use kiln_core::{resolve, ConfigOverrides};
    use tempfile::TempDir;

    fn config(dir: &TempDir, policy: CacheWritePolicy) -> Config {
        let overrides = ConfigOverrides {
            cache_write_policy: Some(policy),
            ..ConfigOverrides::new(dir.path())
        };
        resolve(overrides, dir.path()).unwrap()
    }

    fn record(sha: Option<&str>) -> CacheRecord {
        CacheRecord::new(
            Utc::now(),
            PathBuf::from("/srv/app/build"),
            sha.map(str::to_string),
        )
    }

    #[test]
    fn none_when_file_missing() {
        let tmp = TempDir::new().unwrap();
        let config = config(&tmp, CacheWritePolicy::Overwrite);
        assert!(read(&config).is_none());
        assert!(read_strict(&config).unwrap().is_none());
    }

    #[test]
    fn roundtrip_write_read() {
        let tmp = TempDir::new().unwrap();
        let config = config(&tmp, CacheWritePolicy::Overwrite);
        let rec = record(Some("4b825dc642cb6eb9a060e54bf8d69288fbee4904"));

        let path = write(&rec, &config).unwrap();
        assert_eq!(path, tmp.path().join(".kiln-cache-meta"));
        assert_eq!(read(&config), Some(rec));
    }

    #[test]
    fn overwrite_replaces_previous_record() {
        let tmp = TempDir::new().unwrap();
        let config = config(&tmp, CacheWritePolicy::Overwrite);
        write(&record(Some("old")), &config).unwrap();
        write(&record(Some("new")), &config).unwrap();
        let loaded = read(&config).unwrap();
        assert_eq!(loaded.commit_sha.as_deref(), Some("new"));
    }

    #[test]
    fn tmp_file_cleaned_up_after_write() {
        let tmp = TempDir::new().unwrap();
        let config = config(&tmp, CacheWritePolicy::Overwrite);
        let path = write(&record(None), &config).unwrap();
        assert!(
            !tmp_path(&path).exists(),
            "tmp file should be removed after atomic rename"
        );
    }

    #[test]
    fn fail_if_exists_refuses_second_write() {
        let tmp = TempDir::new().unwrap();
        let config = config(&tmp, CacheWritePolicy::FailIfExists);
        write(&record(Some("first")), &config).unwrap();
        let err = write(&record(Some("second")), &config).unwrap_err();
        assert!(matches!(err, CacheError::AlreadyExists { .. }));
        assert_eq!(read(&config).unwrap().commit_sha.as_deref(), Some("first"));
    }

    #[test]
    fn unparsable_record_reads_as_none() {
        let tmp = TempDir::new().unwrap();
        let config = config(&tmp, CacheWritePolicy::Overwrite);
        std::fs::write(cache_file_path(&config), "{ broken").unwrap();
        assert!(read(&config).is_none());
        assert!(matches!(read_strict(&config), Err(CacheError::Json(_))));
    }

    #[test]
    fn file_is_pretty_printed() {
        let tmp = TempDir::new().unwrap();
        let config = config(&tmp, CacheWritePolicy::Overwrite);
        let path = write(&record(None), &config).unwrap();
        let contents = std::fs::read_to_string(path).unwrap();
        assert!(contents.contains("\n  \"builtAt\""), "got {contents}");
    }
}
