//! Cache policy: can the previous build output be served as-is?
//!
//! Decision order:
//! 1. no stored record → rebuild
//! 2. revision tracking on and the query succeeds → serve iff revisions match
//! 3. otherwise → serve iff the record is younger than the cache duration

use std::time::Duration;

use chrono::{DateTime, Utc};
use kiln_core::{CacheRecord, Config};

use crate::{revision, store};

/// Outcome of [`can_serve`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheDecision {
    pub can_serve: bool,
    pub reason: String,
}

impl CacheDecision {
    fn serve(reason: impl Into<String>) -> Self {
        Self { can_serve: true, reason: reason.into() }
    }

    fn rebuild(reason: impl Into<String>) -> Self {
        Self { can_serve: false, reason: reason.into() }
    }
}

/// Current revision as seen by the policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RevisionProbe {
    /// Revision tracking is turned off for this project.
    Disabled,
    /// Tracking is on but the query failed; carries the failure message.
    Unavailable(String),
    Known(String),
}

/// Decide whether the stored build can be served for `config`.
///
/// Never fails: an unreadable record or failed revision query degrades to
/// "rebuild" or to the time-based fallback.
pub async fn can_serve(config: &Config) -> CacheDecision {
    let record = store::read(config);
    if record.is_none() {
        return CacheDecision::rebuild("no prior build record");
    }

    let probe = if config.use_git {
        match revision::current_revision(&config.project_root_full).await {
            Ok(sha) => RevisionProbe::Known(sha),
            Err(err) => RevisionProbe::Unavailable(err.to_string()),
        }
    } else {
        RevisionProbe::Disabled
    };

    let decision = evaluate(record.as_ref(), &probe, Utc::now(), config.cache_duration);
    tracing::info!(
        can_serve = decision.can_serve,
        reason = %decision.reason,
        "cache decision",
    );
    decision
}

/// Pure decision core of [`can_serve`].
pub fn evaluate(
    record: Option<&CacheRecord>,
    probe: &RevisionProbe,
    now: DateTime<Utc>,
    duration: Duration,
) -> CacheDecision {
    let Some(record) = record else {
        return CacheDecision::rebuild("no prior build record");
    };

    match probe {
        RevisionProbe::Known(current) => {
            return match record.commit_sha.as_deref() {
                Some(stored) if stored == current => {
                    CacheDecision::serve(format!("revision unchanged ({})", short(current)))
                }
                Some(stored) => CacheDecision::rebuild(format!(
                    "revision changed ({} -> {})",
                    short(stored),
                    short(current)
                )),
                None => CacheDecision::rebuild("previous build has no recorded revision"),
            };
        }
        RevisionProbe::Unavailable(message) => {
            tracing::warn!(
                error = %message,
                "revision query failed, falling back to build age",
            );
        }
        RevisionProbe::Disabled => {}
    }

    let Some(built_at) = record.built_at_utc() else {
        return CacheDecision::rebuild("stored build timestamp is out of range");
    };
    let elapsed = (now - built_at).to_std().unwrap_or_default();
    if elapsed < duration {
        CacheDecision::serve(format!(
            "built {}s ago, within the {}s window",
            elapsed.as_secs(),
            duration.as_secs()
        ))
    } else {
        CacheDecision::rebuild(format!(
            "built {}s ago, older than the {}s window",
            elapsed.as_secs(),
            duration.as_secs()
        ))
    }
}

fn short(sha: &str) -> &str {
    sha.get(..7).unwrap_or(sha)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    const HOUR: Duration = Duration::from_secs(3600);

    fn record_at(built_at: DateTime<Utc>, sha: Option<&str>) -> CacheRecord {
        CacheRecord::new(built_at, PathBuf::from("/app/build"), sha.map(str::to_string))
    }

    #[test]
    fn missing_record_forces_rebuild() {
        let d = evaluate(None, &RevisionProbe::Disabled, Utc::now(), HOUR);
        assert!(!d.can_serve);
        assert_eq!(d.reason, "no prior build record");
    }

    #[test]
    fn matching_revision_serves_regardless_of_age() {
        let old = Utc::now() - chrono::Duration::days(30);
        let rec = record_at(old, Some("abcdef0123"));
        let d = evaluate(
            Some(&rec),
            &RevisionProbe::Known("abcdef0123".to_string()),
            Utc::now(),
            HOUR,
        );
        assert!(d.can_serve, "{}", d.reason);
    }

    #[test]
    fn different_revision_forces_rebuild_even_when_fresh() {
        let rec = record_at(Utc::now(), Some("aaaaaaaaaa"));
        let d = evaluate(
            Some(&rec),
            &RevisionProbe::Known("bbbbbbbbbb".to_string()),
            Utc::now(),
            HOUR,
        );
        assert!(!d.can_serve);
        assert_eq!(d.reason, "revision changed (aaaaaaa -> bbbbbbb)");
    }

    #[test]
    fn record_without_revision_forces_rebuild_when_revision_known() {
        let rec = record_at(Utc::now(), None);
        let d = evaluate(
            Some(&rec),
            &RevisionProbe::Known("abc".to_string()),
            Utc::now(),
            HOUR,
        );
        assert!(!d.can_serve);
    }

    #[test]
    fn unavailable_revision_falls_back_to_age() {
        let now = Utc::now();
        let fresh = record_at(now - chrono::Duration::minutes(5), Some("abc"));
        let stale = record_at(now - chrono::Duration::minutes(61), Some("abc"));
        let probe = RevisionProbe::Unavailable("not a git repository".to_string());

        assert!(evaluate(Some(&fresh), &probe, now, HOUR).can_serve);
        assert!(!evaluate(Some(&stale), &probe, now, HOUR).can_serve);
    }

    #[test]
    fn disabled_tracking_uses_age_only() {
        let now = Utc::now();
        let rec = record_at(now - chrono::Duration::minutes(59), Some("whatever"));
        assert!(evaluate(Some(&rec), &RevisionProbe::Disabled, now, HOUR).can_serve);
    }

    #[test]
    fn future_timestamp_counts_as_fresh() {
        let now = Utc::now();
        let rec = record_at(now + chrono::Duration::minutes(10), None);
        assert!(evaluate(Some(&rec), &RevisionProbe::Disabled, now, HOUR).can_serve);
    }

    #[test]
    fn out_of_range_timestamp_forces_rebuild() {
        let rec = CacheRecord {
            built_at: i64::MAX,
            commit_sha: None,
            build_dir_name: PathBuf::from("/app/build"),
        };
        assert!(!evaluate(Some(&rec), &RevisionProbe::Disabled, Utc::now(), HOUR).can_serve);
    }
}
