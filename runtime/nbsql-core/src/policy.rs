use std::time::Duration;

use serde::Serialize;

use nbsql_db::{ConnectionProfile, SafetyProfile};

/// The policy one execution runs under: a connection's own read-only flag
/// merged with the session's safety profile, stricter side winning.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct EffectivePolicy {
    pub read_only: bool,
    /// Row cap for unlimited reads.
    pub row_limit: Option<u32>,
    pub timeout: Option<Duration>,
}

impl EffectivePolicy {
    pub fn resolve(
        connection: &ConnectionProfile,
        safety: Option<&SafetyProfile>,
        requested_timeout: Option<Duration>,
        default_timeout: Option<Duration>,
    ) -> Self {
        let read_only = connection.read_only || safety.is_some_and(|s| s.read_only);
        let row_limit = safety
            .map(|s| s.auto_limit_select_results)
            .filter(|limit| *limit > 0);
        let timeout = [
            safety.and_then(SafetyProfile::statement_timeout),
            requested_timeout.filter(|t| !t.is_zero()),
            default_timeout.filter(|t| !t.is_zero()),
        ]
        .into_iter()
        .flatten()
        .min();
        Self {
            read_only,
            row_limit,
            timeout,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn safety(read_only: bool, limit: u32, timeout_ms: Option<u64>) -> SafetyProfile {
        let mut profile = SafetyProfile::new("s", "S");
        profile.read_only = read_only;
        profile.auto_limit_select_results = limit;
        profile.statement_timeout_ms = timeout_ms;
        profile
    }

    #[test]
    fn stricter_read_only_wins() {
        let rw = ConnectionProfile::new("c", "h", "d");
        let ro = ConnectionProfile::new("c", "h", "d").read_only(true);
        assert!(EffectivePolicy::resolve(&ro, None, None, None).read_only);
        assert!(EffectivePolicy::resolve(&ro, Some(&safety(false, 0, None)), None, None).read_only);
        assert!(EffectivePolicy::resolve(&rw, Some(&safety(true, 0, None)), None, None).read_only);
        assert!(!EffectivePolicy::resolve(&rw, Some(&safety(false, 0, None)), None, None).read_only);
    }

    #[test]
    fn zero_limit_means_unlimited() {
        let conn = ConnectionProfile::new("c", "h", "d");
        assert_eq!(EffectivePolicy::resolve(&conn, Some(&safety(false, 0, None)), None, None).row_limit, None);
        assert_eq!(
            EffectivePolicy::resolve(&conn, Some(&safety(false, 200, None)), None, None).row_limit,
            Some(200)
        );
    }

    #[test]
    fn shortest_timeout_applies() {
        let conn = ConnectionProfile::new("c", "h", "d");
        let policy = EffectivePolicy::resolve(
            &conn,
            Some(&safety(false, 0, Some(30_000))),
            Some(Duration::from_secs(5)),
            Some(Duration::from_secs(60)),
        );
        assert_eq!(policy.timeout, Some(Duration::from_secs(5)));
        let policy = EffectivePolicy::resolve(&conn, None, Some(Duration::ZERO), None);
        assert_eq!(policy.timeout, None);
    }
}
