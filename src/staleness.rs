use std::time::{Duration, SystemTime};

use serde::Serialize;

/// Liveness of a session relative to the configured thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    /// Marker touched within `stale_timeout`
    Active,
    /// Idle past `stale_timeout` but not `forget_timeout`
    Stale,
    /// Idle past `forget_timeout`; never revived
    Forgotten,
}

/// Classifier verdict for one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Classification {
    pub state: SessionState,
    pub idle: Duration,
    pub should_revive: bool,
}

/// Idle time, saturating at zero for markers stamped in the future.
pub fn idle_since(last_activity: SystemTime, now: SystemTime) -> Duration {
    now.duration_since(last_activity).unwrap_or(Duration::ZERO)
}

/// Decide whether a session is active, stale, or forgotten.
///
/// `forgotten` is checked first, so a session idle past both thresholds is
/// forgotten. An undefined work count (plain markers) counts as having work.
pub fn classify(
    last_activity: SystemTime,
    active_work_count: Option<usize>,
    stale_timeout: Duration,
    forget_timeout: Duration,
    now: SystemTime,
) -> Classification {
    let idle = idle_since(last_activity, now);

    let state = if idle > forget_timeout {
        SessionState::Forgotten
    } else if idle > stale_timeout {
        SessionState::Stale
    } else {
        SessionState::Active
    };

    let has_work = active_work_count.map(|n| n > 0).unwrap_or(true);

    Classification {
        state,
        idle,
        should_revive: state == SessionState::Stale && has_work,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const STALE: Duration = Duration::from_secs(150);
    const FORGET: Duration = Duration::from_secs(600);

    fn at(idle_secs: u64, work: Option<usize>) -> Classification {
        let now = SystemTime::now();
        classify(
            now - Duration::from_secs(idle_secs),
            work,
            STALE,
            FORGET,
            now,
        )
    }

    #[test]
    fn test_forgotten_is_never_revived() {
        for work in [None, Some(0), Some(1), Some(50)] {
            let c = at(700, work);
            assert_eq!(c.state, SessionState::Forgotten);
            assert!(!c.should_revive);
        }
    }

    #[test]
    fn test_within_stale_timeout_is_active() {
        for idle in [0, 1, 149, 150] {
            let c = at(idle, Some(3));
            assert_eq!(c.state, SessionState::Active, "idle={idle}");
            assert!(!c.should_revive);
        }
    }

    #[test]
    fn test_stale_with_open_work_revives() {
        let c = at(200, Some(2));
        assert_eq!(c.state, SessionState::Stale);
        assert!(c.should_revive);

        // Upper bound is inclusive.
        assert!(at(600, Some(1)).should_revive);
    }

    #[test]
    fn test_stale_without_open_work_is_left_alone() {
        let c = at(200, Some(0));
        assert_eq!(c.state, SessionState::Stale);
        assert!(!c.should_revive);
    }

    #[test]
    fn test_unknown_work_count_counts_as_work() {
        assert!(at(200, None).should_revive);
    }

    #[test]
    fn test_future_mtime_is_active() {
        let now = SystemTime::now();
        let c = classify(now + Duration::from_secs(30), Some(1), STALE, FORGET, now);
        assert_eq!(c.idle, Duration::ZERO);
        assert_eq!(c.state, SessionState::Active);
    }
}
