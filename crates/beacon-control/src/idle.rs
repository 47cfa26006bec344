use chrono::{DateTime, Utc};

/// Tracks how long the server has continuously reported zero participants.
///
/// Only fed while the server is running; the controller calls [`IdleTracker::reset`]
/// on every transition out of `Running`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IdleTracker {
    idle_since: Option<DateTime<Utc>>,
}

impl IdleTracker {
    /// Feeds one tick's sample. `None` means the stats query failed; unknown
    /// never counts as idle.
    pub fn observe(&mut self, participants: Option<u32>, now: DateTime<Utc>) {
        match participants {
            Some(0) => {
                if self.idle_since.is_none() {
                    self.idle_since = Some(now);
                }
            }
            Some(_) | None => self.idle_since = None,
        }
    }

    pub fn reset(&mut self) {
        self.idle_since = None;
    }

    pub fn idle_since(&self) -> Option<DateTime<Utc>> {
        self.idle_since
    }

    pub fn elapsed(&self, now: DateTime<Utc>) -> chrono::Duration {
        self.idle_since
            .map(|since| (now - since).max(chrono::Duration::zero()))
            .unwrap_or_else(chrono::Duration::zero)
    }

    pub fn timed_out(&self, now: DateTime<Utc>, timeout: std::time::Duration) -> bool {
        if self.idle_since.is_none() {
            return false;
        }
        let timeout = chrono::Duration::from_std(timeout).unwrap_or(chrono::Duration::MAX);
        self.elapsed(now) >= timeout
    }
}

/// Minutes left before auto-shutdown, given whole minutes already idle.
pub fn minutes_until_shutdown(timeout_minutes: u32, idle_minutes: i64) -> i64 {
    (i64::from(timeout_minutes) - idle_minutes).max(0)
}
