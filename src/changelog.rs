//! Versioned change log
//!
//! Bounded history of add/remove diffs used to propagate shop-state deltas
//! to sync consumers. A consumer asks "everything since my last sync point"
//! and gets either one folded commit or `None`, meaning the point fell out
//! of the retention window and a full resync is required.

use chrono::{DateTime, Utc};
use tracing::debug;

/// One immutable history step
#[derive(Debug, Clone)]
pub struct ChangeCommit<T> {
    pub added: Vec<T>,
    pub removed: Vec<T>,
    pub at: DateTime<Utc>,
}

impl<T> ChangeCommit<T> {
    fn empty(at: DateTime<Utc>) -> Self {
        Self {
            added: Vec::new(),
            removed: Vec::new(),
            at,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

/// Bounded, insertion-ordered log of [`ChangeCommit`]s.
///
/// Commits are not guaranteed to be time-ordered (a caller may stamp a
/// commit with a forced timestamp), so eviction and the latest/oldest
/// queries scan for the extreme timestamp instead of trusting position.
pub struct ChangeLog<T> {
    commits: Vec<ChangeCommit<T>>,
    max_size: usize,
    name: &'static str,
}

impl<T: Clone> ChangeLog<T> {
    pub fn new(max_size: usize, name: &'static str) -> Self {
        Self {
            commits: Vec::new(),
            max_size,
            name,
        }
    }

    /// Append a commit. No-op when both diffs are empty. Stamped `at` when
    /// given, otherwise now. Evicts the oldest-stamped commit once over
    /// capacity.
    pub fn add(&mut self, added: Vec<T>, removed: Vec<T>, at: Option<DateTime<Utc>>) {
        if added.is_empty() && removed.is_empty() {
            return;
        }
        let at = at.unwrap_or_else(Utc::now);
        debug!(
            log = self.name,
            added = added.len(),
            removed = removed.len(),
            %at,
            "new change commit"
        );
        self.commits.push(ChangeCommit { added, removed, at });
        if self.commits.len() > self.max_size {
            let mut lowest = 0;
            for i in 1..self.commits.len() {
                if self.commits[i].at < self.commits[lowest].at {
                    lowest = i;
                }
            }
            self.commits.remove(lowest);
        }
    }

    /// Fold every commit stamped at or after `since` into one synthesized
    /// commit, in log order. Returns `None` when `since` predates the
    /// retention window. A missing `since` defaults to the oldest commit's
    /// timestamp.
    pub fn get(&self, since: Option<DateTime<Utc>>) -> Option<ChangeCommit<T>> {
        let since = match since {
            Some(since) => {
                if self.oldest().at > since {
                    return None;
                }
                since
            }
            None => self.oldest().at,
        };
        let mut result = ChangeCommit::empty(since);
        for commit in &self.commits {
            if commit.at >= since {
                result.added.extend(commit.added.iter().cloned());
                result.removed.extend(commit.removed.iter().cloned());
            }
        }
        Some(result)
    }

    /// Whether `get(since)` can produce a partial diff
    pub fn is_available(&self, since: DateTime<Utc>) -> bool {
        since >= self.oldest().at
    }

    /// Newest-stamped commit; an empty log yields an empty commit at the
    /// Unix epoch
    pub fn latest(&self) -> ChangeCommit<T> {
        let mut newest: Option<usize> = None;
        for i in 0..self.commits.len() {
            if newest.map_or(true, |n| self.commits[i].at >= self.commits[n].at) {
                newest = Some(i);
            }
        }
        match newest {
            Some(i) => self.commits[i].clone(),
            None => ChangeCommit::empty(DateTime::<Utc>::UNIX_EPOCH),
        }
    }

    /// Oldest-stamped commit; an empty log yields an empty commit dated
    /// now. The asymmetry with [`latest`](Self::latest) is intentional:
    /// availability checks treat an empty log as having no usable window.
    pub fn oldest(&self) -> ChangeCommit<T> {
        let mut oldest: Option<usize> = None;
        for i in 0..self.commits.len() {
            if oldest.map_or(true, |o| self.commits[i].at <= self.commits[o].at) {
                oldest = Some(i);
            }
        }
        match oldest {
            Some(i) => self.commits[i].clone(),
            None => ChangeCommit::empty(Utc::now()),
        }
    }

    pub fn len(&self) -> usize {
        self.commits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commits.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    #[test]
    fn test_get_folds_commits_since() {
        let mut log: ChangeLog<&str> = ChangeLog::new(10, "test");
        log.add(vec!["a"], vec![], Some(at(1)));
        log.add(vec!["b"], vec!["a"], Some(at(2)));
        log.add(vec!["c"], vec![], Some(at(3)));

        let folded = log.get(Some(at(2))).unwrap();
        assert_eq!(folded.added, vec!["b", "c"]);
        assert_eq!(folded.removed, vec!["a"]);

        // Exactly the oldest timestamp is still available
        let all = log.get(Some(at(1))).unwrap();
        assert_eq!(all.added, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_get_unavailable_before_retention_window() {
        let mut log: ChangeLog<&str> = ChangeLog::new(10, "test");
        log.add(vec!["a"], vec![], Some(at(5)));
        assert!(log.get(Some(at(4))).is_none());
        assert!(!log.is_available(at(4)));
        assert!(log.is_available(at(5)));
    }

    #[test]
    fn test_empty_diffs_are_not_recorded() {
        let mut log: ChangeLog<&str> = ChangeLog::new(10, "test");
        log.add(vec![], vec![], Some(at(1)));
        assert!(log.is_empty());
    }

    #[test]
    fn test_eviction_removes_oldest_timestamp() {
        let mut log: ChangeLog<&str> = ChangeLog::new(2, "test");
        log.add(vec!["a"], vec![], Some(at(1)));
        log.add(vec!["b"], vec![], Some(at(2)));
        log.add(vec!["c"], vec![], Some(at(3)));

        assert_eq!(log.len(), 2);
        assert_eq!(log.oldest().at, at(2));
        assert_eq!(log.latest().at, at(3));

        let folded = log.get(Some(at(2))).unwrap();
        assert_eq!(folded.added, vec!["b", "c"]);

        // t=1 fell out of the window: full resync required
        assert!(log.get(Some(at(1))).is_none());
    }

    #[test]
    fn test_eviction_scans_timestamps_not_insertion_order() {
        let mut log: ChangeLog<&str> = ChangeLog::new(2, "test");
        // Forced timestamps arrive out of order
        log.add(vec!["new"], vec![], Some(at(10)));
        log.add(vec!["old"], vec![], Some(at(1)));
        log.add(vec!["mid"], vec![], Some(at(5)));

        // The t=1 commit must be the one evicted
        assert_eq!(log.oldest().at, at(5));
        assert_eq!(log.latest().at, at(10));
    }

    #[test]
    fn test_empty_log_sentinels_are_asymmetric() {
        let log: ChangeLog<&str> = ChangeLog::new(2, "test");
        let before = Utc::now();

        assert_eq!(log.latest().at, DateTime::<Utc>::UNIX_EPOCH);
        assert!(log.oldest().at >= before);

        // Consequence: nothing is available from an empty log except "now"
        assert!(!log.is_available(at(0)));
    }
}
