//! First-seen / last-seen timestamps per remote IP address.
//!
//! Entries are replaced as whole tuples, never mutated in place, so readers
//! racing with [`IpTimeCache::expire`] see either a consistent pair or
//! nothing at all. A reader that loses the race treats the address as seen
//! for the first time, which is harmless.

use std::net::Ipv4Addr;
use std::time::{SystemTime, UNIX_EPOCH};

use dashmap::DashMap;

#[derive(Debug, Default)]
pub struct IpTimeCache {
    entries: DashMap<u32, (u64, u64)>,
    /// Seconds after the last touch at which an entry expires; `None`
    /// disables expiry.
    retention: Option<i64>,
}

pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

impl IpTimeCache {
    pub fn new(retention: Option<i64>) -> Self {
        Self {
            entries: DashMap::new(),
            retention,
        }
    }

    /// Records a connection from `ip` at `now` and returns how long ago the
    /// first and previous connections were. First sight is `(0, None)`.
    pub fn touch(&self, ip: Ipv4Addr, now: u64) -> (u64, Option<u64>) {
        let key = u32::from(ip);
        let Some(&(first, last)) = self.entries.get(&key).as_deref() else {
            self.entries.insert(key, (now, now));
            return (0, None);
        };
        self.entries.insert(key, (first, now));

        (
            now.saturating_sub(first),
            Some(now.saturating_sub(last)),
        )
    }

    /// Drops entries whose last touch is older than the retention.
    pub fn expire(&self, now: u64) {
        let Some(retention) = self.retention else {
            return;
        };
        let cutoff = now.saturating_sub(retention.max(0) as u64);
        self.entries.retain(|_, (_, last)| *last >= cutoff);
    }

    pub fn clear(&self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(s: &str) -> Ipv4Addr {
        s.parse().unwrap()
    }

    #[test]
    fn first_sight_is_zero_and_none() {
        let cache = IpTimeCache::new(None);

        assert_eq!(cache.touch(ip("10.0.0.1"), 1000), (0, None));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn later_touches_report_both_gaps() {
        let cache = IpTimeCache::new(None);
        cache.touch(ip("10.0.0.1"), 1000);

        assert_eq!(cache.touch(ip("10.0.0.1"), 1010), (10, Some(10)));
        assert_eq!(cache.touch(ip("10.0.0.1"), 1017), (17, Some(7)));
    }

    #[test]
    fn addresses_are_independent() {
        let cache = IpTimeCache::new(None);
        cache.touch(ip("10.0.0.1"), 1000);

        assert_eq!(cache.touch(ip("10.0.0.2"), 1005), (0, None));
    }

    #[test]
    fn expiry_removes_only_stale_entries() {
        let cache = IpTimeCache::new(Some(60));
        cache.touch(ip("10.0.0.1"), 1000);
        cache.touch(ip("10.0.0.2"), 1050);

        cache.expire(1070);
        assert_eq!(cache.len(), 1);
        // The survivor still remembers its first-seen time.
        assert_eq!(cache.touch(ip("10.0.0.2"), 1080), (30, Some(30)));
        // The expired address counts as brand new.
        assert_eq!(cache.touch(ip("10.0.0.1"), 1080), (0, None));
    }

    #[test]
    fn expiry_is_a_no_op_without_retention() {
        let cache = IpTimeCache::new(None);
        cache.touch(ip("10.0.0.1"), 0);

        cache.expire(u64::MAX);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn clear_empties_everything() {
        let cache = IpTimeCache::new(Some(60));
        cache.touch(ip("10.0.0.1"), 1000);

        cache.clear();
        assert!(cache.is_empty());
    }
}
