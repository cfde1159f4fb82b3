//! Bootstrap replay filter.
//!
//! Each server factory owns one filter; every accepted bootstrap's
//! fingerprint (its salt) is remembered for the replay TTL and a repeat
//! within that window is rejected. Insertion is concurrency-safe, since
//! all of a factory's connections share the filter.

use std::{
    collections::{HashSet, VecDeque},
    sync::Mutex,
    time::{SystemTime, UNIX_EPOCH},
};

use crate::{
    error::{BadDataReceived, Error},
    specification::{BOOTSTRAP_SALT_LENGTH, REPLAY_TTL_SECS},
};

pub(crate) fn unix_seconds() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("SystemTime before UNIX EPOCH")
        .as_secs()
}

#[derive(Debug)]
pub(crate) struct ReplayFilter(Mutex<Inner>);

#[derive(Debug)]
struct Inner {
    fingerprints: HashSet<[u8; BOOTSTRAP_SALT_LENGTH]>,
    oldest: VecDeque<(u64, [u8; BOOTSTRAP_SALT_LENGTH])>,
    ttl: u64,
}

impl ReplayFilter {
    pub(crate) fn with_capacity(capacity: usize) -> Self {
        ReplayFilter(Mutex::new(Inner {
            fingerprints: HashSet::with_capacity(capacity),
            oldest: VecDeque::with_capacity(capacity),
            ttl: REPLAY_TTL_SECS,
        }))
    }

    #[cfg(test)]
    fn with_capacity_and_ttl(capacity: usize, ttl: u64) -> Self {
        let filter = Self::with_capacity(capacity);
        filter.0.lock().unwrap().ttl = ttl;
        filter
    }

    /// Insert a fingerprint, expiring entries older than the TTL.
    /// Returns `Ok(())` if the fingerprint was not present (i.e. accepted).
    pub(crate) fn check_or_insert(
        &self,
        fingerprint: [u8; BOOTSTRAP_SALT_LENGTH],
        now: u64,
    ) -> Result<(), Error> {
        let mut inner = self.0.lock().unwrap();

        while let Some(&(stamp, oldest)) = inner.oldest.front() {
            if now.saturating_sub(stamp) <= inner.ttl {
                break;
            }
            inner.fingerprints.remove(&oldest);
            inner.oldest.pop_front();
        }

        if inner.fingerprints.contains(&fingerprint) {
            return Err(BadDataReceived::ReusedFingerprint.into());
        }

        inner.fingerprints.insert(fingerprint);
        inner.oldest.push_back((now, fingerprint));
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_replay_within_ttl_rejected() {
        let filter = ReplayFilter::with_capacity(16);
        let now = unix_seconds();
        let fingerprint = [1u8; BOOTSTRAP_SALT_LENGTH];

        assert!(filter.check_or_insert(fingerprint, now).is_ok());
        assert!(filter.check_or_insert(fingerprint, now).is_err());
        assert!(filter.check_or_insert(fingerprint, now + 1).is_err());
    }

    #[test]
    fn test_expired_entries_are_forgotten() {
        let filter = ReplayFilter::with_capacity_and_ttl(16, 10);
        let t0 = 1000;

        assert!(filter.check_or_insert([0u8; 32], t0).is_ok());
        assert!(filter.check_or_insert([1u8; 32], t0 + 5).is_ok());

        // Past the TTL the first fingerprint ages out and is accepted anew.
        assert!(filter.check_or_insert([0u8; 32], t0 + 11).is_ok());

        // The second is still within its window.
        assert!(filter.check_or_insert([1u8; 32], t0 + 11).is_err());
    }

    #[test]
    fn test_distinct_fingerprints_accepted() {
        let filter = ReplayFilter::with_capacity(16);
        let now = unix_seconds();
        for i in 0u8..16 {
            assert!(filter.check_or_insert([i; BOOTSTRAP_SALT_LENGTH], now).is_ok());
        }
    }
}
