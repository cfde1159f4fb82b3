//! Cover-traffic policy: burst breaking and heartbeats.
//!
//! Both behaviors draw their byte counts from Poisson distributions whose
//! means derive from the session seed, so all connections of one server
//! share a cover *profile*. The per-event randomness (burst coin, heartbeat
//! interval, individual draws) is local: synchronized cover cadence between
//! the two peers would itself be a classifier feature.

use std::time::Duration;

use rand::{
    rngs::{OsRng, StdRng},
    Rng, SeedableRng, TryRngCore,
};
use rand_distr::{Distribution, Poisson};

use crate::drbg::{HashDrbg, Seed};

const MIN_BREAK_AFTER_BYTES: usize = 1500;
const RAND_BREAK_AFTER_BYTES: usize = 20 * 1500;
const MIN_NUM_DUMMY_BYTES: usize = 100;
const RAND_NUM_DUMMY_BYTES: usize = 10_000;

/// Bounds, in seconds, of the interval between two heartbeats.
const MIN_HEARTBEAT_INTERVAL_SECS: u64 = 5;
const MAX_HEARTBEAT_INTERVAL_SECS: u64 = 60 * 5;

/// A heartbeat starts with probability `1 / HEARTBEAT_DENOMINATOR`.
const HEARTBEAT_DENOMINATOR: u64 = 2;

/// Per-connection cover-traffic state.
#[derive(Debug)]
pub(crate) struct CoverPolicy {
    break_after_dist: Poisson<f64>,
    num_dummy_dist: Poisson<f64>,
    rng: StdRng,
    break_after: usize,
    bytes_rcvd: usize,
    heartbeat_interval: Option<Duration>,
}

impl CoverPolicy {
    pub(crate) fn new(seed: &Seed) -> Self {
        let mut drbg = HashDrbg::new(seed);
        let break_mean =
            (MIN_BREAK_AFTER_BYTES + drbg.random_range(0..RAND_BREAK_AFTER_BYTES)) as f64;
        let dummy_mean =
            (MIN_NUM_DUMMY_BYTES + drbg.random_range(0..RAND_NUM_DUMMY_BYTES)) as f64;

        let mut sample_seed = [0u8; 32];
        OsRng
            .try_fill_bytes(&mut sample_seed)
            .expect("system random source failure");
        let mut rng = StdRng::from_seed(sample_seed);

        let heartbeat_interval = if rng.random_range(0..HEARTBEAT_DENOMINATOR) == 0 {
            let secs = rng
                .random_range(0..=MAX_HEARTBEAT_INTERVAL_SECS)
                .max(MIN_HEARTBEAT_INTERVAL_SECS);
            Some(Duration::from_secs(secs))
        } else {
            None
        };
        tracing::debug!(break_mean, dummy_mean, ?heartbeat_interval, "cover policy");

        let break_after_dist =
            Poisson::new(break_mean).expect("break mean is positive and finite");
        let num_dummy_dist =
            Poisson::new(dummy_mean).expect("dummy mean is positive and finite");
        let break_after = break_after_dist.sample(&mut rng) as usize;

        Self {
            break_after_dist,
            num_dummy_dist,
            rng,
            break_after,
            bytes_rcvd: 0,
            heartbeat_interval,
        }
    }

    /// Count bytes received from the peer.
    pub(crate) fn record_received(&mut self, n: usize) {
        self.bytes_rcvd += n;
    }

    /// Whether the current burst of incoming traffic should be broken with
    /// dummy bytes.
    pub(crate) fn should_break_burst(&self) -> bool {
        self.bytes_rcvd > self.break_after
    }

    /// Resample the threshold and restart the byte count after a break.
    pub(crate) fn reset_burst(&mut self) {
        self.break_after = self.break_after_dist.sample(&mut self.rng) as usize;
        self.bytes_rcvd = 0;
        tracing::debug!(
            break_after = self.break_after,
            "dummy traffic again after this many incoming bytes"
        );
    }

    /// How many dummy bytes the next injection should carry.
    pub(crate) fn next_dummy_len(&mut self) -> usize {
        self.num_dummy_dist.sample(&mut self.rng) as usize
    }

    /// The heartbeat interval, when this connection won the heartbeat coin
    /// toss at setup.
    pub(crate) fn heartbeat_interval(&self) -> Option<Duration> {
        self.heartbeat_interval
    }

    /// Stop the heartbeat; used when an underlying write fails.
    pub(crate) fn stop_heartbeat(&mut self) {
        self.heartbeat_interval = None;
    }

    #[cfg(test)]
    pub(crate) fn force_heartbeat(&mut self, interval: Duration) {
        self.heartbeat_interval = Some(interval);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::drbg::SEED_LENGTH;

    #[test]
    fn test_burst_break_threshold() {
        let mut policy = CoverPolicy::new(&Seed::from([1u8; SEED_LENGTH]));
        assert!(!policy.should_break_burst());

        // The threshold is Poisson around a mean below ~31.5 KB; well past
        // that the burst must break.
        policy.record_received(64 * 1500);
        assert!(policy.should_break_burst());

        policy.reset_burst();
        assert!(!policy.should_break_burst());
    }

    #[test]
    fn test_dummy_lengths_are_positive_and_bounded() {
        let mut policy = CoverPolicy::new(&Seed::from([2u8; SEED_LENGTH]));
        for _ in 0..256 {
            let n = policy.next_dummy_len();
            // Poisson concentrates near its mean, which is < 10100.
            assert!(n > 0 && n < 20_000, "dummy len {}", n);
        }
    }

    #[test]
    fn test_heartbeat_interval_bounds() {
        // The coin is local randomness; construct until one wins.
        for tag in 0u8..32 {
            let policy = CoverPolicy::new(&Seed::from([tag; SEED_LENGTH]));
            if let Some(interval) = policy.heartbeat_interval() {
                assert!(interval.as_secs() >= MIN_HEARTBEAT_INTERVAL_SECS);
                assert!(interval.as_secs() <= MAX_HEARTBEAT_INTERVAL_SECS);
                return;
            }
        }
        panic!("no heartbeat in 32 coin tosses");
    }

    #[test]
    fn test_stop_heartbeat() {
        let mut policy = CoverPolicy::new(&Seed::from([3u8; SEED_LENGTH]));
        policy.force_heartbeat(Duration::from_secs(5));
        assert!(policy.heartbeat_interval().is_some());
        policy.stop_heartbeat();
        assert!(policy.heartbeat_interval().is_none());
    }
}
