//! Bitrate-proportional packet insertion control
//!
//! Decides *when* to inject one sub-stream packet into a main stream so that
//! the long-run insertion ratio matches the ratio of the two bitrates. Both
//! bitrates are smoothed by a running average which resets when a new sample
//! diverges too far, and a backlog of waiting sub-stream packets triggers a
//! temporary acceleration of the insertion rate.

use tracing::debug;

use crate::bitrate::BitRate;

/// Default waiting-packet count above which insertion accelerates.
pub const DEFAULT_WAIT_ALERT: usize = 16;

/// Default percentage of bitrate variation that resets the running average.
pub const DEFAULT_BITRATE_RESET_PERCENT: u64 = 10;

/// Running average of successive bitrate samples.
///
/// A new sample differing from the average by more than the reset threshold
/// restarts the average (the stream genuinely changed rate); the caller is
/// told so it can restart its own accounting.
#[derive(Debug)]
pub struct BitRateControl {
    name: &'static str,
    count: u64,
    value0: i64,
    diffs: i64,
    average: u64,
    reset_percent: u64,
}

impl BitRateControl {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            count: 0,
            value0: 0,
            diffs: 0,
            average: 0,
            reset_percent: DEFAULT_BITRATE_RESET_PERCENT,
        }
    }

    pub fn bitrate(&self) -> BitRate {
        BitRate(self.average)
    }

    pub fn set_reset_threshold(&mut self, percent: u64) {
        self.reset_percent = percent;
    }

    fn diff_percent(&self, rate: u64) -> u64 {
        if self.average == 0 {
            u64::MAX
        } else {
            ((rate as i64 - self.average as i64).unsigned_abs() * 100) / self.average
        }
    }

    /// Submit a sample. Returns false when the average was reset (first
    /// sample, divergent sample or unknown bitrate).
    pub fn set_bitrate(&mut self, rate: BitRate) -> bool {
        if rate.is_zero() {
            if self.average != 0 {
                debug!(name = self.name, was = self.average, "bitrate now unknown");
            }
            self.count = 0;
            self.value0 = 0;
            self.diffs = 0;
            self.average = 0;
            false
        } else if self.count == 0 || self.average == 0 || self.diff_percent(rate.0) > self.reset_percent {
            if rate.0 != self.average {
                debug!(name = self.name, rate = rate.0, was = self.average, "bitrate reset");
            }
            self.count = 1;
            self.value0 = rate.0 as i64;
            self.diffs = 0;
            self.average = rate.0;
            false
        } else {
            self.count += 1;
            self.diffs += rate.0 as i64 - self.value0;
            let new_average = self.value0 + self.diffs / self.count as i64;
            if new_average > 0 {
                self.average = new_average as u64;
            }
            true
        }
    }
}

/// Scheduler for the injection of sub-stream packets into a main stream.
pub struct PacketInsertionController {
    main_packets: u64,
    sub_packets: u64,
    wait_alert: usize,
    accel_factor: u64,
    accel_main_packets: u64,
    accel_sub_packets: u64,
    accel_max_wait: usize,
    main_bitrate: BitRateControl,
    sub_bitrate: BitRateControl,
}

impl Default for PacketInsertionController {
    fn default() -> Self {
        Self::new()
    }
}

impl PacketInsertionController {
    pub fn new() -> Self {
        Self {
            main_packets: 0,
            sub_packets: 0,
            wait_alert: DEFAULT_WAIT_ALERT,
            accel_factor: 1,
            accel_main_packets: 0,
            accel_sub_packets: 0,
            accel_max_wait: 0,
            main_bitrate: BitRateControl::new("main stream"),
            sub_bitrate: BitRateControl::new("sub-stream"),
        }
    }

    /// Restart the insertion accounting from the current point.
    pub fn reset(&mut self) {
        self.main_packets = 0;
        self.sub_packets = 0;
        self.accel_factor = 1;
        self.accel_main_packets = 0;
        self.accel_sub_packets = 0;
        self.accel_max_wait = 0;
    }

    /// Waiting-packet count above which insertion accelerates (0 disables).
    pub fn set_wait_alert(&mut self, count: usize) {
        self.wait_alert = count;
    }

    /// Reset threshold, in percent, for both bitrate averages.
    pub fn set_bitrate_reset_threshold(&mut self, percent: u64) {
        self.main_bitrate.set_reset_threshold(percent);
        self.sub_bitrate.set_reset_threshold(percent);
    }

    /// Submit a main-stream bitrate sample.
    pub fn set_main_bitrate(&mut self, rate: BitRate) {
        if !self.main_bitrate.set_bitrate(rate) {
            self.reset();
        }
    }

    /// Submit a sub-stream bitrate sample.
    pub fn set_sub_bitrate(&mut self, rate: BitRate) {
        if !self.sub_bitrate.set_bitrate(rate) {
            self.reset();
        }
    }

    pub fn main_bitrate(&self) -> BitRate {
        self.main_bitrate.bitrate()
    }

    pub fn sub_bitrate(&self) -> BitRate {
        self.sub_bitrate.bitrate()
    }

    /// Declare one main-stream packet seen.
    pub fn count_main_packets(&mut self, count: u64) {
        self.main_packets += count;
    }

    /// Declare one sub-stream packet inserted.
    pub fn count_sub_packets(&mut self, count: u64) {
        self.sub_packets += count;
    }

    /// Decide whether one sub-stream packet shall be inserted now, given the
    /// number of sub-stream packets currently waiting.
    pub fn must_insert(&mut self, waiting_packets: usize) -> bool {
        let main_rate = self.main_bitrate.bitrate().0;
        let sub_rate = self.sub_bitrate.bitrate().0;

        if main_rate == 0 || sub_rate == 0 {
            // Unknown bitrate: always insert.
            return true;
        }
        if self.main_packets as u128 * sub_rate as u128
            >= self.sub_packets as u128 * main_rate as u128
        {
            // It is time to insert in all cases.
            return true;
        }
        if self.wait_alert == 0 || waiting_packets < self.wait_alert {
            // No backlog pressure; leave any acceleration phase.
            if self.accel_factor > 1 {
                self.accel_factor = 1;
                self.accel_max_wait = 0;
                debug!(sub_bitrate = sub_rate, "waiting packets back to normal");
            }
            return false;
        }

        // Acceleration phase: too many waiting packets.
        if self.accel_factor == 1 || waiting_packets > self.accel_max_wait {
            // Entering the phase, or the backlog grew past its previous
            // high-water mark: accelerate more. The highest factor is kept
            // until the backlog drains below the alert threshold.
            self.accel_factor += 1;
            self.accel_main_packets = self.main_packets;
            self.accel_sub_packets = self.sub_packets;
            self.accel_max_wait = waiting_packets;
            debug!(
                waiting_packets,
                factor = self.accel_factor,
                "accelerating sub-stream insertion"
            );
        }

        // Same criteria with the accelerated sub-bitrate over this phase.
        (self.main_packets - self.accel_main_packets) as u128
            * self.accel_factor as u128
            * sub_rate as u128
            >= (self.sub_packets - self.accel_sub_packets) as u128 * main_rate as u128
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_bitrate_always_inserts() {
        let mut ctl = PacketInsertionController::new();
        assert!(ctl.must_insert(0));
        ctl.set_main_bitrate(BitRate(10_000_000));
        // Sub bitrate still unknown.
        assert!(ctl.must_insert(0));
    }

    #[test]
    fn test_fairness_ratio() {
        // Main 10 Mb/s, sub 1 Mb/s: over 100 000 main packets the controller
        // must authorize 10 000 insertions, within the reset threshold.
        let mut ctl = PacketInsertionController::new();
        ctl.set_main_bitrate(BitRate(10_000_000));
        ctl.set_sub_bitrate(BitRate(1_000_000));

        let mut inserted = 0u64;
        for _ in 0..100_000u64 {
            ctl.count_main_packets(1);
            if ctl.must_insert(1) {
                ctl.count_sub_packets(1);
                inserted += 1;
            }
        }
        assert!(
            (9_950..=10_050).contains(&inserted),
            "inserted {inserted} packets"
        );
    }

    #[test]
    fn test_average_absorbs_small_variation() {
        let mut ctl = BitRateControl::new("test");
        assert!(!ctl.set_bitrate(BitRate(1_000_000))); // first sample resets
        assert!(ctl.set_bitrate(BitRate(1_020_000))); // 2% off, averaged
        let avg = ctl.bitrate().0;
        assert!((1_000_000..=1_020_000).contains(&avg));
    }

    #[test]
    fn test_divergent_sample_resets() {
        let mut ctl = BitRateControl::new("test");
        ctl.set_bitrate(BitRate(1_000_000));
        assert!(ctl.set_bitrate(BitRate(1_010_000)));
        // 50% away: reset.
        assert!(!ctl.set_bitrate(BitRate(1_500_000)));
        assert_eq!(ctl.bitrate(), BitRate(1_500_000));
    }

    #[test]
    fn test_acceleration_doubles_rate_then_recovers() {
        let mut ctl = PacketInsertionController::new();
        ctl.set_main_bitrate(BitRate(10_000_000));
        ctl.set_sub_bitrate(BitRate(1_000_000));

        // Prime the accounting ahead of the target ratio so the nominal rule
        // answers "not yet" while a backlog of 20 packets is waiting.
        ctl.count_main_packets(10);
        ctl.count_sub_packets(5);

        // With 20 packets waiting (alert threshold 16), the factor becomes 2
        // and the insertion rate doubles over the acceleration phase.
        let mut inserted = 0u64;
        for _ in 0..10_000u64 {
            ctl.count_main_packets(1);
            if ctl.must_insert(20) {
                ctl.count_sub_packets(1);
                inserted += 1;
            }
        }
        assert!(
            (1_900..=2_100).contains(&inserted),
            "accelerated phase inserted {inserted}"
        );

        // Queue drained below the threshold: the factor snaps back to 1.
        // Drain the debt accumulated by the acceleration, then measure the
        // nominal 1/10 rate again.
        let mut guard = 0;
        loop {
            ctl.count_main_packets(1);
            if ctl.must_insert(0) {
                break;
            }
            guard += 1;
            assert!(guard < 100_000, "controller never recovered");
        }
        let mut inserted = 0u64;
        for _ in 0..10_000u64 {
            ctl.count_main_packets(1);
            if ctl.must_insert(0) {
                ctl.count_sub_packets(1);
                inserted += 1;
            }
        }
        assert!(
            (900..=1_100).contains(&inserted),
            "recovered phase inserted {inserted}"
        );
    }
}
