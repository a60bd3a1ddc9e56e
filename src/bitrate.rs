//! Bitrate representation and live estimation
//!
//! The engine evaluates the input bitrate from several sources with different
//! levels of trust: an explicit command line override beats a value reported
//! by the input plugin, which beats continuous PCR analysis, with DTS analysis
//! from video PIDs as a last resort. The analyzers below implement the PCR and
//! DTS paths: they watch the stream and derive the transport rate from the
//! distance, in packets, between successive clock samples of the same PID.

use std::collections::HashMap;
use std::fmt;

use crate::ts::{Pid, TsPacket, PKT_SIZE_BITS, SYSTEM_CLOCK_FREQ, SYSTEM_CLOCK_SUBFREQ};

/// A transport bitrate in bits per second.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Hash)]
pub struct BitRate(pub u64);

impl BitRate {
    pub const ZERO: BitRate = BitRate(0);

    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for BitRate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} b/s", self.0)
    }
}

impl From<u64> for BitRate {
    fn from(v: u64) -> Self {
        BitRate(v)
    }
}

/// Trust level of a bitrate value. Higher levels override lower ones when a
/// value propagates through the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum BitRateConfidence {
    /// Single evaluation or plugin guess
    #[default]
    Low,
    /// Continuously re-evaluated from clock references
    PcrContinuous,
    /// Explicit user override
    Override,
}

/// Transmission time of `packets` packets at `bitrate`, in PCR units (27 MHz).
pub fn packets_to_pcr(bitrate: BitRate, packets: u64) -> u64 {
    if bitrate.is_zero() {
        0
    } else {
        ((packets as u128 * PKT_SIZE_BITS as u128 * SYSTEM_CLOCK_FREQ as u128) / bitrate.0 as u128)
            as u64
    }
}

/// Transmission time of `packets` packets at `bitrate`, in PTS/DTS units (90 kHz).
pub fn packets_to_pts(bitrate: BitRate, packets: u64) -> u64 {
    if bitrate.is_zero() {
        0
    } else {
        ((packets as u128 * PKT_SIZE_BITS as u128 * SYSTEM_CLOCK_SUBFREQ as u128)
            / bitrate.0 as u128) as u64
    }
}

/// Number of packets transmitted at `bitrate` during `pcr_units` of 27 MHz clock.
pub fn pcr_to_packets(bitrate: BitRate, pcr_units: u64) -> u64 {
    ((pcr_units as u128 * bitrate.0 as u128)
        / (PKT_SIZE_BITS as u128 * SYSTEM_CLOCK_FREQ as u128)) as u64
}

/// Per-PID state of a clock analyzer.
#[derive(Debug, Default, Clone)]
struct PidClock {
    first_value: u64,
    first_packet: u64,
    last_value: u64,
    last_packet: u64,
    sample_count: u64,
}

/// Bitrate analyzer based on clock samples (PCR at 27 MHz or DTS at 90 kHz).
///
/// Validity requires at least `min_pids` PIDs carrying clocks and `min_samples`
/// samples overall. The bitrate is averaged over all clock-bearing PIDs from
/// the distance between each PID's first and last sample.
#[derive(Debug)]
pub struct ClockAnalyzer {
    /// Clock frequency of the analyzed samples in Hz
    freq: u64,
    min_pids: usize,
    min_samples: u64,
    packet_count: u64,
    samples: u64,
    pids: HashMap<Pid, PidClock>,
}

impl ClockAnalyzer {
    fn new(freq: u64, min_pids: usize, min_samples: u64) -> Self {
        Self {
            freq,
            min_pids,
            min_samples,
            packet_count: 0,
            samples: 0,
            pids: HashMap::new(),
        }
    }

    pub fn reset(&mut self) {
        self.packet_count = 0;
        self.samples = 0;
        self.pids.clear();
    }

    fn feed_value(&mut self, pid: Pid, value: u64) {
        let packet = self.packet_count;
        let clock = self.pids.entry(pid).or_default();
        if clock.sample_count == 0 || value < clock.last_value {
            // First sample, or the clock jumped backwards (wrap or
            // discontinuity): restart this PID.
            clock.first_value = value;
            clock.first_packet = packet;
            clock.sample_count = 0;
        }
        clock.last_value = value;
        clock.last_packet = packet;
        clock.sample_count += 1;
        self.samples += 1;
    }

    fn count_packet(&mut self) {
        self.packet_count += 1;
    }

    /// True when enough samples were collected for a meaningful bitrate.
    pub fn bitrate_is_valid(&self) -> bool {
        self.samples >= self.min_samples
            && self.pids.values().filter(|c| c.sample_count >= 2).count() >= self.min_pids
    }

    /// 188-byte packet bitrate averaged over all clock-bearing PIDs.
    pub fn bitrate(&self) -> BitRate {
        let mut total: u128 = 0;
        let mut count: u128 = 0;
        for clock in self.pids.values() {
            if clock.sample_count >= 2 && clock.last_value > clock.first_value {
                let packets = (clock.last_packet - clock.first_packet) as u128;
                let elapsed = (clock.last_value - clock.first_value) as u128;
                total += (packets * PKT_SIZE_BITS as u128 * self.freq as u128) / elapsed;
                count += 1;
            }
        }
        if count == 0 {
            BitRate::ZERO
        } else {
            BitRate((total / count) as u64)
        }
    }
}

/// PCR-based bitrate analyzer (1 PID, 32 samples before validity).
#[derive(Debug)]
pub struct PcrAnalyzer(ClockAnalyzer);

impl Default for PcrAnalyzer {
    fn default() -> Self {
        Self::new(1, 32)
    }
}

impl PcrAnalyzer {
    pub fn new(min_pids: usize, min_samples: u64) -> Self {
        Self(ClockAnalyzer::new(SYSTEM_CLOCK_FREQ, min_pids, min_samples))
    }

    pub fn feed_packet(&mut self, pkt: &TsPacket) {
        if let Some(pcr) = pkt.pcr() {
            self.0.feed_value(pkt.pid(), pcr);
        }
        self.0.count_packet();
    }

    pub fn reset(&mut self) {
        self.0.reset();
    }

    pub fn bitrate_is_valid(&self) -> bool {
        self.0.bitrate_is_valid()
    }

    pub fn bitrate(&self) -> BitRate {
        self.0.bitrate()
    }
}

/// DTS-based bitrate analyzer, the fallback when the stream carries no PCR
/// (1 PID, 32 samples before validity).
#[derive(Debug)]
pub struct DtsAnalyzer(ClockAnalyzer);

impl Default for DtsAnalyzer {
    fn default() -> Self {
        Self::new(1, 32)
    }
}

impl DtsAnalyzer {
    pub fn new(min_pids: usize, min_samples: u64) -> Self {
        Self(ClockAnalyzer::new(SYSTEM_CLOCK_SUBFREQ, min_pids, min_samples))
    }

    pub fn feed_packet(&mut self, pkt: &TsPacket) {
        if let Some(dts) = pkt.dts().or_else(|| pkt.pts()) {
            self.0.feed_value(pkt.pid(), dts);
        }
        self.0.count_packet();
    }

    pub fn reset(&mut self) {
        self.0.reset();
    }

    pub fn bitrate_is_valid(&self) -> bool {
        self.0.bitrate_is_valid()
    }

    pub fn bitrate(&self) -> BitRate {
        self.0.bitrate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ts::NULL_PACKET;

    fn pcr_packet(pid: Pid, pcr: u64) -> TsPacket {
        let mut pkt = NULL_PACKET;
        pkt.set_pid(pid);
        pkt.b[3] = 0x30;
        pkt.b[4] = 7;
        pkt.b[5] = 0x10;
        pkt.set_pcr(pcr);
        pkt
    }

    #[test]
    fn test_confidence_ordering() {
        assert!(BitRateConfidence::Override > BitRateConfidence::PcrContinuous);
        assert!(BitRateConfidence::PcrContinuous > BitRateConfidence::Low);
    }

    #[test]
    fn test_pcr_analyzer_bitrate() {
        // One PCR every 100 packets, spaced so that the true rate is 10 Mb/s:
        // 100 packets = 150400 bits, at 10 Mb/s that is 15.04 ms = 406080 PCR units.
        let mut analyzer = PcrAnalyzer::new(1, 32);
        let mut pcr = 0u64;
        for _ in 0..40 {
            analyzer.feed_packet(&pcr_packet(0x100, pcr));
            for _ in 0..99 {
                analyzer.feed_packet(&NULL_PACKET);
            }
            pcr += 406_080;
        }
        assert!(analyzer.bitrate_is_valid());
        let rate = analyzer.bitrate().0;
        assert!((9_990_000..=10_010_000).contains(&rate), "got {rate}");
    }

    #[test]
    fn test_pcr_analyzer_needs_samples() {
        let mut analyzer = PcrAnalyzer::new(1, 32);
        for i in 0..10 {
            analyzer.feed_packet(&pcr_packet(0x100, i * 300_000));
        }
        assert!(!analyzer.bitrate_is_valid());
    }

    #[test]
    fn test_packet_pcr_math() {
        // 10 Mb/s: one packet takes 1504 bits -> 150.4 us -> 4060.8 PCR units.
        assert_eq!(packets_to_pcr(BitRate(10_000_000), 10_000), 40_608_000);
        assert_eq!(pcr_to_packets(BitRate(10_000_000), 40_608_000), 10_000);
    }
}
