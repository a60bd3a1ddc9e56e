//! PCR restamping for merged streams
//!
//! When a sub-stream is inserted into a larger stream, its PCRs were computed
//! for the original multiplex and no longer reflect the packet positions in
//! the outer stream. This module restamps them: each PCR is recomputed from a
//! base PCR of the same PID plus the transmission time of the packets sent
//! since, measured in the outer stream's packet count at the outer bitrate.

use std::collections::HashMap;

use tracing::debug;

use crate::bitrate::{packets_to_pcr, packets_to_pts, BitRate};
use crate::psi::demux::TableDemux;
use crate::psi::tables::Pmt;
use crate::psi::{PID_PAT, TID_PMT};
use crate::ts::{Pid, TsPacket, SYSTEM_CLOCK_FREQ, SYSTEM_CLOCK_SUBFREQ};

/// Restamping state of one PID in the merged stream.
#[derive(Debug, Clone)]
struct PidContext {
    /// PCR base for the anchor mode
    first_pcr: Option<u64>,
    first_pcr_pkt: u64,
    /// Last output PCR, base for the incremental mode
    last_pcr: Option<u64>,
    last_pcr_pkt: u64,
    last_dts: Option<u64>,
    last_dts_pkt: u64,
    last_pts: Option<u64>,
    last_pts_pkt: u64,
    /// PID carrying this PID's PCR. Each PID is its own PCR PID until a PMT
    /// proves otherwise.
    pcr_pid: Pid,
}

impl PidContext {
    fn new(pid: Pid) -> Self {
        Self {
            first_pcr: None,
            first_pcr_pkt: 0,
            last_pcr: None,
            last_pcr_pkt: 0,
            last_dts: None,
            last_dts_pkt: 0,
            last_pts: None,
            last_pts_pkt: 0,
            pcr_pid: pid,
        }
    }

    /// Extrapolated PTS/DTS at `current_pkt`, computed from the last observed
    /// values and the outer bitrate. Returns the earlier of the two.
    fn adjusted_pdts(&self, current_pkt: u64, bitrate: BitRate) -> Option<u64> {
        let extend = |value: Option<u64>, at: u64| {
            value.map(|v| {
                if bitrate.is_zero() {
                    v
                } else {
                    v + packets_to_pts(bitrate, current_pkt.saturating_sub(at))
                }
            })
        };
        match (extend(self.last_dts, self.last_dts_pkt), extend(self.last_pts, self.last_pts_pkt)) {
            (Some(dts), Some(pts)) => Some(dts.min(pts)),
            (Some(dts), None) => Some(dts),
            (None, pts) => pts,
        }
    }
}

/// Restamps PCRs of a stream being merged into an outer stream.
pub struct PcrMerger {
    /// Compute each PCR from the previous output PCR instead of the first one.
    /// Better for VBR, accumulates small errors.
    incremental: bool,
    /// Reset the anchor when a PID's extrapolated PTS/DTS moves behind the
    /// restamped PCR of its PCR PID.
    reset_backwards: bool,
    demux: TableDemux,
    pmt_pids: Vec<Pid>,
    contexts: HashMap<Pid, PidContext>,
}

impl Default for PcrMerger {
    fn default() -> Self {
        Self::new()
    }
}

impl PcrMerger {
    pub fn new() -> Self {
        let mut demux = TableDemux::new();
        demux.add_pid(PID_PAT);
        Self {
            incremental: false,
            reset_backwards: false,
            demux,
            pmt_pids: Vec::new(),
            contexts: HashMap::new(),
        }
    }

    /// Select incremental mode (default is anchor mode).
    pub fn set_incremental(&mut self, on: bool) {
        self.incremental = on;
    }

    pub fn set_reset_backwards(&mut self, on: bool) {
        self.reset_backwards = on;
    }

    /// Forget all collected state.
    pub fn reset(&mut self) {
        self.demux = TableDemux::new();
        self.demux.add_pid(PID_PAT);
        self.pmt_pids.clear();
        self.contexts.clear();
    }

    /// Process one packet of the merged stream about to be inserted in the
    /// outer stream. `main_packet_index` counts packets of the outer stream,
    /// `main_bitrate` is the outer stream's bitrate.
    pub fn process_packet(
        &mut self,
        pkt: &mut TsPacket,
        main_packet_index: u64,
        main_bitrate: BitRate,
    ) {
        self.collect_signalization(pkt);

        let pid = pkt.pid();
        let dts = pkt.dts();
        let pts = pkt.pts();
        let pcr = pkt.pcr();

        let ctx = self
            .contexts
            .entry(pid)
            .or_insert_with(|| PidContext::new(pid));

        // The last DTS and PTS are recorded for all PIDs.
        if let Some(dts) = dts {
            ctx.last_dts = Some(dts);
            ctx.last_dts_pkt = main_packet_index;
        }
        if let Some(pts) = pts {
            ctx.last_pts = Some(pts);
            ctx.last_pts_pkt = main_packet_index;
        }

        let Some(pcr) = pcr else {
            return;
        };

        if ctx.last_pcr.is_none() {
            // First PCR in this PID: keep the raw value as the anchor.
            ctx.first_pcr = Some(pcr);
            ctx.last_pcr = Some(pcr);
            ctx.first_pcr_pkt = main_packet_index;
            ctx.last_pcr_pkt = main_packet_index;
            return;
        }
        if main_bitrate.is_zero() {
            return;
        }

        // Compute the restamped PCR from the base PCR plus the transmission
        // time, in outer-stream packets, since the base.
        let (base_pcr, base_pkt) = if self.incremental {
            (ctx.last_pcr.unwrap(), ctx.last_pcr_pkt)
        } else {
            (ctx.first_pcr.unwrap(), ctx.first_pcr_pkt)
        };
        let restamped =
            base_pcr + packets_to_pcr(main_bitrate, main_packet_index.saturating_sub(base_pkt));
        ctx.last_pcr = Some(restamped);
        ctx.last_pcr_pkt = main_packet_index;

        // With reset-backwards, check every PID clocked by this PCR PID: when
        // its extrapolated PTS/DTS moved behind the restamped PCR, or runs
        // more than one second ahead of it, the restamping has drifted.
        let mut update_pcr = true;
        if self.reset_backwards {
            let subpcr = restamped / crate::ts::SYSTEM_CLOCK_SUBFACTOR;
            for other in self.contexts.values() {
                if other.pcr_pid == pid {
                    if let Some(pdts) = other.adjusted_pdts(main_packet_index, main_bitrate) {
                        if pdts <= subpcr || (pdts - subpcr) > SYSTEM_CLOCK_SUBFREQ {
                            update_pcr = false;
                            break;
                        }
                    }
                }
            }
            if !update_pcr {
                let ctx = self.contexts.get_mut(&pid).unwrap();
                ctx.first_pcr = Some(pcr);
                ctx.last_pcr = Some(pcr);
                ctx.first_pcr_pkt = main_packet_index;
                ctx.last_pcr_pkt = main_packet_index;
                debug!(
                    pid,
                    "resetting PCR restamping after DTS/PTS moved backwards restamped PCR"
                );
                return;
            }
        }

        // A restamped PCR leaping more than one second away from the raw
        // value marks a discontinuity in the original clock: re-anchor on the
        // raw PCR and leave the packet unchanged.
        let moved = restamped as i64 - pcr as i64;
        if moved.unsigned_abs() >= SYSTEM_CLOCK_FREQ {
            let ctx = self.contexts.get_mut(&pid).unwrap();
            ctx.first_pcr = Some(pcr);
            ctx.last_pcr = Some(pcr);
            ctx.first_pcr_pkt = main_packet_index;
            ctx.last_pcr_pkt = main_packet_index;
            debug!(
                pid,
                "resetting PCR restamping after possible discontinuity in original PCR"
            );
        } else {
            pkt.set_pcr(restamped);
        }
    }

    /// Track PMTs to learn which PID carries each component's PCR.
    fn collect_signalization(&mut self, pkt: &TsPacket) {
        let mut new_pmt_pids = Vec::new();
        for table in self.demux.feed_packet(pkt) {
            if table.table_id() == crate::psi::TID_PAT {
                if let Some(pat) = crate::psi::tables::Pat::parse(&table) {
                    for (&_service, &pmt_pid) in &pat.pmts {
                        if !self.pmt_pids.contains(&pmt_pid) {
                            new_pmt_pids.push(pmt_pid);
                        }
                    }
                }
            } else if table.table_id() == TID_PMT {
                if let Some(pmt) = Pmt::parse(&table) {
                    self.handle_pmt(&pmt);
                }
            }
        }
        for pid in new_pmt_pids {
            self.pmt_pids.push(pid);
            self.demux.add_pid(pid);
        }
    }

    fn handle_pmt(&mut self, pmt: &Pmt) {
        if pmt.pcr_pid == crate::ts::PID_NULL {
            return;
        }
        for &component in pmt.streams.keys() {
            self.contexts
                .entry(component)
                .or_insert_with(|| PidContext::new(component))
                .pcr_pid = pmt.pcr_pid;
            debug!(component, pcr_pid = pmt.pcr_pid, "associating PID to PCR PID");
        }
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
    fn test_restamp_preserves_consistent_clock() {
        // PCRs at exact 1-second steps, inserted at outer packet indices
        // matching 1 second of a 10 Mb/s outer stream: the restamped values
        // must stay within one tick of the originals.
        let mut merger = PcrMerger::new();
        let bitrate = BitRate(10_000_000);
        let inputs = [(0u64, 0u64), (6649, 27_000_000), (13_298, 54_000_000)];
        let mut out = Vec::new();
        for &(index, pcr) in &inputs {
            let mut pkt = pcr_packet(0x50, pcr);
            merger.process_packet(&mut pkt, index, bitrate);
            out.push(pkt.pcr().unwrap());
        }
        assert_eq!(out[0], 0);
        // 6649 packets at 10 Mb/s are not exactly one second; allow a few
        // hundred 27 MHz ticks around the ideal step.
        assert!((out[1] as i64 - 27_000_000i64).abs() < 300, "got {}", out[1]);
        assert!((out[2] as i64 - 54_000_000i64).abs() < 600, "got {}", out[2]);
    }

    #[test]
    fn test_discontinuity_resets_anchor() {
        // Third PCR inserted far too late: the leap exceeds one second, the
        // anchor resets and the raw PCR is preserved.
        let mut merger = PcrMerger::new();
        let bitrate = BitRate(10_000_000);
        let mut pkt = pcr_packet(0x50, 0);
        merger.process_packet(&mut pkt, 0, bitrate);
        let mut pkt = pcr_packet(0x50, 27_000_000);
        merger.process_packet(&mut pkt, 6649, bitrate);
        let mut pkt = pcr_packet(0x50, 54_000_000);
        merger.process_packet(&mut pkt, 20_000, bitrate);
        // 20_000 packets at 10 Mb/s is ~81.2 s worth of clock: leap detected.
        assert_eq!(pkt.pcr(), Some(54_000_000));
    }

    #[test]
    fn test_first_pcr_untouched() {
        let mut merger = PcrMerger::new();
        let mut pkt = pcr_packet(0x50, 123_456);
        merger.process_packet(&mut pkt, 77, BitRate(10_000_000));
        assert_eq!(pkt.pcr(), Some(123_456));
    }

    #[test]
    fn test_incremental_mode_tracks_previous() {
        let mut merger = PcrMerger::new();
        merger.set_incremental(true);
        let bitrate = BitRate(10_000_000);
        let mut pkt = pcr_packet(0x50, 0);
        merger.process_packet(&mut pkt, 0, bitrate);
        let mut pkt = pcr_packet(0x50, 27_000_000);
        merger.process_packet(&mut pkt, 6649, bitrate);
        let second = pkt.pcr().unwrap();
        let mut pkt = pcr_packet(0x50, 54_000_000);
        merger.process_packet(&mut pkt, 13_298, bitrate);
        let third = pkt.pcr().unwrap();
        // Each step computed from the previous output value.
        assert_eq!(third - second, second);
    }
}
