//! Section packetization
//!
//! Turns PSI sections back into TS packets on one PID. Two shapes are used by
//! the engine: the cycling packetizer repeats a stable set of tables forever
//! (PAT/CAT/NIT/SDT/BAT), the muxing packetizer drains a queue of one-shot
//! sections packed back to back (EIT).

use std::collections::VecDeque;

use crate::psi::section::Section;
use crate::ts::{Pid, TsPacket, PKT_SIZE, SYNC_BYTE};

/// How unused packet space is handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StuffingPolicy {
    /// Each section ends its packet; the remainder is stuffed with 0xFF.
    /// Produces a stable packet rate for cycled tables.
    Always,
    /// Sections are packed back to back inside packets; stuffing appears only
    /// when there is nothing left to send.
    Packed,
}

/// Shared packet-building state.
struct SectionStream {
    pid: Pid,
    cc: u8,
    policy: StuffingPolicy,
    queue: VecDeque<Section>,
    /// Section currently being emitted, with the offset of the next byte.
    current: Option<(Section, usize)>,
}

impl SectionStream {
    fn new(pid: Pid, policy: StuffingPolicy) -> Self {
        Self {
            pid,
            cc: 0,
            policy,
            queue: VecDeque::new(),
            current: None,
        }
    }

    fn has_pending(&self) -> bool {
        self.current.is_some() || !self.queue.is_empty()
    }

    /// Build the next packet, or return None when nothing is pending.
    fn next_packet(&mut self) -> Option<TsPacket> {
        if !self.has_pending() {
            return None;
        }

        let mut body = [0xFFu8; PKT_SIZE - 4];
        let mut w = 0usize;
        let mut pusi = false;

        // Pending continuation bytes of the current section.
        let cont_rem = self
            .current
            .as_ref()
            .map(|(sec, off)| sec.size() - off)
            .unwrap_or(0);

        // Decide whether a new section starts in this packet. The pointer
        // field is the first payload byte and points past the continuation.
        let start_new = match self.policy {
            StuffingPolicy::Always => cont_rem == 0 && !self.queue.is_empty(),
            StuffingPolicy::Packed => !self.queue.is_empty() && cont_rem + 1 < body.len(),
        };

        if start_new {
            pusi = true;
            body[0] = cont_rem as u8;
            w = 1;
        }

        // Write the continuation.
        let mut continuation_done = false;
        if let Some((sec, off)) = &mut self.current {
            let n = (sec.size() - *off).min(body.len() - w);
            body[w..w + n].copy_from_slice(&sec.as_bytes()[*off..*off + n]);
            *off += n;
            w += n;
            continuation_done = *off >= sec.size();
        }
        if continuation_done {
            self.current = None;
        }

        // Write new sections.
        if start_new {
            loop {
                let Some(sec) = self.queue.pop_front() else { break };
                let n = sec.size().min(body.len() - w);
                body[w..w + n].copy_from_slice(&sec.as_bytes()[..n]);
                w += n;
                if n < sec.size() {
                    self.current = Some((sec, n));
                    break;
                }
                if self.policy == StuffingPolicy::Always || w >= body.len() {
                    break;
                }
            }
        }

        let mut pkt = TsPacket { b: [0; PKT_SIZE] };
        pkt.b[0] = SYNC_BYTE;
        pkt.b[1] = if pusi { 0x40 } else { 0x00 } | ((self.pid >> 8) as u8 & 0x1F);
        pkt.b[2] = (self.pid & 0xFF) as u8;
        pkt.b[3] = 0x10 | self.cc;
        self.cc = (self.cc + 1) & 0x0F;
        pkt.b[4..].copy_from_slice(&body);
        Some(pkt)
    }
}

/// Cycling packetizer: emits a stable set of tables in a loop on one PID.
pub struct CyclingPacketizer {
    stream: SectionStream,
    stored: Vec<Section>,
}

impl CyclingPacketizer {
    pub fn new(pid: Pid, policy: StuffingPolicy) -> Self {
        Self {
            stream: SectionStream::new(pid, policy),
            stored: Vec::new(),
        }
    }

    pub fn pid(&self) -> Pid {
        self.stream.pid
    }

    pub fn reset(&mut self) {
        self.stored.clear();
        self.stream.queue.clear();
        self.stream.current = None;
    }

    /// Add the sections of one table to the cycling set.
    pub fn add_sections(&mut self, sections: Vec<Section>) {
        self.stored.extend(sections);
    }

    /// Remove stored sections by table id, and optionally tid extension.
    /// Sections already scheduled in the current cycle are removed as well.
    pub fn remove_sections(&mut self, tid: u8, tid_ext: Option<u16>) {
        let keep =
            |s: &Section| s.table_id() != tid || tid_ext.is_some_and(|e| s.tid_ext() != e);
        self.stored.retain(keep);
        self.stream.queue.retain(keep);
    }

    /// True when the packetizer holds at least one section.
    pub fn has_content(&self) -> bool {
        !self.stored.is_empty() || self.stream.has_pending()
    }

    /// Replace `pkt` with the next packet of the cycle. Returns false and
    /// leaves `pkt` untouched when no section is stored.
    pub fn get_next_packet(&mut self, pkt: &mut TsPacket) -> bool {
        if !self.stream.has_pending() {
            if self.stored.is_empty() {
                return false;
            }
            // Start the next cycle.
            self.stream.queue.extend(self.stored.iter().cloned());
        }
        match self.stream.next_packet() {
            Some(next) => {
                *pkt = next;
                true
            }
            None => false,
        }
    }
}

/// Muxing packetizer: drains a bounded queue of one-shot sections, packed.
/// Never stuffs as long as the queue is non-empty.
pub struct MuxingPacketizer {
    stream: SectionStream,
}

impl MuxingPacketizer {
    pub fn new(pid: Pid) -> Self {
        Self {
            stream: SectionStream::new(pid, StuffingPolicy::Packed),
        }
    }

    pub fn reset(&mut self) {
        self.stream.queue.clear();
        self.stream.current = None;
    }

    pub fn push_section(&mut self, section: Section) {
        self.stream.queue.push_back(section);
    }

    /// Number of complete sections waiting (the one being emitted excluded).
    pub fn queue_len(&self) -> usize {
        self.stream.queue.len()
    }

    /// Drop the oldest queued sections down to `max` entries. Returns the
    /// number of dropped sections.
    pub fn drop_oldest_over(&mut self, max: usize) -> usize {
        let mut dropped = 0;
        while self.stream.queue.len() > max {
            self.stream.queue.pop_front();
            dropped += 1;
        }
        dropped
    }

    pub fn has_pending(&self) -> bool {
        self.stream.has_pending()
    }

    /// Replace `pkt` with the next packed packet. Returns false and leaves
    /// `pkt` untouched when nothing is pending.
    pub fn get_next_packet(&mut self, pkt: &mut TsPacket) -> bool {
        match self.stream.next_packet() {
            Some(next) => {
                *pkt = next;
                true
            }
            None => false,
        }
    }
}

/// One-shot packed packetization of a section list.
pub fn packetize_sections(pid: Pid, cc: &mut u8, sections: &[Section]) -> Vec<TsPacket> {
    let mut stream = SectionStream::new(pid, StuffingPolicy::Packed);
    stream.cc = *cc;
    stream.queue.extend(sections.iter().cloned());
    let mut out = Vec::new();
    while let Some(pkt) = stream.next_packet() {
        out.push(pkt);
    }
    *cc = stream.cc;
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::psi::demux::SectionDemux;
    use crate::psi::TID_PAT;

    #[test]
    fn test_single_small_section_one_packet() {
        let section = Section::new_long(TID_PAT, 1, 0, 0, 0, &[0, 1, 2, 3]);
        let packets = packetize_sections(0, &mut 0, &[section.clone()]);
        assert_eq!(packets.len(), 1);
        assert!(packets[0].pusi());
        assert_eq!(packets[0].pid(), 0);
        // Remainder of the packet is stuffing.
        let pl = packets[0].payload();
        assert_eq!(pl[0], 0); // pointer field
        assert_eq!(pl[1 + section.size()], 0xFF);
    }

    #[test]
    fn test_packed_sections_share_packets() {
        let sections: Vec<Section> = (0..4)
            .map(|i| Section::new_long(TID_PAT, i, 0, 0, 0, &[i as u8; 8]))
            .collect();
        // 4 sections of 20 bytes fit in one packet when packed.
        let packets = packetize_sections(0, &mut 0, &sections);
        assert_eq!(packets.len(), 1);

        let mut demux = SectionDemux::new();
        demux.add_pid(0);
        let got: Vec<Section> = packets.iter().flat_map(|p| demux.feed_packet(p)).collect();
        assert_eq!(got.len(), 4);
    }

    #[test]
    fn test_cycling_repeats_table() {
        let section = Section::new_long(TID_PAT, 1, 3, 0, 0, &[1, 2, 3, 4]);
        let mut pzer = CyclingPacketizer::new(0, StuffingPolicy::Always);
        pzer.add_sections(vec![section]);

        let mut pkt = TsPacket::default();
        let mut demux = SectionDemux::new();
        demux.add_pid(0);
        let mut count = 0;
        for _ in 0..5 {
            assert!(pzer.get_next_packet(&mut pkt));
            count += demux.feed_packet(&pkt).len();
        }
        // One section per packet under the Always policy.
        assert_eq!(count, 5);
    }

    #[test]
    fn test_cycling_remove_sections() {
        let mut pzer = CyclingPacketizer::new(0, StuffingPolicy::Always);
        pzer.add_sections(vec![Section::new_long(TID_PAT, 1, 0, 0, 0, &[1])]);
        pzer.remove_sections(TID_PAT, None);
        let mut pkt = TsPacket::default();
        assert!(!pzer.get_next_packet(&mut pkt));
        assert!(!pzer.has_content());
    }

    #[test]
    fn test_muxing_packetizer_drains() {
        let mut pzer = MuxingPacketizer::new(0x12);
        for i in 0..3 {
            pzer.push_section(Section::new_long(0x4E, i, 0, 0, 0, &[i as u8; 50]));
        }
        let mut pkt = TsPacket::default();
        let mut packets = 0;
        while pzer.get_next_packet(&mut pkt) {
            packets += 1;
        }
        // 3 sections of 62 bytes pack into two packets instead of three.
        assert_eq!(packets, 2);
        assert!(!pzer.has_pending());
    }
}
