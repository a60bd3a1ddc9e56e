//! Section and table demultiplexing
//!
//! Reassembles PSI sections from the payload of TS packets on a set of
//! filtered PIDs. The demux is pull-style: feeding a packet returns the
//! sections (or tables) completed by that packet, which keeps stream identity
//! explicit at the call site instead of dispatching on a demux tag.

use std::collections::{HashMap, HashSet};

use bytes::Bytes;
use tracing::{debug, trace};

use crate::psi::section::Section;
use crate::ts::{Pid, TsPacket};

/// A complete table: all sections of one (table_id, tid_ext, version).
#[derive(Debug, Clone)]
pub struct BinaryTable {
    pub sections: Vec<Section>,
}

impl BinaryTable {
    pub fn table_id(&self) -> u8 {
        self.sections[0].table_id()
    }

    pub fn tid_ext(&self) -> u16 {
        self.sections[0].tid_ext()
    }

    pub fn version(&self) -> u8 {
        self.sections[0].version()
    }

    pub fn source_pid(&self) -> Pid {
        self.sections[0].source_pid()
    }
}

#[derive(Default)]
struct PidAssembly {
    partial: Vec<u8>,
    /// Assembly only starts at a PUSI packet.
    started: bool,
    expected_cc: Option<u8>,
}

/// Reassembles individual sections on a set of PIDs.
pub struct SectionDemux {
    pids: HashSet<Pid>,
    assembly: HashMap<Pid, PidAssembly>,
    crc_errors: u64,
}

impl SectionDemux {
    pub fn new() -> Self {
        Self {
            pids: HashSet::new(),
            assembly: HashMap::new(),
            crc_errors: 0,
        }
    }

    pub fn add_pid(&mut self, pid: Pid) {
        self.pids.insert(pid);
    }

    pub fn remove_pid(&mut self, pid: Pid) {
        self.pids.remove(&pid);
        self.assembly.remove(&pid);
    }

    pub fn reset(&mut self) {
        self.assembly.clear();
    }

    /// Number of sections discarded on CRC or syntax errors.
    pub fn crc_errors(&self) -> u64 {
        self.crc_errors
    }

    /// Feed one packet, returning the sections it completed.
    pub fn feed_packet(&mut self, pkt: &TsPacket) -> Vec<Section> {
        let pid = pkt.pid();
        if !self.pids.contains(&pid) || !pkt.has_payload() || pkt.scrambling() != 0 {
            return Vec::new();
        }
        let payload = pkt.payload();
        if payload.is_empty() {
            return Vec::new();
        }

        let assembly = self.assembly.entry(pid).or_default();

        // Continuity check: a lost packet invalidates the partial section.
        let cc = pkt.continuity();
        if let Some(expected) = assembly.expected_cc {
            if cc != expected {
                trace!(pid, expected, got = cc, "continuity error, dropping partial section");
                assembly.partial.clear();
                assembly.started = false;
            }
        }
        assembly.expected_cc = Some((cc + 1) & 0x0F);

        let mut out = Vec::new();
        if pkt.pusi() {
            let pointer = payload[0] as usize;
            if 1 + pointer > payload.len() {
                assembly.partial.clear();
                assembly.started = false;
                return out;
            }
            // Terminate the pending section with the bytes before the pointer.
            if assembly.started && pointer > 0 {
                assembly.partial.extend_from_slice(&payload[1..1 + pointer]);
                Self::extract(assembly, pid, &mut out, &mut self.crc_errors);
            }
            // A new section starts here.
            assembly.partial.clear();
            assembly.started = true;
            assembly.partial.extend_from_slice(&payload[1 + pointer..]);
            Self::extract(assembly, pid, &mut out, &mut self.crc_errors);
        } else if assembly.started {
            assembly.partial.extend_from_slice(payload);
            Self::extract(assembly, pid, &mut out, &mut self.crc_errors);
        }
        out
    }

    /// Pull complete sections out of the partial buffer.
    fn extract(assembly: &mut PidAssembly, pid: Pid, out: &mut Vec<Section>, crc_errors: &mut u64) {
        loop {
            if assembly.partial.first() == Some(&0xFF) {
                // Stuffing until the end of the packet.
                assembly.partial.clear();
                assembly.started = false;
                return;
            }
            if assembly.partial.len() < 3 {
                return;
            }
            let size = 3 + (((assembly.partial[1] & 0x0F) as usize) << 8
                | assembly.partial[2] as usize);
            if assembly.partial.len() < size {
                return;
            }
            let raw: Vec<u8> = assembly.partial.drain(..size).collect();
            match Section::from_bytes(Bytes::from(raw), pid) {
                Some(section) => out.push(section),
                None => {
                    *crc_errors += 1;
                    debug!(pid, "discarding section with bad CRC or syntax");
                }
            }
        }
    }
}

impl Default for SectionDemux {
    fn default() -> Self {
        Self::new()
    }
}

/// Key of a table under assembly or already emitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct TableKey {
    pid: Pid,
    tid: u8,
    tid_ext: u16,
}

struct TableAssembly {
    version: u8,
    sections: Vec<Option<Section>>,
}

/// Groups demultiplexed sections into complete tables, emitting each
/// (table_id, tid_ext) once per version.
pub struct TableDemux {
    sections: SectionDemux,
    tables: HashMap<TableKey, TableAssembly>,
    emitted: HashMap<TableKey, u8>,
}

impl TableDemux {
    pub fn new() -> Self {
        Self {
            sections: SectionDemux::new(),
            tables: HashMap::new(),
            emitted: HashMap::new(),
        }
    }

    pub fn add_pid(&mut self, pid: Pid) {
        self.sections.add_pid(pid);
    }

    pub fn remove_pid(&mut self, pid: Pid) {
        self.sections.remove_pid(pid);
    }

    pub fn reset(&mut self) {
        self.sections.reset();
        self.tables.clear();
        self.emitted.clear();
    }

    /// Feed one packet, returning the tables it completed.
    pub fn feed_packet(&mut self, pkt: &TsPacket) -> Vec<BinaryTable> {
        let mut out = Vec::new();
        for section in self.sections.feed_packet(pkt) {
            if !section.is_long_section() {
                continue;
            }
            let key = TableKey {
                pid: section.source_pid(),
                tid: section.table_id(),
                tid_ext: section.tid_ext(),
            };
            let version = section.version();

            // Already delivered this version: nothing to do.
            if self.emitted.get(&key) == Some(&version) {
                continue;
            }

            let count = section.last_section_number() as usize + 1;
            let entry = self.tables.entry(key).or_insert_with(|| TableAssembly {
                version,
                sections: vec![None; count],
            });
            if entry.version != version || entry.sections.len() != count {
                entry.version = version;
                entry.sections = vec![None; count];
            }
            let index = section.section_number() as usize;
            if index < entry.sections.len() {
                entry.sections[index] = Some(section);
            }
            if entry.sections.iter().all(Option::is_some) {
                let entry = self.tables.remove(&key).unwrap();
                self.emitted.insert(key, version);
                out.push(BinaryTable {
                    sections: entry.sections.into_iter().flatten().collect(),
                });
            }
        }
        out
    }
}

impl Default for TableDemux {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::psi::packetizer::packetize_sections;
    use crate::psi::TID_SDT_ACT;

    #[test]
    fn test_section_through_packets() {
        // A section larger than one packet payload must reassemble.
        let payload = vec![0xA5u8; 400];
        let section = Section::new_long(TID_SDT_ACT, 0x0007, 4, 0, 0, &payload);
        let packets = packetize_sections(0x11, &mut 0, &[section.clone()]);
        assert!(packets.len() >= 3);

        let mut demux = SectionDemux::new();
        demux.add_pid(0x11);
        let mut got = Vec::new();
        for pkt in &packets {
            got.extend(demux.feed_packet(pkt));
        }
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].payload(), &payload[..]);
        assert_eq!(got[0].tid_ext(), 0x0007);
    }

    #[test]
    fn test_table_emitted_once_per_version() {
        let section = Section::new_long(TID_SDT_ACT, 0x0007, 4, 0, 0, &[1, 2, 3]);
        let packets = packetize_sections(0x11, &mut 0, &[section]);

        let mut demux = TableDemux::new();
        demux.add_pid(0x11);
        let mut tables = Vec::new();
        // Feed the same packets twice: the table must come out once.
        let mut cc = packets.last().map(|p| (p.continuity() + 1) & 0x0F).unwrap();
        for pkt in &packets {
            tables.extend(demux.feed_packet(pkt));
        }
        for pkt in &packets {
            let mut pkt = *pkt;
            pkt.set_continuity(cc);
            cc = (cc + 1) & 0x0F;
            tables.extend(demux.feed_packet(&pkt));
        }
        assert_eq!(tables.len(), 1);
        assert_eq!(tables[0].version(), 4);
    }

    #[test]
    fn test_multi_section_table() {
        let s0 = Section::new_long(TID_SDT_ACT, 1, 2, 0, 1, &[0x10]);
        let s1 = Section::new_long(TID_SDT_ACT, 1, 2, 1, 1, &[0x20]);
        let packets = packetize_sections(0x11, &mut 0, &[s0, s1]);

        let mut demux = TableDemux::new();
        demux.add_pid(0x11);
        let mut tables = Vec::new();
        for pkt in &packets {
            tables.extend(demux.feed_packet(pkt));
        }
        assert_eq!(tables.len(), 1);
        assert_eq!(tables[0].sections.len(), 2);
    }
}
