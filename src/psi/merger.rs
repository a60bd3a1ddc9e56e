//! Two-stream PSI/SI merger
//!
//! Combines the signalization of a merged transport stream into the one of a
//! main stream: PAT, CAT, NIT-Actual, SDT-Actual and BAT are recombined into
//! coherent output tables replacing the main stream's packets, EIT sections of
//! both streams are mixed into the output EIT PID. Identifier conflicts
//! (same service in both streams, same EMM PID in both CATs) are reported and
//! the merged side's entity is dropped, never silently overwritten.

use std::collections::BTreeMap;

use tracing::{debug, error, warn};

use crate::psi::demux::{BinaryTable, SectionDemux, TableDemux};
use crate::psi::packetizer::{CyclingPacketizer, MuxingPacketizer, StuffingPolicy};
use crate::psi::section::Section;
use crate::psi::tables::{
    merge_descriptors, search_ca_pid, Bat, CaDescriptor, Cat, Nit, Pat, Sdt, TransportStreamId,
};
use crate::psi::{
    is_eit, is_eit_actual, SVERSION_MASK, TID_BAT, TID_CAT, TID_NIT_ACT, TID_NIT_OTH, TID_PAT,
    TID_SDT_ACT, TID_SDT_OTH, PID_BAT, PID_CAT, PID_EIT, PID_NIT, PID_PAT, PID_SDT, PID_TDT,
};
use crate::ts::{TsPacket, NULL_PACKET};

/// Default bound of the EIT section backlog.
pub const DEFAULT_MAX_EIT: usize = 128;

/// Table selection and replacement policy.
#[derive(Debug, Clone, Copy)]
pub struct MergeOptions {
    pub merge_pat: bool,
    pub merge_cat: bool,
    pub merge_nit: bool,
    pub merge_sdt: bool,
    pub merge_bat: bool,
    pub merge_eit: bool,
    /// Keep TDT/TOT from the main stream
    pub keep_main_tdt: bool,
    /// Keep TDT/TOT from the merged stream
    pub keep_merge_tdt: bool,
    /// Replace merged-stream PSI packets with null packets when their table is merged
    pub null_merged: bool,
    /// Replace merged-stream PSI packets with null packets when their table is not merged
    pub null_unmerged: bool,
}

impl Default for MergeOptions {
    fn default() -> Self {
        Self {
            merge_pat: true,
            merge_cat: true,
            merge_nit: true,
            merge_sdt: true,
            merge_bat: true,
            merge_eit: true,
            keep_main_tdt: true,
            keep_merge_tdt: false,
            null_merged: true,
            null_unmerged: true,
        }
    }
}

/// Stateful two-input signalization combiner.
pub struct PsiMerger {
    options: MergeOptions,
    max_eits: usize,

    main_demux: TableDemux,
    merge_demux: TableDemux,
    main_eit_demux: SectionDemux,
    merge_eit_demux: SectionDemux,

    pat_pzer: CyclingPacketizer,
    cat_pzer: CyclingPacketizer,
    nit_pzer: CyclingPacketizer,
    sdt_bat_pzer: CyclingPacketizer,
    eit_pzer: MuxingPacketizer,

    main_tsid: Option<u16>,
    main_pat: Option<Pat>,
    merge_pat: Option<Pat>,
    main_cat: Option<Cat>,
    merge_cat: Option<Cat>,
    main_sdt: Option<Sdt>,
    merge_sdt: Option<Sdt>,
    main_nit: Option<Nit>,
    merge_nit: Option<Nit>,
    main_bats: BTreeMap<u16, Bat>,
    merge_bats: BTreeMap<u16, Bat>,

    // Published output versions, kept across updates of the input tables.
    pat_version: Option<u8>,
    cat_version: Option<u8>,
    sdt_version: Option<u8>,
    nit_version: Option<u8>,
    bat_versions: BTreeMap<u16, u8>,
}

impl PsiMerger {
    pub fn new(options: MergeOptions) -> Self {
        let mut merger = Self {
            options,
            max_eits: DEFAULT_MAX_EIT,
            main_demux: TableDemux::new(),
            merge_demux: TableDemux::new(),
            main_eit_demux: SectionDemux::new(),
            merge_eit_demux: SectionDemux::new(),
            pat_pzer: CyclingPacketizer::new(PID_PAT, StuffingPolicy::Always),
            cat_pzer: CyclingPacketizer::new(PID_CAT, StuffingPolicy::Always),
            nit_pzer: CyclingPacketizer::new(PID_NIT, StuffingPolicy::Always),
            sdt_bat_pzer: CyclingPacketizer::new(PID_SDT, StuffingPolicy::Always),
            eit_pzer: MuxingPacketizer::new(PID_EIT),
            main_tsid: None,
            main_pat: None,
            merge_pat: None,
            main_cat: None,
            merge_cat: None,
            main_sdt: None,
            merge_sdt: None,
            main_nit: None,
            merge_nit: None,
            main_bats: BTreeMap::new(),
            merge_bats: BTreeMap::new(),
            pat_version: None,
            cat_version: None,
            sdt_version: None,
            nit_version: None,
            bat_versions: BTreeMap::new(),
        };
        merger.configure_demux();
        merger
    }

    /// Change the EIT backlog bound.
    pub fn set_max_eits(&mut self, max: usize) {
        self.max_eits = max.max(1);
    }

    /// Forget all accumulated state, keeping the options.
    pub fn reset(&mut self) {
        *self = Self::new(self.options);
    }

    fn configure_demux(&mut self) {
        if self.options.merge_pat {
            self.main_demux.add_pid(PID_PAT);
            self.merge_demux.add_pid(PID_PAT);
        }
        if self.options.merge_cat {
            self.main_demux.add_pid(PID_CAT);
            self.merge_demux.add_pid(PID_CAT);
        }
        if self.options.merge_nit {
            self.main_demux.add_pid(PID_NIT);
            self.merge_demux.add_pid(PID_NIT);
        }
        if self.options.merge_sdt || self.options.merge_bat {
            // SDT and BAT share the same PID.
            self.main_demux.add_pid(PID_BAT);
            self.merge_demux.add_pid(PID_BAT);
        }
        if self.options.merge_eit {
            self.main_eit_demux.add_pid(PID_EIT);
            self.merge_eit_demux.add_pid(PID_EIT);
        }
    }

    /// Feed one packet from the main stream, replacing it in place when it
    /// belongs to a merged PSI PID. Returns false when the EIT backlog
    /// overflowed (an error was logged and the oldest sections were dropped).
    pub fn feed_main(&mut self, pkt: &mut TsPacket) -> bool {
        let pid = pkt.pid();

        let tables = self.main_demux.feed_packet(pkt);
        for table in tables {
            self.handle_main_table(&table);
        }
        let sections = self.main_eit_demux.feed_packet(pkt);
        for section in sections {
            self.handle_eit(section, false);
        }

        match pid {
            PID_PAT => {
                // Replace PAT packets once both PATs were merged; pass through
                // the original packets until then.
                if self.main_pat.is_some() && self.merge_pat.is_some() {
                    self.pat_pzer.get_next_packet(pkt);
                }
            }
            PID_CAT => {
                if self.main_cat.is_some() && self.merge_cat.is_some() {
                    self.cat_pzer.get_next_packet(pkt);
                }
            }
            PID_NIT => {
                if self.main_nit.is_some() && self.merge_nit.is_some() {
                    self.nit_pzer.get_next_packet(pkt);
                }
            }
            PID_SDT => {
                if self.main_sdt.is_some() && self.merge_sdt.is_some() {
                    self.sdt_bat_pzer.get_next_packet(pkt);
                }
            }
            PID_EIT => {
                if self.options.merge_eit && !self.eit_pzer.get_next_packet(pkt) {
                    *pkt = NULL_PACKET;
                }
            }
            PID_TDT => {
                if !self.options.keep_main_tdt {
                    *pkt = NULL_PACKET;
                }
            }
            _ => {}
        }
        self.check_eits()
    }

    /// Feed one packet from the merged stream. Depending on the options, its
    /// PSI packets are nulled out or replaced by output EIT packets.
    pub fn feed_merged(&mut self, pkt: &mut TsPacket) -> bool {
        let pid = pkt.pid();

        let tables = self.merge_demux.feed_packet(pkt);
        for table in tables {
            self.handle_merge_table(&table);
        }
        let sections = self.merge_eit_demux.feed_packet(pkt);
        for section in sections {
            self.handle_eit(section, true);
        }

        let null_merged = self.options.null_merged;
        let null_unmerged = self.options.null_unmerged;
        let nullify = |merged: bool| (merged && null_merged) || (!merged && null_unmerged);
        match pid {
            PID_PAT => {
                if nullify(self.options.merge_pat) {
                    *pkt = NULL_PACKET;
                }
            }
            PID_CAT => {
                if nullify(self.options.merge_cat) {
                    *pkt = NULL_PACKET;
                }
            }
            PID_NIT => {
                if nullify(self.options.merge_nit) {
                    *pkt = NULL_PACKET;
                }
            }
            PID_SDT => {
                if nullify(self.options.merge_sdt || self.options.merge_bat) {
                    *pkt = NULL_PACKET;
                }
            }
            PID_EIT => {
                if self.options.merge_eit {
                    // The merged EIT PID is re-used for output EIT packets:
                    // nulling it would starve the mixed EIT stream.
                    if !self.eit_pzer.get_next_packet(pkt) {
                        *pkt = NULL_PACKET;
                    }
                } else if null_unmerged {
                    *pkt = NULL_PACKET;
                }
            }
            PID_TDT => {
                if !self.options.keep_merge_tdt {
                    *pkt = NULL_PACKET;
                }
            }
            _ => {}
        }
        self.check_eits()
    }

    /// Bound the EIT backlog, dropping the oldest sections on overflow.
    fn check_eits(&mut self) -> bool {
        if self.eit_pzer.queue_len() > self.max_eits {
            error!("too many accumulated EIT sections, not enough space in output EIT PID");
            self.eit_pzer.drop_oldest_over(self.max_eits);
            false
        } else {
            true
        }
    }

    /// Enqueue an EIT section from either stream into the output EIT PID.
    fn handle_eit(&mut self, section: Section, from_merge: bool) {
        if !self.options.merge_eit || !is_eit(section.table_id()) {
            return;
        }
        if !from_merge || !is_eit_actual(section.table_id()) {
            // Main stream EIT, or EIT-Other: pass without modification.
            self.eit_pzer.push_section(section);
        } else if section.payload().len() >= 2 {
            // EIT-Actual from the merged stream: patch the TS id (payload
            // bytes 0-1) with the main TS id before enqueueing. Dropped until
            // the main TS id is known.
            if let Some(tsid) = self.main_tsid {
                if let Some(patched) = section.with_payload_patch(0, &tsid.to_be_bytes()) {
                    self.eit_pzer.push_section(patched);
                }
            }
        }
    }

    fn handle_main_table(&mut self, table: &BinaryTable) {
        match table.table_id() {
            TID_PAT if table.source_pid() == PID_PAT => {
                if let Some(pat) = Pat::parse(table) {
                    self.main_tsid = Some(pat.ts_id);
                    self.main_pat = Some(pat);
                    self.merge_pat_tables();
                }
            }
            TID_CAT if table.source_pid() == PID_CAT => {
                if let Some(cat) = Cat::parse(table) {
                    self.main_cat = Some(cat);
                    self.merge_cat_tables();
                }
            }
            TID_NIT_ACT if table.source_pid() == PID_NIT => {
                if let Some(nit) = Nit::parse(table) {
                    self.main_nit = Some(nit);
                    self.merge_nit_tables();
                }
            }
            TID_NIT_OTH if table.source_pid() == PID_NIT => {
                // NIT-Other passes through verbatim on the rebuilt NIT PID.
                self.nit_pzer
                    .remove_sections(TID_NIT_OTH, Some(table.tid_ext()));
                self.nit_pzer.add_sections(table.sections.clone());
            }
            TID_SDT_ACT if table.source_pid() == PID_SDT => {
                if let Some(sdt) = Sdt::parse(table) {
                    self.main_tsid = Some(sdt.ts_id);
                    self.main_sdt = Some(sdt);
                    self.merge_sdt_tables();
                }
            }
            TID_SDT_OTH if table.source_pid() == PID_SDT => {
                self.sdt_bat_pzer
                    .remove_sections(TID_SDT_OTH, Some(table.tid_ext()));
                self.sdt_bat_pzer.add_sections(table.sections.clone());
            }
            TID_BAT if table.source_pid() == PID_BAT => {
                if let Some(bat) = Bat::parse(table) {
                    let bouquet_id = bat.bouquet_id;
                    self.main_bats.insert(bouquet_id, bat);
                    self.merge_bat_tables(bouquet_id);
                }
            }
            _ => {}
        }
    }

    fn handle_merge_table(&mut self, table: &BinaryTable) {
        match table.table_id() {
            TID_PAT if table.source_pid() == PID_PAT => {
                if let Some(pat) = Pat::parse(table) {
                    self.merge_pat = Some(pat);
                    self.merge_pat_tables();
                }
            }
            TID_CAT if table.source_pid() == PID_CAT => {
                if let Some(cat) = Cat::parse(table) {
                    self.merge_cat = Some(cat);
                    self.merge_cat_tables();
                }
            }
            TID_NIT_ACT if table.source_pid() == PID_NIT => {
                if let Some(nit) = Nit::parse(table) {
                    self.merge_nit = Some(nit);
                    self.merge_nit_tables();
                }
            }
            TID_SDT_ACT if table.source_pid() == PID_SDT => {
                if let Some(sdt) = Sdt::parse(table) {
                    self.merge_sdt = Some(sdt);
                    self.merge_sdt_tables();
                }
            }
            TID_BAT if table.source_pid() == PID_BAT => {
                if let Some(bat) = Bat::parse(table) {
                    let bouquet_id = bat.bouquet_id;
                    self.merge_bats.insert(bouquet_id, bat);
                    self.merge_bat_tables(bouquet_id);
                }
            }
            _ => {}
        }
    }

    /// Extended TS ids of both streams, known once both SDT-Actual were seen.
    fn transport_stream_ids(&self) -> Option<(TransportStreamId, TransportStreamId)> {
        match (&self.main_sdt, &self.merge_sdt) {
            (Some(main), Some(merge)) => Some((
                TransportStreamId::new(main.ts_id, main.onetw_id),
                TransportStreamId::new(merge.ts_id, merge.onetw_id),
            )),
            _ => None,
        }
    }

    fn next_version(slot: &mut Option<u8>, base: u8) -> u8 {
        let v = (slot.unwrap_or(base) + 1) & SVERSION_MASK;
        *slot = Some(v);
        v
    }

    /// Merge the PATs and publish the result into the cycling packetizer.
    fn merge_pat_tables(&mut self) {
        let (Some(main), Some(merge)) = (&self.main_pat, &self.merge_pat) else {
            return;
        };
        debug!("merging PAT");

        let mut pat = main.clone();
        pat.version = Self::next_version(&mut self.pat_version, main.version);

        for (&service_id, &pmt_pid) in &merge.pmts {
            if pat.pmts.contains_key(&service_id) {
                error!(
                    service_id,
                    "service conflict, service exists in the two streams, dropping from merged stream"
                );
            } else {
                debug!(service_id, "adding service in PAT from merged stream");
                pat.pmts.insert(service_id, pmt_pid);
            }
        }

        self.pat_pzer.remove_sections(TID_PAT, None);
        self.pat_pzer.add_sections(pat.to_sections());
    }

    /// Merge the CATs: union of CA descriptors keyed by EMM PID.
    fn merge_cat_tables(&mut self) {
        let (Some(main), Some(merge)) = (&self.main_cat, &self.merge_cat) else {
            return;
        };
        debug!("merging CAT");

        let mut cat = main.clone();
        cat.version = Self::next_version(&mut self.cat_version, main.version);

        for desc in &merge.descs {
            let Some(ca) = CaDescriptor::parse(desc) else {
                continue;
            };
            if search_ca_pid(&main.descs, ca.ca_pid).is_some() {
                error!(
                    emm_pid = ca.ca_pid,
                    "EMM PID conflict, PID referenced in the two streams, dropping from merged stream"
                );
            } else {
                debug!(emm_pid = ca.ca_pid, "adding EMM PID in CAT from merged stream");
                cat.descs.push(desc.clone());
            }
        }

        self.cat_pzer.remove_sections(TID_CAT, None);
        self.cat_pzer.add_sections(cat.to_sections());
    }

    /// Merge the SDT-Actual: union of service descriptions.
    fn merge_sdt_tables(&mut self) {
        let (Some(main), Some(merge)) = (&self.main_sdt, &self.merge_sdt) else {
            return;
        };
        debug!("merging SDT");

        let mut sdt = main.clone();
        sdt.version = Self::next_version(&mut self.sdt_version, main.version);

        for (&service_id, service) in &merge.services {
            if sdt.services.contains_key(&service_id) {
                error!(
                    service_id,
                    "service conflict, service exists in the two streams, dropping from merged stream"
                );
            } else {
                debug!(service_id, "adding service in SDT from merged stream");
                sdt.services.insert(service_id, service.clone());
            }
        }

        self.sdt_bat_pzer.remove_sections(TID_SDT_ACT, Some(sdt.ts_id));
        self.sdt_bat_pzer.add_sections(sdt.to_sections());
    }

    /// Merge the NIT-Actual.
    fn merge_nit_tables(&mut self) {
        let Some((main_tsid, merge_tsid)) = self.transport_stream_ids() else {
            return;
        };
        let (Some(main), Some(merge)) = (&self.main_nit, &self.merge_nit) else {
            return;
        };
        debug!("merging NIT");

        let mut nit = main.clone();
        nit.version = Self::next_version(&mut self.nit_version, main.version);

        // The two TS come from the same network with distinct TS ids: the
        // merged TS no longer exists on air, remove its description.
        if main.network_id == merge.network_id && main_tsid != merge_tsid {
            nit.transports.remove(&merge_tsid);
        }

        // Carry the merged TS's own descriptors into the main TS description.
        if let Some(merge_ts) = merge.transports.get(&merge_tsid) {
            merge_descriptors(nit.transports.entry(main_tsid).or_default(), merge_ts);
        }

        self.nit_pzer.remove_sections(TID_NIT_ACT, Some(nit.network_id));
        self.nit_pzer.add_sections(nit.to_sections());
    }

    /// Merge the BATs of one bouquet.
    fn merge_bat_tables(&mut self, bouquet_id: u16) {
        let Some((main_tsid, merge_tsid)) = self.transport_stream_ids() else {
            return;
        };
        let (Some(main), Some(merge)) = (
            self.main_bats.get(&bouquet_id),
            self.merge_bats.get(&bouquet_id),
        ) else {
            return;
        };
        debug!(bouquet_id, "merging BAT");

        let mut bat = main.clone();
        let slot = self.bat_versions.entry(bouquet_id).or_insert(main.version);
        *slot = (*slot + 1) & SVERSION_MASK;
        bat.version = *slot;

        if main_tsid != merge_tsid {
            bat.transports.remove(&merge_tsid);
        }
        if let Some(merge_ts) = merge.transports.get(&merge_tsid) {
            merge_descriptors(bat.transports.entry(main_tsid).or_default(), merge_ts);
        }

        self.sdt_bat_pzer.remove_sections(TID_BAT, Some(bouquet_id));
        self.sdt_bat_pzer.add_sections(bat.to_sections());
    }
}

impl Drop for PsiMerger {
    fn drop(&mut self) {
        if self.eit_pzer.has_pending() {
            warn!(
                backlog = self.eit_pzer.queue_len(),
                "discarding undelivered EIT sections"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::psi::packetizer::packetize_sections;

    fn pat_packets(pat: &Pat) -> Vec<TsPacket> {
        packetize_sections(PID_PAT, &mut 0, &pat.to_sections())
    }

    fn collect_output_pat(merger: &mut PsiMerger, carrier: &[TsPacket]) -> Pat {
        // Keep feeding PAT-PID packets until the rebuilt table comes out.
        let mut demux = TableDemux::new();
        demux.add_pid(PID_PAT);
        let mut cc = 0u8;
        for _ in 0..16 {
            for pkt in carrier {
                let mut pkt = *pkt;
                pkt.set_continuity(cc);
                cc = (cc + 1) & 0x0F;
                merger.feed_main(&mut pkt);
                if pkt.pid() == PID_PAT {
                    if let Some(table) = demux.feed_packet(&pkt).pop() {
                        return Pat::parse(&table).unwrap();
                    }
                }
            }
        }
        panic!("no merged PAT came out");
    }

    #[test]
    fn test_pat_merge_with_conflict() {
        let mut main_pat = Pat {
            ts_id: 0x0010,
            version: 5,
            ..Default::default()
        };
        main_pat.pmts.insert(0x0001, 0x0100);

        let mut merge_pat = Pat {
            ts_id: 0x0020,
            version: 2,
            ..Default::default()
        };
        merge_pat.pmts.insert(0x0001, 0x0999); // conflicts with main
        merge_pat.pmts.insert(0x0002, 0x0200);

        let mut merger = PsiMerger::new(MergeOptions::default());
        let main_packets = pat_packets(&main_pat);
        let merge_packets = pat_packets(&merge_pat);

        for pkt in &main_packets {
            let mut pkt = *pkt;
            assert!(merger.feed_main(&mut pkt));
        }
        for pkt in &merge_packets {
            let mut pkt = *pkt;
            assert!(merger.feed_merged(&mut pkt));
            // Merged-side PAT packets are nulled out.
            assert!(pkt.is_null());
        }

        let out = collect_output_pat(&mut merger, &main_packets);
        // Union minus the conflict: service 1 keeps the main PMT PID.
        assert_eq!(out.pmts.len(), 2);
        assert_eq!(out.pmts[&0x0001], 0x0100);
        assert_eq!(out.pmts[&0x0002], 0x0200);
        // Version incremented exactly once from the main PAT's version.
        assert_eq!(out.version, (main_pat.version + 1) & SVERSION_MASK);
    }

    #[test]
    fn test_pat_passthrough_until_both_sides_seen() {
        let mut main_pat = Pat {
            ts_id: 1,
            version: 0,
            ..Default::default()
        };
        main_pat.pmts.insert(1, 0x0100);
        let mut merger = PsiMerger::new(MergeOptions::default());
        for pkt in pat_packets(&main_pat) {
            let mut out = pkt;
            merger.feed_main(&mut out);
            // Only the main PAT was seen: packets pass through unchanged.
            assert_eq!(out, pkt);
        }
    }

    #[test]
    fn test_merge_tdt_dropped_by_default() {
        let mut merger = PsiMerger::new(MergeOptions::default());
        let sections = vec![crate::psi::tables::build_tdt(crate::psi::tables::UtcTime(
            1_700_000_000,
        ))];
        let packets = packetize_sections(PID_TDT, &mut 0, &sections);
        let mut pkt = packets[0];
        merger.feed_merged(&mut pkt);
        assert!(pkt.is_null());

        // Main-side TDT is kept by default.
        let mut pkt = packets[0];
        merger.feed_main(&mut pkt);
        assert_eq!(pkt, packets[0]);
    }

    #[test]
    fn test_eit_mix_and_tsid_patch() {
        let mut merger = PsiMerger::new(MergeOptions::default());

        // Teach the merger the main TS id through the main PAT.
        let mut main_pat = Pat {
            ts_id: 0x00AA,
            version: 0,
            ..Default::default()
        };
        main_pat.pmts.insert(1, 0x0100);
        for pkt in pat_packets(&main_pat) {
            let mut pkt = pkt;
            merger.feed_main(&mut pkt);
        }

        // EIT-Actual p/f from the merged stream: TS id gets patched.
        let eit = Section::new_long(0x4E, 0x0001, 0, 0, 0, &[0x00, 0x33, 0x44, 0x55, 0x66, 0x77]);
        let eit_packets = packetize_sections(PID_EIT, &mut 0, &[eit]);
        let mut got = Vec::new();
        let mut demux = SectionDemux::new();
        demux.add_pid(PID_EIT);
        for pkt in &eit_packets {
            let mut pkt = *pkt;
            merger.feed_merged(&mut pkt);
            // The EIT PID is re-emitted from the mixing packetizer.
            assert_eq!(pkt.pid(), PID_EIT);
            got.extend(demux.feed_packet(&pkt));
        }
        assert_eq!(got.len(), 1);
        assert_eq!(&got[0].payload()[..2], &0x00AAu16.to_be_bytes());
    }

    #[test]
    fn test_eit_backlog_bounded() {
        let mut merger = PsiMerger::new(MergeOptions::default());
        merger.set_max_eits(4);
        // Accumulate sections faster than the output EIT PID can drain them.
        for i in 0..40u16 {
            let eit = Section::new_long(0x4F, i, 0, 0, 0, &[0, 0, 0, 0, 0, 0]);
            merger.handle_eit(eit, true);
        }
        // The overflow is reported and the backlog trimmed to the bound.
        assert!(!merger.check_eits());
        assert_eq!(merger.eit_pzer.queue_len(), 4);
        assert!(merger.check_eits());
    }
}
