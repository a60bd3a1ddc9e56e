//! PSI/SI table object model
//!
//! Parse and rebuild the tables the engine merges: PAT, CAT, PMT, NIT, SDT,
//! BAT, plus UTC extraction from TDT/TOT. Only the fields the merging logic
//! acts upon are modelled; descriptors stay binary.

use std::collections::BTreeMap;

use tracing::trace;

use crate::psi::demux::BinaryTable;
use crate::psi::section::{Section, MAX_LONG_SECTION_PAYLOAD};
use crate::psi::{
    DID_CA, TID_BAT, TID_CAT, TID_NIT_ACT, TID_PAT, TID_PMT, TID_SDT_ACT, TID_TDT, TID_TOT,
};
use crate::ts::{Pid, TsPacket};

/// A raw descriptor: tag and binary payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Descriptor {
    pub tag: u8,
    pub payload: Vec<u8>,
}

impl Descriptor {
    pub fn size(&self) -> usize {
        2 + self.payload.len()
    }
}

pub type DescriptorList = Vec<Descriptor>;

/// Parse a descriptor loop.
pub fn parse_descriptors(mut data: &[u8]) -> Option<DescriptorList> {
    let mut out = Vec::new();
    while !data.is_empty() {
        if data.len() < 2 {
            return None;
        }
        let tag = data[0];
        let len = data[1] as usize;
        if data.len() < 2 + len {
            return None;
        }
        out.push(Descriptor {
            tag,
            payload: data[2..2 + len].to_vec(),
        });
        data = &data[2 + len..];
    }
    Some(out)
}

/// Serialize a descriptor loop.
pub fn serialize_descriptors(list: &DescriptorList) -> Vec<u8> {
    let mut out = Vec::new();
    for d in list {
        out.push(d.tag);
        out.push(d.payload.len() as u8);
        out.extend_from_slice(&d.payload);
    }
    out
}

/// Merge descriptors from `other` into `list`, skipping exact duplicates.
pub fn merge_descriptors(list: &mut DescriptorList, other: &DescriptorList) {
    for d in other {
        if !list.contains(d) {
            list.push(d.clone());
        }
    }
}

/// Decoded CA descriptor (tag 0x09).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaDescriptor {
    pub ca_system_id: u16,
    pub ca_pid: Pid,
}

impl CaDescriptor {
    pub fn parse(d: &Descriptor) -> Option<Self> {
        if d.tag != DID_CA || d.payload.len() < 4 {
            return None;
        }
        Some(Self {
            ca_system_id: u16::from_be_bytes([d.payload[0], d.payload[1]]),
            ca_pid: u16::from_be_bytes([d.payload[2], d.payload[3]]) & 0x1FFF,
        })
    }
}

/// Index of the first CA descriptor referencing `pid`, if any.
pub fn search_ca_pid(list: &DescriptorList, pid: Pid) -> Option<usize> {
    list.iter()
        .position(|d| CaDescriptor::parse(d).is_some_and(|ca| ca.ca_pid == pid))
}

/// Extended transport stream identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TransportStreamId {
    pub transport_stream_id: u16,
    pub original_network_id: u16,
}

impl TransportStreamId {
    pub fn new(transport_stream_id: u16, original_network_id: u16) -> Self {
        Self {
            transport_stream_id,
            original_network_id,
        }
    }
}

/// Pack per-entry binary chunks into section payloads, splitting on overflow.
/// `prefix` is repeated at the start of every section.
fn pack_entries(prefix: &[u8], entries: &[Vec<u8>], capacity: usize) -> Vec<Vec<u8>> {
    let mut payloads = Vec::new();
    let mut current = prefix.to_vec();
    for entry in entries {
        if current.len() + entry.len() > capacity && current.len() > prefix.len() {
            payloads.push(std::mem::replace(&mut current, prefix.to_vec()));
        }
        current.extend_from_slice(entry);
    }
    payloads.push(current);
    payloads
}

fn build_long_sections(tid: u8, tid_ext: u16, version: u8, payloads: Vec<Vec<u8>>) -> Vec<Section> {
    let last = (payloads.len() - 1) as u8;
    payloads
        .into_iter()
        .enumerate()
        .map(|(i, p)| Section::new_long(tid, tid_ext, version, i as u8, last, &p))
        .collect()
}

//----------------------------------------------------------------------------
// PAT
//----------------------------------------------------------------------------

/// Program Association Table.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Pat {
    pub ts_id: u16,
    pub version: u8,
    pub nit_pid: Option<Pid>,
    /// service_id -> PMT PID
    pub pmts: BTreeMap<u16, Pid>,
}

impl Pat {
    pub fn parse(table: &BinaryTable) -> Option<Pat> {
        if table.table_id() != TID_PAT {
            return None;
        }
        let mut pat = Pat {
            ts_id: table.tid_ext(),
            version: table.version(),
            ..Default::default()
        };
        for section in &table.sections {
            let mut data = section.payload();
            while data.len() >= 4 {
                let service_id = u16::from_be_bytes([data[0], data[1]]);
                let pid = u16::from_be_bytes([data[2], data[3]]) & 0x1FFF;
                if service_id == 0 {
                    pat.nit_pid = Some(pid);
                } else {
                    pat.pmts.insert(service_id, pid);
                }
                data = &data[4..];
            }
        }
        Some(pat)
    }

    pub fn to_sections(&self) -> Vec<Section> {
        let mut entries: Vec<Vec<u8>> = Vec::new();
        if let Some(nit_pid) = self.nit_pid {
            let mut e = 0u16.to_be_bytes().to_vec();
            e.extend_from_slice(&(0xE000 | nit_pid).to_be_bytes());
            entries.push(e);
        }
        for (&service_id, &pid) in &self.pmts {
            let mut e = service_id.to_be_bytes().to_vec();
            e.extend_from_slice(&(0xE000 | pid).to_be_bytes());
            entries.push(e);
        }
        build_long_sections(
            TID_PAT,
            self.ts_id,
            self.version,
            pack_entries(&[], &entries, MAX_LONG_SECTION_PAYLOAD),
        )
    }
}

//----------------------------------------------------------------------------
// CAT
//----------------------------------------------------------------------------

/// Conditional Access Table: a flat descriptor loop.
#[derive(Debug, Clone, Default)]
pub struct Cat {
    pub version: u8,
    pub descs: DescriptorList,
}

impl Cat {
    pub fn parse(table: &BinaryTable) -> Option<Cat> {
        if table.table_id() != TID_CAT {
            return None;
        }
        let mut cat = Cat {
            version: table.version(),
            ..Default::default()
        };
        for section in &table.sections {
            cat.descs.extend(parse_descriptors(section.payload())?);
        }
        Some(cat)
    }

    pub fn to_sections(&self) -> Vec<Section> {
        let entries: Vec<Vec<u8>> = self
            .descs
            .iter()
            .map(|d| serialize_descriptors(&vec![d.clone()]))
            .collect();
        build_long_sections(
            TID_CAT,
            0xFFFF,
            self.version,
            pack_entries(&[], &entries, MAX_LONG_SECTION_PAYLOAD),
        )
    }
}

//----------------------------------------------------------------------------
// PMT
//----------------------------------------------------------------------------

/// One elementary stream description inside a PMT.
#[derive(Debug, Clone, Default)]
pub struct PmtStream {
    pub stream_type: u8,
    pub descs: DescriptorList,
}

/// Program Map Table.
#[derive(Debug, Clone, Default)]
pub struct Pmt {
    pub service_id: u16,
    pub version: u8,
    pub pcr_pid: Pid,
    pub descs: DescriptorList,
    pub streams: BTreeMap<Pid, PmtStream>,
}

impl Pmt {
    pub fn parse(table: &BinaryTable) -> Option<Pmt> {
        if table.table_id() != TID_PMT {
            return None;
        }
        let section = table.sections.first()?;
        let data = section.payload();
        if data.len() < 4 {
            return None;
        }
        let mut pmt = Pmt {
            service_id: table.tid_ext(),
            version: table.version(),
            pcr_pid: u16::from_be_bytes([data[0], data[1]]) & 0x1FFF,
            ..Default::default()
        };
        let info_len = (u16::from_be_bytes([data[2], data[3]]) & 0x0FFF) as usize;
        if data.len() < 4 + info_len {
            return None;
        }
        pmt.descs = parse_descriptors(&data[4..4 + info_len])?;
        let mut data = &data[4 + info_len..];
        while data.len() >= 5 {
            let stream_type = data[0];
            let pid = u16::from_be_bytes([data[1], data[2]]) & 0x1FFF;
            let es_len = (u16::from_be_bytes([data[3], data[4]]) & 0x0FFF) as usize;
            if data.len() < 5 + es_len {
                return None;
            }
            pmt.streams.insert(
                pid,
                PmtStream {
                    stream_type,
                    descs: parse_descriptors(&data[5..5 + es_len])?,
                },
            );
            data = &data[5 + es_len..];
        }
        Some(pmt)
    }

    pub fn to_sections(&self) -> Vec<Section> {
        let prog_descs = serialize_descriptors(&self.descs);
        let mut payload = Vec::new();
        payload.extend_from_slice(&(0xE000 | self.pcr_pid).to_be_bytes());
        payload.extend_from_slice(&(0xF000 | prog_descs.len() as u16).to_be_bytes());
        payload.extend_from_slice(&prog_descs);
        for (&pid, stream) in &self.streams {
            let es = serialize_descriptors(&stream.descs);
            payload.push(stream.stream_type);
            payload.extend_from_slice(&(0xE000 | pid).to_be_bytes());
            payload.extend_from_slice(&(0xF000 | es.len() as u16).to_be_bytes());
            payload.extend_from_slice(&es);
        }
        build_long_sections(TID_PMT, self.service_id, self.version, vec![payload])
    }
}

//----------------------------------------------------------------------------
// NIT / BAT
//----------------------------------------------------------------------------

/// Network Information Table (actual or other).
#[derive(Debug, Clone, Default)]
pub struct Nit {
    pub network_id: u16,
    pub version: u8,
    pub descs: DescriptorList,
    pub transports: BTreeMap<TransportStreamId, DescriptorList>,
}

/// Bouquet Association Table. Same binary layout as the NIT.
#[derive(Debug, Clone, Default)]
pub struct Bat {
    pub bouquet_id: u16,
    pub version: u8,
    pub descs: DescriptorList,
    pub transports: BTreeMap<TransportStreamId, DescriptorList>,
}

fn parse_nit_like(
    table: &BinaryTable,
) -> Option<(DescriptorList, BTreeMap<TransportStreamId, DescriptorList>)> {
    let mut descs = DescriptorList::new();
    let mut transports = BTreeMap::new();
    for section in &table.sections {
        let data = section.payload();
        if data.len() < 2 {
            return None;
        }
        let net_len = (u16::from_be_bytes([data[0], data[1]]) & 0x0FFF) as usize;
        if data.len() < 2 + net_len + 2 {
            return None;
        }
        merge_descriptors(&mut descs, &parse_descriptors(&data[2..2 + net_len])?);
        let loop_start = 2 + net_len + 2;
        let loop_len =
            (u16::from_be_bytes([data[2 + net_len], data[2 + net_len + 1]]) & 0x0FFF) as usize;
        if data.len() < loop_start + loop_len {
            return None;
        }
        let mut data = &data[loop_start..loop_start + loop_len];
        while data.len() >= 6 {
            let tsid = u16::from_be_bytes([data[0], data[1]]);
            let onid = u16::from_be_bytes([data[2], data[3]]);
            let len = (u16::from_be_bytes([data[4], data[5]]) & 0x0FFF) as usize;
            if data.len() < 6 + len {
                return None;
            }
            transports.insert(
                TransportStreamId::new(tsid, onid),
                parse_descriptors(&data[6..6 + len])?,
            );
            data = &data[6 + len..];
        }
    }
    Some((descs, transports))
}

fn nit_like_sections(
    tid: u8,
    tid_ext: u16,
    version: u8,
    descs: &DescriptorList,
    transports: &BTreeMap<TransportStreamId, DescriptorList>,
) -> Vec<Section> {
    let net = serialize_descriptors(descs);
    let entries: Vec<Vec<u8>> = transports
        .iter()
        .map(|(tsid, list)| {
            let d = serialize_descriptors(list);
            let mut e = Vec::with_capacity(6 + d.len());
            e.extend_from_slice(&tsid.transport_stream_id.to_be_bytes());
            e.extend_from_slice(&tsid.original_network_id.to_be_bytes());
            e.extend_from_slice(&(0xF000 | d.len() as u16).to_be_bytes());
            e.extend_from_slice(&d);
            e
        })
        .collect();

    // First section carries the network/bouquet descriptors, later ones an
    // empty loop. Each section closes its own transport loop length.
    let capacity = MAX_LONG_SECTION_PAYLOAD.saturating_sub(net.len() + 4).max(6);
    let packed = pack_entries(&[], &entries, capacity);
    let last = (packed.len() - 1) as u8;
    packed
        .into_iter()
        .enumerate()
        .map(|(i, body)| {
            let mut payload = Vec::new();
            let net_here: &[u8] = if i == 0 { &net } else { &[] };
            payload.extend_from_slice(&(0xF000 | net_here.len() as u16).to_be_bytes());
            payload.extend_from_slice(net_here);
            payload.extend_from_slice(&(0xF000 | body.len() as u16).to_be_bytes());
            payload.extend_from_slice(&body);
            Section::new_long(tid, tid_ext, version, i as u8, last, &payload)
        })
        .collect()
}

impl Nit {
    pub fn parse(table: &BinaryTable) -> Option<Nit> {
        if table.table_id() != TID_NIT_ACT && table.table_id() != crate::psi::TID_NIT_OTH {
            return None;
        }
        let (descs, transports) = parse_nit_like(table)?;
        Some(Nit {
            network_id: table.tid_ext(),
            version: table.version(),
            descs,
            transports,
        })
    }

    pub fn to_sections(&self) -> Vec<Section> {
        nit_like_sections(
            TID_NIT_ACT,
            self.network_id,
            self.version,
            &self.descs,
            &self.transports,
        )
    }
}

impl Bat {
    pub fn parse(table: &BinaryTable) -> Option<Bat> {
        if table.table_id() != TID_BAT {
            return None;
        }
        let (descs, transports) = parse_nit_like(table)?;
        Some(Bat {
            bouquet_id: table.tid_ext(),
            version: table.version(),
            descs,
            transports,
        })
    }

    pub fn to_sections(&self) -> Vec<Section> {
        nit_like_sections(
            TID_BAT,
            self.bouquet_id,
            self.version,
            &self.descs,
            &self.transports,
        )
    }
}

//----------------------------------------------------------------------------
// SDT
//----------------------------------------------------------------------------

/// One service description inside an SDT.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SdtService {
    pub eit_schedule: bool,
    pub eit_pf: bool,
    pub running_status: u8,
    pub ca_mode: bool,
    pub descs: DescriptorList,
}

/// Service Description Table (actual).
#[derive(Debug, Clone, Default)]
pub struct Sdt {
    pub ts_id: u16,
    pub onetw_id: u16,
    pub version: u8,
    pub services: BTreeMap<u16, SdtService>,
}

impl Sdt {
    pub fn parse(table: &BinaryTable) -> Option<Sdt> {
        if table.table_id() != TID_SDT_ACT && table.table_id() != crate::psi::TID_SDT_OTH {
            return None;
        }
        let mut sdt = Sdt {
            ts_id: table.tid_ext(),
            version: table.version(),
            ..Default::default()
        };
        for section in &table.sections {
            let data = section.payload();
            if data.len() < 3 {
                return None;
            }
            sdt.onetw_id = u16::from_be_bytes([data[0], data[1]]);
            let mut data = &data[3..];
            while data.len() >= 5 {
                let service_id = u16::from_be_bytes([data[0], data[1]]);
                let eit_schedule = (data[2] & 0x02) != 0;
                let eit_pf = (data[2] & 0x01) != 0;
                let running_status = data[3] >> 5;
                let ca_mode = (data[3] & 0x10) != 0;
                let len = (u16::from_be_bytes([data[3], data[4]]) & 0x0FFF) as usize;
                if data.len() < 5 + len {
                    return None;
                }
                sdt.services.insert(
                    service_id,
                    SdtService {
                        eit_schedule,
                        eit_pf,
                        running_status,
                        ca_mode,
                        descs: parse_descriptors(&data[5..5 + len])?,
                    },
                );
                data = &data[5 + len..];
            }
        }
        Some(sdt)
    }

    pub fn to_sections(&self) -> Vec<Section> {
        let mut prefix = Vec::with_capacity(3);
        prefix.extend_from_slice(&self.onetw_id.to_be_bytes());
        prefix.push(0xFF);
        let entries: Vec<Vec<u8>> = self
            .services
            .iter()
            .map(|(&service_id, svc)| {
                let d = serialize_descriptors(&svc.descs);
                let mut e = Vec::with_capacity(5 + d.len());
                e.extend_from_slice(&service_id.to_be_bytes());
                e.push(0xFC | ((svc.eit_schedule as u8) << 1) | svc.eit_pf as u8);
                let word = ((svc.running_status as u16) << 13)
                    | ((svc.ca_mode as u16) << 12)
                    | d.len() as u16;
                e.extend_from_slice(&word.to_be_bytes());
                e.extend_from_slice(&d);
                e
            })
            .collect();
        build_long_sections(
            TID_SDT_ACT,
            self.ts_id,
            self.version,
            pack_entries(&prefix, &entries, MAX_LONG_SECTION_PAYLOAD),
        )
    }
}

//----------------------------------------------------------------------------
// TDT / TOT
//----------------------------------------------------------------------------

/// UTC time from a TDT or TOT, in seconds since the Unix epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UtcTime(pub u64);

/// Days between MJD day 0 and the Unix epoch.
const MJD_UNIX_EPOCH: u64 = 40587;

fn bcd(value: u8) -> Option<u64> {
    let hi = (value >> 4) as u64;
    let lo = (value & 0x0F) as u64;
    if hi > 9 || lo > 9 {
        None
    } else {
        Some(hi * 10 + lo)
    }
}

/// Decode the 5-byte MJD + BCD time field used by TDT and TOT.
pub fn decode_mjd_utc(data: &[u8]) -> Option<UtcTime> {
    if data.len() < 5 {
        return None;
    }
    let mjd = u16::from_be_bytes([data[0], data[1]]) as u64;
    if mjd < MJD_UNIX_EPOCH {
        return None;
    }
    let h = bcd(data[2])?;
    let m = bcd(data[3])?;
    let s = bcd(data[4])?;
    if h > 23 || m > 59 || s > 59 {
        return None;
    }
    Some(UtcTime((mjd - MJD_UNIX_EPOCH) * 86400 + h * 3600 + m * 60 + s))
}

/// Encode a Unix timestamp as the 5-byte MJD + BCD time field.
pub fn encode_mjd_utc(utc: UtcTime) -> [u8; 5] {
    let days = utc.0 / 86400;
    let rem = utc.0 % 86400;
    let mjd = (days + MJD_UNIX_EPOCH) as u16;
    let to_bcd = |v: u64| -> u8 { (((v / 10) << 4) | (v % 10)) as u8 };
    let mut out = [0u8; 5];
    out[..2].copy_from_slice(&mjd.to_be_bytes());
    out[2] = to_bcd(rem / 3600);
    out[3] = to_bcd((rem % 3600) / 60);
    out[4] = to_bcd(rem % 60);
    out
}

/// Try to extract a UTC time from a TDT or TOT section starting in `pkt`.
pub fn utc_from_packet(pkt: &TsPacket) -> Option<UtcTime> {
    if !pkt.pusi() {
        return None;
    }
    let pl = pkt.payload();
    if pl.is_empty() {
        return None;
    }
    let pf = pl[0] as usize;
    if pl.len() < 1 + pf + 8 {
        return None;
    }
    let sect = &pl[1 + pf..];
    let tid = sect[0];
    if tid != TID_TDT && tid != TID_TOT {
        trace!(tid, "not a TDT/TOT section");
        return None;
    }
    // Both carry the UTC time right after the 3-byte section header.
    decode_mjd_utc(&sect[3..])
}

/// Build a TDT section for the given UTC time.
pub fn build_tdt(utc: UtcTime) -> Section {
    Section::new_short(TID_TDT, &encode_mjd_utc(utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::psi::demux::TableDemux;
    use crate::psi::packetizer::packetize_sections;
    use crate::psi::{PID_PAT, PID_SDT};

    fn through_demux(pid: Pid, sections: Vec<Section>) -> BinaryTable {
        let mut demux = TableDemux::new();
        demux.add_pid(pid);
        let mut cc = 0;
        let packets = packetize_sections(pid, &mut cc, &sections);
        let mut tables = Vec::new();
        for pkt in &packets {
            tables.extend(demux.feed_packet(pkt));
        }
        assert_eq!(tables.len(), 1);
        tables.remove(0)
    }

    #[test]
    fn test_pat_roundtrip() {
        let mut pat = Pat {
            ts_id: 0x0042,
            version: 9,
            nit_pid: Some(0x0010),
            ..Default::default()
        };
        pat.pmts.insert(0x0001, 0x0100);
        pat.pmts.insert(0x0002, 0x0200);

        let table = through_demux(PID_PAT, pat.to_sections());
        let parsed = Pat::parse(&table).unwrap();
        assert_eq!(parsed, pat);
    }

    #[test]
    fn test_sdt_roundtrip() {
        let mut sdt = Sdt {
            ts_id: 7,
            onetw_id: 0x2222,
            version: 1,
            ..Default::default()
        };
        sdt.services.insert(
            0x0001,
            SdtService {
                eit_pf: true,
                running_status: 4,
                descs: vec![Descriptor {
                    tag: 0x48,
                    payload: vec![0x01, 0x00, 0x03, b'K', b'i', b'd'],
                }],
                ..Default::default()
            },
        );

        let table = through_demux(PID_SDT, sdt.to_sections());
        let parsed = Sdt::parse(&table).unwrap();
        assert_eq!(parsed.onetw_id, 0x2222);
        assert_eq!(parsed.services.len(), 1);
        assert_eq!(parsed.services[&1], sdt.services[&1]);
    }

    #[test]
    fn test_nit_roundtrip() {
        let mut nit = Nit {
            network_id: 0x1000,
            version: 3,
            descs: vec![Descriptor {
                tag: 0x40,
                payload: b"Net".to_vec(),
            }],
            ..Default::default()
        };
        nit.transports.insert(
            TransportStreamId::new(1, 0x2222),
            vec![Descriptor {
                tag: 0x41,
                payload: vec![0, 1, 0x19],
            }],
        );
        let table = through_demux(0x0010, nit.to_sections());
        let parsed = Nit::parse(&table).unwrap();
        assert_eq!(parsed.network_id, 0x1000);
        assert_eq!(parsed.descs.len(), 1);
        assert_eq!(
            parsed.transports[&TransportStreamId::new(1, 0x2222)].len(),
            1
        );
    }

    #[test]
    fn test_pmt_roundtrip() {
        let mut pmt = Pmt {
            service_id: 0x0001,
            version: 2,
            pcr_pid: 0x0050,
            ..Default::default()
        };
        pmt.streams.insert(
            0x0051,
            PmtStream {
                stream_type: 0x02,
                descs: Vec::new(),
            },
        );
        let table = through_demux(0x0100, pmt.to_sections());
        let parsed = Pmt::parse(&table).unwrap();
        assert_eq!(parsed.pcr_pid, 0x0050);
        assert_eq!(parsed.streams[&0x0051].stream_type, 0x02);
    }

    #[test]
    fn test_cat_roundtrip() {
        let cat = Cat {
            version: 0,
            descs: vec![Descriptor {
                tag: DID_CA,
                payload: vec![0x01, 0x00, 0xE1, 0x00],
            }],
        };
        let table = through_demux(PID_CAT_TEST, cat.to_sections());
        let parsed = Cat::parse(&table).unwrap();
        let ca = CaDescriptor::parse(&parsed.descs[0]).unwrap();
        assert_eq!(ca.ca_pid, 0x0100);
        assert_eq!(search_ca_pid(&parsed.descs, 0x0100), Some(0));
        assert_eq!(search_ca_pid(&parsed.descs, 0x0101), None);
    }

    const PID_CAT_TEST: Pid = crate::psi::PID_CAT;

    #[test]
    fn test_mjd_utc_roundtrip() {
        // 2026-08-01 12:34:56 UTC.
        let utc = UtcTime(1_785_000_000 / 86400 * 86400 + 12 * 3600 + 34 * 60 + 56);
        let decoded = decode_mjd_utc(&encode_mjd_utc(utc)).unwrap();
        assert_eq!(decoded, utc);
    }

    #[test]
    fn test_utc_from_packet() {
        let utc = UtcTime(1_700_000_000);
        let sections = vec![build_tdt(utc)];
        let mut cc = 0;
        let packets = packetize_sections(crate::psi::PID_TDT, &mut cc, &sections);
        assert_eq!(utc_from_packet(&packets[0]), Some(utc));
    }
}
