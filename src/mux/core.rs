//! Muxing core
//!
//! The cadenced N→1 muxing loop and the shared PSI/SI rebuild. Every input
//! contributes its services to one output PAT/CAT/NIT/SDT; each service and
//! EMM PID remembers the input that first announced it so that conflicts are
//! detected instead of silently overwritten. The first input delivering a
//! valid TDT/TOT becomes the time reference of the output stream.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::time::Instant;

use anyhow::Result;
use tracing::{debug, error, info, warn};

use crate::bitrate::{packets_to_pcr, pcr_to_packets, BitRate};
use crate::error::ExitStatus;
use crate::metadata::PacketMetadata;
use crate::mux::input::{MuxInputExecutor, PolledPacket};
use crate::mux::output::MuxOutputExecutor;
use crate::mux::{MuxerOptions, TableScope};
use crate::pcr::PcrMerger;
use crate::plugin::{InputPlugin, OutputPlugin};
use crate::psi::demux::{BinaryTable, SectionDemux, TableDemux};
use crate::psi::merger::DEFAULT_MAX_EIT;
use crate::psi::packetizer::{CyclingPacketizer, MuxingPacketizer, StuffingPolicy};
use crate::psi::section::Section;
use crate::psi::tables::{
    merge_descriptors, search_ca_pid, utc_from_packet, Cat, CaDescriptor, Nit, Pat, Sdt,
    TransportStreamId,
};
use crate::psi::{
    is_eit, is_eit_actual, SVERSION_MASK, TID_BAT, TID_CAT, TID_NIT_ACT, TID_NIT_OTH, TID_PAT,
    TID_SDT_ACT, TID_SDT_OTH, PID_CAT, PID_DVB_LAST, PID_EIT, PID_NIT, PID_PAT, PID_SDT, PID_TDT,
};
use crate::ts::{Pid, TsPacket, NULL_PACKET, PCR_SCALE, PKT_SIZE_BITS, SYSTEM_CLOCK_FREQ};

/// PCR distance from `from` forward to `to`, modulo the PCR scale.
fn diff_pcr(from: u64, to: u64) -> u64 {
    (to + PCR_SCALE - from) % PCR_SCALE
}

/// Absolute PCR distance between two values, modulo the PCR scale.
fn abs_diff_pcr(a: u64, b: u64) -> u64 {
    diff_pcr(a, b).min(diff_pcr(b, a))
}

/// Origin of a service or EMM PID in the output signalization.
#[derive(Default, Clone, Copy)]
struct Origin {
    input_index: usize,
    conflict_reported: bool,
}

/// PCR tracking of one PID for output pacing.
#[derive(Clone, Copy)]
struct PidClock {
    pcr_value: u64,
    pcr_packet: u64,
}

/// Per-input state of the muxing loop.
struct InputState {
    index: usize,
    demux: TableDemux,
    eit_demux: SectionDemux,
    pcr_merger: PcrMerger,
    got_ts_id: bool,
    ts_id: u16,
    /// A NIT received before the input TS id was known, kept for later.
    pending_nit: Option<Nit>,
    /// Output packet index at which the withheld packet becomes due.
    next_insertion: u64,
    next_packet: Option<(TsPacket, PacketMetadata)>,
    pid_clocks: HashMap<Pid, PidClock>,
}

impl InputState {
    fn new(index: usize, options: &MuxerOptions) -> Self {
        let mut demux = TableDemux::new();
        demux.add_pid(PID_PAT);
        demux.add_pid(PID_CAT);
        if options.nit_scope != TableScope::None {
            demux.add_pid(PID_NIT);
        }
        if options.sdt_scope != TableScope::None {
            demux.add_pid(PID_SDT);
        }
        let mut eit_demux = SectionDemux::new();
        if options.eit_scope != TableScope::None {
            eit_demux.add_pid(PID_EIT);
        }
        let mut pcr_merger = PcrMerger::new();
        pcr_merger.set_reset_backwards(true);
        Self {
            index,
            demux,
            eit_demux,
            pcr_merger,
            got_ts_id: false,
            ts_id: 0,
            pending_nit: None,
            next_insertion: 0,
            next_packet: None,
            pid_clocks: HashMap::new(),
        }
    }
}

/// Rebuilt output signalization and its origin tracking.
struct OutputPsi {
    pat: Pat,
    cat: Cat,
    nit: Nit,
    sdt: Sdt,
    pat_pzer: CyclingPacketizer,
    cat_pzer: CyclingPacketizer,
    nit_pzer: CyclingPacketizer,
    sdt_bat_pzer: CyclingPacketizer,
    eit_pzer: MuxingPacketizer,
    service_origin: BTreeMap<u16, Origin>,
    pid_origin: BTreeMap<Pid, Origin>,
    eit_overflow_reported: bool,
}

impl OutputPsi {
    fn new(options: &MuxerOptions) -> Self {
        Self {
            pat: Pat {
                ts_id: options.output_ts_id,
                nit_pid: Some(PID_NIT),
                ..Default::default()
            },
            cat: Cat::default(),
            nit: Nit {
                network_id: options.output_network_id,
                ..Default::default()
            },
            sdt: Sdt {
                ts_id: options.output_ts_id,
                onetw_id: options.output_network_id,
                ..Default::default()
            },
            pat_pzer: CyclingPacketizer::new(PID_PAT, StuffingPolicy::Always),
            cat_pzer: CyclingPacketizer::new(PID_CAT, StuffingPolicy::Always),
            nit_pzer: CyclingPacketizer::new(PID_NIT, StuffingPolicy::Always),
            sdt_bat_pzer: CyclingPacketizer::new(PID_SDT, StuffingPolicy::Always),
            eit_pzer: MuxingPacketizer::new(PID_EIT),
            service_origin: BTreeMap::new(),
            pid_origin: BTreeMap::new(),
            eit_overflow_reported: false,
        }
    }
}

/// The multiplexer: N input plugins, one output plugin, one muxing loop.
pub struct TsMuxer {
    options: MuxerOptions,
    inputs: Vec<Box<dyn InputPlugin>>,
    output: Option<Box<dyn OutputPlugin>>,
}

impl TsMuxer {
    pub fn new(options: MuxerOptions) -> Self {
        Self {
            options,
            inputs: Vec::new(),
            output: None,
        }
    }

    pub fn add_input(&mut self, plugin: Box<dyn InputPlugin>) {
        self.inputs.push(plugin);
    }

    pub fn set_output(&mut self, plugin: Box<dyn OutputPlugin>) {
        self.output = Some(plugin);
    }

    /// Run the muxer to completion: until all inputs terminate, the output
    /// fails, or a PSI conflict aborts it.
    pub fn run(self) -> Result<ExitStatus> {
        let Some(mut output) = self.output else {
            error!("no output plugin in the muxer");
            return Ok(ExitStatus::UsageError);
        };
        if self.inputs.is_empty() {
            error!("no input plugin in the muxer");
            return Ok(ExitStatus::UsageError);
        }

        // The output plugin's reported bitrate overrides the option.
        if let Err(e) = output.start() {
            error!(error = format!("{e:#}"), "output plugin failed to start");
            return Ok(ExitStatus::ProcessingError);
        }
        let (reported, _) = output.bitrate();
        let bitrate = if !reported.is_zero() {
            if !self.options.output_bitrate.is_zero() && self.options.output_bitrate != reported
            {
                warn!(
                    %reported,
                    configured = %self.options.output_bitrate,
                    "output bitrate reported by plugin overrides configuration"
                );
            }
            reported
        } else if self.options.output_bitrate.is_zero() {
            error!("no output bitrate specified and none reported by output plugin");
            let _ = output.stop();
            return Ok(ExitStatus::UsageError);
        } else {
            self.options.output_bitrate
        };

        // Start all input plugins before spawning any executor.
        let mut started = Vec::new();
        for (index, mut plugin) in self.inputs.into_iter().enumerate() {
            if let Err(e) = plugin.start() {
                error!(index, error = format!("{e:#}"), "input plugin failed to start");
                let _ = output.stop();
                return Ok(ExitStatus::ProcessingError);
            }
            started.push((index, plugin));
        }

        let output_exec = MuxOutputExecutor::start(output, self.options.out_buffer_packets)?;
        let mut input_execs = Vec::new();
        for (index, plugin) in started {
            input_execs.push(MuxInputExecutor::start(
                index,
                plugin,
                self.options.in_buffer_packets,
                self.options.max_input_packets,
                self.options.lossy_input,
                self.options.lossy_reclaim,
                self.options.input_once,
                self.options.input_restart_delay,
            )?);
        }

        info!(
            inputs = input_execs.len(),
            %bitrate,
            cadence = ?self.options.cadence,
            "muxer started"
        );

        let status = MuxLoop::new(&self.options, bitrate, input_execs, output_exec).run();
        Ok(status)
    }
}

/// The running muxing loop.
struct MuxLoop<'a> {
    options: &'a MuxerOptions,
    bitrate: BitRate,
    inputs: Vec<MuxInputExecutor>,
    input_states: Vec<InputState>,
    output: MuxOutputExecutor,
    psi: OutputPsi,
    eits: VecDeque<Section>,
    output_packets: u64,
    time_input_index: Option<usize>,
    terminated_inputs: HashSet<usize>,
    terminate: bool,
    conflict_abort: bool,
}

impl<'a> MuxLoop<'a> {
    fn new(
        options: &'a MuxerOptions,
        bitrate: BitRate,
        inputs: Vec<MuxInputExecutor>,
        output: MuxOutputExecutor,
    ) -> Self {
        let input_states = inputs
            .iter()
            .map(|e| InputState::new(e.index(), options))
            .collect();
        Self {
            options,
            bitrate,
            inputs,
            input_states,
            output,
            psi: OutputPsi::new(options),
            eits: VecDeque::new(),
            output_packets: 0,
            time_input_index: options.time_input_index,
            terminated_inputs: HashSet::new(),
            terminate: false,
            conflict_abort: false,
        }
    }

    fn run(mut self) -> ExitStatus {
        // Packet insertion interval of each rebuilt table.
        let pat_interval = (self.bitrate.0 / self.options.pat_bitrate.0.max(1)).max(1);
        let cat_interval = (self.bitrate.0 / self.options.cat_bitrate.0.max(1)).max(1);
        let nit_interval = (self.bitrate.0 / self.options.nit_bitrate.0.max(1)).max(1);
        let sdt_interval = (self.bitrate.0 / self.options.sdt_bitrate.0.max(1)).max(1);
        let mut next_pat_packet = 0u64;
        let mut next_cat_packet = 0u64;
        let mut next_nit_packet = 0u64;
        let mut next_sdt_packet = 0u64;

        // The cadence is driven by a monotonic clock.
        let start = Instant::now();
        let mut clock = start;
        let cadence = self.options.cadence;
        let mut input_index = 0usize;

        while !self.terminate {
            clock += cadence;

            // Packets which should have been sent by the end of this cycle.
            let elapsed = clock.duration_since(start);
            let expected = (elapsed.as_nanos() * self.bitrate.0 as u128
                / (1_000_000_000u128 * PKT_SIZE_BITS as u128)) as u64;
            let mut packet_count = expected.saturating_sub(self.output_packets);

            while !self.terminate && packet_count > 0 {
                let mut pkt = NULL_PACKET;
                let mut meta = PacketMetadata::default();

                if self.output_packets >= next_pat_packet
                    && self.psi.pat_pzer.get_next_packet(&mut pkt)
                {
                    next_pat_packet += pat_interval;
                } else if self.output_packets >= next_cat_packet
                    && self.psi.cat_pzer.get_next_packet(&mut pkt)
                {
                    next_cat_packet += cat_interval;
                } else if self.output_packets >= next_nit_packet
                    && self.psi.nit_pzer.get_next_packet(&mut pkt)
                {
                    next_nit_packet += nit_interval;
                } else if self.output_packets >= next_sdt_packet
                    && self.psi.sdt_bat_pzer.get_next_packet(&mut pkt)
                {
                    next_sdt_packet += sdt_interval;
                } else if self.get_input_packet(&mut input_index, &mut pkt, &mut meta) {
                    // Got a packet from an input plugin.
                } else if self.next_eit_packet(&mut pkt) {
                    // EITs are muxed, not cycled: inserted when available.
                } else {
                    pkt = NULL_PACKET;
                    meta.set_nullified(true);
                }

                if !self.output.send(pkt, meta) {
                    error!("output plugin terminated on error, aborting");
                    self.terminate = true;
                } else {
                    self.output_packets += 1;
                    packet_count -= 1;
                }
            }

            // Wait until the next muxing period.
            if !self.terminate {
                let now = Instant::now();
                if clock > now {
                    std::thread::sleep(clock - now);
                }
            }
        }

        let failed = self.output.failed() || self.conflict_abort;

        // Terminate every executor and wait for them.
        for input in &self.inputs {
            input.terminate();
        }
        self.output.terminate();
        for input in self.inputs.drain(..) {
            input.wait();
        }
        self.output.wait();

        debug!(packets = self.output_packets, "muxing loop terminated");
        if failed {
            ExitStatus::ProcessingError
        } else {
            ExitStatus::Success
        }
    }

    /// Pull the next EIT packet from the mixing packetizer.
    fn next_eit_packet(&mut self, pkt: &mut TsPacket) -> bool {
        while self.psi.eit_pzer.queue_len() < DEFAULT_MAX_EIT {
            match self.eits.pop_front() {
                Some(section) => self.psi.eit_pzer.push_section(section),
                None => break,
            }
        }
        self.psi.eit_pzer.get_next_packet(pkt)
    }

    /// Round-robin poll of the input plugins.
    fn get_input_packet(
        &mut self,
        input_index: &mut usize,
        pkt: &mut TsPacket,
        meta: &mut PacketMetadata,
    ) -> bool {
        let count = self.inputs.len();
        for _ in 0..count {
            let index = *input_index;
            *input_index = (*input_index + 1) % count;
            if self.next_from_input(index, pkt, meta) {
                return true;
            }
            if self.terminate {
                break;
            }
        }
        false
    }

    /// Try to take one packet from input `index`.
    fn next_from_input(&mut self, index: usize, pkt: &mut TsPacket, meta: &mut PacketMetadata) -> bool {
        // A withheld packet is released when its insertion point is reached.
        if self.input_states[index].next_insertion > 0 {
            if self.input_states[index].next_insertion <= self.output_packets {
                let state = &mut self.input_states[index];
                state.next_insertion = 0;
                let (p, m) = state.next_packet.take().expect("withheld packet present");
                *pkt = p;
                *meta = m;
                self.adjust_pcr(index, pkt);
                return true;
            }
            return false;
        }

        match self.inputs[index].poll() {
            PolledPacket::Terminated => {
                if self.terminated_inputs.insert(index) && self.terminated_inputs.len() >= self.inputs.len()
                {
                    // All inputs are done: request global termination.
                    info!("all input plugins terminated");
                    self.terminate = true;
                }
                false
            }
            PolledPacket::Empty => false,
            PolledPacket::Packet(p, m) => {
                *pkt = p;
                *meta = m;
                self.process_input_packet(index, pkt, meta)
            }
        }
    }

    /// Demultiplex, time-reference and pace one packet freshly read from an
    /// input. Returns true when the packet shall be inserted in the output.
    fn process_input_packet(
        &mut self,
        index: usize,
        pkt: &mut TsPacket,
        meta: &mut PacketMetadata,
    ) -> bool {
        let pid = pkt.pid();

        // Collect PSI/SI for the output rebuild.
        let tables = self.input_states[index].demux.feed_packet(pkt);
        for table in tables {
            self.handle_table(index, &table);
        }
        let sections = self.input_states[index].eit_demux.feed_packet(pkt);
        for section in sections {
            self.handle_eit_section(section);
        }

        // The first input delivering a valid time becomes the time reference.
        if pid == PID_TDT && self.time_input_index.is_none() && utc_from_packet(pkt).is_some() {
            info!(input = index, "using input as TDT/TOT reference");
            self.time_input_index = Some(index);
        }

        // Pace PCR-carrying packets: a packet whose natural insertion time in
        // the output lies in the future is withheld until then.
        if let Some(packet_pcr) = pkt.pcr() {
            if let Some(clock) = self.input_states[index].pid_clocks.get(&pid).copied() {
                let forward = diff_pcr(clock.pcr_value, packet_pcr);
                if forward > PCR_SCALE / 2 {
                    let back = diff_pcr(packet_pcr, clock.pcr_value);
                    warn!(
                        input = index,
                        pid,
                        back_pcr = back,
                        back_ms = (back * 1000) / SYSTEM_CLOCK_FREQ,
                        "late packet, passing through"
                    );
                } else {
                    debug_assert!(self.output_packets > clock.pcr_packet);
                    let output_pcr = clock.pcr_value
                        + packets_to_pcr(
                            self.bitrate,
                            self.output_packets.saturating_sub(clock.pcr_packet + 1),
                        );
                    // A deviation beyond one second is a clock leap: let the
                    // packet pass without pacing. Otherwise synchronize on
                    // the PCR progression.
                    if abs_diff_pcr(packet_pcr, output_pcr % PCR_SCALE) < SYSTEM_CLOCK_FREQ {
                        let target = clock.pcr_packet
                            + pcr_to_packets(self.bitrate, diff_pcr(clock.pcr_value, packet_pcr));
                        if target > self.output_packets {
                            debug!(
                                input = index,
                                pid,
                                delay = target - self.output_packets,
                                "withholding packet until its insertion point"
                            );
                            let state = &mut self.input_states[index];
                            state.next_insertion = target;
                            state.next_packet = Some((*pkt, *meta));
                            return false;
                        }
                    }
                }
            }
        }

        self.adjust_pcr(index, pkt);

        // Packets of the predefined PIDs are regenerated separately; only the
        // time reference input keeps its TDT packets.
        pid > PID_DVB_LAST || (pid == PID_TDT && self.time_input_index == Some(index))
    }

    /// Restamp the PCR for the output position and remember the insertion
    /// point of this PID's clock.
    fn adjust_pcr(&mut self, index: usize, pkt: &mut TsPacket) {
        let state = &mut self.input_states[index];
        state
            .pcr_merger
            .process_packet(pkt, self.output_packets, self.bitrate);
        if let Some(pcr) = pkt.pcr() {
            state.pid_clocks.insert(
                pkt.pid(),
                PidClock {
                    pcr_value: pcr,
                    pcr_packet: self.output_packets,
                },
            );
        }
    }

    /// Report a PSI conflict: abort by default, warn once with
    /// `--ignore-conflicts`.
    fn conflict(&mut self, origin: &mut Origin, kind: &'static str, id: u16, index: usize) {
        if !self.options.ignore_conflicts {
            error!(
                kind,
                id,
                first = origin.input_index,
                second = index,
                "conflict between inputs, aborting"
            );
            self.conflict_abort = true;
            self.terminate = true;
        } else if !origin.conflict_reported {
            origin.conflict_reported = true;
            warn!(
                kind,
                id,
                first = origin.input_index,
                second = index,
                "conflict between inputs, ignoring"
            );
        }
    }

    fn handle_table(&mut self, index: usize, table: &BinaryTable) {
        match table.table_id() {
            TID_PAT if table.source_pid() == PID_PAT => {
                if let Some(pat) = Pat::parse(table) {
                    self.handle_pat(index, &pat);
                }
            }
            TID_CAT if table.source_pid() == PID_CAT => {
                if let Some(cat) = Cat::parse(table) {
                    self.handle_cat(index, &cat);
                }
            }
            TID_NIT_ACT if table.source_pid() == PID_NIT => {
                if self.options.nit_scope != TableScope::None {
                    if let Some(nit) = Nit::parse(table) {
                        if self.input_states[index].got_ts_id {
                            self.handle_nit(index, &nit);
                        } else {
                            // Keep it until the input TS id is known.
                            self.input_states[index].pending_nit = Some(nit);
                        }
                    }
                }
            }
            TID_NIT_OTH if table.source_pid() == PID_NIT => {
                if self.options.nit_scope == TableScope::All {
                    // NIT-Other: reinserted without modification.
                    self.psi
                        .nit_pzer
                        .remove_sections(TID_NIT_OTH, Some(table.tid_ext()));
                    self.psi.nit_pzer.add_sections(table.sections.clone());
                }
            }
            TID_SDT_ACT if table.source_pid() == PID_SDT => {
                if self.options.sdt_scope != TableScope::None {
                    if let Some(sdt) = Sdt::parse(table) {
                        self.handle_sdt(index, &sdt);
                    }
                }
            }
            TID_SDT_OTH if table.source_pid() == PID_SDT => {
                if self.options.sdt_scope == TableScope::All {
                    self.psi
                        .sdt_bat_pzer
                        .remove_sections(TID_SDT_OTH, Some(table.tid_ext()));
                    self.psi.sdt_bat_pzer.add_sections(table.sections.clone());
                }
            }
            TID_BAT if table.source_pid() == PID_SDT => {
                if self.options.sdt_scope == TableScope::All {
                    self.psi
                        .sdt_bat_pzer
                        .remove_sections(TID_BAT, Some(table.tid_ext()));
                    self.psi.sdt_bat_pzer.add_sections(table.sections.clone());
                }
            }
            _ => {}
        }
    }

    fn handle_pat(&mut self, index: usize, pat: &Pat) {
        let mut modified = false;

        // The input TS id is now known; a pending NIT can be processed.
        self.input_states[index].ts_id = pat.ts_id;
        self.input_states[index].got_ts_id = true;
        if let Some(nit) = self.input_states[index].pending_nit.take() {
            self.handle_nit(index, &nit);
        }

        // Add all services of this input into the output PAT.
        for (&service_id, &pmt_pid) in &pat.pmts {
            let mut origin = *self
                .psi
                .service_origin
                .entry(service_id)
                .or_insert(Origin {
                    input_index: index,
                    conflict_reported: false,
                });
            if !self.psi.pat.pmts.contains_key(&service_id) {
                info!(service_id, input = index, "adding service in PAT");
                self.psi.pat.pmts.insert(service_id, pmt_pid);
                origin.input_index = index;
                modified = true;
            } else if origin.input_index == index {
                modified = modified || self.psi.pat.pmts.get(&service_id) != Some(&pmt_pid);
                self.psi.pat.pmts.insert(service_id, pmt_pid);
            } else {
                self.conflict(&mut origin, "service", service_id, index);
                if self.terminate {
                    return;
                }
            }
            self.psi.service_origin.insert(service_id, origin);
        }

        // Services owned by this input which disappeared from its PAT are
        // removed from the output PAT.
        let owned: Vec<u16> = self
            .psi
            .pat
            .pmts
            .keys()
            .copied()
            .filter(|id| {
                self.psi
                    .service_origin
                    .get(id)
                    .is_some_and(|o| o.input_index == index)
                    && !pat.pmts.contains_key(id)
            })
            .collect();
        for service_id in owned {
            info!(service_id, input = index, "service disappeared, removing from PAT");
            self.psi.pat.pmts.remove(&service_id);
            modified = true;
        }

        if modified {
            self.psi.pat.version = (self.psi.pat.version + 1) & SVERSION_MASK;
            self.psi.pat_pzer.remove_sections(TID_PAT, None);
            self.psi.pat_pzer.add_sections(self.psi.pat.to_sections());
        }
    }

    fn handle_cat(&mut self, index: usize, cat: &Cat) {
        let mut modified = false;

        for desc in &cat.descs {
            let Some(ca) = CaDescriptor::parse(desc) else {
                continue;
            };
            let mut origin = *self.psi.pid_origin.entry(ca.ca_pid).or_insert(Origin {
                input_index: index,
                conflict_reported: false,
            });
            match search_ca_pid(&self.psi.cat.descs, ca.ca_pid) {
                None => {
                    info!(emm_pid = ca.ca_pid, input = index, "adding EMM PID in CAT");
                    self.psi.cat.descs.push(desc.clone());
                    origin.input_index = index;
                    modified = true;
                }
                Some(existing) if origin.input_index == index => {
                    if self.psi.cat.descs[existing] != *desc {
                        self.psi.cat.descs[existing] = desc.clone();
                        modified = true;
                    }
                }
                Some(_) => {
                    self.conflict(&mut origin, "EMM PID", ca.ca_pid, index);
                    if self.terminate {
                        return;
                    }
                }
            }
            self.psi.pid_origin.insert(ca.ca_pid, origin);
        }

        if modified {
            self.psi.cat.version = (self.psi.cat.version + 1) & SVERSION_MASK;
            self.psi.cat_pzer.remove_sections(TID_CAT, None);
            self.psi.cat_pzer.add_sections(self.psi.cat.to_sections());
        }
    }

    fn handle_nit(&mut self, index: usize, nit: &Nit) {
        let mut modified = false;
        let input_ts_id = self.input_states[index].ts_id;
        let output_tsid =
            TransportStreamId::new(self.options.output_ts_id, self.options.output_network_id);

        merge_descriptors(&mut self.psi.nit.descs, &nit.descs);

        for (tsid, descs) in &nit.transports {
            if tsid.transport_stream_id == input_ts_id {
                // The description of this input stream maps to the output
                // stream description.
                merge_descriptors(
                    self.psi.nit.transports.entry(output_tsid).or_default(),
                    descs,
                );
                modified = true;
            } else if tsid.transport_stream_id != self.options.output_ts_id {
                let key =
                    TransportStreamId::new(tsid.transport_stream_id, self.options.output_network_id);
                merge_descriptors(self.psi.nit.transports.entry(key).or_default(), descs);
                modified = true;
            }
        }

        if modified {
            self.psi.nit.version = (self.psi.nit.version + 1) & SVERSION_MASK;
            self.psi.nit_pzer.remove_sections(TID_NIT_ACT, None);
            self.psi.nit_pzer.add_sections(self.psi.nit.to_sections());
        }
    }

    fn handle_sdt(&mut self, index: usize, sdt: &Sdt) {
        let mut modified = false;

        for (&service_id, service) in &sdt.services {
            let mut origin = *self
                .psi
                .service_origin
                .entry(service_id)
                .or_insert(Origin {
                    input_index: index,
                    conflict_reported: false,
                });
            if !self.psi.sdt.services.contains_key(&service_id) {
                info!(service_id, input = index, "adding service in SDT");
                self.psi.sdt.services.insert(service_id, service.clone());
                origin.input_index = index;
                modified = true;
            } else if origin.input_index == index {
                self.psi.sdt.services.insert(service_id, service.clone());
                modified = true;
            } else {
                self.conflict(&mut origin, "service", service_id, index);
                if self.terminate {
                    return;
                }
            }
            self.psi.service_origin.insert(service_id, origin);
        }

        // Remove services owned by this input which disappeared from its SDT.
        let owned: Vec<u16> = self
            .psi
            .sdt
            .services
            .keys()
            .copied()
            .filter(|id| {
                self.psi
                    .service_origin
                    .get(id)
                    .is_some_and(|o| o.input_index == index)
                    && !sdt.services.contains_key(id)
            })
            .collect();
        for service_id in owned {
            info!(service_id, input = index, "service disappeared, removing from SDT");
            self.psi.sdt.services.remove(&service_id);
            modified = true;
        }

        if modified {
            self.psi.sdt.version = (self.psi.sdt.version + 1) & SVERSION_MASK;
            self.psi.sdt_bat_pzer.remove_sections(TID_SDT_ACT, None);
            self.psi.sdt_bat_pzer.add_sections(self.psi.sdt.to_sections());
        }
    }

    /// Queue an EIT section for the output EIT PID, patching the TS and
    /// network ids of EIT-Actual sections.
    fn handle_eit_section(&mut self, section: Section) {
        let tid = section.table_id();
        if !is_eit(tid) {
            return;
        }
        let actual = is_eit_actual(tid);
        if self.options.eit_scope == TableScope::Actual && !actual {
            return;
        }

        let section = if actual && section.payload().len() >= 4 {
            let mut patch = [0u8; 4];
            patch[..2].copy_from_slice(&self.options.output_ts_id.to_be_bytes());
            patch[2..].copy_from_slice(&self.options.output_network_id.to_be_bytes());
            match section.with_payload_patch(0, &patch) {
                Some(patched) => patched,
                None => return,
            }
        } else {
            section
        };

        self.eits.push_back(section);
        if self.eits.len() > DEFAULT_MAX_EIT {
            if !self.psi.eit_overflow_reported {
                self.psi.eit_overflow_reported = true;
                warn!("too many input EIT, not enough space in output EIT PID, dropping sections");
            }
            while self.eits.len() > DEFAULT_MAX_EIT {
                self.eits.pop_front();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugins::{MemoryInput, MemoryOutput};
    use crate::psi::demux::TableDemux;
    use crate::psi::packetizer::packetize_sections;
    use parking_lot::Mutex;
    use std::sync::Arc;

    fn stream_with_pat(ts_id: u16, services: &[(u16, Pid)], data_pid: Pid, count: usize) -> Vec<TsPacket> {
        let mut pat = Pat {
            ts_id,
            version: 1,
            ..Default::default()
        };
        for &(id, pid) in services {
            pat.pmts.insert(id, pid);
        }
        let mut packets = packetize_sections(PID_PAT, &mut 0, &pat.to_sections());
        let mut cc = 0u8;
        for _ in 0..count {
            let mut pkt = NULL_PACKET;
            pkt.set_pid(data_pid);
            pkt.set_continuity(cc);
            cc = (cc + 1) & 0x0F;
            packets.push(pkt);
        }
        packets
    }

    #[test]
    fn test_mux_two_inputs_union_pat() {
        let mut muxer = TsMuxer::new(MuxerOptions {
            output_bitrate: BitRate(50_000_000),
            input_once: true,
            output_ts_id: 0x0077,
            // Re-emit the PAT often so the final output PAT reflects the
            // union of both inputs.
            pat_bitrate: BitRate(5_000_000),
            ..Default::default()
        });
        muxer.add_input(Box::new(MemoryInput::new(Arc::new(stream_with_pat(
            1,
            &[(0x0001, 0x0100)],
            0x0100,
            200,
        )))));
        muxer.add_input(Box::new(MemoryInput::new(Arc::new(stream_with_pat(
            2,
            &[(0x0002, 0x0200)],
            0x0200,
            200,
        )))));
        let sink = Arc::new(Mutex::new(Vec::new()));
        muxer.set_output(Box::new(MemoryOutput::new(sink.clone())));

        let status = muxer.run().unwrap();
        assert_eq!(status, ExitStatus::Success);

        // The output carries a rebuilt PAT with the union of the services.
        let out = sink.lock();
        assert!(!out.is_empty());
        let mut demux = TableDemux::new();
        demux.add_pid(PID_PAT);
        let mut last_pat = None;
        for pkt in out.iter() {
            for table in demux.feed_packet(pkt) {
                if let Some(pat) = Pat::parse(&table) {
                    last_pat = Some(pat);
                }
            }
        }
        let pat = last_pat.expect("no PAT in muxer output");
        assert_eq!(pat.ts_id, 0x0077);
        assert!(pat.pmts.contains_key(&0x0001));
        assert!(pat.pmts.contains_key(&0x0002));

        // Input data packets made it through.
        assert!(out.iter().any(|p| p.pid() == 0x0100));
        assert!(out.iter().any(|p| p.pid() == 0x0200));
    }

    #[test]
    fn test_mux_conflict_aborts() {
        let mut muxer = TsMuxer::new(MuxerOptions {
            output_bitrate: BitRate(50_000_000),
            input_once: true,
            ..Default::default()
        });
        // Both inputs announce service 1.
        muxer.add_input(Box::new(MemoryInput::new(Arc::new(stream_with_pat(
            1,
            &[(0x0001, 0x0100)],
            0x0100,
            2000,
        )))));
        muxer.add_input(Box::new(MemoryInput::new(Arc::new(stream_with_pat(
            2,
            &[(0x0001, 0x0200)],
            0x0200,
            2000,
        )))));
        let sink = Arc::new(Mutex::new(Vec::new()));
        muxer.set_output(Box::new(MemoryOutput::new(sink.clone())));

        let status = muxer.run().unwrap();
        assert_eq!(status, ExitStatus::ProcessingError);
    }

    #[test]
    fn test_mux_conflict_ignored_when_configured() {
        let mut muxer = TsMuxer::new(MuxerOptions {
            output_bitrate: BitRate(50_000_000),
            input_once: true,
            ignore_conflicts: true,
            ..Default::default()
        });
        muxer.add_input(Box::new(MemoryInput::new(Arc::new(stream_with_pat(
            1,
            &[(0x0001, 0x0100)],
            0x0100,
            200,
        )))));
        muxer.add_input(Box::new(MemoryInput::new(Arc::new(stream_with_pat(
            2,
            &[(0x0001, 0x0200)],
            0x0200,
            200,
        )))));
        let sink = Arc::new(Mutex::new(Vec::new()));
        muxer.set_output(Box::new(MemoryOutput::new(sink.clone())));

        let status = muxer.run().unwrap();
        assert_eq!(status, ExitStatus::Success);
    }
}
