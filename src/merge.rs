//! Merge processor plugin
//!
//! Merges a secondary transport stream into the main stream flowing through
//! the pipeline: a feeder thread runs the sub-stream input plugin and pushes
//! its packets into a bitrate-aware queue; the processor replaces null
//! packets of the main stream with queued sub-stream packets under the
//! insertion controller's gate, restamps their PCRs against the main bitrate
//! and merges the signalization of both streams.

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use anyhow::{Context, Result};
use tracing::{debug, error, warn};

use crate::bitrate::BitRate;
use crate::error::Error;
use crate::insertion::PacketInsertionController;
use crate::metadata::PacketMetadata;
use crate::pcr::PcrMerger;
use crate::plugin::{InputPlugin, ProcessStatus, ProcessorPlugin};
use crate::plugins;
use crate::psi::merger::{MergeOptions, PsiMerger};
use crate::queue::TsPacketQueue;
use crate::ts::TsPacket;

/// Default depth of the sub-stream packet queue.
pub const DEFAULT_SUB_QUEUE_SIZE: usize = 1000;

pub struct MergePlugin {
    sub_plugin: Option<Box<dyn InputPlugin>>,
    queue: Arc<TsPacketQueue>,
    feeder: Option<JoinHandle<()>>,
    psi: PsiMerger,
    pcr: PcrMerger,
    controller: PacketInsertionController,
    main_bitrate: BitRate,
    main_packets: u64,
    inserted: u64,
}

impl MergePlugin {
    /// Build a merge plugin around an already-constructed sub-stream input.
    pub fn new(sub_plugin: Box<dyn InputPlugin>, options: MergeOptions) -> Self {
        let mut pcr = PcrMerger::new();
        pcr.set_reset_backwards(true);
        Self {
            sub_plugin: Some(sub_plugin),
            queue: Arc::new(TsPacketQueue::new(DEFAULT_SUB_QUEUE_SIZE)),
            feeder: None,
            psi: PsiMerger::new(options),
            pcr,
            controller: PacketInsertionController::new(),
            main_bitrate: BitRate::ZERO,
            main_packets: 0,
            inserted: 0,
        }
    }

    /// Build from command line arguments: the sub-stream input plugin name
    /// followed by its own arguments.
    pub fn from_args(args: &[String]) -> Result<Self> {
        let name = args
            .first()
            .ok_or_else(|| Error::Config("merge: missing sub-stream input plugin".into()))?;
        let sub = plugins::create_input(name, &args[1..])
            .with_context(|| format!("merge: cannot create sub-stream input '{name}'"))?;
        Ok(Self::new(sub, MergeOptions::default()))
    }

    /// Take the next usable sub-stream packet: signalization of the merged
    /// stream is processed on the way, nulled packets are skipped.
    fn next_sub_packet(&mut self) -> Option<TsPacket> {
        loop {
            let (pkt, bitrate) = self.queue.get_packet();
            let mut pkt = pkt?;
            self.controller.set_sub_bitrate(bitrate);
            if !self.psi.feed_merged(&mut pkt) {
                warn!("EIT backlog overflow while merging sub-stream");
            }
            if pkt.is_null() {
                // Stripped by the PSI merger, try the next one.
                continue;
            }
            self.pcr
                .process_packet(&mut pkt, self.main_packets, self.main_bitrate);
            return Some(pkt);
        }
    }
}

impl ProcessorPlugin for MergePlugin {
    fn name(&self) -> &str {
        "merge"
    }

    fn start(&mut self) -> Result<()> {
        let mut sub = self
            .sub_plugin
            .take()
            .ok_or_else(|| Error::Config("merge: plugin already started".into()))?;
        sub.start()?;

        let queue = self.queue.clone();
        queue.reset(None);
        let feeder = thread::Builder::new()
            .name("merge-feeder".into())
            .spawn(move || {
                debug!("sub-stream feeder thread started");
                let mut metas: Vec<PacketMetadata> = Vec::new();
                loop {
                    let Some(mut win) = queue.lock_write_buffer(1) else {
                        // The consumer stopped the queue.
                        break;
                    };
                    let len = win.len();
                    metas.resize(len, PacketMetadata::default());
                    match sub.receive(&mut win, &mut metas[..len]) {
                        Ok(0) => {
                            win.release(0);
                            queue.set_eof();
                            break;
                        }
                        Ok(n) => win.release(n),
                        Err(e) => {
                            error!(error = format!("{e:#}"), "sub-stream input error");
                            win.release(0);
                            queue.set_eof();
                            break;
                        }
                    }
                }
                if let Err(e) = sub.stop() {
                    warn!(error = format!("{e:#}"), "error stopping sub-stream input");
                }
                debug!("sub-stream feeder thread terminated");
            })
            .context("merge: cannot spawn feeder thread")?;
        self.feeder = Some(feeder);
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        self.queue.stop();
        if let Some(feeder) = self.feeder.take() {
            let _ = feeder.join();
        }
        debug!(
            main_packets = self.main_packets,
            inserted = self.inserted,
            "merge plugin stopped"
        );
        Ok(())
    }

    fn handle_bitrate(&mut self, bitrate: BitRate) {
        self.main_bitrate = bitrate;
        self.controller.set_main_bitrate(bitrate);
    }

    fn process_packet(&mut self, pkt: &mut TsPacket, _meta: &mut PacketMetadata) -> ProcessStatus {
        self.main_packets += 1;
        self.controller.count_main_packets(1);

        // Main-stream signalization first: output tables replace the main
        // PSI packets in place.
        if !self.psi.feed_main(pkt) {
            warn!("EIT backlog overflow while merging main stream");
        }

        // Null packets of the main stream are the insertion opportunities.
        if pkt.is_null() {
            let waiting = self.queue.current_size();
            if self.controller.must_insert(waiting) {
                if let Some(sub) = self.next_sub_packet() {
                    *pkt = sub;
                    self.controller.count_sub_packets(1);
                    self.inserted += 1;
                }
            }
        }
        ProcessStatus::Ok
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugins::MemoryInput;
    use crate::ts::{NULL_PACKET, PID_NULL};

    fn sub_stream(count: usize, pid: u16) -> Arc<Vec<TsPacket>> {
        let mut pkts = Vec::new();
        for i in 0..count {
            let mut pkt = NULL_PACKET;
            pkt.set_pid(pid);
            pkt.set_continuity(i as u8);
            pkts.push(pkt);
        }
        Arc::new(pkts)
    }

    #[test]
    fn test_sub_packets_fill_null_slots() {
        let sub = MemoryInput::new(sub_stream(50, 0x060));
        let mut plugin = MergePlugin::new(Box::new(sub), MergeOptions::default());
        plugin.start().unwrap();

        // Unknown bitrates: the controller always authorizes insertion.
        let mut meta = PacketMetadata::default();
        let mut merged = 0;
        let mut spins = 0u64;
        while merged < 50 {
            let mut pkt = NULL_PACKET;
            assert_eq!(plugin.process_packet(&mut pkt, &mut meta), ProcessStatus::Ok);
            if pkt.pid() == 0x060 {
                merged += 1;
            } else {
                // The feeder thread may not have filled the queue yet.
                assert_eq!(pkt.pid(), PID_NULL);
                std::thread::yield_now();
            }
            spins += 1;
            assert!(spins < 10_000_000, "sub-stream packets never arrived");
        }
        assert_eq!(merged, 50);
        plugin.stop().unwrap();
    }

    #[test]
    fn test_non_null_main_packets_untouched() {
        let sub = MemoryInput::new(sub_stream(10, 0x060));
        let mut plugin = MergePlugin::new(Box::new(sub), MergeOptions::default());
        plugin.start().unwrap();

        let mut meta = PacketMetadata::default();
        let mut pkt = NULL_PACKET;
        pkt.set_pid(0x0200);
        let before = pkt;
        plugin.process_packet(&mut pkt, &mut meta);
        assert_eq!(pkt, before);
        plugin.stop().unwrap();
    }
}
