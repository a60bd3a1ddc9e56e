//! Output stage
//!
//! Drains the tail of the ring into the output plugin and returns the freed
//! slots to the input stage. Dropped packets are skipped in place, sends are
//! segmented by `--max-output-packets`, and a joint-termination agreement
//! caps the total number of packets let through.

use tracing::{debug, error, warn};

use crate::bitrate::{BitRate, BitRateConfidence};
use crate::pipeline::executor::Executor;
use crate::plugin::{OutputPlugin, Plugin};
use crate::ts::TsPacket;

pub(crate) struct OutputStage {
    exec: Executor,
    plugin: Box<dyn OutputPlugin>,
}

impl OutputStage {
    pub fn new(exec: Executor, plugin: Box<dyn OutputPlugin>) -> Self {
        Self { exec, plugin }
    }

    /// Output thread main loop.
    pub fn run(mut self) {
        debug!(plugin = self.plugin.name(), "output thread started");

        let max_output_pkt = match self.exec.shared.options.max_output_pkt {
            0 => usize::MAX,
            n => n,
        };
        let mut output_packets = 0u64;

        loop {
            let work = self.exec.wait_work(1, || false);

            // The "aborted" result reflects the successor, which is the input
            // thread: the ring is broken on this edge. For the output stage,
            // aborted means the engine is shutting down.
            let mut aborted = self.exec.self_aborting();

            let (restart_ok, _) = self.restart_in_place();
            let timeout = work.timeout || !restart_ok;
            if timeout {
                // Do not transmit bitrate or input end to the input stage.
                self.exec
                    .pass_packets(0, BitRate::ZERO, BitRateConfidence::Low, false, true);
                self.exec.shared.set_error();
                break;
            }
            if (work.count == 0 && work.input_end) || aborted {
                break;
            }

            let mut pkt_cnt = work.count;

            // Check whether joint termination agreed on a last packet.
            if let Some(limit) = self.exec.shared.joint.lock().output_limit() {
                let total = self.exec.total_packets();
                if total + pkt_cnt as u64 > limit {
                    pkt_cnt = limit.saturating_sub(total) as usize;
                    aborted = true;
                }
            }

            // Output the packets, skipping dropped ones. Output may be
            // segmented when dropped packets sit in the middle of the slice.
            let suspended = work.suspended;
            let shared = self.exec.shared.clone();
            let pkts: &[TsPacket] =
                unsafe { shared.buffer.packets_mut(work.first, pkt_cnt) };
            let metas = unsafe { shared.buffer.metadata_mut(work.first, pkt_cnt) };

            let mut offset = 0usize;
            while !aborted && offset < pkt_cnt {
                // Skip dropped packets.
                let drop_cnt = pkts[offset..]
                    .iter()
                    .take_while(|p| !p.has_valid_sync())
                    .count();
                offset += drop_cnt;
                self.exec.add_non_plugin_packets(drop_cnt as u64);

                // Find the contiguous run of valid packets.
                let out_cnt = pkts[offset..]
                    .iter()
                    .take_while(|p| p.has_valid_sync())
                    .count();

                let mut sent = 0usize;
                while !aborted && sent < out_cnt {
                    let sub_cnt = (out_cnt - sent).min(max_output_pkt);
                    let range = offset + sent..offset + sent + sub_cnt;
                    if suspended {
                        // Do not output packets while suspended.
                        self.exec.add_non_plugin_packets(sub_cnt as u64);
                    } else if let Err(e) =
                        self.plugin.send(&pkts[range.clone()], &metas[range])
                    {
                        error!(
                            plugin = self.plugin.name(),
                            error = format!("{e:#}"),
                            "output error"
                        );
                        self.exec.shared.set_error();
                        aborted = true;
                        break;
                    } else {
                        self.exec.add_plugin_packets(sub_cnt as u64);
                        crate::monitor::record_stage_packets("output", sub_cnt as u64);
                        output_packets += sub_cnt as u64;
                    }
                    sent += sub_cnt;
                }
                offset += out_cnt;
            }

            // Return the freed slots to the input stage. No bitrate or input
            // end propagates over this edge.
            aborted = !self.exec.pass_packets(
                pkt_cnt,
                BitRate::ZERO,
                BitRateConfidence::Low,
                false,
                aborted,
            );
            if aborted {
                break;
            }
        }

        debug!("stopping the output plugin");
        if let Err(e) = self.plugin.stop() {
            warn!(error = format!("{e:#}"), "error stopping output plugin");
        }
        debug!(
            total = self.exec.total_packets(),
            output_packets,
            aborted = self.exec.self_aborting(),
            "output thread terminated"
        );
    }

    fn restart_in_place(&mut self) -> (bool, bool) {
        let pending = self.exec.shared.state.lock()[self.exec.index]
            .restart
            .is_some();
        if !pending {
            return (true, false);
        }
        let plugin = std::mem::replace(&mut self.plugin, Box::new(NoopOutput));
        let mut wrapped = Plugin::Output(plugin);
        let result = self.exec.process_pending_restart(&mut wrapped);
        self.plugin = match wrapped {
            Plugin::Output(p) => p,
            _ => unreachable!("output slot always holds an output plugin"),
        };
        result
    }
}

/// Placeholder plugin used while swapping boxes during a restart.
struct NoopOutput;

impl OutputPlugin for NoopOutput {
    fn name(&self) -> &str {
        "noop"
    }

    fn send(
        &mut self,
        _pkts: &[TsPacket],
        _meta: &[crate::metadata::PacketMetadata],
    ) -> anyhow::Result<()> {
        Ok(())
    }
}
