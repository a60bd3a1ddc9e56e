//! Processor stage
//!
//! Runs one packet processor plugin, either packet by packet or over packet
//! windows. Dropped packets and label-filtered packets bypass the plugin;
//! suspended stages pass everything through untouched.

use tracing::{debug, error, warn};

use crate::metadata::LabelSet;
use crate::pipeline::executor::Executor;
use crate::pipeline::window::PacketWindow;
use crate::plugin::{Plugin, ProcessStatus, ProcessorPlugin};
use crate::ts::{NULL_PACKET, PID_NULL};

/// Environment variable forcing all processors into packet-window mode.
pub const FORCED_WINDOW_SIZE_ENV: &str = "TSP_FORCED_WINDOW_SIZE";

pub(crate) struct ProcessorStage {
    exec: Executor,
    plugin: Box<dyn ProcessorPlugin>,
    passed: u64,
    dropped: u64,
    nullified: u64,
}

impl ProcessorStage {
    pub fn new(exec: Executor, plugin: Box<dyn ProcessorPlugin>) -> Self {
        Self {
            exec,
            plugin,
            passed: 0,
            dropped: 0,
            nullified: 0,
        }
    }

    /// Processor thread main.
    pub fn run(mut self) {
        debug!(plugin = self.plugin.name(), "packet processing thread started");

        // The environment can force every plugin into window mode, to check
        // that the batch path does not change a plugin's behavior.
        let forced: usize = std::env::var(FORCED_WINDOW_SIZE_ENV)
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        let window_size = if forced > 0 {
            forced
        } else {
            self.plugin.window_size()
        };

        if self.plugin.use_joint_termination() {
            self.exec.use_joint_termination();
        }
        self.exec.timeout = self.plugin.wait_timeout();

        if window_size == 0 {
            self.process_individual_packets();
        } else {
            self.process_packet_windows(window_size);
        }

        debug!("stopping the plugin");
        if let Err(e) = self.plugin.stop() {
            warn!(error = format!("{e:#}"), "error stopping processor plugin");
        }
        debug!(
            plugin_packets = self.exec.plugin_packets(),
            passed = self.passed,
            dropped = self.dropped,
            nullified = self.nullified,
            "packet processing thread terminated"
        );
    }

    /// Handle a `ProcessStatus::End`: returns true when the whole pipeline
    /// must stop here, false when the plugin joined cooperative termination
    /// and packets keep flowing.
    fn handle_end(&mut self, joint_done: &mut bool) -> bool {
        if self.plugin.use_joint_termination() {
            if !*joint_done {
                *joint_done = true;
                self.exec.joint_terminate();
            }
            false
        } else {
            debug!("plugin requests termination");
            true
        }
    }

    fn process_individual_packets(&mut self) {
        let mut only_labels = self.plugin.only_labels();
        let mut bitrate_never_modified = true;
        let mut joint_done = false;
        let max_flush_pkt = self.exec.shared.options.max_flush_pkt;

        let (mut output_bitrate, mut br_confidence) = {
            let state = self.exec.shared.state.lock();
            (
                state[self.exec.index].bitrate,
                state[self.exec.index].confidence,
            )
        };

        loop {
            let work = {
                let plugin: &mut dyn ProcessorPlugin = self.plugin.as_mut();
                self.exec.wait_work(1, || plugin.handle_packet_timeout())
            };
            let mut input_end = work.input_end;
            let mut aborted = work.aborted;
            let mut work_count = work.count;

            // Track the input bitrate until the plugin overrides it.
            if bitrate_never_modified {
                if work.bitrate != output_bitrate {
                    self.plugin.handle_bitrate(work.bitrate);
                }
                output_bitrate = work.bitrate;
                br_confidence = work.confidence;
            }

            let mut timeout = work.timeout;
            let (restart_ok, restarted) = self.restart_in_place();
            if !restart_ok {
                timeout = true;
            } else if restarted {
                only_labels = self.plugin.only_labels();
            }

            if timeout {
                self.exec
                    .pass_packets(0, output_bitrate, br_confidence, true, true);
                self.exec.shared.set_error();
                break;
            }
            // The successor aborted: inform the predecessor and stop.
            if aborted && !input_end {
                self.exec
                    .pass_packets(0, output_bitrate, br_confidence, true, true);
                break;
            }
            // No more packets to process: inform the successor and stop.
            if work_count == 0 && input_end {
                self.exec
                    .pass_packets(0, output_bitrate, br_confidence, true, false);
                break;
            }

            let suspended = work.suspended;
            let shared = self.exec.shared.clone();
            let mut pkt_done = 0usize;
            let mut pkt_flush = 0usize;

            while pkt_done < work_count && !aborted {
                let (pkt, meta) = unsafe { shared.buffer.slot_mut(work.first + pkt_done) };
                pkt_done += 1;
                pkt_flush += 1;
                let mut got_new_bitrate = false;
                let flush_hint;

                if !pkt.has_valid_sync() {
                    // Already dropped by a previous stage.
                    self.exec.add_non_plugin_packets(1);
                    flush_hint = false;
                } else {
                    let was_null = pkt.pid() == PID_NULL;
                    meta.set_flush(false);
                    meta.set_bitrate_changed(false);

                    let mut status = ProcessStatus::Ok;
                    if !suspended
                        && !joint_done
                        && (only_labels == LabelSet::none()
                            || meta.labels.intersects(&only_labels))
                    {
                        status = self.plugin.process_packet(pkt, meta);
                        self.exec.add_plugin_packets(1);
                    } else {
                        // Suspended, joint-terminated, or none of the
                        // required labels: pass the packet untouched.
                        self.exec.add_non_plugin_packets(1);
                    }

                    match status {
                        ProcessStatus::Ok => self.passed += 1,
                        ProcessStatus::Null => *pkt = NULL_PACKET,
                        ProcessStatus::Drop => {
                            pkt.mark_dropped();
                            self.dropped += 1;
                        }
                        ProcessStatus::End => {
                            if self.handle_end(&mut joint_done) {
                                // Terminate before this packet: it is not
                                // forwarded.
                                input_end = true;
                                aborted = true;
                                pkt_done -= 1;
                                pkt_flush -= 1;
                                work_count = pkt_done;
                            }
                        }
                    }

                    // Detect nullification, by status or by rewriting.
                    if !was_null && pkt.pid() == PID_NULL {
                        meta.set_nullified(true);
                        self.nullified += 1;
                    }
                    flush_hint = meta.flush();

                    if meta.bitrate_changed() {
                        let (new_bitrate, new_confidence) = self.plugin.bitrate();
                        if !new_bitrate.is_zero() {
                            bitrate_never_modified = false;
                            got_new_bitrate = new_bitrate != output_bitrate;
                            output_bitrate = new_bitrate;
                            br_confidence = new_confidence;
                        }
                    }
                }

                // Flush early on plugin request, on a new bitrate, at the end
                // of the slice, and every max_flush_pkt packets.
                let end_of_work = pkt_done == work_count;
                if flush_hint
                    || got_new_bitrate
                    || end_of_work
                    || (max_flush_pkt > 0 && pkt_flush >= max_flush_pkt)
                {
                    aborted = !self.exec.pass_packets(
                        pkt_flush,
                        output_bitrate,
                        br_confidence,
                        end_of_work && input_end,
                        aborted,
                    );
                    pkt_flush = 0;
                }
            }

            if input_end || aborted {
                break;
            }
        }
    }

    fn process_packet_windows(&mut self, mut window_size: usize) {
        debug!(window_size, "packet processing window size");

        let mut only_labels = self.plugin.only_labels();
        let mut bitrate_never_modified = true;
        let mut joint_done = false;
        let max_flush_pkt = self.exec.shared.options.max_flush_pkt;
        let buffer_count = self.exec.shared.buffer.count();

        let (mut output_bitrate, mut br_confidence) = {
            let state = self.exec.shared.state.lock();
            (
                state[self.exec.index].bitrate,
                state[self.exec.index].confidence,
            )
        };

        let mut input_end = false;
        let mut aborted = false;

        while !input_end && !aborted {
            let shared = self.exec.shared.clone();
            let mut win = PacketWindow::new();
            let mut request_packets = window_size;
            let mut first_packet_index = 0usize;
            let mut allocated_packets = 0usize;
            let mut timeout = false;

            // Build a window of `window_size` usable packets: dropped and
            // label-excluded packets do not count, so the buffer request
            // grows until enough usable packets are present.
            while !aborted && !input_end && !timeout {
                win.clear();

                let work = {
                    let plugin: &mut dyn ProcessorPlugin = self.plugin.as_mut();
                    self.exec
                        .wait_work(request_packets, || plugin.handle_packet_timeout())
                };
                first_packet_index = work.first;
                allocated_packets = work.count;
                input_end = work.input_end;
                aborted = work.aborted;
                timeout = work.timeout;

                if bitrate_never_modified {
                    if work.bitrate != output_bitrate {
                        self.plugin.handle_bitrate(work.bitrate);
                    }
                    output_bitrate = work.bitrate;
                    br_confidence = work.confidence;
                }

                let (restart_ok, restarted) = self.restart_in_place();
                if !restart_ok {
                    timeout = true;
                } else if restarted {
                    only_labels = self.plugin.only_labels();
                    window_size = self.plugin.window_size().max(1);
                }

                if work.suspended || joint_done {
                    // Pass everything through without invoking the plugin,
                    // then keep building (the plugin may be resumed).
                    self.exec.add_non_plugin_packets(allocated_packets as u64);
                    let more = self.exec.pass_packets(
                        allocated_packets,
                        output_bitrate,
                        br_confidence,
                        input_end,
                        aborted,
                    );
                    allocated_packets = 0;
                    if !more {
                        aborted = aborted || !input_end;
                        break;
                    }
                    continue;
                }

                // Collect usable packets; the slice may wrap.
                for offset in 0..allocated_packets {
                    let index = (first_packet_index + offset) % buffer_count;
                    let (pkt, meta) = unsafe { shared.buffer.slot_mut(index) };
                    if pkt.has_valid_sync()
                        && (only_labels == LabelSet::none()
                            || meta.labels.intersects(&only_labels))
                    {
                        win.push(pkt, meta, index);
                    }
                    // Cap the window footprint in the buffer; the unused tail
                    // will come back from the next wait_work.
                    if max_flush_pkt > 0
                        && offset + 1 >= max_flush_pkt
                        && win.len() >= window_size
                        && offset + 1 < allocated_packets
                    {
                        allocated_packets = offset + 1;
                        input_end = false;
                        break;
                    }
                }

                if win.len() >= window_size || allocated_packets < request_packets {
                    // Either enough usable packets, or the buffer cannot
                    // provide more.
                    break;
                }
                request_packets += window_size - win.len();
            }

            if timeout {
                error!("packet wait timeout, aborting processor");
                self.exec.shared.set_error();
                aborted = true;
            }

            // Let the plugin process the window.
            let win_len = win.len();
            let processed = self.plugin.process_window(&mut win);

            if processed < win_len {
                // The plugin wants to terminate at the processed-th packet:
                // nothing after it may be forwarded.
                if self.handle_end(&mut joint_done) {
                    input_end = true;
                    aborted = true;
                    if processed == 0 {
                        allocated_packets = 0;
                    } else {
                        let index = win.buffer_index(processed - 1);
                        allocated_packets = if index >= first_packet_index {
                            index - first_packet_index + 1
                        } else {
                            // The range wraps at the end of the buffer.
                            buffer_count - first_packet_index + index + 1
                        };
                    }
                }
            }

            self.passed += processed.saturating_sub(win.drop_count()) as u64;
            self.dropped += win.drop_count() as u64;
            self.nullified += win.nullify_count() as u64;
            self.exec.add_plugin_packets(processed.min(win_len) as u64);
            self.exec
                .add_non_plugin_packets(allocated_packets.saturating_sub(processed) as u64);

            // Pick up a bitrate reported through the window metadata.
            for i in 0..processed.min(win_len) {
                if win.metadata(i).bitrate_changed() {
                    let (new_bitrate, new_confidence) = self.plugin.bitrate();
                    if !new_bitrate.is_zero() {
                        bitrate_never_modified = false;
                        output_bitrate = new_bitrate;
                        br_confidence = new_confidence;
                    }
                    break;
                }
            }
            drop(win);

            // Pass all allocated packets to the next stage (fewer than
            // allocated in case of termination).
            aborted = !self.exec.pass_packets(
                allocated_packets,
                output_bitrate,
                br_confidence,
                input_end,
                aborted,
            );
        }
    }

    /// Execute a pending restart, temporarily wrapping the plugin box.
    fn restart_in_place(&mut self) -> (bool, bool) {
        if !self.has_pending_restart() {
            return (true, false);
        }
        let plugin = std::mem::replace(&mut self.plugin, Box::new(NoopProcessor));
        let mut wrapped = Plugin::Processor(plugin);
        let result = self.exec.process_pending_restart(&mut wrapped);
        self.plugin = match wrapped {
            Plugin::Processor(p) => p,
            _ => unreachable!("processor slot always holds a processor plugin"),
        };
        result
    }

    fn has_pending_restart(&self) -> bool {
        self.exec.shared.state.lock()[self.exec.index]
            .restart
            .is_some()
    }
}

/// Placeholder plugin used while swapping boxes during a restart.
struct NoopProcessor;

impl ProcessorPlugin for NoopProcessor {
    fn name(&self) -> &str {
        "noop"
    }

    fn process_packet(
        &mut self,
        _pkt: &mut crate::ts::TsPacket,
        _meta: &mut crate::metadata::PacketMetadata,
    ) -> ProcessStatus {
        ProcessStatus::Ok
    }
}
