//! Input stage
//!
//! Runs the input plugin: preloads the buffer before the other threads start,
//! validates the sync byte of every received packet, inserts artificial
//! stuffing when configured, evaluates the input bitrate (override, plugin,
//! PCR analysis, DTS fallback) and re-evaluates it periodically.

use std::time::Instant;

use tracing::{debug, error, info, warn};

use crate::bitrate::{BitRate, BitRateConfidence, DtsAnalyzer, PcrAnalyzer};
use crate::metadata::TimeSource;
use crate::pipeline::executor::Executor;
use crate::platform::monotonic_now;
use crate::plugin::InputPlugin;
use crate::ts::{NULL_PACKET, PKT_SIZE};
use crate::watchdog::Watchdog;

/// Minimum analyzer sampling before a bitrate is trusted.
const MIN_ANALYZE_PID: usize = 1;
const MIN_ANALYZE_PCR: u64 = 32;
const MIN_ANALYZE_DTS: u64 = 32;

pub(crate) struct InputStage {
    exec: Executor,
    plugin: Box<dyn InputPlugin>,
    sync_lost: bool,
    plugin_completed: bool,
    instuff_start_remain: u64,
    instuff_stop_remain: u64,
    instuff_nullpkt_remain: u64,
    instuff_inpkt_remain: u64,
    pcr_analyzer: PcrAnalyzer,
    dts_analyzer: DtsAnalyzer,
    use_dts_analyzer: bool,
    watchdog: Option<Watchdog>,
}

impl InputStage {
    pub fn new(exec: Executor, mut plugin: Box<dyn InputPlugin>) -> Self {
        let opts = &exec.shared.options;

        // Propose the receive timeout to the plugin; plugins that cannot
        // bound their own receive get a watchdog aborting them instead.
        let mut watchdog = None;
        if let Some(timeout) = opts.receive_timeout {
            if !plugin.set_receive_timeout(timeout) {
                debug!(
                    plugin = plugin.name(),
                    "input plugin does not support receive timeout, using watchdog and abort"
                );
                let abort = plugin.abort_handle();
                let name = plugin.name().to_string();
                watchdog = Some(Watchdog::new(
                    move |_id| {
                        debug!(plugin = %name, "receive timeout, aborting input");
                        match &abort {
                            Some(f) => f(),
                            None => warn!(
                                plugin = %name,
                                "failed to abort input on receive timeout, not supported by this plugin"
                            ),
                        }
                    },
                    timeout,
                    0,
                ));
            }
        }

        Self {
            instuff_start_remain: opts.instuff_start,
            instuff_stop_remain: opts.instuff_stop,
            exec,
            plugin,
            sync_lost: false,
            plugin_completed: false,
            instuff_nullpkt_remain: 0,
            instuff_inpkt_remain: 0,
            pcr_analyzer: PcrAnalyzer::new(MIN_ANALYZE_PID, MIN_ANALYZE_PCR),
            dts_analyzer: DtsAnalyzer::new(MIN_ANALYZE_PID, MIN_ANALYZE_DTS),
            use_dts_analyzer: false,
            watchdog,
        }
    }

    /// Preload the buffer before the executor threads start. Returns the
    /// number of packets loaded and the initial bitrate.
    pub fn preload(&mut self) -> (usize, BitRate, BitRateConfidence) {
        let buffer_count = self.exec.shared.buffer.count();
        let opts = &self.exec.shared.options;
        let init_packets = if opts.init_input_pkt == 0 {
            buffer_count / 2
        } else {
            opts.init_input_pkt.min(buffer_count)
        };

        let read = self.receive_and_stuff(0, init_packets);
        if read == 0 {
            debug!("no initial packet read");
            return (0, BitRate::ZERO, BitRateConfidence::Low);
        }
        debug!(
            packets = read,
            bytes = read * PKT_SIZE,
            "initial buffer load"
        );

        let (bitrate, confidence) = self.evaluate_bitrate();
        if bitrate.is_zero() {
            info!("unknown initial input bitrate");
        } else {
            info!(%bitrate, "initial input bitrate");
        }
        (read, bitrate, confidence)
    }

    /// Input bitrate by decreasing priority: user override, plugin value,
    /// continuous PCR analysis, DTS analysis (sticky once used).
    fn evaluate_bitrate(&mut self) -> (BitRate, BitRateConfidence) {
        let opts = &self.exec.shared.options;
        let (mut bitrate, mut confidence) = if !opts.fixed_bitrate.is_zero() {
            (opts.fixed_bitrate, BitRateConfidence::Override)
        } else {
            self.plugin.bitrate()
        };

        if !bitrate.is_zero() {
            // Adjust for artificial stuffing to remain consistent with
            // wall-clock time.
            if opts.instuff_inpkt != 0 {
                bitrate = BitRate(
                    bitrate.0 * (opts.instuff_nullpkt + opts.instuff_inpkt) / opts.instuff_inpkt,
                );
            }
        } else if !self.use_dts_analyzer && self.pcr_analyzer.bitrate_is_valid() {
            bitrate = self.pcr_analyzer.bitrate();
            confidence = BitRateConfidence::PcrContinuous;
        } else {
            // No PCR-based bitrate yet, fall back to DTS analysis on video
            // PIDs. Once the DTS analyzer has been used, stick to it.
            self.use_dts_analyzer = self.use_dts_analyzer || self.dts_analyzer.bitrate_is_valid();
            bitrate = if self.use_dts_analyzer {
                self.dts_analyzer.bitrate()
            } else {
                BitRate::ZERO
            };
            confidence = BitRateConfidence::PcrContinuous;
        }
        (bitrate, confidence)
    }

    /// Fill `max_packets` slots starting at `index` with null packets.
    fn receive_null_packets(&mut self, index: usize, max_packets: usize) -> usize {
        let shared = self.exec.shared.clone();
        let pkts = unsafe { shared.buffer.packets_mut(index, max_packets) };
        let metas = unsafe { shared.buffer.metadata_mut(index, max_packets) };
        for (pkt, meta) in pkts.iter_mut().zip(metas.iter_mut()) {
            *pkt = NULL_PACKET;
            self.pcr_analyzer.feed_packet(pkt);
            self.dts_analyzer.feed_packet(pkt);
            meta.reset();
            meta.set_input_stuffing(true);
        }
        self.exec.add_non_plugin_packets(max_packets as u64);
        max_packets
    }

    /// Receive packets from the plugin and validate them.
    fn receive_and_validate(&mut self, index: usize, max_packets: usize) -> usize {
        if self.sync_lost || max_packets == 0 {
            return 0;
        }

        let shared = self.exec.shared.clone();
        let pkts = unsafe { shared.buffer.packets_mut(index, max_packets) };
        let metas = unsafe { shared.buffer.metadata_mut(index, max_packets) };
        for meta in metas.iter_mut() {
            meta.reset();
        }

        if let Some(dog) = &self.watchdog {
            dog.restart();
        }
        let mut count = match self.plugin.receive(pkts, metas) {
            Ok(n) => n.min(max_packets),
            Err(e) => {
                error!(plugin = self.plugin.name(), error = format!("{e:#}"), "input error");
                self.exec.shared.set_error();
                0
            }
        };
        self.plugin_completed = self.plugin_completed || count == 0;
        if let Some(dog) = &self.watchdog {
            dog.suspend();
        }

        // Stamp packets with the monotonic clock when the plugin provided no
        // timestamps. Checking the first packet is enough: plugins stamp all
        // or none.
        if count > 0 && !metas[0].has_input_stamp() {
            let now = monotonic_now().as_nanos() as u64;
            for meta in metas[..count].iter_mut() {
                meta.set_input_stamp(now, TimeSource::Tsp);
            }
        }

        // Validate the sync byte of every packet.
        for n in 0..count {
            if pkts[n].has_valid_sync() {
                self.exec.add_plugin_packets(1);
                self.pcr_analyzer.feed_packet(&pkts[n]);
                self.dts_analyzer.feed_packet(&pkts[n]);
            } else {
                error!(
                    packets = self.exec.plugin_packets(),
                    got = format!("{:#04X}", pkts[n].b[0]),
                    "synchronization lost"
                );
                if n > 0 {
                    debug!(
                        "content of packet before loss of synchronization: {:02X?}",
                        &pkts[n - 1].b[..]
                    );
                }
                let dump_count = 3.min(count - n);
                for (i, pkt) in pkts[n..n + dump_count].iter().enumerate() {
                    debug!("data at loss of synchronization (+{i}): {:02X?}", &pkt.b[..32]);
                }
                // Ignore this packet and everything after it.
                count = n;
                self.sync_lost = true;
                self.exec.shared.set_error();
                break;
            }
        }
        count
    }

    /// Receive packets, weaving in the artificial stuffing pattern.
    fn receive_and_stuff(&mut self, mut index: usize, max_packets: usize) -> usize {
        let opts_inpkt = self.exec.shared.options.instuff_inpkt;
        let opts_nullpkt = self.exec.shared.options.instuff_nullpkt;
        let mut done = 0usize;
        let mut remain = max_packets;

        // Initial stuffing, once.
        while self.instuff_start_remain > 0 && remain > 0 {
            self.receive_null_packets(index, 1);
            self.instuff_start_remain -= 1;
            index += 1;
            remain -= 1;
            done += 1;
        }

        if opts_inpkt == 0 {
            // No stuffing cycle, plain receive.
            if remain > 0 {
                done += self.receive_and_validate(index, remain);
            }
            return done;
        }

        // Alternate null and input packets per the configured cycle.
        while remain > 0 {
            let nulls = (self.instuff_nullpkt_remain.min(remain as u64)) as usize;
            let count = self.receive_null_packets(index, nulls);
            self.instuff_nullpkt_remain -= count as u64;
            index += count;
            remain -= count;
            done += count;

            if remain == 0 {
                break;
            }
            if self.instuff_nullpkt_remain == 0 && self.instuff_inpkt_remain == 0 {
                self.instuff_inpkt_remain = opts_inpkt;
            }

            let max_input = (remain as u64).min(self.instuff_inpkt_remain) as usize;
            let count = self.receive_and_validate(index, max_input);
            index += count;
            remain -= count;
            done += count;
            self.instuff_inpkt_remain -= count as u64;

            if self.instuff_nullpkt_remain == 0 && self.instuff_inpkt_remain == 0 {
                self.instuff_nullpkt_remain = opts_nullpkt;
            }
            if count < max_input {
                break;
            }
        }
        done
    }

    /// Pass received packets downstream, honoring `--final-wait`.
    fn pass_input_packets(
        &self,
        mut count: usize,
        bitrate: BitRate,
        confidence: BitRateConfidence,
        input_end: bool,
    ) {
        if input_end {
            if let Some(wait) = self.exec.shared.options.final_wait {
                if count > 0 {
                    self.exec.pass_packets(count, bitrate, confidence, false, false);
                    count = 0;
                }
                debug!(?wait, "final wait after end of input");
                if wait.is_zero() {
                    // Wait forever, until the process is interrupted. Poll the
                    // abort flag so a control-server exit still terminates.
                    while !self.exec.self_aborting() {
                        std::thread::sleep(std::time::Duration::from_secs(1));
                    }
                } else {
                    std::thread::sleep(wait);
                }
                debug!("end of final wait");
            }
        }
        // Never propagate abort backward from the input: the "previous" stage
        // is the output one.
        self.exec.pass_packets(count, bitrate, confidence, input_end, false);
    }

    /// Input thread main loop.
    pub fn run(mut self) {
        debug!(plugin = self.plugin.name(), "input thread started");

        let opts_bitrate_adj = self.exec.shared.options.bitrate_adj;
        let opts_init_bitrate_adj = self.exec.shared.options.init_bitrate_adj;
        let fixed_bitrate = self.exec.shared.options.fixed_bitrate;
        let max_input_pkt = self.exec.shared.options.max_input_pkt;

        // The preload already established the initial bitrate.
        let (mut current_bitrate, mut current_confidence) = {
            let state = self.exec.shared.state.lock();
            (
                state[self.exec.index].bitrate,
                state[self.exec.index].confidence,
            )
        };

        let mut bitrate_due_time = Instant::now() + opts_bitrate_adj;
        let mut bitrate_due_packet = opts_init_bitrate_adj;
        let mut aborted = false;

        loop {
            // Wait for free space in the buffer. The bitrate and input_end
            // results do not apply to the input stage.
            let mut plugin = crate::plugin::Plugin::Input(self.plugin);
            let work = self.exec.wait_work(1, || false);
            let (restart_ok, _) = self.exec.process_pending_restart(&mut plugin);
            self.plugin = match plugin {
                crate::plugin::Plugin::Input(p) => p,
                _ => unreachable!("input slot always holds an input plugin"),
            };

            // The next thread gave up: our packets are useless, do not even
            // add the trailing stuffing.
            if work.aborted {
                aborted = true;
                break;
            }
            if work.timeout || !restart_ok {
                self.pass_input_packets(0, current_bitrate, current_confidence, true);
                aborted = true;
                break;
            }

            let mut pkt_max = work.count;
            if max_input_pkt > 0 {
                pkt_max = pkt_max.min(max_input_pkt);
            }

            // Read packets, unless the plugin already completed.
            let mut pkt_read = 0;
            if !self.plugin_completed {
                pkt_read = self.receive_and_stuff(work.first, pkt_max);
            }

            // Trailing stuffing after the plugin completed.
            if self.plugin_completed && self.instuff_stop_remain > 0 && pkt_read < pkt_max {
                let count = self.receive_null_packets(
                    work.first + pkt_read,
                    (self.instuff_stop_remain.min((pkt_max - pkt_read) as u64)) as usize,
                );
                pkt_read += count;
                self.instuff_stop_remain -= count as u64;
            }

            let input_end = self.plugin_completed && self.instuff_stop_remain == 0;

            // Periodic bitrate re-evaluation: every `init_bitrate_adj`
            // packets while unknown, every `bitrate_adj` afterwards.
            let now = Instant::now();
            if fixed_bitrate.is_zero()
                && ((current_bitrate.is_zero() && self.exec.plugin_packets() >= bitrate_due_packet)
                    || now >= bitrate_due_time)
            {
                if current_bitrate.is_zero() {
                    while bitrate_due_packet <= self.exec.plugin_packets() {
                        bitrate_due_packet += opts_init_bitrate_adj;
                    }
                }
                if now >= bitrate_due_time {
                    bitrate_due_time = now + opts_bitrate_adj;
                }
                let (bitrate, confidence) = self.evaluate_bitrate();
                if !bitrate.is_zero() {
                    current_bitrate = bitrate;
                    current_confidence = confidence;
                    debug!(%bitrate, "input: got bitrate");
                }
            }

            self.pass_input_packets(pkt_read, current_bitrate, current_confidence, input_end);
            if input_end {
                break;
            }
        }

        debug!("stopping the input plugin");
        if let Err(e) = self.plugin.stop() {
            warn!(error = format!("{e:#}"), "error stopping input plugin");
        }
        debug!(
            total = self.exec.total_packets(),
            aborted,
            "input thread terminated"
        );
    }
}
