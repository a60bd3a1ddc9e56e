//! Executor base protocol
//!
//! The two operations every plugin thread lives by: `wait_work` blocks until
//! the executor owns enough packets (or an end/abort/timeout condition), and
//! `pass_packets` transfers ownership of processed packets to the successor,
//! propagating the bitrate and the end-of-input flag forward and the abort
//! flag backward. Restart requests from the control server are executed here,
//! between the two.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, trace, warn};

use crate::bitrate::{BitRate, BitRateConfidence};
use crate::pipeline::{PipelineShared, RestartRequest};
use crate::plugin::Plugin;
use crate::plugins;

/// Result of one `wait_work` call.
#[derive(Debug, Clone, Copy)]
pub(crate) struct WaitResult {
    pub first: usize,
    pub count: usize,
    pub bitrate: BitRate,
    pub confidence: BitRateConfidence,
    /// All remaining packets are in this slice and no more will come.
    pub input_end: bool,
    /// The successor aborted; this stage must abort too.
    pub aborted: bool,
    /// The wait expired and the plugin declined to continue.
    pub timeout: bool,
    pub suspended: bool,
}

/// Per-thread handle on the shared ring.
pub(crate) struct Executor {
    pub shared: Arc<PipelineShared>,
    pub index: usize,
    /// Bound on each `wait_work`; None waits forever.
    pub timeout: Option<Duration>,
}

impl Executor {
    pub fn new(shared: Arc<PipelineShared>, index: usize) -> Self {
        Self {
            shared,
            index,
            timeout: None,
        }
    }

    fn next_index(&self) -> usize {
        (self.index + 1) % self.shared.plugin_count()
    }

    fn prev_index(&self) -> usize {
        (self.index + self.shared.plugin_count() - 1) % self.shared.plugin_count()
    }

    fn is_output(&self) -> bool {
        self.index == self.shared.plugin_count() - 1
    }

    pub fn name(&self) -> String {
        let info = &self.shared.info[self.index];
        if self.shared.options.log_plugin_index {
            format!("{}[{}]", info.name, self.index)
        } else {
            info.name.clone()
        }
    }

    pub fn add_plugin_packets(&self, count: u64) {
        self.shared.counters[self.index]
            .plugin_packets
            .fetch_add(count, Ordering::Relaxed);
    }

    pub fn add_non_plugin_packets(&self, count: u64) {
        self.shared.counters[self.index]
            .non_plugin_packets
            .fetch_add(count, Ordering::Relaxed);
    }

    pub fn total_packets(&self) -> u64 {
        self.shared.counters[self.index].total()
    }

    pub fn plugin_packets(&self) -> u64 {
        self.shared.counters[self.index]
            .plugin_packets
            .load(Ordering::Relaxed)
    }

    /// Wait until this executor owns at least `min_count` packets, the
    /// predecessor announced end of input, the successor aborted, or the
    /// timeout expired. `on_timeout` is the plugin's timeout handler: it runs
    /// under the global mutex and returns true to keep waiting.
    pub fn wait_work(&self, min_count: usize, mut on_timeout: impl FnMut() -> bool) -> WaitResult {
        let size = self.shared.buffer.count();
        let next = self.next_index();

        // Cannot ask for more than the buffer holds.
        let min_count = if min_count > size {
            debug!(
                plugin = %self.name(),
                requested = min_count,
                buffer = size,
                "requests too many packets at a time, clamping to buffer size"
            );
            size
        } else {
            min_count
        };

        let mut state = self.shared.state.lock();
        let mut timeout = false;

        while state[self.index].count < min_count
            && !state[self.index].input_end
            && !timeout
            && !self.shared.aborting[next].load(Ordering::Relaxed)
        {
            let expired = match self.timeout {
                Some(bound) => self.shared.conds[self.index]
                    .wait_for(&mut state, bound)
                    .timed_out(),
                None => {
                    self.shared.conds[self.index].wait(&mut state);
                    false
                }
            };
            timeout = expired && !on_timeout();
        }

        let slot = &state[self.index];
        let count = if timeout {
            0
        } else if slot.first + min_count <= size {
            // Keep the returned slice contiguous up to the wrap point; this
            // still satisfies the requested minimum.
            slot.count.min(size - slot.first)
        } else {
            // The requested minimum does not fit before the wrap point; the
            // caller handles the split range.
            slot.count
        };

        let result = WaitResult {
            first: slot.first,
            count,
            bitrate: slot.bitrate,
            confidence: slot.confidence,
            input_end: slot.input_end && count == slot.count,
            aborted: !self.is_output() && self.shared.aborting[next].load(Ordering::Relaxed),
            timeout,
            suspended: slot.suspended,
        };
        trace!(
            plugin = %self.name(),
            first = result.first,
            count = result.count,
            input_end = result.input_end,
            aborted = result.aborted,
            "wait_work"
        );
        result
    }

    /// Transfer `count` packets to the successor. Returns false when this
    /// stage shall stop (end of input or abort).
    pub fn pass_packets(
        &self,
        count: usize,
        bitrate: BitRate,
        confidence: BitRateConfidence,
        input_end: bool,
        aborted: bool,
    ) -> bool {
        trace!(
            plugin = %self.name(),
            count,
            input_end,
            aborted,
            "pass_packets"
        );
        let size = self.shared.buffer.count();
        let next = self.next_index();
        let prev = self.prev_index();

        let mut state = self.shared.state.lock();
        debug_assert!(count <= state[self.index].count);

        // Shrink our slice from the head, grow the successor's tail.
        state[self.index].first = (state[self.index].first + count) % size;
        state[self.index].count -= count;
        state[next].count += count;

        // The slices always partition the whole buffer, and each one starts
        // where its successor's ends.
        #[cfg(debug_assertions)]
        {
            let total: usize = state.iter().map(|s| s.count).sum();
            debug_assert_eq!(total, size);
            for i in 0..state.len() {
                let j = (i + 1) % state.len();
                debug_assert_eq!(state[i].first, (state[j].first + state[j].count) % size);
            }
        }

        // Propagate stream state forward.
        state[next].bitrate = bitrate;
        state[next].confidence = confidence;
        state[next].input_end = state[next].input_end || input_end;

        if count > 0 || input_end {
            self.shared.conds[next].notify_all();
        }

        // Force this stage to abort when the successor aborted, except on the
        // output-to-input edge where no packets propagate.
        let aborted =
            aborted || (!self.is_output() && self.shared.aborting[next].load(Ordering::Relaxed));

        if aborted {
            self.shared.aborting[self.index].store(true, Ordering::Relaxed);
            self.shared.conds[prev].notify_all();
        }

        !input_end && !aborted
    }

    /// Put this executor in an abort state and wake the predecessor.
    pub fn set_abort(&self) {
        let _state = self.shared.state.lock();
        self.shared.aborting[self.index].store(true, Ordering::Relaxed);
        self.shared.conds[self.prev_index()].notify_all();
    }

    /// True when this stage is suspended.
    pub fn suspended(&self) -> bool {
        self.shared.state.lock()[self.index].suspended
    }

    /// This stage's own abort flag (set by the control server or a failed
    /// downstream stage).
    pub fn self_aborting(&self) -> bool {
        self.shared.aborting[self.index].load(Ordering::Relaxed)
    }

    /// Execute a pending restart request, if any. Returns `(success,
    /// restarted)`: `restarted` tells whether a restart was attempted,
    /// `success` is false only when both the new and the previous
    /// configuration failed to start.
    pub fn process_pending_restart(&self, plugin: &mut Plugin) -> (bool, bool) {
        let request = {
            let mut state = self.shared.state.lock();
            state[self.index].restart.take()
        };
        let Some(request) = request else {
            return (true, false);
        };
        let success = self.execute_restart(plugin, request);
        if !success {
            self.shared.set_error();
        }
        (success, true)
    }

    fn execute_restart(&self, plugin: &mut Plugin, request: RestartRequest) -> bool {
        let info = &self.shared.info[self.index];
        let mut messages = Vec::new();
        debug!(plugin = %self.name(), "restarting due to remote control");
        messages.push(format!("restarting plugin {}", info.name));

        // Stop the current instance first.
        if let Err(e) = stop_plugin(plugin) {
            warn!(plugin = %self.name(), error = %e, "error while stopping plugin for restart");
        }
        // Reset plugin session accounting.
        self.shared.counters[self.index]
            .plugin_packets
            .store(0, Ordering::Relaxed);
        self.shared.counters[self.index]
            .non_plugin_packets
            .store(0, Ordering::Relaxed);

        let previous_args = info.args.lock().clone();
        let success = match &request.args {
            None => {
                // Same arguments: just start again.
                match start_plugin(plugin) {
                    Ok(()) => true,
                    Err(e) => {
                        messages.push(format!("failed to restart plugin {}: {e:#}", info.name));
                        false
                    }
                }
            }
            Some(new_args) => {
                match self.recreate(plugin, new_args) {
                    Ok(()) => {
                        *info.args.lock() = new_args.clone();
                        true
                    }
                    Err(e) => {
                        messages.push(format!(
                            "failed to restart plugin {} with new arguments, restarting with previous parameters: {e:#}",
                            info.name
                        ));
                        // Fall back to the previous configuration.
                        match self.recreate(plugin, &previous_args) {
                            Ok(()) => true,
                            Err(e) => {
                                messages.push(format!(
                                    "failed to restart plugin {} with previous parameters: {e:#}",
                                    info.name
                                ));
                                false
                            }
                        }
                    }
                }
            }
        };

        debug!(plugin = %self.name(), success, "restarted plugin");
        request.done.complete(success, messages);
        success
    }

    /// Build a fresh plugin instance from the registry and start it.
    fn recreate(&self, plugin: &mut Plugin, args: &[String]) -> anyhow::Result<()> {
        let info = &self.shared.info[self.index];
        let mut fresh = match info.kind {
            'I' => Plugin::Input(plugins::create_input(&info.name, args)?),
            'O' => Plugin::Output(plugins::create_output(&info.name, args)?),
            _ => Plugin::Processor(plugins::create_processor(&info.name, args)?),
        };
        start_plugin(&mut fresh)?;
        *plugin = fresh;
        Ok(())
    }

    /// Register this stage as a joint-termination user.
    pub fn use_joint_termination(&self) {
        self.shared.joint.lock().users += 1;
    }

    /// Record that this stage's plugin declared its joint termination.
    pub fn joint_terminate(&self) {
        let total = self.total_packets();
        let mut joint = self.shared.joint.lock();
        joint.terminated += 1;
        joint.limit = joint.limit.max(total);
        debug!(
            plugin = %self.name(),
            limit = joint.limit,
            "plugin joined cooperative termination"
        );
    }
}

pub(crate) fn start_plugin(plugin: &mut Plugin) -> anyhow::Result<()> {
    match plugin {
        Plugin::Input(p) => p.start(),
        Plugin::Processor(p) => p.start(),
        Plugin::Output(p) => p.start(),
    }
}

pub(crate) fn stop_plugin(plugin: &mut Plugin) -> anyhow::Result<()> {
    match plugin {
        Plugin::Input(p) => p.stop(),
        Plugin::Processor(p) => p.stop(),
        Plugin::Output(p) => p.stop(),
    }
}
