//! Plugin pipeline engine
//!
//! One thread per plugin, all sharing a single circular packet buffer. Each
//! executor owns a moving slice of the buffer described by `(first, count)`;
//! packets travel by transferring slice ownership from one executor to the
//! next around the ring: input, processors, output, and back to input which
//! reuses the freed slots. All bookkeeping lives under one global mutex with
//! one condition variable per executor.

pub mod control;
pub mod controller;
pub mod executor;
pub mod input;
pub mod output;
pub mod processor;
pub mod window;

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU64};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::bitrate::{BitRate, BitRateConfidence};
use crate::buffer::{PacketBuffer, DEFAULT_BUFFER_SIZE};

/// Options of the control server.
#[derive(Debug, Clone)]
pub struct ControlOptions {
    /// TCP port of the control server; None disables it.
    pub port: Option<u16>,
    /// Local bind address.
    pub local: IpAddr,
    /// Allowed source addresses. The local address is always allowed.
    pub sources: Vec<IpAddr>,
    /// Receive timeout of each control command.
    pub timeout: Duration,
    /// Set the reuse-port socket option.
    pub reuse: bool,
}

impl Default for ControlOptions {
    fn default() -> Self {
        Self {
            port: None,
            local: IpAddr::V4(Ipv4Addr::LOCALHOST),
            sources: Vec::new(),
            timeout: Duration::from_secs(5),
            reuse: false,
        }
    }
}

/// Global options of the packet processing pipeline.
#[derive(Debug, Clone)]
pub struct TspOptions {
    /// Size of the global packet buffer in bytes.
    pub buffer_size: usize,
    /// Maximum packets before an implicit flush in per-packet mode.
    pub max_flush_pkt: usize,
    /// Maximum packets per input operation (0 = buffer-limited).
    pub max_input_pkt: usize,
    /// Maximum packets per output operation (0 = unlimited).
    pub max_output_pkt: usize,
    /// Number of packets to preload before starting (0 = half the buffer).
    pub init_input_pkt: usize,
    /// Artificial input stuffing: null packets per cycle.
    pub instuff_nullpkt: u64,
    /// Artificial input stuffing: input packets per cycle (0 disables).
    pub instuff_inpkt: u64,
    /// Null packets inserted before the first input packet.
    pub instuff_start: u64,
    /// Null packets inserted after the last input packet.
    pub instuff_stop: u64,
    /// Interval between two bitrate re-evaluations.
    pub bitrate_adj: Duration,
    /// Packet interval between re-evaluations while the bitrate is unknown.
    pub init_bitrate_adj: u64,
    /// User-forced input bitrate (overrides all evaluation).
    pub fixed_bitrate: BitRate,
    /// Abort the input when a receive operation exceeds this timeout.
    pub receive_timeout: Option<Duration>,
    /// After end of input, wait before reporting it (zero = forever).
    pub final_wait: Option<Duration>,
    /// Show plugin indexes in log lines.
    pub log_plugin_index: bool,
    /// Periodic resource monitoring.
    pub monitor: bool,
    /// Optional Prometheus listener address for `--monitor`.
    pub monitor_address: Option<SocketAddr>,
    /// Control server configuration.
    pub control: ControlOptions,
}

impl Default for TspOptions {
    fn default() -> Self {
        Self {
            buffer_size: DEFAULT_BUFFER_SIZE,
            max_flush_pkt: 10_000,
            max_input_pkt: 0,
            max_output_pkt: 0,
            init_input_pkt: 0,
            instuff_nullpkt: 0,
            instuff_inpkt: 0,
            instuff_start: 0,
            instuff_stop: 0,
            bitrate_adj: Duration::from_secs(5),
            init_bitrate_adj: 1000,
            fixed_bitrate: BitRate::ZERO,
            receive_timeout: None,
            final_wait: None,
            log_plugin_index: false,
            monitor: false,
            monitor_address: None,
            control: ControlOptions::default(),
        }
    }
}

/// Outcome of a plugin restart, reported back to the requesting thread.
pub(crate) struct RestartDone {
    pub state: Mutex<RestartState>,
    pub cond: Condvar,
}

pub(crate) struct RestartState {
    pub completed: bool,
    pub success: bool,
    pub messages: Vec<String>,
}

impl RestartDone {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(RestartState {
                completed: false,
                success: false,
                messages: Vec::new(),
            }),
            cond: Condvar::new(),
        })
    }

    /// Block until the executor thread completed the restart.
    pub fn wait(&self) -> (bool, Vec<String>) {
        let mut state = self.state.lock();
        while !state.completed {
            self.cond.wait(&mut state);
        }
        (state.success, state.messages.clone())
    }

    pub fn complete(&self, success: bool, messages: Vec<String>) {
        let mut state = self.state.lock();
        state.completed = true;
        state.success = success;
        state.messages = messages;
        self.cond.notify_all();
    }
}

/// A pending restart request, set by the control server and executed by the
/// owning plugin thread between `wait_work` and `pass_packets`.
pub(crate) struct RestartRequest {
    /// New arguments, or None to restart with the same arguments.
    pub args: Option<Vec<String>>,
    pub done: Arc<RestartDone>,
}

/// Buffer slice and stream state of one executor, under the global mutex.
#[derive(Default)]
pub(crate) struct SlotState {
    pub first: usize,
    pub count: usize,
    pub input_end: bool,
    pub bitrate: BitRate,
    pub confidence: BitRateConfidence,
    pub suspended: bool,
    pub restart: Option<RestartRequest>,
}

/// Joint termination accounting: plugins that declared joint termination all
/// agree on a last packet index; the output stops there.
#[derive(Default)]
pub(crate) struct JointState {
    pub users: usize,
    pub terminated: usize,
    pub limit: u64,
}

impl JointState {
    /// Packet limit for the output thread, if all joint plugins terminated.
    pub fn output_limit(&self) -> Option<u64> {
        (self.users > 0 && self.terminated >= self.users).then_some(self.limit)
    }
}

/// Descriptive identity of one plugin, for logs and the control server.
pub(crate) struct PluginInfo {
    pub kind: char,
    pub name: String,
    pub args: Mutex<Vec<String>>,
}

/// Packet accounting of one executor.
#[derive(Default)]
pub(crate) struct StageCounters {
    /// Packets submitted to the plugin.
    pub plugin_packets: AtomicU64,
    /// Packets traversing the stage without plugin involvement.
    pub non_plugin_packets: AtomicU64,
}

impl StageCounters {
    pub fn total(&self) -> u64 {
        use std::sync::atomic::Ordering;
        self.plugin_packets.load(Ordering::Relaxed)
            + self.non_plugin_packets.load(Ordering::Relaxed)
    }
}

/// Everything the executor ring shares: the packet buffer, the slice
/// bookkeeping, one condition variable and one abort flag per executor.
pub(crate) struct PipelineShared {
    pub buffer: PacketBuffer,
    pub options: TspOptions,
    /// Slot states, indexed like the plugin chain (0 = input, last = output).
    pub state: Mutex<Vec<SlotState>>,
    /// One `to_do` condition per executor.
    pub conds: Vec<Condvar>,
    /// Abort flags, written under the mutex, readable without it.
    pub aborting: Vec<AtomicBool>,
    pub joint: Mutex<JointState>,
    pub info: Vec<PluginInfo>,
    pub counters: Vec<StageCounters>,
    /// A processing (not configuration) error happened somewhere.
    pub error: AtomicBool,
}

impl PipelineShared {
    pub fn new(options: TspOptions, info: Vec<PluginInfo>) -> Arc<Self> {
        let n = info.len();
        let buffer = PacketBuffer::with_size(options.buffer_size);
        Arc::new(Self {
            buffer,
            options,
            state: Mutex::new((0..n).map(|_| SlotState::default()).collect()),
            conds: (0..n).map(|_| Condvar::new()).collect(),
            aborting: (0..n).map(|_| AtomicBool::new(false)).collect(),
            joint: Mutex::new(JointState::default()),
            info,
            counters: (0..n).map(|_| StageCounters::default()).collect(),
            error: AtomicBool::new(false),
        })
    }

    pub fn plugin_count(&self) -> usize {
        self.info.len()
    }

    pub fn set_error(&self) {
        use std::sync::atomic::Ordering;
        self.error.store(true, Ordering::Relaxed);
    }
}
