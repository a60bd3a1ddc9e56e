//! Multi-input multiplexer
//!
//! Merges N input streams into one output stream at a fixed bitrate. A
//! monotonic clock paces the muxing loop: every cycle computes how many
//! packets should have been sent by now and fills the gap from, in order, the
//! due PSI/SI packetizers, the input plugins (round-robin) and the EIT queue,
//! with null packets as filler.

pub mod core;
pub mod input;
pub mod output;

pub use self::core::TsMuxer;

use std::time::Duration;

use crate::bitrate::BitRate;

/// Which tables of a kind are collected from the inputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableScope {
    /// Collect nothing.
    None,
    /// Collect actual-TS tables only.
    Actual,
    /// Collect actual and other-TS tables.
    All,
}

/// Options of the multiplexer.
#[derive(Debug, Clone)]
pub struct MuxerOptions {
    /// Target output bitrate. Mandatory unless the output plugin reports one.
    pub output_bitrate: BitRate,
    /// Duration of one muxing cycle.
    pub cadence: Duration,
    /// Capacity of each input queue, in packets.
    pub in_buffer_packets: usize,
    /// Capacity of the output queue, in packets.
    pub out_buffer_packets: usize,
    /// Maximum packets per input receive operation.
    pub max_input_packets: usize,
    /// On input overflow, drop the oldest packets instead of blocking.
    pub lossy_input: bool,
    /// Packets reclaimed at once in lossy mode.
    pub lossy_reclaim: usize,
    /// Terminate an input at its first end of stream instead of restarting it.
    pub input_once: bool,
    /// Delay before restarting a failed input plugin.
    pub input_restart_delay: Duration,
    /// Log PSI conflicts once and continue instead of aborting.
    pub ignore_conflicts: bool,
    /// Transport stream id of the output stream.
    pub output_ts_id: u16,
    /// Original network id of the output stream.
    pub output_network_id: u16,
    pub nit_scope: TableScope,
    pub sdt_scope: TableScope,
    pub eit_scope: TableScope,
    /// Sub-bitrates of the rebuilt tables in the output stream.
    pub pat_bitrate: BitRate,
    pub cat_bitrate: BitRate,
    pub nit_bitrate: BitRate,
    pub sdt_bitrate: BitRate,
    /// Force the TDT/TOT time reference input (default: first input with a
    /// valid time).
    pub time_input_index: Option<usize>,
}

impl Default for MuxerOptions {
    fn default() -> Self {
        Self {
            output_bitrate: BitRate::ZERO,
            cadence: Duration::from_millis(1),
            in_buffer_packets: 512,
            out_buffer_packets: 512,
            max_input_packets: 128,
            lossy_input: false,
            lossy_reclaim: 16,
            input_once: false,
            input_restart_delay: Duration::from_millis(500),
            ignore_conflicts: false,
            output_ts_id: 1,
            output_network_id: 1,
            nit_scope: TableScope::Actual,
            sdt_scope: TableScope::Actual,
            eit_scope: TableScope::Actual,
            pat_bitrate: BitRate(15_000),
            cat_bitrate: BitRate(3_000),
            nit_bitrate: BitRate(3_000),
            sdt_bitrate: BitRate(3_000),
            time_input_index: None,
        }
    }
}
