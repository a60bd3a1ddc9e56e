//! Plugin interfaces
//!
//! A pipeline is one input plugin, zero or more packet processor plugins and
//! one output plugin. The engine talks to them through the three traits below
//! and moves each one into its executor thread; a plugin needing cross-thread
//! interaction (aborting a blocked receive) exposes an abort handle.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;

use crate::bitrate::{BitRate, BitRateConfidence};
use crate::metadata::{LabelSet, PacketMetadata};
use crate::pipeline::window::PacketWindow;
use crate::ts::TsPacket;

/// Verdict of a processor plugin on one packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessStatus {
    /// Pass the packet
    Ok,
    /// Replace the packet with a complete null packet
    Null,
    /// Drop the packet
    Drop,
    /// Terminate the stream at this packet
    End,
}

/// Callable from any thread to abort a blocked receive operation.
pub type InputAbort = Arc<dyn Fn() + Send + Sync>;

/// Stream source. `receive` blocks inside the plugin; everything else is
/// engine bookkeeping.
pub trait InputPlugin: Send {
    fn name(&self) -> &str;

    fn start(&mut self) -> Result<()> {
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        Ok(())
    }

    /// Fill `pkts` (with parallel metadata) and return the number of packets
    /// read. Zero means end of input.
    fn receive(&mut self, pkts: &mut [TsPacket], meta: &mut [PacketMetadata]) -> Result<usize>;

    /// Bitrate known to the plugin, zero when unknown.
    fn bitrate(&self) -> (BitRate, BitRateConfidence) {
        (BitRate::ZERO, BitRateConfidence::Low)
    }

    /// Ask the plugin to bound its own receive operations. Returns false when
    /// unsupported; the engine then uses a watchdog instead.
    fn set_receive_timeout(&mut self, _timeout: Duration) -> bool {
        false
    }

    /// Handle used to abort a blocked `receive` from another thread.
    fn abort_handle(&self) -> Option<InputAbort> {
        None
    }
}

/// Packet transformation stage.
pub trait ProcessorPlugin: Send {
    fn name(&self) -> &str;

    fn start(&mut self) -> Result<()> {
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        Ok(())
    }

    /// Process one packet in place.
    fn process_packet(&mut self, pkt: &mut TsPacket, meta: &mut PacketMetadata) -> ProcessStatus;

    /// Process a whole window. Returns the number of logical packets
    /// consumed; anything less than `win.len()` terminates the stream at that
    /// packet. The default forwards to `process_packet`.
    fn process_window(&mut self, win: &mut PacketWindow<'_>) -> usize {
        for i in 0..win.len() {
            let status = {
                let (pkt, meta) = win.packet_and_metadata_mut(i);
                self.process_packet(pkt, meta)
            };
            match status {
                ProcessStatus::Ok => {}
                ProcessStatus::Null => win.nullify(i),
                ProcessStatus::Drop => win.drop_packet(i),
                ProcessStatus::End => return i,
            }
        }
        win.len()
    }

    /// Preferred packet window size; zero selects per-packet processing.
    fn window_size(&self) -> usize {
        0
    }

    /// Restrict processing to packets carrying one of these labels.
    fn only_labels(&self) -> LabelSet {
        LabelSet::none()
    }

    /// Bitrate reported by the plugin after it flagged a change, zero when
    /// unknown.
    fn bitrate(&self) -> (BitRate, BitRateConfidence) {
        (BitRate::ZERO, BitRateConfidence::Low)
    }

    /// Invoked when the pipeline input bitrate changes.
    fn handle_bitrate(&mut self, _bitrate: BitRate) {}

    /// Bound on each wait for packets; None waits forever.
    fn wait_timeout(&self) -> Option<Duration> {
        None
    }

    /// Invoked when the packet wait times out. Returning false aborts the
    /// stage.
    fn handle_packet_timeout(&mut self) -> bool {
        false
    }

    /// Plugin requests cooperative shutdown accounting: when true, a
    /// `ProcessStatus::End` joins the termination point of the other
    /// joint-terminating plugins instead of stopping the pipeline at once.
    fn use_joint_termination(&self) -> bool {
        false
    }
}

/// Stream sink.
pub trait OutputPlugin: Send {
    fn name(&self) -> &str;

    fn start(&mut self) -> Result<()> {
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        Ok(())
    }

    /// Send a batch of packets. An error aborts the pipeline.
    fn send(&mut self, pkts: &[TsPacket], meta: &[PacketMetadata]) -> Result<()>;

    fn bitrate(&self) -> (BitRate, BitRateConfidence) {
        (BitRate::ZERO, BitRateConfidence::Low)
    }
}

/// A plugin of any kind, as placed in the chain.
pub enum Plugin {
    Input(Box<dyn InputPlugin>),
    Processor(Box<dyn ProcessorPlugin>),
    Output(Box<dyn OutputPlugin>),
}

impl Plugin {
    pub fn kind_letter(&self) -> char {
        match self {
            Plugin::Input(_) => 'I',
            Plugin::Processor(_) => 'P',
            Plugin::Output(_) => 'O',
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Plugin::Input(p) => p.name(),
            Plugin::Processor(p) => p.name(),
            Plugin::Output(p) => p.name(),
        }
    }
}
