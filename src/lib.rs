//! tsflow: real-time MPEG-2 transport stream processing
//!
//! A plugin pipeline engine streaming 188-byte TS packets through a chain of
//! input, processor and output plugins under strict timing and ordering
//! guarantees, plus the signalization machinery around it: a two-stream
//! PSI/SI merger, an N→1 multiplexer, PCR restamping and bitrate-smoothed
//! packet insertion.

pub mod bitrate;
pub mod buffer;
pub mod emmg;
pub mod error;
pub mod insertion;
pub mod merge;
pub mod metadata;
pub mod monitor;
pub mod msgqueue;
pub mod mux;
pub mod pcr;
pub mod pipeline;
pub mod platform;
pub mod plugin;
pub mod plugins;
pub mod psi;
pub mod queue;
pub mod ts;
pub mod watchdog;

// Re-export main types for convenience
pub use bitrate::{BitRate, BitRateConfidence};
pub use error::{Error, ExitStatus};
pub use mux::{MuxerOptions, TsMuxer};
pub use pipeline::controller::{PluginSpec, TsProcessor};
pub use pipeline::TspOptions;
pub use ts::TsPacket;
