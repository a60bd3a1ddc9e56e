//! Shared packet buffer
//!
//! One fixed-size circular array of TS packets plus a parallel metadata
//! array, allocated before any executor thread starts and never resized while
//! the pipeline runs. Page-locked when the OS allows it.
//!
//! Executors access disjoint slices concurrently: ownership of each slot is
//! tracked by the ring bookkeeping under the pipeline's global mutex, and a
//! slot is only touched by the executor that currently owns it. The mutex
//! release in `pass_packets` and re-acquire in the successor's `wait_work`
//! order the accesses, so the raw accessors below stay within that protocol.

use std::cell::UnsafeCell;

use tracing::debug;

use crate::metadata::PacketMetadata;
use crate::platform::lock_memory;
use crate::ts::{TsPacket, PKT_SIZE};

/// Default buffer size in bytes (about 44k packets).
pub const DEFAULT_BUFFER_SIZE: usize = 8 * 1024 * 1024;

/// Minimum buffer size in packets.
pub const MIN_BUFFER_PACKETS: usize = 16;

/// Circular buffer of packets and metadata shared by the executor ring.
pub struct PacketBuffer {
    packets: UnsafeCell<Box<[TsPacket]>>,
    metadata: UnsafeCell<Box<[PacketMetadata]>>,
    count: usize,
}

// Slot ownership is coordinated by the ring state, see module comment.
unsafe impl Send for PacketBuffer {}
unsafe impl Sync for PacketBuffer {}

impl PacketBuffer {
    /// Allocate a buffer of `bytes` bytes worth of packets.
    pub fn with_size(bytes: usize) -> Self {
        Self::with_packets((bytes / PKT_SIZE).max(MIN_BUFFER_PACKETS))
    }

    /// Allocate a buffer of exactly `count` packets.
    pub fn with_packets(count: usize) -> Self {
        let count = count.max(MIN_BUFFER_PACKETS);
        let packets = vec![TsPacket::default(); count].into_boxed_slice();
        let metadata = vec![PacketMetadata::default(); count].into_boxed_slice();

        let locked = lock_memory(packets.as_ptr() as *const u8, count * PKT_SIZE);
        debug!(
            packets = count,
            bytes = count * PKT_SIZE,
            locked,
            "allocated packet buffer"
        );

        Self {
            packets: UnsafeCell::new(packets),
            metadata: UnsafeCell::new(metadata),
            count,
        }
    }

    /// Number of packet slots.
    pub fn count(&self) -> usize {
        self.count
    }

    /// Mutable access to a contiguous range of packets.
    ///
    /// # Safety
    /// The caller must own `[first, first + len)` per the ring bookkeeping and
    /// the range must not wrap (`first + len <= count`).
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn packets_mut(&self, first: usize, len: usize) -> &mut [TsPacket] {
        debug_assert!(first + len <= self.count);
        &mut (&mut *self.packets.get())[first..first + len]
    }

    /// Mutable access to a contiguous range of metadata.
    ///
    /// # Safety
    /// Same ownership contract as [`Self::packets_mut`].
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn metadata_mut(&self, first: usize, len: usize) -> &mut [PacketMetadata] {
        debug_assert!(first + len <= self.count);
        &mut (&mut *self.metadata.get())[first..first + len]
    }

    /// Mutable access to one packet and its metadata.
    ///
    /// # Safety
    /// The caller must own slot `index` per the ring bookkeeping.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn slot_mut(&self, index: usize) -> (&mut TsPacket, &mut PacketMetadata) {
        debug_assert!(index < self.count);
        (
            &mut (*self.packets.get())[index],
            &mut (*self.metadata.get())[index],
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sizing() {
        let buffer = PacketBuffer::with_size(DEFAULT_BUFFER_SIZE);
        assert_eq!(buffer.count(), DEFAULT_BUFFER_SIZE / PKT_SIZE);
        // Tiny requests are clamped to a workable minimum.
        let buffer = PacketBuffer::with_size(1);
        assert_eq!(buffer.count(), MIN_BUFFER_PACKETS);
    }

    #[test]
    fn test_slot_access() {
        let buffer = PacketBuffer::with_packets(32);
        unsafe {
            let (pkt, meta) = buffer.slot_mut(5);
            pkt.set_pid(0x123);
            meta.set_input_stuffing(true);
        }
        unsafe {
            let pkts = buffer.packets_mut(5, 1);
            assert_eq!(pkts[0].pid(), 0x123);
            let metas = buffer.metadata_mut(5, 1);
            assert!(metas[0].input_stuffing());
        }
    }
}
