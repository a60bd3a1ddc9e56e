//! Packet window
//!
//! A gathered view over usable packets for batch processing: logically
//! contiguous, physically possibly spread over several disjoint ranges of the
//! circular buffer (and excluding dropped or label-filtered packets). Plugins
//! mutate, drop or nullify packets in place through the window.

use crate::metadata::PacketMetadata;
use crate::ts::{TsPacket, NULL_PACKET};

struct WindowEntry<'a> {
    pkt: &'a mut TsPacket,
    meta: &'a mut PacketMetadata,
    /// Physical index of the packet in the global buffer.
    buffer_index: usize,
}

/// A window of packets handed to a processor plugin in one call.
#[derive(Default)]
pub struct PacketWindow<'a> {
    entries: Vec<WindowEntry<'a>>,
    drop_count: usize,
    nullify_count: usize,
}

impl<'a> PacketWindow<'a> {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            drop_count: 0,
            nullify_count: 0,
        }
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.drop_count = 0;
        self.nullify_count = 0;
    }

    /// Append one packet reference to the window.
    pub fn push(&mut self, pkt: &'a mut TsPacket, meta: &'a mut PacketMetadata, buffer_index: usize) {
        self.entries.push(WindowEntry {
            pkt,
            meta,
            buffer_index,
        });
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn packet(&self, index: usize) -> &TsPacket {
        &*self.entries[index].pkt
    }

    pub fn packet_mut(&mut self, index: usize) -> &mut TsPacket {
        &mut *self.entries[index].pkt
    }

    pub fn metadata(&self, index: usize) -> &PacketMetadata {
        &*self.entries[index].meta
    }

    pub fn metadata_mut(&mut self, index: usize) -> &mut PacketMetadata {
        &mut *self.entries[index].meta
    }

    /// Both mutable references at once, for per-packet processing loops.
    pub fn packet_and_metadata_mut(
        &mut self,
        index: usize,
    ) -> (&mut TsPacket, &mut PacketMetadata) {
        let entry = &mut self.entries[index];
        (&mut *entry.pkt, &mut *entry.meta)
    }

    /// Physical index of the `index`-th logical packet in the global buffer.
    pub fn buffer_index(&self, index: usize) -> usize {
        self.entries[index].buffer_index
    }

    /// Drop the packet at `index` (clears its sync byte).
    pub fn drop_packet(&mut self, index: usize) {
        let entry = &mut self.entries[index];
        if entry.pkt.has_valid_sync() {
            entry.pkt.mark_dropped();
            self.drop_count += 1;
        }
    }

    /// Replace the packet at `index` with a null packet.
    pub fn nullify(&mut self, index: usize) {
        let entry = &mut self.entries[index];
        if !entry.pkt.is_null() {
            *entry.pkt = NULL_PACKET;
            entry.meta.set_nullified(true);
            self.nullify_count += 1;
        }
    }

    /// Number of packets dropped through this window.
    pub fn drop_count(&self) -> usize {
        self.drop_count
    }

    /// Number of packets nullified through this window.
    pub fn nullify_count(&self) -> usize {
        self.nullify_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_window_accounting() {
        let mut pkts = vec![NULL_PACKET; 4];
        for (i, p) in pkts.iter_mut().enumerate() {
            p.set_pid(0x100 + i as u16);
        }
        let mut metas = vec![PacketMetadata::default(); 4];

        let mut win = PacketWindow::new();
        for (i, (p, m)) in pkts.iter_mut().zip(metas.iter_mut()).enumerate() {
            win.push(p, m, 10 + i);
        }

        assert_eq!(win.len(), 4);
        assert_eq!(win.buffer_index(2), 12);
        assert_eq!(win.packet(1).pid(), 0x101);

        win.drop_packet(0);
        win.drop_packet(0); // second drop of the same packet does not count
        win.nullify(1);
        assert_eq!(win.drop_count(), 1);
        assert_eq!(win.nullify_count(), 1);

        drop(win);
        assert!(!pkts[0].has_valid_sync());
        assert!(pkts[1].is_null());
        assert!(metas[1].nullified());
    }
}
