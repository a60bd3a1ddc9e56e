//! Bitrate-aware TS packet queue
//!
//! Detaches a producer thread from a consumer thread, e.g. a push-mode input
//! or the sub-stream feeder of the merge plugin. The producer obtains a
//! contiguous write window inside the circular buffer, fills it outside the
//! lock, then publishes. The consumer reads packets in strict FIFO order and
//! receives the current bitrate alongside: explicit if the producer set one,
//! otherwise derived from PCR analysis of the enqueued packets.

use std::cell::UnsafeCell;
use std::ops::{Deref, DerefMut};

use parking_lot::{Condvar, Mutex};
use tracing::warn;

use crate::bitrate::{BitRate, PcrAnalyzer};
use crate::ts::TsPacket;

/// Default queue capacity in packets.
pub const DEFAULT_PACKET_QUEUE_SIZE: usize = 1000;

struct Inner {
    eof: bool,
    stopped: bool,
    in_count: usize,
    read_index: usize,
    write_index: usize,
    write_locked: bool,
    bitrate: BitRate,
    pcr: PcrAnalyzer,
}

/// Producer/consumer circular buffer of TS packets.
///
/// Single producer, single consumer. The packet storage is only touched
/// through windows handed out under the index bookkeeping below: the producer
/// owns `[write_index, write_index + n)` between `lock_write_buffer` and
/// `release`, the consumer owns `[read_index, read_index + in_count)`; the
/// ranges are disjoint by construction.
pub struct TsPacketQueue {
    buffer: UnsafeCell<Box<[TsPacket]>>,
    inner: Mutex<Inner>,
    enqueued: Condvar,
    dequeued: Condvar,
}

// The buffer cell is only accessed through disjoint index ranges, see above.
unsafe impl Send for TsPacketQueue {}
unsafe impl Sync for TsPacketQueue {}

/// Contiguous writable area of the queue, released by the producer after
/// filling it. Dropping the window without `release` publishes nothing.
pub struct WriteWindow<'a> {
    queue: &'a TsPacketQueue,
    start: usize,
    len: usize,
}

impl Deref for WriteWindow<'_> {
    type Target = [TsPacket];

    fn deref(&self) -> &[TsPacket] {
        unsafe { &(&*self.queue.buffer.get())[self.start..self.start + self.len] }
    }
}

impl DerefMut for WriteWindow<'_> {
    fn deref_mut(&mut self) -> &mut [TsPacket] {
        unsafe { &mut (&mut *self.queue.buffer.get())[self.start..self.start + self.len] }
    }
}

impl WriteWindow<'_> {
    /// Publish the first `count` packets of the window.
    pub fn release(self, count: usize) {
        self.queue.release_write_buffer(self.start, self.len, count);
    }
}

impl Drop for WriteWindow<'_> {
    fn drop(&mut self) {
        let mut inner = self.queue.inner.lock();
        inner.write_locked = false;
    }
}

impl TsPacketQueue {
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        Self {
            buffer: UnsafeCell::new(vec![TsPacket::default(); size].into_boxed_slice()),
            inner: Mutex::new(Inner {
                eof: false,
                stopped: false,
                in_count: 0,
                read_index: 0,
                write_index: 0,
                write_locked: false,
                bitrate: BitRate::ZERO,
                pcr: PcrAnalyzer::default(),
            }),
            enqueued: Condvar::new(),
            dequeued: Condvar::new(),
        }
    }

    /// Clear the queue and optionally resize it (minimum one packet).
    ///
    /// Must not be called while a producer holds a write window.
    pub fn reset(&self, size: Option<usize>) {
        let mut inner = self.inner.lock();
        if inner.write_locked {
            warn!("packet queue reset while a write window is locked, ignored");
            return;
        }
        if let Some(size) = size {
            let size = size.max(1);
            unsafe {
                *self.buffer.get() = vec![TsPacket::default(); size].into_boxed_slice();
            }
        }
        inner.eof = false;
        inner.stopped = false;
        inner.in_count = 0;
        inner.read_index = 0;
        inner.write_index = 0;
        inner.bitrate = BitRate::ZERO;
        inner.pcr.reset();
    }

    /// Size of the buffer in packets.
    pub fn buffer_size(&self) -> usize {
        unsafe { (&*self.buffer.get()).len() }
    }

    /// Number of packets currently queued.
    pub fn current_size(&self) -> usize {
        self.inner.lock().in_count
    }

    /// Producer: block until at least `min_size` contiguous free slots exist,
    /// then return the writable window. The window may be shorter than
    /// requested when the free space wraps at the end of the buffer, but never
    /// empty. Returns `None` when the consumer has stopped the queue.
    pub fn lock_write_buffer(&self, min_size: usize) -> Option<WriteWindow<'_>> {
        let size = self.buffer_size();
        let mut inner = self.inner.lock();
        if inner.write_locked {
            // A second window would alias the first one's slots.
            crate::platform::fatal_error("internal error: nested write windows on TS packet queue");
        }

        // We cannot ask for more than the distance to the end of the buffer,
        // and we always wait for at least one packet.
        let max_size = size - inner.write_index;
        let min_size = min_size.clamp(1, max_size);

        while !inner.stopped && size - inner.in_count < min_size {
            self.dequeued.wait(&mut inner);
        }
        if inner.stopped {
            return None;
        }

        let start = inner.write_index;
        let len = if inner.read_index > inner.write_index {
            // The window extends up to unconsumed packets.
            inner.read_index - inner.write_index
        } else {
            // The free space wraps: return the first contiguous part.
            max_size
        };
        inner.write_locked = true;
        Some(WriteWindow {
            queue: self,
            start,
            len,
        })
    }

    fn release_write_buffer(&self, start: usize, window_len: usize, count: usize) {
        let size = self.buffer_size();
        let mut inner = self.inner.lock();
        let count = count.min(window_len);
        debug_assert_eq!(start, inner.write_index);

        // When the producer did not report a bitrate, analyze PCRs.
        if inner.bitrate.is_zero() {
            for i in 0..count {
                let pkt = unsafe { &(*self.buffer.get())[start + i] };
                inner.pcr.feed_packet(pkt);
            }
        }

        inner.in_count += count;
        inner.write_index = (inner.write_index + count) % size;
        inner.write_locked = false;
        self.enqueued.notify_all();
    }

    /// Producer: report an explicit input bitrate, disabling PCR analysis.
    pub fn set_bitrate(&self, bitrate: BitRate) {
        let mut inner = self.inner.lock();
        inner.bitrate = bitrate;
        if !bitrate.is_zero() {
            inner.pcr.reset();
        }
    }

    /// Producer: signal the end of the stream.
    pub fn set_eof(&self) {
        let mut inner = self.inner.lock();
        inner.eof = true;
        self.enqueued.notify_all();
    }

    /// True when the producer reported EOF and all packets were consumed.
    pub fn eof(&self) -> bool {
        let inner = self.inner.lock();
        inner.eof && inner.in_count == 0
    }

    fn bitrate_locked(inner: &Inner) -> BitRate {
        if !inner.bitrate.is_zero() {
            inner.bitrate
        } else if inner.pcr.bitrate_is_valid() {
            inner.pcr.bitrate()
        } else {
            BitRate::ZERO
        }
    }

    /// Consumer: non-blocking read of the next packet and the current bitrate.
    pub fn get_packet(&self) -> (Option<TsPacket>, BitRate) {
        let size = self.buffer_size();
        let mut inner = self.inner.lock();
        let bitrate = Self::bitrate_locked(&inner);
        if inner.in_count == 0 {
            (None, bitrate)
        } else {
            let pkt = unsafe { (*self.buffer.get())[inner.read_index] };
            inner.read_index = (inner.read_index + 1) % size;
            inner.in_count -= 1;
            self.dequeued.notify_all();
            (Some(pkt), bitrate)
        }
    }

    /// Consumer: block until at least one packet is available or the stream
    /// ends, then drain as many packets as fit in `buf`. Returns `None` at end
    /// of stream (or stop) with nothing left to deliver.
    pub fn wait_packets(&self, buf: &mut [TsPacket]) -> Option<(usize, BitRate)> {
        let size = self.buffer_size();
        let mut inner = self.inner.lock();
        while !inner.eof && !inner.stopped && inner.in_count == 0 {
            self.enqueued.wait(&mut inner);
        }

        let mut count = 0;
        while inner.in_count > 0 && count < buf.len() {
            buf[count] = unsafe { (*self.buffer.get())[inner.read_index] };
            inner.read_index = (inner.read_index + 1) % size;
            inner.in_count -= 1;
            count += 1;
        }
        let bitrate = Self::bitrate_locked(&inner);
        self.dequeued.notify_all();

        if count > 0 {
            Some((count, bitrate))
        } else {
            None
        }
    }

    /// Consumer: tell the producer to stop immediately.
    pub fn stop(&self) {
        let mut inner = self.inner.lock();
        inner.stopped = true;
        self.dequeued.notify_all();
        self.enqueued.notify_all();
    }

}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ts::NULL_PACKET;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    fn tagged_packet(tag: u16) -> TsPacket {
        let mut pkt = NULL_PACKET;
        pkt.set_pid(tag & 0x1FFF);
        pkt
    }

    #[test]
    fn test_fifo_roundtrip() {
        // Every released packet is delivered exactly once, in order.
        let q = Arc::new(TsPacketQueue::new(16));
        let q2 = q.clone();
        const TOTAL: usize = 5000;

        let producer = thread::spawn(move || {
            let mut sent = 0u16;
            while (sent as usize) < TOTAL {
                let mut win = q2.lock_write_buffer(1).expect("queue stopped early");
                let mut filled = 0;
                for slot in win.iter_mut() {
                    if sent as usize >= TOTAL {
                        break;
                    }
                    *slot = tagged_packet(sent % 0x1FFF);
                    sent += 1;
                    filled += 1;
                }
                win.release(filled);
            }
            q2.set_eof();
        });

        let mut received = 0usize;
        let mut buf = vec![NULL_PACKET; 7];
        while let Some((count, _rate)) = q.wait_packets(&mut buf) {
            for pkt in &buf[..count] {
                assert_eq!(pkt.pid(), (received as u16) % 0x1FFF);
                received += 1;
            }
        }
        producer.join().unwrap();
        assert_eq!(received, TOTAL);
        assert!(q.eof());
    }

    #[test]
    fn test_stop_unblocks_producer() {
        let q = Arc::new(TsPacketQueue::new(2));
        // Fill the queue.
        let win = q.lock_write_buffer(2).unwrap();
        win.release(2);
        let q2 = q.clone();
        let producer = thread::spawn(move || q2.lock_write_buffer(1).is_none());
        thread::sleep(Duration::from_millis(30));
        q.stop();
        assert!(producer.join().unwrap());
    }

    #[test]
    fn test_explicit_bitrate_wins() {
        let q = TsPacketQueue::new(8);
        q.set_bitrate(BitRate(5_000_000));
        let win = q.lock_write_buffer(1).unwrap();
        win.release(1);
        let (pkt, rate) = q.get_packet();
        assert!(pkt.is_some());
        assert_eq!(rate, BitRate(5_000_000));
    }

    #[test]
    fn test_reset_resizes() {
        let q = TsPacketQueue::new(4);
        q.reset(Some(0));
        assert_eq!(q.buffer_size(), 1);
        q.reset(Some(32));
        assert_eq!(q.buffer_size(), 32);
    }
}
