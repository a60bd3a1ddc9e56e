//! Muxer input executor
//!
//! One thread per input plugin, feeding a bounded queue that the muxing loop
//! drains without blocking. In lossy mode a full queue drops its oldest
//! packets instead of stalling the plugin; an input plugin reporting end of
//! stream is either terminated or restarted, per the options.

use std::collections::VecDeque;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, info, warn};

use crate::metadata::PacketMetadata;
use crate::plugin::{InputAbort, InputPlugin};
use crate::ts::TsPacket;

/// What the muxing loop got from one poll of an input queue.
pub(crate) enum PolledPacket {
    /// One packet with its metadata.
    Packet(TsPacket, PacketMetadata),
    /// Nothing available right now.
    Empty,
    /// The input terminated and its queue is drained.
    Terminated,
}

struct Inner {
    queue: VecDeque<(TsPacket, PacketMetadata)>,
    terminate: bool,
}

struct Shared {
    inner: Mutex<Inner>,
    got_packets: Condvar,
    got_freespace: Condvar,
    capacity: usize,
}

/// Handle on one input executor thread.
pub(crate) struct MuxInputExecutor {
    index: usize,
    shared: Arc<Shared>,
    abort: Option<InputAbort>,
    thread: Option<JoinHandle<()>>,
}

impl MuxInputExecutor {
    /// Start the executor thread around a started plugin.
    pub fn start(
        index: usize,
        plugin: Box<dyn InputPlugin>,
        capacity: usize,
        max_input_packets: usize,
        lossy: bool,
        lossy_reclaim: usize,
        input_once: bool,
        restart_delay: Duration,
    ) -> std::io::Result<Self> {
        let shared = Arc::new(Shared {
            inner: Mutex::new(Inner {
                queue: VecDeque::with_capacity(capacity),
                terminate: false,
            }),
            got_packets: Condvar::new(),
            got_freespace: Condvar::new(),
            capacity: capacity.max(1),
        });
        let abort = plugin.abort_handle();
        let thread_shared = shared.clone();
        let thread = thread::Builder::new()
            .name(format!("tsmux-input-{index}"))
            .spawn(move || {
                run_input(
                    index,
                    plugin,
                    thread_shared,
                    max_input_packets.max(1),
                    lossy,
                    lossy_reclaim.max(1),
                    input_once,
                    restart_delay,
                )
            })?;
        Ok(Self {
            index,
            shared,
            abort,
            thread: Some(thread),
        })
    }

    pub fn index(&self) -> usize {
        self.index
    }

    /// Non-blocking poll of the input queue.
    pub fn poll(&self) -> PolledPacket {
        let mut inner = self.shared.inner.lock();
        match inner.queue.pop_front() {
            Some((pkt, meta)) => {
                self.shared.got_freespace.notify_all();
                PolledPacket::Packet(pkt, meta)
            }
            None if inner.terminate => PolledPacket::Terminated,
            None => PolledPacket::Empty,
        }
    }

    /// Request termination; aborts a blocked receive when supported.
    pub fn terminate(&self) {
        {
            let mut inner = self.shared.inner.lock();
            inner.terminate = true;
            self.shared.got_packets.notify_all();
            self.shared.got_freespace.notify_all();
        }
        if let Some(abort) = &self.abort {
            abort();
        }
    }

    /// Join the executor thread.
    pub fn wait(mut self) {
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn run_input(
    index: usize,
    mut plugin: Box<dyn InputPlugin>,
    shared: Arc<Shared>,
    max_input_packets: usize,
    lossy: bool,
    lossy_reclaim: usize,
    input_once: bool,
    restart_delay: Duration,
) {
    debug!(index, plugin = plugin.name(), "input thread started");
    let mut pkts = vec![TsPacket::default(); max_input_packets];
    let mut metas = vec![PacketMetadata::default(); max_input_packets];

    loop {
        // Wait for free space in the queue, or reclaim in lossy mode.
        let space = {
            let mut inner = shared.inner.lock();
            if lossy && inner.queue.len() >= shared.capacity {
                let dropped = lossy_reclaim.min(inner.queue.len());
                inner.queue.drain(..dropped);
                warn!(index, dropped, "lossy input, dropping oldest packets");
            }
            while !inner.terminate && inner.queue.len() >= shared.capacity {
                shared.got_freespace.wait(&mut inner);
            }
            if inner.terminate {
                break;
            }
            shared.capacity - inner.queue.len()
        };

        let max = space.min(max_input_packets);
        for meta in metas[..max].iter_mut() {
            meta.reset();
        }
        match plugin.receive(&mut pkts[..max], &mut metas[..max]) {
            Ok(0) | Err(_) if input_once => {
                break;
            }
            Ok(0) | Err(_) => {
                // Restart the plugin after end of stream or failure.
                info!(
                    index,
                    plugin = plugin.name(),
                    "restarting input plugin after end of stream or failure"
                );
                let _ = plugin.stop();
                loop {
                    if shared.inner.lock().terminate {
                        debug!(index, "input thread terminated");
                        return;
                    }
                    match plugin.start() {
                        Ok(()) => break,
                        Err(e) => {
                            error!(index, error = format!("{e:#}"), "input restart failed");
                            thread::sleep(restart_delay);
                        }
                    }
                }
            }
            Ok(count) => {
                let mut inner = shared.inner.lock();
                for i in 0..count {
                    inner.queue.push_back((pkts[i], metas[i]));
                }
                shared.got_packets.notify_all();
            }
        }
    }

    // Mark the queue as terminated so the muxing loop can account for it.
    {
        let mut inner = shared.inner.lock();
        inner.terminate = true;
        shared.got_packets.notify_all();
    }
    if let Err(e) = plugin.stop() {
        warn!(index, error = format!("{e:#}"), "error stopping input plugin");
    }
    debug!(index, "input thread terminated");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugins::MemoryInput;
    use crate::ts::NULL_PACKET;

    #[test]
    fn test_input_drains_then_terminates() {
        let mut src = Vec::new();
        for i in 0..40u16 {
            let mut pkt = NULL_PACKET;
            pkt.set_pid(0x100 + i);
            src.push(pkt);
        }
        let plugin = Box::new(MemoryInput::new(Arc::new(src)));
        let exec = MuxInputExecutor::start(
            0,
            plugin,
            16,
            8,
            false,
            4,
            true,
            Duration::from_millis(10),
        )
        .unwrap();

        let mut got = 0;
        loop {
            match exec.poll() {
                PolledPacket::Packet(pkt, _) => {
                    assert_eq!(pkt.pid(), 0x100 + got as u16);
                    got += 1;
                }
                PolledPacket::Empty => thread::yield_now(),
                PolledPacket::Terminated => break,
            }
        }
        assert_eq!(got, 40);
        exec.terminate();
        exec.wait();
    }
}
