//! Muxer output executor
//!
//! The muxing loop pushes finished packets into a bounded queue; a dedicated
//! thread drains it into the output plugin so that plugin I/O never stalls
//! the muxing cadence. A send error terminates the whole muxer.

use std::collections::VecDeque;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, warn};

use crate::metadata::PacketMetadata;
use crate::plugin::OutputPlugin;
use crate::ts::TsPacket;

/// Packets sent to the plugin in one call.
const SEND_CHUNK: usize = 64;

struct Inner {
    queue: VecDeque<(TsPacket, PacketMetadata)>,
    terminate: bool,
    failed: bool,
}

struct Shared {
    inner: Mutex<Inner>,
    got_packets: Condvar,
    got_freespace: Condvar,
    capacity: usize,
}

/// Handle on the output executor thread.
pub(crate) struct MuxOutputExecutor {
    shared: Arc<Shared>,
    thread: Option<JoinHandle<()>>,
}

impl MuxOutputExecutor {
    pub fn start(
        plugin: Box<dyn OutputPlugin>,
        capacity: usize,
    ) -> std::io::Result<Self> {
        let shared = Arc::new(Shared {
            inner: Mutex::new(Inner {
                queue: VecDeque::with_capacity(capacity),
                terminate: false,
                failed: false,
            }),
            got_packets: Condvar::new(),
            got_freespace: Condvar::new(),
            capacity: capacity.max(1),
        });
        let thread_shared = shared.clone();
        let thread = thread::Builder::new()
            .name("tsmux-output".into())
            .spawn(move || run_output(plugin, thread_shared))?;
        Ok(Self {
            shared,
            thread: Some(thread),
        })
    }

    /// Queue one packet, blocking while the queue is full. Returns false when
    /// the output terminated (e.g. on a send error).
    pub fn send(&self, pkt: TsPacket, meta: PacketMetadata) -> bool {
        let mut inner = self.shared.inner.lock();
        while !inner.terminate && inner.queue.len() >= self.shared.capacity {
            self.shared.got_freespace.wait(&mut inner);
        }
        if inner.terminate {
            return false;
        }
        inner.queue.push_back((pkt, meta));
        self.shared.got_packets.notify_all();
        true
    }

    /// True when the output plugin failed.
    pub fn failed(&self) -> bool {
        self.shared.inner.lock().failed
    }

    pub fn terminate(&self) {
        let mut inner = self.shared.inner.lock();
        inner.terminate = true;
        self.shared.got_packets.notify_all();
        self.shared.got_freespace.notify_all();
    }

    pub fn wait(mut self) {
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

fn run_output(mut plugin: Box<dyn OutputPlugin>, shared: Arc<Shared>) {
    debug!(plugin = plugin.name(), "output thread started");
    let mut pkts = Vec::with_capacity(SEND_CHUNK);
    let mut metas = Vec::with_capacity(SEND_CHUNK);

    loop {
        // Drain a chunk under the lock, send outside of it.
        {
            let mut inner = shared.inner.lock();
            while !inner.terminate && inner.queue.is_empty() {
                shared.got_packets.wait(&mut inner);
            }
            if inner.queue.is_empty() {
                // Terminated and fully drained.
                break;
            }
            pkts.clear();
            metas.clear();
            while pkts.len() < SEND_CHUNK {
                match inner.queue.pop_front() {
                    Some((pkt, meta)) => {
                        pkts.push(pkt);
                        metas.push(meta);
                    }
                    None => break,
                }
            }
            shared.got_freespace.notify_all();
        }

        if let Err(e) = plugin.send(&pkts, &metas) {
            error!(error = format!("{e:#}"), "output plugin error, terminating");
            let mut inner = shared.inner.lock();
            inner.terminate = true;
            inner.failed = true;
            shared.got_freespace.notify_all();
            break;
        }
    }

    if let Err(e) = plugin.stop() {
        warn!(error = format!("{e:#}"), "error stopping output plugin");
    }
    debug!("output thread terminated");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugins::MemoryOutput;
    use crate::ts::NULL_PACKET;

    #[test]
    fn test_all_packets_reach_plugin_in_order() {
        let sink = Arc::new(Mutex::new(Vec::new()));
        let exec =
            MuxOutputExecutor::start(Box::new(MemoryOutput::new(sink.clone())), 8).unwrap();

        for i in 0..500u16 {
            let mut pkt = NULL_PACKET;
            pkt.set_pid(i % 0x1FFF);
            assert!(exec.send(pkt, PacketMetadata::default()));
        }
        exec.terminate();
        exec.wait();

        let sent = sink.lock();
        assert_eq!(sent.len(), 500);
        for (i, pkt) in sent.iter().enumerate() {
            assert_eq!(pkt.pid(), (i as u16) % 0x1FFF);
        }
    }
}
