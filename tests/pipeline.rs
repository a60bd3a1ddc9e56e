//! End-to-end pipeline scenarios over in-memory plugins.

use std::sync::Arc;

use parking_lot::Mutex;
use rand::{Rng, SeedableRng};

use tsflow::metadata::PacketMetadata;
use tsflow::plugin::{ProcessStatus, ProcessorPlugin};
use tsflow::plugins::{MemoryInput, MemoryOutput, PidFilter};
use tsflow::ts::{TsPacket, NULL_PACKET, PKT_SIZE, SYNC_BYTE};
use tsflow::{ExitStatus, PluginSpec, TsProcessor, TspOptions};

/// Deterministic stream of random packets with valid sync bytes.
fn random_packets(count: usize, seed: u64) -> Vec<TsPacket> {
    let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
    let mut packets = Vec::with_capacity(count);
    for _ in 0..count {
        let mut b = [0u8; PKT_SIZE];
        rng.fill(&mut b[..]);
        b[0] = SYNC_BYTE;
        b[3] &= 0xDF; // no adaptation field, keep the header simple
        b[3] |= 0x10;
        packets.push(TsPacket { b });
    }
    packets
}

fn small_buffer_options() -> TspOptions {
    TspOptions {
        // A small buffer forces plenty of wrap-arounds.
        buffer_size: 64 * PKT_SIZE,
        ..Default::default()
    }
}

fn run_pipeline(
    options: TspOptions,
    input: Vec<TsPacket>,
    processors: Vec<Box<dyn ProcessorPlugin>>,
) -> (ExitStatus, Vec<TsPacket>) {
    let sink = Arc::new(Mutex::new(Vec::new()));
    let mut tsp = TsProcessor::new(options);
    tsp.set_input(
        PluginSpec::new("memory", vec![]),
        Box::new(MemoryInput::with_chunk(Arc::new(input), 17)),
    );
    for (i, plugin) in processors.into_iter().enumerate() {
        tsp.add_processor(PluginSpec::new(format!("proc{i}"), vec![]), plugin);
    }
    tsp.set_output(
        PluginSpec::new("memory", vec![]),
        Box::new(MemoryOutput::new(sink.clone())),
    );
    let status = tsp.run().expect("pipeline run failed");
    let packets = sink.lock().clone();
    (status, packets)
}

#[test]
fn test_identity_pipeline() {
    // A pipeline with no processor must reproduce the input bit for bit.
    let input = random_packets(10_000, 1);
    let (status, output) = run_pipeline(small_buffer_options(), input.clone(), vec![]);
    assert_eq!(status, ExitStatus::Success);
    assert_eq!(output.len(), input.len());
    assert_eq!(output, input);
}

#[test]
fn test_identity_through_passthrough_processor() {
    struct Passthrough;
    impl ProcessorPlugin for Passthrough {
        fn name(&self) -> &str {
            "passthrough"
        }
        fn process_packet(
            &mut self,
            _pkt: &mut TsPacket,
            _meta: &mut PacketMetadata,
        ) -> ProcessStatus {
            ProcessStatus::Ok
        }
    }

    let input = random_packets(5_000, 2);
    let (status, output) = run_pipeline(
        small_buffer_options(),
        input.clone(),
        vec![Box::new(Passthrough)],
    );
    assert_eq!(status, ExitStatus::Success);
    assert_eq!(output, input);
}

#[test]
fn test_drop_pid_plugin() {
    // 2000 packets on PID 0x100 interleaved with 8000 on PID 0x200; dropping
    // PID 0x100 leaves exactly the 0x200 packets, in their original order.
    let mut input = Vec::new();
    let mut tag = 0u32;
    for i in 0..10_000usize {
        let mut pkt = NULL_PACKET;
        if i % 5 == 0 {
            pkt.set_pid(0x100);
        } else {
            pkt.set_pid(0x200);
            // Tag the payload so ordering is verifiable.
            let payload = pkt.payload_mut();
            payload[0..4].copy_from_slice(&tag.to_be_bytes());
            tag += 1;
        }
        input.push(pkt);
    }

    let (status, output) = run_pipeline(
        small_buffer_options(),
        input,
        vec![Box::new(PidFilter::with_pids([0x100]))],
    );
    assert_eq!(status, ExitStatus::Success);
    assert_eq!(output.len(), 8_000);
    for (i, pkt) in output.iter().enumerate() {
        assert_eq!(pkt.pid(), 0x200);
        let payload = pkt.payload();
        assert_eq!(u32::from_be_bytes(payload[0..4].try_into().unwrap()), i as u32);
    }
}

#[test]
fn test_window_mode_drop() {
    // Same dropping plugin, but batched over packet windows.
    struct WindowDrop;
    impl ProcessorPlugin for WindowDrop {
        fn name(&self) -> &str {
            "windowdrop"
        }
        fn window_size(&self) -> usize {
            16
        }
        fn process_packet(
            &mut self,
            pkt: &mut TsPacket,
            _meta: &mut PacketMetadata,
        ) -> ProcessStatus {
            if pkt.pid() == 0x100 {
                ProcessStatus::Drop
            } else {
                ProcessStatus::Ok
            }
        }
    }

    let mut input = Vec::new();
    for i in 0..4_000usize {
        let mut pkt = NULL_PACKET;
        pkt.set_pid(if i % 4 == 0 { 0x100 } else { 0x200 });
        input.push(pkt);
    }

    let (status, output) = run_pipeline(small_buffer_options(), input, vec![Box::new(WindowDrop)]);
    assert_eq!(status, ExitStatus::Success);
    assert_eq!(output.len(), 3_000);
    assert!(output.iter().all(|p| p.pid() == 0x200));
}

#[test]
fn test_plugin_end_terminates_stream() {
    // A plugin ending the stream at packet 100 truncates the output there.
    struct EndAt {
        remaining: usize,
    }
    impl ProcessorPlugin for EndAt {
        fn name(&self) -> &str {
            "endat"
        }
        fn process_packet(
            &mut self,
            _pkt: &mut TsPacket,
            _meta: &mut PacketMetadata,
        ) -> ProcessStatus {
            if self.remaining == 0 {
                ProcessStatus::End
            } else {
                self.remaining -= 1;
                ProcessStatus::Ok
            }
        }
    }

    let input = random_packets(5_000, 3);
    let (_status, output) = run_pipeline(
        small_buffer_options(),
        input.clone(),
        vec![Box::new(EndAt { remaining: 100 })],
    );
    assert_eq!(output.len(), 100);
    assert_eq!(output[..], input[..100]);
}

#[test]
fn test_nullify_preserves_count() {
    // Nullified packets stay in the stream as null packets.
    struct NullifyPid;
    impl ProcessorPlugin for NullifyPid {
        fn name(&self) -> &str {
            "nullify"
        }
        fn process_packet(
            &mut self,
            pkt: &mut TsPacket,
            _meta: &mut PacketMetadata,
        ) -> ProcessStatus {
            if pkt.pid() == 0x100 {
                ProcessStatus::Null
            } else {
                ProcessStatus::Ok
            }
        }
    }

    let mut input = Vec::new();
    for i in 0..1_000usize {
        let mut pkt = NULL_PACKET;
        pkt.set_pid(if i % 2 == 0 { 0x100 } else { 0x200 });
        input.push(pkt);
    }

    let (status, output) = run_pipeline(small_buffer_options(), input, vec![Box::new(NullifyPid)]);
    assert_eq!(status, ExitStatus::Success);
    assert_eq!(output.len(), 1_000);
    assert_eq!(output.iter().filter(|p| p.is_null()).count(), 500);
    assert_eq!(output.iter().filter(|p| p.pid() == 0x200).count(), 500);
}
