//! Resource monitoring
//!
//! Behind `--monitor`: registers progress metrics for every stage of the
//! pipeline, optionally exposes them to a Prometheus scraper, and emits a
//! periodic JSON progress line for log-based supervision.

use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use metrics::{counter, gauge};
use parking_lot::{Condvar, Mutex};
use serde::Serialize;
use tracing::info;

use crate::pipeline::PipelineShared;

/// Interval between two monitoring reports.
const MONITOR_INTERVAL: Duration = Duration::from_secs(5);

/// Install the Prometheus metrics recorder. With an address, a scrape
/// endpoint is served there; without one, metrics are recorded only.
pub fn init_metrics(address: Option<SocketAddr>) -> Result<()> {
    let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
    match address {
        Some(addr) => builder
            .with_http_listener(addr)
            .install()
            .context("failed to install Prometheus exporter")?,
        None => {
            builder
                .install_recorder()
                .context("failed to install Prometheus recorder")?;
        }
    }
    Ok(())
}

/// Record one batch of processed packets for a named stage.
pub fn record_stage_packets(stage: &'static str, packets: u64) {
    counter!("tsflow_stage_packets_total", "stage" => stage).increment(packets);
}

/// One stage in the progress report.
#[derive(Debug, Serialize)]
struct StageProgress {
    index: usize,
    kind: char,
    name: String,
    plugin_packets: u64,
    total_packets: u64,
    suspended: bool,
}

/// Periodic progress report, emitted as one JSON log line.
#[derive(Debug, Serialize)]
struct MonitorReport {
    elapsed_seconds: u64,
    bitrate: u64,
    stages: Vec<StageProgress>,
}

/// Handle on the monitoring thread.
pub struct MonitorHandle {
    thread: Option<JoinHandle<()>>,
    stop: Arc<(Mutex<bool>, Condvar)>,
}

impl MonitorHandle {
    pub fn close(mut self) {
        let (lock, cond) = &*self.stop;
        *lock.lock() = true;
        cond.notify_all();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

/// Start the periodic monitoring thread over a running pipeline.
pub(crate) fn spawn_monitor(shared: Arc<PipelineShared>) -> MonitorHandle {
    let stop = Arc::new((Mutex::new(false), Condvar::new()));
    let stop2 = stop.clone();
    let thread = thread::Builder::new()
        .name("tsp-monitor".into())
        .spawn(move || {
            let start = Instant::now();
            loop {
                {
                    let (lock, cond) = &*stop2;
                    let mut stopped = lock.lock();
                    if !*stopped {
                        cond.wait_for(&mut stopped, MONITOR_INTERVAL);
                    }
                    if *stopped {
                        break;
                    }
                }
                report(&shared, start.elapsed());
            }
        })
        .expect("failed to spawn monitor thread");
    MonitorHandle {
        thread: Some(thread),
        stop,
    }
}

fn report(shared: &PipelineShared, elapsed: Duration) {
    let n = shared.plugin_count();
    let (bitrate, suspended_flags) = {
        let state = shared.state.lock();
        (
            state[n - 1].bitrate,
            state.iter().map(|s| s.suspended).collect::<Vec<_>>(),
        )
    };

    let stages = shared
        .info
        .iter()
        .enumerate()
        .map(|(index, info)| {
            let counters = &shared.counters[index];
            StageProgress {
                index,
                kind: info.kind,
                name: info.name.clone(),
                plugin_packets: counters.plugin_packets.load(Ordering::Relaxed),
                total_packets: counters.total(),
                suspended: suspended_flags[index],
            }
        })
        .collect::<Vec<_>>();

    gauge!("tsflow_bitrate_bits_per_second").set(bitrate.0 as f64);
    for stage in &stages {
        gauge!("tsflow_stage_total_packets", "stage" => stage.name.clone())
            .set(stage.total_packets as f64);
    }

    let report = MonitorReport {
        elapsed_seconds: elapsed.as_secs(),
        bitrate: bitrate.0,
        stages,
    };
    match serde_json::to_string(&report) {
        Ok(json) => info!(target: "tsflow::monitor", "{json}"),
        Err(_) => info!(target: "tsflow::monitor", "monitor report serialization failed"),
    }
}
