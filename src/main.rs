//! tsflow binary
//!
//! Command line shape: `tsflow [global-options] -I input [options]
//! [-P processor [options]]... -O output [options]`. Global options are
//! parsed here; everything after a plugin marker belongs to that plugin.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use tsflow::pipeline::control::LogLevelHandler;
use tsflow::pipeline::ControlOptions;
use tsflow::{BitRate, ExitStatus, PluginSpec, TsProcessor, TspOptions};

/// Transport stream processor: chain plugins over a shared packet buffer.
#[derive(Debug, Parser)]
#[command(name = "tsflow", version, disable_help_flag = false)]
struct GlobalOptions {
    /// Size of the global packet buffer in megabytes.
    #[arg(long, default_value_t = 8)]
    buffer_size_mb: usize,

    /// Interval in milliseconds between two bitrate re-evaluations.
    #[arg(long, default_value_t = 5000)]
    bitrate_adjust_interval: u64,

    /// Packet interval between bitrate re-evaluations while unknown.
    #[arg(long, default_value_t = 1000)]
    init_bitrate_adjust: u64,

    /// Maximum packets before an implicit flush between plugins.
    #[arg(long)]
    max_flushed_packets: Option<usize>,

    /// Maximum packets per input operation.
    #[arg(long, default_value_t = 0)]
    max_input_packets: usize,

    /// Maximum packets per output operation.
    #[arg(long, default_value_t = 0)]
    max_output_packets: usize,

    /// Timeout in milliseconds on input receive operations.
    #[arg(long)]
    receive_timeout: Option<u64>,

    /// After end of input, wait this many milliseconds before terminating
    /// (0 waits forever).
    #[arg(long)]
    final_wait: Option<u64>,

    /// TCP port of the control command server.
    #[arg(long)]
    control_port: Option<u16>,

    /// Local bind address of the control server.
    #[arg(long, default_value = "127.0.0.1")]
    control_local: IpAddr,

    /// Allowed source address for control commands (repeatable).
    #[arg(long)]
    control_source: Vec<IpAddr>,

    /// Receive timeout in milliseconds of each control command.
    #[arg(long, default_value_t = 5000)]
    control_timeout: u64,

    /// Set the reuse-port option on the control server socket.
    #[arg(long, default_value_t = false)]
    control_reuse: bool,

    /// Artificial input stuffing cycle, as nullpkt/inpkt.
    #[arg(long)]
    add_input_stuffing: Option<String>,

    /// Null packets inserted before the first input packet.
    #[arg(long, default_value_t = 0)]
    add_start_stuffing: u64,

    /// Null packets inserted after the last input packet.
    #[arg(long, default_value_t = 0)]
    add_stop_stuffing: u64,

    /// Tune buffering for real-time streams.
    #[arg(long, overrides_with = "no_realtime")]
    realtime: bool,

    /// Tune buffering for offline processing.
    #[arg(long = "no-realtime")]
    no_realtime: bool,

    /// Show plugin indexes in log messages.
    #[arg(long, default_value_t = false)]
    log_plugin_index: bool,

    /// Periodic resource monitoring.
    #[arg(long, default_value_t = false)]
    monitor: bool,

    /// Prometheus scrape address for --monitor.
    #[arg(long)]
    monitor_address: Option<SocketAddr>,

    /// Input bitrate in bits/second, overriding all evaluation.
    #[arg(long)]
    bitrate: Option<u64>,
}

fn main() {
    std::process::exit(real_main());
}

fn real_main() -> i32 {
    // Split the command line into global options and plugin chains.
    let args: Vec<String> = std::env::args().collect();
    let (global_args, chains) = split_plugin_chains(&args);

    let options = match GlobalOptions::try_parse_from(&global_args) {
        Ok(options) => options,
        Err(e) => {
            // Help and version exit with 0, genuine errors with 2.
            let _ = e.print();
            return if e.use_stderr() {
                ExitStatus::UsageError.code()
            } else {
                0
            };
        }
    };

    // Initialize tracing with a reloadable level filter so the control
    // server's set-log command can change it at runtime.
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("tsflow=info"));
    let (filter, reload_handle) = tracing_subscriber::reload::Layer::new(filter);
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    let log_handler: LogLevelHandler = Arc::new(move |level: &str| {
        let new = EnvFilter::try_new(level).map_err(|e| e.to_string())?;
        reload_handle.reload(new).map_err(|e| e.to_string())
    });

    // Assemble the plugin chain.
    let mut input = None;
    let mut processors = Vec::new();
    let mut output = None;
    for (kind, spec) in chains {
        match kind {
            'I' if input.is_none() => input = Some(spec),
            'I' => {
                error!("only one input plugin is allowed");
                return ExitStatus::UsageError.code();
            }
            'P' => processors.push(spec),
            'O' if output.is_none() => output = Some(spec),
            _ => {
                error!("only one output plugin is allowed");
                return ExitStatus::UsageError.code();
            }
        }
    }
    let (Some(input), Some(output)) = (input, output) else {
        error!("specify one input plugin (-I) and one output plugin (-O)");
        return ExitStatus::UsageError.code();
    };

    let tsp_options = match build_tsp_options(&options) {
        Ok(o) => o,
        Err(msg) => {
            error!("{msg}");
            return ExitStatus::UsageError.code();
        }
    };

    if options.monitor {
        if let Err(e) = tsflow::monitor::init_metrics(options.monitor_address) {
            warn!(error = format!("{e:#}"), "monitoring disabled");
        }
    }

    let mut processor = match TsProcessor::from_chain(tsp_options, &input, &processors, &output) {
        Ok(p) => p,
        Err(e) => {
            error!("{e:#}");
            return ExitStatus::UsageError.code();
        }
    };
    processor.set_log_level_handler(log_handler);

    info!(
        input = %input.name,
        processors = processors.len(),
        output = %output.name,
        "starting tsflow"
    );
    match processor.run() {
        Ok(status) => status.code(),
        Err(e) => {
            error!("{e:#}");
            ExitStatus::ProcessingError.code()
        }
    }
}

/// Split the command line at the -I/-P/-O markers.
fn split_plugin_chains(args: &[String]) -> (Vec<String>, Vec<(char, PluginSpec)>) {
    let mut global = Vec::new();
    let mut chains: Vec<(char, Vec<String>)> = Vec::new();

    for arg in args {
        let marker = match arg.as_str() {
            "-I" => Some('I'),
            "-P" => Some('P'),
            "-O" => Some('O'),
            _ => None,
        };
        if let Some(kind) = marker {
            chains.push((kind, Vec::new()));
        } else if let Some((_, current)) = chains.last_mut() {
            current.push(arg.clone());
        } else {
            global.push(arg.clone());
        }
    }

    let specs = chains
        .into_iter()
        .map(|(kind, mut words)| {
            let name = if words.is_empty() {
                String::new()
            } else {
                words.remove(0)
            };
            (kind, PluginSpec::new(name, words))
        })
        .collect();
    (global, specs)
}

/// Map the parsed command line onto the engine options.
fn build_tsp_options(options: &GlobalOptions) -> Result<TspOptions, String> {
    let mut tsp = TspOptions {
        buffer_size: options.buffer_size_mb.max(1) * 1024 * 1024,
        bitrate_adj: Duration::from_millis(options.bitrate_adjust_interval.max(1)),
        init_bitrate_adj: options.init_bitrate_adjust.max(1),
        max_input_pkt: options.max_input_packets,
        max_output_pkt: options.max_output_packets,
        instuff_start: options.add_start_stuffing,
        instuff_stop: options.add_stop_stuffing,
        receive_timeout: options.receive_timeout.map(Duration::from_millis),
        final_wait: options.final_wait.map(Duration::from_millis),
        log_plugin_index: options.log_plugin_index,
        monitor: options.monitor,
        monitor_address: options.monitor_address,
        fixed_bitrate: BitRate(options.bitrate.unwrap_or(0)),
        control: ControlOptions {
            port: options.control_port,
            local: options.control_local,
            sources: options.control_source.clone(),
            timeout: Duration::from_millis(options.control_timeout.max(1)),
            reuse: options.control_reuse,
        },
        ..Default::default()
    };

    // Real-time streams prefer frequent small flushes over throughput.
    if let Some(max_flush) = options.max_flushed_packets {
        tsp.max_flush_pkt = max_flush;
    } else if options.realtime && !options.no_realtime {
        tsp.max_flush_pkt = 1000;
    }

    if let Some(spec) = &options.add_input_stuffing {
        let (nullpkt, inpkt) = spec
            .split_once('/')
            .ok_or_else(|| format!("invalid --add-input-stuffing '{spec}', expected K/N"))?;
        tsp.instuff_nullpkt = nullpkt
            .parse()
            .map_err(|_| format!("invalid --add-input-stuffing '{spec}'"))?;
        tsp.instuff_inpkt = inpkt
            .parse()
            .map_err(|_| format!("invalid --add-input-stuffing '{spec}'"))?;
        if tsp.instuff_inpkt == 0 {
            return Err("invalid --add-input-stuffing, input packet count must not be zero".into());
        }
    }

    Ok(tsp)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_split_plugin_chains() {
        let argv = args(&[
            "tsflow",
            "--buffer-size-mb",
            "16",
            "-I",
            "file",
            "in.ts",
            "-P",
            "filter",
            "0x100",
            "-P",
            "count",
            "-O",
            "file",
            "out.ts",
        ]);
        let (global, chains) = split_plugin_chains(&argv);
        assert_eq!(global, args(&["tsflow", "--buffer-size-mb", "16"]));
        assert_eq!(chains.len(), 4);
        assert_eq!(chains[0], ('I', PluginSpec::new("file", args(&["in.ts"]))));
        assert_eq!(chains[1], ('P', PluginSpec::new("filter", args(&["0x100"]))));
        assert_eq!(chains[2], ('P', PluginSpec::new("count", vec![])));
        assert_eq!(chains[3], ('O', PluginSpec::new("file", args(&["out.ts"]))));
    }

    #[test]
    fn test_input_stuffing_parsing() {
        let mut options = GlobalOptions::try_parse_from(["tsflow"]).unwrap();
        options.add_input_stuffing = Some("3/7".to_string());
        let tsp = build_tsp_options(&options).unwrap();
        assert_eq!(tsp.instuff_nullpkt, 3);
        assert_eq!(tsp.instuff_inpkt, 7);

        options.add_input_stuffing = Some("nonsense".to_string());
        assert!(build_tsp_options(&options).is_err());
        options.add_input_stuffing = Some("1/0".to_string());
        assert!(build_tsp_options(&options).is_err());
    }
}
