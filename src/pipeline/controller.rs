//! Pipeline controller
//!
//! Builds the executor ring, preloads the buffer, starts all plugin threads
//! and the control server, then waits for joint completion. Shutdown order:
//! control server first (it references the executors), then the executor
//! threads in ring order, then the buffer goes away with the shared state.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;

use anyhow::Result;
use tracing::{debug, error, info};

use crate::error::ExitStatus;
use crate::pipeline::control::{ControlServer, LogLevelHandler};
use crate::pipeline::executor::{Executor, start_plugin, stop_plugin};
use crate::pipeline::input::InputStage;
use crate::pipeline::output::OutputStage;
use crate::pipeline::processor::ProcessorStage;
use crate::pipeline::{PipelineShared, PluginInfo, TspOptions};
use crate::plugin::{InputPlugin, OutputPlugin, Plugin, ProcessorPlugin};
use crate::plugins;

/// Name and arguments of one plugin in the chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginSpec {
    pub name: String,
    pub args: Vec<String>,
}

impl PluginSpec {
    pub fn new(name: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            name: name.into(),
            args,
        }
    }
}

struct Stage {
    spec: PluginSpec,
    plugin: Plugin,
}

/// A complete transport stream processor: input, processors, output.
pub struct TsProcessor {
    options: TspOptions,
    input: Option<Stage>,
    processors: Vec<Stage>,
    output: Option<Stage>,
    log_level_handler: Option<LogLevelHandler>,
}

impl TsProcessor {
    pub fn new(options: TspOptions) -> Self {
        Self {
            options,
            input: None,
            processors: Vec::new(),
            output: None,
            log_level_handler: None,
        }
    }

    /// Build the whole chain from plugin specifications via the registry.
    pub fn from_chain(
        options: TspOptions,
        input: &PluginSpec,
        processors: &[PluginSpec],
        output: &PluginSpec,
    ) -> Result<Self> {
        let mut tsp = Self::new(options);
        tsp.set_input(input.clone(), plugins::create_input(&input.name, &input.args)?);
        for spec in processors {
            tsp.add_processor(
                spec.clone(),
                plugins::create_processor(&spec.name, &spec.args)?,
            );
        }
        tsp.set_output(
            output.clone(),
            plugins::create_output(&output.name, &output.args)?,
        );
        Ok(tsp)
    }

    /// Install a pre-built input plugin.
    pub fn set_input(&mut self, spec: PluginSpec, plugin: Box<dyn InputPlugin>) {
        self.input = Some(Stage {
            spec,
            plugin: Plugin::Input(plugin),
        });
    }

    /// Append a pre-built processor plugin.
    pub fn add_processor(&mut self, spec: PluginSpec, plugin: Box<dyn ProcessorPlugin>) {
        self.processors.push(Stage {
            spec,
            plugin: Plugin::Processor(plugin),
        });
    }

    /// Install a pre-built output plugin.
    pub fn set_output(&mut self, spec: PluginSpec, plugin: Box<dyn OutputPlugin>) {
        self.output = Some(Stage {
            spec,
            plugin: Plugin::Output(plugin),
        });
    }

    /// Install the handler invoked by the control server's `set-log` command.
    pub fn set_log_level_handler(&mut self, handler: LogLevelHandler) {
        self.log_level_handler = Some(handler);
    }

    /// Run the pipeline to completion.
    pub fn run(self) -> Result<ExitStatus> {
        let Some(input) = self.input else {
            error!("no input plugin in the chain");
            return Ok(ExitStatus::UsageError);
        };
        let Some(output) = self.output else {
            error!("no output plugin in the chain");
            return Ok(ExitStatus::UsageError);
        };

        // Start every plugin before any thread exists. A start failure at
        // this point is fatal.
        let mut stages: Vec<Stage> = Vec::with_capacity(self.processors.len() + 2);
        stages.push(input);
        stages.extend(self.processors);
        stages.push(output);

        for (index, stage) in stages.iter_mut().enumerate() {
            if let Err(e) = start_plugin(&mut stage.plugin) {
                error!(
                    plugin = %stage.spec.name,
                    index,
                    error = format!("{e:#}"),
                    "plugin failed to start"
                );
                // Close the plugins already started.
                for started in stages.iter_mut().take(index) {
                    let _ = stop_plugin(&mut started.plugin);
                }
                return Ok(ExitStatus::ProcessingError);
            }
        }

        // Allocate the shared ring.
        let info: Vec<PluginInfo> = stages
            .iter()
            .map(|s| PluginInfo {
                kind: s.plugin.kind_letter(),
                name: s.spec.name.clone(),
                args: parking_lot::Mutex::new(s.spec.args.clone()),
            })
            .collect();
        let shared = PipelineShared::new(self.options, info);
        let buffer_count = shared.buffer.count();
        let n = stages.len();
        info!(
            plugins = n,
            buffer_packets = buffer_count,
            "starting transport stream processing"
        );

        // Extract the plugins back by kind, in ring order.
        let mut iter = stages.into_iter();
        let input_plugin = match iter.next().map(|s| s.plugin) {
            Some(Plugin::Input(p)) => p,
            _ => unreachable!("first stage is the input"),
        };
        let mut processor_plugins = Vec::new();
        let mut output_plugin = None;
        for stage in iter {
            match stage.plugin {
                Plugin::Processor(p) => processor_plugins.push(p),
                Plugin::Output(p) => output_plugin = Some(p),
                Plugin::Input(_) => unreachable!("only one input stage exists"),
            }
        }
        let output_plugin = output_plugin.expect("last stage is the output");

        // Preload the buffer from the input plugin, in this thread, before
        // any executor starts.
        let mut input_stage = InputStage::new(Executor::new(shared.clone(), 0), input_plugin);
        let (preloaded, bitrate, confidence) = input_stage.preload();
        if preloaded == 0 {
            error!("input plugin terminated without producing any packet");
            shared.set_error();
            return Ok(ExitStatus::ProcessingError);
        }

        // Distribute the initial slices: the first processor owns the
        // preloaded packets, the input owns the remaining free space, every
        // other executor starts empty. The initial bitrate is visible to all.
        {
            let mut state = shared.state.lock();
            for (index, slot) in state.iter_mut().enumerate() {
                slot.bitrate = bitrate;
                slot.confidence = confidence;
                match index {
                    0 => {
                        slot.first = preloaded % buffer_count;
                        slot.count = buffer_count - preloaded;
                    }
                    1 => {
                        slot.first = 0;
                        slot.count = preloaded;
                    }
                    _ => {
                        slot.first = 0;
                        slot.count = 0;
                    }
                }
            }
        }

        // Spawn the executor threads.
        let mut threads = Vec::with_capacity(n);
        threads.push(
            thread::Builder::new()
                .name("tsp-input".into())
                .spawn(move || input_stage.run())?,
        );
        for (i, plugin) in processor_plugins.into_iter().enumerate() {
            let index = i + 1;
            let exec = Executor::new(shared.clone(), index);
            let stage = ProcessorStage::new(exec, plugin);
            threads.push(
                thread::Builder::new()
                    .name(format!("tsp-proc-{index}"))
                    .spawn(move || stage.run())?,
            );
        }
        {
            let exec = Executor::new(shared.clone(), n - 1);
            let stage = OutputStage::new(exec, output_plugin);
            threads.push(
                thread::Builder::new()
                    .name("tsp-output".into())
                    .spawn(move || stage.run())?,
            );
        }

        // Start the control server and the monitor.
        let control = ControlServer::open(shared.clone(), self.log_level_handler.clone())?;
        let monitor = if shared.options.monitor {
            Some(crate::monitor::spawn_monitor(shared.clone()))
        } else {
            None
        };

        // Wait for all executors, in ring order starting from the input.
        for handle in threads {
            let _ = handle.join();
        }
        debug!("all executor threads terminated");

        // Shut the ancillary threads down.
        if let Some(control) = control {
            control.close();
        }
        if let Some(monitor) = monitor {
            monitor.close();
        }

        if shared.error.load(Ordering::Relaxed) {
            Ok(ExitStatus::ProcessingError)
        } else {
            Ok(ExitStatus::Success)
        }
    }
}
