//! Control server
//!
//! A line-oriented TCP service for runtime reconfiguration of a running
//! pipeline: list the chain, change the log level, suspend or resume a stage,
//! restart a plugin with new arguments, or terminate the processing. One
//! connection is served at a time; only allow-listed source addresses may
//! connect. The server runs a current-thread async runtime on its own thread,
//! distinct from all plugin threads, and synchronizes with them through the
//! shared ring state only.

use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use anyhow::{Context, Result};
use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::sync::Notify;
use tokio_util::codec::{Framed, LinesCodec};
use tracing::{debug, info, warn};

use crate::pipeline::{PipelineShared, RestartDone, RestartRequest};

/// Callback changing the global log level, installed by the application.
pub type LogLevelHandler =
    Arc<dyn Fn(&str) -> std::result::Result<(), String> + Send + Sync>;

/// Running control server; `close` shuts it down and joins its thread.
pub struct ControlServer {
    thread: Option<JoinHandle<()>>,
    shutdown: Arc<Notify>,
}

impl ControlServer {
    /// Start the server thread if a control port is configured.
    pub(crate) fn open(
        shared: Arc<PipelineShared>,
        log_handler: Option<LogLevelHandler>,
    ) -> Result<Option<Self>> {
        let Some(port) = shared.options.control.port else {
            return Ok(None);
        };
        let addr = SocketAddr::new(shared.options.control.local, port);
        let reuse = shared.options.control.reuse;
        let shutdown = Arc::new(Notify::new());
        let shutdown2 = shutdown.clone();

        // Report bind errors synchronously: a bad control configuration is
        // fatal before any packet flows.
        let (tx, rx) = std::sync::mpsc::channel::<Result<()>>();

        let thread = thread::Builder::new()
            .name("tsp-control".into())
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(rt) => rt,
                    Err(e) => {
                        let _ = tx.send(Err(e.into()));
                        return;
                    }
                };
                runtime.block_on(async move {
                    let listener = match bind(addr, reuse) {
                        Ok(l) => {
                            let _ = tx.send(Ok(()));
                            l
                        }
                        Err(e) => {
                            let _ = tx.send(Err(e));
                            return;
                        }
                    };
                    info!(%addr, "control command server listening");
                    serve(listener, shared, log_handler, shutdown2).await;
                    debug!("control command thread completed");
                });
            })
            .context("cannot spawn control server thread")?;

        rx.recv()
            .context("control server thread died during startup")?
            .context("error starting TCP server for control commands")?;

        Ok(Some(Self {
            thread: Some(thread),
            shutdown,
        }))
    }

    /// Stop the server and join its thread.
    pub fn close(mut self) {
        self.shutdown.notify_one();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

fn bind(addr: SocketAddr, reuse: bool) -> Result<TcpListener> {
    let socket = match addr {
        SocketAddr::V4(_) => TcpSocket::new_v4()?,
        SocketAddr::V6(_) => TcpSocket::new_v6()?,
    };
    if reuse {
        socket.set_reuseaddr(true)?;
    }
    socket.bind(addr)?;
    Ok(socket.listen(5)?)
}

async fn serve(
    listener: TcpListener,
    shared: Arc<PipelineShared>,
    log_handler: Option<LogLevelHandler>,
    shutdown: Arc<Notify>,
) {
    // Commands are short: serve one connection at a time.
    loop {
        tokio::select! {
            _ = shutdown.notified() => break,
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, source)) => {
                        handle_connection(stream, source, &shared, &log_handler).await;
                    }
                    Err(e) => {
                        warn!(error = %e, "control connection accept error");
                    }
                }
            }
        }
    }
}

/// True when `source` may send control commands.
fn authorized(source: IpAddr, shared: &PipelineShared) -> bool {
    source.is_loopback() || shared.options.control.sources.contains(&source)
}

async fn handle_connection(
    stream: TcpStream,
    source: SocketAddr,
    shared: &Arc<PipelineShared>,
    log_handler: &Option<LogLevelHandler>,
) {
    let mut framed = Framed::new(stream, LinesCodec::new_with_max_length(4096));

    if !authorized(source.ip(), shared) {
        warn!(%source, "connection attempt from unauthorized source (ignored)");
        let _ = framed
            .send("error: client address is not authorized".to_string())
            .await;
        return;
    }

    // The receive timeout bounds each command.
    let timeout = shared.options.control.timeout;
    let line = match tokio::time::timeout(timeout, framed.next()).await {
        Ok(Some(Ok(line))) => line,
        Ok(Some(Err(e))) => {
            warn!(%source, error = %e, "control connection receive error");
            return;
        }
        Ok(None) => return,
        Err(_) => {
            let _ = framed.send("error: receive timeout".to_string()).await;
            return;
        }
    };
    info!(%source, command = %line, "received control command");

    for response in execute_command(&line, shared, log_handler) {
        if framed.send(response).await.is_err() {
            break;
        }
    }
}

/// Parse and execute one command line, returning the response lines.
fn execute_command(
    line: &str,
    shared: &Arc<PipelineShared>,
    log_handler: &Option<LogLevelHandler>,
) -> Vec<String> {
    let tokens: Vec<&str> = line.split_whitespace().collect();
    match tokens.split_first() {
        None => vec!["error: empty command".to_string()],
        Some((&"exit", rest)) => execute_exit(rest, shared),
        Some((&"set-log", rest)) => execute_set_log(rest, log_handler),
        Some((&"list", _)) => execute_list(shared),
        Some((&"suspend", rest)) => execute_suspend_resume(true, rest, shared),
        Some((&"resume", rest)) => execute_suspend_resume(false, rest, shared),
        Some((&"restart", rest)) => execute_restart(rest, shared),
        Some((cmd, _)) => vec![format!("error: invalid control command: {cmd}")],
    }
}

fn execute_exit(args: &[&str], shared: &Arc<PipelineShared>) -> Vec<String> {
    if args.contains(&"--abort") {
        // Immediate exit, no cleanup.
        std::process::exit(1);
    }
    info!("exit requested by remote control");
    // Place all executors in the aborted state so that each one sees its
    // successor as aborted, and wake everyone up.
    let _state = shared.state.lock();
    for flag in &shared.aborting {
        flag.store(true, Ordering::Relaxed);
    }
    for cond in &shared.conds {
        cond.notify_all();
    }
    vec!["exiting".to_string()]
}

fn execute_set_log(args: &[&str], log_handler: &Option<LogLevelHandler>) -> Vec<String> {
    let Some(level) = args.first() else {
        return vec!["error: set-log: missing level".to_string()];
    };
    match log_handler {
        None => vec!["error: log level control is not available".to_string()],
        Some(handler) => match handler(level) {
            Ok(()) => {
                info!(level, "set log level");
                vec![format!("log level set to {level}")]
            }
            Err(e) => vec![format!("error: {e}")],
        },
    }
}

fn execute_list(shared: &Arc<PipelineShared>) -> Vec<String> {
    let state = shared.state.lock();
    shared
        .info
        .iter()
        .enumerate()
        .map(|(index, info)| {
            let suspended = if state[index].suspended {
                "(suspended) "
            } else {
                ""
            };
            let args = info.args.lock().join(" ");
            if args.is_empty() {
                format!("{index:2}: {suspended}-{} {}", info.kind, info.name)
            } else {
                format!("{index:2}: {suspended}-{} {} {args}", info.kind, info.name)
            }
        })
        .collect()
}

fn execute_suspend_resume(
    suspend: bool,
    args: &[&str],
    shared: &Arc<PipelineShared>,
) -> Vec<String> {
    let count = shared.plugin_count();
    let Some(index) = args.first().and_then(|v| v.parse::<usize>().ok()) else {
        return vec!["error: invalid plugin index".to_string()];
    };
    if index == 0 {
        return vec!["error: cannot suspend/resume the input plugin".to_string()];
    }
    if index >= count {
        return vec![format!(
            "error: invalid plugin index {index}, specify 1 to {}",
            count - 1
        )];
    }
    shared.state.lock()[index].suspended = suspend;
    vec![format!(
        "plugin {index} {}",
        if suspend { "suspended" } else { "resumed" }
    )]
}

fn execute_restart(args: &[&str], shared: &Arc<PipelineShared>) -> Vec<String> {
    let count = shared.plugin_count();
    let Some(index) = args.first().and_then(|v| v.parse::<usize>().ok()) else {
        return vec!["error: invalid plugin index".to_string()];
    };
    if index >= count {
        return vec![format!(
            "error: invalid plugin index {index}, specify 0 to {}",
            count - 1
        )];
    }
    let params: Vec<String> = args[1..].iter().map(|s| s.to_string()).collect();
    let same = params.iter().any(|p| p == "--same");
    if same && params.len() > 1 {
        return vec!["error: do not specify new plugin options with --same".to_string()];
    }

    let done = RestartDone::new();
    {
        let mut state = shared.state.lock();
        // A previous pending restart is interrupted by this one.
        if let Some(previous) = state[index].restart.take() {
            previous.done.complete(
                false,
                vec!["restart interrupted by another concurrent restart".to_string()],
            );
        }
        state[index].restart = Some(RestartRequest {
            args: (!same).then_some(params),
            done: done.clone(),
        });
        shared.conds[index].notify_all();
    }

    // Wait for the owning plugin thread to execute the restart.
    let (success, mut messages) = done.wait();
    messages.push(if success {
        "restarted".to_string()
    } else {
        "error: restart failed".to_string()
    });
    messages
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::{PluginInfo, TspOptions};
    use parking_lot::Mutex;

    fn test_shared(n: usize) -> Arc<PipelineShared> {
        let info = (0..n)
            .map(|i| PluginInfo {
                kind: if i == 0 {
                    'I'
                } else if i == n - 1 {
                    'O'
                } else {
                    'P'
                },
                name: format!("plugin{i}"),
                args: Mutex::new(vec![]),
            })
            .collect();
        let options = TspOptions {
            buffer_size: 16 * 188,
            ..Default::default()
        };
        PipelineShared::new(options, info)
    }

    #[test]
    fn test_list_command() {
        let shared = test_shared(3);
        shared.state.lock()[1].suspended = true;
        let out = execute_list(&shared);
        assert_eq!(out.len(), 3);
        assert!(out[0].contains("-I plugin0"));
        assert!(out[1].contains("(suspended) -P plugin1"));
        assert!(out[2].contains("-O plugin2"));
    }

    #[test]
    fn test_suspend_rules() {
        let shared = test_shared(3);
        // The input stage cannot be suspended.
        let out = execute_suspend_resume(true, &["0"], &shared);
        assert!(out[0].starts_with("error"));
        // Out-of-range index.
        let out = execute_suspend_resume(true, &["9"], &shared);
        assert!(out[0].starts_with("error"));
        // A processor can.
        let out = execute_suspend_resume(true, &["1"], &shared);
        assert!(!out[0].starts_with("error"));
        assert!(shared.state.lock()[1].suspended);
        let out = execute_suspend_resume(false, &["1"], &shared);
        assert!(!out[0].starts_with("error"));
        assert!(!shared.state.lock()[1].suspended);
    }

    #[test]
    fn test_exit_sets_abort_flags() {
        let shared = test_shared(3);
        execute_exit(&[], &shared);
        for flag in &shared.aborting {
            assert!(flag.load(Ordering::Relaxed));
        }
    }

    #[test]
    fn test_invalid_command() {
        let shared = test_shared(2);
        let out = execute_command("frobnicate", &shared, &None);
        assert!(out[0].starts_with("error"));
    }

    #[test]
    fn test_restart_same_with_args_rejected() {
        let shared = test_shared(3);
        let out = execute_restart(&["1", "--same", "xxx"], &shared);
        assert!(out[0].starts_with("error"));
    }
}
