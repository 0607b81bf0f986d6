use std::io::{self, BufRead, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use agentbridge_envelope::{Action, ActionRequest, RequestSchema};
use agentbridge_peer::{BridgeError, CommandChannel, CommandConfig, Reply, RequestTransport};
use agentbridge_transport::{Endpoint, ShutdownHandle};

use crate::cmd::{install_ctrlc_handler, parse_duration, ClientArgs, Wire};
use crate::exit::{bridge_error, io_error, CliError, CliResult, INTERRUPTED, SUCCESS, USAGE};
use crate::output::{print_reply, OutputFormat};

const PROMPT: &str = "action (A, W, S, D, Q, E)? ";
const INPUT_POLL: Duration = Duration::from_millis(100);

pub fn run(args: ClientArgs, format: OutputFormat) -> CliResult<i32> {
    let timeout = parse_duration(&args.timeout)?;
    if args.agent == 0 {
        return Err(CliError::new(USAGE, "--agent must be a positive agent id"));
    }
    let schema = if args.legacy {
        RequestSchema::Legacy
    } else {
        RequestSchema::Rich
    };

    let endpoint = Endpoint::new(args.host.clone(), args.port);
    let config = CommandConfig {
        timeout,
        schema,
        ..CommandConfig::default()
    };
    match args.wire {
        Wire::Framed => {
            let channel = CommandChannel::connect(&endpoint, config)
                .map_err(|err| bridge_error("connect failed", err))?;
            let handle = channel.shutdown_handle();
            drive(channel, handle, &args, schema, format)
        }
        Wire::Zmq => {
            let channel = CommandChannel::connect_zmq(&endpoint, config)
                .map_err(|err| bridge_error("connect failed", err))?;
            let handle = channel.shutdown_handle();
            drive(channel, handle, &args, schema, format)
        }
    }
}

fn drive<T: RequestTransport>(
    mut channel: CommandChannel<T>,
    handle: ShutdownHandle,
    args: &ClientArgs,
    schema: RequestSchema,
    format: OutputFormat,
) -> CliResult<i32> {
    let running = Arc::new(AtomicBool::new(true));
    install_ctrlc_handler(running.clone(), Some(handle))?;

    let lines = spawn_stdin_reader();
    prompt();
    while running.load(Ordering::SeqCst) {
        let line = match lines.recv_timeout(INPUT_POLL) {
            Ok(line) => line.map_err(|err| io_error("failed reading stdin", err))?,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        };

        if args.verbose {
            print_request(&channel, args.agent, &line, schema);
        }
        match dispatch_line(&mut channel, args.agent, &line) {
            Ok(Some((action, reply))) => {
                if args.verbose {
                    print_reply(&reply, args.agent, action, format);
                }
            }
            Ok(None) => {}
            Err(err) if err.is_recoverable() => {
                tracing::warn!(error = %err, "action not acknowledged");
                eprintln!("error: {err}");
            }
            Err(_) if !running.load(Ordering::SeqCst) => break,
            Err(err) => return Err(bridge_error("dispatch failed", err)),
        }
        prompt();
    }

    if running.load(Ordering::SeqCst) {
        Ok(SUCCESS)
    } else {
        Ok(INTERRUPTED)
    }
}

/// Dispatch one input line if it names a bound symbol.
///
/// A line is a single symbol, case-insensitive, surrounding whitespace
/// ignored. Anything else returns `Ok(None)` so the caller prompts again.
fn dispatch_line<T: RequestTransport>(
    channel: &mut CommandChannel<T>,
    agent_id: u32,
    line: &str,
) -> Result<Option<(Action, Reply)>, BridgeError> {
    let Some(symbol) = line_symbol(line) else {
        return Ok(None);
    };
    let Some(action) = Action::from_symbol(symbol) else {
        return Ok(None);
    };
    channel
        .dispatch(agent_id, symbol)
        .map(|reply| Some((action, reply)))
}

fn line_symbol(line: &str) -> Option<char> {
    let mut chars = line.trim().chars();
    match (chars.next(), chars.next()) {
        (Some(symbol), None) => Some(symbol.to_ascii_uppercase()),
        _ => None,
    }
}

fn print_request<T: RequestTransport>(
    channel: &CommandChannel<T>,
    agent_id: u32,
    line: &str,
    schema: RequestSchema,
) {
    let Some(action) = line_symbol(line).and_then(Action::from_symbol) else {
        return;
    };
    let request = ActionRequest::new(channel.next_seqno(), agent_id, action);
    if let Ok(bytes) = request.encode(schema) {
        eprintln!("request: {}", String::from_utf8_lossy(&bytes));
    }
}

fn prompt() {
    let mut err = io::stderr();
    let _ = err.write_all(PROMPT.as_bytes());
    let _ = err.flush();
}

fn spawn_stdin_reader() -> Receiver<io::Result<String>> {
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        for line in io::stdin().lock().lines() {
            if tx.send(line).is_err() {
                break;
            }
        }
    });
    rx
}
