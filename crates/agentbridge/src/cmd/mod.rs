use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use agentbridge_transport::{
    ShutdownHandle, DEFAULT_COMMAND_PORT, DEFAULT_HOST, DEFAULT_TELEMETRY_PORT,
};
use clap::{Args, Subcommand, ValueEnum};

use crate::exit::{CliError, CliResult, INTERNAL, USAGE};
use crate::output::OutputFormat;

pub mod client;
pub mod serve;
pub mod subscribe;
pub mod version;

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Read action symbols from stdin and dispatch them to an agent.
    Client(ClientArgs),
    /// Print telemetry messages on a topic prefix.
    Subscribe(SubscribeArgs),
    /// Run a loopback environment (action server + telemetry publisher).
    Serve(ServeArgs),
    /// Show version information.
    Version(VersionArgs),
}

pub fn run(command: Command, format: OutputFormat) -> CliResult<i32> {
    match command {
        Command::Client(args) => client::run(args, format),
        Command::Subscribe(args) => subscribe::run(args, format),
        Command::Serve(args) => serve::run(args),
        Command::Version(args) => version::run(args),
    }
}

/// Wire protocol spoken to the environment.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum Wire {
    /// Length-prefixed frames, as served by `agentbridge serve`.
    Framed,
    /// ZMTP 3.0, for environments on ZeroMQ REP/PUB sockets.
    Zmq,
}

#[derive(Args, Debug)]
pub struct ClientArgs {
    /// Environment host.
    #[arg(long, env = "AGENTBRIDGE_HOST", default_value = DEFAULT_HOST)]
    pub host: String,
    /// Port of the environment's action listener.
    #[arg(long, env = "AGENTBRIDGE_COMMAND_PORT", default_value_t = DEFAULT_COMMAND_PORT)]
    pub port: u16,
    /// Agent the actions are addressed to.
    #[arg(long, env = "AGENTBRIDGE_AGENT_ID", default_value_t = 1)]
    pub agent: u32,
    /// How long to wait for each reply (e.g. 5s, 500ms).
    #[arg(long, env = "AGENTBRIDGE_TIMEOUT", default_value = "5s")]
    pub timeout: String,
    /// Wire protocol of the environment's action listener.
    #[arg(long, env = "AGENTBRIDGE_WIRE", value_enum, default_value_t = Wire::Framed)]
    pub wire: Wire,
    /// Send `{"action": ...}` only, without seqno and agent id.
    #[arg(long)]
    pub legacy: bool,
    /// Print requests and replies.
    #[arg(long, short = 'v')]
    pub verbose: bool,
}

#[derive(Args, Debug)]
pub struct SubscribeArgs {
    /// Environment host.
    #[arg(long, env = "AGENTBRIDGE_HOST", default_value = DEFAULT_HOST)]
    pub host: String,
    /// Port of the environment's telemetry publisher.
    #[arg(long, env = "AGENTBRIDGE_TELEMETRY_PORT", default_value_t = DEFAULT_TELEMETRY_PORT)]
    pub port: u16,
    /// Topic prefix to subscribe to. Empty subscribes to everything.
    #[arg(long, env = "AGENTBRIDGE_TOPIC", default_value = "")]
    pub topic: String,
    /// How long each receive waits (e.g. 5s, 500ms).
    #[arg(long, env = "AGENTBRIDGE_TIMEOUT", default_value = "5s")]
    pub timeout: String,
    /// Wire protocol of the environment's publisher.
    #[arg(long, env = "AGENTBRIDGE_WIRE", value_enum, default_value_t = Wire::Framed)]
    pub wire: Wire,
    /// Exit after printing N messages.
    #[arg(long)]
    pub count: Option<usize>,
    /// Give up after this many consecutive empty receive windows.
    #[arg(long)]
    pub idle_limit: Option<u32>,
}

#[derive(Args, Debug)]
pub struct ServeArgs {
    /// Host to bind.
    #[arg(long, env = "AGENTBRIDGE_HOST", default_value = DEFAULT_HOST)]
    pub host: String,
    /// Port for action requests.
    #[arg(long, env = "AGENTBRIDGE_COMMAND_PORT", default_value_t = DEFAULT_COMMAND_PORT)]
    pub command_port: u16,
    /// Port for telemetry.
    #[arg(long, env = "AGENTBRIDGE_TELEMETRY_PORT", default_value_t = DEFAULT_TELEMETRY_PORT)]
    pub telemetry_port: u16,
    /// Number of agents in the environment (ids 1..=N).
    #[arg(long, default_value_t = 1)]
    pub agents: u32,
    /// Period between state broadcasts (e.g. 1s, 250ms).
    #[arg(long, default_value = "1s")]
    pub interval: String,
}

#[derive(Args, Debug)]
pub struct VersionArgs {
    /// Show extended build provenance.
    #[arg(long)]
    pub extended: bool,
}

/// Parse humane durations: `5s`, `500ms`, or a bare number of seconds.
pub fn parse_duration(input: &str) -> CliResult<Duration> {
    let input = input.trim();
    if input.is_empty() {
        return Err(CliError::new(USAGE, "duration must not be empty"));
    }

    let (number, millis) = if let Some(num) = input.strip_suffix("ms") {
        (num, true)
    } else if let Some(num) = input.strip_suffix('s') {
        (num, false)
    } else {
        (input, false)
    };

    let value: u64 = number
        .trim()
        .parse()
        .map_err(|_| CliError::new(USAGE, format!("invalid duration value: {input}")))?;

    if value == 0 {
        return Err(CliError::new(USAGE, "duration must be greater than zero"));
    }

    Ok(if millis {
        Duration::from_millis(value)
    } else {
        Duration::from_secs(value)
    })
}

/// Clear `running` on Ctrl-C and close `handle`, so a blocked receive returns at once.
pub fn install_ctrlc_handler(
    running: Arc<AtomicBool>,
    handle: Option<ShutdownHandle>,
) -> CliResult<()> {
    ctrlc::set_handler(move || {
        running.store(false, Ordering::SeqCst);
        if let Some(handle) = &handle {
            handle.shutdown();
        }
    })
    .map_err(|err| CliError::new(INTERNAL, format!("failed to install Ctrl-C handler: {err}")))
}
