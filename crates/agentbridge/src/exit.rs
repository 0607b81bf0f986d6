//! Process exit codes and how channel errors map onto them.

use std::fmt;
use std::io;

use agentbridge_frame::FrameError;
use agentbridge_peer::BridgeError;
use agentbridge_transport::TransportError;

pub const SUCCESS: i32 = 0;
/// The environment could not be reached, or dropped the connection.
pub const FAILURE: i32 = 1;
/// A reply, telemetry message, or frame that does not decode.
pub const DATA_INVALID: i32 = 60;
pub const USAGE: i32 = 64;
/// Nothing arrived within the configured bound.
pub const TIMEOUT: i32 = 124;
/// A local failure unrelated to the environment.
pub const INTERNAL: i32 = 125;
/// Exit status of a run cut short by Ctrl-C.
pub const INTERRUPTED: i32 = 130;

pub type CliResult<T> = Result<T, CliError>;

#[derive(Debug)]
pub struct CliError {
    pub code: i32,
    pub message: String,
}

impl CliError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl fmt::Display for CliError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for CliError {}

pub fn io_error(context: &str, err: io::Error) -> CliError {
    CliError::new(io_code(&err), format!("{context}: {err}"))
}

fn io_code(err: &io::Error) -> i32 {
    match err.kind() {
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => TIMEOUT,
        io::ErrorKind::ConnectionRefused
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionAborted
        | io::ErrorKind::NotConnected
        | io::ErrorKind::AddrInUse
        | io::ErrorKind::AddrNotAvailable
        | io::ErrorKind::PermissionDenied => FAILURE,
        _ => INTERNAL,
    }
}

/// Exit code for a channel error.
pub fn exit_code(err: &BridgeError) -> i32 {
    match err {
        BridgeError::Transport(TransportError::InvalidEndpoint(_)) => USAGE,
        BridgeError::Transport(
            TransportError::Bind { source, .. }
            | TransportError::Connect { source, .. }
            | TransportError::Accept(source)
            | TransportError::Io(source),
        ) => io_code(source),
        BridgeError::Frame(FrameError::Io(source)) => io_code(source),
        BridgeError::Frame(FrameError::ConnectionClosed) | BridgeError::Disconnected(_) => FAILURE,
        BridgeError::Frame(_)
        | BridgeError::MalformedReply(_)
        | BridgeError::MalformedMessage(_)
        | BridgeError::Envelope(_)
        | BridgeError::Json(_) => DATA_INVALID,
        BridgeError::RequestTimeout(_) | BridgeError::NoMessageAvailable(_) => TIMEOUT,
        BridgeError::UnknownAction(_) | BridgeError::InvalidAgentId(_) => USAGE,
    }
}

pub fn bridge_error(context: &str, err: BridgeError) -> CliError {
    CliError::new(
        exit_code(&err),
        format!("{context}: {err}{}", wire_hint(&err)),
    )
}

/// Foreign bytes where a frame or greeting was expected usually mean the
/// environment speaks the other wire.
fn wire_hint(err: &BridgeError) -> &'static str {
    match err {
        BridgeError::Frame(FrameError::InvalidMagic) => {
            " (is the environment a ZeroMQ socket? try --wire zmq)"
        }
        BridgeError::Frame(FrameError::Handshake(_)) => {
            " (is the environment an agentbridge server? try --wire framed)"
        }
        _ => "",
    }
}
