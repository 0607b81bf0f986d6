//! Bounded request/reply dispatch of agent actions.

use std::time::Duration;

use agentbridge_envelope::{self as envelope, Action, ActionRequest, Envelope, RequestSchema};
use agentbridge_frame::{FrameConfig, SocketType};
use agentbridge_transport::{Endpoint, ShutdownHandle};
use tracing::{debug, trace, warn};

use crate::connection::{FramedConnection, RequestTransport};
use crate::error::{BridgeError, Result};
use crate::zmq::ZmqConnection;

/// How long [`CommandChannel::dispatch`] waits for a reply by default.
pub const DEFAULT_REPLY_TIMEOUT: Duration = Duration::from_millis(5000);

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Command channel configuration. Fixed once the channel is built.
#[derive(Debug, Clone)]
pub struct CommandConfig {
    /// Upper bound on the wait for each reply.
    pub timeout: Duration,
    pub connect_timeout: Duration,
    /// Layout of the outbound request `data`.
    pub schema: RequestSchema,
    pub frame: FrameConfig,
}

impl Default for CommandConfig {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_REPLY_TIMEOUT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            schema: RequestSchema::default(),
            frame: FrameConfig::default(),
        }
    }
}

/// The environment's acknowledgment of one request.
///
/// The reply schema belongs to the environment; beyond decodability nothing
/// is required. The accessors read the conventional `status`/`reason` fields.
#[derive(Debug, Clone, PartialEq)]
pub struct Reply {
    envelope: Envelope,
    request_seqno: u64,
}

impl Reply {
    pub fn new(envelope: Envelope, request_seqno: u64) -> Self {
        Self {
            envelope,
            request_seqno,
        }
    }

    /// Sequence number of the request this reply answered.
    pub fn request_seqno(&self) -> u64 {
        self.request_seqno
    }

    /// Sequence number the environment stamped in the reply header, if any.
    pub fn seqno(&self) -> Option<u64> {
        self.envelope.header_u64("seqno")
    }

    pub fn status(&self) -> Option<&str> {
        self.envelope.get_str("status")
    }

    pub fn reason(&self) -> Option<&str> {
        self.envelope.get_str("reason")
    }

    /// `status` is `SUCCESS` or `ok`, in any case.
    pub fn is_success(&self) -> bool {
        self.status().is_some_and(|status| {
            status.eq_ignore_ascii_case("SUCCESS") || status.eq_ignore_ascii_case("ok")
        })
    }

    pub fn envelope(&self) -> &Envelope {
        &self.envelope
    }

    pub fn into_envelope(self) -> Envelope {
        self.envelope
    }
}

/// Sends one action at a time and waits a bounded time for its reply.
///
/// Each call performs exactly one transmission and at most one reception.
/// The channel is not internally synchronized: `dispatch` takes `&mut self`,
/// so sharing one channel across threads needs a `Mutex` around it.
///
/// After a [`BridgeError::RequestTimeout`] the next dispatch resets the
/// transport (a fresh connection for [`FramedConnection`]) before sending,
/// so a reply that shows up late is never returned for a later request.
pub struct CommandChannel<T = FramedConnection> {
    transport: T,
    config: CommandConfig,
    next_seqno: u64,
    needs_reset: bool,
}

impl CommandChannel<FramedConnection> {
    /// Connect to the environment's command endpoint.
    pub fn connect(endpoint: &Endpoint, config: CommandConfig) -> Result<Self> {
        let connection =
            FramedConnection::connect(endpoint, config.connect_timeout, config.frame.clone())?;
        debug!(%endpoint, timeout_ms = config.timeout.as_millis() as u64, "command channel open");
        Ok(Self::with_transport(connection, config))
    }

    /// Handle that aborts a pending dispatch from another thread.
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.transport.shutdown_handle()
    }
}

impl CommandChannel<ZmqConnection> {
    /// Connect to an environment whose command endpoint is a ZeroMQ REP socket.
    pub fn connect_zmq(endpoint: &Endpoint, config: CommandConfig) -> Result<Self> {
        let connection = ZmqConnection::connect(
            endpoint,
            SocketType::Req,
            config.connect_timeout,
            config.frame.clone(),
        )?;
        debug!(
            %endpoint,
            timeout_ms = config.timeout.as_millis() as u64,
            "command channel open (zmq)"
        );
        Ok(Self::with_transport(connection, config))
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.transport.shutdown_handle()
    }
}

impl<T: RequestTransport> CommandChannel<T> {
    pub fn with_transport(transport: T, config: CommandConfig) -> Self {
        Self {
            transport,
            config,
            next_seqno: 1,
            needs_reset: false,
        }
    }

    /// Dispatch the action bound to `symbol` to agent `agent_id`.
    ///
    /// Unknown symbols and agent id `0` fail before any I/O and leave the
    /// sequence counter untouched.
    pub fn dispatch(&mut self, agent_id: u32, symbol: char) -> Result<Reply> {
        let action = Action::from_symbol(symbol).ok_or(BridgeError::UnknownAction(symbol))?;
        self.dispatch_action(agent_id, action)
    }

    /// Dispatch an already-resolved action.
    pub fn dispatch_action(&mut self, agent_id: u32, action: Action) -> Result<Reply> {
        if agent_id == 0 {
            return Err(BridgeError::InvalidAgentId(agent_id));
        }

        let seqno = self.next_seqno;
        let payload = ActionRequest::new(seqno, agent_id, action).encode(self.config.schema)?;

        if self.needs_reset {
            self.transport.reset()?;
            self.needs_reset = false;
            debug!(seqno, "transport reset after unanswered request");
        }

        // Consumed by the attempt, whatever its outcome.
        self.next_seqno += 1;
        self.transport.send_request(&payload)?;
        debug!(seqno, agent_id, %action, "action sent");
        trace!(payload = %String::from_utf8_lossy(&payload), "request");

        let bytes = match self.transport.recv_reply(self.config.timeout)? {
            Some(bytes) => bytes,
            None => {
                warn!(seqno, timeout_ms = self.config.timeout.as_millis() as u64, "no reply");
                self.needs_reset = true;
                return Err(BridgeError::RequestTimeout(self.config.timeout));
            }
        };
        trace!(payload = %String::from_utf8_lossy(&bytes), "reply");

        let envelope = envelope::decode(&bytes).map_err(|err| {
            warn!(seqno, error = %err, "undecodable reply");
            BridgeError::MalformedReply(err.to_string())
        })?;
        Ok(Reply::new(envelope, seqno))
    }

    /// Sequence number the next transmitted request will carry.
    pub fn next_seqno(&self) -> u64 {
        self.next_seqno
    }

    /// Sequence number of the most recent transmission attempt, if any.
    pub fn last_seqno(&self) -> Option<u64> {
        self.next_seqno.checked_sub(1).filter(|seqno| *seqno > 0)
    }

    pub fn config(&self) -> &CommandConfig {
        &self.config
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }
}
