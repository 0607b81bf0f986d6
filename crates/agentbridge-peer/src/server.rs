//! Environment side of the command channel.

use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use agentbridge_envelope::{self as envelope, IncomingAction, Map};
use agentbridge_frame::{FrameConfig, COMMAND};
use agentbridge_transport::{Endpoint, TcpEndpoint};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::connection::FramedConnection;
use crate::error::{BridgeError, Result};

/// `data.status` of a reply to a request the environment accepted.
pub const STATUS_SUCCESS: &str = "SUCCESS";
/// `data.status` of a reply to a request the environment rejected.
pub const STATUS_ERROR: &str = "ERROR";

const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(20);

#[derive(Debug, Clone)]
pub struct ActionServerConfig {
    /// How long one `handle_next` waits for a request.
    pub poll_timeout: Duration,
    pub frame: FrameConfig,
}

impl Default for ActionServerConfig {
    fn default() -> Self {
        Self {
            poll_timeout: Duration::from_millis(1000),
            frame: FrameConfig::default(),
        }
    }
}

/// Listens for controller connections on the command endpoint.
pub struct ActionServer {
    listener: TcpEndpoint,
    config: ActionServerConfig,
}

impl ActionServer {
    pub fn bind(endpoint: &Endpoint, config: ActionServerConfig) -> Result<Self> {
        let listener = TcpEndpoint::bind(endpoint)?;
        info!(endpoint = %listener.endpoint(), "action server listening");
        Ok(Self { listener, config })
    }

    /// Accept the next controller (blocking).
    pub fn accept(&self) -> Result<ActionSession> {
        self.listener.set_nonblocking(false)?;
        let stream = self.listener.accept()?;
        Ok(self.session(FramedConnection::from_stream(
            stream,
            self.config.frame.clone(),
        )?))
    }

    /// Accept a controller if one is waiting. Switches the listener to polling mode.
    pub fn try_accept(&self) -> Result<Option<ActionSession>> {
        self.listener.set_nonblocking(true)?;
        match self.listener.try_accept()? {
            Some(stream) => {
                let connection = FramedConnection::from_stream(stream, self.config.frame.clone())?;
                Ok(Some(self.session(connection)))
            }
            None => Ok(None),
        }
    }

    /// Serve controllers one at a time until `stop` is set.
    ///
    /// Each request is passed to `handler`; an `Err` from the handler is
    /// reported back to the controller as an `ERROR` reply.
    pub fn serve<F>(&self, stop: &AtomicBool, mut handler: F) -> Result<()>
    where
        F: FnMut(&IncomingAction) -> std::result::Result<(), String>,
    {
        while !stop.load(Ordering::SeqCst) {
            let Some(mut session) = self.try_accept()? else {
                thread::sleep(ACCEPT_POLL_INTERVAL);
                continue;
            };
            info!(peer = session.peer(), "controller connected");

            while !stop.load(Ordering::SeqCst) {
                match session.handle_next(&mut handler) {
                    Ok(_) => {}
                    Err(BridgeError::Disconnected(_)) => {
                        info!(peer = session.peer(), "controller disconnected");
                        break;
                    }
                    Err(err) => {
                        warn!(peer = session.peer(), error = %err, "session failed");
                        break;
                    }
                }
            }
        }
        Ok(())
    }

    pub fn endpoint(&self) -> Endpoint {
        self.listener.endpoint()
    }

    pub fn config(&self) -> &ActionServerConfig {
        &self.config
    }

    fn session(&self, connection: FramedConnection) -> ActionSession {
        ActionSession {
            connection,
            poll_timeout: self.config.poll_timeout,
            next_seqno: 1,
        }
    }
}

/// Outcome of one handled request.
#[derive(Debug, Clone, PartialEq)]
pub struct HandledAction {
    /// The decoded request, or `None` when it could not be decoded.
    pub request: Option<IncomingAction>,
    /// Sequence number stamped on the reply.
    pub reply_seqno: u64,
    pub status: &'static str,
    pub reason: Option<String>,
}

impl HandledAction {
    pub fn is_success(&self) -> bool {
        self.status == STATUS_SUCCESS
    }
}

/// One connected controller.
pub struct ActionSession {
    connection: FramedConnection,
    poll_timeout: Duration,
    next_seqno: u64,
}

impl ActionSession {
    /// Wait up to the poll timeout for one request, hand it to `handler`, reply.
    ///
    /// Returns `Ok(None)` when no request arrived in time. Undecodable
    /// requests are answered with an `ERROR` reply, not an `Err`.
    pub fn handle_next<F>(&mut self, handler: F) -> Result<Option<HandledAction>>
    where
        F: FnOnce(&IncomingAction) -> std::result::Result<(), String>,
    {
        let Some(bytes) = self.connection.recv_on(COMMAND, self.poll_timeout)? else {
            return Ok(None);
        };

        let (request, outcome) = match IncomingAction::decode(&bytes) {
            Ok(request) => {
                debug!(
                    seqno = request.seqno,
                    agent_id = request.agent_id,
                    action = %request.action,
                    "action received"
                );
                (Some(request), handler(&request))
            }
            Err(err) => {
                warn!(error = %err, "undecodable action request");
                (None, Err(err.to_string()))
            }
        };

        let reply_seqno = self.next_seqno;
        self.next_seqno += 1;

        let mut header = Map::new();
        header.insert("seqno".to_string(), Value::from(reply_seqno));
        let mut data = Map::new();
        let (status, reason) = match outcome {
            Ok(()) => (STATUS_SUCCESS, None),
            Err(reason) => (STATUS_ERROR, Some(reason)),
        };
        data.insert("status".to_string(), Value::from(status));
        if let Some(reason) = &reason {
            data.insert("reason".to_string(), Value::from(reason.as_str()));
        }

        let reply = envelope::encode(&header, &data)?;
        self.connection.send(COMMAND, &reply)?;

        Ok(Some(HandledAction {
            request,
            reply_seqno,
            status,
            reason,
        }))
    }

    /// Address of the connected controller.
    pub fn peer(&self) -> &str {
        self.connection.endpoint()
    }
}
