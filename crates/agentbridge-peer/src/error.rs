use std::time::Duration;

use agentbridge_envelope::EnvelopeError;
use agentbridge_frame::FrameError;
use agentbridge_transport::TransportError;

/// Errors surfaced by the command and telemetry channels.
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    /// The symbol is not in the action table. No I/O was attempted.
    #[error("unknown action symbol '{0}'")]
    UnknownAction(char),

    /// Agent ids are positive. No I/O was attempted.
    #[error("invalid agent id {0} (must be positive)")]
    InvalidAgentId(u32),

    /// No reply arrived within the bound. The request may still have been delivered.
    #[error("no reply within {0:?}")]
    RequestTimeout(Duration),

    /// No telemetry arrived within the bound. Expected; receive again.
    #[error("no telemetry message within {0:?}")]
    NoMessageAvailable(Duration),

    /// A reply arrived but is not a valid envelope.
    #[error("malformed reply: {0}")]
    MalformedReply(String),

    /// A telemetry message could not be split or its payload decoded.
    #[error("malformed message: {0}")]
    MalformedMessage(String),

    /// Envelope encoding failed.
    #[error("envelope error: {0}")]
    Envelope(EnvelopeError),

    /// Transport-level error.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// Frame-level error.
    #[error("frame error: {0}")]
    Frame(FrameError),

    /// The remote side closed the connection, or it was shut down locally.
    #[error("peer disconnected: {0}")]
    Disconnected(String),

    /// JSON serialization/deserialization error on the control channel.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl BridgeError {
    /// Whether the caller can reasonably retry on the same channel.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            BridgeError::RequestTimeout(_)
                | BridgeError::NoMessageAvailable(_)
                | BridgeError::MalformedReply(_)
                | BridgeError::MalformedMessage(_)
        )
    }

    /// Whether this is one of the bounded-wait timeouts.
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            BridgeError::RequestTimeout(_) | BridgeError::NoMessageAvailable(_)
        )
    }
}

impl From<FrameError> for BridgeError {
    fn from(err: FrameError) -> Self {
        match err {
            FrameError::ConnectionClosed => BridgeError::Disconnected(err.to_string()),
            other => BridgeError::Frame(other),
        }
    }
}

impl From<EnvelopeError> for BridgeError {
    fn from(err: EnvelopeError) -> Self {
        match err {
            EnvelopeError::UnknownAction(symbol) => BridgeError::UnknownAction(symbol),
            EnvelopeError::MalformedMessage(reason) => BridgeError::MalformedMessage(reason),
            other => BridgeError::Envelope(other),
        }
    }
}

pub type Result<T> = std::result::Result<T, BridgeError>;
