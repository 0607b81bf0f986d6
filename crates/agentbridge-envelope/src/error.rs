/// Errors produced while encoding or decoding envelopes.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EnvelopeError {
    /// Input is not JSON, or not an object holding exactly `header` and `data` mappings.
    #[error("malformed envelope: {0}")]
    MalformedEnvelope(String),

    /// A value cannot be represented in the envelope's JSON value set.
    #[error("unsupported value: {0}")]
    UnsupportedValue(String),

    /// The symbol is not bound to any action.
    #[error("unknown action symbol '{0}'")]
    UnknownAction(char),

    /// A raw telemetry message could not be split into topic and payload.
    #[error("malformed message: {0}")]
    MalformedMessage(String),
}

pub type Result<T> = std::result::Result<T, EnvelopeError>;
