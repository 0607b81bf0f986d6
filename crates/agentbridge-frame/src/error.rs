/// Errors that can occur during frame encoding/decoding.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// The frame header does not start with the bridge magic.
    #[error("invalid frame magic (expected 0x4142 \"AB\")")]
    InvalidMagic,

    /// The payload exceeds the configured maximum size.
    #[error("payload too large ({size} bytes, max {max})")]
    PayloadTooLarge { size: usize, max: usize },

    /// An I/O error occurred while reading or writing frames.
    #[error("frame I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The connection was closed before a complete frame was received.
    #[error("connection closed (incomplete frame)")]
    ConnectionClosed,

    /// The ZMTP greeting or READY exchange failed.
    #[error("zmtp handshake failed: {0}")]
    Handshake(String),
}

impl FrameError {
    /// True for the I/O errors a socket reports when its read/write timeout fires.
    pub fn is_timeout(&self) -> bool {
        matches!(self, FrameError::Io(err) if is_timeout_kind(err.kind()))
    }
}

pub(crate) fn is_timeout_kind(kind: std::io::ErrorKind) -> bool {
    matches!(
        kind,
        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
    )
}

pub type Result<T> = std::result::Result<T, FrameError>;
