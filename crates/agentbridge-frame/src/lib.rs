//! Length-prefixed framing with channel tags for agentbridge streams.
//!
//! Each message on the wire is one frame:
//! - a 2-byte magic number ("AB") for stream synchronization
//! - a 4-byte little-endian payload length
//! - a 2-byte little-endian channel ID
//!
//! Callers only ever see complete frames. Reads can be bounded by a deadline,
//! which is what the command and telemetry channels build their timeouts on.
//!
//! [`zmtp`] speaks the ZeroMQ wire instead, for peers that are real ZeroMQ
//! sockets.

pub mod channel;
pub mod codec;
pub mod error;
pub mod reader;
pub mod writer;
pub mod zmtp;

pub use channel::{channel_name, COMMAND, CONTROL, TELEMETRY};
pub use codec::{decode_frame, encode_frame, Frame, FrameConfig, DEFAULT_MAX_PAYLOAD, HEADER_SIZE};
pub use error::{FrameError, Result};
pub use reader::{FrameReader, ReadTimeout};
pub use writer::FrameWriter;
pub use zmtp::{SocketType, ZmtpStream};
