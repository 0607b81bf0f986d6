//! TCP transport for agentbridge.
//!
//! This is the lowest layer of agentbridge. It resolves [`Endpoint`]s, binds
//! listeners, connects clients, and hands out [`BridgeStream`]s that every
//! other layer reads from and writes to.

pub mod endpoint;
pub mod error;
pub mod stream;
pub mod tcp;

pub use endpoint::{Endpoint, DEFAULT_COMMAND_PORT, DEFAULT_HOST, DEFAULT_TELEMETRY_PORT};
pub use error::{Result, TransportError};
pub use stream::{BridgeStream, ShutdownHandle};
pub use tcp::TcpEndpoint;
