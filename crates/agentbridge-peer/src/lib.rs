//! Command and telemetry channels for driving agents in a simulated environment.
//!
//! - [`CommandChannel`] dispatches one action at a time and waits a bounded
//!   time for the environment's acknowledgment.
//! - [`TelemetryChannel`] subscribes to a topic prefix and yields decoded
//!   telemetry messages as they stream in.
//!
//! The environment side of both patterns ([`ActionServer`],
//! [`TelemetryPublisher`]) lives here too, so the protocol can be served
//! from Rust as well as consumed.
//!
//! Channels run over this workspace's framed TCP by default. [`ZmqConnection`]
//! carries the same channels to an environment built on ZeroMQ sockets.

pub mod command;
pub mod connection;
pub mod control;
pub mod error;
pub mod publisher;
pub mod server;
pub mod telemetry;
pub mod zmq;

pub use command::{CommandChannel, CommandConfig, Reply, DEFAULT_REPLY_TIMEOUT};
pub use connection::{FramedConnection, RequestTransport, TelemetryTransport};
pub use control::{ControlMessage, CONTROL_SUBSCRIBE, CONTROL_UNSUBSCRIBE};
pub use error::{BridgeError, Result};
pub use publisher::{TelemetryPublisher, SEND_HIGH_WATER_MARK};
pub use server::{
    ActionServer, ActionServerConfig, ActionSession, HandledAction, STATUS_ERROR, STATUS_SUCCESS,
};
pub use telemetry::{Subscription, TelemetryChannel, TelemetryConfig, DEFAULT_RECEIVE_TIMEOUT};
pub use zmq::ZmqConnection;
