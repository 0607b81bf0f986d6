//! Topic-filtered telemetry subscription.

use std::time::{Duration, Instant};

use agentbridge_envelope::{decode_payload, split_message, TelemetryMessage, TopicFilter};
use agentbridge_frame::{FrameConfig, SocketType};
use agentbridge_transport::{Endpoint, ShutdownHandle};
use tracing::{debug, trace, warn};

use crate::connection::{FramedConnection, TelemetryTransport};
use crate::error::{BridgeError, Result};
use crate::zmq::ZmqConnection;

/// How long [`Subscription::receive`] waits for a message by default.
pub const DEFAULT_RECEIVE_TIMEOUT: Duration = Duration::from_millis(5000);

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    /// Upper bound on each receive.
    pub timeout: Duration,
    pub connect_timeout: Duration,
    pub frame: FrameConfig,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_RECEIVE_TIMEOUT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            frame: FrameConfig::default(),
        }
    }
}

/// An open, not yet subscribed, telemetry connection.
pub struct TelemetryChannel<T = FramedConnection> {
    transport: T,
    config: TelemetryConfig,
}

impl TelemetryChannel<FramedConnection> {
    /// Connect to the environment's telemetry endpoint.
    pub fn connect(endpoint: &Endpoint, config: TelemetryConfig) -> Result<Self> {
        let connection =
            FramedConnection::connect(endpoint, config.connect_timeout, config.frame.clone())?;
        debug!(%endpoint, "telemetry channel open");
        Ok(Self::with_transport(connection, config))
    }
}

impl TelemetryChannel<ZmqConnection> {
    /// Connect to an environment that publishes on a ZeroMQ PUB socket.
    pub fn connect_zmq(endpoint: &Endpoint, config: TelemetryConfig) -> Result<Self> {
        let connection = ZmqConnection::connect(
            endpoint,
            SocketType::Sub,
            config.connect_timeout,
            config.frame.clone(),
        )?;
        debug!(%endpoint, "telemetry channel open (zmq)");
        Ok(Self::with_transport(connection, config))
    }
}

impl<T: TelemetryTransport> TelemetryChannel<T> {
    pub fn with_transport(transport: T, config: TelemetryConfig) -> Self {
        Self { transport, config }
    }

    /// Subscribe to every topic starting with `prefix`. `""` subscribes to all.
    ///
    /// The prefix is pushed to the publisher and also kept as the local filter.
    pub fn subscribe(mut self, prefix: &str) -> Result<Subscription<T>> {
        self.transport.subscribe_hint(prefix)?;
        debug!(prefix, "subscribed");
        Ok(Subscription {
            transport: self.transport,
            config: self.config,
            filter: TopicFilter::new(prefix),
            dropped: 0,
        })
    }
}

/// A live subscription with its local topic filter.
///
/// Read by one consumer at a time; every receive takes `&mut self`.
pub struct Subscription<T = FramedConnection> {
    transport: T,
    config: TelemetryConfig,
    filter: TopicFilter,
    dropped: u64,
}

impl<T: TelemetryTransport> Subscription<T> {
    /// Wait for the next raw message and decode it.
    ///
    /// Returns `Ok(None)` when a message arrived whose topic does not match
    /// the filter; such messages are dropped without decoding their payload,
    /// so a malformed payload on another topic is never reported.
    /// No message within the timeout is [`BridgeError::NoMessageAvailable`].
    pub fn receive(&mut self) -> Result<Option<TelemetryMessage>> {
        self.receive_within(self.config.timeout)
    }

    /// Keep receiving until a matching message arrives or the receive
    /// timeout elapses overall. Malformed messages still surface as errors.
    pub fn next_message(&mut self) -> Result<TelemetryMessage> {
        let timeout = self.config.timeout;
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(BridgeError::NoMessageAvailable(timeout));
            }
            match self.receive_within(remaining) {
                Ok(Some(message)) => return Ok(message),
                Ok(None) => continue,
                Err(BridgeError::NoMessageAvailable(_)) => {
                    return Err(BridgeError::NoMessageAvailable(timeout))
                }
                Err(err) => return Err(err),
            }
        }
    }

    fn receive_within(&mut self, timeout: Duration) -> Result<Option<TelemetryMessage>> {
        let raw = self
            .transport
            .recv_raw(timeout)?
            .ok_or(BridgeError::NoMessageAvailable(timeout))?;

        let text = std::str::from_utf8(&raw).map_err(|err| {
            warn!(error = %err, "telemetry message is not utf-8");
            BridgeError::MalformedMessage(format!("not utf-8: {err}"))
        })?;
        let (topic, payload) = split_message(text).inspect_err(|err| {
            warn!(error = %err, "telemetry message has no payload");
        })?;

        if !self.filter.matches(topic) {
            self.dropped += 1;
            trace!(topic, prefix = self.filter.prefix(), "dropping unmatched topic");
            return Ok(None);
        }

        let envelope = decode_payload(payload).inspect_err(|err| {
            warn!(topic, error = %err, "undecodable telemetry payload");
        })?;
        trace!(topic, "telemetry received");
        Ok(Some(TelemetryMessage::new(topic, envelope)))
    }

    /// Replace the topic filter, both locally and on the publisher.
    pub fn resubscribe(&mut self, prefix: &str) -> Result<()> {
        self.transport.unsubscribe_hint(self.filter.prefix())?;
        self.transport.subscribe_hint(prefix)?;
        self.filter = TopicFilter::new(prefix);
        debug!(prefix, "resubscribed");
        Ok(())
    }

    pub fn filter(&self) -> &TopicFilter {
        &self.filter
    }

    /// Messages dropped so far because their topic did not match.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    pub fn config(&self) -> &TelemetryConfig {
        &self.config
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }
}

impl Subscription<FramedConnection> {
    /// Handle that aborts a pending receive from another thread.
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.transport.shutdown_handle()
    }
}

impl Subscription<ZmqConnection> {
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.transport.shutdown_handle()
    }
}
