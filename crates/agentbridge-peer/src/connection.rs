use std::time::{Duration, Instant};

use agentbridge_frame::{
    channel_name, FrameConfig, FrameReader, FrameWriter, COMMAND, CONTROL, TELEMETRY,
};
use agentbridge_transport::{BridgeStream, Endpoint, ShutdownHandle, TcpEndpoint};
use bytes::Bytes;
use tracing::{debug, trace};

use crate::control::ControlMessage;
use crate::error::{BridgeError, Result};

/// Request/reply side of a connection, as seen by [`CommandChannel`](crate::CommandChannel).
pub trait RequestTransport {
    /// Transmit one request.
    fn send_request(&mut self, payload: &[u8]) -> Result<()>;

    /// Wait up to `timeout` for the next reply. `Ok(None)` means nothing arrived.
    fn recv_reply(&mut self, timeout: Duration) -> Result<Option<Bytes>>;

    /// Abandon an exchange whose reply never came, so that reply cannot be
    /// read later in place of the next one.
    fn reset(&mut self) -> Result<()>;
}

/// Subscriber side of a connection, as seen by [`Subscription`](crate::Subscription).
pub trait TelemetryTransport {
    /// Tell the publisher which topic prefix this side wants.
    ///
    /// Publishers may ignore the hint; subscribers filter locally regardless.
    fn subscribe_hint(&mut self, prefix: &str) -> Result<()>;

    fn unsubscribe_hint(&mut self, prefix: &str) -> Result<()>;

    /// Wait up to `timeout` for the next raw telemetry message.
    fn recv_raw(&mut self, timeout: Duration) -> Result<Option<Bytes>>;
}

/// A framed TCP connection to one endpoint.
pub struct FramedConnection {
    reader: FrameReader<BridgeStream>,
    writer: FrameWriter<BridgeStream>,
    shutdown: ShutdownHandle,
    endpoint: String,
    config: FrameConfig,
    remote: Option<Remote>,
}

/// Where an outbound connection was made to, for reconnecting.
#[derive(Debug, Clone)]
struct Remote {
    endpoint: Endpoint,
    connect_timeout: Duration,
}

impl FramedConnection {
    /// Connect to `endpoint`, giving up after `connect_timeout`.
    pub fn connect(
        endpoint: &Endpoint,
        connect_timeout: Duration,
        config: FrameConfig,
    ) -> Result<Self> {
        let stream = TcpEndpoint::connect(endpoint, connect_timeout)?;
        debug!(endpoint = %endpoint, "connected");
        let mut connection = Self::from_stream(stream, config)?;
        connection.remote = Some(Remote {
            endpoint: endpoint.clone(),
            connect_timeout,
        });
        Ok(connection)
    }

    /// Wrap an already-connected stream (an accepted one, for example).
    pub fn from_stream(stream: BridgeStream, config: FrameConfig) -> Result<Self> {
        let endpoint = stream
            .peer_addr()
            .map(|addr| addr.to_string())
            .unwrap_or_else(|_| "unknown".to_string());
        let shutdown = stream.shutdown_handle()?;
        let reader_stream = stream.try_clone()?;
        let reader = FrameReader::with_config_stream(reader_stream, config.clone())?;
        let writer = FrameWriter::with_config_stream(stream, config.clone())?;
        Ok(Self {
            reader,
            writer,
            shutdown,
            endpoint,
            config,
            remote: None,
        })
    }

    /// Drop the current socket and connect again to the same endpoint.
    ///
    /// Anything still in flight on the old socket is discarded. Shutdown
    /// handles taken earlier keep working on the new socket. Connections
    /// wrapped with [`from_stream`](Self::from_stream) cannot reconnect.
    pub fn reconnect(&mut self) -> Result<()> {
        self.ensure_open()?;
        let Some(remote) = self.remote.clone() else {
            return Err(BridgeError::Disconnected(format!(
                "connection from {} cannot be re-established",
                self.endpoint
            )));
        };

        let stream = TcpEndpoint::connect(&remote.endpoint, remote.connect_timeout)?;
        let reader = FrameReader::with_config_stream(stream.try_clone()?, self.config.clone())?;
        self.shutdown.retarget(&stream)?;
        let writer = FrameWriter::with_config_stream(stream, self.config.clone())?;

        // Old halves close here, taking any late frames with them.
        self.reader = reader;
        self.writer = writer;
        debug!(endpoint = %remote.endpoint, "reconnected");
        Ok(())
    }

    /// Send one frame.
    pub fn send(&mut self, channel: u16, payload: &[u8]) -> Result<()> {
        self.ensure_open()?;
        self.writer.send(channel, payload)?;
        Ok(())
    }

    /// Wait up to `timeout` for the next frame on `channel`.
    ///
    /// Frames on other channels are discarded.
    pub fn recv_on(&mut self, channel: u16, timeout: Duration) -> Result<Option<Bytes>> {
        self.ensure_open()?;
        let deadline = Instant::now() + timeout;
        loop {
            let frame = match self.reader.read_frame_until(deadline) {
                Ok(frame) => frame,
                Err(_) if self.shutdown.is_shutdown() => return Err(self.closed()),
                Err(err) => return Err(err.into()),
            };
            match frame {
                None => return Ok(None),
                Some(frame) if frame.channel == channel => {
                    trace!(channel = channel_name(channel), size = frame.payload.len(), "received");
                    return Ok(Some(frame.payload));
                }
                Some(frame) => {
                    debug!(
                        expected = channel_name(channel),
                        got = channel_name(frame.channel),
                        "discarding frame on unexpected channel"
                    );
                }
            }
        }
    }

    /// Handle that unblocks pending receives from another thread.
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    /// Remote address this connection was made to.
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn ensure_open(&self) -> Result<()> {
        if self.shutdown.is_shutdown() {
            return Err(self.closed());
        }
        Ok(())
    }

    fn closed(&self) -> BridgeError {
        BridgeError::Disconnected(format!("connection to {} was shut down", self.endpoint))
    }
}

impl RequestTransport for FramedConnection {
    fn send_request(&mut self, payload: &[u8]) -> Result<()> {
        self.send(COMMAND, payload)
    }

    fn recv_reply(&mut self, timeout: Duration) -> Result<Option<Bytes>> {
        self.recv_on(COMMAND, timeout)
    }

    fn reset(&mut self) -> Result<()> {
        self.reconnect()
    }
}

impl TelemetryTransport for FramedConnection {
    fn subscribe_hint(&mut self, prefix: &str) -> Result<()> {
        let message = ControlMessage::subscribe(prefix).to_bytes()?;
        self.send(CONTROL, &message)
    }

    fn unsubscribe_hint(&mut self, prefix: &str) -> Result<()> {
        let message = ControlMessage::unsubscribe(prefix).to_bytes()?;
        self.send(CONTROL, &message)
    }

    fn recv_raw(&mut self, timeout: Duration) -> Result<Option<Bytes>> {
        self.recv_on(TELEMETRY, timeout)
    }
}

impl Drop for FramedConnection {
    fn drop(&mut self) {
        self.shutdown.shutdown();
    }
}

impl std::fmt::Debug for FramedConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FramedConnection")
            .field("endpoint", &self.endpoint)
            .field("shutdown", &self.shutdown.is_shutdown())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;

    fn pair() -> (FramedConnection, FramedConnection) {
        let listener = TcpEndpoint::bind(&Endpoint::new("127.0.0.1", 0)).unwrap();
        let endpoint = listener.endpoint();
        let server = thread::spawn(move || listener.accept().unwrap());
        let client =
            FramedConnection::connect(&endpoint, Duration::from_secs(2), FrameConfig::default())
                .unwrap();
        let server = FramedConnection::from_stream(server.join().unwrap(), FrameConfig::default())
            .unwrap();
        (client, server)
    }

    #[test]
    fn recv_on_skips_other_channels() {
        let (mut client, mut server) = pair();
        server.send(TELEMETRY, b"/agents/1 {}").unwrap();
        server.send(COMMAND, b"reply").unwrap();

        let payload = client
            .recv_on(COMMAND, Duration::from_secs(2))
            .unwrap()
            .expect("reply expected");
        assert_eq!(payload.as_ref(), b"reply");
    }

    #[test]
    fn recv_on_times_out_with_none() {
        let (mut client, _server) = pair();
        let started = Instant::now();
        assert!(client
            .recv_on(COMMAND, Duration::from_millis(40))
            .unwrap()
            .is_none());
        assert!(started.elapsed() >= Duration::from_millis(40));
    }

    #[test]
    fn peer_close_is_disconnected() {
        let (mut client, server) = pair();
        drop(server);
        let err = client
            .recv_on(COMMAND, Duration::from_secs(2))
            .unwrap_err();
        assert!(matches!(err, BridgeError::Disconnected(_)), "{err}");
    }

    #[test]
    fn shutdown_handle_unblocks_receive() {
        let (mut client, _server) = pair();
        let handle = client.shutdown_handle();

        let closer = thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            handle.shutdown();
        });

        let started = Instant::now();
        let err = client.recv_on(COMMAND, Duration::from_secs(5)).unwrap_err();
        assert!(matches!(err, BridgeError::Disconnected(_)), "{err}");
        assert!(started.elapsed() < Duration::from_secs(4));
        closer.join().unwrap();

        assert!(matches!(
            client.send(COMMAND, b"late"),
            Err(BridgeError::Disconnected(_))
        ));
    }

    #[test]
    fn subscribe_hint_is_a_control_frame() {
        let (mut client, mut server) = pair();
        client.subscribe_hint("/agents/1").unwrap();

        let payload = server
            .recv_on(CONTROL, Duration::from_secs(2))
            .unwrap()
            .expect("control frame");
        let message = ControlMessage::from_slice(&payload).unwrap();
        assert_eq!(message, ControlMessage::subscribe("/agents/1"));
    }

    #[test]
    fn reconnect_drops_frames_sent_on_old_socket() {
        let listener = TcpEndpoint::bind(&Endpoint::new("127.0.0.1", 0)).unwrap();
        let endpoint = listener.endpoint();
        let mut client =
            FramedConnection::connect(&endpoint, Duration::from_secs(2), FrameConfig::default())
                .unwrap();
        let mut old =
            FramedConnection::from_stream(listener.accept().unwrap(), FrameConfig::default())
                .unwrap();
        let handle = client.shutdown_handle();

        client.reconnect().unwrap();
        let mut new =
            FramedConnection::from_stream(listener.accept().unwrap(), FrameConfig::default())
                .unwrap();
        let _ = old.send(COMMAND, b"stale");
        new.send(COMMAND, b"fresh").unwrap();

        let payload = client
            .recv_on(COMMAND, Duration::from_secs(2))
            .unwrap()
            .expect("frame from new socket");
        assert_eq!(payload.as_ref(), b"fresh");

        handle.shutdown();
        assert!(matches!(
            client.recv_on(COMMAND, Duration::from_secs(2)),
            Err(BridgeError::Disconnected(_))
        ));
    }

    #[test]
    fn accepted_connection_cannot_reconnect() {
        let (_client, mut server) = pair();
        assert!(matches!(
            server.reconnect(),
            Err(BridgeError::Disconnected(_))
        ));
    }
}
