//! Channels over the ZeroMQ wire, for environments that bind real ZeroMQ
//! REP and PUB sockets.

use std::time::{Duration, Instant};

use agentbridge_frame::{FrameConfig, SocketType, ZmtpStream};
use agentbridge_transport::{BridgeStream, Endpoint, ShutdownHandle, TcpEndpoint};
use bytes::{BufMut, Bytes, BytesMut};
use tracing::{debug, trace};

use crate::connection::{RequestTransport, TelemetryTransport};
use crate::error::{BridgeError, Result};

const SUBSCRIBE: u8 = 0x01;
const UNSUBSCRIBE: u8 = 0x00;

/// A ZMTP session acting as a REQ or SUB socket.
///
/// As REQ, each request goes out behind an empty delimiter part and replies
/// are stripped of theirs. As SUB, subscriptions are sent to the publisher
/// and replayed after a reconnect.
pub struct ZmqConnection {
    session: ZmtpStream,
    shutdown: ShutdownHandle,
    endpoint: Endpoint,
    connect_timeout: Duration,
    config: FrameConfig,
    subscriptions: Vec<String>,
}

impl ZmqConnection {
    /// Connect and handshake as `socket_type` (`Req` or `Sub`).
    pub fn connect(
        endpoint: &Endpoint,
        socket_type: SocketType,
        connect_timeout: Duration,
        config: FrameConfig,
    ) -> Result<Self> {
        let stream = TcpEndpoint::connect(endpoint, connect_timeout)?;
        let shutdown = stream.shutdown_handle()?;
        let session = handshake(stream, socket_type, connect_timeout, &config)?;
        debug!(%endpoint, socket = socket_type.name(), "zmq connected");
        Ok(Self {
            session,
            shutdown,
            endpoint: endpoint.clone(),
            connect_timeout,
            config,
            subscriptions: Vec::new(),
        })
    }

    /// Drop the session and open a new one to the same endpoint.
    ///
    /// Subscriptions are sent again; shutdown handles taken earlier follow
    /// the new socket.
    pub fn reconnect(&mut self) -> Result<()> {
        self.ensure_open()?;
        let socket_type = self.session.socket_type();
        let stream = TcpEndpoint::connect(&self.endpoint, self.connect_timeout)?;
        self.shutdown.retarget(&stream)?;
        self.session = handshake(stream, socket_type, self.connect_timeout, &self.config)?;
        for prefix in self.subscriptions.clone() {
            self.send_subscription(SUBSCRIBE, &prefix)?;
        }
        debug!(endpoint = %self.endpoint, "zmq reconnected");
        Ok(())
    }

    /// Handle that unblocks pending receives from another thread.
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn socket_type(&self) -> SocketType {
        self.session.socket_type()
    }

    fn send_parts(&mut self, parts: &[&[u8]]) -> Result<()> {
        self.ensure_open()?;
        self.session.send_message(parts).map_err(|err| self.map_err(err))
    }

    /// Next message before `deadline`, as its parts.
    fn recv_parts(&mut self, deadline: Instant) -> Result<Option<Vec<Bytes>>> {
        self.ensure_open()?;
        self.session
            .recv_message_until(deadline)
            .map_err(|err| self.map_err(err))
    }

    fn send_subscription(&mut self, kind: u8, prefix: &str) -> Result<()> {
        let mut message = BytesMut::with_capacity(1 + prefix.len());
        message.put_u8(kind);
        message.put_slice(prefix.as_bytes());
        self.send_parts(&[&message])
    }

    fn ensure_open(&self) -> Result<()> {
        if self.shutdown.is_shutdown() {
            return Err(self.closed());
        }
        Ok(())
    }

    fn map_err(&self, err: agentbridge_frame::FrameError) -> BridgeError {
        if self.shutdown.is_shutdown() {
            self.closed()
        } else {
            err.into()
        }
    }

    fn closed(&self) -> BridgeError {
        BridgeError::Disconnected(format!("connection to {} was shut down", self.endpoint))
    }
}

fn handshake(
    stream: BridgeStream,
    socket_type: SocketType,
    timeout: Duration,
    config: &FrameConfig,
) -> Result<ZmtpStream> {
    Ok(ZmtpStream::handshake(
        stream,
        socket_type,
        false,
        config.clone(),
        timeout,
    )?)
}

impl RequestTransport for ZmqConnection {
    fn send_request(&mut self, payload: &[u8]) -> Result<()> {
        self.send_parts(&[b"", payload])
    }

    fn recv_reply(&mut self, timeout: Duration) -> Result<Option<Bytes>> {
        let deadline = Instant::now() + timeout;
        loop {
            let Some(mut parts) = self.recv_parts(deadline)? else {
                return Ok(None);
            };
            let Some(delimiter) = parts.iter().position(|part| part.is_empty()) else {
                debug!(parts = parts.len(), "discarding reply without delimiter");
                continue;
            };
            let body = join(parts.split_off(delimiter + 1), b"");
            trace!(size = body.len(), "zmq reply");
            return Ok(Some(body));
        }
    }

    fn reset(&mut self) -> Result<()> {
        self.reconnect()
    }
}

impl TelemetryTransport for ZmqConnection {
    fn subscribe_hint(&mut self, prefix: &str) -> Result<()> {
        self.send_subscription(SUBSCRIBE, prefix)?;
        self.subscriptions.push(prefix.to_string());
        Ok(())
    }

    fn unsubscribe_hint(&mut self, prefix: &str) -> Result<()> {
        self.send_subscription(UNSUBSCRIBE, prefix)?;
        if let Some(ndx) = self.subscriptions.iter().position(|p| p == prefix) {
            self.subscriptions.remove(ndx);
        }
        Ok(())
    }

    /// Single-part messages are returned as sent. A topic sent as its own
    /// part is joined to the payload with one space.
    fn recv_raw(&mut self, timeout: Duration) -> Result<Option<Bytes>> {
        let deadline = Instant::now() + timeout;
        Ok(self.recv_parts(deadline)?.map(|parts| join(parts, b" ")))
    }
}

fn join(mut parts: Vec<Bytes>, separator: &[u8]) -> Bytes {
    if parts.len() == 1 {
        return parts.remove(0);
    }
    let mut joined = BytesMut::new();
    for (ndx, part) in parts.iter().enumerate() {
        if ndx > 0 {
            joined.put_slice(separator);
        }
        joined.put_slice(part);
    }
    joined.freeze()
}

impl Drop for ZmqConnection {
    fn drop(&mut self) {
        self.shutdown.shutdown();
    }
}

impl std::fmt::Debug for ZmqConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ZmqConnection")
            .field("endpoint", &self.endpoint)
            .field("socket", &self.session.socket_type())
            .field("shutdown", &self.shutdown.is_shutdown())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use agentbridge_envelope::{self as envelope, TelemetryMessage};
    use serde_json::json;

    use super::*;
    use crate::command::{CommandChannel, CommandConfig};
    use crate::telemetry::{TelemetryChannel, TelemetryConfig};

    const WAIT: Duration = Duration::from_secs(2);

    fn listener() -> TcpEndpoint {
        TcpEndpoint::bind(&Endpoint::new("127.0.0.1", 0)).unwrap()
    }

    fn accept_as(listener: &TcpEndpoint, socket_type: SocketType) -> ZmtpStream {
        let stream = listener.accept().unwrap();
        ZmtpStream::handshake(stream, socket_type, true, FrameConfig::default(), WAIT).unwrap()
    }

    fn recv(session: &mut ZmtpStream) -> Vec<Bytes> {
        session
            .recv_message_until(Instant::now() + WAIT)
            .unwrap()
            .expect("message")
    }

    #[test]
    fn dispatch_against_rep_socket() {
        let listener = listener();
        let endpoint = listener.endpoint();
        let environment = thread::spawn(move || {
            let mut rep = accept_as(&listener, SocketType::Rep);
            let request = recv(&mut rep);
            assert_eq!(request.len(), 2);
            assert!(request[0].is_empty());
            let decoded = envelope::decode(&request[1]).unwrap();
            assert_eq!(decoded.get_str("action"), Some("up"));

            let reply = envelope::encode(&json!({"seqno": 1}), &json!({"status": "SUCCESS"}))
                .unwrap();
            rep.send_message(&[b"", &reply]).unwrap();
        });

        let connection = ZmqConnection::connect(
            &endpoint,
            SocketType::Req,
            WAIT,
            FrameConfig::default(),
        )
        .unwrap();
        let mut channel = CommandChannel::with_transport(connection, CommandConfig::default());
        let reply = channel.dispatch(3, 'W').unwrap();
        assert!(reply.is_success());
        assert_eq!(reply.seqno(), Some(1));
        environment.join().unwrap();
    }

    #[test]
    fn late_reply_on_abandoned_socket_is_not_returned() {
        let listener = listener();
        let endpoint = listener.endpoint();
        let environment = thread::spawn(move || {
            let mut slow = accept_as(&listener, SocketType::Rep);
            let _unanswered = recv(&mut slow);

            let mut fresh = accept_as(&listener, SocketType::Rep);
            let late = envelope::encode(&json!({"seqno": 1}), &json!({"status": "late"})).unwrap();
            let _ = slow.send_message(&[b"", &late]);

            let request = recv(&mut fresh);
            let seqno = envelope::decode(&request[1])
                .unwrap()
                .get("seqno")
                .and_then(serde_json::Value::as_u64)
                .unwrap();
            let reply =
                envelope::encode(&json!({"seqno": seqno}), &json!({"status": "SUCCESS"})).unwrap();
            fresh.send_message(&[b"", &reply]).unwrap();
        });

        let connection =
            ZmqConnection::connect(&endpoint, SocketType::Req, WAIT, FrameConfig::default())
                .unwrap();
        let config = CommandConfig {
            timeout: Duration::from_millis(100),
            ..CommandConfig::default()
        };
        let mut channel = CommandChannel::with_transport(connection, config);
        assert!(matches!(
            channel.dispatch(1, 'A'),
            Err(BridgeError::RequestTimeout(_))
        ));

        let reply = channel.dispatch(1, 'D').unwrap();
        assert_eq!(reply.request_seqno(), 2);
        assert_eq!(reply.seqno(), Some(2));
        assert!(reply.is_success());
        environment.join().unwrap();
    }

    #[test]
    fn subscription_against_pub_socket() {
        let listener = listener();
        let endpoint = listener.endpoint();
        let environment = thread::spawn(move || {
            let mut publisher = accept_as(&listener, SocketType::Pub);
            let subscribe = recv(&mut publisher);
            assert_eq!(subscribe, vec![Bytes::from_static(b"\x01/agents/2")]);

            let state =
                TelemetryMessage::encode("/agents/2/state", &json!({}), &json!({"x": 4})).unwrap();
            publisher.send_message(&[&state]).unwrap();
            publisher
                .send_message(&[b"/agents/2/pose", br#"{"header":{},"data":{"y":1}}"#])
                .unwrap();
        });

        let connection = ZmqConnection::connect(
            &endpoint,
            SocketType::Sub,
            WAIT,
            FrameConfig::default(),
        )
        .unwrap();
        let mut subscription = TelemetryChannel::with_transport(connection, TelemetryConfig::default())
            .subscribe("/agents/2")
            .unwrap();

        let first = subscription.next_message().unwrap();
        assert_eq!(first.topic, "/agents/2/state");
        assert_eq!(first.data["x"], 4);
        let second = subscription.next_message().unwrap();
        assert_eq!(second.topic, "/agents/2/pose");
        environment.join().unwrap();
    }

    #[test]
    fn framed_peer_fails_handshake() {
        let listener = listener();
        let endpoint = listener.endpoint();
        let environment = thread::spawn(move || {
            let stream = listener.accept().unwrap();
            let mut writer = agentbridge_frame::FrameWriter::new(stream);
            let _ = writer.send(agentbridge_frame::COMMAND, &[0u8; 64]);
            thread::sleep(Duration::from_millis(100));
        });

        let err = ZmqConnection::connect(&endpoint, SocketType::Req, WAIT, FrameConfig::default())
            .unwrap_err();
        assert!(
            matches!(err, BridgeError::Frame(agentbridge_frame::FrameError::Handshake(_))),
            "{err}"
        );
        environment.join().unwrap();
    }

    #[test]
    fn shutdown_handle_unblocks_receive() {
        let listener = listener();
        let endpoint = listener.endpoint();
        let environment = thread::spawn(move || {
            let publisher = accept_as(&listener, SocketType::Pub);
            thread::sleep(Duration::from_millis(300));
            drop(publisher);
        });

        let mut connection =
            ZmqConnection::connect(&endpoint, SocketType::Sub, WAIT, FrameConfig::default())
                .unwrap();
        let handle = connection.shutdown_handle();
        let closer = thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            handle.shutdown();
        });

        let err = connection.recv_raw(Duration::from_secs(5)).unwrap_err();
        assert!(matches!(err, BridgeError::Disconnected(_)), "{err}");
        closer.join().unwrap();
        environment.join().unwrap();
    }

    #[test]
    fn join_separates_topic_part() {
        assert_eq!(join(vec![Bytes::from_static(b"a {}")], b" ").as_ref(), b"a {}");
        assert_eq!(
            join(vec![Bytes::from_static(b"a"), Bytes::from_static(b"{}")], b" ").as_ref(),
            b"a {}"
        );
    }
}
