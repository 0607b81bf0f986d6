use std::io::{ErrorKind, Read};
use std::time::{Duration, Instant};

use agentbridge_transport::BridgeStream;
use bytes::BytesMut;
use tracing::trace;

use crate::codec::{decode_frame, Frame, FrameConfig};
use crate::error::{is_timeout_kind, FrameError, Result};

const INITIAL_BUFFER_CAPACITY: usize = 8 * 1024;
const READ_CHUNK_SIZE: usize = 8 * 1024;

/// Streams whose blocking reads can be bounded by a timeout.
pub trait ReadTimeout {
    fn set_read_timeout(&self, timeout: Option<Duration>) -> std::io::Result<()>;
}

impl ReadTimeout for BridgeStream {
    fn set_read_timeout(&self, timeout: Option<Duration>) -> std::io::Result<()> {
        BridgeStream::set_read_timeout(self, timeout).map_err(transport_to_io)
    }
}

/// Reads complete frames from any `Read` stream.
///
/// Partial reads are buffered internally, including across a timed-out
/// [`read_frame_until`](FrameReader::read_frame_until), so a frame that
/// straddles a deadline is delivered whole by the next read.
pub struct FrameReader<T> {
    inner: T,
    buf: BytesMut,
    config: FrameConfig,
}

impl<T: Read> FrameReader<T> {
    pub fn new(inner: T) -> Self {
        Self::with_config(inner, FrameConfig::default())
    }

    pub fn with_config(inner: T, config: FrameConfig) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(INITIAL_BUFFER_CAPACITY),
            config,
        }
    }

    /// Read the next complete frame (blocking).
    ///
    /// Returns `Err(FrameError::ConnectionClosed)` when EOF is reached.
    pub fn read_frame(&mut self) -> Result<Frame> {
        loop {
            if let Some(frame) = decode_frame(&mut self.buf, self.config.max_payload_size)? {
                trace!(channel = frame.channel, size = frame.payload.len(), "frame read");
                return Ok(frame);
            }
            self.fill()?;
        }
    }

    /// Frames already buffered and decodable without touching the stream.
    pub fn buffered_frame(&mut self) -> Result<Option<Frame>> {
        decode_frame(&mut self.buf, self.config.max_payload_size)
    }

    fn fill(&mut self) -> Result<()> {
        let mut chunk = [0u8; READ_CHUNK_SIZE];
        loop {
            match self.inner.read(&mut chunk) {
                Ok(0) => return Err(FrameError::ConnectionClosed),
                Ok(n) => {
                    self.buf.extend_from_slice(&chunk[..n]);
                    return Ok(());
                }
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(FrameError::Io(err)),
            }
        }
    }

    pub fn get_ref(&self) -> &T {
        &self.inner
    }

    pub fn get_mut(&mut self) -> &mut T {
        &mut self.inner
    }

    pub fn into_inner(self) -> T {
        self.inner
    }

    pub fn config(&self) -> &FrameConfig {
        &self.config
    }
}

impl<T: Read + ReadTimeout> FrameReader<T> {
    /// Read the next complete frame, giving up at `deadline`.
    ///
    /// Returns `Ok(None)` if no complete frame arrived in time. The socket read
    /// timeout is re-armed with the remaining time before every read, so the
    /// call returns no later than the deadline plus one scheduling slice.
    pub fn read_frame_until(&mut self, deadline: Instant) -> Result<Option<Frame>> {
        let result = self.read_until_inner(deadline);
        self.inner
            .set_read_timeout(self.config.read_timeout)
            .map_err(FrameError::Io)?;
        result
    }

    /// [`read_frame_until`](Self::read_frame_until) with a relative timeout.
    pub fn read_frame_timeout(&mut self, timeout: Duration) -> Result<Option<Frame>> {
        self.read_frame_until(Instant::now() + timeout)
    }

    fn read_until_inner(&mut self, deadline: Instant) -> Result<Option<Frame>> {
        loop {
            if let Some(frame) = decode_frame(&mut self.buf, self.config.max_payload_size)? {
                return Ok(Some(frame));
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            self.inner
                .set_read_timeout(Some(deadline - now))
                .map_err(FrameError::Io)?;

            match self.fill() {
                Ok(()) => {}
                Err(FrameError::Io(err)) if is_timeout_kind(err.kind()) => {
                    if Instant::now() >= deadline {
                        return Ok(None);
                    }
                }
                Err(err) => return Err(err),
            }
        }
    }
}

impl FrameReader<BridgeStream> {
    /// Create a frame reader for a `BridgeStream` and apply the configured read timeout.
    pub fn with_config_stream(inner: BridgeStream, config: FrameConfig) -> Result<Self> {
        inner
            .set_read_timeout(config.read_timeout)
            .map_err(|err| FrameError::Io(transport_to_io(err)))?;
        Ok(Self::with_config(inner, config))
    }
}

pub(crate) fn transport_to_io(err: agentbridge_transport::TransportError) -> std::io::Error {
    use agentbridge_transport::TransportError;

    match err {
        TransportError::Io(io) | TransportError::Accept(io) => io,
        TransportError::Bind { source, .. } | TransportError::Connect { source, .. } => source,
        other => std::io::Error::other(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use std::io::{Cursor, Write};
    use std::net::{TcpListener, TcpStream};

    use bytes::{BufMut, BytesMut};

    use super::*;
    use crate::codec::{encode_frame, MAGIC};
    use crate::writer::FrameWriter;

    impl ReadTimeout for TcpStream {
        fn set_read_timeout(&self, timeout: Option<Duration>) -> std::io::Result<()> {
            TcpStream::set_read_timeout(self, timeout.map(|t| t.max(Duration::from_millis(1))))
        }
    }

    fn tcp_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let left = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (right, _) = listener.accept().unwrap();
        (left, right)
    }

    fn wire(frames: &[(u16, &str)]) -> Vec<u8> {
        let mut buf = BytesMut::new();
        for (channel, payload) in frames {
            encode_frame(*channel, payload.as_bytes(), &mut buf).unwrap();
        }
        buf.to_vec()
    }

    #[test]
    fn reads_frames_in_order() {
        let bytes = wire(&[(1, "request"), (2, "topic {}"), (0, "{}")]);
        let mut reader = FrameReader::new(Cursor::new(bytes));

        let channels: Vec<u16> = (0..3).map(|_| reader.read_frame().unwrap().channel).collect();
        assert_eq!(channels, vec![1, 2, 0]);
    }

    #[test]
    fn reassembles_byte_at_a_time_input() {
        let reader = Trickle {
            bytes: wire(&[(1, "slow reply")]),
            pos: 0,
        };
        let mut reader = FrameReader::new(reader);
        let frame = reader.read_frame().unwrap();
        assert_eq!(frame.payload.as_ref(), b"slow reply");
    }

    #[test]
    fn eof_before_and_during_frame_is_connection_closed() {
        let mut empty = FrameReader::new(Cursor::new(Vec::<u8>::new()));
        assert!(matches!(
            empty.read_frame().unwrap_err(),
            FrameError::ConnectionClosed
        ));

        let mut partial = BytesMut::new();
        partial.put_slice(&MAGIC);
        partial.put_u32_le(32);
        partial.put_u16_le(1);
        partial.put_slice(b"truncated");
        let mut reader = FrameReader::new(Cursor::new(partial.to_vec()));
        assert!(matches!(
            reader.read_frame().unwrap_err(),
            FrameError::ConnectionClosed
        ));
    }

    #[test]
    fn interrupted_reads_are_retried() {
        let reader = InterruptOnce {
            interrupted: false,
            inner: Cursor::new(wire(&[(1, "ok")])),
        };
        let mut reader = FrameReader::new(reader);
        assert_eq!(reader.read_frame().unwrap().payload.as_ref(), b"ok");
    }

    #[test]
    fn read_until_returns_none_when_nothing_arrives() {
        let (_left, right) = tcp_pair();
        let mut reader = FrameReader::new(right);

        let started = Instant::now();
        let frame = reader
            .read_frame_timeout(Duration::from_millis(50))
            .unwrap();
        let elapsed = started.elapsed();

        assert!(frame.is_none());
        assert!(elapsed >= Duration::from_millis(50), "returned early: {elapsed:?}");
        assert!(elapsed < Duration::from_secs(2), "overshot deadline: {elapsed:?}");
    }

    #[test]
    fn read_until_keeps_partial_frame_for_next_call() {
        let (mut left, right) = tcp_pair();
        let mut reader = FrameReader::new(right);

        let bytes = wire(&[(1, "split across deadline")]);
        left.write_all(&bytes[..5]).unwrap();
        assert!(reader
            .read_frame_timeout(Duration::from_millis(30))
            .unwrap()
            .is_none());

        left.write_all(&bytes[5..]).unwrap();
        let frame = reader
            .read_frame_timeout(Duration::from_secs(2))
            .unwrap()
            .expect("frame should complete");
        assert_eq!(frame.payload.as_ref(), b"split across deadline");
    }

    #[test]
    fn read_until_delivers_frame_sent_before_deadline() {
        let (left, right) = tcp_pair();
        let mut reader = FrameReader::new(right);

        let sender = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            let mut writer = FrameWriter::new(left);
            writer.send(2, b"/agents/1/state {}").unwrap();
            writer
        });

        let frame = reader
            .read_frame_timeout(Duration::from_secs(2))
            .unwrap()
            .expect("frame should arrive");
        assert_eq!(frame.channel, 2);
        let _writer = sender.join().unwrap();
    }

    #[test]
    fn read_until_restores_configured_timeout() {
        let (_left, right) = tcp_pair();
        let mut reader = FrameReader::new(right);
        let _ = reader.read_frame_timeout(Duration::from_millis(5)).unwrap();

        assert_eq!(reader.get_ref().read_timeout().unwrap(), None);
    }

    #[test]
    fn buffered_frame_does_not_read_stream() {
        let mut reader = FrameReader::new(Cursor::new(wire(&[(1, "a"), (1, "b")])));
        assert!(reader.buffered_frame().unwrap().is_none());

        reader.read_frame().unwrap();
        let next = reader.buffered_frame().unwrap().expect("second frame buffered");
        assert_eq!(next.payload.as_ref(), b"b");
    }

    struct Trickle {
        bytes: Vec<u8>,
        pos: usize,
    }

    impl Read for Trickle {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            if self.pos >= self.bytes.len() || buf.is_empty() {
                return Ok(0);
            }
            buf[0] = self.bytes[self.pos];
            self.pos += 1;
            Ok(1)
        }
    }

    struct InterruptOnce {
        interrupted: bool,
        inner: Cursor<Vec<u8>>,
    }

    impl Read for InterruptOnce {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            if !self.interrupted {
                self.interrupted = true;
                return Err(std::io::Error::from(ErrorKind::Interrupted));
            }
            self.inner.read(buf)
        }
    }
}
