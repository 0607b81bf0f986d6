//! ZMTP 3.0 with the NULL mechanism, the wire spoken by ZeroMQ peers.
//!
//! Only what request/reply and publish/subscribe need is covered: the
//! greeting, the READY command, and message frames. Every other command
//! is skipped on receipt.

use std::io::{ErrorKind, Read, Write};
use std::time::{Duration, Instant};

use agentbridge_transport::BridgeStream;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tracing::{debug, trace};

use crate::codec::FrameConfig;
use crate::error::{is_timeout_kind, FrameError, Result};
use crate::reader::transport_to_io;

/// Size of the greeting each side sends first.
pub const GREETING_SIZE: usize = 64;

const SIGNATURE_HEAD: u8 = 0xFF;
const SIGNATURE_TAIL: u8 = 0x7F;
const VERSION_MAJOR: u8 = 3;
const VERSION_MINOR: u8 = 0;
const MECHANISM_NULL: &[u8] = b"NULL";
const MECHANISM_SIZE: usize = 20;

const FLAG_MORE: u8 = 0x01;
const FLAG_LONG: u8 = 0x02;
const FLAG_COMMAND: u8 = 0x04;

const READY: &str = "READY";
const ERROR: &str = "ERROR";
const SOCKET_TYPE: &str = "Socket-Type";

const READ_CHUNK_SIZE: usize = 8 * 1024;

/// ZeroMQ socket roles this crate can take or talk to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketType {
    Req,
    Rep,
    Pub,
    Sub,
}

impl SocketType {
    pub fn name(self) -> &'static str {
        match self {
            SocketType::Req => "REQ",
            SocketType::Rep => "REP",
            SocketType::Pub => "PUB",
            SocketType::Sub => "SUB",
        }
    }

    fn from_name(name: &[u8]) -> Option<Self> {
        match name {
            b"REQ" => Some(SocketType::Req),
            b"REP" | b"ROUTER" => Some(SocketType::Rep),
            b"PUB" | b"XPUB" => Some(SocketType::Pub),
            b"SUB" | b"XSUB" => Some(SocketType::Sub),
            _ => None,
        }
    }

    /// Whether a peer of type `peer` may talk to this socket.
    pub fn accepts(self, peer: SocketType) -> bool {
        matches!(
            (self, peer),
            (SocketType::Req, SocketType::Rep)
                | (SocketType::Rep, SocketType::Req)
                | (SocketType::Pub, SocketType::Sub)
                | (SocketType::Sub, SocketType::Pub)
        )
    }
}

/// One decoded ZMTP frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ZmtpFrame {
    /// A message part; `more` is set on every part except the last.
    Message { more: bool, body: Bytes },
    Command { name: String, body: Bytes },
}

/// The full 64-byte greeting for the NULL mechanism.
pub fn greeting(as_server: bool) -> [u8; GREETING_SIZE] {
    let mut bytes = [0u8; GREETING_SIZE];
    bytes[0] = SIGNATURE_HEAD;
    bytes[9] = SIGNATURE_TAIL;
    bytes[10] = VERSION_MAJOR;
    bytes[11] = VERSION_MINOR;
    bytes[12..12 + MECHANISM_NULL.len()].copy_from_slice(MECHANISM_NULL);
    bytes[12 + MECHANISM_SIZE] = u8::from(as_server);
    bytes
}

/// Validate a peer greeting: signature, version 3 or later, NULL mechanism.
pub fn check_greeting(bytes: &[u8; GREETING_SIZE]) -> Result<()> {
    if bytes[0] != SIGNATURE_HEAD || bytes[9] & SIGNATURE_TAIL != SIGNATURE_TAIL {
        return Err(FrameError::Handshake("peer is not a ZMTP socket".into()));
    }
    if bytes[10] < VERSION_MAJOR {
        return Err(FrameError::Handshake(format!(
            "unsupported ZMTP version {}.{}",
            bytes[10], bytes[11]
        )));
    }
    let mechanism = &bytes[12..12 + MECHANISM_SIZE];
    let name_len = mechanism.iter().position(|b| *b == 0).unwrap_or(MECHANISM_SIZE);
    if &mechanism[..name_len] != MECHANISM_NULL {
        return Err(FrameError::Handshake(format!(
            "unsupported security mechanism {}",
            String::from_utf8_lossy(&mechanism[..name_len])
        )));
    }
    Ok(())
}

/// Encode one message part.
pub fn encode_message(body: &[u8], more: bool, dst: &mut BytesMut) {
    let flags = if more { FLAG_MORE } else { 0 };
    put_frame(flags, body, dst);
}

/// Encode a command frame.
pub fn encode_command(name: &str, body: &[u8], dst: &mut BytesMut) {
    let mut command = BytesMut::with_capacity(1 + name.len() + body.len());
    command.put_u8(name.len() as u8);
    command.put_slice(name.as_bytes());
    command.put_slice(body);
    put_frame(FLAG_COMMAND, &command, dst);
}

fn put_frame(flags: u8, body: &[u8], dst: &mut BytesMut) {
    if body.len() > u8::MAX as usize {
        dst.reserve(9 + body.len());
        dst.put_u8(flags | FLAG_LONG);
        dst.put_u64(body.len() as u64);
    } else {
        dst.reserve(2 + body.len());
        dst.put_u8(flags);
        dst.put_u8(body.len() as u8);
    }
    dst.put_slice(body);
}

/// READY command body announcing `socket_type`.
pub fn ready_body(socket_type: SocketType) -> BytesMut {
    let mut body = BytesMut::new();
    body.put_u8(SOCKET_TYPE.len() as u8);
    body.put_slice(SOCKET_TYPE.as_bytes());
    body.put_u32(socket_type.name().len() as u32);
    body.put_slice(socket_type.name().as_bytes());
    body
}

/// Read the peer's socket type out of a READY body.
pub fn parse_ready(mut body: &[u8]) -> Result<SocketType> {
    let truncated = || FrameError::Handshake("truncated READY metadata".into());
    while body.has_remaining() {
        let name_len = body.get_u8() as usize;
        if body.remaining() < name_len + 4 {
            return Err(truncated());
        }
        let (name, rest) = body.split_at(name_len);
        body = rest;
        let value_len = body.get_u32() as usize;
        if body.remaining() < value_len {
            return Err(truncated());
        }
        let (value, rest) = body.split_at(value_len);
        body = rest;

        if name.eq_ignore_ascii_case(SOCKET_TYPE.as_bytes()) {
            return SocketType::from_name(value).ok_or_else(|| {
                FrameError::Handshake(format!(
                    "unsupported peer socket type {}",
                    String::from_utf8_lossy(value)
                ))
            });
        }
    }
    Err(FrameError::Handshake("READY without Socket-Type".into()))
}

/// Decode one frame from `src`, or `Ok(None)` if it is not complete yet.
pub fn decode_zmtp_frame(src: &mut BytesMut, max_payload: usize) -> Result<Option<ZmtpFrame>> {
    if src.len() < 2 {
        return Ok(None);
    }
    let flags = src[0];
    let (header_len, size) = if flags & FLAG_LONG != 0 {
        if src.len() < 9 {
            return Ok(None);
        }
        let mut size = [0u8; 8];
        size.copy_from_slice(&src[1..9]);
        (9, u64::from_be_bytes(size))
    } else {
        (2, u64::from(src[1]))
    };

    let size = usize::try_from(size).unwrap_or(usize::MAX);
    if size > max_payload {
        return Err(FrameError::PayloadTooLarge {
            size,
            max: max_payload,
        });
    }
    if src.len() < header_len + size {
        src.reserve(header_len + size - src.len());
        return Ok(None);
    }

    src.advance(header_len);
    let body = src.split_to(size).freeze();
    if flags & FLAG_COMMAND == 0 {
        return Ok(Some(ZmtpFrame::Message {
            more: flags & FLAG_MORE != 0,
            body,
        }));
    }

    let name_len = body.first().copied().unwrap_or(0) as usize;
    if body.len() < 1 + name_len {
        return Err(FrameError::Handshake("truncated command frame".into()));
    }
    let name = String::from_utf8_lossy(&body[1..1 + name_len]).into_owned();
    Ok(Some(ZmtpFrame::Command {
        name,
        body: body.slice(1 + name_len..),
    }))
}

/// A ZMTP session over one TCP stream, past the handshake.
pub struct ZmtpStream {
    stream: BridgeStream,
    buf: BytesMut,
    partial: Vec<Bytes>,
    config: FrameConfig,
    socket_type: SocketType,
    peer_type: SocketType,
}

impl ZmtpStream {
    /// Exchange greetings and READY commands, giving up after `timeout`.
    ///
    /// Fails with [`FrameError::Handshake`] when the peer speaks something
    /// else or has a socket type that cannot talk to `socket_type`.
    pub fn handshake(
        stream: BridgeStream,
        socket_type: SocketType,
        as_server: bool,
        config: FrameConfig,
        timeout: Duration,
    ) -> Result<Self> {
        stream
            .set_write_timeout(config.write_timeout)
            .map_err(|err| FrameError::Io(transport_to_io(err)))?;
        let mut session = Self {
            stream,
            buf: BytesMut::with_capacity(READ_CHUNK_SIZE),
            partial: Vec::new(),
            config,
            socket_type,
            peer_type: socket_type,
        };
        let deadline = Instant::now() + timeout;

        session.write_bytes(&greeting(as_server))?;
        while session.buf.len() < GREETING_SIZE {
            if !session.fill_until(deadline)? {
                return Err(FrameError::Handshake("timed out waiting for greeting".into()));
            }
        }
        let mut peer_greeting = [0u8; GREETING_SIZE];
        peer_greeting.copy_from_slice(&session.buf.split_to(GREETING_SIZE));
        check_greeting(&peer_greeting)?;

        let mut ready = BytesMut::new();
        encode_command(READY, &ready_body(socket_type), &mut ready);
        session.write_bytes(&ready)?;

        let peer_type = loop {
            match decode_zmtp_frame(&mut session.buf, session.config.max_payload_size)? {
                Some(ZmtpFrame::Command { name, body }) if name == READY => {
                    break parse_ready(&body)?;
                }
                Some(ZmtpFrame::Command { name, body }) if name == ERROR => {
                    return Err(FrameError::Handshake(format!(
                        "peer refused: {}",
                        String::from_utf8_lossy(body.get(1..).unwrap_or_default())
                    )));
                }
                Some(other) => {
                    return Err(FrameError::Handshake(format!(
                        "expected READY, got {other:?}"
                    )));
                }
                None => {
                    if !session.fill_until(deadline)? {
                        return Err(FrameError::Handshake("timed out waiting for READY".into()));
                    }
                }
            }
        };
        if !socket_type.accepts(peer_type) {
            return Err(FrameError::Handshake(format!(
                "{} cannot talk to {}",
                socket_type.name(),
                peer_type.name()
            )));
        }
        session.peer_type = peer_type;
        session.restore_read_timeout()?;
        debug!(local = socket_type.name(), peer = peer_type.name(), "zmtp session ready");
        Ok(session)
    }

    /// Send one message made of `parts`.
    pub fn send_message(&mut self, parts: &[&[u8]]) -> Result<()> {
        let mut out = BytesMut::new();
        for (ndx, part) in parts.iter().enumerate() {
            encode_message(part, ndx + 1 < parts.len(), &mut out);
        }
        self.write_bytes(&out)?;
        trace!(parts = parts.len(), size = out.len(), "zmtp message written");
        Ok(())
    }

    /// Next complete message, or `Ok(None)` at `deadline`.
    ///
    /// Parts received before the deadline are kept for the next call.
    pub fn recv_message_until(&mut self, deadline: Instant) -> Result<Option<Vec<Bytes>>> {
        let result = self.recv_inner(deadline);
        self.restore_read_timeout()?;
        result
    }

    fn recv_inner(&mut self, deadline: Instant) -> Result<Option<Vec<Bytes>>> {
        loop {
            while let Some(frame) =
                decode_zmtp_frame(&mut self.buf, self.config.max_payload_size)?
            {
                match frame {
                    ZmtpFrame::Message { more, body } => {
                        self.partial.push(body);
                        if !more {
                            return Ok(Some(std::mem::take(&mut self.partial)));
                        }
                    }
                    ZmtpFrame::Command { name, .. } => {
                        debug!(command = %name, "ignoring zmtp command");
                    }
                }
            }
            if !self.fill_until(deadline)? {
                return Ok(None);
            }
        }
    }

    pub fn socket_type(&self) -> SocketType {
        self.socket_type
    }

    pub fn peer_type(&self) -> SocketType {
        self.peer_type
    }

    /// Read more bytes; `Ok(false)` when the deadline passed first.
    fn fill_until(&mut self, deadline: Instant) -> Result<bool> {
        let mut chunk = [0u8; READ_CHUNK_SIZE];
        loop {
            let now = Instant::now();
            if now >= deadline {
                return Ok(false);
            }
            self.stream
                .set_read_timeout(Some(deadline - now))
                .map_err(|err| FrameError::Io(transport_to_io(err)))?;
            match self.stream.read(&mut chunk) {
                Ok(0) => return Err(FrameError::ConnectionClosed),
                Ok(n) => {
                    self.buf.extend_from_slice(&chunk[..n]);
                    return Ok(true);
                }
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) if is_timeout_kind(err.kind()) => continue,
                Err(err) => return Err(FrameError::Io(err)),
            }
        }
    }

    fn write_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        match self.stream.write_all(bytes).and_then(|()| self.stream.flush()) {
            Ok(()) => Ok(()),
            Err(err)
                if matches!(
                    err.kind(),
                    ErrorKind::BrokenPipe | ErrorKind::WriteZero | ErrorKind::ConnectionReset
                ) =>
            {
                Err(FrameError::ConnectionClosed)
            }
            Err(err) => Err(FrameError::Io(err)),
        }
    }

    fn restore_read_timeout(&self) -> Result<()> {
        self.stream
            .set_read_timeout(self.config.read_timeout)
            .map_err(|err| FrameError::Io(transport_to_io(err)))
    }
}
