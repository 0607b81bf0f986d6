use std::io::ErrorKind;
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::time::Duration;

use tracing::{debug, info};

use crate::endpoint::Endpoint;
use crate::error::{Result, TransportError};
use crate::stream::BridgeStream;

/// A bound TCP listener for the environment side of a channel.
///
/// The listening socket closes when this value drops.
pub struct TcpEndpoint {
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl TcpEndpoint {
    /// Bind and listen on `endpoint`. Port `0` picks an ephemeral port.
    pub fn bind(endpoint: &Endpoint) -> Result<Self> {
        let listener = TcpListener::bind((endpoint.host.as_str(), endpoint.port)).map_err(|e| {
            TransportError::Bind {
                endpoint: endpoint.to_string(),
                source: e,
            }
        })?;
        let local_addr = listener.local_addr().map_err(|e| TransportError::Bind {
            endpoint: endpoint.to_string(),
            source: e,
        })?;

        info!(%local_addr, "listening on tcp endpoint");

        Ok(Self {
            listener,
            local_addr,
        })
    }

    /// Accept an incoming connection (blocking).
    pub fn accept(&self) -> Result<BridgeStream> {
        let (stream, addr) = self.listener.accept().map_err(TransportError::Accept)?;
        prepare_accepted(&stream)?;
        debug!(%addr, "accepted connection");
        Ok(BridgeStream::from_tcp(stream))
    }

    /// Accept an incoming connection if one is pending.
    ///
    /// Requires [`set_nonblocking(true)`](Self::set_nonblocking); returns
    /// `Ok(None)` when no connection is waiting.
    pub fn try_accept(&self) -> Result<Option<BridgeStream>> {
        match self.listener.accept() {
            Ok((stream, addr)) => {
                prepare_accepted(&stream)?;
                debug!(%addr, "accepted connection");
                Ok(Some(BridgeStream::from_tcp(stream)))
            }
            Err(err) if err.kind() == ErrorKind::WouldBlock => Ok(None),
            Err(err) if err.kind() == ErrorKind::Interrupted => Ok(None),
            Err(err) => Err(TransportError::Accept(err)),
        }
    }

    /// Switch the listening socket between blocking and polling accepts.
    pub fn set_nonblocking(&self, nonblocking: bool) -> Result<()> {
        self.listener
            .set_nonblocking(nonblocking)
            .map_err(Into::into)
    }

    /// Connect to a listening endpoint, waiting at most `timeout` per resolved address.
    pub fn connect(endpoint: &Endpoint, timeout: Duration) -> Result<BridgeStream> {
        let addrs = (endpoint.host.as_str(), endpoint.port)
            .to_socket_addrs()
            .map_err(|e| TransportError::Connect {
                endpoint: endpoint.to_string(),
                source: e,
            })?;

        let mut last_err = None;
        for addr in addrs {
            match TcpStream::connect_timeout(&addr, timeout) {
                Ok(stream) => {
                    stream.set_nodelay(true)?;
                    debug!(%endpoint, %addr, "connected to tcp endpoint");
                    return Ok(BridgeStream::from_tcp(stream));
                }
                Err(err) => {
                    debug!(%endpoint, %addr, error = %err, "connect attempt failed");
                    last_err = Some(err);
                }
            }
        }

        Err(TransportError::Connect {
            endpoint: endpoint.to_string(),
            source: last_err.unwrap_or_else(|| {
                std::io::Error::new(ErrorKind::NotFound, "endpoint resolved to no addresses")
            }),
        })
    }

    /// The address this listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// The bound address as an [`Endpoint`] clients can connect to.
    pub fn endpoint(&self) -> Endpoint {
        Endpoint::new(self.local_addr.ip().to_string(), self.local_addr.port())
    }
}

// Accepted sockets inherit the listener's non-blocking flag on some platforms.
fn prepare_accepted(stream: &TcpStream) -> Result<()> {
    stream.set_nonblocking(false)?;
    stream.set_nodelay(true)?;
    Ok(())
}
