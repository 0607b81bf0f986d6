use std::io::{Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tracing::debug;

use crate::error::Result;

/// A connected TCP stream. Implements `Read` and `Write`.
///
/// Every channel owns exactly one of these (plus clones of the same socket for
/// split read/write halves). The socket closes when the last clone drops.
pub struct BridgeStream {
    inner: TcpStream,
}

impl Read for BridgeStream {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.inner.read(buf)
    }
}

impl Write for BridgeStream {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.inner.write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

impl BridgeStream {
    pub(crate) fn from_tcp(stream: TcpStream) -> Self {
        Self { inner: stream }
    }

    /// Set read timeout on the underlying socket.
    ///
    /// A zero duration is rejected by the OS, so it is clamped to one millisecond.
    pub fn set_read_timeout(&self, timeout: Option<Duration>) -> Result<()> {
        self.inner
            .set_read_timeout(timeout.map(clamp_timeout))
            .map_err(Into::into)
    }

    /// Set write timeout on the underlying socket.
    pub fn set_write_timeout(&self, timeout: Option<Duration>) -> Result<()> {
        self.inner
            .set_write_timeout(timeout.map(clamp_timeout))
            .map_err(Into::into)
    }

    /// Try to clone this stream (creates a new file descriptor for the same socket).
    pub fn try_clone(&self) -> Result<Self> {
        Ok(Self::from_tcp(self.inner.try_clone()?))
    }

    /// Handle that can close this socket from another thread.
    pub fn shutdown_handle(&self) -> Result<ShutdownHandle> {
        Ok(ShutdownHandle {
            stream: Arc::new(Mutex::new(self.inner.try_clone()?)),
            triggered: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Address of the remote side.
    pub fn peer_addr(&self) -> Result<SocketAddr> {
        self.inner.peer_addr().map_err(Into::into)
    }

    /// Address of the local side.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.inner.local_addr().map_err(Into::into)
    }
}

impl std::fmt::Debug for BridgeStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BridgeStream")
            .field("local", &self.inner.local_addr().ok())
            .field("peer", &self.inner.peer_addr().ok())
            .finish()
    }
}

fn clamp_timeout(timeout: Duration) -> Duration {
    timeout.max(Duration::from_millis(1))
}

/// Closes a [`BridgeStream`] from outside the thread that is blocked on it.
///
/// After [`shutdown`](Self::shutdown) any in-flight or later read observes
/// end-of-stream, so blocking receives unwind instead of waiting out their
/// timeout. Clones share state, including across [`retarget`](Self::retarget).
#[derive(Clone)]
pub struct ShutdownHandle {
    stream: Arc<Mutex<TcpStream>>,
    triggered: Arc<AtomicBool>,
}

impl ShutdownHandle {
    /// Shut down both directions of the socket. Idempotent.
    pub fn shutdown(&self) {
        if self.triggered.swap(true, Ordering::SeqCst) {
            return;
        }
        let stream = self.stream.lock().unwrap_or_else(PoisonError::into_inner);
        match stream.shutdown(Shutdown::Both) {
            Ok(()) => debug!("stream shut down"),
            Err(err) => debug!(error = %err, "stream shutdown failed (already closed?)"),
        }
    }

    /// Point this handle, and every clone of it, at a replacement stream.
    ///
    /// Used when a connection is re-established. If the handle was already
    /// triggered the new stream is shut down at once.
    pub fn retarget(&self, stream: &BridgeStream) -> Result<()> {
        let replacement = stream.inner.try_clone()?;
        let mut current = self.stream.lock().unwrap_or_else(PoisonError::into_inner);
        *current = replacement;
        if self.is_shutdown() {
            let _ = current.shutdown(Shutdown::Both);
        }
        Ok(())
    }

    /// Whether [`shutdown`](Self::shutdown) has been called.
    pub fn is_shutdown(&self) -> bool {
        self.triggered.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for ShutdownHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShutdownHandle")
            .field("triggered", &self.is_shutdown())
            .finish()
    }
}
