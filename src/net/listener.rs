//! Listening socket ownership.
//!
//! # Responsibilities
//! - Bind (or adopt) the listening socket
//! - Accept incoming TCP connections
//! - Support deliberate close independently of connection draining
//! - Duplicate the underlying descriptor for process handoff
//!
//! Closing and duplicating must not interfere with each other: `close` only
//! stops future accepts, `duplicate_descriptor` only dups the OS handle.

use std::net::SocketAddr;
use std::os::fd::{AsRawFd, BorrowedFd, OwnedFd};
use std::sync::Arc;

use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;

/// Error type for listener operations.
#[derive(Debug, Error)]
pub enum ListenerError {
    /// Failed to bind to an address.
    #[error("failed to bind: {0}")]
    Bind(#[source] std::io::Error),
    /// Failed to accept a connection.
    #[error("failed to accept: {0}")]
    Accept(#[source] std::io::Error),
    /// The listener was deliberately closed.
    #[error("listener is closed")]
    Closed,
    /// Failed to duplicate the listening descriptor.
    #[error("failed to duplicate listener descriptor: {0}")]
    Duplicate(#[source] std::io::Error),
}

/// Handle to the listening socket of a running server.
///
/// Cloning is cheap; all clones refer to the same socket. Exactly one live
/// handle family exists per server. `close` is idempotent and observable from
/// every clone.
#[derive(Debug, Clone)]
pub struct ListenerHandle {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    listener: TcpListener,
    closed_tx: watch::Sender<bool>,
}

impl ListenerHandle {
    /// Bind to `address`.
    pub async fn bind(address: &str) -> Result<Self, ListenerError> {
        let addr: SocketAddr = address
            .parse()
            .map_err(|e| ListenerError::Bind(std::io::Error::new(std::io::ErrorKind::InvalidInput, e)))?;

        let listener = TcpListener::bind(addr).await.map_err(ListenerError::Bind)?;
        let local_addr = listener.local_addr().map_err(ListenerError::Bind)?;

        tracing::info!(address = %local_addr, "listener bound");

        Ok(Self::from_tokio(listener))
    }

    /// Adopt an already-bound standard listener (e.g., one inherited across a
    /// process handoff).
    pub fn from_std(listener: std::net::TcpListener) -> Result<Self, ListenerError> {
        listener.set_nonblocking(true).map_err(ListenerError::Bind)?;
        let listener = TcpListener::from_std(listener).map_err(ListenerError::Bind)?;
        Ok(Self::from_tokio(listener))
    }

    fn from_tokio(listener: TcpListener) -> Self {
        let (closed_tx, _) = watch::channel(false);
        Self { inner: Arc::new(Inner { listener, closed_tx }) }
    }

    /// Accept the next connection.
    ///
    /// Returns [`ListenerError::Closed`] once [`close`](Self::close) has been
    /// called, including when the close happens while an accept is pending.
    pub async fn accept(&self) -> Result<(TcpStream, SocketAddr), ListenerError> {
        let mut closed = self.inner.closed_tx.subscribe();
        if *closed.borrow() {
            return Err(ListenerError::Closed);
        }
        tokio::select! {
            biased;
            _ = closed.wait_for(|closed| *closed) => Err(ListenerError::Closed),
            result = self.inner.listener.accept() => result.map_err(ListenerError::Accept),
        }
    }

    /// Stop future accepts. Idempotent; already-accepted connections are not
    /// affected.
    pub fn close(&self) {
        let first = !self.inner.closed_tx.send_replace(true);
        if first {
            tracing::debug!("listener closed");
        }
    }

    /// Whether [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        *self.inner.closed_tx.borrow()
    }

    /// Duplicate the underlying OS descriptor.
    ///
    /// The duplicate is independent of the original: closing one does not
    /// close the other. Fails once the listener has been closed.
    pub fn duplicate_descriptor(&self) -> Result<OwnedFd, ListenerError> {
        if self.is_closed() {
            return Err(ListenerError::Closed);
        }
        let raw = self.inner.listener.as_raw_fd();
        // SAFETY: `raw` belongs to the listener we hold through `inner`, so it
        // stays open for the duration of the borrow.
        let fd = unsafe { BorrowedFd::borrow_raw(raw) };
        fd.try_clone_to_owned().map_err(ListenerError::Duplicate)
    }

    /// Local address the listener is bound to.
    pub fn local_addr(&self) -> Result<SocketAddr, std::io::Error> {
        self.inner.listener.local_addr()
    }
}
