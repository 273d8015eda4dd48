//! Request engine boundary.
//!
//! The runtime does not parse HTTP itself. It hands every accepted stream to
//! a [`RequestEngine`] together with a [`ConnHandle`] and expects the engine
//! to report connection lifecycle transitions back through the handle. The
//! handle is what ties a connection to its admission token: the token goes
//! back to the supply exactly once, on the first terminal report (or when the
//! handle is dropped, whichever comes first).

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use tokio::net::TcpStream;

use crate::throttle::Token;

/// Global atomic counter for connection IDs. Relaxed ordering is enough, we
/// only need uniqueness.
static CONNECTION_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for an accepted connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub(crate) fn next() -> Self {
        Self(CONNECTION_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Lifecycle transitions an engine reports for a connection it was handed.
///
/// `Closed` and `Hijacked` are both terminal for admission accounting: a
/// hijacked connection has left managed handling, but its slot is free again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// The engine took over the connection.
    New,
    /// The connection finished and was closed.
    Closed,
    /// The connection was handed off to unmanaged handling.
    Hijacked,
}

/// Per-connection handle given to the engine alongside the stream.
#[derive(Debug)]
pub struct ConnHandle {
    token: Option<Token>,
    id: ConnectionId,
}

impl ConnHandle {
    pub(crate) fn new(token: Token) -> Self {
        Self { token: Some(token), id: ConnectionId::next() }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Report a lifecycle transition. The first `Closed` or `Hijacked` report
    /// releases the connection's token; later reports are no-ops.
    pub fn report(&mut self, state: ConnState) {
        tracing::trace!(connection_id = %self.id, state = ?state, "connection state");
        match state {
            ConnState::New => {}
            ConnState::Closed | ConnState::Hijacked => {
                if let Some(token) = self.token.take() {
                    drop(token);
                    tracing::trace!(connection_id = %self.id, "token released");
                }
            }
        }
    }
}

impl Drop for ConnHandle {
    fn drop(&mut self) {
        // Backstop: an engine that drops the handle without a terminal report
        // still gives the slot back.
        if self.token.is_some() {
            tracing::trace!(connection_id = %self.id, "handle dropped, releasing token");
        }
    }
}

/// Minimal capability interface a request engine implements.
///
/// The engine must report `Closed` or `Hijacked` through the [`ConnHandle`]
/// exactly once per connection so admission slots are freed deterministically.
#[async_trait]
pub trait RequestEngine: Send + Sync + 'static {
    /// Process one accepted connection to completion.
    ///
    /// An early `Err` before any terminal report counts as rejecting the
    /// connection; the slot is freed when `conn` is dropped.
    async fn serve_connection(
        &self,
        stream: TcpStream,
        peer: SocketAddr,
        conn: ConnHandle,
    ) -> std::io::Result<()>;

    /// Called once when shutdown begins so the engine can stop keeping
    /// connections alive between requests. Default: no-op.
    fn set_keep_alives(&self, enabled: bool) {
        let _ = enabled;
    }
}

/// Engine that closes every connection immediately. Useful in tests and as a
/// placeholder while wiring a real engine.
#[derive(Debug, Default)]
pub struct NoopEngine;

#[async_trait]
impl RequestEngine for NoopEngine {
    async fn serve_connection(
        &self,
        stream: TcpStream,
        _peer: SocketAddr,
        mut conn: ConnHandle,
    ) -> std::io::Result<()> {
        conn.report(ConnState::New);
        drop(stream);
        conn.report(ConnState::Closed);
        Ok(())
    }
}
