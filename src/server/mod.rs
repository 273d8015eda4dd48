//! Server runtime.
//!
//! # Responsibilities
//! - Tie the listener, the admission controller, the drain coordinator and
//!   the request engine together
//! - Run the accept loop: token first, then accept, then hand off
//! - Expose the lifecycle API (`stop`, `stop_and_wait`, `wait_stopped`) and
//!   the handoff entry point
//!
//! # Accept protocol
//! Every iteration takes one admission token before touching the socket, so
//! the number of simultaneously tracked connections can never exceed the
//! ceiling. Transient accept errors back off exponentially (the token goes
//! back first); a deliberate listener close is the normal end of a shutdown
//! and is not an error.

use std::io::ErrorKind;
use std::process::Child;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use thiserror::Error;

use crate::config::ServerConfig;
use crate::engine::{ConnHandle, RequestEngine};
use crate::lifecycle::handoff::{self, HandoffError, HandoffRequest, ResumeError};
use crate::lifecycle::shutdown::Shutdown;
use crate::net::listener::{ListenerError, ListenerHandle};
use crate::throttle::{self, ThrottleError, ThrottleHandle};

/// Error type for a serve call.
#[derive(Debug, Error)]
pub enum ServeError {
    #[error(transparent)]
    Listener(#[from] ListenerError),
    #[error(transparent)]
    Resume(#[from] ResumeError),
}

/// Lifecycle of a server. Transitions are monotonic; there is no way back
/// from a later state to an earlier one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum Lifecycle {
    /// Constructed, not yet serving.
    Idle = 0,
    /// Accepting connections.
    Running = 1,
    /// No longer accepting; in-flight connections finishing.
    Stopping = 2,
    /// Fully drained.
    Stopped = 3,
}

impl Lifecycle {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Lifecycle::Idle,
            1 => Lifecycle::Running,
            2 => Lifecycle::Stopping,
            _ => Lifecycle::Stopped,
        }
    }
}

/// A TCP server with live-adjustable admission control, graceful shutdown
/// and zero-downtime handoff.
///
/// The server itself does not understand requests; it admits connections and
/// hands them to the [`RequestEngine`] it was built with.
pub struct Server {
    config: ServerConfig,
    engine: Arc<dyn RequestEngine>,
    throttle: ThrottleHandle,
    shutdown: Arc<Shutdown>,
    state: AtomicU8,
    listener: Mutex<Option<ListenerHandle>>,
}

impl Server {
    /// Build a server and start its admission controller.
    ///
    /// Must be called from within a tokio runtime. The initial ceiling is
    /// `config.initial_ceiling` clamped into `0..=throttle_max`.
    pub fn new(config: ServerConfig, engine: impl RequestEngine) -> Self {
        let engine: Arc<dyn RequestEngine> = Arc::new(engine);
        let shutdown = Arc::new(Shutdown::new());
        let initial_ceiling = config.effective_initial_ceiling();
        let throttle = throttle::spawn(
            config.throttle_max,
            initial_ceiling,
            Arc::clone(&engine),
            Arc::clone(&shutdown),
        );

        tracing::info!(
            throttle_max = config.throttle_max,
            initial_ceiling,
            "server initialized"
        );

        Self {
            config,
            engine,
            throttle,
            shutdown,
            state: AtomicU8::new(Lifecycle::Idle as u8),
            listener: Mutex::new(None),
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> Lifecycle {
        Lifecycle::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// The fixed hard cap on concurrent connections.
    pub fn throttle_max(&self) -> usize {
        self.throttle.throttle_max()
    }

    /// Number of admission slots currently free.
    pub fn available_capacity(&self) -> usize {
        self.throttle.available()
    }

    /// Adjust the live connection ceiling. The change is range-checked here
    /// and applied asynchronously; lowering the ceiling never terminates
    /// connections that are already running.
    pub async fn set_ceiling(&self, ceiling: usize) -> Result<(), ThrottleError> {
        self.throttle.set_ceiling(ceiling).await
    }

    /// Request a graceful stop: no new connections, in-flight ones finish.
    /// Fire-and-forget and idempotent; returns `true` only for the call that
    /// initiated the stop.
    pub fn stop(&self) -> bool {
        let first = self.shutdown.request_stop();
        let _ = self.state.compare_exchange(
            Lifecycle::Running as u8,
            Lifecycle::Stopping as u8,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
        first
    }

    /// Wait until every connection has drained. Level-triggered: returns
    /// immediately once the server has stopped, for any number of callers.
    pub async fn wait_stopped(&self) {
        self.shutdown.wait_drained().await;
    }

    /// [`stop`](Self::stop) followed by [`wait_stopped`](Self::wait_stopped).
    pub async fn stop_and_wait(&self) {
        self.stop();
        self.wait_stopped().await;
    }

    /// Hand the listening socket to a freshly spawned replacement process.
    ///
    /// On success this instance begins its own graceful stop and the child
    /// is returned to the caller. On any failure before the spawn succeeds,
    /// this instance keeps serving untouched.
    pub fn handoff(&self, request: &HandoffRequest) -> Result<Child, HandoffError> {
        let listener = self
            .listener
            .lock()
            .expect("listener lock poisoned")
            .clone()
            .ok_or(HandoffError::NotServing)?;

        let child = handoff::spawn_replacement(&listener, request)?;
        // The replacement owns the socket now; retire this instance.
        self.stop();
        Ok(child)
    }

    /// Bind the configured address and serve on it.
    pub async fn listen_and_serve(&self) -> Result<(), ServeError> {
        let listener = ListenerHandle::bind(&self.config.bind_address).await?;
        self.serve(listener).await
    }

    /// Adopt the listener inherited from a previous instance and serve on it.
    pub async fn resume_and_serve(&self) -> Result<(), ServeError> {
        let listener = handoff::take_inherited()?;
        self.serve(listener).await
    }

    /// Accept connections until an unrecoverable error or a stop request,
    /// then wait for every admitted connection to finish.
    ///
    /// # Panics
    /// Serving is a one-shot operation; calling this a second time on the
    /// same server is a programming error and panics.
    pub async fn serve(&self, listener: ListenerHandle) -> Result<(), ServeError> {
        if self
            .state
            .compare_exchange(
                Lifecycle::Idle as u8,
                Lifecycle::Running as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_err()
        {
            panic!("Server::serve may only be called once");
        }

        *self.listener.lock().expect("listener lock poisoned") = Some(listener.clone());

        // Close the listener the moment a stop is requested so a pending
        // accept cannot outlive the shutdown decision.
        {
            let listener = listener.clone();
            let mut stop_rx = self.shutdown.stop_requested();
            tokio::spawn(async move {
                if stop_rx.wait_for(|stop| *stop).await.is_ok() {
                    listener.close();
                }
            });
        }

        let result = self.accept_loop(&listener).await;

        self.state.fetch_max(Lifecycle::Stopping as u8, Ordering::SeqCst);
        listener.close();
        self.shutdown.wait_drained().await;
        self.state.fetch_max(Lifecycle::Stopped as u8, Ordering::SeqCst);
        tracing::info!("server stopped");
        result
    }

    async fn accept_loop(&self, listener: &ListenerHandle) -> Result<(), ServeError> {
        let mut backoff: Option<Duration> = None;
        let mut stop_rx = self.shutdown.stop_requested();

        loop {
            // Token strictly before accept; a stop request wins over a free
            // token and carries the shutdown sentinel to the controller.
            let token = tokio::select! {
                biased;
                // The async block drops the non-Send `watch::Ref` before the
                // select resolves, keeping the serve future `Send`.
                _ = async { let _ = stop_rx.wait_for(|stop| *stop).await; } => {
                    self.throttle.begin_shutdown().await;
                    return Ok(());
                }
                token = self.throttle.acquire_token() => token,
            };

            match listener.accept().await {
                Ok((stream, peer)) => {
                    backoff = None;
                    let conn = ConnHandle::new(token);
                    let id = conn.id();
                    tracing::debug!(
                        connection_id = %id,
                        peer_addr = %peer,
                        available = self.throttle.available(),
                        "connection accepted"
                    );
                    let engine = Arc::clone(&self.engine);
                    tokio::spawn(async move {
                        if let Err(error) = engine.serve_connection(stream, peer, conn).await {
                            tracing::debug!(connection_id = %id, %error, "connection ended with error");
                        }
                    });
                }
                Err(ListenerError::Closed) => {
                    // Deliberate close: the expected end of a shutdown.
                    drop(token);
                    self.stop();
                    self.throttle.begin_shutdown().await;
                    return Ok(());
                }
                Err(ListenerError::Accept(error)) if is_transient_accept_error(&error) => {
                    // Token goes back before the sleep so backoff never holds
                    // capacity hostage.
                    drop(token);
                    let delay = self.config.accept_backoff.next(backoff);
                    backoff = Some(delay);
                    tracing::warn!(%error, delay_ms = delay.as_millis() as u64, "accept error, retrying");
                    tokio::time::sleep(delay).await;
                }
                Err(error) => {
                    drop(token);
                    self.stop();
                    self.throttle.begin_shutdown().await;
                    return Err(error.into());
                }
            }
        }
    }
}

/// Accept failures that are worth retrying after a pause: aborted handshakes
/// and resource exhaustion that may clear up as connections finish.
fn is_transient_accept_error(error: &std::io::Error) -> bool {
    matches!(
        error.kind(),
        ErrorKind::ConnectionAborted
            | ErrorKind::ConnectionReset
            | ErrorKind::Interrupted
            | ErrorKind::WouldBlock
    ) || matches!(
        error.raw_os_error(),
        Some(libc::EMFILE | libc::ENFILE | libc::ENOBUFS | libc::ENOMEM)
    )
}
