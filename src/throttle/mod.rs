//! Admission control.
//!
//! # Responsibilities
//! - Own the token supply representing grantable connection slots
//! - Converge the number of issued tokens to the live ceiling
//! - Reclaim every outstanding token during shutdown, then signal drain
//!
//! The issued count and the ceiling are owned by exactly one task (the
//! reconciliation loop); everything else talks to it through a bounded
//! command channel. The supply itself is a semaphore: the accept loop takes
//! owned permits and connections give them back by dropping them.
//!
//! The accept loop never parks inside the semaphore's wait queue; it polls
//! with `try_acquire` and sleeps on a release notification instead. That
//! keeps the reconciliation loop first in line for returned tokens, so a
//! lowered ceiling converges even under continuous connection churn.

use std::cmp::Ordering;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::{mpsc, Notify, OwnedSemaphorePermit, Semaphore, TryAcquireError};

use crate::engine::RequestEngine;
use crate::lifecycle::shutdown::Shutdown;

/// Error type for ceiling adjustments.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ThrottleError {
    /// The requested ceiling is outside `0..=throttle_max`.
    #[error("ceiling {requested} is out of range (hard cap is {max})")]
    OutOfRange { requested: usize, max: usize },
    /// Shutdown has begun; the ceiling can no longer change.
    #[error("server is shutting down")]
    ShuttingDown,
}

/// One unit of admission capacity.
///
/// A connection holds exactly one token from accept to its terminal state;
/// dropping the token puts the slot back into the supply and wakes the
/// accept loop.
#[derive(Debug)]
pub(crate) struct Token {
    permit: Option<OwnedSemaphorePermit>,
    released: Arc<Notify>,
}

impl Drop for Token {
    fn drop(&mut self) {
        // The permit must be back in the supply before anyone is woken.
        drop(self.permit.take());
        self.released.notify_one();
    }
}

#[cfg(test)]
impl Token {
    pub(crate) fn from_permit(permit: OwnedSemaphorePermit) -> Self {
        Self { permit: Some(permit), released: Arc::new(Notify::new()) }
    }
}

enum Command {
    SetCeiling(usize),
    Shutdown,
}

/// Cloneable handle to the reconciliation task and the token supply.
#[derive(Clone)]
pub(crate) struct ThrottleHandle {
    commands: mpsc::Sender<Command>,
    tokens: Arc<Semaphore>,
    released: Arc<Notify>,
    throttle_max: usize,
}

impl ThrottleHandle {
    /// Request a new ceiling. Range-checked synchronously; the issued token
    /// count converges to the new value asynchronously.
    pub(crate) async fn set_ceiling(&self, ceiling: usize) -> Result<(), ThrottleError> {
        if ceiling > self.throttle_max {
            return Err(ThrottleError::OutOfRange { requested: ceiling, max: self.throttle_max });
        }
        self.commands
            .send(Command::SetCeiling(ceiling))
            .await
            .map_err(|_| ThrottleError::ShuttingDown)
    }

    /// Tell the reconciliation task to stop issuing tokens and drain.
    /// Safe to call more than once; only the first delivery matters.
    pub(crate) async fn begin_shutdown(&self) {
        let _ = self.commands.send(Command::Shutdown).await;
    }

    /// Take one token out of the supply, waiting until one is free.
    ///
    /// Deliberately does not enter the semaphore's wait queue; a concurrent
    /// ceiling decrease always gets returned tokens first.
    pub(crate) async fn acquire_token(&self) -> Token {
        loop {
            match Arc::clone(&self.tokens).try_acquire_owned() {
                Ok(permit) => {
                    return Token { permit: Some(permit), released: Arc::clone(&self.released) }
                }
                Err(TryAcquireError::NoPermits) => self.released.notified().await,
                Err(TryAcquireError::Closed) => {
                    unreachable!("token supply closed unexpectedly")
                }
            }
        }
    }

    /// Number of tokens currently free in the supply.
    pub(crate) fn available(&self) -> usize {
        self.tokens.available_permits()
    }

    pub(crate) fn throttle_max(&self) -> usize {
        self.throttle_max
    }
}

/// Start the reconciliation task for a server.
///
/// Both bounds are clamped here: the drain reclaims the whole supply with a
/// single `acquire_many` call, so the hard cap must fit its `u32` batch
/// size, and the initial ceiling must fit the hard cap.
pub(crate) fn spawn(
    throttle_max: usize,
    initial_ceiling: usize,
    engine: Arc<dyn RequestEngine>,
    shutdown: Arc<Shutdown>,
) -> ThrottleHandle {
    let throttle_max = throttle_max.min(u32::MAX as usize);
    let initial_ceiling = initial_ceiling.min(throttle_max);
    let (commands_tx, commands_rx) = mpsc::channel(1);
    let tokens = Arc::new(Semaphore::new(0));
    let released = Arc::new(Notify::new());

    let throttler = Throttler {
        commands: commands_rx,
        tokens: Arc::clone(&tokens),
        released: Arc::clone(&released),
        engine,
        shutdown,
    };
    tokio::spawn(throttler.run(initial_ceiling));

    ThrottleHandle { commands: commands_tx, tokens, released, throttle_max }
}

struct Throttler {
    commands: mpsc::Receiver<Command>,
    tokens: Arc<Semaphore>,
    released: Arc<Notify>,
    engine: Arc<dyn RequestEngine>,
    shutdown: Arc<Shutdown>,
}

impl Throttler {
    /// The reconciliation loop. Invariant throughout: free tokens in the
    /// supply plus tokens held by connections equals `issued`, and
    /// `issued <= throttle_max`.
    async fn run(mut self, initial_ceiling: usize) {
        let mut issued: usize = 0;
        let mut ceiling: usize = initial_ceiling;

        loop {
            let command = match issued.cmp(&ceiling) {
                Ordering::Less => {
                    // A queued ceiling update pre-empts a supply add, so
                    // rapid successive updates are never starved.
                    match self.commands.try_recv() {
                        Ok(command) => command,
                        Err(TryRecvError::Empty) => {
                            self.tokens.add_permits(1);
                            issued += 1;
                            self.released.notify_one();
                            continue;
                        }
                        Err(TryRecvError::Disconnected) => Command::Shutdown,
                    }
                }
                Ordering::Equal => match self.commands.recv().await {
                    Some(command) => command,
                    None => Command::Shutdown,
                },
                Ordering::Greater => {
                    tokio::select! {
                        biased;
                        command = self.commands.recv() => command.unwrap_or(Command::Shutdown),
                        permit = self.tokens.acquire() => {
                            permit.expect("token supply closed unexpectedly").forget();
                            issued -= 1;
                            continue;
                        }
                    }
                }
            };

            match command {
                Command::SetCeiling(new_ceiling) => {
                    tracing::debug!(ceiling = new_ceiling, issued, "ceiling updated");
                    ceiling = new_ceiling;
                }
                Command::Shutdown => {
                    // Late ceiling updates must fail fast, not buffer into
                    // a channel nobody reads anymore.
                    self.commands.close();
                    break;
                }
            }
        }

        self.drain(issued).await;
    }

    /// Reclaim every issued token, then signal drain completion exactly once.
    async fn drain(self, issued: usize) {
        tracing::info!(outstanding = issued, "shutdown: reclaiming connection tokens");
        self.engine.set_keep_alives(false);
        if issued > 0 {
            // `issued` never exceeds the clamped hard cap; the cast is
            // lossless.
            self.tokens
                .acquire_many(issued as u32)
                .await
                .expect("token supply closed unexpectedly")
                .forget();
        }
        self.shutdown.mark_drained();
        tracing::info!("shutdown: all connections drained");
    }
}
