//! Zero-downtime listener handoff.
//!
//! # Protocol
//! The running instance duplicates its listening descriptor and spawns a
//! replacement process with the duplicate moved to a fixed slot. The
//! replacement finds the count of inherited descriptors in an environment
//! variable and adopts the socket instead of binding a fresh one. Both
//! processes briefly share the socket (it is reference-counted by the OS),
//! so no pending connection is ever refused.
//!
//! Exactly one descriptor is expected per handoff; anything else is an
//! ambiguous state the replacement must refuse.

use std::ffi::OsString;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::process::CommandExt;
use std::path::PathBuf;
use std::process::{Child, Command};

use thiserror::Error;

use crate::net::listener::{ListenerError, ListenerHandle};

/// Environment variable carrying the number of inherited descriptors.
pub const LISTEN_FDS_ENV: &str = "BATON_LISTEN_FDS";

/// First descriptor slot used for inherited sockets, directly above
/// stdin/stdout/stderr.
pub const LISTEN_FDS_START: RawFd = 3;

/// Upper bound on the announced descriptor count this process will act on.
/// Anything larger is corrupt metadata, not a real handoff.
const MAX_INHERITED_FDS: usize = 16;

/// Error type for spawning a replacement process.
#[derive(Debug, Error)]
pub enum HandoffError {
    /// The listening descriptor could not be duplicated (e.g., the listener
    /// is already closed).
    #[error("cannot duplicate listener descriptor: {0}")]
    Duplicate(#[from] ListenerError),
    /// The replacement process could not be spawned.
    #[error("failed to spawn replacement process: {0}")]
    Spawn(#[source] std::io::Error),
    /// The server has no active listener to hand off.
    #[error("server is not currently serving")]
    NotServing,
}

/// Error type for adopting an inherited listener on startup.
#[derive(Debug, Error)]
pub enum ResumeError {
    /// The environment carries no handoff metadata.
    #[error("no inherited listener descriptors in the environment")]
    NotResuming,
    /// The descriptor count variable is not a number.
    #[error("invalid BATON_LISTEN_FDS value: {0:?}")]
    BadCount(String),
    /// The environment announces a descriptor count other than one.
    #[error("expected exactly one inherited descriptor, found {0}")]
    WrongCount(usize),
    /// The inherited descriptor could not be turned into a listener.
    #[error("failed to adopt inherited listener: {0}")]
    Adopt(#[from] ListenerError),
}

/// A request to replace this process: program to run and its arguments.
#[derive(Debug, Clone)]
pub struct HandoffRequest {
    program: PathBuf,
    args: Vec<OsString>,
}

impl HandoffRequest {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self { program: program.into(), args: Vec::new() }
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, A>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = A>,
        A: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn program(&self) -> &PathBuf {
        &self.program
    }
}

/// Duplicate the listener's descriptor and spawn the replacement process
/// with it attached at [`LISTEN_FDS_START`].
///
/// The local copy of the duplicate is closed before this returns, whether
/// the spawn succeeded or not. On failure the current instance is left fully
/// operational; triggering its shutdown on success is the caller's job.
pub fn spawn_replacement(
    listener: &ListenerHandle,
    request: &HandoffRequest,
) -> Result<Child, HandoffError> {
    let duplicate = listener.duplicate_descriptor()?;
    let raw = duplicate.as_raw_fd();

    tracing::info!(
        program = %request.program.display(),
        descriptor = raw,
        "spawning replacement process"
    );

    let mut command = Command::new(&request.program);
    command.args(&request.args).env(LISTEN_FDS_ENV, "1");

    // SAFETY: the closure runs between fork and exec and only calls
    // async-signal-safe functions (dup2/fcntl).
    unsafe {
        command.pre_exec(move || {
            if raw == LISTEN_FDS_START {
                // Already in the right slot; dup2 would be a no-op that
                // leaves close-on-exec set, so clear it by hand.
                let flags = libc::fcntl(raw, libc::F_GETFD);
                if flags == -1 {
                    return Err(std::io::Error::last_os_error());
                }
                if libc::fcntl(raw, libc::F_SETFD, flags & !libc::FD_CLOEXEC) == -1 {
                    return Err(std::io::Error::last_os_error());
                }
            } else if libc::dup2(raw, LISTEN_FDS_START) == -1 {
                return Err(std::io::Error::last_os_error());
            }
            Ok(())
        });
    }

    let child = command.spawn().map_err(HandoffError::Spawn)?;
    tracing::info!(child_pid = child.id(), "replacement process spawned");
    // `duplicate` drops here: the child owns its copy, ours is closed.
    drop(duplicate);
    Ok(child)
}

/// Whether the environment announces inherited descriptors.
pub fn can_resume() -> bool {
    std::env::var_os(LISTEN_FDS_ENV).is_some()
}

/// Adopt the listener inherited from the previous instance.
///
/// Consumes the environment variable so it does not leak into further
/// children. Exactly one inherited descriptor is required; on any other
/// announced count every inherited descriptor is closed and an error is
/// returned. Must be called from within a tokio runtime.
pub fn take_inherited() -> Result<ListenerHandle, ResumeError> {
    let value = std::env::var_os(LISTEN_FDS_ENV).ok_or(ResumeError::NotResuming)?;
    std::env::remove_var(LISTEN_FDS_ENV);

    let text = value.to_string_lossy();
    let count: usize = text.parse().map_err(|_| ResumeError::BadCount(text.into_owned()))?;
    if count != 1 {
        // Ambiguous handoff: refuse it, but don't leak the sockets. A count
        // beyond any plausible handoff means the slots were never ours, so
        // they must be left alone.
        if count <= MAX_INHERITED_FDS {
            for slot in 0..count {
                // SAFETY: by the handoff convention these slots belong to us
                // and nothing else in this process has touched them yet.
                drop(unsafe { OwnedFd::from_raw_fd(LISTEN_FDS_START + slot as RawFd) });
            }
        }
        return Err(ResumeError::WrongCount(count));
    }

    // SAFETY: slot 3 is ours by the handoff convention; ownership transfers
    // to the new listener.
    let fd = unsafe { OwnedFd::from_raw_fd(LISTEN_FDS_START) };
    let listener = std::net::TcpListener::from(fd);
    let handle = ListenerHandle::from_std(listener)?;

    if let Ok(addr) = handle.local_addr() {
        tracing::info!(address = %addr, "resumed inherited listener");
    }
    Ok(handle)
}
