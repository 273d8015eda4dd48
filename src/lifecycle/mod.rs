//! Lifecycle management.
//!
//! # Data Flow
//! ```text
//! Shutdown (shutdown.rs):
//!     stop requested → accept loop exits → tokens reclaimed → drained signal
//!
//! Handoff (handoff.rs):
//!     duplicate descriptor → spawn replacement with fd at a fixed slot
//!     → replacement adopts the socket → old instance drains and exits
//! ```
//!
//! Signal-handling policy lives in application glue, not here: the demo
//! binary wires `ctrl_c` to `stop()` or to a handoff.

pub mod handoff;
pub mod shutdown;

pub use handoff::{can_resume, take_inherited, HandoffError, HandoffRequest, ResumeError};
pub use shutdown::Shutdown;
