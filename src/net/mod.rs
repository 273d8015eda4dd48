//! Network layer.
//!
//! # Data Flow
//! ```text
//! Incoming TCP connection
//!     → listener.rs (accept, deliberate-close signaling, descriptor duplication)
//!     → server accept loop (admission, lifecycle tracking)
//!     → hand off to the request engine
//! ```

pub mod listener;

pub use listener::{ListenerError, ListenerHandle};
