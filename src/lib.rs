//! Graceful TCP server runtime.
//!
//! baton sits between a raw listening socket and an HTTP request engine and
//! adds the three things the bare engine lacks:
//!
//! - live-adjustable admission control over the number of simultaneously
//!   open connections ([`Server::set_ceiling`]),
//! - graceful shutdown that stops accepting but lets in-flight connections
//!   finish ([`Server::stop`], [`Server::stop_and_wait`]),
//! - zero-downtime handoff of the listening socket to a freshly started
//!   replacement process ([`Server::handoff`], [`Server::resume_and_serve`]).
//!
//! The request engine is whatever implements [`RequestEngine`]; this crate
//! never parses HTTP itself.
//!
//! ```no_run
//! use baton::{NoopEngine, Server, ServerConfig};
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = ServerConfig { bind_address: "127.0.0.1:8080".into(), ..Default::default() };
//!     let server = Server::new(config, NoopEngine);
//!     server.listen_and_serve().await.unwrap();
//! }
//! ```

pub mod config;
pub mod engine;
pub mod lifecycle;
pub mod net;
pub mod server;
pub mod throttle;

pub use config::{BackoffConfig, ConfigError, ServerConfig};
pub use engine::{ConnHandle, ConnState, ConnectionId, NoopEngine, RequestEngine};
pub use lifecycle::handoff::{
    can_resume, HandoffError, HandoffRequest, ResumeError, LISTEN_FDS_ENV, LISTEN_FDS_START,
};
pub use lifecycle::Shutdown;
pub use net::listener::{ListenerError, ListenerHandle};
pub use server::{Lifecycle, ServeError, Server};
pub use throttle::ThrottleError;
