//! saftbus: a local IPC bus with DBus-like object, proxy and signal
//! semantics.
//!
//! The daemon side is a single-threaded cooperative event loop: a
//! [`Container`] owns service objects keyed by object path and numeric id,
//! a [`Server`] feeds socket readiness into it, and services push signals
//! to subscriber descriptors. The client side is a blocking
//! [`ClientConnection`] shared by [`Proxy`] stubs, with a [`SignalGroup`]
//! multiplexing asynchronous signal traffic for the whole process.

pub mod connection;
pub mod container;
pub mod error;
pub mod event_loop;
pub mod plugin;
pub mod proxy;
pub mod server;
pub mod service;
pub mod signal_group;
pub mod wire;

pub use connection::ClientConnection;
pub use container::{ClientId, Container, SignalSender};
pub use error::{Error, ErrorKind, Result};
pub use event_loop::{EventLoop, PollFlags, SourceId};
pub use plugin::{Plugin, PluginRegistry};
pub use proxy::{CoreProxy, Proxy};
pub use server::Server;
pub use service::{CallContext, CoreService, Service, unknown_method};
pub use signal_group::SignalGroup;
pub use wire::protocol::{ObjectId, ObjectStatus, Status};
pub use wire::transport::{DEFAULT_SOCKET_PATH, SOCKET_PATH_ENV, socket_path};
