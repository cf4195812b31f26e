//! Client-side bus connection.
//!
//! One blocking stream guarded by a mutex. `call_raw` is the only place on
//! the client where true multi-thread contention exists: acquire the lock,
//! send the request, block for the reply, release. A sent call is never
//! abandoned mid-flight — the caller waits for the reply or for the
//! connection to break.

use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::BytesMut;

use crate::error::{Error, Result};
use crate::wire::codec::encode_frame;
use crate::wire::protocol::{Reply, Request};
use crate::wire::transport::{self, socket_path};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

struct ConnState {
    stream: UnixStream,
    buf: BytesMut,
}

/// A client's connection to the bus. Shared by every proxy the process
/// creates on this daemon; `Arc` it and hand it around explicitly.
pub struct ClientConnection {
    id: u64,
    state: Mutex<ConnState>,
}

impl ClientConnection {
    /// Connect to the bus socket resolved from the environment (or the
    /// built-in default path).
    pub fn connect_env() -> Result<Self> {
        Self::connect(&socket_path(None))
    }

    pub fn connect(path: &Path) -> Result<Self> {
        let stream = transport::connect(path)?;
        tracing::debug!(path = %path.display(), "Connected to bus");
        Ok(Self {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            state: Mutex::new(ConnState {
                stream,
                buf: BytesMut::new(),
            }),
        })
    }

    /// Process-unique identity, used to track which connections have
    /// already received a signal group's descriptor.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Send one request and block for its reply. `attach` descriptors ride
    /// along as SCM_RIGHTS on the request frame.
    pub(crate) fn call_raw(&self, request: &Request, attach: &[RawFd]) -> Result<Reply> {
        let frame = encode_frame(request)?;
        let mut state = self
            .state
            .lock()
            .map_err(|_| Error::failed("bus connection poisoned by a crashed call"))?;
        let ConnState { stream, buf } = &mut *state;
        transport::send_all(stream.as_raw_fd(), &frame, attach)?;
        transport::read_frame_blocking(stream.as_raw_fd(), buf)
    }

    /// Call returning the raw result payload.
    pub fn call(&self, request: &Request) -> Result<Vec<u8>> {
        self.call_raw(request, &[])?.into_result()
    }
}
