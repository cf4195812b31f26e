//! Client-side signal multiplexer.
//!
//! One socketpair per group: the send half travels to the daemon (once per
//! connection, as SCM_RIGHTS), the receive half is polled locally by
//! whichever thread calls `wait_for_signal`. Dispatch goes through an
//! explicit typed subscription table keyed by (object id, interface index,
//! signal index) — no ambient closures, no lazily constructed process
//! global: construct a group and share the handle.

use std::collections::{HashMap, HashSet};
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use bytes::BytesMut;
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};

use crate::error::{Error, Result};
use crate::wire::codec::decode_frame;
use crate::wire::protocol::{ObjectId, Signal};
use crate::wire::transport::{borrow_raw, recv_with_fds};

static NEXT_GROUP_ID: AtomicU64 = AtomicU64::new(1);

pub(crate) type SignalKey = (ObjectId, u32, u32);
type Handler = Box<dyn FnMut(&[u8]) + Send>;
type CatchAll = Box<dyn FnMut(&Signal) + Send>;

struct RecvState {
    stream: UnixStream,
    buf: BytesMut,
}

struct GroupInner {
    id: u64,
    /// Send half, kept open for the group's lifetime so it can be passed to
    /// further connections.
    send_half: UnixStream,
    recv: Mutex<RecvState>,
    handlers: Mutex<HashMap<SignalKey, Handler>>,
    /// Envelopes with no registered handler land here, if set.
    catch_all: Mutex<Option<CatchAll>>,
    /// Connection ids that already hold this group's descriptor.
    attached: Mutex<HashSet<u64>>,
}

/// Process-scoped fan-in point for asynchronous signal traffic. Cloning
/// shares the underlying descriptor and table.
#[derive(Clone)]
pub struct SignalGroup {
    inner: Arc<GroupInner>,
}

impl SignalGroup {
    pub fn new() -> Result<Self> {
        let (recv_half, send_half) = UnixStream::pair()?;
        Ok(Self {
            inner: Arc::new(GroupInner {
                id: NEXT_GROUP_ID.fetch_add(1, Ordering::Relaxed),
                send_half,
                recv: Mutex::new(RecvState {
                    stream: recv_half,
                    buf: BytesMut::new(),
                }),
                handlers: Mutex::new(HashMap::new()),
                catch_all: Mutex::new(None),
                attached: Mutex::new(HashSet::new()),
            }),
        })
    }

    /// Process-local group identity carried in register-proxy requests.
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Raw descriptor of the send half, for SCM_RIGHTS attachment.
    pub(crate) fn send_fd(&self) -> RawFd {
        self.inner.send_half.as_raw_fd()
    }

    pub(crate) fn is_attached(&self, connection_id: u64) -> bool {
        lock_or_failed(&self.inner.attached)
            .map(|set| set.contains(&connection_id))
            .unwrap_or(false)
    }

    pub(crate) fn mark_attached(&self, connection_id: u64) {
        if let Ok(mut set) = lock_or_failed(&self.inner.attached) {
            set.insert(connection_id);
        }
    }

    pub(crate) fn register_handler(&self, key: SignalKey, handler: Handler) {
        if let Ok(mut handlers) = lock_or_failed(&self.inner.handlers) {
            if handlers.insert(key, handler).is_some() {
                tracing::debug!(
                    object = %key.0,
                    interface = key.1,
                    signal = key.2,
                    "Signal handler replaced"
                );
            }
        }
    }

    pub(crate) fn unregister_handler(&self, key: &SignalKey) {
        if let Ok(mut handlers) = lock_or_failed(&self.inner.handlers) {
            handlers.remove(key);
        }
    }

    /// Install a fallback receiving every envelope no table entry matches.
    /// Used by monitoring tools that do not know interface layouts upfront.
    pub fn set_catch_all(&self, handler: impl FnMut(&Signal) + Send + 'static) {
        if let Ok(mut slot) = lock_or_failed(&self.inner.catch_all) {
            *slot = Some(Box::new(handler));
        }
    }

    /// Block (with optional timeout, `timeout_ms < 0` meaning indefinitely)
    /// until signal traffic arrives, then dispatch every complete envelope.
    /// Returns whether at least one envelope reached a handler.
    pub fn wait_for_signal(&self, timeout_ms: i64) -> Result<bool> {
        let mut recv = self
            .inner
            .recv
            .lock()
            .map_err(|_| Error::failed("signal group receive state poisoned"))?;

        let timeout = if timeout_ms < 0 {
            PollTimeout::NONE
        } else {
            let ms = timeout_ms.min(i32::MAX as i64) as i32;
            PollTimeout::try_from(ms).unwrap_or(PollTimeout::MAX)
        };
        let fd = recv.stream.as_raw_fd();
        let mut fds = [PollFd::new(borrow_raw(fd), PollFlags::POLLIN)];
        match poll(&mut fds, timeout) {
            Ok(0) => return Ok(false),
            Ok(_) => {}
            Err(nix::errno::Errno::EINTR) => return Ok(false),
            Err(e) => return Err(e.into()),
        }

        let outcome = recv_with_fds(fd, &mut recv.buf)?;
        if outcome.bytes == 0 {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "daemon closed the signal channel",
            )));
        }

        let mut dispatched = 0usize;
        while let Some(signal) = decode_frame::<Signal>(&mut recv.buf)? {
            if self.dispatch(&signal)? {
                dispatched += 1;
            }
        }
        Ok(dispatched > 0)
    }

    fn dispatch(&self, signal: &Signal) -> Result<bool> {
        let key = (signal.object_id, signal.interface_no, signal.signal_no);

        // Take the handler out for the call so a handler may register or
        // remove subscriptions without deadlocking on the table lock.
        let handler = lock_or_failed(&self.inner.handlers)?.remove(&key);
        if let Some(mut handler) = handler {
            handler(&signal.payload);
            let mut handlers = lock_or_failed(&self.inner.handlers)?;
            // Only put it back if the handler did not replace itself.
            handlers.entry(key).or_insert(handler);
            return Ok(true);
        }

        let mut catch_all = lock_or_failed(&self.inner.catch_all)?;
        if let Some(handler) = catch_all.as_mut() {
            handler(signal);
            return Ok(true);
        }

        tracing::trace!(
            object = %signal.object_id,
            interface = signal.interface_no,
            signal = signal.signal_no,
            "Dropping signal with no registered handler"
        );
        Ok(false)
    }
}

fn lock_or_failed<T>(mutex: &Mutex<T>) -> Result<std::sync::MutexGuard<'_, T>> {
    mutex
        .lock()
        .map_err(|_| Error::failed("signal group table poisoned"))
}
