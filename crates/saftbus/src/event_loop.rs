//! Single-threaded cooperative event loop.
//!
//! Sources are timeout sources (first-due delay plus optional repeat period)
//! and io sources (descriptor plus interest mask), multiplexed over one
//! `poll(2)` call whose timeout is the earliest pending timer deadline.
//!
//! `EventLoop` is a cheap clonable handle; there is no hidden process-wide
//! default instance. The loop owns every callback closure. Removal is
//! deferred: `remove` marks the source (it will never fire again) and the
//! closure is dropped only after any in-flight dispatch returns, so a
//! callback may remove its own source, and tearing sources down before the
//! code behind them goes away is the registrant's one ordering obligation.

use std::cell::{Cell, RefCell};
use std::os::fd::RawFd;
use std::rc::Rc;
use std::time::{Duration, Instant};

use nix::poll::{PollFd, PollTimeout, poll};

pub use nix::poll::PollFlags;

use crate::wire::transport::borrow_raw;

/// Opaque handle to a registered source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SourceId(u64);

impl std::fmt::Display for SourceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

enum SourceKind {
    Timeout {
        due: Instant,
        period: Option<Duration>,
        callback: Box<dyn FnMut() -> bool>,
    },
    Io {
        fd: RawFd,
        interest: PollFlags,
        callback: Box<dyn FnMut(PollFlags) -> bool>,
    },
}

struct SourceState {
    id: SourceId,
    removed: Cell<bool>,
    kind: RefCell<SourceKind>,
}

struct Inner {
    next_source: u64,
    /// Registration order; swept after each dispatch round.
    sources: Vec<Rc<SourceState>>,
    quit: bool,
}

/// Handle to the loop. Clones share one underlying source table; the loop is
/// single-threaded by construction (`Rc`, not `Arc`).
#[derive(Clone)]
pub struct EventLoop {
    inner: Rc<RefCell<Inner>>,
}

impl Default for EventLoop {
    fn default() -> Self {
        Self::new()
    }
}

impl EventLoop {
    pub fn new() -> Self {
        Self {
            inner: Rc::new(RefCell::new(Inner {
                next_source: 1,
                sources: Vec::new(),
                quit: false,
            })),
        }
    }

    fn add(&self, kind: SourceKind) -> SourceId {
        let mut inner = self.inner.borrow_mut();
        let id = SourceId(inner.next_source);
        inner.next_source += 1;
        inner.sources.push(Rc::new(SourceState {
            id,
            removed: Cell::new(false),
            kind: RefCell::new(kind),
        }));
        tracing::trace!(source = %id, "Source registered");
        id
    }

    /// Register a repeating timeout firing first after `period` and then
    /// every `period`.
    pub fn add_timeout(
        &self,
        period: Duration,
        callback: impl FnMut() -> bool + 'static,
    ) -> SourceId {
        self.add_timeout_with_delay(period, Some(period), callback)
    }

    /// Register a timeout with an explicit first-due delay. Without a period
    /// the source is one-shot; with one, the callback returning `false`
    /// cancels the repeat. Repeats keep a fixed cadence (each deadline is the
    /// previous deadline plus the period).
    pub fn add_timeout_with_delay(
        &self,
        first: Duration,
        period: Option<Duration>,
        callback: impl FnMut() -> bool + 'static,
    ) -> SourceId {
        self.add(SourceKind::Timeout {
            due: Instant::now() + first,
            period,
            callback: Box::new(callback),
        })
    }

    /// Register an io source. The callback receives the fired condition and
    /// deregisters itself by returning `false`. The registrant must keep the
    /// descriptor open until the source is removed.
    pub fn add_io(
        &self,
        fd: RawFd,
        interest: PollFlags,
        callback: impl FnMut(PollFlags) -> bool + 'static,
    ) -> SourceId {
        self.add(SourceKind::Io {
            fd,
            interest,
            callback: Box::new(callback),
        })
    }

    /// Deregister a source. Safe to call from inside that source's own
    /// callback: the mark takes effect immediately, the closure is dropped
    /// once dispatch returns.
    pub fn remove(&self, id: SourceId) {
        let inner = self.inner.borrow();
        match inner.sources.iter().find(|s| s.id == id) {
            Some(state) => state.removed.set(true),
            None => tracing::debug!(source = %id, "remove() on unknown source"),
        }
    }

    /// Ask `run()` to return after the current round.
    pub fn quit(&self) {
        self.inner.borrow_mut().quit = true;
    }

    /// Loop `iteration(true)` until `quit()`.
    pub fn run(&self) {
        loop {
            if self.inner.borrow().quit {
                break;
            }
            self.iteration(true);
        }
        tracing::debug!("Event loop exiting");
    }

    /// Service one round of ready sources. With `may_block` the wait is the
    /// earliest timer deadline (indefinite when no timers are pending);
    /// without it the poll returns immediately. Returns whether any source
    /// dispatched.
    pub fn iteration(&self, may_block: bool) -> bool {
        let snapshot: Vec<Rc<SourceState>> = {
            let mut inner = self.inner.borrow_mut();
            inner.sources.retain(|s| !s.removed.get());
            inner.sources.clone()
        };

        let now = Instant::now();
        let mut earliest: Option<Instant> = None;
        let mut io_entries: Vec<(Rc<SourceState>, RawFd, PollFlags)> = Vec::new();
        for state in &snapshot {
            match &*state.kind.borrow() {
                SourceKind::Timeout { due, .. } => {
                    if earliest.is_none_or(|e| *due < e) {
                        earliest = Some(*due);
                    }
                }
                SourceKind::Io { fd, interest, .. } => {
                    io_entries.push((Rc::clone(state), *fd, *interest));
                }
            }
        }

        let timeout = if !may_block {
            PollTimeout::ZERO
        } else {
            match earliest {
                Some(due) => {
                    let remaining = due.saturating_duration_since(now);
                    // Round up so a not-quite-due timer does not busy-spin.
                    let ms = remaining
                        .as_millis()
                        .saturating_add(u128::from(remaining.subsec_nanos() % 1_000_000 != 0))
                        .min(i32::MAX as u128) as i32;
                    PollTimeout::try_from(ms).unwrap_or(PollTimeout::MAX)
                }
                None => PollTimeout::NONE,
            }
        };

        let mut pollfds: Vec<PollFd> = io_entries
            .iter()
            .map(|(_, fd, interest)| PollFd::new(borrow_raw(*fd), *interest))
            .collect();

        match poll(&mut pollfds, timeout) {
            Ok(_) => {}
            Err(nix::errno::Errno::EINTR) => return false,
            Err(e) => {
                tracing::error!(error = %e, "poll failed");
                return false;
            }
        }
        let fired: Vec<Option<PollFlags>> = pollfds.iter().map(|p| p.revents()).collect();
        drop(pollfds);

        let mut dispatched = 0usize;

        // Due timers first, earliest deadline first; equal deadlines keep
        // registration order (stable sort over a registration-ordered list).
        let now = Instant::now();
        let mut due_timers: Vec<(Instant, Rc<SourceState>)> = snapshot
            .iter()
            .filter(|s| !s.removed.get())
            .filter_map(|s| match &*s.kind.borrow() {
                SourceKind::Timeout { due, .. } if *due <= now => Some((*due, Rc::clone(s))),
                _ => None,
            })
            .collect();
        due_timers.sort_by_key(|(due, _)| *due);

        for (_, state) in due_timers {
            if state.removed.get() {
                continue;
            }
            let keep = {
                let mut kind = state.kind.borrow_mut();
                match &mut *kind {
                    SourceKind::Timeout {
                        due,
                        period,
                        callback,
                    } => {
                        let again = callback();
                        match (again, *period) {
                            (true, Some(p)) => {
                                *due += p;
                                true
                            }
                            _ => false,
                        }
                    }
                    SourceKind::Io { .. } => true,
                }
            };
            dispatched += 1;
            if !keep {
                state.removed.set(true);
            }
        }

        // Ready io sources in registration order.
        for ((state, _, _), revents) in io_entries.iter().zip(fired) {
            let Some(revents) = revents else { continue };
            if revents.is_empty() || state.removed.get() {
                continue;
            }
            let keep = {
                let mut kind = state.kind.borrow_mut();
                match &mut *kind {
                    SourceKind::Io { callback, .. } => callback(revents),
                    SourceKind::Timeout { .. } => true,
                }
            };
            dispatched += 1;
            if !keep {
                state.removed.set(true);
            }
        }

        // Sweep now so closures marked during this round are dropped as soon
        // as the snapshot goes away.
        self.inner
            .borrow_mut()
            .sources
            .retain(|s| !s.removed.get());

        dispatched > 0
    }
}
