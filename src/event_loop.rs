//! Per-thread event loop: registration, priority dispatch, and stop.
//!
//! An [`EventLoop`] owns one [`Poller`] and three maps guarded by a single
//! mutex: `(fd, event) → (priority, io, handler)`, `fd → interest mask`,
//! and `fd → trigger mode`. Registration (bookkeeping) and activation
//! (programming the poller) are separate steps so a handler can be parked
//! and armed later; the `*_and_*` convenience methods do both atomically
//! under the loop's lock.
//!
//! # Dispatch
//!
//! `loop_once` waits for readiness, snapshots the matching handler tuples
//! under the lock, then releases it and drains them in descending
//! priority order. Stale events, where the pair is no longer registered
//! or no longer active, are dropped with a warning. Handler errors and
//! panics are caught at the dispatch boundary, logged with the fd, and
//! the loop continues; the mutex is never held while user code runs or
//! across a blocking syscall, so handlers may freely re-enter the
//! registration API on this loop or any other.
//!
//! # Stopping
//!
//! `stop_loop` must wake a loop parked in an indefinite wait. It
//! registers the write end of a fresh pipe for *writable* readiness at
//! the lowest priority; a pipe's write end is always writable, so the
//! next wait returns immediately, and the handler deactivates itself,
//! sets the stop flag, and signals a condition variable the stopper is
//! waiting on. Blocking reads on a stop pipe were observed to spin the
//! CPU on one platform; writable-readiness sidesteps that entirely and
//! behaves the same under level and edge triggering.

use crate::error::{Error, Result};
use crate::io::{pipe, IoObject};
use crate::poller::{FdEvent, Poller, TriggerMode};
use parking_lot::{Condvar, Mutex};
use std::any::Any;
use std::collections::HashMap;
use std::os::fd::RawFd;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, warn};

/// Dispatch priority for a registered event. Ready events from one wake
/// run from the highest priority down.
///
/// `Highest` and `Lowest` are reserved for internal use; user
/// registrations pick from `P0` (the default, most urgent) through `P6`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum Priority {
    /// Reserved for internal use.
    Lowest,
    /// Least urgent user priority.
    P6,
    /// Priority 5.
    P5,
    /// Priority 4.
    P4,
    /// Priority 3.
    P3,
    /// Priority 2.
    P2,
    /// Priority 1.
    P1,
    /// Most urgent user priority; the default.
    #[default]
    P0,
    /// Reserved for internal use.
    Highest,
}

/// Callback invoked when a registered event fires.
///
/// Errors returned here are logged at the dispatch boundary; they never
/// abort the loop.
pub type EventHandler = Arc<dyn Fn(&Arc<dyn IoObject>) -> Result<()> + Send + Sync>;

struct HandlerEntry {
    prio: Priority,
    io: Arc<dyn IoObject>,
    handler: EventHandler,
}

#[derive(Default)]
struct LoopState {
    handlers: HashMap<(RawFd, FdEvent), HandlerEntry>,
    masks: HashMap<RawFd, FdEvent>,
    modes: HashMap<RawFd, TriggerMode>,
}

/// Single-threaded dispatcher around one poller.
///
/// All registration methods are thread-safe; the loop methods are meant
/// to run on the one thread that owns this loop.
pub struct EventLoop {
    poller: Poller,
    state: Mutex<LoopState>,
    stop_cond: Condvar,
    stop: AtomicBool,
    loads: AtomicUsize,
    context: Option<Arc<dyn Any + Send + Sync>>,
}

impl EventLoop {
    /// Creates an event loop with no attached context.
    pub fn new() -> Result<Self> {
        Self::build(None)
    }

    /// Creates an event loop carrying a type-erased context that handlers
    /// can recover with [`context`].
    ///
    /// [`context`]: EventLoop::context
    pub fn with_context(context: Arc<dyn Any + Send + Sync>) -> Result<Self> {
        Self::build(Some(context))
    }

    fn build(context: Option<Arc<dyn Any + Send + Sync>>) -> Result<Self> {
        Ok(Self {
            poller: Poller::new()?,
            state: Mutex::new(LoopState::default()),
            stop_cond: Condvar::new(),
            stop: AtomicBool::new(false),
            loads: AtomicUsize::new(0),
            context,
        })
    }

    /// Downcasts the attached context.
    #[must_use]
    pub fn context<T: Send + Sync + 'static>(&self) -> Option<Arc<T>> {
        self.context.as_ref()?.clone().downcast::<T>().ok()
    }

    /// Number of (fd, event) pairs currently registered.
    ///
    /// Read without the loop lock; the value may be slightly stale, which
    /// is fine for its use as a load metric.
    #[must_use]
    pub fn loads(&self) -> usize {
        self.loads.load(Ordering::Relaxed)
    }

    /// Sets the trigger mode for this fd. Takes effect at the next
    /// activation; an fd keeps one mode across both of its events.
    pub fn set_mode(&self, iop: &Arc<dyn IoObject>, mode: TriggerMode) {
        let mut st = self.state.lock();
        st.modes.insert(iop.io().fd(), mode);
    }

    /// Records a handler for `(fd, ev)` without touching the poller.
    pub fn register(
        self: &Arc<Self>,
        iop: &Arc<dyn IoObject>,
        ev: FdEvent,
        handler: EventHandler,
        prio: Priority,
    ) -> Result<()> {
        let mut st = self.state.lock();
        self.register_locked(&mut st, iop, ev, handler, prio)
    }

    /// Arms the poller for a previously registered `(fd, ev)`.
    pub fn activate(self: &Arc<Self>, iop: &Arc<dyn IoObject>, ev: FdEvent) -> Result<()> {
        let mut st = self.state.lock();
        self.activate_locked(&mut st, iop.io().fd(), ev)
    }

    /// Registers and arms in one step, atomically under the loop's lock.
    pub fn register_and_activate(
        self: &Arc<Self>,
        iop: &Arc<dyn IoObject>,
        ev: FdEvent,
        handler: EventHandler,
        prio: Priority,
    ) -> Result<()> {
        let mut st = self.state.lock();
        self.register_locked(&mut st, iop, ev, handler, prio)?;
        self.activate_locked(&mut st, iop.io().fd(), ev)
    }

    /// Drops the handler for `(fd, ev)` without touching the poller.
    pub fn remove(self: &Arc<Self>, iop: &Arc<dyn IoObject>, ev: FdEvent) {
        let mut st = self.state.lock();
        self.remove_locked(&mut st, iop.io().fd(), ev);
    }

    /// Disarms the poller for `(fd, ev)`, keeping the handler registered.
    pub fn deactivate(self: &Arc<Self>, iop: &Arc<dyn IoObject>, ev: FdEvent) -> Result<()> {
        let mut st = self.state.lock();
        self.deactivate_locked(&mut st, iop.io().fd(), ev)
    }

    /// Disarms and drops in one step, atomically under the loop's lock.
    pub fn remove_and_deactivate(
        self: &Arc<Self>,
        iop: &Arc<dyn IoObject>,
        ev: FdEvent,
    ) -> Result<()> {
        let mut st = self.state.lock();
        let fd = iop.io().fd();
        self.deactivate_locked(&mut st, fd, ev)?;
        self.remove_locked(&mut st, fd, ev);
        Ok(())
    }

    /// Removes and disarms every event of this fd, clears its trigger
    /// mode, and detaches the fd from this loop.
    ///
    /// The poller removal is best-effort: the fd may already be closed,
    /// and the kernel drops closed fds from the interest set on its own.
    pub fn clean(self: &Arc<Self>, iop: &Arc<dyn IoObject>) {
        let fd = iop.io().fd();
        let mut st = self.state.lock();
        if st.masks.remove(&fd).is_some() {
            if let Err(e) = self.poller.delete(fd) {
                debug!(fd, error = %e, "poller delete during clean");
            }
        }
        st.handlers.remove(&(fd, FdEvent::READABLE));
        st.handlers.remove(&(fd, FdEvent::WRITABLE));
        st.modes.remove(&fd);
        self.loads.store(st.handlers.len(), Ordering::Relaxed);
        drop(st);
        iop.io().detach_loop();
    }

    /// One wait → dispatch cycle. `None` waits indefinitely.
    pub fn loop_once(&self, timeout: Option<Duration>) -> Result<()> {
        let ready = self.poller.wait(timeout)?;

        let mut batch: Vec<(Priority, Arc<dyn IoObject>, EventHandler)> =
            Vec::with_capacity(ready.len());
        {
            let st = self.state.lock();
            for (fd, ev) in ready {
                match st.handlers.get(&(fd, ev)) {
                    Some(entry) if st.masks.get(&fd).is_some_and(|m| m.contains(ev)) => {
                        batch.push((entry.prio, entry.io.clone(), entry.handler.clone()));
                    }
                    Some(_) => {
                        warn!(fd, event = ev.name(), "ready event is not active, dropping");
                    }
                    None => {
                        warn!(fd, event = ev.name(), "ready event has no handler, dropping");
                    }
                }
            }
        }

        batch.sort_by(|a, b| b.0.cmp(&a.0));
        for (_, iop, handler) in batch {
            match catch_unwind(AssertUnwindSafe(|| handler(&iop))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!(fd = iop.io().fd(), error = %e, "handler failed"),
                Err(_) => error!(fd = iop.io().fd(), "handler panicked"),
            }
        }
        Ok(())
    }

    /// Repeats [`loop_once`] until stopped.
    ///
    /// [`loop_once`]: EventLoop::loop_once
    pub fn loop_forever(&self, timeout: Option<Duration>) -> Result<()> {
        self.stop.store(false, Ordering::SeqCst);
        while !self.stop.load(Ordering::SeqCst) {
            self.loop_once(timeout)?;
        }
        Ok(())
    }

    /// Stops the loop and waits indefinitely for it to notice.
    pub fn stop_loop(self: &Arc<Self>) -> Result<()> {
        self.install_stop_event()?;
        let mut st = self.state.lock();
        while !self.stop.load(Ordering::SeqCst) {
            self.stop_cond.wait(&mut st);
        }
        Ok(())
    }

    /// Stops the loop, waiting up to `timeout`. Returns whether the stop
    /// was observed in time.
    pub fn stop_loop_timeout(self: &Arc<Self>, timeout: Duration) -> Result<bool> {
        self.install_stop_event()?;
        let deadline = Instant::now() + timeout;
        let mut st = self.state.lock();
        while !self.stop.load(Ordering::SeqCst) {
            let now = Instant::now();
            if now >= deadline {
                return Ok(false);
            }
            self.stop_cond.wait_for(&mut st, deadline - now);
        }
        Ok(true)
    }

    fn install_stop_event(self: &Arc<Self>) -> Result<()> {
        let (rd, wr) = pipe()?;
        debug!(fd = wr.io().fd(), "installing stop event");
        let handler: EventHandler = Arc::new(move |iop| {
            // Holding the read end keeps the pipe fully open until the
            // stop event has fired and removed itself.
            let _hold = &rd;
            let evlp = iop
                .io()
                .event_loop()
                .ok_or_else(|| Error::logic("stop event fired without an owning loop"))?;
            evlp.remove_and_deactivate(iop, FdEvent::WRITABLE)?;
            debug!(fd = iop.io().fd(), "stop event fired");
            let _st = evlp.state.lock();
            evlp.stop.store(true, Ordering::SeqCst);
            evlp.stop_cond.notify_all();
            Ok(())
        });
        let iop: Arc<dyn IoObject> = wr;
        self.register_and_activate(&iop, FdEvent::WRITABLE, handler, Priority::Lowest)
    }

    fn register_locked(
        self: &Arc<Self>,
        st: &mut LoopState,
        iop: &Arc<dyn IoObject>,
        ev: FdEvent,
        handler: EventHandler,
        prio: Priority,
    ) -> Result<()> {
        if !ev.is_single() {
            return Err(Error::logic("register takes a single event bit"));
        }
        let fd = iop.io().fd();
        if st.handlers.contains_key(&(fd, ev)) {
            return Err(Error::logic(format!(
                "{} event already registered for fd {fd}",
                ev.name()
            )));
        }
        iop.io().attach_loop(self);
        st.handlers.insert(
            (fd, ev),
            HandlerEntry {
                prio,
                io: iop.clone(),
                handler,
            },
        );
        st.modes.entry(fd).or_default();
        self.loads.store(st.handlers.len(), Ordering::Relaxed);
        Ok(())
    }

    fn remove_locked(&self, st: &mut LoopState, fd: RawFd, ev: FdEvent) {
        st.handlers.remove(&(fd, ev));
        self.loads.store(st.handlers.len(), Ordering::Relaxed);
    }

    fn activate_locked(&self, st: &mut LoopState, fd: RawFd, ev: FdEvent) -> Result<()> {
        if !st.handlers.contains_key(&(fd, ev)) {
            return Err(Error::logic(format!(
                "activate before register for fd {fd} {}",
                ev.name()
            )));
        }
        let current = st.masks.get(&fd).copied().unwrap_or(FdEvent::NONE);
        if current.contains(ev) {
            return Err(Error::logic(format!(
                "{} event already active for fd {fd}",
                ev.name()
            )));
        }
        let mode = st.modes.get(&fd).copied().unwrap_or_default();
        let mask = current | ev;
        if current.is_none() {
            self.poller.add(fd, mask, mode)?;
        } else {
            self.poller.modify(fd, mask, mode)?;
        }
        st.masks.insert(fd, mask);
        debug!(fd, event = ev.name(), "activate");
        Ok(())
    }

    fn deactivate_locked(&self, st: &mut LoopState, fd: RawFd, ev: FdEvent) -> Result<()> {
        let current = st.masks.get(&fd).copied().unwrap_or(FdEvent::NONE);
        if !current.contains(ev) {
            return Err(Error::logic(format!(
                "deactivate an inactive {} event for fd {fd}",
                ev.name()
            )));
        }
        let mask = current ^ ev;
        if mask.is_none() {
            self.poller.delete(fd)?;
            st.masks.remove(&fd);
        } else {
            let mode = st.modes.get(&fd).copied().unwrap_or_default();
            self.poller.modify(fd, mask, mode)?;
            st.masks.insert(fd, mask);
        }
        debug!(fd, event = ev.name(), "deactivate");
        Ok(())
    }
}

impl std::fmt::Debug for EventLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventLoop")
            .field("loads", &self.loads())
            .finish_non_exhaustive()
    }
}
