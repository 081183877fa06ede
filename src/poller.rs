//! Thin wrapper over the OS readiness mechanism.
//!
//! [`Poller`] exposes exactly three registration operations (add, modify,
//! delete) plus [`wait`]. It is built on the `polling` crate, which wraps
//! epoll on Linux and kqueue on the BSDs behind one interface, so the rest
//! of the crate never touches a platform API directly.
//!
//! `wait` reports read and write readiness for the same fd as *separate*
//! entries, so the event loop can order them by priority independently.
//!
//! # Trigger modes
//!
//! | Mode | Behavior |
//! |------|----------|
//! | [`TriggerMode::Level`] | Fires while the condition persists. |
//! | [`TriggerMode::Edge`] | Fires on state change only. |
//! | [`TriggerMode::Oneshot`] | Fires once, then stays disarmed until modified. |
//!
//! With edge triggering, a readable event that is not fully drained may not
//! fire again until the peer sends more data, and a writable event that
//! does not fill the kernel buffer may or may not re-fire depending on the
//! backend. Readable and writable handlers should therefore drain with
//! `read_all` / `write_all`.
//!
//! [`wait`]: Poller::wait

use crate::config;
use crate::error::{Error, Result};
use parking_lot::Mutex;
use polling::{Event, Events, PollMode};
use std::num::NonZeroUsize;
use std::ops::{BitAnd, BitAndAssign, BitOr, BitOrAssign, BitXor, BitXorAssign};
use std::os::fd::{BorrowedFd, RawFd};
use std::time::Duration;

/// Readiness interest flags for one fd.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FdEvent(u8);

impl FdEvent {
    /// No interest.
    pub const NONE: FdEvent = FdEvent(0b00);
    /// Interest in readable events.
    pub const READABLE: FdEvent = FdEvent(0b01);
    /// Interest in writable events.
    pub const WRITABLE: FdEvent = FdEvent(0b10);

    /// Returns true if readable interest is set.
    #[must_use]
    pub const fn is_readable(self) -> bool {
        self.0 & Self::READABLE.0 != 0
    }

    /// Returns true if writable interest is set.
    #[must_use]
    pub const fn is_writable(self) -> bool {
        self.0 & Self::WRITABLE.0 != 0
    }

    /// Returns true if no interest is set.
    #[must_use]
    pub const fn is_none(self) -> bool {
        self.0 == 0
    }

    /// Returns true if exactly one interest bit is set.
    #[must_use]
    pub const fn is_single(self) -> bool {
        self.0.count_ones() == 1
    }

    /// Returns true if every bit of `other` is set in `self`.
    #[must_use]
    pub const fn contains(self, other: FdEvent) -> bool {
        self.0 & other.0 == other.0
    }

    /// Short name for logs.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self.0 {
            0b01 => "readable",
            0b10 => "writable",
            0b11 => "readable|writable",
            _ => "none",
        }
    }
}

impl BitOr for FdEvent {
    type Output = FdEvent;
    fn bitor(self, rhs: FdEvent) -> FdEvent {
        FdEvent(self.0 | rhs.0)
    }
}

impl BitOrAssign for FdEvent {
    fn bitor_assign(&mut self, rhs: FdEvent) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for FdEvent {
    type Output = FdEvent;
    fn bitand(self, rhs: FdEvent) -> FdEvent {
        FdEvent(self.0 & rhs.0)
    }
}

impl BitAndAssign for FdEvent {
    fn bitand_assign(&mut self, rhs: FdEvent) {
        self.0 &= rhs.0;
    }
}

impl BitXor for FdEvent {
    type Output = FdEvent;
    fn bitxor(self, rhs: FdEvent) -> FdEvent {
        FdEvent(self.0 ^ rhs.0)
    }
}

impl BitXorAssign for FdEvent {
    fn bitxor_assign(&mut self, rhs: FdEvent) {
        self.0 ^= rhs.0;
    }
}

/// How readiness events re-fire for an fd.
///
/// One fd must use the same mode across both of its events; some backends
/// program the mode per fd, not per event. The event loop enforces this.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum TriggerMode {
    /// Fire while the condition persists.
    #[default]
    Level,
    /// Fire on state change only.
    Edge,
    /// Fire once, then stay disarmed until the registration is modified.
    Oneshot,
}

impl TriggerMode {
    fn poll_mode(self) -> PollMode {
        match self {
            TriggerMode::Level => PollMode::Level,
            TriggerMode::Edge => PollMode::Edge,
            TriggerMode::Oneshot => PollMode::Oneshot,
        }
    }
}

fn poll_event(key: usize, mask: FdEvent) -> Event {
    match (mask.is_readable(), mask.is_writable()) {
        (true, true) => Event::all(key),
        (true, false) => Event::readable(key),
        (false, true) => Event::writable(key),
        (false, false) => Event::none(key),
    }
}

/// Readiness poller for many fds.
///
/// Registration failures are never silently ignored; every underlying
/// syscall failure is reported as a system error.
pub struct Poller {
    inner: polling::Poller,
    events: Mutex<Events>,
}

impl Poller {
    /// Creates a poller handle.
    pub fn new() -> Result<Self> {
        let inner = polling::Poller::new().map_err(|e| Error::system_io("poller create", e))?;
        let capacity = NonZeroUsize::new(config::event_number()).unwrap_or(NonZeroUsize::MIN);
        Ok(Self {
            inner,
            events: Mutex::new(Events::with_capacity(capacity)),
        })
    }

    /// Starts watching `fd` for `mask` with the given trigger mode.
    pub fn add(&self, fd: RawFd, mask: FdEvent, mode: TriggerMode) -> Result<()> {
        // The caller keeps the fd open for as long as it stays registered;
        // the event loop's handler map owns the io object.
        unsafe {
            self.inner
                .add_with_mode(fd, poll_event(fd as usize, mask), mode.poll_mode())
        }
        .map_err(|e| Error::system_io(format!("poller add fd {fd}"), e))
    }

    /// Replaces the watched mask for an already-added `fd`.
    pub fn modify(&self, fd: RawFd, mask: FdEvent, mode: TriggerMode) -> Result<()> {
        let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
        self.inner
            .modify_with_mode(borrowed, poll_event(fd as usize, mask), mode.poll_mode())
            .map_err(|e| Error::system_io(format!("poller modify fd {fd}"), e))
    }

    /// Stops watching `fd` entirely.
    pub fn delete(&self, fd: RawFd) -> Result<()> {
        let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
        self.inner
            .delete(borrowed)
            .map_err(|e| Error::system_io(format!("poller delete fd {fd}"), e))
    }

    /// Waits for readiness and returns the ready (fd, event) pairs, with
    /// read and write readiness reported separately. `None` waits
    /// indefinitely. An interrupted wait returns an empty batch.
    pub fn wait(&self, timeout: Option<Duration>) -> Result<Vec<(RawFd, FdEvent)>> {
        let mut events = self.events.lock();
        events.clear();
        if let Err(e) = self.inner.wait(&mut *events, timeout) {
            if e.kind() == std::io::ErrorKind::Interrupted {
                return Ok(Vec::new());
            }
            return Err(Error::system_io("poller wait", e));
        }

        let mut ready = Vec::with_capacity(events.len());
        for ev in events.iter() {
            if ev.key == usize::MAX {
                // Reserved by the backend for its internal notifier.
                continue;
            }
            let fd = ev.key as RawFd;
            if ev.readable {
                ready.push((fd, FdEvent::READABLE));
            }
            if ev.writable {
                ready.push((fd, FdEvent::WRITABLE));
            }
        }
        Ok(ready)
    }
}

impl std::fmt::Debug for Poller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Poller").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_bit_operators() {
        let rd = FdEvent::READABLE;
        let wr = FdEvent::WRITABLE;

        let both = rd | wr;
        assert!(both.is_readable() && both.is_writable());
        assert_eq!(both & rd, rd);
        assert_eq!(both ^ rd, wr);
        assert_eq!(both ^ wr, rd);

        let mut ev = rd;
        ev |= wr;
        assert_eq!(ev, both);
        ev ^= rd;
        assert_eq!(ev, wr);
        ev &= rd;
        assert!(ev.is_none());
    }

    #[test]
    fn single_bit_checks() {
        assert!(FdEvent::READABLE.is_single());
        assert!(FdEvent::WRITABLE.is_single());
        assert!(!(FdEvent::READABLE | FdEvent::WRITABLE).is_single());
        assert!(!FdEvent::NONE.is_single());
    }

    #[test]
    fn pipe_write_end_reports_writable() {
        let poller = Poller::new().expect("poller create");
        let mut fds = [0; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        let (rd, wr) = (fds[0], fds[1]);

        poller
            .add(wr, FdEvent::WRITABLE, TriggerMode::Level)
            .expect("add");
        let ready = poller
            .wait(Some(Duration::from_secs(1)))
            .expect("wait");
        assert!(ready.contains(&(wr, FdEvent::WRITABLE)));

        poller.delete(wr).expect("delete");
        unsafe {
            libc::close(rd);
            libc::close(wr);
        }
    }

    #[test]
    fn wait_times_out_with_empty_batch() {
        let poller = Poller::new().expect("poller create");
        let start = std::time::Instant::now();
        let ready = poller.wait(Some(Duration::from_millis(50))).expect("wait");
        assert!(ready.is_empty());
        assert!(start.elapsed() >= Duration::from_millis(40));
    }
}
