//! Process-wide tunables.
//!
//! These values are meant to be set once at process start, before any
//! reactor or event loop is created. They are read on hot paths, so they
//! live in relaxed atomics rather than behind a lock.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

static UDP_BUFFER_SIZE: AtomicUsize = AtomicUsize::new(1500);
static EVENT_NUMBER: AtomicUsize = AtomicUsize::new(2048);
static BUFFER_IO_STEP: AtomicUsize = AtomicUsize::new(1024);
static REACTOR_SHUTDOWN_TIMEOUT_MS: AtomicU64 = AtomicU64::new(5000);

/// Preallocated read/write buffer size for UDP sockets, in bytes.
#[must_use]
pub fn udp_buffer_size() -> usize {
    UDP_BUFFER_SIZE.load(Ordering::Relaxed)
}

/// Sets the preallocated buffer size for UDP sockets.
pub fn set_udp_buffer_size(bytes: usize) {
    UDP_BUFFER_SIZE.store(bytes.max(1), Ordering::Relaxed);
}

/// Maximum number of events returned by one poller wait.
#[must_use]
pub fn event_number() -> usize {
    EVENT_NUMBER.load(Ordering::Relaxed)
}

/// Sets the maximum number of events returned by one poller wait.
pub fn set_event_number(count: usize) {
    EVENT_NUMBER.store(count.max(1), Ordering::Relaxed);
}

/// Default chunk size for `read_all` / `write_all`, in bytes.
#[must_use]
pub fn buffer_io_step() -> usize {
    BUFFER_IO_STEP.load(Ordering::Relaxed)
}

/// Sets the default chunk size for `read_all` / `write_all`.
pub fn set_buffer_io_step(bytes: usize) {
    BUFFER_IO_STEP.store(bytes.max(1), Ordering::Relaxed);
}

/// Per-loop stop timeout used by reactor shutdown.
#[must_use]
pub fn reactor_shutdown_timeout() -> Duration {
    Duration::from_millis(REACTOR_SHUTDOWN_TIMEOUT_MS.load(Ordering::Relaxed))
}

/// Sets the per-loop stop timeout used by reactor shutdown.
pub fn set_reactor_shutdown_timeout(timeout: Duration) {
    REACTOR_SHUTDOWN_TIMEOUT_MS.store(timeout.as_millis() as u64, Ordering::Relaxed);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        assert_eq!(udp_buffer_size(), 1500);
        assert_eq!(event_number(), 2048);
        assert_eq!(buffer_io_step(), 1024);
        assert_eq!(reactor_shutdown_timeout(), Duration::from_millis(5000));
    }
}
