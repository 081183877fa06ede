//! Named worker threads with a completion handle.
//!
//! [`Runnable`] is a thin wrapper over `std::thread` adding the pieces
//! the reactor needs: a bounded [`wait_for`], a signal sender, and a hard
//! [`cancel`] for test teardown. Completion is tracked by a flag and
//! condition variable set when the thread body finishes, whether it
//! returned or panicked.
//!
//! [`wait_for`]: Runnable::wait_for
//! [`cancel`]: Runnable::cancel

use crate::error::{Error, Result};
use parking_lot::{Condvar, Mutex};
use std::os::unix::thread::JoinHandleExt;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

#[derive(Default)]
struct Completion {
    done: Mutex<bool>,
    cond: Condvar,
}

impl Completion {
    fn set(&self) {
        let mut done = self.done.lock();
        *done = true;
        self.cond.notify_all();
    }

    fn wait_for(&self, timeout: Duration) -> bool {
        let mut done = self.done.lock();
        if *done {
            return true;
        }
        self.cond.wait_for(&mut done, timeout);
        *done
    }
}

struct CompletionGuard(Arc<Completion>);

impl Drop for CompletionGuard {
    fn drop(&mut self) {
        self.0.set();
    }
}

/// A spawned thread with join, bounded wait, cancel, and signal delivery.
pub struct Runnable {
    handle: Option<JoinHandle<()>>,
    completion: Arc<Completion>,
}

impl Runnable {
    /// Spawns a named thread running `body`.
    pub fn spawn<F>(name: &str, body: F) -> Result<Self>
    where
        F: FnOnce() + Send + 'static,
    {
        let completion = Arc::new(Completion::default());
        let guard_target = completion.clone();
        let handle = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                let _guard = CompletionGuard(guard_target);
                body();
            })
            .map_err(|e| Error::system_io(format!("spawn thread {name}"), e))?;
        Ok(Self {
            handle: Some(handle),
            completion,
        })
    }

    /// Waits for the thread to finish. Subsequent calls are no-ops.
    /// A `Runnable` dropped without joining leaves its thread detached.
    pub fn join(&mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }

    /// Waits up to `timeout` for the thread body to finish. Returns
    /// whether it did. Does not reap the thread; call [`join`] for that.
    ///
    /// [`join`]: Runnable::join
    #[must_use]
    pub fn wait_for(&self, timeout: Duration) -> bool {
        self.completion.wait_for(timeout)
    }

    /// Requests asynchronous cancellation of the thread.
    ///
    /// This bypasses all cleanup in the thread body. It exists for test
    /// teardown of wedged threads; orderly code stops its event loop
    /// instead.
    pub fn cancel(&self) -> bool {
        match &self.handle {
            Some(handle) => unsafe { libc::pthread_cancel(handle.as_pthread_t()) == 0 },
            None => false,
        }
    }

    /// Delivers `sig` to the thread.
    pub fn send_signal(&self, sig: libc::c_int) -> Result<()> {
        let handle = self
            .handle
            .as_ref()
            .ok_or_else(|| Error::logic("send_signal after join"))?;
        let ret = unsafe { libc::pthread_kill(handle.as_pthread_t(), sig) };
        if ret != 0 {
            return Err(Error::system_errno("pthread_kill", ret));
        }
        Ok(())
    }
}

impl std::fmt::Debug for Runnable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runnable")
            .field("joined", &self.handle.is_none())
            .finish()
    }
}
