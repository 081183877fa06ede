//! Multi-threaded TCP reactor.
//!
//! A [`TcpServer`] or [`TcpClient`] is N + M threads: N workers hosting
//! established connections, plus M acceptors (server) or connectors
//! (client), each thread owning one event loop. New connections are
//! handed from acceptor/connector to the worker whose loop currently
//! reports the fewest registered events.
//!
//! ```text
//!            TcpServer                         TcpClient
//!  ┌────────────────────────┐        ┌─────────────────────────┐
//!  │ acceptor ── listen fds │        │ connector ── wake pipe  │
//!  │     │  accept batch    │        │     │  connect targets  │
//!  │     ▼  least loaded    │        │     ▼  least loaded     │
//!  │ worker worker worker   │        │ worker worker worker    │
//!  └────────────────────────┘        └─────────────────────────┘
//! ```
//!
//! User code supplies up to five callbacks, set before `run()` and read
//! by all worker threads afterwards: `on_accept` / `on_connect`,
//! `on_read_complete`, `on_write_complete`, and `on_closed`. Each
//! callback receives the shared handle of the TCP socket it concerns and
//! may use [`async_write`], [`safely_close`], and [`external_data`] on
//! it. Per-connection failures never take the reactor down; they are
//! logged, the connection is closed, and `on_closed` fires.

mod acceptor;
mod client;
mod connector;
mod server;
mod worker;

pub use client::TcpClient;
pub use connector::Host;
pub use server::TcpServer;

use crate::config;
use crate::error::{Error, Result};
use crate::event_loop::EventLoop;
use crate::io::{IoObject, StreamIo, TcpSocket};
use crate::poller::FdEvent;
use parking_lot::RwLock;
use std::any::Any;
use std::sync::Arc;
use tracing::error;

/// Callback type for the five reactor events.
pub type TcpEventHandler = Arc<dyn Fn(&Arc<TcpSocket>) + Send + Sync>;

fn idle_handler() -> TcpEventHandler {
    Arc::new(|_| {})
}

struct Callbacks {
    on_accept: TcpEventHandler,
    on_connect: TcpEventHandler,
    on_read_complete: TcpEventHandler,
    on_write_complete: TcpEventHandler,
    on_closed: TcpEventHandler,
}

impl Default for Callbacks {
    fn default() -> Self {
        Self {
            on_accept: idle_handler(),
            on_connect: idle_handler(),
            on_read_complete: idle_handler(),
            on_write_complete: idle_handler(),
            on_closed: idle_handler(),
        }
    }
}

/// Data shared by every thread of one reactor instance.
///
/// Created before any thread starts and kept alive by the worker loops
/// that reference it as their context. Callbacks are set during setup and
/// treated as immutable once `run()` begins.
pub(crate) struct SharedData {
    callbacks: RwLock<Callbacks>,
    external: Option<Arc<dyn Any + Send + Sync>>,
    // Weak refs: the worker loops hold this struct as their context, and
    // the registry must not keep them alive in return.
    worker_loops: RwLock<Vec<std::sync::Weak<EventLoop>>>,
}

impl SharedData {
    pub(crate) fn new(external: Option<Arc<dyn Any + Send + Sync>>) -> Self {
        Self {
            callbacks: RwLock::new(Callbacks::default()),
            external,
            worker_loops: RwLock::new(Vec::new()),
        }
    }

    pub(crate) fn set_on_accept(&self, handler: TcpEventHandler) {
        self.callbacks.write().on_accept = handler;
    }

    pub(crate) fn set_on_connect(&self, handler: TcpEventHandler) {
        self.callbacks.write().on_connect = handler;
    }

    pub(crate) fn set_on_read_complete(&self, handler: TcpEventHandler) {
        self.callbacks.write().on_read_complete = handler;
    }

    pub(crate) fn set_on_write_complete(&self, handler: TcpEventHandler) {
        self.callbacks.write().on_write_complete = handler;
    }

    pub(crate) fn set_on_closed(&self, handler: TcpEventHandler) {
        self.callbacks.write().on_closed = handler;
    }

    pub(crate) fn on_accept(&self) -> TcpEventHandler {
        self.callbacks.read().on_accept.clone()
    }

    pub(crate) fn on_connect(&self) -> TcpEventHandler {
        self.callbacks.read().on_connect.clone()
    }

    pub(crate) fn on_read_complete(&self) -> TcpEventHandler {
        self.callbacks.read().on_read_complete.clone()
    }

    pub(crate) fn on_write_complete(&self) -> TcpEventHandler {
        self.callbacks.read().on_write_complete.clone()
    }

    pub(crate) fn on_closed(&self) -> TcpEventHandler {
        self.callbacks.read().on_closed.clone()
    }

    pub(crate) fn push_worker_loop(&self, evlp: &Arc<EventLoop>) {
        self.worker_loops.write().push(Arc::downgrade(evlp));
    }

    /// The worker loop with the fewest registered events.
    ///
    /// Loads are read without any loop's lock; a stale value places a
    /// connection suboptimally at worst.
    pub(crate) fn min_load_loop(&self) -> Result<Arc<EventLoop>> {
        self.worker_loops
            .read()
            .iter()
            .filter_map(std::sync::Weak::upgrade)
            .min_by_key(|evlp| evlp.loads())
            .ok_or_else(|| Error::logic("reactor has no worker loops"))
    }

    pub(crate) fn external(&self) -> Option<Arc<dyn Any + Send + Sync>> {
        self.external.clone()
    }
}

/// Recovers the concrete TCP socket behind an event-loop handle.
pub(crate) fn as_tcp(iop: &Arc<dyn IoObject>) -> Result<Arc<TcpSocket>> {
    iop.clone()
        .as_any()
        .downcast::<TcpSocket>()
        .map_err(|_| Error::logic("expected a tcp socket"))
}

/// The reactor data of the loop currently owning `sock`.
pub(crate) fn shared_of(sock: &Arc<TcpSocket>) -> Result<Arc<SharedData>> {
    let evlp = sock
        .io()
        .event_loop()
        .ok_or_else(|| Error::logic("socket is not owned by an event loop"))?;
    evlp.context::<SharedData>()
        .ok_or_else(|| Error::logic("owning loop carries no reactor data"))
}

/// Sends whatever sits in the socket's write buffer.
///
/// Callable from any handler running on a worker thread. Tries a direct
/// non-blocking send first; if the buffer drains, `on_write_complete`
/// fires synchronously. Otherwise the writable event is armed and the
/// worker drains the rest as the kernel accepts it. A peer that is gone
/// gets the close treatment: `on_closed`, clean, close.
pub fn async_write(sock: &Arc<TcpSocket>) {
    let shared = match shared_of(sock) {
        Ok(shared) => shared,
        Err(e) => {
            error!(fd = sock.io().fd(), error = %e, "async_write outside the reactor");
            return;
        }
    };
    if let Err(e) = sock.write_all(config::buffer_io_step()) {
        error!(fd = sock.io().fd(), error = %e, "write failed");
    }
    if sock.io().wbuffer().is_empty() {
        (shared.on_write_complete())(sock);
    } else if sock.is_eop() || sock.is_reset() {
        if !sock.io().is_closed() {
            (shared.on_closed())(sock);
            let iop: Arc<dyn IoObject> = sock.clone();
            if let Some(evlp) = sock.io().event_loop() {
                evlp.clean(&iop);
            }
            sock.io().close();
        }
    } else if let Some(evlp) = sock.io().event_loop() {
        let iop: Arc<dyn IoObject> = sock.clone();
        if let Err(e) = evlp.activate(&iop, FdEvent::WRITABLE) {
            error!(fd = sock.io().fd(), error = %e, "arming writable failed");
        }
    }
}

/// Removes the socket from its event loop, then closes it.
///
/// The removal must come first; a poller forgets closed fds on its own
/// terms, not necessarily before the fd number is reused.
pub fn safely_close(sock: &Arc<TcpSocket>) {
    let iop: Arc<dyn IoObject> = sock.clone();
    if let Some(evlp) = sock.io().event_loop() {
        evlp.clean(&iop);
    }
    sock.io().close();
}

/// The user data attached to the reactor owning `sock`.
pub fn external_data(sock: &Arc<TcpSocket>) -> Option<Arc<dyn Any + Send + Sync>> {
    shared_of(sock).ok()?.external()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn min_load_loop_requires_workers() {
        let shared = SharedData::new(None);
        assert!(shared.min_load_loop().is_err());
    }

    #[test]
    fn min_load_loop_prefers_the_lighter_loop() {
        let shared = SharedData::new(None);
        let light = Arc::new(EventLoop::new().expect("event loop"));
        let busy = Arc::new(EventLoop::new().expect("event loop"));
        shared.push_worker_loop(&busy);
        shared.push_worker_loop(&light);

        let (_rd, wr) = crate::io::pipe().expect("pipe");
        let iop: Arc<dyn IoObject> = wr;
        busy.register(
            &iop,
            FdEvent::WRITABLE,
            Arc::new(|_| Ok(())),
            crate::Priority::P0,
        )
        .expect("register");

        let picked = shared.min_load_loop().expect("pick");
        assert!(Arc::ptr_eq(&picked, &light));
    }

    #[test]
    fn callbacks_default_to_idle() {
        let shared = SharedData::new(None);
        let sock = crate::io::tcp_socket(crate::Family::Ipv4).expect("socket");
        (shared.on_accept())(&sock);
        (shared.on_closed())(&sock);
    }
}
