//! Worker threads and the standard connection handlers.
//!
//! One worker is one thread running one event loop. Established
//! connections live here: the readable and writable handlers drain the
//! socket, invoke the user callbacks, manage the buffers, and run the
//! close sequence when the peer goes away.

use super::{as_tcp, shared_of, SharedData, TcpEventHandler};
use crate::config;
use crate::error::{Error, Result};
use crate::event_loop::{EventHandler, EventLoop, Priority};
use crate::io::{IoObject, StreamIo, TcpSocket};
use crate::poller::FdEvent;
use crate::runnable::Runnable;
use std::sync::Arc;
use tracing::{error, info, warn};

/// Predicate run once when a connecting socket first turns writable.
pub(crate) type InitChecker = Arc<dyn Fn(&Arc<TcpSocket>) -> bool + Send + Sync>;

pub(crate) struct Worker {
    evlp: Arc<EventLoop>,
    thread: Option<Runnable>,
}

impl Worker {
    pub(crate) fn new(shared: Arc<SharedData>) -> Result<Self> {
        Ok(Self {
            evlp: Arc::new(EventLoop::with_context(shared)?),
            thread: None,
        })
    }

    pub(crate) fn evlp(&self) -> &Arc<EventLoop> {
        &self.evlp
    }

    pub(crate) fn run(&mut self) -> Result<()> {
        let evlp = self.evlp.clone();
        self.thread = Some(Runnable::spawn("worker", move || {
            info!("worker thread starting");
            if let Err(e) = evlp.loop_forever(None) {
                error!(error = %e, "worker loop failed");
            }
            info!("worker thread ending");
        })?);
        Ok(())
    }

    pub(crate) fn shutdown(&self) {
        match self.evlp.stop_loop_timeout(config::reactor_shutdown_timeout()) {
            Ok(true) => {}
            Ok(false) => warn!("worker shutdown wait timed out"),
            Err(e) => warn!(error = %e, "worker stop failed"),
        }
    }

    pub(crate) fn join(&mut self) {
        if let Some(mut thread) = self.thread.take() {
            thread.join();
        }
    }
}

fn close_if_peer_gone(sock: &Arc<TcpSocket>, iop: &Arc<dyn IoObject>) -> Result<()> {
    if (sock.is_eof() || sock.is_reset()) && !sock.io().is_closed() {
        let shared = shared_of(sock)?;
        (shared.on_closed())(sock);
        if let Some(evlp) = sock.io().event_loop() {
            evlp.clean(iop);
        }
        sock.io().close();
    }
    Ok(())
}

fn on_readable(iop: &Arc<dyn IoObject>) -> Result<()> {
    let sock = as_tcp(iop)?;
    let shared = shared_of(&sock)?;
    if let Err(e) = sock.read_all(config::buffer_io_step()) {
        error!(fd = sock.io().fd(), error = %e, "read failed");
    }
    (shared.on_read_complete())(&sock);
    {
        let mut rbuf = sock.io().rbuffer();
        if rbuf.is_empty() {
            rbuf.clear();
        } else if rbuf.capacity() / 2 < rbuf.waste() {
            rbuf.compact();
        }
    }
    close_if_peer_gone(&sock, iop)
}

fn on_writable(iop: &Arc<dyn IoObject>) -> Result<()> {
    let sock = as_tcp(iop)?;
    let shared = shared_of(&sock)?;
    if let Err(e) = sock.write_all(config::buffer_io_step()) {
        error!(fd = sock.io().fd(), error = %e, "write failed");
    }
    if sock.io().wbuffer().is_empty() {
        sock.io().wbuffer().clear();
        if let Some(evlp) = sock.io().event_loop() {
            evlp.deactivate(iop, FdEvent::WRITABLE)?;
        }
        (shared.on_write_complete())(&sock);
    } else {
        let mut wbuf = sock.io().wbuffer();
        if wbuf.capacity() / 2 < wbuf.waste() {
            wbuf.compact();
        }
    }
    close_if_peer_gone(&sock, iop)
}

pub(crate) fn readable_handler() -> EventHandler {
    Arc::new(on_readable)
}

pub(crate) fn writable_handler() -> EventHandler {
    Arc::new(on_writable)
}

/// Handler for the first writable event of a connecting socket.
///
/// Runs once: it removes itself, runs `checker` (accept side: always
/// true; connect side: the `SO_ERROR` probe), and on success wires up the
/// standard handlers around the user callback. The sequence is fixed:
/// writable is registered (inactive) before the callback so that
/// `async_write` from inside it can arm the event, and readable goes live
/// only afterwards.
pub(crate) fn establish_handler(checker: InitChecker, on_ready: TcpEventHandler) -> EventHandler {
    Arc::new(move |iop| {
        let sock = as_tcp(iop)?;
        let evlp = sock
            .io()
            .event_loop()
            .ok_or_else(|| Error::logic("connecting socket without an owning loop"))?;
        evlp.remove_and_deactivate(iop, FdEvent::WRITABLE)?;

        if !checker(&sock) {
            return Ok(());
        }

        evlp.register(iop, FdEvent::WRITABLE, writable_handler(), Priority::P0)?;
        on_ready(&sock);
        evlp.register_and_activate(iop, FdEvent::READABLE, readable_handler(), Priority::P0)?;
        info!(fd = sock.io().fd(), "connected socket initialized");
        Ok(())
    })
}
