//! Acceptor threads: listening sockets and connection handoff.

use super::worker::{establish_handler, InitChecker};
use super::{as_tcp, shared_of, SharedData};
use crate::config;
use crate::error::Result;
use crate::event_loop::{EventHandler, EventLoop, Priority};
use crate::io::{self, Family, IoObject, SocketIo, TcpSocket};
use crate::poller::FdEvent;
use crate::runnable::Runnable;
use std::sync::Arc;
use tracing::{error, info, warn};

pub(crate) struct Acceptor {
    evlp: Arc<EventLoop>,
    listeners: Vec<Arc<TcpSocket>>,
    thread: Option<Runnable>,
}

impl Acceptor {
    pub(crate) fn new(shared: Arc<SharedData>) -> Result<Self> {
        Ok(Self {
            evlp: Arc::new(EventLoop::with_context(shared)?),
            listeners: Vec::new(),
            thread: None,
        })
    }

    /// Creates, binds, and starts a listening socket. Must run before the
    /// acceptor thread does.
    pub(crate) fn listen(&mut self, port: u16, family: Family, ip: Option<&str>) -> Result<()> {
        let sock = io::tcp_socket(family)?;
        sock.set_reuse_address(true)?;
        sock.bind(ip, port)?;
        sock.listen(libc::SOMAXCONN)?;
        info!(
            fd = sock.io().fd(),
            addr = ip.unwrap_or("*"),
            port,
            family = %family,
            "listening socket ready"
        );
        self.listeners.push(sock);
        Ok(())
    }

    /// Unix-domain counterpart of [`listen`], optionally unlinking a
    /// stale socket file first.
    ///
    /// [`listen`]: Acceptor::listen
    pub(crate) fn listen_unix(&mut self, path: &str, remove: bool) -> Result<()> {
        let sock = io::tcp_socket(Family::Local)?;
        sock.set_reuse_address(true)?;
        sock.bind_unix(path, remove)?;
        sock.listen(libc::SOMAXCONN)?;
        info!(fd = sock.io().fd(), path, "listening socket ready");
        self.listeners.push(sock);
        Ok(())
    }

    pub(crate) fn run(&mut self) -> Result<()> {
        let evlp = self.evlp.clone();
        let listeners = self.listeners.clone();
        self.thread = Some(Runnable::spawn("acceptor", move || {
            info!("acceptor thread starting");
            let outcome = (|| -> Result<()> {
                for listener in &listeners {
                    let iop: Arc<dyn IoObject> = listener.clone();
                    evlp.register_and_activate(
                        &iop,
                        FdEvent::READABLE,
                        accept_handler(),
                        Priority::P0,
                    )?;
                }
                evlp.loop_forever(None)
            })();
            if let Err(e) = outcome {
                error!(error = %e, "acceptor failed");
            }
            info!("acceptor thread ending");
        })?);
        Ok(())
    }

    pub(crate) fn shutdown(&self) {
        match self.evlp.stop_loop_timeout(config::reactor_shutdown_timeout()) {
            Ok(true) => {}
            Ok(false) => warn!("acceptor shutdown wait timed out"),
            Err(e) => warn!(error = %e, "acceptor stop failed"),
        }
    }

    pub(crate) fn join(&mut self) {
        if let Some(mut thread) = self.thread.take() {
            thread.join();
        }
    }
}

/// Handler for readable listening sockets: batch-accept, then hand each
/// new connection to the least-loaded worker for establishment.
fn accept_handler() -> EventHandler {
    Arc::new(|iop| {
        let listener = as_tcp(iop)?;
        let shared = shared_of(&listener)?;

        let conns = listener.accept(usize::MAX)?;

        for conn in conns {
            info!(
                listener = listener.io().fd(),
                fd = conn.io().fd(),
                "accepted new connection"
            );
            let checker: InitChecker = Arc::new(|_| true);
            let target = shared.min_load_loop()?;
            let iop: Arc<dyn IoObject> = conn;
            target.register_and_activate(
                &iop,
                FdEvent::WRITABLE,
                establish_handler(checker, shared.on_accept()),
                Priority::P0,
            )?;
        }
        Ok(())
    })
}
