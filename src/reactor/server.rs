//! Public TCP server composition.

use super::acceptor::Acceptor;
use super::worker::Worker;
use super::{SharedData, TcpEventHandler};
use crate::error::{Error, Result};
use crate::io::Family;
use crate::signal;
use std::any::Any;
use std::sync::Arc;

/// A multi-threaded TCP server: N worker threads plus one acceptor
/// thread per listener group.
///
/// Build order matters: construct, set callbacks, add listeners, then
/// [`run`]. Callbacks are treated as immutable once `run` begins.
/// Listener setup failures (port in use, bad family) surface from
/// [`listen`] before any thread starts, so the caller can react.
///
/// # Example
///
/// ```no_run
/// use eventide::{async_write, Family, IoObject, TcpServer};
/// use std::sync::Arc;
///
/// let mut server = TcpServer::new(4, true, None)?;
/// server.set_on_accept(Arc::new(|sock| {
///     sock.io().wbuffer().put_slice(b"welcome\n");
///     async_write(sock);
/// }));
/// server.set_on_read_complete(Arc::new(|sock| {
///     let payload = sock.io().rbuffer().get_bytes(None, true);
///     sock.io().wbuffer().put_slice(&payload);
///     async_write(sock);
/// }));
/// server.listen(8884, Family::Ipv4, None)?;
/// server.run()?;
/// # Ok::<(), eventide::Error>(())
/// ```
///
/// [`run`]: TcpServer::run
/// [`listen`]: TcpServer::listen
pub struct TcpServer {
    shared: Arc<SharedData>,
    workers: Vec<Worker>,
    acceptors: Vec<Acceptor>,
    single_acceptor: bool,
}

impl TcpServer {
    /// Creates a server with `worker_count` I/O threads (minimum one).
    ///
    /// With `single_acceptor` every listener shares one acceptor thread;
    /// otherwise each listener gets its own. `external` is user data
    /// retrievable from any callback via [`external_data`].
    ///
    /// [`external_data`]: super::external_data
    pub fn new(
        worker_count: usize,
        single_acceptor: bool,
        external: Option<Arc<dyn Any + Send + Sync>>,
    ) -> Result<Self> {
        let shared = Arc::new(SharedData::new(external));
        let mut workers = Vec::with_capacity(worker_count.max(1));
        for _ in 0..worker_count.max(1) {
            let worker = Worker::new(shared.clone())?;
            shared.push_worker_loop(worker.evlp());
            workers.push(worker);
        }
        Ok(Self {
            shared,
            workers,
            acceptors: Vec::new(),
            single_acceptor,
        })
    }

    /// Sets the callback run when a connection is accepted.
    pub fn set_on_accept(&self, handler: TcpEventHandler) {
        self.shared.set_on_accept(handler);
    }

    /// Sets the callback run after a read drains into the read buffer.
    pub fn set_on_read_complete(&self, handler: TcpEventHandler) {
        self.shared.set_on_read_complete(handler);
    }

    /// Sets the callback run when the write buffer fully drains.
    pub fn set_on_write_complete(&self, handler: TcpEventHandler) {
        self.shared.set_on_write_complete(handler);
    }

    /// Sets the callback run when the peer closes or resets.
    pub fn set_on_closed(&self, handler: TcpEventHandler) {
        self.shared.set_on_closed(handler);
    }

    /// Adds a listener on `port`. `ip` of `None` binds the any-address.
    /// Call before [`run`].
    ///
    /// [`run`]: TcpServer::run
    pub fn listen(&mut self, port: u16, family: Family, ip: Option<&str>) -> Result<()> {
        self.acceptor_for_next_listener()?.listen(port, family, ip)
    }

    /// Adds a unix-domain listener on `path`, optionally unlinking a
    /// stale socket file. Call before [`run`].
    ///
    /// [`run`]: TcpServer::run
    pub fn listen_unix(&mut self, path: &str, remove: bool) -> Result<()> {
        self.acceptor_for_next_listener()?.listen_unix(path, remove)
    }

    fn acceptor_for_next_listener(&mut self) -> Result<&mut Acceptor> {
        if !self.single_acceptor || self.acceptors.is_empty() {
            self.acceptors.push(Acceptor::new(self.shared.clone())?);
        }
        self.acceptors
            .last_mut()
            .ok_or_else(|| Error::logic("acceptor list empty after push"))
    }

    /// Starts all threads. Ignores `SIGPIPE` process-wide first; a write
    /// to a disconnected peer must surface as an errno, not a signal.
    pub fn run(&mut self) -> Result<()> {
        signal::ignore_signal(libc::SIGPIPE)?;
        for worker in &mut self.workers {
            worker.run()?;
        }
        for acceptor in &mut self.acceptors {
            acceptor.run()?;
        }
        Ok(())
    }

    /// Stops and joins every thread. Acceptors go first so no connection
    /// arrives mid-shutdown; each loop gets the configured stop timeout
    /// and is joined even if it misses it.
    pub fn shutdown(&mut self) {
        for acceptor in &self.acceptors {
            acceptor.shutdown();
        }
        for acceptor in &mut self.acceptors {
            acceptor.join();
        }
        for worker in &self.workers {
            worker.shutdown();
        }
        for worker in &mut self.workers {
            worker.join();
        }
    }
}

impl std::fmt::Debug for TcpServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpServer")
            .field("workers", &self.workers.len())
            .field("acceptors", &self.acceptors.len())
            .field("single_acceptor", &self.single_acceptor)
            .finish()
    }
}
