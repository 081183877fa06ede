//! Public TCP client composition.

use super::connector::{Connector, Host};
use super::worker::Worker;
use super::{SharedData, TcpEventHandler};
use crate::error::Result;
use crate::io::Family;
use crate::signal;
use crate::util::Rng;
use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

/// A multi-threaded TCP client: N worker threads plus K connector
/// threads consuming a queue of connect targets.
///
/// Targets may be added before or after [`run`]; each `add` wakes a
/// connector, which performs the connect syscalls on its own thread and
/// hands established connections to the least-loaded worker.
///
/// [`run`]: TcpClient::run
pub struct TcpClient {
    shared: Arc<SharedData>,
    workers: Vec<Worker>,
    connectors: Vec<Connector>,
    rng: parking_lot::Mutex<Rng>,
}

impl TcpClient {
    /// Creates a client with `worker_count` I/O threads and
    /// `connector_count` connect threads (minimum one of each).
    pub fn new(
        worker_count: usize,
        connector_count: usize,
        external: Option<Arc<dyn Any + Send + Sync>>,
    ) -> Result<Self> {
        let shared = Arc::new(SharedData::new(external));
        let mut workers = Vec::with_capacity(worker_count.max(1));
        for _ in 0..worker_count.max(1) {
            let worker = Worker::new(shared.clone())?;
            shared.push_worker_loop(worker.evlp());
            workers.push(worker);
        }
        let mut connectors = Vec::with_capacity(connector_count.max(1));
        for _ in 0..connector_count.max(1) {
            connectors.push(Connector::new(shared.clone())?);
        }
        Ok(Self {
            shared,
            workers,
            connectors,
            rng: parking_lot::Mutex::new(Rng::seeded()),
        })
    }

    /// Sets the callback run when a connection establishes.
    pub fn set_on_connect(&self, handler: TcpEventHandler) {
        self.shared.set_on_connect(handler);
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

    /// Queues `count` connects to `ip:port`, spread evenly across the
    /// connectors; the remainder goes to one picked at random.
    pub fn add(&self, ip: &str, port: u16, family: Family, count: u32) {
        let connectors = self.connectors.len() as u32;
        let each = count / connectors;
        let remainder = count % connectors;
        for connector in &self.connectors {
            connector.add(ip, port, family, each);
        }
        if remainder > 0 {
            let pick = self.rng.lock().next_usize(self.connectors.len());
            if let Some(connector) = self.connectors.get(pick) {
                connector.add(ip, port, family, remainder);
            }
        }
    }

    /// Queues `count` connects to a unix-domain `path`.
    pub fn add_unix(&self, path: &str, count: u32) {
        self.add(path, 0, Family::Local, count);
    }

    /// Per-target failure counters, merged across connectors. A failure
    /// is a connect syscall error or a failed `SO_ERROR` check; targets
    /// that never failed do not appear.
    #[must_use]
    pub fn failures(&self) -> HashMap<Host, u32> {
        let mut merged: HashMap<Host, u32> = HashMap::new();
        for connector in &self.connectors {
            for (host, count) in connector.failures() {
                *merged.entry(host).or_insert(0) += count;
            }
        }
        merged
    }

    /// Starts all threads. Ignores `SIGPIPE` process-wide first.
    pub fn run(&mut self) -> Result<()> {
        signal::ignore_signal(libc::SIGPIPE)?;
        for worker in &mut self.workers {
            worker.run()?;
        }
        for connector in &mut self.connectors {
            connector.run()?;
        }
        Ok(())
    }

    /// Stops and joins every thread, connectors before workers. Each loop
    /// gets the configured stop timeout and is joined even if it misses
    /// it.
    pub fn shutdown(&mut self) {
        for connector in &self.connectors {
            connector.shutdown();
        }
        for connector in &mut self.connectors {
            connector.join();
        }
        for worker in &self.workers {
            worker.shutdown();
        }
        for worker in &mut self.workers {
            worker.join();
        }
    }
}

impl std::fmt::Debug for TcpClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpClient")
            .field("workers", &self.workers.len())
            .field("connectors", &self.connectors.len())
            .finish()
    }
}
