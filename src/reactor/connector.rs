//! Connector threads: queued connect targets and completion checking.
//!
//! Connect syscalls run on a dedicated thread so they never contend with
//! worker I/O. Targets are queued in a map under a mutex; a self-pipe
//! wakes the connector's loop when the queue changes, which works the
//! same under level and edge triggering and needs no timer.

use super::worker::{establish_handler, InitChecker};
use super::SharedData;
use crate::config;
use crate::error::{Error, Result};
use crate::event_loop::{EventHandler, EventLoop, Priority};
use crate::io::{self, ConnectStart, Family, IoObject, SocketIo, Stream, StreamIo};
use crate::poller::FdEvent;
use crate::runnable::Runnable;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{error, info, warn};

/// A connect target: address (or unix path), port, and family.
///
/// Unix-domain targets carry the path in `addr` and a port of zero.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Host {
    /// IP address text, or the unix socket path.
    pub addr: String,
    /// TCP port; zero for unix-domain targets.
    pub port: u16,
    /// Address family.
    pub family: Family,
}

impl std::fmt::Display for Host {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.family {
            Family::Local => write!(f, "{}", self.addr),
            Family::Ipv4 | Family::Ipv6 => write!(f, "{}:{}", self.addr, self.port),
        }
    }
}

pub(crate) struct ConnectorState {
    pending: Mutex<HashMap<Host, u32>>,
    failures: Mutex<HashMap<Host, u32>>,
    wake_wr: Arc<Stream>,
    wake_rd: Arc<Stream>,
}

struct ConnectorCtx {
    shared: Arc<SharedData>,
    state: Arc<ConnectorState>,
}

pub(crate) struct Connector {
    evlp: Arc<EventLoop>,
    state: Arc<ConnectorState>,
    thread: Option<Runnable>,
}

impl Connector {
    pub(crate) fn new(shared: Arc<SharedData>) -> Result<Self> {
        let (wake_rd, wake_wr) = io::pipe()?;
        let state = Arc::new(ConnectorState {
            pending: Mutex::new(HashMap::new()),
            failures: Mutex::new(HashMap::new()),
            wake_wr,
            wake_rd,
        });
        let ctx = Arc::new(ConnectorCtx {
            shared,
            state: state.clone(),
        });
        Ok(Self {
            evlp: Arc::new(EventLoop::with_context(ctx)?),
            state,
            thread: None,
        })
    }

    /// Queues `count` connects to a target and wakes the connector.
    /// Thread-safe; works before or after the thread starts.
    pub(crate) fn add(&self, addr: &str, port: u16, family: Family, count: u32) {
        if count == 0 {
            return;
        }
        {
            let mut pending = self.state.pending.lock();
            *pending
                .entry(Host {
                    addr: addr.to_string(),
                    port,
                    family,
                })
                .or_insert(0) += count;
        }
        self.state.wake_wr.io().wbuffer().put_slice(b"0");
        if let Err(e) = self.state.wake_wr.write_all(1) {
            error!(fd = self.state.wake_wr.io().fd(), error = %e, "connector wake failed");
        }
    }

    /// Snapshot of the per-target failure counters.
    pub(crate) fn failures(&self) -> HashMap<Host, u32> {
        self.state.failures.lock().clone()
    }

    pub(crate) fn run(&mut self) -> Result<()> {
        let evlp = self.evlp.clone();
        let wake_rd = self.state.wake_rd.clone();
        self.thread = Some(Runnable::spawn("connector", move || {
            info!("connector thread starting");
            let outcome = (|| -> Result<()> {
                let iop: Arc<dyn IoObject> = wake_rd;
                evlp.register_and_activate(&iop, FdEvent::READABLE, pipe_handler(), Priority::P0)?;
                evlp.loop_forever(None)
            })();
            if let Err(e) = outcome {
                error!(error = %e, "connector failed");
            }
            info!("connector thread ending");
        })?);
        Ok(())
    }

    pub(crate) fn shutdown(&self) {
        match self.evlp.stop_loop_timeout(config::reactor_shutdown_timeout()) {
            Ok(true) => {}
            Ok(false) => warn!("connector shutdown wait timed out"),
            Err(e) => warn!(error = %e, "connector stop failed"),
        }
    }

    pub(crate) fn join(&mut self) {
        if let Some(mut thread) = self.thread.take() {
            thread.join();
        }
    }
}

fn record_failure(state: &ConnectorState, host: &Host) {
    *state.failures.lock().entry(host.clone()).or_insert(0) += 1;
}

/// Handler for the wake pipe: drain it, swap out the pending map, and
/// start every queued connect.
fn pipe_handler() -> EventHandler {
    Arc::new(|iop| {
        let evlp = iop
            .io()
            .event_loop()
            .ok_or_else(|| Error::logic("wake pipe without an owning loop"))?;
        let ctx = evlp
            .context::<ConnectorCtx>()
            .ok_or_else(|| Error::logic("connector loop carries no context"))?;

        let pipe = iop
            .clone()
            .as_any()
            .downcast::<Stream>()
            .map_err(|_| Error::logic("expected the wake pipe"))?;
        if let Err(e) = pipe.read_all(1) {
            error!(fd = pipe.io().fd(), error = %e, "draining wake pipe failed");
        }

        let batch = std::mem::take(&mut *ctx.state.pending.lock());
        for (host, count) in batch {
            for _ in 0..count {
                start_connect(&ctx, &host);
            }
        }
        Ok(())
    })
}

fn start_connect(ctx: &Arc<ConnectorCtx>, host: &Host) {
    let sock = match io::tcp_socket(host.family) {
        Ok(sock) => sock,
        Err(e) => {
            error!(host = %host, error = %e, "socket creation failed");
            record_failure(&ctx.state, host);
            return;
        }
    };

    let start = if host.family == Family::Local {
        sock.connect_unix(&host.addr)
    } else {
        sock.connect(&host.addr, host.port)
    };
    let start = match start {
        Ok(start) => start,
        Err(e) => {
            warn!(host = %host, error = %e, "connect failed");
            record_failure(&ctx.state, host);
            return;
        }
    };

    match start {
        ConnectStart::Immediate | ConnectStart::InProgress => {
            let checker = connect_checker(ctx.state.clone());
            let dispatch = (|| -> Result<()> {
                let target = ctx.shared.min_load_loop()?;
                let iop: Arc<dyn IoObject> = sock.clone();
                target.register_and_activate(
                    &iop,
                    FdEvent::WRITABLE,
                    establish_handler(checker, ctx.shared.on_connect()),
                    Priority::P0,
                )
            })();
            if let Err(e) = dispatch {
                warn!(host = %host, error = %e, "dispatch to worker failed");
                record_failure(&ctx.state, host);
                sock.io().close();
            }
        }
        ConnectStart::Failed(errno) => {
            record_failure(&ctx.state, host);
            warn!(
                host = %host,
                error = %std::io::Error::from_raw_os_error(errno),
                "connect failed"
            );
        }
    }
}

/// Checker bound into the establishment handler for connecting sockets:
/// reads `SO_ERROR` and, on asynchronous failure, records it and closes.
fn connect_checker(state: Arc<ConnectorState>) -> InitChecker {
    Arc::new(move |sock| {
        let ok = sock.check_connect().unwrap_or(false);
        if !ok {
            if let Some((addr, port)) = sock.target_uri() {
                let host = Host {
                    addr,
                    port,
                    family: sock.family(),
                };
                record_failure(&state, &host);
                warn!(host = %host, "connect failed at the writable check");
            }
            let iop: Arc<dyn IoObject> = sock.clone();
            if let Some(evlp) = sock.io().event_loop() {
                evlp.clean(&iop);
            }
            sock.io().close();
        }
        ok
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_display_formats() {
        let inet = Host {
            addr: "127.0.0.1".into(),
            port: 8884,
            family: Family::Ipv4,
        };
        assert_eq!(inet.to_string(), "127.0.0.1:8884");

        let local = Host {
            addr: "/tmp/a.sock".into(),
            port: 0,
            family: Family::Local,
        };
        assert_eq!(local.to_string(), "/tmp/a.sock");
    }

    #[test]
    fn add_accumulates_per_target() {
        let shared = Arc::new(SharedData::new(None));
        let connector = Connector::new(shared).expect("connector");
        connector.add("127.0.0.1", 9000, Family::Ipv4, 2);
        connector.add("127.0.0.1", 9000, Family::Ipv4, 3);
        connector.add("127.0.0.1", 9000, Family::Ipv4, 0);

        let pending = connector.state.pending.lock();
        assert_eq!(pending.len(), 1);
        let host = Host {
            addr: "127.0.0.1".into(),
            port: 9000,
            family: Family::Ipv4,
        };
        assert_eq!(pending.get(&host), Some(&5));
    }
}
