//! Eventide: an event-driven TCP/UDP networking core.
//!
//! # Overview
//!
//! Eventide gives server and client code a small, uniform surface:
//! register socket interest, receive callbacks on I/O readiness, and move
//! bytes through owned buffers. Underneath, each thread runs one
//! [`EventLoop`] over the kernel's readiness mechanism; a
//! [`TcpServer`]/[`TcpClient`] composes N worker loops with M acceptor or
//! connector loops into a multi-threaded reactor.
//!
//! # Core pieces
//!
//! - [`Buffer`]: growable byte window with compaction, one per direction
//!   on every socket.
//! - [`Poller`]: add/modify/delete fd interest, wait for readiness.
//! - [`EventLoop`]: per-thread dispatcher mapping (fd, event) to
//!   priority-ordered handlers, with a thread-safe stop protocol.
//! - [`Stream`], [`TcpSocket`], [`UdpSocket`]: non-blocking I/O variants
//!   sharing the [`IoObject`] base; capabilities come from the
//!   [`StreamIo`] and [`SocketIo`] traits.
//! - [`TcpServer`] / [`TcpClient`]: the public reactor composition with
//!   five user callbacks and least-loaded connection dispatch.
//!
//! # Process-global expectations
//!
//! `run()` ignores `SIGPIPE` process-wide; a write to a vanished peer
//! surfaces as `EPIPE` on the socket instead of killing the process.
//! Applications that want a clean Ctrl-C shutdown block `SIGINT` on all
//! reactor threads (spawn after [`signal::thread_block_signal`], or block
//! it in `main` before `run`) and wait for it with
//! [`signal::thread_wait_for_signal`] before calling `shutdown()`.
//!
//! # Example
//!
//! ```no_run
//! use eventide::{async_write, safely_close, Family, IoObject, TcpServer};
//! use std::sync::Arc;
//!
//! let mut server = TcpServer::new(4, true, None)?;
//! server.set_on_read_complete(Arc::new(|sock| {
//!     // Echo whatever arrived.
//!     let payload = sock.io().rbuffer().get_bytes(None, true);
//!     sock.io().wbuffer().put_slice(&payload);
//!     async_write(sock);
//! }));
//! server.set_on_closed(Arc::new(|sock| safely_close(sock)));
//! server.listen(8884, Family::Ipv4, None)?;
//! // Block before run so every reactor thread inherits the mask.
//! eventide::signal::thread_block_signal(libc::SIGINT)?;
//! server.run()?;
//! eventide::signal::thread_wait_for_signal(libc::SIGINT)?;
//! server.shutdown();
//! # Ok::<(), eventide::Error>(())
//! ```

#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_possible_wrap)]
#![allow(clippy::cast_sign_loss)]

mod buffer;
pub mod config;
mod error;
mod event_loop;
pub mod io;
mod poller;
mod reactor;
mod runnable;
pub mod signal;
mod util;

pub use buffer::Buffer;
pub use error::{Error, ErrorKind, Result};
pub use event_loop::{EventHandler, EventLoop, Priority};
pub use io::{
    fifo, pipe, tcp_socket, udp_socket, ConnectStart, Endpoint, Family, Io, IoObject,
    ShutdownMode, SocketIo, Stream, StreamIo, StreamState, TcpSocket, UdpSocket,
};
pub use poller::{FdEvent, Poller, TriggerMode};
pub use reactor::{
    async_write, external_data, safely_close, Host, TcpClient, TcpEventHandler, TcpServer,
};
pub use runnable::Runnable;
