//! fd ownership, socket variants, and the io factory.
//!
//! The building block is [`Io`]: an owned file descriptor plus one read
//! and one write [`Buffer`] and the bookkeeping flags every pollable
//! object needs. The concrete variants are:
//!
//! | Type | Backed by | Capabilities |
//! |------|-----------|--------------|
//! | [`Stream`] | pipe / fifo end | byte-stream reads and writes |
//! | [`TcpSocket`] | TCP socket | streams plus listen/connect/accept |
//! | [`UdpSocket`] | UDP socket | whole-datagram send/recv |
//!
//! Capabilities are expressed as traits rather than inheritance:
//! [`IoObject`] is the common denominator the event loop works with,
//! [`StreamIo`] adds chunked non-blocking reads and writes, and
//! [`SocketIo`] adds binding and the socket option surface.
//!
//! Everything produced by the factory functions is non-blocking from
//! birth. Closing is idempotent and happens automatically on drop.

mod addr;
mod sockopt;
mod stream;
pub(crate) mod sys;
mod tcp;
mod udp;

pub use addr::{Endpoint, Family};
pub use stream::{Stream, StreamIo, StreamState};
pub use tcp::{ConnectStart, ShutdownMode, TcpSocket};
pub use udp::UdpSocket;

use crate::buffer::Buffer;
use crate::config;
use crate::error::{Error, Result};
use crate::event_loop::EventLoop;
use parking_lot::{Mutex, MutexGuard};
use std::any::Any;
use std::ffi::CString;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

/// An owned file descriptor with read/write buffers and lifecycle flags.
///
/// `Io` is shared between the event loop that dispatches its events and
/// any user code holding a handle from a callback; buffers are therefore
/// behind their own locks, and only handlers running on the owning loop
/// should mutate them.
pub struct Io {
    fd: RawFd,
    blocking: AtomicBool,
    closed: AtomicBool,
    rbuf: Mutex<Buffer>,
    wbuf: Mutex<Buffer>,
    evlp: Mutex<Weak<EventLoop>>,
}

impl Io {
    /// Takes ownership of `fd` and switches it to non-blocking mode.
    /// The fd is closed if that fails.
    pub(crate) fn from_fd(fd: RawFd) -> Result<Self> {
        if let Err(e) = sys::set_nonblocking(fd, true) {
            sys::close(fd);
            return Err(e);
        }
        Ok(Self {
            fd,
            blocking: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            rbuf: Mutex::new(Buffer::new()),
            wbuf: Mutex::new(Buffer::new()),
            evlp: Mutex::new(Weak::new()),
        })
    }

    /// The raw file descriptor.
    #[must_use]
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    /// Locks and returns the read buffer.
    pub fn rbuffer(&self) -> MutexGuard<'_, Buffer> {
        self.rbuf.lock()
    }

    /// Locks and returns the write buffer.
    pub fn wbuffer(&self) -> MutexGuard<'_, Buffer> {
        self.wbuf.lock()
    }

    /// Returns true once [`close`] has run.
    ///
    /// [`close`]: Io::close
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Releases the fd. Idempotent; later calls are no-ops.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            sys::close(self.fd);
        }
    }

    /// Returns true if the fd is in blocking mode.
    #[must_use]
    pub fn is_blocking(&self) -> bool {
        self.blocking.load(Ordering::SeqCst)
    }

    /// Switches the fd to non-blocking mode.
    pub fn set_nonblocking(&self) -> Result<()> {
        sys::set_nonblocking(self.fd, true)?;
        self.blocking.store(false, Ordering::SeqCst);
        Ok(())
    }

    /// Switches the fd to blocking mode.
    pub fn set_blocking(&self) -> Result<()> {
        sys::set_nonblocking(self.fd, false)?;
        self.blocking.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// The event loop currently dispatching this fd, if any.
    #[must_use]
    pub fn event_loop(&self) -> Option<Arc<EventLoop>> {
        self.evlp.lock().upgrade()
    }

    pub(crate) fn attach_loop(&self, evlp: &Arc<EventLoop>) {
        *self.evlp.lock() = Arc::downgrade(evlp);
    }

    pub(crate) fn detach_loop(&self) {
        *self.evlp.lock() = Weak::new();
    }
}

impl Drop for Io {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for Io {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Io")
            .field("fd", &self.fd)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

/// Common denominator of every pollable object.
///
/// The event loop stores handles as `Arc<dyn IoObject>`; concrete types
/// are recovered with [`as_any`] plus a downcast.
///
/// [`as_any`]: IoObject::as_any
pub trait IoObject: Any + Send + Sync {
    /// The underlying fd bundle.
    fn io(&self) -> &Io;

    /// Upcast for downcasting back to the concrete socket type.
    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

/// Binding and socket options, shared by TCP and UDP sockets.
pub trait SocketIo: IoObject {
    /// The address family the socket was created with.
    fn family(&self) -> Family;

    /// Sets `SO_REUSEADDR`.
    fn set_reuse_address(&self, on: bool) -> Result<()> {
        sockopt::set_flag(self.io().fd(), libc::SOL_SOCKET, libc::SO_REUSEADDR, on, "SO_REUSEADDR")
    }

    /// Reads `SO_REUSEADDR`.
    fn reuse_address(&self) -> Result<bool> {
        sockopt::get_flag(self.io().fd(), libc::SOL_SOCKET, libc::SO_REUSEADDR, "SO_REUSEADDR")
    }

    /// Sets `SO_REUSEPORT`.
    fn set_reuse_port(&self, on: bool) -> Result<()> {
        sockopt::set_flag(self.io().fd(), libc::SOL_SOCKET, libc::SO_REUSEPORT, on, "SO_REUSEPORT")
    }

    /// Reads `SO_REUSEPORT`.
    fn reuse_port(&self) -> Result<bool> {
        sockopt::get_flag(self.io().fd(), libc::SOL_SOCKET, libc::SO_REUSEPORT, "SO_REUSEPORT")
    }

    /// Sets `SO_RCVBUF`. The kernel may round the effective size up; on
    /// Linux it doubles the requested value.
    fn set_recv_buffer_size(&self, bytes: i32) -> Result<()> {
        sockopt::set(self.io().fd(), libc::SOL_SOCKET, libc::SO_RCVBUF, &bytes, "SO_RCVBUF")
    }

    /// Reads `SO_RCVBUF`.
    fn recv_buffer_size(&self) -> Result<i32> {
        sockopt::get(self.io().fd(), libc::SOL_SOCKET, libc::SO_RCVBUF, "SO_RCVBUF")
    }

    /// Sets `SO_SNDBUF`. Same kernel rounding as the receive side.
    fn set_send_buffer_size(&self, bytes: i32) -> Result<()> {
        sockopt::set(self.io().fd(), libc::SOL_SOCKET, libc::SO_SNDBUF, &bytes, "SO_SNDBUF")
    }

    /// Reads `SO_SNDBUF`.
    fn send_buffer_size(&self) -> Result<i32> {
        sockopt::get(self.io().fd(), libc::SOL_SOCKET, libc::SO_SNDBUF, "SO_SNDBUF")
    }

    /// Sets `SO_RCVLOWAT`, the readable-readiness low-water mark.
    fn set_recv_lowat(&self, bytes: i32) -> Result<()> {
        sockopt::set(self.io().fd(), libc::SOL_SOCKET, libc::SO_RCVLOWAT, &bytes, "SO_RCVLOWAT")
    }

    /// Reads `SO_RCVLOWAT`.
    fn recv_lowat(&self) -> Result<i32> {
        sockopt::get(self.io().fd(), libc::SOL_SOCKET, libc::SO_RCVLOWAT, "SO_RCVLOWAT")
    }

    /// Sets `SO_SNDLOWAT`. Some kernels accept the call without honoring
    /// the value.
    fn set_send_lowat(&self, bytes: i32) -> Result<()> {
        sockopt::set(self.io().fd(), libc::SOL_SOCKET, libc::SO_SNDLOWAT, &bytes, "SO_SNDLOWAT")
    }

    /// Reads `SO_SNDLOWAT`.
    fn send_lowat(&self) -> Result<i32> {
        sockopt::get(self.io().fd(), libc::SOL_SOCKET, libc::SO_SNDLOWAT, "SO_SNDLOWAT")
    }

    /// Reads and clears `SO_ERROR`.
    fn so_error(&self) -> Result<i32> {
        sockopt::get(self.io().fd(), libc::SOL_SOCKET, libc::SO_ERROR, "SO_ERROR")
    }
}

pub(crate) fn bind_inet(fd: RawFd, family: Family, ip: Option<&str>, port: u16) -> Result<()> {
    // A restarted listener must not wait out TIME_WAIT.
    sockopt::set_flag(fd, libc::SOL_SOCKET, libc::SO_REUSEADDR, true, "SO_REUSEADDR")?;
    let (storage, len) = addr::inet_addr(family, ip, port)?;
    let ret = unsafe { libc::bind(fd, std::ptr::addr_of!(storage).cast(), len) };
    if ret < 0 {
        return Err(Error::system(format!("bind port {port}")));
    }
    Ok(())
}

pub(crate) fn bind_unix(fd: RawFd, path: &str, remove: bool) -> Result<()> {
    if remove {
        if let Ok(cpath) = CString::new(path) {
            unsafe { libc::unlink(cpath.as_ptr()) };
        }
    }
    let (storage, len) = addr::unix_addr(path)?;
    let ret = unsafe { libc::bind(fd, std::ptr::addr_of!(storage).cast(), len) };
    if ret < 0 {
        return Err(Error::system(format!("bind {path}")));
    }
    Ok(())
}

/// Creates a non-blocking TCP socket of the given family.
pub fn tcp_socket(family: Family) -> Result<Arc<TcpSocket>> {
    let fd = sys::socket(family.af(), libc::SOCK_STREAM)?;
    Ok(Arc::new(TcpSocket::from_fd(fd, family)?))
}

/// Creates a non-blocking UDP socket of the given family.
///
/// Both buffers are pre-sized to [`config::udp_buffer_size`]; an
/// undersized receive buffer would silently truncate datagrams.
pub fn udp_socket(family: Family) -> Result<Arc<UdpSocket>> {
    let fd = sys::socket(family.af(), libc::SOCK_DGRAM)?;
    let sock = UdpSocket::from_fd(fd, family)?;
    sock.io().rbuffer().reserve_to(config::udp_buffer_size());
    sock.io().wbuffer().reserve_to(config::udp_buffer_size());
    Ok(Arc::new(sock))
}

/// Creates a pipe and returns `(read end, write end)`.
pub fn pipe() -> Result<(Arc<Stream>, Arc<Stream>)> {
    let (rd, wr) = sys::pipe()?;
    let rd = match Stream::from_fd(rd) {
        Ok(stream) => stream,
        Err(e) => {
            sys::close(wr);
            return Err(e);
        }
    };
    let wr = Stream::from_fd(wr)?;
    Ok((Arc::new(rd), Arc::new(wr)))
}

/// Opens (creating if needed) a fifo at `path` and returns
/// `(read end, write end)`.
pub fn fifo(path: &str) -> Result<(Arc<Stream>, Arc<Stream>)> {
    let (rd, wr) = sys::fifo(path)?;
    let rd = match Stream::from_fd(rd) {
        Ok(stream) => stream,
        Err(e) => {
            sys::close(wr);
            return Err(e);
        }
    };
    let wr = Stream::from_fd(wr)?;
    Ok((Arc::new(rd), Arc::new(wr)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn factory_sockets_are_nonblocking() {
        let sock = tcp_socket(Family::Ipv4).expect("tcp socket");
        assert!(!sock.io().is_blocking());
        let flags = unsafe { libc::fcntl(sock.io().fd(), libc::F_GETFL) };
        assert_ne!(flags & libc::O_NONBLOCK, 0);
    }

    #[test]
    fn close_is_idempotent() {
        let sock = tcp_socket(Family::Ipv4).expect("tcp socket");
        assert!(!sock.io().is_closed());
        sock.io().close();
        assert!(sock.io().is_closed());
        sock.io().close();
        assert!(sock.io().is_closed());
    }

    #[test]
    fn udp_buffers_are_presized() {
        let sock = udp_socket(Family::Ipv4).expect("udp socket");
        assert!(sock.io().rbuffer().capacity() >= crate::config::udp_buffer_size());
        assert!(sock.io().wbuffer().capacity() >= crate::config::udp_buffer_size());
    }

    #[test]
    fn buffer_sizes_round_trip_with_kernel_doubling() {
        let sock = tcp_socket(Family::Ipv4).expect("tcp socket");
        sock.set_recv_buffer_size(65536).expect("set rcvbuf");
        let got = sock.recv_buffer_size().expect("get rcvbuf");
        assert!(got == 65536 || got == 131_072, "unexpected SO_RCVBUF {got}");
    }

    #[test]
    fn reuse_address_round_trip() {
        let sock = tcp_socket(Family::Ipv4).expect("tcp socket");
        sock.set_reuse_address(true).expect("set");
        assert!(sock.reuse_address().expect("get"));
    }
}
