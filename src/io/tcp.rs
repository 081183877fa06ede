//! TCP sockets: listening, connecting, accepting, stream I/O.

use super::addr::{self, Endpoint, Family};
use super::stream::{StreamIo, StreamState};
use super::{sockopt, Io, IoObject, SocketIo};
use crate::error::{Error, Result};
use parking_lot::Mutex;
use std::any::Any;
use std::mem;
use std::sync::Arc;

/// Outcome of starting a connect on a non-blocking socket.
///
/// `Immediate` and `InProgress` both mean the attempt is under way; an
/// in-progress connect completes (or fails) later, signaled by the socket
/// becoming writable, at which point [`TcpSocket::check_connect`] reads
/// `SO_ERROR` to learn the outcome. `Failed` carries the errno from the
/// syscall and is a value, not an error: callers record it and move on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectStart {
    /// The connect completed synchronously.
    Immediate,
    /// The connect is in progress; watch for writable.
    InProgress,
    /// The syscall failed with the given errno.
    Failed(i32),
}

impl ConnectStart {
    /// True if the attempt is under way (immediately or asynchronously).
    #[must_use]
    pub const fn started(self) -> bool {
        matches!(self, ConnectStart::Immediate | ConnectStart::InProgress)
    }
}

/// Which direction of a connection to shut down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownMode {
    /// Close the read side.
    Read,
    /// Close the write side.
    Write,
    /// Close both sides.
    Both,
}

/// A TCP socket over IPv4, IPv6, or a unix-domain path.
pub struct TcpSocket {
    io: Io,
    family: Family,
    state: StreamState,
    unix_path: Mutex<Option<String>>,
    target: Mutex<Option<(String, u16)>>,
}

impl TcpSocket {
    pub(crate) fn from_fd(fd: std::os::fd::RawFd, family: Family) -> Result<Self> {
        Ok(Self {
            io: Io::from_fd(fd)?,
            family,
            state: StreamState::default(),
            unix_path: Mutex::new(None),
            target: Mutex::new(None),
        })
    }

    pub(crate) fn set_unix_path(&self, path: &str) {
        *self.unix_path.lock() = Some(path.to_string());
    }

    /// Binds to `ip` (the any-address when `None`) and `port`.
    pub fn bind(&self, ip: Option<&str>, port: u16) -> Result<()> {
        super::bind_inet(self.io.fd(), self.family, ip, port)
    }

    /// Binds to a unix-domain `path`, optionally unlinking a stale one.
    pub fn bind_unix(&self, path: &str, remove: bool) -> Result<()> {
        super::bind_unix(self.io.fd(), path, remove)?;
        self.set_unix_path(path);
        Ok(())
    }

    /// Starts listening with the given backlog.
    pub fn listen(&self, backlog: i32) -> Result<()> {
        if unsafe { libc::listen(self.io.fd(), backlog) } < 0 {
            return Err(Error::system(format!("listen fd {}", self.io.fd())));
        }
        Ok(())
    }

    /// Starts a connect to `ip:port`, recording the target.
    pub fn connect(&self, ip: &str, port: u16) -> Result<ConnectStart> {
        *self.target.lock() = Some((ip.to_string(), port));
        let (storage, len) = addr::inet_addr(self.family, Some(ip), port)?;
        Ok(self.start_connect(&storage, len))
    }

    /// Starts a connect to a unix-domain `path`, recording the target.
    pub fn connect_unix(&self, path: &str) -> Result<ConnectStart> {
        *self.target.lock() = Some((path.to_string(), 0));
        let (storage, len) = addr::unix_addr(path)?;
        Ok(self.start_connect(&storage, len))
    }

    fn start_connect(&self, storage: &libc::sockaddr_storage, len: libc::socklen_t) -> ConnectStart {
        let ret = unsafe { libc::connect(self.io.fd(), std::ptr::addr_of!(*storage).cast(), len) };
        if ret == 0 {
            return ConnectStart::Immediate;
        }
        let errno = std::io::Error::last_os_error().raw_os_error().unwrap_or(0);
        if errno == libc::EINPROGRESS {
            ConnectStart::InProgress
        } else {
            ConnectStart::Failed(errno)
        }
    }

    /// Accepts up to `batch` pending connections, stopping early when the
    /// backlog drains. Accepted sockets are non-blocking; unix-domain ones
    /// inherit the listener's path for introspection.
    pub fn accept(&self, batch: usize) -> Result<Vec<Arc<TcpSocket>>> {
        let mut conns = Vec::new();
        while conns.len() < batch {
            let fd = unsafe { libc::accept(self.io.fd(), std::ptr::null_mut(), std::ptr::null_mut()) };
            if fd < 0 {
                let err = std::io::Error::last_os_error();
                let errno = err.raw_os_error().unwrap_or(0);
                if errno == libc::EAGAIN || errno == libc::EWOULDBLOCK {
                    break;
                }
                if errno == libc::EINTR {
                    continue;
                }
                return Err(Error::system_io(format!("accept fd {}", self.io.fd()), err));
            }
            let conn = TcpSocket::from_fd(fd, self.family)?;
            if self.family == Family::Local {
                if let Some(path) = self.unix_path.lock().as_deref() {
                    conn.set_unix_path(path);
                }
            }
            conns.push(Arc::new(conn));
        }
        Ok(conns)
    }

    /// True when an in-progress connect completed without error.
    ///
    /// Reading `SO_ERROR` clears it in the kernel, so the answer is
    /// one-shot.
    pub fn check_connect(&self) -> Result<bool> {
        Ok(self.so_error()? == 0)
    }

    /// The (host, port) pair recorded at connect time. Unix targets report
    /// the path with port zero.
    #[must_use]
    pub fn target_uri(&self) -> Option<(String, u16)> {
        self.target.lock().clone()
    }

    /// The locally bound name.
    pub fn sockname(&self) -> Result<Endpoint> {
        if self.family == Family::Local {
            let path = self.unix_path.lock().clone().unwrap_or_default();
            return Ok(Endpoint::Local(path.into()));
        }
        let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
        let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        let ret = unsafe {
            libc::getsockname(self.io.fd(), std::ptr::addr_of_mut!(storage).cast(), &mut len)
        };
        if ret < 0 {
            return Err(Error::system(format!("getsockname fd {}", self.io.fd())));
        }
        addr::parse_addr(&storage)
    }

    /// The peer's name.
    pub fn peername(&self) -> Result<Endpoint> {
        if self.family == Family::Local {
            let path = self.unix_path.lock().clone().unwrap_or_default();
            return Ok(Endpoint::Local(path.into()));
        }
        let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
        let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        let ret = unsafe {
            libc::getpeername(self.io.fd(), std::ptr::addr_of_mut!(storage).cast(), &mut len)
        };
        if ret < 0 {
            return Err(Error::system(format!("getpeername fd {}", self.io.fd())));
        }
        addr::parse_addr(&storage)
    }

    /// Shuts down one or both directions. Best-effort; a socket that never
    /// connected reports no error.
    pub fn shutdown(&self, how: ShutdownMode) {
        let how = match how {
            ShutdownMode::Read => libc::SHUT_RD,
            ShutdownMode::Write => libc::SHUT_WR,
            ShutdownMode::Both => libc::SHUT_RDWR,
        };
        unsafe {
            libc::shutdown(self.io.fd(), how);
        }
    }

    /// Sets `SO_KEEPALIVE`.
    pub fn set_keepalive(&self, on: bool) -> Result<()> {
        sockopt::set_flag(self.io.fd(), libc::SOL_SOCKET, libc::SO_KEEPALIVE, on, "SO_KEEPALIVE")
    }

    /// Reads `SO_KEEPALIVE`.
    pub fn keepalive(&self) -> Result<bool> {
        sockopt::get_flag(self.io.fd(), libc::SOL_SOCKET, libc::SO_KEEPALIVE, "SO_KEEPALIVE")
    }

    /// Sets `SO_LINGER`. With `on` and zero seconds, close discards unsent
    /// data and resets the connection instead of the normal goodbye.
    pub fn set_linger(&self, on: bool, seconds: i32) -> Result<()> {
        let value = libc::linger {
            l_onoff: libc::c_int::from(on),
            l_linger: seconds,
        };
        sockopt::set(self.io.fd(), libc::SOL_SOCKET, libc::SO_LINGER, &value, "SO_LINGER")
    }

    /// Reads `SO_LINGER` as (enabled, seconds).
    pub fn linger(&self) -> Result<(bool, i32)> {
        let value: libc::linger =
            sockopt::get(self.io.fd(), libc::SOL_SOCKET, libc::SO_LINGER, "SO_LINGER")?;
        Ok((value.l_onoff != 0, value.l_linger))
    }

    /// Sets `TCP_NODELAY`.
    pub fn set_nodelay(&self, on: bool) -> Result<()> {
        sockopt::set_flag(self.io.fd(), libc::IPPROTO_TCP, libc::TCP_NODELAY, on, "TCP_NODELAY")
    }

    /// Reads `TCP_NODELAY`.
    pub fn nodelay(&self) -> Result<bool> {
        sockopt::get_flag(self.io.fd(), libc::IPPROTO_TCP, libc::TCP_NODELAY, "TCP_NODELAY")
    }
}

impl IoObject for TcpSocket {
    fn io(&self) -> &Io {
        &self.io
    }

    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

impl StreamIo for TcpSocket {
    fn stream_state(&self) -> &StreamState {
        &self.state
    }
}

impl SocketIo for TcpSocket {
    fn family(&self) -> Family {
        self.family
    }
}

impl std::fmt::Debug for TcpSocket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpSocket")
            .field("fd", &self.io.fd())
            .field("family", &self.family)
            .finish_non_exhaustive()
    }
}
