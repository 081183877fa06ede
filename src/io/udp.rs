//! UDP sockets: whole-datagram send and receive.

use super::addr::{self, Endpoint, Family};
use super::{sockopt, Io, IoObject, SocketIo};
use crate::config;
use crate::error::{Error, Result};
use parking_lot::Mutex;
use std::any::Any;
use std::mem;
use std::sync::Arc;

/// A UDP socket over IPv4, IPv6, or a unix-domain path.
///
/// Datagrams transfer in one syscall; there is no partial send or receive.
/// A datagram larger than the spare room in the read buffer would be
/// truncated by the kernel, which is why the factory pre-sizes both
/// buffers to [`config::udp_buffer_size`].
pub struct UdpSocket {
    io: Io,
    family: Family,
    unix_path: Mutex<Option<String>>,
}

impl UdpSocket {
    pub(crate) fn from_fd(fd: std::os::fd::RawFd, family: Family) -> Result<Self> {
        Ok(Self {
            io: Io::from_fd(fd)?,
            family,
            unix_path: Mutex::new(None),
        })
    }

    /// Binds to `ip` (the any-address when `None`) and `port`.
    pub fn bind(&self, ip: Option<&str>, port: u16) -> Result<()> {
        super::bind_inet(self.io.fd(), self.family, ip, port)
    }

    /// Binds to a unix-domain `path`, optionally unlinking a stale one.
    pub fn bind_unix(&self, path: &str, remove: bool) -> Result<()> {
        super::bind_unix(self.io.fd(), path, remove)?;
        *self.unix_path.lock() = Some(path.to_string());
        Ok(())
    }

    /// Receives one datagram into the read buffer.
    ///
    /// Returns the byte count and sender, or `None` when no datagram is
    /// waiting. Unix-domain sockets report the local path; datagram
    /// senders there are usually unbound.
    pub fn recv(&self) -> Result<Option<(usize, Endpoint)>> {
        let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
        let mut addr_len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        let mut buf = self.io.rbuffer();
        let want = config::udp_buffer_size();
        let spare = buf.spare_window(want);
        let n = unsafe {
            libc::recvfrom(
                self.io.fd(),
                spare.as_mut_ptr().cast(),
                want,
                0,
                std::ptr::addr_of_mut!(storage).cast(),
                &mut addr_len,
            )
        };
        if n < 0 {
            let err = std::io::Error::last_os_error();
            let errno = err.raw_os_error().unwrap_or(0);
            if errno == libc::EAGAIN || errno == libc::EWOULDBLOCK {
                return Ok(None);
            }
            return Err(Error::system_io(format!("recvfrom fd {}", self.io.fd()), err));
        }
        buf.advance_end(n as usize);
        drop(buf);

        let peer = if self.family == Family::Local {
            Endpoint::Local(self.unix_path.lock().clone().unwrap_or_default().into())
        } else {
            addr::parse_addr(&storage)?
        };
        Ok(Some((n as usize, peer)))
    }

    /// Sends the write buffer's contents to `ip:port` as one datagram.
    /// Returns the byte count, zero when the kernel buffer was full.
    pub fn send(&self, ip: &str, port: u16) -> Result<usize> {
        let (storage, len) = addr::inet_addr(self.family, Some(ip), port)?;
        self.send_to(&storage, len)
    }

    /// Sends the write buffer's contents to a unix-domain `path`.
    pub fn send_unix(&self, path: &str) -> Result<usize> {
        let (storage, len) = addr::unix_addr(path)?;
        self.send_to(&storage, len)
    }

    fn send_to(&self, storage: &libc::sockaddr_storage, addr_len: libc::socklen_t) -> Result<usize> {
        let mut buf = self.io.wbuffer();
        let n = unsafe {
            libc::sendto(
                self.io.fd(),
                buf.as_slice().as_ptr().cast(),
                buf.size(),
                0,
                std::ptr::addr_of!(*storage).cast(),
                addr_len,
            )
        };
        if n < 0 {
            let err = std::io::Error::last_os_error();
            let errno = err.raw_os_error().unwrap_or(0);
            if errno == libc::EAGAIN || errno == libc::EWOULDBLOCK {
                return Ok(0);
            }
            return Err(Error::system_io(format!("sendto fd {}", self.io.fd()), err));
        }
        buf.consume(n as usize);
        Ok(n as usize)
    }

    /// Sets `SO_BROADCAST`.
    pub fn set_broadcast(&self, on: bool) -> Result<()> {
        sockopt::set_flag(self.io.fd(), libc::SOL_SOCKET, libc::SO_BROADCAST, on, "SO_BROADCAST")
    }

    /// Reads `SO_BROADCAST`.
    pub fn broadcast(&self) -> Result<bool> {
        sockopt::get_flag(self.io.fd(), libc::SOL_SOCKET, libc::SO_BROADCAST, "SO_BROADCAST")
    }
}

impl IoObject for UdpSocket {
    fn io(&self) -> &Io {
        &self.io
    }

    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

impl SocketIo for UdpSocket {
    fn family(&self) -> Family {
        self.family
    }
}

impl std::fmt::Debug for UdpSocket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UdpSocket")
            .field("fd", &self.io.fd())
            .field("family", &self.family)
            .finish_non_exhaustive()
    }
}
