//! Thin libc wrappers for fd creation and mode control.
//!
//! All unsafe syscall plumbing for plain fds lives here; the rest of the
//! io layer works with the safe functions below.

use crate::error::{Error, Result};
use std::ffi::CString;
use std::os::fd::RawFd;

/// Creates a socket of the given address family and type.
pub fn socket(af: libc::c_int, ty: libc::c_int) -> Result<RawFd> {
    let fd = unsafe { libc::socket(af, ty, 0) };
    if fd < 0 {
        return Err(Error::system("socket"));
    }
    Ok(fd)
}

/// Creates a pipe and returns (read end, write end).
pub fn pipe() -> Result<(RawFd, RawFd)> {
    let mut fds = [0 as RawFd; 2];
    if unsafe { libc::pipe(fds.as_mut_ptr()) } != 0 {
        return Err(Error::system("pipe"));
    }
    Ok((fds[0], fds[1]))
}

/// Creates a fifo at `path` (if missing) and opens both ends non-blocking.
///
/// The write end is opened and held even by pure readers. While it stays
/// open the fifo never reports end of file to the read end, only "no data
/// yet", which keeps an event loop registration stable across writer
/// restarts.
pub fn fifo(path: &str) -> Result<(RawFd, RawFd)> {
    let cpath = CString::new(path).map_err(|_| Error::logic("fifo path contains NUL"))?;
    let ret = unsafe { libc::mkfifo(cpath.as_ptr(), libc::S_IRWXU) };
    if ret != 0 {
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::EEXIST) {
            return Err(Error::system_io(format!("mkfifo {path}"), err));
        }
    }

    let rd = unsafe { libc::open(cpath.as_ptr(), libc::O_RDONLY | libc::O_NONBLOCK) };
    if rd < 0 {
        return Err(Error::system(format!("open fifo {path} for read")));
    }
    let wr = unsafe { libc::open(cpath.as_ptr(), libc::O_WRONLY | libc::O_NONBLOCK) };
    if wr < 0 {
        let err = std::io::Error::last_os_error();
        unsafe { libc::close(rd) };
        return Err(Error::system_io(format!("open fifo {path} for write"), err));
    }
    Ok((rd, wr))
}

/// Sets or clears `O_NONBLOCK` on `fd`.
pub fn set_nonblocking(fd: RawFd, nonblocking: bool) -> Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(Error::system(format!("fcntl F_GETFL fd {fd}")));
    }
    let flags = if nonblocking {
        flags | libc::O_NONBLOCK
    } else {
        flags & !libc::O_NONBLOCK
    };
    if unsafe { libc::fcntl(fd, libc::F_SETFL, flags) } < 0 {
        return Err(Error::system(format!("fcntl F_SETFL fd {fd}")));
    }
    Ok(())
}

/// Closes `fd`, ignoring errors.
pub fn close(fd: RawFd) {
    unsafe {
        libc::close(fd);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pipe_round_trip() {
        let (rd, wr) = pipe().expect("pipe");
        let msg = b"ping";
        let n = unsafe { libc::write(wr, msg.as_ptr().cast(), msg.len()) };
        assert_eq!(n, 4);
        let mut buf = [0u8; 8];
        let n = unsafe { libc::read(rd, buf.as_mut_ptr().cast(), buf.len()) };
        assert_eq!(n, 4);
        assert_eq!(&buf[..4], msg);
        close(rd);
        close(wr);
    }

    #[test]
    fn nonblocking_toggles() {
        let (rd, wr) = pipe().expect("pipe");
        set_nonblocking(rd, true).expect("set nonblocking");
        let flags = unsafe { libc::fcntl(rd, libc::F_GETFL) };
        assert_ne!(flags & libc::O_NONBLOCK, 0);
        set_nonblocking(rd, false).expect("clear nonblocking");
        let flags = unsafe { libc::fcntl(rd, libc::F_GETFL) };
        assert_eq!(flags & libc::O_NONBLOCK, 0);
        close(rd);
        close(wr);
    }
}
