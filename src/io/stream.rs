//! Byte-stream reads and writes with sticky peer-condition flags.

use super::{Io, IoObject};
use crate::error::{Error, Result};
use std::any::Any;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Sticky flags recording peer-driven stream conditions.
///
/// These are conditions, not errors: the peer closing its write side sets
/// `eof`, a local write hitting a broken pipe sets `eop`, and a connection
/// reset in either direction sets `reset`. Once set, a flag stays set for
/// the life of the stream.
#[derive(Debug, Default)]
pub struct StreamState {
    eof: AtomicBool,
    eop: AtomicBool,
    reset: AtomicBool,
}

impl StreamState {
    /// True once a read has returned zero bytes.
    #[must_use]
    pub fn eof(&self) -> bool {
        self.eof.load(Ordering::SeqCst)
    }

    /// True once a local write has failed with a broken pipe.
    #[must_use]
    pub fn eop(&self) -> bool {
        self.eop.load(Ordering::SeqCst)
    }

    /// True once either direction has observed a connection reset.
    #[must_use]
    pub fn reset(&self) -> bool {
        self.reset.load(Ordering::SeqCst)
    }

    pub(crate) fn set_eof(&self) {
        self.eof.store(true, Ordering::SeqCst);
    }

    pub(crate) fn set_eop(&self) {
        self.eop.store(true, Ordering::SeqCst);
    }

    pub(crate) fn set_reset(&self) {
        self.reset.store(true, Ordering::SeqCst);
    }
}

/// Chunked non-blocking I/O over a byte stream.
///
/// The chunk operations perform one syscall and translate the errno
/// outcomes: `EAGAIN`/`EWOULDBLOCK` mean "done for now" and are not
/// errors, `EINTR` retries, `EPIPE` sets [`eop`], `ECONNRESET` sets
/// [`reset`], a zero-byte read sets [`eof`], and anything else surfaces
/// as a system error.
///
/// The drain operations loop until a short transfer and are forbidden on
/// blocking streams. Handlers driven by edge-triggered readiness must use
/// them; a partially drained fd may not fire again.
///
/// [`eof`]: StreamState::eof
/// [`eop`]: StreamState::eop
/// [`reset`]: StreamState::reset
pub trait StreamIo: IoObject {
    /// The sticky condition flags for this stream.
    fn stream_state(&self) -> &StreamState;

    /// True once the peer has closed its write side.
    fn is_eof(&self) -> bool {
        self.stream_state().eof()
    }

    /// True once a local write has hit a broken pipe.
    fn is_eop(&self) -> bool {
        self.stream_state().eop()
    }

    /// True once the connection has been reset.
    fn is_reset(&self) -> bool {
        self.stream_state().reset()
    }

    /// Attempts one non-blocking read of up to `len` bytes, appending to
    /// the read buffer. Returns the byte count; zero means no data was
    /// available or a condition flag was set.
    ///
    /// A read is attempted even when the buffer is currently empty.
    fn read_chunk(&self, len: usize) -> Result<usize> {
        if len == 0 {
            return Ok(0);
        }
        let io = self.io();
        let mut buf = io.rbuffer();
        loop {
            let spare = buf.spare_window(len);
            let n = unsafe { libc::read(io.fd(), spare.as_mut_ptr().cast(), len) };
            if n > 0 {
                buf.advance_end(n as usize);
                return Ok(n as usize);
            }
            if n == 0 {
                self.stream_state().set_eof();
                return Ok(0);
            }
            let err = std::io::Error::last_os_error();
            let errno = err.raw_os_error().unwrap_or(0);
            if errno == libc::EINTR {
                continue;
            }
            if errno == libc::EAGAIN || errno == libc::EWOULDBLOCK {
                return Ok(0);
            }
            if errno == libc::EPIPE {
                self.stream_state().set_eop();
                return Ok(0);
            }
            if errno == libc::ECONNRESET {
                self.stream_state().set_reset();
                return Ok(0);
            }
            return Err(Error::system_io(format!("read fd {}", io.fd()), err));
        }
    }

    /// Attempts one non-blocking write of up to `len` bytes from the write
    /// buffer. Returns the byte count; zero means the kernel buffer was
    /// full, the buffer had nothing to send, or a condition flag was set.
    fn write_chunk(&self, len: usize) -> Result<usize> {
        let io = self.io();
        let mut buf = io.wbuffer();
        let len = len.min(buf.size());
        if len == 0 {
            return Ok(0);
        }
        loop {
            let n = unsafe { libc::write(io.fd(), buf.as_slice().as_ptr().cast(), len) };
            if n >= 0 {
                buf.consume(n as usize);
                if buf.is_empty() {
                    buf.clear();
                } else if buf.waste() > buf.capacity() / 2 {
                    buf.compact();
                }
                return Ok(n as usize);
            }
            let err = std::io::Error::last_os_error();
            let errno = err.raw_os_error().unwrap_or(0);
            if errno == libc::EINTR {
                continue;
            }
            if errno == libc::EAGAIN || errno == libc::EWOULDBLOCK {
                return Ok(0);
            }
            if errno == libc::EPIPE {
                self.stream_state().set_eop();
                return Ok(0);
            }
            if errno == libc::ECONNRESET {
                self.stream_state().set_reset();
                return Ok(0);
            }
            return Err(Error::system_io(format!("write fd {}", io.fd()), err));
        }
    }

    /// Reads in `step`-byte chunks until a short read. Returns the total.
    fn read_all(&self, step: usize) -> Result<usize> {
        if self.io().is_blocking() {
            return Err(Error::logic("read_all on a blocking stream"));
        }
        if step == 0 {
            return Ok(0);
        }
        let mut total = 0;
        loop {
            let n = self.read_chunk(step)?;
            total += n;
            if n < step {
                return Ok(total);
            }
        }
    }

    /// Writes in `step`-byte chunks until a short write. Returns the total.
    fn write_all(&self, step: usize) -> Result<usize> {
        if self.io().is_blocking() {
            return Err(Error::logic("write_all on a blocking stream"));
        }
        if step == 0 {
            return Ok(0);
        }
        let mut total = 0;
        loop {
            let n = self.write_chunk(step)?;
            total += n;
            if n < step {
                return Ok(total);
            }
        }
    }
}

/// A plain byte stream over a pipe or fifo end.
#[derive(Debug)]
pub struct Stream {
    io: Io,
    state: StreamState,
}

impl Stream {
    pub(crate) fn from_fd(fd: std::os::fd::RawFd) -> Result<Self> {
        Ok(Self {
            io: Io::from_fd(fd)?,
            state: StreamState::default(),
        })
    }
}

impl IoObject for Stream {
    fn io(&self) -> &Io {
        &self.io
    }

    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

impl StreamIo for Stream {
    fn stream_state(&self) -> &StreamState {
        &self.state
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::pipe;

    #[test]
    fn pipe_round_trip_through_buffers() {
        let (rd, wr) = pipe().expect("pipe");
        wr.io().wbuffer().put_slice(b"hello through the pipe");
        let sent = wr.write_all(8).expect("write_all");
        assert_eq!(sent, 22);
        assert!(wr.io().wbuffer().is_empty());

        let got = rd.read_all(8).expect("read_all");
        assert_eq!(got, 22);
        assert_eq!(
            rd.io().rbuffer().get_bytes(None, true),
            b"hello through the pipe"
        );
    }

    #[test]
    fn read_chunk_reads_into_an_empty_buffer() {
        let (rd, wr) = pipe().expect("pipe");
        wr.io().wbuffer().put_slice(b"abcd");
        wr.write_all(4).expect("write_all");

        assert!(rd.io().rbuffer().is_empty());
        let n = rd.read_chunk(4).expect("read_chunk");
        assert_eq!(n, 4);
        assert_eq!(rd.io().rbuffer().as_slice(), b"abcd");
    }

    #[test]
    fn empty_pipe_reads_zero_without_flags() {
        let (rd, _wr) = pipe().expect("pipe");
        let n = rd.read_chunk(16).expect("read_chunk");
        assert_eq!(n, 0);
        assert!(!rd.is_eof());
        assert!(!rd.is_reset());
    }

    #[test]
    fn closed_writer_sets_eof() {
        let (rd, wr) = pipe().expect("pipe");
        wr.io().close();
        let n = rd.read_chunk(16).expect("read_chunk");
        assert_eq!(n, 0);
        assert!(rd.is_eof());
    }

    #[test]
    fn drain_on_blocking_stream_is_a_logic_error() {
        let (rd, wr) = pipe().expect("pipe");
        rd.io().set_blocking().expect("set_blocking");
        let err = rd.read_all(8).unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Logic);
        wr.io().set_blocking().expect("set_blocking");
        let err = wr.write_all(8).unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Logic);
    }

    #[test]
    fn write_to_closed_reader_sets_eop() {
        let (rd, wr) = pipe().expect("pipe");
        // Writes to a pipe with no readers raise SIGPIPE by default.
        crate::signal::ignore_signal(libc::SIGPIPE).expect("ignore SIGPIPE");
        rd.io().close();
        wr.io().wbuffer().put_slice(b"x");
        let n = wr.write_all(1).expect("write_all");
        assert_eq!(n, 0);
        assert!(wr.is_eop());
    }
}
