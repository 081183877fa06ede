//! Error types and error handling strategy.
//!
//! Three kinds of failure flow through the crate:
//!
//! - **System**: a syscall failed with an errno. The error carries the
//!   errno value and a context string naming the operation.
//! - **Logic**: an invariant was violated by the caller, e.g. draining a
//!   blocking stream with `read_all` or activating an event twice. These
//!   indicate a programming bug and are not recoverable.
//! - **Runtime**: an environmental problem not tied to an errno.
//!
//! Peer-driven conditions (end of file, broken pipe, connection reset) are
//! deliberately *not* errors; they surface as sticky flags on streams.
//!
//! Inside event-loop handlers, errors of any kind are caught at the
//! dispatch boundary, logged with the fd that produced them, and the loop
//! continues.

use core::fmt;
use std::io;

/// The kind of error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// A syscall failed; the error carries the errno.
    System,
    /// A caller violated an invariant. Indicates a bug, not a condition.
    Logic,
    /// An environmental failure without an errno.
    Runtime,
}

/// The error type for all fallible operations in this crate.
#[derive(Debug, Clone)]
pub struct Error {
    kind: ErrorKind,
    context: String,
    errno: Option<i32>,
}

impl Error {
    /// Creates a system error capturing the calling thread's current errno.
    #[must_use]
    pub fn system(context: impl Into<String>) -> Self {
        Self::system_io(context, io::Error::last_os_error())
    }

    /// Creates a system error from an already-captured I/O error.
    #[must_use]
    pub fn system_io(context: impl Into<String>, err: io::Error) -> Self {
        Self {
            kind: ErrorKind::System,
            context: context.into(),
            errno: err.raw_os_error(),
        }
    }

    /// Creates a system error from a raw errno value (for APIs such as
    /// `pthread_sigmask` that return the errno instead of setting it).
    #[must_use]
    pub fn system_errno(context: impl Into<String>, errno: i32) -> Self {
        Self {
            kind: ErrorKind::System,
            context: context.into(),
            errno: Some(errno),
        }
    }

    /// Creates a logic error.
    #[must_use]
    pub fn logic(context: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Logic,
            context: context.into(),
            errno: None,
        }
    }

    /// Creates a runtime error.
    #[must_use]
    pub fn runtime(context: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Runtime,
            context: context.into(),
            errno: None,
        }
    }

    /// Returns the error kind.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Returns the captured errno, if this is a system error.
    #[must_use]
    pub const fn errno(&self) -> Option<i32> {
        self.errno
    }

    /// Returns the context string.
    #[must_use]
    pub fn context(&self) -> &str {
        &self.context
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            ErrorKind::System => write!(f, "system error: {}", self.context)?,
            ErrorKind::Logic => write!(f, "logic error: {}", self.context)?,
            ErrorKind::Runtime => write!(f, "runtime error: {}", self.context)?,
        }
        if let Some(errno) = self.errno {
            write!(f, ": errno {errno} ({})", io::Error::from_raw_os_error(errno))?;
        }
        Ok(())
    }
}

impl std::error::Error for Error {}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Self::system_io("io", err)
    }
}

/// Result alias using this crate's [`Error`].
pub type Result<T> = std::result::Result<T, Error>;
