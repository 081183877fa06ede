//! Generic get/setsockopt helpers.
//!
//! One typed pair of functions instead of a syscall block per option.
//! Callers in the socket types pass the level, option name, and a plain
//! old data value.

use crate::error::{Error, Result};
use std::mem;
use std::os::fd::RawFd;

/// Sets a socket option holding a plain value.
pub(crate) fn set<T: Copy>(
    fd: RawFd,
    level: libc::c_int,
    name: libc::c_int,
    value: &T,
    what: &str,
) -> Result<()> {
    let ret = unsafe {
        libc::setsockopt(
            fd,
            level,
            name,
            (value as *const T).cast(),
            mem::size_of::<T>() as libc::socklen_t,
        )
    };
    if ret != 0 {
        return Err(Error::system(format!("setsockopt {what} fd {fd}")));
    }
    Ok(())
}

/// Reads a socket option holding a plain value.
pub(crate) fn get<T: Copy>(
    fd: RawFd,
    level: libc::c_int,
    name: libc::c_int,
    what: &str,
) -> Result<T> {
    let mut value = mem::MaybeUninit::<T>::zeroed();
    let mut len = mem::size_of::<T>() as libc::socklen_t;
    let ret = unsafe { libc::getsockopt(fd, level, name, value.as_mut_ptr().cast(), &mut len) };
    if ret != 0 {
        return Err(Error::system(format!("getsockopt {what} fd {fd}")));
    }
    Ok(unsafe { value.assume_init() })
}

pub(crate) fn set_flag(fd: RawFd, level: libc::c_int, name: libc::c_int, on: bool, what: &str) -> Result<()> {
    let value: libc::c_int = libc::c_int::from(on);
    set(fd, level, name, &value, what)
}

pub(crate) fn get_flag(fd: RawFd, level: libc::c_int, name: libc::c_int, what: &str) -> Result<bool> {
    let value: libc::c_int = get(fd, level, name, what)?;
    Ok(value != 0)
}
