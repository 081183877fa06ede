//! Address families and sockaddr conversion.

use crate::error::{Error, Result};
use core::fmt;
use std::mem;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::path::PathBuf;

/// Longest unix-domain socket path, leaving room for the trailing NUL.
const UNIX_PATH_MAX: usize = 107;

/// Socket address family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Family {
    /// IPv4.
    Ipv4,
    /// IPv6.
    Ipv6,
    /// Unix-domain (filesystem path).
    Local,
}

impl Family {
    pub(crate) const fn af(self) -> libc::c_int {
        match self {
            Family::Ipv4 => libc::AF_INET,
            Family::Ipv6 => libc::AF_INET6,
            Family::Local => libc::AF_UNIX,
        }
    }
}

impl fmt::Display for Family {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Family::Ipv4 => f.write_str("ipv4"),
            Family::Ipv6 => f.write_str("ipv6"),
            Family::Local => f.write_str("local"),
        }
    }
}

/// A bound or connected socket name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    /// An IPv4 or IPv6 address and port.
    Inet(SocketAddr),
    /// A unix-domain socket path.
    Local(PathBuf),
}

impl Endpoint {
    /// The family this endpoint belongs to.
    #[must_use]
    pub fn family(&self) -> Family {
        match self {
            Endpoint::Inet(SocketAddr::V4(_)) => Family::Ipv4,
            Endpoint::Inet(SocketAddr::V6(_)) => Family::Ipv6,
            Endpoint::Local(_) => Family::Local,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Inet(addr) => addr.fmt(f),
            Endpoint::Local(path) => path.display().fmt(f),
        }
    }
}

/// Builds a v4/v6 sockaddr. `ip` of `None` means the any-address.
pub(crate) fn inet_addr(
    family: Family,
    ip: Option<&str>,
    port: u16,
) -> Result<(libc::sockaddr_storage, libc::socklen_t)> {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let len = match family {
        Family::Ipv4 => {
            let addr = match ip {
                Some(text) => text
                    .parse::<Ipv4Addr>()
                    .map_err(|_| Error::logic(format!("invalid ipv4 address {text}")))?,
                None => Ipv4Addr::UNSPECIFIED,
            };
            let sin = unsafe {
                &mut *std::ptr::addr_of_mut!(storage).cast::<libc::sockaddr_in>()
            };
            sin.sin_family = libc::AF_INET as libc::sa_family_t;
            sin.sin_port = port.to_be();
            sin.sin_addr.s_addr = u32::from(addr).to_be();
            mem::size_of::<libc::sockaddr_in>()
        }
        Family::Ipv6 => {
            let addr = match ip {
                Some(text) => text
                    .parse::<Ipv6Addr>()
                    .map_err(|_| Error::logic(format!("invalid ipv6 address {text}")))?,
                None => Ipv6Addr::UNSPECIFIED,
            };
            let sin6 = unsafe {
                &mut *std::ptr::addr_of_mut!(storage).cast::<libc::sockaddr_in6>()
            };
            sin6.sin6_family = libc::AF_INET6 as libc::sa_family_t;
            sin6.sin6_port = port.to_be();
            sin6.sin6_addr.s6_addr = addr.octets();
            mem::size_of::<libc::sockaddr_in6>()
        }
        Family::Local => {
            return Err(Error::logic("inet address requested for a unix socket"));
        }
    };
    Ok((storage, len as libc::socklen_t))
}

/// Builds a unix-domain sockaddr for `path`.
pub(crate) fn unix_addr(path: &str) -> Result<(libc::sockaddr_storage, libc::socklen_t)> {
    let bytes = path.as_bytes();
    if bytes.is_empty() {
        return Err(Error::logic("empty unix socket path"));
    }
    if bytes.len() > UNIX_PATH_MAX || bytes.contains(&0) {
        return Err(Error::logic(format!("unix socket path too long: {path}")));
    }

    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let sun = unsafe { &mut *std::ptr::addr_of_mut!(storage).cast::<libc::sockaddr_un>() };
    sun.sun_family = libc::AF_UNIX as libc::sa_family_t;
    for (dst, src) in sun.sun_path.iter_mut().zip(bytes) {
        *dst = *src as libc::c_char;
    }
    Ok((
        storage,
        mem::size_of::<libc::sockaddr_un>() as libc::socklen_t,
    ))
}

/// Parses a sockaddr filled in by the kernel.
pub(crate) fn parse_addr(storage: &libc::sockaddr_storage) -> Result<Endpoint> {
    match libc::c_int::from(storage.ss_family) {
        libc::AF_INET => {
            let sin = unsafe { &*std::ptr::addr_of!(*storage).cast::<libc::sockaddr_in>() };
            let ip = Ipv4Addr::from(u32::from_be(sin.sin_addr.s_addr));
            let port = u16::from_be(sin.sin_port);
            Ok(Endpoint::Inet(SocketAddr::V4(SocketAddrV4::new(ip, port))))
        }
        libc::AF_INET6 => {
            let sin6 = unsafe { &*std::ptr::addr_of!(*storage).cast::<libc::sockaddr_in6>() };
            let ip = Ipv6Addr::from(sin6.sin6_addr.s6_addr);
            let port = u16::from_be(sin6.sin6_port);
            Ok(Endpoint::Inet(SocketAddr::V6(SocketAddrV6::new(
                ip, port, 0, 0,
            ))))
        }
        libc::AF_UNIX => {
            let sun = unsafe { &*std::ptr::addr_of!(*storage).cast::<libc::sockaddr_un>() };
            let bytes: Vec<u8> = sun
                .sun_path
                .iter()
                .take_while(|c| **c != 0)
                .map(|c| *c as u8)
                .collect();
            Ok(Endpoint::Local(PathBuf::from(
                String::from_utf8_lossy(&bytes).into_owned(),
            )))
        }
        family => Err(Error::logic(format!("unknown socket family {family}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ipv4_round_trip() {
        let (storage, _) = inet_addr(Family::Ipv4, Some("127.0.0.1"), 8884).expect("build");
        let parsed = parse_addr(&storage).expect("parse");
        assert_eq!(
            parsed,
            Endpoint::Inet("127.0.0.1:8884".parse().unwrap())
        );
        assert_eq!(parsed.family(), Family::Ipv4);
    }

    #[test]
    fn ipv6_round_trip() {
        let (storage, _) = inet_addr(Family::Ipv6, Some("::1"), 8886).expect("build");
        let parsed = parse_addr(&storage).expect("parse");
        assert_eq!(parsed, Endpoint::Inet("[::1]:8886".parse().unwrap()));
        assert_eq!(parsed.family(), Family::Ipv6);
    }

    #[test]
    fn any_address_when_ip_missing() {
        let (storage, _) = inet_addr(Family::Ipv4, None, 80).expect("build");
        match parse_addr(&storage).expect("parse") {
            Endpoint::Inet(addr) => assert!(addr.ip().is_unspecified()),
            Endpoint::Local(_) => panic!("expected inet endpoint"),
        }
    }

    #[test]
    fn bad_ip_is_a_logic_error() {
        let err = inet_addr(Family::Ipv4, Some("not-an-ip"), 80).unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Logic);
    }

    #[test]
    fn unix_round_trip() {
        let (storage, _) = unix_addr("/tmp/eventide_addr_test.sock").expect("build");
        let parsed = parse_addr(&storage).expect("parse");
        assert_eq!(
            parsed,
            Endpoint::Local(PathBuf::from("/tmp/eventide_addr_test.sock"))
        );
    }

    #[test]
    fn overlong_unix_path_rejected() {
        let path = "/tmp/".to_string() + &"x".repeat(150);
        let err = unix_addr(&path).unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Logic);
    }
}
