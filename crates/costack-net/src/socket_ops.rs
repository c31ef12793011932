//! Thin wrappers over the socket syscalls used by the TCP types
//!
//! Every descriptor created here is non-blocking and close-on-exec.
//! Failures come back as `CoError::Os(errno)` or as the raw errno where the
//! caller has to branch on it (`EINPROGRESS`, `EAGAIN`).

use costack_core::error::{CoError, CoResult};
use std::mem;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::os::unix::io::RawFd;

#[inline]
pub(crate) fn errno() -> i32 {
    std::io::Error::last_os_error().raw_os_error().unwrap_or(0)
}

/// True for errno values that only mean "try again later"
#[inline]
pub(crate) fn would_block(err: i32) -> bool {
    err == libc::EAGAIN || err == libc::EWOULDBLOCK || err == libc::EINTR
}

fn domain_of(addr: &SocketAddr) -> i32 {
    match addr {
        SocketAddr::V4(_) => libc::AF_INET,
        SocketAddr::V6(_) => libc::AF_INET6,
    }
}

/// Create a non-blocking TCP socket for `addr`'s family
pub(crate) fn stream_socket(addr: &SocketAddr) -> CoResult<RawFd> {
    let fd = unsafe {
        libc::socket(
            domain_of(addr),
            libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            0,
        )
    };
    if fd < 0 {
        return Err(CoError::last_os_error());
    }
    Ok(fd)
}

pub(crate) fn to_sockaddr(addr: &SocketAddr) -> (libc::sockaddr_storage, libc::socklen_t) {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let len = match addr {
        SocketAddr::V4(v4) => {
            let sin = unsafe { &mut *(&mut storage as *mut _ as *mut libc::sockaddr_in) };
            sin.sin_family = libc::AF_INET as libc::sa_family_t;
            sin.sin_port = v4.port().to_be();
            sin.sin_addr.s_addr = u32::from(*v4.ip()).to_be();
            mem::size_of::<libc::sockaddr_in>()
        }
        SocketAddr::V6(v6) => {
            let sin6 = unsafe { &mut *(&mut storage as *mut _ as *mut libc::sockaddr_in6) };
            sin6.sin6_family = libc::AF_INET6 as libc::sa_family_t;
            sin6.sin6_port = v6.port().to_be();
            sin6.sin6_addr.s6_addr = v6.ip().octets();
            sin6.sin6_flowinfo = v6.flowinfo();
            sin6.sin6_scope_id = v6.scope_id();
            mem::size_of::<libc::sockaddr_in6>()
        }
    };
    (storage, len as libc::socklen_t)
}

pub(crate) fn from_sockaddr(storage: &libc::sockaddr_storage) -> Option<SocketAddr> {
    match storage.ss_family as i32 {
        libc::AF_INET => {
            let sin = unsafe { &*(storage as *const _ as *const libc::sockaddr_in) };
            let ip = Ipv4Addr::from(u32::from_be(sin.sin_addr.s_addr));
            Some(SocketAddr::V4(SocketAddrV4::new(ip, u16::from_be(sin.sin_port))))
        }
        libc::AF_INET6 => {
            let sin6 = unsafe { &*(storage as *const _ as *const libc::sockaddr_in6) };
            let ip = Ipv6Addr::from(sin6.sin6_addr.s6_addr);
            Some(SocketAddr::V6(SocketAddrV6::new(
                ip,
                u16::from_be(sin6.sin6_port),
                sin6.sin6_flowinfo,
                sin6.sin6_scope_id,
            )))
        }
        _ => None,
    }
}

/// Start a non-blocking connect
///
/// `Ok(())` means connected already; `Err(EINPROGRESS)` means wait for
/// writability.
pub(crate) fn connect(fd: RawFd, addr: &SocketAddr) -> Result<(), i32> {
    let (storage, len) = to_sockaddr(addr);
    let ret = unsafe { libc::connect(fd, &storage as *const _ as *const libc::sockaddr, len) };
    if ret == 0 {
        Ok(())
    } else {
        Err(errno())
    }
}

fn set_flag(fd: RawFd, level: i32, name: i32) -> CoResult<()> {
    let opt: libc::c_int = 1;
    let ret = unsafe {
        libc::setsockopt(
            fd,
            level,
            name,
            &opt as *const _ as *const libc::c_void,
            mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if ret != 0 {
        return Err(CoError::last_os_error());
    }
    Ok(())
}

pub(crate) fn set_nodelay(fd: RawFd) -> CoResult<()> {
    set_flag(fd, libc::IPPROTO_TCP, libc::TCP_NODELAY)
}

/// socket + SO_REUSEADDR + bind + listen
pub(crate) fn listen(addr: &SocketAddr, backlog: i32) -> CoResult<RawFd> {
    let fd = stream_socket(addr)?;
    let setup = || -> CoResult<()> {
        set_flag(fd, libc::SOL_SOCKET, libc::SO_REUSEADDR)?;
        let (storage, len) = to_sockaddr(addr);
        if unsafe { libc::bind(fd, &storage as *const _ as *const libc::sockaddr, len) } != 0 {
            return Err(CoError::last_os_error());
        }
        if unsafe { libc::listen(fd, backlog) } != 0 {
            return Err(CoError::last_os_error());
        }
        Ok(())
    };
    if let Err(e) = setup() {
        close(fd);
        return Err(e);
    }
    Ok(fd)
}

/// Accept one pending connection; the errno is returned as is
pub(crate) fn accept(fd: RawFd) -> Result<(RawFd, SocketAddr), i32> {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    let conn = unsafe {
        libc::accept4(
            fd,
            &mut storage as *mut _ as *mut libc::sockaddr,
            &mut len,
            libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
        )
    };
    if conn < 0 {
        return Err(errno());
    }
    let peer = from_sockaddr(&storage).unwrap_or_else(unspecified_addr);
    Ok((conn, peer))
}

pub(crate) fn local_addr(fd: RawFd) -> CoResult<SocketAddr> {
    name_of(fd, libc::getsockname)
}

pub(crate) fn peer_addr(fd: RawFd) -> CoResult<SocketAddr> {
    name_of(fd, libc::getpeername)
}

type NameFn = unsafe extern "C" fn(i32, *mut libc::sockaddr, *mut libc::socklen_t) -> i32;

fn name_of(fd: RawFd, f: NameFn) -> CoResult<SocketAddr> {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    if unsafe { f(fd, &mut storage as *mut _ as *mut libc::sockaddr, &mut len) } != 0 {
        return Err(CoError::last_os_error());
    }
    from_sockaddr(&storage).ok_or(CoError::Os(libc::EAFNOSUPPORT))
}

pub(crate) fn unspecified_addr() -> SocketAddr {
    SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0))
}

/// Fetch and clear the pending socket error (SO_ERROR)
pub(crate) fn take_error(fd: RawFd) -> i32 {
    let mut err: libc::c_int = 0;
    let mut len = mem::size_of::<libc::c_int>() as libc::socklen_t;
    let ret = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            &mut err as *mut _ as *mut libc::c_void,
            &mut len,
        )
    };
    if ret != 0 {
        return errno();
    }
    err
}

/// Scatter read into `first`, then `second`
pub(crate) fn readv2(fd: RawFd, first: &mut [u8], second: &mut [u8]) -> isize {
    let iov = [
        libc::iovec {
            iov_base: first.as_mut_ptr() as *mut libc::c_void,
            iov_len: first.len(),
        },
        libc::iovec {
            iov_base: second.as_mut_ptr() as *mut libc::c_void,
            iov_len: second.len(),
        },
    ];
    unsafe { libc::readv(fd, iov.as_ptr(), 2) }
}

pub(crate) fn write(fd: RawFd, data: &[u8]) -> isize {
    unsafe { libc::write(fd, data.as_ptr() as *const libc::c_void, data.len()) }
}

pub(crate) fn shutdown_write(fd: RawFd) {
    unsafe {
        libc::shutdown(fd, libc::SHUT_WR);
    }
}

pub(crate) fn close(fd: RawFd) {
    unsafe {
        libc::close(fd);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sockaddr_conversion() {
        for text in ["127.0.0.1:8080", "[::1]:443", "0.0.0.0:0"] {
            let addr: SocketAddr = text.parse().unwrap();
            let (storage, len) = to_sockaddr(&addr);
            assert!(len as usize <= mem::size_of::<libc::sockaddr_storage>());
            assert_eq!(from_sockaddr(&storage), Some(addr));
        }
    }

    #[test]
    fn test_listen_reports_bound_port() {
        let fd = listen(&"127.0.0.1:0".parse().unwrap(), 16).unwrap();
        let local = local_addr(fd).unwrap();
        assert_eq!(local.ip(), Ipv4Addr::LOCALHOST);
        assert_ne!(local.port(), 0);
        assert!(peer_addr(fd).is_err());
        assert_eq!(take_error(fd), 0);
        close(fd);
    }

    #[test]
    fn test_accept_would_block() {
        let fd = listen(&"127.0.0.1:0".parse().unwrap(), 16).unwrap();
        let err = accept(fd).unwrap_err();
        assert!(would_block(err));
        close(fd);
    }
}
