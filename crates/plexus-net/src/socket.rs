//! Thin wrappers over the socket syscalls the reactor needs.
//!
//! Every call here is non-blocking on a non-blocking descriptor and reports
//! would-block as a distinct outcome instead of an error. Descriptors are
//! handed out as `OwnedFd` so that closing stays tied to ownership.

use std::net::Ipv4Addr;
use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};

use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::sys::socket::{
    getsockname, getsockopt, socketpair, sockopt, AddressFamily, SockFlag, SockType, SockaddrIn,
};

use plexus_core::{NetError, Result};

/// Result of a single non-blocking I/O attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoOutcome {
    /// Transferred this many bytes (never 0).
    Done(usize),
    /// Nothing to do right now; try again after the next readiness event.
    WouldBlock,
    /// The peer closed its end.
    Closed,
    /// Hard failure with errno.
    Failed(i32),
}

/// Result of a single non-blocking accept.
#[derive(Debug)]
pub enum AcceptOutcome {
    Accepted(OwnedFd),
    WouldBlock,
    Failed(i32),
}

fn errno() -> i32 {
    Errno::last_raw()
}

fn is_would_block(code: i32) -> bool {
    code == libc::EAGAIN || code == libc::EWOULDBLOCK
}

pub fn set_nonblocking(fd: BorrowedFd<'_>, on: bool) -> Result<()> {
    let raw = fd.as_raw_fd();
    let bits = fcntl(raw, FcntlArg::F_GETFL)
        .map_err(|e| NetError::SocketOperationFailed { op: "fcntl", code: e as i32 })?;
    let mut flags = OFlag::from_bits_truncate(bits);
    flags.set(OFlag::O_NONBLOCK, on);
    fcntl(raw, FcntlArg::F_SETFL(flags))
        .map_err(|e| NetError::SocketOperationFailed { op: "fcntl", code: e as i32 })?;
    Ok(())
}

pub fn is_nonblocking(fd: BorrowedFd<'_>) -> Result<bool> {
    let bits = fcntl(fd.as_raw_fd(), FcntlArg::F_GETFL)
        .map_err(|e| NetError::SocketOperationFailed { op: "fcntl", code: e as i32 })?;
    Ok(OFlag::from_bits_truncate(bits).contains(OFlag::O_NONBLOCK))
}

/// A connected pair of Unix stream sockets.
pub fn socket_pair() -> Result<(OwnedFd, OwnedFd)> {
    socketpair(
        AddressFamily::Unix,
        SockType::Stream,
        None,
        SockFlag::SOCK_CLOEXEC,
    )
    .map_err(|e| NetError::SocketOperationFailed { op: "socketpair", code: e as i32 })
}

pub fn read(fd: RawFd, buf: &mut [u8]) -> IoOutcome {
    if buf.is_empty() {
        return IoOutcome::Done(0);
    }
    let ret = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
    match ret {
        0 => IoOutcome::Closed,
        n if n > 0 => IoOutcome::Done(n as usize),
        _ => {
            let code = errno();
            if is_would_block(code) || code == libc::EINTR {
                IoOutcome::WouldBlock
            } else {
                IoOutcome::Failed(code)
            }
        }
    }
}

/// `send` with `MSG_NOSIGNAL`, so a vanished peer yields `EPIPE` instead of
/// killing the process.
pub fn write(fd: RawFd, buf: &[u8]) -> IoOutcome {
    if buf.is_empty() {
        return IoOutcome::Done(0);
    }
    let ret = unsafe {
        libc::send(
            fd,
            buf.as_ptr() as *const libc::c_void,
            buf.len(),
            libc::MSG_NOSIGNAL,
        )
    };
    if ret >= 0 {
        return IoOutcome::Done(ret as usize);
    }
    match errno() {
        code if is_would_block(code) || code == libc::EINTR => IoOutcome::WouldBlock,
        libc::EPIPE | libc::ECONNRESET => IoOutcome::Closed,
        code => IoOutcome::Failed(code),
    }
}

/// Accept one pending connection; the new descriptor is non-blocking and
/// close-on-exec.
pub fn accept(listener: RawFd) -> AcceptOutcome {
    cfg_if::cfg_if! {
        if #[cfg(any(target_os = "linux", target_os = "android"))] {
            let fd = unsafe {
                libc::accept4(
                    listener,
                    std::ptr::null_mut(),
                    std::ptr::null_mut(),
                    libc::SOCK_CLOEXEC | libc::SOCK_NONBLOCK,
                )
            };
        } else {
            let fd = unsafe { libc::accept(listener, std::ptr::null_mut(), std::ptr::null_mut()) };
            if fd >= 0 {
                unsafe {
                    libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC);
                    let flags = libc::fcntl(fd, libc::F_GETFL);
                    libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK);
                }
            }
        }
    }
    if fd < 0 {
        let code = errno();
        if is_would_block(code) || code == libc::EINTR || code == libc::ECONNABORTED {
            return AcceptOutcome::WouldBlock;
        }
        return AcceptOutcome::Failed(code);
    }
    AcceptOutcome::Accepted(unsafe { OwnedFd::from_raw_fd(fd) })
}

/// Bind a TCP listener on `addr:port` (port 0 picks a free port).
pub fn tcp_listen(addr: Ipv4Addr, port: u16, backlog: i32) -> Result<OwnedFd> {
    let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_STREAM | libc::SOCK_CLOEXEC, 0) };
    if fd < 0 {
        return Err(NetError::last_os_error("socket"));
    }
    let owned = unsafe { OwnedFd::from_raw_fd(fd) };

    let opt: libc::c_int = 1;
    unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            &opt as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        );
    }

    let mut sa: libc::sockaddr_in = unsafe { std::mem::zeroed() };
    sa.sin_family = libc::AF_INET as libc::sa_family_t;
    sa.sin_addr.s_addr = u32::from(addr).to_be();
    sa.sin_port = port.to_be();

    let ret = unsafe {
        libc::bind(
            fd,
            &sa as *const _ as *const libc::sockaddr,
            std::mem::size_of_val(&sa) as libc::socklen_t,
        )
    };
    if ret != 0 {
        return Err(NetError::last_os_error("bind"));
    }
    if unsafe { libc::listen(fd, backlog) } != 0 {
        return Err(NetError::last_os_error("listen"));
    }
    Ok(owned)
}

/// Blocking connect to `addr:port`; the caller switches the descriptor to
/// non-blocking mode when handing it to a manager.
pub fn tcp_connect(addr: Ipv4Addr, port: u16) -> Result<OwnedFd> {
    let stream = std::net::TcpStream::connect((addr, port))
        .map_err(|e| NetError::from_io("connect", &e))?;
    stream
        .set_nodelay(true)
        .map_err(|e| NetError::from_io("setsockopt", &e))?;
    Ok(OwnedFd::from(stream))
}

/// Port a bound IPv4 socket listens on.
pub fn local_port(fd: BorrowedFd<'_>) -> Result<u16> {
    let addr: SockaddrIn = getsockname(fd.as_raw_fd())
        .map_err(|e| NetError::SocketOperationFailed { op: "getsockname", code: e as i32 })?;
    Ok(addr.port())
}

/// Kernel send buffer size; drives the transport's output limit.
pub fn send_buffer_size(fd: BorrowedFd<'_>) -> Result<usize> {
    getsockopt(&fd, sockopt::SndBuf)
        .map_err(|e| NetError::SocketOperationFailed { op: "getsockopt", code: e as i32 })
}

/// Pending error on the socket (`SO_ERROR`), 0 if none.
pub fn pending_error(fd: BorrowedFd<'_>) -> i32 {
    getsockopt(&fd, sockopt::SocketError).unwrap_or(0)
}

/// Half-close the write direction so the peer observes end-of-stream.
pub fn shutdown_write(fd: RawFd) {
    unsafe {
        libc::shutdown(fd, libc::SHUT_WR);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::fd::AsFd;

    #[test]
    fn test_pair_read_write() {
        let (a, b) = socket_pair().unwrap();
        set_nonblocking(b.as_fd(), true).unwrap();
        assert!(is_nonblocking(b.as_fd()).unwrap());

        let mut buf = [0u8; 16];
        assert_eq!(read(b.as_raw_fd(), &mut buf), IoOutcome::WouldBlock);
        assert_eq!(write(a.as_raw_fd(), b"hello"), IoOutcome::Done(5));
        assert_eq!(read(b.as_raw_fd(), &mut buf), IoOutcome::Done(5));
        assert_eq!(&buf[..5], b"hello");

        drop(a);
        assert_eq!(read(b.as_raw_fd(), &mut buf), IoOutcome::Closed);
        assert_eq!(write(b.as_raw_fd(), b"x"), IoOutcome::Closed);
    }

    #[test]
    fn test_listen_accept_connect() {
        let listener = tcp_listen(Ipv4Addr::LOCALHOST, 0, 16).unwrap();
        set_nonblocking(listener.as_fd(), true).unwrap();
        let port = local_port(listener.as_fd()).unwrap();
        assert_ne!(port, 0);

        assert!(matches!(accept(listener.as_raw_fd()), AcceptOutcome::WouldBlock));
        let _client = tcp_connect(Ipv4Addr::LOCALHOST, port).unwrap();

        let mut accepted = None;
        for _ in 0..100 {
            if let AcceptOutcome::Accepted(fd) = accept(listener.as_raw_fd()) {
                accepted = Some(fd);
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(5));
        }
        let fd = accepted.expect("no connection accepted");
        assert!(is_nonblocking(fd.as_fd()).unwrap());
        assert_eq!(pending_error(fd.as_fd()), 0);
        assert!(send_buffer_size(fd.as_fd()).unwrap() > 0);
    }

    #[test]
    fn test_failed_syscall_reports_errno() {
        let mut buf = [0u8; 4];
        assert_eq!(read(-1, &mut buf), IoOutcome::Failed(libc::EBADF));
        assert_eq!(write(-1, b"x"), IoOutcome::Failed(libc::EBADF));
        assert!(matches!(accept(-1), AcceptOutcome::Failed(libc::EBADF)));
    }
}
