//! Raw socket helpers.
//!
//! Everything the engine does to a descriptor goes through here: nonblocking
//! connect, reads and writes with EINTR retry, pending-error queries and the
//! process-wide SIGPIPE policy. Errors are plain errno values.

use std::net::SocketAddr;

use nix::errno::Errno;
use nix::sys::signal::{signal, SigHandler, Signal};
use questnet_core::{kdebug, NetError, NetResult, RawSocket};

cfg_if::cfg_if! {
    if #[cfg(any(target_os = "linux", target_os = "android"))] {
        const SEND_FLAGS: libc::c_int = libc::MSG_NOSIGNAL;
        const SOCK_FLAGS: libc::c_int = libc::SOCK_CLOEXEC;
    } else {
        const SEND_FLAGS: libc::c_int = 0;
        const SOCK_FLAGS: libc::c_int = 0;
    }
}

/// errno of the last failed call on this thread.
#[inline]
pub fn errno() -> i32 {
    Errno::last() as i32
}

/// Ignore SIGPIPE for the whole process, so a write to a reset peer returns
/// EPIPE instead of killing us.
pub fn ignore_sigpipe() -> NetResult<()> {
    // Safety: installing SIG_IGN does not run any handler code.
    unsafe { signal(Signal::SIGPIPE, SigHandler::SigIgn) }
        .map(|_| ())
        .map_err(|e| NetError::Os(e as i32))
}

fn sockaddr_of(addr: &SocketAddr) -> (libc::sockaddr_storage, libc::socklen_t) {
    let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    let len = match addr {
        SocketAddr::V4(v4) => {
            let sin = unsafe { &mut *(&mut storage as *mut _ as *mut libc::sockaddr_in) };
            sin.sin_family = libc::AF_INET as libc::sa_family_t;
            sin.sin_port = v4.port().to_be();
            sin.sin_addr = libc::in_addr {
                s_addr: u32::from_ne_bytes(v4.ip().octets()),
            };
            std::mem::size_of::<libc::sockaddr_in>()
        }
        SocketAddr::V6(v6) => {
            let sin6 = unsafe { &mut *(&mut storage as *mut _ as *mut libc::sockaddr_in6) };
            sin6.sin6_family = libc::AF_INET6 as libc::sa_family_t;
            sin6.sin6_port = v6.port().to_be();
            sin6.sin6_flowinfo = v6.flowinfo();
            sin6.sin6_addr.s6_addr = v6.ip().octets();
            sin6.sin6_scope_id = v6.scope_id();
            std::mem::size_of::<libc::sockaddr_in6>()
        }
    };
    (storage, len as libc::socklen_t)
}

fn open_socket(addr: &SocketAddr, kind: libc::c_int) -> Result<RawSocket, i32> {
    let family = if addr.is_ipv4() { libc::AF_INET } else { libc::AF_INET6 };
    let fd = unsafe { libc::socket(family, kind | SOCK_FLAGS, 0) };
    if fd < 0 {
        return Err(errno());
    }
    if let Err(e) = set_nonblocking(fd) {
        close(fd);
        return Err(e);
    }
    #[cfg(any(target_os = "macos", target_os = "ios", target_os = "freebsd"))]
    unsafe {
        let opt: libc::c_int = 1;
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_NOSIGPIPE,
            &opt as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        );
    }
    Ok(fd)
}

pub fn set_nonblocking(fd: RawSocket) -> Result<(), i32> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(errno());
    }
    if unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
        return Err(errno());
    }
    Ok(())
}

fn connect_raw(fd: RawSocket, addr: &SocketAddr) -> Result<bool, i32> {
    let (storage, len) = sockaddr_of(addr);
    let ret = unsafe { libc::connect(fd, &storage as *const _ as *const libc::sockaddr, len) };
    connect_outcome(ret, if ret == 0 { 0 } else { errno() })
}

/// `Ok(true)` connected, `Ok(false)` still in progress. An interrupted
/// nonblocking connect keeps going in the kernel; calling connect again
/// would fail with EALREADY, so it is left to the readiness path.
fn connect_outcome(ret: libc::c_int, err: i32) -> Result<bool, i32> {
    if ret == 0 {
        return Ok(true);
    }
    match err {
        libc::EINTR | libc::EINPROGRESS => Ok(false),
        e => Err(e),
    }
}

/// Open a nonblocking TCP socket and start connecting.
///
/// Returns the descriptor and whether the connect already completed
/// (loopback often completes immediately).
pub fn tcp_connect(addr: &SocketAddr) -> Result<(RawSocket, bool), i32> {
    let fd = open_socket(addr, libc::SOCK_STREAM)?;
    unsafe {
        let opt: libc::c_int = 1;
        libc::setsockopt(
            fd,
            libc::IPPROTO_TCP,
            libc::TCP_NODELAY,
            &opt as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        );
    }
    match connect_raw(fd, addr) {
        Ok(connected) => {
            kdebug!("tcp fd {} connecting to {}, immediate={}", fd, addr, connected);
            Ok((fd, connected))
        }
        Err(e) => {
            close(fd);
            Err(e)
        }
    }
}

/// Open a nonblocking UDP socket connected to `addr`.
pub fn udp_connect(addr: &SocketAddr) -> Result<RawSocket, i32> {
    let fd = open_socket(addr, libc::SOCK_DGRAM)?;
    match connect_raw(fd, addr) {
        Ok(_) => Ok(fd),
        Err(e) => {
            close(fd);
            Err(e)
        }
    }
}

/// Pending socket error (SO_ERROR), 0 if none.
pub fn socket_error(fd: RawSocket) -> i32 {
    let mut err: libc::c_int = 0;
    let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
    let ret = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            &mut err as *mut _ as *mut libc::c_void,
            &mut len,
        )
    };
    if ret < 0 {
        errno()
    } else {
        err
    }
}

/// recv(2) with EINTR retry. `Ok(0)` is end of stream for TCP.
pub fn read(fd: RawSocket, buf: &mut [u8]) -> Result<usize, i32> {
    loop {
        let n = unsafe { libc::recv(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len(), 0) };
        if n >= 0 {
            return Ok(n as usize);
        }
        match errno() {
            libc::EINTR => continue,
            e => return Err(e),
        }
    }
}

/// send(2) with EINTR retry and no SIGPIPE.
pub fn write(fd: RawSocket, buf: &[u8]) -> Result<usize, i32> {
    loop {
        let n = unsafe {
            libc::send(fd, buf.as_ptr() as *const libc::c_void, buf.len(), SEND_FLAGS)
        };
        if n >= 0 {
            return Ok(n as usize);
        }
        match errno() {
            libc::EINTR => continue,
            e => return Err(e),
        }
    }
}

pub fn close(fd: RawSocket) {
    if fd > 0 {
        unsafe {
            libc::close(fd);
        }
    }
}

#[inline]
pub fn would_block(err: i32) -> bool {
    err == libc::EAGAIN || err == libc::EWOULDBLOCK
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::{TcpListener, UdpSocket};

    #[test]
    fn test_interrupted_connect_is_pending() {
        assert_eq!(connect_outcome(0, 0), Ok(true));
        assert_eq!(connect_outcome(-1, libc::EINPROGRESS), Ok(false));
        assert_eq!(connect_outcome(-1, libc::EINTR), Ok(false));
        assert_eq!(connect_outcome(-1, libc::ECONNREFUSED), Err(libc::ECONNREFUSED));
    }

    #[test]
    fn test_tcp_connect_loopback() {
        ignore_sigpipe().unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let (fd, _connected) = tcp_connect(&addr).unwrap();
        let (mut peer, _) = listener.accept().unwrap();

        // Wait for connect completion before writing.
        let mut sent = 0;
        for _ in 0..200 {
            match write(fd, b"ping") {
                Ok(n) => {
                    sent = n;
                    break;
                }
                Err(e) if would_block(e) || e == libc::ENOTCONN => {
                    std::thread::sleep(std::time::Duration::from_millis(5))
                }
                Err(e) => panic!("write failed: {}", e),
            }
        }
        assert_eq!(sent, 4);
        assert_eq!(socket_error(fd), 0);

        let mut buf = [0u8; 4];
        peer.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"ping");

        peer.write_all(b"pong").unwrap();
        let mut got = [0u8; 4];
        let mut n = 0;
        for _ in 0..200 {
            match read(fd, &mut got[n..]) {
                Ok(k) => {
                    n += k;
                    if n == 4 {
                        break;
                    }
                }
                Err(e) if would_block(e) => std::thread::sleep(std::time::Duration::from_millis(5)),
                Err(e) => panic!("read failed: {}", e),
            }
        }
        assert_eq!(&got, b"pong");
        close(fd);
    }

    #[test]
    fn test_read_would_block() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let (fd, _) = tcp_connect(&addr).unwrap();
        let _peer = listener.accept().unwrap();
        let mut buf = [0u8; 8];
        let err = read(fd, &mut buf).unwrap_err();
        assert!(would_block(err) || err == libc::ENOTCONN);
        close(fd);
    }

    #[test]
    fn test_udp_connect_send() {
        let peer = UdpSocket::bind("127.0.0.1:0").unwrap();
        let fd = udp_connect(&peer.local_addr().unwrap()).unwrap();
        assert_eq!(write(fd, b"dgram").unwrap(), 5);
        let mut buf = [0u8; 16];
        let (n, _) = peer.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"dgram");
        close(fd);
    }
}
