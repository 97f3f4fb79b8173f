//! `PollSet` - readiness multiplexing over `poll(2)`.
//!
//! The reactor rebuilds the interest list every iteration from its socket
//! sets, so there is no registration state to keep in sync with the kernel.
//! The wakeup descriptor always goes first.

use std::collections::HashSet;

use questnet_core::RawSocket;

use crate::sys::errno;

/// Classified result of one wait.
#[derive(Debug, Default)]
pub struct Readiness {
    pub readable: Vec<RawSocket>,
    pub writable: Vec<RawSocket>,
    /// POLLERR / POLLNVAL.
    pub errored: Vec<RawSocket>,
    /// The wakeup descriptor was readable.
    pub woken: bool,
}

impl Readiness {
    pub fn clear(&mut self) {
        self.readable.clear();
        self.writable.clear();
        self.errored.clear();
        self.woken = false;
    }

    pub fn is_empty(&self) -> bool {
        !self.woken && self.readable.is_empty() && self.writable.is_empty() && self.errored.is_empty()
    }
}

#[derive(Default)]
pub struct PollSet {
    fds: Vec<libc::pollfd>,
}

impl PollSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait until the wakeup fd or any socket is ready.
    ///
    /// Every socket in `sockets` is watched for reading; those also in
    /// `want_write` are watched for writing. `timeout_ms < 0` waits forever.
    /// An interrupted wait returns with an empty `out`.
    pub fn wait<'a, I>(
        &mut self,
        wake_fd: RawSocket,
        sockets: I,
        want_write: &HashSet<RawSocket>,
        timeout_ms: i32,
        out: &mut Readiness,
    ) -> Result<(), i32>
    where
        I: IntoIterator<Item = &'a RawSocket>,
    {
        out.clear();
        self.fds.clear();
        self.fds.push(libc::pollfd {
            fd: wake_fd,
            events: libc::POLLIN,
            revents: 0,
        });
        for &fd in sockets {
            let mut events = libc::POLLIN;
            if want_write.contains(&fd) {
                events |= libc::POLLOUT;
            }
            self.fds.push(libc::pollfd { fd, events, revents: 0 });
        }

        let ret = unsafe {
            libc::poll(
                self.fds.as_mut_ptr(),
                self.fds.len() as libc::nfds_t,
                timeout_ms,
            )
        };
        if ret < 0 {
            let e = errno();
            if e == libc::EINTR {
                return Ok(());
            }
            return Err(e);
        }
        if ret == 0 {
            return Ok(());
        }

        if self.fds[0].revents != 0 {
            out.woken = true;
        }
        for pfd in &self.fds[1..] {
            let rev = pfd.revents;
            if rev == 0 {
                continue;
            }
            if rev & (libc::POLLERR | libc::POLLNVAL) != 0 {
                out.errored.push(pfd.fd);
                continue;
            }
            if rev & (libc::POLLIN | libc::POLLHUP) != 0 {
                out.readable.push(pfd.fd);
            }
            if rev & libc::POLLOUT != 0 {
                out.writable.push(pfd.fd);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::DefaultNotifier;
    use questnet_core::Notifier;
    use std::io::Write;
    use std::net::{TcpListener, TcpStream};
    use std::os::unix::io::AsRawFd;

    #[test]
    fn test_wake_and_readable() {
        let notifier = DefaultNotifier::create().unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (mut server, _) = listener.accept().unwrap();

        let mut set = PollSet::new();
        let mut out = Readiness::default();
        let fd = client.as_raw_fd();
        let none = HashSet::new();

        set.wait(notifier.fd(), [fd].iter(), &none, 0, &mut out).unwrap();
        assert!(out.is_empty());

        notifier.notify().unwrap();
        server.write_all(b"x").unwrap();
        std::thread::sleep(std::time::Duration::from_millis(20));
        set.wait(notifier.fd(), [fd].iter(), &none, 1000, &mut out).unwrap();
        assert!(out.woken);
        assert_eq!(out.readable, vec![fd]);
        assert!(out.writable.is_empty());
    }

    #[test]
    fn test_write_interest() {
        let notifier = DefaultNotifier::create().unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let _server = listener.accept().unwrap();
        let fd = client.as_raw_fd();

        let mut set = PollSet::new();
        let mut out = Readiness::default();
        let mut want = HashSet::new();
        want.insert(fd);
        set.wait(notifier.fd(), [fd].iter(), &want, 1000, &mut out).unwrap();
        assert_eq!(out.writable, vec![fd]);
        assert!(!out.woken);
    }

    #[test]
    fn test_hangup_is_readable() {
        let notifier = DefaultNotifier::create().unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, _) = listener.accept().unwrap();
        drop(server);
        let fd = client.as_raw_fd();
        let mut set = PollSet::new();
        let mut out = Readiness::default();
        set.wait(notifier.fd(), [fd].iter(), &HashSet::new(), 1000, &mut out).unwrap();
        assert!(out.readable.contains(&fd) || out.errored.contains(&fd));
    }
}
