//! `PipeNotifier` - self-pipe `Notifier` for unix targets without eventfd.

use questnet_core::notifier::Notifier;
use questnet_core::{NetError, NetResult, RawSocket};

use crate::sys::{errno, set_nonblocking};

pub struct PipeNotifier {
    read_fd: RawSocket,
    write_fd: RawSocket,
}

impl PipeNotifier {
    pub fn create() -> NetResult<Self> {
        let mut fds = [0 as libc::c_int; 2];
        if unsafe { libc::pipe(fds.as_mut_ptr()) } < 0 {
            return Err(NetError::Os(errno()));
        }
        let notifier = Self {
            read_fd: fds[0],
            write_fd: fds[1],
        };
        set_nonblocking(notifier.read_fd).map_err(NetError::Os)?;
        set_nonblocking(notifier.write_fd).map_err(NetError::Os)?;
        Ok(notifier)
    }
}

impl Notifier for PipeNotifier {
    fn notify(&self) -> NetResult<()> {
        let byte = 1u8;
        let ret = unsafe { libc::write(self.write_fd, &byte as *const u8 as *const libc::c_void, 1) };
        if ret < 0 {
            let e = errno();
            // Pipe full: reactor has plenty of wakeups queued.
            if e == libc::EAGAIN {
                return Ok(());
            }
            return Err(NetError::Os(e));
        }
        Ok(())
    }

    fn drain(&self) {
        let mut buf = [0u8; 64];
        loop {
            let n = unsafe {
                libc::read(self.read_fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len())
            };
            if n <= 0 {
                break;
            }
        }
    }

    fn fd(&self) -> RawSocket {
        self.read_fd
    }
}

impl Drop for PipeNotifier {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.read_fd);
            libc::close(self.write_fd);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pipe_notify_drain() {
        let n = PipeNotifier::create().unwrap();
        for _ in 0..100 {
            n.notify().unwrap();
        }
        let mut pfd = libc::pollfd { fd: n.fd(), events: libc::POLLIN, revents: 0 };
        assert_eq!(unsafe { libc::poll(&mut pfd, 1, 0) }, 1);
        n.drain();
        pfd.revents = 0;
        assert_eq!(unsafe { libc::poll(&mut pfd, 1, 0) }, 0);
    }
}
