//! `EventFdNotifier` - default `Notifier` on Linux.
//!
//! Writes 1 to an eventfd to wake the reactor. Multiple `notify()` calls
//! before the reactor reads coalesce into one readable event (counter
//! semantics); one 8-byte read drains it.

use questnet_core::notifier::Notifier;
use questnet_core::{NetError, NetResult, RawSocket};

use crate::sys::errno;

pub struct EventFdNotifier {
    fd: RawSocket,
}

impl EventFdNotifier {
    /// Create a new nonblocking eventfd. The notifier closes it on drop.
    pub fn create() -> NetResult<Self> {
        let fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        if fd < 0 {
            return Err(NetError::Os(errno()));
        }
        Ok(Self { fd })
    }
}

impl Notifier for EventFdNotifier {
    fn notify(&self) -> NetResult<()> {
        let val: u64 = 1;
        let ret = unsafe {
            libc::write(
                self.fd,
                &val as *const u64 as *const libc::c_void,
                std::mem::size_of::<u64>(),
            )
        };
        if ret < 0 {
            let e = errno();
            // Counter saturated: a wakeup is already pending.
            if e == libc::EAGAIN {
                return Ok(());
            }
            return Err(NetError::Os(e));
        }
        Ok(())
    }

    fn drain(&self) {
        let mut val: u64 = 0;
        unsafe {
            libc::read(
                self.fd,
                &mut val as *mut u64 as *mut libc::c_void,
                std::mem::size_of::<u64>(),
            );
        }
    }

    fn fd(&self) -> RawSocket {
        self.fd
    }
}

impl Drop for EventFdNotifier {
    fn drop(&mut self) {
        if self.fd >= 0 {
            unsafe {
                libc::close(self.fd);
            }
            self.fd = -1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn readable(fd: RawSocket) -> bool {
        let mut pfd = libc::pollfd { fd, events: libc::POLLIN, revents: 0 };
        unsafe { libc::poll(&mut pfd, 1, 0) == 1 }
    }

    #[test]
    fn test_notify_coalesces_and_drains() {
        let n = EventFdNotifier::create().unwrap();
        assert!(!readable(n.fd()));
        n.notify().unwrap();
        n.notify().unwrap();
        n.notify().unwrap();
        assert!(readable(n.fd()));
        n.drain();
        assert!(!readable(n.fd()));
    }
}
