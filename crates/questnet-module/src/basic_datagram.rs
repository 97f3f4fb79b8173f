//! `BasicDatagram` - default `ReliableDatagram` implementation.
//!
//! One frame per datagram, no acknowledgement or retransmission. An empty
//! datagram is a heartbeat: sent when nothing else went out for
//! `heartbeat_ms`, and counted as proof of life when received. The peer is
//! considered gone after `idle_limit_ms` without any datagram, or as soon as
//! the kernel reports ECONNREFUSED (ICMP port unreachable).

use std::collections::VecDeque;

use questnet_core::datagram::{DatagramRecv, ReliableDatagram};
use questnet_core::{kdebug, now_ms, ErrorCode, NetError, NetResult, RawSocket};

use crate::sys::{self, would_block};

const MAX_DATAGRAM: usize = 65_507;
const MAX_QUEUED: usize = 4096;

pub struct BasicDatagram {
    mtu: usize,
    idle_limit_ms: u64,
    heartbeat_ms: u64,
    queue: VecDeque<Vec<u8>>,
    last_recv_ms: u64,
    last_send_ms: u64,
    refused: bool,
    recv_buf: Vec<u8>,
}

impl BasicDatagram {
    pub fn new(mtu: usize, idle_limit_ms: u64, heartbeat_ms: u64) -> Self {
        let now = now_ms();
        Self {
            mtu: mtu.clamp(1, MAX_DATAGRAM),
            idle_limit_ms,
            heartbeat_ms,
            queue: VecDeque::new(),
            last_recv_ms: now,
            last_send_ms: now,
            refused: false,
            recv_buf: vec![0u8; MAX_DATAGRAM],
        }
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }
}

impl ReliableDatagram for BasicDatagram {
    fn enqueue(&mut self, frame: Vec<u8>, discardable: bool) -> NetResult<()> {
        if frame.len() > self.mtu {
            if discardable {
                kdebug!("discardable datagram of {} bytes over mtu {} dropped", frame.len(), self.mtu);
                return Ok(());
            }
            return Err(NetError::Codec(format!(
                "frame of {} bytes exceeds mtu {}",
                frame.len(),
                self.mtu
            )));
        }
        if self.queue.len() >= MAX_QUEUED {
            if discardable {
                return Ok(());
            }
            return Err(NetError::Code(ErrorCode::SendError));
        }
        self.queue.push_back(frame);
        Ok(())
    }

    fn flush(&mut self, socket: RawSocket, now_ms: u64) -> Result<bool, i32> {
        if self.queue.is_empty() && now_ms.saturating_sub(self.last_send_ms) >= self.heartbeat_ms {
            self.queue.push_back(Vec::new());
        }
        while let Some(front) = self.queue.front() {
            match sys::write(socket, front) {
                Ok(_) => {
                    self.queue.pop_front();
                    self.last_send_ms = now_ms;
                }
                Err(e) if would_block(e) => return Ok(true),
                Err(e) => {
                    if e == libc::ECONNREFUSED {
                        self.refused = true;
                    }
                    return Err(e);
                }
            }
        }
        Ok(false)
    }

    fn receive(&mut self, socket: RawSocket, now_ms: u64, out: &mut Vec<Vec<u8>>) -> DatagramRecv {
        loop {
            match sys::read(socket, &mut self.recv_buf) {
                Ok(n) => {
                    self.last_recv_ms = now_ms;
                    if n > 0 {
                        out.push(self.recv_buf[..n].to_vec());
                    }
                }
                Err(e) if would_block(e) => return DatagramRecv::Drained,
                Err(e) => {
                    if e == libc::ECONNREFUSED {
                        self.refused = true;
                    }
                    return DatagramRecv::Failed(e);
                }
            }
        }
    }

    fn is_alive(&self, now_ms: u64) -> bool {
        !self.refused && now_ms.saturating_sub(self.last_recv_ms) < self.idle_limit_ms
    }

    fn require_close(&self) -> bool {
        self.refused
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::UdpSocket;
    use std::time::Duration;

    #[test]
    fn test_enqueue_limits() {
        let mut d = BasicDatagram::new(8, 1000, 1000);
        assert!(d.enqueue(vec![0; 8], false).is_ok());
        assert!(d.enqueue(vec![0; 9], true).is_ok());
        assert!(d.enqueue(vec![0; 9], false).is_err());
        assert_eq!(d.queued(), 1);
    }

    #[test]
    fn test_flush_and_receive() {
        let peer = UdpSocket::bind("127.0.0.1:0").unwrap();
        peer.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
        let fd = sys::udp_connect(&peer.local_addr().unwrap()).unwrap();

        let mut d = BasicDatagram::new(1400, 60_000, 60_000);
        d.enqueue(b"one".to_vec(), false).unwrap();
        d.enqueue(b"two".to_vec(), false).unwrap();
        assert_eq!(d.flush(fd, now_ms()), Ok(false));

        let mut buf = [0u8; 64];
        let (n, from) = peer.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"one");
        let (n, _) = peer.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"two");

        peer.send_to(b"back", from).unwrap();
        peer.send_to(b"", from).unwrap();
        std::thread::sleep(Duration::from_millis(30));
        let mut frames = Vec::new();
        assert_eq!(d.receive(fd, now_ms(), &mut frames), DatagramRecv::Drained);
        assert_eq!(frames, vec![b"back".to_vec()]);
        assert!(d.is_alive(now_ms()));
        sys::close(fd);
    }

    #[test]
    fn test_heartbeat_when_idle() {
        let peer = UdpSocket::bind("127.0.0.1:0").unwrap();
        peer.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
        let fd = sys::udp_connect(&peer.local_addr().unwrap()).unwrap();
        let mut d = BasicDatagram::new(1400, 60_000, 0);
        assert_eq!(d.flush(fd, now_ms()), Ok(false));
        let mut buf = [0u8; 8];
        let (n, _) = peer.recv_from(&mut buf).unwrap();
        assert_eq!(n, 0);
        sys::close(fd);
    }

    #[test]
    fn test_idle_limit() {
        let d = BasicDatagram::new(1400, 100, 1000);
        let now = now_ms();
        assert!(d.is_alive(now));
        assert!(!d.is_alive(now + 1000));
        assert!(!d.require_close());
    }
}
