//! Connection identity.
//!
//! A [`ConnectionInfo`] is created once per physical connection and never
//! changes afterwards, except for the `encrypted` flag. A client that
//! reconnects gets a new info with a new `unique_id`, so stale callbacks can
//! be told apart from the live connection even when the kernel reuses the
//! descriptor number.

use core::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Socket descriptor as seen by the engine.
pub type RawSocket = i32;

static NEXT_UNIQUE_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Transport {
    Tcp,
    Udp,
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Transport::Tcp => write!(f, "tcp"),
            Transport::Udp => write!(f, "udp"),
        }
    }
}

/// Copyable identity of one physical connection: descriptor plus unique id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionToken {
    pub socket: RawSocket,
    pub unique_id: u64,
}

#[derive(Debug)]
pub struct ConnectionInfo {
    socket: RawSocket,
    addr: SocketAddr,
    unique_id: u64,
    transport: Transport,
    private: bool,
    encrypted: AtomicBool,
}

impl ConnectionInfo {
    pub fn new(socket: RawSocket, addr: SocketAddr, transport: Transport) -> Self {
        Self {
            socket,
            addr,
            unique_id: NEXT_UNIQUE_ID.fetch_add(1, Ordering::Relaxed),
            transport,
            private: is_private_ip(addr.ip()),
            encrypted: AtomicBool::new(false),
        }
    }

    /// Info describing an endpoint with no socket yet (socket 0).
    pub fn placeholder(addr: SocketAddr, transport: Transport) -> Self {
        Self::new(0, addr, transport)
    }

    #[inline]
    pub fn socket(&self) -> RawSocket {
        self.socket
    }

    #[inline]
    pub fn unique_id(&self) -> u64 {
        self.unique_id
    }

    #[inline]
    pub fn token(&self) -> ConnectionToken {
        ConnectionToken {
            socket: self.socket,
            unique_id: self.unique_id,
        }
    }

    #[inline]
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn ip(&self) -> IpAddr {
        self.addr.ip()
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn is_ipv4(&self) -> bool {
        self.addr.is_ipv4()
    }

    #[inline]
    pub fn transport(&self) -> Transport {
        self.transport
    }

    pub fn is_tcp(&self) -> bool {
        self.transport == Transport::Tcp
    }

    /// Loopback, RFC1918, link-local and IPv6 unique-local addresses.
    pub fn is_private_address(&self) -> bool {
        self.private
    }

    pub fn is_encrypted(&self) -> bool {
        self.encrypted.load(Ordering::Acquire)
    }

    pub fn set_encrypted(&self) {
        self.encrypted.store(true, Ordering::Release);
    }

    /// "host:port" string.
    pub fn endpoint(&self) -> String {
        self.addr.to_string()
    }
}

impl fmt::Display for ConnectionInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} socket {} id {}",
            self.transport, self.addr, self.socket, self.unique_id
        )
    }
}

fn is_private_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_loopback() || v4.is_private() || v4.is_link_local(),
        IpAddr::V6(v6) => {
            let first = v6.segments()[0];
            v6.is_loopback() || (first & 0xfe00) == 0xfc00 || (first & 0xffc0) == 0xfe80
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_unique_ids_increase() {
        let a = ConnectionInfo::new(5, addr("127.0.0.1:80"), Transport::Tcp);
        let b = ConnectionInfo::new(5, addr("127.0.0.1:80"), Transport::Tcp);
        assert!(b.unique_id() > a.unique_id());
        assert_ne!(a.token(), b.token());
        assert_eq!(a.token().socket, b.token().socket);
    }

    #[test]
    fn test_private_address() {
        let cases = [
            ("127.0.0.1:1", true),
            ("10.1.2.3:1", true),
            ("192.168.0.9:1", true),
            ("172.16.4.4:1", true),
            ("169.254.1.1:1", true),
            ("8.8.8.8:1", false),
            ("[::1]:1", true),
            ("[fd00::1]:1", true),
            ("[fe80::1]:1", true),
            ("[2001:db8::1]:1", false),
        ];
        for (s, private) in cases {
            let info = ConnectionInfo::placeholder(addr(s), Transport::Udp);
            assert_eq!(info.is_private_address(), private, "{}", s);
        }
    }

    #[test]
    fn test_encrypted_flag_and_display() {
        let info = ConnectionInfo::new(9, addr("127.0.0.1:7000"), Transport::Tcp);
        assert!(!info.is_encrypted());
        info.set_encrypted();
        assert!(info.is_encrypted());
        assert!(info.to_string().starts_with("tcp 127.0.0.1:7000 socket 9"));
        assert_eq!(info.endpoint(), "127.0.0.1:7000");
        assert!(info.is_ipv4());
    }
}
