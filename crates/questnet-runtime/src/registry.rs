//! Connection registry: socket -> connection.
//!
//! The mutex guards membership only. Sweeps collect what they find under one
//! critical section and hand it back; every callback, close event and socket
//! write happens after the lock is released.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

use questnet_core::{ConnectionInfo, ConnectionToken, RawSocket};

use crate::connection::{Connection, Pinned};
use crate::correlator::PendingCallback;
use crate::keepalive::KeepAliveAction;

/// Outcome of one TCP keepalive pass.
#[derive(Default)]
pub struct KeepAliveSweep {
    /// Silent past the unreceived threshold. Already removed.
    pub lost: Vec<Arc<Connection>>,
    /// Connect deadline passed before the socket connected. Already removed.
    pub connect_expired: Vec<Arc<Connection>>,
    /// Due a ping, with the ping timeout in milliseconds.
    pub pings: Vec<(Pinned, u64)>,
}

/// Outcome of one UDP pass.
#[derive(Default)]
pub struct DatagramSweep {
    /// Dead or refused. Already removed.
    pub invalid: Vec<Arc<Connection>>,
    /// Still alive; flushed by the caller.
    pub live: Vec<Pinned>,
}

pub struct Registry {
    map: Mutex<HashMap<RawSocket, Arc<Connection>>>,
    capacity: usize,
}

impl Registry {
    pub fn new(capacity: usize) -> Self {
        Self {
            map: Mutex::new(HashMap::new()),
            capacity,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<RawSocket, Arc<Connection>>> {
        match self.map.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Fails when full or when the descriptor is already registered.
    pub fn insert(&self, conn: Arc<Connection>) -> bool {
        let mut map = self.lock();
        if map.len() >= self.capacity || map.contains_key(&conn.socket()) {
            return false;
        }
        map.insert(conn.socket(), conn);
        true
    }

    pub fn take(&self, fd: RawSocket) -> Option<Arc<Connection>> {
        self.lock().remove(&fd)
    }

    /// Remove only if the registered connection is the one `token` names.
    pub fn take_token(&self, token: ConnectionToken) -> Option<Arc<Connection>> {
        let mut map = self.lock();
        match map.get(&token.socket) {
            Some(c) if c.info().unique_id() == token.unique_id => map.remove(&token.socket),
            _ => None,
        }
    }

    /// Pin the connection on `fd` for use outside the lock.
    pub fn sign(&self, fd: RawSocket) -> Option<Pinned> {
        self.lock().get(&fd).map(|c| Pinned::new(c.clone()))
    }

    pub fn sign_token(&self, token: ConnectionToken) -> Option<Pinned> {
        self.lock()
            .get(&token.socket)
            .filter(|c| c.info().unique_id() == token.unique_id)
            .map(|c| Pinned::new(c.clone()))
    }

    pub fn take_callback(&self, fd: RawSocket, seq: u32) -> Option<PendingCallback> {
        let map = self.lock();
        map.get(&fd).and_then(|c| c.correlator().take(seq))
    }

    /// Pull every expired correlator entry, tagged with its connection.
    pub fn extract_expired_callbacks(&self, now_ms: u64, out: &mut Vec<(Arc<ConnectionInfo>, PendingCallback)>) {
        let map = self.lock();
        let mut batch = Vec::new();
        for conn in map.values() {
            conn.correlator().extract_expired(now_ms, &mut batch);
            out.extend(batch.drain(..).map(|cb| (conn.info().clone(), cb)));
        }
    }

    pub fn tcp_keepalive_sweep(&self, now_ms: u64) -> KeepAliveSweep {
        let mut sweep = KeepAliveSweep::default();
        let mut map = self.lock();
        let mut remove: Vec<(RawSocket, bool)> = Vec::new();

        for (fd, conn) in map.iter() {
            let Some(tcp) = conn.tcp() else { continue };
            if conn.is_socket_connected() {
                let Some(ka) = tcp.keepalive() else { continue };
                match ka.check(now_ms) {
                    KeepAliveAction::Idle => {}
                    KeepAliveAction::Ping(timeout_ms) => sweep.pings.push((Pinned::new(conn.clone()), timeout_ms)),
                    KeepAliveAction::Lost => remove.push((*fd, true)),
                }
            } else if conn.connect_deadline_ms() > 0 && conn.connect_deadline_ms() <= now_ms {
                remove.push((*fd, false));
            }
        }

        for (fd, lost) in remove {
            if let Some(conn) = map.remove(&fd) {
                if lost {
                    sweep.lost.push(conn);
                } else {
                    sweep.connect_expired.push(conn);
                }
            }
        }
        sweep
    }

    pub fn udp_sweep(&self, now_ms: u64) -> DatagramSweep {
        let mut sweep = DatagramSweep::default();
        let mut map = self.lock();
        let mut invalid = Vec::new();

        for (fd, conn) in map.iter() {
            let Some(udp) = conn.udp() else { continue };
            if udp.is_valid(now_ms) {
                sweep.live.push(Pinned::new(conn.clone()));
            } else {
                invalid.push(*fd);
            }
        }
        for fd in invalid {
            if let Some(conn) = map.remove(&fd) {
                sweep.invalid.push(conn);
            }
        }
        sweep
    }

    /// Sockets the reactor should watch: those with I/O enabled plus those
    /// waiting on write readiness (connecting sockets).
    pub fn poll_targets(&self, want_write: &HashSet<RawSocket>, out: &mut Vec<RawSocket>) {
        out.clear();
        let map = self.lock();
        out.extend(
            map.iter()
                .filter(|(fd, c)| c.is_io_enabled() || want_write.contains(*fd))
                .map(|(fd, _)| *fd),
        );
    }

    pub fn all_sockets(&self) -> Vec<RawSocket> {
        self.lock().keys().copied().collect()
    }

    pub fn take_all(&self) -> Vec<Arc<Connection>> {
        self.lock().drain().map(|(_, c)| c).collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sleep in short steps until empty or `limit` passes.
    pub fn wait_for_empty(&self, limit: Duration) -> bool {
        let deadline = Instant::now() + limit;
        loop {
            if self.is_empty() {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(Duration::from_millis(20));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ConnectionSetup;
    use crate::correlator::SyncSlot;
    use crate::keepalive::{KeepAlive, KeepAliveParams};
    use questnet_core::Transport;
    use questnet_module::BasicDatagram;
    use std::net::SocketAddr;

    fn addr() -> SocketAddr {
        "127.0.0.1:9".parse().unwrap()
    }

    // Negative descriptors keep `Drop` from closing anything real.
    fn tcp(fd: RawSocket, deadline: u64, ka: Option<KeepAlive>) -> Arc<Connection> {
        Arc::new(Connection::new_tcp(
            ConnectionInfo::new(fd, addr(), Transport::Tcp),
            ConnectionSetup {
                connect_deadline_ms: deadline,
                ..Default::default()
            },
            1024,
            ka,
        ))
    }

    #[test]
    fn test_capacity_and_duplicates() {
        let reg = Registry::new(2);
        assert!(reg.insert(tcp(-1, 0, None)));
        assert!(!reg.insert(tcp(-1, 0, None)));
        assert!(reg.insert(tcp(-2, 0, None)));
        assert!(!reg.insert(tcp(-3, 0, None)));
        assert_eq!(reg.len(), 2);
    }

    #[test]
    fn test_take_token_checks_identity() {
        let reg = Registry::new(8);
        let old = tcp(-5, 0, None);
        let stale = old.token();
        assert!(reg.insert(old));
        reg.take(-5).unwrap();
        let fresh = tcp(-5, 0, None);
        assert!(reg.insert(fresh.clone()));
        assert!(reg.take_token(stale).is_none());
        assert!(reg.sign_token(stale).is_none());
        assert!(reg.take_token(fresh.token()).is_some());
        assert!(reg.is_empty());
    }

    #[test]
    fn test_sign_pins() {
        let reg = Registry::new(8);
        let conn = tcp(-1, 0, None);
        reg.insert(conn.clone());
        let pin = reg.sign(-1).unwrap();
        assert_eq!(conn.pins(), 1);
        drop(pin);
        assert_eq!(conn.pins(), 0);
        assert!(reg.sign(-2).is_none());
    }

    #[test]
    fn test_expired_callbacks_across_connections() {
        let reg = Registry::new(8);
        let a = tcp(-1, 0, None);
        let b = tcp(-2, 0, None);
        a.correlator().insert(1, PendingCallback::Sync(SyncSlot::new()), 10).unwrap();
        a.correlator().insert(2, PendingCallback::Sync(SyncSlot::new()), 1000).unwrap();
        b.correlator().insert(1, PendingCallback::Sync(SyncSlot::new()), 20).unwrap();
        reg.insert(a.clone());
        reg.insert(b);
        let mut out = Vec::new();
        reg.extract_expired_callbacks(100, &mut out);
        assert_eq!(out.len(), 2);
        assert!(reg.take_callback(-1, 2).is_some());
        assert!(reg.take_callback(-1, 1).is_none());
    }

    #[test]
    fn test_keepalive_sweep() {
        let reg = Registry::new(8);
        let params = KeepAliveParams {
            ping_timeout: Duration::from_millis(100),
            ping_interval: Duration::from_millis(1000),
            max_ping_retry: 2,
        };

        let lost = tcp(-1, 0, Some(KeepAlive::new(params, Duration::from_secs(1), 0)));
        lost.mark_socket_connected();
        let pinged = tcp(-2, 0, Some(KeepAlive::new(params, Duration::from_secs(1), 3_900)));
        pinged.mark_socket_connected();
        let connecting = tcp(-3, 4_000, None);
        let waiting = tcp(-4, 9_000, None);
        for c in [&lost, &pinged, &connecting, &waiting] {
            reg.insert((*c).clone());
        }

        let sweep = reg.tcp_keepalive_sweep(5_000);
        assert_eq!(sweep.lost.len(), 1);
        assert_eq!(sweep.lost[0].socket(), -1);
        assert_eq!(sweep.connect_expired.len(), 1);
        assert_eq!(sweep.connect_expired[0].socket(), -3);
        assert_eq!(sweep.pings.len(), 1);
        assert_eq!(sweep.pings[0].1, 100);
        assert_eq!(pinged.pins(), 1);
        assert_eq!(reg.len(), 2);
    }

    #[test]
    fn test_udp_sweep_and_poll_targets() {
        let reg = Registry::new(8);
        let udp = Arc::new(Connection::new_udp(
            ConnectionInfo::new(-7, addr(), Transport::Udp),
            ConnectionSetup::default(),
            Box::new(BasicDatagram::new(1400, 50, 20)),
        ));
        reg.insert(udp.clone());
        reg.insert(tcp(-8, 0, None));
        reg.insert(tcp(-9, 0, None));

        let mut want = HashSet::new();
        want.insert(-9);
        let mut targets = Vec::new();
        reg.poll_targets(&want, &mut targets);
        targets.sort();
        assert_eq!(targets, vec![-9, -7]);

        let sweep = reg.udp_sweep(questnet_core::now_ms());
        assert_eq!(sweep.live.len(), 1);
        assert!(sweep.invalid.is_empty());
        drop(sweep);

        let sweep = reg.udp_sweep(questnet_core::now_ms() + 10_000);
        assert_eq!(sweep.invalid.len(), 1);
        assert_eq!(reg.len(), 2);
    }

    #[test]
    fn test_wait_for_empty() {
        let reg = Arc::new(Registry::new(8));
        reg.insert(tcp(-1, 0, None));
        assert!(!reg.wait_for_empty(Duration::from_millis(30)));
        let r = reg.clone();
        let t = thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            r.take_all();
        });
        assert!(reg.wait_for_empty(Duration::from_secs(2)));
        t.join().unwrap();
    }
}
