//! UDP client over the reliable-datagram layer.

use std::net::ToSocketAddrs;
use std::ops::Deref;
use std::sync::Arc;

use questnet_core::{NetResult, Transport};

use super::{resolve, ClientCore};
use crate::engine::ClientEngine;

/// Datagram client. Connecting only binds and connects the socket, so the
/// connected event fires right away; liveness comes from the datagram
/// layer's heartbeat.
pub struct UdpClient {
    core: Arc<ClientCore>,
    _engine: Arc<ClientEngine>,
}

impl UdpClient {
    /// Client on the process-wide engine.
    pub fn create<A: ToSocketAddrs>(endpoint: A) -> NetResult<Self> {
        Self::with_engine(&ClientEngine::global()?, endpoint)
    }

    pub fn with_engine<A: ToSocketAddrs>(engine: &Arc<ClientEngine>, endpoint: A) -> NetResult<Self> {
        let addr = resolve(endpoint)?;
        Ok(Self {
            core: ClientCore::new(engine.core().clone(), addr, Transport::Udp),
            _engine: engine.clone(),
        })
    }
}

impl Deref for UdpClient {
    type Target = ClientCore;

    fn deref(&self) -> &ClientCore {
        &self.core
    }
}

impl Drop for UdpClient {
    fn drop(&mut self) {
        self.core.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::tests::{wait_for, EventLog};
    use crate::engine::tests::test_config;
    use crate::testkit::LoopbackDatagramPeer;
    use questnet_core::{Answer, ConnStatus, ErrorCode, Quest};
    use std::time::Duration;

    #[test]
    fn test_quest_round_trip() {
        let engine = ClientEngine::start(test_config()).unwrap();
        let peer = LoopbackDatagramPeer::spawn(|q: &Quest| Some(Answer::for_quest(q, q.payload().to_vec()))).unwrap();
        let c = UdpClient::with_engine(&engine, peer.addr()).unwrap();
        let log = Arc::new(EventLog::default());
        c.set_quest_processor(log.clone());

        assert!(c.connect());
        assert_eq!(c.status(), ConnStatus::Connected);
        let q = Quest::new("echo", b"dgram".to_vec());
        let a = c.send_quest(&q, Some(Duration::from_secs(3))).unwrap();
        assert_eq!(a.payload(), b"dgram");
        assert!(wait_for(Duration::from_secs(2), || EventLog::get(&log.connected_ok) == 1));

        c.close();
        assert!(wait_for(Duration::from_secs(2), || EventLog::get(&log.will_close) == 1));
        engine.shutdown();
    }

    #[test]
    fn test_oversize_quest_fails() {
        let engine = ClientEngine::start(test_config().udp_mtu(64)).unwrap();
        let peer = LoopbackDatagramPeer::spawn(|q: &Quest| Some(Answer::for_quest(q, vec![]))).unwrap();
        let c = UdpClient::with_engine(&engine, peer.addr()).unwrap();
        assert!(c.connect());
        let a = c.send_quest(&Quest::new("big", vec![0u8; 256]), None).unwrap();
        assert_eq!(a.error_kind(), Some(ErrorCode::SendError));
        // One-way oversize quests are discardable and dropped quietly.
        assert!(c.send_quest(&Quest::one_way("big", vec![0u8; 256]), None).is_none());
        assert!(c.is_connected());
        engine.shutdown();
    }

    #[test]
    fn test_silent_peer_times_out() {
        let engine = ClientEngine::start(test_config()).unwrap();
        let peer = LoopbackDatagramPeer::spawn(|_q: &Quest| None).unwrap();
        let c = UdpClient::with_engine(&engine, peer.addr()).unwrap();
        let a = c.send_quest(&Quest::new("void", vec![]), Some(Duration::from_millis(100))).unwrap();
        assert_eq!(a.error_kind(), Some(ErrorCode::Timeout));
        assert!(wait_for(Duration::from_secs(2), || peer.received().len() == 1));
        engine.shutdown();
    }
}
