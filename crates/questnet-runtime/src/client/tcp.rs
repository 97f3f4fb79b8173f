//! TCP client.

use std::net::ToSocketAddrs;
use std::ops::Deref;
use std::sync::Arc;
use std::time::Duration;

use questnet_core::{CipherMode, CipherSuite, KeyExchange, NetResult, Transport};

use super::{resolve, ClientCore};
use crate::engine::ClientEngine;

/// Stream client with optional keepalive and encryption.
///
/// Dropping the client closes its connection.
pub struct TcpClient {
    core: Arc<ClientCore>,
    _engine: Arc<ClientEngine>,
}

impl TcpClient {
    /// Client on the process-wide engine.
    pub fn create<A: ToSocketAddrs>(endpoint: A) -> NetResult<Self> {
        Self::with_engine(&ClientEngine::global()?, endpoint)
    }

    pub fn with_engine<A: ToSocketAddrs>(engine: &Arc<ClientEngine>, endpoint: A) -> NetResult<Self> {
        let addr = resolve(endpoint)?;
        Ok(Self {
            core: ClientCore::new(engine.core().clone(), addr, Transport::Tcp),
            _engine: engine.clone(),
        })
    }

    pub fn keep_alive(&self) -> bool {
        self.core.keep_alive()
    }

    /// Takes effect on the next connect.
    pub fn set_keep_alive(&self, enable: bool) {
        self.core.set_keep_alive(enable);
    }

    /// Zero uses the client's quest timeout.
    pub fn set_keep_alive_ping_timeout(&self, timeout: Duration) {
        self.core.update_keep_alive(|p| p.ping_timeout = timeout);
    }

    pub fn set_keep_alive_interval(&self, interval: Duration) {
        self.core.update_keep_alive(|p| p.ping_interval = interval);
    }

    pub fn set_keep_alive_max_ping_retry(&self, retry: u32) {
        self.core.update_keep_alive(|p| p.max_ping_retry = retry);
    }

    pub fn keep_alive_params(&self) -> crate::keepalive::KeepAliveParams {
        self.core.keep_alive_params()
    }

    /// Encrypt every connection made from now on. The `*key` quest goes out
    /// in clear first; the peer rejecting it closes the connection.
    pub fn enable_encryption(&self, exchange: Arc<dyn KeyExchange>, suite: Arc<dyn CipherSuite>, mode: CipherMode) {
        self.core.set_encryption(exchange, suite, mode);
    }
}

impl Deref for TcpClient {
    type Target = ClientCore;

    fn deref(&self) -> &ClientCore {
        &self.core
    }
}

impl Drop for TcpClient {
    fn drop(&mut self) {
        self.core.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::tests::{wait_for, EventLog};
    use crate::connection::RawFrameHandler;
    use crate::correlator::AnswerCallback;
    use crate::engine::tests::test_config;
    use crate::testkit::{stall_connect, LoopbackPeer};
    use questnet_core::{Answer, Codec, ConnStatus, ConnectionInfo, ErrorCode, Quest, QuestContext, QuestProcessor};
    use questnet_module::{BinaryCodec, ChaChaSuite, PresharedExchange};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;
    use std::sync::Mutex;
    use std::time::Instant;

    fn echo_peer() -> LoopbackPeer {
        LoopbackPeer::spawn(|q: &Quest| Some(Answer::for_quest(q, q.payload().to_vec()))).unwrap()
    }

    fn client(engine: &Arc<ClientEngine>, peer: &LoopbackPeer) -> (TcpClient, Arc<EventLog>) {
        let c = TcpClient::with_engine(engine, peer.addr()).unwrap();
        let log = Arc::new(EventLog::default());
        c.set_quest_processor(log.clone());
        (c, log)
    }

    #[test]
    fn test_answer_arrives() {
        let engine = ClientEngine::start(test_config()).unwrap();
        let peer = echo_peer();
        let (c, log) = client(&engine, &peer);
        assert!(c.connect());
        let q = Quest::new("echo", b"hello".to_vec());
        let answer = c.send_quest(&q, Some(Duration::from_secs(5))).unwrap();
        assert_eq!(answer.seq(), q.seq());
        assert_eq!(answer.payload(), b"hello");
        assert!(wait_for(Duration::from_secs(2), || EventLog::get(&log.connected_ok) == 1));

        c.close();
        c.close();
        assert!(wait_for(Duration::from_secs(2), || EventLog::get(&log.will_close) == 1));
        assert_eq!(EventLog::get(&log.connected_failed), 0);
        assert_eq!(EventLog::get(&log.closed_by_error), 0);
        engine.shutdown();
    }

    #[test]
    fn test_timeout_answer() {
        let engine = ClientEngine::start(test_config()).unwrap();
        let peer = LoopbackPeer::spawn(|_q: &Quest| None).unwrap();
        let (c, _log) = client(&engine, &peer);
        let q = Quest::new("silent", vec![]);
        let started = Instant::now();
        let answer = c.send_quest(&q, Some(Duration::from_millis(100))).unwrap();
        assert_eq!(answer.error_kind(), Some(ErrorCode::Timeout));
        assert!(started.elapsed() < Duration::from_secs(2));
        engine.shutdown();
    }

    #[test]
    fn test_close_before_connect_completes_only_cancels() {
        let engine = ClientEngine::start(test_config()).unwrap();
        let c = TcpClient::with_engine(&engine, "127.0.0.1:9").unwrap();
        let log = Arc::new(EventLog::default());
        c.set_quest_processor(log.clone());
        c.set_auto_reconnect(false);
        c.set_connect_timeout(Duration::from_secs(30));

        let _stalled = stall_connect(&c).unwrap();
        assert_eq!(c.status(), ConnStatus::Connecting);
        let (tx, rx) = mpsc::channel();
        assert!(c.send_quest_async(
            Quest::new("queued", vec![]),
            move |r| {
                let _ = tx.send(r);
            },
            None,
        ));
        std::thread::sleep(Duration::from_millis(100));
        assert_eq!(c.status(), ConnStatus::Connecting);
        assert_eq!(EventLog::get(&log.connected_failed), 0);

        c.close();
        assert_eq!(c.status(), ConnStatus::NotConnected);

        let result = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert!(result.is_err());
        assert!(wait_for(Duration::from_secs(2), || EventLog::get(&log.connected_failed) == 1));
        std::thread::sleep(Duration::from_millis(100));
        assert_eq!(EventLog::get(&log.connected_failed), 1);
        assert_eq!(EventLog::get(&log.connected_ok), 0);
        assert_eq!(EventLog::get(&log.will_close), 0);
        engine.shutdown();
    }

    #[test]
    fn test_one_way_sends_flush_in_order() {
        let engine = ClientEngine::start(test_config()).unwrap();
        let peer = echo_peer();
        let (c, _log) = client(&engine, &peer);
        assert!(c.connect());
        for i in 0u32..1000 {
            assert!(c.send_quest_async(Quest::one_way("seq", i.to_le_bytes().to_vec()), |_| {}, None));
        }
        assert!(wait_for(Duration::from_secs(5), || peer.received().len() >= 1000));
        let got: Vec<u32> = peer
            .received()
            .iter()
            .filter(|q| q.method() == "seq")
            .map(|q| u32::from_le_bytes([q.payload()[0], q.payload()[1], q.payload()[2], q.payload()[3]]))
            .collect();
        assert_eq!(got, (0..1000).collect::<Vec<_>>());
        engine.shutdown();
    }

    #[test]
    fn test_cached_quests_flush_on_connect() {
        let engine = ClientEngine::start(test_config()).unwrap();
        let peer = echo_peer();
        let (c, _log) = client(&engine, &peer);
        let (tx, rx) = mpsc::channel();
        assert!(c.async_connect());
        for i in 0..5u8 {
            let tx = tx.clone();
            assert!(c.send_quest_async(
                Quest::new("echo", vec![i]),
                move |r| {
                    let _ = tx.send(r);
                },
                None
            ));
        }
        let mut payloads: Vec<u8> = (0..5)
            .map(|_| rx.recv_timeout(Duration::from_secs(5)).unwrap().unwrap().payload()[0])
            .collect();
        payloads.sort();
        assert_eq!(payloads, vec![0, 1, 2, 3, 4]);
        engine.shutdown();
    }

    #[test]
    fn test_connect_refused_reports_failure_once() {
        let engine = ClientEngine::start(test_config()).unwrap();
        let addr = {
            let l = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            l.local_addr().unwrap()
        };
        let c = TcpClient::with_engine(&engine, addr).unwrap();
        let log = Arc::new(EventLog::default());
        c.set_quest_processor(log.clone());
        c.set_auto_reconnect(false);
        assert!(!c.connect());
        assert!(wait_for(Duration::from_secs(2), || EventLog::get(&log.connected_failed) == 1));

        let answer = c.send_quest(&Quest::new("x", vec![]), None).unwrap();
        assert_eq!(answer.error_kind(), Some(ErrorCode::ConnectionClosed));
        std::thread::sleep(Duration::from_millis(100));
        assert_eq!(EventLog::get(&log.connected_failed), 1);
        assert_eq!(EventLog::get(&log.will_close), 0);
        engine.shutdown();
    }

    #[test]
    fn test_auto_reconnect_after_peer_close() {
        let engine = ClientEngine::start(test_config()).unwrap();
        let peer = echo_peer();
        let (c, log) = client(&engine, &peer);
        assert!(c.connect());
        let first = c.connection_info().unique_id();
        peer.close_all();
        assert!(wait_for(Duration::from_secs(3), || !c.is_connected()));
        assert!(wait_for(Duration::from_secs(2), || EventLog::get(&log.will_close) == 1));

        let answer = c.send_quest(&Quest::new("echo", b"again".to_vec()), None).unwrap();
        assert_eq!(answer.payload(), b"again");
        assert_ne!(c.connection_info().unique_id(), first);
        engine.shutdown();
    }

    #[test]
    fn test_concurrent_sync_senders_with_close() {
        let engine = ClientEngine::start(test_config().max_task_threads(8)).unwrap();
        let peer = LoopbackPeer::spawn(|q: &Quest| {
            std::thread::sleep(Duration::from_millis(2));
            Some(Answer::for_quest(q, q.payload().to_vec()))
        })
        .unwrap();
        let c = Arc::new(TcpClient::with_engine(&engine, peer.addr()).unwrap());
        c.set_auto_reconnect(false);
        assert!(c.connect());

        let done = Arc::new(AtomicUsize::new(0));
        let mut threads = Vec::new();
        for t in 0..8u8 {
            let c = c.clone();
            let done = done.clone();
            threads.push(std::thread::spawn(move || {
                for i in 0..50u8 {
                    let q = Quest::new("echo", vec![t, i]);
                    let a = c.send_quest(&q, Some(Duration::from_secs(5))).unwrap();
                    assert_eq!(a.seq(), q.seq());
                    if !a.is_error() {
                        assert_eq!(a.payload(), &[t, i]);
                    }
                    done.fetch_add(1, Ordering::SeqCst);
                }
            }));
        }
        std::thread::sleep(Duration::from_millis(50));
        c.close();
        for t in threads {
            t.join().unwrap();
        }
        assert_eq!(done.load(Ordering::SeqCst), 400);
        engine.shutdown();
    }

    struct Recorder(Mutex<Vec<Result<Vec<u8>, u32>>>);

    struct Handler(Arc<Recorder>);

    impl AnswerCallback for Handler {
        fn on_answer(self: Box<Self>, answer: Answer) {
            self.0 .0.lock().unwrap().push(Ok(answer.into_payload()));
        }

        fn on_exception(self: Box<Self>, _answer: Option<Answer>, error_code: u32) {
            self.0 .0.lock().unwrap().push(Err(error_code));
        }
    }

    #[test]
    fn test_handler_callbacks() {
        let engine = ClientEngine::start(test_config()).unwrap();
        let peer = LoopbackPeer::spawn(|q: &Quest| match q.method() {
            "fail" => Some(Answer::error_raw(q.seq(), 777, "nope")),
            _ => Some(Answer::for_quest(q, b"ok".to_vec())),
        })
        .unwrap();
        let (c, _log) = client(&engine, &peer);
        assert!(c.connect());
        let rec = Arc::new(Recorder(Mutex::new(Vec::new())));
        assert!(c.send_quest_with(Quest::new("good", vec![]), Box::new(Handler(rec.clone())), None));
        assert!(wait_for(Duration::from_secs(3), || rec.0.lock().unwrap().len() == 1));
        assert!(c.send_quest_with(Quest::new("fail", vec![]), Box::new(Handler(rec.clone())), None));
        assert!(wait_for(Duration::from_secs(3), || rec.0.lock().unwrap().len() == 2));
        let got = rec.0.lock().unwrap().clone();
        assert_eq!(got, vec![Ok(b"ok".to_vec()), Err(777)]);
        engine.shutdown();
    }

    fn key_exchange() -> Arc<PresharedExchange> {
        Arc::new(PresharedExchange::new(
            b"test-key".to_vec(),
            b"0123456789abcdef0123456789abcdef".to_vec(),
            b"fedcba9876543210".to_vec(),
        ))
    }

    fn encrypted_round_trip(mode: CipherMode) {
        let engine = ClientEngine::start(test_config()).unwrap();
        let peer = LoopbackPeer::builder()
            .encrypted(b"0123456789abcdef0123456789abcdef".to_vec(), b"fedcba9876543210".to_vec())
            .spawn(|q: &Quest| Some(Answer::for_quest(q, q.payload().to_vec())))
            .unwrap();
        let (c, log) = client(&engine, &peer);
        c.enable_encryption(key_exchange(), Arc::new(ChaChaSuite), mode);
        assert!(c.connect());
        assert!(c.connection_info().is_encrypted());
        for i in 0..20u8 {
            let a = c
                .send_quest(&Quest::new("echo", vec![i; 100]), Some(Duration::from_secs(5)))
                .unwrap();
            assert_eq!(a.payload(), &[i; 100][..]);
        }
        assert_eq!(peer.key_handshakes().len(), 1);
        assert_eq!(peer.key_handshakes()[0].mode(), mode);
        assert_eq!(peer.key_handshakes()[0].public_key, b"test-key".to_vec());
        assert_eq!(EventLog::get(&log.connected_ok), 1);
        engine.shutdown();
    }

    #[test]
    fn test_encrypted_stream_mode() {
        encrypted_round_trip(CipherMode::Stream);
    }

    #[test]
    fn test_encrypted_package_mode() {
        encrypted_round_trip(CipherMode::Package);
    }

    #[test]
    fn test_rejected_key_closes_connection() {
        let engine = ClientEngine::start(test_config()).unwrap();
        let peer = LoopbackPeer::builder()
            .encrypted(b"0123456789abcdef0123456789abcdef".to_vec(), b"fedcba9876543210".to_vec())
            .reject_keys()
            .spawn(|q: &Quest| Some(Answer::for_quest(q, vec![])))
            .unwrap();
        let (c, _log) = client(&engine, &peer);
        c.set_auto_reconnect(false);
        c.enable_encryption(key_exchange(), Arc::new(ChaChaSuite), CipherMode::Package);
        c.connect();
        assert!(wait_for(Duration::from_secs(3), || c.status() == ConnStatus::NotConnected));
        engine.shutdown();
    }

    struct Pusher {
        seen: Mutex<Vec<Quest>>,
    }

    impl QuestProcessor for Pusher {
        fn process(&self, ctx: &QuestContext, quest: &Quest) -> Option<Answer> {
            self.seen.lock().unwrap().push(quest.clone());
            if quest.method() == "later" {
                let reply = ctx.async_answer()?;
                std::thread::spawn(move || reply.send(b"late".to_vec()));
                return None;
            }
            Some(Answer::for_quest(quest, b"pong".to_vec()))
        }
    }

    #[test]
    fn test_server_pushed_quests() {
        let engine = ClientEngine::start(test_config()).unwrap();
        let peer = echo_peer();
        let c = TcpClient::with_engine(&engine, peer.addr()).unwrap();
        let pusher = Arc::new(Pusher { seen: Mutex::new(Vec::new()) });
        c.set_quest_processor(pusher.clone());
        assert!(c.connect());

        let a = peer.push(Quest::new("ping-me", vec![]), Duration::from_secs(3)).unwrap();
        assert_eq!(a.payload(), b"pong");
        let a = peer.push(Quest::new("later", vec![]), Duration::from_secs(3)).unwrap();
        assert_eq!(a.payload(), b"late");
        assert_eq!(pusher.seen.lock().unwrap().len(), 2);
        engine.shutdown();
    }

    #[test]
    fn test_raw_receiver_gets_frames_undecoded() {
        let engine = ClientEngine::start(test_config()).unwrap();
        let peer = echo_peer();
        let c = TcpClient::with_engine(&engine, peer.addr()).unwrap();
        let pusher = Arc::new(Pusher { seen: Mutex::new(Vec::new()) });
        c.set_quest_processor(pusher.clone());
        let frames: Arc<Mutex<Vec<(u64, Vec<u8>)>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = frames.clone();
        let handler: Arc<RawFrameHandler> = Arc::new(move |info: &ConnectionInfo, bytes: &[u8]| {
            sink.lock().unwrap().push((info.unique_id(), bytes.to_vec()));
            true
        });
        c.set_raw_receiver(Some(handler));
        assert!(c.connect());

        let quest = Quest::one_way("raw-push", b"opaque".to_vec());
        let expected = BinaryCodec::new().encode_quest(&quest).unwrap();
        assert!(peer.push(quest, Duration::from_secs(1)).is_none());
        assert!(wait_for(Duration::from_secs(3), || frames.lock().unwrap().len() == 1));

        let got = frames.lock().unwrap().clone();
        assert_eq!(got[0].0, c.connection_info().unique_id());
        assert_eq!(got[0].1, expected);
        assert!(pusher.seen.lock().unwrap().is_empty());
        assert!(c.is_connected());
        engine.shutdown();
    }

    #[test]
    fn test_raw_receiver_rejection_closes() {
        let engine = ClientEngine::start(test_config()).unwrap();
        let peer = echo_peer();
        let (c, log) = client(&engine, &peer);
        c.set_auto_reconnect(false);
        let refuse: Arc<RawFrameHandler> = Arc::new(|_: &ConnectionInfo, _: &[u8]| false);
        c.set_raw_receiver(Some(refuse));
        assert!(c.connect());
        peer.push(Quest::one_way("refused", vec![]), Duration::from_secs(1));
        assert!(wait_for(Duration::from_secs(3), || !c.is_connected()));
        assert!(wait_for(Duration::from_secs(2), || EventLog::get(&log.closed_by_error) == 1));
        engine.shutdown();
    }

    #[test]
    fn test_keepalive_pings_idle_connection() {
        let engine = ClientEngine::start(test_config()).unwrap();
        let peer = echo_peer();
        let (c, log) = client(&engine, &peer);
        c.set_keep_alive(true);
        c.set_keep_alive_interval(Duration::from_millis(100));
        c.set_keep_alive_ping_timeout(Duration::from_millis(200));
        assert!(c.connect());
        assert!(wait_for(Duration::from_secs(3), || peer.pings() >= 2));
        assert!(c.is_connected());
        assert_eq!(EventLog::get(&log.will_close), 0);
        engine.shutdown();
    }

    #[test]
    fn test_keepalive_detects_silent_peer() {
        let engine = ClientEngine::start(test_config()).unwrap();
        let peer = LoopbackPeer::builder()
            .ignore_pings()
            .spawn(|q: &Quest| Some(Answer::for_quest(q, vec![])))
            .unwrap();
        let (c, log) = client(&engine, &peer);
        c.set_auto_reconnect(false);
        c.set_keep_alive(true);
        c.set_keep_alive_interval(Duration::from_millis(100));
        c.set_keep_alive_ping_timeout(Duration::from_millis(100));
        c.set_keep_alive_max_ping_retry(2);
        assert!(c.connect());
        assert!(wait_for(Duration::from_secs(3), || !c.is_connected()));
        assert!(wait_for(Duration::from_secs(2), || EventLog::get(&log.closed_by_error) == 1));
        engine.shutdown();
    }
}
