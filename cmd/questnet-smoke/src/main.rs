//! questnet End-to-End Smoke Test
//!
//! Drives a private engine against in-process loopback peers:
//!   Part A - Quests: answer, timeout, one-way ordering, async callbacks
//!   Part B - Lifecycle: close before connect, refused connect, reconnect
//!   Part C - Encryption: stream and package modes
//!   Part D - UDP and keepalive
//!
//! Run: ./target/release/questnet-smoke
//! Set QNET_LOG_LEVEL=debug for engine logs.

use questnet::testkit::{stall_connect, LoopbackDatagramPeer, LoopbackPeer};
use questnet::{
    Answer, ChaChaSuite, CipherMode, ClientEngine, ConnStatus, ConnectionInfo, EngineConfig, ErrorCode,
    PresharedExchange, Quest, QuestProcessor, TcpClient, UdpClient,
};

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::time::{Duration, Instant};

// ── Test harness ──

struct TestRunner {
    total: usize,
    passed: usize,
    failed: usize,
}

const LINE: &str = "────────────────────────────────────────────────────────────";

impl TestRunner {
    fn new() -> Self {
        Self { total: 0, passed: 0, failed: 0 }
    }

    fn section(&self, name: &str) {
        println!("\n{}", LINE);
        println!("  {}", name);
        println!("{}", LINE);
    }

    fn pass(&mut self, name: &str) {
        self.total += 1;
        self.passed += 1;
        println!("  [{:2}] {:<52} PASS", self.total, name);
    }

    fn fail(&mut self, name: &str, reason: &str) {
        self.total += 1;
        self.failed += 1;
        println!("  [{:2}] {:<52} FAIL: {}", self.total, name, reason);
    }

    fn check(&mut self, name: &str, ok: bool, reason: &str) {
        if ok { self.pass(name); } else { self.fail(name, reason); }
    }

    fn summary(&self) {
        println!("\n{}", LINE);
        println!(
            "  Total: {}  Passed: {}  Failed: {}",
            self.total, self.passed, self.failed
        );
        println!("{}", LINE);
    }
}

/// Counts lifecycle callbacks.
#[derive(Default)]
struct Events {
    connected_ok: AtomicUsize,
    connected_failed: AtomicUsize,
    will_close: AtomicUsize,
    closed_by_error: AtomicUsize,
}

impl Events {
    fn get(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }
}

impl QuestProcessor for Events {
    fn connected(&self, _info: &ConnectionInfo, connected: bool) {
        if connected {
            self.connected_ok.fetch_add(1, Ordering::SeqCst);
        } else {
            self.connected_failed.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn connection_will_close(&self, _info: &ConnectionInfo, closed_by_error: bool) {
        self.will_close.fetch_add(1, Ordering::SeqCst);
        if closed_by_error {
            self.closed_by_error.fetch_add(1, Ordering::SeqCst);
        }
    }
}

/// Helper: poll `f` every 5ms until it holds or `limit` passes.
fn wait_for(limit: Duration, mut f: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + limit;
    while Instant::now() < deadline {
        if f() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    f()
}

fn echo(q: &Quest) -> Option<Answer> {
    Some(Answer::for_quest(q, q.payload().to_vec()))
}

fn spawn_echo(t: &mut TestRunner) -> Option<LoopbackPeer> {
    match LoopbackPeer::spawn(echo) {
        Ok(p) => Some(p),
        Err(e) => {
            t.fail("spawn loopback peer", &e.to_string());
            None
        }
    }
}

fn tcp_client(t: &mut TestRunner, engine: &Arc<ClientEngine>, addr: std::net::SocketAddr) -> Option<(TcpClient, Arc<Events>)> {
    match TcpClient::with_engine(engine, addr) {
        Ok(c) => {
            let events = Arc::new(Events::default());
            c.set_quest_processor(events.clone());
            Some((c, events))
        }
        Err(e) => {
            t.fail("create tcp client", &e.to_string());
            None
        }
    }
}

// ════════════════════════════════════════════════════════════
// Part A: Quests
// ════════════════════════════════════════════════════════════

fn test_quests(t: &mut TestRunner, engine: &Arc<ClientEngine>) {
    t.section("Part A: Quests");

    let Some(peer) = spawn_echo(t) else { return };
    let Some((c, events)) = tcp_client(t, engine, peer.addr()) else { return };

    // A1: sync quest gets its answer
    let a = c.send_quest(&Quest::new("echo", b"hello".to_vec()), Some(Duration::from_secs(3)));
    t.check(
        "sync quest answered",
        a.as_ref().map(|a| a.payload() == b"hello").unwrap_or(false),
        &format!("{:?}", a.map(|a| a.to_string())),
    );
    t.check(
        "connected event fired once",
        wait_for(Duration::from_secs(2), || Events::get(&events.connected_ok) == 1),
        "connected(true) not seen",
    );

    // A2: unanswered quest times out
    let silent = match LoopbackPeer::spawn(|_q: &Quest| None) {
        Ok(p) => p,
        Err(e) => return t.fail("spawn silent peer", &e.to_string()),
    };
    if let Some((s, _)) = tcp_client(t, engine, silent.addr()) {
        let start = Instant::now();
        let a = s.send_quest(&Quest::new("void", vec![]), Some(Duration::from_millis(200)));
        let kind = a.as_ref().and_then(|a| a.error_kind());
        t.check("unanswered quest times out", kind == Some(ErrorCode::Timeout), &format!("{:?}", kind));
        t.check(
            "timeout within two seconds",
            start.elapsed() < Duration::from_secs(2),
            &format!("{:?}", start.elapsed()),
        );
    }

    // A3: one-way quests arrive in order
    let before = peer.received().len();
    for i in 0..1000u32 {
        c.send_quest(&Quest::one_way("seq", i.to_le_bytes().to_vec()), None);
    }
    let arrived = wait_for(Duration::from_secs(5), || peer.received().len() >= before + 1000);
    t.check("1000 one-way quests delivered", arrived, &format!("{} received", peer.received().len() - before));
    let in_order = peer.received()[before..]
        .iter()
        .enumerate()
        .all(|(i, q)| q.payload() == (i as u32).to_le_bytes());
    t.check("one-way quests in send order", in_order, "out of order");

    // A4: async callback
    let (tx, rx) = mpsc::channel();
    let queued = c.send_quest_async(
        Quest::new("echo", b"async".to_vec()),
        move |r| {
            let _ = tx.send(r);
        },
        None,
    );
    let got = rx.recv_timeout(Duration::from_secs(3));
    t.check(
        "async callback receives answer",
        queued && matches!(&got, Ok(Ok(a)) if a.payload() == b"async"),
        "no answer delivered",
    );

    // A5: close is idempotent
    c.close();
    c.close();
    t.check(
        "close fires will_close once",
        wait_for(Duration::from_secs(2), || Events::get(&events.will_close) == 1),
        &format!("will_close = {}", Events::get(&events.will_close)),
    );
}

// ════════════════════════════════════════════════════════════
// Part B: Lifecycle
// ════════════════════════════════════════════════════════════

fn test_lifecycle(t: &mut TestRunner, engine: &Arc<ClientEngine>) {
    t.section("Part B: Lifecycle");

    // B1: close before the connect completes only cancels
    if let Ok(c) = TcpClient::with_engine(engine, "127.0.0.1:9") {
        let events = Arc::new(Events::default());
        c.set_quest_processor(events.clone());
        c.set_auto_reconnect(false);
        c.set_connect_timeout(Duration::from_secs(30));
        let stalled = stall_connect(&c);
        t.check("connect held pending", stalled.is_ok() && c.status() == ConnStatus::Connecting, "not connecting");
        let (tx, rx) = mpsc::channel();
        c.send_quest_async(
            Quest::new("queued", vec![]),
            move |r| {
                let _ = tx.send(r);
            },
            None,
        );
        c.close();
        let result = rx.recv_timeout(Duration::from_secs(2));
        t.check("pending quest fails on close", matches!(result, Ok(Err(_))), "callback not failed");
        let cancelled = wait_for(Duration::from_secs(2), || Events::get(&events.connected_failed) == 1);
        std::thread::sleep(Duration::from_millis(100));
        t.check(
            "cancellation reported once, no close event",
            cancelled
                && Events::get(&events.connected_failed) == 1
                && Events::get(&events.connected_ok) == 0
                && Events::get(&events.will_close) == 0,
            "unexpected lifecycle events",
        );
    } else {
        t.fail("create client", "resolve failed");
    }

    // B2: refused connect
    let refused = match std::net::TcpListener::bind("127.0.0.1:0").and_then(|l| l.local_addr()) {
        Ok(addr) => addr,
        Err(e) => return t.fail("reserve port", &e.to_string()),
    };
    if let Some((c, events)) = tcp_client(t, engine, refused) {
        c.set_auto_reconnect(false);
        t.check("refused connect returns false", !c.connect(), "connect succeeded");
        t.check(
            "refused connect reported once",
            wait_for(Duration::from_secs(2), || Events::get(&events.connected_failed) == 1),
            "connected(false) not seen",
        );
        t.check("status back to NotConnected", c.status() == ConnStatus::NotConnected, "still connecting");
    }

    // B3: auto reconnect after the peer drops us
    let Some(peer) = spawn_echo(t) else { return };
    let Some((c, events)) = tcp_client(t, engine, peer.addr()) else { return };
    t.check("connect", c.connect(), "connect failed");
    let first = c.connection_info().unique_id();
    peer.close_all();
    t.check(
        "peer close observed",
        wait_for(Duration::from_secs(3), || Events::get(&events.will_close) == 1),
        "no will_close",
    );
    let a = c.send_quest(&Quest::new("echo", b"again".to_vec()), Some(Duration::from_secs(3)));
    t.check(
        "auto reconnect answers next quest",
        a.map(|a| a.payload() == b"again").unwrap_or(false),
        "no answer after reconnect",
    );
    t.check(
        "reconnect uses a new connection",
        c.connection_info().unique_id() != first,
        "same connection id",
    );
}

// ════════════════════════════════════════════════════════════
// Part C: Encryption
// ════════════════════════════════════════════════════════════

const KEY: &[u8] = b"0123456789abcdef0123456789abcdef";
const IV: &[u8] = b"fedcba9876543210";

fn test_encryption(t: &mut TestRunner, engine: &Arc<ClientEngine>) {
    t.section("Part C: Encryption");

    for (mode, label) in [(CipherMode::Stream, "stream"), (CipherMode::Package, "package")] {
        let peer = match LoopbackPeer::builder().encrypted(KEY.to_vec(), IV.to_vec()).spawn(echo) {
            Ok(p) => p,
            Err(e) => return t.fail("spawn encrypted peer", &e.to_string()),
        };
        let Some((c, _)) = tcp_client(t, engine, peer.addr()) else { return };
        let exchange = Arc::new(PresharedExchange::new(b"smoke".to_vec(), KEY.to_vec(), IV.to_vec()));
        c.enable_encryption(exchange, Arc::new(ChaChaSuite), mode);

        t.check(&format!("{} mode connect", label), c.connect(), "connect failed");
        t.check(
            &format!("{} mode connection encrypted", label),
            c.connection_info().is_encrypted(),
            "not marked encrypted",
        );
        let ok = (0..20u8).all(|i| {
            c.send_quest(&Quest::new("echo", vec![i; 64 + i as usize]), Some(Duration::from_secs(3)))
                .map(|a| a.payload() == vec![i; 64 + i as usize].as_slice())
                .unwrap_or(false)
        });
        t.check(&format!("{} mode 20 round trips", label), ok, "payload mismatch");
        t.check(
            &format!("{} mode key handshake seen", label),
            peer.key_handshakes().len() == 1,
            &format!("{} handshakes", peer.key_handshakes().len()),
        );
    }
}

// ════════════════════════════════════════════════════════════
// Part D: UDP and keepalive
// ════════════════════════════════════════════════════════════

fn test_udp_keepalive(t: &mut TestRunner, engine: &Arc<ClientEngine>) {
    t.section("Part D: UDP and keepalive");

    // D1: UDP round trip
    match LoopbackDatagramPeer::spawn(echo) {
        Ok(peer) => match UdpClient::with_engine(engine, peer.addr()) {
            Ok(c) => {
                t.check("udp connect", c.connect(), "connect failed");
                let a = c.send_quest(&Quest::new("echo", b"dgram".to_vec()), Some(Duration::from_secs(3)));
                t.check(
                    "udp quest answered",
                    a.map(|a| a.payload() == b"dgram").unwrap_or(false),
                    "no answer",
                );
                c.close();
                t.check("udp close", c.status() == ConnStatus::NotConnected, "still connected");
            }
            Err(e) => t.fail("create udp client", &e.to_string()),
        },
        Err(e) => t.fail("spawn datagram peer", &e.to_string()),
    }

    // D2: keepalive pings an idle connection
    let Some(peer) = spawn_echo(t) else { return };
    let Some((c, events)) = tcp_client(t, engine, peer.addr()) else { return };
    c.set_keep_alive(true);
    c.set_keep_alive_interval(Duration::from_millis(100));
    c.set_keep_alive_ping_timeout(Duration::from_millis(200));
    t.check("keepalive connect", c.connect(), "connect failed");
    t.check(
        "idle connection pinged",
        wait_for(Duration::from_secs(3), || peer.pings() >= 2),
        &format!("{} pings", peer.pings()),
    );
    t.check(
        "answered pings keep connection",
        c.is_connected() && Events::get(&events.will_close) == 0,
        "connection dropped",
    );

    // D3: silent peer gets dropped
    let deaf = match LoopbackPeer::builder().ignore_pings().spawn(echo) {
        Ok(p) => p,
        Err(e) => return t.fail("spawn deaf peer", &e.to_string()),
    };
    let Some((c, events)) = tcp_client(t, engine, deaf.addr()) else { return };
    c.set_auto_reconnect(false);
    c.set_keep_alive(true);
    c.set_keep_alive_interval(Duration::from_millis(100));
    c.set_keep_alive_ping_timeout(Duration::from_millis(100));
    c.set_keep_alive_max_ping_retry(2);
    t.check("deaf peer connect", c.connect(), "connect failed");
    t.check(
        "unanswered pings close connection",
        wait_for(Duration::from_secs(3), || Events::get(&events.closed_by_error) == 1),
        "connection still open",
    );
}

fn main() {
    println!("=== questnet End-to-End Smoke Test ===");

    let config = EngineConfig::from_env().tick_interval(Duration::from_millis(20));
    config.print();

    let mut t = TestRunner::new();

    let engine = match ClientEngine::start(config) {
        Ok(e) => e,
        Err(e) => {
            println!("\nFATAL: engine start failed: {}", e);
            t.summary();
            std::process::exit(1);
        }
    };

    test_quests(&mut t, &engine);
    test_lifecycle(&mut t, &engine);
    test_encryption(&mut t, &engine);
    test_udp_keepalive(&mut t, &engine);

    engine.shutdown();

    t.summary();
    std::process::exit(if t.failed > 0 { 1 } else { 0 });
}
