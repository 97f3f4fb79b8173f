//! Client layer: one logical connection to one endpoint.
//!
//! A client owns at most one live [`Connection`] at a time and replaces it
//! on reconnect. The engine reports back through [`ConnectionOwner`]; the
//! client keeps its own status, which the engine never reads.
//!
//! While a connect is in flight, async sends are cached and flushed once
//! the connection is registered. A failed connect fails the cache with
//! `InvalidConnection`.

pub mod tcp;
pub mod udp;

use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, Weak};
use std::time::{Duration, Instant};

use questnet_core::{
    kdebug, kerror, kinfo, kwarn, now_ms, Answer, CipherMode, CipherSuite, ConnStatus, ConnectionInfo,
    ConnectionToken, ErrorCode, KeyExchange, KeyHandshake, NetError, NetResult, Quest, QuestProcessor,
    RawSocket, Transport, KEY_METHOD,
};
use questnet_module::{sys, BasicDatagram};

use crate::connection::{Connection, ConnectionOwner, ConnectionSetup, Pinned, RawFrameHandler, TcpIo};
use crate::correlator::{AnswerCallback, PendingCallback, QuestResult, SyncSlot};
use crate::engine::EngineCore;
use crate::keepalive::{KeepAlive, KeepAliveParams};
use crate::lifecycle::ConnectedPermit;

pub use tcp::TcpClient;
pub use udp::UdpClient;

/// Extra wait on top of a sync quest's own timeout before the caller gives
/// up on the timeout thread.
const SYNC_GRACE: Duration = Duration::from_secs(1);

pub(crate) fn resolve<A: ToSocketAddrs>(endpoint: A) -> NetResult<SocketAddr> {
    endpoint
        .to_socket_addrs()
        .map_err(|e| NetError::AddressResolve(e.to_string()))?
        .next()
        .ok_or_else(|| NetError::AddressResolve("no address".to_string()))
}

fn millis(d: Duration) -> u64 {
    d.as_millis().min(u64::MAX as u128) as u64
}

struct CachedQuest {
    quest: Quest,
    callback: Option<PendingCallback>,
    timeout_ms: u64,
}

struct ClientState {
    status: ConnStatus,
    info: Arc<ConnectionInfo>,
    /// Async sends go to the caches instead of the engine.
    caching: bool,
    quest_cache: Vec<CachedQuest>,
    data_cache: Vec<Vec<u8>>,
}

struct Encryption {
    exchange: Arc<dyn KeyExchange>,
    suite: Arc<dyn CipherSuite>,
    mode: CipherMode,
}

/// Applied to the next connection, never to the live one.
struct ClientSettings {
    processor: Option<Arc<dyn QuestProcessor>>,
    raw_receiver: Option<Arc<RawFrameHandler>>,
    quest_timeout: Duration,
    connect_timeout: Duration,
    keepalive: bool,
    keepalive_params: KeepAliveParams,
    encryption: Option<Arc<Encryption>>,
}

/// What `prepare_connection` needs from the settings, copied out so the
/// settings lock is never held across engine calls.
struct ConnectPlan {
    processor: Option<Arc<dyn QuestProcessor>>,
    raw_receiver: Option<Arc<RawFrameHandler>>,
    quest_timeout: Duration,
    connect_timeout: Duration,
    keepalive: Option<KeepAliveParams>,
    encryption: Option<Arc<Encryption>>,
}

/// State and logic shared by [`TcpClient`] and [`UdpClient`].
pub struct ClientCore {
    me: Weak<ClientCore>,
    engine: Arc<EngineCore>,
    endpoint: SocketAddr,
    transport: Transport,
    auto_reconnect: AtomicBool,
    state: Mutex<ClientState>,
    changed: Condvar,
    settings: Mutex<ClientSettings>,
}

impl ClientCore {
    pub(crate) fn new(engine: Arc<EngineCore>, endpoint: SocketAddr, transport: Transport) -> Arc<Self> {
        let config = engine.config();
        let settings = ClientSettings {
            processor: None,
            raw_receiver: None,
            quest_timeout: config.quest_timeout,
            connect_timeout: config.connect_timeout,
            keepalive: transport == Transport::Tcp && config.keepalive_by_default,
            keepalive_params: KeepAliveParams {
                ping_timeout: Duration::ZERO,
                ping_interval: config.ping_interval,
                max_ping_retry: config.max_ping_retry,
            },
            encryption: None,
        };
        Arc::new_cyclic(|me| ClientCore {
            me: me.clone(),
            endpoint,
            transport,
            auto_reconnect: AtomicBool::new(true),
            state: Mutex::new(ClientState {
                status: ConnStatus::NotConnected,
                info: Arc::new(ConnectionInfo::placeholder(endpoint, transport)),
                caching: false,
                quest_cache: Vec::new(),
                data_cache: Vec::new(),
            }),
            changed: Condvar::new(),
            settings: Mutex::new(settings),
            engine,
        })
    }

    fn state(&self) -> MutexGuard<'_, ClientState> {
        match self.state.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn settings(&self) -> MutexGuard<'_, ClientSettings> {
        match self.settings.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    // ------------------------------------------------------------------
    // Accessors and settings
    // ------------------------------------------------------------------

    pub fn endpoint(&self) -> SocketAddr {
        self.endpoint
    }

    pub fn transport(&self) -> Transport {
        self.transport
    }

    pub fn status(&self) -> ConnStatus {
        self.state().status
    }

    pub fn is_connected(&self) -> bool {
        self.status().is_connected()
    }

    /// Info of the live connection, or a placeholder with socket 0.
    pub fn connection_info(&self) -> Arc<ConnectionInfo> {
        self.state().info.clone()
    }

    pub fn set_quest_processor(&self, processor: Arc<dyn QuestProcessor>) {
        self.settings().processor = Some(processor);
    }

    /// Route inbound frames to `receiver` undecoded instead of the
    /// correlator and the processor. Takes effect on the next connection.
    pub fn set_raw_receiver(&self, receiver: Option<Arc<RawFrameHandler>>) {
        self.settings().raw_receiver = receiver;
    }

    pub fn quest_timeout(&self) -> Duration {
        self.settings().quest_timeout
    }

    pub fn set_quest_timeout(&self, timeout: Duration) {
        self.settings().quest_timeout = timeout;
    }

    pub fn connect_timeout(&self) -> Duration {
        self.settings().connect_timeout
    }

    pub fn set_connect_timeout(&self, timeout: Duration) {
        self.settings().connect_timeout = timeout;
    }

    pub fn auto_reconnect(&self) -> bool {
        self.auto_reconnect.load(Ordering::Relaxed)
    }

    /// Sends on a closed client reconnect first when set (the default).
    pub fn set_auto_reconnect(&self, enable: bool) {
        self.auto_reconnect.store(enable, Ordering::Relaxed);
    }

    pub(crate) fn set_keep_alive(&self, enable: bool) {
        self.settings().keepalive = enable;
    }

    pub(crate) fn keep_alive(&self) -> bool {
        self.settings().keepalive
    }

    pub(crate) fn update_keep_alive(&self, f: impl FnOnce(&mut KeepAliveParams)) {
        f(&mut self.settings().keepalive_params);
    }

    pub(crate) fn keep_alive_params(&self) -> KeepAliveParams {
        self.settings().keepalive_params
    }

    pub(crate) fn set_encryption(&self, exchange: Arc<dyn KeyExchange>, suite: Arc<dyn CipherSuite>, mode: CipherMode) {
        self.settings().encryption = Some(Arc::new(Encryption { exchange, suite, mode }));
    }

    fn plan(&self) -> ConnectPlan {
        let s = self.settings();
        ConnectPlan {
            processor: s.processor.clone(),
            raw_receiver: s.raw_receiver.clone(),
            quest_timeout: s.quest_timeout,
            connect_timeout: s.connect_timeout,
            keepalive: if s.keepalive { Some(s.keepalive_params) } else { None },
            encryption: s.encryption.clone(),
        }
    }

    // ------------------------------------------------------------------
    // Connecting
    // ------------------------------------------------------------------

    /// Start connecting. `true` when a connect is in flight or done;
    /// `false` when it failed right away (the processor still hears
    /// `connected(false)`).
    pub fn async_connect(&self) -> bool {
        {
            let mut st = self.state();
            match st.status {
                ConnStatus::Connected | ConnStatus::Connecting => return true,
                ConnStatus::NotConnected => {}
            }
            st.status = ConnStatus::Connecting;
            st.caching = true;
        }

        let opened = match self.transport {
            Transport::Tcp => sys::tcp_connect(&self.endpoint),
            Transport::Udp => sys::udp_connect(&self.endpoint).map(|fd| (fd, true)),
        };
        match opened {
            Ok((fd, immediate)) => self.prepare_connection(fd, immediate),
            Err(e) => {
                kwarn!("connect to {} {} failed: errno {}", self.transport, self.endpoint, e);
                self.reset(None);
                self.report_connect_failure();
                false
            }
        }
    }

    /// Take over `fd`, a TCP socket whose nonblocking connect is already in
    /// flight, as if `async_connect` had opened it. The reactor finishes
    /// the connect once the socket turns writable. `fd` is closed when the
    /// client is not idle.
    pub(crate) fn adopt_connecting(&self, fd: RawSocket) -> bool {
        {
            let mut st = self.state();
            if st.status != ConnStatus::NotConnected || self.transport != Transport::Tcp {
                drop(st);
                sys::close(fd);
                return false;
            }
            st.status = ConnStatus::Connecting;
            st.caching = true;
        }
        self.prepare_connection(fd, false)
    }

    /// Connect and wait for the outcome.
    pub fn connect(&self) -> bool {
        if !self.async_connect() {
            return false;
        }
        self.wait_connecting()
    }

    pub fn reconnect(&self) -> bool {
        self.close();
        self.connect()
    }

    pub fn async_reconnect(&self) -> bool {
        self.close();
        self.async_connect()
    }

    /// Block while connecting. `true` if the client ends up connected.
    fn wait_connecting(&self) -> bool {
        let limit = self.connect_timeout() + self.engine.config().tick_interval * 2 + SYNC_GRACE;
        let deadline = Instant::now() + limit;
        let mut st = self.state();
        while st.status == ConnStatus::Connecting {
            let now = Instant::now();
            if now >= deadline {
                kwarn!("gave up waiting for connect to {}", self.endpoint);
                break;
            }
            st = match self.changed.wait_timeout(st, deadline - now) {
                Ok((g, _)) => g,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
        st.status == ConnStatus::Connected
    }

    fn report_connect_failure(&self) {
        let Some(processor) = self.plan().processor else { return };
        let info = self.connection_info();
        self.engine.run_or_inline(Box::new(move || {
            notify_connected(&*processor, &info, false);
        }));
    }

    fn prepare_connection(&self, fd: RawSocket, immediate: bool) -> bool {
        let plan = self.plan();
        let config = self.engine.config();
        let now = now_ms();
        let owner: Weak<dyn ConnectionOwner> = self.me.clone();
        let setup = ConnectionSetup {
            owner: Some(owner),
            processor: plan.processor.clone(),
            raw_receiver: plan.raw_receiver.clone(),
            connect_deadline_ms: now.saturating_add(millis(plan.connect_timeout)),
        };
        let info = ConnectionInfo::new(fd, self.endpoint, self.transport);
        let conn = Arc::new(match self.transport {
            Transport::Tcp => {
                let keepalive = plan.keepalive.map(|p| KeepAlive::new(p, plan.quest_timeout, now));
                Connection::new_tcp(info, setup, config.max_package_len, keepalive)
            }
            Transport::Udp => {
                let datagram = BasicDatagram::new(
                    config.udp_mtu,
                    millis(config.udp_idle_limit),
                    millis(config.udp_heartbeat),
                );
                Connection::new_udp(info, setup, Box::new(datagram))
            }
        });
        let id = conn.info().unique_id();

        {
            let mut st = self.state();
            if st.status != ConnStatus::Connecting {
                drop(st);
                kdebug!("client closed while connecting. {}", conn.info());
                self.engine.discard(conn, ErrorCode::ConnectionClosed);
                return false;
            }
            st.info = conn.info().clone();
        }

        let encrypted = match (conn.tcp(), plan.encryption.as_ref()) {
            (Some(tcp), Some(enc)) => self.enter_encryption(&conn, tcp, enc, plan.quest_timeout),
            _ => Ok(()),
        };
        if let Err(e) = encrypted {
            kerror!("entering encryption failed: {}. {}", e, conn.info());
            self.reset(Some(id));
            self.engine.discard(conn, ErrorCode::InvalidConnection);
            return false;
        }
        if conn.tcp().is_some() {
            conn.disable_io();
        }
        if immediate {
            conn.mark_socket_connected();
        }

        if !self.engine.join(&conn, !immediate) {
            self.reset(Some(id));
            self.engine.discard(conn, ErrorCode::InvalidConnection);
            return false;
        }

        if !self.dump_cache(&conn) {
            kdebug!("client closed while registering. {}", conn.info());
            self.engine.close_token(conn.token(), ErrorCode::ConnectionClosed, false);
            return false;
        }

        if immediate {
            self.socket_connected(&conn, true);
        }
        true
    }

    /// Set up both cipher directions and queue the `*key` quest, which goes
    /// out in clear ahead of everything else.
    fn enter_encryption(&self, conn: &Connection, tcp: &TcpIo, enc: &Encryption, timeout: Duration) -> NetResult<()> {
        let handshake = enc.exchange.negotiate()?;
        let encryptor = enc.suite.create(&handshake.material, enc.mode)?;
        let decryptor = enc.suite.create(&handshake.material, enc.mode)?;
        if !tcp.send.entry_encrypt_mode(enc.mode, encryptor) || !tcp.recv.entry_encrypt_mode(enc.mode, decryptor) {
            return Err(NetError::Code(ErrorCode::InvalidConnection));
        }
        tcp.send.encrypt_after_first_package();
        conn.info().set_encrypted();

        let key = KeyHandshake {
            public_key: handshake.public_key,
            stream_mode: enc.mode == CipherMode::Stream,
            bits: enc.exchange.key_bits(),
        };
        let quest = Quest::new(KEY_METHOD, key.encode());
        let bytes = self.engine.codec().encode_quest(&quest)?;

        let engine = Arc::downgrade(&self.engine);
        let token = conn.token();
        let callback = PendingCallback::closure(move |result| {
            let rejected = match &result {
                Ok(answer) => answer.is_error(),
                Err(code) => *code != ErrorCode::ConnectionClosed,
            };
            if rejected {
                kerror!("key exchange with {:?} failed: {:?}", token, result);
                if let Some(core) = engine.upgrade() {
                    core.close_token(token, ErrorCode::InvalidConnection, true);
                }
            }
        });
        let expire = now_ms().saturating_add(millis(timeout));
        if let Err((_, why)) = conn.correlator().insert(quest.seq(), callback, expire) {
            return Err(NetError::Code(why.code()));
        }
        tcp.send.append(bytes);
        Ok(())
    }

    /// Flush the caches into a freshly registered connection. `false` when
    /// the client moved on to another connection (or closed) meanwhile.
    fn dump_cache(&self, conn: &Arc<Connection>) -> bool {
        let (quests, data) = {
            let mut st = self.state();
            if st.info.unique_id() != conn.info().unique_id() {
                return false;
            }
            st.caching = false;
            (std::mem::take(&mut st.quest_cache), std::mem::take(&mut st.data_cache))
        };
        if quests.is_empty() && data.is_empty() {
            return true;
        }
        kdebug!("flushing {} cached quests, {} cached packages. {}", quests.len(), data.len(), conn.info());

        let pinned = Pinned::new(conn.clone());
        for cached in quests {
            if let Err(failure) = self
                .engine
                .send_quest_on(&pinned, &cached.quest, cached.callback, cached.timeout_ms)
            {
                if let Some(cb) = failure.callback {
                    self.engine.deliver(cb, Err(ErrorCode::InvalidConnection));
                }
            }
        }
        for bytes in data {
            if self.engine.send_bytes(&pinned, bytes, false).is_err() {
                break;
            }
        }
        true
    }

    /// Forget the current connection if it is `only` (any, for `None`) and
    /// fail whatever was cached. Returns whether anything changed.
    fn reset(&self, only: Option<u64>) -> bool {
        let (quests, data) = {
            let mut st = self.state();
            if st.status == ConnStatus::NotConnected {
                return false;
            }
            if let Some(id) = only {
                if st.info.unique_id() != id {
                    return false;
                }
            }
            st.status = ConnStatus::NotConnected;
            st.info = Arc::new(ConnectionInfo::placeholder(self.endpoint, self.transport));
            st.caching = false;
            let caches = (std::mem::take(&mut st.quest_cache), std::mem::take(&mut st.data_cache));
            self.changed.notify_all();
            caches
        };
        self.fail_cache(quests, data);
        true
    }

    fn fail_cache(&self, quests: Vec<CachedQuest>, data: Vec<Vec<u8>>) {
        if !data.is_empty() {
            kdebug!("dropping {} cached packages for {}", data.len(), self.endpoint);
        }
        for cached in quests {
            if let Some(cb) = cached.callback {
                self.engine.deliver(cb, Err(ErrorCode::InvalidConnection));
            }
        }
    }

    /// Runs on the pool for a connection whose socket just connected.
    fn connected_event(&self, conn: &Pinned) {
        let permit = conn.gate().begin_connected();
        let info = conn.info();
        match permit {
            ConnectedPermit::Denied => {}
            ConnectedPermit::Cancelled => {
                self.reset(Some(info.unique_id()));
                if let Some(processor) = conn.processor() {
                    notify_connected(&**processor, info, false);
                }
                conn.gate().finish_connected(false);
                self.engine.close_token(conn.token(), ErrorCode::Cancelled, true);
            }
            ConnectedPermit::Connected => {
                let current = {
                    let mut st = self.state();
                    let current = st.status == ConnStatus::Connecting && st.info.unique_id() == info.unique_id();
                    if current {
                        st.status = ConnStatus::Connected;
                        self.changed.notify_all();
                    }
                    current
                };
                if !current {
                    kdebug!("connection superseded before it connected. {}", info);
                    if let Some(processor) = conn.processor() {
                        notify_connected(&**processor, info, false);
                    }
                    conn.gate().finish_connected(false);
                    self.engine.close_token(conn.token(), ErrorCode::ConnectionClosed, false);
                    return;
                }

                kinfo!("connected. {}", info);
                if let Some(processor) = conn.processor() {
                    notify_connected(&**processor, info, true);
                }
                let close_now = conn.gate().finish_connected(true);
                if close_now {
                    if let Some(processor) = conn.processor() {
                        notify_will_close(&**processor, info, false);
                    }
                    conn.gate().finish_close();
                } else {
                    self.engine.activate(conn);
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Closing
    // ------------------------------------------------------------------

    /// Close the live connection. Idempotent; outstanding quests get
    /// `ConnectionClosed`, cached ones `InvalidConnection`.
    pub fn close(&self) {
        let (info, quests, data) = {
            let mut st = self.state();
            if st.status == ConnStatus::NotConnected {
                return;
            }
            let info = std::mem::replace(
                &mut st.info,
                Arc::new(ConnectionInfo::placeholder(self.endpoint, self.transport)),
            );
            st.status = ConnStatus::NotConnected;
            st.caching = false;
            let quests = std::mem::take(&mut st.quest_cache);
            let data = std::mem::take(&mut st.data_cache);
            self.changed.notify_all();
            (info, quests, data)
        };
        self.fail_cache(quests, data);
        if let Some(conn) = self.engine.take_connection(info.token()) {
            self.engine.teardown(conn, ErrorCode::ConnectionClosed, false);
        }
    }

    // ------------------------------------------------------------------
    // Sending
    // ------------------------------------------------------------------

    /// Make sure there is a connection to send on, connecting if allowed.
    fn ensure_connected(&self) -> bool {
        match self.status() {
            ConnStatus::Connected => true,
            ConnStatus::Connecting => self.wait_connecting(),
            ConnStatus::NotConnected => self.auto_reconnect() && self.connect(),
        }
    }

    fn current_token(&self) -> Option<ConnectionToken> {
        let st = self.state();
        match st.status {
            ConnStatus::NotConnected => None,
            _ => Some(st.info.token()),
        }
    }

    /// Send and wait for the answer. Local failures come back as error
    /// answers; one-way quests return `None`.
    pub fn send_quest(&self, quest: &Quest, timeout: Option<Duration>) -> Option<Answer> {
        let timeout = timeout.unwrap_or_else(|| self.quest_timeout());
        let fail = |code: ErrorCode| {
            if quest.is_two_way() {
                Some(Answer::error_for(quest, code, code.as_str()))
            } else {
                None
            }
        };

        if !self.ensure_connected() {
            return fail(ErrorCode::ConnectionClosed);
        }
        let Some(token) = self.current_token() else {
            return fail(ErrorCode::ConnectionClosed);
        };

        if quest.is_one_way() {
            if let Err(failure) = self.engine.send_quest(token, quest, None, 0) {
                kdebug!("one-way {} not sent: {}", quest, failure.code);
            }
            return None;
        }

        let slot = SyncSlot::new();
        let timeout_ms = millis(timeout);
        if let Err(failure) = self
            .engine
            .send_quest(token, quest, Some(PendingCallback::Sync(slot.clone())), timeout_ms)
        {
            if failure.callback.is_some() {
                return fail(failure.code);
            }
        }

        let limit = timeout + self.engine.config().tick_interval * 2 + SYNC_GRACE;
        match slot.wait_until(Instant::now() + limit) {
            Some(Ok(answer)) => Some(answer),
            Some(Err(code)) => fail(code),
            None => {
                kwarn!("sync {} outlived its deadline, abandoning", quest);
                if let Some(conn) = self.engine.registry().sign_token(token) {
                    conn.correlator().take(quest.seq());
                }
                fail(ErrorCode::Timeout)
            }
        }
    }

    /// Send with a closure receiving the answer or a failure code.
    /// `false` when the send failed; the closure has then been called with
    /// the error.
    pub fn send_quest_async<F>(&self, quest: Quest, callback: F, timeout: Option<Duration>) -> bool
    where
        F: FnOnce(QuestResult) + Send + 'static,
    {
        self.send_with(quest, PendingCallback::closure(callback), timeout)
    }

    /// Object-style variant of [`ClientCore::send_quest_async`].
    pub fn send_quest_with(&self, quest: Quest, handler: Box<dyn AnswerCallback>, timeout: Option<Duration>) -> bool {
        self.send_with(quest, PendingCallback::Handler(handler), timeout)
    }

    fn send_with(&self, quest: Quest, callback: PendingCallback, timeout: Option<Duration>) -> bool {
        let timeout_ms = millis(timeout.unwrap_or_else(|| self.quest_timeout()));

        if self.status() == ConnStatus::NotConnected && !(self.auto_reconnect() && self.async_connect()) {
            self.engine.deliver(callback, Err(ErrorCode::ConnectionClosed));
            return false;
        }

        let token = {
            let mut st = self.state();
            if st.caching {
                st.quest_cache.push(CachedQuest {
                    quest,
                    callback: Some(callback),
                    timeout_ms,
                });
                return true;
            }
            if st.status == ConnStatus::NotConnected {
                drop(st);
                self.engine.deliver(callback, Err(ErrorCode::ConnectionClosed));
                return false;
            }
            st.info.token()
        };

        match self.engine.send_quest(token, &quest, Some(callback), timeout_ms) {
            Ok(()) => true,
            Err(failure) => {
                if let Some(cb) = failure.callback {
                    self.engine.deliver(cb, Err(failure.code));
                }
                false
            }
        }
    }

    /// Send bytes that are already one or more encoded frames.
    pub fn send_data(&self, data: Vec<u8>) -> bool {
        if self.status() == ConnStatus::NotConnected && !(self.auto_reconnect() && self.async_connect()) {
            return false;
        }
        let token = {
            let mut st = self.state();
            if st.caching {
                st.data_cache.push(data);
                return true;
            }
            if st.status == ConnStatus::NotConnected {
                return false;
            }
            st.info.token()
        };
        self.engine.send_data(token, data)
    }
}

impl ConnectionOwner for ClientCore {
    fn socket_connected(&self, conn: &Arc<Connection>, connected: bool) {
        if !connected {
            if let Some(conn) = self.engine.take_connection(conn.token()) {
                self.engine.teardown(conn, ErrorCode::InvalidConnection, true);
            }
            return;
        }
        let me = self.me.clone();
        let pinned = Pinned::new(conn.clone());
        self.engine.run_or_inline(Box::new(move || {
            if let Some(client) = me.upgrade() {
                client.connected_event(&pinned);
            }
        }));
    }

    fn will_close(&self, conn: &Arc<Connection>, closed_by_error: bool) {
        if self.reset(Some(conn.info().unique_id())) {
            kdebug!("connection lost (by error: {}). {}", closed_by_error, conn.info());
        }
        self.engine.schedule_close(conn.clone(), closed_by_error);
    }
}

fn notify_connected(processor: &dyn QuestProcessor, info: &ConnectionInfo, connected: bool) {
    let r = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| processor.connected(info, connected)));
    if r.is_err() {
        kerror!("connected panicked. {}", info);
    }
}

fn notify_will_close(processor: &dyn QuestProcessor, info: &ConnectionInfo, closed_by_error: bool) {
    let r = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        processor.connection_will_close(info, closed_by_error)
    }));
    if r.is_err() {
        kerror!("connection_will_close panicked. {}", info);
    }
}
