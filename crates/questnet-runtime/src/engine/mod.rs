//! Client engine: one reactor thread, one timeout thread, one task pool.
//!
//! # Architecture
//!
//! ```text
//!   caller threads            reactor (qnet-reactor)         task pool (qnet-task-N)
//!   ─────────────             ──────────────────────         ───────────────────────
//!   send_quest ──► SendBuffer ──► poll(2) ◄── notifier          answer callbacks
//!       │              ▲            │                           quest processing
//!       └─► Correlator │            ├─► io::process ──► dispatch ──►  connected / close
//!                      │            └─► merge quit/new/write sets      events
//!                      │
//!   timeout (qnet-timeout): expired callbacks, keepalive, UDP flush, reclaimer
//! ```
//!
//! `ClientEngine` owns the threads; everything they share lives in
//! `EngineCore`, which connections and clients reach through `Arc`.

pub mod reactor;
pub mod reclaim;
pub mod timeout;

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};

use questnet_core::{
    kdebug, kerror, kinfo, kwarn, now_ms, Codec, ConnectionToken, ErrorCode, NetError, NetResult, Notifier,
    Quest, RawSocket, Task, TaskPool,
};
use questnet_module::{sys, BinaryCodec, DefaultNotifier, FixedPool};

use crate::buffer::SendOutcome;
use crate::config::EngineConfig;
use crate::connection::{ConnIo, Connection, Pinned};
use crate::correlator::{PendingCallback, QuestResult, Rejected};
use crate::registry::Registry;

pub use reactor::ReactorStats;
pub use reclaim::{CloseTask, Reclaimer, Releasable};
pub use timeout::{TimeoutStats, TimeoutThreadHandle};

/// Registrations made since the reactor last looked.
#[derive(Default)]
pub(crate) struct PendingSets {
    pub quit: Vec<RawSocket>,
    pub new: Vec<(RawSocket, bool)>,
    pub write: HashSet<RawSocket>,
}

/// A failed `send_quest`. `callback` is handed back when it was never
/// installed or could be pulled out again; `None` means teardown already
/// delivered it.
#[derive(Debug)]
pub struct SendFailure {
    pub code: ErrorCode,
    pub callback: Option<PendingCallback>,
}

/// State shared by the engine threads, the clients and in-flight tasks.
pub struct EngineCore {
    config: EngineConfig,
    registry: Registry,
    pending: Mutex<PendingSets>,
    notifier: Box<dyn Notifier>,
    pool: Arc<dyn TaskPool>,
    codec: Arc<dyn Codec>,
    reclaimer: Reclaimer,
    running: AtomicBool,
}

impl EngineCore {
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn codec(&self) -> &dyn Codec {
        &*self.codec
    }

    pub fn pool(&self) -> &Arc<dyn TaskPool> {
        &self.pool
    }

    pub fn reclaimer(&self) -> &Reclaimer {
        &self.reclaimer
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    fn pending(&self) -> MutexGuard<'_, PendingSets> {
        match self.pending.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Kick the reactor out of `poll`.
    pub fn wake(&self) {
        if let Err(e) = self.notifier.notify() {
            kerror!("reactor wakeup failed: {}", e);
        }
    }

    // ------------------------------------------------------------------
    // Registration
    // ------------------------------------------------------------------

    /// Register `conn`. Fails when stopped, full, or the descriptor is
    /// already taken; the caller then disposes of the connection.
    pub fn join(&self, conn: &Arc<Connection>, want_write: bool) -> bool {
        if !self.is_running() {
            return false;
        }
        if let Err(e) = sys::set_nonblocking(conn.socket()) {
            kerror!("set nonblocking failed (errno {}). {}", e, conn.info());
            return false;
        }
        if !self.registry.insert(conn.clone()) {
            kwarn!(
                "registry refused connection ({} of {} sockets in use). {}",
                self.registry.len(),
                self.config.max_sockets,
                conn.info()
            );
            return false;
        }
        self.pending().new.push((conn.socket(), want_write));
        self.wake();
        true
    }

    /// Ask for one write-readiness report.
    pub fn request_write(&self, fd: RawSocket) {
        let fresh = self.pending().write.insert(fd);
        if fresh {
            self.wake();
        }
    }

    /// Stop watching `fd`. The registry entry must already be gone.
    pub fn quit(&self, fd: RawSocket) {
        self.pending().quit.push(fd);
        self.wake();
    }

    /// Apply pending sets to the reactor's write set: quit, new, write.
    pub(crate) fn merge_pending(&self, want_write: &mut HashSet<RawSocket>) {
        let mut p = self.pending();
        for fd in p.quit.drain(..) {
            want_write.remove(&fd);
        }
        for (fd, write) in p.new.drain(..) {
            if write {
                want_write.insert(fd);
            }
        }
        want_write.extend(p.write.drain());
    }

    // ------------------------------------------------------------------
    // Tasks and delivery
    // ------------------------------------------------------------------

    /// Submit to the pool. `false` when saturated; the task is dropped.
    pub fn run_task(&self, task: Task) -> bool {
        self.pool.execute(task).is_ok()
    }

    /// Submit, or run on this thread when the pool is saturated.
    pub fn run_or_inline(&self, task: Task) {
        if let Err(task) = self.pool.execute(task) {
            kwarn!("task pool saturated, running task inline");
            if std::panic::catch_unwind(std::panic::AssertUnwindSafe(task)).is_err() {
                kerror!("inline task panicked");
            }
        }
    }

    /// Hand a result to its callback: sync slots directly, everything else
    /// on the pool.
    pub fn deliver(&self, callback: PendingCallback, result: QuestResult) {
        if callback.is_sync() {
            callback.fill(result);
        } else {
            self.run_or_inline(Box::new(move || callback.fill(result)));
        }
    }

    /// Fail every outstanding quest on `conn` and refuse new ones.
    pub fn clear_callbacks(&self, conn: &Connection, code: ErrorCode) {
        let drained = conn.correlator().drain_close();
        if !drained.is_empty() {
            kdebug!("clearing {} callbacks with {}. {}", drained.len(), code, conn.info());
        }
        for cb in drained {
            self.deliver(cb, Err(code));
        }
    }

    pub fn reclaim(&self, obj: Arc<dyn Releasable>) {
        self.reclaimer.reclaim(obj);
    }

    // ------------------------------------------------------------------
    // Teardown
    // ------------------------------------------------------------------

    pub fn take_connection(&self, token: ConnectionToken) -> Option<Arc<Connection>> {
        self.registry.take_token(token)
    }

    /// Tear down a connection already removed from the registry: stop
    /// watching it, fail its callbacks, and let its owner (or the engine,
    /// for orphans) schedule the close event.
    pub fn teardown(&self, conn: Arc<Connection>, code: ErrorCode, closed_by_error: bool) {
        self.quit(conn.socket());
        self.clear_callbacks(&conn, code);
        match conn.owner() {
            Some(owner) => owner.will_close(&conn, closed_by_error),
            None => self.schedule_close(conn, closed_by_error),
        }
    }

    /// Remove by descriptor and tear down. No-op if already gone.
    pub fn clear_connection(&self, fd: RawSocket, code: ErrorCode) {
        if let Some(conn) = self.registry.take(fd) {
            self.teardown(conn, code, true);
        }
    }

    /// Remove by token and tear down. No-op if already gone or replaced.
    pub fn close_token(&self, token: ConnectionToken, code: ErrorCode, closed_by_error: bool) {
        if let Some(conn) = self.registry.take_token(token) {
            self.teardown(conn, code, closed_by_error);
        }
    }

    /// Queue the close event and park the connection in the reclaimer.
    /// If the pool is saturated, the reclaimer runs the event later.
    pub fn schedule_close(&self, conn: Arc<Connection>, closed_by_error: bool) {
        let task = CloseTask::new(conn, closed_by_error);
        self.reclaimer.reclaim(task.clone());
        if !self.run_task(Box::new(move || task.run())) {
            kwarn!("task pool saturated, close event deferred to the reclaimer");
        }
    }

    /// Fail every callback and close a connection that never reached the
    /// registry.
    pub fn discard(&self, conn: Arc<Connection>, code: ErrorCode) {
        self.clear_callbacks(&conn, code);
        self.schedule_close(conn, true);
    }

    // ------------------------------------------------------------------
    // Sending
    // ------------------------------------------------------------------

    /// Push encoded bytes into a connection. A hard socket error tears the
    /// connection down before returning.
    pub fn send_bytes(&self, conn: &Connection, data: Vec<u8>, discardable: bool) -> NetResult<()> {
        let fd = conn.socket();
        match conn.io() {
            ConnIo::Tcp(tcp) => match tcp.send.send(fd, Some(data)) {
                Ok(SendOutcome::WouldBlock) => {
                    self.request_write(fd);
                    Ok(())
                }
                Ok(_) => Ok(()),
                Err(e) => {
                    kerror!("send failed (errno {}). {}", e, conn.info());
                    self.close_token(conn.token(), ErrorCode::InvalidConnection, true);
                    Err(NetError::Os(e))
                }
            },
            ConnIo::Udp(udp) => {
                udp.enqueue(data, discardable)?;
                self.flush_udp(conn, udp)
            }
        }
    }

    /// Write out whatever is queued on `conn`.
    pub fn flush(&self, conn: &Connection) -> NetResult<()> {
        let fd = conn.socket();
        match conn.io() {
            ConnIo::Tcp(tcp) => match tcp.send.send(fd, None) {
                Ok(SendOutcome::WouldBlock) => {
                    self.request_write(fd);
                    Ok(())
                }
                Ok(_) => Ok(()),
                Err(e) => {
                    kerror!("flush failed (errno {}). {}", e, conn.info());
                    self.close_token(conn.token(), ErrorCode::InvalidConnection, true);
                    Err(NetError::Os(e))
                }
            },
            ConnIo::Udp(udp) => self.flush_udp(conn, udp),
        }
    }

    fn flush_udp(&self, conn: &Connection, udp: &crate::connection::UdpIo) -> NetResult<()> {
        match udp.flush(conn.socket(), now_ms()) {
            Ok(true) => {
                self.request_write(conn.socket());
                Ok(())
            }
            Ok(false) => Ok(()),
            Err(e) => {
                kerror!("datagram flush failed (errno {}). {}", e, conn.info());
                self.close_token(conn.token(), ErrorCode::InvalidConnection, true);
                Err(NetError::Os(e))
            }
        }
    }

    /// Open a freshly connected connection's buffers and push out what
    /// queued up while it was connecting.
    pub fn activate(&self, conn: &Connection) {
        conn.enable_io();
        // A failed flush already tore the connection down.
        let _ = self.flush(conn);
        self.wake();
    }

    /// Send raw encoded bytes on the connection `token` names.
    pub fn send_data(&self, token: ConnectionToken, data: Vec<u8>) -> bool {
        match self.registry.sign_token(token) {
            Some(conn) => self.send_bytes(&conn, data, false).is_ok(),
            None => false,
        }
    }

    /// Send a quest on the connection `token` names.
    ///
    /// For two-way quests the callback is installed, with its expiry,
    /// before the bytes are queued, and pulled back out if queueing fails.
    /// One-way quests never carry a callback.
    pub fn send_quest(
        &self,
        token: ConnectionToken,
        quest: &Quest,
        callback: Option<PendingCallback>,
        timeout_ms: u64,
    ) -> Result<(), SendFailure> {
        match self.registry.sign_token(token) {
            Some(conn) => self.send_quest_on(&conn, quest, callback, timeout_ms),
            None => Err(SendFailure {
                code: ErrorCode::InvalidConnection,
                callback,
            }),
        }
    }

    pub fn send_quest_on(
        &self,
        conn: &Pinned,
        quest: &Quest,
        callback: Option<PendingCallback>,
        timeout_ms: u64,
    ) -> Result<(), SendFailure> {
        let bytes = match self.codec.encode_quest(quest) {
            Ok(b) => b,
            Err(e) => {
                kerror!("encode quest {} failed: {}", quest.method(), e);
                return Err(SendFailure {
                    code: ErrorCode::InvalidPackage,
                    callback,
                });
            }
        };
        if self.config.log_client_quests {
            kinfo!(
                "quest {} seq {} {} -> {}",
                quest.method(),
                quest.seq(),
                if quest.is_two_way() { "two-way" } else { "one-way" },
                conn.info().endpoint()
            );
        }

        let tracked = match callback {
            Some(cb) if quest.is_two_way() => {
                let expire = now_ms().saturating_add(timeout_ms);
                if let Err((cb, why)) = conn.correlator().insert(quest.seq(), cb, expire) {
                    if why == Rejected::Duplicate {
                        kerror!("quest {} seq {} is already outstanding. {}", quest.method(), quest.seq(), conn.info());
                    }
                    return Err(SendFailure {
                        code: why.code(),
                        callback: Some(cb),
                    });
                }
                true
            }
            Some(_) => {
                kdebug!("callback for one-way quest {} ignored", quest.method());
                false
            }
            None => false,
        };

        match self.send_bytes(conn, bytes, quest.is_one_way()) {
            Ok(()) => Ok(()),
            Err(_) => Err(SendFailure {
                code: ErrorCode::SendError,
                callback: if tracked {
                    conn.correlator().take(quest.seq())
                } else {
                    None
                },
            }),
        }
    }
}

/// Handle to a running engine. Dropping it shuts the engine down.
pub struct ClientEngine {
    core: Arc<EngineCore>,
    reactor: Mutex<Option<JoinHandle<ReactorStats>>>,
    timeout: Mutex<Option<TimeoutThreadHandle>>,
}

static GLOBAL: Mutex<Option<Arc<ClientEngine>>> = Mutex::new(None);

impl ClientEngine {
    /// Process-wide engine, started from `EngineConfig::from_env()` on
    /// first use.
    pub fn global() -> NetResult<Arc<ClientEngine>> {
        let mut slot = match GLOBAL.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(engine) = slot.as_ref() {
            return Ok(engine.clone());
        }
        let engine = Self::start(EngineConfig::from_env())?;
        *slot = Some(engine.clone());
        Ok(engine)
    }

    /// Shut down the process-wide engine, if one was started. A later
    /// `global()` starts a fresh one.
    pub fn shutdown_global() {
        let engine = match GLOBAL.lock() {
            Ok(mut g) => g.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(engine) = engine {
            engine.shutdown();
        }
    }

    /// Start an independent engine.
    pub fn start(config: EngineConfig) -> NetResult<Arc<ClientEngine>> {
        config.validate()?;
        if config.ignore_sigpipe {
            sys::ignore_sigpipe()?;
        }

        let pool: Arc<dyn TaskPool> = Arc::new(FixedPool::new(
            "qnet-task",
            config.resident_task_threads,
            config.max_task_threads,
            config.task_queue_depth,
        )?);
        let notifier: Box<dyn Notifier> = Box::new(DefaultNotifier::create()?);

        let core = Arc::new(EngineCore {
            registry: Registry::new(config.max_sockets),
            pending: Mutex::new(PendingSets::default()),
            notifier,
            pool,
            codec: Arc::new(BinaryCodec::new()),
            reclaimer: Reclaimer::new(),
            running: AtomicBool::new(true),
            config,
        });

        let reactor_core = core.clone();
        let reactor = thread::Builder::new()
            .name("qnet-reactor".into())
            .spawn(move || reactor::run(reactor_core))?;
        let timeout = match timeout::spawn(core.clone()) {
            Ok(h) => h,
            Err(e) => {
                core.running.store(false, Ordering::Release);
                core.wake();
                let _ = reactor.join();
                core.pool.shutdown();
                return Err(e);
            }
        };

        kinfo!(
            "client engine started: {} resident / {} max task threads, {} sockets",
            core.config.resident_task_threads,
            core.config.max_task_threads,
            core.config.max_sockets
        );

        Ok(Arc::new(ClientEngine {
            core,
            reactor: Mutex::new(Some(reactor)),
            timeout: Mutex::new(Some(timeout)),
        }))
    }

    pub fn core(&self) -> &Arc<EngineCore> {
        &self.core
    }

    /// Stop the reactor (tearing down every connection), then the timeout
    /// thread (finalizing everything reclaimed), then the task pool.
    /// Idempotent.
    pub fn shutdown(&self) {
        let was_running = self.core.running.swap(false, Ordering::AcqRel);
        if was_running {
            self.core.wake();
        }

        let reactor = match self.reactor.lock() {
            Ok(mut g) => g.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(handle) = reactor {
            match handle.join() {
                Ok(stats) => kdebug!("reactor stopped: {:?}", stats),
                Err(_) => kerror!("reactor thread panicked"),
            }
        }

        let timeout = match self.timeout.lock() {
            Ok(mut g) => g.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(handle) = timeout {
            let stats = handle.shutdown();
            kdebug!("timeout thread stopped: {:?}", stats);
        }

        if was_running {
            self.core.pool.shutdown();
            kinfo!("client engine stopped");
        }
    }
}

impl std::ops::Deref for ClientEngine {
    type Target = EngineCore;

    fn deref(&self) -> &EngineCore {
        &self.core
    }
}

impl Drop for ClientEngine {
    fn drop(&mut self) {
        self.shutdown();
    }
}
