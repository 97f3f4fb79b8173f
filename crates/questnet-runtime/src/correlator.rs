//! Answer correlation for one connection.
//!
//! Every outstanding two-way quest has exactly one entry keyed by its seq.
//! Whoever removes the entry delivers the result: the reactor on a matching
//! answer, the timeout thread on expiry, or teardown on close. Removal is
//! the only synchronization needed for exactly-once delivery.

use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::Instant;

use questnet_core::{Answer, ErrorCode};

/// Result handed to a callback: an answer from the peer (which may itself be
/// an error answer), or a local failure code.
pub type QuestResult = Result<Answer, ErrorCode>;

/// Object-style answer callback.
pub trait AnswerCallback: Send + 'static {
    fn on_answer(self: Box<Self>, answer: Answer);

    /// `answer` is the peer's error answer, or `None` for local failures
    /// (timeout, connection closed, ...).
    fn on_exception(self: Box<Self>, answer: Option<Answer>, error_code: u32);
}

/// Why [`Correlator::insert`] refused an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejected {
    /// The connection is closing; nothing will ever answer.
    Closed,
    /// Another quest with the same seq is still outstanding.
    Duplicate,
}

impl Rejected {
    pub fn code(self) -> ErrorCode {
        match self {
            Rejected::Closed => ErrorCode::ConnectionClosed,
            Rejected::Duplicate => ErrorCode::SendError,
        }
    }
}

/// Rendezvous for a blocked synchronous sender.
#[derive(Default)]
pub struct SyncSlot {
    result: Mutex<Option<QuestResult>>,
    ready: Condvar,
}

impl SyncSlot {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn lock(&self) -> MutexGuard<'_, Option<QuestResult>> {
        match self.result.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// First fill wins.
    pub fn fill(&self, result: QuestResult) {
        let mut slot = self.lock();
        if slot.is_none() {
            *slot = Some(result);
            self.ready.notify_all();
        }
    }

    /// Block until filled or `deadline`. `None` on deadline.
    pub fn wait_until(&self, deadline: Instant) -> Option<QuestResult> {
        let mut slot = self.lock();
        loop {
            if let Some(result) = slot.take() {
                return Some(result);
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            slot = match self.ready.wait_timeout(slot, deadline - now) {
                Ok((g, _)) => g,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
    }
}

pub enum PendingCallback {
    Sync(Arc<SyncSlot>),
    Closure(Box<dyn FnOnce(QuestResult) + Send + 'static>),
    Handler(Box<dyn AnswerCallback>),
}

impl std::fmt::Debug for PendingCallback {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PendingCallback::Sync(_) => write!(f, "PendingCallback::Sync"),
            PendingCallback::Closure(_) => write!(f, "PendingCallback::Closure"),
            PendingCallback::Handler(_) => write!(f, "PendingCallback::Handler"),
        }
    }
}

impl PendingCallback {
    pub fn closure<F>(f: F) -> Self
    where
        F: FnOnce(QuestResult) + Send + 'static,
    {
        PendingCallback::Closure(Box::new(f))
    }

    /// Sync records never need a pool thread.
    pub fn is_sync(&self) -> bool {
        matches!(self, PendingCallback::Sync(_))
    }

    /// Deliver on the calling thread.
    pub fn fill(self, result: QuestResult) {
        match self {
            PendingCallback::Sync(slot) => slot.fill(result),
            PendingCallback::Closure(f) => f(result),
            PendingCallback::Handler(h) => match result {
                Ok(answer) => match answer.error_code() {
                    Some(code) => h.on_exception(Some(answer), code),
                    None => h.on_answer(answer),
                },
                Err(code) => h.on_exception(None, code.code()),
            },
        }
    }
}

struct Entry {
    callback: PendingCallback,
    expire_ms: u64,
}

struct Inner {
    entries: HashMap<u32, Entry>,
    closed: bool,
}

pub struct Correlator {
    inner: Mutex<Inner>,
}

impl Default for Correlator {
    fn default() -> Self {
        Self::new()
    }
}

impl Correlator {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                entries: HashMap::new(),
                closed: false,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        match self.inner.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Register a callback. Hands it back with the reason when the
    /// correlator was already drained or the seq is taken.
    pub fn insert(
        &self,
        seq: u32,
        callback: PendingCallback,
        expire_ms: u64,
    ) -> Result<(), (PendingCallback, Rejected)> {
        let mut inner = self.lock();
        if inner.closed {
            return Err((callback, Rejected::Closed));
        }
        if inner.entries.contains_key(&seq) {
            return Err((callback, Rejected::Duplicate));
        }
        inner.entries.insert(seq, Entry { callback, expire_ms });
        Ok(())
    }

    pub fn take(&self, seq: u32) -> Option<PendingCallback> {
        self.lock().entries.remove(&seq).map(|e| e.callback)
    }

    /// Remove every entry with `expire_ms <= now_ms`.
    pub fn extract_expired(&self, now_ms: u64, out: &mut Vec<PendingCallback>) {
        let mut inner = self.lock();
        let expired: Vec<u32> = inner
            .entries
            .iter()
            .filter(|(_, e)| e.expire_ms <= now_ms)
            .map(|(seq, _)| *seq)
            .collect();
        for seq in expired {
            if let Some(e) = inner.entries.remove(&seq) {
                out.push(e.callback);
            }
        }
    }

    /// Remove everything and refuse further inserts.
    pub fn drain_close(&self) -> Vec<PendingCallback> {
        let mut inner = self.lock();
        inner.closed = true;
        inner.entries.drain().map(|(_, e)| e.callback).collect()
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
