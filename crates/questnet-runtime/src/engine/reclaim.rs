//! Deferred destruction.
//!
//! Torn-down connections are never dropped from the thread that removed
//! them. They sit in the reclaimer, wrapped in their close task, until the
//! timeout thread finds them releasable: close event executed, no pins, no
//! other owner.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use questnet_core::{kdebug, kerror};

use crate::connection::Connection;
use crate::lifecycle::ClosePermit;

/// Something the reclaimer holds until it can be dropped.
///
/// **Contract:** `finalize` runs exactly once, right before the reclaimer
/// drops its reference, and must finish any work that never got a pool
/// thread.
pub trait Releasable: Send + Sync {
    fn releasable(&self) -> bool;
    fn finalize(&self);
}

#[derive(Default)]
pub struct Reclaimer {
    pending: Mutex<Vec<Arc<dyn Releasable>>>,
}

impl Reclaimer {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Arc<dyn Releasable>>> {
        match self.pending.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn reclaim(&self, obj: Arc<dyn Releasable>) {
        self.lock().push(obj);
    }

    /// Finalize and drop everything releasable. Returns how many went.
    pub fn drain(&self) -> usize {
        let ready: Vec<Arc<dyn Releasable>> = {
            let mut pending = self.lock();
            let (ready, keep): (Vec<_>, Vec<_>) = std::mem::take(&mut *pending)
                .into_iter()
                .partition(|obj| obj.releasable());
            *pending = keep;
            ready
        };
        let n = ready.len();
        for obj in ready {
            obj.finalize();
        }
        n
    }

    /// Shutdown pass: finalize everything, releasable or not.
    pub fn drain_all(&self) -> usize {
        let all = std::mem::take(&mut *self.lock());
        let n = all.len();
        for obj in all {
            obj.finalize();
        }
        n
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Fires `connection_will_close` (or the cancellation) for a torn-down
/// connection and owns it until reclaimed.
pub struct CloseTask {
    conn: Mutex<Option<Arc<Connection>>>,
    closed_by_error: bool,
    executed: AtomicBool,
}

impl CloseTask {
    /// Marks the connection discarded, so a connected event still queued
    /// for it reports cancellation only.
    pub fn new(conn: Arc<Connection>, closed_by_error: bool) -> Arc<Self> {
        conn.gate().discard();
        Arc::new(Self {
            conn: Mutex::new(Some(conn)),
            closed_by_error,
            executed: AtomicBool::new(false),
        })
    }

    fn connection(&self) -> Option<Arc<Connection>> {
        match self.conn.lock() {
            Ok(g) => g.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn is_executed(&self) -> bool {
        self.executed.load(Ordering::Acquire)
    }

    /// Runs once; later calls are no-ops.
    pub fn run(&self) {
        if self.executed.swap(true, Ordering::AcqRel) {
            return;
        }
        let Some(conn) = self.connection() else { return };

        let permit = conn.gate().begin_close();
        match permit {
            ClosePermit::Denied => return,
            ClosePermit::Close => {
                if let Some(processor) = conn.processor() {
                    let info = conn.info();
                    let by_error = self.closed_by_error;
                    let r = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                        processor.connection_will_close(info, by_error)
                    }));
                    if r.is_err() {
                        kerror!("connection_will_close panicked. {}", info);
                    }
                }
            }
            ClosePermit::Cancelled => {
                if let Some(processor) = conn.processor() {
                    let info = conn.info();
                    let r = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| processor.connected(info, false)));
                    if r.is_err() {
                        kerror!("connected panicked. {}", info);
                    }
                }
            }
        }
        conn.gate().finish_close();
    }
}

impl Releasable for CloseTask {
    fn releasable(&self) -> bool {
        if !self.is_executed() {
            return false;
        }
        match self.connection() {
            // The clone made by `connection()` is the second reference.
            Some(conn) => conn.pins() == 0 && Arc::strong_count(&conn) == 2,
            None => true,
        }
    }

    fn finalize(&self) {
        if !self.is_executed() {
            kdebug!("close task finalized before a pool thread ran it");
            self.run();
        }
        let conn = match self.conn.lock() {
            Ok(mut g) => g.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        drop(conn);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{ConnectionSetup, Pinned};
    use questnet_core::{ConnectionInfo, QuestProcessor, Transport};
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct Counter {
        connected: AtomicUsize,
        closed: AtomicUsize,
    }

    impl QuestProcessor for Counter {
        fn connected(&self, _info: &ConnectionInfo, _ok: bool) {
            self.connected.fetch_add(1, Ordering::SeqCst);
        }
        fn connection_will_close(&self, _info: &ConnectionInfo, _by_error: bool) {
            self.closed.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn conn(processor: Arc<Counter>) -> Arc<Connection> {
        Arc::new(Connection::new_tcp(
            ConnectionInfo::new(-1, "127.0.0.1:9".parse().unwrap(), Transport::Tcp),
            ConnectionSetup {
                processor: Some(processor),
                ..Default::default()
            },
            1024,
            None,
        ))
    }

    #[test]
    fn test_close_after_connected() {
        let counter = Arc::new(Counter::default());
        let c = conn(counter.clone());
        c.gate().begin_connected();
        c.gate().finish_connected(true);
        let task = CloseTask::new(c, false);
        task.run();
        task.run();
        assert_eq!(counter.closed.load(Ordering::SeqCst), 1);
        assert_eq!(counter.connected.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_close_before_connected_cancels() {
        let counter = Arc::new(Counter::default());
        let task = CloseTask::new(conn(counter.clone()), true);
        task.run();
        assert_eq!(counter.connected.load(Ordering::SeqCst), 1);
        assert_eq!(counter.closed.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_reclaimer_waits_for_pins_and_execution() {
        let counter = Arc::new(Counter::default());
        let c = conn(counter.clone());
        let pin = Pinned::new(c.clone());
        let task = CloseTask::new(c, false);
        let reclaimer = Reclaimer::new();
        reclaimer.reclaim(task.clone());
        drop(task);

        assert_eq!(reclaimer.drain(), 0);
        // Still pinned after the close event ran.
        if let Some(obj) = reclaimer.lock().first() {
            assert!(!obj.releasable());
        }
        drop(pin);
        assert_eq!(reclaimer.drain(), 0);
        assert_eq!(reclaimer.drain_all(), 1);
        assert!(reclaimer.is_empty());
        assert_eq!(counter.connected.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_reclaimer_releases_executed() {
        let counter = Arc::new(Counter::default());
        let task = CloseTask::new(conn(counter), false);
        let reclaimer = Reclaimer::new();
        reclaimer.reclaim(task.clone());
        task.run();
        drop(task);
        assert_eq!(reclaimer.drain(), 1);
        assert!(reclaimer.is_empty());
    }
}
