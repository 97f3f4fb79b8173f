//! `FixedPool` - default `TaskPool` implementation.
//!
//! Resident workers are spawned at creation and live until shutdown. When a
//! task arrives and no worker is parked, a burst worker is spawned, up to
//! `max_workers`; burst workers exit after `idle_timeout` without work, as
//! long as that leaves at least `resident` workers alive.
//!
//! Tasks go through a bounded lock-free MPMC queue. Idle workers register
//! a [`Sleeper`] in a second queue and park; `execute()` unparks one. A
//! worker that found work on its own clears its `waiting` flag, which turns
//! its queued entry stale. Parking uses a short timeout so a lost wakeup
//! costs at most one slice.

use questnet_core::pool::{Task, TaskPool};
use questnet_core::{kdebug, kerror, kwarn, NetError, NetResult};

use crossbeam_queue::ArrayQueue;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle, Thread};
use std::time::{Duration, Instant};

const PARK_SLICE: Duration = Duration::from_millis(10);

struct Sleeper {
    thread: Thread,
    waiting: Arc<AtomicBool>,
}

struct PoolInner {
    queue: ArrayQueue<Task>,
    sleepers: ArrayQueue<Sleeper>,
    busy: AtomicUsize,
    alive: AtomicUsize,
    shutdown: AtomicBool,
    next_id: AtomicUsize,
    resident: usize,
    max: usize,
    idle_timeout: Duration,
    name: String,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

pub struct FixedPool {
    inner: Arc<PoolInner>,
}

impl FixedPool {
    /// `resident` workers start now; at most `max` ever run at once;
    /// `queue_depth` bounds tasks accepted but not started.
    pub fn new(name: &str, resident: usize, max: usize, queue_depth: usize) -> NetResult<Self> {
        Self::with_idle_timeout(name, resident, max, queue_depth, Duration::from_secs(5))
    }

    /// Same as [`FixedPool::new`] with how long a burst worker idles before
    /// it exits.
    pub fn with_idle_timeout(
        name: &str,
        resident: usize,
        max: usize,
        queue_depth: usize,
        idle_timeout: Duration,
    ) -> NetResult<Self> {
        let resident = resident.max(1);
        let max = max.max(resident);
        let inner = Arc::new(PoolInner {
            queue: ArrayQueue::new(queue_depth.max(1)),
            sleepers: ArrayQueue::new(max * 4),
            busy: AtomicUsize::new(0),
            alive: AtomicUsize::new(0),
            shutdown: AtomicBool::new(false),
            next_id: AtomicUsize::new(0),
            resident,
            max,
            idle_timeout,
            name: name.to_string(),
            handles: Mutex::new(Vec::with_capacity(max)),
        });

        for _ in 0..resident {
            inner.alive.fetch_add(1, Ordering::SeqCst);
            spawn_worker(&inner, true).map_err(|e| {
                inner.alive.fetch_sub(1, Ordering::SeqCst);
                inner.shutdown.store(true, Ordering::SeqCst);
                NetError::Os(e.raw_os_error().unwrap_or(0))
            })?;
        }

        Ok(FixedPool { inner })
    }

    fn wake_or_grow(&self) {
        while let Some(sleeper) = self.inner.sleepers.pop() {
            if sleeper.waiting.swap(false, Ordering::AcqRel) {
                sleeper.thread.unpark();
                return;
            }
        }
        // Everyone is busy: try to add a burst worker.
        let mut alive = self.inner.alive.load(Ordering::SeqCst);
        while alive < self.inner.max {
            match self.inner.alive.compare_exchange(
                alive,
                alive + 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => {
                    if let Err(e) = spawn_worker(&self.inner, false) {
                        self.inner.alive.fetch_sub(1, Ordering::SeqCst);
                        kwarn!("{}: burst worker spawn failed: {}", self.inner.name, e);
                    }
                    return;
                }
                Err(now) => alive = now,
            }
        }
    }
}

impl PoolInner {
    /// Give up one worker slot unless that would drop below `resident`.
    fn retire(&self) -> bool {
        let mut alive = self.alive.load(Ordering::SeqCst);
        while alive > self.resident {
            match self.alive.compare_exchange(alive, alive - 1, Ordering::SeqCst, Ordering::SeqCst) {
                Ok(_) => return true,
                Err(now) => alive = now,
            }
        }
        false
    }
}

fn spawn_worker(inner: &Arc<PoolInner>, resident: bool) -> std::io::Result<()> {
    let id = inner.next_id.fetch_add(1, Ordering::Relaxed);
    let worker = Arc::clone(inner);
    let handle = thread::Builder::new()
        .name(format!("{}-{}", inner.name, id))
        .spawn(move || worker_loop(worker, resident))?;
    let mut handles = match inner.handles.lock() {
        Ok(h) => h,
        Err(poisoned) => poisoned.into_inner(),
    };
    handles.retain(|h| !h.is_finished());
    handles.push(handle);
    Ok(())
}

impl TaskPool for FixedPool {
    fn execute(&self, task: Task) -> Result<(), Task> {
        if self.inner.shutdown.load(Ordering::Acquire) {
            return Err(task);
        }
        self.inner.queue.push(task)?;
        self.wake_or_grow();
        Ok(())
    }

    fn busy_workers(&self) -> usize {
        self.inner.busy.load(Ordering::Relaxed)
    }

    fn total_workers(&self) -> usize {
        self.inner.alive.load(Ordering::Relaxed)
    }

    fn max_workers(&self) -> usize {
        self.inner.max
    }

    fn queued(&self) -> usize {
        self.inner.queue.len()
    }

    fn shutdown(&self) {
        if self.inner.shutdown.swap(true, Ordering::SeqCst) {
            return;
        }
        while let Some(sleeper) = self.inner.sleepers.pop() {
            sleeper.thread.unpark();
        }
        let handles: Vec<JoinHandle<()>> = match self.inner.handles.lock() {
            Ok(mut h) => h.drain(..).collect(),
            Err(poisoned) => poisoned.into_inner().drain(..).collect(),
        };
        let me = thread::current().id();
        for handle in handles {
            if handle.thread().id() == me {
                continue;
            }
            if handle.join().is_err() {
                kerror!("{}: worker exited by panic", self.inner.name);
            }
        }
        kdebug!("{}: shut down", self.inner.name);
    }
}

impl Drop for FixedPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(inner: Arc<PoolInner>, resident: bool) {
    let waiting = Arc::new(AtomicBool::new(false));
    let mut idle_since = Instant::now();
    loop {
        if let Some(task) = inner.queue.pop() {
            waiting.store(false, Ordering::Release);
            inner.busy.fetch_add(1, Ordering::Relaxed);
            if catch_unwind(AssertUnwindSafe(task)).is_err() {
                kerror!("{}: task panicked", inner.name);
            }
            inner.busy.fetch_sub(1, Ordering::Relaxed);
            idle_since = Instant::now();
            continue;
        }

        // Queue is empty here, so shutdown never drops accepted work.
        if inner.shutdown.load(Ordering::Acquire) {
            break;
        }
        if !resident && idle_since.elapsed() >= inner.idle_timeout {
            if inner.retire() {
                waiting.store(false, Ordering::Release);
                kdebug!("{}: idle burst worker exits", inner.name);
                return;
            }
            idle_since = Instant::now();
        }

        if !waiting.swap(true, Ordering::AcqRel) {
            let me = Sleeper {
                thread: thread::current(),
                waiting: Arc::clone(&waiting),
            };
            if inner.sleepers.push(me).is_err() {
                waiting.store(false, Ordering::Release);
            }
        }
        thread::park_timeout(PARK_SLICE);
    }
    waiting.store(false, Ordering::Release);
    inner.alive.fetch_sub(1, Ordering::SeqCst);
}
