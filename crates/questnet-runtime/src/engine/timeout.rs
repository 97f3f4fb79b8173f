//! Timeout thread
//!
//! Wakes every `tick_interval`, sleeping in 10 ms slices so shutdown is
//! prompt. Each tick:
//! 1. expired correlator entries get `Timeout`
//! 2. TCP keepalive: lost connections close, expired connects fail, due
//!    connections get a `*ping`
//! 3. UDP: dead connections close, live ones flush (heartbeats)
//! 4. the reclaimer drops whatever became releasable
//!
//! On shutdown it runs one last reclaim that finalizes everything.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use questnet_core::{kdebug, kerror, kwarn, now_ms, ErrorCode, NetResult, Quest, PING_METHOD};

use super::EngineCore;
use crate::correlator::PendingCallback;

const SLICE: Duration = Duration::from_millis(10);

/// Statistics from timeout thread execution
#[derive(Debug, Clone, Default)]
pub struct TimeoutStats {
    pub ticks: u64,
    pub quests_timed_out: u64,
    pub pings_sent: u64,
    pub connections_lost: u64,
    pub connects_expired: u64,
    pub reclaimed: u64,
    /// Total time spent inside ticks
    pub tick_time: Duration,
}

/// Handle to a running timeout thread
pub struct TimeoutThreadHandle {
    handle: Option<JoinHandle<TimeoutStats>>,
    shutdown: Arc<AtomicBool>,
}

impl TimeoutThreadHandle {
    /// Request shutdown and wait for the final reclaim pass
    pub fn shutdown(mut self) -> TimeoutStats {
        self.shutdown.store(true, Ordering::Release);
        match self.handle.take().map(JoinHandle::join) {
            Some(Ok(stats)) => stats,
            Some(Err(_)) => {
                kerror!("timeout thread panicked");
                TimeoutStats::default()
            }
            None => TimeoutStats::default(),
        }
    }

    pub fn is_shutdown_requested(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }
}

pub(crate) fn spawn(core: Arc<EngineCore>) -> NetResult<TimeoutThreadHandle> {
    let shutdown = Arc::new(AtomicBool::new(false));
    let flag = shutdown.clone();
    let handle = thread::Builder::new()
        .name("qnet-timeout".into())
        .spawn(move || timeout_loop(core, flag))?;
    Ok(TimeoutThreadHandle {
        handle: Some(handle),
        shutdown,
    })
}

fn timeout_loop(core: Arc<EngineCore>, shutdown: Arc<AtomicBool>) -> TimeoutStats {
    let mut stats = TimeoutStats::default();
    let tick = core.config().tick_interval;

    'outer: loop {
        let mut slept = Duration::ZERO;
        while slept < tick {
            if shutdown.load(Ordering::Acquire) {
                break 'outer;
            }
            let step = SLICE.min(tick - slept);
            thread::sleep(step);
            slept += step;
        }

        let started = Instant::now();
        run_tick(&core, &mut stats);
        stats.ticks += 1;
        stats.tick_time += started.elapsed();
    }

    stats.reclaimed += core.reclaimer().drain_all() as u64;
    stats
}

fn run_tick(core: &Arc<EngineCore>, stats: &mut TimeoutStats) {
    let now = now_ms();

    let mut expired = Vec::new();
    core.registry().extract_expired_callbacks(now, &mut expired);
    for (info, cb) in expired {
        kdebug!("quest timed out. {}", info);
        stats.quests_timed_out += 1;
        core.deliver(cb, Err(ErrorCode::Timeout));
    }

    let sweep = core.registry().tcp_keepalive_sweep(now);
    for conn in sweep.lost {
        kwarn!("keepalive: peer silent too long, closing. {}", conn.info());
        stats.connections_lost += 1;
        core.teardown(conn, ErrorCode::InvalidConnection, true);
    }
    for conn in sweep.connect_expired {
        kwarn!("connect timed out. {}", conn.info());
        stats.connects_expired += 1;
        core.teardown(conn, ErrorCode::Timeout, true);
    }
    for (conn, timeout_ms) in sweep.pings {
        let ping = Quest::new(PING_METHOD, Vec::new());
        let cb = PendingCallback::closure(|_| {});
        match core.send_quest_on(&conn, &ping, Some(cb), timeout_ms) {
            Ok(()) => stats.pings_sent += 1,
            Err(f) => kdebug!("ping not sent ({}). {}", f.code, conn.info()),
        }
    }

    let sweep = core.registry().udp_sweep(now);
    for conn in sweep.invalid {
        kwarn!("datagram peer lost, closing. {}", conn.info());
        stats.connections_lost += 1;
        core.teardown(conn, ErrorCode::InvalidConnection, true);
    }
    for conn in sweep.live {
        // A failed flush already tore the connection down.
        let _ = core.flush(&conn);
    }

    stats.reclaimed += core.reclaimer().drain() as u64;
}
