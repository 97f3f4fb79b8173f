//! Reactor loop.
//!
//! Single thread. Each iteration:
//! 1. poll every I/O-enabled socket, the write-wanters and the wakeup fd
//! 2. drain the wakeup fd, then check the running flag
//! 3. drop errored sockets, dispatch read/write readiness
//! 4. merge the pending quit, new and write sets, in that order
//!
//! Write interest is one-shot: a reported socket leaves the write set until
//! someone calls `request_write` again.

use std::collections::HashSet;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use questnet_core::{kdebug, kerror, ErrorCode, RawSocket};
use questnet_module::{PollSet, Readiness};

use super::EngineCore;
use crate::io;

/// How long shutdown waits for the registry to drain.
const CLEAN_WAIT: Duration = Duration::from_secs(2);

/// Counters returned when the reactor exits.
#[derive(Debug, Clone, Default)]
pub struct ReactorStats {
    pub polls: u64,
    pub wakeups: u64,
    pub readable: u64,
    pub writable: u64,
    pub errored: u64,
}

pub(crate) fn run(core: Arc<EngineCore>) -> ReactorStats {
    let mut stats = ReactorStats::default();
    let mut poll = PollSet::new();
    let mut ready = Readiness::default();
    let mut want_write: HashSet<RawSocket> = HashSet::new();
    let mut targets: Vec<RawSocket> = Vec::new();
    let wake_fd = core.notifier.fd();

    loop {
        core.registry().poll_targets(&want_write, &mut targets);
        if let Err(e) = poll.wait(wake_fd, &targets, &want_write, -1, &mut ready) {
            kerror!("poll failed: errno {}", e);
            if !core.is_running() {
                break;
            }
            thread::sleep(Duration::from_millis(10));
            continue;
        }
        stats.polls += 1;

        if ready.woken {
            stats.wakeups += 1;
            core.notifier.drain();
        }
        if !core.is_running() {
            break;
        }

        for &fd in &ready.errored {
            stats.errored += 1;
            want_write.remove(&fd);
            io::on_error(&core, fd);
        }
        for &fd in &ready.writable {
            want_write.remove(&fd);
        }
        for &fd in &ready.readable {
            stats.readable += 1;
            let can_write = ready.writable.contains(&fd);
            io::process(&core, fd, true, can_write);
        }
        for &fd in &ready.writable {
            if !ready.readable.contains(&fd) {
                stats.writable += 1;
                io::process(&core, fd, false, true);
            }
        }

        core.merge_pending(&mut want_write);
    }

    clean(&core);
    stats
}

/// Tear down every remaining connection with `ConnectionClosed`.
fn clean(core: &Arc<EngineCore>) {
    let remaining = core.registry().take_all();
    kdebug!("reactor exiting, closing {} connections", remaining.len());
    for conn in remaining {
        core.teardown(conn, ErrorCode::ConnectionClosed, false);
    }
    if !core.registry().wait_for_empty(CLEAN_WAIT) {
        kerror!("{} connections still registered after shutdown", core.registry().len());
    }
}
