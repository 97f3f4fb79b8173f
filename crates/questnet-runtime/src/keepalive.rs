//! TCP keepalive bookkeeping.
//!
//! The reactor stamps every received frame; the timeout thread asks what to
//! do. A connection is lost after
//! `ping_timeout * max_ping_retry + ping_interval` without receiving
//! anything. A ping is due once `ping_interval` passed since the last frame
//! and the previous ping has had `ping_timeout` to come back.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeepAliveParams {
    /// Zero means "use the client's quest timeout".
    pub ping_timeout: Duration,
    pub ping_interval: Duration,
    pub max_ping_retry: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeepAliveAction {
    Idle,
    /// Send a ping with this timeout.
    Ping(u64),
    Lost,
}

#[derive(Debug)]
pub struct KeepAlive {
    ping_timeout_ms: u64,
    ping_interval_ms: u64,
    unreceived_threshold_ms: u64,
    last_recv_ms: AtomicU64,
    last_ping_ms: AtomicU64,
}

impl KeepAlive {
    pub fn new(params: KeepAliveParams, quest_timeout: Duration, now_ms: u64) -> Self {
        let ping_timeout = if params.ping_timeout.is_zero() {
            quest_timeout
        } else {
            params.ping_timeout
        };
        let ping_timeout_ms = ping_timeout.as_millis() as u64;
        let ping_interval_ms = params.ping_interval.as_millis() as u64;
        Self {
            ping_timeout_ms,
            ping_interval_ms,
            unreceived_threshold_ms: ping_timeout_ms
                .saturating_mul(params.max_ping_retry.max(1) as u64)
                .saturating_add(ping_interval_ms),
            last_recv_ms: AtomicU64::new(now_ms),
            last_ping_ms: AtomicU64::new(0),
        }
    }

    pub fn touch_recv(&self, now_ms: u64) {
        self.last_recv_ms.fetch_max(now_ms, Ordering::Relaxed);
    }

    pub fn unreceived_threshold_ms(&self) -> u64 {
        self.unreceived_threshold_ms
    }

    pub fn ping_timeout_ms(&self) -> u64 {
        self.ping_timeout_ms
    }

    /// Decide and, for `Ping`, record the ping time.
    pub fn check(&self, now_ms: u64) -> KeepAliveAction {
        let last_recv = self.last_recv_ms.load(Ordering::Relaxed);
        let silent = now_ms.saturating_sub(last_recv);
        if silent > self.unreceived_threshold_ms {
            return KeepAliveAction::Lost;
        }
        let last_ping = self.last_ping_ms.load(Ordering::Relaxed);
        if silent >= self.ping_interval_ms && now_ms >= last_ping.saturating_add(self.ping_timeout_ms) {
            self.last_ping_ms.store(now_ms, Ordering::Relaxed);
            return KeepAliveAction::Ping(self.ping_timeout_ms);
        }
        KeepAliveAction::Idle
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> KeepAliveParams {
        KeepAliveParams {
            ping_timeout: Duration::from_millis(100),
            ping_interval: Duration::from_millis(1000),
            max_ping_retry: 3,
        }
    }

    #[test]
    fn test_threshold() {
        let ka = KeepAlive::new(params(), Duration::from_secs(5), 0);
        assert_eq!(ka.unreceived_threshold_ms(), 100 * 3 + 1000);
    }

    #[test]
    fn test_zero_ping_timeout_uses_quest_timeout() {
        let p = KeepAliveParams {
            ping_timeout: Duration::ZERO,
            ..params()
        };
        let ka = KeepAlive::new(p, Duration::from_millis(250), 0);
        assert_eq!(ka.ping_timeout_ms(), 250);
    }

    #[test]
    fn test_ping_schedule() {
        let ka = KeepAlive::new(params(), Duration::from_secs(5), 10_000);
        assert_eq!(ka.check(10_500), KeepAliveAction::Idle);
        assert_eq!(ka.check(11_000), KeepAliveAction::Ping(100));
        // Previous ping still in flight.
        assert_eq!(ka.check(11_050), KeepAliveAction::Idle);
        assert_eq!(ka.check(11_100), KeepAliveAction::Ping(100));
        ka.touch_recv(11_150);
        assert_eq!(ka.check(11_200), KeepAliveAction::Idle);
        assert_eq!(ka.check(11_150 + 1301), KeepAliveAction::Lost);
    }
}
