//! Monotonic millisecond clock.
//!
//! All engine deadlines (quest expiry, connect deadline, keepalive) are
//! absolute values of this clock. It starts near zero on first use and
//! never goes backwards.

use std::sync::OnceLock;
use std::time::{Duration, Instant};

static EPOCH: OnceLock<Instant> = OnceLock::new();

/// Milliseconds since the first call in this process.
#[inline]
pub fn now_ms() -> u64 {
    let epoch = EPOCH.get_or_init(Instant::now);
    epoch.elapsed().as_millis() as u64
}

/// `now_ms() + d`, saturating.
#[inline]
pub fn deadline_ms(d: Duration) -> u64 {
    now_ms().saturating_add(d.as_millis() as u64)
}
