//! Reactor wakeup abstraction.
//!
//! A `Notifier` breaks the reactor out of its readiness wait when another
//! thread changes the pending sets or requests shutdown.
//!
//! # Implementors
//!
//! - `EventFdNotifier` (Linux default): eventfd counter, one read drains.
//! - `PipeNotifier` (other unix): self-pipe, read end drained until EAGAIN.

use crate::error::NetResult;
use crate::info::RawSocket;

/// Wakes the reactor.
///
/// **Contract:**
/// - `notify()` must NEVER block.
/// - Multiple calls before the reactor wakes are coalesced.
/// - `drain()` is only called by the reactor thread, after `fd()` polled
///   readable, and must leave the descriptor non-readable.
pub trait Notifier: Send + Sync {
    fn notify(&self) -> NetResult<()>;

    fn drain(&self);

    /// Descriptor to include in the read set.
    fn fd(&self) -> RawSocket;
}
