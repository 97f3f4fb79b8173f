//! Task pool abstraction.
//!
//! Every user-visible callback (answer callbacks, connected / closing events,
//! quest processing) runs on a task pool so the reactor never blocks on
//! application code.
//!
//! # Implementors
//!
//! - `FixedPool` (questnet-module): resident workers plus burst workers up
//!   to a maximum, bounded lock-free queue.

/// A unit of work.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// **Contract:**
/// - `execute()` never blocks; a saturated or shut-down pool hands the task
///   back so the caller can decide (answer `WorkQueueFull`, run inline, ...).
/// - A panicking task must not take a worker down.
/// - `shutdown()` runs every task already accepted, then joins the workers.
pub trait TaskPool: Send + Sync {
    fn execute(&self, task: Task) -> Result<(), Task>;

    /// Workers currently running a task.
    fn busy_workers(&self) -> usize;

    /// Workers currently alive.
    fn total_workers(&self) -> usize;

    fn max_workers(&self) -> usize;

    /// Tasks accepted but not yet started.
    fn queued(&self) -> usize;

    fn shutdown(&self);
}
