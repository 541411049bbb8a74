//! The task capability consumed by the work queue.

use crate::error::Result;
use crate::model::Execution;

/// A unit of work that belongs to exactly one named group.
///
/// `execute` runs on a worker thread while other threads may call
/// `bytes_processed` concurrently, so progress must be readable through
/// `&self` (atomics or interior locking).
pub trait Task: Send + Sync + Sized + 'static {
    /// Group whose heap and workers handle this task.
    fn group(&self) -> &str;

    /// Perform the work. May hand back a follow-up task.
    fn execute(&self) -> Result<Execution<Self>>;

    /// Monotonic progress metric. Partial while the task is in flight.
    fn bytes_processed(&self) -> u64;

    /// Full size of the work in the same unit as `bytes_processed`.
    /// Credited to the group's skipped bytes when the task skips.
    fn bytes_total(&self) -> u64 {
        0
    }

    /// Human-readable description for logs and error listings.
    fn description(&self) -> String;

    /// Whether a failure of this task is worth retrying.
    fn allow_retry(&self) -> bool {
        false
    }
}
