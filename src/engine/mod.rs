//! Scheduling engine: the generic work queue, its file-sync
//! specialization, and progress reporting.

pub mod progress;
pub mod sync_queue;
pub mod work_queue;

pub use progress::{GroupProgress, ProgressReporter, StatsSource};
pub use sync_queue::{
    DELETE_GROUP, DeleteTask, STORE_GROUP, StoreTask, SyncOptions, SyncQueue, SyncReport, SyncTask,
};
pub use work_queue::WorkQueue;
