//! File synchronization on top of the work queue.
//!
//! Two groups: `store` copies sources to the destination with a
//! configurable number of workers; `delete` removes destination files on a
//! single worker. Whether a store creates, overwrites or skips is decided
//! inside the task, so enqueueing never blocks on destination I/O.

use std::io::{self, Write};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::destination::{Destination, DestinationFile, SourceFile};
use crate::engine::progress::ProgressReporter;
use crate::engine::work_queue::WorkQueue;
use crate::error::Result;
use crate::model::*;
use crate::prompt::{Prompt, TerminalPrompt};
use crate::task::Task;
use crate::telemetry::metrics;

pub const STORE_GROUP: &str = "store";
pub const DELETE_GROUP: &str = "delete";

/// Knobs for a [`SyncQueue`].
#[derive(Debug, Clone)]
pub struct SyncOptions {
    /// Concurrent store workers. The delete group always has one.
    pub store_workers: usize,
    /// Answer yes to every overwrite without prompting.
    pub assume_yes: bool,
    /// Decide and report everything, mutate nothing.
    pub dry_run: bool,
    /// Progress sampling interval.
    pub report_interval: Duration,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            store_workers: 4,
            assume_yes: false,
            dry_run: false,
            report_interval: Duration::from_secs(1),
        }
    }
}

/// Serializable end-of-run summary.
#[derive(Debug, Clone, Serialize)]
pub struct SyncReport {
    pub dry_run: bool,
    pub elapsed_secs: f64,
    pub bytes_transferred: u64,
    pub groups: QueueStats,
}

// ---------------------------------------------------------------------------
// Shared task context
// ---------------------------------------------------------------------------

/// State every sync task sees.
struct SyncContext {
    dst: Arc<dyn Destination>,
    assume_yes: bool,
    dry_run: bool,
    prompt: Box<dyn Prompt>,
    /// Serializes prompts so questions from different workers never mix.
    confirm_lock: Mutex<()>,
    /// Weak: the reporter samples the queue, which owns the tasks holding
    /// this context.
    reporter: Weak<ProgressReporter>,
}

impl SyncContext {
    fn confirm(&self, message: &str) -> bool {
        if self.assume_yes {
            return true;
        }
        let _guard = self.confirm_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let reporter = self.reporter.upgrade();
        if let Some(ref reporter) = reporter {
            reporter.suspend();
        }
        let answer = self.prompt.confirm(message);
        if let Some(ref reporter) = reporter {
            reporter.resume();
        }
        answer
    }
}

// ---------------------------------------------------------------------------
// Tasks
// ---------------------------------------------------------------------------

/// Copy one source file to the destination.
///
/// The existence check, the confirmation and the copy are not locked
/// per destination path: two store tasks for the same name can interleave
/// and the last copy wins.
pub struct StoreTask {
    ctx: Arc<SyncContext>,
    src: Arc<dyn SourceFile>,
    copying: AtomicBool,
    copied: AtomicU64,
}

impl StoreTask {
    pub fn name(&self) -> &str {
        self.src.name()
    }

    fn run(&self) -> Result<Outcome> {
        let name = self.src.name();
        let dst_file = self.ctx.dst.file(name)?;

        let outcome = match dst_file.stat()? {
            None => Outcome::Created,
            Some(stat) if stat.size == self.src.size() && stat.modified >= self.src.modified() => {
                debug!(name, reason = "stat", "skipping store");
                return Ok(Outcome::SkippedStat);
            }
            Some(_) => {
                if !self.ctx.confirm(&format!("File {name} exists, overwrite?")) {
                    debug!(name, reason = "user", "skipping store");
                    return Ok(Outcome::SkippedUser);
                }
                Outcome::Updated
            }
        };

        if self.ctx.dry_run {
            info!(name, action = %outcome, "dry run, not copying");
        } else {
            self.copy(dst_file.as_ref())?;
            debug!(name, action = %outcome, bytes = self.copied.load(Ordering::Relaxed), "stored");
        }

        self.src.cleanup()?;
        Ok(outcome)
    }

    fn copy(&self, dst_file: &dyn DestinationFile) -> Result<()> {
        self.copying.store(true, Ordering::SeqCst);
        let result = dst_file.store(self.src.as_ref());
        let written = match &result {
            Ok(n) => *n,
            Err(_) => self.src.bytes_read(),
        };
        self.copied.store(written, Ordering::SeqCst);
        self.copying.store(false, Ordering::SeqCst);

        result?;
        metrics::bytes_transferred().add(written, &[]);
        Ok(())
    }
}

/// Remove one destination file.
pub struct DeleteTask {
    ctx: Arc<SyncContext>,
    file: Arc<dyn DestinationFile>,
}

impl DeleteTask {
    pub fn name(&self) -> &str {
        self.file.name()
    }

    fn run(&self) -> Result<Outcome> {
        if self.ctx.dry_run {
            info!(name = self.file.name(), "dry run, not deleting");
        } else {
            self.file.delete()?;
            debug!(name = self.file.name(), "deleted");
        }
        Ok(Outcome::Deleted)
    }
}

/// The two kinds of work a sync queue runs.
pub enum SyncTask {
    Store(StoreTask),
    Delete(DeleteTask),
}

impl Task for SyncTask {
    fn group(&self) -> &str {
        match self {
            SyncTask::Store(_) => STORE_GROUP,
            SyncTask::Delete(_) => DELETE_GROUP,
        }
    }

    fn execute(&self) -> Result<Execution<Self>> {
        let outcome = match self {
            SyncTask::Store(task) => task.run()?,
            SyncTask::Delete(task) => task.run()?,
        };
        Ok(Execution::new(outcome))
    }

    fn bytes_processed(&self) -> u64 {
        match self {
            SyncTask::Store(task) => {
                if task.copying.load(Ordering::SeqCst) {
                    task.src.bytes_read()
                } else {
                    task.copied.load(Ordering::SeqCst)
                }
            }
            // One file, not bytes.
            SyncTask::Delete(_) => 1,
        }
    }

    fn bytes_total(&self) -> u64 {
        match self {
            SyncTask::Store(task) => task.src.size(),
            SyncTask::Delete(_) => 1,
        }
    }

    fn description(&self) -> String {
        match self {
            SyncTask::Store(task) => format!("store {}", task.name()),
            SyncTask::Delete(task) => format!("delete {}", task.name()),
        }
    }

    fn allow_retry(&self) -> bool {
        matches!(self, SyncTask::Store(_))
    }
}

// ---------------------------------------------------------------------------
// Queue
// ---------------------------------------------------------------------------

/// A two-group work queue wired to a destination.
pub struct SyncQueue {
    queue: Arc<WorkQueue<SyncTask>>,
    ctx: Arc<SyncContext>,
    reporter: Arc<ProgressReporter>,
    needs_cleanup: AtomicBool,
    shut_down: AtomicBool,
}

impl SyncQueue {
    /// Prompt and report progress on the terminal's stderr, leaving stdout
    /// to the caller.
    pub fn new(dst: Arc<dyn Destination>, options: SyncOptions) -> Result<Self> {
        Self::with_collaborators(
            dst,
            options,
            Box::new(TerminalPrompt),
            Box::new(io::stderr()),
        )
    }

    pub fn with_collaborators(
        dst: Arc<dyn Destination>,
        options: SyncOptions,
        prompt: Box<dyn Prompt>,
        output: Box<dyn Write + Send>,
    ) -> Result<Self> {
        let queue = Arc::new(WorkQueue::new([
            (STORE_GROUP, options.store_workers),
            (DELETE_GROUP, 1),
        ])?);

        let mut reporter = ProgressReporter::new(queue.clone(), options.report_interval, output)
            .bytes_group(STORE_GROUP)
            .count_label(DELETE_GROUP, "deleted");
        if options.dry_run {
            reporter = reporter.prefix("[dry run] ");
        }
        let reporter = Arc::new(reporter);

        let ctx = Arc::new(SyncContext {
            dst,
            assume_yes: options.assume_yes,
            dry_run: options.dry_run,
            prompt,
            confirm_lock: Mutex::new(()),
            reporter: Arc::downgrade(&reporter),
        });

        Ok(Self {
            queue,
            ctx,
            reporter,
            needs_cleanup: AtomicBool::new(false),
            shut_down: AtomicBool::new(false),
        })
    }

    /// Start the workers and the progress reporter.
    pub fn start(&self) -> Result<()> {
        self.queue.start()?;
        self.reporter.start()
    }

    /// Queue a copy of `src`. Whether it creates, overwrites or skips is
    /// decided when the task runs.
    pub fn store(&self, src: Arc<dyn SourceFile>) -> Result<TaskId> {
        let size = src.size();
        let task = SyncTask::Store(StoreTask {
            ctx: Arc::clone(&self.ctx),
            src,
            copying: AtomicBool::new(false),
            copied: AtomicU64::new(0),
        });
        let id = self.queue.enqueue_default(task)?;
        self.reporter.add_total(STORE_GROUP, 1, size);
        Ok(id)
    }

    /// Queue removal of `file`. A destination cleanup runs at shutdown.
    pub fn delete(&self, file: Arc<dyn DestinationFile>) -> Result<TaskId> {
        let task = SyncTask::Delete(DeleteTask {
            ctx: Arc::clone(&self.ctx),
            file,
        });
        let id = self.queue.enqueue_default(task)?;
        self.needs_cleanup.store(true, Ordering::SeqCst);
        self.reporter.add_total(DELETE_GROUP, 1, 0);
        Ok(id)
    }

    /// Queue removal of the destination file called `name`.
    pub fn delete_name(&self, name: &str) -> Result<TaskId> {
        let file = self.ctx.dst.file(name)?;
        self.delete(file)
    }

    /// Thread-safe yes/no gate; see [`SyncOptions::assume_yes`].
    pub fn confirm(&self, message: &str) -> bool {
        self.ctx.confirm(message)
    }

    pub fn wait_for_finish(&self) {
        self.queue.wait_for_finish();
    }

    pub fn requeue_errors(&self) -> Result<usize> {
        self.queue.requeue_errors()
    }

    pub fn get_stats(&self) -> QueueStats {
        self.queue.get_stats()
    }

    pub fn tasks_pending(&self) -> bool {
        self.queue.tasks_pending()
    }

    pub fn has_errors(&self) -> bool {
        self.queue.has_errors()
    }

    pub fn has_retryable_errors(&self) -> bool {
        self.queue.has_retryable_errors()
    }

    pub fn errors(&self) -> Vec<TaskRecord<SyncTask>> {
        self.queue.errors()
    }

    pub fn completed(&self) -> Vec<TaskRecord<SyncTask>> {
        self.queue.completed()
    }

    pub fn reporter(&self) -> &ProgressReporter {
        &self.reporter
    }

    pub fn report(&self) -> SyncReport {
        let groups = self.queue.get_stats();
        SyncReport {
            dry_run: self.ctx.dry_run,
            elapsed_secs: self.reporter.elapsed().as_secs_f64(),
            bytes_transferred: groups
                .get(STORE_GROUP)
                .map(|g| g.completed_bytes)
                .unwrap_or(0),
            groups,
        }
    }

    /// Clean up the destination if anything was deleted, print the final
    /// progress line, then stop the workers. Safe to call twice.
    pub fn shutdown(&self) -> Result<()> {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let cleanup = if self.needs_cleanup.load(Ordering::SeqCst) && !self.ctx.dry_run {
            self.ctx.dst.cleanup()
        } else {
            Ok(())
        };
        if let Err(ref e) = cleanup {
            warn!(error = %e, "destination cleanup failed");
        }

        self.reporter.shutdown();
        self.reporter.final_report();
        self.queue.shutdown();
        cleanup
    }
}
