//! Multi-group priority work queue.
//!
//! Each group has its own min-heap of waiting tasks, its own condition
//! variable and a fixed number of worker threads. All task containers live
//! behind one mutex; the condition variables share it.

use std::cmp::Ordering as CmpOrdering;
use std::collections::{BTreeMap, BinaryHeap, HashMap};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Instant;

use chrono::Utc;
use opentelemetry::KeyValue;
use tracing::{debug, error, info, warn};

use crate::engine::progress::StatsSource;
use crate::error::{Error, Result};
use crate::model::*;
use crate::task::Task;
use crate::telemetry::metrics;
use crate::telemetry::work::{record_outcome, start_task_span};

/// The work queue. Owns every task container and all worker threads.
pub struct WorkQueue<T: Task> {
    shared: Arc<Shared<T>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

struct Shared<T> {
    state: Mutex<QueueState<T>>,
    /// Max worker count per group.
    limits: BTreeMap<String, usize>,
    /// One condition variable per group, all paired with `state`.
    signals: HashMap<String, Condvar>,
    /// Signalled whenever the queue may have drained, and on shutdown.
    drained: Condvar,
    running: AtomicBool,
    started: AtomicBool,
    stopped: AtomicBool,
}

struct QueueState<T> {
    groups: BTreeMap<String, GroupState<T>>,
    next_sequence: u64,
    /// Set by `wait_for_finish`, cleared by new work.
    finished: bool,
}

struct GroupState<T> {
    waiting: BinaryHeap<Waiting<T>>,
    pending: Vec<TaskRecord<T>>,
    completed: Vec<TaskRecord<T>>,
    errors: Vec<TaskRecord<T>>,
    skipped: usize,
    skipped_bytes: u64,
}

impl<T> GroupState<T> {
    fn new() -> Self {
        Self {
            waiting: BinaryHeap::new(),
            pending: Vec::new(),
            completed: Vec::new(),
            errors: Vec::new(),
            skipped: 0,
            skipped_bytes: 0,
        }
    }

    fn is_drained(&self) -> bool {
        self.waiting.is_empty() && self.pending.is_empty()
    }
}

impl<T> QueueState<T> {
    fn is_drained(&self) -> bool {
        self.groups.values().all(GroupState::is_drained)
    }
}

// ---------------------------------------------------------------------------
// Heap entry
// ---------------------------------------------------------------------------

/// Heap entry keyed by `(priority, sequence)`.
///
/// `BinaryHeap` is a max-heap, so the comparison is reversed: the lowest
/// priority value, then the lowest sequence, sits on top.
struct Waiting<T> {
    priority: i32,
    sequence: u64,
    record: TaskRecord<T>,
}

impl<T> PartialEq for Waiting<T> {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.sequence == other.sequence
    }
}

impl<T> Eq for Waiting<T> {}

impl<T> PartialOrd for Waiting<T> {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for Waiting<T> {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other
            .priority
            .cmp(&self.priority)
            .then_with(|| other.sequence.cmp(&self.sequence))
    }
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

impl<T: Task> WorkQueue<T> {
    /// Create a queue from `group name -> max concurrent workers`.
    pub fn new<I, S>(groups: I) -> Result<Self>
    where
        I: IntoIterator<Item = (S, usize)>,
        S: Into<String>,
    {
        let mut limits = BTreeMap::new();
        for (name, count) in groups {
            let name = name.into();
            if count == 0 {
                return Err(Error::Config(format!(
                    "group '{name}' needs at least one worker"
                )));
            }
            limits.insert(name, count);
        }
        if limits.is_empty() {
            return Err(Error::Config("work queue needs at least one group".into()));
        }

        let signals = limits.keys().map(|name| (name.clone(), Condvar::new())).collect();
        let groups = limits.keys().map(|name| (name.clone(), GroupState::new())).collect();

        Ok(Self {
            shared: Arc::new(Shared {
                state: Mutex::new(QueueState {
                    groups,
                    next_sequence: 0,
                    finished: false,
                }),
                limits,
                signals,
                drained: Condvar::new(),
                running: AtomicBool::new(false),
                started: AtomicBool::new(false),
                stopped: AtomicBool::new(false),
            }),
            workers: Mutex::new(Vec::new()),
        })
    }

    /// Names of the configured groups.
    pub fn groups(&self) -> impl Iterator<Item = &str> {
        self.shared.limits.keys().map(String::as_str)
    }

    /// Queue a task with the given priority. Lower values run first; equal
    /// priorities run in enqueue order.
    pub fn enqueue(&self, task: T, priority: i32) -> Result<TaskId> {
        if self.shared.stopped.load(Ordering::SeqCst) {
            return Err(Error::ShutDown);
        }
        self.shared.push(new_record(task, priority, 0))
    }

    /// Queue a task with [`DEFAULT_PRIORITY`].
    pub fn enqueue_default(&self, task: T) -> Result<TaskId> {
        self.enqueue(task, DEFAULT_PRIORITY)
    }

    /// Spawn the configured number of worker threads for every group.
    pub fn start(&self) -> Result<()> {
        if self.shared.stopped.load(Ordering::SeqCst) {
            return Err(Error::ShutDown);
        }
        if self.shared.started.swap(true, Ordering::SeqCst) {
            return Err(Error::AlreadyStarted);
        }
        self.shared.running.store(true, Ordering::SeqCst);

        let mut workers = self.lock_workers();
        for (group, &count) in &self.shared.limits {
            for n in 0..count {
                let shared = Arc::clone(&self.shared);
                let group_name = group.clone();
                let handle = thread::Builder::new()
                    .name(format!("syncq-{group}-{n}"))
                    .spawn(move || shared.run_worker(&group_name))?;
                workers.push(handle);
            }
            debug!(group = %group, workers = count, "group workers started");
        }

        info!(threads = workers.len(), "work queue started");
        Ok(())
    }

    /// Count a skip against a group without touching any task list.
    pub fn skip_task(&self, group: &str) -> Result<()> {
        let mut state = self.shared.lock();
        let group_state = state
            .groups
            .get_mut(group)
            .ok_or_else(|| Error::UnknownGroup(group.to_string()))?;
        group_state.skipped += 1;
        Ok(())
    }

    /// Block until every group has an empty heap and no task in flight.
    ///
    /// Returns immediately if the queue is not running (never started or
    /// already shut down), since nothing would drain it.
    pub fn wait_for_finish(&self) {
        let mut state = self.shared.lock();
        while self.shared.running.load(Ordering::SeqCst) && !state.is_drained() {
            state = self
                .shared
                .drained
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
        if state.is_drained() {
            state.finished = true;
        }
    }

    /// True once `wait_for_finish` observed a drained queue and no work
    /// has been added since.
    pub fn is_finished(&self) -> bool {
        self.shared.lock().finished
    }

    /// Move every errored task back into its group heap, keeping its
    /// priority and attempt count. Returns how many tasks were requeued.
    pub fn requeue_errors(&self) -> Result<usize> {
        if self.shared.stopped.load(Ordering::SeqCst) {
            return Err(Error::ShutDown);
        }

        let mut touched = Vec::new();
        let mut count = 0;
        {
            let mut state = self.shared.lock();
            let mut requeued = Vec::new();
            for (name, group) in state.groups.iter_mut() {
                if !group.errors.is_empty() {
                    touched.push(name.clone());
                }
                requeued.extend(group.errors.drain(..));
            }
            for mut record in requeued {
                record.outcome = None;
                record.error = None;
                record.finished_at = None;
                let sequence = state.next_sequence;
                state.next_sequence += 1;
                if let Some(group) = state.groups.get_mut(&record.group) {
                    group.waiting.push(Waiting {
                        priority: record.priority,
                        sequence,
                        record,
                    });
                    count += 1;
                }
            }
            state.finished = false;
        }

        for name in &touched {
            self.shared.signals[name].notify_all();
        }
        if count > 0 {
            info!(count, "requeued errored tasks");
        }
        Ok(count)
    }

    /// Per-group counters. `completed_bytes` includes partial progress of
    /// tasks still in flight.
    pub fn get_stats(&self) -> QueueStats {
        let state = self.shared.lock();
        state
            .groups
            .iter()
            .map(|(name, group)| {
                let completed_bytes = group
                    .completed
                    .iter()
                    .chain(group.pending.iter())
                    .map(|r| r.task.bytes_processed())
                    .sum();
                let stats = GroupStats {
                    waiting: group.waiting.len(),
                    pending: group.pending.len(),
                    completed: group.completed.len(),
                    completed_bytes,
                    skipped: group.skipped,
                    skipped_bytes: group.skipped_bytes,
                    errors: group.errors.len(),
                };
                (name.clone(), stats)
            })
            .collect()
    }

    /// True while any task is waiting or in flight.
    pub fn tasks_pending(&self) -> bool {
        !self.shared.lock().is_drained()
    }

    pub fn has_errors(&self) -> bool {
        self.shared
            .lock()
            .groups
            .values()
            .any(|g| !g.errors.is_empty())
    }

    /// True if any errored task reports `allow_retry()`.
    pub fn has_retryable_errors(&self) -> bool {
        self.shared
            .lock()
            .groups
            .values()
            .flat_map(|g| g.errors.iter())
            .any(|r| r.task.allow_retry())
    }

    /// Snapshot of errored tasks across all groups.
    pub fn errors(&self) -> Vec<TaskRecord<T>> {
        self.shared
            .lock()
            .groups
            .values()
            .flat_map(|g| g.errors.iter().cloned())
            .collect()
    }

    /// Snapshot of completed tasks across all groups.
    pub fn completed(&self) -> Vec<TaskRecord<T>> {
        self.shared
            .lock()
            .groups
            .values()
            .flat_map(|g| g.completed.iter().cloned())
            .collect()
    }

    /// Stop dispatching, let in-flight tasks finish, join every worker.
    ///
    /// Safe to call more than once.
    pub fn shutdown(&self) {
        self.shared.stopped.store(true, Ordering::SeqCst);
        {
            let _state = self.shared.lock();
            self.shared.running.store(false, Ordering::SeqCst);
        }
        for signal in self.shared.signals.values() {
            signal.notify_all();
        }
        self.shared.drained.notify_all();

        let handles: Vec<_> = self.lock_workers().drain(..).collect();
        if handles.is_empty() {
            return;
        }
        // The last handle can be dropped by a task on one of our own workers.
        let current = thread::current().id();
        for handle in handles {
            if handle.thread().id() == current {
                debug!("shutdown called from a worker, not joining it");
                continue;
            }
            let name = handle.thread().name().unwrap_or("worker").to_string();
            if handle.join().is_err() {
                warn!(thread = %name, "worker thread panicked");
            }
        }
        info!("work queue shut down");
    }

    fn lock_workers(&self) -> MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.workers.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<T: Task> Drop for WorkQueue<T> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl<T: Task> StatsSource for WorkQueue<T> {
    fn stats(&self) -> QueueStats {
        self.get_stats()
    }
}

// ---------------------------------------------------------------------------
// Worker internals
// ---------------------------------------------------------------------------

fn new_record<T: Task>(task: T, priority: i32, attempts: u32) -> TaskRecord<T> {
    TaskRecord {
        id: TaskId::new(),
        group: task.group().to_string(),
        priority,
        task: Arc::new(task),
        attempts,
        skipped: false,
        outcome: None,
        error: None,
        enqueued_at: Utc::now(),
        finished_at: None,
    }
}

impl<T: Task> Shared<T> {
    fn lock(&self) -> MutexGuard<'_, QueueState<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Push a record onto its group heap and wake one worker.
    fn push(&self, record: TaskRecord<T>) -> Result<TaskId> {
        let id = record.id;
        let group = record.group.clone();
        {
            let mut state = self.lock();
            Self::push_locked(&mut state, record)?;
        }
        self.signals[&group].notify_one();
        metrics::tasks_enqueued().add(1, &[KeyValue::new("group", group)]);
        Ok(id)
    }

    fn push_locked(state: &mut QueueState<T>, record: TaskRecord<T>) -> Result<()> {
        let sequence = state.next_sequence;
        let group = state
            .groups
            .get_mut(&record.group)
            .ok_or_else(|| Error::UnknownGroup(record.group.clone()))?;
        group.waiting.push(Waiting {
            priority: record.priority,
            sequence,
            record,
        });
        state.next_sequence += 1;
        state.finished = false;
        Ok(())
    }

    fn run_worker(&self, group: &str) {
        debug!(group, "worker started");
        while let Some(record) = self.next_task(group) {
            self.run_task(record);
        }
        debug!(group, "worker stopped");
    }

    /// Wait for the group's lowest `(priority, sequence)` entry and move it
    /// to pending. `None` once shutdown was requested.
    fn next_task(&self, group: &str) -> Option<TaskRecord<T>> {
        let signal = &self.signals[group];
        let mut state = self.lock();
        loop {
            if !self.running.load(Ordering::SeqCst) {
                return None;
            }
            let group_state = state.groups.get_mut(group)?;
            if let Some(Waiting { mut record, .. }) = group_state.waiting.pop() {
                record.attempts += 1;
                group_state.pending.push(record.clone());
                return Some(record);
            }
            state = signal.wait(state).unwrap_or_else(PoisonError::into_inner);
        }
    }

    fn run_task(&self, record: TaskRecord<T>) {
        let description = record.task.description();
        let span = start_task_span(&record.group, record.id, &description);
        let task = Arc::clone(&record.task);
        let started = Instant::now();

        let result = span.in_scope(|| {
            panic::catch_unwind(AssertUnwindSafe(|| task.execute()))
                .unwrap_or_else(|payload| Err(Error::Panicked(panic_message(payload.as_ref()))))
        });

        let duration_ms = started.elapsed().as_secs_f64() * 1000.0;
        metrics::task_duration_ms().record(
            duration_ms,
            &[KeyValue::new("group", record.group.clone())],
        );

        let outcome = match result {
            Ok(execution) => {
                record_outcome(&span, execution.outcome);
                self.finish(&record, Ok(execution.outcome), execution.next);
                execution.outcome
            }
            Err(e) => {
                record_outcome(&span, Outcome::Errored);
                span.in_scope(|| {
                    error!(
                        id = %record.id,
                        group = %record.group,
                        desc = %description,
                        attempt = record.attempts,
                        retryable = task.allow_retry(),
                        error = %e,
                        "task failed"
                    );
                });
                self.finish(&record, Err(e.to_string()), None);
                Outcome::Errored
            }
        };

        metrics::tasks_finished().add(
            1,
            &[
                KeyValue::new("group", record.group.clone()),
                KeyValue::new("outcome", outcome.to_string()),
            ],
        );
    }

    /// Move a task out of pending into completed or errors, and enqueue
    /// its follow-up in the same critical section so the queue never looks
    /// drained in between.
    fn finish(
        &self,
        record: &TaskRecord<T>,
        result: std::result::Result<Outcome, String>,
        next: Option<FollowUp<T>>,
    ) {
        let mut follow_group = None;
        let drained = {
            let mut state = self.lock();

            let Some(group) = state.groups.get_mut(&record.group) else {
                return;
            };
            let Some(index) = group.pending.iter().position(|r| r.id == record.id) else {
                warn!(id = %record.id, "finished task missing from pending list");
                return;
            };
            let mut done = group.pending.swap_remove(index);
            done.finished_at = Some(Utc::now());

            match result {
                Ok(outcome) => {
                    done.outcome = Some(outcome);
                    if outcome.is_skip() {
                        done.skipped = true;
                        group.skipped += 1;
                        group.skipped_bytes += done.task.bytes_total();
                    }
                    group.completed.push(done);
                }
                Err(message) => {
                    done.outcome = Some(Outcome::Errored);
                    done.error = Some(message);
                    group.errors.push(done);
                }
            }

            if let Some(FollowUp { task, priority }) = next {
                let follow = new_record(task, priority, 0);
                let name = follow.group.clone();
                match Self::push_locked(&mut state, follow) {
                    Ok(()) => follow_group = Some(name),
                    Err(e) => error!(parent_id = %record.id, error = %e, "dropping follow-up task"),
                }
            }

            state.is_drained()
        };

        if let Some(name) = follow_group {
            self.signals[&name].notify_one();
            metrics::tasks_enqueued().add(1, &[KeyValue::new("group", name)]);
        }
        if drained {
            self.drained.notify_all();
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
