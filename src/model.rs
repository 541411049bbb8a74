//! Core data model.
//!
//! A task record is the queue's bookkeeping for one unit of work: identity,
//! group, priority, attempts, and how it ended.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Priority used when the caller does not pick one. Lower runs first.
pub const DEFAULT_PRIORITY: i32 = 10;

// ---------------------------------------------------------------------------
// Task Id
// ---------------------------------------------------------------------------

/// Newtype for task IDs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskId(pub Uuid);

impl TaskId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Short display: first 8 chars of UUID
        write!(f, "{}", &self.0.to_string()[..8])
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Outcome
// ---------------------------------------------------------------------------

/// How a task ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    /// Destination did not exist and was written.
    Created,
    /// Destination existed and was overwritten.
    Updated,
    /// Destination was removed.
    Deleted,
    /// Generic success for tasks that are not file transfers.
    Done,
    /// Destination already current (size and mtime), nothing copied.
    SkippedStat,
    /// User declined the overwrite.
    SkippedUser,
    /// `execute()` failed or panicked.
    Errored,
}

impl Outcome {
    /// Skips are deliberate no-ops, counted apart from real work.
    pub fn is_skip(self) -> bool {
        matches!(self, Outcome::SkippedStat | Outcome::SkippedUser)
    }
}

impl std::fmt::Display for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Outcome::Created => "create",
            Outcome::Updated => "update",
            Outcome::Deleted => "delete",
            Outcome::Done => "done",
            Outcome::SkippedStat => "skip/stat",
            Outcome::SkippedUser => "skip/user",
            Outcome::Errored => "error",
        };
        write!(f, "{s}")
    }
}

// ---------------------------------------------------------------------------
// Execution
// ---------------------------------------------------------------------------

/// A task to enqueue once the current one succeeds.
#[derive(Debug)]
pub struct FollowUp<T> {
    pub task: T,
    pub priority: i32,
}

/// Successful result of `Task::execute`.
#[derive(Debug)]
pub struct Execution<T> {
    pub outcome: Outcome,
    pub next: Option<FollowUp<T>>,
}

impl<T> Execution<T> {
    pub fn new(outcome: Outcome) -> Self {
        Self {
            outcome,
            next: None,
        }
    }

    pub fn done() -> Self {
        Self::new(Outcome::Done)
    }

    pub fn then(mut self, task: T, priority: i32) -> Self {
        self.next = Some(FollowUp { task, priority });
        self
    }
}

// ---------------------------------------------------------------------------
// Task Record
// ---------------------------------------------------------------------------

/// The queue's view of a task.
#[derive(Debug)]
pub struct TaskRecord<T> {
    pub id: TaskId,
    pub group: String,
    pub priority: i32,
    pub task: Arc<T>,
    /// Number of times `execute()` has been called.
    pub attempts: u32,
    /// Set when the task decided no work was needed.
    pub skipped: bool,
    pub outcome: Option<Outcome>,
    /// Error message (full chain) if the task failed.
    pub error: Option<String>,
    pub enqueued_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl<T> Clone for TaskRecord<T> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            group: self.group.clone(),
            priority: self.priority,
            task: Arc::clone(&self.task),
            attempts: self.attempts,
            skipped: self.skipped,
            outcome: self.outcome,
            error: self.error.clone(),
            enqueued_at: self.enqueued_at,
            finished_at: self.finished_at,
        }
    }
}

// ---------------------------------------------------------------------------
// Stats
// ---------------------------------------------------------------------------

/// Per-group counters sampled from the queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupStats {
    /// Tasks waiting in the heap.
    pub waiting: usize,
    /// Tasks currently executing.
    pub pending: usize,
    pub completed: usize,
    /// Bytes processed by completed and in-flight tasks.
    pub completed_bytes: u64,
    pub skipped: usize,
    /// Full size of the skipped tasks; never part of `completed_bytes`.
    pub skipped_bytes: u64,
    pub errors: usize,
}

/// Stats for every group, keyed by group name.
pub type QueueStats = BTreeMap<String, GroupStats>;
