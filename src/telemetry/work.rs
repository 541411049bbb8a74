//! Task execution span helpers.
//!
//! Provides span creation and outcome recording for tasks flowing
//! through the worker threads.

use tracing::Span;

use crate::model::{Outcome, TaskId};

/// Start a span for one task execution.
///
/// The `task.outcome` field is declared empty and is filled by
/// [`record_outcome`].
pub fn start_task_span(group: &str, id: TaskId, description: &str) -> Span {
    tracing::info_span!(
        "task.execute",
        "task.group" = group,
        "task.id" = %id,
        "task.desc" = description,
        "task.outcome" = tracing::field::Empty,
    )
}

/// Record how a task ended on its span.
pub fn record_outcome(span: &Span, outcome: Outcome) {
    span.record("task.outcome", tracing::field::display(outcome));
    span.in_scope(|| {
        tracing::debug!(outcome = %outcome, "task_finished");
    });
}
