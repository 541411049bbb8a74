//! Metric instrument factories for syncq.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`.
//! Without a provider every instrument is a no-op.

use opentelemetry::metrics::{Counter, Histogram, Meter};

/// Returns the shared meter for syncq instruments.
fn meter() -> Meter {
    opentelemetry::global::meter("syncq")
}

/// Counter: tasks enqueued (follow-ups and requeues included).
/// Labels: `group`.
pub fn tasks_enqueued() -> Counter<u64> {
    meter()
        .u64_counter("syncq.tasks.enqueued")
        .with_description("Number of tasks enqueued")
        .build()
}

/// Counter: tasks that left the pending list.
/// Labels: `group`, `outcome`.
pub fn tasks_finished() -> Counter<u64> {
    meter()
        .u64_counter("syncq.tasks.finished")
        .with_description("Number of tasks finished, by outcome")
        .build()
}

/// Counter: bytes written to the destination.
pub fn bytes_transferred() -> Counter<u64> {
    meter()
        .u64_counter("syncq.bytes.transferred")
        .with_description("Bytes copied to the destination")
        .with_unit("By")
        .build()
}

/// Histogram: task execution duration in milliseconds.
/// Labels: `group`.
pub fn task_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("syncq.task.duration_ms")
        .with_description("Task execution duration in milliseconds")
        .with_unit("ms")
        .build()
}
