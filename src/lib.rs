//! # syncq
//!
//! Multi-threaded, priority-ordered work queue with per-group concurrency
//! limits, and a file synchronization queue built on it.
//!
//! Provides the generic queue ([`engine::WorkQueue`]), the two-group sync
//! specialization ([`engine::SyncQueue`]), progress reporting, local and
//! in-memory destinations, and tracing/OpenTelemetry setup.

pub mod config;
pub mod destination;
pub mod engine;
pub mod error;
pub mod model;
pub mod prompt;
pub mod task;
pub mod telemetry;
