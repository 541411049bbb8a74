//! Periodic progress sampling and rendering.
//!
//! The reporter reads queue statistics on a background thread and keeps one
//! status line up to date on its output. It never touches tasks.

use std::collections::BTreeMap;
use std::io::Write;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use bytesize::ByteSize;
use serde::Serialize;
use tracing::{debug, warn};

use crate::error::Result;
use crate::model::QueueStats;

/// Anything that can produce per-group queue statistics.
pub trait StatsSource: Send + Sync {
    fn stats(&self) -> QueueStats;
}

/// Accumulated progress for one group.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct GroupProgress {
    pub total_count: u64,
    pub completed: u64,
    pub completed_bytes: u64,
    pub total_bytes: u64,
    pub skipped: u64,
    /// Size of the skipped work, left out of the remaining total.
    pub skipped_bytes: u64,
    pub errors: u64,
    /// Average throughput since the reporter started.
    pub bytes_per_sec: f64,
}

impl GroupProgress {
    /// Tasks that finished with real work, skips excluded.
    pub fn done_count(&self) -> u64 {
        self.completed.saturating_sub(self.skipped)
    }

    /// Expected tasks minus the ones that turned out to need no work.
    pub fn work_count(&self) -> u64 {
        self.total_count.saturating_sub(self.skipped)
    }
}

/// Samples a [`StatsSource`] and renders a single overwritable status line.
pub struct ProgressReporter {
    inner: Arc<Inner>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

struct Inner {
    source: Arc<dyn StatsSource>,
    interval: Duration,
    state: Mutex<ReportState>,
    wake: Condvar,
    output: Mutex<Box<dyn Write + Send>>,
}

struct ReportState {
    groups: BTreeMap<String, GroupProgress>,
    started_at: Instant,
    /// Group whose bytes and counts drive the ETA and the final summary.
    bytes_group: Option<String>,
    /// Extra summary entries: group name -> label ("deleted").
    count_labels: Vec<(String, String)>,
    prefix: String,
    suspended: bool,
    stopped: bool,
    line_width: usize,
}

impl ProgressReporter {
    pub fn new(
        source: Arc<dyn StatsSource>,
        interval: Duration,
        output: Box<dyn Write + Send>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                source,
                interval,
                state: Mutex::new(ReportState {
                    groups: BTreeMap::new(),
                    started_at: Instant::now(),
                    bytes_group: None,
                    count_labels: Vec::new(),
                    prefix: String::new(),
                    suspended: false,
                    stopped: false,
                    line_width: 0,
                }),
                wake: Condvar::new(),
                output: Mutex::new(output),
            }),
            thread: Mutex::new(None),
        }
    }

    /// Use `group` for byte throughput, ETA and the transferred total.
    pub fn bytes_group(self, group: impl Into<String>) -> Self {
        self.inner.lock_state().bytes_group = Some(group.into());
        self
    }

    /// Report `group`'s completed count under `label` in the final summary.
    pub fn count_label(self, group: impl Into<String>, label: impl Into<String>) -> Self {
        self.inner
            .lock_state()
            .count_labels
            .push((group.into(), label.into()));
        self
    }

    /// Text written before every line (e.g. "[dry run] ").
    pub fn prefix(self, prefix: impl Into<String>) -> Self {
        self.inner.lock_state().prefix = prefix.into();
        self
    }

    /// Grow a group's expected totals. Called as work is discovered.
    pub fn add_total(&self, group: &str, count: u64, bytes: u64) {
        let mut state = self.inner.lock_state();
        let progress = state.groups.entry(group.to_string()).or_default();
        progress.total_count += count;
        progress.total_bytes += bytes;
    }

    /// Begin background sampling at the configured interval.
    pub fn start(&self) -> Result<()> {
        let mut slot = self.thread.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.is_some() {
            return Ok(());
        }
        {
            let mut state = self.inner.lock_state();
            state.started_at = Instant::now();
            state.stopped = false;
        }

        let inner = Arc::clone(&self.inner);
        let handle = thread::Builder::new()
            .name("syncq-progress".to_string())
            .spawn(move || inner.run())?;
        *slot = Some(handle);
        debug!(interval_ms = self.inner.interval.as_millis() as u64, "progress reporter started");
        Ok(())
    }

    /// Refresh group records from the stats source.
    pub fn sample(&self) {
        self.inner.sample();
    }

    /// Overwrite the status line, unless suspended.
    pub fn report(&self) {
        self.inner.report();
    }

    /// Pause rendering and clear the current line. Statistics are kept.
    pub fn suspend(&self) {
        let mut state = self.inner.lock_state();
        state.suspended = true;
        let width = std::mem::take(&mut state.line_width);
        self.inner.write(&format!("\r{}\r", " ".repeat(width)));
    }

    /// Resume rendering and redraw immediately.
    pub fn resume(&self) {
        self.inner.lock_state().suspended = false;
        self.inner.report();
    }

    /// Stop background sampling and join the thread. Safe to call twice.
    pub fn shutdown(&self) {
        {
            let mut state = self.inner.lock_state();
            state.stopped = true;
        }
        self.inner.wake.notify_all();

        let handle = self
            .thread
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                warn!("progress thread panicked");
            }
        }
    }

    /// Print one newline-terminated summary line.
    pub fn final_report(&self) {
        self.inner.sample();
        let mut state = self.inner.lock_state();
        let summary = state.summary();
        let width = std::mem::take(&mut state.line_width);
        let pad = width.saturating_sub(summary.chars().count());
        self.inner.write(&format!("\r{summary}{}\n", " ".repeat(pad)));
    }

    /// Copy of the current group records.
    pub fn snapshot(&self) -> BTreeMap<String, GroupProgress> {
        self.inner.lock_state().groups.clone()
    }

    /// The line `report()` would render right now.
    pub fn status_line(&self) -> String {
        self.inner.lock_state().status_line()
    }

    /// Wall time since the reporter started.
    pub fn elapsed(&self) -> Duration {
        self.inner.lock_state().started_at.elapsed()
    }
}

impl Drop for ProgressReporter {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl Inner {
    fn lock_state(&self) -> MutexGuard<'_, ReportState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn run(&self) {
        loop {
            {
                let state = self.lock_state();
                let (state, _) = self
                    .wake
                    .wait_timeout_while(state, self.interval, |s| !s.stopped)
                    .unwrap_or_else(PoisonError::into_inner);
                if state.stopped {
                    break;
                }
            }
            self.sample();
            self.report();
        }
        debug!("progress reporter stopped");
    }

    fn sample(&self) {
        let stats = self.source.stats();
        let mut state = self.lock_state();
        let elapsed = state.started_at.elapsed().as_secs_f64();
        for (name, group) in stats {
            let progress = state.groups.entry(name).or_default();
            progress.completed = group.completed as u64;
            progress.completed_bytes = group.completed_bytes;
            progress.skipped = group.skipped as u64;
            progress.skipped_bytes = group.skipped_bytes;
            progress.errors = group.errors as u64;
            progress.bytes_per_sec = if elapsed > 0.0 {
                group.completed_bytes as f64 / elapsed
            } else {
                0.0
            };
        }
    }

    fn report(&self) {
        let mut state = self.lock_state();
        if state.suspended {
            return;
        }
        let line = state.status_line();
        let width = line.chars().count();
        let pad = state.line_width.saturating_sub(width);
        state.line_width = width;
        self.write(&format!("\r{line}{}", " ".repeat(pad)));
    }

    /// Callers hold the state lock, so writes never interleave.
    fn write(&self, text: &str) {
        let mut out = self.output.lock().unwrap_or_else(PoisonError::into_inner);
        if let Err(e) = out.write_all(text.as_bytes()).and_then(|()| out.flush()) {
            debug!(error = %e, "progress output failed");
        }
    }
}

impl ReportState {
    fn status_line(&self) -> String {
        let mut parts = Vec::new();
        for (name, progress) in &self.groups {
            if progress.total_count == 0 && progress.completed == 0 {
                continue;
            }
            let rate = if progress.total_bytes > 0 {
                format!("{}/s", ByteSize(progress.bytes_per_sec as u64))
            } else {
                format!("{:.1}/s", progress.bytes_per_sec)
            };
            let mut part = format!(
                "{name}: {}/{}",
                progress.done_count(),
                progress.work_count()
            );
            if progress.skipped > 0 {
                part.push_str(&format!(" ({} skipped)", progress.skipped));
            }
            part.push_str(&format!(" - {rate}"));
            if self.bytes_group.as_deref() == Some(name.as_str()) {
                if let Some(eta) = self.eta(progress) {
                    part.push_str(&format!(" ETA {}", format_duration(eta)));
                }
            }
            parts.push(part);
        }
        format!("{}{}", self.prefix, parts.join(" | "))
    }

    /// Linear projection from elapsed time; the slower of the byte-based
    /// and file-based estimates wins.
    fn eta(&self, progress: &GroupProgress) -> Option<Duration> {
        let elapsed = self.started_at.elapsed().as_secs_f64();
        let by_bytes = project(
            elapsed,
            progress.completed_bytes,
            progress.total_bytes.saturating_sub(progress.skipped_bytes),
        );
        let by_files = project(elapsed, progress.done_count(), progress.work_count());
        let secs = match (by_bytes, by_files) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        };
        secs.map(Duration::from_secs_f64)
    }

    fn summary(&self) -> String {
        let transferred = self
            .bytes_group
            .as_ref()
            .and_then(|g| self.groups.get(g))
            .map(|p| p.completed_bytes)
            .unwrap_or(0);
        let skipped: u64 = self.groups.values().map(|p| p.skipped).sum();
        let errors: u64 = self.groups.values().map(|p| p.errors).sum();

        let mut counts = vec![format!("{skipped} skipped")];
        for (group, label) in &self.count_labels {
            let done = self
                .groups
                .get(group)
                .map(GroupProgress::done_count)
                .unwrap_or(0);
            counts.push(format!("{done} {label}"));
        }
        counts.push(format!("{errors} errors"));

        format!(
            "{}Transferred {} in {} ({})",
            self.prefix,
            ByteSize(transferred),
            format_duration(self.started_at.elapsed()),
            counts.join(", ")
        )
    }
}

fn project(elapsed: f64, done: u64, total: u64) -> Option<f64> {
    if done == 0 || total <= done {
        return None;
    }
    Some(elapsed * (total - done) as f64 / done as f64)
}

/// `M:SS`, or `H:MM:SS` past an hour.
fn format_duration(d: Duration) -> String {
    let secs = d.as_secs();
    let (h, m, s) = (secs / 3600, (secs % 3600) / 60, secs % 60);
    if h > 0 {
        format!("{h}:{m:02}:{s:02}")
    } else {
        format!("{m}:{s:02}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_duration_switches_to_hours() {
        assert_eq!(format_duration(Duration::from_secs(7)), "0:07");
        assert_eq!(format_duration(Duration::from_secs(125)), "2:05");
        assert_eq!(format_duration(Duration::from_secs(3725)), "1:02:05");
    }

    #[test]
    fn project_needs_progress_and_remaining_work() {
        assert_eq!(project(10.0, 0, 100), None);
        assert_eq!(project(10.0, 100, 100), None);
        assert_eq!(project(10.0, 25, 100), Some(30.0));
    }
}
