//! Integration tests for the sync queue against the in-memory destination.

use std::io::{Read, Write};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use syncq::destination::{CountingReader, MemoryDestination, MemorySource, SourceFile};
use syncq::engine::{DELETE_GROUP, STORE_GROUP, SyncOptions, SyncQueue};
use syncq::error::Result;
use syncq::model::*;
use syncq::prompt::{FixedPrompt, Prompt};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Captures progress output.
#[derive(Clone, Default)]
struct SharedBuf(Arc<Mutex<Vec<u8>>>);

impl SharedBuf {
    fn text(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
    }
}

impl Write for SharedBuf {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// Answers with a fixed value and records every question.
struct RecordingPrompt {
    answer: bool,
    asked: Arc<Mutex<Vec<String>>>,
}

impl Prompt for RecordingPrompt {
    fn confirm(&self, message: &str) -> bool {
        self.asked.lock().unwrap().push(message.to_string());
        self.answer
    }
}

fn options() -> SyncOptions {
    SyncOptions {
        store_workers: 2,
        report_interval: Duration::from_millis(10),
        ..SyncOptions::default()
    }
}

fn queue_with(dst: &MemoryDestination, options: SyncOptions, prompt: Box<dyn Prompt>) -> (SyncQueue, SharedBuf) {
    let out = SharedBuf::default();
    let queue = SyncQueue::with_collaborators(
        Arc::new(dst.clone()),
        options,
        prompt,
        Box::new(out.clone()),
    )
    .unwrap();
    queue.start().unwrap();
    (queue, out)
}

fn at(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
}

fn outcome_of(queue: &SyncQueue, id: TaskId) -> Option<Outcome> {
    queue
        .completed()
        .into_iter()
        .chain(queue.errors())
        .find(|r| r.id == id)
        .and_then(|r| r.outcome)
}

/// Yields at most 100 bytes per read, 50ms apart.
struct Throttled {
    data: Vec<u8>,
    pos: usize,
}

impl Read for Throttled {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        if self.pos >= self.data.len() || buf.is_empty() {
            return Ok(0);
        }
        std::thread::sleep(Duration::from_millis(50));
        let n = buf.len().min(100).min(self.data.len() - self.pos);
        buf[..n].copy_from_slice(&self.data[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}

/// A source that copies at roughly 2 KB/s.
struct SlowSource {
    name: String,
    data: Vec<u8>,
    modified: DateTime<Utc>,
    bytes_read: Arc<AtomicU64>,
}

impl SourceFile for SlowSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn size(&self) -> u64 {
        self.data.len() as u64
    }

    fn modified(&self) -> DateTime<Utc> {
        self.modified
    }

    fn open(&self) -> Result<Box<dyn Read + Send>> {
        let reader = Throttled {
            data: self.data.clone(),
            pos: 0,
        };
        Ok(Box::new(CountingReader::new(reader, Arc::clone(&self.bytes_read))))
    }

    fn bytes_read(&self) -> u64 {
        self.bytes_read.load(Ordering::Relaxed)
    }
}

/// Seconds of the `ETA M:SS` part of a status line.
fn eta_secs(line: &str) -> Option<u64> {
    let eta = line.split("ETA ").nth(1)?.split_whitespace().next()?;
    let (m, s) = eta.split_once(':')?;
    Some(m.parse::<u64>().ok()? * 60 + s.parse::<u64>().ok()?)
}

// ---------------------------------------------------------------------------
// Store decisions
// ---------------------------------------------------------------------------

#[test]
fn new_file_is_created_then_skipped_when_unchanged() {
    let dst = MemoryDestination::new();
    let (queue, _) = queue_with(&dst, options(), Box::new(FixedPrompt(false)));

    let src = Arc::new(MemorySource::new("a.txt", "hello", at(0)));
    let first = queue.store(src.clone()).unwrap();
    queue.wait_for_finish();

    assert_eq!(outcome_of(&queue, first), Some(Outcome::Created));
    assert_eq!(dst.contents("a.txt").as_deref(), Some(&b"hello"[..]));
    assert!(src.is_cleaned_up());

    let second = queue.store(src.clone()).unwrap();
    queue.wait_for_finish();

    assert_eq!(outcome_of(&queue, second), Some(Outcome::SkippedStat));
    assert_eq!(dst.store_count(), 1);

    let stats = queue.get_stats();
    assert_eq!(stats[STORE_GROUP].completed, 2);
    assert_eq!(stats[STORE_GROUP].skipped, 1);
    assert_eq!(stats[STORE_GROUP].completed_bytes, 5);
    queue.shutdown().unwrap();
}

#[test]
fn older_destination_with_same_size_is_not_up_to_date() {
    let dst = MemoryDestination::new();
    dst.insert("a.txt", "HELLO", at(-60));
    let (queue, _) = queue_with(&dst, options(), Box::new(FixedPrompt(true)));

    let id = queue
        .store(Arc::new(MemorySource::new("a.txt", "hello", at(0))))
        .unwrap();
    queue.wait_for_finish();

    assert_eq!(outcome_of(&queue, id), Some(Outcome::Updated));
    assert_eq!(dst.contents("a.txt").as_deref(), Some(&b"hello"[..]));
    queue.shutdown().unwrap();
}

#[test]
fn declined_overwrite_is_skipped_by_user() {
    let dst = MemoryDestination::new();
    dst.insert("a.txt", "old", at(-60));
    let asked = Arc::new(Mutex::new(Vec::new()));
    let prompt = RecordingPrompt {
        answer: false,
        asked: Arc::clone(&asked),
    };
    let (queue, _) = queue_with(&dst, options(), Box::new(prompt));

    let src = Arc::new(MemorySource::new("a.txt", "brand new", at(0)));
    let id = queue.store(src.clone()).unwrap();
    queue.wait_for_finish();

    assert_eq!(outcome_of(&queue, id), Some(Outcome::SkippedUser));
    assert_eq!(dst.contents("a.txt").as_deref(), Some(&b"old"[..]));
    assert_eq!(dst.store_count(), 0);
    assert!(!src.is_cleaned_up());
    assert_eq!(*asked.lock().unwrap(), vec!["File a.txt exists, overwrite?".to_string()]);
    assert_eq!(queue.get_stats()[STORE_GROUP].skipped, 1);
    queue.shutdown().unwrap();
}

#[test]
fn assume_yes_overwrites_without_asking() {
    let dst = MemoryDestination::new();
    dst.insert("a.txt", "old", at(-60));
    let asked = Arc::new(Mutex::new(Vec::new()));
    let prompt = RecordingPrompt {
        answer: false,
        asked: Arc::clone(&asked),
    };
    let opts = SyncOptions {
        assume_yes: true,
        ..options()
    };
    let (queue, _) = queue_with(&dst, opts, Box::new(prompt));

    let id = queue
        .store(Arc::new(MemorySource::new("a.txt", "brand new", at(0))))
        .unwrap();
    queue.wait_for_finish();

    assert_eq!(outcome_of(&queue, id), Some(Outcome::Updated));
    assert_eq!(dst.contents("a.txt").as_deref(), Some(&b"brand new"[..]));
    assert!(asked.lock().unwrap().is_empty());
    assert!(queue.confirm("anything?"));
    assert!(asked.lock().unwrap().is_empty());
    queue.shutdown().unwrap();
}

#[test]
fn concurrent_confirmations_are_serialized() {
    struct SlowPrompt {
        inside: AtomicUsize,
        overlap: AtomicUsize,
    }

    impl Prompt for SlowPrompt {
        fn confirm(&self, _message: &str) -> bool {
            if self.inside.fetch_add(1, Ordering::SeqCst) > 0 {
                self.overlap.fetch_add(1, Ordering::SeqCst);
            }
            std::thread::sleep(Duration::from_millis(20));
            self.inside.fetch_sub(1, Ordering::SeqCst);
            true
        }
    }

    let prompt = Arc::new(SlowPrompt {
        inside: AtomicUsize::new(0),
        overlap: AtomicUsize::new(0),
    });

    struct Shared(Arc<SlowPrompt>);
    impl Prompt for Shared {
        fn confirm(&self, message: &str) -> bool {
            self.0.confirm(message)
        }
    }

    let dst = MemoryDestination::new();
    for i in 0..6 {
        dst.insert(format!("f{i}"), "old", at(-60));
    }
    let opts = SyncOptions {
        store_workers: 4,
        ..options()
    };
    let (queue, _) = queue_with(&dst, opts, Box::new(Shared(Arc::clone(&prompt))));

    for i in 0..6 {
        queue
            .store(Arc::new(MemorySource::new(format!("f{i}"), "new content", at(0))))
            .unwrap();
    }
    queue.wait_for_finish();

    assert_eq!(prompt.overlap.load(Ordering::SeqCst), 0);
    assert_eq!(dst.store_count(), 6);
    queue.shutdown().unwrap();
}

// ---------------------------------------------------------------------------
// Dry run
// ---------------------------------------------------------------------------

#[test]
fn dry_run_decides_but_does_not_copy() {
    let dst = MemoryDestination::new();
    let opts = SyncOptions {
        dry_run: true,
        ..options()
    };
    let (queue, out) = queue_with(&dst, opts, Box::new(FixedPrompt(true)));

    let src = Arc::new(MemorySource::new("a.txt", "hello", at(0)));
    let id = queue.store(src.clone()).unwrap();
    queue.wait_for_finish();

    assert_eq!(outcome_of(&queue, id), Some(Outcome::Created));
    assert!(!dst.contains("a.txt"));
    assert_eq!(dst.store_count(), 0);
    assert_eq!(queue.get_stats()[STORE_GROUP].completed_bytes, 0);
    assert!(src.is_cleaned_up());

    let report = queue.report();
    assert!(report.dry_run);
    assert_eq!(report.bytes_transferred, 0);

    queue.shutdown().unwrap();
    assert!(out.text().contains("[dry run] "));
}

#[test]
fn dry_run_delete_keeps_file_and_skips_cleanup() {
    let dst = MemoryDestination::new();
    dst.insert("stale.txt", "x", at(0));
    let opts = SyncOptions {
        dry_run: true,
        ..options()
    };
    let (queue, _) = queue_with(&dst, opts, Box::new(FixedPrompt(true)));

    let id = queue.delete_name("stale.txt").unwrap();
    queue.wait_for_finish();
    queue.shutdown().unwrap();

    assert_eq!(outcome_of(&queue, id), Some(Outcome::Deleted));
    assert!(dst.contains("stale.txt"));
    assert_eq!(dst.delete_count(), 0);
    assert_eq!(dst.cleanup_count(), 0);
}

// ---------------------------------------------------------------------------
// Delete and shutdown
// ---------------------------------------------------------------------------

#[test]
fn delete_removes_file_and_cleans_up_once() {
    let dst = MemoryDestination::new();
    dst.insert("stale.txt", "x", at(0));
    dst.insert("keep.txt", "y", at(0));
    let (queue, out) = queue_with(&dst, options(), Box::new(FixedPrompt(true)));

    let id = queue.delete_name("stale.txt").unwrap();
    queue.wait_for_finish();

    assert_eq!(outcome_of(&queue, id), Some(Outcome::Deleted));
    assert!(!dst.contains("stale.txt"));
    assert!(dst.contains("keep.txt"));
    assert_eq!(queue.get_stats()[DELETE_GROUP].completed, 1);

    queue.shutdown().unwrap();
    queue.shutdown().unwrap();
    assert_eq!(dst.cleanup_count(), 1);

    let text = out.text();
    assert!(text.contains("Transferred"));
    assert!(text.contains("1 deleted"));
    assert!(text.ends_with('\n'));
}

#[test]
fn shutdown_without_deletes_skips_cleanup() {
    let dst = MemoryDestination::new();
    let (queue, _) = queue_with(&dst, options(), Box::new(FixedPrompt(true)));
    queue
        .store(Arc::new(MemorySource::new("a.txt", "hello", at(0))))
        .unwrap();
    queue.wait_for_finish();
    queue.shutdown().unwrap();

    assert_eq!(dst.cleanup_count(), 0);
}

#[test]
fn store_after_shutdown_is_rejected() {
    let dst = MemoryDestination::new();
    let (queue, _) = queue_with(&dst, options(), Box::new(FixedPrompt(true)));
    queue.shutdown().unwrap();

    let result = queue.store(Arc::new(MemorySource::new("a.txt", "hello", at(0))));
    assert!(result.is_err());
}

// ---------------------------------------------------------------------------
// Errors and retries
// ---------------------------------------------------------------------------

#[test]
fn failed_store_is_retryable_and_succeeds_after_heal() {
    let dst = MemoryDestination::new();
    dst.fail_on("bad.txt");
    let (queue, _) = queue_with(&dst, options(), Box::new(FixedPrompt(true)));

    queue
        .store(Arc::new(MemorySource::new("bad.txt", "payload", at(0))))
        .unwrap();
    queue
        .store(Arc::new(MemorySource::new("good.txt", "payload", at(0))))
        .unwrap();
    queue.wait_for_finish();

    assert!(queue.has_errors());
    assert!(queue.has_retryable_errors());
    let errors = queue.errors();
    assert_eq!(errors.len(), 1);
    assert!(errors[0].error.as_deref().unwrap().contains("bad.txt"));
    assert!(dst.contains("good.txt"));

    dst.heal("bad.txt");
    assert_eq!(queue.requeue_errors().unwrap(), 1);
    queue.wait_for_finish();

    assert!(!queue.has_errors());
    assert_eq!(dst.contents("bad.txt").as_deref(), Some(&b"payload"[..]));
    assert_eq!(queue.get_stats()[STORE_GROUP].completed, 2);
    assert_eq!(queue.report().bytes_transferred, 14);
    queue.shutdown().unwrap();
}

#[test]
fn many_files_all_land() {
    let dst = MemoryDestination::new();
    let (queue, _) = queue_with(&dst, options(), Box::new(FixedPrompt(true)));

    for i in 0..50 {
        queue
            .store(Arc::new(MemorySource::new(format!("dir/{i}.bin"), vec![7u8; i], at(0))))
            .unwrap();
    }
    queue.wait_for_finish();
    assert!(!queue.tasks_pending());

    let expected: u64 = (0..50).sum();
    let report = queue.report();
    assert_eq!(report.bytes_transferred, expected);
    assert_eq!(report.groups[STORE_GROUP].completed, 50);
    assert_eq!(dst.store_count(), 50);

    let progress = queue.reporter().snapshot();
    assert_eq!(progress[STORE_GROUP].total_count, 50);
    assert_eq!(progress[STORE_GROUP].total_bytes, expected);
    queue.shutdown().unwrap();
}

// ---------------------------------------------------------------------------
// Progress
// ---------------------------------------------------------------------------

#[test]
fn skipped_files_do_not_count_as_work_in_progress() {
    let dst = MemoryDestination::new();
    let opts = SyncOptions {
        store_workers: 2,
        report_interval: Duration::from_secs(3600),
        ..SyncOptions::default()
    };
    for i in 0..9 {
        dst.insert(format!("same{i}.bin"), vec![1u8; 1000], at(0));
    }
    let (queue, _) = queue_with(&dst, opts, Box::new(FixedPrompt(true)));

    for i in 0..9 {
        queue
            .store(Arc::new(MemorySource::new(format!("same{i}.bin"), vec![1u8; 1000], at(0))))
            .unwrap();
    }
    let slow = Arc::new(SlowSource {
        name: "slow.bin".to_string(),
        data: vec![2u8; 1000],
        modified: at(0),
        bytes_read: Arc::new(AtomicU64::new(0)),
    });
    queue.store(slow.clone()).unwrap();

    for _ in 0..400 {
        if queue.get_stats()[STORE_GROUP].skipped == 9 && slow.bytes_read() >= 100 {
            break;
        }
        std::thread::sleep(Duration::from_millis(5));
    }

    queue.reporter().sample();
    let line = queue.reporter().status_line();
    assert!(line.starts_with("store: 0/1 (9 skipped) - "), "{line}");
    // About half a second of copying remains; the skipped 9000 bytes are
    // not projected as outstanding work.
    let eta = eta_secs(&line).expect("status line has an ETA");
    assert!(eta <= 2, "{line}");

    let progress = queue.reporter().snapshot();
    assert_eq!(progress[STORE_GROUP].skipped_bytes, 9000);
    assert_eq!(progress[STORE_GROUP].total_bytes, 10_000);

    queue.wait_for_finish();
    let stats = queue.get_stats();
    assert_eq!(stats[STORE_GROUP].completed, 10);
    assert_eq!(stats[STORE_GROUP].skipped, 9);
    assert_eq!(stats[STORE_GROUP].skipped_bytes, 9000);
    assert_eq!(stats[STORE_GROUP].completed_bytes, 1000);
    assert_eq!(dst.contents("slow.bin").map(|d| d.len()), Some(1000));
    queue.shutdown().unwrap();
}
