//! Source and destination collaborators for the sync queue.
//!
//! A destination hands out per-name file handles; a source file is read
//! through a counting reader so in-flight progress can be sampled while a
//! copy is running.

pub mod local;
pub mod memory;

use std::io::Read;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;

pub use local::{LocalDestination, LocalSource};
pub use memory::{MemoryDestination, MemorySource};

/// Size and modification time of an existing destination file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileStat {
    pub size: u64,
    pub modified: DateTime<Utc>,
}

/// A file to be copied to the destination.
pub trait SourceFile: Send + Sync {
    /// Destination-relative name, `/`-separated.
    fn name(&self) -> &str;
    fn size(&self) -> u64;
    fn modified(&self) -> DateTime<Utc>;

    /// Open the content for streaming. Each call restarts `bytes_read`.
    fn open(&self) -> Result<Box<dyn Read + Send>>;

    /// Bytes read through the most recent `open()`.
    fn bytes_read(&self) -> u64;

    /// Release any temporary resource backing this source.
    fn cleanup(&self) -> Result<()> {
        Ok(())
    }
}

/// Handle on one destination path. It may or may not exist yet.
pub trait DestinationFile: Send + Sync {
    fn name(&self) -> &str;

    /// `None` when nothing exists at this path.
    fn stat(&self) -> Result<Option<FileStat>>;

    /// Write the source's content here and stamp its modification time.
    /// Returns the number of bytes written.
    fn store(&self, source: &dyn SourceFile) -> Result<u64>;

    fn delete(&self) -> Result<()>;
}

/// Where files are synchronized to.
pub trait Destination: Send + Sync {
    /// Look up (or lazily create a handle for) the file at `name`.
    fn file(&self, name: &str) -> Result<Arc<dyn DestinationFile>>;

    /// Called once at shutdown if any deletion was queued.
    fn cleanup(&self) -> Result<()> {
        Ok(())
    }
}

/// Reader adapter that adds every byte it yields to a shared counter.
pub struct CountingReader<R> {
    inner: R,
    counter: Arc<AtomicU64>,
}

impl<R: Read> CountingReader<R> {
    /// Wrap `inner`, resetting `counter` to zero.
    pub fn new(inner: R, counter: Arc<AtomicU64>) -> Self {
        counter.store(0, Ordering::Relaxed);
        Self { inner, counter }
    }
}

impl<R: Read> Read for CountingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.counter.fetch_add(n as u64, Ordering::Relaxed);
        Ok(n)
    }
}
