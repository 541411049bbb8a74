//! In-memory source and destination, for tests and previews.

use std::collections::BTreeMap;
use std::io::{Cursor, Read};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};

use super::{CountingReader, Destination, DestinationFile, FileStat, SourceFile};
use crate::error::{Error, Result};

#[derive(Debug, Clone)]
struct Entry {
    data: Vec<u8>,
    modified: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct Inner {
    files: Mutex<BTreeMap<String, Entry>>,
    failing: Mutex<Vec<String>>,
    stores: AtomicUsize,
    deletes: AtomicUsize,
    cleanups: AtomicUsize,
}

impl Inner {
    fn files(&self) -> MutexGuard<'_, BTreeMap<String, Entry>> {
        self.files.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// A thread-safe map of name to content. Cloning shares the same files.
#[derive(Debug, Clone, Default)]
pub struct MemoryDestination {
    inner: Arc<Inner>,
}

impl MemoryDestination {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a file as if it had been stored earlier.
    pub fn insert(&self, name: impl Into<String>, data: impl Into<Vec<u8>>, modified: DateTime<Utc>) {
        self.inner.files().insert(
            name.into(),
            Entry {
                data: data.into(),
                modified,
            },
        );
    }

    pub fn contents(&self, name: &str) -> Option<Vec<u8>> {
        self.inner.files().get(name).map(|e| e.data.clone())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.inner.files().contains_key(name)
    }

    /// Make every store to `name` fail.
    pub fn fail_on(&self, name: impl Into<String>) {
        self.inner
            .failing
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(name.into());
    }

    /// Let stores to `name` succeed again.
    pub fn heal(&self, name: &str) {
        self.inner
            .failing
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|n| n != name);
    }

    pub fn store_count(&self) -> usize {
        self.inner.stores.load(Ordering::SeqCst)
    }

    pub fn delete_count(&self) -> usize {
        self.inner.deletes.load(Ordering::SeqCst)
    }

    pub fn cleanup_count(&self) -> usize {
        self.inner.cleanups.load(Ordering::SeqCst)
    }
}

impl Destination for MemoryDestination {
    fn file(&self, name: &str) -> Result<Arc<dyn DestinationFile>> {
        Ok(Arc::new(MemoryFile {
            name: name.to_string(),
            inner: Arc::clone(&self.inner),
        }))
    }

    fn cleanup(&self) -> Result<()> {
        self.inner.cleanups.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct MemoryFile {
    name: String,
    inner: Arc<Inner>,
}

impl DestinationFile for MemoryFile {
    fn name(&self) -> &str {
        &self.name
    }

    fn stat(&self) -> Result<Option<FileStat>> {
        Ok(self.inner.files().get(&self.name).map(|e| FileStat {
            size: e.data.len() as u64,
            modified: e.modified,
        }))
    }

    fn store(&self, source: &dyn SourceFile) -> Result<u64> {
        let failing = self
            .inner
            .failing
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&self.name);
        if failing {
            return Err(Error::Destination(format!("store refused: {}", self.name)));
        }

        let mut data = Vec::new();
        source.open()?.read_to_end(&mut data)?;
        let written = data.len() as u64;
        self.inner.files().insert(
            self.name.clone(),
            Entry {
                data,
                modified: source.modified(),
            },
        );
        self.inner.stores.fetch_add(1, Ordering::SeqCst);
        Ok(written)
    }

    fn delete(&self) -> Result<()> {
        self.inner.files().remove(&self.name);
        self.inner.deletes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Source content held in memory.
#[derive(Debug)]
pub struct MemorySource {
    name: String,
    data: Vec<u8>,
    modified: DateTime<Utc>,
    bytes_read: Arc<AtomicU64>,
    cleaned: AtomicBool,
}

impl MemorySource {
    pub fn new(name: impl Into<String>, data: impl Into<Vec<u8>>, modified: DateTime<Utc>) -> Self {
        Self {
            name: name.into(),
            data: data.into(),
            modified,
            bytes_read: Arc::new(AtomicU64::new(0)),
            cleaned: AtomicBool::new(false),
        }
    }

    /// True once `cleanup()` has been called.
    pub fn is_cleaned_up(&self) -> bool {
        self.cleaned.load(Ordering::SeqCst)
    }
}

impl SourceFile for MemorySource {
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
        Ok(Box::new(CountingReader::new(
            Cursor::new(self.data.clone()),
            Arc::clone(&self.bytes_read),
        )))
    }

    fn bytes_read(&self) -> u64 {
        self.bytes_read.load(Ordering::Relaxed)
    }

    fn cleanup(&self) -> Result<()> {
        self.cleaned.store(true, Ordering::SeqCst);
        Ok(())
    }
}
