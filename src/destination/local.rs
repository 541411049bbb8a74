//! Local filesystem source and destination.

use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;

use chrono::{DateTime, Utc};
use tracing::debug;
use walkdir::WalkDir;

use super::{CountingReader, Destination, DestinationFile, FileStat, SourceFile};
use crate::error::{Error, Result};

/// Suffix of the temporary file a store writes before renaming into place.
const PART_SUFFIX: &str = ".syncq-part";

// ---------------------------------------------------------------------------
// Destination
// ---------------------------------------------------------------------------

/// A directory tree on the local filesystem.
#[derive(Debug, Clone)]
pub struct LocalDestination {
    root: PathBuf,
}

impl LocalDestination {
    /// Use `root` as the destination, creating it if needed.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Every regular file under the root, as sorted `/`-separated names.
    pub fn list_files(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in WalkDir::new(&self.root) {
            let entry = entry.map_err(|e| Error::Destination(format!("walk failed: {e}")))?;
            if !entry.file_type().is_file() {
                continue;
            }
            if entry.file_name().to_string_lossy().ends_with(PART_SUFFIX) {
                continue;
            }
            names.push(relative_name(&self.root, entry.path())?);
        }
        names.sort();
        Ok(names)
    }
}

impl Destination for LocalDestination {
    fn file(&self, name: &str) -> Result<Arc<dyn DestinationFile>> {
        let path = resolve(&self.root, name)?;
        Ok(Arc::new(LocalFile {
            name: name.to_string(),
            path,
        }))
    }

    /// Remove directories left empty by deletions. The root stays.
    fn cleanup(&self) -> Result<()> {
        let mut removed = 0;
        for entry in WalkDir::new(&self.root)
            .min_depth(1)
            .contents_first(true)
            .into_iter()
            .filter_map(|e| e.ok())
        {
            if entry.file_type().is_dir() && fs::remove_dir(entry.path()).is_ok() {
                removed += 1;
            }
        }
        debug!(root = %self.root.display(), removed, "removed empty directories");
        Ok(())
    }
}

/// One path under a [`LocalDestination`].
#[derive(Debug)]
pub struct LocalFile {
    name: String,
    path: PathBuf,
}

impl DestinationFile for LocalFile {
    fn name(&self) -> &str {
        &self.name
    }

    fn stat(&self) -> Result<Option<FileStat>> {
        match fs::metadata(&self.path) {
            Ok(meta) if meta.is_file() => Ok(Some(FileStat {
                size: meta.len(),
                modified: DateTime::<Utc>::from(meta.modified()?),
            })),
            Ok(_) => Err(Error::Destination(format!(
                "{} exists and is not a regular file",
                self.path.display()
            ))),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn store(&self, source: &dyn SourceFile) -> Result<u64> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }

        let mut part = self.path.clone().into_os_string();
        part.push(PART_SUFFIX);
        let part = PathBuf::from(part);

        let written = {
            let mut reader = source.open()?;
            let mut file = File::create(&part)?;
            let written = io::copy(&mut reader, &mut file)?;
            file.set_modified(SystemTime::from(source.modified()))?;
            file.sync_all()?;
            written
        };

        if let Err(e) = fs::rename(&part, &self.path) {
            let _ = fs::remove_file(&part);
            return Err(e.into());
        }
        Ok(written)
    }

    fn delete(&self) -> Result<()> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "already gone");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}

// ---------------------------------------------------------------------------
// Source
// ---------------------------------------------------------------------------

/// A regular file on the local filesystem.
#[derive(Debug)]
pub struct LocalSource {
    name: String,
    path: PathBuf,
    size: u64,
    modified: DateTime<Utc>,
    bytes_read: Arc<AtomicU64>,
}

impl LocalSource {
    /// Describe the file at `path`, named relative to `root`.
    pub fn new(root: &Path, path: &Path) -> Result<Self> {
        let meta = fs::metadata(path)?;
        Ok(Self {
            name: relative_name(root, path)?,
            path: path.to_path_buf(),
            size: meta.len(),
            modified: DateTime::<Utc>::from(meta.modified()?),
            bytes_read: Arc::new(AtomicU64::new(0)),
        })
    }

    /// Every regular file under `root`, sorted by name.
    pub fn scan(root: &Path) -> Result<Vec<Self>> {
        let mut sources = Vec::new();
        for entry in WalkDir::new(root).sort_by_file_name() {
            let entry = entry.map_err(|e| Error::Other(format!("scan failed: {e}")))?;
            if entry.file_type().is_file() {
                sources.push(Self::new(root, entry.path())?);
            }
        }
        Ok(sources)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl SourceFile for LocalSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn size(&self) -> u64 {
        self.size
    }

    fn modified(&self) -> DateTime<Utc> {
        self.modified
    }

    fn open(&self) -> Result<Box<dyn Read + Send>> {
        let file = File::open(&self.path)?;
        Ok(Box::new(CountingReader::new(
            file,
            Arc::clone(&self.bytes_read),
        )))
    }

    fn bytes_read(&self) -> u64 {
        self.bytes_read.load(Ordering::Relaxed)
    }
}

// ---------------------------------------------------------------------------
// Paths
// ---------------------------------------------------------------------------

/// Join a `/`-separated name onto `root`, refusing anything that would
/// escape it.
fn resolve(root: &Path, name: &str) -> Result<PathBuf> {
    let rel = Path::new(name);
    if name.is_empty() || !rel.components().all(|c| matches!(c, Component::Normal(_))) {
        return Err(Error::Destination(format!("invalid file name: {name:?}")));
    }
    Ok(root.join(rel))
}

fn relative_name(root: &Path, path: &Path) -> Result<String> {
    let rel = path.strip_prefix(root).map_err(|_| {
        Error::Other(format!(
            "{} is not under {}",
            path.display(),
            root.display()
        ))
    })?;
    let parts: Vec<_> = rel
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    Ok(parts.join("/"))
}
