//! Async file I/O for backing files and the persisted index.
//!
//! Backing files live flat in a private blob directory under names chosen by
//! the disk tier. The index file is written to a temporary sibling and renamed
//! into place so a crash mid-write leaves the previous snapshot intact.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use serde::Serialize;
use thiserror::Error;
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::cache::disk::DiskIndexSnapshot;

#[derive(Error, Debug)]
pub enum BlobStoreError {
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Blob file not found: {0}")]
    FileNotFound(PathBuf),

    #[error("Invalid blob name: {0}")]
    InvalidName(String),

    #[error("Index encoding error: {0}")]
    IndexEncode(#[from] serde_json::Error),
}

/// Running I/O counters, shared with every clone of the store.
#[derive(Debug, Default)]
pub struct BlobStoreStats {
    pub total_writes: AtomicU64,
    pub total_reads: AtomicU64,
    pub total_deletes: AtomicU64,
    pub total_bytes_written: AtomicU64,
    pub total_bytes_read: AtomicU64,
}

/// Plain copy of [`BlobStoreStats`] at one instant.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BlobIoCounts {
    pub writes: u64,
    pub reads: u64,
    pub deletes: u64,
    pub bytes_written: u64,
    pub bytes_read: u64,
}

impl BlobStoreStats {
    pub fn counts(&self) -> BlobIoCounts {
        BlobIoCounts {
            writes: self.total_writes.load(Ordering::Relaxed),
            reads: self.total_reads.load(Ordering::Relaxed),
            deletes: self.total_deletes.load(Ordering::Relaxed),
            bytes_written: self.total_bytes_written.load(Ordering::Relaxed),
            bytes_read: self.total_bytes_read.load(Ordering::Relaxed),
        }
    }
}

/// File system access for the disk tier.
#[derive(Debug, Clone)]
pub struct BlobStore {
    /// Directory holding backing files.
    blob_dir: PathBuf,

    stats: Arc<BlobStoreStats>,
}

impl BlobStore {
    /// Create the store, ensuring the blob directory exists.
    pub async fn new(blob_dir: PathBuf) -> Result<Self, BlobStoreError> {
        fs::create_dir_all(&blob_dir).await?;
        Ok(Self {
            blob_dir,
            stats: Arc::new(BlobStoreStats::default()),
        })
    }

    /// Resolve a blob name to its path. Names are flat: no separators, no `..`.
    fn blob_path(&self, name: &str) -> Result<PathBuf, BlobStoreError> {
        if name.is_empty() || name.contains(['/', '\\']) || name == "." || name == ".." {
            return Err(BlobStoreError::InvalidName(name.to_string()));
        }
        Ok(self.blob_dir.join(name))
    }

    /// Write a backing file.
    pub async fn write_blob(&self, name: &str, data: &[u8]) -> Result<PathBuf, BlobStoreError> {
        let path = self.blob_path(name)?;
        fs::write(&path, data).await?;

        debug!(path = %path.display(), size = data.len(), "Wrote blob");

        self.stats.total_writes.fetch_add(1, Ordering::Relaxed);
        self.stats
            .total_bytes_written
            .fetch_add(data.len() as u64, Ordering::Relaxed);

        Ok(path)
    }

    /// Read a backing file.
    pub async fn read_blob(&self, name: &str) -> Result<Bytes, BlobStoreError> {
        let path = self.blob_path(name)?;

        let data = match fs::read(&path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(BlobStoreError::FileNotFound(path));
            }
            Err(e) => return Err(e.into()),
        };

        debug!(path = %path.display(), size = data.len(), "Read blob");

        self.stats.total_reads.fetch_add(1, Ordering::Relaxed);
        self.stats
            .total_bytes_read
            .fetch_add(data.len() as u64, Ordering::Relaxed);

        Ok(Bytes::from(data))
    }

    /// Delete a backing file. A file that is already gone is not an error.
    pub async fn delete_blob(&self, name: &str) -> Result<(), BlobStoreError> {
        let path = self.blob_path(name)?;

        match fs::remove_file(&path).await {
            Ok(()) => {
                debug!(path = %path.display(), "Deleted blob");
                self.stats.total_deletes.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Delete every file in the blob directory whose name is not in `live`.
    ///
    /// Returns the number of files removed.
    pub async fn sweep_orphans(&self, live: &HashSet<String>) -> Result<usize, BlobStoreError> {
        let mut removed = 0;
        let mut entries = fs::read_dir(&self.blob_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            if live.contains(&name) {
                continue;
            }
            match fs::remove_file(entry.path()).await {
                Ok(()) => removed += 1,
                Err(e) => warn!(file = %name, error = %e, "Failed to remove orphaned blob"),
            }
        }

        if removed > 0 {
            info!(removed, dir = %self.blob_dir.display(), "Swept orphaned blobs");
        }
        Ok(removed)
    }

    /// Total bytes of files in the blob directory.
    pub async fn disk_usage(&self) -> Result<u64, BlobStoreError> {
        let mut total = 0u64;
        let mut entries = fs::read_dir(&self.blob_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let meta = entry.metadata().await?;
            if meta.is_file() {
                total += meta.len();
            }
        }
        Ok(total)
    }

    pub fn stats(&self) -> &BlobStoreStats {
        &self.stats
    }
}

/// Read the persisted index.
///
/// Returns `None` (cold start) when the file is absent, empty, or does not
/// parse; only a real I/O failure is an error.
pub async fn read_index(path: &Path) -> Result<Option<DiskIndexSnapshot>, BlobStoreError> {
    let content = match fs::read_to_string(path).await {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            info!(path = %path.display(), "No persisted index, cold start");
            return Ok(None);
        }
        Err(e) => return Err(e.into()),
    };

    if content.trim().is_empty() {
        info!(path = %path.display(), "Persisted index is empty, cold start");
        return Ok(None);
    }

    match serde_json::from_str::<Option<DiskIndexSnapshot>>(&content) {
        Ok(snapshot) => Ok(snapshot),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Persisted index unparseable, cold start");
            Ok(None)
        }
    }
}

/// Write the index atomically (temp file + rename).
///
/// Each call writes its own uniquely named temporary file, so concurrent
/// callers never rename one another's partial writes into place. Ordering
/// between concurrent callers is not guaranteed; use [`IndexWriter`] for that.
pub async fn write_index(path: &Path, snapshot: &DiskIndexSnapshot) -> Result<(), BlobStoreError> {
    let content = serde_json::to_vec(snapshot)?;

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).await?;
        }
    }

    let mut tmp = path.as_os_str().to_owned();
    tmp.push(format!(".{}.tmp", Uuid::new_v4().simple()));
    let tmp = PathBuf::from(tmp);

    fs::write(&tmp, &content).await?;
    if let Err(e) = fs::rename(&tmp, path).await {
        let _ = fs::remove_file(&tmp).await;
        return Err(e.into());
    }

    debug!(
        path = %path.display(),
        records = snapshot.map.len(),
        bytes = content.len(),
        "Persisted disk index"
    );
    Ok(())
}

/// Serializes index writes for one index file.
///
/// Snapshots are numbered by the caller in the order they were taken. Writes
/// run one at a time, and a snapshot older than the last one written is
/// skipped, so a slow earlier write can never replace a newer index.
#[derive(Debug, Clone)]
pub struct IndexWriter {
    path: PathBuf,

    /// Generation of the newest snapshot on disk.
    written: Arc<Mutex<u64>>,
}

impl IndexWriter {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            written: Arc::new(Mutex::new(0)),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write `snapshot`, taken as generation `generation`.
    ///
    /// Returns `false` when the write was skipped because a newer snapshot
    /// is already on disk.
    pub async fn write(
        &self,
        generation: u64,
        snapshot: &DiskIndexSnapshot,
    ) -> Result<bool, BlobStoreError> {
        let mut written = self.written.lock().await;
        if generation <= *written {
            debug!(generation, newest = *written, "Skipping superseded index snapshot");
            return Ok(false);
        }
        write_index(&self.path, snapshot).await?;
        *written = generation;
        Ok(true)
    }
}
