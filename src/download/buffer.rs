//! Pre-sized on-disk assembly buffer for one item.
//!
//! The file is created at its final length up front; segment workers write at
//! absolute offsets. Ranges handed out by the planner are disjoint, so writes
//! never overlap, but the underlying `tokio::fs::File` is a single cursor and
//! every positioned write therefore takes the handle lock for its
//! seek-write-flush sequence.
//!
//! The backing file is deleted by [`AssemblyBuffer::remove`], and by `Drop` if
//! `remove` was never reached (panic or early return).

use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::DownloadError;

/// Random-access byte sink backed by a single file.
#[derive(Debug)]
pub struct AssemblyBuffer {
    path: PathBuf,
    len: u64,
    file: Mutex<Option<File>>,
    removed: AtomicBool,
}

impl AssemblyBuffer {
    /// Creates (or truncates) the file at `path` and sizes it to `len` bytes.
    ///
    /// # Errors
    ///
    /// Returns [`DownloadError::Io`] if the file cannot be created or sized.
    /// A file that was created but could not be sized is deleted again.
    pub async fn create(path: impl Into<PathBuf>, len: u64) -> Result<Self, DownloadError> {
        let path = path.into();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .await
            .map_err(|e| DownloadError::io(&path, e))?;

        // Owned before sizing so that `Drop` deletes the file on failure.
        let buffer = Self {
            path,
            len,
            file: Mutex::new(Some(file)),
            removed: AtomicBool::new(false),
        };
        {
            let guard = buffer.file.lock().await;
            if let Some(file) = guard.as_ref() {
                file.set_len(len)
                    .await
                    .map_err(|e| DownloadError::io(&buffer.path, e))?;
            }
        }

        debug!(path = %buffer.path.display(), len, "assembly buffer created");
        Ok(buffer)
    }

    /// Path of the backing file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Buffer size in bytes.
    #[must_use]
    pub fn len(&self) -> u64 {
        self.len
    }

    /// Returns true for a zero-length buffer.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Writes `data` at absolute `offset`.
    ///
    /// # Errors
    ///
    /// Returns [`DownloadError::OutOfBounds`] if the write would extend past
    /// the buffer, or [`DownloadError::Io`] on file errors.
    pub async fn write_at(&self, offset: u64, data: &[u8]) -> Result<(), DownloadError> {
        let len = data.len() as u64;
        if offset.checked_add(len).is_none_or(|end| end > self.len) {
            return Err(DownloadError::OutOfBounds {
                offset,
                len,
                capacity: self.len,
            });
        }

        let mut guard = self.file.lock().await;
        let file = guard.as_mut().ok_or_else(|| self.closed_error())?;
        file.seek(SeekFrom::Start(offset))
            .await
            .map_err(|e| DownloadError::io(&self.path, e))?;
        file.write_all(data)
            .await
            .map_err(|e| DownloadError::io(&self.path, e))?;
        file.flush()
            .await
            .map_err(|e| DownloadError::io(&self.path, e))?;
        Ok(())
    }

    /// Reads up to `buf.len()` bytes starting at `offset`, returning the count read.
    ///
    /// # Errors
    ///
    /// Returns [`DownloadError::Io`] on file errors.
    pub async fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize, DownloadError> {
        if offset >= self.len {
            return Ok(0);
        }
        let remaining = usize::try_from(self.len - offset).unwrap_or(usize::MAX);
        let want = buf.len().min(remaining);

        let mut guard = self.file.lock().await;
        let file = guard.as_mut().ok_or_else(|| self.closed_error())?;
        file.seek(SeekFrom::Start(offset))
            .await
            .map_err(|e| DownloadError::io(&self.path, e))?;
        file.read_exact(&mut buf[..want])
            .await
            .map_err(|e| DownloadError::io(&self.path, e))?;
        Ok(want)
    }

    /// Flushes written data to stable storage.
    ///
    /// # Errors
    ///
    /// Returns [`DownloadError::Io`] on file errors.
    pub async fn sync(&self) -> Result<(), DownloadError> {
        let mut guard = self.file.lock().await;
        let file = guard.as_mut().ok_or_else(|| self.closed_error())?;
        file.sync_data()
            .await
            .map_err(|e| DownloadError::io(&self.path, e))
    }

    /// Size of the backing file as reported by the filesystem.
    ///
    /// # Errors
    ///
    /// Returns [`DownloadError::Io`] if metadata cannot be read.
    pub async fn on_disk_len(&self) -> Result<u64, DownloadError> {
        tokio::fs::metadata(&self.path)
            .await
            .map(|meta| meta.len())
            .map_err(|e| DownloadError::io(&self.path, e))
    }

    /// Closes the handle and deletes the backing file. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns [`DownloadError::Io`] when the file exists but cannot be deleted.
    pub async fn remove(&self) -> Result<(), DownloadError> {
        drop(self.file.lock().await.take());
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => {
                debug!(path = %self.path.display(), "assembly buffer removed");
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(DownloadError::io(&self.path, e)),
        }
        self.removed.store(true, Ordering::Release);
        Ok(())
    }

    fn closed_error(&self) -> DownloadError {
        DownloadError::io(
            &self.path,
            std::io::Error::other("assembly buffer already removed"),
        )
    }
}

impl Drop for AssemblyBuffer {
    fn drop(&mut self) {
        if self.removed.load(Ordering::Acquire) {
            return;
        }
        drop(self.file.get_mut().take());
        match std::fs::remove_file(&self.path) {
            Ok(()) => debug!(path = %self.path.display(), "assembly buffer removed on drop"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %self.path.display(), error = %e, "failed to remove assembly buffer"),
        }
    }
}
