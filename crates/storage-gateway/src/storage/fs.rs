//! The local filesystem adapter.
//!
//! Per the core's scope, the concrete backing store is an external
//! collaborator: the rest of this crate only depends on the [`FileSystem`]
//! trait. [`LocalFileSystem`] is the one implementation shipped here so the
//! crate is runnable and testable end to end, grounded in the same
//! trait-plus-reference-impl shape krustlet uses for its own `Provider` and
//! volume backends. Blocking syscalls are pushed onto the bounded
//! `tokio::task::spawn_blocking` pool via `tokio::fs`, so the I/O-event loop
//! is never stalled by them.

use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::time::UNIX_EPOCH;

use async_trait::async_trait;
use futures::Stream;
use tokio::fs::{self, File, OpenOptions};

/// Metadata about one filesystem entry, as reported by the adapter —
/// logical permission is stamped on later by the dispatcher.
#[derive(Clone, Debug)]
pub struct FileMeta {
    pub path: PathBuf,
    pub size: u64,
    pub modification_time: i64,
    pub is_dir: bool,
}

#[derive(Clone, Copy, Debug)]
pub struct DiskUsage {
    pub total: u64,
    pub used: u64,
    pub free: u64,
}

/// The filesystem operations the storage service needs. Every method
/// returns `std::io::Error` so that callers can match on `.kind()` /
/// `.raw_os_error()` the same way the original matches on Python's
/// `OSError` subclasses.
#[async_trait]
pub trait FileSystem: Clone + Send + Sync + 'static {
    async fn exists(&self, path: &Path) -> bool;
    async fn is_dir(&self, path: &Path) -> bool;

    /// Create exactly `path` as a directory; fails with `AlreadyExists` if
    /// it exists, `NotADirectory`-equivalent if a parent component isn't a
    /// directory.
    async fn mkdir(&self, path: &Path) -> std::io::Result<()>;

    /// Ensure `path` exists as a directory, creating any missing parents
    /// (`mkdir -p` semantics) — used internally wherever the Python service
    /// calls `self._fs.mkdir(real_path.parent)` before opening a file for
    /// writing.
    async fn mkdir_all(&self, path: &Path) -> std::io::Result<()>;

    async fn metadata(&self, path: &Path) -> std::io::Result<FileMeta>;
    async fn list_dir(&self, path: &Path) -> std::io::Result<Vec<FileMeta>>;

    /// The lazy counterpart to [`Self::list_dir`]: entries are read from the
    /// directory one at a time as the stream is polled, rather than
    /// collected up front — backs `Storage::iterstatus`'s scoped listing.
    async fn iterstatus_dir(
        &self,
        path: &Path,
    ) -> std::io::Result<Pin<Box<dyn Stream<Item = std::io::Result<FileMeta>> + Send>>>;

    async fn remove_file(&self, path: &Path) -> std::io::Result<()>;
    async fn remove_dir(&self, path: &Path) -> std::io::Result<()>;

    async fn rename(&self, old: &Path, new: &Path) -> std::io::Result<()>;
    async fn disk_usage(&self, path: &Path) -> std::io::Result<DiskUsage>;

    /// Open for writing, truncating (or creating) the destination —
    /// `store(create=true)`.
    async fn open_truncate(&self, path: &Path) -> std::io::Result<File>;

    /// Open an existing file for read-write without truncation —
    /// `store(create=false)`; fails with `NotFound` if absent.
    async fn open_update(&self, path: &Path) -> std::io::Result<File>;

    /// Open-or-create for read-write, matching the original `_open`
    /// helper: tries `rb+` first, falls back to `xb+` (and ensures the
    /// parent directory) on `NotFound`.
    async fn open_or_create(&self, path: &Path) -> std::io::Result<File>;

    async fn open_read(&self, path: &Path) -> std::io::Result<File>;
}

#[derive(Clone, Default)]
pub struct LocalFileSystem;

impl LocalFileSystem {
    pub fn new() -> Self {
        Self
    }
}

fn meta_to_file_meta(path: PathBuf, meta: std::fs::Metadata) -> FileMeta {
    let modification_time = meta
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0);
    FileMeta {
        path,
        size: meta.len(),
        modification_time,
        is_dir: meta.is_dir(),
    }
}

#[async_trait]
impl FileSystem for LocalFileSystem {
    async fn exists(&self, path: &Path) -> bool {
        fs::metadata(path).await.is_ok()
    }

    async fn is_dir(&self, path: &Path) -> bool {
        fs::metadata(path)
            .await
            .map(|m| m.is_dir())
            .unwrap_or(false)
    }

    async fn mkdir(&self, path: &Path) -> std::io::Result<()> {
        fs::create_dir(path).await
    }

    async fn mkdir_all(&self, path: &Path) -> std::io::Result<()> {
        fs::create_dir_all(path).await
    }

    async fn metadata(&self, path: &Path) -> std::io::Result<FileMeta> {
        let meta = fs::metadata(path).await?;
        Ok(meta_to_file_meta(path.to_path_buf(), meta))
    }

    async fn list_dir(&self, path: &Path) -> std::io::Result<Vec<FileMeta>> {
        let mut entries = fs::read_dir(path).await?;
        let mut out = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let meta = entry.metadata().await?;
            out.push(meta_to_file_meta(entry.path(), meta));
        }
        Ok(out)
    }

    async fn iterstatus_dir(
        &self,
        path: &Path,
    ) -> std::io::Result<Pin<Box<dyn Stream<Item = std::io::Result<FileMeta>> + Send>>> {
        let read_dir = fs::read_dir(path).await?;
        let stream = futures::stream::unfold(Some(read_dir), |state| async move {
            let mut read_dir = state?;
            match read_dir.next_entry().await {
                Ok(Some(entry)) => match entry.metadata().await {
                    Ok(meta) => Some((Ok(meta_to_file_meta(entry.path(), meta)), Some(read_dir))),
                    Err(e) => Some((Err(e), None)),
                },
                Ok(None) => None,
                Err(e) => Some((Err(e), None)),
            }
        });
        Ok(Box::pin(stream))
    }

    async fn remove_file(&self, path: &Path) -> std::io::Result<()> {
        fs::remove_file(path).await
    }

    async fn remove_dir(&self, path: &Path) -> std::io::Result<()> {
        fs::remove_dir(path).await
    }

    async fn rename(&self, old: &Path, new: &Path) -> std::io::Result<()> {
        fs::rename(old, new).await
    }

    async fn disk_usage(&self, path: &Path) -> std::io::Result<DiskUsage> {
        // statvfs is not exposed by tokio::fs; shell out to the blocking
        // pool so the event loop never stalls on it.
        let path = path.to_path_buf();
        tokio::task::spawn_blocking(move || disk_usage_blocking(&path))
            .await
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?
    }

    async fn open_truncate(&self, path: &Path) -> std::io::Result<File> {
        OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .await
    }

    async fn open_update(&self, path: &Path) -> std::io::Result<File> {
        OpenOptions::new().read(true).write(true).open(path).await
    }

    async fn open_or_create(&self, path: &Path) -> std::io::Result<File> {
        match OpenOptions::new().read(true).write(true).open(path).await {
            Ok(f) => Ok(f),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                if let Some(parent) = path.parent() {
                    self.mkdir_all(parent).await?;
                }
                OpenOptions::new()
                    .read(true)
                    .write(true)
                    .create_new(true)
                    .open(path)
                    .await
            }
            Err(e) => Err(e),
        }
    }

    async fn open_read(&self, path: &Path) -> std::io::Result<File> {
        File::open(path).await
    }
}

#[cfg(unix)]
fn disk_usage_blocking(path: &Path) -> std::io::Result<DiskUsage> {
    use std::ffi::CString;
    use std::mem::MaybeUninit;

    let c_path = CString::new(path.as_os_str().to_string_lossy().as_bytes())
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;
    let mut stat = MaybeUninit::<libc::statvfs>::uninit();
    let rc = unsafe { libc::statvfs(c_path.as_ptr(), stat.as_mut_ptr()) };
    if rc != 0 {
        return Err(std::io::Error::last_os_error());
    }
    let stat = unsafe { stat.assume_init() };
    let block_size = stat.f_frsize as u64;
    let total = stat.f_blocks as u64 * block_size;
    let free = stat.f_bavail as u64 * block_size;
    Ok(DiskUsage {
        total,
        used: total.saturating_sub(free),
        free,
    })
}

#[cfg(not(unix))]
fn disk_usage_blocking(_path: &Path) -> std::io::Result<DiskUsage> {
    Ok(DiskUsage {
        total: 0,
        used: 0,
        free: 0,
    })
}
