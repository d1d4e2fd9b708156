//! The storage orchestrator: resolves logical paths, talks to the
//! [`FileSystem`] adapter, and assembles [`FileStatus`] records. This is the
//! layer the HTTP and WebSocket dispatchers both sit on top of, mirroring
//! the original service's `Storage` class.

mod fs;

pub use fs::{DiskUsage, FileMeta, FileSystem, LocalFileSystem};

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::fs::File;

use crate::action::Action;
use crate::error::{GatewayError, Result};
use crate::path_resolver::{sanitize_path, StoragePathResolver};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FileStatusType {
    File,
    Directory,
}

/// The POSIX-like stat record returned by `GETFILESTATUS`/`LISTSTATUS`, and
/// embedded in the `STATUS` frame of the WebSocket protocol.
#[derive(Clone, Debug, serde::Serialize)]
pub struct FileStatus {
    pub path: String,
    #[serde(rename = "type")]
    pub kind: FileStatusType,
    pub length: u64,
    pub modification_time: i64,
    pub permission: Action,
}

impl serde::Serialize for FileStatusType {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(match self {
            FileStatusType::File => "FILE",
            FileStatusType::Directory => "DIRECTORY",
        })
    }
}

impl FileStatus {
    fn from_meta(meta: &FileMeta, relative_path: &str, permission: Action) -> Self {
        FileStatus {
            path: relative_path.to_string(),
            kind: if meta.is_dir {
                FileStatusType::Directory
            } else {
                FileStatusType::File
            },
            length: meta.size,
            modification_time: meta.modification_time,
            permission: permission.as_file_permission(),
        }
    }

    /// Stamp a different logical permission onto an already-built status,
    /// matching the original `fstat.with_permission(action)` helper used
    /// once the permission cache has resolved the caller's actual action.
    pub fn with_permission(mut self, permission: Action) -> Self {
        self.permission = permission.as_file_permission();
        self
    }
}

/// One entry of a bulk-delete listing — mirrors spec's `RemoveListing`.
/// `iterremove` fails the whole operation on the first error rather than
/// attaching it per-entry, so this carries no error field.
#[derive(Debug)]
pub struct RemoveResult {
    pub path: String,
    pub is_dir: bool,
}

/// Orchestrates filesystem operations over a logical POSIX-like tree,
/// generic over the path resolver and filesystem adapter so tests can swap
/// in an in-memory or single-root fake without touching real disk.
pub struct Storage<R, F> {
    resolver: Arc<R>,
    fs: F,
}

impl<R: StoragePathResolver, F: FileSystem> Storage<R, F> {
    pub fn new(resolver: Arc<R>, fs: F) -> Self {
        Self { resolver, fs }
    }

    async fn real_path(&self, logical: &Path) -> PathBuf {
        self.resolver.resolve_path(logical).await
    }

    pub async fn exists(&self, path: &Path) -> bool {
        let real = self.real_path(path).await;
        self.fs.exists(&real).await
    }

    pub async fn get_filestatus(&self, path: &Path) -> Result<FileStatus> {
        let real = self.real_path(path).await;
        let meta = self
            .fs
            .metadata(&real)
            .await
            .map_err(GatewayError::from_io)?;
        Ok(FileStatus::from_meta(&meta, path_str(path), Action::Read))
    }

    pub async fn liststatus(&self, path: &Path) -> Result<Vec<FileStatus>> {
        let real = self.real_path(path).await;
        if !self.fs.is_dir(&real).await {
            return Err(GatewayError::NotDirectory(format!(
                "{} is not a directory",
                path.display()
            )));
        }
        let entries = self.fs.list_dir(&real).await.map_err(GatewayError::from_io)?;
        Ok(entries
            .iter()
            .map(|meta| {
                let name = meta
                    .path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default();
                let child_path = join_logical(path, &name);
                FileStatus::from_meta(meta, &child_path, Action::Read)
            })
            .collect())
    }

    /// The lazy, scoped counterpart to [`Self::liststatus`]: entries are
    /// read from the directory as the stream is polled rather than
    /// collected into a `Vec` up front, so a large directory's LISTSTATUS
    /// ndjson reply can start flowing before the whole listing is read.
    pub async fn iterstatus(
        &self,
        path: &Path,
    ) -> Result<impl futures::Stream<Item = Result<FileStatus>> + Send + 'static> {
        use futures::StreamExt;

        let real = self.real_path(path).await;
        if !self.fs.is_dir(&real).await {
            return Err(GatewayError::NotDirectory(format!(
                "{} is not a directory",
                path.display()
            )));
        }
        let dir_path = path.to_path_buf();
        let inner = self.fs.iterstatus_dir(&real).await.map_err(GatewayError::from_io)?;
        Ok(inner.map(move |entry| {
            let meta = entry.map_err(GatewayError::from_io)?;
            let name = meta
                .path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            let child_path = join_logical(&dir_path, &name);
            Ok(FileStatus::from_meta(&meta, &child_path, Action::Read))
        }))
    }

    pub async fn mkdir(&self, path: &Path) -> Result<()> {
        let real = self.real_path(path).await;
        self.fs.mkdir_all(&real).await.map_err(GatewayError::from_io)
    }

    /// Open `path` for writing; `create=true` truncates-or-creates,
    /// `create=false` requires an existing file and does not truncate it —
    /// matching the original `store(path, create)` distinction used by
    /// `CREATE` (with `overwrite`) versus `WRITE`.
    pub async fn store(&self, path: &Path, create: bool) -> Result<File> {
        let real = self.real_path(path).await;
        if create {
            if let Some(parent) = real.parent() {
                self.fs.mkdir_all(parent).await.map_err(GatewayError::from_io)?;
            }
            self.fs.open_truncate(&real).await.map_err(GatewayError::from_io)
        } else {
            self.fs.open_update(&real).await.map_err(GatewayError::from_io)
        }
    }

    /// Open-or-create for read-write, used by the WebSocket `WRITE`
    /// operation's implicit-create semantics (`_open` in the original).
    pub async fn open_for_update(&self, path: &Path) -> Result<File> {
        let real = self.real_path(path).await;
        self.fs.open_or_create(&real).await.map_err(GatewayError::from_io)
    }

    pub async fn retrieve(&self, path: &Path) -> Result<File> {
        let real = self.real_path(path).await;
        self.fs.open_read(&real).await.map_err(GatewayError::from_io)
    }

    pub async fn remove(&self, path: &Path, recursive: bool) -> Result<()> {
        let real = self.real_path(path).await;
        if self.fs.is_dir(&real).await {
            if recursive {
                self.remove_dir_recursive(&real).await
            } else {
                self.fs.remove_dir(&real).await.map_err(GatewayError::from_io)
            }
        } else {
            self.fs.remove_file(&real).await.map_err(GatewayError::from_io)
        }
    }

    fn remove_dir_recursive<'a>(
        &'a self,
        real: &'a Path,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async move {
            let entries = self.fs.list_dir(real).await.map_err(GatewayError::from_io)?;
            for entry in entries {
                if entry.is_dir {
                    self.remove_dir_recursive(&entry.path).await?;
                } else {
                    self.fs
                        .remove_file(&entry.path)
                        .await
                        .map_err(GatewayError::from_io)?;
                }
            }
            self.fs.remove_dir(real).await.map_err(GatewayError::from_io)
        })
    }

    /// Bulk-delete `path`, yielding one [`RemoveResult`] per node removed in
    /// depth-first order (children before their parent) — matching the
    /// original `iterremove` generator's per-node progress reporting.
    pub async fn iterremove(&self, path: &Path, recursive: bool) -> Result<Vec<RemoveResult>> {
        let real = self.real_path(path).await;
        self.remove_walk(&real, path.to_path_buf(), recursive).await
    }

    fn remove_walk<'a>(
        &'a self,
        real: &'a Path,
        logical: PathBuf,
        recursive: bool,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<Vec<RemoveResult>>> + Send + 'a>> {
        Box::pin(async move {
            let is_dir = self.fs.is_dir(real).await;
            let mut out = Vec::new();
            if is_dir {
                if recursive {
                    let entries = self.fs.list_dir(real).await.map_err(GatewayError::from_io)?;
                    for entry in entries {
                        let name = entry
                            .path
                            .file_name()
                            .map(|n| n.to_string_lossy().into_owned())
                            .unwrap_or_default();
                        let child_logical = join_logical(&logical, &name);
                        out.extend(
                            self.remove_walk(&entry.path, PathBuf::from(child_logical), recursive)
                                .await?,
                        );
                    }
                }
                self.fs.remove_dir(real).await.map_err(GatewayError::from_io)?;
            } else {
                self.fs.remove_file(real).await.map_err(GatewayError::from_io)?;
            }
            out.push(RemoveResult {
                path: path_str(&logical).to_string(),
                is_dir,
            });
            Ok(out)
        })
    }

    pub async fn rename(&self, src: &Path, dst: &Path) -> Result<()> {
        let real_src = self.real_path(src).await;
        let real_dst = self.real_path(dst).await;
        if !self.fs.exists(&real_src).await {
            return Err(GatewayError::NotFound(format!("{} not found", src.display())));
        }
        if let Some(parent) = real_dst.parent() {
            self.fs.mkdir_all(parent).await.map_err(GatewayError::from_io)?;
        }
        self.fs.rename(&real_src, &real_dst).await.map_err(GatewayError::from_io)
    }

    pub async fn disk_usage(&self, path: &Path) -> Result<DiskUsage> {
        let real = self.real_path(path).await;
        self.fs.disk_usage(&real).await.map_err(GatewayError::from_io)
    }
}

/// `resolve` a raw string path through [`sanitize_path`] before any
/// storage operation touches it — the single choke point every dispatcher
/// is expected to route through.
pub fn resolve_logical_path(raw: &str) -> PathBuf {
    sanitize_path(raw)
}

fn path_str(path: &Path) -> &str {
    path.to_str().unwrap_or("/")
}

fn join_logical(parent: &Path, name: &str) -> String {
    let mut s = parent.to_string_lossy().into_owned();
    if !s.ends_with('/') {
        s.push('/');
    }
    s.push_str(name);
    s
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::path_resolver::SingleStoragePathResolver;
    use std::sync::Arc;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn storage(dir: &tempfile::TempDir) -> Storage<SingleStoragePathResolver, LocalFileSystem> {
        let resolver = Arc::new(SingleStoragePathResolver::new(dir.path()));
        Storage::new(resolver, LocalFileSystem::new())
    }

    #[tokio::test]
    async fn store_then_retrieve_round_trips_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let storage = storage(&dir);

        let mut f = storage.store(Path::new("/a/b.txt"), true).await.unwrap();
        f.write_all(b"hello").await.unwrap();
        f.flush().await.unwrap();

        let mut f = storage.retrieve(Path::new("/a/b.txt")).await.unwrap();
        let mut buf = Vec::new();
        f.read_to_end(&mut buf).await.unwrap();
        assert_eq!(buf, b"hello");
    }

    #[tokio::test]
    async fn get_filestatus_reports_directory_type() {
        let dir = tempfile::tempdir().unwrap();
        let storage = storage(&dir);
        storage.mkdir(Path::new("/a/b")).await.unwrap();

        let status = storage.get_filestatus(Path::new("/a/b")).await.unwrap();
        assert_eq!(status.kind, FileStatusType::Directory);
    }

    #[tokio::test]
    async fn liststatus_on_file_is_not_directory_error() {
        let dir = tempfile::tempdir().unwrap();
        let storage = storage(&dir);
        let mut f = storage.store(Path::new("/a.txt"), true).await.unwrap();
        f.write_all(b"x").await.unwrap();

        let err = storage.liststatus(Path::new("/a.txt")).await.unwrap_err();
        assert!(matches!(err, GatewayError::NotDirectory(_)));
    }

    #[tokio::test]
    async fn rename_moves_file_to_new_logical_path() {
        let dir = tempfile::tempdir().unwrap();
        let storage = storage(&dir);
        let mut f = storage.store(Path::new("/a.txt"), true).await.unwrap();
        f.write_all(b"x").await.unwrap();

        storage.rename(Path::new("/a.txt"), Path::new("/b/a.txt")).await.unwrap();
        assert!(!storage.exists(Path::new("/a.txt")).await);
        assert!(storage.exists(Path::new("/b/a.txt")).await);
    }

    #[tokio::test]
    async fn iterremove_walks_depth_first_and_removes_the_root_last() {
        let dir = tempfile::tempdir().unwrap();
        let storage = storage(&dir);
        storage.store(Path::new("/dir/a.txt"), true).await.unwrap();
        storage.mkdir(Path::new("/dir/sub")).await.unwrap();
        storage.store(Path::new("/dir/sub/b.txt"), true).await.unwrap();

        let results = storage.iterremove(Path::new("/dir"), true).await.unwrap();
        let paths: Vec<&str> = results.iter().map(|r| r.path.as_str()).collect();

        assert_eq!(paths.last(), Some(&"/dir"));
        assert!(paths.contains(&"/dir/a.txt"));
        assert!(paths.contains(&"/dir/sub/b.txt"));
        assert!(paths.iter().position(|p| *p == "/dir/sub/b.txt").unwrap()
            < paths.iter().position(|p| *p == "/dir/sub").unwrap());
        assert!(!storage.exists(Path::new("/dir")).await);

        let is_dir = |p: &str| results.iter().find(|r| r.path == p).unwrap().is_dir;
        assert!(is_dir("/dir"));
        assert!(is_dir("/dir/sub"));
        assert!(!is_dir("/dir/a.txt"));
    }

    #[tokio::test]
    async fn iterstatus_lazily_streams_directory_entries() {
        use futures::StreamExt;

        let dir = tempfile::tempdir().unwrap();
        let storage = storage(&dir);
        storage.store(Path::new("/dir/a.txt"), true).await.unwrap();
        storage.store(Path::new("/dir/b.txt"), true).await.unwrap();

        let stream = storage.iterstatus(Path::new("/dir")).await.unwrap();
        let entries: Vec<FileStatus> = stream.map(|r| r.unwrap()).collect().await;
        let mut names: Vec<&str> = entries.iter().map(|e| e.path.as_str()).collect();
        names.sort();
        assert_eq!(names, vec!["/dir/a.txt", "/dir/b.txt"]);
    }
}
