//! Maps logical `/org/project/...` paths onto a physical base directory.
//!
//! Two implementations exist: [`SingleStoragePathResolver`] always returns a
//! constant root, and [`MultipleStoragePathResolver`] probes for the
//! existence of the path's first segment under the primary base before
//! falling back to a legacy default base. This lets one deployment serve
//! both a multi-tenant layout and an un-migrated legacy layout side by side.

use std::path::{Path, PathBuf};

use async_trait::async_trait;

use crate::storage::FileSystem;

/// Resolves logical storage paths to physical filesystem paths.
#[async_trait]
pub trait StoragePathResolver: Send + Sync {
    /// The physical directory that backs `path` (or the default base, if
    /// `path` is `None`).
    async fn resolve_base_path(&self, path: Option<&Path>) -> PathBuf;

    /// `resolve_base_path(path) joined with path, stripped of its leading
    /// slash`. Not overridden by either implementation, matching the
    /// original `StoragePathResolver.resolve_path`.
    async fn resolve_path(&self, path: &Path) -> PathBuf {
        let base = self.resolve_base_path(Some(path)).await;
        let relative = path.strip_prefix("/").unwrap_or(path);
        base.join(relative)
    }
}

/// A deployment with a single physical tree.
pub struct SingleStoragePathResolver {
    base_path: PathBuf,
}

impl SingleStoragePathResolver {
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
        }
    }
}

#[async_trait]
impl StoragePathResolver for SingleStoragePathResolver {
    async fn resolve_base_path(&self, _path: Option<&Path>) -> PathBuf {
        self.base_path.clone()
    }
}

/// A deployment that serves a new multi-tenant layout under `base_path` and
/// a legacy layout under `default_path`, disambiguated purely by existence
/// probing of the logical path's first segment.
pub struct MultipleStoragePathResolver<F: FileSystem> {
    fs: F,
    base_path: PathBuf,
    default_path: PathBuf,
}

impl<F: FileSystem> MultipleStoragePathResolver<F> {
    pub fn new(fs: F, base_path: impl Into<PathBuf>, default_path: impl Into<PathBuf>) -> Self {
        Self {
            fs,
            base_path: base_path.into(),
            default_path: default_path.into(),
        }
    }
}

#[async_trait]
impl<F: FileSystem> StoragePathResolver for MultipleStoragePathResolver<F> {
    async fn resolve_base_path(&self, path: Option<&Path>) -> PathBuf {
        let path = match path {
            None => return self.base_path.clone(),
            Some(p) if p == Path::new("/") => return self.base_path.clone(),
            Some(p) => p,
        };
        let first_segment = match path.strip_prefix("/").unwrap_or(path).iter().next() {
            Some(seg) => seg,
            None => return self.base_path.clone(),
        };
        let candidate = self.base_path.join(first_segment);
        if self.fs.is_dir(&candidate).await {
            self.base_path.clone()
        } else {
            self.default_path.clone()
        }
    }
}

/// Sanitize a user-supplied path: join it onto `/` and collapse `.`/`..`
/// components lexically. Because the join always starts from the
/// filesystem root, the result is always absolute and traversal out of the
/// root is representationally impossible — there is nothing above `/` to
/// escape to.
pub fn sanitize_path(raw: &str) -> PathBuf {
    let joined = Path::new("/").join(raw.trim_start_matches('/'));
    let mut out: Vec<std::ffi::OsString> = Vec::new();
    for component in joined.components() {
        use std::path::Component::*;
        match component {
            RootDir => {}
            CurDir => {}
            ParentDir => {
                out.pop();
            }
            Normal(seg) => out.push(seg.to_owned()),
            Prefix(_) => {}
        }
    }
    let mut result = PathBuf::from("/");
    for seg in out {
        result.push(seg);
    }
    result
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn sanitize_path_is_idempotent() {
        let once = sanitize_path("a/../../b/./c");
        let twice = sanitize_path(once.to_str().unwrap());
        assert_eq!(once, twice);
    }

    #[test]
    fn sanitize_path_always_starts_with_slash() {
        for raw in ["a/b", "../../../etc/passwd", "", "/", "./a/./b"] {
            let p = sanitize_path(raw);
            assert!(p.is_absolute(), "{:?} should be absolute", p);
        }
    }

    #[test]
    fn sanitize_path_resolves_parent_components() {
        assert_eq!(sanitize_path("a/b/../c"), PathBuf::from("/a/c"));
    }

    #[test]
    fn sanitize_path_cannot_escape_root() {
        assert_eq!(sanitize_path("../../.."), PathBuf::from("/"));
    }

    #[tokio::test]
    async fn single_resolver_always_returns_configured_root() {
        let resolver = SingleStoragePathResolver::new("/data");
        let base = resolver.resolve_base_path(Some(Path::new("/u/a"))).await;
        assert_eq!(base, PathBuf::from("/data"));
    }
}
