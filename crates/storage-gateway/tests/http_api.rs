//! End-to-end coverage of the HTTP dispatcher over a real temp-directory
//! filesystem, exercising the same `warp` filter chain `storage_api`
//! serves in production. Scenarios mirror spec §8's end-to-end list.

use std::sync::Arc;

use async_trait::async_trait;
use storage_gateway::http::{self, AppState};
use storage_gateway::path_resolver::SingleStoragePathResolver;
use storage_gateway::permissions::{AccessSubTree, PermissionCache, PermissionChecker};
use storage_gateway::storage::{LocalFileSystem, Storage};
use storage_gateway::{Action, Result};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Grants every caller `Manage` everywhere — sufficient for scenarios that
/// don't specifically exercise the permission cache's inheritance rules.
struct AllowAll;

#[async_trait]
impl PermissionChecker for AllowAll {
    async fn get_tree(&self, _token: Option<&str>, _path: &Path) -> Result<AccessSubTree> {
        Ok(AccessSubTree::new(vec![(PathBuf::from("/"), Action::Manage)]))
    }

    async fn check(&self, _token: Option<&str>, _path: &Path, _action: Action) -> Result<()> {
        Ok(())
    }
}

/// Mirrors scenario 3's fixed upstream tree: `deny` at the root, `manage`
/// under `/u`, counting every call (via a handle the test keeps alongside
/// it) so the test can assert the cache only consults it once per TTL
/// window.
struct FixedTree {
    calls: Arc<std::sync::atomic::AtomicUsize>,
}

#[async_trait]
impl PermissionChecker for FixedTree {
    async fn get_tree(&self, _token: Option<&str>, _path: &Path) -> Result<AccessSubTree> {
        self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        Ok(AccessSubTree::new(vec![
            (PathBuf::from("/"), Action::Deny),
            (PathBuf::from("/u"), Action::Manage),
        ]))
    }

    async fn check(&self, _token: Option<&str>, _path: &Path, _action: Action) -> Result<()> {
        Ok(())
    }
}

fn state_with<C: PermissionChecker>(
    dir: &tempfile::TempDir,
    checker: C,
) -> Arc<AppState<SingleStoragePathResolver, LocalFileSystem, C>> {
    let resolver = Arc::new(SingleStoragePathResolver::new(dir.path()));
    let storage = Arc::new(Storage::new(resolver, LocalFileSystem::new()));
    let permissions = Arc::new(PermissionCache::new(
        checker,
        Duration::from_secs(60),
        Duration::from_secs(0),
    ));
    Arc::new(AppState { storage, permissions })
}

#[tokio::test]
async fn create_and_read_round_trips_body_and_reports_length() {
    let dir = tempfile::tempdir().unwrap();
    let state = state_with(&dir, AllowAll);
    let routes = http::routes(state);

    let put_resp = warp::test::request()
        .method("PUT")
        .path("/api/v1/storage/u/a.txt")
        .body("hello")
        .reply(&routes)
        .await;
    assert_eq!(put_resp.status(), 201);

    let get_resp = warp::test::request()
        .method("GET")
        .path("/api/v1/storage/u/a.txt")
        .reply(&routes)
        .await;
    assert_eq!(get_resp.status(), 200);
    assert_eq!(get_resp.body(), "hello");
    assert_eq!(get_resp.headers().get("X-File-Length").unwrap(), "5");
}

#[tokio::test]
async fn ambiguous_query_operations_are_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let state = state_with(&dir, AllowAll);
    let routes = http::routes(state);

    let resp = warp::test::request()
        .method("GET")
        .path("/api/v1/storage/u/?op=liststatus&open")
        .reply(&routes)
        .await;

    assert_eq!(resp.status(), 400);
    let body: serde_json::Value = serde_json::from_slice(resp.body()).unwrap();
    assert_eq!(body["error"], "Ambiguous operations");
}

#[tokio::test]
async fn permission_inheritance_avoids_a_second_upstream_call() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::create_dir_all(dir.path().join("u")).unwrap();
    std::fs::write(dir.path().join("u/a"), b"x").unwrap();
    std::fs::write(dir.path().join("u/b"), b"y").unwrap();

    let calls = Arc::new(std::sync::atomic::AtomicUsize::new(0));
    let checker = FixedTree { calls: calls.clone() };
    let state = state_with(&dir, checker);
    let routes = http::routes(state);

    let first = warp::test::request()
        .method("GET")
        .path("/api/v1/storage/u/a?op=GETFILESTATUS")
        .reply(&routes)
        .await;
    assert_eq!(first.status(), 200);

    let second = warp::test::request()
        .method("GET")
        .path("/api/v1/storage/u/b?op=GETFILESTATUS")
        .reply(&routes)
        .await;
    assert_eq!(second.status(), 200);
    let body: serde_json::Value = serde_json::from_slice(second.body()).unwrap();
    assert_eq!(body["FileStatus"]["permission"], "manage");

    assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 1);
}
