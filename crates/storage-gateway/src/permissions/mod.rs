//! Hierarchical permission cache.
//!
//! Every request carries an optional bearer token; the upstream identity
//! service answers with a sparse tree of `path -> action` mappings rooted at
//! the most specific ancestor it was asked about. [`PermissionCache`] caches
//! that sparse tree per-token so repeat requests under an already-resolved
//! sub-tree don't round-trip to the identity service, and evicts the oldest
//! entry once `expiration_interval` has elapsed since it was inserted — the
//! same head-eviction shape as krustlet's pod-state caches, but keyed by
//! `(token, path)` instead of pod UID.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;

use crate::action::Action;
use crate::error::{GatewayError, Result};

/// A sparse permission tree: `None` root action plus explicit overrides at
/// specific sub-paths, exactly as returned by the identity service's
/// `GET /api/v1/permissions/tree` response.
#[derive(Clone, Debug, Default)]
pub struct AccessSubTree {
    entries: Vec<(PathBuf, Action)>,
}

impl AccessSubTree {
    pub fn new(mut entries: Vec<(PathBuf, Action)>) -> Self {
        entries.sort_by(|a, b| b.0.as_os_str().len().cmp(&a.0.as_os_str().len()));
        Self { entries }
    }

    /// The action granted at `path`: the deepest ancestor entry (including
    /// `path` itself) that matches, or [`Action::Deny`] if none does.
    pub fn action_for(&self, path: &Path) -> Action {
        for (root, action) in &self.entries {
            if path.starts_with(root) {
                return *action;
            }
        }
        Action::Deny
    }

    /// The action of an entry rooted exactly at `path` — no ancestor
    /// inheritance. Used by LISTSTATUS to distinguish an explicit
    /// per-child override from an inherited parent action.
    pub fn exact_action_for(&self, path: &Path) -> Option<Action> {
        self.entries
            .iter()
            .find(|(root, _)| root == path)
            .map(|(_, action)| *action)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// The upstream dependency the cache wraps: answers "what can this caller do
/// under this path" without any caching of its own. The real implementation
/// is [`HttpPermissionChecker`]; tests substitute an in-memory fake.
#[async_trait]
pub trait PermissionChecker: Send + Sync {
    async fn get_tree(&self, token: Option<&str>, path: &Path) -> Result<AccessSubTree>;

    /// A single-permission check against the identity service directly,
    /// independent of the tree it returns for [`Self::get_tree`] — mirrors
    /// the original's separate `check_user_permissions` collaborator, which
    /// is consulted whenever a cached tree exists but doesn't grant enough.
    async fn check(&self, token: Option<&str>, path: &Path, action: Action) -> Result<()>;
}

struct CacheEntry {
    tree: AccessSubTree,
    /// When this tree was fetched — governs [`PermissionCache::is_live`] and
    /// is never refreshed by a hit, matching the original's `expired_at`.
    inserted_at: Instant,
    /// When this entry was last touched (inserted or hit) — governs
    /// eviction and is refreshed on every hit, matching the original's
    /// `drop_at`/`move_to_end` sliding forgetting window.
    touched_at: Instant,
}

type CacheKey = (Option<String>, PathBuf);

/// Caches [`AccessSubTree`]s per `(token, root_path)`, evicting from the
/// front once an entry has gone `forgetting_interval` without being touched.
/// A `forgetting_interval` of zero disables the forgetting window and
/// entries are evicted the instant they're touched, matching the original
/// cache's two `timedelta` settings.
pub struct PermissionCache<C: PermissionChecker> {
    checker: C,
    expiration_interval: Duration,
    forgetting_interval: Duration,
    inner: Mutex<Inner>,
}

struct Inner {
    order: VecDeque<CacheKey>,
    entries: HashMap<CacheKey, CacheEntry>,
}

impl<C: PermissionChecker> PermissionCache<C> {
    pub fn new(checker: C, expiration_interval: Duration, forgetting_interval: Duration) -> Self {
        Self {
            checker,
            expiration_interval,
            forgetting_interval,
            inner: Mutex::new(Inner {
                order: VecDeque::new(),
                entries: HashMap::new(),
            }),
        }
    }

    /// Evict every entry that has gone `expiration_interval + forgetting_interval`
    /// without being touched, from the front of the queue. Because a touch
    /// always moves its key to the back with a fresh `touched_at`, the
    /// queue stays sorted by `touched_at` ascending: the first still-live
    /// entry proves everything behind it is also still live, so eviction is
    /// O(k) in the number of expired entries, not O(n) in total cache size.
    fn evict_expired(&self, inner: &mut Inner, now: Instant) {
        let drop_after = self.expiration_interval + self.forgetting_interval;
        while let Some(key) = inner.order.front() {
            let expired = inner
                .entries
                .get(key)
                .map(|e| now.duration_since(e.touched_at) >= drop_after)
                .unwrap_or(true);
            if !expired {
                break;
            }
            let key = inner.order.pop_front().unwrap();
            inner.entries.remove(&key);
        }
    }

    fn is_live(&self, entry: &CacheEntry, now: Instant) -> bool {
        now.duration_since(entry.inserted_at) < self.expiration_interval
    }

    fn insert(&self, inner: &mut Inner, key: CacheKey, tree: AccessSubTree, now: Instant) {
        inner.entries.insert(
            key.clone(),
            CacheEntry {
                tree,
                inserted_at: now,
                touched_at: now,
            },
        );
        inner.order.push_back(key);
    }

    /// Refresh `touched_at` and move `key` to the back of the eviction
    /// queue — the sliding forgetting window: a hot entry survives as long
    /// as it keeps being asked about, regardless of insertion age.
    fn touch(&self, inner: &mut Inner, key: &CacheKey, now: Instant) {
        if let Some(entry) = inner.entries.get_mut(key) {
            entry.touched_at = now;
        } else {
            return;
        }
        if let Some(pos) = inner.order.iter().position(|k| k == key) {
            inner.order.remove(pos);
        }
        inner.order.push_back(key.clone());
    }

    /// Look up the deepest live cached ancestor of `path`, refreshing its
    /// forgetting-window deadline on a hit. Returns `None` on a full miss —
    /// callers decide whether that means "ask upstream directly" ([`Self::check`])
    /// or "fetch and cache a fresh tree" ([`Self::tree_for`]).
    fn lookup_cached(&self, token: Option<&str>, path: &Path) -> Option<AccessSubTree> {
        let token_key = token.map(str::to_owned);
        let now = Instant::now();
        let mut inner = self.inner.lock().unwrap();
        self.evict_expired(&mut inner, now);
        for ancestor in ancestors_root_first(path) {
            let key = (token_key.clone(), ancestor);
            if let Some(entry) = inner.entries.get(&key) {
                if self.is_live(entry, now) {
                    let tree = entry.tree.clone();
                    self.touch(&mut inner, &key, now);
                    return Some(tree);
                }
            }
        }
        None
    }

    /// Resolve the action a caller has on `path`. A live cached ancestor
    /// that already grants enough short-circuits the upstream call
    /// entirely; one that's cached but insufficient (e.g. a cached `read`
    /// tree against a `write` request) still delegates to the identity
    /// service's own `check` — the cached tree is a hint, not the final
    /// word, matching the original's `check_user_permissions` falling back
    /// to `check_user_permissions_uncached` rather than trusting a stale
    /// tree's shape. A full cache miss fetches and caches a tree the same
    /// way [`Self::tree_for`] does, so a later LISTSTATUS/GETFILESTATUS on
    /// the same path doesn't re-fetch.
    pub async fn check(&self, token: Option<&str>, path: &Path, requested: Action) -> Result<()> {
        if let Some(tree) = self.lookup_cached(token, path) {
            let granted = tree.action_for(path);
            if authorize(granted, requested).is_ok() {
                return Ok(());
            }
            return self.checker.check(token, path, requested).await;
        }

        let now = Instant::now();
        let tree = self.checker.get_tree(token, path).await?;
        let result = authorize(tree.action_for(path), requested);
        if tree.action_for(path) != Action::Deny {
            let token_key = token.map(str::to_owned);
            let mut inner = self.inner.lock().unwrap();
            self.insert(&mut inner, (token_key, path.to_path_buf()), tree, now);
        }
        result
    }

    /// Resolve the full access sub-tree applicable to `path`, for callers
    /// (LISTSTATUS, GETFILESTATUS) that need to stamp per-child permissions
    /// rather than just gate one action. Shares the same cache and
    /// ancestor-inheritance rules as [`Self::check`], and never persists a
    /// `Deny` result — deny decisions must always re-check, since
    /// permissions can be *granted* at any moment and a cached deny would
    /// hide that.
    pub async fn tree_for(&self, token: Option<&str>, path: &Path) -> Result<AccessSubTree> {
        if let Some(tree) = self.lookup_cached(token, path) {
            return Ok(tree);
        }

        let now = Instant::now();
        let tree = self.checker.get_tree(token, path).await?;
        if tree.action_for(path) != Action::Deny {
            let token_key = token.map(str::to_owned);
            let mut inner = self.inner.lock().unwrap();
            self.insert(&mut inner, (token_key, path.to_path_buf()), tree.clone(), now);
        }
        Ok(tree)
    }
}

/// A denied or insufficient grant surfaces as [`GatewayError::NotFound`],
/// never as an authorization-specific status — revealing that a path
/// exists but is forbidden would let a caller enumerate sub-trees they
/// can't see.
fn authorize(granted: Action, requested: Action) -> Result<()> {
    if granted.satisfies(requested) {
        Ok(())
    } else {
        Err(GatewayError::NotFound("no such file or directory".into()))
    }
}

/// `/a/b/c` -> `["/", "/a", "/a/b", "/a/b/c"]`, root first so the most
/// general cached entry is checked before the most specific — a caller with
/// a fresher grant at a deeper path always overrides a stale grant above it.
fn ancestors_root_first(path: &Path) -> Vec<PathBuf> {
    let mut out = vec![PathBuf::from("/")];
    let mut cur = PathBuf::from("/");
    for component in path.components() {
        if let std::path::Component::Normal(seg) = component {
            cur.push(seg);
            out.push(cur.clone());
        }
    }
    out
}

/// The real upstream: calls the platform identity service's permission-tree
/// endpoint over HTTP, the concrete collaborator behind [`PermissionChecker`].
pub struct HttpPermissionChecker {
    client: reqwest::Client,
    base_url: String,
}

impl HttpPermissionChecker {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
        }
    }
}

#[derive(serde::Deserialize)]
struct TreeResponseEntry {
    path: String,
    action: Action,
}

#[derive(serde::Deserialize)]
struct TreeResponse {
    tree: Vec<TreeResponseEntry>,
}

#[async_trait]
impl PermissionChecker for HttpPermissionChecker {
    async fn get_tree(&self, token: Option<&str>, path: &Path) -> Result<AccessSubTree> {
        let mut req = self
            .client
            .get(format!("{}/api/v1/permissions", self.base_url))
            .query(&[("uri", format!("storage://{}", path.display()))]);
        if let Some(token) = token {
            req = req.bearer_auth(token);
        }
        let resp = req
            .send()
            .await
            .map_err(|e| GatewayError::Internal(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(GatewayError::Internal(format!(
                "identity service returned {}",
                resp.status()
            )));
        }
        let body: TreeResponse = resp
            .json()
            .await
            .map_err(|e| GatewayError::Internal(e.to_string()))?;
        Ok(AccessSubTree::new(
            body.tree
                .into_iter()
                .map(|e| (PathBuf::from(e.path), e.action))
                .collect(),
        ))
    }

    /// Grounded on `security.py::PermissionChecker.check_user_permissions`:
    /// a single-permission check distinct from the tree endpoint, hitting
    /// the identity service directly rather than deriving the answer from
    /// a (possibly stale) cached tree. A forbidden response is folded into
    /// `NotFound`, matching the original's `HTTPForbidden -> HTTPNotFound`
    /// translation — a caller must not learn a path exists but is denied.
    async fn check(&self, token: Option<&str>, path: &Path, action: Action) -> Result<()> {
        let mut req = self
            .client
            .get(format!("{}/api/v1/permissions/check", self.base_url))
            .query(&[
                ("uri", format!("storage://{}", path.display())),
                ("action", action.as_str().to_string()),
            ]);
        if let Some(token) = token {
            req = req.bearer_auth(token);
        }
        let resp = req
            .send()
            .await
            .map_err(|e| GatewayError::Internal(e.to_string()))?;
        match resp.status() {
            s if s.is_success() => Ok(()),
            reqwest::StatusCode::FORBIDDEN | reqwest::StatusCode::NOT_FOUND => {
                Err(GatewayError::NotFound("no such file or directory".into()))
            }
            s => Err(GatewayError::Internal(format!("identity service returned {s}"))),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FakeChecker {
        calls: AtomicUsize,
        check_calls: AtomicUsize,
        tree: AccessSubTree,
        allow_on_check: bool,
    }

    #[async_trait]
    impl PermissionChecker for FakeChecker {
        async fn get_tree(&self, _token: Option<&str>, _path: &Path) -> Result<AccessSubTree> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.tree.clone())
        }

        async fn check(&self, _token: Option<&str>, _path: &Path, _action: Action) -> Result<()> {
            self.check_calls.fetch_add(1, Ordering::SeqCst);
            if self.allow_on_check {
                Ok(())
            } else {
                Err(GatewayError::NotFound("no such file or directory".into()))
            }
        }
    }

    fn cache_with(tree: AccessSubTree) -> PermissionCache<FakeChecker> {
        let checker = FakeChecker {
            calls: AtomicUsize::new(0),
            check_calls: AtomicUsize::new(0),
            tree,
            allow_on_check: true,
        };
        PermissionCache::new(checker, Duration::from_secs(60), Duration::from_secs(0))
    }

    #[tokio::test]
    async fn grants_are_cached_across_repeat_checks() {
        let tree = AccessSubTree::new(vec![(PathBuf::from("/a"), Action::Write)]);
        let cache = cache_with(tree);

        cache.check(Some("tok"), Path::new("/a/b"), Action::Read).await.unwrap();
        cache.check(Some("tok"), Path::new("/a/b"), Action::Read).await.unwrap();
        assert_eq!(cache.checker.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn deeper_path_inherits_ancestor_grant() {
        let tree = AccessSubTree::new(vec![(PathBuf::from("/a"), Action::Write)]);
        let cache = cache_with(tree);

        let result = cache.check(Some("tok"), Path::new("/a/b/c"), Action::Write).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn write_request_fails_with_read_only_grant() {
        let tree = AccessSubTree::new(vec![(PathBuf::from("/a"), Action::Read)]);
        let cache = cache_with(tree);

        let result = cache.check(Some("tok"), Path::new("/a"), Action::Write).await;
        assert!(matches!(result, Err(GatewayError::NotFound(_))));
    }

    #[tokio::test]
    async fn deny_results_are_never_cached() {
        let tree = AccessSubTree::default();
        let cache = cache_with(tree);

        let _ = cache.check(Some("tok"), Path::new("/a"), Action::Read).await;
        let _ = cache.check(Some("tok"), Path::new("/a"), Action::Read).await;
        assert_eq!(cache.checker.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn insufficient_cached_grant_delegates_to_upstream_check() {
        let tree = AccessSubTree::new(vec![(PathBuf::from("/a"), Action::Read)]);
        let cache = cache_with(tree);

        cache.check(Some("tok"), Path::new("/a"), Action::Read).await.unwrap();
        assert_eq!(cache.checker.calls.load(Ordering::SeqCst), 1);

        let result = cache.check(Some("tok"), Path::new("/a"), Action::Write).await;
        assert!(result.is_ok());
        assert_eq!(cache.checker.calls.load(Ordering::SeqCst), 1, "must not re-fetch the tree");
        assert_eq!(cache.checker.check_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn upstream_check_denial_is_not_masked_by_the_cached_tree() {
        let tree = AccessSubTree::new(vec![(PathBuf::from("/a"), Action::Read)]);
        let checker = FakeChecker {
            calls: AtomicUsize::new(0),
            check_calls: AtomicUsize::new(0),
            tree,
            allow_on_check: false,
        };
        let cache = PermissionCache::new(checker, Duration::from_secs(60), Duration::from_secs(0));

        cache.check(Some("tok"), Path::new("/a"), Action::Read).await.unwrap();
        let result = cache.check(Some("tok"), Path::new("/a"), Action::Write).await;
        assert!(matches!(result, Err(GatewayError::NotFound(_))));
        assert_eq!(cache.checker.check_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cache_hit_refreshes_forgetting_deadline_and_moves_entry_to_back() {
        let tree = AccessSubTree::new(vec![(PathBuf::from("/"), Action::Write)]);
        let cache = cache_with(tree);

        cache.check(Some("tok-a"), Path::new("/a"), Action::Read).await.unwrap();
        cache.check(Some("tok-b"), Path::new("/b"), Action::Read).await.unwrap();
        {
            let inner = cache.inner.lock().unwrap();
            assert_eq!(inner.order[0].1, PathBuf::from("/a"));
            assert_eq!(inner.order[1].1, PathBuf::from("/b"));
        }

        cache.check(Some("tok-a"), Path::new("/a"), Action::Read).await.unwrap();
        let inner = cache.inner.lock().unwrap();
        assert_eq!(inner.order.len(), 2);
        assert_eq!(inner.order[0].1, PathBuf::from("/b"));
        assert_eq!(inner.order[1].1, PathBuf::from("/a"));
    }
}
