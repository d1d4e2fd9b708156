//! Operation resolution and per-operation handlers for the HTTP dispatcher.
//!
//! The wire protocol is WebHDFS-flavored: one route, branching on an `op`
//! query parameter (or a bare query key matching a known operation name)
//! plus the HTTP method for the default when neither is present. A request
//! whose query names more than one distinct operation is rejected as
//! ambiguous rather than guessed at.

use std::collections::{HashMap, HashSet};
use std::path::Path;

use bytes::Bytes;
use warp::http::StatusCode;
use warp::reply::Reply;

use crate::action::Action;
use crate::error::{GatewayError, Result};
use crate::path_resolver::StoragePathResolver;
use crate::permissions::AccessSubTree;
use crate::storage::{resolve_logical_path as sanitize, FileStatus, FileSystem, RemoveResult, Storage};

/// Every name the dispatcher recognizes, whether given via `op=<name>` or as
/// a bare query key (`?liststatus`). The WEBSOCKET variants are recognized
/// here purely so they participate in ambiguity detection; actual upgrades
/// are routed before this module is ever reached.
const KNOWN_OPS: &[&str] = &[
    "CREATE",
    "MKDIRS",
    "OPEN",
    "LISTSTATUS",
    "GETFILESTATUS",
    "GETDISKUSAGE",
    "WEBSOCKET",
    "WEBSOCKET_READ",
    "WEBSOCKET_WRITE",
    "DELETE",
    "RENAME",
    "WRITE",
];

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Operation {
    Create { overwrite: bool },
    Mkdirs,
    Open,
    ListStatus,
    GetFileStatus,
    GetDiskUsage,
    Delete { recursive: bool },
    Rename,
    Write,
    /// HEAD's implicit default — a stat with no JSON body, only headers.
    Stat,
}

impl Operation {
    pub fn required_action(&self) -> Action {
        match self {
            Operation::Open
            | Operation::ListStatus
            | Operation::GetFileStatus
            | Operation::GetDiskUsage
            | Operation::Stat => Action::Read,
            Operation::Create { .. }
            | Operation::Mkdirs
            | Operation::Write
            | Operation::Delete { .. }
            | Operation::Rename => Action::Write,
        }
    }

    /// LISTSTATUS and GETFILESTATUS authorize via the full access sub-tree
    /// (to stamp per-child permissions), every other op via a plain
    /// action check.
    pub fn needs_tree(&self) -> bool {
        matches!(self, Operation::ListStatus | Operation::GetFileStatus)
    }
}

pub fn parse_query(raw: &str) -> HashMap<String, String> {
    raw.split('&')
        .filter(|kv| !kv.is_empty())
        .filter_map(|kv| {
            let mut parts = kv.splitn(2, '=');
            let key = parts.next()?.to_string();
            let value = parts.next().unwrap_or("").to_string();
            Some((key.to_lowercase(), value))
        })
        .collect()
}

fn param_bool(params: &HashMap<String, String>, key: &str, default: bool) -> bool {
    params
        .get(key)
        .map(|v| v.eq_ignore_ascii_case("true"))
        .unwrap_or(default)
}

/// The op name the request selects, per §4.D's rule set: `op=<name>` (rule
/// 1) and any bare query key matching a known op name (rule 2) are unioned;
/// more than one distinct name is ambiguous (rule 3); otherwise default by
/// method (rule 4).
fn resolve_operation_name(method: &warp::http::Method, params: &HashMap<String, String>) -> Result<String> {
    let mut candidates: HashSet<String> = HashSet::new();

    if let Some(op) = params.get("op") {
        candidates.insert(op.to_uppercase());
    }
    for key in params.keys() {
        let upper = key.to_uppercase();
        if KNOWN_OPS.contains(&upper.as_str()) {
            candidates.insert(upper);
        }
    }

    if candidates.len() > 1 {
        return Err(GatewayError::BadRequest("Ambiguous operations".into()));
    }
    if let Some(op) = candidates.into_iter().next() {
        return Ok(op);
    }

    match method.as_str() {
        "PUT" => Ok("CREATE".to_string()),
        "GET" => Ok("OPEN".to_string()),
        "POST" => Ok("RENAME".to_string()),
        "DELETE" => Ok("DELETE".to_string()),
        "PATCH" => Ok("WRITE".to_string()),
        "HEAD" => Ok("STAT".to_string()),
        other => Err(GatewayError::BadRequest(format!("unsupported method {other}"))),
    }
}

pub fn resolve_operation(method: &warp::http::Method, params: &HashMap<String, String>) -> Result<Operation> {
    let name = resolve_operation_name(method, params)?;
    Ok(match name.as_str() {
        "CREATE" => Operation::Create {
            overwrite: param_bool(params, "overwrite", false),
        },
        "MKDIRS" => Operation::Mkdirs,
        "OPEN" => Operation::Open,
        "LISTSTATUS" => Operation::ListStatus,
        "GETFILESTATUS" => Operation::GetFileStatus,
        "GETDISKUSAGE" => Operation::GetDiskUsage,
        "DELETE" => Operation::Delete {
            recursive: param_bool(params, "recursive", false),
        },
        "RENAME" => Operation::Rename,
        "WRITE" => Operation::Write,
        "STAT" => Operation::Stat,
        other => {
            return Err(GatewayError::BadRequest(format!(
                "{other} is not a dispatchable storage operation"
            )))
        }
    })
}

/// Stamp each entry's permission per §4.D: an exact sub-tree match wins;
/// otherwise inherit the parent's action if it's at least `read`; otherwise
/// the entry is omitted entirely (never emit a `deny`-effective entry). Used
/// by the eager JSON LISTSTATUS reply; the ndjson reply applies the same
/// rule per-entry as it streams, in [`liststatus_ndjson_stream`].
fn stamp_liststatus_permissions(entries: Vec<FileStatus>, dir_path: &Path, tree: &AccessSubTree) -> Vec<FileStatus> {
    let parent_action = tree.action_for(dir_path);
    entries
        .into_iter()
        .filter_map(|status| {
            let child_path = Path::new(&status.path);
            let action = match tree.exact_action_for(child_path) {
                Some(action) => action,
                None if parent_action.satisfies(Action::Read) => parent_action,
                None => return None,
            };
            if action.satisfies(Action::List) {
                Some(status.with_permission(action))
            } else {
                None
            }
        })
        .collect()
}

pub struct WriteInputs {
    pub content_range: Option<String>,
    pub content_type: Option<String>,
    pub conditional_headers_present: bool,
}

pub async fn dispatch<R, F>(
    storage: &Storage<R, F>,
    operation: Operation,
    path: &Path,
    params: &HashMap<String, String>,
    range_header: Option<String>,
    write_inputs: WriteInputs,
    tree: Option<AccessSubTree>,
    body: Bytes,
) -> Result<Box<dyn Reply>>
where
    R: StoragePathResolver,
    F: FileSystem,
{
    match operation {
        Operation::Create { overwrite } => {
            use tokio::io::AsyncWriteExt;
            if !overwrite && storage.exists(path).await {
                return Err(GatewayError::Exists(format!("{} already exists", path.display())));
            }
            let mut f = storage.store(path, true).await?;
            f.write_all(&body).await.map_err(GatewayError::from_io)?;
            Ok(Box::new(StatusCode::CREATED))
        }

        Operation::Write => {
            use tokio::io::{AsyncSeekExt, AsyncWriteExt};
            if write_inputs.conditional_headers_present {
                return Err(GatewayError::BadRequest(
                    "conditional headers are not supported on WRITE".into(),
                ));
            }
            if write_inputs.content_type.as_deref() != Some("application/octet-stream") {
                return Err(GatewayError::BadRequest(
                    "WRITE requires Content-Type: application/octet-stream".into(),
                ));
            }
            let spec = write_inputs
                .content_range
                .as_deref()
                .ok_or_else(|| GatewayError::BadRequest("WRITE requires Content-Range".into()))?;
            let (start, end) = parse_content_range(spec)
                .ok_or_else(|| GatewayError::BadRequest("malformed Content-Range".into()))?;
            let expected_len = (end - start + 1) as usize;
            if body.len() != expected_len {
                return Err(GatewayError::BadRequest(
                    "body length does not match Content-Range".into(),
                ));
            }
            let mut f = storage.store(path, false).await?;
            f.seek(std::io::SeekFrom::Start(start)).await.map_err(GatewayError::from_io)?;
            f.write_all(&body).await.map_err(GatewayError::from_io)?;
            Ok(Box::new(StatusCode::OK))
        }

        Operation::Mkdirs => {
            storage.mkdir(path).await?;
            Ok(Box::new(StatusCode::CREATED))
        }

        Operation::Stat => {
            let status = storage.get_filestatus(path).await?;
            Ok(Box::new(file_status_headers(&status)))
        }

        Operation::Open => {
            use tokio::io::{AsyncReadExt, AsyncSeekExt};
            let mut f = storage.retrieve(path).await?;
            let size = f.metadata().await.map_err(GatewayError::from_io)?.len();
            let (start, end) = match range_header.as_deref().map(parse_range) {
                Some(Some((s, e))) => (s, e.unwrap_or(size.saturating_sub(1))),
                Some(None) => return Err(GatewayError::RangeNotSatisfiable { size }),
                None => (0, size.saturating_sub(1)),
            };
            if size == 0 && range_header.is_none() {
                let reply = warp::reply::with_status(Vec::<u8>::new(), StatusCode::OK);
                let reply = warp::reply::with_header(reply, "X-File-Length", "0");
                return Ok(Box::new(reply));
            }
            if start > end || start >= size {
                return Err(GatewayError::RangeNotSatisfiable { size });
            }
            f.seek(std::io::SeekFrom::Start(start)).await.map_err(GatewayError::from_io)?;
            let to_read = (end - start + 1) as usize;
            let mut buf = vec![0u8; to_read];
            f.read_exact(&mut buf).await.map_err(GatewayError::from_io)?;

            if range_header.is_some() {
                let reply = warp::reply::with_status(buf, StatusCode::PARTIAL_CONTENT);
                let reply = warp::reply::with_header(
                    reply,
                    "Content-Range",
                    format!("bytes {start}-{end}/{size}"),
                );
                Ok(Box::new(reply))
            } else {
                let reply = warp::reply::with_status(buf, StatusCode::OK);
                let reply = warp::reply::with_header(reply, "X-File-Length", size.to_string());
                Ok(Box::new(reply))
            }
        }

        Operation::ListStatus => {
            let tree = tree.unwrap_or_default();
            let entries = storage.liststatus(path).await?;
            let entries = stamp_liststatus_permissions(entries, path, &tree);
            Ok(Box::new(warp::reply::json(&ListStatusBody {
                file_statuses: FileStatusesWrapper { file_status: entries },
            })))
        }

        Operation::GetFileStatus => {
            let tree = tree.unwrap_or_default();
            let mut status = storage.get_filestatus(path).await?;
            status = status.with_permission(tree.action_for(path));
            Ok(Box::new(warp::reply::json(&GetFileStatusBody { file_status: status })))
        }

        Operation::GetDiskUsage => {
            let usage = storage.disk_usage(path).await?;
            Ok(Box::new(warp::reply::json(&serde_json::json!({
                "total": usage.total,
                "used": usage.used,
                "free": usage.free,
            }))))
        }

        Operation::Delete { recursive } => {
            storage.remove(path, recursive).await?;
            Ok(Box::new(StatusCode::NO_CONTENT))
        }

        Operation::Rename => {
            let destination = params
                .get("destination")
                .ok_or_else(|| GatewayError::BadRequest("RENAME requires ?destination=".into()))?;
            let destination = sanitize(destination);
            storage.rename(path, &destination).await?;
            Ok(Box::new(StatusCode::NO_CONTENT))
        }
    }
}

fn file_status_headers(status: &FileStatus) -> impl Reply {
    let file_type = match status.kind {
        crate::storage::FileStatusType::File => "FILE",
        crate::storage::FileStatusType::Directory => "DIRECTORY",
    };
    let reply = warp::reply::with_status(warp::reply::reply(), StatusCode::OK);
    let reply = warp::reply::with_header(reply, "X-File-Type", file_type);
    let reply = warp::reply::with_header(reply, "X-File-Permission", status.permission.as_str());
    let reply = warp::reply::with_header(reply, "Last-Modified", status.modification_time.to_string());
    if matches!(status.kind, crate::storage::FileStatusType::File) {
        let reply = warp::reply::with_header(reply, "X-File-Length", status.length.to_string());
        warp::reply::with_header(reply, "Accept-Range", "bytes")
    } else {
        warp::reply::with_header(reply, "Accept-Range", "")
    }
}

#[derive(serde::Serialize)]
struct GetFileStatusBody {
    #[serde(rename = "FileStatus")]
    file_status: FileStatus,
}

#[derive(serde::Serialize)]
struct FileStatusesWrapper {
    #[serde(rename = "FileStatus")]
    file_status: Vec<FileStatus>,
}

#[derive(serde::Serialize)]
struct ListStatusBody {
    #[serde(rename = "FileStatuses")]
    file_statuses: FileStatusesWrapper,
}

/// One ndjson line per entry read lazily off `entries` (backed by
/// `Storage::iterstatus`), for `LISTSTATUS` under
/// `Accept: application/x-ndjson`. Stamps and filters permissions the same
/// way [`stamp_liststatus_permissions`] does for the eager JSON reply, but
/// one entry at a time as the underlying directory read progresses. If the
/// underlying read fails partway through, the stream ends with a trailing
/// `{error, errno}` line rather than an HTTP error status, since headers may
/// already be on the wire by then.
pub fn liststatus_ndjson_stream(
    entries: impl futures::Stream<Item = Result<FileStatus>> + Send + 'static,
    dir_path: std::path::PathBuf,
    tree: AccessSubTree,
) -> impl futures::Stream<Item = std::result::Result<Bytes, std::io::Error>> {
    use futures::StreamExt;

    let parent_action = tree.action_for(&dir_path);
    futures::stream::unfold((Box::pin(entries), false), move |(mut entries, done)| {
        let tree = tree.clone();
        async move {
            if done {
                return None;
            }
            loop {
                match entries.next().await {
                    Some(Ok(status)) => {
                        let child_path = Path::new(&status.path);
                        let action = match tree.exact_action_for(child_path) {
                            Some(action) => action,
                            None if parent_action.satisfies(Action::Read) => parent_action,
                            None => continue,
                        };
                        if !action.satisfies(Action::List) {
                            continue;
                        }
                        let status = status.with_permission(action);
                        let mut line =
                            serde_json::to_vec(&serde_json::json!({ "FileStatus": status })).unwrap_or_default();
                        line.push(b'\n');
                        return Some((Ok(Bytes::from(line)), (entries, false)));
                    }
                    Some(Err(e)) => {
                        let mut obj = serde_json::json!({ "error": e.to_string() });
                        if let Some(errno) = e.errno() {
                            obj["errno"] = serde_json::Value::String(errno.to_string());
                        }
                        let mut line = serde_json::to_vec(&obj).unwrap_or_default();
                        line.push(b'\n');
                        return Some((Ok(Bytes::from(line)), (entries, true)));
                    }
                    None => return None,
                }
            }
        }
    })
}

/// One ndjson line per node removed, for `DELETE` under
/// `Accept: application/x-ndjson`.
pub fn delete_ndjson_stream(
    results: Vec<RemoveResult>,
) -> impl futures::Stream<Item = std::result::Result<Bytes, std::io::Error>> {
    futures::stream::iter(results.into_iter().map(|r| {
        let mut line =
            serde_json::to_vec(&serde_json::json!({ "path": r.path, "is_dir": r.is_dir })).unwrap_or_default();
        line.push(b'\n');
        Ok(Bytes::from(line))
    }))
}

/// Parse `Range: bytes=start-end` (suffix `end` optional). `None` on
/// malformed input, `Some(None)` is never produced.
fn parse_range(header: &str) -> Option<(u64, Option<u64>)> {
    let spec = header.strip_prefix("bytes=")?;
    let (start_s, end_s) = spec.split_once('-')?;
    let start: u64 = start_s.parse().ok()?;
    let end = if end_s.is_empty() { None } else { Some(end_s.parse().ok()?) };
    Some((start, end))
}

/// Parse `Content-Range: bytes start-end/(size|*)`, returning `(start,
/// end)` inclusive. The total-size part is validated for shape but not
/// otherwise consulted by the caller.
fn parse_content_range(header: &str) -> Option<(u64, u64)> {
    let spec = header.strip_prefix("bytes ")?;
    let (range, total) = spec.split_once('/')?;
    if total != "*" && total.parse::<u64>().is_err() {
        return None;
    }
    let (start_s, end_s) = range.split_once('-')?;
    Some((start_s.parse().ok()?, end_s.parse().ok()?))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn ambiguous_request_from_op_and_bare_key() {
        let mut params = HashMap::new();
        params.insert("op".to_string(), "liststatus".to_string());
        params.insert("open".to_string(), "".to_string());
        let err = resolve_operation(&warp::http::Method::GET, &params).unwrap_err();
        assert!(matches!(err, GatewayError::BadRequest(ref m) if m == "Ambiguous operations"));
    }

    #[test]
    fn defaults_by_method_when_no_op_given() {
        let params = HashMap::new();
        assert_eq!(
            resolve_operation(&warp::http::Method::PUT, &params).unwrap(),
            Operation::Create { overwrite: false }
        );
        assert_eq!(resolve_operation(&warp::http::Method::GET, &params).unwrap(), Operation::Open);
        assert_eq!(resolve_operation(&warp::http::Method::HEAD, &params).unwrap(), Operation::Stat);
    }

    #[test]
    fn create_reads_overwrite_flag() {
        let mut params = HashMap::new();
        params.insert("op".to_string(), "CREATE".to_string());
        params.insert("overwrite".to_string(), "true".to_string());
        let op = resolve_operation(&warp::http::Method::PUT, &params).unwrap();
        assert_eq!(op, Operation::Create { overwrite: true });
    }

    #[test]
    fn parse_range_handles_open_ended_suffix() {
        assert_eq!(parse_range("bytes=10-"), Some((10, None)));
        assert_eq!(parse_range("bytes=10-20"), Some((10, Some(20))));
        assert_eq!(parse_range("garbage"), None);
    }

    #[test]
    fn parse_content_range_accepts_wildcard_total() {
        assert_eq!(parse_content_range("bytes 0-4/*"), Some((0, 4)));
        assert_eq!(parse_content_range("bytes 0-4/10"), Some((0, 4)));
        assert_eq!(parse_content_range("bogus"), None);
    }

    #[test]
    fn liststatus_skips_entries_below_list_when_not_explicit() {
        let tree = AccessSubTree::new(vec![(std::path::PathBuf::from("/u"), Action::List)]);
        let entries = vec![FileStatus {
            path: "/u/a".into(),
            kind: crate::storage::FileStatusType::File,
            length: 0,
            modification_time: 0,
            permission: Action::Deny,
        }];
        let stamped = stamp_liststatus_permissions(entries, Path::new("/u"), &tree);
        assert!(stamped.is_empty());
    }

    #[tokio::test]
    async fn ndjson_stream_skips_denied_entries_and_stamps_the_rest() {
        use futures::StreamExt;

        let tree = AccessSubTree::new(vec![(std::path::PathBuf::from("/u"), Action::Read)]);
        let entries = vec![
            FileStatus {
                path: "/u/a".into(),
                kind: crate::storage::FileStatusType::File,
                length: 1,
                modification_time: 0,
                permission: Action::Deny,
            },
            FileStatus {
                path: "/u/b".into(),
                kind: crate::storage::FileStatusType::File,
                length: 2,
                modification_time: 0,
                permission: Action::Deny,
            },
        ];
        let source = futures::stream::iter(entries.into_iter().map(Ok));
        let stream = liststatus_ndjson_stream(source, std::path::PathBuf::from("/u"), tree);
        let lines: Vec<_> = stream.map(|r| r.unwrap()).collect().await;
        assert_eq!(lines.len(), 2);
        let first: serde_json::Value = serde_json::from_slice(&lines[0]).unwrap();
        assert_eq!(first["FileStatus"]["permission"], "read");
    }

    #[tokio::test]
    async fn ndjson_stream_ends_with_an_error_line_on_read_failure() {
        use futures::StreamExt;

        let tree = AccessSubTree::default();
        let source = futures::stream::iter(vec![Err(GatewayError::from_io(std::io::Error::new(
            std::io::ErrorKind::PermissionDenied,
            "denied",
        )))]);
        let stream = liststatus_ndjson_stream(source, std::path::PathBuf::from("/u"), tree);
        let lines: Vec<_> = stream.map(|r| r.unwrap()).collect().await;
        assert_eq!(lines.len(), 1);
        let obj: serde_json::Value = serde_json::from_slice(&lines[0]).unwrap();
        assert!(obj.get("error").is_some());
    }
}
