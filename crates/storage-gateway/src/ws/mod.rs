//! WebSocket protocol.
//!
//! A session is opened on a GET carrying `op=WEBSOCKET` (tree-based
//! authorization per request), `op=WEBSOCKET_READ` (legacy, unconditional
//! read), or `op=WEBSOCKET_WRITE` (legacy, unconditional read/write) — see
//! the Open Questions in the design notes for why the legacy variants
//! bypass the permission cache entirely.
//!
//! Frame layout on the wire: a 4-byte big-endian header length (counted
//! from the start of the frame, i.e. including itself), the CBOR header,
//! then the raw payload immediately after.

use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use futures::{SinkExt, StreamExt};
use warp::ws::{Message, WebSocket};

use crate::action::Action;
use crate::error::{GatewayError, Result};
use crate::path_resolver::StoragePathResolver;
use crate::permissions::{PermissionCache, PermissionChecker};
use crate::storage::{FileSystem, Storage};

/// A single READ may not ask for more than this many bytes.
pub const MAX_READ_SIZE: u64 = 16 * 1024 * 1024;
/// A whole inbound message (header + payload) may not exceed this.
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024 + 64 * 1024 + 100;

/// How a session authorizes the operations sent over it.
#[derive(Clone, Copy, Debug)]
pub enum WsMode {
    /// `op=WEBSOCKET`: every request is checked against the permission
    /// cache, same as the HTTP surface.
    Tree,
    /// `op=WEBSOCKET_READ`: unconditional read, regardless of sub-tree
    /// shape. Write/create/mkdir are rejected outright.
    LegacyReadOnly,
    /// `op=WEBSOCKET_WRITE`: unconditional read and write.
    LegacyReadWrite,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "UPPERCASE")]
enum WsOp {
    Stat,
    List,
    Read,
    Write,
    Create,
    Mkdirs,
}

impl WsOp {
    fn required_action(self) -> Action {
        match self {
            WsOp::Stat | WsOp::List | WsOp::Read => Action::Read,
            WsOp::Write | WsOp::Create | WsOp::Mkdirs => Action::Write,
        }
    }

    fn is_mutating(self) -> bool {
        matches!(self, WsOp::Write | WsOp::Create | WsOp::Mkdirs)
    }

    fn as_str(self) -> &'static str {
        match self {
            WsOp::Stat => "STAT",
            WsOp::List => "LIST",
            WsOp::Read => "READ",
            WsOp::Write => "WRITE",
            WsOp::Create => "CREATE",
            WsOp::Mkdirs => "MKDIRS",
        }
    }
}

#[derive(serde::Deserialize)]
struct RequestHeader {
    op: WsOp,
    id: i64,
    #[serde(default)]
    path: String,
    #[serde(default)]
    offset: Option<u64>,
    #[serde(default)]
    size: Option<u64>,
}

fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn ack_frame(rop: &str, rid: i64, result: serde_json::Value, payload: &[u8]) -> Message {
    let mut header = serde_json::json!({
        "op": "ACK",
        "rop": rop,
        "rid": rid,
        "timestamp": now_unix(),
    });
    if let (Some(header_map), serde_json::Value::Object(extra)) = (header.as_object_mut(), result) {
        header_map.extend(extra);
    }
    encode_frame(&header, payload)
}

fn error_frame(rop: &str, rid: i64, err: &GatewayError) -> Message {
    let mut header = serde_json::json!({
        "op": "ERROR",
        "rop": rop,
        "rid": rid,
        "timestamp": now_unix(),
        "error": err.to_string(),
    });
    if let Some(errno) = err.errno() {
        header["errno"] = serde_json::Value::String(errno.to_string());
    }
    encode_frame(&header, &[])
}

/// Session-level parse error: the frame couldn't even be decoded far enough
/// to extract an `id`, so `rop`/`rid` are empty per the protocol.
fn protocol_error_frame(err: &GatewayError) -> Message {
    let header = serde_json::json!({
        "op": "ERROR",
        "rop": "",
        "rid": serde_json::Value::Null,
        "timestamp": now_unix(),
        "error": err.to_string(),
    });
    encode_frame(&header, &[])
}

fn encode_frame(header: &serde_json::Value, payload: &[u8]) -> Message {
    let header_bytes = serde_cbor::to_vec(header).unwrap_or_default();
    let total_len = 4 + header_bytes.len();
    let mut buf = BytesMut::with_capacity(total_len + payload.len());
    buf.put_u32(total_len as u32);
    buf.put_slice(&header_bytes);
    buf.put_slice(payload);
    Message::binary(buf.freeze().to_vec())
}

/// Splits a raw inbound message into its header and payload. The returned
/// length is the *total prefix size* (the 4-byte count field is included
/// in the count it encodes), matching the wire format exactly.
fn decode_frame(mut bytes: Bytes) -> Result<(RequestHeader, Bytes)> {
    if bytes.len() < 4 {
        return Err(GatewayError::BadRequest("frame too short for length prefix".into()));
    }
    let total_prefix = bytes.get_u32() as usize;
    if total_prefix < 4 || total_prefix - 4 > bytes.len() {
        return Err(GatewayError::BadRequest("frame header length out of bounds".into()));
    }
    let header_bytes = bytes.split_to(total_prefix - 4);
    let header: RequestHeader = serde_cbor::from_slice(&header_bytes)
        .map_err(|e| GatewayError::BadRequest(format!("malformed frame header: {e}")))?;
    Ok((header, bytes))
}

/// Reject a `.`/`..`-bearing or absolute relative path outright, rather
/// than lexically collapsing it the way [`crate::path_resolver::sanitize_path`]
/// does for the HTTP surface — a WebSocket session is scoped to one root
/// and has no legitimate reason to reference `.`/`..`.
fn validate_relative_path(raw: &str) -> Result<()> {
    if raw.starts_with('/') {
        return Err(GatewayError::BadRequest("path must not be absolute".into()));
    }
    for component in Path::new(raw).components() {
        if matches!(component, Component::CurDir | Component::ParentDir) {
            return Err(GatewayError::BadRequest("path must not contain . or ..".into()));
        }
    }
    Ok(())
}

fn effective_path(session_path: &Path, relative: &str) -> PathBuf {
    if relative.is_empty() {
        session_path.to_path_buf()
    } else {
        session_path.join(relative)
    }
}

/// Serve one WebSocket connection to completion.
pub async fn serve<R, F, C>(
    socket: WebSocket,
    session_path: PathBuf,
    mode: WsMode,
    token: Option<String>,
    storage: Arc<Storage<R, F>>,
    permissions: Arc<PermissionCache<C>>,
) where
    R: StoragePathResolver,
    F: FileSystem,
    C: PermissionChecker,
{
    let (mut tx, mut rx) = socket.split();

    while let Some(frame) = rx.next().await {
        let msg = match frame {
            Ok(m) => m,
            Err(_) => break,
        };
        if msg.is_close() {
            break;
        }
        if !msg.is_binary() {
            continue;
        }
        let raw: Bytes = msg.into_bytes().into();
        if raw.len() > MAX_MESSAGE_SIZE {
            let _ = tx
                .send(Message::close_with(1003u16, "frame too large"))
                .await;
            break;
        }
        if raw.len() < 4 {
            let _ = tx
                .send(Message::close_with(1003u16, "frame too short for length prefix"))
                .await;
            break;
        }

        let (header, payload) = match decode_frame(raw) {
            Ok(parsed) => parsed,
            Err(err) => {
                let _ = tx.send(protocol_error_frame(&err)).await;
                continue;
            }
        };

        let reply = handle_request(
            &header,
            payload,
            &session_path,
            mode,
            token.as_deref(),
            &storage,
            &permissions,
        )
        .await;

        let msg = match reply {
            Ok(m) => m,
            Err(err) => error_frame(header.op.as_str(), header.id, &err),
        };
        if tx.send(msg).await.is_err() {
            break;
        }
    }
}

async fn authorize<C: PermissionChecker>(
    mode: WsMode,
    permissions: &PermissionCache<C>,
    token: Option<&str>,
    path: &Path,
    op: WsOp,
) -> Result<()> {
    match mode {
        WsMode::Tree => permissions.check(token, path, op.required_action()).await,
        WsMode::LegacyReadOnly if op.is_mutating() => Err(GatewayError::NotFound(
            "read-only session cannot perform mutating operations".into(),
        )),
        WsMode::LegacyReadOnly | WsMode::LegacyReadWrite => Ok(()),
    }
}

async fn handle_request<R, F, C>(
    header: &RequestHeader,
    payload: Bytes,
    session_path: &Path,
    mode: WsMode,
    token: Option<&str>,
    storage: &Storage<R, F>,
    permissions: &PermissionCache<C>,
) -> Result<Message>
where
    R: StoragePathResolver,
    F: FileSystem,
    C: PermissionChecker,
{
    validate_relative_path(&header.path)?;
    let path = effective_path(session_path, &header.path);

    authorize(mode, permissions, token, &path, header.op).await?;

    let (result, out_payload): (serde_json::Value, Vec<u8>) = match header.op {
        WsOp::Stat => {
            let status = storage.get_filestatus(&path).await?;
            (serde_json::json!({ "FileStatus": status }), Vec::new())
        }
        WsOp::List => {
            let entries = storage.liststatus(&path).await?;
            (
                serde_json::json!({ "FileStatuses": { "FileStatus": entries } }),
                Vec::new(),
            )
        }
        WsOp::Read => {
            let size = header
                .size
                .ok_or_else(|| GatewayError::BadRequest("READ requires size".into()))?;
            if size > MAX_READ_SIZE {
                return Err(GatewayError::BadRequest("Too large read size".into()));
            }
            let buf = read_bytes(storage, &path, header.offset.unwrap_or(0), size).await?;
            (serde_json::json!({}), buf)
        }
        WsOp::Write => {
            let offset = header
                .offset
                .ok_or_else(|| GatewayError::BadRequest("WRITE requires offset".into()))?;
            write_bytes(storage, &path, offset, &payload).await?;
            (serde_json::json!({}), Vec::new())
        }
        WsOp::Create => {
            let size = header
                .size
                .ok_or_else(|| GatewayError::BadRequest("CREATE requires size".into()))?;
            create_sized(storage, &path, size).await?;
            (serde_json::json!({}), Vec::new())
        }
        WsOp::Mkdirs => {
            storage.mkdir(&path).await?;
            (serde_json::json!({}), Vec::new())
        }
    };

    Ok(ack_frame(header.op.as_str(), header.id, result, &out_payload))
}

async fn read_bytes<R, F>(storage: &Storage<R, F>, path: &Path, offset: u64, size: u64) -> Result<Vec<u8>>
where
    R: StoragePathResolver,
    F: FileSystem,
{
    use tokio::io::{AsyncReadExt, AsyncSeekExt};
    let mut f = storage.retrieve(path).await?;
    f.seek(std::io::SeekFrom::Start(offset))
        .await
        .map_err(GatewayError::from_io)?;
    let mut buf = vec![0u8; size as usize];
    f.read_exact(&mut buf).await.map_err(GatewayError::from_io)?;
    Ok(buf)
}

async fn write_bytes<R, F>(storage: &Storage<R, F>, path: &Path, offset: u64, payload: &[u8]) -> Result<()>
where
    R: StoragePathResolver,
    F: FileSystem,
{
    use tokio::io::{AsyncSeekExt, AsyncWriteExt};
    let mut f = storage.open_for_update(path).await?;
    f.seek(std::io::SeekFrom::Start(offset))
        .await
        .map_err(GatewayError::from_io)?;
    f.write_all(payload).await.map_err(GatewayError::from_io)
}

/// Set a file's length, producing a sparse, zero-filled tail when `size`
/// exceeds the file's current length — the original `create(size)` call.
async fn create_sized<R, F>(storage: &Storage<R, F>, path: &Path, size: u64) -> Result<()>
where
    R: StoragePathResolver,
    F: FileSystem,
{
    let f = storage.open_for_update(path).await?;
    f.set_len(size).await.map_err(GatewayError::from_io)
}
