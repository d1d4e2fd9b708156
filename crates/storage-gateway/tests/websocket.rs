//! Scenario 4 end-to-end: open a `WEBSOCKET_WRITE` session, CREATE a file,
//! WRITE into it, then READ it back and check the zero-padded tail.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Buf, BufMut, BytesMut};
use storage_gateway::http::{self, AppState};
use storage_gateway::path_resolver::SingleStoragePathResolver;
use storage_gateway::permissions::{AccessSubTree, PermissionCache, PermissionChecker};
use storage_gateway::storage::{LocalFileSystem, Storage};
use storage_gateway::Result;

struct AllowAll;

#[async_trait]
impl PermissionChecker for AllowAll {
    async fn get_tree(&self, _token: Option<&str>, _path: &Path) -> Result<AccessSubTree> {
        Ok(AccessSubTree::default())
    }

    async fn check(&self, _token: Option<&str>, _path: &Path, _action: storage_gateway::Action) -> Result<()> {
        Ok(())
    }
}

fn encode(op: &str, id: i64, path: &str, offset: Option<u64>, size: Option<u64>, payload: &[u8]) -> Vec<u8> {
    let mut header = serde_json::json!({ "op": op, "id": id, "path": path });
    if let Some(offset) = offset {
        header["offset"] = serde_json::Value::from(offset);
    }
    if let Some(size) = size {
        header["size"] = serde_json::Value::from(size);
    }
    let header_bytes = serde_cbor::to_vec(&header).unwrap();
    let total_len = 4 + header_bytes.len();
    let mut buf = BytesMut::with_capacity(total_len + payload.len());
    buf.put_u32(total_len as u32);
    buf.put_slice(&header_bytes);
    buf.put_slice(payload);
    buf.to_vec()
}

/// Splits a received frame back into its CBOR header and trailing payload.
fn decode(mut bytes: bytes::Bytes) -> (serde_json::Value, Vec<u8>) {
    let total_len = bytes.get_u32() as usize;
    let header_bytes = bytes.split_to(total_len - 4);
    let header: serde_cbor::Value = serde_cbor::from_slice(&header_bytes).unwrap();
    let header = serde_json::to_value(header_to_map(header)).unwrap();
    (header, bytes.to_vec())
}

/// `serde_cbor::Value` doesn't implement `serde::Serialize` into arbitrary
/// JSON directly in a way `serde_json::Value` can consume, so re-encode via
/// CBOR's own JSON-compatible map shape.
fn header_to_map(value: serde_cbor::Value) -> serde_json::Value {
    match value {
        serde_cbor::Value::Map(m) => {
            let mut out = serde_json::Map::new();
            for (k, v) in m {
                if let serde_cbor::Value::Text(key) = k {
                    out.insert(key, header_to_map(v));
                }
            }
            serde_json::Value::Object(out)
        }
        serde_cbor::Value::Text(s) => serde_json::Value::String(s),
        serde_cbor::Value::Integer(i) => serde_json::Value::from(i as i64),
        serde_cbor::Value::Null => serde_json::Value::Null,
        serde_cbor::Value::Bool(b) => serde_json::Value::Bool(b),
        _ => serde_json::Value::Null,
    }
}

#[tokio::test]
async fn create_write_read_round_trips_zero_padded_tail() {
    let dir = tempfile::tempdir().unwrap();
    let resolver = Arc::new(SingleStoragePathResolver::new(dir.path()));
    let storage = Arc::new(Storage::new(resolver, LocalFileSystem::new()));
    let permissions = Arc::new(PermissionCache::new(AllowAll, Duration::from_secs(60), Duration::from_secs(0)));
    let state = Arc::new(AppState { storage, permissions });
    let routes = http::routes(state);

    let mut client = warp::test::ws()
        .path("/api/v1/storage/p?op=WEBSOCKET_WRITE")
        .handshake(routes)
        .await
        .expect("handshake");

    client
        .send(warp::ws::Message::binary(encode("CREATE", 1, "f", None, Some(10), &[])))
        .await;
    let (header, _) = decode(client.recv().await.unwrap().into_bytes().into());
    assert_eq!(header["op"], "ACK");
    assert_eq!(header["rid"], 1);

    client
        .send(warp::ws::Message::binary(encode(
            "WRITE",
            2,
            "f",
            Some(0),
            None,
            b"ABCDE",
        )))
        .await;
    let (header, _) = decode(client.recv().await.unwrap().into_bytes().into());
    assert_eq!(header["op"], "ACK");
    assert_eq!(header["rid"], 2);

    client
        .send(warp::ws::Message::binary(encode("READ", 3, "f", Some(0), Some(10), &[])))
        .await;
    let (header, payload) = decode(client.recv().await.unwrap().into_bytes().into());
    assert_eq!(header["op"], "ACK");
    assert_eq!(header["rid"], 3);
    assert_eq!(payload, b"ABCDE\0\0\0\0\0");
}

#[tokio::test]
async fn undersized_frame_closes_the_session_with_1003() {
    let dir = tempfile::tempdir().unwrap();
    let resolver = Arc::new(SingleStoragePathResolver::new(dir.path()));
    let storage = Arc::new(Storage::new(resolver, LocalFileSystem::new()));
    let permissions = Arc::new(PermissionCache::new(AllowAll, Duration::from_secs(60), Duration::from_secs(0)));
    let state = Arc::new(AppState { storage, permissions });
    let routes = http::routes(state);

    let mut client = warp::test::ws()
        .path("/api/v1/storage/p?op=WEBSOCKET_WRITE")
        .handshake(routes)
        .await
        .expect("handshake");

    client.send(warp::ws::Message::binary(vec![0u8, 1, 2])).await;
    let reply = client.recv().await.unwrap();
    assert!(reply.is_close());
}
