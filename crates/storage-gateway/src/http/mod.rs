//! HTTP dispatcher: a single endpoint tree under `/api/v1/storage/<path>`
//! whose behavior branches on the `op` query parameter, matching the
//! original WebHDFS-flavored operation table. Built as `warp` filters, the
//! same way krustlet wires its own HTTP surface in
//! `crates/kubelet/src/webserver.rs`. A second, narrower filter upgrades GET
//! requests naming one of the `WEBSOCKET*` operations before they ever reach
//! the general dispatcher.

mod ops;

pub use ops::Operation;

use std::convert::Infallible;
use std::sync::Arc;

use bytes::Bytes;
use warp::http::StatusCode;
use warp::hyper::Body;
use warp::{Filter, Rejection, Reply};

use crate::error::{error_body, www_authenticate_header, GatewayError, Rejection as GatewayRejection};
use crate::path_resolver::StoragePathResolver;
use crate::permissions::{PermissionCache, PermissionChecker};
use crate::storage::{resolve_logical_path, FileSystem, Storage};
use crate::ws::{self, WsMode};

const SERVICE_VERSION: &str = env!("CARGO_PKG_VERSION");
const NDJSON: &str = "application/x-ndjson";

/// Shared application state handed to every handler, cheaply cloneable via
/// `Arc` the way krustlet threads its `Arc<ProviderState>` through filters.
/// `storage`/`permissions` are independently `Arc`-wrapped so a WebSocket
/// upgrade can hand its own clone to a detached task without cloning the
/// whole state.
pub struct AppState<R, F, C: PermissionChecker> {
    pub storage: Arc<Storage<R, F>>,
    pub permissions: Arc<PermissionCache<C>>,
}

/// `None` when the header is absent (anonymous request, left to the
/// identity service to accept or deny); `Err` when present but not a
/// well-formed bearer credential.
fn bearer_token(header: Option<String>) -> Result<Option<String>, GatewayError> {
    match header {
        None => Ok(None),
        Some(raw) => raw
            .strip_prefix("Bearer ")
            .map(|tok| Some(tok.to_owned()))
            .ok_or_else(|| GatewayError::Unauthorized("malformed Authorization header".into())),
    }
}

fn wants_ndjson(accept: &Option<String>) -> bool {
    accept.as_deref().map(|a| a.contains(NDJSON)).unwrap_or(false)
}

fn has_conditional_headers(
    if_match: &Option<String>,
    if_none_match: &Option<String>,
    if_range: &Option<String>,
    if_unmodified_since: &Option<String>,
) -> bool {
    if_match.is_some() || if_none_match.is_some() || if_range.is_some() || if_unmodified_since.is_some()
}

/// Build the full set of warp routes for the storage HTTP surface: the
/// WebSocket upgrade falls through (via `warp::reject::not_found`) to the
/// general dispatcher whenever the query doesn't name one of the three
/// WebSocket ops, so both share one path prefix without ambiguity.
pub fn routes<R, F, C>(
    state: Arc<AppState<R, F, C>>,
) -> impl Filter<Extract = (impl Reply,), Error = Infallible> + Clone
where
    R: StoragePathResolver + Send + Sync + 'static,
    F: FileSystem,
    C: PermissionChecker + 'static,
{
    let with_state = {
        let state = state.clone();
        warp::any().map(move || state.clone())
    };
    let with_state_ws = warp::any().map(move || state.clone());

    let prefix = warp::path("api").and(warp::path("v1")).and(warp::path("storage"));

    let ws_route = prefix
        .clone()
        .and(warp::path::tail())
        .and(warp::get())
        .and(warp::query::raw().or(warp::any().map(String::new)).unify())
        .and(warp::header::optional::<String>("authorization"))
        .and(warp::ws())
        .and(with_state_ws)
        .and_then(handle_ws_upgrade);

    let dispatch_route = prefix
        .and(warp::path::tail())
        .and(warp::method())
        .and(warp::query::raw().or(warp::any().map(String::new)).unify())
        .and(warp::header::optional::<String>("authorization"))
        .and(warp::header::optional::<String>("range"))
        .and(warp::header::optional::<String>("accept"))
        .and(warp::header::optional::<String>("content-range"))
        .and(warp::header::optional::<String>("content-type"))
        .and(warp::header::optional::<String>("if-match"))
        .and(warp::header::optional::<String>("if-none-match"))
        .and(warp::header::optional::<String>("if-range"))
        .and(warp::header::optional::<String>("if-unmodified-since"))
        .and(warp::body::bytes())
        .and(with_state)
        .and_then(handle);

    ws_route
        .or(dispatch_route)
        .unify()
        .recover(recover)
        .map(|reply| warp::reply::with_header(reply, "X-Service-Version", format!("platform-storage-api/{SERVICE_VERSION}")))
}

async fn handle_ws_upgrade<R, F, C>(
    tail: warp::path::Tail,
    query: String,
    auth_header: Option<String>,
    ws_upgrade: warp::ws::Ws,
    state: Arc<AppState<R, F, C>>,
) -> Result<Box<dyn Reply>, Rejection>
where
    R: StoragePathResolver + Send + Sync + 'static,
    F: FileSystem,
    C: PermissionChecker + 'static,
{
    let params = ops::parse_query(&query);
    let mode = match params.get("op").map(|op| op.to_uppercase()) {
        Some(ref op) if op == "WEBSOCKET" => WsMode::Tree,
        Some(ref op) if op == "WEBSOCKET_READ" => WsMode::LegacyReadOnly,
        Some(ref op) if op == "WEBSOCKET_WRITE" => WsMode::LegacyReadWrite,
        _ => return Err(warp::reject::not_found()),
    };

    let token = bearer_token(auth_header).map_err(GatewayError::into_rejection)?;
    let raw_path = format!("/{}", tail.as_str());
    let session_path = resolve_logical_path(&raw_path);

    let storage = state.storage.clone();
    let permissions = state.permissions.clone();
    let reply = ws_upgrade.on_upgrade(move |socket| async move {
        ws::serve(socket, session_path, mode, token, storage, permissions).await;
    });
    Ok(Box::new(reply))
}

#[allow(clippy::too_many_arguments)]
async fn handle<R, F, C>(
    tail: warp::path::Tail,
    method: warp::http::Method,
    query: String,
    auth_header: Option<String>,
    range_header: Option<String>,
    accept_header: Option<String>,
    content_range: Option<String>,
    content_type: Option<String>,
    if_match: Option<String>,
    if_none_match: Option<String>,
    if_range: Option<String>,
    if_unmodified_since: Option<String>,
    body: Bytes,
    state: Arc<AppState<R, F, C>>,
) -> Result<Box<dyn Reply>, Rejection>
where
    R: StoragePathResolver,
    F: FileSystem,
    C: PermissionChecker,
{
    let raw_path = format!("/{}", tail.as_str());
    let path = resolve_logical_path(&raw_path);
    let params = ops::parse_query(&query);

    let operation = ops::resolve_operation(&method, &params).map_err(GatewayError::into_rejection)?;
    let token = bearer_token(auth_header).map_err(GatewayError::into_rejection)?;

    let tree = if operation.needs_tree() {
        Some(
            state
                .permissions
                .tree_for(token.as_deref(), &path)
                .await
                .map_err(GatewayError::into_rejection)?,
        )
    } else {
        state
            .permissions
            .check(token.as_deref(), &path, operation.required_action())
            .await
            .map_err(GatewayError::into_rejection)?;
        None
    };

    // Streamed ndjson variants bypass `ops::dispatch`'s single-reply shape
    // entirely: the body is committed to the wire incrementally, and a
    // per-child failure is reported inline rather than as an HTTP status.
    if wants_ndjson(&accept_header) {
        match &operation {
            Operation::ListStatus => {
                let tree = tree.unwrap_or_default();
                let entries = state.storage.iterstatus(&path).await.map_err(GatewayError::into_rejection)?;
                let stream = ops::liststatus_ndjson_stream(entries, path.clone(), tree);
                return Ok(Box::new(ndjson_reply(stream)));
            }
            Operation::Delete { recursive: true } => {
                let results = state
                    .storage
                    .iterremove(&path, true)
                    .await
                    .map_err(GatewayError::into_rejection)?;
                let stream = ops::delete_ndjson_stream(results);
                return Ok(Box::new(ndjson_reply(stream)));
            }
            _ => {}
        }
    }

    let write_inputs = ops::WriteInputs {
        content_range,
        content_type,
        conditional_headers_present: has_conditional_headers(
            &if_match,
            &if_none_match,
            &if_range,
            &if_unmodified_since,
        ),
    };

    let reply = ops::dispatch(
        &state.storage,
        operation,
        &path,
        &params,
        range_header,
        write_inputs,
        tree,
        body,
    )
    .await
    .map_err(GatewayError::into_rejection)?;
    Ok(reply)
}

fn ndjson_reply(
    stream: impl futures::Stream<Item = std::result::Result<Bytes, std::io::Error>> + Send + 'static,
) -> impl Reply {
    let body = Body::wrap_stream(stream);
    warp::reply::with_header(
        warp::http::Response::new(body),
        "Content-Type",
        NDJSON,
    )
}

impl GatewayError {
    fn into_rejection(self) -> Rejection {
        warp::reject::custom(GatewayRejection(self))
    }
}

async fn recover(err: Rejection) -> Result<Box<dyn Reply>, Infallible> {
    if let Some(GatewayRejection(e)) = err.find() {
        let body = error_body(e);
        let reply: Box<dyn Reply> = match e {
            GatewayError::RangeNotSatisfiable { size } => Box::new(warp::reply::with_header(
                warp::reply::with_status(warp::reply::json(&body), e.status()),
                "Content-Range",
                format!("bytes */{size}"),
            )),
            GatewayError::Unauthorized(_) => Box::new(warp::reply::with_header(
                warp::reply::with_status(warp::reply::json(&body), e.status()),
                "WWW-Authenticate",
                www_authenticate_header("platform-storage-api"),
            )),
            _ => Box::new(warp::reply::with_status(warp::reply::json(&body), e.status())),
        };
        return Ok(reply);
    }
    if err.is_not_found() {
        return Ok(Box::new(warp::reply::with_status(
            warp::reply::json(&serde_json::json!({ "error": "not found" })),
            StatusCode::NOT_FOUND,
        )));
    }
    Ok(Box::new(warp::reply::with_status(
        warp::reply::json(&serde_json::json!({ "error": format!("{err:?}") })),
        StatusCode::BAD_REQUEST,
    )))
}
