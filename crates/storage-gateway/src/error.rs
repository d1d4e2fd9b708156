//! Error taxonomy shared by the path resolver, permission cache, storage
//! service and HTTP/WebSocket dispatchers.
//!
//! Every fallible operation in this crate resolves to a [`GatewayError`].
//! The HTTP layer translates it to a status code and a JSON body of the form
//! `{"error": <string>, "errno": <POSIX name>?}`; the WebSocket layer
//! translates it to an `ERROR` frame with the same two fields.

use warp::http::StatusCode;

/// The kinds of failure the gateway surfaces to callers.
///
/// Identity-service "deny" decisions are deliberately folded into
/// [`GatewayError::NotFound`] to avoid leaking the existence of a sub-tree to
/// a caller who isn't allowed to see it.
#[derive(thiserror::Error, Debug)]
pub enum GatewayError {
    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    Exists(String),

    #[error("{0}")]
    IsDirectory(String),

    #[error("{0}")]
    NotDirectory(String),

    #[error("Range not satisfiable")]
    RangeNotSatisfiable { size: u64 },

    /// Admission-only: a label/URI mismatch. Never returned to storage API
    /// callers — see the module doc on why identity-service denials map to
    /// [`GatewayError::NotFound`] instead.
    #[error("{0}")]
    Forbidden(String),

    #[error("{0}")]
    Unauthorized(String),

    #[error("{0}")]
    Internal(String),
}

impl GatewayError {
    /// The POSIX errno symbol to attach to the wire response, if any.
    pub fn errno(&self) -> Option<&'static str> {
        match self {
            GatewayError::NotFound(_) => Some("ENOENT"),
            GatewayError::Exists(_) => Some("EEXIST"),
            GatewayError::IsDirectory(_) => Some("EISDIR"),
            GatewayError::NotDirectory(_) => Some("ENOTDIR"),
            _ => None,
        }
    }

    /// The HTTP status this error maps to.
    pub fn status(&self) -> StatusCode {
        match self {
            GatewayError::NotFound(_) => StatusCode::NOT_FOUND,
            GatewayError::BadRequest(_)
            | GatewayError::Exists(_)
            | GatewayError::IsDirectory(_)
            | GatewayError::NotDirectory(_) => StatusCode::BAD_REQUEST,
            GatewayError::RangeNotSatisfiable { .. } => StatusCode::RANGE_NOT_SATISFIABLE,
            GatewayError::Forbidden(_) => StatusCode::FORBIDDEN,
            GatewayError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            GatewayError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Translate a POSIX I/O error raised by the filesystem adapter into the
    /// gateway's taxonomy, attaching the symbolic errno the same way the
    /// original `errorcode[e.errno]` lookup does.
    pub fn from_io(err: std::io::Error) -> Self {
        use std::io::ErrorKind::*;
        match err.kind() {
            NotFound => GatewayError::NotFound(err.to_string()),
            AlreadyExists => GatewayError::Exists(err.to_string()),
            _ => match err.raw_os_error() {
                Some(21) => GatewayError::IsDirectory(err.to_string()), // EISDIR
                Some(20) => GatewayError::NotDirectory(err.to_string()), // ENOTDIR
                _ => GatewayError::Internal(err.to_string()),
            },
        }
    }
}

pub type Result<T> = std::result::Result<T, GatewayError>;

/// Wraps a [`GatewayError`] so it can travel through `warp`'s rejection
/// machinery, following the same "one middleware translates everything"
/// shape as the original's `handle_exceptions` middleware.
#[derive(Debug)]
pub struct Rejection(pub GatewayError);

impl warp::reject::Reject for Rejection {}

impl From<GatewayError> for warp::Rejection {
    fn from(err: GatewayError) -> Self {
        warp::reject::custom(Rejection(err))
    }
}

/// Build the JSON error body `{"error": ..., "errno": ...}` used by both the
/// HTTP dispatcher and the ndjson tail-error object.
pub fn error_body(err: &GatewayError) -> serde_json::Value {
    let mut body = serde_json::json!({ "error": err.to_string() });
    if let Some(errno) = err.errno() {
        body["errno"] = serde_json::Value::String(errno.to_string());
    }
    body
}

/// The `WWW-Authenticate` challenge attached to 401 responses, naming the
/// service the same way a browser-facing realm would.
pub fn www_authenticate_header(service_name: &str) -> String {
    format!("Bearer realm=\"{service_name}\"")
}
