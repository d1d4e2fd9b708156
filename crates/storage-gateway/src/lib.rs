//! Core of the storage gateway: path resolution, the permission cache,
//! filesystem orchestration, and the HTTP/WebSocket protocols built on top
//! of them.

pub mod action;
pub mod config;
pub mod error;
pub mod http;
pub mod path_resolver;
pub mod permissions;
pub mod storage;
pub mod ws;

pub use action::Action;
pub use config::Config;
pub use error::{GatewayError, Result};
