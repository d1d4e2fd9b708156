//! Entry point for the `storage-api` binary: wires a [`Config`] read from the
//! process environment into a real [`LocalFileSystem`]-backed [`Storage`]
//! and an [`HttpPermissionChecker`], then serves `storage_gateway::http`
//! routes with `warp`. Grounded in krustlet's own `src/bin/*.rs` pattern of a
//! thin `main` that builds a provider/config and hands it to a shared
//! library entry point.

use std::net::IpAddr;
use std::sync::Arc;

use storage_gateway::config::{Config, StorageMode};
use storage_gateway::http::{self, AppState};
use storage_gateway::path_resolver::{MultipleStoragePathResolver, SingleStoragePathResolver, StoragePathResolver};
use storage_gateway::permissions::{HttpPermissionChecker, PermissionCache};
use storage_gateway::storage::{LocalFileSystem, Storage};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let config = Config::from_env()?;
    tracing::info!(port = config.server.port, "starting storage-api");

    let fs = LocalFileSystem::new();
    match config.storage.mode {
        StorageMode::Single => {
            let resolver = Arc::new(SingleStoragePathResolver::new(config.storage.fs_local_base_path.clone()));
            run(config, resolver, fs).await
        }
        StorageMode::Multiple => {
            let resolver = Arc::new(MultipleStoragePathResolver::new(
                LocalFileSystem::new(),
                config.storage.fs_local_base_path.clone(),
                config.storage.fs_local_base_path.clone(),
            ));
            run(config, resolver, fs).await
        }
    }
}

async fn run<R>(config: Config, resolver: Arc<R>, fs: LocalFileSystem) -> anyhow::Result<()>
where
    R: StoragePathResolver + Send + Sync + 'static,
{
    let storage = Arc::new(Storage::new(resolver, fs));

    let auth_url = config
        .platform
        .auth_url
        .clone()
        .ok_or_else(|| anyhow::anyhow!("NP_PLATFORM_AUTH_URL is required to serve storage-api"))?;
    let checker = HttpPermissionChecker::new(auth_url);
    let permissions = Arc::new(PermissionCache::new(
        checker,
        config.permission_expiration_interval,
        config.permission_forgetting_interval,
    ));

    let state = Arc::new(AppState { storage, permissions });
    let routes = http::routes(state);

    let host: IpAddr = config
        .server
        .host
        .parse()
        .map_err(|e| anyhow::anyhow!("invalid SERVER_HOST {:?}: {e}", config.server.host))?;

    warp::serve(routes).run((host, config.server.port)).await;
    Ok(())
}
