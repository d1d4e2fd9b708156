//! The `POST /mutate` HTTPS endpoint.
//!
//! Grounded in krustlet's `crates/kubelet/src/webserver/mod.rs`: a handful of
//! `warp` filters served with `warp::serve(routes).tls()`. Unlike krustlet,
//! the TLS material here isn't read from a file path but fetched from a
//! `kubernetes.io/tls` secret (spec.md §6), following the `Api::namespaced
//! (...).get(name)` shape krustlet's `secret/mod.rs` uses for image-pull
//! secrets.

use std::convert::Infallible;
use std::net::IpAddr;
use std::sync::Arc;

use k8s_openapi::api::core::v1::Secret;
use kube::api::Api;
use kube::Client;
use storage_gateway::path_resolver::StoragePathResolver;
use tracing::{info, instrument};
use warp::{Filter, Reply};

use crate::engine;
use crate::volume_resolver::KubeVolumeResolver;

#[derive(Debug, thiserror::Error)]
pub enum WebhookError {
    #[error("failed to fetch TLS secret {0}/{1}: {2}")]
    SecretLookup(String, String, #[source] kube::Error),
    #[error("TLS secret {0}/{1} is missing key {2}")]
    MissingSecretKey(String, String, &'static str),
}

/// The PEM-encoded serving certificate and private key, loaded once at
/// startup from a `kubernetes.io/tls` secret's base64 `data` fields.
pub struct TlsMaterial {
    pub cert_pem: Vec<u8>,
    pub key_pem: Vec<u8>,
}

#[instrument(level = "info", skip(client))]
pub async fn load_tls_material(
    client: Client,
    secret_namespace: &str,
    secret_name: &str,
) -> Result<TlsMaterial, WebhookError> {
    info!(namespace = %secret_namespace, name = %secret_name, "loading webhook TLS secret");
    let secrets: Api<Secret> = Api::namespaced(client, secret_namespace);
    let secret = secrets
        .get(secret_name)
        .await
        .map_err(|e| WebhookError::SecretLookup(secret_namespace.to_string(), secret_name.to_string(), e))?;

    let data = secret.data.unwrap_or_default();
    let cert = data
        .get("tls.crt")
        .ok_or_else(|| {
            WebhookError::MissingSecretKey(secret_namespace.to_string(), secret_name.to_string(), "tls.crt")
        })?
        .0
        .clone();
    let key = data
        .get("tls.key")
        .ok_or_else(|| {
            WebhookError::MissingSecretKey(secret_namespace.to_string(), secret_name.to_string(), "tls.key")
        })?
        .0
        .clone();

    Ok(TlsMaterial { cert_pem: cert, key_pem: key })
}

async fn handle_mutate<R>(
    body: serde_json::Value,
    resolver: Arc<KubeVolumeResolver<R>>,
) -> Result<Box<dyn Reply>, Infallible>
where
    R: StoragePathResolver,
{
    let response = engine::admit(&body, &resolver).await;
    Ok(Box::new(warp::reply::json(&response)))
}

fn routes<R>(
    resolver: Arc<KubeVolumeResolver<R>>,
) -> impl Filter<Extract = (impl Reply,), Error = Infallible> + Clone
where
    R: StoragePathResolver + Send + Sync + 'static,
{
    let with_resolver = warp::any().map(move || resolver.clone());
    let health = warp::get()
        .and(warp::path("healthz"))
        .map(|| Box::new("ok") as Box<dyn Reply>);
    let mutate = warp::post()
        .and(warp::path("mutate"))
        .and(warp::body::json())
        .and(with_resolver)
        .and_then(handle_mutate);
    health.or(mutate).unify()
}

/// Serve the webhook over HTTPS on `(host, port)` until the process exits.
pub async fn serve<R>(
    resolver: KubeVolumeResolver<R>,
    tls: TlsMaterial,
    host: IpAddr,
    port: u16,
) where
    R: StoragePathResolver + Send + Sync + 'static,
{
    let resolver = Arc::new(resolver);
    let routes = routes(resolver);
    warp::serve(routes)
        .tls()
        .cert(tls.cert_pem)
        .key(tls.key_pem)
        .run((host, port))
        .await;
}
