//! Entry point for the `storage-admission-webhook` binary: discovers this
//! pod's own volume mounts via the Kubernetes API, loads its serving
//! certificate from a `kubernetes.io/tls` secret, and serves the
//! `POST /mutate` endpoint. Grounded in krustlet's `bootstrapping.rs`
//! pattern of inferring a `kube::Client` from in-cluster config before doing
//! anything else.

use std::net::IpAddr;

use storage_admission::volume_resolver::KubeVolumeResolver;
use storage_admission::webhook;
use storage_gateway::config::{Config, StorageMode};
use storage_gateway::path_resolver::{MultipleStoragePathResolver, SingleStoragePathResolver, StoragePathResolver};
use storage_gateway::storage::LocalFileSystem;

fn env_opt(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let config = Config::from_env()?;
    let kube_config = config
        .kube
        .clone()
        .ok_or_else(|| anyhow::anyhow!("NP_ADMISSION_CONTROLLER_CERT_SECRET_NAME/_NAMESPACE are required"))?;

    let namespace = env_opt("POD_NAMESPACE", "default");
    let pod_name = hostname::get()?
        .into_string()
        .map_err(|_| anyhow::anyhow!("pod hostname is not valid UTF-8"))?;
    let port: u16 = env_opt("NP_ADMISSION_CONTROLLER_PORT", "8443").parse()?;
    let host: IpAddr = env_opt("SERVER_HOST", "0.0.0.0").parse()?;

    let kube_conf = kube::Config::infer().await?;
    let client = kube::Client::try_from(kube_conf)?;

    tracing::info!(%pod_name, %namespace, "discovering self-pod volume mounts");

    match config.storage.mode {
        StorageMode::Single => {
            let resolver = SingleStoragePathResolver::new(config.storage.fs_local_base_path.clone());
            run(client, kube_config, namespace, pod_name, host, port, resolver).await
        }
        StorageMode::Multiple => {
            let resolver = MultipleStoragePathResolver::new(
                LocalFileSystem::new(),
                config.storage.fs_local_base_path.clone(),
                config.storage.fs_local_base_path.clone(),
            );
            run(client, kube_config, namespace, pod_name, host, port, resolver).await
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn run<R>(
    client: kube::Client,
    kube_config: storage_gateway::config::KubeConfig,
    namespace: String,
    pod_name: String,
    host: IpAddr,
    port: u16,
    resolver: R,
) -> anyhow::Result<()>
where
    R: StoragePathResolver + Send + Sync + 'static,
{
    let tls = webhook::load_tls_material(client.clone(), &kube_config.cert_secret_namespace, &kube_config.cert_secret_name)
        .await?;

    let volume_resolver = KubeVolumeResolver::discover(client, &namespace, &pod_name, resolver).await?;

    tracing::info!(%port, "serving admission webhook");
    webhook::serve(volume_resolver, tls, host, port).await;
    Ok(())
}
