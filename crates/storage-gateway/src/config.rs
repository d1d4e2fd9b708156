//! Process configuration, read from environment variables.
//!
//! Loading configuration from the environment is treated as a thin external
//! concern by the rest of this crate — handlers and services only ever see
//! the typed [`Config`] — but the loader itself is kept here rather than
//! pushed out entirely, the same way krustlet keeps its own `Config` /
//! `Opts` pair in `crates/kubelet/src/config.rs` next to (not inside) the
//! server it configures. Variable names match the original Python service's
//! `EnvironConfigFactory` exactly, since they are part of the deployment
//! contract.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    Missing(&'static str),
    #[error("invalid value for environment variable {0}: {1}")]
    Invalid(&'static str, String),
}

type Result<T> = std::result::Result<T, ConfigError>;

/// `single` serves one physical tree; `multiple` probes a legacy base
/// alongside the primary one (see [`crate::path_resolver`]).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StorageMode {
    Single,
    Multiple,
}

impl std::str::FromStr for StorageMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "single" => Ok(StorageMode::Single),
            "multiple" => Ok(StorageMode::Multiple),
            other => Err(ConfigError::Invalid(
                "NP_STORAGE_MODE",
                other.to_string(),
            )),
        }
    }
}

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub keep_alive_timeout: Duration,
}

#[derive(Clone, Debug)]
pub struct StorageConfig {
    pub fs_local_base_path: PathBuf,
    pub fs_local_thread_pool_size: usize,
    pub mode: StorageMode,
}

#[derive(Clone, Debug)]
pub struct PlatformConfig {
    pub auth_url: Option<String>,
    pub admin_url: Option<String>,
    pub token: String,
    pub cluster_name: String,
}

#[derive(Clone, Debug)]
pub struct S3Config {
    pub region: String,
    pub bucket_name: String,
    pub key_prefix: String,
    pub endpoint_url: Option<String>,
}

/// Kubernetes access is optional: a single-node deployment with no admission
/// webhook never sets these.
#[derive(Clone, Debug)]
pub struct KubeConfig {
    pub cert_secret_name: String,
    pub cert_secret_namespace: String,
}

#[derive(Clone, Debug)]
pub struct Config {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub platform: PlatformConfig,
    pub s3: S3Config,
    pub kube: Option<KubeConfig>,
    pub permission_expiration_interval: Duration,
    pub permission_forgetting_interval: Duration,
}

fn env(name: &'static str) -> Result<String> {
    std::env::var(name).map_err(|_| ConfigError::Missing(name))
}

fn env_opt(name: &'static str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

/// `-` means "absent", matching the original `_get_url` helper.
fn env_url(name: &'static str) -> Result<Option<String>> {
    let value = env(name)?;
    Ok(if value == "-" { None } else { Some(value) })
}

fn env_parse<T: std::str::FromStr>(name: &'static str, default: T) -> Result<T> {
    match std::env::var(name) {
        Err(_) => Ok(default),
        Ok(v) => v
            .parse()
            .map_err(|_| ConfigError::Invalid(name, v)),
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let port = env_parse("NP_STORAGE_API_PORT", 8080u16)?;
        let keep_alive_timeout_s = env_parse("NP_STORAGE_API_KEEP_ALIVE_TIMEOUT", 75u64)?;
        let server = ServerConfig {
            host: env_opt("SERVER_HOST", "0.0.0.0"),
            port,
            keep_alive_timeout: Duration::from_secs(keep_alive_timeout_s),
        };

        let mode: StorageMode = env_parse("NP_STORAGE_MODE", StorageMode::Single)?;
        let storage = StorageConfig {
            fs_local_base_path: PathBuf::from(env("NP_STORAGE_LOCAL_BASE_PATH")?),
            fs_local_thread_pool_size: env_parse("NP_STORAGE_LOCAL_THREAD_POOL_SIZE", 100usize)?,
            mode,
        };

        let platform = PlatformConfig {
            auth_url: env_url("NP_PLATFORM_AUTH_URL")?,
            admin_url: env_url("NP_PLATFORM_ADMIN_URL")?,
            token: env("NP_PLATFORM_TOKEN")?,
            cluster_name: env("NP_PLATFORM_CLUSTER_NAME")?,
        };

        let s3 = S3Config {
            region: env_opt("S3_REGION", ""),
            bucket_name: env_opt("S3_BUCKET_NAME", ""),
            key_prefix: env_opt("S3_KEY_PREFIX", ""),
            endpoint_url: std::env::var("S3_ENDPOINT_URL").ok(),
        };

        let kube = match (
            std::env::var("NP_ADMISSION_CONTROLLER_CERT_SECRET_NAME"),
            std::env::var("NP_ADMISSION_CONTROLLER_CERT_SECRET_NAMESPACE"),
        ) {
            (Ok(cert_secret_name), Ok(cert_secret_namespace)) => Some(KubeConfig {
                cert_secret_name,
                cert_secret_namespace,
            }),
            _ => None,
        };

        let permission_expiration_interval =
            Duration::from_secs_f64(env_parse("NP_PERMISSION_EXPIRATION_INTERVAL", 0.0f64)?);
        let permission_forgetting_interval =
            Duration::from_secs_f64(env_parse("NP_PERMISSION_FORGETTING_INTERVAL", 0.0f64)?);

        Ok(Config {
            server,
            storage,
            platform,
            s3,
            kube,
            permission_expiration_interval,
            permission_forgetting_interval,
        })
    }
}
