//! Discovers the local mounts available to the webhook's own pod and
//! resolves logical storage paths onto them.
//!
//! Grounded in `original_source/.../admission_controller/volume_resolver.py`:
//! `KubeVolumeResolver.__aenter__` inspects its own pod via
//! `socket.gethostname()`, then `_refresh_internal_state` walks
//! `spec.volumes`, mapping `hostPath` volumes directly and `persistentVolumeClaim`
//! volumes through a PVC -> PV lookup (NFS backend only). The `kube::Api`
//! call shape (`Api::namespaced(...).get(name)`, `Api::all(...).get(name)`)
//! is the same one krustlet uses for PVC/PV lookups in
//! `crates/kubelet/src/volume/persistentvolumeclaim.rs`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use k8s_openapi::api::core::v1::{
    HostPathVolumeSource, NFSVolumeSource, PersistentVolume, PersistentVolumeClaim, Pod,
};
use kube::api::Api;
use kube::Client;
use serde::Serialize;
use storage_gateway::path_resolver::StoragePathResolver;
use tracing::{info, instrument};

#[derive(Debug, thiserror::Error)]
pub enum VolumeResolverError {
    #[error("failed to look up self pod: {0}")]
    SelfPodLookup(#[source] kube::Error),
    #[error("no eligible volumes are mounted to this pod")]
    NoEligibleVolumes,
    #[error("unable to resolve a volume for a provided path")]
    NotResolvable,
    #[error(transparent)]
    Kube(#[from] kube::Error),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum HostPathType {
    #[serde(rename = "")]
    Empty,
    DirectoryOrCreate,
    Directory,
    FileOrCreate,
    File,
    Socket,
    CharDevice,
    BlockDevice,
}

impl From<Option<String>> for HostPathType {
    fn from(raw: Option<String>) -> Self {
        match raw.as_deref() {
            None | Some("") => HostPathType::Empty,
            Some("DirectoryOrCreate") => HostPathType::DirectoryOrCreate,
            Some("Directory") => HostPathType::Directory,
            Some("FileOrCreate") => HostPathType::FileOrCreate,
            Some("File") => HostPathType::File,
            Some("Socket") => HostPathType::Socket,
            Some("CharDevice") => HostPathType::CharDevice,
            Some("BlockDevice") => HostPathType::BlockDevice,
            Some(_) => HostPathType::Empty,
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct HostPathVolumeSpec {
    pub path: String,
    #[serde(rename = "type")]
    pub path_type: HostPathType,
}

impl From<&HostPathVolumeSource> for HostPathVolumeSpec {
    fn from(src: &HostPathVolumeSource) -> Self {
        Self {
            path: src.path.clone(),
            path_type: src.type_.clone().into(),
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct NfsVolumeSpec {
    pub server: String,
    pub path: String,
}

impl From<&NFSVolumeSource> for NfsVolumeSpec {
    fn from(src: &NFSVolumeSource) -> Self {
        Self {
            server: src.server.clone(),
            path: src.path.clone(),
        }
    }
}

/// A resolved volume: the backend-specific spec plus the key it is emitted
/// under in a Kubernetes volume object (`hostPath` or `nfs`).
#[derive(Clone, Debug)]
pub enum KubeVolume {
    HostPath(HostPathVolumeSpec),
    Nfs(NfsVolumeSpec),
}

impl KubeVolume {
    /// Renders `{hostPath: {...}}` or `{nfs: {...}}` with `sub_path`
    /// appended onto the backend's base path — the tenant's own directory
    /// under the pod's shared mount — ready to be merged with a generated
    /// `name` field into a `/spec/volumes/-` patch value. An empty
    /// `sub_path` leaves the base path unchanged.
    pub fn to_kube_under(&self, sub_path: &Path) -> serde_json::Value {
        match self {
            KubeVolume::HostPath(spec) => serde_json::json!({
                "hostPath": {
                    "path": join_sub_path(&spec.path, sub_path),
                    "type": spec.path_type,
                }
            }),
            KubeVolume::Nfs(spec) => serde_json::json!({
                "nfs": {
                    "server": spec.server,
                    "path": join_sub_path(&spec.path, sub_path),
                }
            }),
        }
    }
}

fn join_sub_path(base: &str, sub_path: &Path) -> String {
    if sub_path.as_os_str().is_empty() {
        base.to_string()
    } else {
        format!("{}/{}", base.trim_end_matches('/'), sub_path.display())
    }
}

#[derive(Clone, Debug)]
pub struct KubeVolumeMount {
    pub volume: KubeVolume,
    pub sub_path: PathBuf,
}

/// Built once at startup from the webhook's own pod and never mutated
/// afterward (spec.md §5: "the volume-resolver's mount map ... requiring no
/// lock").
pub struct KubeVolumeResolver<R: StoragePathResolver> {
    path_resolver: R,
    mounts: HashMap<PathBuf, KubeVolume>,
}

impl<R: StoragePathResolver> KubeVolumeResolver<R> {
    /// Build a resolver directly from an already-known mount map, bypassing
    /// the Kubernetes API lookup `discover` performs. Exists so tests (and
    /// any future non-Kubernetes deployment) can construct a resolver
    /// without a live cluster.
    pub fn with_mounts(path_resolver: R, mounts: HashMap<PathBuf, KubeVolume>) -> Self {
        Self { path_resolver, mounts }
    }

    /// Inspect `client`'s own pod (identified by `pod_name`, ordinarily the
    /// container's hostname) and build the local-mount-prefix -> volume map.
    /// Fails if the pod has no eligible hostPath/NFS mounts at all.
    #[instrument(level = "info", skip(client, path_resolver))]
    pub async fn discover(
        client: Client,
        namespace: &str,
        pod_name: &str,
        path_resolver: R,
    ) -> Result<Self, VolumeResolverError> {
        info!(%pod_name, "initializing volume resolver");
        let pods: Api<Pod> = Api::namespaced(client.clone(), namespace);
        let pod = pods.get(pod_name).await.map_err(VolumeResolverError::SelfPodLookup)?;
        let mounts = refresh_internal_state(client, namespace, &pod).await?;
        if mounts.is_empty() {
            return Err(VolumeResolverError::NoEligibleVolumes);
        }
        Ok(Self { path_resolver, mounts })
    }

    async fn to_local_path(&self, storage_path: &Path) -> PathBuf {
        self.path_resolver.resolve_path(storage_path).await
    }

    /// Resolve a logical storage path to a `{volume, sub_path}` pair, ready
    /// to be merged into a generated volume name for a patch.
    pub async fn resolve_volume_mount(&self, storage_path: &Path) -> Result<KubeVolumeMount, VolumeResolverError> {
        let local_path = self.to_local_path(storage_path).await;
        for (prefix, volume) in &self.mounts {
            if let Ok(sub_path) = local_path.strip_prefix(prefix) {
                return Ok(KubeVolumeMount {
                    volume: volume.clone(),
                    sub_path: sub_path.to_path_buf(),
                });
            }
        }
        Err(VolumeResolverError::NotResolvable)
    }
}

async fn refresh_internal_state(
    client: Client,
    namespace: &str,
    pod: &Pod,
) -> Result<HashMap<PathBuf, KubeVolume>, VolumeResolverError> {
    info!("refreshing internal state");
    let mut mounts = HashMap::new();
    let spec = match &pod.spec {
        Some(spec) => spec,
        None => return Ok(mounts),
    };
    let containers = &spec.containers;

    for volume in spec.volumes.iter().flatten() {
        if let Some(host_path) = &volume.host_path {
            mount_paths_for(&volume.name, containers).into_iter().for_each(|mount_path| {
                mounts.insert(mount_path, KubeVolume::HostPath(host_path.into()));
            });
        } else if let Some(pvc) = &volume.persistent_volume_claim {
            let mount_paths = mount_paths_for(&volume.name, containers);
            if mount_paths.is_empty() {
                continue;
            }
            match resolve_pvc_nfs(client.clone(), namespace, &pvc.claim_name).await? {
                Some(nfs_spec) => {
                    for mount_path in mount_paths {
                        mounts.insert(mount_path, KubeVolume::Nfs(nfs_spec.clone()));
                    }
                }
                None => {
                    info!(volume = %volume.name, "storage doesn't define supported volume backends");
                }
            }
        } else {
            info!(volume = %volume.name, "volume is unsupported");
        }
    }

    Ok(mounts)
}

fn mount_paths_for(volume_name: &str, containers: &[k8s_openapi::api::core::v1::Container]) -> Vec<PathBuf> {
    containers
        .iter()
        .flat_map(|c| c.volume_mounts.iter().flatten())
        .filter(|vm| vm.name == volume_name)
        .map(|vm| PathBuf::from(&vm.mount_path))
        .collect()
}

async fn resolve_pvc_nfs(
    client: Client,
    namespace: &str,
    claim_name: &str,
) -> Result<Option<NfsVolumeSpec>, VolumeResolverError> {
    let pvcs: Api<PersistentVolumeClaim> = Api::namespaced(client.clone(), namespace);
    let claim = pvcs.get(claim_name).await?;
    let volume_name = claim
        .spec
        .as_ref()
        .and_then(|s| s.volume_name.as_ref())
        .ok_or(VolumeResolverError::NotResolvable)?;

    let pvs: Api<PersistentVolume> = Api::all(client);
    let pv = pvs.get(volume_name).await?;
    Ok(pv.spec.as_ref().and_then(|s| s.nfs.as_ref()).map(NfsVolumeSpec::from))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn host_path_type_defaults_to_empty() {
        assert_eq!(HostPathType::from(None), HostPathType::Empty);
        assert_eq!(HostPathType::from(Some("".to_string())), HostPathType::Empty);
    }

    #[test]
    fn host_path_type_parses_known_variants() {
        assert_eq!(
            HostPathType::from(Some("Directory".to_string())),
            HostPathType::Directory
        );
    }

    #[test]
    fn to_kube_under_appends_sub_path_onto_the_base_path() {
        let volume = KubeVolume::HostPath(HostPathVolumeSpec {
            path: "/var/exports".into(),
            path_type: HostPathType::Empty,
        });
        let rendered = volume.to_kube_under(Path::new("o/p"));
        assert_eq!(rendered["hostPath"]["path"], "/var/exports/o/p");
        assert_eq!(rendered["hostPath"]["type"], "");
    }

    #[test]
    fn to_kube_under_with_empty_sub_path_leaves_base_path_unchanged() {
        let volume = KubeVolume::Nfs(NfsVolumeSpec {
            server: "0.0.0.0".into(),
            path: "/exports/nfs".into(),
        });
        let rendered = volume.to_kube_under(Path::new(""));
        assert_eq!(rendered["nfs"]["path"], "/exports/nfs");
    }
}
