//! The nine-step mutating-admission algorithm: decide whether a `Pod`
//! creation request should be mutated to mount storage, and if so build the
//! `JSONPatch` that does it.
//!
//! Grounded in `original_source/.../admission_controller/api.py`
//! (`AdmissionControllerApi.handle_post_mutate` / `_handle_injection`), with
//! one addition absent from that source and added fresh per spec.md §4.G
//! step 6: the org/project label-vs-URI mismatch check.

use std::path::Path;

use serde_json::Value;
use storage_gateway::path_resolver::StoragePathResolver;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::schema::{parse_injection_spec, AdmissionReviewResponse, MountMode, MountRequest};
use crate::volume_resolver::{KubeVolumeResolver, VolumeResolverError};

pub const ANNOTATION_APOLO_INJECT_STORAGE: &str = "platform.apolo.us/inject-storage";
pub const LABEL_APOLO_ORG_NAME: &str = "platform.apolo.us/org";
pub const LABEL_APOLO_PROJECT_NAME: &str = "platform.apolo.us/project";
const INJECTED_VOLUME_NAME_PREFIX: &str = "storage-auto-injected-volume";

fn create_injection_volume_name() -> String {
    let id = Uuid::new_v4().to_string();
    format!("{INJECTED_VOLUME_NAME_PREFIX}-{}", &id[..8])
}

/// Evaluate one `AdmissionReview` request and produce the `{apiVersion,
/// kind, response}` envelope to send back. Never returns an `Err` — every
/// failure mode in spec.md §4.G is a `decline()`, not a webhook-level error.
#[instrument(level = "info", skip(admission_review_request, resolver))]
pub async fn admit<R: StoragePathResolver>(
    admission_review_request: &Value,
    resolver: &KubeVolumeResolver<R>,
) -> Value {
    let uid = admission_review_request["request"]["uid"]
        .as_str()
        .unwrap_or_default()
        .to_string();
    let review = AdmissionReviewResponse::new(uid);

    let pod = &admission_review_request["request"]["object"];
    if pod["kind"].as_str() != Some("Pod") {
        info!("not a pod creation request, skipping mutation");
        return review.allow();
    }

    let metadata = &pod["metadata"];
    let annotations = &metadata["annotations"];
    let raw_injection_spec = match annotations.get(ANNOTATION_APOLO_INJECT_STORAGE).and_then(Value::as_str) {
        Some(raw) => raw,
        None => {
            info!("pod does not request storage injection");
            return review.allow();
        }
    };

    let pod_spec = &pod["spec"];
    let containers = pod_spec["containers"].as_array().cloned().unwrap_or_default();
    if containers.is_empty() {
        info!("pod defines no containers");
        return review.allow();
    }

    handle_injection(pod_spec, &containers, raw_injection_spec, metadata, review, resolver).await
}

async fn handle_injection<R: StoragePathResolver>(
    pod_spec: &Value,
    containers: &[Value],
    raw_injection_spec: &str,
    metadata: &Value,
    mut review: AdmissionReviewResponse,
    resolver: &KubeVolumeResolver<R>,
) -> Value {
    let injection_spec = match parse_injection_spec(raw_injection_spec) {
        Ok(spec) => spec,
        Err(e) => {
            warn!(error = %e, "injection spec is invalid");
            return review.decline(422, "injection spec is invalid");
        }
    };

    let labels = &metadata["labels"];
    let org = match labels.get(LABEL_APOLO_ORG_NAME).and_then(Value::as_str) {
        Some(v) => v,
        None => return review.decline(422, format!("Missing label {LABEL_APOLO_ORG_NAME}")),
    };
    let project = match labels.get(LABEL_APOLO_PROJECT_NAME).and_then(Value::as_str) {
        Some(v) => v,
        None => return review.decline(422, format!("Missing label {LABEL_APOLO_PROJECT_NAME}")),
    };

    for request in &injection_spec {
        if let Err(decline) = check_label_matches_uri(request, org, project) {
            return review.decline(decline.0, decline.1);
        }
    }

    if pod_spec.get("volumes").is_none() {
        review.add_patch("/spec/volumes", Value::Array(Vec::new()));
    }
    for (idx, container) in containers.iter().enumerate() {
        if container.get("volumeMounts").is_none() {
            review.add_patch(format!("/spec/containers/{idx}/volumeMounts"), Value::Array(Vec::new()));
        }
    }

    for request in &injection_spec {
        let mount = match resolver.resolve_volume_mount(Path::new(&strip_storage_path(request))).await {
            Ok(mount) => mount,
            Err(VolumeResolverError::NotResolvable) => {
                warn!(storage_path = %request.storage_path, "unable to resolve a volume");
                return review.decline(400, "Unable to resolve a volume for a provided path");
            }
            Err(e) => {
                warn!(error = %e, "volume resolution failed");
                return review.decline(400, "Unable to resolve a volume for a provided path");
            }
        };

        let volume_name = create_injection_volume_name();
        let mut volume_value = mount.volume.to_kube_under(&mount.sub_path);
        volume_value["name"] = Value::String(volume_name.clone());
        review.add_patch("/spec/volumes/-", volume_value);

        for container_idx in 0..containers.len() {
            let mut mount_value = serde_json::json!({
                "name": volume_name,
                "mountPath": request.mount_path,
            });
            if request.mount_mode == MountMode::ReadOnly {
                mount_value["readOnly"] = Value::Bool(true);
            }
            review.add_patch(format!("/spec/containers/{container_idx}/volumeMounts/-"), mount_value);
        }
    }

    review.allow()
}

/// The path-beyond-cluster/org/project suffix of a `storage://` URI, i.e.
/// what `resolve_volume_mount` should treat as the logical storage path.
fn strip_storage_path(request: &MountRequest) -> String {
    match request.cluster_org_project() {
        Some((cluster, org, project)) => {
            let prefix = format!("{}{cluster}/{org}/{project}", crate::schema::SCHEMA_STORAGE);
            request
                .storage_path
                .strip_prefix(&prefix)
                .map(|rest| format!("/{org}/{project}{rest}"))
                .unwrap_or_else(|| format!("/{org}/{project}"))
        }
        None => request.storage_path.clone(),
    }
}

/// spec.md §4.G step 6: a pod labeled `(org, project)` may only mount its
/// own sub-tree. Absent from the original Python source; added fresh here.
fn check_label_matches_uri(request: &MountRequest, org: &str, project: &str) -> Result<(), (u16, String)> {
    let (_, uri_org, uri_project) = request
        .cluster_org_project()
        .ok_or_else(|| (422, format!("`{}` is invalid", request.storage_path)))?;
    if uri_org != org {
        return Err((403, format!("org mismatch: '{uri_org}'")));
    }
    if uri_project != project {
        return Err((403, format!("project mismatch: '{uri_project}'")));
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn create_injection_volume_name_has_expected_prefix_and_length() {
        let name = create_injection_volume_name();
        assert!(name.starts_with(INJECTED_VOLUME_NAME_PREFIX));
        let suffix = name.strip_prefix(&format!("{INJECTED_VOLUME_NAME_PREFIX}-")).unwrap();
        assert_eq!(suffix.len(), 8);
    }

    #[test]
    fn label_matching_uri_org_and_project_passes() {
        let request = MountRequest {
            mount_path: "/m".into(),
            storage_path: "storage://c/o/p".into(),
            mount_mode: MountMode::ReadWrite,
        };
        assert!(check_label_matches_uri(&request, "o", "p").is_ok());
    }

    #[test]
    fn mismatched_org_label_is_rejected_with_403() {
        let request = MountRequest {
            mount_path: "/m".into(),
            storage_path: "storage://c/o/p".into(),
            mount_mode: MountMode::ReadWrite,
        };
        let err = check_label_matches_uri(&request, "x", "p").unwrap_err();
        assert_eq!(err, (403, "org mismatch: 'o'".to_string()));
    }

    #[test]
    fn mismatched_project_label_is_rejected_with_403() {
        let request = MountRequest {
            mount_path: "/m".into(),
            storage_path: "storage://c/o/p".into(),
            mount_mode: MountMode::ReadWrite,
        };
        let err = check_label_matches_uri(&request, "o", "x").unwrap_err();
        assert_eq!(err, (403, "project mismatch: 'p'".to_string()));
    }

    #[test]
    fn strip_storage_path_keeps_org_project_and_remainder() {
        let request = MountRequest {
            mount_path: "/m".into(),
            storage_path: "storage://c/o/p/sub/dir".into(),
            mount_mode: MountMode::ReadWrite,
        };
        assert_eq!(strip_storage_path(&request), "/o/p/sub/dir");
    }
}
