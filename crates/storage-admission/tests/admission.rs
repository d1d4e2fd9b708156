//! End-to-end coverage of spec.md §8 scenarios 5 and 6: an admission review
//! for a pod requesting storage injection, evaluated against a resolver
//! whose mount map is seeded directly (no live cluster needed, see
//! `KubeVolumeResolver::with_mounts`).

use std::collections::HashMap;
use std::path::PathBuf;

use storage_admission::engine::admit;
use storage_admission::volume_resolver::{HostPathType, HostPathVolumeSpec, KubeVolume, KubeVolumeResolver};
use storage_gateway::path_resolver::SingleStoragePathResolver;

fn resolver() -> KubeVolumeResolver<SingleStoragePathResolver> {
    let mut mounts = HashMap::new();
    mounts.insert(
        PathBuf::from("/var/storage"),
        KubeVolume::HostPath(HostPathVolumeSpec {
            path: "/var/exports".into(),
            path_type: HostPathType::Empty,
        }),
    );
    KubeVolumeResolver::with_mounts(SingleStoragePathResolver::new("/var/storage"), mounts)
}

fn admission_review(labels: serde_json::Value, injection_spec: &str) -> serde_json::Value {
    serde_json::json!({
        "request": {
            "uid": "uid-1",
            "object": {
                "kind": "Pod",
                "metadata": {
                    "labels": labels,
                    "annotations": {
                        "platform.apolo.us/inject-storage": injection_spec,
                    },
                },
                "spec": {
                    "containers": [{ "name": "main" }],
                },
            },
        },
    })
}

#[tokio::test]
async fn admission_allow_adds_hostpath_volume_and_mount_patches() {
    let resolver = resolver();
    let spec = r#"[{"mount_path":"/m","storage_path":"storage://c/o/p","mount_mode":"rw"}]"#;
    let review = admission_review(serde_json::json!({ "platform.apolo.us/org": "o", "platform.apolo.us/project": "p" }), spec);

    let response = admit(&review, &resolver).await;
    let body = &response["response"];
    assert_eq!(body["allowed"], true);

    let patch_b64 = body["patch"].as_str().expect("patch present");
    let patch_bytes = base64::decode(patch_b64).unwrap();
    let patch: serde_json::Value = serde_json::from_slice(&patch_bytes).unwrap();
    let ops = patch.as_array().unwrap();

    let volume_op = ops
        .iter()
        .find(|op| op["path"] == "/spec/volumes/-")
        .expect("a volume patch op");
    assert_eq!(volume_op["op"], "add");
    assert_eq!(volume_op["value"]["hostPath"]["path"], "/var/exports/o/p");
    assert_eq!(volume_op["value"]["hostPath"]["type"], "");
    let volume_name = volume_op["value"]["name"].as_str().unwrap().to_string();

    let mount_op = ops
        .iter()
        .find(|op| op["path"] == "/spec/containers/0/volumeMounts/-")
        .expect("a mount patch op");
    assert_eq!(mount_op["value"]["mountPath"], "/m");
    assert_eq!(mount_op["value"]["name"], volume_name);
    assert!(mount_op["value"].get("readOnly").is_none());
}

#[tokio::test]
async fn admission_declines_with_403_on_org_label_mismatch() {
    let resolver = resolver();
    let spec = r#"[{"mount_path":"/m","storage_path":"storage://c/o/p","mount_mode":"rw"}]"#;
    let review = admission_review(serde_json::json!({ "platform.apolo.us/org": "x", "platform.apolo.us/project": "p" }), spec);

    let response = admit(&review, &resolver).await;
    let body = &response["response"];
    assert_eq!(body["allowed"], false);
    assert_eq!(body["status"]["code"], 403);
    assert_eq!(body["status"]["message"], "org mismatch: 'o'");
}

#[tokio::test]
async fn non_pod_requests_are_allowed_without_inspection() {
    let resolver = resolver();
    let review = serde_json::json!({
        "request": {
            "uid": "uid-2",
            "object": { "kind": "ConfigMap" },
        },
    });

    let response = admit(&review, &resolver).await;
    assert_eq!(response["response"]["allowed"], true);
    assert!(response["response"].get("patch").is_none());
}
