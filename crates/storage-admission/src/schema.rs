//! Wire types for the admission webhook: the `inject-storage` annotation
//! payload, the backend-specific volume specs a [`crate::volume_resolver`]
//! resolves to, and the `AdmissionReview` response envelope.
//!
//! Grounded in the original `admission_controller/schema.py` one-to-one:
//! `MountSchema` -> [`MountRequest`], `AdmissionReviewResponse` kept under
//! the same name and method shapes (`add_patch`, `allow`, `decline`).

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const SCHEMA_STORAGE: &str = "storage://";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MountMode {
    #[serde(rename = "r")]
    ReadOnly,
    #[serde(rename = "rw")]
    ReadWrite,
}

impl Default for MountMode {
    fn default() -> Self {
        MountMode::ReadWrite
    }
}

/// One entry of the `platform.apolo.us/inject-storage` annotation array.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct MountRequest {
    pub mount_path: String,
    pub storage_path: String,
    #[serde(default)]
    pub mount_mode: MountMode,
}

#[derive(Debug, thiserror::Error)]
pub enum MountRequestError {
    #[error("`{0}` is not an absolute path")]
    MountPathNotAbsolute(String),
    #[error("`{0}` does not follow the {SCHEMA_STORAGE} schema")]
    StoragePathMissingSchema(String),
    #[error("`{0}` is invalid. Cluster, org and project names must be present in the storage path")]
    StoragePathTooShort(String),
}

impl MountRequest {
    /// Mirrors `MountSchema`'s two `field_validator`s: the mount path must be
    /// absolute, and the storage path must be a `storage://` URI with at
    /// least cluster/org/project segments.
    pub fn validate(&self) -> Result<(), MountRequestError> {
        if !self.mount_path.starts_with('/') {
            return Err(MountRequestError::MountPathNotAbsolute(self.mount_path.clone()));
        }
        if !self.storage_path.starts_with(SCHEMA_STORAGE) {
            return Err(MountRequestError::StoragePathMissingSchema(self.storage_path.clone()));
        }
        let parts: Vec<&str> = self.storage_path[SCHEMA_STORAGE.len()..]
            .split('/')
            .filter(|s| !s.is_empty())
            .collect();
        if parts.len() < 3 {
            return Err(MountRequestError::StoragePathTooShort(self.storage_path.clone()));
        }
        Ok(())
    }

    /// `(cluster, org, project)` parsed from `storage://<cluster>/<org>/<project>/...`.
    pub fn cluster_org_project(&self) -> Option<(&str, &str, &str)> {
        let rest = self.storage_path.strip_prefix(SCHEMA_STORAGE)?;
        let mut parts = rest.split('/').filter(|s| !s.is_empty());
        let cluster = parts.next()?;
        let org = parts.next()?;
        let project = parts.next()?;
        Some((cluster, org, project))
    }
}

/// Parse and validate the full `inject-storage` annotation body.
pub fn parse_injection_spec(raw: &str) -> Result<Vec<MountRequest>, anyhow::Error> {
    let requests: Vec<MountRequest> = serde_json::from_str(raw)?;
    for req in &requests {
        req.validate()?;
    }
    Ok(requests)
}

/// Accumulates patch operations for one `AdmissionReview` response, then
/// renders either an `allow()` or `decline()` envelope. Named and shaped
/// after the original's `AdmissionReviewResponse` dataclass. Operations are
/// kept as a real `json_patch::Patch` (the same crate krustlet's `kube`
/// dependency pulls in for its own `Patch::Json` variant) rather than a
/// hand-rolled `Vec<Value>`, so a malformed path can never reach the wire
/// unnoticed — admission is purely additive per spec.md §8.8, so every
/// operation pushed here is an `add`.
pub struct AdmissionReviewResponse {
    pub uid: String,
    pub patch: json_patch::Patch,
}

impl AdmissionReviewResponse {
    pub fn new(uid: impl Into<String>) -> Self {
        Self {
            uid: uid.into(),
            patch: json_patch::Patch(Vec::new()),
        }
    }

    pub fn add_patch(&mut self, path: impl Into<String>, value: Value) {
        self.patch.0.push(json_patch::PatchOperation::Add(json_patch::AddOperation {
            path: path.into(),
            value,
        }));
    }

    pub fn allow(self) -> Value {
        let mut response = serde_json::json!({
            "uid": self.uid,
            "allowed": true,
        });
        if !self.patch.0.is_empty() {
            let dumped = serde_json::to_vec(&self.patch).expect("patch ops always serialize");
            let patch = base64::encode(dumped);
            response["patch"] = Value::String(patch);
            response["patchType"] = Value::String("JSONPatch".to_string());
        }
        admission_review_envelope(response)
    }

    pub fn decline(self, status_code: u16, message: impl Into<String>) -> Value {
        let response = serde_json::json!({
            "uid": self.uid,
            "allowed": false,
            "status": {
                "code": status_code,
                "message": message.into(),
            },
        });
        admission_review_envelope(response)
    }
}

fn admission_review_envelope(response: Value) -> Value {
    serde_json::json!({
        "apiVersion": "admission.k8s.io/v1",
        "kind": "AdmissionReview",
        "response": response,
    })
}
