//! Shared Kubernetes utilities using kube-rs
//!
//! Naming, hashing, finalizer and status-patch helpers used by both
//! controllers. Everything here is a pure function over object metadata
//! so the controllers stay testable without a cluster.

use std::collections::BTreeMap;
use std::hash::{Hash, Hasher};

use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use serde::Serialize;

use crate::Error;

/// Field manager for every server-side apply and patch issued by the operator
pub const FIELD_MANAGER: &str = "aiop-controller";

/// Annotation whose value, when changed, forces a fresh reconcile
pub const RECONCILE_REQUEST_ANNOTATION: &str = "akamai.io/reconcile-request";

/// Maximum length of a Kubernetes object name that is also a DNS label
pub const MAX_NAME_LEN: usize = 63;

/// Compute a deterministic hash of the input string, returning a 16-char hex digest.
///
/// Uses truncated SHA-256 for stability across Rust toolchain versions.
/// `DefaultHasher` is NOT guaranteed stable across Rust releases, so this
/// function should be used whenever the hash is persisted (e.g., in status).
pub fn deterministic_hash(input: &str) -> String {
    use aws_lc_rs::digest;
    let hash = digest::digest(&digest::SHA256, input.as_bytes());
    hash.as_ref()[..8]
        .iter()
        .fold(String::with_capacity(16), |mut s, b| {
            use std::fmt::Write;
            let _ = write!(s, "{:02x}", b);
            s
        })
}

/// Hash of a spec plus the reconcile-request annotation
///
/// Two objects with the same spec and the same annotation value hash equal,
/// so bumping the annotation is enough to retry a Failed resource.
pub fn spec_hash<S: Serialize>(spec: &S, meta: &ObjectMeta) -> Result<String, Error> {
    let mut input = serde_json::to_string(spec)?;
    if let Some(request) = reconcile_request(meta) {
        input.push('\n');
        input.push_str(request);
    }
    Ok(deterministic_hash(&input))
}

/// Value of the reconcile-request annotation, if set
pub fn reconcile_request(meta: &ObjectMeta) -> Option<&str> {
    meta.annotations
        .as_ref()
        .and_then(|a| a.get(RECONCILE_REQUEST_ANNOTATION))
        .map(String::as_str)
}

/// Watch-event fingerprint covering what should trigger a reconcile
///
/// Status-only writes leave generation, deletion timestamp and annotations
/// untouched, so filtering on this value keeps status updates from looping
/// back into the controller.
pub fn reconcile_trigger(meta: &ObjectMeta) -> Option<u64> {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    meta.generation.hash(&mut hasher);
    meta.deletion_timestamp.is_some().hash(&mut hasher);
    reconcile_request(meta).hash(&mut hasher);
    meta.finalizers.hash(&mut hasher);
    Some(hasher.finish())
}

/// Deterministic DNS-label name built from `parts`
///
/// Parts are joined with `-` and lowercased. Names longer than 63 characters
/// are cut and suffixed with a hash of the full name so distinct inputs stay
/// distinct.
pub fn artifact_name(parts: &[&str]) -> String {
    let full = parts.join("-").to_lowercase();
    if full.len() <= MAX_NAME_LEN {
        return full;
    }
    let suffix = &deterministic_hash(&full)[..8];
    let keep = MAX_NAME_LEN - suffix.len() - 1;
    let prefix = full[..keep].trim_end_matches('-');
    format!("{prefix}-{suffix}")
}

/// Whether the object carries `finalizer`
pub fn has_finalizer(meta: &ObjectMeta, finalizer: &str) -> bool {
    meta.finalizers
        .as_ref()
        .is_some_and(|f| f.iter().any(|x| x == finalizer))
}

/// Finalizer list with `finalizer` appended (no duplicates)
pub fn finalizers_with(meta: &ObjectMeta, finalizer: &str) -> Vec<String> {
    let mut finalizers = meta.finalizers.clone().unwrap_or_default();
    if !finalizers.iter().any(|f| f == finalizer) {
        finalizers.push(finalizer.to_string());
    }
    finalizers
}

/// Finalizer list with `finalizer` removed
pub fn finalizers_without(meta: &ObjectMeta, finalizer: &str) -> Vec<String> {
    meta.finalizers
        .clone()
        .unwrap_or_default()
        .into_iter()
        .filter(|f| f != finalizer)
        .collect()
}

/// Merge patch replacing the finalizer list
///
/// Carries the resourceVersion read so a concurrent finalizer edit by
/// another controller fails with 409 instead of being overwritten.
pub fn finalizer_patch(finalizers: Vec<String>, resource_version: Option<&str>) -> serde_json::Value {
    let mut metadata = serde_json::json!({ "finalizers": finalizers });
    if let Some(rv) = resource_version {
        metadata["resourceVersion"] = serde_json::Value::from(rv);
    }
    serde_json::json!({ "metadata": metadata })
}

/// Merge patch for the status sub-resource with a resourceVersion precondition
pub fn status_patch<S: Serialize>(resource_version: &str, status: &S) -> serde_json::Value {
    serde_json::json!({
        "metadata": { "resourceVersion": resource_version },
        "status": status,
    })
}

/// Decode a Secret's data entries as UTF-8 strings
///
/// `stringData` is write-only on the API server, so only `data` is read.
/// Entries that are not valid UTF-8 are skipped.
pub fn secret_strings(secret: &Secret) -> BTreeMap<String, String> {
    secret
        .data
        .as_ref()
        .map(|data| {
            data.iter()
                .filter_map(|(k, v)| {
                    String::from_utf8(v.0.clone())
                        .ok()
                        .map(|s| (k.clone(), s))
                })
                .collect()
        })
        .unwrap_or_default()
}

/// Standard labels for objects created on behalf of a custom resource
pub fn managed_labels(name: &str, component: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (crate::LABEL_NAME.to_string(), name.to_string()),
        (crate::LABEL_COMPONENT.to_string(), component.to_string()),
        (
            crate::LABEL_MANAGED_BY.to_string(),
            crate::LABEL_MANAGED_BY_OPERATOR.to_string(),
        ),
    ])
}
