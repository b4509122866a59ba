//! Admission webhooks: Tag generation validation and Pod image pinning.
//!
//! Every answer carries the UID of the request it answers. Bodies that are not
//! a readable AdmissionReview get an "invalid" review back instead of an HTTP
//! error, so the API server reports the decode error.

use crate::error::Result;
use crate::resources::Tag;
use crate::store::json_patch;
use crate::syncer::TagSyncer;
use k8s_openapi::api::core::v1::Pod;
use kube::core::DynamicObject;
use kube::core::admission::{AdmissionRequest, AdmissionResponse, AdmissionReview};
use serde::de::DeserializeOwned;
use tracing::{debug, info, warn};

pub type Review = AdmissionReview<DynamicObject>;

fn parse_request(body: &[u8]) -> std::result::Result<AdmissionRequest<DynamicObject>, String> {
    let review: Review = serde_json::from_slice(body).map_err(|e| e.to_string())?;
    let request: std::result::Result<AdmissionRequest<DynamicObject>, _> = review.try_into();
    request.map_err(|e| e.to_string())
}

fn decode<K: DeserializeOwned>(obj: &DynamicObject) -> Result<K> {
    Ok(serde_json::from_value(serde_json::to_value(obj)?)?)
}

/// Rejects writes of a generation that is neither 0, the next one, nor an
/// imported one.
pub fn validate_tag(body: &[u8]) -> Review {
    let request = match parse_request(body) {
        Ok(request) => request,
        Err(e) => {
            warn!(error = %e, "Malformed admission review");
            return AdmissionResponse::invalid(e).into_review();
        }
    };
    let response = AdmissionResponse::from(&request);
    if request.kind.kind != "Tag" {
        debug!(kind = %request.kind.kind, "Allowing unrelated kind");
        return response.into_review();
    }
    let Some(object) = &request.object else {
        return response.into_review();
    };

    let verdict = decode::<Tag>(object).and_then(|tag| tag.validate_generation());
    match verdict {
        Ok(()) => response.into_review(),
        Err(e) => {
            info!(name = %request.name, error = %e, "Denying tag write");
            response.deny(e.to_string()).into_review()
        }
    }
}

async fn pinning_patch(
    tags: &TagSyncer,
    namespace: &str,
    object: &DynamicObject,
) -> Result<Option<json_patch::Patch>> {
    let pod: Pod = decode(object)?;
    let operations = tags.patch_for_pod(namespace, &pod).await?;
    if operations.is_empty() {
        return Ok(None);
    }
    json_patch(operations).map(Some)
}

/// Rewrites container images naming a Tag to the Tag's pinned reference.
pub async fn mutate_pod(tags: &TagSyncer, body: &[u8]) -> Review {
    let request = match parse_request(body) {
        Ok(request) => request,
        Err(e) => {
            warn!(error = %e, "Malformed admission review");
            return AdmissionResponse::invalid(e).into_review();
        }
    };
    let response = AdmissionResponse::from(&request);
    if request.kind.kind != "Pod" {
        debug!(kind = %request.kind.kind, "Allowing unrelated kind");
        return response.into_review();
    }
    let Some(object) = &request.object else {
        return response.into_review();
    };

    let namespace = request
        .namespace
        .clone()
        .or_else(|| object.metadata.namespace.clone())
        .unwrap_or_default();
    match pinning_patch(tags, &namespace, object).await {
        Ok(None) => response.into_review(),
        Ok(Some(patch)) => {
            debug!(namespace = %namespace, "Pinning pod images");
            match response.with_patch(patch) {
                Ok(response) => response.into_review(),
                Err(e) => AdmissionResponse::from(&request)
                    .deny(e.to_string())
                    .into_review(),
            }
        }
        Err(e) => {
            warn!(namespace = %namespace, error = %e, "Unable to pin pod images");
            response.deny(e.to_string()).into_review()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::{CONTAINER_TAGS_ANNOTATION, ImageImport};
    use crate::store::memory::MemoryStore;
    use crate::syncer::testing::tag;
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use serde_json::{Value, json};
    use std::sync::Arc;

    fn review(kind: &str, object: Value) -> Vec<u8> {
        serde_json::to_vec(&json!({
            "apiVersion": "admission.k8s.io/v1",
            "kind": "AdmissionReview",
            "request": {
                "uid": "request-uid",
                "kind": {"group": "", "version": "v1", "kind": kind},
                "resource": {"group": "", "version": "v1", "resource": format!("{}s", kind.to_lowercase())},
                "name": "app",
                "namespace": "team",
                "operation": "CREATE",
                "userInfo": {},
                "object": object,
                "dryRun": false,
            }
        }))
        .unwrap()
    }

    fn response(review: &Review) -> Value {
        serde_json::to_value(review).unwrap()["response"].clone()
    }

    fn patch(response: &Value) -> Value {
        let bytes = match &response["patch"] {
            Value::String(encoded) => STANDARD.decode(encoded).unwrap(),
            other => serde_json::from_value::<Vec<u8>>(other.clone()).unwrap(),
        };
        serde_json::from_slice(&bytes).unwrap()
    }

    fn tag_object(generation: i64) -> Value {
        let mut tag = tag(
            "app",
            generation,
            &[(1, "quay.io/team/app@sha256:bb"), (0, "quay.io/team/app@sha256:aa")],
        );
        tag.metadata.uid = None;
        serde_json::to_value(tag).unwrap()
    }

    #[test]
    fn test_validate_tag_generations() {
        for allowed in [0, 1, 2] {
            let out = response(&validate_tag(&review("Tag", tag_object(allowed))));
            assert_eq!(out["uid"], "request-uid");
            assert_eq!(out["allowed"], true, "generation {allowed}");
        }
        let out = response(&validate_tag(&review("Tag", tag_object(5))));
        assert_eq!(out["uid"], "request-uid");
        assert_eq!(out["allowed"], false);
        let message = out["status"]["message"].as_str().unwrap();
        assert!(message.contains("invalid generation 5"), "{message}");
        assert!(message.contains("0, 2"), "{message}");
    }

    #[test]
    fn test_validate_allows_other_kinds() {
        let out = response(&validate_tag(&review("ConfigMap", json!({"metadata": {"name": "x"}}))));
        assert_eq!(out["allowed"], true);
    }

    #[test]
    fn test_malformed_body_is_invalid_review() {
        let out = response(&validate_tag(b"{not json"));
        assert_eq!(out["allowed"], false);
        assert!(out["status"]["message"].as_str().is_some());
    }

    fn syncer() -> TagSyncer {
        let tags = MemoryStore::with([
            tag("app", 0, &[(0, "quay.io/team/app@sha256:aa")]),
            tag("later", 0, &[]),
        ]);
        TagSyncer::new(Arc::new(tags), Arc::new(MemoryStore::<ImageImport>::new()))
    }

    fn pod(image: &str) -> Value {
        json!({
            "apiVersion": "v1",
            "kind": "Pod",
            "metadata": {"name": "web-1", "namespace": "team"},
            "spec": {"containers": [{"name": "main", "image": image}]},
        })
    }

    #[tokio::test]
    async fn test_mutate_pod_pins_image() {
        let out = response(&mutate_pod(&syncer(), &review("Pod", pod("app"))).await);
        assert_eq!(out["uid"], "request-uid");
        assert_eq!(out["allowed"], true);
        assert_eq!(out["patchType"], "JSONPatch");
        assert_eq!(
            patch(&out),
            json!([
                {"op": "replace", "path": "/spec/containers/0/image", "value": "quay.io/team/app@sha256:aa"},
                {"op": "add", "path": "/metadata/annotations", "value": {CONTAINER_TAGS_ANNOTATION: r#"{"main":"app"}"#}},
            ])
        );
    }

    #[tokio::test]
    async fn test_mutate_pod_without_tags_is_plain_allow() {
        let out = response(&mutate_pod(&syncer(), &review("Pod", pod("nginx:1.25"))).await);
        assert_eq!(out["allowed"], true);
        assert!(out.get("patch").is_none_or(Value::is_null));
    }

    #[tokio::test]
    async fn test_mutate_pod_marks_pending() {
        let out = response(&mutate_pod(&syncer(), &review("Pod", pod("later"))).await);
        assert_eq!(out["allowed"], true);
        assert_eq!(patch(&out)[1]["path"], "/metadata/labels");
    }

    #[tokio::test]
    async fn test_mutate_allows_other_kinds() {
        let out = response(&mutate_pod(&syncer(), &review("Service", json!({"metadata": {}}))).await);
        assert_eq!(out["allowed"], true);
    }
}
