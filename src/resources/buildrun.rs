use kube::CustomResource;
use serde::{Deserialize, Serialize};

// Read-only view of a Shipwright BuildRun, limited to the fields needed to
// publish its output image into a Tag. The CRD itself is owned by Shipwright.
#[derive(CustomResource, Debug, Clone, Default, Deserialize, Serialize)]
#[kube(
    group = "shipwright.io",
    version = "v1beta1",
    kind = "BuildRun",
    plural = "buildruns",
    namespaced,
    status = "BuildRunStatus",
    schema = "disabled"
)]
#[serde(rename_all = "camelCase")]
pub struct BuildRunSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<BuildOutput>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildOutput {
    pub image: String,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildRunStatus {
    #[serde(default)]
    pub conditions: Vec<BuildRunCondition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<BuildRunOutput>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build_spec: Option<BuildSpecSnapshot>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildRunCondition {
    #[serde(rename = "type")]
    pub type_: String,
    pub status: String,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildRunOutput {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub digest: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildSpecSnapshot {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<BuildOutput>,
}

impl BuildRun {
    pub fn succeeded(&self) -> bool {
        self.status.as_ref().is_some_and(|s| {
            s.conditions
                .iter()
                .any(|c| c.type_ == "Succeeded" && c.status == "True")
        })
    }

    /// The pushed image, pinned to its digest when the build reported one.
    pub fn output_image(&self) -> Option<String> {
        let status = self.status.as_ref();
        let image = self
            .spec
            .output
            .as_ref()
            .or_else(|| status?.build_spec.as_ref()?.output.as_ref())
            .map(|o| o.image.clone())
            .filter(|i| !i.is_empty())?;
        let digest = status.and_then(|s| s.output.as_ref()?.digest.clone());
        Some(match digest {
            Some(digest) if !image.contains('@') => format!("{}@{}", image, digest),
            _ => image,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_output_image_from_status() {
        let run: BuildRun = serde_json::from_value(json!({
            "apiVersion": "shipwright.io/v1beta1",
            "kind": "BuildRun",
            "metadata": { "name": "build-1", "namespace": "team" },
            "spec": { "build": { "name": "app" } },
            "status": {
                "conditions": [{ "type": "Succeeded", "status": "True", "reason": "Succeeded" }],
                "output": { "digest": "sha256:0123" },
                "buildSpec": { "output": { "image": "quay.io/team/app:latest" } }
            }
        }))
        .unwrap();
        assert!(run.succeeded());
        assert_eq!(
            run.output_image().as_deref(),
            Some("quay.io/team/app:latest@sha256:0123")
        );
    }

    #[test]
    fn test_pending_buildrun() {
        let run: BuildRun = serde_json::from_value(json!({
            "apiVersion": "shipwright.io/v1beta1",
            "kind": "BuildRun",
            "metadata": { "name": "build-2" },
            "spec": { "output": { "image": "quay.io/team/app:v2" } },
            "status": { "conditions": [{ "type": "Succeeded", "status": "Unknown" }] }
        }))
        .unwrap();
        assert!(!run.succeeded());
        assert_eq!(run.output_image().as_deref(), Some("quay.io/team/app:v2"));
    }
}
