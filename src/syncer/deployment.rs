use crate::controller::Syncer;
use crate::error::Result;
use crate::resources::{CONTAINER_TAGS_ANNOTATION, FOLLOW_TAGS_LABEL, Tag};
use crate::store::{SharedStore, json_patch};
use crate::syncer::{pin_containers, recorded_container_tags, set_entry_op};
use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use kube::ResourceExt;
use tracing::{debug, info};

/// Keeps the pod template of following Deployments on the pinned reference of
/// every Tag its containers refer to. Changing the template rolls the
/// Deployment out.
pub struct DeploymentSyncer {
    deployments: SharedStore<Deployment>,
    tags: SharedStore<Tag>,
}

impl DeploymentSyncer {
    pub fn new(deployments: SharedStore<Deployment>, tags: SharedStore<Tag>) -> Self {
        Self { deployments, tags }
    }
}

pub fn follows_tags(deployment: &Deployment) -> bool {
    deployment
        .labels()
        .get(FOLLOW_TAGS_LABEL)
        .is_some_and(|v| v == "true")
}

#[async_trait]
impl Syncer<Deployment> for DeploymentSyncer {
    async fn sync(&self, deployment: Deployment) -> Result<()> {
        if !follows_tags(&deployment) {
            return Ok(());
        }
        let Some(pod_spec) = deployment
            .spec
            .as_ref()
            .and_then(|s| s.template.spec.as_ref())
        else {
            return Ok(());
        };
        let namespace = deployment.namespace().unwrap_or_default();
        let tags = self.tags.list(Some(&namespace), None).await?;
        let recorded = recorded_container_tags(deployment.annotations());
        let pinning = pin_containers("/spec/template/spec", pod_spec, &recorded, &tags);

        let mut operations = pinning.operations;
        if pinning.container_tags != recorded {
            operations.push(set_entry_op(
                "/metadata/annotations",
                deployment.metadata.annotations.as_ref(),
                CONTAINER_TAGS_ANNOTATION,
                &serde_json::to_string(&pinning.container_tags)?,
            ));
        }
        if !pinning.pending.is_empty() {
            debug!(tags = ?pinning.pending, "Waiting for tags to be imported");
        }
        if operations.is_empty() {
            debug!("Deployment is up to date");
            return Ok(());
        }

        let changed = operations.len();
        self.deployments
            .patch_json(&namespace, &deployment.name_any(), json_patch(operations)?)
            .await?;
        info!(operations = changed, "Pinned deployment containers to tags");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;
    use crate::syncer::testing::{pod_spec, tag};
    use k8s_openapi::api::apps::v1::DeploymentSpec;
    use k8s_openapi::api::core::v1::PodTemplateSpec;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use std::collections::BTreeMap;
    use std::sync::Arc;

    fn deployment(name: &str, follow: bool, images: &[(&str, &str)]) -> Deployment {
        let labels = follow.then(|| {
            BTreeMap::from([(FOLLOW_TAGS_LABEL.to_string(), "true".to_string())])
        });
        Deployment {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("team".to_string()),
                labels,
                ..Default::default()
            },
            spec: Some(DeploymentSpec {
                template: PodTemplateSpec {
                    spec: Some(pod_spec(images)),
                    ..Default::default()
                },
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn container_image(deployment: &Deployment) -> String {
        deployment.spec.as_ref().unwrap().template.spec.as_ref().unwrap().containers[0]
            .image
            .clone()
            .unwrap()
    }

    #[tokio::test]
    async fn test_follows_tag_generations() {
        let tags = Arc::new(MemoryStore::with([tag(
            "app",
            0,
            &[(0, "quay.io/team/app@sha256:aa")],
        )]));
        let deployments = Arc::new(MemoryStore::with([deployment("web", true, &[("main", "app")])]));
        let syncer = DeploymentSyncer::new(deployments.clone(), tags.clone());

        syncer.sync(deployments.find("team", "web").unwrap()).await.unwrap();
        let pinned = deployments.find("team", "web").unwrap();
        assert_eq!(container_image(&pinned), "quay.io/team/app@sha256:aa");
        assert_eq!(
            pinned.annotations().get(CONTAINER_TAGS_ANNOTATION).unwrap(),
            r#"{"main":"app"}"#
        );

        // the tag moves to a new generation
        tags.insert(tag(
            "app",
            1,
            &[(1, "quay.io/team/app@sha256:bb"), (0, "quay.io/team/app@sha256:aa")],
        ));
        syncer.sync(pinned).await.unwrap();
        let repinned = deployments.find("team", "web").unwrap();
        assert_eq!(container_image(&repinned), "quay.io/team/app@sha256:bb");

        // up to date, no write
        let version = repinned.metadata.resource_version.clone();
        syncer.sync(repinned).await.unwrap();
        assert_eq!(
            deployments.find("team", "web").unwrap().metadata.resource_version,
            version
        );
    }

    #[tokio::test]
    async fn test_ignores_deployments_without_label() {
        let tags = Arc::new(MemoryStore::with([tag(
            "app",
            0,
            &[(0, "quay.io/team/app@sha256:aa")],
        )]));
        let deployments = Arc::new(MemoryStore::with([deployment("web", false, &[("main", "app")])]));
        let syncer = DeploymentSyncer::new(deployments.clone(), tags);
        syncer.sync(deployments.find("team", "web").unwrap()).await.unwrap();
        assert_eq!(container_image(&deployments.find("team", "web").unwrap()), "app");
    }
}
