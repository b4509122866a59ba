use crate::controller::Syncer;
use crate::error::Result;
use crate::resources::{PENDING_TAGS_LABEL, Tag};
use crate::store::{SharedStore, json_patch};
use crate::syncer::{pin_containers, recorded_container_tags, remove_entry_op};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;
use tracing::{debug, info};

/// Pins pods the admission webhook had to let through before their Tag was
/// imported, then drops their pending label.
pub struct PodSyncer {
    pods: SharedStore<Pod>,
    tags: SharedStore<Tag>,
}

impl PodSyncer {
    pub fn new(pods: SharedStore<Pod>, tags: SharedStore<Tag>) -> Self {
        Self { pods, tags }
    }
}

pub fn is_pending(pod: &Pod) -> bool {
    pod.labels().contains_key(PENDING_TAGS_LABEL)
}

#[async_trait]
impl Syncer<Pod> for PodSyncer {
    async fn sync(&self, pod: Pod) -> Result<()> {
        if !is_pending(&pod) {
            return Ok(());
        }
        let namespace = pod.namespace().unwrap_or_default();
        let tags = self.tags.list(Some(&namespace), None).await?;
        let recorded = recorded_container_tags(pod.annotations());
        let pinning = match &pod.spec {
            Some(spec) => pin_containers("/spec", spec, &recorded, &tags),
            None => Default::default(),
        };
        if !pinning.pending.is_empty() {
            debug!(tags = ?pinning.pending, "Still waiting for tags to be imported");
            if pinning.operations.is_empty() {
                return Ok(());
            }
        }

        let mut operations = pinning.operations;
        if pinning.pending.is_empty() {
            operations.push(remove_entry_op("/metadata/labels", PENDING_TAGS_LABEL));
        }
        self.pods
            .patch_json(&namespace, &pod.name_any(), json_patch(operations)?)
            .await?;
        info!(
            complete = pinning.pending.is_empty(),
            "Pinned pending pod containers"
        );
        Ok(())
    }
}
