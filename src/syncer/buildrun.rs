use crate::controller::Syncer;
use crate::error::Result;
use crate::resources::{BUILDRUN_PROCESSED_ANNOTATION, BUILDRUN_TAG_ANNOTATION, BuildRun, Tag};
use crate::store::{SharedStore, json_patch};
use crate::syncer::set_entry_op;
use crate::syncer::tag::request_generation;
use async_trait::async_trait;
use chrono::Utc;
use kube::ResourceExt;
use tracing::{debug, info, warn};

/// Publishes the output image of a succeeded BuildRun as a new generation of
/// the Tag named in its annotation.
pub struct BuildRunSyncer {
    buildruns: SharedStore<BuildRun>,
    tags: SharedStore<Tag>,
}

impl BuildRunSyncer {
    pub fn new(buildruns: SharedStore<BuildRun>, tags: SharedStore<Tag>) -> Self {
        Self { buildruns, tags }
    }

    async fn mark_processed(&self, namespace: &str, buildrun: &BuildRun) -> Result<()> {
        let patch = json_patch(vec![set_entry_op(
            "/metadata/annotations",
            buildrun.metadata.annotations.as_ref(),
            BUILDRUN_PROCESSED_ANNOTATION,
            &Utc::now().to_rfc3339(),
        )])?;
        self.buildruns
            .patch_json(namespace, &buildrun.name_any(), patch)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl Syncer<BuildRun> for BuildRunSyncer {
    async fn sync(&self, buildrun: BuildRun) -> Result<()> {
        let Some(tag_name) = buildrun.annotations().get(BUILDRUN_TAG_ANNOTATION).cloned() else {
            return Ok(());
        };
        if buildrun
            .annotations()
            .contains_key(BUILDRUN_PROCESSED_ANNOTATION)
        {
            debug!("BuildRun already processed");
            return Ok(());
        }
        if !buildrun.succeeded() {
            debug!("BuildRun has not succeeded yet");
            return Ok(());
        }
        let namespace = buildrun.namespace().unwrap_or_default();

        match buildrun.output_image() {
            Some(image) => {
                let tag =
                    request_generation(self.tags.as_ref(), &namespace, &tag_name, Some(&image))
                        .await?;
                info!(
                    tag = %tag_name,
                    image = %image,
                    generation = tag.spec.generation,
                    "Published build output"
                );
            }
            None => warn!(tag = %tag_name, "Succeeded BuildRun has no output image"),
        }
        self.mark_processed(&namespace, &buildrun).await
    }
}
