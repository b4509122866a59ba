use crate::controller::Syncer;
use crate::error::{Error, Result};
use crate::resources::{
    CONSUMED_ANNOTATION, CONTAINER_TAGS_ANNOTATION, ImageImport, PENDING_TAGS_LABEL, TAG_LABEL,
    Tag, TagSpec,
};
use crate::store::{ObjectStore, SharedStore, json_patch};
use crate::syncer::{pin_containers, recorded_container_tags, set_entry_op};
use async_trait::async_trait;
use chrono::Utc;
use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;
use serde_json::Value;
use tracing::{debug, info};

/// Turns requested Tag generations into ImageImports and folds finished
/// imports back into the Tag's history.
pub struct TagSyncer {
    tags: SharedStore<Tag>,
    imports: SharedStore<ImageImport>,
}

impl TagSyncer {
    pub fn new(tags: SharedStore<Tag>, imports: SharedStore<ImageImport>) -> Self {
        Self { tags, imports }
    }

    async fn owned_imports(&self, tag: &Tag, namespace: &str) -> Result<Vec<ImageImport>> {
        let selector = format!("{}={}", TAG_LABEL, tag.name_any());
        Ok(self
            .imports
            .list(Some(namespace), Some(&selector))
            .await?
            .into_iter()
            .filter(|import| import.is_owned_by(tag))
            .collect())
    }

    /// Folds every finished, unconsumed import into `tag` and flags the imports
    /// consumed. Returns the updated Tag.
    async fn fold_finished_imports(
        &self,
        mut tag: Tag,
        namespace: &str,
        imports: &[ImageImport],
    ) -> Result<Tag> {
        let mut finished: Vec<&ImageImport> = imports
            .iter()
            .filter(|i| i.already_imported() && !i.is_consumed())
            .collect();
        if finished.is_empty() {
            return Ok(tag);
        }
        finished.sort_by_key(|i| {
            i.status
                .as_ref()
                .and_then(|s| s.hash_reference.as_ref())
                .map(|r| r.imported_at)
        });

        for import in &finished {
            tag.prepend_finished_import(import);
        }
        let status = serde_json::to_value(tag.status.clone().unwrap_or_default())?;
        let tag = self
            .tags
            .patch_status(namespace, &tag.name_any(), status)
            .await?;

        let now = Utc::now().to_rfc3339();
        for import in finished {
            let patch = json_patch(vec![set_entry_op(
                "/metadata/annotations",
                import.metadata.annotations.as_ref(),
                CONSUMED_ANNOTATION,
                &now,
            )])?;
            self.imports
                .patch_json(namespace, &import.name_any(), patch)
                .await?;
            debug!(import = %import.name_any(), "Flagged import consumed");
        }
        info!(
            generation = tag.spec.generation,
            references = tag.status.as_ref().map_or(0, |s| s.references.len()),
            "Recorded finished imports"
        );
        Ok(tag)
    }

    /// JSON patch operations pinning the pod's containers that name a Tag in
    /// `namespace`. Pods referring to a Tag that is not imported yet are labeled
    /// pending so they get pinned later.
    pub async fn patch_for_pod(&self, namespace: &str, pod: &Pod) -> Result<Vec<Value>> {
        let Some(spec) = &pod.spec else {
            return Ok(Vec::new());
        };
        let tags = self.tags.list(Some(namespace), None).await?;
        let recorded = recorded_container_tags(pod.annotations());
        let pinning = pin_containers("/spec", spec, &recorded, &tags);
        if pinning.is_empty() {
            return Ok(Vec::new());
        }

        let mut operations = pinning.operations;
        if pinning.container_tags != recorded {
            operations.push(set_entry_op(
                "/metadata/annotations",
                pod.metadata.annotations.as_ref(),
                CONTAINER_TAGS_ANNOTATION,
                &serde_json::to_string(&pinning.container_tags)?,
            ));
        }
        if !pinning.pending.is_empty() {
            debug!(tags = ?pinning.pending, "Pod refers to tags without an imported reference");
            operations.push(set_entry_op(
                "/metadata/labels",
                pod.metadata.labels.as_ref(),
                PENDING_TAGS_LABEL,
                "true",
            ));
        }
        Ok(operations)
    }
}

#[async_trait]
impl Syncer<Tag> for TagSyncer {
    async fn sync(&self, tag: Tag) -> Result<()> {
        let namespace = tag
            .namespace()
            .ok_or_else(|| Error::Invalid(format!("tag {} has no namespace", tag.name_any())))?;
        let imports = self.owned_imports(&tag, &namespace).await?;
        let tag = self.fold_finished_imports(tag, &namespace, &imports).await?;

        if tag.spec_tag_imported() {
            debug!(generation = tag.spec.generation, "Generation already imported");
            return Ok(());
        }

        // an import for this generation and source that has not been folded
        // yet is still running, or has given up
        let requested = imports.iter().any(|i| {
            i.spec.generation == tag.spec.generation
                && i.spec.from == tag.spec.from
                && !i.is_consumed()
        });
        if requested {
            debug!(generation = tag.spec.generation, "Import already requested");
            return Ok(());
        }

        let import = self
            .imports
            .create(&namespace, &ImageImport::for_tag(&tag))
            .await?;
        info!(
            import = %import.name_any(),
            from = %tag.spec.from,
            generation = tag.spec.generation,
            "Requested image import"
        );
        Ok(())
    }
}

/// Points `namespace/name` at `from` (when given) under a new generation,
/// creating the Tag at generation 0 if it does not exist.
pub async fn request_generation(
    tags: &dyn ObjectStore<Tag>,
    namespace: &str,
    name: &str,
    from: Option<&str>,
) -> Result<Tag> {
    match tags.get(namespace, name).await {
        Ok(mut tag) => {
            if let Some(from) = from {
                tag.spec.from = from.to_string();
            }
            tag.spec.generation = tag.next_generation();
            info!(tag = %name, generation = tag.spec.generation, "Requesting new generation");
            tags.replace(namespace, &tag).await
        }
        Err(e) if e.is_not_found() => {
            let Some(from) = from else {
                return Err(e);
            };
            let mut tag = Tag::new(
                name,
                TagSpec {
                    from: from.to_string(),
                    mirror: false,
                    insecure: false,
                    generation: 0,
                },
            );
            tag.metadata.namespace = Some(namespace.to_string());
            info!(tag = %name, from = %from, "Creating tag");
            tags.create(namespace, &tag).await
        }
        Err(e) => Err(e),
    }
}
