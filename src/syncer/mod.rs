//! Per-kind reconciliation logic plugged into the generic controller.

pub mod buildrun;
pub mod deployment;
pub mod image_import;
pub mod pod;
pub mod tag;

pub use buildrun::BuildRunSyncer;
pub use deployment::DeploymentSyncer;
pub use image_import::ImageImportSyncer;
pub use pod::PodSyncer;
pub use tag::TagSyncer;

use crate::resources::{CONTAINER_TAGS_ANNOTATION, Tag};
use crate::store::escape_pointer;
use k8s_openapi::api::core::v1::PodSpec;
use kube::ResourceExt;
use serde_json::{Value, json};
use std::collections::BTreeMap;

/// Container name to Tag name.
pub type ContainerTags = BTreeMap<String, String>;

/// Containers previously pinned to a Tag, as recorded on the object.
pub fn recorded_container_tags(annotations: &BTreeMap<String, String>) -> ContainerTags {
    annotations
        .get(CONTAINER_TAGS_ANNOTATION)
        .and_then(|v| serde_json::from_str(v).ok())
        .unwrap_or_default()
}

/// Outcome of pinning the containers of a pod spec to their Tags.
#[derive(Debug, Default)]
pub struct Pinning {
    /// JSON patch operations rewriting container images
    pub operations: Vec<Value>,
    pub container_tags: ContainerTags,
    /// Tags whose requested generation has not been imported yet
    pub pending: Vec<String>,
}

impl Pinning {
    pub fn is_empty(&self) -> bool {
        self.container_tags.is_empty()
    }
}

/// Pins every container whose image names a Tag (or that was pinned to one
/// before) to the Tag's current reference. `spec_path` is the JSON pointer of
/// the pod spec inside the patched object.
pub fn pin_containers(
    spec_path: &str,
    spec: &PodSpec,
    recorded: &ContainerTags,
    tags: &[Tag],
) -> Pinning {
    let mut pinning = Pinning::default();
    let lists = [
        ("initContainers", spec.init_containers.as_deref().unwrap_or_default()),
        ("containers", spec.containers.as_slice()),
    ];
    for (list, containers) in lists {
        for (index, container) in containers.iter().enumerate() {
            let image = container.image.as_deref().unwrap_or_default();
            let tag_name = recorded
                .get(&container.name)
                .map(String::as_str)
                .unwrap_or(image);
            let Some(tag) = tags.iter().find(|t| t.name_any() == tag_name) else {
                continue;
            };
            pinning
                .container_tags
                .insert(container.name.clone(), tag.name_any());
            match tag.current_reference() {
                Some(reference) if reference.image_reference != image => {
                    pinning.operations.push(json!({
                        "op": if container.image.is_some() { "replace" } else { "add" },
                        "path": format!("{}/{}/{}/image", spec_path, list, index),
                        "value": reference.image_reference,
                    }));
                }
                Some(_) => {}
                None => {
                    if !pinning.pending.contains(&tag.name_any()) {
                        pinning.pending.push(tag.name_any());
                    }
                }
            }
        }
    }
    pinning
}

/// Sets `key` in the string map at `path` (labels or annotations), creating the map if needed.
pub fn set_entry_op(
    path: &str,
    existing: Option<&BTreeMap<String, String>>,
    key: &str,
    value: &str,
) -> Value {
    match existing {
        Some(_) => json!({
            "op": "add",
            "path": format!("{}/{}", path, escape_pointer(key)),
            "value": value,
        }),
        None => json!({
            "op": "add",
            "path": path,
            "value": { key: value },
        }),
    }
}

pub fn remove_entry_op(path: &str, key: &str) -> Value {
    json!({
        "op": "remove",
        "path": format!("{}/{}", path, escape_pointer(key)),
    })
}

#[cfg(test)]
pub(crate) mod testing {
    use crate::resources::{HashReference, Tag, TagSpec, TagStatus};
    use chrono::Utc;
    use k8s_openapi::api::core::v1::{Container, PodSpec};

    pub fn tag(name: &str, generation: i64, imported: &[(i64, &str)]) -> Tag {
        let mut tag = Tag::new(
            name,
            TagSpec {
                from: format!("quay.io/team/{}:latest", name),
                mirror: false,
                insecure: false,
                generation,
            },
        );
        tag.metadata.namespace = Some("team".to_string());
        tag.metadata.uid = Some(format!("{}-uid", name));
        let mut status = TagStatus::default();
        for (generation, reference) in imported.iter().rev() {
            status.references.prepend(HashReference {
                from: tag.spec.from.clone(),
                imported_at: Utc::now(),
                image_reference: reference.to_string(),
                generation: *generation,
            });
        }
        tag.status = Some(status);
        tag
    }

    pub fn pod_spec(images: &[(&str, &str)]) -> PodSpec {
        PodSpec {
            containers: images
                .iter()
                .map(|(name, image)| Container {
                    name: name.to_string(),
                    image: Some(image.to_string()),
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        }
    }
}
