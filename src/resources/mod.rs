pub mod buildrun;
pub mod image_import;
pub mod tag;

pub use buildrun::BuildRun;
pub use image_import::{
    ImageImport, ImageImportSpec, ImageImportStatus, ImportConditionType, MAX_IMPORT_ATTEMPTS,
};
pub use tag::{HashReference, HashReferences, MAX_HASH_REFERENCES, Tag, TagSpec, TagStatus};

pub static API_GROUP: &str = "tagger.dev";
pub static FIELD_MANAGER: &str = "kube-tagger";

/// Label set on every ImageImport naming the Tag it imports for.
pub static TAG_LABEL: &str = "tagger.dev/tag";
/// Timestamp annotation marking an ImageImport as folded into its Tag.
pub static CONSUMED_ANNOTATION: &str = "tagger.dev/consumed-at";
/// Deployments carrying this label follow the Tags their containers name.
pub static FOLLOW_TAGS_LABEL: &str = "tagger.dev/follow-tags";
/// Container name to Tag name map recorded on followed Deployments.
pub static CONTAINER_TAGS_ANNOTATION: &str = "tagger.dev/container-tags";
/// Set by the admission webhook on Pods naming a Tag that is not imported yet.
pub static PENDING_TAGS_LABEL: &str = "tagger.dev/pending-tags";
/// BuildRuns annotated with this key publish their output into the named Tag.
pub static BUILDRUN_TAG_ANNOTATION: &str = "tagger.dev/tag";
pub static BUILDRUN_PROCESSED_ANNOTATION: &str = "tagger.dev/processed";

/// Print all CustomResourceDefinitions owned by the operator as a YAML stream.
pub fn crds_yaml() -> anyhow::Result<String> {
    use kube::CustomResourceExt;

    let mut out = String::new();
    for crd in [Tag::crd(), ImageImport::crd()] {
        out.push_str("---\n");
        out.push_str(&serde_yaml_ng::to_string(&crd)?);
    }
    Ok(out)
}
