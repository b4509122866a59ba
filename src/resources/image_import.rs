use crate::resources::tag::{HashReference, Tag};
use crate::resources::{CONSUMED_ANNOTATION, TAG_LABEL};
use chrono::{DateTime, Utc};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::{CustomResource, Resource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Upper bound on import attempts before an ImageImport gives up.
pub const MAX_IMPORT_ATTEMPTS: usize = 10;

// An ImageImport is a one-shot request to resolve (and optionally mirror) a
// single generation of a Tag. It is created by the Tag controller, owned by
// the Tag, and deleted some time after its result has been folded back into
// the Tag's history.
#[derive(CustomResource, Debug, Clone, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "tagger.dev",
    version = "v1beta1",
    kind = "ImageImport",
    plural = "imageimports",
    namespaced,
    status = "ImageImportStatus",
    printcolumn = r#"{"name":"Target","type":"string","jsonPath":".spec.targetImage"}"#,
    printcolumn = r#"{"name":"Generation","type":"integer","jsonPath":".spec.generation"}"#,
    printcolumn = r#"{"name":"Condition","type":"string","jsonPath":".status.condition.type"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ImageImportSpec {
    /// Name of the Tag this import is for
    pub target_image: String,
    pub from: String,
    /// Generation of the target Tag this import resolves
    #[serde(default)]
    pub generation: i64,
    /// Inherited from the target Tag when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mirror: Option<bool>,
    /// Inherited from the target Tag when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub insecure: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ImageImportStatus {
    #[serde(default)]
    pub import_attempts: Vec<ImportAttempt>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash_reference: Option<HashReference>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<ImportCondition>,
}

#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ImportAttempt {
    pub when: DateTime<Utc>,
    pub succeeded: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reason: String,
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ImportConditionType {
    Progressing,
    ImageImported,
    NoMoreAttempts,
}

#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ImportCondition {
    #[serde(rename = "type")]
    pub type_: ImportConditionType,
    pub status: String, // "True" | "False"
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub last_transition_time: DateTime<Utc>,
}

impl ImageImport {
    /// A fresh import for the Tag's requested generation, owned by the Tag.
    pub fn for_tag(tag: &Tag) -> Self {
        let mut import = ImageImport::new("", ImageImportSpec::default());
        import.metadata.name = None;
        import.metadata.generate_name = Some(format!("{}-", tag.name_any()));
        import.metadata.namespace = tag.namespace();
        import.spec.generation = tag.spec.generation;
        import.set_owner_image(tag);
        import.inherit_values_from(tag);
        import
    }

    /// Fills every unset spec field from the target Tag.
    pub fn inherit_values_from(&mut self, tag: &Tag) {
        if self.spec.target_image.is_empty() {
            self.spec.target_image = tag.name_any();
        }
        if self.spec.from.is_empty() {
            self.spec.from = tag.spec.from.clone();
        }
        self.spec.mirror.get_or_insert(tag.spec.mirror);
        self.spec.insecure.get_or_insert(tag.spec.insecure);
    }

    pub fn set_owner_image(&mut self, tag: &Tag) {
        let owner = OwnerReference {
            api_version: Tag::api_version(&()).to_string(),
            kind: Tag::kind(&()).to_string(),
            name: tag.name_any(),
            uid: tag.uid().unwrap_or_default(),
            controller: Some(true),
            block_owner_deletion: Some(true),
        };
        let owners = self.metadata.owner_references.get_or_insert_with(Vec::new);
        owners.retain(|o| o.kind != owner.kind);
        owners.push(owner);
        self.labels_mut()
            .insert(TAG_LABEL.to_string(), tag.name_any());
        self.spec.target_image = tag.name_any();
    }

    /// The owning Tag, as recorded. The Tag itself may no longer exist.
    pub fn owner_image(&self) -> Option<&OwnerReference> {
        let kind = Tag::kind(&());
        self.owner_references().iter().find(|o| o.kind == kind)
    }

    pub fn is_owned_by(&self, tag: &Tag) -> bool {
        match (self.owner_image(), tag.uid()) {
            (Some(owner), Some(uid)) if !owner.uid.is_empty() => owner.uid == uid,
            (Some(owner), _) => owner.name == tag.name_any(),
            (None, _) => false,
        }
    }

    fn status_ref(&self) -> Option<&ImageImportStatus> {
        self.status.as_ref()
    }

    pub fn already_imported(&self) -> bool {
        self.status_ref()
            .is_some_and(|s| s.hash_reference.is_some())
    }

    pub fn failed_import_attempts(&self) -> usize {
        self.status_ref()
            .map(|s| s.import_attempts.iter().filter(|a| !a.succeeded).count())
            .unwrap_or(0)
    }

    pub fn condition_type(&self) -> Option<ImportConditionType> {
        self.status_ref()
            .and_then(|s| s.condition.as_ref())
            .map(|c| c.type_)
    }

    /// No further attempts are made once the import succeeded or ran out of attempts.
    pub fn is_terminal(&self) -> bool {
        self.already_imported()
            || self.failed_import_attempts() >= MAX_IMPORT_ATTEMPTS
            || matches!(
                self.condition_type(),
                Some(ImportConditionType::ImageImported | ImportConditionType::NoMoreAttempts)
            )
    }

    pub fn register_import_success(&mut self, image_reference: String) {
        if self.is_terminal() {
            return;
        }
        let now = Utc::now();
        let generation = self.spec.generation;
        let from = self.spec.from.clone();
        let status = self.status.get_or_insert_with(ImageImportStatus::default);
        status.import_attempts.push(ImportAttempt {
            when: now,
            succeeded: true,
            reason: String::new(),
        });
        status.hash_reference = Some(HashReference {
            from,
            imported_at: now,
            image_reference,
            generation,
        });
        self.update_condition();
    }

    pub fn register_import_failure(&mut self, reason: impl ToString) {
        if self.is_terminal() {
            return;
        }
        let status = self.status.get_or_insert_with(ImageImportStatus::default);
        status.import_attempts.push(ImportAttempt {
            when: Utc::now(),
            succeeded: false,
            reason: reason.to_string(),
        });
        self.update_condition();
    }

    fn update_condition(&mut self) {
        let failed = self.failed_import_attempts();
        let status = self.status.get_or_insert_with(ImageImportStatus::default);
        let last_reason = status
            .import_attempts
            .last()
            .filter(|a| !a.succeeded)
            .map(|a| a.reason.clone());

        let (type_, reason, message) = if status.hash_reference.is_some() {
            (ImportConditionType::ImageImported, "ImportSucceeded", None)
        } else if failed >= MAX_IMPORT_ATTEMPTS {
            (ImportConditionType::NoMoreAttempts, "ImportFailed", last_reason)
        } else {
            (ImportConditionType::Progressing, "ImportPending", last_reason)
        };

        let last_transition_time = match &status.condition {
            Some(c) if c.type_ == type_ => c.last_transition_time,
            _ => Utc::now(),
        };
        status.condition = Some(ImportCondition {
            type_,
            status: "True".to_string(),
            reason: Some(reason.to_string()),
            message,
            last_transition_time,
        });
    }

    pub fn consumed_at(&self) -> Option<DateTime<Utc>> {
        self.annotations()
            .get(CONSUMED_ANNOTATION)
            .and_then(|v| DateTime::parse_from_rfc3339(v).ok())
            .map(|t| t.with_timezone(&Utc))
    }

    pub fn is_consumed(&self) -> bool {
        self.annotations().contains_key(CONSUMED_ANNOTATION)
    }

    pub fn flag_consumed(&mut self, at: DateTime<Utc>) {
        self.annotations_mut()
            .insert(CONSUMED_ANNOTATION.to_string(), at.to_rfc3339());
    }
}
