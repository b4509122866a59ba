use crate::error::{Error, Result};
use crate::resources::image_import::ImageImport;
use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Upper bound on the number of hash references kept in a Tag's history.
pub const MAX_HASH_REFERENCES: usize = 25;

#[derive(CustomResource, Debug, Clone, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "tagger.dev",
    version = "v1beta1",
    kind = "Tag",
    plural = "tags",
    namespaced,
    status = "TagStatus",
    printcolumn = r#"{"name":"From","type":"string","jsonPath":".spec.from"}"#,
    printcolumn = r#"{"name":"Generation","type":"integer","jsonPath":".spec.generation"}"#,
    printcolumn = r#"{"name":"Reference","type":"string","jsonPath":".status.references[0].imageReference"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct TagSpec {
    /// Floating image reference to resolve (e.g. centos:7 or myrepo/app:latest)
    pub from: String,
    /// Copy imported images into the mirror registry
    #[serde(default)]
    pub mirror: bool,
    /// Allow plain HTTP and unverified TLS when talking to the source registry
    #[serde(default)]
    pub insecure: bool,
    /// Requested generation. Bump it by one to trigger a new import
    #[serde(default)]
    pub generation: i64,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TagStatus {
    /// Imported references, most recent generation first
    #[serde(default)]
    pub references: HashReferences,
}

#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct HashReference {
    pub from: String,
    pub imported_at: DateTime<Utc>,
    /// Digest pinned reference the import resolved to
    pub image_reference: String,
    pub generation: i64,
}

/// Bounded history of hash references, sorted strictly descending by generation.
#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(transparent)]
pub struct HashReferences(Vec<HashReference>);

impl HashReferences {
    pub fn head(&self) -> Option<&HashReference> {
        self.0.first()
    }

    pub fn iter(&self) -> impl Iterator<Item = &HashReference> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn get(&self, generation: i64) -> Option<&HashReference> {
        self.0.iter().find(|r| r.generation == generation)
    }

    pub fn max_generation(&self) -> Option<i64> {
        self.head().map(|r| r.generation)
    }

    /// Records a finished import.
    ///
    /// When the resolved reference equals the head's, the head is refreshed in
    /// place and takes over the newer generation instead of growing the list.
    /// The head's previous generation is gone from the history afterwards, so
    /// [`Tag::validate_generation`] no longer accepts a request for it.
    pub fn prepend(&mut self, reference: HashReference) {
        if let Some(head) = self.0.first_mut() {
            if head.image_reference == reference.image_reference
                && reference.generation >= head.generation
            {
                head.from = reference.from;
                head.imported_at = reference.imported_at;
                head.generation = reference.generation;
                return;
            }
        }

        match self
            .0
            .iter()
            .position(|r| r.generation <= reference.generation)
        {
            Some(pos) if self.0[pos].generation == reference.generation => {
                self.0[pos] = reference;
            }
            Some(pos) => self.0.insert(pos, reference),
            None => self.0.push(reference),
        }
        self.0.truncate(MAX_HASH_REFERENCES);

        debug_assert!(self.is_sorted());
    }

    fn is_sorted(&self) -> bool {
        self.0.windows(2).all(|w| w[0].generation > w[1].generation)
    }
}

impl From<Vec<HashReference>> for HashReferences {
    fn from(mut references: Vec<HashReference>) -> Self {
        references.sort_by(|a, b| b.generation.cmp(&a.generation));
        references.dedup_by_key(|r| r.generation);
        references.truncate(MAX_HASH_REFERENCES);
        HashReferences(references)
    }
}

impl Tag {
    fn references(&self) -> Option<&HashReferences> {
        self.status.as_ref().map(|s| &s.references)
    }

    /// True once the generation requested in the spec has been imported.
    pub fn spec_tag_imported(&self) -> bool {
        self.current_reference().is_some()
    }

    /// The reference consumers of this Tag are pinned to.
    pub fn current_reference(&self) -> Option<&HashReference> {
        self.references()?.get(self.spec.generation)
    }

    /// The generation a new import request has to use.
    pub fn next_generation(&self) -> i64 {
        self.references()
            .and_then(HashReferences::max_generation)
            .map_or(0, |g| g + 1)
    }

    /// Generation writes are valid when they are 0, one past the highest
    /// imported generation, or a generation already present in the history.
    pub fn validate_generation(&self) -> Result<()> {
        let generation = self.spec.generation;
        let next = self.next_generation();
        let known: Vec<i64> = self
            .references()
            .map(|r| r.iter().map(|r| r.generation).collect())
            .unwrap_or_default();

        if generation == 0 || generation == next || known.contains(&generation) {
            return Ok(());
        }

        let known = known
            .iter()
            .map(|g| g.to_string())
            .collect::<Vec<_>>()
            .join(", ");
        Err(Error::InvalidGeneration(format!(
            "invalid generation {}: allowed values are 0, {} or an imported generation [{}]",
            generation, next, known
        )))
    }

    /// Folds the result of a successful import into the history. Returns false
    /// if the import has not produced a reference.
    pub fn prepend_finished_import(&mut self, import: &ImageImport) -> bool {
        let Some(reference) = import.status.as_ref().and_then(|s| s.hash_reference.clone()) else {
            return false;
        };
        self.prepend_hash_reference(HashReference {
            generation: import.spec.generation,
            ..reference
        });
        true
    }

    pub fn prepend_hash_reference(&mut self, reference: HashReference) {
        self.status
            .get_or_insert_with(TagStatus::default)
            .references
            .prepend(reference);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn tag(name: &str, generation: i64) -> Tag {
        let mut tag = Tag::new(
            name,
            TagSpec {
                from: "centos:7".to_string(),
                mirror: false,
                insecure: false,
                generation,
            },
        );
        tag.metadata.namespace = Some("default".to_string());
        tag
    }

    fn reference(generation: i64, image: &str) -> HashReference {
        HashReference {
            from: "centos:7".to_string(),
            imported_at: Utc::now(),
            image_reference: image.to_string(),
            generation,
        }
    }

    #[test]
    fn test_prepend_keeps_bound_and_order() {
        let mut refs = HashReferences::default();
        for generation in 0..60 {
            refs.prepend(reference(generation, &format!("img@{}", generation)));
            assert!(refs.len() <= MAX_HASH_REFERENCES);
            assert!(refs.is_sorted());
        }
        assert_eq!(refs.len(), MAX_HASH_REFERENCES);
        assert_eq!(refs.head().unwrap().generation, 59);
    }

    #[test]
    fn test_prepend_same_image_updates_head() {
        let mut refs = HashReferences::default();
        refs.prepend(reference(0, "img@a"));
        refs.prepend(reference(1, "img@b"));

        let mut again = reference(2, "img@b");
        again.from = "centos:7.9".to_string();
        again.imported_at = Utc::now() + Duration::minutes(5);
        refs.prepend(again.clone());

        assert_eq!(refs.len(), 2);
        let head = refs.head().unwrap();
        assert_eq!(head.from, "centos:7.9");
        assert_eq!(head.imported_at, again.imported_at);
        assert_eq!(head.generation, 2);
    }

    #[test]
    fn test_prepend_out_of_order_generation() {
        let mut refs = HashReferences::default();
        refs.prepend(reference(3, "img@c"));
        refs.prepend(reference(1, "img@a"));
        refs.prepend(reference(2, "img@b"));
        refs.prepend(reference(2, "img@b2"));
        let generations: Vec<i64> = refs.iter().map(|r| r.generation).collect();
        assert_eq!(generations, vec![3, 2, 1]);
        assert_eq!(refs.get(2).unwrap().image_reference, "img@b2");
    }

    #[test]
    fn test_spec_tag_imported() {
        let mut t = tag("app", 1);
        assert!(!t.spec_tag_imported());
        t.prepend_hash_reference(reference(0, "img@a"));
        assert!(!t.spec_tag_imported());
        t.prepend_hash_reference(reference(1, "img@b"));
        assert!(t.spec_tag_imported());
        t.spec.generation = 0;
        assert!(t.spec_tag_imported());
        assert_eq!(t.current_reference().unwrap().image_reference, "img@a");
    }

    #[test]
    fn test_validate_generation() {
        let t = tag("app", 0);
        assert!(t.validate_generation().is_ok());

        let mut t = tag("app", 0);
        for generation in 0..3 {
            t.prepend_hash_reference(reference(generation, &format!("img@{}", generation)));
        }
        for generation in [0, 1, 2, 3] {
            t.spec.generation = generation;
            assert!(t.validate_generation().is_ok(), "generation {}", generation);
        }

        t.spec.generation = 5;
        let err = t.validate_generation().unwrap_err().to_string();
        assert!(err.contains("invalid generation 5"), "{}", err);
        assert!(err.contains("0, 3"), "{}", err);
        assert!(err.contains("[2, 1, 0]"), "{}", err);

        t.spec.generation = -1;
        assert!(t.validate_generation().is_err());
    }

    #[test]
    fn test_collapsed_generation_is_rejected() {
        let mut t = tag("app", 0);
        t.prepend_hash_reference(reference(0, "img@a"));
        t.prepend_hash_reference(reference(1, "img@b"));
        // generation 2 resolved to the same image as generation 1
        t.prepend_hash_reference(reference(2, "img@b"));

        let generations: Vec<i64> = t.references().unwrap().iter().map(|r| r.generation).collect();
        assert_eq!(generations, vec![2, 0]);

        t.spec.generation = 2;
        assert!(t.spec_tag_imported());
        assert!(t.validate_generation().is_ok());

        t.spec.generation = 1;
        assert!(!t.spec_tag_imported());
        let err = t.validate_generation().unwrap_err().to_string();
        assert!(err.contains("invalid generation 1"), "{}", err);
        assert!(err.contains("[2, 0]"), "{}", err);
    }

    #[test]
    fn test_from_vec_normalizes() {
        let refs = HashReferences::from(vec![
            reference(1, "a"),
            reference(4, "b"),
            reference(1, "c"),
        ]);
        let generations: Vec<i64> = refs.iter().map(|r| r.generation).collect();
        assert_eq!(generations, vec![4, 1]);
    }
}
