use crate::controller::Syncer;
use crate::credentials::NamespaceCredentials;
use crate::error::{Error, Result};
use crate::image_reference::ImageReference;
use crate::registry::{Location, Mirror, Resolver};
use crate::resources::{ImageImport, Tag};
use crate::store::SharedStore;
use async_trait::async_trait;
use kube::ResourceExt;
use tracing::{debug, info, warn};

/// Resolves (and optionally mirrors) the image of a single ImageImport and
/// records every attempt in its status.
pub struct ImageImportSyncer {
    imports: SharedStore<ImageImport>,
    tags: SharedStore<Tag>,
    credentials: NamespaceCredentials,
    resolver: Resolver,
    mirror: Option<Mirror>,
}

impl ImageImportSyncer {
    pub fn new(
        imports: SharedStore<ImageImport>,
        tags: SharedStore<Tag>,
        credentials: NamespaceCredentials,
        resolver: Resolver,
        mirror: Option<Mirror>,
    ) -> Self {
        Self {
            imports,
            tags,
            credentials,
            resolver,
            mirror,
        }
    }

    fn needs_inheritance(import: &ImageImport) -> bool {
        import.spec.mirror.is_none()
            || import.spec.insecure.is_none()
            || import.spec.from.is_empty()
            || import.spec.target_image.is_empty()
    }

    /// The owning Tag, if it still exists and is the one recorded as owner.
    async fn owner(&self, import: &ImageImport, namespace: &str) -> Result<Option<Tag>> {
        let Some(owner) = import.owner_image() else {
            return Ok(None);
        };
        match self.tags.get(namespace, &owner.name).await {
            Ok(tag) if import.is_owned_by(&tag) => Ok(Some(tag)),
            Ok(_) => Ok(None),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Resolves the source to a digest and copies it to the mirror when
    /// requested. Returns the digest pinned reference consumers will use.
    async fn import(&self, import: &ImageImport, namespace: &str) -> Result<String> {
        let from = ImageReference::parse(&import.spec.from)?;
        let insecure = import.spec.insecure.unwrap_or(false);
        let credentials = self
            .credentials
            .for_registry(namespace, &from.registry)
            .await?;
        let (pinned, auth) = self
            .resolver
            .image_tag_hash(&from, &credentials, insecure)
            .await?;

        if !import.spec.mirror.unwrap_or(false) {
            return Ok(pinned.to_string());
        }
        let mirror = self.mirror.as_ref().ok_or(Error::MirrorNotConfigured)?;
        let copy = mirror
            .load(
                &Location::new(pinned, auth, insecure),
                namespace,
                &import.spec.target_image,
                &import.spec.generation.to_string(),
            )
            .await?;
        Ok(copy.to_string())
    }
}

#[async_trait]
impl Syncer<ImageImport> for ImageImportSyncer {
    async fn sync(&self, mut import: ImageImport) -> Result<()> {
        if import.is_terminal() {
            debug!("Import finished, nothing to do");
            return Ok(());
        }
        let namespace = import.namespace().ok_or_else(|| {
            Error::Invalid(format!("import {} has no namespace", import.name_any()))
        })?;
        let name = import.name_any();

        if Self::needs_inheritance(&import) {
            let Some(tag) = self.owner(&import, &namespace).await? else {
                debug!("Owning tag is gone, nothing to import");
                return Ok(());
            };
            import.inherit_values_from(&tag);
        }

        let outcome = self.import(&import, &namespace).await;
        match &outcome {
            Ok(reference) => {
                info!(reference = %reference, "Image imported");
                import.register_import_success(reference.clone());
            }
            Err(e) => {
                warn!(error = %e, attempts = import.failed_import_attempts() + 1, "Image import failed");
                import.register_import_failure(e);
            }
        }
        let status = serde_json::to_value(import.status.clone().unwrap_or_default())?;
        self.imports.patch_status(&namespace, &name, status).await?;

        match outcome {
            // retried with backoff until no attempts are left
            Err(e) if !import.is_terminal() => Err(e),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::RegistryAuth;
    use crate::registry::testing::FakeRegistry;
    use crate::resources::{ImportConditionType, MAX_IMPORT_ATTEMPTS};
    use crate::store::memory::MemoryStore;
    use crate::syncer::testing::tag;
    use k8s_openapi::api::core::v1::Secret;
    use std::sync::Arc;

    static DIGEST: &str = "sha256:3333333333333333333333333333333333333333333333333333333333333333";

    struct Fixture {
        imports: Arc<MemoryStore<ImageImport>>,
        registry: Arc<FakeRegistry>,
        syncer: ImageImportSyncer,
    }

    fn fixture(registry: FakeRegistry, mirror: bool) -> Fixture {
        let registry = Arc::new(registry);
        let imports = Arc::new(MemoryStore::new());
        let tags = Arc::new(MemoryStore::with([tag("app", 0, &[])]));
        let mirror = mirror.then(|| {
            Mirror::new(
                registry.clone(),
                "mirror.local",
                RegistryAuth::basic("tagger", "pw"),
                false,
            )
        });
        let credentials =
            NamespaceCredentials::new(Arc::new(MemoryStore::<Secret>::new()), mirror.clone());
        let syncer = ImageImportSyncer::new(
            imports.clone(),
            tags,
            credentials,
            Resolver::new(registry.clone()),
            mirror,
        );
        Fixture {
            imports,
            registry,
            syncer,
        }
    }

    fn stored_import(f: &Fixture, mirror: Option<bool>) -> ImageImport {
        let mut import = ImageImport::for_tag(&tag("app", 0, &[]));
        import.metadata.name = Some("app-00001".to_string());
        import.spec.mirror = mirror;
        f.imports.insert(import);
        f.imports.find("team", "app-00001").unwrap()
    }

    #[tokio::test]
    async fn test_successful_import() {
        let f = fixture(
            FakeRegistry::with_digest("quay.io/team/app:latest", DIGEST, RegistryAuth::Anonymous),
            false,
        );
        let import = stored_import(&f, Some(false));
        f.syncer.sync(import).await.unwrap();

        let stored = f.imports.find("team", "app-00001").unwrap();
        assert!(stored.already_imported());
        assert_eq!(stored.condition_type(), Some(ImportConditionType::ImageImported));
        let reference = stored.status.unwrap().hash_reference.unwrap();
        assert_eq!(reference.image_reference, format!("quay.io/team/app@{}", DIGEST));
        assert!(f.registry.copies.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_mirrored_import() {
        let f = fixture(
            FakeRegistry::with_digest("quay.io/team/app:latest", DIGEST, RegistryAuth::Anonymous),
            true,
        );
        // unset mirror flag is inherited from the tag, so set it explicitly
        let import = stored_import(&f, Some(true));
        f.syncer.sync(import).await.unwrap();

        let stored = f.imports.find("team", "app-00001").unwrap();
        let reference = stored.status.unwrap().hash_reference.unwrap();
        assert_eq!(reference.image_reference, format!("mirror.local/team/app@{}", DIGEST));
        assert_eq!(
            f.registry.copies.lock().unwrap()[0].1,
            "mirror.local/team/app:0"
        );
    }

    #[tokio::test]
    async fn test_mirror_requested_without_mirror_fails() {
        let f = fixture(
            FakeRegistry::with_digest("quay.io/team/app:latest", DIGEST, RegistryAuth::Anonymous),
            false,
        );
        let import = stored_import(&f, Some(true));
        let result = f.syncer.sync(import).await;
        assert!(matches!(result, Err(Error::MirrorNotConfigured)));

        let stored = f.imports.find("team", "app-00001").unwrap();
        assert!(!stored.already_imported());
        assert_eq!(stored.failed_import_attempts(), 1);
        assert!(stored.status.unwrap().hash_reference.is_none());
        assert!(f.registry.copies.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failures_are_recorded_until_exhausted() {
        let f = fixture(FakeRegistry::default(), false);
        stored_import(&f, Some(false));

        for attempt in 1..=MAX_IMPORT_ATTEMPTS {
            let current = f.imports.find("team", "app-00001").unwrap();
            let result = f.syncer.sync(current).await;
            let stored = f.imports.find("team", "app-00001").unwrap();
            assert_eq!(stored.failed_import_attempts(), attempt);
            if attempt < MAX_IMPORT_ATTEMPTS {
                assert!(matches!(result, Err(Error::AllCredentialsFailed { .. })));
            } else {
                assert!(result.is_ok());
            }
        }

        let stored = f.imports.find("team", "app-00001").unwrap();
        assert_eq!(stored.condition_type(), Some(ImportConditionType::NoMoreAttempts));

        // no further attempt is made
        f.syncer.sync(stored).await.unwrap();
        let stored = f.imports.find("team", "app-00001").unwrap();
        assert_eq!(stored.failed_import_attempts(), MAX_IMPORT_ATTEMPTS);
        assert_eq!(
            f.registry.resolve_calls.lock().unwrap().len(),
            MAX_IMPORT_ATTEMPTS
        );
    }

    #[tokio::test]
    async fn test_missing_owner_is_noop() {
        let f = fixture(FakeRegistry::default(), false);
        let mut import = ImageImport::for_tag(&tag("gone", 0, &[]));
        import.metadata.name = Some("gone-00001".to_string());
        import.spec.mirror = None;
        f.imports.insert(import.clone());

        f.syncer.sync(import).await.unwrap();
        let stored = f.imports.find("team", "gone-00001").unwrap();
        assert_eq!(stored.failed_import_attempts(), 0);
        assert!(f.registry.resolve_calls.lock().unwrap().is_empty());
    }
}
