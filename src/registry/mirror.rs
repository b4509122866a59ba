use crate::credentials::RegistryAuth;
use crate::error::Result;
use crate::image_reference::ImageReference;
use crate::registry::{Location, Registry};
use std::path::Path;
use std::sync::Arc;
use tracing::info;

/// The operator's own registry, holding copies of imported images.
#[derive(Clone)]
pub struct Mirror {
    registry: Arc<dyn Registry>,
    address: String,
    auth: RegistryAuth,
    insecure: bool,
}

impl Mirror {
    pub fn new(
        registry: Arc<dyn Registry>,
        address: impl Into<String>,
        auth: RegistryAuth,
        insecure: bool,
    ) -> Self {
        Self {
            registry,
            address: address.into(),
            auth,
            insecure,
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// Credentials for `host` when it is the mirror itself.
    pub fn credentials_for(&self, host: &str) -> Option<RegistryAuth> {
        (host == self.address).then(|| self.auth.clone())
    }

    /// Where the image of tag `namespace/name` lives in the mirror.
    pub fn destination(&self, namespace: &str, name: &str, tag: &str) -> ImageReference {
        ImageReference {
            registry: self.address.clone(),
            repository: format!("{}/{}", namespace, name),
            tag: Some(tag.to_string()),
            digest: None,
        }
    }

    fn location(&self, image: ImageReference) -> Location {
        Location::new(image, self.auth.clone(), self.insecure)
    }

    /// Copies `src`, with every image of a manifest list, to `namespace/name:tag`
    /// in the mirror. Returns the digest pinned reference of the copy.
    pub async fn load(
        &self,
        src: &Location,
        namespace: &str,
        name: &str,
        tag: &str,
    ) -> Result<ImageReference> {
        let dst = self.location(self.destination(namespace, name, tag));
        let digest = self.registry.copy(src, &dst).await?;
        let pinned = dst.image.with_digest(&digest);
        info!(src = %src.image, dst = %pinned, "Mirrored image");
        Ok(pinned)
    }

    /// Pushes an OCI layout archive to `namespace/name:tag` in the mirror.
    pub async fn load_archive(
        &self,
        archive: &Path,
        namespace: &str,
        name: &str,
        tag: &str,
    ) -> Result<ImageReference> {
        let dst = self.location(self.destination(namespace, name, tag));
        let digest = self.registry.import(archive, &dst).await?;
        Ok(dst.image.with_digest(&digest))
    }

    /// Location of `image` with mirror credentials when it is hosted on the mirror.
    pub fn locate(&self, image: ImageReference, fallback: RegistryAuth, insecure: bool) -> Location {
        match self.credentials_for(&image.registry) {
            Some(auth) => Location::new(image, auth, self.insecure),
            None => Location::new(image, fallback, insecure),
        }
    }
}
