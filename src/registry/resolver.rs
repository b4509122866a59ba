use crate::credentials::RegistryAuth;
use crate::error::{Error, Result};
use crate::image_reference::ImageReference;
use crate::registry::{Location, Registry};
use std::sync::Arc;
use tracing::{debug, warn};

/// Resolves floating references to digests, trying credential sets in order.
#[derive(Clone)]
pub struct Resolver {
    registry: Arc<dyn Registry>,
}

impl Resolver {
    pub fn new(registry: Arc<dyn Registry>) -> Self {
        Self { registry }
    }

    /// Digest-pinned form of `image` and the credential set that resolved it.
    /// Stops at the first credential set that works; if none does, the error
    /// lists every failure.
    pub async fn image_tag_hash(
        &self,
        image: &ImageReference,
        credentials: &[RegistryAuth],
        insecure: bool,
    ) -> Result<(ImageReference, RegistryAuth)> {
        let anonymous = [RegistryAuth::Anonymous];
        let credentials = if credentials.is_empty() {
            &anonymous[..]
        } else {
            credentials
        };

        let mut failures = Vec::new();
        for auth in credentials {
            let location = Location::new(image.clone(), auth.clone(), insecure);
            match self.registry.manifest_digest(&location).await {
                Ok(digest) => {
                    debug!(image = %image, auth = ?auth, digest = %digest, "Resolved image");
                    return Ok((image.with_digest(&digest), auth.clone()));
                }
                Err(e) => {
                    warn!(image = %image, auth = ?auth, error = %e, "Credential set failed");
                    failures.push(format!("{:?}: {}", auth, e));
                }
            }
        }
        Err(Error::AllCredentialsFailed {
            reference: image.to_string(),
            failures,
        })
    }
}
