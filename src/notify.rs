//! Registry push notifications. A push to the repository and tag a Tag
//! follows requests a new generation of that Tag.

use crate::error::Result;
use crate::image_reference::{ImageReference, ParseError};
use crate::resources::Tag;
use crate::store::SharedStore;
use crate::syncer::tag::request_generation;
use kube::ResourceExt;
use serde::Deserialize;
use tracing::{debug, info};

#[derive(Debug, Deserialize)]
pub struct DockerHubPayload {
    pub push_data: DockerHubPushData,
    pub repository: DockerHubRepository,
}

#[derive(Debug, Deserialize)]
pub struct DockerHubPushData {
    pub tag: String,
}

#[derive(Debug, Deserialize)]
pub struct DockerHubRepository {
    pub repo_name: String,
}

impl DockerHubPayload {
    pub fn images(&self) -> std::result::Result<Vec<ImageReference>, ParseError> {
        let image = format!("{}:{}", self.repository.repo_name, self.push_data.tag);
        Ok(vec![ImageReference::parse(&image)?])
    }
}

#[derive(Debug, Deserialize)]
pub struct QuayPayload {
    /// Pullable repository location, e.g. quay.io/org/repo
    pub docker_url: String,
    #[serde(default)]
    pub updated_tags: Vec<String>,
}

impl QuayPayload {
    pub fn images(&self) -> std::result::Result<Vec<ImageReference>, ParseError> {
        self.updated_tags
            .iter()
            .map(|tag| ImageReference::parse(&format!("{}:{}", self.docker_url, tag)))
            .collect()
    }
}

/// True when `from` follows exactly the pushed repository and tag.
fn follows(from: &ImageReference, pushed: &ImageReference) -> bool {
    from.digest.is_none()
        && from.registry == pushed.registry
        && from.repository == pushed.repository
        && from.tag == pushed.tag
}

#[derive(Clone)]
pub struct Notifier {
    tags: SharedStore<Tag>,
}

impl Notifier {
    pub fn new(tags: SharedStore<Tag>) -> Self {
        Self { tags }
    }

    /// Requests a new generation of every Tag following one of `pushed`.
    /// Returns the number of Tags updated.
    pub async fn images_pushed(&self, pushed: &[ImageReference]) -> Result<usize> {
        let mut updated = 0;
        for tag in self.tags.list(None, None).await? {
            let Ok(from) = ImageReference::parse(&tag.spec.from) else {
                debug!(tag = %tag.name_any(), "Skipping tag with unparsable source");
                continue;
            };
            if !pushed.iter().any(|p| follows(&from, p)) {
                continue;
            }
            let namespace = tag.namespace().unwrap_or_default();
            request_generation(self.tags.as_ref(), &namespace, &tag.name_any(), None).await?;
            info!(tag = %tag.name_any(), namespace = %namespace, from = %from, "Push notification triggered import");
            updated += 1;
        }
        Ok(updated)
    }
}
