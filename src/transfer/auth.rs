use crate::error::{Error, Result};
use crate::resources::API_GROUP;
use async_trait::async_trait;
use k8s_openapi::api::authentication::v1::{TokenReview, TokenReviewSpec};
use k8s_openapi::api::authorization::v1::{
    ResourceAttributes, SubjectAccessReview, SubjectAccessReviewSpec,
};
use kube::api::PostParams;
use kube::{Api, Client};
use std::fmt;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verb {
    /// Pull a tag's image
    Get,
    /// Push a new image into a tag
    Update,
}

impl fmt::Display for Verb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Verb::Get => f.write_str("get"),
            Verb::Update => f.write_str("update"),
        }
    }
}

/// Decides whether a bearer token may perform `verb` on tags in a namespace.
#[async_trait]
pub trait Authorizer: Send + Sync {
    async fn authorize(&self, token: &str, namespace: &str, verb: Verb) -> Result<()>;
}

/// Authenticates with a TokenReview and authorizes the resulting user with a
/// SubjectAccessReview against the `tags` resource.
#[derive(Clone)]
pub struct KubeAuthorizer {
    client: Client,
}

impl KubeAuthorizer {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Authorizer for KubeAuthorizer {
    async fn authorize(&self, token: &str, namespace: &str, verb: Verb) -> Result<()> {
        let review = TokenReview {
            spec: TokenReviewSpec {
                token: Some(token.to_string()),
                ..Default::default()
            },
            ..Default::default()
        };
        let review = Api::<TokenReview>::all(self.client.clone())
            .create(&PostParams::default(), &review)
            .await?;
        let status = review.status.unwrap_or_default();
        if !status.authenticated.unwrap_or(false) {
            return Err(Error::Unauthorized(
                status.error.unwrap_or_else(|| "token not authenticated".to_string()),
            ));
        }
        let user = status.user.unwrap_or_default();

        let access = SubjectAccessReview {
            spec: SubjectAccessReviewSpec {
                user: user.username.clone(),
                uid: user.uid,
                groups: user.groups,
                extra: user.extra,
                resource_attributes: Some(ResourceAttributes {
                    namespace: Some(namespace.to_string()),
                    verb: Some(verb.to_string()),
                    group: Some(API_GROUP.to_string()),
                    resource: Some("tags".to_string()),
                    ..Default::default()
                }),
                ..Default::default()
            },
            ..Default::default()
        };
        let access = Api::<SubjectAccessReview>::all(self.client.clone())
            .create(&PostParams::default(), &access)
            .await?;
        let allowed = access.status.as_ref().is_some_and(|s| s.allowed);
        debug!(user = ?user.username, namespace = %namespace, verb = %verb, allowed, "Reviewed transfer access");
        if allowed {
            Ok(())
        } else {
            Err(Error::Unauthorized(format!(
                "{} may not {} tags in {}",
                user.username.unwrap_or_default(),
                verb,
                namespace
            )))
        }
    }
}
