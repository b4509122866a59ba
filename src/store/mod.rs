//! Object store capability used by the controllers, with a `kube::Api`
//! backed implementation.

#[cfg(test)]
pub mod memory;

use crate::error::{Error, Result};
use async_trait::async_trait;
use k8s_openapi::NamespaceResourceScope;
use kube::api::{DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::{Api, Client, Resource, ResourceExt};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::json;
use std::fmt::Debug;
use std::marker::PhantomData;
use std::sync::Arc;

/// Namespaced objects of kind `K`.
#[async_trait]
pub trait ObjectStore<K>: Send + Sync {
    /// Fails with [`Error::NotFound`] when the object does not exist.
    async fn get(&self, namespace: &str, name: &str) -> Result<K>;

    /// Lists objects in `namespace` (all namespaces for `None`), optionally
    /// filtered by a `key=value[,key=value]` label selector.
    async fn list(&self, namespace: Option<&str>, label_selector: Option<&str>) -> Result<Vec<K>>;

    async fn create(&self, namespace: &str, obj: &K) -> Result<K>;

    /// Replaces the object, subject to its resourceVersion.
    async fn replace(&self, namespace: &str, obj: &K) -> Result<K>;

    async fn patch_json(&self, namespace: &str, name: &str, patch: json_patch::Patch)
    -> Result<K>;

    /// Merges `status` into the status subresource.
    async fn patch_status(
        &self,
        namespace: &str,
        name: &str,
        status: serde_json::Value,
    ) -> Result<K>;

    async fn delete(&self, namespace: &str, name: &str) -> Result<()>;
}

pub type SharedStore<K> = Arc<dyn ObjectStore<K>>;

pub struct KubeStore<K> {
    client: Client,
    _kind: PhantomData<fn() -> K>,
}

impl<K> KubeStore<K> {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            _kind: PhantomData,
        }
    }

    pub fn shared(client: Client) -> Arc<Self> {
        Arc::new(Self::new(client))
    }
}

impl<K> KubeStore<K>
where
    K: Resource<DynamicType = (), Scope = NamespaceResourceScope>,
{
    fn api(&self, namespace: &str) -> Api<K> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait]
impl<K> ObjectStore<K> for KubeStore<K>
where
    K: Resource<DynamicType = (), Scope = NamespaceResourceScope>
        + Clone
        + Debug
        + Serialize
        + DeserializeOwned
        + Send
        + Sync
        + 'static,
{
    async fn get(&self, namespace: &str, name: &str) -> Result<K> {
        self.api(namespace)
            .get_opt(name)
            .await?
            .ok_or_else(|| Error::not_found(K::kind(&()), namespace, name))
    }

    async fn list(&self, namespace: Option<&str>, label_selector: Option<&str>) -> Result<Vec<K>> {
        let api: Api<K> = match namespace {
            Some(ns) => self.api(ns),
            None => Api::all(self.client.clone()),
        };
        let mut lp = ListParams::default();
        if let Some(selector) = label_selector {
            lp = lp.labels(selector);
        }
        Ok(api.list(&lp).await?.items)
    }

    async fn create(&self, namespace: &str, obj: &K) -> Result<K> {
        Ok(self
            .api(namespace)
            .create(&PostParams::default(), obj)
            .await?)
    }

    async fn replace(&self, namespace: &str, obj: &K) -> Result<K> {
        Ok(self
            .api(namespace)
            .replace(&obj.name_any(), &PostParams::default(), obj)
            .await?)
    }

    async fn patch_json(
        &self,
        namespace: &str,
        name: &str,
        patch: json_patch::Patch,
    ) -> Result<K> {
        Ok(self
            .api(namespace)
            .patch(name, &PatchParams::default(), &Patch::Json::<()>(patch))
            .await?)
    }

    async fn patch_status(
        &self,
        namespace: &str,
        name: &str,
        status: serde_json::Value,
    ) -> Result<K> {
        let patch = json!({ "status": status });
        Ok(self
            .api(namespace)
            .patch_status(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?)
    }

    async fn delete(&self, namespace: &str, name: &str) -> Result<()> {
        self.api(namespace)
            .delete(name, &DeleteParams::background())
            .await?;
        Ok(())
    }
}

/// Builds an RFC 6902 patch from `{"op", "path", "value"}` objects.
pub fn json_patch(operations: Vec<serde_json::Value>) -> Result<json_patch::Patch> {
    Ok(serde_json::from_value(serde_json::Value::Array(operations))?)
}

/// Escapes a single JSON pointer token.
pub fn escape_pointer(token: &str) -> String {
    token.replace('~', "~0").replace('/', "~1")
}
