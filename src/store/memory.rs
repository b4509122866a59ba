use super::ObjectStore;
use crate::error::{Error, Result};
use async_trait::async_trait;
use kube::{Resource, ResourceExt};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::BTreeMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

/// In-memory object store for tests.
pub struct MemoryStore<K> {
    objects: Mutex<BTreeMap<(String, String), K>>,
    counter: AtomicU64,
}

impl<K> Default for MemoryStore<K> {
    fn default() -> Self {
        Self {
            objects: Mutex::new(BTreeMap::new()),
            counter: AtomicU64::new(0),
        }
    }
}

impl<K> MemoryStore<K>
where
    K: Resource<DynamicType = ()> + Clone + Serialize + DeserializeOwned,
{
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(objects: impl IntoIterator<Item = K>) -> Self {
        let store = Self::new();
        for obj in objects {
            store.insert(obj);
        }
        store
    }

    pub fn insert(&self, mut obj: K) {
        let namespace = obj.namespace().unwrap_or_default();
        if obj.meta().uid.is_none() {
            obj.meta_mut().uid = Some(format!("uid-{}", self.next()));
        }
        self.objects
            .lock()
            .unwrap()
            .insert((namespace, obj.name_any()), obj);
    }

    pub fn all(&self) -> Vec<K> {
        self.objects.lock().unwrap().values().cloned().collect()
    }

    pub fn find(&self, namespace: &str, name: &str) -> Option<K> {
        self.objects
            .lock()
            .unwrap()
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }

    fn next(&self) -> u64 {
        self.counter.fetch_add(1, Ordering::SeqCst)
    }

    fn update(
        &self,
        namespace: &str,
        name: &str,
        f: impl FnOnce(&mut serde_json::Value) -> Result<()>,
    ) -> Result<K> {
        let mut objects = self.objects.lock().unwrap();
        let key = (namespace.to_string(), name.to_string());
        let current = objects
            .get(&key)
            .ok_or_else(|| Error::not_found(K::kind(&()), namespace, name))?;
        let mut doc = serde_json::to_value(current)?;
        f(&mut doc)?;
        let mut updated: K = serde_json::from_value(doc)?;
        updated.meta_mut().resource_version = Some(self.next().to_string());
        objects.insert(key, updated.clone());
        Ok(updated)
    }
}

fn matches_selector<K: Resource>(obj: &K, selector: Option<&str>) -> bool {
    let Some(selector) = selector else {
        return true;
    };
    selector.split(',').filter(|s| !s.is_empty()).all(|term| {
        let (key, value) = term.split_once('=').unwrap_or((term, ""));
        obj.labels().get(key).map(String::as_str) == Some(value)
    })
}

#[async_trait]
impl<K> ObjectStore<K> for MemoryStore<K>
where
    K: Resource<DynamicType = ()> + Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    async fn get(&self, namespace: &str, name: &str) -> Result<K> {
        self.find(namespace, name)
            .ok_or_else(|| Error::not_found(K::kind(&()), namespace, name))
    }

    async fn list(&self, namespace: Option<&str>, label_selector: Option<&str>) -> Result<Vec<K>> {
        Ok(self
            .objects
            .lock()
            .unwrap()
            .iter()
            .filter(|((ns, _), _)| namespace.is_none_or(|n| n == ns))
            .filter(|(_, obj)| matches_selector(*obj, label_selector))
            .map(|(_, obj)| obj.clone())
            .collect())
    }

    async fn create(&self, namespace: &str, obj: &K) -> Result<K> {
        let mut obj = obj.clone();
        if obj.meta().name.is_none() {
            let prefix = obj.meta().generate_name.clone().unwrap_or_default();
            obj.meta_mut().name = Some(format!("{}{:05}", prefix, self.next()));
        }
        obj.meta_mut().namespace = Some(namespace.to_string());
        obj.meta_mut().uid = Some(format!("uid-{}", self.next()));
        obj.meta_mut().resource_version = Some(self.next().to_string());

        let key = (namespace.to_string(), obj.name_any());
        let mut objects = self.objects.lock().unwrap();
        if objects.contains_key(&key) {
            return Err(Error::Invalid(format!("{}/{} already exists", key.0, key.1)));
        }
        objects.insert(key, obj.clone());
        Ok(obj)
    }

    async fn replace(&self, namespace: &str, obj: &K) -> Result<K> {
        let replacement = serde_json::to_value(obj)?;
        self.update(namespace, &obj.name_any(), |doc| {
            *doc = replacement;
            Ok(())
        })
    }

    async fn patch_json(
        &self,
        namespace: &str,
        name: &str,
        patch: json_patch::Patch,
    ) -> Result<K> {
        self.update(namespace, name, |doc| {
            json_patch::patch(doc, &patch).map_err(|e| Error::Invalid(e.to_string()))
        })
    }

    async fn patch_status(
        &self,
        namespace: &str,
        name: &str,
        status: serde_json::Value,
    ) -> Result<K> {
        self.update(namespace, name, |doc| {
            json_patch::merge(doc, &serde_json::json!({ "status": status }));
            Ok(())
        })
    }

    async fn delete(&self, namespace: &str, name: &str) -> Result<()> {
        self.objects
            .lock()
            .unwrap()
            .remove(&(namespace.to_string(), name.to_string()))
            .map(|_| ())
            .ok_or_else(|| Error::not_found(K::kind(&()), namespace, name))
    }
}
