use crate::controller::object_key;
use crate::queue::WorkQueue;
use futures::{Stream, StreamExt};
use kube::Resource;
use kube::runtime::watcher;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

type Mapper<K> = Arc<dyn Fn(&K) -> Vec<String> + Send + Sync>;

/// Turns watch events for `K` into work queue keys.
pub struct EventDispatcher<K> {
    queue: Arc<WorkQueue>,
    mapper: Mapper<K>,
    /// Last seen metadata.generation per uid, when filtering on spec changes
    generations: Option<Mutex<HashMap<String, i64>>>,
}

impl<K> EventDispatcher<K>
where
    K: Resource + Send + 'static,
{
    /// Enqueues the key of every touched object.
    pub fn new(queue: Arc<WorkQueue>) -> Self {
        Self::with_mapper(queue, |obj: &K| vec![object_key(obj)])
    }

    /// Enqueues the keys `mapper` derives from every touched object, for
    /// controllers that react to changes of a related kind.
    pub fn with_mapper(
        queue: Arc<WorkQueue>,
        mapper: impl Fn(&K) -> Vec<String> + Send + Sync + 'static,
    ) -> Self {
        Self {
            queue,
            mapper: Arc::new(mapper),
            generations: None,
        }
    }

    /// Ignores updates that leave metadata.generation unchanged, such as
    /// status or annotation writes.
    pub fn only_on_generation_change(mut self) -> Self {
        self.generations = Some(Mutex::new(HashMap::new()));
        self
    }

    fn generation_changed(&self, obj: &K) -> bool {
        let Some(generations) = &self.generations else {
            return true;
        };
        let meta = obj.meta();
        let (Some(uid), Some(generation)) = (meta.uid.clone(), meta.generation) else {
            return true;
        };
        let mut generations = generations.lock().unwrap_or_else(|e| e.into_inner());
        generations.insert(uid, generation) != Some(generation)
    }

    fn forget_generation(&self, obj: &K) {
        if let (Some(generations), Some(uid)) = (&self.generations, &obj.meta().uid) {
            generations
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .remove(uid);
        }
    }

    fn enqueue(&self, obj: &K) {
        for key in (self.mapper)(obj) {
            debug!(key = %key, "Enqueueing");
            self.queue.add(key);
        }
    }

    pub fn handle(&self, event: watcher::Event<K>) {
        match event {
            watcher::Event::Apply(obj) | watcher::Event::InitApply(obj) => {
                if self.generation_changed(&obj) {
                    self.enqueue(&obj);
                }
            }
            watcher::Event::Delete(obj) => {
                self.forget_generation(&obj);
                self.enqueue(&obj);
            }
            watcher::Event::Init | watcher::Event::InitDone => {}
        }
    }

    /// Forwards events until the stream ends or `token` is cancelled.
    pub async fn run<S>(self, events: S, token: CancellationToken)
    where
        S: Stream<Item = Result<watcher::Event<K>, watcher::Error>> + Send,
    {
        let mut events = std::pin::pin!(events);
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                event = events.next() => match event {
                    Some(Ok(event)) => self.handle(event),
                    Some(Err(e)) => warn!(error = %e, "Watch stream error"),
                    None => break,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::Backoff;
    use crate::resources::{ImageImport, Tag, TagSpec};
    use kube::ResourceExt;

    fn tag(name: &str) -> Tag {
        let mut tag = Tag::new(
            name,
            TagSpec {
                from: "centos:7".to_string(),
                mirror: false,
                insecure: false,
                generation: 0,
            },
        );
        tag.metadata.namespace = Some("default".to_string());
        tag.metadata.uid = Some(format!("{}-uid", name));
        tag
    }

    #[tokio::test]
    async fn test_events_become_keys() {
        let queue = WorkQueue::new(Backoff::default());
        let dispatcher = EventDispatcher::<Tag>::new(Arc::clone(&queue));
        let events = futures::stream::iter(vec![
            Ok(watcher::Event::Init),
            Ok(watcher::Event::InitApply(tag("a"))),
            Ok(watcher::Event::InitDone),
            Ok(watcher::Event::Apply(tag("b"))),
            Ok(watcher::Event::Apply(tag("a"))),
            Ok(watcher::Event::Delete(tag("c"))),
        ]);
        dispatcher.run(events, CancellationToken::new()).await;

        assert_eq!(queue.len(), 3);
        let mut keys = Vec::new();
        while !queue.is_empty() {
            keys.push(queue.get().await.unwrap());
        }
        assert_eq!(keys, vec!["default/a", "default/b", "default/c"]);
    }

    #[tokio::test]
    async fn test_generation_filter_skips_status_updates() {
        let queue = WorkQueue::new(Backoff::default());
        let dispatcher =
            EventDispatcher::<Tag>::new(Arc::clone(&queue)).only_on_generation_change();
        let mut first = tag("a");
        first.metadata.generation = Some(1);

        dispatcher.handle(watcher::Event::Apply(first.clone()));
        assert_eq!(queue.get().await.as_deref(), Some("default/a"));
        queue.done("default/a");

        // status write, same generation
        dispatcher.handle(watcher::Event::Apply(first.clone()));
        assert!(queue.is_empty());

        first.metadata.generation = Some(2);
        dispatcher.handle(watcher::Event::Apply(first));
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test]
    async fn test_mapper_routes_to_owner() {
        let queue = WorkQueue::new(Backoff::default());
        let dispatcher =
            EventDispatcher::<ImageImport>::with_mapper(Arc::clone(&queue), |import| {
                import
                    .owner_image()
                    .map(|owner| {
                        format!("{}/{}", import.namespace().unwrap_or_default(), owner.name)
                    })
                    .into_iter()
                    .collect()
            });
        dispatcher.handle(watcher::Event::Apply(ImageImport::for_tag(&tag("app"))));
        assert_eq!(queue.get().await.as_deref(), Some("default/app"));
    }
}
