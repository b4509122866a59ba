//! Generic controller: a work queue fed by watch events, drained by a bounded
//! pool of workers that fetch the live object and hand it to a [`Syncer`].

pub mod dispatcher;

pub use dispatcher::EventDispatcher;

use crate::error::{Error, Result};
use crate::metrics::SyncCounters;
use crate::queue::{Backoff, WorkQueue};
use crate::store::SharedStore;
use async_trait::async_trait;
use kube::{Resource, ResourceExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Semaphore, watch};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{Instrument, debug, error, info, info_span, warn};

/// Domain logic for one resource kind. Syncs must be idempotent: a key can be
/// delivered again at any time and always carries the latest object state.
#[async_trait]
pub trait Syncer<K>: Send + Sync {
    async fn sync(&self, obj: K) -> Result<()>;
}

#[derive(Debug, Clone, Copy)]
pub struct ControllerOptions {
    /// Number of objects synced concurrently
    pub tokens: usize,
    /// Deadline for fetching and syncing a single object
    pub timeout: Duration,
    pub backoff: Backoff,
}

impl ControllerOptions {
    pub fn new(tokens: usize, timeout: Duration) -> Self {
        Self {
            tokens,
            timeout,
            backoff: Backoff::default(),
        }
    }
}

struct Inner<K> {
    name: &'static str,
    queue: Arc<WorkQueue>,
    store: SharedStore<K>,
    syncer: Arc<dyn Syncer<K>>,
    timeout: Duration,
    counters: Option<SyncCounters>,
}

pub struct Controller<K> {
    inner: Inner<K>,
    tokens: usize,
    leadership: Option<watch::Receiver<bool>>,
}

impl<K> Controller<K>
where
    K: Send + Sync + 'static,
{
    pub fn new(
        name: &'static str,
        store: SharedStore<K>,
        syncer: Arc<dyn Syncer<K>>,
        options: ControllerOptions,
    ) -> Self {
        Self {
            inner: Inner {
                name,
                queue: WorkQueue::new(options.backoff),
                store,
                syncer,
                timeout: options.timeout,
                counters: None,
            },
            tokens: options.tokens.max(1),
            leadership: None,
        }
    }

    /// Only run the event loop while this replica holds the leader lease.
    pub fn requires_leadership(mut self, leadership: watch::Receiver<bool>) -> Self {
        self.leadership = Some(leadership);
        self
    }

    pub fn name(&self) -> &'static str {
        self.inner.name
    }

    pub fn queue(&self) -> Arc<WorkQueue> {
        Arc::clone(&self.inner.queue)
    }

    pub fn with_counters(mut self, counters: SyncCounters) -> Self {
        self.inner.counters = Some(counters);
        self
    }

    /// Runs until `token` is cancelled. Returns only after every dequeued key
    /// has been processed.
    ///
    /// A controller that requires leadership only processes keys while the
    /// replica leads. Losing the lease ends the term: no further keys are
    /// dequeued, in-flight syncs finish, the queue is cleared and the
    /// controller waits to be elected again.
    pub async fn start(self, token: CancellationToken) {
        let name = self.inner.name;
        let tokens = self.tokens;
        let inner = Arc::new(self.inner);
        let Some(mut leadership) = self.leadership else {
            Inner::run_term(&inner, tokens, &token, None).await;
            info!(controller = name, "Controller stopped");
            return;
        };

        loop {
            info!(controller = name, "Waiting for leadership");
            let elected = tokio::select! {
                _ = token.cancelled() => break,
                res = leadership.wait_for(|leader| *leader) => res.is_ok(),
            };
            if !elected {
                warn!(controller = name, "Leader election stopped");
                break;
            }

            let term = Inner::run_term(&inner, tokens, &token, Some(leadership.clone())).await;
            if term == Term::Shutdown {
                break;
            }
            warn!(controller = name, "Lost leadership, discarding queued keys");
            inner.queue.clear();
        }
        info!(controller = name, "Controller stopped");
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Term {
    Shutdown,
    Demoted,
}

impl<K> Inner<K>
where
    K: Send + Sync + 'static,
{
    /// Dispatches keys to at most `tokens` workers until shutdown or demotion,
    /// then waits for the workers.
    async fn run_term(
        self: &Arc<Self>,
        tokens: usize,
        token: &CancellationToken,
        leadership: Option<watch::Receiver<bool>>,
    ) -> Term {
        let name = self.name;
        let queue = Arc::clone(&self.queue);
        info!(controller = name, tokens, "Starting controller");

        let semaphore = Arc::new(Semaphore::new(tokens));
        let workers = TaskTracker::new();
        let demoted = async move {
            match leadership {
                Some(mut leadership) => {
                    let _ = leadership.wait_for(|leader| !*leader).await;
                }
                None => std::future::pending().await,
            }
        };
        tokio::pin!(demoted);
        let mut shutting_down = false;

        let term = loop {
            let key = tokio::select! {
                biased;
                _ = &mut demoted, if !shutting_down => break Term::Demoted,
                _ = token.cancelled(), if !shutting_down => {
                    // queued keys are still handed out until the queue is empty
                    queue.shut_down();
                    shutting_down = true;
                    continue;
                }
                key = queue.get() => key,
            };
            let Some(key) = key else {
                break Term::Shutdown;
            };

            let permit = tokio::select! {
                biased;
                _ = &mut demoted, if !shutting_down => {
                    queue.done(&key);
                    break Term::Demoted;
                }
                permit = Arc::clone(&semaphore).acquire_owned() => permit,
            };
            let Ok(permit) = permit else {
                queue.done(&key);
                break Term::Shutdown;
            };

            let inner = Arc::clone(self);
            let span = info_span!("sync", controller = name, key = %key);
            workers.spawn(
                async move {
                    inner.process(key).await;
                    drop(permit);
                }
                .instrument(span),
            );
        };

        workers.close();
        workers.wait().await;
        term
    }

    async fn process(&self, key: String) {
        let result = match split_key(&key) {
            Ok((namespace, name)) => self.sync(namespace, name).await,
            Err(e) => {
                error!(error = %e, "Dropping malformed key");
                self.queue.forget(&key);
                self.queue.done(&key);
                return;
            }
        };

        if let Some(counters) = &self.counters {
            counters.record(result.is_ok());
        }
        match result {
            Ok(()) => self.queue.forget(&key),
            Err(e) => {
                warn!(
                    error = %e,
                    requeues = self.queue.num_requeues(&key),
                    "Sync failed, requeueing"
                );
                self.queue.add_rate_limited(key.clone());
            }
        }
        self.queue.done(&key);
    }

    async fn sync(&self, namespace: &str, name: &str) -> Result<()> {
        let work = async {
            let obj = match self.store.get(namespace, name).await {
                Ok(obj) => obj,
                Err(e) if e.is_not_found() => {
                    debug!("Object no longer exists, nothing to do");
                    return Ok(());
                }
                Err(e) => return Err(e),
            };
            self.syncer.sync(obj).await
        };
        tokio::time::timeout(self.timeout, work)
            .await
            .map_err(|_| Error::Timeout(self.timeout))?
    }
}

/// Queue key of a namespaced object.
pub fn object_key<K: Resource>(obj: &K) -> String {
    format!("{}/{}", obj.namespace().unwrap_or_default(), obj.name_any())
}

pub fn split_key(key: &str) -> Result<(&str, &str)> {
    match key.split_once('/') {
        Some((namespace, name))
            if !namespace.is_empty() && !name.is_empty() && !name.contains('/') =>
        {
            Ok((namespace, name))
        }
        _ => Err(Error::InvalidKey(key.to_string())),
    }
}
