//! Deduplicating work queue of object keys with delayed and rate limited
//! re-delivery.
//!
//! A key is handed to at most one worker at a time: adding a key that is being
//! processed marks it dirty, and it is queued again once the worker calls
//! [`WorkQueue::done`].

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

/// How long to wait before re-delivering a key that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    /// `base * 2^failures`, capped at `max`.
    Exponential { base: Duration, max: Duration },
    Fixed(Duration),
}

impl Default for Backoff {
    fn default() -> Self {
        Backoff::Exponential {
            base: Duration::from_millis(5),
            max: Duration::from_secs(1000),
        }
    }
}

impl Backoff {
    pub fn delay(&self, failures: u32) -> Duration {
        match *self {
            Backoff::Fixed(delay) => delay,
            Backoff::Exponential { base, max } => {
                let factor = 2u32.checked_pow(failures).unwrap_or(u32::MAX);
                base.checked_mul(factor).map_or(max, |d| d.min(max))
            }
        }
    }
}

#[derive(Default)]
struct State {
    queue: VecDeque<String>,
    dirty: HashSet<String>,
    processing: HashSet<String>,
    failures: HashMap<String, u32>,
    shutting_down: bool,
    /// Cancels pending `add_after` timers.
    delayed: CancellationToken,
}

pub struct WorkQueue {
    state: Mutex<State>,
    notify: Notify,
    backoff: Backoff,
}

impl WorkQueue {
    pub fn new(backoff: Backoff) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(State::default()),
            notify: Notify::new(),
            backoff,
        })
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        // the state stays consistent across a panicking holder
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Enqueues `key` unless it is already waiting to be processed.
    pub fn add(&self, key: impl Into<String>) {
        let key = key.into();
        let mut state = self.lock();
        if state.shutting_down || !state.dirty.insert(key.clone()) {
            return;
        }
        if state.processing.contains(&key) {
            return;
        }
        state.queue.push_back(key);
        drop(state);
        self.notify.notify_one();
    }

    /// Enqueues `key` once `delay` has elapsed.
    pub fn add_after(self: &Arc<Self>, key: impl Into<String>, delay: Duration) {
        let key = key.into();
        if delay.is_zero() {
            return self.add(key);
        }
        let cancelled = {
            let state = self.lock();
            if state.shutting_down {
                return;
            }
            state.delayed.clone()
        };
        let queue = Arc::clone(self);
        tokio::spawn(async move {
            tokio::select! {
                _ = cancelled.cancelled() => {}
                _ = tokio::time::sleep(delay) => queue.add(key),
            }
        });
    }

    /// Enqueues `key` after a delay that grows with each consecutive failure.
    pub fn add_rate_limited(self: &Arc<Self>, key: impl Into<String>) {
        let key = key.into();
        let delay = {
            let mut state = self.lock();
            let failures = state.failures.entry(key.clone()).or_insert(0);
            let delay = self.backoff.delay(*failures);
            *failures = failures.saturating_add(1);
            delay
        };
        self.add_after(key, delay);
    }

    /// Clears the failure history of `key`.
    pub fn forget(&self, key: &str) {
        self.lock().failures.remove(key);
    }

    pub fn num_requeues(&self, key: &str) -> u32 {
        self.lock().failures.get(key).copied().unwrap_or(0)
    }

    /// Waits for the next key. Returns `None` once the queue is shut down and
    /// every queued key has been handed out.
    pub async fn get(&self) -> Option<String> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.lock();
                if let Some(key) = state.queue.pop_front() {
                    state.dirty.remove(&key);
                    state.processing.insert(key.clone());
                    let more = !state.queue.is_empty();
                    drop(state);
                    if more {
                        self.notify.notify_one();
                    }
                    return Some(key);
                }
                if state.shutting_down {
                    return None;
                }
            }

            notified.await;
        }
    }

    /// Marks `key` as processed. A key added while it was processing is queued again.
    pub fn done(&self, key: &str) {
        let mut state = self.lock();
        state.processing.remove(key);
        if state.dirty.contains(key) {
            state.queue.push_back(key.to_string());
            drop(state);
            self.notify.notify_one();
        }
    }

    /// Stops accepting keys and wakes every waiting [`WorkQueue::get`].
    pub fn shut_down(&self) {
        let delayed = {
            let mut state = self.lock();
            state.shutting_down = true;
            state.delayed.clone()
        };
        delayed.cancel();
        self.notify.notify_waiters();
    }

    /// Drops every queued and delayed key together with the failure history.
    /// Keys currently handed out stay in flight until [`WorkQueue::done`],
    /// which no longer re-queues them.
    pub fn clear(&self) {
        let delayed = {
            let mut state = self.lock();
            state.queue.clear();
            state.dirty.clear();
            state.failures.clear();
            std::mem::take(&mut state.delayed)
        };
        delayed.cancel();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.lock().shutting_down
    }

    pub fn len(&self) -> usize {
        self.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_add_deduplicates() {
        let queue = WorkQueue::new(Backoff::default());
        queue.add("ns/a");
        queue.add("ns/a");
        queue.add("ns/b");
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.get().await.as_deref(), Some("ns/a"));
        assert_eq!(queue.get().await.as_deref(), Some("ns/b"));
    }

    #[tokio::test]
    async fn test_add_while_processing_requeues_on_done() {
        let queue = WorkQueue::new(Backoff::default());
        queue.add("ns/a");
        let key = queue.get().await.unwrap();
        queue.add("ns/a");
        queue.add("ns/a");
        assert!(queue.is_empty());
        queue.done(&key);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.get().await.as_deref(), Some("ns/a"));
    }

    #[tokio::test]
    async fn test_shutdown_unblocks_waiters() {
        let queue = WorkQueue::new(Backoff::default());
        let waiter = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.get().await })
        };
        tokio::task::yield_now().await;
        queue.shut_down();
        assert_eq!(waiter.await.unwrap(), None);
        queue.add("ns/a");
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_drains_queued_keys() {
        let queue = WorkQueue::new(Backoff::default());
        queue.add("ns/a");
        queue.shut_down();
        assert_eq!(queue.get().await.as_deref(), Some("ns/a"));
        assert_eq!(queue.get().await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_clear_drops_pending_and_delayed_keys() {
        let queue = WorkQueue::new(Backoff::Fixed(Duration::from_secs(5)));
        queue.add("ns/a");
        queue.add("ns/b");
        let key = queue.get().await.unwrap();
        queue.add("ns/b");
        queue.add_rate_limited("ns/c");

        queue.clear();
        queue.done(&key);
        assert!(queue.is_empty());
        assert_eq!(queue.num_requeues("ns/c"), 0);

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(queue.is_empty());

        queue.add("ns/d");
        assert_eq!(queue.get().await.as_deref(), Some("ns/d"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_add_after_delays_delivery() {
        let queue = WorkQueue::new(Backoff::default());
        queue.add_after("ns/a", Duration::from_secs(10));
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(queue.is_empty());
        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limited_backoff_and_forget() {
        let queue = WorkQueue::new(Backoff::Exponential {
            base: Duration::from_secs(1),
            max: Duration::from_secs(60),
        });
        queue.add_rate_limited("ns/a");
        queue.add_rate_limited("ns/a");
        queue.add_rate_limited("ns/a");
        assert_eq!(queue.num_requeues("ns/a"), 3);
        queue.forget("ns/a");
        assert_eq!(queue.num_requeues("ns/a"), 0);
    }

    #[test]
    fn test_backoff_delay() {
        let backoff = Backoff::Exponential {
            base: Duration::from_millis(5),
            max: Duration::from_secs(1),
        };
        assert_eq!(backoff.delay(0), Duration::from_millis(5));
        assert_eq!(backoff.delay(3), Duration::from_millis(40));
        assert_eq!(backoff.delay(20), Duration::from_secs(1));
        assert_eq!(backoff.delay(64), Duration::from_secs(1));
        assert_eq!(
            Backoff::Fixed(Duration::from_secs(3)).delay(7),
            Duration::from_secs(3)
        );
    }
}
