//! Rate-limited work queue with dedup and at-most-one-in-flight keys
//!
//! Queues carry object identities, not payloads. A key added while already
//! pending is coalesced; a key added while in flight is re-queued only after
//! the in-flight reconcile completes, so no key is ever processed twice
//! concurrently within one queue. Failed keys are re-added with per-key
//! exponential backoff and jitter; `forget` clears the backoff counter once
//! a key reconciles cleanly.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::Rng;
use tokio::sync::Notify;
use tracing::trace;

/// Per-key exponential backoff configuration for failed reconciles
#[derive(Clone, Debug)]
pub struct BackoffConfig {
    /// Delay before the first retry
    pub initial_delay: Duration,
    /// Upper bound on the retry delay
    pub max_delay: Duration,
    /// Multiplier applied per consecutive failure
    pub multiplier: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(5),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
        }
    }
}

impl BackoffConfig {
    /// Delay for the given consecutive-failure count, with 0.5x-1.5x jitter
    /// to avoid synchronized retry storms across keys.
    pub fn delay_for(&self, failures: u32) -> Duration {
        let exp = self.multiplier.powi(failures.min(32) as i32);
        let base = self.initial_delay.as_secs_f64() * exp;
        let capped = base.min(self.max_delay.as_secs_f64());
        let jitter = rand::thread_rng().gen_range(0.5..1.5);
        Duration::from_secs_f64(capped * jitter)
    }
}

struct Inner<K> {
    /// Keys waiting to be handed to a worker, in arrival order
    queue: VecDeque<K>,
    /// Keys pending processing (either queued or awaiting requeue)
    dirty: HashSet<K>,
    /// Keys currently held by a worker
    processing: HashSet<K>,
    /// Consecutive failures per key, cleared by `forget`
    failures: HashMap<K, u32>,
    shutting_down: bool,
}

/// Work queue with dedup, at-most-one-in-flight, and rate-limited retry
pub struct RateLimitingQueue<K> {
    name: String,
    inner: Mutex<Inner<K>>,
    notify: Notify,
    backoff: BackoffConfig,
}

impl<K> RateLimitingQueue<K>
where
    K: Clone + Eq + Hash + Debug + Send + 'static,
{
    /// Create a named queue with the default backoff configuration
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Self::with_backoff(name, BackoffConfig::default())
    }

    /// Create a named queue with a custom backoff configuration
    pub fn with_backoff(name: impl Into<String>, backoff: BackoffConfig) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            inner: Mutex::new(Inner {
                queue: VecDeque::new(),
                dirty: HashSet::new(),
                processing: HashSet::new(),
                failures: HashMap::new(),
                shutting_down: false,
            }),
            notify: Notify::new(),
            backoff,
        })
    }

    /// The queue name, used in worker log fields
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Add a key for processing.
    ///
    /// Never blocks. A key already pending is coalesced; a key in flight is
    /// marked for reprocessing once its current reconcile returns. Adds after
    /// shutdown are dropped.
    pub fn add(&self, key: K) {
        let mut inner = self.inner.lock().expect("queue lock poisoned");
        if inner.shutting_down {
            return;
        }
        if !inner.dirty.insert(key.clone()) {
            return;
        }
        if inner.processing.contains(&key) {
            // Requeued by `done` once the in-flight reconcile finishes.
            return;
        }
        inner.queue.push_back(key);
        drop(inner);
        self.notify.notify_one();
    }

    /// Re-add a key after a failed reconcile, delayed by per-key backoff.
    ///
    /// The delayed add is dropped if the queue shuts down first.
    pub fn add_rate_limited(self: &Arc<Self>, key: K) {
        let delay = {
            let mut inner = self.inner.lock().expect("queue lock poisoned");
            if inner.shutting_down {
                return;
            }
            let failures = inner.failures.entry(key.clone()).or_insert(0);
            let delay = self.backoff.delay_for(*failures);
            *failures += 1;
            delay
        };

        trace!(queue = %self.name, ?key, ?delay, "requeueing with backoff");
        let queue = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(key);
        });
    }

    /// Clear the failure counter for a key after a clean reconcile
    pub fn forget(&self, key: &K) {
        let mut inner = self.inner.lock().expect("queue lock poisoned");
        inner.failures.remove(key);
    }

    /// Block until a key is available, or return `None` once the queue is
    /// shut down and fully drained.
    ///
    /// The returned key is marked in flight; the caller must pair every
    /// successful `get` with exactly one `done`.
    pub async fn get(&self) -> Option<K> {
        loop {
            let notified = self.notify.notified();
            {
                let mut inner = self.inner.lock().expect("queue lock poisoned");
                if let Some(key) = inner.queue.pop_front() {
                    inner.dirty.remove(&key);
                    inner.processing.insert(key.clone());
                    let more = !inner.queue.is_empty();
                    drop(inner);
                    if more {
                        // Cascade the wakeup so sibling workers can pick up
                        // the remaining keys.
                        self.notify.notify_one();
                    }
                    return Some(key);
                }
                if inner.shutting_down {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Mark a key's reconcile finished.
    ///
    /// If the key was re-added while in flight it goes back on the queue
    /// immediately, preserving the at-most-one-in-flight invariant.
    pub fn done(&self, key: &K) {
        let mut inner = self.inner.lock().expect("queue lock poisoned");
        inner.processing.remove(key);
        if inner.dirty.contains(key) {
            inner.queue.push_back(key.clone());
            drop(inner);
            self.notify.notify_one();
        }
    }

    /// Number of keys waiting to be processed
    pub fn len(&self) -> usize {
        self.inner.lock().expect("queue lock poisoned").queue.len()
    }

    /// Whether no keys are waiting
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether the queue has no pending and no in-flight keys
    pub fn is_quiet(&self) -> bool {
        let inner = self.inner.lock().expect("queue lock poisoned");
        inner.queue.is_empty() && inner.processing.is_empty() && inner.dirty.is_empty()
    }

    /// Stop accepting new keys and wake blocked getters.
    ///
    /// Keys already queued are still handed out so workers drain before
    /// observing closure; delayed retries scheduled before shutdown are
    /// dropped on arrival.
    pub fn shut_down(&self) {
        {
            let mut inner = self.inner.lock().expect("queue lock poisoned");
            inner.shutting_down = true;
        }
        self.notify.notify_waiters();
    }

    /// Whether `shut_down` has been called
    pub fn is_shutting_down(&self) -> bool {
        self.inner.lock().expect("queue lock poisoned").shutting_down
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn get_returns_added_keys_in_order() {
        let queue = RateLimitingQueue::new("test");
        queue.add("a");
        queue.add("b");
        assert_eq!(queue.get().await, Some("a"));
        assert_eq!(queue.get().await, Some("b"));
    }

    #[tokio::test]
    async fn pending_keys_are_deduplicated() {
        let queue = RateLimitingQueue::new("test");
        queue.add("a");
        queue.add("a");
        assert_eq!(queue.len(), 1);

        let key = queue.get().await.unwrap();
        queue.done(&key);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn in_flight_key_is_requeued_only_after_done() {
        let queue = RateLimitingQueue::new("test");
        queue.add("a");

        let key = queue.get().await.unwrap();
        // Event arrives while the key is being reconciled.
        queue.add("a");
        assert!(queue.is_empty(), "in-flight key must not be double-queued");

        queue.done(&key);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.get().await, Some("a"));
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limited_adds_arrive_after_backoff() {
        let queue = RateLimitingQueue::with_backoff(
            "test",
            BackoffConfig {
                initial_delay: Duration::from_millis(100),
                max_delay: Duration::from_secs(10),
                multiplier: 2.0,
            },
        );
        queue.add("a");
        let key = queue.get().await.unwrap();
        queue.add_rate_limited(key.clone());
        queue.done(&key);

        assert!(queue.is_empty(), "retry must be delayed, not immediate");
        // Paused clock: sleeping past the maximum jittered delay fires the
        // pending retry timer.
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn backoff_grows_until_forgotten() {
        let backoff = BackoffConfig::default();
        let first = backoff.delay_for(0);
        let fifth = backoff.delay_for(4);
        assert!(fifth > first);
        assert!(backoff.delay_for(64) <= Duration::from_secs(45)); // max * 1.5 jitter

        let queue: Arc<RateLimitingQueue<&str>> = RateLimitingQueue::new("test");
        queue.add_rate_limited("a");
        queue.add_rate_limited("a");
        {
            let inner = queue.inner.lock().unwrap();
            assert_eq!(inner.failures.get("a"), Some(&2));
        }
        queue.forget(&"a");
        {
            let inner = queue.inner.lock().unwrap();
            assert!(inner.failures.get("a").is_none());
        }
    }

    #[tokio::test]
    async fn shutdown_drains_then_closes() {
        let queue = RateLimitingQueue::new("test");
        queue.add("a");
        queue.shut_down();

        // Already-queued work is still handed out.
        assert_eq!(queue.get().await, Some("a"));
        queue.done(&"a");

        // New work is rejected and getters observe closure.
        queue.add("b");
        assert_eq!(queue.get().await, None);
    }

    #[tokio::test]
    async fn shutdown_wakes_blocked_getters() {
        let queue: Arc<RateLimitingQueue<&str>> = RateLimitingQueue::new("test");
        let waiter = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.get().await })
        };
        tokio::task::yield_now().await;
        queue.shut_down();
        assert_eq!(waiter.await.unwrap(), None);
    }

    #[tokio::test]
    async fn concurrent_workers_never_share_a_key() {
        let queue: Arc<RateLimitingQueue<u32>> = RateLimitingQueue::new("test");
        let seen = Arc::new(Mutex::new(Vec::new()));

        let mut handles = Vec::new();
        for _ in 0..4 {
            let queue = Arc::clone(&queue);
            let seen = Arc::clone(&seen);
            handles.push(tokio::spawn(async move {
                while let Some(key) = queue.get().await {
                    seen.lock().unwrap().push(key);
                    tokio::task::yield_now().await;
                    queue.done(&key);
                }
            }));
        }

        for i in 0..100u32 {
            queue.add(i % 10); // heavy coalescing across 10 distinct keys
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        queue.shut_down();
        for handle in handles {
            handle.await.unwrap();
        }

        let seen = seen.lock().unwrap();
        assert!(!seen.is_empty());
        // Every distinct key was processed at least once.
        for i in 0..10u32 {
            assert!(seen.contains(&i), "key {i} never processed");
        }
    }
}
