//! Worker pools draining rate-limited work queues
//!
//! A pool runs a fixed number of long-lived tasks against one queue. Each
//! task pulls a key, invokes the reconciler, and classifies the result:
//! success and benign errors forget the key; anything else is transient and
//! re-enqueued with backoff. Workers exit once their queue is shut down and
//! drained.

use std::fmt::Debug;
use std::hash::Hash;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::queue::RateLimitingQueue;
use crate::Result;

/// A reconcile function invoked per dequeued key.
///
/// Implementations must re-derive truth from current external state: the key
/// only identifies what to look at, never what was observed when the event
/// fired. Reconciles for different keys run with no ordering guarantee.
#[async_trait]
pub trait Reconciler<K>: Send + Sync {
    /// Reconcile the object identified by `key`
    async fn reconcile(&self, key: K) -> Result<()>;
}

#[async_trait]
impl<K, F, Fut> Reconciler<K> for F
where
    K: Send + 'static,
    F: Fn(K) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = Result<()>> + Send,
{
    async fn reconcile(&self, key: K) -> Result<()> {
        self(key).await
    }
}

/// Handles of the tasks draining one queue
pub struct WorkerPool {
    name: String,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Number of worker tasks in this pool
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    /// Whether the pool has no workers
    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Wait for every worker in the pool to observe queue closure and exit
    pub async fn join(self) {
        for result in join_all(self.handles).await {
            // Workers never panic in normal operation; a join error here
            // means a reconciler implementation panicked.
            if let Err(err) = result {
                warn!(pool = %self.name, error = %err, "worker task aborted");
            }
        }
        debug!(pool = %self.name, "worker pool drained");
    }
}

/// Start `concurrency` workers draining `queue` through `reconciler`.
///
/// Returns immediately; the returned [`WorkerPool`] must be joined after the
/// queue is shut down to guarantee quiescence.
pub fn run_workers<K>(
    queue: Arc<RateLimitingQueue<K>>,
    reconciler: Arc<dyn Reconciler<K>>,
    concurrency: usize,
) -> WorkerPool
where
    K: Clone + Eq + Hash + Debug + Send + Sync + 'static,
{
    let name = queue.name().to_string();
    let mut handles = Vec::with_capacity(concurrency);
    for worker in 0..concurrency {
        let queue = Arc::clone(&queue);
        let reconciler = Arc::clone(&reconciler);
        handles.push(tokio::spawn(async move {
            worker_loop(queue, reconciler, worker).await;
        }));
    }
    info!(pool = %name, workers = concurrency, "worker pool started");
    WorkerPool { name, handles }
}

async fn worker_loop<K>(
    queue: Arc<RateLimitingQueue<K>>,
    reconciler: Arc<dyn Reconciler<K>>,
    worker: usize,
) where
    K: Clone + Eq + Hash + Debug + Send + 'static,
{
    while let Some(key) = queue.get().await {
        match reconciler.reconcile(key.clone()).await {
            Ok(()) => queue.forget(&key),
            Err(err) if err.is_benign() => {
                debug!(queue = %queue.name(), ?key, reason = %err, "skipping key");
                queue.forget(&key);
            }
            Err(err) => {
                warn!(queue = %queue.name(), ?key, error = %err, "reconcile failed, requeueing");
                queue.add_rate_limited(key.clone());
            }
        }
        queue.done(&key);
    }
    debug!(queue = %queue.name(), worker, "worker observed queue closure");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    struct Recording {
        calls: AtomicUsize,
        results: Mutex<Vec<Result<()>>>,
    }

    impl Recording {
        fn new(results: Vec<Result<()>>) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                results: Mutex::new(results),
            })
        }
    }

    #[async_trait]
    impl Reconciler<&'static str> for Recording {
        async fn reconcile(&self, _key: &'static str) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.results.lock().unwrap().pop().unwrap_or(Ok(()))
        }
    }

    #[tokio::test]
    async fn successful_keys_are_processed_once() {
        let queue = RateLimitingQueue::new("test");
        let reconciler = Recording::new(vec![]);
        let pool = run_workers(Arc::clone(&queue), reconciler.clone(), 2);

        queue.add("a");
        queue.add("b");
        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.shut_down();
        pool.join().await;

        assert_eq!(reconciler.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_errors_are_retried_until_success() {
        let queue = RateLimitingQueue::new("test");
        // Popped in reverse: fail twice, then succeed.
        let reconciler = Recording::new(vec![
            Ok(()),
            Err(Error::store("503")),
            Err(Error::store("503")),
        ]);
        let pool = run_workers(Arc::clone(&queue), reconciler.clone(), 1);

        queue.add("a");
        // Default backoff starts at 5ms; generously outwait both retries.
        tokio::time::sleep(Duration::from_secs(5)).await;
        queue.shut_down();
        pool.join().await;

        assert_eq!(reconciler.calls.load(Ordering::SeqCst), 3);
        assert!(queue.is_quiet());
    }

    #[tokio::test(start_paused = true)]
    async fn benign_errors_are_not_retried() {
        let queue = RateLimitingQueue::new("test");
        let reconciler = Recording::new(vec![Err(Error::object_gone("ns/a"))]);
        let pool = run_workers(Arc::clone(&queue), reconciler.clone(), 1);

        queue.add("a");
        tokio::time::sleep(Duration::from_secs(5)).await;
        queue.shut_down();
        pool.join().await;

        assert_eq!(reconciler.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn closure_reconcilers_are_accepted() {
        let queue = RateLimitingQueue::new("test");
        let seen: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let seen_by_fn = Arc::clone(&seen);
        let reconciler = Arc::new(move |key: &'static str| {
            let seen = Arc::clone(&seen_by_fn);
            async move {
                seen.lock().unwrap().push(key.to_string());
                Ok(())
            }
        });

        let pool = run_workers(Arc::clone(&queue), reconciler, 1);
        queue.add("a");
        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.shut_down();
        pool.join().await;

        assert_eq!(seen.lock().unwrap().as_slice(), ["a".to_string()]);
    }
}
