//! Work queue with per-key serialization and a bounded worker pool
//!
//! A key is held by at most one worker. Adding a key that is waiting is a
//! no-op; adding a key that is being processed marks it dirty, and it is
//! queued again once the worker calls [`WorkQueue::done`].

use std::collections::{HashMap, HashSet, VecDeque};
use std::future::Future;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::Notify;
use tracing::debug;

use super::object::ObjectKey;

struct QueueState<T> {
    queue: VecDeque<T>,
    queued: HashSet<T>,
    active: HashSet<T>,
    dirty: HashSet<T>,
    shutting_down: bool,
}

impl<T> Default for QueueState<T> {
    fn default() -> Self {
        Self {
            queue: VecDeque::new(),
            queued: HashSet::new(),
            active: HashSet::new(),
            dirty: HashSet::new(),
            shutting_down: false,
        }
    }
}

pub struct WorkQueue<T> {
    state: Mutex<QueueState<T>>,
    notify: Notify,
}

impl<T> Default for WorkQueue<T> {
    fn default() -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
        }
    }
}

impl<T> WorkQueue<T>
where
    T: Clone + Eq + Hash + Send + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, QueueState<T>> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn add(&self, key: T) {
        let mut state = self.lock();
        if state.shutting_down {
            return;
        }
        if state.active.contains(&key) {
            state.dirty.insert(key);
            return;
        }
        if state.queued.insert(key.clone()) {
            state.queue.push_back(key);
            drop(state);
            self.notify.notify_one();
        }
    }

    /// Add `key` once `delay` has elapsed
    pub fn add_after(self: &Arc<Self>, key: T, delay: Duration) {
        if delay.is_zero() {
            self.add(key);
            return;
        }
        let queue = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(key);
        });
    }

    /// Wait for the next key; `None` once the queue is shut down
    pub async fn next(&self) -> Option<T> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.lock();
                if state.shutting_down {
                    return None;
                }
                if let Some(key) = state.queue.pop_front() {
                    state.queued.remove(&key);
                    state.active.insert(key.clone());
                    return Some(key);
                }
            }

            notified.await;
        }
    }

    /// Release a key taken with [`WorkQueue::next`]
    pub fn done(&self, key: &T) {
        let mut state = self.lock();
        state.active.remove(key);
        if state.dirty.remove(key) && !state.shutting_down && state.queued.insert(key.clone()) {
            state.queue.push_back(key.clone());
            drop(state);
            self.notify.notify_one();
        }
    }

    pub fn shutdown(&self) {
        self.lock().shutting_down = true;
        self.notify.notify_waiters();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.lock().shutting_down
    }

    /// Keys waiting to be picked up
    pub fn len(&self) -> usize {
        self.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_active(&self, key: &T) -> bool {
        self.lock().active.contains(key)
    }
}

/// Newest generation observed per resource
#[derive(Default)]
pub struct GenerationLedger {
    seen: Mutex<HashMap<ObjectKey, i64>>,
}

impl GenerationLedger {
    fn lock(&self) -> MutexGuard<'_, HashMap<ObjectKey, i64>> {
        match self.seen.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn observe(&self, key: &ObjectKey, generation: Option<i64>) {
        if let Some(generation) = generation {
            let mut seen = self.lock();
            let entry = seen.entry(key.clone()).or_insert(generation);
            *entry = (*entry).max(generation);
        }
    }

    /// True when a newer generation than `generation` has been observed
    pub fn is_stale(&self, key: &ObjectKey, generation: Option<i64>) -> bool {
        let Some(generation) = generation else {
            return false;
        };
        self.lock()
            .get(key)
            .map(|newest| *newest > generation)
            .unwrap_or(false)
    }

    pub fn forget(&self, key: &ObjectKey) {
        self.lock().remove(key);
    }
}

/// Run `workers` tasks draining `queue` until it shuts down
///
/// The handler returns when the key should be processed again, if at all.
pub async fn run_workers<T, F, Fut>(queue: Arc<WorkQueue<T>>, workers: usize, handler: F)
where
    T: Clone + Eq + Hash + Send + Sync + std::fmt::Display + 'static,
    F: Fn(T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Option<Duration>> + Send + 'static,
{
    let handler = Arc::new(handler);
    let tasks = (0..workers.max(1)).map(|id| {
        let queue = Arc::clone(&queue);
        let handler = Arc::clone(&handler);
        tokio::spawn(async move {
            while let Some(key) = queue.next().await {
                let requeue_after = handler(key.clone()).await;
                queue.done(&key);
                if let Some(delay) = requeue_after {
                    debug!(worker = id, key = %key, delay_ms = delay.as_millis() as u64, "Requeue");
                    queue.add_after(key, delay);
                }
            }
            debug!(worker = id, "Worker stopped");
        })
    });
    join_all(tasks).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio_test::{assert_pending, assert_ready_eq, task};

    #[test]
    fn test_add_deduplicates_waiting_keys() {
        let queue = WorkQueue::new();
        queue.add("a");
        queue.add("a");
        queue.add("b");
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn test_next_is_pending_until_add() {
        let queue = WorkQueue::<&str>::new();
        let mut next = task::spawn(queue.next());
        assert_pending!(next.poll());

        queue.add("a");
        assert!(next.is_woken());
        assert_ready_eq!(next.poll(), Some("a"));
    }

    #[test]
    fn test_active_key_is_not_handed_out_twice() {
        let queue = WorkQueue::new();
        queue.add("a");

        let mut first = task::spawn(queue.next());
        assert_ready_eq!(first.poll(), Some("a"));

        queue.add("a");
        assert_eq!(queue.len(), 0);

        let mut second = task::spawn(queue.next());
        assert_pending!(second.poll());

        queue.done(&"a");
        assert!(second.is_woken());
        assert_ready_eq!(second.poll(), Some("a"));
    }

    #[test]
    fn test_done_without_dirty_does_not_requeue() {
        let queue = WorkQueue::new();
        queue.add("a");
        let mut next = task::spawn(queue.next());
        assert_ready_eq!(next.poll(), Some("a"));
        queue.done(&"a");
        assert!(queue.is_empty());
        assert!(!queue.is_active(&"a"));
    }

    #[test]
    fn test_shutdown_wakes_waiters_and_rejects_adds() {
        let queue = WorkQueue::<&str>::new();
        let mut next = task::spawn(queue.next());
        assert_pending!(next.poll());

        queue.shutdown();
        assert!(next.is_woken());
        assert_ready_eq!(next.poll(), None);

        queue.add("a");
        assert!(queue.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_add_after_delays() {
        let queue = Arc::new(WorkQueue::new());
        queue.add_after("a", Duration::from_secs(10));
        tokio::task::yield_now().await;
        assert!(queue.is_empty());

        tokio::time::advance(Duration::from_secs(11)).await;
        tokio::task::yield_now().await;
        assert_eq!(queue.next().await, Some("a"));
    }

    #[tokio::test]
    async fn test_workers_never_process_a_key_concurrently() {
        let queue = Arc::new(WorkQueue::<String>::new());
        let in_flight = Arc::new(AtomicUsize::new(0));
        let overlaps = Arc::new(AtomicUsize::new(0));
        let processed = Arc::new(AtomicUsize::new(0));

        let pool = {
            let in_flight = in_flight.clone();
            let overlaps = overlaps.clone();
            let processed = processed.clone();
            tokio::spawn(run_workers(queue.clone(), 4, move |_key: String| {
                let in_flight = in_flight.clone();
                let overlaps = overlaps.clone();
                let processed = processed.clone();
                async move {
                    if in_flight.fetch_add(1, Ordering::SeqCst) > 0 {
                        overlaps.fetch_add(1, Ordering::SeqCst);
                    }
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    in_flight.fetch_sub(1, Ordering::SeqCst);
                    processed.fetch_add(1, Ordering::SeqCst);
                    None
                }
            }))
        };

        for _ in 0..20 {
            queue.add("same".to_string());
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        while queue.is_active(&"same".to_string()) || !queue.is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        queue.shutdown();
        pool.await.unwrap();

        assert_eq!(overlaps.load(Ordering::SeqCst), 0);
        assert!(processed.load(Ordering::SeqCst) >= 2);
    }

    #[test]
    fn test_generation_ledger() {
        let ledger = GenerationLedger::default();
        let key = ObjectKey::new("DatabaseSecretEngineStaticRole", "team-a", "db-role-a");

        ledger.observe(&key, Some(2));
        ledger.observe(&key, Some(1));
        assert!(ledger.is_stale(&key, Some(1)));
        assert!(!ledger.is_stale(&key, Some(2)));
        assert!(!ledger.is_stale(&key, None));

        ledger.forget(&key);
        assert!(!ledger.is_stale(&key, Some(1)));
    }
}
