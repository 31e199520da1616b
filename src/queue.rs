//! A deduplicating, rate-limited work queue.
//!
//! Keys added while queued coalesce into a single entry; keys added while a
//! worker holds them are parked and re-queued when that worker calls
//! [`WorkQueue::done`], so at most one worker ever processes a given key at a
//! time. Failed keys re-enter through [`WorkQueue::add_rate_limited`] with
//! per-key exponential backoff that [`WorkQueue::forget`] resets.

use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time;

const BASE_DELAY: Duration = Duration::from_millis(5);
const MAX_DELAY: Duration = Duration::from_secs(1000);

pub struct WorkQueue<T> {
    state: Mutex<State<T>>,
    wakeup: Notify,
    base_delay: Duration,
    max_delay: Duration,
}

struct State<T> {
    queue: VecDeque<T>,
    dirty: HashSet<T>,
    processing: HashSet<T>,
    failures: HashMap<T, u32>,
    shutdown: bool,
}

// === impl WorkQueue ===

impl<T> WorkQueue<T>
where
    T: Clone + Eq + Hash + Send + 'static,
{
    pub fn new() -> Self {
        Self::with_backoff(BASE_DELAY, MAX_DELAY)
    }

    pub fn with_backoff(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            state: Mutex::new(State {
                queue: VecDeque::new(),
                dirty: HashSet::new(),
                processing: HashSet::new(),
                failures: HashMap::new(),
                shutdown: false,
            }),
            wakeup: Notify::new(),
            base_delay,
            max_delay,
        }
    }

    /// Enqueues a key. Keys already queued or parked behind an in-flight
    /// worker coalesce.
    pub fn add(&self, key: T) {
        {
            let mut state = self.state.lock();
            if state.shutdown || !state.dirty.insert(key.clone()) {
                return;
            }
            if state.processing.contains(&key) {
                return;
            }
            state.queue.push_back(key);
        }
        self.wakeup.notify_one();
    }

    /// Waits for the next key. Returns `None` once the queue has shut down.
    pub async fn get(&self) -> Option<T> {
        loop {
            let notified = self.wakeup.notified();
            tokio::pin!(notified);
            // Register for a wakeup before inspecting the queue so a
            // notification between the check and the await is not lost.
            let _ = notified.as_mut().enable();

            {
                let mut state = self.state.lock();
                if let Some(key) = state.queue.pop_front() {
                    state.dirty.remove(&key);
                    state.processing.insert(key.clone());
                    if !state.queue.is_empty() {
                        self.wakeup.notify_one();
                    }
                    return Some(key);
                }
                if state.shutdown {
                    return None;
                }
            }

            notified.await;
        }
    }

    /// Releases a key obtained from [`WorkQueue::get`]. If the key was
    /// re-added while in flight, it is queued again.
    pub fn done(&self, key: &T) {
        let requeued = {
            let mut state = self.state.lock();
            state.processing.remove(key);
            if !state.shutdown && state.dirty.contains(key) {
                state.queue.push_back(key.clone());
                true
            } else {
                false
            }
        };
        if requeued {
            self.wakeup.notify_one();
        }
    }

    /// Clears the key's failure history so its next retry starts from the
    /// base delay.
    pub fn forget(&self, key: &T) {
        self.state.lock().failures.remove(key);
    }

    /// Re-enqueues a failed key after an exponential per-key delay.
    pub fn add_rate_limited(self: &Arc<Self>, key: T) {
        let delay = {
            let mut state = self.state.lock();
            if state.shutdown {
                return;
            }
            let failures = state.failures.entry(key.clone()).or_insert(0);
            *failures += 1;
            backoff(*failures, self.base_delay, self.max_delay)
        };

        let queue = Arc::clone(self);
        tokio::spawn(async move {
            time::sleep(delay).await;
            queue.add(key);
        });
    }

    /// Stops the queue: the backlog is dropped, waiting getters observe
    /// `None`, and keys already in flight drain through [`WorkQueue::done`].
    pub fn shut_down(&self) {
        {
            let mut state = self.state.lock();
            state.shutdown = true;
            state.queue.clear();
            state.dirty.clear();
        }
        self.wakeup.notify_waiters();
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.state.lock().queue.len()
    }
}

fn backoff(failures: u32, base: Duration, max: Duration) -> Duration {
    let exp = failures.saturating_sub(1).min(31);
    base.checked_mul(1u32 << exp)
        .map_or(max, |delay| delay.min(max))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn delivers_in_insertion_order() {
        let q = WorkQueue::new();
        q.add("a");
        q.add("b");
        assert_eq!(q.get().await, Some("a"));
        assert_eq!(q.get().await, Some("b"));
    }

    #[tokio::test]
    async fn duplicate_adds_coalesce() {
        let q = WorkQueue::new();
        q.add("a");
        q.add("a");
        assert_eq!(q.get().await, Some("a"));
        assert_eq!(q.len(), 0);
        q.done(&"a");
        assert_eq!(q.len(), 0);
    }

    #[tokio::test]
    async fn key_added_while_in_flight_requeues_on_done() {
        let q = WorkQueue::new();
        q.add("a");
        let key = q.get().await.unwrap();

        // The key is in flight, so these park rather than queue.
        q.add("a");
        q.add("a");
        assert_eq!(q.len(), 0);

        q.done(&key);
        assert_eq!(q.len(), 1);
        assert_eq!(q.get().await, Some("a"));
    }

    #[tokio::test]
    async fn shutdown_drops_the_backlog_and_wakes_getters() {
        let q = Arc::new(WorkQueue::new());
        q.add("a");

        let waiter = {
            let q = Arc::clone(&q);
            tokio::spawn(async move {
                // Drain the one queued key, then block on an empty queue.
                assert_eq!(q.get().await, Some("a"));
                q.done(&"a");
                q.get().await
            })
        };

        tokio::task::yield_now().await;
        q.shut_down();
        assert_eq!(waiter.await.unwrap(), None);
        assert_eq!(q.get().await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limited_keys_return_after_a_delay() {
        let q = Arc::new(WorkQueue::with_backoff(
            Duration::from_millis(5),
            Duration::from_secs(1000),
        ));
        q.add_rate_limited("a");
        assert_eq!(q.get().await, Some("a"));
        q.done(&"a");
    }

    #[tokio::test(start_paused = true)]
    async fn backoff_doubles_until_forgotten() {
        let base = Duration::from_millis(5);
        let max = Duration::from_secs(1000);
        assert_eq!(backoff(1, base, max), Duration::from_millis(5));
        assert_eq!(backoff(2, base, max), Duration::from_millis(10));
        assert_eq!(backoff(5, base, max), Duration::from_millis(80));
        assert_eq!(backoff(60, base, max), max);

        let q = Arc::new(WorkQueue::with_backoff(base, max));
        q.add_rate_limited("a");
        assert_eq!(q.get().await, Some("a"));
        q.done(&"a");

        // A success resets the failure count for subsequent retries.
        q.forget(&"a");
        assert_eq!(q.state.lock().failures.get(&"a"), None);
    }
}
