use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, RwLock};
use std::time::{Duration, Instant};

use ahash::AHashSet;

use crate::Result;

/// Snapshot-on-write holder. Readers get an `Arc` to the current value
/// and keep traversing it while a writer publishes a replacement; they
/// observe either the old or the new object, never a torn one.
#[derive(Debug)]
pub struct ThreadSafeHolder<T> {
    inner: RwLock<Arc<T>>,
}

impl<T> ThreadSafeHolder<T> {
    pub fn new(value: T) -> Self {
        Self {
            inner: RwLock::new(Arc::new(value)),
        }
    }

    pub fn get(&self) -> Arc<T> {
        self.inner.read().unwrap().clone()
    }

    pub fn set(&self, value: T) {
        self.set_shared(Arc::new(value));
    }

    pub fn set_shared(&self, value: Arc<T>) {
        *self.inner.write().unwrap() = value;
    }
}

/// Multi-producer multi-consumer queue with blocking pop. Closing wakes
/// every waiter; a closed, drained queue pops `None`.
#[derive(Debug)]
pub struct BlockingQueue<T> {
    state: Mutex<QueueState<T>>,
    available: Condvar,
}

#[derive(Debug)]
struct QueueState<T> {
    items: VecDeque<T>,
    closed: bool,
}

impl<T> Default for BlockingQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> BlockingQueue<T> {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(QueueState {
                items: VecDeque::new(),
                closed: false,
            }),
            available: Condvar::new(),
        }
    }

    pub fn push(&self, item: T) {
        let mut state = self.state.lock().unwrap();

        debug_assert!(!state.closed);
        state.items.push_back(item);
        self.available.notify_one();
    }

    pub fn pop(&self) -> Option<T> {
        let mut state = self.state.lock().unwrap();

        loop {
            if let Some(item) = state.items.pop_front() {
                return Some(item);
            }

            if state.closed {
                return None;
            }

            state = self.available.wait(state).unwrap();
        }
    }

    pub fn try_pop(&self) -> Option<T> {
        self.state.lock().unwrap().items.pop_front()
    }

    pub fn close(&self) {
        self.state.lock().unwrap().closed = true;
        self.available.notify_all();
    }

    pub fn len(&self) -> usize {
        self.state.lock().unwrap().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().unwrap().items.is_empty()
    }
}

/// One-shot awaitable shared between a submitted task and its caller.
/// The worker completes it exactly once; any number of callers may poll
/// with a timeout.
#[derive(Debug, Default)]
pub struct TaskAwaiter {
    state: Mutex<Option<Result<()>>>,
    done: Condvar,
}

impl TaskAwaiter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn complete(&self, result: Result<()>) {
        let mut state = self.state.lock().unwrap();

        if state.is_none() {
            *state = Some(result);
            self.done.notify_all();
        }
    }

    pub fn is_done(&self) -> bool {
        self.state.lock().unwrap().is_some()
    }

    /// Waits up to `timeout` (forever if `None`). Returns the task result,
    /// or `None` if still working.
    pub fn wait(&self, timeout: Option<Duration>) -> Option<Result<()>> {
        let mut state = self.state.lock().unwrap();
        let deadline = timeout.map(|t| Instant::now() + t);

        loop {
            if let Some(result) = state.as_ref() {
                return Some(result.clone());
            }

            match deadline {
                None => state = self.done.wait(state).unwrap(),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return None;
                    }

                    let (next, wait_result) =
                        self.done.wait_timeout(state, deadline - now).unwrap();
                    state = next;

                    if wait_result.timed_out() && state.is_none() {
                        return None;
                    }
                }
            }
        }
    }
}

/// In-flight accounting for one pass over a set of batches: hands out
/// unstarted batch ids, records completions and lets the orchestrator
/// wait for the pass to drain.
#[derive(Debug)]
pub struct BatchManager {
    state: Mutex<BatchManagerState>,
    idle: Condvar,
}

#[derive(Debug)]
struct BatchManagerState {
    pending: VecDeque<String>,
    in_flight: AHashSet<String>,
}

impl BatchManager {
    pub fn new(batch_ids: impl IntoIterator<Item = String>) -> Self {
        Self {
            state: Mutex::new(BatchManagerState {
                pending: batch_ids.into_iter().collect(),
                in_flight: AHashSet::new(),
            }),
            idle: Condvar::new(),
        }
    }

    /// Next unstarted batch id, or `None` when the pass has dispatched
    /// everything.
    pub fn next(&self) -> Option<String> {
        let mut state = self.state.lock().unwrap();

        let id = state.pending.pop_front()?;
        state.in_flight.insert(id.clone());

        Some(id)
    }

    pub fn done(&self, batch_id: &str) {
        let mut state = self.state.lock().unwrap();

        state.in_flight.remove(batch_id);

        if state.pending.is_empty() && state.in_flight.is_empty() {
            self.idle.notify_all();
        }
    }

    pub fn is_idle(&self) -> bool {
        let state = self.state.lock().unwrap();
        state.pending.is_empty() && state.in_flight.is_empty()
    }

    /// Blocks until the pass drains. With a finite timeout, returns false
    /// if work is still in flight when it expires.
    pub fn wait_idle(&self, timeout: Option<Duration>) -> bool {
        let mut state = self.state.lock().unwrap();
        let deadline = timeout.map(|t| Instant::now() + t);

        loop {
            if state.pending.is_empty() && state.in_flight.is_empty() {
                return true;
            }

            match deadline {
                None => state = self.idle.wait(state).unwrap(),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return false;
                    }

                    state = self.idle.wait_timeout(state, deadline - now).unwrap().0;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn holder_publishes_snapshots() {
        let holder = ThreadSafeHolder::new(1);
        let before = holder.get();

        holder.set(2);

        assert_eq!(*before, 1);
        assert_eq!(*holder.get(), 2);
    }

    #[test]
    fn queue_drains_after_close() {
        let queue: BlockingQueue<usize> = BlockingQueue::new();

        queue.push(1);
        queue.push(2);
        queue.close();

        assert_eq!(queue.pop(), Some(1));
        assert_eq!(queue.pop(), Some(2));
        assert_eq!(queue.pop(), None);
    }

    #[test]
    fn queue_blocks_until_pushed() {
        let queue: Arc<BlockingQueue<usize>> = Arc::new(BlockingQueue::new());

        let consumer = {
            let queue = queue.clone();
            thread::spawn(move || queue.pop())
        };

        queue.push(42);
        assert_eq!(consumer.join().unwrap(), Some(42));
    }

    #[test]
    fn awaiter_times_out_then_completes() {
        let awaiter = TaskAwaiter::new();

        assert!(awaiter.wait(Some(Duration::from_millis(10))).is_none());

        let worker = {
            let awaiter = awaiter.clone();
            thread::spawn(move || awaiter.complete(Ok(())))
        };
        worker.join().unwrap();

        assert_eq!(awaiter.wait(None), Some(Ok(())));
        assert!(awaiter.is_done());
    }

    #[test]
    fn batch_manager_tracks_a_pass() {
        let manager = BatchManager::new(["a".to_string(), "b".to_string()]);

        let first = manager.next().unwrap();
        let second = manager.next().unwrap();
        assert_eq!(manager.next(), None);
        assert!(!manager.is_idle());

        manager.done(&first);
        assert!(!manager.wait_idle(Some(Duration::from_millis(10))));

        manager.done(&second);
        assert!(manager.wait_idle(Some(Duration::from_millis(10))));
        assert!(manager.is_idle());
    }
}
