//! Task dispatch: a bounded worker pool plus a single-consumer delivery
//! channel.
//!
//! Load tasks run on pool threads, never on the consumer thread; completed
//! results are marshalled back through the delivery channel in posting
//! order. The pool is an owned instance sized from [`PoolConfig`], not a
//! process-wide static.

use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, error};

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Worker pool sizing.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Threads kept alive regardless of load.
    pub core_size: usize,
    /// Upper bound on live threads.
    pub max_size: usize,
    /// Idle timeout after which threads above `core_size` exit.
    pub keep_alive: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        let cpus = num_cpus();
        Self {
            core_size: cpus + 1,
            max_size: 2 * cpus + 1,
            keep_alive: Duration::from_secs(10),
        }
    }
}

/// Number of available CPU cores.
fn num_cpus() -> usize {
    thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

struct PoolState {
    queue: VecDeque<Job>,
    idle: usize,
    live: usize,
    shutdown: bool,
}

struct PoolShared {
    state: Mutex<PoolState>,
    available: Condvar,
    config: PoolConfig,
}

/// Bounded pool of named worker threads with an unbounded FIFO task queue.
///
/// Threads are spawned on demand up to `max_size`; threads above
/// `core_size` exit after `keep_alive` of idleness. Dropping the pool
/// drains the queue, signals the workers and joins them.
pub struct WorkerPool {
    shared: Arc<PoolShared>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    next_worker_id: AtomicUsize,
}

impl WorkerPool {
    pub fn new(config: PoolConfig) -> Self {
        Self {
            shared: Arc::new(PoolShared {
                state: Mutex::new(PoolState {
                    queue: VecDeque::new(),
                    idle: 0,
                    live: 0,
                    shutdown: false,
                }),
                available: Condvar::new(),
                config,
            }),
            handles: Mutex::new(Vec::new()),
            next_worker_id: AtomicUsize::new(1),
        }
    }

    /// Submit a task for execution on a pool thread.
    pub fn execute<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let spawn_needed = {
            let mut state = self.shared.state.lock().unwrap();
            if state.shutdown {
                debug!("task submitted after shutdown, dropping");
                return;
            }
            state.queue.push_back(Box::new(job));
            if state.idle == 0 && state.live < self.shared.config.max_size {
                state.live += 1;
                true
            } else {
                false
            }
        };

        if spawn_needed {
            self.spawn_worker();
        } else {
            self.shared.available.notify_one();
        }
    }

    /// Live worker thread count.
    pub fn worker_count(&self) -> usize {
        self.shared.state.lock().unwrap().live
    }

    /// Queued (not yet started) task count.
    pub fn queued_count(&self) -> usize {
        self.shared.state.lock().unwrap().queue.len()
    }

    fn spawn_worker(&self) {
        let id = self.next_worker_id.fetch_add(1, Ordering::Relaxed);
        let shared = Arc::clone(&self.shared);
        let handle = thread::Builder::new()
            .name(format!("pixloader-worker-{id}"))
            .spawn(move || worker_loop(shared))
            .expect("failed to spawn worker thread");
        self.handles.lock().unwrap().push(handle);
    }
}

fn worker_loop(shared: Arc<PoolShared>) {
    debug!("worker started");
    loop {
        let job = {
            let mut state = shared.state.lock().unwrap();
            loop {
                if let Some(job) = state.queue.pop_front() {
                    break job;
                }
                if state.shutdown {
                    state.live -= 1;
                    return;
                }

                state.idle += 1;
                let (next, timeout) = shared
                    .available
                    .wait_timeout(state, shared.config.keep_alive)
                    .unwrap();
                state = next;
                state.idle -= 1;

                // Idle reaper: threads above core size retire after keep_alive
                if timeout.timed_out()
                    && state.queue.is_empty()
                    && !state.shutdown
                    && state.live > shared.config.core_size
                {
                    state.live -= 1;
                    debug!("idle worker retiring");
                    return;
                }
            }
        };

        if catch_unwind(AssertUnwindSafe(job)).is_err() {
            error!("load task panicked");
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        {
            let mut state = self.shared.state.lock().unwrap();
            state.shutdown = true;
        }
        self.shared.available.notify_all();

        let handles = std::mem::take(&mut *self.handles.lock().unwrap());
        for handle in handles {
            let _ = handle.join();
        }
    }
}

/// Sending half of the delivery channel; cloned into worker tasks.
pub struct DeliverySender<T> {
    tx: Sender<T>,
}

impl<T> Clone for DeliverySender<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<T> DeliverySender<T> {
    /// Post a result to the consumer. Returns `false` when the consumer
    /// side is gone.
    pub fn post(&self, value: T) -> bool {
        self.tx.send(value).is_ok()
    }
}

/// Receiving half of the delivery channel, owned by exactly one logical
/// consumer thread. Results arrive strictly in posting order.
pub struct DeliveryReceiver<T> {
    rx: Receiver<T>,
}

impl<T> DeliveryReceiver<T> {
    /// Block until the next result, or `None` once all senders are gone.
    pub fn recv(&self) -> Option<T> {
        self.rx.recv().ok()
    }

    /// Block up to `timeout` for the next result.
    pub fn recv_timeout(&self, timeout: Duration) -> Option<T> {
        self.rx.recv_timeout(timeout).ok()
    }

    /// Take whatever has already arrived without blocking.
    pub fn try_iter(&self) -> impl Iterator<Item = T> + '_ {
        self.rx.try_iter()
    }
}

/// Create a delivery channel pair.
pub fn delivery_channel<T>() -> (DeliverySender<T>, DeliveryReceiver<T>) {
    let (tx, rx) = mpsc::channel();
    (DeliverySender { tx }, DeliveryReceiver { rx })
}
