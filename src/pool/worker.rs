//! Fixed-size worker pool served by an intrusive FIFO queue, mirroring
//! `hev_thread_pool` upstream: a mutex + condvar guarding a queue, a bounded
//! capacity, and cooperative shutdown that drains the queue before joining.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};

/// Hard cap on pending work items (`MAX_QUEUE_SIZE` upstream).
pub const MAX_QUEUE_SIZE: usize = 10_000;

pub type WorkItem = Box<dyn FnOnce() + Send + 'static>;

struct Inner {
    queue: Mutex<VecDeque<WorkItem>>,
    not_empty: Condvar,
    done: Condvar,
    shutdown: std::sync::atomic::AtomicBool,
    active: std::sync::atomic::AtomicUsize,
}

/// A fixed-size pool of worker threads draining a shared FIFO queue.
pub struct WorkerPool {
    inner: Arc<Inner>,
    threads: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawn `num_threads` workers. `0` picks `clamp(2 * cores, 2, 64)`.
    pub fn new(num_threads: usize) -> Self {
        let num_threads = if num_threads == 0 {
            crate::support::default_worker_count()
        } else {
            num_threads
        };

        let inner = Arc::new(Inner {
            queue: Mutex::new(VecDeque::new()),
            not_empty: Condvar::new(),
            done: Condvar::new(),
            shutdown: std::sync::atomic::AtomicBool::new(false),
            active: std::sync::atomic::AtomicUsize::new(0),
        });

        let threads = (0..num_threads)
            .map(|id| spawn_worker(id, inner.clone()))
            .collect();

        tracing::info!(num_threads, "worker pool started");
        WorkerPool { inner, threads }
    }

    pub fn thread_count(&self) -> usize {
        self.threads.len()
    }

    /// Submit a task. Rejects with `Err(task)` if the queue is at capacity.
    pub fn submit(&self, task: WorkItem) -> Result<(), WorkItem> {
        let mut queue = self.inner.queue.lock().unwrap();
        if queue.len() >= MAX_QUEUE_SIZE {
            tracing::warn!("worker pool queue full");
            return Err(task);
        }
        queue.push_back(task);
        self.inner.not_empty.notify_one();
        Ok(())
    }

    /// Block until the queue is empty and no worker is active.
    pub fn wait_all(&self) {
        let queue = self.inner.queue.lock().unwrap();
        let _guard = self
            .inner
            .done
            .wait_while(queue, |q| {
                !q.is_empty() || self.inner.active.load(std::sync::atomic::Ordering::Acquire) != 0
            })
            .unwrap();
    }

    pub fn queue_len(&self) -> usize {
        self.inner.queue.lock().unwrap().len()
    }

    pub fn active_count(&self) -> usize {
        self.inner.active.load(std::sync::atomic::Ordering::Acquire)
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.inner
            .shutdown
            .store(true, std::sync::atomic::Ordering::Release);
        {
            let _queue = self.inner.queue.lock().unwrap();
            self.inner.not_empty.notify_all();
        }
        for handle in self.threads.drain(..) {
            let _ = handle.join();
        }
        // Drain whatever is left, freeing each boxed item.
        self.inner.queue.lock().unwrap().clear();
        tracing::info!("worker pool destroyed");
    }
}

fn spawn_worker(id: usize, inner: Arc<Inner>) -> JoinHandle<()> {
    thread::Builder::new()
        .name(format!("tunwire-worker-{id}"))
        .spawn(move || {
            tracing::debug!(id, "worker started");
            loop {
                let task = {
                    let mut queue = inner.queue.lock().unwrap();
                    loop {
                        if let Some(task) = queue.pop_front() {
                            break Some(task);
                        }
                        if inner.shutdown.load(std::sync::atomic::Ordering::Acquire) {
                            break None;
                        }
                        queue = inner.not_empty.wait(queue).unwrap();
                    }
                };

                let Some(task) = task else { break };

                inner.active.fetch_add(1, std::sync::atomic::Ordering::AcqRel);
                task();
                inner.active.fetch_sub(1, std::sync::atomic::Ordering::AcqRel);

                let queue = inner.queue.lock().unwrap();
                if queue.is_empty()
                    && inner.active.load(std::sync::atomic::Ordering::Acquire) == 0
                {
                    inner.done.notify_all();
                }
            }
            tracing::debug!(id, "worker stopped");
        })
        .expect("failed to spawn worker thread")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn submits_run_and_drain() {
        let pool = WorkerPool::new(4);
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..50 {
            let counter = counter.clone();
            pool.submit(Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }))
            .unwrap();
        }
        pool.wait_all();
        assert_eq!(counter.load(Ordering::SeqCst), 50);
        assert_eq!(pool.queue_len(), 0);
        assert_eq!(pool.active_count(), 0);
    }

    #[test]
    fn drop_joins_every_worker() {
        let pool = WorkerPool::new(2);
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..5 {
            let counter = counter.clone();
            pool.submit(Box::new(move || {
                thread::sleep(Duration::from_millis(5));
                counter.fetch_add(1, Ordering::SeqCst);
            }))
            .unwrap();
        }
        drop(pool);
        assert_eq!(counter.load(Ordering::SeqCst), 5);
    }
}
