//! Worker pool that grows and shrinks between `min`/`max` threads based on
//! queue depth and idle-thread counts, mirroring `hev_adaptive_pool`
//! upstream. Unlike the fixed pool (§4.3), this one's queue is the lock-free
//! SPSC-style ring from `ring`... except the ring is strictly
//! single-producer/single-consumer and this pool has many producers
//! (callers of `submit`) and many consumers (workers), so the queue here is
//! a plain mutex-guarded `VecDeque`, matching the upstream's actual
//! mutex+condvar guarding of `HevRingBuffer` (the ring is shared there too,
//! despite its name, behind `pool->mutex`).

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::pool::worker::WorkItem;

#[derive(Debug, Clone, Copy)]
pub struct AdaptivePoolConfig {
    pub min_threads: usize,
    pub max_threads: usize,
    pub scale_up_threshold: usize,
    pub scale_down_threshold: usize,
    pub adjust_interval: Duration,
}

impl Default for AdaptivePoolConfig {
    fn default() -> Self {
        AdaptivePoolConfig {
            min_threads: 2,
            max_threads: 8,
            scale_up_threshold: 10,
            scale_down_threshold: 6,
            adjust_interval: Duration::from_secs(1),
        }
    }
}

struct WorkerSlot {
    handle: Mutex<Option<JoinHandle<()>>>,
    active: AtomicBool,
    should_exit: AtomicBool,
    last_work: Mutex<Instant>,
}

struct Inner {
    config: AdaptivePoolConfig,
    queue: Mutex<std::collections::VecDeque<WorkItem>>,
    cond: Condvar,
    running: AtomicBool,
    current_threads: AtomicUsize,
    active_threads: AtomicUsize,
    idle_threads: AtomicUsize,
    slots: Vec<WorkerSlot>,
}

/// A worker pool whose thread count adapts between `min_threads` and
/// `max_threads` on a periodic adjuster tick.
pub struct AdaptivePool {
    inner: Arc<Inner>,
    adjuster: Option<JoinHandle<()>>,
}

impl AdaptivePool {
    pub fn new(config: AdaptivePoolConfig) -> Self {
        let slots = (0..config.max_threads)
            .map(|_| WorkerSlot {
                handle: Mutex::new(None),
                active: AtomicBool::new(false),
                should_exit: AtomicBool::new(false),
                last_work: Mutex::new(Instant::now()),
            })
            .collect();

        let inner = Arc::new(Inner {
            config,
            queue: Mutex::new(std::collections::VecDeque::new()),
            cond: Condvar::new(),
            running: AtomicBool::new(true),
            current_threads: AtomicUsize::new(0),
            active_threads: AtomicUsize::new(0),
            idle_threads: AtomicUsize::new(0),
            slots,
        });

        for id in 0..config.min_threads {
            spawn_worker(id, &inner);
        }

        let adjuster_inner = inner.clone();
        let adjuster = thread::Builder::new()
            .name("tunwire-adaptive-adjuster".into())
            .spawn(move || adjuster_loop(adjuster_inner))
            .expect("failed to spawn adjuster thread");

        tracing::info!(min = config.min_threads, max = config.max_threads, "adaptive pool started");

        AdaptivePool {
            inner,
            adjuster: Some(adjuster),
        }
    }

    pub fn submit(&self, task: WorkItem) -> Result<(), WorkItem> {
        let mut queue = self.inner.queue.lock().unwrap();
        if queue.len() >= crate::pool::worker::MAX_QUEUE_SIZE {
            return Err(task);
        }
        queue.push_back(task);
        self.inner.cond.notify_one();
        Ok(())
    }

    pub fn current_threads(&self) -> usize {
        self.inner.current_threads.load(Ordering::Acquire)
    }

    pub fn active_threads(&self) -> usize {
        self.inner.active_threads.load(Ordering::Acquire)
    }

    pub fn idle_threads(&self) -> usize {
        self.inner.idle_threads.load(Ordering::Acquire)
    }

    pub fn queue_depth(&self) -> usize {
        self.inner.queue.lock().unwrap().len()
    }

    /// Run one adjustment step synchronously; the background adjuster calls
    /// this on every tick, tests can call it directly to avoid sleeping.
    pub fn adjust(&self) {
        adjust_once(&self.inner);
    }
}

fn adjust_once(inner: &Arc<Inner>) {
    let queue_depth = inner.queue.lock().unwrap().len();
    let idle = inner.idle_threads.load(Ordering::Acquire);
    let current = inner.current_threads.load(Ordering::Acquire);

    if queue_depth > inner.config.scale_up_threshold
        && idle < 2
        && current < inner.config.max_threads
    {
        // Scale-down can retire a low-indexed slot while a higher-indexed
        // one stays active (threads don't exit in index order), so the
        // next unused slot is not necessarily `current`. Scan for it.
        if let Some(id) = inner
            .slots
            .iter()
            .position(|slot| !slot.active.load(Ordering::Acquire))
        {
            spawn_worker(id, inner);
            tracing::debug!(current = current + 1, "adaptive pool scaled up");
        }
        return;
    }

    if idle > inner.config.scale_down_threshold && queue_depth < 10 && current > inner.config.min_threads
    {
        // Mark exactly one idle worker for graceful exit; `current_threads`
        // is only decremented once that worker actually observes the flag
        // and returns (see `spawn_worker`), closing the gap the upstream
        // adjuster leaves open (spec.md §9, open question b).
        for slot in &inner.slots {
            if slot.active.load(Ordering::Acquire) && !slot.should_exit.load(Ordering::Acquire) {
                slot.should_exit.store(true, Ordering::Release);
                tracing::debug!("adaptive pool marked a worker for exit");
                break;
            }
        }
    }
}

fn adjuster_loop(inner: Arc<Inner>) {
    while inner.running.load(Ordering::Acquire) {
        thread::sleep(inner.config.adjust_interval);
        if !inner.running.load(Ordering::Acquire) {
            break;
        }
        adjust_once(&inner);
    }
}

fn spawn_worker(id: usize, inner: &Arc<Inner>) {
    let slot_inner = inner.clone();
    let handle = thread::Builder::new()
        .name(format!("tunwire-adaptive-{id}"))
        .spawn(move || worker_loop(id, slot_inner))
        .expect("failed to spawn adaptive worker");

    let slot = &inner.slots[id];
    *slot.handle.lock().unwrap() = Some(handle);
    slot.active.store(true, Ordering::Release);
    slot.should_exit.store(false, Ordering::Release);
    inner.current_threads.fetch_add(1, Ordering::AcqRel);
}

fn worker_loop(id: usize, inner: Arc<Inner>) {
    let slot = &inner.slots[id];
    loop {
        if slot.should_exit.load(Ordering::Acquire) {
            break;
        }

        let task = {
            let mut queue = inner.queue.lock().unwrap();
            inner.idle_threads.fetch_add(1, Ordering::AcqRel);
            loop {
                if let Some(task) = queue.pop_front() {
                    break Some(task);
                }
                if !inner.running.load(Ordering::Acquire) || slot.should_exit.load(Ordering::Acquire) {
                    break None;
                }
                let (guard, timeout) = inner
                    .cond
                    .wait_timeout(queue, Duration::from_millis(200))
                    .unwrap();
                queue = guard;
                let _ = timeout;
            }
        };
        inner.idle_threads.fetch_sub(1, Ordering::AcqRel);

        let Some(task) = task else {
            if !inner.running.load(Ordering::Acquire) {
                break;
            }
            // Woke only to observe `should_exit`; re-check the top of the loop.
            continue;
        };

        inner.active_threads.fetch_add(1, Ordering::AcqRel);
        *slot.last_work.lock().unwrap() = Instant::now();
        task();
        inner.active_threads.fetch_sub(1, Ordering::AcqRel);
    }

    slot.active.store(false, Ordering::Release);
    inner.current_threads.fetch_sub(1, Ordering::AcqRel);
}

impl Drop for AdaptivePool {
    fn drop(&mut self) {
        self.inner.running.store(false, Ordering::Release);
        {
            let _queue = self.inner.queue.lock().unwrap();
            self.inner.cond.notify_all();
        }
        if let Some(handle) = self.adjuster.take() {
            let _ = handle.join();
        }
        for slot in &self.inner.slots {
            if let Some(handle) = slot.handle.lock().unwrap().take() {
                let _ = handle.join();
            }
        }
        tracing::info!("adaptive pool destroyed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[test]
    fn bounds_hold_across_submissions() {
        let config = AdaptivePoolConfig {
            min_threads: 2,
            max_threads: 8,
            scale_up_threshold: 10,
            scale_down_threshold: 6,
            adjust_interval: Duration::from_secs(3600),
        };
        let pool = AdaptivePool::new(config);
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..50 {
            let counter = counter.clone();
            let _ = pool.submit(Box::new(move || {
                thread::sleep(Duration::from_millis(20));
                counter.fetch_add(1, Ordering::SeqCst);
            }));
        }

        pool.adjust();
        thread::sleep(Duration::from_millis(50));
        let current = pool.current_threads();
        assert!((config.min_threads..=config.max_threads).contains(&current));
    }

    #[test]
    fn scale_down_never_drops_below_min() {
        let config = AdaptivePoolConfig {
            min_threads: 2,
            max_threads: 4,
            scale_up_threshold: 1000,
            scale_down_threshold: 0,
            adjust_interval: Duration::from_secs(3600),
        };
        let pool = AdaptivePool::new(config);
        thread::sleep(Duration::from_millis(20));
        for _ in 0..10 {
            pool.adjust();
        }
        thread::sleep(Duration::from_millis(50));
        assert!(pool.current_threads() >= config.min_threads);
    }
}
