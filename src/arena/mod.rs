//! Slab arena for task storage.
//!
//! Each worker owns a pool of fixed-capacity layers. Allocation is always
//! local to the creating worker; releases from other threads are deferred
//! through a per-pool cache so foreign threads never contend on the hot
//! allocation path. An optional background thread flushes the caches
//! periodically.

use crate::context;
use crate::task::Task;
use parking_lot::{Condvar, Mutex};
use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::atomic::AtomicUsize;
use std::sync::{Arc, Weak};
use std::thread;
use std::time::Duration;
use tracing::{debug, trace};

/// Hard ceiling on layers per pool. Hitting it means tasks are being leaked
/// faster than any sane workload creates them.
pub(crate) const MAX_LAYERS: usize = 32;

#[derive(Debug, Clone)]
pub(crate) struct ArenaConfig {
    /// Slot count of the first layer of every pool.
    pub(crate) initial_capacity: usize,
    /// Capacity multiplier applied to each new layer.
    pub(crate) growth: usize,
    /// Cross-thread releases buffered per pool before an inline flush.
    pub(crate) max_cached: usize,
}

impl Default for ArenaConfig {
    fn default() -> Self {
        Self {
            initial_capacity: 256,
            growth: 2,
            max_cached: 64,
        }
    }
}

/// One task slot. The refcount gates all access to `task`: the slot content
/// is initialized while a `TaskRef` with count >= 1 exists and uninitialized
/// otherwise.
pub(crate) struct Slot {
    pub(crate) refs: AtomicUsize,
    pub(crate) task: UnsafeCell<MaybeUninit<Task>>,
}

// Safety: `task` is only dereferenced through `TaskRef`/`SlotPos`, whose
// refcount protocol guarantees the slot is initialized, and whose release
// fence ordering guarantees the final reader sees all prior writes.
unsafe impl Sync for Slot {}

struct LayerState {
    free: Vec<u32>,
    live: usize,
}

/// Fixed-capacity block of slots. The `Arc` keeps slot memory valid for
/// straggling handles even after the pool has retired the layer.
pub(crate) struct Layer {
    pool: Weak<WorkerPool>,
    slots: Box<[Slot]>,
    state: Mutex<LayerState>,
}

impl Layer {
    fn new(pool: Weak<WorkerPool>, capacity: usize) -> Arc<Self> {
        let slots = (0..capacity)
            .map(|_| Slot {
                refs: AtomicUsize::new(0),
                task: UnsafeCell::new(MaybeUninit::uninit()),
            })
            .collect();

        Arc::new(Self {
            pool,
            slots,
            state: Mutex::new(LayerState {
                free: (0..capacity as u32).rev().collect(),
                live: 0,
            }),
        })
    }

    pub(crate) fn slot(&self, index: u32) -> &Slot {
        &self.slots[index as usize]
    }

    fn capacity(&self) -> usize {
        self.slots.len()
    }

    fn try_alloc(&self) -> Option<u32> {
        let mut state = self.state.lock();
        let index = state.free.pop()?;
        state.live += 1;
        Some(index)
    }

    fn release(&self, index: u32) -> usize {
        let mut state = self.state.lock();
        debug_assert!(state.live > 0, "releasing a slot into an empty layer");
        state.free.push(index);
        state.live -= 1;
        state.live
    }

    fn live(&self) -> usize {
        self.state.lock().live
    }
}

struct LayerStack {
    layers: Vec<Arc<Layer>>,
    next_capacity: usize,
}

/// One worker's share of the arena. Allocations come from the owning worker
/// only; releases may come from anywhere.
pub(crate) struct WorkerPool {
    cfg: ArenaConfig,
    layers: Mutex<LayerStack>,
    cache: Mutex<Vec<(Arc<Layer>, u32)>>,
}

impl WorkerPool {
    fn new(cfg: ArenaConfig) -> Arc<Self> {
        let next_capacity = cfg.initial_capacity;
        Arc::new(Self {
            cfg,
            layers: Mutex::new(LayerStack {
                layers: Vec::new(),
                next_capacity,
            }),
            cache: Mutex::new(Vec::new()),
        })
    }

    /// Reserves one slot, growing the layer stack when every layer is full.
    pub(crate) fn alloc_slot(self: &Arc<Self>) -> (Arc<Layer>, u32) {
        let mut stack = self.layers.lock();

        for layer in stack.layers.iter().rev() {
            if let Some(index) = layer.try_alloc() {
                return (Arc::clone(layer), index);
            }
        }

        if stack.layers.len() == MAX_LAYERS {
            panic!("task arena exhausted: {MAX_LAYERS} layers full, tasks are being leaked");
        }

        let capacity = stack.next_capacity;
        let layer = Layer::new(Arc::downgrade(self), capacity);
        stack.next_capacity = capacity * self.cfg.growth;
        debug!(capacity, layers = stack.layers.len() + 1, "arena layer added");

        let index = layer.try_alloc().expect("fresh layer has free slots");
        stack.layers.push(Arc::clone(&layer));
        (layer, index)
    }

    /// Returns a slot to its layer's free list. Retires the layer when it was
    /// the topmost one and went idle.
    pub(crate) fn release_local(&self, layer: &Arc<Layer>, index: u32) {
        let mut stack = self.layers.lock();
        layer.release(index);

        let is_top = stack
            .layers
            .last()
            .is_some_and(|top| Arc::ptr_eq(top, layer));
        if is_top && stack.layers.len() > 1 && layer.live() == 0 {
            stack.layers.pop();
            stack.next_capacity = (stack.next_capacity / self.cfg.growth)
                .max(self.cfg.initial_capacity);
            trace!(layers = stack.layers.len(), "arena layer retired");
        }
    }

    /// Defers a release made on a foreign thread. Flushes inline once the
    /// cache crosses the configured threshold.
    pub(crate) fn release_remote(&self, layer: Arc<Layer>, index: u32) {
        let drained = {
            let mut cache = self.cache.lock();
            cache.push((layer, index));
            if cache.len() < self.cfg.max_cached {
                return;
            }
            std::mem::take(&mut *cache)
        };
        self.flush(drained);
    }

    pub(crate) fn flush_cache(&self) {
        let drained = std::mem::take(&mut *self.cache.lock());
        self.flush(drained);
    }

    fn flush(&self, drained: Vec<(Arc<Layer>, u32)>) {
        for (layer, index) in drained {
            self.release_local(&layer, index);
        }
    }

    #[cfg(test)]
    pub(crate) fn layer_count(&self) -> usize {
        self.layers.lock().layers.len()
    }

    #[cfg(test)]
    pub(crate) fn cached(&self) -> usize {
        self.cache.lock().len()
    }

    #[cfg(test)]
    pub(crate) fn live(&self) -> usize {
        self.layers.lock().layers.iter().map(|l| l.live()).sum()
    }
}

/// Routes a zero-refcount slot back to its pool. Called from `TaskRef::drop`
/// after the task value has been dropped in place.
pub(crate) fn release_slot(layer: &Arc<Layer>, index: u32) {
    // Pool already torn down: the Arc on the layer is what keeps the slot
    // memory alive, nothing left to bookkeep.
    let Some(pool) = layer.pool.upgrade() else {
        return;
    };

    if context::is_local_pool(&pool) {
        pool.release_local(layer, index);
    } else {
        pool.release_remote(Arc::clone(layer), index);
    }
}

struct ReclaimSignal {
    stopped: Mutex<bool>,
    cond: Condvar,
}

/// All worker pools plus the optional background cache reclaimer.
pub(crate) struct TaskAllocator {
    pools: Vec<Arc<WorkerPool>>,
    signal: ReclaimSignal,
    reclaimer: Mutex<Option<thread::JoinHandle<()>>>,
}

impl TaskAllocator {
    pub(crate) fn new(workers: usize, cfg: ArenaConfig) -> Arc<Self> {
        Arc::new(Self {
            pools: (0..workers).map(|_| WorkerPool::new(cfg.clone())).collect(),
            signal: ReclaimSignal {
                stopped: Mutex::new(false),
                cond: Condvar::new(),
            },
            reclaimer: Mutex::new(None),
        })
    }

    pub(crate) fn pool(&self, worker: usize) -> &Arc<WorkerPool> {
        &self.pools[worker]
    }

    pub(crate) fn flush_all(&self) {
        for pool in &self.pools {
            pool.flush_cache();
        }
    }

    pub(crate) fn start_reclaimer(self: &Arc<Self>, period: Duration) {
        let allocator = Arc::clone(self);
        let handle = thread::Builder::new()
            .name("weft-reclaimer".into())
            .spawn(move || allocator.reclaim_loop(period))
            .expect("failed to spawn arena reclaimer thread");
        *self.reclaimer.lock() = Some(handle);
    }

    fn reclaim_loop(&self, period: Duration) {
        trace!(?period, "arena reclaimer started");
        let mut stopped = self.signal.stopped.lock();
        while !*stopped {
            let _ = self.signal.cond.wait_for(&mut stopped, period);
            if *stopped {
                break;
            }
            drop(stopped);
            self.flush_all();
            stopped = self.signal.stopped.lock();
        }
        trace!("arena reclaimer stopped");
    }

    /// Stops the reclaimer and drains every cache. Idempotent.
    pub(crate) fn shutdown(&self) {
        {
            let mut stopped = self.signal.stopped.lock();
            *stopped = true;
            self.signal.cond.notify_all();
        }
        if let Some(handle) = self.reclaimer.lock().take()
            && handle.join().is_err()
        {
            debug!("arena reclaimer thread panicked");
        }
        self.flush_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{Task, TaskRef};
    use static_assertions::assert_impl_all;

    assert_impl_all!(TaskAllocator: Send, Sync);
    assert_impl_all!(WorkerPool: Send, Sync);

    fn small_cfg() -> ArenaConfig {
        ArenaConfig {
            initial_capacity: 4,
            growth: 2,
            max_cached: 8,
        }
    }

    fn alloc_task(pool: &Arc<WorkerPool>) -> TaskRef {
        TaskRef::allocate(pool, Task::new(Box::new(|| {}), true))
    }

    #[test]
    fn grows_and_shrinks_layers() {
        let allocator = TaskAllocator::new(1, small_cfg());
        let pool = allocator.pool(0);

        let mut tasks: Vec<TaskRef> = (0..4).map(|_| alloc_task(pool)).collect();
        assert_eq!(pool.layer_count(), 1);
        assert_eq!(pool.live(), 4);

        // First layer full, next allocation opens a second, larger one.
        tasks.push(alloc_task(pool));
        assert_eq!(pool.layer_count(), 2);
        assert_eq!(pool.live(), 5);

        // Releases land in the cache (no worker context on a test thread)
        // until flushed, then the idle top layer is retired.
        tasks.clear();
        allocator.flush_all();
        assert_eq!(pool.live(), 0);
        assert_eq!(pool.layer_count(), 1);
    }

    #[test]
    fn remote_release_flushes_at_threshold() {
        let allocator = TaskAllocator::new(1, small_cfg());
        let pool = allocator.pool(0);

        let tasks: Vec<TaskRef> = (0..7).map(|_| alloc_task(pool)).collect();
        drop(tasks);
        // 7 cached, threshold is 8: nothing flushed yet.
        assert_eq!(pool.cached(), 7);
        assert_eq!(pool.live(), 7);

        let extra = alloc_task(pool);
        drop(extra);
        // Eighth release crosses the threshold and drains the cache inline.
        assert_eq!(pool.cached(), 0);
        assert_eq!(pool.live(), 0);
    }

    #[test]
    fn cross_thread_release_targets_owning_pool() {
        let allocator = TaskAllocator::new(2, small_cfg());
        let pool = allocator.pool(0);

        let tasks: Vec<TaskRef> = (0..3).map(|_| alloc_task(pool)).collect();
        let handle = std::thread::spawn(move || drop(tasks));
        handle.join().unwrap();

        assert_eq!(pool.cached(), 3);
        assert_eq!(allocator.pool(1).cached(), 0);

        allocator.flush_all();
        assert_eq!(pool.live(), 0);
    }

    #[test]
    fn reclaimer_thread_drains_caches() {
        let allocator = TaskAllocator::new(1, small_cfg());
        allocator.start_reclaimer(Duration::from_millis(5));

        let pool = allocator.pool(0);
        let tasks: Vec<TaskRef> = (0..3).map(|_| alloc_task(pool)).collect();
        drop(tasks);

        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while pool.cached() > 0 {
            assert!(
                std::time::Instant::now() < deadline,
                "reclaimer never flushed the cache"
            );
            std::thread::yield_now();
        }

        allocator.shutdown();
        assert_eq!(pool.live(), 0);
    }

    #[test]
    #[should_panic(expected = "task arena exhausted")]
    fn layer_ceiling_is_fatal() {
        let allocator = TaskAllocator::new(
            1,
            ArenaConfig {
                initial_capacity: 1,
                growth: 1,
                max_cached: usize::MAX,
            },
        );
        let pool = allocator.pool(0);
        let _tasks: Vec<TaskRef> = (0..MAX_LAYERS + 1).map(|_| alloc_task(pool)).collect();
    }
}
