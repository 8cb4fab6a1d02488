//! Global coordinator: worker slots, sleep/wake state, task arena, thread
//! pool lifecycle.

use crate::arena::TaskAllocator;
use crate::context::{self, WorkerContext};
use crate::runtime::RuntimeConfig;
use crate::runtime::worker::{Worker, WorkerShared};
use crate::task::{State, Task, TaskRef};
use anyhow::{Result, anyhow};
use parking_lot::{Condvar, Mutex};
use std::ops::Deref;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use tracing::{debug, trace};

/// Sleep/wake state shared by all workers.
pub(crate) struct Shared {
    shutdown: AtomicBool,
    sleepers: AtomicUsize,
    sleep_lock: Mutex<()>,
    wakeup: Condvar,
}

impl Shared {
    fn new() -> Self {
        Self {
            shutdown: AtomicBool::new(false),
            sleepers: AtomicUsize::new(0),
            sleep_lock: Mutex::new(()),
            wakeup: Condvar::new(),
        }
    }

    /// Parks the calling worker. A wakeup missed between the caller's
    /// exhaustion check and the wait is bounded by the timeout.
    fn sleep(&self, timeout: std::time::Duration) {
        self.sleepers.fetch_add(1, Ordering::SeqCst);
        {
            let mut guard = self.sleep_lock.lock();
            if !self.shutdown.load(Ordering::Acquire) {
                let _ = self.wakeup.wait_for(&mut guard, timeout);
            }
        }
        self.sleepers.fetch_sub(1, Ordering::SeqCst);
    }

    fn wake_one(&self) {
        if self.sleepers.load(Ordering::SeqCst) > 0 {
            let _guard = self.sleep_lock.lock();
            self.wakeup.notify_one();
        }
    }

    fn wake_all(&self) {
        let _guard = self.sleep_lock.lock();
        self.wakeup.notify_all();
    }

    #[cfg(test)]
    pub(crate) fn sleeper_count(&self) -> usize {
        self.sleepers.load(Ordering::SeqCst)
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Gate {
    Hold,
    Run,
    Cancel,
}

/// Holds spawned workers until the whole pool came up. A failed spawn
/// cancels the gate so the earlier threads exit instead of waiting forever
/// for siblings that will never arrive.
struct StartGate {
    state: Mutex<Gate>,
    opened: Condvar,
}

impl StartGate {
    fn new() -> Self {
        Self {
            state: Mutex::new(Gate::Hold),
            opened: Condvar::new(),
        }
    }

    fn open(&self, to: Gate) {
        *self.state.lock() = to;
        self.opened.notify_all();
    }

    /// Blocks until the gate opens; true means run, false means stand down.
    fn wait(&self) -> bool {
        let mut state = self.state.lock();
        while *state == Gate::Hold {
            self.opened.wait(&mut state);
        }
        *state == Gate::Run
    }
}

pub(crate) struct Scheduler {
    pub(crate) cfg: RuntimeConfig,
    workers: Vec<Arc<WorkerShared>>,
    pub(crate) shared: Shared,
    allocator: Arc<TaskAllocator>,
    threads: Mutex<Vec<thread::JoinHandle<()>>>,
}

/// Cloneable reference to the coordinator.
#[derive(Clone)]
pub(crate) struct Handle(Arc<Scheduler>);

impl Deref for Handle {
    type Target = Scheduler;

    fn deref(&self) -> &Scheduler {
        &self.0
    }
}

impl Scheduler {
    pub(crate) fn new(cfg: RuntimeConfig) -> Handle {
        let workers = (0..cfg.worker_threads)
            .map(|index| Arc::new(WorkerShared::new(index)))
            .collect();
        let allocator = TaskAllocator::new(cfg.worker_threads, cfg.arena.clone());
        if let Some(period) = cfg.reclaim_period {
            allocator.start_reclaimer(period);
        }

        Handle(Arc::new(Self {
            cfg,
            workers,
            shared: Shared::new(),
            allocator,
            threads: Mutex::new(Vec::new()),
        }))
    }
}

impl Handle {
    pub(crate) fn cfg(&self) -> &RuntimeConfig {
        &self.cfg
    }

    pub(crate) fn allocator(&self) -> &Arc<TaskAllocator> {
        &self.allocator
    }

    pub(crate) fn workers(&self) -> impl Iterator<Item = &Arc<WorkerShared>> {
        self.0.workers.iter()
    }

    pub(crate) fn worker_shared(&self, index: usize) -> Arc<WorkerShared> {
        Arc::clone(&self.workers[index])
    }

    fn same_runtime(&self, other: &Handle) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    /// Allocates a task out of the calling worker's pool, or pool 0 when
    /// called off-runtime.
    pub(crate) fn new_task(&self, callback: crate::task::Callback, pure: bool) -> TaskRef {
        let index = context::with_worker(|worker, handle| {
            self.same_runtime(handle).then(|| worker.index())
        })
        .flatten()
        .unwrap_or(0);
        TaskRef::allocate(self.allocator.pool(index), Task::new(callback, pure))
    }

    /// Enqueues a runnable task into the calling worker's queue (worker 0's
    /// for off-runtime callers) and wakes a sleeper.
    pub(crate) fn add_runnable(&self, task: TaskRef) {
        debug_assert!(matches!(task.state(), State::Initial | State::Runnable));

        let local = context::with_worker(|worker, handle| {
            self.same_runtime(handle)
                .then(|| Arc::clone(worker.shared()))
        })
        .flatten();

        match local {
            Some(shared) => shared.run_queue.lock().enqueue(task),
            None => self.workers[0].run_queue.lock().enqueue(task),
        }
        self.shared.wake_one();
    }

    pub(crate) fn is_terminating(&self) -> bool {
        self.shared.shutdown.load(Ordering::Acquire)
    }

    /// Requests a graceful stop: workers finish in-flight and queued work,
    /// then exit at their next exhaustion check.
    pub(crate) fn terminate_gracefully(&self) {
        if !self.shared.shutdown.swap(true, Ordering::AcqRel) {
            debug!("graceful termination requested");
        }
        self.shared.wake_all();
    }

    pub(crate) fn sleep_with_timeout(&self) {
        self.shared.sleep(self.cfg.sleep_timeout);
    }

    /// Spawns workers 1..N behind a start gate. Worker 0 runs on the thread
    /// that calls [`Runtime::run`].
    ///
    /// [`Runtime::run`]: crate::runtime::Runtime::run
    pub(crate) fn start_workers(&self) -> Result<()> {
        let gate = Arc::new(StartGate::new());
        let mut threads = self.threads.lock();

        for index in 1..self.cfg.worker_threads {
            let handle = self.clone();
            let thread_gate = Arc::clone(&gate);
            let name = self.cfg.thread_name.next();

            let spawned = thread::Builder::new().name(name).spawn(move || {
                let worker = Worker::new(index, handle.clone());
                context::set_worker_context(WorkerContext {
                    worker: Rc::clone(&worker),
                    handle,
                });
                if thread_gate.wait() {
                    worker.run_loop();
                }
                context::clear_worker_context();
            });

            match spawned {
                Ok(thread) => threads.push(thread),
                Err(err) => {
                    gate.open(Gate::Cancel);
                    for thread in threads.drain(..) {
                        let _ = thread.join();
                    }
                    return Err(err.into());
                }
            }
        }
        drop(threads);

        gate.open(Gate::Run);
        trace!(workers = self.cfg.worker_threads, "thread pool started");
        Ok(())
    }

    pub(crate) fn join_workers(&self) -> Result<()> {
        let threads = std::mem::take(&mut *self.threads.lock());
        let total = threads.len();

        let mut panicked = 0;
        for thread in threads {
            if thread.join().is_err() {
                panicked += 1;
            }
        }

        if panicked > 0 {
            return Err(anyhow!("{panicked}/{total} worker thread(s) panicked"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parked_waiter(gate: &Arc<StartGate>) -> thread::JoinHandle<bool> {
        let gate = Arc::clone(gate);
        thread::spawn(move || gate.wait())
    }

    #[test]
    fn opened_gate_releases_waiters_to_run() {
        let gate = Arc::new(StartGate::new());
        let first = parked_waiter(&gate);
        let second = parked_waiter(&gate);

        gate.open(Gate::Run);
        assert!(first.join().unwrap());
        assert!(second.join().unwrap());
    }

    #[test]
    fn cancelled_gate_stands_waiters_down() {
        let gate = Arc::new(StartGate::new());
        let waiter = parked_waiter(&gate);

        gate.open(Gate::Cancel);
        assert!(!waiter.join().unwrap());
    }

    #[test]
    fn late_waiter_sees_an_already_open_gate() {
        let gate = Arc::new(StartGate::new());
        gate.open(Gate::Run);
        assert!(gate.wait());
    }
}
