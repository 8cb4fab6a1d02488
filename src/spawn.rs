//! Task-facing API: spawning, yielding, external-operation parking, latches.

use crate::context;
use crate::task::group::TaskGroup;
use crate::task::{State, TaskRef};
use std::sync::atomic::{AtomicUsize, Ordering};

/// Handle to a spawned task, usable for group registration.
pub struct TaskHandle {
    pub(crate) task: TaskRef,
}

impl TaskHandle {
    pub fn is_finished(&self) -> bool {
        self.task.state() == State::Terminated
    }
}

fn spawn_inner(callback: crate::task::Callback, pure: bool) -> TaskHandle {
    let task = context::expect_worker(|_, handle| {
        let task = handle.new_task(callback, pure);
        handle.add_runnable(task.clone());
        task
    });
    TaskHandle { task }
}

/// Spawns a coroutine task onto the current worker's queue.
///
/// # Panics
///
/// Panics when called from outside a running runtime; use
/// [`Runtime::spawn`](crate::Runtime::spawn) to submit work beforehand.
pub fn spawn<F>(f: F) -> TaskHandle
where
    F: FnOnce() + Send + 'static,
{
    spawn_inner(Box::new(f), false)
}

/// Spawns a pure task: its callback must never suspend, and in exchange it
/// runs inline on its worker's stack with no coroutine switch at all.
pub fn spawn_pure<F>(f: F) -> TaskHandle
where
    F: FnOnce() + Send + 'static,
{
    spawn_inner(Box::new(f), true)
}

/// Cooperatively gives up the processor.
///
/// Inside a task this suspends back to the worker, which re-enqueues the
/// task behind its siblings. On a runtime thread outside any task it runs
/// one scheduling step instead; off-runtime it does nothing.
pub fn yield_now() {
    context::suspend();
}

/// Parks the calling task until `ready` reports completion of some external
/// operation (an outstanding I/O request, a message probe, ...).
///
/// The probe is called once up front; while it keeps returning false the
/// task sits in its worker's blocked list and is re-probed on every
/// scheduling round. The scheduler knows nothing about the operation itself.
///
/// # Panics
///
/// Panics when called from outside a task.
pub fn poll_until<F>(mut ready: F)
where
    F: FnMut() -> bool,
{
    if ready() {
        return;
    }

    let current = context::current_task().expect("poll_until must be called from inside a task");
    current.set_state(State::Blocked);
    context::suspend();

    loop {
        if ready() {
            current.set_state(State::Runnable);
            return;
        }
        context::suspend();
    }
}

/// Requests a graceful shutdown of the runtime this thread belongs to.
/// Queued and in-flight tasks still run to completion.
///
/// # Panics
///
/// Panics when called from outside a running runtime.
pub fn terminate() {
    context::expect_worker(|_, handle| handle.terminate_gracefully());
}

/// One-shot countdown synchronizer.
///
/// Built from a group waiting on a dummy pure task that is only submitted
/// when the count reaches zero. [`wait`](CountdownLatch::wait) must be
/// called from inside a task; `count_down` may be called from any task on
/// the runtime.
pub struct CountdownLatch {
    remaining: AtomicUsize,
    task: TaskRef,
}

impl CountdownLatch {
    /// # Panics
    ///
    /// Panics when called from outside a running runtime.
    pub fn new(count: usize) -> Self {
        let task = context::expect_worker(|_, handle| handle.new_task(Box::new(|| {}), true));
        Self {
            remaining: AtomicUsize::new(count),
            task,
        }
    }

    /// Raises the count. Only meaningful before the count first hits zero.
    pub fn add(&self, n: usize) {
        self.remaining.fetch_add(n, Ordering::AcqRel);
    }

    pub fn count_down(&self) {
        let previous = self.remaining.fetch_sub(1, Ordering::AcqRel);
        assert!(previous > 0, "count_down past zero");
        if previous == 1 {
            context::expect_worker(|_, handle| handle.add_runnable(self.task.clone()));
        }
    }

    /// Suspends the calling task until the count reaches zero. Returns
    /// immediately when it already has.
    pub fn wait(&self) {
        let group = TaskGroup::new();
        group.register_task(&self.task);
        group.wait();
    }
}
