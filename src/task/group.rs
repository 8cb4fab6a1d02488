//! Join-style barrier over a set of tasks.
//!
//! A group tracks outstanding member tasks and at most one waiter. The
//! lost-wakeup race between a waiter switching away and the last member
//! terminating is closed by a commit flag: both the worker's re-file step and
//! the final `member_done` decide the handoff under the same lock, so exactly
//! one side resumes the waiter.

use crate::context;
use crate::spawn::TaskHandle;
use crate::task::{State, TaskRef};
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::trace;

struct GroupState {
    members: Vec<TaskRef>,
    waiter: Option<TaskRef>,
    /// True once the waiter's suspension has been observed by its worker.
    committed: bool,
}

pub(crate) struct GroupInner {
    state: Mutex<GroupState>,
}

impl GroupInner {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(GroupState {
                members: Vec::new(),
                waiter: None,
                committed: false,
            }),
        }
    }

    pub(crate) fn add_member(&self, task: TaskRef) {
        self.state.lock().members.push(task);
    }

    /// Called by the worker re-filing a task that suspended in `GroupWait`.
    /// Returns true when every member already finished, in which case the
    /// caller keeps the task and re-enqueues it locally.
    pub(crate) fn commit_park(&self, task: &TaskRef) -> bool {
        let mut state = self.state.lock();
        if state.members.is_empty() {
            let waiter = state.waiter.take();
            debug_assert!(
                waiter.as_ref().is_some_and(|w| w.same_task(task)),
                "park commit for a task that is not the waiter"
            );
            drop(waiter);
            task.set_state(State::Runnable);
            trace!(id = %task.id(), "group drained before park committed");
            return true;
        }
        state.committed = true;
        false
    }

    /// Removes a terminated member. Resumes the waiter when this was the last
    /// member and the wait is committed.
    pub(crate) fn member_done(&self, task: &TaskRef) {
        let ready = {
            let mut state = self.state.lock();
            if let Some(i) = state.members.iter().position(|m| m.same_task(task)) {
                state.members.swap_remove(i);
            }
            if state.members.is_empty() && state.committed {
                state.committed = false;
                state.waiter.take()
            } else {
                None
            }
        };

        if let Some(waiter) = ready {
            trace!(id = %waiter.id(), "group drained, resuming waiter");
            waiter.set_state(State::Runnable);
            context::expect_worker(|_, handle| handle.add_runnable(waiter));
        }
    }

    #[cfg(test)]
    pub(crate) fn member_count(&self) -> usize {
        self.state.lock().members.len()
    }
}

/// Awaits termination of a set of tasks.
///
/// Register any number of running or pending tasks, then call [`wait`] from
/// inside a task to suspend until all of them have terminated. Registering a
/// task that already terminated is a no-op.
///
/// [`wait`]: TaskGroup::wait
pub struct TaskGroup {
    inner: Arc<GroupInner>,
}

impl TaskGroup {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(GroupInner::new()),
        }
    }

    /// Adds `handle`'s task to the set awaited by [`wait`].
    ///
    /// [`wait`]: TaskGroup::wait
    pub fn register(&self, handle: &TaskHandle) {
        self.register_task(&handle.task);
    }

    pub(crate) fn register_task(&self, task: &TaskRef) {
        task.register_group(task, &self.inner);
    }

    /// Suspends the calling task until every registered member terminates.
    /// Returns immediately when no members are outstanding.
    ///
    /// # Panics
    ///
    /// Panics when called from outside a task.
    pub fn wait(&self) {
        let current =
            context::current_task().expect("TaskGroup::wait must be called from inside a task");

        let parked = {
            let mut state = self.inner.state.lock();
            if state.members.is_empty() {
                false
            } else {
                current.set_state(State::GroupWait);
                current.set_parked_on(Arc::clone(&self.inner));
                state.waiter = Some(current.clone());
                state.committed = false;
                true
            }
        };

        if parked {
            context::suspend();
        }
    }
}

impl Default for TaskGroup {
    fn default() -> Self {
        Self::new()
    }
}
