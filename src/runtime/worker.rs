//! Per-worker scheduler.
//!
//! Each worker drives one run queue plus a local list of externally blocked
//! tasks. The queue sits behind a mutex in the shared slot so other workers
//! can steal from it; everything else is thread-local to the worker.

use crate::context;
use crate::queue::SkipQueue;
use crate::runtime::scheduler::Handle;
use crate::task::{Resumed, State, TaskRef};
use parking_lot::Mutex;
use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;
use tracing::trace;

/// The stealable part of a worker.
pub(crate) struct WorkerShared {
    pub(crate) index: usize,
    pub(crate) run_queue: Mutex<SkipQueue>,
}

impl WorkerShared {
    pub(crate) fn new(index: usize) -> Self {
        Self {
            index,
            run_queue: Mutex::new(SkipQueue::new()),
        }
    }
}

pub(crate) struct Worker {
    index: usize,
    handle: Handle,
    shared: Arc<WorkerShared>,
    current: RefCell<Option<TaskRef>>,
    blocked: RefCell<Vec<TaskRef>>,
}

impl Worker {
    pub(crate) fn new(index: usize, handle: Handle) -> Rc<Self> {
        let shared = handle.worker_shared(index);
        Rc::new(Self {
            index,
            handle,
            shared,
            current: RefCell::new(None),
            blocked: RefCell::new(Vec::new()),
        })
    }

    pub(crate) fn index(&self) -> usize {
        self.index
    }

    pub(crate) fn shared(&self) -> &Arc<WorkerShared> {
        &self.shared
    }

    pub(crate) fn current_task(&self) -> Option<TaskRef> {
        self.current.borrow().clone()
    }

    fn resume_task(&self, task: &TaskRef) -> Resumed {
        // Reinstall the task's yielder so nested code can suspend; the slot
        // is empty on first entry and published by the coroutine body.
        let prev = context::set_current_yielder(task.yielder());
        let resumed = task.resume_into(self.handle.cfg().stack_size);
        context::set_current_yielder(prev);
        resumed
    }

    /// Runs the oldest queued task to its next suspension point and re-files
    /// it. Returns false when the queue was empty.
    fn run_one_runnable(&self) -> bool {
        let task = self.shared.run_queue.lock().dequeue();
        let Some(task) = task else {
            return false;
        };

        *self.current.borrow_mut() = Some(task.clone());
        let finished = if task.is_pure() && task.state() == State::Initial {
            task.run_pure_inline();
            true
        } else {
            self.resume_task(&task) == Resumed::Finished
        };
        *self.current.borrow_mut() = None;

        if finished {
            task.terminate(&task);
        }
        self.refile(task);
        true
    }

    fn refile(&self, task: TaskRef) {
        match task.state() {
            State::Runnable => self.shared.run_queue.lock().enqueue(task),
            State::Blocked => self.blocked.borrow_mut().push(task),
            State::GroupWait => {
                let group = task.take_parked_on().expect("GroupWait task without a group");
                if group.commit_park(&task) {
                    self.shared.run_queue.lock().enqueue(task);
                }
                // Otherwise the group holds the waiter reference and the
                // last member's termination will resubmit it.
            }
            State::Terminated => drop(task),
            State::Initial => unreachable!("re-filed a task that never ran"),
        }
    }

    /// Gives every blocked task one resume to re-probe its operation.
    /// Returns true when at least one task left the blocked state.
    fn poll_blocked(&self) -> bool {
        let blocked = self.blocked.take();
        if blocked.is_empty() {
            return false;
        }

        let mut progressed = false;
        let mut still_blocked = Vec::with_capacity(blocked.len());
        for task in blocked {
            *self.current.borrow_mut() = Some(task.clone());
            let finished = self.resume_task(&task) == Resumed::Finished;
            *self.current.borrow_mut() = None;

            if finished {
                task.terminate(&task);
            }
            if task.state() == State::Blocked {
                still_blocked.push(task);
            } else {
                progressed = true;
                self.refile(task);
            }
        }
        self.blocked.borrow_mut().append(&mut still_blocked);
        progressed
    }

    /// Scans the other workers in index order and takes the oldest half of
    /// the first queue holding at least two tasks.
    fn try_steal(&self) -> bool {
        for victim in self.handle.workers() {
            if victim.index == self.index {
                continue;
            }

            let mut stolen = {
                let mut queue = victim.run_queue.lock();
                if queue.len() < 2 {
                    continue;
                }
                match queue.split_half() {
                    Some(stolen) => stolen,
                    None => continue,
                }
            };
            trace!(
                worker = self.index,
                victim = victim.index,
                count = stolen.len(),
                "stole tasks"
            );

            let mut local = self.shared.run_queue.lock();
            if local.is_empty() {
                local.replace(&mut stolen);
            } else {
                // Off-runtime submissions can land in this queue between the
                // empty check and the steal; fold the stolen half in behind
                // them.
                while let Some(task) = stolen.dequeue() {
                    local.enqueue(task);
                }
            }
            return true;
        }
        false
    }

    /// One scheduling step: local work, then stealing, then blocked-task
    /// polling. Returns whether any progress was made.
    pub(crate) fn run_once(&self) -> bool {
        if self.run_one_runnable() {
            return true;
        }
        if self.try_steal() {
            return true;
        }
        self.poll_blocked()
    }

    pub(crate) fn run_loop(&self) {
        trace!(worker = self.index, "worker loop started");
        loop {
            if self.run_once() {
                continue;
            }
            if self.handle.is_terminating() {
                break;
            }
            self.handle.sleep_with_timeout();
        }
        trace!(worker = self.index, "worker loop exited");
    }
}
