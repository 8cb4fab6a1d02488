//! Task state machine and the refcounted slot handle.
//!
//! A task is a stackful coroutine allocated inside an arena slot. `TaskRef`
//! is the owning handle (atomic refcount in the slot header); `SlotPos` is
//! its non-owning twin used for intrusive queue links and identity checks.

use crate::arena::{Layer, Slot, WorkerPool};
use crate::context;
use corosensei::stack::DefaultStack;
use corosensei::{Coroutine, CoroutineResult, Yielder};
use parking_lot::Mutex;
use smallvec::SmallVec;
use std::cell::{Cell, UnsafeCell};
use std::fmt;
use std::mem::ManuallyDrop;
use std::panic::{self, AssertUnwindSafe};
use std::ptr::NonNull;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering, fence};
use tracing::trace;

pub(crate) mod group;
use group::GroupInner;

/// Debug identity, unique for the lifetime of the process.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub(crate) struct Id(u64);

impl Id {
    pub(crate) fn next() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum State {
    /// Created, callback not started.
    Initial = 0,
    /// Ready to run, or currently running.
    Runnable = 1,
    /// Parked on an external operation, re-polled by its worker.
    Blocked = 2,
    /// Parked on a `TaskGroup` until every member terminates.
    GroupWait = 3,
    /// Callback returned or panicked. Final.
    Terminated = 4,
}

pub(crate) type Callback = Box<dyn FnOnce() + Send + 'static>;

type TaskCoroutine = Coroutine<(), (), ()>;

/// Outcome of driving a task once.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Resumed {
    Suspended,
    Finished,
}

pub(crate) struct Membership {
    pub(crate) terminated: bool,
    list: SmallVec<[Arc<GroupInner>; 2]>,
}

pub(crate) struct Task {
    id: Id,
    pure: bool,
    /// Atomic so handles on other threads can observe termination; the
    /// transitions themselves stay single-writer (see the Send/Sync note).
    state: AtomicU8,
    callback: UnsafeCell<Option<Callback>>,
    coroutine: UnsafeCell<Option<TaskCoroutine>>,
    /// Stable for the life of the coroutine; published by its body on first
    /// entry so the worker can reinstall it on later resumes.
    yielder: Cell<Option<NonNull<Yielder<(), ()>>>>,
    /// Group this task is currently parked on, set before suspending in
    /// `GroupWait` and consumed by the worker's re-file step.
    parked_on: Cell<Option<Arc<GroupInner>>>,
    groups: Mutex<Membership>,
    /// Intrusive forward link; owned by whichever queue holds this task.
    link: UnsafeCell<Option<SlotPos>>,
}

// Safety: a task is driven by exactly one worker at a time. The non-atomic
// cells are only touched by that worker (or, for `parked_on`, by a group
// handoff that owns the suspended task exclusively); every cross-thread
// transfer goes through a queue or group mutex, which orders the plain
// writes. `state` is atomic because spawner-side handles poll it without any
// such transfer. Suspended coroutine stacks migrate between threads; the
// contents of the user callback are the caller's responsibility, bounded by
// its `Send` requirement.
unsafe impl Send for Task {}
unsafe impl Sync for Task {}

/// Raw pointer the coroutine body keeps to its own task. The coroutine is
/// owned by the task's slot and never outlives it.
struct TaskPtr(NonNull<Task>);
unsafe impl Send for TaskPtr {}

impl Task {
    pub(crate) fn new(callback: Callback, pure: bool) -> Self {
        Self {
            id: Id::next(),
            pure,
            state: AtomicU8::new(State::Initial as u8),
            callback: UnsafeCell::new(Some(callback)),
            coroutine: UnsafeCell::new(None),
            yielder: Cell::new(None),
            parked_on: Cell::new(None),
            groups: Mutex::new(Membership {
                terminated: false,
                list: SmallVec::new(),
            }),
            link: UnsafeCell::new(None),
        }
    }

    pub(crate) fn id(&self) -> Id {
        self.id
    }

    pub(crate) fn is_pure(&self) -> bool {
        self.pure
    }

    pub(crate) fn state(&self) -> State {
        match self.state.load(Ordering::Acquire) {
            0 => State::Initial,
            1 => State::Runnable,
            2 => State::Blocked,
            3 => State::GroupWait,
            _ => State::Terminated,
        }
    }

    pub(crate) fn set_state(&self, state: State) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub(crate) fn yielder(&self) -> Option<NonNull<Yielder<(), ()>>> {
        self.yielder.get()
    }

    pub(crate) fn set_parked_on(&self, group: Arc<GroupInner>) {
        debug_assert!(self.parked_on.take().is_none(), "task already parked");
        self.parked_on.set(Some(group));
    }

    pub(crate) fn take_parked_on(&self) -> Option<Arc<GroupInner>> {
        self.parked_on.take()
    }

    /// Starts the callback on a fresh coroutine stack, or switches back into
    /// a previously suspended one. Only the worker currently driving the task
    /// may call this.
    pub(crate) fn resume_into(&self, stack_size: usize) -> Resumed {
        let coroutine = unsafe { &mut *self.coroutine.get() };

        if self.state() == State::Initial {
            debug_assert!(coroutine.is_none());
            self.set_state(State::Runnable);

            let callback = unsafe { &mut *self.callback.get() }
                .take()
                .expect("task started twice");
            let this = TaskPtr(NonNull::from(self));
            let stack =
                DefaultStack::new(stack_size).expect("failed to allocate coroutine stack");

            *coroutine = Some(Coroutine::with_stack(stack, move |yielder, ()| {
                let task = unsafe { this.0.as_ref() };
                let yielder = NonNull::from(yielder);
                task.yielder.set(Some(yielder));
                context::set_current_yielder(Some(yielder));

                if panic::catch_unwind(AssertUnwindSafe(callback)).is_err() {
                    trace!(id = %task.id, "task callback panicked");
                }
            }));
        }

        debug_assert!(
            matches!(self.state(), State::Runnable | State::Blocked),
            "resumed a task in state {:?}",
            self.state()
        );

        let active = coroutine
            .as_mut()
            .expect("resumed a task with no continuation");
        match active.resume(()) {
            CoroutineResult::Yield(()) => Resumed::Suspended,
            CoroutineResult::Return(()) => {
                // Free the stack right away rather than when the last handle
                // drops.
                *coroutine = None;
                self.yielder.set(None);
                Resumed::Finished
            }
        }
    }

    /// Runs a pure callback on the caller's stack. Pure tasks never suspend,
    /// so no coroutine or stack is ever created for them.
    pub(crate) fn run_pure_inline(&self) {
        debug_assert!(self.pure);
        debug_assert_eq!(self.state(), State::Initial);
        self.set_state(State::Runnable);

        let callback = unsafe { &mut *self.callback.get() }
            .take()
            .expect("task started twice");
        if panic::catch_unwind(AssertUnwindSafe(callback)).is_err() {
            trace!(id = %self.id, "pure task callback panicked");
        }
    }

    /// Marks the task finished and notifies every registered group. The
    /// terminated flag flips under the task lock, closing the race with
    /// concurrent registration.
    pub(crate) fn terminate(&self, me: &TaskRef) {
        let groups = {
            let mut membership = self.groups.lock();
            debug_assert!(!membership.terminated, "task terminated twice");
            membership.terminated = true;
            std::mem::take(&mut membership.list)
        };
        self.set_state(State::Terminated);
        trace!(id = %self.id, "task terminated");

        for group in groups {
            group.member_done(me);
        }
    }

    /// Records mutual membership between this task and `group`. No-op when
    /// the task already terminated; both sides are updated under the task
    /// lock so termination can never slip in between.
    pub(crate) fn register_group(&self, me: &TaskRef, group: &Arc<GroupInner>) {
        let mut membership = self.groups.lock();
        if membership.terminated {
            return;
        }
        membership.list.push(Arc::clone(group));
        group.add_member(me.clone());
    }

    // Link accessors for the run queue. Callers must hold the lock of the
    // queue that owns this task.

    pub(crate) unsafe fn link_set(&self, next: Option<SlotPos>) {
        unsafe { *self.link.get() = next };
    }

    pub(crate) unsafe fn link_take(&self) -> Option<SlotPos> {
        unsafe { (*self.link.get()).take() }
    }

    pub(crate) unsafe fn link_clone(&self) -> Option<SlotPos> {
        unsafe { (*self.link.get()).clone() }
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("pure", &self.pure)
            .finish()
    }
}

/// Non-owning position of a task slot. Carries no refcount; liveness is
/// guaranteed by whoever hands the position out (typically the queue that
/// owns a reference to the task).
#[derive(Clone)]
pub(crate) struct SlotPos {
    layer: Arc<Layer>,
    index: u32,
}

impl SlotPos {
    fn slot(&self) -> &Slot {
        self.layer.slot(self.index)
    }

    /// Caller must guarantee an owning reference to this slot is live.
    pub(crate) unsafe fn task(&self) -> &Task {
        unsafe { (*self.slot().task.get()).assume_init_ref() }
    }
}

impl PartialEq for SlotPos {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.layer, &other.layer) && self.index == other.index
    }
}

impl Eq for SlotPos {}

impl fmt::Debug for SlotPos {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SlotPos")
            .field("index", &self.index)
            .finish()
    }
}

/// Owning, refcounted handle to a slab-allocated task.
pub(crate) struct TaskRef {
    pos: SlotPos,
}

impl TaskRef {
    /// Writes `task` into a fresh slot of `pool` with refcount 1.
    pub(crate) fn allocate(pool: &Arc<WorkerPool>, task: Task) -> Self {
        let (layer, index) = pool.alloc_slot();
        let slot = layer.slot(index);
        debug_assert_eq!(slot.refs.load(Ordering::Relaxed), 0);
        unsafe { (*slot.task.get()).write(task) };
        slot.refs.store(1, Ordering::Release);
        Self {
            pos: SlotPos { layer, index },
        }
    }

    /// Non-owning copy of this handle's position.
    pub(crate) fn pos(&self) -> SlotPos {
        self.pos.clone()
    }

    /// Converts into a bare position, transferring the owned reference to the
    /// caller's structure (queue link, list head).
    pub(crate) fn into_pos(self) -> SlotPos {
        let this = ManuallyDrop::new(self);
        unsafe { std::ptr::read(&this.pos) }
    }

    /// Rebuilds a handle from a position whose owned reference is being
    /// transferred back. Caller must have obtained `pos` via [`into_pos`] or
    /// an equivalent ownership handoff.
    ///
    /// [`into_pos`]: Self::into_pos
    pub(crate) unsafe fn from_owned_pos(pos: SlotPos) -> Self {
        Self { pos }
    }

    pub(crate) fn same_task(&self, other: &TaskRef) -> bool {
        self.pos == other.pos
    }
}

impl std::ops::Deref for TaskRef {
    type Target = Task;

    fn deref(&self) -> &Task {
        unsafe { self.pos.task() }
    }
}

impl Clone for TaskRef {
    fn clone(&self) -> Self {
        self.pos.slot().refs.fetch_add(1, Ordering::Relaxed);
        Self {
            pos: self.pos.clone(),
        }
    }
}

impl Drop for TaskRef {
    fn drop(&mut self) {
        if self.pos.slot().refs.fetch_sub(1, Ordering::Release) == 1 {
            fence(Ordering::Acquire);
            unsafe { (*self.pos.slot().task.get()).assume_init_drop() };
            crate::arena::release_slot(&self.pos.layer, self.pos.index);
        }
    }
}

impl fmt::Debug for TaskRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        (**self).fmt(f)
    }
}
