//! Thread-local runtime context.
//!
//! Every runtime thread carries its worker and a handle to the coordinator;
//! nothing is process-global, so several runtimes can coexist. A separate
//! slot tracks the yielder of the coroutine currently executing on this
//! thread, which is how nested user code suspends.

use crate::arena::WorkerPool;
use crate::runtime::scheduler::Handle;
use crate::runtime::worker::Worker;
use crate::task::TaskRef;
use corosensei::Yielder;
use std::cell::{Cell, RefCell};
use std::ptr::NonNull;
use std::rc::Rc;
use std::sync::Arc;

pub(crate) struct WorkerContext {
    pub(crate) worker: Rc<Worker>,
    pub(crate) handle: Handle,
}

thread_local! {
    static CONTEXT: RefCell<Option<WorkerContext>> = const { RefCell::new(None) };

    static CURRENT_YIELDER: Cell<Option<NonNull<Yielder<(), ()>>>> = const { Cell::new(None) };
}

pub(crate) fn set_worker_context(ctx: WorkerContext) {
    CONTEXT.with(|slot| {
        let mut slot = slot.borrow_mut();
        assert!(
            slot.is_none(),
            "a runtime worker context is already installed on this thread"
        );
        *slot = Some(ctx);
    });
}

pub(crate) fn clear_worker_context() {
    // Dropped only after the borrow ends: the context may hold the last
    // reference to tasks whose release re-enters this thread-local.
    let ctx = CONTEXT.with(|slot| slot.borrow_mut().take());
    drop(ctx);
}

pub(crate) fn with_worker<F, R>(f: F) -> Option<R>
where
    F: FnOnce(&Rc<Worker>, &Handle) -> R,
{
    CONTEXT.with(|slot| slot.borrow().as_ref().map(|ctx| f(&ctx.worker, &ctx.handle)))
}

/// Like [`with_worker`], but panics off-runtime.
#[track_caller]
pub(crate) fn expect_worker<F, R>(f: F) -> R
where
    F: FnOnce(&Rc<Worker>, &Handle) -> R,
{
    with_worker(f).expect("not running inside a weft runtime")
}

pub(crate) fn current_task() -> Option<TaskRef> {
    with_worker(|worker, _| worker.current_task()).flatten()
}

/// Whether `pool` belongs to the worker running on this thread.
pub(crate) fn is_local_pool(pool: &Arc<WorkerPool>) -> bool {
    with_worker(|worker, handle| Arc::ptr_eq(handle.allocator().pool(worker.index()), pool))
        .unwrap_or(false)
}

pub(crate) fn set_current_yielder(
    yielder: Option<NonNull<Yielder<(), ()>>>,
) -> Option<NonNull<Yielder<(), ()>>> {
    CURRENT_YIELDER.with(|slot| slot.replace(yielder))
}

/// Switches away from the running coroutine. From outside any coroutine this
/// runs a single scheduling step instead (the main-context yield); off the
/// runtime entirely it is a no-op.
pub(crate) fn suspend() {
    match CURRENT_YIELDER.with(Cell::get) {
        // Safety: the yielder is valid for as long as its coroutine exists,
        // and it is only installed while that coroutine is running.
        Some(yielder) => unsafe { yielder.as_ref() }.suspend(()),
        None => {
            with_worker(|worker, _| {
                worker.run_once();
            });
        }
    }
}
