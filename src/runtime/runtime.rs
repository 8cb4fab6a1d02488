//! Runtime construction and the root entry point.

use crate::arena::ArenaConfig;
use crate::context::{self, WorkerContext};
use crate::runtime::scheduler::{Handle, Scheduler};
use crate::runtime::worker::Worker;
use crate::task::{Task, TaskRef};
use anyhow::{Result, ensure};
use std::fmt;
use std::rc::Rc;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tracing::debug;

/// Generates names for the spawned worker threads.
#[derive(Clone)]
pub(crate) struct ThreadNameFn(Arc<dyn Fn() -> String + Send + Sync>);

impl ThreadNameFn {
    pub(crate) fn next(&self) -> String {
        (self.0)()
    }
}

impl fmt::Debug for ThreadNameFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ThreadNameFn(..)")
    }
}

fn default_thread_name_fn() -> ThreadNameFn {
    // Worker 0 is the caller's thread and keeps its name; spawned workers
    // count up from 1.
    let counter = AtomicUsize::new(1);
    ThreadNameFn(Arc::new(move || {
        format!("weft-{}", counter.fetch_add(1, Ordering::Relaxed))
    }))
}

/// Configures and builds a [`Runtime`].
///
/// ```no_run
/// let runtime = weft::Builder::new()
///     .worker_threads(4)
///     .stack_size(256 * 1024)
///     .try_build()
///     .unwrap();
///
/// runtime.run(|| {
///     // spawn tasks, wait on groups...
///     weft::terminate();
/// }).unwrap();
/// ```
#[derive(Debug, Clone)]
pub struct Builder {
    worker_threads: usize,
    sleep_timeout: Duration,
    stack_size: usize,
    arena_initial_capacity: usize,
    arena_growth: usize,
    arena_max_cached: usize,
    reclaim_period: Option<Duration>,
    thread_name: ThreadNameFn,
}

impl Default for Builder {
    fn default() -> Self {
        Self::new()
    }
}

impl Builder {
    pub fn new() -> Self {
        Self {
            worker_threads: std::thread::available_parallelism()
                .map(usize::from)
                .unwrap_or(2),
            sleep_timeout: Duration::from_millis(500),
            stack_size: 128 * 1024,
            arena_initial_capacity: 256,
            arena_growth: 2,
            arena_max_cached: 64,
            reclaim_period: None,
            thread_name: default_thread_name_fn(),
        }
    }

    /// Total worker count, including the thread that calls [`Runtime::run`].
    #[track_caller]
    pub fn worker_threads(mut self, n: usize) -> Self {
        assert!(n > 0, "worker_threads must be at least 1");
        self.worker_threads = n;
        self
    }

    /// How long an idle worker sleeps before re-checking for work.
    #[track_caller]
    pub fn sleep_timeout(mut self, timeout: Duration) -> Self {
        assert!(!timeout.is_zero(), "sleep_timeout must be non-zero");
        self.sleep_timeout = timeout;
        self
    }

    /// Stack size for each task's coroutine.
    #[track_caller]
    pub fn stack_size(mut self, bytes: usize) -> Self {
        assert!(bytes >= 16 * 1024, "stack_size must be at least 16 KiB");
        self.stack_size = bytes;
        self
    }

    /// Slot count of the first arena layer of each worker.
    #[track_caller]
    pub fn arena_initial_capacity(mut self, slots: usize) -> Self {
        assert!(slots > 0, "arena_initial_capacity must be at least 1");
        self.arena_initial_capacity = slots;
        self
    }

    /// Capacity multiplier for each additional arena layer.
    #[track_caller]
    pub fn arena_growth(mut self, factor: usize) -> Self {
        assert!(factor >= 2, "arena_growth must be at least 2");
        self.arena_growth = factor;
        self
    }

    /// Cross-thread releases buffered per worker pool before an inline flush.
    #[track_caller]
    pub fn arena_max_cached(mut self, count: usize) -> Self {
        assert!(count > 0, "arena_max_cached must be at least 1");
        self.arena_max_cached = count;
        self
    }

    /// Enables the background cache reclaimer with the given period.
    /// Disabled by default; inline threshold flushes still apply.
    pub fn reclaim_period(mut self, period: Option<Duration>) -> Self {
        self.reclaim_period = period;
        self
    }

    /// Naming function for spawned worker threads.
    pub fn thread_name_fn<F>(mut self, f: F) -> Self
    where
        F: Fn() -> String + Send + Sync + 'static,
    {
        self.thread_name = ThreadNameFn(Arc::new(f));
        self
    }

    pub fn try_build(self) -> Result<Runtime> {
        Ok(Runtime::new(RuntimeConfig::try_from(self)?))
    }
}

#[derive(Debug, Clone)]
pub(crate) struct RuntimeConfig {
    pub(crate) worker_threads: usize,
    pub(crate) sleep_timeout: Duration,
    pub(crate) stack_size: usize,
    pub(crate) arena: ArenaConfig,
    pub(crate) reclaim_period: Option<Duration>,
    pub(crate) thread_name: ThreadNameFn,
}

impl TryFrom<Builder> for RuntimeConfig {
    type Error = anyhow::Error;

    fn try_from(builder: Builder) -> Result<Self> {
        ensure!(builder.worker_threads > 0, "worker_threads must be at least 1");
        ensure!(
            builder.stack_size >= 16 * 1024,
            "stack_size must be at least 16 KiB"
        );
        ensure!(builder.arena_growth >= 2, "arena_growth must be at least 2");
        ensure!(
            builder.arena_initial_capacity > 0,
            "arena_initial_capacity must be at least 1"
        );
        ensure!(
            builder.arena_max_cached > 0,
            "arena_max_cached must be at least 1"
        );
        ensure!(
            builder.reclaim_period.is_none_or(|p| !p.is_zero()),
            "reclaim_period must be non-zero when set"
        );

        Ok(Self {
            worker_threads: builder.worker_threads,
            sleep_timeout: builder.sleep_timeout,
            stack_size: builder.stack_size,
            arena: ArenaConfig {
                initial_capacity: builder.arena_initial_capacity,
                growth: builder.arena_growth,
                max_cached: builder.arena_max_cached,
            },
            reclaim_period: builder.reclaim_period,
            thread_name: builder.thread_name,
        })
    }
}

/// A multi-threaded stackful-coroutine scheduler.
///
/// Tasks are spawned from inside the root callback (or any task) with
/// [`spawn`](crate::spawn); [`run`](Runtime::run) drives worker 0 on the
/// calling thread and returns once [`terminate`](crate::terminate) has been
/// requested and all workers drained.
pub struct Runtime {
    handle: Handle,
}

impl Runtime {
    pub(crate) fn new(cfg: RuntimeConfig) -> Self {
        Self {
            handle: Scheduler::new(cfg),
        }
    }

    /// Submits a task before (or while) the runtime runs. The task lands in
    /// worker 0's queue and starts once [`run`](Runtime::run) is active.
    pub fn spawn<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let task = self.handle.new_task(Box::new(f), false);
        self.handle.add_runnable(task);
    }

    /// Runs `root` as the first task and drives worker 0 on the calling
    /// thread. Blocks until a graceful termination is requested (typically
    /// by `root` calling [`terminate`](crate::terminate) once its work is
    /// done) and every spawned worker has exited.
    pub fn run<F>(&self, root: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let worker = Worker::new(0, self.handle.clone());
        context::set_worker_context(WorkerContext {
            worker: Rc::clone(&worker),
            handle: self.handle.clone(),
        });

        let result = (|| {
            self.handle.start_workers()?;

            let root_task = TaskRef::allocate(
                self.handle.allocator().pool(0),
                Task::new(Box::new(root), false),
            );
            self.handle.add_runnable(root_task);

            worker.run_loop();
            self.handle.join_workers()
        })();

        context::clear_worker_context();
        // The worker's last task references must be released before the
        // allocator drains its caches.
        drop(worker);
        self.handle.allocator().shutdown();
        debug!("runtime drained");
        result
    }

    /// Requests a graceful stop from outside the runtime.
    pub fn terminate(&self) {
        self.handle.terminate_gracefully();
    }

    #[cfg(test)]
    pub(crate) fn handle(&self) -> &Handle {
        &self.handle
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        self.handle.terminate_gracefully();
        // Idempotent; covers runtimes that were built but never run.
        self.handle.allocator().shutdown();
    }
}

impl fmt::Debug for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime")
            .field("cfg", self.handle.cfg())
            .finish()
    }
}
