//! A user-space, multi-threaded scheduler for stackful cooperative
//! coroutines.
//!
//! Tasks are lightweight callbacks multiplexed M:N over a fixed pool of
//! worker threads. Each worker owns a skip-indexed run queue that supports
//! O(1) enqueue/dequeue and O(log n) half-splits for work stealing, plus a
//! slab arena tuned for very high task churn. Synchronization between tasks
//! goes through [`TaskGroup`] join barriers and [`CountdownLatch`]es;
//! integration with external asynchronous operations goes through
//! [`poll_until`].
//!
//! ```no_run
//! let runtime = weft::Builder::new().worker_threads(2).try_build().unwrap();
//!
//! runtime.run(|| {
//!     let group = weft::TaskGroup::new();
//!     for i in 0..5 {
//!         group.register(&weft::spawn(move || println!("hello from {i}")));
//!     }
//!     group.wait();
//!     weft::terminate();
//! }).unwrap();
//! ```

pub(crate) mod arena;
pub(crate) mod context;
pub(crate) mod queue;
pub mod runtime;
pub(crate) mod spawn;
pub(crate) mod task;

pub use runtime::{Builder, Runtime};
pub use spawn::{CountdownLatch, TaskHandle, poll_until, spawn, spawn_pure, terminate, yield_now};
pub use task::group::TaskGroup;
