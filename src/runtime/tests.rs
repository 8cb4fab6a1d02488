use crate::runtime::Builder;
use crate::runtime::scheduler::Handle;
use crate::{CountdownLatch, Runtime, TaskGroup, poll_until, spawn, spawn_pure, terminate, yield_now};
use anyhow::Result;
use parking_lot::Mutex;
use rstest::rstest;
use static_assertions::assert_impl_all;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

assert_impl_all!(Handle: Send, Sync);
assert_impl_all!(Runtime: Send);

fn small_runtime(workers: usize) -> Runtime {
    Builder::new()
        .worker_threads(workers)
        .sleep_timeout(Duration::from_millis(10))
        .try_build()
        .expect("valid config")
}

#[test]
fn root_task_runs_and_drains() -> Result<()> {
    let ran = Arc::new(AtomicBool::new(false));
    let runtime = small_runtime(1);

    let flag = Arc::clone(&ran);
    runtime.run(move || {
        flag.store(true, Ordering::SeqCst);
        terminate();
    })?;

    assert!(ran.load(Ordering::SeqCst));
    Ok(())
}

#[test]
fn spawn_before_run_lands_on_worker_zero() -> Result<()> {
    let hits = Arc::new(AtomicUsize::new(0));
    let runtime = small_runtime(1);

    let counter = Arc::clone(&hits);
    runtime.spawn(move || {
        counter.fetch_add(1, Ordering::SeqCst);
        terminate();
    });
    runtime.run(|| {})?;

    assert_eq!(hits.load(Ordering::SeqCst), 1);
    Ok(())
}

#[rstest]
#[case::single_worker(1)]
#[case::two_workers(2)]
#[case::four_workers(4)]
fn group_fans_out_and_joins(#[case] workers: usize) -> Result<()> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let joined = Arc::new(AtomicBool::new(false));
    let runtime = small_runtime(workers);

    let seen_in = Arc::clone(&seen);
    let joined_in = Arc::clone(&joined);
    runtime.run(move || {
        let group = TaskGroup::new();
        for i in 0..5 {
            let seen = Arc::clone(&seen_in);
            group.register(&spawn(move || seen.lock().push(i)));
        }
        group.wait();
        // All members terminated before wait returned.
        joined_in.store(seen_in.lock().len() == 5, Ordering::SeqCst);
        terminate();
    })?;

    assert!(joined.load(Ordering::SeqCst));
    let mut values = seen.lock().clone();
    values.sort_unstable();
    assert_eq!(values, vec![0, 1, 2, 3, 4]);
    Ok(())
}

#[test]
fn wait_without_members_returns_immediately() -> Result<()> {
    let done = Arc::new(AtomicBool::new(false));
    let runtime = small_runtime(1);

    let flag = Arc::clone(&done);
    runtime.run(move || {
        TaskGroup::new().wait();
        flag.store(true, Ordering::SeqCst);
        terminate();
    })?;

    assert!(done.load(Ordering::SeqCst));
    Ok(())
}

#[test]
fn register_after_terminate_keeps_wait_nonblocking() -> Result<()> {
    let done = Arc::new(AtomicBool::new(false));
    let runtime = small_runtime(2);

    let flag = Arc::clone(&done);
    runtime.run(move || {
        let handle = spawn(|| {});
        while !handle.is_finished() {
            yield_now();
        }

        let group = TaskGroup::new();
        group.register(&handle);
        group.wait();
        flag.store(true, Ordering::SeqCst);
        terminate();
    })?;

    assert!(done.load(Ordering::SeqCst));
    Ok(())
}

#[test]
fn is_finished_flips_across_workers() -> Result<()> {
    let runtime = small_runtime(2);

    runtime.run(move || {
        // The spawned tasks run on the other worker while this one polls the
        // handle; every round must observe the terminal state.
        for _ in 0..100 {
            let handle = spawn(|| {});
            while !handle.is_finished() {
                yield_now();
            }
        }
        terminate();
    })?;
    Ok(())
}

#[test]
fn group_wait_vs_terminate_race_resolves_exactly_once() -> Result<()> {
    let rounds = Arc::new(AtomicUsize::new(0));
    let runtime = small_runtime(4);

    let counter = Arc::clone(&rounds);
    runtime.run(move || {
        // Each round races the member's termination on another worker
        // against this task's park. A lost handoff would hang the round, a
        // double handoff would trip the waiter asserts.
        for _ in 0..200 {
            let group = TaskGroup::new();
            group.register(&spawn(|| {}));
            group.wait();
            counter.fetch_add(1, Ordering::SeqCst);
        }
        terminate();
    })?;

    assert_eq!(rounds.load(Ordering::SeqCst), 200);
    Ok(())
}

#[test]
fn countdown_latch_over_many_workers() -> Result<()> {
    let total = 500;
    let hits = Arc::new(AtomicUsize::new(0));
    let runtime = small_runtime(4);

    let counter = Arc::clone(&hits);
    runtime.run(move || {
        let latch = Arc::new(CountdownLatch::new(total));
        for _ in 0..total {
            let latch = Arc::clone(&latch);
            let counter = Arc::clone(&counter);
            spawn(move || {
                counter.fetch_add(1, Ordering::SeqCst);
                latch.count_down();
            });
        }
        latch.wait();
        terminate();
    })?;

    assert_eq!(hits.load(Ordering::SeqCst), total);
    Ok(())
}

#[test]
fn pure_tasks_run_inline() -> Result<()> {
    let ran = Arc::new(AtomicBool::new(false));
    let runtime = small_runtime(1);

    let flag = Arc::clone(&ran);
    runtime.run(move || {
        let handle = {
            let flag = Arc::clone(&flag);
            spawn_pure(move || flag.store(true, Ordering::SeqCst))
        };
        let group = TaskGroup::new();
        group.register(&handle);
        group.wait();
        assert!(handle.is_finished());
        terminate();
    })?;

    assert!(ran.load(Ordering::SeqCst));
    Ok(())
}

#[test]
fn poll_until_parks_and_resumes() -> Result<()> {
    let ready = Arc::new(AtomicBool::new(false));
    let done = Arc::new(AtomicBool::new(false));
    let runtime = small_runtime(1);

    let ready_in = Arc::clone(&ready);
    let done_in = Arc::clone(&done);
    runtime.run(move || {
        let waiter = {
            let ready = Arc::clone(&ready_in);
            let done = Arc::clone(&done_in);
            spawn(move || {
                poll_until(|| ready.load(Ordering::SeqCst));
                done.store(true, Ordering::SeqCst);
            })
        };

        // Let the waiter run once and park itself in the blocked list.
        yield_now();
        ready_in.store(true, Ordering::SeqCst);

        let group = TaskGroup::new();
        group.register(&waiter);
        group.wait();
        terminate();
    })?;

    assert!(done.load(Ordering::SeqCst));
    Ok(())
}

#[test]
fn panicking_task_terminates_and_unblocks_group() -> Result<()> {
    let done = Arc::new(AtomicBool::new(false));
    let runtime = small_runtime(2);

    let flag = Arc::clone(&done);
    runtime.run(move || {
        let group = TaskGroup::new();
        group.register(&spawn(|| panic!("task panic")));
        group.wait();
        flag.store(true, Ordering::SeqCst);
        terminate();
    })?;

    assert!(done.load(Ordering::SeqCst));
    Ok(())
}

#[test]
fn queued_work_migrates_to_idle_workers() -> Result<()> {
    // Everything is spawned from worker 0; the other workers only get work
    // by stealing halves of its queue.
    let total = 2_000;
    let hits = Arc::new(AtomicUsize::new(0));
    let runtime = small_runtime(4);

    let counter = Arc::clone(&hits);
    runtime.run(move || {
        let latch = Arc::new(CountdownLatch::new(total));
        for _ in 0..total {
            let latch = Arc::clone(&latch);
            let counter = Arc::clone(&counter);
            spawn(move || {
                counter.fetch_add(1, Ordering::SeqCst);
                latch.count_down();
            });
        }
        latch.wait();
        terminate();
    })?;

    assert_eq!(hits.load(Ordering::SeqCst), total);
    Ok(())
}

#[test]
fn idle_workers_sleep_until_woken() -> Result<()> {
    let done = Arc::new(AtomicBool::new(false));
    let runtime = Builder::new()
        .worker_threads(2)
        .sleep_timeout(Duration::from_millis(100))
        .try_build()?;
    let handle = runtime.handle().clone();

    let flag = Arc::clone(&done);
    runtime.run(move || {
        // Spin until the other worker has parked.
        while handle.shared.sleeper_count() == 0 {
            std::hint::spin_loop();
        }

        let group = TaskGroup::new();
        let flag = Arc::clone(&flag);
        group.register(&spawn(move || flag.store(true, Ordering::SeqCst)));
        group.wait();
        terminate();
    })?;

    assert!(done.load(Ordering::SeqCst));
    Ok(())
}

#[test]
fn sequential_runtimes_on_one_thread() -> Result<()> {
    for _ in 0..2 {
        let runtime = small_runtime(1);
        runtime.run(terminate)?;
    }
    Ok(())
}

#[test]
fn deep_spawn_chain() -> Result<()> {
    // Tasks spawning tasks spawning tasks; exercises arena churn and the
    // re-enqueue path under a running load.
    let hits = Arc::new(AtomicUsize::new(0));
    let runtime = small_runtime(2);

    fn fan(depth: usize, hits: Arc<AtomicUsize>, latch: Arc<CountdownLatch>) {
        hits.fetch_add(1, Ordering::SeqCst);
        if depth > 0 {
            for _ in 0..2 {
                let hits = Arc::clone(&hits);
                let latch = Arc::clone(&latch);
                latch.add(1);
                spawn(move || fan(depth - 1, hits, latch));
            }
        }
        latch.count_down();
    }

    let counter = Arc::clone(&hits);
    runtime.run(move || {
        let latch = Arc::new(CountdownLatch::new(1));
        fan(6, Arc::clone(&counter), Arc::clone(&latch));
        latch.wait();
        terminate();
    })?;

    // A full binary fan of depth 6 visits 2^7 - 1 nodes.
    assert_eq!(hits.load(Ordering::SeqCst), 127);
    Ok(())
}

#[test]
fn terminate_from_outside_the_runtime() -> Result<()> {
    let runtime = Arc::new(small_runtime(1));
    let other = Arc::clone(&runtime);

    let stopper = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(50));
        other.terminate();
    });

    runtime.run(|| {})?;
    stopper.join().unwrap();
    Ok(())
}

#[test]
#[should_panic(expected = "worker_threads must be at least 1")]
fn zero_workers_is_rejected() {
    let _ = Builder::new().worker_threads(0);
}

#[test]
fn zero_reclaim_period_is_rejected() {
    let res = Builder::new()
        .reclaim_period(Some(Duration::ZERO))
        .try_build();
    assert!(res.is_err());
}

#[test]
fn reclaim_period_runs_background_flushes() -> Result<()> {
    let hits = Arc::new(AtomicUsize::new(0));
    let runtime = Builder::new()
        .worker_threads(2)
        .sleep_timeout(Duration::from_millis(10))
        .reclaim_period(Some(Duration::from_millis(5)))
        .try_build()?;

    let counter = Arc::clone(&hits);
    runtime.run(move || {
        let latch = Arc::new(CountdownLatch::new(100));
        for _ in 0..100 {
            let latch = Arc::clone(&latch);
            let counter = Arc::clone(&counter);
            spawn(move || {
                counter.fetch_add(1, Ordering::SeqCst);
                latch.count_down();
            });
        }
        latch.wait();
        terminate();
    })?;

    assert_eq!(hits.load(Ordering::SeqCst), 100);
    Ok(())
}
