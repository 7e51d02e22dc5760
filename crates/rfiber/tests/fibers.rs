//! End-to-end tests of spawning, joining and yielding fibers

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rfiber::{Builder, FiberError, Launch, Runtime, SchedulerConfig};

fn runtime() -> Runtime {
    let config = SchedulerConfig::new()
        .num_groups(2)
        .workers_per_group(2)
        .park_timeout(Duration::from_millis(10));
    Runtime::new(config).unwrap()
}

#[test]
fn test_spawn_and_join_returns_value() {
    let rt = runtime();
    let fiber = rt.spawn(|| 6 * 7);
    assert_eq!(fiber.join(), Ok(42));
}

#[test]
fn test_block_on_runs_inside_a_fiber() {
    let rt = runtime();
    let (in_fiber, id) = rt
        .block_on(|| (rfiber::is_in_fiber(), rfiber::current_id()))
        .unwrap();
    assert!(in_fiber);
    assert!(id.is_some());
    assert!(!rfiber::is_in_fiber());
    assert_eq!(rfiber::current_id(), None);
}

#[test]
fn test_join_from_fiber() {
    let rt = runtime();
    let sum = rt
        .block_on(|| {
            let children: Vec<_> = (0..16u64)
                .map(|i| {
                    rfiber::spawn(move || {
                        rfiber::yield_now();
                        i * i
                    })
                })
                .collect();
            children.into_iter().map(|c| c.join().unwrap()).sum::<u64>()
        })
        .unwrap();
    assert_eq!(sum, (0..16u64).map(|i| i * i).sum());
}

#[test]
fn test_panic_is_reported_by_join() {
    let rt = runtime();
    let fiber = rt.spawn(|| -> u32 { panic!("boom") });
    assert_eq!(fiber.join(), Err(FiberError::Panicked));

    // The runtime keeps working afterwards
    assert_eq!(rt.spawn(|| 1).join(), Ok(1));
}

#[test]
fn test_panic_joined_from_fiber() {
    let rt = runtime();
    let result = rt
        .block_on(|| rfiber::spawn(|| -> u8 { panic!("inner") }).join())
        .unwrap();
    assert_eq!(result, Err(FiberError::Panicked));
}

#[test]
fn test_yield_interleaves_fibers() {
    let config = SchedulerConfig::new().num_groups(1).workers_per_group(1);
    let rt = Runtime::new(config).unwrap();
    let log = Arc::new(Mutex::new(Vec::new()));

    let log2 = Arc::clone(&log);
    rt.block_on(move || {
        let children: Vec<_> = (0..2)
            .map(|who| {
                let log = Arc::clone(&log2);
                rfiber::spawn(move || {
                    for step in 0..3 {
                        log.lock().unwrap().push((who, step));
                        rfiber::yield_now();
                    }
                })
            })
            .collect();
        for c in children {
            c.join().unwrap();
        }
    })
    .unwrap();

    let log = log.lock().unwrap();
    assert_eq!(log.len(), 6);
    // With a single worker neither fiber runs all its steps back to back
    let first_done = log.iter().position(|&e| e == (0, 2)).unwrap();
    assert!(log[..first_done].iter().any(|&(who, _)| who == 1));
}

#[test]
fn test_dispatch_runs_new_fiber_first() {
    let rt = runtime();
    let ran = rt
        .block_on(|| {
            let flag = Arc::new(AtomicBool::new(false));
            let flag2 = Arc::clone(&flag);
            let child = Builder::new()
                .launch(Launch::Dispatch)
                .spawn(move || flag2.store(true, Ordering::SeqCst))
                .unwrap();
            let ran = flag.load(Ordering::SeqCst);
            child.join().unwrap();
            ran
        })
        .unwrap();
    assert!(ran);
}

#[test]
fn test_builder_spawn_needs_fiber_context() {
    let err = Builder::new().spawn(|| ()).unwrap_err();
    assert_eq!(err, FiberError::NotInFiberContext);
}

#[test]
#[should_panic(expected = "not in fiber context")]
fn test_free_spawn_outside_runtime_panics() {
    rfiber::spawn(|| ()).detach();
}

#[test]
fn test_custom_stack_size_and_group_local() {
    let rt = runtime();
    let fiber = Builder::new()
        .stack_size(256 * 1024)
        .scheduling_group_local(true)
        .spawn_on(&rt, || {
            // Touch a good part of the larger stack
            let buf = [1u8; 64 * 1024];
            buf.iter().map(|&b| b as usize).sum::<usize>()
        })
        .unwrap();
    assert_eq!(fiber.join(), Ok(64 * 1024));
}

#[test]
fn test_shutdown_waits_for_detached_fibers() {
    let rt = runtime();
    let done = Arc::new(AtomicUsize::new(0));
    for _ in 0..64 {
        let done = Arc::clone(&done);
        rt.spawn(move || {
            for _ in 0..10 {
                rfiber::yield_now();
            }
            done.fetch_add(1, Ordering::SeqCst);
        })
        .detach();
    }
    rt.shutdown().unwrap();
    assert_eq!(done.load(Ordering::SeqCst), 64);
}

#[test]
fn test_fibers_spawned_during_shutdown_still_run() {
    let rt = runtime();
    let done = Arc::new(AtomicUsize::new(0));
    let done2 = Arc::clone(&done);
    rt.spawn(move || {
        std::thread::sleep(Duration::from_millis(20));
        for _ in 0..8 {
            let done = Arc::clone(&done2);
            rfiber::spawn(move || {
                done.fetch_add(1, Ordering::SeqCst);
            })
            .detach();
        }
    })
    .detach();
    rt.shutdown().unwrap();
    assert_eq!(done.load(Ordering::SeqCst), 8);
}

#[test]
fn test_many_fibers_across_groups() {
    let rt = runtime();
    let counter = Arc::new(AtomicUsize::new(0));
    let fibers: Vec<_> = (0..2000)
        .map(|_| {
            let counter = Arc::clone(&counter);
            rt.spawn(move || {
                counter.fetch_add(1, Ordering::Relaxed);
                rfiber::yield_now();
                counter.fetch_add(1, Ordering::Relaxed);
            })
        })
        .collect();
    for f in fibers {
        f.join().unwrap();
    }
    assert_eq!(counter.load(Ordering::Relaxed), 4000);

    // A joined fiber may still be on its way to being freed
    rt.scheduler().shutdown().unwrap();
    assert_eq!(rt.scheduler().live_fibers(), 0);
}

#[test]
fn test_is_finished() {
    let rt = runtime();
    let gate = Arc::new(AtomicBool::new(false));
    let gate2 = Arc::clone(&gate);
    let fiber = rt.spawn(move || {
        while !gate2.load(Ordering::SeqCst) {
            rfiber::yield_now();
        }
    });
    assert!(!fiber.is_finished());
    gate.store(true, Ordering::SeqCst);
    fiber.join().unwrap();
}
