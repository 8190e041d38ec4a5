// ============================================================================
// ThreadPool Tests
// ============================================================================

use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
        mpsc,
    },
    thread,
    time::{Duration, Instant},
};

use parking_lot::Mutex;

use super::{
    Dispatch, MAX_THREADS, PoolError, PoolOptions, QueueOrder, ShutdownReport, ThreadPool,
    WorkerContext,
};

fn fast_options(threads: usize) -> PoolOptions {
    PoolOptions {
        threads,
        idle_wait: Duration::from_millis(50),
        grace: Duration::from_millis(10),
        join_timeout: Duration::from_millis(500),
        cancel_timeout: Duration::from_millis(200),
        order: QueueOrder::Lifo,
    }
}

fn wait_until(timeout: Duration, mut done: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if done() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    done()
}

fn recorder() -> (Arc<Mutex<Vec<u32>>>, Arc<dyn Dispatch<u32>>) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let dispatch = move |item: u32, _ctx: &WorkerContext| sink.lock().push(item);
    (seen, Arc::new(dispatch))
}

// ------------------------------------------------------------------------
// Construction
// ------------------------------------------------------------------------

#[test]
fn test_rejects_invalid_thread_counts() {
    for threads in [0, MAX_THREADS + 1] {
        let (_, dispatch) = recorder();
        match ThreadPool::new(PoolOptions::new(threads), dispatch) {
            Err(PoolError::InvalidThreadCount { requested, max }) => {
                assert_eq!(requested, threads);
                assert_eq!(max, MAX_THREADS);
            }
            Err(other) => panic!("unexpected error {}", other),
            Ok(_) => panic!("{} threads accepted", threads),
        }
    }
}

#[test]
fn test_spawn_failure_joins_started_workers() {
    let exited = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&exited);
    let (_, dispatch) = recorder();

    let result = ThreadPool::with_spawner(fast_options(4), dispatch, &mut |index: usize, work: Box<dyn FnOnce() + Send>| {
        if index == 2 {
            return Err(std::io::Error::other("out of threads"));
        }
        let counter = Arc::clone(&counter);
        Ok(thread::spawn(move || {
            work();
            counter.fetch_add(1, Ordering::SeqCst);
        }))
    });

    match result {
        Err(PoolError::Spawn { index, .. }) => assert_eq!(index, 2),
        Err(other) => panic!("unexpected error {}", other),
        Ok(_) => panic!("pool built despite spawn failure"),
    }
    // no orphaned threads: both started workers have already exited
    assert_eq!(exited.load(Ordering::SeqCst), 2);
}

// ------------------------------------------------------------------------
// Dispatch
// ------------------------------------------------------------------------

#[test]
fn test_each_item_processed_exactly_once() {
    const ITEMS: u32 = 500;
    let (seen, dispatch) = recorder();
    let pool = ThreadPool::new(fast_options(4), dispatch).unwrap();

    for item in 0..ITEMS {
        assert!(pool.add_work(item));
    }
    assert!(wait_until(Duration::from_secs(5), || pool.stats().processed == ITEMS as u64));

    let report = pool.shutdown();
    assert_eq!(report.joined, 4);
    assert_eq!(report.dropped, 0);

    let mut seen = seen.lock().clone();
    seen.sort_unstable();
    assert_eq!(seen, (0..ITEMS).collect::<Vec<_>>());
}

fn drain_order(order: QueueOrder) -> Vec<u32> {
    let (gate_tx, gate_rx) = mpsc::channel::<()>();
    let gate_rx = Mutex::new(gate_rx);
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let dispatch = move |item: u32, _ctx: &WorkerContext| {
        if item == 0 {
            // hold the only worker until the rest are queued
            let _ = gate_rx.lock().recv();
        } else {
            sink.lock().push(item);
        }
    };

    let pool = ThreadPool::new(
        PoolOptions {
            order,
            ..fast_options(1)
        },
        Arc::new(dispatch),
    )
    .unwrap();

    pool.add_work(0);
    assert!(wait_until(Duration::from_secs(2), || pool.stats().active == 1));
    for item in 1..=3 {
        pool.add_work(item);
    }
    assert_eq!(pool.stats().queued, 3);
    gate_tx.send(()).unwrap();
    assert!(wait_until(Duration::from_secs(2), || pool.stats().processed == 4));
    pool.shutdown();

    let order = seen.lock().clone();
    order
}

#[test]
fn test_lifo_processes_newest_first() {
    assert_eq!(drain_order(QueueOrder::Lifo), vec![3, 2, 1]);
}

#[test]
fn test_fifo_processes_oldest_first() {
    assert_eq!(drain_order(QueueOrder::Fifo), vec![1, 2, 3]);
}

#[test]
fn test_worker_survives_handler_panic() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let dispatch = move |item: u32, _ctx: &WorkerContext| {
        if item == 13 {
            panic!("handler bug");
        }
        sink.lock().push(item);
    };
    let pool = ThreadPool::new(fast_options(1), Arc::new(dispatch)).unwrap();

    pool.add_work(13);
    assert!(wait_until(Duration::from_secs(2), || pool.stats().processed == 1));
    pool.add_work(7);
    assert!(wait_until(Duration::from_secs(2), || pool.stats().processed == 2));
    assert_eq!(*seen.lock(), vec![7]);
    assert_eq!(pool.shutdown().joined, 1);
}

// ------------------------------------------------------------------------
// Shutdown
// ------------------------------------------------------------------------

#[test]
fn test_shutdown_bounded_with_stuck_worker() {
    let options = PoolOptions {
        join_timeout: Duration::from_millis(200),
        cancel_timeout: Duration::from_millis(100),
        ..fast_options(2)
    };
    let budget = options.grace + (options.join_timeout + options.cancel_timeout) * 2;

    // ignores the stop token on purpose
    let dispatch = |item: u32, _ctx: &WorkerContext| {
        if item == 0 {
            thread::sleep(Duration::from_secs(3));
        }
    };
    let pool = ThreadPool::new(options, Arc::new(dispatch)).unwrap();
    pool.add_work(0);
    assert!(wait_until(Duration::from_secs(2), || pool.stats().active == 1));

    let started = Instant::now();
    let report = pool.shutdown();
    let elapsed = started.elapsed();

    assert!(
        elapsed < budget + Duration::from_millis(500),
        "shutdown took {:?}",
        elapsed
    );
    assert_eq!(report.abandoned, 1);
    assert_eq!(report.joined, 1);
}

#[test]
fn test_shutdown_stops_cooperative_handlers() {
    let dispatch = |_item: u32, ctx: &WorkerContext| {
        while !ctx.stop.is_cancelled() {
            thread::sleep(Duration::from_millis(5));
        }
    };
    let pool = ThreadPool::new(fast_options(3), Arc::new(dispatch)).unwrap();
    for item in 0..3 {
        pool.add_work(item);
    }
    assert!(wait_until(Duration::from_secs(2), || pool.stats().active == 3));

    let report = pool.shutdown();
    assert_eq!(report.joined, 3);
    assert_eq!(report.late + report.abandoned, 0);
    assert_eq!(pool.stats().processed, 3);
}

#[test]
fn test_shutdown_is_idempotent_and_refuses_new_work() {
    let (seen, dispatch) = recorder();
    let pool = ThreadPool::new(fast_options(2), dispatch).unwrap();

    let first = pool.shutdown();
    assert_eq!(first.joined, 2);
    let second = pool.shutdown();
    assert_eq!(second, ShutdownReport::default());

    assert!(!pool.add_work(1));
    assert!(pool.stats().shutdown);
    assert!(seen.lock().is_empty());
}

#[test]
fn test_drop_shuts_down() {
    let (seen, dispatch) = recorder();
    let pool = ThreadPool::new(fast_options(2), dispatch).unwrap();
    pool.add_work(5);
    assert!(wait_until(Duration::from_secs(2), || pool.stats().processed == 1));
    drop(pool);
    assert_eq!(*seen.lock(), vec![5]);
}
