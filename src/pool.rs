use std::{
    collections::VecDeque,
    io,
    panic::{AssertUnwindSafe, catch_unwind},
    sync::Arc,
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::error::MediaError;

/// Upper bound on worker threads.
pub const MAX_THREADS: usize = 32;

const JOIN_POLL: Duration = Duration::from_millis(10);

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("thread count must be between 1 and {max}, got {requested}")]
    InvalidThreadCount { requested: usize, max: usize },

    #[error("failed to spawn worker {index}: {source}")]
    Spawn {
        index: usize,
        #[source]
        source: io::Error,
    },
}

/// Per-worker view handed to the dispatch function.
#[derive(Clone, Debug)]
pub struct WorkerContext {
    pub index: usize,
    /// Cancelled when pool shutdown starts. Long-running handlers poll it at
    /// safe points and return.
    pub stop: CancellationToken,
}

/// Connection processing invoked by the workers, once per queued item.
pub trait Dispatch<C>: Send + Sync {
    fn dispatch(&self, conn: C, ctx: &WorkerContext);
}

impl<C, F> Dispatch<C> for F
where
    F: Fn(C, &WorkerContext) + Send + Sync,
{
    fn dispatch(&self, conn: C, ctx: &WorkerContext) {
        self(conn, ctx)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueOrder {
    /// Most recently queued first.
    #[default]
    Lifo,
    Fifo,
}

#[derive(Clone, Debug)]
pub struct PoolOptions {
    pub threads: usize,
    /// Longest a worker sleeps on the queue before re-checking shutdown.
    pub idle_wait: Duration,
    pub grace: Duration,
    pub join_timeout: Duration,
    pub cancel_timeout: Duration,
    pub order: QueueOrder,
}

impl PoolOptions {
    pub fn new(threads: usize) -> Self {
        Self {
            threads,
            ..Default::default()
        }
    }
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            threads: 8,
            idle_wait: Duration::from_secs(1),
            grace: Duration::from_millis(100),
            join_timeout: Duration::from_secs(2),
            cancel_timeout: Duration::from_secs(1),
            order: QueueOrder::Lifo,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ShutdownReport {
    /// Workers that exited within the join timeout.
    pub joined: usize,
    /// Workers that exited only after the second wait.
    pub late: usize,
    /// Workers still running after both waits. Their threads are detached.
    pub abandoned: usize,
    /// Queued items never handed to a worker.
    pub dropped: usize,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub threads: usize,
    pub active: usize,
    pub queued: usize,
    pub processed: u64,
    pub shutdown: bool,
}

struct QueueState<C> {
    items: VecDeque<C>,
    shutdown: bool,
    active: usize,
    processed: u64,
}

struct Shared<C> {
    queue: Mutex<QueueState<C>>,
    cond: Condvar,
    stop: CancellationToken,
    order: QueueOrder,
    idle_wait: Duration,
}

impl<C> Shared<C> {
    fn pop(&self, state: &mut QueueState<C>) -> Option<C> {
        match self.order {
            QueueOrder::Lifo => state.items.pop_back(),
            QueueOrder::Fifo => state.items.pop_front(),
        }
    }
}

type Spawner<'a> =
    dyn FnMut(usize, Box<dyn FnOnce() + Send + 'static>) -> io::Result<JoinHandle<()>> + 'a;

/// Fixed set of worker threads draining a shared connection queue.
pub struct ThreadPool<C> {
    shared: Arc<Shared<C>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    options: PoolOptions,
}

impl<C: Send + 'static> ThreadPool<C> {
    pub fn new(options: PoolOptions, dispatch: Arc<dyn Dispatch<C>>) -> Result<Self, PoolError> {
        Self::with_spawner(options, dispatch, &mut |index: usize, work: Box<dyn FnOnce() + Send>| {
            thread::Builder::new()
                .name(format!("rtsp-worker-{}", index))
                .spawn(work)
        })
    }

    fn with_spawner(
        options: PoolOptions,
        dispatch: Arc<dyn Dispatch<C>>,
        spawn: &mut Spawner<'_>,
    ) -> Result<Self, PoolError> {
        if options.threads == 0 || options.threads > MAX_THREADS {
            return Err(PoolError::InvalidThreadCount {
                requested: options.threads,
                max: MAX_THREADS,
            });
        }

        let shared = Arc::new(Shared {
            queue: Mutex::new(QueueState {
                items: VecDeque::new(),
                shutdown: false,
                active: 0,
                processed: 0,
            }),
            cond: Condvar::new(),
            stop: CancellationToken::new(),
            order: options.order,
            idle_wait: options.idle_wait,
        });

        let mut workers = Vec::with_capacity(options.threads);
        for index in 0..options.threads {
            let worker_shared = Arc::clone(&shared);
            let worker_dispatch = Arc::clone(&dispatch);
            let work = Box::new(move || worker_loop(index, worker_shared, worker_dispatch));
            match spawn(index, work) {
                Ok(handle) => workers.push(handle),
                Err(source) => {
                    log::error!("pool: spawning worker {} failed: {}", index, source);
                    shared.queue.lock().shutdown = true;
                    shared.stop.cancel();
                    shared.cond.notify_all();
                    for handle in workers {
                        let _ = handle.join();
                    }
                    return Err(PoolError::Spawn { index, source });
                }
            }
        }

        log::info!(
            "pool: started {} workers ({:?} queue)",
            options.threads,
            options.order
        );
        Ok(Self {
            shared,
            workers: Mutex::new(workers),
            options,
        })
    }

    /// Queue a connection for the next free worker. Never blocks on a
    /// worker. Returns false, dropping `conn`, once shutdown has started.
    pub fn add_work(&self, conn: C) -> bool {
        let mut state = self.shared.queue.lock();
        if state.shutdown {
            log::warn!(
                "pool: {}",
                MediaError::LifecycleMisuse("add_work after shutdown, dropping item".into())
            );
            return false;
        }
        state.items.push_back(conn);
        drop(state);
        self.shared.cond.notify_one();
        true
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.shared.queue.lock();
        PoolStats {
            threads: self.options.threads,
            active: state.active,
            queued: state.items.len(),
            processed: state.processed,
            shutdown: state.shutdown,
        }
    }

    pub fn options(&self) -> &PoolOptions {
        &self.options
    }
}

impl<C> ThreadPool<C> {
    /// Stop accepting work, signal the workers and wait for them.
    ///
    /// Each worker gets `join_timeout`, then a second `cancel_timeout` after
    /// another wake-up. A worker that is still busy after both is detached
    /// and counted as abandoned; nothing is killed. Total time is bounded by
    /// `grace + threads * (join_timeout + cancel_timeout)`. Calling it again
    /// is a no-op.
    pub fn shutdown(&self) -> ShutdownReport {
        {
            let mut state = self.shared.queue.lock();
            if state.shutdown {
                log::debug!("pool: {}", MediaError::LifecycleMisuse("shutdown called twice".into()));
                return ShutdownReport::default();
            }
            state.shutdown = true;
        }
        log::info!("pool: shutting down");
        self.shared.stop.cancel();
        self.shared.cond.notify_all();
        thread::sleep(self.options.grace);

        let workers = std::mem::take(&mut *self.workers.lock());
        let mut report = ShutdownReport::default();
        for (index, handle) in workers.into_iter().enumerate() {
            if wait_finished(&handle, self.options.join_timeout) {
                join_worker(index, handle);
                report.joined += 1;
                continue;
            }

            log::warn!(
                "pool: {}, waking it again",
                MediaError::Timeout(format!(
                    "worker {} did not stop within {:?}",
                    index, self.options.join_timeout
                ))
            );
            self.shared.cond.notify_all();
            if wait_finished(&handle, self.options.cancel_timeout) {
                join_worker(index, handle);
                report.late += 1;
            } else {
                log::error!("pool: abandoning worker {} still busy", index);
                report.abandoned += 1;
            }
        }

        let mut state = self.shared.queue.lock();
        report.dropped = state.items.len();
        state.items.clear();
        drop(state);

        log::info!(
            "pool: shutdown complete (joined {}, late {}, abandoned {}, dropped {})",
            report.joined,
            report.late,
            report.abandoned,
            report.dropped
        );
        report
    }
}

impl<C> Drop for ThreadPool<C> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn wait_finished(handle: &JoinHandle<()>, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if handle.is_finished() {
            return true;
        }
        let now = Instant::now();
        if now >= deadline {
            return false;
        }
        thread::sleep(JOIN_POLL.min(deadline - now));
    }
}

fn join_worker(index: usize, handle: JoinHandle<()>) {
    if handle.join().is_err() {
        log::error!("pool: worker {} exited by panic", index);
    }
}

fn worker_loop<C>(index: usize, shared: Arc<Shared<C>>, dispatch: Arc<dyn Dispatch<C>>) {
    log::debug!("pool: worker {} started", index);
    let ctx = WorkerContext {
        index,
        stop: shared.stop.clone(),
    };

    loop {
        let conn = {
            let mut state = shared.queue.lock();
            loop {
                if let Some(conn) = shared.pop(&mut state) {
                    state.active += 1;
                    break Some(conn);
                }
                if state.shutdown {
                    break None;
                }
                shared.cond.wait_for(&mut state, shared.idle_wait);
            }
        };
        let Some(conn) = conn else {
            break;
        };

        if catch_unwind(AssertUnwindSafe(|| dispatch.dispatch(conn, &ctx))).is_err() {
            log::error!("pool: worker {} handler panicked, continuing", index);
        }

        let mut state = shared.queue.lock();
        state.active -= 1;
        state.processed += 1;
    }

    log::debug!("pool: worker {} exiting", index);
}

#[cfg(test)]
#[path = "pool_test.rs"]
mod pool_test;
