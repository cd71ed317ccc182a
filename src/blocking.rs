//! The blocking worker pool.
//!
//! The scheduler is single-threaded; anything that blocks it stalls every
//! connection in the worker. [`BlockingPool::run`] marshals a synchronous
//! closure to a pool of dedicated OS threads over a crossbeam channel and
//! resolves a oneshot with the result. Threads are spawned on demand up to
//! the configured cap and reaped after sitting idle.
//!
//! A worker thread lives across many jobs, so `thread_local!` storage can
//! carry caches (connection handles, compiled patterns) between calls.

use crate::{errors::BlockingError, limits::BlockingLimits};
use crossbeam::channel::{self, RecvTimeoutError};
use std::{
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    thread,
};
use tokio::sync::oneshot;

type Job = Box<dyn FnOnce() + Send + 'static>;

#[derive(Clone)]
pub(crate) struct BlockingPool {
    shared: Arc<Shared>,
}

struct Shared {
    tx: channel::Sender<Job>,
    rx: channel::Receiver<Job>,
    limits: BlockingLimits,
    threads: AtomicUsize,
    idle: AtomicUsize,
}

impl BlockingPool {
    pub(crate) fn new(limits: BlockingLimits) -> Self {
        let (tx, rx) = channel::unbounded();
        Self {
            shared: Arc::new(Shared {
                tx,
                rx,
                limits,
                threads: AtomicUsize::new(0),
                idle: AtomicUsize::new(0),
            }),
        }
    }

    /// Runs `f` on a pool thread and awaits its return value.
    pub(crate) async fn run<T, F>(&self, f: F) -> Result<T, BlockingError>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        let (done_tx, done_rx) = oneshot::channel();
        let job: Job = Box::new(move || {
            let result = catch_unwind(AssertUnwindSafe(f));
            let _ = done_tx.send(result);
        });

        self.ensure_worker();
        self.shared
            .tx
            .send(job)
            .map_err(|_| BlockingError::Closed)?;

        match done_rx.await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(_)) => Err(BlockingError::Panicked),
            Err(_) => Err(BlockingError::Closed),
        }
    }

    /// Spawns a worker thread unless one is already idle or the cap is
    /// reached. Best effort: the counters race with job completion, and a
    /// spare wakeup only costs one idle-timeout cycle.
    fn ensure_worker(&self) {
        let shared = &self.shared;
        if shared.idle.load(Ordering::Relaxed) > 0 {
            return;
        }
        let spawned = shared.threads.fetch_add(1, Ordering::Relaxed);
        if spawned >= shared.limits.threads {
            shared.threads.fetch_sub(1, Ordering::Relaxed);
            return;
        }

        let shared = Arc::clone(shared);
        let shared_err = Arc::clone(&shared);
        thread::Builder::new()
            .name("pagi-blocking".into())
            .spawn(move || worker_loop(&shared))
            .map_err(|_| shared_err.threads.fetch_sub(1, Ordering::Relaxed))
            .ok();
    }
}

fn worker_loop(shared: &Shared) {
    loop {
        shared.idle.fetch_add(1, Ordering::Relaxed);
        let received = shared.rx.recv_timeout(shared.limits.idle_timeout);
        shared.idle.fetch_sub(1, Ordering::Relaxed);

        match received {
            Ok(job) => job(),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => {
                shared.threads.fetch_sub(1, Ordering::Relaxed);
                return;
            }
        }
    }
}

#[cfg(test)]
mod pool {
    use super::*;
    use std::time::Duration;

    fn small_pool() -> BlockingPool {
        BlockingPool::new(BlockingLimits {
            threads: 2,
            idle_timeout: Duration::from_millis(200),
        })
    }

    #[tokio::test]
    async fn runs_and_returns() {
        let pool = small_pool();
        let value = pool.run(|| 40 + 2).await.unwrap();
        assert_eq!(value, 42);
    }

    #[tokio::test]
    async fn serializes_many_jobs() {
        let pool = small_pool();
        let mut total = 0u64;
        for i in 0..20u64 {
            total += pool.run(move || i * 2).await.unwrap();
        }
        assert_eq!(total, 380);
    }

    #[tokio::test]
    async fn panics_are_contained() {
        let pool = small_pool();
        let result: Result<(), _> = pool.run(|| panic!("job blew up")).await;
        assert_eq!(result, Err(BlockingError::Panicked));

        // The pool still works afterwards.
        assert_eq!(pool.run(|| 7).await.unwrap(), 7);
    }

    #[tokio::test]
    async fn thread_state_persists_across_calls() {
        let pool = BlockingPool::new(BlockingLimits {
            threads: 1,
            idle_timeout: Duration::from_secs(5),
        });

        thread_local! {
            static CALLS: std::cell::Cell<u32> = const { std::cell::Cell::new(0) };
        }

        let mut last = 0;
        for _ in 0..3 {
            last = pool
                .run(|| {
                    CALLS.with(|c| {
                        c.set(c.get() + 1);
                        c.get()
                    })
                })
                .await
                .unwrap();
        }
        assert_eq!(last, 3);
    }
}
