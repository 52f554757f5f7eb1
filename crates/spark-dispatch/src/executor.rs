use std::sync::Arc;

use crate::dispatcher::{DispatchOutcome, DispatcherConfig, RingDispatcher};
use crate::error::{DispatchError, ExecuteError};
use crate::reserve::ReservePool;
use crate::task::Task;

/// C4: the sole entry point user code and I/O handlers see.
///
/// `execute` tries the ring first; on rejection it falls back to the
/// reserve pool if one is configured, and only raises `Rejected` when both
/// are saturated. The producer path never takes a lock: `RingDispatcher`'s
/// own methods are all `&self`, so concurrent callers only ever contend on
/// the ring's per-slot CAS, never on an executor-level mutex.
#[derive(Clone)]
pub struct Executor {
    inner: Arc<ExecutorInner>,
}

struct ExecutorInner {
    ring: RingDispatcher,
    reserve: Option<ReservePool>,
}

/// Constructor knobs beyond [`DispatcherConfig`]: whether (and how large)
/// a reserve pool backs the ring.
#[derive(Debug, Clone, Default)]
pub struct ExecutorConfig {
    pub dispatcher: DispatcherConfig,
    /// `0` means no reserve pool exists at all.
    pub num_reserve_workers: i32,
}

impl Executor {
    pub fn new(config: ExecutorConfig) -> Result<Self, DispatchError> {
        let ring = RingDispatcher::new(&config.dispatcher)?;
        let reserve = if config.num_reserve_workers > 0 {
            Some(ReservePool::new(config.num_reserve_workers as usize))
        } else {
            None
        };
        Ok(Self {
            inner: Arc::new(ExecutorInner { ring, reserve }),
        })
    }

    /// Hands `item` to the ring; falls back to the reserve pool (if any) on
    /// overflow, never blocking the caller.
    pub fn execute(&self, item: impl Task) -> Result<(), ExecuteError> {
        self.execute_boxed(Box::new(item))
    }

    pub(crate) fn execute_boxed(&self, item: Box<dyn Task>) -> Result<(), ExecuteError> {
        match self.inner.ring.dispatch(item) {
            DispatchOutcome::Accepted => Ok(()),
            DispatchOutcome::Rejected(item) => match &self.inner.reserve {
                Some(pool) => pool.try_execute(item),
                None => Err(ExecuteError::Rejected {
                    reason: "ring buffer is full",
                }),
            },
        }
    }

    /// Stops accepting new work and joins every ring and reserve-pool
    /// worker. Idempotent.
    pub fn shutdown(&self) {
        self.inner.ring.shutdown();
        if let Some(pool) = &self.inner.reserve {
            pool.shutdown();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wait_policy::WaitPolicy;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Barrier;

    #[test]
    fn overflow_without_reserve_rejects_the_excess() {
        let executor = Executor::new(ExecutorConfig {
            dispatcher: DispatcherConfig {
                num_workers: 1,
                buf_size: 2,
                wait_strategy: WaitPolicy::BusySpin,
                ..Default::default()
            },
            num_reserve_workers: 0,
        })
        .unwrap();

        // The single BusySpin worker picks this up immediately and blocks
        // on it, leaving the ring itself empty again (capacity 2) for the
        // next submissions to fill.
        let release = Arc::new(Barrier::new(2));
        let release_worker = Arc::clone(&release);
        executor
            .execute(move || {
                release_worker.wait();
            })
            .unwrap();
        std::thread::sleep(std::time::Duration::from_millis(20));

        let mut accepted = 0;
        let mut rejected = 0;
        for _ in 0..4 {
            match executor.execute(|| {}) {
                Ok(()) => accepted += 1,
                Err(_) => rejected += 1,
            }
        }
        // Ring capacity 2: exactly two of the four fill it, the rest are
        // rejected without blocking or losing an item silently.
        assert_eq!(accepted, 2);
        assert_eq!(rejected, 2);
        release.wait();
    }

    #[test]
    fn overflow_with_reserve_never_rejects() {
        let executor = Executor::new(ExecutorConfig {
            dispatcher: DispatcherConfig {
                num_workers: 1,
                buf_size: 2,
                wait_strategy: WaitPolicy::BusySpin,
                ..Default::default()
            },
            num_reserve_workers: 4,
        })
        .unwrap();

        let counter = Arc::new(AtomicU64::new(0));
        let release = Arc::new(Barrier::new(2));
        let release_worker = Arc::clone(&release);
        executor
            .execute(move || {
                release_worker.wait();
            })
            .unwrap();

        for _ in 0..4 {
            let counter = Arc::clone(&counter);
            executor
                .execute(move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                })
                .unwrap();
        }
        release.wait();
        std::thread::sleep(std::time::Duration::from_millis(100));
        assert_eq!(counter.load(Ordering::SeqCst), 4);
    }
}
