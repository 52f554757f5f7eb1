use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use crate::error::ExecuteError;
use crate::task::{Task, run_caught};

/// How long an idle reserve-pool thread waits for a handoff before exiting
/// and shrinking the pool back toward zero.
const IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// C3: elastic overflow executor for dispatches the ring rejected.
///
/// Backed by a `flume` rendezvous channel (`bounded(0)`) rather than a
/// buffered queue: a send only completes once a worker is already parked in
/// `recv`, giving direct-handoff semantics (akin to Java's
/// `SynchronousQueue`). `flume` is adopted from `fedemagnani-veloce`, which
/// already depends on it for the same reason the teacher workspace has no
/// MPMC channel of its own (see DESIGN.md).
pub struct ReservePool {
    sender: flume::Sender<Box<dyn Task>>,
    receiver: flume::Receiver<Box<dyn Task>>,
    live_threads: Arc<AtomicUsize>,
    max: usize,
    shutdown: Arc<AtomicBool>,
    exception_handler: Arc<dyn Fn(Box<dyn std::any::Any + Send>) + Send + Sync>,
}

impl ReservePool {
    /// `max == 0` means "no reserve pool"; callers (the executor façade)
    /// check this before constructing one at all.
    pub fn new(max: usize) -> Self {
        let (sender, receiver) = flume::bounded(0);
        Self {
            sender,
            receiver,
            live_threads: Arc::new(AtomicUsize::new(0)),
            max,
            shutdown: Arc::new(AtomicBool::new(false)),
            exception_handler: Arc::new(|payload| {
                let message = payload
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .unwrap_or_else(|| "non-string panic payload".to_string());
                tracing::error!(panic = %message, "reserve pool task caught a panic; swallowing");
            }),
        }
    }

    /// Hand `item` off to an idle reserve thread, spawning a new one if the
    /// pool isn't at capacity and no thread is currently waiting. Returns
    /// `Rejected` only once both the ring (checked by the caller) and this
    /// pool are saturated.
    pub fn try_execute(&self, item: Box<dyn Task>) -> Result<(), ExecuteError> {
        if self.shutdown.load(Ordering::Acquire) {
            return Err(ExecuteError::Rejected {
                reason: "reserve pool is shut down",
            });
        }

        // Fast path: an idle worker is already parked in recv().
        let item = match self.sender.try_send(item) {
            Ok(()) => return Ok(()),
            Err(flume::TrySendError::Full(item)) => item,
            Err(flume::TrySendError::Disconnected(item)) => item,
        };

        // No idle worker. Grow the pool if there's room, handing the new
        // thread this task directly so there's no handoff race against its
        // first `recv`.
        loop {
            let current = self.live_threads.load(Ordering::Relaxed);
            if current >= self.max {
                tracing::warn!(
                    live_threads = current,
                    max = self.max,
                    "reserve pool saturated; rejecting task"
                );
                return Err(ExecuteError::Rejected {
                    reason: "reserve pool exhausted",
                });
            }
            if self
                .live_threads
                .compare_exchange(current, current + 1, Ordering::SeqCst, Ordering::Relaxed)
                .is_ok()
            {
                self.spawn_worker(item);
                return Ok(());
            }
        }
    }

    fn spawn_worker(&self, first: Box<dyn Task>) {
        let receiver = self.receiver.clone();
        let live_threads = Arc::clone(&self.live_threads);
        let exception_handler = Arc::clone(&self.exception_handler);
        std::thread::Builder::new()
            .name("spark-reserve".to_string())
            .spawn(move || {
                run_caught(first, exception_handler.as_ref());
                loop {
                    match receiver.recv_timeout(IDLE_TIMEOUT) {
                        Ok(item) => run_caught(item, exception_handler.as_ref()),
                        Err(flume::RecvTimeoutError::Timeout) => break,
                        Err(flume::RecvTimeoutError::Disconnected) => break,
                    }
                }
                live_threads.fetch_sub(1, Ordering::SeqCst);
            })
            .expect("spawn reserve pool worker thread");
    }

    /// Stop accepting new work and allow idle threads to time out on their
    /// own; reserve workers fall out of their `recv_timeout` loop once
    /// `shutdown` is observed or every sender handle is dropped.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU64;
    use std::sync::Barrier;

    #[test]
    fn overflow_with_reserve_completes_every_task() {
        let pool = ReservePool::new(4);
        let counter = Arc::new(AtomicU64::new(0));
        let barrier = Arc::new(Barrier::new(2));

        for _ in 0..4 {
            let counter = Arc::clone(&counter);
            let barrier = Arc::clone(&barrier);
            let item: Box<dyn Task> = Box::new(move || {
                barrier.wait();
                counter.fetch_add(1, Ordering::SeqCst);
            });
            pool.try_execute(item).unwrap();
        }
        for _ in 0..4 {
            barrier.wait();
        }
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(counter.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn rejects_once_pool_is_saturated() {
        let pool = ReservePool::new(1);
        let blocker = Arc::new(Barrier::new(2));

        let blocker_clone = Arc::clone(&blocker);
        let item: Box<dyn Task> = Box::new(move || {
            blocker_clone.wait();
        });
        pool.try_execute(item).unwrap();
        std::thread::sleep(Duration::from_millis(20));

        let item: Box<dyn Task> = Box::new(|| {});
        assert!(pool.try_execute(item).is_err());

        blocker.wait();
    }
}
