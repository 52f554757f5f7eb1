use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;

use parking_lot::Mutex;

use crate::error::DispatchError;
use crate::ring::Ring;
use crate::task::{Task, run_caught};
use crate::wait_policy::{IdleTracker, ParkSignal, WaitPolicy};

/// Hard ceiling on `numWorkers` regardless of how far `dispatch` config
/// clamps a user-supplied (possibly negative) value.
pub const MAX_NUM_WORKERS: usize = 256;

/// Constructor knobs for [`RingDispatcher`].
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Clamped to `[1, MAX_NUM_WORKERS]` after taking the absolute value;
    /// `0` is treated as `1`. Negative input is accepted rather than
    /// rejected — see DESIGN.md for why that is preserved verbatim.
    pub num_workers: i32,
    /// Name prefix for named worker threads.
    pub thread_factory_name: String,
    /// Rounded up to the next power of two; must be requested as `>= 1`.
    pub buf_size: i64,
    pub wait_strategy: WaitPolicy,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            num_workers: 1,
            thread_factory_name: "spark-dispatch".to_string(),
            buf_size: 1024,
            wait_strategy: WaitPolicy::default(),
        }
    }
}

pub(crate) fn clamp_workers(num_workers: i32) -> usize {
    let n = if num_workers == 0 {
        1
    } else {
        num_workers.unsigned_abs() as usize
    };
    n.min(MAX_NUM_WORKERS)
}

pub(crate) fn round_up_pow2(buf_size: i64) -> Result<usize, DispatchError> {
    if buf_size <= 0 {
        return Err(DispatchError::InvalidArgument { buf_size });
    }
    Ok((buf_size as usize).next_power_of_two())
}

/// What happened to an item handed to [`RingDispatcher::dispatch`].
pub(crate) enum DispatchOutcome {
    Accepted,
    /// Ring was full; the item is handed back untouched so a caller (the
    /// executor façade) can try a fallback without reallocating.
    Rejected(Box<dyn Task>),
}

/// C2: bounded MPMC queue of work items, consumed by a fixed pool of
/// worker threads under work-pool semantics (each item goes to exactly one
/// worker, never broadcast).
///
/// `dispatch` never takes a lock: the ring's own per-slot CAS protocol is
/// the only synchronization on the producer side. The one piece of interior
/// state that does need `&mut`-style exclusivity — the worker `JoinHandle`s,
/// touched only once at shutdown — sits behind its own small `Mutex` rather
/// than forcing every producer to serialize behind it.
pub struct RingDispatcher {
    ring: Arc<Ring<Box<dyn Task>>>,
    signal: Arc<ParkSignal>,
    wait_strategy: WaitPolicy,
    accepting: Arc<AtomicBool>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    exception_handler: Arc<dyn Fn(Box<dyn std::any::Any + Send>) + Send + Sync>,
    shutdown_called: AtomicBool,
}

impl RingDispatcher {
    pub fn new(config: &DispatcherConfig) -> Result<Self, DispatchError> {
        let capacity = round_up_pow2(config.buf_size)?;
        let num_workers = clamp_workers(config.num_workers);

        if matches!(config.wait_strategy, WaitPolicy::BusySpin) {
            let cores = std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1);
            if num_workers > cores {
                tracing::warn!(
                    num_workers,
                    physical_cores = cores,
                    "BusySpin wait policy requested with more workers than physical cores"
                );
            }
        }

        let ring = Arc::new(Ring::with_capacity(capacity));
        let signal = Arc::new(ParkSignal::new());
        let accepting = Arc::new(AtomicBool::new(true));
        let exception_handler: Arc<dyn Fn(Box<dyn std::any::Any + Send>) + Send + Sync> =
            Arc::new(default_exception_handler);

        let workers = (0..num_workers)
            .map(|idx| {
                spawn_worker(
                    format!("{}-{idx}", config.thread_factory_name),
                    Arc::clone(&ring),
                    Arc::clone(&signal),
                    config.wait_strategy,
                    Arc::clone(&accepting),
                    Arc::clone(&exception_handler),
                )
            })
            .collect();

        tracing::debug!(capacity, num_workers, "ring dispatcher started");

        Ok(Self {
            ring,
            signal,
            wait_strategy: config.wait_strategy,
            accepting,
            workers: Mutex::new(workers),
            exception_handler,
            shutdown_called: AtomicBool::new(false),
        })
    }

    /// Ring capacity, already rounded up to a power of two.
    pub fn capacity(&self) -> usize {
        self.ring.capacity()
    }

    /// Non-blocking: claims the next producer slot if capacity permits.
    /// Never allocates and never blocks on a full ring.
    pub(crate) fn dispatch(&self, item: Box<dyn Task>) -> DispatchOutcome {
        if !self.accepting.load(Ordering::Acquire) {
            return DispatchOutcome::Rejected(item);
        }
        match self.ring.try_enqueue(item) {
            Ok(()) => {
                self.signal.notify(&self.wait_strategy);
                DispatchOutcome::Accepted
            }
            Err(item) => DispatchOutcome::Rejected(item),
        }
    }

    /// Stop accepting new work, drain what's already claimed, join workers.
    /// Idempotent, and safe to call from multiple threads at once: only the
    /// winner of the `shutdown_called` CAS actually joins.
    pub fn shutdown(&self) {
        if self
            .shutdown_called
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }
        self.accepting.store(false, Ordering::Release);
        self.signal.notify(&WaitPolicy::Blocking);
        for worker in self.workers.lock().drain(..) {
            let _ = worker.join();
        }
        tracing::debug!("ring dispatcher shut down");
    }
}

impl Drop for RingDispatcher {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[allow(clippy::too_many_arguments)]
fn spawn_worker(
    name: String,
    ring: Arc<Ring<Box<dyn Task>>>,
    signal: Arc<ParkSignal>,
    wait_strategy: WaitPolicy,
    accepting: Arc<AtomicBool>,
    exception_handler: Arc<dyn Fn(Box<dyn std::any::Any + Send>) + Send + Sync>,
) -> JoinHandle<()> {
    std::thread::Builder::new()
        .name(name)
        .spawn(move || {
            let mut idle = IdleTracker::default();
            loop {
                match ring.try_dequeue() {
                    Some(item) => {
                        idle.reset();
                        run_caught(item, exception_handler.as_ref());
                    }
                    None => {
                        if !accepting.load(Ordering::Acquire) {
                            // Draining: nothing left to claim and no more
                            // work will ever be published.
                            return;
                        }
                        idle.wait_once(&wait_strategy, &signal);
                    }
                }
            }
        })
        .expect("spawn dispatcher worker thread")
}

fn default_exception_handler(payload: Box<dyn std::any::Any + Send>) {
    let message = payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic payload".to_string());
    tracing::error!(panic = %message, "dispatcher worker caught a panic; swallowing and continuing");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU64;

    #[test]
    fn power_of_two_rounding() {
        assert_eq!(round_up_pow2(1).unwrap(), 1);
        assert_eq!(round_up_pow2(3).unwrap(), 4);
        assert_eq!(round_up_pow2(100).unwrap(), 128);
        assert!(round_up_pow2(0).is_err());
        assert!(round_up_pow2(-5).is_err());
    }

    #[test]
    fn worker_clamp() {
        assert_eq!(clamp_workers(0), 1);
        assert_eq!(clamp_workers(-5), 5);
        assert_eq!(clamp_workers(1), 1);
        assert_eq!(clamp_workers(100_000), MAX_NUM_WORKERS);
    }

    #[test]
    fn basic_dispatch_runs_every_item_once() {
        let counter = Arc::new(AtomicU64::new(0));
        let dispatcher = RingDispatcher::new(&DispatcherConfig {
            num_workers: 2,
            buf_size: 8,
            wait_strategy: WaitPolicy::Blocking,
            ..Default::default()
        })
        .unwrap();

        for _ in 0..1000 {
            let counter = Arc::clone(&counter);
            loop {
                let item: Box<dyn Task> = Box::new(move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                });
                match dispatcher.dispatch(item) {
                    DispatchOutcome::Accepted => break,
                    DispatchOutcome::Rejected(_) => std::thread::yield_now(),
                }
            }
        }

        dispatcher.shutdown();
        assert_eq!(counter.load(Ordering::SeqCst), 1000);
    }

    #[test]
    fn shutdown_is_idempotent() {
        let dispatcher = RingDispatcher::new(&DispatcherConfig::default()).unwrap();
        dispatcher.shutdown();
        dispatcher.shutdown();
    }

    #[test]
    fn rejects_after_shutdown() {
        let dispatcher = RingDispatcher::new(&DispatcherConfig::default()).unwrap();
        dispatcher.shutdown();
        let item: Box<dyn Task> = Box::new(|| {});
        assert!(matches!(
            dispatcher.dispatch(item),
            DispatchOutcome::Rejected(_)
        ));
    }
}
