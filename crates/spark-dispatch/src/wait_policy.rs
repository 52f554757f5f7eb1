use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

/// CPU-vs-latency tradeoff for a dispatcher's consumer threads.
///
/// Ordered, low to high CPU / high to low mean wake-up latency:
/// `Blocking < LiteBlocking < PhasedBackoff < Sleeping < Yielding < BusySpin`.
/// Immutable once a dispatcher is constructed with one.
#[derive(Debug, Clone, Copy)]
pub enum WaitPolicy {
    /// Park on a condvar; every publish notifies all parked consumers.
    Blocking,
    /// As `Blocking`, but a publish only notifies when a consumer is known
    /// to be parked, avoiding a syscall on the common "consumers are busy"
    /// path.
    LiteBlocking,
    /// Spin for `spin`, then cooperatively yield for `yield_for`, then fall
    /// back to `Blocking`. Defaults: 1ms spin, 1ms yield.
    PhasedBackoff { spin: Duration, yield_for: Duration },
    /// Busy-spin with a short park between iterations.
    Sleeping { park: Duration },
    /// Busy-spin with a cooperative yield every iteration.
    Yielding,
    /// Pure busy spin. Intended for `workers <= physical_cores`; violating
    /// that is logged, not rejected, at dispatcher construction.
    BusySpin,
}

impl Default for WaitPolicy {
    fn default() -> Self {
        WaitPolicy::Blocking
    }
}

impl WaitPolicy {
    pub(crate) const DEFAULT_PHASED_BACKOFF: WaitPolicy = WaitPolicy::PhasedBackoff {
        spin: Duration::from_millis(1),
        yield_for: Duration::from_millis(1),
    };

    pub(crate) const DEFAULT_SLEEPING: WaitPolicy = WaitPolicy::Sleeping {
        park: Duration::from_micros(60),
    };
}

/// Shared park/notify primitive a dispatcher's consumers wait on. One
/// instance per `RingDispatcher`; producers call [`ParkSignal::notify`]
/// after a successful publish, consumers call
/// [`ParkSignal::park_bounded`] when they find no work.
pub(crate) struct ParkSignal {
    mutex: Mutex<()>,
    condvar: Condvar,
    parked: AtomicUsize,
}

/// Upper bound on how long a blocked consumer sleeps before re-checking for
/// work — bounds shutdown latency without requiring every producer path to
/// remember to notify on drain.
const PARK_RECHECK: Duration = Duration::from_millis(50);

impl ParkSignal {
    pub(crate) fn new() -> Self {
        Self {
            mutex: Mutex::new(()),
            condvar: Condvar::new(),
            parked: AtomicUsize::new(0),
        }
    }

    pub(crate) fn has_parked(&self) -> bool {
        self.parked.load(Ordering::SeqCst) > 0
    }

    fn park_timeout(&self, timeout: Duration) {
        self.parked.fetch_add(1, Ordering::SeqCst);
        let mut guard = self.mutex.lock();
        self.condvar.wait_for(&mut guard, timeout);
        drop(guard);
        self.parked.fetch_sub(1, Ordering::SeqCst);
    }

    /// Called by the producer side on every successful publish.
    pub(crate) fn notify(&self, policy: &WaitPolicy) {
        match policy {
            WaitPolicy::LiteBlocking => {
                if self.has_parked() {
                    self.condvar.notify_all();
                }
            }
            WaitPolicy::Blocking | WaitPolicy::PhasedBackoff { .. } => {
                self.condvar.notify_all();
            }
            // Spinning policies never park on the condvar; notifying them
            // would be a wasted syscall.
            WaitPolicy::Sleeping { .. } | WaitPolicy::Yielding | WaitPolicy::BusySpin => {}
        }
    }
}

/// Per-worker transient state for policies that escalate over time
/// (`PhasedBackoff`). Reset whenever the worker finds work.
#[derive(Default)]
pub(crate) struct IdleTracker {
    idle_since: Option<Instant>,
}

impl IdleTracker {
    pub(crate) fn reset(&mut self) {
        self.idle_since = None;
    }

    /// Perform one "no work found" wait step per the given policy.
    pub(crate) fn wait_once(&mut self, policy: &WaitPolicy, signal: &ParkSignal) {
        match policy {
            WaitPolicy::Blocking | WaitPolicy::LiteBlocking => {
                signal.park_timeout(PARK_RECHECK);
            }
            WaitPolicy::PhasedBackoff { spin, yield_for } => {
                let started = *self.idle_since.get_or_insert_with(Instant::now);
                let elapsed = started.elapsed();
                if elapsed < *spin {
                    std::hint::spin_loop();
                } else if elapsed < *spin + *yield_for {
                    std::thread::yield_now();
                } else {
                    signal.park_timeout(PARK_RECHECK);
                }
            }
            WaitPolicy::Sleeping { park } => std::thread::sleep(*park),
            WaitPolicy::Yielding => std::thread::yield_now(),
            WaitPolicy::BusySpin => std::hint::spin_loop(),
        }
    }
}
