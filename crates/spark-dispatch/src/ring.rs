use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicUsize, Ordering};

use crossbeam_utils::CachePadded;

/// Bounded, lock-free, multi-producer multi-consumer ring buffer.
///
/// Each slot carries its own sequence stamp (Vyukov's bounded MPMC queue
/// algorithm), generalized here from the single-producer/single-consumer
/// form to the multi-producer, work-stealing-consumer form this dispatcher
/// needs. Grounded on the same per-slot-stamp protocol used by
/// `other_examples/.../ringmpsc-rs/src/ring.rs` and
/// `fedemagnani-veloce::spsc::vyukov::channel`.
///
/// Invariant upheld by construction: a slot is, at any instant, either
/// empty, claimed by exactly one producer, or readable by exactly one
/// consumer — never two of these at once. `capacity` is always a power of
/// two so index-from-sequence is a single `& mask`.
pub(crate) struct Ring<T> {
    slots: Box<[Slot<T>]>,
    mask: usize,
    enqueue_pos: CachePadded<AtomicUsize>,
    dequeue_pos: CachePadded<AtomicUsize>,
}

struct Slot<T> {
    /// `stamp == index`: ready to be written by a producer.
    /// `stamp == index + 1`: written, ready to be read by a consumer.
    /// `stamp == index + capacity`: read, ready to be written again at the
    /// next lap.
    stamp: AtomicUsize,
    value: UnsafeCell<MaybeUninit<T>>,
}

unsafe impl<T: Send> Send for Ring<T> {}
unsafe impl<T: Send> Sync for Ring<T> {}

impl<T> Ring<T> {
    /// `capacity` must already be a power of two and >= 1; callers
    /// (`RingDispatcher::new`) are responsible for rounding up to the next
    /// power of two before reaching here.
    pub(crate) fn with_capacity(capacity: usize) -> Self {
        debug_assert!(capacity.is_power_of_two());
        let slots = (0..capacity)
            .map(|i| Slot {
                stamp: AtomicUsize::new(i),
                value: UnsafeCell::new(MaybeUninit::uninit()),
            })
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            slots,
            mask: capacity - 1,
            enqueue_pos: CachePadded::new(AtomicUsize::new(0)),
            dequeue_pos: CachePadded::new(AtomicUsize::new(0)),
        }
    }

    pub(crate) fn capacity(&self) -> usize {
        self.mask + 1
    }

    /// Non-blocking claim-and-publish. Returns the value back on failure
    /// (ring full) so the caller can hand it to a fallback path without
    /// re-allocating.
    pub(crate) fn try_enqueue(&self, value: T) -> Result<(), T> {
        let mut pos = self.enqueue_pos.load(Ordering::Relaxed);
        loop {
            let slot = &self.slots[pos & self.mask];
            let stamp = slot.stamp.load(Ordering::Acquire);
            let diff = stamp as isize - pos as isize;
            match diff.cmp(&0) {
                std::cmp::Ordering::Equal => {
                    match self.enqueue_pos.compare_exchange_weak(
                        pos,
                        pos.wrapping_add(1),
                        Ordering::Relaxed,
                        Ordering::Relaxed,
                    ) {
                        Ok(_) => {
                            unsafe {
                                (*slot.value.get()).write(value);
                            }
                            slot.stamp.store(pos.wrapping_add(1), Ordering::Release);
                            return Ok(());
                        }
                        Err(current) => pos = current,
                    }
                }
                std::cmp::Ordering::Less => return Err(value),
                std::cmp::Ordering::Greater => pos = self.enqueue_pos.load(Ordering::Relaxed),
            }
        }
    }

    /// Non-blocking claim-and-take. `None` means empty, not "try again" —
    /// the caller (a dispatcher worker) decides what to do about that via
    /// its `WaitPolicy`.
    pub(crate) fn try_dequeue(&self) -> Option<T> {
        let mut pos = self.dequeue_pos.load(Ordering::Relaxed);
        loop {
            let slot = &self.slots[pos & self.mask];
            let stamp = slot.stamp.load(Ordering::Acquire);
            let diff = stamp as isize - (pos.wrapping_add(1)) as isize;
            match diff.cmp(&0) {
                std::cmp::Ordering::Equal => {
                    match self.dequeue_pos.compare_exchange_weak(
                        pos,
                        pos.wrapping_add(1),
                        Ordering::Relaxed,
                        Ordering::Relaxed,
                    ) {
                        Ok(_) => {
                            let value = unsafe { (*slot.value.get()).assume_init_read() };
                            slot.stamp
                                .store(pos.wrapping_add(self.capacity()), Ordering::Release);
                            return Some(value);
                        }
                        Err(current) => pos = current,
                    }
                }
                std::cmp::Ordering::Less => return None,
                std::cmp::Ordering::Greater => pos = self.dequeue_pos.load(Ordering::Relaxed),
            }
        }
    }
}

impl<T> Drop for Ring<T> {
    fn drop(&mut self) {
        // Drain and drop any values still sitting in the ring (items that
        // were claimed by a producer and published, but never dequeued
        // before shutdown tore the dispatcher down).
        while self.try_dequeue().is_some() {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn rounds_nothing_itself_capacity_is_caller_responsibility() {
        let ring: Ring<u32> = Ring::with_capacity(4);
        assert_eq!(ring.capacity(), 4);
    }

    #[test]
    fn single_thread_fifo() {
        let ring: Ring<u32> = Ring::with_capacity(4);
        assert!(ring.try_enqueue(1).is_ok());
        assert!(ring.try_enqueue(2).is_ok());
        assert_eq!(ring.try_dequeue(), Some(1));
        assert_eq!(ring.try_dequeue(), Some(2));
        assert_eq!(ring.try_dequeue(), None);
    }

    #[test]
    fn rejects_when_full() {
        let ring: Ring<u32> = Ring::with_capacity(2);
        assert!(ring.try_enqueue(1).is_ok());
        assert!(ring.try_enqueue(2).is_ok());
        assert_eq!(ring.try_enqueue(3), Err(3));
    }

    #[test]
    fn concurrent_producers_consumers_preserve_all_items() {
        let ring = Arc::new(Ring::<u64>::with_capacity(64));
        let producers: Vec<_> = (0..4u64)
            .map(|p| {
                let ring = Arc::clone(&ring);
                thread::spawn(move || {
                    for i in 0..1000u64 {
                        let item = p * 1000 + i;
                        while ring.try_enqueue(item).is_err() {
                            std::thread::yield_now();
                        }
                    }
                })
            })
            .collect();

        let collected = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let total_taken = Arc::new(AtomicUsize::new(0));
        const EXPECTED: usize = 4 * 1000;
        let consumers: Vec<_> = (0..4)
            .map(|_| {
                let ring = Arc::clone(&ring);
                let collected = Arc::clone(&collected);
                let total_taken = Arc::clone(&total_taken);
                thread::spawn(move || {
                    let mut local = Vec::new();
                    loop {
                        match ring.try_dequeue() {
                            Some(v) => {
                                local.push(v);
                                total_taken.fetch_add(1, Ordering::SeqCst);
                            }
                            None => {
                                if total_taken.load(Ordering::SeqCst) >= EXPECTED {
                                    break;
                                }
                                std::thread::yield_now();
                            }
                        }
                    }
                    collected.lock().extend(local);
                })
            })
            .collect();

        for p in producers {
            p.join().unwrap();
        }
        for c in consumers {
            c.join().unwrap();
        }

        let mut got = collected.lock().clone();
        got.sort_unstable();
        let mut want: Vec<u64> = (0..4).flat_map(|p| (0..1000).map(move |i| p * 1000 + i)).collect();
        want.sort_unstable();
        assert_eq!(got, want);
    }
}
