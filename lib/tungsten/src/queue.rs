use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// Pads an index to its own cache line so the producer and consumer sides
/// never invalidate each other.
#[repr(align(64))]
pub(crate) struct CacheAligned<T>(pub T);

/// A bounded wait-free single-producer single-consumer queue.
///
/// Head and tail are monotonic counters; the slot index is `counter & mask`,
/// which requires the capacity to be a power of two. The producer publishes
/// with a release store on the tail, the consumer observes with an acquire
/// load, and vice versa for the head.
///
/// The producer and consumer roles must each be exercised by at most one
/// thread at a time; the queue does not defend against violations.
pub struct SpscQueue<T> {
    mask: usize,
    slots: Box<[UnsafeCell<MaybeUninit<T>>]>,
    head: CacheAligned<AtomicUsize>,
    tail: CacheAligned<AtomicUsize>,
}

unsafe impl<T: Send> Send for SpscQueue<T> {}
unsafe impl<T: Send> Sync for SpscQueue<T> {}

impl<T> SpscQueue<T> {
    pub fn new(capacity: usize) -> SpscQueue<T> {
        if capacity == 0 || !capacity.is_power_of_two() {
            panic!("Queue capacity must be a power of two, got {}", capacity);
        }

        let slots = (0..capacity)
            .map(|_| UnsafeCell::new(MaybeUninit::uninit()))
            .collect::<Vec<_>>()
            .into_boxed_slice();

        SpscQueue {
            mask: capacity - 1,
            slots,
            head: CacheAligned(AtomicUsize::new(0)),
            tail: CacheAligned(AtomicUsize::new(0)),
        }
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.mask + 1
    }

    /// Number of items currently queued. Exact for the two queue endpoints,
    /// approximate for observers.
    #[inline]
    pub fn len(&self) -> usize {
        let tail = self.tail.0.load(Ordering::Acquire);
        let head = self.head.0.load(Ordering::Acquire);
        tail.wrapping_sub(head)
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Producer side. Returns the value when the queue is full.
    #[inline]
    pub fn push(&self, value: T) -> Result<(), T> {
        let tail = self.tail.0.load(Ordering::Relaxed);
        let head = self.head.0.load(Ordering::Acquire);

        if tail.wrapping_sub(head) == self.capacity() {
            return Err(value);
        }

        unsafe {
            (*self.slots[tail & self.mask].get()).as_mut_ptr().write(value);
        }

        self.tail.0.store(tail.wrapping_add(1), Ordering::Release);
        Ok(())
    }

    /// Consumer side.
    #[inline]
    pub fn pop(&self) -> Option<T> {
        let head = self.head.0.load(Ordering::Relaxed);
        let tail = self.tail.0.load(Ordering::Acquire);

        if head == tail {
            return None;
        }

        let value = unsafe { (*self.slots[head & self.mask].get()).as_ptr().read() };

        self.head.0.store(head.wrapping_add(1), Ordering::Release);
        Some(value)
    }

    /// Consumer side. Drains up to `max` items into `out`, returning the
    /// number of items moved.
    pub fn pop_batch(&self, out: &mut Vec<T>, max: usize) -> usize {
        let mut count = 0;

        while count < max {
            match self.pop() {
                Some(value) => {
                    out.push(value);
                    count += 1;
                }
                None => break,
            }
        }

        count
    }
}

impl<T> Drop for SpscQueue<T> {
    fn drop(&mut self) {
        while self.pop().is_some() {}
    }
}

struct Slot<T> {
    published: AtomicBool,
    value: UnsafeCell<MaybeUninit<T>>,
}

/// A bounded multi-producer single-consumer queue.
///
/// Producers reserve a slot with a fetch-add on the tail and roll the
/// reservation back with a fetch-sub when the ring is full. A slot becomes
/// visible to the consumer only once its published flag is set with release
/// ordering; an unpublished slot at the head makes the queue observe as
/// empty until the producer finishes writing.
pub struct MpscQueue<T> {
    mask: usize,
    slots: Box<[Slot<T>]>,
    head: CacheAligned<AtomicUsize>,
    tail: CacheAligned<AtomicUsize>,
}

unsafe impl<T: Send> Send for MpscQueue<T> {}
unsafe impl<T: Send> Sync for MpscQueue<T> {}

impl<T> MpscQueue<T> {
    pub fn new(capacity: usize) -> MpscQueue<T> {
        if capacity == 0 || !capacity.is_power_of_two() {
            panic!("Queue capacity must be a power of two, got {}", capacity);
        }

        let slots = (0..capacity)
            .map(|_| Slot {
                published: AtomicBool::new(false),
                value: UnsafeCell::new(MaybeUninit::uninit()),
            })
            .collect::<Vec<_>>()
            .into_boxed_slice();

        MpscQueue {
            mask: capacity - 1,
            slots,
            head: CacheAligned(AtomicUsize::new(0)),
            tail: CacheAligned(AtomicUsize::new(0)),
        }
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.mask + 1
    }

    /// Number of reserved slots. Approximate: a producer mid-rollback can be
    /// counted for a moment.
    #[inline]
    pub fn len(&self) -> usize {
        let tail = self.tail.0.load(Ordering::Acquire);
        let head = self.head.0.load(Ordering::Acquire);
        tail.wrapping_sub(head)
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Producer side, callable from any thread. Returns the value when the
    /// ring is full.
    pub fn push(&self, value: T) -> Result<(), T> {
        let pos = self.tail.0.fetch_add(1, Ordering::AcqRel);
        let head = self.head.0.load(Ordering::Acquire);

        if pos.wrapping_sub(head) >= self.capacity() {
            self.tail.0.fetch_sub(1, Ordering::AcqRel);
            return Err(value);
        }

        let slot = &self.slots[pos & self.mask];

        unsafe {
            (*slot.value.get()).as_mut_ptr().write(value);
        }

        slot.published.store(true, Ordering::Release);
        Ok(())
    }

    /// Consumer side. An unpublished head slot is observed as empty.
    pub fn pop(&self) -> Option<T> {
        let head = self.head.0.load(Ordering::Relaxed);
        let slot = &self.slots[head & self.mask];

        if !slot.published.load(Ordering::Acquire) {
            return None;
        }

        let value = unsafe { (*slot.value.get()).as_ptr().read() };

        slot.published.store(false, Ordering::Release);
        self.head.0.store(head.wrapping_add(1), Ordering::Release);
        Some(value)
    }

    /// Consumer side. Drains up to `max` contiguous published slots.
    pub fn pop_batch(&self, out: &mut Vec<T>, max: usize) -> usize {
        let mut count = 0;

        while count < max {
            match self.pop() {
                Some(value) => {
                    out.push(value);
                    count += 1;
                }
                None => break,
            }
        }

        count
    }
}

impl<T> Drop for MpscQueue<T> {
    fn drop(&mut self) {
        while self.pop().is_some() {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_spsc_roundtrip() {
        let queue = SpscQueue::new(4);

        assert!(queue.push(1).is_ok());
        assert!(queue.push(2).is_ok());
        assert!(queue.push(3).is_ok());
        assert!(queue.push(4).is_ok());

        // Full: the value comes back
        assert_eq!(queue.push(5), Err(5));
        assert_eq!(queue.len(), 4);

        assert_eq!(queue.pop(), Some(1));
        assert_eq!(queue.pop(), Some(2));

        assert!(queue.push(5).is_ok());

        assert_eq!(queue.pop(), Some(3));
        assert_eq!(queue.pop(), Some(4));
        assert_eq!(queue.pop(), Some(5));
        assert_eq!(queue.pop(), None);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_spsc_pop_batch() {
        let queue = SpscQueue::new(8);

        for i in 0..6 {
            queue.push(i).unwrap();
        }

        let mut out = Vec::new();
        assert_eq!(queue.pop_batch(&mut out, 4), 4);
        assert_eq!(out, vec![0, 1, 2, 3]);

        assert_eq!(queue.pop_batch(&mut out, 4), 2);
        assert_eq!(out, vec![0, 1, 2, 3, 4, 5]);

        assert_eq!(queue.pop_batch(&mut out, 4), 0);
    }

    #[test]
    #[should_panic(expected = "power of two")]
    fn test_spsc_capacity_must_be_power_of_two() {
        let _ = SpscQueue::<u32>::new(100);
    }

    #[test]
    fn test_spsc_threaded_order() {
        let queue = Arc::new(SpscQueue::new(64));
        let producer_queue = queue.clone();

        let producer = thread::spawn(move || {
            for i in 0..10_000u64 {
                loop {
                    if producer_queue.push(i).is_ok() {
                        break;
                    }
                    thread::yield_now();
                }
            }
        });

        let mut expected = 0u64;
        while expected < 10_000 {
            if let Some(value) = queue.pop() {
                assert_eq!(value, expected);
                expected += 1;
            } else {
                thread::yield_now();
            }
        }

        producer.join().unwrap();
        assert!(queue.is_empty());
    }

    #[test]
    fn test_mpsc_roundtrip() {
        let queue = MpscQueue::new(4);

        assert!(queue.push(1).is_ok());
        assert!(queue.push(2).is_ok());
        assert!(queue.push(3).is_ok());
        assert!(queue.push(4).is_ok());
        assert_eq!(queue.push(5), Err(5));

        assert_eq!(queue.pop(), Some(1));
        assert!(queue.push(5).is_ok());

        assert_eq!(queue.pop(), Some(2));
        assert_eq!(queue.pop(), Some(3));
        assert_eq!(queue.pop(), Some(4));
        assert_eq!(queue.pop(), Some(5));
        assert_eq!(queue.pop(), None);
    }

    #[test]
    fn test_mpsc_full_rollback_restores_capacity() {
        let queue = MpscQueue::new(4);

        for i in 0..4 {
            queue.push(i).unwrap();
        }

        // Failed pushes must not consume reservations permanently.
        for _ in 0..16 {
            assert!(queue.push(99).is_err());
        }

        for i in 0..4 {
            assert_eq!(queue.pop(), Some(i));
        }

        for i in 0..4 {
            assert!(queue.push(i).is_ok());
        }
        assert_eq!(queue.len(), 4);
    }

    #[test]
    fn test_mpsc_multi_producer() {
        const PRODUCERS: usize = 4;
        const PER_PRODUCER: usize = 5_000;

        let queue = Arc::new(MpscQueue::new(128));

        let handles: Vec<_> = (0..PRODUCERS)
            .map(|p| {
                let queue = queue.clone();
                thread::spawn(move || {
                    for i in 0..PER_PRODUCER {
                        let value = (p * PER_PRODUCER + i) as u64;
                        loop {
                            if queue.push(value).is_ok() {
                                break;
                            }
                            thread::yield_now();
                        }
                    }
                })
            })
            .collect();

        let mut seen = vec![false; PRODUCERS * PER_PRODUCER];
        let mut count = 0;
        let mut out = Vec::with_capacity(64);

        while count < PRODUCERS * PER_PRODUCER {
            out.clear();
            if queue.pop_batch(&mut out, 64) == 0 {
                thread::yield_now();
                continue;
            }

            for &value in &out {
                assert!(!seen[value as usize], "duplicate value {}", value);
                seen[value as usize] = true;
                count += 1;
            }
        }

        for handle in handles {
            handle.join().unwrap();
        }

        assert!(queue.pop().is_none());
        assert!(seen.iter().all(|&s| s));
    }

    #[test]
    fn test_mpsc_drop_releases_queued_values() {
        let queue = MpscQueue::new(8);

        let value = Arc::new(0u64);
        queue.push(value.clone()).unwrap();
        queue.push(value.clone()).unwrap();

        assert_eq!(Arc::strong_count(&value), 3);
        drop(queue);
        assert_eq!(Arc::strong_count(&value), 1);
    }
}
