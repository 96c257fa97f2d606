use crate::{BUFFER_POOL_EXPAND_SIZE, LOCAL_CACHE_BATCH, LOCAL_CACHE_MAX, MAX_PACKET_SIZE};
use ember::logging::{self, Logger};
use std::cell::{RefCell, UnsafeCell};
use std::ops::{Deref, DerefMut};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::thread;

/// A fixed 2 KiB packet slot. Carries one framed packet (header included),
/// the parsed header fields and the id of the session it belongs to.
///
/// Lifetime: owned by the pool, temporarily owned by whichever component
/// holds its `BufferPtr`, and returned by the last holder exactly once. The
/// `allocated` flag turns a second release into a counted no-op.
pub struct PacketBuffer {
    data: [u8; MAX_PACKET_SIZE],
    size: u16,
    protocol_id: u16,
    session_id: u64,
    allocated: AtomicBool,
}

impl PacketBuffer {
    fn new() -> PacketBuffer {
        PacketBuffer {
            data: [0; MAX_PACKET_SIZE],
            size: 0,
            protocol_id: 0,
            session_id: 0,
            allocated: AtomicBool::new(false),
        }
    }
}

/// Raw handle to a pool buffer. `Copy` so it can travel through the pointer
/// queues; the single-owner discipline (exactly one holder at a time, one
/// release per acquire) is what makes the accessors sound.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct BufferPtr(NonNull<PacketBuffer>);

unsafe impl Send for BufferPtr {}

impl BufferPtr {
    #[inline]
    fn new(ptr: *mut PacketBuffer) -> Option<BufferPtr> {
        NonNull::new(ptr).map(BufferPtr)
    }

    #[inline]
    fn raw(&self) -> *mut PacketBuffer {
        self.0.as_ptr()
    }

    /// Total framed size, header included.
    #[inline]
    pub fn size(&self) -> usize {
        unsafe { (*self.raw()).size as usize }
    }

    #[inline]
    pub fn protocol_id(&self) -> u16 {
        unsafe { (*self.raw()).protocol_id }
    }

    #[inline]
    pub fn session_id(&self) -> u64 {
        unsafe { (*self.raw()).session_id }
    }

    #[inline]
    pub fn set_tags(&self, protocol_id: u16, session_id: u64) {
        unsafe {
            (*self.raw()).protocol_id = protocol_id;
            (*self.raw()).session_id = session_id;
        }
    }

    /// Copies a full frame into the buffer and records its size. Returns
    /// false if `src` exceeds the slot.
    #[inline]
    pub fn copy_from(&self, src: &[u8]) -> bool {
        if src.len() > MAX_PACKET_SIZE {
            return false;
        }

        unsafe {
            (&mut (*self.raw()).data)[..src.len()].copy_from_slice(src);
            (*self.raw()).size = src.len() as u16;
        }

        true
    }

    /// The framed bytes, `data[..size]`.
    #[inline]
    pub fn frame(&self) -> &[u8] {
        unsafe { &(&(*self.raw()).data)[..(*self.raw()).size as usize] }
    }

    /// The whole 2 KiB slot for in-place frame construction. Pair with
    /// `set_size` once the frame is written.
    #[allow(clippy::mut_from_ref)]
    #[inline]
    pub fn data_mut(&self) -> &mut [u8] {
        unsafe { &mut (&mut (*self.raw()).data)[..] }
    }

    #[inline]
    pub fn set_size(&self, size: usize) {
        debug_assert!(size <= MAX_PACKET_SIZE);
        unsafe { (*self.raw()).size = size as u16 }
    }
}

/// Spin-flag protected global free list. Contention on it is rare: threads
/// mostly work out of their local caches and only touch the list in batches.
struct FreeList {
    locked: AtomicBool,
    list: UnsafeCell<Vec<*mut PacketBuffer>>,
}

unsafe impl Send for FreeList {}
unsafe impl Sync for FreeList {}

impl FreeList {
    fn new() -> FreeList {
        FreeList {
            locked: AtomicBool::new(false),
            list: UnsafeCell::new(Vec::new()),
        }
    }

    #[inline]
    fn lock(&self) -> FreeGuard {
        while self.locked.swap(true, Ordering::Acquire) {
            std::hint::spin_loop();
        }
        FreeGuard { owner: self }
    }
}

struct FreeGuard<'a> {
    owner: &'a FreeList,
}

impl<'a> Deref for FreeGuard<'a> {
    type Target = Vec<*mut PacketBuffer>;

    #[inline]
    fn deref(&self) -> &Vec<*mut PacketBuffer> {
        unsafe { &*self.owner.list.get() }
    }
}

impl<'a> DerefMut for FreeGuard<'a> {
    #[inline]
    fn deref_mut(&mut self) -> &mut Vec<*mut PacketBuffer> {
        unsafe { &mut *self.owner.list.get() }
    }
}

impl<'a> Drop for FreeGuard<'a> {
    #[inline]
    fn drop(&mut self) {
        self.owner.locked.store(false, Ordering::Release);
    }
}

static POOL_IDS: AtomicUsize = AtomicUsize::new(1);

thread_local! {
    static LOCAL_CACHES: RefCell<Vec<(usize, Vec<*mut PacketBuffer>)>> = RefCell::new(Vec::new());
}

/// Pool of fixed-size packet buffers. Grows in pages that are never freed or
/// moved while the pool is alive, so the raw handles stay valid. Each thread
/// front-ends the global free list with a bounded local cache, exchanged in
/// batches.
pub struct BufferPool {
    id: usize,
    pages: Mutex<Vec<Box<[PacketBuffer]>>>,
    free: FreeList,
    total: AtomicUsize,
    used: AtomicUsize,
    max_used: AtomicUsize,
    double_releases: AtomicUsize,
    log: Logger,
}

impl BufferPool {
    /// Allocates the first page of `initial` buffers.
    pub fn new(initial: usize, log: &Logger) -> BufferPool {
        let pool = BufferPool {
            id: POOL_IDS.fetch_add(1, Ordering::Relaxed),
            pages: Mutex::new(Vec::new()),
            free: FreeList::new(),
            total: AtomicUsize::new(0),
            used: AtomicUsize::new(0),
            max_used: AtomicUsize::new(0),
            double_releases: AtomicUsize::new(0),
            log: log.new(logging::o!("module" => "pool")),
        };

        pool.expand_by(initial);
        pool
    }

    /// Takes a buffer out of the pool. The returned buffer has zeroed
    /// metadata and its allocated flag set. Returns `None` only when the
    /// pool stays empty through an expansion and five retries.
    pub fn acquire(&self) -> Option<BufferPtr> {
        let ptr = self.with_cache(|cache| {
            if let Some(ptr) = cache.pop() {
                return Some(ptr);
            }

            // Refill the cache with a batch from the global list.
            {
                let mut free = self.free.lock();
                let take = free.len().min(LOCAL_CACHE_BATCH);
                if take > 0 {
                    let at = free.len() - take;
                    cache.extend(free.drain(at..));
                }
            }

            if let Some(ptr) = cache.pop() {
                return Some(ptr);
            }

            // Exhausted: grow the pool, then retry without allocating again.
            // Other threads may be mid-push onto the free list, so an empty
            // list right after the expansion is not final.
            self.expand_by(BUFFER_POOL_EXPAND_SIZE);

            for attempt in 0..5 {
                {
                    let mut free = self.free.lock();
                    if let Some(ptr) = free.pop() {
                        return Some(ptr);
                    }
                }

                if attempt + 1 < 5 {
                    thread::yield_now();
                }
            }

            None
        })?;

        unsafe {
            let was = (*ptr).allocated.swap(true, Ordering::AcqRel);
            debug_assert!(!was, "buffer on the free path was marked allocated");
            (*ptr).size = 0;
            (*ptr).protocol_id = 0;
            (*ptr).session_id = 0;
        }

        let used = self.used.fetch_add(1, Ordering::Relaxed) + 1;
        let mut max = self.max_used.load(Ordering::Relaxed);
        while used > max {
            match self
                .max_used
                .compare_exchange_weak(max, used, Ordering::Relaxed, Ordering::Relaxed)
            {
                Ok(_) => break,
                Err(current) => max = current,
            }
        }

        BufferPtr::new(ptr)
    }

    /// Returns a buffer to the pool. A buffer that is already free is
    /// counted and otherwise ignored.
    pub fn release(&self, buf: BufferPtr) {
        let ptr = buf.raw();

        let released = unsafe {
            (*ptr)
                .allocated
                .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
        };

        if !released {
            self.double_releases.fetch_add(1, Ordering::Relaxed);
            return;
        }

        self.used.fetch_sub(1, Ordering::Relaxed);

        self.with_cache(|cache| {
            if cache.len() >= LOCAL_CACHE_MAX {
                let mut free = self.free.lock();
                let at = cache.len() - LOCAL_CACHE_BATCH;
                free.extend(cache.drain(at..));
            }

            cache.push(ptr);
        });
    }

    /// Total number of buffers across all pages.
    #[inline]
    pub fn pool_size(&self) -> usize {
        self.total.load(Ordering::Relaxed)
    }

    /// Buffers currently held by callers.
    #[inline]
    pub fn used_count(&self) -> usize {
        self.used.load(Ordering::Relaxed)
    }

    /// Free buffers. Counts the ones parked in thread caches.
    #[inline]
    pub fn free_count(&self) -> usize {
        self.pool_size() - self.used_count()
    }

    /// High-water mark of concurrently held buffers.
    #[inline]
    pub fn max_used_count(&self) -> usize {
        self.max_used.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn double_release_count(&self) -> usize {
        self.double_releases.load(Ordering::Relaxed)
    }

    /// Appends a page and pushes its buffers onto the global free list. The
    /// page mutex serializes expansions; the free list has its own lock.
    fn expand_by(&self, count: usize) {
        if count == 0 {
            return;
        }

        let mut pages = self.pages.lock().expect("Pool page list poisoned");

        let mut page = (0..count)
            .map(|_| PacketBuffer::new())
            .collect::<Vec<_>>()
            .into_boxed_slice();

        {
            let base = page.as_mut_ptr();
            let mut free = self.free.lock();
            free.reserve(count);
            for i in 0..count {
                free.push(unsafe { base.add(i) });
            }
        }

        pages.push(page);
        let total = self.total.fetch_add(count, Ordering::Relaxed) + count;

        logging::debug!(self.log, "buffer pool expanded";
                        "page_size" => count,
                        "total" => total);
    }

    fn with_cache<R>(&self, f: impl FnOnce(&mut Vec<*mut PacketBuffer>) -> R) -> R {
        LOCAL_CACHES.with(|caches| {
            let mut caches = caches.borrow_mut();

            let index = match caches.iter().position(|(id, _)| *id == self.id) {
                Some(index) => index,
                None => {
                    caches.push((self.id, Vec::with_capacity(LOCAL_CACHE_MAX)));
                    caches.len() - 1
                }
            };

            f(&mut caches[index].1)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ember::logging;

    fn pool(initial: usize) -> BufferPool {
        BufferPool::new(initial, &logging::discard())
    }

    #[test]
    fn test_acquire_release_roundtrip() {
        let pool = pool(64);

        assert_eq!(pool.pool_size(), 64);
        assert_eq!(pool.used_count(), 0);

        let buf = pool.acquire().unwrap();

        assert_eq!(pool.used_count(), 1);
        assert_eq!(pool.max_used_count(), 1);
        assert_eq!(pool.free_count(), 63);

        pool.release(buf);

        assert_eq!(pool.used_count(), 0);
        assert_eq!(pool.free_count(), 64);
        assert_eq!(pool.max_used_count(), 1);
    }

    #[test]
    fn test_acquired_buffer_has_fresh_metadata() {
        let pool = pool(64);

        let buf = pool.acquire().unwrap();
        buf.copy_from(&[1, 2, 3, 4, 5]);
        buf.set_tags(77, 1234);
        pool.release(buf);

        // The cache hands the same slot back.
        let buf = pool.acquire().unwrap();
        assert_eq!(buf.size(), 0);
        assert_eq!(buf.protocol_id(), 0);
        assert_eq!(buf.session_id(), 0);

        pool.release(buf);
    }

    #[test]
    fn test_double_release_is_counted_and_ignored() {
        let pool = pool(64);

        let buf = pool.acquire().unwrap();
        pool.release(buf);
        assert_eq!(pool.used_count(), 0);

        pool.release(buf);
        pool.release(buf);

        assert_eq!(pool.double_release_count(), 2);
        assert_eq!(pool.used_count(), 0);
        assert_eq!(pool.free_count(), 64);
    }

    #[test]
    fn test_exhaustion_expands_the_pool() {
        let pool = pool(16);

        let held: Vec<_> = (0..32).map(|_| pool.acquire().unwrap()).collect();

        assert_eq!(pool.used_count(), 32);
        assert_eq!(pool.pool_size(), 16 + BUFFER_POOL_EXPAND_SIZE);
        assert_eq!(pool.max_used_count(), 32);

        for buf in held {
            pool.release(buf);
        }

        assert_eq!(pool.used_count(), 0);
    }

    #[test]
    fn test_cache_overflow_flushes_to_global_list() {
        let pool = pool(LOCAL_CACHE_MAX * 2);

        let held: Vec<_> = (0..LOCAL_CACHE_MAX + 100)
            .map(|_| pool.acquire().unwrap())
            .collect();

        for buf in held {
            pool.release(buf);
        }

        assert_eq!(pool.used_count(), 0);
        assert_eq!(pool.free_count(), LOCAL_CACHE_MAX * 2);

        // The flushed buffers are reachable again.
        let reacquired: Vec<_> = (0..LOCAL_CACHE_MAX + 100)
            .map(|_| pool.acquire().unwrap())
            .collect();

        assert_eq!(pool.used_count(), LOCAL_CACHE_MAX + 100);

        for buf in reacquired {
            pool.release(buf);
        }
    }

    #[test]
    fn test_copy_from_rejects_oversized_frames() {
        let pool = pool(16);
        let buf = pool.acquire().unwrap();

        assert!(!buf.copy_from(&[0u8; MAX_PACKET_SIZE + 1]));
        assert!(buf.copy_from(&[0u8; MAX_PACKET_SIZE]));
        assert_eq!(buf.size(), MAX_PACKET_SIZE);

        pool.release(buf);
    }

    #[test]
    fn test_frame_roundtrip() {
        let pool = pool(16);
        let buf = pool.acquire().unwrap();

        buf.copy_from(&[9, 8, 7]);
        buf.set_tags(42, 5);

        assert_eq!(buf.frame(), &[9, 8, 7]);
        assert_eq!(buf.protocol_id(), 42);
        assert_eq!(buf.session_id(), 5);

        pool.release(buf);
    }
}
