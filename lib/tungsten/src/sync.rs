use std::cell::UnsafeCell;
use std::ops::Deref;
use std::ops::DerefMut;
use std::sync::atomic::{AtomicI64, Ordering};

/// A fail-fast threadsafe read-write cell with similar semantics to a RefCell.
/// There can be any number of readers, or a single writer. Any combination of
/// readers and writers will cause a panic.
///
/// Guards the per-socket I/O state: everything inside is only ever touched on
/// the socket's pinned I/O thread, and a violation of that discipline trips
/// the guard instead of racing.
pub struct RwCell<T> {
    item: UnsafeCell<T>,
    guard: AtomicI64,
}

impl<T> RwCell<T> {
    pub fn new(item: T) -> RwCell<T> {
        RwCell {
            item: UnsafeCell::new(item),
            guard: AtomicI64::new(0),
        }
    }

    /// Get read-only access to the cell. There can be multiple readers, but no
    /// concurrent writer.
    pub fn read(&self) -> ReadGuard<T> {
        loop {
            let value = self.guard.load(Ordering::Acquire);

            if value == -1 {
                panic!("Attempted to acquire read lock when a write lock is already in effect")
            }

            if self
                .guard
                .compare_exchange(value, value + 1, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                break ReadGuard { cell: self };
            }
        }
    }

    /// Get read-write access to the cell. Note that there can only be one
    /// writer and no readers at a time.
    pub fn write(&self) -> RwGuard<T> {
        match self
            .guard
            .compare_exchange(0, -1, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => RwGuard { cell: self },
            Err(_) => {
                panic!("Attempted to acquire a write lock while another lock is already in effect")
            }
        }
    }
}

unsafe impl<T: Send> Send for RwCell<T> {}

unsafe impl<T: Send> Sync for RwCell<T> {}

pub struct ReadGuard<'a, T> {
    cell: &'a RwCell<T>,
}

impl<'a, T> Drop for ReadGuard<'a, T> {
    #[inline]
    fn drop(&mut self) {
        self.cell.guard.fetch_sub(1, Ordering::Release);
    }
}

impl<'a, T> Deref for ReadGuard<'a, T> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &T {
        unsafe { &*self.cell.item.get() }
    }
}

pub struct RwGuard<'a, T> {
    cell: &'a RwCell<T>,
}

impl<'a, T> Drop for RwGuard<'a, T> {
    #[inline]
    fn drop(&mut self) {
        self.cell.guard.store(0, Ordering::Release);
    }
}

impl<'a, T> Deref for RwGuard<'a, T> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &T {
        unsafe { &*self.cell.item.get() }
    }
}

impl<'a, T> DerefMut for RwGuard<'a, T> {
    #[inline]
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.cell.item.get() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rwcell() {
        let lock = RwCell::new(5);

        {
            let a = lock.read();
            {
                let b = lock.read();
                {
                    let c = lock.read();

                    assert_eq!(*a, 5);
                    assert_eq!(*b, 5);
                    assert_eq!(*c, 5);
                }
            }
        }

        {
            let mut d = lock.write();

            assert_eq!(*d, 5);
            *d = 10;
            assert_eq!(*d, 10);
        }

        let e = lock.read();

        assert_eq!(*e, 10);
    }

    #[test]
    #[should_panic(expected = "write lock is already in effect")]
    fn test_rwcell_read_while_writing() {
        let lock = RwCell::new(5);

        let _w = lock.write();
        let _r = lock.read();
    }

    #[test]
    #[should_panic(expected = "another lock is already in effect")]
    fn test_rwcell_write_while_reading() {
        let lock = RwCell::new(5);

        let _r = lock.read();
        let _w = lock.write();
    }
}
