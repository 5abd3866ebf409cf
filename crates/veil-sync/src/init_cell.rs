use core::cell::UnsafeCell;
use core::hint::spin_loop;
use core::mem::MaybeUninit;
use core::sync::atomic::{AtomicU8, Ordering};

const EMPTY: u8 = 0;
const BUSY: u8 = 1;
const READY: u8 = 2;

/// A write-once cell for boot-time singletons.
///
/// The first caller of [`set_or_init`](InitCell::set_or_init) runs the
/// initializer; concurrent callers spin until the value is published.
/// There is no teardown: once set, the value lives for the rest of the
/// process, which is exactly the lifetime of an installed allocator.
///
/// A panicking initializer leaves the cell stuck in the in-progress state;
/// initializers here are infallible by construction.
pub struct InitCell<T> {
    state: AtomicU8,
    value: UnsafeCell<MaybeUninit<T>>,
}

// Safety: the value is written once before READY is published with Release,
// and only read after an Acquire load of READY.
unsafe impl<T: Sync> Sync for InitCell<T> {}
unsafe impl<T: Send> Send for InitCell<T> {}

impl<T> InitCell<T> {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            state: AtomicU8::new(EMPTY),
            value: UnsafeCell::new(MaybeUninit::uninit()),
        }
    }

    /// The stored value, or `None` before initialization completes.
    #[inline]
    pub fn get(&self) -> Option<&T> {
        if self.state.load(Ordering::Acquire) == READY {
            // Safety: READY is only published after the write completes.
            Some(unsafe { (*self.value.get()).assume_init_ref() })
        } else {
            None
        }
    }

    /// Initialize at most once; later calls return the stored value and
    /// never run `init`.
    pub fn set_or_init(&self, init: impl FnOnce() -> T) -> &T {
        if let Some(v) = self.get() {
            return v;
        }

        if self
            .state
            .compare_exchange(EMPTY, BUSY, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            unsafe {
                (*self.value.get()).write(init());
            }
            self.state.store(READY, Ordering::Release);
            // Safety: just written above.
            return unsafe { (*self.value.get()).assume_init_ref() };
        }

        while self.state.load(Ordering::Acquire) != READY {
            spin_loop();
        }
        // Safety: READY observed with Acquire.
        unsafe { (*self.value.get()).assume_init_ref() }
    }
}

impl<T> Default for InitCell<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn initializes_once() {
        let cell = InitCell::new();
        assert!(cell.get().is_none());
        assert_eq!(*cell.set_or_init(|| 42), 42);
        assert_eq!(*cell.set_or_init(|| unreachable!()), 42);
        assert_eq!(cell.get(), Some(&42));
    }

    #[test]
    fn racing_initializers_agree() {
        static CELL: InitCell<u64> = InitCell::new();
        let mut handles = Vec::new();
        for i in 0..8u64 {
            handles.push(std::thread::spawn(move || *CELL.set_or_init(|| i)));
        }
        let first = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .collect::<Vec<_>>();
        assert!(first.iter().all(|v| v == &first[0]));
    }
}
