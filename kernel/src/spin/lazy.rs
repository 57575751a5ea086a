use core::{
    cell::UnsafeCell,
    mem::MaybeUninit,
    ops::Deref,
    sync::atomic::{AtomicU8, Ordering},
};

const UNINIT: u8 = 0;
const RUNNING: u8 = 1;
const INIT: u8 = 2;

/// A value that is lazily initialized on first access.
pub struct Lazy<T, F = fn() -> T> {
    state: AtomicU8,
    init: UnsafeCell<MaybeUninit<F>>,
    value: UnsafeCell<MaybeUninit<T>>,
}

unsafe impl<T, F> Sync for Lazy<T, F> where T: Send + Sync {}

impl<T, F> Lazy<T, F> {
    pub const fn new(init: F) -> Self {
        Self {
            state: AtomicU8::new(UNINIT),
            init: UnsafeCell::new(MaybeUninit::new(init)),
            value: UnsafeCell::new(MaybeUninit::uninit()),
        }
    }
}

impl<T, F> Lazy<T, F>
where
    F: FnOnce() -> T,
{
    #[cold]
    fn force_slow(&self) -> &T {
        let res =
            self.state
                .compare_exchange(UNINIT, RUNNING, Ordering::Acquire, Ordering::Acquire);
        match res {
            Ok(_) => {
                // We're responsible for running the initializer.
                let init = unsafe { (*self.init.get()).assume_init_read() };
                let value = init();
                unsafe {
                    (*self.value.get()).write(value);
                }
                self.state.store(INIT, Ordering::Release);
            }
            Err(_) => {
                // Another thread is initializing. Spin until it's done.
                while self.state.load(Ordering::Acquire) != INIT {
                    core::hint::spin_loop();
                }
            }
        }
        unsafe { (*self.value.get()).assume_init_ref() }
    }

    pub fn force(&self) -> &T {
        if self.state.load(Ordering::Acquire) == INIT {
            return unsafe { (*self.value.get()).assume_init_ref() };
        }
        self.force_slow()
    }
}

impl<T, F> Deref for Lazy<T, F>
where
    F: FnOnce() -> T,
{
    type Target = T;

    fn deref(&self) -> &Self::Target {
        self.force()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn initializes_once() {
        static COUNTER: core::sync::atomic::AtomicUsize = core::sync::atomic::AtomicUsize::new(0);
        let lazy = Lazy::new(|| {
            COUNTER.fetch_add(1, Ordering::SeqCst);
            42
        });
        assert_eq!(*lazy, 42);
        assert_eq!(*lazy, 42);
        assert_eq!(COUNTER.load(Ordering::SeqCst), 1);
    }
}
