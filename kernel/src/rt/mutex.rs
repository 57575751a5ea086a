//! An async mutex. Acquiring a held lock is a suspension point; the holder
//! may await (the exec path keeps the pmap lock across filesystem reads), so
//! waiters must park instead of spinning.

use alloc::collections::VecDeque;
use core::{
    cell::UnsafeCell,
    future::Future,
    ops::{Deref, DerefMut},
    pin::Pin,
    task::{Context, Poll, Waker},
};

use crate::spin::mutex::Mutex as SpinMutex;

pub struct Mutex<T> {
    state: SpinMutex<State>,
    cell: UnsafeCell<T>,
}

struct State {
    locked: bool,
    waiters: VecDeque<Waker>,
}

unsafe impl<T> Send for Mutex<T> where T: Send {}
unsafe impl<T> Sync for Mutex<T> where T: Send {}

impl<T> Mutex<T> {
    pub const fn new(value: T) -> Self {
        Self {
            state: SpinMutex::new(State {
                locked: false,
                waiters: VecDeque::new(),
            }),
            cell: UnsafeCell::new(value),
        }
    }

    pub fn try_lock(&self) -> Option<MutexGuard<'_, T>> {
        let mut state = self.state.lock();
        if state.locked {
            return None;
        }
        state.locked = true;
        Some(MutexGuard { mutex: self })
    }

    pub fn lock(&self) -> LockFuture<'_, T> {
        LockFuture { mutex: self }
    }

    pub fn get_mut(&mut self) -> &mut T {
        self.cell.get_mut()
    }
}

pub struct LockFuture<'a, T> {
    mutex: &'a Mutex<T>,
}

impl<'a, T> Future for LockFuture<'a, T> {
    type Output = MutexGuard<'a, T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut state = self.mutex.state.lock();
        if !state.locked {
            state.locked = true;
            return Poll::Ready(MutexGuard { mutex: self.mutex });
        }

        // Park. The previous holder wakes exactly one waiter, so a stale
        // registration from an earlier poll is harmless: the waker is cloned
        // per poll and duplicate wakes only cause a re-check.
        state.waiters.push_back(cx.waker().clone());
        Poll::Pending
    }
}

pub struct MutexGuard<'a, T> {
    mutex: &'a Mutex<T>,
}

impl<T> Deref for MutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        unsafe {
            // SAFETY: The existence of this guard implies that the mutex has
            // been acquired.
            &*self.mutex.cell.get()
        }
    }
}

impl<T> DerefMut for MutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        unsafe {
            // SAFETY: The existence of this guard implies that the mutex has
            // been acquired.
            &mut *self.mutex.cell.get()
        }
    }
}

impl<T> Drop for MutexGuard<'_, T> {
    fn drop(&mut self) {
        let mut state = self.mutex.state.lock();
        state.locked = false;
        let waker = state.waiters.pop_front();
        drop(state);
        if let Some(waker) = waker {
            waker.wake();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rt::block_on;

    #[test]
    fn exclusive_access() {
        let mutex = Mutex::new(0);
        {
            let mut guard = block_on(mutex.lock());
            *guard += 1;
            assert!(mutex.try_lock().is_none());
        }
        assert_eq!(*block_on(mutex.lock()), 1);
    }
}
