use core::{
    cell::UnsafeCell,
    marker::PhantomData,
    sync::atomic::{AtomicBool, Ordering},
};

use super::irq::IrqControl;
use crate::arch::CurrentIrq;

/// IRQ-safe spinlock.
///
/// - Masks interrupts, then spins until acquired
/// - Restores the previous mask state on drop
///
/// On a single core a holder can never be preempted by an ISR, so an ISR
/// that takes the same lock never spins behind it. Hold times must stay as
/// short as any other critical section.
///
/// Not fair. Not reentrant.
pub struct IrqSpinLock<T, I: IrqControl = CurrentIrq> {
    locked: AtomicBool,
    data: UnsafeCell<T>,
    _irq: PhantomData<I>,
}

unsafe impl<T: Send, I: IrqControl> Send for IrqSpinLock<T, I> {}
unsafe impl<T: Send, I: IrqControl> Sync for IrqSpinLock<T, I> {}

impl<T, I: IrqControl> IrqSpinLock<T, I> {
    pub const fn new(data: T) -> Self {
        Self {
            locked: AtomicBool::new(false),
            data: UnsafeCell::new(data),
            _irq: PhantomData,
        }
    }

    /// Acquire the lock with interrupts masked.
    pub fn lock(&self) -> IrqSpinLockGuard<'_, T, I> {
        let irq_state = I::disable();

        while self
            .locked
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            core::hint::spin_loop();
        }

        IrqSpinLockGuard {
            lock: self,
            irq_state,
        }
    }

    /// Acquire the lock only if it is free right now.
    ///
    /// Interrupts are left untouched when this returns `None`.
    pub fn try_lock(&self) -> Option<IrqSpinLockGuard<'_, T, I>> {
        let irq_state = I::disable();

        if self
            .locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            Some(IrqSpinLockGuard {
                lock: self,
                irq_state,
            })
        } else {
            I::restore(irq_state);
            None
        }
    }

    /// Exclusive access without locking; the borrow proves nobody else holds it.
    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }
}

/// Guard returned by [`IrqSpinLock::lock`].
pub struct IrqSpinLockGuard<'a, T, I: IrqControl> {
    lock: &'a IrqSpinLock<T, I>,
    irq_state: I::State,
}

impl<T, I: IrqControl> core::ops::Deref for IrqSpinLockGuard<'_, T, I> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        // SAFETY: the guard owns the lock
        unsafe { &*self.lock.data.get() }
    }
}

impl<T, I: IrqControl> core::ops::DerefMut for IrqSpinLockGuard<'_, T, I> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        // SAFETY: the guard owns the lock
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T, I: IrqControl> Drop for IrqSpinLockGuard<'_, T, I> {
    fn drop(&mut self) {
        // Unlock before unmasking so a pending ISR finds the lock free.
        self.lock.locked.store(false, Ordering::Release);
        I::restore(self.irq_state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::host::HostIrq;

    #[test]
    fn try_lock_fails_while_held() {
        let lock: IrqSpinLock<u32, HostIrq> = IrqSpinLock::new(7);

        let mut guard = lock.lock();
        *guard += 1;
        assert!(lock.try_lock().is_none());
        drop(guard);

        assert_eq!(*lock.try_lock().unwrap(), 8);
    }

    #[test]
    fn threads_never_lose_updates() {
        use std::sync::Arc;

        let lock: Arc<IrqSpinLock<usize, HostIrq>> = Arc::new(IrqSpinLock::new(0));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let lock = lock.clone();
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        *lock.lock() += 1;
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(*lock.lock(), 4000);
    }
}
