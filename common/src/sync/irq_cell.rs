use core::{
    marker::PhantomData,
    sync::atomic::{AtomicUsize, Ordering},
};

use super::irq::IrqControl;
use crate::arch::CurrentIrq;

/// A counter or index shared between interrupt and task context.
///
/// Plain loads and stores are single atomic operations, safe from either
/// context. Read-modify-write runs inside a critical section and commits with
/// compare-exchange, so updates are never lost even on hosted targets, where
/// the software interrupt mask does not exclude other threads.
pub struct IrqCell<I: IrqControl = CurrentIrq> {
    value: AtomicUsize,
    _irq: PhantomData<I>,
}

// SAFETY: the only state is an atomic.
unsafe impl<I: IrqControl> Sync for IrqCell<I> {}
unsafe impl<I: IrqControl> Send for IrqCell<I> {}

impl<I: IrqControl> IrqCell<I> {
    pub const fn new(value: usize) -> Self {
        Self {
            value: AtomicUsize::new(value),
            _irq: PhantomData,
        }
    }

    #[inline]
    pub fn get(&self) -> usize {
        self.value.load(Ordering::Acquire)
    }

    #[inline]
    pub fn set(&self, value: usize) {
        self.value.store(value, Ordering::Release);
    }

    /// Replace the value with `f(old)` and return the new value.
    #[inline]
    pub fn update(&self, mut f: impl FnMut(usize) -> usize) -> usize {
        self.try_update(|v| Ok::<_, ()>(f(v))).unwrap_or_default()
    }

    /// Replace the value with `f(old)` unless `f` rejects it.
    ///
    /// On `Err` the value is left untouched. `f` runs again if another
    /// thread changed the value in between.
    #[inline]
    pub fn try_update<E>(
        &self,
        mut f: impl FnMut(usize) -> Result<usize, E>,
    ) -> Result<usize, E> {
        let state = I::disable();
        let mut current = self.value.load(Ordering::Acquire);
        let result = loop {
            let new = match f(current) {
                Ok(new) => new,
                Err(err) => break Err(err),
            };
            match self.value.compare_exchange_weak(
                current,
                new,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break Ok(new),
                Err(actual) => current = actual,
            }
        };
        I::restore(state);
        result
    }
}

impl<I: IrqControl> Default for IrqCell<I> {
    fn default() -> Self {
        Self::new(0)
    }
}
