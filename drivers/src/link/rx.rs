//! DMA receive ring.
//!
//! The DMA engine writes bytes; the ISR only moves `write_idx` and grows
//! `unread`. Task-level code reads behind `read_idx` and shrinks `unread`
//! once it has consumed bytes, in two phases (peek, then acknowledge) so a
//! framer can look at an incomplete frame without losing it.

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::cell::UnsafeCell;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicUsize, Ordering};

use common::sync::{IrqCell, IrqControl};

use super::error::LinkError;

/// Outcome of one DMA progress notification.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) struct RxProgress {
    pub received: usize,
    pub overflowed: bool,
}

pub(crate) struct RxRing<I: IrqControl> {
    buf: Box<[UnsafeCell<u8>]>,
    write_idx: AtomicUsize,
    read_idx: AtomicUsize,
    unread: IrqCell<I>,
}

// SAFETY: the DMA engine only writes at or after `write_idx`, task code only
// reads the `unread` bytes behind it; indices are atomics.
unsafe impl<I: IrqControl> Sync for RxRing<I> {}
unsafe impl<I: IrqControl> Send for RxRing<I> {}

impl<I: IrqControl> RxRing<I> {
    pub fn new(size: usize) -> Self {
        let buf: Vec<UnsafeCell<u8>> = (0..size).map(|_| UnsafeCell::new(0)).collect();
        Self {
            buf: buf.into_boxed_slice(),
            write_idx: AtomicUsize::new(0),
            read_idx: AtomicUsize::new(0),
            unread: IrqCell::new(0),
        }
    }

    pub fn size(&self) -> usize {
        self.buf.len()
    }

    pub fn unread(&self) -> usize {
        self.unread.get()
    }

    pub fn write_idx(&self) -> usize {
        self.write_idx.load(Ordering::Acquire)
    }

    pub fn read_idx(&self) -> usize {
        self.read_idx.load(Ordering::Acquire)
    }

    /// Buffer handed to the DMA engine.
    pub fn dma_target(&self) -> (NonNull<u8>, usize) {
        let ptr = UnsafeCell::raw_get(self.buf.as_ptr());
        // A boxed slice pointer is never null, even when empty.
        (NonNull::new(ptr).unwrap_or(NonNull::dangling()), self.buf.len())
    }

    /// ISR: the DMA write position moved to `fifo_idx`.
    ///
    /// `fifo_idx == size` means the engine reached the end of the ring and
    /// wraps to 0. An overflow clamps `unread` to the ring size.
    pub fn on_dma_progress(&self, fifo_idx: usize) -> Result<RxProgress, LinkError> {
        let size = self.size();
        if fifo_idx > size || size == 0 {
            return Err(LinkError::InvalidFifoIndex);
        }

        let write = self.write_idx.load(Ordering::Relaxed);
        let received = if fifo_idx >= write {
            fifo_idx - write
        } else {
            size - write + fifo_idx
        };
        if received == 0 {
            return Ok(RxProgress {
                received,
                overflowed: false,
            });
        }

        self.write_idx
            .store((write + received) % size, Ordering::Release);

        let mut overflowed = false;
        self.unread.update(|unread| {
            let total = unread + received;
            overflowed = total > size;
            total.min(size)
        });

        Ok(RxProgress {
            received,
            overflowed,
        })
    }

    /// Copy up to `out.len()` unread bytes without consuming them.
    pub fn peek(&self, out: &mut [u8]) -> usize {
        let size = self.size();
        let count = out.len().min(self.unread());
        if count == 0 {
            return 0;
        }

        let read = self.read_idx();
        let first = count.min(size - read);
        self.copy_out(read, &mut out[..first]);
        self.copy_out(0, &mut out[first..count]);
        count
    }

    /// Hand the unread bytes up to the end of the ring to `f`, without copying.
    ///
    /// Bytes past the wrap point are seen on the next call after
    /// acknowledging these.
    pub fn peek_contiguous<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        let read = self.read_idx();
        let count = self.unread().min(self.size() - read);
        if count == 0 {
            return f(&[]);
        }

        // SAFETY: `count` unread bytes from `read` belong to the consumer; the
        // DMA engine does not write there until they are acknowledged.
        let bytes = unsafe {
            core::slice::from_raw_parts(UnsafeCell::raw_get(self.buf.as_ptr().add(read)), count)
        };
        f(bytes)
    }

    /// Consume `amount` bytes: advance `read_idx` and shrink `unread`.
    pub fn update_read_head(&self, amount: usize) -> Result<(), LinkError> {
        if amount == 0 {
            return Ok(());
        }

        self.unread.try_update(|unread| {
            unread
                .checked_sub(amount)
                .ok_or(LinkError::OverConsumed)
        })?;

        let read = self.read_idx.load(Ordering::Relaxed);
        self.read_idx
            .store((read + amount) % self.size(), Ordering::Release);
        Ok(())
    }

    /// Rewind to an empty ring. The receive must be stopped.
    pub fn reset(&self) {
        self.write_idx.store(0, Ordering::Release);
        self.read_idx.store(0, Ordering::Release);
        self.unread.set(0);
    }

    fn copy_out(&self, from: usize, out: &mut [u8]) {
        if out.is_empty() {
            return;
        }
        // SAFETY: callers stay inside the ring and inside the unread region.
        let src = unsafe {
            core::slice::from_raw_parts(UnsafeCell::raw_get(self.buf.as_ptr().add(from)), out.len())
        };
        out.copy_from_slice(src);
    }
}
