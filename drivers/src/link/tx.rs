//! Transmit ring drained one contiguous span at a time.
//!
//! Producers append behind `write_idx`; the armed DMA transfer reads the span
//! starting at `read_idx`. The whole queue lives inside an `IrqSpinLock`, so
//! producers and the completion ISR never observe each other half-way.

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::cell::UnsafeCell;
use core::ptr::NonNull;

use super::error::LinkError;

pub(crate) struct TxQueue {
    buf: Box<[UnsafeCell<u8>]>,
    write_idx: usize,
    read_idx: usize,
    unsent: usize,
    num_to_send: usize,
    in_flight: bool,
}

// SAFETY: the in-flight span is only read by the DMA engine, and producers
// never write inside it; everything else is reached through `&mut self`.
unsafe impl Send for TxQueue {}

impl TxQueue {
    pub fn new(size: usize) -> Self {
        let buf: Vec<UnsafeCell<u8>> = (0..size).map(|_| UnsafeCell::new(0)).collect();
        Self {
            buf: buf.into_boxed_slice(),
            write_idx: 0,
            read_idx: 0,
            unsent: 0,
            num_to_send: 0,
            in_flight: false,
        }
    }

    pub fn size(&self) -> usize {
        self.buf.len()
    }

    /// Bytes queued, including the span in flight.
    pub fn unsent(&self) -> usize {
        self.unsent
    }

    pub fn room(&self) -> usize {
        self.size() - self.unsent
    }

    pub fn in_flight(&self) -> bool {
        self.in_flight
    }

    /// Queue exactly `len` bytes taken from `bytes`, or nothing at all.
    pub fn push(&mut self, len: usize, bytes: impl IntoIterator<Item = u8>) -> Result<(), LinkError> {
        if len > self.room() {
            return Err(LinkError::TxFull);
        }

        let size = self.size();
        let mut written = 0;
        for byte in bytes.into_iter().take(len) {
            let idx = (self.write_idx + written) % size;
            // SAFETY: free space never overlaps the in-flight span.
            unsafe { self.buf[idx].get().write(byte) };
            written += 1;
        }

        self.write_idx = (self.write_idx + written) % size;
        self.unsent += written;
        Ok(())
    }

    /// Mark the next contiguous span as in flight and return it.
    ///
    /// Returns `None` and marks the transmitter free when nothing is queued.
    pub fn next_span(&mut self) -> Option<(NonNull<u8>, usize)> {
        if self.unsent == 0 {
            self.num_to_send = 0;
            self.in_flight = false;
            return None;
        }

        self.num_to_send = self.unsent.min(self.size() - self.read_idx);
        self.in_flight = true;

        // SAFETY: `read_idx < size` while anything is queued.
        let cell = unsafe { self.buf.as_ptr().add(self.read_idx) };
        let ptr = NonNull::new(UnsafeCell::raw_get(cell))?;
        Some((ptr, self.num_to_send))
    }

    /// The in-flight span was sent: drop it from the queue.
    pub fn complete(&mut self) -> usize {
        let sent = self.num_to_send;
        self.unsent -= sent;
        self.read_idx = (self.read_idx + sent) % self.size();
        self.num_to_send = 0;
        self.in_flight = false;
        sent
    }

    /// Arming the span failed; keep its bytes queued for the next attempt.
    pub fn disarm(&mut self) {
        self.num_to_send = 0;
        self.in_flight = false;
    }
}
