//! In-memory serial port.
//!
//! Behaves like a UART with circular receive DMA: [`inject`] plays the
//! remote end, writing bytes into the armed buffer and queueing the
//! progress events the hardware would raise. Transmissions complete when
//! [`complete_transmit`] is called, optionally echoing back into the
//! receiver.
//!
//! [`inject`]: LoopbackPort::inject
//! [`complete_transmit`]: LoopbackPort::complete_transmit

use alloc::collections::VecDeque;
use alloc::vec::Vec;
use core::ptr::NonNull;

use crate::hal::serial::{DmaEvent, DmaSerialPort, LineErrors, SerialError};

#[derive(Debug, Copy, Clone)]
struct Transfer {
    ptr: NonNull<u8>,
    len: usize,
}

#[derive(Debug, Default)]
pub struct LoopbackPort {
    rx: Option<Transfer>,
    dma_pos: usize,
    tx: Option<Transfer>,
    sent: Vec<u8>,
    echo: bool,
    events: VecDeque<DmaEvent>,
    line_errors: LineErrors,
}

// SAFETY: the transfer pointers are only dereferenced through `&mut self`,
// under the contracts of `start_receive` and `start_transmit`.
unsafe impl Send for LoopbackPort {}

impl LoopbackPort {
    pub fn new() -> Self {
        Self::default()
    }

    /// A port whose transmissions arrive back at its own receiver.
    pub fn echo() -> Self {
        Self {
            echo: true,
            ..Self::default()
        }
    }

    pub fn is_receiving(&self) -> bool {
        self.rx.is_some()
    }

    pub fn is_transmitting(&self) -> bool {
        self.tx.is_some()
    }

    /// Deliver `bytes` into the receive buffer.
    ///
    /// Raises a progress event at the end of the buffer and one idle-line
    /// event after the last byte. Returns the final DMA position, or `None`
    /// when no receive is armed (the bytes are lost, as on the wire).
    pub fn inject(&mut self, bytes: &[u8]) -> Option<usize> {
        let rx = self.rx?;
        let mut pending = false;

        for &byte in bytes {
            // SAFETY: `dma_pos < rx.len` and the buffer is valid for writes
            // while the receive is armed.
            unsafe { rx.ptr.as_ptr().add(self.dma_pos).write(byte) };
            self.dma_pos += 1;
            pending = true;

            if self.dma_pos == rx.len {
                self.events.push_back(DmaEvent::RxProgress { fifo_idx: rx.len });
                self.dma_pos = 0;
                pending = false;
            }
        }

        if pending {
            self.events.push_back(DmaEvent::RxProgress {
                fifo_idx: self.dma_pos,
            });
        }
        Some(self.dma_pos)
    }

    /// Finish the armed transmission. Returns the number of bytes sent.
    pub fn complete_transmit(&mut self) -> usize {
        let Some(tx) = self.tx.take() else {
            return 0;
        };
        // SAFETY: the data stays valid until completion is reported, which
        // happens only after this copy.
        let data = unsafe { core::slice::from_raw_parts(tx.ptr.as_ptr(), tx.len) }.to_vec();

        if self.echo {
            self.inject(&data);
        }
        self.sent.extend_from_slice(&data);
        self.events.push_back(DmaEvent::TxComplete);
        tx.len
    }

    /// Everything sent so far.
    pub fn transmitted(&self) -> &[u8] {
        &self.sent
    }

    pub fn take_transmitted(&mut self) -> Vec<u8> {
        core::mem::take(&mut self.sent)
    }

    /// Latch line errors as the receiver would.
    pub fn raise_line_error(&mut self, errors: LineErrors) {
        self.line_errors |= errors;
        self.events.push_back(DmaEvent::LineError(errors));
    }

    pub fn pending_events(&self) -> usize {
        self.events.len()
    }
}

impl DmaSerialPort for LoopbackPort {
    type Error = SerialError;

    unsafe fn start_receive(&mut self, buffer: NonNull<u8>, len: usize) -> Result<(), SerialError> {
        if self.rx.is_some() {
            return Err(SerialError::Busy);
        }
        if len == 0 {
            return Err(SerialError::InvalidBuffer);
        }
        self.rx = Some(Transfer { ptr: buffer, len });
        self.dma_pos = 0;
        Ok(())
    }

    fn abort_receive(&mut self) -> Result<(), SerialError> {
        self.rx = None;
        self.dma_pos = 0;
        self.events
            .retain(|event| !matches!(event, DmaEvent::RxProgress { .. }));
        Ok(())
    }

    unsafe fn start_transmit(&mut self, data: NonNull<u8>, len: usize) -> Result<(), SerialError> {
        if self.tx.is_some() {
            return Err(SerialError::Busy);
        }
        if len == 0 {
            return Err(SerialError::InvalidBuffer);
        }
        self.tx = Some(Transfer { ptr: data, len });
        Ok(())
    }

    fn abort_transmit(&mut self) -> Result<(), SerialError> {
        self.tx = None;
        self.events
            .retain(|event| !matches!(event, DmaEvent::TxComplete));
        Ok(())
    }

    fn take_line_errors(&mut self) -> LineErrors {
        core::mem::take(&mut self.line_errors)
    }

    fn poll_event(&mut self) -> Option<DmaEvent> {
        self.events.pop_front()
    }
}
