//! Interrupt trampolines.
//!
//! Vector-table handlers are plain functions with no arguments, so they
//! reach their link through a fixed table. Each slot is bound exactly once
//! to a `'static` link and can never be rebound or cleared.

use core::fmt;

use common::sync::IrqControl;
use spin::Once;

use super::SerialLink;
use crate::hal::serial::DmaSerialPort;

/// Number of links that can be bound.
pub const MAX_PORTS: usize = 4;

/// Interrupt entry points of a link.
pub trait SerialIsr: Sync {
    /// Service the port's interrupt line.
    fn on_interrupt(&self);
    /// Receive DMA progress reported by a DMA driver callback.
    fn on_rx_event(&self, fifo_idx: usize);
    /// Transmit DMA complete reported by a DMA driver callback.
    fn on_tx_complete(&self);
}

impl<P, I> SerialIsr for SerialLink<P, I>
where
    P: DmaSerialPort + Send,
    I: IrqControl,
{
    fn on_interrupt(&self) {
        SerialLink::on_interrupt(self);
    }

    fn on_rx_event(&self, fifo_idx: usize) {
        let _ = self.rx_isr(fifo_idx);
    }

    fn on_tx_complete(&self) {
        self.tx_isr();
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum BindError {
    InvalidSlot,
    AlreadyBound,
}

impl fmt::Display for BindError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BindError::InvalidSlot => write!(f, "slot out of range (max {})", MAX_PORTS),
            BindError::AlreadyBound => f.write_str("slot already bound"),
        }
    }
}

static BINDINGS: [Once<&'static dyn SerialIsr>; MAX_PORTS] = [const { Once::new() }; MAX_PORTS];

/// Bind `link` to `slot`. Call before enabling the slot's interrupt.
pub fn register(slot: usize, link: &'static dyn SerialIsr) -> Result<(), BindError> {
    let binding = BINDINGS.get(slot).ok_or(BindError::InvalidSlot)?;

    let mut bound_now = false;
    binding.call_once(|| {
        bound_now = true;
        link
    });

    if bound_now {
        Ok(())
    } else {
        Err(BindError::AlreadyBound)
    }
}

fn bound(slot: usize) -> Option<&'static dyn SerialIsr> {
    BINDINGS.get(slot).and_then(Once::get).copied()
}

/// IRQ handler body for `slot`. `false` if nothing is bound there.
pub fn dispatch(slot: usize) -> bool {
    bound(slot).map(|link| link.on_interrupt()).is_some()
}

/// Receive DMA callback for `slot`.
pub fn dispatch_rx(slot: usize, fifo_idx: usize) -> bool {
    bound(slot).map(|link| link.on_rx_event(fifo_idx)).is_some()
}

/// Transmit DMA callback for `slot`.
pub fn dispatch_tx(slot: usize) -> bool {
    bound(slot).map(|link| link.on_tx_complete()).is_some()
}
