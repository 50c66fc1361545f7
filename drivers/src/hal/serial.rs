//! Serial Port (UART) Hardware Abstraction Layer.
//!
//! This module defines the platform-independent contract between the
//! framed serial link and a DMA-capable UART.

use core::fmt;
use core::ptr::NonNull;

use bitflags::bitflags;

/// Serial port configuration.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct SerialConfig {
    /// Baud rate in bits per second.
    pub baud_rate: u32,
    /// Number of data bits per frame.
    pub data_bits: DataBits,
    /// Parity checking mode.
    pub parity: Parity,
    /// Number of stop bits.
    pub stop_bits: StopBits,
}

impl SerialConfig {
    /// Create a standard 8N1 configuration at the specified baud rate.
    pub const fn new_8n1(baud_rate: u32) -> Self {
        Self {
            baud_rate,
            data_bits: DataBits::Eight,
            parity: Parity::None,
            stop_bits: StopBits::One,
        }
    }
}

impl Default for SerialConfig {
    /// Default configuration: 115200 baud, 8N1.
    fn default() -> Self {
        Self::new_8n1(115200)
    }
}

/// Number of data bits per frame.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum DataBits {
    Five,
    Six,
    Seven,
    Eight,
}

/// Parity mode.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Parity {
    None,
    Odd,
    Even,
}

/// Number of stop bits.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum StopBits {
    One,
    Two,
}

/// Serial port errors.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SerialError {
    /// A receive or transmit transfer is already armed.
    Busy,
    /// Zero-length or otherwise unusable transfer buffer.
    InvalidBuffer,
    /// Invalid configuration parameter.
    InvalidConfig,
}

impl fmt::Display for SerialError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SerialError::Busy => f.write_str("transfer already in progress"),
            SerialError::InvalidBuffer => f.write_str("invalid transfer buffer"),
            SerialError::InvalidConfig => f.write_str("invalid serial configuration"),
        }
    }
}

bitflags! {
    /// Receive line errors latched by the UART.
    ///
    /// Bit positions follow the PL011 receive status register.
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
    pub struct LineErrors: u8 {
        const FRAMING = 1 << 0;
        const PARITY = 1 << 1;
        const BREAK = 1 << 2;
        const OVERRUN = 1 << 3;
    }
}

/// Something the UART/DMA engine reports from its interrupt.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum DmaEvent {
    /// Receive progress: the DMA write position inside the receive buffer.
    ///
    /// Raised on idle line and when the transfer reaches the end of the
    /// buffer, in which case `fifo_idx` equals the buffer length and the
    /// engine wraps to 0.
    RxProgress { fifo_idx: usize },
    /// The armed transmit span has been sent completely.
    TxComplete,
    /// The receiver latched one or more line errors.
    LineError(LineErrors),
}

/// A UART with a circular receive DMA and a one-shot transmit DMA.
///
/// Implementations report progress either by calling the link's ISR entry
/// points from their interrupt callbacks, or by returning events from
/// [`poll_event`](Self::poll_event) when the IRQ handler services the link.
pub trait DmaSerialPort {
    /// Error type for port operations.
    type Error: fmt::Debug;

    /// Arm a circular receive into `buffer[..len]`.
    ///
    /// # Safety
    /// `buffer` must stay valid for writes of `len` bytes until
    /// [`abort_receive`](Self::abort_receive) returns or the port is dropped.
    unsafe fn start_receive(&mut self, buffer: NonNull<u8>, len: usize) -> Result<(), Self::Error>;

    /// Stop receiving. A no-op when nothing is armed.
    fn abort_receive(&mut self) -> Result<(), Self::Error>;

    /// Start sending `data[..len]`. Completion is reported once.
    ///
    /// # Safety
    /// `data` must stay valid for reads of `len` bytes until completion is
    /// reported.
    unsafe fn start_transmit(&mut self, data: NonNull<u8>, len: usize) -> Result<(), Self::Error>;

    /// Stop the armed transmit without reporting its completion. The span
    /// is released once this returns. A no-op when nothing is armed.
    fn abort_transmit(&mut self) -> Result<(), Self::Error>;

    /// Read and clear the latched receive line errors.
    fn take_line_errors(&mut self) -> LineErrors;

    /// Service the hardware once and report what happened, if anything.
    fn poll_event(&mut self) -> Option<DmaEvent> {
        None
    }
}
