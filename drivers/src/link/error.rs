use core::fmt;

use bitflags::bitflags;
use common::mem::PoolError;

use crate::hal::serial::LineErrors;

/// Serial link errors.
///
/// Exhaustion (`TxFull`) is recoverable by retrying later. Misuse
/// (`OverConsumed`, `InvalidFifoIndex`) leaves the link unchanged. Stream
/// errors (`RxOverflow`, `LineError`) are reported once the link has already
/// resynchronised, so the caller only needs to know data was lost.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum LinkError {
    /// Not enough room in the transmit ring; nothing was queued.
    TxFull,
    /// Tried to acknowledge more bytes than are unread.
    OverConsumed,
    /// The DMA reported a write position past the end of the receive ring.
    InvalidFifoIndex,
    /// The receive ring overflowed; buffered data was discarded.
    RxOverflow,
    /// The UART latched line errors; buffered data was discarded.
    LineError(LineErrors),
    /// Packet payload larger than a pool block can hold.
    PacketTooLarge,
    /// The underlying port refused an operation.
    Port,
    Pool(PoolError),
    InvalidConfig(&'static str),
}

impl fmt::Display for LinkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkError::TxFull => f.write_str("transmit buffer full"),
            LinkError::OverConsumed => f.write_str("acknowledged more bytes than unread"),
            LinkError::InvalidFifoIndex => f.write_str("DMA index outside receive buffer"),
            LinkError::RxOverflow => f.write_str("receive buffer overflowed"),
            LinkError::LineError(errors) => write!(f, "line error {:?}", errors),
            LinkError::PacketTooLarge => f.write_str("packet larger than a block"),
            LinkError::Port => f.write_str("serial port error"),
            LinkError::Pool(err) => write!(f, "block pool: {}", err),
            LinkError::InvalidConfig(msg) => write!(f, "invalid link config: {}", msg),
        }
    }
}

impl From<PoolError> for LinkError {
    fn from(err: PoolError) -> Self {
        LinkError::Pool(err)
    }
}

bitflags! {
    /// Conditions raised from interrupt context and handled at task level.
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
    pub struct LinkStatus: u8 {
        /// More bytes arrived than the receive ring holds.
        const RX_OVERFLOW = 1 << 0;
        /// The UART reported line errors.
        const LINE_ERROR = 1 << 1;
        /// The DMA reported an impossible write position.
        const RX_DESYNC = 1 << 2;
        /// Re-arming a transmission from the completion ISR failed.
        const TX_FAULT = 1 << 3;
    }
}

impl LinkStatus {
    /// Conditions after which the receive stream can no longer be trusted.
    pub const NEEDS_RESYNC: Self = Self::RX_OVERFLOW
        .union(Self::LINE_ERROR)
        .union(Self::RX_DESYNC);
}
